// Copyright 2016 Mozilla Foundation
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Error *kinds* for the proxy (spec.md §7), realized as `thiserror` enums
//! rather than the teacher's `error_chain!` macro -- same shape (one enum
//! per subsystem, `#[from]` chaining), current idiom.

use std::fmt;

/// The eight error kinds from spec.md §7. Not every subsystem produces
/// every kind; this is the classification used for `Status.err` and for
/// deciding whether a step falls back locally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    TransportTransient,
    TransportAuth,
    TransportPermanent,
    BackendReject,
    LocalCompileFailed,
    ResourceExhausted,
    ClientDisconnect,
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::TransportTransient => "transport-transient",
            ErrorKind::TransportAuth => "transport-auth",
            ErrorKind::TransportPermanent => "transport-permanent",
            ErrorKind::BackendReject => "backend-reject",
            ErrorKind::LocalCompileFailed => "local-compile-failed",
            ErrorKind::ResourceExhausted => "resource-exhausted",
            ErrorKind::ClientDisconnect => "client-disconnect",
            ErrorKind::Internal => "internal",
        };
        f.write_str(s)
    }
}

/// Every RPC call produces one of these (spec.md §7 `Status`).
#[derive(Debug, Clone)]
pub struct Status {
    pub kind: Option<ErrorKind>,
    pub err_message: String,
    pub http_response_header: Option<u16>,
    pub connect_success: bool,
    pub finished: bool,
    pub timeouts_consumed: u32,
}

impl Status {
    pub fn ok() -> Status {
        Status {
            kind: None,
            err_message: String::new(),
            http_response_header: Some(200),
            connect_success: true,
            finished: true,
            timeouts_consumed: 0,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.kind.is_none()
    }

    pub fn failed(kind: ErrorKind, message: impl Into<String>) -> Status {
        Status {
            kind: Some(kind),
            err_message: message.into(),
            http_response_header: None,
            connect_success: false,
            finished: false,
            timeouts_consumed: 0,
        }
    }

    /// Whether the rpc layer should retry this call itself (§4.5, §7
    /// TransportTransient / TransportAuth-while-oauth-valid).
    pub fn is_retryable(&self, oauth_valid: bool) -> bool {
        match self.kind {
            Some(ErrorKind::TransportTransient) => true,
            Some(ErrorKind::TransportAuth) => oauth_valid,
            _ => false,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("{0}")]
    Internal(String),
    #[error("invalid FileBlob: {0}")]
    InvalidBlob(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("subprocess error: {0}")]
    Subprocess(String),
    #[error("rpc error: {0}")]
    Rpc(String),
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),
    #[error("local compile failed with exit code {0:?}: {1}")]
    LocalCompileFailed(Option<i32>, String),
}

impl ProxyError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ProxyError::InvalidBlob(_) => ErrorKind::Internal,
            ProxyError::Internal(_) => ErrorKind::Internal,
            ProxyError::Io(_) => ErrorKind::Internal,
            ProxyError::Subprocess(_) => ErrorKind::LocalCompileFailed,
            ProxyError::Rpc(_) => ErrorKind::TransportTransient,
            ProxyError::ResourceExhausted(_) => ErrorKind::ResourceExhausted,
            ProxyError::LocalCompileFailed(..) => ErrorKind::LocalCompileFailed,
        }
    }
}

pub type Result<T> = std::result::Result<T, ProxyError>;

/// Print an `anyhow::Error`'s cause chain the way the teacher's `main.rs`
/// does with `error_chain`'s `e.iter().skip(1)`.
pub fn print_error_chain(err: &anyhow::Error) {
    eprintln!("error: {}", err);
    for cause in err.chain().skip(1) {
        eprintln!("caused by: {}", cause);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_respects_oauth_validity() {
        let s = Status::failed(ErrorKind::TransportAuth, "401");
        assert!(s.is_retryable(true));
        assert!(!s.is_retryable(false));
    }

    #[test]
    fn permanent_errors_never_retry() {
        let s = Status::failed(ErrorKind::TransportPermanent, "404");
        assert!(!s.is_retryable(true));
    }
}
