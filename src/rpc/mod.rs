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

//! C5 Remote RPC Client (spec.md §4.5). Grounded on the teacher's
//! `simples3::s3::Bucket` request-building (now modernized to `reqwest`,
//! see `crate::simples3::s3`) generalized into a full-featured backend
//! client: ping-gated health, retry-through-timeout-list, compression
//! negotiation, a sliding-window network-health monitor, and layered auth.

pub mod auth;
pub mod health;

use std::time::Duration;

use log::{debug, warn};
use reqwest::StatusCode;

use crate::config::Config;
use crate::errors::{ErrorKind, ProxyError, Result, Status};
use auth::AuthMethod;
use health::NetworkHealthMonitor;

/// Content negotiated on the first request, then whatever the server
/// advertises via `Accept-Encoding` thereafter (spec.md §4.5
/// "Compression"). `gzip` is preferred over `deflate`; `lzma2` is never
/// auto-enabled even if advertised.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    Identity,
    Deflate,
    Gzip,
}

impl Encoding {
    fn as_header_value(self) -> &'static str {
        match self {
            Encoding::Identity => "identity",
            Encoding::Deflate => "deflate",
            Encoding::Gzip => "gzip",
        }
    }

    /// Pick the best of what the server advertised, preferring gzip,
    /// never selecting anything outside {identity, deflate, gzip}.
    fn negotiate(advertised: &str) -> Encoding {
        if advertised.contains("gzip") {
            Encoding::Gzip
        } else if advertised.contains("deflate") {
            Encoding::Deflate
        } else {
            Encoding::Identity
        }
    }
}

pub struct RpcClient {
    http: reqwest::Client,
    base_url: String,
    timeouts: Vec<Duration>,
    ping_timeout: Duration,
    auth: AuthMethod,
    compression: parking_lot::Mutex<Encoding>,
    pub health: NetworkHealthMonitor,
}

impl RpcClient {
    pub fn new(config: &Config, auth: AuthMethod) -> Self {
        RpcClient {
            http: reqwest::Client::new(),
            base_url: config.backend_url.clone(),
            timeouts: config.timeouts(),
            ping_timeout: config.ping_timeout(),
            auth,
            compression: parking_lot::Mutex::new(Encoding::Deflate),
            health: NetworkHealthMonitor::new(config.network_error_threshold_percent, config.network_error_margin()),
        }
    }

    /// Ping the backend until it answers 200 within `ping_timeout`,
    /// retrying on connect failure, 5xx, 408, and 401-while-oauth-valid
    /// with exponential backoff (spec.md §4.5 "Ping on startup").
    pub async fn ping_until_healthy(&self) -> Result<()> {
        let deadline = tokio::time::Instant::now() + self.ping_timeout;
        let mut backoff = Duration::from_millis(100);
        loop {
            match self.send_raw("POST", "/ping", Vec::new()).await {
                Ok((status, _)) if status == StatusCode::OK => return Ok(()),
                Ok((status, _)) if self.should_retry_ping(status) => {}
                Ok((status, _)) => {
                    return Err(ProxyError::Rpc(format!("ping returned non-retryable status {}", status)));
                }
                Err(_) => {}
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(ProxyError::Rpc("ping did not succeed within the startup budget".into()));
            }
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(Duration::from_secs(5));
        }
    }

    fn should_retry_ping(&self, status: StatusCode) -> bool {
        status.is_server_error()
            || status == StatusCode::REQUEST_TIMEOUT
            || (status == StatusCode::UNAUTHORIZED && self.auth.is_oauth_valid())
    }

    /// Send one request, retrying through the configured timeout list on
    /// a [`Status`] that `is_retryable`.
    pub async fn call(&self, method: &str, path: &str, body: Vec<u8>) -> (Vec<u8>, Status) {
        let mut timeouts_consumed = 0;
        for &timeout in &self.timeouts {
            timeouts_consumed += 1;
            match tokio::time::timeout(timeout, self.send_raw(method, path, body.clone())).await {
                Ok(Ok((status, bytes))) if status.is_success() => {
                    self.health.record_success();
                    let mut ok = Status::ok();
                    ok.timeouts_consumed = timeouts_consumed;
                    return (bytes, ok);
                }
                Ok(Ok((status, _))) => {
                    let kind = classify_status(status);
                    self.health.record_error();
                    let mut s = Status::failed(kind, format!("http {}", status));
                    s.http_response_header = Some(status.as_u16());
                    s.timeouts_consumed = timeouts_consumed;
                    if !s.is_retryable(self.auth.is_oauth_valid()) {
                        return (Vec::new(), s);
                    }
                    warn!("rpc {} {} failed with {}, retrying", method, path, status);
                }
                Ok(Err(e)) => {
                    self.health.record_error();
                    let mut s = Status::failed(ErrorKind::TransportTransient, e.to_string());
                    s.timeouts_consumed = timeouts_consumed;
                    debug!("rpc {} {} transport error: {}", method, path, e);
                }
                Err(_elapsed) => {
                    self.health.record_error();
                    debug!("rpc {} {} timed out after {:?}", method, path, timeout);
                }
            }
        }
        (
            Vec::new(),
            Status::failed(ErrorKind::TransportTransient, "exhausted configured timeout list"),
        )
    }

    async fn send_raw(&self, method: &str, path: &str, body: Vec<u8>) -> reqwest::Result<(StatusCode, Vec<u8>)> {
        let url = format!("{}{}", self.base_url, path);
        let mut builder = match method {
            "GET" => self.http.get(&url),
            _ => self.http.post(&url),
        };
        builder = builder
            .header("Content-Type", "binary/x-protocol-buffer")
            .header("Accept-Encoding", self.compression.lock().as_header_value())
            .body(body);
        if let Some(header) = self.auth.authorization_header() {
            builder = builder.header("Authorization", header);
        }
        let res = builder.send().await?;
        let status = res.status();
        if let Some(advertised) = res.headers().get("accept-encoding").and_then(|v| v.to_str().ok()) {
            *self.compression.lock() = Encoding::negotiate(advertised);
        }
        let bytes = res.bytes().await?.to_vec();
        Ok((status, bytes))
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn current_encoding(&self) -> Encoding {
        *self.compression.lock()
    }
}

fn classify_status(status: StatusCode) -> ErrorKind {
    if status == StatusCode::UNAUTHORIZED {
        ErrorKind::TransportAuth
    } else if status.is_server_error() || status == StatusCode::REQUEST_TIMEOUT {
        ErrorKind::TransportTransient
    } else {
        ErrorKind::TransportPermanent
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encoding_negotiation_prefers_gzip_over_deflate() {
        assert_eq!(Encoding::negotiate("gzip, deflate"), Encoding::Gzip);
        assert_eq!(Encoding::negotiate("deflate"), Encoding::Deflate);
        assert_eq!(Encoding::negotiate("lzma2"), Encoding::Identity);
    }

    #[test]
    fn status_classification_matches_spec_kinds() {
        assert_eq!(classify_status(StatusCode::UNAUTHORIZED), ErrorKind::TransportAuth);
        assert_eq!(classify_status(StatusCode::INTERNAL_SERVER_ERROR), ErrorKind::TransportTransient);
        assert_eq!(classify_status(StatusCode::REQUEST_TIMEOUT), ErrorKind::TransportTransient);
        assert_eq!(classify_status(StatusCode::NOT_FOUND), ErrorKind::TransportPermanent);
    }
}
