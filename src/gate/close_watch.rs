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

//! Client-disconnect detection (spec.md §4.7 "Cancellation"): a passthrough
//! `AsyncRead`/`AsyncWrite` wrapper that notices when the client socket goes
//! away and trips a shared signal every in-flight `CompileTask` on that
//! connection can check or wait on.

use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::Notify;

/// Tripped once, visible forever after -- a second `/me` sub-exec on a
/// connection that disconnected mid-way through the first must still see
/// `is_closed() == true` rather than only waking whoever was already
/// waiting when the disconnect happened. `Notify::notify_waiters` alone
/// wakes only current waiters, so the flag is load-bearing, not redundant.
pub struct CloseSignal {
    flag: AtomicBool,
    notify: Notify,
}

impl CloseSignal {
    pub fn new() -> Arc<Self> {
        Arc::new(CloseSignal { flag: AtomicBool::new(false), notify: Notify::new() })
    }

    pub fn trip(&self) {
        self.flag.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Resolve immediately if already tripped, else wait for `trip()`.
    pub async fn closed(&self) {
        if self.is_closed() {
            return;
        }
        self.notify.notified().await;
    }
}

/// Wraps a connection's transport, tripping `signal` the first time a read
/// returns EOF or either direction errors.
pub struct NotifyOnClose<S> {
    inner: S,
    signal: Arc<CloseSignal>,
}

impl<S> NotifyOnClose<S> {
    pub fn new(inner: S, signal: Arc<CloseSignal>) -> Self {
        NotifyOnClose { inner, signal }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for NotifyOnClose<S> {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        let result = Pin::new(&mut this.inner).poll_read(cx, buf);
        match &result {
            Poll::Ready(Ok(())) if buf.filled().len() == before => this.signal.trip(),
            Poll::Ready(Err(_)) => this.signal.trip(),
            _ => {}
        }
        result
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for NotifyOnClose<S> {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<std::io::Result<usize>> {
        let this = self.get_mut();
        let result = Pin::new(&mut this.inner).poll_write(cx, buf);
        if let Poll::Ready(Err(_)) = &result {
            this.signal.trip();
        }
        result
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        let result = Pin::new(&mut this.inner).poll_flush(cx);
        if let Poll::Ready(Err(_)) = &result {
            this.signal.trip();
        }
        result
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn closed_resolves_immediately_once_tripped() {
        let signal = CloseSignal::new();
        signal.trip();
        // Must not hang: the flag short-circuits the wait.
        signal.closed().await;
        assert!(signal.is_closed());
    }

    #[tokio::test]
    async fn eof_on_read_trips_the_signal() {
        let (mut client, server) = tokio::io::duplex(64);
        let signal = CloseSignal::new();
        let mut wrapped = NotifyOnClose::new(server, signal.clone());
        client.shutdown().await.unwrap();
        drop(client);
        let mut buf = [0u8; 16];
        let n = wrapped.read(&mut buf).await.unwrap();
        assert_eq!(n, 0);
        assert!(signal.is_closed());
    }

    #[tokio::test]
    async fn a_second_waiter_after_the_trip_still_sees_closed() {
        let signal = CloseSignal::new();
        signal.trip();
        // Simulates a second dispatch_exec() call on the same connection,
        // arriving after the disconnect was already observed once.
        tokio::time::timeout(std::time::Duration::from_millis(50), signal.closed())
            .await
            .expect("closed() must not hang for a late waiter");
    }
}
