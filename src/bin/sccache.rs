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

//! The client shim (spec.md "Client shim"): invoked in place of the real
//! compiler by the build system, forwards the invocation over the IPC
//! socket to the proxy, and exits with the proxy's reported exit status.
//! Falls back to running the compiler directly if the proxy is
//! unreachable, so a cold/dead daemon never blocks the build.
//!
//! Grounded on the teacher's `client.rs`/`commands.rs` request-building,
//! modernized from hyper 0.1 to hyper 1.x client primitives over a unix
//! socket.

use std::path::PathBuf;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::Request;
use hyper_util::rt::TokioIo;
use prost::Message;
use sccache_proxy::proto::ExecReq;

fn socket_path() -> PathBuf {
    std::env::var_os("SCCACHE_PROXY_SOCKET_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|| std::env::temp_dir().join("sccache-proxy.sock"))
}

async fn send_exec_req(socket: &PathBuf, req: ExecReq) -> std::io::Result<sccache_proxy::proto::ExecResp> {
    let stream = tokio::net::UnixStream::connect(socket).await?;
    let io = TokioIo::new(stream);
    let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
        .await
        .map_err(std::io::Error::other)?;
    tokio::spawn(conn);

    let mut body = Vec::new();
    req.encode(&mut body).map_err(std::io::Error::other)?;

    let http_req = Request::builder()
        .method("POST")
        .uri("/e")
        .header("Host", "sccache-proxy")
        .header("Content-Type", "binary/x-protocol-buffer")
        .body(Full::new(Bytes::from(body)))
        .map_err(std::io::Error::other)?;

    let res = sender.send_request(http_req).await.map_err(std::io::Error::other)?;
    let bytes = res.into_body().collect().await.map_err(std::io::Error::other)?.to_bytes();
    sccache_proxy::proto::ExecResp::decode(bytes).map_err(std::io::Error::other)
}

fn run_compiler_locally(command: &[String]) -> i32 {
    let Some((compiler, args)) = command.split_first() else { return 1 };
    match std::process::Command::new(compiler).args(args).status() {
        Ok(status) => status.code().unwrap_or(1),
        Err(e) => {
            eprintln!("sccache: failed to run compiler locally: {e}");
            1
        }
    }
}

fn main() {
    let command: Vec<String> = std::env::args().skip(1).collect();
    if command.is_empty() {
        eprintln!("usage: sccache <compiler> [args...]");
        std::process::exit(1);
    }

    let cwd = std::env::current_dir().map(|p| p.display().to_string()).unwrap_or_default();
    let req = ExecReq {
        trace_id: uuid::Uuid::new_v4().to_string(),
        compiler_path: command[0].clone(),
        command: command.clone(),
        cwd,
        env: std::env::vars().collect(),
        input_hash_keys: Vec::new(),
        requester_user: std::env::var("USER").unwrap_or_default(),
        requester_nodename: hostname_best_effort(),
        requester_build_id: std::env::var("SCCACHE_PROXY_BUILD_ID").unwrap_or_default(),
    };

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("failed to start async runtime");

    let socket = socket_path();
    let exit_code = match runtime.block_on(send_exec_req(&socket, req)) {
        Ok(resp) => {
            use std::io::Write;
            let _ = std::io::stdout().write_all(&resp.stdout);
            let _ = std::io::stderr().write_all(&resp.stderr);
            resp.exit_status
        }
        Err(e) => {
            eprintln!("sccache: proxy unreachable ({e}); running compiler locally");
            run_compiler_locally(&command)
        }
    };
    std::process::exit(exit_code);
}

fn hostname_best_effort() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_string())
}
