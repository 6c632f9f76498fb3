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

//! C8 Front Gate (spec.md §4.8): the IPC/HTTP boundary. Grounded on the
//! teacher's `SccacheProto`/`SccacheTransport`/`ProtobufCodec` trio (a
//! hyper-backed protobuf-over-HTTP service), modernized from
//! `tokio-proto`/`tokio-service` to `hyper` 1.x served directly over
//! whatever transport (unix socket, TCP) `hyper_util::rt::TokioIo` wraps.
//!
//! This module also drives the C7 CompileTask pipeline end to end: SETUP,
//! the FILE_REQ/FILE_RESP blob transfer through C3, the local/remote race
//! (spec.md §4.7 step 2), and client-disconnect cancellation.

pub mod close_watch;
mod recent_failures;
pub mod trust;

use std::collections::HashSet;
use std::convert::Infallible;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use log::{info, warn};
#[cfg(unix)]
use tokio::net::UnixListener;
use tokio::net::TcpListener;
use tokio::sync::watch;

use crate::blob::client::FileBlobClient;
use crate::blob::storage::Storage;
use crate::compiler_info::{CompilerInfoResolver, FingerprintKey};
use crate::config::{Config, LocalRunPreference};
use crate::errors::Result;
use crate::external::{FlagParser, IncludeProcessor};
use crate::service::{record_outcome, CompileService, ExecOutcome};
use crate::stats::CounterTable;
use crate::subprocess::{Controller, SubProcReq, SubprocPriority, Weight};
use crate::task::{self, ForcedFallbackReason, SetupOutcome, Task, TaskState};
use close_watch::{CloseSignal, NotifyOnClose};
use trust::TrustPolicy;

pub type HttpResponse = Response<Full<Bytes>>;

fn text(status: StatusCode, body: impl Into<Bytes>) -> HttpResponse {
    Response::builder().status(status).body(Full::new(body.into())).unwrap()
}

fn proto(body: Vec<u8>) -> HttpResponse {
    Response::builder()
        .status(StatusCode::OK)
        .header("Content-Type", "binary/x-protocol-buffer")
        .body(Full::new(Bytes::from(body)))
        .unwrap()
}

fn canceled_response() -> crate::proto::ExecResp {
    crate::proto::ExecResp {
        exit_status: -1,
        error: Some(crate::proto::CompileError { reason: 0, message: "task canceled".into() }),
        ..Default::default()
    }
}

/// What `run_remote_pipeline` actually produced, decoupled from what the
/// gate does about it (fall back, report canceled, or return the result).
enum RemoteOutcome {
    Success(crate::proto::ExecResp),
    Unavailable,
    Canceled,
}

/// Rank the remote pipeline's progress against a `LocalRunPreference`
/// (spec.md §4.7 step 2): true once the pipeline has reached or passed the
/// configured stage.
fn stage_reached(stage: TaskState, preference: LocalRunPreference) -> bool {
    fn rank_stage(s: TaskState) -> u8 {
        match s {
            TaskState::RemoteRun => 0,
            TaskState::FileReq => 1,
            TaskState::FileResp => 2,
            TaskState::Finished => 3,
            _ => 0,
        }
    }
    fn rank_pref(p: LocalRunPreference) -> u8 {
        match p {
            LocalRunPreference::FileReq => 1,
            LocalRunPreference::FileResp => 2,
            LocalRunPreference::Finished => 3,
        }
    }
    rank_stage(stage) >= rank_pref(preference)
}

/// Shared state every connection handler closes over: the C6 service plus
/// handles to every collaborator C7's pipeline drives (C2 subprocess
/// control, C4 compiler info, C5 remote RPC, C3 blob storage).
pub struct Gate {
    pub service: Arc<CompileService>,
    pub trust: TrustPolicy,
    resolver: Arc<CompilerInfoResolver>,
    controller: Arc<Controller>,
    rpc: Arc<crate::rpc::RpcClient>,
    storage: Arc<dyn Storage>,
    flag_parser: Arc<dyn FlagParser>,
    include_processor: Arc<dyn IncludeProcessor>,
    blob_client: Arc<FileBlobClient>,
    recent_failures: recent_failures::RecentFailures,
    config: Arc<Config>,
    admin_port: AtomicU16,
}

impl Gate {
    pub fn new(
        service: Arc<CompileService>,
        trust: TrustPolicy,
        resolver: Arc<CompilerInfoResolver>,
        controller: Arc<Controller>,
        rpc: Arc<crate::rpc::RpcClient>,
        storage: Arc<dyn Storage>,
        flag_parser: Arc<dyn FlagParser>,
        include_processor: Arc<dyn IncludeProcessor>,
        config: Arc<Config>,
    ) -> Arc<Gate> {
        let blob_client = FileBlobClient::new(storage.clone(), rpc.clone(), service.stats.clone());
        let recent_failures = recent_failures::RecentFailures::new(config.local_run_failure_ttl());
        Arc::new(Gate {
            service,
            trust,
            resolver,
            controller,
            rpc,
            storage,
            flag_parser,
            include_processor,
            blob_client,
            recent_failures,
            config,
            admin_port: AtomicU16::new(0),
        })
    }

    /// Serve the IPC transport (client shim). On Unix, a unix-domain
    /// socket at `path`; trust is the peer-credential check (spec.md §4.8
    /// "must be owned by the invoking user").
    #[cfg(unix)]
    pub async fn serve_ipc_unix(self: Arc<Self>, path: &std::path::Path) -> Result<()> {
        let _ = std::fs::remove_file(path);
        let listener = UnixListener::bind(path)?;
        info!("front gate listening on unix socket {}", path.display());
        loop {
            let (stream, _addr) = listener.accept().await?;
            if let Ok(cred) = stream.peer_cred() {
                if !self.trust.accepts_unix_peer(cred.uid()) {
                    warn!("rejecting ipc connection from untrusted uid {}", cred.uid());
                    continue;
                }
            }
            let this = self.clone();
            tokio::spawn(async move {
                this.serve_connection(stream, ConnectionKind::Ipc).await;
            });
        }
    }

    /// Serve the localhost admin HTTP transport (`/statz`, `/healthz`, …),
    /// trust-gated by CIDR allowlist (spec.md §4.8).
    pub async fn serve_admin_tcp(self: Arc<Self>, addr: std::net::SocketAddr) -> Result<u16> {
        let listener = TcpListener::bind(addr).await?;
        let bound_port = listener.local_addr()?.port();
        self.admin_port.store(bound_port, Ordering::SeqCst);
        info!("front gate admin surface listening on {}", listener.local_addr()?);
        let this = self.clone();
        tokio::spawn(async move {
            loop {
                let (stream, peer) = match listener.accept().await {
                    Ok(v) => v,
                    Err(e) => {
                        warn!("admin accept failed: {}", e);
                        continue;
                    }
                };
                if !this.trust.accepts_ip(peer.ip()) {
                    warn!("rejecting admin connection from untrusted peer {}", peer);
                    continue;
                }
                let this = this.clone();
                tokio::spawn(async move {
                    this.serve_connection(stream, ConnectionKind::Admin).await;
                });
            }
        });
        Ok(bound_port)
    }

    async fn serve_connection<S>(self: Arc<Self>, stream: S, kind: ConnectionKind)
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
    {
        let close = CloseSignal::new();
        let stream = NotifyOnClose::new(stream, close.clone());
        let io = TokioIo::new(stream);
        let this = self.clone();
        let service = hyper::service::service_fn(move |req: Request<Incoming>| {
            let this = this.clone();
            let close = close.clone();
            async move { Ok::<_, Infallible>(this.route(req, kind, &close).await) }
        });
        if let Err(e) = hyper::server::conn::http1::Builder::new()
            .serve_connection(io, service)
            .await
        {
            warn!("front gate connection error: {}", e);
        }
    }

    async fn route(self: &Arc<Self>, req: Request<Incoming>, kind: ConnectionKind, close: &Arc<CloseSignal>) -> HttpResponse {
        // Defensive XS-leak shield (spec.md §4.8): reject anything that
        // looks like browser-origin traffic on the IPC path.
        if kind == ConnectionKind::Ipc {
            if let Some(host) = req.headers().get(hyper::header::HOST).and_then(|v| v.to_str().ok()) {
                if host == "0.0.0.0" {
                    return text(StatusCode::FORBIDDEN, "rejected: suspicious Host header");
                }
            }
        }

        match (req.method(), req.uri().path()) {
            (&Method::POST, "/e") => self.handle_exec(req, close).await,
            (&Method::POST, "/me") => self.handle_multi_exec(req, close).await,
            (&Method::GET, "/statz") => self.handle_statz(req).await,
            (&Method::GET, "/healthz") => text(StatusCode::OK, "ok"),
            (&Method::GET, "/portz") => self.handle_portz(),
            (&Method::GET, "/versionz") => text(StatusCode::OK, env!("CARGO_PKG_VERSION")),
            (&Method::GET, "/errorz") if kind == ConnectionKind::Admin => self.handle_errorz(),
            (&Method::GET, "/flagz") if kind == ConnectionKind::Admin => self.handle_flagz(),
            (&Method::GET, "/logz") if kind == ConnectionKind::Admin => {
                text(StatusCode::OK, format!("{}", crate::logging::current_level()))
            }
            (&Method::POST, "/logz") if kind == ConnectionKind::Admin => self.handle_set_logz(req).await,
            (&Method::GET, "/threadz") if kind == ConnectionKind::Admin => self.handle_threadz(),
            (&Method::GET, "/contentionz") if kind == ConnectionKind::Admin => self.handle_contentionz(),
            (&Method::GET, "/compilerz") if kind == ConnectionKind::Admin => {
                text(StatusCode::OK, self.resolver.known_compilers().join("\n"))
            }
            (&Method::GET, "/compilerinfoz") if kind == ConnectionKind::Admin => {
                text(StatusCode::OK, self.resolver.dump().join("\n"))
            }
            (&Method::GET, "/includecachez") if kind == ConnectionKind::Admin => {
                text(StatusCode::OK, "include cache: no-op (NullIncludeCache)")
            }
            (&Method::GET, "/httprpcz") if kind == ConnectionKind::Admin => self.handle_httprpcz(),
            (&Method::GET, "/filecachez") if kind == ConnectionKind::Admin => text(StatusCode::OK, self.storage.describe()),
            (&Method::GET, "/") if kind == ConnectionKind::Admin => text(StatusCode::OK, INDEX_BODY),
            (&Method::POST, "/quitquitquit") if kind == ConnectionKind::Admin => {
                self.service.quit();
                text(StatusCode::OK, "draining")
            }
            (&Method::POST, "/abortabortabort") if kind == ConnectionKind::Admin => {
                warn!("abortabortabort received; exiting");
                std::process::exit(1);
            }
            _ => text(StatusCode::NOT_FOUND, "not found"),
        }
    }

    async fn handle_exec(self: &Arc<Self>, req: Request<Incoming>, close: &Arc<CloseSignal>) -> HttpResponse {
        if req
            .headers()
            .get(hyper::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            != Some("binary/x-protocol-buffer")
        {
            return text(StatusCode::BAD_REQUEST, "expected binary/x-protocol-buffer");
        }
        let body = match req.into_body().collect().await {
            Ok(b) => b.to_bytes(),
            Err(e) => return text(StatusCode::BAD_REQUEST, format!("failed to read body: {e}")),
        };
        match prost::Message::decode(body) {
            Ok(exec_req) => {
                let resp = self.dispatch_exec(exec_req, close).await;
                let mut buf = Vec::new();
                if prost::Message::encode(&resp, &mut buf).is_err() {
                    return text(StatusCode::INTERNAL_SERVER_ERROR, "failed to encode response");
                }
                proto(buf)
            }
            Err(e) => text(StatusCode::BAD_REQUEST, format!("invalid ExecReq: {e}")),
        }
    }

    async fn handle_multi_exec(self: &Arc<Self>, req: Request<Incoming>, close: &Arc<CloseSignal>) -> HttpResponse {
        let body = match req.into_body().collect().await {
            Ok(b) => b.to_bytes(),
            Err(e) => return text(StatusCode::BAD_REQUEST, format!("failed to read body: {e}")),
        };
        match prost::Message::decode::<_>(body) as std::result::Result<crate::proto::MultiExecReq, _> {
            Ok(multi) => {
                let mut resp = crate::proto::MultiExecResp::default();
                for sub in multi.req {
                    resp.resp.push(self.dispatch_exec(sub, close).await);
                }
                let mut buf = Vec::new();
                if prost::Message::encode(&resp, &mut buf).is_err() {
                    return text(StatusCode::INTERNAL_SERVER_ERROR, "failed to encode response");
                }
                proto(buf)
            }
            Err(e) => text(StatusCode::BAD_REQUEST, format!("invalid MultiExecReq: {e}")),
        }
    }

    /// Admit a single `ExecReq` and drive it through the full C7 pipeline:
    /// SETUP, then either a forced local fallback or the FILE_REQ -> remote
    /// -> FILE_RESP pipeline raced against a speculative local run
    /// (spec.md §4.7).
    async fn dispatch_exec(self: &Arc<Self>, exec_req: crate::proto::ExecReq, close: &Arc<CloseSignal>) -> crate::proto::ExecResp {
        let task = Arc::new(Task::new(
            self.service.next_id(),
            exec_req.command.clone(),
            exec_req.compiler_path.clone(),
            exec_req.cwd.clone(),
            crate::task::RequesterInfo {
                user: exec_req.requester_user.clone(),
                nodename: exec_req.requester_nodename.clone(),
                build_id: exec_req.requester_build_id.clone(),
            },
        ));
        self.service.admit(task.clone());
        task.transition(TaskState::Setup);

        if close.is_closed() {
            task.mark_canceled();
            task.transition(TaskState::Aborted);
            record_outcome(&self.service.stats, ExecOutcome::Canceled);
            self.service.retire(task.id);
            return canceled_response();
        }

        let parsed = self.flag_parser.parse(&task.command, &task.cwd);
        let output_paths: Vec<PathBuf> = match &parsed {
            crate::external::ParsedArguments::Ok { output_files } => output_files.clone(),
            _ => Vec::new(),
        };
        let path_env = exec_req.env.get("PATH").cloned().unwrap_or_default();
        let pathext_env = exec_req.env.get("PATHEXT").cloned().unwrap_or_default();
        let fingerprint = FingerprintKey::new(&task.compiler_path, &task.cwd, &path_env, &pathext_env);

        let (tx, rx) = tokio::sync::oneshot::channel();
        self.resolver.resolve(fingerprint, Box::new(move |info| {
            let _ = tx.send(info);
        }));
        let compiler_disabled = match rx.await {
            Ok(info) => info.is_disabled(),
            // The resolver dropped every waiter, e.g. during shutdown --
            // treat the compiler as unusable rather than hang the request.
            Err(_) => true,
        };

        let setup = task::decide_setup(&parsed, compiler_disabled, false, self.config.hermetic);

        let resp = match setup {
            Ok(SetupOutcome::ProceedRemote) => self.run_remote_with_race(&task, &exec_req, close, output_paths).await,
            Ok(SetupOutcome::ForceFallback(reason)) | Err(reason) => {
                debug_assert!(matches!(
                    reason,
                    ForcedFallbackReason::ParseFlags
                        | ForcedFallbackReason::NoRemoteCompileSupported
                        | ForcedFallbackReason::HttpDisabled
                        | ForcedFallbackReason::FailToGetCompilerInfo
                        | ForcedFallbackReason::CompilerDisabled
                        | ForcedFallbackReason::RequestedByUser
                ));
                self.fall_back_to_local(&task, &exec_req, false).await
            }
        };
        self.service.retire(task.id);
        resp
    }

    /// Orchestrate the remote pipeline and the local/remote race (spec.md
    /// §4.7 step 2): an input that recently failed remotely launches a
    /// speculative local run immediately; otherwise the gate waits
    /// `local_run_delay` before launching one alongside the already
    /// in-flight remote attempt. Whichever side reaches its terminal state
    /// first wins, except that the remote side is given priority once it
    /// has progressed past `local_run_preference`.
    async fn run_remote_with_race(
        self: &Arc<Self>,
        task: &Arc<Task>,
        exec_req: &crate::proto::ExecReq,
        close: &Arc<CloseSignal>,
        output_paths: Vec<PathBuf>,
    ) -> crate::proto::ExecResp {
        let key = recent_failures::input_key(&task.compiler_path, &task.cwd, &task.command);
        let speculate_now = self.config.local_run_for_failed_input && self.recent_failures.recently_failed(&key);

        task.transition(TaskState::RemoteRun);
        let (stage_tx, mut stage_rx) = watch::channel(TaskState::RemoteRun);
        let this = self.clone();
        let pipeline_task = task.clone();
        let pipeline_req = exec_req.clone();
        let pipeline_close = close.clone();
        let mut remote_handle = tokio::spawn(async move {
            this.run_remote_pipeline(&pipeline_task, &pipeline_req, output_paths, pipeline_close, stage_tx)
                .await
        });

        let mut local_handle: Option<tokio::task::JoinHandle<crate::proto::ExecResp>> = None;
        if speculate_now {
            local_handle = Some(self.spawn_speculative_local(task.clone(), exec_req.clone()));
        } else {
            let delay = self.config.local_run_delay();
            if delay > Duration::ZERO {
                tokio::select! {
                    outcome = &mut remote_handle => {
                        let succeeded = matches!(&outcome, Ok(RemoteOutcome::Success(r)) if r.exit_status == 0);
                        self.update_recent_failures(&key, succeeded);
                        return self.finalize_remote(task, exec_req, outcome).await;
                    }
                    _ = tokio::time::sleep(delay) => {
                        local_handle = Some(self.spawn_speculative_local(task.clone(), exec_req.clone()));
                    }
                }
            }
        }

        let Some(mut local_handle) = local_handle else {
            let outcome = remote_handle.await;
            let succeeded = matches!(&outcome, Ok(RemoteOutcome::Success(r)) if r.exit_status == 0);
            self.update_recent_failures(&key, succeeded);
            return self.finalize_remote(task, exec_req, outcome).await;
        };

        task.transition(TaskState::LocalRun);
        let preference = self.config.local_run_preference;
        let stage_gate = stage_rx.wait_for(move |s| stage_reached(*s, preference));
        tokio::pin!(stage_gate);

        tokio::select! {
            local_result = &mut local_handle => {
                remote_handle.abort();
                let resp = local_result.unwrap_or_else(|_| canceled_response());
                task.transition(TaskState::LocalFinished);
                let succeeded = resp.exit_status == 0;
                record_outcome(&self.service.stats, if succeeded { ExecOutcome::Success } else { ExecOutcome::Failure });
                self.update_recent_failures(&key, succeeded);
                resp
            }
            _ = &mut stage_gate => {
                // Best-effort: this only cancels the race's JoinHandle, not
                // the underlying subprocess, which `Controller::run` drives
                // on its own task independent of this one.
                local_handle.abort();
                let outcome = remote_handle.await;
                let succeeded = matches!(&outcome, Ok(RemoteOutcome::Success(r)) if r.exit_status == 0);
                self.update_recent_failures(&key, succeeded);
                self.finalize_remote(task, exec_req, outcome).await
            }
        }
    }

    fn update_recent_failures(&self, key: &str, succeeded: bool) {
        if succeeded {
            self.recent_failures.clear(key);
        } else {
            self.recent_failures.mark_failed(key);
        }
    }

    async fn finalize_remote(
        self: &Arc<Self>,
        task: &Arc<Task>,
        exec_req: &crate::proto::ExecReq,
        outcome: std::result::Result<RemoteOutcome, tokio::task::JoinError>,
    ) -> crate::proto::ExecResp {
        match outcome {
            Ok(RemoteOutcome::Success(resp)) => {
                record_outcome(&self.service.stats, ExecOutcome::Success);
                resp
            }
            Ok(RemoteOutcome::Canceled) => {
                record_outcome(&self.service.stats, ExecOutcome::Canceled);
                canceled_response()
            }
            Ok(RemoteOutcome::Unavailable) | Err(_) => self.fall_back_to_local(task, exec_req, true).await,
        }
    }

    /// Drive one remote attempt through FILE_REQ (upload inputs), the
    /// `Exec` RPC itself, and FILE_RESP (download outputs), reporting each
    /// stage transition on `stage_tx` for `run_remote_with_race`'s stage
    /// gate. Races every await point against `close` so a client
    /// disconnect cancels the pipeline rather than running it to
    /// completion for nobody (spec.md §4.7 "Cancellation").
    async fn run_remote_pipeline(
        self: &Arc<Self>,
        task: &Arc<Task>,
        exec_req: &crate::proto::ExecReq,
        output_paths: Vec<PathBuf>,
        close: Arc<CloseSignal>,
        stage_tx: watch::Sender<TaskState>,
    ) -> RemoteOutcome {
        task.transition(TaskState::FileReq);
        let _ = stage_tx.send(TaskState::FileReq);

        let inputs = match self.include_processor.resolve_inputs(&task.command, &task.cwd) {
            Ok(set) => set,
            Err(e) => {
                warn!("failed to resolve inputs for task #{}: {}", task.id, e);
                return RemoteOutcome::Unavailable;
            }
        };

        let mut req = exec_req.clone();
        if !inputs.is_empty() {
            let hash_keys = tokio::select! {
                res = self.upload_inputs(inputs) => match res {
                    Ok(h) => h,
                    Err(e) => {
                        warn!("failed to upload inputs for task #{}: {}", task.id, e);
                        return RemoteOutcome::Unavailable;
                    }
                },
                _ = close.closed() => {
                    task.mark_canceled();
                    task.transition(TaskState::Aborted);
                    return RemoteOutcome::Canceled;
                }
            };
            req.input_hash_keys = hash_keys;
        }

        let resp = tokio::select! {
            resp = self.try_remote(&req) => resp,
            _ = close.closed() => {
                task.mark_canceled();
                task.transition(TaskState::Aborted);
                return RemoteOutcome::Canceled;
            }
        };
        let Some(mut resp) = resp else { return RemoteOutcome::Unavailable };

        task.transition(TaskState::FileResp);
        let _ = stage_tx.send(TaskState::FileResp);

        if !resp.output_files.is_empty() {
            let output_files = std::mem::take(&mut resp.output_files);
            let download = tokio::select! {
                res = self.download_outputs(output_files, &output_paths) => res,
                _ = close.closed() => {
                    task.mark_canceled();
                    task.transition(TaskState::Aborted);
                    return RemoteOutcome::Canceled;
                }
            };
            if let Err(e) = download {
                warn!("failed to download outputs for task #{}: {}", task.id, e);
                return RemoteOutcome::Unavailable;
            }
        }

        task.transition(TaskState::Finished);
        let _ = stage_tx.send(TaskState::Finished);
        RemoteOutcome::Success(resp)
    }

    /// Upload every resolved input through C3, returning the hashes to
    /// embed into `ExecReq::input_hash_keys`, sorted first for
    /// deterministic upload order.
    async fn upload_inputs(self: &Arc<Self>, inputs: HashSet<PathBuf>) -> Result<Vec<String>> {
        let mut paths: Vec<PathBuf> = inputs.into_iter().collect();
        paths.sort();
        let uploads = paths.into_iter().map(|path| {
            let blob_client = self.blob_client.clone();
            async move { blob_client.upload_file(&path).await }
        });
        futures::future::try_join_all(uploads).await
    }

    /// Download each returned output blob into its positionally-paired
    /// destination path (from `ParsedArguments::Ok::output_files` --
    /// `FileBlob` carries no path of its own on the wire).
    async fn download_outputs(self: &Arc<Self>, output_files: Vec<crate::proto::FileBlob>, output_paths: &[PathBuf]) -> Result<()> {
        for (i, wire) in output_files.into_iter().enumerate() {
            let blob = crate::blob::FileBlob::from_wire(wire)?;
            let Some(path) = output_paths.get(i) else {
                warn!("no recorded output path for output blob index {}; skipping", i);
                continue;
            };
            self.blob_client.download_file(blob, path).await?;
            CounterTable::inc(&self.service.stats.num_file_rename);
        }
        Ok(())
    }

    fn spawn_speculative_local(
        self: &Arc<Self>,
        task: Arc<Task>,
        exec_req: crate::proto::ExecReq,
    ) -> tokio::task::JoinHandle<crate::proto::ExecResp> {
        let this = self.clone();
        tokio::spawn(async move {
            task.transition(TaskState::LocalRun);
            let (succeeded, resp) = this.run_local_subprocess(&task, &exec_req).await;
            if !succeeded {
                task.flags.failed.store(true, Ordering::SeqCst);
            }
            resp
        })
    }

    /// Run `task.command` locally via the subprocess controller, reserving
    /// the output budget for the captured stdout/stderr. Shared by the
    /// ordinary fail-fallback path and the speculative race path -- the
    /// race path deliberately does not touch the fail-fallback budget,
    /// since that budget is for post-remote-failure fallback, not a
    /// racing primary attempt.
    async fn run_local_subprocess(&self, task: &Task, exec_req: &crate::proto::ExecReq) -> (bool, crate::proto::ExecResp) {
        let (compiler, args) = match task.command.split_first() {
            Some((c, rest)) => (c.clone(), rest.to_vec()),
            None => (task.compiler_path.clone(), Vec::new()),
        };
        let req = SubProcReq {
            command: compiler.into(),
            args: args.into_iter().map(std::ffi::OsString::from).collect(),
            cwd: Some(std::path::PathBuf::from(&task.cwd)),
            env: exec_req
                .env
                .iter()
                .map(|(k, v)| (std::ffi::OsString::from(k.clone()), std::ffi::OsString::from(v.clone())))
                .collect(),
            weight: Weight::Heavy,
            priority: SubprocPriority::High,
            detach: false,
        };
        let result = self.controller.run(req).await;
        let succeeded = result.exit_code == Some(0);

        let output_size = (result.stdout.len() + result.stderr.len()) as u64;
        if !self.service.try_reserve_output_budget(output_size) {
            return (
                succeeded,
                crate::proto::ExecResp {
                    exit_status: -1,
                    error: Some(crate::proto::CompileError {
                        reason: 0,
                        message: "output budget exhausted".into(),
                    }),
                    ..Default::default()
                },
            );
        }
        let resp = crate::proto::ExecResp {
            exit_status: result.exit_code.unwrap_or(-1),
            stdout: result.stdout,
            stderr: result.stderr,
            ..Default::default()
        };
        self.service.release_output_budget(output_size);
        (succeeded, resp)
    }

    /// Run `task.command` locally as a forced or post-remote-failure
    /// fallback (spec.md §4.7 LOCAL_RUN). `budgeted` tracks the
    /// fail-fallback budget only when this fallback follows a failed
    /// remote attempt, not a SETUP-time forced fallback (spec.md §4.6
    /// "Fallback budget").
    async fn fall_back_to_local(&self, task: &Task, exec_req: &crate::proto::ExecReq, budgeted: bool) -> crate::proto::ExecResp {
        task.flags.fail_fallback.store(true, Ordering::SeqCst);
        let granted = !budgeted || self.service.increment_active_fail_fallback_tasks();
        if !granted {
            task.flags.failed.store(true, Ordering::SeqCst);
            task.transition(TaskState::Aborted);
            record_outcome(&self.service.stats, ExecOutcome::Failure);
            return crate::proto::ExecResp {
                exit_status: -1,
                error: Some(crate::proto::CompileError {
                    reason: 0,
                    message: "fail-fallback budget exhausted".into(),
                }),
                ..Default::default()
            };
        }

        task.transition(TaskState::LocalRun);
        let (succeeded, resp) = self.run_local_subprocess(task, exec_req).await;
        if budgeted {
            self.service.decrement_active_fail_fallback_tasks();
        }
        if !succeeded {
            task.flags.failed.store(true, Ordering::SeqCst);
        }
        task.transition(TaskState::LocalFinished);
        record_outcome(&self.service.stats, if succeeded { ExecOutcome::Success } else { ExecOutcome::Failure });
        resp
    }

    /// Attempt the remote `Exec` RPC (spec.md §4.5/§4.7). `None` means the
    /// caller should fall back locally -- either the transport exhausted
    /// its retries or the backend's response didn't decode.
    async fn try_remote(&self, exec_req: &crate::proto::ExecReq) -> Option<crate::proto::ExecResp> {
        let mut buf = Vec::new();
        if prost::Message::encode(exec_req, &mut buf).is_err() {
            return None;
        }
        let (bytes, status) = self.rpc.call("POST", "/exec", buf).await;
        if !status.is_ok() {
            return None;
        }
        let resp: crate::proto::ExecResp = prost::Message::decode(bytes.as_slice()).ok()?;
        let output_size = (resp.stdout.len() + resp.stderr.len()) as u64;
        if !self.service.try_reserve_output_budget(output_size) {
            warn!("dropping remote response: output budget exhausted");
            return None;
        }
        self.service.release_output_budget(output_size);
        Some(resp)
    }

    async fn handle_statz(&self, req: Request<Incoming>) -> HttpResponse {
        let as_json = req.uri().query().map(|q| q.contains("format=json")).unwrap_or(false);
        let dump = self.service.stats_dump();
        if as_json {
            match serde_json::to_vec(&dump) {
                Ok(bytes) => Response::builder()
                    .status(StatusCode::OK)
                    .header("Content-Type", "application/json")
                    .body(Full::new(Bytes::from(bytes)))
                    .unwrap(),
                Err(_) => text(StatusCode::INTERNAL_SERVER_ERROR, "failed to serialize stats"),
            }
        } else {
            let mut out = String::new();
            for (k, v) in &dump.counters {
                out.push_str(&format!("{} {}\n", k, v));
            }
            out.push_str(&format!("active {}\npending {}\nfinished {}\nfailed {}\nlong {}\n",
                dump.active_tasks, dump.pending_tasks, dump.finished_tasks, dump.failed_tasks, dump.long_tasks));
            text(StatusCode::OK, out)
        }
    }

    fn handle_portz(&self) -> HttpResponse {
        let msg = crate::proto::HttpPortResponse { port: self.admin_port.load(Ordering::SeqCst) as u32 };
        let mut buf = Vec::new();
        let _ = prost::Message::encode(&msg, &mut buf);
        proto(buf)
    }

    fn handle_errorz(&self) -> HttpResponse {
        let summaries = self.service.failed_task_summaries();
        if summaries.is_empty() {
            text(StatusCode::OK, "no failed tasks")
        } else {
            text(StatusCode::OK, summaries.join("\n"))
        }
    }

    fn handle_flagz(&self) -> HttpResponse {
        text(StatusCode::OK, format!("{:#?}", *self.config))
    }

    async fn handle_set_logz(&self, req: Request<Incoming>) -> HttpResponse {
        let from_query = req.uri().query().and_then(|q| {
            q.split('&').find_map(|kv| kv.strip_prefix("level=")).map(|s| s.to_string())
        });
        let level_str = match from_query {
            Some(s) => s,
            None => match req.into_body().collect().await {
                Ok(b) => String::from_utf8_lossy(&b.to_bytes()).trim().to_string(),
                Err(e) => return text(StatusCode::BAD_REQUEST, format!("failed to read body: {e}")),
            },
        };
        match level_str.parse::<log::LevelFilter>() {
            Ok(level) => {
                crate::logging::set_level(level);
                text(StatusCode::OK, format!("level set to {level}"))
            }
            Err(_) => text(StatusCode::BAD_REQUEST, format!("invalid log level: {level_str}")),
        }
    }

    fn handle_threadz(&self) -> HttpResponse {
        let available = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(0);
        text(
            StatusCode::OK,
            format!("available_parallelism {}\nscheduler_threads {}\n", available, self.config.scheduler_threads),
        )
    }

    fn handle_contentionz(&self) -> HttpResponse {
        // The ring sizes are the best available contention proxy until a
        // real lock-wait histogram exists.
        let dump = self.service.stats_dump();
        text(
            StatusCode::OK,
            format!(
                "active {}\npending {}\nfinished {}\nfailed {}\nlong {}\n",
                dump.active_tasks, dump.pending_tasks, dump.finished_tasks, dump.failed_tasks, dump.long_tasks
            ),
        )
    }

    fn handle_httprpcz(&self) -> HttpResponse {
        text(
            StatusCode::OK,
            format!(
                "backend {}\nencoding {:?}\nbursting {}\n",
                self.rpc.base_url(),
                self.rpc.current_encoding(),
                self.rpc.health.is_bursting()
            ),
        )
    }
}

const INDEX_BODY: &str = "\
/statz
/healthz
/portz
/versionz
/errorz
/flagz
/logz
/threadz
/contentionz
/compilerz
/compilerinfoz
/includecachez
/httprpcz
/filecachez
/quitquitquit
/abortabortabort
";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnectionKind {
    Ipc,
    Admin,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_response_carries_requested_status() {
        let r = text(StatusCode::NOT_FOUND, "nope");
        assert_eq!(r.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn stage_reached_ranks_pipeline_progress_against_preference() {
        assert!(!stage_reached(TaskState::RemoteRun, LocalRunPreference::FileReq));
        assert!(stage_reached(TaskState::FileReq, LocalRunPreference::FileReq));
        assert!(stage_reached(TaskState::FileResp, LocalRunPreference::FileReq));
        assert!(!stage_reached(TaskState::FileReq, LocalRunPreference::FileResp));
        assert!(stage_reached(TaskState::Finished, LocalRunPreference::Finished));
    }
}
