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

//! C2 Subprocess Controller (spec.md §4.2).
//!
//! Grounded on the teacher's `mock_command::CommandCreatorSync` trait (a
//! swappable spawn/wait abstraction used for testing) generalized into the
//! client/server split the spec calls for: an in-process `Controller`
//! (the "client") that enforces caps, fairness, and the no-kill list, and a
//! background task (the "server") that is the only thing that actually
//! calls `tokio::process::Command::spawn`. The two communicate over an
//! `mpsc` channel that stands in for the sibling privileged-process socket
//! pair described in spec.md §4.2/§9: the request/response shapes below
//! are exactly what would cross that socket, so swapping the channel for a
//! real IPC transport later does not change `Controller`'s API.

use std::collections::{HashMap, HashSet, VecDeque};
use std::ffi::OsString;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::{debug, warn};
use parking_lot::Mutex;
use tokio::process::Command as TokioCommand;
use tokio::sync::{mpsc, oneshot};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Weight {
    Light,
    Heavy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SubprocPriority {
    Low,
    High,
    Highest,
}

#[derive(Debug, Clone)]
pub struct SubProcReq {
    pub command: OsString,
    pub args: Vec<OsString>,
    pub cwd: Option<PathBuf>,
    pub env: Vec<(OsString, OsString)>,
    pub weight: Weight,
    pub priority: SubprocPriority,
    pub detach: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildState {
    Setup,
    Pending,
    Running,
    Finished,
    Signaled,
}

#[derive(Debug, Clone)]
pub struct SubprocResult {
    pub state: ChildState,
    pub exit_code: Option<i32>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

#[derive(Debug, Clone, Copy)]
pub struct Caps {
    pub max_subprocs: usize,
    pub max_subprocs_low_priority: usize,
    pub max_subprocs_heavy_weight: usize,
}

type SubprocId = u64;

enum ServerMessage {
    Register {
        req: SubProcReq,
        id: SubprocId,
        reply: oneshot::Sender<SubprocResult>,
    },
    RequestRun { id: SubprocId },
    Kill { id: SubprocId },
    SetCaps(Caps),
}

/// The in-process client half of the controller: the only type tasks talk
/// to. Owns no children directly; admission/fairness bookkeeping lives
/// here while actual spawning happens on the server task.
pub struct Controller {
    tx: mpsc::UnboundedSender<ServerMessage>,
    next_id: AtomicU64,
    no_kill: HashSet<String>,
}

impl Controller {
    /// Spawn the server task and return a client handle. `no_kill_list` is
    /// the operator-provided set of command basenames that are detached
    /// instead of killed (spec.md §4.2 "No-kill list").
    pub fn spawn(caps: Caps, no_kill_list: HashSet<String>) -> Arc<Controller> {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_server(rx, caps));
        Arc::new(Controller {
            tx,
            next_id: AtomicU64::new(1),
            no_kill: no_kill_list,
        })
    }

    fn basename(cmd: &OsString) -> String {
        PathBuf::from(cmd)
            .file_name()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    /// Register and run `req`, waiting for the child to reach a terminal
    /// state. A `Signaled` child is reported, not treated as a transport
    /// error -- callers must treat it as authoritative per spec.md §4.2.
    pub async fn run(&self, req: SubProcReq) -> SubprocResult {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (reply_tx, reply_rx) = oneshot::channel();
        let detach = req.detach || self.no_kill.contains(&Self::basename(&req.command));
        let mut req = req;
        req.detach = detach;
        if self
            .tx
            .send(ServerMessage::Register { req, id, reply: reply_tx })
            .is_err()
        {
            return SubprocResult {
                state: ChildState::Signaled,
                exit_code: None,
                stdout: Vec::new(),
                stderr: Vec::new(),
            };
        }
        reply_rx.await.unwrap_or(SubprocResult {
            state: ChildState::Signaled,
            exit_code: None,
            stdout: Vec::new(),
            stderr: Vec::new(),
        })
    }

    /// Bump a pending request's priority, used when the remote path gives
    /// up and a speculative local compile needs to move up the queue.
    pub fn request_run(&self, id: u64) {
        let _ = self.tx.send(ServerMessage::RequestRun { id });
    }

    /// Kill `id`. A no-op for ids on the no-kill list; those are detached
    /// at registration time instead.
    pub fn kill(&self, id: u64) {
        let _ = self.tx.send(ServerMessage::Kill { id });
    }

    pub fn set_caps(&self, caps: Caps) {
        let _ = self.tx.send(ServerMessage::SetCaps(caps));
    }
}

struct Pending {
    req: SubProcReq,
    id: SubprocId,
    reply: oneshot::Sender<SubprocResult>,
}

/// The server loop: the only place that spawns a real child process.
async fn run_server(mut rx: mpsc::UnboundedReceiver<ServerMessage>, mut caps: Caps) {
    let mut queue: VecDeque<Pending> = VecDeque::new();
    let mut running: HashMap<SubprocId, tokio::task::JoinHandle<()>> = HashMap::new();
    let mut running_heavy: usize = 0;
    let kill_signals: Arc<Mutex<HashMap<SubprocId, Arc<tokio::sync::Notify>>>> =
        Arc::new(Mutex::new(HashMap::new()));
    let (done_tx, mut done_rx) = mpsc::unbounded_channel::<(SubprocId, Weight)>();

    loop {
        tokio::select! {
            msg = rx.recv() => {
                match msg {
                    None => break,
                    Some(ServerMessage::Register { req, id, reply }) => {
                        queue.push_back(Pending { req, id, reply });
                    }
                    Some(ServerMessage::RequestRun { id }) => {
                        // Move the entry to the front of its priority band by
                        // re-sorting: stable sort keeps FIFO within a band.
                        let mut items: Vec<_> = queue.drain(..).collect();
                        if let Some(pos) = items.iter().position(|p| p.id == id) {
                            items[pos].req.priority = SubprocPriority::Highest;
                        }
                        items.sort_by(|a, b| b.req.priority.cmp(&a.req.priority));
                        queue = items.into();
                    }
                    Some(ServerMessage::Kill { id }) => {
                        if let Some(notify) = kill_signals.lock().get(&id) {
                            notify.notify_one();
                        }
                    }
                    Some(ServerMessage::SetCaps(new_caps)) => {
                        caps = new_caps;
                    }
                }
            }
            Some((id, weight)) = done_rx.recv() => {
                running.remove(&id);
                kill_signals.lock().remove(&id);
                if weight == Weight::Heavy {
                    running_heavy = running_heavy.saturating_sub(1);
                }
            }
        }

        // Admission: priority-first, FIFO within a band; a heavy slot is
        // only taken if under the heavy cap.
        let mut items: Vec<_> = queue.drain(..).collect();
        items.sort_by(|a, b| b.req.priority.cmp(&a.req.priority));
        let mut requeue = Vec::new();
        for pending in items {
            let heavy = pending.req.weight == Weight::Heavy;
            if running.len() >= caps.max_subprocs
                || (heavy && running_heavy >= caps.max_subprocs_heavy_weight)
            {
                requeue.push(pending);
                continue;
            }
            if heavy {
                running_heavy += 1;
            }
            let done_tx = done_tx.clone();
            let kill_signal = Arc::new(tokio::sync::Notify::new());
            kill_signals.lock().insert(pending.id, kill_signal.clone());
            let id = pending.id;
            let handle = tokio::spawn(run_one(pending, kill_signal, done_tx));
            running.insert(id, handle);
        }
        queue = requeue.into();
    }
}

async fn run_one(
    pending: Pending,
    kill_signal: Arc<tokio::sync::Notify>,
    done_tx: mpsc::UnboundedSender<(SubprocId, Weight)>,
) {
    let Pending { req, id, reply } = pending;
    let mut cmd = TokioCommand::new(&req.command);
    cmd.args(&req.args);
    if let Some(cwd) = &req.cwd {
        cmd.current_dir(cwd);
    }
    for (k, v) in &req.env {
        cmd.env(k, v);
    }
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());

    let weight = req.weight;
    let result = match cmd.spawn() {
        Ok(mut child) => {
            tokio::select! {
                status = child.wait_with_output() => {
                    match status {
                        Ok(output) => SubprocResult {
                            state: ChildState::Finished,
                            exit_code: output.status.code(),
                            stdout: output.stdout,
                            stderr: output.stderr,
                        },
                        Err(e) => {
                            warn!("subprocess {id} wait failed: {e}");
                            SubprocResult { state: ChildState::Signaled, exit_code: None, stdout: Vec::new(), stderr: Vec::new() }
                        }
                    }
                }
                _ = kill_signal.notified() => {
                    if req.detach {
                        debug!("subprocess {id} is on the no-kill list; detaching instead of killing");
                        // Dropping `child` here does not kill it: tokio's
                        // `Child` only kills on drop if `kill_on_drop(true)`
                        // was set, which we never do. The process keeps
                        // running, unmanaged, as the no-kill list requires.
                    } else {
                        let _ = child.start_kill();
                    }
                    SubprocResult { state: ChildState::Signaled, exit_code: None, stdout: Vec::new(), stderr: Vec::new() }
                }
            }
        }
        Err(e) => {
            warn!("failed to spawn subprocess {id}: {e}");
            SubprocResult { state: ChildState::Signaled, exit_code: None, stdout: Vec::new(), stderr: Vec::new() }
        }
    };
    let _ = reply.send(result);
    let _ = done_tx.send((id, weight));
}

impl Default for Caps {
    fn default() -> Caps {
        Caps {
            max_subprocs: 32,
            max_subprocs_low_priority: 8,
            max_subprocs_heavy_weight: 4,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn runs_a_trivial_command_and_reports_finished() {
        let controller = Controller::spawn(Caps::default(), HashSet::new());
        let req = SubProcReq {
            command: "echo".into(),
            args: vec!["hi".into()],
            cwd: None,
            env: vec![],
            weight: Weight::Light,
            priority: SubprocPriority::High,
            detach: false,
        };
        let result = controller.run(req).await;
        assert_eq!(result.state, ChildState::Finished);
        assert_eq!(result.exit_code, Some(0));
        assert_eq!(String::from_utf8_lossy(&result.stdout).trim(), "hi");
    }

    #[tokio::test]
    async fn respects_global_subprocess_cap() {
        let caps = Caps { max_subprocs: 1, ..Caps::default() };
        let controller = Controller::spawn(caps, HashSet::new());
        let mut handles = Vec::new();
        for _ in 0..5 {
            let controller = controller.clone();
            handles.push(tokio::spawn(async move {
                controller
                    .run(SubProcReq {
                        command: "true".into(),
                        args: vec![],
                        cwd: None,
                        env: vec![],
                        weight: Weight::Light,
                        priority: SubprocPriority::Low,
                        detach: false,
                    })
                    .await
            }));
        }
        for h in handles {
            let r = h.await.unwrap();
            assert_eq!(r.state, ChildState::Finished);
        }
    }

    #[tokio::test]
    async fn nonzero_exit_is_reported_not_treated_as_transport_error() {
        let controller = Controller::spawn(Caps::default(), HashSet::new());
        let result = controller
            .run(SubProcReq {
                command: "false".into(),
                args: vec![],
                cwd: None,
                env: vec![],
                weight: Weight::Light,
                priority: SubprocPriority::Low,
                detach: false,
            })
            .await;
        assert_eq!(result.state, ChildState::Finished);
        assert_eq!(result.exit_code, Some(1));
    }
}
