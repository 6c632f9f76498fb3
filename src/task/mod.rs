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

//! C7 CompileTask (spec.md §4.7): the per-request state machine and its
//! backing `Task` data model (spec.md §3).
//!
//! Grounded on the teacher's `server.rs` `SccacheService::compile` request
//! handling (parse, check compiler, run, reply), generalized into the full
//! SETUP -> FILE_REQ -> FILE_RESP -> FINISHED / LOCAL_RUN state machine and
//! the cancellation and hermeticity policy the spec requires. `trace_id`
//! and the cached `summary` are a supplement grounded on goma's
//! `compile_service.h` (`ExecLog` summary string computed once and reused
//! by multiple status pages).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::OnceLock;
use std::time::Instant;

use uuid::Uuid;

use crate::blob::FileBlob;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Init,
    Setup,
    FileReq,
    FileResp,
    LocalRun,
    RemoteRun,
    Finished,
    LocalFinished,
    Aborted,
}

/// Why a task was forced to fall back at SETUP without ever trying remote
/// (spec.md §4.7 step 1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForcedFallbackReason {
    ParseFlags,
    NoRemoteCompileSupported,
    HttpDisabled,
    FailToGetCompilerInfo,
    CompilerDisabled,
    RequestedByUser,
}

#[derive(Debug, Default)]
pub struct TaskFlags {
    pub local_cache_hit: AtomicBool,
    pub cache_hit: AtomicBool,
    pub canceled: AtomicBool,
    pub failed: AtomicBool,
    pub fail_fallback: AtomicBool,
    pub abort: AtomicBool,
}

pub struct RequesterInfo {
    pub user: String,
    pub nodename: String,
    pub build_id: String,
}

/// One compile attempt (spec.md §3 "Task").
pub struct Task {
    pub id: u64,
    pub trace_id: String,
    pub command: Vec<String>,
    pub compiler_path: String,
    pub cwd: String,
    pub requester: RequesterInfo,
    pub request_wire_size: u64,
    pub response_wire_size: std::sync::atomic::AtomicU64,
    state: std::sync::Mutex<TaskState>,
    pub flags: TaskFlags,
    pub retry_count: std::sync::atomic::AtomicU32,
    frozen_at: std::sync::Mutex<Option<Instant>>,
    created_at: Instant,
    /// Computed once on retirement and reused by every status-page render
    /// that touches a finished task; grounded on goma's lazily-built log
    /// summary string.
    summary: OnceLock<String>,
}

impl Task {
    pub fn new(id: u64, command: Vec<String>, compiler_path: String, cwd: String, requester: RequesterInfo) -> Task {
        Task {
            id,
            trace_id: Uuid::new_v4().to_string(),
            command,
            compiler_path,
            cwd,
            requester,
            request_wire_size: 0,
            response_wire_size: std::sync::atomic::AtomicU64::new(0),
            state: std::sync::Mutex::new(TaskState::Init),
            flags: TaskFlags::default(),
            retry_count: std::sync::atomic::AtomicU32::new(0),
            frozen_at: std::sync::Mutex::new(None),
            created_at: Instant::now(),
            summary: OnceLock::new(),
        }
    }

    pub fn state(&self) -> TaskState {
        *self.state.lock().unwrap()
    }

    /// Transition to `next`, freezing `frozen_at` the first time a
    /// terminal state is reached (spec.md §3 invariant: "exactly one
    /// terminal state").
    pub fn transition(&self, next: TaskState) {
        let mut state = self.state.lock().unwrap();
        *state = next;
        if is_terminal(next) {
            let mut frozen = self.frozen_at.lock().unwrap();
            if frozen.is_none() {
                *frozen = Some(Instant::now());
            }
        }
    }

    pub fn is_terminal(&self) -> bool {
        is_terminal(self.state())
    }

    pub fn handler_duration(&self) -> std::time::Duration {
        match *self.frozen_at.lock().unwrap() {
            Some(frozen) => frozen.saturating_duration_since(self.created_at),
            None => self.created_at.elapsed(),
        }
    }

    /// Build (once) and return the cached human-readable summary line.
    pub fn summary(&self) -> &str {
        self.summary.get_or_init(|| {
            format!(
                "task#{} trace={} state={:?} cmd={:?}",
                self.id,
                self.trace_id,
                self.state(),
                self.command.first().map(String::as_str).unwrap_or("?")
            )
        })
    }

    pub fn mark_canceled(&self) {
        self.flags.canceled.store(true, Ordering::SeqCst);
    }

    pub fn is_canceled(&self) -> bool {
        self.flags.canceled.load(Ordering::SeqCst)
    }
}

fn is_terminal(state: TaskState) -> bool {
    matches!(state, TaskState::Finished | TaskState::LocalFinished | TaskState::Aborted)
}

/// Outcome of the SETUP step (spec.md §4.7 step 1): either the task
/// proceeds toward a remote attempt, or it's forced to fall back locally
/// with a reason.
pub enum SetupOutcome {
    ProceedRemote,
    ForceFallback(ForcedFallbackReason),
}

/// Result of the FILE_RESP step: the downloaded, validated output blobs
/// ready to be renamed into place.
pub struct DownloadedOutputs {
    pub blobs: Vec<FileBlob>,
}

/// Decide the SETUP outcome from a parsed-arguments result and the
/// resolved compiler's disabled state (spec.md §4.7 step 1).
pub fn decide_setup(
    parsed: &crate::external::ParsedArguments,
    compiler_disabled: bool,
    hermetic_mismatch: bool,
    hermetic_mode: crate::config::HermeticMode,
) -> Result<SetupOutcome, ForcedFallbackReason> {
    use crate::external::ParsedArguments;
    match parsed {
        ParsedArguments::NotCompilation | ParsedArguments::CannotCache => {
            Err(ForcedFallbackReason::NoRemoteCompileSupported)
        }
        ParsedArguments::Ok { .. } => {
            if compiler_disabled {
                return Err(ForcedFallbackReason::CompilerDisabled);
            }
            if hermetic_mismatch {
                match hermetic_mode {
                    crate::config::HermeticMode::Error => {
                        // Fails fast without local fallback -- the caller
                        // is expected to check this case before falling
                        // back (spec.md §4.7 "Hermeticity").
                        return Err(ForcedFallbackReason::FailToGetCompilerInfo);
                    }
                    crate::config::HermeticMode::Fallback => {
                        return Ok(SetupOutcome::ForceFallback(ForcedFallbackReason::FailToGetCompilerInfo));
                    }
                    crate::config::HermeticMode::Off => {}
                }
            }
            Ok(SetupOutcome::ProceedRemote)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::external::ParsedArguments;

    #[test]
    fn task_freezes_handler_duration_on_first_terminal_transition() {
        let task = Task::new(1, vec!["cc".into()], "/usr/bin/cc".into(), "/".into(), RequesterInfo {
            user: "u".into(),
            nodename: "n".into(),
            build_id: "b".into(),
        });
        task.transition(TaskState::Setup);
        assert!(!task.is_terminal());
        task.transition(TaskState::Finished);
        assert!(task.is_terminal());
        let d1 = task.handler_duration();
        std::thread::sleep(std::time::Duration::from_millis(5));
        let d2 = task.handler_duration();
        assert_eq!(d1, d2, "handler duration must freeze once terminal");
    }

    #[test]
    fn summary_is_computed_once_and_cached() {
        let task = Task::new(2, vec!["cc".into()], "/usr/bin/cc".into(), "/".into(), RequesterInfo {
            user: "u".into(),
            nodename: "n".into(),
            build_id: "b".into(),
        });
        let s1 = task.summary().to_string();
        task.transition(TaskState::Finished);
        let s2 = task.summary().to_string();
        assert_eq!(s1, s2, "summary must not reflect state changes after first computation");
    }

    #[test]
    fn setup_forces_fallback_for_uncacheable_commands() {
        let outcome = decide_setup(&ParsedArguments::CannotCache, false, false, crate::config::HermeticMode::Off);
        assert!(matches!(outcome, Err(ForcedFallbackReason::NoRemoteCompileSupported)));
    }

    #[test]
    fn hermetic_error_mode_fails_fast_without_fallback() {
        let parsed = ParsedArguments::Ok { output_files: vec![] };
        let outcome = decide_setup(&parsed, false, true, crate::config::HermeticMode::Error);
        assert!(outcome.is_err());
    }

    #[test]
    fn hermetic_fallback_mode_falls_back_instead_of_failing() {
        let parsed = ParsedArguments::Ok { output_files: vec![] };
        let outcome = decide_setup(&parsed, false, true, crate::config::HermeticMode::Fallback);
        assert!(matches!(outcome, Ok(SetupOutcome::ForceFallback(_))));
    }
}
