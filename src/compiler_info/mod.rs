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

//! C4 Compiler-Info Resolver (spec.md §4.4). Grounded on the teacher's
//! `compiler::Compiler::new`/`get_compiler_info` cache-and-probe pair,
//! generalized into the de-duplicated waiters-map design spec.md requires:
//! a burst of concurrent lookups for the same compiler fingerprint launches
//! exactly one probe subprocess.

use std::collections::HashMap;
use std::sync::Arc;

use log::{debug, warn};
use parking_lot::Mutex;

use crate::scheduler::{Priority, Scheduler};
use crate::stats::CounterTable;
use crate::subprocess::{Controller, SubProcReq, SubprocPriority, Weight};

/// Environment variable the probe subprocess is launched with, so a
/// `gomacc`/`sccache-proxy` binary masquerading as the compiler fails
/// loudly rather than recursing into the proxy (spec.md §4.4 step 3).
pub const POISON_ENV_VAR: &str = "COMPILER_PROXY_COMPILER_INFO_PROBE";

/// `(gomacc-path, basename-with-normalization, cwd-or-".", PATH, PATHEXT)`
/// (spec.md §3 "Fingerprint key").
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FingerprintKey {
    pub compiler_path: String,
    pub basename: String,
    pub cwd: String,
    pub path_env: String,
    pub pathext_env: String,
}

impl FingerprintKey {
    pub fn new(compiler_path: &str, cwd: &str, path_env: &str, pathext_env: &str) -> Self {
        let is_absolute = std::path::Path::new(compiler_path).is_absolute();
        let basename = std::path::Path::new(compiler_path)
            .file_name()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| compiler_path.to_string());
        FingerprintKey {
            compiler_path: compiler_path.to_string(),
            basename,
            cwd: if is_absolute { ".".to_string() } else { cwd.to_string() },
            path_env: path_env.to_string(),
            pathext_env: pathext_env.to_string(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CompilerFeatures {
    pub predefined_macros: Vec<(String, String)>,
    pub target: String,
    pub include_dirs: Vec<String>,
    pub has_feature: Vec<String>,
    pub version: String,
    pub binary_hash: String,
}

#[derive(Debug, Clone)]
pub struct CompilerInfo {
    pub features: CompilerFeatures,
    pub disabled_reason: Option<String>,
}

impl CompilerInfo {
    pub fn is_disabled(&self) -> bool {
        self.disabled_reason.is_some()
    }
}

type Callback = Box<dyn FnOnce(Arc<CompilerInfo>) + Send>;

enum Entry {
    Ready(Arc<CompilerInfo>),
    Waiting(Vec<Callback>),
}

/// Probes a local compiler binary by actually spawning it. Exists as a
/// trait so tests can stub out the real `exec` call.
pub trait ProbeRunner: Send + Sync {
    fn probe(&self, key: &FingerprintKey) -> CompilerInfo;
}

/// Spawns the compiler under the poison environment and does minimal
/// output parsing; grounded on the teacher's `compiler::run_input_output`.
///
/// Runs on a plain scheduler worker thread (not inside the tokio runtime
/// itself), so it needs a `Handle` to drive the controller's async `run`.
pub struct SubprocessProbeRunner {
    pub controller: Arc<Controller>,
    pub runtime: tokio::runtime::Handle,
}

impl ProbeRunner for SubprocessProbeRunner {
    fn probe(&self, key: &FingerprintKey) -> CompilerInfo {
        let controller = self.controller.clone();
        let compiler_path = key.compiler_path.clone();
        let result = self.runtime.block_on(controller.run(SubProcReq {
            command: compiler_path.into(),
            args: vec!["-E".into(), "-dM".into(), "-".into()],
            cwd: None,
            env: vec![(POISON_ENV_VAR.into(), "true".into())],
            weight: Weight::Light,
            priority: SubprocPriority::High,
            detach: false,
        }));
        match result.state {
            crate::subprocess::ChildState::Finished if result.exit_code == Some(0) => CompilerInfo {
                features: CompilerFeatures {
                    binary_hash: hash_stdout(&result.stdout),
                    ..Default::default()
                },
                disabled_reason: None,
            },
            _ => CompilerInfo {
                features: CompilerFeatures::default(),
                disabled_reason: Some(format!(
                    "probe did not succeed: state={:?} exit_code={:?}",
                    result.state, result.exit_code
                )),
            },
        }
    }
}

fn hash_stdout(stdout: &[u8]) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(stdout);
    hex::encode(hasher.finalize())
}

/// Sub-pool name the probe is scheduled on (spec.md §4.1, §4.4).
pub const COMPILER_INFO_POOL: &str = "compiler_info";

pub struct CompilerInfoResolver {
    cache: Mutex<HashMap<FingerprintKey, Entry>>,
    scheduler: Arc<Scheduler>,
    probe_runner: Arc<dyn ProbeRunner>,
    stats: Arc<CounterTable>,
    max_compiler_disabled_tasks: u64,
}

impl CompilerInfoResolver {
    pub fn new(
        scheduler: Arc<Scheduler>,
        probe_runner: Arc<dyn ProbeRunner>,
        stats: Arc<CounterTable>,
        max_compiler_disabled_tasks: u64,
    ) -> Arc<Self> {
        Arc::new(CompilerInfoResolver {
            cache: Mutex::new(HashMap::new()),
            scheduler,
            probe_runner,
            stats,
            max_compiler_disabled_tasks,
        })
    }

    /// Resolve `key`, invoking `callback` with the shared `CompilerInfo`
    /// once available -- immediately on a cache hit, or after the probe
    /// completes on a miss. Exactly one probe subprocess runs per burst of
    /// concurrent misses for the same key (spec.md §8 invariant 7).
    pub fn resolve(self: &Arc<Self>, key: FingerprintKey, callback: Callback) {
        let mut cache = self.cache.lock();
        match cache.get_mut(&key) {
            Some(Entry::Ready(info)) => {
                let info = info.clone();
                drop(cache);
                callback(info);
                return;
            }
            Some(Entry::Waiting(waiters)) => {
                waiters.push(callback);
                return;
            }
            None => {
                cache.insert(key.clone(), Entry::Waiting(vec![callback]));
            }
        }
        drop(cache);

        let this = self.clone();
        let key_for_probe = key.clone();
        self.scheduler.run_closure_in_pool(
            COMPILER_INFO_POOL,
            Priority::Med,
            Box::new(move || {
                this.run_probe_and_drain(key_for_probe);
            }),
        );
    }

    fn run_probe_and_drain(self: &Arc<Self>, key: FingerprintKey) {
        debug!("probing compiler info for {:?}", key);
        CounterTable::inc(&self.stats.num_compiler_info_subprocs);
        let info = Arc::new(self.probe_runner.probe(&key));
        if info.is_disabled() {
            CounterTable::inc(&self.stats.num_compiler_disabled);
            warn!("compiler {} disabled: {:?}", key.compiler_path, info.disabled_reason);
            let disabled_count = self.stats.num_compiler_disabled.load(std::sync::atomic::Ordering::Relaxed);
            if disabled_count >= self.max_compiler_disabled_tasks {
                warn!("max_compiler_disabled_tasks reached; burst mode should engage");
            }
        }
        let waiters = {
            let mut cache = self.cache.lock();
            match cache.insert(key, Entry::Ready(info.clone())) {
                Some(Entry::Waiting(w)) => w,
                _ => Vec::new(),
            }
        };
        for cb in waiters {
            cb(info.clone());
        }
    }

    /// Distinct compiler paths this resolver has ever seen a key for
    /// (`/compilerz`, spec.md §4.8).
    pub fn known_compilers(&self) -> Vec<String> {
        let cache = self.cache.lock();
        let mut paths: Vec<String> = cache.keys().map(|k| k.compiler_path.clone()).collect();
        paths.sort();
        paths.dedup();
        paths
    }

    /// Per-key probe state dump (`/compilerinfoz`, spec.md §4.8).
    pub fn dump(&self) -> Vec<String> {
        let cache = self.cache.lock();
        cache
            .iter()
            .map(|(key, entry)| match entry {
                Entry::Ready(info) if info.is_disabled() => {
                    format!("{:?}: disabled ({})", key, info.disabled_reason.as_deref().unwrap_or("?"))
                }
                Entry::Ready(info) => format!("{:?}: ready binary_hash={}", key, info.features.binary_hash),
                Entry::Waiting(waiters) => format!("{:?}: probing ({} waiter(s))", key, waiters.len()),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct CountingProbeRunner {
        calls: AtomicUsize,
    }

    impl ProbeRunner for CountingProbeRunner {
        fn probe(&self, _key: &FingerprintKey) -> CompilerInfo {
            self.calls.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(20));
            CompilerInfo {
                features: CompilerFeatures { binary_hash: "deadbeef".into(), ..Default::default() },
                disabled_reason: None,
            }
        }
    }

    #[test]
    fn concurrent_misses_launch_exactly_one_probe() {
        let scheduler = Scheduler::new(2);
        scheduler.register_pool(COMPILER_INFO_POOL, 2);
        let probe = Arc::new(CountingProbeRunner { calls: AtomicUsize::new(0) });
        let stats = Arc::new(CounterTable::default());
        let resolver = CompilerInfoResolver::new(scheduler.clone(), probe.clone(), stats, 1000);

        let key = FingerprintKey::new("/usr/bin/clang", "/home/build", "/usr/bin", "");
        let (tx, rx) = std::sync::mpsc::channel();
        for _ in 0..10 {
            let tx = tx.clone();
            let key = key.clone();
            resolver.resolve(key, Box::new(move |info| { let _ = tx.send(info); }));
        }
        drop(tx);
        let mut received = 0;
        while let Ok(info) = rx.recv() {
            assert_eq!(info.features.binary_hash, "deadbeef");
            received += 1;
        }
        assert_eq!(received, 10);
        assert_eq!(probe.calls.load(Ordering::SeqCst), 1);
        scheduler.shutdown();
    }

    #[test]
    fn fingerprint_normalizes_cwd_for_absolute_paths() {
        let key = FingerprintKey::new("/usr/bin/clang", "/home/build", "/usr/bin", "");
        assert_eq!(key.cwd, ".");
        let key2 = FingerprintKey::new("clang", "/home/build", "/usr/bin", "");
        assert_eq!(key2.cwd, "/home/build");
    }
}
