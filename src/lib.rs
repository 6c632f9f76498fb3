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

//! `sccache_proxy`: the compile proxy daemon's request-lifecycle engine.
//!
//! See `DESIGN.md` at the repository root for how each module is grounded.

pub mod blob;
pub mod compiler_info;
pub mod config;
pub mod errors;
pub mod external;
pub mod gate;
pub mod logging;
pub mod rpc;
pub mod scheduler;
pub mod service;
pub mod simples3;
pub mod stats;
pub mod subprocess;
pub mod task;

/// Generated protobuf types (spec.md §3, §6 wire formats).
pub mod proto {
    include!(concat!(env!("OUT_DIR"), "/compileproxy.rs"));
}

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use log::{info, warn};

use compiler_info::{CompilerInfoResolver, SubprocessProbeRunner};
use config::Config;
use errors::Result;
use external::{NaiveFlagParser, NaiveIncludeProcessor};
use gate::trust::TrustPolicy;
use gate::Gate;
use rpc::auth::AuthMethod;
use rpc::RpcClient;
use service::CompileService;
use stats::CounterTable;
use subprocess::{Caps, Controller};

/// Construct the daemon's components and run until `Quit`/`AbortAbortAbort`
/// (spec.md §4.6 "Quit/Wait"). This is the single entry point `main.rs`
/// and integration tests both call into.
pub async fn run(config: Config) -> Result<()> {
    logging::init_logging(None);
    info!("starting compile proxy daemon");

    let config = Arc::new(config);

    let _lock = acquire_lock_file(&config)?;

    let scheduler = scheduler::Scheduler::new(config.scheduler_threads);
    scheduler.register_pool(compiler_info::COMPILER_INFO_POOL, 2);

    let service = CompileService::new(&config);

    let no_kill: HashSet<String> = config.no_kill_list.iter().cloned().collect();
    let caps = Caps {
        max_subprocs: config.max_subprocs,
        max_subprocs_low_priority: config.max_subprocs_low_priority,
        max_subprocs_heavy_weight: config.max_subprocs_heavy_weight,
    };
    let controller = Controller::spawn(caps, no_kill);

    let probe_runner = Arc::new(SubprocessProbeRunner {
        controller: controller.clone(),
        runtime: tokio::runtime::Handle::current(),
    });
    let resolver = CompilerInfoResolver::new(
        scheduler.clone(),
        probe_runner,
        service.stats.clone(),
        config.max_compiler_disabled_tasks,
    );

    let auth = AuthMethod::select(
        config.oauth2_token.clone(),
        config.luci_local_auth_token.clone(),
        config.static_auth_header.clone(),
    );
    let rpc = Arc::new(RpcClient::new(&config, auth));
    if let Err(e) = rpc.ping_until_healthy().await {
        warn!("remote backend did not answer the startup ping: {e}; starting anyway, requests will fall back locally");
    }

    let storage: Arc<dyn blob::storage::Storage> = {
        let dir = config.local_cache_dir.clone().unwrap_or_else(default_local_cache_dir);
        Arc::new(blob::storage::LocalDiskStorage::new(&dir, config.local_cache_capacity_bytes)?)
    };

    let flag_parser: Arc<dyn external::FlagParser> = Arc::new(NaiveFlagParser);
    let include_processor: Arc<dyn external::IncludeProcessor> = Arc::new(NaiveIncludeProcessor);

    spawn_burst_mode_watcher(rpc.clone(), controller.clone(), service.stats.clone(), caps, &config);

    #[cfg(unix)]
    let owner_uid = unsafe { libc::getuid() };
    #[cfg(not(unix))]
    let owner_uid = 0u32;
    let trust = TrustPolicy::new(&config.trusted_cidrs, owner_uid);
    let gate = Gate::new(
        service.clone(),
        trust,
        resolver,
        controller,
        rpc,
        storage,
        flag_parser,
        include_processor,
        config.clone(),
    );

    let admin_addr = std::net::SocketAddr::from(([127, 0, 0, 1], config.admin_port));
    let bound_port = gate.clone().serve_admin_tcp(admin_addr).await?;
    info!("admin surface bound to port {bound_port}");

    #[cfg(unix)]
    {
        if let Some(path) = &config.socket_path {
            let gate = gate.clone();
            let path = path.clone();
            tokio::spawn(async move {
                if let Err(e) = gate.serve_ipc_unix(&path).await {
                    log::error!("ipc transport exited: {e}");
                }
            });
        }
    }

    tokio::signal::ctrl_c().await.ok();
    info!("received shutdown signal, draining");
    service.quit();
    service.wait_drained();
    Ok(())
}

/// Poll the network-health monitor and flip the subprocess controller
/// between its normal and burst-mode caps on each edge (spec.md §4.5
/// "Burst mode"), recording the transition in `stats`. The monitor itself
/// only tracks whether the sliding window is currently over threshold;
/// this is the one place that turns that signal into an actual cap change.
fn spawn_burst_mode_watcher(
    rpc: Arc<RpcClient>,
    controller: Arc<Controller>,
    stats: Arc<CounterTable>,
    normal_caps: Caps,
    config: &Config,
) {
    let burst_caps = Caps {
        max_subprocs: config.burst_max_subprocs,
        max_subprocs_low_priority: config.burst_max_subprocs_low_priority,
        max_subprocs_heavy_weight: config.burst_max_subprocs_heavy_weight,
    };
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(2));
        let mut bursting = false;
        loop {
            interval.tick().await;
            let now_bursting = rpc.health.is_bursting();
            if now_bursting && !bursting {
                controller.set_caps(burst_caps);
                CounterTable::inc(&stats.num_burst_mode_entered);
                info!("entering burst mode");
            } else if !now_bursting && bursting {
                controller.set_caps(normal_caps);
                CounterTable::inc(&stats.num_burst_mode_exited);
                info!("leaving burst mode");
            }
            bursting = now_bursting;
        }
    });
}

/// Default on-disk cache root when `--local-cache-dir` isn't set: the
/// platform cache directory (replacing the teacher's `app_dirs` lookup).
fn default_local_cache_dir() -> std::path::PathBuf {
    directories::ProjectDirs::from("", "", "sccache-proxy")
        .map(|dirs| dirs.cache_dir().to_path_buf())
        .unwrap_or_else(|| std::env::temp_dir().join("sccache-proxy"))
}

/// Per-port advisory lock file (spec.md §6 "Lock file"): refuse to start
/// if another user's process holds the lock.
fn acquire_lock_file(config: &Config) -> Result<Option<std::fs::File>> {
    let Some(path) = &config.lock_file else { return Ok(None) };
    use fs4::fs_std::FileExt as _;
    let file = std::fs::OpenOptions::new().create(true).write(true).open(path)?;
    if file.try_lock_exclusive().is_err() {
        return Err(errors::ProxyError::ResourceExhausted(format!(
            "lock file {} is held by another process",
            path.display()
        )));
    }
    Ok(Some(file))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_file_is_optional() {
        let mut config = Config::default();
        config.lock_file = None;
        assert!(acquire_lock_file(&config).unwrap().is_none());
    }

    #[test]
    fn lock_file_refuses_a_second_holder() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("proxy.lock");
        let mut config = Config::default();
        config.lock_file = Some(path);
        let first = acquire_lock_file(&config).unwrap();
        assert!(first.is_some());
        let second = acquire_lock_file(&config);
        assert!(second.is_err());
    }
}
