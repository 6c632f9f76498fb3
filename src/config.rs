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

//! Startup options (spec.md §6): an environment-variable flag surface,
//! parsed once at startup into a `Config` that every component borrows.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum HermeticMode {
    Off,
    Fallback,
    Error,
}

/// How far into the remote pipeline (spec.md §4.7) a speculative local run
/// is allowed to preempt before the gate commits to waiting on remote.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, clap::ValueEnum)]
pub enum LocalRunPreference {
    FileReq,
    FileResp,
    Finished,
}

#[derive(Parser, Debug, Clone)]
#[command(name = "sccache-proxy", about = "local distributed-compile proxy daemon")]
pub struct Config {
    /// Maximum number of tasks admitted into `active` at once.
    #[arg(long, env = "SCCACHE_PROXY_MAX_ACTIVE_TASKS", default_value_t = 64)]
    pub max_active_tasks: usize,

    /// Size cap of the `finished` ring.
    #[arg(long, env = "SCCACHE_PROXY_MAX_FINISHED_TASKS", default_value_t = 1000)]
    pub max_finished_tasks: usize,

    /// Size cap of the `failed` ring.
    #[arg(long, env = "SCCACHE_PROXY_MAX_FAILED_TASKS", default_value_t = 1000)]
    pub max_failed_tasks: usize,

    /// Size cap of the `long` ring (by handler duration).
    #[arg(long, env = "SCCACHE_PROXY_MAX_LONG_TASKS", default_value_t = 100)]
    pub max_long_tasks: usize,

    /// Concurrent fail-fallback budget before the grace window kicks in.
    #[arg(long, env = "SCCACHE_PROXY_MAX_ACTIVE_FAIL_FALLBACK", default_value_t = 16)]
    pub max_active_fail_fallback_tasks: usize,

    /// How long, once the fail-fallback budget is first exceeded, fallback
    /// keeps being granted anyway.
    #[arg(long, env = "SCCACHE_PROXY_FAIL_FALLBACK_DURATION_SECS", default_value_t = 5)]
    pub allowed_max_active_fail_fallback_duration_secs: u64,

    /// Normal (non-burst) global subprocess cap.
    #[arg(long, env = "SCCACHE_PROXY_MAX_SUBPROCS", default_value_t = 32)]
    pub max_subprocs: usize,

    /// Normal low-priority subprocess cap.
    #[arg(long, env = "SCCACHE_PROXY_MAX_SUBPROCS_LOW", default_value_t = 8)]
    pub max_subprocs_low_priority: usize,

    /// Normal heavy-weight subprocess cap.
    #[arg(long, env = "SCCACHE_PROXY_MAX_SUBPROCS_HEAVY", default_value_t = 4)]
    pub max_subprocs_heavy_weight: usize,

    /// Burst-mode global subprocess cap.
    #[arg(long, env = "SCCACHE_PROXY_BURST_MAX_SUBPROCS", default_value_t = 64)]
    pub burst_max_subprocs: usize,

    /// Burst-mode low-priority subprocess cap.
    #[arg(long, env = "SCCACHE_PROXY_BURST_MAX_SUBPROCS_LOW", default_value_t = 16)]
    pub burst_max_subprocs_low_priority: usize,

    /// Burst-mode heavy-weight subprocess cap.
    #[arg(long, env = "SCCACHE_PROXY_BURST_MAX_SUBPROCS_HEAVY", default_value_t = 8)]
    pub burst_max_subprocs_heavy_weight: usize,

    /// Per-RPC timeout list in milliseconds, retried through in order.
    #[arg(long, env = "SCCACHE_PROXY_TIMEOUTS_MS", value_delimiter = ',', default_values_t = vec![3000u64, 10000, 30000])]
    pub timeouts_ms: Vec<u64>,

    /// Ping budget in milliseconds.
    #[arg(long, env = "SCCACHE_PROXY_PING_TIMEOUT_MS", default_value_t = 5000)]
    pub ping_timeout_ms: u64,

    /// Hermetic mode.
    #[arg(long, env = "SCCACHE_PROXY_HERMETIC", value_enum, default_value_t = HermeticMode::Fallback)]
    pub hermetic: HermeticMode,

    /// Sliding-window error rate (percent) that flips burst mode on.
    #[arg(long, env = "SCCACHE_PROXY_NETWORK_ERROR_THRESHOLD_PERCENT", default_value_t = 50)]
    pub network_error_threshold_percent: u32,

    /// Grace period (ms) before an error counts toward the network monitor.
    #[arg(long, env = "SCCACHE_PROXY_NETWORK_ERROR_MARGIN_MS", default_value_t = 1000)]
    pub network_error_margin_ms: u64,

    /// Tasks disabled for compiler reasons before burst mode engages.
    #[arg(long, env = "SCCACHE_PROXY_MAX_COMPILER_DISABLED_TASKS", default_value_t = 8)]
    pub max_compiler_disabled_tasks: u64,

    /// gzip/deflate compression level (1-9).
    #[arg(long, env = "SCCACHE_PROXY_COMPRESSION_LEVEL", default_value_t = 6)]
    pub compression_level: u32,

    /// CIDR ranges trusted for the localhost admin HTTP surface.
    #[arg(long, env = "SCCACHE_PROXY_TRUSTED_CIDRS", value_delimiter = ',', default_values_t = vec!["127.0.0.1/32".to_string()])]
    pub trusted_cidrs: Vec<String>,

    /// Unix-domain-socket path / Windows named-pipe name for the IPC
    /// transport.
    #[arg(long, env = "SCCACHE_PROXY_SOCKET_PATH")]
    pub socket_path: Option<PathBuf>,

    /// Port for the localhost admin HTTP transport.
    #[arg(long, env = "SCCACHE_PROXY_ADMIN_PORT", default_value_t = 0)]
    pub admin_port: u16,

    /// Path to the per-port advisory lock file.
    #[arg(long, env = "SCCACHE_PROXY_LOCK_FILE")]
    pub lock_file: Option<PathBuf>,

    /// Remote backend base URL.
    #[arg(long, env = "SCCACHE_PROXY_BACKEND_URL", default_value = "https://localhost:8088")]
    pub backend_url: String,

    /// How long outputs may be buffered before being written, in bytes.
    #[arg(long, env = "SCCACHE_PROXY_MAX_OUTPUT_BUDGET_BYTES", default_value_t = 512 * 1024 * 1024)]
    pub max_output_budget_bytes: u64,

    /// Log-clean interval in seconds (passed through to the log cleaner
    /// collaborator; modeled but not owned by the core per spec.md §1).
    #[arg(long, env = "SCCACHE_PROXY_LOG_CLEAN_INTERVAL_SECS", default_value_t = 3600)]
    pub log_clean_interval_secs: u64,

    /// Scheduler worker-pool thread count.
    #[arg(long, env = "SCCACHE_PROXY_SCHEDULER_THREADS", default_value_t = 8)]
    pub scheduler_threads: usize,

    /// OAuth2 bearer token, highest-precedence auth source (spec.md §4.5).
    #[arg(long, env = "SCCACHE_PROXY_OAUTH2_TOKEN")]
    pub oauth2_token: Option<String>,

    /// LUCI local-auth token, second-precedence auth source.
    #[arg(long, env = "SCCACHE_PROXY_LUCI_LOCAL_AUTH_TOKEN")]
    pub luci_local_auth_token: Option<String>,

    /// A pre-formatted `Authorization` header value, lowest-precedence auth
    /// source before falling back to no auth at all.
    #[arg(long, env = "SCCACHE_PROXY_STATIC_AUTH_HEADER")]
    pub static_auth_header: Option<String>,

    /// Command basenames that are detached rather than killed on cancel
    /// (spec.md §4.2 "No-kill list"), e.g. `ccache`, `link.exe`.
    #[arg(long, env = "SCCACHE_PROXY_NO_KILL_LIST", value_delimiter = ',')]
    pub no_kill_list: Vec<String>,

    /// Directory for the on-disk `CompilerInfo`/blob LRU cache.
    #[arg(long, env = "SCCACHE_PROXY_LOCAL_CACHE_DIR")]
    pub local_cache_dir: Option<PathBuf>,

    /// Byte capacity of the on-disk LRU cache.
    #[arg(long, env = "SCCACHE_PROXY_LOCAL_CACHE_CAPACITY_BYTES", default_value_t = 1024 * 1024 * 1024)]
    pub local_cache_capacity_bytes: u64,

    /// Whether an input that recently failed remotely triggers an
    /// immediate speculative local run instead of waiting out the delay
    /// (spec.md §4.7 step 2 "Local-run racing").
    #[arg(long, env = "SCCACHE_PROXY_LOCAL_RUN_FOR_FAILED_INPUT", default_value_t = true)]
    pub local_run_for_failed_input: bool,

    /// How recently a given input must have failed to count as "recently
    /// failed" for `local_run_for_failed_input`.
    #[arg(long, env = "SCCACHE_PROXY_LOCAL_RUN_FAILURE_TTL_SECS", default_value_t = 60)]
    pub local_run_failure_ttl_secs: u64,

    /// Delay, in milliseconds, before a speculative local run is launched
    /// alongside an already-in-flight remote attempt.
    #[arg(long, env = "SCCACHE_PROXY_LOCAL_RUN_DELAY_MS", default_value_t = 200)]
    pub local_run_delay_ms: u64,

    /// Remote pipeline stage the gate waits for before abandoning a
    /// winning speculative local run in favor of the remote result.
    #[arg(long, env = "SCCACHE_PROXY_LOCAL_RUN_PREFERENCE", value_enum, default_value_t = LocalRunPreference::FileResp)]
    pub local_run_preference: LocalRunPreference,
}

impl Config {
    pub fn timeouts(&self) -> Vec<Duration> {
        self.timeouts_ms.iter().map(|&ms| Duration::from_millis(ms)).collect()
    }

    pub fn ping_timeout(&self) -> Duration {
        Duration::from_millis(self.ping_timeout_ms)
    }

    pub fn network_error_margin(&self) -> Duration {
        Duration::from_millis(self.network_error_margin_ms)
    }

    pub fn fail_fallback_grace(&self) -> Duration {
        Duration::from_secs(self.allowed_max_active_fail_fallback_duration_secs)
    }

    pub fn local_run_delay(&self) -> Duration {
        Duration::from_millis(self.local_run_delay_ms)
    }

    pub fn local_run_failure_ttl(&self) -> Duration {
        Duration::from_secs(self.local_run_failure_ttl_secs)
    }
}

impl Default for Config {
    fn default() -> Config {
        // `Parser::parse_from` over an empty argv applies every `default_value*`.
        Config::parse_from::<_, &str>(["sccache-proxy"])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_self_consistent() {
        let cfg = Config::default();
        assert!(cfg.max_active_tasks > 0);
        assert_eq!(cfg.timeouts().len(), 3);
        assert_eq!(cfg.hermetic, HermeticMode::Fallback);
    }
}
