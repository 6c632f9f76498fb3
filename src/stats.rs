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

//! `CounterTable` (spec.md §3): atomic counters for stats, aggregated by
//! `CompileService` and serialized to both a JSON dump (`/statz?format=json`)
//! and a plain-text dump (`/statz`), the way the teacher's
//! `ServerStats::to_cache_statistics` does for its (much smaller) counter
//! set.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

macro_rules! counter_table {
    ($($field:ident),+ $(,)?) => {
        #[derive(Default)]
        pub struct CounterTable {
            $(pub $field: AtomicU64,)+
        }

        impl CounterTable {
            pub fn snapshot(&self) -> BTreeMap<&'static str, u64> {
                let mut m = BTreeMap::new();
                $(m.insert(stringify!($field), self.$field.load(Ordering::Relaxed));)+
                m
            }
        }
    };
}

counter_table! {
    num_exec_request,
    num_exec_goma_finished,
    num_exec_success,
    num_exec_failure,
    num_exec_fail_fallback,
    num_exec_fail_fallback_refused,
    num_exec_cache_hit,
    num_exec_local_cache_hit,
    num_exec_canceled,
    exec_request_retry,
    num_file_uploaded,
    num_file_output,
    num_file_rename,
    num_file_upload_failure,
    num_file_download_failure,
    num_compiler_info_subprocs,
    num_compiler_disabled,
    num_subproc_started,
    num_subproc_killed,
    num_network_error_detected,
    num_network_recovered,
    num_burst_mode_entered,
    num_burst_mode_exited,
    command_version_mismatch,
    command_binary_hash_mismatch,
    command_subprogram_mismatch,
}

#[derive(Serialize)]
pub struct StatsDump {
    pub counters: BTreeMap<&'static str, u64>,
    pub active_tasks: usize,
    pub pending_tasks: usize,
    pub finished_tasks: usize,
    pub failed_tasks: usize,
    pub long_tasks: usize,
}

impl CounterTable {
    pub fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_start_at_zero_and_accumulate() {
        let t = CounterTable::default();
        assert_eq!(t.snapshot()["num_exec_request"], 0);
        CounterTable::inc(&t.num_exec_request);
        CounterTable::add(&t.num_file_uploaded, 3);
        let snap = t.snapshot();
        assert_eq!(snap["num_exec_request"], 1);
        assert_eq!(snap["num_file_uploaded"], 3);
    }
}
