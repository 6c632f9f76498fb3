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

//! The "input recently failed" signal behind `local_run_for_failed_input`
//! (spec.md §4.7 step 2): a small in-memory TTL map keyed by compiler
//! invocation, independent of the C6 task rings since it outlives any one
//! task and is only ever consulted, never displayed.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

pub struct RecentFailures {
    ttl: Duration,
    entries: Mutex<HashMap<String, Instant>>,
}

impl RecentFailures {
    pub fn new(ttl: Duration) -> Self {
        RecentFailures { ttl, entries: Mutex::new(HashMap::new()) }
    }

    pub fn mark_failed(&self, key: &str) {
        self.entries.lock().unwrap().insert(key.to_string(), Instant::now());
    }

    pub fn clear(&self, key: &str) {
        self.entries.lock().unwrap().remove(key);
    }

    pub fn recently_failed(&self, key: &str) -> bool {
        let mut entries = self.entries.lock().unwrap();
        match entries.get(key) {
            Some(at) if at.elapsed() <= self.ttl => true,
            Some(_) => {
                entries.remove(key);
                false
            }
            None => false,
        }
    }
}

/// Composite key identifying "the same compile" for the failure tracker
/// (spec.md §4.7 step 2 doesn't specify exact identity, so this follows the
/// same compiler/cwd/command triple `FingerprintKey` (C4) uses to identify
/// a compiler installation, extended with the full command line).
pub fn input_key(compiler_path: &str, cwd: &str, command: &[String]) -> String {
    format!("{compiler_path}\n{cwd}\n{}", command.join(" "))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn marks_and_expires_within_ttl() {
        let tracker = RecentFailures::new(Duration::from_millis(20));
        tracker.mark_failed("k");
        assert!(tracker.recently_failed("k"));
        std::thread::sleep(Duration::from_millis(30));
        assert!(!tracker.recently_failed("k"));
    }

    #[test]
    fn clear_removes_the_entry_immediately() {
        let tracker = RecentFailures::new(Duration::from_secs(60));
        tracker.mark_failed("k");
        assert!(tracker.recently_failed("k"));
        tracker.clear("k");
        assert!(!tracker.recently_failed("k"));
    }

    #[test]
    fn unknown_key_is_not_recently_failed() {
        let tracker = RecentFailures::new(Duration::from_secs(60));
        assert!(!tracker.recently_failed("nope"));
    }
}
