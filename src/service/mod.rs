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

//! C6 CompileService (spec.md §4.6): owns the task arena, its rings, and
//! the admission/fallback throttles.
//!
//! Grounded on the teacher's `SccacheService`/`ServerStats` (an active-task
//! count plus global counters), generalized into the arena-of-ids design
//! spec.md §9 calls for: rings store `u64` task ids, not pointers, which
//! dissolves the source's intrusive ref-counting without losing the
//! "keep a task alive while a status page streams it" contract -- the
//! arena simply doesn't evict an id still referenced by any ring.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use log::{info, warn};

use crate::stats::{CounterTable, StatsDump};
use crate::task::{Task, TaskState};

/// All mutable rings/sets live behind one mutex, per spec.md §5's locking
/// discipline table: no callback is ever invoked while this is held.
struct Rings {
    active: Vec<u64>,
    pending: VecDeque<u64>,
    finished: VecDeque<u64>,
    failed: VecDeque<u64>,
    /// `(handler_ms, id)`, kept sorted ascending so the minimum is at the
    /// front; a plain `Vec` is fine at the configured small cap.
    long: Vec<(u128, u64)>,
}

struct FailFallbackBudget {
    active: u64,
    first_reached_at: Option<Instant>,
}

/// Byte-denominated semaphore bounding output buffered across every
/// in-flight task at once (spec.md §3), so one pathological compile can't
/// force the whole daemon to buffer unbounded stdout/stderr/object bytes.
/// Invariant: `0 <= cur_sum_output_size <= max_sum_output_size`.
struct OutputBudget {
    cur_sum_output_size: u64,
    req_sum_output_size: u64,
    peak_req_sum_output_size: u64,
    max_sum_output_size: u64,
}

impl OutputBudget {
    fn new(max_sum_output_size: u64) -> Self {
        OutputBudget {
            cur_sum_output_size: 0,
            req_sum_output_size: 0,
            peak_req_sum_output_size: 0,
            max_sum_output_size,
        }
    }

    /// Reserve `bytes` if doing so keeps `cur_sum_output_size` within
    /// `max_sum_output_size`; always records the request for `/statz`
    /// whether or not it was granted.
    fn try_reserve(&mut self, bytes: u64) -> bool {
        self.req_sum_output_size = self.req_sum_output_size.saturating_add(bytes);
        self.peak_req_sum_output_size = self.peak_req_sum_output_size.max(self.req_sum_output_size);
        if self.cur_sum_output_size.saturating_add(bytes) > self.max_sum_output_size {
            return false;
        }
        self.cur_sum_output_size += bytes;
        true
    }

    fn release(&mut self, bytes: u64) {
        self.cur_sum_output_size = self.cur_sum_output_size.saturating_sub(bytes);
        self.req_sum_output_size = self.req_sum_output_size.saturating_sub(bytes);
    }
}

pub struct CompileService {
    next_id: AtomicU64,
    arena: Mutex<HashMap<u64, Arc<Task>>>,
    rings: Mutex<Rings>,
    done_cond: Condvar,
    quit: std::sync::atomic::AtomicBool,
    pub stats: Arc<CounterTable>,

    max_active_tasks: usize,
    max_finished_tasks: usize,
    max_failed_tasks: usize,
    max_long_tasks: usize,
    max_active_fail_fallback_tasks: u64,
    fail_fallback_grace: Duration,
    fail_fallback: Mutex<FailFallbackBudget>,
    output_budget: Mutex<OutputBudget>,
}

impl CompileService {
    pub fn new(config: &crate::config::Config) -> Arc<Self> {
        Arc::new(CompileService {
            next_id: AtomicU64::new(1),
            arena: Mutex::new(HashMap::new()),
            rings: Mutex::new(Rings {
                active: Vec::new(),
                pending: VecDeque::new(),
                finished: VecDeque::new(),
                failed: VecDeque::new(),
                long: Vec::new(),
            }),
            done_cond: Condvar::new(),
            quit: std::sync::atomic::AtomicBool::new(false),
            stats: Arc::new(CounterTable::default()),
            max_active_tasks: config.max_active_tasks,
            max_finished_tasks: config.max_finished_tasks,
            max_failed_tasks: config.max_failed_tasks,
            max_long_tasks: config.max_long_tasks,
            max_active_fail_fallback_tasks: config.max_active_fail_fallback_tasks as u64,
            fail_fallback_grace: config.fail_fallback_grace(),
            fail_fallback: Mutex::new(FailFallbackBudget { active: 0, first_reached_at: None }),
            output_budget: Mutex::new(OutputBudget::new(config.max_output_budget_bytes)),
        })
    }

    /// Reserve `bytes` of the shared output budget before buffering a
    /// task's stdout/stderr/object bytes (spec.md §3 `OutputBudget`).
    /// Returns whether the reservation was granted; an ungranted caller
    /// must not buffer the bytes and should surface a resource-exhausted
    /// failure instead.
    pub fn try_reserve_output_budget(&self, bytes: u64) -> bool {
        self.output_budget.lock().unwrap().try_reserve(bytes)
    }

    /// Release a reservation made by `try_reserve_output_budget` once the
    /// buffered bytes have been written out or dropped.
    pub fn release_output_budget(&self, bytes: u64) {
        self.output_budget.lock().unwrap().release(bytes);
    }

    /// Admit `task`: into `active` if there's room, else `pending`
    /// (spec.md §4.6 "Admission"; §8 invariant 1).
    pub fn admit(self: &Arc<Self>, task: Arc<Task>) -> bool {
        if self.quit.load(Ordering::SeqCst) {
            return false;
        }
        let id = task.id;
        self.arena.lock().unwrap().insert(id, task);
        let mut rings = self.rings.lock().unwrap();
        CounterTable::inc(&self.stats.num_exec_request);
        if rings.active.len() < self.max_active_tasks {
            rings.active.push(id);
            true
        } else {
            rings.pending.push_back(id);
            false
        }
    }

    pub fn get(&self, id: u64) -> Option<Arc<Task>> {
        self.arena.lock().unwrap().get(&id).cloned()
    }

    pub fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Retire a task that has reached a terminal state: remove it from
    /// `active`, place it in the rings its outcome calls for, promote
    /// pending work, and wake anyone in `wait()` (spec.md §4.6 "Rings").
    pub fn retire(self: &Arc<Self>, id: u64) {
        use std::sync::atomic::Ordering::SeqCst;
        let task = match self.get(id) {
            Some(t) => t,
            None => return,
        };
        let mut rings = self.rings.lock().unwrap();
        rings.active.retain(|&x| x != id);

        let failed = task.flags.failed.load(SeqCst) || task.flags.fail_fallback.load(SeqCst);
        let canceled = task.flags.canceled.load(SeqCst);
        let mut evicted = Vec::new();
        if failed && !canceled {
            evicted.extend(push_capped(&mut rings.failed, id, self.max_failed_tasks));
        } else {
            evicted.extend(push_capped(&mut rings.finished, id, self.max_finished_tasks));
        }

        let handler_ms = task.handler_duration().as_millis();
        evicted.extend(maybe_push_long(&mut rings.long, handler_ms, id, self.max_long_tasks));

        // A task id can be held by both a finished/failed ring and `long`
        // at once (this call pushes into both independently), so an id
        // evicted from one ring only leaves the arena once none of the
        // rings still reference it.
        for evicted_id in evicted {
            if !rings.finished.contains(&evicted_id)
                && !rings.failed.contains(&evicted_id)
                && !rings.long.iter().any(|&(_, lid)| lid == evicted_id)
            {
                self.arena.lock().unwrap().remove(&evicted_id);
            }
        }

        let mut promoted = Vec::new();
        while rings.active.len() < self.max_active_tasks {
            match rings.pending.pop_front() {
                Some(pending_id) => {
                    rings.active.push(pending_id);
                    promoted.push(pending_id);
                }
                None => break,
            }
        }
        drop(rings);
        self.done_cond.notify_all();
        if !promoted.is_empty() {
            info!("promoted {} pending task(s) after retiring #{}", promoted.len(), id);
        }
    }

    /// Called before starting a local fallback caused by remote failure
    /// (spec.md §4.6 "Fallback budget"). Returns whether the fallback is
    /// granted.
    pub fn increment_active_fail_fallback_tasks(&self) -> bool {
        let mut budget = self.fail_fallback.lock().unwrap();
        budget.active += 1;
        if budget.active <= self.max_active_fail_fallback_tasks {
            return true;
        }
        let now = Instant::now();
        let first = *budget.first_reached_at.get_or_insert(now);
        if now.duration_since(first) <= self.fail_fallback_grace {
            true
        } else {
            warn!("fail-fallback budget exhausted and grace window elapsed; refusing");
            false
        }
    }

    pub fn decrement_active_fail_fallback_tasks(&self) {
        let mut budget = self.fail_fallback.lock().unwrap();
        budget.active = budget.active.saturating_sub(1);
        if budget.active <= self.max_active_fail_fallback_tasks {
            budget.first_reached_at = None;
        }
    }

    pub fn quit(&self) {
        self.quit.store(true, Ordering::SeqCst);
    }

    pub fn is_quitting(&self) -> bool {
        self.quit.load(Ordering::SeqCst)
    }

    /// Block until `pending` and `active` are both empty.
    pub fn wait_drained(&self) {
        let rings = self.rings.lock().unwrap();
        let _unused = self
            .done_cond
            .wait_while(rings, |r| !r.active.is_empty() || !r.pending.is_empty())
            .unwrap();
    }

    pub fn stats_dump(&self) -> StatsDump {
        let rings = self.rings.lock().unwrap();
        StatsDump {
            counters: self.stats.snapshot(),
            active_tasks: rings.active.len(),
            pending_tasks: rings.pending.len(),
            finished_tasks: rings.finished.len(),
            failed_tasks: rings.failed.len(),
            long_tasks: rings.long.len(),
        }
    }

    /// Summary lines for every task currently in `failed` (`/errorz`,
    /// spec.md §4.8).
    pub fn failed_task_summaries(&self) -> Vec<String> {
        let rings = self.rings.lock().unwrap();
        let arena = self.arena.lock().unwrap();
        rings
            .failed
            .iter()
            .filter_map(|id| arena.get(id).map(|task| task.summary().to_string()))
            .collect()
    }

    pub fn active_count(&self) -> usize {
        self.rings.lock().unwrap().active.len()
    }

    pub fn pending_count(&self) -> usize {
        self.rings.lock().unwrap().pending.len()
    }
}

/// Push `id` onto `ring`, returning any ids evicted to respect `cap`.
/// Callers must not drop an evicted id from the arena until they've
/// checked it isn't still held by another ring (see `retire`).
fn push_capped(ring: &mut VecDeque<u64>, id: u64, cap: usize) -> Vec<u64> {
    ring.push_back(id);
    let mut evicted = Vec::new();
    while ring.len() > cap {
        if let Some(id) = ring.pop_front() {
            evicted.push(id);
        }
    }
    evicted
}

fn maybe_push_long(long: &mut Vec<(u128, u64)>, handler_ms: u128, id: u64, cap: usize) -> Vec<u64> {
    if long.len() < cap {
        long.push((handler_ms, id));
        long.sort_by_key(|&(ms, _)| ms);
        return Vec::new();
    }
    if let Some(&(min_ms, min_id)) = long.first() {
        if handler_ms > min_ms {
            long.remove(0);
            long.push((handler_ms, id));
            long.sort_by_key(|&(ms, _)| ms);
            return vec![min_id];
        }
    }
    Vec::new()
}

/// Overall state machine for §6's `Exec` RPC kind -- whether this
/// `CompileService::_` call counted toward `num_exec_success`/`failure` or
/// was a cache hit, purely for telemetry aggregation at the call site.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecOutcome {
    Success,
    Failure,
    CacheHit,
    Canceled,
}

pub fn record_outcome(stats: &CounterTable, outcome: ExecOutcome) {
    match outcome {
        ExecOutcome::Success => CounterTable::inc(&stats.num_exec_success),
        ExecOutcome::Failure => CounterTable::inc(&stats.num_exec_failure),
        ExecOutcome::CacheHit => CounterTable::inc(&stats.num_exec_cache_hit),
        ExecOutcome::Canceled => CounterTable::inc(&stats.num_exec_canceled),
    }
    CounterTable::inc(&stats.num_exec_goma_finished);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::RequesterInfo;

    fn make_task(id: u64) -> Arc<Task> {
        Arc::new(Task::new(id, vec!["cc".into()], "/usr/bin/cc".into(), "/".into(), RequesterInfo {
            user: "u".into(),
            nodename: "n".into(),
            build_id: "b".into(),
        }))
    }

    #[test]
    fn admission_queues_past_the_active_cap_and_promotes_on_retire() {
        let mut config = crate::config::Config::default();
        config.max_active_tasks = 1;
        let service = CompileService::new(&config);

        let t1 = make_task(service.next_id());
        let t2 = make_task(service.next_id());
        assert!(service.admit(t1.clone()));
        assert!(!service.admit(t2.clone()));
        assert_eq!(service.active_count(), 1);
        assert_eq!(service.pending_count(), 1);

        t1.transition(TaskState::Finished);
        service.retire(t1.id);
        assert_eq!(service.active_count(), 1);
        assert_eq!(service.pending_count(), 0);
    }

    #[test]
    fn fail_fallback_budget_allows_burst_within_grace_then_refuses() {
        let mut config = crate::config::Config::default();
        config.max_active_fail_fallback_tasks = 2;
        config.allowed_max_active_fail_fallback_duration_secs = 0;
        let service = CompileService::new(&config);

        assert!(service.increment_active_fail_fallback_tasks());
        assert!(service.increment_active_fail_fallback_tasks());
        // Third exceeds the cap but is still within the (zero-length, so
        // effectively instantaneous) grace window on first reach.
        assert!(service.increment_active_fail_fallback_tasks());
        std::thread::sleep(Duration::from_millis(5));
        assert!(!service.increment_active_fail_fallback_tasks());
    }

    #[test]
    fn output_budget_refuses_once_exhausted_then_recovers_on_release() {
        let mut config = crate::config::Config::default();
        config.max_output_budget_bytes = 100;
        let service = CompileService::new(&config);

        assert!(service.try_reserve_output_budget(60));
        assert!(!service.try_reserve_output_budget(60));
        service.release_output_budget(60);
        assert!(service.try_reserve_output_budget(60));
    }

    #[test]
    fn arena_keeps_a_task_evicted_from_finished_while_long_still_holds_it() {
        let mut config = crate::config::Config::default();
        config.max_active_tasks = 100;
        config.max_finished_tasks = 1;
        config.max_long_tasks = 5;
        let service = CompileService::new(&config);

        let t1 = make_task(service.next_id());
        service.admit(t1.clone());
        t1.transition(TaskState::Finished);
        service.retire(t1.id);

        let t2 = make_task(service.next_id());
        service.admit(t2.clone());
        t2.transition(TaskState::Finished);
        service.retire(t2.id);

        // t1 was evicted from `finished` (cap 1) but is still referenced by
        // `long` (cap 5, nowhere near full), so it must stay in the arena.
        assert!(service.get(t1.id).is_some());
    }

    #[test]
    fn finished_and_failed_rings_respect_their_caps() {
        let mut config = crate::config::Config::default();
        config.max_active_tasks = 100;
        config.max_finished_tasks = 2;
        let service = CompileService::new(&config);
        for _ in 0..5 {
            let t = make_task(service.next_id());
            service.admit(t.clone());
            t.transition(TaskState::Finished);
            service.retire(t.id);
        }
        let dump = service.stats_dump();
        assert_eq!(dump.finished_tasks, 2);
    }
}
