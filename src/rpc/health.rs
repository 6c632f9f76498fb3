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

//! Sliding-window network-health monitor (spec.md §4.5 "Network health").
//! Errors only count toward the threshold after a `network_error_margin`
//! grace period has elapsed since the monitor started, so a handful of
//! errors during the very first few calls don't immediately trip burst
//! mode.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use log::info;
use parking_lot::Mutex;

const WINDOW_SIZE: usize = 50;

struct State {
    window: VecDeque<bool>,
    started_at: Instant,
    bursting: bool,
}

pub struct NetworkHealthMonitor {
    threshold_percent: u32,
    margin: Duration,
    state: Mutex<State>,
}

impl NetworkHealthMonitor {
    pub fn new(threshold_percent: u32, margin: Duration) -> Self {
        NetworkHealthMonitor {
            threshold_percent,
            margin,
            state: Mutex::new(State {
                window: VecDeque::with_capacity(WINDOW_SIZE),
                started_at: Instant::now(),
                bursting: false,
            }),
        }
    }

    pub fn record_success(&self) {
        self.record(true);
    }

    pub fn record_error(&self) {
        self.record(false);
    }

    fn record(&self, success: bool) {
        let mut state = self.state.lock();
        if !success && state.started_at.elapsed() < self.margin {
            // Within the startup grace period: don't count it.
            return;
        }
        if state.window.len() == WINDOW_SIZE {
            state.window.pop_front();
        }
        state.window.push_back(success);
        let errors = state.window.iter().filter(|&&ok| !ok).count();
        let error_percent = (errors * 100) / state.window.len().max(1);
        let crossed = error_percent as u32 >= self.threshold_percent && state.window.len() >= WINDOW_SIZE / 2;
        if crossed && !state.bursting {
            state.bursting = true;
            info!("network error rate {}% crossed threshold {}%; entering burst mode", error_percent, self.threshold_percent);
        } else if !crossed && state.bursting {
            state.bursting = false;
            info!("network error rate recovered to {}%; leaving burst mode", error_percent);
        }
    }

    pub fn is_bursting(&self) -> bool {
        self.state.lock().bursting
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crosses_threshold_exactly_once_per_sustained_failure_run() {
        let monitor = NetworkHealthMonitor::new(50, Duration::from_millis(0));
        for _ in 0..WINDOW_SIZE {
            monitor.record_success();
        }
        assert!(!monitor.is_bursting());
        for _ in 0..WINDOW_SIZE {
            monitor.record_error();
        }
        assert!(monitor.is_bursting());
        for _ in 0..WINDOW_SIZE {
            monitor.record_success();
        }
        assert!(!monitor.is_bursting());
    }

    #[test]
    fn margin_suppresses_errors_during_startup_grace() {
        let monitor = NetworkHealthMonitor::new(1, Duration::from_secs(60));
        for _ in 0..WINDOW_SIZE {
            monitor.record_error();
        }
        assert!(!monitor.is_bursting());
    }
}
