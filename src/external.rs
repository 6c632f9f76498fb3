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

//! Interfaces for the collaborators spec.md §1 calls explicitly out of
//! scope: the C/C++ preprocessor/include-finder, the compiler-flag parser,
//! the on-disk deps/include caches, the breakpad crash reporter, the HTML
//! status-page renderer, and the pre-parsed predefined-macro store. Each is
//! modeled here by its interface only; `task::CompileTask` depends on the
//! trait, not a concrete implementation, so a real parser/include-finder can
//! be dropped in without touching the request-lifecycle engine.

use std::collections::HashSet;
use std::path::PathBuf;

/// Outcome of parsing a compiler command line (flags are opaque here; the
/// real parser lives outside the core per spec.md §1).
#[derive(Debug, Clone)]
pub enum ParsedArguments {
    /// The command line is a supported compile; carries the canonicalized
    /// output path(s) for placement after a remote/local run.
    Ok { output_files: Vec<PathBuf> },
    /// Parseable, but this invocation can never be cached or sent remote
    /// (e.g. `-print-*`, `conftest`).
    CannotCache,
    /// Not a compilation at all (e.g. linking, `--version`).
    NotCompilation,
}

pub trait FlagParser: Send + Sync {
    fn parse(&self, command: &[String], cwd: &str) -> ParsedArguments;
}

/// A minimal default `FlagParser`: recognizes the handful of flags that
/// force a fallback (spec.md §4.7 step 1) and otherwise treats every other
/// invocation as a normal, cacheable compile. A real compiler-flag parser
/// slots in behind this trait without touching the request-lifecycle engine.
pub struct NaiveFlagParser;

impl FlagParser for NaiveFlagParser {
    fn parse(&self, command: &[String], _cwd: &str) -> ParsedArguments {
        let Some(first) = command.first() else { return ParsedArguments::NotCompilation };
        if command.iter().any(|a| a == "--version" || a == "-v" || a.starts_with("-print-")) {
            return ParsedArguments::NotCompilation;
        }
        if command.iter().any(|a| a == "-E" || a == "-M" || a == "-MM") {
            return ParsedArguments::CannotCache;
        }
        let _ = first;
        ParsedArguments::Ok { output_files: Vec::new() }
    }
}

/// The include-finder/preprocessor collaborator: given a parsed compile,
/// produce the set of input files the remote backend needs (spec.md §4.7
/// FILE_REQ step).
pub trait IncludeProcessor: Send + Sync {
    fn resolve_inputs(&self, command: &[String], cwd: &str) -> std::io::Result<HashSet<PathBuf>>;
}

/// A trivial include processor used by tests and as a safe default: only
/// the first non-flag argument is considered an input.
pub struct NaiveIncludeProcessor;

impl IncludeProcessor for NaiveIncludeProcessor {
    fn resolve_inputs(&self, command: &[String], cwd: &str) -> std::io::Result<HashSet<PathBuf>> {
        let base = PathBuf::from(cwd);
        let mut set = HashSet::new();
        for arg in command {
            if !arg.starts_with('-') {
                set.insert(base.join(arg));
            }
        }
        Ok(set)
    }
}

/// The deps/include on-disk cache collaborator (spec.md §1): a place the
/// include processor may persist results between runs. Modeled as a no-op
/// by default; a real cache slots in behind this trait.
pub trait IncludeCache: Send + Sync {
    fn get(&self, key: &str) -> Option<HashSet<PathBuf>>;
    fn put(&self, key: &str, value: HashSet<PathBuf>);
}

pub struct NullIncludeCache;

impl IncludeCache for NullIncludeCache {
    fn get(&self, _key: &str) -> Option<HashSet<PathBuf>> {
        None
    }
    fn put(&self, _key: &str, _value: HashSet<PathBuf>) {}
}

/// The breakpad-style crash reporter collaborator: install once at startup.
/// Out of scope per spec.md §1; modeled as a no-op handle so `main` has
/// somewhere to call into without depending on a concrete crash reporter.
pub trait CrashReporter: Send + Sync {
    fn install(&self) {}
}

pub struct NullCrashReporter;
impl CrashReporter for NullCrashReporter {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn naive_flag_parser_recognizes_version_queries_and_preprocessing() {
        let parser = NaiveFlagParser;
        assert!(matches!(
            parser.parse(&["cc".into(), "--version".into()], "/"),
            ParsedArguments::NotCompilation
        ));
        assert!(matches!(
            parser.parse(&["cc".into(), "-E".into(), "a.c".into()], "/"),
            ParsedArguments::CannotCache
        ));
        assert!(matches!(
            parser.parse(&["cc".into(), "-c".into(), "a.c".into()], "/"),
            ParsedArguments::Ok { .. }
        ));
    }
}
