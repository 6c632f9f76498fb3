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

//! Download sinks for reassembled `FileBlob` chunks (spec.md §4.3): a
//! `FileSink` writing straight to an output file (deleting on error, so a
//! partial download never leaves a corrupt artifact behind) and a
//! `MemorySink` used for in-memory blobs such as stdout/stderr capture.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::errors::{ProxyError, Result};

/// Destination for chunks arriving out of order at arbitrary offsets.
pub trait Sink: Send {
    fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<()>;
    /// Called once all expected bytes have landed; consumes `self`.
    fn finish(self: Box<Self>) -> Result<()>;
    /// Called if the download is aborted partway through; must leave no
    /// partial artifact in place of a real one.
    fn abort(self: Box<Self>);
}

/// Writes chunks directly into a file on disk via positioned writes.
/// Deletes the (possibly partial) file if the download is aborted.
pub struct FileSink {
    path: PathBuf,
    file: File,
}

impl FileSink {
    pub fn create(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let file = File::create(&path)?;
        Ok(FileSink { path, file })
    }
}

impl Sink for FileSink {
    fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(data)?;
        Ok(())
    }

    fn finish(self: Box<Self>) -> Result<()> {
        Ok(())
    }

    fn abort(self: Box<Self>) {
        let path = self.path.clone();
        drop(self);
        let _ = fs::remove_file(&path);
    }
}

/// Writes chunks into an in-memory buffer, growing it lazily as offsets
/// demand. Tracks each write as its own region rather than zero-filling
/// ahead of it -- `into_bytes` fails loudly instead of fabricating bytes
/// for a region that was never actually written (spec.md §4.3: "must not
/// rewrite unwritten regions").
#[derive(Default)]
pub struct MemorySink {
    regions: BTreeMap<u64, Vec<u8>>,
}

impl MemorySink {
    pub fn new() -> Self {
        MemorySink::default()
    }

    /// Concatenate the written regions in offset order. Fails if any gap
    /// remains between the end of one region and the start of the next.
    pub fn into_bytes(self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        let mut next = 0u64;
        for (offset, data) in self.regions {
            if offset != next {
                return Err(ProxyError::InvalidBlob(format!(
                    "memory sink has an unwritten gap at offset {} (next expected write was {})",
                    next, offset
                )));
            }
            next = offset + data.len() as u64;
            out.extend_from_slice(&data);
        }
        Ok(out)
    }
}

impl Sink for MemorySink {
    fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        self.regions.insert(offset, data.to_vec());
        Ok(())
    }

    fn finish(self: Box<Self>) -> Result<()> {
        Ok(())
    }

    fn abort(self: Box<Self>) {}
}

/// Remove a partially-downloaded file left at `path`, if present. Used by
/// callers that construct a `FileSink` but abort before `Sink::abort` is
/// reachable (e.g. the file was never successfully opened for write).
pub fn cleanup_partial(path: &Path) {
    let _ = fs::remove_file(path);
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn file_sink_writes_out_of_order_chunks() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("out.bin");
        let mut sink = FileSink::create(&path).unwrap();
        sink.write_at(5, b"world").unwrap();
        sink.write_at(0, b"hello").unwrap();
        Box::new(sink).finish().unwrap();
        let contents = fs::read(&path).unwrap();
        assert_eq!(&contents, b"helloworld");
    }

    #[test]
    fn file_sink_abort_removes_partial_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("partial.bin");
        let sink = FileSink::create(&path).unwrap();
        assert!(path.exists());
        Box::new(sink).abort();
        assert!(!path.exists());
    }

    #[test]
    fn memory_sink_grows_lazily_without_zero_gaps_read_back() {
        let mut sink = MemorySink::new();
        sink.write_at(0, b"abc").unwrap();
        sink.write_at(3, b"def").unwrap();
        let bytes = sink.into_bytes().unwrap();
        assert_eq!(&bytes, b"abcdef");
    }

    #[test]
    fn memory_sink_rejects_an_unwritten_gap_instead_of_zero_filling() {
        let mut sink = MemorySink::new();
        sink.write_at(0, b"abc").unwrap();
        sink.write_at(10, b"def").unwrap();
        assert!(sink.into_bytes().is_err());
    }

    #[test]
    fn memory_sink_accepts_out_of_order_writes() {
        let mut sink = MemorySink::new();
        sink.write_at(3, b"def").unwrap();
        sink.write_at(0, b"abc").unwrap();
        let bytes = sink.into_bytes().unwrap();
        assert_eq!(&bytes, b"abcdef");
    }
}
