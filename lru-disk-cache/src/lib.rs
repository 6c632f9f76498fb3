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

//! A byte-size-bounded LRU cache of files on disk.
//!
//! Used by the proxy to persist `CompilerInfo` probes and file-hash lookups
//! between runs, and to hold locally-cached blob content. Keys are
//! caller-chosen strings (typically a fingerprint key or a hex hash); values
//! are raw byte blobs written under `root` and tracked by size so the total
//! never exceeds `capacity`.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use filetime::FileTime;
use log::debug;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LruError {
    #[error("file too large for cache: {0} bytes (capacity is {1} bytes)")]
    FileTooLarge(u64, u64),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, LruError>;

struct Entry {
    size: u64,
    /// Monotonic recency counter; larger is more-recently-used.
    tick: u64,
}

/// A size-bounded cache of files rooted at a directory on disk.
///
/// Eviction order approximates LRU using a monotonic access counter rather
/// than an intrusive linked list: simpler to keep correct, and the ordering
/// only matters in aggregate, not element-by-element.
pub struct LruDiskCache {
    root: PathBuf,
    capacity: u64,
    current_size: u64,
    tick: u64,
    entries: HashMap<String, Entry>,
}

impl LruDiskCache {
    /// Open (creating if necessary) an LRU disk cache rooted at `root` with
    /// the given byte `capacity`. Pre-existing files under `root` are
    /// adopted into the cache, ordered by mtime.
    pub fn new<P: AsRef<Path>>(root: P, capacity: u64) -> Result<LruDiskCache> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        let mut cache = LruDiskCache {
            root,
            capacity,
            current_size: 0,
            tick: 0,
            entries: HashMap::new(),
        };
        cache.load_existing()?;
        Ok(cache)
    }

    fn load_existing(&mut self) -> Result<()> {
        let mut by_mtime: BTreeMap<i64, Vec<(String, u64)>> = BTreeMap::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            let meta = entry.metadata()?;
            if !meta.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            let mtime = FileTime::from_last_modification_time(&meta);
            by_mtime
                .entry(mtime.seconds())
                .or_default()
                .push((name, meta.len()));
        }
        for (_, group) in by_mtime {
            for (name, size) in group {
                self.tick += 1;
                self.current_size += size;
                self.entries.insert(name, Entry { size, tick: self.tick });
            }
        }
        Ok(())
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn size(&self) -> u64 {
        self.current_size
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Insert `data` under `key`, evicting the least-recently-used entries
    /// until there is room. Fails if `data` alone exceeds `capacity`.
    pub fn insert_bytes(&mut self, key: &str, data: &[u8]) -> Result<()> {
        let size = data.len() as u64;
        if size > self.capacity {
            return Err(LruError::FileTooLarge(size, self.capacity));
        }
        self.remove(key)?;
        self.make_room(size)?;
        let path = self.path_for(key);
        fs::write(&path, data)?;
        self.tick += 1;
        self.entries.insert(key.to_owned(), Entry { size, tick: self.tick });
        self.current_size += size;
        Ok(())
    }

    /// Fetch the bytes for `key`, bumping its recency on hit.
    pub fn get(&mut self, key: &str) -> Result<Option<Vec<u8>>> {
        if !self.entries.contains_key(key) {
            return Ok(None);
        }
        let path = self.path_for(key);
        let data = fs::read(&path)?;
        self.tick += 1;
        if let Some(entry) = self.entries.get_mut(key) {
            entry.tick = self.tick;
        }
        Ok(Some(data))
    }

    pub fn remove(&mut self, key: &str) -> Result<()> {
        if let Some(entry) = self.entries.remove(key) {
            self.current_size -= entry.size;
            let path = self.path_for(key);
            match fs::remove_file(path) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    fn make_room(&mut self, additional: u64) -> Result<()> {
        while self.current_size + additional > self.capacity {
            let victim = self
                .entries
                .iter()
                .min_by_key(|(_, e)| e.tick)
                .map(|(k, _)| k.clone());
            match victim {
                Some(key) => {
                    debug!("lru-disk-cache: evicting {} to make room", key);
                    self.remove(&key)?;
                }
                None => break,
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn cache(capacity: u64) -> (TempDir, LruDiskCache) {
        let dir = TempDir::new().unwrap();
        let cache = LruDiskCache::new(dir.path(), capacity).unwrap();
        (dir, cache)
    }

    #[test]
    fn insert_and_get_roundtrip() {
        let (_dir, mut cache) = cache(1024);
        cache.insert_bytes("a", b"hello").unwrap();
        assert_eq!(cache.get("a").unwrap(), Some(b"hello".to_vec()));
        assert_eq!(cache.size(), 5);
    }

    #[test]
    fn eviction_respects_capacity() {
        let (_dir, mut cache) = cache(10);
        cache.insert_bytes("a", b"0123456789").unwrap();
        assert_eq!(cache.size(), 10);
        // Inserting "b" must evict "a" since capacity is exactly 10 bytes.
        cache.insert_bytes("b", b"abcdefghij").unwrap();
        assert!(!cache.contains_key("a"));
        assert!(cache.contains_key("b"));
        assert_eq!(cache.size(), 10);
    }

    #[test]
    fn oversized_insert_fails() {
        let (_dir, mut cache) = cache(4);
        let err = cache.insert_bytes("a", b"12345").unwrap_err();
        assert!(matches!(err, LruError::FileTooLarge(5, 4)));
    }

    #[test]
    fn recency_protects_recently_used_entry() {
        let (_dir, mut cache) = cache(10);
        cache.insert_bytes("a", b"01234").unwrap();
        cache.insert_bytes("b", b"56789").unwrap();
        // Touch "a" so it's more recent than "b".
        cache.get("a").unwrap();
        // Inserting "c" (5 bytes) requires evicting one 5-byte entry; "b"
        // is the older one now and should go first.
        cache.insert_bytes("c", b"abcde").unwrap();
        assert!(cache.contains_key("a"));
        assert!(!cache.contains_key("b"));
        assert!(cache.contains_key("c"));
    }

    #[test]
    fn reopen_adopts_existing_files() {
        let dir = TempDir::new().unwrap();
        {
            let mut cache = LruDiskCache::new(dir.path(), 1024).unwrap();
            cache.insert_bytes("a", b"persisted").unwrap();
        }
        let cache = LruDiskCache::new(dir.path(), 1024).unwrap();
        assert_eq!(cache.size(), "persisted".len() as u64);
        assert!(cache.contains_key("a"));
    }
}
