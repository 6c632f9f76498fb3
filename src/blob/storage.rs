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

//! `Storage`: the backend-agnostic byte-blob abstraction C3 dispatches
//! `StoreFile`/`LookupFile` through, generalized from the teacher's
//! `cache::Storage` trait (`get`/`put` keyed by a content hash) to an
//! async interface over the proxy's remote backend.

use async_trait::async_trait;

use crate::errors::Result;

#[async_trait]
pub trait Storage: Send + Sync {
    /// Fetch the bytes stored under `key` (a `FileBlob` hash), or `Ok(None)`
    /// if no such blob exists in the backend.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Store `data` under `key`. Idempotent: storing the same key twice
    /// with identical content is a no-op success.
    async fn put(&self, key: &str, data: Vec<u8>) -> Result<()>;

    /// One-line human-readable cache status for `/filecachez` (spec.md
    /// §4.8). Backends with nothing meaningful to report can keep the
    /// default.
    fn describe(&self) -> String {
        "n/a".to_string()
    }
}

/// Default local `Storage` backed by the `lru-disk-cache` workspace member,
/// used when no remote backend (e.g. `simples3::S3Storage`) is configured.
/// File I/O here is synchronous; `get`/`put` never block long enough to
/// justify `spawn_blocking` at the cache sizes this proxy handles.
pub struct LocalDiskStorage {
    cache: parking_lot::Mutex<lru_disk_cache::LruDiskCache>,
}

impl LocalDiskStorage {
    pub fn new(root: impl AsRef<std::path::Path>, capacity_bytes: u64) -> Result<Self> {
        let cache = lru_disk_cache::LruDiskCache::new(root, capacity_bytes)
            .map_err(|e| crate::errors::ProxyError::Internal(e.to_string()))?;
        Ok(LocalDiskStorage { cache: parking_lot::Mutex::new(cache) })
    }
}

#[async_trait]
impl Storage for LocalDiskStorage {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.cache
            .lock()
            .get(key)
            .map_err(|e| crate::errors::ProxyError::Internal(e.to_string()))
    }

    async fn put(&self, key: &str, data: Vec<u8>) -> Result<()> {
        self.cache
            .lock()
            .insert_bytes(key, &data)
            .map_err(|e| crate::errors::ProxyError::Internal(e.to_string()))
    }

    fn describe(&self) -> String {
        let cache = self.cache.lock();
        format!("{} entries, {}/{} bytes", cache.len(), cache.size(), cache.capacity())
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::HashMap;

    /// In-memory `Storage` used by C3/C5 unit tests; never a production
    /// backend.
    #[derive(Default)]
    pub struct MemoryStorage {
        map: Mutex<HashMap<String, Vec<u8>>>,
    }

    #[async_trait]
    impl Storage for MemoryStorage {
        async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
            Ok(self.map.lock().get(key).cloned())
        }

        async fn put(&self, key: &str, data: Vec<u8>) -> Result<()> {
            self.map.lock().insert(key.to_string(), data);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::MemoryStorage;
    use super::*;

    #[tokio::test]
    async fn round_trips_through_memory_storage() {
        let storage = MemoryStorage::default();
        assert!(storage.get("missing").await.unwrap().is_none());
        storage.put("k", b"v".to_vec()).await.unwrap();
        assert_eq!(storage.get("k").await.unwrap(), Some(b"v".to_vec()));
    }

    #[tokio::test]
    async fn round_trips_through_local_disk_storage() {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalDiskStorage::new(dir.path(), 1024 * 1024).unwrap();
        assert!(storage.get("missing").await.unwrap().is_none());
        storage.put("k", b"v".to_vec()).await.unwrap();
        assert_eq!(storage.get("k").await.unwrap(), Some(b"v".to_vec()));
    }
}
