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

//! C3 operations (spec.md §4.3): `CreateFileBlob`/`StoreFileBlob`/
//! `GetFileBlob`/`OutputFileBlob` and their vector forms, dispatched over
//! the remote RPC client (C5) through the two-inflight pipeline, with a
//! local `Storage` (C3) used only to dedup re-uploads of already-known
//! content. Grounded on the teacher's `cache::Storage::get`/`put` call
//! sites in `compiler.rs`'s "get or upload" pattern, generalized to the
//! chunked/batched transfer the spec requires.

use std::path::Path;
use std::sync::Arc;

use log::warn;

use super::sink::Sink;
use super::storage::Storage;
use super::{FileBlob, TwoInflightPipeline};
use crate::errors::{ProxyError, Result};
use crate::stats::CounterTable;

pub struct FileBlobClient {
    storage: Arc<dyn Storage>,
    rpc: Arc<crate::rpc::RpcClient>,
    stats: Arc<CounterTable>,
}

impl FileBlobClient {
    pub fn new(storage: Arc<dyn Storage>, rpc: Arc<crate::rpc::RpcClient>, stats: Arc<CounterTable>) -> Arc<Self> {
        Arc::new(FileBlobClient { storage, rpc, stats })
    }

    /// Read `path` and split it into a top-level blob (`FILE` or
    /// `FILE_META`) plus its `FILE_CHUNK`s, if any (spec.md §4.3
    /// `CreateFileBlob`). An open/read failure is the "open failed
    /// marker" case from spec.md §3: it never becomes a `FileBlob`, the
    /// caller sees the `Err` directly.
    pub fn create_file_blob(&self, path: &Path) -> Result<(FileBlob, Vec<FileBlob>)> {
        let data = std::fs::read(path)?;
        Ok(super::chunk_file(&data))
    }

    /// Store `blobs` through `StoreFile`, skipping any hash already present
    /// in the local `Storage` dedup cache. Any chunk failure fails the
    /// whole call with no partial claim (spec.md §4.3).
    pub async fn store_file_blobs(self: &Arc<Self>, blobs: Vec<FileBlob>) -> Result<Vec<String>> {
        let mut hashes = Vec::with_capacity(blobs.len());
        let mut to_upload = Vec::new();
        for blob in blobs {
            blob.validate()?;
            let hash = blob.hash();
            if self.storage.get(&hash).await?.is_none() {
                to_upload.push((hash.clone(), blob));
            }
            hashes.push(hash);
        }

        let batches = TwoInflightPipeline::batches(&to_upload);
        let this = self.clone();
        let stored_batches = TwoInflightPipeline::run(batches, move |batch| {
            let this = this.clone();
            async move { this.store_batch(batch).await }
        })
        .await;

        match stored_batches {
            Ok(_) => Ok(hashes),
            Err(e) => {
                CounterTable::inc(&self.stats.num_file_upload_failure);
                Err(e)
            }
        }
    }

    async fn store_batch(&self, batch: Vec<(String, FileBlob)>) -> Result<()> {
        let req = crate::proto::StoreFileReq {
            blob: batch.iter().map(|(_, b)| b.to_wire()).collect(),
        };
        let mut buf = Vec::new();
        prost::Message::encode(&req, &mut buf).map_err(|e| ProxyError::Internal(e.to_string()))?;
        let (bytes, status) = self.rpc.call("POST", "/storefile", buf).await;
        if !status.is_ok() {
            return Err(ProxyError::Rpc(format!("StoreFile failed: {}", status.err_message)));
        }
        let _resp: crate::proto::StoreFileResp =
            prost::Message::decode(bytes.as_slice()).map_err(|e| ProxyError::Internal(e.to_string()))?;
        for (hash, blob) in &batch {
            self.storage.put(hash, blob.canonical_bytes()).await?;
            CounterTable::inc(&self.stats.num_file_uploaded);
        }
        Ok(())
    }

    /// Fetch `hashes` through `LookupFile` (spec.md §4.3 `GetFileBlob`).
    /// Always goes to the backend -- there's no decoder back from the
    /// dedup cache's `canonical_bytes` into a typed `FileBlob`, so reads
    /// don't consult `Storage` (see DESIGN.md).
    pub async fn get_file_blobs(self: &Arc<Self>, hashes: Vec<String>) -> Result<Vec<FileBlob>> {
        let batches = TwoInflightPipeline::batches(&hashes);
        let this = self.clone();
        let fetched = TwoInflightPipeline::run(batches, move |batch| {
            let this = this.clone();
            async move { this.lookup_batch(batch).await }
        })
        .await;

        match fetched {
            Ok(batches) => Ok(batches.into_iter().flatten().collect()),
            Err(e) => {
                CounterTable::inc(&self.stats.num_file_download_failure);
                Err(e)
            }
        }
    }

    async fn lookup_batch(&self, batch: Vec<String>) -> Result<Vec<FileBlob>> {
        let req = crate::proto::LookupFileReq { hash_key: batch.clone() };
        let mut buf = Vec::new();
        prost::Message::encode(&req, &mut buf).map_err(|e| ProxyError::Internal(e.to_string()))?;
        let (bytes, status) = self.rpc.call("POST", "/lookupfile", buf).await;
        if !status.is_ok() {
            return Err(ProxyError::Rpc(format!("LookupFile failed: {}", status.err_message)));
        }
        let resp: crate::proto::LookupFileResp =
            prost::Message::decode(bytes.as_slice()).map_err(|e| ProxyError::Internal(e.to_string()))?;
        if resp.blob.len() != batch.len() {
            return Err(ProxyError::InvalidBlob(format!(
                "LookupFile returned {} blobs for {} requested hashes",
                resp.blob.len(),
                batch.len()
            )));
        }
        let mut out = Vec::with_capacity(resp.blob.len());
        for wire in resp.blob {
            let is_meta = wire.r#type == crate::proto::file_blob::Type::FileMeta as i32;
            if !is_meta && wire.content.is_empty() {
                // A FILE/FILE_CHUNK with no content is a lookup miss
                // (spec.md §4.3); FILE_META naturally carries none.
                return Err(ProxyError::InvalidBlob("LookupFile miss: empty content".into()));
            }
            out.push(FileBlob::from_wire(wire)?);
        }
        Ok(out)
    }

    /// Write `blob` into `sink` (spec.md §4.3 `OutputFileBlob`): a `FILE`
    /// or `FILE_CHUNK` writes its own content; a `FILE_META` downloads its
    /// chunks through [`Self::get_file_blobs`] first, writing each at its
    /// declared offset.
    pub async fn output_file_blob(self: &Arc<Self>, blob: FileBlob, mut sink: Box<dyn Sink>) -> Result<()> {
        let result = self.write_blob_into(&blob, sink.as_mut()).await;
        match result {
            Ok(()) => {
                sink.finish()?;
                CounterTable::inc(&self.stats.num_file_output);
                Ok(())
            }
            Err(e) => {
                sink.abort();
                Err(e)
            }
        }
    }

    async fn write_blob_into(self: &Arc<Self>, blob: &FileBlob, sink: &mut dyn Sink) -> Result<()> {
        match blob {
            FileBlob::File { content } => sink.write_at(0, content),
            FileBlob::FileChunk { content, offset } => sink.write_at(*offset, content),
            FileBlob::FileMeta { hash_keys, .. } => {
                let chunks = self.get_file_blobs(hash_keys.clone()).await?;
                for chunk in chunks {
                    match chunk {
                        FileBlob::FileChunk { content, offset } => sink.write_at(offset, &content)?,
                        _ => return Err(ProxyError::InvalidBlob("FILE_META resolved to a non-chunk blob".into())),
                    }
                }
                Ok(())
            }
        }
    }

    /// Upload `path` end to end: chunk it, store every chunk (if any) then
    /// the top-level blob, returning the hash to embed into
    /// `ExecReq::input_hash_keys`.
    pub async fn upload_file(self: &Arc<Self>, path: &Path) -> Result<String> {
        let (top, chunks) = self.create_file_blob(path)?;
        if !chunks.is_empty() {
            self.store_file_blobs(chunks).await?;
        }
        let hashes = self.store_file_blobs(vec![top]).await?;
        hashes.into_iter().next().ok_or_else(|| ProxyError::Internal("upload produced no hash".into()))
    }

    /// Download `blob` straight to `dest` on disk.
    pub async fn download_file(self: &Arc<Self>, blob: FileBlob, dest: &Path) -> Result<()> {
        let sink: Box<dyn Sink> = Box::new(super::sink::FileSink::create(dest)?);
        if let Err(e) = self.output_file_blob(blob, sink).await {
            warn!("download to {} failed: {}", dest.display(), e);
            return Err(e);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::sink::MemorySink;
    use crate::blob::storage::test_support::MemoryStorage;

    fn client() -> Arc<FileBlobClient> {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::default());
        let auth = crate::rpc::auth::AuthMethod::select(None, None, None);
        let rpc = Arc::new(crate::rpc::RpcClient::new(&crate::config::Config::default(), auth));
        FileBlobClient::new(storage, rpc, Arc::new(CounterTable::default()))
    }

    #[test]
    fn create_file_blob_reads_and_chunks_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("input.c");
        std::fs::write(&path, b"int main() {}").unwrap();
        let client = client();
        let (blob, chunks) = client.create_file_blob(&path).unwrap();
        assert!(matches!(blob, FileBlob::File { .. }));
        assert!(chunks.is_empty());
    }

    #[test]
    fn create_file_blob_propagates_read_errors() {
        let client = client();
        let result = client.create_file_blob(Path::new("/nonexistent/path/does/not/exist.c"));
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn output_file_blob_writes_a_plain_file_directly() {
        let client = client();
        let blob = FileBlob::File { content: b"hello".to_vec() };
        let sink = Box::new(MemorySink::new());
        client.output_file_blob(blob, sink).await.unwrap();
    }
}
