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

//! C3 File-Blob Service Client (spec.md §3, §4.3).
//!
//! Grounded on the teacher's `cache::Storage` trait (a single `get`/`put`
//! byte-blob abstraction) generalized into the chunked blob type and the
//! batched upload/download pipeline the spec requires.

pub mod client;
pub mod sink;
pub mod storage;

use sha2::{Digest, Sha256};

use crate::errors::{ProxyError, Result};

/// 2 MiB -- files larger than this are split into `FILE_CHUNK`s described
/// by one `FILE_META` (spec.md §3).
pub const CHUNK_SIZE: usize = 2 * 1024 * 1024;

/// Chunks per outgoing batched RPC (spec.md §4.3).
pub const CHUNKS_PER_CALL: usize = 5;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileBlob {
    File { content: Vec<u8> },
    FileMeta { file_size: i64, hash_keys: Vec<String> },
    FileChunk { content: Vec<u8>, offset: u64 },
}

impl FileBlob {
    /// The canonical "open failed" marker (spec.md §3): a negative
    /// `file_size` with no content. Must never be sent; callers construct
    /// it only to short-circuit an upload locally.
    pub fn open_failed_marker() -> OpenFailedMarker {
        OpenFailedMarker
    }

    pub fn file_size(&self) -> i64 {
        match self {
            FileBlob::File { content } => content.len() as i64,
            FileBlob::FileMeta { file_size, .. } => *file_size,
            FileBlob::FileChunk { content, .. } => content.len() as i64,
        }
    }

    /// Validity rules from spec.md §3.
    pub fn validate(&self) -> Result<()> {
        match self {
            FileBlob::File { .. } => Ok(()),
            FileBlob::FileMeta { hash_keys, file_size } => {
                if hash_keys.len() < 2 {
                    return Err(ProxyError::InvalidBlob(
                        "FILE_META must list at least 2 hash_keys".into(),
                    ));
                }
                if *file_size < 0 {
                    return Err(ProxyError::InvalidBlob(
                        "FILE_META must not carry the open-failed marker size".into(),
                    ));
                }
                Ok(())
            }
            FileBlob::FileChunk { content, .. } => {
                if content.is_empty() {
                    return Err(ProxyError::InvalidBlob("FILE_CHUNK must carry content".into()));
                }
                Ok(())
            }
        }
    }

    /// Canonical serialization used for hashing: a tagged, length-prefixed
    /// encoding, stable across process restarts (unlike e.g. a HashMap
    /// iteration order).
    pub fn canonical_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        match self {
            FileBlob::File { content } => {
                out.push(0u8);
                out.extend_from_slice(&(content.len() as u64).to_le_bytes());
                out.extend_from_slice(content);
            }
            FileBlob::FileMeta { file_size, hash_keys } => {
                out.push(1u8);
                out.extend_from_slice(&file_size.to_le_bytes());
                out.extend_from_slice(&(hash_keys.len() as u64).to_le_bytes());
                for k in hash_keys {
                    out.extend_from_slice(&(k.len() as u64).to_le_bytes());
                    out.extend_from_slice(k.as_bytes());
                }
            }
            FileBlob::FileChunk { content, offset } => {
                out.push(2u8);
                out.extend_from_slice(&offset.to_le_bytes());
                out.extend_from_slice(&(content.len() as u64).to_le_bytes());
                out.extend_from_slice(content);
            }
        }
        out
    }

    /// `SHA256(serialize(blob))`, lowercase hex (spec.md §6 "Wire blobs").
    pub fn hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.canonical_bytes());
        hex::encode(hasher.finalize())
    }

    /// Encode into the `proto::FileBlob` wire message (spec.md §6).
    pub fn to_wire(&self) -> crate::proto::FileBlob {
        use crate::proto::file_blob::Type;
        match self {
            FileBlob::File { content } => crate::proto::FileBlob {
                r#type: Type::File as i32,
                content: content.clone(),
                file_size: self.file_size(),
                ..Default::default()
            },
            FileBlob::FileMeta { file_size, hash_keys } => crate::proto::FileBlob {
                r#type: Type::FileMeta as i32,
                file_size: *file_size,
                hash_key: hash_keys.clone(),
                ..Default::default()
            },
            FileBlob::FileChunk { content, offset } => crate::proto::FileBlob {
                r#type: Type::FileChunk as i32,
                content: content.clone(),
                file_size: self.file_size(),
                offset: *offset,
                ..Default::default()
            },
        }
    }

    /// Decode from the `proto::FileBlob` wire message.
    pub fn from_wire(wire: crate::proto::FileBlob) -> Result<FileBlob> {
        use crate::proto::file_blob::Type;
        let ty = Type::try_from(wire.r#type)
            .map_err(|_| ProxyError::InvalidBlob(format!("unknown FileBlob type tag {}", wire.r#type)))?;
        let blob = match ty {
            Type::File => FileBlob::File { content: wire.content },
            Type::FileMeta => FileBlob::FileMeta { file_size: wire.file_size, hash_keys: wire.hash_key },
            Type::FileChunk => FileBlob::FileChunk { content: wire.content, offset: wire.offset },
        };
        blob.validate()?;
        Ok(blob)
    }
}

/// Marker type documenting the "open failed" sentinel from spec.md §3: a
/// `FileBlob` is never actually constructed for it, since it must never be
/// sent; callers match on `Err` from a failed file read instead.
pub struct OpenFailedMarker;

/// Split `data` into one `FILE` blob (if `<= CHUNK_SIZE`) or a `FILE_META`
/// plus its ordered `FILE_CHUNK`s.
pub fn chunk_file(data: &[u8]) -> (FileBlob, Vec<FileBlob>) {
    if data.len() <= CHUNK_SIZE {
        return (FileBlob::File { content: data.to_vec() }, Vec::new());
    }
    let mut chunks = Vec::new();
    let mut hash_keys = Vec::new();
    let mut offset = 0u64;
    for piece in data.chunks(CHUNK_SIZE) {
        let chunk = FileBlob::FileChunk { content: piece.to_vec(), offset };
        hash_keys.push(chunk.hash());
        chunks.push(chunk);
        offset += piece.len() as u64;
    }
    let meta = FileBlob::FileMeta { file_size: data.len() as i64, hash_keys };
    (meta, chunks)
}

/// An outgoing or incoming batch of up to [`CHUNKS_PER_CALL`] blobs, one
/// per `StoreFile`/`LookupFile` RPC, run with a two-inflight pipeline (spec
/// §4.3): at most one request in flight while the next is assembled.
pub struct TwoInflightPipeline;

impl TwoInflightPipeline {
    /// Partition `items` into batches of [`CHUNKS_PER_CALL`] for the
    /// caller to dispatch with at most two in flight at once.
    pub fn batches<T: Clone>(items: &[T]) -> Vec<Vec<T>> {
        items.chunks(CHUNKS_PER_CALL).map(|c| c.to_vec()).collect()
    }

    /// Dispatch `batches` through `send`, keeping at most two RPCs in
    /// flight at once: batch *N* is spawned before batch *N-1*'s result is
    /// awaited, so the last `send` call waits on both its own request and
    /// whichever one was still outstanding when it was issued (spec.md
    /// §4.3 "two-inflight pipeline"). Any batch failing fails the whole
    /// upload/download -- no partial claim is returned.
    pub async fn run<T, R, F, Fut>(batches: Vec<Vec<T>>, send: F) -> Result<Vec<R>>
    where
        T: Send + 'static,
        R: Send + 'static,
        F: Fn(Vec<T>) -> Fut,
        Fut: std::future::Future<Output = Result<R>> + Send + 'static,
    {
        let mut results = Vec::with_capacity(batches.len());
        let mut inflight: Option<tokio::task::JoinHandle<Result<R>>> = None;
        for batch in batches {
            let next = tokio::spawn(send(batch));
            if let Some(prev) = inflight.replace(next) {
                results.push(join_one(prev).await?);
            }
        }
        if let Some(last) = inflight {
            results.push(join_one(last).await?);
        }
        Ok(results)
    }
}

async fn join_one<R>(handle: tokio::task::JoinHandle<Result<R>>) -> Result<R> {
    match handle.await {
        Ok(result) => result,
        Err(e) => Err(ProxyError::Internal(format!("blob pipeline task panicked: {e}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_file_is_one_file_blob() {
        let data = vec![0u8; CHUNK_SIZE];
        let (meta, chunks) = chunk_file(&data);
        assert!(matches!(meta, FileBlob::File { .. }));
        assert!(chunks.is_empty());
    }

    #[test]
    fn one_byte_over_chunk_size_splits_into_two_chunks() {
        let data = vec![0u8; CHUNK_SIZE + 1];
        let (meta, chunks) = chunk_file(&data);
        match meta {
            FileBlob::FileMeta { hash_keys, file_size } => {
                assert_eq!(hash_keys.len(), 2);
                assert_eq!(file_size, (CHUNK_SIZE + 1) as i64);
            }
            _ => panic!("expected FileMeta"),
        }
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].file_size(), CHUNK_SIZE as i64);
        assert_eq!(chunks[1].file_size(), 1);
    }

    #[test]
    fn five_mib_file_chunks_into_three_pieces() {
        let data = vec![7u8; 5 * 1024 * 1024];
        let (meta, chunks) = chunk_file(&data);
        assert_eq!(chunks.len(), 3);
        let total: i64 = chunks.iter().map(|c| c.file_size()).sum();
        assert_eq!(total, data.len() as i64);
        match meta {
            FileBlob::FileMeta { hash_keys, .. } => assert_eq!(hash_keys.len(), 3),
            _ => panic!("expected FileMeta"),
        }
    }

    #[test]
    fn hash_is_stable_for_identical_content() {
        let a = FileBlob::File { content: b"hello".to_vec() };
        let b = FileBlob::File { content: b"hello".to_vec() };
        assert_eq!(a.hash(), b.hash());
    }

    #[test]
    fn file_meta_requires_at_least_two_hash_keys() {
        let bad = FileBlob::FileMeta { file_size: 10, hash_keys: vec!["only-one".into()] };
        assert!(bad.validate().is_err());
        let good = FileBlob::FileMeta {
            file_size: 10,
            hash_keys: vec!["a".into(), "b".into()],
        };
        assert!(good.validate().is_ok());
    }

    #[test]
    fn file_chunk_requires_content() {
        let bad = FileBlob::FileChunk { content: Vec::new(), offset: 0 };
        assert!(bad.validate().is_err());
    }

    #[test]
    fn batching_splits_five_per_call() {
        let items: Vec<u32> = (0..12).collect();
        let batches = TwoInflightPipeline::batches(&items);
        assert_eq!(batches.len(), 3);
        assert_eq!(batches[0].len(), 5);
        assert_eq!(batches[2].len(), 2);
    }

    #[test]
    fn wire_round_trip_preserves_each_variant() {
        let file = FileBlob::File { content: b"hi".to_vec() };
        assert_eq!(FileBlob::from_wire(file.to_wire()).unwrap(), file);

        let chunk = FileBlob::FileChunk { content: b"chunk".to_vec(), offset: 4 };
        assert_eq!(FileBlob::from_wire(chunk.to_wire()).unwrap(), chunk);

        let meta = FileBlob::FileMeta { file_size: 10, hash_keys: vec!["a".into(), "b".into()] };
        assert_eq!(FileBlob::from_wire(meta.to_wire()).unwrap(), meta);
    }

    #[tokio::test]
    async fn two_inflight_pipeline_runs_every_batch_in_order() {
        let items: Vec<u32> = (0..12).collect();
        let batches = TwoInflightPipeline::batches(&items);
        let results = TwoInflightPipeline::run(batches, |batch: Vec<u32>| async move {
            Ok::<u32, ProxyError>(batch.iter().sum())
        })
        .await
        .unwrap();
        assert_eq!(results, vec![0 + 1 + 2 + 3 + 4, 5 + 6 + 7 + 8 + 9, 10 + 11]);
    }

    #[tokio::test]
    async fn two_inflight_pipeline_fails_the_whole_run_on_one_bad_batch() {
        let items: Vec<u32> = (0..10).collect();
        let batches = TwoInflightPipeline::batches(&items);
        let result = TwoInflightPipeline::run(batches, |batch: Vec<u32>| async move {
            if batch.contains(&7) {
                Err(ProxyError::Rpc("simulated failure".into()))
            } else {
                Ok::<u32, ProxyError>(batch.iter().sum())
            }
        })
        .await;
        assert!(result.is_err());
    }
}
