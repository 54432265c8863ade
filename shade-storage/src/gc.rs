//! Garbage collection: reclaims manifests superseded by a
//! newer version of the same file, then any chunk no longer referenced
//! by what's left. Two independent safety guards keep a misconfigured
//! run from sweeping a backend nearly empty.

use std::collections::{HashMap, HashSet};

use futures::StreamExt;
use rsa::RsaPrivateKey;
use serde::Serialize;
use tracing::warn;

use crate::backend::BackendRef;
use crate::crypto;
use crate::error::{Error, Result};
use crate::model::{Digest, File};

/// Defaults cap a run at 100 files/chunks released without an explicit
/// override.
#[derive(Debug, Clone, Copy)]
pub struct GcOptions {
    pub max_files_delete: usize,
    pub max_chunks_delete: usize,
}

impl Default for GcOptions {
    fn default() -> Self {
        GcOptions {
            max_files_delete: 100,
            max_chunks_delete: 100,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct GcReport {
    pub manifests_scanned: usize,
    pub manifests_released: usize,
    pub chunks_scanned: usize,
    pub chunks_released: usize,
}

/// Runs one GC pass against `backend`. `private_key` is required only to
/// confirm the caller can actually decrypt manifests behind an Encrypt
/// layer; if a live manifest turns out to carry an `AesKey` and no key
/// was supplied, this aborts with `Error::KeyUnavailable` rather than
/// under-collecting — the
/// Encrypt backend itself has already done the decryption by the time
/// `get_manifest` returns here, so `private_key` is a readiness check,
/// not an input to any cryptographic step in this function.
pub async fn run(backend: &BackendRef, private_key: Option<&RsaPrivateKey>, opts: GcOptions) -> Result<GcReport> {
    let digests = backend.list_manifests().await?;

    let mut by_name: HashMap<String, Vec<(Digest, File)>> = HashMap::new();
    let mut manifests_scanned = 0usize;

    for digest in &digests {
        match backend.get_manifest(digest).await {
            Ok(bytes) => match File::from_json(&bytes) {
                Ok(file) => {
                    manifests_scanned += 1;
                    by_name.entry(file.filename.clone()).or_default().push((digest.clone(), file));
                }
                Err(e) => warn!(digest = %digest, error = %e, "gc: skipping unparsable manifest"),
            },
            Err(e) => warn!(digest = %digest, error = %e, "gc: failed to fetch manifest"),
        }
    }

    let mut live: Vec<(Digest, File)> = Vec::new();
    let mut obsolete: Vec<Digest> = Vec::new();

    for versions in by_name.into_values() {
        let mut versions = versions;
        versions.sort_by(|a, b| a.1.modified_time.cmp(&b.1.modified_time));
        // The newest manifest by ModifiedTime is kept regardless of
        // whether it's a tombstone: releasing a tombstone ahead of the
        // data it supersedes would let a later refresh see only the
        // older, still-present manifest and resurrect a deleted file. A
        // kept tombstone naturally contributes no live chunk addresses
        // since its chunk list is empty.
        let newest_idx = versions.len() - 1;
        for (idx, (digest, file)) in versions.into_iter().enumerate() {
            if idx == newest_idx {
                live.push((digest, file));
            } else {
                obsolete.push(digest);
            }
        }
    }

    if obsolete.len() > live.len() {
        return Err(Error::QuotaExceeded(format!(
            "obsolete manifest count {} exceeds live manifest count {}, aborting",
            obsolete.len(),
            live.len()
        )));
    }
    if obsolete.len() > opts.max_files_delete {
        return Err(Error::QuotaExceeded(format!(
            "obsolete manifest count {} exceeds max_files_delete {}",
            obsolete.len(),
            opts.max_files_delete
        )));
    }

    for digest in &obsolete {
        backend.release_manifest(digest).await?;
    }

    let mut live_chunk_addresses: HashSet<Digest> = HashSet::new();
    for (_digest, file) in &live {
        for entry in &file.chunks {
            match &file.aes_key {
                Some(key) => {
                    let nonce = entry
                        .nonce
                        .ok_or_else(|| Error::Invariant(format!("encrypted chunk entry {} missing Nonce", entry.index)))?;
                    if private_key.is_none() {
                        return Err(Error::KeyUnavailable);
                    }
                    live_chunk_addresses.insert(crypto::encrypt_digest(key, &nonce, &entry.sha256)?);
                }
                None => {
                    live_chunk_addresses.insert(entry.sha256.clone());
                }
            }
        }
    }

    let mut chunk_stream = backend.list_chunks();
    let mut chunks_scanned = 0usize;
    let mut unreferenced: Vec<Digest> = Vec::new();
    while let Some(next) = chunk_stream.next().await {
        match next {
            Ok(digest) => {
                chunks_scanned += 1;
                if !live_chunk_addresses.contains(&digest) {
                    unreferenced.push(digest);
                }
            }
            Err(e) => warn!(error = %e, "gc: list_chunks stream error"),
        }
    }

    if unreferenced.len() > opts.max_chunks_delete {
        return Err(Error::QuotaExceeded(format!(
            "unreferenced chunk count {} exceeds max_chunks_delete {}",
            unreferenced.len(),
            opts.max_chunks_delete
        )));
    }

    for digest in &unreferenced {
        backend.release_chunk(digest).await?;
    }

    Ok(GcReport {
        manifests_scanned,
        manifests_released: obsolete.len(),
        chunks_scanned,
        chunks_released: unreferenced.len(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::MemoryBackend;
    use crate::backend::{Backend, FileHint};
    use crate::model::{ChunkEntry, Timestamp};
    use std::sync::Arc;

    async fn publish(backend: &BackendRef, file: &File) -> Digest {
        let bytes = file.to_json().unwrap();
        let digest = crypto::sha256(&bytes);
        backend.put_manifest(&digest, &bytes).await.unwrap();
        digest
    }

    #[tokio::test]
    async fn releases_superseded_manifest_and_its_orphaned_chunk() {
        let backend: BackendRef = Arc::new(MemoryBackend::default());

        let mut old = File::empty("f".into(), 8);
        old.modified_time = Timestamp(1);
        let old_chunk = b"old chunk".to_vec();
        let old_digest = crypto::sha256(&old_chunk);
        backend.put_chunk(&old_digest, &old_chunk, &FileHint::none()).await.unwrap();
        old.chunks.push(ChunkEntry::new(0, old_digest.clone()));
        old.last_chunksize = old_chunk.len() as u64;
        old.recompute_filesize();
        publish(&backend, &old).await;

        let mut new = File::empty("f".into(), 8);
        new.modified_time = Timestamp(2);
        let new_chunk = b"new chunk".to_vec();
        let new_digest = crypto::sha256(&new_chunk);
        backend.put_chunk(&new_digest, &new_chunk, &FileHint::none()).await.unwrap();
        new.chunks.push(ChunkEntry::new(0, new_digest.clone()));
        new.last_chunksize = new_chunk.len() as u64;
        new.recompute_filesize();
        publish(&backend, &new).await;

        let report = run(&backend, None, GcOptions::default()).await.unwrap();
        assert_eq!(report.manifests_released, 1);
        assert_eq!(report.chunks_released, 1);

        assert!(backend.get_chunk(&old_digest, &FileHint::none()).await.is_err());
        assert!(backend.get_chunk(&new_digest, &FileHint::none()).await.is_ok());
    }

    #[tokio::test]
    async fn tombstone_outranks_older_live_manifest_and_is_not_released() {
        let backend: BackendRef = Arc::new(MemoryBackend::default());

        let mut old = File::empty("f".into(), 8);
        old.modified_time = Timestamp(1);
        let chunk = b"old chunk".to_vec();
        let chunk_digest = crypto::sha256(&chunk);
        backend.put_chunk(&chunk_digest, &chunk, &FileHint::none()).await.unwrap();
        old.chunks.push(ChunkEntry::new(0, chunk_digest.clone()));
        old.last_chunksize = chunk.len() as u64;
        old.recompute_filesize();
        let old_digest = publish(&backend, &old).await;

        let tombstone = File::tombstone("f".into(), Timestamp(2));
        let tombstone_digest = publish(&backend, &tombstone).await;

        let report = run(&backend, None, GcOptions::default()).await.unwrap();
        assert_eq!(report.manifests_released, 1);
        assert_eq!(report.chunks_released, 1);

        assert!(backend.get_manifest(&old_digest).await.is_err());
        assert!(backend.get_manifest(&tombstone_digest).await.is_ok());
        assert!(backend.get_chunk(&chunk_digest, &FileHint::none()).await.is_err());

        let tree = crate::tree::Tree::new(backend.clone());
        tree.refresh().await.unwrap();
        assert!(tree.node_by_path("f").is_err(), "file must stay deleted, not resurrect as the older live manifest");
    }

    #[tokio::test]
    async fn aborts_when_obsolete_outnumbers_live() {
        let backend: BackendRef = Arc::new(MemoryBackend::default());
        for t in 1..=5 {
            let mut file = File::empty("only".into(), 8);
            file.modified_time = Timestamp(t);
            publish(&backend, &file).await;
        }
        let err = run(&backend, None, GcOptions::default()).await.unwrap_err();
        assert!(matches!(err, Error::QuotaExceeded(_)));
    }

    #[tokio::test]
    async fn aborts_without_private_key_when_live_file_is_encrypted() {
        let backend: BackendRef = Arc::new(MemoryBackend::default());
        let mut file = File::empty("secret".into(), 8);
        file.aes_key = Some([7u8; 32]);
        file.chunks.push(ChunkEntry {
            index: 0,
            sha256: crypto::sha256(b"plain"),
            nonce: Some([1u8; 12]),
        });
        publish(&backend, &file).await;

        let err = run(&backend, None, GcOptions::default()).await.unwrap_err();
        assert!(matches!(err, Error::KeyUnavailable));
    }
}
