//! In-RAM backend: an LRU-bounded manifest cache (bounded
//! by count) and an LRU-bounded chunk cache (bounded by total payload
//! bytes). Neither namespace survives process restart.

use std::collections::HashSet;
use std::num::NonZeroUsize;

use async_trait::async_trait;
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use lru::LruCache;
use parking_lot::Mutex;

use super::{Backend, Describe, FileHint};
use crate::error::{Error, Result};
use crate::metrics;
use crate::model::Digest;

pub const DEFAULT_MAX_MANIFESTS: usize = 50_000;
pub const DEFAULT_MAX_CHUNK_BYTES: u64 = 1024 * 1024 * 1024;

struct ByteBoundedCache {
    entries: LruCache<Digest, Vec<u8>>,
    used_bytes: u64,
    max_bytes: u64,
}

impl ByteBoundedCache {
    fn new(max_bytes: u64) -> Self {
        ByteBoundedCache {
            // Unbounded by count; we enforce the byte budget ourselves.
            entries: LruCache::unbounded(),
            used_bytes: 0,
            max_bytes,
        }
    }

    fn get(&mut self, digest: &Digest) -> Option<Vec<u8>> {
        self.entries.get(digest).cloned()
    }

    fn put(&mut self, digest: Digest, bytes: Vec<u8>) {
        if let Some(old) = self.entries.put(digest.clone(), bytes.clone()) {
            self.used_bytes = self.used_bytes.saturating_sub(old.len() as u64);
        }
        self.used_bytes += bytes.len() as u64;

        while self.used_bytes > self.max_bytes {
            match self.entries.pop_lru() {
                Some((_, evicted)) => {
                    self.used_bytes = self.used_bytes.saturating_sub(evicted.len() as u64);
                }
                None => break,
            }
        }
    }

    fn remove(&mut self, digest: &Digest) {
        if let Some(v) = self.entries.pop(digest) {
            self.used_bytes = self.used_bytes.saturating_sub(v.len() as u64);
        }
    }

    fn keys(&self) -> Vec<Digest> {
        self.entries.iter().map(|(k, _)| k.clone()).collect()
    }
}

pub struct MemoryBackend {
    manifests: Mutex<LruCache<Digest, Vec<u8>>>,
    chunks: Mutex<ByteBoundedCache>,
}

impl MemoryBackend {
    pub fn new(max_manifests: usize, max_chunk_bytes: u64) -> Self {
        let capacity = NonZeroUsize::new(max_manifests.max(1)).unwrap();
        MemoryBackend {
            manifests: Mutex::new(LruCache::new(capacity)),
            chunks: Mutex::new(ByteBoundedCache::new(max_chunk_bytes)),
        }
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        MemoryBackend::new(DEFAULT_MAX_MANIFESTS, DEFAULT_MAX_CHUNK_BYTES)
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn list_manifests(&self) -> Result<HashSet<Digest>> {
        metrics::record_request("list", "memory", "manifest");
        let manifests = self.manifests.lock();
        Ok(manifests.iter().map(|(k, _)| k.clone()).collect())
    }

    async fn get_manifest(&self, digest: &Digest) -> Result<Vec<u8>> {
        metrics::record_request("get", "memory", "manifest");
        let mut manifests = self.manifests.lock();
        match manifests.get(digest) {
            // Copy-on-get: callers may freely mutate the returned buffer.
            Some(bytes) => Ok(bytes.clone()),
            None => {
                metrics::record_not_found("memory", "manifest");
                Err(Error::NotFound(digest.to_hex()))
            }
        }
    }

    async fn put_manifest(&self, digest: &Digest, bytes: &[u8]) -> Result<()> {
        super::verify_content_address(digest, bytes)?;
        self.put_manifest_raw(digest, bytes).await
    }

    async fn put_manifest_raw(&self, digest: &Digest, bytes: &[u8]) -> Result<()> {
        metrics::record_request("put", "memory", "manifest");
        let mut manifests = self.manifests.lock();
        manifests.put(digest.clone(), bytes.to_vec());
        Ok(())
    }

    async fn release_manifest(&self, digest: &Digest) -> Result<()> {
        let mut manifests = self.manifests.lock();
        manifests.pop(digest);
        Ok(())
    }

    async fn get_chunk(&self, digest: &Digest, _hint: &FileHint) -> Result<Vec<u8>> {
        metrics::record_request("get", "memory", "chunk");
        let mut chunks = self.chunks.lock();
        match chunks.get(digest) {
            Some(bytes) => {
                metrics::record_chunk_fetch("memory");
                Ok(bytes)
            }
            None => {
                metrics::record_not_found("memory", "chunk");
                Err(Error::NotFound(digest.to_hex()))
            }
        }
    }

    async fn put_chunk(&self, digest: &Digest, bytes: &[u8], hint: &FileHint) -> Result<()> {
        super::verify_content_address(digest, bytes)?;
        self.put_chunk_raw(digest, bytes, hint).await
    }

    async fn put_chunk_raw(&self, digest: &Digest, bytes: &[u8], _hint: &FileHint) -> Result<()> {
        metrics::record_request("put", "memory", "chunk");
        let mut chunks = self.chunks.lock();
        chunks.put(digest.clone(), bytes.to_vec());
        Ok(())
    }

    async fn release_chunk(&self, digest: &Digest) -> Result<()> {
        let mut chunks = self.chunks.lock();
        chunks.remove(digest);
        Ok(())
    }

    fn list_chunks(&self) -> BoxStream<'static, Result<Digest>> {
        let keys = self.chunks.lock().keys();
        stream::iter(keys.into_iter().map(Ok)).boxed()
    }

    fn describe(&self) -> Describe {
        Describe {
            name: "memory".into(),
            local: true,
            persistent: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::sha256;

    #[tokio::test]
    async fn chunk_round_trip() {
        let backend = MemoryBackend::default();
        let data = b"hello world".to_vec();
        let digest = sha256(&data);
        backend.put_chunk(&digest, &data, &FileHint::none()).await.unwrap();
        let back = backend.get_chunk(&digest, &FileHint::none()).await.unwrap();
        assert_eq!(back, data);
    }

    #[tokio::test]
    async fn put_rejects_digest_mismatch() {
        let backend = MemoryBackend::default();
        let wrong_digest = Digest::from_bytes(vec![0u8; 32]);
        let err = backend.put_manifest(&wrong_digest, b"not matching").await.unwrap_err();
        assert!(matches!(err, Error::Invariant(_)));
    }

    #[tokio::test]
    async fn copy_on_get_is_isolated() {
        let backend = MemoryBackend::default();
        let data = b"original".to_vec();
        let digest = sha256(&data);
        backend.put_chunk(&digest, &data, &FileHint::none()).await.unwrap();

        let mut first = backend.get_chunk(&digest, &FileHint::none()).await.unwrap();
        first[0] = b'X';

        let second = backend.get_chunk(&digest, &FileHint::none()).await.unwrap();
        assert_eq!(second, data);
    }

    #[tokio::test]
    async fn chunk_eviction_respects_byte_budget() {
        let backend = MemoryBackend::new(DEFAULT_MAX_MANIFESTS, 16);
        let a = vec![1u8; 10];
        let b = vec![2u8; 10];
        let da = sha256(&a);
        let db = sha256(&b);
        backend.put_chunk(&da, &a, &FileHint::none()).await.unwrap();
        backend.put_chunk(&db, &b, &FileHint::none()).await.unwrap();

        // Second put pushed total past 16 bytes; the first (LRU) entry
        // must have been evicted.
        assert!(backend.get_chunk(&da, &FileHint::none()).await.is_err());
        assert!(backend.get_chunk(&db, &FileHint::none()).await.is_ok());
    }

    #[tokio::test]
    async fn list_manifests_is_complete() {
        let backend = MemoryBackend::default();
        let data = b"manifest bytes".to_vec();
        let digest = sha256(&data);
        backend.put_manifest(&digest, &data).await.unwrap();

        let listed = backend.list_manifests().await.unwrap();
        assert!(listed.contains(&digest));
        for d in &listed {
            assert!(backend.get_manifest(d).await.is_ok());
        }
    }
}
