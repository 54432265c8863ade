//! Composite (multi-backend) backend: fans reads out to
//! every child and takes the first success; fans writes out to every
//! *writable* child concurrently and succeeds once a persistent writable
//! child has acknowledged (or, absent any persistent child, once any
//! writable child has).

use std::collections::HashSet;

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use tracing::warn;

use super::{Backend, BackendRef, Describe, FileHint};
use crate::error::{Error, Result};
use crate::metrics;
use crate::model::Digest;

/// A child backend plus whether it is eligible for composite writes.
pub struct Member {
    pub backend: BackendRef,
    pub writable: bool,
}

impl Member {
    pub fn new(backend: BackendRef, writable: bool) -> Self {
        Member { backend, writable }
    }
}

pub struct CompositeBackend {
    members: Vec<Member>,
}

impl CompositeBackend {
    pub fn new(members: Vec<Member>) -> Self {
        CompositeBackend { members }
    }

    fn writable_members(&self) -> impl Iterator<Item = &Member> {
        self.members.iter().filter(|m| m.writable)
    }

    fn has_persistent_writable(&self) -> bool {
        self.writable_members().any(|m| m.backend.describe().persistent)
    }

    /// Read-first-success: try every child in order, return the first hit.
    /// Individual failures are logged only; `NotFound` surfaces iff every
    /// child failed.
    async fn first_success<T, F, Fut>(&self, op_name: &str, f: F) -> Result<T>
    where
        F: Fn(&BackendRef) -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let mut last_err = None;
        for member in &self.members {
            match f(&member.backend).await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    warn!(op = op_name, backend = %member.backend.describe().name, error = %e, "composite child failed");
                    last_err = Some(e);
                }
            }
        }
        match last_err {
            Some(Error::NotFound(d)) => Err(Error::NotFound(d)),
            Some(_) | None => Err(Error::NotFound(format!("no child had {op_name}"))),
        }
    }

    /// Write-quorum: dispatch to every writable child concurrently,
    /// succeed once a persistent one (or, if none are persistent, any
    /// one) acknowledges.
    async fn quorum_write<F, Fut>(&self, op_name: &str, f: F) -> Result<()>
    where
        F: Fn(&BackendRef) -> Fut + Send + Sync,
        Fut: std::future::Future<Output = Result<()>> + Send,
    {
        let require_persistent = self.has_persistent_writable();
        let writable: Vec<&Member> = self.writable_members().collect();
        if writable.is_empty() {
            return Err(Error::PersistentWriteFailed);
        }

        let results = futures::future::join_all(writable.iter().map(|m| async {
            let result = f(&m.backend).await;
            (m.backend.describe(), result)
        }))
        .await;

        let mut any_success = false;
        let mut persistent_success = false;
        for (describe, result) in results {
            match result {
                Ok(()) => {
                    any_success = true;
                    if describe.persistent {
                        persistent_success = true;
                    }
                }
                Err(e) => {
                    if describe.persistent {
                        warn!(op = op_name, backend = %describe.name, error = %e, "persistent composite child write failed");
                    } else {
                        warn!(op = op_name, backend = %describe.name, error = %e, "non-persistent composite child write failed (logged only)");
                    }
                }
            }
        }

        let ok = if require_persistent { persistent_success } else { any_success };
        if ok {
            Ok(())
        } else {
            Err(Error::PersistentWriteFailed)
        }
    }
}

#[async_trait]
impl Backend for CompositeBackend {
    async fn list_manifests(&self) -> Result<HashSet<Digest>> {
        metrics::record_request("list", "composite", "manifest");
        let mut union = HashSet::new();
        for member in &self.members {
            match member.backend.list_manifests().await {
                Ok(digests) => union.extend(digests),
                Err(e) => warn!(backend = %member.backend.describe().name, error = %e, "composite list_manifests child failed"),
            }
        }
        Ok(union)
    }

    async fn get_manifest(&self, digest: &Digest) -> Result<Vec<u8>> {
        metrics::record_request("get", "composite", "manifest");
        self.first_success("get_manifest", |b| b.get_manifest(digest)).await
    }

    async fn put_manifest(&self, digest: &Digest, bytes: &[u8]) -> Result<()> {
        metrics::record_request("put", "composite", "manifest");
        self.quorum_write("put_manifest", |b| b.put_manifest(digest, bytes)).await
    }

    async fn release_manifest(&self, digest: &Digest) -> Result<()> {
        for member in &self.members {
            let _ = member.backend.release_manifest(digest).await;
        }
        Ok(())
    }

    async fn get_chunk(&self, digest: &Digest, hint: &FileHint) -> Result<Vec<u8>> {
        metrics::record_request("get", "composite", "chunk");
        let result = self.first_success("get_chunk", |b| b.get_chunk(digest, hint)).await;
        if result.is_ok() {
            metrics::record_chunk_fetch("composite");
        }
        result
    }

    async fn put_chunk(&self, digest: &Digest, bytes: &[u8], hint: &FileHint) -> Result<()> {
        metrics::record_request("put", "composite", "chunk");
        self.quorum_write("put_chunk", |b| b.put_chunk(digest, bytes, hint)).await
    }

    async fn release_chunk(&self, digest: &Digest) -> Result<()> {
        for member in &self.members {
            let _ = member.backend.release_chunk(digest).await;
        }
        Ok(())
    }

    async fn put_manifest_raw(&self, digest: &Digest, bytes: &[u8]) -> Result<()> {
        metrics::record_request("put", "composite", "manifest");
        self.quorum_write("put_manifest_raw", |b| b.put_manifest_raw(digest, bytes)).await
    }

    async fn put_chunk_raw(&self, digest: &Digest, bytes: &[u8], hint: &FileHint) -> Result<()> {
        metrics::record_request("put", "composite", "chunk");
        self.quorum_write("put_chunk_raw", |b| b.put_chunk_raw(digest, bytes, hint)).await
    }

    fn list_chunks(&self) -> BoxStream<'static, Result<Digest>> {
        let streams: Vec<_> = self.members.iter().map(|m| m.backend.list_chunks()).collect();
        stream::iter(streams).flatten().boxed()
    }

    fn describe(&self) -> Describe {
        let local = self.members.iter().all(|m| m.backend.describe().local);
        let persistent = self.members.iter().any(|m| m.backend.describe().persistent);
        Describe {
            name: "composite".into(),
            local,
            persistent,
        }
    }

    async fn warm(&self, digests: &[Digest], hint: &FileHint) -> Result<()> {
        for member in &self.members {
            let _ = member.backend.warm(digests, hint).await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::MemoryBackend;
    use crate::backend::test_stubs::{FailBackend, WinBackend};
    use crate::crypto::sha256;
    use std::sync::Arc;

    #[tokio::test]
    async fn get_returns_first_success() {
        let memory = Arc::new(MemoryBackend::default());
        let data = b"payload".to_vec();
        let digest = sha256(&data);
        memory.put_chunk(&digest, &data, &FileHint::none()).await.unwrap();

        let composite = CompositeBackend::new(vec![
            Member::new(Arc::new(FailBackend::new("dead", false)), true),
            Member::new(memory, true),
        ]);

        let back = composite.get_chunk(&digest, &FileHint::none()).await.unwrap();
        assert_eq!(back, data);
    }

    #[tokio::test]
    async fn get_fails_only_when_all_children_fail() {
        let composite = CompositeBackend::new(vec![
            Member::new(Arc::new(FailBackend::new("a", false)), true),
            Member::new(Arc::new(FailBackend::new("b", false)), true),
        ]);
        let digest = Digest::from_bytes(vec![1u8; 32]);
        assert!(composite.get_chunk(&digest, &FileHint::none()).await.is_err());
    }

    #[tokio::test]
    async fn put_succeeds_if_any_persistent_child_acks() {
        let composite = CompositeBackend::new(vec![
            Member::new(Arc::new(FailBackend::new("fail-persistent", true)), true),
            Member::new(Arc::new(WinBackend::new("win-persistent", true)), true),
        ]);
        let digest = Digest::from_bytes(vec![2u8; 32]);
        composite.put_chunk(&digest, b"x", &FileHint::none()).await.unwrap();
    }

    #[tokio::test]
    async fn put_fails_when_all_persistent_children_fail() {
        let composite = CompositeBackend::new(vec![
            Member::new(Arc::new(FailBackend::new("fail-persistent", true)), true),
            Member::new(Arc::new(WinBackend::new("win-nonpersistent", false)), true),
        ]);
        let digest = Digest::from_bytes(vec![3u8; 32]);
        let err = composite.put_chunk(&digest, b"x", &FileHint::none()).await.unwrap_err();
        assert!(matches!(err, Error::PersistentWriteFailed));
    }

    #[tokio::test]
    async fn put_ignores_non_writable_children() {
        let memory = Arc::new(MemoryBackend::default());
        let composite = CompositeBackend::new(vec![Member::new(memory.clone(), false)]);
        let digest = Digest::from_bytes(vec![4u8; 32]);
        let err = composite.put_manifest(&digest, b"{}").await.unwrap_err();
        assert!(matches!(err, Error::PersistentWriteFailed));
        assert!(memory.get_manifest(&digest).await.is_err());
    }

    #[tokio::test]
    async fn list_manifests_unions_children() {
        let a = Arc::new(MemoryBackend::default());
        let b = Arc::new(MemoryBackend::default());
        let da = sha256(b"a");
        let db = sha256(b"b");
        a.put_manifest(&da, b"a").await.unwrap();
        b.put_manifest(&db, b"b").await.unwrap();
        let composite = CompositeBackend::new(vec![Member::new(a, true), Member::new(b, true)]);
        let listed = composite.list_manifests().await.unwrap();
        assert!(listed.contains(&da));
        assert!(listed.contains(&db));
    }

    #[test]
    fn describe_aggregates_children() {
        let composite = CompositeBackend::new(vec![
            Member::new(Arc::new(WinBackend::new("a", true)), true),
            Member::new(Arc::new(FailBackend::new("b", false)), false),
        ]);
        let d = composite.describe();
        assert!(d.persistent);
        assert!(d.local);
    }
}
