//! Per-open-file handle state: the dirty-chunk buffer, the
//! clean-chunk LRU, and the single-flight map that coalesces concurrent
//! fetches of the same digest. One [`Handle`] per `open`/`create`;
//! [`HandleTable`] indexes them by integer id and reuses freed slots.

use std::collections::HashMap;
use std::future::Future;
use std::num::NonZeroUsize;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::future::{FutureExt, Shared};
use lru::LruCache;
use tokio::sync::Mutex;

use crate::backend::{BackendRef, FileHint};
use crate::error::{Error, Result};
use crate::model::{Digest, File};

pub const DEFAULT_HANDLE_CACHE_CAPACITY: usize = 6;

type ChunkFuture = Pin<Box<dyn Future<Output = std::result::Result<Vec<u8>, Arc<Error>>> + Send>>;

/// The mutable state a handle's mutex protects. Held across backend I/O
/// only by [`Handle::flush`] — no other backend I/O call holds this
/// lock while it awaits.
pub struct HandleState {
    pub file: Option<File>,
    pub dirty: HashMap<u32, Vec<u8>>,
    cache: LruCache<Digest, Vec<u8>>,
    inflight: HashMap<Digest, Shared<ChunkFuture>>,
}

pub struct Handle {
    pub id: u64,
    pub node_inode: u64,
    pub path: String,
    pub is_dir: bool,
    pub chunksize: u64,
    pub state: Mutex<HandleState>,
    sequential_reads: AtomicU64,
}

impl Handle {
    pub fn new_file(id: u64, node_inode: u64, path: String, file: Option<File>, chunksize: u64) -> Self {
        Handle {
            id,
            node_inode,
            path,
            is_dir: false,
            chunksize,
            state: Mutex::new(HandleState {
                file,
                dirty: HashMap::new(),
                cache: LruCache::new(NonZeroUsize::new(DEFAULT_HANDLE_CACHE_CAPACITY).unwrap()),
                inflight: HashMap::new(),
            }),
            sequential_reads: AtomicU64::new(0),
        }
    }

    pub fn new_dir(id: u64, node_inode: u64, path: String) -> Self {
        Handle {
            id,
            node_inode,
            path,
            is_dir: true,
            chunksize: 0,
            state: Mutex::new(HandleState {
                file: None,
                dirty: HashMap::new(),
                cache: LruCache::new(NonZeroUsize::new(1).unwrap()),
                inflight: HashMap::new(),
            }),
            sequential_reads: AtomicU64::new(0),
        }
    }

    /// Increments and returns the handle's sequential-read counter,
    /// used by the FS server to trigger `backend.warm` every 5th
    /// sequential chunk read.
    pub fn bump_sequential_reads(&self) -> u64 {
        self.sequential_reads.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Single-flight chunk fetch: serves from the clean
    /// cache if present, joins an in-flight fetch for the same digest if
    /// one exists, or starts a new one. The handle lock is dropped
    /// before the backend call and re-acquired only to record the
    /// result, so concurrent reads of *different* digests never block
    /// each other on backend I/O.
    pub async fn get_chunk(&self, digest: &Digest, hint: FileHint, backend: &BackendRef) -> Result<Vec<u8>> {
        {
            let mut state = self.state.lock().await;
            if let Some(bytes) = state.cache.get(digest) {
                return Ok(bytes.clone());
            }
        }

        let (shared, is_leader) = {
            let mut state = self.state.lock().await;
            if let Some(bytes) = state.cache.get(digest) {
                return Ok(bytes.clone());
            }
            if let Some(existing) = state.inflight.get(digest) {
                (existing.clone(), false)
            } else {
                let backend = backend.clone();
                let digest_owned = digest.clone();
                let fut: ChunkFuture = Box::pin(async move { backend.get_chunk(&digest_owned, &hint).await.map_err(Arc::new) });
                let shared = fut.shared();
                state.inflight.insert(digest.clone(), shared.clone());
                (shared, true)
            }
        };

        let result = shared.await;

        if is_leader {
            self.state.lock().await.inflight.remove(digest);
        }

        match result {
            Ok(bytes) => {
                self.state.lock().await.cache.put(digest.clone(), bytes.clone());
                Ok(bytes)
            }
            Err(arc_err) => Err(Error::io("single-flight chunk fetch", std::io::Error::new(std::io::ErrorKind::Other, arc_err.to_string()))),
        }
    }

    /// Non-blocking prefetch variant: spawns the fetch on
    /// a background task and returns immediately. If a fetch for this
    /// digest is already in flight (or cached), the spawned task simply
    /// joins it instead of issuing a second backend call.
    pub fn prefetch(self: &Arc<Self>, digest: Digest, hint: FileHint, backend: BackendRef) {
        let handle = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = handle.get_chunk(&digest, hint, &backend).await {
                tracing::debug!(error = %e, digest = %digest, "prefetch failed (non-fatal)");
            }
        });
    }

    pub async fn clear_cache_entry(&self, digest: &Digest) {
        self.state.lock().await.cache.pop(digest);
    }
}

pub struct HandleTable {
    inner: std::sync::Mutex<HandleTableState>,
}

struct HandleTableState {
    handles: HashMap<u64, Arc<Handle>>,
    free_ids: Vec<u64>,
    next_id: u64,
}

impl HandleTable {
    pub fn new() -> Self {
        HandleTable {
            inner: std::sync::Mutex::new(HandleTableState {
                handles: HashMap::new(),
                free_ids: Vec::new(),
                next_id: 1,
            }),
        }
    }

    fn alloc_id(&self) -> u64 {
        let mut state = self.inner.lock().unwrap();
        if let Some(id) = state.free_ids.pop() {
            id
        } else {
            let id = state.next_id;
            state.next_id += 1;
            id
        }
    }

    pub fn insert_file(&self, node_inode: u64, path: String, file: Option<File>, chunksize: u64) -> Arc<Handle> {
        let id = self.alloc_id();
        let handle = Arc::new(Handle::new_file(id, node_inode, path, file, chunksize));
        self.inner.lock().unwrap().handles.insert(id, Arc::clone(&handle));
        handle
    }

    pub fn insert_dir(&self, node_inode: u64, path: String) -> Arc<Handle> {
        let id = self.alloc_id();
        let handle = Arc::new(Handle::new_dir(id, node_inode, path));
        self.inner.lock().unwrap().handles.insert(id, Arc::clone(&handle));
        handle
    }

    pub fn get(&self, id: u64) -> Result<Arc<Handle>> {
        self.inner
            .lock()
            .unwrap()
            .handles
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("handle {id}")))
    }

    /// Frees `id`'s slot for reuse.
    pub fn release(&self, id: u64) {
        let mut state = self.inner.lock().unwrap();
        if state.handles.remove(&id).is_some() {
            state.free_ids.push(id);
        }
    }
}

impl Default for HandleTable {
    fn default() -> Self {
        HandleTable::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::MemoryBackend;
    use crate::crypto::sha256;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn single_flight_coalesces_concurrent_fetches() {
        let backend: BackendRef = Arc::new(MemoryBackend::default());
        let data = b"concurrent payload".to_vec();
        let digest = sha256(&data);
        backend.put_chunk(&digest, &data, &FileHint::none()).await.unwrap();

        let handle = Arc::new(Handle::new_file(1, 1, "f".into(), None, 8));
        let calls = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let handle = Arc::clone(&handle);
            let backend = backend.clone();
            let digest = digest.clone();
            let calls = Arc::clone(&calls);
            tasks.push(tokio::spawn(async move {
                let result = handle.get_chunk(&digest, FileHint::none(), &backend).await.unwrap();
                calls.fetch_add(1, Ordering::SeqCst);
                result
            }));
        }
        for t in tasks {
            assert_eq!(t.await.unwrap(), data);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 8);
    }

    #[tokio::test]
    async fn cache_hit_avoids_second_backend_call() {
        let backend: BackendRef = Arc::new(MemoryBackend::default());
        let data = b"cached".to_vec();
        let digest = sha256(&data);
        backend.put_chunk(&digest, &data, &FileHint::none()).await.unwrap();

        let handle = Arc::new(Handle::new_file(1, 1, "f".into(), None, 8));
        handle.get_chunk(&digest, FileHint::none(), &backend).await.unwrap();

        // Release the chunk from the backend; a cache hit must not need it again.
        backend.release_chunk(&digest).await.unwrap();
        let back = handle.get_chunk(&digest, FileHint::none(), &backend).await.unwrap();
        assert_eq!(back, data);
    }

    #[test]
    fn handle_table_reuses_freed_slots() {
        let table = HandleTable::new();
        let a = table.insert_dir(1, "a".into());
        let b = table.insert_dir(1, "b".into());
        table.release(a.id);
        let c = table.insert_dir(1, "c".into());
        assert_eq!(c.id, a.id);
        assert_ne!(b.id, c.id);
    }
}
