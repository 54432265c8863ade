//! The filesystem request dispatcher: maps POSIX-like
//! operations onto chunk reads/writes against a [`Tree`]/[`InodeMap`]
//! pair, with per-handle dirty-chunk buffering, prefetch, and flush.
//! Implements [`Transport`]; a real kernel binding sits above `FsServer`,
//! translating FUSE callbacks into these calls.

use std::sync::Arc;

use async_trait::async_trait;
use backoff::backoff::Backoff;
use backoff::ExponentialBackoffBuilder;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::backend::{BackendRef, FileHint};
use crate::crypto;
use crate::error::{Error, Result};
use crate::inode::InodeMap;
use crate::metrics;
use crate::model::{ChunkEntry, Digest, File, Node, Timestamp};
use crate::tree::Tree;

use super::handle::{Handle, HandleTable, DEFAULT_HANDLE_CACHE_CAPACITY};
use super::transport::{
    Attr, CreateRequest, CreateResponse, DestroyRequest, DirEntry, FileKind, FlushRequest, ForgetRequest,
    GetattrRequest, InitRequest, InitResponse, LookupRequest, MkdirRequest, OpenRequest, OpenResponse,
    ReaddirRequest, ReaddirResponse, ReadRequest, ReadResponse, ReleaseRequest, RemoveRequest, RenameRequest,
    SetattrRequest, StatfsRequest, StatfsResponse, Transport, WriteRequest, WriteResponse,
};

pub const DEFAULT_CHUNKSIZE: u64 = 256 * 1024;
pub const DEFAULT_WORKER_COUNT: usize = 20;
const WARM_BATCH: usize = 30;
const WARM_EVERY_N_READS: u64 = 5;
const MAX_FLUSH_ATTEMPTS: u32 = 10;

pub struct FsServer {
    backend: BackendRef,
    tree: Arc<Tree>,
    inodes: Arc<InodeMap>,
    handles: HandleTable,
    chunksize: u64,
    encrypted: bool,
    dispatch: Semaphore,
}

impl FsServer {
    pub fn new(backend: BackendRef, tree: Arc<Tree>, inodes: Arc<InodeMap>, chunksize: u64, encrypted: bool) -> Self {
        FsServer {
            backend,
            tree,
            inodes,
            handles: HandleTable::new(),
            chunksize: if chunksize == 0 { DEFAULT_CHUNKSIZE } else { chunksize },
            encrypted,
            dispatch: Semaphore::new(DEFAULT_WORKER_COUNT),
        }
    }

    fn join(parent: &str, name: &str) -> String {
        if parent.is_empty() {
            name.to_string()
        } else {
            format!("{parent}/{name}")
        }
    }

    fn attr_for(inode: u64, node: &Node) -> Attr {
        if node.is_dir() {
            Attr {
                inode,
                kind: FileKind::Directory,
                size: 0,
                blocks: 0,
                nlink: node.children.len() as u32 + 2,
                atime: node.modified_time,
                mtime: node.modified_time,
                ctime: node.modified_time,
                crtime: node.modified_time,
            }
        } else {
            let size = node.filesize.max(0) as u64;
            Attr {
                inode,
                kind: FileKind::RegularFile,
                size,
                blocks: (size + 4095) / 4096,
                nlink: 1,
                atime: node.modified_time,
                mtime: node.modified_time,
                ctime: node.modified_time,
                crtime: node.modified_time,
            }
        }
    }

    fn chunk_hint(file: &File, index: usize) -> FileHint {
        FileHint {
            manifest_digest: None,
            aes_key: file.aes_key,
            nonce: file.chunks.get(index).and_then(|c| c.nonce),
        }
    }

    /// Read path.
    async fn do_read(&self, handle: &Arc<Handle>, offset: i64, size: usize) -> Result<Vec<u8>> {
        if offset < 0 {
            return Err(Error::io("read", std::io::Error::new(std::io::ErrorKind::InvalidInput, "negative offset")));
        }
        if size == 0 {
            return Ok(Vec::new());
        }
        let file = {
            let state = handle.state.lock().await;
            state.file.clone().ok_or_else(|| Error::Invariant("read on a handle with no manifest".into()))?
        };
        if file.chunks.is_empty() {
            return Ok(Vec::new());
        }

        let chunksize = handle.chunksize.max(1);
        let offset = offset as u64;
        let first = (offset / chunksize) as usize;
        if first > file.chunks.len() - 1 {
            return Err(Error::io("read", std::io::Error::new(std::io::ErrorKind::InvalidInput, "offset past end of chunks")));
        }
        let end_byte = offset + size as u64;
        let last = (((end_byte + chunksize - 1) / chunksize) as usize).saturating_sub(1).min(file.chunks.len() - 1);

        let mut buf = Vec::new();
        for idx in first..=last {
            let digest = file.chunks[idx].sha256.clone();
            let hint = Self::chunk_hint(&file, idx);
            let bytes = handle.get_chunk(&digest, hint, &self.backend).await?;
            buf.extend_from_slice(&bytes);
        }

        let offset_in_chunk = (offset % chunksize) as usize;
        let result = if offset_in_chunk < buf.len() {
            let end = (offset_in_chunk + size).min(buf.len());
            buf[offset_in_chunk..end].to_vec()
        } else {
            Vec::new()
        };

        self.maybe_prefetch(handle, &file, last, offset, size as u64, chunksize);
        self.maybe_warm(handle, &file, last);

        Ok(result)
    }

    /// Schedules background prefetch once the read region crosses the
    /// trigger byte near the start of the chunk's tail tenth.
    fn maybe_prefetch(&self, handle: &Arc<Handle>, file: &File, last: usize, offset: u64, size: u64, chunksize: u64) {
        let offset_in_chunk = offset % chunksize;
        let prefetch_byte = chunksize / 10;
        let end_of_region = offset_in_chunk + size;
        if !(offset_in_chunk < prefetch_byte && prefetch_byte < end_of_region) {
            return;
        }
        let remaining = file.chunks.len().saturating_sub(last + 1);
        if remaining == 0 {
            return;
        }
        let budget = (DEFAULT_HANDLE_CACHE_CAPACITY * 3 / 4).saturating_sub(1).min(remaining);
        for offset_idx in 1..=budget {
            let idx = last + offset_idx;
            if idx >= file.chunks.len() {
                break;
            }
            let digest = file.chunks[idx].sha256.clone();
            let hint = Self::chunk_hint(file, idx);
            handle.prefetch(digest, hint, self.backend.clone());
        }
    }

    /// Every `WARM_EVERY_N_READS`th sequential read, asks the backend to
    /// warm its cache for the next batch of chunks.
    fn maybe_warm(&self, handle: &Arc<Handle>, file: &File, last: usize) {
        let count = handle.bump_sequential_reads();
        if count % WARM_EVERY_N_READS != 0 {
            return;
        }
        let start = last + 1;
        let end = (start + WARM_BATCH).min(file.chunks.len());
        if start >= end {
            return;
        }
        let digests: Vec<Digest> = file.chunks[start..end].iter().map(|c| c.sha256.clone()).collect();
        let hint = Self::chunk_hint(file, start);
        let backend = self.backend.clone();
        tokio::spawn(async move {
            if let Err(e) = backend.warm(&digests, &hint).await {
                debug!(error = %e, "backend warm failed (non-fatal)");
            }
        });
    }

    /// Write path: splices `data` into whichever chunks its
    /// byte range overlaps. The "spill into the next chunk" behavior
    /// falls out of iterating every affected chunk and intersecting its
    /// byte range with the write's, rather than needing a carry-over step.
    async fn do_write(&self, handle: &Arc<Handle>, offset: i64, data: &[u8]) -> Result<u32> {
        if offset < 0 {
            return Err(Error::io("write", std::io::Error::new(std::io::ErrorKind::InvalidInput, "negative offset")));
        }
        if data.is_empty() {
            return Ok(0);
        }

        let chunksize = handle.chunksize.max(1);
        let offset = offset as u64;
        let first = (offset / chunksize) as u32;
        let last = ((offset + data.len() as u64 - 1) / chunksize) as u32;

        let file = {
            let state = handle.state.lock().await;
            state.file.clone()
        };

        for idx in first..=last {
            let chunk_start = idx as u64 * chunksize;
            let chunk_end = chunk_start + chunksize;
            let write_start = offset.max(chunk_start);
            let write_end = (offset + data.len() as u64).min(chunk_end);
            if write_start >= write_end {
                continue;
            }

            let existing = handle.state.lock().await.dirty.remove(&idx);
            let mut buf = match existing {
                Some(bytes) => bytes,
                None => match &file {
                    Some(f) if (idx as usize) < f.chunks.len() => {
                        let digest = f.chunks[idx as usize].sha256.clone();
                        let hint = Self::chunk_hint(f, idx as usize);
                        handle.get_chunk(&digest, hint, &self.backend).await?
                    }
                    _ => Vec::new(),
                },
            };

            let local_start = (write_start - chunk_start) as usize;
            let local_end = (write_end - chunk_start) as usize;
            if buf.len() < local_end {
                buf.resize(local_end, 0);
            }
            let data_start = (write_start - offset) as usize;
            let data_end = (write_end - offset) as usize;
            buf[local_start..local_end].copy_from_slice(&data[data_start..data_end]);

            handle.state.lock().await.dirty.insert(idx, buf);
        }

        Ok(data.len() as u32)
    }

    /// Flush: the one place the handle mutex is held across
    /// backend I/O, so concurrent writes to the same open file can't
    /// interleave with their own flush.
    async fn do_flush(&self, handle: &Arc<Handle>) -> Result<()> {
        let mut state = handle.state.lock().await;
        if state.dirty.is_empty() {
            return Ok(());
        }

        let mut file = match state.file.take() {
            Some(f) => f,
            None => File::empty(handle.path.clone(), handle.chunksize),
        };

        if self.encrypted && file.aes_key.is_none() {
            file.aes_key = Some(crypto::generate_aes_key());
        }

        let mut indices: Vec<u32> = state.dirty.keys().copied().collect();
        indices.sort_unstable();
        let max_index = *indices.last().expect("dirty map checked non-empty above");
        if (file.chunks.len() as u32) <= max_index {
            // Sparse hole: no data was ever written for these indices.
            for i in file.chunks.len() as u32..=max_index {
                file.chunks.push(ChunkEntry::new(i, Digest::from_bytes(Vec::new())));
            }
        }

        for &idx in &indices {
            let bytes = state.dirty.get(&idx).expect("index drawn from dirty's own keys").clone();
            let digest = crypto::sha256(&bytes);
            let nonce = crypto::generate_nonce();
            file.chunks[idx as usize] = ChunkEntry {
                index: idx,
                sha256: digest.clone(),
                nonce: Some(nonce),
            };
            if idx as usize == file.chunks.len() - 1 {
                file.last_chunksize = bytes.len() as u64;
            }
            let hint = Self::chunk_hint(&file, idx as usize);
            self.put_chunk_with_retry(&digest, &bytes, &hint).await?;
        }

        file.modified_time = Timestamp::now();
        file.recompute_filesize();

        let manifest_bytes = file.to_json().map_err(|e| Error::Invariant(format!("failed to serialize manifest: {e}")))?;
        let manifest_digest = crypto::sha256(&manifest_bytes);
        self.put_manifest_with_retry(&manifest_digest, &manifest_bytes).await?;

        self.tree.update(manifest_digest, &file);

        state.file = Some(file);
        state.dirty.clear();
        Ok(())
    }

    async fn put_chunk_with_retry(&self, digest: &Digest, bytes: &[u8], hint: &FileHint) -> Result<()> {
        let backend = &self.backend;
        self.with_retry("put_chunk", || backend.put_chunk(digest, bytes, hint)).await
    }

    async fn put_manifest_with_retry(&self, digest: &Digest, bytes: &[u8]) -> Result<()> {
        let backend = &self.backend;
        self.with_retry("put_manifest", || backend.put_manifest(digest, bytes)).await
    }

    /// Exponential backoff (base 1s, factor 4), attempt-capped at
    /// `MAX_FLUSH_ATTEMPTS` rather than time-capped, since `backoff`'s own
    /// `max_elapsed_time` is wall-clock based and we want a fixed retry
    /// count instead.
    async fn with_retry<F, Fut>(&self, op: &str, f: F) -> Result<()>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<()>>,
    {
        let mut backoff = ExponentialBackoffBuilder::new()
            .with_initial_interval(std::time::Duration::from_secs(1))
            .with_multiplier(4.0)
            .with_max_elapsed_time(None)
            .build();

        let mut attempt = 0u32;
        loop {
            match f().await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    attempt += 1;
                    if attempt >= MAX_FLUSH_ATTEMPTS {
                        warn!(op, attempts = attempt, error = %e, "flush exhausted retries");
                        return Err(e);
                    }
                    metrics::record_retry(op);
                    let wait = backoff.next_backoff().unwrap_or(std::time::Duration::from_secs(1));
                    tokio::time::sleep(wait).await;
                }
            }
        }
    }

    /// `create`: a new manifest racing a tombstone at the
    /// same path is minted strictly after it.
    async fn do_create(&self, parent_inode: u64, name: &str) -> Result<CreateResponse> {
        let parent_path = self.inodes.to_path(parent_inode)?;
        let path = Self::join(&parent_path, name);

        let now = match self.tree.tombstone_time(&path) {
            Some(tombstone_time) => Timestamp::now().max(tombstone_time.plus_nanos(1)),
            None => Timestamp::now(),
        };
        self.tree.create(&path, now);

        let inode = self.inodes.from_path(&path);
        let node = self.tree.node_by_path(&path)?;
        let file = File::empty(path.clone(), self.chunksize);
        let handle = self.handles.insert_file(inode, path, Some(file), self.chunksize);

        Ok(CreateResponse {
            inode,
            handle: handle.id,
            attr: Self::attr_for(inode, &node),
        })
    }

    async fn do_mkdir(&self, parent_inode: u64, name: &str) -> Result<Attr> {
        let parent_path = self.inodes.to_path(parent_inode)?;
        let path = Self::join(&parent_path, name);
        self.tree.mkdir(&path);
        let inode = self.inodes.from_path(&path);
        let node = self.tree.node_by_path(&path)?;
        Ok(Self::attr_for(inode, &node))
    }

    /// Removing a file writes a real, content-addressed tombstone manifest
    /// for discoverability by refresh/GC, while the in-memory Tree node is
    /// updated with the `deleted` sentinel address in the same step.
    async fn do_remove(&self, parent_inode: u64, name: &str) -> Result<()> {
        let parent_path = self.inodes.to_path(parent_inode)?;
        let path = Self::join(&parent_path, name);
        let node = self.tree.node_by_path(&path)?;

        if node.is_dir() {
            self.tree.remove_empty_dir(&path)?;
            return Ok(());
        }

        let tombstone = File::tombstone(path.clone(), Timestamp::now());
        let bytes = tombstone.to_json().map_err(|e| Error::Invariant(format!("failed to serialize tombstone: {e}")))?;
        let digest = crypto::sha256(&bytes);
        self.put_manifest_with_retry(&digest, &bytes).await?;
        self.tree.mark_deleted(&path, Digest::deleted_sentinel(), tombstone.modified_time);
        Ok(())
    }

    async fn do_readdir(&self, inode: u64) -> Result<Vec<DirEntry>> {
        let path = self.inodes.to_path(inode)?;
        let node = self.tree.node_by_path(&path)?;
        let mut entries = Vec::with_capacity(node.children.len());
        for name in &node.children {
            let child_path = Self::join(&path, name);
            let child = self.tree.node_by_path(&child_path)?;
            let child_inode = self.inodes.from_path(&child_path);
            entries.push(DirEntry {
                name: name.clone(),
                inode: child_inode,
                kind: if child.is_dir() { FileKind::Directory } else { FileKind::RegularFile },
            });
        }
        Ok(entries)
    }
}

#[async_trait]
impl Transport for FsServer {
    async fn init(&self, _req: InitRequest) -> Result<InitResponse> {
        let _permit = self.dispatch.acquire().await.expect("dispatch semaphore never closes");
        Ok(InitResponse {
            max_write: self.chunksize.min(u32::MAX as u64) as u32,
        })
    }

    async fn statfs(&self, _req: StatfsRequest) -> Result<StatfsResponse> {
        let _permit = self.dispatch.acquire().await.expect("dispatch semaphore never closes");
        Ok(StatfsResponse {
            blocks: 0,
            bfree: 0,
            bavail: 0,
            files: self.tree.num_nodes() as u64,
            ffree: 0,
            bsize: 4096,
            namelen: 255,
            frsize: 4096,
        })
    }

    async fn getattr(&self, req: GetattrRequest) -> Result<Attr> {
        let _permit = self.dispatch.acquire().await.expect("dispatch semaphore never closes");
        let path = self.inodes.to_path(req.inode)?;
        let node = self.tree.node_by_path(&path)?;
        Ok(Self::attr_for(req.inode, &node))
    }

    async fn lookup(&self, req: LookupRequest) -> Result<Attr> {
        let _permit = self.dispatch.acquire().await.expect("dispatch semaphore never closes");
        let parent_path = self.inodes.to_path(req.parent)?;
        let path = Self::join(&parent_path, &req.name);
        let node = self.tree.node_by_path(&path)?;
        let inode = self.inodes.from_path(&path);
        Ok(Self::attr_for(inode, &node))
    }

    async fn forget(&self, req: ForgetRequest) {
        let _permit = self.dispatch.acquire().await.expect("dispatch semaphore never closes");
        let _ = req.nlookup;
        self.inodes.release(req.inode);
    }

    async fn open(&self, req: OpenRequest) -> Result<OpenResponse> {
        let _permit = self.dispatch.acquire().await.expect("dispatch semaphore never closes");
        let path = self.inodes.to_path(req.inode)?;
        let node = self.tree.node_by_path(&path)?;
        let handle = if node.is_dir() {
            self.handles.insert_dir(req.inode, path)
        } else {
            let file = self.tree.file_by_node(&node).await?;
            self.handles.insert_file(req.inode, path, Some(file), self.chunksize)
        };
        Ok(OpenResponse { handle: handle.id })
    }

    /// Setattr is a no-op: access control is owner-only,
    /// mediated entirely by the host transport's `allow_other` setting.
    async fn setattr(&self, req: SetattrRequest) -> Result<Attr> {
        let _permit = self.dispatch.acquire().await.expect("dispatch semaphore never closes");
        let path = self.inodes.to_path(req.inode)?;
        let node = self.tree.node_by_path(&path)?;
        Ok(Self::attr_for(req.inode, &node))
    }

    async fn create(&self, req: CreateRequest) -> Result<CreateResponse> {
        let _permit = self.dispatch.acquire().await.expect("dispatch semaphore never closes");
        self.do_create(req.parent, &req.name).await
    }

    async fn read(&self, req: ReadRequest) -> Result<ReadResponse> {
        let _permit = self.dispatch.acquire().await.expect("dispatch semaphore never closes");
        let handle = self.handles.get(req.handle)?;
        let data = self.do_read(&handle, req.offset, req.size).await?;
        Ok(ReadResponse { data })
    }

    async fn readdir(&self, req: ReaddirRequest) -> Result<ReaddirResponse> {
        let _permit = self.dispatch.acquire().await.expect("dispatch semaphore never closes");
        let entries = self.do_readdir(req.inode).await?;
        Ok(ReaddirResponse { entries })
    }

    async fn mkdir(&self, req: MkdirRequest) -> Result<Attr> {
        let _permit = self.dispatch.acquire().await.expect("dispatch semaphore never closes");
        self.do_mkdir(req.parent, &req.name).await
    }

    async fn remove(&self, req: RemoveRequest) -> Result<()> {
        let _permit = self.dispatch.acquire().await.expect("dispatch semaphore never closes");
        self.do_remove(req.parent, &req.name).await
    }

    /// Recognized but unimplemented: a
    /// hard error, never a silent no-op.
    async fn rename(&self, _req: RenameRequest) -> Result<()> {
        let _permit = self.dispatch.acquire().await.expect("dispatch semaphore never closes");
        Err(Error::Unsupported("rename".into()))
    }

    async fn write(&self, req: WriteRequest) -> Result<WriteResponse> {
        let _permit = self.dispatch.acquire().await.expect("dispatch semaphore never closes");
        let handle = self.handles.get(req.handle)?;
        let written = self.do_write(&handle, req.offset, &req.data).await?;
        Ok(WriteResponse { written })
    }

    async fn flush(&self, req: FlushRequest) -> Result<()> {
        let _permit = self.dispatch.acquire().await.expect("dispatch semaphore never closes");
        let handle = self.handles.get(req.handle)?;
        self.do_flush(&handle).await
    }

    async fn release(&self, req: ReleaseRequest) -> Result<()> {
        let _permit = self.dispatch.acquire().await.expect("dispatch semaphore never closes");
        let handle = self.handles.get(req.handle)?;
        self.do_flush(&handle).await?;
        self.handles.release(req.handle);
        Ok(())
    }

    async fn destroy(&self, _req: DestroyRequest) {
        let _permit = self.dispatch.acquire().await.expect("dispatch semaphore never closes");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::MemoryBackend;
    use crate::backend::{Backend, Describe};
    use crate::config;
    use async_trait::async_trait as at;
    use futures::stream::BoxStream;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn root_server(backend: BackendRef) -> (FsServer, Arc<Tree>, Arc<InodeMap>) {
        let tree = Arc::new(Tree::new(backend.clone()));
        let inodes = Arc::new(InodeMap::new());
        let server = FsServer::new(backend, tree.clone(), inodes.clone(), 8, false);
        (server, tree, inodes)
    }

    #[tokio::test]
    async fn single_small_file_round_trips() {
        let backend: BackendRef = Arc::new(MemoryBackend::default());
        let (server, _tree, inodes) = root_server(backend);
        let root = inodes.from_path("");

        let created = server.create(CreateRequest { parent: root, name: "hello".into() }).await.unwrap();
        server.write(WriteRequest { handle: created.handle, offset: 0, data: b"world".to_vec() }).await.unwrap();
        server.flush(FlushRequest { handle: created.handle }).await.unwrap();

        let attr = server.lookup(LookupRequest { parent: root, name: "hello".into() }).await.unwrap();
        assert_eq!(attr.size, 5);

        let opened = server.open(OpenRequest { inode: attr.inode }).await.unwrap();
        let read = server.read(ReadRequest { handle: opened.handle, offset: 0, size: 5 }).await.unwrap();
        assert_eq!(read.data, b"world");
    }

    #[tokio::test]
    async fn write_straddling_chunk_boundary() {
        let backend: BackendRef = Arc::new(MemoryBackend::default());
        let (server, _tree, inodes) = root_server(backend);
        let root = inodes.from_path("");

        let created = server.create(CreateRequest { parent: root, name: "f".into() }).await.unwrap();
        server.write(WriteRequest { handle: created.handle, offset: 0, data: b"01234567".to_vec() }).await.unwrap();
        server.flush(FlushRequest { handle: created.handle }).await.unwrap();
        server.write(WriteRequest { handle: created.handle, offset: 3, data: b"straddle".to_vec() }).await.unwrap();
        server.flush(FlushRequest { handle: created.handle }).await.unwrap();

        let read = server.read(ReadRequest { handle: created.handle, offset: 0, size: 11 }).await.unwrap();
        assert_eq!(read.data, b"012straddle");
    }

    #[tokio::test]
    async fn remove_hides_path_and_rejects_nonempty_dir() {
        let backend: BackendRef = Arc::new(MemoryBackend::default());
        let (server, _tree, inodes) = root_server(backend);
        let root = inodes.from_path("");

        server.mkdir(MkdirRequest { parent: root, name: "d".into() }).await.unwrap();
        let dir_attr = server.lookup(LookupRequest { parent: root, name: "d".into() }).await.unwrap();
        let created = server.create(CreateRequest { parent: dir_attr.inode, name: "f".into() }).await.unwrap();
        server.write(WriteRequest { handle: created.handle, offset: 0, data: b"x".to_vec() }).await.unwrap();
        server.flush(FlushRequest { handle: created.handle }).await.unwrap();

        assert!(server.remove(RemoveRequest { parent: root, name: "d".into() }).await.is_err());

        server.remove(RemoveRequest { parent: dir_attr.inode, name: "f".into() }).await.unwrap();
        assert!(server.lookup(LookupRequest { parent: dir_attr.inode, name: "f".into() }).await.is_err());

        server.remove(RemoveRequest { parent: root, name: "d".into() }).await.unwrap();
        assert!(server.lookup(LookupRequest { parent: root, name: "d".into() }).await.is_err());
    }

    #[tokio::test]
    async fn rename_is_a_hard_error() {
        let backend: BackendRef = Arc::new(MemoryBackend::default());
        let (server, _tree, inodes) = root_server(backend);
        let root = inodes.from_path("");
        let err = server
            .rename(RenameRequest { parent: root, name: "a".into(), new_parent: root, new_name: "b".into() })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Unsupported(_)));
    }

    #[tokio::test]
    async fn encrypted_round_trip_through_fs_server() {
        use rsa::pkcs8::{EncodePrivateKey, EncodePublicKey};
        let mut rng = rand::rngs::OsRng;
        let private = rsa::RsaPrivateKey::new(&mut rng, 2048).unwrap();
        let public = rsa::RsaPublicKey::from(&private);
        let public_pem = public.to_public_key_pem(rsa::pkcs8::LineEnding::LF).unwrap();
        let private_pem = private.to_pkcs8_pem(rsa::pkcs8::LineEnding::LF).unwrap().to_string();

        let json = serde_json::json!({
            "Provider": "encrypt",
            "RsaPublicKey": public_pem,
            "RsaPrivateKey": private_pem,
            "Children": [{"Provider": "memory"}]
        });
        let config = config::Config::from_json(json.to_string().as_bytes()).unwrap();
        let backend = config::build_backend(&config).await.unwrap();

        let tree = Arc::new(Tree::new(backend.clone()));
        let inodes = Arc::new(InodeMap::new());
        let server = FsServer::new(backend, tree, inodes.clone(), 16, true);
        let root = inodes.from_path("");

        let payload: Vec<u8> = (0..200u32).map(|i| (i % 251) as u8).collect();
        let created = server.create(CreateRequest { parent: root, name: "secret".into() }).await.unwrap();
        server.write(WriteRequest { handle: created.handle, offset: 0, data: payload.clone() }).await.unwrap();
        server.flush(FlushRequest { handle: created.handle }).await.unwrap();

        let read = server.read(ReadRequest { handle: created.handle, offset: 0, size: payload.len() }).await.unwrap();
        assert_eq!(read.data, payload);
    }

    struct CountingBackend {
        inner: MemoryBackend,
        chunk_gets: AtomicUsize,
    }

    #[at]
    impl Backend for CountingBackend {
        async fn list_manifests(&self) -> Result<HashSet<Digest>> {
            self.inner.list_manifests().await
        }
        async fn get_manifest(&self, digest: &Digest) -> Result<Vec<u8>> {
            self.inner.get_manifest(digest).await
        }
        async fn put_manifest(&self, digest: &Digest, bytes: &[u8]) -> Result<()> {
            self.inner.put_manifest(digest, bytes).await
        }
        async fn release_manifest(&self, digest: &Digest) -> Result<()> {
            self.inner.release_manifest(digest).await
        }
        async fn get_chunk(&self, digest: &Digest, hint: &FileHint) -> Result<Vec<u8>> {
            self.chunk_gets.fetch_add(1, Ordering::SeqCst);
            self.inner.get_chunk(digest, hint).await
        }
        async fn put_chunk(&self, digest: &Digest, bytes: &[u8], hint: &FileHint) -> Result<()> {
            self.inner.put_chunk(digest, bytes, hint).await
        }
        async fn release_chunk(&self, digest: &Digest) -> Result<()> {
            self.inner.release_chunk(digest).await
        }
        fn list_chunks(&self) -> BoxStream<'static, Result<Digest>> {
            self.inner.list_chunks()
        }
        fn describe(&self) -> Describe {
            self.inner.describe()
        }
    }

    #[tokio::test]
    async fn prefetch_populates_handle_cache_without_duplicate_backend_calls() {
        let counting = Arc::new(CountingBackend {
            inner: MemoryBackend::default(),
            chunk_gets: AtomicUsize::new(0),
        });
        let backend: BackendRef = counting.clone();

        // chunksize 100 makes the prefetch trigger byte (chunksize/10 = 10)
        // meaningful; 8-byte chunks (as in the other tests here) never
        // satisfy `offset_in_chunk < prefetch_byte`.
        let tree = Arc::new(Tree::new(backend.clone()));
        let inodes = Arc::new(InodeMap::new());
        let server = FsServer::new(backend, tree, inodes.clone(), 100, false);
        let root = inodes.from_path("");

        let created = server.create(CreateRequest { parent: root, name: "big".into() }).await.unwrap();
        let payload = vec![7u8; 100 * 10]; // 10 chunks
        server.write(WriteRequest { handle: created.handle, offset: 0, data: payload }).await.unwrap();
        server.flush(FlushRequest { handle: created.handle }).await.unwrap();

        // offset_in_chunk = 0 < prefetch_byte (10) < end_of_region (15):
        // triggers prefetch of up to budget = (6*3/4 - 1) = 3 chunks
        // beyond the one just read (chunks 1..=3).
        server.read(ReadRequest { handle: created.handle, offset: 0, size: 15 }).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;

        let calls_after_prefetch = counting.chunk_gets.load(Ordering::SeqCst);
        assert!(calls_after_prefetch >= 4, "expected the initial read plus at least 3 prefetched chunks, got {calls_after_prefetch}");

        // Re-fetching a prefetched chunk through the same handle must hit
        // the clean cache, not the backend again.
        let handle = server.handles.get(created.handle).unwrap();
        let entry_digest = {
            let state = handle.state.lock().await;
            state.file.as_ref().unwrap().chunks[1].sha256.clone()
        };
        let bytes = handle.get_chunk(&entry_digest, FileHint::none(), &handle_backend(&server)).await.unwrap();
        assert_eq!(bytes, vec![7u8; 100]);
        assert_eq!(counting.chunk_gets.load(Ordering::SeqCst), calls_after_prefetch, "cache hit must not re-call the backend");
    }

    fn handle_backend(server: &FsServer) -> BackendRef {
        server.backend.clone()
    }
}
