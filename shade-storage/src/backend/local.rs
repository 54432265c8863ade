//! Local-filesystem backend: two directories, one per
//! namespace, each digest mapping to `<dir>/<hex(digest)>`. An in-memory,
//! mtime-ordered index drives quota eviction; the on-disk bytes are the
//! source of truth, the index is a rebuildable accelerator over them.

use std::collections::BTreeMap;
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use parking_lot::Mutex;
use tracing::warn;

use super::{Backend, Describe, FileHint};
use crate::error::{Error, Result};
use crate::metrics;
use crate::model::Digest;

const FILE_MODE: u32 = 0o400;
const DIR_MODE: u32 = 0o700;

/// Ordered oldest-first by `(mtime_nanos, digest)`; `digest` only breaks
/// ties between entries written in the same nanosecond.
type Index = BTreeMap<(i64, Digest), u64>;

struct Namespace {
    dir: PathBuf,
    index: Mutex<Index>,
    used_bytes: Mutex<u64>,
    max_files: usize,
    max_bytes: u64,
}

impl Namespace {
    async fn open(dir: PathBuf, max_files: usize, max_bytes: u64) -> std::io::Result<Self> {
        tokio::fs::create_dir_all(&dir).await?;
        let mut perms = tokio::fs::metadata(&dir).await?.permissions();
        perms.set_mode(DIR_MODE);
        tokio::fs::set_permissions(&dir, perms).await?;

        let mut index = Index::new();
        let mut used_bytes = 0u64;
        let mut entries = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let name = match name.to_str() {
                Some(n) => n,
                None => continue,
            };
            let digest = match Digest::from_hex(name) {
                Ok(d) => d,
                Err(_) => continue,
            };
            let meta = match entry.metadata().await {
                Ok(m) => m,
                Err(_) => continue,
            };
            let mtime = mtime_nanos(&meta);
            let size = meta.len();
            index.insert((mtime, digest), size);
            used_bytes += size;
        }

        Ok(Namespace {
            dir,
            index: Mutex::new(index),
            used_bytes: Mutex::new(used_bytes),
            max_files,
            max_bytes,
        })
    }

    fn path_for(&self, digest: &Digest) -> PathBuf {
        self.dir.join(digest.to_hex())
    }

    fn touch(&self, digest: &Digest, size: u64, mtime: i64) {
        let mut index = self.index.lock();
        let existing_key = index.keys().find(|(_, d)| d == digest).cloned();
        if let Some(key) = existing_key {
            index.remove(&key);
        } else {
            *self.used_bytes.lock() += size;
        }
        index.insert((mtime, digest.clone()), size);
    }

    fn forget(&self, digest: &Digest) {
        let mut index = self.index.lock();
        if let Some(key) = index.keys().find(|(_, d)| d == digest).cloned() {
            if let Some(size) = index.remove(&key) {
                let mut used = self.used_bytes.lock();
                *used = used.saturating_sub(size);
            }
        }
    }

    /// Evicts the oldest entries until both quotas (file count, byte
    /// budget) are satisfied. `0` means unbounded for that quota.
    async fn sweep(&self) {
        loop {
            let victim = {
                let index = self.index.lock();
                let over_files = self.max_files != 0 && index.len() > self.max_files;
                let over_bytes = self.max_bytes != 0 && *self.used_bytes.lock() > self.max_bytes;
                if !over_files && !over_bytes {
                    break;
                }
                index.keys().next().cloned()
            };
            let Some((mtime, digest)) = victim else { break };
            let path = self.path_for(&digest);
            if let Err(e) = tokio::fs::remove_file(&path).await {
                warn!(?path, error = %e, "local backend sweep: failed to remove evicted file");
            }
            let mut index = self.index.lock();
            if let Some(size) = index.remove(&(mtime, digest)) {
                let mut used = self.used_bytes.lock();
                *used = used.saturating_sub(size);
            }
        }
    }

    fn list(&self) -> Vec<Digest> {
        self.index.lock().keys().map(|(_, d)| d.clone()).collect()
    }
}

fn mtime_nanos(meta: &std::fs::Metadata) -> i64 {
    use std::time::UNIX_EPOCH;
    meta.modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}

pub struct LocalBackend {
    manifests: Namespace,
    chunks: Namespace,
}

impl LocalBackend {
    /// `max_files == 0` / `max_chunk_bytes == 0` mean unbounded.
    pub async fn open(
        manifests_dir: impl AsRef<Path>,
        chunks_dir: impl AsRef<Path>,
        max_files: usize,
        max_chunk_bytes: u64,
    ) -> std::io::Result<Self> {
        let manifests = Namespace::open(manifests_dir.as_ref().to_path_buf(), max_files, 0).await?;
        let chunks = Namespace::open(chunks_dir.as_ref().to_path_buf(), 0, max_chunk_bytes).await?;
        Ok(LocalBackend { manifests, chunks })
    }

    async fn write_entry(path: &Path, bytes: Vec<u8>) -> Result<()> {
        let path = path.to_path_buf();
        tokio::task::spawn_blocking(move || -> std::io::Result<()> {
            use std::fs::OpenOptions;
            use std::io::Write;

            let already_exists = path.exists();
            if already_exists {
                // Content is already correct by the address invariant;
                // only the mtime needs refreshing.
                let now = std::time::SystemTime::now();
                std::fs::File::open(&path)?.set_modified(now)?;
                return Ok(());
            }

            let mut file = OpenOptions::new()
                .write(true)
                .create_new(true)
                .custom_flags(libc::O_NOFOLLOW)
                .open(&path)?;
            file.write_all(&bytes)?;
            file.sync_all()?;
            file.set_permissions(std::fs::Permissions::from_mode(FILE_MODE))?;
            Ok(())
        })
        .await
        .map_err(|e| Error::io("join blocking write task", std::io::Error::new(std::io::ErrorKind::Other, e)))?
        .map_err(|e| Error::io(format!("write {}", path.display()), e))
    }

    async fn read_entry(path: &Path) -> Result<Vec<u8>> {
        match tokio::fs::read(path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(Error::NotFound(path.display().to_string()))
            }
            Err(e) => Err(Error::io(format!("read {}", path.display()), e)),
        }
    }
}

#[async_trait]
impl Backend for LocalBackend {
    async fn list_manifests(&self) -> Result<std::collections::HashSet<Digest>> {
        metrics::record_request("list", "local", "manifest");
        Ok(self.manifests.list().into_iter().collect())
    }

    async fn get_manifest(&self, digest: &Digest) -> Result<Vec<u8>> {
        metrics::record_request("get", "local", "manifest");
        let path = self.manifests.path_for(digest);
        let result = Self::read_entry(&path).await;
        if result.is_err() {
            metrics::record_not_found("local", "manifest");
        }
        result
    }

    async fn put_manifest(&self, digest: &Digest, bytes: &[u8]) -> Result<()> {
        super::verify_content_address(digest, bytes)?;
        self.put_manifest_raw(digest, bytes).await
    }

    async fn put_manifest_raw(&self, digest: &Digest, bytes: &[u8]) -> Result<()> {
        metrics::record_request("put", "local", "manifest");
        let path = self.manifests.path_for(digest);
        Self::write_entry(&path, bytes.to_vec()).await?;
        self.manifests.touch(digest, bytes.len() as u64, crate::model::Timestamp::now().0);
        self.manifests.sweep().await;
        Ok(())
    }

    async fn release_manifest(&self, digest: &Digest) -> Result<()> {
        let path = self.manifests.path_for(digest);
        let _ = tokio::fs::remove_file(&path).await;
        self.manifests.forget(digest);
        Ok(())
    }

    async fn get_chunk(&self, digest: &Digest, _hint: &FileHint) -> Result<Vec<u8>> {
        metrics::record_request("get", "local", "chunk");
        let path = self.chunks.path_for(digest);
        let result = Self::read_entry(&path).await;
        match &result {
            Ok(_) => metrics::record_chunk_fetch("local"),
            Err(_) => metrics::record_not_found("local", "chunk"),
        }
        result
    }

    async fn put_chunk(&self, digest: &Digest, bytes: &[u8], hint: &FileHint) -> Result<()> {
        super::verify_content_address(digest, bytes)?;
        self.put_chunk_raw(digest, bytes, hint).await
    }

    async fn put_chunk_raw(&self, digest: &Digest, bytes: &[u8], _hint: &FileHint) -> Result<()> {
        metrics::record_request("put", "local", "chunk");
        let path = self.chunks.path_for(digest);
        Self::write_entry(&path, bytes.to_vec()).await?;
        self.chunks.touch(digest, bytes.len() as u64, crate::model::Timestamp::now().0);
        self.chunks.sweep().await;
        Ok(())
    }

    async fn release_chunk(&self, digest: &Digest) -> Result<()> {
        let path = self.chunks.path_for(digest);
        let _ = tokio::fs::remove_file(&path).await;
        self.chunks.forget(digest);
        Ok(())
    }

    fn list_chunks(&self) -> BoxStream<'static, Result<Digest>> {
        let keys = self.chunks.list();
        stream::iter(keys.into_iter().map(Ok)).boxed()
    }

    fn describe(&self) -> Describe {
        Describe {
            name: "local".into(),
            local: true,
            persistent: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::sha256;
    use tempfile::TempDir;

    async fn backend() -> (TempDir, LocalBackend) {
        let dir = TempDir::new().unwrap();
        let backend = LocalBackend::open(dir.path().join("manifests"), dir.path().join("chunks"), 0, 0)
            .await
            .unwrap();
        (dir, backend)
    }

    #[tokio::test]
    async fn chunk_round_trip() {
        let (_dir, backend) = backend().await;
        let data = b"payload".to_vec();
        let digest = sha256(&data);
        backend.put_chunk(&digest, &data, &FileHint::none()).await.unwrap();
        let back = backend.get_chunk(&digest, &FileHint::none()).await.unwrap();
        assert_eq!(back, data);
    }

    #[tokio::test]
    async fn put_is_idempotent_on_matching_content() {
        let (_dir, backend) = backend().await;
        let data = b"payload".to_vec();
        let digest = sha256(&data);
        backend.put_chunk(&digest, &data, &FileHint::none()).await.unwrap();
        backend.put_chunk(&digest, &data, &FileHint::none()).await.unwrap();
        let back = backend.get_chunk(&digest, &FileHint::none()).await.unwrap();
        assert_eq!(back, data);
    }

    #[tokio::test]
    async fn quota_evicts_oldest_manifest() {
        let dir = TempDir::new().unwrap();
        let backend = LocalBackend::open(dir.path().join("manifests"), dir.path().join("chunks"), 1, 0)
            .await
            .unwrap();

        let first = b"{\"Filename\":\"a\"}".to_vec();
        let first_digest = sha256(&first);
        backend.put_manifest(&first_digest, &first).await.unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(2)).await;

        let second = b"{\"Filename\":\"b\"}".to_vec();
        let second_digest = sha256(&second);
        backend.put_manifest(&second_digest, &second).await.unwrap();

        assert!(backend.get_manifest(&first_digest).await.is_err());
        assert!(backend.get_manifest(&second_digest).await.is_ok());
    }

    #[tokio::test]
    async fn reopen_rebuilds_index_from_disk() {
        let dir = TempDir::new().unwrap();
        let data = b"durable chunk".to_vec();
        let digest = sha256(&data);
        {
            let backend = LocalBackend::open(dir.path().join("manifests"), dir.path().join("chunks"), 0, 0)
                .await
                .unwrap();
            backend.put_chunk(&digest, &data, &FileHint::none()).await.unwrap();
        }
        let reopened = LocalBackend::open(dir.path().join("manifests"), dir.path().join("chunks"), 0, 0)
            .await
            .unwrap();
        let back = reopened.get_chunk(&digest, &FileHint::none()).await.unwrap();
        assert_eq!(back, data);
    }
}
