//! The backend abstraction: a uniform, content-addressed
//! get/put/list/release surface over two namespaces — manifests and
//! chunks — that every concrete storage (in-memory, local filesystem,
//! remote stub) and every decorator (composite, encrypt) implements
//! identically.

pub mod composite;
pub mod encrypt;
pub mod local;
pub mod memory;
pub mod remote;
pub mod test_stubs;

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::crypto::{AES_KEY_LEN, AES_NONCE_LEN};
use crate::error::Result;
use crate::model::Digest;

/// Which of the two content-addressed namespaces an operation targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Namespace {
    Manifest,
    Chunk,
}

impl Namespace {
    pub fn as_str(&self) -> &'static str {
        match self {
            Namespace::Manifest => "manifest",
            Namespace::Chunk => "chunk",
        }
    }
}

/// Manifest context a chunk operation needs but a bare digest can't
/// carry: the symmetric key and per-chunk nonce the Encrypt backend uses
/// to derive the chunk's address in its child namespace.
#[derive(Debug, Clone, Default)]
pub struct FileHint {
    pub manifest_digest: Option<Digest>,
    pub aes_key: Option<[u8; AES_KEY_LEN]>,
    pub nonce: Option<[u8; AES_NONCE_LEN]>,
}

impl FileHint {
    pub fn none() -> Self {
        FileHint::default()
    }
}

/// Backend capability/identity summary.
#[derive(Debug, Clone)]
pub struct Describe {
    pub name: String,
    /// Survives no network partition (e.g. `memory`, `local`).
    pub local: bool,
    /// Survives process death (e.g. `local`, but not `memory`).
    pub persistent: bool,
}

/// The uniform backend surface. Every method is infallible to *call* —
/// failures are reported through `Result`, never panics — and every
/// concrete implementation must be safe to share across the worker pool
/// (`Send + Sync`).
#[async_trait]
pub trait Backend: Send + Sync {
    async fn list_manifests(&self) -> Result<HashSet<Digest>>;
    async fn get_manifest(&self, digest: &Digest) -> Result<Vec<u8>>;
    async fn put_manifest(&self, digest: &Digest, bytes: &[u8]) -> Result<()>;
    async fn release_manifest(&self, digest: &Digest) -> Result<()>;

    async fn get_chunk(&self, digest: &Digest, hint: &FileHint) -> Result<Vec<u8>>;
    async fn put_chunk(&self, digest: &Digest, bytes: &[u8], hint: &FileHint) -> Result<()>;
    async fn release_chunk(&self, digest: &Digest) -> Result<()>;

    /// Writes manifest `bytes` at `digest` without requiring
    /// `digest == SHA-256(bytes)`. The Encrypt backend
    /// uses this to store an envelope under the *plaintext* manifest's
    /// address in its child, deliberately breaking invariant 5 for that
    /// one hop so content-addressed lookups of the plaintext digest
    /// still resolve. Plain backends default to the verified path.
    async fn put_manifest_raw(&self, digest: &Digest, bytes: &[u8]) -> Result<()> {
        self.put_manifest(digest, bytes).await
    }

    /// Same relaxation as [`Backend::put_manifest_raw`], for the chunk
    /// namespace: the Encrypt backend addresses chunks by a sealed
    /// digest rather than `SHA-256(bytes)`.
    async fn put_chunk_raw(&self, digest: &Digest, bytes: &[u8], hint: &FileHint) -> Result<()> {
        self.put_chunk(digest, bytes, hint).await
    }

    /// Paginating iterator over the chunk namespace; may error at any
    /// step without invalidating digests already yielded.
    fn list_chunks(&self) -> BoxStream<'static, Result<Digest>>;

    fn describe(&self) -> Describe;

    /// Optional prefetch hook: backends that can precompute or warm a
    /// cache for a batch of upcoming chunk reads may override this.
    /// Failures are logged and non-fatal.
    async fn warm(&self, _digests: &[Digest], _hint: &FileHint) -> Result<()> {
        Ok(())
    }
}

pub type BackendRef = Arc<dyn Backend>;

/// Verifies invariant 5: the payload previously written at `digest` must
/// equal `bytes` if the digest is meant to be content-derived. Backends
/// that accept arbitrary addresses (e.g. the Encrypt backend's sealed
/// chunk addresses) skip this check; plain manifest/chunk puts apply it.
pub fn verify_content_address(digest: &Digest, bytes: &[u8]) -> Result<()> {
    let actual = crate::crypto::sha256(bytes);
    if &actual != digest {
        return Err(crate::error::Error::digest_mismatch(digest, &actual));
    }
    Ok(())
}
