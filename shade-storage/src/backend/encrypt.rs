//! Encrypt backend: a single-child decorator that performs
//! AES-256-GCM payload encryption and RSA-OAEP key wrapping, keeping the
//! manifest's plaintext digest as its address in the child namespace so
//! content-addressed lookups stay idempotent.
//!
//! **Nonce discipline:** each chunk's `Nonce` field (freshly generated
//! once per chunk rewrite at flush time) seals the chunk's *address* — a
//! deterministic `AES-GCM(K, Nonce).Seal(digest)` so reads can recompute
//! the same child-namespace key without consulting anything but the
//! manifest. The *payload* is sealed separately under a second,
//! independently-random nonce that is prepended to the ciphertext —
//! distinct from `Nonce` so the same `(K, Nonce)` pair is never used to
//! seal two different plaintexts, while still only ever touching each
//! chunk's `Nonce` once. See DESIGN.md for the full writeup.

use std::collections::HashSet;

use async_trait::async_trait;
use futures::stream::BoxStream;
use rsa::{RsaPrivateKey, RsaPublicKey};

use super::{Backend, BackendRef, Describe, FileHint};
use crate::crypto;
use crate::error::{Error, Result};
use crate::metrics;
use crate::model::{Digest, EncryptedEnvelope, EnvelopeBytes};

pub struct EncryptBackend {
    child: BackendRef,
    public_key: RsaPublicKey,
    private_key: Option<RsaPrivateKey>,
}

impl EncryptBackend {
    pub fn new(child: BackendRef, public_key: RsaPublicKey, private_key: Option<RsaPrivateKey>) -> Self {
        EncryptBackend {
            child,
            public_key,
            private_key,
        }
    }

    fn require_private_key(&self) -> Result<&RsaPrivateKey> {
        self.private_key.as_ref().ok_or(Error::KeyUnavailable)
    }

    fn require_chunk_hint<'a>(&self, hint: &'a FileHint) -> Result<(&'a [u8; 32], &'a [u8; 12])> {
        let key = hint.aes_key.as_ref().ok_or_else(|| Error::Invariant("encrypt backend: chunk operation missing AesKey hint".into()))?;
        let nonce = hint.nonce.as_ref().ok_or_else(|| Error::Invariant("encrypt backend: chunk operation missing Nonce hint".into()))?;
        Ok((key, nonce))
    }

    fn encrypted_address(&self, key: &[u8; 32], nonce: &[u8; 12], digest: &Digest) -> Result<Digest> {
        crypto::encrypt_digest(key, nonce, digest)
    }
}

#[async_trait]
impl Backend for EncryptBackend {
    async fn list_manifests(&self) -> Result<HashSet<Digest>> {
        // Manifests keep the plaintext digest as their address, so the
        // child's listing is already the right set.
        self.child.list_manifests().await
    }

    async fn get_manifest(&self, digest: &Digest) -> Result<Vec<u8>> {
        metrics::record_request("get", "encrypt", "manifest");
        let envelope_bytes = self.child.get_manifest(digest).await?;
        let envelope = EncryptedEnvelope::from_json(&envelope_bytes)
            .map_err(|e| Error::Invariant(format!("malformed encrypted manifest envelope: {e}")))?;
        let private_key = self.require_private_key()?;
        let key = crypto::rsa_oaep_unwrap(private_key, &envelope.wrapped_key.0)?;
        crypto::aes_gcm_open_prefixed(&key, &envelope.sealed_bytes.0)
    }

    async fn put_manifest(&self, digest: &Digest, bytes: &[u8]) -> Result<()> {
        metrics::record_request("put", "encrypt", "manifest");
        let key = crypto::generate_aes_key();
        let sealed = crypto::aes_gcm_seal_with_fresh_nonce(&key, bytes)?;
        let wrapped_key = crypto::rsa_oaep_wrap(&self.public_key, &key)?;
        let envelope = EncryptedEnvelope {
            wrapped_key: EnvelopeBytes(wrapped_key),
            sealed_bytes: EnvelopeBytes(sealed),
        };
        let envelope_bytes = envelope
            .to_json()
            .map_err(|e| Error::Invariant(format!("failed to serialize encrypted envelope: {e}")))?;
        // Address stays the plaintext digest; the child never sees it
        // re-derived from the envelope bytes it actually stores.
        self.child.put_manifest_raw(digest, &envelope_bytes).await
    }

    async fn release_manifest(&self, digest: &Digest) -> Result<()> {
        self.child.release_manifest(digest).await
    }

    async fn get_chunk(&self, digest: &Digest, hint: &FileHint) -> Result<Vec<u8>> {
        metrics::record_request("get", "encrypt", "chunk");
        let (key, nonce) = self.require_chunk_hint(hint)?;
        let address = self.encrypted_address(key, nonce, digest)?;
        let sealed = self.child.get_chunk(&address, &FileHint::none()).await?;
        let plaintext = crypto::aes_gcm_open_prefixed(key, &sealed)?;
        metrics::record_chunk_fetch("encrypt");
        Ok(plaintext)
    }

    async fn put_chunk(&self, digest: &Digest, bytes: &[u8], hint: &FileHint) -> Result<()> {
        metrics::record_request("put", "encrypt", "chunk");
        let (key, nonce) = self.require_chunk_hint(hint)?;
        let address = self.encrypted_address(key, nonce, digest)?;
        let sealed = crypto::aes_gcm_seal_with_fresh_nonce(key, bytes)?;
        self.child.put_chunk_raw(&address, &sealed, &FileHint::none()).await
    }

    async fn release_chunk(&self, digest: &Digest) -> Result<()> {
        // Without the manifest's (key, nonce) for this digest we cannot
        // recompute the child's encrypted address; callers that need to
        // release an encrypted chunk release it by encrypted address
        // directly through the child (see `gc`).
        self.child.release_chunk(digest).await
    }

    fn list_chunks(&self) -> BoxStream<'static, Result<Digest>> {
        // Encrypted addresses are opaque to everything but the holder of
        // the originating manifest's (key, nonce); listing returns the
        // child's raw (encrypted) address space unchanged.
        self.child.list_chunks()
    }

    fn describe(&self) -> Describe {
        self.child.describe()
    }
}
