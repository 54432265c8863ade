//! Hash and crypto primitives: SHA-256 content addressing, AES-256-GCM
//! payload encryption, and RSA-OAEP key wrapping.
//!
//! Crypto primitives never suspend: everything here is a
//! synchronous, CPU-bound call, safe to invoke from inside an async
//! worker without yielding the runtime.

use aes_gcm::aead::{Aead, OsRng as AesOsRng};
use aes_gcm::{Aes256Gcm, Key, KeyInit, Nonce as AesNonce};
use rand::RngCore;
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use sha2::{Digest as _, Sha256};

use crate::error::{Error, Result};
use crate::model::Digest;

pub const AES_KEY_LEN: usize = 32;
pub const AES_NONCE_LEN: usize = 12;

pub fn sha256(bytes: &[u8]) -> Digest {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    Digest::from_bytes(hasher.finalize().to_vec())
}

pub fn generate_aes_key() -> [u8; AES_KEY_LEN] {
    let mut key = [0u8; AES_KEY_LEN];
    AesOsRng.fill_bytes(&mut key);
    key
}

pub fn generate_nonce() -> [u8; AES_NONCE_LEN] {
    let mut nonce = [0u8; AES_NONCE_LEN];
    AesOsRng.fill_bytes(&mut nonce);
    nonce
}

/// Encrypts `plaintext` under `key`/`nonce`, returning ciphertext||tag.
/// Callers that need the nonce recoverable from the blob alone (the
/// manifest envelope) prepend it themselves; callers that already carry
/// the nonce out-of-band (the per-chunk `Nonce` field) don't.
pub fn aes_gcm_seal(key: &[u8; AES_KEY_LEN], nonce: &[u8; AES_NONCE_LEN], plaintext: &[u8]) -> Result<Vec<u8>> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    cipher
        .encrypt(AesNonce::from_slice(nonce), plaintext)
        .map_err(|e| Error::Invariant(format!("aes-gcm seal failed: {e}")))
}

pub fn aes_gcm_open(key: &[u8; AES_KEY_LEN], nonce: &[u8; AES_NONCE_LEN], ciphertext: &[u8]) -> Result<Vec<u8>> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    cipher
        .decrypt(AesNonce::from_slice(nonce), ciphertext)
        .map_err(|e| Error::Invariant(format!("aes-gcm open failed: {e}")))
}

/// Seals `plaintext` with a fresh nonce, prepending it to the output
/// (`nonce || ciphertext || tag`). Used for the manifest envelope, which
/// carries no external nonce field.
pub fn aes_gcm_seal_with_fresh_nonce(key: &[u8; AES_KEY_LEN], plaintext: &[u8]) -> Result<Vec<u8>> {
    let nonce = generate_nonce();
    let mut sealed = aes_gcm_seal(key, &nonce, plaintext)?;
    let mut out = Vec::with_capacity(AES_NONCE_LEN + sealed.len());
    out.extend_from_slice(&nonce);
    out.append(&mut sealed);
    Ok(out)
}

pub fn aes_gcm_open_prefixed(key: &[u8; AES_KEY_LEN], sealed: &[u8]) -> Result<Vec<u8>> {
    if sealed.len() < AES_NONCE_LEN {
        return Err(Error::Invariant("sealed envelope shorter than nonce".into()));
    }
    let (nonce_bytes, ciphertext) = sealed.split_at(AES_NONCE_LEN);
    let mut nonce = [0u8; AES_NONCE_LEN];
    nonce.copy_from_slice(nonce_bytes);
    aes_gcm_open(key, &nonce, ciphertext)
}

/// Encrypts a chunk's content digest under `(key, nonce)`; the result is
/// used as the chunk's address in the wrapped child backend. `(key,
/// nonce)` must never be reused across distinct chunks.
pub fn encrypt_digest(key: &[u8; AES_KEY_LEN], nonce: &[u8; AES_NONCE_LEN], digest: &Digest) -> Result<Digest> {
    let sealed = aes_gcm_seal(key, nonce, digest.as_bytes())?;
    Ok(Digest::from_bytes(sealed))
}

pub fn rsa_oaep_wrap(public_key: &RsaPublicKey, key: &[u8; AES_KEY_LEN]) -> Result<Vec<u8>> {
    let mut rng = rand::rngs::OsRng;
    public_key
        .encrypt(&mut rng, Oaep::new::<Sha256>(), key)
        .map_err(|e| Error::Invariant(format!("rsa-oaep wrap failed: {e}")))
}

pub fn rsa_oaep_unwrap(private_key: &RsaPrivateKey, wrapped: &[u8]) -> Result<[u8; AES_KEY_LEN]> {
    let unwrapped = private_key
        .decrypt(Oaep::new::<Sha256>(), wrapped)
        .map_err(|e| Error::Invariant(format!("rsa-oaep unwrap failed: {e}")))?;
    if unwrapped.len() != AES_KEY_LEN {
        return Err(Error::Invariant("unwrapped key has unexpected length".into()));
    }
    let mut key = [0u8; AES_KEY_LEN];
    key.copy_from_slice(&unwrapped);
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;
    #[test]
    fn sha256_is_deterministic() {
        assert_eq!(sha256(b"hello"), sha256(b"hello"));
        assert_ne!(sha256(b"hello"), sha256(b"world"));
    }

    #[test]
    fn aes_round_trip() {
        let key = generate_aes_key();
        let nonce = generate_nonce();
        let ciphertext = aes_gcm_seal(&key, &nonce, b"payload").unwrap();
        let plaintext = aes_gcm_open(&key, &nonce, &ciphertext).unwrap();
        assert_eq!(plaintext, b"payload");
    }

    #[test]
    fn aes_envelope_round_trip() {
        let key = generate_aes_key();
        let sealed = aes_gcm_seal_with_fresh_nonce(&key, b"manifest bytes").unwrap();
        let opened = aes_gcm_open_prefixed(&key, &sealed).unwrap();
        assert_eq!(opened, b"manifest bytes");
    }

    #[test]
    fn different_nonce_yields_different_ciphertext() {
        let key = generate_aes_key();
        let a = aes_gcm_seal(&key, &generate_nonce(), b"same plaintext").unwrap();
        let b = aes_gcm_seal(&key, &generate_nonce(), b"same plaintext").unwrap();
        assert_ne!(a, b);
    }

    fn test_keypair() -> (RsaPrivateKey, RsaPublicKey) {
        let mut rng = rand::rngs::OsRng;
        let private_key = RsaPrivateKey::new(&mut rng, 2048).expect("key generation");
        let public_key = RsaPublicKey::from(&private_key);
        (private_key, public_key)
    }

    #[test]
    fn rsa_oaep_round_trip() {
        let (private_key, public_key) = test_keypair();
        let aes_key = generate_aes_key();
        let wrapped = rsa_oaep_wrap(&public_key, &aes_key).unwrap();
        let unwrapped = rsa_oaep_unwrap(&private_key, &wrapped).unwrap();
        assert_eq!(aes_key, unwrapped);
    }
}
