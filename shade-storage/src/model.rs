//! The content-addressed data model: [`Digest`], the [`File`] manifest,
//! per-chunk entries, and the in-memory [`Node`] view the [`crate::tree`]
//! builds from manifests.

use std::collections::BTreeSet;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use serde::de::Error as DeError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// An opaque content address. Usually `SHA-256(bytes)` (32 bytes), but the
/// Encrypt backend also mints addresses by sealing a digest under a
/// per-chunk key/nonce (48 bytes) — callers above the backend trait treat
/// both uniformly as an opaque byte string.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Digest(Vec<u8>);

impl Digest {
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Digest(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        Ok(Digest(hex::decode(s)?))
    }

    /// Sentinel address used by a tombstone manifest's `Sha256sum`: not a
    /// real content hash, just a marker recognizable by callers that
    /// branch on "is this file logically removed".
    pub fn deleted_sentinel() -> Self {
        Digest(b"deleted".to_vec())
    }

    /// Sentinel used by `Tree::create` before the first flush has
    /// produced a real manifest digest.
    pub fn pending_sentinel() -> Self {
        Digest(b"pending".to_vec())
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({})", self.to_hex())
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl Serialize for Digest {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&B64.encode(&self.0))
    }
}

impl<'de> Deserialize<'de> for Digest {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        let bytes = B64.decode(s.as_bytes()).map_err(DeError::custom)?;
        Ok(Digest(bytes))
    }
}

mod base64_array {
    use base64::engine::general_purpose::STANDARD as B64;
    use base64::Engine as _;
    use serde::de::Error as DeError;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer, const N: usize>(value: &[u8; N], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&B64.encode(value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>, const N: usize>(deserializer: D) -> Result<[u8; N], D::Error> {
        let s = String::deserialize(deserializer)?;
        let bytes = B64.decode(s.as_bytes()).map_err(DeError::custom)?;
        bytes
            .try_into()
            .map_err(|_| DeError::custom(format!("expected {N} bytes")))
    }
}

mod base64_array_opt {
    use base64::engine::general_purpose::STANDARD as B64;
    use base64::Engine as _;
    use serde::de::Error as DeError;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer, const N: usize>(value: &Option<[u8; N]>, serializer: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(v) => serializer.serialize_str(&B64.encode(v)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>, const N: usize>(deserializer: D) -> Result<Option<[u8; N]>, D::Error> {
        let opt = Option::<String>::deserialize(deserializer)?;
        match opt {
            None => Ok(None),
            Some(s) => {
                let bytes = B64.decode(s.as_bytes()).map_err(DeError::custom)?;
                let arr: [u8; N] = bytes
                    .try_into()
                    .map_err(|_| DeError::custom(format!("expected {N} bytes")))?;
                Ok(Some(arr))
            }
        }
    }
}

/// Nanoseconds since the Unix epoch. A plain integer rather than a
/// calendar type: manifests only ever compare two timestamps for
/// ordering, they never format one for a human.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Timestamp(pub i64);

impl Timestamp {
    pub fn now() -> Self {
        let dur = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock before epoch");
        Timestamp(dur.as_nanos() as i64)
    }

    pub fn plus_nanos(self, nanos: i64) -> Self {
        Timestamp(self.0 + nanos)
    }
}

/// One entry in a manifest's ordered chunk list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkEntry {
    #[serde(rename = "Index")]
    pub index: u32,
    #[serde(rename = "Sha256")]
    pub sha256: Digest,
    #[serde(rename = "Nonce", default, skip_serializing_if = "Option::is_none", with = "base64_array_opt")]
    pub nonce: Option<[u8; 12]>,
}

impl ChunkEntry {
    pub fn new(index: u32, sha256: Digest) -> Self {
        ChunkEntry {
            index,
            sha256,
            nonce: None,
        }
    }
}

/// The per-file metadata record. Content-addressed: its own address is
/// `SHA-256` of its canonical JSON encoding. Immutable once written —
/// updates to a logical path mint a new `File` at a new address with a
/// strictly greater `ModifiedTime`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct File {
    #[serde(rename = "Filename")]
    pub filename: String,
    #[serde(rename = "Filesize")]
    pub filesize: i64,
    #[serde(rename = "ModifiedTime")]
    pub modified_time: Timestamp,
    #[serde(rename = "Chunksize")]
    pub chunksize: u64,
    #[serde(rename = "LastChunksize")]
    pub last_chunksize: u64,
    #[serde(rename = "Chunks")]
    pub chunks: Vec<ChunkEntry>,
    #[serde(rename = "AesKey", default, skip_serializing_if = "Option::is_none", with = "base64_array_opt")]
    pub aes_key: Option<[u8; 32]>,
    #[serde(rename = "Deleted", default)]
    pub deleted: bool,
}

impl File {
    pub fn empty(filename: String, chunksize: u64) -> Self {
        File {
            filename,
            filesize: 0,
            modified_time: Timestamp::now(),
            chunksize,
            last_chunksize: 0,
            chunks: Vec::new(),
            aes_key: None,
            deleted: false,
        }
    }

    pub fn tombstone(filename: String, modified_time: Timestamp) -> Self {
        File {
            filename,
            filesize: 0,
            modified_time,
            chunksize: 0,
            last_chunksize: 0,
            chunks: Vec::new(),
            aes_key: None,
            deleted: true,
        }
    }

    /// Invariant 4: `Filesize == (len(Chunks)-1) * Chunksize + LastChunksize`.
    pub fn recompute_filesize(&mut self) {
        self.filesize = if self.chunks.is_empty() {
            0
        } else {
            (self.chunks.len() as i64 - 1) * self.chunksize as i64 + self.last_chunksize as i64
        };
    }

    pub fn to_json(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    pub fn from_json(bytes: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(bytes)
    }
}

/// An AES-GCM encryption envelope wrapping a manifest, as written by the
/// Encrypt backend. Its own address in the child backend
/// is the *plaintext* manifest digest, preserving idempotent lookups.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncryptedEnvelope {
    #[serde(rename = "Key")]
    pub wrapped_key: EnvelopeBytes,
    #[serde(rename = "Bytes")]
    pub sealed_bytes: EnvelopeBytes,
}

/// A base64-encoded opaque byte string of unknown fixed length (the
/// wrapped key and sealed payload vary in size, unlike the fixed-width
/// nonces/keys above).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EnvelopeBytes(#[serde(with = "base64_bytes")] pub Vec<u8>);

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD as B64;
    use base64::Engine as _;
    use serde::de::Error as DeError;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&B64.encode(value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        B64.decode(s.as_bytes()).map_err(DeError::custom)
    }
}

impl EncryptedEnvelope {
    pub fn to_json(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    pub fn from_json(bytes: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(bytes)
    }
}

/// The compact, in-memory view of a manifest held by the [`crate::tree::Tree`].
/// A node with `sha256sum == None` is *synthetic*: it exists only to host
/// descendants and is never persisted (invariant 3).
#[derive(Debug, Clone)]
pub struct Node {
    pub filename: String,
    pub filesize: i64,
    pub modified_time: Timestamp,
    pub deleted: bool,
    pub sha256sum: Option<Digest>,
    pub children: BTreeSet<String>,
}

impl Node {
    pub fn synthetic(filename: String) -> Self {
        Node {
            filename,
            filesize: 0,
            modified_time: Timestamp(0),
            deleted: false,
            sha256sum: None,
            children: BTreeSet::new(),
        }
    }

    pub fn from_file(digest: Digest, file: &File) -> Self {
        Node {
            filename: file.filename.clone(),
            filesize: file.filesize,
            modified_time: file.modified_time,
            deleted: file.deleted,
            sha256sum: Some(digest),
            children: BTreeSet::new(),
        }
    }

    pub fn is_synthetic(&self) -> bool {
        self.sha256sum.is_none()
    }

    pub fn is_dir(&self) -> bool {
        self.is_synthetic() || !self.children.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_round_trips_through_json() {
        let digest = Digest::from_bytes(vec![1, 2, 3, 4]);
        let json = serde_json::to_string(&digest).unwrap();
        let back: Digest = serde_json::from_str(&json).unwrap();
        assert_eq!(digest, back);
    }

    #[test]
    fn file_json_round_trip_matches_wire_format() {
        let mut file = File::empty("a/b.txt".into(), 8);
        file.chunks.push(ChunkEntry::new(0, Digest::from_bytes(vec![9; 32])));
        file.recompute_filesize();
        let json = file.to_json().unwrap();
        let text = String::from_utf8(json.clone()).unwrap();
        assert!(text.contains("\"Filename\""));
        assert!(text.contains("\"Chunks\""));
        let back = File::from_json(&json).unwrap();
        assert_eq!(back.filename, file.filename);
        assert_eq!(back.chunks.len(), 1);
    }

    #[test]
    fn filesize_invariant_empty_file() {
        let file = File::empty("empty".into(), 8);
        assert_eq!(file.filesize, 0);
        assert!(file.chunks.is_empty());
    }
}
