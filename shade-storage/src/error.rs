//! Error taxonomy shared by every layer of the storage engine.
//!
//! These are kinds, not per-backend types: a `Local` backend and a
//! `Composite` backend surface the same `Error::NotFound` for "no such
//! digest", so callers above the backend trait never need to know which
//! concrete backend produced it.

use crate::model::Digest;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("io error on {context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invariant violated: {0}")]
    Invariant(String),

    #[error("rsa private key unavailable for this operation")]
    KeyUnavailable,

    #[error("unsupported operation: {0}")]
    Unsupported(String),

    #[error("no persistent writable backend acknowledged the write")]
    PersistentWriteFailed,

    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("directory not empty: {0}")]
    NotEmpty(String),

    #[error("unknown backend provider: {0}")]
    UnknownProvider(String),
}

impl Error {
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Error::Io {
            context: context.into(),
            source,
        }
    }

    pub fn digest_mismatch(expected: &Digest, actual: &Digest) -> Self {
        Error::Invariant(format!(
            "content hash mismatch: expected {}, got {}",
            expected, actual
        ))
    }

    /// True for errors a composite backend should treat as "this child
    /// doesn't have it" rather than a hard failure worth surfacing.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
