//! Always-error and always-success backend stubs used to exercise
//! composite quorum logic and failure propagation in tests, without
//! needing a flaky real backend.

use std::collections::HashSet;

use async_trait::async_trait;
use futures::stream::{self, BoxStream};

use super::{Backend, Describe, FileHint};
use crate::error::{Error, Result};
use crate::model::Digest;

/// A backend that fails every operation. `persistent` is configurable so
/// tests can model both "a non-persistent child that's down" and "the
/// only persistent child just failed".
pub struct FailBackend {
    name: String,
    persistent: bool,
}

impl FailBackend {
    pub fn new(name: impl Into<String>, persistent: bool) -> Self {
        FailBackend {
            name: name.into(),
            persistent,
        }
    }
}

#[async_trait]
impl Backend for FailBackend {
    async fn list_manifests(&self) -> Result<HashSet<Digest>> {
        Err(Error::Io {
            context: format!("{}: list_manifests", self.name),
            source: std::io::Error::new(std::io::ErrorKind::Other, "fail backend"),
        })
    }

    async fn get_manifest(&self, _digest: &Digest) -> Result<Vec<u8>> {
        Err(Error::Io {
            context: format!("{}: get_manifest", self.name),
            source: std::io::Error::new(std::io::ErrorKind::Other, "fail backend"),
        })
    }

    async fn put_manifest(&self, _digest: &Digest, _bytes: &[u8]) -> Result<()> {
        Err(Error::Io {
            context: format!("{}: put_manifest", self.name),
            source: std::io::Error::new(std::io::ErrorKind::Other, "fail backend"),
        })
    }

    async fn release_manifest(&self, _digest: &Digest) -> Result<()> {
        Ok(())
    }

    async fn get_chunk(&self, _digest: &Digest, _hint: &FileHint) -> Result<Vec<u8>> {
        Err(Error::Io {
            context: format!("{}: get_chunk", self.name),
            source: std::io::Error::new(std::io::ErrorKind::Other, "fail backend"),
        })
    }

    async fn put_chunk(&self, _digest: &Digest, _bytes: &[u8], _hint: &FileHint) -> Result<()> {
        Err(Error::Io {
            context: format!("{}: put_chunk", self.name),
            source: std::io::Error::new(std::io::ErrorKind::Other, "fail backend"),
        })
    }

    async fn release_chunk(&self, _digest: &Digest) -> Result<()> {
        Ok(())
    }

    fn list_chunks(&self) -> BoxStream<'static, Result<Digest>> {
        stream::empty().boxed()
    }

    fn describe(&self) -> Describe {
        Describe {
            name: self.name.clone(),
            local: false,
            persistent: self.persistent,
        }
    }
}

/// A backend that accepts everything without storing it — used where a
/// test only cares that a write was acknowledged, not that the data is
/// retrievable.
pub struct WinBackend {
    name: String,
    persistent: bool,
}

impl WinBackend {
    pub fn new(name: impl Into<String>, persistent: bool) -> Self {
        WinBackend {
            name: name.into(),
            persistent,
        }
    }
}

#[async_trait]
impl Backend for WinBackend {
    async fn list_manifests(&self) -> Result<HashSet<Digest>> {
        Ok(HashSet::new())
    }

    async fn get_manifest(&self, digest: &Digest) -> Result<Vec<u8>> {
        Err(Error::NotFound(digest.to_hex()))
    }

    async fn put_manifest(&self, _digest: &Digest, _bytes: &[u8]) -> Result<()> {
        Ok(())
    }

    async fn release_manifest(&self, _digest: &Digest) -> Result<()> {
        Ok(())
    }

    async fn get_chunk(&self, digest: &Digest, _hint: &FileHint) -> Result<Vec<u8>> {
        Err(Error::NotFound(digest.to_hex()))
    }

    async fn put_chunk(&self, _digest: &Digest, _bytes: &[u8], _hint: &FileHint) -> Result<()> {
        Ok(())
    }

    async fn release_chunk(&self, _digest: &Digest) -> Result<()> {
        Ok(())
    }

    fn list_chunks(&self) -> BoxStream<'static, Result<Digest>> {
        stream::empty().boxed()
    }

    fn describe(&self) -> Describe {
        Describe {
            name: self.name.clone(),
            local: true,
            persistent: self.persistent,
        }
    }
}
