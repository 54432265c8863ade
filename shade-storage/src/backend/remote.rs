//! Remote provider stubs for `amazon` and `google`, unified on
//! digest-only content addressing. The concrete HTTP plumbing and OAuth
//! token acquisition for either provider live outside this engine;
//! `RemoteBackend` is the contract those bindings would sit behind. It
//! implements [`Backend`] by returning [`Error::Unsupported`] for every
//! data operation except `describe`, so a `Composite` containing one
//! compiles and participates in `describe`-driven decisions (e.g. "is
//! any child persistent") without a real network client.

use std::collections::HashSet;

use async_trait::async_trait;
use futures::stream::{self, BoxStream};

use super::{Backend, Describe, FileHint};
use crate::error::{Error, Result};
use crate::model::Digest;

/// Which unimplemented cloud provider this stub stands in for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteProvider {
    Amazon,
    Google,
}

impl RemoteProvider {
    fn name(&self) -> &'static str {
        match self {
            RemoteProvider::Amazon => "amazon",
            RemoteProvider::Google => "google",
        }
    }
}

pub struct RemoteBackend {
    provider: RemoteProvider,
}

impl RemoteBackend {
    pub fn new(provider: RemoteProvider) -> Self {
        RemoteBackend { provider }
    }

    fn unsupported(&self, op: &str) -> Error {
        Error::Unsupported(format!("{} backend: {op} requires HTTP plumbing not built in this engine", self.provider.name()))
    }
}

#[async_trait]
impl Backend for RemoteBackend {
    async fn list_manifests(&self) -> Result<HashSet<Digest>> {
        Err(self.unsupported("list_manifests"))
    }

    async fn get_manifest(&self, _digest: &Digest) -> Result<Vec<u8>> {
        Err(self.unsupported("get_manifest"))
    }

    async fn put_manifest(&self, _digest: &Digest, _bytes: &[u8]) -> Result<()> {
        Err(self.unsupported("put_manifest"))
    }

    async fn release_manifest(&self, _digest: &Digest) -> Result<()> {
        Err(self.unsupported("release_manifest"))
    }

    async fn get_chunk(&self, _digest: &Digest, _hint: &FileHint) -> Result<Vec<u8>> {
        Err(self.unsupported("get_chunk"))
    }

    async fn put_chunk(&self, _digest: &Digest, _bytes: &[u8], _hint: &FileHint) -> Result<()> {
        Err(self.unsupported("put_chunk"))
    }

    async fn release_chunk(&self, _digest: &Digest) -> Result<()> {
        Err(self.unsupported("release_chunk"))
    }

    fn list_chunks(&self) -> BoxStream<'static, Result<Digest>> {
        stream::empty().boxed()
    }

    fn describe(&self) -> Describe {
        Describe {
            name: self.provider.name().into(),
            local: false,
            persistent: true,
        }
    }
}
