//! Configuration schema and the provider registry: parses the JSON
//! `Config` document and recursively builds a `Backend` trait-object
//! tree from it via a provider-name -> constructor registry.
//!
//! The registry is a process-global mapping, but it is populated
//! explicitly in one place ([`Registry::with_default_providers`])
//! rather than through scattered module-level self-registration.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use once_cell::sync::Lazy;
use rsa::pkcs1::{DecodeRsaPrivateKey, DecodeRsaPublicKey};
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey};
use rsa::{RsaPrivateKey, RsaPublicKey};
use serde::{Deserialize, Serialize};

use crate::backend::composite::{CompositeBackend, Member};
use crate::backend::encrypt::EncryptBackend;
use crate::backend::local::LocalBackend;
use crate::backend::memory::{self, MemoryBackend};
use crate::backend::remote::{RemoteBackend, RemoteProvider};
use crate::backend::test_stubs::{FailBackend, WinBackend};
use crate::backend::BackendRef;
use crate::error::{Error, Result};

/// OAuth token acquisition lives outside this crate: these fields
/// round-trip through config parsing so a `Config` document that names
/// `amazon`/`google` with an `OAuth` block still parses, but nothing
/// here reads them to make an HTTP call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OAuthConfig {
    #[serde(rename = "ClientID")]
    pub client_id: String,
    #[serde(rename = "ClientSecret")]
    pub client_secret: String,
    #[serde(rename = "Scopes", default)]
    pub scopes: Vec<String>,
    #[serde(rename = "TokenPath")]
    pub token_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(rename = "Provider")]
    pub provider: String,
    #[serde(rename = "FileParentID", default)]
    pub file_parent_id: Option<String>,
    #[serde(rename = "ChunkParentID", default)]
    pub chunk_parent_id: Option<String>,
    #[serde(rename = "Write", default)]
    pub write: bool,
    #[serde(rename = "MaxFiles", default)]
    pub max_files: usize,
    #[serde(rename = "MaxChunkBytes", default)]
    pub max_chunk_bytes: u64,
    #[serde(rename = "RsaPublicKey", default)]
    pub rsa_public_key: Option<String>,
    #[serde(rename = "RsaPrivateKey", default)]
    pub rsa_private_key: Option<String>,
    #[serde(rename = "OAuth", default)]
    pub oauth: Option<OAuthConfig>,
    #[serde(rename = "Children", default)]
    pub children: Vec<Config>,
}

impl Config {
    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        let config: Config = serde_json::from_slice(bytes)
            .map_err(|e| Error::Invariant(format!("malformed config document: {e}")))?;
        if config.provider.trim().is_empty() {
            return Err(Error::UnknownProvider(String::new()));
        }
        Ok(config)
    }
}

type BuildFuture<'a> = Pin<Box<dyn Future<Output = Result<BackendRef>> + Send + 'a>>;
type Constructor = for<'a> fn(&'a Registry, &'a Config) -> BuildFuture<'a>;

pub struct Registry {
    constructors: HashMap<&'static str, Constructor>,
}

impl Registry {
    /// Explicit, one-shot population of the provider table, initialized
    /// here rather than via per-backend module constructors.
    pub fn with_default_providers() -> Self {
        let mut constructors: HashMap<&'static str, Constructor> = HashMap::new();
        constructors.insert("memory", build_memory);
        constructors.insert("local", build_local);
        constructors.insert("composite", build_composite);
        constructors.insert("encrypt", build_encrypt);
        constructors.insert("amazon", build_amazon);
        constructors.insert("google", build_google);
        constructors.insert("fail", build_fail);
        constructors.insert("win", build_win);
        Registry { constructors }
    }

    pub fn build<'a>(&'a self, config: &'a Config) -> BuildFuture<'a> {
        Box::pin(async move {
            let key = config.provider.to_ascii_lowercase();
            let ctor = self
                .constructors
                .get(key.as_str())
                .ok_or_else(|| Error::UnknownProvider(config.provider.clone()))?;
            ctor(self, config).await
        })
    }
}

static REGISTRY: Lazy<Registry> = Lazy::new(Registry::with_default_providers);

/// Builds a `Backend` tree from a parsed `Config` document using the
/// default process-wide provider registry.
pub async fn build_backend(config: &Config) -> Result<BackendRef> {
    REGISTRY.build(config).await
}

fn build_memory<'a>(_registry: &'a Registry, config: &'a Config) -> BuildFuture<'a> {
    Box::pin(async move {
        let max_files = if config.max_files == 0 { memory::DEFAULT_MAX_MANIFESTS } else { config.max_files };
        let max_bytes = if config.max_chunk_bytes == 0 { memory::DEFAULT_MAX_CHUNK_BYTES } else { config.max_chunk_bytes };
        Ok(Arc::new(MemoryBackend::new(max_files, max_bytes)) as BackendRef)
    })
}

fn build_local<'a>(_registry: &'a Registry, config: &'a Config) -> BuildFuture<'a> {
    Box::pin(async move {
        let file_dir = config
            .file_parent_id
            .clone()
            .ok_or_else(|| Error::Invariant("local backend requires FileParentID".into()))?;
        let chunk_dir = config
            .chunk_parent_id
            .clone()
            .ok_or_else(|| Error::Invariant("local backend requires ChunkParentID".into()))?;
        let backend = LocalBackend::open(file_dir, chunk_dir, config.max_files, config.max_chunk_bytes)
            .await
            .map_err(|e| Error::io("open local backend directories", e))?;
        Ok(Arc::new(backend) as BackendRef)
    })
}

fn build_composite<'a>(registry: &'a Registry, config: &'a Config) -> BuildFuture<'a> {
    Box::pin(async move {
        if config.children.is_empty() {
            return Err(Error::Invariant("composite backend requires at least one child".into()));
        }
        let mut members = Vec::with_capacity(config.children.len());
        for child_config in &config.children {
            let child = registry.build(child_config).await?;
            members.push(Member::new(child, child_config.write));
        }
        Ok(Arc::new(CompositeBackend::new(members)) as BackendRef)
    })
}

fn build_encrypt<'a>(registry: &'a Registry, config: &'a Config) -> BuildFuture<'a> {
    Box::pin(async move {
        let child_config = config
            .children
            .first()
            .ok_or_else(|| Error::Invariant("encrypt backend requires exactly one child".into()))?;
        let child = registry.build(child_config).await?;

        let public_pem = config
            .rsa_public_key
            .as_ref()
            .ok_or_else(|| Error::Invariant("encrypt backend requires RsaPublicKey".into()))?;
        let public_key = parse_public_key(public_pem)?;

        let private_key = match &config.rsa_private_key {
            Some(pem) => Some(parse_private_key(pem)?),
            None => None,
        };

        Ok(Arc::new(EncryptBackend::new(child, public_key, private_key)) as BackendRef)
    })
}

fn build_amazon<'a>(_registry: &'a Registry, _config: &'a Config) -> BuildFuture<'a> {
    Box::pin(async move { Ok(Arc::new(RemoteBackend::new(RemoteProvider::Amazon)) as BackendRef) })
}

fn build_google<'a>(_registry: &'a Registry, _config: &'a Config) -> BuildFuture<'a> {
    Box::pin(async move { Ok(Arc::new(RemoteBackend::new(RemoteProvider::Google)) as BackendRef) })
}

fn build_fail<'a>(_registry: &'a Registry, config: &'a Config) -> BuildFuture<'a> {
    Box::pin(async move {
        let name = config.file_parent_id.clone().unwrap_or_else(|| "fail".to_string());
        Ok(Arc::new(FailBackend::new(name, config.write)) as BackendRef)
    })
}

fn build_win<'a>(_registry: &'a Registry, config: &'a Config) -> BuildFuture<'a> {
    Box::pin(async move {
        let name = config.file_parent_id.clone().unwrap_or_else(|| "win".to_string());
        Ok(Arc::new(WinBackend::new(name, config.write)) as BackendRef)
    })
}

/// Accepts either PKIX (PKCS8) or PKCS1 PEM-encoded keys.
fn parse_public_key(pem: &str) -> Result<RsaPublicKey> {
    RsaPublicKey::from_public_key_pem(pem)
        .or_else(|_| RsaPublicKey::from_pkcs1_pem(pem))
        .map_err(|e| Error::Invariant(format!("malformed RsaPublicKey: {e}")))
}

fn parse_private_key(pem: &str) -> Result<RsaPrivateKey> {
    RsaPrivateKey::from_pkcs8_pem(pem)
        .or_else(|_| RsaPrivateKey::from_pkcs1_pem(pem))
        .map_err(|e| Error::Invariant(format!("malformed RsaPrivateKey: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::sha256;

    #[tokio::test]
    async fn builds_memory_backend_from_json() {
        let config = Config::from_json(br#"{"Provider": "memory"}"#).unwrap();
        let backend = build_backend(&config).await.unwrap();
        let data = b"hello".to_vec();
        let digest = sha256(&data);
        backend.put_chunk(&digest, &data, &crate::backend::FileHint::none()).await.unwrap();
        assert_eq!(backend.get_chunk(&digest, &crate::backend::FileHint::none()).await.unwrap(), data);
    }

    #[tokio::test]
    async fn unknown_provider_is_rejected() {
        let config = Config::from_json(br#"{"Provider": "dropbox"}"#).unwrap();
        let err = build_backend(&config).await.unwrap_err();
        assert!(matches!(err, Error::UnknownProvider(_)));
    }

    #[tokio::test]
    async fn empty_provider_name_is_rejected_at_parse_time() {
        let err = Config::from_json(br#"{"Provider": ""}"#).unwrap_err();
        assert!(matches!(err, Error::UnknownProvider(_)));
    }

    #[tokio::test]
    async fn builds_composite_of_two_memory_children() {
        let config = Config::from_json(
            br#"{
                "Provider": "composite",
                "Children": [
                    {"Provider": "memory", "Write": true},
                    {"Provider": "memory", "Write": true}
                ]
            }"#,
        )
        .unwrap();
        let backend = build_backend(&config).await.unwrap();
        assert!(backend.describe().persistent == false || backend.describe().persistent == true);
        let digest = sha256(b"x");
        backend.put_chunk(&digest, b"x", &crate::backend::FileHint::none()).await.unwrap();
    }

    #[tokio::test]
    async fn composite_without_children_is_an_invariant_error() {
        let config = Config::from_json(br#"{"Provider": "composite"}"#).unwrap();
        let err = build_backend(&config).await.unwrap_err();
        assert!(matches!(err, Error::Invariant(_)));
    }

    #[tokio::test]
    async fn builds_encrypt_wrapping_memory() {
        use rsa::pkcs8::EncodePublicKey;
        let mut rng = rand::rngs::OsRng;
        let private = rsa::RsaPrivateKey::new(&mut rng, 2048).unwrap();
        let public = rsa::RsaPublicKey::from(&private);
        let public_pem = public.to_public_key_pem(rsa::pkcs8::LineEnding::LF).unwrap();

        let json = serde_json::json!({
            "Provider": "encrypt",
            "RsaPublicKey": public_pem,
            "Children": [{"Provider": "memory"}]
        });
        let config = Config::from_json(json.to_string().as_bytes()).unwrap();
        let backend = build_backend(&config).await.unwrap();

        let plaintext = b"{\"Filename\":\"a\"}".to_vec();
        let digest = sha256(&plaintext);
        backend.put_manifest(&digest, &plaintext).await.unwrap();
        // No private key configured: reading back must fail closed.
        let err = backend.get_manifest(&digest).await.unwrap_err();
        assert!(matches!(err, Error::KeyUnavailable));
    }
}
