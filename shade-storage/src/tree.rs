//! In-memory path index: a `Path -> Node` map built by
//! scanning manifests, with synthetic directories materialized for any
//! ancestor a manifest names but no manifest itself describes.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::backend::BackendRef;
use crate::error::{Error, Result};
use crate::metrics;
use crate::model::{Digest, File, Node, Timestamp};

/// Canonical root path: no leading slash, empty string.
pub const ROOT: &str = "";

fn parent_of(path: &str) -> Option<&str> {
    if path.is_empty() {
        return None;
    }
    match path.rfind('/') {
        Some(idx) => Some(&path[..idx]),
        None => Some(ROOT),
    }
}

fn basename(path: &str) -> &str {
    match path.rfind('/') {
        Some(idx) => &path[idx + 1..],
        None => path,
    }
}

pub struct Tree {
    backend: BackendRef,
    nodes: RwLock<HashMap<String, Node>>,
    known_manifest_digests: RwLock<std::collections::HashSet<Digest>>,
}

impl Tree {
    pub fn new(backend: BackendRef) -> Self {
        let mut nodes = HashMap::new();
        nodes.insert(ROOT.to_string(), Node::synthetic(ROOT.to_string()));
        Tree {
            backend,
            nodes: RwLock::new(nodes),
            known_manifest_digests: RwLock::new(std::collections::HashSet::new()),
        }
    }

    /// Pulls the backend's manifest digests, fetches and applies any not
    /// already seen. Non-exhaustive backend listings are
    /// fine: a later refresh picks up what an earlier one missed.
    pub async fn refresh(&self) -> Result<()> {
        let start = std::time::Instant::now();
        let digests = self.backend.list_manifests().await?;

        let new_digests: Vec<Digest> = {
            let known = self.known_manifest_digests.read();
            digests.iter().filter(|d| !known.contains(*d)).cloned().collect()
        };

        for digest in new_digests {
            match self.backend.get_manifest(&digest).await {
                Ok(bytes) => match File::from_json(&bytes) {
                    Ok(file) => {
                        self.apply(digest.clone(), &file);
                        self.known_manifest_digests.write().insert(digest);
                    }
                    Err(e) => {
                        warn!(digest = %digest, error = %e, "tree refresh: skipping unparsable manifest");
                    }
                },
                Err(e) => {
                    warn!(digest = %digest, error = %e, "tree refresh: failed to fetch manifest");
                }
            }
        }

        let elapsed_ms = start.elapsed().as_millis() as i64;
        metrics::metrics().last_refresh_ms.set(elapsed_ms);
        metrics::metrics().tree_size.set(self.num_nodes() as i64);
        debug!(elapsed_ms, "tree refresh complete");
        Ok(())
    }

    /// Applies one parsed manifest under invariant 2 (newest
    /// non-deleted wins, ties broken by manifest digest) and invariant 3
    /// (synthetic ancestors materialized as needed). Locks per node, not
    /// for the whole call, so concurrent reads stay serviceable.
    fn apply(&self, digest: Digest, file: &File) {
        let incoming = Node::from_file(digest, file);
        self.insert_or_supersede(incoming);
    }

    fn insert_or_supersede(&self, incoming: Node) {
        let path = incoming.filename.clone();
        {
            let mut nodes = self.nodes.write();
            let should_write = match nodes.get(&path) {
                Some(existing) => is_newer(&incoming, existing),
                None => true,
            };
            if !should_write {
                return;
            }
            let previous_children = nodes.get(&path).map(|n| n.children.clone()).unwrap_or_default();
            let mut node = incoming;
            node.children = previous_children;
            nodes.insert(path.clone(), node);
        }

        if self.nodes.read().get(&path).map(|n| n.deleted).unwrap_or(false) {
            self.detach_from_parent(&path);
        } else {
            self.attach_to_parent(&path);
        }
    }

    /// Links `path` into its parent's `Children`, materializing the
    /// parent as a synthetic node if it doesn't exist yet. Recurses
    /// upward only when the parent was freshly created — an
    /// already-existing parent was necessarily linked into its own
    /// parent when it was first created, by the same induction.
    fn attach_to_parent(&self, path: &str) {
        let Some(parent_path) = parent_of(path) else { return };
        let name = basename(path).to_string();
        let mut nodes = self.nodes.write();
        let parent_existed = nodes.contains_key(parent_path);
        nodes
            .entry(parent_path.to_string())
            .or_insert_with(|| Node::synthetic(parent_path.to_string()));
        nodes.get_mut(parent_path).unwrap().children.insert(name);
        drop(nodes);
        if !parent_existed && parent_path != ROOT {
            self.attach_to_parent(parent_path);
        }
    }

    fn detach_from_parent(&self, path: &str) {
        let Some(parent_path) = parent_of(path) else { return };
        let name = basename(path);
        let mut nodes = self.nodes.write();
        if let Some(parent) = nodes.get_mut(parent_path) {
            parent.children.remove(name);
        }
    }

    pub fn node_by_path(&self, path: &str) -> Result<Node> {
        let nodes = self.nodes.read();
        match nodes.get(path) {
            Some(node) if !node.deleted => Ok(node.clone()),
            _ => Err(Error::NotFound(path.to_string())),
        }
    }

    /// Fetches and parses the manifest underlying `node`. Fails for
    /// synthetic nodes, which have nothing persisted to fetch.
    pub async fn file_by_node(&self, node: &Node) -> Result<File> {
        let digest = node
            .sha256sum
            .as_ref()
            .ok_or_else(|| Error::Invariant(format!("node {} is synthetic, has no manifest", node.filename)))?;
        let bytes = self.backend.get_manifest(digest).await?;
        File::from_json(&bytes).map_err(|e| Error::Invariant(format!("malformed manifest at {digest}: {e}")))
    }

    /// Inserts a synthetic directory node. Pure RAM, never persisted.
    pub fn mkdir(&self, path: &str) {
        {
            let mut nodes = self.nodes.write();
            nodes.entry(path.to_string()).or_insert_with(|| Node::synthetic(path.to_string()));
        }
        self.attach_to_parent(path);
    }

    /// Inserts a placeholder node with a sentinel address so `lookup`
    /// finds it before the first flush produces a real manifest.
    pub fn create(&self, path: &str, modified_time: Timestamp) {
        let node = Node {
            filename: path.to_string(),
            filesize: 0,
            modified_time,
            deleted: false,
            sha256sum: Some(Digest::pending_sentinel()),
            children: Default::default(),
        };
        self.insert_or_supersede(node);
    }

    /// Replaces the stored node if the incoming `ModifiedTime` is not
    /// older.
    pub fn update(&self, digest: Digest, file: &File) {
        self.apply(digest, file);
    }

    /// The `ModifiedTime` of a tombstoned node at `path`, if one is
    /// currently held. Used to resolve a `create` racing a `Deleted`
    /// manifest for the same path: the new
    /// manifest's timestamp is minted strictly after this one.
    pub fn tombstone_time(&self, path: &str) -> Option<Timestamp> {
        let nodes = self.nodes.read();
        match nodes.get(path) {
            Some(n) if n.deleted => Some(n.modified_time),
            _ => None,
        }
    }

    pub fn has_child(&self, parent: &str, child: &str) -> bool {
        self.nodes.read().get(parent).map(|n| n.children.contains(child)).unwrap_or(false)
    }

    pub fn num_nodes(&self) -> usize {
        self.nodes.read().len()
    }

    /// Publishes a tombstone for `path` directly into the tree; the
    /// caller is responsible for having already persisted it via
    /// `put_manifest`.
    pub fn mark_deleted(&self, path: &str, digest: Digest, modified_time: Timestamp) {
        let node = Node {
            filename: path.to_string(),
            filesize: 0,
            modified_time,
            deleted: true,
            sha256sum: Some(digest),
            children: Default::default(),
        };
        self.insert_or_supersede(node);
    }

    /// Removes a synthetic directory node outright. Fails if the node
    /// still has children.
    pub fn remove_empty_dir(&self, path: &str) -> Result<()> {
        {
            let nodes = self.nodes.read();
            match nodes.get(path) {
                Some(n) if !n.children.is_empty() => return Err(Error::NotEmpty(path.to_string())),
                Some(_) => {}
                None => return Err(Error::NotFound(path.to_string())),
            }
        }
        self.nodes.write().remove(path);
        self.detach_from_parent(path);
        Ok(())
    }

    /// Spawns a background task that refreshes the tree on a fixed
    /// interval, logging failures rather than propagating them.
    pub fn spawn_periodic_refresh(self: &Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let tree = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if let Err(e) = tree.refresh().await {
                    warn!(error = %e, "periodic tree refresh failed");
                }
            }
        })
    }
}

/// Later `ModifiedTime` wins; on exact equality the greater manifest
/// digest wins (lexicographic over the raw bytes).
fn is_newer(incoming: &Node, existing: &Node) -> bool {
    match incoming.modified_time.cmp(&existing.modified_time) {
        std::cmp::Ordering::Greater => true,
        std::cmp::Ordering::Less => false,
        std::cmp::Ordering::Equal => match (&incoming.sha256sum, &existing.sha256sum) {
            (Some(a), Some(b)) => a.as_bytes() > b.as_bytes(),
            _ => false,
        },
    }
}
