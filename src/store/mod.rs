//! Coordination store
//!
//! A hierarchical, strongly-consistent, watchable node store that backs all
//! cluster metadata:
//! - Persistent nodes, optionally written through to RocksDB
//! - Persistent-sequential nodes named from a per-parent monotonic counter
//! - Ephemeral nodes leased to a [`Session`] and reclaimed when it ends
//! - Watches delivering level-triggered change notifications

pub mod backend;
pub mod path;
pub mod watch;

pub use backend::RocksBackend;
pub use watch::{NodeWatch, Subscription};

use crate::common::{timestamp_now_millis, Result, StoreConfig};
use backend::NodeWrite;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use uuid::Uuid;

/// Stored form of a node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub data: Vec<u8>,
    pub version: u32,
    pub ctime: u64,
    pub mtime: u64,
    /// Suffix handed to the next sequential child
    pub next_sequence: u64,
}

/// Identity of a store session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(Uuid);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Node metadata returned by reads
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stat {
    pub version: u32,
    pub ctime: u64,
    pub mtime: u64,
    pub ephemeral_owner: Option<SessionId>,
    pub num_children: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateMode {
    Persistent,
    PersistentSequential,
}

struct Node {
    record: NodeRecord,
    owner: Option<SessionId>,
}

struct Tree {
    nodes: BTreeMap<String, Node>,
    sessions: HashSet<SessionId>,
    watchers: HashMap<String, tokio::sync::watch::Sender<u64>>,
}

impl Tree {
    fn new() -> Self {
        let mut nodes = BTreeMap::new();
        let now = timestamp_now_millis();
        nodes.insert(
            path::ROOT.to_string(),
            Node {
                record: NodeRecord {
                    data: Vec::new(),
                    version: 0,
                    ctime: now,
                    mtime: now,
                    next_sequence: 0,
                },
                owner: None,
            },
        );
        Self {
            nodes,
            sessions: HashSet::new(),
            watchers: HashMap::new(),
        }
    }

    fn descendants(&self, node_path: &str) -> Vec<String> {
        let prefix = path::descendant_prefix(node_path);
        self.nodes
            .range(prefix.clone()..)
            .take_while(|(p, _)| p.starts_with(&prefix))
            .filter(|(p, _)| p.as_str() != path::ROOT)
            .map(|(p, _)| p.clone())
            .collect()
    }

    fn children(&self, node_path: &str) -> Vec<String> {
        let prefix = path::descendant_prefix(node_path);
        self.nodes
            .range(prefix.clone()..)
            .take_while(|(p, _)| p.starts_with(&prefix))
            .filter_map(|(p, _)| {
                let rest = &p[prefix.len()..];
                (!rest.is_empty() && !rest.contains('/')).then(|| rest.to_string())
            })
            .collect()
    }

    fn stat(&self, node_path: &str) -> Option<Stat> {
        self.nodes.get(node_path).map(|node| Stat {
            version: node.record.version,
            ctime: node.record.ctime,
            mtime: node.record.mtime,
            ephemeral_owner: node.owner,
            num_children: self.children(node_path).len(),
        })
    }

    fn notify(&mut self, node_path: &str) {
        let closed = match self.watchers.get(node_path) {
            Some(tx) if tx.receiver_count() == 0 => true,
            Some(tx) => {
                tx.send_modify(|v| *v = v.wrapping_add(1));
                false
            }
            None => false,
        };
        if closed {
            self.watchers.remove(node_path);
        }
    }

    fn notify_with_parent(&mut self, node_path: &str) {
        self.notify(node_path);
        if let Some(parent) = path::parent(node_path) {
            self.notify(parent);
        }
    }
}

struct Inner {
    tree: Mutex<Tree>,
    backend: Option<RocksBackend>,
}

/// Handle to the coordination store. Cheap to clone.
#[derive(Clone)]
pub struct CoordinationStore {
    inner: Arc<Inner>,
}

impl CoordinationStore {
    /// Store that keeps all nodes in memory
    pub fn in_memory() -> Self {
        Self {
            inner: Arc::new(Inner {
                tree: Mutex::new(Tree::new()),
                backend: None,
            }),
        }
    }

    /// Open a store whose persistent nodes live in RocksDB at `path`
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let backend = RocksBackend::open(db_path)?;
        let mut tree = Tree::new();
        for (node_path, record) in backend.load_all()? {
            if node_path == path::ROOT {
                continue;
            }
            tree.nodes.insert(node_path, Node { record, owner: None });
        }
        tracing::debug!("Loaded {} nodes from disk", tree.nodes.len() - 1);
        Ok(Self {
            inner: Arc::new(Inner {
                tree: Mutex::new(tree),
                backend: Some(backend),
            }),
        })
    }

    pub fn from_config(config: &StoreConfig) -> Result<Self> {
        match &config.path {
            Some(db_path) => Self::open(db_path),
            None => Ok(Self::in_memory()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Tree> {
        self.inner.tree.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn persist(&self, writes: &[NodeWrite<'_>]) -> Result<()> {
        match &self.inner.backend {
            Some(backend) if !writes.is_empty() => backend.write(writes),
            _ => Ok(()),
        }
    }

    // === Sessions ===

    /// Start a session; ephemeral nodes created through it live until it ends
    pub fn open_session(&self) -> Session {
        let id = SessionId(Uuid::new_v4());
        self.lock().sessions.insert(id);
        tracing::debug!("Opened session {}", id);
        Session {
            id,
            store: self.clone(),
        }
    }

    pub fn is_session_alive(&self, id: SessionId) -> bool {
        self.lock().sessions.contains(&id)
    }

    /// End a session and reclaim its ephemeral nodes
    pub fn expire_session(&self, id: SessionId) {
        let mut tree = self.lock();
        if !tree.sessions.remove(&id) {
            return;
        }
        let owned: Vec<String> = tree
            .nodes
            .iter()
            .filter(|(_, node)| node.owner == Some(id))
            .map(|(p, _)| p.clone())
            .collect();
        for node_path in &owned {
            tree.nodes.remove(node_path);
            tree.notify_with_parent(node_path);
        }
        tracing::debug!("Session {} ended, reclaimed {} nodes", id, owned.len());
    }

    // === Node operations ===

    /// Create a persistent node. Returns the actual path, which carries a
    /// sequence suffix in sequential mode.
    pub fn create(&self, node_path: &str, data: &[u8], mode: CreateMode) -> Result<String> {
        self.create_node(node_path, data, mode == CreateMode::PersistentSequential, None)
    }

    /// Create an ephemeral node owned by `session`
    pub fn create_ephemeral(&self, session: &Session, node_path: &str, data: &[u8]) -> Result<String> {
        self.create_node(node_path, data, false, Some(session.id))
    }

    fn create_node(
        &self,
        node_path: &str,
        data: &[u8],
        sequential: bool,
        owner: Option<SessionId>,
    ) -> Result<String> {
        path::validate(node_path)?;
        let parent_path = path::parent(node_path)
            .ok_or_else(|| crate::Error::NodeExists(node_path.to_string()))?;

        let mut tree = self.lock();
        if let Some(owner) = owner {
            if !tree.sessions.contains(&owner) {
                return Err(crate::Error::SessionExpired(owner.to_string()));
            }
        }

        let parent = tree
            .nodes
            .get(parent_path)
            .ok_or_else(|| crate::Error::NodeNotFound(parent_path.to_string()))?;
        if parent.owner.is_some() {
            return Err(crate::Error::EphemeralParent(parent_path.to_string()));
        }
        let mut parent_record = parent.record.clone();

        let actual = if sequential {
            let sequence = parent_record.next_sequence;
            parent_record.next_sequence += 1;
            format!("{}{:010}", node_path, sequence)
        } else {
            node_path.to_string()
        };
        if tree.nodes.contains_key(&actual) {
            return Err(crate::Error::NodeExists(actual));
        }

        let now = timestamp_now_millis();
        let record = NodeRecord {
            data: data.to_vec(),
            version: 0,
            ctime: now,
            mtime: now,
            next_sequence: 0,
        };

        if owner.is_none() {
            let mut writes = vec![NodeWrite::Put(&actual, &record)];
            if sequential && parent_path != path::ROOT {
                writes.push(NodeWrite::Put(parent_path, &parent_record));
            }
            self.persist(&writes)?;
        }

        if sequential {
            if let Some(parent) = tree.nodes.get_mut(parent_path) {
                parent.record.next_sequence = parent_record.next_sequence;
            }
        }
        tree.nodes.insert(actual.clone(), Node { record, owner });
        tree.notify_with_parent(&actual);
        tracing::trace!("Created node {}", actual);

        Ok(actual)
    }

    /// Read node data and metadata
    pub fn get_data(&self, node_path: &str) -> Result<(Vec<u8>, Stat)> {
        let tree = self.lock();
        let node = tree
            .nodes
            .get(node_path)
            .ok_or_else(|| crate::Error::NodeNotFound(node_path.to_string()))?;
        let data = node.record.data.clone();
        let stat = tree
            .stat(node_path)
            .ok_or_else(|| crate::Error::NodeNotFound(node_path.to_string()))?;
        Ok((data, stat))
    }

    pub fn exists(&self, node_path: &str) -> Option<Stat> {
        self.lock().stat(node_path)
    }

    /// Replace node data. With `expected_version`, fails on a concurrent update.
    pub fn set_data(&self, node_path: &str, data: &[u8], expected_version: Option<u32>) -> Result<Stat> {
        let mut tree = self.lock();
        let node = tree
            .nodes
            .get(node_path)
            .ok_or_else(|| crate::Error::NodeNotFound(node_path.to_string()))?;
        if let Some(expected) = expected_version {
            if node.record.version != expected {
                return Err(crate::Error::BadVersion {
                    path: node_path.to_string(),
                    expected,
                    actual: node.record.version,
                });
            }
        }

        let owner = node.owner;
        let mut record = node.record.clone();
        record.data = data.to_vec();
        record.version = record.version.wrapping_add(1);
        record.mtime = timestamp_now_millis();

        if owner.is_none() && node_path != path::ROOT {
            self.persist(&[NodeWrite::Put(node_path, &record)])?;
        }
        tree.nodes.insert(node_path.to_string(), Node { record, owner });
        tree.notify(node_path);

        tree.stat(node_path)
            .ok_or_else(|| crate::Error::NodeNotFound(node_path.to_string()))
    }

    /// Delete a childless node
    pub fn delete(&self, node_path: &str, expected_version: Option<u32>) -> Result<()> {
        if node_path == path::ROOT {
            return Err(crate::Error::InvalidPath(node_path.to_string()));
        }
        let mut tree = self.lock();
        let node = tree
            .nodes
            .get(node_path)
            .ok_or_else(|| crate::Error::NodeNotFound(node_path.to_string()))?;
        if let Some(expected) = expected_version {
            if node.record.version != expected {
                return Err(crate::Error::BadVersion {
                    path: node_path.to_string(),
                    expected,
                    actual: node.record.version,
                });
            }
        }
        if !tree.children(node_path).is_empty() {
            return Err(crate::Error::NotEmpty(node_path.to_string()));
        }

        if node.owner.is_none() {
            self.persist(&[NodeWrite::Delete(node_path)])?;
        }
        tree.nodes.remove(node_path);
        tree.notify_with_parent(node_path);
        tracing::trace!("Deleted node {}", node_path);
        Ok(())
    }

    /// Names of the direct children, sorted
    pub fn children(&self, node_path: &str) -> Result<Vec<String>> {
        let tree = self.lock();
        if !tree.nodes.contains_key(node_path) {
            return Err(crate::Error::NodeNotFound(node_path.to_string()));
        }
        Ok(tree.children(node_path))
    }

    /// Subscribe to changes of a node (creation, data, deletion, children).
    /// The node does not need to exist yet.
    pub fn watch(&self, node_path: &str) -> NodeWatch {
        let mut tree = self.lock();
        tree.watchers.retain(|_, tx| tx.receiver_count() > 0);
        let rx = tree
            .watchers
            .entry(node_path.to_string())
            .or_insert_with(|| tokio::sync::watch::channel(0).0)
            .subscribe();
        NodeWatch::new(node_path.to_string(), rx)
    }

    // === Helpers ===

    /// Create a node and any missing ancestors
    pub fn create_all(&self, node_path: &str) -> Result<()> {
        path::validate(node_path)?;
        let mut current = path::ROOT.to_string();
        for segment in node_path.split('/').filter(|s| !s.is_empty()) {
            current = path::join(&current, segment);
            match self.create(&current, &[], CreateMode::Persistent) {
                Ok(_) | Err(crate::Error::NodeExists(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Delete a node and everything below it
    pub fn delete_recursive(&self, node_path: &str) -> Result<()> {
        if node_path == path::ROOT {
            return Err(crate::Error::InvalidPath(node_path.to_string()));
        }
        let mut tree = self.lock();
        if !tree.nodes.contains_key(node_path) {
            return Err(crate::Error::NodeNotFound(node_path.to_string()));
        }

        let mut doomed = tree.descendants(node_path);
        doomed.push(node_path.to_string());
        // Deepest first
        doomed.sort_by(|a, b| b.cmp(a));

        let persistent: Vec<&String> = doomed
            .iter()
            .filter(|p| tree.nodes.get(p.as_str()).is_some_and(|n| n.owner.is_none()))
            .collect();
        let writes: Vec<NodeWrite<'_>> = persistent
            .iter()
            .map(|p| NodeWrite::Delete(p.as_str()))
            .collect();
        self.persist(&writes)?;

        for doomed_path in &doomed {
            tree.nodes.remove(doomed_path);
            tree.notify_with_parent(doomed_path);
        }
        Ok(())
    }

    /// Delete a node, returning whether it existed
    pub fn delete_if_exists(&self, node_path: &str) -> Result<bool> {
        match self.delete(node_path, None) {
            Ok(()) => Ok(true),
            Err(crate::Error::NodeNotFound(missing)) if missing == node_path => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Write a persistent node, creating it if absent
    pub fn set_or_create(&self, node_path: &str, data: &[u8]) -> Result<()> {
        loop {
            if self.exists(node_path).is_some() {
                match self.set_data(node_path, data, None) {
                    Ok(_) => return Ok(()),
                    Err(crate::Error::NodeNotFound(missing)) if missing == node_path => continue,
                    Err(e) => return Err(e),
                }
            }
            match self.create(node_path, data, CreateMode::Persistent) {
                Ok(_) => return Ok(()),
                Err(crate::Error::NodeExists(_)) => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Write an ephemeral node owned by `session`, creating it if absent.
    /// A node left behind by another session is taken over.
    pub fn set_or_create_ephemeral(&self, session: &Session, node_path: &str, data: &[u8]) -> Result<()> {
        self.upsert_ephemeral(session, node_path, Some(data))
    }

    /// Make sure `session` owns an ephemeral node at `node_path`, creating it
    /// with `initial` when absent. Existing data is kept.
    pub fn claim_ephemeral(&self, session: &Session, node_path: &str, initial: &[u8]) -> Result<()> {
        match self.upsert_ephemeral(session, node_path, None) {
            Err(crate::Error::NodeNotFound(missing)) if missing == node_path => {
                self.upsert_ephemeral(session, node_path, Some(initial))
            }
            other => other,
        }
    }

    /// With `data == None` only ownership changes and an absent node is
    /// reported as `NodeNotFound`.
    fn upsert_ephemeral(&self, session: &Session, node_path: &str, data: Option<&[u8]>) -> Result<()> {
        loop {
            {
                let mut tree = self.lock();
                if !tree.sessions.contains(&session.id) {
                    return Err(crate::Error::SessionExpired(session.id.to_string()));
                }
                if let Some(node) = tree.nodes.get_mut(node_path) {
                    match node.owner {
                        None => return Err(crate::Error::NodeExists(node_path.to_string())),
                        Some(owner) if owner == session.id && data.is_none() => return Ok(()),
                        Some(owner) => {
                            let now = timestamp_now_millis();
                            if owner != session.id {
                                tracing::debug!(
                                    "Session {} takes over {} from {}",
                                    session.id,
                                    node_path,
                                    owner
                                );
                                node.owner = Some(session.id);
                                node.record.ctime = now;
                            }
                            if let Some(data) = data {
                                node.record.data = data.to_vec();
                            }
                            node.record.version = node.record.version.wrapping_add(1);
                            node.record.mtime = now;
                        }
                    }
                    tree.notify(node_path);
                    return Ok(());
                }
            }
            let Some(data) = data else {
                return Err(crate::Error::NodeNotFound(node_path.to_string()));
            };
            match self.create_ephemeral(session, node_path, data) {
                Ok(_) => return Ok(()),
                Err(crate::Error::NodeExists(_)) => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Read a node as UTF-8, `None` when it does not exist
    pub fn get_string(&self, node_path: &str) -> Result<Option<String>> {
        match self.get_data(node_path) {
            Ok((data, _)) => String::from_utf8(data)
                .map(Some)
                .map_err(|_| crate::Error::MetadataCorrupted(format!("{} is not UTF-8", node_path))),
            Err(crate::Error::NodeNotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Read a node holding a decimal integer, `None` when absent or empty
    pub fn get_u32(&self, node_path: &str) -> Result<Option<u32>> {
        match self.get_string(node_path)? {
            None => Ok(None),
            Some(s) if s.trim().is_empty() => Ok(None),
            Some(s) => s.trim().parse().map(Some).map_err(|_| {
                crate::Error::MetadataCorrupted(format!("{} holds '{}', not an integer", node_path, s))
            }),
        }
    }

    /// Flush persistent nodes to disk
    pub fn flush(&self) -> Result<()> {
        match &self.inner.backend {
            Some(backend) => backend.flush(),
            None => Ok(()),
        }
    }
}

/// Lease owning ephemeral nodes. Dropping it ends the session.
pub struct Session {
    id: SessionId,
    store: CoordinationStore,
}

impl Session {
    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn is_alive(&self) -> bool {
        self.store.is_session_alive(self.id)
    }

    pub fn close(self) {}
}

impl Drop for Session {
    fn drop(&mut self) {
        self.store.expire_session(self.id);
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session").field("id", &self.id).finish()
    }
}
