//! In-memory registry ensemble.
//!
//! A single shared tree of nodes with session ownership. Every
//! [`MemorySession`] obtained from [`MemoryRegistry::connect`] behaves like
//! an independent client process: it owns its ephemerals, sees its own
//! session state, and can be expired or suspended from the outside to
//! simulate crashes and network partitions.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, watch};
use tracing::{debug, info};

use crate::error::{RegistryError, RegistryResult};
use crate::types::{
    CreateMode, SessionId, SessionState, WatchEvent, WatchEventKind, WatchKind, WatchStream,
};
use crate::{parent_path, validate_path, RegistryClient};

const WATCH_CAPACITY: usize = 256;

// =============================================================================
// Ensemble
// =============================================================================

/// Shared in-memory registry. Cloning yields another handle to the same tree.
#[derive(Clone, Default)]
pub struct MemoryRegistry {
    inner: Arc<Ensemble>,
}

#[derive(Default)]
struct Ensemble {
    tree: Mutex<Tree>,
    next_session: AtomicU64,
}

#[derive(Default)]
struct Tree {
    nodes: BTreeMap<String, Node>,
    sessions: HashMap<SessionId, SessionEntry>,
    watches: HashMap<(String, WatchKind), Vec<Registration>>,
    sequence: u64,
    clock_offset_ms: i64,
}

struct Node {
    data: String,
    owner: Option<SessionId>,
}

struct SessionEntry {
    state: SessionState,
    state_tx: Arc<watch::Sender<SessionState>>,
}

struct Registration {
    session: SessionId,
    tx: broadcast::Sender<WatchEvent>,
}

impl Ensemble {
    fn lock(&self) -> MutexGuard<'_, Tree> {
        // A panic while holding the lock leaves the tree consistent: every
        // mutation is applied before events are sent.
        self.tree.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn open_session(&self, state_tx: Arc<watch::Sender<SessionState>>) -> SessionId {
        let id = SessionId(self.next_session.fetch_add(1, Ordering::SeqCst) + 1);
        self.lock().sessions.insert(
            id,
            SessionEntry {
                state: SessionState::Connected,
                state_tx,
            },
        );
        id
    }
}

impl MemoryRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a new client session.
    pub fn connect(&self) -> MemorySession {
        let (state_tx, _) = watch::channel(SessionState::Connected);
        let state_tx = Arc::new(state_tx);
        let session = self.inner.open_session(Arc::clone(&state_tx));
        debug!(session = %session, "Opened registry session");

        MemorySession {
            ensemble: Arc::clone(&self.inner),
            session: Mutex::new(session),
            state_tx,
            watches: Mutex::new(HashMap::new()),
        }
    }

    /// Expire a session: delete its ephemerals and fail its operations.
    pub fn expire(&self, session: SessionId) {
        let mut tree = self.inner.lock();
        tree.watches
            .values_mut()
            .for_each(|regs| regs.retain(|r| r.session != session));
        tree.remove_ephemerals(session);
        tree.set_session_state(session, SessionState::Expired);
        info!(session = %session, "Registry session expired");
    }

    /// Suspend a session: ephemerals survive, operations time out.
    pub fn suspend(&self, session: SessionId) {
        self.inner
            .lock()
            .set_session_state(session, SessionState::Suspended);
    }

    /// Resume a suspended session.
    pub fn resume(&self, session: SessionId) {
        let mut tree = self.inner.lock();
        if tree.session_state(session) == Some(SessionState::Suspended) {
            tree.set_session_state(session, SessionState::Connected);
        }
    }

    /// Skew the advertised server clock relative to local time.
    pub fn set_clock_offset(&self, offset: chrono::Duration) {
        self.inner.lock().clock_offset_ms = offset.num_milliseconds();
    }

    /// Owner session of an ephemeral node, if any.
    pub fn owner_of(&self, path: &str) -> Option<SessionId> {
        self.inner.lock().nodes.get(path).and_then(|n| n.owner)
    }
}

impl Tree {
    fn session_state(&self, session: SessionId) -> Option<SessionState> {
        self.sessions.get(&session).map(|s| s.state)
    }

    fn set_session_state(&mut self, session: SessionId, state: SessionState) {
        if let Some(entry) = self.sessions.get_mut(&session) {
            entry.state = state;
            entry.state_tx.send_replace(state);
        }
    }

    fn check_session(&self, session: SessionId, op: &str) -> RegistryResult<()> {
        match self.session_state(session) {
            Some(SessionState::Connected) => Ok(()),
            Some(SessionState::Suspended) => Err(RegistryError::Timeout(op.to_string())),
            Some(SessionState::Expired) | None => Err(RegistryError::SessionLost),
        }
    }

    fn exists(&self, path: &str) -> bool {
        path == "/" || self.nodes.contains_key(path)
    }

    fn emit(&self, path: &str, kind: WatchKind, event: WatchEvent) {
        if let Some(regs) = self.watches.get(&(path.to_string(), kind)) {
            for reg in regs {
                let _ = reg.tx.send(event.clone());
            }
        }
    }

    fn node_event(&self, path: &str, kind: WatchEventKind, data: Option<String>) {
        self.emit(
            path,
            WatchKind::Data,
            WatchEvent {
                path: path.to_string(),
                kind,
                data,
            },
        );

        if matches!(kind, WatchEventKind::Created | WatchEventKind::Deleted) {
            if let Some(parent) = parent_path(path) {
                self.emit(
                    parent,
                    WatchKind::Children,
                    WatchEvent {
                        path: parent.to_string(),
                        kind: WatchEventKind::ChildrenChanged,
                        data: None,
                    },
                );
            }
        }
    }

    fn ensure_parents(&mut self, path: &str) {
        let mut missing = Vec::new();
        let mut current = parent_path(path);
        while let Some(p) = current {
            if self.exists(p) {
                break;
            }
            missing.push(p.to_string());
            current = parent_path(p);
        }

        for p in missing.into_iter().rev() {
            self.nodes.insert(
                p.clone(),
                Node {
                    data: String::new(),
                    owner: None,
                },
            );
            self.node_event(&p, WatchEventKind::Created, Some(String::new()));
        }
    }

    fn insert(&mut self, path: &str, data: &str, owner: Option<SessionId>) {
        self.ensure_parents(path);
        self.nodes.insert(
            path.to_string(),
            Node {
                data: data.to_string(),
                owner,
            },
        );
        self.node_event(path, WatchEventKind::Created, Some(data.to_string()));
    }

    fn remove_subtree(&mut self, path: &str) {
        let prefix = if path == "/" {
            "/".to_string()
        } else {
            format!("{path}/")
        };

        let mut doomed: Vec<String> = self
            .nodes
            .range(prefix.clone()..)
            .take_while(|(k, _)| k.starts_with(&prefix))
            .map(|(k, _)| k.clone())
            .collect();
        // Descendants sort after their ancestors; reverse to delete leaves first.
        doomed.reverse();
        if path != "/" && self.nodes.contains_key(path) {
            doomed.push(path.to_string());
        }

        for p in doomed {
            if let Some(node) = self.nodes.remove(&p) {
                self.node_event(&p, WatchEventKind::Deleted, Some(node.data));
            }
        }
    }

    fn remove_ephemerals(&mut self, session: SessionId) {
        let owned: Vec<String> = self
            .nodes
            .iter()
            .filter(|(_, n)| n.owner == Some(session))
            .map(|(k, _)| k.clone())
            .collect();

        for p in owned.into_iter().rev() {
            self.remove_subtree(&p);
        }
    }

    fn children(&self, path: &str) -> Vec<String> {
        let prefix = if path == "/" {
            "/".to_string()
        } else {
            format!("{path}/")
        };

        self.nodes
            .range(prefix.clone()..)
            .take_while(|(k, _)| k.starts_with(&prefix))
            .filter_map(|(k, _)| {
                let rest = &k[prefix.len()..];
                (!rest.contains('/')).then(|| rest.to_string())
            })
            .collect()
    }
}

// =============================================================================
// Session Client
// =============================================================================

/// One client session against a [`MemoryRegistry`].
pub struct MemorySession {
    ensemble: Arc<Ensemble>,
    session: Mutex<SessionId>,
    state_tx: Arc<watch::Sender<SessionState>>,
    watches: Mutex<HashMap<(String, WatchKind), broadcast::Sender<WatchEvent>>>,
}

impl MemorySession {
    fn current(&self) -> SessionId {
        *self
            .session
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl RegistryClient for MemorySession {
    fn session_id(&self) -> SessionId {
        self.current()
    }

    fn session_state(&self) -> watch::Receiver<SessionState> {
        self.state_tx.subscribe()
    }

    async fn create(&self, path: &str, data: &str, mode: CreateMode) -> RegistryResult<String> {
        validate_path(path)?;
        let session = self.current();
        let mut tree = self.ensemble.lock();
        tree.check_session(session, "create")?;

        let actual = match mode {
            CreateMode::EphemeralSequential => {
                tree.sequence += 1;
                format!("{path}{:010}", tree.sequence)
            }
            _ => path.to_string(),
        };

        if tree.exists(&actual) {
            return Err(RegistryError::Exists(actual));
        }

        let owner = mode.is_ephemeral().then_some(session);
        tree.insert(&actual, data, owner);
        Ok(actual)
    }

    async fn set(&self, path: &str, data: &str) -> RegistryResult<()> {
        validate_path(path)?;
        let session = self.current();
        let mut tree = self.ensemble.lock();
        tree.check_session(session, "set")?;

        let updated = match tree.nodes.get_mut(path) {
            Some(node) => {
                node.data = data.to_string();
                true
            }
            None => false,
        };

        if updated {
            tree.node_event(path, WatchEventKind::Changed, Some(data.to_string()));
        } else {
            tree.insert(path, data, None);
        }
        Ok(())
    }

    async fn get(&self, path: &str) -> RegistryResult<Option<String>> {
        validate_path(path)?;
        let session = self.current();
        let tree = self.ensemble.lock();
        tree.check_session(session, "get")?;
        Ok(tree.nodes.get(path).map(|n| n.data.clone()))
    }

    async fn exists(&self, path: &str) -> RegistryResult<bool> {
        validate_path(path)?;
        let session = self.current();
        let tree = self.ensemble.lock();
        tree.check_session(session, "exists")?;
        Ok(tree.exists(path))
    }

    async fn children(&self, path: &str) -> RegistryResult<Vec<String>> {
        validate_path(path)?;
        let session = self.current();
        let tree = self.ensemble.lock();
        tree.check_session(session, "children")?;
        Ok(tree.children(path))
    }

    async fn delete(&self, path: &str) -> RegistryResult<()> {
        validate_path(path)?;
        let session = self.current();
        let mut tree = self.ensemble.lock();
        tree.check_session(session, "delete")?;
        tree.remove_subtree(path);
        Ok(())
    }

    async fn watch(&self, path: &str, kind: WatchKind) -> RegistryResult<WatchStream> {
        validate_path(path)?;
        let session = self.current();
        let mut watches = self.watches.lock().unwrap_or_else(|p| p.into_inner());
        let key = (path.to_string(), kind);

        if let Some(tx) = watches.get(&key) {
            return Ok(WatchStream::new(path.to_string(), tx.subscribe()));
        }

        let mut tree = self.ensemble.lock();
        tree.check_session(session, "watch")?;
        let (tx, rx) = broadcast::channel(WATCH_CAPACITY);
        tree.watches.entry(key.clone()).or_default().push(Registration {
            session,
            tx: tx.clone(),
        });
        watches.insert(key, tx);

        Ok(WatchStream::new(path.to_string(), rx))
    }

    async fn server_time(&self) -> RegistryResult<DateTime<Utc>> {
        let session = self.current();
        let tree = self.ensemble.lock();
        tree.check_session(session, "server_time")?;
        Ok(Utc::now() + chrono::Duration::milliseconds(tree.clock_offset_ms))
    }

    async fn reconnect(&self) -> RegistryResult<()> {
        let old = self.current();
        if self.ensemble.lock().session_state(old) != Some(SessionState::Expired) {
            return Ok(());
        }

        let new = self.ensemble.open_session(Arc::clone(&self.state_tx));
        let watches = self.watches.lock().unwrap_or_else(|p| p.into_inner());
        {
            let mut tree = self.ensemble.lock();
            tree.sessions.remove(&old);
            for (key, tx) in watches.iter() {
                tree.watches.entry(key.clone()).or_default().push(Registration {
                    session: new,
                    tx: tx.clone(),
                });
            }
        }
        *self.session.lock().unwrap_or_else(|p| p.into_inner()) = new;
        self.state_tx.send_replace(SessionState::Connected);

        info!(old_session = %old, new_session = %new, "Registry session re-established");
        Ok(())
    }

    async fn close(&self) {
        let session = self.current();
        let mut tree = self.ensemble.lock();
        tree.watches
            .values_mut()
            .for_each(|regs| regs.retain(|r| r.session != session));
        tree.remove_ephemerals(session);
        tree.set_session_state(session, SessionState::Expired);
        debug!(session = %session, "Closed registry session");
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_create_makes_parents_and_rejects_duplicates() {
        let registry = MemoryRegistry::new();
        let client = registry.connect();

        client
            .create("/ns/job/config", "yaml", CreateMode::Persistent)
            .await
            .unwrap();
        assert!(client.exists("/ns/job").await.unwrap());
        assert_eq!(client.children("/ns").await.unwrap(), vec!["job"]);

        let err = client
            .create("/ns/job/config", "other", CreateMode::Persistent)
            .await
            .unwrap_err();
        assert!(err.is_exists());
    }

    #[tokio::test]
    async fn test_children_sorted_and_direct_only() {
        let registry = MemoryRegistry::new();
        let client = registry.connect();

        for p in ["/j/sharding/2/instance", "/j/sharding/0/instance", "/j/sharding/10/instance"] {
            client.set(p, "x").await.unwrap();
        }
        client.set("/j/sharding/necessary", "").await.unwrap();

        assert_eq!(
            client.children("/j/sharding").await.unwrap(),
            vec!["0", "10", "2", "necessary"]
        );
        assert!(client.children("/missing").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete_is_recursive_and_idempotent() {
        let registry = MemoryRegistry::new();
        let client = registry.connect();

        client.set("/j/sharding/0/instance", "a").await.unwrap();
        client.set("/j/sharding/1/instance", "b").await.unwrap();
        client.delete("/j/sharding").await.unwrap();
        client.delete("/j/sharding").await.unwrap();

        assert!(!client.exists("/j/sharding").await.unwrap());
        assert!(client.exists("/j").await.unwrap());
    }

    #[tokio::test]
    async fn test_sequential_create() {
        let registry = MemoryRegistry::new();
        let client = registry.connect();

        let first = client
            .create("/locks/lock-", "", CreateMode::EphemeralSequential)
            .await
            .unwrap();
        let second = client
            .create("/locks/lock-", "", CreateMode::EphemeralSequential)
            .await
            .unwrap();

        assert!(first < second);
        assert!(first.starts_with("/locks/lock-"));
    }

    #[tokio::test]
    async fn test_expire_removes_ephemerals_and_fails_ops() {
        let registry = MemoryRegistry::new();
        let a = registry.connect();
        let b = registry.connect();

        a.create("/j/instances/a@1@1", "", CreateMode::Ephemeral)
            .await
            .unwrap();
        a.set("/j/config", "cfg").await.unwrap();

        let mut watch = b.watch("/j/instances", WatchKind::Children).await.unwrap();
        registry.expire(a.session_id());

        let event = watch.next().await.unwrap();
        assert_eq!(event.kind, WatchEventKind::ChildrenChanged);
        assert!(b.children("/j/instances").await.unwrap().is_empty());
        assert_eq!(b.get("/j/config").await.unwrap().as_deref(), Some("cfg"));

        assert_eq!(a.get("/j/config").await.unwrap_err(), RegistryError::SessionLost);
        assert_eq!(*a.session_state().borrow(), SessionState::Expired);
    }

    #[tokio::test]
    async fn test_reconnect_restores_session_and_watches() {
        let registry = MemoryRegistry::new();
        let a = registry.connect();
        let b = registry.connect();
        let mut watch = a.watch("/j/leader", WatchKind::Data).await.unwrap();

        let old = a.session_id();
        registry.expire(old);
        a.reconnect().await.unwrap();
        assert_ne!(a.session_id(), old);
        assert_eq!(*a.session_state().borrow(), SessionState::Connected);

        b.set("/j/leader", "b@1@1").await.unwrap();
        let event = watch.next().await.unwrap();
        assert_eq!(event.kind, WatchEventKind::Created);
        assert_eq!(event.data.as_deref(), Some("b@1@1"));
    }

    #[tokio::test]
    async fn test_suspended_session_times_out_but_keeps_ephemerals() {
        let registry = MemoryRegistry::new();
        let a = registry.connect();
        let b = registry.connect();

        a.create("/j/leader", "a", CreateMode::Ephemeral).await.unwrap();
        registry.suspend(a.session_id());

        assert!(matches!(
            a.get("/j/leader").await.unwrap_err(),
            RegistryError::Timeout(_)
        ));
        assert!(b.exists("/j/leader").await.unwrap());

        registry.resume(a.session_id());
        assert!(a.exists("/j/leader").await.unwrap());
    }

    #[tokio::test]
    async fn test_watch_is_multiplexed_per_path() {
        let registry = MemoryRegistry::new();
        let client = registry.connect();

        let mut first = client.watch("/j/config", WatchKind::Data).await.unwrap();
        let mut second = client.watch("/j/config", WatchKind::Data).await.unwrap();
        {
            let tree = registry.inner.lock();
            let regs = &tree.watches[&("/j/config".to_string(), WatchKind::Data)];
            assert_eq!(regs.len(), 1);
        }

        client.set("/j/config", "v1").await.unwrap();
        client.set("/j/config", "v2").await.unwrap();

        assert_eq!(first.next().await.unwrap().kind, WatchEventKind::Created);
        assert_eq!(first.next().await.unwrap().data.as_deref(), Some("v2"));
        assert_eq!(second.next().await.unwrap().data.as_deref(), Some("v1"));
    }

    #[tokio::test]
    async fn test_deleted_event_carries_last_data() {
        let registry = MemoryRegistry::new();
        let a = registry.connect();
        let b = registry.connect();

        a.create("/j/execution/0/running", "a@1@1", CreateMode::Ephemeral)
            .await
            .unwrap();
        let mut watch = b
            .watch("/j/execution/0/running", WatchKind::Data)
            .await
            .unwrap();
        registry.expire(a.session_id());

        let event = watch.next().await.unwrap();
        assert_eq!(event.kind, WatchEventKind::Deleted);
        assert_eq!(event.data.as_deref(), Some("a@1@1"));
    }

    #[tokio::test]
    async fn test_server_time_offset() {
        let registry = MemoryRegistry::new();
        let client = registry.connect();
        registry.set_clock_offset(chrono::Duration::seconds(120));

        let skew = client.server_time().await.unwrap() - Utc::now();
        assert!(skew.num_seconds() >= 119);
    }
}
