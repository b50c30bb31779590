//! In-process coordination store
//!
//! A linearizable store living inside one process: every operation runs under
//! a single lock, sequential suffixes come from a per-parent counter, and
//! ephemeral nodes are tied to the session that created them. Used for
//! single-host clusters, the `simulate` command and tests, which can expire
//! sessions or drop connections at will.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::{oneshot, watch, Mutex};

use super::{
    Connector, CoordinationStore, NodeKind, SessionState, StoreError, StoreResult,
    Watch, WatchEvent, SEQUENCE_DIGITS,
};

struct StoredNode {
    data: Vec<u8>,
    /// Owning session for ephemeral nodes
    owner: Option<u64>,
}

struct ArmedWatch {
    session: u64,
    tx: oneshot::Sender<WatchEvent>,
}

#[derive(Default)]
struct HubState {
    nodes: BTreeMap<String, StoredNode>,
    sequences: HashMap<String, u64>,
    watches: HashMap<String, Vec<ArmedWatch>>,
    sessions: HashMap<u64, watch::Sender<SessionState>>,
    next_session: u64,
    list_calls: HashMap<String, u64>,
}

impl HubState {
    fn check_session(&self, session: u64) -> StoreResult<()> {
        match self.sessions.get(&session).map(|tx| *tx.borrow()) {
            Some(SessionState::Connected) => Ok(()),
            Some(SessionState::Disconnected) => Err(StoreError::ConnectionLoss),
            // Ended sessions are forgotten
            Some(SessionState::Expired | SessionState::Closed) | None => {
                Err(StoreError::SessionExpired)
            }
        }
    }

    fn exists(&self, path: &str) -> bool {
        path == "/" || self.nodes.contains_key(path)
    }

    fn children(&self, path: &str) -> Vec<String> {
        let prefix = if path == "/" { "/".to_string() } else { format!("{}/", path) };
        self.nodes
            .range(prefix.clone()..)
            .take_while(|(key, _)| key.starts_with(&prefix))
            .filter_map(|(key, _)| {
                let rest = &key[prefix.len()..];
                (!rest.contains('/')).then(|| rest.to_string())
            })
            .collect()
    }

    fn fire(&mut self, path: &str) {
        if let Some(armed) = self.watches.remove(path) {
            for w in armed {
                let _ = w.tx.send(WatchEvent::ChildrenChanged { path: path.to_string() });
            }
        }
    }

    /// End a session: drop its watches, remove its ephemerals, notify parents
    fn end_session(&mut self, session: u64, state: SessionState) {
        if let Some(tx) = self.sessions.remove(&session) {
            tx.send_replace(state);
        }

        self.watches.retain(|_, armed| {
            armed.retain(|w| w.session != session && !w.tx.is_closed());
            !armed.is_empty()
        });

        let owned: Vec<String> = self
            .nodes
            .iter()
            .filter(|(_, node)| node.owner == Some(session))
            .map(|(path, _)| path.clone())
            .collect();

        let mut parents = Vec::new();
        for path in owned {
            self.nodes.remove(&path);
            let parent = parent_of(&path);
            if !parents.contains(&parent) {
                parents.push(parent);
            }
        }
        for parent in parents {
            self.fire(&parent);
        }
    }
}

fn parent_of(path: &str) -> String {
    match path.rfind('/') {
        Some(0) | None => "/".to_string(),
        Some(idx) => path[..idx].to_string(),
    }
}

/// Shared in-process coordination store
#[derive(Clone, Default)]
pub struct MemoryCoordinator {
    state: Arc<Mutex<HubState>>,
}

impl MemoryCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a new session
    pub async fn open_session(&self) -> MemorySession {
        let mut state = self.state.lock().await;
        state.next_session += 1;
        let id = state.next_session;
        let (tx, rx) = watch::channel(SessionState::Connected);
        state.sessions.insert(id, tx);
        tracing::debug!("Opened coordination session {}", id);

        MemorySession {
            id,
            hub: self.clone(),
            state_rx: rx,
        }
    }

    /// Expire a session as the store would after a crash or long partition
    pub async fn expire_session(&self, session: u64) {
        let mut state = self.state.lock().await;
        state.end_session(session, SessionState::Expired);
        tracing::debug!("Expired coordination session {}", session);
    }

    /// Expire whichever session owns the ephemeral node at `path`
    pub async fn expire_owner(&self, path: &str) -> Option<u64> {
        let mut state = self.state.lock().await;
        let owner = state.nodes.get(path).and_then(|n| n.owner)?;
        state.end_session(owner, SessionState::Expired);
        Some(owner)
    }

    /// Drop or restore a session's connection without expiring it
    pub async fn set_connected(&self, session: u64, connected: bool) {
        let state = self.state.lock().await;
        if let Some(tx) = state.sessions.get(&session) {
            let current = *tx.borrow();
            if matches!(current, SessionState::Connected | SessionState::Disconnected) {
                tx.send_replace(if connected {
                    SessionState::Connected
                } else {
                    SessionState::Disconnected
                });
            }
        }
    }

    /// Ground truth: children of `path`
    pub async fn children(&self, path: &str) -> Vec<String> {
        self.state.lock().await.children(path)
    }

    /// Ground truth: data at `path`
    pub async fn data(&self, path: &str) -> Option<Vec<u8>> {
        self.state.lock().await.nodes.get(path).map(|n| n.data.clone())
    }

    /// Number of armed watches on `path`
    pub async fn watch_count(&self, path: &str) -> usize {
        self.state
            .lock()
            .await
            .watches
            .get(path)
            .map(|w| w.iter().filter(|w| !w.tx.is_closed()).count())
            .unwrap_or(0)
    }

    /// Number of sessions that have not ended
    pub async fn session_count(&self) -> usize {
        self.state.lock().await.sessions.len()
    }

    /// Number of listings requested for `path`, failed ones included
    pub async fn list_calls(&self, path: &str) -> u64 {
        self.state.lock().await.list_calls.get(path).copied().unwrap_or(0)
    }
}

#[async_trait::async_trait]
impl Connector for MemoryCoordinator {
    async fn connect(&self) -> StoreResult<Arc<dyn CoordinationStore>> {
        Ok(Arc::new(self.open_session().await))
    }
}

/// One session against a [`MemoryCoordinator`]
pub struct MemorySession {
    id: u64,
    hub: MemoryCoordinator,
    state_rx: watch::Receiver<SessionState>,
}

impl MemorySession {
    async fn list(&self, path: &str, arm: bool) -> StoreResult<(Vec<String>, Option<Watch>)> {
        let mut state = self.hub.state.lock().await;
        *state.list_calls.entry(path.to_string()).or_default() += 1;
        state.check_session(self.id)?;
        if !state.exists(path) {
            return Err(StoreError::NoNode(path.to_string()));
        }

        let children = state.children(path);
        let watch = arm.then(|| {
            let (tx, rx) = oneshot::channel();
            let armed = state.watches.entry(path.to_string()).or_default();
            // Watches whose receiver was dropped can never be delivered
            armed.retain(|w| !w.tx.is_closed());
            armed.push(ArmedWatch { session: self.id, tx });
            Watch::new(rx)
        });

        Ok((children, watch))
    }
}

#[async_trait::async_trait]
impl CoordinationStore for MemorySession {
    fn session_id(&self) -> u64 {
        self.id
    }

    async fn create_node(&self, path: &str, data: &[u8], kind: NodeKind) -> StoreResult<String> {
        let mut state = self.hub.state.lock().await;
        state.check_session(self.id)?;

        let parent = parent_of(path);
        if !state.exists(&parent) {
            return Err(StoreError::NoNode(parent));
        }

        let actual = match kind {
            NodeKind::EphemeralSequential => {
                let counter = state.sequences.entry(parent.clone()).or_insert(0);
                let seq = *counter;
                *counter += 1;
                format!("{}{:0width$}", path, seq, width = SEQUENCE_DIGITS)
            }
            NodeKind::Persistent | NodeKind::Ephemeral => path.to_string(),
        };

        if state.nodes.contains_key(&actual) {
            return Err(StoreError::AlreadyExists(actual));
        }

        state.nodes.insert(
            actual.clone(),
            StoredNode {
                data: data.to_vec(),
                owner: kind.is_ephemeral().then_some(self.id),
            },
        );
        state.fire(&parent);

        Ok(actual)
    }

    async fn list_children(&self, path: &str) -> StoreResult<Vec<String>> {
        let (children, _) = self.list(path, false).await?;
        Ok(children)
    }

    async fn list_children_watched(&self, path: &str) -> StoreResult<(Vec<String>, Watch)> {
        let (children, watch) = self.list(path, true).await?;
        let watch = watch.ok_or_else(|| StoreError::Other("watch not armed".into()))?;
        Ok((children, watch))
    }

    async fn get_data(&self, path: &str) -> StoreResult<Vec<u8>> {
        let state = self.hub.state.lock().await;
        state.check_session(self.id)?;
        state
            .nodes
            .get(path)
            .map(|n| n.data.clone())
            .ok_or_else(|| StoreError::NoNode(path.to_string()))
    }

    async fn delete_node(&self, path: &str) -> StoreResult<()> {
        let mut state = self.hub.state.lock().await;
        state.check_session(self.id)?;

        if !state.nodes.contains_key(path) {
            return Err(StoreError::NoNode(path.to_string()));
        }
        if !state.children(path).is_empty() {
            return Err(StoreError::Other(format!("node has children: {}", path)));
        }

        state.nodes.remove(path);
        state.fire(&parent_of(path));
        Ok(())
    }

    fn session_state(&self) -> watch::Receiver<SessionState> {
        self.state_rx.clone()
    }

    async fn close(&self) -> StoreResult<()> {
        let mut state = self.hub.state.lock().await;
        state.end_session(self.id, SessionState::Closed);
        tracing::debug!("Closed coordination session {}", self.id);
        Ok(())
    }
}
