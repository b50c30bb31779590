//! Coordination Store Adapter
//!
//! Contract over a linearizable, session-based hierarchical key-value store
//! (ZooKeeper-style). Everything above this module talks to the store only
//! through [`CoordinationStore`] and opens sessions through [`Connector`].

mod memory;

pub use memory::{MemoryCoordinator, MemorySession};

use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{oneshot, watch};

/// Number of digits in a sequential node suffix
pub const SEQUENCE_DIGITS: usize = 10;

/// Result type for store operations
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Tagged outcome of a failed store call
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("node already exists: {0}")]
    AlreadyExists(String),

    #[error("no such node: {0}")]
    NoNode(String),

    #[error("connection to coordination store lost")]
    ConnectionLoss,

    #[error("coordination session expired")]
    SessionExpired,

    #[error("{0}")]
    Other(String),
}

impl StoreError {
    /// True if the owning session can no longer be trusted
    pub fn is_session_loss(&self) -> bool {
        matches!(self, StoreError::SessionExpired)
    }
}

/// Kind of node to create
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    /// Survives the session that created it
    Persistent,
    /// Removed when the owning session ends
    Ephemeral,
    /// Ephemeral, with a strictly increasing suffix appended to the name
    EphemeralSequential,
}

impl NodeKind {
    pub fn is_ephemeral(&self) -> bool {
        !matches!(self, NodeKind::Persistent)
    }
}

/// State of a coordination session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connected,
    /// Temporarily unreachable; the session may still be alive
    Disconnected,
    /// Gone for good, together with all of its ephemeral nodes
    Expired,
    /// Closed by its owner
    Closed,
}

/// Delivered once by a [`Watch`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    /// Something under `path` changed. Carries no other guarantee.
    ChildrenChanged { path: String },
    /// The session that armed the watch ended before it fired
    SessionClosed,
}

/// One-shot change notification armed by [`CoordinationStore::list_children_watched`]
#[derive(Debug)]
pub struct Watch {
    rx: oneshot::Receiver<WatchEvent>,
}

impl Watch {
    pub fn new(rx: oneshot::Receiver<WatchEvent>) -> Self {
        Self { rx }
    }

    /// Wait for the watch to fire. Cancel safe.
    pub async fn fired(&mut self) -> WatchEvent {
        (&mut self.rx).await.unwrap_or(WatchEvent::SessionClosed)
    }
}

/// A session against the coordination store
#[async_trait::async_trait]
pub trait CoordinationStore: Send + Sync {
    /// Opaque identifier of this session (for logs)
    fn session_id(&self) -> u64;

    /// Create a node, returning its actual path (sequential nodes get a suffix)
    async fn create_node(&self, path: &str, data: &[u8], kind: NodeKind) -> StoreResult<String>;

    /// List child names of `path`, sorted
    async fn list_children(&self, path: &str) -> StoreResult<Vec<String>>;

    /// List child names of `path` and arm a one-shot watch on it in the same call
    async fn list_children_watched(&self, path: &str) -> StoreResult<(Vec<String>, Watch)>;

    /// Read the data stored at `path`
    async fn get_data(&self, path: &str) -> StoreResult<Vec<u8>>;

    /// Remove a childless node, whoever owns it
    async fn delete_node(&self, path: &str) -> StoreResult<()>;

    /// Observe connection and session state changes
    fn session_state(&self) -> watch::Receiver<SessionState>;

    /// End the session, removing its ephemeral nodes
    async fn close(&self) -> StoreResult<()>;
}

/// Opens new sessions
#[async_trait::async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> StoreResult<Arc<dyn CoordinationStore>>;
}

/// Join a parent path and a child name
pub fn child_path(parent: &str, child: &str) -> String {
    if parent == "/" {
        format!("/{}", child)
    } else {
        format!("{}/{}", parent.trim_end_matches('/'), child)
    }
}

/// Parse the ordinal from a sequential child name such as `leader-0000000007`
pub fn parse_sequence(name: &str, prefix: &str) -> Option<u64> {
    let digits = name.strip_prefix(prefix)?;
    if digits.len() != SEQUENCE_DIGITS || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// Treat "already exists" as success
pub fn tolerate_existing(result: StoreResult<String>) -> StoreResult<()> {
    match result {
        Ok(_) | Err(StoreError::AlreadyExists(_)) => Ok(()),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_child_path() {
        assert_eq!(child_path("/", "election"), "/election");
        assert_eq!(child_path("/live_nodes", "node-1"), "/live_nodes/node-1");
        assert_eq!(child_path("/live_nodes/", "node-1"), "/live_nodes/node-1");
    }

    #[test]
    fn test_parse_sequence() {
        assert_eq!(parse_sequence("leader-0000000042", "leader-"), Some(42));
        assert_eq!(parse_sequence("leader-42", "leader-"), None);
        assert_eq!(parse_sequence("other-0000000042", "leader-"), None);
        assert_eq!(parse_sequence("leader-00000000x2", "leader-"), None);
    }

    #[test]
    fn test_tolerate_existing() {
        assert!(tolerate_existing(Ok("/a".into())).is_ok());
        assert!(tolerate_existing(Err(StoreError::AlreadyExists("/a".into()))).is_ok());
        assert_eq!(
            tolerate_existing(Err(StoreError::ConnectionLoss)),
            Err(StoreError::ConnectionLoss)
        );
    }
}
