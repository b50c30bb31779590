//! Membership Registry
//!
//! Keeps the durable "all nodes ever seen" listing and the transient
//! "currently live" listing in the coordination store. Liveness is exactly
//! the existence of this node's ephemeral record; there is no heartbeat.

use std::collections::BTreeMap;
use std::sync::Arc;
use serde::{Deserialize, Serialize};

use crate::config::CoordinationConfig;
use crate::store::{
    child_path, tolerate_existing, CoordinationStore, NodeKind, StoreError, StoreResult, Watch,
};

use super::NodeId;

/// Identity of a node for the lifetime of its process
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeIdentity {
    /// Unique node identifier
    pub id: NodeId,
    /// Replication address (host:port)
    pub address: String,
}

impl NodeIdentity {
    /// Generate a fresh identity; the id is never reused across processes
    pub fn generate(prefix: &str, address: impl Into<String>) -> Self {
        Self {
            id: format!("{}-{}", prefix, uuid::Uuid::new_v4()),
            address: address.into(),
        }
    }

    pub fn new(id: impl Into<NodeId>, address: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            address: address.into(),
        }
    }
}

/// Result of a live listing
#[derive(Debug)]
pub struct LiveSnapshot {
    /// Live members and their addresses
    pub members: BTreeMap<NodeId, String>,
    /// Watch re-armed by the same listing, if requested
    pub watch: Option<Watch>,
}

/// A registration record
#[derive(Debug, Clone, Serialize)]
pub struct RegisteredNode {
    pub id: NodeId,
    pub address: String,
}

/// Membership registry bound to one coordination session
pub struct MembershipRegistry {
    store: Arc<dyn CoordinationStore>,
    identity: NodeIdentity,
    all_nodes_path: String,
    live_nodes_path: String,
    election_path: String,
}

impl MembershipRegistry {
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        identity: NodeIdentity,
        config: &CoordinationConfig,
    ) -> Self {
        Self {
            store,
            identity,
            all_nodes_path: config.all_nodes_path.clone(),
            live_nodes_path: config.live_nodes_path.clone(),
            election_path: config.election_path.clone(),
        }
    }

    /// Create the namespaces if this is the first node ever
    pub async fn ensure_namespaces(&self) -> StoreResult<()> {
        for path in [&self.all_nodes_path, &self.live_nodes_path, &self.election_path] {
            tolerate_existing(self.store.create_node(path, b"", NodeKind::Persistent).await)?;
        }
        Ok(())
    }

    /// Write the registration and liveness records. Safe to repeat.
    pub async fn register_self(&self) -> StoreResult<()> {
        let address = self.identity.address.as_bytes();

        let registration = child_path(&self.all_nodes_path, &self.identity.id);
        let created = self.store.create_node(&registration, address, NodeKind::Persistent).await;
        tolerate_existing(created)?;

        let liveness = child_path(&self.live_nodes_path, &self.identity.id);
        tolerate_existing(self.store.create_node(&liveness, address, NodeKind::Ephemeral).await)?;

        tracing::info!(
            "Registered {} at {} (session {})",
            self.identity.id,
            self.identity.address,
            self.store.session_id()
        );
        Ok(())
    }

    /// List live members and re-arm the live watch in the same call
    pub async fn list_live(&self) -> StoreResult<LiveSnapshot> {
        let (names, watch) = self.store.list_children_watched(&self.live_nodes_path).await?;
        let members = self.resolve(&self.live_nodes_path, names).await?;
        Ok(LiveSnapshot {
            members,
            watch: Some(watch),
        })
    }

    /// List live members without touching the watch
    pub async fn peek_live(&self) -> StoreResult<LiveSnapshot> {
        let names = self.store.list_children(&self.live_nodes_path).await?;
        let members = self.resolve(&self.live_nodes_path, names).await?;
        Ok(LiveSnapshot { members, watch: None })
    }

    /// Live watch fired. The event says nothing about the current set, so re-list.
    pub async fn on_live_change(&self) -> StoreResult<LiveSnapshot> {
        self.list_live().await
    }

    /// Every node that ever registered
    pub async fn registered_nodes(&self) -> StoreResult<Vec<RegisteredNode>> {
        let names = self.store.list_children(&self.all_nodes_path).await?;
        let resolved = self.resolve(&self.all_nodes_path, names).await?;
        Ok(resolved
            .into_iter()
            .map(|(id, address)| RegisteredNode { id, address })
            .collect())
    }

    async fn resolve(
        &self,
        parent: &str,
        names: Vec<String>,
    ) -> StoreResult<BTreeMap<NodeId, String>> {
        let mut members = BTreeMap::new();
        for name in names {
            match self.store.get_data(&child_path(parent, &name)).await {
                Ok(data) => {
                    members.insert(name, String::from_utf8_lossy(&data).into_owned());
                }
                // Left between the listing and the read
                Err(StoreError::NoNode(_)) => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(members)
    }
}
