//! Cluster View
//!
//! Node-local, eventually consistent snapshot of the cluster. A new snapshot
//! replaces the old one wholesale, so readers never see a half-updated view.

use std::collections::BTreeMap;
use std::sync::Arc;
use serde::Serialize;
use tokio::sync::watch;

use super::NodeId;

/// Snapshot of who is alive and who leads, as observed by this node
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClusterView {
    /// This node's ID
    pub self_id: NodeId,
    /// Current leader, if an election has completed
    pub leader_id: Option<NodeId>,
    /// Live members and their addresses
    pub live: BTreeMap<NodeId, String>,
    /// Incremented on every change of leader or live set
    pub epoch: u64,
}

impl ClusterView {
    fn initial(self_id: NodeId) -> Self {
        Self {
            self_id,
            leader_id: None,
            live: BTreeMap::new(),
            epoch: 0,
        }
    }

    pub fn is_leader(&self) -> bool {
        self.leader_id.as_deref() == Some(self.self_id.as_str())
    }

    pub fn is_live(&self, id: &str) -> bool {
        self.live.contains_key(id)
    }

    pub fn live_ids(&self) -> Vec<NodeId> {
        self.live.keys().cloned().collect()
    }

    /// Live members other than this node
    pub fn followers(&self) -> impl Iterator<Item = (&NodeId, &String)> {
        self.live.iter().filter(move |(id, _)| **id != self.self_id)
    }

    fn same_content(&self, leader_id: &Option<NodeId>, live: &BTreeMap<NodeId, String>) -> bool {
        &self.leader_id == leader_id && &self.live == live
    }
}

/// Owns the current view and publishes replacements
pub struct ViewPublisher {
    tx: watch::Sender<Arc<ClusterView>>,
}

impl ViewPublisher {
    pub fn new(self_id: NodeId) -> Self {
        let (tx, _) = watch::channel(Arc::new(ClusterView::initial(self_id)));
        Self { tx }
    }

    /// Publish a freshly derived view. Returns it if anything changed.
    pub fn publish(
        &self,
        leader_id: Option<NodeId>,
        live: BTreeMap<NodeId, String>,
    ) -> Option<Arc<ClusterView>> {
        let current = self.current();
        if current.same_content(&leader_id, &live) {
            return None;
        }

        let next = Arc::new(ClusterView {
            self_id: current.self_id.clone(),
            leader_id,
            live,
            epoch: current.epoch + 1,
        });
        self.tx.send_replace(Arc::clone(&next));

        tracing::debug!(
            "Cluster view epoch {}: leader={:?}, live={:?}",
            next.epoch,
            next.leader_id,
            next.live.keys().collect::<Vec<_>>()
        );
        Some(next)
    }

    /// Publish the "don't know" view: no leader, no known live members
    pub fn publish_unknown(&self) -> Option<Arc<ClusterView>> {
        self.publish(None, BTreeMap::new())
    }

    pub fn current(&self) -> Arc<ClusterView> {
        Arc::clone(&self.tx.borrow())
    }

    pub fn reader(&self) -> ViewReader {
        ViewReader {
            rx: self.tx.subscribe(),
        }
    }
}

/// Read side of the cluster view. Cheap to clone, never blocks.
#[derive(Clone)]
pub struct ViewReader {
    rx: watch::Receiver<Arc<ClusterView>>,
}

impl ViewReader {
    pub fn current(&self) -> Arc<ClusterView> {
        Arc::clone(&self.rx.borrow())
    }

    /// Wait until a view satisfying `pred` is published (or is current)
    pub async fn wait_for<F>(&mut self, mut pred: F) -> crate::Result<Arc<ClusterView>>
    where
        F: FnMut(&ClusterView) -> bool,
    {
        let view = self
            .rx
            .wait_for(|v| pred(&**v))
            .await
            .map_err(|_| crate::Error::ShuttingDown)?;
        Ok(Arc::clone(&view))
    }

    /// Wait for the next published view
    pub async fn changed(&mut self) -> crate::Result<Arc<ClusterView>> {
        self.rx.changed().await.map_err(|_| crate::Error::ShuttingDown)?;
        Ok(Arc::clone(&self.rx.borrow_and_update()))
    }
}
