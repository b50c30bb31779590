//! Replica Applier
//!
//! Follower side of replication: appends writes pushed by the leader to the
//! local record log. Writes from a node this follower no longer considers
//! leader are refused, so fan-out from a deposed leader cancels itself at the
//! receiving end.

use std::sync::Arc;

use super::log::RecordLog;
use super::protocol::ErrorCode;
use super::Message;
use crate::state::{NodeId, ViewReader};

/// Reason sent back when the sender is not our leader
pub const STALE_LEADER: &str = "stale-leader";

/// Applies replicated writes on a follower
pub struct ReplicaApplier {
    node_id: NodeId,
    view: ViewReader,
    log: Arc<RecordLog>,
}

impl ReplicaApplier {
    pub fn new(node_id: NodeId, view: ViewReader, log: Arc<RecordLog>) -> Self {
        Self { node_id, view, log }
    }

    /// Handle one inbound message and produce the response
    pub async fn apply(&self, message: Message) -> Message {
        let (leader_id, epoch, index, payload) = match message {
            Message::Replicate {
                leader_id,
                epoch,
                index,
                payload,
            } => (leader_id, epoch, index, payload),
            other => {
                return Message::Error {
                    code: ErrorCode::Unexpected,
                    message: format!("{} is not accepted by followers", other.type_name()),
                };
            }
        };

        let view = self.view.current();
        if let Some(current) = view.leader_id.as_deref() {
            if current != leader_id {
                tracing::info!(
                    "Refusing write {} from {}: following {} (epoch {})",
                    index,
                    leader_id,
                    current,
                    view.epoch
                );
                return Message::ReplicateAck {
                    node_id: self.node_id.clone(),
                    index,
                    accepted: false,
                    reason: Some(STALE_LEADER.to_string()),
                };
            }
        }

        self.log.append_replicated(&leader_id, epoch, index, payload).await;
        tracing::debug!("Applied write {} from {}", index, leader_id);

        Message::ReplicateAck {
            node_id: self.node_id.clone(),
            index,
            accepted: true,
            reason: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use crate::state::ViewPublisher;

    fn replicate(leader: &str, index: u64) -> Message {
        Message::Replicate {
            leader_id: leader.to_string(),
            epoch: 1,
            index,
            payload: b"{\"k\":1}".to_vec(),
        }
    }

    fn live() -> BTreeMap<NodeId, String> {
        BTreeMap::from([
            ("n1".to_string(), "a:1".to_string()),
            ("n2".to_string(), "b:1".to_string()),
        ])
    }

    #[tokio::test]
    async fn test_applies_from_known_leader() {
        let publisher = ViewPublisher::new("n2".into());
        publisher.publish(Some("n1".into()), live());
        let log = Arc::new(RecordLog::new());
        let applier = ReplicaApplier::new("n2".into(), publisher.reader(), Arc::clone(&log));

        let ack = applier.apply(replicate("n1", 5)).await;
        assert!(matches!(ack, Message::ReplicateAck { accepted: true, index: 5, .. }));

        let records = log.records().await;
        assert_eq!(records[0].index, 5);
        assert_eq!(records[0].leader_id, "n1");
    }

    #[tokio::test]
    async fn test_refuses_deposed_leader() {
        let publisher = ViewPublisher::new("n2".into());
        publisher.publish(Some("n3".into()), live());
        let log = Arc::new(RecordLog::new());
        let applier = ReplicaApplier::new("n2".into(), publisher.reader(), Arc::clone(&log));

        match applier.apply(replicate("n1", 5)).await {
            Message::ReplicateAck { accepted, reason, .. } => {
                assert!(!accepted);
                assert_eq!(reason.as_deref(), Some(STALE_LEADER));
            }
            other => panic!("unexpected {}", other.type_name()),
        }
        assert!(log.is_empty().await);
    }

    #[tokio::test]
    async fn test_accepts_while_leader_unknown() {
        let publisher = ViewPublisher::new("n2".into());
        let log = Arc::new(RecordLog::new());
        let applier = ReplicaApplier::new("n2".into(), publisher.reader(), Arc::clone(&log));

        let ack = applier.apply(replicate("n1", 1)).await;
        assert!(matches!(ack, Message::ReplicateAck { accepted: true, .. }));
    }

    #[tokio::test]
    async fn test_rejects_unexpected_message() {
        let publisher = ViewPublisher::new("n2".into());
        let log = Arc::new(RecordLog::new());
        let applier = ReplicaApplier::new("n2".into(), publisher.reader(), log);

        let reply = applier
            .apply(Message::ReplicateAck {
                node_id: "n1".into(),
                index: 1,
                accepted: true,
                reason: None,
            })
            .await;
        assert!(matches!(reply, Message::Error { code: ErrorCode::Unexpected, .. }));
    }
}
