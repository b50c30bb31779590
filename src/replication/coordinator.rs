//! Replication Coordinator
//!
//! Accepts writes while this node leads and fans them out to every other
//! live member. The local append is the commit point: each send is a single
//! independent attempt, nothing waits for follower acknowledgment, and a
//! failed send never rolls the write back.

use std::sync::Arc;
use std::time::Duration;
use futures::future::join_all;
use serde::Serialize;
use tokio::task::JoinHandle;

use crate::error::{Error, Result};
use crate::state::{NodeId, ViewReader};

use super::log::RecordLog;
use super::{Message, ReplicationTransport};

/// Why a write was refused
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum RejectReason {
    /// Writes go to the leader; carries the leader this node knows of
    NotLeader { leader_id: Option<NodeId> },
}

impl RejectReason {
    pub fn code(&self) -> &'static str {
        match self {
            RejectReason::NotLeader { .. } => "not-leader",
        }
    }
}

/// Outcome of one replication send
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum SendStatus {
    /// Follower appended the write
    Delivered,
    /// Follower discarded the write, e.g. because it follows a newer leader
    Refused { reason: String },
    /// Target is no longer live; it resynchronizes when it rejoins
    TargetGone,
    /// Send failed while the target was still live
    Failed { reason: String },
}

/// Per-target result of a fan-out
#[derive(Debug, Clone, Serialize)]
pub struct SendResult {
    pub target: NodeId,
    pub status: SendStatus,
}

/// Handle on the sends issued for one write. Dropping it leaves them running.
pub struct Fanout {
    handle: JoinHandle<Vec<SendResult>>,
}

impl Fanout {
    /// Wait for every send to finish
    pub async fn reports(self) -> Result<Vec<SendResult>> {
        self.handle
            .await
            .map_err(|e| Error::Internal(format!("fan-out task failed: {}", e)))
    }
}

/// A write accepted by the leader
pub struct AcceptedWrite {
    /// Index in the local record log
    pub index: u64,
    /// View epoch the write was accepted under
    pub epoch: u64,
    /// Followers the write is being sent to
    pub targets: Vec<NodeId>,
    pub fanout: Fanout,
}

/// Result of [`ReplicationCoordinator::handle_write`]
pub enum WriteOutcome {
    Accepted(AcceptedWrite),
    Rejected(RejectReason),
}

/// Leader-side write path
pub struct ReplicationCoordinator {
    node_id: NodeId,
    view: ViewReader,
    log: Arc<RecordLog>,
    transport: Arc<dyn ReplicationTransport>,
    send_timeout: Duration,
}

impl ReplicationCoordinator {
    pub fn new(
        node_id: NodeId,
        view: ViewReader,
        log: Arc<RecordLog>,
        transport: Arc<dyn ReplicationTransport>,
        send_timeout: Duration,
    ) -> Self {
        Self {
            node_id,
            view,
            log,
            transport,
            send_timeout,
        }
    }

    pub fn log(&self) -> &Arc<RecordLog> {
        &self.log
    }

    /// Accept and fan out a write, or reject it if this node does not lead
    pub async fn handle_write(&self, payload: Vec<u8>) -> WriteOutcome {
        let view = self.view.current();
        if !view.is_leader() {
            tracing::debug!("Rejecting write: not leader (leader: {:?})", view.leader_id);
            return WriteOutcome::Rejected(RejectReason::NotLeader {
                leader_id: view.leader_id.clone(),
            });
        }

        // Targets are the live followers as of acceptance
        let targets: Vec<(NodeId, String)> = view
            .followers()
            .map(|(id, address)| (id.clone(), address.clone()))
            .collect();

        let index = self.log.append_local(&self.node_id, view.epoch, payload.clone()).await;
        tracing::info!(
            "Accepted write {} under epoch {}, replicating to {} follower(s)",
            index,
            view.epoch,
            targets.len()
        );

        let target_ids = targets.iter().map(|(id, _)| id.clone()).collect();
        let fanout = self.spawn_fanout(index, view.epoch, payload, targets);

        WriteOutcome::Accepted(AcceptedWrite {
            index,
            epoch: view.epoch,
            targets: target_ids,
            fanout,
        })
    }

    fn spawn_fanout(
        &self,
        index: u64,
        epoch: u64,
        payload: Vec<u8>,
        targets: Vec<(NodeId, String)>,
    ) -> Fanout {
        let sends: Vec<_> = targets
            .into_iter()
            .map(|(target, address)| {
                let message = Message::Replicate {
                    leader_id: self.node_id.clone(),
                    epoch,
                    index,
                    payload: payload.clone(),
                };
                send_once(
                    Arc::clone(&self.transport),
                    self.view.clone(),
                    self.send_timeout,
                    target,
                    address,
                    message,
                )
            })
            .collect();

        let view = self.view.clone();
        let handle = tokio::spawn(async move {
            let results = join_all(sends).await;

            let now = view.current();
            if now.epoch != epoch && !now.is_leader() {
                tracing::info!(
                    "Fan-out of write {} finished after leadership moved (epoch {} -> {})",
                    index,
                    epoch,
                    now.epoch
                );
            }
            results
        });

        Fanout { handle }
    }
}

/// One attempt, no retry
async fn send_once(
    transport: Arc<dyn ReplicationTransport>,
    view: ViewReader,
    send_timeout: Duration,
    target: NodeId,
    address: String,
    message: Message,
) -> SendResult {
    let index = match &message {
        Message::Replicate { index, .. } => *index,
        _ => 0,
    };

    let sent = tokio::time::timeout(send_timeout, transport.replicate(&address, message)).await;
    let failure = match sent {
        Ok(Ok(Message::ReplicateAck { accepted: true, .. })) => {
            tracing::debug!("Write {} delivered to {}", index, target);
            return SendResult {
                target,
                status: SendStatus::Delivered,
            };
        }
        Ok(Ok(Message::ReplicateAck { accepted: false, reason, .. })) => {
            let reason = reason.unwrap_or_else(|| "refused".to_string());
            tracing::info!("Write {} refused by {}: {}", index, target, reason);
            return SendResult {
                target,
                status: SendStatus::Refused { reason },
            };
        }
        Ok(Ok(other)) => format!("unexpected response {}", other.type_name()),
        Ok(Err(e)) => e.to_string(),
        Err(_) => format!("no acknowledgment within {:?}", send_timeout),
    };

    // The view may have moved while we were sending
    if !view.current().is_live(&target) {
        tracing::debug!(
            "Write {} not delivered to {}, which has left the cluster ({})",
            index,
            target,
            failure
        );
        return SendResult {
            target,
            status: SendStatus::TargetGone,
        };
    }

    let err = Error::ReplicationSend {
        target: target.clone(),
        reason: failure.clone(),
    };
    tracing::warn!("{}", err);
    SendResult {
        target,
        status: SendStatus::Failed { reason: failure },
    }
}
