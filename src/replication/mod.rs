//! Replication Module
//!
//! Decides when and to whom an accepted write is replicated, and applies
//! replicated writes on followers.

pub mod protocol;
mod coordinator;
mod follower;
mod log;

pub use protocol::{ErrorCode, FrameHeader, Message};
pub use coordinator::{
    AcceptedWrite, Fanout, RejectReason, ReplicationCoordinator, SendResult, SendStatus,
    WriteOutcome,
};
pub use follower::{ReplicaApplier, STALE_LEADER};
pub use log::{Record, RecordLog};

/// Carries replication messages to a follower and returns its response
#[async_trait::async_trait]
pub trait ReplicationTransport: Send + Sync {
    async fn replicate(&self, address: &str, message: Message) -> crate::Result<Message>;
}
