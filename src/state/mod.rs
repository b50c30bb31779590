//! State Management Module
//!
//! Membership, election and the cluster view derived from them.

mod membership;
pub mod election;
mod view;

pub use membership::{LiveSnapshot, MembershipRegistry, NodeIdentity, RegisteredNode};
pub use election::{ElectionOutcome, ElectionProtocol, LeadershipTransition, Ticket};
pub use view::{ClusterView, ViewPublisher, ViewReader};

/// Node identifier
pub type NodeId = String;
