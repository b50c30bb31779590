//! HerdLead - Cluster Membership and Leader Election
//!
//! A fleet of identical processes agrees, without an operator, on who is
//! alive and which single member leads, using a strongly consistent
//! coordination store as the source of truth.
//!
//! # Architecture
//!
//! Each node keeps one session with the store. Its registration record is
//! persistent, its liveness record and election ticket are ephemeral and die
//! with the session. The node holding the lowest ticket ordinal leads. Every
//! change notification triggers a full re-listing, and the result is
//! published as an immutable, versioned [`state::ClusterView`].
//!
//! # Features
//!
//! - Liveness tied to the store session, no heartbeats
//! - Leader election by lowest sequential ticket
//! - Automatic re-registration after session loss
//! - Best-effort fan-out of accepted writes from the leader to live followers
//! - HTTP API for cluster state and record writes

pub mod config;
pub mod error;
pub mod store;
pub mod state;
pub mod replication;
pub mod network;
pub mod agent;
pub mod api;

pub use config::HerdConfig;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::agent::{ClusterAgent, ClusterHandle};
    pub use crate::config::HerdConfig;
    pub use crate::error::{Error, Result};
    pub use crate::state::{ClusterView, NodeIdentity, ViewReader};
    pub use crate::store::{Connector, CoordinationStore, MemoryCoordinator};
    pub use crate::replication::{ReplicationCoordinator, WriteOutcome};
}
