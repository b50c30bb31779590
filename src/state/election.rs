//! Leader Election
//!
//! Every node holds one ephemeral-sequential ticket under the election
//! namespace. The node whose ticket has the lowest ordinal leads. The store
//! assigns ordinals linearizably and drops a ticket together with its
//! session, so "my ordinal is the minimum" is a globally safe test.

use std::sync::Arc;

use crate::config::CoordinationConfig;
use crate::store::{
    child_path, parse_sequence, CoordinationStore, NodeKind, StoreError, StoreResult, Watch,
};

use super::NodeId;

/// An election ticket
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ticket {
    /// Child name, e.g. `leader-0000000003`
    pub name: String,
    /// Sequence assigned by the store
    pub ordinal: u64,
}

/// Change of this node's role
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeadershipTransition {
    /// follower -> leader
    Elected,
    /// leader -> follower
    Demoted,
}

impl std::fmt::Display for LeadershipTransition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LeadershipTransition::Elected => write!(f, "ELECTED"),
            LeadershipTransition::Demoted => write!(f, "DEMOTED"),
        }
    }
}

/// Result of re-deriving leadership
#[derive(Debug)]
pub struct ElectionOutcome {
    /// Node that holds the lowest ticket, if known
    pub leader_id: Option<NodeId>,
    /// Whether this node leads
    pub is_leader: bool,
    /// Set only when the role actually changed
    pub transition: Option<LeadershipTransition>,
    /// Our own ticket was missing from the listing; call [`ElectionProtocol::rejoin`]
    pub ticket_lost: bool,
    /// Watch re-armed by the listing, if requested
    pub watch: Option<Watch>,
}

/// Election state for one node
pub struct ElectionProtocol {
    store: Arc<dyn CoordinationStore>,
    node_id: NodeId,
    election_path: String,
    ticket_prefix: String,
    /// Our ticket in the current session
    ticket: Option<Ticket>,
    /// Last reported role
    leading: bool,
}

impl ElectionProtocol {
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        node_id: NodeId,
        config: &CoordinationConfig,
    ) -> Self {
        Self {
            store,
            node_id,
            election_path: config.election_path.clone(),
            ticket_prefix: config.ticket_prefix.clone(),
            ticket: None,
            leading: false,
        }
    }

    pub fn ticket(&self) -> Option<&Ticket> {
        self.ticket.as_ref()
    }

    pub fn is_leader(&self) -> bool {
        self.leading
    }

    /// Create this node's ticket. Without one the node can only follow.
    pub async fn join(&mut self) -> StoreResult<Ticket> {
        let base = child_path(&self.election_path, &self.ticket_prefix);
        let path = self
            .store
            .create_node(&base, self.node_id.as_bytes(), NodeKind::EphemeralSequential)
            .await?;

        let name = path.rsplit('/').next().unwrap_or_default().to_string();
        let ordinal = parse_sequence(&name, &self.ticket_prefix)
            .ok_or_else(|| StoreError::Other(format!("unexpected ticket name '{}'", path)))?;

        let ticket = Ticket { name, ordinal };
        tracing::info!("Joined election with ticket {} (node: {})", ticket.name, self.node_id);
        self.ticket = Some(ticket.clone());
        Ok(ticket)
    }

    /// Replace a lost ticket. Tickets still carrying our id are withdrawn first
    /// so that a stray one cannot hold the lowest ordinal with no leader behind it.
    pub async fn rejoin(&mut self) -> StoreResult<Ticket> {
        self.ticket = None;

        let (tickets, _) = self.list_tickets(false).await?;
        for stray in tickets {
            let path = child_path(&self.election_path, &stray.name);
            match self.store.get_data(&path).await {
                Ok(data) if data == self.node_id.as_bytes() => {
                    tracing::warn!("Withdrawing stray election ticket {}", stray.name);
                    match self.store.delete_node(&path).await {
                        Ok(()) | Err(StoreError::NoNode(_)) => {}
                        Err(e) => return Err(e),
                    }
                }
                Ok(_) | Err(StoreError::NoNode(_)) => {}
                Err(e) => return Err(e),
            }
        }

        self.join().await
    }

    /// True iff `own` exists among `tickets` and has the minimum ordinal
    pub fn compute_leadership(own: &Ticket, tickets: &[Ticket]) -> bool {
        tickets.iter().any(|t| t.ordinal == own.ordinal)
            && tickets.iter().map(|t| t.ordinal).min() == Some(own.ordinal)
    }

    /// Re-list the election namespace and recompute leadership
    pub async fn on_membership_changed(&mut self, arm_watch: bool) -> StoreResult<ElectionOutcome> {
        let (tickets, watch) = self.list_tickets(arm_watch).await?;

        let own_present = self
            .ticket
            .as_ref()
            .map(|own| tickets.iter().any(|t| t.ordinal == own.ordinal))
            .unwrap_or(false);

        if !own_present {
            if self.ticket.is_some() {
                tracing::warn!(
                    "Election ticket {} vanished while the process is alive; demoting",
                    self.ticket.as_ref().map(|t| t.name.as_str()).unwrap_or_default()
                );
            }
            let transition = self.record(false);
            let leader_id = self.resolve_leader(&tickets).await?;
            return Ok(ElectionOutcome {
                leader_id,
                is_leader: false,
                transition,
                ticket_lost: true,
                watch,
            });
        }

        let is_leader = self
            .ticket
            .as_ref()
            .map(|own| Self::compute_leadership(own, &tickets))
            .unwrap_or(false);

        let leader_id = if is_leader {
            Some(self.node_id.clone())
        } else {
            self.resolve_leader(&tickets).await?
        };

        let transition = self.record(is_leader);
        if let Some(t) = transition {
            tracing::info!("Leadership {} (node: {}, leader: {:?})", t, self.node_id, leader_id);
        }

        Ok(ElectionOutcome {
            leader_id,
            is_leader,
            transition,
            ticket_lost: false,
            watch,
        })
    }

    /// The session is gone: forget the ticket and step down
    pub fn session_lost(&mut self) -> Option<LeadershipTransition> {
        self.ticket = None;
        self.record(false)
    }

    /// Continue on a new session; the role memory is kept so transitions stay de-duplicated
    pub fn rebind(&mut self, store: Arc<dyn CoordinationStore>) {
        self.store = store;
        self.ticket = None;
    }

    async fn list_tickets(&self, arm_watch: bool) -> StoreResult<(Vec<Ticket>, Option<Watch>)> {
        let (names, watch) = if arm_watch {
            let (names, watch) = self.store.list_children_watched(&self.election_path).await?;
            (names, Some(watch))
        } else {
            (self.store.list_children(&self.election_path).await?, None)
        };

        let mut tickets: Vec<Ticket> = names
            .into_iter()
            .filter_map(|name| {
                parse_sequence(&name, &self.ticket_prefix).map(|ordinal| Ticket { name, ordinal })
            })
            .collect();
        tickets.sort_by_key(|t| t.ordinal);

        Ok((tickets, watch))
    }

    /// Node id stored in the lowest ticket
    async fn resolve_leader(&self, tickets: &[Ticket]) -> StoreResult<Option<NodeId>> {
        let Some(lowest) = tickets.first() else {
            return Ok(None);
        };

        match self.store.get_data(&child_path(&self.election_path, &lowest.name)).await {
            Ok(data) => {
                let id = String::from_utf8_lossy(&data).into_owned();
                // A stray ticket carrying our id is not leadership
                Ok((id != self.node_id).then_some(id))
            }
            // Removed after the listing; the next notification will settle it
            Err(StoreError::NoNode(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn record(&mut self, is_leader: bool) -> Option<LeadershipTransition> {
        if is_leader == self.leading {
            return None;
        }
        self.leading = is_leader;
        Some(if is_leader {
            LeadershipTransition::Elected
        } else {
            LeadershipTransition::Demoted
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryCoordinator;

    fn ticket(ordinal: u64) -> Ticket {
        Ticket {
            name: format!("leader-{:010}", ordinal),
            ordinal,
        }
    }

    async fn candidate(hub: &MemoryCoordinator, id: &str) -> (ElectionProtocol, u64) {
        let session = hub.open_session().await;
        let session_id = session.session_id();
        let store: Arc<dyn CoordinationStore> = Arc::new(session);
        let _ = store.create_node("/election", b"", NodeKind::Persistent).await;
        (
            ElectionProtocol::new(store, id.to_string(), &CoordinationConfig::default()),
            session_id,
        )
    }

    #[test]
    fn test_compute_leadership() {
        let tickets = vec![ticket(3), ticket(5), ticket(9)];
        assert!(ElectionProtocol::compute_leadership(&ticket(3), &tickets));
        assert!(!ElectionProtocol::compute_leadership(&ticket(5), &tickets));
        // Our ticket is not among the existing ones
        assert!(!ElectionProtocol::compute_leadership(&ticket(1), &tickets));
        assert!(!ElectionProtocol::compute_leadership(&ticket(1), &[]));
    }

    #[tokio::test]
    async fn test_lowest_ticket_leads() {
        let hub = MemoryCoordinator::new();
        let (mut n1, _) = candidate(&hub, "n1").await;
        let (mut n2, _) = candidate(&hub, "n2").await;

        n1.join().await.unwrap();
        n2.join().await.unwrap();

        let o1 = n1.on_membership_changed(false).await.unwrap();
        let o2 = n2.on_membership_changed(false).await.unwrap();

        assert!(o1.is_leader);
        assert_eq!(o1.transition, Some(LeadershipTransition::Elected));
        assert_eq!(o1.leader_id.as_deref(), Some("n1"));
        assert!(!o2.is_leader);
        assert_eq!(o2.transition, None);
        assert_eq!(o2.leader_id.as_deref(), Some("n1"));
    }

    #[tokio::test]
    async fn test_transition_reported_once() {
        let hub = MemoryCoordinator::new();
        let (mut n1, _) = candidate(&hub, "n1").await;
        n1.join().await.unwrap();

        let first = n1.on_membership_changed(false).await.unwrap();
        let second = n1.on_membership_changed(false).await.unwrap();

        assert_eq!(first.transition, Some(LeadershipTransition::Elected));
        assert_eq!(second.transition, None);
        assert!(second.is_leader);
    }

    #[tokio::test]
    async fn test_successor_takes_over() {
        let hub = MemoryCoordinator::new();
        let (mut n1, s1) = candidate(&hub, "n1").await;
        let (mut n2, _) = candidate(&hub, "n2").await;
        n1.join().await.unwrap();
        n2.join().await.unwrap();
        n2.on_membership_changed(false).await.unwrap();

        hub.expire_session(s1).await;

        let outcome = n2.on_membership_changed(false).await.unwrap();
        assert!(outcome.is_leader);
        assert_eq!(outcome.transition, Some(LeadershipTransition::Elected));
    }

    #[tokio::test]
    async fn test_missing_ticket_demotes_then_rejoins() {
        let hub = MemoryCoordinator::new();
        let (mut n1, _) = candidate(&hub, "n1").await;
        let (mut n2, _) = candidate(&hub, "n2").await;
        n1.join().await.unwrap();
        assert!(n1.on_membership_changed(false).await.unwrap().is_leader);
        n2.join().await.unwrap();

        // Pretend the store dropped our ticket while we kept running
        n1.ticket = Some(ticket(42));

        let outcome = n1.on_membership_changed(false).await.unwrap();
        assert!(outcome.ticket_lost);
        assert!(!outcome.is_leader);
        assert_eq!(outcome.transition, Some(LeadershipTransition::Demoted));
        assert!(!n1.is_leader());

        let fresh = n1.rejoin().await.unwrap();
        assert_eq!(fresh.ordinal, 2);
        // The forgotten ticket 0 was withdrawn, so n2 now holds the lowest one
        assert_eq!(hub.children("/election").await, vec!["leader-0000000001", "leader-0000000002"]);

        let after = n1.on_membership_changed(false).await.unwrap();
        assert!(!after.ticket_lost);
        assert!(!after.is_leader);
        assert_eq!(after.leader_id.as_deref(), Some("n2"));

        let other = n2.on_membership_changed(false).await.unwrap();
        assert!(other.is_leader);
        assert_eq!(other.transition, Some(LeadershipTransition::Elected));
    }

    #[tokio::test]
    async fn test_session_lost_reports_demotion_once() {
        let hub = MemoryCoordinator::new();
        let (mut n1, _) = candidate(&hub, "n1").await;
        n1.join().await.unwrap();
        n1.on_membership_changed(false).await.unwrap();

        assert_eq!(n1.session_lost(), Some(LeadershipTransition::Demoted));
        assert_eq!(n1.session_lost(), None);
        assert!(n1.ticket().is_none());
    }

    #[tokio::test]
    async fn test_watch_armed_on_request() {
        let hub = MemoryCoordinator::new();
        let (mut n1, _) = candidate(&hub, "n1").await;
        n1.join().await.unwrap();

        let outcome = n1.on_membership_changed(true).await.unwrap();
        assert!(outcome.watch.is_some());
        assert_eq!(hub.watch_count("/election").await, 1);
    }
}
