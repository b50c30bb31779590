//! Cluster Agent
//!
//! Owns one node's coordination session and keeps its cluster view current.
//! Watches are one-shot, so the agent runs an explicit loop: wait for the
//! live or election watch to fire, re-list (which re-arms the watch that
//! fired), re-derive leadership, publish. Store trouble degrades the view to
//! "unknown" and is retried with backoff; a lost session is replaced and the
//! node registers and stands for election again.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::config::CoordinationConfig;
use crate::error::{Error, Result};
use crate::state::{
    ClusterView, ElectionProtocol, MembershipRegistry, NodeIdentity, RegisteredNode, ViewPublisher,
    ViewReader,
};
use crate::store::{Connector, CoordinationStore, SessionState, StoreError, Watch, WatchEvent};

/// Exponential backoff with jitter
struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: initial,
        }
    }

    fn next_delay(&mut self) -> Duration {
        let base = self.current;
        self.current = (self.current * 2).min(self.max);

        let spread = (base.as_millis() as u64 / 2).max(1);
        let jitter = rand::thread_rng().gen_range(0..=spread);
        (base + Duration::from_millis(jitter)).min(self.max)
    }

    fn reset(&mut self) {
        self.current = self.initial;
    }
}

enum AgentEvent {
    LiveFired(WatchEvent),
    ElectionFired(WatchEvent),
    SessionChanged(Option<SessionState>),
    RetryDue,
    Shutdown,
}

/// Creating our own nodes cannot tell a lost request from a lost reply.
/// Start over on a fresh session instead of risking an orphaned ticket.
fn create_failure(err: StoreError) -> Error {
    match err {
        StoreError::ConnectionLoss => {
            Error::SessionLost("connection lost while creating a node".into())
        }
        other => Error::from_store(other),
    }
}

/// Membership and election driver for one node
pub struct ClusterAgent {
    identity: NodeIdentity,
    connector: Arc<dyn Connector>,
    config: CoordinationConfig,
    store: Arc<RwLock<Arc<dyn CoordinationStore>>>,
    registry: MembershipRegistry,
    election: ElectionProtocol,
    publisher: Arc<ViewPublisher>,
    live_watch: Option<Watch>,
    election_watch: Option<Watch>,
    session_rx: watch::Receiver<SessionState>,
    shutdown_rx: watch::Receiver<bool>,
    backoff: Backoff,
    retry_at: Option<Instant>,
}

impl ClusterAgent {
    /// Register, stand for election and start following the cluster.
    ///
    /// Fails with [`Error::Startup`] if the node could not open a session,
    /// register itself or obtain an election ticket. Such a node must not serve.
    pub async fn start(
        identity: NodeIdentity,
        connector: Arc<dyn Connector>,
        config: CoordinationConfig,
    ) -> Result<ClusterHandle> {
        let startup = |step: &str, e: StoreError| Error::Startup(format!("{}: {}", step, e));

        let store = connector.connect().await.map_err(|e| startup("connect", e))?;
        let registry = MembershipRegistry::new(Arc::clone(&store), identity.clone(), &config);
        let mut election = ElectionProtocol::new(Arc::clone(&store), identity.id.clone(), &config);

        let enrolled = async {
            registry
                .ensure_namespaces()
                .await
                .map_err(|e| startup("create namespaces", e))?;
            registry
                .register_self()
                .await
                .map_err(|e| startup("register", e))?;
            election.join().await.map_err(|e| startup("join election", e))?;
            Ok::<_, Error>(())
        }
        .await;
        if let Err(e) = enrolled {
            let _ = store.close().await;
            return Err(e);
        }

        let publisher = Arc::new(ViewPublisher::new(identity.id.clone()));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let shared_store = Arc::new(RwLock::new(Arc::clone(&store)));

        let mut agent = ClusterAgent {
            identity: identity.clone(),
            connector,
            backoff: Backoff::new(config.retry_initial(), config.retry_max()),
            config: config.clone(),
            store: Arc::clone(&shared_store),
            registry,
            election,
            publisher: Arc::clone(&publisher),
            live_watch: None,
            election_watch: None,
            session_rx: store.session_state(),
            shutdown_rx,
            retry_at: None,
        };

        // First derivation; anything short of session loss is retried by the loop
        if let Err(e) = agent.derive(true, true).await {
            if e.requires_rejoin() {
                let _ = store.close().await;
                return Err(Error::Startup(e.to_string()));
            }
            agent.degrade(&e);
        }

        tracing::info!(
            "Node {} joined the cluster at {} (leader: {:?})",
            identity.id,
            identity.address,
            publisher.current().leader_id
        );

        let task = tokio::spawn(agent.run());

        Ok(ClusterHandle {
            identity,
            config,
            reader: publisher.reader(),
            store: shared_store,
            shutdown: shutdown_tx,
            task: Mutex::new(Some(task)),
        })
    }

    async fn run(mut self) {
        loop {
            let event = self.next_event().await;

            match event {
                AgentEvent::LiveFired(WatchEvent::ChildrenChanged { path }) => {
                    tracing::debug!("Live members changed under {}", path);
                    self.live_watch = None;
                    if !self.rederive(true, false).await {
                        break;
                    }
                }
                AgentEvent::ElectionFired(WatchEvent::ChildrenChanged { path }) => {
                    tracing::debug!("Election tickets changed under {}", path);
                    self.election_watch = None;
                    if !self.rederive(false, true).await {
                        break;
                    }
                }
                AgentEvent::LiveFired(WatchEvent::SessionClosed)
                | AgentEvent::ElectionFired(WatchEvent::SessionClosed) => {
                    if !self.recover_session().await {
                        break;
                    }
                }
                AgentEvent::SessionChanged(Some(SessionState::Disconnected)) => {
                    tracing::warn!("Coordination store unreachable; cluster state unknown");
                    self.publisher.publish_unknown();
                }
                AgentEvent::SessionChanged(Some(SessionState::Connected)) => {
                    tracing::info!("Coordination store reachable again");
                    self.retry_at = None;
                    if !self.rederive(true, true).await {
                        break;
                    }
                }
                AgentEvent::SessionChanged(_) => {
                    if !self.recover_session().await {
                        break;
                    }
                }
                AgentEvent::RetryDue => {
                    self.retry_at = None;
                    if !self.rederive(true, true).await {
                        break;
                    }
                }
                AgentEvent::Shutdown => break,
            }
        }

        self.leave().await;
    }

    async fn next_event(&mut self) -> AgentEvent {
        let retry_at = self.retry_at;

        let session_alive = tokio::select! {
            event = fired(&mut self.live_watch) => return AgentEvent::LiveFired(event),
            event = fired(&mut self.election_watch) => return AgentEvent::ElectionFired(event),
            changed = self.session_rx.changed() => changed.is_ok(),
            _ = sleep_until(retry_at) => return AgentEvent::RetryDue,
            _ = self.shutdown_rx.changed() => return AgentEvent::Shutdown,
        };

        AgentEvent::SessionChanged(session_alive.then(|| *self.session_rx.borrow()))
    }

    /// Re-derive and sort out whatever went wrong. False once shutdown was requested.
    async fn rederive(&mut self, arm_live: bool, arm_election: bool) -> bool {
        match self.derive(arm_live, arm_election).await {
            Ok(()) => {
                self.backoff.reset();
                true
            }
            Err(e) if e.requires_rejoin() => self.recover_session().await,
            Err(e) => {
                self.degrade(&e);
                true
            }
        }
    }

    /// List live members and election tickets, then publish the merged view
    async fn derive(&mut self, arm_live: bool, arm_election: bool) -> Result<()> {
        let snapshot = if arm_live {
            self.registry.on_live_change().await
        } else {
            self.registry.peek_live().await
        }
        .map_err(Error::from_store)?;
        if snapshot.watch.is_some() {
            self.live_watch = snapshot.watch;
        }

        let mut outcome = self
            .election
            .on_membership_changed(arm_election)
            .await
            .map_err(Error::from_store)?;
        if outcome.watch.is_some() {
            self.election_watch = outcome.watch.take();
        }

        if outcome.ticket_lost {
            // Never lead on a ticket we cannot see
            self.publisher
                .publish(outcome.leader_id.clone(), snapshot.members.clone());

            self.election.rejoin().await.map_err(create_failure)?;
            let arm = self.election_watch.is_none();
            outcome = self
                .election
                .on_membership_changed(arm)
                .await
                .map_err(Error::from_store)?;
            if outcome.watch.is_some() {
                self.election_watch = outcome.watch.take();
            }
        }

        self.publisher.publish(outcome.leader_id, snapshot.members);
        Ok(())
    }

    /// Transient failure: follow nobody until the next successful derivation
    fn degrade(&mut self, err: &Error) {
        let delay = self.backoff.next_delay();
        tracing::warn!("Cluster state unknown ({}); retrying in {:?}", err, delay);

        self.publisher.publish_unknown();
        self.retry_at = Some(Instant::now() + delay);
    }

    /// Replace a lost session. Returns false if shutdown was requested meanwhile.
    async fn recover_session(&mut self) -> bool {
        if let Some(transition) = self.election.session_lost() {
            tracing::info!("Leadership {} (node: {}, session lost)", transition, self.identity.id);
        }
        tracing::warn!("Coordination session lost; re-registering {}", self.identity.id);

        self.publisher.publish_unknown();
        self.live_watch = None;
        self.election_watch = None;
        self.retry_at = None;

        let mut backoff = Backoff::new(self.config.retry_initial(), self.config.retry_max());
        loop {
            // Whatever is left of the previous session must not keep our records alive
            let stale = self.current_store().await;
            if let Err(e) = stale.close().await {
                tracing::debug!("Closing session {} failed: {}", stale.session_id(), e);
            }

            match self.reestablish().await {
                Ok(()) => {
                    self.backoff.reset();
                    tracing::info!(
                        "Node {} rejoined on session {}",
                        self.identity.id,
                        self.current_store().await.session_id()
                    );
                    return true;
                }
                Err(e) => {
                    let delay = backoff.next_delay();
                    tracing::warn!("Rejoin failed ({}); retrying in {:?}", e, delay);
                    self.publisher.publish_unknown();
                    self.live_watch = None;
                    self.election_watch = None;

                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = self.shutdown_rx.changed() => return false,
                    }
                }
            }
        }
    }

    async fn reestablish(&mut self) -> Result<()> {
        let store = self.connector.connect().await.map_err(Error::from_store)?;

        *self.store.write().await = Arc::clone(&store);
        self.session_rx = store.session_state();
        self.registry =
            MembershipRegistry::new(Arc::clone(&store), self.identity.clone(), &self.config);
        self.election.rebind(Arc::clone(&store));

        self.registry.ensure_namespaces().await.map_err(create_failure)?;
        self.registry.register_self().await.map_err(create_failure)?;
        self.election.join().await.map_err(create_failure)?;

        self.derive(true, true).await
    }

    async fn current_store(&self) -> Arc<dyn CoordinationStore> {
        Arc::clone(&*self.store.read().await)
    }

    /// Close the session so our liveness record and ticket disappear now
    async fn leave(self) {
        let store = self.current_store().await;
        if let Err(e) = store.close().await {
            tracing::warn!("Failed to close coordination session: {}", e);
        }
        self.publisher.publish_unknown();
        tracing::info!("Node {} left the cluster", self.identity.id);
    }
}

async fn fired(watch: &mut Option<Watch>) -> WatchEvent {
    match watch {
        Some(w) => w.fired().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

/// Handle to a running [`ClusterAgent`]
pub struct ClusterHandle {
    identity: NodeIdentity,
    config: CoordinationConfig,
    reader: ViewReader,
    store: Arc<RwLock<Arc<dyn CoordinationStore>>>,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ClusterHandle {
    pub fn identity(&self) -> &NodeIdentity {
        &self.identity
    }

    /// Latest cluster view. Never blocks.
    pub fn view(&self) -> Arc<ClusterView> {
        self.reader.current()
    }

    pub fn reader(&self) -> ViewReader {
        self.reader.clone()
    }

    /// Current coordination session
    pub async fn session_id(&self) -> u64 {
        self.store.read().await.session_id()
    }

    /// Every node that ever registered, live or not
    pub async fn registered_nodes(&self) -> Result<Vec<RegisteredNode>> {
        let store = Arc::clone(&*self.store.read().await);
        MembershipRegistry::new(store, self.identity.clone(), &self.config)
            .registered_nodes()
            .await
            .map_err(Error::from_store)
    }

    /// Leave the cluster and wait for the agent to stop
    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        if let Some(task) = self.task.lock().await.take() {
            if let Err(e) = task.await {
                tracing::error!("Cluster agent ended abnormally: {}", e);
            }
        }
    }
}
