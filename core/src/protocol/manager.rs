//! MessageManager — the per-network protocol state machine
//!
//! Drives leader discovery and election, the join and initial cache fetch,
//! UPDATE propagation through the leader, BROWSE and USE brokering, and
//! graceful departure. All inbound traffic arrives through [`LocalDispatch`],
//! already off the transport's receive loop; timers only queue a signal that
//! is handled on the task pool.
//!
//! ## Flows
//! - leader: UNDEF → WAIT_EVENT, announce MAIN_REPLY, heartbeat I_AM_HERE
//! - follower: UNDEF → DISCOVER_MAIN → JOINING → INITIAL_UPDATE → WAIT_EVENT
//! - no reply within the discover timeout: DISCOVER_MAIN → ELECTION

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::election::{Ballot, Credential, CredentialPolicy};
use super::events::{EventBus, ProtocolEvent};
use super::level::{Level, LevelCell, Transition};
use super::proxy::DiscoveryProxy;
use crate::cache::{outbound, CacheSnapshot, Service, ServiceCache, Template};
use crate::config::{NodeConfig, ProtocolTimings};
use crate::connection::Connection;
use crate::error::{ConnErr, MsdError, MsdResult, RoutingError, StateError};
use crate::keying::{KeyingService, MembershipChange};
use crate::message::{attr, ConnectionType, Message, MessageType};
use crate::routing::{LocalDispatch, RouterManager};
use crate::timer::{TaskPool, TimerHandle, TimerService};
use crate::transport::{NetworkManager, Target};

/// Accepts brokered USE connections for one service
#[async_trait]
pub trait UseHandler: Send + Sync {
    async fn accept(&self, service_id: &str, connection: Connection);
}

#[derive(Debug, Clone, Copy)]
enum Tick {
    DiscoverExpired,
    ElectionClosed,
    Heartbeat,
    LeaderWatch,
}

struct TickMsg {
    tick: Tick,
    network: String,
    epoch: u64,
}

/// Protocol bookkeeping for one network
struct NetworkState {
    name: String,
    level: LevelCell,
    ballot: Mutex<Option<Ballot>>,
    timers: Mutex<Vec<TimerHandle>>,
    /// Followers that registered with us while leader
    members: Mutex<BTreeSet<String>>,
    started: AtomicBool,
    /// Bumped whenever the timers are reset; stale signals are ignored
    epoch: AtomicU64,
}

impl NetworkState {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            level: LevelCell::new(),
            ballot: Mutex::new(None),
            timers: Mutex::new(Vec::new()),
            members: Mutex::new(BTreeSet::new()),
            started: AtomicBool::new(false),
            epoch: AtomicU64::new(0),
        }
    }

    fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    fn cancel_timers(&self) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        for timer in self.timers.lock().drain(..) {
            timer.cancel();
        }
    }
}

pub struct MessageManager {
    node_id: String,
    credential: Credential,
    is_leader: bool,
    encrypt_updates: bool,
    timings: ProtocolTimings,
    router: Arc<RouterManager>,
    cache: Arc<ServiceCache>,
    keys: Arc<dyn KeyingService>,
    policy: Arc<dyn CredentialPolicy>,
    timers: Arc<TimerService>,
    pool: TaskPool,
    events: EventBus,
    networks: BTreeMap<String, Arc<NetworkState>>,
    use_handlers: RwLock<HashMap<String, Arc<dyn UseHandler>>>,
    proxies: RwLock<Vec<Arc<dyn DiscoveryProxy>>>,
    ticks: mpsc::UnboundedSender<TickMsg>,
    tick_rx: Mutex<Option<mpsc::UnboundedReceiver<TickMsg>>>,
    this: Weak<MessageManager>,
}

impl MessageManager {
    pub fn new(
        config: &NodeConfig,
        router: Arc<RouterManager>,
        cache: Arc<ServiceCache>,
        keys: Arc<dyn KeyingService>,
        timers: Arc<TimerService>,
        pool: TaskPool,
        policy: Arc<dyn CredentialPolicy>,
    ) -> Arc<Self> {
        let networks = router
            .networks()
            .iter()
            .map(|n| (n.name().to_string(), Arc::new(NetworkState::new(n.name()))))
            .collect();
        let (ticks, tick_rx) = mpsc::unbounded_channel();
        Arc::new_cyclic(|this| Self {
            node_id: config.node_id.clone(),
            credential: Credential::new(config.credential, config.node_id.clone()),
            is_leader: config.is_leader,
            encrypt_updates: config.encrypt_updates,
            timings: config.timings.clone(),
            router,
            cache,
            keys,
            policy,
            timers,
            pool,
            events: EventBus::new(),
            networks,
            use_handlers: RwLock::new(HashMap::new()),
            proxies: RwLock::new(Vec::new()),
            ticks,
            tick_rx: Mutex::new(Some(tick_rx)),
            this: this.clone(),
        })
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<ProtocolEvent> {
        self.events.subscribe()
    }

    pub fn level(&self, network: &str) -> Option<Level> {
        self.networks.get(network).map(|s| s.level.get())
    }

    pub fn is_started(&self, network: &str) -> bool {
        self.networks
            .get(network)
            .is_some_and(|s| s.started.load(Ordering::SeqCst))
    }

    /// Whether this node is the leader of `network`
    pub fn is_main(&self, network: &str) -> bool {
        self.router
            .network(network)
            .is_some_and(|n| n.core().is_main())
    }

    pub fn leader_of(&self, network: &str) -> Option<String> {
        self.router.network(network).and_then(|n| n.core().leader())
    }

    pub fn register_use_handler(&self, service_id: &str, handler: Arc<dyn UseHandler>) {
        self.use_handlers
            .write()
            .insert(service_id.to_string(), handler);
    }

    pub fn remove_use_handler(&self, service_id: &str) -> bool {
        self.use_handlers.write().remove(service_id).is_some()
    }

    /// Proxies run whenever this node becomes leader of a network
    pub fn register_proxy(&self, proxy: Arc<dyn DiscoveryProxy>) {
        self.proxies.write().push(proxy);
    }

    // ========================================================================
    // Level bookkeeping
    // ========================================================================

    fn state(&self, network: &str) -> Result<Arc<NetworkState>, StateError> {
        self.networks
            .get(network)
            .cloned()
            .ok_or_else(|| StateError::UnknownNetwork(network.to_string()))
    }

    fn network(&self, network: &str) -> Result<Arc<NetworkManager>, StateError> {
        self.router
            .network(network)
            .ok_or_else(|| StateError::UnknownNetwork(network.to_string()))
    }

    fn announce(&self, state: &NetworkState, transition: Option<Transition>) {
        if let Some(t) = transition {
            debug!(network = %state.name, from = %t.from, to = %t.to, "level changed");
            self.events.level_changed(&state.name, t);
        }
    }

    fn set_level(&self, state: &NetworkState, to: Level) {
        let transition = state.level.set(to);
        self.announce(state, transition);
    }

    fn enter(&self, state: &NetworkState, allowed: &[Level], to: Level) -> Result<(), Level> {
        let transition = state.level.transition(allowed, to)?;
        self.announce(state, Some(transition));
        Ok(())
    }

    /// Enter a transient level from WAIT_EVENT
    fn begin(&self, state: &NetworkState, to: Level, operation: &'static str) -> Result<(), StateError> {
        self.enter(state, &[Level::WaitEvent], to)
            .map_err(|level| StateError::Forbidden {
                network: state.name.clone(),
                operation,
                level: level.to_string(),
            })
    }

    /// Leave a transient level. Runs on success and failure alike.
    fn finish(&self, state: &NetworkState, from: Level) {
        let _ = self.enter(state, &[from], Level::WaitEvent);
    }

    pub fn trigger_cache_updated(&self, network: &str, update_id: u64) {
        info!(network, update_id, "cache updated");
        self.events.emit(ProtocolEvent::CacheUpdated {
            network: network.to_string(),
            update_id,
        });
    }

    // ========================================================================
    // Timers
    // ========================================================================

    fn after(&self, state: &NetworkState, delay: Duration, tick: Tick) {
        let this = self.this.clone();
        let network = state.name.clone();
        let epoch = state.epoch();
        let handle = self.timers.schedule_once(delay, format!("{}:{:?}", network, tick), move || {
            if let Some(this) = this.upgrade() {
                this.post(tick, &network, epoch);
            }
        });
        state.timers.lock().push(handle);
    }

    fn every(&self, state: &NetworkState, period: Duration, tick: Tick) {
        let this = self.this.clone();
        let network = state.name.clone();
        let epoch = state.epoch();
        let listener = move |_: &str, _: Option<&str>| match this.upgrade() {
            Some(this) => {
                this.post(tick, &network, epoch);
                true
            }
            None => false,
        };
        let handle = self.timers.register(
            Arc::new(listener),
            period,
            format!("{}:{:?}", state.name, tick),
            None,
        );
        state.timers.lock().push(handle);
    }

    fn post(&self, tick: Tick, network: &str, epoch: u64) {
        let _ = self.ticks.send(TickMsg {
            tick,
            network: network.to_string(),
            epoch,
        });
    }

    /// Timer signals are queued here and each one handled on the task pool
    fn spawn_tick_driver(&self) {
        let Some(mut rx) = self.tick_rx.lock().take() else {
            return;
        };
        let this = self.this.clone();
        let pool = self.pool.clone();
        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                let Some(this) = this.upgrade() else {
                    break;
                };
                pool.spawn(async move {
                    this.on_tick(msg).await;
                });
            }
        });
    }

    async fn on_tick(&self, msg: TickMsg) {
        let Ok(state) = self.state(&msg.network) else {
            return;
        };
        if state.epoch() != msg.epoch {
            // armed before the last reset
            return;
        }
        match msg.tick {
            Tick::DiscoverExpired => self.start_election(&state).await,
            Tick::ElectionClosed => self.finish_election(&state).await,
            Tick::Heartbeat => self.heartbeat(&state).await,
            Tick::LeaderWatch => self.watch_leader(&state).await,
        }
    }

    // ========================================================================
    // Outbound helpers
    // ========================================================================

    fn outgoing(&self, message_type: MessageType, to: Option<&str>, network: &str) -> Message {
        Message::addressed(message_type, &self.node_id, to).with_attribute(attr::NETWORK, network)
    }

    async fn multicast(&self, network: &str, msg: Message) {
        let Ok(manager) = self.network(network) else {
            return;
        };
        if let Err(err) = manager.send_multicast(msg).await {
            warn!(network, error = %err, "multicast failed");
        }
    }

    async fn unicast(&self, network: &str, to: &str, msg: Message) -> MsdResult<()> {
        let manager = self.network(network)?;
        if manager.can_reach(to) {
            manager.send_unicast(msg, Target::Node(to.to_string())).await?;
        } else {
            self.router.route_message(msg, None).await?;
        }
        Ok(())
    }

    async fn open(&self, network: &str, conn_type: ConnectionType, peer: &str) -> MsdResult<Connection> {
        let manager = self.network(network)?;
        let connection = if manager.can_reach(peer) {
            manager
                .get_connection(conn_type, &self.node_id, peer, Target::Node(peer.to_string()))
                .await?
        } else {
            self.router
                .open_connection(conn_type, &self.node_id, peer)
                .await?
        };
        Ok(connection)
    }

    fn seal(&self, mut msg: Message, network: &str) -> Message {
        if self.encrypt_updates {
            msg.set_attribute(attr::ENCODED, network);
        }
        msg
    }

    /// Cache query sent on a GET connection. The wire has no GET message
    /// code: the connection type names the exchange and the request rides as
    /// UPDATE carrying a `template` header.
    fn get_request(&self, peer: &str, network: &str, template: &Template) -> Message {
        self.outgoing(MessageType::Update, Some(peer), network)
            .with_attribute(attr::TEMPLATE, template.to_string())
    }

    /// GET exchange: one request, one snapshot reply, then both sides close
    async fn fetch(&self, network: &str, peer: &str, template: &Template) -> MsdResult<CacheSnapshot> {
        let connection = self.open(network, ConnectionType::Get, peer).await?;
        let request = self.get_request(peer, network, template);

        let result: MsdResult<CacheSnapshot> = async {
            connection.send(request).await?;
            let reply = connection.receive().await?.ok_or(ConnErr::Closed)?;
            if reply.message_type() == MessageType::Error {
                let reason = reply.attribute(attr::REASON).unwrap_or("refused");
                return Err(MsdError::Transport(format!("GET refused by {}: {}", peer, reason)));
            }
            CacheSnapshot::from_bytes(reply.payload())
        }
        .await;

        let _ = connection.close().await;
        result
    }

    /// UPDATE exchange: push our filtered cache, read back the peer's update id
    async fn push(&self, network: &str, peer: &str) -> MsdResult<u64> {
        let connection = self.open(network, ConnectionType::Update, peer).await?;
        let snapshot = outbound(&self.cache.snapshot(), peer, network, &self.node_id);

        let result: MsdResult<u64> = async {
            let request = self
                .outgoing(MessageType::Update, Some(peer), network)
                .with_attribute(attr::UPDATE, snapshot.update_id.to_string())
                .with_payload(snapshot.to_bytes()?);
            connection.send(self.seal(request, network)).await?;
            let reply = connection.receive().await?.ok_or(ConnErr::Closed)?;
            if reply.message_type() == MessageType::Error {
                let reason = reply.attribute(attr::REASON).unwrap_or("refused");
                return Err(MsdError::Transport(format!("UPDATE refused by {}: {}", peer, reason)));
            }
            Ok(reply
                .attribute(attr::UPDATE)
                .and_then(|id| id.parse().ok())
                .unwrap_or(0))
        }
        .await;

        let _ = connection.close().await;
        result
    }

    // ========================================================================
    // Startup, discovery and election
    // ========================================================================

    /// Bring the protocol up on every network
    pub async fn start(&self) {
        for name in self.networks.keys() {
            if let Err(err) = self.start_network(name).await {
                warn!(network = %name, error = %err, "protocol start failed");
            }
        }
    }

    pub async fn start_network(&self, network: &str) -> MsdResult<()> {
        let state = self.state(network)?;
        self.spawn_tick_driver();
        let level = state.level.get();
        if !matches!(level, Level::Undef | Level::Left) {
            return Err(StateError::Forbidden {
                network: network.to_string(),
                operation: "start",
                level: level.to_string(),
            }
            .into());
        }
        if self.is_leader {
            self.become_leader(&state).await;
        } else {
            self.begin_discovery(&state).await;
        }
        Ok(())
    }

    async fn become_leader(&self, state: &Arc<NetworkState>) {
        state.cancel_timers();
        state.ballot.lock().take();
        if let Ok(manager) = self.network(&state.name) {
            manager.core().set_main(true);
            manager.core().set_leader(Some(self.node_id.clone()));
        }
        self.set_level(state, Level::WaitEvent);
        state.started.store(true, Ordering::SeqCst);

        info!(network = %state.name, "acting as leader");
        self.events.emit(ProtocolEvent::LeaderElected {
            network: state.name.clone(),
            leader: self.node_id.clone(),
        });

        let announce = self
            .outgoing(MessageType::MainReply, None, &state.name)
            .with_attribute(attr::UPDATE, self.cache.update_id().to_string());
        self.multicast(&state.name, announce).await;

        self.every(state, self.timings.heartbeat_period(), Tick::Heartbeat);
        self.start_proxies(&state.name);
    }

    /// Search with every proxy in the background; hits become our services
    fn start_proxies(&self, network: &str) {
        let proxies = self.proxies.read().clone();
        let Some(this) = self.this.upgrade() else {
            return;
        };
        for proxy in proxies {
            let this = this.clone();
            let network = network.to_string();
            self.pool.spawn(async move {
                let found = match proxy.search(&network).await {
                    Ok(found) => found,
                    Err(err) => {
                        warn!(network = %network, proxy = proxy.name(), error = %err, "proxy search failed");
                        return;
                    }
                };
                if found.is_empty() {
                    return;
                }
                debug!(network = %network, proxy = proxy.name(), count = found.len(), "proxy found services");
                let mut update_id = this.cache.update_id();
                for service in found {
                    update_id = this.cache.register(service.on_network(&network));
                }
                if let Err(err) = this.publish_update(&network, update_id).await {
                    warn!(network = %network, error = %err, "proxy results not announced");
                }
            });
        }
    }

    async fn begin_discovery(&self, state: &Arc<NetworkState>) {
        state.cancel_timers();
        if let Ok(manager) = self.network(&state.name) {
            manager.core().set_main(false);
            manager.core().set_leader(None);
        }
        self.set_level(state, Level::DiscoverMain);

        debug!(network = %state.name, "looking for a leader");
        let request = self.outgoing(MessageType::MainRequest, None, &state.name);
        self.multicast(&state.name, request).await;

        self.after(state, self.timings.discover_timeout(), Tick::DiscoverExpired);
    }

    async fn start_election(&self, state: &Arc<NetworkState>) {
        if self
            .enter(state, &[Level::DiscoverMain], Level::Election)
            .is_err()
        {
            return;
        }
        state.cancel_timers();
        *state.ballot.lock() = Some(Ballot::new(self.credential.clone()));

        info!(network = %state.name, credential = %self.credential, "no leader answered, starting election");
        let ballot = self
            .outgoing(MessageType::Credential, None, &state.name)
            .with_attribute(attr::CREDENTIAL, self.credential.encode());
        self.multicast(&state.name, ballot).await;

        self.after(state, self.timings.election_window(), Tick::ElectionClosed);
    }

    async fn finish_election(&self, state: &Arc<NetworkState>) {
        if state.level.get() != Level::Election {
            return;
        }
        let Some(ballot) = state.ballot.lock().take() else {
            return;
        };
        debug!(
            network = %state.name,
            winner = %ballot.winner(),
            candidates = ballot.candidates(),
            "election window closed"
        );
        if ballot.we_win() {
            self.become_leader(state).await;
        } else {
            // the winner announces itself with MAIN_REPLY
            self.begin_discovery(state).await;
        }
    }

    async fn heartbeat(&self, state: &NetworkState) {
        if !self.is_main(&state.name) || !state.level.get().serves_requests() {
            return;
        }
        let beat = self.outgoing(MessageType::IAmHere, None, &state.name);
        self.multicast(&state.name, beat).await;
    }

    async fn watch_leader(&self, state: &Arc<NetworkState>) {
        if self.is_main(&state.name) || !state.level.get().serves_requests() {
            return;
        }
        let Ok(manager) = self.network(&state.name) else {
            return;
        };
        let Some(leader) = manager.core().leader() else {
            return;
        };
        let silent = manager
            .core()
            .neighbors()
            .silence(&leader)
            .map_or(true, |silence| silence > self.timings.leader_timeout());
        if silent {
            warn!(network = %state.name, %leader, "leader went silent");
            self.leader_lost(state, &leader).await;
        }
    }

    async fn leader_lost(&self, state: &Arc<NetworkState>, leader: &str) {
        state.cancel_timers();
        let purged = self.cache.delete_by_owner(leader);
        if let Ok(manager) = self.network(&state.name) {
            manager.core().neighbors().remove(leader);
        }
        self.events.emit(ProtocolEvent::PeerLeft {
            network: state.name.clone(),
            peer: leader.to_string(),
        });
        if purged > 0 {
            self.trigger_cache_updated(&state.name, self.cache.update_id());
        }
        self.begin_discovery(state).await;
    }

    /// Accept `leader` and run the join and initial fetch
    async fn accept_leader(&self, state: &Arc<NetworkState>, leader: &str) {
        if self
            .enter(state, &[Level::DiscoverMain, Level::Election], Level::Joining)
            .is_err()
        {
            return;
        }
        state.cancel_timers();
        state.ballot.lock().take();
        if let Ok(manager) = self.network(&state.name) {
            manager.core().set_main(false);
            manager.core().set_leader(Some(leader.to_string()));
        }
        info!(network = %state.name, %leader, "leader found, joining");
        self.events.emit(ProtocolEvent::LeaderElected {
            network: state.name.clone(),
            leader: leader.to_string(),
        });

        if let Err(err) = self.keys.join(&state.name, leader).await {
            error!(network = %state.name, %leader, error = %err, "join refused, network not started");
            state.started.store(false, Ordering::SeqCst);
            self.set_level(state, Level::Undef);
            return;
        }

        let _ = self.enter(state, &[Level::Joining], Level::InitialUpdate);
        match self.initial_update(&state.name, leader).await {
            Ok(update_id) => {
                self.set_level(state, Level::WaitEvent);
                state.started.store(true, Ordering::SeqCst);
                self.trigger_cache_updated(&state.name, update_id);
                self.every(state, self.timings.heartbeat_period(), Tick::LeaderWatch);
            }
            Err(err) => {
                warn!(network = %state.name, %leader, error = %err, "initial update failed");
                self.leader_lost(state, leader).await;
            }
        }
    }

    async fn initial_update(&self, network: &str, leader: &str) -> MsdResult<u64> {
        let snapshot = self.fetch(network, leader, &Template::any()).await?;
        let report = self.cache.merge_from_leader(&snapshot, network);
        self.cache.observe_update_id(snapshot.update_id);
        debug!(network, %leader, ?report, "initial cache fetched");
        let leader_id = self.push(network, leader).await?;
        debug!(network, %leader, leader_id, "registered for updates");
        Ok(snapshot.update_id)
    }

    // ========================================================================
    // Inbound messages
    // ========================================================================

    async fn on_main_request(&self, state: &Arc<NetworkState>, from: &str) {
        if !self.is_main(&state.name) {
            return;
        }
        if !state.level.get().serves_requests() {
            debug!(network = %state.name, %from, "MAIN_REQUEST dropped at {}", state.level.get());
            return;
        }
        let reply = self
            .outgoing(MessageType::MainReply, Some(from), &state.name)
            .with_attribute(attr::UPDATE, self.cache.update_id().to_string());
        if let Err(err) = self.unicast(&state.name, from, reply).await {
            warn!(network = %state.name, %from, error = %err, "MAIN_REPLY failed");
        }
    }

    async fn on_main_reply(&self, state: &Arc<NetworkState>, from: &str) {
        if self.is_main(&state.name) {
            let err = StateError::SplitLeader {
                network: state.name.clone(),
                other: from.to_string(),
            };
            error!(error = %err, "split leader");
            self.events.emit(ProtocolEvent::SplitLeader {
                network: state.name.clone(),
                other: from.to_string(),
            });
            return;
        }

        let level = state.level.get();
        if level.is_discovering() {
            // also aborts an election in flight
            self.accept_leader(state, from).await;
        } else if level.serves_requests() && self.leader_of(&state.name).as_deref() == Some(from) {
            debug!(network = %state.name, leader = %from, "leader announcement");
        } else {
            debug!(network = %state.name, %from, "MAIN_REPLY dropped at {}", level);
        }
    }

    async fn on_credential(&self, state: &Arc<NetworkState>, from: &str, msg: &Message) {
        let Some(credential) = msg
            .attribute(attr::CREDENTIAL)
            .and_then(|value| Credential::decode(value, from))
        else {
            debug!(network = %state.name, %from, "CREDENTIAL without a usable rank");
            return;
        };

        let level = state.level.get();
        if self.is_main(&state.name) && level.serves_requests() {
            // a late candidate: tell it who leads
            let reply = self
                .outgoing(MessageType::MainReply, Some(from), &state.name)
                .with_attribute(attr::UPDATE, self.cache.update_id().to_string());
            if let Err(err) = self.unicast(&state.name, from, reply).await {
                warn!(network = %state.name, %from, error = %err, "MAIN_REPLY to candidate failed");
            }
            return;
        }
        if level == Level::DiscoverMain {
            self.start_election(state).await;
        }
        let mut ballot = state.ballot.lock();
        let Some(ballot) = ballot.as_mut() else {
            debug!(network = %state.name, %from, "CREDENTIAL dropped at {}", level);
            return;
        };
        if ballot.offer(credential, self.policy.as_ref()) {
            debug!(network = %state.name, leading = %ballot.winner(), "stronger credential");
        }
    }

    async fn on_update(&self, state: &Arc<NetworkState>, from: &str, msg: &Message) {
        let Some(update_id) = msg.attribute(attr::UPDATE).and_then(|id| id.parse::<u64>().ok()) else {
            debug!(network = %state.name, %from, "UPDATE without an id");
            return;
        };
        if let Err(err) = self.begin(state, Level::Update, "pull_update") {
            debug!(error = %err, "UPDATE dropped");
            return;
        }

        let outcome = self.fetch(&state.name, from, &Template::any()).await;
        let republish = match outcome {
            Ok(snapshot) => {
                let from_leader =
                    !self.is_main(&state.name) && self.leader_of(&state.name).as_deref() == Some(from);
                let report = if from_leader {
                    self.cache.merge_from_leader(&snapshot, &state.name)
                } else {
                    self.cache.merge(&snapshot)
                };
                self.cache.observe_update_id(update_id);
                self.trigger_cache_updated(&state.name, update_id);
                report.changed() && self.is_main(&state.name)
            }
            Err(err) => {
                warn!(network = %state.name, peer = %from, error = %err, "update pull failed, treating peer as gone");
                self.cache.delete_by_owner(from);
                self.events.emit(ProtocolEvent::PeerLeft {
                    network: state.name.clone(),
                    peer: from.to_string(),
                });
                self.trigger_cache_updated(&state.name, self.cache.update_id());
                false
            }
        };
        self.finish(state, Level::Update);

        if republish {
            let id = self.cache.bump_update_id();
            self.announce_update(&state.name, id).await;
        }
    }

    async fn on_left(&self, state: &Arc<NetworkState>, from: &str) {
        let level = state.level.get();
        if matches!(level, Level::Undef | Level::Left | Level::Leaving) {
            return;
        }
        if !self.is_main(&state.name) && self.leader_of(&state.name).as_deref() == Some(from) {
            info!(network = %state.name, leader = %from, "leader left");
            self.leader_lost(state, from).await;
            return;
        }

        let purged = self.cache.delete_by_owner(from);
        if self.is_main(&state.name) && state.members.lock().remove(from) {
            self.keys
                .on_membership_change(&state.name, MembershipChange::Leave(from.to_string()));
        }
        info!(network = %state.name, peer = %from, purged, "peer left");
        self.events.emit(ProtocolEvent::PeerLeft {
            network: state.name.clone(),
            peer: from.to_string(),
        });
        if purged > 0 {
            let id = self.cache.bump_update_id();
            self.trigger_cache_updated(&state.name, id);
            if self.is_main(&state.name) {
                self.announce_update(&state.name, id).await;
            }
        }
    }

    // ========================================================================
    // Inbound connections
    // ========================================================================

    async fn serve_get(&self, connection: &Connection, network: &str, request: &Message) {
        if request.message_type() != MessageType::Update {
            debug!(network, peer = %connection.from(), "GET with a {:?} request refused", request.message_type());
            let _ = connection
                .send(Message::error("GET expects an UPDATE-typed request"))
                .await;
            let _ = connection.close().await;
            return;
        }
        let template = Template::parse(request.attribute(attr::TEMPLATE).unwrap_or_default());
        let mut snapshot = self.cache.snapshot();
        snapshot.services.retain(|s| template.matches(s));
        let filtered = outbound(&snapshot, connection.from(), network, &self.node_id);

        let reply = match filtered.to_bytes() {
            Ok(bytes) => self
                .outgoing(MessageType::Update, Some(connection.from()), network)
                .with_attribute(attr::UPDATE, filtered.update_id.to_string())
                .with_payload(bytes),
            Err(err) => Message::error(&err.to_string()),
        };
        if let Err(err) = connection.send(self.seal(reply, network)).await {
            debug!(network, peer = %connection.from(), error = %err, "GET reply failed");
        }
        let _ = connection.close().await;
    }

    async fn serve_update(&self, connection: &Connection, state: &Arc<NetworkState>, request: &Message) {
        let peer = connection.from().to_string();
        let snapshot = match CacheSnapshot::from_bytes(request.payload()) {
            Ok(snapshot) => snapshot,
            Err(err) => {
                warn!(network = %state.name, %peer, error = %err, "unreadable UPDATE");
                let _ = connection.send(Message::error(&err.to_string())).await;
                let _ = connection.close().await;
                return;
            }
        };

        let report = self.cache.merge(&snapshot);
        let leader = self.is_main(&state.name);
        if leader && state.members.lock().insert(peer.clone()) {
            self.keys
                .on_membership_change(&state.name, MembershipChange::Join(peer.clone()));
        }
        let update_id = if report.changed() {
            self.cache.bump_update_id()
        } else {
            self.cache.update_id()
        };

        let reply = self
            .outgoing(MessageType::Update, Some(&peer), &state.name)
            .with_attribute(attr::UPDATE, update_id.to_string());
        if let Err(err) = connection.send(reply).await {
            debug!(network = %state.name, %peer, error = %err, "UPDATE reply failed");
        }
        let _ = connection.close().await;

        if report.changed() {
            self.trigger_cache_updated(&state.name, update_id);
            if leader {
                self.announce_update(&state.name, update_id).await;
            }
        }
    }

    async fn serve_use(&self, connection: Connection, request: &Message) {
        let service = request.attribute(attr::SERVICE).unwrap_or_default().to_string();
        let handler = self.use_handlers.read().get(&service).cloned();
        match handler {
            Some(handler) => {
                debug!(%service, peer = %connection.from(), "brokering USE");
                handler.accept(&service, connection).await;
            }
            None => {
                debug!(%service, peer = %connection.from(), "no handler for USE");
                let reason = format!("no handler for service {}", service);
                let _ = connection.send(Message::error(&reason)).await;
                let _ = connection.close().await;
            }
        }
    }

    // ========================================================================
    // Local operations
    // ========================================================================

    async fn announce_update(&self, network: &str, update_id: u64) {
        debug!(network, update_id, "announcing UPDATE");
        let msg = self
            .outgoing(MessageType::Update, None, network)
            .with_attribute(attr::UPDATE, update_id.to_string());
        self.multicast(network, msg).await;
    }

    /// Propagate a local cache change with `update_id`: the leader announces
    /// it to its followers, a follower pushes its cache to the leader
    pub async fn publish_update(&self, network: &str, update_id: u64) -> MsdResult<()> {
        let state = self.state(network)?;
        if self.is_main(network) {
            let level = state.level.get();
            if !level.serves_requests() {
                return Err(StateError::Forbidden {
                    network: network.to_string(),
                    operation: "publish_update",
                    level: level.to_string(),
                }
                .into());
            }
            self.trigger_cache_updated(network, update_id);
            self.announce_update(network, update_id).await;
            return Ok(());
        }

        let leader = self
            .leader_of(network)
            .ok_or_else(|| StateError::NoLeader(network.to_string()))?;
        self.begin(&state, Level::Update, "publish_update")?;
        let result = self.push(network, &leader).await;
        self.finish(&state, Level::Update);
        let leader_id = result?;
        debug!(network, update_id, leader_id, "pushed update to leader");
        Ok(())
    }

    /// Publish the current cache on every network that is idle
    pub async fn local_changed(&self) {
        let update_id = self.cache.update_id();
        for (name, state) in &self.networks {
            if state.level.get() != Level::WaitEvent {
                continue;
            }
            if let Err(err) = self.publish_update(name, update_id).await {
                warn!(network = %name, error = %err, "update propagation failed");
            }
        }
    }

    /// Template search on `network`: answered locally by the leader,
    /// proxied as a GET otherwise
    pub async fn browse(&self, network: &str, template: &Template) -> MsdResult<Vec<Service>> {
        let state = self.state(network)?;
        self.begin(&state, Level::Browse, "browse")?;

        let result = if self.is_main(network) {
            Ok(self.cache.query(template))
        } else {
            match self.leader_of(network) {
                Some(leader) => self
                    .fetch(network, &leader, template)
                    .await
                    .map(|snapshot| snapshot.services),
                None => Err(StateError::NoLeader(network.to_string()).into()),
            }
        };

        self.finish(&state, Level::Browse);
        result
    }

    /// Open a brokered connection to `service_id` owned by `owner`
    pub async fn use_service(&self, service_id: &str, owner: &str) -> MsdResult<Connection> {
        let request = Message::addressed(MessageType::Use, &self.node_id, Some(owner))
            .with_attribute(attr::SERVICE, service_id);

        if owner == self.node_id {
            let connection = self
                .router
                .open_connection(ConnectionType::Use, &self.node_id, owner)
                .await?;
            connection.send(request).await?;
            return Ok(connection);
        }

        let next = self
            .router
            .next_hop(owner)
            .ok_or_else(|| RoutingError::HostUnreachable(owner.to_string()))?;
        let state = self.state(next.network.name())?;
        self.begin(&state, Level::Use, "use")?;

        let result: MsdResult<Connection> = async {
            let connection = self
                .router
                .open_connection(ConnectionType::Use, &self.node_id, owner)
                .await?;
            connection
                .send(request.with_attribute(attr::NETWORK, next.network.name()))
                .await?;
            Ok(connection)
        }
        .await;

        self.finish(&state, Level::Use);
        result
    }

    /// LEAVING/LEFT: the leader tells its followers, a follower its leader
    pub async fn leave(&self, network: &str) -> MsdResult<()> {
        let state = self.state(network)?;
        if matches!(state.level.get(), Level::Undef | Level::Left) {
            return Ok(());
        }
        state.cancel_timers();
        state.ballot.lock().take();
        self.set_level(&state, Level::FinalUpdate);

        let manager = self.network(network)?;
        let notice = self.outgoing(MessageType::Left, None, network);
        if manager.core().is_main() {
            self.multicast(network, notice).await;
        } else if let Some(leader) = manager.core().leader() {
            let mut notice = notice;
            notice.set_to(&leader);
            if let Err(err) = self.unicast(network, &leader, notice).await {
                debug!(network, %leader, error = %err, "LEFT notice not delivered");
            }
        }

        self.set_level(&state, Level::Leaving);
        manager.core().set_main(false);
        manager.core().set_leader(None);
        state.members.lock().clear();
        state.started.store(false, Ordering::SeqCst);
        self.set_level(&state, Level::Left);
        info!(network, "left network");
        Ok(())
    }

    pub async fn shutdown(&self) {
        for name in self.networks.keys() {
            if let Err(err) = self.leave(name).await {
                warn!(network = %name, error = %err, "leave failed");
            }
        }
    }
}

#[async_trait]
impl LocalDispatch for MessageManager {
    async fn dispatch_message(&self, msg: Message, network: Option<String>) {
        let Some(from) = msg.from_id().map(str::to_string) else {
            debug!("message without sender dropped: {}", msg);
            return;
        };
        if from == self.node_id {
            return;
        }
        let Some(name) = network.or_else(|| msg.network().map(str::to_string)) else {
            debug!(%from, "message without network dropped");
            return;
        };
        let Ok(state) = self.state(&name) else {
            debug!(network = %name, %from, "message for unknown network dropped");
            return;
        };

        match msg.message_type() {
            MessageType::MainRequest => self.on_main_request(&state, &from).await,
            MessageType::MainReply => self.on_main_reply(&state, &from).await,
            MessageType::Credential => self.on_credential(&state, &from, &msg).await,
            MessageType::Update => self.on_update(&state, &from, &msg).await,
            MessageType::Left => self.on_left(&state, &from).await,
            MessageType::IAmHere => {
                if self.leader_of(&name).as_deref() == Some(from.as_str()) {
                    debug!(network = %name, leader = %from, "leader heartbeat");
                }
            }
            other => debug!(network = %name, %from, "{} message dropped", other),
        }
    }

    async fn dispatch_connection(&self, connection: Connection, network: Option<String>) {
        let request = match connection.receive().await {
            Ok(Some(request)) => request,
            Ok(None) => return,
            Err(err) => {
                debug!(peer = %connection.from(), error = %err, "connection failed before request");
                connection.close_connection();
                return;
            }
        };

        let name = request
            .network()
            .map(str::to_string)
            .or(network)
            .unwrap_or_else(|| connection.network().to_string());
        let state = match self.state(&name) {
            Ok(state) => state,
            Err(err) if connection.connection_type() == ConnectionType::Use => {
                // local USE pairs carry no network
                debug!(error = %err, "USE outside a network");
                self.serve_use(connection, &request).await;
                return;
            }
            Err(err) => {
                let _ = connection.send(Message::error(&err.to_string())).await;
                let _ = connection.close().await;
                return;
            }
        };

        let level = state.level.get();
        if !level.serves_requests() {
            let err = StateError::Forbidden {
                network: name.clone(),
                operation: "serve",
                level: level.to_string(),
            };
            debug!(error = %err, peer = %connection.from(), "connection refused");
            let _ = connection.send(Message::error(&err.to_string())).await;
            let _ = connection.close().await;
            return;
        }

        match connection.connection_type() {
            ConnectionType::Get => self.serve_get(&connection, &name, &request).await,
            ConnectionType::Update => self.serve_update(&connection, &state, &request).await,
            ConnectionType::Use => self.serve_use(connection, &request).await,
            ConnectionType::Physical => {
                debug!(peer = %connection.from(), "stray physical connection");
                connection.close_connection();
            }
        }
    }
}

impl std::fmt::Debug for MessageManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageManager")
            .field("node_id", &self.node_id)
            .field("networks", &self.networks.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Limits, NetworkConfig};
    use crate::keying::StaticKeyring;
    use crate::message::Codec;
    use crate::protocol::election::RankPolicy;
    use crate::transport::{Address, MemoryHub, NetworkCore, TransportKind};

    struct Echo;

    #[async_trait]
    impl UseHandler for Echo {
        async fn accept(&self, _service_id: &str, connection: Connection) {
            tokio::spawn(async move {
                while let Ok(Some(msg)) = connection.receive().await {
                    if connection.send(msg).await.is_err() {
                        break;
                    }
                }
            });
        }
    }

    fn manager(leader: bool) -> Arc<MessageManager> {
        let mut config = NodeConfig::new("me");
        config.is_leader = leader;
        let timers = Arc::new(TimerService::new());
        let core = Arc::new(NetworkCore::new(
            NetworkConfig {
                name: "bt".into(),
                kind: TransportKind::Bluetooth,
                local: Address::new("mem://me", 0, "bt"),
                multicast: None,
                service_name: "msd".into(),
            },
            "me",
            Limits::default(),
            Codec::new(),
        ));
        let network = Arc::new(NetworkManager::bluetooth(
            core,
            Arc::new(MemoryHub::new()),
            timers.clone(),
            &config.timings,
        ));
        let cache = Arc::new(ServiceCache::new("me"));
        let pool = TaskPool::new(8);
        let router = RouterManager::new("me", vec![network], cache.clone(), pool.clone(), 5);
        let manager = MessageManager::new(
            &config,
            router.clone(),
            cache,
            Arc::new(StaticKeyring::new()),
            timers,
            pool,
            Arc::new(RankPolicy),
        );
        let local: Arc<dyn LocalDispatch> = manager.clone();
        router.set_local_dispatch(Arc::downgrade(&local));
        manager
    }

    #[tokio::test]
    async fn test_browse_refused_before_start() {
        let m = manager(false);
        let result = m.browse("bt", &Template::any()).await;
        assert!(matches!(
            result,
            Err(MsdError::State(StateError::Forbidden { operation: "browse", .. }))
        ));
        assert!(matches!(
            m.browse("wifi", &Template::any()).await,
            Err(MsdError::State(StateError::UnknownNetwork(_)))
        ));
    }

    #[tokio::test]
    async fn test_leader_start_and_restart_refused() {
        let m = manager(true);
        let mut events = m.subscribe();
        m.start_network("bt").await.unwrap();

        assert_eq!(m.level("bt"), Some(Level::WaitEvent));
        assert!(m.is_main("bt"));
        assert!(m.is_started("bt"));
        assert_eq!(m.leader_of("bt").as_deref(), Some("me"));

        let mut elected = false;
        while let Ok(event) = events.try_recv() {
            elected |= matches!(event, ProtocolEvent::LeaderElected { ref leader, .. } if leader == "me");
        }
        assert!(elected);
        assert!(m.start_network("bt").await.is_err());
    }

    #[tokio::test]
    async fn test_leader_browses_locally() {
        let m = manager(true);
        m.start_network("bt").await.unwrap();
        m.cache.register(Service::new("printer", "me").with_attribute("kind", "laser"));

        let found = m.browse("bt", &Template::parse("kind=laser")).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(m.level("bt"), Some(Level::WaitEvent));
    }

    #[tokio::test]
    async fn test_use_own_service_goes_through_handler() {
        let m = manager(true);
        m.register_use_handler("echo", Arc::new(Echo));

        let conn = m.use_service("echo", "me").await.unwrap();
        conn.send(Message::data(b"hi".to_vec())).await.unwrap();
        let back = conn.receive().await.unwrap().unwrap();
        assert_eq!(back.payload(), b"hi");
    }

    #[tokio::test]
    async fn test_use_without_handler_gets_error() {
        let m = manager(true);
        let conn = m.use_service("nothing", "me").await.unwrap();
        let reply = conn.receive().await.unwrap().unwrap();
        assert_eq!(reply.message_type(), MessageType::Error);
        assert_eq!(conn.receive().await, Ok(None));
    }

    #[tokio::test]
    async fn test_get_answers_only_update_typed_requests() {
        let m = manager(true);
        m.start_network("bt").await.unwrap();
        m.cache.register(Service::new("printer", "me").on_network("bt"));

        let conn = m.open("bt", ConnectionType::Get, "me").await.unwrap();
        conn.send(m.get_request("me", "bt", &Template::any())).await.unwrap();
        let reply = conn.receive().await.unwrap().unwrap();
        assert_eq!(reply.message_type(), MessageType::Update);
        let current = m.cache.update_id().to_string();
        assert_eq!(reply.attribute(attr::UPDATE), Some(current.as_str()));
        let _ = conn.close().await;

        let conn = m.open("bt", ConnectionType::Get, "me").await.unwrap();
        conn.send(m.outgoing(MessageType::Use, Some("me"), "bt")).await.unwrap();
        let reply = conn.receive().await.unwrap().unwrap();
        assert_eq!(reply.message_type(), MessageType::Error);
    }

    #[tokio::test]
    async fn test_leave_before_start_is_noop() {
        let m = manager(false);
        m.leave("bt").await.unwrap();
        assert_eq!(m.level("bt"), Some(Level::Undef));
    }

    #[tokio::test]
    async fn test_leave_reaches_left() {
        let m = manager(true);
        m.start_network("bt").await.unwrap();
        m.leave("bt").await.unwrap();
        assert_eq!(m.level("bt"), Some(Level::Left));
        assert!(!m.is_main("bt"));
        assert!(!m.is_started("bt"));
    }
}
