//! Network manager — one per configured transport network
//!
//! `NetworkCore` holds what every variant shares (identity, neighbor table,
//! leader bookkeeping, the inbound hand-off to the router). `Transport` is the
//! variant-specific part, dispatched by enum.

use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, info};

use super::abstraction::{Address, RawStreamPair, TransportKind};
use super::bluetooth::{BluetoothTransport, StreamDialer};
use super::internet::InternetTransport;
use super::neighbors::NeighborTable;
use crate::config::{Limits, NetworkConfig, ProtocolTimings};
use crate::connection::Connection;
use crate::error::RoutingError;
use crate::message::{Codec, ConnectionType, Message, MessageType};
use crate::timer::{TimerHandle, TimerService};

/// Receiver of everything a network accepts. Both calls must return quickly.
pub trait InboundSink: Send + Sync {
    fn deliver_message(&self, msg: Message, network: &str);
    fn deliver_connection(&self, connection: Connection, network: &str);
}

/// Unicast destination: a neighbor's node id or an explicit address
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    Node(String),
    Address(Address),
}

impl From<Address> for Target {
    fn from(address: Address) -> Self {
        Target::Address(address)
    }
}

/// State shared by every transport variant of one network
pub struct NetworkCore {
    config: NetworkConfig,
    node_id: String,
    limits: Limits,
    codec: Codec,
    neighbors: NeighborTable,
    main: AtomicBool,
    leader: RwLock<Option<String>>,
    inbound: RwLock<Option<Weak<dyn InboundSink>>>,
}

impl NetworkCore {
    pub fn new(config: NetworkConfig, node_id: impl Into<String>, limits: Limits, codec: Codec) -> Self {
        let node_id = node_id.into();
        Self {
            neighbors: NeighborTable::new(node_id.clone()),
            config,
            node_id,
            limits,
            codec,
            main: AtomicBool::new(false),
            leader: RwLock::new(None),
            inbound: RwLock::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn kind(&self) -> TransportKind {
        self.config.kind
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn limits(&self) -> &Limits {
        &self.limits
    }

    pub fn codec(&self) -> &Codec {
        &self.codec
    }

    pub fn neighbors(&self) -> &NeighborTable {
        &self.neighbors
    }

    pub fn is_main(&self) -> bool {
        self.main.load(Ordering::SeqCst)
    }

    pub fn set_main(&self, main: bool) {
        self.main.store(main, Ordering::SeqCst);
    }

    pub fn leader(&self) -> Option<String> {
        self.leader.read().clone()
    }

    pub fn set_leader(&self, leader: Option<String>) {
        *self.leader.write() = leader;
    }

    pub fn set_inbound(&self, sink: Weak<dyn InboundSink>) {
        *self.inbound.write() = Some(sink);
    }

    fn sink(&self) -> Option<Arc<dyn InboundSink>> {
        self.inbound.read().as_ref().and_then(Weak::upgrade)
    }

    /// Common receive path for a decoded plain message
    pub fn accept_message(&self, msg: Message, source: Option<Address>) {
        if let Some(from) = msg.from_id() {
            self.neighbors.touch(from, source);
        }
        match self.sink() {
            Some(sink) => sink.deliver_message(msg, self.name()),
            None => debug!(network = %self.name(), "no inbound sink, dropping message"),
        }
    }

    /// Common receive path for a connection materialized from a CONN handshake
    pub fn accept_connection(&self, connection: Connection, source: Option<Address>) {
        self.neighbors.touch(connection.from(), source);
        match self.sink() {
            Some(sink) => sink.deliver_connection(connection, self.name()),
            None => {
                debug!(network = %self.name(), "no inbound sink, closing connection");
                connection.close_connection();
            }
        }
    }

    /// Forget neighbors silent for longer than `max_silence`
    pub fn expire_neighbors(&self, max_silence: Duration) -> Vec<String> {
        let gone = self.neighbors.expire(max_silence);
        for id in &gone {
            info!(network = %self.name(), neighbor = %id, "neighbor went silent, dropped");
        }
        gone
    }

    /// Build the CONN handshake for a logical connection
    pub fn handshake(&self, conn_type: ConnectionType, from: &str, to: &str, detail: Option<&str>) -> Message {
        let payload = match detail {
            Some(detail) => format!("{}\r\n{}", conn_type.code(), detail),
            None => conn_type.code().to_string(),
        };
        Message::addressed(MessageType::Conn, from, Some(to))
            .with_attribute(crate::message::attr::NETWORK, self.name())
            .with_payload(payload.into_bytes())
    }
}

/// Parse a CONN payload into its type code and optional detail line
pub fn parse_handshake(msg: &Message) -> Option<(ConnectionType, Option<String>)> {
    let text = msg.payload_text();
    let mut lines = text.splitn(2, "\r\n");
    let code = lines.next()?.trim().parse::<u8>().ok()?;
    let conn_type = ConnectionType::from_code(code)?;
    let detail = lines
        .next()
        .map(|d| d.trim().to_string())
        .filter(|d| !d.is_empty());
    Some((conn_type, detail))
}

/// Variant-specific machinery
pub enum Transport {
    Internet(InternetTransport),
    Bluetooth(BluetoothTransport),
}

/// Periodic removal of silent neighbors
struct NeighborExpiry {
    timers: Arc<TimerService>,
    period: Duration,
    max_silence: Duration,
}

pub struct NetworkManager {
    core: Arc<NetworkCore>,
    transport: Transport,
    expiry: Option<NeighborExpiry>,
    sweep: Mutex<Option<TimerHandle>>,
}

impl NetworkManager {
    pub fn internet(core: Arc<NetworkCore>) -> Self {
        Self {
            transport: Transport::Internet(InternetTransport::new(core.clone())),
            core,
            expiry: None,
            sweep: Mutex::new(None),
        }
    }

    pub fn bluetooth(
        core: Arc<NetworkCore>,
        dialer: Arc<dyn StreamDialer>,
        timers: Arc<TimerService>,
        timings: &ProtocolTimings,
    ) -> Self {
        Self {
            transport: Transport::Bluetooth(BluetoothTransport::new(
                core.clone(),
                dialer,
                timers,
                timings,
            )),
            core,
            expiry: None,
            sweep: Mutex::new(None),
        }
    }

    /// Sweep the neighbor table every idle-sweep period once started
    pub fn with_neighbor_expiry(mut self, timers: Arc<TimerService>, timings: &ProtocolTimings) -> Self {
        self.expiry = Some(NeighborExpiry {
            timers,
            period: timings.idle_sweep_period(),
            max_silence: timings.neighbor_timeout(),
        });
        self
    }

    /// Factory keyed by the configured transport kind
    pub fn from_config(
        core: Arc<NetworkCore>,
        dialer: Option<Arc<dyn StreamDialer>>,
        timers: Arc<TimerService>,
        timings: &ProtocolTimings,
    ) -> Result<Self, RoutingError> {
        let manager = match core.kind() {
            TransportKind::Internet => Self::internet(core),
            TransportKind::Bluetooth => {
                let dialer = dialer.ok_or_else(|| {
                    RoutingError::Io(format!("network {} needs a stream dialer", core.name()))
                })?;
                Self::bluetooth(core, dialer, timers.clone(), timings)
            }
        };
        Ok(manager.with_neighbor_expiry(timers, timings))
    }

    pub fn core(&self) -> &Arc<NetworkCore> {
        &self.core
    }

    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    pub fn name(&self) -> &str {
        self.core.name()
    }

    pub fn kind(&self) -> TransportKind {
        self.core.kind()
    }

    /// Local endpoint, as actually bound once started
    pub fn local_address(&self) -> Address {
        match &self.transport {
            Transport::Internet(t) => t.local_address(),
            Transport::Bluetooth(_) => self.core.config().local.clone(),
        }
    }

    /// Whether `node_id` is directly visible on this network
    pub fn can_reach(&self, node_id: &str) -> bool {
        self.core.neighbors().contains(node_id)
    }

    pub async fn start(&self) -> Result<(), RoutingError> {
        match &self.transport {
            Transport::Internet(t) => t.start().await?,
            Transport::Bluetooth(t) => t.start().await?,
        }
        if let Some(expiry) = &self.expiry {
            let weak = Arc::downgrade(&self.core);
            let max_silence = expiry.max_silence;
            let handle = expiry.timers.register(
                Arc::new(move |_: &str, _: Option<&str>| match weak.upgrade() {
                    Some(core) => {
                        core.expire_neighbors(max_silence);
                        true
                    }
                    None => false,
                }),
                expiry.period,
                format!("neighbor-sweep:{}", self.name()),
                None,
            );
            *self.sweep.lock() = Some(handle);
        }
        info!(network = %self.name(), kind = %self.kind(), local = %self.local_address(), "network started");
        Ok(())
    }

    pub async fn send_unicast(&self, msg: Message, target: Target) -> Result<(), RoutingError> {
        match &self.transport {
            Transport::Internet(t) => t.send_unicast(msg, target).await,
            Transport::Bluetooth(t) => t.send_unicast(msg, target).await,
        }
    }

    pub async fn send_multicast(&self, msg: Message) -> Result<(), RoutingError> {
        match &self.transport {
            Transport::Internet(t) => t.send_multicast(msg).await,
            Transport::Bluetooth(t) => t.send_multicast(msg).await,
        }
    }

    pub async fn get_connection(
        &self,
        conn_type: ConnectionType,
        from: &str,
        to: &str,
        target: Target,
    ) -> Result<Connection, RoutingError> {
        match &self.transport {
            Transport::Internet(t) => t.get_connection(conn_type, from, to, target).await,
            Transport::Bluetooth(t) => t.get_connection(conn_type, from, to, target).await,
        }
    }

    pub async fn get_raw_stream(&self, address: &Address) -> Result<RawStreamPair, RoutingError> {
        match &self.transport {
            Transport::Internet(t) => t.get_raw_stream(address).await,
            Transport::Bluetooth(t) => t.get_raw_stream(address).await,
        }
    }

    pub async fn shutdown(&self) {
        if let Some(handle) = self.sweep.lock().take() {
            handle.cancel();
        }
        match &self.transport {
            Transport::Internet(t) => t.shutdown().await,
            Transport::Bluetooth(t) => t.shutdown().await,
        }
        info!(network = %self.name(), "network stopped");
    }
}

impl std::fmt::Debug for NetworkManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkManager")
            .field("name", &self.name())
            .field("kind", &self.kind())
            .field("main", &self.core.is_main())
            .field("neighbors", &self.core.neighbors().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Collect {
        messages: Mutex<Vec<(Message, String)>>,
    }

    impl InboundSink for Collect {
        fn deliver_message(&self, msg: Message, network: &str) {
            self.messages.lock().push((msg, network.to_string()));
        }

        fn deliver_connection(&self, connection: Connection, _network: &str) {
            connection.close_connection();
        }
    }

    fn core() -> NetworkCore {
        let config = NetworkConfig {
            name: "bt".into(),
            kind: TransportKind::Bluetooth,
            local: Address::new("mem://a", 1, "bt"),
            multicast: None,
            service_name: "msd".into(),
        };
        NetworkCore::new(config, "a", Limits::default(), Codec::new())
    }

    #[test]
    fn test_handshake_roundtrip() {
        let core = core();
        let msg = core.handshake(ConnectionType::Get, "a", "b", Some("v-1"));
        assert_eq!(msg.message_type(), MessageType::Conn);
        assert_eq!(msg.network(), Some("bt"));
        assert_eq!(
            parse_handshake(&msg),
            Some((ConnectionType::Get, Some("v-1".to_string())))
        );

        let bare = core.handshake(ConnectionType::Use, "a", "b", None);
        assert_eq!(parse_handshake(&bare), Some((ConnectionType::Use, None)));
        assert_eq!(parse_handshake(&Message::new(MessageType::Conn)), None);
    }

    #[test]
    fn test_accept_message_marks_neighbor() {
        let core = core();
        let sink: Arc<dyn InboundSink> = Arc::new(Collect::default());
        core.set_inbound(Arc::downgrade(&sink));

        let msg = Message::addressed(MessageType::IAmHere, "b", None);
        core.accept_message(msg, Some(Address::new("mem://b", 1, "bt")));
        assert!(core.neighbors().contains("b"));

        // own traffic never makes us our own neighbor
        core.accept_message(Message::addressed(MessageType::IAmHere, "a", None), None);
        assert!(!core.neighbors().contains("a"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_neighbor_expires() {
        let timings = ProtocolTimings {
            idle_sweep_period_ms: 1_000,
            neighbor_timeout_ms: 3_000,
            ..ProtocolTimings::default()
        };
        let hub = Arc::new(crate::transport::MemoryHub::new());
        let timers = Arc::new(TimerService::new());
        let manager = NetworkManager::bluetooth(Arc::new(core()), hub, timers.clone(), &timings)
            .with_neighbor_expiry(timers.clone(), &timings);
        manager.start().await.unwrap();

        manager.core().neighbors().touch("quiet", None);
        manager.core().neighbors().touch("chatty", None);
        tokio::time::sleep(Duration::from_millis(2_000)).await;
        manager.core().neighbors().touch("chatty", None);
        tokio::time::sleep(Duration::from_millis(2_500)).await;

        assert!(!manager.can_reach("quiet"));
        assert!(manager.can_reach("chatty"));

        manager.shutdown().await;
        timers.shutdown();
    }

    #[test]
    fn test_leader_bookkeeping() {
        let core = core();
        assert!(!core.is_main());
        core.set_main(true);
        core.set_leader(Some("a".into()));
        assert!(core.is_main());
        assert_eq!(core.leader().as_deref(), Some("a"));
    }
}
