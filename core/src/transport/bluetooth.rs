// Bluetooth transport — stream-only links multiplexed into virtual connections
//
// Link setup is expensive, so one physical connection per remote device url is
// cached and reused for everything sent to that peer:
// - plain messages travel on the physical link untagged
// - logical connections are virtual connections, tagged `virtual:<id>`
// - multicast is iterated unicast over every known peer
//
// The radio itself sits behind `StreamDialer`, implemented by the platform
// (or by `MemoryHub` in process).

use async_trait::async_trait;
use futures::future::join_all;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::io;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::io::BufReader;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::abstraction::{normalize_url, Address, RawStreamPair};
use super::manager::{parse_handshake, NetworkCore, Target};
use crate::config::ProtocolTimings;
use crate::connection::Connection;
use crate::error::RoutingError;
use crate::message::{attr, ConnectionType, Message, MessageType, LOCAL_SENTINEL};
use crate::timer::{TimerHandle, TimerService};

/// Per-peer bound on one multicast delivery
const PEER_SEND_TIMEOUT: Duration = Duration::from_secs(5);

/// Platform stream API
#[async_trait]
pub trait StreamDialer: Send + Sync {
    /// Accept streams at `local`, advertising `service_name`
    async fn listen(
        &self,
        local: &Address,
        service_name: &str,
    ) -> io::Result<mpsc::Receiver<RawStreamPair>>;

    /// Open a stream to a device url
    async fn dial(&self, url: &str) -> io::Result<RawStreamPair>;

    /// Urls of devices currently advertising `service_name`
    async fn discover(&self, service_name: &str) -> io::Result<Vec<String>>;
}

/// One cached physical link and the virtual connections riding on it
struct PeerLink {
    url: String,
    physical: Connection,
    virtuals: Mutex<HashMap<String, Connection>>,
}

impl PeerLink {
    fn new(url: String, physical: Connection) -> Arc<Self> {
        Arc::new(Self {
            url,
            physical,
            virtuals: Mutex::new(HashMap::new()),
        })
    }

    fn register(self: &Arc<Self>, id: &str, connection: &Connection) {
        self.virtuals
            .lock()
            .insert(id.to_string(), connection.clone());
        let link: Weak<PeerLink> = Arc::downgrade(self);
        let id = id.to_string();
        connection.on_close(move || {
            if let Some(link) = link.upgrade() {
                link.virtuals.lock().remove(&id);
            }
        });
    }
}

struct Shared {
    core: Arc<NetworkCore>,
    dialer: Arc<dyn StreamDialer>,
    links: Mutex<HashMap<String, Arc<PeerLink>>>,
    idle_threshold: Duration,
}

impl Shared {
    fn local_url(&self) -> &str {
        &self.core.config().local.url
    }

    fn is_local(&self, url: &str) -> bool {
        normalize_url(url) == normalize_url(self.local_url())
    }

    fn cached(&self, key: &str) -> Option<Arc<PeerLink>> {
        let mut links = self.links.lock();
        match links.get(key) {
            Some(link) if !link.physical.is_closed() => Some(link.clone()),
            Some(_) => {
                links.remove(key);
                None
            }
            None => None,
        }
    }

    fn evict(&self, link: &Arc<PeerLink>) {
        let mut links = self.links.lock();
        if links
            .get(&link.url)
            .is_some_and(|cached| Arc::ptr_eq(cached, link))
        {
            links.remove(&link.url);
        }
    }

    /// Reuse the cached link to `url` or dial a new one. The table lock is
    /// never held while dialing.
    async fn link_for(self: &Arc<Self>, url: &str) -> Result<Arc<PeerLink>, RoutingError> {
        let key = normalize_url(url).to_string();
        if self.is_local(&key) {
            return Err(RoutingError::HostUnreachable(format!("{} is this node", key)));
        }
        if let Some(link) = self.cached(&key) {
            return Ok(link);
        }

        let stream = self
            .dialer
            .dial(url)
            .await
            .map_err(|e| RoutingError::HostUnreachable(format!("{}: {}", url, e)))?;
        let core = &self.core;
        let physical = Connection::physical(
            core.node_id(),
            key.clone(),
            ConnectionType::Physical,
            core.name(),
            stream,
            core.codec().clone(),
        );
        physical
            .send(core.handshake(
                ConnectionType::Physical,
                core.node_id(),
                LOCAL_SENTINEL,
                Some(self.local_url()),
            ))
            .await?;

        let link = PeerLink::new(key.clone(), physical);
        let existing = {
            let mut links = self.links.lock();
            match links.get(&key) {
                Some(existing) if !existing.physical.is_closed() => Some(existing.clone()),
                _ => {
                    links.insert(key.clone(), link.clone());
                    None
                }
            }
        };
        if let Some(existing) = existing {
            debug!(network = %core.name(), url = %key, "lost dial race, reusing existing link");
            let _ = link.physical.close().await;
            return Ok(existing);
        }

        info!(network = %core.name(), url = %key, "physical link established");
        tokio::spawn(demux(self.clone(), link.clone()));
        Ok(link)
    }

    /// Serve a stream accepted from the platform
    async fn accept_link(self: Arc<Self>, stream: RawStreamPair) {
        let core = &self.core;
        let RawStreamPair {
            reader,
            writer,
            peer,
        } = stream;
        let mut reader = BufReader::new(reader);
        let hello = match core.codec().read_message(&mut reader).await {
            Ok(msg) => msg,
            Err(err) => {
                debug!(network = %core.name(), error = %err, "link setup failed");
                return;
            }
        };
        let callback = match (hello.message_type(), parse_handshake(&hello)) {
            (MessageType::Conn, Some((ConnectionType::Physical, Some(url)))) => url,
            _ => {
                warn!(network = %core.name(), "expected physical link setup, got {}", hello);
                return;
            }
        };

        let key = normalize_url(&callback).to_string();
        let from = hello.from_id().unwrap_or_default().to_string();
        let callback_address = Address::new(callback, 0, core.name());
        core.neighbors().touch(&from, Some(callback_address.clone()));

        let physical = Connection::physical_buffered(
            from,
            core.node_id(),
            ConnectionType::Physical,
            core.name(),
            reader,
            writer,
            peer.or(Some(callback_address)),
            core.codec().clone(),
        );
        let link = PeerLink::new(key.clone(), physical);
        {
            let mut links = self.links.lock();
            match links.get(&key) {
                Some(existing) if !existing.physical.is_closed() => {
                    debug!(network = %core.name(), url = %key, "duplicate link from peer, serving it uncached");
                }
                _ => {
                    links.insert(key.clone(), link.clone());
                }
            }
        }
        info!(network = %core.name(), url = %key, "physical link accepted");
        demux(self.clone(), link).await;
    }

    fn open_virtual(&self, link: &Arc<PeerLink>, hello: &Message) {
        let core = &self.core;
        match parse_handshake(hello) {
            Some((ConnectionType::Physical, _)) => {
                debug!(network = %core.name(), url = %link.url, "link setup repeated on live link");
            }
            Some((conn_type, Some(id))) => {
                let connection = Connection::virtual_over(
                    &link.physical,
                    id.clone(),
                    hello.from_id().unwrap_or_default(),
                    hello.to_id().unwrap_or(core.node_id()),
                    conn_type,
                    core.limits().queue_capacity,
                );
                link.register(&id, &connection);
                debug!(network = %core.name(), url = %link.url, virtual_id = %id, %conn_type, "virtual connection accepted");
                core.accept_connection(connection, None);
            }
            _ => warn!(network = %core.name(), "malformed CONN on physical link: {}", hello),
        }
    }

    async fn route_virtual(&self, link: &Arc<PeerLink>, id: &str, msg: Message) {
        let connection = link.virtuals.lock().get(id).cloned();
        let Some(connection) = connection else {
            debug!(network = %self.core.name(), virtual_id = %id, "traffic for unknown virtual connection");
            return;
        };
        if msg.message_type() == MessageType::Close {
            link.virtuals.lock().remove(id);
            connection.peer_closed();
            return;
        }
        if let Err(err) = connection.deliver(msg) {
            warn!(network = %self.core.name(), virtual_id = %id, error = %err, "virtual delivery failed, closing");
            let _ = connection.close().await;
        }
    }

    fn sweep(&self) {
        let mut stale = Vec::new();
        {
            let mut links = self.links.lock();
            links.retain(|_, link| {
                if link.physical.is_closed() {
                    return false;
                }
                if link.physical.idle() > self.idle_threshold && link.virtuals.lock().is_empty() {
                    stale.push(link.clone());
                    return false;
                }
                true
            });
        }
        for link in stale {
            info!(network = %self.core.name(), url = %link.url, "evicting idle physical link");
            tokio::spawn(async move {
                let _ = link.physical.close().await;
            });
        }
    }
}

/// Read loop of one physical link: virtual traffic goes to its inbox, CONN
/// opens a virtual connection, everything else goes to the router
async fn demux(shared: Arc<Shared>, link: Arc<PeerLink>) {
    let core = shared.core.clone();
    let source = Address::new(link.url.clone(), 0, core.name());
    loop {
        let msg = match link.physical.receive().await {
            Ok(Some(msg)) => msg,
            Ok(None) => break,
            Err(err) => {
                debug!(network = %core.name(), url = %link.url, error = %err, "physical link failed");
                break;
            }
        };
        if let Some(from) = msg.from_id() {
            core.neighbors().touch(from, Some(source.clone()));
        }
        if msg.message_type() == MessageType::Conn {
            shared.open_virtual(&link, &msg);
            continue;
        }
        if let Some(id) = msg.virtual_id().map(str::to_string) {
            shared.route_virtual(&link, &id, msg).await;
            continue;
        }
        core.accept_message(msg, Some(source.clone()));
    }

    let dependents: Vec<Connection> = link.virtuals.lock().drain().map(|(_, c)| c).collect();
    for connection in dependents {
        connection.close_connection();
    }
    shared.evict(&link);
    debug!(network = %core.name(), url = %link.url, "physical link closed");
}

pub struct BluetoothTransport {
    shared: Arc<Shared>,
    timers: Arc<TimerService>,
    sweep_period: Duration,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    sweep: Mutex<Option<TimerHandle>>,
}

impl BluetoothTransport {
    pub fn new(
        core: Arc<NetworkCore>,
        dialer: Arc<dyn StreamDialer>,
        timers: Arc<TimerService>,
        timings: &ProtocolTimings,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                core,
                dialer,
                links: Mutex::new(HashMap::new()),
                idle_threshold: timings.idle_threshold(),
            }),
            timers,
            sweep_period: timings.idle_sweep_period(),
            tasks: Mutex::new(Vec::new()),
            sweep: Mutex::new(None),
        }
    }

    pub async fn start(&self) -> Result<(), RoutingError> {
        let core = &self.shared.core;
        let mut incoming = self
            .shared
            .dialer
            .listen(&core.config().local, &core.config().service_name)
            .await?;

        let shared = self.shared.clone();
        let accept = tokio::spawn(async move {
            while let Some(stream) = incoming.recv().await {
                tokio::spawn(shared.clone().accept_link(stream));
            }
        });
        self.tasks.lock().push(accept);

        let weak = Arc::downgrade(&self.shared);
        let handle = self.timers.register(
            Arc::new(move |_: &str, _: Option<&str>| match weak.upgrade() {
                Some(shared) => {
                    shared.sweep();
                    true
                }
                None => false,
            }),
            self.sweep_period,
            format!("idle-sweep:{}", core.name()),
            None,
        );
        *self.sweep.lock() = Some(handle);
        Ok(())
    }

    fn resolve(&self, target: &Target) -> Result<String, RoutingError> {
        match target {
            Target::Address(address) => Ok(address.url.clone()),
            Target::Node(id) => self
                .shared
                .core
                .neighbors()
                .address_of(id)
                .map(|address| address.url)
                .ok_or_else(|| RoutingError::HostUnreachable(id.clone())),
        }
    }

    async fn send_to_url(&self, url: &str, mut msg: Message) -> Result<(), RoutingError> {
        let link = self.shared.link_for(url).await?;
        msg.remove_attribute(attr::VIRTUAL);
        if let Err(err) = link.physical.send(msg).await {
            self.shared.evict(&link);
            return Err(err.into());
        }
        Ok(())
    }

    pub async fn send_unicast(&self, msg: Message, target: Target) -> Result<(), RoutingError> {
        let url = self.resolve(&target)?;
        self.send_to_url(&url, msg).await
    }

    /// Iterated unicast. A slow or failing peer never stops the others.
    pub async fn send_multicast(&self, msg: Message) -> Result<(), RoutingError> {
        let core = &self.shared.core;
        let discovered = match self.shared.dialer.discover(&core.config().service_name).await {
            Ok(urls) => urls,
            Err(err) => {
                warn!(network = %core.name(), error = %err, "peer discovery failed");
                Vec::new()
            }
        };

        let mut seen = BTreeSet::new();
        let mut urls = Vec::new();
        let cached: Vec<String> = self.shared.links.lock().keys().cloned().collect();
        let known = core.neighbors().addresses().into_iter().map(|a| a.url);
        for url in discovered.into_iter().chain(cached).chain(known) {
            let key = normalize_url(&url).to_string();
            if !self.shared.is_local(&key) && seen.insert(key) {
                urls.push(url);
            }
        }

        let sends = urls.into_iter().map(|url| {
            let msg = msg.clone();
            async move {
                let result = tokio::time::timeout(PEER_SEND_TIMEOUT, self.send_to_url(&url, msg)).await;
                (url, result)
            }
        });
        for (url, result) in join_all(sends).await {
            match result {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    warn!(network = %core.name(), %url, error = %err, "multicast to peer failed")
                }
                Err(_) => warn!(network = %core.name(), %url, "multicast to peer timed out"),
            }
        }
        Ok(())
    }

    /// Open a virtual connection over the (possibly new) link to the target
    pub async fn get_connection(
        &self,
        conn_type: ConnectionType,
        from: &str,
        to: &str,
        target: Target,
    ) -> Result<Connection, RoutingError> {
        let url = self.resolve(&target)?;
        let link = self.shared.link_for(&url).await?;
        let core = &self.shared.core;
        let id = Uuid::new_v4().to_string();
        let connection = Connection::virtual_over(
            &link.physical,
            id.clone(),
            from,
            to,
            conn_type,
            core.limits().queue_capacity,
        );
        link.register(&id, &connection);

        if let Err(err) = link
            .physical
            .send(core.handshake(conn_type, from, to, Some(&id)))
            .await
        {
            connection.close_connection();
            return Err(err.into());
        }
        debug!(network = %core.name(), url = %link.url, virtual_id = %id, %conn_type, "virtual connection opened");
        Ok(connection)
    }

    pub async fn get_raw_stream(&self, address: &Address) -> Result<RawStreamPair, RoutingError> {
        self.shared
            .dialer
            .dial(&address.url)
            .await
            .map_err(|e| RoutingError::HostUnreachable(format!("{}: {}", address.url, e)))
    }

    /// Close idle and dead links now
    pub fn sweep_idle(&self) {
        self.shared.sweep();
    }

    pub fn link_count(&self) -> usize {
        self.shared.links.lock().len()
    }

    /// The cached physical connection to `url`, if any
    pub fn physical_for(&self, url: &str) -> Option<Connection> {
        self.shared
            .cached(normalize_url(url))
            .map(|link| link.physical.clone())
    }

    pub fn virtual_count(&self, url: &str) -> usize {
        self.shared
            .cached(normalize_url(url))
            .map(|link| link.virtuals.lock().len())
            .unwrap_or(0)
    }

    pub async fn shutdown(&self) {
        if let Some(handle) = self.sweep.lock().take() {
            handle.cancel();
        }
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        let links: Vec<Arc<PeerLink>> = self.shared.links.lock().drain().map(|(_, l)| l).collect();
        for link in links {
            let _ = link.physical.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Limits, NetworkConfig};
    use crate::message::Codec;
    use crate::transport::abstraction::TransportKind;
    use crate::transport::manager::InboundSink;
    use crate::transport::memory::MemoryHub;

    struct Channel {
        messages: mpsc::UnboundedSender<Message>,
        connections: mpsc::UnboundedSender<Connection>,
    }

    impl InboundSink for Channel {
        fn deliver_message(&self, msg: Message, _network: &str) {
            let _ = self.messages.send(msg);
        }

        fn deliver_connection(&self, connection: Connection, _network: &str) {
            let _ = self.connections.send(connection);
        }
    }

    struct Node {
        transport: BluetoothTransport,
        core: Arc<NetworkCore>,
        _sink: Arc<dyn InboundSink>,
        messages: mpsc::UnboundedReceiver<Message>,
        connections: mpsc::UnboundedReceiver<Connection>,
    }

    async fn node(hub: &Arc<MemoryHub>, id: &str, timings: &ProtocolTimings) -> Node {
        let config = NetworkConfig {
            name: "bluetooth".into(),
            kind: TransportKind::Bluetooth,
            local: Address::new(format!("mem://{}", id), 0, "bluetooth"),
            multicast: None,
            service_name: "msd".into(),
        };
        let core = Arc::new(NetworkCore::new(config, id, Limits::default(), Codec::new()));
        let (mtx, messages) = mpsc::unbounded_channel();
        let (ctx, connections) = mpsc::unbounded_channel();
        let sink: Arc<dyn InboundSink> = Arc::new(Channel {
            messages: mtx,
            connections: ctx,
        });
        core.set_inbound(Arc::downgrade(&sink));
        let transport = BluetoothTransport::new(
            core.clone(),
            hub.clone(),
            Arc::new(TimerService::new()),
            timings,
        );
        transport.start().await.unwrap();
        Node {
            transport,
            core,
            _sink: sink,
            messages,
            connections,
        }
    }

    #[tokio::test]
    async fn test_unicast_reuses_physical_link() {
        let hub = Arc::new(MemoryHub::new());
        let timings = ProtocolTimings::default();
        let a = node(&hub, "a", &timings).await;
        let mut b = node(&hub, "b", &timings).await;
        let target = Target::Address(Address::new("mem://b", 0, "bluetooth"));

        for _ in 0..3 {
            let msg = Message::addressed(MessageType::IAmHere, "a", Some("b"));
            a.transport.send_unicast(msg, target.clone()).await.unwrap();
        }
        for _ in 0..3 {
            assert_eq!(b.messages.recv().await.unwrap().message_type(), MessageType::IAmHere);
        }
        assert_eq!(hub.dial_count(), 1);
        assert_eq!(a.transport.link_count(), 1);
        // b learned a's callback url from the link setup
        assert_eq!(
            b.core.neighbors().address_of("a").map(|addr| addr.url),
            Some("mem://a".to_string())
        );
    }

    #[tokio::test]
    async fn test_reply_over_accepted_link() {
        let hub = Arc::new(MemoryHub::new());
        let timings = ProtocolTimings::default();
        let mut a = node(&hub, "a", &timings).await;
        let mut b = node(&hub, "b", &timings).await;

        let msg = Message::addressed(MessageType::MainRequest, "a", None);
        a.transport
            .send_unicast(msg, Target::Address(Address::new("mem://b", 0, "bluetooth")))
            .await
            .unwrap();
        b.messages.recv().await.unwrap();

        let reply = Message::addressed(MessageType::MainReply, "b", Some("a"));
        b.transport
            .send_unicast(reply, Target::Node("a".into()))
            .await
            .unwrap();
        assert_eq!(a.messages.recv().await.unwrap().message_type(), MessageType::MainReply);
        assert_eq!(hub.dial_count(), 1);
    }

    #[tokio::test]
    async fn test_multicast_skips_unreachable_peers() {
        let hub = Arc::new(MemoryHub::new());
        let timings = ProtocolTimings::default();
        let a = node(&hub, "a", &timings).await;
        let mut b = node(&hub, "b", &timings).await;
        let mut c = node(&hub, "c", &timings).await;
        hub.advertise("mem://ghost", "msd");

        let msg = Message::addressed(MessageType::MainRequest, "a", None);
        a.transport.send_multicast(msg).await.unwrap();
        assert_eq!(b.messages.recv().await.unwrap().from_id(), Some("a"));
        assert_eq!(c.messages.recv().await.unwrap().from_id(), Some("a"));
    }

    #[tokio::test]
    async fn test_virtual_connections_share_link() {
        let hub = Arc::new(MemoryHub::new());
        let timings = ProtocolTimings::default();
        let a = node(&hub, "a", &timings).await;
        let mut b = node(&hub, "b", &timings).await;
        let target = Target::Address(Address::new("mem://b", 0, "bluetooth"));

        let first = a
            .transport
            .get_connection(ConnectionType::Get, "a", "b", target.clone())
            .await
            .unwrap();
        let second = a
            .transport
            .get_connection(ConnectionType::Use, "a", "b", target)
            .await
            .unwrap();
        assert_ne!(first.virtual_id(), second.virtual_id());
        assert!(first.parent().unwrap().same_as(second.parent().unwrap()));

        let accepted_first = b.connections.recv().await.unwrap();
        let accepted_second = b.connections.recv().await.unwrap();
        assert_eq!(accepted_first.virtual_id(), first.virtual_id());
        assert_eq!(accepted_second.connection_type(), ConnectionType::Use);

        second.send(Message::data(b"two".to_vec())).await.unwrap();
        assert_eq!(accepted_second.receive().await.unwrap().unwrap().payload(), b"two");

        first.close().await.unwrap();
        assert_eq!(accepted_first.receive().await, Ok(None));
        assert!(!second.is_closed());
        assert!(!first.parent().unwrap().is_closed());

        accepted_second
            .send(Message::data(b"back".to_vec()))
            .await
            .unwrap();
        assert_eq!(second.receive().await.unwrap().unwrap().payload(), b"back");
        assert_eq!(hub.dial_count(), 1);
    }

    #[tokio::test]
    async fn test_link_close_closes_virtuals() {
        let hub = Arc::new(MemoryHub::new());
        let timings = ProtocolTimings::default();
        let a = node(&hub, "a", &timings).await;
        let mut b = node(&hub, "b", &timings).await;
        let target = Target::Address(Address::new("mem://b", 0, "bluetooth"));

        let conn = a
            .transport
            .get_connection(ConnectionType::Update, "a", "b", target)
            .await
            .unwrap();
        let accepted = b.connections.recv().await.unwrap();

        conn.parent().unwrap().close().await.unwrap();
        assert_eq!(accepted.receive().await, Ok(None));
        conn.closed().await;
        assert_eq!(a.transport.link_count(), 0);
    }

    #[tokio::test]
    async fn test_sweep_evicts_idle_links() {
        let hub = Arc::new(MemoryHub::new());
        let timings = ProtocolTimings {
            idle_threshold_ms: 0,
            ..ProtocolTimings::default()
        };
        let a = node(&hub, "a", &timings).await;
        let mut b = node(&hub, "b", &timings).await;
        let msg = Message::addressed(MessageType::IAmHere, "a", Some("b"));
        a.transport
            .send_unicast(msg, Target::Address(Address::new("mem://b", 0, "bluetooth")))
            .await
            .unwrap();
        b.messages.recv().await.unwrap();
        let physical = a.transport.physical_for("mem://b").unwrap();

        tokio::time::sleep(Duration::from_millis(5)).await;
        a.transport.sweep_idle();
        assert_eq!(a.transport.link_count(), 0);
        physical.closed().await;
    }
}
