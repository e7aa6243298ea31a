// Internet transport — IP multicast discovery, UDP datagrams, TCP connections
//
// Listeners:
// - one TCP accept loop on the local address
// - one UDP socket on the same port, used both to receive unicast datagrams
//   and as the source of every datagram we send (so replies come back to it)
// - one UDP socket joined to the multicast group

use parking_lot::{Mutex, RwLock};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tokio::io::BufReader;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::abstraction::{Address, RawReader, RawStreamPair};
use super::manager::{parse_handshake, NetworkCore, Target};
use crate::connection::Connection;
use crate::error::{ProtocolError, RoutingError};
use crate::message::{ConnectionType, Message, MessageType};

/// Streams and connections that outlive the listener tasks
#[derive(Default)]
struct Live {
    streams: Mutex<Vec<JoinHandle<()>>>,
    connections: Mutex<Vec<Connection>>,
}

impl Live {
    fn track_stream(&self, task: JoinHandle<()>) {
        let mut streams = self.streams.lock();
        streams.retain(|t| !t.is_finished());
        streams.push(task);
    }

    fn track(&self, connection: &Connection) {
        let mut connections = self.connections.lock();
        connections.retain(|c| !c.is_closed());
        connections.push(connection.clone());
    }

    fn open_connections(&self) -> usize {
        self.connections.lock().iter().filter(|c| !c.is_closed()).count()
    }
}

pub struct InternetTransport {
    core: Arc<NetworkCore>,
    unicast: RwLock<Option<Arc<UdpSocket>>>,
    bound: RwLock<Option<SocketAddr>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    live: Arc<Live>,
}

impl InternetTransport {
    pub fn new(core: Arc<NetworkCore>) -> Self {
        Self {
            core,
            unicast: RwLock::new(None),
            bound: RwLock::new(None),
            tasks: Mutex::new(Vec::new()),
            live: Arc::new(Live::default()),
        }
    }

    /// Connections opened or accepted that are still open
    pub fn open_connections(&self) -> usize {
        self.live.open_connections()
    }

    pub fn local_address(&self) -> Address {
        match *self.bound.read() {
            Some(addr) => Address::from_socket_addr(addr, self.core.name()),
            None => self.core.config().local.clone(),
        }
    }

    pub async fn start(&self) -> Result<(), RoutingError> {
        let local = self.core.config().local.socket_addr()?;
        let listener = TcpListener::bind(local).await?;
        let bound = listener.local_addr()?;
        let unicast = Arc::new(UdpSocket::bind(bound).await?);
        if bound.is_ipv4() {
            let _ = unicast.set_multicast_loop_v4(true);
        }

        let mut tasks = Vec::new();
        tasks.push(tokio::spawn(accept_loop(self.core.clone(), listener, self.live.clone())));
        tasks.push(tokio::spawn(datagram_loop(self.core.clone(), unicast.clone())));

        if let Some(group) = &self.core.config().multicast {
            match join_group(group, bound).await {
                Ok(socket) => {
                    tasks.push(tokio::spawn(datagram_loop(self.core.clone(), Arc::new(socket))));
                }
                Err(err) => {
                    warn!(network = %self.core.name(), group = %group, error = %err, "multicast unavailable, listening on unicast only");
                }
            }
        }

        *self.unicast.write() = Some(unicast);
        *self.bound.write() = Some(bound);
        self.tasks.lock().extend(tasks);
        info!(network = %self.core.name(), %bound, "internet transport listening");
        Ok(())
    }

    fn socket(&self) -> Result<Arc<UdpSocket>, RoutingError> {
        self.unicast
            .read()
            .clone()
            .ok_or_else(|| RoutingError::Io(format!("network {} not started", self.core.name())))
    }

    fn resolve(&self, target: &Target) -> Result<SocketAddr, RoutingError> {
        match target {
            Target::Address(address) => address.socket_addr(),
            Target::Node(id) => self
                .core
                .neighbors()
                .address_of(id)
                .ok_or_else(|| RoutingError::HostUnreachable(id.clone()))?
                .socket_addr(),
        }
    }

    /// Encode and enforce the datagram ceiling
    fn frame(&self, msg: &Message) -> Result<Vec<u8>, RoutingError> {
        let frame = self.core.codec().encode(msg)?;
        let limit = self.core.limits().max_datagram;
        if frame.len() > limit {
            return Err(RoutingError::MessageTooLarge {
                size: frame.len(),
                limit,
            });
        }
        Ok(frame)
    }

    pub async fn send_unicast(&self, msg: Message, target: Target) -> Result<(), RoutingError> {
        let frame = self.frame(&msg)?;
        let addr = self.resolve(&target)?;
        self.socket()?.send_to(&frame, addr).await?;
        debug!(network = %self.core.name(), %addr, "{}", msg);
        Ok(())
    }

    pub async fn send_multicast(&self, msg: Message) -> Result<(), RoutingError> {
        let group = self
            .core
            .config()
            .multicast
            .as_ref()
            .ok_or_else(|| RoutingError::HostUnreachable("no multicast group".into()))?
            .socket_addr()?;
        let frame = self.frame(&msg)?;
        self.socket()?.send_to(&frame, group).await?;
        debug!(network = %self.core.name(), %group, "multicast {}", msg);
        Ok(())
    }

    pub async fn get_raw_stream(&self, address: &Address) -> Result<RawStreamPair, RoutingError> {
        let addr = address.socket_addr()?;
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| RoutingError::HostUnreachable(format!("{}: {}", addr, e)))?;
        let (read, write) = stream.into_split();
        Ok(RawStreamPair::new(Box::new(read), Box::new(write)).with_peer(address.clone()))
    }

    /// Open a fresh TCP connection and send the CONN handshake on it
    pub async fn get_connection(
        &self,
        conn_type: ConnectionType,
        from: &str,
        to: &str,
        target: Target,
    ) -> Result<Connection, RoutingError> {
        let addr = self.resolve(&target)?;
        let stream = self
            .get_raw_stream(&Address::from_socket_addr(addr, self.core.name()))
            .await?;
        let connection = Connection::physical(
            from,
            to,
            conn_type,
            self.core.name(),
            stream,
            self.core.codec().clone(),
        );
        connection
            .send(self.core.handshake(conn_type, from, to, None))
            .await?;
        self.live.track(&connection);
        debug!(network = %self.core.name(), %addr, %conn_type, "connection opened");
        Ok(connection)
    }

    pub async fn shutdown(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        for task in self.live.streams.lock().drain(..) {
            task.abort();
        }
        self.unicast.write().take();
        let connections: Vec<Connection> = self.live.connections.lock().drain(..).collect();
        for connection in connections {
            let _ = connection.close().await;
        }
    }
}

async fn join_group(group: &Address, bound: SocketAddr) -> std::io::Result<UdpSocket> {
    let group = group
        .socket_addr()
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e.to_string()))?;
    match group.ip() {
        IpAddr::V4(ip) => {
            let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, group.port())).await?;
            let interface = match bound.ip() {
                IpAddr::V4(local) if !local.is_loopback() => local,
                _ => Ipv4Addr::UNSPECIFIED,
            };
            socket.join_multicast_v4(ip, interface)?;
            Ok(socket)
        }
        IpAddr::V6(ip) => {
            let socket = UdpSocket::bind((std::net::Ipv6Addr::UNSPECIFIED, group.port())).await?;
            socket.join_multicast_v6(&ip, 0)?;
            Ok(socket)
        }
    }
}

async fn datagram_loop(core: Arc<NetworkCore>, socket: Arc<UdpSocket>) {
    let mut buf = vec![0u8; core.limits().max_datagram];
    loop {
        let (n, src) = match socket.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(err) => {
                debug!(network = %core.name(), error = %err, "datagram receive failed");
                continue;
            }
        };
        let msg = match core.codec().decode(&buf[..n]) {
            Ok(msg) => msg,
            Err(err) => {
                debug!(network = %core.name(), %src, error = %err, "undecodable datagram");
                continue;
            }
        };
        if msg.from_id() == Some(core.node_id()) {
            continue;
        }
        if msg.message_type() == MessageType::Conn {
            debug!(network = %core.name(), %src, "CONN over datagram ignored");
            continue;
        }
        core.accept_message(msg, Some(Address::from_socket_addr(src, core.name())));
    }
}

async fn accept_loop(core: Arc<NetworkCore>, listener: TcpListener, live: Arc<Live>) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                let task = tokio::spawn(serve_stream(core.clone(), stream, peer, live.clone()));
                live.track_stream(task);
            }
            Err(err) => {
                warn!(network = %core.name(), error = %err, "accept failed");
            }
        }
    }
}

/// Read plain messages off an accepted stream until it either ends or turns
/// into a connection through a CONN handshake
async fn serve_stream(core: Arc<NetworkCore>, stream: TcpStream, peer: SocketAddr, live: Arc<Live>) {
    let (read, write) = stream.into_split();
    let mut reader = BufReader::new(Box::new(read) as RawReader);
    loop {
        let msg = match core.codec().read_message(&mut reader).await {
            Ok(msg) => msg,
            Err(ProtocolError::EndOfStream) => return,
            Err(err) => {
                debug!(network = %core.name(), %peer, error = %err, "dropping stream");
                return;
            }
        };

        if msg.message_type() != MessageType::Conn {
            // the source port of a stream is ephemeral, not an address to reply to
            core.accept_message(msg, None);
            continue;
        }

        let Some((conn_type, _)) = parse_handshake(&msg) else {
            warn!(network = %core.name(), %peer, "malformed CONN handshake");
            return;
        };
        let from = msg.from_id().unwrap_or_default().to_string();
        let to = msg.to_id().unwrap_or(core.node_id()).to_string();
        let connection = Connection::physical_buffered(
            from,
            to,
            conn_type,
            core.name(),
            reader,
            Box::new(write),
            Some(Address::from_socket_addr(peer, core.name())),
            core.codec().clone(),
        );
        debug!(network = %core.name(), %peer, %conn_type, "connection accepted");
        live.track(&connection);
        core.accept_connection(connection, None);
        return;
    }
}
