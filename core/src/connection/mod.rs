//! Connections — ordered, bidirectional message channels between two MSDs
//!
//! A `Connection` is a cheap, cloneable handle. Every variant shares one state
//! machine (open → closed, listeners, idle tracking); only the delivery
//! strategy differs:
//!
//! - **Physical**: frames messages onto a raw byte stream via the codec.
//! - **Virtual**: tags messages with a `virtual` id and sends them through a
//!   parent physical connection; inbound traffic is demultiplexed by the
//!   transport into a bounded inbox.
//! - **Local**: two in-process ends, each sending into the other's inbox.
//!
//! `from` is the node that opened the connection and `to` its destination, on
//! both ends.

pub mod bridge;
pub mod events;
pub mod inbox;
mod link;

pub use bridge::{connect, connection_to_streams};
pub use events::{ConnectionEvent, ConnectionListener, ListenerId};
pub use inbox::Inbox;
pub use link::LinkKind;

use futures::future::{BoxFuture, FutureExt};
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::BufReader;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::{ConnErr, ProtocolError};
use crate::message::{Codec, ConnectionType, Message, MessageType};
use crate::transport::abstraction::{Address, RawReader, RawStreamPair, RawWriter};
use events::{Dispatch, EventJob};
use link::{LocalLink, Link, PhysicalLink, VirtualLink};

/// Network name carried by loopback connections
pub const LOCAL_NETWORK: &str = "local";

static NEXT_SERIAL: AtomicU64 = AtomicU64::new(1);
static NEXT_LISTENER: AtomicU64 = AtomicU64::new(1);

type CloseHook = Box<dyn FnOnce() + Send>;

struct Inner {
    serial: u64,
    from: String,
    to: String,
    conn_type: ConnectionType,
    network: String,
    link: Link,
    closed: watch::Sender<bool>,
    close_sent: AtomicBool,
    end_reported: AtomicBool,
    last_activity: Mutex<Instant>,
    listeners: Mutex<Vec<(ListenerId, Arc<dyn ConnectionListener>)>>,
    dispatch: Mutex<Dispatch>,
    close_hooks: Mutex<Vec<CloseHook>>,
}

#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

impl Connection {
    fn build(
        from: String,
        to: String,
        conn_type: ConnectionType,
        network: String,
        link: Link,
    ) -> Self {
        let (closed, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                serial: NEXT_SERIAL.fetch_add(1, Ordering::Relaxed),
                from,
                to,
                conn_type,
                network,
                link,
                closed,
                close_sent: AtomicBool::new(false),
                end_reported: AtomicBool::new(false),
                last_activity: Mutex::new(Instant::now()),
                listeners: Mutex::new(Vec::new()),
                dispatch: Mutex::new(Dispatch::Idle),
                close_hooks: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Wrap a raw transport stream
    pub fn physical(
        from: impl Into<String>,
        to: impl Into<String>,
        conn_type: ConnectionType,
        network: impl Into<String>,
        stream: RawStreamPair,
        codec: Codec,
    ) -> Self {
        let RawStreamPair {
            reader,
            writer,
            peer,
        } = stream;
        Self::physical_buffered(
            from,
            to,
            conn_type,
            network,
            BufReader::new(reader),
            writer,
            peer,
            codec,
        )
    }

    /// Wrap a stream whose reader already holds buffered bytes, e.g. after
    /// the transport consumed the CONN handshake from it
    #[allow(clippy::too_many_arguments)]
    pub fn physical_buffered(
        from: impl Into<String>,
        to: impl Into<String>,
        conn_type: ConnectionType,
        network: impl Into<String>,
        reader: BufReader<RawReader>,
        writer: RawWriter,
        peer: Option<Address>,
        codec: Codec,
    ) -> Self {
        let link = Link::Physical(PhysicalLink::new(reader, writer, peer, codec));
        Self::build(from.into(), to.into(), conn_type, network.into(), link)
    }

    /// Logical channel over `parent`. The transport feeds inbound traffic
    /// tagged with `id` through [`Connection::deliver`].
    pub fn virtual_over(
        parent: &Connection,
        id: impl Into<String>,
        from: impl Into<String>,
        to: impl Into<String>,
        conn_type: ConnectionType,
        capacity: usize,
    ) -> Self {
        let link = Link::Virtual(VirtualLink {
            parent: parent.clone(),
            id: id.into(),
            inbox: Inbox::new(capacity),
        });
        let network = parent.network().to_string();
        Self::build(from.into(), to.into(), conn_type, network, link)
    }

    /// Loopback pair. The first end belongs to the opener, the second is
    /// handed to local dispatch.
    pub fn local_pair(
        from: impl Into<String>,
        to: impl Into<String>,
        conn_type: ConnectionType,
        capacity: usize,
    ) -> (Self, Self) {
        let (from, to) = (from.into(), to.into());
        let opener_inbox = Arc::new(Inbox::new(capacity));
        let acceptor_inbox = Arc::new(Inbox::new(capacity));
        let opener = Self::build(
            from.clone(),
            to.clone(),
            conn_type,
            LOCAL_NETWORK.to_string(),
            Link::Local(LocalLink {
                inbox: opener_inbox.clone(),
                peer: acceptor_inbox.clone(),
            }),
        );
        let acceptor = Self::build(
            from,
            to,
            conn_type,
            LOCAL_NETWORK.to_string(),
            Link::Local(LocalLink {
                inbox: acceptor_inbox,
                peer: opener_inbox,
            }),
        );
        (opener, acceptor)
    }

    pub fn serial(&self) -> u64 {
        self.inner.serial
    }

    pub fn from(&self) -> &str {
        &self.inner.from
    }

    pub fn to(&self) -> &str {
        &self.inner.to
    }

    pub fn connection_type(&self) -> ConnectionType {
        self.inner.conn_type
    }

    /// Name of the owning network manager
    pub fn network(&self) -> &str {
        &self.inner.network
    }

    pub fn kind(&self) -> LinkKind {
        self.inner.link.kind()
    }

    pub fn virtual_id(&self) -> Option<&str> {
        match &self.inner.link {
            Link::Virtual(link) => Some(&link.id),
            _ => None,
        }
    }

    pub fn parent(&self) -> Option<&Connection> {
        match &self.inner.link {
            Link::Virtual(link) => Some(&link.parent),
            _ => None,
        }
    }

    /// Remote end of a physical stream, when the transport knows it
    pub fn peer_address(&self) -> Option<&Address> {
        match &self.inner.link {
            Link::Physical(link) => link.peer.as_ref(),
            _ => None,
        }
    }

    pub fn is_closed(&self) -> bool {
        *self.inner.closed.borrow()
    }

    /// Resolves once the connection is closed
    pub async fn closed(&self) {
        let mut rx = self.inner.closed.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    pub fn same_as(&self, other: &Connection) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    fn touch(&self) {
        *self.inner.last_activity.lock() = Instant::now();
    }

    pub fn idle(&self) -> Duration {
        self.inner.last_activity.lock().elapsed()
    }

    pub fn idle_seconds(&self) -> i64 {
        self.idle().as_secs() as i64
    }

    pub fn add_listener(&self, listener: Arc<dyn ConnectionListener>) -> ListenerId {
        let id = ListenerId(NEXT_LISTENER.fetch_add(1, Ordering::Relaxed));
        if !self.is_closed() {
            self.inner.listeners.lock().push((id, listener));
        }
        id
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut listeners = self.inner.listeners.lock();
        let before = listeners.len();
        listeners.retain(|(existing, _)| *existing != id);
        listeners.len() != before
    }

    pub fn listener_count(&self) -> usize {
        self.inner.listeners.lock().len()
    }

    /// Run `hook` once when the connection closes (immediately if it already is)
    pub fn on_close(&self, hook: impl FnOnce() + Send + 'static) {
        {
            let mut hooks = self.inner.close_hooks.lock();
            if !self.is_closed() {
                hooks.push(Box::new(hook));
                return;
            }
        }
        hook();
    }

    fn emit(&self, event: ConnectionEvent) {
        let listeners: Vec<_> = self
            .inner
            .listeners
            .lock()
            .iter()
            .map(|(_, listener)| listener.clone())
            .collect();
        if listeners.is_empty() {
            return;
        }
        self.inner.dispatch.lock().submit(EventJob {
            connection: self.clone(),
            listeners,
            event,
        });
    }

    /// `send` behind a box, for the virtual-to-parent hop
    fn send_boxed(&self, msg: Message) -> BoxFuture<'_, Result<(), ConnErr>> {
        self.send(msg).boxed()
    }

    pub async fn send(&self, msg: Message) -> Result<(), ConnErr> {
        if self.is_closed() {
            return Err(ConnErr::Closed);
        }
        self.touch();

        let sent = match &self.inner.link {
            Link::Physical(link) => {
                if let Err(err) = link.write(&msg).await {
                    if matches!(err, ConnErr::Io(_)) {
                        warn!(connection = self.serial(), error = %err, "write failed, closing");
                        self.close_connection();
                    }
                    return Err(err);
                }
                msg
            }
            Link::Virtual(link) => {
                let mut msg = msg;
                msg.set_virtual_id(&link.id);
                link.parent.send_boxed(msg.clone()).await?;
                msg
            }
            Link::Local(link) => {
                link.peer.push(msg.clone())?;
                msg
            }
        };

        self.emit(ConnectionEvent::Sent(sent));
        Ok(())
    }

    /// Wait for the next message. `Ok(None)` is returned exactly once, when
    /// the peer closed or this end was closed; later calls fail with `Closed`.
    pub async fn receive(&self) -> Result<Option<Message>, ConnErr> {
        let next = match &self.inner.link {
            Link::Physical(link) => {
                if self.is_closed() {
                    return self.report_end();
                }
                let mut closed = self.inner.closed.subscribe();
                tokio::select! {
                    read = link.read() => match read {
                        Ok(msg) if is_close_notice(&msg) => None,
                        Ok(msg) => Some(msg),
                        Err(ConnErr::Closed)
                        | Err(ConnErr::Protocol(ProtocolError::EndOfStream)) => None,
                        Err(err) => {
                            warn!(connection = self.serial(), error = %err, "read failed, closing");
                            self.close_connection();
                            return Err(err);
                        }
                    },
                    _ = closed.wait_for(|closed| *closed) => None,
                }
            }
            Link::Virtual(link) => link.inbox.pop().await,
            Link::Local(link) => link.inbox.pop().await,
        };

        match next {
            None => {
                self.close_connection();
                self.report_end()
            }
            Some(msg) => {
                self.touch();
                let event = if msg.message_type() == MessageType::Error {
                    ConnectionEvent::Error(msg.clone())
                } else {
                    ConnectionEvent::Received(msg.clone())
                };
                self.emit(event);
                Ok(Some(msg))
            }
        }
    }

    fn report_end(&self) -> Result<Option<Message>, ConnErr> {
        if self.inner.end_reported.swap(true, Ordering::SeqCst) {
            Err(ConnErr::Closed)
        } else {
            Ok(None)
        }
    }

    /// Notify the peer (best effort) and tear down locally
    pub async fn close(&self) -> Result<(), ConnErr> {
        if self.is_closed() || self.inner.close_sent.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let notice = match &self.inner.link {
            Link::Physical(link) => link.write(&Message::close()).await,
            Link::Virtual(link) => {
                let mut msg = Message::close();
                msg.set_virtual_id(&link.id);
                link.parent.send(msg).await
            }
            Link::Local(link) => {
                link.peer.close();
                Ok(())
            }
        };
        if let Err(err) = notice {
            debug!(connection = self.serial(), error = %err, "peer not notified of close");
        }

        self.close_connection();
        Ok(())
    }

    /// Unconditional local teardown: release the transport, mark closed,
    /// fire CLOSED once and drop every listener
    pub fn close_connection(&self) {
        if self.inner.closed.send_replace(true) {
            return;
        }

        match &self.inner.link {
            Link::Physical(_) => {
                if let Ok(runtime) = tokio::runtime::Handle::try_current() {
                    let conn = self.clone();
                    runtime.spawn(async move {
                        if let Link::Physical(link) = &conn.inner.link {
                            link.release().await;
                        }
                    });
                }
            }
            Link::Virtual(link) => {
                link.inbox.close();
            }
            Link::Local(link) => {
                link.inbox.close();
            }
        }

        let hooks = std::mem::take(&mut *self.inner.close_hooks.lock());
        for hook in hooks {
            hook();
        }

        let listeners = std::mem::take(&mut *self.inner.listeners.lock());
        let job = (!listeners.is_empty()).then(|| EventJob {
            connection: self.clone(),
            listeners: listeners.into_iter().map(|(_, listener)| listener).collect(),
            event: ConnectionEvent::Closed,
        });
        self.inner.dispatch.lock().finish(job);

        debug!(
            connection = self.serial(),
            network = %self.network(),
            from = %self.from(),
            to = %self.to(),
            "connection closed"
        );
    }

    /// Queue an inbound message on a virtual connection
    pub(crate) fn deliver(&self, msg: Message) -> Result<(), ConnErr> {
        match &self.inner.link {
            Link::Virtual(link) => link.inbox.push(msg),
            _ => Err(ConnErr::Closed),
        }
    }

    /// The remote end closed a virtual connection. Queued messages are still
    /// readable before `receive` reports the end.
    pub(crate) fn peer_closed(&self) {
        match &self.inner.link {
            Link::Virtual(link) => {
                link.inbox.close();
            }
            _ => self.close_connection(),
        }
    }

    /// Drain the connection in the background so listeners see its traffic
    pub fn spawn_reader(&self) -> JoinHandle<()> {
        let conn = self.clone();
        tokio::spawn(async move {
            loop {
                match conn.receive().await {
                    Ok(Some(_)) => continue,
                    Ok(None) => break,
                    Err(err) => {
                        debug!(connection = conn.serial(), error = %err, "reader stopped");
                        break;
                    }
                }
            }
        })
    }
}

fn is_close_notice(msg: &Message) -> bool {
    msg.message_type() == MessageType::Close && msg.virtual_id().is_none()
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("serial", &self.inner.serial)
            .field("kind", &self.kind())
            .field("from", &self.inner.from)
            .field("to", &self.inner.to)
            .field("type", &self.inner.conn_type)
            .field("network", &self.inner.network)
            .field("virtual", &self.virtual_id())
            .field("closed", &self.is_closed())
            .finish()
    }
}
