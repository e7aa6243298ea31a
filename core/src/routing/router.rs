//! Router manager — next-hop resolution, forwarding and local delivery
//!
//! Decision algorithm for every message:
//! 1. **Hop budget**: exhausted messages are dropped silently
//! 2. **Local**: no destination, our id or the `"0"` sentinel → local dispatch
//! 3. **Multicast**: locally originated only, fanned out on every network
//! 4. **Unicast**: destination seen directly, else through its cached gateway
//!
//! Messages and connections arriving from a network are handed to the task
//! pool so the transport's receive loop never waits on routing.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::sync::{Arc, Weak};
use tracing::{debug, warn};

use crate::cache::ServiceCache;
use crate::connection::{connect, Connection};
use crate::error::RoutingError;
use crate::message::{ConnectionType, Message, LOCAL_SENTINEL};
use crate::timer::TaskPool;
use crate::transport::{InboundSink, NetworkManager, Target};

/// The node's own message and connection handling
#[async_trait]
pub trait LocalDispatch: Send + Sync {
    async fn dispatch_message(&self, msg: Message, network: Option<String>);
    async fn dispatch_connection(&self, connection: Connection, network: Option<String>);
}

/// Why a message was not delivered anywhere
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DropReason {
    HopsExhausted,
    NoRoute(String),
    SendFailed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteOutcome {
    /// Handed to local dispatch only
    Delivered,
    /// Sent on towards its destination (or fanned out)
    Forwarded,
    Dropped(DropReason),
}

/// Where to send something next
#[derive(Debug, Clone)]
pub struct NextHop {
    pub network: Arc<NetworkManager>,
    /// Node to hand it to: the destination itself or its gateway
    pub gateway: String,
}

pub struct RouterManager {
    node_id: String,
    networks: Vec<Arc<NetworkManager>>,
    cache: Arc<ServiceCache>,
    pool: TaskPool,
    queue_capacity: usize,
    local: RwLock<Option<Weak<dyn LocalDispatch>>>,
    this: Weak<RouterManager>,
}

impl RouterManager {
    pub fn new(
        node_id: impl Into<String>,
        networks: Vec<Arc<NetworkManager>>,
        cache: Arc<ServiceCache>,
        pool: TaskPool,
        queue_capacity: usize,
    ) -> Arc<Self> {
        let node_id = node_id.into();
        Arc::new_cyclic(|this| Self {
            node_id,
            networks,
            cache,
            pool,
            queue_capacity,
            local: RwLock::new(None),
            this: this.clone(),
        })
    }

    /// Register every network's inbound path with this router
    pub fn attach(self: &Arc<Self>) {
        let sink: Arc<dyn InboundSink> = self.clone();
        for network in &self.networks {
            network.core().set_inbound(Arc::downgrade(&sink));
        }
    }

    pub fn set_local_dispatch(&self, local: Weak<dyn LocalDispatch>) {
        *self.local.write() = Some(local);
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn networks(&self) -> &[Arc<NetworkManager>] {
        &self.networks
    }

    pub fn network(&self, name: &str) -> Option<Arc<NetworkManager>> {
        self.networks.iter().find(|n| n.name() == name).cloned()
    }

    fn is_local(&self, destination: Option<&str>) -> bool {
        match destination {
            None => true,
            Some(to) => to.is_empty() || to == self.node_id || to == LOCAL_SENTINEL,
        }
    }

    fn local_dispatch(&self) -> Option<Arc<dyn LocalDispatch>> {
        self.local.read().as_ref().and_then(Weak::upgrade)
    }

    fn deliver_local(&self, msg: Message, network: Option<&str>) {
        let Some(local) = self.local_dispatch() else {
            debug!("no local dispatch, dropping {}", msg);
            return;
        };
        let network = network.map(str::to_string);
        self.pool.spawn(async move {
            local.dispatch_message(msg, network).await;
        });
    }

    fn deliver_local_connection(&self, connection: Connection, network: Option<&str>) {
        let Some(local) = self.local_dispatch() else {
            debug!("no local dispatch, closing connection");
            connection.close_connection();
            return;
        };
        let network = network.map(str::to_string);
        self.pool.spawn(async move {
            local.dispatch_connection(connection, network).await;
        });
    }

    /// Resolve the network and node to hand traffic for `destination` to
    pub fn next_hop(&self, destination: &str) -> Option<NextHop> {
        let direct = self.networks.iter().any(|n| n.can_reach(destination));
        let gateway = if direct {
            destination.to_string()
        } else {
            self.cache.gateway_for(destination)?
        };
        if gateway == self.node_id {
            return None;
        }
        self.networks
            .iter()
            .find(|n| n.can_reach(&gateway))
            .map(|network| NextHop {
                network: network.clone(),
                gateway,
            })
    }

    /// Route one message. `from_network` is `None` for messages originated
    /// on this node; only those report routing failures as errors.
    pub async fn route_message(
        &self,
        mut msg: Message,
        from_network: Option<&str>,
    ) -> Result<RouteOutcome, RoutingError> {
        let hops = msg.hops();
        if hops <= 0 {
            debug!("hop budget exhausted, dropping {}", msg);
            return Ok(RouteOutcome::Dropped(DropReason::HopsExhausted));
        }
        msg.set_hops(hops - 1);

        let destination = msg.to_id().map(str::to_string);
        let local = self.is_local(destination.as_deref());
        if local {
            self.deliver_local(msg.clone(), from_network);
        }

        let Some(destination) = destination else {
            if from_network.is_some() {
                return Ok(RouteOutcome::Delivered);
            }
            return self.fan_out(msg).await;
        };
        if local {
            return Ok(RouteOutcome::Delivered);
        }

        if from_network.is_some() && hops - 1 <= 0 {
            debug!("no hops left to forward {}", msg);
            return Ok(RouteOutcome::Dropped(DropReason::HopsExhausted));
        }

        let Some(next) = self.next_hop(&destination) else {
            if from_network.is_none() {
                return Err(RoutingError::HostUnreachable(destination));
            }
            debug!(to = %destination, "no route, dropping forwarded message");
            return Ok(RouteOutcome::Dropped(DropReason::NoRoute(destination)));
        };

        match next
            .network
            .send_unicast(msg, Target::Node(next.gateway.clone()))
            .await
        {
            Ok(()) => {
                debug!(to = %destination, via = %next.gateway, network = %next.network.name(), "forwarded");
                Ok(RouteOutcome::Forwarded)
            }
            Err(err) if from_network.is_none() => Err(err),
            Err(err) => {
                warn!(to = %destination, error = %err, "forwarding failed, dropping");
                Ok(RouteOutcome::Dropped(DropReason::SendFailed(err.to_string())))
            }
        }
    }

    async fn fan_out(&self, msg: Message) -> Result<RouteOutcome, RoutingError> {
        let mut first_error = None;
        for network in &self.networks {
            if let Err(err) = network.send_multicast(msg.clone()).await {
                warn!(network = %network.name(), error = %err, "multicast failed");
                first_error.get_or_insert(err);
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(RouteOutcome::Forwarded),
        }
    }

    /// Deliver an inbound connection locally, or open the next leg towards
    /// its destination and splice the two together
    pub async fn route_connection(
        &self,
        connection: Connection,
        from_network: Option<&str>,
    ) -> Result<RouteOutcome, RoutingError> {
        let destination = connection.to().to_string();
        if self.is_local(Some(&destination)) {
            self.deliver_local_connection(connection, from_network);
            return Ok(RouteOutcome::Delivered);
        }

        let leg = match self.next_hop(&destination) {
            Some(next) => {
                next.network
                    .get_connection(
                        connection.connection_type(),
                        connection.from(),
                        &destination,
                        Target::Node(next.gateway),
                    )
                    .await
            }
            None => Err(RoutingError::HostUnreachable(destination.clone())),
        };

        match leg {
            Ok(outbound) => {
                debug!(from = %connection.from(), to = %destination, "bridging connection");
                connect(&connection, &outbound);
                Ok(RouteOutcome::Forwarded)
            }
            Err(err) => {
                let _ = connection.send(Message::error(&err.to_string())).await;
                let _ = connection.close().await;
                if from_network.is_none() {
                    return Err(err);
                }
                warn!(to = %destination, error = %err, "cannot bridge connection");
                Ok(RouteOutcome::Dropped(DropReason::NoRoute(destination)))
            }
        }
    }

    /// Open a connection from this node. Connections to ourselves are local
    /// pairs whose far end goes to local dispatch.
    pub async fn open_connection(
        &self,
        conn_type: ConnectionType,
        from: &str,
        to: &str,
    ) -> Result<Connection, RoutingError> {
        if to == from || self.is_local(Some(to)) {
            let (opener, acceptor) = Connection::local_pair(from, to, conn_type, self.queue_capacity);
            self.deliver_local_connection(acceptor, None);
            return Ok(opener);
        }
        let next = self
            .next_hop(to)
            .ok_or_else(|| RoutingError::HostUnreachable(to.to_string()))?;
        next.network
            .get_connection(conn_type, from, to, Target::Node(next.gateway))
            .await
    }
}

impl InboundSink for RouterManager {
    fn deliver_message(&self, msg: Message, network: &str) {
        let Some(this) = self.this.upgrade() else {
            return;
        };
        let network = network.to_string();
        self.pool.spawn(async move {
            if let Err(err) = this.route_message(msg, Some(&network)).await {
                debug!(network = %network, error = %err, "inbound routing failed");
            }
        });
    }

    fn deliver_connection(&self, connection: Connection, network: &str) {
        let Some(this) = self.this.upgrade() else {
            connection.close_connection();
            return;
        };
        let network = network.to_string();
        self.pool.spawn(async move {
            if let Err(err) = this.route_connection(connection, Some(&network)).await {
                debug!(network = %network, error = %err, "inbound connection routing failed");
            }
        });
    }
}

impl std::fmt::Debug for RouterManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RouterManager")
            .field("node_id", &self.node_id)
            .field("networks", &self.networks.len())
            .finish()
    }
}
