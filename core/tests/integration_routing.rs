// Integration tests for routing across networks
//
// Three routers: A on network x, B on x and y acting as gateway, C on y.
// A only learns of C through a service B relays.

use async_trait::async_trait;
use msd_core::cache::{CacheSnapshot, Service, ServiceCache};
use msd_core::config::{Limits, NetworkConfig, ProtocolTimings};
use msd_core::connection::Connection;
use msd_core::error::RoutingError;
use msd_core::message::{Codec, ConnectionType, Message, MessageType};
use msd_core::routing::{LocalDispatch, RouteOutcome, RouterManager};
use msd_core::timer::{TaskPool, TimerService};
use msd_core::transport::{Address, MemoryHub, NetworkCore, NetworkManager, TransportKind};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

struct Recorder {
    messages: mpsc::UnboundedSender<Message>,
    connections: mpsc::UnboundedSender<Connection>,
}

#[async_trait]
impl LocalDispatch for Recorder {
    async fn dispatch_message(&self, msg: Message, _network: Option<String>) {
        let _ = self.messages.send(msg);
    }

    async fn dispatch_connection(&self, connection: Connection, _network: Option<String>) {
        let _ = self.connections.send(connection);
    }
}

struct Node {
    router: Arc<RouterManager>,
    cache: Arc<ServiceCache>,
    _local: Arc<dyn LocalDispatch>,
    messages: mpsc::UnboundedReceiver<Message>,
    connections: mpsc::UnboundedReceiver<Connection>,
}

impl Node {
    /// `attachments` lists (network name, hub, own url)
    async fn start(id: &str, attachments: &[(&str, &Arc<MemoryHub>, &str)]) -> Self {
        let timers = Arc::new(TimerService::new());
        let mut networks = Vec::new();
        for (name, hub, url) in attachments {
            let config = NetworkConfig {
                name: name.to_string(),
                kind: TransportKind::Bluetooth,
                local: Address::new(*url, 0, *name),
                multicast: None,
                service_name: "msd".into(),
            };
            let core = Arc::new(NetworkCore::new(config, id, Limits::default(), Codec::new()));
            let dialer: Arc<MemoryHub> = (*hub).clone();
            networks.push(Arc::new(NetworkManager::bluetooth(
                core,
                dialer,
                timers.clone(),
                &ProtocolTimings::default(),
            )));
        }

        let cache = Arc::new(ServiceCache::new(id));
        let router = RouterManager::new(id, networks, cache.clone(), TaskPool::new(8), 5);
        router.attach();
        let (mtx, messages) = mpsc::unbounded_channel();
        let (ctx, connections) = mpsc::unbounded_channel();
        let local: Arc<dyn LocalDispatch> = Arc::new(Recorder {
            messages: mtx,
            connections: ctx,
        });
        router.set_local_dispatch(Arc::downgrade(&local));
        for network in router.networks() {
            network.start().await.unwrap();
        }

        Self {
            router,
            cache,
            _local: local,
            messages,
            connections,
        }
    }

    fn meet(&self, network: &str, peer: &str, url: &str) {
        let manager = self.router.network(network).unwrap();
        manager
            .core()
            .neighbors()
            .touch(peer, Some(Address::new(url, 0, network)));
    }
}

struct World {
    a: Node,
    b: Node,
    c: Node,
}

async fn world() -> World {
    let x = Arc::new(MemoryHub::new());
    let y = Arc::new(MemoryHub::new());
    let a = Node::start("a", &[("x", &x, "mem://a")]).await;
    let b = Node::start("b", &[("x", &x, "mem://bx"), ("y", &y, "mem://by")]).await;
    let c = Node::start("c", &[("y", &y, "mem://c")]).await;

    a.meet("x", "b", "mem://bx");
    b.meet("x", "a", "mem://a");
    b.meet("y", "c", "mem://c");
    c.meet("y", "b", "mem://by");

    // B relays C's printer to network x
    let mut relayed = Service::new("printer", "c").on_network("x");
    relayed.gateway = Some("b".into());
    relayed.hops = 1;
    a.cache.merge(&CacheSnapshot {
        origin: "b".into(),
        update_id: 1,
        services: vec![relayed],
    });

    World { a, b, c }
}

#[tokio::test]
async fn test_message_crosses_gateway() {
    let mut w = world().await;
    assert_eq!(w.a.router.next_hop("c").unwrap().gateway, "b");

    let mut msg = Message::addressed(MessageType::Use, "a", Some("c")).with_payload(b"ping".to_vec());
    msg.set_hops(3);
    let outcome = w.a.router.route_message(msg, None).await;
    assert_eq!(outcome, Ok(RouteOutcome::Forwarded));

    let got = tokio::time::timeout(Duration::from_secs(2), w.c.messages.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(got.payload(), b"ping");
    assert_eq!(got.from_id(), Some("a"));
    assert_eq!(got.hops(), 0);
    assert!(w.b.messages.try_recv().is_err());

    println!("✓ A reached C through B with the hop budget spent");
}

#[tokio::test]
async fn test_budget_runs_out_at_gateway() {
    let mut w = world().await;

    let mut msg = Message::addressed(MessageType::Use, "a", Some("c"));
    msg.set_hops(2);
    assert_eq!(
        w.a.router.route_message(msg, None).await,
        Ok(RouteOutcome::Forwarded)
    );

    let arrived = tokio::time::timeout(Duration::from_millis(300), w.c.messages.recv()).await;
    assert!(arrived.is_err());
}

#[tokio::test]
async fn test_unknown_destination_is_unreachable_locally() {
    let w = world().await;
    let msg = Message::addressed(MessageType::Use, "a", Some("nobody"));
    match w.a.router.route_message(msg, None).await {
        Err(RoutingError::HostUnreachable(node)) => assert_eq!(node, "nobody"),
        other => panic!("expected HostUnreachable, got {:?}", other),
    }
    assert!(w
        .a
        .router
        .open_connection(ConnectionType::Use, "a", "nobody")
        .await
        .is_err());
}

#[tokio::test]
async fn test_connection_bridged_through_gateway() {
    let mut w = world().await;

    let conn = w
        .a
        .router
        .open_connection(ConnectionType::Use, "a", "c")
        .await
        .unwrap();
    let far = tokio::time::timeout(Duration::from_secs(2), w.c.connections.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(far.from(), "a");
    assert_eq!(far.to(), "c");
    assert_eq!(far.connection_type(), ConnectionType::Use);

    conn.send(Message::data(b"job".to_vec())).await.unwrap();
    assert_eq!(far.receive().await.unwrap().unwrap().payload(), b"job");

    far.send(Message::data(b"done".to_vec())).await.unwrap();
    assert_eq!(conn.receive().await.unwrap().unwrap().payload(), b"done");

    conn.close().await.unwrap();
    let end = tokio::time::timeout(Duration::from_secs(2), far.receive())
        .await
        .unwrap();
    assert_eq!(end, Ok(None));
    assert!(w.b.connections.try_recv().is_err());
}
