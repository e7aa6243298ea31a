// Integration tests for the stream-only transport
//
// One cached physical link per peer, several virtual connections over it,
// each closing independently.

use msd_core::config::{Limits, NetworkConfig, ProtocolTimings};
use msd_core::connection::{Connection, LinkKind};
use msd_core::message::{Codec, ConnectionType, Message, MessageType};
use msd_core::timer::TimerService;
use msd_core::transport::{
    Address, InboundSink, MemoryHub, NetworkCore, NetworkManager, Target, Transport, TransportKind,
};
use std::sync::Arc;
use tokio::sync::mpsc;

struct Inbound {
    messages: mpsc::UnboundedSender<Message>,
    connections: mpsc::UnboundedSender<Connection>,
}

impl InboundSink for Inbound {
    fn deliver_message(&self, msg: Message, _network: &str) {
        let _ = self.messages.send(msg);
    }

    fn deliver_connection(&self, connection: Connection, _network: &str) {
        let _ = self.connections.send(connection);
    }
}

struct Peer {
    manager: NetworkManager,
    _sink: Arc<dyn InboundSink>,
    messages: mpsc::UnboundedReceiver<Message>,
    connections: mpsc::UnboundedReceiver<Connection>,
}

impl Peer {
    async fn start(hub: &Arc<MemoryHub>, id: &str) -> Self {
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
        let sink: Arc<dyn InboundSink> = Arc::new(Inbound {
            messages: mtx,
            connections: ctx,
        });
        core.set_inbound(Arc::downgrade(&sink));
        let manager = NetworkManager::bluetooth(
            core,
            hub.clone(),
            Arc::new(TimerService::new()),
            &ProtocolTimings::default(),
        );
        manager.start().await.unwrap();
        Self {
            manager,
            _sink: sink,
            messages,
            connections,
        }
    }

    fn link_count(&self) -> usize {
        match self.manager.transport() {
            Transport::Bluetooth(t) => t.link_count(),
            Transport::Internet(_) => 0,
        }
    }

    fn virtual_count(&self, url: &str) -> usize {
        match self.manager.transport() {
            Transport::Bluetooth(t) => t.virtual_count(url),
            Transport::Internet(_) => 0,
        }
    }

    fn physical_for(&self, url: &str) -> Option<Connection> {
        match self.manager.transport() {
            Transport::Bluetooth(t) => t.physical_for(url),
            Transport::Internet(_) => None,
        }
    }
}

fn to_b() -> Target {
    Target::Address(Address::new("mem://b", 0, "bluetooth"))
}

#[tokio::test]
async fn test_concurrent_connections_share_one_link() {
    let hub = Arc::new(MemoryHub::new());
    let a = Peer::start(&hub, "a").await;
    let mut b = Peer::start(&hub, "b").await;

    let (first, second) = tokio::join!(
        a.manager.get_connection(ConnectionType::Get, "a", "b", to_b()),
        a.manager.get_connection(ConnectionType::Use, "a", "b", to_b()),
    );
    let first = first.unwrap();
    let second = second.unwrap();

    assert_eq!(first.kind(), LinkKind::Virtual);
    assert_ne!(first.virtual_id(), second.virtual_id());
    let parent = first.parent().unwrap();
    assert!(parent.same_as(second.parent().unwrap()));
    assert_eq!(a.link_count(), 1);
    assert_eq!(a.virtual_count("mem://b"), 2);

    let mut accepted = vec![
        b.connections.recv().await.unwrap(),
        b.connections.recv().await.unwrap(),
    ];
    accepted.sort_by_key(|c| c.connection_type() as u8);
    assert_eq!(accepted[0].connection_type(), ConnectionType::Get);
    assert_eq!(accepted[1].connection_type(), ConnectionType::Use);
    assert_eq!(accepted[0].from(), "a");
    assert_eq!(accepted[0].to(), "b");

    println!("✓ Two virtual connections over one physical link");
}

#[tokio::test]
async fn test_closing_one_virtual_leaves_the_rest() {
    let hub = Arc::new(MemoryHub::new());
    let a = Peer::start(&hub, "a").await;
    let mut b = Peer::start(&hub, "b").await;

    let get = a
        .manager
        .get_connection(ConnectionType::Get, "a", "b", to_b())
        .await
        .unwrap();
    let remote_get = b.connections.recv().await.unwrap();
    let use_conn = a
        .manager
        .get_connection(ConnectionType::Use, "a", "b", to_b())
        .await
        .unwrap();
    let remote_use = b.connections.recv().await.unwrap();

    get.close().await.unwrap();
    assert_eq!(remote_get.receive().await, Ok(None));
    assert!(get.is_closed());

    assert!(!use_conn.is_closed());
    assert!(!a.physical_for("mem://b").unwrap().is_closed());

    use_conn.send(Message::data(b"still here".to_vec())).await.unwrap();
    let got = remote_use.receive().await.unwrap().unwrap();
    assert_eq!(got.payload(), b"still here");
    assert!(got.virtual_id().is_some());

    remote_use.send(Message::data(b"and back".to_vec())).await.unwrap();
    assert_eq!(use_conn.receive().await.unwrap().unwrap().payload(), b"and back");
    assert_eq!(a.virtual_count("mem://b"), 1);
}

#[tokio::test]
async fn test_plain_messages_share_the_link_with_virtuals() {
    let hub = Arc::new(MemoryHub::new());
    let a = Peer::start(&hub, "a").await;
    let mut b = Peer::start(&hub, "b").await;

    let conn = a
        .manager
        .get_connection(ConnectionType::Use, "a", "b", to_b())
        .await
        .unwrap();
    let remote = b.connections.recv().await.unwrap();

    let notice = Message::addressed(MessageType::IAmHere, "a", Some("b"));
    a.manager.send_unicast(notice, to_b()).await.unwrap();
    conn.send(Message::data(b"payload".to_vec())).await.unwrap();

    assert_eq!(b.messages.recv().await.unwrap().message_type(), MessageType::IAmHere);
    assert_eq!(remote.receive().await.unwrap().unwrap().payload(), b"payload");
    assert_eq!(hub.dial_count(), 1);
}

#[tokio::test]
async fn test_physical_loss_closes_every_virtual() {
    let hub = Arc::new(MemoryHub::new());
    let a = Peer::start(&hub, "a").await;
    let mut b = Peer::start(&hub, "b").await;

    let one = a
        .manager
        .get_connection(ConnectionType::Get, "a", "b", to_b())
        .await
        .unwrap();
    let two = a
        .manager
        .get_connection(ConnectionType::Use, "a", "b", to_b())
        .await
        .unwrap();
    b.connections.recv().await.unwrap();
    b.connections.recv().await.unwrap();

    a.physical_for("mem://b").unwrap().close_connection();
    assert_eq!(one.receive().await, Ok(None));
    assert_eq!(two.receive().await, Ok(None));
    for _ in 0..50 {
        if a.link_count() == 0 {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    assert_eq!(a.link_count(), 0);
}
