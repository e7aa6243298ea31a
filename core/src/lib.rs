// MSD Core — service directory routing and transport multiplexing
//
// Nodes find each other over IP multicast and stream-only links, elect a
// leader per network, replicate a service cache through it and route
// messages and connections across networks through gateways.

pub mod cache;
pub mod config;
pub mod connection;
pub mod crypto;
pub mod error;
pub mod keying;
pub mod message;
pub mod node;
pub mod protocol;
pub mod routing;
pub mod timer;
pub mod transport;

pub use cache::{CacheSnapshot, Service, ServiceCache, Template};
pub use config::{CacheSharing, Limits, NetworkConfig, NodeConfig, ProtocolTimings};
pub use connection::{connect, connection_to_streams, Connection, ConnectionEvent, ConnectionListener};
pub use error::{ConfigError, ConnErr, KeyingError, MsdError, MsdResult, ProtocolError, RoutingError, StateError};
pub use keying::{KeyingService, StaticKeyring};
pub use message::{Codec, ConnectionType, Message, MessageType};
pub use node::Msd;
pub use protocol::{DiscoveryProxy, Level, MessageManager, ProtocolEvent, UseHandler};
pub use routing::{RouteOutcome, RouterManager};
pub use timer::{TaskPool, TimerService};
pub use transport::{Address, MemoryHub, NetworkManager, StreamDialer, TransportKind};
