// Transport module — network managers over IP and stream-only transports

pub mod abstraction;
pub mod bluetooth;
pub mod internet;
pub mod manager;
pub mod memory;
pub mod neighbors;

pub use abstraction::{normalize_url, Address, RawReader, RawStreamPair, RawWriter, TransportKind};
pub use bluetooth::{BluetoothTransport, StreamDialer};
pub use internet::InternetTransport;
pub use manager::{parse_handshake, InboundSink, NetworkCore, NetworkManager, Target, Transport};
pub use memory::MemoryHub;
pub use neighbors::{Neighbor, NeighborTable};
