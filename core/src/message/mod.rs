// Message module — attribute-bag messages and their wire framing

pub mod codec;
pub mod types;

pub use codec::{Codec, FRAME_MARKER};
pub use types::{attr, ConnectionType, Message, MessageType, DEFAULT_HOPS, LOCAL_SENTINEL};
