//! Protocol layer: per-network levels, election and the message manager
//!
//! - `level`: the level enum and its atomic cell
//! - `election`: credentials, the comparison policy, ballots
//! - `events`: broadcast notifications (level changes, cache updates, leaders)
//! - `manager`: the state machine driving discovery, joins, updates and USE
//! - `proxy`: foreign discovery protocols started by the leader

pub mod election;
pub mod events;
pub mod level;
pub mod manager;
pub mod proxy;

pub use election::{Ballot, Credential, CredentialPolicy, RankPolicy};
pub use events::{EventBus, ProtocolEvent};
pub use level::{Level, LevelCell, Transition};
pub use manager::{MessageManager, UseHandler};
pub use proxy::{DiscoveryProxy, StaticProxy};
