//! Keying service — group keys for cache-update traffic
//!
//! The key hierarchy itself (LKH and its variants) lives outside this crate.
//! The stack consumes it through [`KeyingService`]: a current key per network,
//! membership notifications, and the join handshake a follower performs
//! before its first cache update.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use tracing::{debug, info};

use crate::crypto::PayloadKey;
use crate::error::KeyingError;

/// Membership change reported by the protocol layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MembershipChange {
    Join(String),
    Leave(String),
}

/// Narrow interface onto the group-key service
#[async_trait]
pub trait KeyingService: Send + Sync {
    /// Key currently protecting payloads on `network`
    fn current_key(&self, network: &str) -> Option<PayloadKey>;

    /// A member joined or left `network`
    fn on_membership_change(&self, network: &str, change: MembershipChange);

    /// Join handshake performed by a follower with the network's leader
    async fn join(&self, network: &str, leader: &str) -> Result<(), KeyingError>;
}

/// Pre-shared keys, one per network, with membership bookkeeping
#[derive(Default)]
pub struct StaticKeyring {
    keys: RwLock<HashMap<String, PayloadKey>>,
    members: RwLock<HashMap<String, HashSet<String>>>,
}

impl StaticKeyring {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from hex-encoded keys; entries that do not decode are skipped
    pub fn from_hex_keys(keys: &HashMap<String, String>) -> Self {
        let ring = Self::new();
        for (network, key) in keys {
            if let Some(key) = PayloadKey::from_hex(key) {
                ring.set_key(network, key);
            }
        }
        ring
    }

    pub fn set_key(&self, network: &str, key: PayloadKey) {
        self.keys.write().insert(network.to_string(), key);
    }

    pub fn members(&self, network: &str) -> Vec<String> {
        let mut members: Vec<String> = self
            .members
            .read()
            .get(network)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();
        members.sort();
        members
    }
}

#[async_trait]
impl KeyingService for StaticKeyring {
    fn current_key(&self, network: &str) -> Option<PayloadKey> {
        self.keys.read().get(network).cloned()
    }

    fn on_membership_change(&self, network: &str, change: MembershipChange) {
        let mut members = self.members.write();
        let set = members.entry(network.to_string()).or_default();
        match change {
            MembershipChange::Join(id) => {
                debug!(network, member = %id, "keyring member joined");
                set.insert(id);
            }
            MembershipChange::Leave(id) => {
                debug!(network, member = %id, "keyring member left");
                set.remove(&id);
            }
        }
    }

    async fn join(&self, network: &str, leader: &str) -> Result<(), KeyingError> {
        info!(network, leader, "joined key group");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_current_key_per_network() {
        let ring = StaticKeyring::new();
        assert!(ring.current_key("wifi").is_none());
        ring.set_key("wifi", PayloadKey::generate());
        assert!(ring.current_key("wifi").is_some());
        assert!(ring.current_key("bluetooth").is_none());
    }

    #[test]
    fn test_from_hex_keys_skips_invalid() {
        let mut keys = HashMap::new();
        keys.insert("wifi".to_string(), "ab".repeat(32));
        keys.insert("bluetooth".to_string(), "nope".to_string());
        let ring = StaticKeyring::from_hex_keys(&keys);
        assert!(ring.current_key("wifi").is_some());
        assert!(ring.current_key("bluetooth").is_none());
    }

    #[test]
    fn test_membership_tracking() {
        let ring = StaticKeyring::new();
        ring.on_membership_change("wifi", MembershipChange::Join("b".into()));
        ring.on_membership_change("wifi", MembershipChange::Join("a".into()));
        assert_eq!(ring.members("wifi"), vec!["a", "b"]);
        ring.on_membership_change("wifi", MembershipChange::Leave("b".into()));
        assert_eq!(ring.members("wifi"), vec!["a"]);
    }

    #[tokio::test]
    async fn test_join_succeeds() {
        let ring = StaticKeyring::new();
        assert!(ring.join("wifi", "leader").await.is_ok());
    }
}
