//! Replicated service cache
//!
//! The directory every MSD keeps: which services exist, who owns them, on
//! which networks they are present and through which gateway they are
//! reached. Snapshots travel as JSON over GET and UPDATE connections.

pub mod filter;

pub use filter::{inbound_accepts, outbound};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

use crate::error::MsdResult;

/// One service descriptor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    pub id: String,
    /// Node that registered the service
    pub owner: String,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
    /// Networks on which the service is directly present
    #[serde(default)]
    pub networks: BTreeSet<String>,
    /// Node through which the service is reached, when not the owner
    #[serde(default)]
    pub gateway: Option<String>,
    #[serde(default)]
    pub hops: u32,
    /// Never replicated
    #[serde(default)]
    pub tmp: bool,
}

impl Service {
    pub fn new(id: impl Into<String>, owner: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            owner: owner.into(),
            attributes: BTreeMap::new(),
            networks: BTreeSet::new(),
            gateway: None,
            hops: 0,
            tmp: false,
        }
    }

    pub fn with_attribute(mut self, name: &str, value: &str) -> Self {
        self.attributes.insert(name.to_string(), value.to_string());
        self
    }

    pub fn on_network(mut self, network: &str) -> Self {
        self.networks.insert(network.to_string());
        self
    }

    /// Next node towards the service
    pub fn route(&self) -> &str {
        self.gateway.as_deref().unwrap_or(&self.owner)
    }

    fn key(&self) -> (String, String) {
        (self.owner.clone(), self.id.clone())
    }
}

/// Serialized cache content
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheSnapshot {
    /// Node the snapshot was taken on
    pub origin: String,
    pub update_id: u64,
    pub services: Vec<Service>,
}

impl CacheSnapshot {
    pub fn to_bytes(&self) -> MsdResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> MsdResult<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Browse template: `key=value;key=value`. `*` matches any value, the keys
/// `id`, `owner` and `network` address the descriptor itself.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Template {
    terms: Vec<(String, String)>,
}

impl Template {
    pub fn parse(text: &str) -> Self {
        let terms = text
            .split(';')
            .filter_map(|term| {
                let (key, value) = term.split_once('=')?;
                let key = key.trim();
                (!key.is_empty()).then(|| (key.to_string(), value.trim().to_string()))
            })
            .collect();
        Self { terms }
    }

    pub fn any() -> Self {
        Self::default()
    }

    pub fn matches(&self, service: &Service) -> bool {
        self.terms.iter().all(|(key, expected)| {
            let wildcard = expected == "*";
            match key.as_str() {
                "id" => wildcard || service.id == *expected,
                "owner" => wildcard || service.owner == *expected,
                "network" => wildcard || service.networks.contains(expected),
                _ => match service.attributes.get(key) {
                    Some(value) => wildcard || value == expected,
                    None => false,
                },
            }
        })
    }
}

impl std::fmt::Display for Template {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let terms: Vec<String> = self.terms.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
        f.write_str(&terms.join(";"))
    }
}

/// Outcome of one merge
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeReport {
    pub added: usize,
    pub replaced: usize,
    pub removed: usize,
    pub discarded: usize,
}

impl MergeReport {
    pub fn changed(&self) -> bool {
        self.added + self.replaced + self.removed > 0
    }
}

#[derive(Default)]
struct CacheState {
    services: BTreeMap<(String, String), Service>,
    update_id: u64,
}

pub struct ServiceCache {
    local_id: String,
    state: RwLock<CacheState>,
}

impl ServiceCache {
    pub fn new(local_id: impl Into<String>) -> Self {
        Self {
            local_id: local_id.into(),
            state: RwLock::new(CacheState::default()),
        }
    }

    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    /// Replication counter, bumped on every local change
    pub fn update_id(&self) -> u64 {
        self.state.read().update_id
    }

    /// Move the counter forward to at least `id`
    pub fn observe_update_id(&self, id: u64) {
        let mut state = self.state.write();
        state.update_id = state.update_id.max(id);
    }

    pub fn bump_update_id(&self) -> u64 {
        let mut state = self.state.write();
        state.update_id += 1;
        state.update_id
    }

    /// Add or replace a service owned by this node
    pub fn register(&self, mut service: Service) -> u64 {
        service.owner = self.local_id.clone();
        service.gateway = None;
        service.hops = 0;
        let mut state = self.state.write();
        state.services.insert(service.key(), service);
        state.update_id += 1;
        state.update_id
    }

    /// Remove a service owned by this node. Returns the new update id.
    pub fn unregister(&self, id: &str) -> Option<u64> {
        let mut state = self.state.write();
        state
            .services
            .remove(&(self.local_id.clone(), id.to_string()))?;
        state.update_id += 1;
        Some(state.update_id)
    }

    pub fn services(&self) -> Vec<Service> {
        self.state.read().services.values().cloned().collect()
    }

    pub fn get(&self, owner: &str, id: &str) -> Option<Service> {
        self.state
            .read()
            .services
            .get(&(owner.to_string(), id.to_string()))
            .cloned()
    }

    pub fn query(&self, template: &Template) -> Vec<Service> {
        self.state
            .read()
            .services
            .values()
            .filter(|service| template.matches(service))
            .cloned()
            .collect()
    }

    /// Gateway recorded for services owned by `node`, if any
    pub fn gateway_for(&self, node: &str) -> Option<String> {
        self.state
            .read()
            .services
            .values()
            .filter(|service| service.owner == node)
            .find_map(|service| service.gateway.clone())
    }

    /// Whether any service of `node` is known
    pub fn knows(&self, node: &str) -> bool {
        self.state
            .read()
            .services
            .values()
            .any(|service| service.owner == node)
    }

    pub fn snapshot(&self) -> CacheSnapshot {
        let state = self.state.read();
        CacheSnapshot {
            origin: self.local_id.clone(),
            update_id: state.update_id,
            services: state.services.values().cloned().collect(),
        }
    }

    /// Merge a remote snapshot through the inbound filter. Our own services
    /// are never overwritten, and the snapshot's origin is authoritative for
    /// the services it owns.
    pub fn merge(&self, snapshot: &CacheSnapshot) -> MergeReport {
        self.merge_scoped(snapshot, None)
    }

    /// Merge a snapshot pulled from the leader of `network`. The leader speaks
    /// for every foreign entry learned on that network: present there, or
    /// reached through the leader. Entries it no longer lists are dropped.
    pub fn merge_from_leader(&self, snapshot: &CacheSnapshot, network: &str) -> MergeReport {
        self.merge_scoped(snapshot, Some(network))
    }

    fn merge_scoped(&self, snapshot: &CacheSnapshot, leader_of: Option<&str>) -> MergeReport {
        let mut report = MergeReport::default();
        let mut state = self.state.write();

        if snapshot.origin != self.local_id {
            let listed: BTreeSet<(&str, &str)> = snapshot
                .services
                .iter()
                .map(|s| (s.owner.as_str(), s.id.as_str()))
                .collect();
            let origin = snapshot.origin.as_str();
            let local_id = self.local_id.as_str();
            let before = state.services.len();
            state.services.retain(|(owner, id), service| {
                if listed.contains(&(owner.as_str(), id.as_str())) || owner == local_id {
                    return true;
                }
                let covered = match leader_of {
                    Some(network) => {
                        owner == origin
                            || service.networks.contains(network)
                            || service.gateway.as_deref() == Some(origin)
                    }
                    None => owner == origin,
                };
                !covered
            });
            report.removed = before - state.services.len();
        }

        for incoming in &snapshot.services {
            if incoming.owner == self.local_id {
                continue;
            }
            match state.services.get(&incoming.key()) {
                Some(local) if local == incoming => {}
                Some(local) => {
                    if inbound_accepts(local, incoming) {
                        state.services.insert(incoming.key(), incoming.clone());
                        report.replaced += 1;
                    } else {
                        report.discarded += 1;
                    }
                }
                None => {
                    state.services.insert(incoming.key(), incoming.clone());
                    report.added += 1;
                }
            }
        }

        debug!(origin = %snapshot.origin, ?report, "cache merged");
        report
    }

    /// Purge everything `owner` registered or relays. Returns how many
    /// entries went away.
    pub fn delete_by_owner(&self, owner: &str) -> usize {
        let mut state = self.state.write();
        let before = state.services.len();
        state
            .services
            .retain(|_, service| service.owner != owner && service.gateway.as_deref() != Some(owner));
        before - state.services.len()
    }

    pub fn len(&self) -> usize {
        self.state.read().services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
