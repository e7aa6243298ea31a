//! Neighbor table — which MSDs a network can see directly

use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

use super::abstraction::Address;

#[derive(Debug, Clone)]
pub struct Neighbor {
    pub id: String,
    pub last_seen: Instant,
    /// Where the neighbor was last heard from
    pub address: Option<Address>,
}

/// Node id → last-seen timestamp. The local node never appears in it.
#[derive(Debug)]
pub struct NeighborTable {
    local_id: String,
    entries: Mutex<HashMap<String, Neighbor>>,
}

impl NeighborTable {
    pub fn new(local_id: impl Into<String>) -> Self {
        Self {
            local_id: local_id.into(),
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Refresh `id`. A known address is kept when `address` is `None`.
    /// Returns `false` when `id` is the local node or empty.
    pub fn touch(&self, id: &str, address: Option<Address>) -> bool {
        if id.is_empty() || id == self.local_id {
            return false;
        }
        let mut entries = self.entries.lock();
        let entry = entries.entry(id.to_string()).or_insert_with(|| Neighbor {
            id: id.to_string(),
            last_seen: Instant::now(),
            address: None,
        });
        entry.last_seen = Instant::now();
        if address.is_some() {
            entry.address = address;
        }
        true
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.lock().contains_key(id)
    }

    pub fn get(&self, id: &str) -> Option<Neighbor> {
        self.entries.lock().get(id).cloned()
    }

    pub fn address_of(&self, id: &str) -> Option<Address> {
        self.entries.lock().get(id).and_then(|n| n.address.clone())
    }

    pub fn remove(&self, id: &str) -> Option<Neighbor> {
        self.entries.lock().remove(id)
    }

    /// Time since `id` was last heard from
    pub fn silence(&self, id: &str) -> Option<Duration> {
        self.entries.lock().get(id).map(|n| n.last_seen.elapsed())
    }

    /// Drop neighbors silent for longer than `max_silence`
    pub fn expire(&self, max_silence: Duration) -> Vec<String> {
        let mut entries = self.entries.lock();
        let stale: Vec<String> = entries
            .values()
            .filter(|n| n.last_seen.elapsed() > max_silence)
            .map(|n| n.id.clone())
            .collect();
        for id in &stale {
            entries.remove(id);
        }
        stale
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.entries.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn addresses(&self) -> Vec<Address> {
        self.entries
            .lock()
            .values()
            .filter_map(|n| n.address.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
