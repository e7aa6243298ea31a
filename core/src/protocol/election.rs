//! Leader election
//!
//! Each candidate multicasts its credential and collects everyone else's for
//! one election window. The comparison rule sits behind [`CredentialPolicy`].

use std::cmp::Ordering;
use std::fmt;

/// A candidate's claim: configured rank plus node id
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Credential {
    pub rank: u64,
    pub node_id: String,
}

impl Credential {
    pub fn new(rank: u64, node_id: impl Into<String>) -> Self {
        Self {
            rank,
            node_id: node_id.into(),
        }
    }

    /// Wire form carried in the `credential` header
    pub fn encode(&self) -> String {
        self.rank.to_string()
    }

    pub fn decode(value: &str, node_id: &str) -> Option<Self> {
        let rank = value.trim().parse().ok()?;
        Some(Self::new(rank, node_id))
    }
}

impl fmt::Display for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.node_id, self.rank)
    }
}

/// Decides which of two credentials is stronger
pub trait CredentialPolicy: Send + Sync {
    fn compare(&self, a: &Credential, b: &Credential) -> Ordering;
}

/// Highest rank wins, ties go to the lexicographically greater node id
#[derive(Debug, Clone, Copy, Default)]
pub struct RankPolicy;

impl CredentialPolicy for RankPolicy {
    fn compare(&self, a: &Credential, b: &Credential) -> Ordering {
        a.rank
            .cmp(&b.rank)
            .then_with(|| a.node_id.cmp(&b.node_id))
    }
}

/// Credentials seen during one election
#[derive(Debug, Clone)]
pub struct Ballot {
    own: Credential,
    best: Credential,
    seen: usize,
}

impl Ballot {
    pub fn new(own: Credential) -> Self {
        Self {
            best: own.clone(),
            own,
            seen: 1,
        }
    }

    /// Record a competing credential. Returns whether it is now the best.
    pub fn offer(&mut self, credential: Credential, policy: &dyn CredentialPolicy) -> bool {
        self.seen += 1;
        if policy.compare(&credential, &self.best) == Ordering::Greater {
            self.best = credential;
            return true;
        }
        false
    }

    pub fn winner(&self) -> &Credential {
        &self.best
    }

    pub fn we_win(&self) -> bool {
        self.best.node_id == self.own.node_id
    }

    pub fn candidates(&self) -> usize {
        self.seen
    }
}
