//! Per-network protocol level
//!
//! WAIT_EVENT is the steady state. Request-driven work moves a network into
//! a transient level and back; every change is an atomic read-modify-write
//! on the cell so two tasks can never both leave WAIT_EVENT.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum Level {
    #[default]
    Undef,
    DiscoverMain,
    Joining,
    InitialUpdate,
    WaitEvent,
    Update,
    Use,
    Election,
    Browse,
    FinalUpdate,
    Leaving,
    Left,
}

impl Level {
    /// Levels at which inbound GET/UPDATE/USE work and peer notices are served
    pub fn serves_requests(&self) -> bool {
        matches!(
            self,
            Level::WaitEvent | Level::InitialUpdate | Level::Update | Level::Browse | Level::Use
        )
    }

    /// Transient levels entered from WAIT_EVENT and left unconditionally
    pub fn is_transient(&self) -> bool {
        matches!(self, Level::Update | Level::Browse | Level::Use)
    }

    /// Still looking for a leader
    pub fn is_discovering(&self) -> bool {
        matches!(self, Level::DiscoverMain | Level::Election)
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Level::Undef => "UNDEF",
            Level::DiscoverMain => "DISCOVER_MAIN",
            Level::Joining => "JOINING",
            Level::InitialUpdate => "INITIAL_UPDATE",
            Level::WaitEvent => "WAIT_EVENT",
            Level::Update => "UPDATE",
            Level::Use => "USE",
            Level::Election => "ELECTION",
            Level::Browse => "BROWSE",
            Level::FinalUpdate => "FINAL_UPDATE",
            Level::Leaving => "LEAVING",
            Level::Left => "LEFT",
        };
        f.write_str(name)
    }
}

/// A level change that actually happened
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: Level,
    pub to: Level,
}

#[derive(Debug, Default)]
pub struct LevelCell {
    level: Mutex<Level>,
}

impl LevelCell {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> Level {
        *self.level.lock()
    }

    /// Unconditional move. `None` when already at `to`.
    pub fn set(&self, to: Level) -> Option<Transition> {
        let mut level = self.level.lock();
        let from = *level;
        if from == to {
            return None;
        }
        *level = to;
        Some(Transition { from, to })
    }

    /// Move to `to` only from one of `allowed`. On refusal the current level
    /// is returned.
    pub fn transition(&self, allowed: &[Level], to: Level) -> Result<Transition, Level> {
        let mut level = self.level.lock();
        let from = *level;
        if !allowed.contains(&from) {
            return Err(from);
        }
        *level = to;
        Ok(Transition { from, to })
    }
}
