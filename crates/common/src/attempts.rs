//! Attempt bookkeeping per test identity

use dashmap::DashMap;
use tracing::debug;

use crate::types::{ResultStatus, TestIdentity};

#[derive(Debug, Clone, Copy, Default)]
struct AttemptEntry {
    /// Attempt of the newest result stored for the identity
    attempt: u32,
    /// Whether a terminal result occupies `attempt`
    closed: bool,
}

impl AttemptEntry {
    /// Slot the next result goes to
    fn pending_slot(self) -> u32 {
        if self.closed {
            self.attempt + 1
        } else {
            self.attempt
        }
    }
}

/// Tracks which attempt is current for every test identity.
///
/// Only terminal statuses move the counter. A RUNNING result for an identity
/// whose current attempt is already closed is placed in the next slot without
/// moving the counter, so the terminal result that follows lands on the same
/// slot and is counted once.
#[derive(Debug, Default)]
pub struct AttemptTracker {
    entries: DashMap<TestIdentity, AttemptEntry>,
}

impl AttemptTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed state from a previously persisted row
    pub fn register_attempt(&self, identity: &TestIdentity, status: ResultStatus, attempt: u32) {
        let mut entry = self.entries.entry(identity.clone()).or_default();
        if attempt > entry.attempt || (attempt == entry.attempt && !entry.closed) {
            entry.attempt = attempt;
            entry.closed = status.advances_attempt();
        }
        debug!("Registered attempt {} ({}) for {}", attempt, status, identity);
    }

    /// Attempt of the newest result stored for the identity, 0 when unseen
    pub fn get_current_attempt(&self, identity: &TestIdentity) -> u32 {
        self.entries.get(identity).map(|e| e.attempt).unwrap_or(0)
    }

    /// Record a result and return the attempt it belongs to.
    ///
    /// Terminal statuses advance the counter when the identity already has a
    /// terminal result; SKIPPED, RUNNING and IDLE never do.
    pub fn register_result(&self, identity: &TestIdentity, status: ResultStatus) -> u32 {
        let mut entry = self.entries.entry(identity.clone()).or_default();

        if !status.advances_attempt() {
            return entry.pending_slot();
        }

        if entry.closed {
            entry.attempt += 1;
        }
        entry.closed = true;

        debug!("Attempt {} ({}) for {}", entry.attempt, status, identity);
        entry.attempt
    }

    /// Step back one attempt, forgetting the identity once it drops below zero
    pub fn remove_attempt(&self, identity: &TestIdentity) {
        let remove = match self.entries.get_mut(identity) {
            Some(mut entry) if entry.attempt > 0 => {
                entry.attempt -= 1;
                entry.closed = true;
                false
            }
            Some(_) => true,
            None => false,
        };

        if remove {
            self.entries.remove(identity);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
