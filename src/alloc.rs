//! Tracked allocations for driver-private state
//!
//! Every driver-private structure holds an [`Allocation`] guard obtained from an
//! [`AllocTracker`]. Dropping the structure drops the guard, which releases the
//! accounting entry, so a leak or double release shows up as a non-zero
//! [`AllocTracker::live_count`] in tests.
//!
//! The tracker also carries a [`FailPolicy`] used to simulate out-of-memory
//! conditions on chosen allocation sites.

use crate::error::{DriverError, DriverResult};
use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

/// When the tracker should refuse an allocation
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailPolicy {
    /// Every allocation succeeds
    #[default]
    Never,
    /// Every allocation fails
    Always,
    /// Allocations with this tag fail
    Tag(String),
    /// The first `n` allocations succeed, every later one fails
    After(usize),
}

#[derive(Debug, Default)]
struct TrackerState {
    policy: FailPolicy,
    next_id: u64,
    attempts: usize,
    live: BTreeMap<u64, (&'static str, usize)>,
    total_allocated: usize,
    total_released: usize,
}

/// Shared allocation ledger
///
/// Cloning the tracker yields another handle onto the same ledger.
#[derive(Debug, Clone, Default)]
pub struct AllocTracker {
    state: Arc<Mutex<TrackerState>>,
}

impl AllocTracker {
    /// Tracker on which every allocation succeeds
    pub fn new() -> Self {
        Self::default()
    }

    /// Tracker using the given failure policy
    pub fn with_policy(policy: FailPolicy) -> Self {
        let tracker = Self::default();
        tracker.set_policy(policy);
        tracker
    }

    fn lock(&self) -> MutexGuard<'_, TrackerState> {
        // A panic while holding the ledger cannot leave it inconsistent.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Replace the failure policy
    pub fn set_policy(&self, policy: FailPolicy) {
        self.lock().policy = policy;
    }

    /// Reserve `size` bytes for the structure named `tag`
    pub fn allocate(&self, tag: &'static str, size: usize) -> DriverResult<Allocation> {
        let mut state = self.lock();
        let attempt = state.attempts;
        state.attempts += 1;

        let fail = match &state.policy {
            FailPolicy::Never => false,
            FailPolicy::Always => true,
            FailPolicy::Tag(t) => t == tag,
            FailPolicy::After(n) => attempt >= *n,
        };
        if fail {
            debug!("alloc: refusing {} ({} bytes)", tag, size);
            return Err(DriverError::OutOfMemory(tag));
        }

        let id = state.next_id;
        state.next_id += 1;
        state.live.insert(id, (tag, size));
        state.total_allocated += 1;

        Ok(Allocation {
            id,
            tag,
            size,
            tracker: self.clone(),
        })
    }

    /// Number of allocations not yet released
    pub fn live_count(&self) -> usize {
        self.lock().live.len()
    }

    /// Bytes held by allocations not yet released
    pub fn live_bytes(&self) -> usize {
        self.lock().live.values().map(|(_, size)| size).sum()
    }

    /// Tags of the allocations not yet released, oldest first
    pub fn live_tags(&self) -> Vec<&'static str> {
        self.lock().live.values().map(|(tag, _)| *tag).collect()
    }

    /// Snapshot of the ledger counters
    pub fn stats(&self) -> AllocStats {
        let state = self.lock();
        AllocStats {
            attempts: state.attempts,
            allocated: state.total_allocated,
            released: state.total_released,
            live: state.live.len(),
        }
    }

    fn release(&self, id: u64) {
        let mut state = self.lock();
        if state.live.remove(&id).is_some() {
            state.total_released += 1;
        }
    }
}

/// Ledger counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocStats {
    /// Allocation attempts, including refused ones
    pub attempts: usize,
    /// Successful allocations
    pub allocated: usize,
    /// Released allocations
    pub released: usize,
    /// Allocations still held
    pub live: usize,
}

/// Scoped allocation; released when dropped
#[derive(Debug)]
pub struct Allocation {
    id: u64,
    tag: &'static str,
    size: usize,
    tracker: AllocTracker,
}

impl Allocation {
    /// Name of the structure this allocation backs
    pub fn tag(&self) -> &'static str {
        self.tag
    }

    /// Reserved size in bytes
    pub fn size(&self) -> usize {
        self.size
    }
}

impl Drop for Allocation {
    fn drop(&mut self) {
        self.tracker.release(self.id);
    }
}
