//! Slot allocation
//!
//! ```text
//! try slot-00 → held elsewhere
//! try slot-01 → held elsewhere
//! try slot-02 → acquired        → SlotId = 2, kept until shutdown
//! ```
//!
//! Every attempt is non-blocking, so startup never waits on another
//! process. The slot is decided once and never renegotiated; a new leader
//! only appears when the process holding slot 0 exits and a new process
//! starts.

use crate::config::{CoordinationConfig, MAX_SLOTS};
use crate::sync::{LockAcquired, LockNamespace, NamedLockGuard};
use tracing::{info, warn};

/// Slot id of a process that holds no slot
pub const PASSIVE_SLOT: i32 = -1;

pub struct SlotAllocator {
    slot_id: i32,
    guard: Option<NamedLockGuard>,
}

impl SlotAllocator {
    /// Claim the lowest free slot for this process
    pub fn new(config: &CoordinationConfig) -> Self {
        let namespace = LockNamespace::resolve(config);
        Self::with_namespace(&namespace, config.slot_count)
    }

    pub fn with_namespace(namespace: &LockNamespace, slot_count: u32) -> Self {
        for slot in 0..slot_count.min(MAX_SLOTS) {
            let lock = namespace.open(&format!("slot-{:02}", slot));
            match lock.try_acquire() {
                Ok(Some(guard)) => {
                    if let LockAcquired::RecoveredFromAbandoned { previous_holder } =
                        guard.acquired()
                    {
                        warn!(slot, previous_holder = ?previous_holder, "Took over slot from a terminated process");
                    }
                    info!(slot, leader = slot == 0, scope = %namespace.scope(), "Slot acquired");
                    return Self {
                        slot_id: slot as i32,
                        guard: Some(guard),
                    };
                }
                Ok(None) => continue,
                Err(e) => {
                    warn!(slot, error = %e, "Slot lock unusable, skipping");
                    continue;
                }
            }
        }

        info!(slots = slot_count, "All slots taken, running passive");
        Self::passive()
    }

    /// An allocator that holds nothing
    pub fn passive() -> Self {
        Self {
            slot_id: PASSIVE_SLOT,
            guard: None,
        }
    }

    /// Held slot in `0..=31`, or [`PASSIVE_SLOT`]
    pub fn slot_id(&self) -> i32 {
        self.slot_id
    }

    pub fn is_leader(&self) -> bool {
        self.slot_id == 0
    }

    pub fn has_slot(&self) -> bool {
        self.slot_id >= 0
    }

    /// Give the slot back before process exit
    pub fn release(mut self) {
        if let Some(guard) = self.guard.take() {
            info!(slot = self.slot_id, "Releasing slot");
            drop(guard);
        }
    }
}

impl std::fmt::Debug for SlotAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlotAllocator")
            .field("slot_id", &self.slot_id)
            .field("leader", &self.is_leader())
            .finish()
    }
}
