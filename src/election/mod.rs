//! Startup slot election
//!
//! Processes of one deployment race once, at startup, for a small-integer
//! slot. Slot 0 is the leader. See [`SlotAllocator`].

pub mod slot;

pub use slot::{SlotAllocator, PASSIVE_SLOT};
