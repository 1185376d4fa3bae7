//! Epoch signalling
//!
//! An epoch answers "has anything changed since I last looked?" without
//! a round trip to the backend. There is one [`GlobalEpoch`] per host and
//! deployment, plus one epoch per database instance in
//! [`InstanceEpochStore`]. Both only ever grow.

pub mod atomic_file;
pub mod global;
pub mod instance;

pub use atomic_file::AtomicFileStore;
pub use global::{GlobalEpoch, MmapGlobalEpoch};
pub use instance::InstanceEpochStore;
