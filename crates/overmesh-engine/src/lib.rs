//! Overmesh dissemination engine.
//!
//! This crate provides:
//! - The sled-backed sync store with retention, sequence, and pruning rules
//! - The bloom filter driving sync selection
//! - The cooperative scheduler that owns all overlay state
//! - Overlay lifecycle (create/join/destroy, strikes, hard kill)
//! - The built-in meta message set
//! - The inbound pipeline and `store_update_forward`

pub mod bloom;
pub mod builtin;
pub mod community;
pub mod engine;
pub mod scheduler;
pub mod store;

#[cfg(test)]
mod scenarios;

pub use bloom::BloomFilter;
pub use community::{Disposition, MetaDef, MetaHandlers, Overlay, OverlayMode, STRIKE_LIMIT};
pub use engine::{
    Engine, EngineConfig, EngineError, EngineEvent, EngineStats, HandlerScope, Outgoing,
    OverlayBlueprint,
};
pub use scheduler::{EarlyShutdown, Scheduler, SHUTDOWN_GRACE, SHUTDOWN_PRIORITY_FLOOR};
pub use store::{InsertOutcome, StorageError, SyncMetaDescriptor, SyncSelection, SyncStore};
