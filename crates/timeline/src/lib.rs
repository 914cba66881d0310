//! Timeline storage for the digest scheduler
//!
//! This crate provides:
//! - The `TimelineStore` trait: per-timeline record sets plus the global
//!   waiting/ready schedule indexes, every mutation atomic per timeline
//! - `SledStore`: durable store on the sled embedded database
//! - `MemoryStore`: in-process store for tests and embedding

pub mod keys;
pub mod memory;
pub mod meta;
pub mod sled_store;
pub mod store;

// Re-exports
pub use memory::MemoryStore;
pub use sled_store::SledStore;
pub use store::{
    Batch, DigestOutcome, DigestSnapshot, SchedulePolicy, StoreError, TimelineStore,
};

/// Result type for store operations
pub type Result<T> = std::result::Result<T, StoreError>;
