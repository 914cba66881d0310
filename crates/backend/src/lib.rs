//! Digests - batched notification delivery per timeline
//!
//! This crate provides:
//! - The `Digests` operations (add, schedule, digest, maintenance, delete)
//! - `Backend`, composing a timeline store with codec, backoff and project overrides
//! - `DummyBackend` for disabled deployments and tests
//! - Scoped `Digest` handles that commit only on successful delivery

pub mod backend;
pub mod digest;
pub mod dummy;
pub mod error;
pub mod project;
pub mod schedule;

// Re-exports
pub use backend::{AddOptions, Backend, Clock, Digests};
pub use digest::Digest;
pub use dummy::DummyBackend;
pub use error::BackendError;
pub use project::{AllProjects, ProjectConfig, ProjectSettings, StaticProjects};
pub use schedule::Schedule;
pub use timeline::DigestOutcome;

/// Result type for backend operations
pub type Result<T> = std::result::Result<T, BackendError>;
