//! Common utilities for integration tests

pub mod cli;

pub use cli::{wait_until, CommandResult, DigestdCommand, TestEnv};
