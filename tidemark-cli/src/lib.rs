//! Tidemark Migration Library
//!
//! File discovery and command handlers for the `tidemark` CLI. The binary
//! (main.rs) only parses arguments, sets up logging and reports errors.

pub mod commands;
pub mod discover;

pub use discover::{discover_migrations, DiscoverError, MigrationFile};
