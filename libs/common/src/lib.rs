//! Shared service plumbing for the well simulator workspace
//!
//! - logging bootstrap (console + optional daily-rolling file)
//! - shutdown signal handling
//! - SQLite connection helper

pub mod logging;
pub mod shutdown;
pub mod sqlite;

pub use sqlite::SqliteClient;
