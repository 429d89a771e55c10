//! SQLite backend for the roster patient store.
//!
//! Wraps [`tokio_rusqlite`] so all database access runs on a dedicated thread
//! without blocking the async runtime. Multi-row writes (merges, import
//! commits, identifier attachment) each run in one immediate transaction.

mod encode;
mod merge;
mod schema;
mod store;

pub mod error;

pub use error::{Error, Result};
pub use store::SqliteStore;
