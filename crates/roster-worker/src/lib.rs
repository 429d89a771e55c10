//! Runtime collaborators for the roster pipeline.
//!
//! Provides the concrete pieces `roster-core` only describes as traits: an
//! HTTP [`registry::HttpRegistryClient`], the [`throttle::Throttled`]
//! wrapper that enforces the registry's global rate limit, and the
//! in-process [`queue::JobQueue`] that implements
//! [`roster_core::dispatch::TaskDispatcher`] and feeds the worker loops. The
//! `server` binary wires them to a [`roster_store_sqlite::SqliteStore`] and
//! the [`roster_api`] router.

pub mod config;
pub mod error;
pub mod queue;
pub mod registry;
pub mod throttle;


pub use config::ServerConfig;
pub use error::{Error, Result};
