//! Core types and trait definitions for patient identity resolution.
//!
//! This crate holds the domain model (patients, registry identifiers, search
//! history, merge plans, import changesets), the collaborator traits
//! ([`store::PatientStore`], [`registry::RegistryClient`],
//! [`dispatch::TaskDispatcher`]) and the logic that drives them: the
//! declarative step tables, the cascading search engine, the identity
//! reconciler and the import batch finaliser.
//!
//! It is deliberately free of HTTP, database and async-runtime dependencies.

// We intentionally use native `async fn` in traits (stabilised in Rust 1.75).
// Suppress the advisory lint about `Send` bounds on the returned futures.
#![allow(async_fn_in_trait)]

pub mod changeset;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod event;
pub mod merge;
pub mod patient;
pub mod pipeline;
pub mod reconcile;
pub mod registry;
pub mod search;
pub mod step_table;
pub mod store;

pub use error::{Error, Result};
