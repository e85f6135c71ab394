//! # revstore - Append-Only Resource Store
//!
//! revstore backs a Kubernetes-style aggregated API server with a SQL
//! database. Clients CRUD named, optionally namespaced objects and
//! subscribe to a strictly-ordered change feed. All state lives in the
//! database: no in-memory index, no in-process consensus.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     Strategy (per kind)                         │
//! │     create / get / update / delete / list / watch               │
//! │     encoding, generations, broadcast, compaction ticker         │
//! └─────────────────────────────┬───────────────────────────────────┘
//!                               │
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     Record layer (db)                           │
//! │     append-only log keyed by monotonic id,                      │
//! │     optimistic concurrency on the previous-id chain             │
//! └─────────────────────────────┬───────────────────────────────────┘
//!                               │
//!                               ▼
//!                         ┌───────────┐
//!                         │  SQLite   │
//!                         └───────────┘
//! ```
//!
//! ## Core Invariants
//!
//! 1. Row ids are strictly monotonic within a kind and never reused; the
//!    id *is* the object's resource version.
//! 2. Any revision can be superseded at most once (`UNIQUE(previous_id)`),
//!    which is the whole of optimistic concurrency.
//! 3. At most one creation row exists per live name.
//! 4. A tombstone ends a lifetime; the name can then be created again.
//! 5. Compaction never touches the newest row of a live object, nor any
//!    row above the watermark.
//!
//! ## Module Organization
//!
//! - [`error`]: the error taxonomy surfaced to the REST layer
//! - [`types`]: the object seam - [`Object`], [`ObjectMeta`], options,
//!   events
//! - `statements`: SQL templates per operation
//! - `db`: the record layer over the connection thread
//! - `listiter`: the restartable paginating iterator
//! - [`strategy`]: object-level operations and the watch loop
//! - [`stores`]: capability façades composed from strategy operations
//! - `factory`: database opening and per-kind strategy construction

pub mod error;
mod factory;
pub mod stores;
pub mod strategy;
pub mod types;

mod db;
mod listiter;
mod statements;

pub use error::{Error, Result};
pub use factory::Factory;
pub use strategy::{Strategy, Watcher};
pub use types::{ListOptions, Object, ObjectList, ObjectMeta, Predicate, WatchEvent};
