//! Change log client.
//!
//! The durable change log itself is an external collaborator: an append-only
//! store of committed change events with per-target delivery bookkeeping.
//! This module defines the contract the pipeline consumes ([`ChangeLog`]),
//! a Postgres-backed client ([`PostgresChangeLog`]) and an in-memory client
//! for tests and development ([`InMemoryChangeLog`]).

pub mod in_memory;
pub mod postgres;
pub mod store;

pub use in_memory::InMemoryChangeLog;
pub use postgres::PostgresChangeLog;
pub use store::{ChangeLog, ChangeLogError, StuckEvent, TargetStats};
