//! keyspider-store: SQLite persistence for Keyspider observations.
//!
//! This crate is the single mutation point for the access graph tables.
//! The crawl and watch pipelines write observations through it; the graph
//! builder and reports read from it. All writes are idempotent upserts so
//! retries and re-scans are safe.

pub mod ingest;
pub mod mutations;
pub mod queries;
pub mod store;

pub use ingest::{EventOutcome, KeysOutcome, NewAccessEvent, NewKeyObservation};
pub use store::{Store, StoreError};
