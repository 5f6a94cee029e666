//! keyspider-agent: authenticated ingest service for on-host agents.
//!
//! Agents push heartbeats, auth events, sudo events, and key inventories
//! over HTTP with a bearer token. The server stores only the SHA256 of
//! each token; verification is a constant-time comparison over the hash.
//! Payloads merge through the same store ingest path as the SSH crawl.

pub mod auth;
pub mod routes;
pub mod schemas;

pub use routes::{router, AppState};
