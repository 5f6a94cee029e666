//! keyspider-core: Shared types, configuration, and error handling for Keyspider.
//!
//! This crate provides the foundational pieces used across all Keyspider
//! components:
//! - Domain types (Server, SshKey, KeyLocation, AccessEvent, AccessPath, …)
//! - Observation event payloads for live streams and progress reporting
//! - The fingerprint codec for public key material
//! - Configuration management
//! - Common error types

pub mod config;
pub mod error;
pub mod events;
pub mod fingerprint;
pub mod types;

pub use error::KeyspiderError;
