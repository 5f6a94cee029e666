//! keyspider-scan: the discovery and correlation engine.
//!
//! Log parsing, key scanning, unreachable detection, the spider crawl, and
//! the live watcher. Everything network-facing goes through the
//! `keyspider-ssh` traits; everything persistent goes through
//! `keyspider-store`.

pub mod error;
pub mod key_scanner;
pub mod log_parser;
pub mod spider;
pub mod unreachable;
pub mod watcher;

pub use error::ScanError;
pub use spider::SpiderEngine;
pub use watcher::Watcher;
