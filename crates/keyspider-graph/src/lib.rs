//! keyspider-graph: projections and path queries over the access graph.
//!
//! Reads persisted observations from the store and produces node/edge
//! views: the full graph with layer filtering, server- and key-centred
//! subgraphs, and shortest-path queries between servers.

pub mod builder;
pub mod paths;
pub mod types;

pub use builder::GraphBuilder;
pub use types::{GraphEdge, GraphLayer, GraphNode, GraphResponse, NodeType, PathResponse};
