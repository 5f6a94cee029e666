//! Graph response shapes.

use serde::{Deserialize, Serialize};

/// Which layer of edges a query returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GraphLayer {
    /// Union of both layers, flags preserved.
    #[default]
    All,
    /// Keys present on disk; includes dormant keys.
    Authorization,
    /// Observed logins; includes mystery keys.
    Usage,
}

impl GraphLayer {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "all" => Some(Self::All),
            "authorization" => Some(Self::Authorization),
            "usage" => Some(Self::Usage),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeType {
    Server,
    Unreachable,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphNode {
    pub id: String,
    pub label: String,
    #[serde(rename = "type")]
    pub node_type: NodeType,
    pub ip_address: Option<String>,
    pub os_type: Option<String>,
    pub is_reachable: bool,
    pub key_count: i64,
    pub event_count: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphEdge {
    pub id: String,
    pub source: String,
    pub target: String,
    pub label: Option<String>,
    pub key_type: Option<String>,
    pub username: Option<String>,
    pub event_count: i64,
    pub is_active: bool,
    pub is_authorized: bool,
    pub is_used: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GraphResponse {
    pub nodes: Vec<GraphNode>,
    pub edges: Vec<GraphEdge>,
    pub node_count: usize,
    pub edge_count: usize,
}

impl GraphResponse {
    pub fn new(nodes: Vec<GraphNode>, edges: Vec<GraphEdge>) -> Self {
        let node_count = nodes.len();
        let edge_count = edges.len();
        Self {
            nodes,
            edges,
            node_count,
            edge_count,
        }
    }
}

/// A path query result: node-id paths plus the supporting subgraph.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PathResponse {
    pub paths: Vec<Vec<String>>,
    pub graph: GraphResponse,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layer_parsing() {
        assert_eq!(GraphLayer::parse("all"), Some(GraphLayer::All));
        assert_eq!(GraphLayer::parse("authorization"), Some(GraphLayer::Authorization));
        assert_eq!(GraphLayer::parse("usage"), Some(GraphLayer::Usage));
        assert_eq!(GraphLayer::parse("bogus"), None);
    }

    #[test]
    fn response_shape() {
        let response = GraphResponse::new(
            vec![GraphNode {
                id: "server-1".to_string(),
                label: "web1".to_string(),
                node_type: NodeType::Server,
                ip_address: Some("10.0.0.1".to_string()),
                os_type: Some("linux".to_string()),
                is_reachable: true,
                key_count: 3,
                event_count: 12,
            }],
            vec![],
        );

        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["node_count"], 1);
        assert_eq!(json["edge_count"], 0);
        assert_eq!(json["nodes"][0]["type"], "server");
    }
}
