//! Projects persisted observations into node/edge graphs.

use std::collections::{HashMap, HashSet};

use keyspider_core::types::{
    AccessPath, Server, ServerId, SshKey, SshKeyId, UnreachableSource,
};
use keyspider_store::{Store, StoreError};

use crate::paths::{reverse_index, AccessGraph};
use crate::types::{GraphEdge, GraphLayer, GraphNode, GraphResponse, NodeType, PathResponse};

/// Synthetic source node id for authorization edges whose source host is
/// not yet known.
const UNKNOWN_NODE_ID: &str = "unknown";

pub struct GraphBuilder {
    store: Store,
}

impl GraphBuilder {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// The full access graph, filtered to a layer.
    ///
    /// Server nodes always appear; unacknowledged unreachable sources are
    /// added as synthetic nodes with an edge to their target. Sourceless
    /// authorization edges hang off a shared `unknown` placeholder node so
    /// dormant keys stay visible in the authorization layer.
    pub fn build_graph(&self, layer: GraphLayer) -> Result<GraphResponse, StoreError> {
        let servers = self.store.list_servers()?;
        let stats = self.store.server_stats()?;
        let paths = filter_layer(self.store.list_active_paths()?, layer);
        let key_types = self.key_types_for(&paths)?;

        let mut nodes: HashMap<String, GraphNode> = HashMap::new();
        for server in &servers {
            let node = server_node(server, &stats);
            nodes.insert(node.id.clone(), node);
        }

        let mut edges: Vec<GraphEdge> = Vec::new();
        let mut need_unknown = false;
        for path in &paths {
            match path.source_server_id {
                Some(_) => edges.push(path_edge(path, &key_types)),
                None => {
                    need_unknown = true;
                    let mut edge = path_edge(path, &key_types);
                    edge.source = UNKNOWN_NODE_ID.to_string();
                    edges.push(edge);
                }
            }
        }
        if need_unknown {
            nodes.insert(UNKNOWN_NODE_ID.to_string(), unknown_node());
        }

        for unreachable in self.store.list_unreachable(true)? {
            let node = unreachable_node(&unreachable);
            edges.push(unreachable_edge(&unreachable));
            nodes.insert(node.id.clone(), node);
        }

        let mut node_list: Vec<GraphNode> = nodes.into_values().collect();
        node_list.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(GraphResponse::new(node_list, edges))
    }

    /// Subgraph within `depth` hops of a server, both directions.
    pub fn server_subgraph(
        &self,
        server_id: ServerId,
        depth: u32,
    ) -> Result<GraphResponse, StoreError> {
        let all_paths = self.store.list_active_paths()?;
        let graph = AccessGraph::from_paths(&all_paths);
        let reverse = reverse_index(&all_paths);
        let members = graph.neighborhood(server_id, depth, &reverse);

        let stats = self.store.server_stats()?;
        let mut nodes: HashMap<String, GraphNode> = HashMap::new();
        for id in &members {
            if let Ok(server) = self.store.get_server(*id) {
                let node = server_node(&server, &stats);
                nodes.insert(node.id.clone(), node);
            }
        }

        let in_scope: Vec<AccessPath> = all_paths
            .into_iter()
            .filter(|p| {
                p.source_server_id
                    .map(|s| members.contains(&s) && members.contains(&p.target_server_id))
                    .unwrap_or(false)
            })
            .collect();
        let key_types = self.key_types_for(&in_scope)?;
        let mut edges: Vec<GraphEdge> = in_scope
            .iter()
            .map(|p| path_edge(p, &key_types))
            .collect();

        for unreachable in self.store.list_unreachable(true)? {
            if members.contains(&unreachable.target_server_id) {
                let node = unreachable_node(&unreachable);
                edges.push(unreachable_edge(&unreachable));
                nodes.insert(node.id.clone(), node);
            }
        }

        let mut node_list: Vec<GraphNode> = nodes.into_values().collect();
        node_list.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(GraphResponse::new(node_list, edges))
    }

    /// All edges carrying one key, plus incident server nodes.
    pub fn key_subgraph(&self, key_id: SshKeyId) -> Result<GraphResponse, StoreError> {
        let paths = self.store.paths_for_key(key_id)?;
        let key_types = self.key_types_for(&paths)?;
        let stats = self.store.server_stats()?;

        let mut nodes: HashMap<String, GraphNode> = HashMap::new();
        let mut edges: Vec<GraphEdge> = Vec::new();
        let mut need_unknown = false;

        for path in &paths {
            let mut incident = vec![path.target_server_id];
            if let Some(source) = path.source_server_id {
                incident.push(source);
                edges.push(path_edge(path, &key_types));
            } else {
                need_unknown = true;
                let mut edge = path_edge(path, &key_types);
                edge.source = UNKNOWN_NODE_ID.to_string();
                edges.push(edge);
            }
            for id in incident {
                if let Ok(server) = self.store.get_server(id) {
                    let node = server_node(&server, &stats);
                    nodes.insert(node.id.clone(), node);
                }
            }
        }
        if need_unknown {
            nodes.insert(UNKNOWN_NODE_ID.to_string(), unknown_node());
        }

        let mut node_list: Vec<GraphNode> = nodes.into_values().collect();
        node_list.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(GraphResponse::new(node_list, edges))
    }

    /// Shortest path between two servers (fewest hops, ties broken by the
    /// earliest edge), with the supporting subgraph.
    pub fn find_path(
        &self,
        from: ServerId,
        to: ServerId,
    ) -> Result<PathResponse, StoreError> {
        let all_paths = self.store.list_active_paths()?;
        let graph = AccessGraph::from_paths(&all_paths);

        let Some(found) = graph.shortest_path(from, to) else {
            return Ok(PathResponse::default());
        };

        let members: HashSet<ServerId> = found.iter().copied().collect();
        let in_scope: Vec<AccessPath> = all_paths
            .into_iter()
            .filter(|p| {
                p.source_server_id
                    .map(|s| members.contains(&s) && members.contains(&p.target_server_id))
                    .unwrap_or(false)
            })
            .collect();
        let key_types = self.key_types_for(&in_scope)?;
        let stats = self.store.server_stats()?;

        let mut nodes = Vec::new();
        for id in &found {
            if let Ok(server) = self.store.get_server(*id) {
                nodes.push(server_node(&server, &stats));
            }
        }
        let edges: Vec<GraphEdge> = in_scope
            .iter()
            .map(|p| path_edge(p, &key_types))
            .collect();

        Ok(PathResponse {
            paths: vec![found.iter().map(|id| format!("server-{id}")).collect()],
            graph: GraphResponse::new(nodes, edges),
        })
    }

    fn key_types_for(
        &self,
        paths: &[AccessPath],
    ) -> Result<HashMap<SshKeyId, SshKey>, StoreError> {
        let ids: HashSet<SshKeyId> = paths.iter().filter_map(|p| p.ssh_key_id).collect();
        self.store.keys_by_ids(&ids)
    }
}

fn filter_layer(paths: Vec<AccessPath>, layer: GraphLayer) -> Vec<AccessPath> {
    match layer {
        GraphLayer::All => paths,
        GraphLayer::Authorization => paths.into_iter().filter(|p| p.is_authorized).collect(),
        GraphLayer::Usage => paths.into_iter().filter(|p| p.is_used).collect(),
    }
}

fn server_node(server: &Server, stats: &HashMap<ServerId, (i64, i64)>) -> GraphNode {
    let (key_count, event_count) = stats.get(&server.id).copied().unwrap_or((0, 0));
    GraphNode {
        id: format!("server-{}", server.id),
        label: server.hostname.clone(),
        node_type: NodeType::Server,
        ip_address: Some(server.ip_address.clone()),
        os_type: Some(server.os_type.as_str().to_string()),
        is_reachable: server.is_reachable,
        key_count,
        event_count,
    }
}

fn unknown_node() -> GraphNode {
    GraphNode {
        id: UNKNOWN_NODE_ID.to_string(),
        label: "unknown source".to_string(),
        node_type: NodeType::Unreachable,
        ip_address: None,
        os_type: None,
        is_reachable: false,
        key_count: 0,
        event_count: 0,
    }
}

fn unreachable_node(unreachable: &UnreachableSource) -> GraphNode {
    GraphNode {
        id: format!("unreachable-{}", unreachable.id),
        label: unreachable
            .reverse_dns
            .clone()
            .unwrap_or_else(|| unreachable.source_ip.clone()),
        node_type: NodeType::Unreachable,
        ip_address: Some(unreachable.source_ip.clone()),
        os_type: None,
        is_reachable: false,
        key_count: 0,
        event_count: unreachable.event_count,
    }
}

fn unreachable_edge(unreachable: &UnreachableSource) -> GraphEdge {
    GraphEdge {
        id: format!("ur-edge-{}", unreachable.id),
        source: format!("unreachable-{}", unreachable.id),
        target: format!("server-{}", unreachable.target_server_id),
        label: Some(format!(
            "{} ({})",
            unreachable.severity.as_str(),
            unreachable.event_count
        )),
        key_type: None,
        username: unreachable.username.clone(),
        event_count: unreachable.event_count,
        is_active: true,
        is_authorized: false,
        is_used: false,
    }
}

fn path_edge(path: &AccessPath, key_types: &HashMap<SshKeyId, SshKey>) -> GraphEdge {
    GraphEdge {
        id: format!("path-{}", path.id),
        source: path
            .source_server_id
            .map(|s| format!("server-{s}"))
            .unwrap_or_else(|| UNKNOWN_NODE_ID.to_string()),
        target: format!("server-{}", path.target_server_id),
        label: path.username.clone(),
        key_type: path
            .ssh_key_id
            .and_then(|id| key_types.get(&id))
            .map(|k| k.key_type.as_str().to_string()),
        username: path.username.clone(),
        event_count: path.event_count,
        is_active: path.is_active,
        is_authorized: path.is_authorized,
        is_used: path.is_used,
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use keyspider_core::types::{FileType, KeyType, OsType, Severity};
    use keyspider_store::{ingest, NewAccessEvent, NewKeyObservation};

    use super::*;

    fn seed_store() -> (Store, ServerId, ServerId) {
        let store = Store::open_in_memory().unwrap();
        let src = store
            .upsert_server("jump", "10.0.0.1", 22, OsType::Linux, Some("manual"))
            .unwrap()
            .id;
        let dst = store
            .upsert_server("web1", "10.0.0.2", 22, OsType::Linux, Some("scan"))
            .unwrap()
            .id;
        (store, src, dst)
    }

    fn accepted(source_ip: &str, user: &str, fp: &str) -> NewAccessEvent {
        NewAccessEvent {
            source_ip: source_ip.to_string(),
            username: user.to_string(),
            auth_method: Some(keyspider_core::types::AuthMethod::Publickey),
            event_type: keyspider_core::types::EventType::Accepted,
            fingerprint: Some(fp.to_string()),
            event_time: Utc::now(),
            raw_log_line: String::new(),
            log_source: keyspider_core::types::LogSource::Syslog,
        }
    }

    fn authorized(fp: &str, owner: &str) -> NewKeyObservation {
        NewKeyObservation {
            fingerprint_sha256: fp.to_string(),
            fingerprint_md5: None,
            key_type: KeyType::Ed25519,
            key_bits: Some(256),
            public_key_data: None,
            comment: None,
            is_host_key: false,
            file_path: format!("/home/{owner}/.ssh/authorized_keys"),
            file_type: FileType::AuthorizedKeys,
            unix_owner: Some(owner.to_string()),
            unix_perms: Some("0600".to_string()),
            file_mtime: None,
            file_size: None,
        }
    }

    #[test]
    fn full_graph_has_nodes_and_layered_edges() {
        let (store, _src, dst) = seed_store();
        ingest::ingest_keys(&store, dst, &[authorized("SHA256:auth", "deploy")]).unwrap();
        ingest::ingest_events(&store, dst, &[accepted("10.0.0.1", "deploy", "SHA256:used")], None)
            .unwrap();

        let builder = GraphBuilder::new(store);

        let all = builder.build_graph(GraphLayer::All).unwrap();
        assert!(all.node_count >= 2);
        assert_eq!(all.edge_count, 2);

        let auth = builder.build_graph(GraphLayer::Authorization).unwrap();
        let auth_edges: Vec<_> = auth.edges.iter().filter(|e| e.is_authorized).collect();
        assert_eq!(auth_edges.len(), 1);
        // The dormant edge hangs off the unknown placeholder node.
        assert_eq!(auth_edges[0].source, "unknown");
        assert!(auth.nodes.iter().any(|n| n.id == "unknown"));

        let usage = builder.build_graph(GraphLayer::Usage).unwrap();
        assert_eq!(usage.edge_count, 1);
        assert!(usage.edges[0].is_used);
        assert!(!usage.edges[0].is_authorized);
    }

    #[test]
    fn edge_carries_key_type_and_counts() {
        let (store, src, dst) = seed_store();
        ingest::ingest_keys(&store, dst, &[authorized("SHA256:k", "deploy")]).unwrap();
        ingest::ingest_events(
            &store,
            dst,
            &[
                accepted("10.0.0.1", "deploy", "SHA256:k"),
                accepted("10.0.0.1", "deploy", "SHA256:k"),
            ],
            None,
        )
        .unwrap();
        ingest::cross_reference(&store, dst).unwrap();

        let builder = GraphBuilder::new(store);
        let usage = builder.build_graph(GraphLayer::Usage).unwrap();
        let edge = usage
            .edges
            .iter()
            .find(|e| e.source == format!("server-{src}"))
            .unwrap();
        assert_eq!(edge.key_type.as_deref(), Some("ed25519"));
        assert!(edge.is_used && edge.is_authorized);
        assert_eq!(edge.username.as_deref(), Some("deploy"));
    }

    #[test]
    fn unreachable_sources_become_nodes() {
        let (store, _src, dst) = seed_store();
        store
            .upsert_unreachable_source(
                "203.0.113.7",
                dst,
                Some("root"),
                None,
                None,
                Some("bastion.partner.example"),
                Severity::Critical,
            )
            .unwrap();

        let builder = GraphBuilder::new(store);
        let graph = builder.build_graph(GraphLayer::All).unwrap();

        let node = graph
            .nodes
            .iter()
            .find(|n| n.node_type == NodeType::Unreachable && n.id.starts_with("unreachable-"))
            .unwrap();
        assert_eq!(node.label, "bastion.partner.example");
        assert!(!node.is_reachable);

        let edge = graph
            .edges
            .iter()
            .find(|e| e.id.starts_with("ur-edge-"))
            .unwrap();
        assert_eq!(edge.target, format!("server-{dst}"));
        assert_eq!(edge.label.as_deref(), Some("critical (1)"));
    }

    #[test]
    fn server_subgraph_respects_depth() {
        let (store, src, dst) = seed_store();
        let far = store
            .upsert_server("db1", "10.0.0.3", 22, OsType::Linux, Some("scan"))
            .unwrap()
            .id;
        // src → dst → far
        ingest::ingest_events(&store, dst, &[accepted("10.0.0.1", "a", "SHA256:x")], None).unwrap();
        ingest::ingest_events(&store, far, &[accepted("10.0.0.2", "b", "SHA256:y")], None).unwrap();

        let builder = GraphBuilder::new(store);

        let near = builder.server_subgraph(src, 1).unwrap();
        assert!(near.nodes.iter().any(|n| n.id == format!("server-{dst}")));
        assert!(!near.nodes.iter().any(|n| n.id == format!("server-{far}")));

        let wide = builder.server_subgraph(src, 2).unwrap();
        assert!(wide.nodes.iter().any(|n| n.id == format!("server-{far}")));
        assert_eq!(wide.edge_count, 2);
    }

    #[test]
    fn key_subgraph_collects_incident_nodes() {
        let (store, src, dst) = seed_store();
        ingest::ingest_keys(&store, dst, &[authorized("SHA256:k", "deploy")]).unwrap();
        ingest::ingest_events(&store, dst, &[accepted("10.0.0.1", "deploy", "SHA256:k")], None)
            .unwrap();

        let key = store.find_key_by_fingerprint("SHA256:k").unwrap().unwrap();
        let builder = GraphBuilder::new(store);
        let graph = builder.key_subgraph(key.id).unwrap();

        assert!(graph.edge_count >= 1);
        assert!(graph.nodes.iter().any(|n| n.id == format!("server-{src}")));
        assert!(graph.nodes.iter().any(|n| n.id == format!("server-{dst}")));
    }

    #[test]
    fn find_path_returns_route_and_subgraph() {
        let (store, src, dst) = seed_store();
        let far = store
            .upsert_server("db1", "10.0.0.3", 22, OsType::Linux, Some("scan"))
            .unwrap()
            .id;
        ingest::ingest_events(&store, dst, &[accepted("10.0.0.1", "a", "SHA256:x")], None).unwrap();
        ingest::ingest_events(&store, far, &[accepted("10.0.0.2", "b", "SHA256:y")], None).unwrap();

        let builder = GraphBuilder::new(store);
        let response = builder.find_path(src, far).unwrap();
        assert_eq!(response.paths.len(), 1);
        assert_eq!(
            response.paths[0],
            vec![
                format!("server-{src}"),
                format!("server-{dst}"),
                format!("server-{far}")
            ]
        );
        assert_eq!(response.graph.node_count, 3);

        let none = builder.find_path(far, src).unwrap();
        assert!(none.paths.is_empty());
    }
}
