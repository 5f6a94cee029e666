//! In-memory adjacency over access paths for traversal queries.
//!
//! Built from the sourced (non-placeholder) active paths; sourceless
//! authorization edges cannot be traversed and are excluded here.

use std::collections::{HashMap, HashSet, VecDeque};

use chrono::{DateTime, Utc};
use keyspider_core::types::{AccessPath, ServerId};

#[derive(Debug, Clone)]
pub struct EdgeRef {
    pub path_id: i64,
    pub target: ServerId,
    pub first_seen_at: DateTime<Utc>,
}

/// Adjacency list over server ids.
pub struct AccessGraph {
    adjacency: HashMap<ServerId, Vec<EdgeRef>>,
}

impl AccessGraph {
    pub fn from_paths(paths: &[AccessPath]) -> Self {
        let mut adjacency: HashMap<ServerId, Vec<EdgeRef>> = HashMap::new();
        for path in paths {
            let Some(source) = path.source_server_id else {
                continue;
            };
            adjacency.entry(source).or_default().push(EdgeRef {
                path_id: path.id,
                target: path.target_server_id,
                first_seen_at: path.first_seen_at,
            });
        }
        Self { adjacency }
    }

    /// Shortest path by hop count, ties broken by the earliest
    /// `first_seen_at` on the connecting edge. `None` when unreachable.
    pub fn shortest_path(&self, from: ServerId, to: ServerId) -> Option<Vec<ServerId>> {
        if from == to {
            return Some(vec![from]);
        }

        let mut depth: HashMap<ServerId, u32> = HashMap::new();
        // parent[node] = (parent, edge first_seen) chosen deterministically.
        let mut parent: HashMap<ServerId, (ServerId, DateTime<Utc>)> = HashMap::new();
        let mut queue = VecDeque::new();

        depth.insert(from, 0);
        queue.push_back(from);

        while let Some(node) = queue.pop_front() {
            let node_depth = depth[&node];
            if node == to {
                break;
            }
            let Some(edges) = self.adjacency.get(&node) else {
                continue;
            };
            for edge in edges {
                match depth.get(&edge.target) {
                    None => {
                        depth.insert(edge.target, node_depth + 1);
                        parent.insert(edge.target, (node, edge.first_seen_at));
                        queue.push_back(edge.target);
                    }
                    Some(&d) if d == node_depth + 1 => {
                        // Same-depth alternative: keep the earlier edge.
                        let entry = parent.get_mut(&edge.target).expect("parent tracked");
                        if edge.first_seen_at < entry.1 {
                            *entry = (node, edge.first_seen_at);
                        }
                    }
                    Some(_) => {}
                }
            }
        }

        if !depth.contains_key(&to) {
            return None;
        }

        let mut path = vec![to];
        let mut current = to;
        while current != from {
            let (prev, _) = parent[&current];
            path.push(prev);
            current = prev;
        }
        path.reverse();
        Some(path)
    }

    /// Server ids within `max_depth` hops of `center`, following edges in
    /// both directions.
    pub fn neighborhood(
        &self,
        center: ServerId,
        max_depth: u32,
        reverse: &HashMap<ServerId, Vec<ServerId>>,
    ) -> HashSet<ServerId> {
        let mut visited = HashSet::new();
        let mut queue = VecDeque::new();
        visited.insert(center);
        queue.push_back((center, 0u32));

        while let Some((node, node_depth)) = queue.pop_front() {
            if node_depth >= max_depth {
                continue;
            }
            let forward = self
                .adjacency
                .get(&node)
                .into_iter()
                .flatten()
                .map(|e| e.target);
            let backward = reverse.get(&node).into_iter().flatten().copied();
            for next in forward.chain(backward) {
                if visited.insert(next) {
                    queue.push_back((next, node_depth + 1));
                }
            }
        }

        visited
    }
}

/// `target → sources` index for both-direction traversal.
pub fn reverse_index(paths: &[AccessPath]) -> HashMap<ServerId, Vec<ServerId>> {
    let mut reverse: HashMap<ServerId, Vec<ServerId>> = HashMap::new();
    for path in paths {
        if let Some(source) = path.source_server_id {
            reverse.entry(path.target_server_id).or_default().push(source);
        }
    }
    reverse
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn path(id: i64, source: i64, target: i64, first_seen_secs: i64) -> AccessPath {
        AccessPath {
            id,
            source_server_id: Some(ServerId(source)),
            target_server_id: ServerId(target),
            ssh_key_id: None,
            username: Some("root".to_string()),
            first_seen_at: Utc.timestamp_opt(1_700_000_000 + first_seen_secs, 0).unwrap(),
            last_seen_at: Utc.timestamp_opt(1_700_000_000 + first_seen_secs, 0).unwrap(),
            event_count: 1,
            is_active: true,
            is_authorized: false,
            is_used: true,
        }
    }

    /// 1 → 2 → 4, 1 → 3 → 4, plus a long way 1 → 5 → 6 → 4.
    fn diamond() -> Vec<AccessPath> {
        vec![
            path(1, 1, 2, 100),
            path(2, 1, 3, 50),
            path(3, 2, 4, 10),
            path(4, 3, 4, 5),
            path(5, 1, 5, 1),
            path(6, 5, 6, 1),
            path(7, 6, 4, 1),
        ]
    }

    #[test]
    fn shortest_path_prefers_fewest_hops() {
        let graph = AccessGraph::from_paths(&diamond());
        let found = graph.shortest_path(ServerId(1), ServerId(4)).unwrap();
        assert_eq!(found.len(), 3, "two-hop route beats the three-hop route");
        assert_eq!(found[0], ServerId(1));
        assert_eq!(found[2], ServerId(4));
    }

    #[test]
    fn equal_hops_tie_breaks_on_first_seen() {
        let graph = AccessGraph::from_paths(&diamond());
        let found = graph.shortest_path(ServerId(1), ServerId(4)).unwrap();
        // Both 1→2→4 and 1→3→4 are two hops; the final edge via 3 is older
        // (first_seen 5 vs 10), so 3 wins the tie.
        assert_eq!(found, vec![ServerId(1), ServerId(3), ServerId(4)]);
    }

    #[test]
    fn unreachable_and_self() {
        let graph = AccessGraph::from_paths(&diamond());
        assert!(graph.shortest_path(ServerId(4), ServerId(1)).is_none());
        assert_eq!(
            graph.shortest_path(ServerId(2), ServerId(2)),
            Some(vec![ServerId(2)])
        );
    }

    #[test]
    fn sourceless_paths_are_not_traversable() {
        let mut paths = diamond();
        paths.push(AccessPath {
            source_server_id: None,
            ..path(99, 1, 9, 0)
        });
        let graph = AccessGraph::from_paths(&paths);
        assert!(graph.shortest_path(ServerId(1), ServerId(9)).is_none());
    }

    #[test]
    fn neighborhood_follows_both_directions() {
        let paths = diamond();
        let graph = AccessGraph::from_paths(&paths);
        let reverse = reverse_index(&paths);

        let hop1 = graph.neighborhood(ServerId(4), 1, &reverse);
        // Incoming edges from 2, 3, and 6.
        assert_eq!(
            hop1,
            HashSet::from([ServerId(4), ServerId(2), ServerId(3), ServerId(6)])
        );

        let hop0 = graph.neighborhood(ServerId(4), 0, &reverse);
        assert_eq!(hop0, HashSet::from([ServerId(4)]));

        let hop2 = graph.neighborhood(ServerId(1), 2, &reverse);
        assert!(hop2.contains(&ServerId(4)));
        assert!(hop2.contains(&ServerId(6)));
    }

    #[test]
    fn bfs_terminates_on_cycles() {
        let mut paths = diamond();
        // Cycle back 4 → 1.
        paths.push(path(8, 4, 1, 0));
        let graph = AccessGraph::from_paths(&paths);
        let reverse = reverse_index(&paths);

        let found = graph.shortest_path(ServerId(1), ServerId(4)).unwrap();
        assert_eq!(found.len(), 3);

        let all = graph.neighborhood(ServerId(1), 10, &reverse);
        assert_eq!(all.len(), 6, "visited is bounded by distinct servers");
    }
}
