//! Backend-independent parts of reference-aware reclamation.

use crate::error::MetadataResult;
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};

/// An upload as seen by the retention passes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, sqlx::FromRow)]
pub(crate) struct ReferenceNode {
    pub id: i64,
    pub repository_id: i64,
    pub expired: bool,
}

/// Read access to the package reference graph within a transaction.
#[async_trait]
pub(crate) trait ReferenceGraph: Send {
    /// Completed uploads that reference a package canonically provided by
    /// one of `providers`. Self references are excluded.
    async fn dependents(&mut self, providers: &[i64]) -> MetadataResult<Vec<ReferenceNode>>;
}

/// Uploads reached from a traversal root.
#[derive(Debug)]
pub(crate) struct Expansion {
    pub visited: BTreeMap<i64, ReferenceNode>,
    pub capped: bool,
}

impl Expansion {
    pub fn ids(&self) -> Vec<i64> {
        self.visited.keys().copied().collect()
    }

    /// Only an uncapped, fully expired component may be removed.
    pub fn deletable(&self) -> bool {
        !self.capped && self.visited.values().all(|node| node.expired)
    }

    pub fn repositories(&self) -> Vec<i64> {
        repositories_of(self.visited.values())
    }
}

/// Breadth-first expansion from `root` across "references a package I
/// provide" edges. Only expired uploads are expanded further; a live upload
/// already blocks deletion. Stops once `limit + 1` uploads are visited.
pub(crate) async fn expand<G: ReferenceGraph>(
    graph: &mut G,
    root: ReferenceNode,
    limit: u32,
) -> MetadataResult<Expansion> {
    let cap = limit as usize + 1;
    let mut visited = BTreeMap::from([(root.id, root)]);
    let mut frontier = if root.expired { vec![root.id] } else { Vec::new() };

    while !frontier.is_empty() && visited.len() < cap {
        let mut next = Vec::new();
        for node in graph.dependents(&frontier).await? {
            if visited.len() >= cap {
                break;
            }
            if visited.insert(node.id, node).is_none() && node.expired {
                next.push(node.id);
            }
        }
        frontier = next;
    }

    let capped = visited.len() >= cap;
    Ok(Expansion { visited, capped })
}

/// Sorted, de-duplicated repositories of `nodes`.
pub(crate) fn repositories_of<'a>(nodes: impl IntoIterator<Item = &'a ReferenceNode>) -> Vec<i64> {
    nodes
        .into_iter()
        .map(|node| node.repository_id)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    /// provider -> dependents
    struct FakeGraph {
        edges: HashMap<i64, Vec<ReferenceNode>>,
        calls: usize,
    }

    #[async_trait]
    impl ReferenceGraph for FakeGraph {
        async fn dependents(&mut self, providers: &[i64]) -> MetadataResult<Vec<ReferenceNode>> {
            self.calls += 1;
            Ok(providers
                .iter()
                .flat_map(|id| self.edges.get(id).cloned().unwrap_or_default())
                .collect())
        }
    }

    fn node(id: i64, expired: bool) -> ReferenceNode {
        ReferenceNode {
            id,
            repository_id: id % 2,
            expired,
        }
    }

    #[tokio::test]
    async fn test_expired_component_is_deletable() {
        let mut graph = FakeGraph {
            edges: HashMap::from([(2, vec![node(1, true)])]),
            calls: 0,
        };
        let expansion = expand(&mut graph, node(2, true), 10).await.unwrap();
        assert_eq!(expansion.ids(), vec![1, 2]);
        assert!(!expansion.capped);
        assert!(expansion.deletable());
        assert_eq!(expansion.repositories(), vec![0, 1]);
    }

    #[tokio::test]
    async fn test_live_dependent_blocks_deletion() {
        let mut graph = FakeGraph {
            edges: HashMap::from([(2, vec![node(1, false), node(3, true)])]),
            calls: 0,
        };
        let expansion = expand(&mut graph, node(2, true), 10).await.unwrap();
        assert_eq!(expansion.ids(), vec![1, 2, 3]);
        assert!(!expansion.deletable());
    }

    #[tokio::test]
    async fn test_limit_caps_traversal() {
        let dependents: Vec<_> = (10..20).map(|id| node(id, true)).collect();
        let mut graph = FakeGraph {
            edges: HashMap::from([(1, dependents)]),
            calls: 0,
        };
        let expansion = expand(&mut graph, node(1, true), 3).await.unwrap();
        assert_eq!(expansion.visited.len(), 4);
        assert!(expansion.capped);
        assert!(!expansion.deletable());
        assert_eq!(graph.calls, 1);
    }

    #[tokio::test]
    async fn test_cycles_terminate() {
        let mut graph = FakeGraph {
            edges: HashMap::from([(1, vec![node(2, true)]), (2, vec![node(1, true)])]),
            calls: 0,
        };
        let expansion = expand(&mut graph, node(1, true), 10).await.unwrap();
        assert_eq!(expansion.ids(), vec![1, 2]);
        assert!(expansion.deletable());
        assert_eq!(graph.calls, 2);
    }
}
