//! Registry of discovered nodes

use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde_json::{Map, Value};
use tokio::sync::Notify;

use rexec_core::RemoteNode;
use rexec_protocol::NodeId;

/// Nodes currently announcing themselves, keyed by node id
pub struct NodeRegistry {
    nodes: DashMap<NodeId, RemoteNode>,
    discovered: Notify,
}

impl NodeRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            nodes: DashMap::new(),
            discovered: Notify::new(),
        }
    }

    /// Record an announcement from `node_id`.
    ///
    /// Returns the node when it was not known before, so the caller can
    /// report it as found.
    pub fn upsert(
        &self,
        node_id: NodeId,
        data: Map<String, Value>,
        now: Instant,
    ) -> Option<RemoteNode> {
        let found = match self.nodes.entry(node_id) {
            Entry::Occupied(mut entry) => {
                entry.get_mut().refresh(data, now);
                None
            }
            Entry::Vacant(entry) => {
                let node = RemoteNode::new(entry.key().clone(), data, now);
                entry.insert(node.clone());
                Some(node)
            }
        };

        if found.is_some() {
            self.discovered.notify_waiters();
        }
        found
    }

    /// Get a node by id
    pub fn get(&self, node_id: &NodeId) -> Option<RemoteNode> {
        self.nodes.get(node_id).map(|r| r.value().clone())
    }

    /// All known nodes, oldest discovery first
    pub fn list(&self) -> Vec<RemoteNode> {
        let mut nodes: Vec<RemoteNode> = self.nodes.iter().map(|r| r.value().clone()).collect();
        nodes.sort_by_key(|node| node.first_seen);
        nodes
    }

    /// The node discovered earliest among those still known
    pub fn first(&self) -> Option<RemoteNode> {
        self.nodes
            .iter()
            .min_by_key(|r| r.first_seen)
            .map(|r| r.value().clone())
    }

    /// Remove every node silent for longer than `timeout`.
    ///
    /// Each node is removed by exactly one caller, so concurrent sweeps never
    /// report the same node twice.
    pub fn remove_expired(&self, now: Instant, timeout: Duration) -> Vec<RemoteNode> {
        let candidates: Vec<NodeId> = self
            .nodes
            .iter()
            .filter(|r| r.is_expired(now, timeout))
            .map(|r| r.key().clone())
            .collect();

        candidates
            .into_iter()
            .filter_map(|id| {
                self.nodes
                    .remove_if(&id, |_, node| node.is_expired(now, timeout))
                    .map(|(_, node)| node)
            })
            .collect()
    }

    /// Wait until at least one node is known or `deadline` passes
    pub async fn wait_for_first(&self, deadline: tokio::time::Instant) -> Option<RemoteNode> {
        loop {
            let notified = self.discovered.notified();
            tokio::pin!(notified);
            // Register before checking so a discovery in between is not missed
            notified.as_mut().enable();

            if let Some(node) = self.first() {
                return Some(node);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.first();
            }
        }
    }

    /// Forget every node
    pub fn clear(&self) {
        self.nodes.clear();
    }

    /// Number of known nodes
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Check if no node is known
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

impl Default for NodeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn metadata(project: &str) -> Map<String, Value> {
        match json!({ "project_name": project }) {
            Value::Object(map) => map,
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_upsert_reports_new_nodes_once() {
        let registry = NodeRegistry::new();
        let now = Instant::now();

        let found = registry.upsert(NodeId::new("a"), metadata("Foo"), now);
        assert_eq!(found.unwrap().project_name(), Some("Foo"));

        let later = now + Duration::from_secs(1);
        assert!(registry.upsert(NodeId::new("a"), metadata("Bar"), later).is_none());

        let node = registry.get(&NodeId::new("a")).unwrap();
        assert_eq!(node.project_name(), Some("Bar"));
        assert_eq!(node.first_seen, now);
        assert_eq!(node.last_seen, later);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_first_is_earliest_discovery() {
        let registry = NodeRegistry::new();
        let now = Instant::now();

        registry.upsert(NodeId::new("b"), Map::new(), now);
        registry.upsert(NodeId::new("a"), Map::new(), now + Duration::from_millis(10));
        // A refresh must not change the ordering
        registry.upsert(NodeId::new("b"), Map::new(), now + Duration::from_millis(20));

        assert_eq!(registry.first().unwrap().node_id.as_str(), "b");
        let ids: Vec<_> = registry
            .list()
            .into_iter()
            .map(|n| n.node_id.to_string())
            .collect();
        assert_eq!(ids, vec!["b", "a"]);
    }

    #[test]
    fn test_remove_expired_only_once() {
        let registry = NodeRegistry::new();
        let now = Instant::now();
        let timeout = Duration::from_secs(5);

        registry.upsert(NodeId::new("stale"), Map::new(), now);
        registry.upsert(NodeId::new("fresh"), Map::new(), now + Duration::from_secs(4));

        // Exactly at the timeout the node is still alive
        assert!(registry
            .remove_expired(now + timeout, timeout)
            .is_empty());

        let removed = registry.remove_expired(now + Duration::from_secs(6), timeout);
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].node_id.as_str(), "stale");

        assert!(registry
            .remove_expired(now + Duration::from_secs(6), timeout)
            .is_empty());
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_wait_for_first_wakes_on_discovery() {
        let registry = std::sync::Arc::new(NodeRegistry::new());

        let waiter = {
            let registry = registry.clone();
            tokio::spawn(async move {
                let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
                registry.wait_for_first(deadline).await
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        registry.upsert(NodeId::new("a"), Map::new(), Instant::now());

        let node = waiter.await.unwrap().unwrap();
        assert_eq!(node.node_id.as_str(), "a");
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_first_times_out() {
        let registry = NodeRegistry::new();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(1);
        assert!(registry.wait_for_first(deadline).await.is_none());
    }
}
