//! Hop selection: choosing one upstream node
//!
//! A hop maps selection hints (sniffed protocol, target host, client
//! id) to a single node. Dead nodes, per their markers, are skipped;
//! the handler feeds dial outcomes back through the marker.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::sniff::Protocol;

use super::node::Node;

/// Hints narrowing node selection.
#[derive(Debug, Clone, Default)]
pub struct SelectHints {
    pub protocol: Option<Protocol>,
    pub host: Option<String>,
    pub client_id: Option<String>,
}

impl SelectHints {
    pub fn with_protocol(mut self, protocol: Option<Protocol>) -> Self {
        self.protocol = protocol;
        self
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }
}

/// Upstream node selector.
///
/// Returning `None` signals that no node is currently eligible.
#[async_trait]
pub trait Hop: Send + Sync {
    async fn select(&self, hints: &SelectHints) -> Option<Arc<Node>>;
}

/// Node selection strategy identifier, used in configuration files.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    #[default]
    RoundRobin,
    Random,
    /// Stable choice keyed on the target host, for sticky routing.
    HostHash,
}

/// A named group of candidate nodes with a selection strategy.
pub struct NodeGroup {
    nodes: Vec<Arc<Node>>,
    strategy: Strategy,
    counter: AtomicUsize,
}

impl NodeGroup {
    pub fn new(nodes: Vec<Arc<Node>>, strategy: Strategy) -> Self {
        Self {
            nodes,
            strategy,
            counter: AtomicUsize::new(0),
        }
    }

    pub fn nodes(&self) -> &[Arc<Node>] {
        &self.nodes
    }

    fn eligible(&self, hints: &SelectHints) -> Vec<&Arc<Node>> {
        self.nodes
            .iter()
            .filter(|node| !node.marker().is_dead())
            .filter(|node| node.filter().matches_protocol(hints.protocol))
            .filter(|node| match &hints.host {
                Some(host) => node.filter().matches_host(host),
                None => node.filter().host.is_none(),
            })
            .collect()
    }
}

#[async_trait]
impl Hop for NodeGroup {
    async fn select(&self, hints: &SelectHints) -> Option<Arc<Node>> {
        let candidates = self.eligible(hints);
        if candidates.is_empty() {
            return None;
        }

        let index = match self.strategy {
            Strategy::RoundRobin => self.counter.fetch_add(1, Ordering::Relaxed) % candidates.len(),
            Strategy::Random => rand::thread_rng().gen_range(0..candidates.len()),
            Strategy::HostHash => {
                let mut hasher = DefaultHasher::new();
                hints.host.hash(&mut hasher);
                hasher.finish() as usize % candidates.len()
            }
        };

        Some(candidates[index].clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::node::NodeFilter;

    fn node(name: &str) -> Arc<Node> {
        Arc::new(Node::new(name, format!("{}:1080", name).parse().unwrap()))
    }

    #[tokio::test]
    async fn test_round_robin_cycles() {
        let group = NodeGroup::new(vec![node("a"), node("b"), node("c")], Strategy::RoundRobin);

        let hints = SelectHints::default();
        let picks: Vec<_> = vec![
            group.select(&hints).await.unwrap().name().to_string(),
            group.select(&hints).await.unwrap().name().to_string(),
            group.select(&hints).await.unwrap().name().to_string(),
            group.select(&hints).await.unwrap().name().to_string(),
        ];
        assert_eq!(picks, vec!["a", "b", "c", "a"]);
    }

    #[tokio::test]
    async fn test_dead_nodes_skipped() {
        let a = node("a");
        let b = node("b");
        for _ in 0..3 {
            a.marker().mark();
        }

        let group = NodeGroup::new(vec![a.clone(), b], Strategy::RoundRobin);
        let hints = SelectHints::default();
        for _ in 0..4 {
            assert_eq!(group.select(&hints).await.unwrap().name(), "b");
        }

        a.marker().reset();
        let names: Vec<_> = vec![
            group.select(&hints).await.unwrap().name().to_string(),
            group.select(&hints).await.unwrap().name().to_string(),
        ];
        assert!(names.contains(&"a".to_string()));
    }

    #[tokio::test]
    async fn test_all_dead_selects_none() {
        let a = node("a");
        for _ in 0..3 {
            a.marker().mark();
        }
        let group = NodeGroup::new(vec![a], Strategy::Random);
        assert!(group.select(&SelectHints::default()).await.is_none());
    }

    #[tokio::test]
    async fn test_host_hash_is_sticky() {
        let group = NodeGroup::new(vec![node("a"), node("b"), node("c")], Strategy::HostHash);
        let hints = SelectHints::default().with_host("example.com");

        let first = group.select(&hints).await.unwrap().name().to_string();
        for _ in 0..8 {
            assert_eq!(group.select(&hints).await.unwrap().name(), first);
        }
    }

    #[tokio::test]
    async fn test_host_filter_restricts() {
        let web = Arc::new(
            Node::new("web", "10.0.0.1:443".parse().unwrap()).with_filter(NodeFilter {
                host: Some("*.example.com".to_string()),
                protocol: None,
            }),
        );
        let group = NodeGroup::new(vec![web], Strategy::RoundRobin);

        let hit = SelectHints::default().with_host("www.example.com");
        assert!(group.select(&hit).await.is_some());

        let miss = SelectHints::default().with_host("other.net");
        assert!(group.select(&miss).await.is_none());
    }
}
