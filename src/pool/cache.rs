//! Read cache of persisted nodes, owned by the inventory
//!
//! The cache starts unpopulated and is filled on the first cache-aware read.
//! Write-backs replace affected entries wholesale. Until the cache has been
//! populated, merges are skipped so a partial cache never masks the store.

use std::sync::atomic::{AtomicBool, Ordering};

use dashmap::DashMap;
use serde::Serialize;
use tracing::info;

use super::node::Node;

/// Counts reported after a write-back merge
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheMergeSummary {
    pub total: usize,
    pub updated: usize,
    pub added: usize,
}

#[derive(Debug, Default)]
pub struct NodeCache {
    nodes: DashMap<String, Node>,
    populated: AtomicBool,
}

impl NodeCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_populated(&self) -> bool {
        self.populated.load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<Node> {
        self.nodes.get(id).map(|n| n.value().clone())
    }

    /// All cached nodes, sorted by id
    pub fn snapshot(&self) -> Vec<Node> {
        let mut nodes: Vec<Node> = self.nodes.iter().map(|n| n.value().clone()).collect();
        nodes.sort_by(|a, b| a.id.cmp(&b.id));
        nodes
    }

    /// Replace the whole cache with a fresh load from the store
    pub fn replace_all(&self, nodes: Vec<Node>) {
        self.nodes.clear();
        for node in nodes {
            self.nodes.insert(node.id.clone(), node);
        }
        self.populated.store(true, Ordering::Release);
    }

    /// Swap in freshly persisted copies of `updated`
    pub fn merge(&self, updated: &[Node]) -> CacheMergeSummary {
        if !self.is_populated() || updated.is_empty() {
            return CacheMergeSummary {
                total: self.len(),
                ..Default::default()
            };
        }

        let mut summary = CacheMergeSummary::default();
        for node in updated {
            match self.nodes.insert(node.id.clone(), node.clone()) {
                Some(_) => summary.updated += 1,
                None => summary.added += 1,
            }
        }
        summary.total = self.len();

        info!(
            total = summary.total,
            updated = summary.updated,
            added = summary.added,
            "Cache nodes merged"
        );
        summary
    }

    pub fn remove(&self, ids: &[String]) {
        for id in ids {
            self.nodes.remove(id);
        }
    }

    /// Drop everything; the next cache-aware read reloads from the store
    pub fn invalidate(&self) {
        self.populated.store(false, Ordering::Release);
        self.nodes.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_skipped_until_populated() {
        let cache = NodeCache::new();
        let summary = cache.merge(&[Node::new("n1", "ERBS", "h1")]);
        assert_eq!(summary.added, 0);
        assert!(cache.is_empty());
        assert!(!cache.is_populated());
    }

    #[test]
    fn test_merge_counts_updates_and_additions() {
        let cache = NodeCache::new();
        cache.replace_all(vec![Node::new("n1", "ERBS", "h1")]);

        let mut changed = Node::new("n1", "ERBS", "h1");
        changed.ownership.insert("FM_01".to_string());
        let summary = cache.merge(&[changed, Node::new("n2", "ERBS", "h2")]);

        assert_eq!(
            summary,
            CacheMergeSummary {
                total: 2,
                updated: 1,
                added: 1
            }
        );
        assert!(cache.get("n1").unwrap().is_owned_by("FM_01"));
    }

    #[test]
    fn test_populated_even_when_empty() {
        let cache = NodeCache::new();
        cache.replace_all(Vec::new());
        assert!(cache.is_populated());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_invalidate() {
        let cache = NodeCache::new();
        cache.replace_all(vec![Node::new("n1", "ERBS", "h1")]);
        cache.invalidate();
        assert!(!cache.is_populated());
        assert!(cache.get("n1").is_none());
    }
}
