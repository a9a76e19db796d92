//! Inventory store - durable keyed storage of nodes by type
//!
//! Key layout in the backing [`KvStore`]:
//! - `pool/index` - type -> node ids
//! - `node/{id}` - one node snapshot
//! - `consumer/{name}` - the ids a consumer holds
//!
//! Reads come from the [`NodeCache`] when it is populated and fall through to
//! the store otherwise. Every mutating method takes a `&PoolGuard` and writes
//! its change back to the store before returning.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::cache::NodeCache;
use super::error::{AttachError, PoolError, RejectReason};
use super::lock::PoolGuard;
use super::node::{Claim, Node, NodeDescriptor, NodeDict};
use super::store::{self, KvStore, StoreError};
use super::types::TypeAliases;
use super::validate::SyncValidator;

pub const INDEX_KEY: &str = "pool/index";
pub const NODE_PREFIX: &str = "node/";
pub const CONSUMER_PREFIX: &str = "consumer/";

pub fn node_key(id: &str) -> String {
    format!("{}{}", NODE_PREFIX, id)
}

pub fn consumer_key(consumer: &str) -> String {
    format!("{}{}", CONSUMER_PREFIX, consumer)
}

// ============================================================================
// Persisted records
// ============================================================================

/// Type -> node id index
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PoolIndex {
    types: BTreeMap<String, BTreeSet<String>>,
}

impl PoolIndex {
    pub fn insert(&mut self, node_type: &str, id: &str) {
        self.types
            .entry(node_type.to_string())
            .or_default()
            .insert(id.to_string());
    }

    /// Drop `id`; returns the type it was filed under
    pub fn remove(&mut self, id: &str) -> Option<String> {
        let node_type = self
            .types
            .iter()
            .find(|(_, ids)| ids.contains(id))
            .map(|(t, _)| t.clone())?;
        if let Some(ids) = self.types.get_mut(&node_type) {
            ids.remove(id);
            if ids.is_empty() {
                self.types.remove(&node_type);
            }
        }
        Some(node_type)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.types.values().any(|ids| ids.contains(id))
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.types.values().flatten().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.types.values().map(BTreeSet::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn types(&self) -> &BTreeMap<String, BTreeSet<String>> {
        &self.types
    }
}

/// The consumer side of the ownership edges
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsumerRecord {
    pub consumer: String,
    pub nodes: BTreeSet<String>,
    pub updated_at: DateTime<Utc>,
}

// ============================================================================
// Operation reports
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AddReport {
    pub added: Vec<String>,
    pub rejected: BTreeMap<RejectReason, Vec<String>>,
}

impl AddReport {
    fn reject(&mut self, reason: RejectReason, id: String) {
        self.rejected.entry(reason).or_default().push(id);
    }

    pub fn rejected_count(&self) -> usize {
        self.rejected.values().map(Vec::len).sum()
    }
}

/// Which nodes a remove applies to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeSelector {
    Ids(Vec<String>),
    Patterns(Vec<String>),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RemoveReport {
    pub removed: Vec<String>,
    /// Ids or patterns that matched nothing
    pub missing: Vec<String>,
    /// Nodes skipped because they are still allocated
    pub allocated: Vec<String>,
}

impl RemoveReport {
    pub fn all_removed(&self) -> bool {
        self.missing.is_empty() && self.allocated.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeSummary {
    #[serde(rename = "type")]
    pub node_type: String,
    pub total: usize,
    pub used: usize,
    pub exclusive: usize,
    pub available: usize,
}

/// host -> simulation -> node ids
pub type HostsView = BTreeMap<String, BTreeMap<String, Vec<String>>>;

// ============================================================================
// SBIO: Pure functions
// ============================================================================

/// Group nodes by type, seeding every known type with an empty map
pub fn build_node_dict(nodes: Vec<Node>, known_types: &[String]) -> NodeDict {
    let mut dict: NodeDict = known_types
        .iter()
        .map(|t| (t.clone(), BTreeMap::new()))
        .collect();
    for node in nodes {
        dict.entry(node.node_type.clone())
            .or_default()
            .insert(node.id.clone(), node);
    }
    dict
}

/// Translate a shell glob (`*`, `?`, `[...]`, `[!...]`) into an anchored regex
pub fn glob_to_regex(pattern: &str) -> Result<Regex, PoolError> {
    let mut expr = String::from("^");
    let mut chars = pattern.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '*' => expr.push_str(".*"),
            '?' => expr.push('.'),
            '[' => {
                expr.push('[');
                if chars.peek() == Some(&'!') {
                    chars.next();
                    expr.push('^');
                }
                let mut closed = false;
                for inner in chars.by_ref() {
                    if inner == ']' {
                        closed = true;
                        break;
                    }
                    if inner == '\\' {
                        expr.push('\\');
                    }
                    expr.push(inner);
                }
                if !closed {
                    return Err(PoolError::InvalidRequest(format!(
                        "Unterminated character class in pattern '{}'",
                        pattern
                    )));
                }
                expr.push(']');
            }
            other => expr.push_str(&regex::escape(&other.to_string())),
        }
    }
    expr.push('$');
    Regex::new(&expr).map_err(|e| PoolError::InvalidRequest(format!("{}: {}", pattern, e)))
}

pub fn summarize(dict: &NodeDict) -> Vec<TypeSummary> {
    dict.iter()
        .map(|(node_type, nodes)| {
            let used = nodes.values().filter(|n| n.is_used()).count();
            TypeSummary {
                node_type: node_type.clone(),
                total: nodes.len(),
                used,
                exclusive: nodes.values().filter(|n| n.exclusive).count(),
                available: nodes.len() - used,
            }
        })
        .collect()
}

// ============================================================================
// I/O wrapper
// ============================================================================

pub struct Inventory {
    store: Arc<dyn KvStore>,
    cache: NodeCache,
    known_types: Vec<String>,
    aliases: TypeAliases,
}

impl Inventory {
    pub fn new(store: Arc<dyn KvStore>, known_types: Vec<String>, aliases: TypeAliases) -> Self {
        Self {
            store,
            cache: NodeCache::new(),
            known_types,
            aliases,
        }
    }

    pub fn store(&self) -> &Arc<dyn KvStore> {
        &self.store
    }

    pub fn cache(&self) -> &NodeCache {
        &self.cache
    }

    pub fn aliases(&self) -> &TypeAliases {
        &self.aliases
    }

    pub fn known_types(&self) -> &[String] {
        &self.known_types
    }

    pub fn index(&self) -> Result<PoolIndex, StoreError> {
        Ok(store::load(self.store.as_ref(), INDEX_KEY)?.unwrap_or_default())
    }

    fn save_index(&self, index: &PoolIndex) -> Result<(), StoreError> {
        store::save(self.store.as_ref(), INDEX_KEY, index)
    }

    /// Read one node straight from the store
    pub fn load_node(&self, id: &str) -> Result<Option<Node>, StoreError> {
        store::load(self.store.as_ref(), &node_key(id))
    }

    fn save_node(&self, node: &Node) -> Result<(), StoreError> {
        store::save(self.store.as_ref(), &node_key(&node.id), node)
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    /// Every node in the pool, read from the store
    pub fn fresh_nodes(&self) -> Result<Vec<Node>, StoreError> {
        let index = self.index()?;
        let mut nodes = Vec::with_capacity(index.len());
        for id in index.ids() {
            match self.load_node(&id)? {
                Some(node) => nodes.push(node),
                None => warn!("Node '{}' is indexed but missing from the store", id),
            }
        }
        Ok(nodes)
    }

    /// Every node in the pool, from the cache when populated
    pub fn nodes(&self) -> Result<Vec<Node>, StoreError> {
        if !self.cache.is_populated() {
            self.refresh_cache()?;
        }
        Ok(self.cache.snapshot())
    }

    /// Reload the cache from the store; returns the number of cached nodes
    pub fn refresh_cache(&self) -> Result<usize, StoreError> {
        let nodes = self.fresh_nodes()?;
        let count = nodes.len();
        self.cache.replace_all(nodes);
        info!("Cache refreshed with {} node(s)", count);
        Ok(count)
    }

    /// Type -> id -> Node view, cache-aware
    pub fn node_dict(&self) -> Result<NodeDict, StoreError> {
        Ok(build_node_dict(self.nodes()?, &self.known_types))
    }

    /// Type -> id -> Node view, read from the store
    pub fn fresh_node_dict(&self) -> Result<NodeDict, StoreError> {
        Ok(build_node_dict(self.fresh_nodes()?, &self.known_types))
    }

    /// Nodes whose id matches any of the glob `patterns`
    pub fn grep(&self, patterns: &[String]) -> Result<Vec<Node>, PoolError> {
        let matchers = patterns
            .iter()
            .map(|p| glob_to_regex(p))
            .collect::<Result<Vec<_>, _>>()?;
        let matched: Vec<Node> = self
            .nodes()?
            .into_iter()
            .filter(|node| matchers.iter().any(|re| re.is_match(&node.id)))
            .collect();
        if matched.is_empty() {
            return Err(PoolError::NoMatchingNodes(patterns.join(", ")));
        }
        Ok(matched)
    }

    /// Nodes with exactly these ids, in the given order; unknown ids are skipped
    pub fn filter(&self, ids: &[String]) -> Result<Vec<Node>, PoolError> {
        let by_id: BTreeMap<String, Node> = self
            .nodes()?
            .into_iter()
            .map(|node| (node.id.clone(), node))
            .collect();
        let matched: Vec<Node> = ids.iter().filter_map(|id| by_id.get(id).cloned()).collect();
        if matched.is_empty() {
            return Err(PoolError::NoMatchingNodes(ids.join(", ")));
        }
        Ok(matched)
    }

    /// Nodes currently owned by `consumer`, cache-aware
    pub fn allocated_nodes(&self, consumer: &str) -> Result<Vec<Node>, StoreError> {
        Ok(self
            .nodes()?
            .into_iter()
            .filter(|node| node.is_owned_by(consumer))
            .collect())
    }

    /// Nodes owned by `consumer` according to the store
    ///
    /// Scans node ownership and also follows the consumer record, so either
    /// side of the edge is enough to find it.
    pub fn fresh_allocated_nodes(&self, consumer: &str) -> Result<Vec<Node>, StoreError> {
        let mut owned: BTreeMap<String, Node> = self
            .fresh_nodes()?
            .into_iter()
            .filter(|node| node.is_owned_by(consumer))
            .map(|node| (node.id.clone(), node))
            .collect();
        if let Some(record) = self.consumer_record(consumer)? {
            for id in record.nodes {
                if owned.contains_key(&id) {
                    continue;
                }
                if let Some(node) = self.load_node(&id)? {
                    owned.insert(id, node);
                }
            }
        }
        Ok(owned.into_values().collect())
    }

    pub fn consumer_record(&self, consumer: &str) -> Result<Option<ConsumerRecord>, StoreError> {
        store::load(self.store.as_ref(), &consumer_key(consumer))
    }

    pub fn summary(&self) -> Result<Vec<TypeSummary>, StoreError> {
        Ok(summarize(&self.node_dict()?))
    }

    pub fn hosts_view(&self) -> Result<HostsView, StoreError> {
        let mut view = HostsView::new();
        for node in self.nodes()? {
            let simulation = node.simulation.clone().unwrap_or_default();
            view.entry(node.host.clone())
                .or_default()
                .entry(simulation)
                .or_default()
                .push(node.id);
        }
        Ok(view)
    }

    // ------------------------------------------------------------------
    // Mutations (lock held)
    // ------------------------------------------------------------------

    /// Accept new nodes into the pool
    ///
    /// Rejections are grouped by reason. The sync check only runs when a
    /// validator is supplied.
    pub fn add(
        &self,
        _guard: &PoolGuard,
        descriptors: Vec<NodeDescriptor>,
        validator: Option<&dyn SyncValidator>,
    ) -> Result<AddReport, PoolError> {
        let mut index = self.index()?;
        let mut report = AddReport::default();
        let mut accepted: Vec<Node> = Vec::new();
        let mut batch_ids = BTreeSet::new();

        for desc in descriptors {
            let label = desc.label();
            let node = match Node::try_from(desc) {
                Ok(node) => node,
                Err(reason) => {
                    report.reject(reason, label);
                    continue;
                }
            };
            if !self.aliases.is_known(&node.node_type, &self.known_types) {
                report.reject(RejectReason::MissingType, node.id);
                continue;
            }
            if index.contains(&node.id) || !batch_ids.insert(node.id.clone()) {
                report.reject(RejectReason::AlreadyInPool, node.id);
                continue;
            }
            accepted.push(node);
        }

        if let Some(validator) = validator {
            let ids: Vec<String> = accepted.iter().map(|n| n.id.clone()).collect();
            let confirmed: BTreeSet<String> = validator.confirmed(&ids).into_iter().collect();
            let (synced, unsynced): (Vec<Node>, Vec<Node>) = accepted
                .into_iter()
                .partition(|node| confirmed.contains(&node.id));
            for node in unsynced {
                report.reject(RejectReason::NotSynced, node.id);
            }
            accepted = synced;
        }

        for node in &accepted {
            self.save_node(node)?;
            index.insert(&node.node_type, &node.id);
            report.added.push(node.id.clone());
        }
        if !accepted.is_empty() {
            self.save_index(&index)?;
            self.cache.merge(&accepted);
        }

        info!(
            added = report.added.len(),
            rejected = report.rejected_count(),
            "Added nodes to pool"
        );
        Ok(report)
    }

    /// Delete the selected nodes; allocated ones need `force`
    pub fn remove(
        &self,
        _guard: &PoolGuard,
        selector: &NodeSelector,
        force: bool,
    ) -> Result<RemoveReport, PoolError> {
        let mut index = self.index()?;
        let mut report = RemoveReport::default();

        let targets: Vec<String> = match selector {
            NodeSelector::Ids(ids) => ids
                .iter()
                .filter(|id| {
                    let known = index.contains(id);
                    if !known {
                        report.missing.push((*id).clone());
                    }
                    known
                })
                .cloned()
                .collect(),
            NodeSelector::Patterns(patterns) => {
                let all_ids = index.ids();
                let mut matched = BTreeSet::new();
                for pattern in patterns {
                    let re = glob_to_regex(pattern)?;
                    let hits: Vec<&String> = all_ids.iter().filter(|id| re.is_match(id)).collect();
                    if hits.is_empty() {
                        report.missing.push(pattern.clone());
                    }
                    matched.extend(hits.into_iter().cloned());
                }
                matched.into_iter().collect()
            }
        };

        for id in targets {
            let Some(mut node) = self.load_node(&id)? else {
                index.remove(&id);
                report.missing.push(id);
                continue;
            };
            if node.is_used() {
                if !force {
                    report.allocated.push(id);
                    continue;
                }
                for owner in node.release_owners(|_| false) {
                    self.drop_consumer_edges(&owner, std::slice::from_ref(&node.id))?;
                }
            }
            self.store.remove(&node_key(&id))?;
            index.remove(&id);
            report.removed.push(id);
        }

        self.save_index(&index)?;
        self.cache.remove(&report.removed);
        info!(
            removed = report.removed.len(),
            missing = report.missing.len(),
            allocated = report.allocated.len(),
            "Removed nodes from pool"
        );
        Ok(report)
    }

    /// Delete every node; refuses while anything is allocated unless forced
    pub fn remove_all(&self, _guard: &PoolGuard, force: bool) -> Result<RemoveReport, PoolError> {
        let nodes = self.fresh_nodes()?;
        let in_use = nodes.iter().filter(|n| n.is_used()).count();
        if in_use > 0 && !force {
            return Err(PoolError::InUse(in_use));
        }

        let mut report = RemoveReport::default();
        for node in nodes {
            self.store.remove(&node_key(&node.id))?;
            report.removed.push(node.id);
        }
        for key in self.store.list_keys(CONSUMER_PREFIX)? {
            self.store.remove(&key)?;
        }
        self.save_index(&PoolIndex::default())?;
        self.cache.replace_all(Vec::new());

        info!("Removed all {} node(s) from pool", report.removed.len());
        Ok(report)
    }

    /// Clear ownership held by consumers outside `active_consumers`
    ///
    /// An empty `active_consumers` resets every node. Returns how many nodes
    /// changed.
    pub fn reset(&self, _guard: &PoolGuard, active_consumers: &[String]) -> Result<usize, PoolError> {
        let active: BTreeSet<&str> = active_consumers.iter().map(String::as_str).collect();
        let mut changed = Vec::new();
        let mut released: BTreeSet<String> = BTreeSet::new();

        for mut node in self.fresh_nodes()? {
            let dropped = node.release_owners(|owner| active.contains(owner));
            if dropped.is_empty() {
                continue;
            }
            self.save_node(&node)?;
            released.extend(dropped);
            changed.push(node);
        }

        for key in self.store.list_keys(CONSUMER_PREFIX)? {
            let consumer = key.trim_start_matches(CONSUMER_PREFIX);
            if !active.contains(consumer) {
                self.store.remove(&key)?;
            }
        }

        self.cache.merge(&changed);
        info!(
            nodes = changed.len(),
            consumers = released.len(),
            "Reset node ownership"
        );
        Ok(changed.len())
    }

    /// Attach `claim` to one node after re-reading it from the store
    ///
    /// Returns the persisted node. A node the consumer already holds is
    /// returned unchanged.
    pub fn attach(
        &self,
        _guard: &PoolGuard,
        id: &str,
        claim: &Claim,
        exclusive_consumers: &BTreeSet<String>,
    ) -> Result<Node, PoolError> {
        let mut node = self
            .load_node(id)?
            .ok_or_else(|| AttachError::NotFound(id.to_string()))?;
        if node.attach(claim, exclusive_consumers)? {
            self.save_node(&node)?;
            debug!(node = %id, consumer = %claim.consumer, "Attached node");
        }
        Ok(node)
    }

    /// Detach `consumer` from one node after re-reading it from the store
    pub fn detach(&self, _guard: &PoolGuard, id: &str, consumer: &str) -> Result<Node, PoolError> {
        let mut node = self
            .load_node(id)?
            .ok_or_else(|| AttachError::NotFound(id.to_string()))?;
        node.detach(consumer)?;
        self.save_node(&node)?;
        debug!(node = %id, consumer = %consumer, "Detached node");
        Ok(node)
    }

    /// Record newly attached ids on the consumer side of the edge
    pub fn record_consumer_edges(
        &self,
        _guard: &PoolGuard,
        consumer: &str,
        ids: &[String],
    ) -> Result<(), StoreError> {
        if ids.is_empty() {
            return Ok(());
        }
        let mut record = self.consumer_record(consumer)?.unwrap_or_else(|| ConsumerRecord {
            consumer: consumer.to_string(),
            nodes: BTreeSet::new(),
            updated_at: Utc::now(),
        });
        record.nodes.extend(ids.iter().cloned());
        record.updated_at = Utc::now();
        store::save(self.store.as_ref(), &consumer_key(consumer), &record)
    }

    /// Forget released ids on the consumer side; drops empty records
    pub fn release_consumer_edges(
        &self,
        _guard: &PoolGuard,
        consumer: &str,
        ids: &[String],
    ) -> Result<(), StoreError> {
        self.drop_consumer_edges(consumer, ids)
    }

    fn drop_consumer_edges(&self, consumer: &str, ids: &[String]) -> Result<(), StoreError> {
        let Some(mut record) = self.consumer_record(consumer)? else {
            return Ok(());
        };
        for id in ids {
            record.nodes.remove(id);
        }
        if record.nodes.is_empty() {
            self.store.remove(&consumer_key(consumer))?;
        } else {
            record.updated_at = Utc::now();
            store::save(self.store.as_ref(), &consumer_key(consumer), &record)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::lock::PoolLock;
    use crate::pool::store::MemoryStore;
    use crate::pool::validate::StaticSyncValidator;

    fn inventory() -> (Inventory, PoolLock) {
        let store: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
        let known = vec!["ERBS".to_string(), "RadioNode".to_string(), "SGSN-MME".to_string()];
        (
            Inventory::new(Arc::clone(&store), known, TypeAliases::default()),
            PoolLock::new(store, "test"),
        )
    }

    fn desc(id: &str, node_type: &str, host: &str) -> NodeDescriptor {
        NodeDescriptor {
            id: Some(id.to_string()),
            node_type: Some(node_type.to_string()),
            host: Some(host.to_string()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_add_groups_rejections() {
        let (inv, lock) = inventory();
        let guard = lock.acquire().await.unwrap();

        inv.add(&guard, vec![desc("n1", "ERBS", "h1")], None).unwrap();
        let report = inv
            .add(
                &guard,
                vec![
                    desc("n1", "ERBS", "h1"),
                    desc("n2", "ERBS", "h1"),
                    desc("n2", "ERBS", "h1"),
                    desc("n3", "BSC", "h1"),
                    NodeDescriptor {
                        id: Some("n4".into()),
                        ..Default::default()
                    },
                    desc("s1", "SGSN", "h2"),
                ],
                None,
            )
            .unwrap();

        assert_eq!(report.added, vec!["n2", "s1"]);
        assert_eq!(
            report.rejected[&RejectReason::AlreadyInPool],
            vec!["n1", "n2"]
        );
        assert_eq!(report.rejected[&RejectReason::MissingType], vec!["n3"]);
        assert_eq!(report.rejected[&RejectReason::MissingDescriptor], vec!["n4"]);
        assert_eq!(inv.index().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_add_with_sync_check() {
        let (inv, lock) = inventory();
        let guard = lock.acquire().await.unwrap();
        let validator = StaticSyncValidator::new(["n1"]);

        let report = inv
            .add(
                &guard,
                vec![desc("n1", "ERBS", "h1"), desc("n2", "ERBS", "h1")],
                Some(&validator),
            )
            .unwrap();
        assert_eq!(report.added, vec!["n1"]);
        assert_eq!(report.rejected[&RejectReason::NotSynced], vec!["n2"]);
    }

    #[tokio::test]
    async fn test_node_dict_includes_known_empty_types() {
        let (inv, lock) = inventory();
        let guard = lock.acquire().await.unwrap();
        inv.add(&guard, vec![desc("n1", "ERBS", "h1")], None).unwrap();

        let dict = inv.node_dict().unwrap();
        assert_eq!(dict["ERBS"].len(), 1);
        assert!(dict["RadioNode"].is_empty());
        assert!(dict.contains_key("SGSN-MME"));
    }

    #[tokio::test]
    async fn test_grep_and_filter() {
        let (inv, lock) = inventory();
        let guard = lock.acquire().await.unwrap();
        inv.add(
            &guard,
            vec![
                desc("LTE01dg2ERBS00001", "RadioNode", "h1"),
                desc("LTE01dg2ERBS00002", "RadioNode", "h1"),
                desc("LTE02ERBS00001", "ERBS", "h2"),
            ],
            None,
        )
        .unwrap();

        let hits = inv.grep(&["LTE01*".to_string()]).unwrap();
        assert_eq!(hits.len(), 2);
        let hits = inv.grep(&["*ERBS0000[!2]".to_string()]).unwrap();
        assert_eq!(hits.len(), 2);
        assert!(matches!(
            inv.grep(&["nothing*".to_string()]),
            Err(PoolError::NoMatchingNodes(_))
        ));

        let picked = inv
            .filter(&["LTE02ERBS00001".to_string(), "missing".to_string()])
            .unwrap();
        assert_eq!(picked.len(), 1);
    }

    #[tokio::test]
    async fn test_remove_skips_allocated_without_force() {
        let (inv, lock) = inventory();
        let guard = lock.acquire().await.unwrap();
        inv.add(&guard, vec![desc("n1", "ERBS", "h1"), desc("n2", "ERBS", "h1")], None)
            .unwrap();
        inv.attach(&guard, "n1", &Claim::new("FM_01", false), &BTreeSet::new())
            .unwrap();
        inv.record_consumer_edges(&guard, "FM_01", &["n1".to_string()])
            .unwrap();

        let selector = NodeSelector::Ids(vec!["n1".into(), "n2".into(), "n9".into()]);
        let report = inv.remove(&guard, &selector, false).unwrap();
        assert_eq!(report.removed, vec!["n2"]);
        assert_eq!(report.allocated, vec!["n1"]);
        assert_eq!(report.missing, vec!["n9"]);
        assert!(!report.all_removed());

        let report = inv
            .remove(&guard, &NodeSelector::Patterns(vec!["n*".into()]), true)
            .unwrap();
        assert_eq!(report.removed, vec!["n1"]);
        assert!(inv.consumer_record("FM_01").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_remove_all_refuses_when_in_use() {
        let (inv, lock) = inventory();
        let guard = lock.acquire().await.unwrap();
        inv.add(&guard, vec![desc("n1", "ERBS", "h1")], None).unwrap();
        inv.attach(&guard, "n1", &Claim::new("FM_01", false), &BTreeSet::new())
            .unwrap();

        assert!(matches!(
            inv.remove_all(&guard, false),
            Err(PoolError::InUse(1))
        ));
        let report = inv.remove_all(&guard, true).unwrap();
        assert_eq!(report.removed, vec!["n1"]);
        assert!(inv.index().unwrap().is_empty());
        assert!(inv.nodes().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_reset_keeps_active_consumers() {
        let (inv, lock) = inventory();
        let guard = lock.acquire().await.unwrap();
        inv.add(&guard, vec![desc("n1", "ERBS", "h1")], None).unwrap();
        let none = BTreeSet::new();
        inv.attach(&guard, "n1", &Claim::new("FM_01", false), &none).unwrap();
        inv.attach(&guard, "n1", &Claim::new("PM_01", false), &none).unwrap();
        inv.record_consumer_edges(&guard, "PM_01", &["n1".to_string()])
            .unwrap();

        assert_eq!(inv.reset(&guard, &["FM_01".to_string()]).unwrap(), 1);
        let node = inv.load_node("n1").unwrap().unwrap();
        assert!(node.is_owned_by("FM_01"));
        assert!(!node.is_owned_by("PM_01"));
        assert!(inv.consumer_record("PM_01").unwrap().is_none());

        assert_eq!(inv.reset(&guard, &[]).unwrap(), 1);
        assert!(!inv.load_node("n1").unwrap().unwrap().is_used());
    }

    #[tokio::test]
    async fn test_cache_tracks_write_back() {
        let (inv, lock) = inventory();
        let guard = lock.acquire().await.unwrap();
        inv.add(&guard, vec![desc("n1", "ERBS", "h1")], None).unwrap();

        // First read populates the cache
        assert_eq!(inv.nodes().unwrap().len(), 1);
        assert!(inv.cache().is_populated());

        let node = inv
            .attach(&guard, "n1", &Claim::new("FM_01", false), &BTreeSet::new())
            .unwrap();
        inv.cache().merge(&[node]);
        assert_eq!(inv.allocated_nodes("FM_01").unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_fresh_allocated_nodes_follows_consumer_record() {
        let (inv, lock) = inventory();
        let guard = lock.acquire().await.unwrap();
        inv.add(&guard, vec![desc("n1", "ERBS", "h1"), desc("n2", "ERBS", "h2")], None)
            .unwrap();
        inv.attach(&guard, "n1", &Claim::new("FM_01", false), &BTreeSet::new())
            .unwrap();
        inv.record_consumer_edges(&guard, "FM_01", &["n2".to_string()])
            .unwrap();

        let ids: Vec<String> = inv
            .fresh_allocated_nodes("FM_01")
            .unwrap()
            .into_iter()
            .map(|n| n.id)
            .collect();
        assert_eq!(ids, vec!["n1", "n2"]);
    }

    #[test]
    fn test_glob_to_regex() {
        assert!(glob_to_regex("LTE*").unwrap().is_match("LTE01"));
        assert!(!glob_to_regex("LTE*").unwrap().is_match("xLTE01"));
        assert!(glob_to_regex("n?").unwrap().is_match("n1"));
        assert!(glob_to_regex("a.b").unwrap().is_match("a.b"));
        assert!(!glob_to_regex("a.b").unwrap().is_match("axb"));
        assert!(glob_to_regex("n[12]").unwrap().is_match("n2"));
        assert!(glob_to_regex("n[").is_err());
    }

    #[test]
    fn test_summarize() {
        let mut used = Node::new("n1", "ERBS", "h1");
        used.ownership.insert("FM_01".into());
        let dict = build_node_dict(
            vec![used, Node::new("n2", "ERBS", "h1")],
            &["BSC".to_string()],
        );
        let summary = summarize(&dict);
        assert_eq!(summary.len(), 2);
        let erbs = summary.iter().find(|s| s.node_type == "ERBS").unwrap();
        assert_eq!((erbs.total, erbs.used, erbs.available), (2, 1, 1));
    }
}
