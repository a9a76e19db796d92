//! Node type taxonomy and backward-compatible aliasing
//!
//! Some node types were renamed over time. The alias table maps each legacy
//! name to its canonical name; lookups work in both directions so a request
//! for either name sees the nodes stored under the other.

use std::collections::{BTreeMap, BTreeSet};

use super::node::{Node, NodeDict};

/// Legacy -> canonical pairs applied when no alias table is configured
pub const DEFAULT_ALIASES: &[(&str, &str)] = &[
    ("SGSN", "SGSN-MME"),
    ("MLTN", "MINI-LINK-Indoor"),
    ("CISCO", "CISCO-ASR900"),
    ("FrontHaul-6080", "FRONTHAUL-6080"),
    ("Router_6672", "Router6672"),
    ("Router_6274", "Router6274"),
];

/// Bidirectional legacy/canonical type table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeAliases {
    legacy_to_canonical: BTreeMap<String, String>,
    canonical_to_legacy: BTreeMap<String, String>,
}

impl TypeAliases {
    pub fn new<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let mut legacy_to_canonical = BTreeMap::new();
        let mut canonical_to_legacy = BTreeMap::new();
        for (legacy, canonical) in pairs {
            let (legacy, canonical) = (legacy.into(), canonical.into());
            canonical_to_legacy.insert(canonical.clone(), legacy.clone());
            legacy_to_canonical.insert(legacy, canonical);
        }
        Self {
            legacy_to_canonical,
            canonical_to_legacy,
        }
    }

    pub fn empty() -> Self {
        Self::new(Vec::<(String, String)>::new())
    }

    /// The canonical name for `node_type` (itself when not a legacy name)
    pub fn canonical<'a>(&'a self, node_type: &'a str) -> &'a str {
        self.legacy_to_canonical
            .get(node_type)
            .map(String::as_str)
            .unwrap_or(node_type)
    }

    /// The other name of an aliased pair, in either direction
    pub fn alias_of(&self, node_type: &str) -> Option<&str> {
        self.legacy_to_canonical
            .get(node_type)
            .or_else(|| self.canonical_to_legacy.get(node_type))
            .map(String::as_str)
    }

    /// Whether `node_type` or its alias appears in `known`
    pub fn is_known(&self, node_type: &str, known: &[String]) -> bool {
        if known.is_empty() || known.iter().any(|k| k == node_type) {
            return true;
        }
        self.alias_of(node_type)
            .map(|alias| known.iter().any(|k| k == alias))
            .unwrap_or(false)
    }

    /// Nodes stored under `node_type` unioned with those under its alias
    ///
    /// The result carries no duplicate ids. Nodes under the literal key come
    /// first.
    pub fn resolve(&self, node_type: &str, dict: &NodeDict) -> Vec<Node> {
        let mut seen = BTreeSet::new();
        let mut nodes = Vec::new();

        let keys = std::iter::once(node_type).chain(self.alias_of(node_type));
        for key in keys {
            if let Some(by_id) = dict.get(key) {
                for node in by_id.values() {
                    if seen.insert(node.id.clone()) {
                        nodes.push(node.clone());
                    }
                }
            }
        }
        nodes
    }

    /// Number of nodes a type can draw on once its alias is unioned in
    pub fn total(&self, node_type: &str, dict: &NodeDict) -> usize {
        self.resolve(node_type, dict).len()
    }
}

impl Default for TypeAliases {
    fn default() -> Self {
        Self::new(DEFAULT_ALIASES.iter().copied())
    }
}
