//! Multi-criteria cardinality matching
//!
//! Each "node must carry N occurrences of managed object M" constraint is
//! resolved on its own against a [`CardinalitySource`]; the per-constraint
//! node sets are then intersected.

use std::collections::{BTreeMap, BTreeSet};

use tracing::debug;

use super::node::Node;
use super::request::CardinalitySpec;

/// One resolved constraint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CardinalityConstraint<'a> {
    pub managed_object: &'a str,
    pub spec: CardinalitySpec,
}

/// Host -> candidates on that host
pub type HostGrouping = BTreeMap<String, Vec<Node>>;

pub trait CardinalitySource: Send + Sync {
    /// Ids of nodes in `hosts` satisfying `constraint`
    fn matching(&self, constraint: &CardinalityConstraint<'_>, hosts: &HostGrouping) -> Vec<String>;
}

/// Reads occurrence counts recorded on the nodes themselves
#[derive(Debug, Clone, Copy, Default)]
pub struct NodeCardinalitySource;

impl CardinalitySource for NodeCardinalitySource {
    fn matching(&self, constraint: &CardinalityConstraint<'_>, hosts: &HostGrouping) -> Vec<String> {
        hosts
            .values()
            .flatten()
            .filter(|node| {
                node.cardinality
                    .get(constraint.managed_object)
                    .map(|count| constraint.spec.accepts(*count))
                    .unwrap_or(false)
            })
            .map(|node| node.id.clone())
            .collect()
    }
}

/// Keep the candidates satisfying every constraint
///
/// Returns an empty list as soon as one constraint matches nothing. Input
/// order is preserved.
pub fn match_cardinality(
    source: &dyn CardinalitySource,
    requirements: &BTreeMap<String, CardinalitySpec>,
    candidates: Vec<Node>,
) -> Vec<Node> {
    if requirements.is_empty() {
        return candidates;
    }

    let mut hosts = HostGrouping::new();
    for node in &candidates {
        hosts.entry(node.host.clone()).or_default().push(node.clone());
    }

    let mut surviving: Option<BTreeSet<String>> = None;
    for (managed_object, spec) in requirements {
        let constraint = CardinalityConstraint {
            managed_object: managed_object.as_str(),
            spec: *spec,
        };
        let matched: BTreeSet<String> = source.matching(&constraint, &hosts).into_iter().collect();
        debug!(
            managed_object = %managed_object,
            matched = matched.len(),
            "Resolved cardinality constraint"
        );
        if matched.is_empty() {
            return Vec::new();
        }
        surviving = Some(match surviving {
            Some(current) => current.intersection(&matched).cloned().collect(),
            None => matched,
        });
    }

    let surviving = surviving.unwrap_or_default();
    candidates
        .into_iter()
        .filter(|node| surviving.contains(&node.id))
        .collect()
}
