//! Allocation request - what a consumer asks the pool for
//!
//! A request lives for one allocate call and is never persisted.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use super::error::PoolError;
use super::node::Claim;

/// Count sentinel meaning "as many as available"
pub const FILL: i64 = -1;

/// How committed nodes are picked from the eligible candidates
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Selection {
    /// Round-robin across hosts
    #[default]
    Distributed,
    /// Shuffled order
    Random,
}

/// Required occurrences of one managed object on a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CardinalitySpec {
    /// Exactly this many
    Exact(u32),
    /// Inclusive `[min, max]`
    Range(u32, u32),
}

impl CardinalitySpec {
    pub fn min(&self) -> u32 {
        match self {
            CardinalitySpec::Exact(n) => *n,
            CardinalitySpec::Range(min, _) => *min,
        }
    }

    pub fn max(&self) -> u32 {
        match self {
            CardinalitySpec::Exact(n) => *n,
            CardinalitySpec::Range(_, max) => *max,
        }
    }

    pub fn accepts(&self, count: u32) -> bool {
        count >= self.min() && count <= self.max()
    }
}

/// Two types that must be provisioned together per host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairedTypes {
    pub primary: String,
    pub companion: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AllocationRequest {
    /// Consumer name used for ownership, policy lookup and logging
    pub consumer: String,

    /// Per-type counts; `-1` fills from what remains
    pub num_nodes: BTreeMap<String, i64>,

    pub total_nodes: Option<usize>,

    /// Ceiling that takes precedence over `total_nodes`
    pub max_nodes: Option<usize>,

    pub nodes_per_host: Option<usize>,

    /// Types eligible for proportional or default allocation, in preference order
    pub supported_types: Vec<String>,

    /// Type -> attribute -> accepted values
    pub node_attributes: BTreeMap<String, BTreeMap<String, Vec<String>>>,

    pub exclusive: bool,

    /// Managed element type -> percentage of the requested count
    pub me_type_percentage: BTreeMap<String, f64>,

    /// Managed object -> required occurrences
    pub cardinality: BTreeMap<String, CardinalitySpec>,

    /// Types the cardinality constraints apply to; empty means all
    pub cardinality_types: Vec<String>,

    pub paired_types: Option<PairedTypes>,

    pub exclude_nodes: BTreeSet<String>,

    pub exclude_types: Vec<String>,

    /// Nodes whose simulation name contains any of these are skipped
    pub exclude_simulations: Vec<String>,

    pub check_sync: bool,

    /// Fewer committed nodes than this is an environment-level failure
    pub minimum_nodes: Option<usize>,

    pub selection: Selection,

    /// Attach exactly these node ids instead of resolving counts
    pub nodes: Vec<String>,
}

impl AllocationRequest {
    pub fn new(consumer: impl Into<String>) -> Self {
        Self {
            consumer: consumer.into(),
            ..Default::default()
        }
    }

    pub fn with_count(mut self, node_type: impl Into<String>, count: i64) -> Self {
        self.num_nodes.insert(node_type.into(), count);
        self
    }

    pub fn with_total(mut self, total: usize) -> Self {
        self.total_nodes = Some(total);
        self
    }

    pub fn with_max_nodes(mut self, max: usize) -> Self {
        self.max_nodes = Some(max);
        self
    }

    pub fn with_nodes_per_host(mut self, cap: usize) -> Self {
        self.nodes_per_host = Some(cap);
        self
    }

    pub fn with_supported_types<I, S>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.supported_types = types.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_attribute_filter<I, S>(
        mut self,
        node_type: impl Into<String>,
        attribute: impl Into<String>,
        values: I,
    ) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.node_attributes
            .entry(node_type.into())
            .or_default()
            .insert(attribute.into(), values.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_exclusive(mut self, exclusive: bool) -> Self {
        self.exclusive = exclusive;
        self
    }

    pub fn with_percentage(mut self, me_type: impl Into<String>, pct: f64) -> Self {
        self.me_type_percentage.insert(me_type.into(), pct);
        self
    }

    pub fn with_cardinality(mut self, managed_object: impl Into<String>, spec: CardinalitySpec) -> Self {
        self.cardinality.insert(managed_object.into(), spec);
        self
    }

    pub fn with_paired_types(mut self, primary: impl Into<String>, companion: impl Into<String>) -> Self {
        self.paired_types = Some(PairedTypes {
            primary: primary.into(),
            companion: companion.into(),
        });
        self
    }

    pub fn with_excluded_simulation(mut self, fragment: impl Into<String>) -> Self {
        self.exclude_simulations.push(fragment.into());
        self
    }

    pub fn with_minimum(mut self, minimum: usize) -> Self {
        self.minimum_nodes = Some(minimum);
        self
    }

    pub fn with_selection(mut self, selection: Selection) -> Self {
        self.selection = selection;
        self
    }

    pub fn with_nodes<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.nodes = ids.into_iter().map(Into::into).collect();
        self
    }

    /// Overall node count this request needs, if it bounds one
    ///
    /// Precedence: `max_nodes`, `total_nodes`, explicit `nodes`, then the sum
    /// of fixed per-type counts.
    pub fn required_total(&self) -> Option<usize> {
        if let Some(max) = self.max_nodes {
            return Some(max);
        }
        if let Some(total) = self.total_nodes {
            return Some(total);
        }
        if !self.nodes.is_empty() {
            return Some(self.nodes.len());
        }
        let fixed: i64 = self.num_nodes.values().filter(|c| **c > 0).sum();
        (fixed > 0).then_some(fixed as usize)
    }

    /// Per-type entries ordered for resolution: largest fixed count first,
    /// ties by type name, fill entries last
    pub fn ordered_counts(&self) -> Vec<(String, i64)> {
        let mut entries: Vec<(String, i64)> = self
            .num_nodes
            .iter()
            .map(|(t, c)| (t.clone(), *c))
            .collect();
        entries.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        entries
    }

    /// The claim this request attaches with
    pub fn claim(&self, exclusive_consumers: &BTreeSet<String>) -> Claim {
        let exclusive = self.exclusive || exclusive_consumers.contains(&self.consumer);
        Claim::new(self.consumer.clone(), exclusive).with_excluded_types(self.exclude_types.clone())
    }

    pub fn validate(&self) -> Result<(), PoolError> {
        if self.consumer.trim().is_empty() {
            return Err(PoolError::InvalidRequest("consumer name is required".into()));
        }
        if let Some((node_type, count)) = self.num_nodes.iter().find(|(_, c)| **c < FILL) {
            return Err(PoolError::InvalidRequest(format!(
                "count {} for type '{}' is below -1",
                count, node_type
            )));
        }
        let fills = self.num_nodes.values().filter(|c| **c == FILL).count();
        if fills > 1 && (self.total_nodes.is_some() || self.max_nodes.is_some()) {
            return Err(PoolError::InvalidRequest(
                "only one type may use -1 together with a total".into(),
            ));
        }
        let pct_sum: f64 = self.me_type_percentage.values().sum();
        if self.me_type_percentage.values().any(|p| *p < 0.0) || pct_sum > 100.0 {
            return Err(PoolError::InvalidRequest(format!(
                "percentages must be non-negative and sum to at most 100 (got {})",
                pct_sum
            )));
        }
        if let Some((mo, _)) = self
            .cardinality
            .iter()
            .find(|(_, spec)| spec.min() > spec.max())
        {
            return Err(PoolError::InvalidRequest(format!(
                "cardinality range for '{}' has min above max",
                mo
            )));
        }
        if let Some(pair) = &self.paired_types {
            if pair.primary == pair.companion {
                return Err(PoolError::InvalidRequest(
                    "paired types must differ".into(),
                ));
            }
        }
        Ok(())
    }
}
