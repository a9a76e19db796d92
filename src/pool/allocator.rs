//! Allocation protocol
//!
//! One `allocate` call walks RESOLVING -> FILTERING -> COMMITTING and ends
//! SATISFIED, PARTIAL or FAILED. Every method here expects the caller to hold
//! the pool lock; the guard is threaded through to the inventory writes.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::cardinality::{match_cardinality, CardinalitySource, NodeCardinalitySource};
use super::error::PoolError;
use super::filter::{balance_paired, split_by_percentage, CandidateFilter, Candidates};
use super::inventory::Inventory;
use super::lock::PoolGuard;
use super::node::{Claim, Node, NodeDict};
use super::request::{AllocationRequest, PairedTypes, FILL};
use super::resolve::{self, Demand, Plan, TypeAvailability};
use super::validate::{AcceptAll, SyncValidator};
use crate::config::{ConsumerPolicy, Tolerance};

// ============================================================================
// Outcome types
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocationPhase {
    Resolving,
    Filtering,
    Committing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AllocationState {
    Satisfied,
    Partial,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarningSeverity {
    /// Shortfall the consumer can live with
    Warning,
    /// The environment cannot serve this consumer
    EnvironmentError,
}

/// A non-fatal shortfall reported back to the consumer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationWarning {
    /// Type that fell short; `None` for request-wide shortfalls
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub node_type: Option<String>,
    pub required: usize,
    pub committed: usize,
    pub severity: WarningSeverity,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AllocationOutcome {
    pub consumer: String,
    pub state: AllocationState,
    /// Type -> committed nodes
    pub nodes: BTreeMap<String, Vec<Node>>,
    #[serde(default)]
    pub warnings: Vec<AllocationWarning>,
}

impl AllocationOutcome {
    pub fn total(&self) -> usize {
        self.nodes.values().map(Vec::len).sum()
    }

    pub fn ids(&self) -> Vec<String> {
        self.nodes.values().flatten().map(|n| n.id.clone()).collect()
    }

    pub fn has_environment_error(&self) -> bool {
        self.warnings
            .iter()
            .any(|w| w.severity == WarningSeverity::EnvironmentError)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeallocationReport {
    pub consumer: String,
    pub released: Vec<String>,
    pub failed: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExchangeOutcome {
    pub released: DeallocationReport,
    pub allocated: AllocationOutcome,
}

/// Fewer nodes committed than required; `node_type` is `None` request-wide
#[derive(Debug, Clone, PartialEq, Eq)]
struct Shortfall {
    node_type: Option<String>,
    required: usize,
    committed: usize,
}

/// Nodes chosen for one type before commit
#[derive(Debug, Clone)]
struct TypeSelection {
    node_type: String,
    /// `None` when the type takes whatever is available
    required: Option<usize>,
    nodes: Vec<Node>,
}

// ============================================================================
// Allocator
// ============================================================================

pub struct Allocator {
    inventory: Arc<Inventory>,
    exclusive_consumers: BTreeSet<String>,
    policies: BTreeMap<String, ConsumerPolicy>,
    default_policy: ConsumerPolicy,
    cardinality: Arc<dyn CardinalitySource>,
    validator: Arc<dyn SyncValidator>,
    seed: Option<u64>,
}

impl Allocator {
    pub fn new(
        inventory: Arc<Inventory>,
        exclusive_consumers: BTreeSet<String>,
        policies: BTreeMap<String, ConsumerPolicy>,
    ) -> Self {
        Self {
            inventory,
            exclusive_consumers,
            policies,
            default_policy: ConsumerPolicy::default(),
            cardinality: Arc::new(NodeCardinalitySource),
            validator: Arc::new(AcceptAll),
            seed: None,
        }
    }

    pub fn with_cardinality_source(mut self, source: Arc<dyn CardinalitySource>) -> Self {
        self.cardinality = source;
        self
    }

    pub fn with_sync_validator(mut self, validator: Arc<dyn SyncValidator>) -> Self {
        self.validator = validator;
        self
    }

    /// Fix the selection RNG seed for reproducible picks
    pub fn with_seed(mut self, seed: Option<u64>) -> Self {
        self.seed = seed;
        self
    }

    pub fn exclusive_consumers(&self) -> &BTreeSet<String> {
        &self.exclusive_consumers
    }

    pub fn policy_for(&self, consumer: &str) -> &ConsumerPolicy {
        self.policies.get(consumer).unwrap_or(&self.default_policy)
    }

    fn rng(&self) -> StdRng {
        match self.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        }
    }

    // ------------------------------------------------------------------
    // Allocate
    // ------------------------------------------------------------------

    pub fn allocate(
        &self,
        guard: &PoolGuard,
        request: &AllocationRequest,
    ) -> Result<AllocationOutcome, PoolError> {
        request.validate()?;
        let claim = request.claim(&self.exclusive_consumers);

        if !request.nodes.is_empty() {
            return self.allocate_listed(guard, request, &claim);
        }

        let policy = self.policy_for(&request.consumer);
        let mut rng = self.rng();
        debug!(phase = ?AllocationPhase::Resolving, consumer = %request.consumer, "Allocation phase");

        // Fresh view: ownership may have moved since the cache was filled
        let dict = self.inventory.fresh_node_dict()?;
        let filter = CandidateFilter::new(request, &claim, &self.exclusive_consumers)
            .with_validator(self.validator.as_ref());

        let mut seen: BTreeSet<String> = BTreeSet::new();
        let mut selections = Vec::new();

        if let Some(pair) = &request.paired_types {
            selections.extend(self.select_paired(request, pair, &dict, &filter, &mut rng, &mut seen));
        }

        let mut precomputed: BTreeMap<String, Candidates> = BTreeMap::new();
        let plan = self.resolve_plan(request, policy, &dict, &filter, &mut rng, &mut precomputed);
        debug!(
            phase = ?AllocationPhase::Filtering,
            consumer = %request.consumer,
            source = ?plan.source,
            types = plan.entries.len(),
            "Allocation phase"
        );

        let mut selected_so_far: usize = selections.iter().map(|s| s.nodes.len()).sum();
        for (node_type, demand) in &plan.entries {
            if is_paired(request.paired_types.as_ref(), node_type) {
                continue;
            }
            let mut count = demand.count(plan.cap, selected_so_far);
            if let (Some(c), Some(cap)) = (count, plan.cap) {
                count = Some(c.min(cap.saturating_sub(selected_so_far)));
            }
            if count == Some(0) {
                continue;
            }

            let mut candidates = match precomputed.remove(node_type) {
                Some(c) => c,
                None => self.candidates(node_type, request, &dict, &filter, &mut rng),
            };
            candidates.retain(|n| !seen.contains(&n.id));
            if let Some(required) = count {
                self.apply_percentages(request, &mut candidates, required);
            }

            let nodes = candidates.select(count, request.selection, &mut rng);
            seen.extend(nodes.iter().map(|n| n.id.clone()));
            selected_so_far += nodes.len();
            selections.push(TypeSelection {
                node_type: node_type.clone(),
                required: match demand {
                    Demand::Exactly(_) => count,
                    Demand::Fill => None,
                },
                nodes,
            });
        }

        apply_preference(policy, &mut selections);
        let overall = plan.overall_requirement();
        self.commit(guard, request, &claim, policy, selections, overall)
    }

    /// RESOLVING: per-type map, then proportional total, then everything
    fn resolve_plan(
        &self,
        request: &AllocationRequest,
        policy: &ConsumerPolicy,
        dict: &NodeDict,
        filter: &CandidateFilter<'_>,
        rng: &mut StdRng,
        precomputed: &mut BTreeMap<String, Candidates>,
    ) -> Plan {
        if !request.num_nodes.is_empty() {
            return resolve::per_type_plan(request);
        }

        let total = request.required_total();
        if let (Some(total), false) = (total, request.supported_types.is_empty()) {
            let mut availability = Vec::with_capacity(request.supported_types.len());
            for node_type in &request.supported_types {
                let candidates = self.candidates(node_type, request, dict, filter, rng);
                availability.push(TypeAvailability {
                    node_type: node_type.clone(),
                    inventory: self.inventory.aliases().total(node_type, dict),
                    eligible: candidates.len(),
                });
                precomputed.insert(node_type.clone(), candidates);
            }
            return resolve::proportional_plan(total, &availability, policy.inflation.as_ref());
        }

        let types = if request.supported_types.is_empty() {
            dict.keys().cloned().collect()
        } else {
            request.supported_types.clone()
        };
        resolve::all_supported_plan(types, total)
    }

    /// FILTERING for one type: alias union, filter, cardinality
    fn candidates(
        &self,
        node_type: &str,
        request: &AllocationRequest,
        dict: &NodeDict,
        filter: &CandidateFilter<'_>,
        rng: &mut StdRng,
    ) -> Candidates {
        let raw = self.inventory.aliases().resolve(node_type, dict);
        let mut candidates = filter.execute(node_type, raw, rng);

        let applies = request.cardinality_types.is_empty()
            || request.cardinality_types.iter().any(|t| t == node_type);
        if !request.cardinality.is_empty() && applies {
            // Retained nodes are never narrowed away
            let matched: BTreeSet<String> = match_cardinality(
                self.cardinality.as_ref(),
                &request.cardinality,
                candidates.others.clone(),
            )
            .into_iter()
            .map(|n| n.id)
            .collect();
            candidates.others.retain(|n| matched.contains(&n.id));
        }
        candidates
    }

    fn apply_percentages(&self, request: &AllocationRequest, candidates: &mut Candidates, required: usize) {
        if request.me_type_percentage.is_empty() {
            return;
        }
        let relevant = candidates
            .others
            .iter()
            .filter_map(|n| n.managed_element_type.as_deref())
            .any(|me| request.me_type_percentage.contains_key(me));
        if !relevant {
            return;
        }
        // Owned and reserved nodes fill part of `required` before the split
        let remaining = required.saturating_sub(candidates.retained.len());
        let kept: BTreeSet<String> = split_by_percentage(
            candidates.others.clone(),
            &request.me_type_percentage,
            remaining,
        )
        .into_iter()
        .map(|n| n.id)
        .collect();
        candidates.others.retain(|n| kept.contains(&n.id));
    }

    fn select_paired(
        &self,
        request: &AllocationRequest,
        pair: &PairedTypes,
        dict: &NodeDict,
        filter: &CandidateFilter<'_>,
        rng: &mut StdRng,
        seen: &mut BTreeSet<String>,
    ) -> Vec<TypeSelection> {
        let primary = self.candidates(&pair.primary, request, dict, filter, rng).into_vec();
        let companion = self.candidates(&pair.companion, request, dict, filter, rng).into_vec();

        // Without counts or a total the pair takes as much as stays balanced
        let (default_primary, default_companion) = match request.required_total() {
            Some(total) => (total.div_ceil(2), total / 2),
            None => {
                let most = primary.len().min(companion.len());
                (most, most)
            }
        };
        let need = |node_type: &str, available: usize, default: usize| match request.num_nodes.get(node_type) {
            Some(&FILL) => available,
            Some(count) if *count >= 0 => *count as usize,
            _ => default,
        };
        let need_primary = need(&pair.primary, primary.len(), default_primary);
        let need_companion = need(&pair.companion, companion.len(), default_companion);

        let balanced = balance_paired(
            primary,
            companion,
            need_primary,
            need_companion,
            request.nodes_per_host,
        );
        if balanced.residual() > 0 {
            warn!(
                consumer = %request.consumer,
                primary = %pair.primary,
                companion = %pair.companion,
                residual = balanced.residual(),
                "Paired allocation could not be balanced in full"
            );
        }
        seen.extend(balanced.primary.iter().map(|n| n.id.clone()));
        seen.extend(balanced.companion.iter().map(|n| n.id.clone()));

        vec![
            TypeSelection {
                node_type: pair.primary.clone(),
                required: Some(need_primary),
                nodes: balanced.primary,
            },
            TypeSelection {
                node_type: pair.companion.clone(),
                required: Some(need_companion),
                nodes: balanced.companion,
            },
        ]
    }

    /// COMMITTING: attach each selected node, skipping per-node conflicts
    fn commit(
        &self,
        guard: &PoolGuard,
        request: &AllocationRequest,
        claim: &Claim,
        policy: &ConsumerPolicy,
        selections: Vec<TypeSelection>,
        overall: Option<usize>,
    ) -> Result<AllocationOutcome, PoolError> {
        debug!(phase = ?AllocationPhase::Committing, consumer = %request.consumer, "Allocation phase");

        let mut committed: BTreeMap<String, Vec<Node>> = BTreeMap::new();
        let mut shortfalls: Vec<Shortfall> = Vec::new();

        for selection in selections {
            let mut attached = Vec::with_capacity(selection.nodes.len());
            for node in selection.nodes {
                if let Some(node) = self.try_attach(guard, &node.id, claim)? {
                    attached.push(node);
                }
            }
            if let Some(required) = selection.required {
                if attached.len() < required {
                    shortfalls.push(Shortfall {
                        node_type: Some(selection.node_type.clone()),
                        required,
                        committed: attached.len(),
                    });
                }
            }
            if !attached.is_empty() {
                committed.entry(selection.node_type).or_default().extend(attached);
            }
        }

        let total: usize = committed.values().map(Vec::len).sum();
        if total == 0 {
            return Err(PoolError::NoResourceAvailable(format!(
                "no eligible nodes could be allocated to '{}'",
                request.consumer
            )));
        }
        if let Some(cap) = overall {
            if total < cap {
                shortfalls.push(Shortfall {
                    node_type: None,
                    required: cap,
                    committed: total,
                });
            }
        }

        let all: Vec<Node> = committed.values().flatten().cloned().collect();
        let ids: Vec<String> = all.iter().map(|n| n.id.clone()).collect();
        self.inventory
            .record_consumer_edges(guard, &request.consumer, &ids)?;
        self.inventory.cache().merge(&all);

        let state = if shortfalls.is_empty() {
            AllocationState::Satisfied
        } else {
            AllocationState::Partial
        };
        let warnings = shortfall_warnings(request, policy, &shortfalls, total);
        info!(
            consumer = %request.consumer,
            committed = total,
            state = ?state,
            warnings = warnings.len(),
            "Allocation finished"
        );
        Ok(AllocationOutcome {
            consumer: request.consumer.clone(),
            state,
            nodes: committed,
            warnings,
        })
    }

    /// Attach one node; per-node conflicts yield `None`
    fn try_attach(&self, guard: &PoolGuard, id: &str, claim: &Claim) -> Result<Option<Node>, PoolError> {
        match self
            .inventory
            .attach(guard, id, claim, &self.exclusive_consumers)
        {
            Ok(node) => Ok(Some(node)),
            Err(PoolError::Attach(err)) => {
                debug!(node = %id, consumer = %claim.consumer, error = %err, "Skipping node");
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    /// Attach an explicit list of node ids
    fn allocate_listed(
        &self,
        guard: &PoolGuard,
        request: &AllocationRequest,
        claim: &Claim,
    ) -> Result<AllocationOutcome, PoolError> {
        let mut committed: BTreeMap<String, Vec<Node>> = BTreeMap::new();
        let mut failed = Vec::new();
        for id in &request.nodes {
            match self.try_attach(guard, id, claim)? {
                Some(node) => committed.entry(node.node_type.clone()).or_default().push(node),
                None => failed.push(id.clone()),
            }
        }

        if committed.is_empty() {
            return Err(PoolError::AttachFailed {
                consumer: request.consumer.clone(),
                details: failed.join(", "),
            });
        }

        let all: Vec<Node> = committed.values().flatten().cloned().collect();
        let ids: Vec<String> = all.iter().map(|n| n.id.clone()).collect();
        self.inventory
            .record_consumer_edges(guard, &request.consumer, &ids)?;
        self.inventory.cache().merge(&all);

        let mut warnings = Vec::new();
        let state = if failed.is_empty() {
            AllocationState::Satisfied
        } else {
            warnings.push(AllocationWarning {
                node_type: None,
                required: request.nodes.len(),
                committed: ids.len(),
                severity: WarningSeverity::Warning,
                message: format!("could not attach: {}", failed.join(", ")),
            });
            AllocationState::Partial
        };
        Ok(AllocationOutcome {
            consumer: request.consumer.clone(),
            state,
            nodes: committed,
            warnings,
        })
    }

    // ------------------------------------------------------------------
    // Deallocate / exchange
    // ------------------------------------------------------------------

    /// Release every node `consumer` holds
    pub fn deallocate(&self, guard: &PoolGuard, consumer: &str) -> Result<DeallocationReport, PoolError> {
        let owned: Vec<String> = self
            .inventory
            .fresh_allocated_nodes(consumer)?
            .into_iter()
            .map(|n| n.id)
            .collect();
        if owned.is_empty() {
            info!("No nodes allocated to '{}', nothing to deallocate", consumer);
            return Ok(DeallocationReport {
                consumer: consumer.to_string(),
                ..Default::default()
            });
        }
        self.detach_all(guard, consumer, &owned)
    }

    /// Release only `ids` from `consumer`
    pub fn deallocate_unused(
        &self,
        guard: &PoolGuard,
        consumer: &str,
        ids: &[String],
    ) -> Result<DeallocationReport, PoolError> {
        self.detach_all(guard, consumer, ids)
    }

    fn detach_all(
        &self,
        guard: &PoolGuard,
        consumer: &str,
        ids: &[String],
    ) -> Result<DeallocationReport, PoolError> {
        let mut report = DeallocationReport {
            consumer: consumer.to_string(),
            ..Default::default()
        };
        let mut released = Vec::new();
        for id in ids {
            match self.inventory.detach(guard, id, consumer) {
                Ok(node) => {
                    report.released.push(node.id.clone());
                    released.push(node);
                }
                Err(PoolError::Attach(err)) => {
                    warn!(node = %id, consumer = %consumer, error = %err, "Failed to detach node");
                    report.failed.push(id.clone());
                }
                Err(err) => return Err(err),
            }
        }

        self.inventory.release_consumer_edges(guard, consumer, ids)?;
        self.inventory.cache().merge(&released);
        info!(
            consumer = %consumer,
            released = report.released.len(),
            failed = report.failed.len(),
            "Deallocated nodes"
        );
        Ok(report)
    }

    /// Release everything `request.consumer` holds, then allocate afresh
    pub fn exchange(&self, guard: &PoolGuard, request: &AllocationRequest) -> Result<ExchangeOutcome, PoolError> {
        request.validate()?;
        let released = self.deallocate(guard, &request.consumer)?;
        let allocated = self.allocate(guard, request)?;
        Ok(ExchangeOutcome { released, allocated })
    }

    // ------------------------------------------------------------------
    // Read-only
    // ------------------------------------------------------------------

    /// Every node `request` could be given right now, from the cache
    pub fn available_nodes(&self, request: &AllocationRequest) -> Result<Vec<Node>, PoolError> {
        let claim = request.claim(&self.exclusive_consumers);
        let dict = self.inventory.node_dict()?;
        let filter = CandidateFilter::new(request, &claim, &self.exclusive_consumers)
            .with_validator(self.validator.as_ref());
        let mut rng = self.rng();

        let types: Vec<String> = if !request.num_nodes.is_empty() {
            request.num_nodes.keys().cloned().collect()
        } else if !request.supported_types.is_empty() {
            request.supported_types.clone()
        } else {
            dict.keys().cloned().collect()
        };

        let mut seen = BTreeSet::new();
        let mut available = Vec::new();
        for node_type in &types {
            for node in self.candidates(node_type, request, &dict, &filter, &mut rng).into_vec() {
                if seen.insert(node.id.clone()) {
                    available.push(node);
                }
            }
        }
        if available.is_empty() {
            return Err(PoolError::NoResourceAvailable(format!(
                "no eligible nodes for '{}'",
                request.consumer
            )));
        }
        Ok(available)
    }
}

// ============================================================================
// SBIO: Pure functions
// ============================================================================

fn is_paired(pair: Option<&PairedTypes>, node_type: &str) -> bool {
    pair.is_some_and(|p| p.primary == node_type || p.companion == node_type)
}

/// Drop the `drop` type when the `keep` type was selected
fn apply_preference(policy: &ConsumerPolicy, selections: &mut Vec<TypeSelection>) {
    let Some(prefer) = &policy.prefer else {
        return;
    };
    let keep_present = selections
        .iter()
        .any(|s| s.node_type == prefer.keep && !s.nodes.is_empty());
    if keep_present {
        selections.retain(|s| s.node_type != prefer.drop);
    }
}

fn shortfall_warnings(
    request: &AllocationRequest,
    policy: &ConsumerPolicy,
    shortfalls: &[Shortfall],
    total: usize,
) -> Vec<AllocationWarning> {
    let mut warnings = Vec::new();

    for shortfall in shortfalls {
        let (required, committed) = (shortfall.required, shortfall.committed);
        warn!(
            consumer = %request.consumer,
            node_type = shortfall.node_type.as_deref().unwrap_or("*"),
            required = required,
            committed = committed,
            "Allocation shortfall"
        );
        let severity = match policy.tolerance {
            Tolerance::Ignore => continue,
            Tolerance::Strict => WarningSeverity::EnvironmentError,
            Tolerance::BestEffort => WarningSeverity::Warning,
        };
        let message = match &shortfall.node_type {
            Some(node_type) => format!(
                "{} of {} '{}' node(s) allocated, {} short",
                committed,
                required,
                node_type,
                required - committed
            ),
            None => format!(
                "{} of {} node(s) allocated in total, {} short",
                committed,
                required,
                required - committed
            ),
        };
        warnings.push(AllocationWarning {
            node_type: shortfall.node_type.clone(),
            required,
            committed,
            severity,
            message,
        });
    }

    // Below the minimum the environment cannot serve the consumer at all
    if let Some(minimum) = request.minimum_nodes.or(policy.minimum) {
        if total < minimum {
            warn!(
                consumer = %request.consumer,
                minimum = minimum,
                committed = total,
                "Allocation below required minimum"
            );
            warnings.push(AllocationWarning {
                node_type: None,
                required: minimum,
                committed: total,
                severity: WarningSeverity::EnvironmentError,
                message: format!(
                    "{} node(s) allocated, below the required minimum of {}",
                    total, minimum
                ),
            });
        }
    }
    warnings
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{InflationRule, PreferRule};
    use crate::pool::lock::PoolLock;
    use crate::pool::node::NodeDescriptor;
    use crate::pool::store::{KvStore, MemoryStore};
    use crate::pool::types::TypeAliases;

    struct Fixture {
        inventory: Arc<Inventory>,
        lock: PoolLock,
    }

    fn fixture() -> Fixture {
        let store: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
        Fixture {
            inventory: Arc::new(Inventory::new(
                Arc::clone(&store),
                Vec::new(),
                TypeAliases::default(),
            )),
            lock: PoolLock::new(store, "test"),
        }
    }

    fn desc(id: &str, node_type: &str, host: &str) -> NodeDescriptor {
        NodeDescriptor {
            id: Some(id.to_string()),
            node_type: Some(node_type.to_string()),
            host: Some(host.to_string()),
            ..Default::default()
        }
    }

    async fn seed(fx: &Fixture, node_type: &str, count: usize, hosts: usize) {
        let guard = fx.lock.acquire().await.unwrap();
        let descs = (0..count)
            .map(|i| desc(&format!("{}{:02}", node_type, i), node_type, &format!("h{}", i % hosts)))
            .collect();
        fx.inventory.add(&guard, descs, None).unwrap();
    }

    fn allocator(fx: &Fixture) -> Allocator {
        Allocator::new(Arc::clone(&fx.inventory), BTreeSet::new(), BTreeMap::new()).with_seed(Some(11))
    }

    fn count(outcome: &AllocationOutcome, node_type: &str) -> usize {
        outcome.nodes.get(node_type).map(Vec::len).unwrap_or(0)
    }

    #[tokio::test]
    async fn test_exact_per_type_split() {
        let fx = fixture();
        seed(&fx, "A", 10, 3).await;
        seed(&fx, "B", 5, 2).await;
        let guard = fx.lock.acquire().await.unwrap();

        let req = AllocationRequest::new("FM_01").with_count("A", 7).with_count("B", 1);
        let outcome = allocator(&fx).allocate(&guard, &req).unwrap();

        assert_eq!(outcome.state, AllocationState::Satisfied);
        assert_eq!(count(&outcome, "A"), 7);
        assert_eq!(count(&outcome, "B"), 1);
        assert!(outcome.warnings.is_empty());
    }

    #[tokio::test]
    async fn test_shortfall_is_partial_with_warnings() {
        let fx = fixture();
        seed(&fx, "A", 5, 2).await;
        let guard = fx.lock.acquire().await.unwrap();

        let req = AllocationRequest::new("FM_01").with_count("A", 6).with_count("B", 1);
        let outcome = allocator(&fx).allocate(&guard, &req).unwrap();

        assert_eq!(outcome.state, AllocationState::Partial);
        assert_eq!(count(&outcome, "A"), 5);
        let short: Vec<_> = outcome
            .warnings
            .iter()
            .map(|w| (w.node_type.clone().unwrap(), w.required - w.committed))
            .collect();
        assert!(short.contains(&("A".to_string(), 1)));
        assert!(short.contains(&("B".to_string(), 1)));
        assert!(!outcome.has_environment_error());
    }

    #[tokio::test]
    async fn test_nothing_matches_fails() {
        let fx = fixture();
        let guard = fx.lock.acquire().await.unwrap();
        let req = AllocationRequest::new("FM_01").with_count("A", 2);
        let err = allocator(&fx).allocate(&guard, &req).unwrap_err();
        assert!(matches!(err, PoolError::NoResourceAvailable(_)));
    }

    #[tokio::test]
    async fn test_fill_takes_what_the_total_leaves() {
        let fx = fixture();
        seed(&fx, "A", 6, 2).await;
        seed(&fx, "B", 6, 2).await;
        let guard = fx.lock.acquire().await.unwrap();

        let req = AllocationRequest::new("PM_01")
            .with_count("A", 3)
            .with_count("B", FILL)
            .with_total(5);
        let outcome = allocator(&fx).allocate(&guard, &req).unwrap();
        assert_eq!(count(&outcome, "A"), 3);
        assert_eq!(count(&outcome, "B"), 2);
        assert_eq!(outcome.state, AllocationState::Satisfied);
    }

    #[tokio::test]
    async fn test_proportional_total() {
        let fx = fixture();
        seed(&fx, "A", 10, 2).await;
        seed(&fx, "B", 5, 2).await;
        let guard = fx.lock.acquire().await.unwrap();

        let req = AllocationRequest::new("CM_01")
            .with_supported_types(["A", "B"])
            .with_total(6);
        let outcome = allocator(&fx).allocate(&guard, &req).unwrap();
        assert_eq!(outcome.total(), 6);
        assert_eq!(count(&outcome, "A"), 4);
        assert_eq!(count(&outcome, "B"), 2);
    }

    #[tokio::test]
    async fn test_total_of_one_truncates() {
        let fx = fixture();
        seed(&fx, "A", 3, 1).await;
        seed(&fx, "B", 3, 1).await;
        let guard = fx.lock.acquire().await.unwrap();

        let req = AllocationRequest::new("CM_01")
            .with_supported_types(["A", "B"])
            .with_total(1);
        let outcome = allocator(&fx).allocate(&guard, &req).unwrap();
        assert_eq!(outcome.total(), 1);
    }

    #[tokio::test]
    async fn test_default_takes_everything() {
        let fx = fixture();
        seed(&fx, "A", 3, 1).await;
        seed(&fx, "B", 2, 1).await;
        let guard = fx.lock.acquire().await.unwrap();

        let outcome = allocator(&fx)
            .allocate(&guard, &AllocationRequest::new("SHM_01"))
            .unwrap();
        assert_eq!(outcome.total(), 5);
        assert_eq!(outcome.state, AllocationState::Satisfied);
    }

    #[tokio::test]
    async fn test_reallocation_is_idempotent() {
        let fx = fixture();
        seed(&fx, "A", 8, 4).await;
        let guard = fx.lock.acquire().await.unwrap();
        let alloc = allocator(&fx);
        let req = AllocationRequest::new("FM_01").with_count("A", 3);

        let first = alloc.allocate(&guard, &req).unwrap();
        let second = alloc.allocate(&guard, &req).unwrap();

        let mut a = first.ids();
        let mut b = second.ids();
        a.sort();
        b.sort();
        assert_eq!(a, b);
        assert_eq!(fx.inventory.fresh_allocated_nodes("FM_01").unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_alias_union_without_duplicates() {
        let fx = fixture();
        seed(&fx, "SGSN", 3, 1).await;
        seed(&fx, "SGSN-MME", 2, 1).await;
        let guard = fx.lock.acquire().await.unwrap();

        let req = AllocationRequest::new("FM_01").with_count("SGSN-MME", FILL);
        let outcome = allocator(&fx).allocate(&guard, &req).unwrap();
        let ids = outcome.ids();
        let unique: BTreeSet<_> = ids.iter().collect();
        assert_eq!(ids.len(), 5);
        assert_eq!(unique.len(), 5);
    }

    #[tokio::test]
    async fn test_exclusive_holder_blocks_others() {
        let fx = fixture();
        seed(&fx, "A", 4, 2).await;
        let guard = fx.lock.acquire().await.unwrap();
        let alloc = allocator(&fx);

        let first = alloc
            .allocate(&guard, &AllocationRequest::new("X").with_count("A", 3).with_exclusive(true))
            .unwrap();
        assert_eq!(first.total(), 3);

        let second = alloc
            .allocate(&guard, &AllocationRequest::new("Y").with_count("A", 4))
            .unwrap();
        assert_eq!(second.total(), 1);
        assert_eq!(second.state, AllocationState::Partial);
    }

    #[tokio::test]
    async fn test_strict_and_ignore_tolerance() {
        let fx = fixture();
        seed(&fx, "A", 2, 1).await;
        let guard = fx.lock.acquire().await.unwrap();

        let policies: BTreeMap<String, ConsumerPolicy> = [
            (
                "STRICT".to_string(),
                ConsumerPolicy {
                    tolerance: Tolerance::Strict,
                    ..Default::default()
                },
            ),
            (
                "QUIET".to_string(),
                ConsumerPolicy {
                    tolerance: Tolerance::Ignore,
                    ..Default::default()
                },
            ),
        ]
        .into();
        let alloc = Allocator::new(Arc::clone(&fx.inventory), BTreeSet::new(), policies);

        let strict = alloc
            .allocate(&guard, &AllocationRequest::new("STRICT").with_count("A", 1).with_count("B", 1))
            .unwrap();
        assert!(strict.has_environment_error());

        let quiet = alloc
            .allocate(&guard, &AllocationRequest::new("QUIET").with_count("A", 1).with_count("B", 1))
            .unwrap();
        assert_eq!(quiet.state, AllocationState::Partial);
        assert!(quiet.warnings.is_empty());
    }

    #[tokio::test]
    async fn test_minimum_not_met_is_environment_error() {
        let fx = fixture();
        seed(&fx, "A", 2, 1).await;
        let guard = fx.lock.acquire().await.unwrap();

        let req = AllocationRequest::new("FM_01").with_count("A", 5).with_minimum(3);
        let outcome = allocator(&fx).allocate(&guard, &req).unwrap();
        assert!(outcome
            .warnings
            .iter()
            .any(|w| w.node_type.is_none() && w.severity == WarningSeverity::EnvironmentError));
    }

    #[tokio::test]
    async fn test_inflation_policy() {
        let fx = fixture();
        seed(&fx, "ERBS", 8, 2).await;
        seed(&fx, "BSC", 10, 2).await;
        let guard = fx.lock.acquire().await.unwrap();

        let policies: BTreeMap<String, ConsumerPolicy> = [(
            "BATCH".to_string(),
            ConsumerPolicy {
                inflation: Some(InflationRule {
                    node_type: "BSC".to_string(),
                    minimum: 7,
                    multiplier: 1.0,
                }),
                ..Default::default()
            },
        )]
        .into();
        let alloc = Allocator::new(Arc::clone(&fx.inventory), BTreeSet::new(), policies);
        let req = AllocationRequest::new("BATCH")
            .with_supported_types(["ERBS", "BSC"])
            .with_total(9);
        let outcome = alloc.allocate(&guard, &req).unwrap();
        assert_eq!(count(&outcome, "BSC"), 7);
        assert_eq!(outcome.total(), 9);
    }

    #[tokio::test]
    async fn test_preference_drops_type() {
        let fx = fixture();
        seed(&fx, "RadioNode", 2, 1).await;
        seed(&fx, "ERBS", 2, 1).await;
        let guard = fx.lock.acquire().await.unwrap();

        let policies: BTreeMap<String, ConsumerPolicy> = [(
            "NHM_01".to_string(),
            ConsumerPolicy {
                prefer: Some(PreferRule {
                    keep: "RadioNode".to_string(),
                    drop: "ERBS".to_string(),
                }),
                ..Default::default()
            },
        )]
        .into();
        let alloc = Allocator::new(Arc::clone(&fx.inventory), BTreeSet::new(), policies);
        let outcome = alloc
            .allocate(&guard, &AllocationRequest::new("NHM_01"))
            .unwrap();
        assert_eq!(count(&outcome, "RadioNode"), 2);
        assert_eq!(count(&outcome, "ERBS"), 0);
    }

    #[tokio::test]
    async fn test_listed_nodes() {
        let fx = fixture();
        seed(&fx, "A", 3, 1).await;
        let guard = fx.lock.acquire().await.unwrap();
        let alloc = allocator(&fx);

        let outcome = alloc
            .allocate(&guard, &AllocationRequest::new("X").with_nodes(["A00", "missing"]))
            .unwrap();
        assert_eq!(outcome.total(), 1);
        assert_eq!(outcome.state, AllocationState::Partial);

        let err = alloc
            .allocate(&guard, &AllocationRequest::new("X").with_nodes(["missing"]))
            .unwrap_err();
        assert!(matches!(err, PoolError::AttachFailed { .. }));
    }

    #[tokio::test]
    async fn test_deallocate_and_noop() {
        let fx = fixture();
        seed(&fx, "A", 3, 1).await;
        let guard = fx.lock.acquire().await.unwrap();
        let alloc = allocator(&fx);

        alloc
            .allocate(&guard, &AllocationRequest::new("FM_01").with_count("A", 2))
            .unwrap();
        let report = alloc.deallocate(&guard, "FM_01").unwrap();
        assert_eq!(report.released.len(), 2);
        assert!(report.failed.is_empty());
        assert!(fx.inventory.fresh_allocated_nodes("FM_01").unwrap().is_empty());
        assert!(fx.inventory.consumer_record("FM_01").unwrap().is_none());

        let again = alloc.deallocate(&guard, "FM_01").unwrap();
        assert!(again.released.is_empty());
    }

    #[tokio::test]
    async fn test_deallocate_unused_reports_failures() {
        let fx = fixture();
        seed(&fx, "A", 3, 1).await;
        let guard = fx.lock.acquire().await.unwrap();
        let alloc = allocator(&fx);

        alloc
            .allocate(&guard, &AllocationRequest::new("FM_01").with_nodes(["A00", "A01"]))
            .unwrap();
        let report = alloc
            .deallocate_unused(&guard, "FM_01", &["A00".to_string(), "A02".to_string()])
            .unwrap();
        assert_eq!(report.released, vec!["A00".to_string()]);
        assert_eq!(report.failed, vec!["A02".to_string()]);
        assert_eq!(fx.inventory.fresh_allocated_nodes("FM_01").unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_exchange_swaps_allocation() {
        let fx = fixture();
        seed(&fx, "A", 3, 1).await;
        seed(&fx, "B", 3, 1).await;
        let guard = fx.lock.acquire().await.unwrap();
        let alloc = allocator(&fx);

        alloc
            .allocate(&guard, &AllocationRequest::new("FM_01").with_count("A", 2))
            .unwrap();
        let exchanged = alloc
            .exchange(&guard, &AllocationRequest::new("FM_01").with_count("B", 2))
            .unwrap();
        assert_eq!(exchanged.released.released.len(), 2);
        assert_eq!(count(&exchanged.allocated, "B"), 2);
        let held = fx.inventory.fresh_allocated_nodes("FM_01").unwrap();
        assert!(held.iter().all(|n| n.node_type == "B"));
    }

    #[tokio::test]
    async fn test_available_nodes_is_read_only() {
        let fx = fixture();
        seed(&fx, "A", 3, 1).await;
        let alloc = allocator(&fx);

        let nodes = alloc
            .available_nodes(&AllocationRequest::new("FM_01").with_count("A", 1))
            .unwrap();
        assert_eq!(nodes.len(), 3);
        assert!(fx.inventory.fresh_allocated_nodes("FM_01").unwrap().is_empty());

        let err = alloc
            .available_nodes(&AllocationRequest::new("FM_01").with_count("Z", 1))
            .unwrap_err();
        assert!(matches!(err, PoolError::NoResourceAvailable(_)));
    }

    #[tokio::test]
    async fn test_paired_types_stay_balanced() {
        let fx = fixture();
        seed(&fx, "TCU", 4, 2).await;
        seed(&fx, "SIU", 4, 2).await;
        let guard = fx.lock.acquire().await.unwrap();

        let req = AllocationRequest::new("FM_01")
            .with_paired_types("TCU", "SIU")
            .with_count("TCU", 2)
            .with_count("SIU", 2);
        let outcome = allocator(&fx).allocate(&guard, &req).unwrap();
        assert_eq!(count(&outcome, "TCU"), 2);
        assert_eq!(count(&outcome, "SIU"), 2);
        assert_eq!(outcome.state, AllocationState::Satisfied);
    }

    #[tokio::test]
    async fn test_total_without_supported_types_is_met_across_types() {
        let fx = fixture();
        seed(&fx, "A", 3, 1).await;
        seed(&fx, "B", 3, 1).await;
        let guard = fx.lock.acquire().await.unwrap();

        let outcome = allocator(&fx)
            .allocate(&guard, &AllocationRequest::new("CM_01").with_total(5))
            .unwrap();
        assert_eq!(outcome.total(), 5);
        assert_eq!(outcome.state, AllocationState::Satisfied);
        assert!(outcome.warnings.is_empty());
    }

    #[tokio::test]
    async fn test_total_beyond_inventory_warns_once() {
        let fx = fixture();
        seed(&fx, "A", 3, 1).await;
        seed(&fx, "B", 3, 1).await;
        let guard = fx.lock.acquire().await.unwrap();

        let outcome = allocator(&fx)
            .allocate(&guard, &AllocationRequest::new("CM_01").with_total(8))
            .unwrap();
        assert_eq!(outcome.total(), 6);
        assert_eq!(outcome.state, AllocationState::Partial);
        assert_eq!(outcome.warnings.len(), 1);
        assert_eq!(outcome.warnings[0].node_type, None);
        assert_eq!(outcome.warnings[0].required, 8);
        assert_eq!(outcome.warnings[0].committed, 6);
    }

    #[tokio::test]
    async fn test_huge_total_takes_everything_eligible() {
        let fx = fixture();
        seed(&fx, "A", 10, 2).await;
        seed(&fx, "B", 5, 2).await;
        let guard = fx.lock.acquire().await.unwrap();

        let req = AllocationRequest::new("CM_01")
            .with_supported_types(["A", "B"])
            .with_total(usize::MAX / 4);
        let outcome = allocator(&fx).allocate(&guard, &req).unwrap();
        assert_eq!(count(&outcome, "A"), 10);
        assert_eq!(count(&outcome, "B"), 5);
        assert_eq!(outcome.state, AllocationState::Partial);
    }

    #[tokio::test]
    async fn test_paired_types_without_counts_take_balanced_maximum() {
        let fx = fixture();
        seed(&fx, "TCU", 4, 2).await;
        seed(&fx, "SIU", 4, 2).await;
        let guard = fx.lock.acquire().await.unwrap();

        let req = AllocationRequest::new("FM_01").with_paired_types("TCU", "SIU");
        let outcome = allocator(&fx).allocate(&guard, &req).unwrap();
        assert_eq!(count(&outcome, "TCU"), 4);
        assert_eq!(count(&outcome, "SIU"), 4);
        assert_eq!(outcome.state, AllocationState::Satisfied);
    }

    #[tokio::test]
    async fn test_owned_nodes_survive_percentage_split() {
        let fx = fixture();
        seed(&fx, "A", 2, 1).await;
        let guard = fx.lock.acquire().await.unwrap();
        let alloc = allocator(&fx);

        let first = alloc
            .allocate(&guard, &AllocationRequest::new("PM_01").with_count("A", 2))
            .unwrap();
        let mut owned = first.ids();
        owned.sort();

        let typed = (0..4)
            .map(|i| NodeDescriptor {
                managed_element_type: Some("ERBS".to_string()),
                ..desc(&format!("M{:02}", i), "A", "h1")
            })
            .collect();
        fx.inventory.add(&guard, typed, None).unwrap();

        let again = alloc
            .allocate(
                &guard,
                &AllocationRequest::new("PM_01")
                    .with_count("A", 2)
                    .with_percentage("ERBS", 100.0),
            )
            .unwrap();
        let mut ids = again.ids();
        ids.sort();
        assert_eq!(ids, owned);
        assert_eq!(again.state, AllocationState::Satisfied);
    }
}
