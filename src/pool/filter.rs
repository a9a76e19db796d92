//! Candidate filter and host distribution engine
//!
//! Narrows the raw candidates of one type to the policy-compliant subset:
//! - availability and exclusivity for the requesting claim
//! - explicit exclusions (node ids, simulation name fragments)
//! - per-type attribute allow-lists
//! - optional synchronization check
//! - per-host caps
//!
//! Nodes the consumer already holds (or that are reserved for it) bypass the
//! exclusion and attribute filters and are always offered first, which makes
//! re-allocation idempotent.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use rand::seq::SliceRandom;
use rand::Rng;

use super::node::{Claim, Node};
use super::request::{AllocationRequest, Selection};
use super::validate::SyncValidator;

// ============================================================================
// Candidate set
// ============================================================================

/// Eligible candidates for one type
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Candidates {
    /// Already owned by or reserved for the consumer, owned first
    pub retained: Vec<Node>,
    /// Everything else that passed the filters, shuffled
    pub others: Vec<Node>,
}

impl Candidates {
    pub fn len(&self) -> usize {
        self.retained.len() + self.others.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn into_vec(self) -> Vec<Node> {
        let mut nodes = self.retained;
        nodes.extend(self.others);
        nodes
    }

    /// Keep only the nodes `keep` accepts
    pub fn retain<F>(&mut self, keep: F)
    where
        F: Fn(&Node) -> bool,
    {
        self.retained.retain(|n| keep(n));
        self.others.retain(|n| keep(n));
    }

    /// Cap each host's contribution, retained nodes counted first
    pub fn capped_per_host(self, cap: usize) -> Self {
        let mut per_host: BTreeMap<String, usize> = BTreeMap::new();
        let mut admit = |node: &Node| {
            let taken = per_host.entry(node.host.clone()).or_insert(0);
            if *taken < cap {
                *taken += 1;
                true
            } else {
                false
            }
        };
        let retained: Vec<Node> = self.retained.into_iter().filter(|n| admit(n)).collect();
        let others: Vec<Node> = self.others.into_iter().filter(|n| admit(n)).collect();
        Self { retained, others }
    }

    /// Pick up to `count` nodes (all when `None`), retained nodes first
    pub fn select<R: Rng + ?Sized>(
        self,
        count: Option<usize>,
        selection: Selection,
        rng: &mut R,
    ) -> Vec<Node> {
        let Some(count) = count else {
            return self.into_vec();
        };

        let mut picked: Vec<Node> = self.retained.into_iter().take(count).collect();
        let remaining = count - picked.len();
        let rest = match selection {
            Selection::Distributed => distribute(self.others, remaining),
            Selection::Random => {
                let mut others = self.others;
                others.shuffle(rng);
                others.truncate(remaining);
                others
            }
        };
        picked.extend(rest);
        picked
    }
}

// ============================================================================
// Filter
// ============================================================================

pub struct CandidateFilter<'a> {
    request: &'a AllocationRequest,
    claim: &'a Claim,
    exclusive_consumers: &'a BTreeSet<String>,
    validator: Option<&'a dyn SyncValidator>,
}

impl<'a> CandidateFilter<'a> {
    pub fn new(
        request: &'a AllocationRequest,
        claim: &'a Claim,
        exclusive_consumers: &'a BTreeSet<String>,
    ) -> Self {
        Self {
            request,
            claim,
            exclusive_consumers,
            validator: None,
        }
    }

    pub fn with_validator(mut self, validator: &'a dyn SyncValidator) -> Self {
        self.validator = Some(validator);
        self
    }

    /// Filter the raw candidates of `node_type`
    pub fn execute<R: Rng + ?Sized>(&self, node_type: &str, raw: Vec<Node>, rng: &mut R) -> Candidates {
        let consumer = self.claim.consumer.as_str();
        let attribute_filter = self.request.node_attributes.get(node_type);

        let mut retained = Vec::new();
        let mut others = Vec::new();
        for node in raw {
            if !node.is_available_for(self.claim, self.exclusive_consumers) {
                continue;
            }
            if node.is_owned_by(consumer) || node.is_reserved_for(consumer) {
                retained.push(node);
                continue;
            }
            if self.request.exclude_nodes.contains(&node.id) || self.in_excluded_simulation(&node) {
                continue;
            }
            if let Some(filter) = attribute_filter {
                if !attribute_match(&node, filter) {
                    continue;
                }
            }
            others.push(node);
        }

        if self.request.check_sync {
            if let Some(validator) = self.validator {
                let ids: Vec<String> = others.iter().map(|n| n.id.clone()).collect();
                let synced: BTreeSet<String> = validator.confirmed(&ids).into_iter().collect();
                others.retain(|n| synced.contains(&n.id));
            }
        }

        others.shuffle(rng);
        // Stable sort: nodes already owned ahead of merely reserved ones
        retained.sort_by_key(|n| !n.is_owned_by(consumer));

        let candidates = Candidates { retained, others };
        match self.request.nodes_per_host {
            Some(cap) => candidates.capped_per_host(cap),
            None => candidates,
        }
    }

    fn in_excluded_simulation(&self, node: &Node) -> bool {
        let Some(simulation) = node.simulation.as_deref() else {
            return false;
        };
        self.request
            .exclude_simulations
            .iter()
            .any(|fragment| simulation.contains(fragment.as_str()))
    }
}

/// Whether `node` passes a type's attribute allow-list
///
/// `model` values exclude, `node_ip` values match as address substrings,
/// every other key must equal one of its listed values.
pub fn attribute_match(node: &Node, filter: &BTreeMap<String, Vec<String>>) -> bool {
    filter.iter().all(|(key, allowed)| {
        if allowed.is_empty() {
            return true;
        }
        let value = node.attribute(key);
        match key.as_str() {
            "model" => value.map_or(true, |v| !allowed.iter().any(|a| a == v)),
            "node_ip" | "address" => {
                value.is_some_and(|v| allowed.iter().any(|a| v.contains(a.as_str())))
            }
            _ => value.is_some_and(|v| allowed.iter().any(|a| a == v)),
        }
    })
}

// ============================================================================
// Distribution
// ============================================================================

/// Group by host, keeping hosts in order of first appearance
pub fn group_by_host(nodes: Vec<Node>) -> Vec<(String, Vec<Node>)> {
    let mut position: BTreeMap<String, usize> = BTreeMap::new();
    let mut groups: Vec<(String, Vec<Node>)> = Vec::new();
    for node in nodes {
        match position.get(&node.host) {
            Some(&i) => groups[i].1.push(node),
            None => {
                position.insert(node.host.clone(), groups.len());
                groups.push((node.host.clone(), vec![node]));
            }
        }
    }
    groups
}

/// Take `count` nodes one host at a time, skipping exhausted hosts
pub fn distribute(nodes: Vec<Node>, count: usize) -> Vec<Node> {
    if nodes.len() <= count {
        return nodes;
    }

    let mut queues: Vec<VecDeque<Node>> = group_by_host(nodes)
        .into_iter()
        .map(|(_, group)| group.into())
        .collect();
    let mut picked = Vec::with_capacity(count);
    while picked.len() < count {
        let mut progressed = false;
        for queue in queues.iter_mut() {
            if picked.len() == count {
                break;
            }
            if let Some(node) = queue.pop_front() {
                picked.push(node);
                progressed = true;
            }
        }
        if !progressed {
            break;
        }
    }
    picked
}

/// Keep `round(pct * required / 100)` nodes of each managed element type
pub fn split_by_percentage(
    nodes: Vec<Node>,
    percentages: &BTreeMap<String, f64>,
    required: usize,
) -> Vec<Node> {
    let mut quotas: BTreeMap<&str, usize> = percentages
        .iter()
        .map(|(me_type, pct)| {
            let quota = (pct * required as f64 / 100.0).round() as usize;
            (me_type.as_str(), quota)
        })
        .collect();

    nodes
        .into_iter()
        .filter(|node| {
            let Some(me_type) = node.managed_element_type.as_deref() else {
                return false;
            };
            match quotas.get_mut(me_type) {
                Some(left) if *left > 0 => {
                    *left -= 1;
                    true
                }
                _ => false,
            }
        })
        .collect()
}

// ============================================================================
// Paired-type balancing
// ============================================================================

/// Result of balancing two correlated types across hosts
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PairedSelection {
    pub primary: Vec<Node>,
    pub companion: Vec<Node>,
    pub residual_primary: usize,
    pub residual_companion: usize,
}

impl PairedSelection {
    pub fn residual(&self) -> usize {
        self.residual_primary + self.residual_companion
    }
}

#[derive(Default)]
struct HostPair {
    primary: VecDeque<Node>,
    companion: VecDeque<Node>,
    taken: usize,
}

impl HostPair {
    fn is_complete(&self) -> bool {
        !self.primary.is_empty() && !self.companion.is_empty()
    }
}

/// Fill both requirements host by host, complete hosts first
///
/// Hosts offering both types contribute matched pairs. Remaining need is then
/// pulled from leftovers; a host offering only one type contributes at most
/// half of its per-host allowance so single-type hosts cannot skew the
/// pairing. Unfilled need is reported as residual.
pub fn balance_paired(
    primary: Vec<Node>,
    companion: Vec<Node>,
    need_primary: usize,
    need_companion: usize,
    per_host: Option<usize>,
) -> PairedSelection {
    let mut hosts: BTreeMap<String, HostPair> = BTreeMap::new();
    for node in primary {
        hosts.entry(node.host.clone()).or_default().primary.push_back(node);
    }
    for node in companion {
        hosts.entry(node.host.clone()).or_default().companion.push_back(node);
    }

    let mut order: Vec<String> = hosts.keys().cloned().collect();
    order.sort_by(|a, b| {
        let (ha, hb) = (&hosts[a], &hosts[b]);
        hb.is_complete()
            .cmp(&ha.is_complete())
            .then_with(|| pair_depth(hb).cmp(&pair_depth(ha)))
            .then_with(|| a.cmp(b))
    });

    let limit = per_host.unwrap_or(usize::MAX);
    let mut result = PairedSelection::default();
    let mut need_p = need_primary;
    let mut need_c = need_companion;

    // Matched pairs from hosts carrying both types
    for host in &order {
        let Some(slot) = hosts.get_mut(host) else { continue };
        if !slot.is_complete() {
            continue;
        }
        let pairs = slot
            .primary
            .len()
            .min(slot.companion.len())
            .min(need_p)
            .min(need_c)
            .min(limit / 2);
        for _ in 0..pairs {
            if let (Some(p), Some(c)) = (slot.primary.pop_front(), slot.companion.pop_front()) {
                result.primary.push(p);
                result.companion.push(c);
            }
        }
        slot.taken += pairs * 2;
        need_p -= pairs;
        need_c -= pairs;
    }

    // Leftovers and single-type hosts
    for host in &order {
        if need_p == 0 && need_c == 0 {
            break;
        }
        let Some(slot) = hosts.get_mut(host) else { continue };
        let single_type = slot.primary.is_empty() != slot.companion.is_empty() && slot.taken == 0;
        let mut room = limit.saturating_sub(slot.taken);
        if single_type && per_host.is_some() {
            room = room.div_ceil(2);
        }

        let take_p = slot.primary.len().min(need_p).min(room);
        result.primary.extend(slot.primary.drain(..take_p));
        need_p -= take_p;
        room -= take_p;

        let take_c = slot.companion.len().min(need_c).min(room);
        result.companion.extend(slot.companion.drain(..take_c));
        need_c -= take_c;

        slot.taken += take_p + take_c;
    }

    result.residual_primary = need_p;
    result.residual_companion = need_c;
    result
}

fn pair_depth(slot: &HostPair) -> usize {
    slot.primary.len().min(slot.companion.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn rng() -> StdRng {
        StdRng::seed_from_u64(7)
    }

    fn on_hosts(prefix: &str, node_type: &str, layout: &[(&str, usize)]) -> Vec<Node> {
        let mut nodes = Vec::new();
        for (host, count) in layout {
            for i in 0..*count {
                nodes.push(Node::new(format!("{}-{}-{}", prefix, host, i), node_type, *host));
            }
        }
        nodes
    }

    fn host_counts(nodes: &[Node]) -> BTreeMap<String, usize> {
        let mut counts = BTreeMap::new();
        for node in nodes {
            *counts.entry(node.host.clone()).or_insert(0) += 1;
        }
        counts
    }

    #[test]
    fn test_attribute_match_semantics() {
        let node = Node::new("n1", "ERBS", "h1")
            .with_model("6B")
            .with_address("2001:db8::1")
            .with_version("H.1.120");

        let filter = |k: &str, v: &[&str]| -> BTreeMap<String, Vec<String>> {
            [(k.to_string(), v.iter().map(|s| s.to_string()).collect())].into()
        };

        assert!(attribute_match(&node, &filter("version", &["H.1.120", "J.1"])));
        assert!(!attribute_match(&node, &filter("version", &["J.1"])));
        assert!(!attribute_match(&node, &filter("model", &["6B"])));
        assert!(attribute_match(&node, &filter("model", &["7A"])));
        assert!(attribute_match(&node, &filter("node_ip", &[":"])));
        assert!(!attribute_match(&node, &filter("node_ip", &["."])));
        assert!(attribute_match(&node, &BTreeMap::new()));
    }

    #[test]
    fn test_filter_excludes_unavailable_and_filtered() {
        let request = AllocationRequest::new("FM_01")
            .with_attribute_filter("ERBS", "version", ["J.1"])
            .with_excluded_simulation("UPGIND");
        let claim = request.claim(&BTreeSet::new());
        let globals = BTreeSet::new();
        let filter = CandidateFilter::new(&request, &claim, &globals);

        let mut held = Node::new("held", "ERBS", "h1").with_version("J.1");
        held.ownership.insert("SHM_01".into());
        held.exclusive = true;

        let raw = vec![
            Node::new("ok", "ERBS", "h1").with_version("J.1"),
            Node::new("old", "ERBS", "h1").with_version("H.1"),
            Node::new("upg", "ERBS", "h1")
                .with_version("J.1")
                .with_simulation("LTE-UPGIND-01"),
            held,
            Node::new("mine", "ERBS", "h2").reserved_for("FM_01"),
        ];
        let candidates = filter.execute("ERBS", raw, &mut rng());
        assert_eq!(candidates.retained.len(), 1);
        assert_eq!(candidates.retained[0].id, "mine");
        assert_eq!(candidates.others.len(), 1);
        assert_eq!(candidates.others[0].id, "ok");
    }

    #[test]
    fn test_owned_before_reserved() {
        let request = AllocationRequest::new("FM_01");
        let claim = request.claim(&BTreeSet::new());
        let globals = BTreeSet::new();
        let filter = CandidateFilter::new(&request, &claim, &globals);

        let mut owned = Node::new("owned", "ERBS", "h1");
        owned.ownership.insert("FM_01".into());
        let raw = vec![Node::new("reserved", "ERBS", "h1").reserved_for("fm_01"), owned];

        let candidates = filter.execute("ERBS", raw, &mut rng());
        let ids: Vec<&str> = candidates.retained.iter().map(|n| n.id.as_str()).collect();
        assert_eq!(ids, vec!["owned", "reserved"]);
    }

    #[test]
    fn test_nodes_per_host_cap() {
        let request = AllocationRequest::new("FM_01").with_nodes_per_host(2);
        let claim = request.claim(&BTreeSet::new());
        let globals = BTreeSet::new();
        let filter = CandidateFilter::new(&request, &claim, &globals);

        let raw = on_hosts("n", "ERBS", &[("h1", 5), ("h2", 1), ("h3", 3)]);
        let candidates = filter.execute("ERBS", raw, &mut rng());
        let counts = host_counts(&candidates.into_vec());
        assert_eq!(counts["h1"], 2);
        assert_eq!(counts["h2"], 1);
        assert_eq!(counts["h3"], 2);
    }

    #[test]
    fn test_distribute_one_per_host_when_fewer_than_hosts() {
        let nodes = on_hosts("n", "ERBS", &[("h1", 3), ("h2", 3), ("h3", 3), ("h4", 3)]);
        let picked = distribute(nodes, 3);
        assert_eq!(picked.len(), 3);
        assert!(host_counts(&picked).values().all(|c| *c == 1));
    }

    #[test]
    fn test_distribute_skips_exhausted_hosts() {
        let nodes = on_hosts("n", "ERBS", &[("h1", 1), ("h2", 6)]);
        let picked = distribute(nodes, 4);
        let counts = host_counts(&picked);
        assert_eq!(counts["h1"], 1);
        assert_eq!(counts["h2"], 3);
    }

    #[test]
    fn test_select_prefers_retained() {
        let mut owned = Node::new("owned", "ERBS", "h9");
        owned.ownership.insert("FM_01".into());
        let candidates = Candidates {
            retained: vec![owned],
            others: on_hosts("n", "ERBS", &[("h1", 2), ("h2", 2)]),
        };
        let picked = candidates.select(Some(3), Selection::Distributed, &mut rng());
        assert_eq!(picked[0].id, "owned");
        assert_eq!(picked.len(), 3);

        let candidates = Candidates {
            retained: vec![],
            others: on_hosts("n", "ERBS", &[("h1", 4)]),
        };
        assert_eq!(candidates.select(None, Selection::Random, &mut rng()).len(), 4);
    }

    #[test]
    fn test_split_by_percentage() {
        let mut nodes = Vec::new();
        for i in 0..6 {
            nodes.push(Node::new(format!("a{}", i), "RadioNode", "h1").with_managed_element_type("ERBS"));
            nodes.push(Node::new(format!("b{}", i), "RadioNode", "h1").with_managed_element_type("NodeB"));
        }
        nodes.push(Node::new("plain", "RadioNode", "h1"));

        let pct: BTreeMap<String, f64> = [("ERBS".to_string(), 75.0), ("NodeB".to_string(), 25.0)].into();
        let picked = split_by_percentage(nodes, &pct, 4);
        let erbs = picked
            .iter()
            .filter(|n| n.managed_element_type.as_deref() == Some("ERBS"))
            .count();
        assert_eq!(erbs, 3);
        assert_eq!(picked.len(), 4);
    }

    #[test]
    fn test_balance_paired_prefers_complete_hosts() {
        let tcu = on_hosts("t", "TCU02", &[("h1", 2), ("h2", 2), ("h3", 3)]);
        let siu = on_hosts("s", "SIU02", &[("h1", 2), ("h2", 2)]);

        let result = balance_paired(tcu, siu, 4, 4, Some(4));
        assert_eq!(result.primary.len(), 4);
        assert_eq!(result.companion.len(), 4);
        assert_eq!(result.residual(), 0);
        // All pairs come from the hosts carrying both types
        assert!(result.primary.iter().all(|n| n.host != "h3"));
    }

    #[test]
    fn test_balance_paired_reports_residual() {
        let tcu = on_hosts("t", "TCU02", &[("h1", 1), ("h2", 4)]);
        let siu = on_hosts("s", "SIU02", &[("h1", 1)]);

        let result = balance_paired(tcu, siu, 3, 3, Some(2));
        assert_eq!(result.companion.len(), 1);
        assert_eq!(result.residual_companion, 2);
        // Single-type host h2 gives half of its allowance
        assert_eq!(result.primary.len(), 2);
        assert_eq!(result.residual_primary, 1);
    }
}
