//! Required-count resolution
//!
//! Turns a request into an ordered list of per-type demands. Precedence:
//! 1. explicit per-type counts (`-1` fills whatever the total leaves)
//! 2. a total split proportionally across supported types by inventory size
//! 3. every available node of the supported (or all known) types

use serde::Serialize;

use super::request::{AllocationRequest, FILL};
use crate::config::InflationRule;

/// How many nodes of one type to take
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Demand {
    /// A fixed count
    Exactly(usize),
    /// Whatever the overall cap leaves after earlier entries; all without a cap
    Fill,
}

impl Demand {
    /// Concrete count given the overall cap and what earlier entries selected
    pub fn count(&self, cap: Option<usize>, selected_so_far: usize) -> Option<usize> {
        match self {
            Demand::Exactly(n) => Some(*n),
            Demand::Fill => cap.map(|c| c.saturating_sub(selected_so_far)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanSource {
    PerType,
    Proportional,
    AllSupported,
    Paired,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Plan {
    pub source: PlanSource,
    pub entries: Vec<(String, Demand)>,
    pub cap: Option<usize>,
}

impl Plan {
    /// Cap the committed total is checked against as a whole
    ///
    /// Fill entries carry no count of their own, and a proportional split can
    /// leave part of the total with nowhere to go.
    pub fn overall_requirement(&self) -> Option<usize> {
        let whole = self.source == PlanSource::Proportional
            || self.entries.iter().any(|(_, demand)| *demand == Demand::Fill);
        self.cap.filter(|_| whole)
    }
}

/// Inventory size and eligible candidates for one supported type
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeAvailability {
    pub node_type: String,
    pub inventory: usize,
    pub eligible: usize,
}

/// Plan from the explicit per-type map, largest count first
pub fn per_type_plan(request: &AllocationRequest) -> Plan {
    let entries = request
        .ordered_counts()
        .into_iter()
        .map(|(node_type, count)| {
            let demand = if count == FILL {
                Demand::Fill
            } else {
                Demand::Exactly(count.max(0) as usize)
            };
            (node_type, demand)
        })
        .collect();
    Plan {
        source: PlanSource::PerType,
        entries,
        cap: request.max_nodes.or(request.total_nodes),
    }
}

/// Plan taking everything of `types`, bounded by `cap` when given
pub fn all_supported_plan(types: Vec<String>, cap: Option<usize>) -> Plan {
    Plan {
        source: PlanSource::AllSupported,
        entries: types.into_iter().map(|t| (t, Demand::Fill)).collect(),
        cap,
    }
}

/// Split `total` across `types` in proportion to their inventory size
///
/// Shares are rounded up, trimmed back to `total`, then any share a type
/// cannot fill is moved onto types with spare eligible nodes. An inflation
/// rule may then raise one type's share at the expense of the others.
pub fn proportional_plan(
    total: usize,
    types: &[TypeAvailability],
    inflation: Option<&InflationRule>,
) -> Plan {
    let inventories: Vec<usize> = types.iter().map(|t| t.inventory).collect();
    let eligible: Vec<usize> = types.iter().map(|t| t.eligible).collect();
    // Past the eligible sum every type ends up at its eligible count anyway
    let budget = total.min(eligible.iter().sum());

    let mut shares = expected_shares(budget, &inventories);
    trim_to_total(&mut shares, budget, None);
    correct_under_allocation(&mut shares, &eligible);

    let protected = inflation.and_then(|rule| {
        let index = types.iter().position(|t| t.node_type == rule.node_type)?;
        apply_inflation(&mut shares, index, rule, eligible[index]);
        Some(index)
    });
    trim_to_total(&mut shares, budget, protected);

    Plan {
        source: PlanSource::Proportional,
        entries: types
            .iter()
            .zip(shares)
            .map(|(t, share)| (t.node_type.clone(), Demand::Exactly(share)))
            .collect(),
        cap: Some(total),
    }
}

/// `ceil(total * inventory / sum)` per type
pub fn expected_shares(total: usize, inventories: &[usize]) -> Vec<usize> {
    let sum: usize = inventories.iter().sum();
    if sum == 0 {
        return vec![0; inventories.len()];
    }
    inventories
        .iter()
        .map(|count| {
            let share = (total as u128 * *count as u128).div_ceil(sum as u128);
            usize::try_from(share).unwrap_or(usize::MAX)
        })
        .collect()
}

/// Remove units from the largest shares until the sum fits `total`
///
/// Among equal shares the later type gives first, so earlier supported types
/// keep priority. `protected` is only trimmed once nothing else is left.
pub fn trim_to_total(shares: &mut [usize], total: usize, protected: Option<usize>) {
    while shares.iter().sum::<usize>() > total {
        let candidate = largest_index(shares, protected).or_else(|| largest_index(shares, None));
        match candidate {
            Some(i) => shares[i] -= 1,
            None => break,
        }
    }
}

fn largest_index(shares: &[usize], skip: Option<usize>) -> Option<usize> {
    shares
        .iter()
        .enumerate()
        .filter(|(i, share)| Some(*i) != skip && **share > 0)
        .fold(None, |best: Option<(usize, usize)>, (i, share)| match best {
            Some((_, best_share)) if best_share > *share => best,
            _ => Some((i, *share)),
        })
        .map(|(i, _)| i)
}

/// Cap each share at its eligible count and hand the deficit to types with
/// spare eligible nodes, in supported-type order
pub fn correct_under_allocation(shares: &mut [usize], eligible: &[usize]) {
    let mut deficit = 0;
    for (share, available) in shares.iter_mut().zip(eligible) {
        if *share > *available {
            deficit += *share - *available;
            *share = *available;
        }
    }
    for (share, available) in shares.iter_mut().zip(eligible) {
        if deficit == 0 {
            break;
        }
        let moved = (*available - *share).min(deficit);
        *share += moved;
        deficit -= moved;
    }
}

/// Raise one share by the rule's multiplier or to its floor, within `eligible`
pub fn apply_inflation(shares: &mut [usize], index: usize, rule: &InflationRule, eligible: usize) {
    let Some(share) = shares.get_mut(index) else {
        return;
    };
    let multiplied = (*share as f64 * rule.multiplier).ceil() as usize;
    let target = multiplied.max(rule.minimum).min(eligible);
    if target > *share {
        *share = target;
    }
}
