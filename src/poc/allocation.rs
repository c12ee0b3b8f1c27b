// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Per-model POC_SLOT allocation.
//!
//! Decides which ML nodes serve inference during the PoC stage
//! (`poc_slot = true`) and which keep mining and voting. Candidate
//! eligibility flows through three gates: the participant 75% cumulative
//! threshold, the per-participant 25% node threshold capped by the global
//! IQR bound, and the 34% non-voting weight budget. A round-robin pass then
//! flips the smallest eligible nodes until the configured fraction of the
//! model's weight serves inference.

use std::collections::{BTreeMap, BTreeSet};

use bigdecimal::{BigDecimal, RoundingMode};
use num_traits::ToPrimitive;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::CoreParams;
use crate::error::ErrorKind;
use crate::types::{ActiveParticipant, Address};

/// Share of total model weight whose owners may lose their PoC vote.
const MAX_NONVOTING_PERCENT: i128 = 34;

#[derive(Debug, Error)]
pub enum AllocationError {
    #[error("poc slot fraction {0} lies outside (0, 1)")]
    InvalidFraction(BigDecimal),
    #[error("invariant violated: {0}")]
    Invariant(String),
}

impl AllocationError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AllocationError::InvalidFraction(_) => ErrorKind::Validation,
            AllocationError::Invariant(_) => ErrorKind::Invariant,
        }
    }
}

/// A candidate node, addressed into the participant slice.
#[derive(Clone, Debug)]
struct NodeRef {
    participant: usize,
    group: usize,
    node: usize,
    node_id: String,
    weight: i64,
}

/// One participant's stake in one model.
struct ModelEntry {
    address: Address,
    participant: usize,
    group: usize,
    /// Node view after in-group deduplication, ascending `(weight, node_id)`.
    nodes: Vec<NodeRef>,
    weight: i64,
    /// Eligible subset, ascending `(weight, node_id)`.
    candidates: Vec<NodeRef>,
}

/// Exact weight at which the descending cumulative sum first reaches
/// `percent` of the total, plus the number of entries consumed. Weights must
/// arrive sorted descending.
fn threshold_for_target(weights: &[i64], percent: i128) -> (i64, usize) {
    let total: i128 = weights.iter().map(|w| i128::from(*w)).sum();
    if total == 0 {
        return (0, weights.len());
    }
    let mut running = 0i128;
    for (index, weight) in weights.iter().enumerate() {
        running += i128::from(*weight);
        if running * 100 >= total * percent {
            return (*weight, index + 1);
        }
    }
    (weights.last().copied().unwrap_or(0), weights.len())
}

/// Global IQR cap `Q3 + ⌈1.5·IQR⌉ + 1`; `None` when the spread is zero.
fn iqr_cap(mut weights: Vec<i64>) -> Option<i64> {
    if weights.is_empty() {
        return None;
    }
    weights.sort_unstable();
    let n = weights.len();
    let q1 = weights[n / 4];
    let q3 = weights[(3 * n) / 4];
    let iqr = q3 - q1;
    if iqr == 0 {
        return None;
    }
    Some(q3 + (3 * iqr + 1) / 2 + 1)
}

/// Reallocates POC_SLOT flags for every model present in `participants`.
/// Only `timeslot_allocation.poc_slot` is mutated.
pub fn allocate_poc_slots(
    participants: &mut [ActiveParticipant],
    epoch_id: u64,
    previous_participants: &BTreeSet<Address>,
    params: &CoreParams,
) -> Result<(), AllocationError> {
    let zero = BigDecimal::from(0);
    let one = BigDecimal::from(1);
    if params.poc_slot_fraction <= zero || params.poc_slot_fraction >= one {
        return Err(AllocationError::InvalidFraction(
            params.poc_slot_fraction.clone(),
        ));
    }

    let models: BTreeSet<String> = participants
        .iter()
        .flat_map(|p| p.groups.iter().map(|g| g.model_id.clone()))
        .collect();
    for model in &models {
        allocate_model(participants, model, epoch_id, previous_participants, params)?;
    }
    Ok(())
}

fn allocate_model(
    participants: &mut [ActiveParticipant],
    model_id: &str,
    epoch_id: u64,
    previous_participants: &BTreeSet<Address>,
    params: &CoreParams,
) -> Result<(), AllocationError> {
    let mut entries = collect_entries(participants, model_id);
    if entries.is_empty() {
        return Ok(());
    }
    let total_weight: i128 = entries.iter().map(|e| i128::from(e.weight)).sum();
    if total_weight == 0 {
        return Ok(());
    }

    // Participant 75% rule.
    let mut by_weight: Vec<i64> = entries.iter().map(|e| e.weight).collect();
    by_weight.sort_unstable_by(|a, b| b.cmp(a));
    let (participant_threshold, participant_count) = threshold_for_target(&by_weight, 75);
    let survivors = survivors_for_threshold(&entries, participant_threshold, participant_count);

    // Global IQR cap over every node weight of the model.
    let all_node_weights: Vec<i64> = entries
        .iter()
        .flat_map(|e| e.nodes.iter().map(|n| n.weight))
        .collect();
    let global_cap = iqr_cap(all_node_weights);

    let participants_hash = {
        let mut hasher = Sha256::new();
        for entry in &entries {
            hasher.update(entry.address.as_bytes());
        }
        hex::encode(hasher.finalize())
    };

    for (position, entry) in entries.iter_mut().enumerate() {
        if !survivors.contains(&position) {
            continue;
        }
        entry.candidates = node_candidates(entry, global_cap);
        // Participants carried over from the previous epoch are sampled down
        // to a bare majority of their candidate set.
        if previous_participants.contains(&entry.address) && entry.candidates.len() > 1 {
            let seed_input = format!("filter_{epoch_id}_{participants_hash}_{model_id}");
            let seed: [u8; 32] = Sha256::digest(seed_input.as_bytes()).into();
            let mut rng = ChaCha8Rng::from_seed(seed);
            let keep = entry.candidates.len() / 2 + 1;
            entry.candidates.shuffle(&mut rng);
            entry.candidates.truncate(keep);
            entry
                .candidates
                .sort_by(|a, b| a.weight.cmp(&b.weight).then_with(|| a.node_id.cmp(&b.node_id)));
            debug!(
                participant = %entry.address,
                model = model_id,
                kept = keep,
                "sampled repeat participant's candidates"
            );
        }
    }

    apply_nonvoting_budget(&mut entries, total_weight);
    round_robin(participants, &entries, total_weight, params)
}

/// Builds the deduplicated per-participant node view for one model.
fn collect_entries(participants: &[ActiveParticipant], model_id: &str) -> Vec<ModelEntry> {
    let mut entries = Vec::new();
    for (participant_index, participant) in participants.iter().enumerate() {
        let Some(group_index) = participant
            .groups
            .iter()
            .position(|g| g.model_id == model_id)
        else {
            continue;
        };
        let group = &participant.groups[group_index];
        // Duplicate node ids keep the greatest (weight, throughput,
        // allocation) entry.
        let mut best: BTreeMap<&str, usize> = BTreeMap::new();
        for (node_index, node) in group.nodes.iter().enumerate() {
            match best.get(node.node_id.as_str()) {
                Some(&existing) => {
                    let current = &group.nodes[existing];
                    let candidate_key =
                        (node.poc_weight, node.throughput, node.timeslot_allocation);
                    let current_key = (
                        current.poc_weight,
                        current.throughput,
                        current.timeslot_allocation,
                    );
                    warn!(
                        participant = %participant.index,
                        node_id = %node.node_id,
                        "duplicate node id in model group"
                    );
                    if candidate_key > current_key {
                        best.insert(&node.node_id, node_index);
                    }
                }
                None => {
                    best.insert(&node.node_id, node_index);
                }
            }
        }
        let mut nodes: Vec<NodeRef> = best
            .into_values()
            .map(|node_index| {
                let node = &group.nodes[node_index];
                NodeRef {
                    participant: participant_index,
                    group: group_index,
                    node: node_index,
                    node_id: node.node_id.clone(),
                    weight: node.poc_weight,
                }
            })
            .collect();
        nodes.sort_by(|a, b| a.weight.cmp(&b.weight).then_with(|| a.node_id.cmp(&b.node_id)));
        if nodes.is_empty() {
            continue;
        }
        let weight = nodes.iter().map(|n| n.weight).sum();
        entries.push(ModelEntry {
            address: participant.index.clone(),
            participant: participant_index,
            group: group_index,
            nodes,
            weight,
            candidates: Vec::new(),
        });
    }
    entries
}

/// Positions of entries surviving the participant threshold: everything
/// strictly above it, and threshold-equal entries in ascending address order
/// up to the uniform-cutoff count.
fn survivors_for_threshold(
    entries: &[ModelEntry],
    threshold: i64,
    target_count: usize,
) -> BTreeSet<usize> {
    let mut survivors: BTreeSet<usize> = entries
        .iter()
        .enumerate()
        .filter(|(_, e)| e.weight > threshold)
        .map(|(i, _)| i)
        .collect();
    for (index, entry) in entries.iter().enumerate() {
        if survivors.len() >= target_count {
            break;
        }
        if entry.weight == threshold {
            survivors.insert(index);
        }
    }
    survivors
}

/// Applies the 25% node rule and the global cap to one participant.
fn node_candidates(entry: &ModelEntry, global_cap: Option<i64>) -> Vec<NodeRef> {
    let mut by_weight: Vec<i64> = entry.nodes.iter().map(|n| n.weight).collect();
    by_weight.sort_unstable_by(|a, b| b.cmp(a));
    let (node_threshold, node_count) = threshold_for_target(&by_weight, 25);

    // The cap keeps a single outsized node from dragging the eligibility
    // cutoff beyond the rest of the fleet.
    let (effective, count_cap) = match global_cap {
        Some(cap) if node_threshold > 0 && cap < node_threshold => (cap, None),
        Some(cap) if node_threshold == 0 => (cap, None),
        _ => (node_threshold, Some(node_count)),
    };

    let mut candidates: Vec<NodeRef> = entry
        .nodes
        .iter()
        .filter(|n| n.weight > effective)
        .cloned()
        .collect();
    if let Some(cap) = count_cap {
        for node in &entry.nodes {
            if candidates.len() >= cap {
                break;
            }
            if node.weight == effective {
                candidates.push(node.clone());
            }
        }
    } else {
        candidates.extend(
            entry
                .nodes
                .iter()
                .filter(|n| n.weight == effective)
                .cloned(),
        );
    }
    candidates.sort_by(|a, b| a.weight.cmp(&b.weight).then_with(|| a.node_id.cmp(&b.node_id)));
    candidates
}

/// Trims candidate lists so participants whose whole weight would become
/// eligible stay within the non-voting budget.
fn apply_nonvoting_budget(entries: &mut [ModelEntry], total_weight: i128) {
    let max_nonvoting = MAX_NONVOTING_PERCENT * total_weight / 100;
    let mut nonvoting = 0i128;
    for entry in entries.iter_mut() {
        let mut eligible_weight = 0i128;
        let mut kept = 0usize;
        for candidate in &entry.candidates {
            let next = eligible_weight + i128::from(candidate.weight);
            if next == i128::from(entry.weight) {
                // Marking this node leaves the participant without voting
                // weight; only allowed while the budget holds.
                if nonvoting + i128::from(entry.weight) < max_nonvoting {
                    nonvoting += i128::from(entry.weight);
                } else {
                    debug!(
                        participant = %entry.address,
                        "non-voting budget exhausted, truncating candidates"
                    );
                    break;
                }
            }
            eligible_weight = next;
            kept += 1;
        }
        entry.candidates.truncate(kept);
    }
}

/// Flips candidates to POC_SLOT in ascending-address round-robin order,
/// smallest node first, until the weight target is met.
fn round_robin(
    participants: &mut [ActiveParticipant],
    entries: &[ModelEntry],
    total_weight: i128,
    params: &CoreParams,
) -> Result<(), AllocationError> {
    let target = (&params.poc_slot_fraction * BigDecimal::from(total_weight))
        .with_scale_round(0, RoundingMode::Down)
        .to_i128()
        .ok_or_else(|| AllocationError::Invariant("weight target overflow".into()))?;
    let mut current = 0i128;
    if target == 0 {
        return Ok(());
    }

    let mut cursors = vec![0usize; entries.len()];
    'outer: loop {
        let mut allocated = false;
        for (entry, cursor) in entries.iter().zip(cursors.iter_mut()) {
            let Some(candidate) = entry.candidates.get(*cursor) else {
                continue;
            };
            *cursor += 1;
            let node = &mut participants[candidate.participant].groups[candidate.group].nodes
                [candidate.node];
            node.timeslot_allocation.poc_slot = true;
            current += i128::from(candidate.weight);
            allocated = true;
            if current >= target {
                break 'outer;
            }
        }
        if !allocated {
            debug!(current, target_weight = target, "candidates exhausted before weight target");
            break;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{MLNodeInfo, ModelNodeGroup, TimeslotAllocation};
    use std::str::FromStr;

    fn participant(address: &str, model: &str, nodes: &[(&str, i64)]) -> ActiveParticipant {
        let mut p = ActiveParticipant::new(address.to_string());
        p.groups.push(ModelNodeGroup {
            model_id: model.to_string(),
            nodes: nodes
                .iter()
                .map(|(id, w)| MLNodeInfo {
                    node_id: id.to_string(),
                    throughput: 0,
                    poc_weight: *w,
                    timeslot_allocation: TimeslotAllocation::default(),
                })
                .collect(),
        });
        p.recompute_weight();
        p
    }

    fn params(fraction: &str) -> CoreParams {
        CoreParams {
            poc_slot_fraction: BigDecimal::from_str(fraction).unwrap(),
            ..Default::default()
        }
    }

    fn poc_nodes(p: &ActiveParticipant) -> Vec<&str> {
        p.groups
            .iter()
            .flat_map(|g| g.nodes.iter())
            .filter(|n| n.timeslot_allocation.poc_slot)
            .map(|n| n.node_id.as_str())
            .collect()
    }

    #[test]
    fn round_robin_flips_top_nodes_until_target() {
        let mut participants = vec![
            participant("a1", "m", &[("n1", 10), ("n2", 20), ("n3", 30), ("n4", 40)]),
            participant("a2", "m", &[("m1", 60), ("m2", 40)]),
        ];
        allocate_poc_slots(&mut participants, 5, &BTreeSet::new(), &params("0.2")).unwrap();

        // Target is 40 of 200: a1's top node alone satisfies it.
        assert_eq!(poc_nodes(&participants[0]), vec!["n4"]);
        assert!(poc_nodes(&participants[1]).is_empty());
    }

    #[test]
    fn iqr_cap_admits_nodes_below_an_outlier() {
        let mut participants = vec![
            participant("a1", "m", &[("big", 100), ("mid", 80), ("low", 40)]),
            participant(
                "a2",
                "m",
                &[
                    ("s1", 30),
                    ("s2", 30),
                    ("s3", 30),
                    ("s4", 30),
                    ("s5", 30),
                    ("s6", 30),
                    ("s7", 30),
                    ("s8", 30),
                ],
            ),
        ];
        // Without the cap a1's 25% threshold would be 100 and only "big"
        // could serve; the cap (Q3=40, IQR=10 → 56) admits "mid" too.
        allocate_poc_slots(&mut participants, 5, &BTreeSet::new(), &params("0.5")).unwrap();
        let a1 = poc_nodes(&participants[0]);
        assert!(a1.contains(&"mid"));
        assert!(a1.contains(&"big"));
        assert!(!a1.contains(&"low"));
    }

    #[test]
    fn nonvoting_budget_blocks_single_node_participants() {
        let mut participants = vec![
            participant("a1", "m", &[("only", 100)]),
            participant("a2", "m", &[("solo", 100)]),
        ];
        allocate_poc_slots(&mut participants, 5, &BTreeSet::new(), &params("0.2")).unwrap();
        // Flipping either node would zero its owner's voting weight, and
        // 100 exceeds the 68-weight budget.
        assert!(poc_nodes(&participants[0]).is_empty());
        assert!(poc_nodes(&participants[1]).is_empty());
    }

    #[test]
    fn uniform_weights_use_the_count_cutoff() {
        let mut participants = vec![participant(
            "a1",
            "m",
            &[("w1", 25), ("w2", 25), ("w3", 25), ("w4", 25)],
        )];
        allocate_poc_slots(&mut participants, 5, &BTreeSet::new(), &params("0.2")).unwrap();
        // 25% target is met by one node; the equal-weight rescue admits
        // exactly one, by node id.
        assert_eq!(poc_nodes(&participants[0]), vec!["w1"]);
    }

    #[test]
    fn repeat_participants_are_sampled_down() {
        let nodes_a2: Vec<(String, i64)> =
            (0..12).map(|i| (format!("s{i:02}"), 30)).collect();
        let nodes_a2: Vec<(&str, i64)> =
            nodes_a2.iter().map(|(s, w)| (s.as_str(), *w)).collect();
        let build = || {
            vec![
                participant(
                    "a1",
                    "m",
                    &[("h1", 100), ("h2", 80), ("h3", 60), ("h4", 40)],
                ),
                participant("a2", "m", &nodes_a2),
            ]
        };

        // Fresh participant: candidates {h3, h2, h1} all get flipped while
        // chasing half the model weight.
        let mut fresh = build();
        allocate_poc_slots(&mut fresh, 5, &BTreeSet::new(), &params("0.5")).unwrap();
        assert_eq!(poc_nodes(&fresh[0]).len(), 3);

        // Repeat participant: the candidate set is sampled down to two.
        let mut repeat = build();
        let previous = BTreeSet::from(["a1".to_string()]);
        allocate_poc_slots(&mut repeat, 5, &previous, &params("0.5")).unwrap();
        assert_eq!(poc_nodes(&repeat[0]).len(), 2);

        // And the sampling is deterministic.
        let mut again = build();
        allocate_poc_slots(&mut again, 5, &previous, &params("0.5")).unwrap();
        assert_eq!(poc_nodes(&repeat[0]), poc_nodes(&again[0]));
    }

    #[test]
    fn fraction_outside_unit_interval_is_rejected() {
        let mut participants = vec![participant("a1", "m", &[("n1", 10)])];
        let err = allocate_poc_slots(
            &mut participants,
            5,
            &BTreeSet::new(),
            &params("1"),
        )
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[test]
    fn threshold_for_target_returns_boundary_weight_and_count() {
        assert_eq!(threshold_for_target(&[100, 100], 75), (100, 2));
        assert_eq!(threshold_for_target(&[40, 30, 20, 10], 25), (40, 1));
        assert_eq!(threshold_for_target(&[30, 30, 30], 25), (30, 1));
        assert_eq!(threshold_for_target(&[], 75), (0, 0));
    }

    #[test]
    fn iqr_cap_disabled_on_zero_spread() {
        assert_eq!(iqr_cap(vec![25, 25, 25, 25]), None);
        // Sorted [10, 20, 30, 40]: Q1 = 20, Q3 = 40, cap = 40 + 30 + 1.
        assert_eq!(iqr_cap(vec![40, 10, 30, 20]), Some(71));
    }
}
