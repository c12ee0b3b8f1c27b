// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Shared consensus data model.
//!
//! Entities here are persisted through the store and must keep a
//! deterministic canonical encoding; all collections that cross the API
//! boundary are ordered (`BTreeMap`/sorted `Vec`) so iteration follows the
//! sorted-key order the execution model requires.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

/// Bech32 account identifier. Ordering is plain byte-wise `Ord`.
pub type Address = String;

/// A network participant, created when first seen and mutated only by
/// participant-signed updates.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    pub address: Address,
    /// Validator consensus public key, opaque to the core.
    pub validator_key: Vec<u8>,
    pub inference_url: String,
    /// Compressed secp256k1 public key of the inference worker.
    pub worker_public_key: Vec<u8>,
}

/// Which time windows an ML node serves inference in.
///
/// `(true, false)` is the initial state: the node serves non-PoC traffic
/// during the PoC stage. `(true, true)` additionally makes it eligible to
/// serve inference during the PoC stage, at the cost of its PoC vote.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct TimeslotAllocation {
    pub pre_poc_slot: bool,
    pub poc_slot: bool,
}

impl Default for TimeslotAllocation {
    fn default() -> Self {
        TimeslotAllocation {
            pre_poc_slot: true,
            poc_slot: false,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MLNodeInfo {
    /// Unique per participant after deduplication.
    pub node_id: String,
    pub throughput: i64,
    /// Nonnegative proof-of-compute weight.
    pub poc_weight: i64,
    pub timeslot_allocation: TimeslotAllocation,
}

/// ML nodes of one participant serving one model, ascending by `node_id`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelNodeGroup {
    pub model_id: String,
    pub nodes: Vec<MLNodeInfo>,
}

/// A participant active in a given epoch, with its per-model node groups.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveParticipant {
    pub index: Address,
    /// Total integer weight; recomputed from the node set on any mutation.
    pub weight: i64,
    /// Ascending by `model_id`.
    pub groups: Vec<ModelNodeGroup>,
}

impl ActiveParticipant {
    pub fn new(index: Address) -> Self {
        ActiveParticipant {
            index,
            weight: 0,
            groups: Vec::new(),
        }
    }

    /// Restores `weight = Σ poc_weight` over distinct node ids.
    pub fn recompute_weight(&mut self) {
        let mut seen = BTreeSet::new();
        let mut weight = 0i64;
        for group in &self.groups {
            for node in &group.nodes {
                if seen.insert(node.node_id.as_str()) {
                    weight += node.poc_weight;
                }
            }
        }
        self.weight = weight;
    }

    /// Group for `model_id`, inserted in sorted position when absent.
    pub fn group_mut(&mut self, model_id: &str) -> &mut ModelNodeGroup {
        let pos = match self
            .groups
            .binary_search_by(|g| g.model_id.as_str().cmp(model_id))
        {
            Ok(pos) => pos,
            Err(pos) => {
                self.groups.insert(
                    pos,
                    ModelNodeGroup {
                        model_id: model_id.to_owned(),
                        nodes: Vec::new(),
                    },
                );
                pos
            }
        };
        &mut self.groups[pos]
    }

    /// All nodes currently flagged to serve inference during the PoC stage.
    pub fn poc_slot_nodes(&self) -> impl Iterator<Item = (&str, &MLNodeInfo)> {
        self.groups.iter().flat_map(|g| {
            g.nodes
                .iter()
                .filter(|n| n.timeslot_allocation.poc_slot)
                .map(move |n| (g.model_id.as_str(), n))
        })
    }
}

/// Off-chain-proved total of work units for one participant in one PoC stage.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoCStoreCommit {
    pub participant: Address,
    pub poc_stage_start_height: u64,
    pub count: u32,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeWeight {
    pub node_id: String,
    pub weight: i64,
}

/// Refinement of a store commit into per-node weights; within an epoch the
/// weights must sum to the commit count.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MLNodeWeightDistribution {
    pub participant: Address,
    pub poc_stage_start_height: u64,
    pub weights: Vec<NodeWeight>,
}

/// A peer validation vote on another participant's proved compute.
/// `validated_weight > 0` is a valid vote, anything else counts as invalid.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoCValidation {
    pub validator: Address,
    pub target: Address,
    pub inference_id: String,
    pub validated_weight: i64,
    pub revalidation: bool,
}

/// Hardware registration of one ML node, host-supplied.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardwareNode {
    pub node_id: String,
    pub model_id: String,
    pub throughput: i64,
}

/// Frozen per-model snapshot taken by the epoch driver.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelSnapshot {
    pub model_id: String,
    pub model_args: Vec<String>,
    pub validation_threshold: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberValidationWeight {
    pub member: Address,
    pub weight: i64,
    pub nodes: Vec<MLNodeInfo>,
    pub reputation: i64,
}

/// Per-(epoch, model) group data, written once by the epoch driver and
/// immutable for the rest of the epoch.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct EpochGroupData {
    pub epoch_index: u64,
    pub model_id: String,
    pub validation_weights: Vec<MemberValidationWeight>,
    pub model_snapshot: ModelSnapshot,
}
