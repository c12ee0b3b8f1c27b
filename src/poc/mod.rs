// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Proof-of-compute weight calculation.
//!
//! Converts store commits, per-node weight distributions and peer
//! validations into the epoch's active participants. Voting runs either
//! over the full validator weight map or over a deterministic slot sample
//! of it; both thresholds are strict two-thirds majorities, with guardians
//! breaking the middle ground.

pub mod allocation;

use std::collections::{BTreeMap, BTreeSet};

use bigdecimal::{BigDecimal, RoundingMode};
use num_traits::ToPrimitive;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::CoreParams;
use crate::error::{CoreError, ErrorKind};
use crate::store::{self, keys, StateStore};
use crate::types::{
    ActiveParticipant, Address, HardwareNode, MLNodeInfo, MLNodeWeightDistribution, Participant,
    PoCStoreCommit, PoCValidation, TimeslotAllocation,
};

#[derive(Debug, Error)]
pub enum WeightError {
    #[error("submission targets PoC stage starting at {actual}, current stage starts at {expected}")]
    OutsideWindow { expected: u64, actual: u64 },
    #[error("negative weight for node {node_id} of {participant}")]
    NegativeDistributionWeight { participant: Address, node_id: String },
    #[error("invariant violated: {0}")]
    Invariant(String),
}

impl WeightError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            WeightError::OutsideWindow { .. }
            | WeightError::NegativeDistributionWeight { .. } => ErrorKind::Validation,
            WeightError::Invariant(_) => ErrorKind::Invariant,
        }
    }
}

/// Epoch-switch inputs for the weight calculation. All maps iterate in
/// ascending key order by construction.
pub struct WeightContext<'a> {
    /// Validator weight map from the previous epoch's group.
    pub current_weights: &'a BTreeMap<Address, i64>,
    pub commits: &'a BTreeMap<Address, PoCStoreCommit>,
    pub distributions: &'a BTreeMap<Address, MLNodeWeightDistribution>,
    /// Grouped by target participant.
    pub validations: &'a BTreeMap<Address, Vec<PoCValidation>>,
    pub participants: &'a BTreeMap<Address, Participant>,
    pub seeds: &'a BTreeMap<Address, Vec<u8>>,
    pub hardware: &'a BTreeMap<Address, Vec<HardwareNode>>,
    pub guardians: &'a BTreeSet<Address>,
    pub allowlist: Option<&'a BTreeSet<Address>>,
    pub app_hash: Option<&'a [u8]>,
}

/// Computes the PoC-mining candidates for an epoch switch, ascending by
/// address.
pub fn compute_active_participants(
    ctx: &WeightContext<'_>,
    params: &CoreParams,
) -> Result<Vec<ActiveParticipant>, WeightError> {
    let factor = scale_factor(params);
    let mut active = Vec::new();

    for (target, commit) in ctx.commits {
        if commit.count == 0 {
            continue;
        }
        let Some(participant) = ctx.participants.get(target) else {
            debug!(participant = %target, "commit from unknown participant");
            continue;
        };
        if participant.validator_key.is_empty() {
            debug!(participant = %target, "participant has no validator key");
            continue;
        }
        if !ctx.seeds.contains_key(target) {
            debug!(participant = %target, "participant submitted no seed");
            continue;
        }
        if params.allowlist_enabled
            && !ctx.allowlist.map(|l| l.contains(target)).unwrap_or(false)
        {
            debug!(participant = %target, "participant not on allowlist");
            continue;
        }
        let Some(distribution) = ctx.distributions.get(target) else {
            warn!(participant = %target, "commit without node weight distribution");
            continue;
        };
        let Some(nodes) = deduped_distribution(target, distribution, commit) else {
            continue;
        };
        // Weight filters run before any voting.
        let total_weight = scaled(i64::from(commit.count), &factor);
        if total_weight <= 0 {
            debug!(participant = %target, "scaled weight is not positive");
            continue;
        }
        if !poc_validated(ctx, params, target) {
            debug!(participant = %target, "rejected by peer validation");
            continue;
        }

        let node_models: BTreeMap<&str, &HardwareNode> = ctx
            .hardware
            .get(target)
            .map(|nodes| nodes.iter().map(|n| (n.node_id.as_str(), n)).collect())
            .unwrap_or_default();

        let mut entry = ActiveParticipant::new(target.clone());
        for (node_id, weight) in nodes {
            let Some(hardware) = node_models.get(node_id.as_str()) else {
                warn!(participant = %target, node_id = %node_id, "node has no hardware registration");
                continue;
            };
            let group = entry.group_mut(&hardware.model_id);
            group.nodes.push(MLNodeInfo {
                node_id,
                throughput: hardware.throughput,
                poc_weight: scaled(weight, &factor),
                timeslot_allocation: TimeslotAllocation::default(),
            });
        }
        for group in &mut entry.groups {
            group.nodes.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        }
        entry.weight = total_weight;
        active.push(entry);
    }
    Ok(active)
}

fn scale_factor(params: &CoreParams) -> BigDecimal {
    match &params.time_normalization_factor {
        Some(tnf) => &params.weight_scale_factor * tnf,
        None => params.weight_scale_factor.clone(),
    }
}

fn scaled(weight: i64, factor: &BigDecimal) -> i64 {
    (BigDecimal::from(weight) * factor)
        .with_scale_round(0, RoundingMode::Down)
        .to_i64()
        .unwrap_or(0)
}

/// Deduplicates distribution entries by node id, keeping the greatest
/// weight, and enforces the commit-count refinement invariant.
fn deduped_distribution(
    target: &str,
    distribution: &MLNodeWeightDistribution,
    commit: &PoCStoreCommit,
) -> Option<Vec<(String, i64)>> {
    let mut by_node: BTreeMap<&str, i64> = BTreeMap::new();
    for entry in &distribution.weights {
        if entry.weight < 0 {
            warn!(participant = %target, node_id = %entry.node_id, "negative distribution weight");
            return None;
        }
        match by_node.get(entry.node_id.as_str()) {
            Some(existing) => {
                warn!(participant = %target, node_id = %entry.node_id, "duplicate node in distribution");
                if entry.weight > *existing {
                    by_node.insert(&entry.node_id, entry.weight);
                }
            }
            None => {
                by_node.insert(&entry.node_id, entry.weight);
            }
        }
    }
    let sum: i64 = distribution.weights.iter().map(|e| e.weight).sum();
    if sum != i64::from(commit.count) {
        warn!(
            participant = %target,
            sum,
            count = commit.count,
            "distribution does not refine the committed count"
        );
        return None;
    }
    Some(
        by_node
            .into_iter()
            .map(|(id, weight)| (id.to_owned(), weight))
            .collect(),
    )
}

/// One stance per validator; conflicting submissions resolve to invalid.
fn vote_stances<'a>(
    ctx: &'a WeightContext<'_>,
    target: &str,
) -> BTreeMap<&'a str, bool> {
    let mut stances: BTreeMap<&str, bool> = BTreeMap::new();
    if let Some(votes) = ctx.validations.get(target) {
        for vote in votes {
            if !ctx.current_weights.contains_key(&vote.validator) {
                debug!(
                    validator = %vote.validator,
                    participant = %target,
                    "vote from outside the current weight map"
                );
                continue;
            }
            let valid = vote.validated_weight > 0;
            stances
                .entry(vote.validator.as_str())
                .and_modify(|s| *s = *s && valid)
                .or_insert(valid);
        }
    }
    stances
}

fn poc_validated(ctx: &WeightContext<'_>, params: &CoreParams, target: &str) -> bool {
    if ctx.current_weights.is_empty() {
        return true;
    }
    let stances = vote_stances(ctx, target);

    let (total, valid, invalid) = if params.validation_slots == 0 {
        full_tally(ctx, &stances)
    } else if let Some(app_hash) = ctx.app_hash {
        sampled_tally(ctx, params, target, app_hash, &stances)
    } else {
        warn!(participant = %target, "no app hash for sampled validation, using full tally");
        full_tally(ctx, &stances)
    };

    if valid * 3 > total * 2 {
        return true;
    }
    if invalid * 3 > total * 2 {
        return false;
    }
    if !params.guardian_enabled {
        return false;
    }
    // Guardian tiebreaker: accept only on unopposed guardian approval.
    let mut guardian_valid = 0u32;
    let mut guardian_invalid = 0u32;
    for (validator, stance) in &stances {
        if ctx.guardians.contains(*validator) {
            if *stance {
                guardian_valid += 1;
            } else {
                guardian_invalid += 1;
            }
        }
    }
    guardian_valid > 0 && guardian_invalid == 0
}

/// Weight-sum tally over every current validator; missing votes abstain.
fn full_tally(
    ctx: &WeightContext<'_>,
    stances: &BTreeMap<&str, bool>,
) -> (i128, i128, i128) {
    let mut total = 0i128;
    let mut valid = 0i128;
    let mut invalid = 0i128;
    for (validator, weight) in ctx.current_weights {
        let weight = i128::from(*weight);
        total += weight;
        match stances.get(validator.as_str()) {
            Some(true) => valid += weight,
            Some(false) => invalid += weight,
            None => {}
        }
    }
    (total, valid, invalid)
}

/// Samples `validation_slots` positions from the cumulative validator-weight
/// line, seeded by the app hash and the target address. Each slot counts as
/// weight one; slots landing on non-voters abstain.
fn sampled_tally(
    ctx: &WeightContext<'_>,
    params: &CoreParams,
    target: &str,
    app_hash: &[u8],
    stances: &BTreeMap<&str, bool>,
) -> (i128, i128, i128) {
    let mut line: Vec<(&str, u64)> = Vec::new();
    let mut total_weight = 0u64;
    for (validator, weight) in ctx.current_weights {
        if *weight > 0 {
            total_weight += *weight as u64;
            line.push((validator.as_str(), total_weight));
        }
    }
    if total_weight == 0 {
        return (0, 0, 0);
    }

    let mut valid = 0i128;
    let mut invalid = 0i128;
    for slot in 0..params.validation_slots {
        let mut hasher = Sha256::new();
        hasher.update(app_hash);
        hasher.update(target.as_bytes());
        hasher.update(slot.to_be_bytes());
        let digest = hasher.finalize();
        let position =
            u64::from_be_bytes(digest[..8].try_into().expect("digest is 32 bytes"))
                % total_weight;
        let holder = line
            .iter()
            .find(|(_, cumulative)| position < *cumulative)
            .map(|(validator, _)| *validator)
            .expect("position is below the cumulative total");
        match stances.get(holder) {
            Some(true) => valid += 1,
            Some(false) => invalid += 1,
            None => {}
        }
    }
    (i128::from(params.validation_slots), valid, invalid)
}

/// `SubmitStoreCommit` message body.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitStoreCommit {
    pub poc_stage_start_height: u64,
    pub count: u32,
}

/// `SubmitMLNodeWeightDistribution` message body.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitWeightDistribution {
    pub poc_stage_start_height: u64,
    pub weights: Vec<crate::types::NodeWeight>,
}

/// `SubmitPoCValidation` message body.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitPoCValidation {
    pub poc_stage_start_height: u64,
    pub target_participant: Address,
    pub inference_id: String,
    pub validated_weight: i64,
    pub revalidation: bool,
}

fn check_window(expected: u64, actual: u64) -> Result<(), WeightError> {
    if expected != actual {
        return Err(WeightError::OutsideWindow { expected, actual });
    }
    Ok(())
}

/// Message handler: store commit. Resubmission overwrites.
pub fn handle_store_commit(
    store: &mut dyn StateStore,
    current_poc_start: u64,
    submitter: &str,
    msg: SubmitStoreCommit,
) -> Result<(), CoreError> {
    check_window(current_poc_start, msg.poc_stage_start_height)?;
    let commit = PoCStoreCommit {
        participant: submitter.to_owned(),
        poc_stage_start_height: msg.poc_stage_start_height,
        count: msg.count,
    };
    store::put_obj(
        store,
        &keys::store_commit(current_poc_start, &commit.participant),
        &commit,
        "commit",
    )?;
    Ok(())
}

/// Message handler: node weight distribution.
pub fn handle_weight_distribution(
    store: &mut dyn StateStore,
    current_poc_start: u64,
    submitter: &str,
    msg: SubmitWeightDistribution,
) -> Result<(), CoreError> {
    check_window(current_poc_start, msg.poc_stage_start_height)?;
    for entry in &msg.weights {
        if entry.weight < 0 {
            return Err(WeightError::NegativeDistributionWeight {
                participant: submitter.to_owned(),
                node_id: entry.node_id.clone(),
            }
            .into());
        }
    }
    let distribution = MLNodeWeightDistribution {
        participant: submitter.to_owned(),
        poc_stage_start_height: msg.poc_stage_start_height,
        weights: msg.weights,
    };
    store::put_obj(
        store,
        &keys::weight_distribution(current_poc_start, &distribution.participant),
        &distribution,
        "dist",
    )?;
    Ok(())
}

/// Message handler: peer validation vote.
pub fn handle_validation(
    store: &mut dyn StateStore,
    current_poc_start: u64,
    submitter: &str,
    msg: SubmitPoCValidation,
) -> Result<(), CoreError> {
    check_window(current_poc_start, msg.poc_stage_start_height)?;
    let validation = PoCValidation {
        validator: submitter.to_owned(),
        target: msg.target_participant,
        inference_id: msg.inference_id,
        validated_weight: msg.validated_weight,
        revalidation: msg.revalidation,
    };
    store::put_obj(
        store,
        &keys::validation(current_poc_start, &validation.validator, &validation.target),
        &validation,
        "val",
    )?;
    Ok(())
}

/// Records a participant's random seed for an epoch.
pub fn set_seed(
    store: &mut dyn StateStore,
    epoch_id: u64,
    participant: &str,
    seed: Vec<u8>,
) -> Result<(), CoreError> {
    store::put_obj(
        store,
        &keys::seed(epoch_id, &participant.to_owned()),
        &seed,
        "seed",
    )?;
    Ok(())
}

pub fn load_commits(
    store: &dyn StateStore,
    poc_start: u64,
) -> Result<BTreeMap<Address, PoCStoreCommit>, CoreError> {
    let mut commits = BTreeMap::new();
    for (_, value) in store.scan_prefix(&keys::store_commit_prefix(poc_start))? {
        let commit: PoCStoreCommit =
            serde_ipld_dagcbor::from_slice(&value).map_err(|e| {
                WeightError::Invariant(format!("corrupt store commit: {e}"))
            })?;
        commits.insert(commit.participant.clone(), commit);
    }
    Ok(commits)
}

pub fn load_distributions(
    store: &dyn StateStore,
    poc_start: u64,
) -> Result<BTreeMap<Address, MLNodeWeightDistribution>, CoreError> {
    let mut distributions = BTreeMap::new();
    for (_, value) in store.scan_prefix(&keys::weight_distribution_prefix(poc_start))? {
        let distribution: MLNodeWeightDistribution = serde_ipld_dagcbor::from_slice(&value)
            .map_err(|e| WeightError::Invariant(format!("corrupt distribution: {e}")))?;
        distributions.insert(distribution.participant.clone(), distribution);
    }
    Ok(distributions)
}

/// Loads validations for a PoC stage, grouped by target.
pub fn load_validations(
    store: &dyn StateStore,
    poc_start: u64,
) -> Result<BTreeMap<Address, Vec<PoCValidation>>, CoreError> {
    let mut by_target: BTreeMap<Address, Vec<PoCValidation>> = BTreeMap::new();
    for (_, value) in store.scan_prefix(&keys::validation_prefix(poc_start))? {
        let validation: PoCValidation = serde_ipld_dagcbor::from_slice(&value)
            .map_err(|e| WeightError::Invariant(format!("corrupt validation: {e}")))?;
        by_target
            .entry(validation.target.clone())
            .or_default()
            .push(validation);
    }
    Ok(by_target)
}

pub fn load_seeds(
    store: &dyn StateStore,
    epoch_id: u64,
) -> Result<BTreeMap<Address, Vec<u8>>, CoreError> {
    let mut seeds = BTreeMap::new();
    let prefix = keys::seed_prefix(epoch_id);
    for (key, value) in store.scan_prefix(&prefix)? {
        let participant = String::from_utf8_lossy(&key[prefix.len()..]).into_owned();
        let seed: Vec<u8> = serde_ipld_dagcbor::from_slice(&value)
            .map_err(|e| WeightError::Invariant(format!("corrupt seed: {e}")))?;
        seeds.insert(participant, seed);
    }
    Ok(seeds)
}
