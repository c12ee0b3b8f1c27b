// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Per-epoch orchestration.
//!
//! The driver gathers the previous epoch's inference-serving participants,
//! computes the new PoC-mining set from off-chain evidence, merges the two,
//! reallocates PoC time slots per model, and opens the DKG over the
//! resulting BLS slot ranges. Nothing is written to the store until the
//! whole pipeline has succeeded.

pub mod guardian;
pub mod slots;

use std::collections::{BTreeMap, BTreeSet};

use bigdecimal::BigDecimal;
use thiserror::Error;
use tracing::{debug, info};

use crate::config::CoreParams;
use crate::dkg::{BlsParticipant, EpochBLSData};
use crate::error::{CoreError, ErrorKind};
use crate::events::Event;
use crate::poc::{self, allocation, WeightContext};
use crate::store::{self, keys, StateStore};
use crate::types::{
    ActiveParticipant, Address, EpochGroupData, HardwareNode, MemberValidationWeight,
    ModelSnapshot, Participant,
};

#[derive(Debug, Error)]
pub enum EpochError {
    #[error("epoch {epoch_id} already carries BLS data")]
    AlreadyOpened { epoch_id: u64 },
    #[error("invariant violated: {0}")]
    Invariant(String),
}

impl EpochError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EpochError::AlreadyOpened { .. } => ErrorKind::Validation,
            EpochError::Invariant(_) => ErrorKind::Invariant,
        }
    }
}

/// Host-supplied inputs for one epoch switch.
pub struct EpochInputs<'a> {
    pub epoch_id: u64,
    /// Block height keying all off-chain evidence for this stage.
    pub poc_start_height: u64,
    pub current_height: u64,
    pub app_hash: Option<&'a [u8]>,
    /// Settle amounts paid out for the previous epoch.
    pub rewards_previous: &'a BTreeMap<Address, u64>,
    pub participants: &'a BTreeMap<Address, Participant>,
    pub hardware: &'a BTreeMap<Address, Vec<HardwareNode>>,
    pub guardians: &'a BTreeSet<Address>,
    pub allowlist: Option<&'a BTreeSet<Address>>,
    pub models: &'a BTreeMap<String, ModelSnapshot>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EpochOutcome {
    pub active_participants: usize,
    pub total_weight: i64,
    /// False when no participant qualified and no ceremony was opened.
    pub dkg_opened: bool,
}

/// Participants of the previous epoch that served inference (held a PoC
/// slot) and were rewarded; they carry those nodes into the new epoch with
/// the slot flag reset.
fn preserved_participants(
    previous: &[ActiveParticipant],
    rewards: &BTreeMap<Address, u64>,
) -> BTreeMap<Address, ActiveParticipant> {
    let mut preserved = BTreeMap::new();
    for participant in previous {
        if rewards.get(&participant.index).copied().unwrap_or(0) == 0 {
            continue;
        }
        let mut carried = ActiveParticipant::new(participant.index.clone());
        for group in &participant.groups {
            let nodes: Vec<_> = group
                .nodes
                .iter()
                .filter(|n| n.timeslot_allocation.poc_slot)
                .cloned()
                .map(|mut n| {
                    n.timeslot_allocation.poc_slot = false;
                    n
                })
                .collect();
            if !nodes.is_empty() {
                carried.group_mut(&group.model_id).nodes.extend(nodes);
            }
        }
        if carried.groups.is_empty() {
            continue;
        }
        carried.recompute_weight();
        preserved.insert(carried.index.clone(), carried);
    }
    preserved
}

/// Union of two node sets for the same participant; on an id collision the
/// preserved node wins.
fn merge_into(preserved: &mut ActiveParticipant, mined: ActiveParticipant) {
    for group in mined.groups {
        let target = preserved.group_mut(&group.model_id);
        for node in group.nodes {
            if !target.nodes.iter().any(|n| n.node_id == node.node_id) {
                target.nodes.push(node);
            }
        }
        target.nodes.sort_by(|a, b| a.node_id.cmp(&b.node_id));
    }
    preserved.recompute_weight();
}

/// Runs the epoch switch for `inputs.epoch_id` and opens its DKG.
pub fn run_epoch(
    store: &mut dyn StateStore,
    params: &CoreParams,
    inputs: &EpochInputs<'_>,
    events: &mut Vec<Event>,
) -> Result<EpochOutcome, CoreError> {
    let epoch_id = inputs.epoch_id;
    if store.exists(&keys::epoch_bls(epoch_id))? {
        return Err(EpochError::AlreadyOpened { epoch_id }.into());
    }

    // Previous epoch context.
    let previous_active: Vec<ActiveParticipant> =
        store::get_obj(store, &keys::active_participants(epoch_id.saturating_sub(1)), "active")?
            .unwrap_or_default();
    let previous_weights: BTreeMap<Address, i64> = previous_active
        .iter()
        .map(|p| (p.index.clone(), p.weight))
        .collect();
    let previous_addresses: BTreeSet<Address> = previous_weights.keys().cloned().collect();
    let served_nodes: BTreeSet<(Address, String)> = previous_active
        .iter()
        .flat_map(|p| {
            p.poc_slot_nodes()
                .map(|(_, n)| (p.index.clone(), n.node_id.clone()))
        })
        .collect();

    let preserved = preserved_participants(&previous_active, inputs.rewards_previous);

    // PoC-mining candidates from the evidence window.
    let commits = poc::load_commits(store, inputs.poc_start_height)?;
    let distributions = poc::load_distributions(store, inputs.poc_start_height)?;
    let validations = poc::load_validations(store, inputs.poc_start_height)?;
    let seeds = poc::load_seeds(store, epoch_id)?;
    let ctx = WeightContext {
        current_weights: &previous_weights,
        commits: &commits,
        distributions: &distributions,
        validations: &validations,
        participants: inputs.participants,
        seeds: &seeds,
        hardware: inputs.hardware,
        guardians: inputs.guardians,
        allowlist: inputs.allowlist,
        app_hash: inputs.app_hash,
    };
    let candidates = poc::compute_active_participants(&ctx, params)?;

    // Weight earned by nodes that served inference last epoch was not
    // mined; strip it.
    let mut mined = Vec::new();
    for mut candidate in candidates {
        for group in &mut candidate.groups {
            group
                .nodes
                .retain(|n| !served_nodes.contains(&(candidate.index.clone(), n.node_id.clone())));
        }
        candidate.groups.retain(|g| !g.nodes.is_empty());
        candidate.recompute_weight();
        if candidate.weight > 0 {
            mined.push(candidate);
        } else {
            debug!(participant = %candidate.index, "no mined weight left after filtering");
        }
    }

    // Merge, preserved nodes winning on id collisions.
    let mut merged = preserved;
    for candidate in mined {
        match merged.entry(candidate.index.clone()) {
            std::collections::btree_map::Entry::Occupied(mut entry) => {
                merge_into(entry.get_mut(), candidate)
            }
            std::collections::btree_map::Entry::Vacant(entry) => {
                entry.insert(candidate);
            }
        }
    }
    let mut active: Vec<ActiveParticipant> = merged.into_values().collect();

    if active.is_empty() {
        store::put_obj(store, &keys::active_participants(epoch_id), &active, "active")?;
        info!(epoch_id, "no active participants, skipping key generation");
        return Ok(EpochOutcome {
            active_participants: 0,
            total_weight: 0,
            dkg_opened: false,
        });
    }

    allocation::allocate_poc_slots(&mut active, epoch_id, &previous_addresses, params)?;

    // Percentage weights, optionally overridden by the guardian reservation.
    let total_weight: i64 = active.iter().map(|p| p.weight).sum();
    let total_dec = BigDecimal::from(total_weight);
    let hundred = BigDecimal::from(100);
    let mut percentages: BTreeMap<Address, BigDecimal> = active
        .iter()
        .map(|p| {
            (
                p.index.clone(),
                &hundred * BigDecimal::from(p.weight) / &total_dec,
            )
        })
        .collect();
    if let Some(adjusted) =
        guardian::reserve_guardian_slots(&percentages, inputs.guardians, total_weight, params)?
    {
        percentages = adjusted;
    }

    let ranges = slots::assign_slots(&percentages, params.total_slots)?;
    let bls_participants: Vec<BlsParticipant> = ranges
        .into_iter()
        .map(|r| BlsParticipant {
            address: r.address,
            slot_start: r.start,
            slot_end: r.end,
        })
        .collect();
    let bls_data = EpochBLSData::new(
        epoch_id,
        params.total_slots,
        params.degree(),
        bls_participants,
        inputs.current_height,
        params,
    );

    // Frozen per-model group data.
    let mut group_data: Vec<EpochGroupData> = Vec::new();
    let models: BTreeSet<&str> = active
        .iter()
        .flat_map(|p| p.groups.iter().map(|g| g.model_id.as_str()))
        .collect();
    for model_id in models {
        let members: Vec<MemberValidationWeight> = active
            .iter()
            .filter_map(|p| {
                let group = p.groups.iter().find(|g| g.model_id == model_id)?;
                Some(MemberValidationWeight {
                    member: p.index.clone(),
                    weight: group.nodes.iter().map(|n| n.poc_weight).sum(),
                    nodes: group.nodes.clone(),
                    reputation: 0,
                })
            })
            .collect();
        let snapshot = inputs
            .models
            .get(model_id)
            .cloned()
            .unwrap_or_else(|| ModelSnapshot {
                model_id: model_id.to_owned(),
                ..Default::default()
            });
        group_data.push(EpochGroupData {
            epoch_index: epoch_id,
            model_id: model_id.to_owned(),
            validation_weights: members,
            model_snapshot: snapshot,
        });
    }

    // The pipeline is complete; commit every write together.
    store::put_obj(store, &keys::active_participants(epoch_id), &active, "active")?;
    store::put_obj(store, &keys::epoch_bls(epoch_id), &bls_data, "bls")?;
    for data in &group_data {
        store::put_obj(
            store,
            &keys::epoch_group(epoch_id, &data.model_id),
            data,
            "group",
        )?;
    }
    events.push(Event::KeyGenerationInitiated {
        epoch_id,
        total_slots: bls_data.total_slots,
        degree: bls_data.degree,
        participants: bls_data
            .participants
            .iter()
            .map(|p| p.address.clone())
            .collect(),
    });
    info!(
        epoch_id,
        participants = active.len(),
        total_weight,
        "epoch switch complete, key generation opened"
    );
    Ok(EpochOutcome {
        active_participants: active.len(),
        total_weight,
        dkg_opened: true,
    })
}

/// Group data for the epoch an inference belongs to. Validation paths must
/// resolve the inference's own epoch, not the current one.
pub fn group_data_for_inference(
    store: &dyn StateStore,
    inference_epoch_id: u64,
    model_id: &str,
) -> Result<Option<EpochGroupData>, CoreError> {
    Ok(store::get_obj(
        store,
        &keys::epoch_group(inference_epoch_id, model_id),
        "group",
    )?)
}
