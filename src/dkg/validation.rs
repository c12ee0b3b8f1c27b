// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Cross-epoch group-key validation.
//!
//! The new epoch's group public key counts as signed once slot holders of
//! the previous epoch, covering a strict majority of its slots, have each
//! signed the validation message with their slot shares. Partial signatures
//! are verified per slot against the previous epoch's precomputed slot keys,
//! then combined with Lagrange coefficients at zero into one G1 signature
//! that must verify against the previous group key.

use std::collections::BTreeSet;

use blstrs::{G1Projective, G2Affine, Scalar};
use group::ff::Field;
use group::Curve;
use keccak_hash::keccak;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, warn};

use crate::bls::{self, BlsError, G1_LEN};
use crate::config::CoreParams;
use crate::dkg::{DkgPhase, EpochBLSData};
use crate::error::{CoreError, ErrorKind};
use crate::events::Event;
use crate::store::{self, keys, StateStore};
use crate::types::Address;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ValidationStatus {
    Collecting,
    Validated,
}

/// One participant's signatures over a subset of its assigned slots.
/// `signature` is the concatenation of 48-byte G1 points, one per index.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartialSignature {
    pub participant: Address,
    pub slot_indices: Vec<u32>,
    pub signature: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GroupKeyValidationState {
    pub new_epoch_id: u64,
    pub previous_epoch_id: u64,
    pub status: ValidationStatus,
    pub message_hash: [u8; 32],
    /// Accepted submissions; slot coverage across them is disjoint.
    pub partial_signatures: Vec<PartialSignature>,
    pub slots_covered: u32,
    /// Compressed G1; empty until validated.
    pub final_signature: Vec<u8>,
}

impl GroupKeyValidationState {
    fn covered_slots(&self) -> BTreeSet<u32> {
        self.partial_signatures
            .iter()
            .flat_map(|p| p.slot_indices.iter().copied())
            .collect()
    }
}

#[derive(Debug, Error)]
pub enum GroupValidationError {
    #[error("epoch {new_epoch_id} has no previous epoch to validate against")]
    Genesis { new_epoch_id: u64 },
    #[error("no BLS data for epoch {epoch_id}")]
    UnknownEpoch { epoch_id: u64 },
    #[error("epoch {epoch_id} is in phase {actual}, group-key validation requires Completed")]
    WrongPhase { epoch_id: u64, actual: DkgPhase },
    #[error("BLS data for previous epoch {previous_epoch_id} is absent")]
    PreviousEpochMissing { previous_epoch_id: u64 },
    #[error("signature payload of {len} bytes is not a multiple of 48")]
    PayloadLength { len: usize },
    #[error("{slots} slot indices with {signatures} signatures")]
    SignatureCountMismatch { slots: usize, signatures: usize },
    #[error("{address} holds no slots in the previous epoch")]
    NotAParticipant { address: Address },
    #[error("slot {slot} lies outside the submitter's range [{start}, {end}]")]
    SlotOutOfRange { slot: u32, start: u32, end: u32 },
    #[error("slot {slot} appears twice in one submission")]
    DuplicateSlot { slot: u32 },
    #[error("partial signature for slot {slot} failed verification")]
    PartialVerification { slot: u32 },
    #[error("aggregated signature failed verification against the previous group key")]
    FinalVerification,
    #[error(transparent)]
    Bls(#[from] BlsError),
    #[error("invariant violated: {0}")]
    Invariant(String),
}

impl GroupValidationError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            GroupValidationError::Genesis { .. }
            | GroupValidationError::UnknownEpoch { .. }
            | GroupValidationError::PreviousEpochMissing { .. }
            | GroupValidationError::PayloadLength { .. }
            | GroupValidationError::SignatureCountMismatch { .. }
            | GroupValidationError::NotAParticipant { .. }
            | GroupValidationError::SlotOutOfRange { .. }
            | GroupValidationError::DuplicateSlot { .. } => ErrorKind::Validation,
            GroupValidationError::WrongPhase { .. } => ErrorKind::Phase,
            GroupValidationError::PartialVerification { .. }
            | GroupValidationError::FinalVerification => ErrorKind::Crypto,
            GroupValidationError::Bls(e) => e.kind(),
            GroupValidationError::Invariant(_) => ErrorKind::Invariant,
        }
    }
}

/// `SubmitGroupKeyValidationSignature` message body.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitGroupKeyValidationSignature {
    pub new_epoch_id: u64,
    pub slot_indices: Vec<u32>,
    pub partial_signature: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ValidationOutcome {
    Collecting { slots_covered: u32, required: u32 },
    Signed,
}

/// Hash of the message every previous-epoch slot holder signs:
/// `keccak256(be8(previous_epoch_id) ‖ sha256(chain_id) ‖ uncompressed256(GPK_new))`.
pub fn validation_message_hash(
    previous_epoch_id: u64,
    chain_id: &str,
    new_group_key: &G2Affine,
) -> [u8; 32] {
    let mut buf = Vec::with_capacity(8 + 32 + 256);
    buf.extend_from_slice(&previous_epoch_id.to_be_bytes());
    buf.extend_from_slice(&Sha256::digest(chain_id.as_bytes()));
    buf.extend_from_slice(&bls::g2_uncompressed_256(new_group_key));
    keccak(&buf).to_fixed_bytes()
}

/// Lagrange coefficients at zero for evaluation points `x = slot + 1`.
fn lagrange_at_zero(slots: &[u32]) -> Result<Vec<Scalar>, GroupValidationError> {
    let xs: Vec<Scalar> = slots
        .iter()
        .map(|&s| Scalar::from(u64::from(s) + 1))
        .collect();
    let mut coefficients = Vec::with_capacity(xs.len());
    for (i, xi) in xs.iter().enumerate() {
        let mut numerator = Scalar::ONE;
        let mut denominator = Scalar::ONE;
        for (j, xj) in xs.iter().enumerate() {
            if i == j {
                continue;
            }
            numerator *= -*xj;
            denominator *= *xi - *xj;
        }
        let inverse = Option::<Scalar>::from(denominator.invert()).ok_or_else(|| {
            GroupValidationError::Invariant("repeated evaluation point in Lagrange basis".into())
        })?;
        coefficients.push(numerator * inverse);
    }
    Ok(coefficients)
}

fn load_epoch(
    store: &dyn StateStore,
    epoch_id: u64,
) -> Result<Option<EpochBLSData>, CoreError> {
    Ok(store::get_obj(store, &keys::epoch_bls(epoch_id), "bls")?)
}

/// Message handler: accepts partial signatures over the new epoch's group
/// key and, once a strict slot majority of the previous epoch is covered,
/// aggregates and verifies the final signature, advancing the new epoch to
/// SIGNED.
///
/// Individually-verified partials persist even when the final aggregate
/// check fails; the state remains `Collecting` and more slots may be
/// submitted.
pub fn handle_group_key_validation(
    store: &mut dyn StateStore,
    params: &CoreParams,
    submitter: &str,
    msg: &SubmitGroupKeyValidationSignature,
    events: &mut Vec<Event>,
) -> Result<ValidationOutcome, CoreError> {
    if msg.new_epoch_id <= 1 {
        return Err(GroupValidationError::Genesis {
            new_epoch_id: msg.new_epoch_id,
        }
        .into());
    }
    let mut new_data = load_epoch(store, msg.new_epoch_id)?.ok_or(
        GroupValidationError::UnknownEpoch {
            epoch_id: msg.new_epoch_id,
        },
    )?;
    if new_data.phase != DkgPhase::Completed {
        return Err(GroupValidationError::WrongPhase {
            epoch_id: msg.new_epoch_id,
            actual: new_data.phase,
        }
        .into());
    }

    let previous_epoch_id = msg.new_epoch_id - 1;
    let prev_data = match load_epoch(store, previous_epoch_id)? {
        Some(data) => data,
        None if params.allow_self_validation_fallback => {
            warn!(
                new_epoch_id = msg.new_epoch_id,
                previous_epoch_id, "previous epoch data absent, substituting own epoch data"
            );
            events.push(Event::GroupKeyValidationFallback {
                new_epoch_id: msg.new_epoch_id,
                previous_epoch_id,
            });
            new_data.clone()
        }
        None => {
            return Err(GroupValidationError::PreviousEpochMissing { previous_epoch_id }.into())
        }
    };

    let new_group_key = bls::g2_key_from_compressed(&new_data.group_public_key)
        .map_err(|e| GroupValidationError::Invariant(format!("stored group key: {e}")))?;

    let state_key = keys::group_validation(msg.new_epoch_id);
    let mut state = store::get_obj::<GroupKeyValidationState>(store, &state_key, "groupval")?
        .unwrap_or_else(|| GroupKeyValidationState {
            new_epoch_id: msg.new_epoch_id,
            previous_epoch_id,
            status: ValidationStatus::Collecting,
            message_hash: validation_message_hash(
                previous_epoch_id,
                &params.chain_id,
                &new_group_key,
            ),
            partial_signatures: Vec::new(),
            slots_covered: 0,
            final_signature: Vec::new(),
        });
    if state.status == ValidationStatus::Validated {
        return Err(GroupValidationError::WrongPhase {
            epoch_id: msg.new_epoch_id,
            actual: DkgPhase::Signed,
        }
        .into());
    }

    // Shape checks before any crypto.
    if msg.partial_signature.len() % G1_LEN != 0 {
        return Err(GroupValidationError::PayloadLength {
            len: msg.partial_signature.len(),
        }
        .into());
    }
    if msg.partial_signature.len() / G1_LEN != msg.slot_indices.len() {
        return Err(GroupValidationError::SignatureCountMismatch {
            slots: msg.slot_indices.len(),
            signatures: msg.partial_signature.len() / G1_LEN,
        }
        .into());
    }
    let range = prev_data.assigned_range(submitter).ok_or_else(|| {
        GroupValidationError::NotAParticipant {
            address: submitter.to_owned(),
        }
    })?;
    let mut in_message = BTreeSet::new();
    for &slot in &msg.slot_indices {
        if !range.owns_slot(slot) {
            return Err(GroupValidationError::SlotOutOfRange {
                slot,
                start: range.slot_start,
                end: range.slot_end,
            }
            .into());
        }
        if !in_message.insert(slot) {
            return Err(GroupValidationError::DuplicateSlot { slot }.into());
        }
    }

    if prev_data.slot_public_keys.len() != prev_data.total_slots as usize {
        return Err(GroupValidationError::Invariant(format!(
            "previous epoch carries {} slot keys for {} slots",
            prev_data.slot_public_keys.len(),
            prev_data.total_slots
        ))
        .into());
    }

    // Slots already covered by earlier submissions are dropped silently.
    let covered = state.covered_slots();
    let fresh: Vec<(u32, &[u8])> = msg
        .slot_indices
        .iter()
        .enumerate()
        .filter(|(_, slot)| !covered.contains(slot))
        .map(|(i, &slot)| (slot, &msg.partial_signature[i * G1_LEN..(i + 1) * G1_LEN]))
        .collect();
    if fresh.len() < msg.slot_indices.len() {
        debug!(
            submitter,
            dropped = msg.slot_indices.len() - fresh.len(),
            "dropping already-covered slot indices"
        );
    }
    let required = prev_data.total_slots / 2 + 1;
    if fresh.is_empty() {
        return Ok(ValidationOutcome::Collecting {
            slots_covered: state.slots_covered,
            required,
        });
    }

    let message_point = bls::hash_to_g1(&state.message_hash)?;
    for (slot, segment) in &fresh {
        let signature = bls::g1_from_compressed(segment)?;
        let slot_key = bls::g2_key_from_compressed(&prev_data.slot_public_keys[*slot as usize])
            .map_err(|e| GroupValidationError::Invariant(format!("stored slot key: {e}")))?;
        if !bls::verify_pairing(&signature, &message_point, &slot_key) {
            return Err(GroupValidationError::PartialVerification { slot: *slot }.into());
        }
    }

    state.partial_signatures.push(PartialSignature {
        participant: submitter.to_owned(),
        slot_indices: fresh.iter().map(|(slot, _)| *slot).collect(),
        signature: fresh.iter().flat_map(|(_, seg)| seg.iter().copied()).collect(),
    });
    state.slots_covered += fresh.len() as u32;

    if state.slots_covered < required {
        store::put_obj(store, &state_key, &state, "groupval")?;
        return Ok(ValidationOutcome::Collecting {
            slots_covered: state.slots_covered,
            required,
        });
    }

    // Threshold reached: reconstruct the group signature at zero.
    let mut slots = Vec::with_capacity(state.slots_covered as usize);
    let mut signatures = Vec::with_capacity(state.slots_covered as usize);
    for partial in &state.partial_signatures {
        for (i, &slot) in partial.slot_indices.iter().enumerate() {
            slots.push(slot);
            let segment = &partial.signature[i * G1_LEN..(i + 1) * G1_LEN];
            signatures.push(G1Projective::from(&bls::g1_from_compressed(segment)?));
        }
    }
    let coefficients = lagrange_at_zero(&slots)?;
    let final_signature = bls::g1_msm(&signatures, &coefficients)?.to_affine();

    let previous_group_key = bls::g2_key_from_compressed(&prev_data.group_public_key)
        .map_err(|e| GroupValidationError::Invariant(format!("previous group key: {e}")))?;
    if !bls::verify_pairing(&final_signature, &message_point, &previous_group_key) {
        // Keep the verified partials; the caller may cover more slots and
        // trigger another aggregation attempt.
        store::put_obj(store, &state_key, &state, "groupval")?;
        events.push(Event::GroupKeyValidationFailed {
            new_epoch_id: msg.new_epoch_id,
            reason: "aggregated signature does not verify against previous group key".into(),
        });
        return Err(GroupValidationError::FinalVerification.into());
    }

    state.status = ValidationStatus::Validated;
    state.final_signature = final_signature.to_compressed().to_vec();
    new_data.validation_signature = state.final_signature.clone();
    new_data.phase = DkgPhase::Signed;
    store::put_obj(store, &state_key, &state, "groupval")?;
    store::put_obj(store, &keys::epoch_bls(new_data.epoch_id), &new_data, "bls")?;
    events.push(Event::GroupKeyValidated {
        new_epoch_id: msg.new_epoch_id,
        final_signature: hex::encode(&state.final_signature),
    });
    Ok(ValidationOutcome::Signed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dkg::test_support::{completed_epoch, sample_polynomials, share_for_slot};
    use crate::store::MemoryStore;
    use blstrs::Scalar;

    struct Fixture {
        store: MemoryStore,
        params: CoreParams,
        prev_polys: Vec<Vec<Scalar>>,
        message_hash: [u8; 32],
    }

    /// Previous epoch (id 1) and new epoch (id 2), both completed, with the
    /// previous epoch's three participants splitting six slots evenly.
    fn fixture(prev_degree: u32) -> Fixture {
        let mut store = MemoryStore::new();
        let params = CoreParams {
            total_slots: 6,
            degree_offset: 6 - prev_degree,
            ..Default::default()
        };
        let prev_polys = sample_polynomials(3, prev_degree as usize, 21);
        let prev = completed_epoch(1, 6, prev_degree, &prev_polys);
        let new_polys = sample_polynomials(3, prev_degree as usize, 22);
        let new = completed_epoch(2, 6, prev_degree, &new_polys);
        let new_group_key = bls::g2_key_from_compressed(&new.group_public_key).unwrap();
        let message_hash = validation_message_hash(1, &params.chain_id, &new_group_key);
        crate::store::put_obj(&mut store, &keys::epoch_bls(1), &prev, "bls").unwrap();
        crate::store::put_obj(&mut store, &keys::epoch_bls(2), &new, "bls").unwrap();
        Fixture {
            store,
            params,
            prev_polys,
            message_hash,
        }
    }

    fn sign_slots(fixture: &Fixture, slots: &[u32]) -> Vec<u8> {
        let message = bls::hash_to_g1(&fixture.message_hash).unwrap();
        let mut payload = Vec::new();
        for &slot in slots {
            let share = share_for_slot(&fixture.prev_polys, slot);
            let signature = (G1Projective::from(&message) * share).to_affine();
            payload.extend_from_slice(&signature.to_compressed());
        }
        payload
    }

    fn submit(
        fixture: &mut Fixture,
        submitter: &str,
        slots: Vec<u32>,
    ) -> Result<ValidationOutcome, CoreError> {
        let payload = sign_slots(fixture, &slots);
        let params = fixture.params.clone();
        let mut events = Vec::new();
        handle_group_key_validation(
            &mut fixture.store,
            &params,
            submitter,
            &SubmitGroupKeyValidationSignature {
                new_epoch_id: 2,
                slot_indices: slots,
                partial_signature: payload,
            },
            &mut events,
        )
    }

    #[test]
    fn collects_then_signs_at_strict_majority() {
        let mut fx = fixture(3);
        // validator00 owns slots {0, 1}: below the 4-slot requirement.
        let outcome = submit(&mut fx, "validator00", vec![0, 1]).unwrap();
        assert_eq!(
            outcome,
            ValidationOutcome::Collecting {
                slots_covered: 2,
                required: 4
            }
        );

        // validator01 adds {2, 3}: coverage 4 reaches the threshold and the
        // aggregate verifies against the previous group key.
        let outcome = submit(&mut fx, "validator01", vec![2, 3]).unwrap();
        assert_eq!(outcome, ValidationOutcome::Signed);

        let new_data: EpochBLSData =
            crate::store::get_obj(&fx.store, &keys::epoch_bls(2), "bls")
                .unwrap()
                .unwrap();
        assert_eq!(new_data.phase, DkgPhase::Signed);
        assert_eq!(new_data.validation_signature.len(), 48);

        let state: GroupKeyValidationState =
            crate::store::get_obj(&fx.store, &keys::group_validation(2), "groupval")
                .unwrap()
                .unwrap();
        assert_eq!(state.status, ValidationStatus::Validated);
        assert_eq!(state.slots_covered, 4);
    }

    #[test]
    fn genesis_epoch_rejects_validation() {
        let mut fx = fixture(3);
        let mut events = Vec::new();
        let params = fx.params.clone();
        let err = handle_group_key_validation(
            &mut fx.store,
            &params,
            "validator00",
            &SubmitGroupKeyValidationSignature {
                new_epoch_id: 1,
                slot_indices: vec![0],
                partial_signature: vec![0; 48],
            },
            &mut events,
        )
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[test]
    fn slots_outside_assigned_range_are_rejected() {
        let mut fx = fixture(3);
        // validator00 owns {0, 1} only.
        let err = submit(&mut fx, "validator00", vec![0, 3]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert!(
            crate::store::get_obj::<GroupKeyValidationState>(
                &fx.store,
                &keys::group_validation(2),
                "groupval"
            )
            .unwrap()
            .is_none(),
            "rejected submission must not create state"
        );
    }

    #[test]
    fn already_covered_slots_are_dropped_silently() {
        let mut fx = fixture(3);
        submit(&mut fx, "validator00", vec![0, 1]).unwrap();
        let outcome = submit(&mut fx, "validator00", vec![0, 1]).unwrap();
        assert_eq!(
            outcome,
            ValidationOutcome::Collecting {
                slots_covered: 2,
                required: 4
            }
        );
    }

    #[test]
    fn mismatched_payload_is_rejected() {
        let mut fx = fixture(3);
        let mut events = Vec::new();
        let params = fx.params.clone();
        let err = handle_group_key_validation(
            &mut fx.store,
            &params,
            "validator00",
            &SubmitGroupKeyValidationSignature {
                new_epoch_id: 2,
                slot_indices: vec![0, 1],
                partial_signature: vec![0; 49],
            },
            &mut events,
        )
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[test]
    fn corrupted_partial_signature_is_rejected() {
        let mut fx = fixture(3);
        let mut payload = sign_slots(&fx, &[0]);
        // Swap in a signature over a different message.
        let other = bls::hash_to_g1(&[0x55u8; 32]).unwrap();
        let share = share_for_slot(&fx.prev_polys, 0);
        payload[..48].copy_from_slice(
            &(G1Projective::from(&other) * share).to_affine().to_compressed(),
        );
        let params = fx.params.clone();
        let mut events = Vec::new();
        let err = handle_group_key_validation(
            &mut fx.store,
            &params,
            "validator00",
            &SubmitGroupKeyValidationSignature {
                new_epoch_id: 2,
                slot_indices: vec![0],
                partial_signature: payload,
            },
            &mut events,
        )
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Crypto);
    }

    #[test]
    fn failed_aggregate_preserves_progress_and_recovers() {
        // Degree 4 with six slots: the 4-slot majority is one point short of
        // reconstructing the degree-4 polynomial, so the first aggregation
        // attempt fails; a fifth slot repairs it.
        let mut fx = fixture(4);
        submit(&mut fx, "validator00", vec![0, 1]).unwrap();
        let err = submit(&mut fx, "validator01", vec![2, 3]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Crypto);

        let state: GroupKeyValidationState =
            crate::store::get_obj(&fx.store, &keys::group_validation(2), "groupval")
                .unwrap()
                .unwrap();
        assert_eq!(state.status, ValidationStatus::Collecting);
        assert_eq!(state.slots_covered, 4);

        let outcome = submit(&mut fx, "validator02", vec![4]).unwrap();
        assert_eq!(outcome, ValidationOutcome::Signed);
    }

    #[test]
    fn lagrange_reconstructs_constant_term() {
        // Shares of f(x) = 5 + 3x + 7x² at x = slot+1 for slots {0, 2, 5}.
        let f = |x: u64| {
            Scalar::from(5u64) + Scalar::from(3u64) * Scalar::from(x) + Scalar::from(7u64)
                * Scalar::from(x)
                * Scalar::from(x)
        };
        let slots = [0u32, 2, 5];
        let coefficients = lagrange_at_zero(&slots).unwrap();
        let mut acc = Scalar::ZERO;
        for (slot, lambda) in slots.iter().zip(&coefficients) {
            acc += f(u64::from(*slot) + 1) * lambda;
        }
        assert_eq!(acc, Scalar::from(5u64));
    }
}
