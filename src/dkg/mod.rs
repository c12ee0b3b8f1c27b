// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Epoch DKG state machine.
//!
//! One [`EpochBLSData`] per epoch walks DEALING → VERIFYING → COMPLETED →
//! SIGNED, or terminates in FAILED. Phase progress is evaluated only by the
//! end-block tick against the stored block-height deadlines; message
//! handlers never advance phases. Participation is counted in slots, with
//! strict majorities (`2·covered > I`) throughout.

pub mod validation;

use serde::{Deserialize, Serialize};
use strum::Display;
use thiserror::Error;
use tracing::debug;

use crate::bls::{self, BlsError};
use crate::config::CoreParams;
use crate::error::{CoreError, ErrorKind};
use crate::events::Event;
use crate::store::{self, keys, StateStore};
use crate::types::Address;

#[derive(Clone, Copy, Debug, Display, PartialEq, Eq, Serialize, Deserialize)]
pub enum DkgPhase {
    Dealing,
    Verifying,
    Completed,
    Signed,
    Failed,
}

impl DkgPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, DkgPhase::Signed | DkgPhase::Failed)
    }
}

/// A participant's stake in one epoch's DKG: its inclusive slot range.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlsParticipant {
    pub address: Address,
    pub slot_start: u32,
    pub slot_end: u32,
}

impl BlsParticipant {
    pub fn slot_count(&self) -> u32 {
        self.slot_end - self.slot_start + 1
    }

    pub fn owns_slot(&self, slot: u32) -> bool {
        slot >= self.slot_start && slot <= self.slot_end
    }
}

/// Polynomial commitments `C_{d,0..=t}` plus the dealer's encrypted shares.
/// Shares are opaque to the core; only the commitments are validated.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DealerPart {
    pub commitments: Vec<Vec<u8>>,
    pub encrypted_shares: Vec<Vec<u8>>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EpochBLSData {
    pub epoch_id: u64,
    /// Slot count `I`.
    pub total_slots: u32,
    /// Polynomial degree `t`.
    pub degree: u32,
    /// Ascending by address; slot ranges partition `[0, I)`.
    pub participants: Vec<BlsParticipant>,
    /// Indexed by participant position.
    pub dealer_parts: Vec<Option<DealerPart>>,
    /// Indexed by participant position; inner vector votes per dealer.
    pub verification_submissions: Vec<Option<Vec<bool>>>,
    pub valid_dealers: Vec<bool>,
    /// Compressed G2; empty until COMPLETED.
    pub group_public_key: Vec<u8>,
    /// Compressed G2 per slot; empty until COMPLETED.
    pub slot_public_keys: Vec<Vec<u8>>,
    /// Compressed G1; empty until SIGNED.
    pub validation_signature: Vec<u8>,
    pub phase: DkgPhase,
    pub dealing_deadline: u64,
    pub verifying_deadline: u64,
}

#[derive(Debug, Error)]
pub enum DkgError {
    #[error("no BLS data for epoch {epoch_id}")]
    UnknownEpoch { epoch_id: u64 },
    #[error("{address} is not a participant of epoch {epoch_id}")]
    UnknownParticipant { address: Address, epoch_id: u64 },
    #[error("epoch {epoch_id} is in phase {actual}, message requires {expected}")]
    WrongPhase {
        epoch_id: u64,
        expected: DkgPhase,
        actual: DkgPhase,
    },
    #[error("{address} already submitted for epoch {epoch_id}")]
    AlreadySubmitted { address: Address, epoch_id: u64 },
    #[error("dealer part carries no commitments")]
    EmptyCommitments,
    #[error("dealer part carries {actual} commitments, at most {max} allowed")]
    TooManyCommitments { max: usize, actual: usize },
    #[error("verification vector length {actual} does not match {expected} participants")]
    VerificationLength { expected: usize, actual: usize },
    #[error(transparent)]
    Bls(#[from] BlsError),
    #[error("invariant violated: {0}")]
    Invariant(String),
}

impl DkgError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            DkgError::UnknownEpoch { .. }
            | DkgError::UnknownParticipant { .. }
            | DkgError::AlreadySubmitted { .. }
            | DkgError::EmptyCommitments
            | DkgError::TooManyCommitments { .. }
            | DkgError::VerificationLength { .. } => ErrorKind::Validation,
            DkgError::WrongPhase { .. } => ErrorKind::Phase,
            DkgError::Bls(e) => e.kind(),
            DkgError::Invariant(_) => ErrorKind::Invariant,
        }
    }
}

impl EpochBLSData {
    /// Opens the dealing phase for an epoch. `participants` must carry the
    /// contiguous ranges produced by slot assignment.
    pub fn new(
        epoch_id: u64,
        total_slots: u32,
        degree: u32,
        participants: Vec<BlsParticipant>,
        current_height: u64,
        params: &CoreParams,
    ) -> Self {
        let count = participants.len();
        let dealing_deadline = current_height + params.dealing_window;
        EpochBLSData {
            epoch_id,
            total_slots,
            degree,
            participants,
            dealer_parts: vec![None; count],
            verification_submissions: vec![None; count],
            valid_dealers: vec![false; count],
            group_public_key: Vec::new(),
            slot_public_keys: Vec::new(),
            validation_signature: Vec::new(),
            phase: DkgPhase::Dealing,
            dealing_deadline,
            verifying_deadline: dealing_deadline + params.verifying_window,
        }
    }

    pub fn participant_index(&self, address: &str) -> Option<usize> {
        self.participants.iter().position(|p| p.address == address)
    }

    pub fn assigned_range(&self, address: &str) -> Option<&BlsParticipant> {
        self.participants.iter().find(|p| p.address == address)
    }

    fn require_phase(&self, expected: DkgPhase) -> Result<(), DkgError> {
        if self.phase != expected {
            return Err(DkgError::WrongPhase {
                epoch_id: self.epoch_id,
                expected,
                actual: self.phase,
            });
        }
        Ok(())
    }

    /// Accepts a dealer part. All commitments are validated before any state
    /// is touched; rejection leaves the entity unchanged.
    pub fn submit_dealer_part(
        &mut self,
        submitter: &str,
        part: DealerPart,
    ) -> Result<(), DkgError> {
        self.require_phase(DkgPhase::Dealing)?;
        let index = self
            .participant_index(submitter)
            .ok_or_else(|| DkgError::UnknownParticipant {
                address: submitter.to_owned(),
                epoch_id: self.epoch_id,
            })?;
        if self.dealer_parts[index].is_some() {
            return Err(DkgError::AlreadySubmitted {
                address: submitter.to_owned(),
                epoch_id: self.epoch_id,
            });
        }
        if part.commitments.is_empty() {
            return Err(DkgError::EmptyCommitments);
        }
        let max = self.degree as usize + 1;
        if part.commitments.len() > max {
            return Err(DkgError::TooManyCommitments {
                max,
                actual: part.commitments.len(),
            });
        }
        for commitment in &part.commitments {
            bls::g2_from_compressed(commitment)?;
        }
        self.dealer_parts[index] = Some(part);
        Ok(())
    }

    /// Accepts a verification vector voting on each dealer's validity.
    pub fn submit_verification_vector(
        &mut self,
        submitter: &str,
        dealer_validity: Vec<bool>,
    ) -> Result<(), DkgError> {
        self.require_phase(DkgPhase::Verifying)?;
        let index = self
            .participant_index(submitter)
            .ok_or_else(|| DkgError::UnknownParticipant {
                address: submitter.to_owned(),
                epoch_id: self.epoch_id,
            })?;
        if self.verification_submissions[index].is_some() {
            return Err(DkgError::AlreadySubmitted {
                address: submitter.to_owned(),
                epoch_id: self.epoch_id,
            });
        }
        if dealer_validity.len() != self.participants.len() {
            return Err(DkgError::VerificationLength {
                expected: self.participants.len(),
                actual: dealer_validity.len(),
            });
        }
        self.verification_submissions[index] = Some(dealer_validity);
        Ok(())
    }

    /// Slots owned by participants that submitted a nonempty dealer part.
    pub fn slots_with_dealer_parts(&self) -> u32 {
        self.participants
            .iter()
            .zip(&self.dealer_parts)
            .filter(|(_, part)| part.as_ref().is_some_and(|p| !p.commitments.is_empty()))
            .map(|(p, _)| p.slot_count())
            .sum()
    }

    /// Slots owned by participants that submitted a nonempty verification
    /// vector.
    pub fn slots_with_verification(&self) -> u32 {
        self.participants
            .iter()
            .zip(&self.verification_submissions)
            .filter(|(_, sub)| sub.as_ref().is_some_and(|v| !v.is_empty()))
            .map(|(p, _)| p.slot_count())
            .sum()
    }

    /// Resolves dealer validity: a dealer is valid iff it submitted a
    /// nonempty part and strictly more than half of the voters approved it.
    pub fn dealer_consensus(&self) -> Vec<bool> {
        let voters: Vec<&Vec<bool>> = self
            .verification_submissions
            .iter()
            .flatten()
            .filter(|v| !v.is_empty())
            .collect();
        let voter_count = voters.len();
        self.dealer_parts
            .iter()
            .enumerate()
            .map(|(dealer, part)| {
                if !part.as_ref().is_some_and(|p| !p.commitments.is_empty()) {
                    return false;
                }
                let approvals = voters
                    .iter()
                    .filter(|votes| votes.get(dealer).copied().unwrap_or(false))
                    .count();
                approvals * 2 > voter_count
            })
            .collect()
    }

    /// Evaluates deadline-driven transitions. Returns whether the entity
    /// changed. Terminal failures are state transitions, not errors.
    pub fn advance(
        &mut self,
        height: u64,
        params: &CoreParams,
        events: &mut Vec<Event>,
    ) -> Result<bool, DkgError> {
        match self.phase {
            DkgPhase::Dealing if height >= self.dealing_deadline => {
                let covered = self.slots_with_dealer_parts();
                if u64::from(covered) * 2 > u64::from(self.total_slots) {
                    self.phase = DkgPhase::Verifying;
                    debug!(epoch_id = self.epoch_id, covered, "dealing complete");
                    events.push(Event::VerifyingPhaseStarted {
                        epoch_id: self.epoch_id,
                        deadline: self.verifying_deadline,
                    });
                } else {
                    self.fail(
                        format!(
                            "dealer parts cover {covered} of {} slots, more than {} required",
                            self.total_slots,
                            self.total_slots / 2
                        ),
                        events,
                    );
                }
                Ok(true)
            }
            DkgPhase::Verifying if height >= self.verifying_deadline => {
                let covered = self.slots_with_verification();
                if u64::from(covered) * 2 > u64::from(self.total_slots) {
                    let valid = self.dealer_consensus();
                    if valid.iter().any(|&v| v) {
                        self.valid_dealers = valid;
                        self.complete(params, events)?;
                    } else {
                        self.fail("dealer consensus yielded no valid dealers".into(), events);
                    }
                } else {
                    self.fail(
                        format!(
                            "verification covers {covered} of {} slots, more than {} required",
                            self.total_slots,
                            self.total_slots / 2
                        ),
                        events,
                    );
                }
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn fail(&mut self, reason: String, events: &mut Vec<Event>) {
        self.phase = DkgPhase::Failed;
        events.push(Event::DkgFailed {
            epoch_id: self.epoch_id,
            reason,
        });
    }

    /// Aggregates the group public key over valid dealers' zero coefficients
    /// and precomputes the per-slot keys.
    fn complete(&mut self, params: &CoreParams, events: &mut Vec<Event>) -> Result<(), DkgError> {
        let firsts: Vec<Vec<u8>> = self
            .dealer_parts
            .iter()
            .zip(&self.valid_dealers)
            .filter(|(_, valid)| **valid)
            .filter_map(|(part, _)| part.as_ref())
            .filter_map(|part| part.commitments.first().cloned())
            .collect();
        let group_key = bls::aggregate_g2(&firsts)?;
        if bls::g2_key_from_compressed(&group_key).is_err() {
            // An identity aggregate would be unusable for the cross-epoch
            // signature check; the ceremony is unrecoverable.
            self.fail("aggregated group key is the identity".into(), events);
            return Ok(());
        }
        self.group_public_key = group_key.to_vec();
        self.slot_public_keys = crate::bls::slot_keys::compute_slot_public_keys(self)?;
        if self.slot_public_keys.len() != self.total_slots as usize {
            return Err(DkgError::Invariant(format!(
                "slot key count {} does not match {} slots",
                self.slot_public_keys.len(),
                self.total_slots
            )));
        }
        self.phase = DkgPhase::Completed;
        events.push(Event::GroupPublicKeyGenerated {
            epoch_id: self.epoch_id,
            group_public_key: hex::encode(&self.group_public_key),
            total_slots: self.total_slots,
            degree: self.degree,
            chain_id: params.chain_id.clone(),
        });
        Ok(())
    }
}

/// `SubmitDealerPart` message body.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitDealerPart {
    pub epoch_id: u64,
    pub commitments: Vec<Vec<u8>>,
    pub encrypted_shares: Vec<Vec<u8>>,
}

/// `SubmitVerificationVector` message body.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitVerificationVector {
    pub epoch_id: u64,
    pub dealer_validity: Vec<bool>,
}

fn load_epoch(store: &dyn StateStore, epoch_id: u64) -> Result<EpochBLSData, CoreError> {
    store::get_obj::<EpochBLSData>(store, &keys::epoch_bls(epoch_id), "bls")?
        .ok_or_else(|| DkgError::UnknownEpoch { epoch_id }.into())
}

fn persist_epoch(store: &mut dyn StateStore, data: &EpochBLSData) -> Result<(), CoreError> {
    store::put_obj(store, &keys::epoch_bls(data.epoch_id), data, "bls")?;
    Ok(())
}

/// Message handler: dealer part submission.
pub fn handle_dealer_part(
    store: &mut dyn StateStore,
    submitter: &str,
    msg: SubmitDealerPart,
) -> Result<(), CoreError> {
    let mut data = load_epoch(store, msg.epoch_id)?;
    data.submit_dealer_part(
        submitter,
        DealerPart {
            commitments: msg.commitments,
            encrypted_shares: msg.encrypted_shares,
        },
    )?;
    persist_epoch(store, &data)
}

/// Message handler: verification vector submission.
pub fn handle_verification_vector(
    store: &mut dyn StateStore,
    submitter: &str,
    msg: SubmitVerificationVector,
) -> Result<(), CoreError> {
    let mut data = load_epoch(store, msg.epoch_id)?;
    data.submit_verification_vector(submitter, msg.dealer_validity)?;
    persist_epoch(store, &data)
}

/// End-block tick for one epoch's ceremony.
pub fn tick(
    store: &mut dyn StateStore,
    params: &CoreParams,
    epoch_id: u64,
    height: u64,
    events: &mut Vec<Event>,
) -> Result<(), CoreError> {
    let mut data = load_epoch(store, epoch_id)?;
    if data.advance(height, params, events)? {
        persist_epoch(store, &data)?;
    }
    Ok(())
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use crate::store::MemoryStore;
    use blstrs::G2Projective;
    use group::{Curve, Group};

    fn params(total_slots: u32, degree: u32) -> CoreParams {
        CoreParams {
            total_slots,
            degree_offset: total_slots - degree,
            ..Default::default()
        }
    }

    fn open_epoch(total_slots: u32, degree: u32) -> (EpochBLSData, CoreParams) {
        let ranges = vec![
            BlsParticipant {
                address: "validator-a".into(),
                slot_start: 0,
                slot_end: 2,
            },
            BlsParticipant {
                address: "validator-b".into(),
                slot_start: 3,
                slot_end: 4,
            },
            BlsParticipant {
                address: "validator-c".into(),
                slot_start: 5,
                slot_end: 5,
            },
        ];
        let p = params(total_slots, degree);
        let data = EpochBLSData::new(1, total_slots, degree, ranges, 100, &p);
        (data, p)
    }

    #[test]
    fn happy_path_completes_with_summed_group_key() {
        let (mut data, p) = open_epoch(6, 3);
        let polys = sample_polynomials(3, 3, 42);
        let addrs = ["validator-a", "validator-b", "validator-c"];
        for (addr, poly) in addrs.iter().zip(&polys) {
            data.submit_dealer_part(
                addr,
                DealerPart {
                    commitments: commitments_for(poly),
                    encrypted_shares: Vec::new(),
                },
            )
            .unwrap();
        }

        let mut events = Vec::new();
        assert!(data.advance(data.dealing_deadline, &p, &mut events).unwrap());
        assert_eq!(data.phase, DkgPhase::Verifying);

        for addr in addrs {
            data.submit_verification_vector(addr, vec![true, true, true])
                .unwrap();
        }
        assert!(data
            .advance(data.verifying_deadline, &p, &mut events)
            .unwrap());
        assert_eq!(data.phase, DkgPhase::Completed);
        assert_eq!(data.slot_public_keys.len(), 6);

        // GPK = Σ_d C_{d,0}.
        let mut expected = G2Projective::identity();
        for poly in &polys {
            expected += G2Projective::generator() * poly[0];
        }
        assert_eq!(
            data.group_public_key,
            expected.to_affine().to_compressed().to_vec()
        );
        assert!(events.iter().any(|e| matches!(
            e,
            Event::GroupPublicKeyGenerated { epoch_id: 1, .. }
        )));
    }

    #[test]
    fn insufficient_dealers_fail_at_deadline() {
        let (mut data, p) = open_epoch(6, 3);
        let polys = sample_polynomials(1, 3, 43);
        data.submit_dealer_part(
            "validator-a",
            DealerPart {
                commitments: commitments_for(&polys[0]),
                encrypted_shares: Vec::new(),
            },
        )
        .unwrap();

        let mut events = Vec::new();
        // Not yet due: nothing happens.
        assert!(!data
            .advance(data.dealing_deadline - 1, &p, &mut events)
            .unwrap());
        assert!(data.advance(data.dealing_deadline, &p, &mut events).unwrap());
        assert_eq!(data.phase, DkgPhase::Failed);
        match &events[0] {
            Event::DkgFailed { reason, .. } => {
                assert!(reason.contains("cover 3 of 6"), "reason: {reason}");
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn dealer_consensus_requires_strict_vote_majority() {
        let (mut data, p) = open_epoch(6, 3);
        let polys = sample_polynomials(3, 3, 44);
        let addrs = ["validator-a", "validator-b", "validator-c"];
        for (addr, poly) in addrs.iter().zip(&polys) {
            data.submit_dealer_part(
                addr,
                DealerPart {
                    commitments: commitments_for(poly),
                    encrypted_shares: Vec::new(),
                },
            )
            .unwrap();
        }
        let mut events = Vec::new();
        data.advance(data.dealing_deadline, &p, &mut events).unwrap();

        // Two of three voters approve dealer 0; only one approves dealer 1;
        // dealer 2 gets unanimous approval.
        data.submit_verification_vector("validator-a", vec![true, true, true])
            .unwrap();
        data.submit_verification_vector("validator-b", vec![true, false, true])
            .unwrap();
        data.submit_verification_vector("validator-c", vec![false, false, true])
            .unwrap();
        assert_eq!(data.dealer_consensus(), vec![true, false, true]);
    }

    #[test]
    fn submissions_in_wrong_phase_are_rejected() {
        let (mut data, _) = open_epoch(6, 3);
        let err = data
            .submit_verification_vector("validator-a", vec![true, true, true])
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Phase);

        data.phase = DkgPhase::Verifying;
        let err = data
            .submit_dealer_part("validator-a", DealerPart::default())
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Phase);
    }

    #[test]
    fn duplicate_and_unknown_submitters_are_rejected() {
        let (mut data, _) = open_epoch(6, 3);
        let polys = sample_polynomials(1, 3, 45);
        let part = DealerPart {
            commitments: commitments_for(&polys[0]),
            encrypted_shares: Vec::new(),
        };
        data.submit_dealer_part("validator-a", part.clone()).unwrap();
        let err = data.submit_dealer_part("validator-a", part.clone()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        let err = data.submit_dealer_part("stranger", part).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[test]
    fn malformed_commitments_are_rejected_atomically() {
        let (mut data, _) = open_epoch(6, 3);
        let polys = sample_polynomials(1, 3, 46);
        let mut commitments = commitments_for(&polys[0]);
        commitments[2] = vec![0xaa; 96];
        let err = data
            .submit_dealer_part(
                "validator-a",
                DealerPart {
                    commitments,
                    encrypted_shares: Vec::new(),
                },
            )
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Crypto);
        assert!(data.dealer_parts[0].is_none());
    }

    #[test]
    fn store_handlers_round_trip() {
        let mut store = MemoryStore::new();
        let (data, p) = open_epoch(6, 3);
        crate::store::put_obj(&mut store, &keys::epoch_bls(1), &data, "bls").unwrap();

        let polys = sample_polynomials(1, 3, 47);
        handle_dealer_part(
            &mut store,
            "validator-a",
            SubmitDealerPart {
                epoch_id: 1,
                commitments: commitments_for(&polys[0]),
                encrypted_shares: Vec::new(),
            },
        )
        .unwrap();

        let mut events = Vec::new();
        tick(&mut store, &p, 1, data.dealing_deadline, &mut events).unwrap();
        let reloaded: EpochBLSData =
            crate::store::get_obj(&store, &keys::epoch_bls(1), "bls")
                .unwrap()
                .unwrap();
        // One dealer holding 3 of 6 slots is not a strict majority.
        assert_eq!(reloaded.phase, DkgPhase::Failed);
    }

    #[test]
    fn phase_never_regresses_after_terminal_state() {
        let (mut data, p) = open_epoch(6, 3);
        let mut events = Vec::new();
        data.advance(data.dealing_deadline, &p, &mut events).unwrap();
        assert_eq!(data.phase, DkgPhase::Failed);
        assert!(!data
            .advance(data.verifying_deadline + 10, &p, &mut events)
            .unwrap());
        assert_eq!(data.phase, DkgPhase::Failed);
    }
}
