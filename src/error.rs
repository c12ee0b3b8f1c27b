// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Crate-wide error aggregation.
//!
//! Each module defines its own `thiserror` enum; this module folds them into
//! [`CoreError`] and classifies every variant into an [`ErrorKind`] so the
//! host can map failures onto message rejections, deferrals, or terminal
//! state transitions without matching on strings.

use thiserror::Error;

use crate::bls::BlsError;
use crate::dkg::validation::GroupValidationError;
use crate::dkg::DkgError;
use crate::epoch::guardian::GuardianError;
use crate::epoch::slots::SlotError;
use crate::epoch::EpochError;
use crate::poc::allocation::AllocationError;
use crate::poc::WeightError;
use crate::store::StoreError;

/// Host-facing classification of a failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed input, wrong lengths, out-of-range indices, duplicates,
    /// references to unknown epochs or participants. State unchanged.
    Validation,
    /// Message arrived in the wrong DKG phase. State unchanged.
    Phase,
    /// Subgroup, pairing, or signature verification failure. State unchanged.
    Crypto,
    /// Insufficient participation or coverage; progress is preserved and
    /// further submissions are awaited.
    ThresholdDeferral,
    /// Deadline expired with insufficient participation, or consensus yielded
    /// zero valid dealers. The affected epoch is failed.
    TerminalFailure,
    /// Internal invariant violation. Must halt the component.
    Invariant,
}

#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Bls(#[from] BlsError),
    #[error(transparent)]
    Dkg(#[from] DkgError),
    #[error(transparent)]
    GroupValidation(#[from] GroupValidationError),
    #[error(transparent)]
    Slots(#[from] SlotError),
    #[error(transparent)]
    Weights(#[from] WeightError),
    #[error(transparent)]
    Allocation(#[from] AllocationError),
    #[error(transparent)]
    Guardian(#[from] GuardianError),
    #[error(transparent)]
    Epoch(#[from] EpochError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl CoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CoreError::Bls(e) => e.kind(),
            CoreError::Dkg(e) => e.kind(),
            CoreError::GroupValidation(e) => e.kind(),
            CoreError::Slots(e) => e.kind(),
            CoreError::Weights(e) => e.kind(),
            CoreError::Allocation(e) => e.kind(),
            CoreError::Guardian(e) => e.kind(),
            CoreError::Epoch(e) => e.kind(),
            CoreError::Store(_) => ErrorKind::Invariant,
        }
    }
}
