// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Typed events for observers. Core correctness never depends on them.

use serde::{Deserialize, Serialize};

use crate::types::Address;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    KeyGenerationInitiated {
        epoch_id: u64,
        total_slots: u32,
        degree: u32,
        participants: Vec<Address>,
    },
    VerifyingPhaseStarted {
        epoch_id: u64,
        deadline: u64,
    },
    GroupPublicKeyGenerated {
        epoch_id: u64,
        /// Compressed G2, hex.
        group_public_key: String,
        total_slots: u32,
        degree: u32,
        chain_id: String,
    },
    DkgFailed {
        epoch_id: u64,
        reason: String,
    },
    GroupKeyValidated {
        new_epoch_id: u64,
        /// Compressed G1, hex.
        final_signature: String,
    },
    GroupKeyValidationFailed {
        new_epoch_id: u64,
        reason: String,
    },
    /// Previous-epoch BLS data was absent and the policy gate allowed
    /// substituting the new epoch's own data.
    GroupKeyValidationFallback {
        new_epoch_id: u64,
        previous_epoch_id: u64,
    },
}
