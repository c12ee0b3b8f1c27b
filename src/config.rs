// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use bigdecimal::BigDecimal;
use serde::{Deserialize, Serialize};

/// Consensus parameters consumed by the core. Constructed by the host and
/// treated as immutable for the lifetime of an epoch.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CoreParams {
    /// Chain identifier mixed into the group-key validation message hash.
    pub chain_id: String,
    /// Number of BLS slots `I` per epoch.
    pub total_slots: u32,
    /// Polynomial degree is `t = total_slots - degree_offset`.
    pub degree_offset: u32,
    /// Length of the dealing phase, in blocks.
    pub dealing_window: u64,
    /// Length of the verifying phase, in blocks.
    pub verifying_window: u64,
    /// Fraction of per-model weight allocated to inference-serving nodes
    /// during the PoC stage. Must lie in `(0, 1)`.
    pub poc_slot_fraction: BigDecimal,
    /// Scale applied to proved work-unit counts when deriving weights.
    pub weight_scale_factor: BigDecimal,
    /// Optional host-supplied stage-time normalization factor.
    pub time_normalization_factor: Option<BigDecimal>,
    /// Sample size for slot-sampled validation voting; `0` selects the full
    /// weight-sum mode.
    pub validation_slots: u32,
    /// Enables guardian tie-breaking and slot-share reservation.
    pub guardian_enabled: bool,
    /// Guardian multiplier `m`; the reserved share is `m / (1 + m)`.
    pub guardian_multiplier: BigDecimal,
    /// Total active weight at which the network counts as mature and the
    /// guardian reservation stops applying.
    pub guardian_maturity_weight: i64,
    /// When set, participants absent from the host allowlist are dropped.
    pub allowlist_enabled: bool,
    /// Permits substituting the new epoch's own data when the previous
    /// epoch's BLS data has been pruned. Observability aid, off by default.
    pub allow_self_validation_fallback: bool,
}

impl CoreParams {
    /// Polynomial degree `t` for the configured slot count.
    pub fn degree(&self) -> u32 {
        self.total_slots.saturating_sub(self.degree_offset)
    }
}

impl Default for CoreParams {
    fn default() -> Self {
        CoreParams {
            chain_id: "inference-1".into(),
            total_slots: 100,
            degree_offset: 50,
            dealing_window: 20,
            verifying_window: 20,
            poc_slot_fraction: BigDecimal::new(2.into(), 1), // 0.2
            weight_scale_factor: BigDecimal::from(1),
            time_normalization_factor: None,
            validation_slots: 0,
            guardian_enabled: false,
            guardian_multiplier: BigDecimal::new(52.into(), 2), // 0.52
            guardian_maturity_weight: i64::MAX,
            allowlist_enabled: false,
            allow_self_validation_fallback: false,
        }
    }
}
