// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Guardian BLS slot-share reservation.
//!
//! While the network is young, a configured fraction `m / (1 + m)` of the
//! slot weight is reserved for guardian participants. The adjustment is
//! idempotent: once the guardian share sits within half a percent of the
//! target, no override is produced.

use std::collections::{BTreeMap, BTreeSet};

use bigdecimal::{BigDecimal, RoundingMode};
use num_traits::Zero;
use thiserror::Error;
use tracing::debug;

use crate::config::CoreParams;
use crate::error::ErrorKind;
use crate::types::Address;

/// Scale of the fixed-point percentage type in persisted state.
const PERCENTAGE_SCALE: i64 = 18;
/// The persisted type carries its scaled value as a 256-bit integer.
const PERCENTAGE_MANTISSA_BITS: u64 = 256;

#[derive(Debug, Error)]
pub enum GuardianError {
    #[error("percentage conversion overflow: {0}")]
    Conversion(String),
}

impl GuardianError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::Validation
    }
}

/// Truncates to the persisted fixed-point percentage type, rejecting values
/// whose scaled mantissa overflows it.
fn to_fixed_point(value: BigDecimal) -> Result<BigDecimal, GuardianError> {
    let truncated = value.with_scale_round(PERCENTAGE_SCALE, RoundingMode::Down);
    let (mantissa, _) = truncated.as_bigint_and_exponent();
    if mantissa.bits() > PERCENTAGE_MANTISSA_BITS {
        return Err(GuardianError::Conversion(format!(
            "{truncated} does not fit the fixed-point percentage type"
        )));
    }
    Ok(truncated)
}

/// Returns the replacement percentage map, or `None` when the gate does not
/// open or the current guardian share already matches the target. Shares
/// that overflow the persisted percentage type are rejected.
pub fn reserve_guardian_slots(
    percentages: &BTreeMap<Address, BigDecimal>,
    guardians: &BTreeSet<Address>,
    total_network_weight: i64,
    params: &CoreParams,
) -> Result<Option<BTreeMap<Address, BigDecimal>>, GuardianError> {
    if !params.guardian_enabled
        || total_network_weight >= params.guardian_maturity_weight
        || percentages.len() < 2
    {
        return Ok(None);
    }
    let present_guardians: Vec<&Address> = percentages
        .keys()
        .filter(|address| guardians.contains(*address))
        .collect();
    if present_guardians.is_empty() {
        return Ok(None);
    }

    let total: BigDecimal = percentages.values().cloned().sum();
    if total.is_zero() {
        return Ok(None);
    }
    let guardian_total: BigDecimal = percentages
        .iter()
        .filter(|(address, _)| guardians.contains(*address))
        .map(|(_, weight)| weight.clone())
        .sum();
    let non_guardian_total = &total - &guardian_total;
    if non_guardian_total.is_zero() {
        // Nothing to rebalance against.
        return Ok(None);
    }

    let one = BigDecimal::from(1);
    let target = &params.guardian_multiplier / (&one + &params.guardian_multiplier);
    let current = &guardian_total / &total;
    let tolerance = BigDecimal::new(5.into(), 3); // 0.005
    if (&current - &target).abs() <= tolerance {
        debug!(%current, %target, "guardian share already at target");
        return Ok(None);
    }

    let hundred = BigDecimal::from(100);
    let guardian_count = BigDecimal::from(present_guardians.len() as u64);
    let guardian_share = to_fixed_point(&hundred * &target / &guardian_count)?;
    let remainder_share = &hundred * (&one - &target);

    let mut adjusted = BTreeMap::new();
    for (address, weight) in percentages {
        let share = if guardians.contains(address) {
            guardian_share.clone()
        } else {
            to_fixed_point(&remainder_share * weight / &non_guardian_total)?
        };
        adjusted.insert(address.clone(), share);
    }
    Ok(Some(adjusted))
}
