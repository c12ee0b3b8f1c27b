// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Largest-remainder slot assignment.
//!
//! Percentage weights become contiguous, disjoint slot ranges covering
//! `[0, I)`. Every ordering decision ties back to the address so that any
//! permutation of the input yields the same ranges.

use std::collections::BTreeMap;

use bigdecimal::{BigDecimal, RoundingMode};
use num_traits::{ToPrimitive, Zero};
use thiserror::Error;

use crate::error::ErrorKind;
use crate::types::Address;

/// Inclusive slot range owned by one participant.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SlotRange {
    pub address: Address,
    pub start: u32,
    pub end: u32,
}

#[derive(Debug, Error)]
pub enum SlotError {
    #[error("negative weight for {address}")]
    NegativeWeight { address: Address },
    #[error("no participant carries positive weight")]
    NoEligibleParticipants,
    #[error("total weight is zero after truncation")]
    ZeroTotalWeight,
    #[error("cannot guarantee a slot for every participant: no donor with at least two slots")]
    DonorUnavailable,
    #[error("invariant violated: {0}")]
    Invariant(String),
}

impl SlotError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SlotError::NegativeWeight { .. }
            | SlotError::NoEligibleParticipants
            | SlotError::ZeroTotalWeight
            | SlotError::DonorUnavailable => ErrorKind::Validation,
            SlotError::Invariant(_) => ErrorKind::Invariant,
        }
    }
}

struct Entry {
    address: Address,
    weight: BigDecimal,
    count: u32,
    remainder: BigDecimal,
}

/// Assigns `total_slots` contiguous slots proportionally to the given
/// percentage weights.
///
/// Zero-weight participants are skipped; when more participants carry weight
/// than slots exist, the heaviest `total_slots` are kept (ties by ascending
/// address). Every surviving participant ends up with at least one slot.
pub fn assign_slots(
    weights: &BTreeMap<Address, BigDecimal>,
    total_slots: u32,
) -> Result<Vec<SlotRange>, SlotError> {
    let zero = BigDecimal::zero();
    for (address, weight) in weights {
        if weight < &zero {
            return Err(SlotError::NegativeWeight {
                address: address.clone(),
            });
        }
    }

    let mut entries: Vec<Entry> = weights
        .iter()
        .filter(|(_, weight)| *weight > &zero)
        .map(|(address, weight)| Entry {
            address: address.clone(),
            weight: weight.clone(),
            count: 0,
            remainder: BigDecimal::zero(),
        })
        .collect();
    if entries.is_empty() {
        return Err(SlotError::NoEligibleParticipants);
    }

    // More weighted participants than slots: keep the heaviest.
    if entries.len() > total_slots as usize {
        entries.sort_by(|a, b| {
            b.weight
                .cmp(&a.weight)
                .then_with(|| a.address.cmp(&b.address))
        });
        entries.truncate(total_slots as usize);
    }

    let total: BigDecimal = entries.iter().map(|e| e.weight.clone()).sum();
    if total.is_zero() {
        return Err(SlotError::ZeroTotalWeight);
    }

    entries.sort_by(|a, b| a.address.cmp(&b.address));

    let slots_dec = BigDecimal::from(u64::from(total_slots));
    let mut assigned = 0u32;
    for entry in &mut entries {
        let exact = &entry.weight * &slots_dec / &total;
        let floored = exact.with_scale_round(0, RoundingMode::Down);
        let count = floored.to_u32().ok_or_else(|| {
            SlotError::Invariant(format!("floor({exact}) does not fit a slot count"))
        })?;
        entry.remainder = exact - floored;
        entry.count = count;
        assigned += count;
    }

    // Leftover slots go to the largest remainders, addresses breaking ties.
    let leftover = total_slots - assigned;
    if leftover as usize > entries.len() {
        return Err(SlotError::Invariant(format!(
            "{leftover} leftover slots for {} participants",
            entries.len()
        )));
    }
    let mut by_remainder: Vec<usize> = (0..entries.len()).collect();
    by_remainder.sort_by(|&a, &b| {
        entries[b]
            .remainder
            .cmp(&entries[a].remainder)
            .then_with(|| entries[a].address.cmp(&entries[b].address))
    });
    for &index in by_remainder.iter().take(leftover as usize) {
        entries[index].count += 1;
    }

    // Every survivor gets at least one slot, donated from the largest holder.
    loop {
        let Some(starving) = entries.iter().position(|e| e.count == 0) else {
            break;
        };
        let donor = entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.count >= 2)
            .max_by(|(_, a), (_, b)| {
                a.count
                    .cmp(&b.count)
                    .then_with(|| a.remainder.cmp(&b.remainder))
                    .then_with(|| b.address.cmp(&a.address))
            })
            .map(|(i, _)| i)
            .ok_or(SlotError::DonorUnavailable)?;
        entries[donor].count -= 1;
        entries[starving].count += 1;
    }

    let sum: u32 = entries.iter().map(|e| e.count).sum();
    if sum != total_slots {
        return Err(SlotError::Invariant(format!(
            "assigned {sum} slots, expected {total_slots}"
        )));
    }

    let mut ranges = Vec::with_capacity(entries.len());
    let mut cursor = 0u32;
    for entry in &entries {
        ranges.push(SlotRange {
            address: entry.address.clone(),
            start: cursor,
            end: cursor + entry.count - 1,
        });
        cursor += entry.count;
    }
    Ok(ranges)
}
