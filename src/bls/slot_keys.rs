// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Per-slot public key precomputation.
//!
//! Slot `i` owns the G2 key `Σ_j Σ_k C_{j,k} · (i+1)^k` over valid dealers
//! `j` and coefficient indices `k = 0..=t`. The dealer dimension is folded
//! first: one G2 addition pass aggregates `T_k = Σ_j C_{j,k}`, after which
//! every slot costs a single MSM over the `t+1` aggregated columns instead
//! of one MSM per dealer.

use blstrs::G2Projective;
use group::{Curve, Group};

use crate::bls::{self, BlsError};
use crate::dkg::EpochBLSData;

/// Computes the compressed per-slot public keys for an epoch whose dealer
/// consensus has been resolved. Output length equals the slot count.
///
/// Commitment positions a dealer left out (or set to infinity) contribute
/// the identity.
pub fn compute_slot_public_keys(data: &EpochBLSData) -> Result<Vec<Vec<u8>>, BlsError> {
    let coefficients = data.degree as usize + 1;
    let mut columns = vec![G2Projective::identity(); coefficients];

    for (dealer, part) in data.dealer_parts.iter().enumerate() {
        if !data.valid_dealers.get(dealer).copied().unwrap_or(false) {
            continue;
        }
        let Some(part) = part else { continue };
        for (k, commitment) in part.commitments.iter().take(coefficients).enumerate() {
            let point = bls::g2_from_compressed(commitment)?;
            columns[k] += G2Projective::from(&point);
        }
    }

    let mut slot_keys = Vec::with_capacity(data.total_slots as usize);
    for slot in 0..data.total_slots {
        let powers = bls::scalar_powers(u64::from(slot) + 1, coefficients);
        let key = bls::g2_msm(&columns, &powers)?;
        slot_keys.push(key.to_affine().to_compressed().to_vec());
    }
    Ok(slot_keys)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dkg::test_support::{completed_epoch, sample_polynomials};
    use blstrs::Scalar;
    use group::ff::Field;

    #[test]
    fn slot_keys_match_direct_polynomial_evaluation() {
        let polys = sample_polynomials(3, 3, 11);
        let data = completed_epoch(1, 6, 3, &polys);

        let keys = compute_slot_public_keys(&data).unwrap();
        assert_eq!(keys.len(), 6);

        for (slot, key) in keys.iter().enumerate() {
            // f(x) = Σ_d f_d(x) evaluated at x = slot + 1.
            let x = Scalar::from(slot as u64 + 1);
            let mut eval = Scalar::ZERO;
            for poly in &polys {
                let mut acc = Scalar::ZERO;
                for coeff in poly.iter().rev() {
                    acc = acc * x + coeff;
                }
                eval += acc;
            }
            let expected = (blstrs::G2Projective::generator() * eval)
                .to_affine()
                .to_compressed();
            assert_eq!(key.as_slice(), expected.as_slice());
        }
    }

    #[test]
    fn invalid_dealers_are_excluded() {
        let polys = sample_polynomials(2, 3, 13);
        let mut data = completed_epoch(1, 6, 3, &polys);
        data.valid_dealers[1] = false;

        let keys = compute_slot_public_keys(&data).unwrap();
        let x = Scalar::from(1u64);
        let mut acc = Scalar::ZERO;
        for coeff in polys[0].iter().rev() {
            acc = acc * x + coeff;
        }
        let expected = (blstrs::G2Projective::generator() * acc)
            .to_affine()
            .to_compressed();
        assert_eq!(keys[0].as_slice(), expected.as_slice());
    }
}
