// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! BLS12-381 primitives.
//!
//! Signatures live in G1 (48-byte compressed), public keys and polynomial
//! commitments in G2 (96-byte compressed). Every point ingested from an
//! untrusted source goes through the subgroup-checked decompression here;
//! identity acceptance is explicit per call site. Message hashing follows the
//! EIP-2537 `MAP_FP_TO_G1` construction: the 32-byte digest is zero-padded
//! to a 48-byte big-endian field element, mapped with the single-field SWU
//! map and isogeny, and cofactor-cleared.

pub mod slot_keys;

use blstrs::{Bls12, G1Affine, G1Projective, G2Affine, G2Prepared, G2Projective, Gt, Scalar};
use group::ff::Field;
use group::prime::PrimeCurveAffine;
use group::{Curve, Group};
use pairing::{MillerLoopResult as _, MultiMillerLoop};
use thiserror::Error;

use crate::error::ErrorKind;

/// Compressed G1 length in bytes.
pub const G1_LEN: usize = 48;
/// Compressed G2 length in bytes.
pub const G2_LEN: usize = 96;
/// EIP-2537 uncompressed G2 length in bytes.
pub const G2_UNCOMPRESSED_LEN: usize = 256;

/// Point counts below this are summed directly; anything larger goes through
/// Pippenger.
const MSM_CUTOFF: usize = 4;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BlsError {
    #[error("invalid input length: expected {expected} bytes, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
    #[error("point failed decompression or subgroup validation")]
    InvalidPoint,
    #[error("unexpected identity point")]
    IdentityPoint,
    #[error("mismatched point/scalar counts: {points} points, {scalars} scalars")]
    MsmLengthMismatch { points: usize, scalars: usize },
}

impl BlsError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            BlsError::InvalidLength { .. } => ErrorKind::Validation,
            BlsError::InvalidPoint | BlsError::IdentityPoint => ErrorKind::Crypto,
            BlsError::MsmLengthMismatch { .. } => ErrorKind::Invariant,
        }
    }
}

/// Maps a 32-byte message hash onto G1.
///
/// Fails only on a wrong input length. The zero-padded digest is always a
/// canonical field element, and the map output is in the subgroup by
/// construction.
pub fn hash_to_g1(hash: &[u8]) -> Result<G1Affine, BlsError> {
    if hash.len() != 32 {
        return Err(BlsError::InvalidLength {
            expected: 32,
            actual: hash.len(),
        });
    }
    let mut fe = [0u8; G1_LEN];
    fe[16..].copy_from_slice(hash);

    let mut fp = blst::blst_fp::default();
    let mut mapped = blst::blst_p1::default();
    let mut compressed = [0u8; G1_LEN];
    // SAFETY: all outputs are stack-allocated with the exact sizes the
    // bindings expect; the null pointer selects the single-field map.
    unsafe {
        blst::blst_fp_from_bendian(&mut fp, fe.as_ptr());
        blst::blst_map_to_g1(&mut mapped, &fp, std::ptr::null());
        blst::blst_p1_compress(compressed.as_mut_ptr(), &mapped);
    }
    // Re-enter blstrs through the checked path so downstream code only ever
    // sees validated points.
    Option::from(G1Affine::from_compressed(&compressed)).ok_or(BlsError::InvalidPoint)
}

/// Subgroup-checked G1 decompression, identity rejected.
pub fn g1_from_compressed(bytes: &[u8]) -> Result<G1Affine, BlsError> {
    let arr: &[u8; G1_LEN] = bytes.try_into().map_err(|_| BlsError::InvalidLength {
        expected: G1_LEN,
        actual: bytes.len(),
    })?;
    let point: G1Affine =
        Option::from(G1Affine::from_compressed(arr)).ok_or(BlsError::InvalidPoint)?;
    if bool::from(point.is_identity()) {
        return Err(BlsError::IdentityPoint);
    }
    Ok(point)
}

/// Subgroup-checked G2 decompression. Identity is accepted; dealer
/// commitment positions may legitimately carry it.
pub fn g2_from_compressed(bytes: &[u8]) -> Result<G2Affine, BlsError> {
    let arr: &[u8; G2_LEN] = bytes.try_into().map_err(|_| BlsError::InvalidLength {
        expected: G2_LEN,
        actual: bytes.len(),
    })?;
    Option::from(G2Affine::from_compressed(arr)).ok_or(BlsError::InvalidPoint)
}

/// Subgroup-checked G2 decompression for keys, identity rejected.
pub fn g2_key_from_compressed(bytes: &[u8]) -> Result<G2Affine, BlsError> {
    let point = g2_from_compressed(bytes)?;
    if bool::from(point.is_identity()) {
        return Err(BlsError::IdentityPoint);
    }
    Ok(point)
}

/// Sums compressed G2 points, validating each.
pub fn aggregate_g2(points: &[Vec<u8>]) -> Result<[u8; G2_LEN], BlsError> {
    let mut sum = G2Projective::identity();
    for bytes in points {
        sum += G2Projective::from(&g2_from_compressed(bytes)?);
    }
    Ok(sum.to_affine().to_compressed())
}

/// Combined pairing check `e(sig, G2_gen) · e(msg, -pk) == 1`.
///
/// Total: any malformed or identity input yields `false`.
pub fn verify_pairing(sig: &G1Affine, msg: &G1Affine, pk: &G2Affine) -> bool {
    if bool::from(sig.is_identity()) || bool::from(pk.is_identity()) {
        return false;
    }
    let generator = G2Prepared::from(G2Affine::generator());
    let neg_pk = G2Prepared::from(-pk);
    let result = Bls12::multi_miller_loop(&[(sig, &generator), (msg, &neg_pk)]);
    result.final_exponentiation() == Gt::identity()
}

/// Multi-scalar multiplication in G1. Scalars are consumed in the field's
/// native big-endian form; the backend converts to its little-endian limb
/// order internally.
pub fn g1_msm(points: &[G1Projective], scalars: &[Scalar]) -> Result<G1Projective, BlsError> {
    if points.len() != scalars.len() {
        return Err(BlsError::MsmLengthMismatch {
            points: points.len(),
            scalars: scalars.len(),
        });
    }
    if points.len() < MSM_CUTOFF {
        let mut sum = G1Projective::identity();
        for (point, scalar) in points.iter().zip(scalars) {
            sum += point * scalar;
        }
        return Ok(sum);
    }
    Ok(G1Projective::multi_exp(points, scalars))
}

/// Multi-scalar multiplication in G2.
pub fn g2_msm(points: &[G2Projective], scalars: &[Scalar]) -> Result<G2Projective, BlsError> {
    if points.len() != scalars.len() {
        return Err(BlsError::MsmLengthMismatch {
            points: points.len(),
            scalars: scalars.len(),
        });
    }
    if points.len() < MSM_CUTOFF {
        let mut sum = G2Projective::identity();
        for (point, scalar) in points.iter().zip(scalars) {
            sum += point * scalar;
        }
        return Ok(sum);
    }
    Ok(G2Projective::multi_exp(points, scalars))
}

/// Successive powers `base^0 .. base^(count-1)` in the scalar field.
pub fn scalar_powers(base: u64, count: usize) -> Vec<Scalar> {
    let base = Scalar::from(base);
    let mut powers = Vec::with_capacity(count);
    let mut acc = Scalar::ONE;
    for _ in 0..count {
        powers.push(acc);
        acc *= base;
    }
    powers
}

/// EIP-2537 uncompressed G2 layout: `X.c0 ‖ X.c1 ‖ Y.c0 ‖ Y.c1`, each
/// coordinate left-padded from 48 to 64 bytes.
pub fn g2_uncompressed_256(point: &G2Affine) -> [u8; G2_UNCOMPRESSED_LEN] {
    // Native uncompressed order is x.c1 ‖ x.c0 ‖ y.c1 ‖ y.c0.
    let raw = point.to_uncompressed();
    let mut out = [0u8; G2_UNCOMPRESSED_LEN];
    out[16..64].copy_from_slice(&raw[48..96]); // x.c0
    out[80..128].copy_from_slice(&raw[..48]); // x.c1
    out[144..192].copy_from_slice(&raw[144..192]); // y.c0
    out[208..256].copy_from_slice(&raw[96..144]); // y.c1
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn rng() -> StdRng {
        StdRng::seed_from_u64(7)
    }

    #[test]
    fn hash_to_g1_rejects_wrong_length() {
        assert_eq!(
            hash_to_g1(&[0u8; 31]),
            Err(BlsError::InvalidLength {
                expected: 32,
                actual: 31
            })
        );
        assert!(hash_to_g1(&[0u8; 32]).is_ok());
    }

    #[test]
    fn hash_to_g1_is_deterministic_and_input_sensitive() {
        let a = hash_to_g1(&[1u8; 32]).unwrap();
        let b = hash_to_g1(&[1u8; 32]).unwrap();
        let c = hash_to_g1(&[2u8; 32]).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(!bool::from(a.is_identity()));
    }

    #[test]
    fn sign_verify_round_trip() {
        let mut rng = rng();
        let sk = Scalar::random(&mut rng);
        let pk = (G2Projective::generator() * sk).to_affine();
        let msg = hash_to_g1(&[9u8; 32]).unwrap();
        let sig = (G1Projective::from(&msg) * sk).to_affine();
        assert!(verify_pairing(&sig, &msg, &pk));

        let other_msg = hash_to_g1(&[10u8; 32]).unwrap();
        assert!(!verify_pairing(&sig, &other_msg, &pk));

        let wrong_pk = (G2Projective::generator() * Scalar::random(&mut rng)).to_affine();
        assert!(!verify_pairing(&sig, &msg, &wrong_pk));
    }

    #[test]
    fn verify_pairing_rejects_identity_inputs() {
        let msg = hash_to_g1(&[3u8; 32]).unwrap();
        assert!(!verify_pairing(&G1Affine::identity(), &msg, &G2Affine::generator()));
        assert!(!verify_pairing(&msg, &msg, &G2Affine::identity()));
    }

    #[test]
    fn msm_matches_naive_sum() {
        let mut rng = rng();
        let points: Vec<G2Projective> = (0..8)
            .map(|_| G2Projective::generator() * Scalar::random(&mut rng))
            .collect();
        let scalars: Vec<Scalar> = (0..8).map(|_| Scalar::random(&mut rng)).collect();

        let mut naive = G2Projective::identity();
        for (point, scalar) in points.iter().zip(&scalars) {
            naive += point * scalar;
        }
        let msm = g2_msm(&points, &scalars).unwrap();
        assert_eq!(naive, msm);
    }

    #[test]
    fn aggregate_g2_validates_inputs() {
        let mut rng = rng();
        let a = (G2Projective::generator() * Scalar::random(&mut rng)).to_affine();
        let b = (G2Projective::generator() * Scalar::random(&mut rng)).to_affine();
        let sum = aggregate_g2(&[a.to_compressed().to_vec(), b.to_compressed().to_vec()])
            .unwrap();
        let expected = (G2Projective::from(&a) + G2Projective::from(&b))
            .to_affine()
            .to_compressed();
        assert_eq!(sum, expected);

        assert_eq!(
            aggregate_g2(&[vec![0u8; 95]]),
            Err(BlsError::InvalidLength {
                expected: G2_LEN,
                actual: 95
            })
        );
    }

    #[test]
    fn uncompressed_256_layout_pads_each_coordinate() {
        let point = G2Affine::generator();
        let raw = point.to_uncompressed();
        let out = g2_uncompressed_256(&point);
        for chunk in [0usize, 64, 128, 192] {
            assert_eq!(&out[chunk..chunk + 16], &[0u8; 16]);
        }
        assert_eq!(&out[16..64], &raw[48..96]);
        assert_eq!(&out[80..128], &raw[..48]);
    }

    #[test]
    fn scalar_powers_start_at_one() {
        let powers = scalar_powers(3, 4);
        assert_eq!(powers[0], Scalar::ONE);
        assert_eq!(powers[1], Scalar::from(3u64));
        assert_eq!(powers[3], Scalar::from(27u64));
    }
}
