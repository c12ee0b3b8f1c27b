// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Consensus-replicated core of a decentralized ML-inference network.
//!
//! Every validator executes this crate deterministically: identical inputs
//! yield byte-identical state transitions. Two subsystems make up the core:
//!
//! * the epoch DKG over BLS12-381 — verifiable distributed key generation
//!   producing a group public key and per-slot keys each epoch, with
//!   threshold partial-signature aggregation across epochs ([`dkg`],
//!   [`bls`]);
//! * the proof-of-compute weight pipeline — per-epoch conversion of
//!   off-chain compute evidence and peer validations into active
//!   participants, per-model time-slot allocations, and the BLS slot
//!   ranges feeding the DKG ([`poc`], [`epoch`]).
//!
//! The host chain supplies total message order, block heights, the chain
//! id, the application state hash, and participant seeds; the core adds no
//! randomness, clocks, or I/O of its own. All state flows through the
//! [`store::StateStore`] view, and components leave the store untouched on
//! every error path.

pub mod bls;
pub mod config;
pub mod dkg;
pub mod epoch;
pub mod error;
pub mod events;
pub mod poc;
pub mod store;
pub mod types;

pub use config::CoreParams;
pub use error::{CoreError, ErrorKind};
pub use events::Event;
