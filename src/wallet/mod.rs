// src/wallet/mod.rs
//! Identity Agent: keys, signatures, proofs and message packing.

pub mod capabilities;
pub mod didcomm;
pub mod key_management;
