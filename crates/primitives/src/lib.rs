//! This crate contains the types and pure functions of the BTC staking protocol that the watcher
//! services share: adaptor signatures, extractable one-time signatures, staking scripts and the
//! chain-side delegation records.
//!
//! It lies at the bottom of the crate-hierarchy in this workspace i.e., it does not depend on any
//! other crate in this workspace.

pub mod adaptor;
pub mod constants;
mod curve;
pub mod eots;
pub mod errors;
pub mod scripts;
pub mod secp;
pub mod types;
