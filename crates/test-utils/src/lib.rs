//! This crate provides test-utilities for the staking watcher crates.
//!
//! These utilities generate random keys and transactions, and fully signed synthetic delegations
//! whose slashing transactions can be completed the same way a finality provider would.

pub mod bitcoin;
pub mod staking;
