//! Watcher that enforces slashing of BTC delegations.
//!
//! Two orchestrators live here:
//!
//! - [`EquivocationSlasher`](equivocation_slasher::EquivocationSlasher) listens for equivocation
//!   evidence on the staking chain, extracts the offending finality provider's key and broadcasts
//!   the slashing transactions of every delegation restaked to it.
//! - [`AtomicSlasher`](atomic_slasher::AtomicSlasher) watches Bitcoin for slashing transactions
//!   the staking chain never authorized, recovers the finality provider's key from the covenant
//!   signatures they reveal and reports the incident.
//!
//! Both talk to the outside world only through the [`clients`] traits.

pub mod atomic_slasher;
pub mod clients;
pub mod config;
pub mod constants;
pub mod equivocation_slasher;
pub mod errors;
pub mod index;
mod lifecycle;
pub mod metrics;
mod params;
mod retry;
pub mod secret;
pub mod slashing_tx;
pub mod subscription;
pub mod witness;

#[cfg(test)]
mod testing;

pub use lifecycle::LifecycleState;
