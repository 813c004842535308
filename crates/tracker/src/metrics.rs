//! Prometheus counters recorded by the slashers.
//!
//! The counters are registered into a registry supplied by the caller, which is also responsible
//! for exposing it. The slashers only ever increment them.

use prometheus::{IntCounter, Registry};

/// Counters shared by both slashers.
#[derive(Debug, Clone)]
pub struct SlasherMetrics {
    /// Finality providers a slashing pass was run for.
    pub slashed_finality_providers: IntCounter,

    /// Delegations whose slashing tx was broadcast or found on Bitcoin.
    pub slashed_delegations: IntCounter,

    /// Total stake of the slashed delegations, in satoshis.
    pub slashed_sats: IntCounter,

    /// Selective slashing incidents detected on Bitcoin.
    pub detected_selective_slashing: IntCounter,

    /// Selective slashing incidents reported to the staking chain.
    pub reported_selective_slashing: IntCounter,
}

fn register(registry: &Registry, name: &str, help: &str) -> Result<IntCounter, prometheus::Error> {
    let counter = IntCounter::new(name, help)?;
    registry.register(Box::new(counter.clone()))?;
    Ok(counter)
}

impl SlasherMetrics {
    /// Creates the counters and registers them into `registry`.
    pub fn new(registry: &Registry) -> Result<Self, prometheus::Error> {
        Ok(Self {
            slashed_finality_providers: register(
                registry,
                "btcstaking_tracker_slashed_finality_providers",
                "Number of finality providers slashed",
            )?,
            slashed_delegations: register(
                registry,
                "btcstaking_tracker_slashed_delegations",
                "Number of BTC delegations slashed",
            )?,
            slashed_sats: register(
                registry,
                "btcstaking_tracker_slashed_sats",
                "Amount of slashed stake in satoshis",
            )?,
            detected_selective_slashing: register(
                registry,
                "btcstaking_tracker_detected_selective_slashing",
                "Number of selective slashing incidents detected",
            )?,
            reported_selective_slashing: register(
                registry,
                "btcstaking_tracker_reported_selective_slashing",
                "Number of selective slashing incidents reported",
            )?,
        })
    }
}
