//! This module provides the constant values used throughout the crate.

use std::time::Duration;

pub(crate) const DEFAULT_CHECK_DELEGATIONS_INTERVAL: Duration = Duration::from_secs(60);

pub(crate) const DEFAULT_MAX_SLASHING_CONCURRENCY: usize = 20;

pub(crate) const DEFAULT_RETRY_SLEEP: Duration = Duration::from_secs(5);

pub(crate) const DEFAULT_MAX_RETRY_TIMES: usize = 5;

pub(crate) const DEFAULT_NEW_DELEGATIONS_BUFFER: usize = 100;

pub(crate) const DEFAULT_SLASHING_KEY_BUFFER: usize = 10;

/// Name under which the equivocation slasher registers its chain subscriptions.
pub const EQUIVOCATION_SUBSCRIBER: &str = "btcstaking-tracker-equivocation-slasher";

/// Filter for finality-vote events of the staking chain that carry equivocation evidence.
pub const SAME_CHAIN_EVIDENCE_QUERY: &str =
    "babylon.finality.v1.EventSlashedFinalityProvider.evidence EXISTS";

/// Filter for equivocation evidence submitted on behalf of consumer chains.
pub const CONSUMER_EVIDENCE_QUERY: &str =
    "message.action='/babylon.finality.v1.MsgEquivocationEvidence'";
