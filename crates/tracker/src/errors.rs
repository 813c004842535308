//! Error types for the staking tracker.

use bitcoin::{OutPoint, Txid};
use btcstaking_primitives::errors::{AdaptorSigError, ScriptError};
use secp256k1::XOnlyPublicKey;
use thiserror::Error;

/// Reasons a transaction is not a well-formed spend of a delegation's slashing path.
///
/// Transactions come from arbitrary sources on Bitcoin, so every variant is an expected outcome
/// rather than a fault of the tracker.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FormatError {
    /// The slashing transaction does not have exactly one input.
    #[error("slashing tx must have exactly one input, got {0}")]
    InputCount(usize),

    /// The slashing transaction spends something other than the tracked output.
    #[error("slashing tx spends {got} instead of {expected}")]
    UnexpectedPrevout {
        /// The tracked output.
        expected: OutPoint,
        /// The output actually spent.
        got: OutPoint,
    },

    /// The witness stack has the wrong number of elements.
    #[error("expected {expected} witness elements, got {got}")]
    WitnessLength {
        /// Elements required by the slashing script.
        expected: usize,
        /// Elements present.
        got: usize,
    },

    /// A signature slot holds something other than nothing or a 64-byte signature.
    #[error("witness element {index} is not a schnorr signature")]
    InvalidSignature {
        /// Position of the element in the witness stack.
        index: usize,
    },

    /// A signature does not verify under the key its slot belongs to.
    #[error("signature of {0} does not verify")]
    SignatureMismatch(XOnlyPublicKey),

    /// The finality provider slots do not hold exactly one signature.
    #[error("expected exactly one finality provider signature, got {0}")]
    FpSignatureCount(usize),

    /// Fewer covenant signatures than the quorum.
    #[error("only {got} covenant signatures present, quorum is {quorum}")]
    CovenantQuorum {
        /// Signatures present.
        got: usize,
        /// The covenant quorum.
        quorum: usize,
    },

    /// The leaf script is not the delegation's slashing script.
    #[error("witness does not carry the slashing script")]
    ScriptMismatch,

    /// The control block does not prove the slashing leaf.
    #[error("witness does not carry the slashing control block")]
    ControlBlockMismatch,

    /// The expected slashing path could not be derived.
    #[error("failed to derive slashing path: {0}")]
    Script(#[from] ScriptError),
}

/// Errors returned by the chain adapter or the Bitcoin client.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ClientError {
    /// The request failed in transport or was rejected.
    #[error("request failed: {0}")]
    Request(String),

    /// The requested item does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The subscription could not be created or was closed.
    #[error("subscription failed: {0}")]
    Subscription(String),
}

/// Errors while slashing a single delegation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SlashingError {
    /// A covenant adaptor signature could not be used.
    #[error("invalid covenant adaptor signature: {0}")]
    AdaptorSig(#[from] AdaptorSigError),

    /// Not enough covenant signatures to satisfy the slashing script.
    #[error("only {got} covenant signatures available, quorum is {quorum}")]
    InsufficientCovenantSigs {
        /// Usable covenant signatures.
        got: usize,
        /// The covenant quorum.
        quorum: usize,
    },

    /// The key does not belong to any finality provider of the delegation.
    #[error("finality provider {0} is not restaked by this delegation")]
    UnknownFinalityProvider(XOnlyPublicKey),

    /// The delegation has no on-demand unbonding.
    #[error("delegation {0} has not been unbonded")]
    NotUnbonded(Txid),

    /// The output the slashing tx spends is no longer unspent.
    #[error("output {0} is not spendable")]
    OutputNotSpendable(OutPoint),

    /// The slashing transaction could not be built.
    #[error("failed to build slashing tx: {0}")]
    Script(#[from] ScriptError),

    /// A collaborator call failed.
    #[error("client error: {0}")]
    Client(#[from] ClientError),

    /// The slasher shut down before the delegation was slashed.
    #[error("slashing cancelled")]
    Cancelled,
}

/// Errors that prevent a slasher from starting.
#[derive(Debug, Error)]
pub enum TrackerError {
    /// Protocol parameters could not be loaded.
    #[error("failed to load parameters: {0}")]
    Params(ClientError),

    /// An event subscription could not be created.
    #[error("failed to subscribe: {0}")]
    Subscribe(ClientError),

    /// Historical evidence could not be fetched.
    #[error("failed to bootstrap: {0}")]
    Bootstrap(ClientError),

    /// The configuration is unusable.
    #[error("invalid config: {0}")]
    Config(String),

    /// Metrics could not be registered.
    #[error("failed to register metrics: {0}")]
    Metrics(#[from] prometheus::Error),
}
