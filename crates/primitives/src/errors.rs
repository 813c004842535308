//! Errors raised by the primitives in this crate.

use thiserror::Error;

/// Errors while parsing, producing or using an adaptor signature.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AdaptorSigError {
    /// The encoding has the wrong length.
    #[error("malformed adaptor signature: expected {expected} bytes, got {got}")]
    InvalidLength {
        /// Expected length.
        expected: usize,
        /// Actual length.
        got: usize,
    },

    /// The point prefix is neither `0x02` nor `0x03`.
    #[error("invalid first byte of adaptor signature: {0:#04x}")]
    InvalidPrefix(u8),

    /// The encoded `R` is not on the curve.
    #[error("failed to decompress point R")]
    InvalidPoint,

    /// The encoded scalar is not below the curve order.
    #[error("failed to parse scalar")]
    InvalidScalar,

    /// A point is the point at infinity.
    #[error("point {0} is at infinity")]
    PointAtInfinity(&'static str),

    /// `R` has an odd y coordinate.
    #[error("point R has odd y coordinate")]
    OddNonce,

    /// The adaptor signature does not verify.
    #[error("adaptor signature verification failed")]
    VerificationFailed,

    /// The revealed signature was produced with a different nonce.
    #[error("revealed signature nonce does not match the adaptor signature")]
    NonceMismatch,

    /// The extracted decryption key does not belong to the expected public key.
    #[error("extracted key does not match the encryption key")]
    KeyMismatch,

    /// The revealed signature could not be encoded.
    #[error("invalid schnorr signature: {0}")]
    InvalidSignature(String),
}

/// Errors while verifying or extracting extractable one-time signatures.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EotsError {
    /// The public randomness is not the x coordinate of a curve point.
    #[error("failed to parse public randomness")]
    InvalidPubRand,

    /// A signature is not a valid scalar.
    #[error("failed to parse signature scalar")]
    InvalidSignature,

    /// Both signatures commit to the same message, so nothing can be extracted.
    #[error("signatures are over the same message")]
    SameMessage,

    /// The extracted secret key does not match the signer's public key.
    #[error("extracted key does not match the public key")]
    KeyMismatch,
}

/// Errors while building staking scripts and taproot outputs.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ScriptError {
    /// No keys were given for a multisig script.
    #[error("cannot create multisig script without keys")]
    NoKeys,

    /// The same key appears twice in a multisig key set.
    #[error("duplicate key in list of keys")]
    DuplicateKeys,

    /// The quorum is zero or larger than the key set.
    #[error("invalid quorum {quorum} for {keys} keys")]
    InvalidQuorum {
        /// Requested quorum.
        quorum: usize,
        /// Number of keys.
        keys: usize,
    },

    /// The taproot tree could not be assembled.
    #[error("failed to build taproot tree: {0}")]
    Taproot(String),

    /// The spending transaction does not have the single input the slashing path expects.
    #[error("slashing tx must have exactly one input, got {0}")]
    InputCount(usize),

    /// The sighash could not be computed.
    #[error("failed to compute sighash: {0}")]
    Sighash(String),
}
