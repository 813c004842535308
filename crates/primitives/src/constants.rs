//! Constants fixed by the staking protocol.

use std::sync::LazyLock;

use secp256k1::{PublicKey, XOnlyPublicKey};

/// Size of a scalar modulo the curve order.
pub const MODN_SCALAR_SIZE: usize = 32;

/// Size of a compressed curve point.
pub const COMPRESSED_POINT_SIZE: usize = 33;

/// Size of an encoded adaptor signature `(R, s_hat, needs_negation)`.
pub const ADAPTOR_SIGNATURE_SIZE: usize = COMPRESSED_POINT_SIZE + MODN_SCALAR_SIZE + 1;

/// Size of a BIP340 signature with the default sighash type.
pub const SCHNORR_SIGNATURE_SIZE: usize = 64;

/// Tag of the BIP340 challenge hash.
pub const CHALLENGE_TAG: &[u8] = b"BIP0340/challenge";

/// Compressed encoding of the NUMS point used as the internal key of every staking taproot
/// output, so that the key path can never be used.
const UNSPENDABLE_KEY: &str = "0250929b74c1a04954b78b4b6035e97a5e078a5a0f28ec96d547bfee9ace803ac0";

/// The internal key of staking, unbonding and slashing outputs.
pub static UNSPENDABLE_INTERNAL_KEY: LazyLock<XOnlyPublicKey> = LazyLock::new(|| {
    let bytes = hex::decode(UNSPENDABLE_KEY).expect("valid hex constant");
    PublicKey::from_slice(&bytes)
        .expect("valid compressed public key")
        .x_only_public_key()
        .0
});
