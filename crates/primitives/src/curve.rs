//! Conversions between the `secp256k1` key types and the `k256` field arithmetic used by the
//! signature schemes in this crate.

use k256::{
    elliptic_curve::{ops::Reduce, point::DecompressPoint, subtle::Choice},
    AffinePoint, FieldBytes, ProjectivePoint, Scalar, U256,
};
use secp256k1::{SecretKey, XOnlyPublicKey};
use sha2::{Digest, Sha256};

use crate::constants::CHALLENGE_TAG;

fn tagged_hash(tag: &[u8]) -> Sha256 {
    let tag_hash = Sha256::digest(tag);
    let mut digest = Sha256::new();
    digest.update(tag_hash);
    digest.update(tag_hash);
    digest
}

/// `e = H_tag(R.x || P.x || m) mod n`.
pub(crate) fn challenge(r_x: &[u8], p_x: &[u8; 32], msg: &[u8; 32]) -> Scalar {
    <Scalar as Reduce<U256>>::reduce_bytes(
        &tagged_hash(CHALLENGE_TAG)
            .chain_update(r_x)
            .chain_update(p_x)
            .chain_update(msg)
            .finalize(),
    )
}

/// Lifts an x coordinate to the curve point with even y.
pub(crate) fn lift_x(x: &[u8; 32]) -> Option<ProjectivePoint> {
    Option::<AffinePoint>::from(AffinePoint::decompress(
        FieldBytes::from_slice(x),
        Choice::from(0),
    ))
    .map(ProjectivePoint::from)
}

/// Lifts an x-only public key to its even-y point.
pub(crate) fn xonly_to_point(pk: &XOnlyPublicKey) -> Option<ProjectivePoint> {
    lift_x(&pk.serialize())
}

/// The scalar behind a secret key. Secret keys are always below the curve order so the reduction
/// is the identity.
pub(crate) fn secret_to_scalar(sk: &SecretKey) -> Scalar {
    <Scalar as Reduce<U256>>::reduce_bytes(&FieldBytes::from(sk.secret_bytes()))
}

/// The secret key for a scalar, `None` for zero.
pub(crate) fn scalar_to_secret(s: &Scalar) -> Option<SecretKey> {
    SecretKey::from_slice(&s.to_bytes()).ok()
}

/// Parses a 32-byte big-endian scalar, rejecting values not below the curve order.
pub(crate) fn parse_scalar(bytes: &[u8]) -> Option<Scalar> {
    if bytes.len() != 32 {
        return None;
    }
    Option::<Scalar>::from(<Scalar as k256::elliptic_curve::PrimeField>::from_repr(
        FieldBytes::clone_from_slice(bytes),
    ))
}
