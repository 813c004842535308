//! Extractable one-time signatures (EOTS).
//!
//! A finality provider commits to public randomness `R` for every height and signs its finality
//! vote as a BIP340 signature with that fixed nonce. Signing two different blocks at the same
//! height reuses the nonce, and the two `s` values reveal the secret key:
//! `x = (s1 - s2) / (e1 - e2)`.

use k256::{elliptic_curve::point::AffineCoordinates, ProjectivePoint, Scalar};
use secp256k1::{SecretKey, XOnlyPublicKey};
use sha2::{Digest, Sha256};

use crate::{
    curve::{challenge, lift_x, parse_scalar, scalar_to_secret, secret_to_scalar},
    errors::EotsError,
    secp::EvenSecretKey,
};

/// Public randomness: the x coordinate of the nonce point.
pub type PubRand = [u8; 32];

/// An EOTS signature: the `s` part of a BIP340 signature.
pub type EotsSignature = [u8; 32];

/// The message a finality provider signs when voting for block `app_hash` at `height`.
pub fn msg_to_sign(height: u64, app_hash: &[u8]) -> [u8; 32] {
    Sha256::new()
        .chain_update(height.to_be_bytes())
        .chain_update(app_hash)
        .finalize()
        .into()
}

/// The public randomness committed for the secret randomness `sec_rand`.
pub fn pub_rand(sec_rand: &SecretKey) -> PubRand {
    let r = (ProjectivePoint::GENERATOR * secret_to_scalar(&EvenSecretKey::from(*sec_rand)))
        .to_affine();
    r.x().into()
}

/// Signs `msg` with the secret key and the committed secret randomness.
pub fn sign(sk: &SecretKey, sec_rand: &SecretKey, msg: &[u8; 32]) -> EotsSignature {
    let sk = EvenSecretKey::from(*sk);
    let k = secret_to_scalar(&EvenSecretKey::from(*sec_rand));
    let e = challenge(&pub_rand(sec_rand), &sk.xonly().serialize(), msg);

    (k + e * secret_to_scalar(&sk)).to_bytes().into()
}

/// Verifies an EOTS signature.
pub fn verify(
    pk: &XOnlyPublicKey,
    pub_rand: &PubRand,
    msg: &[u8; 32],
    sig: &EotsSignature,
) -> bool {
    let (Some(p), Some(r), Some(s)) = (lift_x(&pk.serialize()), lift_x(pub_rand), parse_scalar(sig))
    else {
        return false;
    };

    let e = challenge(pub_rand, &pk.serialize(), msg);
    ProjectivePoint::GENERATOR * s - p * e == r
}

/// Extracts the secret key of `pk` from two signatures over different messages that share the
/// same public randomness.
pub fn extract(
    pk: &XOnlyPublicKey,
    pub_rand: &PubRand,
    msg1: &[u8; 32],
    sig1: &EotsSignature,
    msg2: &[u8; 32],
    sig2: &EotsSignature,
) -> Result<EvenSecretKey, EotsError> {
    if lift_x(pub_rand).is_none() {
        return Err(EotsError::InvalidPubRand);
    }

    let s1 = parse_scalar(sig1).ok_or(EotsError::InvalidSignature)?;
    let s2 = parse_scalar(sig2).ok_or(EotsError::InvalidSignature)?;

    let p_x = pk.serialize();
    let e_delta = challenge(pub_rand, &p_x, msg1) - challenge(pub_rand, &p_x, msg2);
    let inverted = Option::<Scalar>::from(e_delta.invert()).ok_or(EotsError::SameMessage)?;

    let sk = scalar_to_secret(&((s1 - s2) * inverted)).ok_or(EotsError::KeyMismatch)?;
    let sk = EvenSecretKey::from(sk);
    if sk.xonly() != *pk {
        return Err(EotsError::KeyMismatch);
    }

    Ok(sk)
}

#[cfg(test)]
mod tests {
    use secp256k1::{rand::rngs::OsRng, SECP256K1};

    use super::*;

    #[test]
    fn sign_verify_extract() {
        let sk = SecretKey::new(&mut OsRng);
        let sec_rand = SecretKey::new(&mut OsRng);
        let pk = sk.x_only_public_key(SECP256K1).0;
        let pr = pub_rand(&sec_rand);

        let msg1 = msg_to_sign(42, b"canonical");
        let msg2 = msg_to_sign(42, b"fork");
        let sig1 = sign(&sk, &sec_rand, &msg1);
        let sig2 = sign(&sk, &sec_rand, &msg2);

        assert!(verify(&pk, &pr, &msg1, &sig1));
        assert!(verify(&pk, &pr, &msg2, &sig2));
        assert!(!verify(&pk, &pr, &msg2, &sig1));

        let extracted = extract(&pk, &pr, &msg1, &sig1, &msg2, &sig2).unwrap();
        assert_eq!(*extracted, *EvenSecretKey::from(sk));
    }

    #[test]
    fn same_message_is_rejected() {
        let sk = SecretKey::new(&mut OsRng);
        let sec_rand = SecretKey::new(&mut OsRng);
        let pk = sk.x_only_public_key(SECP256K1).0;
        let msg = msg_to_sign(7, b"block");
        let sig = sign(&sk, &sec_rand, &msg);

        assert_eq!(
            extract(&pk, &pub_rand(&sec_rand), &msg, &sig, &msg, &sig),
            Err(EotsError::SameMessage)
        );
    }

    #[test]
    fn different_randomness_does_not_leak_key() {
        let sk = SecretKey::new(&mut OsRng);
        let pk = sk.x_only_public_key(SECP256K1).0;
        let r1 = SecretKey::new(&mut OsRng);
        let r2 = SecretKey::new(&mut OsRng);
        let msg1 = msg_to_sign(9, b"a");
        let msg2 = msg_to_sign(9, b"b");

        let res = extract(
            &pk,
            &pub_rand(&r1),
            &msg1,
            &sign(&sk, &r1, &msg1),
            &msg2,
            &sign(&sk, &r2, &msg2),
        );
        assert_eq!(res, Err(EotsError::KeyMismatch));
    }
}
