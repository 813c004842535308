//! BIP340 Schnorr adaptor signatures.
//!
//! An adaptor signature is a Schnorr signature encrypted under an encryption key `T = t*G`.
//! Whoever knows `t` can decrypt it into an ordinary BIP340 signature, and whoever holds both the
//! adaptor signature and its decryption learns `t`. Covenant signers hand out their slashing
//! signatures encrypted under the finality provider's key, so a slashing transaction can only be
//! completed with that provider's secret key, and completing it leaks the key.
//!
//! Encoding: `R (33 bytes, compressed) || s_hat (32 bytes) || needs_negation (1 byte)`.

use k256::{
    elliptic_curve::{
        point::{AffineCoordinates, DecompressPoint},
        sec1::ToEncodedPoint,
        subtle::Choice,
    },
    AffinePoint, FieldBytes, ProjectivePoint, Scalar,
};
use secp256k1::{rand::rngs::OsRng, schnorr, Parity, SecretKey, XOnlyPublicKey, SECP256K1};

use crate::{
    constants::{
        ADAPTOR_SIGNATURE_SIZE, COMPRESSED_POINT_SIZE, MODN_SCALAR_SIZE, SCHNORR_SIGNATURE_SIZE,
    },
    curve::{challenge, parse_scalar, scalar_to_secret, secret_to_scalar, xonly_to_point},
    errors::AdaptorSigError,
    secp::EvenSecretKey,
};

/// A Schnorr adaptor signature `(R, s_hat, needs_negation)`.
#[derive(Debug, Clone, Copy)]
pub struct AdaptorSignature {
    r: ProjectivePoint,
    s_hat: Scalar,
    needs_negation: bool,
}

impl PartialEq for AdaptorSignature {
    fn eq(&self, other: &Self) -> bool {
        self.to_bytes() == other.to_bytes()
    }
}

impl Eq for AdaptorSignature {}

impl AdaptorSignature {
    /// Parses the 66-byte encoding.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, AdaptorSigError> {
        if bytes.len() != ADAPTOR_SIGNATURE_SIZE {
            return Err(AdaptorSigError::InvalidLength {
                expected: ADAPTOR_SIGNATURE_SIZE,
                got: bytes.len(),
            });
        }

        let prefix = bytes[0];
        if prefix != 0x02 && prefix != 0x03 {
            return Err(AdaptorSigError::InvalidPrefix(prefix));
        }

        let r = Option::<AffinePoint>::from(AffinePoint::decompress(
            FieldBytes::from_slice(&bytes[1..COMPRESSED_POINT_SIZE]),
            Choice::from((prefix == 0x03) as u8),
        ))
        .ok_or(AdaptorSigError::InvalidPoint)?;

        let s_hat = parse_scalar(
            &bytes[COMPRESSED_POINT_SIZE..COMPRESSED_POINT_SIZE + MODN_SCALAR_SIZE],
        )
        .ok_or(AdaptorSigError::InvalidScalar)?;

        let needs_negation = bytes[ADAPTOR_SIGNATURE_SIZE - 1] == 0x01;

        Ok(Self {
            r: r.into(),
            s_hat,
            needs_negation,
        })
    }

    /// Serializes into the 66-byte encoding.
    pub fn to_bytes(&self) -> [u8; ADAPTOR_SIGNATURE_SIZE] {
        let mut out = [0u8; ADAPTOR_SIGNATURE_SIZE];
        let encoded = self.r.to_affine().to_encoded_point(true);
        // R is never the identity: both constructors reject it.
        if encoded.as_bytes().len() == COMPRESSED_POINT_SIZE {
            out[..COMPRESSED_POINT_SIZE].copy_from_slice(encoded.as_bytes());
        }
        out[COMPRESSED_POINT_SIZE..COMPRESSED_POINT_SIZE + MODN_SCALAR_SIZE]
            .copy_from_slice(&self.s_hat.to_bytes());
        out[ADAPTOR_SIGNATURE_SIZE - 1] = self.needs_negation as u8;
        out
    }

    /// Produces an adaptor signature over `msg` by `sk`, encrypted under `enc_key`.
    pub fn enc_sign(
        sk: &SecretKey,
        enc_key: &XOnlyPublicKey,
        msg: &[u8; 32],
    ) -> Result<Self, AdaptorSigError> {
        let nonce = SecretKey::new(&mut OsRng);
        Self::enc_sign_with_nonce(sk, &nonce, enc_key, msg)
    }

    fn enc_sign_with_nonce(
        sk: &SecretKey,
        nonce: &SecretKey,
        enc_key: &XOnlyPublicKey,
        msg: &[u8; 32],
    ) -> Result<Self, AdaptorSigError> {
        let (p_x, parity) = sk.x_only_public_key(SECP256K1);
        let d = match parity {
            Parity::Odd => -secret_to_scalar(sk),
            Parity::Even => secret_to_scalar(sk),
        };
        let t = xonly_to_point(enc_key).ok_or(AdaptorSigError::InvalidPoint)?;

        let mut k = secret_to_scalar(nonce);
        let mut r = ProjectivePoint::GENERATOR * k + t;
        if r == ProjectivePoint::IDENTITY {
            return Err(AdaptorSigError::PointAtInfinity("R"));
        }

        let needs_negation = bool::from(r.to_affine().y_is_odd());
        if needs_negation {
            k = -k;
            r = -r;
        }

        let e = challenge(&r.to_affine().x(), &p_x.serialize(), msg);

        Ok(Self {
            r,
            s_hat: k + e * d,
            needs_negation,
        })
    }

    /// Verifies the adaptor signature against the signer key `pk`, the encryption key and the
    /// message.
    pub fn verify(
        &self,
        pk: &XOnlyPublicKey,
        enc_key: &XOnlyPublicKey,
        msg: &[u8; 32],
    ) -> Result<(), AdaptorSigError> {
        let p = xonly_to_point(pk).ok_or(AdaptorSigError::InvalidPoint)?;
        let t = xonly_to_point(enc_key).ok_or(AdaptorSigError::InvalidPoint)?;

        let r = self.r.to_affine();
        if bool::from(r.y_is_odd()) {
            return Err(AdaptorSigError::OddNonce);
        }

        let r_hat = match self.needs_negation {
            true => self.r + t,
            false => self.r - t,
        };

        let e = challenge(&r.x(), &pk.serialize(), msg);
        let expected_r_hat = ProjectivePoint::GENERATOR * self.s_hat - p * e;

        if expected_r_hat == ProjectivePoint::IDENTITY {
            return Err(AdaptorSigError::PointAtInfinity("expected R'"));
        }

        if r_hat != expected_r_hat {
            return Err(AdaptorSigError::VerificationFailed);
        }

        Ok(())
    }

    /// Decrypts into an ordinary BIP340 signature using the decryption key.
    pub fn decrypt(&self, dk: &SecretKey) -> Result<schnorr::Signature, AdaptorSigError> {
        let t = secret_to_scalar(&EvenSecretKey::from(*dk));
        let s = match self.needs_negation {
            true => self.s_hat - t,
            false => self.s_hat + t,
        };

        let mut sig = [0u8; SCHNORR_SIGNATURE_SIZE];
        sig[..32].copy_from_slice(&self.r.to_affine().x());
        sig[32..].copy_from_slice(&s.to_bytes());

        schnorr::Signature::from_slice(&sig)
            .map_err(|e| AdaptorSigError::InvalidSignature(e.to_string()))
    }

    /// Recovers the decryption key from a revealed signature produced by [`Self::decrypt`].
    ///
    /// The recovered key is only returned if its public key is `enc_key`.
    pub fn extract(
        &self,
        sig: &schnorr::Signature,
        enc_key: &XOnlyPublicKey,
    ) -> Result<EvenSecretKey, AdaptorSigError> {
        let sig = sig.serialize();

        if sig[..32] != self.r.to_affine().x()[..] {
            return Err(AdaptorSigError::NonceMismatch);
        }

        let s = parse_scalar(&sig[32..]).ok_or(AdaptorSigError::InvalidScalar)?;
        let t = match self.needs_negation {
            true => self.s_hat - s,
            false => s - self.s_hat,
        };

        let sk = scalar_to_secret(&t).ok_or(AdaptorSigError::KeyMismatch)?;
        let sk = EvenSecretKey::from(sk);
        if sk.xonly() != *enc_key {
            return Err(AdaptorSigError::KeyMismatch);
        }

        Ok(sk)
    }
}
