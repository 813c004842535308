//! SECP256K1 key helpers.

use std::ops::Deref;

use secp256k1::{Parity, SecretKey, XOnlyPublicKey, SECP256K1};

/// A secret key that is guaranteed to have an even x-only public key.
///
/// BIP340 signers, adaptor signatures and extracted keys all operate on the even-y
/// representative, so every key recovered by this crate is returned in this form.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EvenSecretKey(SecretKey);

impl EvenSecretKey {
    /// The x-only public key of this secret key.
    pub fn xonly(&self) -> XOnlyPublicKey {
        self.0.x_only_public_key(SECP256K1).0
    }

    /// Consumes the wrapper.
    pub fn into_inner(self) -> SecretKey {
        self.0
    }
}

impl Deref for EvenSecretKey {
    type Target = SecretKey;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl AsRef<SecretKey> for EvenSecretKey {
    fn as_ref(&self) -> &SecretKey {
        &self.0
    }
}

impl From<SecretKey> for EvenSecretKey {
    fn from(value: SecretKey) -> Self {
        match value.x_only_public_key(SECP256K1).1 == Parity::Odd {
            true => Self(value.negate()),
            false => Self(value),
        }
    }
}

impl From<EvenSecretKey> for SecretKey {
    fn from(value: EvenSecretKey) -> Self {
        value.0
    }
}
