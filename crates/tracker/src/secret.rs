//! Lock-guarded storage for an extracted secret key.

use std::fmt;

use parking_lot::Mutex;
use secp256k1::SecretKey;

/// Owns a secret key shared by concurrent signing tasks.
///
/// The key is only reachable inside [`SecretKeyHolder::with_secret`], which runs under the lock,
/// so tasks use it one at a time and never hold their own copy. The key is erased on drop.
pub struct SecretKeyHolder {
    inner: Mutex<SecretKey>,
}

impl SecretKeyHolder {
    /// Takes ownership of `sk`.
    pub fn new(sk: SecretKey) -> Self {
        Self {
            inner: Mutex::new(sk),
        }
    }

    /// Runs `f` with exclusive access to the key.
    pub fn with_secret<R>(&self, f: impl FnOnce(&SecretKey) -> R) -> R {
        let guard = self.inner.lock();
        f(&guard)
    }
}

impl fmt::Debug for SecretKeyHolder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecretKeyHolder").finish_non_exhaustive()
    }
}

impl Drop for SecretKeyHolder {
    fn drop(&mut self) {
        self.inner.get_mut().non_secure_erase();
    }
}
