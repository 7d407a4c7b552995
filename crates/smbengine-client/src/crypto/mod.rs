//! Key derivation, message signing, the encryption transform and the
//! pre-authentication transcript.

pub mod cipher;
pub mod kdf;
pub mod keys;
pub mod preauth;
pub mod signing;
pub mod transform;

use std::fmt;

use zeroize::{Zeroize, ZeroizeOnDrop};

pub use cipher::{Aead, CipherId};
pub use kdf::derive_key;
pub use keys::{derive_session_keys, derive_signing_key, SessionKeys};
pub use preauth::{PreauthHash, PREAUTH_HASH_SIZE};
pub use signing::{Signer, SigningAlgorithm};
pub use transform::EncryptionContext;

/// Key material, wiped on drop.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct SecretKey(Vec<u8>);

impl SecretKey {
    /// Wraps key bytes.
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    /// The raw key bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Key length in bytes.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether no lease is held.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The first `n` bytes, zero-extended when the key is shorter.
    pub fn resized(&self, n: usize) -> SecretKey {
        let mut out = vec![0u8; n];
        let take = n.min(self.0.len());
        out[..take].copy_from_slice(&self.0[..take]);
        SecretKey(out)
    }
}

impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecretKey([REDACTED; {}])", self.0.len())
    }
}

/// Compares two byte strings without an early exit.
pub(crate) fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
