//! The SHA-512 pre-authentication integrity transcript.

use sha2::{Digest, Sha512};

/// Size of the SHA-512 transcript value.
pub const PREAUTH_HASH_SIZE: usize = 64;

/// Running transcript hash: `H = SHA512(H || message)` from an all-zero start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreauthHash {
    /// The dialect does not bind keys to a transcript; updates are ignored.
    Unsupported,
    /// Hash over every message folded in so far.
    InProgress([u8; PREAUTH_HASH_SIZE]),
}

impl PreauthHash {
    /// A transcript at its all-zero starting value.
    pub fn begin() -> Self {
        PreauthHash::InProgress([0; PREAUTH_HASH_SIZE])
    }

    /// Folds the exact bytes of one exchanged message into the transcript.
    pub fn update(&mut self, message: &[u8]) {
        if let PreauthHash::InProgress(hash) = self {
            let mut hasher = Sha512::new();
            hasher.update(&hash[..]);
            hasher.update(message);
            hash.copy_from_slice(&hasher.finalize());
        }
    }

    /// The current hash, unless unsupported.
    pub fn value(&self) -> Option<&[u8; PREAUTH_HASH_SIZE]> {
        match self {
            PreauthHash::InProgress(hash) => Some(hash),
            PreauthHash::Unsupported => None,
        }
    }
}
