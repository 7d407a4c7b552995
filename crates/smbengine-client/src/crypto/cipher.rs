//! The negotiated AEAD ciphers.

use std::fmt;

use aes::{Aes128, Aes256};
use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::aead::{AeadInPlace, KeyInit};
use aes_gcm::{Aes128Gcm, Aes256Gcm};
use ccm::consts::{U11, U16};
use ccm::Ccm;

use crate::error::{ClientError, Result};

type Aes128Ccm = Ccm<Aes128, U16, U11>;
type Aes256Ccm = Ccm<Aes256, U16, U11>;

/// AEAD tag length for every supported cipher.
pub const TAG_SIZE: usize = 16;

/// Cipher identifiers exchanged in the encryption negotiate context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum CipherId {
    /// AES-128-CCM.
    Aes128Ccm = 0x0001,
    /// AES-128-GCM.
    Aes128Gcm = 0x0002,
    /// AES-256-CCM.
    Aes256Ccm = 0x0003,
    /// AES-256-GCM.
    Aes256Gcm = 0x0004,
}

impl CipherId {
    /// The cipher for a wire identifier, if supported.
    pub fn from_wire(id: u16) -> Option<Self> {
        match id {
            0x0001 => Some(CipherId::Aes128Ccm),
            0x0002 => Some(CipherId::Aes128Gcm),
            0x0003 => Some(CipherId::Aes256Ccm),
            0x0004 => Some(CipherId::Aes256Gcm),
            _ => None,
        }
    }

    /// Nonce length used in the transform header.
    pub fn nonce_len(self) -> usize {
        match self {
            CipherId::Aes128Ccm | CipherId::Aes256Ccm => 11,
            CipherId::Aes128Gcm | CipherId::Aes256Gcm => 12,
        }
    }

    /// Key length in bytes.
    pub fn key_len(self) -> usize {
        match self {
            CipherId::Aes128Ccm | CipherId::Aes128Gcm => 16,
            CipherId::Aes256Ccm | CipherId::Aes256Gcm => 32,
        }
    }
}

impl fmt::Display for CipherId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CipherId::Aes128Ccm => "AES-128-CCM",
            CipherId::Aes128Gcm => "AES-128-GCM",
            CipherId::Aes256Ccm => "AES-256-CCM",
            CipherId::Aes256Gcm => "AES-256-GCM",
        };
        f.write_str(name)
    }
}

enum Engine {
    Aes128Ccm(Aes128Ccm),
    Aes128Gcm(Aes128Gcm),
    Aes256Ccm(Aes256Ccm),
    Aes256Gcm(Aes256Gcm),
}

/// A keyed AEAD instance with detached 16-byte tags.
pub struct Aead {
    id: CipherId,
    engine: Engine,
}

impl fmt::Debug for Aead {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Aead({})", self.id)
    }
}

impl Aead {
    /// A cipher instance keyed with `key`.
    pub fn new(id: CipherId, key: &[u8]) -> Result<Self> {
        if key.len() != id.key_len() {
            return Err(ClientError::crypto(format!(
                "{id} needs a {}-byte key, got {}",
                id.key_len(),
                key.len()
            )));
        }
        let engine = match id {
            CipherId::Aes128Ccm => Engine::Aes128Ccm(Aes128Ccm::new_from_slice(key).map_err(ClientError::crypto)?),
            CipherId::Aes128Gcm => Engine::Aes128Gcm(Aes128Gcm::new_from_slice(key).map_err(ClientError::crypto)?),
            CipherId::Aes256Ccm => Engine::Aes256Ccm(Aes256Ccm::new_from_slice(key).map_err(ClientError::crypto)?),
            CipherId::Aes256Gcm => Engine::Aes256Gcm(Aes256Gcm::new_from_slice(key).map_err(ClientError::crypto)?),
        };
        Ok(Self { id, engine })
    }

    /// Which cipher this instance runs.
    pub fn id(&self) -> CipherId {
        self.id
    }

    fn nonce<'n>(&self, nonce: &'n [u8]) -> Result<&'n [u8]> {
        nonce
            .get(..self.id.nonce_len())
            .ok_or_else(|| ClientError::crypto(format!("{} needs a {}-byte nonce", self.id, self.id.nonce_len())))
    }

    /// Encrypts `data` in place and returns the tag. Only the cipher's nonce
    /// length is taken from `nonce`.
    pub fn encrypt(&self, nonce: &[u8], aad: &[u8], data: &mut [u8]) -> Result<[u8; TAG_SIZE]> {
        let n = self.nonce(nonce)?;
        let tag = match &self.engine {
            Engine::Aes128Ccm(c) => c.encrypt_in_place_detached(GenericArray::from_slice(n), aad, data),
            Engine::Aes128Gcm(c) => c.encrypt_in_place_detached(GenericArray::from_slice(n), aad, data),
            Engine::Aes256Ccm(c) => c.encrypt_in_place_detached(GenericArray::from_slice(n), aad, data),
            Engine::Aes256Gcm(c) => c.encrypt_in_place_detached(GenericArray::from_slice(n), aad, data),
        }
        .map_err(ClientError::crypto)?;
        let mut out = [0u8; TAG_SIZE];
        out.copy_from_slice(tag.as_slice());
        Ok(out)
    }

    /// Verifies `tag` and decrypts `data` in place.
    pub fn decrypt(&self, nonce: &[u8], aad: &[u8], data: &mut [u8], tag: &[u8; TAG_SIZE]) -> Result<()> {
        let n = self.nonce(nonce)?;
        let tag = GenericArray::from_slice(tag);
        match &self.engine {
            Engine::Aes128Ccm(c) => c.decrypt_in_place_detached(GenericArray::from_slice(n), aad, data, tag),
            Engine::Aes128Gcm(c) => c.decrypt_in_place_detached(GenericArray::from_slice(n), aad, data, tag),
            Engine::Aes256Ccm(c) => c.decrypt_in_place_detached(GenericArray::from_slice(n), aad, data, tag),
            Engine::Aes256Gcm(c) => c.decrypt_in_place_detached(GenericArray::from_slice(n), aad, data, tag),
        }
        .map_err(|_| ClientError::crypto(format!("{} authentication failed", self.id)))
    }
}
