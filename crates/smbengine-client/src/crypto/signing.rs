//! Message signatures over serialized messages.

use aes::Aes128;
use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::aead::{AeadInPlace, KeyInit};
use aes_gcm::Aes128Gcm;
use cmac::Cmac;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use smbengine_codec::{Command, Dialect, HeaderFlags, HEADER_SIZE, SIGNATURE_OFFSET};

use super::{constant_time_eq, SecretKey};
use crate::error::{ClientError, Result};

/// Size of the header signature field.
pub const SIGNATURE_SIZE: usize = 16;

const FLAGS_OFFSET: usize = 16;
const COMMAND_OFFSET: usize = 12;
const MESSAGE_ID_OFFSET: usize = 24;

/// MAC used to sign messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum SigningAlgorithm {
    /// HMAC-SHA256, for 2.x dialects.
    HmacSha256 = 0x0000,
    /// AES-CMAC, the 3.x default.
    AesCmac = 0x0001,
    /// AES-GMAC, negotiated on 3.1.1.
    AesGmac = 0x0002,
}

impl SigningAlgorithm {
    /// The algorithm for a wire identifier, if supported.
    pub fn from_wire(id: u16) -> Option<Self> {
        match id {
            0x0000 => Some(SigningAlgorithm::HmacSha256),
            0x0001 => Some(SigningAlgorithm::AesCmac),
            0x0002 => Some(SigningAlgorithm::AesGmac),
            _ => None,
        }
    }

    /// Algorithm implied by the dialect when no signing context was exchanged.
    pub fn default_for(dialect: Dialect) -> Self {
        if dialect.is_smb3() {
            SigningAlgorithm::AesCmac
        } else {
            SigningAlgorithm::HmacSha256
        }
    }
}

/// A signing key bound to its algorithm.
#[derive(Debug, Clone)]
pub struct Signer {
    algorithm: SigningAlgorithm,
    key: SecretKey,
}

impl Signer {
    /// A signer using `algorithm` keyed with `key`.
    pub fn new(algorithm: SigningAlgorithm, key: SecretKey) -> Self {
        Self { algorithm, key }
    }

    /// The signing algorithm.
    pub fn algorithm(&self) -> SigningAlgorithm {
        self.algorithm
    }

    /// MAC over `message`, which must already have a zeroed signature field.
    fn mac(&self, message: &[u8]) -> Result<[u8; SIGNATURE_SIZE]> {
        let mut out = [0u8; SIGNATURE_SIZE];
        match self.algorithm {
            SigningAlgorithm::HmacSha256 => {
                let mut mac =
                    <Hmac<Sha256> as Mac>::new_from_slice(self.key.as_bytes()).map_err(ClientError::crypto)?;
                mac.update(message);
                out.copy_from_slice(&mac.finalize().into_bytes()[..SIGNATURE_SIZE]);
            }
            SigningAlgorithm::AesCmac => {
                let mut mac = <Cmac<Aes128> as Mac>::new_from_slice(self.key.resized(16).as_bytes())
                    .map_err(ClientError::crypto)?;
                mac.update(message);
                out.copy_from_slice(&mac.finalize().into_bytes());
            }
            SigningAlgorithm::AesGmac => {
                let cipher = Aes128Gcm::new_from_slice(self.key.resized(16).as_bytes()).map_err(ClientError::crypto)?;
                let nonce = gmac_nonce(message);
                let mut empty: [u8; 0] = [];
                let tag = cipher
                    .encrypt_in_place_detached(GenericArray::from_slice(&nonce), message, &mut empty)
                    .map_err(ClientError::crypto)?;
                out.copy_from_slice(tag.as_slice());
            }
        }
        Ok(out)
    }

    /// Zeroes the signature field, computes the signature and writes it back.
    pub fn sign(&self, message: &mut [u8]) -> Result<[u8; SIGNATURE_SIZE]> {
        check_len(message)?;
        message[SIGNATURE_OFFSET..SIGNATURE_OFFSET + SIGNATURE_SIZE].fill(0);
        let signature = self.mac(message)?;
        message[SIGNATURE_OFFSET..SIGNATURE_OFFSET + SIGNATURE_SIZE].copy_from_slice(&signature);
        Ok(signature)
    }

    /// Recomputes the signature of a received message and compares it.
    pub fn verify(&self, message: &[u8]) -> Result<bool> {
        check_len(message)?;
        let mut copy = message.to_vec();
        let received: [u8; SIGNATURE_SIZE] = {
            let mut sig = [0u8; SIGNATURE_SIZE];
            sig.copy_from_slice(&message[SIGNATURE_OFFSET..SIGNATURE_OFFSET + SIGNATURE_SIZE]);
            sig
        };
        copy[SIGNATURE_OFFSET..SIGNATURE_OFFSET + SIGNATURE_SIZE].fill(0);
        let expected = self.mac(&copy)?;
        Ok(constant_time_eq(&expected, &received))
    }
}

fn check_len(message: &[u8]) -> Result<()> {
    if message.len() < HEADER_SIZE {
        return Err(ClientError::bad_packet(format!(
            "{} bytes is too short to sign",
            message.len()
        )));
    }
    Ok(())
}

/// GMAC nonce: message id, then a word with bit 0 set for responses and
/// bit 1 set for cancel requests.
fn gmac_nonce(message: &[u8]) -> [u8; 12] {
    let mut nonce = [0u8; 12];
    nonce[..8].copy_from_slice(&message[MESSAGE_ID_OFFSET..MESSAGE_ID_OFFSET + 8]);
    let flags = u32::from_le_bytes([
        message[FLAGS_OFFSET],
        message[FLAGS_OFFSET + 1],
        message[FLAGS_OFFSET + 2],
        message[FLAGS_OFFSET + 3],
    ]);
    let command = u16::from_le_bytes([message[COMMAND_OFFSET], message[COMMAND_OFFSET + 1]]);
    let mut role = 0u32;
    if flags & HeaderFlags::SERVER_TO_REDIR != 0 {
        role |= 1;
    }
    if command == Command::Cancel as u16 {
        role |= 2;
    }
    nonce[8..].copy_from_slice(&role.to_le_bytes());
    nonce
}

#[cfg(test)]
mod tests {
    use super::*;
    use smbengine_codec::{Body, ByteBuffer, PlainMessage};

    fn echo_bytes(message_id: u64) -> Vec<u8> {
        let mut message = PlainMessage::request(Body::EchoRequest).unwrap();
        message.header.message_id = message_id;
        message.header.flags.set(HeaderFlags::SIGNED, true);
        let mut buf = ByteBuffer::new();
        message.encode(&mut buf, None).unwrap();
        buf.into_vec()
    }

    #[test]
    fn test_sign_then_verify_each_algorithm() {
        for algorithm in [
            SigningAlgorithm::HmacSha256,
            SigningAlgorithm::AesCmac,
            SigningAlgorithm::AesGmac,
        ] {
            let signer = Signer::new(algorithm, SecretKey::new(vec![0x11; 16]));
            let mut bytes = echo_bytes(5);
            let signature = signer.sign(&mut bytes).unwrap();
            assert_eq!(&bytes[SIGNATURE_OFFSET..SIGNATURE_OFFSET + 16], &signature);
            assert!(signer.verify(&bytes).unwrap(), "{algorithm:?}");
            bytes[HEADER_SIZE] ^= 0xFF;
            assert!(!signer.verify(&bytes).unwrap(), "{algorithm:?}");
        }
    }

    #[test]
    fn test_wrong_key_fails() {
        let mut bytes = echo_bytes(1);
        Signer::new(SigningAlgorithm::AesCmac, SecretKey::new(vec![1; 16]))
            .sign(&mut bytes)
            .unwrap();
        let other = Signer::new(SigningAlgorithm::AesCmac, SecretKey::new(vec![2; 16]));
        assert!(!other.verify(&bytes).unwrap());
    }

    #[test]
    fn test_gmac_nonce_binds_message_id() {
        let signer = Signer::new(SigningAlgorithm::AesGmac, SecretKey::new(vec![3; 16]));
        let mut a = echo_bytes(1);
        let mut b = echo_bytes(2);
        let sa = signer.sign(&mut a).unwrap();
        let sb = signer.sign(&mut b).unwrap();
        assert_ne!(sa, sb);
        assert_eq!(&gmac_nonce(&a)[..8], &1u64.to_le_bytes());
    }

    #[test]
    fn test_short_message_rejected() {
        let signer = Signer::new(SigningAlgorithm::HmacSha256, SecretKey::new(vec![0; 16]));
        assert!(signer.verify(&[0; 10]).is_err());
    }
}
