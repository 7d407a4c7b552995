//! Sealing and opening transform envelopes.

use rand::RngCore;
use smbengine_codec::{encode_envelope, TransformHeader};

use super::{Aead, CipherId, SecretKey, SessionKeys};
use crate::error::{ClientError, Result};

/// Session-wide encryption state, shared read-only by every channel.
#[derive(Debug)]
pub struct EncryptionContext {
    cipher: CipherId,
    encryptor: Aead,
    decryptor: Aead,
}

impl EncryptionContext {
    /// `encrypt_key` seals outgoing envelopes, `decrypt_key` opens incoming ones.
    pub fn new(cipher: CipherId, encrypt_key: &SecretKey, decrypt_key: &SecretKey) -> Result<Self> {
        Ok(Self {
            cipher,
            encryptor: Aead::new(cipher, encrypt_key.as_bytes())?,
            decryptor: Aead::new(cipher, decrypt_key.as_bytes())?,
        })
    }

    /// Client-side context from a derived key schedule.
    pub fn for_session(cipher: CipherId, keys: &SessionKeys) -> Result<Self> {
        match (&keys.encryption, &keys.decryption) {
            (Some(enc), Some(dec)) => Self::new(cipher, enc, dec),
            _ => Err(ClientError::state("session keys carry no encryption keys")),
        }
    }

    /// The cipher in use.
    pub fn cipher(&self) -> CipherId {
        self.cipher
    }

    /// Wraps one or more serialized messages in a single envelope.
    pub fn seal(&self, session_id: u64, plaintext: &[u8]) -> Result<Vec<u8>> {
        let mut nonce = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut nonce[..self.cipher.nonce_len()]);
        let size = u32::try_from(plaintext.len())
            .map_err(|_| ClientError::request(format!("{} bytes is too large to encrypt", plaintext.len())))?;
        let mut header = TransformHeader::new(nonce, size, session_id);
        let aad = header.aad()?;
        let mut data = plaintext.to_vec();
        header.signature = self.encryptor.encrypt(&nonce, &aad, &mut data)?;
        Ok(encode_envelope(&header, &data)?)
    }

    /// Verifies and decrypts an envelope's payload.
    pub fn open(&self, header: &TransformHeader, ciphertext: &[u8]) -> Result<Vec<u8>> {
        let aad = header.aad()?;
        let mut data = ciphertext.to_vec();
        self.decryptor
            .decrypt(&header.nonce, &aad, &mut data, &header.signature)?;
        Ok(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use smbengine_codec::{Envelope, TRANSFORM_HEADER_SIZE};

    fn pair(cipher: CipherId) -> (EncryptionContext, EncryptionContext) {
        let c2s = SecretKey::new(vec![1; cipher.key_len()]);
        let s2c = SecretKey::new(vec![2; cipher.key_len()]);
        (
            EncryptionContext::new(cipher, &c2s, &s2c).unwrap(),
            EncryptionContext::new(cipher, &s2c, &c2s).unwrap(),
        )
    }

    #[test]
    fn test_client_seals_server_opens() {
        for cipher in [CipherId::Aes128Ccm, CipherId::Aes256Gcm] {
            let (client, server) = pair(cipher);
            let sealed = client.seal(0x44, b"two compounded messages").unwrap();
            assert_eq!(sealed.len(), TRANSFORM_HEADER_SIZE + 23);
            let Envelope::Encrypted { header, ciphertext } = Envelope::parse(&sealed).unwrap() else {
                panic!("expected an encrypted envelope");
            };
            assert_eq!(header.session_id, 0x44);
            assert!(header.nonce[cipher.nonce_len()..].iter().all(|b| *b == 0));
            assert_eq!(server.open(&header, ciphertext).unwrap(), b"two compounded messages");
        }
    }

    #[test]
    fn test_tampered_session_id_fails() {
        let (client, server) = pair(CipherId::Aes128Gcm);
        let sealed = client.seal(1, b"payload").unwrap();
        let Envelope::Encrypted { mut header, ciphertext } = Envelope::parse(&sealed).unwrap() else {
            panic!("expected an encrypted envelope");
        };
        header.session_id = 2;
        assert!(server.open(&header, ciphertext).is_err());
    }
}
