//! Per-session key schedule, chosen by dialect.

use smbengine_codec::Dialect;

use super::{derive_key, CipherId, PreauthHash, SecretKey};
use crate::error::{ClientError, Result};

const SIGNING_30: (&[u8], &[u8]) = (b"SMB2AESCMAC\0", b"SmbSign\0");
const C2S_30: (&[u8], &[u8]) = (b"SMB2AESCCM\0", b"ServerIn \0");
const S2C_30: (&[u8], &[u8]) = (b"SMB2AESCCM\0", b"ServerOut\0");
const APP_30: (&[u8], &[u8]) = (b"SMB2APP\0", b"SmbRpc\0");

const SIGNING_311: &[u8] = b"SMBSigningKey\0";
const C2S_311: &[u8] = b"SMBC2SCipherKey\0";
const S2C_311: &[u8] = b"SMBS2CCipherKey\0";
const APP_311: &[u8] = b"SMBAppKey\0";

/// Keys derived once a session is authenticated.
#[derive(Debug, Clone)]
pub struct SessionKeys {
    /// Key for signing this channel's messages.
    pub signing: SecretKey,
    /// Client-to-server encryption key, when the dialect encrypts.
    pub encryption: Option<SecretKey>,
    /// Server-to-client decryption key.
    pub decryption: Option<SecretKey>,
    /// Key exported to the application layer.
    pub application: SecretKey,
}

/// Signing key for one channel. 3.1.1 binds it to that channel's transcript;
/// earlier 3.x dialects use fixed labels; 2.x signs with the session key.
pub fn derive_signing_key(dialect: Dialect, session_key: &SecretKey, transcript: &PreauthHash) -> Result<SecretKey> {
    let key = session_key.resized(16);
    if !dialect.is_smb3() {
        return Ok(key);
    }
    if dialect.uses_preauth_integrity() {
        let context = transcript
            .value()
            .ok_or_else(|| ClientError::state("3.1.1 signing key needs a pre-authentication transcript"))?;
        return derive_key(key.as_bytes(), SIGNING_311, context, 128);
    }
    derive_key(key.as_bytes(), SIGNING_30.0, SIGNING_30.1, 128)
}

/// Full key schedule for a newly authenticated session.
pub fn derive_session_keys(
    dialect: Dialect,
    session_key: &SecretKey,
    transcript: &PreauthHash,
    cipher: Option<CipherId>,
) -> Result<SessionKeys> {
    let signing = derive_signing_key(dialect, session_key, transcript)?;
    if !dialect.is_smb3() {
        return Ok(SessionKeys {
            signing,
            encryption: None,
            decryption: None,
            application: session_key.resized(16),
        });
    }
    let bits = match cipher {
        Some(CipherId::Aes256Ccm | CipherId::Aes256Gcm) => 256,
        _ => 128,
    };
    // 256-bit ciphers derive from the full session key, 128-bit ones from its first half.
    let base = if bits == 256 {
        session_key.clone()
    } else {
        session_key.resized(16)
    };
    let (encryption, decryption, application) = if dialect.uses_preauth_integrity() {
        let context = transcript
            .value()
            .ok_or_else(|| ClientError::state("3.1.1 keys need a pre-authentication transcript"))?;
        (
            derive_key(base.as_bytes(), C2S_311, context, bits)?,
            derive_key(base.as_bytes(), S2C_311, context, bits)?,
            derive_key(session_key.resized(16).as_bytes(), APP_311, context, 128)?,
        )
    } else {
        (
            derive_key(base.as_bytes(), C2S_30.0, C2S_30.1, bits)?,
            derive_key(base.as_bytes(), S2C_30.0, S2C_30.1, bits)?,
            derive_key(session_key.resized(16).as_bytes(), APP_30.0, APP_30.1, 128)?,
        )
    };
    let encrypting = cipher.is_some();
    Ok(SessionKeys {
        signing,
        encryption: encrypting.then_some(encryption),
        decryption: encrypting.then_some(decryption),
        application,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transcript(seed: &[u8]) -> PreauthHash {
        let mut h = PreauthHash::begin();
        h.update(seed);
        h
    }

    #[test]
    fn test_smb2_signs_with_session_key() {
        let session_key = SecretKey::new(vec![9; 16]);
        let keys = derive_session_keys(Dialect::Smb210, &session_key, &PreauthHash::Unsupported, None).unwrap();
        assert_eq!(keys.signing, session_key);
        assert!(keys.encryption.is_none());
    }

    #[test]
    fn test_smb30_ignores_transcript() {
        let session_key = SecretKey::new(vec![4; 16]);
        let a = derive_signing_key(Dialect::Smb300, &session_key, &transcript(b"a")).unwrap();
        let b = derive_signing_key(Dialect::Smb300, &session_key, &transcript(b"b")).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, session_key);
    }

    #[test]
    fn test_smb311_binds_transcript() {
        let session_key = SecretKey::new(vec![4; 16]);
        let a = derive_signing_key(Dialect::Smb311, &session_key, &transcript(b"a")).unwrap();
        let b = derive_signing_key(Dialect::Smb311, &session_key, &transcript(b"b")).unwrap();
        assert_ne!(a, b);
        assert!(derive_signing_key(Dialect::Smb311, &session_key, &PreauthHash::Unsupported).is_err());
    }

    #[test]
    fn test_directional_keys_differ_and_size_follows_cipher() {
        let session_key = SecretKey::new(vec![6; 32]);
        let keys = derive_session_keys(
            Dialect::Smb311,
            &session_key,
            &transcript(b"t"),
            Some(CipherId::Aes256Gcm),
        )
        .unwrap();
        let enc = keys.encryption.unwrap();
        let dec = keys.decryption.unwrap();
        assert_eq!(enc.len(), 32);
        assert_ne!(enc, dec);
        assert_eq!(keys.signing.len(), 16);

        let keys = derive_session_keys(Dialect::Smb302, &session_key, &PreauthHash::Unsupported, Some(CipherId::Aes128Ccm))
            .unwrap();
        assert_eq!(keys.encryption.unwrap().len(), 16);
    }
}
