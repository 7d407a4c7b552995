//! SP800-108 counter-mode KDF with HMAC-SHA256 as the PRF.

use hmac::{Hmac, Mac};
use sha2::Sha256;

use super::SecretKey;
use crate::error::{ClientError, Result};

type HmacSha256 = Hmac<Sha256>;

/// Derives a `bits`-long key from `key`, `label` and `context`.
///
/// Each PRF block is `HMAC(key, i || label || 0x00 || context || L)` with a
/// 32-bit big-endian counter `i` starting at 1 and `L = bits`.
pub fn derive_key(key: &[u8], label: &[u8], context: &[u8], bits: u32) -> Result<SecretKey> {
    if bits == 0 || bits % 8 != 0 {
        return Err(ClientError::crypto(format!("cannot derive a {bits}-bit key")));
    }
    let len = (bits / 8) as usize;
    let mut out = Vec::with_capacity(len.next_multiple_of(32));
    let mut counter: u32 = 1;
    while out.len() < len {
        let mut prf = <HmacSha256 as Mac>::new_from_slice(key).map_err(ClientError::crypto)?;
        prf.update(&counter.to_be_bytes());
        prf.update(label);
        prf.update(&[0]);
        prf.update(context);
        prf.update(&bits.to_be_bytes());
        out.extend_from_slice(&prf.finalize().into_bytes());
        counter += 1;
    }
    out.truncate(len);
    Ok(SecretKey::new(out))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deterministic() {
        let a = derive_key(&[7; 16], b"SMBSigningKey\0", &[1; 64], 128).unwrap();
        let b = derive_key(&[7; 16], b"SMBSigningKey\0", &[1; 64], 128).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 16);
    }

    #[test]
    fn test_inputs_separate_outputs() {
        let base = derive_key(&[7; 16], b"A\0", b"ctx", 128).unwrap();
        assert_ne!(base, derive_key(&[8; 16], b"A\0", b"ctx", 128).unwrap());
        assert_ne!(base, derive_key(&[7; 16], b"B\0", b"ctx", 128).unwrap());
        assert_ne!(base, derive_key(&[7; 16], b"A\0", b"ctY", 128).unwrap());
    }

    #[test]
    fn test_length_is_bound_into_output() {
        let short = derive_key(&[3; 16], b"L\0", b"c", 128).unwrap();
        let long = derive_key(&[3; 16], b"L\0", b"c", 256).unwrap();
        assert_eq!(long.len(), 32);
        assert_ne!(&long.as_bytes()[..16], short.as_bytes());
    }

    #[test]
    fn test_rejects_partial_bytes() {
        assert!(derive_key(&[0; 16], b"x", b"y", 12).is_err());
        assert!(derive_key(&[0; 16], b"x", b"y", 0).is_err());
    }
}
