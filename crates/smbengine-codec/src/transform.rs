//! The 52-byte transform header wrapping encrypted messages.

use crate::cursor::{ByteBuffer, Position, ReadCursor, WriteCursor};
use crate::error::{CodecError, CodecResult};
use crate::frame::{Frame, FrameContext};
use crate::header::SMB2_MAGIC;
use crate::status::Status;

/// Protocol identifier of a transform envelope.
pub const TRANSFORM_MAGIC: [u8; 4] = [0xFD, b'S', b'M', b'B'];

/// Size of the transform header in bytes.
pub const TRANSFORM_HEADER_SIZE: usize = 52;

/// The authenticated portion of the header starts after magic and signature.
pub const TRANSFORM_AAD_OFFSET: usize = 20;

/// Transform flag: payload is encrypted.
pub const TRANSFORM_FLAG_ENCRYPTED: u16 = 0x0001;

/// Header preceding an encrypted payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransformHeader {
    /// AEAD authentication tag.
    pub signature: [u8; 16],
    /// Nonce; only the cipher's nonce length is meaningful, the rest is zero.
    pub nonce: [u8; 16],
    /// Length of the plaintext payload.
    pub original_message_size: u32,
    /// Transform flags.
    pub flags: u16,
    /// Session whose keys protect the payload.
    pub session_id: u64,
}

impl TransformHeader {
    /// A header for an `original_message_size`-byte payload, signature still zero.
    pub fn new(nonce: [u8; 16], original_message_size: u32, session_id: u64) -> Self {
        Self {
            signature: [0; 16],
            nonce,
            original_message_size,
            flags: TRANSFORM_FLAG_ENCRYPTED,
            session_id,
        }
    }

    /// Serializes the header into a fresh 52-byte array.
    pub fn to_bytes(&self) -> CodecResult<[u8; TRANSFORM_HEADER_SIZE]> {
        let mut buf = ByteBuffer::with_capacity(TRANSFORM_HEADER_SIZE);
        self.encode(&mut WriteCursor::new(&mut buf), &FrameContext::request(Position(0)))?;
        let mut out = [0u8; TRANSFORM_HEADER_SIZE];
        out.copy_from_slice(buf.as_slice());
        Ok(out)
    }

    /// Additional authenticated data: header bytes 20..52.
    pub fn aad(&self) -> CodecResult<[u8; TRANSFORM_HEADER_SIZE - TRANSFORM_AAD_OFFSET]> {
        let bytes = self.to_bytes()?;
        let mut aad = [0u8; TRANSFORM_HEADER_SIZE - TRANSFORM_AAD_OFFSET];
        aad.copy_from_slice(&bytes[TRANSFORM_AAD_OFFSET..]);
        Ok(aad)
    }
}

impl Frame for TransformHeader {
    fn encode_body(&self, cursor: &mut WriteCursor<'_>, _ctx: &FrameContext) -> CodecResult<()> {
        cursor.encode_bytes(&TRANSFORM_MAGIC)?;
        cursor.encode_bytes(&self.signature)?;
        cursor.encode_bytes(&self.nonce)?;
        cursor.encode_u32_le(self.original_message_size)?;
        cursor.encode_u16_le(0)?;
        cursor.encode_u16_le(self.flags)?;
        cursor.encode_u64_le(self.session_id)
    }

    fn decode_body(cursor: &mut ReadCursor<'_>, _ctx: &FrameContext) -> CodecResult<Self> {
        let magic: [u8; 4] = cursor.decode_array()?;
        if magic != TRANSFORM_MAGIC {
            return Err(CodecError::bad_packet(format!("bad transform protocol id {magic:02X?}")));
        }
        let signature = cursor.decode_array()?;
        let nonce = cursor.decode_array()?;
        let original_message_size = cursor.decode_u32_le()?;
        cursor.skip(2)?;
        let flags = cursor.decode_u16_le()?;
        if flags != TRANSFORM_FLAG_ENCRYPTED {
            return Err(CodecError::bad_packet(format!("unsupported transform flags 0x{flags:04X}")));
        }
        let session_id = cursor.decode_u64_le()?;
        Ok(Self {
            signature,
            nonce,
            original_message_size,
            flags,
            session_id,
        })
    }
}

/// A received wire message, split by its protocol identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Envelope<'a> {
    /// One or more compounded plain messages.
    Plain(&'a [u8]),
    /// An encrypted payload and the header protecting it.
    Encrypted {
        /// Parsed transform header.
        header: TransformHeader,
        /// Ciphertext following the header.
        ciphertext: &'a [u8],
    },
}

impl<'a> Envelope<'a> {
    /// Inspects the protocol identifier without consuming anything else.
    pub fn parse(data: &'a [u8]) -> CodecResult<Self> {
        let mut cursor = ReadCursor::new(data);
        let magic = cursor.peek_u32_be()?;
        if magic == u32::from_be_bytes(TRANSFORM_MAGIC) {
            let ctx = FrameContext::response(Position(0), Status::SUCCESS);
            let header = TransformHeader::decode(&mut cursor, &ctx)?;
            let ciphertext = &data[TRANSFORM_HEADER_SIZE..];
            if ciphertext.len() != header.original_message_size as usize {
                return Err(CodecError::bad_packet(format!(
                    "transform declares {} bytes, carries {}",
                    header.original_message_size,
                    ciphertext.len()
                )));
            }
            Ok(Envelope::Encrypted { header, ciphertext })
        } else if magic == u32::from_be_bytes(SMB2_MAGIC) {
            Ok(Envelope::Plain(data))
        } else {
            Err(CodecError::bad_packet(format!("unknown protocol id 0x{magic:08X}")))
        }
    }
}

/// Concatenates a sealed transform header and its ciphertext.
pub fn encode_envelope(header: &TransformHeader, ciphertext: &[u8]) -> CodecResult<Vec<u8>> {
    let mut out = Vec::with_capacity(TRANSFORM_HEADER_SIZE + ciphertext.len());
    out.extend_from_slice(&header.to_bytes()?);
    out.extend_from_slice(ciphertext);
    Ok(out)
}
