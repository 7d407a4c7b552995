//! Dialect negotiation messages and negotiate contexts.

use std::sync::OnceLock;

use uuid::Uuid;

use crate::cursor::{ReadCursor, WriteCursor};
use crate::error::{CodecError, CodecResult, RegistryFamily};
use crate::frame::{decode_buffer, expect_structure_size, wire_u16, wire_u32, Frame, FrameContext};
use crate::registry::TypeRegistry;

/// Protocol revisions the codec understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u16)]
pub enum Dialect {
    /// SMB 2.0.2
    Smb202 = 0x0202,
    /// SMB 2.1
    Smb210 = 0x0210,
    /// SMB 3.0
    Smb300 = 0x0300,
    /// SMB 3.0.2
    Smb302 = 0x0302,
    /// SMB 3.1.1
    Smb311 = 0x0311,
}

impl Dialect {
    /// Every dialect, oldest first.
    pub const ALL: [Dialect; 5] = [
        Dialect::Smb202,
        Dialect::Smb210,
        Dialect::Smb300,
        Dialect::Smb302,
        Dialect::Smb311,
    ];

    /// Whether this is an SMB 3.x dialect (AES signing, encryption, channels).
    pub fn is_smb3(self) -> bool {
        self >= Dialect::Smb300
    }

    /// Whether derived keys are bound to the pre-authentication transcript.
    pub fn uses_preauth_integrity(self) -> bool {
        self == Dialect::Smb311
    }

    /// Whether the dialect supports negotiated multi-credit requests.
    pub fn supports_large_mtu(self) -> bool {
        self >= Dialect::Smb210
    }
}

impl TryFrom<u16> for Dialect {
    type Error = CodecError;

    fn try_from(code: u16) -> CodecResult<Self> {
        match code {
            0x0202 => Ok(Dialect::Smb202),
            0x0210 => Ok(Dialect::Smb210),
            0x0300 => Ok(Dialect::Smb300),
            0x0302 => Ok(Dialect::Smb302),
            0x0311 => Ok(Dialect::Smb311),
            other => Err(CodecError::bad_packet(format!("unknown dialect 0x{other:04X}"))),
        }
    }
}

/// Security mode bits.
pub mod security_mode {
    /// Signing is enabled.
    pub const SIGNING_ENABLED: u16 = 0x0001;
    /// Signing is required.
    pub const SIGNING_REQUIRED: u16 = 0x0002;
}

/// Global capability bits.
pub mod capabilities {
    /// DFS support.
    pub const DFS: u32 = 0x0000_0001;
    /// Leasing support.
    pub const LEASING: u32 = 0x0000_0002;
    /// Multi-credit requests.
    pub const LARGE_MTU: u32 = 0x0000_0004;
    /// Multiple channels per session.
    pub const MULTI_CHANNEL: u32 = 0x0000_0008;
    /// Persistent handles.
    pub const PERSISTENT_HANDLES: u32 = 0x0000_0010;
    /// Directory leasing.
    pub const DIRECTORY_LEASING: u32 = 0x0000_0020;
    /// Encryption.
    pub const ENCRYPTION: u32 = 0x0000_0040;
}

/// Negotiate context type codes.
pub mod context_type {
    /// Pre-authentication integrity hash algorithms and salt.
    pub const PREAUTH_INTEGRITY: u16 = 0x0001;
    /// Encryption cipher list.
    pub const ENCRYPTION: u16 = 0x0002;
    /// Signing algorithm list.
    pub const SIGNING: u16 = 0x0008;
}

/// Pre-authentication hash algorithm: SHA-512.
pub const HASH_ALGORITHM_SHA512: u16 = 0x0001;

/// A negotiate context block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NegotiateContext {
    /// Hash algorithms for the pre-authentication transcript.
    PreauthIntegrity {
        /// Offered (request) or selected (response) algorithms.
        hash_algorithms: Vec<u16>,
        /// Random salt.
        salt: Vec<u8>,
    },
    /// Cipher identifiers.
    Encryption {
        /// Offered (request) or selected (response) ciphers.
        ciphers: Vec<u16>,
    },
    /// Signing algorithm identifiers.
    Signing {
        /// Offered (request) or selected (response) algorithms.
        algorithms: Vec<u16>,
    },
    /// Any context the codec does not interpret.
    Other {
        /// Context type code.
        context_type: u16,
        /// Raw context data.
        data: Vec<u8>,
    },
}

impl NegotiateContext {
    /// Wire type code of this context.
    pub fn context_type(&self) -> u16 {
        match self {
            NegotiateContext::PreauthIntegrity { .. } => context_type::PREAUTH_INTEGRITY,
            NegotiateContext::Encryption { .. } => context_type::ENCRYPTION,
            NegotiateContext::Signing { .. } => context_type::SIGNING,
            NegotiateContext::Other { context_type, .. } => *context_type,
        }
    }

    fn encode_data(&self, cursor: &mut WriteCursor<'_>) -> CodecResult<()> {
        match self {
            NegotiateContext::PreauthIntegrity { hash_algorithms, salt } => {
                cursor.encode_u16_le(wire_u16(hash_algorithms.len())?)?;
                cursor.encode_u16_le(wire_u16(salt.len())?)?;
                for algorithm in hash_algorithms {
                    cursor.encode_u16_le(*algorithm)?;
                }
                cursor.encode_bytes(salt)
            }
            NegotiateContext::Encryption { ciphers } => encode_u16_list(cursor, ciphers),
            NegotiateContext::Signing { algorithms } => encode_u16_list(cursor, algorithms),
            NegotiateContext::Other { data, .. } => cursor.encode_bytes(data),
        }
    }
}

impl Frame for NegotiateContext {
    fn encode_body(&self, cursor: &mut WriteCursor<'_>, _ctx: &FrameContext) -> CodecResult<()> {
        cursor.encode_u16_le(self.context_type())?;
        let length = cursor.hole().encode_u16_le(0)?;
        cursor.encode_u32_le(0)?;
        let start = cursor.position();
        self.encode_data(cursor)?;
        let written = wire_u16(cursor.position() - start)?;
        length.fill(cursor, written)
    }

    fn decode_body(cursor: &mut ReadCursor<'_>, ctx: &FrameContext) -> CodecResult<Self> {
        let context_type = cursor.peek_u16_le()?;
        match negotiate_context_registry().lookup(context_type) {
            Ok(decode) => decode(cursor, ctx),
            Err(_) => decode_other(cursor, ctx),
        }
    }
}

/// Reads the common context prefix and returns the data length.
fn context_prefix(cursor: &mut ReadCursor<'_>) -> CodecResult<(u16, usize)> {
    let context_type = cursor.decode_u16_le()?;
    let length = cursor.decode_u16_le()? as usize;
    cursor.skip(4)?;
    Ok((context_type, length))
}

fn decode_preauth(cursor: &mut ReadCursor<'_>, _ctx: &FrameContext) -> CodecResult<NegotiateContext> {
    let (_, length) = context_prefix(cursor)?;
    cursor.scoped(length, |c| {
        let count = c.decode_u16_le()? as usize;
        let salt_len = c.decode_u16_le()? as usize;
        let hash_algorithms = (0..count).map(|_| c.decode_u16_le()).collect::<CodecResult<_>>()?;
        let salt = c.decode_bytes(salt_len)?.to_vec();
        Ok(NegotiateContext::PreauthIntegrity { hash_algorithms, salt })
    })
}

fn decode_encryption(cursor: &mut ReadCursor<'_>, _ctx: &FrameContext) -> CodecResult<NegotiateContext> {
    let (_, length) = context_prefix(cursor)?;
    let ciphers = cursor.scoped(length, decode_u16_list)?;
    Ok(NegotiateContext::Encryption { ciphers })
}

fn decode_signing(cursor: &mut ReadCursor<'_>, _ctx: &FrameContext) -> CodecResult<NegotiateContext> {
    let (_, length) = context_prefix(cursor)?;
    let algorithms = cursor.scoped(length, decode_u16_list)?;
    Ok(NegotiateContext::Signing { algorithms })
}

fn decode_other(cursor: &mut ReadCursor<'_>, _ctx: &FrameContext) -> CodecResult<NegotiateContext> {
    let (context_type, length) = context_prefix(cursor)?;
    let data = cursor.decode_bytes(length)?.to_vec();
    Ok(NegotiateContext::Other { context_type, data })
}

fn encode_u16_list(cursor: &mut WriteCursor<'_>, values: &[u16]) -> CodecResult<()> {
    cursor.encode_u16_le(wire_u16(values.len())?)?;
    for value in values {
        cursor.encode_u16_le(*value)?;
    }
    Ok(())
}

fn decode_u16_list(cursor: &mut ReadCursor<'_>) -> CodecResult<Vec<u16>> {
    let count = cursor.decode_u16_le()? as usize;
    (0..count).map(|_| cursor.decode_u16_le()).collect()
}

/// Registry of negotiate context decoders keyed by context type.
pub fn negotiate_context_registry() -> &'static TypeRegistry<u16, NegotiateContext> {
    static REGISTRY: OnceLock<TypeRegistry<u16, NegotiateContext>> = OnceLock::new();
    REGISTRY.get_or_init(|| {
        TypeRegistry::builder(RegistryFamily::NegotiateContext)
            .register(context_type::PREAUTH_INTEGRITY, decode_preauth)
            .register(context_type::ENCRYPTION, decode_encryption)
            .register(context_type::SIGNING, decode_signing)
            .build()
    })
}

fn encode_context_list(
    cursor: &mut WriteCursor<'_>,
    ctx: &FrameContext,
    contexts: &[NegotiateContext],
) -> CodecResult<u32> {
    cursor.align(ctx.message_start, 8)?;
    let offset = ctx.relative(cursor.position());
    for (i, context) in contexts.iter().enumerate() {
        if i > 0 {
            cursor.align(ctx.message_start, 8)?;
        }
        context.encode(cursor, ctx)?;
    }
    wire_u32(offset)
}

fn decode_context_list(
    cursor: &mut ReadCursor<'_>,
    ctx: &FrameContext,
    offset: usize,
    count: usize,
) -> CodecResult<Vec<NegotiateContext>> {
    if count == 0 {
        return Ok(Vec::new());
    }
    cursor.seek(ctx.absolute(offset));
    let mut contexts = Vec::with_capacity(count);
    for i in 0..count {
        if i > 0 {
            cursor.align(ctx.message_start, 8)?;
        }
        contexts.push(NegotiateContext::decode(cursor, ctx)?);
    }
    Ok(contexts)
}

/// NEGOTIATE request body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NegotiateRequest {
    /// Security mode bits.
    pub security_mode: u16,
    /// Capability bits.
    pub capabilities: u32,
    /// Client identifier.
    pub client_guid: Uuid,
    /// Offered dialects in preference order.
    pub dialects: Vec<Dialect>,
    /// Extension blocks (only sent when 3.1.1 is offered).
    pub contexts: Vec<NegotiateContext>,
}

impl NegotiateRequest {
    const STRUCTURE_SIZE: u16 = 36;
}

impl Frame for NegotiateRequest {
    fn encode_body(&self, cursor: &mut WriteCursor<'_>, ctx: &FrameContext) -> CodecResult<()> {
        cursor.encode_u16_le(Self::STRUCTURE_SIZE)?;
        cursor.encode_u16_le(wire_u16(self.dialects.len())?)?;
        cursor.encode_u16_le(self.security_mode)?;
        cursor.encode_u16_le(0)?;
        cursor.encode_u32_le(self.capabilities)?;
        cursor.encode_bytes(&self.client_guid.to_bytes_le())?;
        let context_offset = cursor.hole().encode_u32_le(0)?;
        cursor.encode_u16_le(wire_u16(self.contexts.len())?)?;
        cursor.encode_u16_le(0)?;
        for dialect in &self.dialects {
            cursor.encode_u16_le(*dialect as u16)?;
        }
        if !self.contexts.is_empty() {
            let offset = encode_context_list(cursor, ctx, &self.contexts)?;
            context_offset.fill(cursor, offset)?;
        }
        Ok(())
    }

    fn decode_body(cursor: &mut ReadCursor<'_>, ctx: &FrameContext) -> CodecResult<Self> {
        expect_structure_size(cursor, Self::STRUCTURE_SIZE)?;
        let dialect_count = cursor.decode_u16_le()? as usize;
        let security_mode = cursor.decode_u16_le()?;
        cursor.skip(2)?;
        let capabilities = cursor.decode_u32_le()?;
        let client_guid = Uuid::from_bytes_le(cursor.decode_array()?);
        let context_offset = cursor.decode_u32_le()? as usize;
        let context_count = cursor.decode_u16_le()? as usize;
        cursor.skip(2)?;
        let dialects = (0..dialect_count)
            .map(|_| cursor.decode_u16_le().and_then(Dialect::try_from))
            .collect::<CodecResult<Vec<_>>>()?;
        let contexts = if dialects.contains(&Dialect::Smb311) {
            decode_context_list(cursor, ctx, context_offset, context_count)?
        } else {
            Vec::new()
        };
        Ok(Self {
            security_mode,
            capabilities,
            client_guid,
            dialects,
            contexts,
        })
    }
}

/// NEGOTIATE response body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NegotiateResponse {
    /// Server security mode bits.
    pub security_mode: u16,
    /// Dialect chosen by the server.
    pub dialect: Dialect,
    /// Server identifier.
    pub server_guid: Uuid,
    /// Server capability bits.
    pub capabilities: u32,
    /// Largest transact payload.
    pub max_transact_size: u32,
    /// Largest read length.
    pub max_read_size: u32,
    /// Largest write length.
    pub max_write_size: u32,
    /// Server time (FILETIME).
    pub system_time: u64,
    /// Server boot time (FILETIME).
    pub server_start_time: u64,
    /// Initial security token (e.g. SPNEGO hints).
    pub security_buffer: Vec<u8>,
    /// Selected extension blocks.
    pub contexts: Vec<NegotiateContext>,
}

impl NegotiateResponse {
    const STRUCTURE_SIZE: u16 = 65;

    /// The selected cipher, if the server returned an encryption context.
    pub fn cipher(&self) -> Option<u16> {
        self.contexts.iter().find_map(|c| match c {
            NegotiateContext::Encryption { ciphers } => ciphers.first().copied(),
            _ => None,
        })
    }

    /// The selected signing algorithm, if the server returned a signing context.
    pub fn signing_algorithm(&self) -> Option<u16> {
        self.contexts.iter().find_map(|c| match c {
            NegotiateContext::Signing { algorithms } => algorithms.first().copied(),
            _ => None,
        })
    }

    /// The selected pre-authentication hash algorithm.
    pub fn preauth_hash_algorithm(&self) -> Option<u16> {
        self.contexts.iter().find_map(|c| match c {
            NegotiateContext::PreauthIntegrity { hash_algorithms, .. } => hash_algorithms.first().copied(),
            _ => None,
        })
    }
}

impl Frame for NegotiateResponse {
    fn encode_body(&self, cursor: &mut WriteCursor<'_>, ctx: &FrameContext) -> CodecResult<()> {
        cursor.encode_u16_le(Self::STRUCTURE_SIZE)?;
        cursor.encode_u16_le(self.security_mode)?;
        cursor.encode_u16_le(self.dialect as u16)?;
        cursor.encode_u16_le(wire_u16(self.contexts.len())?)?;
        cursor.encode_bytes(&self.server_guid.to_bytes_le())?;
        cursor.encode_u32_le(self.capabilities)?;
        cursor.encode_u32_le(self.max_transact_size)?;
        cursor.encode_u32_le(self.max_read_size)?;
        cursor.encode_u32_le(self.max_write_size)?;
        cursor.encode_u64_le(self.system_time)?;
        cursor.encode_u64_le(self.server_start_time)?;
        let buffer_offset = cursor.hole().encode_u16_le(0)?;
        cursor.encode_u16_le(wire_u16(self.security_buffer.len())?)?;
        let context_offset = cursor.hole().encode_u32_le(0)?;
        if !self.security_buffer.is_empty() {
            let offset = ctx.relative(cursor.position());
            cursor.encode_bytes(&self.security_buffer)?;
            buffer_offset.fill(cursor, wire_u16(offset)?)?;
        }
        if !self.contexts.is_empty() {
            let offset = encode_context_list(cursor, ctx, &self.contexts)?;
            context_offset.fill(cursor, offset)?;
        }
        Ok(())
    }

    fn decode_body(cursor: &mut ReadCursor<'_>, ctx: &FrameContext) -> CodecResult<Self> {
        expect_structure_size(cursor, Self::STRUCTURE_SIZE)?;
        let security_mode = cursor.decode_u16_le()?;
        let dialect = Dialect::try_from(cursor.decode_u16_le()?)?;
        let context_count = cursor.decode_u16_le()? as usize;
        let server_guid = Uuid::from_bytes_le(cursor.decode_array()?);
        let capabilities = cursor.decode_u32_le()?;
        let max_transact_size = cursor.decode_u32_le()?;
        let max_read_size = cursor.decode_u32_le()?;
        let max_write_size = cursor.decode_u32_le()?;
        let system_time = cursor.decode_u64_le()?;
        let server_start_time = cursor.decode_u64_le()?;
        let buffer_offset = cursor.decode_u16_le()? as usize;
        let buffer_len = cursor.decode_u16_le()? as usize;
        let context_offset = cursor.decode_u32_le()? as usize;
        let security_buffer = decode_buffer(cursor, ctx, buffer_offset, buffer_len)?;
        let contexts = if dialect == Dialect::Smb311 {
            decode_context_list(cursor, ctx, context_offset, context_count)?
        } else {
            Vec::new()
        };
        Ok(Self {
            security_mode,
            dialect,
            server_guid,
            capabilities,
            max_transact_size,
            max_read_size,
            max_write_size,
            system_time,
            server_start_time,
            security_buffer,
            contexts,
        })
    }
}
