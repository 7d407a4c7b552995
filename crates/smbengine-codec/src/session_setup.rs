//! SESSION_SETUP and LOGOFF bodies.

use crate::cursor::{ReadCursor, WriteCursor};
use crate::error::CodecResult;
use crate::frame::{decode_buffer, encode_buffer, expect_structure_size, wire_u16, Frame, FrameContext};

/// Session setup request flag: bind this connection to an existing session.
pub const SESSION_FLAG_BINDING: u8 = 0x01;

/// Session flags returned by the server.
pub mod session_flags {
    /// Guest session.
    pub const IS_GUEST: u16 = 0x0001;
    /// Anonymous session.
    pub const IS_NULL: u16 = 0x0002;
    /// All traffic on the session must be encrypted.
    pub const ENCRYPT_DATA: u16 = 0x0004;
}

/// SESSION_SETUP request body.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SessionSetupRequest {
    /// Request flags ([`SESSION_FLAG_BINDING`]).
    pub flags: u8,
    /// Security mode bits.
    pub security_mode: u8,
    /// Capability bits.
    pub capabilities: u32,
    /// Reserved channel field.
    pub channel: u32,
    /// Session being re-established after a disconnect, or 0.
    pub previous_session_id: u64,
    /// Opaque authentication token.
    pub security_buffer: Vec<u8>,
}

impl SessionSetupRequest {
    const STRUCTURE_SIZE: u16 = 25;

    /// Whether this request binds an additional channel.
    pub fn is_binding(&self) -> bool {
        self.flags & SESSION_FLAG_BINDING != 0
    }
}

impl Frame for SessionSetupRequest {
    fn encode_body(&self, cursor: &mut WriteCursor<'_>, ctx: &FrameContext) -> CodecResult<()> {
        cursor.encode_u16_le(Self::STRUCTURE_SIZE)?;
        cursor.encode_u8(self.flags)?;
        cursor.encode_u8(self.security_mode)?;
        cursor.encode_u32_le(self.capabilities)?;
        cursor.encode_u32_le(self.channel)?;
        let offset = cursor.hole().encode_u16_le(0)?;
        cursor.encode_u16_le(wire_u16(self.security_buffer.len())?)?;
        cursor.encode_u64_le(self.previous_session_id)?;
        let at = encode_buffer(cursor, ctx, &self.security_buffer)?;
        offset.fill(cursor, wire_u16(at)?)
    }

    fn decode_body(cursor: &mut ReadCursor<'_>, ctx: &FrameContext) -> CodecResult<Self> {
        expect_structure_size(cursor, Self::STRUCTURE_SIZE)?;
        let flags = cursor.decode_u8()?;
        let security_mode = cursor.decode_u8()?;
        let capabilities = cursor.decode_u32_le()?;
        let channel = cursor.decode_u32_le()?;
        let offset = cursor.decode_u16_le()? as usize;
        let len = cursor.decode_u16_le()? as usize;
        let previous_session_id = cursor.decode_u64_le()?;
        let security_buffer = decode_buffer(cursor, ctx, offset, len)?;
        Ok(Self {
            flags,
            security_mode,
            capabilities,
            channel,
            previous_session_id,
            security_buffer,
        })
    }
}

/// SESSION_SETUP response body.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SessionSetupResponse {
    /// Session flags (see [`session_flags`]).
    pub session_flags: u16,
    /// Opaque authentication token (challenge or final token).
    pub security_buffer: Vec<u8>,
}

impl SessionSetupResponse {
    const STRUCTURE_SIZE: u16 = 9;

    /// Whether the server demands encryption on this session.
    pub fn encrypt_data(&self) -> bool {
        self.session_flags & session_flags::ENCRYPT_DATA != 0
    }

    /// Whether the session is a guest or anonymous session (never signed).
    pub fn is_guest_or_null(&self) -> bool {
        self.session_flags & (session_flags::IS_GUEST | session_flags::IS_NULL) != 0
    }
}

impl Frame for SessionSetupResponse {
    fn encode_body(&self, cursor: &mut WriteCursor<'_>, ctx: &FrameContext) -> CodecResult<()> {
        cursor.encode_u16_le(Self::STRUCTURE_SIZE)?;
        cursor.encode_u16_le(self.session_flags)?;
        let offset = cursor.hole().encode_u16_le(0)?;
        cursor.encode_u16_le(wire_u16(self.security_buffer.len())?)?;
        let at = encode_buffer(cursor, ctx, &self.security_buffer)?;
        offset.fill(cursor, wire_u16(at)?)
    }

    fn decode_body(cursor: &mut ReadCursor<'_>, ctx: &FrameContext) -> CodecResult<Self> {
        expect_structure_size(cursor, Self::STRUCTURE_SIZE)?;
        let session_flags = cursor.decode_u16_le()?;
        let offset = cursor.decode_u16_le()? as usize;
        let len = cursor.decode_u16_le()? as usize;
        let security_buffer = decode_buffer(cursor, ctx, offset, len)?;
        Ok(Self {
            session_flags,
            security_buffer,
        })
    }
}
