//! TREE_CONNECT bodies.

use crate::cursor::{ReadCursor, WriteCursor};
use crate::error::CodecResult;
use crate::frame::{expect_structure_size, wire_u16, Frame, FrameContext};

/// Share type reported by the server.
pub mod share_type {
    /// Disk share.
    pub const DISK: u8 = 0x01;
    /// Named pipe share.
    pub const PIPE: u8 = 0x02;
    /// Printer share.
    pub const PRINT: u8 = 0x03;
}

/// Share flag: all traffic on the tree must be encrypted.
pub const SHARE_FLAG_ENCRYPT_DATA: u32 = 0x0000_8000;

/// Share capability: continuously available (persistent handles).
pub const SHARE_CAP_CONTINUOUS_AVAILABILITY: u32 = 0x0000_0010;

/// TREE_CONNECT request body.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TreeConnectRequest {
    /// Request flags.
    pub flags: u16,
    /// UNC share path, e.g. `\\server\share`.
    pub path: String,
}

impl TreeConnectRequest {
    const STRUCTURE_SIZE: u16 = 9;

    /// A request for `path` with no flags.
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            flags: 0,
            path: path.into(),
        }
    }
}

impl Frame for TreeConnectRequest {
    fn encode_body(&self, cursor: &mut WriteCursor<'_>, ctx: &FrameContext) -> CodecResult<()> {
        cursor.encode_u16_le(Self::STRUCTURE_SIZE)?;
        cursor.encode_u16_le(self.flags)?;
        let offset = cursor.hole().encode_u16_le(0)?;
        let length = cursor.hole().encode_u16_le(0)?;
        let at = ctx.relative(cursor.position());
        let written = cursor.encode_utf16(&self.path)?;
        offset.fill(cursor, wire_u16(at)?)?;
        length.fill(cursor, wire_u16(written)?)
    }

    fn decode_body(cursor: &mut ReadCursor<'_>, ctx: &FrameContext) -> CodecResult<Self> {
        expect_structure_size(cursor, Self::STRUCTURE_SIZE)?;
        let flags = cursor.decode_u16_le()?;
        let offset = cursor.decode_u16_le()? as usize;
        let length = cursor.decode_u16_le()? as usize;
        cursor.seek(ctx.absolute(offset));
        let path = cursor.decode_utf16(length)?;
        Ok(Self { flags, path })
    }
}

/// TREE_CONNECT response body.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TreeConnectResponse {
    /// Kind of share (see [`share_type`]).
    pub share_type: u8,
    /// Share flags.
    pub share_flags: u32,
    /// Share capabilities.
    pub capabilities: u32,
    /// Maximal access mask granted on the share.
    pub maximal_access: u32,
}

impl TreeConnectResponse {
    const STRUCTURE_SIZE: u16 = 16;

    /// Whether the share requires encryption.
    pub fn encrypt_data(&self) -> bool {
        self.share_flags & SHARE_FLAG_ENCRYPT_DATA != 0
    }
}

impl Frame for TreeConnectResponse {
    fn encode_body(&self, cursor: &mut WriteCursor<'_>, _ctx: &FrameContext) -> CodecResult<()> {
        cursor.encode_u16_le(Self::STRUCTURE_SIZE)?;
        cursor.encode_u8(self.share_type)?;
        cursor.encode_u8(0)?;
        cursor.encode_u32_le(self.share_flags)?;
        cursor.encode_u32_le(self.capabilities)?;
        cursor.encode_u32_le(self.maximal_access)
    }

    fn decode_body(cursor: &mut ReadCursor<'_>, _ctx: &FrameContext) -> CodecResult<Self> {
        expect_structure_size(cursor, Self::STRUCTURE_SIZE)?;
        let share_type = cursor.decode_u8()?;
        cursor.skip(1)?;
        Ok(Self {
            share_type,
            share_flags: cursor.decode_u32_le()?,
            capabilities: cursor.decode_u32_le()?,
            maximal_access: cursor.decode_u32_le()?,
        })
    }
}
