//! Fixed four-byte bodies (logoff, tree disconnect, echo, cancel, flush
//! response) and the generic error response.

use crate::cursor::{ReadCursor, WriteCursor};
use crate::error::CodecResult;
use crate::frame::{expect_structure_size, wire_u32, Frame, FrameContext};

/// A body consisting of only its structure size and a reserved field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Empty;

impl Empty {
    pub(crate) const STRUCTURE_SIZE: u16 = 4;
}

impl Frame for Empty {
    fn encode_body(&self, cursor: &mut WriteCursor<'_>, _ctx: &FrameContext) -> CodecResult<()> {
        cursor.encode_u16_le(Self::STRUCTURE_SIZE)?;
        cursor.encode_u16_le(0)
    }

    fn decode_body(cursor: &mut ReadCursor<'_>, _ctx: &FrameContext) -> CodecResult<Self> {
        expect_structure_size(cursor, Self::STRUCTURE_SIZE)?;
        cursor.skip(2)?;
        Ok(Empty)
    }
}

/// Body returned with any failing status.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ErrorResponse {
    /// Number of error contexts (3.1.1).
    pub error_context_count: u8,
    /// Command-specific error data.
    pub error_data: Vec<u8>,
}

impl ErrorResponse {
    pub(crate) const STRUCTURE_SIZE: u16 = 9;
}

impl Frame for ErrorResponse {
    fn encode_body(&self, cursor: &mut WriteCursor<'_>, _ctx: &FrameContext) -> CodecResult<()> {
        cursor.encode_u16_le(Self::STRUCTURE_SIZE)?;
        cursor.encode_u8(self.error_context_count)?;
        cursor.encode_u8(0)?;
        cursor.encode_u32_le(wire_u32(self.error_data.len())?)?;
        if self.error_data.is_empty() {
            cursor.encode_u8(0)
        } else {
            cursor.encode_bytes(&self.error_data)
        }
    }

    fn decode_body(cursor: &mut ReadCursor<'_>, _ctx: &FrameContext) -> CodecResult<Self> {
        expect_structure_size(cursor, Self::STRUCTURE_SIZE)?;
        let error_context_count = cursor.decode_u8()?;
        cursor.skip(1)?;
        let byte_count = cursor.decode_u32_le()? as usize;
        let error_data = cursor.decode_bytes(byte_count)?.to_vec();
        if byte_count == 0 && cursor.remaining() > 0 {
            cursor.skip(1)?;
        }
        Ok(Self {
            error_context_count,
            error_data,
        })
    }
}
