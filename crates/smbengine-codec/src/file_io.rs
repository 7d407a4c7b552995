//! CLOSE, FLUSH, READ and WRITE bodies.

use crate::create::{FileAttributes, FileId};
use crate::cursor::{ReadCursor, WriteCursor};
use crate::error::{CodecError, CodecResult};
use crate::frame::{decode_buffer, expect_structure_size, wire_u16, wire_u32, Frame, FrameContext};

/// Close flag: return the final attributes.
pub const CLOSE_FLAG_POSTQUERY_ATTRIB: u16 = 0x0001;

/// CLOSE request body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseRequest {
    /// Close flags.
    pub flags: u16,
    /// The open being closed.
    pub file_id: FileId,
}

impl CloseRequest {
    const STRUCTURE_SIZE: u16 = 24;
}

impl Frame for CloseRequest {
    fn encode_body(&self, cursor: &mut WriteCursor<'_>, ctx: &FrameContext) -> CodecResult<()> {
        cursor.encode_u16_le(Self::STRUCTURE_SIZE)?;
        cursor.encode_u16_le(self.flags)?;
        cursor.encode_u32_le(0)?;
        self.file_id.encode(cursor, ctx).map(|_| ())
    }

    fn decode_body(cursor: &mut ReadCursor<'_>, ctx: &FrameContext) -> CodecResult<Self> {
        expect_structure_size(cursor, Self::STRUCTURE_SIZE)?;
        let flags = cursor.decode_u16_le()?;
        cursor.skip(4)?;
        Ok(Self {
            flags,
            file_id: FileId::decode(cursor, ctx)?,
        })
    }
}

/// CLOSE response body.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CloseResponse {
    /// Echoed close flags.
    pub flags: u16,
    /// Final attributes (zero unless post-query was requested).
    pub attributes: FileAttributes,
}

impl CloseResponse {
    const STRUCTURE_SIZE: u16 = 60;
}

impl Frame for CloseResponse {
    fn encode_body(&self, cursor: &mut WriteCursor<'_>, _ctx: &FrameContext) -> CodecResult<()> {
        cursor.encode_u16_le(Self::STRUCTURE_SIZE)?;
        cursor.encode_u16_le(self.flags)?;
        cursor.encode_u32_le(0)?;
        self.attributes.encode_times(cursor)
    }

    fn decode_body(cursor: &mut ReadCursor<'_>, _ctx: &FrameContext) -> CodecResult<Self> {
        expect_structure_size(cursor, Self::STRUCTURE_SIZE)?;
        let flags = cursor.decode_u16_le()?;
        cursor.skip(4)?;
        Ok(Self {
            flags,
            attributes: FileAttributes::decode_times(cursor)?,
        })
    }
}

/// FLUSH request body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlushRequest {
    /// The open being flushed.
    pub file_id: FileId,
}

impl FlushRequest {
    const STRUCTURE_SIZE: u16 = 24;
}

impl Frame for FlushRequest {
    fn encode_body(&self, cursor: &mut WriteCursor<'_>, ctx: &FrameContext) -> CodecResult<()> {
        cursor.encode_u16_le(Self::STRUCTURE_SIZE)?;
        cursor.encode_u16_le(0)?;
        cursor.encode_u32_le(0)?;
        self.file_id.encode(cursor, ctx).map(|_| ())
    }

    fn decode_body(cursor: &mut ReadCursor<'_>, ctx: &FrameContext) -> CodecResult<Self> {
        expect_structure_size(cursor, Self::STRUCTURE_SIZE)?;
        cursor.skip(6)?;
        Ok(Self {
            file_id: FileId::decode(cursor, ctx)?,
        })
    }
}

/// READ request body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadRequest {
    /// Requested length.
    pub length: u32,
    /// File offset.
    pub offset: u64,
    /// The open being read.
    pub file_id: FileId,
    /// Fail with end-of-file unless at least this much is read.
    pub minimum_count: u32,
}

impl ReadRequest {
    const STRUCTURE_SIZE: u16 = 49;
    const DATA_PADDING: u8 = 0x50;
}

impl Frame for ReadRequest {
    fn encode_body(&self, cursor: &mut WriteCursor<'_>, ctx: &FrameContext) -> CodecResult<()> {
        cursor.encode_u16_le(Self::STRUCTURE_SIZE)?;
        cursor.encode_u8(Self::DATA_PADDING)?;
        cursor.encode_u8(0)?;
        cursor.encode_u32_le(self.length)?;
        cursor.encode_u64_le(self.offset)?;
        self.file_id.encode(cursor, ctx)?;
        cursor.encode_u32_le(self.minimum_count)?;
        // channel, remaining bytes, channel info offset/length
        cursor.encode_zeros(12)?;
        cursor.encode_u8(0)
    }

    fn decode_body(cursor: &mut ReadCursor<'_>, ctx: &FrameContext) -> CodecResult<Self> {
        expect_structure_size(cursor, Self::STRUCTURE_SIZE)?;
        cursor.skip(2)?;
        let length = cursor.decode_u32_le()?;
        let offset = cursor.decode_u64_le()?;
        let file_id = FileId::decode(cursor, ctx)?;
        let minimum_count = cursor.decode_u32_le()?;
        cursor.skip(13)?;
        Ok(Self {
            length,
            offset,
            file_id,
            minimum_count,
        })
    }
}

/// READ response body.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ReadResponse {
    /// Bytes read.
    pub data: Vec<u8>,
    /// Bytes the server still has queued for this read.
    pub data_remaining: u32,
}

impl ReadResponse {
    const STRUCTURE_SIZE: u16 = 17;
}

impl Frame for ReadResponse {
    fn encode_body(&self, cursor: &mut WriteCursor<'_>, ctx: &FrameContext) -> CodecResult<()> {
        cursor.encode_u16_le(Self::STRUCTURE_SIZE)?;
        let data_offset = cursor.hole().encode_u8(0)?;
        cursor.encode_u8(0)?;
        cursor.encode_u32_le(wire_u32(self.data.len())?)?;
        cursor.encode_u32_le(self.data_remaining)?;
        cursor.encode_u32_le(0)?;
        if self.data.is_empty() {
            return cursor.encode_u8(0);
        }
        let at = ctx.relative(cursor.position());
        let at = u8::try_from(at).map_err(|_| CodecError::bad_packet("read data offset past 255"))?;
        cursor.encode_bytes(&self.data)?;
        data_offset.fill(cursor, at)
    }

    fn decode_body(cursor: &mut ReadCursor<'_>, ctx: &FrameContext) -> CodecResult<Self> {
        expect_structure_size(cursor, Self::STRUCTURE_SIZE)?;
        let data_offset = cursor.decode_u8()? as usize;
        cursor.skip(1)?;
        let data_length = cursor.decode_u32_le()? as usize;
        let data_remaining = cursor.decode_u32_le()?;
        cursor.skip(4)?;
        let data = decode_buffer(cursor, ctx, data_offset, data_length)?;
        Ok(Self { data, data_remaining })
    }
}

/// WRITE request body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteRequest {
    /// File offset.
    pub offset: u64,
    /// The open being written.
    pub file_id: FileId,
    /// Write flags.
    pub flags: u32,
    /// Bytes to write.
    pub data: Vec<u8>,
}

impl WriteRequest {
    const STRUCTURE_SIZE: u16 = 49;
}

impl Frame for WriteRequest {
    fn encode_body(&self, cursor: &mut WriteCursor<'_>, ctx: &FrameContext) -> CodecResult<()> {
        cursor.encode_u16_le(Self::STRUCTURE_SIZE)?;
        let data_offset = cursor.hole().encode_u16_le(0)?;
        cursor.encode_u32_le(wire_u32(self.data.len())?)?;
        cursor.encode_u64_le(self.offset)?;
        self.file_id.encode(cursor, ctx)?;
        // channel, remaining bytes, channel info offset/length
        cursor.encode_zeros(12)?;
        cursor.encode_u32_le(self.flags)?;
        let at = ctx.relative(cursor.position());
        if self.data.is_empty() {
            cursor.encode_u8(0)?;
        } else {
            cursor.encode_bytes(&self.data)?;
        }
        data_offset.fill(cursor, wire_u16(at)?)
    }

    fn decode_body(cursor: &mut ReadCursor<'_>, ctx: &FrameContext) -> CodecResult<Self> {
        expect_structure_size(cursor, Self::STRUCTURE_SIZE)?;
        let data_offset = cursor.decode_u16_le()? as usize;
        let length = cursor.decode_u32_le()? as usize;
        let offset = cursor.decode_u64_le()?;
        let file_id = FileId::decode(cursor, ctx)?;
        cursor.skip(12)?;
        let flags = cursor.decode_u32_le()?;
        let data = decode_buffer(cursor, ctx, data_offset, length)?;
        Ok(Self {
            offset,
            file_id,
            flags,
            data,
        })
    }
}

/// WRITE response body.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct WriteResponse {
    /// Bytes written.
    pub count: u32,
    /// Bytes remaining (unused by servers).
    pub remaining: u32,
}

impl WriteResponse {
    const STRUCTURE_SIZE: u16 = 17;
}

impl Frame for WriteResponse {
    fn encode_body(&self, cursor: &mut WriteCursor<'_>, _ctx: &FrameContext) -> CodecResult<()> {
        cursor.encode_u16_le(Self::STRUCTURE_SIZE)?;
        cursor.encode_u16_le(0)?;
        cursor.encode_u32_le(self.count)?;
        cursor.encode_u32_le(self.remaining)?;
        cursor.encode_u32_le(0)
    }

    fn decode_body(cursor: &mut ReadCursor<'_>, _ctx: &FrameContext) -> CodecResult<Self> {
        expect_structure_size(cursor, Self::STRUCTURE_SIZE)?;
        cursor.skip(2)?;
        let count = cursor.decode_u32_le()?;
        let remaining = cursor.decode_u32_le()?;
        cursor.skip(4)?;
        Ok(Self { count, remaining })
    }
}
