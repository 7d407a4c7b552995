//! The message-frame abstraction shared by every wire structure.
//!
//! A frame encodes and decodes its own body; the provided [`Frame::encode`]
//! and [`Frame::decode_framed`] wrap that body logic and record where the
//! frame started and ended. Nested structures never look upward for shared
//! state: everything they need (where the enclosing message started, the
//! negotiated dialect, the direction, the status) is carried in a
//! [`FrameContext`] resolved once by the caller that owns the message.

use crate::cursor::{Position, ReadCursor, WriteCursor};
use crate::error::{CodecError, CodecResult};
use crate::negotiate::Dialect;
use crate::status::Status;

/// Direction of a message relative to the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Client to server.
    Request,
    /// Server to client.
    Response,
}

/// Shared decode/encode context for one message and all of its children.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameContext {
    /// Absolute offset of the owning message's header. Offset fields inside
    /// bodies are relative to this position.
    pub message_start: Position,
    /// Negotiated dialect, when known.
    pub dialect: Option<Dialect>,
    /// Whether the message travels to or from the server.
    pub direction: Direction,
    /// Status from the owning header (always success for requests).
    pub status: Status,
}

impl FrameContext {
    /// Context for a request whose header starts at `message_start`.
    pub fn request(message_start: Position) -> Self {
        Self {
            message_start,
            dialect: None,
            direction: Direction::Request,
            status: Status::SUCCESS,
        }
    }

    /// Context for a response whose header starts at `message_start`.
    pub fn response(message_start: Position, status: Status) -> Self {
        Self {
            message_start,
            dialect: None,
            direction: Direction::Response,
            status,
        }
    }

    /// Same context with a dialect attached.
    pub fn with_dialect(mut self, dialect: Option<Dialect>) -> Self {
        self.dialect = dialect;
        self
    }

    /// Converts an offset relative to the owning message into an absolute one.
    pub fn absolute(&self, relative: usize) -> Position {
        self.message_start + relative
    }

    /// Converts an absolute position into an offset relative to the owning message.
    pub fn relative(&self, absolute: Position) -> usize {
        absolute - self.message_start
    }
}

/// Start and end offsets a frame occupied in its buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span {
    /// Offset of the first byte.
    pub start: Position,
    /// Offset just past the last byte.
    pub end: Position,
}

impl Span {
    /// Number of bytes covered.
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    /// Whether the span covers nothing.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A decoded frame together with the span it was read from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Framed<T> {
    /// The decoded value.
    pub value: T,
    /// Where it was read from.
    pub span: Span,
}

/// A structure with polymorphic wire encode/decode logic.
pub trait Frame: Sized {
    /// Writes the type-specific body at the cursor.
    fn encode_body(&self, cursor: &mut WriteCursor<'_>, ctx: &FrameContext) -> CodecResult<()>;

    /// Reads the type-specific body at the cursor.
    fn decode_body(cursor: &mut ReadCursor<'_>, ctx: &FrameContext) -> CodecResult<Self>;

    /// Encodes the frame, returning the span it occupies.
    fn encode(&self, cursor: &mut WriteCursor<'_>, ctx: &FrameContext) -> CodecResult<Span> {
        let start = cursor.position();
        self.encode_body(cursor, ctx)?;
        Ok(Span {
            start,
            end: cursor.position(),
        })
    }

    /// Decodes the frame and records the span it was read from.
    fn decode_framed(cursor: &mut ReadCursor<'_>, ctx: &FrameContext) -> CodecResult<Framed<Self>> {
        let start = cursor.position();
        let value = Self::decode_body(cursor, ctx)?;
        Ok(Framed {
            value,
            span: Span {
                start,
                end: cursor.position(),
            },
        })
    }

    /// Decodes the frame.
    fn decode(cursor: &mut ReadCursor<'_>, ctx: &FrameContext) -> CodecResult<Self> {
        Self::decode_framed(cursor, ctx).map(|framed| framed.value)
    }
}

/// Consumes a structure-size field and checks it against `expected`.
pub(crate) fn expect_structure_size(cursor: &mut ReadCursor<'_>, expected: u16) -> CodecResult<()> {
    let at = cursor.offset();
    let size = cursor.decode_u16_le()?;
    if size != expected {
        return Err(CodecError::bad_packet(format!(
            "structure size {size} at offset {at}, expected {expected}"
        )));
    }
    Ok(())
}

/// Reads a variable-length buffer addressed by an offset relative to the
/// owning message. The cursor ends past the buffer if the buffer lies beyond it.
pub(crate) fn decode_buffer(
    cursor: &mut ReadCursor<'_>,
    ctx: &FrameContext,
    offset: usize,
    len: usize,
) -> CodecResult<Vec<u8>> {
    if len == 0 {
        return Ok(Vec::new());
    }
    let mut at = cursor.at(ctx.absolute(offset));
    let data = at.decode_bytes(len)?.to_vec();
    if at.offset() > cursor.offset() {
        cursor.seek(at.position());
    }
    Ok(data)
}

/// Writes `data` at the cursor and returns its offset relative to the owning
/// message, or 0 when there is nothing to write.
pub(crate) fn encode_buffer(cursor: &mut WriteCursor<'_>, ctx: &FrameContext, data: &[u8]) -> CodecResult<usize> {
    if data.is_empty() {
        return Ok(0);
    }
    let offset = ctx.relative(cursor.position());
    cursor.encode_bytes(data)?;
    Ok(offset)
}

/// Narrows an in-memory length to a 16-bit wire field.
pub(crate) fn wire_u16(n: usize) -> CodecResult<u16> {
    u16::try_from(n).map_err(|_| CodecError::bad_packet(format!("{n} does not fit in 16 bits")))
}

/// Narrows an in-memory length to a 32-bit wire field.
pub(crate) fn wire_u32(n: usize) -> CodecResult<u32> {
    u32::try_from(n).map_err(|_| CodecError::bad_packet(format!("{n} does not fit in 32 bits")))
}
