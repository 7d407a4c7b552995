//! Complete messages: header plus body, compound chains, and the body registry.
//!
//! Bodies are a closed sum type. Decoding peeks the body's structure size and
//! dispatches on `(command, direction, structure size)` through a registry
//! built once on first use. A failing status or an interim response with a
//! nine-byte body is always an [`ErrorResponse`], whatever the command.

use std::sync::OnceLock;

use tracing::trace;

use crate::create::{CreateRequest, CreateResponse};
use crate::cursor::{padding, ByteBuffer, Endian, Position, ReadCursor, WriteCursor};
use crate::error::{CodecError, CodecResult, RegistryFamily};
use crate::file_io::{
    CloseRequest, CloseResponse, FlushRequest, ReadRequest, ReadResponse, WriteRequest, WriteResponse,
};
use crate::frame::{wire_u32, Direction, Frame, FrameContext, Framed, Span};
use crate::header::{Command, Header, HEADER_SIZE};
use crate::misc::{Empty, ErrorResponse};
use crate::negotiate::{Dialect, NegotiateRequest, NegotiateResponse};
use crate::oplock::{LeaseBreakAck, LeaseBreakNotification, OplockBreak};
use crate::registry::TypeRegistry;
use crate::session_setup::{SessionSetupRequest, SessionSetupResponse};
use crate::status::Status;
use crate::tree::{TreeConnectRequest, TreeConnectResponse};

/// Offset of `next_command` within the header.
const NEXT_COMMAND_OFFSET: usize = 20;

/// Compound members start on 8-byte boundaries.
pub const COMPOUND_ALIGNMENT: usize = 8;

/// Every message body the codec knows.
#[derive(Debug, Clone, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum Body {
    NegotiateRequest(NegotiateRequest),
    NegotiateResponse(NegotiateResponse),
    SessionSetupRequest(SessionSetupRequest),
    SessionSetupResponse(SessionSetupResponse),
    LogoffRequest,
    LogoffResponse,
    TreeConnectRequest(TreeConnectRequest),
    TreeConnectResponse(TreeConnectResponse),
    TreeDisconnectRequest,
    TreeDisconnectResponse,
    CreateRequest(CreateRequest),
    CreateResponse(CreateResponse),
    CloseRequest(CloseRequest),
    CloseResponse(CloseResponse),
    FlushRequest(FlushRequest),
    FlushResponse,
    ReadRequest(ReadRequest),
    ReadResponse(ReadResponse),
    WriteRequest(WriteRequest),
    WriteResponse(WriteResponse),
    CancelRequest,
    EchoRequest,
    EchoResponse,
    /// Oplock break notification, acknowledgement or response.
    OplockBreak(OplockBreak),
    LeaseBreakNotification(LeaseBreakNotification),
    /// Lease break acknowledgement or its response.
    LeaseBreakAck(LeaseBreakAck),
    ErrorResponse(ErrorResponse),
}

impl Body {
    /// Command code the body belongs to; `None` for an error response, which
    /// takes its command from the header.
    pub fn command(&self) -> Option<Command> {
        let command = match self {
            Body::NegotiateRequest(_) | Body::NegotiateResponse(_) => Command::Negotiate,
            Body::SessionSetupRequest(_) | Body::SessionSetupResponse(_) => Command::SessionSetup,
            Body::LogoffRequest | Body::LogoffResponse => Command::Logoff,
            Body::TreeConnectRequest(_) | Body::TreeConnectResponse(_) => Command::TreeConnect,
            Body::TreeDisconnectRequest | Body::TreeDisconnectResponse => Command::TreeDisconnect,
            Body::CreateRequest(_) | Body::CreateResponse(_) => Command::Create,
            Body::CloseRequest(_) | Body::CloseResponse(_) => Command::Close,
            Body::FlushRequest(_) | Body::FlushResponse => Command::Flush,
            Body::ReadRequest(_) | Body::ReadResponse(_) => Command::Read,
            Body::WriteRequest(_) | Body::WriteResponse(_) => Command::Write,
            Body::CancelRequest => Command::Cancel,
            Body::EchoRequest | Body::EchoResponse => Command::Echo,
            Body::OplockBreak(_) | Body::LeaseBreakNotification(_) | Body::LeaseBreakAck(_) => {
                Command::OplockBreak
            }
            Body::ErrorResponse(_) => return None,
        };
        Some(command)
    }

    fn encode(&self, cursor: &mut WriteCursor<'_>, ctx: &FrameContext) -> CodecResult<Span> {
        match self {
            Body::NegotiateRequest(b) => b.encode(cursor, ctx),
            Body::NegotiateResponse(b) => b.encode(cursor, ctx),
            Body::SessionSetupRequest(b) => b.encode(cursor, ctx),
            Body::SessionSetupResponse(b) => b.encode(cursor, ctx),
            Body::TreeConnectRequest(b) => b.encode(cursor, ctx),
            Body::TreeConnectResponse(b) => b.encode(cursor, ctx),
            Body::CreateRequest(b) => b.encode(cursor, ctx),
            Body::CreateResponse(b) => b.encode(cursor, ctx),
            Body::CloseRequest(b) => b.encode(cursor, ctx),
            Body::CloseResponse(b) => b.encode(cursor, ctx),
            Body::FlushRequest(b) => b.encode(cursor, ctx),
            Body::ReadRequest(b) => b.encode(cursor, ctx),
            Body::ReadResponse(b) => b.encode(cursor, ctx),
            Body::WriteRequest(b) => b.encode(cursor, ctx),
            Body::WriteResponse(b) => b.encode(cursor, ctx),
            Body::OplockBreak(b) => b.encode(cursor, ctx),
            Body::LeaseBreakNotification(b) => b.encode(cursor, ctx),
            Body::LeaseBreakAck(b) => b.encode(cursor, ctx),
            Body::ErrorResponse(b) => b.encode(cursor, ctx),
            Body::LogoffRequest
            | Body::LogoffResponse
            | Body::TreeDisconnectRequest
            | Body::TreeDisconnectResponse
            | Body::FlushResponse
            | Body::CancelRequest
            | Body::EchoRequest
            | Body::EchoResponse => Empty.encode(cursor, ctx),
        }
    }

    /// Decodes the body at the cursor for a message with `header`.
    pub fn decode(cursor: &mut ReadCursor<'_>, header: &Header, ctx: &FrameContext) -> CodecResult<Self> {
        let structure_size = cursor.peek_u16_le()?;
        if ctx.direction == Direction::Response
            && structure_size == ErrorResponse::STRUCTURE_SIZE
            && is_error_body(header)
        {
            return ErrorResponse::decode(cursor, ctx).map(Body::ErrorResponse);
        }
        body_registry().decode((header.command, ctx.direction, structure_size), cursor, ctx)
    }
}

/// Whether a response with this header carries an error body instead of the
/// command's own response body. Interim `PENDING` responses always do.
fn is_error_body(header: &Header) -> bool {
    if header.is_interim() {
        return true;
    }
    if !header.status.is_error() {
        return false;
    }
    !(header.command == Command::SessionSetup && header.status == Status::MORE_PROCESSING_REQUIRED)
}

/// Body registry discriminator.
pub type BodyKey = (Command, Direction, u16);

macro_rules! body_decoders {
    ($($name:ident: $ty:ty => $wrap:expr;)*) => {
        $(
            fn $name(cursor: &mut ReadCursor<'_>, ctx: &FrameContext) -> CodecResult<Body> {
                <$ty>::decode(cursor, ctx).map($wrap)
            }
        )*
    };
}

body_decoders! {
    negotiate_request: NegotiateRequest => Body::NegotiateRequest;
    negotiate_response: NegotiateResponse => Body::NegotiateResponse;
    session_setup_request: SessionSetupRequest => Body::SessionSetupRequest;
    session_setup_response: SessionSetupResponse => Body::SessionSetupResponse;
    logoff_request: Empty => |_| Body::LogoffRequest;
    logoff_response: Empty => |_| Body::LogoffResponse;
    tree_connect_request: TreeConnectRequest => Body::TreeConnectRequest;
    tree_connect_response: TreeConnectResponse => Body::TreeConnectResponse;
    tree_disconnect_request: Empty => |_| Body::TreeDisconnectRequest;
    tree_disconnect_response: Empty => |_| Body::TreeDisconnectResponse;
    create_request: CreateRequest => Body::CreateRequest;
    create_response: CreateResponse => Body::CreateResponse;
    close_request: CloseRequest => Body::CloseRequest;
    close_response: CloseResponse => Body::CloseResponse;
    flush_request: FlushRequest => Body::FlushRequest;
    flush_response: Empty => |_| Body::FlushResponse;
    read_request: ReadRequest => Body::ReadRequest;
    read_response: ReadResponse => Body::ReadResponse;
    write_request: WriteRequest => Body::WriteRequest;
    write_response: WriteResponse => Body::WriteResponse;
    cancel_request: Empty => |_| Body::CancelRequest;
    echo_request: Empty => |_| Body::EchoRequest;
    echo_response: Empty => |_| Body::EchoResponse;
    oplock_break: OplockBreak => Body::OplockBreak;
    lease_break_notification: LeaseBreakNotification => Body::LeaseBreakNotification;
    lease_break_ack: LeaseBreakAck => Body::LeaseBreakAck;
}

/// The body registry, built on first use.
pub fn body_registry() -> &'static TypeRegistry<BodyKey, Body> {
    use Command as C;
    use Direction::{Request as Rq, Response as Rs};

    static REGISTRY: OnceLock<TypeRegistry<BodyKey, Body>> = OnceLock::new();
    REGISTRY.get_or_init(|| {
        TypeRegistry::builder(RegistryFamily::Body)
            .register((C::Negotiate, Rq, 36), negotiate_request)
            .register((C::Negotiate, Rs, 65), negotiate_response)
            .register((C::SessionSetup, Rq, 25), session_setup_request)
            .register((C::SessionSetup, Rs, 9), session_setup_response)
            .register((C::Logoff, Rq, 4), logoff_request)
            .register((C::Logoff, Rs, 4), logoff_response)
            .register((C::TreeConnect, Rq, 9), tree_connect_request)
            .register((C::TreeConnect, Rs, 16), tree_connect_response)
            .register((C::TreeDisconnect, Rq, 4), tree_disconnect_request)
            .register((C::TreeDisconnect, Rs, 4), tree_disconnect_response)
            .register((C::Create, Rq, 57), create_request)
            .register((C::Create, Rs, 89), create_response)
            .register((C::Close, Rq, 24), close_request)
            .register((C::Close, Rs, 60), close_response)
            .register((C::Flush, Rq, 24), flush_request)
            .register((C::Flush, Rs, 4), flush_response)
            .register((C::Read, Rq, 49), read_request)
            .register((C::Read, Rs, 17), read_response)
            .register((C::Write, Rq, 49), write_request)
            .register((C::Write, Rs, 17), write_response)
            .register((C::Cancel, Rq, 4), cancel_request)
            .register((C::Echo, Rq, 4), echo_request)
            .register((C::Echo, Rs, 4), echo_response)
            .register((C::OplockBreak, Rq, 24), oplock_break)
            .register((C::OplockBreak, Rs, 24), oplock_break)
            .register((C::OplockBreak, Rs, 44), lease_break_notification)
            .register((C::OplockBreak, Rq, 36), lease_break_ack)
            .register((C::OplockBreak, Rs, 36), lease_break_ack)
            .build()
    })
}

/// One header and its body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlainMessage {
    /// Fixed header.
    pub header: Header,
    /// Command body.
    pub body: Body,
}

impl PlainMessage {
    /// Pairs a header with a body.
    pub fn new(header: Header, body: Body) -> Self {
        Self { header, body }
    }

    /// A request with a defaulted header for the body's command.
    pub fn request(body: Body) -> CodecResult<Self> {
        let command = body
            .command()
            .ok_or_else(|| CodecError::bad_packet("an error response is not a request"))?;
        Ok(Self::new(Header::request(command), body))
    }

    /// Direction implied by the header flags.
    pub fn direction(&self) -> Direction {
        if self.header.flags.is_response() {
            Direction::Response
        } else {
            Direction::Request
        }
    }

    /// Appends the message to `buf`, returning the span it occupies.
    pub fn encode(&self, buf: &mut ByteBuffer, dialect: Option<Dialect>) -> CodecResult<Span> {
        let start = Position(buf.len());
        let ctx = match self.direction() {
            Direction::Request => FrameContext::request(start),
            Direction::Response => FrameContext::response(start, self.header.status),
        }
        .with_dialect(dialect);
        let mut cursor = WriteCursor::at(buf, start.0);
        self.header.encode(&mut cursor, &ctx)?;
        self.body.encode(&mut cursor, &ctx)?;
        Ok(Span {
            start,
            end: cursor.position(),
        })
    }

    /// Decodes one message at the cursor. The cursor's window should already be
    /// narrowed to this message's extent.
    pub fn decode(cursor: &mut ReadCursor<'_>, dialect: Option<Dialect>) -> CodecResult<Framed<Self>> {
        let start = cursor.position();
        let header = Header::decode(cursor, &FrameContext::request(start))?;
        let ctx = if header.flags.is_response() {
            FrameContext::response(start, header.status)
        } else {
            FrameContext::request(start)
        }
        .with_dialect(dialect);
        let body = Body::decode(cursor, &header, &ctx)?;
        trace!(command = %header.command, message_id = header.message_id, "decoded message");
        Ok(Framed {
            value: Self { header, body },
            span: Span {
                start,
                end: cursor.position(),
            },
        })
    }
}

/// Serializes a compound chain into one buffer.
///
/// Every member but the last is zero-padded to [`COMPOUND_ALIGNMENT`] and its
/// `next_command` set to its padded length; the last member's is zero. The
/// headers in `messages` are updated to match what was written. Returns each
/// member's span, including padding.
pub fn encode_chain(messages: &mut [PlainMessage], dialect: Option<Dialect>) -> CodecResult<(ByteBuffer, Vec<Span>)> {
    let mut buf = ByteBuffer::new();
    let mut spans = Vec::with_capacity(messages.len());
    let count = messages.len();
    for (i, message) in messages.iter_mut().enumerate() {
        message.header.next_command = 0;
        let mut span = message.encode(&mut buf, dialect)?;
        if i + 1 < count {
            let pad = padding(span.len(), COMPOUND_ALIGNMENT);
            WriteCursor::append(&mut buf).encode_zeros(pad)?;
            span.end = span.end + pad;
            let next = wire_u32(span.len())?;
            buf.rewrite_at(span.start.0 + NEXT_COMMAND_OFFSET, next, Endian::Little)?;
            message.header.next_command = next;
        }
        spans.push(span);
    }
    Ok((buf, spans))
}

/// Splits and decodes a plaintext compound chain.
///
/// Each member is decoded inside a window ending where `next_command` says the
/// next member starts, so a malformed body can never read into its neighbour.
pub fn decode_chain(data: &[u8], dialect: Option<Dialect>) -> CodecResult<Vec<Framed<PlainMessage>>> {
    let mut messages = Vec::new();
    let mut start = 0usize;
    loop {
        if data.len().saturating_sub(start) < HEADER_SIZE {
            return Err(CodecError::bad_packet(format!(
                "compound member at {start} shorter than a header"
            )));
        }
        let mut cursor = ReadCursor::new(data);
        cursor.seek(Position(start));
        let next = (cursor + NEXT_COMMAND_OFFSET).peek_u32_le()? as usize;
        let end = if next == 0 { data.len() } else { start + next };
        if end > data.len() || (next != 0 && next < HEADER_SIZE) {
            return Err(CodecError::bad_packet(format!("bad next command offset {next} at {start}")));
        }
        let mut framed = cursor.with_window(start, end, |c| PlainMessage::decode(c, dialect))?;
        framed.span.end = Position(end);
        messages.push(framed);
        if next == 0 {
            return Ok(messages);
        }
        start = end;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::create::FileId;
    use crate::header::HeaderFlags;

    fn response(command: Command, status: Status, body: Body) -> PlainMessage {
        let mut header = Header::request(command);
        header.flags.set(HeaderFlags::SERVER_TO_REDIR, true);
        header.status = status;
        PlainMessage::new(header, body)
    }

    #[test]
    fn test_compound_chain_roundtrip() {
        let mut chain = vec![
            PlainMessage::request(Body::CreateRequest(CreateRequest::new("a.txt"))).unwrap(),
            PlainMessage::request(Body::CloseRequest(CloseRequest {
                flags: 0,
                file_id: FileId::RELATED,
            }))
            .unwrap(),
        ];
        chain[1].header.flags.set(HeaderFlags::RELATED_OPERATIONS, true);
        chain[1].header.message_id = 1;
        let (buf, spans) = encode_chain(&mut chain, None).unwrap();
        assert_eq!(spans.len(), 2);
        assert_eq!(spans[0].len() % 8, 0);
        assert_eq!(chain[0].header.next_command as usize, spans[0].len());
        assert_eq!(chain[1].header.next_command, 0);
        assert_eq!(spans[1].end.0, buf.len());

        let decoded = decode_chain(buf.as_slice(), None).unwrap();
        let values: Vec<_> = decoded.iter().map(|f| f.value.clone()).collect();
        assert_eq!(values, chain);
        assert_eq!(decoded[0].span, spans[0]);
    }

    #[test]
    fn test_error_body_dispatch() {
        let message = response(
            Command::Create,
            Status::OBJECT_NAME_NOT_FOUND,
            Body::ErrorResponse(ErrorResponse::default()),
        );
        let mut buf = ByteBuffer::new();
        message.encode(&mut buf, None).unwrap();
        let decoded = decode_chain(buf.as_slice(), None).unwrap();
        assert_eq!(decoded[0].value.body, Body::ErrorResponse(ErrorResponse::default()));
    }

    #[test]
    fn test_interim_response_has_error_body() {
        let mut message = response(
            Command::Read,
            Status::PENDING,
            Body::ErrorResponse(ErrorResponse::default()),
        );
        message.header.addressing = crate::header::Addressing::Async { async_id: 7 };
        let mut buf = ByteBuffer::new();
        message.encode(&mut buf, None).unwrap();
        let decoded = decode_chain(buf.as_slice(), None).unwrap();
        assert!(decoded[0].value.header.is_interim());
        assert_eq!(decoded[0].value.body, Body::ErrorResponse(ErrorResponse::default()));
    }

    #[test]
    fn test_more_processing_is_a_session_setup_body() {
        let body = Body::SessionSetupResponse(SessionSetupResponse {
            session_flags: 0,
            security_buffer: vec![1, 2, 3, 4],
        });
        let message = response(Command::SessionSetup, Status::MORE_PROCESSING_REQUIRED, body.clone());
        let mut buf = ByteBuffer::new();
        message.encode(&mut buf, None).unwrap();
        let decoded = decode_chain(buf.as_slice(), None).unwrap();
        assert_eq!(decoded[0].value.body, body);
    }

    #[test]
    fn test_unknown_structure_size_is_reported() {
        let message = response(Command::Echo, Status::SUCCESS, Body::EchoResponse);
        let mut buf = ByteBuffer::new();
        message.encode(&mut buf, None).unwrap();
        buf.as_mut_slice()[HEADER_SIZE] = 5;
        let err = decode_chain(buf.as_slice(), None).unwrap_err();
        assert!(matches!(
            err,
            CodecError::UnknownDiscriminator {
                family: RegistryFamily::Body,
                ..
            }
        ));
    }

    #[test]
    fn test_next_command_past_end_is_bad_packet() {
        let mut chain = vec![PlainMessage::request(Body::EchoRequest).unwrap()];
        let (mut buf, _) = encode_chain(&mut chain, None).unwrap();
        buf.rewrite_at(NEXT_COMMAND_OFFSET, 4096u32, Endian::Little)
            .unwrap();
        assert!(matches!(decode_chain(buf.as_slice(), None), Err(CodecError::BadPacket { .. })));
    }
}
