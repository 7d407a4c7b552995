#![warn(missing_docs)]

//! smbengine codec: bounds-checked byte cursors, SMB2/3 message frames, decode registries
//!
//! Everything here is synchronous and allocation-light. Frames encode into a
//! shared [`ByteBuffer`] through a [`WriteCursor`], decode from a borrowed
//! slice through a [`ReadCursor`], and concrete body types are selected at
//! decode time by peeking a discriminator and consulting a [`TypeRegistry`].

pub mod create;
pub mod cursor;
pub mod error;
pub mod file_io;
pub mod frame;
pub mod header;
pub mod message;
pub mod misc;
pub mod negotiate;
pub mod oplock;
pub mod registry;
pub mod session_setup;
pub mod status;
pub mod transform;
pub mod tree;

pub use create::{
    create_context_registry, CreateContext, CreateRequest, CreateResponse, DurableV2Request, FileAttributes, FileId,
    LeaseContext, LeaseV2,
};
pub use cursor::{padding, ByteBuffer, Endian, Hole, Position, ReadCursor, Scalar, WriteCursor};
pub use error::{Bound, CodecError, CodecResult, RegistryFamily};
pub use file_io::{
    CloseRequest, CloseResponse, FlushRequest, ReadRequest, ReadResponse, WriteRequest, WriteResponse,
};
pub use frame::{Direction, Frame, FrameContext, Framed, Span};
pub use header::{Addressing, Command, Header, HeaderFlags, HEADER_SIZE, SIGNATURE_OFFSET, UNSOLICITED_MESSAGE_ID};
pub use message::{body_registry, decode_chain, encode_chain, Body, BodyKey, PlainMessage};
pub use misc::ErrorResponse;
pub use negotiate::{negotiate_context_registry, Dialect, NegotiateContext, NegotiateRequest, NegotiateResponse};
pub use oplock::{LeaseBreakAck, LeaseBreakNotification, LeaseKey, LeaseState, OplockBreak, OplockLevel};
pub use registry::{DecodeFn, RegistryBuilder, TypeRegistry};
pub use session_setup::{SessionSetupRequest, SessionSetupResponse};
pub use status::Status;
pub use transform::{encode_envelope, Envelope, TransformHeader, TRANSFORM_HEADER_SIZE};
pub use tree::{TreeConnectRequest, TreeConnectResponse};
