//! CREATE request/response bodies and the create-context chain.
//!
//! Create contexts are a linked list of 8-byte aligned entries, each naming
//! itself with a short tag. Decoding reads the tag first and dispatches through
//! [`create_context_registry`]; tags without a registered decoder are kept as
//! [`CreateContext::Other`] so unknown server extensions survive a round trip.

use std::fmt;
use std::sync::OnceLock;

use uuid::Uuid;

use crate::cursor::{Hole, Position, ReadCursor, WriteCursor};
use crate::error::{CodecError, CodecResult, RegistryFamily};
use crate::frame::{expect_structure_size, wire_u16, wire_u32, Direction, Frame, FrameContext};
use crate::oplock::{LeaseKey, LeaseState, OplockLevel};
use crate::registry::TypeRegistry;
use crate::status::Status;

/// Server-assigned identifier of an open.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct FileId {
    /// Survives reconnects.
    pub persistent: u64,
    /// Valid for the current connection only.
    pub volatile: u64,
}

impl FileId {
    /// Placeholder used by related compound members to refer to the handle
    /// opened earlier in the chain.
    pub const RELATED: FileId = FileId {
        persistent: u64::MAX,
        volatile: u64::MAX,
    };

    /// Builds a file id from its two halves.
    pub fn new(persistent: u64, volatile: u64) -> Self {
        Self { persistent, volatile }
    }
}

impl fmt::Debug for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FileId({self})")
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}:{:016x}", self.persistent, self.volatile)
    }
}

impl Frame for FileId {
    fn encode_body(&self, cursor: &mut WriteCursor<'_>, _ctx: &FrameContext) -> CodecResult<()> {
        cursor.encode_u64_le(self.persistent)?;
        cursor.encode_u64_le(self.volatile)
    }

    fn decode_body(cursor: &mut ReadCursor<'_>, _ctx: &FrameContext) -> CodecResult<Self> {
        Ok(Self {
            persistent: cursor.decode_u64_le()?,
            volatile: cursor.decode_u64_le()?,
        })
    }
}

/// Access mask bits.
pub mod access {
    /// Read data.
    pub const FILE_READ_DATA: u32 = 0x0000_0001;
    /// Write data.
    pub const FILE_WRITE_DATA: u32 = 0x0000_0002;
    /// Read attributes.
    pub const FILE_READ_ATTRIBUTES: u32 = 0x0000_0080;
    /// Delete.
    pub const DELETE: u32 = 0x0001_0000;
    /// Synchronize.
    pub const SYNCHRONIZE: u32 = 0x0010_0000;
    /// Everything the caller is allowed.
    pub const MAXIMUM_ALLOWED: u32 = 0x0200_0000;
    /// Generic all.
    pub const GENERIC_ALL: u32 = 0x1000_0000;
    /// Generic write.
    pub const GENERIC_WRITE: u32 = 0x4000_0000;
    /// Generic read.
    pub const GENERIC_READ: u32 = 0x8000_0000;
}

/// Share access bits.
pub mod share_access {
    /// Others may read.
    pub const READ: u32 = 0x01;
    /// Others may write.
    pub const WRITE: u32 = 0x02;
    /// Others may delete.
    pub const DELETE: u32 = 0x04;
}

/// Create dispositions.
pub mod disposition {
    /// Replace if it exists, create otherwise.
    pub const SUPERSEDE: u32 = 0;
    /// Open an existing file.
    pub const OPEN: u32 = 1;
    /// Create a new file; fail if it exists.
    pub const CREATE: u32 = 2;
    /// Open, or create if missing.
    pub const OPEN_IF: u32 = 3;
    /// Open and truncate.
    pub const OVERWRITE: u32 = 4;
    /// Open and truncate, or create.
    pub const OVERWRITE_IF: u32 = 5;
}

/// Create option bits.
pub mod create_options {
    /// Target must be a directory.
    pub const DIRECTORY_FILE: u32 = 0x0000_0001;
    /// Target must not be a directory.
    pub const NON_DIRECTORY_FILE: u32 = 0x0000_0040;
    /// Delete when the last handle closes.
    pub const DELETE_ON_CLOSE: u32 = 0x0000_1000;
}

/// Impersonation level: impersonation.
pub const IMPERSONATION_IMPERSONATION: u32 = 2;

/// Create action reported in the response.
pub mod create_action {
    /// An existing file was superseded.
    pub const SUPERSEDED: u32 = 0;
    /// An existing file was opened.
    pub const OPENED: u32 = 1;
    /// A new file was created.
    pub const CREATED: u32 = 2;
    /// An existing file was overwritten.
    pub const OVERWRITTEN: u32 = 3;
}

/// Durable v2 flag: request a persistent handle.
pub const DURABLE_V2_FLAG_PERSISTENT: u32 = 0x0000_0002;

/// Lease flag: the v2 parent key is meaningful.
pub const LEASE_FLAG_PARENT_LEASE_KEY_SET: u32 = 0x0000_0004;

/// Create context name tags.
pub mod tag {
    /// Lease request/response.
    pub const LEASE: [u8; 4] = *b"RqLs";
    /// Durable handle v1 request/response.
    pub const DURABLE_REQUEST: [u8; 4] = *b"DHnQ";
    /// Durable handle v2 request/response.
    pub const DURABLE_REQUEST_V2: [u8; 4] = *b"DH2Q";
    /// Durable handle v1 reconnect.
    pub const DURABLE_RECONNECT: [u8; 4] = *b"DHnC";
    /// Durable handle v2 reconnect.
    pub const DURABLE_RECONNECT_V2: [u8; 4] = *b"DH2C";
    /// Maximal access query/response.
    pub const MAXIMAL_ACCESS: [u8; 4] = *b"MxAc";
}

/// Version-2 lease fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LeaseV2 {
    /// Key of the parent directory's lease.
    pub parent_key: LeaseKey,
    /// Lease epoch.
    pub epoch: u16,
}

/// Lease request or grant carried in an `RqLs` context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaseContext {
    /// Lease identifier.
    pub key: LeaseKey,
    /// Requested or granted state.
    pub state: LeaseState,
    /// Lease flags.
    pub flags: u32,
    /// Present for 52-byte (v2) leases.
    pub v2: Option<LeaseV2>,
}

impl LeaseContext {
    const V1_SIZE: usize = 32;
    const V2_SIZE: usize = 52;
}

/// Durable v2 request fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DurableV2Request {
    /// Requested timeout in milliseconds (0 lets the server choose).
    pub timeout: u32,
    /// Durable flags.
    pub flags: u32,
    /// Client-chosen identifier used to replay the create.
    pub create_guid: Uuid,
}

/// One entry in a create-context chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CreateContext {
    /// `RqLs`, both directions.
    Lease(LeaseContext),
    /// `DHnQ` request.
    DurableRequest,
    /// `DHnQ` response.
    DurableResponse,
    /// `DH2Q` request.
    DurableRequestV2(DurableV2Request),
    /// `DH2Q` response.
    DurableResponseV2 {
        /// Granted timeout in milliseconds.
        timeout: u32,
        /// Granted flags.
        flags: u32,
    },
    /// `DHnC` request.
    DurableReconnect {
        /// The open being reclaimed.
        file_id: FileId,
    },
    /// `DH2C` request.
    DurableReconnectV2 {
        /// The open being reclaimed.
        file_id: FileId,
        /// Create guid of the original open.
        create_guid: Uuid,
        /// Durable flags of the original open.
        flags: u32,
    },
    /// `MxAc` request.
    MaximalAccessRequest {
        /// Optional point-in-time (FILETIME).
        timestamp: Option<u64>,
    },
    /// `MxAc` response.
    MaximalAccessResponse {
        /// Status of the maximal-access query.
        query_status: Status,
        /// Maximal access mask.
        maximal_access: u32,
    },
    /// Context with a tag this codec does not interpret.
    Other {
        /// Name bytes.
        name: Vec<u8>,
        /// Data bytes.
        data: Vec<u8>,
    },
}

impl CreateContext {
    /// Name tag of this context.
    pub fn name(&self) -> &[u8] {
        match self {
            CreateContext::Lease(_) => &tag::LEASE,
            CreateContext::DurableRequest | CreateContext::DurableResponse => &tag::DURABLE_REQUEST,
            CreateContext::DurableRequestV2(_) | CreateContext::DurableResponseV2 { .. } => {
                &tag::DURABLE_REQUEST_V2
            }
            CreateContext::DurableReconnect { .. } => &tag::DURABLE_RECONNECT,
            CreateContext::DurableReconnectV2 { .. } => &tag::DURABLE_RECONNECT_V2,
            CreateContext::MaximalAccessRequest { .. } | CreateContext::MaximalAccessResponse { .. } => {
                &tag::MAXIMAL_ACCESS
            }
            CreateContext::Other { name, .. } => name,
        }
    }

    fn encode_data(&self, cursor: &mut WriteCursor<'_>, ctx: &FrameContext) -> CodecResult<()> {
        match self {
            CreateContext::Lease(lease) => {
                cursor.encode_bytes(&lease.key.0)?;
                cursor.encode_u32_le(lease.state.0)?;
                cursor.encode_u32_le(lease.flags)?;
                cursor.encode_u64_le(0)?;
                if let Some(v2) = lease.v2 {
                    cursor.encode_bytes(&v2.parent_key.0)?;
                    cursor.encode_u16_le(v2.epoch)?;
                    cursor.encode_u16_le(0)?;
                }
                Ok(())
            }
            CreateContext::DurableRequest => cursor.encode_zeros(16),
            CreateContext::DurableResponse => cursor.encode_zeros(8),
            CreateContext::DurableRequestV2(request) => {
                cursor.encode_u32_le(request.timeout)?;
                cursor.encode_u32_le(request.flags)?;
                cursor.encode_u64_le(0)?;
                cursor.encode_bytes(&request.create_guid.to_bytes_le())
            }
            CreateContext::DurableResponseV2 { timeout, flags } => {
                cursor.encode_u32_le(*timeout)?;
                cursor.encode_u32_le(*flags)
            }
            CreateContext::DurableReconnect { file_id } => file_id.encode(cursor, ctx).map(|_| ()),
            CreateContext::DurableReconnectV2 {
                file_id,
                create_guid,
                flags,
            } => {
                file_id.encode(cursor, ctx)?;
                cursor.encode_bytes(&create_guid.to_bytes_le())?;
                cursor.encode_u32_le(*flags)
            }
            CreateContext::MaximalAccessRequest { timestamp } => match timestamp {
                Some(t) => cursor.encode_u64_le(*t),
                None => Ok(()),
            },
            CreateContext::MaximalAccessResponse {
                query_status,
                maximal_access,
            } => {
                cursor.encode_u32_le(query_status.0)?;
                cursor.encode_u32_le(*maximal_access)
            }
            CreateContext::Other { data, .. } => cursor.encode_bytes(data),
        }
    }
}

// Each decoder runs with the cursor windowed to exactly the context's data.

fn decode_lease(cursor: &mut ReadCursor<'_>, _ctx: &FrameContext) -> CodecResult<CreateContext> {
    let size = cursor.remaining();
    if size != LeaseContext::V1_SIZE && size != LeaseContext::V2_SIZE {
        return Err(CodecError::bad_packet(format!("lease context of {size} bytes")));
    }
    let key = LeaseKey::decode(cursor)?;
    let state = LeaseState(cursor.decode_u32_le()?);
    let flags = cursor.decode_u32_le()?;
    cursor.skip(8)?;
    let v2 = if size == LeaseContext::V2_SIZE {
        let parent_key = LeaseKey::decode(cursor)?;
        let epoch = cursor.decode_u16_le()?;
        cursor.skip(2)?;
        Some(LeaseV2 { parent_key, epoch })
    } else {
        None
    };
    Ok(CreateContext::Lease(LeaseContext { key, state, flags, v2 }))
}

fn decode_durable(cursor: &mut ReadCursor<'_>, ctx: &FrameContext) -> CodecResult<CreateContext> {
    let len = cursor.remaining();
    cursor.skip(len)?;
    Ok(match ctx.direction {
        Direction::Request => CreateContext::DurableRequest,
        Direction::Response => CreateContext::DurableResponse,
    })
}

fn decode_durable_v2(cursor: &mut ReadCursor<'_>, ctx: &FrameContext) -> CodecResult<CreateContext> {
    let timeout = cursor.decode_u32_le()?;
    let flags = cursor.decode_u32_le()?;
    match ctx.direction {
        Direction::Request => {
            cursor.skip(8)?;
            let create_guid = Uuid::from_bytes_le(cursor.decode_array()?);
            Ok(CreateContext::DurableRequestV2(DurableV2Request {
                timeout,
                flags,
                create_guid,
            }))
        }
        Direction::Response => Ok(CreateContext::DurableResponseV2 { timeout, flags }),
    }
}

fn decode_reconnect(cursor: &mut ReadCursor<'_>, ctx: &FrameContext) -> CodecResult<CreateContext> {
    Ok(CreateContext::DurableReconnect {
        file_id: FileId::decode(cursor, ctx)?,
    })
}

fn decode_reconnect_v2(cursor: &mut ReadCursor<'_>, ctx: &FrameContext) -> CodecResult<CreateContext> {
    let file_id = FileId::decode(cursor, ctx)?;
    let create_guid = Uuid::from_bytes_le(cursor.decode_array()?);
    let flags = cursor.decode_u32_le()?;
    Ok(CreateContext::DurableReconnectV2 {
        file_id,
        create_guid,
        flags,
    })
}

fn decode_maximal_access(cursor: &mut ReadCursor<'_>, ctx: &FrameContext) -> CodecResult<CreateContext> {
    match ctx.direction {
        Direction::Request => {
            let timestamp = if cursor.remaining() >= 8 {
                Some(cursor.decode_u64_le()?)
            } else {
                None
            };
            Ok(CreateContext::MaximalAccessRequest { timestamp })
        }
        Direction::Response => Ok(CreateContext::MaximalAccessResponse {
            query_status: Status(cursor.decode_u32_le()?),
            maximal_access: cursor.decode_u32_le()?,
        }),
    }
}

/// Registry of create-context decoders keyed by 4-byte name tag.
pub fn create_context_registry() -> &'static TypeRegistry<[u8; 4], CreateContext> {
    static REGISTRY: OnceLock<TypeRegistry<[u8; 4], CreateContext>> = OnceLock::new();
    REGISTRY.get_or_init(|| {
        TypeRegistry::builder(RegistryFamily::CreateContext)
            .register(tag::LEASE, decode_lease)
            .register(tag::DURABLE_REQUEST, decode_durable)
            .register(tag::DURABLE_REQUEST_V2, decode_durable_v2)
            .register(tag::DURABLE_RECONNECT, decode_reconnect)
            .register(tag::DURABLE_RECONNECT_V2, decode_reconnect_v2)
            .register(tag::MAXIMAL_ACCESS, decode_maximal_access)
            .build()
    })
}

/// Encodes a create-context chain at the cursor. Returns `(offset, length)`
/// relative to the owning message, or `(0, 0)` for an empty chain.
fn encode_context_chain(
    cursor: &mut WriteCursor<'_>,
    ctx: &FrameContext,
    contexts: &[CreateContext],
) -> CodecResult<(u32, u32)> {
    if contexts.is_empty() {
        return Ok((0, 0));
    }
    cursor.align(ctx.message_start, 8)?;
    let chain_start = cursor.position();
    let mut previous_next: Option<(Hole<u32>, Position)> = None;
    for context in contexts {
        if let Some((hole, entry_start)) = previous_next.take() {
            cursor.align(ctx.message_start, 8)?;
            let distance = wire_u32(cursor.position() - entry_start)?;
            hole.fill(cursor, distance)?;
        }
        let entry_start = cursor.position();
        let next = cursor.hole().encode_u32_le(0)?;
        cursor.encode_u16_le(16)?;
        cursor.encode_u16_le(wire_u16(context.name().len())?)?;
        cursor.encode_u16_le(0)?;
        let data_offset = cursor.hole().encode_u16_le(0)?;
        let data_length = cursor.hole().encode_u32_le(0)?;
        cursor.encode_bytes(context.name())?;
        cursor.align(entry_start, 8)?;
        let data_start = cursor.position();
        context.encode_data(cursor, ctx)?;
        let written = cursor.position() - data_start;
        if written > 0 {
            data_offset.fill(cursor, wire_u16(data_start - entry_start)?)?;
            data_length.fill(cursor, wire_u32(written)?)?;
        }
        previous_next = Some((next, entry_start));
    }
    let offset = wire_u32(ctx.relative(chain_start))?;
    let length = wire_u32(cursor.position() - chain_start)?;
    Ok((offset, length))
}

fn decode_context_chain(
    cursor: &mut ReadCursor<'_>,
    ctx: &FrameContext,
    offset: usize,
    length: usize,
) -> CodecResult<Vec<CreateContext>> {
    let mut contexts = Vec::new();
    if length == 0 {
        return Ok(contexts);
    }
    let chain_start = ctx.absolute(offset);
    cursor.seek(chain_start);
    cursor.scoped(length, |cursor| {
        loop {
            let entry_start = cursor.position();
            let next = cursor.decode_u32_le()? as usize;
            let name_offset = cursor.decode_u16_le()? as usize;
            let name_length = cursor.decode_u16_le()? as usize;
            cursor.skip(2)?;
            let data_offset = cursor.decode_u16_le()? as usize;
            let data_length = cursor.decode_u32_le()? as usize;
            let name = cursor.at(entry_start + name_offset).decode_bytes(name_length)?;
            let mut data = cursor.at(entry_start + data_offset);
            let context = data.scoped(data_length, |data| {
                let decoder = <[u8; 4]>::try_from(name)
                    .ok()
                    .and_then(|key| create_context_registry().lookup(key).ok());
                match decoder {
                    Some(decode) => decode(data, ctx),
                    None => Ok(CreateContext::Other {
                        name: name.to_vec(),
                        data: data.decode_bytes(data_length)?.to_vec(),
                    }),
                }
            })?;
            contexts.push(context);
            if next == 0 {
                cursor.seek(chain_start + length);
                return Ok(());
            }
            cursor.seek(entry_start + next);
        }
    })?;
    Ok(contexts)
}

/// CREATE request body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateRequest {
    /// Requested oplock level ([`OplockLevel::Lease`] when a lease context is attached).
    pub requested_oplock_level: OplockLevel,
    /// Impersonation level.
    pub impersonation_level: u32,
    /// Desired access mask.
    pub desired_access: u32,
    /// File attributes for a new file.
    pub file_attributes: u32,
    /// Share access bits.
    pub share_access: u32,
    /// Create disposition.
    pub create_disposition: u32,
    /// Create option bits.
    pub create_options: u32,
    /// Path relative to the share root.
    pub name: String,
    /// Attached create contexts.
    pub contexts: Vec<CreateContext>,
}

impl CreateRequest {
    const STRUCTURE_SIZE: u16 = 57;

    /// Opens (or creates) `name` for read and write with default sharing.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            requested_oplock_level: OplockLevel::None,
            impersonation_level: IMPERSONATION_IMPERSONATION,
            desired_access: access::GENERIC_READ | access::GENERIC_WRITE,
            file_attributes: 0,
            share_access: share_access::READ | share_access::WRITE | share_access::DELETE,
            create_disposition: disposition::OPEN_IF,
            create_options: create_options::NON_DIRECTORY_FILE,
            name: name.into(),
            contexts: Vec::new(),
        }
    }

    /// The lease context, if one is attached.
    pub fn lease(&self) -> Option<&LeaseContext> {
        self.contexts.iter().find_map(|c| match c {
            CreateContext::Lease(lease) => Some(lease),
            _ => None,
        })
    }
}

impl Frame for CreateRequest {
    fn encode_body(&self, cursor: &mut WriteCursor<'_>, ctx: &FrameContext) -> CodecResult<()> {
        cursor.encode_u16_le(Self::STRUCTURE_SIZE)?;
        cursor.encode_u8(0)?;
        cursor.encode_u8(self.requested_oplock_level as u8)?;
        cursor.encode_u32_le(self.impersonation_level)?;
        cursor.encode_u64_le(0)?;
        cursor.encode_u64_le(0)?;
        cursor.encode_u32_le(self.desired_access)?;
        cursor.encode_u32_le(self.file_attributes)?;
        cursor.encode_u32_le(self.share_access)?;
        cursor.encode_u32_le(self.create_disposition)?;
        cursor.encode_u32_le(self.create_options)?;
        let name_offset = cursor.hole().encode_u16_le(0)?;
        let name_length = cursor.hole().encode_u16_le(0)?;
        let contexts_offset = cursor.hole().encode_u32_le(0)?;
        let contexts_length = cursor.hole().encode_u32_le(0)?;
        let name_at = ctx.relative(cursor.position());
        let written = cursor.encode_utf16(&self.name)?;
        if written == 0 {
            // the buffer is never empty on the wire
            cursor.encode_u8(0)?;
        }
        name_offset.fill(cursor, wire_u16(name_at)?)?;
        name_length.fill(cursor, wire_u16(written)?)?;
        let (offset, length) = encode_context_chain(cursor, ctx, &self.contexts)?;
        contexts_offset.fill(cursor, offset)?;
        contexts_length.fill(cursor, length)
    }

    fn decode_body(cursor: &mut ReadCursor<'_>, ctx: &FrameContext) -> CodecResult<Self> {
        expect_structure_size(cursor, Self::STRUCTURE_SIZE)?;
        cursor.skip(1)?;
        let requested_oplock_level = OplockLevel::try_from(cursor.decode_u8()?)?;
        let impersonation_level = cursor.decode_u32_le()?;
        cursor.skip(16)?;
        let desired_access = cursor.decode_u32_le()?;
        let file_attributes = cursor.decode_u32_le()?;
        let share_access = cursor.decode_u32_le()?;
        let create_disposition = cursor.decode_u32_le()?;
        let create_options = cursor.decode_u32_le()?;
        let name_offset = cursor.decode_u16_le()? as usize;
        let name_length = cursor.decode_u16_le()? as usize;
        let contexts_offset = cursor.decode_u32_le()? as usize;
        let contexts_length = cursor.decode_u32_le()? as usize;
        let name = if name_length == 0 {
            cursor.skip(1)?;
            String::new()
        } else {
            cursor.seek(ctx.absolute(name_offset));
            cursor.decode_utf16(name_length)?
        };
        let contexts = decode_context_chain(cursor, ctx, contexts_offset, contexts_length)?;
        Ok(Self {
            requested_oplock_level,
            impersonation_level,
            desired_access,
            file_attributes,
            share_access,
            create_disposition,
            create_options,
            name,
            contexts,
        })
    }
}

/// Timestamps and sizes reported by create and close responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FileAttributes {
    /// Creation time (FILETIME).
    pub creation_time: u64,
    /// Last access time.
    pub last_access_time: u64,
    /// Last write time.
    pub last_write_time: u64,
    /// Change time.
    pub change_time: u64,
    /// Allocation size.
    pub allocation_size: u64,
    /// End of file.
    pub end_of_file: u64,
    /// Attribute bits.
    pub file_attributes: u32,
}

impl FileAttributes {
    pub(crate) fn encode_times(&self, cursor: &mut WriteCursor<'_>) -> CodecResult<()> {
        for value in [
            self.creation_time,
            self.last_access_time,
            self.last_write_time,
            self.change_time,
            self.allocation_size,
            self.end_of_file,
        ] {
            cursor.encode_u64_le(value)?;
        }
        cursor.encode_u32_le(self.file_attributes)
    }

    pub(crate) fn decode_times(cursor: &mut ReadCursor<'_>) -> CodecResult<Self> {
        Ok(Self {
            creation_time: cursor.decode_u64_le()?,
            last_access_time: cursor.decode_u64_le()?,
            last_write_time: cursor.decode_u64_le()?,
            change_time: cursor.decode_u64_le()?,
            allocation_size: cursor.decode_u64_le()?,
            end_of_file: cursor.decode_u64_le()?,
            file_attributes: cursor.decode_u32_le()?,
        })
    }
}

/// CREATE response body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateResponse {
    /// Granted oplock level.
    pub oplock_level: OplockLevel,
    /// Response flags.
    pub flags: u8,
    /// What the server did (see [`create_action`]).
    pub create_action: u32,
    /// Timestamps, sizes and attributes.
    pub attributes: FileAttributes,
    /// The new open.
    pub file_id: FileId,
    /// Returned create contexts.
    pub contexts: Vec<CreateContext>,
}

impl CreateResponse {
    const STRUCTURE_SIZE: u16 = 89;

    /// The granted lease, if any.
    pub fn lease(&self) -> Option<&LeaseContext> {
        self.contexts.iter().find_map(|c| match c {
            CreateContext::Lease(lease) => Some(lease),
            _ => None,
        })
    }

    /// Whether the server granted a durable (v1 or v2) handle.
    pub fn durable_granted(&self) -> Option<(u32, u32)> {
        self.contexts.iter().find_map(|c| match c {
            CreateContext::DurableResponse => Some((0, 0)),
            CreateContext::DurableResponseV2 { timeout, flags } => Some((*timeout, *flags)),
            _ => None,
        })
    }

    /// The maximal access mask, if the server answered an `MxAc` query.
    pub fn maximal_access(&self) -> Option<u32> {
        self.contexts.iter().find_map(|c| match c {
            CreateContext::MaximalAccessResponse {
                query_status,
                maximal_access,
            } if query_status.is_success() => Some(*maximal_access),
            _ => None,
        })
    }
}

impl Frame for CreateResponse {
    fn encode_body(&self, cursor: &mut WriteCursor<'_>, ctx: &FrameContext) -> CodecResult<()> {
        cursor.encode_u16_le(Self::STRUCTURE_SIZE)?;
        cursor.encode_u8(self.oplock_level as u8)?;
        cursor.encode_u8(self.flags)?;
        cursor.encode_u32_le(self.create_action)?;
        self.attributes.encode_times(cursor)?;
        cursor.encode_u32_le(0)?;
        self.file_id.encode(cursor, ctx)?;
        let contexts_offset = cursor.hole().encode_u32_le(0)?;
        let contexts_length = cursor.hole().encode_u32_le(0)?;
        let (offset, length) = encode_context_chain(cursor, ctx, &self.contexts)?;
        contexts_offset.fill(cursor, offset)?;
        contexts_length.fill(cursor, length)
    }

    fn decode_body(cursor: &mut ReadCursor<'_>, ctx: &FrameContext) -> CodecResult<Self> {
        expect_structure_size(cursor, Self::STRUCTURE_SIZE)?;
        let oplock_level = OplockLevel::try_from(cursor.decode_u8()?)?;
        let flags = cursor.decode_u8()?;
        let create_action = cursor.decode_u32_le()?;
        let attributes = FileAttributes::decode_times(cursor)?;
        cursor.skip(4)?;
        let file_id = FileId::decode(cursor, ctx)?;
        let contexts_offset = cursor.decode_u32_le()? as usize;
        let contexts_length = cursor.decode_u32_le()? as usize;
        let contexts = decode_context_chain(cursor, ctx, contexts_offset, contexts_length)?;
        Ok(Self {
            oplock_level,
            flags,
            create_action,
            attributes,
            file_id,
            contexts,
        })
    }
}

/// Builds a context whose tag is passed through uninterpreted.
pub fn raw_context(name: &[u8], data: &[u8]) -> CreateContext {
    CreateContext::Other {
        name: name.to_vec(),
        data: data.to_vec(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cursor::{ByteBuffer, Position};

    fn request_ctx() -> FrameContext {
        FrameContext::request(Position(0))
    }

    fn response_ctx() -> FrameContext {
        FrameContext::response(Position(0), Status::SUCCESS)
    }

    #[test]
    fn test_create_request_with_contexts_roundtrip() {
        let mut request = CreateRequest::new("dir\\file.txt");
        request.requested_oplock_level = OplockLevel::Lease;
        request.contexts = vec![
            CreateContext::Lease(LeaseContext {
                key: LeaseKey::from_u128(7),
                state: LeaseState::RWH,
                flags: 0,
                v2: Some(LeaseV2 {
                    parent_key: LeaseKey::default(),
                    epoch: 1,
                }),
            }),
            CreateContext::DurableRequestV2(DurableV2Request {
                timeout: 0,
                flags: DURABLE_V2_FLAG_PERSISTENT,
                create_guid: Uuid::from_u128(42),
            }),
            CreateContext::MaximalAccessRequest { timestamp: None },
            raw_context(b"SecD", &[1, 2, 3, 4, 5]),
        ];
        let mut buf = ByteBuffer::new();
        request.encode(&mut WriteCursor::new(&mut buf), &request_ctx()).unwrap();
        let decoded = CreateRequest::decode(&mut ReadCursor::new(buf.as_slice()), &request_ctx()).unwrap();
        assert_eq!(decoded, request);
        assert_eq!(decoded.lease().map(|l| l.key), Some(LeaseKey::from_u128(7)));
    }

    #[test]
    fn test_context_entries_are_aligned() {
        let mut request = CreateRequest::new("a");
        request.contexts = vec![raw_context(b"AAAA", &[9; 3]), raw_context(b"BBBB", &[8; 5])];
        let mut buf = ByteBuffer::new();
        request.encode(&mut WriteCursor::new(&mut buf), &request_ctx()).unwrap();
        let bytes = buf.as_slice();
        let offset = u32::from_le_bytes(bytes[48..52].try_into().unwrap()) as usize;
        assert_eq!(offset % 8, 0);
        let next = u32::from_le_bytes(bytes[offset..offset + 4].try_into().unwrap()) as usize;
        assert_eq!(next % 8, 0);
        assert_eq!(&bytes[offset + next + 16..offset + next + 20], b"BBBB");
    }

    #[test]
    fn test_create_response_accessors() {
        let response = CreateResponse {
            oplock_level: OplockLevel::Lease,
            flags: 0,
            create_action: create_action::CREATED,
            attributes: FileAttributes {
                end_of_file: 10,
                ..Default::default()
            },
            file_id: FileId::new(1, 2),
            contexts: vec![
                CreateContext::Lease(LeaseContext {
                    key: LeaseKey::from_u128(7),
                    state: LeaseState(LeaseState::READ),
                    flags: 0,
                    v2: None,
                }),
                CreateContext::DurableResponse,
                CreateContext::MaximalAccessResponse {
                    query_status: Status::SUCCESS,
                    maximal_access: 0x001F_01FF,
                },
            ],
        };
        let mut buf = ByteBuffer::new();
        response.encode(&mut WriteCursor::new(&mut buf), &response_ctx()).unwrap();
        let decoded = CreateResponse::decode(&mut ReadCursor::new(buf.as_slice()), &response_ctx()).unwrap();
        assert_eq!(decoded, response);
        assert_eq!(decoded.durable_granted(), Some((0, 0)));
        assert_eq!(decoded.maximal_access(), Some(0x001F_01FF));
    }

    #[test]
    fn test_bad_lease_size_is_rejected() {
        let mut request = CreateRequest::new("x");
        request.contexts = vec![raw_context(b"RqLs", &[0; 12])];
        let mut buf = ByteBuffer::new();
        request.encode(&mut WriteCursor::new(&mut buf), &request_ctx()).unwrap();
        let err = CreateRequest::decode(&mut ReadCursor::new(buf.as_slice()), &request_ctx()).unwrap_err();
        assert!(matches!(err, CodecError::BadPacket { .. }));
    }
}
