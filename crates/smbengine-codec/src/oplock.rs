//! Oplock and lease state, and the break notification/acknowledgement bodies.

use std::fmt;

use crate::create::FileId;
use crate::cursor::{ReadCursor, WriteCursor};
use crate::error::{CodecError, CodecResult};
use crate::frame::{expect_structure_size, Frame, FrameContext};

/// Oplock levels carried by create and break messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
#[repr(u8)]
pub enum OplockLevel {
    /// No oplock.
    #[default]
    None = 0x00,
    /// Shared read caching.
    LevelII = 0x01,
    /// Exclusive read/write caching.
    Exclusive = 0x08,
    /// Exclusive caching that also survives close.
    Batch = 0x09,
    /// Caching is governed by a lease context.
    Lease = 0xFF,
}

impl TryFrom<u8> for OplockLevel {
    type Error = CodecError;

    fn try_from(code: u8) -> CodecResult<Self> {
        match code {
            0x00 => Ok(OplockLevel::None),
            0x01 => Ok(OplockLevel::LevelII),
            0x08 => Ok(OplockLevel::Exclusive),
            0x09 => Ok(OplockLevel::Batch),
            0xFF => Ok(OplockLevel::Lease),
            other => Err(CodecError::bad_packet(format!("unknown oplock level 0x{other:02X}"))),
        }
    }
}

/// 16-byte client-chosen lease identifier.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct LeaseKey(pub [u8; 16]);

impl LeaseKey {
    /// Lease key from a 128-bit integer, stored little-endian.
    pub fn from_u128(value: u128) -> Self {
        Self(value.to_le_bytes())
    }

    pub(crate) fn decode(cursor: &mut ReadCursor<'_>) -> CodecResult<Self> {
        cursor.decode_array().map(Self)
    }
}

impl fmt::Debug for LeaseKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LeaseKey({self})")
    }
}

impl fmt::Display for LeaseKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

/// Lease caching state bits (read, handle, write).
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct LeaseState(pub u32);

impl LeaseState {
    /// No caching.
    pub const NONE: LeaseState = LeaseState(0);
    /// Read caching.
    pub const READ: u32 = 0x01;
    /// Handle caching.
    pub const HANDLE: u32 = 0x02;
    /// Write caching.
    pub const WRITE: u32 = 0x04;
    /// Read, handle and write caching.
    pub const RWH: LeaseState = LeaseState(0x07);

    /// Whether every bit in `bits` is granted.
    pub fn contains(self, bits: u32) -> bool {
        self.0 & bits == bits
    }

    /// Whether nothing is cached.
    pub fn is_none(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Debug for LeaseState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LeaseState({self})")
    }
}

impl fmt::Display for LeaseState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            return f.write_str("none");
        }
        for (bit, c) in [(Self::READ, 'R'), (Self::WRITE, 'W'), (Self::HANDLE, 'H')] {
            if self.contains(bit) {
                write!(f, "{c}")?;
            }
        }
        Ok(())
    }
}

/// Oplock break notification, acknowledgement and response share one layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OplockBreak {
    /// New (notification/response) or accepted (acknowledgement) level.
    pub oplock_level: OplockLevel,
    /// The broken open.
    pub file_id: FileId,
}

impl OplockBreak {
    const STRUCTURE_SIZE: u16 = 24;
}

impl Frame for OplockBreak {
    fn encode_body(&self, cursor: &mut WriteCursor<'_>, ctx: &FrameContext) -> CodecResult<()> {
        cursor.encode_u16_le(Self::STRUCTURE_SIZE)?;
        cursor.encode_u8(self.oplock_level as u8)?;
        cursor.encode_u8(0)?;
        cursor.encode_u32_le(0)?;
        self.file_id.encode(cursor, ctx).map(|_| ())
    }

    fn decode_body(cursor: &mut ReadCursor<'_>, ctx: &FrameContext) -> CodecResult<Self> {
        expect_structure_size(cursor, Self::STRUCTURE_SIZE)?;
        let oplock_level = OplockLevel::try_from(cursor.decode_u8()?)?;
        cursor.skip(5)?;
        Ok(Self {
            oplock_level,
            file_id: FileId::decode(cursor, ctx)?,
        })
    }
}

/// Lease break notification flag: the client must acknowledge.
pub const LEASE_BREAK_ACK_REQUIRED: u32 = 0x0000_0001;

/// Server notification that a lease is being downgraded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseBreakNotification {
    /// Lease epoch after the break (v2 leases).
    pub new_epoch: u16,
    /// Notification flags.
    pub flags: u32,
    /// Lease being broken.
    pub lease_key: LeaseKey,
    /// State before the break.
    pub current_state: LeaseState,
    /// State the server is breaking to.
    pub new_state: LeaseState,
}

impl LeaseBreakNotification {
    const STRUCTURE_SIZE: u16 = 44;

    /// Whether the server waits for an acknowledgement.
    pub fn ack_required(&self) -> bool {
        self.flags & LEASE_BREAK_ACK_REQUIRED != 0
    }
}

impl Frame for LeaseBreakNotification {
    fn encode_body(&self, cursor: &mut WriteCursor<'_>, _ctx: &FrameContext) -> CodecResult<()> {
        cursor.encode_u16_le(Self::STRUCTURE_SIZE)?;
        cursor.encode_u16_le(self.new_epoch)?;
        cursor.encode_u32_le(self.flags)?;
        cursor.encode_bytes(&self.lease_key.0)?;
        cursor.encode_u32_le(self.current_state.0)?;
        cursor.encode_u32_le(self.new_state.0)?;
        // break reason, access mask hint, share mask hint
        cursor.encode_zeros(12)
    }

    fn decode_body(cursor: &mut ReadCursor<'_>, _ctx: &FrameContext) -> CodecResult<Self> {
        expect_structure_size(cursor, Self::STRUCTURE_SIZE)?;
        let new_epoch = cursor.decode_u16_le()?;
        let flags = cursor.decode_u32_le()?;
        let lease_key = LeaseKey::decode(cursor)?;
        let current_state = LeaseState(cursor.decode_u32_le()?);
        let new_state = LeaseState(cursor.decode_u32_le()?);
        cursor.skip(12)?;
        Ok(Self {
            new_epoch,
            flags,
            lease_key,
            current_state,
            new_state,
        })
    }
}

/// Lease break acknowledgement (request) and its response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseBreakAck {
    /// Acknowledged lease.
    pub lease_key: LeaseKey,
    /// State the client keeps.
    pub lease_state: LeaseState,
}

impl LeaseBreakAck {
    const STRUCTURE_SIZE: u16 = 36;
}

impl Frame for LeaseBreakAck {
    fn encode_body(&self, cursor: &mut WriteCursor<'_>, _ctx: &FrameContext) -> CodecResult<()> {
        cursor.encode_u16_le(Self::STRUCTURE_SIZE)?;
        cursor.encode_u16_le(0)?;
        cursor.encode_u32_le(0)?;
        cursor.encode_bytes(&self.lease_key.0)?;
        cursor.encode_u32_le(self.lease_state.0)?;
        cursor.encode_u64_le(0)
    }

    fn decode_body(cursor: &mut ReadCursor<'_>, _ctx: &FrameContext) -> CodecResult<Self> {
        expect_structure_size(cursor, Self::STRUCTURE_SIZE)?;
        cursor.skip(6)?;
        let lease_key = LeaseKey::decode(cursor)?;
        let lease_state = LeaseState(cursor.decode_u32_le()?);
        cursor.skip(8)?;
        Ok(Self { lease_key, lease_state })
    }
}
