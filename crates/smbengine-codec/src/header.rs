//! The 64-byte SMB2 message header.

use std::fmt;

use crate::cursor::{ReadCursor, WriteCursor};
use crate::error::{CodecError, CodecResult};
use crate::frame::{Frame, FrameContext};
use crate::status::Status;

/// Protocol identifier of a plain SMB2 message.
pub const SMB2_MAGIC: [u8; 4] = [0xFE, b'S', b'M', b'B'];

/// Size of the SMB2 header in bytes.
pub const HEADER_SIZE: usize = 64;

/// Offset of the signature field within the header.
pub const SIGNATURE_OFFSET: usize = 48;

/// Message id carried by unsolicited server notifications.
pub const UNSOLICITED_MESSAGE_ID: u64 = u64::MAX;

/// SMB2 command codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u16)]
pub enum Command {
    /// Dialect negotiation.
    Negotiate = 0x0000,
    /// Authentication round.
    SessionSetup = 0x0001,
    /// Session teardown.
    Logoff = 0x0002,
    /// Share connection.
    TreeConnect = 0x0003,
    /// Share disconnection.
    TreeDisconnect = 0x0004,
    /// Open or create a file.
    Create = 0x0005,
    /// Close a handle.
    Close = 0x0006,
    /// Flush cached data.
    Flush = 0x0007,
    /// Read data.
    Read = 0x0008,
    /// Write data.
    Write = 0x0009,
    /// Byte-range locking.
    Lock = 0x000A,
    /// Device/file-system control.
    Ioctl = 0x000B,
    /// Cancel an outstanding request.
    Cancel = 0x000C,
    /// Keep-alive.
    Echo = 0x000D,
    /// Directory enumeration.
    QueryDirectory = 0x000E,
    /// Change notification.
    ChangeNotify = 0x000F,
    /// Query metadata.
    QueryInfo = 0x0010,
    /// Set metadata.
    SetInfo = 0x0011,
    /// Oplock or lease break notification/acknowledgement.
    OplockBreak = 0x0012,
}

impl TryFrom<u16> for Command {
    type Error = CodecError;

    fn try_from(code: u16) -> CodecResult<Self> {
        let command = match code {
            0x0000 => Command::Negotiate,
            0x0001 => Command::SessionSetup,
            0x0002 => Command::Logoff,
            0x0003 => Command::TreeConnect,
            0x0004 => Command::TreeDisconnect,
            0x0005 => Command::Create,
            0x0006 => Command::Close,
            0x0007 => Command::Flush,
            0x0008 => Command::Read,
            0x0009 => Command::Write,
            0x000A => Command::Lock,
            0x000B => Command::Ioctl,
            0x000C => Command::Cancel,
            0x000D => Command::Echo,
            0x000E => Command::QueryDirectory,
            0x000F => Command::ChangeNotify,
            0x0010 => Command::QueryInfo,
            0x0011 => Command::SetInfo,
            0x0012 => Command::OplockBreak,
            other => return Err(CodecError::bad_packet(format!("unknown command 0x{other:04X}"))),
        };
        Ok(command)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Header flag bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct HeaderFlags(pub u32);

impl HeaderFlags {
    /// Set on every server-to-client message.
    pub const SERVER_TO_REDIR: u32 = 0x0000_0001;
    /// Header carries an async id instead of a tree id.
    pub const ASYNC_COMMAND: u32 = 0x0000_0002;
    /// Compound member operating on the previous member's handle.
    pub const RELATED_OPERATIONS: u32 = 0x0000_0004;
    /// Message is signed.
    pub const SIGNED: u32 = 0x0000_0008;
    /// Priority bits.
    pub const PRIORITY_MASK: u32 = 0x0000_0070;
    /// DFS path operation.
    pub const DFS_OPERATIONS: u32 = 0x1000_0000;
    /// Replay of a previously sent request.
    pub const REPLAY_OPERATION: u32 = 0x2000_0000;

    /// Empty flag set.
    pub fn empty() -> Self {
        Self(0)
    }

    /// Whether every bit in `bits` is set.
    pub fn contains(self, bits: u32) -> bool {
        self.0 & bits == bits
    }

    /// Sets or clears `bits`.
    pub fn set(&mut self, bits: u32, on: bool) {
        if on {
            self.0 |= bits;
        } else {
            self.0 &= !bits;
        }
    }

    /// Whether this is a response.
    pub fn is_response(self) -> bool {
        self.contains(Self::SERVER_TO_REDIR)
    }

    /// Whether the header uses async addressing.
    pub fn is_async(self) -> bool {
        self.contains(Self::ASYNC_COMMAND)
    }

    /// Whether the message belongs to a related compound chain.
    pub fn is_related(self) -> bool {
        self.contains(Self::RELATED_OPERATIONS)
    }

    /// Whether the message is signed.
    pub fn is_signed(self) -> bool {
        self.contains(Self::SIGNED)
    }
}

/// How a header addresses its target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Addressing {
    /// Synchronous message bound to a tree.
    Sync {
        /// Process id (reserved, echoed by servers).
        process_id: u32,
        /// Tree the message operates on.
        tree_id: u32,
    },
    /// Asynchronous message identified by the server-assigned async id.
    Async {
        /// Async id from an interim response.
        async_id: u64,
    },
}

impl Default for Addressing {
    fn default() -> Self {
        Addressing::Sync {
            process_id: 0xFEFF,
            tree_id: 0,
        }
    }
}

/// Fixed SMB2 header preceding every sub-message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    /// Credits consumed by this message.
    pub credit_charge: u16,
    /// Response status; for requests the low 16 bits carry the channel sequence.
    pub status: Status,
    /// Command code.
    pub command: Command,
    /// Credits requested (request) or granted (response).
    pub credits: u16,
    /// Flag bits. The async bit is derived from `addressing` when encoding.
    pub flags: HeaderFlags,
    /// Offset from this header to the next compounded header, or 0.
    pub next_command: u32,
    /// Message id used to correlate the response.
    pub message_id: u64,
    /// Tree id or async id.
    pub addressing: Addressing,
    /// Session the message belongs to.
    pub session_id: u64,
    /// Message signature.
    pub signature: [u8; 16],
}

impl Header {
    /// A request header for `command` with every other field defaulted.
    pub fn request(command: Command) -> Self {
        Self {
            credit_charge: 1,
            status: Status::SUCCESS,
            command,
            credits: 1,
            flags: HeaderFlags::empty(),
            next_command: 0,
            message_id: 0,
            addressing: Addressing::default(),
            session_id: 0,
            signature: [0; 16],
        }
    }

    /// Tree id, when synchronously addressed.
    pub fn tree_id(&self) -> Option<u32> {
        match self.addressing {
            Addressing::Sync { tree_id, .. } => Some(tree_id),
            Addressing::Async { .. } => None,
        }
    }

    /// Async id, when asynchronously addressed.
    pub fn async_id(&self) -> Option<u64> {
        match self.addressing {
            Addressing::Async { async_id } => Some(async_id),
            Addressing::Sync { .. } => None,
        }
    }

    /// Sets the tree id, switching to synchronous addressing.
    pub fn set_tree_id(&mut self, tree_id: u32) {
        self.addressing = Addressing::Sync {
            process_id: 0xFEFF,
            tree_id,
        };
    }

    /// Channel sequence carried by a request.
    pub fn channel_sequence(&self) -> u16 {
        (self.status.0 & 0xFFFF) as u16
    }

    /// Whether this header marks an interim async response.
    pub fn is_interim(&self) -> bool {
        self.flags.is_async() && self.status == Status::PENDING
    }

    /// Whether this is an unsolicited server notification.
    pub fn is_unsolicited(&self) -> bool {
        self.message_id == UNSOLICITED_MESSAGE_ID
    }
}

impl Frame for Header {
    fn encode_body(&self, cursor: &mut WriteCursor<'_>, _ctx: &FrameContext) -> CodecResult<()> {
        let mut flags = self.flags;
        flags.set(HeaderFlags::ASYNC_COMMAND, matches!(self.addressing, Addressing::Async { .. }));
        cursor.encode_bytes(&SMB2_MAGIC)?;
        cursor.encode_u16_le(HEADER_SIZE as u16)?;
        cursor.encode_u16_le(self.credit_charge)?;
        cursor.encode_u32_le(self.status.0)?;
        cursor.encode_u16_le(self.command as u16)?;
        cursor.encode_u16_le(self.credits)?;
        cursor.encode_u32_le(flags.0)?;
        cursor.encode_u32_le(self.next_command)?;
        cursor.encode_u64_le(self.message_id)?;
        match self.addressing {
            Addressing::Sync { process_id, tree_id } => {
                cursor.encode_u32_le(process_id)?;
                cursor.encode_u32_le(tree_id)?;
            }
            Addressing::Async { async_id } => cursor.encode_u64_le(async_id)?,
        }
        cursor.encode_u64_le(self.session_id)?;
        cursor.encode_bytes(&self.signature)
    }

    fn decode_body(cursor: &mut ReadCursor<'_>, _ctx: &FrameContext) -> CodecResult<Self> {
        let magic: [u8; 4] = cursor.decode_array()?;
        if magic != SMB2_MAGIC {
            return Err(CodecError::bad_packet(format!("bad protocol id {magic:02X?}")));
        }
        let size = cursor.decode_u16_le()?;
        if size as usize != HEADER_SIZE {
            return Err(CodecError::bad_packet(format!("header structure size {size}, expected 64")));
        }
        let credit_charge = cursor.decode_u16_le()?;
        let status = Status(cursor.decode_u32_le()?);
        let command = Command::try_from(cursor.decode_u16_le()?)?;
        let credits = cursor.decode_u16_le()?;
        let flags = HeaderFlags(cursor.decode_u32_le()?);
        let next_command = cursor.decode_u32_le()?;
        let message_id = cursor.decode_u64_le()?;
        let addressing = if flags.is_async() {
            Addressing::Async {
                async_id: cursor.decode_u64_le()?,
            }
        } else {
            Addressing::Sync {
                process_id: cursor.decode_u32_le()?,
                tree_id: cursor.decode_u32_le()?,
            }
        };
        let session_id = cursor.decode_u64_le()?;
        let signature = cursor.decode_array()?;
        Ok(Self {
            credit_charge,
            status,
            command,
            credits,
            flags,
            next_command,
            message_id,
            addressing,
            session_id,
            signature,
        })
    }
}
