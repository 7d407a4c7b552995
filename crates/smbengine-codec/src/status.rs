//! NTSTATUS values carried in response headers.

use std::fmt;

/// A raw NTSTATUS code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Status(pub u32);

impl Status {
    const SEVERITY_MASK: u32 = 0xC000_0000;

    /// Operation completed.
    pub const SUCCESS: Status = Status(0x0000_0000);
    /// Interim response: the operation continues asynchronously.
    pub const PENDING: Status = Status(0x0000_0103);
    /// Notification that a change-notify request was cleaned up.
    pub const NOTIFY_CLEANUP: Status = Status(0x0000_010B);
    /// Notify buffer overflowed; the client must enumerate the directory.
    pub const NOTIFY_ENUM_DIR: Status = Status(0x0000_010C);
    /// Data returned is truncated to the supplied buffer.
    pub const BUFFER_OVERFLOW: Status = Status(0x8000_0005);
    /// Directory enumeration finished.
    pub const NO_MORE_FILES: Status = Status(0x8000_0006);
    /// Generic failure.
    pub const UNSUCCESSFUL: Status = Status(0xC000_0001);
    /// Request not implemented by the server.
    pub const NOT_IMPLEMENTED: Status = Status(0xC000_0002);
    /// Handle does not refer to an open file.
    pub const INVALID_HANDLE: Status = Status(0xC000_0008);
    /// A parameter was invalid.
    pub const INVALID_PARAMETER: Status = Status(0xC000_000D);
    /// File does not exist.
    pub const NO_SUCH_FILE: Status = Status(0xC000_000F);
    /// Another session-setup round is required.
    pub const MORE_PROCESSING_REQUIRED: Status = Status(0xC000_0016);
    /// Access denied.
    pub const ACCESS_DENIED: Status = Status(0xC000_0022);
    /// Named object not found.
    pub const OBJECT_NAME_NOT_FOUND: Status = Status(0xC000_0034);
    /// Named object already exists.
    pub const OBJECT_NAME_COLLISION: Status = Status(0xC000_0035);
    /// Path not found.
    pub const OBJECT_PATH_NOT_FOUND: Status = Status(0xC000_003A);
    /// Sharing violation.
    pub const SHARING_VIOLATION: Status = Status(0xC000_0043);
    /// Read past end of file.
    pub const END_OF_FILE: Status = Status(0xC000_0011);
    /// Bad credentials.
    pub const LOGON_FAILURE: Status = Status(0xC000_006D);
    /// Share name not found.
    pub const BAD_NETWORK_NAME: Status = Status(0xC000_00CC);
    /// The request was cancelled.
    pub const CANCELLED: Status = Status(0xC000_0120);
    /// Oplock/lease break was not expected by the server.
    pub const INVALID_OPLOCK_PROTOCOL: Status = Status(0xC000_00E3);
    /// File was closed.
    pub const FILE_CLOSED: Status = Status(0xC000_0128);
    /// Session id is unknown to the server.
    pub const USER_SESSION_DELETED: Status = Status(0xC000_0203);
    /// Session expired and must be re-authenticated.
    pub const NETWORK_SESSION_EXPIRED: Status = Status(0xC000_035C);
    /// Not supported.
    pub const NOT_SUPPORTED: Status = Status(0xC000_00BB);

    /// Whether the severity bits indicate success.
    pub fn is_success(self) -> bool {
        self.0 & Self::SEVERITY_MASK == 0
    }

    /// Whether the severity bits indicate an error.
    pub fn is_error(self) -> bool {
        self.0 & Self::SEVERITY_MASK == 0xC000_0000
    }

    /// Whether the severity bits indicate a warning.
    pub fn is_warning(self) -> bool {
        self.0 & Self::SEVERITY_MASK == 0x8000_0000
    }

    /// Short symbolic name for known codes.
    pub fn name(self) -> Option<&'static str> {
        let name = match self {
            Status::SUCCESS => "STATUS_SUCCESS",
            Status::PENDING => "STATUS_PENDING",
            Status::NOTIFY_CLEANUP => "STATUS_NOTIFY_CLEANUP",
            Status::NOTIFY_ENUM_DIR => "STATUS_NOTIFY_ENUM_DIR",
            Status::BUFFER_OVERFLOW => "STATUS_BUFFER_OVERFLOW",
            Status::NO_MORE_FILES => "STATUS_NO_MORE_FILES",
            Status::UNSUCCESSFUL => "STATUS_UNSUCCESSFUL",
            Status::NOT_IMPLEMENTED => "STATUS_NOT_IMPLEMENTED",
            Status::INVALID_HANDLE => "STATUS_INVALID_HANDLE",
            Status::INVALID_PARAMETER => "STATUS_INVALID_PARAMETER",
            Status::NO_SUCH_FILE => "STATUS_NO_SUCH_FILE",
            Status::MORE_PROCESSING_REQUIRED => "STATUS_MORE_PROCESSING_REQUIRED",
            Status::ACCESS_DENIED => "STATUS_ACCESS_DENIED",
            Status::OBJECT_NAME_NOT_FOUND => "STATUS_OBJECT_NAME_NOT_FOUND",
            Status::OBJECT_NAME_COLLISION => "STATUS_OBJECT_NAME_COLLISION",
            Status::OBJECT_PATH_NOT_FOUND => "STATUS_OBJECT_PATH_NOT_FOUND",
            Status::SHARING_VIOLATION => "STATUS_SHARING_VIOLATION",
            Status::END_OF_FILE => "STATUS_END_OF_FILE",
            Status::LOGON_FAILURE => "STATUS_LOGON_FAILURE",
            Status::BAD_NETWORK_NAME => "STATUS_BAD_NETWORK_NAME",
            Status::CANCELLED => "STATUS_CANCELLED",
            Status::INVALID_OPLOCK_PROTOCOL => "STATUS_INVALID_OPLOCK_PROTOCOL",
            Status::FILE_CLOSED => "STATUS_FILE_CLOSED",
            Status::USER_SESSION_DELETED => "STATUS_USER_SESSION_DELETED",
            Status::NETWORK_SESSION_EXPIRED => "STATUS_NETWORK_SESSION_EXPIRED",
            Status::NOT_SUPPORTED => "STATUS_NOT_SUPPORTED",
            _ => return None,
        };
        Some(name)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => write!(f, "{name} (0x{:08X})", self.0),
            None => write!(f, "0x{:08X}", self.0),
        }
    }
}

impl From<u32> for Status {
    fn from(code: u32) -> Self {
        Status(code)
    }
}
