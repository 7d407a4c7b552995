//! Error types for the codec layer.

use thiserror::Error;

/// Result type alias for encode/decode operations.
pub type CodecResult<T> = Result<T, CodecError>;

/// Which side of the active cursor window an access violated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bound {
    /// The access started before the window's lower bound.
    Lower,
    /// The access ended past the window's upper bound.
    Upper,
}

impl std::fmt::Display for Bound {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Bound::Lower => write!(f, "lower"),
            Bound::Upper => write!(f, "upper"),
        }
    }
}

/// Registry family a discriminator lookup was performed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryFamily {
    /// Message bodies, keyed by command, direction and structure size.
    Body,
    /// Negotiate contexts, keyed by context type.
    NegotiateContext,
    /// Create contexts, keyed by name tag.
    CreateContext,
}

/// Error variants for encode and decode operations.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CodecError {
    /// An access fell outside the active `[lower, upper)` window.
    #[error("buffer overrun: {size} bytes at offset {offset} violates {bound} bound of [{lower}, {upper})")]
    BufferOverrun {
        /// Offset the access started at.
        offset: usize,
        /// Number of bytes accessed.
        size: usize,
        /// Active lower bound.
        lower: usize,
        /// Active upper bound.
        upper: usize,
        /// The violated side.
        bound: Bound,
    },

    /// Structural validation failed.
    #[error("bad packet: {reason}")]
    BadPacket {
        /// Description of the failure.
        reason: String,
    },

    /// No concrete type is registered for the peeked discriminator.
    #[error("unknown {family:?} discriminator: {key}")]
    UnknownDiscriminator {
        /// Registry that was searched.
        family: RegistryFamily,
        /// Rendered discriminator value.
        key: String,
    },

    /// UTF-16 payload could not be decoded.
    #[error("invalid UTF-16 string at offset {offset}")]
    InvalidString {
        /// Offset the string started at.
        offset: usize,
    },
}

impl CodecError {
    /// Shorthand for a [`CodecError::BadPacket`].
    pub fn bad_packet(reason: impl Into<String>) -> Self {
        CodecError::BadPacket {
            reason: reason.into(),
        }
    }
}
