//! The client error type.

use std::sync::Arc;

use smbengine_codec::{CodecError, Command, Status};
use thiserror::Error;

/// Everything the client can fail with.
#[derive(Debug, Error)]
pub enum ClientError {
    /// A message failed to encode or decode.
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// The server sent something that violates the protocol.
    #[error("bad packet: {reason}")]
    BadPacket {
        /// What was wrong.
        reason: String,
    },

    /// The server answered with a status the request does not accept.
    #[error("{command} request {message_id} failed with {status}")]
    Response {
        /// Command of the failed request.
        command: Command,
        /// Status the server returned.
        status: Status,
        /// Id of the failed request.
        message_id: u64,
    },

    /// The caller asked for something that cannot be sent.
    #[error("invalid request: {reason}")]
    Request {
        /// Why the request was refused.
        reason: String,
    },

    /// No final response arrived in time. The request stays in flight.
    #[error("{command} request {message_id} timed out after {timeout_ms}ms (interim status {interim_status:?}, async id {async_id:?})")]
    Timeout {
        /// Id of the request waited on.
        message_id: u64,
        /// Its command.
        command: Command,
        /// How long the caller waited.
        timeout_ms: u64,
        /// Status of the interim response, if one arrived.
        interim_status: Option<Status>,
        /// Async id from the interim response.
        async_id: Option<u64>,
    },

    /// The operation does not fit the current state of the object.
    #[error("invalid state: {reason}")]
    State {
        /// What was out of place.
        reason: String,
    },

    /// The server chose a cipher the client did not offer or does not know.
    #[error("no mutually supported cipher: offered {offered:?}, server chose 0x{chosen:04X}")]
    CipherMismatch {
        /// Cipher ids the client offered.
        offered: Vec<u16>,
        /// Cipher id the server chose; 0 when none.
        chosen: u16,
    },

    /// A response signature did not verify or was missing.
    #[error("signature mismatch on message {message_id}")]
    SignatureMismatch {
        /// Id of the affected request.
        message_id: u64,
    },

    /// A cipher, MAC or key derivation failed.
    #[error("crypto failure: {reason}")]
    Crypto {
        /// Underlying failure.
        reason: String,
    },

    /// The authentication provider or the server refused the logon.
    #[error("authentication failed: {reason}")]
    Auth {
        /// Why authentication failed.
        reason: String,
    },

    /// TCP connect did not finish in time.
    #[error("connect to {addr} timed out after {timeout_ms}ms")]
    ConnectTimeout {
        /// Address being connected to.
        addr: String,
        /// Configured connect timeout.
        timeout_ms: u64,
    },

    /// The connection was closed locally or by the peer.
    #[error("connection closed")]
    ConnectionClosed,

    /// The transport failed.
    #[error(transparent)]
    Io(Arc<std::io::Error>),

    /// One error object handed to many waiters.
    #[error(transparent)]
    Shared(Arc<ClientError>),
}

impl ClientError {
    pub(crate) fn bad_packet(reason: impl Into<String>) -> Self {
        ClientError::BadPacket { reason: reason.into() }
    }

    pub(crate) fn request(reason: impl Into<String>) -> Self {
        ClientError::Request { reason: reason.into() }
    }

    pub(crate) fn state(reason: impl Into<String>) -> Self {
        ClientError::State { reason: reason.into() }
    }

    pub(crate) fn crypto(reason: impl ToString) -> Self {
        ClientError::Crypto {
            reason: reason.to_string(),
        }
    }

    /// The underlying error, looking through any [`ClientError::Shared`] wrappers.
    pub fn root(&self) -> &ClientError {
        match self {
            ClientError::Shared(inner) => inner.root(),
            other => other,
        }
    }

    /// The failing status if this is a response error.
    pub fn status(&self) -> Option<Status> {
        match self.root() {
            ClientError::Response { status, .. } => Some(*status),
            _ => None,
        }
    }
}

impl From<std::io::Error> for ClientError {
    fn from(e: std::io::Error) -> Self {
        ClientError::Io(Arc::new(e))
    }
}

/// Result alias for client operations.
pub type Result<T> = std::result::Result<T, ClientError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_root_looks_through_shared() {
        let inner = Arc::new(ClientError::Response {
            command: Command::Create,
            status: Status::ACCESS_DENIED,
            message_id: 4,
        });
        let outer = ClientError::Shared(Arc::new(ClientError::Shared(inner)));
        assert_eq!(outer.status(), Some(Status::ACCESS_DENIED));
        assert!(matches!(outer.root(), ClientError::Response { message_id: 4, .. }));
    }

    #[test]
    fn test_display_is_transparent_for_shared() {
        let err = ClientError::Shared(Arc::new(ClientError::ConnectionClosed));
        assert_eq!(err.to_string(), "connection closed");
    }
}
