//! Outgoing request builder.

use std::sync::Arc;

use smbengine_codec::{Body, Command, Header, HeaderFlags, PlainMessage, Status};

use crate::crypto::Signer;
use crate::error::Result;
use crate::pending::RequestFuture;

/// A message to submit plus the submission options that travel with it.
#[derive(Debug, Clone)]
pub struct Request {
    /// Message to send; ids and credits are filled in at submission.
    pub message: PlainMessage,
    /// Non-success statuses that still complete the request normally.
    pub allowed: Vec<Status>,
    pub(crate) signer: Option<Arc<Signer>>,
    pub(crate) encrypt: bool,
    pub(crate) cancel_target: Option<RequestFuture>,
}

impl Request {
    /// A request carrying `body`.
    pub fn new(body: Body) -> Result<Self> {
        Ok(Self {
            message: PlainMessage::request(body)?,
            allowed: Vec::new(),
            signer: None,
            encrypt: false,
            cancel_target: None,
        })
    }

    /// A cancel for `target`. The header is addressed at submit time, and
    /// submitting it hands back `target` itself.
    pub fn cancel(target: &RequestFuture) -> Self {
        Self {
            message: PlainMessage::new(Header::request(Command::Cancel), Body::CancelRequest),
            allowed: Vec::new(),
            signer: None,
            encrypt: false,
            cancel_target: Some(target.clone()),
        }
    }

    /// Addresses the request to `session_id`.
    pub fn with_session(mut self, session_id: u64) -> Self {
        self.message.header.session_id = session_id;
        self
    }

    /// Addresses the request to `tree_id`.
    pub fn with_tree(mut self, tree_id: u32) -> Self {
        self.message.header.set_tree_id(tree_id);
        self
    }

    /// Marks this member as related to the previous one in a compound.
    pub fn related(mut self) -> Self {
        self.message.header.flags.set(HeaderFlags::RELATED_OPERATIONS, true);
        self
    }

    /// Treats `status` as success for this request.
    pub fn allow(mut self, status: Status) -> Self {
        self.allowed.push(status);
        self
    }

    /// Signs with `signer` instead of the channel's key.
    pub fn signed_with(mut self, signer: Arc<Signer>) -> Self {
        self.signer = Some(signer);
        self
    }

    /// Requires encryption even if the session does not.
    pub fn encrypted(mut self) -> Self {
        self.encrypt = true;
        self
    }

    /// Whether this is a cancel.
    pub fn is_cancel(&self) -> bool {
        self.cancel_target.is_some()
    }
}
