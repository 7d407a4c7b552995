//! Share connections and the open options used to create handles on them.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use smbengine_codec::create::{
    access, create_options, disposition, share_access, DURABLE_V2_FLAG_PERSISTENT, LEASE_FLAG_PARENT_LEASE_KEY_SET,
};
use smbengine_codec::{
    Body, CreateContext, CreateRequest, Dialect, DurableV2Request, LeaseContext, LeaseKey, LeaseState, LeaseV2,
    OplockLevel, TreeConnectResponse,
};
use tracing::debug;
use uuid::Uuid;

use crate::error::{ClientError, Result};
use crate::handle::Handle;
use crate::pending::Response;
use crate::request::Request;
use crate::session::Session;

/// Lease to request with an open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaseRequest {
    /// The lease key.
    pub key: LeaseKey,
    /// Caching state asked for.
    pub state: LeaseState,
    /// Parent directory lease key, sent in a v2 context.
    pub parent: Option<LeaseKey>,
}

/// Durability to request with an open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Durability {
    /// An ordinary open.
    #[default]
    None,
    /// `DHnQ`
    Durable,
    /// `DH2Q`.
    DurableV2 {
        /// Requested timeout; 0 leaves it to the server.
        timeout_ms: u32,
        /// Ask for a handle that survives server failover.
        persistent: bool,
    },
}

/// How to open a file.
#[derive(Debug, Clone)]
pub struct OpenOptions {
    /// Access mask requested.
    pub desired_access: u32,
    /// Sharing allowed to other opens.
    pub share_access: u32,
    /// What to do if the file exists or not.
    pub disposition: u32,
    /// Create options, such as directory or non-directory.
    pub create_options: u32,
    /// Attributes for a newly created file.
    pub file_attributes: u32,
    /// Ignored when a lease is requested.
    pub oplock: OplockLevel,
    /// Lease to request instead of an oplock.
    pub lease: Option<LeaseRequest>,
    /// Durable handle to request.
    pub durability: Durability,
    /// Ask for the maximal access mask.
    pub query_maximal_access: bool,
}

impl Default for OpenOptions {
    fn default() -> Self {
        Self {
            desired_access: access::GENERIC_READ | access::GENERIC_WRITE,
            share_access: share_access::READ | share_access::WRITE | share_access::DELETE,
            disposition: disposition::OPEN_IF,
            create_options: create_options::NON_DIRECTORY_FILE,
            file_attributes: 0,
            oplock: OplockLevel::None,
            lease: None,
            durability: Durability::None,
            query_maximal_access: false,
        }
    }
}

impl OpenOptions {
    /// Builds the create request for `name`. Lease v2 contexts are used on
    /// 3.x dialects, v1 otherwise.
    pub fn to_request(&self, name: &str, dialect: Dialect) -> CreateRequest {
        let mut request = CreateRequest::new(name);
        request.desired_access = self.desired_access;
        request.share_access = self.share_access;
        request.create_disposition = self.disposition;
        request.create_options = self.create_options;
        request.file_attributes = self.file_attributes;
        request.requested_oplock_level = self.oplock;
        if let Some(lease) = self.lease {
            request.requested_oplock_level = OplockLevel::Lease;
            let (flags, v2) = if dialect.is_smb3() {
                let flags = if lease.parent.is_some() {
                    LEASE_FLAG_PARENT_LEASE_KEY_SET
                } else {
                    0
                };
                (
                    flags,
                    Some(LeaseV2 {
                        parent_key: lease.parent.unwrap_or_default(),
                        epoch: 0,
                    }),
                )
            } else {
                (0, None)
            };
            request.contexts.push(CreateContext::Lease(LeaseContext {
                key: lease.key,
                state: lease.state,
                flags,
                v2,
            }));
        }
        match self.durability {
            Durability::None => {}
            Durability::Durable => request.contexts.push(CreateContext::DurableRequest),
            Durability::DurableV2 { timeout_ms, persistent } => {
                request.contexts.push(CreateContext::DurableRequestV2(DurableV2Request {
                    timeout: timeout_ms,
                    flags: if persistent { DURABLE_V2_FLAG_PERSISTENT } else { 0 },
                    create_guid: Uuid::new_v4(),
                }))
            }
        }
        if self.query_maximal_access {
            request
                .contexts
                .push(CreateContext::MaximalAccessRequest { timestamp: None });
        }
        request
    }
}

/// A connected share.
pub struct Tree {
    session: Arc<Session>,
    id: u32,
    path: String,
    info: TreeConnectResponse,
    connected: AtomicBool,
}

impl fmt::Debug for Tree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tree")
            .field("id", &self.id)
            .field("path", &self.path)
            .field("session_id", &self.session.id())
            .finish()
    }
}

impl Tree {
    pub(crate) fn new(session: Arc<Session>, id: u32, path: &str, info: TreeConnectResponse) -> Self {
        Self {
            session,
            id,
            path: path.to_string(),
            info,
            connected: AtomicBool::new(true),
        }
    }

    /// Tree id assigned by the server.
    pub fn id(&self) -> u32 {
        self.id
    }

    /// The UNC path connected.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// The owning session.
    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// The server's tree connect response.
    pub fn info(&self) -> &TreeConnectResponse {
        &self.info
    }

    /// Whether the share demands encryption beyond what the session does.
    pub fn is_encrypted(&self) -> bool {
        self.info.encrypt_data() || self.session.is_encrypted()
    }

    /// False once disconnected.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// A request addressed to this tree.
    pub fn request(&self, body: Body) -> Result<Request> {
        if !self.is_connected() {
            return Err(ClientError::state(format!("tree {} is disconnected", self.id)));
        }
        let request = self.session.request(body)?.with_tree(self.id);
        Ok(if self.info.encrypt_data() {
            request.encrypted()
        } else {
            request
        })
    }

    /// Sends a request on the tree's session.
    pub async fn send(&self, request: Request) -> Result<Response> {
        self.session.send(request).await
    }

    /// Opens `name` relative to the share root.
    pub async fn open(self: &Arc<Self>, name: &str, options: &OpenOptions) -> Result<Handle> {
        self.create(options.to_request(name, self.session.dialect())).await
    }

    /// Sends a prepared create request.
    pub async fn create(self: &Arc<Self>, request: CreateRequest) -> Result<Handle> {
        let response = self.send(self.request(Body::CreateRequest(request.clone()))?).await?;
        let Body::CreateResponse(created) = response.body() else {
            return Err(ClientError::bad_packet(format!("create answered with {:?}", response.body())));
        };
        debug!(tree_id = self.id, name = %request.name, file_id = ?created.file_id, "opened");
        Handle::opened(self.clone(), request, created.clone(), None, None)
    }

    /// Disconnects the share. Handles opened on it are not closed.
    pub async fn disconnect(&self) -> Result<()> {
        let request = self.request(Body::TreeDisconnectRequest)?;
        self.connected.store(false, Ordering::Release);
        self.send(request).await?;
        debug!(tree_id = self.id, path = %self.path, "tree disconnected");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lease_open_uses_v2_context_on_smb3() {
        let options = OpenOptions {
            lease: Some(LeaseRequest {
                key: LeaseKey::from_u128(7),
                state: LeaseState::RWH,
                parent: Some(LeaseKey::from_u128(1)),
            }),
            ..Default::default()
        };
        let request = options.to_request("a.txt", Dialect::Smb311);
        assert_eq!(request.requested_oplock_level, OplockLevel::Lease);
        let lease = request.lease().unwrap();
        assert_eq!(lease.flags, LEASE_FLAG_PARENT_LEASE_KEY_SET);
        assert_eq!(lease.v2.unwrap().parent_key, LeaseKey::from_u128(1));

        let request = options.to_request("a.txt", Dialect::Smb210);
        assert!(request.lease().unwrap().v2.is_none());
    }

    #[test]
    fn test_durable_v2_requests_persistence() {
        let options = OpenOptions {
            durability: Durability::DurableV2 {
                timeout_ms: 60_000,
                persistent: true,
            },
            ..Default::default()
        };
        let request = options.to_request("db", Dialect::Smb300);
        let durable = request
            .contexts
            .iter()
            .find_map(|c| match c {
                CreateContext::DurableRequestV2(d) => Some(*d),
                _ => None,
            })
            .unwrap();
        assert_eq!(durable.flags, DURABLE_V2_FLAG_PERSISTENT);
        assert_eq!(durable.timeout, 60_000);
    }

    #[test]
    fn test_plain_open_has_no_contexts() {
        let request = OpenOptions::default().to_request("x", Dialect::Smb311);
        assert!(request.contexts.is_empty());
        assert_eq!(request.requested_oplock_level, OplockLevel::None);
    }
}
