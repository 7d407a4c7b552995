//! Open files: I/O, oplock breaks and durable reconnect.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use smbengine_codec::create::{DURABLE_V2_FLAG_PERSISTENT, LEASE_FLAG_PARENT_LEASE_KEY_SET};
use smbengine_codec::{
    Body, CloseRequest, CreateContext, CreateRequest, CreateResponse, FileAttributes, FileId, FlushRequest,
    LeaseBreakNotification, LeaseState, OplockBreak, OplockLevel, ReadRequest, Status, WriteRequest,
};
use tracing::{debug, info};
use uuid::Uuid;

use crate::breaks::{BreakDispatcher, BreakFuture, BreakKey, BreakNotification};
use crate::error::{ClientError, Result};
use crate::lease::{Lease, LeaseRef};
use crate::request::Request;
use crate::tree::Tree;

const CLOSE_FLAG_POSTQUERY_ATTRIB: u16 = 0x0001;

/// Durability the server granted for an open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DurableGrant {
    /// Granted timeout; 0 leaves it to the server.
    pub timeout_ms: u32,
    /// Granted durable flags.
    pub flags: u32,
    /// Create guid of a v2 grant.
    pub create_guid: Option<Uuid>,
}

impl DurableGrant {
    /// Whether the server made the open persistent.
    pub fn is_persistent(&self) -> bool {
        self.flags & DURABLE_V2_FLAG_PERSISTENT != 0
    }
}

struct OplockSlot {
    level: OplockLevel,
    pending: Option<BreakFuture>,
}

/// An open file or directory on a tree.
pub struct Handle {
    tree: Arc<Tree>,
    file_id: FileId,
    request: CreateRequest,
    create_action: u32,
    attributes: Mutex<FileAttributes>,
    maximal_access: Option<u32>,
    breaks: Arc<BreakDispatcher>,
    oplock: Mutex<OplockSlot>,
    lease: Mutex<Option<LeaseRef>>,
    durable: Option<DurableGrant>,
    predecessor: Option<FileId>,
    closed: AtomicBool,
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle")
            .field("name", &self.request.name)
            .field("file_id", &self.file_id)
            .field("oplock", &self.oplock_level())
            .field("durable", &self.durable)
            .finish()
    }
}

impl Handle {
    pub(crate) fn opened(
        tree: Arc<Tree>,
        request: CreateRequest,
        response: CreateResponse,
        predecessor: Option<FileId>,
        inherited: Option<DurableGrant>,
    ) -> Result<Self> {
        let scope = tree.session().connection()?.scope().clone();
        let lease = match (response.oplock_level, response.lease()) {
            (OplockLevel::Lease, Some(granted)) => {
                let parent = granted
                    .v2
                    .filter(|_| granted.flags & LEASE_FLAG_PARENT_LEASE_KEY_SET != 0)
                    .map(|v2| v2.parent_key);
                let lease = scope.leases.acquire(granted.key, parent);
                lease.granted(granted.state, granted.v2.map_or(0, |v2| v2.epoch));
                lease.arm()?;
                Some(lease)
            }
            _ => None,
        };
        let level = match response.oplock_level {
            OplockLevel::Lease => OplockLevel::None,
            level => level,
        };
        let pending = if level == OplockLevel::None {
            None
        } else {
            Some(scope.breaks.register(BreakKey::Oplock(response.file_id))?)
        };
        let create_guid = request.contexts.iter().find_map(|c| match c {
            CreateContext::DurableRequestV2(d) => Some(d.create_guid),
            CreateContext::DurableReconnectV2 { create_guid, .. } => Some(*create_guid),
            _ => None,
        });
        let durable = response
            .durable_granted()
            .map(|(timeout_ms, flags)| DurableGrant {
                timeout_ms,
                flags,
                create_guid,
            })
            .or(inherited);
        Ok(Self {
            tree,
            file_id: response.file_id,
            create_action: response.create_action,
            attributes: Mutex::new(response.attributes),
            maximal_access: response.maximal_access(),
            request,
            breaks: scope.breaks,
            oplock: Mutex::new(OplockSlot { level, pending }),
            lease: Mutex::new(lease),
            durable,
            predecessor,
            closed: AtomicBool::new(false),
        })
    }

    /// The server's id for this open.
    pub fn file_id(&self) -> FileId {
        self.file_id
    }

    /// Path the handle was opened with.
    pub fn name(&self) -> &str {
        &self.request.name
    }

    /// The tree the handle was opened on.
    pub fn tree(&self) -> &Arc<Tree> {
        &self.tree
    }

    /// Action the server took: superseded, opened, created or overwritten.
    pub fn create_action(&self) -> u32 {
        self.create_action
    }

    /// Attributes from the create, refreshed on close.
    pub fn attributes(&self) -> FileAttributes {
        *self.attributes.lock()
    }

    /// Maximal access mask, when it was queried.
    pub fn maximal_access(&self) -> Option<u32> {
        self.maximal_access
    }

    /// Current oplock level; `None` for leased opens.
    pub fn oplock_level(&self) -> OplockLevel {
        self.oplock.lock().level
    }

    /// The lease this handle holds, if any.
    pub fn lease(&self) -> Option<Arc<Lease>> {
        self.lease.lock().as_ref().map(LeaseRef::shared)
    }

    /// Durability granted at open, or inherited on reopen.
    pub fn durable(&self) -> Option<DurableGrant> {
        self.durable
    }

    /// The open this handle was reclaimed from.
    pub fn predecessor(&self) -> Option<FileId> {
        self.predecessor
    }

    /// Whether the connection has closed.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn request(&self, body: Body) -> Result<Request> {
        if self.is_closed() {
            return Err(ClientError::state(format!("handle {:?} is closed", self.file_id)));
        }
        self.tree.request(body)
    }

    /// Reads up to `length` bytes. Reading at or past the end returns no data.
    pub async fn read(&self, offset: u64, length: u32) -> Result<Vec<u8>> {
        let request = self
            .request(Body::ReadRequest(ReadRequest {
                length,
                offset,
                file_id: self.file_id,
                minimum_count: 0,
            }))?
            .allow(Status::END_OF_FILE);
        let response = self.tree.send(request).await?;
        match response.body() {
            Body::ReadResponse(read) => Ok(read.data.clone()),
            _ if response.status() == Status::END_OF_FILE => Ok(Vec::new()),
            other => Err(ClientError::bad_packet(format!("read answered with {other:?}"))),
        }
    }

    /// Writes `data` at `offset`, returning the count the server accepted.
    pub async fn write(&self, offset: u64, data: &[u8]) -> Result<u32> {
        let request = self.request(Body::WriteRequest(WriteRequest {
            offset,
            file_id: self.file_id,
            flags: 0,
            data: data.to_vec(),
        }))?;
        let response = self.tree.send(request).await?;
        match response.body() {
            Body::WriteResponse(written) => Ok(written.count),
            other => Err(ClientError::bad_packet(format!("write answered with {other:?}"))),
        }
    }

    /// Flushes server-side buffers for the open.
    pub async fn flush(&self) -> Result<()> {
        let request = self.request(Body::FlushRequest(FlushRequest { file_id: self.file_id }))?;
        self.tree.send(request).await?;
        Ok(())
    }

    /// Closes the open and returns its final attributes. The oplock
    /// expectation and the lease reference go away with it.
    pub async fn close(&self) -> Result<FileAttributes> {
        let request = self.request(Body::CloseRequest(CloseRequest {
            flags: CLOSE_FLAG_POSTQUERY_ATTRIB,
            file_id: self.file_id,
        }))?;
        self.release();
        let response = self.tree.send(request).await?;
        let attributes = match response.body() {
            Body::CloseResponse(closed) => closed.attributes,
            other => return Err(ClientError::bad_packet(format!("close answered with {other:?}"))),
        };
        *self.attributes.lock() = attributes;
        debug!(file_id = ?self.file_id, "closed");
        Ok(attributes)
    }

    fn release(&self) {
        self.closed.store(true, Ordering::Release);
        let had_oplock = {
            let mut slot = self.oplock.lock();
            slot.pending = None;
            std::mem::replace(&mut slot.level, OplockLevel::None) != OplockLevel::None
        };
        if had_oplock {
            self.breaks.forget(&BreakKey::Oplock(self.file_id));
        }
        self.lease.lock().take();
    }

    /// Waits for the next oplock break on this handle.
    pub async fn next_break(&self) -> Result<OplockBreak> {
        let armed = self.oplock.lock().pending.take();
        let future = match armed {
            Some(future) => future,
            None => self.breaks.register(BreakKey::Oplock(self.file_id))?,
        };
        match future.wait().await? {
            BreakNotification::Oplock(notification) => Ok(notification),
            other => Err(ClientError::bad_packet(format!("oplock waiter got {other:?}"))),
        }
    }

    /// Acknowledges an oplock break. `policy` receives the level the server
    /// is breaking to and returns the level to keep, capped at that level.
    /// A panic in `policy` propagates to the caller. Unless the oplock is
    /// gone, a fresh break expectation is armed.
    pub async fn acknowledge_break(
        &self,
        notification: &OplockBreak,
        policy: impl FnOnce(OplockLevel) -> OplockLevel,
    ) -> Result<OplockLevel> {
        if notification.file_id != self.file_id {
            return Err(ClientError::request(format!(
                "break for {:?} acknowledged on {:?}",
                notification.file_id, self.file_id
            )));
        }
        let desired = policy(notification.oplock_level).min(notification.oplock_level);
        let request = self.request(Body::OplockBreak(OplockBreak {
            oplock_level: desired,
            file_id: self.file_id,
        }))?;
        let response = self.tree.send(request).await?;
        let granted = match response.body() {
            Body::OplockBreak(granted) => granted.oplock_level,
            other => return Err(ClientError::bad_packet(format!("oplock break ack answered with {other:?}"))),
        };
        let rearm = {
            let mut slot = self.oplock.lock();
            slot.level = granted;
            granted != OplockLevel::None && slot.pending.is_none()
        };
        if rearm {
            let future = self.breaks.register(BreakKey::Oplock(self.file_id))?;
            self.oplock.lock().pending = Some(future);
        }
        info!(file_id = ?self.file_id, level = ?granted, "oplock break acknowledged");
        Ok(granted)
    }

    /// Acknowledges a break of this handle's lease on the tree's session.
    pub async fn acknowledge_lease_break(
        &self,
        notification: &LeaseBreakNotification,
        policy: impl FnOnce(LeaseState) -> LeaseState,
    ) -> Result<LeaseState> {
        let lease = self
            .lease()
            .ok_or_else(|| ClientError::state(format!("handle {:?} holds no lease", self.file_id)))?;
        lease.acknowledge(self.tree.session(), notification, policy).await
    }

    /// Reclaims this durable open on `tree`, typically after reconnecting.
    /// The new handle records this one's file id as its predecessor.
    pub async fn reopen(&self, tree: &Arc<Tree>) -> Result<Handle> {
        let durable = self
            .durable
            .ok_or_else(|| ClientError::state(format!("handle {:?} is not durable", self.file_id)))?;
        let mut request = self.request.clone();
        request.contexts.retain(|c| {
            !matches!(
                c,
                CreateContext::DurableRequest
                    | CreateContext::DurableRequestV2(_)
                    | CreateContext::DurableReconnect { .. }
                    | CreateContext::DurableReconnectV2 { .. }
            )
        });
        request.contexts.push(match durable.create_guid {
            Some(create_guid) => CreateContext::DurableReconnectV2 {
                file_id: self.file_id,
                create_guid,
                flags: durable.flags,
            },
            None => CreateContext::DurableReconnect { file_id: self.file_id },
        });
        let response = tree.send(tree.request(Body::CreateRequest(request.clone()))?).await?;
        let Body::CreateResponse(created) = response.body() else {
            return Err(ClientError::bad_packet(format!("reconnect answered with {:?}", response.body())));
        };
        self.release();
        info!(predecessor = ?self.file_id, file_id = ?created.file_id, "durable handle reclaimed");
        Handle::opened(tree.clone(), request, created.clone(), Some(self.file_id), Some(durable))
    }
}
