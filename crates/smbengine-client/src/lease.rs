//! Client-scoped, refcounted leases shared by the handles that hold them.

use std::collections::HashMap;
use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

use parking_lot::Mutex;
use smbengine_codec::{Body, LeaseBreakAck, LeaseBreakNotification, LeaseKey, LeaseState};
use tracing::{debug, info};

use crate::breaks::{BreakDispatcher, BreakFuture, BreakKey, BreakNotification};
use crate::error::{ClientError, Result};
use crate::pending::Response;
use crate::session::Session;

struct LeaseInner {
    state: LeaseState,
    epoch: u16,
    pending_break: Option<BreakFuture>,
}

/// Caching permission identified by a lease key. Every handle opened with the
/// same key sees the same state.
pub struct Lease {
    key: LeaseKey,
    parent: Option<LeaseKey>,
    breaks: Arc<BreakDispatcher>,
    inner: Mutex<LeaseInner>,
}

impl fmt::Debug for Lease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("Lease")
            .field("key", &self.key)
            .field("state", &inner.state)
            .field("epoch", &inner.epoch)
            .finish()
    }
}

impl Lease {
    /// The lease key.
    pub fn key(&self) -> LeaseKey {
        self.key
    }

    /// Parent directory lease key, for v2 leases.
    pub fn parent(&self) -> Option<LeaseKey> {
        self.parent
    }

    /// Current caching state.
    pub fn state(&self) -> LeaseState {
        self.inner.lock().state
    }

    /// Latest epoch seen from the server.
    pub fn epoch(&self) -> u16 {
        self.inner.lock().epoch
    }

    /// Records a grant from a create response. Stale epochs are ignored.
    pub(crate) fn granted(&self, state: LeaseState, epoch: u16) {
        let mut inner = self.inner.lock();
        if epoch >= inner.epoch {
            inner.state = state;
            inner.epoch = epoch;
        }
    }

    /// Registers a break expectation unless one is armed or nothing is cached.
    pub fn arm(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.pending_break.is_some() || inner.state.is_none() {
            return Ok(());
        }
        inner.pending_break = Some(self.breaks.register(BreakKey::Lease(self.key))?);
        Ok(())
    }

    /// Waits for the next break of this lease.
    pub async fn next_break(&self) -> Result<LeaseBreakNotification> {
        let armed = self.inner.lock().pending_break.take();
        let future = match armed {
            Some(future) => future,
            None => self.breaks.register(BreakKey::Lease(self.key))?,
        };
        match future.wait().await? {
            BreakNotification::Lease(notification) => Ok(notification),
            other => Err(ClientError::bad_packet(format!("lease waiter got {other:?}"))),
        }
    }

    /// Applies a break notification, acknowledging it on `session` when the
    /// server asks for it.
    ///
    /// `policy` receives the state the server is breaking to and returns the
    /// state to keep; bits not offered by the server are dropped. A panic in
    /// `policy` propagates to the caller. Unless the lease ends up with no
    /// caching, a fresh break expectation is armed.
    pub async fn acknowledge(
        &self,
        session: &Session,
        notification: &LeaseBreakNotification,
        policy: impl FnOnce(LeaseState) -> LeaseState,
    ) -> Result<LeaseState> {
        if notification.lease_key != self.key {
            return Err(ClientError::request(format!(
                "break for {} acknowledged on lease {}",
                notification.lease_key, self.key
            )));
        }
        let desired = LeaseState(policy(notification.new_state).0 & notification.new_state.0);
        let kept = if notification.ack_required() {
            let ack = Body::LeaseBreakAck(LeaseBreakAck {
                lease_key: self.key,
                lease_state: desired,
            });
            let response: Response = session.send(session.request(ack)?).await?;
            match response.body() {
                Body::LeaseBreakAck(granted) => granted.lease_state,
                other => return Err(ClientError::bad_packet(format!("lease break ack answered with {other:?}"))),
            }
        } else {
            desired
        };
        {
            let mut inner = self.inner.lock();
            inner.state = kept;
            inner.epoch = inner.epoch.max(notification.new_epoch);
        }
        info!(lease = %self.key, state = %kept, "lease break acknowledged");
        self.arm()?;
        Ok(kept)
    }
}

struct Entry {
    lease: Arc<Lease>,
    refs: usize,
}

/// Every lease a client holds, deduplicated by key.
pub struct LeaseTable {
    breaks: Arc<BreakDispatcher>,
    entries: Mutex<HashMap<LeaseKey, Entry>>,
}

impl fmt::Debug for LeaseTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LeaseTable").field("leases", &self.len()).finish()
    }
}

impl LeaseTable {
    /// An empty table routing breaks through `breaks`.
    pub fn new(breaks: Arc<BreakDispatcher>) -> Self {
        Self {
            breaks,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Takes a reference to the lease for `key`, creating it on first use.
    pub fn acquire(self: &Arc<Self>, key: LeaseKey, parent: Option<LeaseKey>) -> LeaseRef {
        let mut entries = self.entries.lock();
        let entry = entries.entry(key).or_insert_with(|| {
            debug!(lease = %key, "lease created");
            Entry {
                lease: Arc::new(Lease {
                    key,
                    parent,
                    breaks: self.breaks.clone(),
                    inner: Mutex::new(LeaseInner {
                        state: LeaseState::NONE,
                        epoch: 0,
                        pending_break: None,
                    }),
                }),
                refs: 0,
            }
        });
        entry.refs += 1;
        LeaseRef {
            lease: entry.lease.clone(),
            table: self.clone(),
        }
    }

    /// The lease for `key`, if any handle holds it.
    pub fn get(&self, key: &LeaseKey) -> Option<Arc<Lease>> {
        self.entries.lock().get(key).map(|e| e.lease.clone())
    }

    /// Number of handles holding `key`.
    pub fn refcount(&self, key: &LeaseKey) -> usize {
        self.entries.lock().get(key).map_or(0, |e| e.refs)
    }

    /// Number of distinct leases held.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether no lease is held.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn release(&self, key: LeaseKey) {
        let mut entries = self.entries.lock();
        let Some(entry) = entries.get_mut(&key) else {
            return;
        };
        entry.refs -= 1;
        if entry.refs == 0 {
            entries.remove(&key);
            drop(entries);
            self.breaks.forget(&BreakKey::Lease(key));
            debug!(lease = %key, "lease released");
        }
    }
}

/// One counted reference to a shared [`Lease`].
pub struct LeaseRef {
    lease: Arc<Lease>,
    table: Arc<LeaseTable>,
}

impl fmt::Debug for LeaseRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.lease.fmt(f)
    }
}

impl Deref for LeaseRef {
    type Target = Lease;

    fn deref(&self) -> &Lease {
        &self.lease
    }
}

impl LeaseRef {
    /// The shared lease behind this reference.
    pub fn shared(&self) -> Arc<Lease> {
        self.lease.clone()
    }
}

impl Clone for LeaseRef {
    fn clone(&self) -> Self {
        self.table.acquire(self.lease.key, self.lease.parent)
    }
}

impl Drop for LeaseRef {
    fn drop(&mut self) {
        self.table.release(self.lease.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> Arc<LeaseTable> {
        Arc::new(LeaseTable::new(Arc::new(BreakDispatcher::new())))
    }

    #[test]
    fn test_same_key_shares_one_lease() {
        let table = table();
        let key = LeaseKey::from_u128(0xABCD);
        let a = table.acquire(key, None);
        let b = table.acquire(key, None);
        assert!(Arc::ptr_eq(&a.shared(), &b.shared()));
        assert_eq!(table.refcount(&key), 2);
        a.granted(LeaseState::RWH, 1);
        assert_eq!(b.state(), LeaseState::RWH);
    }

    #[test]
    fn test_refcount_zero_removes_entry() {
        let table = table();
        let key = LeaseKey::from_u128(1);
        let a = table.acquire(key, None);
        let b = a.clone();
        assert_eq!(table.refcount(&key), 2);
        drop(a);
        assert_eq!(table.len(), 1);
        drop(b);
        assert!(table.is_empty());
        assert!(table.get(&key).is_none());
    }

    #[test]
    fn test_stale_epoch_ignored() {
        let table = table();
        let lease = table.acquire(LeaseKey::from_u128(2), None);
        lease.granted(LeaseState::RWH, 5);
        lease.granted(LeaseState(LeaseState::READ), 3);
        assert_eq!(lease.state(), LeaseState::RWH);
        assert_eq!(lease.epoch(), 5);
    }

    #[tokio::test]
    async fn test_next_break_uses_armed_future() {
        let breaks = Arc::new(BreakDispatcher::new());
        let table = Arc::new(LeaseTable::new(breaks.clone()));
        let key = LeaseKey::from_u128(3);
        let lease = table.acquire(key, None);
        lease.granted(LeaseState::RWH, 1);
        lease.arm().unwrap();
        let notification = LeaseBreakNotification {
            new_epoch: 2,
            flags: 0,
            lease_key: key,
            current_state: LeaseState::RWH,
            new_state: LeaseState(LeaseState::READ),
        };
        breaks.deliver(BreakNotification::Lease(notification.clone()));
        assert_eq!(lease.next_break().await.unwrap(), notification);
    }
}
