//! Routing of unsolicited oplock and lease break notifications.
//!
//! The table is client-scoped: a break may arrive on any channel bound to the
//! owning session, so every connection a client opens delivers into the same
//! dispatcher. A notification either completes a registered waiter at once or
//! is queued until someone registers for its key.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use parking_lot::Mutex;
use smbengine_codec::{FileId, LeaseBreakNotification, LeaseKey, OplockBreak};
use tokio::sync::oneshot;
use tracing::{debug, trace};

use crate::error::{ClientError, Result};

/// What a break is addressed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BreakKey {
    /// An oplock on one open.
    Oplock(FileId),
    /// A lease, whichever handles share it.
    Lease(LeaseKey),
}

/// A received break notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BreakNotification {
    /// An `OplockBreak` notification.
    Oplock(OplockBreak),
    /// A lease break notification.
    Lease(LeaseBreakNotification),
}

impl BreakNotification {
    /// The key this notification is routed by.
    pub fn key(&self) -> BreakKey {
        match self {
            BreakNotification::Oplock(b) => BreakKey::Oplock(b.file_id),
            BreakNotification::Lease(b) => BreakKey::Lease(b.lease_key),
        }
    }
}

enum Slot {
    Waiting(oneshot::Sender<BreakNotification>),
    Queued(VecDeque<BreakNotification>),
}

/// Client-scoped table of break waiters and undelivered notifications.
#[derive(Default)]
pub struct BreakDispatcher {
    slots: Mutex<HashMap<BreakKey, Slot>>,
}

impl std::fmt::Debug for BreakDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BreakDispatcher")
            .field("keys", &self.slots.lock().len())
            .finish()
    }
}

impl BreakDispatcher {
    /// An empty dispatcher.
    pub fn new() -> Self {
        Self::default()
    }

    /// Arms a one-shot waiter for `key`. If notifications are already queued
    /// the oldest is handed over immediately.
    pub fn register(&self, key: BreakKey) -> Result<BreakFuture> {
        let (tx, rx) = oneshot::channel();
        let mut slots = self.slots.lock();
        match slots.remove(&key) {
            Some(Slot::Queued(mut queue)) => {
                if let Some(first) = queue.pop_front() {
                    let _ = tx.send(first);
                }
                if !queue.is_empty() {
                    slots.insert(key, Slot::Queued(queue));
                }
            }
            Some(Slot::Waiting(existing)) if !existing.is_closed() => {
                slots.insert(key, Slot::Waiting(existing));
                return Err(ClientError::state(format!("a break waiter for {key:?} is already armed")));
            }
            Some(Slot::Waiting(_)) | None => {
                slots.insert(key, Slot::Waiting(tx));
            }
        }
        trace!(?key, "break waiter registered");
        Ok(BreakFuture { key, rx })
    }

    /// Routes a notification to its waiter, or queues it.
    pub fn deliver(&self, notification: BreakNotification) {
        let key = notification.key();
        let mut slots = self.slots.lock();
        let notification = match slots.remove(&key) {
            Some(Slot::Waiting(tx)) => match tx.send(notification) {
                Ok(()) => {
                    debug!(?key, "break delivered to waiter");
                    return;
                }
                Err(returned) => returned,
            },
            Some(Slot::Queued(mut queue)) => {
                queue.push_back(notification);
                slots.insert(key, Slot::Queued(queue));
                debug!(?key, "break queued");
                return;
            }
            None => notification,
        };
        debug!(?key, "break queued");
        slots.insert(key, Slot::Queued(VecDeque::from([notification])));
    }

    /// Number of queued notifications for `key`.
    pub fn queued(&self, key: &BreakKey) -> usize {
        match self.slots.lock().get(key) {
            Some(Slot::Queued(queue)) => queue.len(),
            _ => 0,
        }
    }

    /// Drops any waiter or queue for `key`.
    pub fn forget(&self, key: &BreakKey) {
        self.slots.lock().remove(key);
    }
}

/// A registered expectation of a break for one key.
#[derive(Debug)]
pub struct BreakFuture {
    key: BreakKey,
    rx: oneshot::Receiver<BreakNotification>,
}

impl BreakFuture {
    /// The key this future waits on.
    pub fn key(&self) -> BreakKey {
        self.key
    }

    /// The notification, if it has already arrived.
    pub fn try_take(&mut self) -> Option<BreakNotification> {
        self.rx.try_recv().ok()
    }

    /// Waits until a notification for the key arrives.
    pub async fn wait(self) -> Result<BreakNotification> {
        self.rx
            .await
            .map_err(|_| ClientError::state(format!("break waiter for {:?} was dropped", self.key)))
    }

    /// Like [`BreakFuture::wait`], failing with a timeout error after `timeout`.
    pub async fn wait_timeout(self, timeout: Duration) -> Result<BreakNotification> {
        let key = self.key;
        tokio::time::timeout(timeout, self.wait())
            .await
            .map_err(|_| ClientError::state(format!("no break for {key:?} within {}ms", timeout.as_millis())))?
    }
}
