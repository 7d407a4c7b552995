//! In-flight request slots and the futures callers wait on.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use smbengine_codec::{Body, Command, Header, PlainMessage, Status};
use tokio::sync::Notify;

use crate::error::{ClientError, Result};

/// A decoded response and the exact bytes it was decoded from.
#[derive(Debug, Clone)]
pub struct Response {
    /// The decoded message.
    pub message: PlainMessage,
    /// Plaintext bytes of this compound member, padding included.
    pub raw: Bytes,
    /// Whether the response arrived inside a transform envelope.
    pub encrypted: bool,
}

impl Response {
    /// The response header.
    pub fn header(&self) -> &Header {
        &self.message.header
    }

    /// The response body.
    pub fn body(&self) -> &Body {
        &self.message.body
    }

    /// Status the server returned.
    pub fn status(&self) -> Status {
        self.message.header.status
    }
}

/// Final result stored in a slot: the terminal error is shared, never copied.
pub type Outcome = std::result::Result<Response, Arc<ClientError>>;

type Callback = Box<dyn FnOnce(&Outcome) + Send>;

struct Slot {
    interim: Option<Header>,
    outcome: Option<Outcome>,
    callbacks: Vec<Callback>,
}

struct Inner {
    message_id: u64,
    command: Command,
    request: Header,
    request_bytes: Bytes,
    allowed: Vec<Status>,
    sealed: AtomicBool,
    slot: Mutex<Slot>,
    done: Notify,
}

/// Handle to one submitted request. Clones share the same slot.
#[derive(Clone)]
pub struct RequestFuture {
    inner: Arc<Inner>,
}

impl fmt::Debug for RequestFuture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestFuture")
            .field("message_id", &self.inner.message_id)
            .field("command", &self.inner.command)
            .field("done", &self.is_done())
            .finish()
    }
}

impl RequestFuture {
    pub(crate) fn new(request: Header, request_bytes: Bytes, allowed: Vec<Status>) -> Self {
        Self {
            inner: Arc::new(Inner {
                message_id: request.message_id,
                command: request.command,
                request,
                request_bytes,
                allowed,
                sealed: AtomicBool::new(false),
                slot: Mutex::new(Slot {
                    interim: None,
                    outcome: None,
                    callbacks: Vec::new(),
                }),
                done: Notify::new(),
            }),
        }
    }

    /// Message id assigned at submission.
    pub fn message_id(&self) -> u64 {
        self.inner.message_id
    }

    /// Command of the request.
    pub fn command(&self) -> Command {
        self.inner.command
    }

    /// Header of the request as it was serialized.
    pub fn request(&self) -> &Header {
        &self.inner.request
    }

    /// Serialized request bytes (before any encryption).
    pub fn request_bytes(&self) -> &Bytes {
        &self.inner.request_bytes
    }

    /// Header of the interim `PENDING` response, once one has arrived.
    pub fn interim(&self) -> Option<Header> {
        self.inner.slot.lock().interim.clone()
    }

    /// Async id from an interim response, once one arrived.
    pub fn async_id(&self) -> Option<u64> {
        self.inner.slot.lock().interim.as_ref().and_then(Header::async_id)
    }

    /// Whether the request went out inside a transform envelope.
    pub fn was_sealed(&self) -> bool {
        self.inner.sealed.load(Ordering::Relaxed)
    }

    pub(crate) fn mark_sealed(&self) {
        self.inner.sealed.store(true, Ordering::Relaxed);
    }

    /// Whether both handles refer to the same submitted request.
    pub fn same_request(&self, other: &RequestFuture) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Whether an outcome has been recorded.
    pub fn is_done(&self) -> bool {
        self.inner.slot.lock().outcome.is_some()
    }

    /// Whether a final response with `status` completes this request normally.
    pub fn allows(&self, status: Status) -> bool {
        status == Status::SUCCESS || self.inner.allowed.contains(&status)
    }

    /// Runs `callback` on completion, or right away if already complete.
    pub fn on_complete(&self, callback: impl FnOnce(&Outcome) + Send + 'static) {
        let mut slot = self.inner.slot.lock();
        match &slot.outcome {
            Some(outcome) => {
                let outcome = outcome.clone();
                drop(slot);
                callback(&outcome);
            }
            None => slot.callbacks.push(Box::new(callback)),
        }
    }

    pub(crate) fn set_interim(&self, header: Header) {
        let mut slot = self.inner.slot.lock();
        if slot.outcome.is_none() {
            slot.interim = Some(header);
        }
    }

    /// Stores the final result. Only the first completion takes effect.
    pub(crate) fn complete(&self, outcome: Outcome) -> bool {
        let callbacks = {
            let mut slot = self.inner.slot.lock();
            if slot.outcome.is_some() {
                return false;
            }
            slot.outcome = Some(outcome.clone());
            std::mem::take(&mut slot.callbacks)
        };
        for callback in callbacks {
            callback(&outcome);
        }
        self.inner.done.notify_waiters();
        true
    }

    /// The stored outcome, without waiting.
    pub fn outcome(&self) -> Option<Outcome> {
        self.inner.slot.lock().outcome.clone()
    }

    /// Waits for the final response. A stored error is returned wrapped in
    /// [`ClientError::Shared`] so every waiter sees the same object.
    pub async fn wait(&self) -> Result<Response> {
        loop {
            let notified = self.inner.done.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if let Some(outcome) = self.outcome() {
                return outcome.map_err(ClientError::Shared);
            }
            notified.await;
        }
    }

    /// Bounded [`wait`](Self::wait). Expiry leaves the request outstanding and
    /// reports what is known about it.
    pub async fn wait_timeout(&self, timeout: Duration) -> Result<Response> {
        match tokio::time::timeout(timeout, self.wait()).await {
            Ok(result) => result,
            Err(_) => {
                let interim = self.interim();
                Err(ClientError::Timeout {
                    message_id: self.message_id(),
                    command: self.command(),
                    timeout_ms: whole_millis(timeout),
                    interim_status: interim.as_ref().map(|h| h.status),
                    async_id: interim.as_ref().and_then(Header::async_id),
                })
            }
        }
    }
}

/// Milliseconds in `duration`, saturating at `u64::MAX`.
fn whole_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use smbengine_codec::{Addressing, HeaderFlags};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn future(id: u64) -> RequestFuture {
        let mut header = Header::request(Command::Echo);
        header.message_id = id;
        RequestFuture::new(header, Bytes::new(), Vec::new())
    }

    fn echo_response(id: u64) -> Response {
        let mut header = Header::request(Command::Echo);
        header.message_id = id;
        header.flags.set(HeaderFlags::SERVER_TO_REDIR, true);
        Response {
            message: PlainMessage::new(header, Body::EchoResponse),
            raw: Bytes::new(),
            encrypted: false,
        }
    }

    #[tokio::test]
    async fn test_wait_returns_completion() {
        let f = future(3);
        let waiter = f.clone();
        let task = tokio::spawn(async move { waiter.wait().await });
        tokio::task::yield_now().await;
        assert!(f.complete(Ok(echo_response(3))));
        let response = task.await.unwrap().unwrap();
        assert_eq!(response.header().message_id, 3);
    }

    #[test]
    fn test_completes_at_most_once() {
        let f = future(1);
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        f.on_complete(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert!(f.complete(Err(Arc::new(ClientError::ConnectionClosed))));
        assert!(!f.complete(Ok(echo_response(1))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(f.outcome(), Some(Err(_))));
    }

    #[test]
    fn test_callback_after_completion_runs_immediately() {
        let f = future(1);
        f.complete(Ok(echo_response(1)));
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        f.on_complete(move |outcome| {
            assert!(outcome.is_ok());
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_timeout_reports_interim_without_completing() {
        let f = future(9);
        let mut interim = Header::request(Command::Echo);
        interim.status = Status::PENDING;
        interim.addressing = Addressing::Async { async_id: 77 };
        f.set_interim(interim);
        let err = f.wait_timeout(Duration::from_millis(10)).await.unwrap_err();
        match err {
            ClientError::Timeout {
                message_id,
                interim_status,
                async_id,
                ..
            } => {
                assert_eq!(message_id, 9);
                assert_eq!(interim_status, Some(Status::PENDING));
                assert_eq!(async_id, Some(77));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(!f.is_done());
    }

    #[test]
    fn test_whole_millis_saturates() {
        assert_eq!(whole_millis(Duration::from_millis(1500)), 1500);
        assert_eq!(whole_millis(Duration::MAX), u64::MAX);
    }

    #[test]
    fn test_allowed_statuses() {
        let header = Header::request(Command::SessionSetup);
        let f = RequestFuture::new(header, Bytes::new(), vec![Status::MORE_PROCESSING_REQUIRED]);
        assert!(f.allows(Status::SUCCESS));
        assert!(f.allows(Status::MORE_PROCESSING_REQUIRED));
        assert!(!f.allows(Status::ACCESS_DENIED));
    }
}
