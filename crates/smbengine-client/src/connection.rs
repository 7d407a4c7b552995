//! One transport connection to a server.
//!
//! Submitting reserves message ids, serializes and signs a batch, optionally
//! seals it in one transform envelope, and queues it for the writer task.
//! Submissions are serialized so ids reach the queue in the order they were
//! reserved. The writer holds each batch until the credit window admits it
//! and debits the window as it writes; cancels carry no charge and skip past
//! a held batch. The reader task splits incoming frames, opens
//! envelopes, verifies signatures and completes the matching futures;
//! unsolicited break notifications go to the client-scoped dispatcher.
//!
//! A transport or protocol failure closes the connection and completes every
//! queued and in-flight future with one shared error. Sessions, trees and
//! handles built on top are not touched. Dropping the last [`Connection`]
//! clone closes it the same way.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use rand::RngCore;
use smbengine_codec::negotiate::{capabilities, security_mode, HASH_ALGORITHM_SHA512};
use smbengine_codec::{
    decode_chain, encode_chain, Addressing, Body, ByteBuffer, CodecError, Command, Dialect, Envelope, Header,
    HeaderFlags, NegotiateContext, NegotiateRequest, PlainMessage, Status, HEADER_SIZE,
};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::breaks::BreakNotification;
use crate::client::ClientScope;
use crate::config::ClientConfig;
use crate::credits::{credit_charge, CreditWindow, MessageIds};
use crate::crypto::{CipherId, EncryptionContext, PreauthHash, Signer, SigningAlgorithm};
use crate::error::{ClientError, Result};
use crate::framing::{encode_frame, FrameDecoder, LENGTH_PREFIX_SIZE};
use crate::hooks::{HookEvent, HookPayload, Hooks};
use crate::pending::{RequestFuture, Response};
use crate::request::Request;

const SALT_SIZE: usize = 32;

/// Lifecycle of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Stream attached, negotiate not yet done.
    Connecting,
    /// Dialect agreed, no session yet.
    Negotiated,
    /// At least one session setup is in progress.
    SessionEstablishing,
    /// At least one session is established and none is being set up.
    Active,
    /// Terminal; every later submission fails.
    Closed,
}

/// What the server agreed to during negotiation.
#[derive(Debug, Clone)]
pub struct NegotiatedInfo {
    /// The chosen dialect.
    pub dialect: Dialect,
    /// Server security mode bits.
    pub security_mode: u16,
    /// Server capability bits.
    pub capabilities: u32,
    /// Server identifier.
    pub server_guid: Uuid,
    /// Largest transact payload the server accepts.
    pub max_transact_size: u32,
    /// Largest read the server accepts.
    pub max_read_size: u32,
    /// Largest write the server accepts.
    pub max_write_size: u32,
    /// Cipher used to seal traffic, if any.
    pub cipher: Option<CipherId>,
    /// MAC used for signatures.
    pub signing_algorithm: SigningAlgorithm,
    /// Transcript after the negotiate exchange; session setups continue from it.
    pub transcript: PreauthHash,
    /// Set when either side requires signing.
    pub signing_required: bool,
}

impl NegotiatedInfo {
    /// Whether every bit of `capability` was advertised.
    pub fn supports(&self, capability: u32) -> bool {
        self.capabilities & capability == capability
    }
}

/// How one session's traffic is protected on this connection.
#[derive(Debug, Clone, Default)]
pub struct ChannelSecurity {
    /// Signs and verifies this session's messages on this connection.
    pub signer: Option<Arc<Signer>>,
    /// Sign outgoing requests of this session.
    pub sign: bool,
    /// Shared by every channel of the session.
    pub encryption: Option<Arc<EncryptionContext>>,
    /// Seal every outgoing request of this session.
    pub encrypt: bool,
}

/// What to do with the signature of a final response.
enum SignatureCheck {
    Skip,
    /// The channel signs but the response carries no signature.
    Missing,
    Verify(Arc<Signer>),
}

impl SignatureCheck {
    fn for_channel(channel: &ChannelSecurity, signed: bool) -> Self {
        match &channel.signer {
            Some(signer) if signed => SignatureCheck::Verify(signer.clone()),
            Some(_) if channel.sign => SignatureCheck::Missing,
            _ => SignatureCheck::Skip,
        }
    }
}

struct Outgoing {
    frame: Bytes,
    charge: u16,
    /// Final responses this batch will produce.
    expecting: usize,
    first_id: u64,
}

struct State {
    phase: ConnectionState,
    establishing: usize,
    established: usize,
    ids: MessageIds,
    credits: CreditWindow,
    outgoing: VecDeque<Outgoing>,
    in_flight: HashMap<u64, RequestFuture>,
    /// Final responses owed for batches already written.
    awaiting: usize,
    negotiated: Option<NegotiatedInfo>,
    channels: HashMap<u64, ChannelSecurity>,
    terminal: Option<Arc<ClientError>>,
}

impl State {
    fn new() -> Self {
        Self {
            phase: ConnectionState::Connecting,
            establishing: 0,
            established: 0,
            ids: MessageIds::new(),
            credits: CreditWindow::new(1),
            outgoing: VecDeque::new(),
            in_flight: HashMap::new(),
            awaiting: 0,
            negotiated: None,
            channels: HashMap::new(),
            terminal: None,
        }
    }

    fn ensure_open(&self) -> Result<()> {
        match &self.terminal {
            Some(error) => Err(ClientError::Shared(error.clone())),
            None => Ok(()),
        }
    }

    fn dialect(&self) -> Option<Dialect> {
        self.negotiated.as_ref().map(|n| n.dialect)
    }

    fn refresh_phase(&mut self) {
        if self.phase == ConnectionState::Closed || self.negotiated.is_none() {
            return;
        }
        self.phase = if self.establishing > 0 {
            ConnectionState::SessionEstablishing
        } else if self.established > 0 {
            ConnectionState::Active
        } else {
            ConnectionState::Negotiated
        };
    }
}

struct Shared {
    id: u64,
    peer: String,
    config: ClientConfig,
    client_guid: Uuid,
    scope: ClientScope,
    hooks: Hooks,
    state: Mutex<State>,
    /// Held from id reservation until the batch is queued.
    submit_order: Mutex<()>,
    writer_wake: Notify,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Closes the connection when the last user handle goes away. The reader and
/// writer tasks hold [`Shared`] but never an `Owner`.
struct Owner {
    shared: Arc<Shared>,
}

impl Drop for Owner {
    fn drop(&mut self) {
        if self.shared.close(ClientError::ConnectionClosed) {
            debug!(connection = self.shared.id, "last handle dropped");
        }
    }
}

/// Handle to a connection. Clones share the same transport and state; the
/// connection closes when the last clone is dropped.
#[derive(Clone)]
pub struct Connection {
    shared: Arc<Shared>,
    _owner: Arc<Owner>,
}

/// A reference that does not keep the connection open.
#[derive(Debug, Clone)]
pub(crate) struct WeakConnection {
    shared: Weak<Shared>,
    owner: Weak<Owner>,
}

impl WeakConnection {
    pub(crate) fn upgrade(&self) -> Option<Connection> {
        Some(Connection {
            shared: self.shared.upgrade()?,
            _owner: self.owner.upgrade()?,
        })
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.shared.id)
            .field("peer", &self.shared.peer)
            .field("state", &self.state())
            .finish()
    }
}

impl Connection {
    /// Starts the reader and writer tasks over `stream`. Must be called from
    /// within a tokio runtime.
    pub fn new<S>(stream: S, peer: impl Into<String>, config: ClientConfig, scope: ClientScope) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        static NEXT_ID: AtomicU64 = AtomicU64::new(1);

        let max_frame_size = config.max_frame_size;
        let shared = Arc::new(Shared {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            peer: peer.into(),
            client_guid: config.client_guid.unwrap_or_else(Uuid::new_v4),
            config,
            scope,
            hooks: Hooks::default(),
            state: Mutex::new(State::new()),
            submit_order: Mutex::new(()),
            writer_wake: Notify::new(),
            tasks: Mutex::new(Vec::new()),
        });
        let (reader, writer) = tokio::io::split(stream);
        let read_task = tokio::spawn(read_loop(shared.clone(), reader, max_frame_size));
        let write_task = tokio::spawn(write_loop(shared.clone(), writer));
        shared.tasks.lock().extend([read_task, write_task]);
        debug!(connection = shared.id, peer = %shared.peer, "connection started");
        Self {
            _owner: Arc::new(Owner { shared: shared.clone() }),
            shared,
        }
    }

    /// Process-unique connection number, used in logs.
    pub fn id(&self) -> u64 {
        self.shared.id
    }

    pub(crate) fn downgrade(&self) -> WeakConnection {
        WeakConnection {
            shared: Arc::downgrade(&self.shared),
            owner: Arc::downgrade(&self._owner),
        }
    }

    /// Address or label given when the connection was opened.
    pub fn peer(&self) -> &str {
        &self.shared.peer
    }

    /// Configuration in effect.
    pub fn config(&self) -> &ClientConfig {
        &self.shared.config
    }

    /// Client identifier sent at negotiation.
    pub fn client_guid(&self) -> Uuid {
        self.shared.client_guid
    }

    /// Tables shared with the owning client.
    pub fn scope(&self) -> &ClientScope {
        &self.shared.scope
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        self.shared.state.lock().phase
    }

    /// What negotiation agreed, once it has run.
    pub fn negotiated(&self) -> Option<NegotiatedInfo> {
        self.shared.state.lock().negotiated.clone()
    }

    /// Credits currently available for sending.
    pub fn credits(&self) -> u32 {
        self.shared.state.lock().credits.available()
    }

    /// Number of requests submitted and not yet completed.
    pub fn in_flight(&self) -> usize {
        self.shared.state.lock().in_flight.len()
    }

    /// The error the connection was closed with, once closed.
    pub fn terminal_error(&self) -> Option<Arc<ClientError>> {
        self.shared.state.lock().terminal.clone()
    }

    /// Whether the connection has closed.
    pub fn is_closed(&self) -> bool {
        self.state() == ConnectionState::Closed
    }

    /// Keeps `id` out of every future message-id reservation.
    pub fn blacklist_message_id(&self, id: u64) {
        self.shared.state.lock().ids.blacklist(id);
    }

    /// Registers a lifecycle callback. Callbacks run inline on the submitting
    /// task or the connection's tasks and must not submit on this connection.
    pub fn register_callback(&self, event: HookEvent, callback: impl Fn(HookEvent, HookPayload<'_>) + Send + Sync + 'static) {
        self.shared.hooks.register(event, Arc::new(callback));
    }

    /// Protection state of `session_id` on this connection.
    pub fn channel(&self, session_id: u64) -> Option<ChannelSecurity> {
        self.shared.state.lock().channels.get(&session_id).cloned()
    }

    pub(crate) fn install_channel(&self, session_id: u64, security: ChannelSecurity) {
        self.shared.state.lock().channels.insert(session_id, security);
    }

    pub(crate) fn remove_channel(&self, session_id: u64) {
        self.shared.state.lock().channels.remove(&session_id);
    }

    pub(crate) fn session_setup_started(&self) {
        let mut state = self.shared.state.lock();
        state.establishing += 1;
        state.refresh_phase();
    }

    pub(crate) fn session_setup_finished(&self, established: bool) {
        let mut state = self.shared.state.lock();
        state.establishing = state.establishing.saturating_sub(1);
        if established {
            state.established += 1;
        }
        state.refresh_phase();
    }

    pub(crate) fn session_detached(&self, session_id: u64) {
        let mut state = self.shared.state.lock();
        if state.channels.remove(&session_id).is_some() {
            state.established = state.established.saturating_sub(1);
        }
        state.refresh_phase();
    }

    fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.shared.config.request_timeout_ms)
    }

    /// Submits a batch as one wire frame. With more than one request the
    /// batch is a compound chain; members flagged related share the previous
    /// member's session, tree and file.
    ///
    /// Returns one future per request. A cancel must be submitted alone and
    /// returns its target's future.
    pub fn submit(&self, requests: Vec<Request>) -> Result<Vec<RequestFuture>> {
        if requests.is_empty() {
            return Err(ClientError::request("empty batch"));
        }
        if requests.iter().any(Request::is_cancel) {
            if requests.len() != 1 {
                return Err(ClientError::request("a cancel cannot be compounded"));
            }
            let target = requests
                .into_iter()
                .find_map(|r| r.cancel_target)
                .ok_or_else(|| ClientError::request("cancel without a target"))?;
            return self.submit_cancel(target).map(|f| vec![f]);
        }
        let shared = &*self.shared;
        let _order = shared.submit_order.lock();
        let rewind_to = shared.state.lock().ids.next();
        let result = self.queue_batch(requests);
        if result.is_err() {
            shared.state.lock().ids.rewind(rewind_to);
        }
        result
    }

    /// Reserves ids for, serializes and queues one batch. Runs under
    /// `submit_order`, so nothing else reserves ids meanwhile.
    fn queue_batch(&self, requests: Vec<Request>) -> Result<Vec<RequestFuture>> {
        let shared = &*self.shared;
        let count = requests.len();
        let mut messages = Vec::with_capacity(count);
        let mut allowed = Vec::with_capacity(count);
        let mut overrides = Vec::with_capacity(count);
        let mut force_encrypt = false;
        let (dialect, channel, charge) = {
            let mut state = shared.state.lock();
            state.ensure_open()?;
            let dialect = state.dialect();
            let large_mtu = dialect.is_some_and(Dialect::supports_large_mtu);
            let mut total: u16 = 0;
            for request in requests {
                let mut message = request.message;
                let member_charge = credit_charge(&message.body, large_mtu);
                message.header.message_id = state.ids.reserve(member_charge);
                message.header.credit_charge = if large_mtu { member_charge } else { 0 };
                message.header.credits = shared.config.credits_for(member_charge);
                total = total.saturating_add(member_charge);
                let mut extra = request.allowed;
                if message.header.command == Command::SessionSetup {
                    extra.push(Status::MORE_PROCESSING_REQUIRED);
                }
                force_encrypt |= request.encrypt;
                allowed.push(extra);
                overrides.push(request.signer);
                messages.push(message);
            }
            let session_id = messages[0].header.session_id;
            let channel = state.channels.get(&session_id).cloned().unwrap_or_default();
            (dialect, channel, total)
        };

        let session_id = messages[0].header.session_id;
        let sealer = if channel.encrypt || force_encrypt {
            let context = channel.encryption.clone().ok_or_else(|| {
                ClientError::request(format!("session {session_id:#x} has no encryption keys"))
            })?;
            Some(context)
        } else {
            None
        };
        let signers: Vec<Option<Arc<Signer>>> = messages
            .iter_mut()
            .zip(overrides)
            .map(|(message, explicit)| {
                let signer = match explicit {
                    Some(signer) => Some(signer),
                    None if channel.sign => channel.signer.clone(),
                    None => None,
                };
                let signer = signer.filter(|_| sealer.is_none() && message.header.session_id != 0);
                message.header.flags.set(HeaderFlags::SIGNED, signer.is_some());
                signer
            })
            .collect();

        shared.hooks.fire(HookEvent::PreSerialize, HookPayload::Messages(&messages));
        let (mut buf, spans) = encode_chain(&mut messages, dialect)?;
        for ((message, span), signer) in messages.iter_mut().zip(&spans).zip(&signers) {
            if let Some(signer) = signer {
                message.header.signature = signer.sign(&mut buf.as_mut_slice()[span.start.0..span.end.0])?;
            }
        }
        let plaintext = Bytes::from(buf.into_vec());
        shared.hooks.fire(HookEvent::PostSerialize, HookPayload::Bytes(&plaintext));
        let frame = match &sealer {
            Some(context) => encode_frame(&context.seal(session_id, &plaintext)?)?,
            None => encode_frame(&plaintext)?,
        };

        let futures: Vec<RequestFuture> = messages
            .iter()
            .zip(&spans)
            .zip(allowed)
            .map(|((message, span), allowed)| {
                let future = RequestFuture::new(
                    message.header.clone(),
                    plaintext.slice(span.start.0..span.end.0),
                    allowed,
                );
                if sealer.is_some() {
                    future.mark_sealed();
                }
                future
            })
            .collect();
        let first_id = messages[0].header.message_id;
        {
            let mut state = shared.state.lock();
            state.ensure_open()?;
            for future in &futures {
                state.in_flight.insert(future.message_id(), future.clone());
            }
            state.outgoing.push_back(Outgoing {
                frame,
                charge,
                expecting: futures.len(),
                first_id,
            });
        }
        shared.writer_wake.notify_one();
        trace!(
            connection = shared.id,
            message_id = first_id,
            members = count,
            charge,
            sealed = sealer.is_some(),
            "batch queued"
        );
        Ok(futures)
    }

    /// Submits a single request.
    pub fn submit_one(&self, request: Request) -> Result<RequestFuture> {
        self.submit(vec![request])?
            .pop()
            .ok_or_else(|| ClientError::state("submission produced no future"))
    }

    /// Asks the server to cancel `target`. The target's future stays pending
    /// until the server answers it; the returned future is the target itself.
    pub fn cancel(&self, target: &RequestFuture) -> Result<RequestFuture> {
        self.submit_cancel(target.clone())
    }

    fn submit_cancel(&self, target: RequestFuture) -> Result<RequestFuture> {
        let shared = &*self.shared;
        let (dialect, channel) = {
            let state = shared.state.lock();
            state.ensure_open()?;
            let tracked = state
                .in_flight
                .get(&target.message_id())
                .is_some_and(|f| f.same_request(&target));
            if !tracked || target.is_done() {
                return Err(ClientError::state(format!(
                    "message {} is not in flight and cannot be cancelled",
                    target.message_id()
                )));
            }
            let session_id = target.request().session_id;
            (state.dialect(), state.channels.get(&session_id).cloned().unwrap_or_default())
        };

        let original = target.request();
        let mut header = Header::request(Command::Cancel);
        header.message_id = target.message_id();
        header.credit_charge = 0;
        header.credits = 0;
        header.session_id = original.session_id;
        header.addressing = match target.async_id() {
            Some(async_id) => Addressing::Async { async_id },
            None => original.addressing,
        };
        let sealer = if target.was_sealed() || channel.encrypt {
            channel.encryption.clone()
        } else {
            None
        };
        let signer = channel
            .signer
            .clone()
            .filter(|_| channel.sign && sealer.is_none() && header.session_id != 0);
        header.flags.set(HeaderFlags::SIGNED, signer.is_some());

        let message = PlainMessage::new(header, Body::CancelRequest);
        shared
            .hooks
            .fire(HookEvent::PreSerialize, HookPayload::Messages(std::slice::from_ref(&message)));
        let mut buf = ByteBuffer::new();
        message.encode(&mut buf, dialect)?;
        if let Some(signer) = &signer {
            signer.sign(buf.as_mut_slice())?;
        }
        shared.hooks.fire(HookEvent::PostSerialize, HookPayload::Bytes(buf.as_slice()));
        let frame = match &sealer {
            Some(context) => encode_frame(&context.seal(message.header.session_id, buf.as_slice())?)?,
            None => encode_frame(buf.as_slice())?,
        };
        {
            let mut state = shared.state.lock();
            state.ensure_open()?;
            state.outgoing.push_back(Outgoing {
                frame,
                charge: 0,
                expecting: 0,
                first_id: target.message_id(),
            });
        }
        shared.writer_wake.notify_one();
        debug!(
            connection = shared.id,
            message_id = target.message_id(),
            async_id = ?target.async_id(),
            "cancel queued"
        );
        Ok(target)
    }

    /// Submits a batch and waits for every response, in submission order.
    pub async fn transceive(&self, requests: Vec<Request>) -> Result<Vec<Response>> {
        let futures = self.submit(requests)?;
        let timeout = self.request_timeout();
        let mut responses = Vec::with_capacity(futures.len());
        for future in &futures {
            responses.push(future.wait_timeout(timeout).await?);
        }
        Ok(responses)
    }

    /// Submits one request and waits for its response.
    pub async fn send(&self, request: Request) -> Result<Response> {
        self.submit_one(request)?.wait_timeout(self.request_timeout()).await
    }

    /// Round-trips an echo.
    pub async fn echo(&self) -> Result<()> {
        let response = self.send(Request::new(Body::EchoRequest)?).await?;
        match response.body() {
            Body::EchoResponse => Ok(()),
            other => Err(ClientError::bad_packet(format!("echo answered with {other:?}"))),
        }
    }

    /// Negotiates the dialect and security parameters. Must be the first
    /// exchange on the connection.
    pub async fn negotiate(&self) -> Result<NegotiatedInfo> {
        if self.state() != ConnectionState::Connecting {
            return Err(ClientError::state("negotiate must be the first exchange"));
        }
        let config = &self.shared.config;
        let dialects = config.dialects()?;
        let mut contexts = Vec::new();
        if dialects.contains(&Dialect::Smb311) {
            let mut salt = vec![0u8; SALT_SIZE];
            rand::thread_rng().fill_bytes(&mut salt);
            contexts.push(NegotiateContext::PreauthIntegrity {
                hash_algorithms: vec![HASH_ALGORITHM_SHA512],
                salt,
            });
            if !config.ciphers.is_empty() {
                contexts.push(NegotiateContext::Encryption {
                    ciphers: config.ciphers.clone(),
                });
            }
            if !config.signing_algorithms.is_empty() {
                contexts.push(NegotiateContext::Signing {
                    algorithms: config.signing_algorithms.clone(),
                });
            }
        }
        let mut client_capabilities = capabilities::LEASING
            | capabilities::LARGE_MTU
            | capabilities::MULTI_CHANNEL
            | capabilities::PERSISTENT_HANDLES
            | capabilities::DIRECTORY_LEASING;
        if !config.ciphers.is_empty() {
            client_capabilities |= capabilities::ENCRYPTION;
        }
        let mut client_security = security_mode::SIGNING_ENABLED;
        if config.require_signing {
            client_security |= security_mode::SIGNING_REQUIRED;
        }
        let request = Request::new(Body::NegotiateRequest(NegotiateRequest {
            security_mode: client_security,
            capabilities: client_capabilities,
            client_guid: self.shared.client_guid,
            dialects: dialects.clone(),
            contexts,
        }))?;

        let future = self.submit_one(request)?;
        let response = future.wait_timeout(self.request_timeout()).await?;
        let Body::NegotiateResponse(negotiated) = response.body() else {
            return Err(ClientError::bad_packet(format!("negotiate answered with {:?}", response.body())));
        };
        let dialect = negotiated.dialect;
        if !dialects.contains(&dialect) {
            return Err(ClientError::bad_packet(format!("server chose unoffered dialect {dialect:?}")));
        }

        let mut transcript = PreauthHash::Unsupported;
        if dialect.uses_preauth_integrity() {
            match negotiated.preauth_hash_algorithm() {
                Some(HASH_ALGORITHM_SHA512) => {}
                other => {
                    return Err(ClientError::bad_packet(format!(
                        "unsupported pre-authentication hash algorithm {other:?}"
                    )))
                }
            }
            transcript = PreauthHash::begin();
            transcript.update(future.request_bytes());
            transcript.update(&response.raw);
        }

        let cipher = if dialect.uses_preauth_integrity() {
            match negotiated.cipher() {
                None | Some(0) => None,
                Some(chosen) => Some(
                    CipherId::from_wire(chosen)
                        .filter(|_| config.ciphers.contains(&chosen))
                        .ok_or_else(|| ClientError::CipherMismatch {
                            offered: config.ciphers.clone(),
                            chosen,
                        })?,
                ),
            }
        } else if dialect.is_smb3() && negotiated.capabilities & capabilities::ENCRYPTION != 0 {
            Some(CipherId::Aes128Ccm)
        } else {
            None
        };
        if config.encrypt && cipher.is_none() {
            return Err(ClientError::CipherMismatch {
                offered: config.ciphers.clone(),
                chosen: 0,
            });
        }

        let signing_algorithm = match negotiated.signing_algorithm() {
            Some(id) if dialect.uses_preauth_integrity() => SigningAlgorithm::from_wire(id)
                .ok_or_else(|| ClientError::bad_packet(format!("unknown signing algorithm {id}")))?,
            _ => SigningAlgorithm::default_for(dialect),
        };

        let info = NegotiatedInfo {
            dialect,
            security_mode: negotiated.security_mode,
            capabilities: negotiated.capabilities,
            server_guid: negotiated.server_guid,
            max_transact_size: negotiated.max_transact_size,
            max_read_size: negotiated.max_read_size,
            max_write_size: negotiated.max_write_size,
            cipher,
            signing_algorithm,
            transcript,
            signing_required: config.require_signing
                || negotiated.security_mode & security_mode::SIGNING_REQUIRED != 0,
        };
        {
            let mut state = self.shared.state.lock();
            state.ensure_open()?;
            state.negotiated = Some(info.clone());
            state.phase = ConnectionState::Negotiated;
        }
        info!(
            connection = self.shared.id,
            dialect = ?dialect,
            cipher = ?cipher,
            signing = ?signing_algorithm,
            "negotiated"
        );
        Ok(info)
    }

    /// Closes the connection. Every queued and in-flight request completes
    /// with the same [`ClientError::ConnectionClosed`].
    pub fn close(&self) {
        self.shared.close(ClientError::ConnectionClosed);
    }
}

impl Shared {
    fn close(&self, error: ClientError) -> bool {
        let terminal = Arc::new(error);
        let futures: Vec<RequestFuture> = {
            let mut state = self.state.lock();
            if state.terminal.is_some() {
                return false;
            }
            state.phase = ConnectionState::Closed;
            state.terminal = Some(terminal.clone());
            state.outgoing.clear();
            state.awaiting = 0;
            state.channels.clear();
            state.in_flight.drain().map(|(_, f)| f).collect()
        };
        info!(connection = self.id, error = %terminal, pending = futures.len(), "connection closed");
        for future in futures {
            future.complete(Err(terminal.clone()));
        }
        self.writer_wake.notify_one();
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        true
    }

    /// Processes one received frame. An error closes the connection.
    fn handle_frame(&self, frame: Bytes) -> Result<()> {
        self.hooks.fire(HookEvent::PreReceive, HookPayload::Bytes(&frame));
        let (plaintext, encrypted) = match Envelope::parse(&frame)? {
            Envelope::Plain(_) => (frame.clone(), false),
            Envelope::Encrypted { header, ciphertext } => {
                let context = self
                    .state
                    .lock()
                    .channels
                    .get(&header.session_id)
                    .and_then(|c| c.encryption.clone())
                    .ok_or_else(|| {
                        ClientError::bad_packet(format!(
                            "encrypted message for unknown session {:#x}",
                            header.session_id
                        ))
                    })?;
                (Bytes::from(context.open(&header, ciphertext)?), true)
            }
        };
        self.hooks.fire(HookEvent::PostReceive, HookPayload::Bytes(&plaintext));
        self.hooks.fire(HookEvent::PreDeserialize, HookPayload::Bytes(&plaintext));

        let dialect = self.state.lock().dialect();
        let members = match decode_chain(&plaintext, dialect) {
            Ok(members) => members,
            Err(error) => return self.fail_undecodable(&plaintext, error),
        };
        if self.hooks.wants(HookEvent::PostDeserialize) {
            let messages: Vec<PlainMessage> = members.iter().map(|m| m.value.clone()).collect();
            self.hooks.fire(HookEvent::PostDeserialize, HookPayload::Messages(&messages));
        }
        for member in members {
            let raw = plaintext.slice(member.span.start.0..member.span.end.0);
            self.route(member.value, raw, encrypted);
        }
        Ok(())
    }

    /// A frame that will not decode fails only its own request when the
    /// header is readable; otherwise the stream is unusable.
    fn fail_undecodable(&self, plaintext: &[u8], error: CodecError) -> Result<()> {
        let field = |at: usize, len: usize| plaintext.get(at..at + len).filter(|_| plaintext.len() >= HEADER_SIZE);
        let (Some(credits), Some(message_id)) = (field(14, 2), field(24, 8)) else {
            return Err(error.into());
        };
        let credits = u16::from_le_bytes([credits[0], credits[1]]);
        let mut id = [0u8; 8];
        id.copy_from_slice(message_id);
        let message_id = u64::from_le_bytes(id);
        let future = {
            let mut state = self.state.lock();
            state.credits.grant(credits);
            let future = state.in_flight.remove(&message_id);
            if future.is_some() {
                state.awaiting = state.awaiting.saturating_sub(1);
            }
            future
        };
        self.writer_wake.notify_one();
        match future {
            Some(future) => {
                warn!(connection = self.id, message_id, %error, "undecodable response");
                future.complete(Err(Arc::new(error.into())));
                Ok(())
            }
            None => Err(error.into()),
        }
    }

    fn route(&self, message: PlainMessage, raw: Bytes, encrypted: bool) {
        let header = &message.header;
        let message_id = header.message_id;
        let mut state = self.state.lock();
        if state.terminal.is_some() {
            return;
        }
        state.credits.grant(header.credits);
        if header.is_unsolicited() {
            drop(state);
            self.writer_wake.notify_one();
            self.route_break(message);
            return;
        }
        let Some(future) = state.in_flight.get(&message_id).cloned() else {
            drop(state);
            self.writer_wake.notify_one();
            warn!(connection = self.id, message_id, command = %header.command, "response for unknown message");
            return;
        };
        if header.is_interim() {
            drop(state);
            self.writer_wake.notify_one();
            trace!(connection = self.id, message_id, async_id = ?header.async_id(), "interim response");
            future.set_interim(message.header);
            return;
        }
        state.in_flight.remove(&message_id);
        state.awaiting = state.awaiting.saturating_sub(1);
        let check = if encrypted {
            SignatureCheck::Skip
        } else {
            match state.channels.get(&header.session_id) {
                Some(channel) => SignatureCheck::for_channel(channel, header.flags.is_signed()),
                None => SignatureCheck::Skip,
            }
        };
        drop(state);
        self.writer_wake.notify_one();

        let verified = match check {
            SignatureCheck::Skip => Ok(true),
            SignatureCheck::Missing => Ok(false),
            SignatureCheck::Verify(signer) => signer.verify(&raw),
        };
        let outcome = match verified {
            Ok(false) => {
                warn!(
                    connection = self.id,
                    message_id,
                    signed = header.flags.is_signed(),
                    "response signature mismatch"
                );
                Err(Arc::new(ClientError::SignatureMismatch { message_id }))
            }
            Err(error) => Err(Arc::new(error)),
            Ok(_) if !future.allows(header.status) => Err(Arc::new(ClientError::Response {
                command: header.command,
                status: header.status,
                message_id,
            })),
            Ok(_) => Ok(Response {
                message,
                raw,
                encrypted,
            }),
        };
        future.complete(outcome);
    }

    fn route_break(&self, message: PlainMessage) {
        let notification = match message.body {
            Body::OplockBreak(b) => BreakNotification::Oplock(b),
            Body::LeaseBreakNotification(b) => BreakNotification::Lease(b),
            other => {
                warn!(connection = self.id, body = ?other, "unexpected unsolicited message");
                return;
            }
        };
        debug!(connection = self.id, key = ?notification.key(), "break received");
        self.scope.breaks.deliver(notification);
    }
}

async fn read_loop<R>(shared: Arc<Shared>, mut reader: R, max_frame_size: u32)
where
    R: AsyncRead + Unpin,
{
    let mut decoder = FrameDecoder::new(max_frame_size);
    loop {
        match decoder.read_frame(&mut reader).await {
            Ok(Some(frame)) => {
                if let Err(error) = shared.handle_frame(frame) {
                    warn!(connection = shared.id, %error, "protocol error, closing");
                    shared.close(error);
                    return;
                }
            }
            Ok(None) => {
                debug!(connection = shared.id, "peer closed the stream");
                shared.close(ClientError::ConnectionClosed);
                return;
            }
            Err(error) => {
                warn!(connection = shared.id, %error, "read failed, closing");
                shared.close(error);
                return;
            }
        }
    }
}

async fn write_loop<W>(shared: Arc<Shared>, mut writer: W)
where
    W: AsyncWrite + Unpin,
{
    loop {
        let batch = loop {
            {
                let mut state = shared.state.lock();
                if state.terminal.is_some() {
                    return;
                }
                let next = match state.outgoing.front() {
                    Some(front) if state.credits.admits(front.charge, state.awaiting) => Some(0),
                    // Cancels cost nothing and must not wait behind a held batch.
                    Some(_) => state.outgoing.iter().position(|b| b.charge == 0),
                    None => None,
                };
                if let Some(batch) = next.and_then(|at| state.outgoing.remove(at)) {
                    state.credits.debit(batch.charge);
                    state.awaiting += batch.expecting;
                    break batch;
                }
            }
            shared.writer_wake.notified().await;
        };
        let payload = &batch.frame[LENGTH_PREFIX_SIZE..];
        shared.hooks.fire(HookEvent::PreSend, HookPayload::Bytes(payload));
        let written = async {
            writer.write_all(&batch.frame).await?;
            writer.flush().await
        }
        .await;
        if let Err(error) = written {
            warn!(connection = shared.id, %error, "write failed, closing");
            shared.close(error.into());
            return;
        }
        shared.hooks.fire(HookEvent::PostSend, HookPayload::Bytes(payload));
        trace!(
            connection = shared.id,
            message_id = batch.first_id,
            bytes = batch.frame.len(),
            "frame written"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connection() -> (Connection, tokio::io::DuplexStream) {
        let (client, server) = tokio::io::duplex(64 * 1024);
        (Connection::new(client, "test", ClientConfig::default(), ClientScope::default()), server)
    }

    #[tokio::test]
    async fn test_starts_connecting_with_one_credit() {
        let (conn, _server) = connection();
        assert_eq!(conn.state(), ConnectionState::Connecting);
        assert_eq!(conn.credits(), 1);
        assert!(conn.negotiated().is_none());
    }

    #[tokio::test]
    async fn test_empty_batch_rejected() {
        let (conn, _server) = connection();
        assert!(matches!(conn.submit(Vec::new()), Err(ClientError::Request { .. })));
    }

    #[tokio::test]
    async fn test_submit_after_close_fails_with_terminal_error() {
        let (conn, _server) = connection();
        conn.close();
        assert_eq!(conn.state(), ConnectionState::Closed);
        let err = conn.submit_one(Request::new(Body::EchoRequest).unwrap()).unwrap_err();
        assert!(matches!(err.root(), ClientError::ConnectionClosed));
    }

    #[tokio::test]
    async fn test_cancel_of_unknown_request_is_state_error() {
        let (conn, _server) = connection();
        let stray = RequestFuture::new(Header::request(Command::Read), Bytes::new(), Vec::new());
        assert!(matches!(conn.cancel(&stray), Err(ClientError::State { .. })));
    }

    #[tokio::test]
    async fn test_cancel_cannot_be_compounded() {
        let (conn, _server) = connection();
        let target = conn.submit_one(Request::new(Body::EchoRequest).unwrap()).unwrap();
        let batch = vec![Request::cancel(&target), Request::new(Body::EchoRequest).unwrap()];
        assert!(matches!(conn.submit(batch), Err(ClientError::Request { .. })));
    }

    #[tokio::test]
    async fn test_peer_eof_closes_and_fails_in_flight() {
        let (conn, server) = connection();
        let future = conn.submit_one(Request::new(Body::EchoRequest).unwrap()).unwrap();
        drop(server);
        let err = future.wait_timeout(Duration::from_secs(2)).await.unwrap_err();
        assert!(matches!(err.root(), ClientError::ConnectionClosed | ClientError::Io(_)));
        assert!(conn.is_closed());
    }

    #[tokio::test]
    async fn test_dropping_last_clone_closes_transport() {
        use tokio::io::AsyncReadExt;

        let (conn, mut server) = connection();
        let other = conn.clone();
        let future = conn.submit_one(Request::new(Body::EchoRequest).unwrap()).unwrap();
        drop(conn);
        assert!(!other.is_closed());
        drop(other);

        let err = future.outcome().unwrap().unwrap_err();
        assert!(matches!(*err, ClientError::ConnectionClosed));
        let mut sent = Vec::new();
        tokio::time::timeout(Duration::from_secs(2), server.read_to_end(&mut sent))
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_rejected_batch_hands_its_ids_back() {
        let (conn, _server) = connection();
        let first = conn.submit_one(Request::new(Body::EchoRequest).unwrap()).unwrap();
        let sealed = Request::new(Body::EchoRequest).unwrap().with_session(7).encrypted();
        assert!(matches!(conn.submit_one(sealed), Err(ClientError::Request { .. })));
        let second = conn.submit_one(Request::new(Body::EchoRequest).unwrap()).unwrap();
        assert_eq!(second.message_id(), first.message_id() + 1);
    }

    #[tokio::test]
    async fn test_concurrent_submits_queue_in_id_order() {
        let (conn, _server) = connection();
        let submitters: Vec<_> = (0..8)
            .map(|_| {
                let conn = conn.clone();
                tokio::spawn(async move {
                    (0..16)
                        .map(|_| conn.submit_one(Request::new(Body::EchoRequest).unwrap()).unwrap().message_id())
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        for submitter in submitters {
            submitter.await.unwrap();
        }
        let state = conn.shared.state.lock();
        let queued: Vec<u64> = state.outgoing.iter().map(|b| b.first_id).collect();
        // The initial credit may already have let the first echo out.
        assert!(queued.len() >= 8 * 16 - 1);
        assert!(queued.windows(2).all(|w| w[0] < w[1]));
    }
}
