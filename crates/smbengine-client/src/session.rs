//! Authenticated sessions and the channels that carry them.
//!
//! Setup runs the provider's rounds over session setup, hashing every
//! exchanged message into the connection's transcript except the final
//! successful response. Keys are derived from the session key and, on 3.1.1,
//! that transcript. Binding another connection reuses the session key and
//! encryption context; only the channel's signing key is derived afresh.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use smbengine_codec::negotiate::security_mode;
use smbengine_codec::session_setup::SESSION_FLAG_BINDING;
use smbengine_codec::{Body, Dialect, SessionSetupRequest, SessionSetupResponse, Status, TreeConnectRequest};
use tracing::{debug, info, warn};

use crate::auth::AuthProvider;
use crate::connection::{ChannelSecurity, Connection, NegotiatedInfo};
use crate::crypto::{derive_session_keys, derive_signing_key, EncryptionContext, PreauthHash, SecretKey, Signer};
use crate::error::{ClientError, Result};
use crate::pending::{RequestFuture, Response};
use crate::request::Request;
use crate::tree::Tree;

const MAX_AUTH_ROUNDS: usize = 16;

/// One connection bound to a session, with that connection's signing key.
#[derive(Debug, Clone)]
pub struct Channel {
    /// The bound connection.
    pub connection: Connection,
    /// This channel's signer; each bound channel derives its own.
    pub signer: Option<Arc<Signer>>,
}

struct Established {
    session_id: u64,
    session_key: Option<SecretKey>,
    transcript: PreauthHash,
    response: SessionSetupResponse,
    final_response: Response,
}

/// An authenticated session, possibly bound to several connections.
pub struct Session {
    id: u64,
    dialect: Dialect,
    session_key: Option<SecretKey>,
    signer: Option<Arc<Signer>>,
    encryption: Option<Arc<EncryptionContext>>,
    sign: bool,
    encrypt: bool,
    flags: u16,
    channels: Mutex<Vec<Channel>>,
    logged_off: AtomicBool,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &format_args!("{:#x}", self.id))
            .field("dialect", &self.dialect)
            .field("sign", &self.sign)
            .field("encrypt", &self.encrypt)
            .field("channels", &self.channels.lock().len())
            .finish()
    }
}

impl Session {
    /// Authenticates a new session on a negotiated connection.
    pub async fn setup(connection: &Connection, auth: &mut dyn AuthProvider) -> Result<Arc<Session>> {
        let negotiated = connection
            .negotiated()
            .ok_or_else(|| ClientError::state("session setup before negotiate"))?;
        connection.session_setup_started();
        let result = Self::establish(connection, &negotiated, auth).await;
        connection.session_setup_finished(result.is_ok());
        result
    }

    async fn establish(
        connection: &Connection,
        negotiated: &NegotiatedInfo,
        auth: &mut dyn AuthProvider,
    ) -> Result<Arc<Session>> {
        let established = authenticate(connection, negotiated, auth, None).await?;
        let dialect = negotiated.dialect;
        let (signer, encryption) = match &established.session_key {
            Some(session_key) => {
                let keys = derive_session_keys(dialect, session_key, &established.transcript, negotiated.cipher)?;
                let signer = Arc::new(Signer::new(negotiated.signing_algorithm, keys.signing.clone()));
                let encryption = match negotiated.cipher {
                    Some(cipher) if keys.encryption.is_some() => {
                        Some(Arc::new(EncryptionContext::for_session(cipher, &keys)?))
                    }
                    _ => None,
                };
                (Some(signer), encryption)
            }
            None if established.response.is_guest_or_null() => (None, None),
            None => return Err(ClientError::Auth {
                reason: "authentication finished without a session key".into(),
            }),
        };
        if let Some(signer) = &signer {
            verify_final(signer, &established.final_response, negotiated.signing_required)?;
        }

        let encrypt = established.response.encrypt_data() || connection.config().encrypt;
        if encrypt && encryption.is_none() {
            return Err(ClientError::state(format!(
                "session {:#x} must be encrypted but no cipher is available",
                established.session_id
            )));
        }
        let sign = signer.is_some() && negotiated.signing_required;
        connection.install_channel(
            established.session_id,
            ChannelSecurity {
                signer: signer.clone(),
                sign,
                encryption: encryption.clone(),
                encrypt,
            },
        );
        info!(
            session_id = established.session_id,
            dialect = ?dialect,
            sign,
            encrypt,
            "session established"
        );
        Ok(Arc::new(Session {
            id: established.session_id,
            dialect,
            session_key: established.session_key,
            signer: signer.clone(),
            encryption,
            sign,
            encrypt,
            flags: established.response.session_flags,
            channels: Mutex::new(vec![Channel {
                connection: connection.clone(),
                signer,
            }]),
            logged_off: AtomicBool::new(false),
        }))
    }

    /// Binds `connection` as an additional channel of this session.
    pub async fn bind(&self, connection: &Connection, auth: &mut dyn AuthProvider) -> Result<Channel> {
        self.ensure_active()?;
        let negotiated = connection
            .negotiated()
            .ok_or_else(|| ClientError::state("binding before negotiate"))?;
        if !self.dialect.is_smb3() || negotiated.dialect != self.dialect {
            return Err(ClientError::state(format!(
                "cannot bind a {:?} session over a {:?} connection",
                self.dialect, negotiated.dialect
            )));
        }
        let (Some(session_key), Some(primary)) = (&self.session_key, &self.signer) else {
            return Err(ClientError::state("binding needs a signed session"));
        };
        connection.session_setup_started();
        let result = authenticate(connection, &negotiated, auth, Some((self.id, primary.clone()))).await;
        connection.session_setup_finished(result.is_ok());
        let established = result?;
        if established.session_id != self.id {
            return Err(ClientError::bad_packet(format!(
                "binding answered for session {:#x}",
                established.session_id
            )));
        }

        let signing_key = derive_signing_key(self.dialect, session_key, &established.transcript)?;
        let signer = Arc::new(Signer::new(negotiated.signing_algorithm, signing_key));
        verify_final(&signer, &established.final_response, true)?;
        connection.install_channel(
            self.id,
            ChannelSecurity {
                signer: Some(signer.clone()),
                sign: self.sign,
                encryption: self.encryption.clone(),
                encrypt: self.encrypt,
            },
        );
        let channel = Channel {
            connection: connection.clone(),
            signer: Some(signer),
        };
        self.channels.lock().push(channel.clone());
        info!(session_id = self.id, connection = connection.id(), "channel bound");
        Ok(channel)
    }

    /// Session id assigned by the server.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Dialect of the session.
    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    /// Session flags from the final setup response.
    pub fn flags(&self) -> u16 {
        self.flags
    }

    /// Whether requests are signed.
    pub fn is_signed(&self) -> bool {
        self.sign
    }

    /// Whether requests are sealed.
    pub fn is_encrypted(&self) -> bool {
        self.encrypt
    }

    /// Whether the session has logged off.
    pub fn is_logged_off(&self) -> bool {
        self.logged_off.load(Ordering::Acquire)
    }

    /// Encryption state shared by every channel.
    pub fn encryption(&self) -> Option<Arc<EncryptionContext>> {
        self.encryption.clone()
    }

    /// Every channel the session is bound to.
    pub fn channels(&self) -> Vec<Channel> {
        self.channels.lock().clone()
    }

    /// A connection to send on: the first channel still open.
    pub fn connection(&self) -> Result<Connection> {
        self.channels
            .lock()
            .iter()
            .find(|c| !c.connection.is_closed())
            .map(|c| c.connection.clone())
            .ok_or_else(|| ClientError::state(format!("session {:#x} has no open channel", self.id)))
    }

    fn ensure_active(&self) -> Result<()> {
        if self.is_logged_off() {
            return Err(ClientError::state(format!("session {:#x} is logged off", self.id)));
        }
        Ok(())
    }

    /// A request addressed to this session.
    pub fn request(&self, body: Body) -> Result<Request> {
        self.ensure_active()?;
        Ok(Request::new(body)?.with_session(self.id))
    }

    /// Submits a batch on the first open channel.
    pub fn submit(&self, requests: Vec<Request>) -> Result<Vec<RequestFuture>> {
        self.ensure_active()?;
        self.connection()?.submit(requests)
    }

    /// Sends one request on the first open channel and waits for it.
    pub async fn send(&self, request: Request) -> Result<Response> {
        self.ensure_active()?;
        self.connection()?.send(request).await
    }

    /// Sends a batch on the first open channel and waits for every response.
    pub async fn transceive(&self, requests: Vec<Request>) -> Result<Vec<Response>> {
        self.ensure_active()?;
        self.connection()?.transceive(requests).await
    }

    /// Connects to a share such as `\\server\share`.
    pub async fn tree_connect(self: &Arc<Self>, path: &str) -> Result<Arc<Tree>> {
        let request = self.request(Body::TreeConnectRequest(TreeConnectRequest::new(path)))?;
        let response = self.send(request).await?;
        let Body::TreeConnectResponse(body) = response.body() else {
            return Err(ClientError::bad_packet(format!("tree connect answered with {:?}", response.body())));
        };
        let tree_id = response.header().tree_id().unwrap_or_default();
        debug!(session_id = self.id, tree_id, path, "tree connected");
        Ok(Arc::new(Tree::new(self.clone(), tree_id, path, body.clone())))
    }

    /// Ends the session and detaches it from every channel.
    pub async fn logoff(&self) -> Result<()> {
        self.ensure_active()?;
        let request = self.request(Body::LogoffRequest)?;
        let result = self.send(request).await;
        self.logged_off.store(true, Ordering::Release);
        for channel in self.channels.lock().drain(..) {
            channel.connection.session_detached(self.id);
        }
        result?;
        info!(session_id = self.id, "logged off");
        Ok(())
    }
}

/// Runs the provider's rounds. `binding` carries the session being bound and
/// the primary channel's signer.
async fn authenticate(
    connection: &Connection,
    negotiated: &NegotiatedInfo,
    auth: &mut dyn AuthProvider,
    binding: Option<(u64, Arc<Signer>)>,
) -> Result<Established> {
    let timeout = Duration::from_millis(connection.config().request_timeout_ms);
    let mut transcript = negotiated.transcript;
    let mut session_id = binding.as_ref().map_or(0, |(id, _)| *id);
    let mut challenge: Option<Vec<u8>> = None;
    let mut session_key = None;
    let security = if connection.config().require_signing {
        security_mode::SIGNING_REQUIRED
    } else {
        security_mode::SIGNING_ENABLED
    };

    for round in 0..MAX_AUTH_ROUNDS {
        let step = auth.step(challenge.as_deref())?;
        if step.session_key.is_some() {
            session_key = step.session_key;
        }
        let mut request = Request::new(Body::SessionSetupRequest(SessionSetupRequest {
            flags: if binding.is_some() { SESSION_FLAG_BINDING } else { 0 },
            security_mode: security as u8,
            security_buffer: step.token,
            ..Default::default()
        }))?
        .with_session(session_id);
        if let Some((_, signer)) = &binding {
            request = request.signed_with(signer.clone());
        }
        let future = connection.submit_one(request)?;
        let response = future.wait_timeout(timeout).await?;
        transcript.update(future.request_bytes());
        let Body::SessionSetupResponse(body) = response.body() else {
            return Err(ClientError::bad_packet(format!("session setup answered with {:?}", response.body())));
        };
        session_id = response.header().session_id;
        if response.status() == Status::MORE_PROCESSING_REQUIRED {
            transcript.update(&response.raw);
            challenge = Some(body.security_buffer.clone());
            debug!(session_id, round, "session setup needs another round");
            continue;
        }
        auth.finish(&body.security_buffer)?;
        let body = body.clone();
        return Ok(Established {
            session_id,
            session_key,
            transcript,
            response: body,
            final_response: response,
        });
    }
    Err(ClientError::Auth {
        reason: format!("no result after {MAX_AUTH_ROUNDS} rounds"),
    })
}

/// Checks the final setup response, which the server signs with the new key.
fn verify_final(signer: &Signer, response: &Response, required: bool) -> Result<()> {
    let header = response.header();
    if response.encrypted {
        return Ok(());
    }
    if !header.flags.is_signed() {
        if required {
            warn!(session_id = header.session_id, "final session setup response is not signed");
            return Err(ClientError::SignatureMismatch {
                message_id: header.message_id,
            });
        }
        return Ok(());
    }
    if !signer.verify(&response.raw)? {
        return Err(ClientError::SignatureMismatch {
            message_id: header.message_id,
        });
    }
    Ok(())
}
