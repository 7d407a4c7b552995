//! Scripted in-process server shared by the integration tests.
//!
//! The server half of a duplex pipe speaks the same framing and codec as the
//! client, derives the same keys from the same transcript, and answers each
//! request by hand so the tests control ordering, credits, signatures and
//! status.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use smbengine_client::crypto::{
    derive_session_keys, CipherId, EncryptionContext, PreauthHash, SecretKey, SessionKeys, Signer, SigningAlgorithm,
};
use smbengine_client::framing::{encode_frame, FrameDecoder};
use smbengine_client::{
    AuthProvider, AuthStep, Client, ClientConfig, Connection, ConnectionState, NegotiatedInfo, Result, Session, Tree,
};
use smbengine_codec::negotiate::{capabilities, security_mode, HASH_ALGORITHM_SHA512};
use smbengine_codec::{
    decode_chain, encode_chain, Body, Command, Dialect, Envelope, Header, HeaderFlags, NegotiateContext,
    NegotiateResponse, PlainMessage, SessionSetupResponse, Status, TreeConnectResponse, UNSOLICITED_MESSAGE_ID,
};
use tokio::io::{AsyncWriteExt, DuplexStream};
use uuid::Uuid;

pub const SESSION_ID: u64 = 0x1000_0001;
pub const SESSION_KEY: [u8; 16] = [0x5A; 16];
pub const WAIT: Duration = Duration::from_secs(5);
/// How long the server waits before concluding the client is holding a frame.
pub const QUIET: Duration = Duration::from_millis(150);

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn session_key() -> SecretKey {
    SecretKey::new(SESSION_KEY.to_vec())
}

/// Two-round provider: a negotiate token, then the authenticate token and
/// the session key once it has seen the challenge.
#[derive(Default)]
pub struct TwoRound {
    round: usize,
}

impl AuthProvider for TwoRound {
    fn step(&mut self, challenge: Option<&[u8]>) -> Result<AuthStep> {
        self.round += 1;
        match self.round {
            1 => {
                assert!(challenge.is_none());
                Ok(AuthStep::token(b"negotiate".to_vec()))
            }
            _ => {
                assert_eq!(challenge, Some(&b"challenge"[..]));
                Ok(AuthStep::token(b"authenticate".to_vec()).with_key(session_key()))
            }
        }
    }
}

pub struct Received {
    pub raw: Bytes,
    pub sealed: bool,
    pub messages: Vec<PlainMessage>,
}

impl Received {
    pub fn first(&self) -> &PlainMessage {
        &self.messages[0]
    }
}

/// The server side of the pipe.
pub struct Peer {
    pub stream: DuplexStream,
    decoder: FrameDecoder,
    pub signer: Option<Signer>,
    pub encryption: Option<EncryptionContext>,
}

impl Peer {
    pub fn new(stream: DuplexStream) -> Self {
        Self {
            stream,
            decoder: FrameDecoder::new(1 << 20),
            signer: None,
            encryption: None,
        }
    }

    pub async fn recv(&mut self) -> Received {
        self.recv_within(WAIT).await.expect("client sent nothing")
    }

    /// The next frame, or `None` if the client sends nothing within `within`.
    pub async fn recv_within(&mut self, within: Duration) -> Option<Received> {
        let frame = tokio::time::timeout(within, self.decoder.read_frame(&mut self.stream))
            .await
            .ok()?
            .unwrap()
            .expect("client closed the stream");
        let (raw, sealed) = match Envelope::parse(&frame).unwrap() {
            Envelope::Plain(_) => (frame.clone(), false),
            Envelope::Encrypted { header, ciphertext } => {
                let context = self.encryption.as_ref().expect("sealed request before keys");
                (Bytes::from(context.open(&header, ciphertext).unwrap()), true)
            }
        };
        let messages = decode_chain(&raw, Some(Dialect::Smb311))
            .unwrap()
            .into_iter()
            .map(|m| m.value)
            .collect();
        Some(Received { raw, sealed, messages })
    }

    /// Encodes a reply chain, signing each member when asked and the session
    /// has keys.
    pub fn encode(&self, mut messages: Vec<PlainMessage>, sign: bool) -> Vec<u8> {
        let signer = self.signer.as_ref().filter(|_| sign);
        for message in &mut messages {
            message.header.flags.set(HeaderFlags::SIGNED, signer.is_some());
        }
        let (mut buf, spans) = encode_chain(&mut messages, Some(Dialect::Smb311)).unwrap();
        if let Some(signer) = signer {
            for span in &spans {
                signer.sign(&mut buf.as_mut_slice()[span.start.0..span.end.0]).unwrap();
            }
        }
        buf.into_vec()
    }

    pub async fn send_plain(&mut self, payload: &[u8]) {
        self.stream.write_all(&encode_frame(payload).unwrap()).await.unwrap();
    }

    pub async fn send_sealed(&mut self, session_id: u64, payload: &[u8]) {
        let sealed = self.encryption.as_ref().unwrap().seal(session_id, payload).unwrap();
        self.send_plain(&sealed).await;
    }

    /// Sends a reply chain, signed when the peer has a key.
    pub async fn reply(&mut self, messages: Vec<PlainMessage>) -> Vec<u8> {
        let payload = self.encode(messages, true);
        self.send_plain(&payload).await;
        payload
    }

    /// Answers `request` with `body` and a grant of `credits`.
    pub async fn answer(&mut self, request: &PlainMessage, body: Body, credits: u16) {
        let mut header = reply_header(&request.header, Status::SUCCESS);
        header.credits = credits;
        self.reply(vec![PlainMessage::new(header, body)]).await;
    }
}

pub fn reply_header(request: &Header, status: Status) -> Header {
    let mut header = request.clone();
    header.flags = HeaderFlags::empty();
    header.flags.set(HeaderFlags::SERVER_TO_REDIR, true);
    header.status = status;
    header.credits = 32;
    header.credit_charge = 1;
    header.next_command = 0;
    header.signature = [0; 16];
    header
}

pub fn unsolicited(body: Body) -> PlainMessage {
    let mut header = Header::request(Command::OplockBreak);
    header.flags.set(HeaderFlags::SERVER_TO_REDIR, true);
    header.message_id = UNSOLICITED_MESSAGE_ID;
    header.credits = 0;
    PlainMessage::new(header, body)
}

/// A negotiate response choosing `dialect`, with signing required.
pub fn negotiate_response(dialect: Dialect, contexts: Vec<NegotiateContext>) -> NegotiateResponse {
    NegotiateResponse {
        security_mode: security_mode::SIGNING_ENABLED | security_mode::SIGNING_REQUIRED,
        dialect,
        server_guid: Uuid::new_v4(),
        capabilities: capabilities::LEASING | capabilities::LARGE_MTU | capabilities::ENCRYPTION,
        max_transact_size: 1 << 20,
        max_read_size: 1 << 20,
        max_write_size: 1 << 20,
        system_time: 0,
        server_start_time: 0,
        security_buffer: Vec::new(),
        contexts,
    }
}

/// 3.1.1 contexts selecting SHA-512, `cipher` and AES-CMAC.
pub fn contexts_311(cipher: u16) -> Vec<NegotiateContext> {
    vec![
        NegotiateContext::PreauthIntegrity {
            hash_algorithms: vec![HASH_ALGORITHM_SHA512],
            salt: vec![7; 32],
        },
        NegotiateContext::Encryption { ciphers: vec![cipher] },
        NegotiateContext::Signing { algorithms: vec![0x0001] },
    ]
}

/// Runs a negotiate exchange answered with `response` granting `credits`.
/// Returns the client's result and the server's copy of the transcript.
pub async fn negotiate_with(
    connection: &Connection,
    peer: &mut Peer,
    response: NegotiateResponse,
    credits: u16,
) -> (Result<NegotiatedInfo>, PreauthHash) {
    let mut transcript = PreauthHash::begin();
    let (negotiated, ()) = tokio::join!(connection.negotiate(), async {
        let request = peer.recv().await;
        let Body::NegotiateRequest(offer) = &request.first().body else {
            panic!("expected negotiate, got {:?}", request.first().body);
        };
        assert!(offer.dialects.contains(&response.dialect));
        transcript.update(&request.raw);
        let mut header = reply_header(&request.first().header, Status::SUCCESS);
        header.credits = credits;
        let sent = peer
            .reply(vec![PlainMessage::new(header, Body::NegotiateResponse(response))])
            .await;
        transcript.update(&sent);
    });
    if negotiated.as_ref().is_ok_and(|n| !n.dialect.uses_preauth_integrity()) {
        transcript = PreauthHash::Unsupported;
    }
    (negotiated, transcript)
}

/// A client and a connection to a fresh peer, not yet negotiated.
pub fn attach(client: &Client) -> (Connection, Peer) {
    let (client_io, server_io) = tokio::io::duplex(1 << 20);
    (client.attach(client_io, "mock"), Peer::new(server_io))
}

/// Serves a two-round session setup. `binding` is the signer the client must
/// use on binding requests. The final response is signed with a signing key
/// derived from `transcript`; returns the full key schedule.
pub async fn serve_session_setup(
    peer: &mut Peer,
    mut transcript: PreauthHash,
    dialect: Dialect,
    cipher: Option<CipherId>,
    session_flags: u16,
    binding: Option<&Signer>,
) -> SessionKeys {
    let first = peer.recv().await;
    let Body::SessionSetupRequest(setup) = &first.first().body else {
        panic!("expected session setup");
    };
    assert_eq!(setup.security_buffer, b"negotiate");
    if let Some(primary) = binding {
        assert_ne!(setup.flags, 0, "binding flag missing");
        assert_eq!(first.first().header.session_id, SESSION_ID);
        assert!(primary.verify(&first.raw).unwrap());
    }
    transcript.update(&first.raw);
    let mut header = reply_header(&first.first().header, Status::MORE_PROCESSING_REQUIRED);
    header.session_id = SESSION_ID;
    let challenge = PlainMessage::new(
        header,
        Body::SessionSetupResponse(SessionSetupResponse {
            session_flags: 0,
            security_buffer: b"challenge".to_vec(),
        }),
    );
    let payload = peer.encode(vec![challenge], false);
    peer.send_plain(&payload).await;
    transcript.update(&payload);

    let second = peer.recv().await;
    assert_eq!(second.first().header.session_id, SESSION_ID);
    if let Some(primary) = binding {
        assert!(primary.verify(&second.raw).unwrap());
    }
    transcript.update(&second.raw);
    let keys = derive_session_keys(dialect, &session_key(), &transcript, cipher).unwrap();
    peer.signer = Some(Signer::new(SigningAlgorithm::default_for(dialect), keys.signing.clone()));
    if let (Some(cipher), Some(encryption), Some(decryption)) = (cipher, &keys.encryption, &keys.decryption) {
        // The server seals with the server-to-client key and opens with the other.
        peer.encryption = Some(EncryptionContext::new(cipher, decryption, encryption).unwrap());
    }
    let done = PlainMessage::new(
        reply_header(&second.first().header, Status::SUCCESS),
        Body::SessionSetupResponse(SessionSetupResponse {
            session_flags,
            security_buffer: Vec::new(),
        }),
    );
    peer.reply(vec![done]).await;
    keys
}

pub struct Harness {
    pub client: Client,
    pub connection: Connection,
    pub session: Arc<Session>,
    pub peer: Peer,
    pub keys: SessionKeys,
}

/// Negotiates 3.1.1 with AES-128-GCM and AES-CMAC, required signing, and
/// sets up a session over two rounds.
pub async fn establish(session_flags: u16) -> Harness {
    init_tracing();
    let client = Client::new(ClientConfig::default());
    let (connection, mut peer) = attach(&client);
    let (negotiated, transcript) =
        negotiate_with(&connection, &mut peer, negotiate_response(Dialect::Smb311, contexts_311(0x0002)), 32).await;
    let negotiated = negotiated.unwrap();
    assert_eq!(negotiated.cipher, Some(CipherId::Aes128Gcm));
    assert_eq!(negotiated.signing_algorithm, SigningAlgorithm::AesCmac);
    assert!(negotiated.signing_required);
    assert_eq!(connection.state(), ConnectionState::Negotiated);

    let mut auth = TwoRound::default();
    let (session, keys) = tokio::join!(
        Session::setup(&connection, &mut auth),
        serve_session_setup(
            &mut peer,
            transcript,
            Dialect::Smb311,
            Some(CipherId::Aes128Gcm),
            session_flags,
            None
        )
    );
    let session = session.unwrap();
    assert_eq!(session.id(), SESSION_ID);
    assert_eq!(connection.state(), ConnectionState::Active);
    Harness {
        client,
        connection,
        session,
        peer,
        keys,
    }
}

pub fn echo_reply(request: &PlainMessage) -> PlainMessage {
    PlainMessage::new(reply_header(&request.header, Status::SUCCESS), Body::EchoResponse)
}

/// Connects `\\mock\share` as tree `tree_id`.
pub async fn connect_tree(session: &Arc<Session>, peer: &mut Peer, tree_id: u32) -> Arc<Tree> {
    let (tree, ()) = tokio::join!(session.tree_connect(r"\\mock\share"), async {
        let request = peer.recv().await;
        assert!(matches!(request.first().body, Body::TreeConnectRequest(_)));
        let mut header = reply_header(&request.first().header, Status::SUCCESS);
        header.set_tree_id(tree_id);
        peer.reply(vec![PlainMessage::new(
            header,
            Body::TreeConnectResponse(TreeConnectResponse {
                share_type: 1,
                ..Default::default()
            }),
        )])
        .await;
    });
    let tree = tree.unwrap();
    assert_eq!(tree.id(), tree_id);
    tree
}
