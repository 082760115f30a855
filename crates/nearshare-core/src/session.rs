//! Session state machine.
//!
//! One session per remote peer, driven Connect → Auth → AuthDone →
//! Established by inbound frames. The session owns the cryptor, the channel
//! table, and the reassembly table; disposal cascades to all of them and is
//! idempotent from any thread.
//!
//! Connect and Control messages are answered inline on the connection
//! reader. Completed Session messages are handed to a background task so the
//! reader can keep draining frames while the application waits on user
//! acceptance or disk I/O.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use dashmap::DashMap;
use rand::rngs::OsRng;
use rand::RngCore;
use tokio::io::AsyncWriteExt;
use tokio::sync::watch;

use nearshare_crypto::{thumbprint, Cryptor, KeyPair, CURVE_P256, HMAC_SIZE};

use crate::channel::{AppMessage, Channel};
use crate::error::{ProtocolError, Result};
use crate::header::{
    pack_session_id, session_local, session_remote, AdditionalHeader, CommonHeader, MessageType,
};
use crate::host::{SessionHost, SharedWriter};
use crate::platform::{LocalIdentity, RemoteDevice, ShareHandler};
use crate::reassembly::PendingMessage;
use crate::wire::{Reader, WireError, Writer};
use crate::{FIRST_CHANNEL_ID, UPGRADE_FAILURE_HRESULT};

/// Connect-level message discriminants (first body byte of Connect frames)
mod connection_type {
    pub const CONNECT_REQUEST: u8 = 0;
    pub const CONNECT_RESPONSE: u8 = 1;
    pub const DEVICE_AUTH_REQUEST: u8 = 2;
    pub const DEVICE_AUTH_RESPONSE: u8 = 3;
    pub const USER_DEVICE_AUTH_REQUEST: u8 = 4;
    pub const USER_DEVICE_AUTH_RESPONSE: u8 = 5;
    pub const AUTH_DONE_REQUEST: u8 = 6;
    pub const AUTH_DONE_RESPONSE: u8 = 7;
    pub const DEVICE_INFO_MESSAGE: u8 = 8;
    pub const DEVICE_INFO_RESPONSE: u8 = 9;
    pub const UPGRADE_REQUEST: u8 = 10;
    pub const UPGRADE_FAILURE: u8 = 11;
}

/// Control-level message discriminants
mod control_type {
    pub const START_CHANNEL_REQUEST: u8 = 0;
    pub const START_CHANNEL_RESPONSE: u8 = 1;
}

/// Connect result carried in a ConnectResponse
const CONNECT_RESULT_PENDING: u8 = 0;

/// Handshake lifecycle of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionPhase {
    /// Waiting for the peer's ConnectRequest
    AwaitingConnectRequest,
    /// Key exchange done; device and user auth outstanding
    AwaitingAuth {
        /// DeviceAuthRequest answered
        device_done: bool,
        /// UserDeviceAuthRequest answered
        user_done: bool,
    },
    /// Both auth exchanges done; waiting for AuthDoneRequest
    AwaitingAuthDone,
    /// Normal operation: Control and Session traffic
    Established,
}

/// Authenticated, encrypted context with one remote peer.
pub struct Session {
    local_id: u32,
    remote_id: u32,
    device: RemoteDevice,
    identity: LocalIdentity,
    handler: Arc<dyn ShareHandler>,
    host: Weak<SessionHost>,
    writer: SharedWriter,

    phase: Mutex<SessionPhase>,
    crypto: Mutex<Option<Arc<Cryptor>>>,
    local_nonce: u64,
    remote_nonce: AtomicU64,

    next_seq: AtomicU32,
    last_inbound_seq: Mutex<Option<u32>>,

    channels: DashMap<u64, Arc<Channel>>,
    next_channel_id: AtomicU64,
    pending: Mutex<HashMap<u32, PendingMessage>>,

    disposed: AtomicBool,
    closed_tx: watch::Sender<bool>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("local_id", &self.local_id)
            .field("remote_id", &self.remote_id)
            .field("phase", &self.phase)
            .finish()
    }
}

impl Session {
    pub(crate) fn new(
        host: &Arc<SessionHost>,
        local_id: u32,
        remote_id: u32,
        device: RemoteDevice,
        writer: SharedWriter,
    ) -> Arc<Self> {
        let (closed_tx, _) = watch::channel(false);
        Arc::new(Self {
            local_id,
            remote_id,
            device,
            identity: host.identity().clone(),
            handler: host.handler().clone(),
            host: Arc::downgrade(host),
            writer,
            phase: Mutex::new(SessionPhase::AwaitingConnectRequest),
            crypto: Mutex::new(None),
            local_nonce: OsRng.next_u64(),
            remote_nonce: AtomicU64::new(0),
            next_seq: AtomicU32::new(0),
            last_inbound_seq: Mutex::new(None),
            channels: DashMap::new(),
            next_channel_id: AtomicU64::new(FIRST_CHANNEL_ID),
            pending: Mutex::new(HashMap::new()),
            disposed: AtomicBool::new(false),
            closed_tx,
        })
    }

    /// Local half of the session id.
    #[must_use]
    pub fn local_id(&self) -> u32 {
        self.local_id
    }

    /// Remote half of the session id (host bit masked).
    #[must_use]
    pub fn remote_id(&self) -> u32 {
        self.remote_id
    }

    /// The remote device this session is bound to.
    #[must_use]
    pub fn device(&self) -> &RemoteDevice {
        &self.device
    }

    pub(crate) fn handler(&self) -> &Arc<dyn ShareHandler> {
        &self.handler
    }

    /// True once [`Session::dispose`] ran.
    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    /// Watch channel that flips to `true` on disposal.
    #[must_use]
    pub fn closed_signal(&self) -> watch::Receiver<bool> {
        self.closed_tx.subscribe()
    }

    fn wire_id(&self) -> u64 {
        pack_session_id(self.local_id, self.remote_id)
    }

    fn phase(&self) -> SessionPhase {
        *self.phase.lock().expect("lock poisoned")
    }

    fn set_phase(&self, phase: SessionPhase) {
        *self.phase.lock().expect("lock poisoned") = phase;
    }

    fn crypto(&self) -> Option<Arc<Cryptor>> {
        self.crypto.lock().expect("lock poisoned").clone()
    }

    fn next_sequence(&self) -> u32 {
        self.next_seq.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Dispose the session: close channels, cancel outstanding acceptance
    /// promises, drop reassembly state, and deregister from the host.
    /// Idempotent and safe from any thread.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        for entry in self.channels.iter() {
            entry.value().abort_app();
        }
        self.channels.clear();
        self.pending.lock().expect("lock poisoned").clear();
        if let Some(host) = self.host.upgrade() {
            host.remove_session(self.local_id);
        }
        let _ = self.closed_tx.send(true);
        tracing::debug!(session = self.local_id, "session disposed");
    }

    // ---- inbound path -----------------------------------------------------

    /// Drive the state machine with one inbound frame. Any error is fatal to
    /// the session; the caller disposes it and closes the transport.
    pub async fn handle_message(
        self: &Arc<Self>,
        header: &CommonHeader,
        body: &[u8],
    ) -> Result<()> {
        if self.is_disposed() {
            return Err(ProtocolError::Disposed);
        }
        self.check_session_id(header)?;
        self.check_sequence(header)?;

        let plaintext = self.open_body(header, body)?;

        match header.message_type {
            MessageType::Connect => self.handle_connect(header, &plaintext).await,
            MessageType::Control => self.handle_control(header, &plaintext).await,
            MessageType::Session => self.handle_session(header, plaintext),
            MessageType::ReliabilityResponse => Ok(()),
            other => {
                tracing::warn!(session = self.local_id, ?other, "unexpected message type");
                Err(ProtocolError::violation("unexpected message type"))
            }
        }
    }

    fn check_session_id(&self, header: &CommonHeader) -> Result<()> {
        let local = session_local(header.session_id);
        if local != 0 && local != self.local_id {
            return Err(ProtocolError::UnknownSession(local));
        }
        let remote = session_remote(header.session_id);
        if remote != self.remote_id {
            return Err(ProtocolError::WrongRemote {
                expected: self.remote_id,
                actual: remote,
            });
        }
        Ok(())
    }

    /// Inbound sequence numbers after the handshake are strictly monotone
    /// with no gaps; fragments of one message share their number. Handshake
    /// frames are only required not to go backwards, since peers do not
    /// guarantee contiguous numbering before the session is established.
    fn check_sequence(&self, header: &CommonHeader) -> Result<()> {
        let established = self.phase() == SessionPhase::Established;
        let mut last = self.last_inbound_seq.lock().expect("lock poisoned");
        match *last {
            None => {
                *last = Some(header.sequence_number);
                Ok(())
            }
            Some(prev) if !established => {
                if header.sequence_number >= prev {
                    *last = Some(header.sequence_number);
                    Ok(())
                } else {
                    Err(ProtocolError::violation("sequence number went backwards"))
                }
            }
            Some(prev) if header.fragment_index > 0 => {
                if header.sequence_number == prev {
                    Ok(())
                } else {
                    Err(ProtocolError::violation("fragment sequence mismatch"))
                }
            }
            Some(prev) => {
                if header.sequence_number == prev.wrapping_add(1) {
                    *last = Some(header.sequence_number);
                    Ok(())
                } else {
                    Err(ProtocolError::violation("sequence number gap"))
                }
            }
        }
    }

    /// Verify and decrypt the body when the encrypted flag is set; pass
    /// plaintext bodies through (legal only before key exchange completes).
    fn open_body(&self, header: &CommonHeader, body: &[u8]) -> Result<Vec<u8>> {
        if !header.flags.is_encrypted() {
            if self.crypto().is_some() {
                return Err(ProtocolError::violation(
                    "unencrypted message after key exchange",
                ));
            }
            return Ok(body.to_vec());
        }

        let crypto = self
            .crypto()
            .ok_or(ProtocolError::violation("encrypted message before key exchange"))?;

        let ct_len = header.payload_size as usize;
        if body.len() < ct_len + HMAC_SIZE {
            return Err(ProtocolError::Parse(WireError::UnexpectedEof {
                needed: ct_len + HMAC_SIZE,
                available: body.len(),
            }));
        }
        let (ciphertext, trailer) = body.split_at(ct_len);

        let header_bytes = header.serialize();
        crypto.verify(&header_bytes, ciphertext, &trailer[..HMAC_SIZE])?;
        let plaintext = crypto.decrypt(header.session_id, header.sequence_number, ciphertext)?;
        Ok(plaintext)
    }

    // ---- connect handling -------------------------------------------------

    async fn handle_connect(self: &Arc<Self>, header: &CommonHeader, body: &[u8]) -> Result<()> {
        let mut reader = Reader::new(body);
        let kind = reader.read_u8()?;

        match kind {
            connection_type::CONNECT_REQUEST => self.on_connect_request(&mut reader).await,
            connection_type::DEVICE_AUTH_REQUEST => {
                self.on_auth_request(&mut reader, false).await
            }
            connection_type::USER_DEVICE_AUTH_REQUEST => {
                self.on_auth_request(&mut reader, true).await
            }
            connection_type::UPGRADE_REQUEST => self.on_upgrade_request(header).await,
            connection_type::AUTH_DONE_REQUEST => self.on_auth_done(header).await,
            connection_type::DEVICE_INFO_MESSAGE => self.on_device_info(&mut reader).await,
            other => {
                tracing::warn!(session = self.local_id, kind = other, "unexpected connect message");
                Err(ProtocolError::violation("unexpected connect message type"))
            }
        }
    }

    async fn on_connect_request(&self, reader: &mut Reader<'_>) -> Result<()> {
        if self.phase() != SessionPhase::AwaitingConnectRequest {
            return Err(ProtocolError::violation("duplicate connect request"));
        }

        let curve = reader.read_u8()?;
        if curve != CURVE_P256 {
            return Err(ProtocolError::not_implemented("unsupported curve"));
        }
        let hmac_size = reader.read_u16()?;
        let nonce = reader.read_u64()?;
        let fragment_size = reader.read_u32()?;
        let peer_x = reader.read_payload()?.to_vec();
        let peer_y = reader.read_payload()?.to_vec();

        let keys = KeyPair::generate(&mut OsRng);
        let secret = keys.exchange(&peer_x, &peer_y)?;
        *self.crypto.lock().expect("lock poisoned") = Some(Arc::new(Cryptor::new(&secret)));
        self.remote_nonce.store(nonce, Ordering::SeqCst);

        tracing::info!(
            session = self.local_id,
            device = %self.device.name,
            "key exchange complete"
        );

        let mut body = Writer::new();
        body.write_u8(connection_type::CONNECT_RESPONSE);
        body.write_u8(CONNECT_RESULT_PENDING);
        body.write_u16(hmac_size);
        body.write_u64(self.local_nonce);
        body.write_u32(fragment_size);
        body.write_payload(&keys.public_x());
        body.write_payload(&keys.public_y());

        self.set_phase(SessionPhase::AwaitingAuth {
            device_done: false,
            user_done: false,
        });
        self.send_plaintext(CommonHeader::new(MessageType::Connect), body.as_bytes())
            .await
    }

    async fn on_auth_request(&self, reader: &mut Reader<'_>, user_auth: bool) -> Result<()> {
        let (device_done, user_done) = match self.phase() {
            SessionPhase::AwaitingAuth {
                device_done,
                user_done,
            } => (device_done, user_done),
            _ => return Err(ProtocolError::violation("auth request out of order")),
        };

        let certificate = reader.read_payload()?.to_vec();
        let proof = reader.read_payload()?.to_vec();

        let remote_nonce = self.remote_nonce.load(Ordering::SeqCst);
        let verify_key = thumbprint::thumbprint_key(remote_nonce, self.local_nonce);
        thumbprint::verify_certificate(&verify_key, &certificate, &proof)?;

        let sign_key = thumbprint::thumbprint_key(self.local_nonce, remote_nonce);
        let local_proof = thumbprint::sign_certificate(&sign_key, &self.identity.certificate);

        let response_type = if user_auth {
            connection_type::USER_DEVICE_AUTH_RESPONSE
        } else {
            connection_type::DEVICE_AUTH_RESPONSE
        };
        let mut body = Writer::new();
        body.write_u8(response_type);
        body.write_payload(&self.identity.certificate);
        body.write_payload(&local_proof);

        let phase = match (device_done || !user_auth, user_done || user_auth) {
            (true, true) => SessionPhase::AwaitingAuthDone,
            (device, user) => SessionPhase::AwaitingAuth {
                device_done: device,
                user_done: user,
            },
        };
        self.set_phase(phase);

        self.send_encrypted(CommonHeader::new(MessageType::Connect), body.as_bytes())
            .await
    }

    /// Transport upgrades are refused unconditionally; the session stays in
    /// its current state.
    async fn on_upgrade_request(&self, _header: &CommonHeader) -> Result<()> {
        if self.crypto().is_none() {
            return Err(ProtocolError::violation("upgrade request before key exchange"));
        }
        tracing::info!(session = self.local_id, "refusing transport upgrade");

        let mut body = Writer::new();
        body.write_u8(connection_type::UPGRADE_FAILURE);
        body.write_u32(UPGRADE_FAILURE_HRESULT);
        self.send_encrypted(CommonHeader::new(MessageType::Connect), body.as_bytes())
            .await
    }

    async fn on_auth_done(&self, _header: &CommonHeader) -> Result<()> {
        if self.phase() != SessionPhase::AwaitingAuthDone {
            return Err(ProtocolError::violation("auth done before both auth exchanges"));
        }

        let mut body = Writer::new();
        body.write_u8(connection_type::AUTH_DONE_RESPONSE);
        body.write_u32(0);

        self.set_phase(SessionPhase::Established);
        tracing::info!(session = self.local_id, device = %self.device.name, "session established");

        self.send_encrypted(CommonHeader::new(MessageType::Connect), body.as_bytes())
            .await
    }

    async fn on_device_info(&self, reader: &mut Reader<'_>) -> Result<()> {
        if self.phase() == SessionPhase::AwaitingConnectRequest {
            return Err(ProtocolError::violation("device info before key exchange"));
        }
        let _info = reader.read_payload()?;

        let mut body = Writer::new();
        body.write_u8(connection_type::DEVICE_INFO_RESPONSE);
        self.send_encrypted(CommonHeader::new(MessageType::Connect), body.as_bytes())
            .await
    }

    // ---- control handling -------------------------------------------------

    async fn handle_control(self: &Arc<Self>, header: &CommonHeader, body: &[u8]) -> Result<()> {
        if self.phase() != SessionPhase::Established {
            return Err(ProtocolError::violation("control message before auth done"));
        }

        let mut reader = Reader::new(body);
        match reader.read_u8()? {
            control_type::START_CHANNEL_REQUEST => {
                self.on_start_channel(header, &mut reader).await
            }
            other => {
                tracing::warn!(session = self.local_id, kind = other, "unexpected control message");
                Err(ProtocolError::violation("unexpected control message type"))
            }
        }
    }

    async fn on_start_channel(
        self: &Arc<Self>,
        header: &CommonHeader,
        reader: &mut Reader<'_>,
    ) -> Result<()> {
        let app_id = reader.read_utf8()?;
        let app_name = reader.read_utf8()?;

        let app = uuid::Uuid::parse_str(&app_id)
            .ok()
            .and_then(|id| self.host.upgrade().and_then(|h| h.apps().create(&id, &app_name)));

        let (result, channel_id) = match app {
            Some(app) => {
                let id = self.next_channel_id.fetch_add(1, Ordering::SeqCst);
                let channel = Channel::new(id, self, app);
                self.channels.insert(id, channel);
                tracing::info!(session = self.local_id, channel = id, app = %app_name, "channel open");
                (0u8, id)
            }
            None => {
                tracing::warn!(session = self.local_id, app = %app_id, "unknown application id");
                (1u8, 0)
            }
        };

        let mut response = CommonHeader::new(MessageType::Control);
        response
            .additional_headers
            .push(AdditionalHeader::reply_to(header.request_id));
        response
            .additional_headers
            .push(AdditionalHeader::channel_compat());

        let mut body = Writer::new();
        body.write_u8(control_type::START_CHANNEL_RESPONSE);
        body.write_u8(result);
        body.write_u64(channel_id);
        self.send_encrypted(response, body.as_bytes()).await
    }

    // ---- session (application) traffic ------------------------------------

    /// Feed a Session-type fragment into reassembly; on completion, queue
    /// the assembled message on the channel's worker. The reader never
    /// awaits application logic.
    fn handle_session(self: &Arc<Self>, header: &CommonHeader, plaintext: Vec<u8>) -> Result<()> {
        if self.phase() != SessionPhase::Established {
            return Err(ProtocolError::violation("session message before auth done"));
        }

        let buffer = {
            let mut pending = self.pending.lock().expect("lock poisoned");
            let entry = pending
                .entry(header.sequence_number)
                .or_insert_with(|| PendingMessage::new(header));
            if entry.add_fragment(header, &plaintext)? && entry.is_complete() {
                Some(entry.take_buffer())
            } else {
                None
            }
        };
        let Some(buffer) = buffer else {
            return Ok(());
        };

        let channel = self
            .channels
            .get(&header.channel_id)
            .map(|entry| entry.value().clone())
            .ok_or(ProtocolError::violation("message for unknown channel"))?;

        channel.deliver(AppMessage {
            header: header.clone(),
            payload: buffer,
        })
    }

    /// Drop the reassembly entry for a sequence number once its handler has
    /// resolved. Duplicate final fragments arriving before this point are
    /// absorbed by the dispatched entry instead of reopening it.
    pub(crate) fn finish_reassembly(&self, sequence: u32) {
        self.pending
            .lock()
            .expect("lock poisoned")
            .remove(&sequence);
    }

    // ---- outbound path ----------------------------------------------------

    async fn send_frame(&self, bytes: &[u8]) -> Result<()> {
        if bytes.len() > usize::from(u16::MAX) {
            return Err(ProtocolError::violation("frame exceeds transport limit"));
        }
        let mut writer = self.writer.lock().await;
        writer.write_all(&(bytes.len() as u16).to_be_bytes()).await?;
        writer.write_all(bytes).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Send an unencrypted frame (ConnectResponse only).
    async fn send_plaintext(&self, mut header: CommonHeader, body: &[u8]) -> Result<()> {
        header.session_id = self.wire_id();
        header.sequence_number = self.next_sequence();

        let frame = header.write_frame(|w| {
            w.write_bytes(body);
            Ok(())
        })?;
        self.send_frame(&frame).await
    }

    /// Encrypt and send a frame: header, ciphertext, HMAC trailer.
    pub(crate) async fn send_encrypted(&self, mut header: CommonHeader, body: &[u8]) -> Result<()> {
        let crypto = self
            .crypto()
            .ok_or(ProtocolError::violation("no session key for encrypted send"))?;

        header.session_id = self.wire_id();
        header.sequence_number = self.next_sequence();
        header.flags = header.flags.with_encrypted();

        let ciphertext = crypto.encrypt(header.session_id, header.sequence_number, body);
        header.payload_size = ciphertext.len() as u32;

        let header_bytes = header.serialize();
        let tag = crypto.sign(&header_bytes, &ciphertext);

        let mut frame = header_bytes;
        frame.extend_from_slice(&ciphertext);
        frame.extend_from_slice(&tag);
        self.send_frame(&frame).await
    }
}
