//! Sans-IO TLS connection state machine.
//!
//! Follows the `feed_data()` → `poll_output()` → `poll_event()` pattern.
//! The connection owns the handshake engine until it completes, then
//! discards it; everything needed afterwards (rekeying, ticket receipt)
//! works from the installed epochs and the negotiated session info.

use crate::buf::{Buf, BufExt};
use crate::crypto::{Aead, Hkdf, Level};
use crate::error::Error;
use crate::tls::alert::{Alert, AlertDescription, AlertLevel};
use crate::tls::engine::{
    Config, Direction, Engine, EngineRandom, Output, RecordKeys, ResumptionData, Role,
    SessionInfo,
};
use crate::tls::key_schedule::{derive_next_traffic_secret, derive_ticket_psk, hkdf_expand_label};
use crate::tls::messages::{self, CipherSuite, HandshakeType, KeyUpdateRequest};
use crate::tls::record::{self, ContentType, MAX_PLAINTEXT, RECORD_HEADER_LEN};
use crate::tls::ProtocolVersion;

use super::io::ConnIo;

/// Write sequence number at which a TLS 1.3 connection updates its own
/// traffic keys.
const REKEY_THRESHOLD: u64 = 1 << 23;

/// Sequence ceiling. TLS 1.2 has no rekey mechanism, so a connection that
/// reaches this terminates rather than reuse a nonce; a TLS 1.3 peer that
/// never rekeys is cut off at the same point.
const SEQ_HARD_LIMIT: u64 = 1 << 34;

/// Handshake message reassembly capacity. Messages span record
/// boundaries; certificates are the largest thing we expect.
const HS_REASSEMBLY: usize = 4096;

/// Events produced by [`Connection`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsEvent {
    /// Handshake complete; application data can flow.
    HandshakeComplete,
    /// Application data is available (call `recv_app_data`).
    AppData,
    /// Peer sent close_notify.
    PeerClosed,
    /// A session ticket arrived (call `take_resumption`).
    TicketReceived,
    /// The server accepted our 0-RTT offer.
    EarlyDataAccepted,
    /// The server rejected our 0-RTT offer; early data was discarded and
    /// must be re-sent after the handshake if still wanted.
    EarlyDataRejected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnState {
    Handshake,
    Active,
    Closing,
    Closed,
}

/// Runtime AEAD dispatch over the closed suite set (one variant per
/// supported cipher family). Selected once at key installation and
/// immutable for the life of the epoch.
enum SuiteAead {
    #[cfg(feature = "rustcrypto-aes")]
    Aes128Gcm(crate::crypto::rustcrypto::Aes128GcmAead),
    #[cfg(feature = "rustcrypto-chacha")]
    ChaCha20Poly1305(crate::crypto::rustcrypto::ChaCha20Poly1305Aead),
}

impl SuiteAead {
    fn new(suite: CipherSuite, key: &[u8]) -> Result<Self, Error> {
        use crate::crypto::CryptoProvider;
        if key.len() != suite.key_len() {
            return Err(Error::Crypto);
        }
        match suite {
            CipherSuite::TlsAes128GcmSha256 | CipherSuite::EcdheAes128GcmSha256 => {
                #[cfg(feature = "rustcrypto-aes")]
                {
                    Ok(Self::Aes128Gcm(
                        crate::crypto::rustcrypto::Aes128GcmProvider.aead(key)?,
                    ))
                }
                #[cfg(not(feature = "rustcrypto-aes"))]
                {
                    Err(Error::Crypto)
                }
            }
            CipherSuite::TlsChacha20Poly1305Sha256
            | CipherSuite::EcdheChacha20Poly1305Sha256 => {
                #[cfg(feature = "rustcrypto-chacha")]
                {
                    Ok(Self::ChaCha20Poly1305(
                        crate::crypto::rustcrypto::ChaCha20Provider.aead(key)?,
                    ))
                }
                #[cfg(not(feature = "rustcrypto-chacha"))]
                {
                    Err(Error::Crypto)
                }
            }
        }
    }
}

impl Aead for SuiteAead {
    // Upper bound across variants; record code never keys off this.
    const KEY_LEN: usize = 32;
    const NONCE_LEN: usize = 12;
    const TAG_LEN: usize = 16;

    fn seal_in_place(
        &self,
        nonce: &[u8],
        aad: &[u8],
        buf: &mut [u8],
        payload_len: usize,
    ) -> Result<usize, Error> {
        match self {
            #[cfg(feature = "rustcrypto-aes")]
            Self::Aes128Gcm(a) => a.seal_in_place(nonce, aad, buf, payload_len),
            #[cfg(feature = "rustcrypto-chacha")]
            Self::ChaCha20Poly1305(a) => a.seal_in_place(nonce, aad, buf, payload_len),
        }
    }

    fn open_in_place(
        &self,
        nonce: &[u8],
        aad: &[u8],
        buf: &mut [u8],
        ciphertext_len: usize,
    ) -> Result<usize, Error> {
        match self {
            #[cfg(feature = "rustcrypto-aes")]
            Self::Aes128Gcm(a) => a.open_in_place(nonce, aad, buf, ciphertext_len),
            #[cfg(feature = "rustcrypto-chacha")]
            Self::ChaCha20Poly1305(a) => a.open_in_place(nonce, aad, buf, ciphertext_len),
        }
    }
}

/// Record protection for one direction. Replaced wholesale on every key
/// change, never mutated across one.
struct Epoch {
    keys: RecordKeys,
    aead: SuiteAead,
    seq: u64,
}

impl Epoch {
    fn install(keys: RecordKeys) -> Result<Self, Error> {
        let aead = SuiteAead::new(keys.suite, &keys.key[..keys.key_len])?;
        Ok(Self { keys, aead, seq: 0 })
    }
}

/// TLS connection over an ordered byte-stream transport.
///
/// `H`: HKDF implementation (shared with the engine).
///
/// I/O buffers are **not** owned by this struct; callers provide them via
/// [`ConnIo`] on every method that touches network or application data.
pub struct Connection<'a, H: Hkdf + Default> {
    engine: Option<Engine<'a, H>>,
    hkdf: H,
    state: ConnState,
    role: Role,
    version: Option<ProtocolVersion>,
    now: u64,

    read_epoch: Option<Epoch>,
    write_epoch: Option<Epoch>,

    hs_recv: heapless::Vec<u8, HS_REASSEMBLY>,
    events: heapless::Deque<TlsEvent, 8>,
    send_offset: usize,

    session: Option<SessionInfo>,
    resumption: Option<ResumptionData>,

    fatal: Option<Error>,
    peer_closed: bool,
    ccs_sent: bool,

    // Server: bytes of undecryptable 0-RTT left to skip after rejection.
    early_skip_budget: usize,
    // Server: accepted 0-RTT bytes still allowed in.
    early_recv_budget: usize,
    // Client: 0-RTT bytes still allowed out.
    early_send_budget: usize,
}

impl<'a, H: Hkdf + Default> Connection<'a, H> {
    /// Create a connection and start the handshake. For clients this
    /// queues the ClientHello; pull it with [`Self::poll_output`].
    pub fn new(config: Config<'a>, random: EngineRandom) -> Result<Self, Error> {
        let role = config.role;
        let now = config.now;
        let early_recv = config.max_early_data as usize;
        let early_send = if config.early_data {
            config.resume.map(|r| r.max_early_data as usize).unwrap_or(0)
        } else {
            0
        };
        let mut engine = Engine::new(config, random, H::default())?;
        engine.start()?;
        Ok(Self {
            engine: Some(engine),
            hkdf: H::default(),
            state: ConnState::Handshake,
            role,
            version: None,
            now,
            read_epoch: None,
            write_epoch: None,
            hs_recv: heapless::Vec::new(),
            events: heapless::Deque::new(),
            send_offset: 0,
            session: None,
            resumption: None,
            fatal: None,
            peer_closed: false,
            ccs_sent: false,
            early_skip_budget: 0,
            early_recv_budget: early_recv,
            early_send_budget: early_send,
        })
    }

    /// Feed raw transport bytes into the connection.
    ///
    /// A fatal error here poisons the connection: an alert goes out (best
    /// effort) and every subsequent call returns the same error.
    pub fn feed_data<const BUF: usize>(
        &mut self,
        io: &mut ConnIo<'_, BUF>,
        data: &[u8],
    ) -> Result<(), Error> {
        if let Some(e) = self.fatal {
            return Err(e);
        }
        if io.recv_buf.len() + data.len() > BUF {
            return Err(Error::BufferTooSmall {
                needed: io.recv_buf.len() + data.len(),
            });
        }
        let _ = io.recv_buf.extend_from_slice(data);
        match self.process_recv(io) {
            Ok(()) => Ok(()),
            Err(e) => {
                if e.is_fatal() {
                    self.poison(io, e);
                }
                Err(e)
            }
        }
    }

    /// Pull the next chunk of outgoing transport bytes.
    pub fn poll_output<'b, const BUF: usize>(
        &mut self,
        io: &mut ConnIo<'_, BUF>,
        buf: &'b mut [u8],
    ) -> Option<&'b [u8]> {
        let _ = self.pump_engine(io);
        let _ = self.flush_app_send(io);

        if self.send_offset >= io.send_buf.len() {
            return None;
        }

        let avail = io.send_buf.len() - self.send_offset;
        let n = avail.min(buf.len());
        buf[..n].copy_from_slice(&io.send_buf[self.send_offset..self.send_offset + n]);
        self.send_offset += n;

        if self.send_offset >= io.send_buf.len() {
            io.send_buf.clear();
            self.send_offset = 0;
        }

        Some(&buf[..n])
    }

    /// Poll for the next connection event.
    pub fn poll_event(&mut self) -> Option<TlsEvent> {
        self.events.pop_front()
    }

    /// Read decrypted application data.
    pub fn recv_app_data<const BUF: usize>(
        &mut self,
        io: &mut ConnIo<'_, BUF>,
        buf: &mut [u8],
    ) -> Result<usize, Error> {
        if io.app_recv_buf.is_empty() {
            if let Some(e) = self.fatal {
                return Err(e);
            }
            if self.peer_closed {
                return Err(Error::Closed);
            }
            return Err(Error::WouldBlock);
        }
        let n = io.app_recv_buf.len().min(buf.len());
        buf[..n].copy_from_slice(&io.app_recv_buf[..n]);
        io.app_recv_buf.copy_within(n.., 0);
        io.app_recv_buf.truncate(io.app_recv_buf.len() - n);
        Ok(n)
    }

    /// Queue application data for protection and sending.
    pub fn send_app_data<const BUF: usize>(
        &mut self,
        io: &mut ConnIo<'_, BUF>,
        data: &[u8],
    ) -> Result<usize, Error> {
        if let Some(e) = self.fatal {
            return Err(e);
        }
        if self.state != ConnState::Active {
            return Err(Error::InvalidState);
        }
        if io.app_send_buf.len() + data.len() > BUF {
            return Err(Error::BufferTooSmall {
                needed: io.app_send_buf.len() + data.len(),
            });
        }
        let _ = io.app_send_buf.extend_from_slice(data);
        Ok(data.len())
    }

    /// Send 0-RTT application data while the handshake is still in
    /// flight. Only valid on a client that offered early data, before the
    /// server's answer arrives; bytes beyond the ticket's budget are
    /// refused.
    pub fn send_early_data<const BUF: usize>(
        &mut self,
        io: &mut ConnIo<'_, BUF>,
        data: &[u8],
    ) -> Result<usize, Error> {
        if self.role != Role::Client || self.state != ConnState::Handshake {
            return Err(Error::InvalidState);
        }
        match &self.write_epoch {
            Some(epoch) if epoch.keys.level == Level::EarlyData => {}
            _ => return Err(Error::InvalidState),
        }
        if data.len() > self.early_send_budget {
            return Err(Error::WouldBlock);
        }
        // Compat-mode CCS goes out before any 0-RTT record.
        if !self.ccs_sent {
            self.queue_ccs(io)?;
        }
        self.early_send_budget -= data.len();
        self.seal_into(io, data, ContentType::ApplicationData)
            .map(|_| data.len())
    }

    /// Negotiated session parameters, available once the handshake is
    /// complete.
    pub fn session(&self) -> Option<&SessionInfo> {
        self.session.as_ref()
    }

    /// The negotiated ALPN protocol, if any.
    pub fn alpn(&self) -> Option<&[u8]> {
        self.session
            .as_ref()
            .filter(|s| !s.alpn.is_empty())
            .map(|s| s.alpn.as_slice())
    }

    /// Take the resumption data from the most recent session ticket.
    pub fn take_resumption(&mut self) -> Option<ResumptionData> {
        self.resumption.take()
    }

    pub fn is_active(&self) -> bool {
        self.state == ConnState::Active
    }

    pub fn is_closed(&self) -> bool {
        matches!(self.state, ConnState::Closed | ConnState::Closing)
    }

    /// Update our write keys and tell the peer (TLS 1.3 only). With
    /// `request_peer` the peer is asked to update its own write keys too.
    pub fn request_key_update<const BUF: usize>(
        &mut self,
        io: &mut ConnIo<'_, BUF>,
        request_peer: bool,
    ) -> Result<(), Error> {
        if self.state != ConnState::Active || self.version != Some(ProtocolVersion::Tls13) {
            return Err(Error::InvalidState);
        }
        let request = if request_peer {
            KeyUpdateRequest::UpdateRequested
        } else {
            KeyUpdateRequest::UpdateNotRequested
        };
        let mut msg = [0u8; 8];
        let n = messages::encode_key_update(request, &mut msg)?;
        self.seal_into(io, &msg[..n], ContentType::Handshake)?;
        self.rekey_write()
    }

    /// Initiate a graceful close (send close_notify).
    pub fn close<const BUF: usize>(&mut self, io: &mut ConnIo<'_, BUF>) -> Result<(), Error> {
        if self.is_closed() {
            return Ok(());
        }
        let _ = self.send_alert(io, Alert::close_notify());
        self.state = ConnState::Closing;
        Ok(())
    }

    /// Tell the connection the transport hit EOF. Clean only if the peer
    /// sent close_notify first; anything else is a truncation attack
    /// surface and is reported as such.
    pub fn transport_eof(&mut self) -> Result<(), Error> {
        if self.peer_closed || self.is_closed() {
            self.state = ConnState::Closed;
            return Ok(());
        }
        self.state = ConnState::Closed;
        self.fatal = Some(Error::Truncated);
        Err(Error::Truncated)
    }

    // ------------------------------------------------------------------
    // Receive path
    // ------------------------------------------------------------------

    fn process_recv<const BUF: usize>(&mut self, io: &mut ConnIo<'_, BUF>) -> Result<(), Error> {
        loop {
            if io.recv_buf.len() < RECORD_HEADER_LEN {
                return Ok(());
            }
            let hdr = record::decode_record_header(&io.recv_buf[..RECORD_HEADER_LEN])?;
            let total = RECORD_HEADER_LEN + hdr.length as usize;
            if io.recv_buf.len() < total {
                return Ok(());
            }

            if self.state == ConnState::Closed || self.state == ConnState::Closing {
                io.drain_recv(total);
                continue;
            }

            let header_bytes: [u8; 5] = [
                io.recv_buf[0],
                io.recv_buf[1],
                io.recv_buf[2],
                io.recv_buf[3],
                io.recv_buf[4],
            ];
            let ps = RECORD_HEADER_LEN;
            let payload_len = hdr.length as usize;

            // change_cipher_spec never carries protection in either
            // version: TLS 1.2 sends it before keys switch on, TLS 1.3
            // keeps it plaintext for middlebox compatibility.
            if hdr.content_type == ContentType::ChangeCipherSpec {
                if let Some(engine) = self.engine.as_mut() {
                    engine.ccs_received()?;
                }
                io.drain_recv(total);
                self.pump_engine(io)?;
                continue;
            }

            let opened = match &mut self.read_epoch {
                None => {
                    if payload_len == 0 {
                        return Err(Error::Framing);
                    }
                    Some((ps, payload_len, hdr.content_type))
                }
                Some(epoch) => {
                    if epoch.seq >= SEQ_HARD_LIMIT {
                        return Err(Error::Protocol(AlertDescription::InternalError));
                    }
                    match epoch.keys.version {
                        ProtocolVersion::Tls13 => {
                            if hdr.content_type != ContentType::ApplicationData {
                                return Err(Error::Framing);
                            }
                            let nonce = record::build_nonce(&epoch.keys.iv, epoch.seq);
                            match record::open_record(
                                &epoch.aead,
                                &nonce,
                                &mut io.recv_buf[ps..ps + payload_len],
                                payload_len,
                                &header_bytes,
                            ) {
                                Ok((data_len, inner_ct)) => {
                                    epoch.seq += 1;
                                    Some((ps, data_len, inner_ct))
                                }
                                Err(Error::Auth) if self.early_skip_budget > 0 => {
                                    // Rejected 0-RTT: records sealed under
                                    // keys we never installed. Skip them,
                                    // within the advertised budget.
                                    self.early_skip_budget =
                                        self.early_skip_budget.saturating_sub(payload_len);
                                    None
                                }
                                Err(e) => return Err(e),
                            }
                        }
                        ProtocolVersion::Tls12 => {
                            let seq = epoch.seq;
                            let len = if epoch.keys.suite.explicit_nonce() {
                                let mut iv4 = [0u8; 4];
                                iv4.copy_from_slice(&epoch.keys.iv[..4]);
                                record::open_record_tls12(
                                    &epoch.aead,
                                    &iv4,
                                    seq,
                                    &mut io.recv_buf[ps..ps + payload_len],
                                    payload_len,
                                    hdr.content_type,
                                )?
                            } else {
                                record::open_record_tls12_implicit(
                                    &epoch.aead,
                                    &epoch.keys.iv,
                                    seq,
                                    &mut io.recv_buf[ps..ps + payload_len],
                                    payload_len,
                                    hdr.content_type,
                                )?
                            };
                            epoch.seq += 1;
                            if len == 0 {
                                return Err(Error::Framing);
                            }
                            let offset = if epoch.keys.suite.explicit_nonce() {
                                ps + record::TLS12_EXPLICIT_NONCE_LEN
                            } else {
                                ps
                            };
                            Some((offset, len, hdr.content_type))
                        }
                    }
                }
            };

            if let Some((start, len, inner_ct)) = opened {
                self.handle_plaintext(io, start, len, inner_ct)?;
            }
            io.drain_recv(total);
        }
    }

    fn handle_plaintext<const BUF: usize>(
        &mut self,
        io: &mut ConnIo<'_, BUF>,
        start: usize,
        len: usize,
        inner_ct: ContentType,
    ) -> Result<(), Error> {
        match inner_ct {
            ContentType::Handshake => {
                if len == 0 {
                    return Err(Error::Framing);
                }
                if self.hs_recv.len() + len > HS_REASSEMBLY {
                    return Err(Error::Protocol(AlertDescription::InternalError));
                }
                let _ = self
                    .hs_recv
                    .extend_from_slice(&io.recv_buf[start..start + len]);
                self.process_handshake_messages(io)
            }
            ContentType::Alert => self.handle_alert(&io.recv_buf[start..start + len]),
            ContentType::ApplicationData => {
                if self.state == ConnState::Active {
                    self.deliver_app_data(io, start, len)
                } else if self.role == Role::Server
                    && self
                        .read_epoch
                        .as_ref()
                        .is_some_and(|e| e.keys.level == Level::EarlyData)
                {
                    // Accepted 0-RTT, bounded by the ticket budget.
                    if len > self.early_recv_budget {
                        return Err(Error::Protocol(AlertDescription::UnexpectedMessage));
                    }
                    self.early_recv_budget -= len;
                    self.deliver_app_data(io, start, len)
                } else {
                    Err(Error::Protocol(AlertDescription::UnexpectedMessage))
                }
            }
            ContentType::ChangeCipherSpec => Err(Error::Framing),
        }
    }

    fn deliver_app_data<const BUF: usize>(
        &mut self,
        io: &mut ConnIo<'_, BUF>,
        start: usize,
        len: usize,
    ) -> Result<(), Error> {
        if len == 0 {
            // Padding-only record.
            return Ok(());
        }
        if io.app_recv_buf.len() + len > BUF {
            return Err(Error::BufferTooSmall {
                needed: io.app_recv_buf.len() + len,
            });
        }
        let _ = io
            .app_recv_buf
            .extend_from_slice(&io.recv_buf[start..start + len]);
        let _ = self.events.push_back(TlsEvent::AppData);
        Ok(())
    }

    fn process_handshake_messages<const BUF: usize>(
        &mut self,
        io: &mut ConnIo<'_, BUF>,
    ) -> Result<(), Error> {
        loop {
            if self.hs_recv.len() < 4 {
                return Ok(());
            }
            let (msg_type, body_len) = messages::read_handshake_header(&self.hs_recv)?;
            let msg_len = 4 + body_len;
            if msg_len > HS_REASSEMBLY {
                return Err(Error::Protocol(AlertDescription::InternalError));
            }
            if self.hs_recv.len() < msg_len {
                return Ok(());
            }

            if let Some(engine) = self.engine.as_mut() {
                engine.handshake_message(&self.hs_recv[..msg_len])?;
                self.hs_recv.buf_drain_front(msg_len);
                self.pump_engine(io)?;
            } else {
                match HandshakeType::from_u8(msg_type) {
                    Some(HandshakeType::NewSessionTicket) => {
                        let body_len = msg_len - 4;
                        let mut body = [0u8; 512];
                        // Oversized tickets cannot be stored anyway;
                        // drop them rather than fail the connection.
                        if body_len <= body.len() {
                            body[..body_len].copy_from_slice(&self.hs_recv[4..msg_len]);
                            self.hs_recv.buf_drain_front(msg_len);
                            self.on_new_session_ticket(&body[..body_len])?;
                        } else {
                            self.hs_recv.buf_drain_front(msg_len);
                        }
                    }
                    Some(HandshakeType::KeyUpdate) => {
                        let request = messages::parse_key_update(&self.hs_recv[4..msg_len])?;
                        self.hs_recv.buf_drain_front(msg_len);
                        self.on_key_update(io, request)?;
                    }
                    _ => {
                        return Err(Error::Protocol(AlertDescription::UnexpectedMessage));
                    }
                }
            }
        }
    }

    fn on_new_session_ticket(&mut self, body: &[u8]) -> Result<(), Error> {
        if self.version != Some(ProtocolVersion::Tls13) {
            return Err(Error::Protocol(AlertDescription::UnexpectedMessage));
        }
        let session = match self.session.as_ref() {
            Some(s) => s,
            None => return Err(Error::InvalidState),
        };
        let nst = messages::parse_new_session_ticket(body)?;

        let mut psk = [0u8; 32];
        derive_ticket_psk(&self.hkdf, &session.resumption_master, nst.nonce, &mut psk)?;

        let identity = match heapless::Vec::from_slice(nst.ticket) {
            Ok(v) => v,
            // Ticket too large to store; not an error, just not resumable.
            Err(_) => return Ok(()),
        };
        self.resumption = Some(ResumptionData {
            psk,
            identity,
            suite: session.suite,
            age_add: nst.age_add,
            issued_at: self.now,
            lifetime_secs: nst.lifetime,
            max_early_data: nst.max_early_data.unwrap_or(0),
            server_name: session.server_name.clone(),
            alpn: session.alpn.clone(),
        });
        let _ = self.events.push_back(TlsEvent::TicketReceived);
        Ok(())
    }

    fn on_key_update<const BUF: usize>(
        &mut self,
        io: &mut ConnIo<'_, BUF>,
        request: KeyUpdateRequest,
    ) -> Result<(), Error> {
        if self.version != Some(ProtocolVersion::Tls13) || self.state != ConnState::Active {
            return Err(Error::Protocol(AlertDescription::UnexpectedMessage));
        }
        self.rekey_read()?;
        if request == KeyUpdateRequest::UpdateRequested {
            let mut msg = [0u8; 8];
            let n = messages::encode_key_update(KeyUpdateRequest::UpdateNotRequested, &mut msg)?;
            self.seal_into(io, &msg[..n], ContentType::Handshake)?;
            self.rekey_write()?;
        }
        Ok(())
    }

    fn handle_alert(&mut self, payload: &[u8]) -> Result<(), Error> {
        let alert = Alert::decode(payload)?;
        if alert.description == AlertDescription::CloseNotify {
            self.peer_closed = true;
            self.state = ConnState::Closing;
            let _ = self.events.push_back(TlsEvent::PeerClosed);
            return Ok(());
        }
        if !alert.is_fatal() {
            return Ok(());
        }
        let err = Error::Protocol(alert.description);
        self.state = ConnState::Closed;
        self.fatal = Some(err);
        Err(err)
    }

    // ------------------------------------------------------------------
    // Engine output
    // ------------------------------------------------------------------

    fn pump_engine<const BUF: usize>(&mut self, io: &mut ConnIo<'_, BUF>) -> Result<(), Error> {
        loop {
            let output = match self.engine.as_mut() {
                Some(engine) => match engine.poll_output() {
                    Some(o) => o,
                    None => break,
                },
                None => return Ok(()),
            };
            match output {
                Output::Send { level, data } => self.send_handshake(io, level, &data)?,
                Output::SendChangeCipherSpec => self.queue_ccs(io)?,
                Output::InstallKeys { direction, keys } => self.install(direction, keys)?,
                Output::Connected(info) => {
                    self.version = Some(info.version);
                    self.session = Some(info);
                    self.state = ConnState::Active;
                    self.ccs_sent = true;
                    let _ = self.events.push_back(TlsEvent::HandshakeComplete);
                }
                Output::EarlyDataAccepted => {
                    let _ = self.events.push_back(TlsEvent::EarlyDataAccepted);
                }
                Output::EarlyDataRejected => {
                    if self.role == Role::Server {
                        self.early_skip_budget = self.early_recv_budget.max(MAX_PLAINTEXT);
                    }
                    let _ = self.events.push_back(TlsEvent::EarlyDataRejected);
                }
            }
        }
        if self.engine.as_ref().is_some_and(|e| e.is_connected()) {
            self.engine = None;
        }
        Ok(())
    }

    fn install(&mut self, direction: Direction, keys: RecordKeys) -> Result<(), Error> {
        self.version = Some(keys.version);
        let epoch = Epoch::install(keys)?;
        match direction {
            Direction::Read => self.read_epoch = Some(epoch),
            Direction::Write => self.write_epoch = Some(epoch),
        }
        Ok(())
    }

    fn send_handshake<const BUF: usize>(
        &mut self,
        io: &mut ConnIo<'_, BUF>,
        level: Level,
        data: &[u8],
    ) -> Result<(), Error> {
        if level == Level::Initial {
            return self.queue_plaintext(io, ContentType::Handshake, data);
        }
        // Middlebox compatibility: one plaintext CCS precedes the first
        // protected flight of a TLS 1.3 handshake.
        if self.version == Some(ProtocolVersion::Tls13) && !self.ccs_sent {
            self.queue_ccs(io)?;
        }
        match &self.write_epoch {
            Some(epoch) if epoch.keys.level == level => {}
            _ => return Err(Error::InvalidState),
        }
        self.seal_into(io, data, ContentType::Handshake)
    }

    fn queue_plaintext<const BUF: usize>(
        &mut self,
        io: &mut ConnIo<'_, BUF>,
        ct: ContentType,
        data: &[u8],
    ) -> Result<(), Error> {
        let mut header = [0u8; RECORD_HEADER_LEN];
        record::encode_record_header(ct, data.len() as u16, &mut header)?;
        io.queue_send(&header)?;
        io.queue_send(data)
    }

    fn queue_ccs<const BUF: usize>(&mut self, io: &mut ConnIo<'_, BUF>) -> Result<(), Error> {
        let ccs = [
            ContentType::ChangeCipherSpec as u8,
            0x03,
            0x03,
            0x00,
            0x01,
            0x01,
        ];
        io.queue_send(&ccs)?;
        self.ccs_sent = true;
        Ok(())
    }

    /// Protect `data` with the current write epoch and queue the record.
    fn seal_into<const BUF: usize>(
        &mut self,
        io: &mut ConnIo<'_, BUF>,
        data: &[u8],
        inner_ct: ContentType,
    ) -> Result<(), Error> {
        let epoch = self.write_epoch.as_mut().ok_or(Error::InvalidState)?;
        seal_record_into::<BUF>(epoch, data, inner_ct, io.send_buf)
    }

    fn flush_app_send<const BUF: usize>(&mut self, io: &mut ConnIo<'_, BUF>) -> Result<(), Error> {
        if self.state != ConnState::Active || io.app_send_buf.is_empty() {
            return Ok(());
        }
        while !io.app_send_buf.is_empty() {
            self.maybe_rekey(io)?;
            let chunk = io.app_send_buf.len().min(MAX_PLAINTEXT);
            let epoch = self.write_epoch.as_mut().ok_or(Error::InvalidState)?;
            seal_record_into::<BUF>(
                epoch,
                &io.app_send_buf[..chunk],
                ContentType::ApplicationData,
                io.send_buf,
            )?;
            io.app_send_buf.copy_within(chunk.., 0);
            io.app_send_buf.truncate(io.app_send_buf.len() - chunk);
        }
        Ok(())
    }

    fn maybe_rekey<const BUF: usize>(&mut self, io: &mut ConnIo<'_, BUF>) -> Result<(), Error> {
        let seq = match &self.write_epoch {
            Some(e) => e.seq,
            None => return Ok(()),
        };
        if seq < REKEY_THRESHOLD {
            return Ok(());
        }
        match self.version {
            Some(ProtocolVersion::Tls13) => self.request_key_update(io, false),
            // No rekey mechanism: refuse further writes.
            _ => Err(Error::Protocol(AlertDescription::InternalError)),
        }
    }

    fn rekey_write(&mut self) -> Result<(), Error> {
        let old = self.write_epoch.take().ok_or(Error::InvalidState)?;
        self.write_epoch = Some(next_epoch(&self.hkdf, &old)?);
        Ok(())
    }

    fn rekey_read(&mut self) -> Result<(), Error> {
        let old = self.read_epoch.take().ok_or(Error::InvalidState)?;
        self.read_epoch = Some(next_epoch(&self.hkdf, &old)?);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Alerts and teardown
    // ------------------------------------------------------------------

    fn send_alert<const BUF: usize>(
        &mut self,
        io: &mut ConnIo<'_, BUF>,
        alert: Alert,
    ) -> Result<(), Error> {
        let payload = alert.encode();
        if self.write_epoch.is_some() {
            self.seal_into(io, &payload, ContentType::Alert)
        } else {
            self.queue_plaintext(io, ContentType::Alert, &payload)
        }
    }

    fn poison<const BUF: usize>(&mut self, io: &mut ConnIo<'_, BUF>, err: Error) {
        if self.fatal.is_none() {
            if let Some(desc) = err.alert() {
                let _ = self.send_alert(
                    io,
                    Alert {
                        level: AlertLevel::Fatal,
                        description: desc,
                    },
                );
            }
            self.fatal = Some(err);
        }
        self.state = ConnState::Closed;
    }
}

/// Protect one record under `epoch` and append it to `send_buf`,
/// encrypting in place to avoid a record-sized stack temporary.
fn seal_record_into<const BUF: usize>(
    epoch: &mut Epoch,
    data: &[u8],
    inner_ct: ContentType,
    send_buf: &mut Buf<BUF>,
) -> Result<(), Error> {
    if epoch.seq >= SEQ_HARD_LIMIT {
        return Err(Error::Protocol(AlertDescription::InternalError));
    }

    match epoch.keys.version {
        ProtocolVersion::Tls13 => {
            let payload = data.len() + 1 + SuiteAead::TAG_LEN;
            if send_buf.len() + RECORD_HEADER_LEN + payload > BUF {
                return Err(Error::BufferTooSmall {
                    needed: send_buf.len() + RECORD_HEADER_LEN + payload,
                });
            }
            let mut header = [0u8; RECORD_HEADER_LEN];
            record::encode_record_header(
                ContentType::ApplicationData,
                payload as u16,
                &mut header,
            )?;
            let _ = send_buf.extend_from_slice(&header);
            let enc_start = send_buf.len();
            let _ = send_buf.extend_from_slice(data);
            for _ in 0..1 + SuiteAead::TAG_LEN {
                let _ = send_buf.push(0);
            }
            let nonce = record::build_nonce(&epoch.keys.iv, epoch.seq);
            record::seal_record(
                &epoch.aead,
                &nonce,
                &mut send_buf[enc_start..],
                data.len(),
                inner_ct,
            )?;
        }
        ProtocolVersion::Tls12 => {
            let explicit = epoch.keys.suite.explicit_nonce();
            let prefix = if explicit {
                record::TLS12_EXPLICIT_NONCE_LEN
            } else {
                0
            };
            let payload = prefix + data.len() + SuiteAead::TAG_LEN;
            if send_buf.len() + RECORD_HEADER_LEN + payload > BUF {
                return Err(Error::BufferTooSmall {
                    needed: send_buf.len() + RECORD_HEADER_LEN + payload,
                });
            }
            let mut header = [0u8; RECORD_HEADER_LEN];
            record::encode_record_header(inner_ct, payload as u16, &mut header)?;
            let _ = send_buf.extend_from_slice(&header);
            let enc_start = send_buf.len();
            for _ in 0..prefix {
                let _ = send_buf.push(0);
            }
            let _ = send_buf.extend_from_slice(data);
            for _ in 0..SuiteAead::TAG_LEN {
                let _ = send_buf.push(0);
            }
            if explicit {
                let mut iv4 = [0u8; 4];
                iv4.copy_from_slice(&epoch.keys.iv[..4]);
                record::seal_record_tls12(
                    &epoch.aead,
                    &iv4,
                    epoch.seq,
                    &mut send_buf[enc_start..],
                    data.len(),
                    inner_ct,
                )?;
            } else {
                record::seal_record_tls12_implicit(
                    &epoch.aead,
                    &epoch.keys.iv,
                    epoch.seq,
                    &mut send_buf[enc_start..],
                    data.len(),
                    inner_ct,
                )?;
            }
        }
    }
    epoch.seq += 1;
    Ok(())
}

/// Derive the successor of an epoch for KeyUpdate ("traffic upd" chain).
fn next_epoch<H: Hkdf>(hkdf: &H, old: &Epoch) -> Result<Epoch, Error> {
    let mut secret = [0u8; 32];
    derive_next_traffic_secret(hkdf, &old.keys.secret, &mut secret)?;
    let suite = old.keys.suite;
    let mut key = [0u8; 32];
    let key_len = suite.key_len();
    let mut iv = [0u8; 12];
    hkdf_expand_label(hkdf, &secret, b"key", &[], &mut key[..key_len])?;
    hkdf_expand_label(hkdf, &secret, b"iv", &[], &mut iv)?;
    Epoch::install(RecordKeys {
        version: old.keys.version,
        suite,
        level: old.keys.level,
        secret,
        key,
        key_len,
        iv,
    })
}
