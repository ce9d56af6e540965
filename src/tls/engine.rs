//! Handshake engine for TLS 1.2 and TLS 1.3, both roles.
//!
//! The engine is sans-IO: it consumes complete handshake messages (already
//! reassembled and decrypted by the connection layer) and emits an ordered
//! queue of outputs — messages to send, key installation instructions, and
//! events. Record protection itself lives in the connection layer; the
//! engine only derives and hands over key material.
//!
//! Randomness is injected by the caller as explicit seeds. The engine is
//! discarded once the handshake completes; post-handshake messages
//! (NewSessionTicket receipt, KeyUpdate) are the connection's business.

use subtle::ConstantTimeEq;
use zeroize::Zeroize;

use crate::crypto::kex::{KeyPair, NamedGroup, MAX_PUBKEY_LEN};
use crate::crypto::sign::{
    sign_certificate_verify, sign_server_key_exchange, verify_certificate_verify,
    verify_server_key_exchange, SignContext, ED25519_ALGORITHM,
};
use crate::crypto::{Hkdf, Level};
use crate::error::Error;
use crate::tls::alert::AlertDescription;
use crate::tls::extensions::{
    self, append_pre_shared_key_ext, encode_client_hello_extensions,
    encode_encrypted_extensions_data, encode_hello_retry_extensions,
    encode_server_hello_extensions, parse_client_hello_extensions,
    parse_encrypted_extensions_data, parse_server_hello_extensions, ClientHelloParams,
};
#[cfg(feature = "rustcrypto-aes")]
use crate::tls::key_schedule::derive_ticket_psk;
use crate::tls::key_schedule::{
    compute_finished_verify_data, hkdf_expand_label, tls12_key_block, tls12_master_secret,
    tls12_verify_data, KeySchedule, Tls12Keys, TLS12_MASTER_SECRET_LEN, TLS12_VERIFY_DATA_LEN,
};
use crate::tls::messages::{
    self, CipherSuite, HandshakeType, HELLO_RETRY_REQUEST_RANDOM,
};
use crate::tls::transcript::TranscriptHash;
use crate::tls::verify::{cert_digest, CertificateVerifier};
use crate::tls::ProtocolVersion;

#[cfg(feature = "rustcrypto-aes")]
use crate::tls::ticket::{SessionState, TicketKeySet};

/// Maximum size of a single handshake message the engine emits.
pub const MAX_HANDSHAKE_MSG: usize = 1024;

/// Default lifetime for issued session tickets, in seconds.
pub const DEFAULT_TICKET_LIFETIME: u32 = 7200;

// pre_shared_key trailer: binders list length (2) + binder length (1) +
// binder (32). The binder transcript stops right before these bytes.
const PSK_BINDER_TRAILER: usize = 35;

/// Buffer holding one outgoing handshake message.
pub type HandshakeBuf = heapless::Vec<u8, MAX_HANDSHAKE_MSG>;

/// Which end of the connection this engine drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

/// Which direction a key installation applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Read,
    Write,
}

/// Record protection material for one direction.
///
/// For TLS 1.3 `secret` is the traffic secret (kept for KeyUpdate) and
/// `iv` is the full 12-byte per-record IV base. For TLS 1.2 `secret` is
/// zero and only `iv[..4]` (the implicit nonce part) is meaningful.
#[derive(Clone)]
pub struct RecordKeys {
    pub version: ProtocolVersion,
    pub suite: CipherSuite,
    pub level: Level,
    pub secret: [u8; 32],
    pub key: [u8; 32],
    pub key_len: usize,
    pub iv: [u8; 12],
}

impl Drop for RecordKeys {
    fn drop(&mut self) {
        self.secret.zeroize();
        self.key.zeroize();
        self.iv.zeroize();
    }
}

/// What the handshake settled on, reported once on completion.
#[derive(Clone)]
pub struct SessionInfo {
    pub version: ProtocolVersion,
    pub suite: CipherSuite,
    pub alpn: heapless::Vec<u8, 16>,
    pub server_name: heapless::Vec<u8, 64>,
    /// TLS 1.3 resumption master secret; zero for TLS 1.2.
    pub resumption_master: [u8; 32],
    /// SHA-256 of the peer's certificate, zero when none was presented.
    pub peer_cert_digest: [u8; 32],
    pub resumed: bool,
}

impl Drop for SessionInfo {
    fn drop(&mut self) {
        self.resumption_master.zeroize();
    }
}

/// Everything a client needs to resume a session from a ticket.
pub struct ResumptionData {
    pub psk: [u8; 32],
    /// The opaque ticket blob, used as the PSK identity.
    pub identity: heapless::Vec<u8, 256>,
    pub suite: CipherSuite,
    pub age_add: u32,
    /// Unix seconds when the ticket was received.
    pub issued_at: u64,
    pub lifetime_secs: u32,
    pub max_early_data: u32,
    pub server_name: heapless::Vec<u8, 64>,
    pub alpn: heapless::Vec<u8, 16>,
}

impl Drop for ResumptionData {
    fn drop(&mut self) {
        self.psk.zeroize();
    }
}

/// Ordered engine output. Callers must drain the queue after every call
/// into the engine; the ordering of sends and key installations is load
/// bearing.
pub enum Output {
    /// A handshake message to transmit. `level` tells the record layer
    /// (or the QUIC adapter) which keys protect it; `Initial` means
    /// plaintext.
    Send { level: Level, data: HandshakeBuf },
    /// Emit a change_cipher_spec record (TLS 1.2 key switch).
    SendChangeCipherSpec,
    /// Install record protection for one direction.
    InstallKeys { direction: Direction, keys: RecordKeys },
    /// Handshake complete.
    Connected(SessionInfo),
    /// Server accepted the 0-RTT offer.
    EarlyDataAccepted,
    /// 0-RTT was offered but will not be used. On the server this also
    /// means incoming undecryptable early-data records must be skipped.
    EarlyDataRejected,
}

/// Explicit randomness for one handshake.
pub struct EngineRandom {
    /// ClientHello/ServerHello random.
    pub hello_random: [u8; 32],
    /// Legacy session id (echoed for middlebox compatibility).
    pub session_id: [u8; 32],
    /// Seed for the initial ECDHE key pair.
    pub key_share_seed: [u8; 32],
    /// Seed for the replacement key pair after HelloRetryRequest.
    pub retry_key_share_seed: [u8; 32],
    /// Server: seeds ticket age_add values and sealing nonces.
    pub ticket_seed: [u8; 32],
}

/// Handshake configuration. Borrowed data must outlive the engine.
pub struct Config<'a> {
    pub role: Role,
    /// SNI sent by the client; servers use it to validate resumption.
    pub server_name: &'a str,
    /// ALPN protocols: the client's offer, or the server's preference list.
    pub alpn: &'a [&'a [u8]],
    /// Cipher suites in preference order. Server preference wins.
    pub suites: &'a [CipherSuite],
    /// Key exchange groups in preference order.
    pub groups: &'a [NamedGroup],
    /// Server certificate (DER).
    pub cert_der: &'a [u8],
    /// Server Ed25519 signing seed.
    pub signing_seed: Option<&'a [u8; 32]>,
    /// Client-side certificate verification.
    pub verifier: Option<&'a dyn CertificateVerifier>,
    /// Server ticket sealing keys. No tickets are issued without them.
    #[cfg(feature = "rustcrypto-aes")]
    pub ticket_keys: Option<&'a TicketKeySet>,
    /// How many NewSessionTicket messages to issue after the handshake.
    pub tickets_to_send: u8,
    /// Whether the client offers (or the server allows) TLS 1.2.
    pub offer_tls12: bool,
    /// Unix seconds, for ticket ages and certificate validity.
    pub now: u64,
    /// Client: resume from this ticket.
    pub resume: Option<&'a ResumptionData>,
    /// Client: offer 0-RTT (requires a resumable ticket with a budget).
    /// Server: willing to accept 0-RTT.
    pub early_data: bool,
    /// Server: early-data byte budget granted in new tickets.
    pub max_early_data: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Start,
    // TLS 1.3 client
    AwaitServerHello,
    AwaitEncryptedExtensions,
    AwaitCertificate,
    AwaitCertificateVerify,
    AwaitServerFinished,
    // TLS 1.3 server
    AwaitClientHello,
    AwaitRetryClientHello,
    AwaitEndOfEarlyData,
    AwaitClientFinished,
    // TLS 1.2 client
    AwaitCertificate12,
    AwaitServerKeyExchange12,
    AwaitServerHelloDone12,
    // shared TLS 1.2: waiting for the peer's change_cipher_spec
    AwaitCcs12,
    AwaitFinished12,
    // TLS 1.2 server
    AwaitClientKeyExchange12,
    Connected,
    Failed,
}

/// The handshake state machine.
pub struct Engine<'a, H: Hkdf> {
    config: Config<'a>,
    random: EngineRandom,
    hkdf: H,
    state: State,
    transcript: TranscriptHash,
    outputs: heapless::Deque<Output, 16>,

    version: Option<ProtocolVersion>,
    suite: Option<CipherSuite>,
    negotiated_alpn: heapless::Vec<u8, 16>,
    keypair: Option<KeyPair>,
    retried: bool,

    // TLS 1.3
    key_schedule: Option<KeySchedule>,
    client_hs_secret: [u8; 32],
    server_hs_secret: [u8; 32],
    client_app_secret: Option<[u8; 32]>,
    resumed: bool,
    offered_psk: bool,
    early_offered: bool,
    early_accepted: bool,
    hrr_group: Option<NamedGroup>,
    hrr_suite: Option<CipherSuite>,
    peer_cert_digest: [u8; 32],
    peer_sig_key: Option<[u8; 32]>,
    #[cfg(feature = "rustcrypto-aes")]
    resumed_state: Option<SessionState>,
    client_sni: heapless::Vec<u8, 64>,

    // TLS 1.2
    client_random: [u8; 32],
    server_random: [u8; 32],
    tls12_master: [u8; TLS12_MASTER_SECRET_LEN],
    tls12_group: Option<NamedGroup>,
    tls12_peer_share: heapless::Vec<u8, MAX_PUBKEY_LEN>,
}

impl<'a, H: Hkdf> Drop for Engine<'a, H> {
    fn drop(&mut self) {
        self.client_hs_secret.zeroize();
        self.server_hs_secret.zeroize();
        self.tls12_master.zeroize();
        if let Some(mut secret) = self.client_app_secret.take() {
            secret.zeroize();
        }
    }
}

impl<'a, H: Hkdf> Engine<'a, H> {
    pub fn new(config: Config<'a>, random: EngineRandom, hkdf: H) -> Result<Self, Error> {
        match config.role {
            Role::Server => {
                if config.signing_seed.is_none() || config.cert_der.is_empty() {
                    return Err(Error::InvalidState);
                }
            }
            Role::Client => {
                if config.verifier.is_none() {
                    return Err(Error::InvalidState);
                }
            }
        }
        let state = match config.role {
            Role::Client => State::Start,
            Role::Server => State::AwaitClientHello,
        };
        Ok(Self {
            config,
            random,
            hkdf,
            state,
            transcript: TranscriptHash::new(),
            outputs: heapless::Deque::new(),
            version: None,
            suite: None,
            negotiated_alpn: heapless::Vec::new(),
            keypair: None,
            retried: false,
            key_schedule: None,
            client_hs_secret: [0u8; 32],
            server_hs_secret: [0u8; 32],
            client_app_secret: None,
            resumed: false,
            hrr_group: None,
            hrr_suite: None,
            offered_psk: false,
            early_offered: false,
            early_accepted: false,
            peer_cert_digest: [0u8; 32],
            peer_sig_key: None,
            #[cfg(feature = "rustcrypto-aes")]
            resumed_state: None,
            client_sni: heapless::Vec::new(),
            client_random: [0u8; 32],
            server_random: [0u8; 32],
            tls12_master: [0u8; TLS12_MASTER_SECRET_LEN],
            tls12_group: None,
            tls12_peer_share: heapless::Vec::new(),
        })
    }

    /// Kick off the handshake. Emits the ClientHello on the client; a
    /// no-op on the server.
    pub fn start(&mut self) -> Result<(), Error> {
        if self.config.role == Role::Server {
            return Ok(());
        }
        if self.state != State::Start {
            return Err(Error::InvalidState);
        }
        self.send_client_hello(false)?;
        self.state = State::AwaitServerHello;
        Ok(())
    }

    /// Drain the next queued output.
    pub fn poll_output(&mut self) -> Option<Output> {
        self.outputs.pop_front()
    }

    pub fn is_connected(&self) -> bool {
        self.state == State::Connected
    }

    /// Feed one complete handshake message (header included).
    pub fn handshake_message(&mut self, msg: &[u8]) -> Result<(), Error> {
        let result = self.dispatch(msg);
        if let Err(ref e) = result {
            if e.is_fatal() {
                self.state = State::Failed;
            }
        }
        result
    }

    /// The peer sent change_cipher_spec. Meaningful for the TLS 1.2 key
    /// switch; tolerated and ignored during a TLS 1.3 handshake.
    pub fn ccs_received(&mut self) -> Result<(), Error> {
        if self.state == State::AwaitCcs12 {
            let keys = self.tls12_record_keys(Direction::Read)?;
            self.push_output(Output::InstallKeys {
                direction: Direction::Read,
                keys,
            })?;
            self.state = State::AwaitFinished12;
        }
        Ok(())
    }

    fn dispatch(&mut self, msg: &[u8]) -> Result<(), Error> {
        let (msg_type, body_len) = messages::read_handshake_header(msg)?;
        if 4 + body_len != msg.len() {
            return Err(Error::Framing);
        }
        let msg_type = HandshakeType::from_u8(msg_type)
            .ok_or(Error::Protocol(AlertDescription::UnexpectedMessage))?;
        let body = &msg[4..];

        match (self.state, msg_type) {
            (State::AwaitServerHello, HandshakeType::ServerHello) => {
                self.on_server_hello(body, msg)
            }
            (State::AwaitEncryptedExtensions, HandshakeType::EncryptedExtensions) => {
                self.on_encrypted_extensions(body, msg)
            }
            (State::AwaitCertificate, HandshakeType::Certificate) => {
                self.on_certificate(body, msg)
            }
            (State::AwaitCertificateVerify, HandshakeType::CertificateVerify) => {
                self.on_certificate_verify(body, msg)
            }
            (State::AwaitServerFinished, HandshakeType::Finished) => {
                self.on_server_finished(body, msg)
            }
            (State::AwaitClientHello | State::AwaitRetryClientHello, HandshakeType::ClientHello) => {
                self.on_client_hello(body, msg)
            }
            (State::AwaitEndOfEarlyData, HandshakeType::EndOfEarlyData) => {
                self.on_end_of_early_data(body, msg)
            }
            (State::AwaitClientFinished, HandshakeType::Finished) => {
                self.on_client_finished(body, msg)
            }
            (State::AwaitCertificate12, HandshakeType::Certificate) => {
                self.on_certificate_tls12(body, msg)
            }
            (State::AwaitServerKeyExchange12, HandshakeType::ServerKeyExchange) => {
                self.on_server_key_exchange(body, msg)
            }
            (State::AwaitServerHelloDone12, HandshakeType::ServerHelloDone) => {
                self.on_server_hello_done(body, msg)
            }
            (State::AwaitClientKeyExchange12, HandshakeType::ClientKeyExchange) => {
                self.on_client_key_exchange(body, msg)
            }
            (State::AwaitFinished12, HandshakeType::Finished) => self.on_finished_tls12(body, msg),
            _ => Err(Error::Protocol(AlertDescription::UnexpectedMessage)),
        }
    }

    fn push_output(&mut self, output: Output) -> Result<(), Error> {
        // Capacity is sized for the largest flight; overflow means the
        // caller stopped draining.
        self.outputs.push_back(output).map_err(|_| Error::InvalidState)
    }

    fn send_message(&mut self, level: Level, bytes: &[u8]) -> Result<(), Error> {
        let data = HandshakeBuf::from_slice(bytes).map_err(|_| Error::BufferTooSmall {
            needed: bytes.len(),
        })?;
        self.push_output(Output::Send { level, data })
    }

    fn tls13_record_keys(
        &self,
        secret: &[u8; 32],
        suite: CipherSuite,
        level: Level,
    ) -> Result<RecordKeys, Error> {
        let mut keys = RecordKeys {
            version: ProtocolVersion::Tls13,
            suite,
            level,
            secret: *secret,
            key: [0u8; 32],
            key_len: suite.key_len(),
            iv: [0u8; 12],
        };
        hkdf_expand_label(&self.hkdf, secret, b"key", &[], &mut keys.key[..suite.key_len()])?;
        let mut iv = [0u8; 12];
        hkdf_expand_label(&self.hkdf, secret, b"iv", &[], &mut iv)?;
        keys.iv = iv;
        Ok(keys)
    }

    fn tls12_record_keys(&self, direction: Direction) -> Result<RecordKeys, Error> {
        let suite = self.suite.ok_or(Error::InvalidState)?;
        let block: Tls12Keys = tls12_key_block(
            &self.hkdf,
            &self.tls12_master,
            &self.client_random,
            &self.server_random,
            suite.key_len(),
            suite.fixed_iv_len(),
        )?;
        // The client writes with the client keys; which half this engine
        // uses depends on role and direction.
        let client_half = matches!(
            (self.config.role, direction),
            (Role::Client, Direction::Write) | (Role::Server, Direction::Read)
        );
        let mut keys = RecordKeys {
            version: ProtocolVersion::Tls12,
            suite,
            level: Level::Application,
            secret: [0u8; 32],
            key: if client_half {
                block.client_write_key
            } else {
                block.server_write_key
            },
            key_len: suite.key_len(),
            iv: [0u8; 12],
        };
        let iv_len = block.iv_len;
        keys.iv[..iv_len].copy_from_slice(if client_half {
            &block.client_write_iv[..iv_len]
        } else {
            &block.server_write_iv[..iv_len]
        });
        Ok(keys)
    }

    fn session_info(&self) -> SessionInfo {
        SessionInfo {
            version: self.version.unwrap_or(ProtocolVersion::Tls13),
            suite: self.suite.unwrap_or(CipherSuite::TlsAes128GcmSha256),
            alpn: self.negotiated_alpn.clone(),
            server_name: match self.config.role {
                Role::Client => {
                    heapless::Vec::from_slice(self.config.server_name.as_bytes())
                        .unwrap_or_default()
                }
                Role::Server => self.client_sni.clone(),
            },
            resumption_master: [0u8; 32],
            peer_cert_digest: self.peer_cert_digest,
            resumed: self.resumed,
        }
    }

    // ---- client ----

    fn resumable(&self) -> Option<&'a ResumptionData> {
        let resume = self.config.resume?;
        if resume.server_name.as_slice() != self.config.server_name.as_bytes() {
            return None;
        }
        // The ticket's ALPN must still be on offer.
        if !resume.alpn.is_empty()
            && !self.config.alpn.iter().any(|p| *p == resume.alpn.as_slice())
        {
            return None;
        }
        let age = self.config.now.saturating_sub(resume.issued_at);
        if age >= u64::from(resume.lifetime_secs) {
            return None;
        }
        Some(resume)
    }

    fn send_client_hello(&mut self, retry: bool) -> Result<(), Error> {
        let group = if retry {
            self.keypair.as_ref().ok_or(Error::InvalidState)?.group()
        } else {
            *self.config.groups.first().ok_or(Error::InvalidState)?
        };
        if !retry {
            self.keypair = Some(KeyPair::from_seed(group, &self.random.key_share_seed)?);
        }
        let mut pubkey = [0u8; MAX_PUBKEY_LEN];
        let pubkey_len = self
            .keypair
            .as_ref()
            .ok_or(Error::InvalidState)?
            .public_key(&mut pubkey)?;

        // PSK and 0-RTT are only offered on the first ClientHello.
        let resume = if retry { None } else { self.resumable() };
        let offer_early =
            self.config.early_data && resume.map_or(false, |r| r.max_early_data > 0);

        let mut ext_buf = [0u8; 512];
        let mut ext_len = encode_client_hello_extensions(
            &ClientHelloParams {
                server_name: self.config.server_name,
                key_share_group: group,
                key_share: &pubkey[..pubkey_len],
                groups: self.config.groups,
                alpn: self.config.alpn,
                offer_tls12: self.config.offer_tls12 && !retry,
                early_data: offer_early,
            },
            &mut ext_buf,
        )?;

        let mut psk_schedule = None;
        if let Some(resume) = resume {
            let age_ms = self.config.now.saturating_sub(resume.issued_at) * 1000;
            let obfuscated_age = (age_ms as u32).wrapping_add(resume.age_add);
            let (new_len, _) =
                append_pre_shared_key_ext(&resume.identity, obfuscated_age, &mut ext_buf, ext_len)?;
            ext_len = new_len;
            psk_schedule = Some(KeySchedule::new(&self.hkdf, Some(&resume.psk)));
            self.offered_psk = true;
        }

        let mut msg = [0u8; MAX_HANDSHAKE_MSG];
        let msg_len = messages::encode_client_hello(
            &self.random.hello_random,
            &self.random.session_id,
            self.config.suites,
            &ext_buf[..ext_len],
            &mut msg,
        )?;

        // Patch the PSK binder: it is an HMAC over the ClientHello
        // truncated just before the binders list (RFC 8446 4.2.11.2).
        if let Some(ref schedule) = psk_schedule {
            let mut finished_key = [0u8; 32];
            schedule.derive_binder_finished_key(&self.hkdf, &mut finished_key)?;
            let mut partial = TranscriptHash::new();
            partial.update(&msg[..msg_len - PSK_BINDER_TRAILER]);
            let binder = compute_finished_verify_data(
                &self.hkdf,
                &finished_key,
                &partial.current_hash(),
            )?;
            msg[msg_len - 32..msg_len].copy_from_slice(&binder);
        }

        self.transcript.update(&msg[..msg_len]);
        self.send_message(Level::Initial, &msg[..msg_len])?;

        if offer_early {
            // Early traffic keys are derived over the ClientHello alone.
            let resume = resume.ok_or(Error::InvalidState)?;
            let schedule = psk_schedule.as_ref().ok_or(Error::InvalidState)?;
            let ch_hash = self.transcript.current_hash();
            let mut early_secret = [0u8; 32];
            schedule.derive_early_traffic_secret(&self.hkdf, &ch_hash, &mut early_secret)?;
            let keys = self.tls13_record_keys(&early_secret, resume.suite, Level::EarlyData)?;
            early_secret.zeroize();
            self.push_output(Output::InstallKeys {
                direction: Direction::Write,
                keys,
            })?;
            self.early_offered = true;
        }

        self.key_schedule = psk_schedule;
        Ok(())
    }

    fn on_server_hello(&mut self, body: &[u8], raw: &[u8]) -> Result<(), Error> {
        let sh = messages::parse_server_hello(body)?;
        let exts = parse_server_hello_extensions(sh.extensions)?;
        let suite = sh.cipher_suite;

        if !self.config.suites.contains(&suite) {
            return Err(Error::Protocol(AlertDescription::IllegalParameter));
        }

        if sh.is_hello_retry_request() {
            return self.on_hello_retry_request(suite, &exts, raw);
        }

        if exts.selected_version == extensions::VERSION_TLS13 {
            self.on_server_hello_tls13(suite, &exts, raw)
        } else {
            // No TLS 1.3 supported_versions: the server picked TLS 1.2.
            // A HelloRetryRequest pinned the handshake to TLS 1.3.
            if self.retried {
                return Err(Error::Protocol(AlertDescription::IllegalParameter));
            }
            if !self.config.offer_tls12 || suite.version() != ProtocolVersion::Tls12 {
                return Err(Error::Protocol(AlertDescription::ProtocolVersion));
            }
            self.version = Some(ProtocolVersion::Tls12);
            self.suite = Some(suite);
            self.client_random = self.random.hello_random;
            self.server_random = *sh.random;
            if let Some(proto) = exts.alpn {
                if !self.config.alpn.iter().any(|p| *p == proto) {
                    return Err(Error::Protocol(AlertDescription::IllegalParameter));
                }
                self.negotiated_alpn =
                    heapless::Vec::from_slice(proto).map_err(|_| Error::Framing)?;
            }
            if self.early_offered {
                self.early_offered = false;
                self.key_schedule = None;
                self.push_output(Output::EarlyDataRejected)?;
            }
            self.transcript.update(raw);
            self.state = State::AwaitCertificate12;
            Ok(())
        }
    }

    fn on_hello_retry_request(
        &mut self,
        suite: CipherSuite,
        exts: &extensions::ServerHelloExtensions<'_>,
        raw: &[u8],
    ) -> Result<(), Error> {
        if self.retried {
            return Err(Error::Protocol(AlertDescription::UnexpectedMessage));
        }
        if exts.selected_version != extensions::VERSION_TLS13 {
            return Err(Error::Protocol(AlertDescription::ProtocolVersion));
        }
        let retry_group = exts
            .retry_group
            .and_then(NamedGroup::from_u16)
            .ok_or(Error::Protocol(AlertDescription::MissingExtension))?;
        let current_group = self.keypair.as_ref().ok_or(Error::InvalidState)?.group();
        if retry_group == current_group || !self.config.groups.contains(&retry_group) {
            return Err(Error::Protocol(AlertDescription::IllegalParameter));
        }

        self.transcript.retry_substitute();
        self.transcript.update(raw);
        self.retried = true;
        self.hrr_suite = Some(suite);

        // A retry abandons the 0-RTT and PSK offers.
        if self.early_offered {
            self.early_offered = false;
            self.push_output(Output::EarlyDataRejected)?;
        }
        self.offered_psk = false;
        self.key_schedule = None;

        self.keypair = Some(KeyPair::from_seed(
            retry_group,
            &self.random.retry_key_share_seed,
        )?);
        self.send_client_hello(true)?;
        self.state = State::AwaitServerHello;
        Ok(())
    }

    fn on_server_hello_tls13(
        &mut self,
        suite: CipherSuite,
        exts: &extensions::ServerHelloExtensions<'_>,
        raw: &[u8],
    ) -> Result<(), Error> {
        if suite.version() != ProtocolVersion::Tls13 {
            return Err(Error::Protocol(AlertDescription::IllegalParameter));
        }
        // The suite a HelloRetryRequest selected must not change
        // (RFC 8446 section 4.1.4). The retry group is pinned through the
        // rebuilt key share and checked against the server's share below.
        if self.retried && self.hrr_suite != Some(suite) {
            return Err(Error::Protocol(AlertDescription::IllegalParameter));
        }
        self.version = Some(ProtocolVersion::Tls13);
        self.suite = Some(suite);

        match exts.selected_psk {
            Some(0) if self.offered_psk => {
                self.resumed = true;
            }
            Some(_) => return Err(Error::Protocol(AlertDescription::IllegalParameter)),
            None => {
                // Full handshake; the PSK-seeded schedule is discarded.
                self.key_schedule = None;
            }
        }
        if self.key_schedule.is_none() {
            self.key_schedule = Some(KeySchedule::new(&self.hkdf, None));
        }

        let share = exts
            .key_share
            .as_ref()
            .ok_or(Error::Protocol(AlertDescription::MissingExtension))?;
        let keypair = self.keypair.as_ref().ok_or(Error::InvalidState)?;
        if share.group != keypair.group() as u16 {
            return Err(Error::Protocol(AlertDescription::IllegalParameter));
        }
        let shared = keypair.shared_secret(share.key)?;

        self.transcript.update(raw);
        let hs_hash = self.transcript.current_hash();

        let schedule = self.key_schedule.as_mut().ok_or(Error::InvalidState)?;
        schedule.derive_handshake_secret(&self.hkdf, &shared)?;
        let mut client_hs = [0u8; 32];
        let mut server_hs = [0u8; 32];
        schedule.derive_handshake_traffic_secrets(
            &self.hkdf,
            &hs_hash,
            &mut client_hs,
            &mut server_hs,
        )?;
        self.client_hs_secret = client_hs;
        self.server_hs_secret = server_hs;

        let read_keys = self.tls13_record_keys(&server_hs, suite, Level::Handshake)?;
        self.push_output(Output::InstallKeys {
            direction: Direction::Read,
            keys: read_keys,
        })?;
        if !self.early_offered {
            // With 0-RTT in flight the write side stays on early keys
            // until EndOfEarlyData.
            let write_keys = self.tls13_record_keys(&client_hs, suite, Level::Handshake)?;
            self.push_output(Output::InstallKeys {
                direction: Direction::Write,
                keys: write_keys,
            })?;
        }

        self.state = State::AwaitEncryptedExtensions;
        Ok(())
    }

    fn on_encrypted_extensions(&mut self, body: &[u8], raw: &[u8]) -> Result<(), Error> {
        let ext_data = messages::parse_encrypted_extensions(body)?;
        let data = parse_encrypted_extensions_data(ext_data)?;

        if let Some(proto) = data.alpn {
            if !self.config.alpn.iter().any(|p| *p == proto) {
                return Err(Error::Protocol(AlertDescription::IllegalParameter));
            }
            self.negotiated_alpn = heapless::Vec::from_slice(proto).map_err(|_| Error::Framing)?;
        }

        if self.early_offered {
            if data.early_data_accepted && self.resumed {
                self.early_accepted = true;
                self.push_output(Output::EarlyDataAccepted)?;
            } else {
                self.early_offered = false;
                self.push_output(Output::EarlyDataRejected)?;
                // Writes switch to handshake keys now.
                let suite = self.suite.ok_or(Error::InvalidState)?;
                let secret = self.client_hs_secret;
                let keys = self.tls13_record_keys(&secret, suite, Level::Handshake)?;
                self.push_output(Output::InstallKeys {
                    direction: Direction::Write,
                    keys,
                })?;
            }
        } else if data.early_data_accepted {
            return Err(Error::Protocol(AlertDescription::UnsupportedExtension));
        }

        self.transcript.update(raw);
        self.state = if self.resumed {
            State::AwaitServerFinished
        } else {
            State::AwaitCertificate
        };
        Ok(())
    }

    fn on_certificate(&mut self, body: &[u8], raw: &[u8]) -> Result<(), Error> {
        let payload = messages::parse_certificate(body)?;
        let entry = messages::iter_certificate_entries(payload.entries)
            .next()
            .ok_or(Error::Certificate)??;

        let verifier = self.config.verifier.ok_or(Error::InvalidState)?;
        let key = verifier.verify_cert(
            entry.cert_data,
            self.config.server_name.as_bytes(),
            self.config.now,
        )?;
        self.peer_sig_key = Some(key);
        self.peer_cert_digest = cert_digest(entry.cert_data);

        self.transcript.update(raw);
        self.state = State::AwaitCertificateVerify;
        Ok(())
    }

    fn on_certificate_verify(&mut self, body: &[u8], raw: &[u8]) -> Result<(), Error> {
        let cv = messages::parse_certificate_verify(body)?;
        if cv.algorithm != ED25519_ALGORITHM {
            return Err(Error::Protocol(AlertDescription::IllegalParameter));
        }
        let key = self.peer_sig_key.ok_or(Error::InvalidState)?;
        let hash = self.transcript.current_hash();
        verify_certificate_verify(&key, SignContext::Server, cv.signature, &hash)
            .map_err(|_| Error::Protocol(AlertDescription::DecryptError))?;

        self.transcript.update(raw);
        self.state = State::AwaitServerFinished;
        Ok(())
    }

    fn on_server_finished(&mut self, body: &[u8], raw: &[u8]) -> Result<(), Error> {
        let suite = self.suite.ok_or(Error::InvalidState)?;
        let hash = self.transcript.current_hash();
        let mut finished_key = [0u8; 32];
        KeySchedule::derive_finished_key(&self.hkdf, &self.server_hs_secret, &mut finished_key)?;
        let expected = compute_finished_verify_data(&self.hkdf, &finished_key, &hash)?;
        let data = messages::parse_finished(body, 32)?;
        if !bool::from(expected.ct_eq(data)) {
            return Err(Error::Protocol(AlertDescription::DecryptError));
        }
        self.transcript.update(raw);

        // Application secrets cover the transcript through the server
        // Finished.
        let app_hash = self.transcript.current_hash();
        let schedule = self.key_schedule.as_mut().ok_or(Error::InvalidState)?;
        schedule.derive_master_secret(&self.hkdf)?;
        let mut client_app = [0u8; 32];
        let mut server_app = [0u8; 32];
        schedule.derive_app_traffic_secrets(
            &self.hkdf,
            &app_hash,
            &mut client_app,
            &mut server_app,
        )?;

        let read_keys = self.tls13_record_keys(&server_app, suite, Level::Application)?;
        self.push_output(Output::InstallKeys {
            direction: Direction::Read,
            keys: read_keys,
        })?;

        if self.early_accepted {
            // Close out the early data stream, then move writes to the
            // handshake keys for Finished.
            let mut eoed = [0u8; 8];
            let eoed_len = messages::encode_end_of_early_data(&mut eoed)?;
            self.send_message(Level::EarlyData, &eoed[..eoed_len])?;
            self.transcript.update(&eoed[..eoed_len]);
            let secret = self.client_hs_secret;
            let keys = self.tls13_record_keys(&secret, suite, Level::Handshake)?;
            self.push_output(Output::InstallKeys {
                direction: Direction::Write,
                keys,
            })?;
        }

        let fin_hash = self.transcript.current_hash();
        let mut client_finished_key = [0u8; 32];
        KeySchedule::derive_finished_key(
            &self.hkdf,
            &self.client_hs_secret,
            &mut client_finished_key,
        )?;
        let verify_data =
            compute_finished_verify_data(&self.hkdf, &client_finished_key, &fin_hash)?;
        let mut fin = [0u8; 64];
        let fin_len = messages::encode_finished(&verify_data, &mut fin)?;
        self.send_message(Level::Handshake, &fin[..fin_len])?;
        self.transcript.update(&fin[..fin_len]);

        let write_keys = self.tls13_record_keys(&client_app, suite, Level::Application)?;
        self.push_output(Output::InstallKeys {
            direction: Direction::Write,
            keys: write_keys,
        })?;

        // Resumption master covers the transcript through the client
        // Finished.
        let res_hash = self.transcript.current_hash();
        let schedule = self.key_schedule.as_ref().ok_or(Error::InvalidState)?;
        let mut resumption_master = [0u8; 32];
        schedule.derive_resumption_master_secret(&self.hkdf, &res_hash, &mut resumption_master)?;

        let mut info = self.session_info();
        info.version = ProtocolVersion::Tls13;
        info.resumption_master = resumption_master;
        self.push_output(Output::Connected(info))?;
        self.state = State::Connected;
        Ok(())
    }

    // ---- server ----

    fn on_client_hello(&mut self, body: &[u8], raw: &[u8]) -> Result<(), Error> {
        let ch = messages::parse_client_hello(body)?;
        let exts = parse_client_hello_extensions(ch.extensions)?;

        let mut session_id = [0u8; 32];
        let session_id_len = ch.session_id.len().min(32);
        session_id[..session_id_len].copy_from_slice(&ch.session_id[..session_id_len]);
        let client_random = *ch.random;

        let mut offered = heapless::Vec::<CipherSuite, 8>::new();
        for code in messages::iter_cipher_suites(ch.cipher_suites) {
            if let Some(suite) = CipherSuite::from_u16(code) {
                let _ = offered.push(suite);
            }
        }

        if let Some(name) = exts.server_name {
            self.client_sni = heapless::Vec::from_slice(name).map_err(|_| Error::Framing)?;
        }

        // Prefer TLS 1.3; fall back to 1.2 when the client advertises it
        // but offers no 1.3 suite.
        let tls13_suite = if exts.supports_tls13 {
            self.select_suite(&offered, ProtocolVersion::Tls13).ok()
        } else {
            None
        };
        if let Some(suite) = tls13_suite {
            self.on_client_hello_tls13(&session_id[..session_id_len], suite, &exts, raw)
        } else if self.state == State::AwaitClientHello
            && exts.supports_tls12
            && self.config.offer_tls12
        {
            self.on_client_hello_tls12(
                &session_id[..session_id_len],
                client_random,
                &offered,
                &exts,
                raw,
            )
        } else if exts.supports_tls13 {
            Err(Error::Protocol(AlertDescription::HandshakeFailure))
        } else {
            Err(Error::Protocol(AlertDescription::ProtocolVersion))
        }
    }

    fn select_suite(
        &self,
        offered: &[CipherSuite],
        version: ProtocolVersion,
    ) -> Result<CipherSuite, Error> {
        // Server preference order wins.
        self.config
            .suites
            .iter()
            .copied()
            .find(|s| s.version() == version && offered.contains(s))
            .ok_or(Error::Protocol(AlertDescription::HandshakeFailure))
    }

    fn select_alpn(
        &self,
        client_protocols: &[&[u8]],
    ) -> Result<heapless::Vec<u8, 16>, Error> {
        if client_protocols.is_empty() || self.config.alpn.is_empty() {
            return Ok(heapless::Vec::new());
        }
        for server_proto in self.config.alpn {
            if client_protocols.contains(server_proto) {
                return heapless::Vec::from_slice(server_proto).map_err(|_| Error::Framing);
            }
        }
        Err(Error::Protocol(AlertDescription::NoApplicationProtocol))
    }

    fn on_client_hello_tls13(
        &mut self,
        session_id: &[u8],
        suite: CipherSuite,
        exts: &extensions::ClientHelloExtensions<'_>,
        raw: &[u8],
    ) -> Result<(), Error> {
        self.suite = Some(suite);
        self.version = Some(ProtocolVersion::Tls13);
        self.negotiated_alpn = self.select_alpn(&exts.alpn_protocols)?;

        // Do we have a usable key share, or do we need a retry?
        let share = match &exts.key_share {
            Some(entry) => match NamedGroup::from_u16(entry.group) {
                Some(g) if self.config.groups.contains(&g) => Some((g, entry.key)),
                _ => None,
            },
            None => None,
        };
        if self.state == State::AwaitRetryClientHello {
            // The retry named the group the share must use.
            let wanted = self.hrr_group.ok_or(Error::InvalidState)?;
            match share {
                Some((g, _)) if g == wanted => {}
                _ => return Err(Error::Protocol(AlertDescription::IllegalParameter)),
            }
        }
        let share = match share {
            Some(s) => s,
            None => {
                let retry_group = self
                    .config
                    .groups
                    .iter()
                    .copied()
                    .find(|g| exts.groups.contains(&(*g as u16)))
                    .ok_or(Error::Protocol(AlertDescription::HandshakeFailure))?;
                return self.send_hello_retry(session_id, suite, retry_group, raw);
            }
        };

        // PSK resumption.
        #[allow(unused_mut)]
        let mut selected_psk: Option<u16> = None;
        #[cfg(feature = "rustcrypto-aes")]
        if let (Some(psk_offer), Some(ticket_keys)) = (&exts.pre_shared_key, self.config.ticket_keys)
        {
            if exts.psk_dhe_mode {
                if let Some(state) = ticket_keys.open(psk_offer.identity, self.config.now) {
                    let compatible = state.protocol_version == ProtocolVersion::Tls13
                        && state.server_name.as_slice() == self.client_sni.as_slice()
                        && state.alpn.as_slice() == self.negotiated_alpn.as_slice();
                    if compatible {
                        // A bad binder on a known ticket is fatal.
                        let schedule =
                            KeySchedule::new(&self.hkdf, Some(&state.resumption_secret));
                        let mut finished_key = [0u8; 32];
                        schedule.derive_binder_finished_key(&self.hkdf, &mut finished_key)?;
                        let mut partial = TranscriptHash::new();
                        partial.update(&raw[..raw.len() - PSK_BINDER_TRAILER]);
                        let expected = compute_finished_verify_data(
                            &self.hkdf,
                            &finished_key,
                            &partial.current_hash(),
                        )?;
                        if !bool::from(expected.ct_eq(psk_offer.binder)) {
                            return Err(Error::Protocol(AlertDescription::DecryptError));
                        }
                        self.key_schedule = Some(schedule);
                        self.resumed = true;
                        selected_psk = Some(0);
                        self.resumed_state = Some(state);
                    }
                }
            }
        }

        let keypair = KeyPair::from_seed(share.0, &self.random.key_share_seed)?;
        let shared = keypair.shared_secret(share.1)?;
        let mut pubkey = [0u8; MAX_PUBKEY_LEN];
        let pubkey_len = keypair.public_key(&mut pubkey)?;
        self.keypair = Some(keypair);

        self.transcript.update(raw);
        let ch_hash = self.transcript.current_hash();

        // ServerHello.
        let mut ext_buf = [0u8; 256];
        let ext_len = encode_server_hello_extensions(
            share.0,
            &pubkey[..pubkey_len],
            selected_psk,
            &mut ext_buf,
        )?;
        let mut sh = [0u8; MAX_HANDSHAKE_MSG];
        let sh_len = messages::encode_server_hello(
            &self.random.hello_random,
            session_id,
            suite,
            &ext_buf[..ext_len],
            &mut sh,
        )?;
        self.transcript.update(&sh[..sh_len]);
        self.send_message(Level::Initial, &sh[..sh_len])?;

        // Handshake secrets.
        if self.key_schedule.is_none() {
            self.key_schedule = Some(KeySchedule::new(&self.hkdf, None));
        }
        let hs_hash = self.transcript.current_hash();
        let schedule = self.key_schedule.as_mut().ok_or(Error::InvalidState)?;
        schedule.derive_handshake_secret(&self.hkdf, &shared)?;
        let mut client_hs = [0u8; 32];
        let mut server_hs = [0u8; 32];
        schedule.derive_handshake_traffic_secrets(
            &self.hkdf,
            &hs_hash,
            &mut client_hs,
            &mut server_hs,
        )?;
        self.client_hs_secret = client_hs;
        self.server_hs_secret = server_hs;

        let write_keys = self.tls13_record_keys(&server_hs, suite, Level::Handshake)?;
        self.push_output(Output::InstallKeys {
            direction: Direction::Write,
            keys: write_keys,
        })?;

        // 0-RTT decision: only for a resumed, un-retried handshake on the
        // original suite, within the ticket's budget.
        let mut accept_early = false;
        #[cfg(feature = "rustcrypto-aes")]
        if exts.early_data && self.config.early_data && self.resumed && !self.retried {
            if let Some(ref state) = self.resumed_state {
                if state.max_early_data > 0 && state.cipher_suite == suite {
                    accept_early = true;
                }
            }
        }
        if accept_early {
            let schedule = self.key_schedule.as_ref().ok_or(Error::InvalidState)?;
            let mut early_secret = [0u8; 32];
            schedule.derive_early_traffic_secret(&self.hkdf, &ch_hash, &mut early_secret)?;
            let keys = self.tls13_record_keys(&early_secret, suite, Level::EarlyData)?;
            early_secret.zeroize();
            self.push_output(Output::InstallKeys {
                direction: Direction::Read,
                keys,
            })?;
            self.push_output(Output::EarlyDataAccepted)?;
            self.early_accepted = true;
        } else {
            if exts.early_data {
                self.push_output(Output::EarlyDataRejected)?;
            }
            let keys = self.tls13_record_keys(&client_hs, suite, Level::Handshake)?;
            self.push_output(Output::InstallKeys {
                direction: Direction::Read,
                keys,
            })?;
        }

        // EncryptedExtensions.
        let mut ee_ext = [0u8; 64];
        let ee_ext_len =
            encode_encrypted_extensions_data(&self.negotiated_alpn, accept_early, &mut ee_ext)?;
        let mut ee = [0u8; 128];
        let ee_len = messages::encode_encrypted_extensions(&ee_ext[..ee_ext_len], &mut ee)?;
        self.transcript.update(&ee[..ee_len]);
        self.send_message(Level::Handshake, &ee[..ee_len])?;

        if !self.resumed {
            // Certificate + CertificateVerify.
            let mut cert = [0u8; MAX_HANDSHAKE_MSG];
            let cert_len = messages::encode_certificate(self.config.cert_der, &mut cert)?;
            self.transcript.update(&cert[..cert_len]);
            self.send_message(Level::Handshake, &cert[..cert_len])?;

            let seed = self.config.signing_seed.ok_or(Error::InvalidState)?;
            let cv_hash = self.transcript.current_hash();
            let signature = sign_certificate_verify(seed, SignContext::Server, &cv_hash)?;
            let mut cv = [0u8; 128];
            let cv_len =
                messages::encode_certificate_verify(ED25519_ALGORITHM, &signature, &mut cv)?;
            self.transcript.update(&cv[..cv_len]);
            self.send_message(Level::Handshake, &cv[..cv_len])?;
        }

        // Server Finished.
        let fin_hash = self.transcript.current_hash();
        let mut finished_key = [0u8; 32];
        KeySchedule::derive_finished_key(&self.hkdf, &server_hs, &mut finished_key)?;
        let verify_data = compute_finished_verify_data(&self.hkdf, &finished_key, &fin_hash)?;
        let mut fin = [0u8; 64];
        let fin_len = messages::encode_finished(&verify_data, &mut fin)?;
        self.transcript.update(&fin[..fin_len]);
        self.send_message(Level::Handshake, &fin[..fin_len])?;

        // Application secrets cover the transcript through the server
        // Finished; the write side switches now, reads stay on the
        // handshake (or early) keys until the client Finished.
        let app_hash = self.transcript.current_hash();
        let schedule = self.key_schedule.as_mut().ok_or(Error::InvalidState)?;
        schedule.derive_master_secret(&self.hkdf)?;
        let mut client_app = [0u8; 32];
        let mut server_app = [0u8; 32];
        schedule.derive_app_traffic_secrets(
            &self.hkdf,
            &app_hash,
            &mut client_app,
            &mut server_app,
        )?;
        let write_keys = self.tls13_record_keys(&server_app, suite, Level::Application)?;
        self.push_output(Output::InstallKeys {
            direction: Direction::Write,
            keys: write_keys,
        })?;
        // Stash the client application secret for installation after the
        // client Finished verifies.
        self.client_app_secret = Some(client_app);

        self.state = if accept_early {
            State::AwaitEndOfEarlyData
        } else {
            State::AwaitClientFinished
        };
        Ok(())
    }

    fn send_hello_retry(
        &mut self,
        session_id: &[u8],
        suite: CipherSuite,
        retry_group: NamedGroup,
        raw: &[u8],
    ) -> Result<(), Error> {
        self.transcript.update(raw);
        self.transcript.retry_substitute();

        let mut ext_buf = [0u8; 64];
        let ext_len = encode_hello_retry_extensions(retry_group, &mut ext_buf)?;
        let mut hrr = [0u8; 256];
        let hrr_len = messages::encode_server_hello(
            &HELLO_RETRY_REQUEST_RANDOM,
            session_id,
            suite,
            &ext_buf[..ext_len],
            &mut hrr,
        )?;
        self.transcript.update(&hrr[..hrr_len]);
        self.send_message(Level::Initial, &hrr[..hrr_len])?;
        self.retried = true;
        self.hrr_group = Some(retry_group);
        self.state = State::AwaitRetryClientHello;
        Ok(())
    }

    fn on_end_of_early_data(&mut self, body: &[u8], raw: &[u8]) -> Result<(), Error> {
        if !body.is_empty() {
            return Err(Error::Framing);
        }
        self.transcript.update(raw);
        // The client's next flight arrives under handshake keys.
        let suite = self.suite.ok_or(Error::InvalidState)?;
        let secret = self.client_hs_secret;
        let keys = self.tls13_record_keys(&secret, suite, Level::Handshake)?;
        self.push_output(Output::InstallKeys {
            direction: Direction::Read,
            keys,
        })?;
        self.state = State::AwaitClientFinished;
        Ok(())
    }

    fn on_client_finished(&mut self, body: &[u8], raw: &[u8]) -> Result<(), Error> {
        let suite = self.suite.ok_or(Error::InvalidState)?;
        let hash = self.transcript.current_hash();
        let mut finished_key = [0u8; 32];
        KeySchedule::derive_finished_key(&self.hkdf, &self.client_hs_secret, &mut finished_key)?;
        let expected = compute_finished_verify_data(&self.hkdf, &finished_key, &hash)?;
        let data = messages::parse_finished(body, 32)?;
        if !bool::from(expected.ct_eq(data)) {
            return Err(Error::Protocol(AlertDescription::DecryptError));
        }
        self.transcript.update(raw);

        let client_app = self.client_app_secret.ok_or(Error::InvalidState)?;
        let read_keys = self.tls13_record_keys(&client_app, suite, Level::Application)?;
        self.push_output(Output::InstallKeys {
            direction: Direction::Read,
            keys: read_keys,
        })?;

        let res_hash = self.transcript.current_hash();
        let schedule = self.key_schedule.as_ref().ok_or(Error::InvalidState)?;
        let mut resumption_master = [0u8; 32];
        schedule.derive_resumption_master_secret(&self.hkdf, &res_hash, &mut resumption_master)?;

        let mut info = self.session_info();
        info.resumption_master = resumption_master;
        self.push_output(Output::Connected(info))?;
        self.state = State::Connected;

        self.issue_tickets(&resumption_master)?;
        resumption_master.zeroize();
        Ok(())
    }

    #[cfg(feature = "rustcrypto-aes")]
    fn issue_tickets(&mut self, resumption_master: &[u8; 32]) -> Result<(), Error> {
        let Some(ticket_keys) = self.config.ticket_keys else {
            return Ok(());
        };
        let suite = self.suite.ok_or(Error::InvalidState)?;
        for i in 0..self.config.tickets_to_send {
            let ticket_nonce = [i];
            let mut psk = [0u8; 32];
            derive_ticket_psk(&self.hkdf, resumption_master, &ticket_nonce, &mut psk)?;

            let seed = &self.random.ticket_seed;
            let age_add = u32::from_be_bytes([
                seed[(4 * i as usize) % 28],
                seed[(4 * i as usize + 1) % 28],
                seed[(4 * i as usize + 2) % 28],
                seed[(4 * i as usize + 3) % 28],
            ]);

            let state = SessionState {
                protocol_version: ProtocolVersion::Tls13,
                cipher_suite: suite,
                resumption_secret: psk,
                peer_cert_digest: [0u8; 32],
                server_name: self.client_sni.clone(),
                alpn: self.negotiated_alpn.clone(),
                creation_time: self.config.now,
                lifetime_secs: DEFAULT_TICKET_LIFETIME,
                ticket_age_add: age_add,
                max_early_data: self.config.max_early_data,
            };

            let mut seal_nonce = [0u8; 12];
            seal_nonce.copy_from_slice(&seed[20..32]);
            seal_nonce[11] ^= i;

            let mut blob = [0u8; crate::tls::ticket::MAX_TICKET_LEN];
            let blob_len = ticket_keys.seal(&state, &seal_nonce, &mut blob)?;

            let max_early = if self.config.max_early_data > 0 {
                Some(self.config.max_early_data)
            } else {
                None
            };
            let mut nst = [0u8; MAX_HANDSHAKE_MSG];
            let nst_len = messages::encode_new_session_ticket(
                DEFAULT_TICKET_LIFETIME,
                age_add,
                &ticket_nonce,
                &blob[..blob_len],
                max_early,
                &mut nst,
            )?;
            self.send_message(Level::Application, &nst[..nst_len])?;
        }
        Ok(())
    }

    #[cfg(not(feature = "rustcrypto-aes"))]
    fn issue_tickets(&mut self, _resumption_master: &[u8; 32]) -> Result<(), Error> {
        Ok(())
    }

    // ---- TLS 1.2 ----

    fn on_client_hello_tls12(
        &mut self,
        session_id: &[u8],
        client_random: [u8; 32],
        offered: &[CipherSuite],
        exts: &extensions::ClientHelloExtensions<'_>,
        raw: &[u8],
    ) -> Result<(), Error> {
        let suite = self.select_suite(offered, ProtocolVersion::Tls12)?;
        self.suite = Some(suite);
        self.version = Some(ProtocolVersion::Tls12);
        self.negotiated_alpn = self.select_alpn(&exts.alpn_protocols)?;
        self.client_random = client_random;
        self.server_random = self.random.hello_random;

        let group = self
            .config
            .groups
            .iter()
            .copied()
            .find(|g| exts.groups.contains(&(*g as u16)))
            .ok_or(Error::Protocol(AlertDescription::HandshakeFailure))?;
        self.tls12_group = Some(group);

        self.transcript.update(raw);

        // ServerHello (ALPN answer rides in its extensions).
        let mut ext_buf = [0u8; 64];
        let ext_len = encode_encrypted_extensions_data(&self.negotiated_alpn, false, &mut ext_buf)?;
        let mut sh = [0u8; MAX_HANDSHAKE_MSG];
        let sh_len = messages::encode_server_hello(
            &self.random.hello_random,
            session_id,
            suite,
            &ext_buf[..ext_len],
            &mut sh,
        )?;
        self.transcript.update(&sh[..sh_len]);
        self.send_message(Level::Initial, &sh[..sh_len])?;

        // Certificate.
        let mut cert = [0u8; MAX_HANDSHAKE_MSG];
        let cert_len = messages::encode_certificate_tls12(self.config.cert_der, &mut cert)?;
        self.transcript.update(&cert[..cert_len]);
        self.send_message(Level::Initial, &cert[..cert_len])?;

        // ServerKeyExchange, signed over both randoms and the params.
        let keypair = KeyPair::from_seed(group, &self.random.key_share_seed)?;
        let mut pubkey = [0u8; MAX_PUBKEY_LEN];
        let pubkey_len = keypair.public_key(&mut pubkey)?;
        self.keypair = Some(keypair);

        let mut params = [0u8; 4 + MAX_PUBKEY_LEN];
        params[0] = 0x03; // named_curve
        params[1..3].copy_from_slice(&(group as u16).to_be_bytes());
        params[3] = pubkey_len as u8;
        params[4..4 + pubkey_len].copy_from_slice(&pubkey[..pubkey_len]);

        let seed = self.config.signing_seed.ok_or(Error::InvalidState)?;
        let signature = sign_server_key_exchange(
            seed,
            &self.client_random,
            &self.server_random,
            &params[..4 + pubkey_len],
        )?;
        let mut ske = [0u8; 256];
        let ske_len = messages::encode_server_key_exchange(
            group as u16,
            &pubkey[..pubkey_len],
            ED25519_ALGORITHM,
            &signature,
            &mut ske,
        )?;
        self.transcript.update(&ske[..ske_len]);
        self.send_message(Level::Initial, &ske[..ske_len])?;

        // ServerHelloDone.
        let mut shd = [0u8; 8];
        let shd_len = messages::encode_server_hello_done(&mut shd)?;
        self.transcript.update(&shd[..shd_len]);
        self.send_message(Level::Initial, &shd[..shd_len])?;

        self.state = State::AwaitClientKeyExchange12;
        Ok(())
    }

    fn on_certificate_tls12(&mut self, body: &[u8], raw: &[u8]) -> Result<(), Error> {
        let cert_der = messages::parse_certificate_tls12(body)?;
        let verifier = self.config.verifier.ok_or(Error::InvalidState)?;
        let key = verifier.verify_cert(
            cert_der,
            self.config.server_name.as_bytes(),
            self.config.now,
        )?;
        self.peer_sig_key = Some(key);
        self.peer_cert_digest = cert_digest(cert_der);
        self.transcript.update(raw);
        self.state = State::AwaitServerKeyExchange12;
        Ok(())
    }

    fn on_server_key_exchange(&mut self, body: &[u8], raw: &[u8]) -> Result<(), Error> {
        let ske = messages::parse_server_key_exchange(body)?;
        let group = NamedGroup::from_u16(ske.group)
            .ok_or(Error::Protocol(AlertDescription::IllegalParameter))?;
        if !self.config.groups.contains(&group) {
            return Err(Error::Protocol(AlertDescription::IllegalParameter));
        }
        if ske.algorithm != ED25519_ALGORITHM {
            return Err(Error::Protocol(AlertDescription::IllegalParameter));
        }
        let key = self.peer_sig_key.ok_or(Error::InvalidState)?;
        verify_server_key_exchange(
            &key,
            &self.client_random,
            &self.server_random,
            ske.params,
            ske.signature,
        )
        .map_err(|_| Error::Protocol(AlertDescription::DecryptError))?;

        self.tls12_group = Some(group);
        self.tls12_peer_share =
            heapless::Vec::from_slice(ske.public_key).map_err(|_| Error::Framing)?;
        self.transcript.update(raw);
        self.state = State::AwaitServerHelloDone12;
        Ok(())
    }

    fn on_server_hello_done(&mut self, body: &[u8], raw: &[u8]) -> Result<(), Error> {
        if !body.is_empty() {
            return Err(Error::Framing);
        }
        self.transcript.update(raw);

        // ClientKeyExchange.
        let group = self.tls12_group.ok_or(Error::InvalidState)?;
        let keypair = KeyPair::from_seed(group, &self.random.key_share_seed)?;
        let mut pubkey = [0u8; MAX_PUBKEY_LEN];
        let pubkey_len = keypair.public_key(&mut pubkey)?;
        let premaster = keypair.shared_secret(&self.tls12_peer_share)?;

        let mut cke = [0u8; 128];
        let cke_len = messages::encode_client_key_exchange(&pubkey[..pubkey_len], &mut cke)?;
        self.transcript.update(&cke[..cke_len]);
        self.send_message(Level::Initial, &cke[..cke_len])?;

        self.tls12_master = tls12_master_secret(
            &self.hkdf,
            &premaster,
            &self.client_random,
            &self.server_random,
        )?;

        // change_cipher_spec, then Finished under the new keys.
        self.push_output(Output::SendChangeCipherSpec)?;
        let write_keys = self.tls12_record_keys(Direction::Write)?;
        self.push_output(Output::InstallKeys {
            direction: Direction::Write,
            keys: write_keys,
        })?;

        let hash = self.transcript.current_hash();
        let verify_data = tls12_verify_data(&self.hkdf, &self.tls12_master, true, &hash)?;
        let mut fin = [0u8; 32];
        let fin_len = messages::encode_finished(&verify_data, &mut fin)?;
        self.transcript.update(&fin[..fin_len]);
        self.send_message(Level::Application, &fin[..fin_len])?;

        self.state = State::AwaitCcs12;
        Ok(())
    }

    fn on_client_key_exchange(&mut self, body: &[u8], raw: &[u8]) -> Result<(), Error> {
        let peer_pubkey = messages::parse_client_key_exchange(body)?;
        let keypair = self.keypair.as_ref().ok_or(Error::InvalidState)?;
        let premaster = keypair.shared_secret(peer_pubkey)?;
        self.tls12_master = tls12_master_secret(
            &self.hkdf,
            &premaster,
            &self.client_random,
            &self.server_random,
        )?;
        self.transcript.update(raw);
        self.state = State::AwaitCcs12;
        Ok(())
    }

    fn on_finished_tls12(&mut self, body: &[u8], raw: &[u8]) -> Result<(), Error> {
        let peer_is_client = self.config.role == Role::Server;
        let hash = self.transcript.current_hash();
        let expected = tls12_verify_data(&self.hkdf, &self.tls12_master, peer_is_client, &hash)?;
        let data = messages::parse_finished(body, TLS12_VERIFY_DATA_LEN)?;
        if !bool::from(expected.ct_eq(data)) {
            return Err(Error::Protocol(AlertDescription::DecryptError));
        }
        self.transcript.update(raw);

        if self.config.role == Role::Server {
            // Answer with our own change_cipher_spec + Finished.
            self.push_output(Output::SendChangeCipherSpec)?;
            let write_keys = self.tls12_record_keys(Direction::Write)?;
            self.push_output(Output::InstallKeys {
                direction: Direction::Write,
                keys: write_keys,
            })?;
            let hash = self.transcript.current_hash();
            let verify_data = tls12_verify_data(&self.hkdf, &self.tls12_master, false, &hash)?;
            let mut fin = [0u8; 32];
            let fin_len = messages::encode_finished(&verify_data, &mut fin)?;
            self.transcript.update(&fin[..fin_len]);
            self.send_message(Level::Application, &fin[..fin_len])?;
        }

        let info = self.session_info();
        self.push_output(Output::Connected(info))?;
        self.state = State::Connected;
        Ok(())
    }
}

#[cfg(all(test, feature = "rustcrypto-aes"))]
mod tests {
    use super::*;
    use crate::crypto::rustcrypto::HkdfSha256;
    use crate::crypto::sign::{build_ed25519_cert_der, ed25519_public_key_from_seed};
    use crate::tls::verify::PinnedCertVerifier;

    const SIGNING_SEED: [u8; 32] = [0x42; 32];
    const NOW: u64 = 1_700_000_000;

    const BOTH_13: [CipherSuite; 2] = [
        CipherSuite::TlsAes128GcmSha256,
        CipherSuite::TlsChacha20Poly1305Sha256,
    ];
    const BOTH_GROUPS: [NamedGroup; 2] = [NamedGroup::X25519, NamedGroup::Secp256r1];

    fn server_cert() -> (std::vec::Vec<u8>, PinnedCertVerifier) {
        let pubkey = ed25519_public_key_from_seed(&SIGNING_SEED);
        let mut buf = [0u8; 512];
        let len = build_ed25519_cert_der(&pubkey, &mut buf).unwrap();
        let cert = buf[..len].to_vec();
        let verifier = PinnedCertVerifier::new(&cert);
        (cert, verifier)
    }

    fn rnd(tag: u8) -> EngineRandom {
        EngineRandom {
            hello_random: [tag; 32],
            session_id: [tag.wrapping_add(1); 32],
            key_share_seed: [tag.wrapping_add(2); 32],
            retry_key_share_seed: [tag.wrapping_add(3); 32],
            ticket_seed: [tag.wrapping_add(4); 32],
        }
    }

    fn client_cfg<'a>(
        verifier: &'a PinnedCertVerifier,
        suites: &'a [CipherSuite],
        groups: &'a [NamedGroup],
        resume: Option<&'a ResumptionData>,
        early_data: bool,
    ) -> Config<'a> {
        Config {
            role: Role::Client,
            server_name: "example.com",
            alpn: &[],
            suites,
            groups,
            cert_der: &[],
            signing_seed: None,
            verifier: Some(verifier),
            ticket_keys: None,
            tickets_to_send: 0,
            offer_tls12: true,
            now: NOW,
            resume,
            early_data,
            max_early_data: 0,
        }
    }

    fn server_cfg<'a>(
        cert_der: &'a [u8],
        suites: &'a [CipherSuite],
        groups: &'a [NamedGroup],
        ticket_keys: Option<&'a TicketKeySet>,
        early_data: bool,
        max_early_data: u32,
    ) -> Config<'a> {
        Config {
            role: Role::Server,
            server_name: "",
            alpn: &[],
            suites,
            groups,
            cert_der,
            signing_seed: Some(&SIGNING_SEED),
            verifier: None,
            ticket_keys,
            tickets_to_send: if ticket_keys.is_some() { 1 } else { 0 },
            offer_tls12: true,
            now: NOW,
            resume: None,
            early_data,
            max_early_data,
        }
    }

    #[derive(Default)]
    struct Collected {
        installs: std::vec::Vec<(Direction, RecordKeys)>,
        connected: Option<SessionInfo>,
        early_accepted: bool,
        early_rejected: bool,
        tickets: std::vec::Vec<std::vec::Vec<u8>>,
    }

    impl Collected {
        fn keys(&self, direction: Direction, level: Level) -> &RecordKeys {
            self.installs
                .iter()
                .rev()
                .find(|(d, k)| *d == direction && k.level == level)
                .map(|(_, k)| k)
                .unwrap()
        }
    }

    fn pump(
        from: &mut Engine<'_, HkdfSha256>,
        to: &mut Engine<'_, HkdfSha256>,
        collected: &mut Collected,
    ) -> bool {
        let mut progress = false;
        while let Some(output) = from.poll_output() {
            progress = true;
            match output {
                Output::Send { data, .. } => {
                    if data[0] == HandshakeType::NewSessionTicket as u8 {
                        collected.tickets.push(data.to_vec());
                    } else {
                        to.handshake_message(&data).unwrap();
                    }
                }
                Output::SendChangeCipherSpec => to.ccs_received().unwrap(),
                Output::InstallKeys { direction, keys } => {
                    collected.installs.push((direction, keys));
                }
                Output::Connected(info) => collected.connected = Some(info),
                Output::EarlyDataAccepted => collected.early_accepted = true,
                Output::EarlyDataRejected => collected.early_rejected = true,
            }
        }
        progress
    }

    fn drive(
        client: &mut Engine<'_, HkdfSha256>,
        server: &mut Engine<'_, HkdfSha256>,
    ) -> (Collected, Collected) {
        client.start().unwrap();
        let mut client_out = Collected::default();
        let mut server_out = Collected::default();
        loop {
            let p1 = pump(client, server, &mut client_out);
            let p2 = pump(server, client, &mut server_out);
            if !p1 && !p2 {
                break;
            }
        }
        (client_out, server_out)
    }

    fn assert_secrets_match(client: &Collected, server: &Collected, levels: &[Level]) {
        for &level in levels {
            let cw = client.keys(Direction::Write, level);
            let sr = server.keys(Direction::Read, level);
            assert_eq!(cw.key[..cw.key_len], sr.key[..sr.key_len]);
            assert_eq!(cw.iv, sr.iv);
            let cr = client.keys(Direction::Read, level);
            let sw = server.keys(Direction::Write, level);
            assert_eq!(cr.key[..cr.key_len], sw.key[..sw.key_len]);
            assert_eq!(cr.iv, sw.iv);
        }
    }

    fn ticket_to_resumption(nst_msg: &[u8], info: &SessionInfo) -> ResumptionData {
        let (_, len) = messages::read_handshake_header(nst_msg).unwrap();
        let nst = messages::parse_new_session_ticket(&nst_msg[4..4 + len]).unwrap();
        let hkdf = HkdfSha256::default();
        let mut psk = [0u8; 32];
        derive_ticket_psk(&hkdf, &info.resumption_master, nst.nonce, &mut psk).unwrap();
        ResumptionData {
            psk,
            identity: heapless::Vec::from_slice(nst.ticket).unwrap(),
            suite: info.suite,
            age_add: nst.age_add,
            issued_at: NOW,
            lifetime_secs: nst.lifetime,
            max_early_data: nst.max_early_data.unwrap_or(0),
            server_name: info.server_name.clone(),
            alpn: info.alpn.clone(),
        }
    }

    #[test]
    fn tls13_full_handshake_converges() {
        let (cert, verifier) = server_cert();
        let mut client = Engine::new(
            client_cfg(&verifier, &BOTH_13, &BOTH_GROUPS, None, false),
            rnd(1),
            HkdfSha256::default(),
        )
        .unwrap();
        let mut server = Engine::new(
            server_cfg(&cert, &BOTH_13, &BOTH_GROUPS, None, false, 0),
            rnd(100),
            HkdfSha256::default(),
        )
        .unwrap();

        let (client_out, server_out) = drive(&mut client, &mut server);
        assert!(client.is_connected());
        assert!(server.is_connected());

        let c_info = client_out.connected.as_ref().unwrap();
        let s_info = server_out.connected.as_ref().unwrap();
        assert_eq!(c_info.version, ProtocolVersion::Tls13);
        assert_eq!(s_info.version, ProtocolVersion::Tls13);
        assert_eq!(c_info.suite, s_info.suite);
        assert!(!c_info.resumed);
        assert_eq!(c_info.resumption_master, s_info.resumption_master);
        assert_ne!(c_info.resumption_master, [0u8; 32]);
        assert_ne!(c_info.peer_cert_digest, [0u8; 32]);

        assert_secrets_match(
            &client_out,
            &server_out,
            &[Level::Handshake, Level::Application],
        );
    }

    #[test]
    fn server_preference_selects_its_first_suite() {
        let (cert, verifier) = server_cert();
        let client_suites = [
            CipherSuite::TlsAes128GcmSha256,
            CipherSuite::TlsChacha20Poly1305Sha256,
        ];
        let server_suites = [
            CipherSuite::TlsChacha20Poly1305Sha256,
            CipherSuite::TlsAes128GcmSha256,
        ];
        let mut client = Engine::new(
            client_cfg(&verifier, &client_suites, &BOTH_GROUPS, None, false),
            rnd(1),
            HkdfSha256::default(),
        )
        .unwrap();
        let mut server = Engine::new(
            server_cfg(&cert, &server_suites, &BOTH_GROUPS, None, false, 0),
            rnd(100),
            HkdfSha256::default(),
        )
        .unwrap();

        let (client_out, _) = drive(&mut client, &mut server);
        assert_eq!(
            client_out.connected.unwrap().suite,
            CipherSuite::TlsChacha20Poly1305Sha256
        );
    }

    #[test]
    fn hello_retry_request_converges_on_mutual_group() {
        let (cert, verifier) = server_cert();
        let client_groups = [NamedGroup::Secp256r1, NamedGroup::X25519];
        let server_groups = [NamedGroup::X25519];
        let mut client = Engine::new(
            client_cfg(&verifier, &BOTH_13, &client_groups, None, false),
            rnd(1),
            HkdfSha256::default(),
        )
        .unwrap();
        let mut server = Engine::new(
            server_cfg(&cert, &BOTH_13, &server_groups, None, false, 0),
            rnd(100),
            HkdfSha256::default(),
        )
        .unwrap();

        let (client_out, server_out) = drive(&mut client, &mut server);
        assert!(client.is_connected());
        assert!(server.is_connected());
        assert_secrets_match(
            &client_out,
            &server_out,
            &[Level::Handshake, Level::Application],
        );
    }

    /// First queued handshake flight from an engine, skipping key installs
    /// and change_cipher_spec markers.
    fn next_send(engine: &mut Engine<'_, HkdfSha256>) -> std::vec::Vec<u8> {
        loop {
            match engine.poll_output().unwrap() {
                Output::Send { data, .. } => return data.to_vec(),
                _ => {}
            }
        }
    }

    #[test]
    fn server_hello_after_retry_must_keep_the_suite() {
        let (cert, verifier) = server_cert();
        let client_groups = [NamedGroup::Secp256r1, NamedGroup::X25519];
        let server_groups = [NamedGroup::X25519];
        let mut client = Engine::new(
            client_cfg(&verifier, &BOTH_13, &client_groups, None, false),
            rnd(1),
            HkdfSha256::default(),
        )
        .unwrap();
        let mut server = Engine::new(
            server_cfg(&cert, &BOTH_13, &server_groups, None, false, 0),
            rnd(100),
            HkdfSha256::default(),
        )
        .unwrap();

        client.start().unwrap();
        let mut scratch = Collected::default();
        // ClientHello over, HelloRetryRequest back, retry ClientHello over.
        pump(&mut client, &mut server, &mut scratch);
        pump(&mut server, &mut client, &mut scratch);
        pump(&mut client, &mut server, &mut scratch);

        // The server's next flight opens with the real ServerHello. Flip
        // its cipher suite to the other one the client offered.
        let mut sh = next_send(&mut server);
        let sid_len = sh[38] as usize;
        let at = 39 + sid_len;
        sh[at..at + 2]
            .copy_from_slice(&CipherSuite::TlsChacha20Poly1305Sha256.to_u16().to_be_bytes());

        assert_eq!(
            client.handshake_message(&sh),
            Err(Error::Protocol(AlertDescription::IllegalParameter))
        );
    }

    #[test]
    fn alpn_negotiation_picks_server_preference() {
        let (cert, verifier) = server_cert();
        let client_protocols: [&[u8]; 2] = [b"h2", b"http/1.1"];
        let server_protocols: [&[u8]; 1] = [b"http/1.1"];
        let mut client_config = client_cfg(&verifier, &BOTH_13, &BOTH_GROUPS, None, false);
        client_config.alpn = &client_protocols;
        let mut server_config = server_cfg(&cert, &BOTH_13, &BOTH_GROUPS, None, false, 0);
        server_config.alpn = &server_protocols;

        let mut client = Engine::new(client_config, rnd(1), HkdfSha256::default()).unwrap();
        let mut server = Engine::new(server_config, rnd(100), HkdfSha256::default()).unwrap();

        let (client_out, server_out) = drive(&mut client, &mut server);
        assert_eq!(
            client_out.connected.unwrap().alpn.as_slice(),
            b"http/1.1"
        );
        assert_eq!(
            server_out.connected.unwrap().alpn.as_slice(),
            b"http/1.1"
        );
    }

    fn handshake_with_ticket(
        early_budget: u32,
    ) -> (std::vec::Vec<u8>, ResumptionData, PinnedCertVerifier, std::vec::Vec<u8>) {
        let (cert, verifier) = server_cert();
        let ticket_keys = TicketKeySet::new([7; 16], [0x77; 32]);
        let mut client = Engine::new(
            client_cfg(&verifier, &BOTH_13, &BOTH_GROUPS, None, false),
            rnd(1),
            HkdfSha256::default(),
        )
        .unwrap();
        let mut server = Engine::new(
            server_cfg(&cert, &BOTH_13, &BOTH_GROUPS, Some(&ticket_keys), false, early_budget),
            rnd(100),
            HkdfSha256::default(),
        )
        .unwrap();

        let (client_out, server_out) = drive(&mut client, &mut server);
        assert_eq!(server_out.tickets.len(), 1);
        let resume =
            ticket_to_resumption(&server_out.tickets[0], client_out.connected.as_ref().unwrap());
        // The engines borrow cert/verifier through their configs; retire them
        // before handing the borrowed values back to the caller.
        drop(client);
        drop(server);
        (cert, resume, verifier, server_out.tickets[0].clone())
    }

    #[test]
    fn resumption_from_ticket() {
        let (cert, resume, verifier, _) = handshake_with_ticket(0);
        let ticket_keys = TicketKeySet::new([7; 16], [0x77; 32]);

        let mut client = Engine::new(
            client_cfg(&verifier, &BOTH_13, &BOTH_GROUPS, Some(&resume), false),
            rnd(2),
            HkdfSha256::default(),
        )
        .unwrap();
        let mut server = Engine::new(
            server_cfg(&cert, &BOTH_13, &BOTH_GROUPS, Some(&ticket_keys), false, 0),
            rnd(101),
            HkdfSha256::default(),
        )
        .unwrap();

        let (client_out, server_out) = drive(&mut client, &mut server);
        assert!(client.is_connected());
        assert!(server.is_connected());
        assert!(client_out.connected.as_ref().unwrap().resumed);
        assert!(server_out.connected.as_ref().unwrap().resumed);
        assert_secrets_match(
            &client_out,
            &server_out,
            &[Level::Handshake, Level::Application],
        );
    }

    #[test]
    fn early_data_accepted_when_offered_within_budget() {
        let (cert, resume, verifier, _) = handshake_with_ticket(4096);
        assert_eq!(resume.max_early_data, 4096);
        let ticket_keys = TicketKeySet::new([7; 16], [0x77; 32]);

        let mut client = Engine::new(
            client_cfg(&verifier, &BOTH_13, &BOTH_GROUPS, Some(&resume), true),
            rnd(2),
            HkdfSha256::default(),
        )
        .unwrap();
        let mut server = Engine::new(
            server_cfg(&cert, &BOTH_13, &BOTH_GROUPS, Some(&ticket_keys), true, 4096),
            rnd(101),
            HkdfSha256::default(),
        )
        .unwrap();

        let (client_out, server_out) = drive(&mut client, &mut server);
        assert!(client_out.early_accepted);
        assert!(server_out.early_accepted);
        assert!(client.is_connected());
        assert!(server.is_connected());

        let cw = client_out.keys(Direction::Write, Level::EarlyData);
        let sr = server_out.keys(Direction::Read, Level::EarlyData);
        assert_eq!(cw.key[..cw.key_len], sr.key[..sr.key_len]);
        assert_eq!(cw.iv, sr.iv);
    }

    #[test]
    fn early_data_rejected_when_server_disallows() {
        let (cert, resume, verifier, _) = handshake_with_ticket(4096);
        let ticket_keys = TicketKeySet::new([7; 16], [0x77; 32]);

        let mut client = Engine::new(
            client_cfg(&verifier, &BOTH_13, &BOTH_GROUPS, Some(&resume), true),
            rnd(2),
            HkdfSha256::default(),
        )
        .unwrap();
        let mut server = Engine::new(
            server_cfg(&cert, &BOTH_13, &BOTH_GROUPS, Some(&ticket_keys), false, 0),
            rnd(101),
            HkdfSha256::default(),
        )
        .unwrap();

        let (client_out, server_out) = drive(&mut client, &mut server);
        assert!(client_out.early_rejected);
        assert!(server_out.early_rejected);
        assert!(client_out.connected.as_ref().unwrap().resumed);
        assert!(client.is_connected());
        assert!(server.is_connected());
    }

    #[test]
    fn corrupted_psk_fails_binder_check() {
        let (cert, mut resume, verifier, _) = handshake_with_ticket(0);
        resume.psk[0] ^= 0x01;
        let ticket_keys = TicketKeySet::new([7; 16], [0x77; 32]);

        let mut client = Engine::new(
            client_cfg(&verifier, &BOTH_13, &BOTH_GROUPS, Some(&resume), false),
            rnd(2),
            HkdfSha256::default(),
        )
        .unwrap();
        let mut server = Engine::new(
            server_cfg(&cert, &BOTH_13, &BOTH_GROUPS, Some(&ticket_keys), false, 0),
            rnd(101),
            HkdfSha256::default(),
        )
        .unwrap();

        client.start().unwrap();
        let client_hello = loop {
            match client.poll_output().unwrap() {
                Output::Send { data, .. } => break data,
                _ => continue,
            }
        };
        assert_eq!(
            server.handshake_message(&client_hello),
            Err(Error::Protocol(AlertDescription::DecryptError))
        );
    }

    #[test]
    fn tls12_handshake_converges() {
        let (cert, verifier) = server_cert();
        let client_suites = [CipherSuite::EcdheAes128GcmSha256];
        let server_suites = [
            CipherSuite::TlsAes128GcmSha256,
            CipherSuite::EcdheAes128GcmSha256,
        ];
        let mut client = Engine::new(
            client_cfg(&verifier, &client_suites, &BOTH_GROUPS, None, false),
            rnd(1),
            HkdfSha256::default(),
        )
        .unwrap();
        let mut server = Engine::new(
            server_cfg(&cert, &server_suites, &BOTH_GROUPS, None, false, 0),
            rnd(100),
            HkdfSha256::default(),
        )
        .unwrap();

        let (client_out, server_out) = drive(&mut client, &mut server);
        assert!(client.is_connected());
        assert!(server.is_connected());

        let c_info = client_out.connected.as_ref().unwrap();
        assert_eq!(c_info.version, ProtocolVersion::Tls12);
        assert_eq!(c_info.suite, CipherSuite::EcdheAes128GcmSha256);

        let cw = client_out.keys(Direction::Write, Level::Application);
        let sr = server_out.keys(Direction::Read, Level::Application);
        assert_eq!(cw.version, ProtocolVersion::Tls12);
        assert_eq!(cw.key[..cw.key_len], sr.key[..sr.key_len]);
        assert_eq!(cw.iv[..4], sr.iv[..4]);
        let cr = client_out.keys(Direction::Read, Level::Application);
        let sw = server_out.keys(Direction::Write, Level::Application);
        assert_eq!(cr.key[..cr.key_len], sw.key[..sw.key_len]);
        assert_eq!(cr.iv[..4], sw.iv[..4]);
    }

    #[test]
    fn tls13_only_client_rejects_tls12_server_hello() {
        let (_cert, verifier) = server_cert();
        let suites = [
            CipherSuite::TlsAes128GcmSha256,
            CipherSuite::EcdheAes128GcmSha256,
        ];
        let mut config = client_cfg(&verifier, &suites, &BOTH_GROUPS, None, false);
        config.offer_tls12 = false;
        let mut client = Engine::new(config, rnd(1), HkdfSha256::default()).unwrap();
        client.start().unwrap();

        // Hand-build a TLS 1.2 ServerHello (no supported_versions).
        let mut sh = [0u8; 256];
        let sh_len = messages::encode_server_hello(
            &[9u8; 32],
            &[],
            CipherSuite::EcdheAes128GcmSha256,
            &[],
            &mut sh,
        )
        .unwrap();

        assert_eq!(
            client.handshake_message(&sh[..sh_len]),
            Err(Error::Protocol(AlertDescription::ProtocolVersion))
        );
    }

    #[test]
    fn unexpected_message_is_fatal() {
        let (_cert, verifier) = server_cert();
        let mut client = Engine::new(
            client_cfg(&verifier, &BOTH_13, &BOTH_GROUPS, None, false),
            rnd(1),
            HkdfSha256::default(),
        )
        .unwrap();
        client.start().unwrap();

        let mut fin = [0u8; 64];
        let fin_len = messages::encode_finished(&[0u8; 32], &mut fin).unwrap();
        assert_eq!(
            client.handshake_message(&fin[..fin_len]),
            Err(Error::Protocol(AlertDescription::UnexpectedMessage))
        );
        // The engine is poisoned afterwards.
        assert_eq!(
            client.handshake_message(&fin[..fin_len]),
            Err(Error::Protocol(AlertDescription::UnexpectedMessage))
        );
    }
}
