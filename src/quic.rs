//! QUIC transport adapter for the handshake engine.
//!
//! QUIC replaces the TLS record layer entirely: the transport carries
//! handshake bytes in CRYPTO frames tagged with an encryption level and
//! applies traffic secrets to its own packet protection. This adapter
//! pumps the engine without any record framing. Feed ordered CRYPTO
//! stream bytes with [`QuicHandshake::handle_data`], drain typed events
//! with [`QuicHandshake::next_event`]; there are no callbacks.

use crate::crypto::{Hkdf, Level};
use crate::error::Error;
use crate::tls::engine::{
    Config, Direction, Engine, EngineRandom, HandshakeBuf, Output, RecordKeys, SessionInfo,
};
use crate::tls::messages;

/// Handshake-message reassembly capacity. CRYPTO frames arrive at
/// arbitrary boundaries; messages must be whole before the engine sees
/// them.
const REASSEMBLY: usize = 4096;

/// Typed events drained by the QUIC transport.
pub enum QuicEvent {
    /// Handshake bytes to carry in CRYPTO frames at `level`.
    /// `Level::Initial` maps to QUIC Initial packet protection.
    DataToSend { level: Level, data: HandshakeBuf },
    /// Traffic secrets for one direction are ready to install into
    /// packet protection.
    SecretsReady {
        direction: Direction,
        keys: RecordKeys,
    },
    /// The peer accepted our 0-RTT offer.
    EarlyDataAccepted,
    /// 0-RTT was offered but will not be used.
    EarlyDataRejected,
    /// Handshake complete.
    HandshakeDone(SessionInfo),
}

/// TLS handshake driven by an external QUIC transport.
pub struct QuicHandshake<'a, H: Hkdf + Default> {
    engine: Engine<'a, H>,
    events: heapless::Deque<QuicEvent, 16>,
    recv: heapless::Vec<u8, REASSEMBLY>,
}

impl<'a, H: Hkdf + Default> QuicHandshake<'a, H> {
    /// Create the handshake and queue the first flight (clients queue
    /// their ClientHello immediately).
    pub fn new(config: Config<'a>, random: EngineRandom, hkdf: H) -> Result<Self, Error> {
        let mut engine = Engine::new(config, random, hkdf)?;
        engine.start()?;
        let mut this = Self {
            engine,
            events: heapless::Deque::new(),
            recv: heapless::Vec::new(),
        };
        this.drain_outputs()?;
        Ok(this)
    }

    /// Feed ordered CRYPTO stream bytes received at `level`.
    ///
    /// The transport guarantees per-level ordering and delivers levels in
    /// handshake order, so one reassembly buffer suffices; the engine
    /// rejects messages arriving at a state they do not belong to.
    pub fn handle_data(&mut self, _level: Level, data: &[u8]) -> Result<(), Error> {
        if self.recv.len() + data.len() > REASSEMBLY {
            return Err(Error::BufferTooSmall {
                needed: self.recv.len() + data.len(),
            });
        }
        let _ = self.recv.extend_from_slice(data);
        loop {
            if self.recv.len() < 4 {
                return Ok(());
            }
            let (_, body_len) = messages::read_handshake_header(&self.recv)?;
            let msg_len = 4 + body_len;
            if msg_len > REASSEMBLY {
                return Err(Error::Framing);
            }
            if self.recv.len() < msg_len {
                return Ok(());
            }
            self.engine.handshake_message(&self.recv[..msg_len])?;
            self.recv.copy_within(msg_len.., 0);
            self.recv.truncate(self.recv.len() - msg_len);
            self.drain_outputs()?;
        }
    }

    /// Pull the next event for the transport to act on.
    pub fn next_event(&mut self) -> Option<QuicEvent> {
        self.events.pop_front()
    }

    pub fn is_complete(&self) -> bool {
        self.engine.is_connected()
    }

    fn drain_outputs(&mut self) -> Result<(), Error> {
        while let Some(output) = self.engine.poll_output() {
            let event = match output {
                Output::Send { level, data } => QuicEvent::DataToSend { level, data },
                // No record layer, no change_cipher_spec.
                Output::SendChangeCipherSpec => continue,
                Output::InstallKeys { direction, keys } => {
                    QuicEvent::SecretsReady { direction, keys }
                }
                Output::EarlyDataAccepted => QuicEvent::EarlyDataAccepted,
                Output::EarlyDataRejected => QuicEvent::EarlyDataRejected,
                Output::Connected(info) => QuicEvent::HandshakeDone(info),
            };
            self.events
                .push_back(event)
                .map_err(|_| Error::BufferTooSmall {
                    needed: self.events.len() + 1,
                })?;
        }
        Ok(())
    }
}

#[cfg(all(test, feature = "rustcrypto-aes"))]
mod tests {
    use std::boxed::Box;
    use std::vec::Vec;

    use super::*;
    use crate::crypto::rustcrypto::HkdfSha256;
    use crate::crypto::sign::{build_ed25519_cert_der, ed25519_public_key_from_seed};
    use crate::tls::engine::Role;
    use crate::crypto::kex::NamedGroup;
    use crate::tls::messages::CipherSuite;
    use crate::tls::verify::PinnedCertVerifier;
    use crate::tls::ProtocolVersion;

    const SIGNING_SEED: [u8; 32] = [0x42; 32];
    const NOW: u64 = 1_700_000_000;

    static SUITES: [CipherSuite; 1] = [CipherSuite::TlsAes128GcmSha256];
    static GROUPS: [NamedGroup; 1] = [NamedGroup::X25519];

    fn test_cert() -> (&'static [u8], &'static PinnedCertVerifier) {
        let pubkey = ed25519_public_key_from_seed(&SIGNING_SEED);
        let mut buf = [0u8; 512];
        let len = build_ed25519_cert_der(&pubkey, &mut buf).unwrap();
        let cert: &'static [u8] = buf[..len].to_vec().leak();
        let verifier = Box::leak(Box::new(PinnedCertVerifier::new(cert)));
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

    fn client(verifier: &'static PinnedCertVerifier) -> QuicHandshake<'static, HkdfSha256> {
        let config = Config {
            role: Role::Client,
            server_name: "test.local",
            alpn: &[],
            suites: &SUITES,
            groups: &GROUPS,
            cert_der: &[],
            signing_seed: None,
            verifier: Some(verifier),
            ticket_keys: None,
            tickets_to_send: 0,
            // QUIC is TLS 1.3 only.
            offer_tls12: false,
            now: NOW,
            resume: None,
            early_data: false,
            max_early_data: 0,
        };
        QuicHandshake::new(config, rnd(0xAA), HkdfSha256::default()).unwrap()
    }

    fn server(cert: &'static [u8]) -> QuicHandshake<'static, HkdfSha256> {
        let config = Config {
            role: Role::Server,
            server_name: "",
            alpn: &[],
            suites: &SUITES,
            groups: &GROUPS,
            cert_der: cert,
            signing_seed: Some(&SIGNING_SEED),
            verifier: None,
            ticket_keys: None,
            tickets_to_send: 0,
            offer_tls12: false,
            now: NOW,
            resume: None,
            early_data: false,
            max_early_data: 0,
        };
        QuicHandshake::new(config, rnd(0xCC), HkdfSha256::default()).unwrap()
    }

    #[derive(Default)]
    struct Side {
        secrets: Vec<(Direction, RecordKeys)>,
        done: Option<SessionInfo>,
    }

    impl Side {
        fn keys(&self, direction: Direction, level: Level) -> &RecordKeys {
            self.secrets
                .iter()
                .rev()
                .find(|(d, k)| *d == direction && k.level == level)
                .map(|(_, k)| k)
                .unwrap()
        }
    }

    fn pump(
        from: &mut QuicHandshake<'static, HkdfSha256>,
        to: &mut QuicHandshake<'static, HkdfSha256>,
        side: &mut Side,
    ) -> bool {
        let mut progress = false;
        while let Some(event) = from.next_event() {
            progress = true;
            match event {
                QuicEvent::DataToSend { level, data } => {
                    // Split the flight to exercise reassembly.
                    let mid = data.len() / 2;
                    to.handle_data(level, &data[..mid]).unwrap();
                    to.handle_data(level, &data[mid..]).unwrap();
                }
                QuicEvent::SecretsReady { direction, keys } => {
                    side.secrets.push((direction, keys));
                }
                QuicEvent::HandshakeDone(info) => side.done = Some(info),
                QuicEvent::EarlyDataAccepted | QuicEvent::EarlyDataRejected => {}
            }
        }
        progress
    }

    #[test]
    fn handshake_converges_without_records() {
        let (cert, verifier) = test_cert();
        let mut client = client(verifier);
        let mut server = server(cert);
        let mut client_side = Side::default();
        let mut server_side = Side::default();

        for _ in 0..10 {
            let a = pump(&mut client, &mut server, &mut client_side);
            let b = pump(&mut server, &mut client, &mut server_side);
            if !a && !b {
                break;
            }
        }

        assert!(client.is_complete());
        assert!(server.is_complete());
        let info = client_side.done.as_ref().unwrap();
        assert_eq!(info.version, ProtocolVersion::Tls13);
        assert_eq!(info.suite, CipherSuite::TlsAes128GcmSha256);

        for level in [Level::Handshake, Level::Application] {
            assert_eq!(
                client_side.keys(Direction::Write, level).secret,
                server_side.keys(Direction::Read, level).secret,
                "client write / server read secrets must match at {:?}",
                level,
            );
            assert_eq!(
                client_side.keys(Direction::Read, level).secret,
                server_side.keys(Direction::Write, level).secret,
            );
        }
    }
}
