//! TLS protocol internals: wire codecs, key schedule, handshake engine.

pub mod alert;
pub mod engine;
pub mod extensions;
pub mod key_schedule;
pub mod messages;
pub mod record;
#[cfg(feature = "rustcrypto-aes")]
pub mod ticket;
pub mod transcript;
pub mod verify;

/// Negotiated protocol version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolVersion {
    Tls12,
    Tls13,
}

impl ProtocolVersion {
    /// The version value carried in supported_versions.
    pub fn wire(self) -> u16 {
        match self {
            ProtocolVersion::Tls12 => 0x0303,
            ProtocolVersion::Tls13 => 0x0304,
        }
    }
}
