//! Cryptographic traits and implementations for TLS record protection.
//!
//! The connection core needs AEAD for record encryption, HKDF/HMAC for the
//! key schedule, Diffie-Hellman key agreement for the handshake, and a
//! signature scheme for CertificateVerify. The [`CryptoProvider`] trait
//! bundles the per-suite symmetric primitives, allowing pluggable
//! implementations (software via RustCrypto, or hardware-accelerated);
//! key exchange and signing live in [`kex`] and [`sign`].

mod aead;
mod hkdf;
pub mod kex;
pub mod sign;

#[cfg(any(feature = "rustcrypto-chacha", feature = "rustcrypto-aes"))]
pub mod rustcrypto;

pub use aead::Aead;
pub use hkdf::Hkdf;

use crate::error::Error;

/// Encryption level — determines which keys protect a handshake byte range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    /// Plaintext (ClientHello/ServerHello flight).
    Initial,
    /// 0-RTT early application data.
    EarlyData,
    /// Handshake traffic keys.
    Handshake,
    /// 1-RTT application data.
    Application,
}

/// Bundle of symmetric primitives for one cipher suite.
pub trait CryptoProvider {
    type Aead: Aead;
    type Hkdf: Hkdf + Default;

    /// Create an AEAD instance from a key.
    fn aead(&self, key: &[u8]) -> Result<Self::Aead, Error>;

    /// Get an HKDF instance for key derivation.
    fn hkdf(&self) -> Self::Hkdf;
}
