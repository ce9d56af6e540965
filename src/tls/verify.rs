//! Certificate verification seam.
//!
//! Chain building, revocation, and trust-store policy live outside this
//! crate. The engine hands the peer's leaf certificate to a
//! [`CertificateVerifier`] and gets back the Ed25519 public key to check
//! the handshake signature with.

use sha2::{Digest, Sha256};

use crate::crypto::sign::extract_ed25519_pubkey_from_cert;
use crate::error::Error;

/// Verifies a peer certificate and yields its signing key.
///
/// Implementations must be shareable across threads: the blocking stream
/// façade moves connections between the threads that drive them.
pub trait CertificateVerifier: Send + Sync {
    /// Check `cert_der` for the connection to `server_name` at unix time
    /// `now`, returning the Ed25519 public key embedded in it.
    ///
    /// Any rejection surfaces as [`Error::Certificate`].
    fn verify_cert(
        &self,
        cert_der: &[u8],
        server_name: &[u8],
        now: u64,
    ) -> Result<[u8; 32], Error>;
}

/// Accepts exactly one pinned certificate, matched by SHA-256 digest.
pub struct PinnedCertVerifier {
    digest: [u8; 32],
}

impl PinnedCertVerifier {
    /// Pin a certificate by its DER bytes.
    pub fn new(cert_der: &[u8]) -> Self {
        Self {
            digest: cert_digest(cert_der),
        }
    }

    /// Pin a certificate by a digest obtained earlier.
    pub fn from_digest(digest: [u8; 32]) -> Self {
        Self { digest }
    }
}

impl CertificateVerifier for PinnedCertVerifier {
    fn verify_cert(
        &self,
        cert_der: &[u8],
        _server_name: &[u8],
        _now: u64,
    ) -> Result<[u8; 32], Error> {
        if cert_digest(cert_der) != self.digest {
            return Err(Error::Certificate);
        }
        extract_ed25519_pubkey_from_cert(cert_der)
    }
}

/// Accepts any parsable certificate. Test harnesses only.
pub struct AcceptAnyCertVerifier;

impl CertificateVerifier for AcceptAnyCertVerifier {
    fn verify_cert(
        &self,
        cert_der: &[u8],
        _server_name: &[u8],
        _now: u64,
    ) -> Result<[u8; 32], Error> {
        extract_ed25519_pubkey_from_cert(cert_der)
    }
}

/// SHA-256 over the DER encoding.
pub fn cert_digest(cert_der: &[u8]) -> [u8; 32] {
    let mut h = Sha256::new();
    h.update(cert_der);
    let mut out = [0u8; 32];
    out.copy_from_slice(&h.finalize());
    out
}
