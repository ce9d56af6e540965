use crate::error::Error;

/// Authenticated Encryption with Associated Data.
///
/// Used for TLS record payload protection. TLS 1.3 mandates AEAD-only
/// suites; the legacy TLS 1.2 path here is likewise restricted to AEAD
/// (GCM / ChaCha20-Poly1305) — CBC and export suites are rejected outright.
pub trait Aead {
    /// Key length in bytes.
    const KEY_LEN: usize;
    /// Nonce length in bytes (always 12 for the supported suites).
    const NONCE_LEN: usize;
    /// Authentication tag length in bytes (always 16 for the supported suites).
    const TAG_LEN: usize;

    /// Encrypt in place.
    ///
    /// `buf[..payload_len]` contains the plaintext. The buffer must have
    /// room for the authentication tag (`buf.len() >= payload_len + TAG_LEN`).
    ///
    /// Returns the total length of ciphertext + tag.
    fn seal_in_place(
        &self,
        nonce: &[u8],
        aad: &[u8],
        buf: &mut [u8],
        payload_len: usize,
    ) -> Result<usize, Error>;

    /// Decrypt in place.
    ///
    /// `buf[..ciphertext_len]` contains ciphertext + authentication tag.
    /// Failure is always [`Error::Auth`].
    ///
    /// Returns the plaintext length on success.
    fn open_in_place(
        &self,
        nonce: &[u8],
        aad: &[u8],
        buf: &mut [u8],
        ciphertext_len: usize,
    ) -> Result<usize, Error>;
}
