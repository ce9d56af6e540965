//! RustCrypto-backed implementations of the TLS crypto traits.

use crate::crypto::{Aead as AeadTrait, CryptoProvider, Hkdf as HkdfTrait};
use crate::error::Error;

// ---- HKDF-SHA256 ----

/// HKDF using SHA-256 (via the `hkdf` crate).
#[derive(Default)]
pub struct HkdfSha256;

impl HkdfTrait for HkdfSha256 {
    const HASH_LEN: usize = 32;

    fn extract(&self, salt: &[u8], ikm: &[u8], prk: &mut [u8]) {
        let (out, _) = hkdf::Hkdf::<sha2::Sha256>::extract(Some(salt), ikm);
        prk[..32].copy_from_slice(&out);
    }

    fn expand(&self, prk: &[u8], info: &[u8], okm: &mut [u8]) -> Result<(), Error> {
        let hk = hkdf::Hkdf::<sha2::Sha256>::from_prk(prk).map_err(|_| Error::Crypto)?;
        hk.expand(info, okm).map_err(|_| Error::Crypto)
    }
}

// ---- AES-128-GCM AEAD ----

#[cfg(feature = "rustcrypto-aes")]
/// AES-128-GCM AEAD implementation.
pub struct Aes128GcmAead {
    cipher: aes_gcm::Aes128Gcm,
}

#[cfg(feature = "rustcrypto-aes")]
impl AeadTrait for Aes128GcmAead {
    const KEY_LEN: usize = 16;
    const NONCE_LEN: usize = 12;
    const TAG_LEN: usize = 16;

    fn seal_in_place(
        &self,
        nonce: &[u8],
        aad: &[u8],
        buf: &mut [u8],
        payload_len: usize,
    ) -> Result<usize, Error> {
        use aes_gcm::aead::AeadInPlace;
        use aes_gcm::Nonce;

        if nonce.len() != 12 {
            return Err(Error::Crypto);
        }
        let total = payload_len + Self::TAG_LEN;
        if buf.len() < total {
            return Err(Error::BufferTooSmall { needed: total });
        }

        let nonce = Nonce::from_slice(nonce);
        let tag = self
            .cipher
            .encrypt_in_place_detached(nonce, aad, &mut buf[..payload_len])
            .map_err(|_| Error::Crypto)?;
        buf[payload_len..total].copy_from_slice(&tag);
        Ok(total)
    }

    fn open_in_place(
        &self,
        nonce: &[u8],
        aad: &[u8],
        buf: &mut [u8],
        ciphertext_len: usize,
    ) -> Result<usize, Error> {
        use aes_gcm::aead::AeadInPlace;
        use aes_gcm::{Nonce, Tag};

        if nonce.len() != 12 {
            return Err(Error::Crypto);
        }
        if ciphertext_len < Self::TAG_LEN {
            return Err(Error::Auth);
        }
        let plaintext_len = ciphertext_len - Self::TAG_LEN;
        let mut tag_bytes = [0u8; 16];
        tag_bytes.copy_from_slice(&buf[plaintext_len..ciphertext_len]);
        let tag = Tag::from(tag_bytes);
        self.cipher
            .decrypt_in_place_detached(
                Nonce::from_slice(nonce),
                aad,
                &mut buf[..plaintext_len],
                &tag,
            )
            .map_err(|_| Error::Auth)?;
        Ok(plaintext_len)
    }
}

// ---- AES-256-GCM AEAD (session ticket sealing) ----

#[cfg(feature = "rustcrypto-aes")]
/// AES-256-GCM AEAD implementation. Used for server-side ticket encryption.
pub struct Aes256GcmAead {
    cipher: aes_gcm::Aes256Gcm,
}

#[cfg(feature = "rustcrypto-aes")]
impl Aes256GcmAead {
    pub fn new(key: &[u8; 32]) -> Self {
        use aes_gcm::KeyInit;
        Self {
            cipher: aes_gcm::Aes256Gcm::new(key.into()),
        }
    }
}

#[cfg(feature = "rustcrypto-aes")]
impl AeadTrait for Aes256GcmAead {
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
        use aes_gcm::aead::AeadInPlace;
        use aes_gcm::Nonce;

        if nonce.len() != 12 {
            return Err(Error::Crypto);
        }
        let total = payload_len + Self::TAG_LEN;
        if buf.len() < total {
            return Err(Error::BufferTooSmall { needed: total });
        }

        let nonce = Nonce::from_slice(nonce);
        let tag = self
            .cipher
            .encrypt_in_place_detached(nonce, aad, &mut buf[..payload_len])
            .map_err(|_| Error::Crypto)?;
        buf[payload_len..total].copy_from_slice(&tag);
        Ok(total)
    }

    fn open_in_place(
        &self,
        nonce: &[u8],
        aad: &[u8],
        buf: &mut [u8],
        ciphertext_len: usize,
    ) -> Result<usize, Error> {
        use aes_gcm::aead::AeadInPlace;
        use aes_gcm::{Nonce, Tag};

        if nonce.len() != 12 {
            return Err(Error::Crypto);
        }
        if ciphertext_len < Self::TAG_LEN {
            return Err(Error::Auth);
        }
        let plaintext_len = ciphertext_len - Self::TAG_LEN;
        let mut tag_bytes = [0u8; 16];
        tag_bytes.copy_from_slice(&buf[plaintext_len..ciphertext_len]);
        let tag = Tag::from(tag_bytes);
        self.cipher
            .decrypt_in_place_detached(
                Nonce::from_slice(nonce),
                aad,
                &mut buf[..plaintext_len],
                &tag,
            )
            .map_err(|_| Error::Auth)?;
        Ok(plaintext_len)
    }
}

// ---- ChaCha20-Poly1305 AEAD ----

#[cfg(feature = "rustcrypto-chacha")]
/// ChaCha20-Poly1305 AEAD implementation.
pub struct ChaCha20Poly1305Aead {
    cipher: chacha20poly1305::ChaCha20Poly1305,
}

#[cfg(feature = "rustcrypto-chacha")]
impl AeadTrait for ChaCha20Poly1305Aead {
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
        use chacha20poly1305::aead::AeadInPlace;

        if nonce.len() != 12 {
            return Err(Error::Crypto);
        }
        let total = payload_len + Self::TAG_LEN;
        if buf.len() < total {
            return Err(Error::BufferTooSmall { needed: total });
        }

        let nonce = chacha20poly1305::Nonce::from_slice(nonce);
        let tag = self
            .cipher
            .encrypt_in_place_detached(nonce, aad, &mut buf[..payload_len])
            .map_err(|_| Error::Crypto)?;
        buf[payload_len..total].copy_from_slice(&tag);
        Ok(total)
    }

    fn open_in_place(
        &self,
        nonce: &[u8],
        aad: &[u8],
        buf: &mut [u8],
        ciphertext_len: usize,
    ) -> Result<usize, Error> {
        use chacha20poly1305::aead::AeadInPlace;

        if nonce.len() != 12 {
            return Err(Error::Crypto);
        }
        if ciphertext_len < Self::TAG_LEN {
            return Err(Error::Auth);
        }
        let plaintext_len = ciphertext_len - Self::TAG_LEN;
        let mut tag_bytes = [0u8; 16];
        tag_bytes.copy_from_slice(&buf[plaintext_len..ciphertext_len]);
        let tag = chacha20poly1305::Tag::from(tag_bytes);
        self.cipher
            .decrypt_in_place_detached(
                chacha20poly1305::Nonce::from_slice(nonce),
                aad,
                &mut buf[..plaintext_len],
                &tag,
            )
            .map_err(|_| Error::Auth)?;
        Ok(plaintext_len)
    }
}

// ---- CryptoProvider bundles ----

#[cfg(feature = "rustcrypto-aes")]
/// AES-128-GCM cipher suite provider.
pub struct Aes128GcmProvider;

#[cfg(feature = "rustcrypto-aes")]
impl CryptoProvider for Aes128GcmProvider {
    type Aead = Aes128GcmAead;
    type Hkdf = HkdfSha256;

    fn aead(&self, key: &[u8]) -> Result<Self::Aead, Error> {
        use aes_gcm::KeyInit;
        if key.len() != Aes128GcmAead::KEY_LEN {
            return Err(Error::Crypto);
        }
        let cipher = aes_gcm::Aes128Gcm::new_from_slice(key).map_err(|_| Error::Crypto)?;
        Ok(Aes128GcmAead { cipher })
    }

    fn hkdf(&self) -> Self::Hkdf {
        HkdfSha256
    }
}

#[cfg(feature = "rustcrypto-chacha")]
/// ChaCha20-Poly1305 cipher suite provider.
pub struct ChaCha20Provider;

#[cfg(feature = "rustcrypto-chacha")]
impl CryptoProvider for ChaCha20Provider {
    type Aead = ChaCha20Poly1305Aead;
    type Hkdf = HkdfSha256;

    fn aead(&self, key: &[u8]) -> Result<Self::Aead, Error> {
        use chacha20poly1305::KeyInit;
        if key.len() != ChaCha20Poly1305Aead::KEY_LEN {
            return Err(Error::Crypto);
        }
        let cipher =
            chacha20poly1305::ChaCha20Poly1305::new_from_slice(key).map_err(|_| Error::Crypto)?;
        Ok(ChaCha20Poly1305Aead { cipher })
    }

    fn hkdf(&self) -> Self::Hkdf {
        HkdfSha256
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ---- AEAD roundtrip tests ----

    #[cfg(feature = "rustcrypto-aes")]
    #[test]
    fn aes128gcm_roundtrip() {
        let key = [0x42u8; 16];
        let provider = Aes128GcmProvider;
        let aead = provider.aead(&key).unwrap();
        let nonce = [0u8; 12];
        let aad = b"associated data";
        let plaintext = b"hello world";

        let mut buf = [0u8; 128];
        buf[..plaintext.len()].copy_from_slice(plaintext);

        let ct_len = aead
            .seal_in_place(&nonce, aad, &mut buf, plaintext.len())
            .unwrap();
        assert_eq!(ct_len, plaintext.len() + 16);

        let pt_len = aead.open_in_place(&nonce, aad, &mut buf, ct_len).unwrap();
        assert_eq!(pt_len, plaintext.len());
        assert_eq!(&buf[..pt_len], plaintext);
    }

    #[cfg(feature = "rustcrypto-aes")]
    #[test]
    fn aes128gcm_auth_failure() {
        let key = [0x42u8; 16];
        let provider = Aes128GcmProvider;
        let aead = provider.aead(&key).unwrap();
        let nonce = [0u8; 12];
        let aad = b"aad";
        let plaintext = b"secret";

        let mut buf = [0u8; 128];
        buf[..plaintext.len()].copy_from_slice(plaintext);

        let ct_len = aead
            .seal_in_place(&nonce, aad, &mut buf, plaintext.len())
            .unwrap();

        // Tamper with ciphertext
        buf[0] ^= 0xff;

        assert_eq!(
            aead.open_in_place(&nonce, aad, &mut buf, ct_len),
            Err(Error::Auth)
        );
    }

    #[cfg(feature = "rustcrypto-chacha")]
    #[test]
    fn chacha20poly1305_roundtrip() {
        let key = [0x42u8; 32];
        let provider = ChaCha20Provider;
        let aead = provider.aead(&key).unwrap();
        let nonce = [0u8; 12];
        let aad = b"associated data";
        let plaintext = b"hello chacha";

        let mut buf = [0u8; 128];
        buf[..plaintext.len()].copy_from_slice(plaintext);

        let ct_len = aead
            .seal_in_place(&nonce, aad, &mut buf, plaintext.len())
            .unwrap();
        assert_eq!(ct_len, plaintext.len() + 16);

        let pt_len = aead.open_in_place(&nonce, aad, &mut buf, ct_len).unwrap();
        assert_eq!(pt_len, plaintext.len());
        assert_eq!(&buf[..pt_len], plaintext);
    }

    #[cfg(feature = "rustcrypto-chacha")]
    #[test]
    fn chacha20poly1305_auth_failure() {
        let key = [0x42u8; 32];
        let provider = ChaCha20Provider;
        let aead = provider.aead(&key).unwrap();
        let nonce = [0u8; 12];
        let aad = b"aad";
        let plaintext = b"secret";

        let mut buf = [0u8; 128];
        buf[..plaintext.len()].copy_from_slice(plaintext);

        let ct_len = aead
            .seal_in_place(&nonce, aad, &mut buf, plaintext.len())
            .unwrap();

        buf[0] ^= 0xff;

        assert_eq!(
            aead.open_in_place(&nonce, aad, &mut buf, ct_len),
            Err(Error::Auth)
        );
    }

    #[cfg(feature = "rustcrypto-aes")]
    #[test]
    fn aes256gcm_roundtrip() {
        let aead = Aes256GcmAead::new(&[0x33u8; 32]);
        let nonce = [7u8; 12];
        let aad = b"ticket";
        let plaintext = b"resumption state";

        let mut buf = [0u8; 128];
        buf[..plaintext.len()].copy_from_slice(plaintext);

        let ct_len = aead
            .seal_in_place(&nonce, aad, &mut buf, plaintext.len())
            .unwrap();
        let pt_len = aead.open_in_place(&nonce, aad, &mut buf, ct_len).unwrap();
        assert_eq!(&buf[..pt_len], plaintext);
    }

    // ---- Key length constants ----

    #[cfg(feature = "rustcrypto-aes")]
    #[test]
    fn aes128gcm_constants() {
        assert_eq!(Aes128GcmAead::KEY_LEN, 16);
        assert_eq!(Aes128GcmAead::NONCE_LEN, 12);
        assert_eq!(Aes128GcmAead::TAG_LEN, 16);
    }

    #[cfg(feature = "rustcrypto-chacha")]
    #[test]
    fn chacha20poly1305_constants() {
        assert_eq!(ChaCha20Poly1305Aead::KEY_LEN, 32);
        assert_eq!(ChaCha20Poly1305Aead::NONCE_LEN, 12);
        assert_eq!(ChaCha20Poly1305Aead::TAG_LEN, 16);
    }
}
