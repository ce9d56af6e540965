//! TLS record layer codec (RFC 8446 section 5, RFC 5246 section 6.2).
//!
//! Both protected-record constructions live here. TLS 1.3 wraps every
//! protected record as outer ApplicationData with the real content type
//! hidden inside the plaintext (plus optional zero padding); the nonce is
//! the per-direction IV XORed with the record sequence number. TLS 1.2
//! AES-GCM carries an explicit 8-byte nonce on the wire and authenticates
//! the true content type in the additional data.

use crate::error::Error;

/// TLS record content types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ContentType {
    ChangeCipherSpec = 20,
    Alert = 21,
    Handshake = 22,
    ApplicationData = 23,
}

impl ContentType {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            20 => Some(Self::ChangeCipherSpec),
            21 => Some(Self::Alert),
            22 => Some(Self::Handshake),
            23 => Some(Self::ApplicationData),
            _ => None,
        }
    }
}

/// TLS record header (5 bytes).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    pub content_type: ContentType,
    pub legacy_version: u16,
    pub length: u16,
}

/// TLS record header size.
pub const RECORD_HEADER_LEN: usize = 5;

/// Maximum record plaintext length (RFC 8446 section 5.1).
pub const MAX_PLAINTEXT: usize = 16384;

/// Maximum allowed ciphertext expansion over the plaintext limit.
pub const MAX_EXPANSION: usize = 256;

/// Maximum protected record payload length.
pub const MAX_RECORD_PAYLOAD: usize = MAX_PLAINTEXT + MAX_EXPANSION;

/// TLS 1.2 explicit nonce length for GCM suites (RFC 5288).
pub const TLS12_EXPLICIT_NONCE_LEN: usize = 8;

/// Encode a TLS record header.
pub fn encode_record_header(ct: ContentType, length: u16, buf: &mut [u8]) -> Result<usize, Error> {
    if buf.len() < RECORD_HEADER_LEN {
        return Err(Error::BufferTooSmall { needed: RECORD_HEADER_LEN });
    }
    buf[0] = ct as u8;
    buf[1] = 0x03;
    buf[2] = 0x03; // legacy_record_version = TLS 1.2
    buf[3] = (length >> 8) as u8;
    buf[4] = (length & 0xff) as u8;
    Ok(RECORD_HEADER_LEN)
}

/// Decode a TLS record header from exactly 5 bytes.
///
/// Enforces the payload ceiling here so oversized records are rejected
/// before any buffering happens.
pub fn decode_record_header(data: &[u8]) -> Result<RecordHeader, Error> {
    if data.len() < RECORD_HEADER_LEN {
        return Err(Error::BufferTooSmall { needed: RECORD_HEADER_LEN });
    }
    let content_type = ContentType::from_byte(data[0]).ok_or(Error::Framing)?;
    let legacy_version = ((data[1] as u16) << 8) | (data[2] as u16);
    let length = ((data[3] as u16) << 8) | (data[4] as u16);
    if length as usize > MAX_RECORD_PAYLOAD {
        return Err(Error::Protocol(crate::tls::alert::AlertDescription::RecordOverflow));
    }
    Ok(RecordHeader {
        content_type,
        legacy_version,
        length,
    })
}

/// Build a TLS 1.3 nonce: iv XOR padded sequence number (RFC 8446 section 5.3).
pub fn build_nonce(iv: &[u8; 12], seq: u64) -> [u8; 12] {
    let mut nonce = *iv;
    let seq_bytes = seq.to_be_bytes();
    // XOR the last 8 bytes of the IV with the sequence number
    for i in 0..8 {
        nonce[12 - 8 + i] ^= seq_bytes[i];
    }
    nonce
}

/// Build a TLS 1.2 GCM nonce: implicit IV (4 bytes) + explicit nonce (8 bytes).
pub fn build_tls12_nonce(implicit_iv: &[u8; 4], explicit: &[u8; 8]) -> [u8; 12] {
    let mut nonce = [0u8; 12];
    nonce[..4].copy_from_slice(implicit_iv);
    nonce[4..].copy_from_slice(explicit);
    nonce
}

/// Encrypt a TLS 1.3 record in-place.
///
/// `buf` layout: `[plaintext | content_type_byte | <space for tag>]`
/// - `payload_len` is the plaintext length (not including inner content type)
/// - The inner content type byte is written at `buf[payload_len]`
/// - After encryption: `buf[..payload_len + 1 + TAG_LEN]` contains ciphertext + tag
///
/// Returns total ciphertext length (payload + 1 inner CT + TAG_LEN).
pub fn seal_record<A: crate::crypto::Aead>(
    aead: &A,
    nonce: &[u8; 12],
    buf: &mut [u8],
    payload_len: usize,
    inner_content_type: ContentType,
) -> Result<usize, Error> {
    if payload_len > MAX_PLAINTEXT {
        return Err(Error::Framing);
    }
    // Write inner content type after plaintext
    let inner_len = payload_len + 1; // plaintext + inner CT byte
    if buf.len() < inner_len + A::TAG_LEN {
        return Err(Error::BufferTooSmall { needed: inner_len + A::TAG_LEN });
    }
    buf[payload_len] = inner_content_type as u8;

    // AAD is the record header for the outer record (content_type=ApplicationData)
    let outer_len = (inner_len + A::TAG_LEN) as u16;
    let aad = [
        ContentType::ApplicationData as u8,
        0x03, 0x03, // TLS 1.2
        (outer_len >> 8) as u8,
        (outer_len & 0xff) as u8,
    ];

    let ciphertext_len = aead.seal_in_place(nonce, &aad, buf, inner_len)?;
    Ok(ciphertext_len)
}

/// Decrypt a TLS 1.3 record in-place.
///
/// `buf[..ciphertext_len]` contains the encrypted record payload (including tag).
/// After decryption the padding is stripped by scanning backwards for the
/// inner content type, the last non-zero plaintext byte (RFC 8446 section 5.4).
///
/// Returns `(plaintext_len, inner_content_type)`.
pub fn open_record<A: crate::crypto::Aead>(
    aead: &A,
    nonce: &[u8; 12],
    buf: &mut [u8],
    ciphertext_len: usize,
    record_header_bytes: &[u8; 5],
) -> Result<(usize, ContentType), Error> {
    let plaintext_len = aead.open_in_place(nonce, record_header_bytes, buf, ciphertext_len)?;

    let mut inner_ct_pos = plaintext_len;
    while inner_ct_pos > 0 && buf[inner_ct_pos - 1] == 0 {
        inner_ct_pos -= 1;
    }
    if inner_ct_pos == 0 {
        // All-zero plaintext: no content type
        return Err(Error::Framing);
    }
    let inner_ct = ContentType::from_byte(buf[inner_ct_pos - 1]).ok_or(Error::Framing)?;
    let data_len = inner_ct_pos - 1;

    Ok((data_len, inner_ct))
}

/// TLS 1.2 GCM additional data: seq (8) + type (1) + version (2) + length (2)
/// (RFC 5246 section 6.2.3.3).
fn tls12_aad(seq: u64, content_type: ContentType, plaintext_len: usize) -> [u8; 13] {
    let mut aad = [0u8; 13];
    aad[..8].copy_from_slice(&seq.to_be_bytes());
    aad[8] = content_type as u8;
    aad[9] = 0x03;
    aad[10] = 0x03;
    aad[11] = (plaintext_len >> 8) as u8;
    aad[12] = (plaintext_len & 0xff) as u8;
    aad
}

/// Encrypt a TLS 1.2 GCM record in-place.
///
/// `buf` layout on entry: `[<8 bytes reserved> | plaintext | <space for tag>]`
/// with the plaintext starting at offset 8. The sequence number doubles as
/// the explicit nonce and is written into the reserved prefix.
///
/// Returns the total record payload length (8 + ciphertext + tag).
pub fn seal_record_tls12<A: crate::crypto::Aead>(
    aead: &A,
    implicit_iv: &[u8; 4],
    seq: u64,
    buf: &mut [u8],
    payload_len: usize,
    content_type: ContentType,
) -> Result<usize, Error> {
    if payload_len > MAX_PLAINTEXT {
        return Err(Error::Framing);
    }
    let total = TLS12_EXPLICIT_NONCE_LEN + payload_len + A::TAG_LEN;
    if buf.len() < total {
        return Err(Error::BufferTooSmall { needed: total });
    }

    let explicit = seq.to_be_bytes();
    buf[..8].copy_from_slice(&explicit);
    let nonce = build_tls12_nonce(implicit_iv, &explicit);
    let aad = tls12_aad(seq, content_type, payload_len);

    let ct_len = aead.seal_in_place(&nonce, &aad, &mut buf[8..], payload_len)?;
    Ok(TLS12_EXPLICIT_NONCE_LEN + ct_len)
}

/// Decrypt a TLS 1.2 GCM record in-place.
///
/// `buf[..payload_len]` is the record payload: explicit nonce followed by
/// ciphertext and tag. On success the plaintext sits at `buf[8..8 + len]`.
///
/// The record sequence number (not the explicit nonce) feeds the AAD, so a
/// peer replaying or reordering records fails authentication.
pub fn open_record_tls12<A: crate::crypto::Aead>(
    aead: &A,
    implicit_iv: &[u8; 4],
    seq: u64,
    buf: &mut [u8],
    payload_len: usize,
    content_type: ContentType,
) -> Result<usize, Error> {
    if payload_len < TLS12_EXPLICIT_NONCE_LEN + A::TAG_LEN {
        return Err(Error::Framing);
    }
    let mut explicit = [0u8; 8];
    explicit.copy_from_slice(&buf[..8]);
    let nonce = build_tls12_nonce(implicit_iv, &explicit);

    let ciphertext_len = payload_len - TLS12_EXPLICIT_NONCE_LEN;
    let plaintext_len = ciphertext_len - A::TAG_LEN;
    let aad = tls12_aad(seq, content_type, plaintext_len);

    aead.open_in_place(&nonce, &aad, &mut buf[8..], ciphertext_len)
}

/// Encrypt a TLS 1.2 ChaCha20-Poly1305 record in-place (RFC 7905).
///
/// No explicit nonce: the per-record nonce is the 12-byte write IV XORed
/// with the sequence number, same construction as TLS 1.3. The plaintext
/// starts at `buf[0]`.
pub fn seal_record_tls12_implicit<A: crate::crypto::Aead>(
    aead: &A,
    iv: &[u8; 12],
    seq: u64,
    buf: &mut [u8],
    payload_len: usize,
    content_type: ContentType,
) -> Result<usize, Error> {
    if payload_len > MAX_PLAINTEXT {
        return Err(Error::Framing);
    }
    let nonce = build_nonce(iv, seq);
    let aad = tls12_aad(seq, content_type, payload_len);
    aead.seal_in_place(&nonce, &aad, buf, payload_len)
}

/// Decrypt a TLS 1.2 ChaCha20-Poly1305 record in-place (RFC 7905).
pub fn open_record_tls12_implicit<A: crate::crypto::Aead>(
    aead: &A,
    iv: &[u8; 12],
    seq: u64,
    buf: &mut [u8],
    payload_len: usize,
    content_type: ContentType,
) -> Result<usize, Error> {
    if payload_len < A::TAG_LEN {
        return Err(Error::Framing);
    }
    let nonce = build_nonce(iv, seq);
    let plaintext_len = payload_len - A::TAG_LEN;
    let aad = tls12_aad(seq, content_type, plaintext_len);
    aead.open_in_place(&nonce, &aad, buf, payload_len)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_header_roundtrip() {
        let mut buf = [0u8; 16];
        let n = encode_record_header(ContentType::Handshake, 42, &mut buf).unwrap();
        assert_eq!(n, 5);
        let hdr = decode_record_header(&buf[..5]).unwrap();
        assert_eq!(hdr.content_type, ContentType::Handshake);
        assert_eq!(hdr.legacy_version, 0x0303);
        assert_eq!(hdr.length, 42);
    }

    #[test]
    fn nonce_construction() {
        let iv = [0u8; 12];
        let nonce = build_nonce(&iv, 0);
        assert_eq!(nonce, [0u8; 12]);

        let nonce1 = build_nonce(&iv, 1);
        assert_eq!(nonce1[11], 1);
        assert_eq!(nonce1[10], 0);

        let iv2 = [0xff; 12];
        let nonce2 = build_nonce(&iv2, 0);
        assert_eq!(nonce2, [0xff; 12]);
    }

    #[test]
    fn decode_invalid_content_type() {
        let data = [0xff, 0x03, 0x03, 0x00, 0x01];
        assert!(decode_record_header(&data).is_err());
    }

    #[test]
    fn decode_too_short() {
        let data = [0x17, 0x03, 0x03, 0x00];
        assert!(decode_record_header(&data).is_err());
    }

    #[test]
    fn decode_oversized_record() {
        let len = (MAX_RECORD_PAYLOAD + 1) as u16;
        let data = [0x17, 0x03, 0x03, (len >> 8) as u8, (len & 0xff) as u8];
        assert_eq!(
            decode_record_header(&data),
            Err(Error::Protocol(
                crate::tls::alert::AlertDescription::RecordOverflow
            ))
        );
    }

    #[cfg(feature = "rustcrypto-aes")]
    mod protected {
        use super::super::*;
        use crate::crypto::rustcrypto::Aes128GcmProvider;
        use crate::crypto::{Aead, CryptoProvider};

        fn aead() -> crate::crypto::rustcrypto::Aes128GcmAead {
            Aes128GcmProvider.aead(&[0x42; 16]).unwrap()
        }

        #[test]
        fn tls13_record_roundtrip() {
            let aead = aead();
            let iv = [0x11u8; 12];
            let plaintext = b"handshake bytes";

            let mut buf = [0u8; 256];
            buf[..plaintext.len()].copy_from_slice(plaintext);
            let nonce = build_nonce(&iv, 5);
            let ct_len = seal_record(
                &aead,
                &nonce,
                &mut buf,
                plaintext.len(),
                ContentType::Handshake,
            )
            .unwrap();
            assert_eq!(ct_len, plaintext.len() + 1 + 16);

            let mut header = [0u8; 5];
            encode_record_header(ContentType::ApplicationData, ct_len as u16, &mut header)
                .unwrap();
            let (pt_len, inner_ct) =
                open_record(&aead, &nonce, &mut buf, ct_len, &header).unwrap();
            assert_eq!(inner_ct, ContentType::Handshake);
            assert_eq!(&buf[..pt_len], plaintext);
        }

        #[test]
        fn tls13_padding_is_stripped() {
            let aead = aead();
            let iv = [0x11u8; 12];
            let plaintext = b"padded";

            // Manually build inner plaintext with trailing zero padding.
            let mut buf = [0u8; 256];
            buf[..plaintext.len()].copy_from_slice(plaintext);
            buf[plaintext.len()] = ContentType::ApplicationData as u8;
            let inner_len = plaintext.len() + 1 + 4; // 4 bytes of padding
            let nonce = build_nonce(&iv, 0);
            let outer_len = (inner_len + 16) as u16;
            let aad = [23u8, 0x03, 0x03, (outer_len >> 8) as u8, (outer_len & 0xff) as u8];
            let ct_len = aead.seal_in_place(&nonce, &aad, &mut buf, inner_len).unwrap();

            let mut header = [0u8; 5];
            encode_record_header(ContentType::ApplicationData, ct_len as u16, &mut header)
                .unwrap();
            let (pt_len, inner_ct) =
                open_record(&aead, &nonce, &mut buf, ct_len, &header).unwrap();
            assert_eq!(inner_ct, ContentType::ApplicationData);
            assert_eq!(&buf[..pt_len], plaintext);
        }

        #[test]
        fn tls13_all_zero_plaintext_rejected() {
            let aead = aead();
            let iv = [0x11u8; 12];
            let nonce = build_nonce(&iv, 0);

            // Inner plaintext of all zeros: no content type byte anywhere.
            let mut buf = [0u8; 64];
            let inner_len = 8;
            let outer_len = (inner_len + 16) as u16;
            let aad = [23u8, 0x03, 0x03, (outer_len >> 8) as u8, (outer_len & 0xff) as u8];
            let ct_len = aead.seal_in_place(&nonce, &aad, &mut buf, inner_len).unwrap();

            let mut header = [0u8; 5];
            encode_record_header(ContentType::ApplicationData, ct_len as u16, &mut header)
                .unwrap();
            assert_eq!(
                open_record(&aead, &nonce, &mut buf, ct_len, &header),
                Err(Error::Framing)
            );
        }

        #[test]
        fn tls12_record_roundtrip() {
            let aead = aead();
            let implicit_iv = [0xa0u8; 4];
            let plaintext = b"finished";

            let mut buf = [0u8; 256];
            buf[8..8 + plaintext.len()].copy_from_slice(plaintext);
            let total = seal_record_tls12(
                &aead,
                &implicit_iv,
                3,
                &mut buf,
                plaintext.len(),
                ContentType::Handshake,
            )
            .unwrap();
            assert_eq!(total, 8 + plaintext.len() + 16);
            // Explicit nonce carries the sequence number.
            assert_eq!(&buf[..8], &3u64.to_be_bytes());

            let pt_len = open_record_tls12(
                &aead,
                &implicit_iv,
                3,
                &mut buf,
                total,
                ContentType::Handshake,
            )
            .unwrap();
            assert_eq!(&buf[8..8 + pt_len], plaintext);
        }

        #[test]
        fn tls12_implicit_nonce_roundtrip() {
            let aead = aead();
            let iv = [0x5cu8; 12];
            let plaintext = b"no explicit nonce";

            let mut buf = [0u8; 256];
            buf[..plaintext.len()].copy_from_slice(plaintext);
            let total = seal_record_tls12_implicit(
                &aead,
                &iv,
                9,
                &mut buf,
                plaintext.len(),
                ContentType::ApplicationData,
            )
            .unwrap();
            assert_eq!(total, plaintext.len() + 16);

            let pt_len = open_record_tls12_implicit(
                &aead,
                &iv,
                9,
                &mut buf,
                total,
                ContentType::ApplicationData,
            )
            .unwrap();
            assert_eq!(&buf[..pt_len], plaintext);
        }

        #[test]
        fn tls12_wrong_seq_fails_auth() {
            let aead = aead();
            let implicit_iv = [0xa0u8; 4];
            let plaintext = b"finished";

            let mut buf = [0u8; 256];
            buf[8..8 + plaintext.len()].copy_from_slice(plaintext);
            let total = seal_record_tls12(
                &aead,
                &implicit_iv,
                3,
                &mut buf,
                plaintext.len(),
                ContentType::Handshake,
            )
            .unwrap();

            assert_eq!(
                open_record_tls12(
                    &aead,
                    &implicit_iv,
                    4,
                    &mut buf,
                    total,
                    ContentType::Handshake,
                ),
                Err(Error::Auth)
            );
        }
    }
}
