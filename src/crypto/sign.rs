//! Ed25519 signing and verification for handshake authentication.
//!
//! Provides helpers to:
//! - Build and sign the TLS 1.3 CertificateVerify content (RFC 8446 section 4.4.3)
//! - Sign and verify the TLS 1.2 ServerKeyExchange parameters (RFC 8422)
//! - Extract an Ed25519 public key from a minimal DER-encoded certificate
//! - Build a minimal self-signed DER certificate for testing and pinning

use crate::error::Error;

/// TLS signature algorithm code for Ed25519.
pub const ED25519_ALGORITHM: u16 = 0x0807;

/// Context string for server CertificateVerify (RFC 8446 section 4.4.3).
const SERVER_CONTEXT: &[u8] = b"TLS 1.3, server CertificateVerify";

/// Context string for client CertificateVerify (RFC 8446 section 4.4.3).
const CLIENT_CONTEXT: &[u8] = b"TLS 1.3, client CertificateVerify";

/// Which end of the connection produced a CertificateVerify.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignContext {
    Server,
    Client,
}

impl SignContext {
    fn bytes(self) -> &'static [u8] {
        match self {
            SignContext::Server => SERVER_CONTEXT,
            SignContext::Client => CLIENT_CONTEXT,
        }
    }
}

/// Build the content to be signed for CertificateVerify (RFC 8446 section 4.4.3).
///
/// The signed content is:
///   64 bytes of 0x20 (space) + context_string + 0x00 + transcript_hash
///
/// Returns the content in a fixed-size buffer and the length used.
pub fn build_certificate_verify_content(
    context: SignContext,
    transcript_hash: &[u8; 32],
) -> ([u8; 130], usize) {
    // 64 spaces + context (33 bytes) + 0x00 + 32 bytes hash = 130
    let ctx = context.bytes();
    let mut content = [0u8; 130];
    let mut off = 0;

    for item in content.iter_mut().take(64) {
        *item = 0x20;
    }
    off += 64;

    content[off..off + ctx.len()].copy_from_slice(ctx);
    off += ctx.len();

    content[off] = 0x00;
    off += 1;

    content[off..off + 32].copy_from_slice(transcript_hash);
    off += 32;

    (content, off)
}

/// Sign the CertificateVerify content using an Ed25519 private key.
///
/// `signing_key_bytes` must be the 32-byte Ed25519 seed (private key).
/// `transcript_hash` is the hash of the transcript up to and including
/// the Certificate message.
///
/// Returns the 64-byte Ed25519 signature.
pub fn sign_certificate_verify(
    signing_key_bytes: &[u8; 32],
    context: SignContext,
    transcript_hash: &[u8; 32],
) -> Result<[u8; 64], Error> {
    use ed25519_dalek::{Signer, SigningKey};

    let signing_key = SigningKey::from_bytes(signing_key_bytes);
    let (content, content_len) = build_certificate_verify_content(context, transcript_hash);

    let signature = signing_key.sign(&content[..content_len]);
    Ok(signature.to_bytes())
}

/// Verify a CertificateVerify signature using an Ed25519 public key.
pub fn verify_certificate_verify(
    public_key_bytes: &[u8; 32],
    context: SignContext,
    signature_bytes: &[u8],
    transcript_hash: &[u8; 32],
) -> Result<(), Error> {
    let (content, content_len) = build_certificate_verify_content(context, transcript_hash);
    verify_raw(public_key_bytes, signature_bytes, &content[..content_len])
}

/// Sign the TLS 1.2 ServerKeyExchange parameters (RFC 8422 section 5.4).
///
/// The signed content is client_random (32) + server_random (32) +
/// the ServerECDHParams bytes exactly as they appear on the wire.
pub fn sign_server_key_exchange(
    signing_key_bytes: &[u8; 32],
    client_random: &[u8; 32],
    server_random: &[u8; 32],
    params: &[u8],
) -> Result<[u8; 64], Error> {
    use ed25519_dalek::{Signer, SigningKey};

    if params.len() > 128 {
        return Err(Error::Framing);
    }
    let mut content = [0u8; 192];
    content[..32].copy_from_slice(client_random);
    content[32..64].copy_from_slice(server_random);
    content[64..64 + params.len()].copy_from_slice(params);

    let signing_key = SigningKey::from_bytes(signing_key_bytes);
    let signature = signing_key.sign(&content[..64 + params.len()]);
    Ok(signature.to_bytes())
}

/// Verify a TLS 1.2 ServerKeyExchange signature.
pub fn verify_server_key_exchange(
    public_key_bytes: &[u8; 32],
    client_random: &[u8; 32],
    server_random: &[u8; 32],
    params: &[u8],
    signature_bytes: &[u8],
) -> Result<(), Error> {
    if params.len() > 128 {
        return Err(Error::Framing);
    }
    let mut content = [0u8; 192];
    content[..32].copy_from_slice(client_random);
    content[32..64].copy_from_slice(server_random);
    content[64..64 + params.len()].copy_from_slice(params);

    verify_raw(public_key_bytes, signature_bytes, &content[..64 + params.len()])
}

fn verify_raw(
    public_key_bytes: &[u8; 32],
    signature_bytes: &[u8],
    content: &[u8],
) -> Result<(), Error> {
    use ed25519_dalek::{Signature, Verifier, VerifyingKey};

    let verifying_key = VerifyingKey::from_bytes(public_key_bytes).map_err(|_| Error::Crypto)?;

    if signature_bytes.len() != 64 {
        return Err(Error::Auth);
    }
    let mut sig_array = [0u8; 64];
    sig_array.copy_from_slice(signature_bytes);
    let signature = Signature::from_bytes(&sig_array);

    verifying_key
        .verify(content, &signature)
        .map_err(|_| Error::Auth)
}

/// Extract an Ed25519 public key from a DER-encoded certificate.
///
/// This does minimal ASN.1 parsing to find the SubjectPublicKeyInfo
/// containing an Ed25519 key (OID 1.3.101.112 = 06 03 2b 65 70).
///
/// Returns the 32-byte Ed25519 public key if found.
pub fn extract_ed25519_pubkey_from_cert(cert_der: &[u8]) -> Result<[u8; 32], Error> {
    // The Ed25519 OID in DER encoding: 06 03 2b 65 70
    let ed25519_oid: &[u8] = &[0x06, 0x03, 0x2b, 0x65, 0x70];

    if let Some(oid_pos) = find_subsequence(cert_der, ed25519_oid) {
        // The SubjectPublicKeyInfo structure is:
        //   SEQUENCE {
        //     SEQUENCE { OID (ed25519) }
        //     BIT STRING (0x00 padding byte + 32-byte key)
        //   }
        let after_oid = oid_pos + ed25519_oid.len();

        // Search for the BIT STRING tag after the OID
        for i in after_oid..cert_der.len().saturating_sub(34) {
            if cert_der[i] == 0x03 {
                let len_byte = cert_der.get(i + 1).ok_or(Error::Certificate)?;
                let bit_string_len = *len_byte as usize;

                // Ed25519 public key BIT STRING: length should be 33
                // (1 byte unused-bits count + 32 bytes key)
                if bit_string_len == 33 {
                    let padding = cert_der.get(i + 2).ok_or(Error::Certificate)?;
                    if *padding != 0x00 {
                        return Err(Error::Certificate);
                    }

                    let key_start = i + 3;
                    let key_end = key_start + 32;
                    if key_end > cert_der.len() {
                        return Err(Error::Certificate);
                    }

                    let mut pubkey = [0u8; 32];
                    pubkey.copy_from_slice(&cert_der[key_start..key_end]);
                    return Ok(pubkey);
                }
            }
        }
    }

    Err(Error::Certificate)
}

/// Derive the Ed25519 public key from a 32-byte private key seed.
pub fn ed25519_public_key_from_seed(seed: &[u8; 32]) -> [u8; 32] {
    let signing_key = ed25519_dalek::SigningKey::from_bytes(seed);
    signing_key.verifying_key().to_bytes()
}

/// Build a minimal self-signed DER certificate containing an Ed25519 public key.
///
/// This creates a minimal X.509v3-like structure sufficient for the pinned
/// verifier and for tests. It contains the SubjectPublicKeyInfo with the
/// Ed25519 OID and the 32-byte public key.
///
/// Returns the length of the DER bytes written to `out`.
pub fn build_ed25519_cert_der(public_key: &[u8; 32], out: &mut [u8]) -> Result<usize, Error> {
    // Pre-built DER template for a minimal Ed25519 certificate:
    // SEQUENCE (Certificate) {
    //   SEQUENCE (TBSCertificate) {
    //     [0] EXPLICIT INTEGER (version = v3)
    //     INTEGER (serialNumber = 1)
    //     SEQUENCE (signature algorithm = Ed25519)
    //     SEQUENCE (issuer = CN=milli-tls)
    //     SEQUENCE (validity)
    //     SEQUENCE (subject = CN=milli-tls)
    //     SEQUENCE (SubjectPublicKeyInfo)
    //   }
    //   SEQUENCE (signatureAlgorithm = Ed25519)
    //   BIT STRING (signature - placeholder)
    // }
    #[rustfmt::skip]
    let template: &[u8] = &[
        // SEQUENCE (Certificate)
        0x30, 0x81, 0xd4,
          // SEQUENCE (TBSCertificate)
          0x30, 0x81, 0x87,
            // [0] EXPLICIT INTEGER v3 (2)
            0xa0, 0x03, 0x02, 0x01, 0x02,
            // INTEGER serialNumber = 1
            0x02, 0x01, 0x01,
            // SEQUENCE (signature algorithm OID = Ed25519)
            0x30, 0x05, 0x06, 0x03, 0x2b, 0x65, 0x70,
            // SEQUENCE (issuer: CN=milli-tls)
            0x30, 0x14,
              0x31, 0x12, 0x30, 0x10,
                0x06, 0x03, 0x55, 0x04, 0x03,  // OID 2.5.4.3 (CN)
                0x0c, 0x09,                     // UTF8String length 9
                b'm', b'i', b'l', b'l', b'i', b'-', b't', b'l', b's',
            // SEQUENCE (validity)
            0x30, 0x1e,
              // UTCTime "250101000000Z"
              0x17, 0x0d, b'2', b'5', b'0', b'1', b'0', b'1', b'0', b'0', b'0', b'0', b'0', b'0', b'Z',
              // UTCTime "350101000000Z"
              0x17, 0x0d, b'3', b'5', b'0', b'1', b'0', b'1', b'0', b'0', b'0', b'0', b'0', b'0', b'Z',
            // SEQUENCE (subject: CN=milli-tls) - same as issuer
            0x30, 0x14,
              0x31, 0x12, 0x30, 0x10,
                0x06, 0x03, 0x55, 0x04, 0x03,
                0x0c, 0x09,
                b'm', b'i', b'l', b'l', b'i', b'-', b't', b'l', b's',
            // SEQUENCE (SubjectPublicKeyInfo)
            0x30, 0x2a,
              // SEQUENCE { OID 1.3.101.112 }
              0x30, 0x05, 0x06, 0x03, 0x2b, 0x65, 0x70,
              // BIT STRING: 0x00 padding + 32 bytes public key
              0x03, 0x21, 0x00,
              // 32 bytes of public key placeholder (will be replaced)
              0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
              0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
              0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
              0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
          // SEQUENCE (signatureAlgorithm = Ed25519)
          0x30, 0x05, 0x06, 0x03, 0x2b, 0x65, 0x70,
          // BIT STRING (signature - 64 bytes + 1 padding byte)
          0x03, 0x41, 0x00,
          // 64 bytes of placeholder signature
          0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
          0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
          0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
          0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
          0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
          0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
          0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
          0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    ];

    let total = template.len();
    if out.len() < total {
        return Err(Error::BufferTooSmall { needed: total });
    }

    out[..total].copy_from_slice(template);

    // The public key slot sits after the BIT STRING header 0x03 0x21 0x00
    // inside the SubjectPublicKeyInfo section.
    let pubkey_offset = find_subsequence(&out[..total], &[0x03, 0x21, 0x00])
        .ok_or(Error::Certificate)? + 3;
    out[pubkey_offset..pubkey_offset + 32].copy_from_slice(public_key);

    Ok(total)
}

/// Find the first occurrence of `needle` in `haystack`.
fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || needle.len() > haystack.len() {
        return None;
    }
    (0..=(haystack.len() - needle.len())).find(|&i| haystack[i..i + needle.len()] == *needle)
}
