//! Handshake message encoding and decoding.
//!
//! Handshake message format (shared by both protocol versions):
//!   HandshakeType (1 byte)
//!   Length (3 bytes, big-endian)
//!   Body (Length bytes)

use crate::error::Error;
use crate::tls::ProtocolVersion;

/// TLS handshake message types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum HandshakeType {
    ClientHello = 1,
    ServerHello = 2,
    NewSessionTicket = 4,
    EndOfEarlyData = 5,
    EncryptedExtensions = 8,
    Certificate = 11,
    ServerKeyExchange = 12,
    ServerHelloDone = 14,
    CertificateVerify = 15,
    ClientKeyExchange = 16,
    Finished = 20,
    KeyUpdate = 24,
}

impl HandshakeType {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(Self::ClientHello),
            2 => Some(Self::ServerHello),
            4 => Some(Self::NewSessionTicket),
            5 => Some(Self::EndOfEarlyData),
            8 => Some(Self::EncryptedExtensions),
            11 => Some(Self::Certificate),
            12 => Some(Self::ServerKeyExchange),
            14 => Some(Self::ServerHelloDone),
            15 => Some(Self::CertificateVerify),
            16 => Some(Self::ClientKeyExchange),
            20 => Some(Self::Finished),
            24 => Some(Self::KeyUpdate),
            _ => None,
        }
    }
}

/// The special ServerHello.random value signalling HelloRetryRequest
/// (RFC 8446 section 4.1.3).
pub const HELLO_RETRY_REQUEST_RANDOM: [u8; 32] = [
    0xcf, 0x21, 0xad, 0x74, 0xe5, 0x9a, 0x61, 0x11, 0xbe, 0x1d, 0x8c, 0x02, 0x1e, 0x65, 0xb8,
    0x91, 0xc2, 0xa2, 0x11, 0x16, 0x7a, 0xbb, 0x8c, 0x5e, 0x07, 0x9e, 0x09, 0xe2, 0xc8, 0xa8,
    0x33, 0x9c,
];

/// Cipher suites this crate supports. All are AEAD-with-SHA256 suites;
/// the TLS 1.2 entries pair ECDHE key exchange with Ed25519/ECDSA
/// certificate signatures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherSuite {
    /// TLS_AES_128_GCM_SHA256 (TLS 1.3)
    TlsAes128GcmSha256,
    /// TLS_CHACHA20_POLY1305_SHA256 (TLS 1.3)
    TlsChacha20Poly1305Sha256,
    /// TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256 (TLS 1.2)
    EcdheAes128GcmSha256,
    /// TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305_SHA256 (TLS 1.2)
    EcdheChacha20Poly1305Sha256,
}

impl CipherSuite {
    pub fn to_u16(self) -> u16 {
        match self {
            Self::TlsAes128GcmSha256 => 0x1301,
            Self::TlsChacha20Poly1305Sha256 => 0x1303,
            Self::EcdheAes128GcmSha256 => 0xc02b,
            Self::EcdheChacha20Poly1305Sha256 => 0xcca9,
        }
    }

    pub fn from_u16(v: u16) -> Option<Self> {
        match v {
            0x1301 => Some(Self::TlsAes128GcmSha256),
            0x1303 => Some(Self::TlsChacha20Poly1305Sha256),
            0xc02b => Some(Self::EcdheAes128GcmSha256),
            0xcca9 => Some(Self::EcdheChacha20Poly1305Sha256),
            _ => None,
        }
    }

    /// The protocol version this suite belongs to. TLS 1.3 suites never
    /// negotiate with a TLS 1.2 ServerHello and vice versa.
    pub fn version(self) -> ProtocolVersion {
        match self {
            Self::TlsAes128GcmSha256 | Self::TlsChacha20Poly1305Sha256 => ProtocolVersion::Tls13,
            Self::EcdheAes128GcmSha256 | Self::EcdheChacha20Poly1305Sha256 => {
                ProtocolVersion::Tls12
            }
        }
    }

    /// AEAD key length in bytes.
    pub fn key_len(self) -> usize {
        match self {
            Self::TlsAes128GcmSha256 | Self::EcdheAes128GcmSha256 => 16,
            Self::TlsChacha20Poly1305Sha256 | Self::EcdheChacha20Poly1305Sha256 => 32,
        }
    }

    /// Implicit IV length from the key block. TLS 1.2 GCM carries a 4-byte
    /// salt plus an explicit 8-byte record nonce (RFC 5288); TLS 1.2
    /// ChaCha20-Poly1305 uses a full 12-byte IV XORed with the sequence
    /// number and no explicit nonce (RFC 7905). TLS 1.3 is always 12.
    pub fn fixed_iv_len(self) -> usize {
        match self {
            Self::EcdheAes128GcmSha256 => 4,
            _ => 12,
        }
    }

    /// Whether records under this suite carry an explicit 8-byte nonce.
    pub fn explicit_nonce(self) -> bool {
        self == Self::EcdheAes128GcmSha256
    }
}

/// Parsed ClientHello message.
pub struct ClientHello<'a> {
    pub random: &'a [u8; 32],
    pub session_id: &'a [u8],
    pub cipher_suites: &'a [u8],
    pub extensions: &'a [u8],
}

/// Parsed ServerHello message.
pub struct ServerHello<'a> {
    pub random: &'a [u8; 32],
    pub session_id: &'a [u8],
    pub cipher_suite: CipherSuite,
    pub extensions: &'a [u8],
}

impl ServerHello<'_> {
    /// Whether this ServerHello is actually a HelloRetryRequest.
    pub fn is_hello_retry_request(&self) -> bool {
        *self.random == HELLO_RETRY_REQUEST_RANDOM
    }
}

/// Parsed Certificate message.
pub struct CertificatePayload<'a> {
    /// The certificate request context (usually empty for server certs).
    pub context: &'a [u8],
    /// Raw certificate entries data (list of CertificateEntry).
    pub entries: &'a [u8],
}

/// A single certificate entry from the Certificate message.
pub struct CertificateEntry<'a> {
    /// DER-encoded certificate data.
    pub cert_data: &'a [u8],
    /// Extensions (usually empty).
    pub extensions: &'a [u8],
}

/// Parsed CertificateVerify message.
pub struct CertificateVerify<'a> {
    pub algorithm: u16,
    pub signature: &'a [u8],
}

/// Parsed NewSessionTicket message (TLS 1.3).
pub struct NewSessionTicket<'a> {
    pub lifetime: u32,
    pub age_add: u32,
    pub nonce: &'a [u8],
    pub ticket: &'a [u8],
    /// max_early_data_size from the early_data extension, if present.
    pub max_early_data: Option<u32>,
}

/// Parsed TLS 1.2 ServerKeyExchange message (ECDHE, named curve).
pub struct ServerKeyExchange<'a> {
    pub group: u16,
    pub public_key: &'a [u8],
    pub algorithm: u16,
    pub signature: &'a [u8],
    /// The raw ServerECDHParams bytes the signature covers.
    pub params: &'a [u8],
}

/// KeyUpdate request field (RFC 8446 section 4.6.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum KeyUpdateRequest {
    UpdateNotRequested = 0,
    UpdateRequested = 1,
}

/// Write the 4-byte handshake header (type + 3-byte length).
fn write_handshake_header(
    msg_type: HandshakeType,
    body_len: usize,
    out: &mut [u8],
) -> Result<(), Error> {
    if out.len() < 4 {
        return Err(Error::BufferTooSmall { needed: 4 });
    }
    out[0] = msg_type as u8;
    let len = body_len as u32;
    out[1] = ((len >> 16) & 0xFF) as u8;
    out[2] = ((len >> 8) & 0xFF) as u8;
    out[3] = (len & 0xFF) as u8;
    Ok(())
}

/// Read the handshake header: returns (type_byte, body_length).
pub fn read_handshake_header(data: &[u8]) -> Result<(u8, usize), Error> {
    if data.len() < 4 {
        return Err(Error::Framing);
    }
    let msg_type = data[0];
    let length = ((data[1] as usize) << 16) | ((data[2] as usize) << 8) | (data[3] as usize);
    Ok((msg_type, length))
}

/// Encode a ClientHello message.
///
/// Format:
///   - ProtocolVersion: 0x0303 (TLS 1.2 for compatibility)
///   - Random: 32 bytes
///   - SessionID: length-prefixed (1 byte length)
///   - CipherSuites: length-prefixed (2 byte length)
///   - CompressionMethods: length-prefixed (1 byte length, always [0])
///   - Extensions: length-prefixed (2 byte length)
pub fn encode_client_hello(
    random: &[u8; 32],
    session_id: &[u8],
    cipher_suites: &[CipherSuite],
    extensions_buf: &[u8],
    out: &mut [u8],
) -> Result<usize, Error> {
    let cs_len = cipher_suites.len() * 2;
    let body_len = 2 + 32 + 1 + session_id.len() + 2 + cs_len + 2 + 2 + extensions_buf.len();
    let total = 4 + body_len;

    if out.len() < total {
        return Err(Error::BufferTooSmall { needed: total });
    }

    write_handshake_header(HandshakeType::ClientHello, body_len, out)?;
    let mut off = 4;

    // ProtocolVersion: legacy TLS 1.2
    out[off] = 0x03;
    out[off + 1] = 0x03;
    off += 2;

    out[off..off + 32].copy_from_slice(random);
    off += 32;

    out[off] = session_id.len() as u8;
    off += 1;
    if !session_id.is_empty() {
        out[off..off + session_id.len()].copy_from_slice(session_id);
        off += session_id.len();
    }

    out[off] = ((cs_len >> 8) & 0xFF) as u8;
    out[off + 1] = (cs_len & 0xFF) as u8;
    off += 2;
    for cs in cipher_suites {
        let v = cs.to_u16();
        out[off] = (v >> 8) as u8;
        out[off + 1] = (v & 0xFF) as u8;
        off += 2;
    }

    // Compression methods: 1 byte length, 1 null method
    out[off] = 1;
    out[off + 1] = 0;
    off += 2;

    let ext_len = extensions_buf.len();
    out[off] = ((ext_len >> 8) & 0xFF) as u8;
    out[off + 1] = (ext_len & 0xFF) as u8;
    off += 2;
    out[off..off + ext_len].copy_from_slice(extensions_buf);
    off += ext_len;

    Ok(off)
}

/// Parse a ClientHello message body (after the 4-byte handshake header).
pub fn parse_client_hello(data: &[u8]) -> Result<ClientHello<'_>, Error> {
    if data.len() < 2 + 32 + 1 {
        return Err(Error::Framing);
    }

    let mut off = 0;

    // ProtocolVersion (legacy, should be 0x0303)
    let _version = u16::from_be_bytes([data[off], data[off + 1]]);
    off += 2;

    let random: &[u8; 32] = data[off..off + 32].try_into().map_err(|_| Error::Framing)?;
    off += 32;

    let sid_len = data[off] as usize;
    off += 1;
    if off + sid_len > data.len() {
        return Err(Error::Framing);
    }
    let session_id = &data[off..off + sid_len];
    off += sid_len;

    if off + 2 > data.len() {
        return Err(Error::Framing);
    }
    let cs_len = u16::from_be_bytes([data[off], data[off + 1]]) as usize;
    off += 2;
    if off + cs_len > data.len() {
        return Err(Error::Framing);
    }
    let cipher_suites = &data[off..off + cs_len];
    off += cs_len;

    // Compression methods (1-byte length prefix)
    if off >= data.len() {
        return Err(Error::Framing);
    }
    let comp_len = data[off] as usize;
    off += 1;
    if off + comp_len > data.len() {
        return Err(Error::Framing);
    }
    off += comp_len;

    let extensions = if off + 2 <= data.len() {
        let ext_len = u16::from_be_bytes([data[off], data[off + 1]]) as usize;
        off += 2;
        if off + ext_len > data.len() {
            return Err(Error::Framing);
        }
        &data[off..off + ext_len]
    } else {
        &[]
    };

    Ok(ClientHello {
        random,
        session_id,
        cipher_suites,
        extensions,
    })
}

/// Iterate over cipher suites in a ClientHello cipher_suites field.
pub fn iter_cipher_suites(data: &[u8]) -> impl Iterator<Item = u16> + '_ {
    data.chunks_exact(2)
        .map(|chunk| u16::from_be_bytes([chunk[0], chunk[1]]))
}

/// Encode a ServerHello (or HelloRetryRequest, via the sentinel random).
pub fn encode_server_hello(
    random: &[u8; 32],
    session_id: &[u8],
    cipher_suite: CipherSuite,
    extensions_buf: &[u8],
    out: &mut [u8],
) -> Result<usize, Error> {
    let body_len = 2 + 32 + 1 + session_id.len() + 2 + 1 + 2 + extensions_buf.len();
    let total = 4 + body_len;

    if out.len() < total {
        return Err(Error::BufferTooSmall { needed: total });
    }

    write_handshake_header(HandshakeType::ServerHello, body_len, out)?;
    let mut off = 4;

    // ProtocolVersion: legacy TLS 1.2
    out[off] = 0x03;
    out[off + 1] = 0x03;
    off += 2;

    out[off..off + 32].copy_from_slice(random);
    off += 32;

    // Session ID (echo client's)
    out[off] = session_id.len() as u8;
    off += 1;
    if !session_id.is_empty() {
        out[off..off + session_id.len()].copy_from_slice(session_id);
        off += session_id.len();
    }

    let cs = cipher_suite.to_u16();
    out[off] = (cs >> 8) as u8;
    out[off + 1] = (cs & 0xFF) as u8;
    off += 2;

    // Compression method: null
    out[off] = 0;
    off += 1;

    let ext_len = extensions_buf.len();
    out[off] = ((ext_len >> 8) & 0xFF) as u8;
    out[off + 1] = (ext_len & 0xFF) as u8;
    off += 2;
    out[off..off + ext_len].copy_from_slice(extensions_buf);
    off += ext_len;

    Ok(off)
}

/// Parse a ServerHello message body (after the 4-byte handshake header).
pub fn parse_server_hello(data: &[u8]) -> Result<ServerHello<'_>, Error> {
    if data.len() < 2 + 32 + 1 {
        return Err(Error::Framing);
    }

    let mut off = 0;

    let _version = u16::from_be_bytes([data[off], data[off + 1]]);
    off += 2;

    let random: &[u8; 32] = data[off..off + 32].try_into().map_err(|_| Error::Framing)?;
    off += 32;

    let sid_len = data[off] as usize;
    off += 1;
    if off + sid_len > data.len() {
        return Err(Error::Framing);
    }
    let session_id = &data[off..off + sid_len];
    off += sid_len;

    if off + 2 > data.len() {
        return Err(Error::Framing);
    }
    let cs_val = u16::from_be_bytes([data[off], data[off + 1]]);
    let cipher_suite = CipherSuite::from_u16(cs_val)
        .ok_or(Error::Protocol(crate::tls::alert::AlertDescription::HandshakeFailure))?;
    off += 2;

    if off >= data.len() {
        return Err(Error::Framing);
    }
    let _compression = data[off];
    off += 1;

    let extensions = if off + 2 <= data.len() {
        let ext_len = u16::from_be_bytes([data[off], data[off + 1]]) as usize;
        off += 2;
        if off + ext_len > data.len() {
            return Err(Error::Framing);
        }
        &data[off..off + ext_len]
    } else {
        &[]
    };

    Ok(ServerHello {
        random,
        session_id,
        cipher_suite,
        extensions,
    })
}

/// Encode an EncryptedExtensions message.
pub fn encode_encrypted_extensions(extensions_buf: &[u8], out: &mut [u8]) -> Result<usize, Error> {
    let body_len = 2 + extensions_buf.len();
    let total = 4 + body_len;

    if out.len() < total {
        return Err(Error::BufferTooSmall { needed: total });
    }

    write_handshake_header(HandshakeType::EncryptedExtensions, body_len, out)?;
    let mut off = 4;

    let ext_len = extensions_buf.len();
    out[off] = ((ext_len >> 8) & 0xFF) as u8;
    out[off + 1] = (ext_len & 0xFF) as u8;
    off += 2;

    out[off..off + ext_len].copy_from_slice(extensions_buf);
    off += ext_len;

    Ok(off)
}

/// Parse an EncryptedExtensions message body (after header).
/// Returns the raw extensions bytes.
pub fn parse_encrypted_extensions(data: &[u8]) -> Result<&[u8], Error> {
    if data.len() < 2 {
        return Err(Error::Framing);
    }
    let ext_len = u16::from_be_bytes([data[0], data[1]]) as usize;
    if 2 + ext_len > data.len() {
        return Err(Error::Framing);
    }
    Ok(&data[2..2 + ext_len])
}

/// Encode a Certificate message with a single certificate.
///
/// TLS 1.3 format. For TLS 1.2 use [`encode_certificate_tls12`]; the
/// request context and per-entry extensions do not exist there.
pub fn encode_certificate(cert_der: &[u8], out: &mut [u8]) -> Result<usize, Error> {
    // Entry: 3 (cert_data_len) + cert_der.len() + 2 (ext_len)
    let entry_len = 3 + cert_der.len() + 2;
    // Body: 1 (context_len) + 3 (list_len) + entry_len
    let body_len = 1 + 3 + entry_len;
    let total = 4 + body_len;

    if out.len() < total {
        return Err(Error::BufferTooSmall { needed: total });
    }

    write_handshake_header(HandshakeType::Certificate, body_len, out)?;
    let mut off = 4;

    // certificate_request_context length = 0
    out[off] = 0;
    off += 1;

    out[off] = ((entry_len >> 16) & 0xFF) as u8;
    out[off + 1] = ((entry_len >> 8) & 0xFF) as u8;
    out[off + 2] = (entry_len & 0xFF) as u8;
    off += 3;

    let cert_len = cert_der.len();
    out[off] = ((cert_len >> 16) & 0xFF) as u8;
    out[off + 1] = ((cert_len >> 8) & 0xFF) as u8;
    out[off + 2] = (cert_len & 0xFF) as u8;
    off += 3;

    out[off..off + cert_len].copy_from_slice(cert_der);
    off += cert_len;

    // extensions length = 0
    out[off] = 0;
    out[off + 1] = 0;
    off += 2;

    Ok(off)
}

/// Parse a TLS 1.3 Certificate message body (after header).
pub fn parse_certificate(data: &[u8]) -> Result<CertificatePayload<'_>, Error> {
    if data.is_empty() {
        return Err(Error::Framing);
    }

    let mut off = 0;

    let ctx_len = data[off] as usize;
    off += 1;
    if off + ctx_len > data.len() {
        return Err(Error::Framing);
    }
    let context = &data[off..off + ctx_len];
    off += ctx_len;

    if off + 3 > data.len() {
        return Err(Error::Framing);
    }
    let list_len =
        ((data[off] as usize) << 16) | ((data[off + 1] as usize) << 8) | (data[off + 2] as usize);
    off += 3;
    if off + list_len > data.len() {
        return Err(Error::Framing);
    }
    let entries = &data[off..off + list_len];

    Ok(CertificatePayload { context, entries })
}

/// Iterate over certificate entries in a TLS 1.3 CertificatePayload.
pub fn iter_certificate_entries(
    mut data: &[u8],
) -> impl Iterator<Item = Result<CertificateEntry<'_>, Error>> + '_ {
    core::iter::from_fn(move || {
        if data.is_empty() {
            return None;
        }
        if data.len() < 3 {
            let err = Err(Error::Framing);
            data = &[];
            return Some(err);
        }
        let cert_len = ((data[0] as usize) << 16) | ((data[1] as usize) << 8) | (data[2] as usize);
        data = &data[3..];
        if data.len() < cert_len {
            let err = Err(Error::Framing);
            data = &[];
            return Some(err);
        }
        let cert_data = &data[..cert_len];
        data = &data[cert_len..];

        if data.len() < 2 {
            let err = Err(Error::Framing);
            data = &[];
            return Some(err);
        }
        let ext_len = u16::from_be_bytes([data[0], data[1]]) as usize;
        data = &data[2..];
        if data.len() < ext_len {
            let err = Err(Error::Framing);
            data = &[];
            return Some(err);
        }
        let extensions = &data[..ext_len];
        data = &data[ext_len..];

        Some(Ok(CertificateEntry {
            cert_data,
            extensions,
        }))
    })
}

/// Encode a TLS 1.2 Certificate message (RFC 5246 section 7.4.2).
///
/// Just the 3-byte-prefixed list of 3-byte-prefixed DER blobs.
pub fn encode_certificate_tls12(cert_der: &[u8], out: &mut [u8]) -> Result<usize, Error> {
    let entry_len = 3 + cert_der.len();
    let body_len = 3 + entry_len;
    let total = 4 + body_len;

    if out.len() < total {
        return Err(Error::BufferTooSmall { needed: total });
    }

    write_handshake_header(HandshakeType::Certificate, body_len, out)?;
    let mut off = 4;

    out[off] = ((entry_len >> 16) & 0xFF) as u8;
    out[off + 1] = ((entry_len >> 8) & 0xFF) as u8;
    out[off + 2] = (entry_len & 0xFF) as u8;
    off += 3;

    let cert_len = cert_der.len();
    out[off] = ((cert_len >> 16) & 0xFF) as u8;
    out[off + 1] = ((cert_len >> 8) & 0xFF) as u8;
    out[off + 2] = (cert_len & 0xFF) as u8;
    off += 3;

    out[off..off + cert_len].copy_from_slice(cert_der);
    off += cert_len;

    Ok(off)
}

/// Parse a TLS 1.2 Certificate message body, returning the first DER blob.
pub fn parse_certificate_tls12(data: &[u8]) -> Result<&[u8], Error> {
    if data.len() < 6 {
        return Err(Error::Framing);
    }
    let list_len = ((data[0] as usize) << 16) | ((data[1] as usize) << 8) | (data[2] as usize);
    if 3 + list_len > data.len() {
        return Err(Error::Framing);
    }
    let cert_len = ((data[3] as usize) << 16) | ((data[4] as usize) << 8) | (data[5] as usize);
    if 6 + cert_len > 3 + list_len {
        return Err(Error::Framing);
    }
    Ok(&data[6..6 + cert_len])
}

/// Encode a CertificateVerify message.
pub fn encode_certificate_verify(
    algorithm: u16,
    signature: &[u8],
    out: &mut [u8],
) -> Result<usize, Error> {
    let body_len = 2 + 2 + signature.len();
    let total = 4 + body_len;

    if out.len() < total {
        return Err(Error::BufferTooSmall { needed: total });
    }

    write_handshake_header(HandshakeType::CertificateVerify, body_len, out)?;
    let mut off = 4;

    out[off] = (algorithm >> 8) as u8;
    out[off + 1] = (algorithm & 0xFF) as u8;
    off += 2;

    let sig_len = signature.len();
    out[off] = ((sig_len >> 8) & 0xFF) as u8;
    out[off + 1] = (sig_len & 0xFF) as u8;
    off += 2;

    out[off..off + sig_len].copy_from_slice(signature);
    off += sig_len;

    Ok(off)
}

/// Parse a CertificateVerify message body (after header).
pub fn parse_certificate_verify(data: &[u8]) -> Result<CertificateVerify<'_>, Error> {
    if data.len() < 4 {
        return Err(Error::Framing);
    }

    let algorithm = u16::from_be_bytes([data[0], data[1]]);
    let sig_len = u16::from_be_bytes([data[2], data[3]]) as usize;

    if 4 + sig_len > data.len() {
        return Err(Error::Framing);
    }

    Ok(CertificateVerify {
        algorithm,
        signature: &data[4..4 + sig_len],
    })
}

/// Encode a Finished message (header + verify_data).
///
/// verify_data is 32 bytes for TLS 1.3 (HMAC-SHA256) and 12 bytes for
/// TLS 1.2 (PRF output).
pub fn encode_finished(verify_data: &[u8], out: &mut [u8]) -> Result<usize, Error> {
    let total = 4 + verify_data.len();
    if out.len() < total {
        return Err(Error::BufferTooSmall { needed: total });
    }
    write_handshake_header(HandshakeType::Finished, verify_data.len(), out)?;
    out[4..4 + verify_data.len()].copy_from_slice(verify_data);
    Ok(total)
}

/// Parse a Finished message body. `expected_len` is the verify_data size
/// for the negotiated version.
pub fn parse_finished(data: &[u8], expected_len: usize) -> Result<&[u8], Error> {
    if data.len() != expected_len {
        return Err(Error::Framing);
    }
    Ok(data)
}

/// Encode a NewSessionTicket message (RFC 8446 section 4.6.1).
#[allow(clippy::too_many_arguments)]
pub fn encode_new_session_ticket(
    lifetime: u32,
    age_add: u32,
    nonce: &[u8],
    ticket: &[u8],
    max_early_data: Option<u32>,
    out: &mut [u8],
) -> Result<usize, Error> {
    let ext_len = if max_early_data.is_some() { 8 } else { 0 };
    let body_len = 4 + 4 + 1 + nonce.len() + 2 + ticket.len() + 2 + ext_len;
    let total = 4 + body_len;

    if out.len() < total {
        return Err(Error::BufferTooSmall { needed: total });
    }

    write_handshake_header(HandshakeType::NewSessionTicket, body_len, out)?;
    let mut off = 4;

    out[off..off + 4].copy_from_slice(&lifetime.to_be_bytes());
    off += 4;
    out[off..off + 4].copy_from_slice(&age_add.to_be_bytes());
    off += 4;

    out[off] = nonce.len() as u8;
    off += 1;
    out[off..off + nonce.len()].copy_from_slice(nonce);
    off += nonce.len();

    let ticket_len = ticket.len();
    out[off] = ((ticket_len >> 8) & 0xFF) as u8;
    out[off + 1] = (ticket_len & 0xFF) as u8;
    off += 2;
    out[off..off + ticket_len].copy_from_slice(ticket);
    off += ticket_len;

    out[off] = ((ext_len >> 8) & 0xFF) as u8;
    out[off + 1] = (ext_len & 0xFF) as u8;
    off += 2;
    if let Some(max) = max_early_data {
        // early_data extension (type 42): 4-byte max_early_data_size
        out[off..off + 2].copy_from_slice(&42u16.to_be_bytes());
        out[off + 2..off + 4].copy_from_slice(&4u16.to_be_bytes());
        out[off + 4..off + 8].copy_from_slice(&max.to_be_bytes());
        off += 8;
    }

    Ok(off)
}

/// Parse a NewSessionTicket message body (after header).
pub fn parse_new_session_ticket(data: &[u8]) -> Result<NewSessionTicket<'_>, Error> {
    if data.len() < 4 + 4 + 1 {
        return Err(Error::Framing);
    }
    let mut off = 0;

    let lifetime = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
    let age_add = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
    off += 8;

    let nonce_len = data[off] as usize;
    off += 1;
    if off + nonce_len > data.len() {
        return Err(Error::Framing);
    }
    let nonce = &data[off..off + nonce_len];
    off += nonce_len;

    if off + 2 > data.len() {
        return Err(Error::Framing);
    }
    let ticket_len = u16::from_be_bytes([data[off], data[off + 1]]) as usize;
    off += 2;
    if ticket_len == 0 || off + ticket_len > data.len() {
        return Err(Error::Framing);
    }
    let ticket = &data[off..off + ticket_len];
    off += ticket_len;

    if off + 2 > data.len() {
        return Err(Error::Framing);
    }
    let ext_len = u16::from_be_bytes([data[off], data[off + 1]]) as usize;
    off += 2;
    if off + ext_len > data.len() {
        return Err(Error::Framing);
    }
    let mut extensions = &data[off..off + ext_len];

    let mut max_early_data = None;
    while extensions.len() >= 4 {
        let ext_type = u16::from_be_bytes([extensions[0], extensions[1]]);
        let len = u16::from_be_bytes([extensions[2], extensions[3]]) as usize;
        if 4 + len > extensions.len() {
            return Err(Error::Framing);
        }
        if ext_type == 42 {
            if len != 4 {
                return Err(Error::Framing);
            }
            max_early_data = Some(u32::from_be_bytes([
                extensions[4],
                extensions[5],
                extensions[6],
                extensions[7],
            ]));
        }
        extensions = &extensions[4 + len..];
    }

    Ok(NewSessionTicket {
        lifetime,
        age_add,
        nonce,
        ticket,
        max_early_data,
    })
}

/// Encode an EndOfEarlyData message (empty body).
pub fn encode_end_of_early_data(out: &mut [u8]) -> Result<usize, Error> {
    write_handshake_header(HandshakeType::EndOfEarlyData, 0, out)?;
    Ok(4)
}

/// Encode a KeyUpdate message.
pub fn encode_key_update(request: KeyUpdateRequest, out: &mut [u8]) -> Result<usize, Error> {
    if out.len() < 5 {
        return Err(Error::BufferTooSmall { needed: 5 });
    }
    write_handshake_header(HandshakeType::KeyUpdate, 1, out)?;
    out[4] = request as u8;
    Ok(5)
}

/// Parse a KeyUpdate message body.
pub fn parse_key_update(data: &[u8]) -> Result<KeyUpdateRequest, Error> {
    if data.len() != 1 {
        return Err(Error::Framing);
    }
    match data[0] {
        0 => Ok(KeyUpdateRequest::UpdateNotRequested),
        1 => Ok(KeyUpdateRequest::UpdateRequested),
        _ => Err(Error::Protocol(
            crate::tls::alert::AlertDescription::IllegalParameter,
        )),
    }
}

/// Encode a TLS 1.2 ServerKeyExchange for a named-curve ECDHE exchange
/// signed with Ed25519 (RFC 8422 section 5.4).
pub fn encode_server_key_exchange(
    group: u16,
    public_key: &[u8],
    algorithm: u16,
    signature: &[u8],
    out: &mut [u8],
) -> Result<usize, Error> {
    // params: curve_type(1) + named_curve(2) + pubkey_len(1) + pubkey
    let params_len = 1 + 2 + 1 + public_key.len();
    let body_len = params_len + 2 + 2 + signature.len();
    let total = 4 + body_len;

    if out.len() < total {
        return Err(Error::BufferTooSmall { needed: total });
    }

    write_handshake_header(HandshakeType::ServerKeyExchange, body_len, out)?;
    let mut off = 4;

    out[off] = 0x03; // named_curve
    out[off + 1] = (group >> 8) as u8;
    out[off + 2] = (group & 0xFF) as u8;
    out[off + 3] = public_key.len() as u8;
    off += 4;
    out[off..off + public_key.len()].copy_from_slice(public_key);
    off += public_key.len();

    out[off] = (algorithm >> 8) as u8;
    out[off + 1] = (algorithm & 0xFF) as u8;
    off += 2;

    let sig_len = signature.len();
    out[off] = ((sig_len >> 8) & 0xFF) as u8;
    out[off + 1] = (sig_len & 0xFF) as u8;
    off += 2;
    out[off..off + sig_len].copy_from_slice(signature);
    off += sig_len;

    Ok(off)
}

/// Parse a TLS 1.2 ServerKeyExchange message body (after header).
pub fn parse_server_key_exchange(data: &[u8]) -> Result<ServerKeyExchange<'_>, Error> {
    if data.len() < 4 {
        return Err(Error::Framing);
    }
    if data[0] != 0x03 {
        // Only named_curve is supported.
        return Err(Error::Protocol(
            crate::tls::alert::AlertDescription::IllegalParameter,
        ));
    }
    let group = u16::from_be_bytes([data[1], data[2]]);
    let pk_len = data[3] as usize;
    if 4 + pk_len > data.len() {
        return Err(Error::Framing);
    }
    let params = &data[..4 + pk_len];
    let public_key = &data[4..4 + pk_len];
    let mut off = 4 + pk_len;

    if off + 4 > data.len() {
        return Err(Error::Framing);
    }
    let algorithm = u16::from_be_bytes([data[off], data[off + 1]]);
    let sig_len = u16::from_be_bytes([data[off + 2], data[off + 3]]) as usize;
    off += 4;
    if off + sig_len > data.len() {
        return Err(Error::Framing);
    }
    let signature = &data[off..off + sig_len];

    Ok(ServerKeyExchange {
        group,
        public_key,
        algorithm,
        signature,
        params,
    })
}

/// Encode a TLS 1.2 ServerHelloDone message (empty body).
pub fn encode_server_hello_done(out: &mut [u8]) -> Result<usize, Error> {
    write_handshake_header(HandshakeType::ServerHelloDone, 0, out)?;
    Ok(4)
}

/// Encode a TLS 1.2 ClientKeyExchange (ECDHE public key, RFC 8422).
pub fn encode_client_key_exchange(public_key: &[u8], out: &mut [u8]) -> Result<usize, Error> {
    let body_len = 1 + public_key.len();
    let total = 4 + body_len;
    if out.len() < total {
        return Err(Error::BufferTooSmall { needed: total });
    }
    write_handshake_header(HandshakeType::ClientKeyExchange, body_len, out)?;
    out[4] = public_key.len() as u8;
    out[5..5 + public_key.len()].copy_from_slice(public_key);
    Ok(total)
}

/// Parse a TLS 1.2 ClientKeyExchange message body (after header).
pub fn parse_client_key_exchange(data: &[u8]) -> Result<&[u8], Error> {
    if data.is_empty() {
        return Err(Error::Framing);
    }
    let pk_len = data[0] as usize;
    if 1 + pk_len != data.len() {
        return Err(Error::Framing);
    }
    Ok(&data[1..1 + pk_len])
}
