//! Session ticket sealing and resumption state.
//!
//! The server encodes everything it needs to resume a session into an
//! opaque blob, seals it under a ticket key, and hands it to the client
//! inside NewSessionTicket. On resumption the blob comes back as the PSK
//! identity and is opened here.
//!
//! Blob layout: format version (1) || key name (16) || nonce (12) ||
//! AEAD(state), with the header bytes as associated data. Every open
//! failure (unknown version, unknown key, auth failure, expired state)
//! collapses to `None` so the client learns nothing about why.

use zeroize::Zeroize;

use crate::crypto::rustcrypto::Aes256GcmAead;
use crate::crypto::Aead;
use crate::error::Error;
use crate::tls::messages::CipherSuite;
use crate::tls::ProtocolVersion;

/// Ticket blob format version.
pub const TICKET_FORMAT_VERSION: u8 = 1;

/// Ticket key name length.
pub const KEY_NAME_LEN: usize = 16;

/// Upper bound on a sealed ticket blob.
pub const MAX_TICKET_LEN: usize = 256;

const NONCE_LEN: usize = 12;
const MAX_SERVER_NAME: usize = 64;
const MAX_ALPN: usize = 16;

// version(1) + suite(2) + secret(32) + digest(32) + name(1+64) +
// alpn(1+16) + time(8) + lifetime(4) + age_add(4) + early_data(4)
const MAX_STATE_LEN: usize = 169;

/// Everything the server needs to resume a session.
pub struct SessionState {
    pub protocol_version: ProtocolVersion,
    pub cipher_suite: CipherSuite,
    /// The resumption PSK derived for this ticket.
    pub resumption_secret: [u8; 32],
    /// SHA-256 of the certificate presented on the original connection.
    pub peer_cert_digest: [u8; 32],
    pub server_name: heapless::Vec<u8, MAX_SERVER_NAME>,
    pub alpn: heapless::Vec<u8, MAX_ALPN>,
    /// Unix seconds when the ticket was issued.
    pub creation_time: u64,
    pub lifetime_secs: u32,
    pub ticket_age_add: u32,
    /// 0-RTT byte budget, zero if early data is not allowed.
    pub max_early_data: u32,
}

impl Drop for SessionState {
    fn drop(&mut self) {
        self.resumption_secret.zeroize();
    }
}

impl SessionState {
    /// Serialize into a fixed-order byte layout.
    fn encode(&self, out: &mut [u8]) -> Result<usize, Error> {
        let needed = 1
            + 2
            + 32
            + 32
            + 1
            + self.server_name.len()
            + 1
            + self.alpn.len()
            + 8
            + 4
            + 4
            + 4;
        if out.len() < needed {
            return Err(Error::BufferTooSmall { needed });
        }

        let mut off = 0;
        out[off] = match self.protocol_version {
            ProtocolVersion::Tls12 => 12,
            ProtocolVersion::Tls13 => 13,
        };
        off += 1;
        out[off..off + 2].copy_from_slice(&self.cipher_suite.to_u16().to_be_bytes());
        off += 2;
        out[off..off + 32].copy_from_slice(&self.resumption_secret);
        off += 32;
        out[off..off + 32].copy_from_slice(&self.peer_cert_digest);
        off += 32;
        out[off] = self.server_name.len() as u8;
        off += 1;
        out[off..off + self.server_name.len()].copy_from_slice(&self.server_name);
        off += self.server_name.len();
        out[off] = self.alpn.len() as u8;
        off += 1;
        out[off..off + self.alpn.len()].copy_from_slice(&self.alpn);
        off += self.alpn.len();
        out[off..off + 8].copy_from_slice(&self.creation_time.to_be_bytes());
        off += 8;
        out[off..off + 4].copy_from_slice(&self.lifetime_secs.to_be_bytes());
        off += 4;
        out[off..off + 4].copy_from_slice(&self.ticket_age_add.to_be_bytes());
        off += 4;
        out[off..off + 4].copy_from_slice(&self.max_early_data.to_be_bytes());
        off += 4;
        Ok(off)
    }

    fn decode(data: &[u8]) -> Option<SessionState> {
        let mut off = 0;
        let take = |off: &mut usize, n: usize| -> Option<&[u8]> {
            if *off + n > data.len() {
                return None;
            }
            let s = &data[*off..*off + n];
            *off += n;
            Some(s)
        };

        let protocol_version = match take(&mut off, 1)?[0] {
            12 => ProtocolVersion::Tls12,
            13 => ProtocolVersion::Tls13,
            _ => return None,
        };
        let suite_bytes = take(&mut off, 2)?;
        let cipher_suite =
            CipherSuite::from_u16(u16::from_be_bytes([suite_bytes[0], suite_bytes[1]]))?;

        let mut resumption_secret = [0u8; 32];
        resumption_secret.copy_from_slice(take(&mut off, 32)?);
        let mut peer_cert_digest = [0u8; 32];
        peer_cert_digest.copy_from_slice(take(&mut off, 32)?);

        let name_len = take(&mut off, 1)?[0] as usize;
        if name_len > MAX_SERVER_NAME {
            return None;
        }
        let server_name = heapless::Vec::from_slice(take(&mut off, name_len)?).ok()?;

        let alpn_len = take(&mut off, 1)?[0] as usize;
        if alpn_len > MAX_ALPN {
            return None;
        }
        let alpn = heapless::Vec::from_slice(take(&mut off, alpn_len)?).ok()?;

        let mut u64buf = [0u8; 8];
        u64buf.copy_from_slice(take(&mut off, 8)?);
        let creation_time = u64::from_be_bytes(u64buf);

        let mut u32buf = [0u8; 4];
        u32buf.copy_from_slice(take(&mut off, 4)?);
        let lifetime_secs = u32::from_be_bytes(u32buf);
        u32buf.copy_from_slice(take(&mut off, 4)?);
        let ticket_age_add = u32::from_be_bytes(u32buf);
        u32buf.copy_from_slice(take(&mut off, 4)?);
        let max_early_data = u32::from_be_bytes(u32buf);

        if off != data.len() {
            return None;
        }

        Some(SessionState {
            protocol_version,
            cipher_suite,
            resumption_secret,
            peer_cert_digest,
            server_name,
            alpn,
            creation_time,
            lifetime_secs,
            ticket_age_add,
            max_early_data,
        })
    }

    /// Whether the ticket is still valid at `now` (unix seconds).
    pub fn is_fresh(&self, now: u64) -> bool {
        if now < self.creation_time {
            return false;
        }
        now - self.creation_time < u64::from(self.lifetime_secs)
    }
}

struct TicketKey {
    name: [u8; KEY_NAME_LEN],
    key: [u8; 32],
}

impl Drop for TicketKey {
    fn drop(&mut self) {
        self.key.zeroize();
    }
}

/// Rotating set of ticket sealing keys.
///
/// New tickets are sealed under the current key; tickets sealed under up
/// to three previous keys still open, so rotation does not invalidate
/// recently issued tickets all at once.
pub struct TicketKeySet {
    current: TicketKey,
    previous: heapless::Vec<TicketKey, 3>,
}

impl TicketKeySet {
    pub fn new(name: [u8; KEY_NAME_LEN], key: [u8; 32]) -> Self {
        Self {
            current: TicketKey { name, key },
            previous: heapless::Vec::new(),
        }
    }

    /// Install a new current key. The old current key moves into the
    /// previous set; the oldest previous key is dropped when full.
    pub fn rotate(&mut self, name: [u8; KEY_NAME_LEN], key: [u8; 32]) {
        let old = core::mem::replace(&mut self.current, TicketKey { name, key });
        if self.previous.is_full() {
            self.previous.remove(0);
        }
        // Vec has room after the remove above.
        let _ = self.previous.push(old);
    }

    fn lookup(&self, name: &[u8]) -> Option<&TicketKey> {
        if self.current.name == name {
            return Some(&self.current);
        }
        self.previous.iter().find(|k| k.name == name)
    }

    /// Seal a session state into an opaque ticket blob.
    ///
    /// `nonce` must be unique per ticket under the current key; the
    /// caller supplies it from its randomness source.
    pub fn seal(
        &self,
        state: &SessionState,
        nonce: &[u8; NONCE_LEN],
        out: &mut [u8],
    ) -> Result<usize, Error> {
        let header_len = 1 + KEY_NAME_LEN + NONCE_LEN;
        let needed = header_len + MAX_STATE_LEN + Aes256GcmAead::TAG_LEN;
        if out.len() < needed {
            return Err(Error::BufferTooSmall { needed });
        }

        out[0] = TICKET_FORMAT_VERSION;
        out[1..1 + KEY_NAME_LEN].copy_from_slice(&self.current.name);
        out[1 + KEY_NAME_LEN..header_len].copy_from_slice(nonce);

        let state_len = state.encode(&mut out[header_len..])?;

        let (header, body) = out.split_at_mut(header_len);
        let aead = Aes256GcmAead::new(&self.current.key);
        let sealed_len = aead.seal_in_place(nonce, header, body, state_len)?;

        Ok(header_len + sealed_len)
    }

    /// Open a ticket blob. Returns the decoded state only when the blob
    /// authenticates under a known key and is still fresh at `now`.
    pub fn open(&self, blob: &[u8], now: u64) -> Option<SessionState> {
        let header_len = 1 + KEY_NAME_LEN + NONCE_LEN;
        if blob.len() < header_len + Aes256GcmAead::TAG_LEN {
            return None;
        }
        if blob[0] != TICKET_FORMAT_VERSION {
            return None;
        }
        let key = self.lookup(&blob[1..1 + KEY_NAME_LEN])?;
        let mut nonce = [0u8; NONCE_LEN];
        nonce.copy_from_slice(&blob[1 + KEY_NAME_LEN..header_len]);

        let mut body = [0u8; MAX_STATE_LEN + Aes256GcmAead::TAG_LEN];
        let ct_len = blob.len() - header_len;
        if ct_len > body.len() {
            return None;
        }
        body[..ct_len].copy_from_slice(&blob[header_len..]);

        let aead = Aes256GcmAead::new(&key.key);
        let pt_len = aead
            .open_in_place(&nonce, &blob[..header_len], &mut body[..ct_len], ct_len)
            .ok()?;

        let state = SessionState::decode(&body[..pt_len])?;
        body[..pt_len].zeroize();
        if !state.is_fresh(now) {
            return None;
        }
        Some(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_state() -> SessionState {
        SessionState {
            protocol_version: ProtocolVersion::Tls13,
            cipher_suite: CipherSuite::TlsAes128GcmSha256,
            resumption_secret: [0x5A; 32],
            peer_cert_digest: [0xC4; 32],
            server_name: heapless::Vec::from_slice(b"example.com").unwrap(),
            alpn: heapless::Vec::from_slice(b"h2").unwrap(),
            creation_time: 1_700_000_000,
            lifetime_secs: 7200,
            ticket_age_add: 0xDEAD_BEEF,
            max_early_data: 16384,
        }
    }

    fn key_set() -> TicketKeySet {
        TicketKeySet::new([0x01; KEY_NAME_LEN], [0x11; 32])
    }

    #[test]
    fn seal_open_roundtrip() {
        let keys = key_set();
        let state = sample_state();
        let mut blob = [0u8; MAX_TICKET_LEN];
        let len = keys.seal(&state, &[9u8; 12], &mut blob).unwrap();

        let opened = keys.open(&blob[..len], 1_700_000_100).unwrap();
        assert_eq!(opened.protocol_version, ProtocolVersion::Tls13);
        assert_eq!(opened.cipher_suite, CipherSuite::TlsAes128GcmSha256);
        assert_eq!(opened.resumption_secret, [0x5A; 32]);
        assert_eq!(opened.peer_cert_digest, [0xC4; 32]);
        assert_eq!(opened.server_name.as_slice(), b"example.com");
        assert_eq!(opened.alpn.as_slice(), b"h2");
        assert_eq!(opened.ticket_age_add, 0xDEAD_BEEF);
        assert_eq!(opened.max_early_data, 16384);
    }

    #[test]
    fn tampered_blob_opens_to_none() {
        let keys = key_set();
        let mut blob = [0u8; MAX_TICKET_LEN];
        let len = keys.seal(&sample_state(), &[9u8; 12], &mut blob).unwrap();

        blob[len - 1] ^= 0x01;
        assert!(keys.open(&blob[..len], 1_700_000_100).is_none());
    }

    #[test]
    fn unknown_key_name_opens_to_none() {
        let keys = key_set();
        let mut blob = [0u8; MAX_TICKET_LEN];
        let len = keys.seal(&sample_state(), &[9u8; 12], &mut blob).unwrap();

        let other = TicketKeySet::new([0x02; KEY_NAME_LEN], [0x22; 32]);
        assert!(other.open(&blob[..len], 1_700_000_100).is_none());
    }

    #[test]
    fn unknown_format_version_opens_to_none() {
        let keys = key_set();
        let mut blob = [0u8; MAX_TICKET_LEN];
        let len = keys.seal(&sample_state(), &[9u8; 12], &mut blob).unwrap();

        blob[0] = 2;
        assert!(keys.open(&blob[..len], 1_700_000_100).is_none());
    }

    #[test]
    fn expired_ticket_opens_to_none() {
        let keys = key_set();
        let mut blob = [0u8; MAX_TICKET_LEN];
        let len = keys.seal(&sample_state(), &[9u8; 12], &mut blob).unwrap();

        // lifetime is 7200 seconds
        assert!(keys.open(&blob[..len], 1_700_000_000 + 7200).is_none());
        // and time running backwards is invalid too
        assert!(keys.open(&blob[..len], 1_699_999_999).is_none());
    }

    #[test]
    fn rotation_keeps_old_tickets_working() {
        let mut keys = key_set();
        let mut blob = [0u8; MAX_TICKET_LEN];
        let len = keys.seal(&sample_state(), &[9u8; 12], &mut blob).unwrap();

        keys.rotate([0x02; KEY_NAME_LEN], [0x22; 32]);
        assert!(keys.open(&blob[..len], 1_700_000_100).is_some());

        // New tickets seal under the new key.
        let mut blob2 = [0u8; MAX_TICKET_LEN];
        let len2 = keys.seal(&sample_state(), &[10u8; 12], &mut blob2).unwrap();
        assert_eq!(&blob2[1..1 + KEY_NAME_LEN], &[0x02; KEY_NAME_LEN]);
        assert!(keys.open(&blob2[..len2], 1_700_000_100).is_some());
    }

    #[test]
    fn rotation_eventually_expires_old_keys() {
        let mut keys = key_set();
        let mut blob = [0u8; MAX_TICKET_LEN];
        let len = keys.seal(&sample_state(), &[9u8; 12], &mut blob).unwrap();

        for i in 2u8..=5 {
            keys.rotate([i; KEY_NAME_LEN], [i; 32]);
        }
        // Four rotations push the original key out of the previous set.
        assert!(keys.open(&blob[..len], 1_700_000_100).is_none());
    }
}
