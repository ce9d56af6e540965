//! Key schedule for both protocol versions.
//!
//! The TLS 1.3 schedule (RFC 8446 section 7.1) derives traffic secrets
//! from the optional PSK and the ECDHE shared secret through three
//! extract stages:
//!
//! ```text
//!             0
//!             |
//!             v
//!   PSK ->  HKDF-Extract = Early Secret
//!             |
//!             +-> Derive-Secret(., "ext binder" | "res binder", "")
//!             +-> Derive-Secret(., "c e traffic", CH)
//!             |
//!             v
//!   ECDHE -> HKDF-Extract = Handshake Secret
//!             |
//!             +-> Derive-Secret(., "c hs traffic", CH..SH)
//!             +-> Derive-Secret(., "s hs traffic", CH..SH)
//!             |
//!             v
//!     0  ->  HKDF-Extract = Master Secret
//!             |
//!             +-> Derive-Secret(., "c ap traffic", CH..SF)
//!             +-> Derive-Secret(., "s ap traffic", CH..SF)
//!             +-> Derive-Secret(., "res master", CH..CF)
//! ```
//!
//! The TLS 1.2 PRF (RFC 5246 section 5) lives at the bottom of this file;
//! P_SHA256 is built from the same HKDF-Extract primitive since
//! HKDF-Extract(salt, ikm) is exactly HMAC(salt, ikm).

use crate::crypto::{Aead, Hkdf};
use crate::error::Error;

/// HKDF-Expand-Label as defined in RFC 8446 section 7.1.
///
/// Constructs the HkdfLabel structure:
///   uint16 length = out.len()
///   opaque label<7..255> = "tls13 " + label
///   opaque context<0..255> = context
///
/// Then calls HKDF-Expand(secret, HkdfLabel, out.len()).
pub fn hkdf_expand_label<H: Hkdf>(
    hkdf: &H,
    secret: &[u8],
    label: &[u8],
    context: &[u8],
    out: &mut [u8],
) -> Result<(), Error> {
    // Build the HkdfLabel info structure on the stack.
    // Max info: 2 + 1 + 6 + label.len() + 1 + context.len()
    let tls13_prefix = b"tls13 ";
    let full_label_len = tls13_prefix.len() + label.len();
    let info_len = 2 + 1 + full_label_len + 1 + context.len();

    // 80 bytes is ample for every label this crate uses.
    if info_len > 80 {
        return Err(Error::Crypto);
    }

    let mut info = [0u8; 80];
    let out_len = out.len() as u16;
    info[0] = (out_len >> 8) as u8;
    info[1] = out_len as u8;
    info[2] = full_label_len as u8;
    info[3..3 + tls13_prefix.len()].copy_from_slice(tls13_prefix);
    info[3 + tls13_prefix.len()..3 + full_label_len].copy_from_slice(label);
    info[3 + full_label_len] = context.len() as u8;
    if !context.is_empty() {
        info[4 + full_label_len..4 + full_label_len + context.len()].copy_from_slice(context);
    }

    hkdf.expand(secret, &info[..info_len], out)
}

/// Extraction stage reached by a [`KeySchedule`].
///
/// The schedule is strictly staged: Early → Handshake → Master. Asking
/// for a derivation whose parent secret has not been extracted yet is a
/// programming error, not a peer-triggerable condition, and panics
/// rather than quietly expanding an all-zero parent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Stage {
    Early,
    Handshake,
    Master,
}

/// TLS 1.3 key schedule state.
///
/// The three stage secrets are wiped on drop.
pub struct KeySchedule {
    pub early_secret: [u8; 32],
    pub handshake_secret: [u8; 32],
    pub master_secret: [u8; 32],
    stage: Stage,
}

impl Drop for KeySchedule {
    fn drop(&mut self) {
        use zeroize::Zeroize;
        self.early_secret.zeroize();
        self.handshake_secret.zeroize();
        self.master_secret.zeroize();
    }
}

impl KeySchedule {
    /// Initialize the key schedule.
    ///
    /// Computes: Early Secret = HKDF-Extract(salt=0, ikm=PSK or 0)
    pub fn new<H: Hkdf>(hkdf: &H, psk: Option<&[u8; 32]>) -> Self {
        let zero = [0u8; 32];
        let ikm = psk.unwrap_or(&zero);
        let mut early_secret = [0u8; 32];
        hkdf.extract(&zero, ikm, &mut early_secret);

        Self {
            early_secret,
            handshake_secret: [0u8; 32],
            master_secret: [0u8; 32],
            stage: Stage::Early,
        }
    }

    /// Derive the resumption binder key and its finished key.
    ///
    /// binder_key = Derive-Secret(Early Secret, "res binder", "")
    /// and the PskBinderEntry MAC key is the finished key of binder_key.
    pub fn derive_binder_finished_key<H: Hkdf>(
        &self,
        hkdf: &H,
        finished_key: &mut [u8; 32],
    ) -> Result<(), Error> {
        let empty_hash = empty_transcript_hash();
        let mut binder_key = [0u8; 32];
        hkdf_expand_label(hkdf, &self.early_secret, b"res binder", &empty_hash, &mut binder_key)?;
        let out = Self::derive_finished_key(hkdf, &binder_key, finished_key);
        use zeroize::Zeroize;
        binder_key.zeroize();
        out
    }

    /// Derive the client early traffic secret for 0-RTT.
    ///
    /// secret = Derive-Secret(Early Secret, "c e traffic", ClientHello)
    pub fn derive_early_traffic_secret<H: Hkdf>(
        &self,
        hkdf: &H,
        client_hello_hash: &[u8; 32],
        secret: &mut [u8; 32],
    ) -> Result<(), Error> {
        hkdf_expand_label(
            hkdf,
            &self.early_secret,
            b"c e traffic",
            client_hello_hash,
            secret,
        )
    }

    /// Derive the handshake secret from the ECDHE shared secret.
    ///
    /// 1. Derive-Secret(Early Secret, "derived", "") -> salt
    /// 2. HKDF-Extract(salt, shared_secret) -> Handshake Secret
    pub fn derive_handshake_secret<H: Hkdf>(
        &mut self,
        hkdf: &H,
        shared_secret: &[u8; 32],
    ) -> Result<(), Error> {
        assert!(self.stage == Stage::Early, "handshake secret already extracted");
        let empty_hash = empty_transcript_hash();
        let mut salt = [0u8; 32];
        hkdf_expand_label(hkdf, &self.early_secret, b"derived", &empty_hash, &mut salt)?;

        hkdf.extract(&salt, shared_secret, &mut self.handshake_secret);
        self.stage = Stage::Handshake;
        Ok(())
    }

    /// Derive client and server handshake traffic secrets.
    ///
    /// `transcript_hash` is the hash of ClientHello..ServerHello.
    pub fn derive_handshake_traffic_secrets<H: Hkdf>(
        &self,
        hkdf: &H,
        transcript_hash: &[u8; 32],
        client_secret: &mut [u8; 32],
        server_secret: &mut [u8; 32],
    ) -> Result<(), Error> {
        assert!(self.stage >= Stage::Handshake, "handshake secret not extracted");
        hkdf_expand_label(
            hkdf,
            &self.handshake_secret,
            b"c hs traffic",
            transcript_hash,
            client_secret,
        )?;
        hkdf_expand_label(
            hkdf,
            &self.handshake_secret,
            b"s hs traffic",
            transcript_hash,
            server_secret,
        )?;
        Ok(())
    }

    /// Compute the master secret.
    ///
    /// 1. Derive-Secret(Handshake Secret, "derived", "") -> salt
    /// 2. HKDF-Extract(salt, 0) -> Master Secret
    pub fn derive_master_secret<H: Hkdf>(&mut self, hkdf: &H) -> Result<(), Error> {
        assert!(self.stage == Stage::Handshake, "master secret needs the handshake stage");
        let empty_hash = empty_transcript_hash();
        let mut salt = [0u8; 32];
        hkdf_expand_label(
            hkdf,
            &self.handshake_secret,
            b"derived",
            &empty_hash,
            &mut salt,
        )?;

        let zero_ikm = [0u8; 32];
        hkdf.extract(&salt, &zero_ikm, &mut self.master_secret);
        self.stage = Stage::Master;
        Ok(())
    }

    /// Derive client and server application traffic secrets.
    ///
    /// `transcript_hash` is the hash of ClientHello..server Finished.
    pub fn derive_app_traffic_secrets<H: Hkdf>(
        &self,
        hkdf: &H,
        transcript_hash: &[u8; 32],
        client_secret: &mut [u8; 32],
        server_secret: &mut [u8; 32],
    ) -> Result<(), Error> {
        assert!(self.stage == Stage::Master, "master secret not extracted");
        hkdf_expand_label(
            hkdf,
            &self.master_secret,
            b"c ap traffic",
            transcript_hash,
            client_secret,
        )?;
        hkdf_expand_label(
            hkdf,
            &self.master_secret,
            b"s ap traffic",
            transcript_hash,
            server_secret,
        )?;
        Ok(())
    }

    /// Derive the resumption master secret.
    ///
    /// secret = Derive-Secret(Master Secret, "res master", CH..client Finished)
    pub fn derive_resumption_master_secret<H: Hkdf>(
        &self,
        hkdf: &H,
        transcript_hash: &[u8; 32],
        secret: &mut [u8; 32],
    ) -> Result<(), Error> {
        assert!(self.stage == Stage::Master, "master secret not extracted");
        hkdf_expand_label(
            hkdf,
            &self.master_secret,
            b"res master",
            transcript_hash,
            secret,
        )
    }

    /// Derive the Finished key from a traffic secret.
    ///
    /// finished_key = HKDF-Expand-Label(secret, "finished", "", Hash.length)
    pub fn derive_finished_key<H: Hkdf>(
        hkdf: &H,
        base_key: &[u8; 32],
        finished_key: &mut [u8; 32],
    ) -> Result<(), Error> {
        hkdf_expand_label(hkdf, base_key, b"finished", &[], finished_key)
    }
}

/// Derive the PSK for one ticket from the resumption master secret.
///
/// PSK = HKDF-Expand-Label(res_master, "resumption", ticket_nonce, Hash.length)
/// (RFC 8446 section 4.6.1).
pub fn derive_ticket_psk<H: Hkdf>(
    hkdf: &H,
    resumption_master: &[u8; 32],
    ticket_nonce: &[u8],
    psk: &mut [u8; 32],
) -> Result<(), Error> {
    hkdf_expand_label(hkdf, resumption_master, b"resumption", ticket_nonce, psk)
}

/// Derive the next-generation traffic secret for KeyUpdate.
///
/// next = HKDF-Expand-Label(current, "traffic upd", "", Hash.length)
/// (RFC 8446 section 7.2).
pub fn derive_next_traffic_secret<H: Hkdf>(
    hkdf: &H,
    current_secret: &[u8; 32],
    next_secret: &mut [u8; 32],
) -> Result<(), Error> {
    hkdf_expand_label(hkdf, current_secret, b"traffic upd", &[], next_secret)
}

/// Derive TLS 1.3 record protection key and IV from a traffic secret.
pub fn derive_record_keys<H: Hkdf, A: Aead>(
    hkdf: &H,
    secret: &[u8; 32],
    key: &mut [u8],
    iv: &mut [u8; 12],
) -> Result<(), Error> {
    debug_assert_eq!(key.len(), A::KEY_LEN);
    hkdf_expand_label(hkdf, secret, b"key", &[], key)?;
    hkdf_expand_label(hkdf, secret, b"iv", &[], iv)?;
    Ok(())
}

/// Compute SHA-256("") — the hash of an empty transcript.
fn empty_transcript_hash() -> [u8; 32] {
    use sha2::{Digest, Sha256};
    let h = Sha256::new();
    let result = h.finalize();
    let mut out = [0u8; 32];
    out.copy_from_slice(&result);
    out
}

/// Compute HMAC-SHA256(key, message) for Finished verification.
///
/// The Finished verify_data = HMAC(finished_key, transcript_hash).
/// HKDF-Extract(salt, ikm) is HMAC(salt, ikm), so the extract primitive
/// computes it directly.
pub fn compute_finished_verify_data<H: Hkdf>(
    hkdf: &H,
    finished_key: &[u8; 32],
    transcript_hash: &[u8; 32],
) -> Result<[u8; 32], Error> {
    let mut verify_data = [0u8; 32];
    hkdf.extract(finished_key, transcript_hash, &mut verify_data);
    Ok(verify_data)
}

// ---- TLS 1.2 PRF (RFC 5246 section 5) ----

/// TLS 1.2 master secret length.
pub const TLS12_MASTER_SECRET_LEN: usize = 48;

/// TLS 1.2 Finished verify_data length.
pub const TLS12_VERIFY_DATA_LEN: usize = 12;

/// The TLS 1.2 pseudo-random function: PRF(secret, label, seed) = P_SHA256.
///
/// P_hash(secret, seed) = HMAC(secret, A(1) + seed) + HMAC(secret, A(2) + seed) + ...
/// where A(0) = seed, A(i) = HMAC(secret, A(i-1)).
///
/// `label` and `seed` together must fit in 128 bytes.
pub fn prf_tls12<H: Hkdf>(
    hkdf: &H,
    secret: &[u8],
    label: &[u8],
    seed: &[u8],
    out: &mut [u8],
) -> Result<(), Error> {
    let label_seed_len = label.len() + seed.len();
    if label_seed_len > 128 {
        return Err(Error::Crypto);
    }
    let mut label_seed = [0u8; 128];
    label_seed[..label.len()].copy_from_slice(label);
    label_seed[label.len()..label_seed_len].copy_from_slice(seed);
    let label_seed = &label_seed[..label_seed_len];

    // A(1) = HMAC(secret, seed)
    let mut a = [0u8; 32];
    hkdf.extract(secret, label_seed, &mut a);

    let mut offset = 0;
    while offset < out.len() {
        // HMAC(secret, A(i) + seed)
        let mut a_seed = [0u8; 160];
        a_seed[..32].copy_from_slice(&a);
        a_seed[32..32 + label_seed_len].copy_from_slice(label_seed);
        let mut block = [0u8; 32];
        hkdf.extract(secret, &a_seed[..32 + label_seed_len], &mut block);

        let take = core::cmp::min(32, out.len() - offset);
        out[offset..offset + take].copy_from_slice(&block[..take]);
        offset += take;

        // A(i+1) = HMAC(secret, A(i))
        let mut next_a = [0u8; 32];
        hkdf.extract(secret, &a, &mut next_a);
        a = next_a;
    }
    Ok(())
}

/// Compute the TLS 1.2 master secret from the premaster secret.
///
/// master_secret = PRF(pre_master, "master secret", ClientHello.random + ServerHello.random)[0..48]
pub fn tls12_master_secret<H: Hkdf>(
    hkdf: &H,
    premaster: &[u8],
    client_random: &[u8; 32],
    server_random: &[u8; 32],
) -> Result<[u8; TLS12_MASTER_SECRET_LEN], Error> {
    let mut seed = [0u8; 64];
    seed[..32].copy_from_slice(client_random);
    seed[32..].copy_from_slice(server_random);
    let mut master = [0u8; TLS12_MASTER_SECRET_LEN];
    prf_tls12(hkdf, premaster, b"master secret", &seed, &mut master)?;
    Ok(master)
}

/// TLS 1.2 AEAD key material for both directions. `client_write_iv` and
/// `server_write_iv` hold `iv_len` meaningful bytes: 4 (GCM implicit salt)
/// or 12 (ChaCha20-Poly1305 full IV).
pub struct Tls12Keys {
    pub client_write_key: [u8; 32],
    pub server_write_key: [u8; 32],
    pub client_write_iv: [u8; 12],
    pub server_write_iv: [u8; 12],
    pub iv_len: usize,
}

impl Drop for Tls12Keys {
    fn drop(&mut self) {
        use zeroize::Zeroize;
        self.client_write_key.zeroize();
        self.server_write_key.zeroize();
    }
}

/// Expand the TLS 1.2 key block for an AEAD suite.
///
/// key_block = PRF(master, "key expansion", ServerHello.random + ClientHello.random)
/// and for AEAD suites is carved up as
/// client_write_key | server_write_key | client_write_iv | server_write_iv
/// (no MAC keys, RFC 5246 section 6.3 with RFC 5288 / RFC 7905).
pub fn tls12_key_block<H: Hkdf>(
    hkdf: &H,
    master: &[u8; TLS12_MASTER_SECRET_LEN],
    client_random: &[u8; 32],
    server_random: &[u8; 32],
    key_len: usize,
    iv_len: usize,
) -> Result<Tls12Keys, Error> {
    if key_len > 32 || iv_len > 12 {
        return Err(Error::Crypto);
    }
    // key expansion uses server_random first
    let mut seed = [0u8; 64];
    seed[..32].copy_from_slice(server_random);
    seed[32..].copy_from_slice(client_random);

    let mut block = [0u8; 88]; // 2 * 32-byte keys + 2 * 12-byte IVs at most
    let block_len = 2 * key_len + 2 * iv_len;
    prf_tls12(hkdf, master, b"key expansion", &seed, &mut block[..block_len])?;

    let mut keys = Tls12Keys {
        client_write_key: [0u8; 32],
        server_write_key: [0u8; 32],
        client_write_iv: [0u8; 12],
        server_write_iv: [0u8; 12],
        iv_len,
    };
    keys.client_write_key[..key_len].copy_from_slice(&block[..key_len]);
    keys.server_write_key[..key_len].copy_from_slice(&block[key_len..2 * key_len]);
    keys.client_write_iv[..iv_len]
        .copy_from_slice(&block[2 * key_len..2 * key_len + iv_len]);
    keys.server_write_iv[..iv_len]
        .copy_from_slice(&block[2 * key_len + iv_len..2 * key_len + 2 * iv_len]);

    use zeroize::Zeroize;
    block.zeroize();
    Ok(keys)
}

/// Compute the TLS 1.2 Finished verify_data.
///
/// verify_data = PRF(master, "client finished" | "server finished",
///                   Hash(handshake_messages))[0..12]
pub fn tls12_verify_data<H: Hkdf>(
    hkdf: &H,
    master: &[u8; TLS12_MASTER_SECRET_LEN],
    is_client: bool,
    transcript_hash: &[u8; 32],
) -> Result<[u8; TLS12_VERIFY_DATA_LEN], Error> {
    let label: &[u8] = if is_client {
        b"client finished"
    } else {
        b"server finished"
    };
    let mut out = [0u8; TLS12_VERIFY_DATA_LEN];
    prf_tls12(hkdf, master, label, transcript_hash, &mut out)?;
    Ok(out)
}
