//! Hello extension encoding and decoding.
//!
//! Extension format: type (2 bytes) + length (2 bytes) + data.
//!
//! The pre_shared_key extension is special-cased: it must be the last
//! extension in the ClientHello and its binders are computed over a
//! transcript that ends just before them, so the encoder returns the
//! binder offset for the engine to patch after hashing.

use crate::crypto::kex::NamedGroup;
use crate::error::Error;

// Extension type codes
pub const EXT_SERVER_NAME: u16 = 0x0000;
pub const EXT_SUPPORTED_GROUPS: u16 = 0x000a;
pub const EXT_SIGNATURE_ALGORITHMS: u16 = 0x000d;
pub const EXT_ALPN: u16 = 0x0010;
pub const EXT_PRE_SHARED_KEY: u16 = 0x0029;
pub const EXT_EARLY_DATA: u16 = 0x002a;
pub const EXT_SUPPORTED_VERSIONS: u16 = 0x002b;
pub const EXT_PSK_KEY_EXCHANGE_MODES: u16 = 0x002d;
pub const EXT_KEY_SHARE: u16 = 0x0033;

/// TLS 1.3 wire version.
pub const VERSION_TLS13: u16 = 0x0304;
/// TLS 1.2 wire version.
pub const VERSION_TLS12: u16 = 0x0303;

/// A PSK offered in a ClientHello pre_shared_key extension.
pub struct OfferedPsk<'a> {
    pub identity: &'a [u8],
    pub obfuscated_age: u32,
    pub binder: &'a [u8],
}

/// A key share entry (group + raw public key bytes).
pub struct KeyShareEntry<'a> {
    pub group: u16,
    pub key: &'a [u8],
}

/// Parsed extensions from ClientHello.
pub struct ClientHelloExtensions<'a> {
    /// SNI host name, if offered.
    pub server_name: Option<&'a [u8]>,
    /// Whether supported_versions lists TLS 1.3.
    pub supports_tls13: bool,
    /// Whether the client can fall back to TLS 1.2 (supported_versions
    /// lists it, or the extension is absent entirely).
    pub supports_tls12: bool,
    /// First key share whose group we understand.
    pub key_share: Option<KeyShareEntry<'a>>,
    /// All named groups the client supports.
    pub groups: heapless::Vec<u16, 8>,
    /// Whether signature_algorithms includes Ed25519.
    pub offers_ed25519: bool,
    /// ALPN protocols offered by the client, in preference order.
    pub alpn_protocols: heapless::Vec<&'a [u8], 4>,
    /// Whether psk_key_exchange_modes includes psk_dhe_ke.
    pub psk_dhe_mode: bool,
    /// The first offered PSK, if any.
    pub pre_shared_key: Option<OfferedPsk<'a>>,
    /// Whether the early_data extension is present.
    pub early_data: bool,
}

/// Parsed extensions from ServerHello (or HelloRetryRequest).
pub struct ServerHelloExtensions<'a> {
    /// Selected TLS version from supported_versions (0 if absent, which
    /// means the peer negotiated TLS 1.2).
    pub selected_version: u16,
    /// Server's key share.
    pub key_share: Option<KeyShareEntry<'a>>,
    /// HelloRetryRequest: the group the server wants instead.
    pub retry_group: Option<u16>,
    /// Index of the accepted PSK identity.
    pub selected_psk: Option<u16>,
    /// Selected ALPN protocol (TLS 1.2 carries this in ServerHello).
    pub alpn: Option<&'a [u8]>,
}

/// Parsed extensions from EncryptedExtensions.
pub struct EncryptedExtensionsData<'a> {
    /// Selected ALPN protocol.
    pub alpn: Option<&'a [u8]>,
    /// Whether the server accepted 0-RTT.
    pub early_data_accepted: bool,
}

/// Write a 2-byte big-endian value.
fn put_u16(buf: &mut [u8], off: &mut usize, val: u16) -> Result<(), Error> {
    if buf.len() < *off + 2 {
        return Err(Error::BufferTooSmall { needed: *off + 2 });
    }
    buf[*off] = (val >> 8) as u8;
    buf[*off + 1] = (val & 0xFF) as u8;
    *off += 2;
    Ok(())
}

fn put_bytes(buf: &mut [u8], off: &mut usize, data: &[u8]) -> Result<(), Error> {
    if buf.len() < *off + data.len() {
        return Err(Error::BufferTooSmall {
            needed: *off + data.len(),
        });
    }
    buf[*off..*off + data.len()].copy_from_slice(data);
    *off += data.len();
    Ok(())
}

/// Read a 2-byte big-endian value.
fn get_u16(data: &[u8], off: &mut usize) -> Result<u16, Error> {
    if data.len() < *off + 2 {
        return Err(Error::Framing);
    }
    let val = u16::from_be_bytes([data[*off], data[*off + 1]]);
    *off += 2;
    Ok(val)
}

/// What the client puts in its ClientHello extensions.
pub struct ClientHelloParams<'a> {
    pub server_name: &'a str,
    /// Key share group and encoded public key.
    pub key_share_group: NamedGroup,
    pub key_share: &'a [u8],
    /// All groups we are willing to use (preference order).
    pub groups: &'a [NamedGroup],
    pub alpn: &'a [&'a [u8]],
    /// Offer TLS 1.2 fallback in supported_versions.
    pub offer_tls12: bool,
    /// Advertise the early_data extension.
    pub early_data: bool,
}

/// Encode ClientHello extensions into a buffer.
///
/// Does NOT include pre_shared_key; call
/// [`append_pre_shared_key_ext`] afterwards if resuming, so that it lands
/// last as RFC 8446 section 4.2.11 requires.
pub fn encode_client_hello_extensions(
    params: &ClientHelloParams<'_>,
    buf: &mut [u8],
) -> Result<usize, Error> {
    let mut off = 0;

    // --- server_name (SNI) ---
    if !params.server_name.is_empty() {
        let name_bytes = params.server_name.as_bytes();
        // ServerNameList: list_length(2) + type(1) + name_length(2) + name
        let sni_data_len = 2 + 1 + 2 + name_bytes.len();
        put_u16(buf, &mut off, EXT_SERVER_NAME)?;
        put_u16(buf, &mut off, sni_data_len as u16)?;
        put_u16(buf, &mut off, (1 + 2 + name_bytes.len()) as u16)?;
        // HostName type = 0
        put_bytes(buf, &mut off, &[0])?;
        put_u16(buf, &mut off, name_bytes.len() as u16)?;
        put_bytes(buf, &mut off, name_bytes)?;
    }

    // --- supported_versions ---
    // ClientHello: list_length(1) + versions
    let n_versions: u8 = if params.offer_tls12 { 2 } else { 1 };
    put_u16(buf, &mut off, EXT_SUPPORTED_VERSIONS)?;
    put_u16(buf, &mut off, 1 + n_versions as u16 * 2)?;
    put_bytes(buf, &mut off, &[n_versions * 2])?;
    put_u16(buf, &mut off, VERSION_TLS13)?;
    if params.offer_tls12 {
        put_u16(buf, &mut off, VERSION_TLS12)?;
    }

    // --- supported_groups ---
    let groups_len = params.groups.len() * 2;
    put_u16(buf, &mut off, EXT_SUPPORTED_GROUPS)?;
    put_u16(buf, &mut off, (2 + groups_len) as u16)?;
    put_u16(buf, &mut off, groups_len as u16)?;
    for g in params.groups {
        put_u16(buf, &mut off, *g as u16)?;
    }

    // --- key_share ---
    // client_shares: length(2) + KeyShareEntry(group(2) + key_length(2) + key)
    let ks_entry_len = 2 + 2 + params.key_share.len();
    put_u16(buf, &mut off, EXT_KEY_SHARE)?;
    put_u16(buf, &mut off, (2 + ks_entry_len) as u16)?;
    put_u16(buf, &mut off, ks_entry_len as u16)?;
    put_u16(buf, &mut off, params.key_share_group as u16)?;
    put_u16(buf, &mut off, params.key_share.len() as u16)?;
    put_bytes(buf, &mut off, params.key_share)?;

    // --- signature_algorithms ---
    // Ed25519(0x0807), ECDSA-SHA256(0x0403)
    let sig_algs: [u16; 2] = [0x0807, 0x0403];
    let sig_algs_list_len = sig_algs.len() * 2;
    put_u16(buf, &mut off, EXT_SIGNATURE_ALGORITHMS)?;
    put_u16(buf, &mut off, (2 + sig_algs_list_len) as u16)?;
    put_u16(buf, &mut off, sig_algs_list_len as u16)?;
    for &alg in &sig_algs {
        put_u16(buf, &mut off, alg)?;
    }

    // --- ALPN ---
    if !params.alpn.is_empty() {
        let mut list_len = 0usize;
        for proto in params.alpn {
            list_len += 1 + proto.len();
        }
        put_u16(buf, &mut off, EXT_ALPN)?;
        put_u16(buf, &mut off, (2 + list_len) as u16)?;
        put_u16(buf, &mut off, list_len as u16)?;
        for proto in params.alpn {
            put_bytes(buf, &mut off, &[proto.len() as u8])?;
            put_bytes(buf, &mut off, proto)?;
        }
    }

    // --- psk_key_exchange_modes: psk_dhe_ke only ---
    put_u16(buf, &mut off, EXT_PSK_KEY_EXCHANGE_MODES)?;
    put_u16(buf, &mut off, 2)?;
    put_bytes(buf, &mut off, &[1, 1])?;

    // --- early_data ---
    if params.early_data {
        put_u16(buf, &mut off, EXT_EARLY_DATA)?;
        put_u16(buf, &mut off, 0)?;
    }

    Ok(off)
}

/// Append a pre_shared_key extension with a zeroed binder.
///
/// Returns `(new_len, binder_offset)` where `binder_offset` is the
/// position of the 32-byte binder within `buf`; the caller computes the
/// real binder over the ClientHello truncated at `binder_offset - 3`
/// (the binders list length prefix plus the entry length byte) and
/// patches it in place.
pub fn append_pre_shared_key_ext(
    identity: &[u8],
    obfuscated_age: u32,
    buf: &mut [u8],
    mut off: usize,
) -> Result<(usize, usize), Error> {
    // identities: list_len(2) + identity_len(2) + identity + age(4)
    let identities_len = 2 + identity.len() + 4;
    // binders: list_len(2) + binder_len(1) + binder(32)
    let binders_len = 1 + 32;
    let ext_len = 2 + identities_len + 2 + binders_len;

    put_u16(buf, &mut off, EXT_PRE_SHARED_KEY)?;
    put_u16(buf, &mut off, ext_len as u16)?;
    put_u16(buf, &mut off, identities_len as u16)?;
    put_u16(buf, &mut off, identity.len() as u16)?;
    put_bytes(buf, &mut off, identity)?;
    put_bytes(buf, &mut off, &obfuscated_age.to_be_bytes())?;
    put_u16(buf, &mut off, binders_len as u16)?;
    put_bytes(buf, &mut off, &[32])?;
    let binder_offset = off;
    put_bytes(buf, &mut off, &[0u8; 32])?;

    Ok((off, binder_offset))
}

/// Parse ClientHello extensions.
pub fn parse_client_hello_extensions(data: &[u8]) -> Result<ClientHelloExtensions<'_>, Error> {
    let mut result = ClientHelloExtensions {
        server_name: None,
        supports_tls13: false,
        supports_tls12: false,
        key_share: None,
        groups: heapless::Vec::new(),
        offers_ed25519: false,
        alpn_protocols: heapless::Vec::new(),
        psk_dhe_mode: false,
        pre_shared_key: None,
        early_data: false,
    };
    let mut saw_supported_versions = false;

    let mut off = 0;
    while off + 4 <= data.len() {
        let ext_type = get_u16(data, &mut off)?;
        let ext_len = get_u16(data, &mut off)? as usize;

        if off + ext_len > data.len() {
            return Err(Error::Framing);
        }
        let ext_data = &data[off..off + ext_len];
        off += ext_len;

        // pre_shared_key must come last.
        if result.pre_shared_key.is_some() {
            return Err(Error::Protocol(
                crate::tls::alert::AlertDescription::IllegalParameter,
            ));
        }

        match ext_type {
            EXT_SERVER_NAME => {
                // ServerNameList: list_len(2) + type(1) + name_len(2) + name
                if ext_data.len() < 5 {
                    return Err(Error::Framing);
                }
                if ext_data[2] == 0 {
                    let name_len = u16::from_be_bytes([ext_data[3], ext_data[4]]) as usize;
                    if 5 + name_len > ext_data.len() {
                        return Err(Error::Framing);
                    }
                    result.server_name = Some(&ext_data[5..5 + name_len]);
                }
            }
            EXT_SUPPORTED_VERSIONS => {
                saw_supported_versions = true;
                if ext_data.is_empty() {
                    return Err(Error::Framing);
                }
                let list_len = ext_data[0] as usize;
                if 1 + list_len > ext_data.len() {
                    return Err(Error::Framing);
                }
                let mut voff = 1;
                while voff + 1 < 1 + list_len {
                    let ver = u16::from_be_bytes([ext_data[voff], ext_data[voff + 1]]);
                    if ver == VERSION_TLS13 {
                        result.supports_tls13 = true;
                    }
                    if ver == VERSION_TLS12 {
                        result.supports_tls12 = true;
                    }
                    voff += 2;
                }
            }
            EXT_SUPPORTED_GROUPS => {
                if ext_data.len() < 2 {
                    return Err(Error::Framing);
                }
                let list_len = u16::from_be_bytes([ext_data[0], ext_data[1]]) as usize;
                if 2 + list_len > ext_data.len() {
                    return Err(Error::Framing);
                }
                let mut goff = 2;
                while goff + 1 < 2 + list_len {
                    let g = u16::from_be_bytes([ext_data[goff], ext_data[goff + 1]]);
                    // Unknown groups are skipped, not stored.
                    if NamedGroup::from_u16(g).is_some() {
                        let _ = result.groups.push(g);
                    }
                    goff += 2;
                }
            }
            EXT_KEY_SHARE => {
                // client_shares_length(2) + KeyShareEntry list
                if ext_data.len() < 2 {
                    return Err(Error::Framing);
                }
                let shares_len = u16::from_be_bytes([ext_data[0], ext_data[1]]) as usize;
                if 2 + shares_len > ext_data.len() {
                    return Err(Error::Framing);
                }
                let mut soff = 2;
                while soff + 4 <= 2 + shares_len {
                    let group = u16::from_be_bytes([ext_data[soff], ext_data[soff + 1]]);
                    let key_len =
                        u16::from_be_bytes([ext_data[soff + 2], ext_data[soff + 3]]) as usize;
                    soff += 4;
                    if soff + key_len > 2 + shares_len {
                        return Err(Error::Framing);
                    }
                    if result.key_share.is_none() {
                        if let Some(g) = NamedGroup::from_u16(group) {
                            if key_len == g.pubkey_len() {
                                result.key_share = Some(KeyShareEntry {
                                    group,
                                    key: &ext_data[soff..soff + key_len],
                                });
                            }
                        }
                    }
                    soff += key_len;
                }
            }
            EXT_SIGNATURE_ALGORITHMS => {
                if ext_data.len() < 2 {
                    return Err(Error::Framing);
                }
                let list_len = u16::from_be_bytes([ext_data[0], ext_data[1]]) as usize;
                if 2 + list_len > ext_data.len() {
                    return Err(Error::Framing);
                }
                let mut aoff = 2;
                while aoff + 1 < 2 + list_len {
                    if u16::from_be_bytes([ext_data[aoff], ext_data[aoff + 1]]) == 0x0807 {
                        result.offers_ed25519 = true;
                    }
                    aoff += 2;
                }
            }
            EXT_ALPN => {
                if ext_data.len() < 2 {
                    return Err(Error::Framing);
                }
                let list_len = u16::from_be_bytes([ext_data[0], ext_data[1]]) as usize;
                if 2 + list_len > ext_data.len() {
                    return Err(Error::Framing);
                }
                let mut aoff = 2;
                while aoff < 2 + list_len {
                    let proto_len = ext_data[aoff] as usize;
                    aoff += 1;
                    if proto_len == 0 || aoff + proto_len > 2 + list_len {
                        return Err(Error::Framing);
                    }
                    result
                        .alpn_protocols
                        .push(&ext_data[aoff..aoff + proto_len])
                        .map_err(|_| Error::Framing)?;
                    aoff += proto_len;
                }
            }
            EXT_PSK_KEY_EXCHANGE_MODES => {
                if ext_data.is_empty() {
                    return Err(Error::Framing);
                }
                let modes_len = ext_data[0] as usize;
                if 1 + modes_len > ext_data.len() {
                    return Err(Error::Framing);
                }
                if ext_data[1..1 + modes_len].contains(&1) {
                    result.psk_dhe_mode = true;
                }
            }
            EXT_EARLY_DATA => {
                result.early_data = true;
            }
            EXT_PRE_SHARED_KEY => {
                result.pre_shared_key = Some(parse_offered_psk(ext_data)?);
            }
            _ => {
                // Ignore unknown extensions.
            }
        }
    }

    // Absent supported_versions means a pure TLS 1.2 ClientHello.
    if !saw_supported_versions {
        result.supports_tls12 = true;
    }

    Ok(result)
}

/// Parse the first identity and binder out of a pre_shared_key extension.
fn parse_offered_psk(ext_data: &[u8]) -> Result<OfferedPsk<'_>, Error> {
    if ext_data.len() < 2 {
        return Err(Error::Framing);
    }
    let identities_len = u16::from_be_bytes([ext_data[0], ext_data[1]]) as usize;
    if 2 + identities_len + 2 > ext_data.len() {
        return Err(Error::Framing);
    }

    // First identity: identity_len(2) + identity + obfuscated_age(4)
    if identities_len < 2 + 4 {
        return Err(Error::Framing);
    }
    let id_len = u16::from_be_bytes([ext_data[2], ext_data[3]]) as usize;
    if 2 + id_len + 4 > identities_len {
        return Err(Error::Framing);
    }
    let identity = &ext_data[4..4 + id_len];
    let age_off = 4 + id_len;
    let obfuscated_age = u32::from_be_bytes([
        ext_data[age_off],
        ext_data[age_off + 1],
        ext_data[age_off + 2],
        ext_data[age_off + 3],
    ]);

    // Binders list for the first identity.
    let binders_off = 2 + identities_len;
    let binders_len =
        u16::from_be_bytes([ext_data[binders_off], ext_data[binders_off + 1]]) as usize;
    if binders_off + 2 + binders_len > ext_data.len() || binders_len < 1 {
        return Err(Error::Framing);
    }
    let binder_len = ext_data[binders_off + 2] as usize;
    if binder_len != 32 || binders_off + 3 + binder_len > ext_data.len() {
        return Err(Error::Framing);
    }
    let binder = &ext_data[binders_off + 3..binders_off + 3 + binder_len];

    Ok(OfferedPsk {
        identity,
        obfuscated_age,
        binder,
    })
}

/// Parse ServerHello (or HelloRetryRequest) extensions.
pub fn parse_server_hello_extensions(data: &[u8]) -> Result<ServerHelloExtensions<'_>, Error> {
    let mut result = ServerHelloExtensions {
        selected_version: 0,
        key_share: None,
        retry_group: None,
        selected_psk: None,
        alpn: None,
    };

    let mut off = 0;
    while off + 4 <= data.len() {
        let ext_type = get_u16(data, &mut off)?;
        let ext_len = get_u16(data, &mut off)? as usize;

        if off + ext_len > data.len() {
            return Err(Error::Framing);
        }
        let ext_data = &data[off..off + ext_len];
        off += ext_len;

        match ext_type {
            EXT_SUPPORTED_VERSIONS => {
                // ServerHello: just the selected version (2 bytes)
                if ext_data.len() < 2 {
                    return Err(Error::Framing);
                }
                result.selected_version = u16::from_be_bytes([ext_data[0], ext_data[1]]);
            }
            EXT_KEY_SHARE => {
                if ext_data.len() == 2 {
                    // HelloRetryRequest form: just the requested group.
                    result.retry_group =
                        Some(u16::from_be_bytes([ext_data[0], ext_data[1]]));
                } else {
                    // KeyShareEntry: group(2) + key_length(2) + key
                    if ext_data.len() < 4 {
                        return Err(Error::Framing);
                    }
                    let group = u16::from_be_bytes([ext_data[0], ext_data[1]]);
                    let key_len = u16::from_be_bytes([ext_data[2], ext_data[3]]) as usize;
                    if 4 + key_len > ext_data.len() {
                        return Err(Error::Framing);
                    }
                    result.key_share = Some(KeyShareEntry {
                        group,
                        key: &ext_data[4..4 + key_len],
                    });
                }
            }
            EXT_PRE_SHARED_KEY => {
                if ext_data.len() != 2 {
                    return Err(Error::Framing);
                }
                result.selected_psk = Some(u16::from_be_bytes([ext_data[0], ext_data[1]]));
            }
            EXT_ALPN => {
                if ext_data.len() < 3 {
                    return Err(Error::Framing);
                }
                let proto_len = ext_data[2] as usize;
                if 3 + proto_len > ext_data.len() {
                    return Err(Error::Framing);
                }
                result.alpn = Some(&ext_data[3..3 + proto_len]);
            }
            _ => {
                // Ignore unknown extensions in ServerHello
            }
        }
    }

    Ok(result)
}

/// Parse EncryptedExtensions body (already extracted by parse_encrypted_extensions).
pub fn parse_encrypted_extensions_data(data: &[u8]) -> Result<EncryptedExtensionsData<'_>, Error> {
    let mut result = EncryptedExtensionsData {
        alpn: None,
        early_data_accepted: false,
    };

    let mut off = 0;
    while off + 4 <= data.len() {
        let ext_type = get_u16(data, &mut off)?;
        let ext_len = get_u16(data, &mut off)? as usize;

        if off + ext_len > data.len() {
            return Err(Error::Framing);
        }
        let ext_data = &data[off..off + ext_len];
        off += ext_len;

        match ext_type {
            EXT_ALPN => {
                // protocol_name_list: length(2) + entries
                if ext_data.len() < 2 {
                    return Err(Error::Framing);
                }
                let list_len = u16::from_be_bytes([ext_data[0], ext_data[1]]) as usize;
                if 2 + list_len > ext_data.len() {
                    return Err(Error::Framing);
                }
                // Server selects exactly one protocol
                let list = &ext_data[2..2 + list_len];
                if list.is_empty() {
                    return Err(Error::Framing);
                }
                let proto_len = list[0] as usize;
                if 1 + proto_len > list.len() {
                    return Err(Error::Framing);
                }
                result.alpn = Some(&list[1..1 + proto_len]);
            }
            EXT_EARLY_DATA => {
                result.early_data_accepted = true;
            }
            _ => {
                // Ignore unknown extensions
            }
        }
    }

    Ok(result)
}

/// Encode ServerHello extensions for a TLS 1.3 full or resumed handshake.
pub fn encode_server_hello_extensions(
    key_share_group: NamedGroup,
    public_key: &[u8],
    selected_psk: Option<u16>,
    buf: &mut [u8],
) -> Result<usize, Error> {
    let mut off = 0;

    // --- supported_versions ---
    // ServerHello: just the selected version (2 bytes), no list length byte
    put_u16(buf, &mut off, EXT_SUPPORTED_VERSIONS)?;
    put_u16(buf, &mut off, 2)?;
    put_u16(buf, &mut off, VERSION_TLS13)?;

    // --- key_share ---
    let entry_len = 2 + 2 + public_key.len();
    put_u16(buf, &mut off, EXT_KEY_SHARE)?;
    put_u16(buf, &mut off, entry_len as u16)?;
    put_u16(buf, &mut off, key_share_group as u16)?;
    put_u16(buf, &mut off, public_key.len() as u16)?;
    put_bytes(buf, &mut off, public_key)?;

    // --- pre_shared_key: selected identity ---
    if let Some(idx) = selected_psk {
        put_u16(buf, &mut off, EXT_PRE_SHARED_KEY)?;
        put_u16(buf, &mut off, 2)?;
        put_u16(buf, &mut off, idx)?;
    }

    Ok(off)
}

/// Encode HelloRetryRequest extensions: selected version plus the group
/// the client must retry with.
pub fn encode_hello_retry_extensions(
    retry_group: NamedGroup,
    buf: &mut [u8],
) -> Result<usize, Error> {
    let mut off = 0;

    put_u16(buf, &mut off, EXT_SUPPORTED_VERSIONS)?;
    put_u16(buf, &mut off, 2)?;
    put_u16(buf, &mut off, VERSION_TLS13)?;

    put_u16(buf, &mut off, EXT_KEY_SHARE)?;
    put_u16(buf, &mut off, 2)?;
    put_u16(buf, &mut off, retry_group as u16)?;

    Ok(off)
}

/// Encode EncryptedExtensions data for the server.
pub fn encode_encrypted_extensions_data(
    selected_alpn: &[u8],
    early_data_accepted: bool,
    buf: &mut [u8],
) -> Result<usize, Error> {
    let mut off = 0;

    // --- ALPN ---
    if !selected_alpn.is_empty() {
        // Server sends exactly one protocol
        let list_len = 1 + selected_alpn.len();
        put_u16(buf, &mut off, EXT_ALPN)?;
        put_u16(buf, &mut off, (2 + list_len) as u16)?;
        put_u16(buf, &mut off, list_len as u16)?;
        put_bytes(buf, &mut off, &[selected_alpn.len() as u8])?;
        put_bytes(buf, &mut off, selected_alpn)?;
    }

    // --- early_data: acceptance signal ---
    if early_data_accepted {
        put_u16(buf, &mut off, EXT_EARLY_DATA)?;
        put_u16(buf, &mut off, 0)?;
    }

    Ok(off)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client_params<'a>(key: &'a [u8], alpn: &'a [&'a [u8]]) -> ClientHelloParams<'a> {
        ClientHelloParams {
            server_name: "example.com",
            key_share_group: NamedGroup::X25519,
            key_share: key,
            groups: &[NamedGroup::X25519, NamedGroup::Secp256r1],
            alpn,
            offer_tls12: true,
            early_data: false,
        }
    }

    #[test]
    fn encode_parse_client_hello_extensions_roundtrip() {
        let key = [0x42u8; 32];
        let alpn: [&[u8]; 2] = [b"h2", b"http/1.1"];
        let mut buf = [0u8; 1024];
        let len = encode_client_hello_extensions(&client_params(&key, &alpn), &mut buf).unwrap();

        let parsed = parse_client_hello_extensions(&buf[..len]).unwrap();
        assert_eq!(parsed.server_name.unwrap(), b"example.com");
        assert!(parsed.supports_tls13);
        assert!(parsed.supports_tls12);
        assert!(parsed.offers_ed25519);
        assert!(parsed.psk_dhe_mode);
        assert!(!parsed.early_data);
        assert!(parsed.pre_shared_key.is_none());

        let ks = parsed.key_share.unwrap();
        assert_eq!(ks.group, NamedGroup::X25519 as u16);
        assert_eq!(ks.key, &key);

        assert_eq!(parsed.groups.as_slice(), &[0x001d, 0x0017]);
        assert_eq!(parsed.alpn_protocols.len(), 2);
        assert_eq!(parsed.alpn_protocols[0], b"h2");
        assert_eq!(parsed.alpn_protocols[1], b"http/1.1");
    }

    #[test]
    fn no_sni_when_empty() {
        let key = [0x42u8; 32];
        let mut params = client_params(&key, &[]);
        params.server_name = "";
        let mut buf = [0u8; 1024];
        let len = encode_client_hello_extensions(&params, &mut buf).unwrap();

        let parsed = parse_client_hello_extensions(&buf[..len]).unwrap();
        assert!(parsed.server_name.is_none());
        assert!(parsed.alpn_protocols.is_empty());
    }

    #[test]
    fn tls13_only_when_no_fallback() {
        let key = [0x42u8; 32];
        let mut params = client_params(&key, &[]);
        params.offer_tls12 = false;
        let mut buf = [0u8; 1024];
        let len = encode_client_hello_extensions(&params, &mut buf).unwrap();

        let parsed = parse_client_hello_extensions(&buf[..len]).unwrap();
        assert!(parsed.supports_tls13);
        assert!(!parsed.supports_tls12);
    }

    #[test]
    fn legacy_client_hello_is_tls12() {
        // No extensions at all: a TLS 1.2-era ClientHello.
        let parsed = parse_client_hello_extensions(&[]).unwrap();
        assert!(!parsed.supports_tls13);
        assert!(parsed.supports_tls12);
    }

    #[test]
    fn pre_shared_key_roundtrip() {
        let key = [0x42u8; 32];
        let mut buf = [0u8; 1024];
        let len = encode_client_hello_extensions(&client_params(&key, &[]), &mut buf).unwrap();
        let (len, binder_off) =
            append_pre_shared_key_ext(b"ticket-id", 0x11223344, &mut buf, len).unwrap();

        // Patch in a recognizable binder.
        buf[binder_off..binder_off + 32].copy_from_slice(&[0xAB; 32]);

        let parsed = parse_client_hello_extensions(&buf[..len]).unwrap();
        let psk = parsed.pre_shared_key.unwrap();
        assert_eq!(psk.identity, b"ticket-id");
        assert_eq!(psk.obfuscated_age, 0x11223344);
        assert_eq!(psk.binder, &[0xAB; 32]);
    }

    #[test]
    fn extension_after_psk_rejected() {
        let key = [0x42u8; 32];
        let mut buf = [0u8; 1024];
        let len = encode_client_hello_extensions(&client_params(&key, &[]), &mut buf).unwrap();
        let (len, _) = append_pre_shared_key_ext(b"t", 0, &mut buf, len).unwrap();

        // Tack a padding extension (type 21) on after pre_shared_key.
        let mut off = len;
        put_u16(&mut buf, &mut off, 21).unwrap();
        put_u16(&mut buf, &mut off, 0).unwrap();

        assert!(parse_client_hello_extensions(&buf[..off]).is_err());
    }

    #[test]
    fn encode_parse_server_hello_extensions_roundtrip() {
        let public_key = [0xBB; 32];
        let mut buf = [0u8; 256];
        let len =
            encode_server_hello_extensions(NamedGroup::X25519, &public_key, Some(0), &mut buf)
                .unwrap();

        let parsed = parse_server_hello_extensions(&buf[..len]).unwrap();
        assert_eq!(parsed.selected_version, VERSION_TLS13);
        let ks = parsed.key_share.unwrap();
        assert_eq!(ks.group, NamedGroup::X25519 as u16);
        assert_eq!(ks.key, &public_key);
        assert_eq!(parsed.selected_psk, Some(0));
        assert!(parsed.retry_group.is_none());
    }

    #[test]
    fn hello_retry_extensions_carry_group_only() {
        let mut buf = [0u8; 64];
        let len = encode_hello_retry_extensions(NamedGroup::Secp256r1, &mut buf).unwrap();

        let parsed = parse_server_hello_extensions(&buf[..len]).unwrap();
        assert_eq!(parsed.selected_version, VERSION_TLS13);
        assert_eq!(parsed.retry_group, Some(NamedGroup::Secp256r1 as u16));
        assert!(parsed.key_share.is_none());
    }

    #[test]
    fn encode_parse_encrypted_extensions_data_roundtrip() {
        let mut buf = [0u8; 512];
        let len = encode_encrypted_extensions_data(b"h2", true, &mut buf).unwrap();

        let parsed = parse_encrypted_extensions_data(&buf[..len]).unwrap();
        assert_eq!(parsed.alpn.unwrap(), b"h2");
        assert!(parsed.early_data_accepted);
    }

    #[test]
    fn p256_key_share_parses() {
        let mut key = [0u8; 65];
        key[0] = 0x04;
        let params = ClientHelloParams {
            server_name: "",
            key_share_group: NamedGroup::Secp256r1,
            key_share: &key,
            groups: &[NamedGroup::Secp256r1],
            alpn: &[],
            offer_tls12: false,
            early_data: true,
        };
        let mut buf = [0u8; 1024];
        let len = encode_client_hello_extensions(&params, &mut buf).unwrap();

        let parsed = parse_client_hello_extensions(&buf[..len]).unwrap();
        let ks = parsed.key_share.unwrap();
        assert_eq!(ks.group, NamedGroup::Secp256r1 as u16);
        assert_eq!(ks.key.len(), 65);
        assert!(parsed.early_data);
    }
}
