//! Ephemeral Diffie-Hellman key exchange for the handshake.
//!
//! Supports the X25519 and secp256r1 named groups. Key pairs are derived
//! deterministically from a caller-supplied 32-byte seed; the crate itself
//! never touches an entropy source.

use crate::error::Error;

/// Maximum encoded public key length (uncompressed SEC1 P-256 point).
pub const MAX_PUBKEY_LEN: usize = 65;

/// Supported named groups (RFC 8446 section 4.2.7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NamedGroup {
    Secp256r1 = 0x0017,
    X25519 = 0x001d,
}

impl NamedGroup {
    pub fn from_u16(v: u16) -> Option<Self> {
        match v {
            0x0017 => Some(NamedGroup::Secp256r1),
            0x001d => Some(NamedGroup::X25519),
            _ => None,
        }
    }

    /// Encoded public key length for this group.
    pub fn pubkey_len(self) -> usize {
        match self {
            NamedGroup::X25519 => 32,
            NamedGroup::Secp256r1 => 65,
        }
    }
}

/// An ephemeral key pair for one named group.
///
/// Holds the private scalar; dropped state is wiped via the underlying
/// dalek/p256 types, and the raw seed is not retained.
pub enum KeyPair {
    X25519(x25519_dalek::StaticSecret),
    Secp256r1(p256::SecretKey),
}

impl KeyPair {
    /// Derive a key pair deterministically from a 32-byte seed.
    ///
    /// For secp256r1 the seed is rejected in the (negligible-probability)
    /// case it does not reduce to a valid non-zero scalar.
    pub fn from_seed(group: NamedGroup, seed: &[u8; 32]) -> Result<Self, Error> {
        match group {
            NamedGroup::X25519 => Ok(KeyPair::X25519(x25519_dalek::StaticSecret::from(*seed))),
            NamedGroup::Secp256r1 => {
                let sk = p256::SecretKey::from_slice(seed).map_err(|_| Error::Crypto)?;
                Ok(KeyPair::Secp256r1(sk))
            }
        }
    }

    pub fn group(&self) -> NamedGroup {
        match self {
            KeyPair::X25519(_) => NamedGroup::X25519,
            KeyPair::Secp256r1(_) => NamedGroup::Secp256r1,
        }
    }

    /// Encode the public key into `out` (key_share wire format for the group).
    ///
    /// X25519: 32 raw bytes. secp256r1: 65-byte uncompressed SEC1 point.
    pub fn public_key(&self, out: &mut [u8]) -> Result<usize, Error> {
        match self {
            KeyPair::X25519(secret) => {
                if out.len() < 32 {
                    return Err(Error::BufferTooSmall { needed: 32 });
                }
                let public = x25519_dalek::PublicKey::from(secret);
                out[..32].copy_from_slice(public.as_bytes());
                Ok(32)
            }
            KeyPair::Secp256r1(secret) => {
                use p256::elliptic_curve::sec1::ToEncodedPoint;
                if out.len() < 65 {
                    return Err(Error::BufferTooSmall { needed: 65 });
                }
                let point = secret.public_key().to_encoded_point(false);
                let bytes = point.as_bytes();
                out[..bytes.len()].copy_from_slice(bytes);
                Ok(bytes.len())
            }
        }
    }

    /// Compute the ECDH shared secret with the peer's encoded public key.
    ///
    /// Returns the 32-byte shared secret (the x-coordinate for secp256r1).
    pub fn shared_secret(&self, peer_public: &[u8]) -> Result<[u8; 32], Error> {
        match self {
            KeyPair::X25519(secret) => {
                if peer_public.len() != 32 {
                    return Err(Error::Framing);
                }
                let mut peer = [0u8; 32];
                peer.copy_from_slice(peer_public);
                let peer = x25519_dalek::PublicKey::from(peer);
                let shared = secret.diffie_hellman(&peer);
                // An all-zero output means the peer sent a low-order point.
                if shared.as_bytes().iter().all(|&b| b == 0) {
                    return Err(Error::Crypto);
                }
                Ok(*shared.as_bytes())
            }
            KeyPair::Secp256r1(secret) => {
                let peer =
                    p256::PublicKey::from_sec1_bytes(peer_public).map_err(|_| Error::Framing)?;
                let shared =
                    p256::ecdh::diffie_hellman(secret.to_nonzero_scalar(), peer.as_affine());
                let mut out = [0u8; 32];
                out.copy_from_slice(shared.raw_secret_bytes());
                Ok(out)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn x25519_agreement() {
        let a = KeyPair::from_seed(NamedGroup::X25519, &[0x11; 32]).unwrap();
        let b = KeyPair::from_seed(NamedGroup::X25519, &[0x22; 32]).unwrap();

        let mut a_pub = [0u8; MAX_PUBKEY_LEN];
        let mut b_pub = [0u8; MAX_PUBKEY_LEN];
        let a_len = a.public_key(&mut a_pub).unwrap();
        let b_len = b.public_key(&mut b_pub).unwrap();
        assert_eq!(a_len, 32);
        assert_eq!(b_len, 32);

        let s1 = a.shared_secret(&b_pub[..b_len]).unwrap();
        let s2 = b.shared_secret(&a_pub[..a_len]).unwrap();
        assert_eq!(s1, s2);
    }

    #[test]
    fn p256_agreement() {
        let a = KeyPair::from_seed(NamedGroup::Secp256r1, &[0x11; 32]).unwrap();
        let b = KeyPair::from_seed(NamedGroup::Secp256r1, &[0x22; 32]).unwrap();

        let mut a_pub = [0u8; MAX_PUBKEY_LEN];
        let mut b_pub = [0u8; MAX_PUBKEY_LEN];
        let a_len = a.public_key(&mut a_pub).unwrap();
        let b_len = b.public_key(&mut b_pub).unwrap();
        assert_eq!(a_len, 65);
        assert_eq!(a_pub[0], 0x04);

        let s1 = a.shared_secret(&b_pub[..b_len]).unwrap();
        let s2 = b.shared_secret(&a_pub[..a_len]).unwrap();
        assert_eq!(s1, s2);
    }

    #[test]
    fn x25519_rejects_low_order_point() {
        let a = KeyPair::from_seed(NamedGroup::X25519, &[0x11; 32]).unwrap();
        // The identity element.
        let zero = [0u8; 32];
        assert!(a.shared_secret(&zero).is_err());
    }

    #[test]
    fn p256_rejects_garbage_point() {
        let a = KeyPair::from_seed(NamedGroup::Secp256r1, &[0x11; 32]).unwrap();
        let garbage = [0xffu8; 65];
        assert!(a.shared_secret(&garbage).is_err());
    }

    #[test]
    fn group_codes() {
        assert_eq!(NamedGroup::from_u16(0x001d), Some(NamedGroup::X25519));
        assert_eq!(NamedGroup::from_u16(0x0017), Some(NamedGroup::Secp256r1));
        assert_eq!(NamedGroup::from_u16(0x0100), None);
    }
}
