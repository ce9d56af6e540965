use crate::tls::alert::AlertDescription;

/// Top-level crate error.
///
/// Fatal categories transition the connection to `Closed` and are surfaced
/// to every waiting caller; non-fatal conditions (`WouldBlock`, warning
/// alerts, early-data rejection) are absorbed by the connection and never
/// reach a caller through this enum's fatal arms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Malformed record or handshake framing.
    Framing,
    /// AEAD tag or Finished-MAC mismatch. Always fatal. Deliberately shares
    /// its Display text with [`Error::Framing`] so a peer probing ciphertexts
    /// cannot distinguish auth failure from framing failure.
    Auth,
    /// Illegal state transition, unsupported version/suite, or a peer
    /// violation mapped to the alert we send for it.
    Protocol(AlertDescription),
    /// Certificate chain rejected by the verifier collaborator.
    Certificate,
    /// I/O deadline exceeded. The write direction becomes unusable.
    Timeout,
    /// Transport EOF without close_notify.
    Truncated,
    /// Connection is closed.
    Closed,
    /// Would block — no data available right now.
    WouldBlock,
    /// Caller-provided or internal buffer too small.
    BufferTooSmall { needed: usize },
    /// Cryptographic operation failed (bad key length, provider error).
    Crypto,
    /// Invalid state for the requested operation.
    InvalidState,
}

impl Error {
    /// Whether this error is fatal to the connection.
    pub fn is_fatal(self) -> bool {
        !matches!(
            self,
            Error::WouldBlock | Error::BufferTooSmall { .. } | Error::InvalidState
        )
    }

    /// The alert description we send to the peer for this error, if any.
    pub fn alert(self) -> Option<AlertDescription> {
        match self {
            Error::Framing | Error::Auth => Some(AlertDescription::BadRecordMac),
            Error::Protocol(desc) => Some(desc),
            Error::Certificate => Some(AlertDescription::BadCertificate),
            Error::Crypto => Some(AlertDescription::InternalError),
            _ => None,
        }
    }
}

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            // Framing and Auth share one message — see Auth's doc comment.
            Error::Framing | Error::Auth => write!(f, "invalid record"),
            Error::Protocol(desc) => write!(f, "protocol error: {desc:?}"),
            Error::Certificate => write!(f, "certificate verification failed"),
            Error::Timeout => write!(f, "i/o deadline exceeded"),
            Error::Truncated => write!(f, "peer closed transport without close_notify"),
            Error::Closed => write!(f, "connection closed"),
            Error::WouldBlock => write!(f, "would block"),
            Error::BufferTooSmall { needed } => {
                write!(f, "buffer too small, need {needed} bytes")
            }
            Error::Crypto => write!(f, "cryptographic error"),
            Error::InvalidState => write!(f, "invalid state"),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for Error {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::format;

    #[test]
    fn auth_and_framing_are_indistinguishable() {
        assert_eq!(format!("{}", Error::Auth), format!("{}", Error::Framing));
        assert_eq!(Error::Auth.alert(), Error::Framing.alert());
    }

    #[test]
    fn fatal_classification() {
        assert!(Error::Auth.is_fatal());
        assert!(Error::Truncated.is_fatal());
        assert!(Error::Timeout.is_fatal());
        assert!(!Error::WouldBlock.is_fatal());
        assert!(!Error::BufferTooSmall { needed: 1 }.is_fatal());
    }
}
