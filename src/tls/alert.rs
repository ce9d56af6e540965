//! TLS alert protocol (RFC 8446 section 6).

use crate::error::Error;

/// TLS alert levels. TLS 1.3 deprecates the level field but it is still
/// carried on the wire (and meaningful for TLS 1.2 peers).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AlertLevel {
    Warning = 1,
    Fatal = 2,
}

impl AlertLevel {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(Self::Warning),
            2 => Some(Self::Fatal),
            _ => None,
        }
    }
}

/// TLS alert description codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AlertDescription {
    CloseNotify = 0,
    UnexpectedMessage = 10,
    BadRecordMac = 20,
    DecryptionFailed = 21,
    RecordOverflow = 22,
    HandshakeFailure = 40,
    BadCertificate = 42,
    CertificateExpired = 45,
    CertificateUnknown = 46,
    IllegalParameter = 47,
    UnknownCa = 48,
    DecodeError = 50,
    DecryptError = 51,
    ProtocolVersion = 70,
    InsufficientSecurity = 71,
    InternalError = 80,
    UserCanceled = 90,
    MissingExtension = 109,
    UnsupportedExtension = 110,
    NoApplicationProtocol = 120,
}

impl AlertDescription {
    /// Convert from a raw u8 byte.
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::CloseNotify),
            10 => Some(Self::UnexpectedMessage),
            20 => Some(Self::BadRecordMac),
            21 => Some(Self::DecryptionFailed),
            22 => Some(Self::RecordOverflow),
            40 => Some(Self::HandshakeFailure),
            42 => Some(Self::BadCertificate),
            45 => Some(Self::CertificateExpired),
            46 => Some(Self::CertificateUnknown),
            47 => Some(Self::IllegalParameter),
            48 => Some(Self::UnknownCa),
            50 => Some(Self::DecodeError),
            51 => Some(Self::DecryptError),
            70 => Some(Self::ProtocolVersion),
            71 => Some(Self::InsufficientSecurity),
            80 => Some(Self::InternalError),
            90 => Some(Self::UserCanceled),
            109 => Some(Self::MissingExtension),
            110 => Some(Self::UnsupportedExtension),
            120 => Some(Self::NoApplicationProtocol),
            _ => None,
        }
    }

    /// Convert to raw u8 byte.
    pub fn to_u8(self) -> u8 {
        self as u8
    }
}

/// A decoded alert message (level + description).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Alert {
    pub level: AlertLevel,
    pub description: AlertDescription,
}

impl Alert {
    pub fn fatal(description: AlertDescription) -> Self {
        Alert {
            level: AlertLevel::Fatal,
            description,
        }
    }

    pub fn close_notify() -> Self {
        Alert {
            level: AlertLevel::Warning,
            description: AlertDescription::CloseNotify,
        }
    }

    /// Whether receiving this alert terminates the connection.
    ///
    /// close_notify ends the read direction but is not an error;
    /// user_canceled is purely advisory. Everything else is treated as
    /// fatal regardless of the level byte, per RFC 8446 section 6.
    pub fn is_fatal(self) -> bool {
        !matches!(
            self.description,
            AlertDescription::CloseNotify | AlertDescription::UserCanceled
        )
    }

    /// Decode an alert from a 2-byte payload.
    pub fn decode(data: &[u8]) -> Result<Self, Error> {
        if data.len() != 2 {
            return Err(Error::Framing);
        }
        let level = AlertLevel::from_u8(data[0]).ok_or(Error::Framing)?;
        let description = AlertDescription::from_u8(data[1]).ok_or(Error::Framing)?;
        Ok(Alert { level, description })
    }

    /// Encode this alert as its 2-byte payload.
    pub fn encode(self) -> [u8; 2] {
        [self.level as u8, self.description.to_u8()]
    }
}
