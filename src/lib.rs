//! TLS 1.2/1.3 connection core for constrained environments.
//!
//! Sans-IO by construction: the handshake engine and connection state
//! machines never touch a socket, never allocate unbounded memory, and
//! take all randomness as explicit inputs. Three façades wrap the core:
//!
//! - [`conn::Connection`] — record-layer connection over an ordered byte
//!   stream, driven by `feed_data` / `poll_output` / `poll_event`.
//! - [`conn::sync::TlsStream`] (std) — blocking stream with deadlines.
//! - [`quic::QuicHandshake`] — handshake-only pump for a QUIC transport
//!   that does its own packet protection.

#![cfg_attr(not(feature = "std"), no_std)]
#![forbid(unsafe_code)]

#[cfg(any(test, feature = "std"))]
extern crate std;

#[cfg(feature = "alloc")]
extern crate alloc;

pub mod buf;
pub mod crypto;
pub mod error;
pub mod tls;

#[cfg(any(feature = "rustcrypto-aes", feature = "rustcrypto-chacha"))]
pub mod conn;

pub mod quic;

pub use error::Error;
pub use tls::ProtocolVersion;

#[cfg(any(feature = "rustcrypto-aes", feature = "rustcrypto-chacha"))]
pub use conn::{Connection, ConnIo, ConnIoBufs, TlsEvent};

pub use quic::{QuicEvent, QuicHandshake};

pub use tls::engine::{Config, Engine, EngineRandom, ResumptionData, Role, SessionInfo};
