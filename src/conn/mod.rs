//! TLS connections over ordered byte-stream transports.
//!
//! [`connection::Connection`] is the sans-IO core; [`sync`] (std only)
//! wraps it in a blocking byte-stream façade over any [`sync::Transport`].

pub mod connection;
pub mod io;
#[cfg(feature = "std")]
pub mod sync;

pub use connection::{Connection, TlsEvent};
pub use io::{ConnIo, ConnIoBufs};
#[cfg(feature = "std")]
pub use sync::{TlsStream, Transport};
