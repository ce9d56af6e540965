//! I/O buffers for TLS connections.
//!
//! The connection core is sans-IO: it never owns large buffers and never
//! touches a socket. [`ConnIo`] borrows the four buffers a connection
//! needs for one call; [`ConnIoBufs`] is an owning wrapper for standalone
//! use (tests, the blocking façade).

use crate::buf::Buf;
use crate::error::Error;

/// Borrowed I/O buffers for a TLS connection.
///
/// `BUF`: buffer capacity. Must be at least 18432 to hold one
/// maximum-size protected record plus its header.
pub struct ConnIo<'a, const BUF: usize> {
    /// Raw record bytes received from the transport.
    pub recv_buf: &'a mut Buf<BUF>,
    /// Record bytes ready to hand to the transport.
    pub send_buf: &'a mut Buf<BUF>,
    /// Decrypted application data received from the peer.
    pub app_recv_buf: &'a mut Buf<BUF>,
    /// Application data queued for protection and sending.
    pub app_send_buf: &'a mut Buf<BUF>,
}

impl<'a, const BUF: usize> ConnIo<'a, BUF> {
    /// Drop `n` consumed bytes from the front of `recv_buf`.
    pub fn drain_recv(&mut self, n: usize) {
        self.recv_buf.copy_within(n.., 0);
        self.recv_buf.truncate(self.recv_buf.len() - n);
    }

    /// Append record bytes to `send_buf`, checking capacity.
    pub fn queue_send(&mut self, data: &[u8]) -> Result<(), Error> {
        if self.send_buf.len() + data.len() > BUF {
            return Err(Error::BufferTooSmall {
                needed: self.send_buf.len() + data.len(),
            });
        }
        let _ = self.send_buf.extend_from_slice(data);
        Ok(())
    }
}

/// Owning I/O buffers for standalone connection use.
pub struct ConnIoBufs<const BUF: usize = 18432> {
    pub recv_buf: Buf<BUF>,
    pub send_buf: Buf<BUF>,
    pub app_recv_buf: Buf<BUF>,
    pub app_send_buf: Buf<BUF>,
}

impl<const BUF: usize> ConnIoBufs<BUF> {
    pub fn new() -> Self {
        Self {
            recv_buf: Buf::new(),
            send_buf: Buf::new(),
            app_recv_buf: Buf::new(),
            app_send_buf: Buf::new(),
        }
    }

    /// Borrow all four buffers as a [`ConnIo`].
    pub fn as_io(&mut self) -> ConnIo<'_, BUF> {
        ConnIo {
            recv_buf: &mut self.recv_buf,
            send_buf: &mut self.send_buf,
            app_recv_buf: &mut self.app_recv_buf,
            app_send_buf: &mut self.app_send_buf,
        }
    }
}

impl<const BUF: usize> Default for ConnIoBufs<BUF> {
    fn default() -> Self {
        Self::new()
    }
}
