//! Blocking TLS stream for std environments.
//!
//! [`TlsStream`] wraps the sans-IO [`Connection`] around any
//! [`Transport`]. The handshake runs lazily on the first read or write
//! (or explicitly via [`TlsStream::handshake`]), guarded so that exactly
//! one thread drives it while others wait. After completion, reads and
//! writes take separate locks and may proceed from different threads;
//! concurrent reads (or concurrent writes) on the same direction are
//! serialized.
//!
//! Deadlines are absolute [`Instant`]s checked at every record I/O
//! boundary. A timed-out read can be retried; a timed-out write poisons
//! the write direction, because a record may have left partially and the
//! AEAD stream cannot be resynchronized.

use core::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};
use std::vec::Vec;

use crate::crypto::Hkdf;
use crate::error::Error;
use crate::tls::engine::{Config, EngineRandom, ResumptionData};

use super::connection::Connection;
use super::io::ConnIoBufs;

/// Ordered, reliable byte-stream transport.
///
/// Methods take `&self` so one transport can serve a reader and a writer
/// thread at once, matching [`std::net::TcpStream`].
pub trait Transport {
    /// Receive some bytes, blocking no later than `deadline`.
    /// `Ok(0)` means the peer closed the transport.
    fn recv(&self, buf: &mut [u8], deadline: Option<Instant>) -> Result<usize, Error>;

    /// Send all of `data`, blocking no later than `deadline`.
    fn send_all(&self, data: &[u8], deadline: Option<Instant>) -> Result<(), Error>;

    /// Best-effort shutdown of both directions.
    fn shutdown(&self);
}

/// Time left until `deadline`, or [`Error::Timeout`] if it has passed.
fn time_left(deadline: Option<Instant>) -> Result<Option<Duration>, Error> {
    match deadline {
        None => Ok(None),
        Some(d) => {
            let now = Instant::now();
            if now >= d {
                return Err(Error::Timeout);
            }
            Ok(Some(d - now))
        }
    }
}

impl Transport for std::net::TcpStream {
    fn recv(&self, buf: &mut [u8], deadline: Option<Instant>) -> Result<usize, Error> {
        use std::io::Read;
        let timeout = time_left(deadline)?;
        if self.set_read_timeout(timeout).is_err() {
            return Err(Error::Closed);
        }
        let mut r: &std::net::TcpStream = self;
        match r.read(buf) {
            Ok(n) => Ok(n),
            Err(e)
                if matches!(
                    e.kind(),
                    std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                ) =>
            {
                Err(Error::Timeout)
            }
            Err(_) => Err(Error::Closed),
        }
    }

    fn send_all(&self, data: &[u8], deadline: Option<Instant>) -> Result<(), Error> {
        use std::io::Write;
        let timeout = time_left(deadline)?;
        if self.set_write_timeout(timeout).is_err() {
            return Err(Error::Closed);
        }
        let mut w: &std::net::TcpStream = self;
        match w.write_all(data) {
            Ok(()) => Ok(()),
            Err(e)
                if matches!(
                    e.kind(),
                    std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                ) =>
            {
                Err(Error::Timeout)
            }
            Err(_) => Err(Error::Closed),
        }
    }

    fn shutdown(&self) {
        let _ = std::net::TcpStream::shutdown(self, std::net::Shutdown::Both);
    }
}

// Handshake state token, read via atomic fast path.
const HS_NOT_STARTED: u8 = 0;
const HS_IN_PROGRESS: u8 = 1;
const HS_DONE: u8 = 2;
const HS_FAILED: u8 = 3;

struct Inner<'a, H: Hkdf + Default, const BUF: usize> {
    conn: Connection<'a, H>,
    bufs: ConnIoBufs<BUF>,
}

/// Blocking TLS stream over a [`Transport`].
pub struct TlsStream<'a, T: Transport, H: Hkdf + Default, const BUF: usize = 18432> {
    transport: T,
    inner: Mutex<Inner<'a, H, BUF>>,
    hs_state: AtomicU8,
    hs_lock: Mutex<()>,
    hs_error: Mutex<Option<Error>>,
    read_lock: Mutex<()>,
    write_lock: Mutex<()>,
    tx_lock: Mutex<()>,
    write_poisoned: AtomicBool,
    closed: AtomicBool,
}

/// Recover the data even if a panicking thread poisoned the mutex; every
/// guarded value is a state machine that fails closed on bad input.
fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

impl<'a, T: Transport, H: Hkdf + Default, const BUF: usize> TlsStream<'a, T, H, BUF> {
    pub fn new(transport: T, config: Config<'a>, random: EngineRandom) -> Result<Self, Error> {
        let conn = Connection::new(config, random)?;
        Ok(Self {
            transport,
            inner: Mutex::new(Inner {
                conn,
                bufs: ConnIoBufs::new(),
            }),
            hs_state: AtomicU8::new(HS_NOT_STARTED),
            hs_lock: Mutex::new(()),
            hs_error: Mutex::new(None),
            read_lock: Mutex::new(()),
            write_lock: Mutex::new(()),
            tx_lock: Mutex::new(()),
            write_poisoned: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        })
    }

    /// Run the handshake to completion. Safe to call from any number of
    /// threads; one drives, the rest wait on the lock and then return.
    pub fn handshake(&self, deadline: Option<Instant>) -> Result<(), Error> {
        if self.hs_state.load(Ordering::Acquire) == HS_DONE {
            return Ok(());
        }
        let _guard = lock(&self.hs_lock);
        match self.hs_state.load(Ordering::Acquire) {
            HS_DONE => return Ok(()),
            HS_FAILED => return Err(lock(&self.hs_error).unwrap_or(Error::Closed)),
            _ => {}
        }
        self.hs_state.store(HS_IN_PROGRESS, Ordering::Release);
        match self.drive_handshake(deadline) {
            Ok(()) => {
                self.hs_state.store(HS_DONE, Ordering::Release);
                Ok(())
            }
            Err(e) => {
                *lock(&self.hs_error) = Some(e);
                self.hs_state.store(HS_FAILED, Ordering::Release);
                Err(e)
            }
        }
    }

    fn drive_handshake(&self, deadline: Option<Instant>) -> Result<(), Error> {
        loop {
            self.flush_output(deadline)?;
            if lock(&self.inner).conn.is_active() {
                return Ok(());
            }
            let mut buf = [0u8; 4096];
            let n = self.transport.recv(&mut buf, deadline)?;
            if n == 0 {
                lock(&self.inner).conn.transport_eof()?;
                return Err(Error::Closed);
            }
            let inner = &mut *lock(&self.inner);
            let Inner { conn, bufs } = inner;
            conn.feed_data(&mut bufs.as_io(), &buf[..n])?;
        }
    }

    /// Read decrypted application data, handshaking first if needed.
    /// `Ok(0)` means the peer closed the connection cleanly.
    pub fn read(&self, buf: &mut [u8], deadline: Option<Instant>) -> Result<usize, Error> {
        self.handshake(deadline)?;
        let _guard = lock(&self.read_lock);
        loop {
            {
                let inner = &mut *lock(&self.inner);
                let Inner { conn, bufs } = inner;
                match conn.recv_app_data(&mut bufs.as_io(), buf) {
                    Ok(n) => return Ok(n),
                    Err(Error::WouldBlock) => {}
                    Err(Error::Closed) => return Ok(0),
                    Err(e) => return Err(e),
                }
            }
            let mut rec = [0u8; 4096];
            let n = self.transport.recv(&mut rec, deadline)?;
            if n == 0 {
                let clean = lock(&self.inner).conn.transport_eof().is_ok();
                if clean {
                    return Ok(0);
                }
                return Err(Error::Truncated);
            }
            {
                let inner = &mut *lock(&self.inner);
                let Inner { conn, bufs } = inner;
                conn.feed_data(&mut bufs.as_io(), &rec[..n])?;
            }
            // Feeding can queue responses (KeyUpdate reply, alerts).
            self.flush_output(deadline)?;
        }
    }

    /// Encrypt and send application data, handshaking first if needed.
    pub fn write(&self, data: &[u8], deadline: Option<Instant>) -> Result<usize, Error> {
        self.handshake(deadline)?;
        if self.write_poisoned.load(Ordering::Acquire) {
            return Err(Error::Timeout);
        }
        let _guard = lock(&self.write_lock);
        let n = {
            let inner = &mut *lock(&self.inner);
            let Inner { conn, bufs } = inner;
            conn.send_app_data(&mut bufs.as_io(), data)?
        };
        self.flush_output(deadline)?;
        Ok(n)
    }

    /// Update our write keys, optionally asking the peer to update theirs.
    pub fn key_update(&self, request_peer: bool, deadline: Option<Instant>) -> Result<(), Error> {
        self.handshake(deadline)?;
        if self.write_poisoned.load(Ordering::Acquire) {
            return Err(Error::Timeout);
        }
        let _guard = lock(&self.write_lock);
        {
            let inner = &mut *lock(&self.inner);
            let Inner { conn, bufs } = inner;
            conn.request_key_update(&mut bufs.as_io(), request_peer)?;
        }
        self.flush_output(deadline)
    }

    /// Send close_notify and shut the transport down. Idempotent and safe
    /// to call concurrently with reads and writes.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        {
            let inner = &mut *lock(&self.inner);
            let Inner { conn, bufs } = inner;
            let _ = conn.close(&mut bufs.as_io());
        }
        let _ = self.flush_output(None);
        self.transport.shutdown();
    }

    /// The negotiated ALPN protocol, once the handshake is done.
    pub fn alpn(&self) -> Option<Vec<u8>> {
        lock(&self.inner).conn.alpn().map(|p| p.to_vec())
    }

    /// Resumption data from the most recent session ticket.
    pub fn take_resumption(&self) -> Option<ResumptionData> {
        lock(&self.inner).conn.take_resumption()
    }

    pub fn is_active(&self) -> bool {
        self.hs_state.load(Ordering::Acquire) == HS_DONE
    }

    fn flush_output(&self, deadline: Option<Instant>) -> Result<(), Error> {
        // Records must hit the transport in the order they were popped.
        // Holding the transmit lock across pop + send keeps two flushing
        // threads (say a writer and a reader answering a KeyUpdate) from
        // interleaving their chunks on the wire.
        let _tx = lock(&self.tx_lock);
        loop {
            let mut out = [0u8; 4096];
            let n = {
                let inner = &mut *lock(&self.inner);
                let Inner { conn, bufs } = inner;
                match conn.poll_output(&mut bufs.as_io(), &mut out) {
                    Some(data) => data.len(),
                    None => return Ok(()),
                }
            };
            match self.transport.send_all(&out[..n], deadline) {
                Ok(()) => {}
                Err(Error::Timeout) => {
                    // A record may have left partially; the write
                    // direction cannot be resynchronized.
                    self.write_poisoned.store(true, Ordering::Release);
                    return Err(Error::Timeout);
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(all(test, feature = "rustcrypto-aes"))]
mod tests {
    use std::boxed::Box;
    use std::collections::VecDeque;
    use std::sync::{Arc, Condvar};
    use std::vec::Vec;

    use super::*;
    use crate::crypto::rustcrypto::HkdfSha256;
    use crate::crypto::sign::{build_ed25519_cert_der, ed25519_public_key_from_seed};
    use crate::crypto::kex::NamedGroup;
    use crate::tls::messages::CipherSuite;
    use crate::tls::engine::Role;
    use crate::tls::verify::PinnedCertVerifier;

    const SIGNING_SEED: [u8; 32] = [0x42; 32];
    const NOW: u64 = 1_700_000_000;

    static SUITES: [CipherSuite; 1] = [CipherSuite::TlsAes128GcmSha256];
    static GROUPS: [NamedGroup; 1] = [NamedGroup::X25519];
    static ALPN: [&[u8]; 1] = [b"echo/1"];

    // In-memory duplex pipe with EOF and deadline support.
    struct Channel {
        state: Mutex<ChannelState>,
        cond: Condvar,
    }

    #[derive(Default)]
    struct ChannelState {
        data: VecDeque<u8>,
        eof: bool,
    }

    struct PipeEnd {
        rx: Arc<Channel>,
        tx: Arc<Channel>,
    }

    fn pipe() -> (PipeEnd, PipeEnd) {
        let a = Arc::new(Channel {
            state: Mutex::new(ChannelState::default()),
            cond: Condvar::new(),
        });
        let b = Arc::new(Channel {
            state: Mutex::new(ChannelState::default()),
            cond: Condvar::new(),
        });
        (
            PipeEnd {
                rx: a.clone(),
                tx: b.clone(),
            },
            PipeEnd { rx: b, tx: a },
        )
    }

    impl Transport for PipeEnd {
        fn recv(&self, buf: &mut [u8], deadline: Option<Instant>) -> Result<usize, Error> {
            let mut state = lock(&self.rx.state);
            loop {
                if !state.data.is_empty() {
                    let n = buf.len().min(state.data.len());
                    for slot in buf[..n].iter_mut() {
                        *slot = state.data.pop_front().unwrap();
                    }
                    return Ok(n);
                }
                if state.eof {
                    return Ok(0);
                }
                match time_left(deadline)? {
                    None => state = self.rx.cond.wait(state).unwrap(),
                    Some(left) => {
                        let (guard, timeout) = self.rx.cond.wait_timeout(state, left).unwrap();
                        state = guard;
                        if timeout.timed_out() && state.data.is_empty() && !state.eof {
                            return Err(Error::Timeout);
                        }
                    }
                }
            }
        }

        fn send_all(&self, data: &[u8], _deadline: Option<Instant>) -> Result<(), Error> {
            let mut state = lock(&self.tx.state);
            if state.eof {
                return Err(Error::Closed);
            }
            state.data.extend(data.iter().copied());
            self.tx.cond.notify_all();
            Ok(())
        }

        fn shutdown(&self) {
            lock(&self.tx.state).eof = true;
            self.tx.cond.notify_all();
            lock(&self.rx.state).eof = true;
            self.rx.cond.notify_all();
        }
    }

    fn test_cert() -> (&'static [u8], &'static PinnedCertVerifier) {
        let pubkey = ed25519_public_key_from_seed(&SIGNING_SEED);
        let mut buf = [0u8; 512];
        let len = build_ed25519_cert_der(&pubkey, &mut buf).unwrap();
        let cert: &'static [u8] = buf[..len].to_vec().leak();
        let verifier = Box::leak(Box::new(PinnedCertVerifier::new(cert)));
        (cert, verifier)
    }

    fn rnd(tag: u8) -> EngineRandom {
        EngineRandom {
            hello_random: [tag; 32],
            session_id: [tag.wrapping_add(1); 32],
            key_share_seed: [tag.wrapping_add(2); 32],
            retry_key_share_seed: [tag.wrapping_add(3); 32],
            ticket_seed: [tag.wrapping_add(4); 32],
        }
    }

    fn client_config(verifier: &'static PinnedCertVerifier) -> Config<'static> {
        Config {
            role: Role::Client,
            server_name: "test.local",
            alpn: &ALPN,
            suites: &SUITES,
            groups: &GROUPS,
            cert_der: &[],
            signing_seed: None,
            verifier: Some(verifier),
            ticket_keys: None,
            tickets_to_send: 0,
            offer_tls12: true,
            now: NOW,
            resume: None,
            early_data: false,
            max_early_data: 0,
        }
    }

    fn server_config(cert: &'static [u8]) -> Config<'static> {
        Config {
            role: Role::Server,
            server_name: "",
            alpn: &ALPN,
            suites: &SUITES,
            groups: &GROUPS,
            cert_der: cert,
            signing_seed: Some(&SIGNING_SEED),
            verifier: None,
            ticket_keys: None,
            tickets_to_send: 0,
            offer_tls12: true,
            now: NOW,
            resume: None,
            early_data: false,
            max_early_data: 0,
        }
    }

    type TestStream = TlsStream<'static, PipeEnd, HkdfSha256>;

    #[test]
    fn echo_over_pipe() {
        let (cert, verifier) = test_cert();
        let (client_end, server_end) = pipe();

        let server = TestStream::new(server_end, server_config(cert), rnd(0xCC)).unwrap();
        let handle = std::thread::spawn(move || {
            // Lazy handshake: the first read drives it.
            let mut buf = [0u8; 256];
            let n = server.read(&mut buf, None).unwrap();
            server.write(&buf[..n], None).unwrap();
            let fin = server.read(&mut buf, None).unwrap();
            assert_eq!(fin, 0, "expected clean close from client");
            server.close();
        });

        let client = TestStream::new(client_end, client_config(verifier), rnd(0xAA)).unwrap();
        client.handshake(None).unwrap();
        assert!(client.is_active());
        assert_eq!(client.alpn().as_deref(), Some(b"echo/1".as_slice()));

        client.write(b"ping over tls", None).unwrap();
        let mut buf = [0u8; 256];
        let mut echoed = Vec::new();
        while echoed.len() < 13 {
            let n = client.read(&mut buf, None).unwrap();
            assert!(n > 0);
            echoed.extend_from_slice(&buf[..n]);
        }
        assert_eq!(&echoed, b"ping over tls");

        client.close();
        client.close();
        handle.join().unwrap();
    }

    #[test]
    fn key_updates_interleaved_with_writes_keep_record_order() {
        let (cert, verifier) = test_cert();
        let (client_end, server_end) = pipe();

        // The server asks the client to rekey every few chunks, so the
        // client's reader thread flushes KeyUpdate replies while its
        // writer thread is flushing application records.
        let server = TestStream::new(server_end, server_config(cert), rnd(0xCC)).unwrap();
        let handle = std::thread::spawn(move || {
            let mut buf = [0u8; 512];
            let mut received = 0usize;
            let mut chunks = 0usize;
            while received < 256 {
                let n = server.read(&mut buf, None).unwrap();
                assert!(n > 0);
                server.write(&buf[..n], None).unwrap();
                received += n;
                chunks += 1;
                if chunks % 3 == 0 {
                    server.key_update(true, None).unwrap();
                }
            }
            let fin = server.read(&mut buf, None).unwrap();
            assert_eq!(fin, 0, "expected clean close from client");
            server.close();
        });

        let client = Arc::new(
            TestStream::new(client_end, client_config(verifier), rnd(0xAA)).unwrap(),
        );
        client.handshake(None).unwrap();

        let writer = {
            let client = Arc::clone(&client);
            std::thread::spawn(move || {
                let msg = [0x5A; 16];
                for _ in 0..16 {
                    client.write(&msg, None).unwrap();
                }
            })
        };

        let mut buf = [0u8; 512];
        let mut echoed = 0usize;
        while echoed < 256 {
            let n = client.read(&mut buf, None).unwrap();
            assert!(n > 0);
            assert!(buf[..n].iter().all(|&b| b == 0x5A));
            echoed += n;
        }
        writer.join().unwrap();
        client.close();
        handle.join().unwrap();
    }

    #[test]
    fn read_deadline_expires() {
        let (cert, verifier) = test_cert();
        let (client_end, server_end) = pipe();

        let server = TestStream::new(server_end, server_config(cert), rnd(0xCC)).unwrap();
        let handle = std::thread::spawn(move || {
            server.handshake(None).unwrap();
            // Send nothing; let the client's read time out.
            let mut buf = [0u8; 64];
            let _ = server.read(&mut buf, None);
        });

        let client = TestStream::new(client_end, client_config(verifier), rnd(0xAA)).unwrap();
        client.handshake(None).unwrap();

        let mut buf = [0u8; 64];
        let deadline = Instant::now() + Duration::from_millis(50);
        assert_eq!(client.read(&mut buf, Some(deadline)), Err(Error::Timeout));

        // Read timeouts are retryable and do not poison writes.
        client.write(b"still writable", None).unwrap();
        client.close();
        handle.join().unwrap();
    }

    #[test]
    fn abrupt_shutdown_is_truncation() {
        let (cert, verifier) = test_cert();
        let (client_end, server_end) = pipe();

        let server = TestStream::new(server_end, server_config(cert), rnd(0xCC)).unwrap();
        let handle = std::thread::spawn(move || {
            server.handshake(None).unwrap();
            // Kill the transport without close_notify.
            server.transport.shutdown();
        });

        let client = TestStream::new(client_end, client_config(verifier), rnd(0xAA)).unwrap();
        client.handshake(None).unwrap();
        handle.join().unwrap();

        let mut buf = [0u8; 64];
        assert_eq!(client.read(&mut buf, None), Err(Error::Truncated));
    }
}
