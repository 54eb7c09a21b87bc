//! Attack connection state machine.
//!
//! Every pooled connection walks the same path:
//!
//! ```text
//!      +------+     connect()      +------------+
//!      | Init |------------------->| Connecting |--(refused/error)--> Error
//!      +------+                    +-----+------+
//!                                        | initial send fully flushed
//!                                        v
//!                                  +-----------+
//!                                  | Connected |--(error)--> Error
//!                                  +-----+-----+
//!                                        | EOF or shutdown
//!                                        v
//!                                     Closed
//! ```
//!
//! `Error` and `Closed` are absorbing. Sends are resumable: a short write
//! latches the remainder with its offset, and owed-request accounting only
//! settles when the latched buffer flushes completely. The peer decides how
//! slowly it drains us, and we never give it more than it asks for.

use std::io;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use bytes::Bytes;
use mio::Interest;
use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, trace};

use super::transport::{HandshakeProgress, Transport, TransportKind};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ConnState {
    #[default]
    Init,
    Connecting,
    Connected,
    /// Failed with a socket or TLS error (terminal).
    Error,
    /// Shut down orderly (terminal).
    Closed,
}

impl ConnState {
    /// Live connections occupy a pool slot and may get poll interest.
    pub fn is_live(&self) -> bool {
        !self.is_terminal()
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ConnState::Error | ConnState::Closed)
    }
}

impl std::fmt::Display for ConnState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConnState::Init => "Init",
            ConnState::Connecting => "Connecting",
            ConnState::Connected => "Connected",
            ConnState::Error => "Error",
            ConnState::Closed => "Closed",
        };
        f.write_str(s)
    }
}

/// What a send settles when it flushes completely.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SendKind {
    /// The request template; completion promotes the connection.
    Initial,
    /// One follow-up fragment; completion decrements the owed counter.
    FollowUp,
}

/// Outcome of one send attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SendProgress {
    /// Everything flushed and accounting settled.
    Complete,
    /// Partial progress or would block; call again when writable.
    Blocked,
}

/// Outcome of one receive attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecvOutcome {
    Data(usize),
    Blocked,
    /// Orderly EOF from the peer; the connection is now Closed.
    Eof,
}

struct PendingSend {
    buf: Bytes,
    offset: usize,
    kind: SendKind,
}

/// One slow connection to the target.
pub struct Connection {
    /// Pool slot, stable for this connection's lifetime.
    id: usize,
    transport: Box<dyn Transport>,
    peer: SocketAddr,
    state: ConnState,
    /// Initial request not yet fully sent.
    requests_owed: bool,
    follow_ups_owed: u64,
    pending_send: Option<PendingSend>,
    /// Elapsed second in which the last follow-up was dispatched.
    last_follow_up_second: Option<u64>,
    last_read_at: Option<Instant>,
    /// `Some` only in SlowRead mode; zero means "read whenever readable".
    read_interval: Option<Duration>,
    started_at: Instant,
    connected_at: Option<Instant>,
    stopped_at: Option<Instant>,
    bytes_in: u64,
    bytes_out: u64,
    /// Interest currently registered with the poll, if any.
    pub(crate) registered: Option<Interest>,
    /// Tick-local readiness, set from poll events, consumed by dispatch.
    pub(crate) ready_read: bool,
    pub(crate) ready_write: bool,
}

impl Connection {
    /// Starts a non-blocking connect to `addr` and wraps the socket in the
    /// chosen transport. `recv_window` is applied before the connect so the
    /// kernel advertises it from the SYN onwards.
    pub fn connect(
        id: usize,
        addr: SocketAddr,
        kind: &TransportKind,
        recv_window: Option<usize>,
        follow_ups_owed: u64,
        read_interval: Option<Duration>,
    ) -> io::Result<Self> {
        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
        if let Some(window) = recv_window {
            socket.set_recv_buffer_size(window)?;
        }
        socket.set_nonblocking(true)?;
        match socket.connect(&addr.into()) {
            Ok(()) => {}
            Err(e)
                if e.raw_os_error() == Some(libc::EINPROGRESS)
                    || e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => return Err(e),
        }

        let stream = mio::net::TcpStream::from_std(socket.into());
        let transport = kind.create(stream)?;

        trace!(conn = id, peer = %addr, "connect started");
        Ok(Connection {
            id,
            transport,
            peer: addr,
            state: ConnState::Connecting,
            requests_owed: true,
            follow_ups_owed,
            pending_send: None,
            last_follow_up_second: None,
            last_read_at: None,
            read_interval,
            started_at: Instant::now(),
            connected_at: None,
            stopped_at: None,
            bytes_in: 0,
            bytes_out: 0,
            registered: None,
            ready_read: false,
            ready_write: false,
        })
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    pub fn requests_owed(&self) -> bool {
        self.requests_owed
    }

    pub fn follow_ups_owed(&self) -> u64 {
        self.follow_ups_owed
    }

    pub fn has_pending_send(&self) -> bool {
        self.pending_send.is_some()
    }

    /// Remaining bytes of the latched partial send.
    pub fn pending_len(&self) -> usize {
        self.pending_send
            .as_ref()
            .map(|p| p.buf.len() - p.offset)
            .unwrap_or(0)
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_in
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_out
    }

    pub fn lifetime(&self) -> Option<Duration> {
        self.stopped_at.map(|t| t.duration_since(self.started_at))
    }

    /// The stream handed to poll registration.
    pub fn socket_mut(&mut self) -> &mut mio::net::TcpStream {
        self.transport.socket_mut()
    }

    // ------------------------------------------------------------------
    // State transitions
    // ------------------------------------------------------------------

    /// Monotonic transition. Entering a terminal state records the stop
    /// time; attempts to leave a terminal state are ignored.
    pub fn set_state(&mut self, next: ConnState) {
        if self.state == next || self.state.is_terminal() {
            return;
        }
        trace!(conn = self.id, from = %self.state, to = %next, "state change");
        self.state = next;
        match next {
            ConnState::Connected => self.connected_at = Some(Instant::now()),
            ConnState::Error | ConnState::Closed => self.stopped_at = Some(Instant::now()),
            _ => {}
        }
    }

    fn fail(&mut self, err: &io::Error) {
        debug!(conn = self.id, peer = %self.peer, error = %err, "connection error");
        self.set_state(ConnState::Error);
    }

    /// Idempotent teardown: shuts the socket down, clears owed accounting,
    /// and records Closed unless the connection already failed.
    pub fn close(&mut self) {
        if self.state == ConnState::Closed {
            return;
        }
        self.transport.shutdown();
        self.requests_owed = false;
        self.follow_ups_owed = 0;
        self.pending_send = None;
        if self.stopped_at.is_none() {
            self.stopped_at = Some(Instant::now());
        }
        self.set_state(ConnState::Closed);
        if let Some(lifetime) = self.lifetime() {
            debug!(conn = self.id, peer = %self.peer,
                   lifetime_ms = lifetime.as_millis() as u64,
                   rx = self.bytes_in, tx = self.bytes_out, "closed");
        }
    }

    // ------------------------------------------------------------------
    // Interest
    // ------------------------------------------------------------------

    /// SlowRead gating: with no interval every readable moment is taken;
    /// the first read is always due; afterwards a read is due only once
    /// strictly more than the interval has passed.
    pub fn is_ready_to_read(&self, now: Instant) -> bool {
        read_due(self.read_interval, self.last_read_at, now)
    }

    /// True when this connection owes a follow-up fragment this second.
    pub fn follow_up_due(&self, elapsed: u64, interval: u64) -> bool {
        self.follow_ups_owed > 0
            && elapsed > 0
            && elapsed % interval == 0
            && self.last_follow_up_second != Some(elapsed)
    }

    pub fn note_follow_up_dispatched(&mut self, elapsed: u64) {
        self.last_follow_up_second = Some(elapsed);
    }

    /// Folds one poll event into this tick's readiness. Some poll backends
    /// deliver read and write readiness for one socket as separate events in
    /// the same batch, so the flags accumulate until dispatch clears them.
    pub fn note_ready(&mut self, readable: bool, writable: bool) {
        self.ready_read |= readable;
        self.ready_write |= writable;
    }

    /// This tick's accumulated `(read, write)` readiness.
    pub fn ready(&self) -> (bool, bool) {
        (self.ready_read, self.ready_write)
    }

    /// Computes this tick's poll interest, or `None` to stay parked.
    pub fn interest(&self, now: Instant, elapsed: u64, follow_up_interval: u64) -> Option<Interest> {
        if !self.state.is_live() {
            return None;
        }
        let (want_read, want_write) = if self.transport.is_handshaking() {
            // rustls queues the ClientHello at construction, so a fresh TLS
            // connection starts out wanting write.
            (true, self.transport.wants_write())
        } else {
            let read = self.is_ready_to_read(now);
            let write = self.pending_send.is_some()
                || self.requests_owed
                || self.follow_up_due(elapsed, follow_up_interval)
                || self.transport.wants_write();
            (read, write)
        };
        match (want_read, want_write) {
            (true, true) => Some(Interest::READABLE | Interest::WRITABLE),
            (true, false) => Some(Interest::READABLE),
            (false, true) => Some(Interest::WRITABLE),
            (false, false) => None,
        }
    }

    // ------------------------------------------------------------------
    // I/O
    // ------------------------------------------------------------------

    /// Resumable send. With no latch in place the payload is latched at
    /// offset zero; either way the latched buffer is pushed as far as the
    /// socket allows. Accounting settles only on a complete flush: an
    /// Initial send clears the owed-request flag and promotes a Connecting
    /// connection to Connected, a FollowUp decrements the owed counter.
    ///
    /// During a TLS handshake this drives the handshake instead; the
    /// payload stays owed.
    pub fn send_slow(&mut self, payload: &Bytes, kind: SendKind) -> io::Result<SendProgress> {
        if self.transport.is_handshaking() {
            return self.drive_handshake();
        }
        if self.pending_send.is_none() {
            self.pending_send = Some(PendingSend {
                buf: payload.clone(),
                offset: 0,
                kind,
            });
        }
        self.flush_pending()
    }

    /// Continues a latched partial send without supplying a new payload.
    pub fn resume_send(&mut self) -> io::Result<SendProgress> {
        if self.transport.is_handshaking() {
            return self.drive_handshake();
        }
        self.flush_pending()
    }

    fn flush_pending(&mut self) -> io::Result<SendProgress> {
        let Some(pending) = self.pending_send.as_mut() else {
            return Ok(SendProgress::Complete);
        };
        loop {
            match self.transport.write(&pending.buf[pending.offset..]) {
                Ok(0) => {
                    let err = io::Error::new(io::ErrorKind::WriteZero, "peer stopped accepting");
                    self.fail(&err);
                    return Err(err);
                }
                Ok(n) => {
                    self.bytes_out += n as u64;
                    pending.offset += n;
                    if pending.offset < pending.buf.len() {
                        trace!(conn = self.id, sent = n,
                               remaining = pending.buf.len() - pending.offset,
                               "partial send");
                        return Ok(SendProgress::Blocked);
                    }
                    let kind = pending.kind;
                    self.pending_send = None;
                    self.settle_send(kind);
                    return Ok(SendProgress::Complete);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(SendProgress::Blocked)
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.fail(&e);
                    return Err(e);
                }
            }
        }
    }

    fn settle_send(&mut self, kind: SendKind) {
        match kind {
            SendKind::Initial => {
                self.requests_owed = false;
                if self.state == ConnState::Connecting || self.state == ConnState::Init {
                    self.set_state(ConnState::Connected);
                }
            }
            SendKind::FollowUp => {
                self.follow_ups_owed = self.follow_ups_owed.saturating_sub(1);
                trace!(conn = self.id, remaining = self.follow_ups_owed, "follow-up sent");
            }
        }
    }

    /// Reads once into `buf`. Data is counted and discarded by the caller;
    /// zero bytes is an orderly EOF and closes the connection.
    pub fn recv_slow(&mut self, buf: &mut [u8]) -> io::Result<RecvOutcome> {
        if self.transport.is_handshaking() {
            self.drive_handshake()?;
            return Ok(RecvOutcome::Blocked);
        }
        loop {
            match self.transport.read(buf) {
                Ok(0) => {
                    self.close();
                    return Ok(RecvOutcome::Eof);
                }
                Ok(n) => {
                    self.bytes_in += n as u64;
                    self.last_read_at = Some(Instant::now());
                    trace!(conn = self.id, n, "received");
                    return Ok(RecvOutcome::Data(n));
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(RecvOutcome::Blocked)
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.fail(&e);
                    return Err(e);
                }
            }
        }
    }

    fn drive_handshake(&mut self) -> io::Result<SendProgress> {
        match self.transport.handshake() {
            Ok(HandshakeProgress::Done) => {
                trace!(conn = self.id, "TLS handshake complete");
                // The initial request is still owed; the write interest the
                // owed flag produces picks it up from here.
                Ok(SendProgress::Blocked)
            }
            Ok(_) => Ok(SendProgress::Blocked),
            Err(e) => {
                self.fail(&e);
                Err(e)
            }
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("state", &self.state)
            .field("requests_owed", &self.requests_owed)
            .field("follow_ups_owed", &self.follow_ups_owed)
            .field("pending", &self.pending_len())
            .finish()
    }
}

/// Pure form of the SlowRead read gate, shared with the tests.
pub fn read_due(interval: Option<Duration>, last_read: Option<Instant>, now: Instant) -> bool {
    let Some(interval) = interval else {
        return true;
    };
    if interval.is_zero() {
        return true;
    }
    match last_read {
        None => true,
        Some(last) => now.duration_since(last) > interval,
    }
}

// NOTE: Inline unit tests have been moved to the crate-level `tests/` directory.
// See: `crates/treacle-engine/tests/connection_tests.rs`
//
// Tests are kept out of library source files to centralize integration tests.
// This file intentionally does not contain an inline `#[cfg(test)]` module.
