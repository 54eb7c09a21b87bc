//! Availability probe.
//!
//! One well-behaved GET rides alongside the attack pool and answers a single
//! question: does the target still serve normal clients? At most one probe is
//! outstanding. Every `interval` seconds a fresh one is spawned; any response
//! byte marks the service available and disposes it, while `timeout` seconds
//! of silence marks the service DoSed. The verdict feeds the per-second
//! statistics only, never the run's termination.

use std::net::SocketAddr;

use bytes::Bytes;
use tracing::{debug, error, info};

use super::connection::{Connection, RecvOutcome, SendKind};
use super::transport::TransportKind;

/// Poll token reserved for the probe connection.
pub const PROBE_TOKEN: mio::Token = mio::Token(usize::MAX - 1);

pub struct ProbeMonitor {
    request: Bytes,
    transport: TransportKind,
    addrs: Vec<SocketAddr>,
    interval: u64,
    timeout: u64,
    outstanding: Option<Connection>,
    /// Elapsed second of the last spawn; gates one probe per second and
    /// anchors the timeout.
    last_spawn: Option<u64>,
    dosed: bool,
    probes_sent: u64,
    probes_answered: u64,
}

impl ProbeMonitor {
    pub fn new(
        request: Bytes,
        transport: TransportKind,
        addrs: Vec<SocketAddr>,
        interval: u64,
        timeout: u64,
    ) -> Self {
        ProbeMonitor {
            request,
            transport,
            addrs,
            interval: interval.max(1),
            timeout: timeout.max(1),
            outstanding: None,
            last_spawn: None,
            dosed: false,
            probes_sent: 0,
            probes_answered: 0,
        }
    }

    /// Service verdict as of the last completed probe. Starts available.
    pub fn service_available(&self) -> bool {
        !self.dosed
    }

    pub fn probes_sent(&self) -> u64 {
        self.probes_sent
    }

    pub fn probes_answered(&self) -> u64 {
        self.probes_answered
    }

    /// The live probe connection, for poll registration and dispatch.
    pub fn connection_mut(&mut self) -> Option<&mut Connection> {
        self.outstanding.as_mut()
    }

    pub fn connection(&self) -> Option<&Connection> {
        self.outstanding.as_ref()
    }

    /// Once-per-tick lifecycle: spawn a probe when one is due, or expire the
    /// outstanding one when it has been silent past the timeout.
    pub fn tick(&mut self, elapsed: u64) {
        if self.outstanding.is_none()
            && self.last_spawn != Some(elapsed)
            && elapsed % self.interval == 0
        {
            self.spawn(elapsed);
        } else if let Some(spawned) = self.last_spawn {
            if self.outstanding.is_some() && elapsed - spawned >= self.timeout {
                info!(elapsed, "probe timed out, service looks DoSed");
                self.dosed = true;
                self.dispose();
            }
        }
    }

    fn spawn(&mut self, elapsed: u64) {
        // Success or not, this second has had its attempt; the next one waits
        // for the next interval boundary.
        self.last_spawn = Some(elapsed);
        for addr in &self.addrs {
            match Connection::connect(PROBE_TOKEN.0, *addr, &self.transport, None, 0, None) {
                Ok(conn) => {
                    debug!(elapsed, peer = %addr, "probe connection created");
                    self.outstanding = Some(conn);
                    self.probes_sent += 1;
                    return;
                }
                Err(e) => {
                    debug!(peer = %addr, error = %e, "probe connect failed, trying next address");
                }
            }
        }
        error!("unable to initialize probe connection");
    }

    /// Drains one read. Any byte is a verdict: the service answered.
    pub fn handle_readable(&mut self, scratch: &mut [u8]) {
        let Some(conn) = self.outstanding.as_mut() else {
            return;
        };
        match conn.recv_slow(scratch) {
            Ok(RecvOutcome::Data(n)) => {
                debug!(n, "probe replied, service available");
                self.dosed = false;
                self.probes_answered += 1;
                self.dispose();
            }
            Ok(RecvOutcome::Eof) => {
                // Closed without a byte; keep it until the timeout decides.
                debug!("probe closed by peer before replying");
            }
            Ok(RecvOutcome::Blocked) => {}
            Err(e) => {
                debug!(error = %e, "probe receive failed, service looks DoSed");
                self.dosed = true;
                self.dispose();
            }
        }
    }

    /// Pushes the probe request; errors here are a verdict too.
    pub fn handle_writable(&mut self) {
        let request = self.request.clone();
        let Some(conn) = self.outstanding.as_mut() else {
            return;
        };
        let result = if conn.has_pending_send() {
            conn.resume_send()
        } else if conn.requests_owed() {
            conn.send_slow(&request, SendKind::Initial)
        } else {
            return;
        };
        if let Err(e) = result {
            debug!(error = %e, "probe send failed, service looks DoSed");
            self.dosed = true;
            self.dispose();
        }
    }

    fn dispose(&mut self) {
        if let Some(mut conn) = self.outstanding.take() {
            conn.close();
        }
    }

    /// Teardown hook. Closes whatever probe is still in flight.
    pub fn shutdown(&mut self) {
        self.dispose();
    }
}
