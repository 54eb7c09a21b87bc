//! Single-threaded event loop driving the whole test.
//!
//! One thread owns the pool, the probe, the poll instance, and every
//! counter; the only shared state is the injected cancellation flag. Each
//! tick walks the same sequence:
//!
//! 1. recompute elapsed seconds
//! 2. probe lifecycle
//! 3. ramp-up (at most one new connection per tick)
//! 4. reap terminal connections, take the census, rebuild poll interest
//! 5. per-second statistics and the 5-second heartbeat
//! 6. termination matrix, first match wins
//! 7. poll (0 ms while ramping, 1 s afterwards)
//! 8. dispatch: every readable connection before any writable one,
//!    both phases in pool order
//!
//! The loop never blocks on any single connection: every socket is
//! non-blocking, and progress on one never requires progress on another.

use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use bytes::Bytes;
use mio::{Events, Poll, Token};
use rustls::pki_types::ServerName;
use tracing::{debug, error, info, warn};
use treacle_common::{AttackMode, ProxyMode, TestConfig};

use super::connection::{ConnState, Connection, SendKind};
use super::probe::{ProbeMonitor, PROBE_TOKEN};
use super::transport::TransportKind;
use crate::error::SetupError;
use crate::fdlimit;
use crate::report::{self, StatsDumper, StatusSample};
use crate::request::{self, RequestSet, FollowUpPattern};
use crate::target::{self, ProxyEndpoint, TargetUrl};
use crate::textgen::TextGenerator;

/// Matches the largest response chunk worth draining in one read.
const RECV_SCRATCH: usize = 65537;

/// Why a run ended. Every run ends with exactly one of these.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExitStatus {
    TimeLimit,
    AllClosed,
    HostNotAlive,
    ConnectionRefused,
    CancelledByUser,
    UnexpectedError,
}

impl ExitStatus {
    pub fn message(self) -> &'static str {
        match self {
            ExitStatus::TimeLimit => "Hit test time limit",
            ExitStatus::AllClosed => "No open connections left",
            ExitStatus::HostNotAlive => "Cannot establish connection",
            ExitStatus::ConnectionRefused => "Connection refused",
            ExitStatus::CancelledByUser => "Cancelled by user",
            ExitStatus::UnexpectedError => "Unexpected error",
        }
    }
}

impl std::fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.message())
    }
}

/// Tick-local connection-state tally. `closed` and `errored` are cumulative
/// over the run; the live states count what the pool holds right now.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PoolCensus {
    pub init: usize,
    pub connecting: usize,
    pub connected: usize,
    pub errored: usize,
    pub closed: usize,
}

impl PoolCensus {
    /// Connections still occupying a pool slot.
    pub fn active(&self) -> usize {
        self.init + self.connecting + self.connected
    }
}

/// Termination matrix. Evaluated once per tick on that tick's census;
/// the first matching arm decides the run.
pub fn evaluate_exit(
    cancelled: bool,
    elapsed: u64,
    duration: u64,
    follow_up_interval: u64,
    census: &PoolCensus,
    ever_connected: bool,
) -> Option<ExitStatus> {
    if cancelled {
        return Some(ExitStatus::CancelledByUser);
    }
    if elapsed > duration {
        return Some(ExitStatus::TimeLimit);
    }
    if census.active() == 0 && !ever_connected {
        return Some(ExitStatus::ConnectionRefused);
    }
    if census.active() == 0 {
        return Some(ExitStatus::AllClosed);
    }
    if elapsed > follow_up_interval
        && !ever_connected
        && census.connecting > 0
        && census.closed == 0
    {
        return Some(ExitStatus::HostNotAlive);
    }
    None
}

/// Arena of connections with stable slot ids. Ids double as poll tokens;
/// a freed slot is reused only after its connection is gone, so a token
/// seen from the poll either resolves to the right connection or to
/// nothing at all.
pub struct ConnectionPool {
    slots: Vec<Option<Connection>>,
    free: Vec<usize>,
}

impl ConnectionPool {
    pub fn with_capacity(cap: usize) -> Self {
        ConnectionPool {
            slots: Vec::with_capacity(cap),
            free: Vec::new(),
        }
    }

    /// Reserves a slot and builds the connection knowing its id. The slot
    /// goes back on the free list when the builder fails.
    pub fn insert_with<F>(&mut self, build: F) -> io::Result<usize>
    where
        F: FnOnce(usize) -> io::Result<Connection>,
    {
        let id = match self.free.pop() {
            Some(id) => id,
            None => {
                self.slots.push(None);
                self.slots.len() - 1
            }
        };
        match build(id) {
            Ok(conn) => {
                self.slots[id] = Some(conn);
                Ok(id)
            }
            Err(e) => {
                self.free.push(id);
                Err(e)
            }
        }
    }

    pub fn get_mut(&mut self, id: usize) -> Option<&mut Connection> {
        self.slots.get_mut(id).and_then(|s| s.as_mut())
    }

    pub fn remove(&mut self, id: usize) -> Option<Connection> {
        let conn = self.slots.get_mut(id).and_then(|s| s.take());
        if conn.is_some() {
            self.free.push(id);
        }
        conn
    }

    /// Occupied slot ids in pool order.
    pub fn ids(&self) -> Vec<usize> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.as_ref().map(|_| i))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// What the run amounted to, for the final summary and the exit code.
#[derive(Debug)]
pub struct RunSummary {
    pub status: ExitStatus,
    pub seconds: u64,
    pub launched: usize,
    pub ever_connected: bool,
    pub closed: usize,
    pub errored: usize,
    pub probes_sent: u64,
    pub probes_answered: u64,
    pub report_paths: Vec<PathBuf>,
}

/// Owns one complete test run: setup, the event loop, teardown.
pub struct TestRunner {
    config: TestConfig,
    cancel: Arc<AtomicBool>,
}

impl TestRunner {
    pub fn new(config: TestConfig) -> Self {
        TestRunner {
            config,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Flag observed once per tick; setting it ends the run with
    /// `CancelledByUser` ahead of every other condition.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    pub fn run(self) -> Result<RunSummary, SetupError> {
        let config = &self.config;
        config.validate()?;

        let target = TargetUrl::parse(&config.url)?;
        if target.is_tls() && config.proxy.mode != ProxyMode::None {
            return Err(SetupError::TlsOverProxy);
        }
        if matches!(
            config.proxy.mode,
            ProxyMode::Tunnel | ProxyMode::Socks4 | ProxyMode::Socks5
        ) {
            return Err(SetupError::ProxyUnsupported(config.proxy.mode));
        }

        // Attack traffic goes to the HTTP proxy when one is configured,
        // straight to the target otherwise. The probe follows the attack
        // path except in probe-proxy mode, where only it is diverted.
        let attack_addrs = match (config.proxy.mode, config.proxy.address.as_deref()) {
            (ProxyMode::Http, Some(raw)) => {
                let proxy = ProxyEndpoint::parse(raw)?;
                resolve_endpoint(&proxy.host, proxy.port)?
            }
            _ => resolve_endpoint(&target.host, target.port)?,
        };
        let probe_addrs = match (config.proxy.mode, config.proxy.probe_address.as_deref()) {
            (ProxyMode::Probe, Some(raw)) => {
                let proxy = ProxyEndpoint::parse(raw)?;
                resolve_endpoint(&proxy.host, proxy.port)?
            }
            _ => attack_addrs.clone(),
        };

        let attack_kind = if target.is_tls() {
            let server_name = ServerName::try_from(target.host.clone())
                .map_err(|_| SetupError::TlsServerName(target.host.clone()))?;
            TransportKind::Tls { server_name }
        } else {
            TransportKind::Plain
        };
        let probe_kind = if config.proxy.mode == ProxyMode::None {
            attack_kind.clone()
        } else {
            TransportKind::Plain
        };

        let target_count = fdlimit::apply_fd_budget(config.connections);

        let mut gen = TextGenerator::new();
        let requests = request::build(config, &target, &mut gen);
        let dumpers = report::build_dumpers(config, &target.absolute(), target_count)?;
        let probe = ProbeMonitor::new(
            requests.probe.clone(),
            probe_kind,
            probe_addrs,
            config.probe.interval,
            config.probe.timeout,
        );

        let poll = Poll::new().map_err(SetupError::Poll)?;
        let events = Events::with_capacity((target_count + 8).min(4096));

        info!(
            target = %target,
            mode = %config.mode,
            verb = config.effective_verb(),
            connections = target_count,
            rate = config.rate,
            duration_secs = config.duration,
            follow_up_interval_secs = config.follow_up_interval,
            probe_interval_secs = config.probe.interval,
            "starting slow HTTP test"
        );
        if config.mode == AttackMode::SlowRead {
            info!(
                window_lower = config.slow_read.window_lower,
                window_upper = config.slow_read.window_upper,
                read_len = config.slow_read.read_len,
                read_interval_secs = config.slow_read.read_interval,
                pipeline_factor = config.slow_read.pipeline_factor,
                "slow read parameters"
            );
        }

        let slow_read = config.mode == AttackMode::SlowRead;
        let mut scheduler = Scheduler {
            cancel: Arc::clone(&self.cancel),
            poll,
            events,
            pool: ConnectionPool::with_capacity(target_count),
            probe,
            requests,
            gen,
            attack_kind,
            attack_addrs,
            dumpers,
            scratch: vec![0u8; RECV_SCRATCH],
            duration: config.duration,
            follow_up_interval: config.follow_up_interval,
            follow_ups_per_conn: config.follow_ups_owed(),
            token_len: config.max_random_len,
            rate: config.rate as u64,
            read_len: slow_read.then_some(config.slow_read.read_len),
            read_interval: slow_read
                .then(|| Duration::from_secs(config.slow_read.read_interval)),
            window_bounds: slow_read
                .then_some((config.slow_read.window_lower, config.slow_read.window_upper)),
            target_count,
            launched: 0,
            ever_connected: false,
            closed_total: 0,
            errored_total: 0,
            last_stats: None,
            last_heartbeat: None,
            started: Instant::now(),
        };

        let (status, seconds) = scheduler.run_loop();

        // Teardown: every open connection is closed before we return.
        for id in scheduler.pool.ids() {
            if let Some(conn) = scheduler.pool.get_mut(id) {
                conn.close();
            }
        }
        scheduler.probe.shutdown();
        let mut report_paths = Vec::new();
        for dumper in scheduler.dumpers.iter_mut() {
            match dumper.close() {
                Ok(()) => {
                    info!(path = %dumper.path().display(), "report saved");
                    report_paths.push(dumper.path().to_path_buf());
                }
                Err(e) => warn!(
                    path = %dumper.path().display(),
                    error = %e,
                    "cannot finish report file"
                ),
            }
        }
        info!(seconds, status = %status, "test ended");

        Ok(RunSummary {
            status,
            seconds,
            launched: scheduler.launched,
            ever_connected: scheduler.ever_connected,
            closed: scheduler.closed_total,
            errored: scheduler.errored_total,
            probes_sent: scheduler.probe.probes_sent(),
            probes_answered: scheduler.probe.probes_answered(),
            report_paths,
        })
    }
}

fn resolve_endpoint(host: &str, port: u16) -> Result<Vec<SocketAddr>, SetupError> {
    target::resolve(host, port).map_err(|source| SetupError::Resolve {
        host: host.to_string(),
        source,
    })
}

struct Scheduler {
    cancel: Arc<AtomicBool>,
    poll: Poll,
    events: Events,
    pool: ConnectionPool,
    probe: ProbeMonitor,
    requests: RequestSet,
    gen: TextGenerator,
    attack_kind: TransportKind,
    attack_addrs: Vec<SocketAddr>,
    dumpers: Vec<Box<dyn StatsDumper>>,
    scratch: Vec<u8>,
    duration: u64,
    follow_up_interval: u64,
    follow_ups_per_conn: u64,
    token_len: usize,
    rate: u64,
    read_len: Option<usize>,
    read_interval: Option<Duration>,
    window_bounds: Option<(usize, usize)>,
    target_count: usize,
    launched: usize,
    ever_connected: bool,
    closed_total: usize,
    errored_total: usize,
    last_stats: Option<u64>,
    last_heartbeat: Option<u64>,
    started: Instant,
}

impl Scheduler {
    fn run_loop(&mut self) -> (ExitStatus, u64) {
        loop {
            let now = Instant::now();
            let elapsed = now.duration_since(self.started).as_secs();

            self.probe.tick(elapsed);

            if self.launched < self.target_count {
                self.launch_one();
            }

            let census = self.reap_and_arm(now, elapsed);
            self.periodic_output(elapsed, &census);

            if let Some(status) = evaluate_exit(
                self.cancel.load(Ordering::Relaxed),
                elapsed,
                self.duration,
                self.follow_up_interval,
                &census,
                self.ever_connected,
            ) {
                return (status, elapsed);
            }

            // Zero timeout keeps the ramp-up moving; one second otherwise.
            let timeout = if self.launched < self.target_count {
                Duration::ZERO
            } else {
                Duration::from_millis(1000)
            };
            if let Err(e) = self.poll.poll(&mut self.events, Some(timeout)) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                error!(error = %e, "poll failed");
                return (ExitStatus::UnexpectedError, elapsed);
            }

            self.mark_ready();
            self.read_phase();
            self.write_phase(elapsed);

            if self.launched < self.target_count {
                // Fixed-delay pacing, one connection per sleep. This
                // approximates the configured rate; it does not account for
                // time spent in the tick itself.
                thread::sleep(Duration::from_micros(1_000_000 / self.rate));
            }
        }
    }

    /// One ramp-up step. A connection that cannot even be created shrinks
    /// the target to what is already launched; refusals that surface later
    /// go through the state machine instead.
    fn launch_one(&mut self) {
        let Scheduler {
            pool,
            gen,
            attack_kind,
            attack_addrs,
            window_bounds,
            read_interval,
            follow_ups_per_conn,
            ..
        } = self;
        let window = window_bounds.map(|(lower, upper)| gen.window(lower, upper));
        let owed = *follow_ups_per_conn;
        let read_interval = *read_interval;
        let result = pool.insert_with(|id| {
            let mut last_err = None;
            for addr in attack_addrs.iter() {
                match Connection::connect(id, *addr, attack_kind, window, owed, read_interval) {
                    Ok(conn) => return Ok(conn),
                    Err(e) => last_err = Some(e),
                }
            }
            Err(last_err.unwrap_or_else(|| {
                io::Error::new(io::ErrorKind::AddrNotAvailable, "no candidate addresses")
            }))
        });
        match result {
            Ok(id) => {
                self.launched += 1;
                debug!(conn = id, launched = self.launched, "connection launched");
            }
            Err(e) => {
                error!(
                    error = %e,
                    launched = self.launched,
                    "cannot initialize connection, stopping ramp-up"
                );
                self.target_count = self.launched;
            }
        }
    }

    /// Removes terminal connections, tallies the census, and synchronizes
    /// poll registrations with each connection's interest for this tick.
    fn reap_and_arm(&mut self, now: Instant, elapsed: u64) -> PoolCensus {
        let mut census = PoolCensus::default();
        let registry = self.poll.registry();

        for id in self.pool.ids() {
            let Some(conn) = self.pool.get_mut(id) else {
                continue;
            };
            if conn.state().is_terminal() {
                if conn.registered.is_some() {
                    let _ = registry.deregister(conn.socket_mut());
                }
                let state = conn.state();
                self.pool.remove(id);
                match state {
                    ConnState::Error => self.errored_total += 1,
                    _ => self.closed_total += 1,
                }
                continue;
            }

            match conn.state() {
                ConnState::Init => census.init += 1,
                ConnState::Connecting => census.connecting += 1,
                ConnState::Connected => {
                    census.connected += 1;
                    self.ever_connected = true;
                }
                _ => {}
            }

            conn.ready_read = false;
            conn.ready_write = false;
            let desired = conn.interest(now, elapsed, self.follow_up_interval);
            if conn.follow_up_due(elapsed, self.follow_up_interval) {
                // The second is consumed at arm time; dispatch rechecks only
                // the interval so a slow poll cannot double-send.
                conn.note_follow_up_dispatched(elapsed);
            }
            let sync = match (conn.registered, desired) {
                (None, Some(want)) => registry.register(conn.socket_mut(), Token(id), want),
                // Reregistering every tick re-arms the edge, so readiness
                // that was not fully drained is reported again.
                (Some(_), Some(want)) => registry.reregister(conn.socket_mut(), Token(id), want),
                (Some(_), None) => registry.deregister(conn.socket_mut()),
                (None, None) => Ok(()),
            };
            match sync {
                Ok(()) => conn.registered = desired,
                Err(e) => {
                    warn!(conn = id, error = %e, "poll registration failed");
                    conn.set_state(ConnState::Error);
                }
            }
        }

        if let Some(conn) = self.probe.connection_mut() {
            conn.ready_read = false;
            conn.ready_write = false;
            let desired = conn.interest(now, elapsed, self.follow_up_interval);
            let sync = match (conn.registered, desired) {
                (None, Some(want)) => registry.register(conn.socket_mut(), PROBE_TOKEN, want),
                (Some(_), Some(want)) => {
                    registry.reregister(conn.socket_mut(), PROBE_TOKEN, want)
                }
                (Some(_), None) => registry.deregister(conn.socket_mut()),
                (None, None) => Ok(()),
            };
            match sync {
                Ok(()) => conn.registered = desired,
                Err(e) => warn!(error = %e, "probe poll registration failed"),
            }
        }

        census.closed = self.closed_total;
        census.errored = self.errored_total;
        census
    }

    fn periodic_output(&mut self, elapsed: u64, census: &PoolCensus) {
        if !self.dumpers.is_empty() && self.last_stats != Some(elapsed) {
            let sample = StatusSample {
                seconds: elapsed,
                closed: census.closed,
                pending: census.connecting,
                connected: census.connected,
                service_available: self.probe.service_available(),
            };
            for dumper in self.dumpers.iter_mut() {
                if let Err(e) = dumper.write_sample(&sample) {
                    warn!(path = %dumper.path().display(), error = %e, "cannot write sample");
                }
            }
            self.last_stats = Some(elapsed);
        }

        if elapsed % 5 == 0 && self.last_heartbeat != Some(elapsed) {
            info!(
                elapsed,
                initializing = census.init,
                pending = census.connecting,
                connected = census.connected,
                errored = census.errored,
                closed = census.closed,
                service_available = self.probe.service_available(),
                "test status"
            );
            self.last_heartbeat = Some(elapsed);
        }
    }

    /// Folds this poll's readiness onto the connections that still exist.
    fn mark_ready(&mut self) {
        for event in self.events.iter() {
            let conn = match event.token() {
                PROBE_TOKEN => self.probe.connection_mut(),
                Token(id) => self.pool.get_mut(id),
            };
            if let Some(conn) = conn {
                conn.note_ready(event.is_readable(), event.is_writable());
            }
        }
    }

    fn read_phase(&mut self) {
        let Scheduler {
            pool,
            probe,
            scratch,
            read_len,
            ..
        } = self;
        if probe.connection().map(|c| c.ready_read).unwrap_or(false) {
            probe.handle_readable(scratch);
        }
        let limit = read_len.unwrap_or(scratch.len()).min(scratch.len());
        for id in pool.ids() {
            let Some(conn) = pool.get_mut(id) else { continue };
            if conn.ready_read && conn.state().is_live() {
                conn.ready_read = false;
                // Data is a liveness signal only; the bytes are discarded.
                let _ = conn.recv_slow(&mut scratch[..limit]);
            }
        }
    }

    fn write_phase(&mut self, elapsed: u64) {
        let Scheduler {
            pool,
            probe,
            requests,
            gen,
            token_len,
            follow_up_interval,
            ..
        } = self;
        if probe.connection().map(|c| c.ready_write).unwrap_or(false) {
            probe.handle_writable();
        }
        for id in pool.ids() {
            let Some(conn) = pool.get_mut(id) else { continue };
            if !conn.ready_write || !conn.state().is_live() {
                continue;
            }
            conn.ready_write = false;
            if conn.has_pending_send() {
                let _ = conn.resume_send();
            } else if conn.requests_owed() {
                let _ = conn.send_slow(&requests.attack, SendKind::Initial);
            } else if conn.follow_ups_owed() > 0
                && elapsed > 0
                && elapsed % *follow_up_interval == 0
            {
                if let Some(pattern) = requests.follow_up.as_ref() {
                    let fragment = render_fragment(pattern, gen, *token_len);
                    let _ = conn.send_slow(&fragment, SendKind::FollowUp);
                }
            }
        }
    }
}

fn render_fragment(pattern: &FollowUpPattern, gen: &mut TextGenerator, token_len: usize) -> Bytes {
    Bytes::from(pattern.render(gen, token_len))
}

// NOTE: Inline unit tests have been moved to the crate-level `tests/` directory.
// See: `crates/treacle-engine/tests/termination_tests.rs` and
// `crates/treacle-engine/tests/scheduler_tests.rs`.
//
// Tests are kept out of library source files to centralize integration tests.
// This file intentionally does not contain an inline `#[cfg(test)]` module.
