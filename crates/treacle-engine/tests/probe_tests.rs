use std::io::Write;
use std::net::TcpListener;
use std::thread;
use std::time::{Duration, Instant};

use bytes::Bytes;
use treacle_engine::engine::probe::ProbeMonitor;
use treacle_engine::engine::transport::TransportKind;

const PROBE_REQUEST: &[u8] = b"GET / HTTP/1.1\r\nHost: victim.example\r\n\r\n";

fn monitor(listener: &TcpListener, interval: u64, timeout: u64) -> ProbeMonitor {
    ProbeMonitor::new(
        Bytes::from_static(PROBE_REQUEST),
        TransportKind::Plain,
        vec![listener.local_addr().unwrap()],
        interval,
        timeout,
    )
}

/// Pushes the probe request out through non-blocking retries.
fn flush_request(probe: &mut ProbeMonitor) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while probe
        .connection()
        .map(|c| c.requests_owed() || c.has_pending_send())
        .unwrap_or(false)
    {
        assert!(Instant::now() < deadline, "probe request never flushed");
        probe.handle_writable();
        thread::sleep(Duration::from_millis(2));
    }
}

#[test]
fn test_spawn_only_on_interval_seconds() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let mut probe = monitor(&listener, 5, 30);

    probe.tick(1);
    assert_eq!(probe.probes_sent(), 0);
    assert!(probe.connection().is_none());

    probe.tick(5);
    assert_eq!(probe.probes_sent(), 1);
    assert!(probe.connection().is_some());

    // repeated ticks inside the same second spawn nothing new
    probe.tick(5);
    assert_eq!(probe.probes_sent(), 1);
}

#[test]
fn test_service_starts_out_available() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let probe = monitor(&listener, 5, 5);
    assert!(probe.service_available());
    assert_eq!(probe.probes_answered(), 0);
}

#[test]
fn test_silent_probe_times_out_as_dosed() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let mut probe = monitor(&listener, 1, 2);

    probe.tick(1);
    assert_eq!(probe.probes_sent(), 1);
    let (_peer, _) = listener.accept().unwrap();

    // one silent second is within the budget
    probe.tick(2);
    assert!(probe.service_available());
    assert!(probe.connection().is_some());

    // two silent seconds is the verdict
    probe.tick(3);
    assert!(!probe.service_available());
    assert!(probe.connection().is_none(), "expired probe is disposed");
}

#[test]
fn test_answered_probe_marks_service_available() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let mut probe = monitor(&listener, 1, 5);

    probe.tick(0);
    assert_eq!(probe.probes_sent(), 1);
    let (mut peer, _) = listener.accept().unwrap();

    flush_request(&mut probe);

    peer.write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n")
        .unwrap();
    peer.flush().unwrap();

    let mut scratch = vec![0u8; 4096];
    let deadline = Instant::now() + Duration::from_secs(10);
    while probe.connection().is_some() {
        assert!(Instant::now() < deadline, "probe never saw the reply");
        probe.handle_readable(&mut scratch);
        thread::sleep(Duration::from_millis(2));
    }

    assert_eq!(probe.probes_answered(), 1);
    assert!(probe.service_available());
}

#[test]
fn test_answer_after_a_timeout_flips_the_verdict_back() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let mut probe = monitor(&listener, 1, 1);

    // first probe expires unanswered
    probe.tick(1);
    let (_peer1, _) = listener.accept().unwrap();
    probe.tick(2);
    assert!(!probe.service_available());

    // the next one is answered and clears the verdict
    probe.tick(3);
    assert_eq!(probe.probes_sent(), 2);
    let (mut peer2, _) = listener.accept().unwrap();
    flush_request(&mut probe);
    peer2.write_all(b"HTTP/1.1 200 OK\r\n\r\n").unwrap();

    let mut scratch = vec![0u8; 4096];
    let deadline = Instant::now() + Duration::from_secs(10);
    while probe.connection().is_some() {
        assert!(Instant::now() < deadline, "probe never saw the reply");
        probe.handle_readable(&mut scratch);
        thread::sleep(Duration::from_millis(2));
    }

    assert!(probe.service_available());
    assert_eq!(probe.probes_answered(), 1);
}
