use treacle_common::{AttackMode, TestConfig};
use treacle_engine::TestRunner;

/// Drives a short slow-header run through the library API instead of the
/// command line. Pair it with the victim server example:
///
///   cargo run --example victim_server
///   cargo run --example header_test http://127.0.0.1:8080/
fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let url = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "http://127.0.0.1:8080/".into());

    let mut config = TestConfig::default();
    config.url = url.clone();
    config.mode = AttackMode::Header;
    config.connections = 20;
    config.rate = 10;
    config.duration = 30;
    config.follow_up_interval = 5;
    config.probe.interval = 2;
    config.probe.timeout = 3;

    let runner = TestRunner::new(config);
    signal_hook::flag::register(signal_hook::consts::SIGINT, runner.cancel_flag())?;

    println!("Running a 30-second slow-header test against {url}");
    let summary = runner.run()?;

    println!("Exit status: {}", summary.status);
    println!("Seconds elapsed: {}", summary.seconds);
    println!("Connections launched: {}", summary.launched);
    println!(
        "Closed: {}  Errored: {}  Probes answered: {}/{}",
        summary.closed, summary.errored, summary.probes_answered, summary.probes_sent
    );
    Ok(())
}
