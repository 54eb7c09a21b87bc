use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use treacle_common::{load_config, AttackMode, ConfigError, ProxyMode, TestConfig};
use treacle_engine::TestRunner;

/// Slow HTTP DoS vulnerability tester.
///
/// Opens many connections to a target you are authorized to test and holds
/// them with one of four slow-HTTP strategies while a well-behaved probe
/// checks whether the service still answers.
#[derive(Parser, Debug)]
#[command(name = "treacle", version, about, long_about = None)]
struct Cli {
    /// Slow headers test (slowloris); the default.
    #[arg(short = 'H', group = "mode")]
    header: bool,
    /// Slow message body test (R-U-Dead-Yet).
    #[arg(short = 'B', group = "mode")]
    body: bool,
    /// Range header test.
    #[arg(short = 'R', group = "mode")]
    range: bool,
    /// Slow read test.
    #[arg(short = 'X', group = "mode")]
    slow_read: bool,

    /// Target URL, http:// or https://.
    #[arg(short = 'u', value_name = "URL")]
    url: Option<String>,
    /// Number of connections.
    #[arg(short = 'c', value_name = "N")]
    connections: Option<usize>,
    /// New connections per second during ramp-up.
    #[arg(short = 'r', value_name = "N")]
    rate: Option<usize>,
    /// Test duration, seconds.
    #[arg(short = 'l', value_name = "SECONDS")]
    duration: Option<u64>,
    /// Seconds between follow-up fragments.
    #[arg(short = 'i', value_name = "SECONDS")]
    interval: Option<u64>,
    /// Declared Content-Length in the body test.
    #[arg(short = 's', value_name = "BYTES")]
    content_length: Option<usize>,
    /// HTTP verb; defaults to the mode's usual one.
    #[arg(short = 't', value_name = "VERB")]
    verb: Option<String>,
    /// Max length of each random token.
    #[arg(short = 'x', value_name = "BYTES")]
    max_random_len: Option<usize>,
    /// Left edge of generated range pairs.
    #[arg(short = 'a', value_name = "N")]
    range_start: Option<usize>,
    /// Number of generated range pairs.
    #[arg(short = 'b', value_name = "N")]
    range_limit: Option<usize>,
    /// Probe interval and timeout, seconds.
    #[arg(short = 'p', value_name = "SECONDS")]
    probe_timeout: Option<u64>,
    /// Send attack traffic through an HTTP proxy.
    #[arg(short = 'd', value_name = "HOST:PORT")]
    proxy: Option<String>,
    /// Send only the probe through a proxy.
    #[arg(short = 'e', value_name = "HOST:PORT", conflicts_with = "proxy")]
    probe_proxy: Option<String>,
    /// Write CSV and HTML statistics.
    #[arg(short = 'g')]
    generate_stats: bool,
    /// Statistics file prefix; a timestamped one is generated otherwise.
    #[arg(short = 'o', value_name = "PREFIX")]
    output_prefix: Option<String>,
    /// Verbosity 0..4 (error, warn, info, debug, trace).
    #[arg(short = 'v', value_name = "LEVEL")]
    verbosity: Option<u8>,
    /// Pipelined copies of the request in the slow read test (max 10).
    #[arg(short = 'k', value_name = "N")]
    pipeline: Option<usize>,
    /// Seconds between reads in the slow read test.
    #[arg(short = 'n', value_name = "SECONDS")]
    read_interval: Option<u64>,
    /// Bytes per read in the slow read test.
    #[arg(short = 'z', value_name = "BYTES")]
    read_len: Option<usize>,
    /// Receive window lower bound, bytes.
    #[arg(short = 'w', value_name = "BYTES")]
    window_lower: Option<usize>,
    /// Receive window upper bound, bytes.
    #[arg(short = 'y', value_name = "BYTES")]
    window_upper: Option<usize>,
    /// Content-Type in the body test.
    #[arg(short = 'C', value_name = "TYPE")]
    content_type: Option<String>,
    /// Accept header in the body test.
    #[arg(short = 'A', value_name = "VALUE")]
    accept: Option<String>,
    /// YAML config file; explicit flags override its values.
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,
}

/// Config file first, then flag overrides, defaults for the rest.
fn build_config(cli: &Cli) -> Result<TestConfig, ConfigError> {
    let mut config = match &cli.config {
        Some(path) => load_config(path)?,
        None => TestConfig::default(),
    };

    if cli.header {
        config.mode = AttackMode::Header;
    } else if cli.body {
        config.mode = AttackMode::Body;
    } else if cli.range {
        config.mode = AttackMode::Range;
    } else if cli.slow_read {
        config.mode = AttackMode::SlowRead;
    }

    if let Some(url) = &cli.url {
        config.url = url.clone();
    }
    if let Some(n) = cli.connections {
        config.connections = n;
    }
    if let Some(n) = cli.rate {
        config.rate = n;
    }
    if let Some(n) = cli.duration {
        config.duration = n;
    }
    if let Some(n) = cli.interval {
        config.follow_up_interval = n;
    }
    if let Some(n) = cli.content_length {
        config.body.content_length = n;
    }
    if let Some(verb) = &cli.verb {
        config.verb = Some(verb.clone());
    }
    if let Some(n) = cli.max_random_len {
        config.max_random_len = n;
    }
    if let Some(n) = cli.range_start {
        config.range.start = n;
    }
    if let Some(n) = cli.range_limit {
        config.range.limit = n;
    }
    // One value feeds both: a probe is due every `p` seconds and declared
    // dead after `p` silent ones.
    if let Some(p) = cli.probe_timeout {
        config.probe.interval = p;
        config.probe.timeout = p;
    }
    if let Some(addr) = &cli.proxy {
        config.proxy.mode = ProxyMode::Http;
        config.proxy.address = Some(addr.clone());
    }
    if let Some(addr) = &cli.probe_proxy {
        config.proxy.mode = ProxyMode::Probe;
        config.proxy.probe_address = Some(addr.clone());
    }
    if cli.generate_stats {
        config.report.enabled = true;
    }
    if let Some(prefix) = &cli.output_prefix {
        config.report.prefix = Some(prefix.clone());
    }
    if let Some(n) = cli.pipeline {
        config.slow_read.pipeline_factor = n;
    }
    if let Some(n) = cli.read_interval {
        config.slow_read.read_interval = n;
    }
    if let Some(n) = cli.read_len {
        config.slow_read.read_len = n;
    }
    if let Some(n) = cli.window_lower {
        config.slow_read.window_lower = n;
    }
    if let Some(n) = cli.window_upper {
        config.slow_read.window_upper = n;
    }
    if let Some(ct) = &cli.content_type {
        config.body.content_type = ct.clone();
    }
    if let Some(accept) = &cli.accept {
        config.body.accept = accept.clone();
    }
    if let Some(v) = cli.verbosity {
        config.verbosity = v;
    }

    Ok(config)
}

fn init_logging(verbosity: u8) {
    let default = match verbosity {
        0 => "error",
        1 => "warn",
        2 => "info",
        3 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false))
        .init();
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let config = match build_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("treacle: {e}");
            return ExitCode::FAILURE;
        }
    };
    init_logging(config.verbosity);

    let runner = TestRunner::new(config);
    let cancel = runner.cancel_flag();
    for signal in [signal_hook::consts::SIGINT, signal_hook::consts::SIGTERM] {
        if let Err(e) = signal_hook::flag::register(signal, Arc::clone(&cancel)) {
            warn!(signal, error = %e, "cannot install signal handler");
        }
    }

    match runner.run() {
        Ok(summary) => {
            println!("Test ended on {}th second", summary.seconds);
            println!("Exit status: {}", summary.status);
            for path in &summary.report_paths {
                println!("Report saved to {}", path.display());
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "setup failed");
            ExitCode::FAILURE
        }
    }
}
