use std::fmt;
use std::str::FromStr;

use serde::Deserialize;
use thiserror::Error;

/// Attack strategy applied to every pooled connection.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum AttackMode {
    /// Slowloris: never finish the header block, trickle bogus headers.
    #[default]
    Header,
    /// R-U-Dead-Yet: declare a large body, trickle form fields.
    Body,
    /// Apache killer: one request with an oversized Range header.
    Range,
    /// Tiny receive window plus throttled reads of the response.
    #[serde(alias = "slow-read")]
    SlowRead,
}

impl AttackMode {
    /// Default HTTP verb for the mode. SlowRead always uses GET regardless
    /// of any configured override.
    pub fn default_verb(self) -> &'static str {
        match self {
            AttackMode::Header | AttackMode::SlowRead => "GET",
            AttackMode::Body => "POST",
            AttackMode::Range => "HEAD",
        }
    }

    /// Header and Body keep connections alive with periodic fragments;
    /// Range and SlowRead send everything up front.
    pub fn has_follow_ups(self) -> bool {
        matches!(self, AttackMode::Header | AttackMode::Body)
    }
}

impl fmt::Display for AttackMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AttackMode::Header => "SLOW HEADERS",
            AttackMode::Body => "SLOW BODY",
            AttackMode::Range => "RANGE",
            AttackMode::SlowRead => "SLOW READ",
        };
        f.write_str(name)
    }
}

impl FromStr for AttackMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "header" | "headers" | "slowloris" => Ok(AttackMode::Header),
            "body" | "post" | "rudy" => Ok(AttackMode::Body),
            "range" => Ok(AttackMode::Range),
            "slowread" | "slow-read" | "read" => Ok(AttackMode::SlowRead),
            other => Err(format!(
                "unknown attack mode '{other}' (expected header, body, range or slowread)"
            )),
        }
    }
}

/// How attack and probe traffic reaches the target.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ProxyMode {
    #[default]
    None,
    /// Attack and probe traffic through an HTTP proxy, absolute-URI requests.
    Http,
    Tunnel,
    Socks4,
    Socks5,
    /// Only the availability probe goes through the proxy.
    Probe,
}

impl ProxyMode {
    pub fn requires_address(self) -> bool {
        !matches!(self, ProxyMode::None)
    }
}

impl fmt::Display for ProxyMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProxyMode::None => "no proxy",
            ProxyMode::Http => "HTTP proxy",
            ProxyMode::Tunnel => "HTTP tunnel",
            ProxyMode::Socks4 => "SOCKS 4",
            ProxyMode::Socks5 => "SOCKS 5",
            ProxyMode::Probe => "probe proxy",
        };
        f.write_str(name)
    }
}

impl FromStr for ProxyMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "none" => Ok(ProxyMode::None),
            "http" => Ok(ProxyMode::Http),
            "tunnel" => Ok(ProxyMode::Tunnel),
            "socks4" => Ok(ProxyMode::Socks4),
            "socks5" => Ok(ProxyMode::Socks5),
            "probe" => Ok(ProxyMode::Probe),
            other => Err(format!("unknown proxy mode '{other}'")),
        }
    }
}

/// Which statistics files `-g` produces.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ReportFormat {
    Csv,
    Html,
    #[default]
    Both,
}

impl ReportFormat {
    pub fn wants_csv(self) -> bool {
        matches!(self, ReportFormat::Csv | ReportFormat::Both)
    }

    pub fn wants_html(self) -> bool {
        matches!(self, ReportFormat::Html | ReportFormat::Both)
    }
}

impl FromStr for ReportFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "csv" => Ok(ReportFormat::Csv),
            "html" => Ok(ReportFormat::Html),
            "both" => Ok(ReportFormat::Both),
            other => Err(format!("unknown report format '{other}'")),
        }
    }
}

/// Body-mode request framing.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct BodyConfig {
    /// Declared Content-Length; always larger than what is ever sent.
    pub content_length: usize,
    pub content_type: String,
    pub accept: String,
}

impl Default for BodyConfig {
    fn default() -> Self {
        BodyConfig {
            content_length: 4096,
            content_type: "application/x-www-form-urlencoded".to_string(),
            accept: "text/html;q=0.9,text/plain;q=0.8,image/png,*/*;q=0.5".to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RangeConfig {
    /// Left edge of every generated range pair.
    pub start: usize,
    /// Number of range pairs, which is also the right edge of the last one.
    pub limit: usize,
}

impl Default for RangeConfig {
    fn default() -> Self {
        RangeConfig { start: 5, limit: 2000 }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SlowReadConfig {
    /// Seconds between reads on one connection; 0 reads whenever readable.
    pub read_interval: u64,
    /// Bytes drained from the receive buffer per read.
    pub read_len: usize,
    /// Copies of the request sent back-to-back on each connection (max 10).
    pub pipeline_factor: usize,
    /// SO_RCVBUF is drawn per connection from [window_lower, window_upper].
    pub window_lower: usize,
    pub window_upper: usize,
}

impl Default for SlowReadConfig {
    fn default() -> Self {
        SlowReadConfig {
            read_interval: 1,
            read_len: 5,
            pipeline_factor: 1,
            window_lower: 1,
            window_upper: 512,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ProbeConfig {
    /// Seconds between availability probes.
    pub interval: u64,
    /// Seconds a probe may stay silent before the service counts as DoSed.
    pub timeout: u64,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        ProbeConfig { interval: 5, timeout: 5 }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct ProxyConfig {
    pub mode: ProxyMode,
    /// `host[:port]` of the attack proxy when mode is `http`.
    pub address: Option<String>,
    /// `host[:port]` of the probe proxy when mode is `probe`.
    pub probe_address: Option<String>,
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct ReportConfig {
    pub enabled: bool,
    pub format: ReportFormat,
    /// Output files are `<prefix>.csv` / `<prefix>.html`; a timestamped
    /// prefix is generated when unset.
    pub prefix: Option<String>,
}

/// Complete description of one test run. Loadable from YAML, overridable
/// flag by flag from the command line.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct TestConfig {
    pub url: String,
    pub mode: AttackMode,
    /// HTTP verb override; `None` uses the per-mode default.
    pub verb: Option<String>,
    pub connections: usize,
    /// New connections per second during ramp-up.
    pub rate: usize,
    /// Test length in seconds.
    pub duration: u64,
    /// Seconds between follow-up fragments in Header and Body modes.
    pub follow_up_interval: u64,
    /// Length of each random token in follow-up fragments (min 2).
    pub max_random_len: usize,
    pub body: BodyConfig,
    pub range: RangeConfig,
    pub slow_read: SlowReadConfig,
    pub probe: ProbeConfig,
    pub proxy: ProxyConfig,
    pub report: ReportConfig,
    /// 0..4: error, warn, info, debug, trace.
    pub verbosity: u8,
}

impl Default for TestConfig {
    fn default() -> Self {
        TestConfig {
            url: "http://localhost/".to_string(),
            mode: AttackMode::Header,
            verb: None,
            connections: 50,
            rate: 50,
            duration: 240,
            follow_up_interval: 10,
            max_random_len: 32,
            body: BodyConfig::default(),
            range: RangeConfig::default(),
            slow_read: SlowReadConfig::default(),
            probe: ProbeConfig::default(),
            proxy: ProxyConfig::default(),
            report: ReportConfig::default(),
            verbosity: 2,
        }
    }
}

impl TestConfig {
    /// Verb actually placed on the request line.
    pub fn effective_verb(&self) -> &str {
        if self.mode == AttackMode::SlowRead {
            return "GET";
        }
        match &self.verb {
            Some(v) => v.as_str(),
            None => self.mode.default_verb(),
        }
    }

    /// Follow-up fragments owed per connection over the whole run.
    pub fn follow_ups_owed(&self) -> u64 {
        if self.mode.has_follow_ups() {
            self.duration / self.follow_up_interval
        } else {
            0
        }
    }

    /// Rejects value combinations the engine cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.connections == 0 {
            return Err(ConfigError::Invalid("connections must be at least 1"));
        }
        if self.rate == 0 {
            return Err(ConfigError::Invalid("rate must be at least 1"));
        }
        if self.duration == 0 {
            return Err(ConfigError::Invalid("duration must be at least 1 second"));
        }
        if self.follow_up_interval == 0 {
            return Err(ConfigError::Invalid(
                "follow-up interval must be at least 1 second",
            ));
        }
        if self.max_random_len < 2 {
            return Err(ConfigError::Invalid(
                "random token length must be at least 2",
            ));
        }
        if self.probe.interval == 0 || self.probe.timeout == 0 {
            return Err(ConfigError::Invalid(
                "probe interval and timeout must be at least 1 second",
            ));
        }
        if self.range.start == 0 {
            return Err(ConfigError::Invalid("range start must be at least 1"));
        }
        if self.range.limit <= self.range.start {
            return Err(ConfigError::RangeBounds {
                start: self.range.start,
                limit: self.range.limit,
            });
        }
        if self.slow_read.read_len == 0 {
            return Err(ConfigError::Invalid("read length must be at least 1 byte"));
        }
        if self.slow_read.pipeline_factor == 0 || self.slow_read.pipeline_factor > 10 {
            return Err(ConfigError::Invalid(
                "pipeline factor must be between 1 and 10",
            ));
        }
        if self.slow_read.window_lower == 0 {
            return Err(ConfigError::Invalid(
                "receive window lower bound must be at least 1 byte",
            ));
        }
        if self.slow_read.window_lower > self.slow_read.window_upper {
            return Err(ConfigError::WindowBounds {
                lower: self.slow_read.window_lower,
                upper: self.slow_read.window_upper,
            });
        }
        if self.proxy.mode == ProxyMode::Http && self.proxy.address.is_none() {
            return Err(ConfigError::Invalid(
                "proxy mode 'http' requires a proxy address",
            ));
        }
        if self.proxy.mode == ProxyMode::Probe && self.proxy.probe_address.is_none() {
            return Err(ConfigError::Invalid(
                "proxy mode 'probe' requires a probe proxy address",
            ));
        }
        if self.verbosity > 4 {
            return Err(ConfigError::Invalid("verbosity must be between 0 and 4"));
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0}")]
    Invalid(&'static str),
    #[error("range limit {limit} must be greater than range start {start}")]
    RangeBounds { start: usize, limit: usize },
    #[error("receive window bounds are inverted: lower {lower} > upper {upper}")]
    WindowBounds { lower: usize, upper: usize },
    #[error("cannot read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("cannot parse config file: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Loads a [`TestConfig`] from a YAML file.
pub fn load_config(path: &std::path::Path) -> Result<TestConfig, ConfigError> {
    let raw = std::fs::read_to_string(path)?;
    let cfg: TestConfig = serde_yaml::from_str(&raw)?;
    Ok(cfg)
}
