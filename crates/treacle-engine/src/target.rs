//! Target URL and proxy endpoint parsing.
//!
//! The engine connects to resolved socket addresses; everything it needs
//! from the URL is the scheme (plain or TLS), the host for SNI and the Host
//! header, the port, and the path for the request line.

use std::fmt;
use std::net::{SocketAddr, ToSocketAddrs};

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    pub fn default_port(self) -> u16 {
        match self {
            Scheme::Http => 80,
            Scheme::Https => 443,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
        }
    }
}

#[derive(Debug, Error)]
pub enum TargetError {
    #[error("unsupported scheme in '{0}', only http:// and https:// work")]
    UnsupportedScheme(String),
    #[error("no host in URL '{0}'")]
    MissingHost(String),
    #[error("unterminated IPv6 literal in '{0}'")]
    UnterminatedV6(String),
    #[error("invalid port in '{0}'")]
    InvalidPort(String),
    #[error("invalid proxy endpoint '{0}', expected host[:port]")]
    InvalidProxy(String),
}

/// Parsed attack target.
#[derive(Debug, Clone)]
pub struct TargetUrl {
    pub scheme: Scheme,
    /// Host without IPv6 brackets.
    pub host: String,
    pub port: u16,
    /// Always begins with `/`.
    pub path: String,
}

impl TargetUrl {
    pub fn parse(raw: &str) -> Result<Self, TargetError> {
        let raw = raw.trim();
        let (scheme, rest) = if let Some(rest) = strip_prefix_ci(raw, "https://") {
            (Scheme::Https, rest)
        } else if let Some(rest) = strip_prefix_ci(raw, "http://") {
            (Scheme::Http, rest)
        } else {
            return Err(TargetError::UnsupportedScheme(raw.to_string()));
        };

        let (authority, path) = match rest.find('/') {
            Some(idx) => (&rest[..idx], &rest[idx..]),
            None => (rest, "/"),
        };
        if authority.is_empty() {
            return Err(TargetError::MissingHost(raw.to_string()));
        }

        let (host, port_str) = split_authority(authority, raw)?;
        let port = match port_str {
            Some(p) => p
                .parse::<u16>()
                .map_err(|_| TargetError::InvalidPort(raw.to_string()))?,
            None => scheme.default_port(),
        };

        Ok(TargetUrl {
            scheme,
            host: host.to_string(),
            port,
            path: path.to_string(),
        })
    }

    pub fn is_tls(&self) -> bool {
        self.scheme == Scheme::Https
    }

    /// Value of the Host header: the port rides along unless it is one of
    /// the two well-known HTTP ports.
    pub fn host_header(&self) -> String {
        let host = self.bracketed_host();
        if self.port == 80 || self.port == 443 {
            host
        } else {
            format!("{}:{}", host, self.port)
        }
    }

    /// Absolute form of the URL for proxied request lines.
    pub fn absolute(&self) -> String {
        let host = self.bracketed_host();
        if self.port == self.scheme.default_port() {
            format!("{}://{}{}", self.scheme.as_str(), host, self.path)
        } else {
            format!("{}://{}:{}{}", self.scheme.as_str(), host, self.port, self.path)
        }
    }

    fn bracketed_host(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]", self.host)
        } else {
            self.host.clone()
        }
    }
}

impl fmt::Display for TargetUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.absolute())
    }
}

/// `host[:port]` of an HTTP or probe proxy.
#[derive(Debug, Clone)]
pub struct ProxyEndpoint {
    pub host: String,
    pub port: u16,
}

impl ProxyEndpoint {
    pub fn parse(raw: &str) -> Result<Self, TargetError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(TargetError::InvalidProxy(raw.to_string()));
        }
        let (host, port_str) = split_authority(raw, raw)?;
        if host.is_empty() {
            return Err(TargetError::InvalidProxy(raw.to_string()));
        }
        let port = match port_str {
            Some(p) => p
                .parse::<u16>()
                .map_err(|_| TargetError::InvalidProxy(raw.to_string()))?,
            None => 80,
        };
        Ok(ProxyEndpoint {
            host: host.to_string(),
            port,
        })
    }
}

impl fmt::Display for ProxyEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

fn strip_prefix_ci<'a>(s: &'a str, prefix: &str) -> Option<&'a str> {
    // `get` rejects a split inside a multibyte character, so arbitrary
    // garbage cannot panic the parser.
    match s.get(..prefix.len()) {
        Some(head) if head.eq_ignore_ascii_case(prefix) => Some(&s[prefix.len()..]),
        _ => None,
    }
}

/// Splits `host[:port]`, handling `[v6::literal]:port` brackets. Returns the
/// host without brackets.
fn split_authority<'a>(
    authority: &'a str,
    context: &str,
) -> Result<(&'a str, Option<&'a str>), TargetError> {
    if let Some(inner) = authority.strip_prefix('[') {
        let end = inner
            .find(']')
            .ok_or_else(|| TargetError::UnterminatedV6(context.to_string()))?;
        let host = &inner[..end];
        let after = &inner[end + 1..];
        if after.is_empty() {
            Ok((host, None))
        } else if let Some(port) = after.strip_prefix(':') {
            Ok((host, Some(port)))
        } else {
            Err(TargetError::InvalidPort(context.to_string()))
        }
    } else {
        match authority.rfind(':') {
            // A second colon means an unbracketed v6 literal with no port.
            Some(idx) if authority[..idx].contains(':') => Ok((authority, None)),
            Some(idx) => Ok((&authority[..idx], Some(&authority[idx + 1..]))),
            None => Ok((authority, None)),
        }
    }
}

/// Resolves a host/port pair to every candidate address. The connect path
/// walks the list until one address accepts the socket.
pub fn resolve(host: &str, port: u16) -> std::io::Result<Vec<SocketAddr>> {
    let addrs: Vec<SocketAddr> = (host, port).to_socket_addrs()?.collect();
    if addrs.is_empty() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "resolver returned no addresses",
        ));
    }
    Ok(addrs)
}
