use thiserror::Error;
use treacle_common::ProxyMode;

use crate::target::TargetError;

/// Errors that abort a run before the event loop starts. Anything that
/// happens to an individual connection after setup is absorbed by its state
/// machine instead.
#[derive(Debug, Error)]
pub enum SetupError {
    #[error(transparent)]
    Config(#[from] treacle_common::ConfigError),

    #[error(transparent)]
    Target(#[from] TargetError),

    #[error("cannot resolve {host}: {source}")]
    Resolve {
        host: String,
        #[source]
        source: std::io::Error,
    },

    #[error("TLS through a proxy is not supported")]
    TlsOverProxy,

    #[error("proxy mode {0:?} is not supported by this build")]
    ProxyUnsupported(ProxyMode),

    #[error("cannot build TLS client config: {0}")]
    Tls(#[from] rustls::Error),

    #[error("invalid TLS server name '{0}'")]
    TlsServerName(String),

    #[error("cannot create poll instance: {0}")]
    Poll(#[source] std::io::Error),

    #[error("cannot open report file {path}: {source}")]
    Report {
        path: String,
        #[source]
        source: std::io::Error,
    },
}
