//! Error kinds raised by the forwarder.

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::proxy::relay::Direction;

/// Errors surfaced by configuration loading and the forwarding engine
#[derive(Debug, Error)]
pub enum ForwardError {
    /// Malformed or incomplete rule group (fatal at startup)
    #[error("config error at line {line}: {message}")]
    Config { line: usize, message: String },

    /// Rule set is well-formed but unusable as a whole
    #[error("invalid rules: {0}")]
    InvalidRules(String),

    #[error("failed to read rules from {path}: {source}")]
    ConfigIo {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("invalid YAML rules: {0}")]
    ConfigYaml(#[from] serde_yaml::Error),

    /// External port could not be bound; fatal for that rule only
    #[error("rule '{rule}': failed to bind port {port}: {source}")]
    Bind {
        rule: String,
        port: u16,
        #[source]
        source: io::Error,
    },

    /// Internal backend unreachable or refused the connection
    #[error("rule '{rule}': failed to dial backend {backend}: {source}")]
    Dial {
        rule: String,
        backend: String,
        #[source]
        source: io::Error,
    },

    #[error("rule '{rule}': dial to backend {backend} timed out after {timeout:?}")]
    DialTimeout {
        rule: String,
        backend: String,
        timeout: Duration,
    },

    #[error("{direction} relay failed: {source}")]
    Relay {
        direction: Direction,
        #[source]
        source: io::Error,
    },

    #[error("no listener could be started")]
    NoListeners,
}

impl ForwardError {
    pub(crate) fn config(line: usize, message: impl Into<String>) -> Self {
        ForwardError::Config {
            line,
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, ForwardError>;
