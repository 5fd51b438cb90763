//! Process settings and forwarding rules
//!
//! Settings come from the environment. Rules come from a file, either the
//! line-oriented directive format:
//!
//! ```text
//! # ssh
//! service=ssh
//! ipAddress=192.168.0.19
//! forwardPort=22
//! srcPort=2222
//! ```
//!
//! or YAML when the file ends in `.yaml`/`.yml`.

use std::collections::HashSet;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::error::{ForwardError, Result};

pub const DEFAULT_RULES_PATH: &str = "portfwd.conf";
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_millis(5000);
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_millis(10_000);

/// One external port forwarded to one internal host:port
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardingRule {
    pub name: String,
    pub internal_host: String,
    pub internal_port: u16,
    pub external_port: u16,
}

impl ForwardingRule {
    pub fn new(
        name: impl Into<String>,
        internal_host: impl Into<String>,
        internal_port: u16,
        external_port: u16,
    ) -> Self {
        Self {
            name: name.into(),
            internal_host: internal_host.into(),
            internal_port,
            external_port,
        }
    }

    /// `host:port` of the backend, as passed to the resolver
    pub fn backend(&self) -> String {
        format!("{}:{}", self.internal_host, self.internal_port)
    }
}

/// What happens to established pairs once shutdown starts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ShutdownPolicy {
    /// Let pairs finish on their own, sweep whatever is left after the drain timeout
    #[default]
    Drain,
    /// Close every pair as soon as listeners stop
    Force,
}

impl std::str::FromStr for ShutdownPolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "drain" => Ok(ShutdownPolicy::Drain),
            "force" => Ok(ShutdownPolicy::Force),
            other => anyhow::bail!("unknown shutdown policy '{}', expected drain or force", other),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub rules_path: PathBuf,
    pub bind_addr: IpAddr,
    pub connect_timeout: Duration,
    pub shutdown_policy: ShutdownPolicy,
    pub drain_timeout: Duration,
    pub log_level: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            rules_path: PathBuf::from(DEFAULT_RULES_PATH),
            bind_addr: IpAddr::from([0, 0, 0, 0]),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            shutdown_policy: ShutdownPolicy::Drain,
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
            log_level: "info".to_string(),
        }
    }
}

impl Settings {
    /// Load settings from `PORTFWD_*` environment variables.
    pub fn load() -> anyhow::Result<Self> {
        let defaults = Settings::default();

        let rules_path = std::env::var("PORTFWD_RULES")
            .map(PathBuf::from)
            .unwrap_or(defaults.rules_path);

        let bind_addr = std::env::var("PORTFWD_BIND")
            .ok()
            .map(|v| v.trim().parse::<IpAddr>())
            .transpose()
            .context("PORTFWD_BIND must be an IP address.")?
            .unwrap_or(defaults.bind_addr);

        let connect_timeout = env_millis("PORTFWD_CONNECT_TIMEOUT_MS")?
            .unwrap_or(defaults.connect_timeout);

        let shutdown_policy = std::env::var("PORTFWD_SHUTDOWN")
            .ok()
            .map(|v| v.parse::<ShutdownPolicy>())
            .transpose()?
            .unwrap_or(defaults.shutdown_policy);

        let drain_timeout =
            env_millis("PORTFWD_DRAIN_TIMEOUT_MS")?.unwrap_or(defaults.drain_timeout);

        let log_level = std::env::var("PORTFWD_LOG").unwrap_or(defaults.log_level);

        Ok(Self {
            rules_path,
            bind_addr,
            connect_timeout,
            shutdown_policy,
            drain_timeout,
            log_level,
        })
    }

    pub fn with_rules_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.rules_path = path.into();
        self
    }
}

fn env_millis(var: &str) -> anyhow::Result<Option<Duration>> {
    std::env::var(var)
        .ok()
        .map(|v| v.trim().parse::<u64>())
        .transpose()
        .with_context(|| format!("{} must be an integer (milliseconds).", var))
        .map(|ms| ms.map(Duration::from_millis))
}

/// Read the rules file, choosing the format by extension.
pub fn load_rules(path: &Path) -> Result<Vec<ForwardingRule>> {
    let text = std::fs::read_to_string(path).map_err(|source| ForwardError::ConfigIo {
        path: path.to_path_buf(),
        source,
    })?;

    let is_yaml = matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("yaml") | Some("yml")
    );

    if is_yaml {
        parse_yaml_rules(&text)
    } else {
        parse_rules(&text)
    }
}

const KEYS: [&str; 4] = ["service", "ipAddress", "forwardPort", "srcPort"];

#[derive(Default)]
struct PartialRule {
    name: Option<String>,
    internal_host: Option<String>,
    internal_port: Option<u16>,
}

/// Parse the `key=value` directive format.
///
/// Keys must appear in the order `service`, `ipAddress`, `forwardPort`,
/// `srcPort`; a rule is committed when its `srcPort` line is read.
pub fn parse_rules(text: &str) -> Result<Vec<ForwardingRule>> {
    let mut rules = Vec::new();
    let mut current = PartialRule::default();
    let mut expected = 0usize;
    let mut group_start = 0usize;

    for (idx, raw) in text.lines().enumerate() {
        let line_no = idx + 1;
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let (key, value) = line
            .split_once('=')
            .ok_or_else(|| ForwardError::config(line_no, format!("expected key=value, got '{}'", line)))?;
        let key = key.trim();
        let value = value.trim();

        if !KEYS.contains(&key) {
            return Err(ForwardError::config(line_no, format!("unknown key '{}'", key)));
        }
        if key != KEYS[expected] {
            return Err(ForwardError::config(
                line_no,
                format!("expected '{}' but found '{}'", KEYS[expected], key),
            ));
        }
        if value.is_empty() {
            return Err(ForwardError::config(line_no, format!("'{}' has no value", key)));
        }

        match expected {
            0 => {
                group_start = line_no;
                current.name = Some(value.to_string());
            }
            1 => current.internal_host = Some(value.to_string()),
            2 => current.internal_port = Some(parse_port(line_no, key, value)?),
            _ => {
                let external_port = parse_port(line_no, key, value)?;
                let done = std::mem::take(&mut current);
                match (done.name, done.internal_host, done.internal_port) {
                    (Some(name), Some(internal_host), Some(internal_port)) => {
                        rules.push(ForwardingRule {
                            name,
                            internal_host,
                            internal_port,
                            external_port,
                        });
                    }
                    _ => return Err(ForwardError::config(line_no, "incomplete rule")),
                }
            }
        }
        expected = (expected + 1) % KEYS.len();
    }

    if expected != 0 {
        return Err(ForwardError::config(
            group_start,
            format!("rule group is missing '{}'", KEYS[expected]),
        ));
    }

    validate(rules)
}

fn parse_port(line: usize, key: &str, value: &str) -> Result<u16> {
    match value.parse::<u16>() {
        Ok(0) | Err(_) => Err(ForwardError::config(
            line,
            format!("'{}' must be a port between 1 and 65535, got '{}'", key, value),
        )),
        Ok(port) => Ok(port),
    }
}

#[derive(Deserialize)]
struct YamlRules {
    rules: Vec<ForwardingRule>,
}

/// Parse the YAML form: `rules: [{name, internal_host, internal_port, external_port}]`.
pub fn parse_yaml_rules(text: &str) -> Result<Vec<ForwardingRule>> {
    let parsed: YamlRules = serde_yaml::from_str(text)?;
    for (idx, rule) in parsed.rules.iter().enumerate() {
        if rule.internal_port == 0 || rule.external_port == 0 {
            return Err(ForwardError::InvalidRules(format!(
                "rule #{} ('{}') has a zero port",
                idx + 1,
                rule.name
            )));
        }
    }
    validate(parsed.rules)
}

/// Reject empty rule sets and overlapping external ports; warn on duplicate names.
fn validate(rules: Vec<ForwardingRule>) -> Result<Vec<ForwardingRule>> {
    if rules.is_empty() {
        return Err(ForwardError::InvalidRules(
            "no forwarding rules defined".to_string(),
        ));
    }

    let mut ports = HashSet::new();
    let mut names = HashSet::new();
    for rule in &rules {
        if !ports.insert(rule.external_port) {
            return Err(ForwardError::InvalidRules(format!(
                "rule '{}' reuses external port {}",
                rule.name, rule.external_port
            )));
        }
        if !names.insert(rule.name.as_str()) {
            tracing::warn!(rule = %rule.name, "Duplicate rule name");
        }
    }

    Ok(rules)
}
