//! File configuration, lowered into the proxy's runtime [`Config`].
//!
//! The file is JSON; every field is optional. The runtime seams that the
//! file cannot express (ACL evaluator, resolver, stats sink) keep their
//! defaults: no ACL (allow all), the system resolver, and no metrics.

use ferryman::classify::RuleRange;
use ferryman_proxy::request::ROLE_HEADER;
use ferryman_proxy::role::role_from_header;
use ferryman_proxy::Config;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SetupError {
    #[error("{0}")]
    Io(#[from] std::io::Error),

    #[error("cannot parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid rule range {cidr:?}: {reason}")]
    InvalidRange { cidr: String, reason: String },

    #[error("proxy error: {0}")]
    Proxy(#[from] ferryman_proxy::ProxyError),
}

/// A rule range as written in the config file. A port of zero matches
/// any port.
#[derive(Debug, Clone, Deserialize)]
pub struct FileRuleRange {
    pub cidr: String,
    #[serde(default)]
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub allow_ranges: Vec<FileRuleRange>,
    pub deny_ranges: Vec<FileRuleRange>,
    pub connect_timeout_seconds: u64,
    pub idle_timeout_seconds: u64,
    pub exit_timeout_seconds: u64,
    pub allow_missing_role: bool,
    pub additional_error_message_on_deny: String,
    /// Header the built-in role extractor reads.
    pub role_header: String,
}

impl Default for FileConfig {
    fn default() -> Self {
        Self {
            allow_ranges: Vec::new(),
            deny_ranges: Vec::new(),
            connect_timeout_seconds: 10,
            idle_timeout_seconds: 600,
            exit_timeout_seconds: 60,
            allow_missing_role: false,
            additional_error_message_on_deny: String::new(),
            role_header: ROLE_HEADER.to_string(),
        }
    }
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self, SetupError> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Lower the file form into the runtime configuration.
    pub fn into_config(self) -> Result<Config, SetupError> {
        let allow_ranges = lower_ranges(self.allow_ranges)?;
        let deny_ranges = lower_ranges(self.deny_ranges)?;

        Ok(Config {
            allow_ranges,
            deny_ranges,
            connect_timeout: Duration::from_secs(self.connect_timeout_seconds),
            idle_timeout: Duration::from_secs(self.idle_timeout_seconds),
            exit_timeout: Duration::from_secs(self.exit_timeout_seconds),
            allow_missing_role: self.allow_missing_role,
            additional_error_message_on_deny: self.additional_error_message_on_deny,
            role_from_request: Some(role_from_header(&self.role_header)),
            ..Config::default()
        })
    }
}

fn lower_ranges(ranges: Vec<FileRuleRange>) -> Result<Vec<RuleRange>, SetupError> {
    ranges
        .into_iter()
        .map(|range| {
            let mut rule: RuleRange =
                range
                    .cidr
                    .parse()
                    .map_err(|err: ipnet::AddrParseError| SetupError::InvalidRange {
                        cidr: range.cidr.clone(),
                        reason: err.to_string(),
                    })?;
            rule.port = range.port;
            Ok(rule)
        })
        .collect()
}
