// ABOUTME: Target host configuration for the gateway.
// ABOUTME: Parses formats like "host", "account@host", "host:port", "account@host:port".

use serde::Deserialize;
use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TargetConfig {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// System account to log in as. Defaults to the gateway user's name.
    #[serde(default)]
    pub account: Option<String>,
    /// Private key for the account.
    #[serde(default)]
    pub key: Option<PathBuf>,
}

fn default_port() -> u16 {
    22
}

impl TargetConfig {
    pub fn parse(s: &str) -> Result<Self, String> {
        let s = s.trim();
        if s.is_empty() {
            return Err("target address cannot be empty".to_string());
        }

        // Parse format: [account@]host[:port]
        let (account_part, rest) = if let Some(at_pos) = s.find('@') {
            (Some(&s[..at_pos]), &s[at_pos + 1..])
        } else {
            (None, s)
        };

        let (host, port) = if let Some(colon_pos) = rest.rfind(':') {
            let port_str = &rest[colon_pos + 1..];
            let port = port_str
                .parse::<u16>()
                .map_err(|_| format!("invalid port: {}", port_str))?;
            (&rest[..colon_pos], port)
        } else {
            (rest, 22)
        };

        if host.is_empty() {
            return Err("hostname cannot be empty".to_string());
        }
        if account_part.is_some_and(str::is_empty) {
            return Err("account cannot be empty".to_string());
        }

        Ok(TargetConfig {
            host: host.to_string(),
            port,
            account: account_part.map(|s| s.to_string()),
            key: None,
        })
    }
}

/// A target given either as a shorthand string or as a mapping.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub(crate) enum TargetEntry {
    Simple(String),
    Detailed(TargetConfig),
}

impl TargetEntry {
    pub(crate) fn into_target_config(self) -> Result<TargetConfig, String> {
        match self {
            TargetEntry::Simple(s) => TargetConfig::parse(&s),
            TargetEntry::Detailed(c) if c.host.trim().is_empty() => {
                Err("hostname cannot be empty".to_string())
            }
            TargetEntry::Detailed(c) => Ok(c),
        }
    }
}
