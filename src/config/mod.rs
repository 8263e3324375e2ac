// ABOUTME: Configuration types and parsing for sshgate.yml.
// ABOUTME: Handles YAML parsing, target shorthand and building connection identities.

mod target;

pub use target::TargetConfig;

use crate::error::{Error, Result};
use crate::srvconn::{
    Asset, ConnectionIdentity, ConnectionOptions, DEFAULT_TIMEOUT, SystemAccount,
};
use crate::ssh::PoolSettings;
use serde::{Deserialize, Deserializer};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use target::TargetEntry;

pub const CONFIG_FILENAME: &str = "sshgate.yml";
pub const CONFIG_FILENAME_ALT: &str = "sshgate.yaml";
pub const CONFIG_FILENAME_DIR: &str = ".sshgate/config.yml";

#[derive(Debug, Clone, Deserialize)]
pub struct GatewayConfig {
    /// Transport acquisition timeout.
    #[serde(default = "default_timeout", with = "humantime_serde")]
    pub timeout: Duration,

    #[serde(default = "default_reuse_connections")]
    pub reuse_connections: bool,

    #[serde(default)]
    pub known_hosts: Option<PathBuf>,

    #[serde(default)]
    pub trust_first_connection: bool,

    #[serde(default = "default_term")]
    pub term: String,

    #[serde(default, deserialize_with = "deserialize_targets")]
    pub targets: BTreeMap<String, TargetConfig>,
}

fn default_timeout() -> Duration {
    DEFAULT_TIMEOUT
}

fn default_reuse_connections() -> bool {
    true
}

fn default_term() -> String {
    "xterm".to_string()
}

fn deserialize_targets<'de, D>(
    deserializer: D,
) -> std::result::Result<BTreeMap<String, TargetConfig>, D::Error>
where
    D: Deserializer<'de>,
{
    let entries: BTreeMap<String, TargetEntry> = BTreeMap::deserialize(deserializer)?;
    entries
        .into_iter()
        .map(|(name, entry)| {
            entry
                .into_target_config()
                .map(|target| (name.clone(), target))
                .map_err(|e| serde::de::Error::custom(format!("target {}: {}", name, e)))
        })
        .collect()
}

impl GatewayConfig {
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.term.trim().is_empty() {
            return Err(Error::InvalidConfig("term cannot be empty".to_string()));
        }
        if let Some((name, _)) = self
            .targets
            .iter()
            .find(|(_, t)| t.account.as_deref().is_some_and(|a| a.trim().is_empty()))
        {
            return Err(Error::InvalidConfig(format!(
                "target {}: account cannot be empty",
                name
            )));
        }
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    pub fn discover(dir: &Path) -> Result<Self> {
        let candidates = [
            dir.join(CONFIG_FILENAME),
            dir.join(CONFIG_FILENAME_ALT),
            dir.join(CONFIG_FILENAME_DIR),
        ];

        for path in &candidates {
            if path.exists() {
                return Self::load(path);
            }
        }

        Err(Error::ConfigNotFound(dir.to_path_buf()))
    }

    pub fn target(&self, name: &str) -> Result<&TargetConfig> {
        self.targets
            .get(name)
            .ok_or_else(|| Error::UnknownTarget(name.to_string()))
    }

    /// Identity for `user` connecting to the named target.
    pub fn identity(&self, user: &str, target_name: &str) -> Result<ConnectionIdentity> {
        let target = self.target(target_name)?;
        let asset = Asset::new(target_name, target.host.clone(), target.port);
        let mut account = SystemAccount::new(target.account.as_deref().unwrap_or(user));
        if let Some(key) = &target.key {
            account = account.private_key(key);
        }
        Ok(ConnectionIdentity::new(user, asset, account))
    }

    pub fn connection_options(&self) -> ConnectionOptions {
        ConnectionOptions::new()
            .timeout(self.timeout)
            .reuse_connection(self.reuse_connections)
    }

    pub fn pool_settings(&self) -> PoolSettings {
        PoolSettings {
            known_hosts_path: self.known_hosts.clone(),
            trust_on_first_use: self.trust_first_connection,
        }
    }
}
