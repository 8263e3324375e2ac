// ABOUTME: Identity of a gateway connection: requesting user, target asset, system account.
// ABOUTME: Used as the transport pool key and for audit.

use std::fmt;
use std::path::PathBuf;

/// A host reachable through the gateway.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Asset {
    /// Display name of the asset.
    pub name: String,
    /// Hostname or IP address.
    pub address: String,
    pub port: u16,
}

impl Asset {
    pub fn new(name: impl Into<String>, address: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
            port,
        }
    }
}

/// The account used to log in on the asset.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SystemAccount {
    pub username: String,
    /// Private key for this account. If None, the agent or default keys are used.
    pub private_key: Option<PathBuf>,
}

impl SystemAccount {
    pub fn new(username: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            private_key: None,
        }
    }

    pub fn private_key(mut self, path: impl Into<PathBuf>) -> Self {
        self.private_key = Some(path.into());
        self
    }
}

/// Immutable `(user, asset, account)` tuple identifying one logical connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionIdentity {
    user: String,
    asset: Asset,
    account: SystemAccount,
}

impl ConnectionIdentity {
    pub fn new(user: impl Into<String>, asset: Asset, account: SystemAccount) -> Self {
        Self {
            user: user.into(),
            asset,
            account,
        }
    }

    /// The gateway user who requested the connection.
    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn asset(&self) -> &Asset {
        &self.asset
    }

    pub fn account(&self) -> &SystemAccount {
        &self.account
    }
}

impl fmt::Display for ConnectionIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} -> {}@{}({}:{})",
            self.user, self.account.username, self.asset.name, self.asset.address, self.asset.port
        )
    }
}
