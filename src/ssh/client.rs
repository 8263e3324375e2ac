// ABOUTME: Upstream SSH transport using russh.
// ABOUTME: Handles connection, host key verification, authentication and inbound x11 channels.

use super::error::{Error, Result};
use super::session::RusshSession;
use crate::srvconn::{
    BoxedStream, ConnectionIdentity, PendingX11Channel, RelayScope, Transport, X11Opens,
    X11Originator,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use russh::client::{self, Config, Handle};
use russh::keys::agent::client::AgentClient;
use russh::keys::known_hosts::{
    check_known_hosts, check_known_hosts_path, learn_known_hosts, learn_known_hosts_path,
};
use russh::keys::{PrivateKeyWithHashAlg, load_secret_key, ssh_key};
use russh::{Channel, Disconnect};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UnixStream;
use tokio::sync::mpsc;
use tokio_util::sync::DropGuard;

/// Configuration for establishing an upstream SSH connection.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Remote host to connect to.
    pub host: String,
    /// SSH port (default: 22).
    pub port: u16,
    /// Username for authentication.
    pub user: String,
    /// Optional path to private key file.
    /// If None, will try SSH agent then default key locations.
    pub key_path: Option<PathBuf>,
    /// Whether to accept unknown hosts (Trust On First Use).
    /// If false, connection to unknown hosts will fail.
    pub trust_on_first_use: bool,
    /// Optional path to known_hosts file.
    /// If None, uses the default ~/.ssh/known_hosts.
    pub known_hosts_path: Option<PathBuf>,
    /// Interval between keepalive messages (default: 30 seconds).
    pub keepalive_interval: Duration,
}

impl SessionConfig {
    pub fn new(host: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: 22,
            user: user.into(),
            key_path: None,
            trust_on_first_use: false,
            known_hosts_path: None,
            keepalive_interval: Duration::from_secs(30),
        }
    }

    /// Address, login and key taken from a connection identity.
    pub fn for_identity(identity: &ConnectionIdentity) -> Self {
        let asset = identity.asset();
        let account = identity.account();
        let config = Self::new(asset.address.clone(), account.username.clone()).port(asset.port);
        match &account.private_key {
            Some(key) => config.key_path(key),
            None => config,
        }
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn key_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.key_path = Some(path.into());
        self
    }

    pub fn trust_on_first_use(mut self, tofu: bool) -> Self {
        self.trust_on_first_use = tofu;
        self
    }

    pub fn known_hosts_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.known_hosts_path = Some(path.into());
        self
    }

    pub fn keepalive_interval(mut self, interval: Duration) -> Self {
        self.keepalive_interval = interval;
        self
    }
}

/// Where inbound x11 channel-opens are delivered. None until forwarding is armed.
type X11Sink = Arc<Mutex<Option<mpsc::UnboundedSender<Box<dyn PendingX11Channel>>>>>;

/// SSH client handler for russh.
pub(crate) struct SshHandler {
    host: String,
    port: u16,
    trust_on_first_use: bool,
    known_hosts_path: Option<PathBuf>,
    x11_sink: X11Sink,
    /// Cancels the relay scope when russh drops the handler at connection end.
    _teardown: DropGuard,
}

impl client::Handler for SshHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &ssh_key::PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        let check_result = match &self.known_hosts_path {
            Some(path) => check_known_hosts_path(&self.host, self.port, server_public_key, path),
            None => check_known_hosts(&self.host, self.port, server_public_key),
        };

        match check_result {
            Ok(true) => Ok(true),
            Ok(false) => {
                if self.trust_on_first_use {
                    tracing::warn!(
                        "Trust-On-First-Use: accepting unknown host key for {}:{}",
                        self.host,
                        self.port
                    );
                    let learn_result = match &self.known_hosts_path {
                        Some(path) => {
                            learn_known_hosts_path(&self.host, self.port, server_public_key, path)
                        }
                        None => learn_known_hosts(&self.host, self.port, server_public_key),
                    };
                    if let Err(e) = learn_result {
                        tracing::warn!("Failed to save host key to known_hosts: {}", e);
                    }
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            Err(russh::keys::Error::KeyChanged { .. }) => {
                tracing::error!("Host key for {}:{} has changed", self.host, self.port);
                Ok(false)
            }
            Err(_) => Ok(self.trust_on_first_use),
        }
    }

    async fn server_channel_open_x11(
        &mut self,
        channel: Channel<client::Msg>,
        originator_address: &str,
        originator_port: u32,
        _session: &mut client::Session,
    ) -> std::result::Result<(), Self::Error> {
        let sink = self.x11_sink.lock().clone().filter(|tx| !tx.is_closed());
        let Some(tx) = sink else {
            tracing::debug!("x11 channel-open without forwarding armed, closing");
            let _ = channel.close().await;
            return Ok(());
        };

        let pending = RusshX11Channel {
            channel,
            originator: X11Originator {
                address: originator_address.to_string(),
                port: originator_port,
            },
        };
        if tx.send(Box::new(pending)).is_err() {
            tracing::debug!("x11 listener went away, dropping channel");
        }
        Ok(())
    }
}

/// An x11 channel the upstream server opened towards us.
struct RusshX11Channel {
    channel: Channel<client::Msg>,
    originator: X11Originator,
}

#[async_trait]
impl PendingX11Channel for RusshX11Channel {
    fn originator(&self) -> &X11Originator {
        &self.originator
    }

    // russh confirms the channel before handing it to the handler.
    async fn accept(self: Box<Self>) -> Result<BoxedStream> {
        Ok(Box::new(self.channel.into_stream()))
    }
}

/// Authentication method resolved from config.
enum AuthMethod {
    Agent(AgentClient<UnixStream>),
    KeyFile(Arc<ssh_key::PrivateKey>),
}

/// An established, authenticated SSH connection to a target host.
pub struct Client {
    identity: ConnectionIdentity,
    config: SessionConfig,
    handle: Handle<SshHandler>,
    x11_sink: X11Sink,
    scope: RelayScope,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("identity", &self.identity)
            .field("config", &self.config)
            .field("handle", &"<russh::Handle>")
            .finish()
    }
}

impl Client {
    /// Connect to the remote host and authenticate.
    pub async fn connect(identity: ConnectionIdentity, config: SessionConfig) -> Result<Self> {
        let auth_method = Self::resolve_auth_method(&config).await?;

        let russh_config = Config {
            keepalive_interval: Some(config.keepalive_interval),
            ..Default::default()
        };

        let scope = RelayScope::new();
        let x11_sink: X11Sink = Arc::new(Mutex::new(None));
        let handler = SshHandler {
            host: config.host.clone(),
            port: config.port,
            trust_on_first_use: config.trust_on_first_use,
            known_hosts_path: config.known_hosts_path.clone(),
            x11_sink: Arc::clone(&x11_sink),
            _teardown: scope.token().clone().drop_guard(),
        };

        let mut handle = client::connect(
            Arc::new(russh_config),
            (config.host.as_str(), config.port),
            handler,
        )
        .await
        .map_err(|e| {
            if e.to_string().contains("Connection refused") {
                Error::Connection(format!(
                    "connection refused to {}:{}",
                    config.host, config.port
                ))
            } else {
                Error::Connection(e.to_string())
            }
        })?;

        let auth_success = Self::authenticate(&mut handle, &config, auth_method).await?;
        if !auth_success {
            return Err(Error::AuthenticationFailed);
        }

        tracing::debug!(%identity, "ssh client connected");
        Ok(Self {
            identity,
            config,
            handle,
            x11_sink,
            scope,
        })
    }

    /// Resolve which authentication method to use.
    async fn resolve_auth_method(config: &SessionConfig) -> Result<AuthMethod> {
        if let Some(key_path) = &config.key_path {
            let key = load_secret_key(key_path, None).map_err(|e| Error::KeyLoadFailed {
                path: key_path.clone(),
                reason: e.to_string(),
            })?;
            return Ok(AuthMethod::KeyFile(Arc::new(key)));
        }

        if let Ok(agent) = AgentClient::connect_env().await {
            return Ok(AuthMethod::Agent(agent));
        }

        let home = std::env::var("HOME").map_err(|_| {
            Error::AgentUnavailable("SSH agent not available and HOME not set".to_string())
        })?;

        let default_keys = [
            format!("{}/.ssh/id_ed25519", home),
            format!("{}/.ssh/id_rsa", home),
            format!("{}/.ssh/id_ecdsa", home),
        ];

        for key_path in &default_keys {
            if let Ok(key) = load_secret_key(key_path, None) {
                return Ok(AuthMethod::KeyFile(Arc::new(key)));
            }
        }

        Err(Error::AgentUnavailable(
            "SSH agent not available and no default keys found".to_string(),
        ))
    }

    async fn authenticate(
        handle: &mut Handle<SshHandler>,
        config: &SessionConfig,
        auth_method: AuthMethod,
    ) -> Result<bool> {
        match auth_method {
            AuthMethod::Agent(mut agent) => {
                let keys = agent.request_identities().await.map_err(|e| {
                    Error::AgentUnavailable(format!("failed to list agent keys: {}", e))
                })?;

                if keys.is_empty() {
                    return Err(Error::AgentUnavailable("no keys in SSH agent".to_string()));
                }

                for key in &keys {
                    match handle
                        .authenticate_publickey_with(&config.user, key.clone(), None, &mut agent)
                        .await
                    {
                        Ok(result) if result.success() => return Ok(true),
                        _ => continue,
                    }
                }
                Ok(false)
            }
            AuthMethod::KeyFile(key) => {
                let hash_alg = handle.best_supported_rsa_hash().await?.flatten();

                let result = handle
                    .authenticate_publickey(&config.user, PrivateKeyWithHashAlg::new(key, hash_alg))
                    .await?;

                Ok(result.success())
            }
        }
    }

    pub fn identity(&self) -> &ConnectionIdentity {
        &self.identity
    }

    /// Whether the underlying connection has ended.
    pub fn is_closed(&self) -> bool {
        self.handle.is_closed()
    }

    /// Stop X11 relays and disconnect.
    pub async fn disconnect(&self) -> Result<()> {
        self.scope.shutdown();
        self.handle
            .disconnect(Disconnect::ByApplication, "", "en")
            .await?;
        Ok(())
    }
}

#[async_trait]
impl Transport for Client {
    type Session = RusshSession;

    async fn open_session(&self) -> Result<RusshSession> {
        let channel = self
            .handle
            .channel_open_session()
            .await
            .map_err(|e| Error::ChannelOpenFailed(format!("session: {}", e)))?;
        Ok(RusshSession::new(channel))
    }

    fn listen_x11(&self) -> X11Opens {
        let (tx, rx) = mpsc::unbounded_channel();
        let previous = self.x11_sink.lock().replace(tx);
        if previous.is_some_and(|old| !old.is_closed()) {
            tracing::debug!(
                identity = %self.identity,
                "x11 listener replaced, earlier session stops receiving x11 channels"
            );
        }
        rx
    }

    fn relay_scope(&self) -> RelayScope {
        self.scope.clone()
    }
}
