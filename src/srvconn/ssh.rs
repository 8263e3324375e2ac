// ABOUTME: SSH server connection: an interactive shell with PTY on a pooled upstream transport.
// ABOUTME: Relays terminal I/O and resizes, arms X11 forwarding, recycles the transport exactly once.

use super::identity::ConnectionIdentity;
use super::traits::{InboundSession, Pool, ShellStdio, Transport, UpstreamSession};
use super::x11::handle_x11_proxy;
use super::{PROTOCOL_SSH, PtyRequest, ServerConnection, WindowSize};
use crate::ssh::{Error, Result};
use async_trait::async_trait;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;

/// Transport acquisition timeout used when none is configured.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Options for an [`SshConnection`].
#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    /// How long transport acquisition may take (default: 30 seconds).
    pub timeout: Duration,
    /// Whether the pool may hand out a transport shared with other sessions.
    pub reuse_connection: bool,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            reuse_connection: false,
        }
    }
}

impl ConnectionOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// A zero timeout selects the default.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = if timeout.is_zero() {
            DEFAULT_TIMEOUT
        } else {
            timeout
        };
        self
    }

    pub fn reuse_connection(mut self, reuse: bool) -> Self {
        self.reuse_connection = reuse;
        self
    }
}

/// Single-fire gate guarding the recycle call.
#[derive(Debug, Default)]
struct CloseOnce(AtomicBool);

impl CloseOnce {
    /// Returns true for exactly one caller.
    fn fire(&self) -> bool {
        self.0
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn is_fired(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// A live upstream shell.
struct Shell<S> {
    session: S,
    stdin: Mutex<Box<dyn AsyncWrite + Unpin + Send>>,
    stdout: Mutex<Box<dyn AsyncRead + Unpin + Send>>,
}

/// A gateway session's connection to a target host over SSH.
///
/// Reads and writes may run concurrently with each other and with
/// [`SshConnection::set_win_size`] and [`SshConnection::close`].
pub struct SshConnection<P: Pool> {
    identity: ConnectionIdentity,
    options: ConnectionOptions,
    pool: Arc<P>,
    client: Option<Arc<P::Transport>>,
    shell: Option<Shell<<P::Transport as Transport>::Session>>,
    close_once: CloseOnce,
}

impl<P: Pool> std::fmt::Debug for SshConnection<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshConnection")
            .field("identity", &self.identity)
            .field("options", &self.options)
            .field("has_client", &self.client.is_some())
            .field("connected", &self.shell.is_some())
            .finish()
    }
}

impl<P: Pool> SshConnection<P> {
    pub fn new(identity: ConnectionIdentity, pool: Arc<P>, options: ConnectionOptions) -> Self {
        Self {
            identity,
            options,
            pool,
            client: None,
            shell: None,
            close_once: CloseOnce::default(),
        }
    }

    /// Use an already-acquired transport instead of asking the pool on connect.
    pub fn set_client(&mut self, client: Arc<P::Transport>) {
        self.client = Some(client);
    }

    pub fn identity(&self) -> &ConnectionIdentity {
        &self.identity
    }

    pub fn protocol(&self) -> &'static str {
        PROTOCOL_SSH
    }

    pub fn timeout(&self) -> Duration {
        self.options.timeout
    }

    /// Acquire a transport if needed and start an interactive shell on it.
    ///
    /// If shell setup fails the transport is recycled before the error is returned.
    pub async fn connect(
        &mut self,
        inbound: Option<&dyn InboundSession>,
        size: WindowSize,
        term: &str,
    ) -> Result<()> {
        if self.close_once.is_fired() {
            return Err(Error::Closed);
        }

        let client = match &self.client {
            Some(client) => Arc::clone(client),
            None => {
                let client = self
                    .pool
                    .acquire(
                        &self.identity,
                        self.options.timeout,
                        self.options.reuse_connection,
                    )
                    .await
                    .inspect_err(|e| {
                        tracing::error!(identity = %self.identity, "New SSH client err: {}", e);
                    })?;
                self.client = Some(Arc::clone(&client));
                client
            }
        };

        match invoke_shell(client.as_ref(), inbound, size, term).await {
            Ok(shell) => {
                tracing::info!(identity = %self.identity, "Start ssh shell session success");
                self.shell = Some(shell);
                Ok(())
            }
            Err(e) => {
                tracing::error!(identity = %self.identity, "Start ssh shell session err: {}", e);
                if let Some(client) = self.client.take() {
                    self.pool.recycle(client).await;
                }
                Err(e)
            }
        }
    }

    /// Read shell output.
    pub async fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        let shell = self.shell.as_ref().ok_or_else(not_connected)?;
        shell.stdout.lock().await.read(buf).await
    }

    /// Write shell input.
    pub async fn write(&self, buf: &[u8]) -> io::Result<usize> {
        let shell = self.shell.as_ref().ok_or_else(not_connected)?;
        let mut stdin = shell.stdin.lock().await;
        let n = stdin.write(buf).await?;
        stdin.flush().await?;
        Ok(n)
    }

    pub async fn set_win_size(&self, size: WindowSize) -> Result<()> {
        let shell = self.shell.as_ref().ok_or(Error::SessionNotEstablished)?;
        shell.session.window_change(size).await
    }

    /// Recycle the transport (once, however many times this is called) and close the session.
    pub async fn close(&self) -> Result<()> {
        if let Some(client) = &self.client {
            if self.close_once.fire() {
                tracing::debug!(identity = %self.identity, "recycling ssh client");
                self.pool.recycle(Arc::clone(client)).await;
            }
        }

        match &self.shell {
            Some(shell) => shell.session.close().await,
            None => Ok(()),
        }
    }
}

impl<P: Pool> Drop for SshConnection<P> {
    fn drop(&mut self) {
        if self.client.is_some() && !self.close_once.is_fired() {
            tracing::warn!(identity = %self.identity, "ssh connection dropped without close");
        }
    }
}

async fn invoke_shell<T: Transport>(
    client: &T,
    inbound: Option<&dyn InboundSession>,
    size: WindowSize,
    term: &str,
) -> Result<Shell<T::Session>> {
    let mut session = client.open_session().await?;

    // x11-req has to go out before pty-req and shell.
    if let Some(inbound) = inbound {
        if let Err(e) = handle_x11_proxy(client, &mut session, inbound).await {
            tracing::error!("handle x11 failed, err: {}", e);
        }
    }

    match start_shell(&mut session, size, term).await {
        Ok(ShellStdio { stdin, stdout }) => Ok(Shell {
            session,
            stdin: Mutex::new(stdin),
            stdout: Mutex::new(stdout),
        }),
        Err(e) => {
            let _ = session.close().await;
            Err(e)
        }
    }
}

async fn start_shell<S: UpstreamSession>(
    session: &mut S,
    size: WindowSize,
    term: &str,
) -> Result<ShellStdio> {
    session.request_pty(&PtyRequest::new(term, size)).await?;
    let stdio = session.take_stdio()?;
    session.request_shell().await?;
    Ok(stdio)
}

fn not_connected() -> io::Error {
    io::Error::new(
        io::ErrorKind::NotConnected,
        "upstream session is not established",
    )
}

#[async_trait]
impl<P: Pool> ServerConnection for SshConnection<P> {
    fn protocol(&self) -> &'static str {
        SshConnection::protocol(self)
    }

    async fn connect(
        &mut self,
        inbound: Option<&dyn InboundSession>,
        size: WindowSize,
        term: &str,
    ) -> Result<()> {
        SshConnection::connect(self, inbound, size, term).await
    }

    async fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        SshConnection::read(self, buf).await
    }

    async fn write(&self, buf: &[u8]) -> io::Result<usize> {
        SshConnection::write(self, buf).await
    }

    async fn set_win_size(&self, size: WindowSize) -> Result<()> {
        SshConnection::set_win_size(self, size).await
    }

    fn timeout(&self) -> Duration {
        SshConnection::timeout(self)
    }

    async fn close(&self) -> Result<()> {
        SshConnection::close(self).await
    }
}
