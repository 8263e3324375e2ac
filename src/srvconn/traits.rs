// ABOUTME: Capabilities the SSH bridge depends on: transport pool, upstream session, inbound side.
// ABOUTME: Injected as traits so pooling strategies and SSH backends can be substituted.

use super::identity::ConnectionIdentity;
use super::x11::{X11Originator, X11Request};
use super::{PtyRequest, WindowSize};
use crate::ssh::Result;
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// A bidirectional byte stream carried by one SSH channel.
pub trait RelayStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T> RelayStream for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

pub type BoxedStream = Box<dyn RelayStream>;

/// Inbound `x11` channel-opens from the upstream server.
pub type X11Opens = mpsc::UnboundedReceiver<Box<dyn PendingX11Channel>>;

/// Input and output byte streams of an upstream shell.
pub struct ShellStdio {
    pub stdin: Box<dyn AsyncWrite + Unpin + Send>,
    pub stdout: Box<dyn AsyncRead + Unpin + Send>,
}

/// Registry and cancellation scope for background tasks bound to one upstream connection.
///
/// The token is cancelled when the connection ends; every relay task spawned
/// through the scope observes it.
#[derive(Debug, Clone, Default)]
pub struct RelayScope {
    token: CancellationToken,
    tracker: TaskTracker,
}

impl RelayScope {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn tracker(&self) -> &TaskTracker {
        &self.tracker
    }

    pub fn spawn<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.tracker.spawn(task);
    }

    /// Cancel every task in the scope and stop accepting new ones.
    pub fn shutdown(&self) {
        self.token.cancel();
        self.tracker.close();
    }

    /// Wait for all tasks to finish. Only returns after [`RelayScope::shutdown`].
    pub async fn wait(&self) {
        self.tracker.wait().await;
    }
}

/// Source of transport handles. Owns reuse and disposal policy.
#[async_trait]
pub trait Pool: Send + Sync + 'static {
    type Transport: Transport;

    async fn acquire(
        &self,
        identity: &ConnectionIdentity,
        timeout: Duration,
        reuse: bool,
    ) -> Result<Arc<Self::Transport>>;

    /// Return a handle. Called at most once per acquired handle.
    async fn recycle(&self, transport: Arc<Self::Transport>);
}

/// An established SSH connection to a target host.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    type Session: UpstreamSession;

    async fn open_session(&self) -> Result<Self::Session>;

    /// Register the receiver for inbound `x11` channel-opens.
    ///
    /// Replaces any earlier registration; the previous receiver sees end of stream.
    fn listen_x11(&self) -> X11Opens;

    fn relay_scope(&self) -> RelayScope;
}

/// One upstream session channel, driven through pty and shell setup.
#[async_trait]
pub trait UpstreamSession: Send + Sync + 'static {
    /// Send `x11-req` and wait for the peer to accept it.
    async fn request_x11(&mut self, request: &X11Request) -> Result<()>;

    async fn request_pty(&mut self, pty: &PtyRequest) -> Result<()>;

    /// Hand out the session's stdin and stdout. Succeeds once.
    fn take_stdio(&mut self) -> Result<ShellStdio>;

    async fn request_shell(&mut self) -> Result<()>;

    async fn window_change(&self, size: WindowSize) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

/// An `x11` channel-open received from the upstream server.
#[async_trait]
pub trait PendingX11Channel: Send {
    /// Originator address and port carried in the channel-open.
    fn originator(&self) -> &X11Originator;

    async fn accept(self: Box<Self>) -> Result<BoxedStream>;
}

/// The client-facing SSH session a gateway user is attached through.
pub trait InboundSession: Send + Sync {
    /// Payload of the client's `x11-req`, if it asked for X11 forwarding.
    fn x11_request(&self) -> Option<&X11Request>;

    fn connection(&self) -> Arc<dyn InboundConnection>;
}

/// The client-facing SSH connection, used to open channels back to the user.
#[async_trait]
pub trait InboundConnection: Send + Sync {
    async fn open_x11_channel(&self, originator: &X11Originator) -> Result<InboundChannel>;
}

/// A channel opened on the client-facing connection.
pub struct InboundChannel {
    pub stream: BoxedStream,
    /// Out-of-band requests the client sends on this channel.
    pub requests: mpsc::UnboundedReceiver<ChannelRequest>,
}

/// A channel request awaiting a reply.
#[derive(Debug)]
pub struct ChannelRequest {
    kind: String,
    reply: Option<oneshot::Sender<bool>>,
}

impl ChannelRequest {
    /// `reply` is None when the sender did not set want-reply.
    pub fn new(kind: impl Into<String>, reply: Option<oneshot::Sender<bool>>) -> Self {
        Self {
            kind: kind.into(),
            reply,
        }
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// Answer "not supported".
    pub fn reject(self) {
        if let Some(reply) = self.reply {
            let _ = reply.send(false);
        }
    }
}
