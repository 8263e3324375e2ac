// ABOUTME: Server-side connections a gateway session relays to.
// ABOUTME: Defines the protocol-agnostic ServerConnection trait and terminal parameters.

mod identity;
mod ssh;
mod traits;
pub mod x11;

pub use identity::{Asset, ConnectionIdentity, SystemAccount};
pub use ssh::{ConnectionOptions, DEFAULT_TIMEOUT, SshConnection};
pub use traits::{
    BoxedStream, ChannelRequest, InboundChannel, InboundConnection, InboundSession,
    PendingX11Channel, Pool, RelayScope, RelayStream, ShellStdio, Transport, UpstreamSession,
    X11Opens,
};
pub use x11::{X11Originator, X11Request};

use crate::ssh::Result;
use async_trait::async_trait;
use russh::Pty;
use std::io;
use std::time::Duration;

/// Protocol identifier reported by SSH-carried connections.
pub const PROTOCOL_SSH: &str = "ssh";

/// Terminal modes sent with every pty-req: echo on, 14.4 kbaud in and out.
pub const BASELINE_TERMINAL_MODES: [(Pty, u32); 3] = [
    (Pty::ECHO, 1),
    (Pty::TTY_OP_ISPEED, 14400),
    (Pty::TTY_OP_OSPEED, 14400),
];

/// Terminal dimensions in character cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowSize {
    pub rows: u32,
    pub cols: u32,
}

impl WindowSize {
    pub fn new(rows: u32, cols: u32) -> Self {
        Self { rows, cols }
    }
}

/// Parameters of a pty-req.
#[derive(Debug, Clone, PartialEq)]
pub struct PtyRequest {
    pub term: String,
    pub size: WindowSize,
    pub modes: Vec<(Pty, u32)>,
}

impl PtyRequest {
    /// A request with the baseline terminal modes.
    pub fn new(term: impl Into<String>, size: WindowSize) -> Self {
        Self {
            term: term.into(),
            size,
            modes: BASELINE_TERMINAL_MODES.to_vec(),
        }
    }
}

/// A connection to a target host that a gateway session relays terminal I/O to.
///
/// Implemented once per protocol; callers dispatch on [`ServerConnection::protocol`].
#[async_trait]
pub trait ServerConnection: Send + Sync {
    fn protocol(&self) -> &'static str;

    /// Establish the remote shell, optionally forwarding X11 for `inbound`.
    async fn connect(
        &mut self,
        inbound: Option<&dyn InboundSession>,
        size: WindowSize,
        term: &str,
    ) -> Result<()>;

    async fn read(&self, buf: &mut [u8]) -> io::Result<usize>;

    async fn write(&self, buf: &[u8]) -> io::Result<usize>;

    async fn set_win_size(&self, size: WindowSize) -> Result<()>;

    fn timeout(&self) -> Duration;

    async fn close(&self) -> Result<()>;
}
