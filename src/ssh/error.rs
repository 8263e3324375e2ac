// ABOUTME: SSH-specific error types.
// ABOUTME: Covers transport acquisition, authentication, channel requests and relay failures.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("connection failed: {0}")]
    Connection(String),

    #[error("authentication failed: no valid credentials")]
    AuthenticationFailed,

    #[error("SSH agent not available: {0}")]
    AgentUnavailable(String),

    #[error("failed to load key from {path}: {reason}")]
    KeyLoadFailed { path: PathBuf, reason: String },

    #[error("transport acquisition timed out after {0:?}")]
    AcquireTimeout(Duration),

    #[error("ssh: {0} request rejected by peer")]
    RequestRejected(&'static str),

    #[error("channel open failed: {0}")]
    ChannelOpenFailed(String),

    #[error("channel closed unexpectedly")]
    ChannelClosed,

    #[error("upstream session is not established")]
    SessionNotEstablished,

    #[error("connection already closed")]
    Closed,

    #[error("session stdio already taken")]
    StdioTaken,

    #[error("SSH protocol error: {0}")]
    Protocol(#[from] russh::Error),

    #[error("SSH key error: {0}")]
    Key(#[from] russh::keys::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
