// ABOUTME: russh-backed collaborators of the SSH server connection.
// ABOUTME: Upstream client transport, shell session, client pool and inbound adapter.

mod client;
mod error;
mod inbound;
mod pool;
mod session;

pub use client::{Client, SessionConfig};
pub use error::{Error, Result};
pub use inbound::RusshInbound;
pub use pool::{ClientPool, PoolSettings};
pub use session::RusshSession;
