// ABOUTME: Library root for sshgate - exposes public types for testing.
// ABOUTME: The main binary is in main.rs.

pub mod config;
pub mod error;
pub mod srvconn;
pub mod ssh;
