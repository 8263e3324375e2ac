// ABOUTME: Command-line interface definition using clap derive macros.
// ABOUTME: Defines all subcommands and their arguments.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "sshgate")]
#[command(about = "SSH bastion relay with PTY and X11 forwarding")]
#[command(version)]
pub struct Cli {
    /// Path to the configuration file (default: discovered in the current directory)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// List configured targets
    Targets,

    /// Open an interactive shell on a target through the relay
    Connect {
        /// Target name (defined in config)
        target: String,

        /// Gateway user recorded for the connection (default: $USER)
        #[arg(short, long)]
        user: Option<String>,
    },
}
