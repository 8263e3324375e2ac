// ABOUTME: Entry point for the sshgate CLI application.
// ABOUTME: Parses arguments and dispatches to appropriate command handlers.

mod cli;

use clap::Parser;
use cli::{Cli, Commands};
use sshgate::config::GatewayConfig;
use sshgate::error::Result;
use sshgate::srvconn::{SshConnection, WindowSize};
use sshgate::ssh::{self, ClientPool};
use std::env;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize tracing subscriber based on verbose flag
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("warn")
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    let result = run(cli).await;

    if let Err(e) = result {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = match &cli.config {
        Some(path) => GatewayConfig::load(path)?,
        None => GatewayConfig::discover(&env::current_dir()?)?,
    };

    match cli.command {
        Commands::Targets => {
            for (name, target) in &config.targets {
                let account = target.account.as_deref().unwrap_or("-");
                println!("{}\t{}@{}:{}", name, account, target.host, target.port);
            }
            Ok(())
        }
        Commands::Connect { target, user } => {
            let user = user
                .or_else(|| env::var("USER").ok())
                .unwrap_or_else(|| "sshgate".to_string());
            connect(&config, &user, &target).await
        }
    }
}

/// Relay the local terminal to a shell on `target` until either side ends.
async fn connect(config: &GatewayConfig, user: &str, target: &str) -> Result<()> {
    let identity = config.identity(user, target)?;
    let pool = Arc::new(ClientPool::new(config.pool_settings()));
    let mut conn = SshConnection::new(identity, pool, config.connection_options());

    let term = env::var("TERM").unwrap_or_else(|_| config.term.clone());
    conn.connect(None, terminal_size(), &term).await?;
    let conn = Arc::new(conn);

    let mut output = {
        let conn = Arc::clone(&conn);
        tokio::spawn(async move {
            let mut stdout = tokio::io::stdout();
            let mut buf = vec![0u8; 8192];
            loop {
                match conn.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if stdout.write_all(&buf[..n]).await.is_err() {
                            break;
                        }
                        let _ = stdout.flush().await;
                    }
                }
            }
        })
    };

    let mut stdin = tokio::io::stdin();
    let mut buf = vec![0u8; 8192];
    loop {
        tokio::select! {
            r = stdin.read(&mut buf) => match r {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if conn.write(&buf[..n]).await.is_err() {
                        break;
                    }
                }
            },
            _ = &mut output => break,
        }
    }

    match conn.close().await {
        Ok(()) | Err(ssh::Error::ChannelClosed) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Size from LINES/COLUMNS, falling back to 24x80.
fn terminal_size() -> WindowSize {
    let dim = |name: &str, default: u32| {
        env::var(name)
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(default)
    };
    WindowSize::new(dim("LINES", 24), dim("COLUMNS", 80))
}
