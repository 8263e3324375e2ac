// ABOUTME: In-process russh SSH server for exercising the real client stack.
// ABOUTME: Scripted shell behaviour, recorded channel requests and x11 channel-opens on demand.

use parking_lot::Mutex;
use russh::keys::{PublicKey, load_secret_key};
use russh::server::{self, Auth, Msg, Session};
use russh::{Channel, ChannelId, CryptoVec, Pty};
use sshgate::srvconn::{Asset, ConnectionIdentity, SystemAccount};
use sshgate::ssh::{ClientPool, PoolSettings};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

/// A request the server saw on a session channel.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    X11 {
        protocol: String,
        cookie: String,
        screen: u32,
    },
    Pty {
        term: String,
        cols: u32,
        rows: u32,
        modes: Vec<(Pty, u32)>,
    },
    Shell,
    WindowChange {
        cols: u32,
        rows: u32,
    },
}

/// What the remote shell does once started.
#[derive(Debug, Clone, Copy)]
pub enum Shell {
    /// Print the bytes, exit 0 and close the channel.
    Print(&'static [u8]),
    /// Echo input back until the client goes away.
    Echo,
    /// Write this many KiB of output without waiting for anyone to read it.
    Flood(usize),
}

#[derive(Debug, Clone, Copy)]
pub struct Behaviour {
    pub shell: Shell,
    pub reject_x11: bool,
    pub reject_shell: bool,
}

impl Default for Behaviour {
    fn default() -> Self {
        Self {
            shell: Shell::Echo,
            reject_x11: false,
            reject_shell: false,
        }
    }
}

#[derive(Default)]
struct State {
    events: Mutex<Vec<ServerEvent>>,
    /// Handle of the most recent connection, for server-initiated channel opens.
    handle: Mutex<Option<server::Handle>>,
    shell_channel: Mutex<Option<ChannelId>>,
    connections: AtomicUsize,
    disconnections: AtomicUsize,
}

/// SSH server on a loopback port, accepting any public key.
pub struct TestServer {
    port: u16,
    state: Arc<State>,
    known_hosts: tempfile::TempDir,
    accept_loop: JoinHandle<()>,
}

impl TestServer {
    pub async fn start(behaviour: Behaviour) -> Self {
        let host_key = load_secret_key(fixture("host_key"), None).expect("host key fixture");
        let config = Arc::new(server::Config {
            auth_rejection_time: Duration::from_millis(10),
            auth_rejection_time_initial: Some(Duration::ZERO),
            keys: vec![host_key],
            ..Default::default()
        });

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let state = Arc::new(State::default());

        let accept_state = Arc::clone(&state);
        let accept_loop = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                accept_state.connections.fetch_add(1, Ordering::SeqCst);
                let handler = Connection {
                    behaviour,
                    state: Arc::clone(&accept_state),
                };
                let config = Arc::clone(&config);
                let state = Arc::clone(&accept_state);
                tokio::spawn(async move {
                    match server::run_stream(config, stream, handler).await {
                        Ok(session) => {
                            if let Err(e) = session.await {
                                tracing::debug!("test server session error: {}", e);
                            }
                        }
                        Err(e) => tracing::debug!("test server handshake error: {}", e),
                    }
                    state.disconnections.fetch_add(1, Ordering::SeqCst);
                });
            }
        });

        Self {
            port,
            state,
            known_hosts: tempfile::tempdir().unwrap(),
            accept_loop,
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn identity(&self) -> ConnectionIdentity {
        ConnectionIdentity::new(
            "alice",
            Asset::new("test", "127.0.0.1", self.port),
            SystemAccount::new("tester").private_key(fixture("test_key")),
        )
    }

    /// A pool that learns this server's host key on first use.
    pub fn pool(&self) -> ClientPool {
        ClientPool::new(PoolSettings {
            known_hosts_path: Some(self.known_hosts.path().join("known_hosts")),
            trust_on_first_use: true,
        })
    }

    /// A pool with an empty known_hosts file and no trust on first use.
    pub fn strict_pool(&self) -> ClientPool {
        ClientPool::new(PoolSettings {
            known_hosts_path: Some(self.known_hosts.path().join("strict_known_hosts")),
            trust_on_first_use: false,
        })
    }

    pub fn events(&self) -> Vec<ServerEvent> {
        self.state.events.lock().clone()
    }

    pub fn connections(&self) -> usize {
        self.state.connections.load(Ordering::SeqCst)
    }

    pub fn disconnections(&self) -> usize {
        self.state.disconnections.load(Ordering::SeqCst)
    }

    /// Wait until the server has recorded `event`.
    pub async fn saw(&self, event: ServerEvent) {
        while !self.events().contains(&event) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Wait until `n` connections have ended.
    pub async fn disconnected(&self, n: usize) {
        while self.disconnections() < n {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Open an x11 channel towards the most recently connected client.
    pub async fn open_x11(&self, address: &str, port: u32) -> Channel<Msg> {
        let handle = self
            .state
            .handle
            .lock()
            .clone()
            .expect("no client connected");
        handle
            .channel_open_x11(address, port)
            .await
            .expect("client refused x11 channel")
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.accept_loop.abort();
    }
}

fn fixture(name: &str) -> String {
    format!("{}/tests/fixtures/{}", env!("CARGO_MANIFEST_DIR"), name)
}

struct Connection {
    behaviour: Behaviour,
    state: Arc<State>,
}

impl Connection {
    fn record(&self, event: ServerEvent) {
        self.state.events.lock().push(event);
    }

    fn is_shell(&self, channel: ChannelId) -> bool {
        *self.state.shell_channel.lock() == Some(channel)
    }
}

impl server::Handler for Connection {
    type Error = russh::Error;

    async fn auth_publickey(&mut self, _: &str, _: &PublicKey) -> Result<Auth, Self::Error> {
        Ok(Auth::Accept)
    }

    async fn channel_open_session(
        &mut self,
        _channel: Channel<Msg>,
        session: &mut Session,
    ) -> Result<bool, Self::Error> {
        *self.state.handle.lock() = Some(session.handle());
        Ok(true)
    }

    async fn x11_request(
        &mut self,
        channel: ChannelId,
        _single_connection: bool,
        protocol: &str,
        cookie: &str,
        screen: u32,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.record(ServerEvent::X11 {
            protocol: protocol.to_string(),
            cookie: cookie.to_string(),
            screen,
        });
        if self.behaviour.reject_x11 {
            session.channel_failure(channel)?;
        } else {
            session.channel_success(channel)?;
        }
        Ok(())
    }

    async fn pty_request(
        &mut self,
        channel: ChannelId,
        term: &str,
        cols: u32,
        rows: u32,
        _pix_width: u32,
        _pix_height: u32,
        modes: &[(Pty, u32)],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.record(ServerEvent::Pty {
            term: term.to_string(),
            cols,
            rows,
            modes: modes.to_vec(),
        });
        session.channel_success(channel)?;
        Ok(())
    }

    async fn shell_request(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.record(ServerEvent::Shell);
        if self.behaviour.reject_shell {
            session.channel_failure(channel)?;
            return Ok(());
        }
        session.channel_success(channel)?;
        *self.state.shell_channel.lock() = Some(channel);

        let handle = session.handle();
        match self.behaviour.shell {
            Shell::Print(output) => {
                tokio::spawn(async move {
                    let _ = handle.data(channel, CryptoVec::from_slice(output)).await;
                    let _ = handle.exit_status_request(channel, 0).await;
                    let _ = handle.eof(channel).await;
                    let _ = handle.close(channel).await;
                });
            }
            Shell::Flood(kib) => {
                tokio::spawn(async move {
                    let chunk = [b'x'; 1024];
                    for _ in 0..kib {
                        if handle
                            .data(channel, CryptoVec::from_slice(&chunk))
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                });
            }
            Shell::Echo => {}
        }
        Ok(())
    }

    async fn window_change_request(
        &mut self,
        _channel: ChannelId,
        cols: u32,
        rows: u32,
        _pix_width: u32,
        _pix_height: u32,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.record(ServerEvent::WindowChange { cols, rows });
        Ok(())
    }

    async fn data(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        if matches!(self.behaviour.shell, Shell::Echo) && self.is_shell(channel) {
            session.data(channel, CryptoVec::from_slice(data))?;
        }
        Ok(())
    }
}
