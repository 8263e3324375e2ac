// ABOUTME: Upstream shell session over a russh session channel.
// ABOUTME: Sends pty/x11/shell requests, then relays bytes between the channel and an in-memory pipe.

use super::error::{Error, Result};
use crate::srvconn::{PtyRequest, ShellStdio, UpstreamSession, WindowSize, X11Request};
use async_trait::async_trait;
use russh::{Channel, ChannelMsg, ChannelReadHalf, ChannelWriteHalf, client};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};
use tokio_util::sync::CancellationToken;

/// Capacity of the pipe between the caller and the relay tasks, per direction.
const PIPE_CAPACITY: usize = 64 * 1024;

/// A session channel on a [`super::Client`].
///
/// Until the shell starts the channel is driven directly. Afterwards it is
/// split: two relay tasks own the read side and the pipe, while resize and
/// close go straight to the shared write side, so they never wait on a
/// caller that stopped reading output.
pub struct RusshSession {
    channel: Option<Channel<client::Msg>>,
    outgoing: Option<Arc<ChannelWriteHalf<client::Msg>>>,
    stdio: Option<DuplexStream>,
    relay_io: Option<DuplexStream>,
    stop: CancellationToken,
}

impl RusshSession {
    pub(crate) fn new(channel: Channel<client::Msg>) -> Self {
        let (stdio, relay_io) = tokio::io::duplex(PIPE_CAPACITY);
        Self {
            channel: Some(channel),
            outgoing: None,
            stdio: Some(stdio),
            relay_io: Some(relay_io),
            stop: CancellationToken::new(),
        }
    }

    fn channel(&self) -> Result<&Channel<client::Msg>> {
        self.channel.as_ref().ok_or(Error::SessionNotEstablished)
    }

    /// Wait for the success/failure reply to a want-reply request.
    async fn expect_reply(&mut self, request: &'static str) -> Result<()> {
        let channel = self.channel.as_mut().ok_or(Error::SessionNotEstablished)?;
        loop {
            match channel.wait().await {
                Some(ChannelMsg::Success) => return Ok(()),
                Some(ChannelMsg::Failure) => return Err(Error::RequestRejected(request)),
                Some(ChannelMsg::Close) | None => return Err(Error::ChannelClosed),
                Some(_) => {}
            }
        }
    }
}

impl Drop for RusshSession {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

#[async_trait]
impl UpstreamSession for RusshSession {
    async fn request_x11(&mut self, request: &X11Request) -> Result<()> {
        self.channel()?
            .request_x11(
                true,
                request.single_connection,
                request.auth_protocol.as_str(),
                request.auth_cookie.as_str(),
                request.screen_number,
            )
            .await?;
        self.expect_reply("x11-req").await
    }

    async fn request_pty(&mut self, pty: &PtyRequest) -> Result<()> {
        self.channel()?
            .request_pty(
                true,
                &pty.term,
                pty.size.cols,
                pty.size.rows,
                0,
                0,
                &pty.modes,
            )
            .await?;
        self.expect_reply("pty-req").await
    }

    fn take_stdio(&mut self) -> Result<ShellStdio> {
        let stdio = self.stdio.take().ok_or(Error::StdioTaken)?;
        let (stdout, stdin) = tokio::io::split(stdio);
        Ok(ShellStdio {
            stdin: Box::new(stdin),
            stdout: Box::new(stdout),
        })
    }

    async fn request_shell(&mut self) -> Result<()> {
        self.channel()?.request_shell(true).await?;
        self.expect_reply("shell").await?;

        let (Some(channel), Some(io)) = (self.channel.take(), self.relay_io.take()) else {
            return Err(Error::SessionNotEstablished);
        };
        let (incoming, outgoing) = channel.split();
        let outgoing = Arc::new(outgoing);
        let (input, output) = tokio::io::split(io);

        tokio::spawn(relay_input(input, Arc::clone(&outgoing), self.stop.clone()));
        tokio::spawn(relay_output(incoming, output, self.stop.clone()));
        self.outgoing = Some(outgoing);
        Ok(())
    }

    async fn window_change(&self, size: WindowSize) -> Result<()> {
        match &self.outgoing {
            Some(outgoing) => outgoing.window_change(size.cols, size.rows, 0, 0).await?,
            None => {
                self.channel()?
                    .window_change(size.cols, size.rows, 0, 0)
                    .await?
            }
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.stop.cancel();
        match &self.outgoing {
            Some(outgoing) => outgoing.close().await?,
            None => self.channel()?.close().await?,
        }
        Ok(())
    }
}

/// Move caller input onto the channel. End of input becomes channel EOF.
async fn relay_input(
    mut input: ReadHalf<DuplexStream>,
    outgoing: Arc<ChannelWriteHalf<client::Msg>>,
    stop: CancellationToken,
) {
    let mut buf = vec![0u8; 32 * 1024];
    loop {
        let n = tokio::select! {
            r = input.read(&mut buf) => match r {
                Ok(n) => n,
                Err(e) => {
                    tracing::debug!("Shell input read error: {}", e);
                    break;
                }
            },
            _ = stop.cancelled() => break,
        };

        if n == 0 {
            let _ = outgoing.eof().await;
            break;
        }

        tokio::select! {
            r = outgoing.data(&buf[..n]) => {
                if let Err(e) = r {
                    tracing::debug!("Shell channel data error: {}", e);
                    break;
                }
            }
            _ = stop.cancelled() => break,
        }
    }
}

/// Move channel output into the caller's pipe until the channel closes or the session stops.
///
/// A full pipe parks this task only; the stop token still ends it.
async fn relay_output(
    mut incoming: ChannelReadHalf,
    mut output: WriteHalf<DuplexStream>,
    stop: CancellationToken,
) {
    // Remote close ends the input side too.
    let _stop_input = stop.clone().drop_guard();

    loop {
        let msg = tokio::select! {
            msg = incoming.wait() => msg,
            _ = stop.cancelled() => break,
        };

        match msg {
            Some(ChannelMsg::Data { data }) | Some(ChannelMsg::ExtendedData { data, .. }) => {
                tokio::select! {
                    r = output.write_all(&data) => {
                        if let Err(e) = r {
                            tracing::debug!("Shell output write error: {}", e);
                            break;
                        }
                    }
                    _ = stop.cancelled() => break,
                }
            }
            Some(ChannelMsg::Eof) => {
                let _ = output.shutdown().await;
            }
            Some(ChannelMsg::ExitStatus { exit_status }) => {
                tracing::debug!(exit_status, "remote shell exited");
            }
            Some(ChannelMsg::Close) | None => break,
            Some(_) => {}
        }
    }

    let _ = output.shutdown().await;
}
