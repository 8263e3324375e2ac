// ABOUTME: X11 forwarding relay between the upstream SSH connection and the gateway client.
// ABOUTME: Arms x11-req upstream, then splices every upstream x11 channel onto a client-side one.

use super::traits::{
    BoxedStream, ChannelRequest, InboundConnection, InboundSession, RelayScope, Transport,
    UpstreamSession, X11Opens,
};
use crate::ssh::Result;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Payload of an `x11-req` channel request, relayed verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct X11Request {
    pub single_connection: bool,
    pub auth_protocol: String,
    pub auth_cookie: String,
    pub screen_number: u32,
}

/// Extra data of an `x11` channel-open: where the X client connected from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct X11Originator {
    pub address: String,
    pub port: u32,
}

/// Request X11 forwarding on `session` and start relaying X11 channels to the client.
///
/// A no-op when the inbound session carries no `x11-req` payload. Must run
/// before the pty and shell requests on the same session.
pub async fn handle_x11_proxy<T: Transport>(
    transport: &T,
    session: &mut T::Session,
    inbound: &dyn InboundSession,
) -> Result<()> {
    let Some(request) = inbound.x11_request() else {
        return Ok(());
    };

    session.request_x11(request).await?;

    let opens = transport.listen_x11();
    let scope = transport.relay_scope();
    let connection = inbound.connection();
    tracing::debug!(screen = request.screen_number, "x11 forwarding armed");
    scope.spawn(run_listener(opens, connection, scope.clone()));
    Ok(())
}

/// Relay every upstream x11 channel-open until the upstream connection ends.
async fn run_listener(
    mut opens: X11Opens,
    connection: Arc<dyn InboundConnection>,
    scope: RelayScope,
) {
    loop {
        let pending = tokio::select! {
            pending = opens.recv() => match pending {
                Some(pending) => pending,
                None => break,
            },
            _ = scope.token().cancelled() => break,
        };

        let originator = pending.originator().clone();
        let mut upstream = match pending.accept().await {
            Ok(stream) => stream,
            Err(e) => {
                tracing::warn!("Failed to accept upstream x11 channel: {}", e);
                continue;
            }
        };

        let client = match connection.open_x11_channel(&originator).await {
            Ok(channel) => channel,
            Err(e) => {
                tracing::warn!(
                    originator = %format!("{}:{}", originator.address, originator.port),
                    "Failed to open client x11 channel: {}",
                    e
                );
                let _ = upstream.shutdown().await;
                continue;
            }
        };

        tracing::debug!(
            originator = %format!("{}:{}", originator.address, originator.port),
            "relaying x11 channel"
        );
        spawn_pair(&scope, upstream, client.stream, client.requests);
    }

    tracing::debug!("x11 listener stopped");
}

/// Splice one upstream channel with its client-side twin.
///
/// Whichever direction finishes first cancels the pair, closing both channels.
fn spawn_pair(
    scope: &RelayScope,
    upstream: BoxedStream,
    client: BoxedStream,
    requests: mpsc::UnboundedReceiver<ChannelRequest>,
) {
    let pair = scope.token().child_token();
    let (upstream_rx, upstream_tx) = tokio::io::split(upstream);
    let (client_rx, client_tx) = tokio::io::split(client);

    scope.spawn(pipe("upstream->client", upstream_rx, client_tx, pair.clone()));
    scope.spawn(pipe("client->upstream", client_rx, upstream_tx, pair.clone()));
    scope.spawn(reject_requests(requests, pair));
}

async fn pipe<R, W>(direction: &'static str, mut reader: R, mut writer: W, pair: CancellationToken)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let _teardown = pair.clone().drop_guard();

    tokio::select! {
        result = tokio::io::copy(&mut reader, &mut writer) => match result {
            Ok(bytes) => tracing::debug!(direction, bytes, "x11 stream ended"),
            Err(e) => tracing::debug!(direction, "x11 stream error: {}", e),
        },
        _ = pair.cancelled() => {}
    }

    let _ = writer.shutdown().await;
}

/// Reply "not supported" to every out-of-band request on the client channel.
///
/// Some clients probe channels (PuTTY's `winadj@putty.projects.tartarus.org`)
/// and stall until they get an answer.
async fn reject_requests(
    mut requests: mpsc::UnboundedReceiver<ChannelRequest>,
    pair: CancellationToken,
) {
    loop {
        tokio::select! {
            request = requests.recv() => match request {
                Some(request) => {
                    tracing::debug!(kind = request.kind(), "rejecting x11 channel request");
                    request.reject();
                }
                None => break,
            },
            _ = pair.cancelled() => break,
        }
    }
}
