// ABOUTME: Client-facing side of a gateway built on the russh server.
// ABOUTME: Exposes the user's x11-req payload and opens x11 channels back to the user.

use super::error::{Error, Result};
use crate::srvconn::{
    InboundChannel, InboundConnection, InboundSession, X11Originator, X11Request,
};
use async_trait::async_trait;
use russh::server::Handle;
use std::sync::Arc;
use tokio::sync::mpsc;

/// A user's session on the gateway's SSH server.
pub struct RusshInbound {
    x11: Option<X11Request>,
    connection: Arc<RusshInboundConnection>,
}

impl RusshInbound {
    pub fn new(handle: Handle) -> Self {
        Self {
            x11: None,
            connection: Arc::new(RusshInboundConnection { handle }),
        }
    }

    /// Record the `x11-req` the user sent on their session channel.
    pub fn with_x11_request(mut self, request: X11Request) -> Self {
        self.x11 = Some(request);
        self
    }
}

impl InboundSession for RusshInbound {
    fn x11_request(&self) -> Option<&X11Request> {
        self.x11.as_ref()
    }

    fn connection(&self) -> Arc<dyn InboundConnection> {
        self.connection.clone()
    }
}

struct RusshInboundConnection {
    handle: Handle,
}

#[async_trait]
impl InboundConnection for RusshInboundConnection {
    async fn open_x11_channel(&self, originator: &X11Originator) -> Result<InboundChannel> {
        let channel = self
            .handle
            .channel_open_x11(originator.address.clone(), originator.port)
            .await
            .map_err(|e| Error::ChannelOpenFailed(format!("x11: {}", e)))?;

        // The russh server answers channel requests it has no handler for,
        // so nothing is ever queued here.
        let (_, requests) = mpsc::unbounded_channel();
        Ok(InboundChannel {
            stream: Box::new(channel.into_stream()),
            requests,
        })
    }
}
