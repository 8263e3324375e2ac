// ABOUTME: Reference-counted pool of upstream SSH clients keyed by connection identity.
// ABOUTME: Shares open clients between sessions when reuse is allowed, disconnects on last recycle.

use super::client::{Client, SessionConfig};
use super::error::{Error, Result};
use crate::srvconn::{ConnectionIdentity, Pool};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Host key policy applied to every client the pool opens.
#[derive(Debug, Clone, Default)]
pub struct PoolSettings {
    pub known_hosts_path: Option<PathBuf>,
    pub trust_on_first_use: bool,
}

struct Pooled {
    client: Arc<Client>,
    /// Sessions currently holding the client.
    refs: usize,
    /// Opened with reuse allowed; only shareable clients are handed out twice.
    shareable: bool,
}

/// The default [`Pool`]: one SSH connection per identity, shared when reuse is allowed.
#[derive(Default)]
pub struct ClientPool {
    settings: PoolSettings,
    clients: Mutex<HashMap<ConnectionIdentity, Vec<Pooled>>>,
}

impl std::fmt::Debug for ClientPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientPool")
            .field("settings", &self.settings)
            .field("clients", &self.len())
            .finish()
    }
}

impl ClientPool {
    pub fn new(settings: PoolSettings) -> Self {
        Self {
            settings,
            clients: Mutex::new(HashMap::new()),
        }
    }

    /// Number of open clients.
    pub fn len(&self) -> usize {
        self.clients.lock().values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn session_config(&self, identity: &ConnectionIdentity) -> SessionConfig {
        let config = SessionConfig::for_identity(identity)
            .trust_on_first_use(self.settings.trust_on_first_use);
        match &self.settings.known_hosts_path {
            Some(path) => config.known_hosts_path(path),
            None => config,
        }
    }

    /// Take another reference on an open, shareable client for `identity`.
    fn checkout(&self, identity: &ConnectionIdentity) -> Option<Arc<Client>> {
        let mut clients = self.clients.lock();
        let entries = clients.get_mut(identity)?;
        let entry = entries
            .iter_mut()
            .find(|entry| entry.shareable && !entry.client.is_closed())?;
        entry.refs += 1;
        Some(Arc::clone(&entry.client))
    }
}

#[async_trait]
impl Pool for ClientPool {
    type Transport = Client;

    async fn acquire(
        &self,
        identity: &ConnectionIdentity,
        timeout: Duration,
        reuse: bool,
    ) -> Result<Arc<Client>> {
        if reuse {
            if let Some(client) = self.checkout(identity) {
                tracing::debug!(%identity, "reusing ssh client");
                return Ok(client);
            }
        }

        let config = self.session_config(identity);
        let client = tokio::time::timeout(timeout, Client::connect(identity.clone(), config))
            .await
            .map_err(|_| Error::AcquireTimeout(timeout))??;
        let client = Arc::new(client);

        self.clients
            .lock()
            .entry(identity.clone())
            .or_default()
            .push(Pooled {
                client: Arc::clone(&client),
                refs: 1,
                shareable: reuse,
            });
        Ok(client)
    }

    async fn recycle(&self, client: Arc<Client>) {
        let last = {
            let mut clients = self.clients.lock();
            let Some(entries) = clients.get_mut(client.identity()) else {
                tracing::debug!(identity = %client.identity(), "recycled client not pooled");
                return;
            };
            let Some(pos) = entries
                .iter()
                .position(|entry| Arc::ptr_eq(&entry.client, &client))
            else {
                tracing::debug!(identity = %client.identity(), "recycled client not pooled");
                return;
            };

            entries[pos].refs = entries[pos].refs.saturating_sub(1);
            let last = entries[pos].refs == 0;
            if last {
                entries.swap_remove(pos);
                if entries.is_empty() {
                    clients.remove(client.identity());
                }
            }
            last
        };

        if last {
            tracing::debug!(identity = %client.identity(), "closing ssh client");
            if let Err(e) = client.disconnect().await {
                tracing::debug!("Disconnect error: {}", e);
            }
        }
    }
}
