use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, OnceCell};
use tonic::transport::{Channel, Endpoint};

use crate::config::KeepAliveConfig;
use crate::error::DispatchError;
use crate::proto::agent_client::AgentClient;
use crate::tls::TlsIdentity;

type Slot = Arc<OnceCell<AgentClient<Channel>>>;

/// A client handed out by [`ConnectionPool::checkout`].
pub struct PooledClient {
    pub client: AgentClient<Channel>,
    slot: Slot,
}

/// One long-lived gRPC channel per agent address.
///
/// The first `get` for an address dials it; concurrent first calls share the
/// same dial. Handles are cheap clones of the pooled channel, so any number of
/// invocations may use an address at once. The pool never retries.
pub struct ConnectionPool {
    slots: Mutex<HashMap<String, Slot>>,
    tls_identity: Option<TlsIdentity>,
    keep_alive: KeepAliveConfig,
}

impl ConnectionPool {
    pub fn new(tls_identity: Option<TlsIdentity>, keep_alive: KeepAliveConfig) -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            tls_identity,
            keep_alive,
        }
    }

    /// Shared client for `addr` (`host:port`), dialling it on first use.
    pub async fn get(&self, addr: &str) -> Result<AgentClient<Channel>, DispatchError> {
        self.checkout(addr).await.map(|pooled| pooled.client)
    }

    /// Like [`get`](Self::get), but remembers which pooled channel was handed
    /// out so a failed call can [`evict`](Self::evict) exactly that channel.
    pub async fn checkout(&self, addr: &str) -> Result<PooledClient, DispatchError> {
        let slot = self.slot(addr).await;

        let client = slot
            .get_or_try_init(|| async {
                let channel = self.create_channel(addr).await?;
                tracing::info!(addr, tls = self.tls_identity.is_some(), "Connected to agent");
                Ok::<_, DispatchError>(AgentClient::new(channel))
            })
            .await?
            .clone();

        Ok(PooledClient { client, slot })
    }

    /// Drop the channel `used` came from so the next `get` re-dials.
    ///
    /// A channel that replaced it in the meantime is left alone.
    pub async fn evict(&self, addr: &str, used: &PooledClient) {
        self.evict_slot(addr, &used.slot).await;
    }

    async fn evict_slot(&self, addr: &str, used: &Slot) {
        let mut slots = self.slots.lock().await;
        match slots.get(addr) {
            Some(current) if Arc::ptr_eq(current, used) => {
                slots.remove(addr);
                tracing::info!(addr, "Evicted pooled agent connection");
            }
            Some(_) => tracing::debug!(addr, "Pooled connection already replaced, keeping it"),
            None => {}
        }
    }

    async fn slot(&self, addr: &str) -> Slot {
        let mut slots = self.slots.lock().await;
        slots
            .entry(addr.to_string())
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .clone()
    }

    pub async fn len(&self) -> usize {
        self.slots
            .lock()
            .await
            .values()
            .filter(|slot| slot.initialized())
            .count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    async fn create_channel(&self, addr: &str) -> Result<Channel, DispatchError> {
        let uri = if self.tls_identity.is_some() {
            format!("https://{}", addr)
        } else {
            format!("http://{}", addr)
        };

        let mut endpoint = Endpoint::from_shared(uri)
            .map_err(|e| DispatchError::ConnectionUnavailable(format!("invalid address {}: {}", addr, e)))?
            .connect_timeout(self.keep_alive.connect_timeout)
            .http2_keep_alive_interval(self.keep_alive.ping_interval)
            .keep_alive_timeout(self.keep_alive.ping_timeout)
            .keep_alive_while_idle(true)
            .tcp_keepalive(Some(self.keep_alive.tcp_keepalive));

        if let Some(ref tls_identity) = self.tls_identity {
            endpoint = endpoint
                .tls_config(tls_identity.client_tls_config())
                .map_err(|e| DispatchError::ConnectionUnavailable(format!("TLS config error: {}", e)))?;
        }

        endpoint.connect().await.map_err(|e| {
            tracing::warn!(addr, error = %e, "Failed to connect to agent");
            DispatchError::ConnectionUnavailable(format!("failed to connect to {}: {}", addr, e))
        })
    }
}
