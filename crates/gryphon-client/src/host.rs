//! Host health tracking and reconnection.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{Mutex as AsyncMutex, mpsc};
use tracing::{info, warn};

use gryphon_core::message::{RequestMessage, ResponseMessage};
use gryphon_core::serializer::{SerializerFormat, TypeRegistry};

use crate::connection::Connection;
use crate::error::ClientError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostState {
    Available,
    /// No live connection; a background probe retries until one succeeds.
    Dead,
}

/// One cluster member. A dead host is skipped by request routing until its
/// probe task re-establishes a connection.
pub struct Host {
    addr: String,
    format: SerializerFormat,
    registry: Arc<TypeRegistry>,
    reconnect_interval: Duration,
    state: Mutex<HostState>,
    conn: AsyncMutex<Option<Connection>>,
}

impl Host {
    pub(crate) fn new(
        addr: String,
        format: SerializerFormat,
        registry: Arc<TypeRegistry>,
        reconnect_interval: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            addr,
            format,
            registry,
            reconnect_interval,
            state: Mutex::new(HostState::Dead),
            conn: AsyncMutex::new(None),
        })
    }

    pub fn address(&self) -> &str {
        &self.addr
    }

    pub fn state(&self) -> HostState {
        self.state.lock().map_or(HostState::Dead, |s| *s)
    }

    pub fn is_available(&self) -> bool {
        self.state() == HostState::Available
    }

    /// Opens a connection and marks the host available. On failure the host
    /// stays dead and a probe keeps retrying in the background.
    pub(crate) async fn connect(self: &Arc<Self>) -> std::io::Result<()> {
        let closer = Arc::clone(self);
        let conn = Connection::open(
            &self.addr,
            self.format,
            Arc::clone(&self.registry),
            Box::new(move || closer.on_connection_closed()),
        )
        .await?;
        *self.conn.lock().await = Some(conn);
        self.set_state(HostState::Available);
        Ok(())
    }

    /// Like [`Host::connect`] but never fails: an unreachable host goes
    /// straight to probing.
    pub(crate) async fn connect_or_probe(self: &Arc<Self>) {
        if let Err(err) = self.connect().await {
            warn!(host = %self.addr, error = %err, "initial connect failed");
            self.spawn_probe();
        }
    }

    pub(crate) async fn submit(
        &self,
        request: RequestMessage,
    ) -> Result<mpsc::UnboundedReceiver<ResponseMessage>, ClientError> {
        let conn = self.conn.lock().await;
        match conn.as_ref() {
            Some(conn) => conn.submit(request).await,
            None => Err(ClientError::ConnectionClosed),
        }
    }

    fn on_connection_closed(self: Arc<Self>) {
        warn!(host = %self.addr, "host marked dead");
        self.set_state(HostState::Dead);
        self.spawn_probe();
    }

    fn spawn_probe(self: &Arc<Self>) {
        let host = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(host.reconnect_interval).await;
                match host.connect().await {
                    Ok(()) => {
                        info!(host = %host.addr, "host recovered");
                        return;
                    }
                    Err(err) => {
                        warn!(host = %host.addr, error = %err, "reconnect attempt failed");
                    }
                }
            }
        });
    }

    fn set_state(&self, next: HostState) {
        if let Ok(mut state) = self.state.lock() {
            *state = next;
        }
    }
}
