//! Server assembly: listener, accept loop, and shared state.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use gryphon_core::Settings;
use gryphon_core::graph::{GraphBackend, MemoryGraph};
use gryphon_core::script::{Bindings, ScriptEngine};
use gryphon_core::serializer::TypeRegistry;
use gryphon_core::session::{SessionRegistry, evaluate_with_timeout};

use crate::connection::handle_connection;
use crate::dispatcher::Dispatcher;
use crate::error::{Result, ServerError};

/// State shared by every connection of one server.
pub struct ServerState {
    pub settings: Settings,
    pub registry: Arc<TypeRegistry>,
    pub dispatcher: Arc<Dispatcher>,
}

pub struct GryphonServer;

impl GryphonServer {
    pub fn builder() -> ServerBuilder {
        ServerBuilder {
            settings: Settings::default(),
            graph: None,
            registry: TypeRegistry::with_graph_types(),
            init_script: None,
        }
    }
}

pub struct ServerBuilder {
    settings: Settings,
    graph: Option<Arc<dyn GraphBackend>>,
    registry: TypeRegistry,
    init_script: Option<String>,
}

impl ServerBuilder {
    pub fn settings(mut self, settings: Settings) -> Self {
        self.settings = settings;
        self
    }

    pub fn graph(mut self, graph: Arc<dyn GraphBackend>) -> Self {
        self.graph = Some(graph);
        self
    }

    /// Registers an additional type name with the compact serializer.
    pub fn register_type(mut self, type_name: impl Into<String>) -> Self {
        self.registry.register(type_name);
        self
    }

    /// Script evaluated once against the graph before the server starts
    /// serving, typically to seed reference data. A failure aborts startup.
    pub fn init_script(mut self, script: impl Into<String>) -> Self {
        self.init_script = Some(script.into());
        self
    }

    /// Binds the listener and spawns the accept loop. Use `"127.0.0.1:0"` to
    /// let the OS pick a free port.
    pub async fn bind(self, addr: &str) -> Result<ServerHandle> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;

        let graph = self
            .graph
            .unwrap_or_else(|| Arc::new(MemoryGraph::new()) as Arc<dyn GraphBackend>);
        let engine = Arc::new(ScriptEngine::from_settings(&self.settings));

        if let Some(script) = self.init_script {
            let (_, result) = evaluate_with_timeout(
                Arc::clone(&engine),
                Some(Arc::clone(&graph)),
                Bindings::new(),
                script,
                self.settings.script_evaluation_timeout(),
                CancellationToken::new(),
            )
            .await;
            match result {
                Ok(results) => {
                    info!(results = results.count(), "initialization script evaluated");
                }
                Err(err) => {
                    return Err(ServerError::Configuration(format!(
                        "initialization script failed: {err}"
                    )));
                }
            }
        }

        let sessions = Arc::new(SessionRegistry::new(
            self.settings.clone(),
            Arc::clone(&engine),
            Arc::clone(&graph),
        ));
        let dispatcher = Arc::new(Dispatcher::new(
            self.settings.clone(),
            engine,
            graph,
            sessions,
        ));
        let state = Arc::new(ServerState {
            settings: self.settings,
            registry: Arc::new(self.registry),
            dispatcher,
        });

        let shutdown = CancellationToken::new();
        let accept_shutdown = shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = accept_shutdown.cancelled() => break,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, peer)) => {
                            debug!(%peer, "accepted connection");
                            tokio::spawn(handle_connection(stream, Arc::clone(&state)));
                        }
                        Err(err) => {
                            warn!(error = %err, "accept failed");
                        }
                    },
                }
            }
        });
        info!(%local_addr, "server listening");

        Ok(ServerHandle {
            local_addr,
            shutdown,
        })
    }
}

/// Keeps the server alive; dropping it stops accepting new connections.
pub struct ServerHandle {
    local_addr: SocketAddr,
    shutdown: CancellationToken,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
