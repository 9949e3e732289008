//! Launcher: loads settings, starts the server, waits for ctrl-c.

use gryphon_core::Settings;
use gryphon_server::error::{Result, ServerError};
use gryphon_server::server::GryphonServer;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let settings = match std::env::args().nth(1) {
        Some(path) => {
            let raw = std::fs::read_to_string(&path)?;
            serde_json::from_str(&raw).map_err(|err| {
                ServerError::Configuration(format!("failed to parse {path}: {err}"))
            })?
        }
        None => Settings::default(),
    };

    let listen_addr = settings.listen_addr.clone();
    let handle = GryphonServer::builder()
        .settings(settings)
        .bind(&listen_addr)
        .await?;
    info!(addr = %handle.local_addr(), "gryphon listening");

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    handle.shutdown();
    Ok(())
}
