//! Portcullis standalone listener
//!
//! Binds one listener described by a JSON file, selects a filter chain for
//! every accepted connection and reloads the filter chains when the file
//! changes.

use anyhow::Result;
use tokio::task::LocalSet;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use portcullis_listener::config::{Config, ListenerFile};
use portcullis_listener::server::Server;

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    // Initialize tracing (prefer RUST_LOG, fallback to PORTCULLIS_LOG_LEVEL)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting portcullis listener");
    info!(
        config_file = %config.config_file.display(),
        reload_interval_ms = config.reload_interval.as_millis() as u64,
        "Configuration loaded"
    );

    let file = ListenerFile::load(&config.config_file)?;

    let local = LocalSet::new();
    local
        .run_until(async move {
            let server = Server::bind(file)
                .await?
                .with_reload(config.config_file.clone(), config.reload_interval);
            server
                .run(async {
                    if let Err(e) = tokio::signal::ctrl_c().await {
                        tracing::error!(error = %e, "Failed to listen for shutdown signal");
                        std::future::pending::<()>().await;
                    }
                })
                .await
        })
        .await
}
