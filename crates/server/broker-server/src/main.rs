//! Identity broker server.
//!
//! Serves the OAuth2 authorize and token endpoints, the grant approval page,
//! the password login forms and the external provider callbacks assembled
//! from the configuration file.

use anyhow::{Context, Result};
use broker_oauth_server::BrokerBuilder;
use clap::Parser;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::EnvFilter;

mod cli;
mod routes;
mod settings;

use crate::cli::Args;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = settings::load(args.config.as_deref())?;

    // RUST_LOG wins over the configured level
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_filter()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let listen = args.listen.unwrap_or_else(|| config.listen_address.clone());
    let (providers, clients) = (config.identity_providers.len(), config.clients.len());
    let broker = BrokerBuilder::new(config)
        .build()
        .context("Failed to assemble the broker")?;
    if args.check {
        info!(providers, clients, "configuration is valid");
        return Ok(());
    }

    let app = routes::router(Arc::new(broker)).layer(TraceLayer::new_for_http());
    let listener = tokio::net::TcpListener::bind(&listen)
        .await
        .with_context(|| format!("Failed to bind {listen}"))?;
    info!("identity broker listening on {}", listen);

    axum::serve(listener, app).await?;
    Ok(())
}
