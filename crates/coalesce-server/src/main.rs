//! # Coalesce Server
//!
//! Broadcast server that coalesces every publication a room receives during
//! one reactor pass into a single outgoing batch per subscriber.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings
//! coalesce
//!
//! # Run with environment variables
//! COALESCE_PORT=8080 COALESCE_HOST=0.0.0.0 coalesce
//!
//! # Adjust log verbosity
//! RUST_LOG=coalesce=trace coalesce
//! ```

mod config;
mod handlers;
mod metrics;
mod reactor;

use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "coalesce=debug,coalesce_core=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = config::Config::load()?;

    tracing::info!("Starting Coalesce server on {}:{}", config.host, config.port);

    metrics::init_metrics();

    handlers::run_server(config).await?;

    Ok(())
}
