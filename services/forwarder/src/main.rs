//! RUDICS port forwarder
//!
//! Multiplexes one dial-in TCP port across two backends.
//!
//! This service:
//! - Accepts TCP connections on the RUDICS port
//! - Routes connections opening with `~` (PPP) to backend A
//! - Routes connections opening with `goby` to backend B
//! - Closes everything else
//! - Relays bytes unchanged in both directions until either side closes

use std::sync::Arc;

use anyhow::Result;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use rudics_forwarder::{Config, Listener};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    // Initialize tracing (prefer RUST_LOG, fallback to RUDICS_LOG_LEVEL)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting RUDICS port forwarder");
    info!(
        listen_addr = %config.listen_addr,
        route_a = %config.backends.route_a,
        route_b = %config.backends.route_b,
        prefix_policy = config.prefix_policy.name(),
        read_buffer_size = config.read_buffer_size,
        "Configuration loaded"
    );
    info!(backend_addr = %config.backends.route_a, "Connecting for PPP");
    info!(backend_addr = %config.backends.route_b, "Connecting for Goby");

    let listener = match Listener::bind(config.listener_config()).await {
        Ok(listener) => Arc::new(listener),
        Err(e) => {
            error!(
                bind_addr = %config.listen_addr,
                reason = e.reason_code(),
                error = %e,
                "Failed to bind listener"
            );
            return Err(e.into());
        }
    };

    listener.run().await?;
    Ok(())
}
