//! relayd
//!
//! Protocol-agnostic TCP relay proxy.
//!
//! This service:
//! - Accepts TCP connections on the configured bind address
//! - Relays every connection to the configured target
//! - Optionally terminates TLS toward clients and originates TLS
//!   toward the target
//! - Drains live sessions on shutdown, force-closing at the deadline

use std::sync::Arc;

use anyhow::Result;
use relay_core::{
    CacheStore, CachedSessionFactory, DefaultSessionFactory, ListenerConfig, RelayManager,
    SessionFactory, StopMode,
};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod config;

#[tokio::main]
async fn main() -> Result<()> {
    let config = config::Config::from_env()?;

    // Initialize tracing (prefer RUST_LOG, fallback to RELAYD_LOG_LEVEL)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting relayd");
    info!(
        bind_addr = %config.bind_addr,
        target_addr = format!("{}:{}", config.target_host, config.target_port),
        inbound_tls = config.inbound_tls.is_some(),
        outbound_tls = config.outbound_tls.is_some(),
        cache_enabled = config.cache_enabled,
        "Configuration loaded"
    );

    let factory: Arc<dyn SessionFactory> = if config.cache_enabled {
        Arc::new(CachedSessionFactory::new(Arc::new(CacheStore::default())))
    } else {
        Arc::new(DefaultSessionFactory)
    };

    let mut listener_config = ListenerConfig::new(
        config.bind_addr,
        config.target_host.clone(),
        config.target_port,
    );
    listener_config.inbound_tls = config.inbound_tls.clone();
    listener_config.outbound_tls = config.outbound_tls.clone();

    let manager = RelayManager::new();
    manager.add_listener(listener_config, factory).await?;
    manager.start()?;

    tokio::signal::ctrl_c().await?;
    info!(
        drain_timeout_secs = config.drain_timeout.as_secs(),
        "Shutdown signal received, draining sessions"
    );
    manager.stop(StopMode::Drain(Some(config.drain_timeout)));
    manager.wait_stopped().await;

    Ok(())
}
