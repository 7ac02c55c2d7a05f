//! relayd configuration (env-driven).

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use relay_core::{ClientCert, TlsOrigination, TlsTermination};

/// relayd configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Address to accept connections on.
    pub bind_addr: SocketAddr,

    /// Target host to relay to.
    pub target_host: String,

    /// Target port to relay to.
    pub target_port: u16,

    /// Terminate TLS on accepted connections.
    pub inbound_tls: Option<TlsTermination>,

    /// Originate TLS on connections to the target.
    pub outbound_tls: Option<TlsOrigination>,

    /// Serve repeat connections from a recording of the target's
    /// response.
    pub cache_enabled: bool,

    /// How long to let sessions drain on shutdown before they are
    /// force-closed.
    pub drain_timeout: Duration,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let bind_addr: SocketAddr = std::env::var("RELAYD_BIND")
            .unwrap_or_else(|_| "0.0.0.0:8080".to_string())
            .parse()
            .context("RELAYD_BIND must be a socket address (host:port).")?;

        let target =
            std::env::var("RELAYD_TARGET").context("Missing target. Set RELAYD_TARGET=host:port.")?;
        let (target_host, target_port) = target
            .rsplit_once(':')
            .context("RELAYD_TARGET must be host:port.")?;
        let target_port: u16 = target_port
            .parse()
            .context("RELAYD_TARGET port must be an integer.")?;

        let inbound_tls = match (
            std::env::var("RELAYD_TLS_CERT").ok(),
            std::env::var("RELAYD_TLS_KEY").ok(),
        ) {
            (Some(cert_path), Some(key_path)) => Some(TlsTermination {
                cert_path,
                key_path,
            }),
            (None, None) => None,
            _ => anyhow::bail!("RELAYD_TLS_CERT and RELAYD_TLS_KEY must be set together."),
        };

        let outbound_tls = if env_flag("RELAYD_TARGET_TLS") {
            let server_name = std::env::var("RELAYD_TARGET_TLS_NAME")
                .unwrap_or_else(|_| target_host.to_string());
            let client_cert = match (
                std::env::var("RELAYD_TARGET_TLS_CLIENT_CERT").ok(),
                std::env::var("RELAYD_TARGET_TLS_CLIENT_KEY").ok(),
            ) {
                (Some(cert_path), Some(key_path)) => Some(ClientCert {
                    cert_path,
                    key_path,
                }),
                (None, None) => None,
                _ => anyhow::bail!(
                    "RELAYD_TARGET_TLS_CLIENT_CERT and RELAYD_TARGET_TLS_CLIENT_KEY must be set together."
                ),
            };
            Some(TlsOrigination {
                server_name,
                client_cert,
                danger_skip_verify: env_flag("RELAYD_TARGET_TLS_SKIP_VERIFY"),
            })
        } else {
            None
        };

        let drain_timeout_secs: u64 = std::env::var("RELAYD_DRAIN_TIMEOUT_SECS")
            .ok()
            .map(|v| v.parse())
            .transpose()
            .context("RELAYD_DRAIN_TIMEOUT_SECS must be an integer (seconds).")?
            .unwrap_or(30);

        let log_level = std::env::var("RELAYD_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        Ok(Self {
            bind_addr,
            target_host: target_host.to_string(),
            target_port,
            inbound_tls,
            outbound_tls,
            cache_enabled: env_flag("RELAYD_CACHE"),
            drain_timeout: Duration::from_secs(drain_timeout_secs),
            log_level,
        })
    }
}

fn env_flag(name: &str) -> bool {
    std::env::var(name)
        .map(|v| v == "1" || v.to_lowercase() == "true")
        .unwrap_or(false)
}
