// Gateway service configuration: environment variables first, with an
// optional YAML override file named by LATTICE_GATEWAY_CONFIG.
//
// LATTICE_SECRET_KEY is the shared deployment secret; the worker-facing
// secret can be split off with LATTICE_GATEWAY_SECRET_KEY when the two
// trust domains differ.
use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::net::SocketAddr;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct GatewayServiceConfig {
    /// Client-facing listener.
    pub client_bind: SocketAddr,
    /// Worker-facing internal listener.
    pub internal_bind: SocketAddr,
    /// Internal address advertised to the register. Must be the address
    /// workers can actually reach; defaults to `internal_bind`.
    pub lan_address: String,
    pub register_address: String,
    pub metrics_bind: SocketAddr,
    pub secret_key: String,
    pub register_secret_key: String,
    pub heartbeat_interval: Duration,
    pub response_limit: u32,
    pub max_frame_bytes: usize,
}

#[derive(Debug, Deserialize, Default)]
struct GatewayConfigOverride {
    client_bind: Option<String>,
    internal_bind: Option<String>,
    lan_address: Option<String>,
    register_address: Option<String>,
    metrics_bind: Option<String>,
    secret_key: Option<String>,
    register_secret_key: Option<String>,
    heartbeat_interval_secs: Option<u64>,
    response_limit: Option<u32>,
    max_frame_bytes: Option<usize>,
}

impl GatewayServiceConfig {
    pub fn from_env() -> Result<Self> {
        let client_bind = std::env::var("LATTICE_GATEWAY_CLIENT_BIND")
            .unwrap_or_else(|_| "0.0.0.0:8282".to_string())
            .parse()
            .context("parse LATTICE_GATEWAY_CLIENT_BIND")?;
        let internal_bind: SocketAddr = std::env::var("LATTICE_GATEWAY_INTERNAL_BIND")
            .unwrap_or_else(|_| "0.0.0.0:2300".to_string())
            .parse()
            .context("parse LATTICE_GATEWAY_INTERNAL_BIND")?;
        let lan_address = std::env::var("LATTICE_GATEWAY_LAN_ADDRESS")
            .unwrap_or_else(|_| internal_bind.to_string());
        let register_address = std::env::var("LATTICE_REGISTER_ADDRESS")
            .unwrap_or_else(|_| "127.0.0.1:1236".to_string());
        let metrics_bind = std::env::var("LATTICE_GATEWAY_METRICS_BIND")
            .unwrap_or_else(|_| "127.0.0.1:9302".to_string())
            .parse()
            .context("parse LATTICE_GATEWAY_METRICS_BIND")?;
        let register_secret_key = std::env::var("LATTICE_SECRET_KEY").unwrap_or_default();
        let secret_key = std::env::var("LATTICE_GATEWAY_SECRET_KEY")
            .unwrap_or_else(|_| register_secret_key.clone());
        let heartbeat_interval = std::env::var("LATTICE_GATEWAY_HEARTBEAT_SECS")
            .ok()
            .and_then(|value| value.parse::<u64>().ok())
            .filter(|value| *value > 0)
            .map(Duration::from_secs)
            .unwrap_or(Duration::from_secs(25));
        let response_limit = std::env::var("LATTICE_GATEWAY_RESPONSE_LIMIT")
            .ok()
            .and_then(|value| value.parse::<u32>().ok())
            .filter(|value| *value > 0)
            .unwrap_or(2);
        let max_frame_bytes = std::env::var("LATTICE_MAX_FRAME_BYTES")
            .ok()
            .and_then(|value| value.parse::<usize>().ok())
            .filter(|value| *value > 0)
            .unwrap_or(lattice_wire::DEFAULT_MAX_FRAME_BYTES);
        Ok(Self {
            client_bind,
            internal_bind,
            lan_address,
            register_address,
            metrics_bind,
            secret_key,
            register_secret_key,
            heartbeat_interval,
            response_limit,
            max_frame_bytes,
        })
    }

    pub fn from_env_or_yaml() -> Result<Self> {
        let mut config = Self::from_env()?;
        if let Ok(path) = std::env::var("LATTICE_GATEWAY_CONFIG") {
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("read LATTICE_GATEWAY_CONFIG: {path}"))?;
            let override_cfg: GatewayConfigOverride =
                serde_yaml::from_str(&contents).context("parse gateway config yaml")?;
            if let Some(value) = override_cfg.client_bind {
                config.client_bind = value.parse().context("parse client_bind")?;
            }
            if let Some(value) = override_cfg.internal_bind {
                config.internal_bind = value.parse().context("parse internal_bind")?;
            }
            if let Some(value) = override_cfg.lan_address {
                config.lan_address = value;
            }
            if let Some(value) = override_cfg.register_address {
                config.register_address = value;
            }
            if let Some(value) = override_cfg.metrics_bind {
                config.metrics_bind = value.parse().context("parse metrics_bind")?;
            }
            if let Some(value) = override_cfg.secret_key {
                config.secret_key = value;
            }
            if let Some(value) = override_cfg.register_secret_key {
                config.register_secret_key = value;
            }
            if let Some(value) = override_cfg.heartbeat_interval_secs {
                if value > 0 {
                    config.heartbeat_interval = Duration::from_secs(value);
                }
            }
            if let Some(value) = override_cfg.response_limit {
                if value > 0 {
                    config.response_limit = value;
                }
            }
            if let Some(value) = override_cfg.max_frame_bytes {
                if value > 0 {
                    config.max_frame_bytes = value;
                }
            }
        }
        Ok(config)
    }

    pub fn core_config(&self) -> lattice_gateway::GatewayConfig {
        lattice_gateway::GatewayConfig {
            secret_key: self.secret_key.clone(),
            register_secret_key: self.register_secret_key.clone(),
            register_address: self.register_address.clone(),
            lan_address: self.lan_address.clone(),
            heartbeat_interval: self.heartbeat_interval,
            response_limit: self.response_limit,
            max_frame_bytes: self.max_frame_bytes,
            ..lattice_gateway::GatewayConfig::default()
        }
    }
}
