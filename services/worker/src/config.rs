// Worker service configuration: environment variables first, with an
// optional YAML override file named by LATTICE_WORKER_CONFIG.
use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::net::SocketAddr;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct WorkerServiceConfig {
    pub register_address: String,
    pub metrics_bind: SocketAddr,
    pub register_secret_key: String,
    pub gateway_secret_key: String,
    pub ping_interval: Duration,
    pub reconnect_delay: Duration,
    pub event_queue_depth: usize,
    pub max_frame_bytes: usize,
}

#[derive(Debug, Deserialize, Default)]
struct WorkerConfigOverride {
    register_address: Option<String>,
    metrics_bind: Option<String>,
    register_secret_key: Option<String>,
    gateway_secret_key: Option<String>,
    ping_interval_secs: Option<u64>,
    reconnect_delay_secs: Option<u64>,
    event_queue_depth: Option<usize>,
    max_frame_bytes: Option<usize>,
}

impl WorkerServiceConfig {
    pub fn from_env() -> Result<Self> {
        let register_address = std::env::var("LATTICE_REGISTER_ADDRESS")
            .unwrap_or_else(|_| "127.0.0.1:1236".to_string());
        let metrics_bind = std::env::var("LATTICE_WORKER_METRICS_BIND")
            .unwrap_or_else(|_| "127.0.0.1:9303".to_string())
            .parse()
            .context("parse LATTICE_WORKER_METRICS_BIND")?;
        let register_secret_key = std::env::var("LATTICE_SECRET_KEY").unwrap_or_default();
        let gateway_secret_key = std::env::var("LATTICE_GATEWAY_SECRET_KEY")
            .unwrap_or_else(|_| register_secret_key.clone());
        let ping_interval = std::env::var("LATTICE_WORKER_PING_SECS")
            .ok()
            .and_then(|value| value.parse::<u64>().ok())
            .filter(|value| *value > 0)
            .map(Duration::from_secs)
            .unwrap_or(Duration::from_secs(3));
        let reconnect_delay = std::env::var("LATTICE_WORKER_RECONNECT_SECS")
            .ok()
            .and_then(|value| value.parse::<u64>().ok())
            .filter(|value| *value > 0)
            .map(Duration::from_secs)
            .unwrap_or(Duration::from_secs(3));
        let event_queue_depth = std::env::var("LATTICE_WORKER_EVENT_QUEUE")
            .ok()
            .and_then(|value| value.parse::<usize>().ok())
            .filter(|value| *value > 0)
            .unwrap_or(1024);
        let max_frame_bytes = std::env::var("LATTICE_MAX_FRAME_BYTES")
            .ok()
            .and_then(|value| value.parse::<usize>().ok())
            .filter(|value| *value > 0)
            .unwrap_or(lattice_wire::DEFAULT_MAX_FRAME_BYTES);
        Ok(Self {
            register_address,
            metrics_bind,
            register_secret_key,
            gateway_secret_key,
            ping_interval,
            reconnect_delay,
            event_queue_depth,
            max_frame_bytes,
        })
    }

    pub fn from_env_or_yaml() -> Result<Self> {
        let mut config = Self::from_env()?;
        if let Ok(path) = std::env::var("LATTICE_WORKER_CONFIG") {
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("read LATTICE_WORKER_CONFIG: {path}"))?;
            let override_cfg: WorkerConfigOverride =
                serde_yaml::from_str(&contents).context("parse worker config yaml")?;
            if let Some(value) = override_cfg.register_address {
                config.register_address = value;
            }
            if let Some(value) = override_cfg.metrics_bind {
                config.metrics_bind = value.parse().context("parse metrics_bind")?;
            }
            if let Some(value) = override_cfg.register_secret_key {
                config.register_secret_key = value;
            }
            if let Some(value) = override_cfg.gateway_secret_key {
                config.gateway_secret_key = value;
            }
            if let Some(value) = override_cfg.ping_interval_secs {
                if value > 0 {
                    config.ping_interval = Duration::from_secs(value);
                }
            }
            if let Some(value) = override_cfg.reconnect_delay_secs {
                if value > 0 {
                    config.reconnect_delay = Duration::from_secs(value);
                }
            }
            if let Some(value) = override_cfg.event_queue_depth {
                if value > 0 {
                    config.event_queue_depth = value;
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

    pub fn worker_config(&self) -> lattice_worker::WorkerConfig {
        lattice_worker::WorkerConfig {
            register_secret_key: self.register_secret_key.clone(),
            gateway_secret_key: self.gateway_secret_key.clone(),
            register_address: self.register_address.clone(),
            ping_interval: self.ping_interval,
            reconnect_delay: self.reconnect_delay,
            max_frame_bytes: self.max_frame_bytes,
        }
    }
}
