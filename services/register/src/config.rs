// Register service configuration: environment variables first, with an
// optional YAML override file named by LATTICE_REGISTER_CONFIG.
use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::net::SocketAddr;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct RegisterServiceConfig {
    pub bind: SocketAddr,
    pub metrics_bind: SocketAddr,
    pub secret_key: String,
    pub auth_timeout: Duration,
    pub max_frame_bytes: usize,
}

#[derive(Debug, Deserialize, Default)]
struct RegisterConfigOverride {
    bind: Option<String>,
    metrics_bind: Option<String>,
    secret_key: Option<String>,
    auth_timeout_secs: Option<u64>,
    max_frame_bytes: Option<usize>,
}

impl RegisterServiceConfig {
    pub fn from_env() -> Result<Self> {
        let bind = std::env::var("LATTICE_REGISTER_BIND")
            .unwrap_or_else(|_| "0.0.0.0:1236".to_string())
            .parse()
            .context("parse LATTICE_REGISTER_BIND")?;
        let metrics_bind = std::env::var("LATTICE_REGISTER_METRICS_BIND")
            .unwrap_or_else(|_| "127.0.0.1:9301".to_string())
            .parse()
            .context("parse LATTICE_REGISTER_METRICS_BIND")?;
        let secret_key = std::env::var("LATTICE_SECRET_KEY").unwrap_or_default();
        let auth_timeout = std::env::var("LATTICE_REGISTER_AUTH_TIMEOUT_SECS")
            .ok()
            .and_then(|value| value.parse::<u64>().ok())
            .filter(|value| *value > 0)
            .map(Duration::from_secs)
            .unwrap_or(Duration::from_secs(10));
        let max_frame_bytes = std::env::var("LATTICE_MAX_FRAME_BYTES")
            .ok()
            .and_then(|value| value.parse::<usize>().ok())
            .filter(|value| *value > 0)
            .unwrap_or(lattice_wire::DEFAULT_MAX_FRAME_BYTES);
        Ok(Self {
            bind,
            metrics_bind,
            secret_key,
            auth_timeout,
            max_frame_bytes,
        })
    }

    pub fn from_env_or_yaml() -> Result<Self> {
        let mut config = Self::from_env()?;
        if let Ok(path) = std::env::var("LATTICE_REGISTER_CONFIG") {
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("read LATTICE_REGISTER_CONFIG: {path}"))?;
            let override_cfg: RegisterConfigOverride =
                serde_yaml::from_str(&contents).context("parse register config yaml")?;
            if let Some(value) = override_cfg.bind {
                config.bind = value.parse().context("parse bind")?;
            }
            if let Some(value) = override_cfg.metrics_bind {
                config.metrics_bind = value.parse().context("parse metrics_bind")?;
            }
            if let Some(value) = override_cfg.secret_key {
                config.secret_key = value;
            }
            if let Some(value) = override_cfg.auth_timeout_secs {
                if value > 0 {
                    config.auth_timeout = Duration::from_secs(value);
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
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    struct EnvGuard {
        key: &'static str,
        prev: Option<String>,
    }

    impl EnvGuard {
        fn set(key: &'static str, value: &str) -> Self {
            let prev = std::env::var(key).ok();
            std::env::set_var(key, value);
            Self { key, prev }
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            match &self.prev {
                Some(value) => std::env::set_var(self.key, value),
                None => std::env::remove_var(self.key),
            }
        }
    }

    #[test]
    #[serial]
    fn defaults_apply_without_env() {
        let config = RegisterServiceConfig::from_env().expect("config");
        assert_eq!(config.bind.port(), 1236);
        assert_eq!(config.auth_timeout, Duration::from_secs(10));
    }

    #[test]
    #[serial]
    fn env_overrides_bind_and_secret() {
        let _bind = EnvGuard::set("LATTICE_REGISTER_BIND", "127.0.0.1:4000");
        let _secret = EnvGuard::set("LATTICE_SECRET_KEY", "s1");
        let config = RegisterServiceConfig::from_env().expect("config");
        assert_eq!(config.bind.port(), 4000);
        assert_eq!(config.secret_key, "s1");
    }

    #[test]
    #[serial]
    fn yaml_file_overrides_env() {
        let dir = std::env::temp_dir().join("lattice-register-config-test");
        std::fs::create_dir_all(&dir).expect("tmp dir");
        let path = dir.join("register.yaml");
        std::fs::write(&path, "bind: 127.0.0.1:5000\nsecret_key: from-yaml\n").expect("write");
        let _cfg = EnvGuard::set("LATTICE_REGISTER_CONFIG", path.to_str().expect("path"));
        let config = RegisterServiceConfig::from_env_or_yaml().expect("config");
        assert_eq!(config.bind.port(), 5000);
        assert_eq!(config.secret_key, "from-yaml");
    }
}
