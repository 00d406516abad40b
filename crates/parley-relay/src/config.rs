use anyhow::Context;
use serde::Deserialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::store::RetryPolicy;

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct RelayConfig {
    pub listen: SocketAddr,
    /// Allowed CORS origins for the HTTP endpoints; `*` allows any.
    pub allow_origins: Vec<String>,
    /// SQLite database file. In-memory when unset.
    pub store_path: Option<PathBuf>,
    pub max_connections: usize,
    pub auth: AuthConfig,
    pub ws: WsTuning,
    pub typing: TypingConfig,
    pub calls: CallConfig,
    pub store_retry: RetryPolicy,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([127, 0, 0, 1], 8790)),
            allow_origins: vec!["http://localhost:3000".to_string()],
            store_path: None,
            max_connections: 10_000,
            auth: AuthConfig::default(),
            ws: WsTuning::default(),
            typing: TypingConfig::default(),
            calls: CallConfig::default(),
            store_retry: RetryPolicy::default(),
        }
    }
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(default)]
pub struct AuthConfig {
    pub jwt_secret: Option<String>,
    /// token -> identity
    pub static_tokens: HashMap<String, String>,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct WsTuning {
    pub outbound_queue: usize,
    pub max_frame_bytes: usize,
    pub admit_timeout_ms: u64,
    pub rate_burst: u32,
    pub rate_per_sec: f64,
}

impl Default for WsTuning {
    fn default() -> Self {
        Self {
            outbound_queue: 256,
            max_frame_bytes: 64 * 1024,
            admit_timeout_ms: 10_000,
            rate_burst: 50,
            rate_per_sec: 20.0,
        }
    }
}

impl WsTuning {
    pub fn admit_timeout(&self) -> Duration {
        Duration::from_millis(self.admit_timeout_ms)
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct TypingConfig {
    pub ttl_ms: u64,
    pub sweep_interval_ms: u64,
}

impl Default for TypingConfig {
    fn default() -> Self {
        Self {
            ttl_ms: 3_000,
            sweep_interval_ms: 500,
        }
    }
}

impl TypingConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct CallConfig {
    pub ring_timeout_secs: u64,
    pub max_pending_ice: usize,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            ring_timeout_secs: 45,
            max_pending_ice: 256,
        }
    }
}

impl CallConfig {
    pub fn ring_timeout(&self) -> Duration {
        Duration::from_secs(self.ring_timeout_secs)
    }
}

impl RelayConfig {
    /// Load from an explicit path, or from the default location if it exists,
    /// falling back to defaults.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => {
                let default_path = Self::config_path();
                if default_path.exists() {
                    Self::from_file(&default_path)?
                } else {
                    Self::default()
                }
            }
        };
        if let Ok(secret) = std::env::var("PARLEY_JWT_SECRET") {
            config.auth.jwt_secret = Some(secret);
        }
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        toml::from_str(&contents).with_context(|| format!("invalid config {}", path.display()))
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.ws.outbound_queue == 0 || self.ws.max_frame_bytes == 0 {
            anyhow::bail!("ws.outbound_queue and ws.max_frame_bytes must be > 0");
        }
        if self.typing.sweep_interval_ms == 0 || self.typing.sweep_interval_ms >= self.typing.ttl_ms
        {
            anyhow::bail!("typing.sweep_interval_ms must be > 0 and shorter than typing.ttl_ms");
        }
        if self.calls.ring_timeout_secs == 0 {
            anyhow::bail!("calls.ring_timeout_secs must be > 0");
        }
        if self.store_retry.attempts == 0 {
            anyhow::bail!("store_retry.attempts must be > 0");
        }
        Ok(())
    }

    pub fn config_path() -> PathBuf {
        dirs_path().join("relay.toml")
    }
}

fn dirs_path() -> PathBuf {
    if let Ok(config_dir) = std::env::var("XDG_CONFIG_HOME") {
        PathBuf::from(config_dir).join("parley")
    } else if let Ok(home) = std::env::var("HOME") {
        PathBuf::from(home).join(".config").join("parley")
    } else {
        PathBuf::from("/tmp/parley")
    }
}
