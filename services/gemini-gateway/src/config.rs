//! Configuration types and loading
//!
//! Config precedence: CLI args > env vars > config file > defaults.
//! API keys are read from the API_KEYS env var or `pool.keys_file`, never
//! from the TOML itself. A `.env` file in the working directory can supply
//! env vars; variables already set in the process win.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use common::Secret;
use key_pool::{Attempt, AttemptPlan, QuotaPolicy, RetrySettings};
use provider::Credential;
use serde::Deserialize;
use tracing::warn;

/// Env var holding comma-separated API keys.
pub const API_KEYS_ENV: &str = "API_KEYS";

/// Plan served on `POST /generate`.
pub const DEFAULT_PLAN: &str = "default";

/// Model of the built-in default plan.
pub const DEFAULT_MODEL: &str = "gemini-1.5-pro-latest";

/// Attempts in the built-in default plan.
pub const DEFAULT_ATTEMPTS: usize = 2;

/// Root configuration
#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    /// Named attempt plans. `default` backs `POST /generate`.
    #[serde(default)]
    pub plans: BTreeMap<String, Vec<AttemptConfig>>,
    #[serde(skip)]
    pub api_keys: Vec<Secret<String>>,
}

/// HTTP listener settings
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    #[serde(default = "default_drain_timeout")]
    pub drain_timeout_secs: u64,
}

/// Per-key quota and key source
#[derive(Debug, Deserialize)]
pub struct PoolConfig {
    #[serde(default = "default_uses_per_window")]
    pub uses_per_window: u32,
    #[serde(default = "default_window")]
    pub window_secs: u64,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
    /// File with one API key per line (alternative to API_KEYS env var)
    #[serde(default)]
    pub keys_file: Option<PathBuf>,
}

/// Upstream call settings
#[derive(Debug, Deserialize)]
pub struct UpstreamConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_backoff")]
    pub backoff_ms: u64,
}

/// One entry of an attempt plan
#[derive(Debug, Clone, Deserialize)]
pub struct AttemptConfig {
    pub model: String,
    #[serde(default)]
    pub temperature: Option<f32>,
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 5000))
}

fn default_max_connections() -> usize {
    1000
}

fn default_drain_timeout() -> u64 {
    30
}

fn default_uses_per_window() -> u32 {
    key_pool::scheduler::DEFAULT_USES_PER_WINDOW
}

fn default_window() -> u64 {
    key_pool::scheduler::DEFAULT_WINDOW.as_secs()
}

fn default_poll_interval() -> u64 {
    key_pool::scheduler::DEFAULT_POLL_INTERVAL.as_millis() as u64
}

fn default_base_url() -> String {
    provider::gemini::DEFAULT_BASE_URL.to_string()
}

fn default_timeout() -> u64 {
    600
}

fn default_backoff() -> u64 {
    1000
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            max_connections: default_max_connections(),
            drain_timeout_secs: default_drain_timeout(),
        }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            uses_per_window: default_uses_per_window(),
            window_secs: default_window(),
            poll_interval_ms: default_poll_interval(),
            keys_file: None,
        }
    }
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            timeout_secs: default_timeout(),
            backoff_ms: default_backoff(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file, then resolve API keys.
    ///
    /// Key resolution order:
    /// 1. API_KEYS env var (comma-separated)
    /// 2. keys_file path from config (one key per line, `#` comments)
    ///
    /// An empty key list is a configuration error.
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)?;
        config.validate()?;
        config.api_keys = config.resolve_api_keys()?;
        Ok(config)
    }

    fn validate(&self) -> common::Result<()> {
        let fail = |msg: &str| Err(common::Error::Config(msg.to_string()));

        if self.server.max_connections == 0 {
            return fail("max_connections must be greater than 0");
        }
        if self.pool.uses_per_window == 0 {
            return fail("uses_per_window must be greater than 0");
        }
        if self.pool.window_secs == 0 {
            return fail("window_secs must be greater than 0");
        }
        if self.pool.poll_interval_ms == 0 {
            return fail("poll_interval_ms must be greater than 0");
        }
        if self.upstream.timeout_secs == 0 {
            return fail("timeout_secs must be greater than 0");
        }
        if !self.upstream.base_url.starts_with("http://")
            && !self.upstream.base_url.starts_with("https://")
        {
            return Err(common::Error::Config(format!(
                "base_url must start with http:// or https://, got: {}",
                self.upstream.base_url
            )));
        }

        for (name, attempts) in &self.plans {
            if name.is_empty()
                || !name
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
            {
                return Err(common::Error::Config(format!(
                    "plan name must be non-empty and use only letters, digits, '-' or '_', got: {name:?}"
                )));
            }
            if attempts.is_empty() {
                warn!(plan = %name, "attempt plan is empty, its requests will always fail");
            }
            for (i, attempt) in attempts.iter().enumerate() {
                if attempt.model.trim().is_empty() {
                    return Err(common::Error::Config(format!(
                        "plan {name} attempt {} has an empty model",
                        i + 1
                    )));
                }
                if let Some(t) = attempt.temperature {
                    if !(0.0..=2.0).contains(&t) {
                        return Err(common::Error::Config(format!(
                            "plan {name} attempt {} temperature must be within 0.0..=2.0, got: {t}",
                            i + 1
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    fn resolve_api_keys(&self) -> common::Result<Vec<Secret<String>>> {
        // A blank API_KEYS (e.g. `API_KEYS=` in a compose file) counts as unset.
        let from_env = std::env::var(API_KEYS_ENV)
            .ok()
            .filter(|value| !value.trim().is_empty());
        let raw: Vec<String> = if let Some(value) = from_env {
            value.split(',').map(str::to_string).collect()
        } else if let Some(ref keys_file) = self.pool.keys_file {
            let contents = std::fs::read_to_string(keys_file).map_err(|e| {
                common::Error::Config(format!(
                    "failed to read keys_file {}: {e}",
                    keys_file.display()
                ))
            })?;
            contents
                .lines()
                .filter(|line| !line.trim_start().starts_with('#'))
                .map(str::to_string)
                .collect()
        } else {
            Vec::new()
        };

        let keys = dedupe_keys(raw);
        if keys.is_empty() {
            return Err(common::Error::Config(format!(
                "no API keys configured, set {API_KEYS_ENV} or pool.keys_file"
            )));
        }
        Ok(keys)
    }

    /// Credentials labelled `key-1`, `key-2`, ... in configured order.
    pub fn credentials(&self) -> Vec<Credential> {
        self.api_keys
            .iter()
            .enumerate()
            .map(|(i, key)| Credential::new(format!("key-{}", i + 1), key.expose().clone()))
            .collect()
    }

    pub fn quota_policy(&self) -> QuotaPolicy {
        QuotaPolicy {
            uses_per_window: self.pool.uses_per_window,
            window: Duration::from_secs(self.pool.window_secs),
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.pool.poll_interval_ms)
    }

    pub fn retry_settings(&self) -> RetrySettings {
        RetrySettings {
            call_timeout: Duration::from_secs(self.upstream.timeout_secs),
            backoff: Duration::from_millis(self.upstream.backoff_ms),
        }
    }

    /// Configured plans, plus the built-in `default` when none is configured.
    pub fn attempt_plans(&self) -> BTreeMap<String, AttemptPlan> {
        let mut plans: BTreeMap<String, AttemptPlan> = self
            .plans
            .iter()
            .map(|(name, attempts)| {
                let plan = attempts
                    .iter()
                    .map(|a| Attempt::new(a.model.trim(), a.temperature))
                    .collect();
                (name.clone(), plan)
            })
            .collect();
        plans
            .entry(DEFAULT_PLAN.to_string())
            .or_insert_with(|| AttemptPlan::repeated(DEFAULT_MODEL, DEFAULT_ATTEMPTS));
        plans
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("gemini-gateway.toml")
    }
}

/// Load `dir/.env` into the process environment without overriding variables
/// that are already set. Returns the path when a file was loaded.
pub fn load_dotenv(dir: &Path) -> Option<PathBuf> {
    let path = dir.join(".env");
    match dotenvy::from_path(&path) {
        Ok(()) => Some(path),
        Err(e) if e.not_found() => None,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "ignoring unreadable .env file");
            None
        }
    }
}

/// Trim, drop blanks and duplicates (first occurrence wins).
fn dedupe_keys(raw: Vec<String>) -> Vec<Secret<String>> {
    let mut keys: Vec<Secret<String>> = Vec::new();
    let mut duplicates = 0usize;
    for entry in raw {
        let key = entry.trim();
        if key.is_empty() {
            continue;
        }
        if keys.iter().any(|k| k.expose() == key) {
            duplicates += 1;
            continue;
        }
        keys.push(Secret::new(key.to_string()));
    }
    if duplicates > 0 {
        warn!(duplicates, "dropping duplicate API keys");
    }
    keys
}
