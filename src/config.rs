//! Configuration management for codex-lb.
//!
//! Configuration is loaded entirely from environment variables, per the
//! representative key table. Nothing here touches disk except to resolve
//! `~` in path-shaped defaults.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {0}: {1}")]
    InvalidValue(String, String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StickyBackend {
    Memory,
    Db,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamBufferMode {
    Off,
    Prelude,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionStrategy {
    TierWeightedResetFirst,
    HybridWastePressure,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub accounts_database_url: PathBuf,
    pub database_url: PathBuf,
    pub encryption_key_file: PathBuf,
    pub upstream_base_url: String,

    pub host: String,
    pub port: u16,

    pub snapshot_ttl: Duration,
    pub sticky_backend: StickyBackend,
    pub request_logs_buffer_enabled: bool,
    pub request_log_buffer_capacity: usize,
    pub request_log_flush_batch_size: usize,
    pub request_log_flush_interval: Duration,

    pub stream_buffer_mode: StreamBufferMode,
    pub stream_buffer_prelude_timeout: Duration,
    pub stream_buffer_prelude_max_bytes: usize,

    pub usage_limit_reached_min_cooldown: Duration,
    pub usage_limit_reached_max_initial_cooldown: Duration,
    pub usage_limit_reached_escalate_streak_threshold: u32,
    pub rate_limit_persist_threshold: Duration,

    pub usage_refresh_interval: Duration,
    pub usage_refresh_concurrency: usize,

    pub selection_strategy: SelectionStrategy,
    pub proxy_max_attempts: u32,
    pub proxy_compact_timeout: Duration,
    pub proxy_stream_read_timeout: Duration,

    pub debug_endpoints_enabled: bool,
}

fn expand_home(raw: &str) -> PathBuf {
    if let Some(rest) = raw.strip_prefix("~/") {
        if let Some(home) = dirs_home() {
            return home.join(rest);
        }
    }
    PathBuf::from(raw)
}

/// Minimal `$HOME` resolution so the crate doesn't need the `dirs` crate for
/// a single lookup.
fn dirs_home() -> Option<PathBuf> {
    std::env::var_os("HOME").map(PathBuf::from)
}

fn env_str(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_path(key: &str, default: &str) -> PathBuf {
    expand_home(&env_str(key, default))
}

fn env_parsed<T: std::str::FromStr>(key: &str, default: T) -> Result<T, ConfigError> {
    match std::env::var(key) {
        Ok(v) => v
            .parse()
            .map_err(|_| ConfigError::InvalidValue(key.to_string(), v)),
        Err(_) => Ok(default),
    }
}

fn env_bool(key: &str, default: bool) -> Result<bool, ConfigError> {
    match std::env::var(key) {
        Ok(v) => match v.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(ConfigError::InvalidValue(key.to_string(), v)),
        },
        Err(_) => Ok(default),
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let sticky_backend = match env_str("STICKY_SESSIONS_BACKEND", "memory").as_str() {
            "db" => StickyBackend::Db,
            "memory" => StickyBackend::Memory,
            other => {
                return Err(ConfigError::InvalidValue(
                    "STICKY_SESSIONS_BACKEND".to_string(),
                    other.to_string(),
                ))
            }
        };

        let stream_buffer_mode = match env_str("STREAM_BUFFER_MODE", "off").as_str() {
            "prelude" => StreamBufferMode::Prelude,
            "off" => StreamBufferMode::Off,
            other => {
                return Err(ConfigError::InvalidValue(
                    "STREAM_BUFFER_MODE".to_string(),
                    other.to_string(),
                ))
            }
        };

        let selection_strategy = match env_str("SELECTION_STRATEGY", "tier_weighted_reset_first")
            .as_str()
        {
            "tier_weighted_reset_first" => SelectionStrategy::TierWeightedResetFirst,
            "hybrid_waste_pressure" => SelectionStrategy::HybridWastePressure,
            other => {
                return Err(ConfigError::InvalidValue(
                    "SELECTION_STRATEGY".to_string(),
                    other.to_string(),
                ))
            }
        };

        Ok(Self {
            accounts_database_url: env_path("ACCOUNTS_DATABASE_URL", "~/.codex-lb/accounts.db"),
            database_url: env_path("DATABASE_URL", "~/.codex-lb/store.db"),
            encryption_key_file: env_path("ENCRYPTION_KEY_FILE", "~/.codex-lb/encryption.key"),
            upstream_base_url: env_str(
                "UPSTREAM_BASE_URL",
                "https://chatgpt.com/backend-api/codex",
            ),
            host: env_str("HOST", "127.0.0.1"),
            port: env_parsed("PORT", 8787u16)?,
            snapshot_ttl: Duration::from_secs(env_parsed("PROXY_SNAPSHOT_TTL_SECONDS", 5u64)?),
            sticky_backend,
            request_logs_buffer_enabled: env_bool("REQUEST_LOGS_BUFFER_ENABLED", true)?,
            request_log_buffer_capacity: env_parsed("REQUEST_LOG_BUFFER_CAPACITY", 10_000usize)?,
            request_log_flush_batch_size: env_parsed("REQUEST_LOG_FLUSH_BATCH_SIZE", 200usize)?,
            request_log_flush_interval: Duration::from_secs(env_parsed(
                "REQUEST_LOG_FLUSH_INTERVAL_SECONDS",
                5u64,
            )?),
            stream_buffer_mode,
            stream_buffer_prelude_timeout: Duration::from_millis(env_parsed(
                "STREAM_BUFFER_PRELUDE_TIMEOUT_MS",
                750u64,
            )?),
            stream_buffer_prelude_max_bytes: env_parsed(
                "STREAM_BUFFER_PRELUDE_MAX_BYTES",
                65_536usize,
            )?,
            usage_limit_reached_min_cooldown: Duration::from_secs(env_parsed(
                "USAGE_LIMIT_REACHED_MIN_COOLDOWN_SECONDS",
                60u64,
            )?),
            usage_limit_reached_max_initial_cooldown: Duration::from_secs(env_parsed(
                "USAGE_LIMIT_REACHED_MAX_INITIAL_COOLDOWN_SECONDS",
                300u64,
            )?),
            usage_limit_reached_escalate_streak_threshold: env_parsed(
                "USAGE_LIMIT_REACHED_ESCALATE_STREAK_THRESHOLD",
                3u32,
            )?,
            rate_limit_persist_threshold: Duration::from_secs(env_parsed(
                "RATE_LIMIT_PERSIST_THRESHOLD_SECONDS",
                300u64,
            )?),
            usage_refresh_interval: Duration::from_secs(env_parsed(
                "USAGE_REFRESH_INTERVAL_SECONDS",
                60u64,
            )?),
            usage_refresh_concurrency: env_parsed("USAGE_REFRESH_CONCURRENCY", 8usize)?,
            selection_strategy,
            proxy_max_attempts: env_parsed("PROXY_MAX_ATTEMPTS", 3u32)?,
            proxy_compact_timeout: Duration::from_secs(env_parsed(
                "PROXY_COMPACT_TIMEOUT_SECONDS",
                300u64,
            )?),
            proxy_stream_read_timeout: Duration::from_secs(env_parsed(
                "PROXY_STREAM_READ_TIMEOUT_SECONDS",
                30u64,
            )?),
            debug_endpoints_enabled: env_bool("DEBUG_ENDPOINTS_ENABLED", false)?,
        })
    }
}

#[cfg(test)]
impl Config {
    /// A `Config` rooted under `base_dir`, for tests that need a real
    /// `Config` without touching `$HOME` or environment variables.
    pub fn for_tests(base_dir: PathBuf) -> Self {
        Self {
            accounts_database_url: base_dir.join("accounts.db"),
            database_url: base_dir.join("store.db"),
            encryption_key_file: base_dir.join("encryption.key"),
            upstream_base_url: "https://chatgpt.com/backend-api/codex".to_string(),
            host: "127.0.0.1".to_string(),
            port: 8787,
            snapshot_ttl: Duration::from_secs(5),
            sticky_backend: StickyBackend::Memory,
            request_logs_buffer_enabled: true,
            request_log_buffer_capacity: 10_000,
            request_log_flush_batch_size: 200,
            request_log_flush_interval: Duration::from_secs(5),
            stream_buffer_mode: StreamBufferMode::Prelude,
            stream_buffer_prelude_timeout: Duration::from_millis(750),
            stream_buffer_prelude_max_bytes: 65_536,
            usage_limit_reached_min_cooldown: Duration::from_secs(60),
            usage_limit_reached_max_initial_cooldown: Duration::from_secs(300),
            usage_limit_reached_escalate_streak_threshold: 3,
            rate_limit_persist_threshold: Duration::from_secs(300),
            usage_refresh_interval: Duration::from_secs(60),
            usage_refresh_concurrency: 8,
            selection_strategy: SelectionStrategy::TierWeightedResetFirst,
            proxy_max_attempts: 3,
            proxy_compact_timeout: Duration::from_secs(300),
            proxy_stream_read_timeout: Duration::from_secs(30),
            debug_endpoints_enabled: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expand_home_rewrites_tilde() {
        std::env::set_var("HOME", "/tmp/fakehome");
        assert_eq!(
            expand_home("~/.codex-lb/x"),
            PathBuf::from("/tmp/fakehome/.codex-lb/x")
        );
        assert_eq!(expand_home("/abs/path"), PathBuf::from("/abs/path"));
    }

    #[test]
    fn env_bool_accepts_common_spellings() {
        std::env::set_var("CODEX_LB_TEST_BOOL", "yes");
        assert!(env_bool("CODEX_LB_TEST_BOOL", false).unwrap());
        std::env::set_var("CODEX_LB_TEST_BOOL", "0");
        assert!(!env_bool("CODEX_LB_TEST_BOOL", true).unwrap());
        std::env::remove_var("CODEX_LB_TEST_BOOL");
    }
}
