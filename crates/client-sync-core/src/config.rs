//! Configuration management for the client sync layer
//!
//! Values come from defaults, optionally overlaid by a JSON5 file, then by
//! `CLIENT_SYNC_*` environment variables (with a `.env` fallback in the
//! working directory). Invalid values keep the previous value.

use serde::Deserialize;
use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::Path;
use std::sync::OnceLock;
use std::time::Duration;

use crate::error::{Error, Result};

/// Prefix shared by every environment variable this crate reads.
pub const ENV_PREFIX: &str = "CLIENT_SYNC_";

/// Main configuration struct
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    // Caches
    /// TTL for rarely-changing lists (agents, clients).
    pub list_cache_ttl: Duration,
    /// TTL for frequently-changing per-user lists.
    pub user_cache_ttl: Duration,
    pub metrics_cache_ttl: Duration,
    pub cache_capacity: usize,

    // Flush pipeline
    pub flush_interval: Duration,
    pub flush_send_timeout: Duration,
    pub flush_queue_capacity: usize,
    /// 0 means a failed batch is dropped immediately.
    pub flush_max_retries: u32,
    pub flush_retry_base_delay: Duration,
    pub flush_retry_max_delay: Duration,

    // Credentials
    pub refresh_timeout: Duration,
    /// A credential expiring within this window is treated as already expired.
    pub credential_expiry_skew: Duration,

    // Notification sync
    pub sync_min_interval: Duration,
    pub sync_timeout: Duration,
    pub mutation_timeout: Duration,
    pub history_limit: usize,

    // Generic requests
    pub request_timeout: Duration,

    // Logging
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            list_cache_ttl: Duration::from_secs(60 * 60),
            user_cache_ttl: Duration::from_secs(60),
            metrics_cache_ttl: Duration::from_secs(5 * 60),
            cache_capacity: 256,
            flush_interval: Duration::from_secs(2),
            flush_send_timeout: Duration::from_secs(10),
            flush_queue_capacity: 10_000,
            flush_max_retries: 0,
            flush_retry_base_delay: Duration::from_millis(500),
            flush_retry_max_delay: Duration::from_secs(8),
            refresh_timeout: Duration::from_secs(15),
            credential_expiry_skew: Duration::from_secs(30),
            sync_min_interval: Duration::from_secs(5),
            sync_timeout: Duration::from_secs(15),
            mutation_timeout: Duration::from_secs(10),
            history_limit: 100,
            request_timeout: Duration::from_secs(20),
            log_level: "info".to_string(),
        }
    }
}

/// On-disk overlay. Durations are milliseconds; absent keys keep the current value.
#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "snake_case")]
struct ConfigFile {
    list_cache_ttl_ms: Option<u64>,
    user_cache_ttl_ms: Option<u64>,
    metrics_cache_ttl_ms: Option<u64>,
    cache_capacity: Option<usize>,
    flush_interval_ms: Option<u64>,
    flush_send_timeout_ms: Option<u64>,
    flush_queue_capacity: Option<usize>,
    flush_max_retries: Option<u32>,
    flush_retry_base_delay_ms: Option<u64>,
    flush_retry_max_delay_ms: Option<u64>,
    refresh_timeout_ms: Option<u64>,
    credential_expiry_skew_ms: Option<u64>,
    sync_min_interval_ms: Option<u64>,
    sync_timeout_ms: Option<u64>,
    mutation_timeout_ms: Option<u64>,
    history_limit: Option<usize>,
    request_timeout_ms: Option<u64>,
    log_level: Option<String>,
}

fn overlay_ms(slot: &mut Duration, value: Option<u64>) {
    if let Some(ms) = value {
        *slot = Duration::from_millis(ms);
    }
}

fn overlay<T>(slot: &mut T, value: Option<T>) {
    if let Some(v) = value {
        *slot = v;
    }
}

impl Config {
    /// Load configuration from environment variables
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env();
        config
    }

    /// Load a JSON5 config file, then apply environment overrides on top.
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        let mut config = Self::from_json5(&text)?;
        config.apply_env();
        Ok(config)
    }

    /// Parse a JSON5 document over the defaults. Environment is not consulted.
    pub fn from_json5(text: &str) -> Result<Self> {
        let file: ConfigFile = json5::from_str(text)
            .map_err(|e| Error::InvalidArgument(format!("config parse failed: {e}")))?;
        let mut config = Self::default();
        config.apply_file(file);
        Ok(config)
    }

    fn apply_file(&mut self, file: ConfigFile) {
        overlay_ms(&mut self.list_cache_ttl, file.list_cache_ttl_ms);
        overlay_ms(&mut self.user_cache_ttl, file.user_cache_ttl_ms);
        overlay_ms(&mut self.metrics_cache_ttl, file.metrics_cache_ttl_ms);
        overlay(&mut self.cache_capacity, file.cache_capacity.filter(|c| *c > 0));
        overlay_ms(
            &mut self.flush_interval,
            file.flush_interval_ms.filter(|ms| *ms > 0),
        );
        overlay_ms(&mut self.flush_send_timeout, file.flush_send_timeout_ms);
        overlay(
            &mut self.flush_queue_capacity,
            file.flush_queue_capacity.filter(|c| *c > 0),
        );
        overlay(&mut self.flush_max_retries, file.flush_max_retries);
        overlay_ms(&mut self.flush_retry_base_delay, file.flush_retry_base_delay_ms);
        overlay_ms(&mut self.flush_retry_max_delay, file.flush_retry_max_delay_ms);
        overlay_ms(&mut self.refresh_timeout, file.refresh_timeout_ms);
        overlay_ms(&mut self.credential_expiry_skew, file.credential_expiry_skew_ms);
        overlay_ms(&mut self.sync_min_interval, file.sync_min_interval_ms);
        overlay_ms(&mut self.sync_timeout, file.sync_timeout_ms);
        overlay_ms(&mut self.mutation_timeout, file.mutation_timeout_ms);
        overlay(&mut self.history_limit, file.history_limit.filter(|l| *l > 0));
        overlay_ms(&mut self.request_timeout, file.request_timeout_ms);
        overlay(&mut self.log_level, file.log_level);
    }

    fn apply_env(&mut self) {
        self.list_cache_ttl = env_duration_ms("LIST_CACHE_TTL_MS", self.list_cache_ttl);
        self.user_cache_ttl = env_duration_ms("USER_CACHE_TTL_MS", self.user_cache_ttl);
        self.metrics_cache_ttl = env_duration_ms("METRICS_CACHE_TTL_MS", self.metrics_cache_ttl);
        self.cache_capacity = env_usize("CACHE_CAPACITY", self.cache_capacity).max(1);

        let flush_interval = env_duration_ms("FLUSH_INTERVAL_MS", self.flush_interval);
        if !flush_interval.is_zero() {
            self.flush_interval = flush_interval;
        }
        self.flush_send_timeout = env_duration_ms("FLUSH_SEND_TIMEOUT_MS", self.flush_send_timeout);
        self.flush_queue_capacity =
            env_usize("FLUSH_QUEUE_CAPACITY", self.flush_queue_capacity).max(1);
        self.flush_max_retries = env_u32("FLUSH_MAX_RETRIES", self.flush_max_retries);
        self.flush_retry_base_delay =
            env_duration_ms("FLUSH_RETRY_BASE_DELAY_MS", self.flush_retry_base_delay);
        self.flush_retry_max_delay =
            env_duration_ms("FLUSH_RETRY_MAX_DELAY_MS", self.flush_retry_max_delay);

        self.refresh_timeout = env_duration_ms("REFRESH_TIMEOUT_MS", self.refresh_timeout);
        self.credential_expiry_skew =
            env_duration_ms("CREDENTIAL_EXPIRY_SKEW_MS", self.credential_expiry_skew);

        self.sync_min_interval = env_duration_ms("SYNC_MIN_INTERVAL_MS", self.sync_min_interval);
        self.sync_timeout = env_duration_ms("SYNC_TIMEOUT_MS", self.sync_timeout);
        self.mutation_timeout = env_duration_ms("MUTATION_TIMEOUT_MS", self.mutation_timeout);
        self.history_limit = env_usize("HISTORY_LIMIT", self.history_limit).max(1);
        self.request_timeout = env_duration_ms("REQUEST_TIMEOUT_MS", self.request_timeout);

        if let Some(v) = env_value("LOG_LEVEL") {
            let v = v.trim();
            if !v.is_empty() {
                self.log_level = v.to_lowercase();
            }
        }
    }
}

// Helper functions for environment variable parsing

static DOTENV_VALUES: OnceLock<HashMap<String, String>> = OnceLock::new();

#[cfg(test)]
thread_local! {
    static TEST_ENV_OVERRIDES: std::cell::RefCell<HashMap<String, String>> =
        std::cell::RefCell::new(HashMap::new());
}

#[cfg(test)]
fn test_env_override_value(key: &str) -> Option<String> {
    TEST_ENV_OVERRIDES.with(|cell| cell.borrow().get(key).cloned())
}

fn dotenv_values() -> &'static HashMap<String, String> {
    DOTENV_VALUES.get_or_init(|| load_dotenv_file(Path::new(".env")))
}

fn load_dotenv_file(path: &Path) -> HashMap<String, String> {
    let Ok(contents) = fs::read_to_string(path) else {
        return HashMap::new();
    };
    parse_dotenv_contents(&contents)
}

/// Read `CLIENT_SYNC_{key}` from the real environment first, falling back to .env.
#[must_use]
pub fn env_value(key: &str) -> Option<String> {
    let full = format!("{ENV_PREFIX}{key}");
    #[cfg(test)]
    if let Some(v) = test_env_override_value(&full) {
        return Some(v);
    }
    env::var(&full)
        .ok()
        .or_else(|| dotenv_values().get(&full).cloned())
}

/// Parse `KEY=value` lines. Supports comments, `export ` prefixes and quoted values.
#[must_use]
pub fn parse_dotenv_contents(contents: &str) -> HashMap<String, String> {
    let mut map = HashMap::new();
    for raw_line in contents.lines() {
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let line = line.strip_prefix("export ").unwrap_or(line);
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        map.insert(key.to_string(), parse_dotenv_value(value));
    }
    map
}

fn parse_dotenv_value(raw: &str) -> String {
    let trimmed = raw.trim();
    for quote in ['"', '\''] {
        if let Some(rest) = trimmed.strip_prefix(quote) {
            if let Some(end) = rest.find(quote) {
                return rest[..end].to_string();
            }
        }
    }
    // Unquoted: strip trailing inline comment
    trimmed
        .split_once(" #")
        .map_or(trimmed, |(value, _)| value.trim_end())
        .to_string()
}

fn env_u32(key: &str, default: u32) -> u32 {
    env_value(key)
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn env_u64_opt(key: &str) -> Option<u64> {
    env_value(key).and_then(|v| v.trim().parse().ok())
}

fn env_usize(key: &str, default: usize) -> usize {
    env_value(key)
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn env_duration_ms(key: &str, default: Duration) -> Duration {
    env_u64_opt(key).map_or(default, Duration::from_millis)
}
