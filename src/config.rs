use std::time::Duration;
use std::{env, io};

use secrecy::SecretString;
use serde::Serialize;
use tracing::debug;

const DEFAULT_GEOCODER_ENDPOINT: &str = "https://nominatim.openstreetmap.org/search";
const DEFAULT_DIAGNOSTICS_RETAIN_BYTES: u64 = 5 * 1024 * 1024;
const DEFAULT_DIAGNOSTICS_RETAIN_RUNS: usize = 5;
pub const DEFAULT_BATCH_SIZE: usize = 1000;
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_RETRY_DELAY_MS: u64 = 500;

/// How the delay between lookup attempts grows.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffKind {
    Fixed,
    Exponential,
}

impl BackoffKind {
    fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "fixed" => Some(BackoffKind::Fixed),
            "exponential" | "exp" => Some(BackoffKind::Exponential),
            _ => None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub geocoder_endpoint: String,
    pub geocoder_api_key: Option<SecretString>,
    pub geocoder_user_agent: String,
    pub geocoder_timeout_ms: u64,
    pub geocoder_rate_limit_qps: u32,
    pub batch_size: usize,
    pub worker_pool_size: usize,
    pub max_attempts: u32,
    pub retry_delay_ms: u64,
    pub backoff: BackoffKind,
    pub diagnostics_enabled: bool,
    pub diagnostics_retain_bytes: u64,
    pub diagnostics_retain_runs: usize,
    pub diagnostics_dir: String,
    pub output_file: String,
}

#[derive(Clone, Debug, Serialize)]
pub struct PublicAppConfig {
    pub geocoder_endpoint: String,
    pub geocoder_user_agent: String,
    pub geocoder_timeout_ms: u64,
    pub geocoder_rate_limit_qps: u32,
    pub batch_size: usize,
    pub worker_pool_size: usize,
    pub max_attempts: u32,
    pub retry_delay_ms: u64,
    pub backoff: BackoffKind,
    pub diagnostics_enabled: bool,
    pub diagnostics_dir: String,
    pub output_file: String,
    pub has_geocoder_api_key: bool,
}

impl AppConfig {
    pub fn from_env() -> Self {
        load_dotenv_if_applicable();
        Self {
            geocoder_endpoint: env::var("GEOCODER_ENDPOINT")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_GEOCODER_ENDPOINT.to_string()),
            geocoder_api_key: env::var("GEOCODER_API_KEY")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .map(SecretString::from),
            geocoder_user_agent: env::var("GEOCODER_USER_AGENT")
                .unwrap_or_else(|_| default_user_agent()),
            geocoder_timeout_ms: parse_u64("GEOCODER_TIMEOUT_MS", 10_000),
            geocoder_rate_limit_qps: parse_u32("GEOCODER_RATE_LIMIT_QPS", 0),
            batch_size: parse_usize("GEOCODE_BATCH_SIZE", DEFAULT_BATCH_SIZE).max(1),
            worker_pool_size: parse_usize("GEOCODE_WORKERS", default_worker_pool_size()).max(1),
            max_attempts: parse_u32("GEOCODE_MAX_ATTEMPTS", DEFAULT_MAX_ATTEMPTS).max(1),
            retry_delay_ms: parse_u64("GEOCODE_RETRY_DELAY_MS", DEFAULT_RETRY_DELAY_MS),
            backoff: env::var("GEOCODE_BACKOFF")
                .ok()
                .and_then(|v| BackoffKind::parse(&v))
                .unwrap_or(BackoffKind::Fixed),
            diagnostics_enabled: parse_bool("DIAGNOSTICS_ENABLED", true),
            diagnostics_retain_bytes: parse_u64(
                "DIAGNOSTICS_RETAIN_BYTES",
                DEFAULT_DIAGNOSTICS_RETAIN_BYTES,
            ),
            diagnostics_retain_runs: parse_usize(
                "DIAGNOSTICS_RETAIN_RUNS",
                DEFAULT_DIAGNOSTICS_RETAIN_RUNS,
            )
            .max(1),
            diagnostics_dir: env::var("DIAGNOSTICS_DIR")
                .unwrap_or_else(|_| "geocode-diagnostics".to_string()),
            output_file: env::var("OUTPUT_FILE").unwrap_or_else(|_| "output_file.csv".to_string()),
        }
    }

    pub fn public_profile(&self) -> PublicAppConfig {
        PublicAppConfig {
            geocoder_endpoint: self.geocoder_endpoint.clone(),
            geocoder_user_agent: self.geocoder_user_agent.clone(),
            geocoder_timeout_ms: self.geocoder_timeout_ms,
            geocoder_rate_limit_qps: self.geocoder_rate_limit_qps,
            batch_size: self.batch_size,
            worker_pool_size: self.worker_pool_size,
            max_attempts: self.max_attempts,
            retry_delay_ms: self.retry_delay_ms,
            backoff: self.backoff,
            diagnostics_enabled: self.diagnostics_enabled,
            diagnostics_dir: self.diagnostics_dir.clone(),
            output_file: self.output_file.clone(),
            has_geocoder_api_key: self.geocoder_api_key.is_some(),
        }
    }

    pub fn geocoder_timeout(&self) -> Duration {
        Duration::from_millis(self.geocoder_timeout_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            geocoder_endpoint: DEFAULT_GEOCODER_ENDPOINT.to_string(),
            geocoder_api_key: None,
            geocoder_user_agent: default_user_agent(),
            geocoder_timeout_ms: 10_000,
            geocoder_rate_limit_qps: 0,
            batch_size: DEFAULT_BATCH_SIZE,
            worker_pool_size: default_worker_pool_size(),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            retry_delay_ms: DEFAULT_RETRY_DELAY_MS,
            backoff: BackoffKind::Fixed,
            diagnostics_enabled: true,
            diagnostics_retain_bytes: DEFAULT_DIAGNOSTICS_RETAIN_BYTES,
            diagnostics_retain_runs: DEFAULT_DIAGNOSTICS_RETAIN_RUNS,
            diagnostics_dir: "geocode-diagnostics".to_string(),
            output_file: "output_file.csv".to_string(),
        }
    }
}

fn default_user_agent() -> String {
    format!("contact-geocoder/{}", env!("CARGO_PKG_VERSION"))
}

fn default_worker_pool_size() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get() + 4)
        .unwrap_or(5)
        .min(32)
}

fn load_dotenv_if_applicable() {
    if !should_load_dotenv() {
        debug!("skipping .env load outside dev mode");
        return;
    }

    if let Err(err) = dotenvy::dotenv() {
        match &err {
            dotenvy::Error::Io(io_err) if io_err.kind() == io::ErrorKind::NotFound => {}
            _ => debug!(?err, "unable to load .env file"),
        }
    }
}

fn should_load_dotenv() -> bool {
    cfg!(debug_assertions) || parse_bool("ALLOW_DOTENV", false)
}

fn parse_bool(key: &str, default: bool) -> bool {
    env::var(key)
        .map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "True"))
        .unwrap_or(default)
}

fn parse_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(default)
}

fn parse_usize(key: &str, default: usize) -> usize {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(default)
}

fn parse_u32(key: &str, default: u32) -> u32 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<u32>().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_public_profile_without_secrets() {
        env::set_var("GEOCODER_API_KEY", "secret");
        env::set_var("GEOCODE_BATCH_SIZE", "0");
        env::set_var("GEOCODE_BACKOFF", "Exponential");
        env::set_var("DIAGNOSTICS_ENABLED", "false");

        let config = AppConfig::from_env();
        let public = config.public_profile();

        assert!(public.has_geocoder_api_key);
        assert!(config.geocoder_api_key.is_some());
        assert_eq!(public.batch_size, 1);
        assert_eq!(public.backoff, BackoffKind::Exponential);
        assert!(!public.diagnostics_enabled);
        let serialized = serde_json::to_string(&public).unwrap();
        assert!(!serialized.contains("secret"));
    }

    #[test]
    fn defaults_follow_retry_contract() {
        let config = AppConfig::default();
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.retry_delay(), Duration::from_millis(500));
        assert_eq!(config.batch_size, 1000);
        assert!(config.worker_pool_size >= 1 && config.worker_pool_size <= 32);
    }

    #[test]
    fn parses_backoff_names() {
        assert_eq!(BackoffKind::parse(" fixed "), Some(BackoffKind::Fixed));
        assert_eq!(BackoffKind::parse("EXP"), Some(BackoffKind::Exponential));
        assert_eq!(BackoffKind::parse("linear"), None);
    }
}
