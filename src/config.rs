use std::env;
use std::time::Duration;

/// Process-wide configuration, loaded once at startup from the environment.
///
/// Mirrors the configuration surface enumerated in the service spec: join
/// token signing secret, internal introspection secret, the dev token
/// issuer gate, and the TURN credential / rate-limit knobs.
#[derive(Debug, Clone)]
pub struct Config {
    pub join_token_secret: String,
    pub internal_api_secret: String,
    pub dev_issuer_secret: Option<String>,
    pub allow_dev_token_issuer: bool,
    pub turn_urls: Vec<String>,
    pub turn_shared_secret: Option<String>,
    pub turn_ttl_seconds: u64,
    pub turn_rate_limit_max: u32,
    pub turn_rate_limit_window_sec: u64,
    pub bind_addr: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),
}

impl Config {
    /// Loads configuration from the process environment, applying a
    /// `.env` file first if present (development convenience only).
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();

        let join_token_secret =
            env::var("JOIN_TOKEN_SECRET").map_err(|_| ConfigError::Missing("JOIN_TOKEN_SECRET"))?;
        let internal_api_secret = env::var("INTERNAL_API_SECRET")
            .map_err(|_| ConfigError::Missing("INTERNAL_API_SECRET"))?;

        let dev_issuer_secret = env::var("DEV_ISSUER_SECRET").ok();
        let allow_dev_token_issuer = env::var("ALLOW_DEV_TOKEN_ISSUER")
            .map(|v| v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);

        let turn_urls = env::var("TURN_URLS")
            .ok()
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        let turn_shared_secret = env::var("TURN_SHARED_SECRET").ok();
        let turn_ttl_seconds = env::var("TURN_TTL_SECONDS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(3600)
            .max(60);

        let turn_rate_limit_max = env::var("TURN_RATE_LIMIT_MAX")
            .ok()
            .and_then(|v| v.parse::<u32>().ok())
            .unwrap_or(10);
        let turn_rate_limit_window_sec = env::var("TURN_RATE_LIMIT_WINDOW_SEC")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(60);

        let bind_addr = env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string());

        Ok(Config {
            join_token_secret,
            internal_api_secret,
            dev_issuer_secret,
            allow_dev_token_issuer,
            turn_urls,
            turn_shared_secret,
            turn_ttl_seconds,
            turn_rate_limit_max,
            turn_rate_limit_window_sec,
            bind_addr,
        })
    }

    pub fn turn_rate_limit_window(&self) -> Duration {
        Duration::from_secs(self.turn_rate_limit_window_sec)
    }
}
