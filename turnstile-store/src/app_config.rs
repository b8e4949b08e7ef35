use serde::Deserialize;
use std::env;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub redis: RedisConfig,
    #[serde(default)]
    pub keys: KeysConfig,
    #[serde(default)]
    pub business_rules: BusinessRules,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RedisConfig {
    pub url: String,
}

/// Key naming: `[prefix + separator] + parts joined by separator`.
#[derive(Debug, Deserialize, Clone)]
pub struct KeysConfig {
    pub prefix: Option<String>,
    #[serde(default = "default_separator")]
    pub separator: String,
}

fn default_separator() -> String {
    ":".to_string()
}

impl Default for KeysConfig {
    fn default() -> Self {
        Self {
            prefix: None,
            separator: default_separator(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct BusinessRules {
    #[serde(default = "default_hold_ttl")]
    pub hold_ttl_seconds: u64,
    /// How long an authorized purchase keeps its hold while payment completes.
    #[serde(default = "default_authorize_extension")]
    pub authorize_extension_seconds: u64,
    #[serde(default = "default_seat_ttl")]
    pub seat_marker_ttl_seconds: u64,
    #[serde(default = "default_seat_ttl")]
    pub seat_commit_ttl_seconds: u64,
    #[serde(default = "default_sweep_page_size")]
    pub sweep_page_size: usize,
}

fn default_hold_ttl() -> u64 { 30 }
fn default_authorize_extension() -> u64 { 30 }
fn default_seat_ttl() -> u64 { 5 }
fn default_sweep_page_size() -> usize { 1000 }

impl Default for BusinessRules {
    fn default() -> Self {
        Self {
            hold_ttl_seconds: default_hold_ttl(),
            authorize_extension_seconds: default_authorize_extension(),
            seat_marker_ttl_seconds: default_seat_ttl(),
            seat_commit_ttl_seconds: default_seat_ttl(),
            sweep_page_size: default_sweep_page_size(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetryConfig {
    pub max_retries: usize,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_delay_ms: 10,
            max_delay_ms: 500,
            multiplier: 2.0,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct WorkerConfig {
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_seconds: u64,
    /// Event SKUs whose holds the sweeper reclaims.
    #[serde(default)]
    pub events: Vec<String>,
}

fn default_sweep_interval() -> u64 { 5 }

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            sweep_interval_seconds: default_sweep_interval(),
            events: Vec::new(),
        }
    }
}

impl Config {
    pub fn load() -> Result<Self, config::ConfigError> {
        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let s = config::Config::builder()
            .add_source(config::File::with_name("config/default"))
            // Per-environment overrides are optional
            .add_source(config::File::with_name(&format!("config/{}", run_mode)).required(false))
            // Local overrides, never checked in
            .add_source(config::File::with_name("config/local").required(false))
            // Eg.. `TURNSTILE_REDIS__URL=redis://...` sets `redis.url`
            .add_source(config::Environment::with_prefix("TURNSTILE").separator("__"))
            .build()?;

        s.try_deserialize()
    }
}
