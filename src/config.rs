use once_cell::sync::Lazy;

#[derive(Debug)]
pub struct Config {
    pub gcs_timeout_ms: u64,
    pub gcs_poll_delay_ms: u64,
    pub gcs_wait_timeout_secs: u64,
    pub gcs_connect_timeout_ms: u64,
    pub log_traffic: bool,
    pub float_digits: usize,
    pub bulk_chunk: usize,
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

impl Config {
    fn from_env() -> Self {
        let log_traffic = std::env::var("GCS_LOG_TRAFFIC")
            .map(|v| v == "1")
            .unwrap_or(false);
        Self {
            gcs_timeout_ms: env_or("GCS_TIMEOUT_MS", 7000u64),
            gcs_poll_delay_ms: env_or("GCS_POLL_DELAY_MS", 100u64),
            gcs_wait_timeout_secs: env_or("GCS_WAIT_TIMEOUT_SECS", 300u64),
            gcs_connect_timeout_ms: env_or("GCS_CONNECT_TIMEOUT_MS", 3000u64),
            log_traffic,
            // precision 0 would make every float "0"
            float_digits: env_or("GCS_FLOAT_DIGITS", 12usize).clamp(1, 17),
            bulk_chunk: env_or("GCS_BULK_CHUNK", 0usize),
        }
    }
}

/// Global config loaded once from environment at first access.
pub static GLOBAL_CONFIG: Lazy<Config> = Lazy::new(Config::from_env);

/// Convenience accessor
pub fn config() -> &'static Config {
    &GLOBAL_CONFIG
}
