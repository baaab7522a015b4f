use std::{env, fmt, net::SocketAddr, num::NonZeroUsize, time::Duration};

use thiserror::Error;

use crate::classifier::{ModerationConfig, client::DEFAULT_ENDPOINT};
use crate::store::tables::Domain;
use crate::util::retry::RetryPolicy;

#[cfg(test)]
use once_cell::sync::Lazy;
#[cfg(test)]
pub(crate) static ENV_MUTEX: Lazy<std::sync::Mutex<()>> = Lazy::new(|| std::sync::Mutex::new(()));

#[derive(Clone, PartialEq)]
pub struct Config {
    http_bind: SocketAddr,
    db_dsn: String,
    db_max_connections: u32,
    db_min_connections: u32,
    db_acquire_timeout: Duration,
    db_idle_timeout: Duration,
    db_max_lifetime: Duration,
    moderation_token: String,
    moderation_endpoint: String,
    moderation_timeout: Duration,
    moderation_max_attempts: NonZeroUsize,
    moderation_backoff_base: Duration,
    moderation_backoff_cap: Duration,
    moderation_backoff_jitter: bool,
    confidence_threshold: f64,
    worker_concurrency: NonZeroUsize,
    supervisor_concurrency: NonZeroUsize,
    domains: Vec<Domain>,
    batch_limit: Option<i64>,
    run_interval: Duration,
    otel_exporter_endpoint: Option<String>,
    otel_sampling_ratio: f64,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing environment variable: {0}")]
    Missing(&'static str),
    #[error("invalid value for {name}: {source}")]
    Invalid {
        name: &'static str,
        #[source]
        source: anyhow::Error,
    },
}

impl Config {
    /// 環境変数から Toxicity Worker の設定値を読み込み、検証する。
    ///
    /// API トークンが無い状態で起動すると全件が分類できずに終わるため、
    /// トークンと DSN は必須とする。
    ///
    /// # Errors
    /// `TOXICITY_DB_DSN` / `MODERATE_HATESPEECH_API_TOKEN` が未設定または空、
    /// もしくは各種値のパースに失敗した場合は [`ConfigError`] を返す。
    pub fn from_env() -> Result<Self, ConfigError> {
        let db_dsn = required_var("TOXICITY_DB_DSN")?;
        let moderation_token = required_var("MODERATE_HATESPEECH_API_TOKEN")?;
        let http_bind = parse_socket_addr("TOXICITY_WORKER_HTTP_BIND", "0.0.0.0:9010")?;

        // Moderation API settings
        let moderation_endpoint =
            env::var("MODERATION_API_URL").unwrap_or_else(|_| DEFAULT_ENDPOINT.to_string());
        let moderation_timeout = parse_duration_ms("MODERATION_TIMEOUT_MS", 10_000)?;
        let moderation_max_attempts = parse_non_zero_usize("MODERATION_MAX_ATTEMPTS", 3)?;
        let moderation_backoff_base = parse_duration_ms("MODERATION_BACKOFF_BASE_MS", 1_000)?;
        let moderation_backoff_cap = parse_duration_ms("MODERATION_BACKOFF_CAP_MS", 30_000)?;
        let moderation_backoff_jitter = parse_bool("MODERATION_BACKOFF_JITTER", false)?;
        let confidence_threshold = parse_probability("TOXICITY_CONFIDENCE_THRESHOLD", 0.9)?;

        // Pipeline settings
        let worker_concurrency = parse_non_zero_usize("TOXICITY_WORKER_CONCURRENCY", 10)?;
        let supervisor_concurrency = parse_non_zero_usize("TOXICITY_SUPERVISOR_CONCURRENCY", 2)?;
        let domains = parse_domains("TOXICITY_DOMAINS", "reddit,fourchan")?;
        let batch_limit = parse_optional_i64("TOXICITY_BATCH_LIMIT")?;
        let run_interval = parse_duration_secs("TOXICITY_RUN_INTERVAL_SECS", 1_800)?;
        if run_interval.is_zero() {
            return Err(invalid(
                "TOXICITY_RUN_INTERVAL_SECS",
                anyhow::anyhow!("must be greater than zero"),
            ));
        }

        // Database connection pool settings
        let db_max_connections = parse_u32("TOXICITY_DB_MAX_CONNECTIONS", 25)?;
        let db_min_connections = parse_u32("TOXICITY_DB_MIN_CONNECTIONS", 2)?;
        let db_acquire_timeout = parse_duration_secs("TOXICITY_DB_ACQUIRE_TIMEOUT_SECS", 30)?;
        let db_idle_timeout = parse_duration_secs("TOXICITY_DB_IDLE_TIMEOUT_SECS", 600)?;
        let db_max_lifetime = parse_duration_secs("TOXICITY_DB_MAX_LIFETIME_SECS", 1_800)?;

        // OpenTelemetry settings
        let otel_exporter_endpoint = env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
            .ok()
            .filter(|value| !value.trim().is_empty());
        let otel_sampling_ratio = parse_probability("OTEL_SAMPLING_RATIO", 1.0)?;

        Ok(Self {
            http_bind,
            db_dsn,
            db_max_connections,
            db_min_connections,
            db_acquire_timeout,
            db_idle_timeout,
            db_max_lifetime,
            moderation_token,
            moderation_endpoint,
            moderation_timeout,
            moderation_max_attempts,
            moderation_backoff_base,
            moderation_backoff_cap,
            moderation_backoff_jitter,
            confidence_threshold,
            worker_concurrency,
            supervisor_concurrency,
            domains,
            batch_limit,
            run_interval,
            otel_exporter_endpoint,
            otel_sampling_ratio,
        })
    }

    #[must_use]
    pub fn http_bind(&self) -> SocketAddr {
        self.http_bind
    }

    #[must_use]
    pub fn db_dsn(&self) -> &str {
        &self.db_dsn
    }

    #[must_use]
    pub fn db_max_connections(&self) -> u32 {
        self.db_max_connections
    }

    #[must_use]
    pub fn db_min_connections(&self) -> u32 {
        self.db_min_connections
    }

    #[must_use]
    pub fn db_acquire_timeout(&self) -> Duration {
        self.db_acquire_timeout
    }

    #[must_use]
    pub fn db_idle_timeout(&self) -> Duration {
        self.db_idle_timeout
    }

    #[must_use]
    pub fn db_max_lifetime(&self) -> Duration {
        self.db_max_lifetime
    }

    #[must_use]
    pub fn moderation_endpoint(&self) -> &str {
        &self.moderation_endpoint
    }

    #[must_use]
    pub fn moderation_timeout(&self) -> Duration {
        self.moderation_timeout
    }

    #[must_use]
    pub fn confidence_threshold(&self) -> f64 {
        self.confidence_threshold
    }

    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.moderation_max_attempts.get(),
            self.moderation_backoff_base,
            self.moderation_backoff_cap,
        )
        .with_jitter(self.moderation_backoff_jitter)
    }

    /// 分類クライアント用の設定。トークンはここでのみ受け渡される。
    #[must_use]
    pub fn moderation_config(&self) -> ModerationConfig {
        ModerationConfig {
            endpoint: self.moderation_endpoint.clone(),
            token: self.moderation_token.clone(),
            timeout: self.moderation_timeout,
            threshold: self.confidence_threshold,
            retry: self.retry_policy(),
        }
    }

    #[must_use]
    pub fn worker_concurrency(&self) -> NonZeroUsize {
        self.worker_concurrency
    }

    #[must_use]
    pub fn supervisor_concurrency(&self) -> NonZeroUsize {
        self.supervisor_concurrency
    }

    #[must_use]
    pub fn domains(&self) -> &[Domain] {
        &self.domains
    }

    #[must_use]
    pub fn batch_limit(&self) -> Option<i64> {
        self.batch_limit
    }

    #[must_use]
    pub fn run_interval(&self) -> Duration {
        self.run_interval
    }

    #[must_use]
    pub fn otel_exporter_endpoint(&self) -> Option<&str> {
        self.otel_exporter_endpoint.as_deref()
    }

    #[must_use]
    pub fn otel_sampling_ratio(&self) -> f64 {
        self.otel_sampling_ratio
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("http_bind", &self.http_bind)
            .field("db_dsn", &"<redacted>")
            .field("moderation_token", &"<redacted>")
            .field("moderation_endpoint", &self.moderation_endpoint)
            .field("moderation_timeout", &self.moderation_timeout)
            .field("confidence_threshold", &self.confidence_threshold)
            .field("worker_concurrency", &self.worker_concurrency)
            .field("supervisor_concurrency", &self.supervisor_concurrency)
            .field("domains", &self.domains)
            .field("batch_limit", &self.batch_limit)
            .field("run_interval", &self.run_interval)
            .finish_non_exhaustive()
    }
}

fn required_var(name: &'static str) -> Result<String, ConfigError> {
    match env::var(name) {
        Ok(value) if !value.trim().is_empty() => Ok(value),
        _ => Err(ConfigError::Missing(name)),
    }
}

fn invalid(name: &'static str, error: impl Into<anyhow::Error>) -> ConfigError {
    ConfigError::Invalid {
        name,
        source: error.into(),
    }
}

fn parse_socket_addr(name: &'static str, default: &str) -> Result<SocketAddr, ConfigError> {
    let raw = env::var(name).unwrap_or_else(|_| default.to_string());
    raw.parse().map_err(|error| invalid(name, error))
}

fn parse_non_zero_usize(name: &'static str, default: usize) -> Result<NonZeroUsize, ConfigError> {
    let raw = env::var(name).unwrap_or_else(|_| default.to_string());
    let parsed = raw.parse::<usize>().map_err(|error| invalid(name, error))?;
    NonZeroUsize::new(parsed).ok_or_else(|| invalid(name, anyhow::anyhow!("must be greater than zero")))
}

fn parse_duration_secs(name: &'static str, default_secs: u64) -> Result<Duration, ConfigError> {
    Ok(Duration::from_secs(parse_u64(name, default_secs)?))
}

fn parse_duration_ms(name: &'static str, default_ms: u64) -> Result<Duration, ConfigError> {
    Ok(Duration::from_millis(parse_u64(name, default_ms)?))
}

fn parse_u32(name: &'static str, default: u32) -> Result<u32, ConfigError> {
    let raw = env::var(name).unwrap_or_else(|_| default.to_string());
    raw.parse::<u32>().map_err(|error| invalid(name, error))
}

fn parse_u64(name: &'static str, default: u64) -> Result<u64, ConfigError> {
    let raw = env::var(name).unwrap_or_else(|_| default.to_string());
    raw.parse::<u64>().map_err(|error| invalid(name, error))
}

fn parse_optional_i64(name: &'static str) -> Result<Option<i64>, ConfigError> {
    let Ok(raw) = env::var(name) else {
        return Ok(None);
    };
    if raw.trim().is_empty() {
        return Ok(None);
    }
    let parsed = raw.trim().parse::<i64>().map_err(|error| invalid(name, error))?;
    if parsed <= 0 {
        return Err(invalid(name, anyhow::anyhow!("must be greater than zero")));
    }
    Ok(Some(parsed))
}

fn parse_probability(name: &'static str, default: f64) -> Result<f64, ConfigError> {
    let raw = env::var(name).unwrap_or_else(|_| default.to_string());
    let parsed = raw.parse::<f64>().map_err(|error| invalid(name, error))?;
    if !(0.0..=1.0).contains(&parsed) {
        return Err(invalid(name, anyhow::anyhow!("value must be between 0 and 1")));
    }
    Ok(parsed)
}

fn parse_bool(name: &'static str, default: bool) -> Result<bool, ConfigError> {
    let raw = env::var(name).unwrap_or_else(|_| default.to_string());
    match raw.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(invalid(name, anyhow::anyhow!("invalid boolean value: {raw}"))),
    }
}

fn parse_domains(name: &'static str, default: &str) -> Result<Vec<Domain>, ConfigError> {
    let raw = env::var(name).unwrap_or_else(|_| default.to_string());
    let mut domains = Vec::new();
    for part in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let domain = part
            .parse::<Domain>()
            .map_err(|error| invalid(name, anyhow::anyhow!(error)))?;
        if !domains.contains(&domain) {
            domains.push(domain);
        }
    }
    if domains.is_empty() {
        return Err(invalid(name, anyhow::anyhow!("at least one domain is required")));
    }
    Ok(domains)
}

#[cfg(test)]
pub(crate) fn set_env(name: &str, value: &str) {
    // SAFETY: callers hold ENV_MUTEX and assign valid UTF-8 values.
    unsafe {
        env::set_var(name, value);
    }
}

#[cfg(test)]
pub(crate) fn remove_env(name: &str) {
    // SAFETY: callers hold ENV_MUTEX and clean up deterministic keys.
    unsafe {
        env::remove_var(name);
    }
}

#[cfg(test)]
pub(crate) fn reset_env() {
    for name in [
        "TOXICITY_DB_DSN",
        "MODERATE_HATESPEECH_API_TOKEN",
        "TOXICITY_WORKER_HTTP_BIND",
        "MODERATION_API_URL",
        "MODERATION_TIMEOUT_MS",
        "MODERATION_MAX_ATTEMPTS",
        "MODERATION_BACKOFF_BASE_MS",
        "MODERATION_BACKOFF_CAP_MS",
        "MODERATION_BACKOFF_JITTER",
        "TOXICITY_CONFIDENCE_THRESHOLD",
        "TOXICITY_WORKER_CONCURRENCY",
        "TOXICITY_SUPERVISOR_CONCURRENCY",
        "TOXICITY_DOMAINS",
        "TOXICITY_BATCH_LIMIT",
        "TOXICITY_RUN_INTERVAL_SECS",
        "TOXICITY_DB_MAX_CONNECTIONS",
        "OTEL_EXPORTER_OTLP_ENDPOINT",
        "OTEL_SAMPLING_RATIO",
    ] {
        remove_env(name);
    }
}
