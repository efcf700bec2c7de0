use std::env;
use std::fmt;
use std::net::{IpAddr, SocketAddr};

/// Distinguishes runtime behavior for different stages of the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppEnvironment {
    Development,
    Test,
    Production,
}

impl AppEnvironment {
    fn from_str(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "prod" | "production" => Self::Production,
            "test" | "ci" => Self::Test,
            _ => Self::Development,
        }
    }
}

/// Top-level configuration for the application.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub environment: AppEnvironment,
    pub server: ServerConfig,
    pub telemetry: TelemetryConfig,
    pub engine: EngineConfig,
}

impl AppConfig {
    pub fn load() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let environment = AppEnvironment::from_str(
            &env::var("APP_ENV").unwrap_or_else(|_| "development".to_string()),
        );

        let host = env::var("APP_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
        let port = env::var("APP_PORT")
            .unwrap_or_else(|_| "3000".to_string())
            .parse::<u16>()
            .map_err(|_| ConfigError::InvalidPort)?;

        let log_level = env::var("APP_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        Ok(Self {
            environment,
            server: ServerConfig { host, port },
            telemetry: TelemetryConfig { log_level },
            engine: EngineConfig::load()?,
        })
    }
}

/// Settings controlling the HTTP server binding.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl ServerConfig {
    pub fn socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        if self.host.eq_ignore_ascii_case("localhost") {
            return Ok(SocketAddr::new(IpAddr::from([127, 0, 0, 1]), self.port));
        }

        let ip: IpAddr = self
            .host
            .parse()
            .map_err(|source| ConfigError::InvalidHost { source })?;

        Ok(SocketAddr::new(ip, self.port))
    }
}

/// Tracing and metrics controls.
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    pub log_level: String,
}

/// Tunables for the placement engine itself: the monthly attendance target,
/// staleness handling, and the optimistic-transaction retry budget.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    pub monthly_target_minutes: u64,
    pub stale_session_hours: u64,
    pub sweep_interval_secs: u64,
    pub txn_retry_attempts: u32,
    pub txn_retry_base_ms: u64,
    pub txn_retry_max_ms: u64,
    pub txn_timeout_ms: u64,
    pub verify_timeout_ms: u64,
}

impl EngineConfig {
    pub fn load() -> Result<Self, ConfigError> {
        Ok(Self {
            monthly_target_minutes: positive_u64("WIL_MONTHLY_TARGET_MINUTES", 160 * 60)?,
            stale_session_hours: positive_u64("WIL_STALE_SESSION_HOURS", 16)?,
            sweep_interval_secs: positive_u64("WIL_SWEEP_INTERVAL_SECS", 600)?,
            txn_retry_attempts: positive_u32("WIL_TXN_RETRY_ATTEMPTS", 5)?,
            txn_retry_base_ms: positive_u64("WIL_TXN_RETRY_BASE_MS", 10)?,
            txn_retry_max_ms: positive_u64("WIL_TXN_RETRY_MAX_MS", 250)?,
            txn_timeout_ms: positive_u64("WIL_TXN_TIMEOUT_MS", 2_000)?,
            verify_timeout_ms: positive_u64("WIL_VERIFY_TIMEOUT_MS", 3_000)?,
        })
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            monthly_target_minutes: 160 * 60,
            stale_session_hours: 16,
            sweep_interval_secs: 600,
            txn_retry_attempts: 5,
            txn_retry_base_ms: 10,
            txn_retry_max_ms: 250,
            txn_timeout_ms: 2_000,
            verify_timeout_ms: 3_000,
        }
    }
}

fn positive_u64(key: &'static str, default: u64) -> Result<u64, ConfigError> {
    match env::var(key) {
        Ok(raw) => match raw.trim().parse::<u64>() {
            Ok(value) if value > 0 => Ok(value),
            _ => Err(ConfigError::InvalidEngineSetting { key }),
        },
        Err(_) => Ok(default),
    }
}

fn positive_u32(key: &'static str, default: u32) -> Result<u32, ConfigError> {
    match env::var(key) {
        Ok(raw) => match raw.trim().parse::<u32>() {
            Ok(value) if value > 0 => Ok(value),
            _ => Err(ConfigError::InvalidEngineSetting { key }),
        },
        Err(_) => Ok(default),
    }
}

#[derive(Debug)]
pub enum ConfigError {
    InvalidPort,
    InvalidHost { source: std::net::AddrParseError },
    InvalidEngineSetting { key: &'static str },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::InvalidPort => write!(f, "APP_PORT must be a valid u16"),
            ConfigError::InvalidHost { .. } => {
                write!(f, "APP_HOST must parse to an IPv4 or IPv6 address")
            }
            ConfigError::InvalidEngineSetting { key } => {
                write!(f, "{key} must be a positive integer")
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::InvalidPort => None,
            ConfigError::InvalidHost { source } => Some(source),
            ConfigError::InvalidEngineSetting { .. } => None,
        }
    }
}
