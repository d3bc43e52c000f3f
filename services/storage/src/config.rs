use serde::{Deserialize, Serialize};
use sqlx::postgres::PgConnectOptions;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Main configuration for the storage service
///
/// Database credentials are not part of it; see [`DatabaseEnv`].
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Service configuration
    #[serde(default)]
    pub service: ServiceConfig,
    /// HTTP API configuration
    #[serde(default)]
    pub api: ApiConfig,
    /// Connection pool configuration
    #[serde(default)]
    pub database: DatabaseConfig,
}

/// Service-level configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Service name for logging/metrics
    #[serde(default = "default_service_name")]
    pub name: String,
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Install the Prometheus exporter
    #[serde(default = "default_true")]
    pub metrics_enabled: bool,
    /// Metrics port
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
}

/// HTTP API configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    /// API listen address
    #[serde(default = "default_api_host")]
    pub host: String,
    /// API listen port
    #[serde(default = "default_api_port")]
    pub port: u16,
    /// Route of the storage endpoint
    #[serde(default = "default_api_path")]
    pub path: String,
    /// Enable CORS
    #[serde(default = "default_true")]
    pub cors_enabled: bool,
    /// Allowed CORS origins
    #[serde(default)]
    pub cors_origins: Vec<String>,
    /// Upper bound on a request body
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

/// Connection pool configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Maximum number of connections in the pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Minimum number of connections in the pool
    #[serde(default)]
    pub min_connections: u32,
    /// Connection acquire timeout in seconds
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Idle connection timeout in seconds
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
}

// Default value functions
fn default_service_name() -> String {
    "sync-storage".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_true() -> bool {
    true
}

fn default_api_host() -> String {
    "0.0.0.0".to_string()
}

fn default_api_port() -> u16 {
    8080
}

fn default_api_path() -> String {
    "/api/storage".to_string()
}

fn default_max_body_bytes() -> usize {
    4 * 1024 * 1024 // 4MB
}

fn default_max_connections() -> u32 {
    10
}

fn default_connect_timeout_secs() -> u64 {
    30
}

fn default_idle_timeout_secs() -> u64 {
    600
}

impl Config {
    /// Load configuration from environment and config files
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            .set_default("service.name", "sync-storage")?
            .set_default("service.log_level", "info")?
            .add_source(config::File::with_name("config/storage").required(false))
            .add_source(config::File::with_name("/etc/sync-storage/storage").required(false))
            // STORAGE__API__PORT -> api.port
            .add_source(
                config::Environment::with_prefix("STORAGE")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize().map_err(Into::into)
    }
}

impl DatabaseConfig {
    /// Get pool acquire timeout as Duration
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Get idle connection timeout as Duration
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            log_level: default_log_level(),
            metrics_enabled: default_true(),
            metrics_port: default_metrics_port(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_api_host(),
            port: default_api_port(),
            path: default_api_path(),
            cors_enabled: default_true(),
            cors_origins: Vec::new(),
            max_body_bytes: default_max_body_bytes(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            min_connections: 0,
            connect_timeout_secs: default_connect_timeout_secs(),
            idle_timeout_secs: default_idle_timeout_secs(),
        }
    }
}

pub const POSTGRES_URL: &str = "POSTGRES_URL";
pub const POSTGRES_PRISMA_URL: &str = "POSTGRES_PRISMA_URL";
pub const POSTGRES_URL_NON_POOLING: &str = "POSTGRES_URL_NON_POOLING";
pub const POSTGRES_HOST: &str = "POSTGRES_HOST";
pub const DATABASE_URL: &str = "DATABASE_URL";

/// Variables whose presence means a database is configured
pub const RECOGNIZED_VARS: [&str; 5] = [
    POSTGRES_URL,
    POSTGRES_PRISMA_URL,
    POSTGRES_URL_NON_POOLING,
    POSTGRES_HOST,
    DATABASE_URL,
];

const POSTGRES_USER: &str = "POSTGRES_USER";
const POSTGRES_PASSWORD: &str = "POSTGRES_PASSWORD";
const POSTGRES_DATABASE: &str = "POSTGRES_DATABASE";

/// Errors raised while turning the resolved environment into connect options
#[derive(Error, Debug)]
pub enum EnvError {
    #[error("Invalid connection string in {var}: {source}")]
    InvalidUrl {
        var: &'static str,
        #[source]
        source: sqlx::Error,
    },
}

/// Which recognized variables are set, as reported by the diagnostic path
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct EnvPresence {
    #[serde(rename = "POSTGRES_URL")]
    pub postgres_url: bool,
    #[serde(rename = "POSTGRES_PRISMA_URL")]
    pub postgres_prisma_url: bool,
    #[serde(rename = "POSTGRES_URL_NON_POOLING")]
    pub postgres_url_non_pooling: bool,
    #[serde(rename = "POSTGRES_HOST")]
    pub postgres_host: bool,
    #[serde(rename = "DATABASE_URL")]
    pub database_url: bool,
}

/// Database connection settings resolved once from the process environment.
///
/// When `POSTGRES_URL` is unset, `DATABASE_URL` takes its slot. The process
/// environment itself is never modified.
#[derive(Clone, Default)]
pub struct DatabaseEnv {
    primary_url: Option<String>,
    primary_from_fallback: bool,
    prisma_url: Option<String>,
    non_pooling_url: Option<String>,
    host: Option<String>,
    fallback_url: Option<String>,
    user: Option<String>,
    password: Option<String>,
    database: Option<String>,
}

impl DatabaseEnv {
    /// Resolve from the real process environment
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Resolve through an arbitrary variable lookup. Empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).filter(|value| !value.is_empty());

        let fallback_url = get(DATABASE_URL);
        let (primary_url, primary_from_fallback) = match get(POSTGRES_URL) {
            Some(url) => (Some(url), false),
            None => (fallback_url.clone(), fallback_url.is_some()),
        };

        Self {
            primary_url,
            primary_from_fallback,
            prisma_url: get(POSTGRES_PRISMA_URL),
            non_pooling_url: get(POSTGRES_URL_NON_POOLING),
            host: get(POSTGRES_HOST),
            fallback_url,
            user: get(POSTGRES_USER),
            password: get(POSTGRES_PASSWORD),
            database: get(POSTGRES_DATABASE),
        }
    }

    /// True iff at least one recognized variable is set
    pub fn has_database_config(&self) -> bool {
        let presence = self.presence();
        presence.postgres_url
            || presence.postgres_prisma_url
            || presence.postgres_url_non_pooling
            || presence.postgres_host
            || presence.database_url
    }

    /// The primary connection URL, including a value carried over from `DATABASE_URL`
    pub fn primary_url(&self) -> Option<&str> {
        self.primary_url.as_deref()
    }

    /// Whether the primary slot was filled from `DATABASE_URL`
    pub fn primary_from_fallback(&self) -> bool {
        self.primary_from_fallback
    }

    pub fn presence(&self) -> EnvPresence {
        EnvPresence {
            postgres_url: self.primary_url.is_some(),
            postgres_prisma_url: self.prisma_url.is_some(),
            postgres_url_non_pooling: self.non_pooling_url.is_some(),
            postgres_host: self.host.is_some(),
            database_url: self.fallback_url.is_some(),
        }
    }

    /// Name of the variable the connection will be made from
    pub fn connection_source(&self) -> Option<&'static str> {
        if self.primary_url.is_some() {
            Some(if self.primary_from_fallback {
                DATABASE_URL
            } else {
                POSTGRES_URL
            })
        } else if self.prisma_url.is_some() {
            Some(POSTGRES_PRISMA_URL)
        } else if self.non_pooling_url.is_some() {
            Some(POSTGRES_URL_NON_POOLING)
        } else if self.host.is_some() {
            Some(POSTGRES_HOST)
        } else {
            None
        }
    }

    /// Build connect options from the first usable source.
    ///
    /// URLs are preferred in the order primary, Prisma, non-pooling; failing
    /// those, a host plus the optional user/password/database variables.
    pub fn connect_options(&self) -> Result<Option<PgConnectOptions>, EnvError> {
        let urls = [
            (self.primary_url.as_deref(), self.connection_source().unwrap_or(POSTGRES_URL)),
            (self.prisma_url.as_deref(), POSTGRES_PRISMA_URL),
            (self.non_pooling_url.as_deref(), POSTGRES_URL_NON_POOLING),
        ];

        for (url, var) in urls {
            if let Some(url) = url {
                let options = PgConnectOptions::from_str(url)
                    .map_err(|source| EnvError::InvalidUrl { var, source })?;
                return Ok(Some(options));
            }
        }

        let Some(host) = self.host.as_deref() else {
            return Ok(None);
        };

        let mut options = PgConnectOptions::new().host(host);
        if let Some(user) = self.user.as_deref() {
            options = options.username(user);
        }
        if let Some(password) = self.password.as_deref() {
            options = options.password(password);
        }
        if let Some(database) = self.database.as_deref() {
            options = options.database(database);
        }

        Ok(Some(options))
    }
}

// Connection strings carry credentials, so only presence is printed.
impl fmt::Debug for DatabaseEnv {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseEnv")
            .field("presence", &self.presence())
            .field("primary_from_fallback", &self.primary_from_fallback)
            .finish()
    }
}
