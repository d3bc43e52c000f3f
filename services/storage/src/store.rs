use crate::config::{DatabaseConfig, DatabaseEnv, EnvError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions};
use sqlx::FromRow;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

const CREATE_TABLE_SQL: &str = r#"
    CREATE TABLE IF NOT EXISTS kv_storage (
        key TEXT PRIMARY KEY,
        value JSONB NOT NULL DEFAULT '{}',
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
"#;

const SELECT_SQL: &str = r#"
    SELECT key, value, updated_at
    FROM kv_storage
    WHERE key = $1
"#;

const UPSERT_SQL: &str = r#"
    INSERT INTO kv_storage (key, value, updated_at)
    VALUES ($1, $2, NOW())
    ON CONFLICT (key)
    DO UPDATE SET value = EXCLUDED.value, updated_at = NOW()
"#;

/// The two rows this service ever reads or writes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StorageKey {
    /// The client application's saved state (`STORAGE_KEY`)
    State,
    /// Marker row for the ping round-trip (`PING_KEY`)
    Ping,
}

impl StorageKey {
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageKey::State => "storage",
            StorageKey::Ping => "ping",
        }
    }
}

/// One row of `kv_storage`
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct StorageRecord {
    pub key: String,
    pub value: Value,
    pub updated_at: DateTime<Utc>,
}

/// Errors from the persistence layer
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("{0}")]
    Database(#[from] sqlx::Error),

    #[error("Invalid connection string in {var}: {reason}")]
    InvalidConnectionString { var: &'static str, reason: String },
}

impl StoreError {
    /// Backend error code, the SQLSTATE for errors raised by Postgres itself
    pub fn code(&self) -> Option<String> {
        match self {
            StoreError::Database(sqlx::Error::Database(err)) => err.code().map(|c| c.into_owned()),
            StoreError::Database(_) | StoreError::InvalidConnectionString { .. } => None,
        }
    }

    /// Short category name for the failure
    pub fn name(&self) -> &'static str {
        match self {
            StoreError::Database(err) => match err {
                sqlx::Error::Configuration(_) => "Configuration",
                sqlx::Error::Database(_) => "DatabaseError",
                sqlx::Error::Io(_) => "Io",
                sqlx::Error::Tls(_) => "Tls",
                sqlx::Error::Protocol(_) => "Protocol",
                sqlx::Error::RowNotFound => "RowNotFound",
                sqlx::Error::TypeNotFound { .. } => "TypeNotFound",
                sqlx::Error::ColumnIndexOutOfBounds { .. } => "ColumnIndexOutOfBounds",
                sqlx::Error::ColumnNotFound(_) => "ColumnNotFound",
                sqlx::Error::ColumnDecode { .. } => "ColumnDecode",
                sqlx::Error::Decode(_) => "Decode",
                sqlx::Error::PoolTimedOut => "PoolTimedOut",
                sqlx::Error::PoolClosed => "PoolClosed",
                sqlx::Error::WorkerCrashed => "WorkerCrashed",
                _ => "SqlxError",
            },
            StoreError::InvalidConnectionString { .. } => "InvalidConnectionString",
        }
    }
}

/// Persistence operations behind the storage endpoint.
///
/// Callers run [`KvStore::ensure_schema`] before every read or write; the
/// store keeps no record of having done so.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Create the storage table if it does not exist yet
    async fn ensure_schema(&self) -> Result<(), StoreError>;

    /// Read the row for a key
    async fn load(&self, key: StorageKey) -> Result<Option<StorageRecord>, StoreError>;

    /// Insert the row for a key or replace its value
    async fn upsert(&self, key: StorageKey, value: &Value) -> Result<(), StoreError>;

    /// Round-trip a trivial query
    async fn health_check(&self) -> Result<(), StoreError>;
}

/// [`KvStore`] over a PostgreSQL pool
pub struct PgKvStore {
    pool: PgPool,
}

impl PgKvStore {
    /// Build a lazily connecting pool; nothing is dialed until the first query
    pub fn connect_lazy(options: PgConnectOptions, config: &DatabaseConfig) -> Self {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.acquire_timeout())
            .idle_timeout(Some(config.idle_timeout()))
            .connect_lazy_with(options);

        info!(
            max_connections = config.max_connections,
            "PostgreSQL pool created"
        );

        Self { pool }
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl KvStore for PgKvStore {
    async fn ensure_schema(&self) -> Result<(), StoreError> {
        sqlx::query(CREATE_TABLE_SQL).execute(&self.pool).await?;
        Ok(())
    }

    #[instrument(skip_all, fields(key = key.as_str()))]
    async fn load(&self, key: StorageKey) -> Result<Option<StorageRecord>, StoreError> {
        let record = sqlx::query_as::<_, StorageRecord>(SELECT_SQL)
            .bind(key.as_str())
            .fetch_optional(&self.pool)
            .await?;

        if let Some(record) = &record {
            debug!(updated_at = %record.updated_at, "Record loaded");
        }

        Ok(record)
    }

    #[instrument(skip_all, fields(key = key.as_str()))]
    async fn upsert(&self, key: StorageKey, value: &Value) -> Result<(), StoreError> {
        sqlx::query(UPSERT_SQL)
            .bind(key.as_str())
            .bind(value)
            .execute(&self.pool)
            .await?;

        debug!("Record upserted");
        Ok(())
    }

    async fn health_check(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

/// [`KvStore`] standing in for a database whose connection string does not
/// parse. Every operation fails, so requests get the usual 500 while the
/// diagnostic route keeps answering.
#[derive(Debug, Clone)]
pub struct MisconfiguredStore {
    var: &'static str,
    reason: String,
}

impl MisconfiguredStore {
    pub fn new(var: &'static str, reason: impl Into<String>) -> Self {
        Self {
            var,
            reason: reason.into(),
        }
    }

    fn fail<T>(&self) -> Result<T, StoreError> {
        Err(StoreError::InvalidConnectionString {
            var: self.var,
            reason: self.reason.clone(),
        })
    }
}

#[async_trait]
impl KvStore for MisconfiguredStore {
    async fn ensure_schema(&self) -> Result<(), StoreError> {
        self.fail()
    }

    async fn load(&self, _key: StorageKey) -> Result<Option<StorageRecord>, StoreError> {
        self.fail()
    }

    async fn upsert(&self, _key: StorageKey, _value: &Value) -> Result<(), StoreError> {
        self.fail()
    }

    async fn health_check(&self) -> Result<(), StoreError> {
        self.fail()
    }
}

/// Build the store for the resolved environment.
///
/// Returns `None` when no database variables are set. A connection string
/// that does not parse is logged and yields a [`MisconfiguredStore`]; the
/// service keeps running so `?diag=1` can still be queried.
pub fn open_store(db_env: &DatabaseEnv, config: &DatabaseConfig) -> Option<Arc<dyn KvStore>> {
    match db_env.connect_options() {
        Ok(Some(options)) => {
            info!(
                source = db_env.connection_source().unwrap_or_default(),
                from_fallback = db_env.primary_from_fallback(),
                "Database configuration resolved"
            );
            Some(Arc::new(PgKvStore::connect_lazy(options, config)))
        }
        Ok(None) => {
            warn!("No database variables set; storage requests will answer 503");
            None
        }
        Err(EnvError::InvalidUrl { var, source }) => {
            error!(
                var = var,
                error = %source,
                "Invalid database connection string; storage requests will fail"
            );
            Some(Arc::new(MisconfiguredStore::new(var, source.to_string())))
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::{POSTGRES_HOST, POSTGRES_URL};
    use serde_json::json;
    use std::borrow::Cow;
    use std::error::Error as StdError;
    use std::fmt;

    /// Error shaped like one raised by the Postgres server itself
    #[derive(Debug)]
    struct ServerError {
        code: &'static str,
        message: &'static str,
    }

    impl fmt::Display for ServerError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str(self.message)
        }
    }

    impl StdError for ServerError {}

    impl sqlx::error::DatabaseError for ServerError {
        fn message(&self) -> &str {
            self.message
        }

        fn code(&self) -> Option<Cow<'_, str>> {
            Some(Cow::Borrowed(self.code))
        }

        fn as_error(&self) -> &(dyn StdError + Send + Sync + 'static) {
            self
        }

        fn as_error_mut(&mut self) -> &mut (dyn StdError + Send + Sync + 'static) {
            self
        }

        fn into_error(self: Box<Self>) -> Box<dyn StdError + Send + Sync + 'static> {
            self
        }

        fn kind(&self) -> sqlx::error::ErrorKind {
            sqlx::error::ErrorKind::UniqueViolation
        }
    }

    pub(crate) fn unique_violation() -> StoreError {
        StoreError::from(sqlx::Error::Database(Box::new(ServerError {
            code: "23505",
            message: "duplicate key value violates unique constraint \"kv_storage_pkey\"",
        })))
    }

    fn env_from(vars: &[(&'static str, &'static str)]) -> DatabaseEnv {
        let vars = vars.to_vec();
        DatabaseEnv::from_lookup(move |name| {
            vars.iter()
                .find(|(k, _)| *k == name)
                .map(|(_, v)| v.to_string())
        })
    }

    #[test]
    fn test_storage_keys_are_distinct() {
        assert_eq!(StorageKey::State.as_str(), "storage");
        assert_eq!(StorageKey::Ping.as_str(), "ping");
        assert_ne!(StorageKey::State.as_str(), StorageKey::Ping.as_str());
    }

    #[test]
    fn test_schema_statement_is_idempotent() {
        assert!(CREATE_TABLE_SQL.contains("CREATE TABLE IF NOT EXISTS kv_storage"));
        assert!(CREATE_TABLE_SQL.contains("key TEXT PRIMARY KEY"));
        assert!(CREATE_TABLE_SQL.contains("value JSONB NOT NULL DEFAULT '{}'"));
        assert!(CREATE_TABLE_SQL.contains("updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()"));
    }

    #[test]
    fn test_upsert_replaces_by_key() {
        assert!(UPSERT_SQL.contains("ON CONFLICT (key)"));
        assert!(UPSERT_SQL.contains("updated_at = NOW()"));
    }

    #[test]
    fn test_error_name_and_code() {
        let err = StoreError::from(sqlx::Error::PoolTimedOut);
        assert_eq!(err.name(), "PoolTimedOut");
        assert_eq!(err.code(), None);

        let err = StoreError::from(sqlx::Error::RowNotFound);
        assert_eq!(err.name(), "RowNotFound");
    }

    #[test]
    fn test_server_error_carries_sqlstate() {
        let err = unique_violation();
        assert_eq!(err.name(), "DatabaseError");
        assert_eq!(err.code().as_deref(), Some("23505"));
        assert!(err.to_string().contains("kv_storage_pkey"));
    }

    #[tokio::test]
    async fn test_misconfigured_store_fails_every_operation() {
        let store = MisconfiguredStore::new(POSTGRES_URL, "relative URL without a base");

        let err = store.ensure_schema().await.unwrap_err();
        assert_eq!(err.name(), "InvalidConnectionString");
        assert_eq!(err.code(), None);
        assert_eq!(
            err.to_string(),
            "Invalid connection string in POSTGRES_URL: relative URL without a base"
        );

        assert!(store.load(StorageKey::State).await.is_err());
        assert!(store.upsert(StorageKey::State, &json!({})).await.is_err());
        assert!(store.health_check().await.is_err());
    }

    #[test]
    fn test_open_store_without_variables() {
        let store = open_store(&DatabaseEnv::default(), &DatabaseConfig::default());
        assert!(store.is_none());
    }

    #[tokio::test]
    async fn test_open_store_keeps_running_on_invalid_url() {
        let env = env_from(&[(POSTGRES_URL, "not a url")]);
        let store = open_store(&env, &DatabaseConfig::default()).expect("store for invalid URL");

        let err = store.load(StorageKey::State).await.unwrap_err();
        assert_eq!(err.name(), "InvalidConnectionString");
        assert!(err.to_string().contains(POSTGRES_URL));
    }

    #[tokio::test]
    async fn test_open_store_with_host_is_lazy() {
        let env = env_from(&[(POSTGRES_HOST, "db.invalid")]);
        assert!(open_store(&env, &DatabaseConfig::default()).is_some());
    }

    /// Needs a reachable database: TEST_DATABASE_URL=postgres://... cargo test -- --ignored
    #[tokio::test]
    #[ignore = "requires TEST_DATABASE_URL"]
    async fn test_postgres_round_trip() {
        let url = std::env::var("TEST_DATABASE_URL").expect("TEST_DATABASE_URL not set");
        let pool = PgPool::connect(&url).await.unwrap();
        let store = PgKvStore::from_pool(pool);

        store.ensure_schema().await.unwrap();
        store.ensure_schema().await.unwrap();

        let value = json!({"theme": "dark", "items": [1, 2, 3]});
        store.upsert(StorageKey::State, &value).await.unwrap();
        store.upsert(StorageKey::State, &value).await.unwrap();

        let record = store.load(StorageKey::State).await.unwrap().unwrap();
        assert_eq!(record.key, "storage");
        assert_eq!(record.value, value);

        store.health_check().await.unwrap();
    }
}
