//! Sync Storage Service
//!
//! A shared key-value endpoint that a client application uses as its sync
//! backend. It stores one opaque JSON document plus a ping marker in
//! PostgreSQL, and answers a write-then-read ping used to check connectivity.
//!
//! ## Request flow
//!
//! ```text
//! request ──▶ RequestIntent::classify ──▶ diagnostic ──▶ env flags (no DB)
//!                      │
//!                      ├──▶ unconfigured ──▶ 503 pg_not_configured
//!                      │
//!                      ├──▶ load / save / ping ──▶ KvStore::ensure_schema
//!                      │                               │
//!                      │                               ▼
//!                      │                         kv_storage table
//!                      │
//!                      └──▶ other methods ──▶ 405
//! ```
//!
//! Database settings come from the platform variables (`POSTGRES_URL`,
//! `POSTGRES_PRISMA_URL`, `POSTGRES_URL_NON_POOLING`, `POSTGRES_HOST`,
//! `DATABASE_URL`), resolved once at startup into a [`DatabaseEnv`]. A
//! connection string that does not parse is logged and every storage request
//! then fails with a 500; `?diag=1` still answers.

pub mod api;
pub mod config;
pub mod error;
pub mod intent;
pub mod store;

pub use api::{create_router, start_api_server, AppState, Diagnostics};
pub use config::{Config, DatabaseEnv, EnvError, EnvPresence};
pub use error::ApiError;
pub use intent::RequestIntent;
pub use store::{
    open_store, KvStore, MisconfiguredStore, PgKvStore, StorageKey, StorageRecord, StoreError,
};
