//! Storage helpers: the keyed store contract plus in-memory and Postgres backends.

use std::{sync::Arc, time::Duration};

use anyhow::Result;
use sqlx::{migrate::Migrator, postgres::PgPoolOptions};

pub mod kv;
pub mod memory;
pub mod postgres;

pub use sqlx::PgPool;

pub use kv::{KeyValueStore, StoreError};
pub use memory::InMemoryKeyValueStore;
pub use postgres::PostgresKeyValueStore;

static MIGRATOR: Migrator = sqlx::migrate!("../../migrations");

const MAX_CONNECTIONS: u32 = 5;
const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(5);

/// Cloneable handle to the Postgres pool behind the key-value store.
#[derive(Clone)]
pub struct StoragePool(Arc<PgPool>);

impl StoragePool {
    pub fn new(pool: PgPool) -> Self {
        Self(Arc::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.0
    }
}

/// Opens a small pool against `database_url`. Fails fast when the server is
/// unreachable so the caller can fall back to in-memory storage.
pub async fn connect(database_url: &str) -> Result<StoragePool> {
    let pool = PgPoolOptions::new()
        .max_connections(MAX_CONNECTIONS)
        .acquire_timeout(ACQUIRE_TIMEOUT)
        .connect(database_url)
        .await?;
    tracing::debug!(max_connections = MAX_CONNECTIONS, "postgres pool ready");
    Ok(StoragePool::new(pool))
}

/// Applies every pending migration and returns how many are known.
pub async fn run_migrations(pool: &StoragePool) -> Result<usize> {
    MIGRATOR.run(pool.pool()).await?;
    Ok(MIGRATOR.migrations.len())
}
