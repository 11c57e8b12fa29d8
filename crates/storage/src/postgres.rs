use async_trait::async_trait;
use serde_json::Value;

use crate::{
    kv::{into_list, KeyValueStore, StoreError},
    StoragePool,
};

/// `kv_entries`-backed store. Every operation is one statement, so `append`
/// and `drain` inherit row-level atomicity from Postgres.
#[derive(Clone)]
pub struct PostgresKeyValueStore {
    pool: StoragePool,
}

impl PostgresKeyValueStore {
    pub fn new(pool: StoragePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl KeyValueStore for PostgresKeyValueStore {
    async fn get(&self, key: &str) -> Result<Option<Value>, StoreError> {
        let value = sqlx::query_scalar::<_, Value>(
            r#"
            SELECT value
            FROM kv_entries
            WHERE key = $1
            "#,
        )
        .bind(key)
        .fetch_optional(self.pool.pool())
        .await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: Value) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO kv_entries (key, value)
            VALUES ($1, $2)
            ON CONFLICT (key) DO UPDATE
            SET value = EXCLUDED.value,
                updated_at = now()
            "#,
        )
        .bind(key)
        .bind(value)
        .execute(self.pool.pool())
        .await?;
        Ok(())
    }

    async fn append(&self, key: &str, value: Value) -> Result<usize, StoreError> {
        let length = sqlx::query_scalar::<_, i32>(
            r#"
            INSERT INTO kv_entries (key, value)
            VALUES ($1, jsonb_build_array($2::jsonb))
            ON CONFLICT (key) DO UPDATE
            SET value = kv_entries.value || EXCLUDED.value,
                updated_at = now()
            WHERE jsonb_typeof(kv_entries.value) = 'array'
            RETURNING jsonb_array_length(value)
            "#,
        )
        .bind(key)
        .bind(value)
        .fetch_optional(self.pool.pool())
        .await?;

        match length {
            Some(length) => Ok(length.max(0) as usize),
            None => Err(StoreError::NotAList {
                key: key.to_owned(),
            }),
        }
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            DELETE FROM kv_entries
            WHERE key = $1
            "#,
        )
        .bind(key)
        .execute(self.pool.pool())
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn drain(&self, key: &str) -> Result<Vec<Value>, StoreError> {
        let drained = sqlx::query_scalar::<_, Value>(
            r#"
            DELETE FROM kv_entries
            WHERE key = $1 AND jsonb_typeof(value) = 'array'
            RETURNING value
            "#,
        )
        .bind(key)
        .fetch_optional(self.pool.pool())
        .await?;

        match drained {
            Some(value) => into_list(key, value),
            None => {
                if self.get(key).await?.is_some() {
                    Err(StoreError::NotAList {
                        key: key.to_owned(),
                    })
                } else {
                    Ok(Vec::new())
                }
            }
        }
    }
}
