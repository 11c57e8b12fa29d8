use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("value under '{key}' is not a list")]
    NotAList { key: String },
    #[error("storage backend error: {0}")]
    Backend(#[from] anyhow::Error),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        StoreError::Backend(err.into())
    }
}

/// Keyed persistence contract shared by every component that stores state.
///
/// List-valued keys are plain JSON arrays. `append` and `drain` must each be a
/// single critical section: concurrent drains of one key never observe the
/// same element twice, and a failed drain leaves the key untouched.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Value>, StoreError>;

    async fn set(&self, key: &str, value: Value) -> Result<(), StoreError>;

    /// Pushes `value` onto the list under `key`, creating it when absent.
    /// Returns the list length after the push.
    async fn append(&self, key: &str, value: Value) -> Result<usize, StoreError>;

    /// Returns whether a value was removed.
    async fn delete(&self, key: &str) -> Result<bool, StoreError>;

    /// Removes the list under `key` and returns its elements in insertion order.
    async fn drain(&self, key: &str) -> Result<Vec<Value>, StoreError>;
}

pub(crate) fn into_list(key: &str, value: Value) -> Result<Vec<Value>, StoreError> {
    match value {
        Value::Array(items) => Ok(items),
        _ => Err(StoreError::NotAList {
            key: key.to_owned(),
        }),
    }
}
