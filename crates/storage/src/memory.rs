use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;

use crate::kv::{into_list, KeyValueStore, StoreError};

/// Process-local store used when no database is configured and in tests.
#[derive(Default)]
pub struct InMemoryKeyValueStore {
    entries: RwLock<HashMap<String, Value>>,
}

impl InMemoryKeyValueStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn key_count(&self) -> usize {
        self.entries.read().await.len()
    }
}

#[async_trait]
impl KeyValueStore for InMemoryKeyValueStore {
    async fn get(&self, key: &str) -> Result<Option<Value>, StoreError> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: Value) -> Result<(), StoreError> {
        self.entries.write().await.insert(key.to_owned(), value);
        Ok(())
    }

    async fn append(&self, key: &str, value: Value) -> Result<usize, StoreError> {
        let mut entries = self.entries.write().await;
        let entry = entries
            .entry(key.to_owned())
            .or_insert_with(|| Value::Array(Vec::new()));
        match entry {
            Value::Array(items) => {
                items.push(value);
                Ok(items.len())
            }
            _ => Err(StoreError::NotAList {
                key: key.to_owned(),
            }),
        }
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.entries.write().await.remove(key).is_some())
    }

    async fn drain(&self, key: &str) -> Result<Vec<Value>, StoreError> {
        let mut entries = self.entries.write().await;
        match entries.get(key) {
            None => Ok(Vec::new()),
            Some(Value::Array(_)) => match entries.remove(key) {
                Some(value) => into_list(key, value),
                None => Ok(Vec::new()),
            },
            Some(_) => Err(StoreError::NotAList {
                key: key.to_owned(),
            }),
        }
    }
}
