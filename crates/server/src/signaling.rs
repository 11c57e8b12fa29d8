use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use fusion_core::{now_millis, FieldError, SendSignalRequest, SignalMessage, ValidationError};
use fusion_storage::{KeyValueStore, StoreError};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{error::ApiError, AppState};

const MAILBOX_KEY_PREFIX: &str = "signals:";

#[derive(Debug, Error)]
pub enum MailboxError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("failed to encode signal: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("storage error: {0}")]
    Storage(#[from] StoreError),
}

impl From<MailboxError> for ApiError {
    fn from(err: MailboxError) -> Self {
        match err {
            MailboxError::Validation(err) => ApiError::Validation(err),
            other => ApiError::Internal(other.into()),
        }
    }
}

/// Per-recipient FIFO of signaling payloads, drained on read.
#[derive(Clone)]
pub struct SignalMailbox {
    store: Arc<dyn KeyValueStore>,
    warn_depth: usize,
}

impl SignalMailbox {
    pub fn new(store: Arc<dyn KeyValueStore>, warn_depth: usize) -> Self {
        Self { store, warn_depth }
    }

    /// Validates a wire request, stamps it with the current time and queues it
    /// for `to`. Nothing is written when validation fails.
    pub async fn send(&self, request: SendSignalRequest) -> Result<SignalMessage, MailboxError> {
        let message = request.into_message(now_millis())?;
        self.save_signal(&message.to, &message).await?;
        Ok(message)
    }

    /// Appends `message` to `recipient`'s mailbox and returns the pending depth.
    pub async fn save_signal(
        &self,
        recipient: &str,
        message: &SignalMessage,
    ) -> Result<usize, MailboxError> {
        let value = serde_json::to_value(message)?;
        let depth = self.store.append(&mailbox_key(recipient), value).await?;

        tracing::debug!(
            recipient,
            from = %message.from,
            kind = %message.kind,
            depth,
            "queued signal"
        );
        if depth >= self.warn_depth && depth % self.warn_depth == 0 {
            tracing::warn!(recipient, depth, "mailbox is growing without being read");
        }
        Ok(depth)
    }

    /// Current contents in insertion order; does not consume them.
    pub async fn get_signals(&self, recipient: &str) -> Result<Vec<SignalMessage>, MailboxError> {
        let stored = self.store.get(&mailbox_key(recipient)).await?;
        let values = match stored {
            Some(serde_json::Value::Array(values)) => values,
            Some(_) => {
                return Err(StoreError::NotAList {
                    key: mailbox_key(recipient),
                }
                .into())
            }
            None => Vec::new(),
        };
        Ok(decode_signals(recipient, values))
    }

    pub async fn clear_signals(&self, recipient: &str) -> Result<(), MailboxError> {
        self.store.delete(&mailbox_key(recipient)).await?;
        Ok(())
    }

    /// Atomic read-and-clear: concurrent callers never receive the same message.
    pub async fn drain_signals(&self, recipient: &str) -> Result<Vec<SignalMessage>, MailboxError> {
        let values = self.store.drain(&mailbox_key(recipient)).await?;
        let signals = decode_signals(recipient, values);
        if !signals.is_empty() {
            tracing::debug!(recipient, count = signals.len(), "delivered signals");
        }
        Ok(signals)
    }
}

fn mailbox_key(recipient: &str) -> String {
    format!("{MAILBOX_KEY_PREFIX}{recipient}")
}

fn decode_signals(recipient: &str, values: Vec<serde_json::Value>) -> Vec<SignalMessage> {
    values
        .into_iter()
        .filter_map(|value| match serde_json::from_value(value) {
            Ok(signal) => Some(signal),
            Err(err) => {
                tracing::warn!(recipient, ?err, "dropping undecodable mailbox entry");
                None
            }
        })
        .collect()
}

#[derive(Debug, Deserialize)]
pub struct UsernameQuery {
    pub username: Option<String>,
}

impl UsernameQuery {
    pub(crate) fn username(&self) -> Result<&str, ValidationError> {
        self.username
            .as_deref()
            .filter(|value| !value.trim().is_empty())
            .ok_or_else(|| ValidationError::single(FieldError::missing("username")))
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SendSignalResponse {
    pub success: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SignalsResponse {
    pub signals: Vec<SignalMessage>,
}

pub async fn post_signal(
    State(state): State<AppState>,
    payload: Result<Json<SendSignalRequest>, JsonRejection>,
) -> Response {
    const ROUTE: &str = "signal.send";

    let Json(payload) = match payload {
        Ok(payload) => payload,
        Err(rejection) => {
            state.record_signal("rejected", 1);
            return ApiError::from(rejection).respond(&state, ROUTE);
        }
    };

    match state.mailbox().send(payload).await {
        Ok(_) => {
            state.record_signal("enqueued", 1);
            state.record_http_request(ROUTE, StatusCode::OK.as_u16());
            (StatusCode::OK, Json(SendSignalResponse { success: true })).into_response()
        }
        Err(err) => {
            if matches!(err, MailboxError::Validation(_)) {
                state.record_signal("rejected", 1);
            }
            ApiError::from(err).respond(&state, ROUTE)
        }
    }
}

pub async fn get_signals(
    State(state): State<AppState>,
    Query(query): Query<UsernameQuery>,
) -> Response {
    const ROUTE: &str = "signal.fetch";

    let username = match query.username() {
        Ok(username) => username,
        Err(err) => return ApiError::from(err).respond(&state, ROUTE),
    };

    match state.mailbox().drain_signals(username).await {
        Ok(signals) => {
            state.record_signal("delivered", signals.len() as u64);
            state.record_http_request(ROUTE, StatusCode::OK.as_u16());
            (StatusCode::OK, Json(SignalsResponse { signals })).into_response()
        }
        Err(err) => ApiError::from(err).respond(&state, ROUTE),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fusion_storage::InMemoryKeyValueStore;
    use serde_json::json;
    use std::collections::HashSet;

    fn mailbox() -> SignalMailbox {
        SignalMailbox::new(Arc::new(InMemoryKeyValueStore::new()), 256)
    }

    fn message(from: &str, to: &str, signal: &str) -> SignalMessage {
        SignalMessage::new(from, to, "candidate", json!(signal), now_millis())
    }

    #[tokio::test]
    async fn signals_are_returned_in_arrival_order() {
        let mailbox = mailbox();
        let m1 = message("alice", "bob", "c1");
        let m2 = message("carol", "bob", "c2");
        mailbox.save_signal("bob", &m1).await.unwrap();
        mailbox.save_signal("bob", &m2).await.unwrap();

        assert_eq!(mailbox.get_signals("bob").await.unwrap(), vec![m1, m2]);
    }

    #[tokio::test]
    async fn get_does_not_consume_but_clear_does() {
        let mailbox = mailbox();
        mailbox
            .save_signal("bob", &message("alice", "bob", "c1"))
            .await
            .unwrap();

        assert_eq!(mailbox.get_signals("bob").await.unwrap().len(), 1);
        assert_eq!(mailbox.get_signals("bob").await.unwrap().len(), 1);

        mailbox.clear_signals("bob").await.unwrap();
        assert!(mailbox.get_signals("bob").await.unwrap().is_empty());
        mailbox.clear_signals("bob").await.unwrap();
    }

    #[tokio::test]
    async fn drain_is_destructive_and_idempotent() {
        let mailbox = mailbox();
        mailbox
            .save_signal("bob", &message("alice", "bob", "c1"))
            .await
            .unwrap();

        assert_eq!(mailbox.drain_signals("bob").await.unwrap().len(), 1);
        assert!(mailbox.drain_signals("bob").await.unwrap().is_empty());
        assert!(mailbox.drain_signals("bob").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn mailboxes_are_independent_per_recipient() {
        let mailbox = mailbox();
        mailbox
            .save_signal("bob", &message("alice", "bob", "for-bob"))
            .await
            .unwrap();
        mailbox
            .save_signal("carol", &message("alice", "carol", "for-carol"))
            .await
            .unwrap();

        let bob = mailbox.drain_signals("bob").await.unwrap();
        assert_eq!(bob.len(), 1);
        assert_eq!(bob[0].signal, json!("for-bob"));
        assert_eq!(mailbox.get_signals("carol").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn invalid_send_leaves_every_mailbox_untouched() {
        let store = Arc::new(InMemoryKeyValueStore::new());
        let mailbox = SignalMailbox::new(store.clone(), 256);
        let request = SendSignalRequest {
            from: Some("alice".into()),
            to: Some("bob".into()),
            signal: None,
            kind: Some("offer".into()),
        };

        let err = mailbox.send(request).await.unwrap_err();
        assert!(matches!(err, MailboxError::Validation(_)));
        assert_eq!(store.key_count().await, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_drains_never_duplicate() {
        let mailbox = mailbox();
        for i in 0..100 {
            mailbox
                .save_signal("bob", &message("alice", "bob", &format!("c{i}")))
                .await
                .unwrap();
        }

        let handles: Vec<_> = (0..6)
            .map(|_| {
                let mailbox = mailbox.clone();
                tokio::spawn(async move { mailbox.drain_signals("bob").await })
            })
            .collect();

        let mut delivered = HashSet::new();
        let mut count = 0;
        for handle in handles {
            for signal in handle.await.unwrap().unwrap() {
                count += 1;
                delivered.insert(signal.signal.as_str().unwrap().to_string());
            }
        }
        assert_eq!(count, 100);
        assert_eq!(delivered.len(), 100);
    }

    #[test]
    fn query_requires_username() {
        assert!(UsernameQuery { username: None }.username().is_err());
        assert!(UsernameQuery {
            username: Some("  ".into())
        }
        .username()
        .is_err());
        assert_eq!(
            UsernameQuery {
                username: Some("bob".into())
            }
            .username()
            .unwrap(),
            "bob"
        );
    }
}
