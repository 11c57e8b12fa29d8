use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use fusion_core::{now_millis, CallHistory, RecordCallRequest, ValidationError};
use fusion_storage::{KeyValueStore, StoreError};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{error::ApiError, signaling::UsernameQuery, AppState};

const HISTORY_KEY: &str = "calls";

#[derive(Debug, Error)]
pub enum CallHistoryError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("failed to encode call record: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("storage error: {0}")]
    Storage(#[from] StoreError),
}

impl From<CallHistoryError> for ApiError {
    fn from(err: CallHistoryError) -> Self {
        match err {
            CallHistoryError::Validation(err) => ApiError::Validation(err),
            other => ApiError::Internal(other.into()),
        }
    }
}

/// Completed-call log. All records share one list so a record is written
/// exactly once and both participants read it back.
#[derive(Clone)]
pub struct CallHistoryService {
    store: Arc<dyn KeyValueStore>,
}

impl CallHistoryService {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    pub async fn record(&self, request: RecordCallRequest) -> Result<CallHistory, CallHistoryError> {
        let call = request.into_history(now_millis())?;
        self.store
            .append(HISTORY_KEY, serde_json::to_value(&call)?)
            .await?;
        tracing::debug!(
            call_id = %call.id,
            caller = %call.caller,
            recipient = %call.recipient,
            status = call.status.as_str(),
            "recorded call"
        );
        Ok(call)
    }

    /// Calls `username` took part in, newest first.
    pub async fn history_for(&self, username: &str) -> Result<Vec<CallHistory>, CallHistoryError> {
        let values = match self.store.get(HISTORY_KEY).await? {
            Some(serde_json::Value::Array(values)) => values,
            Some(_) => {
                return Err(StoreError::NotAList {
                    key: HISTORY_KEY.to_owned(),
                }
                .into())
            }
            None => Vec::new(),
        };

        let mut calls: Vec<CallHistory> = values
            .into_iter()
            .filter_map(|value| serde_json::from_value::<CallHistory>(value).ok())
            .filter(|call| call.caller == username || call.recipient == username)
            .collect();
        calls.reverse();
        Ok(calls)
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CallsResponse {
    pub calls: Vec<CallHistory>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RecordCallResponse {
    pub call: CallHistory,
}

pub async fn list_calls(
    State(state): State<AppState>,
    Query(query): Query<UsernameQuery>,
) -> Response {
    const ROUTE: &str = "calls.list";

    let username = match query.username() {
        Ok(username) => username,
        Err(err) => return ApiError::from(err).respond(&state, ROUTE),
    };

    match state.call_history().history_for(username).await {
        Ok(calls) => {
            state.record_http_request(ROUTE, StatusCode::OK.as_u16());
            (StatusCode::OK, Json(CallsResponse { calls })).into_response()
        }
        Err(err) => ApiError::from(err).respond(&state, ROUTE),
    }
}

pub async fn record_call(
    State(state): State<AppState>,
    payload: Result<Json<RecordCallRequest>, JsonRejection>,
) -> Response {
    const ROUTE: &str = "calls.record";

    let Json(payload) = match payload {
        Ok(payload) => payload,
        Err(rejection) => return ApiError::from(rejection).respond(&state, ROUTE),
    };

    match state.call_history().record(payload).await {
        Ok(call) => {
            state.record_http_request(ROUTE, StatusCode::OK.as_u16());
            (StatusCode::OK, Json(RecordCallResponse { call })).into_response()
        }
        Err(err) => ApiError::from(err).respond(&state, ROUTE),
    }
}
