use std::time::Duration;

use fusion_core::{CallData, CallHistory, RecordCallRequest, SendSignalRequest, SignalMessage};
use reqwest::{Client, Response};
use serde::{de::DeserializeOwned, Deserialize};
use serde_json::Value;
use thiserror::Error;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("server answered {status}: {body}")]
    Status { status: u16, body: String },
}

#[derive(Deserialize)]
struct SendSignalResponse {
    success: bool,
}

#[derive(Deserialize)]
struct SignalsResponse {
    signals: Vec<SignalMessage>,
}

#[derive(Deserialize)]
struct CallsResponse {
    calls: Vec<CallHistory>,
}

#[derive(Deserialize)]
struct RecordCallResponse {
    call: CallHistory,
}

/// Talks to the signaling gateway's `/signal` and `/calls` endpoints.
#[derive(Clone)]
pub struct SignalingClient {
    http: Client,
    base_url: String,
}

impl SignalingClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self, ClientError> {
        let http = Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self::with_client(http, base_url))
    }

    pub fn with_client(http: Client, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_owned();
        Self { http, base_url }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Queues `signal` in `to`'s mailbox.
    pub async fn send_signal(
        &self,
        from: &str,
        to: &str,
        kind: &str,
        signal: Value,
    ) -> Result<(), ClientError> {
        let body = SendSignalRequest::new(from, to, kind, signal);
        let response = self.http.post(self.url("/signal")).json(&body).send().await?;
        let ack: SendSignalResponse = decode(response).await?;
        if !ack.success {
            return Err(ClientError::Status {
                status: 200,
                body: "server did not accept the signal".into(),
            });
        }
        tracing::debug!(to, kind, "sent signal");
        Ok(())
    }

    /// Drains `username`'s mailbox. The returned signals are gone from the
    /// server, so the caller owns them from here on.
    pub async fn fetch_signals(&self, username: &str) -> Result<Vec<SignalMessage>, ClientError> {
        let response = self
            .http
            .get(self.url("/signal"))
            .query(&[("username", username)])
            .send()
            .await?;
        let SignalsResponse { signals } = decode(response).await?;
        Ok(signals)
    }

    pub async fn record_call(&self, request: &RecordCallRequest) -> Result<CallHistory, ClientError> {
        let response = self.http.post(self.url("/calls")).json(request).send().await?;
        let RecordCallResponse { call } = decode(response).await?;
        Ok(call)
    }

    /// Files the history entry for a finished call. Live calls are skipped.
    pub async fn record_finished_call(
        &self,
        call: &CallData,
    ) -> Result<Option<CallHistory>, ClientError> {
        match call.to_history() {
            Some(request) => self.record_call(&request).await.map(Some),
            None => Ok(None),
        }
    }

    pub async fn call_history(&self, username: &str) -> Result<Vec<CallHistory>, ClientError> {
        let response = self
            .http
            .get(self.url("/calls"))
            .query(&[("username", username)])
            .send()
            .await?;
        let CallsResponse { calls } = decode(response).await?;
        Ok(calls)
    }
}

async fn decode<T: DeserializeOwned>(response: Response) -> Result<T, ClientError> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(ClientError::Status {
            status: status.as_u16(),
            body,
        });
    }
    Ok(response.json().await?)
}
