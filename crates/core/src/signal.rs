use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::validation::{present, FieldError, ValidationError};

/// Tag used by callees to accept a call; consuming one moves the caller to `connected`.
pub const SIGNAL_ANSWER: &str = "answer";
pub const SIGNAL_OFFER: &str = "offer";
pub const SIGNAL_CANDIDATE: &str = "candidate";
pub const SIGNAL_HANGUP: &str = "hangup";
pub const SIGNAL_DECLINE: &str = "decline";

/// A negotiation payload waiting in the recipient's mailbox.
///
/// `signal` and `kind` are opaque to the mailbox; only the call tracker gives
/// meaning to a handful of well-known `kind` tags.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalMessage {
    pub from: String,
    pub to: String,
    pub signal: Value,
    #[serde(rename = "type")]
    pub kind: String,
    pub timestamp: i64,
}

impl SignalMessage {
    pub fn new(
        from: impl Into<String>,
        to: impl Into<String>,
        kind: impl Into<String>,
        signal: Value,
        timestamp: i64,
    ) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            signal,
            kind: kind.into(),
            timestamp,
        }
    }

    pub fn is_kind(&self, kind: &str) -> bool {
        self.kind == kind
    }
}

/// Body of `POST /signal`. Every field is optional on the wire so that a
/// missing one surfaces as a validation error instead of a decode failure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SendSignalRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signal: Option<Value>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
}

impl SendSignalRequest {
    pub fn new(from: &str, to: &str, kind: &str, signal: Value) -> Self {
        Self {
            from: Some(from.to_owned()),
            to: Some(to.to_owned()),
            signal: Some(signal),
            kind: Some(kind.to_owned()),
        }
    }

    /// Validates the request and stamps it into a storable message.
    pub fn into_message(self, timestamp: i64) -> Result<SignalMessage, ValidationError> {
        let mut errors = Vec::new();
        if present(&self.from).is_none() {
            errors.push(FieldError::missing("from"));
        }
        if present(&self.to).is_none() {
            errors.push(FieldError::missing("to"));
        }
        if !signal_present(self.signal.as_ref()) {
            errors.push(FieldError::missing("signal"));
        }
        if present(&self.kind).is_none() {
            errors.push(FieldError::missing("type"));
        }
        ValidationError::check(errors)?;

        match (self.from, self.to, self.signal, self.kind) {
            (Some(from), Some(to), Some(signal), Some(kind)) => Ok(SignalMessage {
                from,
                to,
                signal,
                kind,
                timestamp,
            }),
            _ => Err(ValidationError::single(FieldError::missing("signal"))),
        }
    }
}

fn signal_present(signal: Option<&Value>) -> bool {
    match signal {
        None | Some(Value::Null) => false,
        Some(Value::String(raw)) => !raw.trim().is_empty(),
        Some(_) => true,
    }
}
