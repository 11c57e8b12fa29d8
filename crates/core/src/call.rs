use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::validation::{present, FieldError, ValidationError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallType {
    Voice,
    Video,
}

impl CallType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallType::Voice => "voice",
            CallType::Video => "video",
        }
    }
}

impl FromStr for CallType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "voice" => Ok(CallType::Voice),
            "video" => Ok(CallType::Video),
            other => Err(format!("unsupported call type '{other}'")),
        }
    }
}

impl fmt::Display for CallType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle of a live call as seen by one participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallStatus {
    Calling,
    Connected,
    Ended,
    Declined,
    Missed,
}

impl CallStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallStatus::Calling => "calling",
            CallStatus::Connected => "connected",
            CallStatus::Ended => "ended",
            CallStatus::Declined => "declined",
            CallStatus::Missed => "missed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CallStatus::Ended | CallStatus::Declined | CallStatus::Missed
        )
    }
}

impl fmt::Display for CallStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The locally held record of the active call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallData {
    pub id: String,
    pub caller: String,
    pub recipient: String,
    #[serde(rename = "type")]
    pub kind: CallType,
    pub status: CallStatus,
    pub start_time: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connect_time: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<i64>,
}

impl CallData {
    pub fn new(caller: &str, recipient: &str, kind: CallType, start_time: i64) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            caller: caller.to_owned(),
            recipient: recipient.to_owned(),
            kind,
            status: CallStatus::Calling,
            start_time,
            connect_time: None,
            end_time: None,
        }
    }

    /// The other participant, from `local`'s point of view.
    pub fn peer_of(&self, local: &str) -> &str {
        if self.caller == local {
            &self.recipient
        } else {
            &self.caller
        }
    }

    pub fn involves(&self, user: &str) -> bool {
        self.caller == user || self.recipient == user
    }

    /// Summarises a finished call as a history entry. Returns `None` while the
    /// call is still live.
    pub fn to_history(&self) -> Option<RecordCallRequest> {
        let end_time = self.end_time?;
        let (status, duration) = match (self.status, self.connect_time) {
            (CallStatus::Ended, Some(connected)) => (
                HistoryStatus::Completed,
                ((end_time - connected).max(0) / 1000) as u64,
            ),
            (CallStatus::Ended, None) | (CallStatus::Missed, _) => (HistoryStatus::Missed, 0),
            (CallStatus::Declined, _) => (HistoryStatus::Declined, 0),
            (CallStatus::Calling | CallStatus::Connected, _) => return None,
        };

        Some(RecordCallRequest {
            caller: Some(self.caller.clone()),
            recipient: Some(self.recipient.clone()),
            kind: Some(self.kind.as_str().to_owned()),
            duration: Some(duration),
            status: Some(status.as_str().to_owned()),
        })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HistoryStatus {
    #[default]
    Completed,
    Missed,
    Declined,
}

impl HistoryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HistoryStatus::Completed => "completed",
            HistoryStatus::Missed => "missed",
            HistoryStatus::Declined => "declined",
        }
    }
}

impl FromStr for HistoryStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "completed" => Ok(HistoryStatus::Completed),
            "missed" => Ok(HistoryStatus::Missed),
            "declined" => Ok(HistoryStatus::Declined),
            other => Err(format!("unsupported call status '{other}'")),
        }
    }
}

/// An immutable record of a call that has finished.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallHistory {
    pub id: String,
    pub caller: String,
    pub recipient: String,
    #[serde(rename = "type")]
    pub kind: CallType,
    pub duration: u64,
    pub timestamp: i64,
    pub status: HistoryStatus,
}

/// Body of `POST /calls`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecordCallRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caller: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient: Option<String>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

impl RecordCallRequest {
    /// Applies defaults (`duration = 0`, `status = completed`) and builds the
    /// history entry with a fresh id.
    pub fn into_history(self, timestamp: i64) -> Result<CallHistory, ValidationError> {
        let mut errors = Vec::new();

        let caller = present(&self.caller).map(str::to_owned);
        if caller.is_none() {
            errors.push(FieldError::missing("caller"));
        }
        let recipient = present(&self.recipient).map(str::to_owned);
        if recipient.is_none() {
            errors.push(FieldError::missing("recipient"));
        }

        let kind = match present(&self.kind) {
            None => {
                errors.push(FieldError::missing("type"));
                None
            }
            Some(raw) => match raw.parse::<CallType>() {
                Ok(kind) => Some(kind),
                Err(_) => {
                    errors.push(FieldError::new("type", "must be 'voice' or 'video'"));
                    None
                }
            },
        };

        let status = match present(&self.status) {
            None => HistoryStatus::default(),
            Some(raw) => raw.parse::<HistoryStatus>().unwrap_or_else(|_| {
                errors.push(FieldError::new(
                    "status",
                    "must be 'completed', 'missed' or 'declined'",
                ));
                HistoryStatus::default()
            }),
        };

        ValidationError::check(errors)?;

        match (caller, recipient, kind) {
            (Some(caller), Some(recipient), Some(kind)) => Ok(CallHistory {
                id: Uuid::new_v4().to_string(),
                caller,
                recipient,
                kind,
                duration: self.duration.unwrap_or(0),
                timestamp,
                status,
            }),
            _ => Err(ValidationError::single(FieldError::missing("type"))),
        }
    }
}
