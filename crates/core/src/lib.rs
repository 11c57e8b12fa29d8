//! Core call signaling types shared by the Fusion Connect server and client.

pub mod call;
pub mod signal;
pub mod validation;

pub use call::{CallData, CallHistory, CallStatus, CallType, HistoryStatus, RecordCallRequest};
pub use signal::{SendSignalRequest, SignalMessage};
pub use validation::{FieldError, ValidationError};

/// Milliseconds since the Unix epoch, the unit every wire timestamp uses.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
