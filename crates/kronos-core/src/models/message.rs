//! Messages crossing into the worker: page commands and push payloads.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Result, WorkerError};

/// Command posted by the hosting page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerCommand {
    ScheduleNotification(ScheduleNotification),
    CancelNotifications,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub struct ScheduleNotification {
    #[serde(rename = "delayMs")]
    pub delay_ms: u64,
    pub title: String,
    pub body: String,
    pub tag: String,
}

const KNOWN_TYPES: [&str; 2] = ["SCHEDULE_NOTIFICATION", "CANCEL_NOTIFICATIONS"];

impl WorkerCommand {
    /// Interpret a posted message.
    ///
    /// Messages without a recognised `type` are not commands and yield
    /// `Ok(None)`. A recognised type with missing or ill-typed fields is
    /// rejected.
    pub fn from_message(message: &Value) -> Result<Option<Self>> {
        let Some(kind) = message.get("type").and_then(Value::as_str) else {
            return Ok(None);
        };
        if !KNOWN_TYPES.contains(&kind) {
            return Ok(None);
        }
        serde_json::from_value(message.clone())
            .map(Some)
            .map_err(|e| WorkerError::Validation(format!("{}: {}", kind, e)))
    }
}

/// Push message body. Every field is optional; anything unparseable falls
/// back to the defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushPayload {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub icon: Option<String>,
    #[serde(default)]
    pub tag: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
}

impl PushPayload {
    pub fn parse(data: Option<&[u8]>) -> Self {
        data.and_then(|bytes| serde_json::from_slice::<PushPayload>(bytes).ok())
            .unwrap_or_default()
    }
}
