//! Pending requests and callback events held by the correlation store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What kind of outbound request a correlation id belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestKind {
    Call,
    Sms,
}

/// An outbound request the provider accepted; created by `register`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingRequest {
    pub correlation_id: String,
    pub created_at: DateTime<Utc>,
    pub kind: RequestKind,
    /// Whether the originating tool invocation blocked for the result.
    pub wait: bool,
    /// Destination number, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
}

impl PendingRequest {
    pub fn new(correlation_id: impl Into<String>, kind: RequestKind, wait: bool) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            created_at: Utc::now(),
            kind,
            wait,
            to: None,
        }
    }

    pub fn with_to(mut self, to: impl Into<String>) -> Self {
        self.to = Some(to.into());
        self
    }
}

/// Status carried by a provider callback.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallbackStatus {
    Ringing,
    Answered,
    Completed,
    Failed,
    Delivered,
    Rejected,
    InputReceived,
    /// Provider status with no meaning for correlation (e.g. "started", "accepted").
    Other(String),
}

impl CallbackStatus {
    /// Terminal statuses end the request; at most one of them is authoritative at a time.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CallbackStatus::Completed
                | CallbackStatus::Failed
                | CallbackStatus::Delivered
                | CallbackStatus::Rejected
        )
    }

    pub fn as_str(&self) -> &str {
        match self {
            CallbackStatus::Ringing => "ringing",
            CallbackStatus::Answered => "answered",
            CallbackStatus::Completed => "completed",
            CallbackStatus::Failed => "failed",
            CallbackStatus::Delivered => "delivered",
            CallbackStatus::Rejected => "rejected",
            CallbackStatus::InputReceived => "input_received",
            CallbackStatus::Other(s) => s.as_str(),
        }
    }
}

impl std::fmt::Display for CallbackStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One provider callback, as stored. Immutable once published.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallbackEvent {
    pub correlation_id: String,
    pub status: CallbackStatus,
    /// Provider data relevant to the caller (recognized text, reply body, error code, ...).
    pub payload: serde_json::Value,
    pub received_at: DateTime<Utc>,
    /// Per-id publish order, starting at 1.
    pub sequence: u64,
}

impl CallbackEvent {
    /// Recognized speech or reply text, when the payload carries one.
    pub fn text(&self) -> Option<&str> {
        self.payload.get("text").and_then(|v| v.as_str())
    }
}
