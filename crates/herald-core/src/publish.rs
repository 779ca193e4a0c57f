//! The narrow seams to the outside world: pattern expansion and the
//! remote publish call. Credential handling and the HTTP transport live
//! behind [`EventPublisher`] — the engine only sees the outcome.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{EventDetails, Slot};

/// Successful remote publish.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishedEvent {
    pub event_id: String,
}

/// Failed remote publish, as reported by the API transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishApiError {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    pub message: String,
}

impl PublishApiError {
    /// The three signals the remote uses for "slow down".
    pub fn is_rate_limit(&self) -> bool {
        self.code.as_deref() == Some("UPCOMING_LIMIT")
            || self.status == Some(429)
            || self.message.to_lowercase().contains("rate limit")
    }
}

impl std::fmt::Display for PublishApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self.status, self.code.as_deref()) {
            (Some(s), Some(c)) => write!(f, "{} ({c}, status {s})", self.message),
            (Some(s), None) => write!(f, "{} (status {s})", self.message),
            (None, Some(c)) => write!(f, "{} ({c})", self.message),
            (None, None) => write!(f, "{}", self.message),
        }
    }
}

/// The remote event API. One call, no retry logic at this layer.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(
        &self,
        target_id: &str,
        details: &EventDetails,
        starts_at: DateTime<Utc>,
        ends_at: DateTime<Utc>,
    ) -> std::result::Result<PublishedEvent, PublishApiError>;
}

/// Pattern date-math, provided by the caller as a pure function: turns a
/// profile's patterns into future event start instants.
pub trait SlotExpander: Send + Sync {
    fn expand(
        &self,
        patterns: &[serde_json::Value],
        months_ahead: u32,
        timezone: &str,
    ) -> Vec<Slot>;
}

/// An event as observed on the remote calendar — reconciliation input.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteEvent {
    pub event_id: String,
    pub starts_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn err(code: Option<&str>, status: Option<u16>, message: &str) -> PublishApiError {
        PublishApiError {
            code: code.map(String::from),
            status,
            message: message.to_string(),
        }
    }

    #[test]
    fn rate_limit_detected_by_code() {
        assert!(err(Some("UPCOMING_LIMIT"), None, "too many").is_rate_limit());
    }

    #[test]
    fn rate_limit_detected_by_status() {
        assert!(err(None, Some(429), "slow down").is_rate_limit());
    }

    #[test]
    fn rate_limit_detected_by_message_case_insensitive() {
        assert!(err(None, Some(500), "Rate Limit exceeded for group").is_rate_limit());
    }

    #[test]
    fn plain_server_error_is_not_rate_limit() {
        assert!(!err(None, Some(502), "bad gateway").is_rate_limit());
        assert!(!err(Some("INTERNAL"), None, "boom").is_rate_limit());
    }
}
