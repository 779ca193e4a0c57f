//! Persisted record shapes for both documents.

use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use herald_core::types::ManualOverrides;

/// Lifecycle state of a pending record.
///
/// `processing` is a transient marker used while a post-now action runs;
/// it is never written to disk in steady state and normalization resets
/// it to `scheduled` if it ever is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PendingStatus {
    Scheduled,
    Queued,
    Missed,
    Published,
    Cancelled,
    Deleted,
    Processing,
}

impl PendingStatus {
    /// Terminal states: no publisher will touch the record again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, PendingStatus::Published | PendingStatus::Cancelled)
    }

    /// States that count as live automation work for a profile.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            PendingStatus::Scheduled
                | PendingStatus::Queued
                | PendingStatus::Missed
                | PendingStatus::Processing
        )
    }
}

impl std::fmt::Display for PendingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PendingStatus::Scheduled => "scheduled",
            PendingStatus::Queued => "queued",
            PendingStatus::Missed => "missed",
            PendingStatus::Published => "published",
            PendingStatus::Cancelled => "cancelled",
            PendingStatus::Deleted => "deleted",
            PendingStatus::Processing => "processing",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for PendingStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "scheduled" => Ok(PendingStatus::Scheduled),
            "queued" => Ok(PendingStatus::Queued),
            "missed" => Ok(PendingStatus::Missed),
            "published" => Ok(PendingStatus::Published),
            "cancelled" => Ok(PendingStatus::Cancelled),
            "deleted" => Ok(PendingStatus::Deleted),
            "processing" => Ok(PendingStatus::Processing),
            other => Err(format!("unknown pending status: {other}")),
        }
    }
}

/// One persisted slot with its computed publish time and lifecycle state.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingRecord {
    /// Slot key at creation time. Stable even if the user later moves the
    /// event start.
    pub id: String,
    /// Canonical key for the record's *current* start instant.
    pub slot_key: String,
    pub target_id: String,
    pub profile_key: String,
    pub event_starts_at: DateTime<Utc>,
    /// Absent only when the record is published.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduled_publish_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manual_overrides: Option<ManualOverrides>,
    pub status: PendingStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub missed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queued_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_id: Option<String>,
}

impl PendingRecord {
    /// Fresh auto-generated record for a slot.
    pub fn new(
        target_id: &str,
        profile_key: &str,
        starts_at: DateTime<Utc>,
        publish_at: DateTime<Utc>,
    ) -> Self {
        let key = herald_core::slot_key(target_id, profile_key, starts_at);
        Self {
            id: key.clone(),
            slot_key: key,
            target_id: target_id.to_string(),
            profile_key: profile_key.to_string(),
            event_starts_at: starts_at,
            scheduled_publish_time: Some(publish_at),
            manual_overrides: None,
            status: PendingStatus::Scheduled,
            missed_at: None,
            queued_at: None,
            deleted_at: None,
            event_id: None,
        }
    }

    /// All keys under which this record claims its slot: the creation id
    /// plus the current canonical key (deduplicated).
    pub fn slot_keys(&self) -> Vec<&str> {
        if self.id == self.slot_key {
            vec![self.id.as_str()]
        } else {
            vec![self.id.as_str(), self.slot_key.as_str()]
        }
    }

    pub fn has_overrides(&self) -> bool {
        self.manual_overrides.as_ref().is_some_and(|o| !o.is_empty())
    }

    /// Dedup precedence when several records claim one slot:
    /// published > manually edited > queued > scheduled > missed > rest.
    pub fn priority_rank(&self) -> u8 {
        if self.status == PendingStatus::Published {
            return 5;
        }
        if self.has_overrides() {
            return 4;
        }
        match self.status {
            PendingStatus::Queued => 3,
            PendingStatus::Scheduled => 2,
            PendingStatus::Missed => 1,
            _ => 0,
        }
    }

    pub fn matches_target(&self, target: Option<&str>) -> bool {
        target.map_or(true, |t| self.target_id == t)
    }

    pub fn matches_profile(&self, target_id: &str, profile_key: &str) -> bool {
        self.target_id == target_id && self.profile_key == profile_key
    }
}

/// Advisory display settings carried in the pending document.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreSettings {
    pub display_limit: u32,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self { display_limit: 10 }
    }
}

/// The pending-events document, persisted as one JSON file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingDocument {
    #[serde(default)]
    pub events: Vec<PendingRecord>,
    #[serde(default)]
    pub deleted_events: Vec<PendingRecord>,
    #[serde(default)]
    pub settings: StoreSettings,
}

/// Per-profile automation counters and the activation anchor.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileState {
    #[serde(default)]
    pub events_created: u64,
    /// No slot at or before this instant is ever materialized.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub activation_starts_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_success: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_event_id: Option<String>,
    /// Event-start instants (millis) already committed to the remote.
    #[serde(default)]
    pub published_event_times: BTreeSet<i64>,
}

/// The automation-state document, persisted as one JSON file.
///
/// Keyed by `"{targetId}::{profileKey}"`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StateDocument {
    #[serde(default)]
    pub profiles: HashMap<String, ProfileState>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn record(status: PendingStatus) -> PendingRecord {
        let start = Utc.with_ymd_and_hms(2026, 5, 1, 18, 0, 0).unwrap();
        let mut r = PendingRecord::new("g", "p", start, start - chrono::Duration::days(3));
        r.status = status;
        r
    }

    #[test]
    fn wire_field_names_are_camel_case() {
        let r = record(PendingStatus::Scheduled);
        let json = serde_json::to_string(&r).unwrap();
        assert!(json.contains(r#""slotKey""#));
        assert!(json.contains(r#""eventStartsAt""#));
        assert!(json.contains(r#""scheduledPublishTime""#));
        assert!(json.contains(r#""status":"scheduled""#));
        // Unset audit fields must be absent, not null.
        assert!(!json.contains("missedAt"));
        assert!(!json.contains("eventId"));
    }

    #[test]
    fn priority_order_matches_dedup_rules() {
        let published = record(PendingStatus::Published);
        let mut edited = record(PendingStatus::Scheduled);
        edited.manual_overrides = Some(herald_core::ManualOverrides {
            title: Some("x".into()),
            ..Default::default()
        });
        let queued = record(PendingStatus::Queued);
        let scheduled = record(PendingStatus::Scheduled);
        let missed = record(PendingStatus::Missed);
        let cancelled = record(PendingStatus::Cancelled);

        let ranks: Vec<u8> = [published, edited, queued, scheduled, missed, cancelled]
            .iter()
            .map(|r| r.priority_rank())
            .collect();
        assert_eq!(ranks, vec![5, 4, 3, 2, 1, 0]);
    }

    #[test]
    fn slot_keys_deduplicate_when_id_matches() {
        let mut r = record(PendingStatus::Scheduled);
        assert_eq!(r.slot_keys().len(), 1);
        r.slot_key = "pending_g_p_12345".into();
        assert_eq!(r.slot_keys().len(), 2);
    }

    #[test]
    fn state_document_round_trips() {
        let mut doc = StateDocument::default();
        doc.profiles.insert(
            "g::p".into(),
            ProfileState {
                events_created: 4,
                activation_starts_at: Some(Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap()),
                last_success: None,
                last_event_id: Some("ev-9".into()),
                published_event_times: BTreeSet::from([1000, 2000]),
            },
        );
        let json = serde_json::to_string(&doc).unwrap();
        assert!(json.contains(r#""eventsCreated":4"#));
        assert!(json.contains(r#""publishedEventTimes":[1000,2000]"#));
        let back: StateDocument = serde_json::from_str(&json).unwrap();
        assert_eq!(back.profiles["g::p"].events_created, 4);
    }
}
