use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identifies a profile: the remote target it publishes into plus the
/// profile's own key within that target.
///
/// The display form `{target}::{key}` is the map key used in the
/// automation-state document.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProfileId {
    pub target_id: String,
    pub profile_key: String,
}

impl ProfileId {
    pub fn new(target_id: impl Into<String>, profile_key: impl Into<String>) -> Self {
        Self {
            target_id: target_id.into(),
            profile_key: profile_key.into(),
        }
    }
}

impl std::fmt::Display for ProfileId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}::{}", self.target_id, self.profile_key)
    }
}

/// When the publish instant is derived relative to the event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimingMode {
    /// Fixed offset before the event start.
    Before,
    /// Chained off the previous event's end.
    After,
    /// A fixed calendar day/time in the event's month.
    Monthly,
}

/// Whether automation runs forever or stops after a fixed event count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RepeatMode {
    Indefinite,
    Count,
}

/// The automation block of a profile — how publish instants are derived.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AutomationSettings {
    pub enabled: bool,
    pub timing_mode: TimingMode,
    #[serde(default)]
    pub days_offset: i64,
    #[serde(default)]
    pub hours_offset: i64,
    #[serde(default)]
    pub minutes_offset: i64,
    /// Calendar day for monthly mode, clamped to the month's last day.
    #[serde(default = "default_monthly_day")]
    pub monthly_day: u32,
    #[serde(default)]
    pub monthly_hour: u32,
    #[serde(default)]
    pub monthly_minute: u32,
    #[serde(default = "default_repeat_mode")]
    pub repeat_mode: RepeatMode,
    #[serde(default)]
    pub repeat_count: u32,
}

fn default_monthly_day() -> u32 {
    1
}
fn default_repeat_mode() -> RepeatMode {
    RepeatMode::Indefinite
}

impl AutomationSettings {
    /// Combined before/after offset as a chrono duration.
    pub fn offset(&self) -> chrono::Duration {
        chrono::Duration::days(self.days_offset)
            + chrono::Duration::hours(self.hours_offset)
            + chrono::Duration::minutes(self.minutes_offset)
    }
}

/// A publishing template, read-only to the engine.
///
/// Profiles live in the caller's profile store; the engine keeps them in
/// a `(target, key) -> Profile` map refreshed on every profile update and
/// queried again at each publish — pending records never hold one.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Profile {
    pub target_id: String,
    pub profile_key: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub access_type: Option<String>,
    #[serde(default)]
    pub languages: Vec<String>,
    #[serde(default)]
    pub platforms: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub image_id: Option<String>,
    #[serde(default)]
    pub image_url: Option<String>,
    #[serde(default)]
    pub role_ids: Vec<String>,
    /// Event length; the publish payload's end instant is start + this.
    #[serde(default = "default_duration")]
    pub duration_minutes: i64,
    /// IANA timezone name; drives monthly-mode calendar math.
    #[serde(default = "default_timezone")]
    pub timezone: String,
    /// Recurrence patterns — opaque to the engine, interpreted only by
    /// the external slot expander.
    #[serde(default)]
    pub patterns: Vec<serde_json::Value>,
    pub automation: AutomationSettings,
}

fn default_duration() -> i64 {
    60
}
fn default_timezone() -> String {
    "UTC".to_string()
}

impl Profile {
    pub fn id(&self) -> ProfileId {
        ProfileId::new(self.target_id.clone(), self.profile_key.clone())
    }

    /// Snapshot of the profile's event-detail fields.
    pub fn details(&self) -> EventDetails {
        EventDetails {
            title: self.title.clone(),
            description: self.description.clone(),
            category: self.category.clone(),
            access_type: self.access_type.clone(),
            languages: self.languages.clone(),
            platforms: self.platforms.clone(),
            tags: self.tags.clone(),
            image_id: self.image_id.clone(),
            image_url: self.image_url.clone(),
            role_ids: self.role_ids.clone(),
            duration_minutes: self.duration_minutes,
            timezone: self.timezone.clone(),
        }
    }
}

/// One future event instant produced by pattern expansion.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Slot {
    pub starts_at: DateTime<Utc>,
    #[serde(default)]
    pub weekday: Option<u8>,
    #[serde(default)]
    pub occurrence: Option<u8>,
    #[serde(default)]
    pub is_last: bool,
    #[serde(default)]
    pub is_annual: bool,
}

/// The resolved payload handed to the remote publish call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventDetails {
    pub title: String,
    pub description: String,
    pub category: Option<String>,
    pub access_type: Option<String>,
    pub languages: Vec<String>,
    pub platforms: Vec<String>,
    pub tags: Vec<String>,
    pub image_id: Option<String>,
    pub image_url: Option<String>,
    pub role_ids: Vec<String>,
    pub duration_minutes: i64,
    pub timezone: String,
}

/// Per-record manual edits. Every field is optional; a set field wins
/// over the profile value when the publish payload is resolved.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManualOverrides {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub languages: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platforms: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role_ids: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_minutes: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timezone: Option<String>,
    /// Moves the event itself; changes slot identity downstream.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_starts_at: Option<DateTime<Utc>>,
}

impl ManualOverrides {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Apply the set fields on top of `details` (override wins).
    pub fn merge_into(&self, details: &mut EventDetails) {
        if let Some(v) = &self.title {
            details.title = v.clone();
        }
        if let Some(v) = &self.description {
            details.description = v.clone();
        }
        if let Some(v) = &self.category {
            details.category = Some(v.clone());
        }
        if let Some(v) = &self.access_type {
            details.access_type = Some(v.clone());
        }
        if let Some(v) = &self.languages {
            details.languages = v.clone();
        }
        if let Some(v) = &self.platforms {
            details.platforms = v.clone();
        }
        if let Some(v) = &self.tags {
            details.tags = v.clone();
        }
        if let Some(v) = &self.image_id {
            details.image_id = Some(v.clone());
        }
        if let Some(v) = &self.image_url {
            details.image_url = Some(v.clone());
        }
        if let Some(v) = &self.role_ids {
            details.role_ids = v.clone();
        }
        if let Some(v) = self.duration_minutes {
            details.duration_minutes = v;
        }
        if let Some(v) = &self.timezone {
            details.timezone = v.clone();
        }
    }
}
