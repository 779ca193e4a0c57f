use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

/// Hard cap: a publish time is never later than this many minutes before
/// the event start.
pub const PUBLISH_LEAD_FLOOR_MINS: i64 = 30;

/// Top-level config (herald.toml + HERALD_* env overrides).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct HeraldConfig {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub automation: AutomationConfig,
    #[serde(default)]
    pub rate: RateConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Path of the pending-events document.
    #[serde(default = "default_pending_path")]
    pub pending_path: String,
    /// Path of the automation-state document.
    #[serde(default = "default_state_path")]
    pub state_path: String,
    /// Advisory UI display limit stored alongside the pending events.
    #[serde(default = "default_display_limit")]
    pub display_limit: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutomationConfig {
    /// How far ahead pattern expansion looks.
    #[serde(default = "default_months_ahead")]
    pub months_ahead: u32,
    /// Ceiling on live pending records per profile.
    #[serde(default = "default_max_materialized")]
    pub max_materialized_per_profile: usize,
    /// After-mode: what anchors the first slot when there is no publish
    /// history. See [`FirstSlotBasis`].
    #[serde(default)]
    pub first_slot_basis: FirstSlotBasis,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateConfig {
    /// Sliding-window length for the per-target publish counter.
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
    /// Max publishes per target inside one window.
    #[serde(default = "default_window_limit")]
    pub window_limit: usize,
    /// Lock durations (minutes) applied on observed rate-limit errors,
    /// advanced one step per consecutive error.
    #[serde(default = "default_backoff_ladder")]
    pub backoff_ladder_mins: Vec<u64>,
    /// Pause between consecutive publishes, keeps the window smooth.
    #[serde(default = "default_spacing_ms")]
    pub spacing_ms: u64,
    /// Delay before retrying a transient (non-rate-limit) publish failure.
    #[serde(default = "default_retry_delay_secs")]
    pub retry_delay_secs: u64,
}

/// After-mode first-slot semantics when no publish history exists.
///
/// The chain rule needs a "previous end" for the first slot. With a
/// recorded `last_success` that instant is used; without one the source
/// behavior is ambiguous, so both readings are supported:
///
/// - `WallClock` — anchor the first slot at `now`.
/// - `PreviousEventEnd` — there is no previous end, fall back to
///   before-mode timing for the first slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum FirstSlotBasis {
    #[default]
    WallClock,
    PreviousEventEnd,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            pending_path: default_pending_path(),
            state_path: default_state_path(),
            display_limit: default_display_limit(),
        }
    }
}

impl Default for AutomationConfig {
    fn default() -> Self {
        Self {
            months_ahead: default_months_ahead(),
            max_materialized_per_profile: default_max_materialized(),
            first_slot_basis: FirstSlotBasis::default(),
        }
    }
}

impl Default for RateConfig {
    fn default() -> Self {
        Self {
            window_secs: default_window_secs(),
            window_limit: default_window_limit(),
            backoff_ladder_mins: default_backoff_ladder(),
            spacing_ms: default_spacing_ms(),
            retry_delay_secs: default_retry_delay_secs(),
        }
    }
}

fn default_pending_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{home}/.herald/pending_events.json")
}

fn default_state_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{home}/.herald/automation_state.json")
}

fn default_display_limit() -> u32 {
    10
}
fn default_months_ahead() -> u32 {
    3
}
fn default_max_materialized() -> usize {
    10
}
fn default_window_secs() -> u64 {
    3600
}
fn default_window_limit() -> usize {
    10
}
fn default_backoff_ladder() -> Vec<u64> {
    vec![2, 4, 8, 16, 32, 60]
}
fn default_spacing_ms() -> u64 {
    100
}
fn default_retry_delay_secs() -> u64 {
    900
}

impl HeraldConfig {
    /// Load config from a TOML file with HERALD_* env var overrides.
    ///
    /// A missing file is fine — every field has a default.
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        let config: HeraldConfig = Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed("HERALD_").split("_"))
            .extract()
            .map_err(|e| crate::error::HeraldError::Config(e.to_string()))?;

        Ok(config)
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{home}/.herald/herald.toml")
}
