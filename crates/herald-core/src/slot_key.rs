//! Deterministic slot identity.
//!
//! A slot is identified by `(target, profile, event start)`; the canonical
//! string form doubles as the on-disk record id. Target and profile tokens
//! may themselves contain underscores, so parsing only ever splits off the
//! final token.

use chrono::{DateTime, Utc};

const PREFIX: &str = "pending_";

/// Canonical key: `pending_{target}_{profile}_{eventStartMillis}`.
pub fn slot_key(target_id: &str, profile_key: &str, starts_at: DateTime<Utc>) -> String {
    format!(
        "{PREFIX}{}_{}_{}",
        target_id,
        profile_key,
        starts_at.timestamp_millis()
    )
}

/// Extract the event-start milliseconds from a key.
///
/// Only the last `_`-separated token is interpreted; everything before it
/// is opaque. Returns `None` when the tail is not a signed integer.
pub fn parse_start_millis(key: &str) -> Option<i64> {
    let (_, tail) = key.rsplit_once('_')?;
    tail.parse::<i64>().ok()
}

/// Whether `id` is the canonical key for this profile and some start.
pub fn is_canonical(id: &str, target_id: &str, profile_key: &str) -> bool {
    let Some(rest) = id.strip_prefix(PREFIX) else {
        return false;
    };
    let Some(expected) = rest.strip_prefix(&format!("{target_id}_{profile_key}_")) else {
        return false;
    };
    expected.parse::<i64>().is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn key_round_trips_start_millis() {
        let start = Utc.with_ymd_and_hms(2026, 3, 6, 19, 0, 0).unwrap();
        let key = slot_key("grp-1", "friday-show", start);
        assert_eq!(
            key,
            format!("pending_grp-1_friday-show_{}", start.timestamp_millis())
        );
        assert_eq!(parse_start_millis(&key), Some(start.timestamp_millis()));
    }

    #[test]
    fn tokens_with_underscores_still_parse() {
        let start = Utc.with_ymd_and_hms(2026, 1, 2, 12, 0, 0).unwrap();
        let key = slot_key("my_group", "show_v2", start);
        // rsplit on the final underscore only — inner underscores are opaque.
        assert_eq!(parse_start_millis(&key), Some(start.timestamp_millis()));
        assert!(is_canonical(&key, "my_group", "show_v2"));
    }

    #[test]
    fn negative_millis_are_valid() {
        let start = Utc.with_ymd_and_hms(1969, 12, 1, 0, 0, 0).unwrap();
        let key = slot_key("g", "p", start);
        let millis = parse_start_millis(&key).unwrap();
        assert!(millis < 0);
        assert_eq!(millis, start.timestamp_millis());
    }

    #[test]
    fn malformed_tails_rejected() {
        assert_eq!(parse_start_millis("pending_g_p_notanumber"), None);
        assert_eq!(parse_start_millis("nounderscore"), None);
        assert!(!is_canonical("pending_g_p_notanumber", "g", "p"));
        assert!(!is_canonical("custom-id-123", "g", "p"));
        // Canonical for a different profile is not canonical for this one.
        assert!(!is_canonical("pending_g_p_1000", "g", "other"));
    }
}
