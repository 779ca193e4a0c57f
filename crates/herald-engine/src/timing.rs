//! Publish-time calculation.
//!
//! Derives the instant a pending record is committed to the remote from
//! the profile's automation settings. All three modes share one hard cap:
//! a publish never lands later than 30 minutes before the event starts.
//! Times earlier than "now" are legal here — classification to `missed`
//! belongs to the scheduler.

use chrono::{DateTime, Datelike, Duration, LocalResult, NaiveDate, TimeZone, Utc};
use chrono_tz::Tz;
use tracing::warn;

use herald_core::config::{FirstSlotBasis, PUBLISH_LEAD_FLOOR_MINS};
use herald_core::types::{AutomationSettings, Profile, Slot, TimingMode};

/// Apply the hard cap: never later than `start − 30 min`.
pub fn clamp_publish(publish: DateTime<Utc>, starts_at: DateTime<Utc>) -> DateTime<Utc> {
    publish.min(starts_at - Duration::minutes(PUBLISH_LEAD_FLOOR_MINS))
}

/// Before-mode: a fixed offset ahead of the event start.
pub fn publish_time_before(starts_at: DateTime<Utc>, settings: &AutomationSettings) -> DateTime<Utc> {
    clamp_publish(starts_at - settings.offset(), starts_at)
}

/// Monthly mode: the configured calendar day/time in the event's month,
/// computed in the profile timezone. The day is clamped to the month's
/// last day (31 on a 30-day month publishes on the 30th); a candidate not
/// strictly before the start steps one month earlier and re-clamps.
///
/// `None` only when the candidate falls into a DST gap that the previous
/// month cannot resolve either.
pub fn publish_time_monthly(
    starts_at: DateTime<Utc>,
    settings: &AutomationSettings,
    tz: Tz,
) -> Option<DateTime<Utc>> {
    let local = starts_at.with_timezone(&tz);
    let candidate = monthly_candidate(tz, local.year(), local.month(), settings)?;
    let candidate = if candidate < starts_at {
        candidate
    } else {
        let (year, month) = previous_month(local.year(), local.month());
        monthly_candidate(tz, year, month, settings)?
    };
    Some(clamp_publish(candidate, starts_at))
}

fn monthly_candidate(tz: Tz, year: i32, month: u32, settings: &AutomationSettings) -> Option<DateTime<Utc>> {
    let day = settings.monthly_day.max(1).min(last_day_of_month(year, month));
    local_instant(tz, year, month, day, settings.monthly_hour, settings.monthly_minute)
}

fn previous_month(year: i32, month: u32) -> (i32, u32) {
    if month == 1 {
        (year - 1, 12)
    } else {
        (year, month - 1)
    }
}

fn last_day_of_month(year: i32, month: u32) -> u32 {
    let (next_year, next_month) = if month == 12 {
        (year + 1, 1)
    } else {
        (year, month + 1)
    };
    NaiveDate::from_ymd_opt(next_year, next_month, 1)
        .and_then(|d| d.pred_opt())
        .map(|d| d.day())
        .unwrap_or(28)
}

fn local_instant(tz: Tz, year: i32, month: u32, day: u32, hour: u32, minute: u32) -> Option<DateTime<Utc>> {
    match tz.with_ymd_and_hms(year, month, day, hour, minute, 0) {
        LocalResult::Single(dt) => Some(dt.with_timezone(&Utc)),
        // Fall-back transition: take the earlier of the two wall-clock reads.
        LocalResult::Ambiguous(earlier, _) => Some(earlier.with_timezone(&Utc)),
        LocalResult::None => None,
    }
}

/// A slot paired with its computed publish instant.
#[derive(Debug, Clone)]
pub struct PlannedSlot {
    pub slot: Slot,
    pub publish_at: DateTime<Utc>,
}

/// After-mode: chain each publish off the previous event's end plus the
/// offset. The first slot anchors on the last recorded success, falling
/// back per [`FirstSlotBasis`]. When the chained instant drifts past the
/// midpoint between the previous anchor and the slot, timing switches to
/// before-mode against that slot.
pub fn plan_after_slots(
    slots: &[Slot],
    settings: &AutomationSettings,
    duration: Duration,
    last_success: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    basis: FirstSlotBasis,
) -> Vec<PlannedSlot> {
    let mut planned = Vec::with_capacity(slots.len());
    for (i, slot) in slots.iter().enumerate() {
        let prev = if i == 0 {
            match (last_success, basis) {
                (Some(t), _) => Some(t),
                (None, FirstSlotBasis::WallClock) => Some(now),
                // No history and no previous slot: nothing to chain from.
                (None, FirstSlotBasis::PreviousEventEnd) => None,
            }
        } else {
            Some(slots[i - 1].starts_at + duration)
        };

        let publish_at = match prev {
            None => publish_time_before(slot.starts_at, settings),
            Some(prev) => {
                let chained = prev + settings.offset();
                let midpoint = prev + (slot.starts_at - prev) / 2;
                if chained > midpoint {
                    publish_time_before(slot.starts_at, settings)
                } else {
                    clamp_publish(chained, slot.starts_at)
                }
            }
        };
        planned.push(PlannedSlot {
            slot: slot.clone(),
            publish_at,
        });
    }
    planned
}

/// Publish time for a single start under this profile's settings.
///
/// The per-record entry point used by restore, override recomputation,
/// and load-time repair. After-mode has no previous slot on these paths,
/// so it substitutes before-mode timing.
pub fn publish_time_for_start(starts_at: DateTime<Utc>, profile: &Profile) -> Option<DateTime<Utc>> {
    let settings = &profile.automation;
    match settings.timing_mode {
        TimingMode::Before | TimingMode::After => Some(publish_time_before(starts_at, settings)),
        TimingMode::Monthly => publish_time_monthly(starts_at, settings, parse_tz(&profile.timezone)),
    }
}

/// Parse an IANA timezone name, falling back to UTC.
pub fn parse_tz(name: &str) -> Tz {
    name.parse().unwrap_or_else(|_| {
        warn!(timezone = name, "unknown timezone, falling back to UTC");
        chrono_tz::UTC
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use herald_core::types::RepeatMode;

    fn settings(mode: TimingMode) -> AutomationSettings {
        AutomationSettings {
            enabled: true,
            timing_mode: mode,
            days_offset: 3,
            hours_offset: 0,
            minutes_offset: 0,
            monthly_day: 11,
            monthly_hour: 19,
            monthly_minute: 30,
            repeat_mode: RepeatMode::Indefinite,
            repeat_count: 0,
        }
    }

    fn utc(y: i32, m: u32, d: u32, hh: u32, mm: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, hh, mm, 0).unwrap()
    }

    fn slot(starts_at: DateTime<Utc>) -> Slot {
        Slot {
            starts_at,
            weekday: None,
            occurrence: None,
            is_last: false,
            is_annual: false,
        }
    }

    #[test]
    fn before_mode_subtracts_offset() {
        let start = utc(2026, 3, 6, 19, 0);
        let publish = publish_time_before(start, &settings(TimingMode::Before));
        assert_eq!(publish, start - Duration::days(3));
    }

    #[test]
    fn cap_allows_exactly_thirty_minutes() {
        let start = utc(2026, 3, 6, 19, 0);
        let mut s = settings(TimingMode::Before);
        s.days_offset = 0;
        s.minutes_offset = 30;
        assert_eq!(publish_time_before(start, &s), start - Duration::minutes(30));
    }

    #[test]
    fn cap_clamps_twenty_nine_minutes_down() {
        let start = utc(2026, 3, 6, 19, 0);
        let mut s = settings(TimingMode::Before);
        s.days_offset = 0;
        s.minutes_offset = 29;
        assert_eq!(publish_time_before(start, &s), start - Duration::minutes(30));
    }

    #[test]
    fn monthly_day_31_clamps_in_short_month() {
        // April has 30 days; day=31 at 09:00 UTC publishes on the 30th.
        let mut s = settings(TimingMode::Monthly);
        s.monthly_day = 31;
        s.monthly_hour = 9;
        s.monthly_minute = 0;
        // Event on April 30th, 23:00 — candidate April 30 09:00 is before it.
        let start = utc(2026, 4, 30, 23, 0);
        let publish = publish_time_monthly(start, &s, chrono_tz::UTC).unwrap();
        assert_eq!(publish, utc(2026, 4, 30, 9, 0));
    }

    #[test]
    fn monthly_steps_back_when_candidate_not_before_start() {
        // Event on the 5th; day-11 candidate lands after it → previous month.
        let s = settings(TimingMode::Monthly);
        let start = utc(2026, 4, 5, 18, 0);
        let publish = publish_time_monthly(start, &s, chrono_tz::UTC).unwrap();
        assert_eq!(publish, utc(2026, 3, 11, 19, 30));
    }

    #[test]
    fn monthly_computes_in_profile_timezone() {
        // Saturday 18:00 Asia/Seoul = 09:00 UTC. Day 11 at 19:30 Seoul is
        // 10:30 UTC on the 11th.
        let s = settings(TimingMode::Monthly);
        let tz: Tz = "Asia/Seoul".parse().unwrap();
        let start = utc(2026, 7, 25, 9, 0); // Saturday 18:00 KST
        let publish = publish_time_monthly(start, &s, tz).unwrap();
        assert_eq!(publish, utc(2026, 7, 11, 10, 30));
    }

    #[test]
    fn monthly_batch_shares_one_publish_instant() {
        // All four Saturdays of July 2026 after the 11th share the same
        // publish time.
        let s = settings(TimingMode::Monthly);
        let tz: Tz = "Asia/Seoul".parse().unwrap();
        let saturdays = [
            utc(2026, 7, 18, 9, 0),
            utc(2026, 7, 25, 9, 0),
        ];
        let times: Vec<_> = saturdays
            .iter()
            .map(|st| publish_time_monthly(*st, &s, tz).unwrap())
            .collect();
        assert!(times.windows(2).all(|w| w[0] == w[1]));
    }

    #[test]
    fn after_mode_chains_from_previous_event_end() {
        let mut s = settings(TimingMode::After);
        s.days_offset = 0;
        s.hours_offset = 2;
        let now = utc(2026, 3, 1, 12, 0);
        let slots = vec![slot(utc(2026, 3, 6, 19, 0)), slot(utc(2026, 3, 13, 19, 0))];
        let planned = plan_after_slots(
            &slots,
            &s,
            Duration::minutes(60),
            Some(utc(2026, 3, 1, 10, 0)),
            now,
            FirstSlotBasis::WallClock,
        );
        // First slot chains off last_success + 2h.
        assert_eq!(planned[0].publish_at, utc(2026, 3, 1, 12, 0));
        // Second chains off the first event's end (19:00 + 60m) + 2h.
        assert_eq!(planned[1].publish_at, utc(2026, 3, 6, 22, 0));
    }

    #[test]
    fn after_mode_smart_switch_past_midpoint() {
        let mut s = settings(TimingMode::After);
        s.days_offset = 6; // chained instant overshoots the midpoint
        let now = utc(2026, 3, 1, 12, 0);
        let slots = vec![slot(utc(2026, 3, 6, 19, 0)), slot(utc(2026, 3, 13, 19, 0))];
        let planned = plan_after_slots(
            &slots,
            &s,
            Duration::minutes(60),
            None,
            now,
            FirstSlotBasis::WallClock,
        );
        // Second slot: prev end = Mar 6 20:00, chained = Mar 12 20:00,
        // midpoint = Mar 10 07:30 → switch to before-mode (start − 6d).
        assert_eq!(planned[1].publish_at, utc(2026, 3, 7, 19, 0));
    }

    #[test]
    fn after_mode_first_slot_basis_variants() {
        let mut s = settings(TimingMode::After);
        s.days_offset = 0;
        s.hours_offset = 1;
        let now = utc(2026, 3, 1, 12, 0);
        let slots = vec![slot(utc(2026, 3, 6, 19, 0))];

        // Wall-clock: the first slot anchors at `now`.
        let wall = plan_after_slots(&slots, &s, Duration::minutes(60), None, now, FirstSlotBasis::WallClock);
        assert_eq!(wall[0].publish_at, utc(2026, 3, 1, 13, 0));

        // Previous-event-end with no history: before-mode fallback.
        let prev = plan_after_slots(
            &slots,
            &s,
            Duration::minutes(60),
            None,
            now,
            FirstSlotBasis::PreviousEventEnd,
        );
        assert_eq!(prev[0].publish_at, utc(2026, 3, 6, 18, 0));
    }

    #[test]
    fn restore_path_substitutes_before_mode_for_after() {
        let profile = Profile {
            target_id: "g".into(),
            profile_key: "p".into(),
            title: "t".into(),
            description: String::new(),
            category: None,
            access_type: None,
            languages: vec![],
            platforms: vec![],
            tags: vec![],
            image_id: None,
            image_url: None,
            role_ids: vec![],
            duration_minutes: 60,
            timezone: "UTC".into(),
            patterns: vec![],
            automation: settings(TimingMode::After),
        };
        let start = utc(2026, 3, 6, 19, 0);
        let publish = publish_time_for_start(start, &profile).unwrap();
        assert_eq!(publish, start - Duration::days(3));
    }

    #[test]
    fn unknown_timezone_falls_back_to_utc() {
        assert_eq!(parse_tz("Mars/Olympus_Mons"), chrono_tz::UTC);
        assert_eq!(parse_tz("Europe/Paris"), chrono_tz::Europe::Paris);
    }
}
