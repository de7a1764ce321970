use chrono::{DateTime, NaiveDateTime, TimeDelta, Timelike};

use crate::limits::MAX_RESERVATION_DAYS;
use crate::model::*;
use crate::rules::unavailable_for_date;

use super::error::ConflictSource;
use super::EngineError;

/// Shared overlap predicate: symmetric, boundary-exclusive.
pub fn overlaps(a: &Span, b: &Span) -> bool {
    a.overlaps(b)
}

/// Smallest multiple of `interval` that is `>= t`. `interval` must be positive.
pub fn round_up_to_interval(t: i64, interval: i64) -> i64 {
    debug_assert!(interval > 0, "interval must be positive");
    let rem = t.rem_euclid(interval);
    if rem == 0 { t } else { t + (interval - rem) }
}

/// Move `t` forward onto the `interval_minutes` grid.
pub fn snap_up(t: NaiveDateTime, interval_minutes: u32) -> NaiveDateTime {
    let interval = i64::from(interval_minutes.max(1)) * 60;
    let utc = t.and_utc();
    let mut secs = utc.timestamp();
    if utc.nanosecond() > 0 {
        secs += 1;
    }
    DateTime::from_timestamp(round_up_to_interval(secs, interval), 0)
        .map_or(t, |d| d.naive_utc())
}

/// Check a requested window against the resource policy, collecting every problem.
/// `check_past` is off for administrative bookings and for edits that keep the start.
pub(crate) fn validate_window(
    policy: &ResourcePolicy,
    window: &Span,
    check_past: bool,
    now: NaiveDateTime,
) -> Result<(), EngineError> {
    let mut errors = ValidationErrors::default();

    if window.is_empty() {
        errors.push("reserve_end_at", "must be after reserve_start_at");
        return Err(errors.into());
    }
    if check_past && window.start < now {
        errors.push("reserve_start_at", "must not be in the past");
    }

    let duration = window.duration();
    if duration > TimeDelta::days(MAX_RESERVATION_DAYS) {
        errors.push("reserve_end_at", "reservation is too long");
        return Err(errors.into());
    }

    if duration.num_seconds() % 60 != 0 || duration.subsec_nanos() != 0 {
        errors.push("duration", "must be a whole number of minutes");
    }
    let minutes = duration.num_minutes();
    if let Some(min) = policy.min_duration_minutes
        && minutes < i64::from(min)
    {
        errors.push("duration", format!("must be at least {min} minutes"));
    }
    if let Some(max) = policy.max_duration_minutes
        && minutes > i64::from(max)
    {
        errors.push("duration", format!("must be at most {max} minutes"));
    }
    let interval = i64::from(policy.interval_minutes.max(1));
    if minutes % interval != 0 {
        errors.push("duration", format!("must be a multiple of {interval} minutes"));
    }

    errors.into_result().map_err(EngineError::from)
}

/// Snap the start onto the resource grid, keeping the requested duration.
pub(crate) fn snap_window(policy: &ResourcePolicy, window: &Span) -> Span {
    let start = snap_up(window.start, policy.interval_minutes);
    Span::new(start, start + window.duration())
}

/// Refuse a window that overlaps a live reservation (other than `ignore`) or
/// any unavailable block on a date it touches.
pub(crate) fn check_no_conflict(
    rs: &ResourceState,
    window: &Span,
    ignore: Option<ReservationId>,
) -> Result<(), EngineError> {
    for existing in rs.overlapping(window) {
        if existing.is_canceled() || Some(existing.id) == ignore {
            continue;
        }
        if overlaps(&existing.window(), window) {
            metrics::counter!(crate::observability::CONFLICTS_TOTAL).increment(1);
            return Err(EngineError::Conflict(ConflictSource::Reservation(existing.id)));
        }
    }

    for date in window.dates() {
        for blocked in unavailable_for_date(&rs.rules, date) {
            if overlaps(&blocked, window) {
                metrics::counter!(crate::observability::CONFLICTS_TOTAL).increment(1);
                return Err(EngineError::Conflict(ConflictSource::Unavailable(blocked)));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use chrono::Weekday;
    use ulid::Ulid;

    use super::*;
    use crate::model::fixtures::*;
    use crate::reservation::Reservation;
    use crate::rules::{AvailabilityRule, DaySet};

    fn resource_with_rules(rules: &[((u8, u8), (u8, u8))]) -> ResourceState {
        let mut rs = ResourceState::new(Ulid::new(), None, ResourcePolicy::default());
        for (start, end) in rules {
            rs.rules.push(AvailabilityRule::new(
                rs.id,
                DaySet::of(&[Weekday::Mon]),
                *start,
                *end,
            ));
        }
        rs
    }

    #[test]
    fn round_up_properties() {
        for interval in [1, 5, 15, 60, 7] {
            for t in -130..130 {
                let r = round_up_to_interval(t, interval);
                assert!(r >= t);
                assert_eq!(r.rem_euclid(interval), 0);
                assert!(r - t < interval);
            }
        }
    }

    #[test]
    fn snap_up_to_quarter_hour() {
        assert_eq!(snap_up(mon(10, 7), 15), mon(10, 15));
        assert_eq!(snap_up(mon(10, 15), 15), mon(10, 15));
        assert_eq!(snap_up(mon(23, 50), 30), at(monday().succ_opt().unwrap(), 0, 0));
        let with_seconds = monday().and_hms_opt(10, 15, 1).unwrap();
        assert_eq!(snap_up(with_seconds, 15), mon(10, 30));
    }

    #[test]
    fn overlap_symmetry() {
        let windows = [
            Span::new(mon(9, 0), mon(10, 0)),
            Span::new(mon(9, 30), mon(11, 0)),
            Span::new(mon(10, 0), mon(10, 30)),
            Span::new(mon(8, 0), mon(12, 0)),
        ];
        for a in &windows {
            assert!(overlaps(a, a));
            for b in &windows {
                assert_eq!(overlaps(a, b), overlaps(b, a));
            }
        }
    }

    #[test]
    fn inverted_window_rejected() {
        let err = validate_window(
            &ResourcePolicy::default(),
            &Span::new(mon(11, 0), mon(10, 0)),
            false,
            mon(0, 0),
        )
        .unwrap_err();
        assert!(matches!(err, EngineError::Validation(e) if e.has_field("reserve_end_at")));
    }

    #[test]
    fn duration_bounds_and_granularity() {
        let policy = ResourcePolicy {
            min_duration_minutes: Some(30),
            max_duration_minutes: Some(120),
            interval_minutes: 15,
            ..ResourcePolicy::default()
        };
        let ok = Span::new(mon(10, 0), mon(11, 0));
        assert!(validate_window(&policy, &ok, true, mon(9, 0)).is_ok());

        let short = Span::new(mon(10, 0), mon(10, 15));
        assert!(validate_window(&policy, &short, true, mon(9, 0)).is_err());

        let long = Span::new(mon(10, 0), mon(13, 0));
        assert!(validate_window(&policy, &long, true, mon(9, 0)).is_err());

        let ragged = Span::new(mon(10, 0), mon(10, 40));
        let err = validate_window(&policy, &ragged, true, mon(9, 0)).unwrap_err();
        assert!(matches!(err, EngineError::Validation(e) if e.has_field("duration")));
    }

    #[test]
    fn past_start_only_checked_when_asked() {
        let policy = ResourcePolicy::default();
        let window = Span::new(mon(10, 0), mon(11, 0));
        assert!(validate_window(&policy, &window, true, mon(10, 30)).is_err());
        assert!(validate_window(&policy, &window, false, mon(10, 30)).is_ok());
    }

    #[test]
    fn snap_keeps_duration() {
        let policy = ResourcePolicy {
            interval_minutes: 15,
            ..ResourcePolicy::default()
        };
        let snapped = snap_window(&policy, &Span::new(mon(10, 5), mon(10, 50)));
        assert_eq!(snapped, Span::new(mon(10, 15), mon(11, 0)));
    }

    #[test]
    fn inside_availability_is_free() {
        let rs = resource_with_rules(&[((9, 0), (12, 0))]);
        assert!(check_no_conflict(&rs, &Span::new(mon(11, 0), mon(11, 30)), None).is_ok());
    }

    #[test]
    fn crossing_a_gap_conflicts() {
        let rs = resource_with_rules(&[((9, 0), (12, 0)), ((13, 0), (17, 0))]);
        let err = check_no_conflict(&rs, &Span::new(mon(12, 30), mon(13, 30)), None).unwrap_err();
        assert!(matches!(
            err,
            EngineError::Conflict(ConflictSource::Unavailable(s)) if s == Span::new(mon(12, 0), mon(13, 0))
        ));
    }

    #[test]
    fn reservation_overlap_conflicts_unless_ignored_or_canceled() {
        let mut rs = resource_with_rules(&[((0, 0), (24, 0))]);
        let existing = Reservation::new(Ulid::new(), rs.id, None, Span::new(mon(10, 0), mon(11, 0)));
        let id = existing.id;
        rs.insert_reservation(existing);

        let window = Span::new(mon(10, 30), mon(11, 30));
        assert!(matches!(
            check_no_conflict(&rs, &window, None),
            Err(EngineError::Conflict(ConflictSource::Reservation(c))) if c == id
        ));
        assert!(check_no_conflict(&rs, &window, Some(id)).is_ok());
        assert!(check_no_conflict(&rs, &Span::new(mon(11, 0), mon(12, 0)), None).is_ok());

        rs.reservation_mut(&id).unwrap().cancellation = Some(crate::reservation::Cancellation {
            at: mon(9, 0),
            by: "staff".into(),
            reason: None,
        });
        assert!(check_no_conflict(&rs, &window, None).is_ok());
    }

    #[test]
    fn no_rules_means_never_bookable() {
        let rs = resource_with_rules(&[]);
        assert!(check_no_conflict(&rs, &Span::new(mon(10, 0), mon(11, 0)), None).is_err());
    }
}
