//! Recurring weekly availability.
//!
//! A resource is bookable only inside its rules. Everything else on a day is
//! an [`UnavailableBlock`], computed by [`invert`]; the rules and their
//! inversion tile each day exactly.

use chrono::{Datelike, NaiveDate, NaiveTime, TimeDelta, Weekday};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::model::{FieldError, ResourceId, RuleId, Span, ValidationErrors};

const MINUTES_PER_DAY: u16 = 24 * 60;

/// Sunday-first weekday order used by the day flags.
pub const WEEK: [Weekday; 7] = [
    Weekday::Sun,
    Weekday::Mon,
    Weekday::Tue,
    Weekday::Wed,
    Weekday::Thu,
    Weekday::Fri,
    Weekday::Sat,
];

/// Seven day-of-week flags, Sunday first.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DaySet(pub [bool; 7]);

impl DaySet {
    pub fn of(days: &[Weekday]) -> Self {
        let mut set = Self::default();
        for day in days {
            set.0[day.num_days_from_sunday() as usize] = true;
        }
        set
    }

    pub fn every_day() -> Self {
        Self([true; 7])
    }

    pub fn contains(&self, day: Weekday) -> bool {
        self.0[day.num_days_from_sunday() as usize]
    }

    pub fn is_empty(&self) -> bool {
        !self.0.iter().any(|d| *d)
    }

    pub fn shares_day(&self, other: &DaySet) -> bool {
        self.0.iter().zip(other.0.iter()).any(|(a, b)| *a && *b)
    }

    pub fn iter(&self) -> impl Iterator<Item = Weekday> + '_ {
        WEEK.into_iter().filter(|d| self.contains(*d))
    }
}

/// Minutes since midnight, `0..=1440`. 1440 is the end-of-day "24:00".
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimeOfDay(u16);

impl TimeOfDay {
    pub const MIDNIGHT: TimeOfDay = TimeOfDay(0);
    pub const END_OF_DAY: TimeOfDay = TimeOfDay(MINUTES_PER_DAY);

    pub fn hm(hour: u8, minute: u8) -> Self {
        Self((u16::from(hour) * 60 + u16::from(minute)).min(MINUTES_PER_DAY))
    }

    pub fn minutes(&self) -> u16 {
        self.0
    }

    /// This time on `date`; 24:00 lands on the next midnight.
    pub fn on(&self, date: NaiveDate) -> chrono::NaiveDateTime {
        date.and_time(NaiveTime::MIN) + TimeDelta::minutes(i64::from(self.0))
    }
}

impl std::fmt::Display for TimeOfDay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:02}:{:02}", self.0 / 60, self.0 % 60)
    }
}

/// A recurring weekly window during which a resource may be booked.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AvailabilityRule {
    pub id: RuleId,
    pub resource_id: ResourceId,
    pub days: DaySet,
    pub start_hour: u8,
    pub start_min: u8,
    pub end_hour: u8,
    pub end_min: u8,
    /// Percentage taken off usage that falls inside this window, `[0, 100)`.
    pub discount_percent: f64,
}

impl AvailabilityRule {
    pub fn new(resource_id: ResourceId, days: DaySet, start: (u8, u8), end: (u8, u8)) -> Self {
        Self {
            id: Ulid::new(),
            resource_id,
            days,
            start_hour: start.0,
            start_min: start.1,
            end_hour: end.0,
            end_min: end.1,
            discount_percent: 0.0,
        }
    }

    pub fn with_discount(mut self, percent: f64) -> Self {
        self.discount_percent = percent;
        self
    }

    pub fn start(&self) -> TimeOfDay {
        TimeOfDay::hm(self.start_hour, self.start_min)
    }

    pub fn end(&self) -> TimeOfDay {
        TimeOfDay::hm(self.end_hour, self.end_min)
    }

    pub fn applies_on(&self, day: Weekday) -> bool {
        self.days.contains(day)
    }

    /// The rule's window on a concrete date, if the rule runs that weekday.
    pub fn window_on(&self, date: NaiveDate) -> Option<Span> {
        self.applies_on(date.weekday())
            .then(|| Span::new(self.start().on(date), self.end().on(date)))
    }

    fn overlaps_rule(&self, other: &AvailabilityRule) -> bool {
        self.days.shares_day(&other.days)
            && self.start() < other.end()
            && other.start() < self.end()
    }
}

/// Complement of the availability rules on one weekday.
///
/// Derived on demand, never stored. No serde impls, so it cannot be written
/// to the event log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnavailableBlock {
    pub day: Weekday,
    pub start: TimeOfDay,
    pub end: TimeOfDay,
}

impl UnavailableBlock {
    pub fn on(&self, date: NaiveDate) -> Span {
        Span::new(self.start.on(date), self.end.on(date))
    }
}

fn check_clock(
    errors: &mut ValidationErrors,
    hour_field: &'static str,
    min_field: &'static str,
    hour: u8,
    minute: u8,
) {
    if hour > 24 {
        errors.push(hour_field, "must be between 0 and 24");
    }
    if minute > 59 {
        errors.push(min_field, "must be between 0 and 59");
    }
    if hour == 24 && minute != 0 {
        errors.push(min_field, "must be 0 when the hour is 24");
    }
}

/// Check one rule against the resource's other rules, reporting every problem.
pub fn validate(rule: &AvailabilityRule, existing: &[AvailabilityRule]) -> Result<(), ValidationErrors> {
    let mut errors = ValidationErrors::default();

    check_clock(&mut errors, "start_hour", "start_min", rule.start_hour, rule.start_min);
    check_clock(&mut errors, "end_hour", "end_min", rule.end_hour, rule.end_min);

    if rule.days.is_empty() {
        errors.push("days", "must include at least one day");
    }
    if !(0.0..100.0).contains(&rule.discount_percent) {
        errors.push("discount_percent", "must be at least 0 and below 100");
    }

    let clock_ok = errors.0.iter().all(|e| !e.field.ends_with("_hour") && !e.field.ends_with("_min"));
    if clock_ok && rule.end() <= rule.start() {
        errors.push("end_hour", "must be after the start time");
    }

    if clock_ok {
        for other in existing
            .iter()
            .filter(|o| o.id != rule.id && o.resource_id == rule.resource_id)
        {
            if rule.overlaps_rule(other) {
                errors.push(
                    "days",
                    format!(
                        "overlaps rule {} ({}-{})",
                        other.id,
                        other.start(),
                        other.end()
                    ),
                );
            }
        }
    }

    errors.into_result()
}

/// Validate a whole candidate rule set. Each rule is checked against the ones
/// before it, so an overlapping pair is reported once, at the later index.
pub fn validate_batch(rules: &[AvailabilityRule]) -> Vec<(usize, FieldError)> {
    rules
        .iter()
        .enumerate()
        .flat_map(|(i, rule)| match validate(rule, &rules[..i]) {
            Ok(()) => Vec::new(),
            Err(errors) => errors.0.into_iter().map(|e| (i, e)).collect(),
        })
        .collect()
}

/// Unavailable blocks for a single weekday: sweep a cursor from 00:00 across
/// the day's rules in start order, emitting every gap.
pub fn invert_day(rules: &[AvailabilityRule], day: Weekday) -> Vec<UnavailableBlock> {
    let mut todays: Vec<&AvailabilityRule> = rules.iter().filter(|r| r.applies_on(day)).collect();
    todays.sort_by_key(|r| r.start());

    let block = |start, end| UnavailableBlock {
        day,
        start,
        end,
    };

    let mut blocks = Vec::new();
    let mut cursor = TimeOfDay::MIDNIGHT;
    for rule in todays {
        if rule.start() > cursor {
            blocks.push(block(cursor, rule.start()));
        }
        cursor = cursor.max(rule.end());
    }
    if cursor < TimeOfDay::END_OF_DAY {
        blocks.push(block(cursor, TimeOfDay::END_OF_DAY));
    }
    blocks
}

/// Unavailable blocks for the whole week, Sunday first.
pub fn invert(rules: &[AvailabilityRule]) -> Vec<UnavailableBlock> {
    WEEK.into_iter().flat_map(|day| invert_day(rules, day)).collect()
}

/// The unavailable blocks of `date`'s weekday placed on that date.
pub fn unavailable_for_date(rules: &[AvailabilityRule], date: NaiveDate) -> Vec<Span> {
    invert_day(rules, date.weekday())
        .iter()
        .map(|b| b.on(date))
        .collect()
}

/// Rule windows on a concrete date, in start order.
pub fn available_for_date(rules: &[AvailabilityRule], date: NaiveDate) -> Vec<Span> {
    let mut spans: Vec<Span> = rules.iter().filter_map(|r| r.window_on(date)).collect();
    spans.sort_by_key(|s| s.start);
    spans
}

/// Time-weighted discount for a usage window: each rule contributes its
/// discount scaled by the share of the window it covers.
pub fn discount_for(rules: &[AvailabilityRule], window: &Span) -> f64 {
    if window.is_empty() {
        return 0.0;
    }
    let total = window.duration().num_seconds() as f64;
    if total <= 0.0 {
        return 0.0;
    }

    let mut weighted = 0.0;
    for date in window.dates() {
        for rule in rules {
            if rule.discount_percent == 0.0 {
                continue;
            }
            if let Some(covered) = rule.window_on(date).and_then(|w| w.intersection(window)) {
                weighted += covered.duration().num_seconds() as f64 * rule.discount_percent;
            }
        }
    }
    weighted / total
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::fixtures::*;

    fn rid() -> ResourceId {
        Ulid::from_parts(1, 1)
    }

    fn monday_rule(start: (u8, u8), end: (u8, u8)) -> AvailabilityRule {
        AvailabilityRule::new(rid(), DaySet::of(&[Weekday::Mon]), start, end)
    }

    fn spans(blocks: &[UnavailableBlock]) -> Vec<(u16, u16)> {
        blocks.iter().map(|b| (b.start.minutes(), b.end.minutes())).collect()
    }

    /// Rules and blocks for one day, sorted, must chain from 0 to 1440 with no gap or overlap.
    fn assert_tiles(rules: &[AvailabilityRule], day: Weekday) {
        let mut pieces: Vec<(u16, u16)> = rules
            .iter()
            .filter(|r| r.applies_on(day))
            .map(|r| (r.start().minutes(), r.end().minutes()))
            .collect();
        pieces.extend(spans(&invert_day(rules, day)));
        pieces.sort();
        let mut cursor = 0;
        for (start, end) in pieces {
            assert_eq!(start, cursor, "gap or overlap at minute {cursor} on {day}");
            assert!(end > start);
            cursor = end;
        }
        assert_eq!(cursor, MINUTES_PER_DAY);
    }

    // ── validate ─────────────────────────────────────────

    #[test]
    fn valid_rule_passes() {
        let rule = monday_rule((9, 0), (17, 0));
        assert!(validate(&rule, &[]).is_ok());
    }

    #[test]
    fn midnight_end_is_valid() {
        let rule = monday_rule((18, 0), (24, 0));
        assert!(validate(&rule, &[]).is_ok());
    }

    #[test]
    fn reports_every_problem_at_once() {
        let mut rule = AvailabilityRule::new(rid(), DaySet::default(), (25, 0), (24, 30));
        rule.discount_percent = 100.0;
        let errors = validate(&rule, &[]).unwrap_err();
        assert!(errors.has_field("start_hour"));
        assert!(errors.has_field("end_min"));
        assert!(errors.has_field("days"));
        assert!(errors.has_field("discount_percent"));
    }

    #[test]
    fn end_must_follow_start() {
        let errors = validate(&monday_rule((12, 0), (12, 0)), &[]).unwrap_err();
        assert!(errors.has_field("end_hour"));
        assert!(validate(&monday_rule((12, 0), (11, 0)), &[]).is_err());
    }

    #[test]
    fn overlapping_rules_rejected() {
        let existing = monday_rule((9, 0), (12, 0));
        let clash = monday_rule((11, 0), (13, 0));
        let errors = validate(&clash, std::slice::from_ref(&existing)).unwrap_err();
        assert!(errors.has_field("days"));
    }

    #[test]
    fn touching_rules_allowed() {
        let existing = monday_rule((9, 0), (12, 0));
        let next = monday_rule((12, 0), (13, 0));
        assert!(validate(&next, &[existing]).is_ok());
    }

    #[test]
    fn overlap_on_different_days_allowed() {
        let existing = monday_rule((9, 0), (12, 0));
        let tuesday = AvailabilityRule::new(rid(), DaySet::of(&[Weekday::Tue]), (9, 0), (12, 0));
        assert!(validate(&tuesday, &[existing]).is_ok());
    }

    #[test]
    fn rule_does_not_conflict_with_itself_on_edit() {
        let existing = monday_rule((9, 0), (12, 0));
        let mut edited = existing.clone();
        edited.end_hour = 13;
        assert!(validate(&edited, &[existing]).is_ok());
    }

    #[test]
    fn batch_reports_indexed_errors() {
        let rules = vec![
            monday_rule((9, 0), (12, 0)),
            monday_rule((11, 0), (13, 0)),
            AvailabilityRule::new(rid(), DaySet::default(), (8, 0), (9, 0)),
        ];
        let errors = validate_batch(&rules);
        assert!(errors.iter().any(|(i, e)| *i == 1 && e.field == "days"));
        assert!(errors.iter().any(|(i, e)| *i == 2 && e.field == "days"));
        assert!(errors.iter().all(|(i, _)| *i != 0));
    }

    // ── invert ───────────────────────────────────────────

    #[test]
    fn invert_two_rules_monday() {
        let rules = vec![
            monday_rule((9, 0), (12, 0)),
            monday_rule((13, 0), (17, 0)).with_discount(10.0),
        ];
        let monday = invert_day(&rules, Weekday::Mon);
        assert_eq!(spans(&monday), vec![(0, 540), (720, 780), (1020, 1440)]);
        assert_tiles(&rules, Weekday::Mon);
    }

    #[test]
    fn day_without_rules_is_fully_blocked() {
        let rules = vec![monday_rule((9, 0), (12, 0))];
        let sunday = invert_day(&rules, Weekday::Sun);
        assert_eq!(spans(&sunday), vec![(0, 1440)]);
        assert_eq!(invert(&[]).len(), 7);
    }

    #[test]
    fn rule_from_midnight_emits_no_leading_gap() {
        let rules = vec![monday_rule((0, 0), (8, 0)), monday_rule((8, 0), (24, 0))];
        assert!(invert_day(&rules, Weekday::Mon).is_empty());
        assert_tiles(&rules, Weekday::Mon);
    }

    #[test]
    fn unsorted_input_tiles() {
        let rules = vec![
            monday_rule((20, 0), (22, 30)),
            monday_rule((6, 15), (7, 45)),
            monday_rule((7, 45), (12, 0)),
        ];
        assert_tiles(&rules, Weekday::Mon);
    }

    #[test]
    fn every_day_tiles_for_mixed_week() {
        let rules = vec![
            AvailabilityRule::new(rid(), DaySet::of(&[Weekday::Mon, Weekday::Wed]), (9, 0), (17, 0)),
            AvailabilityRule::new(rid(), DaySet::of(&[Weekday::Wed, Weekday::Sat]), (18, 0), (24, 0)),
            AvailabilityRule::new(rid(), DaySet::every_day(), (0, 0), (6, 0)),
        ];
        for day in WEEK {
            assert_tiles(&rules, day);
        }
    }

    #[test]
    fn unavailable_for_date_maps_onto_calendar() {
        let rules = vec![monday_rule((9, 0), (12, 0))];
        let blocks = unavailable_for_date(&rules, monday());
        let tuesday = monday().succ_opt().unwrap();
        assert_eq!(
            blocks,
            vec![
                Span::new(mon(0, 0), mon(9, 0)),
                Span::new(mon(12, 0), at(tuesday, 0, 0)),
            ]
        );
    }

    // ── discount_for ─────────────────────────────────────

    #[test]
    fn half_overlap_halves_discount() {
        let rules = vec![monday_rule((13, 0), (17, 0)).with_discount(20.0)];
        let window = Span::new(mon(12, 0), mon(14, 0));
        assert_eq!(discount_for(&rules, &window), 10.0);
    }

    #[test]
    fn full_overlap_gives_full_discount() {
        let rules = vec![monday_rule((13, 0), (17, 0)).with_discount(25.0)];
        let window = Span::new(mon(14, 0), mon(15, 0));
        assert_eq!(discount_for(&rules, &window), 25.0);
    }

    #[test]
    fn discount_sums_across_rules() {
        let rules = vec![
            monday_rule((9, 0), (12, 0)).with_discount(10.0),
            monday_rule((12, 0), (17, 0)).with_discount(30.0),
        ];
        let window = Span::new(mon(11, 0), mon(13, 0));
        assert_eq!(discount_for(&rules, &window), 20.0);
    }

    #[test]
    fn discount_spans_midnight() {
        let tuesday = monday().succ_opt().unwrap();
        let rules = vec![
            AvailabilityRule::new(rid(), DaySet::of(&[Weekday::Mon]), (22, 0), (24, 0)).with_discount(40.0),
        ];
        let window = Span::new(mon(23, 0), at(tuesday, 1, 0));
        assert_eq!(discount_for(&rules, &window), 20.0);
    }

    #[test]
    fn degenerate_windows_have_no_discount() {
        let rules = vec![monday_rule((9, 0), (17, 0)).with_discount(50.0)];
        assert_eq!(discount_for(&rules, &Span::new(mon(10, 0), mon(10, 0))), 0.0);
        assert_eq!(discount_for(&rules, &Span::new(mon(11, 0), mon(10, 0))), 0.0);
    }
}
