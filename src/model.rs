use chrono::{NaiveDate, NaiveDateTime, TimeDelta};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::reservation::{Cancellation, Reservation, ReservationState};
use crate::rules::AvailabilityRule;

pub type ResourceId = Ulid;
pub type RuleId = Ulid;
pub type ReservationId = Ulid;
/// Physical control line (relay) a resource is wired to.
pub type ChannelId = Ulid;
/// Id of the external order line a reservation was booked for.
pub type OrderRef = Ulid;

/// Half-open interval `[start, end)` in facility-local time.
///
/// Unlike stored reservations, a span built from caller input may be empty
/// or inverted; `is_empty` reports that and every predicate tolerates it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Span {
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
}

impl Span {
    pub fn new(start: NaiveDateTime, end: NaiveDateTime) -> Self {
        Self { start, end }
    }

    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }

    pub fn duration(&self) -> TimeDelta {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains_instant(&self, t: NaiveDateTime) -> bool {
        self.start <= t && t < self.end
    }

    /// Returns true if `self` fully contains `other`.
    pub fn contains_span(&self, other: &Span) -> bool {
        self.start <= other.start && other.end <= self.end
    }

    pub fn intersection(&self, other: &Span) -> Option<Span> {
        let clamped = Span::new(self.start.max(other.start), self.end.min(other.end));
        (!clamped.is_empty()).then_some(clamped)
    }

    /// Calendar dates this span touches. An end at exactly midnight does not
    /// pull in the following date.
    pub fn dates(&self) -> impl Iterator<Item = NaiveDate> {
        let first = self.start.date();
        let last = if self.is_empty() {
            first
        } else {
            (self.end - TimeDelta::nanoseconds(1)).date()
        };
        let empty = self.is_empty();
        first
            .iter_days()
            .take_while(move |d| !empty && *d <= last)
    }
}

/// How a resource's usage is switched on and off.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ControlMechanism {
    /// Staff record usage by hand; missing actuals are expected.
    #[default]
    Manual,
    /// Power relay driven through the device collaborator.
    Relay,
    /// Usage timer started and stopped by the instrument user.
    Timer,
}

/// Per-resource booking rules.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourcePolicy {
    pub min_duration_minutes: Option<u32>,
    pub max_duration_minutes: Option<u32>,
    /// Booking granularity. Starts are snapped up to this grid and durations
    /// must be a multiple of it.
    pub interval_minutes: u32,
    pub control: ControlMechanism,
    /// Shared control line. `None` means the resource is its own channel.
    pub channel: Option<ChannelId>,
}

impl Default for ResourcePolicy {
    fn default() -> Self {
        Self {
            min_duration_minutes: None,
            max_duration_minutes: None,
            interval_minutes: 1,
            control: ControlMechanism::Manual,
            channel: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ResourceState {
    pub id: ResourceId,
    pub name: Option<String>,
    pub policy: ResourcePolicy,
    pub rules: Vec<AvailabilityRule>,
    /// All reservations (canceled included), sorted by `reserve_start_at`.
    pub reservations: Vec<Reservation>,
}

impl ResourceState {
    pub fn new(id: ResourceId, name: Option<String>, policy: ResourcePolicy) -> Self {
        Self {
            id,
            name,
            policy,
            rules: Vec::new(),
            reservations: Vec::new(),
        }
    }

    pub fn channel(&self) -> ChannelId {
        self.policy.channel.unwrap_or(self.id)
    }

    /// Insert reservation maintaining sort order by reserve_start_at.
    pub fn insert_reservation(&mut self, reservation: Reservation) {
        let pos = self
            .reservations
            .partition_point(|r| r.reserve_start_at <= reservation.reserve_start_at);
        self.reservations.insert(pos, reservation);
    }

    pub fn remove_reservation(&mut self, id: ReservationId) -> Option<Reservation> {
        let pos = self.reservations.iter().position(|r| r.id == id)?;
        Some(self.reservations.remove(pos))
    }

    pub fn reservation(&self, id: &ReservationId) -> Option<&Reservation> {
        self.reservations.iter().find(|r| r.id == *id)
    }

    pub fn reservation_mut(&mut self, id: &ReservationId) -> Option<&mut Reservation> {
        self.reservations.iter_mut().find(|r| r.id == *id)
    }

    /// Reservations whose requested window overlaps the query, canceled ones included.
    /// Uses binary search to skip reservations starting at or after `query.end`.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Reservation> {
        let right_bound = self
            .reservations
            .partition_point(|r| r.reserve_start_at < query.end);
        self.reservations[..right_bound]
            .iter()
            .filter(move |r| r.reserve_end_at > query.start)
    }

    /// Reservations currently holding the resource.
    pub fn started(&self) -> impl Iterator<Item = &Reservation> {
        self.reservations
            .iter()
            .filter(|r| r.state() == ReservationState::Started)
    }

    /// Start of the first live reservation that begins at or after `after`'s end,
    /// excluding `after` itself.
    pub fn next_start_after(&self, after: &Reservation) -> Option<NaiveDateTime> {
        self.reservations
            .iter()
            .filter(|r| r.id != after.id && !r.is_canceled())
            .map(|r| r.reserve_start_at)
            .filter(|s| *s >= after.reserve_end_at)
            .min()
    }
}

/// One problem with a submitted value, keyed by the field that carries it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldError {
    pub field: &'static str,
    pub message: String,
}

impl FieldError {
    pub fn new(field: &'static str, message: impl Into<String>) -> Self {
        Self {
            field,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for FieldError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.field, self.message)
    }
}

/// Every field problem found in one pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, thiserror::Error)]
#[error("{}", display_all(.0))]
pub struct ValidationErrors(pub Vec<FieldError>);

fn display_all(errors: &[FieldError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl ValidationErrors {
    pub fn push(&mut self, field: &'static str, message: impl Into<String>) {
        self.0.push(FieldError::new(field, message));
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn has_field(&self, field: &str) -> bool {
        self.0.iter().any(|e| e.field == field)
    }

    pub fn into_result(self) -> Result<(), ValidationErrors> {
        if self.0.is_empty() { Ok(()) } else { Err(self) }
    }
}

/// Schedule changes, one variant per mutation. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Event {
    ResourceCreated {
        id: ResourceId,
        name: Option<String>,
        policy: ResourcePolicy,
    },
    ResourceUpdated {
        id: ResourceId,
        name: Option<String>,
        policy: ResourcePolicy,
    },
    RuleAdded {
        rule: AvailabilityRule,
    },
    RuleUpdated {
        rule: AvailabilityRule,
    },
    RuleRemoved {
        id: RuleId,
        resource_id: ResourceId,
    },
    ReservationBooked {
        reservation: Reservation,
    },
    ReservationRescheduled {
        id: ReservationId,
        resource_id: ResourceId,
        window: Span,
    },
    ReservationStarted {
        id: ReservationId,
        resource_id: ResourceId,
        at: NaiveDateTime,
    },
    ReservationEnded {
        id: ReservationId,
        resource_id: ResourceId,
        at: NaiveDateTime,
    },
    ReservationCanceled {
        id: ReservationId,
        resource_id: ResourceId,
        cancellation: Cancellation,
    },
    ActualsCorrected {
        id: ReservationId,
        resource_id: ResourceId,
        actual_start_at: Option<NaiveDateTime>,
        actual_end_at: Option<NaiveDateTime>,
    },
}

impl Event {
    /// The resource an event applies to.
    pub fn resource_id(&self) -> ResourceId {
        match self {
            Event::ResourceCreated { id, .. } | Event::ResourceUpdated { id, .. } => *id,
            Event::RuleAdded { rule } | Event::RuleUpdated { rule } => rule.resource_id,
            Event::ReservationBooked { reservation } => reservation.resource_id,
            Event::RuleRemoved { resource_id, .. }
            | Event::ReservationRescheduled { resource_id, .. }
            | Event::ReservationStarted { resource_id, .. }
            | Event::ReservationEnded { resource_id, .. }
            | Event::ReservationCanceled { resource_id, .. }
            | Event::ActualsCorrected { resource_id, .. } => *resource_id,
        }
    }
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceInfo {
    pub id: ResourceId,
    pub name: Option<String>,
    pub policy: ResourcePolicy,
}

#[cfg(test)]
pub(crate) mod fixtures {
    use chrono::{NaiveDate, NaiveDateTime};

    /// 2024-01-01 is a Monday.
    pub fn monday() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, 1).unwrap()
    }

    pub fn at(date: NaiveDate, h: u32, m: u32) -> NaiveDateTime {
        date.and_hms_opt(h, m, 0).unwrap()
    }

    pub fn mon(h: u32, m: u32) -> NaiveDateTime {
        at(monday(), h, m)
    }
}
