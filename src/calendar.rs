//! Display-ready interval lists for calendar front ends.

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use serde::Serialize;

use crate::engine::{Engine, EngineError};
use crate::model::{ReservationId, ResourceId, Span};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CalendarKind {
    Available,
    Unavailable,
    Reservation,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CalendarEvent {
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
    pub all_day: bool,
    pub kind: CalendarKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reservation_id: Option<ReservationId>,
}

impl CalendarEvent {
    fn new(span: Span, kind: CalendarKind, reservation_id: Option<ReservationId>) -> Self {
        Self {
            start: span.start,
            end: span.end,
            all_day: false,
            kind,
            reservation_id,
        }
    }
}

/// Every availability window, unavailable block and live reservation on
/// the dates `[from, to)`, ordered by start.
pub fn project(
    engine: &Engine,
    resource: &ResourceId,
    from: NaiveDate,
    to: NaiveDate,
) -> Result<Vec<CalendarEvent>, EngineError> {
    let reservations = engine.reservations_for_range(
        resource,
        from.and_time(NaiveTime::MIN),
        to.and_time(NaiveTime::MIN),
    )?;

    let mut events = Vec::new();
    for date in from.iter_days().take_while(|d| *d < to) {
        for span in engine.available_for_date(resource, date)? {
            events.push(CalendarEvent::new(span, CalendarKind::Available, None));
        }
        for span in engine.unavailable_for_date(resource, date)? {
            events.push(CalendarEvent::new(span, CalendarKind::Unavailable, None));
        }
    }
    for r in reservations {
        events.push(CalendarEvent::new(r.window(), CalendarKind::Reservation, Some(r.id)));
    }

    events.sort_by_key(|e| (e.start, e.kind));
    Ok(events)
}
