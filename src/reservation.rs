//! The reservation entity and its state machine predicates.
//!
//! Everything here is pure: callers pass the clock and the schedule
//! configuration in. The engine wraps these predicates with locking and
//! persistence in `engine::lifecycle`.

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

use crate::config::ScheduleConfig;
use crate::model::{ControlMechanism, OrderRef, ReservationId, ResourceId, Span};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cancellation {
    pub at: NaiveDateTime,
    pub by: String,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: ReservationId,
    pub resource_id: ResourceId,
    /// `None` marks an administrative reservation (maintenance, training)
    /// that is not tied to an order.
    pub order_ref: Option<OrderRef>,
    pub reserve_start_at: NaiveDateTime,
    pub reserve_end_at: NaiveDateTime,
    pub actual_start_at: Option<NaiveDateTime>,
    pub actual_end_at: Option<NaiveDateTime>,
    pub cancellation: Option<Cancellation>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReservationState {
    Requested,
    Started,
    Ended,
    Canceled,
}

impl ReservationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReservationState::Requested => "requested",
            ReservationState::Started => "started",
            ReservationState::Ended => "ended",
            ReservationState::Canceled => "canceled",
        }
    }
}

impl std::fmt::Display for ReservationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Reservation {
    pub fn new(
        id: ReservationId,
        resource_id: ResourceId,
        order_ref: Option<OrderRef>,
        window: Span,
    ) -> Self {
        Self {
            id,
            resource_id,
            order_ref,
            reserve_start_at: window.start,
            reserve_end_at: window.end,
            actual_start_at: None,
            actual_end_at: None,
            cancellation: None,
        }
    }

    pub fn window(&self) -> Span {
        Span::new(self.reserve_start_at, self.reserve_end_at)
    }

    /// Recorded usage, once both ends are known.
    pub fn actual_window(&self) -> Option<Span> {
        Some(Span::new(self.actual_start_at?, self.actual_end_at?))
    }

    pub fn is_canceled(&self) -> bool {
        self.cancellation.is_some()
    }

    pub fn is_administrative(&self) -> bool {
        self.order_ref.is_none()
    }

    pub fn has_actuals(&self) -> bool {
        self.actual_start_at.is_some() && self.actual_end_at.is_some()
    }

    pub fn state(&self) -> ReservationState {
        if self.cancellation.is_some() {
            ReservationState::Canceled
        } else if self.actual_end_at.is_some() {
            ReservationState::Ended
        } else if self.actual_start_at.is_some() {
            ReservationState::Started
        } else {
            ReservationState::Requested
        }
    }

    /// Instant after which the start time is frozen.
    pub fn lock_boundary(&self, config: &ScheduleConfig) -> NaiveDateTime {
        self.reserve_start_at - config.lock_window
    }

    /// True iff `now` falls inside the grace period before the official start,
    /// no sibling reservation begins between `now` and this start, and nothing
    /// on the resource is running.
    pub fn can_start_early<'a>(
        &self,
        now: NaiveDateTime,
        config: &ScheduleConfig,
        siblings: impl IntoIterator<Item = &'a Reservation>,
    ) -> bool {
        if self.state() != ReservationState::Requested {
            return false;
        }
        if now >= self.reserve_start_at || now < self.reserve_start_at - config.grace_period {
            return false;
        }
        siblings
            .into_iter()
            .filter(|other| other.id != self.id && !other.is_canceled())
            .all(|other| {
                let intervening =
                    now < other.reserve_start_at && other.reserve_start_at < self.reserve_start_at;
                !intervening && other.state() != ReservationState::Started
            })
    }

    pub fn editable_start(&self, now: NaiveDateTime, config: &ScheduleConfig) -> bool {
        self.state() == ReservationState::Requested && now < self.lock_boundary(config)
    }

    /// Whether the end may move to `proposed_end`.
    ///
    /// Only once the start is frozen (or usage has begun), and never after the
    /// reservation ended. Growing the reservation is refused when the next
    /// live reservation already abuts the current end or would be crossed.
    pub fn editable_end(
        &self,
        now: NaiveDateTime,
        config: &ScheduleConfig,
        proposed_end: NaiveDateTime,
        next_start: Option<NaiveDateTime>,
    ) -> bool {
        let state = self.state();
        if matches!(state, ReservationState::Ended | ReservationState::Canceled) {
            return false;
        }
        if state != ReservationState::Started && now < self.lock_boundary(config) {
            return false;
        }
        if proposed_end <= self.reserve_start_at {
            return false;
        }
        match next_start {
            Some(next) if proposed_end > self.reserve_end_at => {
                next > self.reserve_end_at && proposed_end <= next
            }
            _ => true,
        }
    }

    /// Flags the derived Problem state: the reservation is over but lacks
    /// actual usage data that its control mechanism should have recorded.
    pub fn requires_but_missing_actuals(
        &self,
        now: NaiveDateTime,
        control: ControlMechanism,
    ) -> bool {
        if control == ControlMechanism::Manual || self.is_canceled() || self.has_actuals() {
            return false;
        }
        self.actual_end_at.is_some() || self.reserve_end_at < now
    }
}
