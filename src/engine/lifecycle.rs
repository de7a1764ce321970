use chrono::NaiveDateTime;
use tracing::{debug, info, warn};

use crate::collaborators::{CollaboratorError, DeviceError, PriceQuote, UsageWindow};
use crate::limits::{MAX_ACTOR_LEN, MAX_REASON_LEN};
use crate::model::*;
use crate::observability::{AUTO_EXPIRED_TOTAL, DISPLACEMENTS_TOTAL, ORDER_ERRORS_TOTAL, SWEEP_FAILURES_TOTAL};
use crate::reservation::{Cancellation, Reservation, ReservationState};
use crate::rules::{discount_for, AvailabilityRule};

use super::{Engine, EngineError, SharedResourceState};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CancelRequest {
    pub by: String,
    pub reason: Option<String>,
    /// Lets staff cancel after the start or once usage was recorded.
    pub admin_override: bool,
}

/// Collaborator results for one reservation that stopped using its resource.
#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub reservation: Reservation,
    pub quote: Option<PriceQuote>,
    pub device_error: Option<DeviceError>,
    pub order_error: Option<CollaboratorError>,
}

impl Completion {
    fn unchanged(reservation: Reservation) -> Self {
        Self {
            reservation,
            quote: None,
            device_error: None,
            order_error: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StartOutcome {
    pub reservation: Reservation,
    /// Reservations on the same channel that were running and got ended.
    pub displaced: Vec<Completion>,
    pub device_error: Option<DeviceError>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CancelOutcome {
    /// False when the reservation was already canceled.
    pub canceled: bool,
    /// Set when switching off a running relay failed. The cancel still stands.
    pub device_error: Option<DeviceError>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EndOutcome {
    /// False when the reservation had already ended.
    pub ended: bool,
    pub completion: Completion,
}

#[derive(Debug, Default)]
pub struct SweepReport {
    pub expired: Vec<Completion>,
    pub failures: Vec<(ReservationId, EngineError)>,
}

/// What completion needs, captured while the resource was locked.
struct Settlement {
    reservation: Reservation,
    rules: Vec<AvailabilityRule>,
    relay: bool,
}

impl Settlement {
    fn capture(rs: &ResourceState, id: &ReservationId) -> Result<Self, EngineError> {
        Ok(Self {
            reservation: rs.reservation(id).cloned().ok_or(EngineError::NotFound(*id))?,
            rules: rs.rules.clone(),
            relay: rs.policy.control == ControlMechanism::Relay,
        })
    }
}

fn illegal(reservation: &Reservation, action: &'static str) -> EngineError {
    EngineError::IllegalState {
        id: reservation.id,
        state: reservation.state(),
        action,
    }
}

impl Engine {
    fn member_states(&self, channel: ChannelId) -> Vec<SharedResourceState> {
        self.channel_members(channel)
            .iter()
            .filter_map(|id| self.get_resource(id))
            .collect()
    }

    /// Begin usage. Whatever else is running on the same channel is ended
    /// first; the relay is switched on after all locks are released.
    pub fn start(&self, id: ReservationId, now: NaiveDateTime) -> Result<StartOutcome, EngineError> {
        let (resource_id, rs) = self.resolve_entity(&id)?;
        let channel = self.channel_of(&rs);
        let lock = self.channel_lock(channel);

        let (started, displaced) = {
            let _occupancy = self.lock_channel(channel, &lock)?;
            let members = self.member_states(channel);
            let mut guards: Vec<_> = members.iter().map(|m| m.write()).collect();

            let target = guards
                .iter()
                .position(|g| g.id == resource_id && g.channel() == channel)
                .ok_or(EngineError::Busy(channel))?;
            let current = guards[target]
                .reservation(&id)
                .ok_or(EngineError::NotFound(id))?;
            if current.state() != ReservationState::Requested {
                return Err(illegal(current, "start"));
            }

            // Displacements and the start are committed together.
            let mut batch: Vec<(usize, Event)> = Vec::new();
            for (i, guard) in guards.iter().enumerate() {
                for running in guard.started() {
                    if let Some(running_since) = running.actual_start_at {
                        batch.push((
                            i,
                            Event::ReservationEnded {
                                id: running.id,
                                resource_id: guard.id,
                                at: now.max(running_since),
                            },
                        ));
                    }
                }
            }
            batch.push((
                target,
                Event::ReservationStarted {
                    id,
                    resource_id,
                    at: now,
                },
            ));
            let events: Vec<Event> = batch.iter().map(|(_, e)| e.clone()).collect();
            self.wal_append_batch(&events)?;

            let mut displaced = Vec::new();
            for (i, event) in &batch {
                let guard = &mut guards[*i];
                self.apply_and_notify(guard, event);
                if let Event::ReservationEnded { id: other, .. } = event {
                    metrics::counter!(DISPLACEMENTS_TOTAL).increment(1);
                    info!(reservation = %other, by = %id, "reservation displaced");
                    displaced.push(Settlement::capture(guard, other)?);
                }
            }
            (Settlement::capture(&guards[target], &id)?, displaced)
        };

        let device_error = if started.relay {
            self.device.activate(resource_id).err()
        } else {
            None
        };
        // Displaced reservations share the relay that was just switched on.
        let displaced = displaced
            .into_iter()
            .map(|s| self.complete(s, false))
            .collect();

        info!(reservation = %id, resource = %resource_id, at = %now, "reservation started");
        Ok(StartOutcome {
            reservation: started.reservation,
            displaced,
            device_error,
        })
    }

    /// Stop usage and settle the order. Ending twice is a no-op.
    pub fn end(&self, id: ReservationId, now: NaiveDateTime) -> Result<EndOutcome, EngineError> {
        let (resource_id, rs) = self.resolve_entity(&id)?;
        let channel = self.channel_of(&rs);
        let lock = self.channel_lock(channel);

        let settlement = {
            let _occupancy = self.lock_channel(channel, &lock)?;
            let mut guard = rs.write();
            if guard.channel() != channel {
                return Err(EngineError::Busy(channel));
            }
            let current = guard.reservation(&id).ok_or(EngineError::NotFound(id))?;
            match current.state() {
                ReservationState::Ended => {
                    debug!(reservation = %id, "already ended");
                    return Ok(EndOutcome {
                        ended: false,
                        completion: Completion::unchanged(current.clone()),
                    });
                }
                ReservationState::Requested | ReservationState::Canceled => {
                    return Err(illegal(current, "end"));
                }
                ReservationState::Started => {}
            }
            let at = current.actual_start_at.map_or(now, |s| now.max(s));

            let event = Event::ReservationEnded {
                id,
                resource_id,
                at,
            };
            self.persist_and_apply(&mut guard, &event)?;
            Settlement::capture(&guard, &id)?
        };

        let completion = self.complete(settlement, true);
        info!(reservation = %id, resource = %resource_id, at = %now, "reservation ended");
        Ok(EndOutcome {
            ended: true,
            completion,
        })
    }

    /// Cancel a reservation. A second cancel is a no-op.
    pub fn cancel(
        &self,
        id: ReservationId,
        request: CancelRequest,
        now: NaiveDateTime,
    ) -> Result<CancelOutcome, EngineError> {
        if request.by.trim().is_empty() {
            return Err(EngineError::field("by", "must not be empty"));
        }
        if request.by.len() > MAX_ACTOR_LEN {
            return Err(EngineError::LimitExceeded("actor name too long"));
        }
        if request.reason.as_ref().is_some_and(|r| r.len() > MAX_REASON_LEN) {
            return Err(EngineError::LimitExceeded("cancel reason too long"));
        }

        let (resource_id, rs) = self.resolve_entity(&id)?;
        let channel = self.channel_of(&rs);
        let lock = self.channel_lock(channel);

        let (was_running, relay) = {
            let _occupancy = self.lock_channel(channel, &lock)?;
            let mut guard = rs.write();
            if guard.channel() != channel {
                return Err(EngineError::Busy(channel));
            }
            let current = guard.reservation(&id).ok_or(EngineError::NotFound(id))?;
            let state = current.state();
            match state {
                ReservationState::Canceled => {
                    debug!(reservation = %id, "already canceled");
                    return Ok(CancelOutcome {
                        canceled: false,
                        device_error: None,
                    });
                }
                ReservationState::Ended => return Err(illegal(current, "cancel")),
                ReservationState::Requested | ReservationState::Started => {}
            }
            let touched = current.actual_start_at.is_some() || current.actual_end_at.is_some();
            if !request.admin_override && (current.reserve_start_at <= now || touched) {
                return Err(illegal(current, "cancel"));
            }

            let event = Event::ReservationCanceled {
                id,
                resource_id,
                cancellation: Cancellation {
                    at: now,
                    by: request.by,
                    reason: request.reason,
                },
            };
            self.persist_and_apply(&mut guard, &event)?;
            (
                state == ReservationState::Started,
                guard.policy.control == ControlMechanism::Relay,
            )
        };

        let device_error = if was_running && relay {
            self.device.deactivate(resource_id).err()
        } else {
            None
        };
        info!(reservation = %id, admin_override = request.admin_override, "reservation canceled");
        Ok(CancelOutcome {
            canceled: true,
            device_error,
        })
    }

    /// Overwrite recorded usage times. Either side may be cleared.
    pub fn correct_actuals(
        &self,
        id: ReservationId,
        actual_start_at: Option<NaiveDateTime>,
        actual_end_at: Option<NaiveDateTime>,
    ) -> Result<Reservation, EngineError> {
        if let (Some(start), Some(end)) = (actual_start_at, actual_end_at)
            && end < start
        {
            return Err(EngineError::field("actual_end_at", "must not precede actual_start_at"));
        }

        let (resource_id, rs) = self.resolve_entity(&id)?;
        let channel = self.channel_of(&rs);
        let lock = self.channel_lock(channel);
        let _occupancy = self.lock_channel(channel, &lock)?;
        let mut guard = rs.write();
        let current = guard.reservation(&id).ok_or(EngineError::NotFound(id))?;
        if current.is_canceled() {
            return Err(illegal(current, "correct"));
        }

        let event = Event::ActualsCorrected {
            id,
            resource_id,
            actual_start_at,
            actual_end_at,
        };
        self.persist_and_apply(&mut guard, &event)?;
        info!(reservation = %id, "actual times corrected");
        guard.reservation(&id).cloned().ok_or(EngineError::NotFound(id))
    }

    /// End every reservation still running past its reserved end. Each one is
    /// closed at `reserve_end_at`. Items fail independently.
    pub fn auto_expire(&self, now: NaiveDateTime) -> SweepReport {
        let mut report = SweepReport::default();
        for id in self.expired_candidates(now) {
            match self.expire_one(id, now) {
                Ok(Some(completion)) => report.expired.push(completion),
                Ok(None) => debug!(reservation = %id, "no longer expirable"),
                Err(e) => {
                    warn!(reservation = %id, error = %e, "auto-expire failed");
                    metrics::counter!(SWEEP_FAILURES_TOTAL).increment(1);
                    report.failures.push((id, e));
                }
            }
        }
        if !report.expired.is_empty() {
            metrics::counter!(AUTO_EXPIRED_TOTAL).increment(report.expired.len() as u64);
            info!(count = report.expired.len(), "reservations auto-expired");
        }
        report
    }

    fn expire_one(&self, id: ReservationId, now: NaiveDateTime) -> Result<Option<Completion>, EngineError> {
        let (resource_id, rs) = self.resolve_entity(&id)?;
        let channel = self.channel_of(&rs);
        let lock = self.channel_lock(channel);

        let settlement = {
            let _occupancy = self.lock_channel(channel, &lock)?;
            let mut guard = rs.write();
            let current = guard.reservation(&id).ok_or(EngineError::NotFound(id))?;
            if current.state() != ReservationState::Started || current.reserve_end_at >= now {
                return Ok(None);
            }
            let at = current
                .actual_start_at
                .map_or(current.reserve_end_at, |s| current.reserve_end_at.max(s));

            let event = Event::ReservationEnded { id, resource_id, at };
            self.persist_and_apply(&mut guard, &event)?;
            Settlement::capture(&guard, &id)?
        };
        Ok(Some(self.complete(settlement, true)))
    }

    /// Switch the relay off and settle the order. Runs without any locks held;
    /// collaborator failures are reported, never raised.
    fn complete(&self, settlement: Settlement, switch_off: bool) -> Completion {
        let Settlement {
            reservation,
            rules,
            relay,
        } = settlement;

        let device_error = if switch_off && relay {
            self.device.deactivate(reservation.resource_id).err()
        } else {
            None
        };

        let Some(order) = reservation.order_ref else {
            return Completion {
                reservation,
                quote: None,
                device_error,
                order_error: None,
            };
        };

        let span = reservation.actual_window().unwrap_or_else(|| reservation.window());
        let usage = UsageWindow {
            span,
            discount_percent: discount_for(&rules, &span),
        };
        let quote = self
            .collaborators
            .pricing
            .cheapest_policy(reservation.resource_id, &usage, span.start.date());
        let order_error = self
            .collaborators
            .orders
            .complete(order, quote.as_ref())
            .err();
        if let Some(e) = &order_error {
            warn!(reservation = %reservation.id, error = %e, "order completion failed");
            metrics::counter!(ORDER_ERRORS_TOTAL).increment(1);
        }

        Completion {
            reservation,
            quote,
            device_error,
            order_error,
        }
    }
}
