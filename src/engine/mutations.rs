use chrono::NaiveDateTime;
use tracing::{debug, info};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::reservation::{Reservation, ReservationState};
use crate::rules::{self, AvailabilityRule};

use super::conflict::{check_no_conflict, snap_window, validate_window};
use super::{Engine, EngineError};

/// A request to hold a resource for a window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingRequest {
    pub resource_id: ResourceId,
    pub window: Span,
    /// `None` books an administrative reservation, which may start in the past.
    pub order_ref: Option<OrderRef>,
}

fn validate_policy(name: Option<&str>, policy: &ResourcePolicy) -> Result<(), EngineError> {
    if let Some(n) = name
        && n.len() > MAX_NAME_LEN
    {
        return Err(EngineError::LimitExceeded("resource name too long"));
    }
    let mut errors = ValidationErrors::default();
    if policy.interval_minutes == 0 {
        errors.push("interval_minutes", "must be at least 1");
    }
    if let (Some(min), Some(max)) = (policy.min_duration_minutes, policy.max_duration_minutes)
        && min > max
    {
        errors.push("max_duration_minutes", "must not be below min_duration_minutes");
    }
    errors.into_result().map_err(EngineError::from)
}

impl Engine {
    pub fn create_resource(
        &self,
        id: ResourceId,
        name: Option<String>,
        policy: ResourcePolicy,
    ) -> Result<(), EngineError> {
        if self.state.len() >= MAX_RESOURCES {
            return Err(EngineError::LimitExceeded("too many resources"));
        }
        validate_policy(name.as_deref(), &policy)?;
        let _gate = self.compaction_gate.read();
        if self.state.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }

        let event = Event::ResourceCreated {
            id,
            name: name.clone(),
            policy: policy.clone(),
        };
        self.wal_append(&event)?;
        self.insert_resource(ResourceState::new(id, name, policy));
        self.notify.send(id, &event);
        metrics::gauge!(crate::observability::RESOURCES_ACTIVE).set(self.state.len() as f64);
        info!(resource = %id, "resource created");
        Ok(())
    }

    /// Replace a resource's name and policy. Existing reservations are kept
    /// as booked even if they no longer satisfy the new duration limits.
    pub fn update_resource(
        &self,
        id: ResourceId,
        name: Option<String>,
        policy: ResourcePolicy,
    ) -> Result<(), EngineError> {
        validate_policy(name.as_deref(), &policy)?;
        let rs = self.require_resource(&id)?;
        let mut guard = rs.write();
        let event = Event::ResourceUpdated { id, name, policy };
        self.persist_and_apply(&mut guard, &event)
    }

    pub fn add_rule(&self, rule: AvailabilityRule) -> Result<RuleId, EngineError> {
        let rs = self.require_resource(&rule.resource_id)?;
        let mut guard = rs.write();
        if guard.rules.len() >= MAX_RULES_PER_RESOURCE {
            return Err(EngineError::LimitExceeded("too many rules on resource"));
        }
        if self.entity_to_resource.contains_key(&rule.id) {
            return Err(EngineError::AlreadyExists(rule.id));
        }
        rules::validate(&rule, &guard.rules)?;

        let id = rule.id;
        self.persist_and_apply(&mut guard, &Event::RuleAdded { rule })?;
        Ok(id)
    }

    pub fn update_rule(&self, rule: AvailabilityRule) -> Result<(), EngineError> {
        let (resource_id, rs) = self.resolve_entity(&rule.id)?;
        if rule.resource_id != resource_id {
            return Err(EngineError::field("resource_id", "cannot move a rule to another resource"));
        }
        let mut guard = rs.write();
        if !guard.rules.iter().any(|r| r.id == rule.id) {
            return Err(EngineError::NotFound(rule.id));
        }
        rules::validate(&rule, &guard.rules)?;
        self.persist_and_apply(&mut guard, &Event::RuleUpdated { rule })
    }

    pub fn remove_rule(&self, id: RuleId) -> Result<ResourceId, EngineError> {
        let (resource_id, rs) = self.resolve_entity(&id)?;
        let mut guard = rs.write();
        if !guard.rules.iter().any(|r| r.id == id) {
            return Err(EngineError::NotFound(id));
        }
        self.persist_and_apply(&mut guard, &Event::RuleRemoved { id, resource_id })?;
        Ok(resource_id)
    }

    /// Book a window. The start is moved forward onto the resource's interval
    /// grid before the conflict check; the duration is kept.
    pub fn book(
        &self,
        request: BookingRequest,
        now: NaiveDateTime,
    ) -> Result<Reservation, EngineError> {
        let rs = self.require_resource(&request.resource_id)?;
        let mut guard = rs.write();
        if guard.reservations.len() >= MAX_RESERVATIONS_PER_RESOURCE {
            return Err(EngineError::LimitExceeded("too many reservations on resource"));
        }

        let check_past = request.order_ref.is_some();
        validate_window(&guard.policy, &request.window, check_past, now)?;
        let window = snap_window(&guard.policy, &request.window);
        check_no_conflict(&guard, &window, None)?;

        let reservation = Reservation::new(Ulid::new(), guard.id, request.order_ref, window);
        let event = Event::ReservationBooked {
            reservation: reservation.clone(),
        };
        self.persist_and_apply(&mut guard, &event)?;
        info!(
            reservation = %reservation.id,
            resource = %reservation.resource_id,
            start = %window.start,
            end = %window.end,
            "reservation booked"
        );
        Ok(reservation)
    }

    /// Move or resize a reservation.
    ///
    /// Before the lock boundary the whole window may move. After it only the
    /// end may change, and only while the end is still editable.
    pub fn reschedule(
        &self,
        id: ReservationId,
        new_window: Span,
        now: NaiveDateTime,
    ) -> Result<Reservation, EngineError> {
        let (resource_id, rs) = self.resolve_entity(&id)?;
        let mut guard = rs.write();
        let current = guard.reservation(&id).ok_or(EngineError::NotFound(id))?.clone();

        let state = current.state();
        if matches!(state, ReservationState::Ended | ReservationState::Canceled) {
            return Err(EngineError::IllegalState {
                id,
                state,
                action: "reschedule",
            });
        }
        if new_window == current.window() {
            debug!(reservation = %id, "reschedule to same window");
            return Ok(current);
        }

        let window = if current.editable_start(now, &self.config) {
            validate_window(&guard.policy, &new_window, !current.is_administrative(), now)?;
            snap_window(&guard.policy, &new_window)
        } else {
            if new_window.start != current.reserve_start_at {
                return Err(EngineError::field("reserve_start_at", "can no longer be changed"));
            }
            let next_start = guard.next_start_after(&current);
            if !current.editable_end(now, &self.config, new_window.end, next_start) {
                return Err(EngineError::field("reserve_end_at", "can no longer be changed"));
            }
            validate_window(&guard.policy, &new_window, false, now)?;
            new_window
        };
        check_no_conflict(&guard, &window, Some(id))?;

        let event = Event::ReservationRescheduled {
            id,
            resource_id,
            window,
        };
        self.persist_and_apply(&mut guard, &event)?;
        info!(reservation = %id, start = %window.start, end = %window.end, "reservation rescheduled");
        guard.reservation(&id).cloned().ok_or(EngineError::NotFound(id))
    }
}
