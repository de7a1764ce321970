use chrono::{NaiveDate, NaiveDateTime, TimeDelta};

use crate::device::DeviceStatus;
use crate::limits::*;
use crate::model::*;
use crate::reservation::{Reservation, ReservationState};
use crate::rules::{self, AvailabilityRule};

use super::{Engine, EngineError};

/// What a resource is doing right now.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceStatus {
    pub resource_id: ResourceId,
    /// The running reservation, if any.
    pub occupant: Option<Reservation>,
    /// Relay state. `None` for resources without a relay.
    pub device: Option<DeviceStatus>,
}

impl Engine {
    pub fn reservation(&self, id: &ReservationId) -> Result<Reservation, EngineError> {
        let (_, rs) = self.resolve_entity(id)?;
        let guard = rs.read();
        guard.reservation(id).cloned().ok_or(EngineError::NotFound(*id))
    }

    pub fn resource_info(&self, id: &ResourceId) -> Result<ResourceInfo, EngineError> {
        let rs = self.require_resource(id)?;
        let guard = rs.read();
        Ok(ResourceInfo {
            id: guard.id,
            name: guard.name.clone(),
            policy: guard.policy.clone(),
        })
    }

    pub fn list_resources(&self) -> Vec<ResourceInfo> {
        let mut out: Vec<ResourceInfo> = self
            .state
            .iter()
            .map(|entry| {
                let guard = entry.value().read();
                ResourceInfo {
                    id: guard.id,
                    name: guard.name.clone(),
                    policy: guard.policy.clone(),
                }
            })
            .collect();
        out.sort_by_key(|r| r.id);
        out
    }

    pub fn rules_for(&self, resource_id: &ResourceId) -> Result<Vec<AvailabilityRule>, EngineError> {
        let rs = self.require_resource(resource_id)?;
        let mut rules = rs.read().rules.clone();
        rules.sort_by_key(|r| (r.start(), r.id));
        Ok(rules)
    }

    /// Unavailable blocks of the resource's schedule placed on `date`.
    pub fn unavailable_for_date(
        &self,
        resource_id: &ResourceId,
        date: NaiveDate,
    ) -> Result<Vec<Span>, EngineError> {
        let rs = self.require_resource(resource_id)?;
        let guard = rs.read();
        Ok(rules::unavailable_for_date(&guard.rules, date))
    }

    pub fn available_for_date(
        &self,
        resource_id: &ResourceId,
        date: NaiveDate,
    ) -> Result<Vec<Span>, EngineError> {
        let rs = self.require_resource(resource_id)?;
        let guard = rs.read();
        Ok(rules::available_for_date(&guard.rules, date))
    }

    /// Live reservations whose requested window overlaps `[start, end)`.
    pub fn reservations_for_range(
        &self,
        resource_id: &ResourceId,
        start: NaiveDateTime,
        end: NaiveDateTime,
    ) -> Result<Vec<Reservation>, EngineError> {
        let query = Span::new(start, end);
        if query.is_empty() {
            return Err(EngineError::field("end", "must be after start"));
        }
        if query.duration() > TimeDelta::days(MAX_QUERY_WINDOW_DAYS) {
            return Err(EngineError::LimitExceeded("query window too wide"));
        }

        let rs = self.require_resource(resource_id)?;
        let guard = rs.read();
        Ok(guard
            .overlapping(&query)
            .filter(|r| !r.is_canceled())
            .cloned()
            .collect())
    }

    /// Reservations on every resource wired to `channel`.
    fn channel_reservations(&self, channel: ChannelId) -> Vec<Reservation> {
        self.channel_members(channel)
            .iter()
            .filter_map(|id| self.get_resource(id))
            .flat_map(|rs| rs.read().reservations.clone())
            .collect()
    }

    pub fn can_start_early(&self, id: &ReservationId, now: NaiveDateTime) -> Result<bool, EngineError> {
        let (_, rs) = self.resolve_entity(id)?;
        let (reservation, channel) = {
            let guard = rs.read();
            let r = guard.reservation(id).cloned().ok_or(EngineError::NotFound(*id))?;
            (r, guard.channel())
        };
        let siblings = self.channel_reservations(channel);
        Ok(reservation.can_start_early(now, &self.config, &siblings))
    }

    pub fn editable_start(&self, id: &ReservationId, now: NaiveDateTime) -> Result<bool, EngineError> {
        Ok(self.reservation(id)?.editable_start(now, &self.config))
    }

    pub fn editable_end(
        &self,
        id: &ReservationId,
        proposed_end: NaiveDateTime,
        now: NaiveDateTime,
    ) -> Result<bool, EngineError> {
        let (_, rs) = self.resolve_entity(id)?;
        let guard = rs.read();
        let reservation = guard.reservation(id).ok_or(EngineError::NotFound(*id))?;
        let next_start = guard.next_start_after(reservation);
        Ok(reservation.editable_end(now, &self.config, proposed_end, next_start))
    }

    pub fn requires_but_missing_actuals(
        &self,
        id: &ReservationId,
        now: NaiveDateTime,
    ) -> Result<bool, EngineError> {
        let (_, rs) = self.resolve_entity(id)?;
        let guard = rs.read();
        let reservation = guard.reservation(id).ok_or(EngineError::NotFound(*id))?;
        Ok(reservation.requires_but_missing_actuals(now, guard.policy.control))
    }

    /// Every reservation flagged for manual resolution, oldest first.
    pub fn problem_reservations(&self, now: NaiveDateTime) -> Vec<Reservation> {
        let mut out: Vec<Reservation> = self
            .state
            .iter()
            .flat_map(|entry| {
                let guard = entry.value().read();
                let control = guard.policy.control;
                guard
                    .reservations
                    .iter()
                    .filter(|r| r.requires_but_missing_actuals(now, control))
                    .cloned()
                    .collect::<Vec<_>>()
            })
            .collect();
        out.sort_by_key(|r| (r.reserve_start_at, r.id));
        out
    }

    pub fn problem_count(&self, now: NaiveDateTime) -> usize {
        self.state
            .iter()
            .map(|entry| {
                let guard = entry.value().read();
                let control = guard.policy.control;
                guard
                    .reservations
                    .iter()
                    .filter(|r| r.requires_but_missing_actuals(now, control))
                    .count()
            })
            .sum()
    }

    /// Occupant plus relay state. The relay is probed with no lock held.
    pub fn current_status(&self, resource_id: &ResourceId) -> Result<ResourceStatus, EngineError> {
        let rs = self.require_resource(resource_id)?;
        let (occupant, relay) = {
            let guard = rs.read();
            (
                guard.started().next().cloned(),
                guard.policy.control == ControlMechanism::Relay,
            )
        };
        let device = relay.then(|| self.device.status(*resource_id));
        Ok(ResourceStatus {
            resource_id: *resource_id,
            occupant,
            device,
        })
    }

    /// Discount percentage the resource's schedule grants for `window`.
    pub fn discount_for(&self, resource_id: &ResourceId, window: &Span) -> Result<f64, EngineError> {
        let rs = self.require_resource(resource_id)?;
        let guard = rs.read();
        Ok(rules::discount_for(&guard.rules, window))
    }

    /// Running reservations past their reserved end.
    pub(super) fn expired_candidates(&self, now: NaiveDateTime) -> Vec<ReservationId> {
        self.state
            .iter()
            .flat_map(|entry| {
                let guard = entry.value().read();
                guard
                    .reservations
                    .iter()
                    .filter(|r| r.state() == ReservationState::Started && r.reserve_end_at < now)
                    .map(|r| r.id)
                    .collect::<Vec<_>>()
            })
            .collect()
    }
}
