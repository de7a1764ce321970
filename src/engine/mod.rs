mod conflict;
mod error;
mod lifecycle;
mod mutations;
mod queries;

pub use conflict::{overlaps, round_up_to_interval, snap_up};
pub use error::{ConflictSource, EngineError};
pub use lifecycle::{CancelOutcome, CancelRequest, Completion, EndOutcome, StartOutcome, SweepReport};
pub use mutations::BookingRequest;
pub use queries::ResourceStatus;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use parking_lot::{Mutex, MutexGuard, RwLock};
use ulid::Ulid;

use crate::collaborators::Collaborators;
use crate::config::ScheduleConfig;
use crate::device::DeviceGateway;
use crate::model::*;
use crate::notify::NotifyHub;
use crate::wal::Wal;

pub type SharedResourceState = Arc<RwLock<ResourceState>>;

pub struct Engine {
    state: DashMap<ResourceId, SharedResourceState>,
    wal: Mutex<Wal>,
    pub notify: Arc<NotifyHub>,
    pub config: ScheduleConfig,
    collaborators: Collaborators,
    pub device: DeviceGateway,
    /// Reverse lookup: entity (rule/reservation) id → resource id
    entity_to_resource: DashMap<Ulid, ResourceId>,
    /// Channel → resources wired to it.
    channels: DashMap<ChannelId, Vec<ResourceId>>,
    /// One occupancy lock per channel. Taken before any resource lock.
    channel_locks: DashMap<ChannelId, Arc<Mutex<()>>>,
    /// Shared by resource creation, exclusive for compaction, so a new
    /// resource is either in the snapshot or appended after the rewrite.
    compaction_gate: RwLock<()>,
}

/// Apply an event directly to a ResourceState (caller holds the lock).
fn apply_to_resource(rs: &mut ResourceState, event: &Event, entity_map: &DashMap<Ulid, ResourceId>) {
    match event {
        Event::RuleAdded { rule } => {
            rs.rules.push(rule.clone());
            entity_map.insert(rule.id, rule.resource_id);
        }
        Event::RuleUpdated { rule } => {
            if let Some(existing) = rs.rules.iter_mut().find(|r| r.id == rule.id) {
                *existing = rule.clone();
            }
        }
        Event::RuleRemoved { id, .. } => {
            rs.rules.retain(|r| r.id != *id);
            entity_map.remove(id);
        }
        Event::ReservationBooked { reservation } => {
            rs.insert_reservation(reservation.clone());
            entity_map.insert(reservation.id, reservation.resource_id);
        }
        Event::ReservationRescheduled { id, window, .. } => {
            if let Some(mut r) = rs.remove_reservation(*id) {
                r.reserve_start_at = window.start;
                r.reserve_end_at = window.end;
                rs.insert_reservation(r);
            }
        }
        Event::ReservationStarted { id, at, .. } => {
            if let Some(r) = rs.reservation_mut(id) {
                r.actual_start_at = Some(*at);
            }
        }
        Event::ReservationEnded { id, at, .. } => {
            if let Some(r) = rs.reservation_mut(id) {
                r.actual_end_at = Some(*at);
            }
        }
        Event::ReservationCanceled { id, cancellation, .. } => {
            if let Some(r) = rs.reservation_mut(id) {
                r.cancellation = Some(cancellation.clone());
            }
        }
        Event::ActualsCorrected {
            id,
            actual_start_at,
            actual_end_at,
            ..
        } => {
            if let Some(r) = rs.reservation_mut(id) {
                r.actual_start_at = *actual_start_at;
                r.actual_end_at = *actual_end_at;
            }
        }
        Event::ResourceUpdated { name, policy, .. } => {
            rs.name = name.clone();
            rs.policy = policy.clone();
        }
        // ResourceCreated is handled at the DashMap level, not here
        Event::ResourceCreated { .. } => {}
    }
}

impl Engine {
    pub fn new(
        wal_path: PathBuf,
        notify: Arc<NotifyHub>,
        config: ScheduleConfig,
        collaborators: Collaborators,
    ) -> std::io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let device = DeviceGateway::new(collaborators.device.clone(), config.device_timeout);

        let engine = Self {
            state: DashMap::new(),
            wal: Mutex::new(wal),
            notify,
            config,
            collaborators,
            device,
            entity_to_resource: DashMap::new(),
            channels: DashMap::new(),
            channel_locks: DashMap::new(),
            compaction_gate: RwLock::new(()),
        };

        for event in &events {
            match event {
                Event::ResourceCreated { id, name, policy } => {
                    engine.insert_resource(ResourceState::new(*id, name.clone(), policy.clone()));
                }
                other => {
                    if let Some(entry) = engine.state.get(&other.resource_id()) {
                        let rs_arc = entry.clone();
                        drop(entry);
                        let mut guard = rs_arc.write();
                        engine.apply(&mut guard, other);
                    }
                }
            }
        }
        metrics::gauge!(crate::observability::RESOURCES_ACTIVE).set(engine.state.len() as f64);

        Ok(engine)
    }

    fn insert_resource(&self, rs: ResourceState) {
        let id = rs.id;
        self.channels.entry(rs.channel()).or_default().push(id);
        self.state.insert(id, Arc::new(RwLock::new(rs)));
    }

    /// Apply to state, keeping the channel index in step with policy changes.
    fn apply(&self, rs: &mut ResourceState, event: &Event) {
        let channel_before = rs.channel();
        apply_to_resource(rs, event, &self.entity_to_resource);
        let channel_after = rs.channel();
        if channel_before != channel_after {
            if let Some(mut members) = self.channels.get_mut(&channel_before) {
                members.retain(|r| *r != rs.id);
            }
            self.channels.entry(channel_after).or_default().push(rs.id);
        }
        metrics::counter!(
            crate::observability::EVENTS_APPLIED_TOTAL,
            "event" => crate::observability::event_label(event)
        )
        .increment(1);
    }

    /// Write event to the WAL and fsync.
    fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let started = Instant::now();
        let result = self
            .wal
            .lock()
            .append(event)
            .map_err(|e| EngineError::WalError(e.to_string()));
        metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
            .record(started.elapsed().as_secs_f64());
        result
    }

    /// Write several events with a single fsync.
    fn wal_append_batch(&self, events: &[Event]) -> Result<(), EngineError> {
        let started = Instant::now();
        let result = {
            let mut wal = self.wal.lock();
            events
                .iter()
                .try_for_each(|e| wal.append_buffered(e))
                .and_then(|()| wal.flush_sync())
                .map_err(|e| EngineError::WalError(e.to_string()))
        };
        metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
            .record(started.elapsed().as_secs_f64());
        result
    }

    /// Apply an event that is already in the WAL and tell subscribers.
    fn apply_and_notify(&self, rs: &mut ResourceState, event: &Event) {
        self.apply(rs, event);
        self.notify.send(rs.id, event);
    }

    pub fn get_resource(&self, id: &ResourceId) -> Option<SharedResourceState> {
        self.state.get(id).map(|e| e.value().clone())
    }

    pub fn get_resource_for_entity(&self, entity_id: &Ulid) -> Option<ResourceId> {
        self.entity_to_resource.get(entity_id).map(|e| *e.value())
    }

    /// WAL-append + apply + notify in one call.
    fn persist_and_apply(
        &self,
        rs: &mut ResourceState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event)?;
        self.apply_and_notify(rs, event);
        Ok(())
    }

    fn require_resource(&self, id: &ResourceId) -> Result<SharedResourceState, EngineError> {
        self.get_resource(id).ok_or(EngineError::NotFound(*id))
    }

    /// Lookup reservation/rule → owning resource.
    fn resolve_entity(&self, entity_id: &Ulid) -> Result<(ResourceId, SharedResourceState), EngineError> {
        let resource_id = self
            .get_resource_for_entity(entity_id)
            .ok_or(EngineError::NotFound(*entity_id))?;
        Ok((resource_id, self.require_resource(&resource_id)?))
    }

    fn channel_of(&self, rs: &SharedResourceState) -> ChannelId {
        rs.read().channel()
    }

    /// Resources wired to `channel`, sorted so multi-resource locking has one order.
    fn channel_members(&self, channel: ChannelId) -> Vec<ResourceId> {
        let mut members = self
            .channels
            .get(&channel)
            .map(|m| m.value().clone())
            .unwrap_or_default();
        members.sort();
        members.dedup();
        members
    }

    fn channel_lock(&self, channel: ChannelId) -> Arc<Mutex<()>> {
        self.channel_locks.entry(channel).or_default().clone()
    }

    /// Take the channel's occupancy lock, giving up after `lock_timeout`.
    fn lock_channel<'a>(
        &self,
        channel: ChannelId,
        lock: &'a Mutex<()>,
    ) -> Result<MutexGuard<'a, ()>, EngineError> {
        lock.try_lock_for(self.config.lock_timeout)
            .ok_or(EngineError::Busy(channel))
    }

    pub fn wal_appends_since_compact(&self) -> u64 {
        self.wal.lock().appends_since_compact()
    }

    /// Compact the WAL by rewriting it with only the events needed to recreate the current state.
    pub fn compact_wal(&self) -> Result<(), EngineError> {
        let _gate = self.compaction_gate.write();
        let mut ids: Vec<ResourceId> = self.state.iter().map(|e| *e.key()).collect();
        ids.sort();
        let arcs: Vec<SharedResourceState> = ids.iter().filter_map(|id| self.get_resource(id)).collect();
        // Read locks are held until the swap so no event lands between snapshot and rewrite.
        let guards: Vec<_> = arcs.iter().map(|rs| rs.read()).collect();

        let mut events = Vec::new();
        for guard in &guards {
            events.push(Event::ResourceCreated {
                id: guard.id,
                name: guard.name.clone(),
                policy: guard.policy.clone(),
            });
            for rule in &guard.rules {
                events.push(Event::RuleAdded { rule: rule.clone() });
            }
            for reservation in &guard.reservations {
                events.push(Event::ReservationBooked {
                    reservation: reservation.clone(),
                });
            }
        }

        self.wal
            .lock()
            .compact(&events)
            .map_err(|e| EngineError::WalError(e.to_string()))
    }
}
