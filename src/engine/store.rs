use std::collections::HashMap;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::{Mutex, RwLock};
use ulid::Ulid;

use crate::model::*;

use super::EngineError;

pub type SharedTimeline = Arc<RwLock<Timeline>>;
pub type SharedPool = Arc<Mutex<HashMap<Ulid, Appointment>>>;

/// Per-resource timelines plus the appointment → resource index.
///
/// Appointments without a staff member live in the unassigned pool; the
/// index maps them to `None`. Ids of bookings still being validated sit in
/// `claims` so two resources can never both accept the same id.
pub struct TimelineStore {
    timelines: DashMap<Ulid, SharedTimeline>,
    placement: DashMap<Ulid, Option<Ulid>>,
    claims: DashMap<Ulid, ()>,
    unassigned: SharedPool,
}

/// An appointment id reserved by an in-flight booking. Dropping it frees
/// the reservation; by then the id is either indexed or was never used.
pub(crate) struct IdClaim<'a> {
    claims: &'a DashMap<Ulid, ()>,
    id: Ulid,
}

impl Drop for IdClaim<'_> {
    fn drop(&mut self) {
        self.claims.remove(&self.id);
    }
}

impl Default for TimelineStore {
    fn default() -> Self {
        Self::new()
    }
}

impl TimelineStore {
    pub fn new() -> Self {
        Self {
            timelines: DashMap::new(),
            placement: DashMap::new(),
            claims: DashMap::new(),
            unassigned: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    // ── Resources ────────────────────────────────────────────

    pub fn resource_count(&self) -> usize {
        self.timelines.len()
    }

    pub fn contains_resource(&self, id: &Ulid) -> bool {
        self.timelines.contains_key(id)
    }

    pub fn get_timeline(&self, id: &Ulid) -> Option<SharedTimeline> {
        self.timelines.get(id).map(|e| e.value().clone())
    }

    pub fn insert_timeline(&self, timeline: Timeline) -> SharedTimeline {
        let id = timeline.id;
        let shared = Arc::new(RwLock::new(timeline));
        self.timelines.insert(id, shared.clone());
        shared
    }

    /// Sorted, so multi-lock callers can acquire in a fixed order.
    pub fn resource_ids(&self) -> Vec<Ulid> {
        let mut ids: Vec<Ulid> = self.timelines.iter().map(|e| *e.key()).collect();
        ids.sort();
        ids
    }

    // ── Appointment index ────────────────────────────────────

    /// `Some(Some(rid))` on a timeline, `Some(None)` in the unassigned pool.
    pub fn placement(&self, appointment_id: &Ulid) -> Option<Option<Ulid>> {
        self.placement.get(appointment_id).map(|e| *e.value())
    }

    /// Reserve a fresh appointment id. `None` if it is already indexed or
    /// another booking holds it.
    pub(crate) fn claim_id(&self, id: Ulid) -> Option<IdClaim<'_>> {
        match self.claims.entry(id) {
            Entry::Occupied(_) => None,
            Entry::Vacant(slot) => {
                if self.placement.contains_key(&id) {
                    return None;
                }
                slot.insert(());
                Some(IdClaim { claims: &self.claims, id })
            }
        }
    }

    pub fn appointment_count(&self) -> usize {
        self.placement.len()
    }

    pub fn unassigned(&self) -> &SharedPool {
        &self.unassigned
    }

    /// Insert/replace on a locked timeline and index it there.
    pub(crate) fn commit_locked(&self, timeline: &mut Timeline, appointment: Appointment) {
        self.placement.insert(appointment.id, Some(timeline.id));
        timeline.commit(appointment);
    }

    /// Insert/replace in the locked unassigned pool.
    pub(crate) fn park_locked(
        &self,
        pool: &mut HashMap<Ulid, Appointment>,
        mut appointment: Appointment,
    ) {
        appointment.resource_id = None;
        self.placement.insert(appointment.id, None);
        pool.insert(appointment.id, appointment);
    }

    // ── Store operations ─────────────────────────────────────

    /// Occupying appointments overlapping the day range, sorted by start.
    pub async fn intervals_for(
        &self,
        resource_id: Ulid,
        range: &DateRange,
    ) -> Result<Vec<Appointment>, EngineError> {
        let tl = self
            .get_timeline(&resource_id)
            .ok_or(EngineError::ResourceNotFound(resource_id))?;
        let guard = tl.read().await;
        Ok(guard.intervals_for(range).to_vec())
    }

    /// Insert or replace by appointment id, without validation.
    pub async fn commit(&self, resource_id: Ulid, appointment: Appointment) -> Result<(), EngineError> {
        let tl = self
            .get_timeline(&resource_id)
            .ok_or(EngineError::ResourceNotFound(resource_id))?;
        let mut guard = tl.write().await;
        self.commit_locked(&mut guard, appointment);
        Ok(())
    }

    /// Mark an appointment cancelled. Unknown or already released ids are a
    /// no-op; returns whether anything changed.
    pub async fn release(&self, resource_id: Ulid, appointment_id: Ulid) -> Result<bool, EngineError> {
        let tl = self
            .get_timeline(&resource_id)
            .ok_or(EngineError::ResourceNotFound(resource_id))?;
        let mut guard = tl.write().await;
        Ok(guard.release(appointment_id, AppointmentStatus::Cancelled))
    }
}
