use std::collections::{BTreeMap, HashMap};

use chrono::{Duration, NaiveDateTime, Weekday};
use tokio::sync::{OwnedMutexGuard, OwnedRwLockWriteGuard};
use tracing::{debug, info};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::observability::MUTATIONS_TOTAL;

use super::conflict::{check_calendar, check_not_past, validate_duration, validate_placement};
use super::{Engine, EngineError};

/// Timelines (sorted by id) and, for unassigned appointments, the pool,
/// all held for one reschedule or status change.
struct PlacementLock {
    source: Option<Ulid>,
    timelines: BTreeMap<Ulid, OwnedRwLockWriteGuard<Timeline>>,
    pool: Option<OwnedMutexGuard<HashMap<Ulid, Appointment>>>,
}

impl PlacementLock {
    fn current(&self, id: Ulid) -> Option<&Appointment> {
        match self.source {
            Some(rid) => self.timelines.get(&rid).and_then(|tl| tl.get(id)),
            None => self.pool.as_ref().and_then(|pool| pool.get(&id)),
        }
    }
}

fn record_outcome<T>(op: &'static str, result: &Result<T, EngineError>) {
    let outcome = match result {
        Ok(_) => "committed",
        Err(e) => e.kind(),
    };
    metrics::counter!(MUTATIONS_TOTAL, "op" => op, "outcome" => outcome).increment(1);
    match result {
        Ok(_) => debug!(op, "committed"),
        Err(e) => debug!(op, error = %e, "rejected"),
    }
}

fn check_name(name: &Option<String>) -> Result<(), EngineError> {
    match name {
        Some(n) if n.len() > MAX_NAME_LEN => Err(EngineError::LimitExceeded("name too long")),
        _ => Ok(()),
    }
}

fn check_refs(request: &AppointmentRequest) -> Result<(), EngineError> {
    let too_long = [&request.service_ref, &request.client_ref, &request.pet_ref]
        .into_iter()
        .flatten()
        .any(|r| r.len() > MAX_REF_LEN);
    if too_long {
        return Err(EngineError::LimitExceeded("reference too long"));
    }
    Ok(())
}

fn info_of(timeline: &Timeline) -> ResourceInfo {
    ResourceInfo {
        id: timeline.id,
        name: timeline.name.clone(),
        hours: timeline.hours.clone(),
        active: timeline.active,
    }
}

impl Engine {
    // ── Staff and services ───────────────────────────────────

    pub async fn create_resource(
        &self,
        id: Ulid,
        name: Option<String>,
        hours: WorkingHours,
    ) -> Result<(), EngineError> {
        let _directory = self.directory.write().await;
        if self.store.resource_count() >= MAX_RESOURCES_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many resources"));
        }
        check_name(&name)?;
        if self.store.contains_resource(&id) {
            return Err(EngineError::AlreadyExists(id));
        }

        let event = Event::ResourceCreated { id, name: name.clone(), hours: hours.clone() };
        self.journal_append(&event).await?;
        self.store.insert_timeline(Timeline::new(id, name, hours));
        info!(resource = %id, "resource created");
        Ok(())
    }

    /// Lock, edit a copy of the resource's settings, journal, apply.
    async fn modify_resource(
        &self,
        id: Ulid,
        edit: impl FnOnce(&mut ResourceInfo),
    ) -> Result<ResourceInfo, EngineError> {
        let tl = self
            .store
            .get_timeline(&id)
            .ok_or(EngineError::ResourceNotFound(id))?;
        let mut guard = tl.write().await;
        let mut updated = info_of(&guard);
        edit(&mut updated);
        check_name(&updated.name)?;

        let event = Event::ResourceUpdated {
            id,
            name: updated.name.clone(),
            hours: updated.hours.clone(),
            active: updated.active,
        };
        self.journal_append(&event).await?;
        guard.name = updated.name.clone();
        guard.hours = updated.hours.clone();
        guard.active = updated.active;
        Ok(updated)
    }

    pub async fn update_resource(
        &self,
        id: Ulid,
        name: Option<String>,
        hours: WorkingHours,
        active: bool,
    ) -> Result<ResourceInfo, EngineError> {
        self.modify_resource(id, |r| {
            r.name = name;
            r.hours = hours;
            r.active = active;
        })
        .await
    }

    /// Change one weekday. `None` closes it. Existing appointments are kept.
    pub async fn set_working_hours(
        &self,
        id: Ulid,
        weekday: Weekday,
        hours: Option<DayHours>,
    ) -> Result<ResourceInfo, EngineError> {
        self.modify_resource(id, |r| r.hours.set(weekday, hours)).await
    }

    /// Stop offering a staff member. Booked appointments stay on the timeline.
    pub async fn deactivate_resource(&self, id: Ulid) -> Result<ResourceInfo, EngineError> {
        let info = self.modify_resource(id, |r| r.active = false).await?;
        info!(resource = %id, "resource deactivated");
        Ok(info)
    }

    /// Register or replace a catalog entry.
    pub async fn register_service(
        &self,
        id: Ulid,
        name: Option<String>,
        duration_minutes: i64,
    ) -> Result<(), EngineError> {
        validate_duration(duration_minutes, self.config.max_duration_minutes)?;
        check_name(&name)?;
        let _directory = self.directory.read().await;
        if !self.services.contains_key(&id) && self.services.len() >= MAX_SERVICES_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many services"));
        }
        let event = Event::ServiceRegistered { id, name: name.clone(), duration_minutes };
        self.journal_append(&event).await?;
        self.services.insert(id, ServiceInfo { id, name, duration_minutes });
        Ok(())
    }

    // ── Booking ──────────────────────────────────────────────

    /// Validate and commit a new appointment. Without a resource it lands in
    /// the unassigned pool and only the duration and past-date rules apply.
    pub async fn book(&self, request: AppointmentRequest) -> Result<Appointment, EngineError> {
        let result = self.try_book(request).await;
        record_outcome("book", &result);
        result
    }

    async fn try_book(&self, request: AppointmentRequest) -> Result<Appointment, EngineError> {
        let id = request.id;
        debug!(appointment = %id, resource = ?request.resource_id, "booking received");
        validate_duration(request.duration_minutes, self.config.max_duration_minutes)?;
        check_calendar(request.start.date())?;
        check_refs(&request)?;
        // Held until the appointment is indexed or the booking fails.
        let _claim = self.store.claim_id(id).ok_or(EngineError::AlreadyExists(id))?;

        let now = self.now();
        let grace = self.config.past_grace_minutes;
        let appointment = request.into_appointment();
        let span = appointment.span();

        match appointment.resource_id {
            Some(rid) => {
                let tl = self
                    .store
                    .get_timeline(&rid)
                    .ok_or(EngineError::ResourceNotFound(rid))?;
                let mut guard = tl.write().await;
                if !guard.active {
                    return Err(EngineError::ResourceNotFound(rid));
                }
                if guard.len() >= MAX_APPOINTMENTS_PER_RESOURCE {
                    return Err(EngineError::LimitExceeded("too many appointments on resource"));
                }
                debug!(appointment = %id, "validating");
                validate_placement(
                    &guard,
                    &span,
                    None,
                    Some((now, grace)),
                    self.config.max_duration_minutes,
                )?;
                self.journal_append(&Event::AppointmentBooked { appointment: appointment.clone() })
                    .await?;
                self.store.commit_locked(&mut guard, appointment.clone());
            }
            None => {
                let mut pool = self.store.unassigned().lock().await;
                check_not_past(span.start, now, grace)?;
                self.journal_append(&Event::AppointmentBooked { appointment: appointment.clone() })
                    .await?;
                self.store.park_locked(&mut pool, appointment.clone());
            }
        }

        self.emit(BookingChanged {
            appointment_id: id,
            resource_id: appointment.resource_id,
            previous_resource_id: None,
            previous_interval: None,
            new_interval: span,
            status: appointment.status,
        });
        Ok(appointment)
    }

    // ── Reschedule ───────────────────────────────────────────

    /// Lock the appointment's current home plus `target`, in id order, then
    /// the pool. Retries if the appointment moved while we waited.
    async fn lock_placement(
        &self,
        id: Ulid,
        target: Option<Ulid>,
    ) -> Result<PlacementLock, EngineError> {
        for attempt in 0..MAX_PLACEMENT_RETRIES {
            let source = self.store.placement(&id).ok_or(EngineError::NotFound(id))?;
            let mut ids: Vec<Ulid> = source.into_iter().chain(target).collect();
            ids.sort();
            ids.dedup();

            let mut timelines = BTreeMap::new();
            for rid in ids {
                let tl = self
                    .store
                    .get_timeline(&rid)
                    .ok_or(EngineError::ResourceNotFound(rid))?;
                timelines.insert(rid, tl.write_owned().await);
            }
            let pool = match source {
                None => Some(self.store.unassigned().clone().lock_owned().await),
                Some(_) => None,
            };

            if self.store.placement(&id) == Some(source) {
                return Ok(PlacementLock { source, timelines, pool });
            }
            debug!(appointment = %id, attempt, "appointment moved while locking; retrying");
        }
        Err(EngineError::LimitExceeded("appointment placement kept changing"))
    }

    /// Atomic move and/or resize, optionally to another staff member.
    /// On failure the original appointment is untouched.
    pub async fn reschedule(&self, id: Ulid, change: Reschedule) -> Result<Appointment, EngineError> {
        let result = self.try_reschedule(id, change).await;
        record_outcome("reschedule", &result);
        result
    }

    async fn try_reschedule(&self, id: Ulid, change: Reschedule) -> Result<Appointment, EngineError> {
        debug!(appointment = %id, ?change, "reschedule received");
        if let Some(minutes) = change.duration_minutes {
            validate_duration(minutes, self.config.max_duration_minutes)?;
        }

        let mut lock = self.lock_placement(id, change.resource_id).await?;
        let source = lock.source;
        let target = change.resource_id.or(source);
        let current = lock.current(id).cloned().ok_or(EngineError::NotFound(id))?;
        if !current.occupies() {
            return Err(EngineError::AppointmentClosed(id));
        }

        let mut updated = current.clone();
        updated.start = change.start.unwrap_or(current.start);
        updated.duration_minutes = change.duration_minutes.unwrap_or(current.duration_minutes);
        check_calendar(updated.start.date())?;
        let span = updated.span();
        // Only a new start is held to the past-date rule.
        let past_check = match (change.start, current.status) {
            (None, _) | (_, AppointmentStatus::Completed) => None,
            _ => Some((self.now(), self.config.past_grace_minutes)),
        };

        debug!(appointment = %id, "validating");
        match target {
            Some(rid) => {
                let tl = lock
                    .timelines
                    .get(&rid)
                    .ok_or(EngineError::ResourceNotFound(rid))?;
                if target != source {
                    if !tl.active {
                        return Err(EngineError::ResourceNotFound(rid));
                    }
                    if tl.len() >= MAX_APPOINTMENTS_PER_RESOURCE {
                        return Err(EngineError::LimitExceeded("too many appointments on resource"));
                    }
                }
                validate_placement(tl, &span, Some(id), past_check, self.config.max_duration_minutes)?;
            }
            None => {
                if let Some((now, grace)) = past_check {
                    check_not_past(span.start, now, grace)?;
                }
            }
        }

        self.journal_append(&Event::AppointmentRescheduled {
            id,
            from: source,
            to: target,
            start: updated.start,
            duration_minutes: updated.duration_minutes,
        })
        .await?;

        match source {
            Some(rid) => {
                if let Some(tl) = lock.timelines.get_mut(&rid) {
                    tl.remove(id);
                }
            }
            None => {
                if let Some(pool) = lock.pool.as_mut() {
                    pool.remove(&id);
                }
            }
        }
        match target {
            Some(rid) => {
                if let Some(tl) = lock.timelines.get_mut(&rid) {
                    self.store.commit_locked(tl, updated.clone());
                    updated.resource_id = Some(rid);
                }
            }
            None => {
                if let Some(pool) = lock.pool.as_mut() {
                    self.store.park_locked(pool, updated.clone());
                }
            }
        }
        drop(lock);

        self.emit(BookingChanged {
            appointment_id: id,
            resource_id: target,
            previous_resource_id: source,
            previous_interval: Some(current.span()),
            new_interval: span,
            status: updated.status,
        });
        Ok(updated)
    }

    pub async fn move_appointment(
        &self,
        id: Ulid,
        start: NaiveDateTime,
    ) -> Result<Appointment, EngineError> {
        self.reschedule(id, Reschedule::move_to(start)).await
    }

    pub async fn resize_appointment(
        &self,
        id: Ulid,
        duration_minutes: i64,
    ) -> Result<Appointment, EngineError> {
        self.reschedule(id, Reschedule::resize(duration_minutes)).await
    }

    /// Give an appointment (typically from the unassigned pool) to a staff member.
    pub async fn assign(&self, id: Ulid, resource_id: Ulid) -> Result<Appointment, EngineError> {
        self.reschedule(id, Reschedule::reassign(resource_id)).await
    }

    // ── Status ───────────────────────────────────────────────

    /// Apply a lifecycle transition. Cancelling or no-showing an appointment
    /// already in that state is a no-op.
    pub async fn update_status(
        &self,
        id: Ulid,
        next: AppointmentStatus,
    ) -> Result<Appointment, EngineError> {
        let result = self.try_update_status(id, next).await;
        record_outcome("status", &result);
        result
    }

    async fn try_update_status(
        &self,
        id: Ulid,
        next: AppointmentStatus,
    ) -> Result<Appointment, EngineError> {
        debug!(appointment = %id, status = %next, "status change received");
        let mut lock = self.lock_placement(id, None).await?;
        let current = lock.current(id).cloned().ok_or(EngineError::NotFound(id))?;
        if current.status == next && !next.occupies() {
            return Ok(current);
        }
        if !current.status.can_transition_to(next) {
            return Err(EngineError::InvalidTransition { from: current.status, to: next });
        }

        let source = lock.source;
        self.journal_append(&Event::AppointmentStatusChanged { id, resource_id: source, status: next })
            .await?;

        match source {
            Some(rid) => {
                if let Some(tl) = lock.timelines.get_mut(&rid) {
                    if next.occupies() {
                        tl.set_status(id, next);
                    } else {
                        tl.release(id, next);
                    }
                }
            }
            None => {
                if let Some(entry) = lock.pool.as_mut().and_then(|pool| pool.get_mut(&id)) {
                    entry.status = next;
                }
            }
        }
        drop(lock);

        let mut updated = current;
        updated.status = next;
        self.emit(BookingChanged {
            appointment_id: id,
            resource_id: source,
            previous_resource_id: None,
            previous_interval: None,
            new_interval: updated.span(),
            status: next,
        });
        Ok(updated)
    }

    pub async fn confirm(&self, id: Ulid) -> Result<Appointment, EngineError> {
        self.update_status(id, AppointmentStatus::Confirmed).await
    }

    pub async fn start(&self, id: Ulid) -> Result<Appointment, EngineError> {
        self.update_status(id, AppointmentStatus::InProgress).await
    }

    pub async fn complete(&self, id: Ulid) -> Result<Appointment, EngineError> {
        self.update_status(id, AppointmentStatus::Completed).await
    }

    pub async fn cancel(&self, id: Ulid) -> Result<Appointment, EngineError> {
        self.update_status(id, AppointmentStatus::Cancelled).await
    }

    pub async fn mark_no_show(&self, id: Ulid) -> Result<Appointment, EngineError> {
        self.update_status(id, AppointmentStatus::NoShow).await
    }

    /// Free an appointment's time on `resource_id` by cancelling it.
    /// Unknown or already released appointments are a no-op.
    pub async fn release(&self, resource_id: Ulid, appointment_id: Ulid) -> Result<(), EngineError> {
        let result = self.try_release(resource_id, appointment_id).await;
        record_outcome("release", &result);
        result
    }

    async fn try_release(&self, resource_id: Ulid, appointment_id: Ulid) -> Result<(), EngineError> {
        let tl = self
            .store
            .get_timeline(&resource_id)
            .ok_or(EngineError::ResourceNotFound(resource_id))?;
        let mut guard = tl.write().await;
        let Some(current) = guard.get(appointment_id).filter(|a| a.occupies()).cloned() else {
            return Ok(());
        };
        let next = AppointmentStatus::Cancelled;
        if !current.status.can_transition_to(next) {
            return Err(EngineError::InvalidTransition { from: current.status, to: next });
        }
        self.journal_append(&Event::AppointmentStatusChanged {
            id: appointment_id,
            resource_id: Some(resource_id),
            status: next,
        })
        .await?;
        guard.release(appointment_id, next);
        drop(guard);

        self.emit(BookingChanged {
            appointment_id,
            resource_id: Some(resource_id),
            previous_resource_id: None,
            previous_interval: None,
            new_interval: current.span(),
            status: next,
        });
        Ok(())
    }

    // ── Housekeeping ─────────────────────────────────────────

    /// Scheduled or confirmed appointments that started at least
    /// `after_minutes` before `now` and were never checked in.
    pub fn collect_overdue(&self, now: NaiveDateTime, after_minutes: i64) -> Vec<Ulid> {
        let cutoff = now - Duration::minutes(after_minutes);
        let mut overdue = Vec::new();
        for entry in self.store.resource_ids() {
            let Some(tl) = self.store.get_timeline(&entry) else { continue };
            if let Ok(guard) = tl.try_read() {
                let earlier = guard.occupied().partition_point(|a| a.start <= cutoff);
                overdue.extend(
                    guard.occupied()[..earlier]
                        .iter()
                        .filter(|a| {
                            matches!(
                                a.status,
                                AppointmentStatus::Scheduled | AppointmentStatus::Confirmed
                            )
                        })
                        .map(|a| a.id),
                );
            }
        }
        overdue
    }

    /// Rewrite the journal as the minimal record set for the current state.
    /// Holds the directory lock exclusively, then the timelines (in id order)
    /// and the pool, until the rewrite lands. No mutation can slip between
    /// snapshot and swap.
    pub async fn compact_journal(&self) -> Result<usize, EngineError> {
        if !self.is_persistent() {
            return Ok(0);
        }
        let directory = self.directory.write().await;
        let mut guards = Vec::new();
        for rid in self.store.resource_ids() {
            if let Some(tl) = self.store.get_timeline(&rid) {
                guards.push(tl.read_owned().await);
            }
        }
        let pool = self.store.unassigned().clone().lock_owned().await;

        let mut events = Vec::new();
        for tl in &guards {
            events.push(Event::ResourceCreated {
                id: tl.id,
                name: tl.name.clone(),
                hours: tl.hours.clone(),
            });
            if !tl.active {
                events.push(Event::ResourceUpdated {
                    id: tl.id,
                    name: tl.name.clone(),
                    hours: tl.hours.clone(),
                    active: false,
                });
            }
        }
        let mut services: Vec<ServiceInfo> = self.services.iter().map(|e| e.value().clone()).collect();
        services.sort_by_key(|s| s.id);
        events.extend(services.into_iter().map(|s| Event::ServiceRegistered {
            id: s.id,
            name: s.name,
            duration_minutes: s.duration_minutes,
        }));
        for tl in &guards {
            events.extend(tl.all().map(|a| Event::AppointmentBooked { appointment: a.clone() }));
        }
        let mut parked: Vec<&Appointment> = pool.values().collect();
        parked.sort_by_key(|a| a.id);
        events.extend(parked.into_iter().map(|a| Event::AppointmentBooked { appointment: a.clone() }));

        let count = events.len();
        self.journal_compact(events).await?;
        drop(pool);
        drop(guards);
        drop(directory);
        info!(events = count, "journal compacted");
        Ok(count)
    }
}
