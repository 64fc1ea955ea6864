use std::collections::HashMap;

use chrono::{Duration, NaiveDate};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::availability::{MergedSlots, SlotGenerator, SlotParams, TimelineSnapshot};
use super::conflict::{check_calendar, validate_duration};
use super::ranking::{rank_slots, RankingPolicy};
use super::utilization::{utilization, DailyCounts, UtilizationReport};
use super::{Engine, EngineError};

fn check_range(range: &DateRange) -> Result<(), EngineError> {
    if range.first > range.last {
        return Err(EngineError::InvalidQuery("date range ends before it starts"));
    }
    check_calendar(range.first)?;
    check_calendar(range.last)?;
    if range.num_days() > MAX_QUERY_DAYS {
        return Err(EngineError::LimitExceeded("date range too wide"));
    }
    Ok(())
}

impl Engine {
    // ── Directory ────────────────────────────────────────────

    pub async fn list_resources(&self) -> Vec<ResourceInfo> {
        let mut out = Vec::new();
        for rid in self.store.resource_ids() {
            if let Some(tl) = self.store.get_timeline(&rid) {
                let guard = tl.read().await;
                out.push(ResourceInfo {
                    id: guard.id,
                    name: guard.name.clone(),
                    hours: guard.hours.clone(),
                    active: guard.active,
                });
            }
        }
        out
    }

    pub async fn get_resource(&self, id: Ulid) -> Result<ResourceInfo, EngineError> {
        let tl = self
            .store
            .get_timeline(&id)
            .ok_or(EngineError::ResourceNotFound(id))?;
        let guard = tl.read().await;
        Ok(ResourceInfo {
            id: guard.id,
            name: guard.name.clone(),
            hours: guard.hours.clone(),
            active: guard.active,
        })
    }

    pub fn list_services(&self) -> Vec<ServiceInfo> {
        let mut services: Vec<ServiceInfo> = self.services.iter().map(|e| e.value().clone()).collect();
        services.sort_by_key(|s| s.id);
        services
    }

    pub fn service(&self, id: Ulid) -> Result<ServiceInfo, EngineError> {
        self.services
            .get(&id)
            .map(|e| e.value().clone())
            .ok_or(EngineError::NotFound(id))
    }

    // ── Timelines ────────────────────────────────────────────

    /// Occupying appointments on `resource_id` over the range, by start.
    pub async fn intervals_for(
        &self,
        resource_id: Ulid,
        range: DateRange,
    ) -> Result<Vec<Appointment>, EngineError> {
        check_range(&range)?;
        self.store.intervals_for(resource_id, &range).await
    }

    pub async fn appointment(&self, id: Ulid) -> Result<Appointment, EngineError> {
        match self.store.placement(&id).ok_or(EngineError::NotFound(id))? {
            Some(rid) => {
                let tl = self
                    .store
                    .get_timeline(&rid)
                    .ok_or(EngineError::ResourceNotFound(rid))?;
                let guard = tl.read().await;
                guard.get(id).cloned().ok_or(EngineError::NotFound(id))
            }
            None => {
                let pool = self.store.unassigned().lock().await;
                pool.get(&id).cloned().ok_or(EngineError::NotFound(id))
            }
        }
    }

    /// Appointments waiting for a staff member, by start.
    pub async fn unassigned(&self) -> Vec<Appointment> {
        let pool = self.store.unassigned().lock().await;
        let mut out: Vec<Appointment> = pool.values().cloned().collect();
        out.sort_by_key(|a| (a.start, a.id));
        out
    }

    // ── Availability ─────────────────────────────────────────

    async fn snapshot_of(
        &self,
        resource_id: Ulid,
        range: &DateRange,
    ) -> Result<Option<TimelineSnapshot>, EngineError> {
        let tl = self
            .store
            .get_timeline(&resource_id)
            .ok_or(EngineError::ResourceNotFound(resource_id))?;
        let guard = tl.read().await;
        Ok(guard
            .active
            .then(|| TimelineSnapshot::capture(&guard, range)))
    }

    /// Snapshots for every resource the selector names, in id order. A
    /// specifically named inactive resource is an error; in multi-resource
    /// searches inactive staff are skipped.
    pub async fn snapshots(
        &self,
        selector: &ResourceSelector,
        range: &DateRange,
    ) -> Result<Vec<TimelineSnapshot>, EngineError> {
        let ids = match selector {
            ResourceSelector::Specific(id) => {
                return match self.snapshot_of(*id, range).await? {
                    Some(snap) => Ok(vec![snap]),
                    None => Err(EngineError::ResourceNotFound(*id)),
                };
            }
            ResourceSelector::AnyOf(ids) => {
                if ids.len() > MAX_IN_CLAUSE_IDS {
                    return Err(EngineError::LimitExceeded("too many resource ids"));
                }
                let mut ids = ids.clone();
                ids.sort();
                ids.dedup();
                ids
            }
            ResourceSelector::AnyAvailable => self.store.resource_ids(),
        };

        let mut out = Vec::with_capacity(ids.len());
        for rid in ids {
            if let Some(snap) = self.snapshot_of(rid, range).await? {
                out.push(snap);
            }
        }
        Ok(out)
    }

    pub async fn free_windows(
        &self,
        resource_id: Ulid,
        range: DateRange,
    ) -> Result<Vec<Span>, EngineError> {
        check_range(&range)?;
        let tl = self
            .store
            .get_timeline(&resource_id)
            .ok_or(EngineError::ResourceNotFound(resource_id))?;
        let snap = {
            let guard = tl.read().await;
            TimelineSnapshot::capture(&guard, &range)
        };
        Ok(range.days().flat_map(|day| snap.free_windows(day)).collect())
    }

    fn check_slot_query(&self, query: &SlotQuery) -> Result<(), EngineError> {
        validate_duration(query.duration_minutes, self.config.max_duration_minutes)?;
        if query.grid_step_minutes <= 0 {
            return Err(EngineError::InvalidQuery("grid step must be positive"));
        }
        if query.buffer_before_minutes < 0 || query.buffer_after_minutes < 0 {
            return Err(EngineError::InvalidQuery("buffers must not be negative"));
        }
        check_range(&query.dates)
    }

    fn slot_params(&self, query: &SlotQuery) -> SlotParams {
        let not_before = self.now() - Duration::minutes(self.config.past_grace_minutes);
        SlotParams::from_query(query, Some(not_before))
    }

    /// Bookable slots in `(start, resource)` order, at most `limit`.
    pub async fn find_slots(&self, query: &SlotQuery, limit: usize) -> Result<Vec<Slot>, EngineError> {
        self.check_slot_query(query)?;
        let snapshots = self.snapshots(&query.selector, &query.dates).await?;
        let params = self.slot_params(query);
        let generators = snapshots
            .iter()
            .map(|snap| SlotGenerator::new(snap, query.dates, params))
            .collect();
        Ok(MergedSlots::new(generators)
            .take(limit.min(MAX_SLOTS_PER_QUERY))
            .collect())
    }

    /// Ranked suggestions using the engine's configured policy.
    pub async fn suggest_slots(&self, query: &SlotQuery, limit: usize) -> Result<Vec<Slot>, EngineError> {
        let policy = self.config.ranking.clone();
        self.suggest_slots_with(query, &policy, limit).await
    }

    /// Ranked suggestions. Every candidate in the range is scored, up to
    /// `MAX_RANKING_SCAN` in time order; only the best `limit` are kept.
    pub async fn suggest_slots_with(
        &self,
        query: &SlotQuery,
        policy: &RankingPolicy,
        limit: usize,
    ) -> Result<Vec<Slot>, EngineError> {
        self.check_slot_query(query)?;
        let snapshots = self.snapshots(&query.selector, &query.dates).await?;
        let params = self.slot_params(query);
        let by_resource: HashMap<Ulid, &TimelineSnapshot> = snapshots
            .iter()
            .map(|snap| (snap.resource_id, snap))
            .collect();
        let candidates = MergedSlots::new(
            snapshots
                .iter()
                .map(|snap| SlotGenerator::new(snap, query.dates, params))
                .collect(),
        )
        .take(MAX_RANKING_SCAN);
        Ok(rank_slots(candidates, &by_resource, policy, limit.min(MAX_SLOTS_PER_QUERY)))
    }

    // ── Utilization ──────────────────────────────────────────

    pub async fn utilization(
        &self,
        resource_id: Ulid,
        day: NaiveDate,
    ) -> Result<UtilizationReport, EngineError> {
        let tl = self
            .store
            .get_timeline(&resource_id)
            .ok_or(EngineError::ResourceNotFound(resource_id))?;
        let guard = tl.read().await;
        Ok(utilization(&guard, day))
    }

    /// Salon-wide counts for appointments starting on `day`, unassigned ones included.
    pub async fn daily_counts(&self, day: NaiveDate) -> DailyCounts {
        let mut counts = DailyCounts::for_day(day);
        for rid in self.store.resource_ids() {
            if let Some(tl) = self.store.get_timeline(&rid) {
                let guard = tl.read().await;
                counts.add(guard.starting_on(day));
            }
        }
        let pool = self.store.unassigned().lock().await;
        counts.add(pool.values().filter(|a| a.start.date() == day));
        counts
    }

    pub async fn today_counts(&self) -> DailyCounts {
        self.daily_counts(self.now().date()).await
    }
}
