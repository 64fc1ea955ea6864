use std::cmp::Reverse;
use std::collections::BinaryHeap;

use chrono::{Duration, NaiveDate, NaiveDateTime};
use ulid::Ulid;

use crate::model::*;

// ── Interval arithmetic ───────────────────────────────────────────

/// `base` minus `to_remove`. Both inputs sorted by start; `to_remove` may overlap itself.
pub fn subtract_intervals(base: &[Span], to_remove: &[Span]) -> Vec<Span> {
    let mut result = Vec::new();
    let mut ri = 0;

    for &b in base {
        let mut current_start = b.start;
        let current_end = b.end;

        while ri < to_remove.len() && to_remove[ri].end <= current_start {
            ri += 1;
        }

        let mut j = ri;
        while j < to_remove.len() && to_remove[j].start < current_end {
            let r = &to_remove[j];
            if r.start > current_start {
                result.push(Span::new(current_start, r.start));
            }
            current_start = current_start.max(r.end);
            j += 1;
        }

        if current_start < current_end {
            result.push(Span::new(current_start, current_end));
        }
    }

    result
}

// ── Snapshots ─────────────────────────────────────────────────────

/// What slot generation and ranking need from one timeline, copied out
/// under the read lock so the rest of the work runs lock-free.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimelineSnapshot {
    pub resource_id: Ulid,
    pub hours: WorkingHours,
    /// Occupied spans, sorted and disjoint.
    pub busy: Vec<Span>,
}

impl TimelineSnapshot {
    pub fn capture(timeline: &Timeline, range: &DateRange) -> Self {
        Self {
            resource_id: timeline.id,
            hours: timeline.hours.clone(),
            busy: timeline
                .intervals_for(range)
                .iter()
                .map(Appointment::span)
                .collect(),
        }
    }

    /// Working window on `day` minus occupied time.
    pub fn free_windows(&self, day: NaiveDate) -> Vec<Span> {
        let Some(window) = self.hours.window_on(day) else {
            return Vec::new();
        };
        let left = self.busy.partition_point(|b| b.end <= window.start);
        let right = self.busy.partition_point(|b| b.start < window.end);
        let busy = if left < right { &self.busy[left..right] } else { &[] };
        subtract_intervals(&[window], busy)
    }

    /// The free window `[g0, g1)` that fully contains `span`, if any.
    pub fn free_window_around(&self, span: &Span) -> Option<Span> {
        let window = self.hours.window_on(span.start.date())?;
        if !window.contains_span(span) {
            return None;
        }
        let before = self.busy.partition_point(|b| b.end <= span.start);
        let after = self.busy.partition_point(|b| b.start < span.end);
        if before != after {
            return None;
        }
        let g0 = match before {
            0 => window.start,
            i => self.busy[i - 1].end.max(window.start),
        };
        let g1 = self
            .busy
            .get(after)
            .map_or(window.end, |b| b.start.min(window.end));
        Some(Span::new(g0, g1))
    }
}

// ── Slot generation ───────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotParams {
    pub duration_minutes: i64,
    pub step_minutes: i64,
    pub buffer_before_minutes: i64,
    pub buffer_after_minutes: i64,
    /// Grid points earlier than this are skipped.
    pub not_before: Option<NaiveDateTime>,
}

impl SlotParams {
    pub fn from_query(query: &SlotQuery, not_before: Option<NaiveDateTime>) -> Self {
        Self {
            duration_minutes: query.duration_minutes,
            step_minutes: query.grid_step_minutes,
            buffer_before_minutes: query.buffer_before_minutes,
            buffer_after_minutes: query.buffer_after_minutes,
            not_before,
        }
    }
}

/// First grid point `origin + k * step` at or after `t`.
fn align_to_grid(origin: NaiveDateTime, step_minutes: i64, t: NaiveDateTime) -> NaiveDateTime {
    if t <= origin {
        return origin;
    }
    let step = step_minutes * 60;
    let offset = (t - origin).num_seconds();
    let k = (offset + step - 1) / step;
    origin + Duration::seconds(k * step)
}

/// Lazy slot stream for one resource over a day range.
///
/// Candidates sit on the grid `open + k * step` of each working day. When a
/// candidate's padded interval hits a busy span the cursor jumps straight to
/// the first grid point clear of it. Cloning restarts from the same position.
#[derive(Debug, Clone)]
pub struct SlotGenerator<'a> {
    snapshot: &'a TimelineSnapshot,
    params: SlotParams,
    next_day: Option<NaiveDate>,
    last_day: NaiveDate,
    window: Option<Span>,
    cursor: NaiveDateTime,
    busy_idx: usize,
}

impl<'a> SlotGenerator<'a> {
    /// `params.step_minutes` and `params.duration_minutes` must be positive.
    pub fn new(snapshot: &'a TimelineSnapshot, dates: DateRange, params: SlotParams) -> Self {
        debug_assert!(params.step_minutes > 0 && params.duration_minutes > 0);
        Self {
            snapshot,
            params,
            next_day: Some(dates.first),
            last_day: dates.last,
            window: None,
            cursor: dates.first.and_time(chrono::NaiveTime::default()),
            busy_idx: 0,
        }
    }

    fn advance_day(&mut self) -> bool {
        while let Some(day) = self.next_day {
            self.next_day = if day < self.last_day { day.succ_opt() } else { None };
            if let Some(window) = self.snapshot.hours.window_on(day) {
                self.window = Some(window);
                self.cursor = window.start;
                return true;
            }
        }
        false
    }
}

impl Iterator for SlotGenerator<'_> {
    type Item = Slot;

    fn next(&mut self) -> Option<Slot> {
        let p = self.params;
        let busy = &self.snapshot.busy;
        loop {
            let Some(window) = self.window else {
                if !self.advance_day() {
                    return None;
                }
                continue;
            };

            if let Some(not_before) = p.not_before
                && self.cursor < not_before {
                    self.cursor = align_to_grid(window.start, p.step_minutes, not_before);
                }

            let end = self.cursor + Duration::minutes(p.duration_minutes);
            let padded_end = end + Duration::minutes(p.buffer_after_minutes);
            if padded_end > window.end {
                self.window = None;
                continue;
            }
            let padded_start = self.cursor - Duration::minutes(p.buffer_before_minutes);

            while self.busy_idx < busy.len() && busy[self.busy_idx].end <= padded_start {
                self.busy_idx += 1;
            }
            if let Some(b) = busy.get(self.busy_idx)
                && b.start < padded_end {
                    let clear = b.end + Duration::minutes(p.buffer_before_minutes);
                    self.cursor = align_to_grid(window.start, p.step_minutes, clear);
                    continue;
                }

            let slot = Slot {
                resource_id: self.snapshot.resource_id,
                start: self.cursor,
                end,
                score: 0,
            };
            self.cursor += Duration::minutes(p.step_minutes);
            return Some(slot);
        }
    }
}

/// K-way merge of per-resource streams ordered by `(start, resource_id)`.
pub struct MergedSlots<'a> {
    sources: Vec<SlotGenerator<'a>>,
    heads: Vec<Option<Slot>>,
    heap: BinaryHeap<Reverse<(NaiveDateTime, Ulid, usize)>>,
}

impl<'a> MergedSlots<'a> {
    pub fn new(mut sources: Vec<SlotGenerator<'a>>) -> Self {
        let mut heads = Vec::with_capacity(sources.len());
        let mut heap = BinaryHeap::with_capacity(sources.len());
        for (idx, source) in sources.iter_mut().enumerate() {
            let head = source.next();
            if let Some(slot) = &head {
                heap.push(Reverse((slot.start, slot.resource_id, idx)));
            }
            heads.push(head);
        }
        Self { sources, heads, heap }
    }
}

impl Iterator for MergedSlots<'_> {
    type Item = Slot;

    fn next(&mut self) -> Option<Slot> {
        let Reverse((_, _, idx)) = self.heap.pop()?;
        let slot = self.heads[idx].take()?;
        if let Some(next) = self.sources[idx].next() {
            self.heap.push(Reverse((next.start, next.resource_id, idx)));
            self.heads[idx] = Some(next);
        }
        Some(slot)
    }
}
