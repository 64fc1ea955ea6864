use std::fmt;

use chrono::{Datelike, Duration, NaiveDate, NaiveDateTime, NaiveTime, Weekday};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Half-open interval `[start, end)` in salon-local wall-clock time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Span {
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
}

impl Span {
    pub fn new(start: NaiveDateTime, end: NaiveDateTime) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn from_minutes(start: NaiveDateTime, minutes: i64) -> Self {
        Self::new(start, start + Duration::minutes(minutes))
    }

    pub fn duration_minutes(&self) -> i64 {
        (self.end - self.start).num_minutes()
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// Returns true if `self` fully contains `other`.
    pub fn contains_span(&self, other: &Span) -> bool {
        self.start <= other.start && other.end <= self.end
    }
}

impl fmt::Display for Span {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}, {})",
            self.start.format("%Y-%m-%d %H:%M"),
            self.end.format("%Y-%m-%d %H:%M")
        )
    }
}

/// Inclusive range of calendar days.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub first: NaiveDate,
    pub last: NaiveDate,
}

impl DateRange {
    pub fn new(first: NaiveDate, last: NaiveDate) -> Self {
        debug_assert!(first <= last, "DateRange first must not be after last");
        Self { first, last }
    }

    pub fn day(day: NaiveDate) -> Self {
        Self::new(day, day)
    }

    pub fn num_days(&self) -> i64 {
        (self.last - self.first).num_days() + 1
    }

    pub fn days(self) -> impl Iterator<Item = NaiveDate> {
        let last = self.last;
        self.first.iter_days().take_while(move |d| *d <= last)
    }

    /// Midnight of `first` to midnight after `last`.
    pub fn span(&self) -> Span {
        Span::new(
            self.first.and_time(NaiveTime::default()),
            self.last.and_time(NaiveTime::default()) + Duration::days(1),
        )
    }
}

// ── Working hours ────────────────────────────────────────────────

/// Opening window for one weekday. Always `open < close`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DayHours {
    pub open: NaiveTime,
    pub close: NaiveTime,
}

impl DayHours {
    pub fn new(open: NaiveTime, close: NaiveTime) -> Option<Self> {
        (open < close).then_some(Self { open, close })
    }

    pub fn minutes(&self) -> i64 {
        (self.close - self.open).num_minutes()
    }
}

/// Per-weekday open/close policy, indexed from Monday. `None` = closed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkingHours {
    days: [Option<DayHours>; 7],
}

impl WorkingHours {
    pub fn closed() -> Self {
        Self::default()
    }

    /// Same hours Monday through Friday, closed on weekends.
    pub fn weekdays(hours: DayHours) -> Self {
        let mut wh = Self::closed();
        for day in [Weekday::Mon, Weekday::Tue, Weekday::Wed, Weekday::Thu, Weekday::Fri] {
            wh.set(day, Some(hours));
        }
        wh
    }

    pub fn with_day(mut self, weekday: Weekday, hours: Option<DayHours>) -> Self {
        self.set(weekday, hours);
        self
    }

    pub fn set(&mut self, weekday: Weekday, hours: Option<DayHours>) {
        self.days[weekday.num_days_from_monday() as usize] = hours;
    }

    pub fn for_weekday(&self, weekday: Weekday) -> Option<DayHours> {
        self.days[weekday.num_days_from_monday() as usize]
    }

    /// Concrete working window on `date`, if the resource works that day.
    pub fn window_on(&self, date: NaiveDate) -> Option<Span> {
        self.for_weekday(date.weekday())
            .map(|h| Span::new(date.and_time(h.open), date.and_time(h.close)))
    }

    pub fn working_minutes(&self, date: NaiveDate) -> i64 {
        self.for_weekday(date.weekday()).map_or(0, |h| h.minutes())
    }
}

// ── Appointments ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum AppointmentStatus {
    Scheduled,
    Confirmed,
    InProgress,
    Completed,
    Cancelled,
    NoShow,
}

impl AppointmentStatus {
    pub const ALL: [AppointmentStatus; 6] = [
        AppointmentStatus::Scheduled,
        AppointmentStatus::Confirmed,
        AppointmentStatus::InProgress,
        AppointmentStatus::Completed,
        AppointmentStatus::Cancelled,
        AppointmentStatus::NoShow,
    ];

    /// Cancelled and no-show appointments no longer hold timeline capacity.
    pub fn occupies(self) -> bool {
        !matches!(self, AppointmentStatus::Cancelled | AppointmentStatus::NoShow)
    }

    pub fn can_transition_to(self, next: AppointmentStatus) -> bool {
        use AppointmentStatus::*;
        matches!(
            (self, next),
            (Scheduled, Confirmed)
                | (Scheduled, InProgress)
                | (Confirmed, InProgress)
                | (InProgress, Completed)
                | (Scheduled | Confirmed, Cancelled | NoShow)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AppointmentStatus::Scheduled => "scheduled",
            AppointmentStatus::Confirmed => "confirmed",
            AppointmentStatus::InProgress => "in_progress",
            AppointmentStatus::Completed => "completed",
            AppointmentStatus::Cancelled => "cancelled",
            AppointmentStatus::NoShow => "no_show",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        let normalized = s.trim().to_lowercase().replace(['-', ' '], "_");
        Self::ALL.into_iter().find(|st| st.as_str() == normalized)
    }
}

impl fmt::Display for AppointmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The committed unit on a timeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Appointment {
    pub id: Ulid,
    /// `None` until a staff member is assigned.
    pub resource_id: Option<Ulid>,
    pub start: NaiveDateTime,
    pub duration_minutes: i64,
    pub status: AppointmentStatus,
    pub service_ref: Option<String>,
    pub client_ref: Option<String>,
    pub pet_ref: Option<String>,
}

impl Appointment {
    pub fn end(&self) -> NaiveDateTime {
        self.start + Duration::minutes(self.duration_minutes)
    }

    pub fn span(&self) -> Span {
        Span::from_minutes(self.start, self.duration_minutes)
    }

    pub fn occupies(&self) -> bool {
        self.status.occupies()
    }
}

/// A booking request as handed to the coordinator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppointmentRequest {
    pub id: Ulid,
    pub resource_id: Option<Ulid>,
    pub start: NaiveDateTime,
    pub duration_minutes: i64,
    pub service_ref: Option<String>,
    pub client_ref: Option<String>,
    pub pet_ref: Option<String>,
}

impl AppointmentRequest {
    pub fn new(id: Ulid, resource_id: Option<Ulid>, start: NaiveDateTime, duration_minutes: i64) -> Self {
        Self {
            id,
            resource_id,
            start,
            duration_minutes,
            service_ref: None,
            client_ref: None,
            pet_ref: None,
        }
    }

    pub(crate) fn into_appointment(self) -> Appointment {
        Appointment {
            id: self.id,
            resource_id: self.resource_id,
            start: self.start,
            duration_minutes: self.duration_minutes,
            status: AppointmentStatus::Scheduled,
            service_ref: self.service_ref,
            client_ref: self.client_ref,
            pet_ref: self.pet_ref,
        }
    }
}

/// Move and/or resize. Fields left `None` keep their current value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Reschedule {
    pub resource_id: Option<Ulid>,
    pub start: Option<NaiveDateTime>,
    pub duration_minutes: Option<i64>,
}

impl Reschedule {
    pub fn move_to(start: NaiveDateTime) -> Self {
        Self { start: Some(start), ..Self::default() }
    }

    pub fn resize(duration_minutes: i64) -> Self {
        Self { duration_minutes: Some(duration_minutes), ..Self::default() }
    }

    pub fn reassign(resource_id: Ulid) -> Self {
        Self { resource_id: Some(resource_id), ..Self::default() }
    }

    pub fn on(mut self, resource_id: Ulid) -> Self {
        self.resource_id = Some(resource_id);
        self
    }
}

// ── Availability ─────────────────────────────────────────────────

/// Which staff a slot search may draw from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceSelector {
    Specific(Ulid),
    AnyOf(Vec<Ulid>),
    AnyAvailable,
}

/// An unbooked candidate interval. Never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Slot {
    pub resource_id: Ulid,
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
    pub score: i64,
}

impl Slot {
    pub fn span(&self) -> Span {
        Span::new(self.start, self.end)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotQuery {
    pub selector: ResourceSelector,
    pub dates: DateRange,
    pub duration_minutes: i64,
    pub grid_step_minutes: i64,
    pub buffer_before_minutes: i64,
    pub buffer_after_minutes: i64,
}

impl SlotQuery {
    pub fn new(selector: ResourceSelector, dates: DateRange, duration_minutes: i64, grid_step_minutes: i64) -> Self {
        Self {
            selector,
            dates,
            duration_minutes,
            grid_step_minutes,
            buffer_before_minutes: 0,
            buffer_after_minutes: 0,
        }
    }

    pub fn with_buffers(mut self, before: i64, after: i64) -> Self {
        self.buffer_before_minutes = before;
        self.buffer_after_minutes = after;
        self
    }
}

// ── Change events ────────────────────────────────────────────────

/// Emitted after every committed mutation, for notification and calendar collaborators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BookingChanged {
    pub appointment_id: Ulid,
    pub resource_id: Option<Ulid>,
    pub previous_resource_id: Option<Ulid>,
    pub previous_interval: Option<Span>,
    pub new_interval: Span,
    pub status: AppointmentStatus,
}

/// Journal record format. Flat, one variant per committed change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    ResourceCreated {
        id: Ulid,
        name: Option<String>,
        hours: WorkingHours,
    },
    ResourceUpdated {
        id: Ulid,
        name: Option<String>,
        hours: WorkingHours,
        active: bool,
    },
    ServiceRegistered {
        id: Ulid,
        name: Option<String>,
        duration_minutes: i64,
    },
    AppointmentBooked {
        appointment: Appointment,
    },
    AppointmentRescheduled {
        id: Ulid,
        from: Option<Ulid>,
        to: Option<Ulid>,
        start: NaiveDateTime,
        duration_minutes: i64,
    },
    AppointmentStatusChanged {
        id: Ulid,
        resource_id: Option<Ulid>,
        status: AppointmentStatus,
    },
}

// ── Per-resource state ───────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct Timeline {
    pub id: Ulid,
    pub name: Option<String>,
    pub hours: WorkingHours,
    pub active: bool,
    /// Occupying appointments sorted by start. Pairwise disjoint, so ends are sorted as well.
    occupied: Vec<Appointment>,
    /// Cancelled / no-show history, kept for reporting.
    released: Vec<Appointment>,
}

impl Timeline {
    pub fn new(id: Ulid, name: Option<String>, hours: WorkingHours) -> Self {
        Self {
            id,
            name,
            hours,
            active: true,
            occupied: Vec::new(),
            released: Vec::new(),
        }
    }

    pub fn occupied(&self) -> &[Appointment] {
        &self.occupied
    }

    pub fn released(&self) -> &[Appointment] {
        &self.released
    }

    pub fn len(&self) -> usize {
        self.occupied.len() + self.released.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, id: Ulid) -> Option<&Appointment> {
        self.occupied
            .iter()
            .chain(self.released.iter())
            .find(|a| a.id == id)
    }

    pub fn contains(&self, id: Ulid) -> bool {
        self.get(id).is_some()
    }

    /// Occupying appointments overlapping `query`, in start order.
    /// Binary search on both bounds: O(log n) plus the size of the result.
    pub fn overlapping(&self, query: &Span) -> &[Appointment] {
        let left = self.occupied.partition_point(|a| a.end() <= query.start);
        let right = self.occupied.partition_point(|a| a.start < query.end);
        if left >= right {
            return &[];
        }
        &self.occupied[left..right]
    }

    pub fn intervals_for(&self, range: &DateRange) -> &[Appointment] {
        self.overlapping(&range.span())
    }

    /// Insert or replace by id. Caller has validated that an occupying
    /// appointment does not overlap anything else on this timeline.
    pub fn commit(&mut self, mut appointment: Appointment) {
        self.remove(appointment.id);
        appointment.resource_id = Some(self.id);
        if appointment.occupies() {
            debug_assert!(
                self.overlapping(&appointment.span()).is_empty(),
                "commit would overlap an occupying appointment"
            );
            let pos = self
                .occupied
                .partition_point(|a| a.start < appointment.start);
            self.occupied.insert(pos, appointment);
        } else {
            self.released.push(appointment);
        }
    }

    /// Move an occupying appointment to released history with `status`.
    /// Returns false when the appointment is not occupying here (already released or unknown).
    pub fn release(&mut self, id: Ulid, status: AppointmentStatus) -> bool {
        debug_assert!(!status.occupies());
        match self.occupied.iter().position(|a| a.id == id) {
            Some(pos) => {
                let mut appointment = self.occupied.remove(pos);
                appointment.status = status;
                self.released.push(appointment);
                true
            }
            None => false,
        }
    }

    /// Update status in place for a transition that keeps the appointment occupying.
    pub fn set_status(&mut self, id: Ulid, status: AppointmentStatus) -> bool {
        match self.occupied.iter_mut().find(|a| a.id == id) {
            Some(a) => {
                a.status = status;
                true
            }
            None => false,
        }
    }

    /// Drop an appointment from this timeline entirely (it moved elsewhere).
    pub fn remove(&mut self, id: Ulid) -> Option<Appointment> {
        if let Some(pos) = self.occupied.iter().position(|a| a.id == id) {
            return Some(self.occupied.remove(pos));
        }
        self.released
            .iter()
            .position(|a| a.id == id)
            .map(|pos| self.released.remove(pos))
    }

    /// Every appointment (occupying or not) starting on `day`.
    pub fn starting_on(&self, day: NaiveDate) -> impl Iterator<Item = &Appointment> {
        self.occupied
            .iter()
            .chain(self.released.iter())
            .filter(move |a| a.start.date() == day)
    }

    pub fn all(&self) -> impl Iterator<Item = &Appointment> {
        self.occupied.iter().chain(self.released.iter())
    }
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceInfo {
    pub id: Ulid,
    pub name: Option<String>,
    pub hours: WorkingHours,
    pub active: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceInfo {
    pub id: Ulid,
    pub name: Option<String>,
    pub duration_minutes: i64,
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;

    pub fn at(day: u32, hour: u32, minute: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2030, 6, day)
            .unwrap()
            .and_hms_opt(hour, minute, 0)
            .unwrap()
    }

    pub fn date(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2030, 6, day).unwrap()
    }

    pub fn hm(hour: u32, minute: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(hour, minute, 0).unwrap()
    }

    /// 09:00–18:00 Monday to Friday.
    pub fn nine_to_six() -> WorkingHours {
        WorkingHours::weekdays(DayHours::new(hm(9, 0), hm(18, 0)).unwrap())
    }

    pub fn appt(start: NaiveDateTime, minutes: i64) -> Appointment {
        Appointment {
            id: Ulid::new(),
            resource_id: None,
            start,
            duration_minutes: minutes,
            status: AppointmentStatus::Scheduled,
            service_ref: None,
            client_ref: None,
            pet_ref: None,
        }
    }
}
