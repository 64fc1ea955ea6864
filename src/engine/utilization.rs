use std::collections::BTreeMap;

use chrono::NaiveDate;
use serde::Serialize;
use ulid::Ulid;

use crate::model::*;

/// Load for one resource on one day.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UtilizationReport {
    pub resource_id: Ulid,
    pub day: NaiveDate,
    pub booked_minutes: i64,
    pub working_minutes: i64,
    /// `booked / working`, clamped to `[0, 1]`; 0 on closed days.
    pub ratio: f64,
    /// Appointments starting that day, released ones included.
    pub appointment_count: usize,
    pub by_status: BTreeMap<AppointmentStatus, usize>,
}

impl UtilizationReport {
    pub fn percent(&self) -> f64 {
        self.ratio * 100.0
    }
}

pub fn utilization(timeline: &Timeline, day: NaiveDate) -> UtilizationReport {
    let working_minutes = timeline.hours.working_minutes(day);
    let mut booked_minutes = 0;
    let mut by_status = BTreeMap::new();
    let mut appointment_count = 0;

    for appointment in timeline.starting_on(day) {
        appointment_count += 1;
        *by_status.entry(appointment.status).or_insert(0) += 1;
        if appointment.occupies() {
            booked_minutes += appointment.duration_minutes;
        }
    }

    let ratio = if working_minutes > 0 {
        (booked_minutes as f64 / working_minutes as f64).clamp(0.0, 1.0)
    } else {
        0.0
    };

    UtilizationReport {
        resource_id: timeline.id,
        day,
        booked_minutes,
        working_minutes,
        ratio,
        appointment_count,
        by_status,
    }
}

/// Salon-wide appointment counts for a day.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DailyCounts {
    pub day: Option<NaiveDate>,
    pub total: usize,
    pub by_status: BTreeMap<AppointmentStatus, usize>,
}

impl DailyCounts {
    pub fn for_day(day: NaiveDate) -> Self {
        Self { day: Some(day), ..Self::default() }
    }

    pub fn add<'a>(&mut self, appointments: impl IntoIterator<Item = &'a Appointment>) {
        for appointment in appointments {
            self.total += 1;
            *self.by_status.entry(appointment.status).or_insert(0) += 1;
        }
    }

    pub fn count(&self, status: AppointmentStatus) -> usize {
        self.by_status.get(&status).copied().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::fixtures::*;

    const MON: u32 = 3;

    #[test]
    fn ratio_counts_only_occupying() {
        let mut tl = Timeline::new(Ulid::new(), None, nine_to_six());
        tl.commit(appt(at(MON, 9, 0), 90));
        tl.commit(appt(at(MON, 13, 0), 45));
        let cancelled = appt(at(MON, 15, 0), 60);
        let cancelled_id = cancelled.id;
        tl.commit(cancelled);
        tl.release(cancelled_id, AppointmentStatus::Cancelled);
        tl.commit(appt(at(4, 9, 0), 60));

        let report = utilization(&tl, date(MON));
        assert_eq!(report.booked_minutes, 135);
        assert_eq!(report.working_minutes, 540);
        assert!((report.ratio - 0.25).abs() < 1e-9);
        assert!((report.percent() - 25.0).abs() < 1e-9);
        assert_eq!(report.appointment_count, 3);
        assert_eq!(report.by_status.get(&AppointmentStatus::Scheduled), Some(&2));
        assert_eq!(report.by_status.get(&AppointmentStatus::Cancelled), Some(&1));
    }

    #[test]
    fn closed_day_is_zero() {
        let tl = Timeline::new(Ulid::new(), None, nine_to_six());
        let report = utilization(&tl, date(8));
        assert_eq!(report.working_minutes, 0);
        assert_eq!(report.ratio, 0.0);
    }

    #[test]
    fn ratio_is_clamped() {
        // Hours shrank after bookings were made.
        let mut tl = Timeline::new(Ulid::new(), None, nine_to_six());
        tl.commit(appt(at(MON, 9, 0), 540));
        tl.hours = WorkingHours::weekdays(DayHours::new(hm(9, 0), hm(12, 0)).unwrap());
        assert_eq!(utilization(&tl, date(MON)).ratio, 1.0);
    }

    #[test]
    fn daily_counts_accumulate() {
        let a = appt(at(MON, 9, 0), 30);
        let mut b = appt(at(MON, 10, 0), 30);
        b.status = AppointmentStatus::NoShow;
        let mut counts = DailyCounts::for_day(date(MON));
        counts.add([&a, &b]);
        assert_eq!(counts.total, 2);
        assert_eq!(counts.count(AppointmentStatus::Scheduled), 1);
        assert_eq!(counts.count(AppointmentStatus::NoShow), 1);
        assert_eq!(counts.count(AppointmentStatus::Completed), 0);
    }
}
