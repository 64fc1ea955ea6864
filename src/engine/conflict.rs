use chrono::{Datelike, Duration, NaiveDate, NaiveDateTime};
use ulid::Ulid;

use crate::limits::{MAX_CALENDAR_YEAR, MIN_CALENDAR_YEAR};
use crate::model::*;

use super::EngineError;

// ── ConflictValidator ─────────────────────────────────────────────
//
// Pure checks run, in this order, under the timeline write lock:
// duration, past date, working hours, overlap.

pub(crate) fn validate_duration(minutes: i64, max_minutes: i64) -> Result<(), EngineError> {
    if minutes <= 0 || minutes > max_minutes {
        return Err(EngineError::InvalidDuration(minutes));
    }
    Ok(())
}

pub(crate) fn check_calendar(day: NaiveDate) -> Result<(), EngineError> {
    if !(MIN_CALENDAR_YEAR..=MAX_CALENDAR_YEAR).contains(&day.year()) {
        return Err(EngineError::InvalidQuery("date outside the supported calendar"));
    }
    Ok(())
}

pub(crate) fn check_not_past(
    start: NaiveDateTime,
    now: NaiveDateTime,
    grace_minutes: i64,
) -> Result<(), EngineError> {
    if start < now - Duration::minutes(grace_minutes) {
        return Err(EngineError::PastDateRejected { start });
    }
    Ok(())
}

/// The whole span must sit inside one day's opening window.
pub(crate) fn check_working_hours(hours: &WorkingHours, span: &Span) -> Result<(), EngineError> {
    match hours.window_on(span.start.date()) {
        Some(window) if window.contains_span(span) => Ok(()),
        _ => Err(EngineError::OutsideWorkingHours { span: *span }),
    }
}

/// First occupying appointment overlapping `span`, skipping `ignore`
/// (the appointment being moved).
pub(crate) fn check_no_overlap(
    timeline: &Timeline,
    span: &Span,
    ignore: Option<Ulid>,
) -> Result<(), EngineError> {
    match timeline
        .overlapping(span)
        .iter()
        .find(|a| Some(a.id) != ignore)
    {
        Some(hit) => Err(EngineError::OverlapConflict { with: hit.id }),
        None => Ok(()),
    }
}

/// Run every placement check for `span` on `timeline`.
pub(crate) fn validate_placement(
    timeline: &Timeline,
    span: &Span,
    ignore: Option<Ulid>,
    past_check: Option<(NaiveDateTime, i64)>,
    max_duration_minutes: i64,
) -> Result<(), EngineError> {
    validate_duration(span.duration_minutes(), max_duration_minutes)?;
    if let Some((now, grace)) = past_check {
        check_not_past(span.start, now, grace)?;
    }
    check_working_hours(&timeline.hours, span)?;
    check_no_overlap(timeline, span, ignore)
}
