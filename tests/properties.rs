use std::sync::Arc;

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use proptest::prelude::*;
use ulid::Ulid;

use salonbook::clock::FixedClock;
use salonbook::config::EngineConfig;
use salonbook::engine::Engine;
use salonbook::model::*;

// Monday.
fn day() -> NaiveDate {
    NaiveDate::from_ymd_opt(2030, 6, 3).unwrap()
}

fn at_minute(offset: i64) -> NaiveDateTime {
    day().and_time(NaiveTime::from_hms_opt(9, 0, 0).unwrap()) + chrono::Duration::minutes(offset)
}

fn hours() -> WorkingHours {
    let open = NaiveTime::from_hms_opt(9, 0, 0).unwrap();
    let close = NaiveTime::from_hms_opt(18, 0, 0).unwrap();
    WorkingHours::weekdays(DayHours::new(open, close).unwrap())
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap()
}

/// Engine with one staff member; `attempts` are (start offset in 15-minute
/// steps from 09:00, duration in minutes). Returns the ids that were accepted.
async fn seeded(attempts: &[(i64, i64)]) -> (Engine, Ulid, Vec<Ulid>) {
    let clock = Arc::new(FixedClock::new(at_minute(-24 * 60)));
    let engine = Engine::in_memory(EngineConfig::default()).with_clock(clock);
    let rid = Ulid::new();
    engine.create_resource(rid, None, hours()).await.unwrap();

    let mut accepted = Vec::new();
    for &(step, minutes) in attempts {
        let request = AppointmentRequest::new(Ulid::new(), Some(rid), at_minute(step * 15), minutes);
        if let Ok(a) = engine.book(request).await {
            accepted.push(a.id);
        }
    }
    (engine, rid, accepted)
}

fn attempts() -> impl Strategy<Value = Vec<(i64, i64)>> {
    prop::collection::vec((0i64..36, prop::sample::select(vec![15i64, 30, 45, 60, 90, 120])), 0..24)
}

#[derive(Debug, Clone)]
enum Op {
    /// `home` 0 and 1 are the two staff members, 2 the unassigned pool.
    Book { home: usize, step: i64, minutes: i64 },
    Move { pick: usize, step: i64 },
    Transfer { pick: usize, to: usize, step: Option<i64> },
    Resize { pick: usize, minutes: i64 },
    Cancel { pick: usize },
}

fn ops() -> impl Strategy<Value = Vec<Op>> {
    let minutes = || prop::sample::select(vec![15i64, 30, 45, 60, 90, 120]);
    let op = prop_oneof![
        3 => (0usize..3, 0i64..36, minutes())
            .prop_map(|(home, step, minutes)| Op::Book { home, step, minutes }),
        1 => (any::<usize>(), 0i64..36).prop_map(|(pick, step)| Op::Move { pick, step }),
        2 => (any::<usize>(), 0usize..2, prop::option::of(0i64..36))
            .prop_map(|(pick, to, step)| Op::Transfer { pick, to, step }),
        1 => (any::<usize>(), minutes()).prop_map(|(pick, minutes)| Op::Resize { pick, minutes }),
        1 => any::<usize>().prop_map(|pick| Op::Cancel { pick }),
    ];
    prop::collection::vec(op, 0..40)
}

fn chosen(ids: &[Ulid], pick: usize) -> Option<Ulid> {
    (!ids.is_empty()).then(|| ids[pick % ids.len()])
}

/// Apply `ops` to a fresh two-staff engine; failed operations are ignored.
/// Bookings at every fourth step reuse an earlier id and must be refused.
async fn replay(ops: &[Op]) -> (Engine, [Ulid; 2], Vec<Ulid>) {
    let (engine, first, _) = seeded(&[]).await;
    let second = Ulid::new();
    engine.create_resource(second, None, hours()).await.unwrap();
    let staff = [first, second];

    let mut ids: Vec<Ulid> = Vec::new();
    for (n, op) in ops.iter().enumerate() {
        match *op {
            Op::Book { home, step, minutes } => {
                let id = match chosen(&ids, n) {
                    Some(taken) if n % 4 == 0 => taken,
                    _ => Ulid::new(),
                };
                let request = AppointmentRequest::new(id, staff.get(home).copied(), at_minute(step * 15), minutes);
                if engine.book(request).await.is_ok() {
                    ids.push(id);
                }
            }
            Op::Move { pick, step } => {
                if let Some(id) = chosen(&ids, pick) {
                    let _ = engine.move_appointment(id, at_minute(step * 15)).await;
                }
            }
            Op::Transfer { pick, to, step } => {
                if let Some(id) = chosen(&ids, pick) {
                    let change = Reschedule {
                        resource_id: Some(staff[to]),
                        start: step.map(|s| at_minute(s * 15)),
                        duration_minutes: None,
                    };
                    let _ = engine.reschedule(id, change).await;
                }
            }
            Op::Resize { pick, minutes } => {
                if let Some(id) = chosen(&ids, pick) {
                    let _ = engine.resize_appointment(id, minutes).await;
                }
            }
            Op::Cancel { pick } => {
                if let Some(id) = chosen(&ids, pick) {
                    let _ = engine.cancel(id).await;
                }
            }
        }
    }
    (engine, staff, ids)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn committed_appointments_never_overlap(ops in ops()) {
        let rt = runtime();
        let (engine, staff, _) = rt.block_on(replay(&ops));
        let window = hours().window_on(day()).unwrap();

        for rid in staff {
            let booked = rt.block_on(engine.intervals_for(rid, DateRange::day(day()))).unwrap();
            for (i, a) in booked.iter().enumerate() {
                prop_assert_eq!(a.resource_id, Some(rid));
                prop_assert!(window.contains_span(&a.span()));
                for b in &booked[i + 1..] {
                    prop_assert!(!a.span().overlaps(&b.span()), "{:?} overlaps {:?}", a.span(), b.span());
                }
            }
        }
    }

    #[test]
    fn every_id_has_exactly_one_home(ops in ops()) {
        let rt = runtime();
        let (engine, staff, ids) = rt.block_on(replay(&ops));
        let mut seen = std::collections::HashMap::new();
        for rid in staff {
            let tl = engine.store.get_timeline(&rid).unwrap();
            for a in rt.block_on(tl.read()).all() {
                prop_assert!(seen.insert(a.id, Some(rid)).is_none(), "{} held twice", a.id);
            }
        }
        for a in rt.block_on(engine.unassigned()) {
            prop_assert!(seen.insert(a.id, None).is_none(), "{} held twice", a.id);
        }

        let unique: std::collections::HashSet<_> = ids.iter().collect();
        prop_assert_eq!(unique.len(), ids.len());
        prop_assert_eq!(seen.len(), ids.len());
        prop_assert_eq!(engine.store.appointment_count(), ids.len());
        for (id, home) in seen {
            prop_assert_eq!(engine.store.placement(&id), Some(home));
            let found = rt.block_on(engine.appointment(id)).unwrap();
            prop_assert_eq!(found.resource_id, home);
        }
    }

    #[test]
    fn every_accepted_booking_is_listed(attempts in attempts()) {
        let rt = runtime();
        let (engine, rid, accepted) = rt.block_on(seeded(&attempts));
        let booked = rt.block_on(engine.intervals_for(rid, DateRange::day(day()))).unwrap();
        prop_assert_eq!(booked.len(), accepted.len());
        prop_assert!(booked.windows(2).all(|w| w[0].start <= w[1].start));
    }

    #[test]
    fn offered_slots_are_bookable(attempts in attempts(), minutes in 15i64..=120) {
        let rt = runtime();
        let (engine, rid, _) = rt.block_on(seeded(&attempts));
        let booked = rt.block_on(engine.intervals_for(rid, DateRange::day(day()))).unwrap();
        let window = hours().window_on(day()).unwrap();

        let query = SlotQuery::new(ResourceSelector::Specific(rid), DateRange::day(day()), minutes, 15);
        let slots = rt.block_on(engine.find_slots(&query, 500)).unwrap();
        for slot in &slots {
            prop_assert!(window.contains_span(&slot.span()));
            prop_assert_eq!(slot.span().duration_minutes(), minutes);
            prop_assert!(booked.iter().all(|a| !a.span().overlaps(&slot.span())));
        }

        if let Some(first) = slots.first() {
            let request = AppointmentRequest::new(Ulid::new(), Some(rid), first.start, minutes);
            prop_assert!(rt.block_on(engine.book(request)).is_ok());
        }
    }

    #[test]
    fn suggestions_are_deterministic(attempts in attempts(), minutes in 15i64..=90) {
        let rt = runtime();
        let (engine, rid, _) = rt.block_on(seeded(&attempts));
        let query = SlotQuery::new(ResourceSelector::Specific(rid), DateRange::day(day()), minutes, 15);

        let first = rt.block_on(engine.suggest_slots(&query, 10)).unwrap();
        let second = rt.block_on(engine.suggest_slots(&query, 10)).unwrap();
        prop_assert_eq!(&first, &second);
        prop_assert!(first.windows(2).all(|w| w[0].score >= w[1].score));
    }

    #[test]
    fn release_is_idempotent(attempts in attempts()) {
        let rt = runtime();
        let (engine, rid, accepted) = rt.block_on(seeded(&attempts));
        prop_assume!(!accepted.is_empty());
        let target = accepted[0];

        rt.block_on(engine.release(rid, target)).unwrap();
        let once = rt.block_on(engine.intervals_for(rid, DateRange::day(day()))).unwrap();
        rt.block_on(engine.release(rid, target)).unwrap();
        let twice = rt.block_on(engine.intervals_for(rid, DateRange::day(day()))).unwrap();

        prop_assert_eq!(once.len(), accepted.len() - 1);
        prop_assert_eq!(once, twice);
    }
}
