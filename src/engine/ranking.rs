use std::borrow::Borrow;
use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashMap};

use chrono::{Datelike, NaiveDateTime, NaiveTime, Timelike, Weekday};
use ulid::Ulid;

use crate::model::*;

use super::availability::TimelineSnapshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DayPart {
    Morning,
    Afternoon,
    Evening,
}

impl DayPart {
    /// Morning before 12:00, afternoon before 17:00, evening after.
    pub fn of(t: NaiveTime) -> Self {
        match t.hour() {
            h if h < 12 => DayPart::Morning,
            h if h < 17 => DayPart::Afternoon,
            _ => DayPart::Evening,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DayPartWeights {
    pub morning: i64,
    pub afternoon: i64,
    pub evening: i64,
}

impl DayPartWeights {
    pub fn weight(&self, part: DayPart) -> i64 {
        match part {
            DayPart::Morning => self.morning,
            DayPart::Afternoon => self.afternoon,
            DayPart::Evening => self.evening,
        }
    }
}

/// Tunables for suggested-slot ordering. Higher scores come first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RankingPolicy {
    pub gap_weight: i64,
    /// Flat cost for each non-zero leftover next to the slot.
    pub edge_penalty: i64,
    /// Leftovers shorter than this are likely unbookable and cost their own length too.
    pub min_useful_gap_minutes: i64,
    pub weekday: DayPartWeights,
    pub weekend: DayPartWeights,
}

impl Default for RankingPolicy {
    fn default() -> Self {
        Self {
            gap_weight: 1,
            edge_penalty: 15,
            min_useful_gap_minutes: 30,
            weekday: DayPartWeights { morning: 20, afternoon: 10, evening: 0 },
            weekend: DayPartWeights { morning: 0, afternoon: 10, evening: 0 },
        }
    }
}

impl RankingPolicy {
    pub fn day_part_weight(&self, start: NaiveDateTime) -> i64 {
        let weights = match start.weekday() {
            Weekday::Sat | Weekday::Sun => &self.weekend,
            _ => &self.weekday,
        };
        weights.weight(DayPart::of(start.time()))
    }

    fn leftover_cost(&self, minutes: i64) -> i64 {
        match minutes {
            0 => 0,
            m if m < self.min_useful_gap_minutes => self.edge_penalty + m,
            _ => self.edge_penalty,
        }
    }

    /// Cost of the gaps a slot leaves inside its free window.
    pub fn fragmentation(&self, slot: &Span, window: &Span) -> i64 {
        let left = (slot.start - window.start).num_minutes();
        let right = (window.end - slot.end).num_minutes();
        self.leftover_cost(left) + self.leftover_cost(right)
    }

    pub fn score(&self, slot: &Span, window: Option<&Span>) -> i64 {
        let fragmentation = window.map_or(0, |w| self.fragmentation(slot, w));
        self.day_part_weight(slot.start) - self.gap_weight * fragmentation
    }
}

/// Rank key: the smallest key is the best slot.
struct Ranked(Slot);

impl Ranked {
    fn key(&self) -> (Reverse<i64>, NaiveDateTime, Ulid) {
        (Reverse(self.0.score), self.0.start, self.0.resource_id)
    }
}

impl PartialEq for Ranked {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for Ranked {}

impl PartialOrd for Ranked {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Ranked {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key().cmp(&other.key())
    }
}

/// Score every candidate against its resource's snapshot and keep the best
/// `limit`, ordered by score desc, start asc, resource asc.
///
/// Candidates stream through a bounded heap whose root is the worst slot
/// kept, so memory stays at `limit` however many candidates there are.
pub fn rank_slots<S: Borrow<TimelineSnapshot>>(
    candidates: impl IntoIterator<Item = Slot>,
    snapshots: &HashMap<Ulid, S>,
    policy: &RankingPolicy,
    limit: usize,
) -> Vec<Slot> {
    let mut kept = BinaryHeap::new();
    for mut slot in candidates {
        let span = slot.span();
        let window = snapshots
            .get(&slot.resource_id)
            .and_then(|snap| {
                let snap: &TimelineSnapshot = snap.borrow();
                snap.free_window_around(&span)
            });
        slot.score = policy.score(&span, window.as_ref());
        kept.push(Ranked(slot));
        if kept.len() > limit {
            kept.pop();
        }
    }
    kept.into_sorted_vec().into_iter().map(|r| r.0).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::fixtures::*;

    const MON: u32 = 3;

    fn slot(resource_id: Ulid, start: NaiveDateTime, minutes: i64) -> Slot {
        let span = Span::from_minutes(start, minutes);
        Slot { resource_id, start: span.start, end: span.end, score: 0 }
    }

    fn snap(resource_id: Ulid, busy: Vec<Span>) -> TimelineSnapshot {
        TimelineSnapshot { resource_id, hours: nine_to_six(), busy }
    }

    #[test]
    fn day_parts() {
        assert_eq!(DayPart::of(hm(11, 59)), DayPart::Morning);
        assert_eq!(DayPart::of(hm(12, 0)), DayPart::Afternoon);
        assert_eq!(DayPart::of(hm(16, 59)), DayPart::Afternoon);
        assert_eq!(DayPart::of(hm(17, 0)), DayPart::Evening);
    }

    #[test]
    fn weekend_uses_its_own_weights() {
        let policy = RankingPolicy::default();
        assert_eq!(policy.day_part_weight(at(MON, 9, 0)), 20);
        assert_eq!(policy.day_part_weight(at(8, 9, 0)), 0); // Saturday
        assert_eq!(policy.day_part_weight(at(8, 13, 0)), 10);
    }

    #[test]
    fn fragmentation_costs() {
        let policy = RankingPolicy::default();
        let window = Span::new(at(MON, 11, 0), at(MON, 14, 0));
        // flush left, 120 minutes right
        let flush = Span::new(at(MON, 11, 0), at(MON, 12, 0));
        assert_eq!(policy.fragmentation(&flush, &window), 15);
        // 15 minutes left (short), 105 right
        let sliver = Span::new(at(MON, 11, 15), at(MON, 12, 15));
        assert_eq!(policy.fragmentation(&sliver, &window), 15 + 15 + 15);
        // exact fit
        assert_eq!(policy.fragmentation(&window, &window), 0);
    }

    #[test]
    fn flush_slots_rank_above_slivers() {
        let rid = Ulid::new();
        let snaps = HashMap::from([(
            rid,
            snap(rid, vec![Span::new(at(MON, 10, 0), at(MON, 11, 0))]),
        )]);
        let ranked = rank_slots(
            vec![
                slot(rid, at(MON, 11, 15), 60),
                slot(rid, at(MON, 11, 0), 60),
                slot(rid, at(MON, 9, 0), 60),
            ],
            &snaps,
            &RankingPolicy::default(),
            usize::MAX,
        );
        // 09:00 fills 09:00-10:00 exactly; 11:00 is flush against the booking.
        assert_eq!(ranked[0].start, at(MON, 9, 0));
        assert_eq!(ranked[0].score, 20);
        assert_eq!(ranked[1].start, at(MON, 11, 0));
        assert_eq!(ranked[2].start, at(MON, 11, 15));
        assert!(ranked[1].score > ranked[2].score);
    }

    #[test]
    fn ties_break_on_start_then_resource() {
        let a = Ulid::from_parts(1, 1);
        let b = Ulid::from_parts(1, 2);
        let snaps = HashMap::from([(a, snap(a, vec![])), (b, snap(b, vec![]))]);
        let ranked = rank_slots(
            vec![
                slot(b, at(4, 9, 0), 60),
                slot(a, at(MON, 9, 0), 60),
                slot(a, at(4, 9, 0), 60),
            ],
            &snaps,
            &RankingPolicy::default(),
            usize::MAX,
        );
        let order: Vec<_> = ranked.iter().map(|s| (s.start, s.resource_id)).collect();
        assert_eq!(
            order,
            vec![(at(MON, 9, 0), a), (at(4, 9, 0), a), (at(4, 9, 0), b)]
        );
    }

    #[test]
    fn ranking_is_deterministic() {
        let rid = Ulid::new();
        let snaps = HashMap::from([(
            rid,
            snap(rid, vec![Span::new(at(MON, 13, 0), at(MON, 14, 0))]),
        )]);
        let candidates: Vec<_> = (9..17)
            .map(|h| slot(rid, at(MON, h, 0), 60))
            .filter(|s| !s.span().overlaps(&Span::new(at(MON, 13, 0), at(MON, 14, 0))))
            .collect();
        let once = rank_slots(candidates.clone(), &snaps, &RankingPolicy::default(), usize::MAX);
        let twice = rank_slots(candidates, &snaps, &RankingPolicy::default(), usize::MAX);
        assert_eq!(once, twice);
    }

    #[test]
    fn bounded_ranking_keeps_the_best_from_anywhere_in_the_stream() {
        let rid = Ulid::new();
        // Afternoon is busy except a one-hour hole at 15:00-16:00.
        let busy = vec![
            Span::new(at(MON, 12, 0), at(MON, 15, 0)),
            Span::new(at(MON, 16, 0), at(MON, 18, 0)),
        ];
        let snaps = HashMap::from([(rid, snap(rid, busy))]);
        let policy = RankingPolicy {
            weekday: DayPartWeights { morning: 0, afternoon: 0, evening: 0 },
            ..RankingPolicy::default()
        };
        // Morning slots all leave gaps; the exact-fit 15:00 slot arrives last.
        let mut candidates: Vec<_> = (0..8)
            .map(|q| slot(rid, at(MON, 9, 0) + chrono::Duration::minutes(15 * q), 60))
            .collect();
        candidates.push(slot(rid, at(MON, 15, 0), 60));

        let all = rank_slots(candidates.clone(), &snaps, &policy, usize::MAX);
        let top = rank_slots(candidates, &snaps, &policy, 3);
        assert_eq!(top[0].start, at(MON, 15, 0));
        assert_eq!(top[0].score, 0);
        assert_eq!(top, all[..3].to_vec());
        assert!(rank_slots(Vec::new(), &snaps, &policy, 3).is_empty());
    }
}
