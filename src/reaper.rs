use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::engine::{Engine, EngineError};
use crate::observability::{COMPACTIONS_TOTAL, NO_SHOWS_TOTAL};

const SWEEP_INTERVAL: Duration = Duration::from_secs(30);
const COMPACT_CHECK_INTERVAL: Duration = Duration::from_secs(10);

/// Mark every overdue scheduled/confirmed appointment as a no-show.
/// Returns how many were marked.
pub async fn sweep_no_shows(engine: &Engine, after_minutes: i64) -> usize {
    let overdue = engine.collect_overdue(engine.now(), after_minutes);
    let mut marked = 0;
    for id in overdue {
        match engine.mark_no_show(id).await {
            Ok(_) => {
                marked += 1;
                info!(appointment = %id, "marked no-show");
            }
            // Checked in or cancelled since collection.
            Err(e) => debug!(appointment = %id, error = %e, "no-show sweep skipped"),
        }
    }
    if marked > 0 {
        metrics::counter!(NO_SHOWS_TOTAL).increment(marked as u64);
    }
    marked
}

/// Background task releasing capacity held by clients who never arrived.
pub async fn run_no_show_sweeper(engine: Arc<Engine>, after_minutes: i64) {
    let mut interval = tokio::time::interval(SWEEP_INTERVAL);
    loop {
        interval.tick().await;
        sweep_no_shows(&engine, after_minutes).await;
    }
}

/// Compact once `threshold` appends have accumulated since the last rewrite.
pub async fn compact_if_needed(engine: &Engine, threshold: u64) -> Result<bool, EngineError> {
    if engine.journal_appends_since_compact().await < threshold {
        return Ok(false);
    }
    engine.compact_journal().await?;
    metrics::counter!(COMPACTIONS_TOTAL).increment(1);
    Ok(true)
}

pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(COMPACT_CHECK_INTERVAL);
    loop {
        interval.tick().await;
        if let Err(e) = compact_if_needed(&engine, threshold).await {
            warn!(error = %e, "journal compaction failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::config::EngineConfig;
    use crate::model::fixtures::*;
    use crate::model::*;
    use crate::notify::NotifyHub;
    use ulid::Ulid;

    async fn salon(engine: &Engine) -> Ulid {
        let rid = Ulid::new();
        engine.create_resource(rid, None, nine_to_six()).await.unwrap();
        rid
    }

    #[tokio::test]
    async fn sweeper_marks_overdue_appointments() {
        let clock = Arc::new(FixedClock::new(at(1, 8, 0)));
        let engine = Engine::in_memory(EngineConfig::default()).with_clock(clock.clone());
        let rid = salon(&engine).await;

        let missed = engine
            .book(AppointmentRequest::new(Ulid::new(), Some(rid), at(3, 9, 0), 60))
            .await
            .unwrap();
        let upcoming = engine
            .book(AppointmentRequest::new(Ulid::new(), Some(rid), at(3, 11, 0), 60))
            .await
            .unwrap();

        clock.set(at(3, 9, 45));
        assert_eq!(sweep_no_shows(&engine, 30).await, 1);
        assert_eq!(
            engine.appointment(missed.id).await.unwrap().status,
            AppointmentStatus::NoShow
        );
        assert_eq!(
            engine.appointment(upcoming.id).await.unwrap().status,
            AppointmentStatus::Scheduled
        );
        // Freed capacity can be rebooked.
        engine
            .book(AppointmentRequest::new(Ulid::new(), Some(rid), at(3, 10, 0), 30))
            .await
            .unwrap();

        assert_eq!(sweep_no_shows(&engine, 30).await, 0);
    }

    #[tokio::test]
    async fn compactor_respects_threshold() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Engine::new(
            Some(dir.path().join("salon.journal")),
            Arc::new(NotifyHub::new()),
            EngineConfig::default(),
        )
        .unwrap();
        salon(&engine).await;
        salon(&engine).await;

        assert!(!compact_if_needed(&engine, 5).await.unwrap());
        salon(&engine).await;
        assert!(compact_if_needed(&engine, 3).await.unwrap());
        assert_eq!(engine.journal_appends_since_compact().await, 0);
    }
}
