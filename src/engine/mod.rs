mod availability;
mod conflict;
mod error;
mod mutations;
mod queries;
mod ranking;
mod store;
mod utilization;

pub use availability::{
    subtract_intervals, MergedSlots, SlotGenerator, SlotParams, TimelineSnapshot,
};
pub use error::EngineError;
pub use ranking::{rank_slots, DayPart, DayPartWeights, RankingPolicy};
pub use store::{SharedPool, SharedTimeline, TimelineStore};
pub use utilization::{utilization, DailyCounts, UtilizationReport};

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::NaiveDateTime;
use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, RwLock};
use tracing::{info, warn};
use ulid::Ulid;

use crate::clock::{Clock, SystemClock};
use crate::config::EngineConfig;
use crate::journal::Journal;
use crate::model::*;
use crate::notify::NotifyHub;

// ── Group-commit journal channel ─────────────────────────

pub(super) enum JournalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type PendingAppend = (Event, oneshot::Sender<io::Result<()>>);

/// Owns the journal file. Blocks for one append, drains whatever else is
/// already queued, then writes the whole batch with a single fsync.
async fn journal_writer_loop(mut journal: Journal, mut rx: mpsc::Receiver<JournalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let JournalCommand::Append { event, response } = cmd else {
            handle_control(&mut journal, cmd);
            continue;
        };
        let mut batch = vec![(event, response)];
        let mut deferred = None;
        loop {
            match rx.try_recv() {
                Ok(JournalCommand::Append { event, response }) => batch.push((event, response)),
                Ok(other) => {
                    deferred = Some(other);
                    break;
                }
                Err(_) => break,
            }
        }
        commit_batch(&mut journal, &mut batch);
        if let Some(cmd) = deferred {
            handle_control(&mut journal, cmd);
        }
    }
}

fn commit_batch(journal: &mut Journal, batch: &mut Vec<PendingAppend>) {
    metrics::histogram!(crate::observability::JOURNAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();

    let mut result = batch
        .iter()
        .try_for_each(|(event, _)| journal.append_buffered(event));
    // Flush even after a failed append so stray bytes never join the next batch.
    let flushed = journal.flush_sync();
    if result.is_ok() {
        result = flushed;
    }

    metrics::histogram!(crate::observability::JOURNAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());

    for (_, tx) in batch.drain(..) {
        let reply = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(reply);
    }
}

fn handle_control(journal: &mut Journal, cmd: JournalCommand) {
    match cmd {
        JournalCommand::Compact { events, response } => {
            let result = Journal::write_compact_file(journal.path(), &events)
                .and_then(|()| journal.swap_compact_file());
            let _ = response.send(result);
        }
        JournalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(journal.appends_since_compact());
        }
        JournalCommand::Append { event, response } => {
            commit_batch(journal, &mut vec![(event, response)]);
        }
    }
}

/// One salon's scheduling core: timelines, service catalog, journal and change feed.
pub struct Engine {
    pub store: TimelineStore,
    pub(super) services: DashMap<Ulid, ServiceInfo>,
    /// Held exclusively by resource creation and compaction, shared by service
    /// registration. Compaction's snapshot then never misses a journaled record.
    pub(super) directory: RwLock<()>,
    journal_tx: Option<mpsc::Sender<JournalCommand>>,
    pub notify: Arc<NotifyHub>,
    pub config: EngineConfig,
    clock: Arc<dyn Clock>,
}

impl Engine {
    /// Replay `journal_path` (if any) and start its writer task. Must run inside a tokio runtime
    /// when a journal is given.
    pub fn new(
        journal_path: Option<PathBuf>,
        notify: Arc<NotifyHub>,
        config: EngineConfig,
    ) -> io::Result<Self> {
        let mut engine = Self {
            store: TimelineStore::new(),
            services: DashMap::new(),
            directory: RwLock::new(()),
            journal_tx: None,
            notify,
            config,
            clock: Arc::new(SystemClock),
        };

        if let Some(path) = journal_path {
            let events = Journal::replay(&path)?;
            for event in &events {
                engine.apply_replayed(event);
            }
            info!(
                path = %path.display(),
                events = events.len(),
                resources = engine.store.resource_count(),
                appointments = engine.store.appointment_count(),
                "journal replayed"
            );
            let journal = Journal::open(&path)?;
            let (tx, rx) = mpsc::channel(4096);
            tokio::spawn(journal_writer_loop(journal, rx));
            engine.journal_tx = Some(tx);
        }

        Ok(engine)
    }

    /// Journal-less engine for tests and embedding.
    pub fn in_memory(config: EngineConfig) -> Self {
        Self {
            store: TimelineStore::new(),
            services: DashMap::new(),
            directory: RwLock::new(()),
            journal_tx: None,
            notify: Arc::new(NotifyHub::new()),
            config,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn now(&self) -> NaiveDateTime {
        self.clock.now()
    }

    pub fn is_persistent(&self) -> bool {
        self.journal_tx.is_some()
    }

    /// Rebuild state from one journal record. The engine is not shared yet,
    /// so every lock is uncontended.
    fn apply_replayed(&self, event: &Event) {
        match event {
            Event::ResourceCreated { id, name, hours } => {
                self.store
                    .insert_timeline(Timeline::new(*id, name.clone(), hours.clone()));
            }
            Event::ResourceUpdated { id, name, hours, active } => {
                if let Some(tl) = self.store.get_timeline(id)
                    && let Ok(mut guard) = tl.try_write() {
                        guard.name = name.clone();
                        guard.hours = hours.clone();
                        guard.active = *active;
                    }
            }
            Event::ServiceRegistered { id, name, duration_minutes } => {
                self.services.insert(
                    *id,
                    ServiceInfo { id: *id, name: name.clone(), duration_minutes: *duration_minutes },
                );
            }
            Event::AppointmentBooked { appointment } => {
                self.replay_place(appointment.resource_id, appointment.clone());
            }
            Event::AppointmentRescheduled { id, from, to, start, duration_minutes } => {
                if let Some(mut appointment) = self.replay_take(*id, *from) {
                    appointment.start = *start;
                    appointment.duration_minutes = *duration_minutes;
                    self.replay_place(*to, appointment);
                }
            }
            Event::AppointmentStatusChanged { id, resource_id, status } => {
                if let Some(mut appointment) = self.replay_take(*id, *resource_id) {
                    appointment.status = *status;
                    self.replay_place(*resource_id, appointment);
                }
            }
        }
    }

    fn replay_take(&self, id: Ulid, from: Option<Ulid>) -> Option<Appointment> {
        let taken = match from {
            Some(rid) => self
                .store
                .get_timeline(&rid)
                .and_then(|tl| tl.try_write().ok().and_then(|mut g| g.remove(id))),
            None => self
                .store
                .unassigned()
                .try_lock()
                .ok()
                .and_then(|mut pool| pool.remove(&id)),
        };
        if taken.is_none() {
            warn!(%id, "journal references an unknown appointment; skipped");
        }
        taken
    }

    fn replay_place(&self, to: Option<Ulid>, appointment: Appointment) {
        match to {
            Some(rid) => match self.store.get_timeline(&rid) {
                Some(tl) => {
                    if let Ok(mut guard) = tl.try_write() {
                        self.store.commit_locked(&mut guard, appointment);
                    }
                }
                None => warn!(resource = %rid, "journal references an unknown resource; skipped"),
            },
            None => {
                if let Ok(mut pool) = self.store.unassigned().try_lock() {
                    self.store.park_locked(&mut pool, appointment);
                }
            }
        }
    }

    /// Durably record `event`. No-op for in-memory engines.
    pub(super) async fn journal_append(&self, event: &Event) -> Result<(), EngineError> {
        let Some(journal_tx) = &self.journal_tx else {
            return Ok(());
        };
        let (tx, rx) = oneshot::channel();
        journal_tx
            .send(JournalCommand::Append { event: event.clone(), response: tx })
            .await
            .map_err(|_| EngineError::JournalError("journal writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::JournalError("journal writer dropped response".into()))?
            .map_err(|e| EngineError::JournalError(e.to_string()))
    }

    pub(super) async fn journal_compact(&self, events: Vec<Event>) -> Result<(), EngineError> {
        let Some(journal_tx) = &self.journal_tx else {
            return Ok(());
        };
        let (tx, rx) = oneshot::channel();
        journal_tx
            .send(JournalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::JournalError("journal writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::JournalError("journal writer dropped response".into()))?
            .map_err(|e| EngineError::JournalError(e.to_string()))
    }

    pub async fn journal_appends_since_compact(&self) -> u64 {
        let Some(journal_tx) = &self.journal_tx else {
            return 0;
        };
        let (tx, rx) = oneshot::channel();
        if journal_tx
            .send(JournalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    pub(super) fn emit(&self, change: BookingChanged) {
        self.notify.send(&change);
    }
}
