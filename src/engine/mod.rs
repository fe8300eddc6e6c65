mod availability;
mod conflict;
mod error;
mod mutations;
mod queries;
mod slots;

pub use availability::resolve_slots;
pub use error::EngineError;
pub use slots::{candidates, validate_hours, SlotCandidates};

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use tokio::sync::{broadcast, mpsc, oneshot, Mutex, OwnedRwLockWriteGuard, RwLock};
use ulid::Ulid;

use crate::model::*;
use crate::notify::NotifyHub;
use crate::observability;
use crate::wal::Wal;

pub type SharedFacilityState = Arc<RwLock<FacilityState>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
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

/// Owns the WAL. Each wake-up drains every append already queued and commits
/// them with a single fsync; a non-append command ends the batch early.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let (event, response) = match cmd {
            WalCommand::Append { event, response } => (event, response),
            other => {
                handle_control(&mut wal, other);
                continue;
            }
        };

        let mut batch: Vec<PendingAppend> = vec![(event, response)];
        let mut deferred = None;
        while let Ok(next) = rx.try_recv() {
            match next {
                WalCommand::Append { event, response } => batch.push((event, response)),
                other => {
                    deferred = Some(other);
                    break;
                }
            }
        }

        commit_batch(&mut wal, batch);
        if let Some(cmd) = deferred {
            handle_control(&mut wal, cmd);
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: Vec<PendingAppend>) {
    metrics::histogram!(observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let started = Instant::now();

    let mut result = batch
        .iter()
        .try_for_each(|(event, _)| wal.append_buffered(event));
    // Flush even after a failed append so no half-written batch leaks into the next one.
    let flushed = wal.flush_sync();
    if result.is_ok() {
        result = flushed;
    }

    metrics::histogram!(observability::WAL_FLUSH_DURATION_SECONDS).record(started.elapsed().as_secs_f64());
    if let Err(e) = &result {
        tracing::error!("WAL commit of {} events failed: {e}", batch.len());
    }

    for (_, tx) in batch {
        let reply = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(reply);
    }
}

fn handle_control(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events).and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { event, response } => commit_batch(wal, vec![(event, response)]),
    }
}

/// The booking store: per-facility state behind async RwLocks, made durable
/// through the WAL. A facility write lock is the admission transaction.
pub struct Engine {
    pub(super) facilities: DashMap<Ulid, SharedFacilityState>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub(super) notify: Arc<NotifyHub>,
    /// Reverse lookup: booking id → facility id
    pub(super) booking_to_facility: DashMap<Ulid, Ulid>,
    /// Held by facility creation and compaction.
    pub(super) catalog_lock: Mutex<()>,
}

/// Apply an event to a facility. Caller holds the lock.
fn apply_to_facility(fs: &mut FacilityState, event: &Event, booking_index: &DashMap<Ulid, Ulid>) {
    match event {
        Event::HoursSet { weekday, hours, .. } => {
            if let Some(day) = fs.hours.days.get_mut(*weekday as usize) {
                *day = *hours;
            }
        }
        Event::ServiceUpserted { service } => {
            fs.services.insert(service.id, service.clone());
        }
        Event::CustomerRegistered { customer } => {
            fs.register_customer(customer.clone());
        }
        Event::BookingAdmitted { booking } => {
            booking_index.insert(booking.id, booking.facility_id);
            fs.insert_booking(booking.clone());
        }
        Event::BookingStatusChanged { id, status, at, .. } => {
            if let Some(b) = fs.booking_mut(id) {
                b.status = *status;
                b.updated_at = *at;
            }
        }
        // Facility creation is handled at the DashMap level
        Event::FacilityCreated { .. } => {}
    }
}

fn facility_from_event(event: &Event) -> Option<FacilityState> {
    match event {
        Event::FacilityCreated {
            id,
            name,
            slot_minutes,
            auto_confirm,
            hours,
        } => {
            let mut fs = FacilityState::new(*id, name.clone(), *slot_minutes, *auto_confirm);
            fs.hours = hours.clone();
            Some(fs)
        }
        _ => None,
    }
}

impl Engine {
    pub fn new(wal_path: PathBuf, notify: Arc<NotifyHub>) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let booking_to_facility = DashMap::new();

        // Rebuild plain state first; nothing else can see it yet.
        let mut replayed: HashMap<Ulid, FacilityState> = HashMap::new();
        for event in &events {
            if let Some(fs) = facility_from_event(event) {
                replayed.entry(fs.id).or_insert(fs);
            } else if let Some(fs) = replayed.get_mut(&event.facility_id()) {
                apply_to_facility(fs, event, &booking_to_facility);
            } else {
                tracing::warn!("WAL event for unknown facility {} skipped", event.facility_id());
            }
        }

        let facilities = DashMap::new();
        for (id, fs) in replayed {
            facilities.insert(id, Arc::new(RwLock::new(fs)));
        }
        metrics::gauge!(observability::FACILITIES_ACTIVE).set(facilities.len() as f64);
        tracing::info!(
            "replayed {} events into {} facilities from {}",
            events.len(),
            facilities.len(),
            wal_path.display()
        );

        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        Ok(Self {
            facilities,
            wal_tx,
            notify,
            booking_to_facility,
            catalog_lock: Mutex::new(()),
        })
    }

    /// Write event to WAL via the background group-commit writer.
    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::StoreUnavailable("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::StoreUnavailable("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::StoreUnavailable(e.to_string()))
    }

    pub fn get_facility(&self, id: &Ulid) -> Option<SharedFacilityState> {
        self.facilities.get(id).map(|e| e.value().clone())
    }

    pub fn facility_for_booking(&self, booking_id: &Ulid) -> Option<Ulid> {
        self.booking_to_facility.get(booking_id).map(|e| *e.value())
    }

    /// Committed events for one facility, for dashboards.
    pub fn subscribe(&self, facility_id: Ulid) -> broadcast::Receiver<Event> {
        self.notify.subscribe(facility_id)
    }

    /// WAL-append + apply + notify. The event is durable before anyone can observe it.
    pub(super) async fn persist_and_apply(&self, fs: &mut FacilityState, event: &Event) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_facility(fs, event, &self.booking_to_facility);
        self.notify.send(fs.id, event);
        Ok(())
    }

    /// Lookup facility, acquire its write lock.
    pub(super) async fn facility_write(
        &self,
        facility_id: &Ulid,
    ) -> Result<OwnedRwLockWriteGuard<FacilityState>, EngineError> {
        let fs = self
            .get_facility(facility_id)
            .ok_or(EngineError::NotFound(*facility_id))?;
        Ok(fs.write_owned().await)
    }

    /// Lookup booking → facility, acquire that facility's write lock.
    pub(super) async fn resolve_booking_write(
        &self,
        booking_id: &Ulid,
    ) -> Result<OwnedRwLockWriteGuard<FacilityState>, EngineError> {
        let facility_id = self
            .facility_for_booking(booking_id)
            .ok_or(EngineError::NotFound(*booking_id))?;
        self.facility_write(&facility_id).await
    }
}
