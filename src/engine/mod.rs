mod availability;
mod conflict;
mod error;
mod mutations;
mod queries;

pub use availability::AvailabilityQuery;
pub(crate) use availability::quote;
pub(crate) use conflict::{check_no_overlap, validate_charge, validate_room, validate_window};
pub use error::EngineError;

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tracing::{info, warn};
use ulid::Ulid;

use crate::model::*;
use crate::wal::Wal;

pub type SharedRoomState = Arc<RwLock<RoomState>>;

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

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond to all senders with the batch result.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];
                let mut deferred = None;

                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                        Ok(other) => {
                            deferred = Some(other);
                            break;
                        }
                        Err(_) => break,
                    }
                }

                commit_batch(&mut wal, &mut batch);
                if let Some(other) = deferred {
                    handle_non_append(&mut wal, other);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: &mut Vec<(Event, oneshot::Sender<io::Result<()>>)>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    if let Err(e) = &result {
        tracing::error!("WAL flush of {} events failed: {e}", batch.len());
    }
    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn flush_batch(wal: &mut Wal, batch: &[(Event, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (event, _) in batch {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Flush even after an append error so partially buffered bytes
    // don't leak into the next batch.
    let flush_err = wal.flush_sync().err();
    match (append_err, flush_err) {
        (Some(e), _) | (None, Some(e)) => Err(e),
        (None, None) => Ok(()),
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { event, response } => {
            let mut batch = vec![(event, response)];
            commit_batch(wal, &mut batch);
        }
    }
}

/// The room table and its write-ahead log.
///
/// Every mutation holds `commit_gate` shared (taken before any room lock) from
/// its validity check until the event is applied. Compaction holds it
/// exclusively, so a snapshot never misses an acknowledged append.
pub struct Engine {
    pub(super) rooms: DashMap<String, SharedRoomState>,
    /// Reservation id → room id.
    pub(super) reservation_index: DashMap<Ulid, String>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub(super) commit_gate: RwLock<()>,
    /// Serializes room registration so duplicate ids are caught before the WAL append.
    pub(super) registry: Mutex<()>,
}

/// Apply an event to a room. The caller holds the room lock.
fn apply_to_room(rs: &mut RoomState, event: &Event, index: &DashMap<Ulid, String>) {
    match event {
        Event::ReservationCreated {
            id,
            room_id,
            stay,
            total_charge,
        } => {
            rs.insert_reservation(Reservation {
                id: *id,
                room_id: room_id.clone(),
                stay: *stay,
                total_charge: *total_charge,
            });
            index.insert(*id, room_id.clone());
        }
        // Room creation is handled at the table level, not here
        Event::RoomCreated { .. } => {}
    }
}

fn room_from_event(event: &Event) -> Option<Room> {
    match event {
        Event::RoomCreated {
            id,
            num_beds,
            allow_smoking,
            daily_rate,
            cleaning_fee,
        } => Some(Room {
            id: id.clone(),
            num_beds: *num_beds,
            allow_smoking: *allow_smoking,
            daily_rate: *daily_rate,
            cleaning_fee: *cleaning_fee,
        }),
        Event::ReservationCreated { .. } => None,
    }
}

impl Engine {
    /// Replay the WAL at `wal_path` and start the group-commit writer.
    /// Must be called from within a tokio runtime.
    pub fn new(wal_path: PathBuf) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            rooms: DashMap::new(),
            reservation_index: DashMap::new(),
            wal_tx,
            commit_gate: RwLock::new(()),
            registry: Mutex::new(()),
        };

        // Rebuild plain state first; nothing else can see it yet.
        let mut replayed: HashMap<String, RoomState> = HashMap::new();
        for event in &events {
            match event {
                Event::RoomCreated { id, .. } => {
                    if let Some(room) = room_from_event(event) {
                        replayed.insert(id.clone(), RoomState::new(room));
                    }
                }
                Event::ReservationCreated { id, room_id, .. } => match replayed.get_mut(room_id) {
                    Some(rs) => apply_to_room(rs, event, &engine.reservation_index),
                    None => warn!("replay: reservation {id} references unknown room {room_id}, skipped"),
                },
            }
        }
        for (id, rs) in replayed {
            engine.rooms.insert(id, Arc::new(RwLock::new(rs)));
        }
        metrics::gauge!(crate::observability::ROOMS_TOTAL).set(engine.rooms.len() as f64);

        info!(
            "replayed {} WAL events from {}: {} rooms, {} reservations",
            events.len(),
            wal_path.display(),
            engine.rooms.len(),
            engine.reservation_index.len()
        );
        Ok(engine)
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
            .map_err(|_| EngineError::DataAccess("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::DataAccess("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::DataAccess(e.to_string()))
    }

    pub fn get_room_state(&self, id: &str) -> Option<SharedRoomState> {
        self.rooms.get(id).map(|e| e.value().clone())
    }

    pub fn room_for_reservation(&self, id: &Ulid) -> Option<String> {
        self.reservation_index.get(id).map(|e| e.value().clone())
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    /// Room table snapshot, sorted by room id. Table guards are released before returning.
    pub(super) fn room_states(&self) -> Vec<SharedRoomState> {
        let mut entries: Vec<(String, SharedRoomState)> = self
            .rooms
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries.into_iter().map(|(_, rs)| rs).collect()
    }

    /// WAL-append then apply, under the caller's room write lock.
    pub(super) async fn persist_and_apply(&self, rs: &mut RoomState, event: &Event) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_room(rs, event, &self.reservation_index);
        Ok(())
    }
}
