use std::sync::Arc;

use chrono::NaiveDate;
use rust_decimal::Decimal;
use tokio::sync::{oneshot, RwLock};
use tracing::{debug, info};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::observability::{BOOKING_CONFLICTS_TOTAL, RESERVATIONS_CREATED_TOTAL, ROOMS_TOTAL, WAL_COMPACTIONS_TOTAL};

use super::availability::quote;
use super::conflict::{check_no_overlap, validate_charge, validate_room, validate_window};
use super::{Engine, EngineError, WalCommand};

impl Engine {
    pub async fn create_room(&self, room: Room) -> Result<Room, EngineError> {
        validate_room(&room)?;
        let _gate = self.commit_gate.read().await;
        let _registry = self.registry.lock().await;

        if self.rooms.len() >= MAX_ROOMS {
            return Err(EngineError::LimitExceeded("too many rooms"));
        }
        if self.rooms.contains_key(&room.id) {
            return Err(EngineError::AlreadyExists(format!("room {}", room.id)));
        }

        self.wal_append(&room.created_event()).await?;
        self.rooms
            .insert(room.id.clone(), Arc::new(RwLock::new(RoomState::new(room.clone()))));
        metrics::gauge!(ROOMS_TOTAL).set(self.rooms.len() as f64);
        debug!("room {} created", room.id);
        Ok(room)
    }

    /// Book `room_id` for `[checkin, checkout)`.
    ///
    /// The overlap check, the WAL append and the in-memory insert all happen under
    /// the room's write lock, so two concurrent bookings of the same room cannot
    /// both pass the check. Without `total_charge` the stay is quoted from the
    /// room's rates.
    pub async fn create_reservation(
        &self,
        room_id: &str,
        checkin: NaiveDate,
        checkout: NaiveDate,
        total_charge: Option<Decimal>,
    ) -> Result<Reservation, EngineError> {
        let window = validate_window(checkin, checkout)?;
        if let Some(charge) = &total_charge {
            validate_charge(charge)?;
        }

        let _gate = self.commit_gate.read().await;
        let rs = self
            .get_room_state(room_id)
            .ok_or_else(|| EngineError::NotFound(format!("room {room_id}")))?;
        let mut guard = rs.write().await;
        if guard.reservations.len() >= MAX_RESERVATIONS_PER_ROOM {
            return Err(EngineError::LimitExceeded("too many reservations on room"));
        }

        if let Err(e) = check_no_overlap(&guard, &window) {
            metrics::counter!(BOOKING_CONFLICTS_TOTAL).increment(1);
            info!("booking rejected: {e}");
            return Err(e);
        }

        let total_charge = match total_charge {
            Some(charge) => charge,
            None => quote(&guard.room, &window)?,
        };
        let reservation = Reservation {
            id: Ulid::new(),
            room_id: guard.room.id.clone(),
            stay: window,
            total_charge,
        };
        self.persist_and_apply(&mut guard, &reservation.created_event()).await?;

        metrics::counter!(RESERVATIONS_CREATED_TOTAL).increment(1);
        debug!(
            "reservation {} created on room {} for {}",
            reservation.id, reservation.room_id, reservation.stay
        );
        Ok(reservation)
    }

    /// Compact the WAL by rewriting it with only the events needed to recreate the current state.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _gate = self.commit_gate.write().await;

        let mut events = Vec::new();
        for rs in self.room_states() {
            let guard = rs.read().await;
            events.push(guard.room.created_event());
            events.extend(guard.reservations.iter().map(Reservation::created_event));
        }
        let count = events.len();

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::DataAccess("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::DataAccess("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::DataAccess(e.to_string()))?;

        metrics::counter!(WAL_COMPACTIONS_TOTAL).increment(1);
        info!("WAL compacted to {count} events");
        Ok(())
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
