use chrono::NaiveDate;
use ulid::Ulid;

use crate::model::*;

use super::availability::{quote, rank_candidates, AvailabilityQuery};
use super::conflict::validate_window;
use super::{Engine, EngineError};

impl Engine {
    /// Rooms matching the filters with no reservation overlapping `[start, end)`,
    /// priced for the stay and ranked cheapest first.
    pub async fn find_available_rooms(
        &self,
        start: NaiveDate,
        end: NaiveDate,
        min_beds: u32,
        allow_smoking: bool,
    ) -> Result<Vec<AvailableRoom>, EngineError> {
        let window = validate_window(start, end)?;
        self.available_rooms(&AvailabilityQuery {
            window,
            min_beds,
            allow_smoking,
        })
        .await
    }

    pub async fn available_rooms(&self, query: &AvailabilityQuery) -> Result<Vec<AvailableRoom>, EngineError> {
        validate_window(query.window.checkin(), query.window.checkout())?;
        let mut candidates = Vec::new();
        for rs in self.room_states() {
            let guard = rs.read().await;
            if !query.admits(&guard.room) || !guard.is_free(&query.window) {
                continue;
            }
            let total_charge = quote(&guard.room, &query.window)?;
            candidates.push(AvailableRoom {
                room: guard.room.clone(),
                total_charge,
            });
        }
        rank_candidates(&mut candidates);
        Ok(candidates)
    }

    /// All reservations, ordered by id.
    pub async fn list_reservations(&self) -> Vec<Reservation> {
        let mut all = Vec::new();
        for rs in self.room_states() {
            let guard = rs.read().await;
            all.extend(guard.reservations.iter().cloned());
        }
        all.sort_by_key(|r| r.id);
        all
    }

    pub async fn get_reservation(&self, id: Ulid) -> Result<Reservation, EngineError> {
        let not_found = || EngineError::NotFound(format!("reservation {id}"));
        let room_id = self.room_for_reservation(&id).ok_or_else(not_found)?;
        let rs = self.get_room_state(&room_id).ok_or_else(not_found)?;
        let guard = rs.read().await;
        guard
            .reservations
            .iter()
            .find(|r| r.id == id)
            .cloned()
            .ok_or_else(not_found)
    }

    /// Reservations matching every supplied field of `filter`, ordered by id.
    pub async fn find_reservations(&self, filter: &ReservationFilter) -> Vec<Reservation> {
        let rooms = match &filter.room_id {
            Some(room_id) => self.get_room_state(room_id).into_iter().collect(),
            None => self.room_states(),
        };
        let mut found = Vec::new();
        for rs in rooms {
            let guard = rs.read().await;
            found.extend(guard.reservations.iter().filter(|r| filter.matches(r)).cloned());
        }
        found.sort_by_key(|r| r.id);
        found
    }

    /// Reservations on one room, ordered by check-in date.
    pub async fn reservations_for_room(&self, room_id: &str) -> Result<Vec<Reservation>, EngineError> {
        let rs = self
            .get_room_state(room_id)
            .ok_or_else(|| EngineError::NotFound(format!("room {room_id}")))?;
        let guard = rs.read().await;
        Ok(guard.reservations.clone())
    }

    pub async fn get_room(&self, id: &str) -> Result<Room, EngineError> {
        let rs = self
            .get_room_state(id)
            .ok_or_else(|| EngineError::NotFound(format!("room {id}")))?;
        let guard = rs.read().await;
        Ok(guard.room.clone())
    }

    /// All rooms, ordered by id.
    pub async fn list_rooms(&self) -> Vec<Room> {
        let mut rooms = Vec::new();
        for rs in self.room_states() {
            rooms.push(rs.read().await.room.clone());
        }
        rooms
    }
}
