//! Start-up seeding from a directory of JSON files.
//!
//! `rooms.json` holds an array of rooms and `reservations.json` (optional) an array
//! of stays. Seeding only happens into an empty store, so restarting with the same
//! seed directory does not duplicate anything already in the WAL. The whole seed is
//! checked in memory before the first write; a seed with any bad row writes nothing.

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::path::Path;

use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::Deserialize;
use tracing::info;
use ulid::Ulid;

use crate::engine::{
    check_no_overlap, quote, validate_charge, validate_room, validate_window, Engine, EngineError,
};
use crate::limits::{MAX_RESERVATIONS_PER_ROOM, MAX_ROOMS};
use crate::model::{Reservation, Room, RoomState};

#[derive(Debug, Deserialize)]
struct RoomRow {
    id: String,
    num_beds: u32,
    #[serde(default)]
    allow_smoking: bool,
    daily_rate: Decimal,
    cleaning_fee: Decimal,
}

#[derive(Debug, Deserialize)]
struct ReservationRow {
    room_id: String,
    checkin_date: NaiveDate,
    checkout_date: NaiveDate,
    #[serde(default)]
    total_charge: Option<Decimal>,
}

impl From<RoomRow> for Room {
    fn from(row: RoomRow) -> Self {
        Room {
            id: row.id,
            num_beds: row.num_beds,
            allow_smoking: row.allow_smoking,
            daily_rate: row.daily_rate,
            cleaning_fee: row.cleaning_fee,
        }
    }
}

#[derive(Debug)]
pub enum SeedError {
    Io(String, io::Error),
    Json(String, serde_json::Error),
    /// Row `index` (0-based) of `file` was rejected before anything was written.
    Row {
        file: &'static str,
        index: usize,
        error: EngineError,
    },
    Engine(EngineError),
}

impl fmt::Display for SeedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SeedError::Io(file, e) => write!(f, "reading {file}: {e}"),
            SeedError::Json(file, e) => write!(f, "parsing {file}: {e}"),
            SeedError::Row { file, index, error } => write!(f, "{file} row {index}: {error}"),
            SeedError::Engine(e) => write!(f, "applying seed: {e}"),
        }
    }
}

impl std::error::Error for SeedError {}

impl From<EngineError> for SeedError {
    fn from(e: EngineError) -> Self {
        SeedError::Engine(e)
    }
}

/// Counts of what a seed run wrote.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct SeedSummary {
    pub rooms: usize,
    pub reservations: usize,
}

fn read_rows<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<Vec<T>, SeedError> {
    let name = path.display().to_string();
    let raw = std::fs::read_to_string(path).map_err(|e| SeedError::Io(name.clone(), e))?;
    serde_json::from_str(&raw).map_err(|e| SeedError::Json(name, e))
}

/// A seed that passed every check the engine would apply, ready to write.
#[derive(Debug)]
struct SeedPlan {
    rooms: Vec<Room>,
    reservations: Vec<Reservation>,
}

/// Replay the seed against an in-memory room table, with the same validation and
/// overlap rules as the engine, so bad rows surface before the WAL sees anything.
fn plan(rooms: Vec<RoomRow>, reservations: Vec<ReservationRow>) -> Result<SeedPlan, SeedError> {
    let room_err = |index, error| SeedError::Row { file: "rooms.json", index, error };
    let stay_err = |index, error| SeedError::Row { file: "reservations.json", index, error };

    let mut table: HashMap<String, RoomState> = HashMap::new();
    let mut planned_rooms = Vec::with_capacity(rooms.len());
    for (index, row) in rooms.into_iter().enumerate() {
        let room = Room::from(row);
        validate_room(&room).map_err(|e| room_err(index, e))?;
        if table.len() >= MAX_ROOMS {
            return Err(room_err(index, EngineError::LimitExceeded("too many rooms")));
        }
        if table.contains_key(&room.id) {
            return Err(room_err(index, EngineError::AlreadyExists(format!("room {}", room.id))));
        }
        table.insert(room.id.clone(), RoomState::new(room.clone()));
        planned_rooms.push(room);
    }

    let mut planned_stays = Vec::with_capacity(reservations.len());
    for (index, row) in reservations.into_iter().enumerate() {
        let reservation = plan_stay(&mut table, row).map_err(|e| stay_err(index, e))?;
        planned_stays.push(reservation);
    }

    Ok(SeedPlan {
        rooms: planned_rooms,
        reservations: planned_stays,
    })
}

fn plan_stay(table: &mut HashMap<String, RoomState>, row: ReservationRow) -> Result<Reservation, EngineError> {
    let window = validate_window(row.checkin_date, row.checkout_date)?;
    if let Some(charge) = &row.total_charge {
        validate_charge(charge)?;
    }
    let rs = table
        .get_mut(&row.room_id)
        .ok_or_else(|| EngineError::NotFound(format!("room {}", row.room_id)))?;
    if rs.reservations.len() >= MAX_RESERVATIONS_PER_ROOM {
        return Err(EngineError::LimitExceeded("too many reservations on room"));
    }
    check_no_overlap(rs, &window)?;
    let total_charge = match row.total_charge {
        Some(charge) => charge,
        None => quote(&rs.room, &window)?,
    };
    let reservation = Reservation {
        id: Ulid::new(),
        room_id: row.room_id,
        stay: window,
        total_charge,
    };
    rs.insert_reservation(reservation.clone());
    Ok(reservation)
}

pub async fn load_dir(engine: &Engine, dir: &Path) -> Result<SeedSummary, SeedError> {
    if engine.room_count() > 0 {
        info!("store already holds rooms, skipping seed from {}", dir.display());
        return Ok(SeedSummary::default());
    }

    let rooms: Vec<RoomRow> = read_rows(&dir.join("rooms.json"))?;
    let reservations_path = dir.join("reservations.json");
    let reservations: Vec<ReservationRow> = if reservations_path.exists() {
        read_rows(&reservations_path)?
    } else {
        Vec::new()
    };

    let planned = plan(rooms, reservations)?;

    let mut summary = SeedSummary::default();
    for room in planned.rooms {
        engine.create_room(room).await?;
        summary.rooms += 1;
    }
    for r in planned.reservations {
        engine
            .create_reservation(&r.room_id, r.stay.checkin(), r.stay.checkout(), Some(r.total_charge))
            .await?;
        summary.reservations += 1;
    }

    info!(
        "seeded {} rooms and {} reservations from {}",
        summary.rooms,
        summary.reservations,
        dir.display()
    );
    Ok(summary)
}
