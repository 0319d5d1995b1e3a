use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Half-open stay `[checkin, checkout)` in calendar days.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StayWindow {
    checkin: NaiveDate,
    checkout: NaiveDate,
}

impl StayWindow {
    /// `None` unless `checkin < checkout`.
    pub fn new(checkin: NaiveDate, checkout: NaiveDate) -> Option<Self> {
        (checkin < checkout).then_some(Self { checkin, checkout })
    }

    pub fn checkin(&self) -> NaiveDate {
        self.checkin
    }

    pub fn checkout(&self) -> NaiveDate {
        self.checkout
    }

    pub fn nights(&self) -> i64 {
        self.checkout.signed_duration_since(self.checkin).num_days()
    }

    /// Shared instants overlap; touching endpoints do not, so a checkout and a
    /// checkin on the same day can share a room.
    pub fn overlaps(&self, other: &StayWindow) -> bool {
        self.checkin < other.checkout && other.checkin < self.checkout
    }
}

impl std::fmt::Display for StayWindow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}, {})", self.checkin, self.checkout)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Room {
    pub id: String,
    pub num_beds: u32,
    pub allow_smoking: bool,
    pub daily_rate: Decimal,
    pub cleaning_fee: Decimal,
}

impl Room {
    pub fn created_event(&self) -> Event {
        Event::RoomCreated {
            id: self.id.clone(),
            num_beds: self.num_beds,
            allow_smoking: self.allow_smoking,
            daily_rate: self.daily_rate,
            cleaning_fee: self.cleaning_fee,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reservation {
    pub id: Ulid,
    pub room_id: String,
    pub stay: StayWindow,
    pub total_charge: Decimal,
}

impl Reservation {
    pub fn created_event(&self) -> Event {
        Event::ReservationCreated {
            id: self.id,
            room_id: self.room_id.clone(),
            stay: self.stay,
            total_charge: self.total_charge,
        }
    }
}

/// A room together with everything booked on it.
#[derive(Debug, Clone)]
pub struct RoomState {
    pub room: Room,
    /// Sorted by `stay.checkin`. Never contains two overlapping stays.
    pub reservations: Vec<Reservation>,
}

impl RoomState {
    pub fn new(room: Room) -> Self {
        Self {
            room,
            reservations: Vec::new(),
        }
    }

    /// Insert a reservation maintaining sort order by checkin.
    pub fn insert_reservation(&mut self, reservation: Reservation) {
        let pos = self
            .reservations
            .binary_search_by_key(&reservation.stay.checkin, |r| r.stay.checkin)
            .unwrap_or_else(|e| e);
        self.reservations.insert(pos, reservation);
    }

    /// Reservations whose stay overlaps `window`.
    /// Binary search skips everything checking in on or after `window.checkout`.
    pub fn overlapping(&self, window: &StayWindow) -> impl Iterator<Item = &Reservation> {
        let right_bound = self
            .reservations
            .partition_point(|r| r.stay.checkin < window.checkout);
        self.reservations[..right_bound]
            .iter()
            .filter(move |r| r.stay.overlaps(window))
    }

    pub fn first_conflict(&self, window: &StayWindow) -> Option<&Reservation> {
        self.overlapping(window).next()
    }

    pub fn is_free(&self, window: &StayWindow) -> bool {
        self.first_conflict(window).is_none()
    }
}

/// WAL record format. Flat on purpose: one variant per state change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    RoomCreated {
        id: String,
        num_beds: u32,
        allow_smoking: bool,
        #[serde(with = "decimal_bytes")]
        daily_rate: Decimal,
        #[serde(with = "decimal_bytes")]
        cleaning_fee: Decimal,
    },
    ReservationCreated {
        id: Ulid,
        room_id: String,
        stay: StayWindow,
        #[serde(with = "decimal_bytes")]
        total_charge: Decimal,
    },
}

/// Decimals go into the WAL as their fixed 16-byte form; bincode cannot drive
/// rust_decimal's self-describing deserializer.
mod decimal_bytes {
    use rust_decimal::Decimal;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(value: &Decimal, serializer: S) -> Result<S::Ok, S::Error> {
        let bytes: [u8; 16] = Decimal::serialize(value);
        bytes.serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Decimal, D::Error> {
        let bytes = <[u8; 16]>::deserialize(deserializer)?;
        Ok(Decimal::deserialize(bytes))
    }
}

// ── Query result types ───────────────────────────────────────────

/// An availability candidate priced for the requested stay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AvailableRoom {
    pub room: Room,
    pub total_charge: Decimal,
}

/// Reservation lookup. Every field is independent; `None` matches anything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReservationFilter {
    pub room_id: Option<String>,
    pub checkin: Option<NaiveDate>,
    pub checkout: Option<NaiveDate>,
}

impl ReservationFilter {
    pub fn matches(&self, reservation: &Reservation) -> bool {
        self.room_id.as_ref().is_none_or(|id| *id == reservation.room_id)
            && self.checkin.is_none_or(|d| d == reservation.stay.checkin)
            && self.checkout.is_none_or(|d| d == reservation.stay.checkout)
    }
}
