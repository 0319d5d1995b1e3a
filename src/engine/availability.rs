use std::cmp::Ordering;

use rust_decimal::Decimal;

use crate::model::*;

use super::EngineError;

// ── Availability filters and pricing ─────────────────────────────

/// Filter half of an availability search. The stay window is checked separately
/// against each room's reservations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AvailabilityQuery {
    pub window: StayWindow,
    /// Inclusive lower bound.
    pub min_beds: u32,
    /// Exact match.
    pub allow_smoking: bool,
}

impl AvailabilityQuery {
    pub fn admits(&self, room: &Room) -> bool {
        room.num_beds >= self.min_beds && room.allow_smoking == self.allow_smoking
    }
}

/// `daily_rate * nights + cleaning_fee`, failing instead of wrapping on overflow.
pub fn quote(room: &Room, window: &StayWindow) -> Result<Decimal, EngineError> {
    room.daily_rate
        .checked_mul(Decimal::from(window.nights()))
        .and_then(|stay| stay.checked_add(room.cleaning_fee))
        .ok_or_else(|| EngineError::Validation(format!("price for room {} overflows", room.id)))
}

/// Cheapest first, then fewest beds, then room id.
pub fn rank_order(a: &AvailableRoom, b: &AvailableRoom) -> Ordering {
    a.total_charge
        .cmp(&b.total_charge)
        .then(a.room.num_beds.cmp(&b.room.num_beds))
        .then_with(|| a.room.id.cmp(&b.room.id))
}

pub fn rank_candidates(candidates: &mut [AvailableRoom]) {
    candidates.sort_by(rank_order);
}
