use chrono::NaiveDate;
use rust_decimal::Decimal;

use crate::limits::*;
use crate::model::*;

use super::EngineError;

pub(crate) fn validate_window(checkin: NaiveDate, checkout: NaiveDate) -> Result<StayWindow, EngineError> {
    let window = StayWindow::new(checkin, checkout)
        .ok_or(EngineError::InvalidDateRange { checkin, checkout })?;
    if window.nights() > MAX_STAY_NIGHTS {
        return Err(EngineError::LimitExceeded("stay too long"));
    }
    Ok(window)
}

pub(crate) fn validate_charge(charge: &Decimal) -> Result<(), EngineError> {
    if charge.is_sign_negative() && !charge.is_zero() {
        return Err(EngineError::Validation(format!(
            "total charge must not be negative, got {charge}"
        )));
    }
    Ok(())
}

pub(crate) fn validate_room(room: &Room) -> Result<(), EngineError> {
    if room.id.is_empty() {
        return Err(EngineError::Validation("room id must not be empty".into()));
    }
    if room.id.len() > MAX_ROOM_ID_LEN {
        return Err(EngineError::LimitExceeded("room id too long"));
    }
    if room.num_beds == 0 {
        return Err(EngineError::Validation("num_beds must be at least 1".into()));
    }
    if room.num_beds > MAX_BEDS {
        return Err(EngineError::LimitExceeded("too many beds"));
    }
    if room.daily_rate.is_sign_negative() && !room.daily_rate.is_zero() {
        return Err(EngineError::Validation("daily_rate must not be negative".into()));
    }
    if room.cleaning_fee.is_sign_negative() && !room.cleaning_fee.is_zero() {
        return Err(EngineError::Validation("cleaning_fee must not be negative".into()));
    }
    Ok(())
}

/// Reject `window` if any reservation already on the room overlaps it.
/// Caller must hold the room's write lock until the new reservation is applied.
pub(crate) fn check_no_overlap(rs: &RoomState, window: &StayWindow) -> Result<(), EngineError> {
    match rs.first_conflict(window) {
        Some(existing) => Err(EngineError::RoomNotAvailable {
            room_id: rs.room.id.clone(),
            checkin: window.checkin(),
            checkout: window.checkout(),
            conflicting: existing.id,
        }),
        None => Ok(()),
    }
}
