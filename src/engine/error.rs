use chrono::NaiveDate;
use ulid::Ulid;

#[derive(Debug)]
pub enum EngineError {
    InvalidDateRange {
        checkin: NaiveDate,
        checkout: NaiveDate,
    },
    Validation(String),
    RoomNotAvailable {
        room_id: String,
        checkin: NaiveDate,
        checkout: NaiveDate,
        conflicting: Ulid,
    },
    NotFound(String),
    AlreadyExists(String),
    LimitExceeded(&'static str),
    DataAccess(String),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::InvalidDateRange { checkin, checkout } => {
                write!(f, "invalid date range: {checkout} is not after {checkin}")
            }
            EngineError::Validation(msg) => write!(f, "invalid input: {msg}"),
            EngineError::RoomNotAvailable {
                room_id,
                checkin,
                checkout,
                conflicting,
            } => write!(
                f,
                "room {room_id} is not available from {checkin} to {checkout}: overlaps reservation {conflicting}"
            ),
            EngineError::NotFound(what) => write!(f, "not found: {what}"),
            EngineError::AlreadyExists(what) => write!(f, "already exists: {what}"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::DataAccess(e) => write!(f, "data access error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
