//! Hard limits enforced by the engine and the SQL front end.

/// Max rooms held by one store.
pub const MAX_ROOMS: usize = 100_000;

/// Max reservations kept per room.
pub const MAX_RESERVATIONS_PER_ROOM: usize = 50_000;

/// Max length of a room id, in bytes.
pub const MAX_ROOM_ID_LEN: usize = 64;

/// Max bed count accepted for a room.
pub const MAX_BEDS: u32 = 64;

/// Longest stay (and widest availability window) in nights.
pub const MAX_STAY_NIGHTS: i64 = 730;

/// Max SQL statement length accepted from a client.
pub const MAX_SQL_LEN: usize = 16 * 1024;
