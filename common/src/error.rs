use thiserror::Error;

use crate::{schedule::DayOfWeek, types::ZoneId};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ScheduleError {
    #[error("{count} active schedules for user {user} zone {zone}")]
    Ambiguous { user: i64, zone: ZoneId, count: usize },
    #[error("no schedule found for user {user} zone {zone}")]
    NotFound { user: i64, zone: ZoneId },
    #[error("schedule `{name}` already exists for user {user} zone {zone}")]
    Duplicate { user: i64, zone: ZoneId, name: String },
    #[error("room `{room}` has no schedule entries on {day:?}")]
    MissingDay { room: String, day: DayOfWeek },
    #[error("invalid schedule entry for room `{room}`: {reason}")]
    InvalidEntry { room: String, reason: String },
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum OverrideError {
    #[error("malformed override message {id}: {reason}")]
    Malformed { id: i64, reason: String },
}

#[derive(Debug, Error)]
pub enum SensorError {
    #[error("sensor {address} is offline")]
    Offline { address: String },
    #[error("sensor {address} read timed out")]
    Timeout { address: String },
    #[error("sensor {address} returned unparseable data: {detail}")]
    Parse { address: String, detail: String },
    #[error("sensor {address} io error: {source}")]
    Io {
        address: String,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Error)]
#[error("EMERGENCY: no temperature readings available for zone {zone}")]
pub struct AllSensorsUnavailable {
    pub zone: ZoneId,
}
