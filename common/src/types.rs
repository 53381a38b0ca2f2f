use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub type ZoneId = i64;
pub type SensorId = i64;
pub type ActionId = i64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RelayState {
    HeatOn,
    HeatOff,
}

impl RelayState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::HeatOn => "HEAT_ON",
            Self::HeatOff => "HEAT_OFF",
        }
    }

    pub fn from_level(on: bool) -> Self {
        if on {
            Self::HeatOn
        } else {
            Self::HeatOff
        }
    }

    pub fn is_on(self) -> bool {
        self == Self::HeatOn
    }

    pub fn value(self) -> i64 {
        match self {
            Self::HeatOn => 1,
            Self::HeatOff => 0,
        }
    }

    pub fn from_value(value: i64) -> Self {
        Self::from_level(value != 0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sensor {
    pub id: SensorId,
    pub address: String,
    pub location: String,
    pub zone: ZoneId,
    pub unit: i64,
    pub user: i64,
    pub indoors: bool,
    #[serde(default)]
    pub bias: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Zone {
    pub id: ZoneId,
    pub name: String,
    pub user: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HeatAction {
    pub id: ActionId,
    pub name: String,
    pub zone: ZoneId,
    pub unit: i64,
    pub lag: LagEstimate,
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct LagEstimate {
    pub overshoot_above: f32,
    pub overshoot_below: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ActionLogEntry {
    pub action: ActionId,
    pub state: RelayState,
    pub target: f32,
    pub record_time: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TemperatureReading {
    pub sensor: SensorId,
    pub location: String,
    pub value: f32,
    pub record_time: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PendingMessage {
    pub id: i64,
    pub user: i64,
    pub zone: ZoneId,
    pub json: String,
    pub record_time: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relay_value_roundtrips_through_log_encoding() {
        assert_eq!(RelayState::from_value(RelayState::HeatOn.value()), RelayState::HeatOn);
        assert_eq!(RelayState::from_value(0), RelayState::HeatOff);
        assert_eq!(RelayState::HeatOff.as_str(), "HEAT_OFF");
    }
}
