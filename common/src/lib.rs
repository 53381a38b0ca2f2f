pub mod aggregate;
pub mod config;
pub mod error;
pub mod hysteresis;
pub mod lag;
pub mod overrides;
pub mod schedule;
pub mod types;

pub use config::{
    AggregationConfig, ControlConfig, FallbackSensor, HardwareConfig, LagConfig, RuntimeConfig,
    StoreConfig, ZoneRelayConfig,
};
pub use error::{AllSensorsUnavailable, OverrideError, ScheduleError, SensorError};
pub use hysteresis::{HysteresisController, LagOrder, Thresholds};
pub use lag::LagPolicy;
pub use overrides::{Override, OverridePayload, OverrideQueue, PollOutcome, OVERRIDE_MESSAGE_TYPE};
pub use schedule::{DayOfWeek, ScheduleEntry, WeeklySchedule};
pub use types::*;
