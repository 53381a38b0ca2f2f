use serde::{Deserialize, Serialize};

use crate::{
    hysteresis::LagOrder,
    lag::LagPolicy,
    types::{ActionId, ZoneId},
};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    pub tick_interval_secs: u64,
    pub maintenance_interval_secs: u64,
    pub buffer_f: f32,
    pub lag_order: LagOrder,
    pub recent_window_minutes: i64,
    pub store_timeout_ms: u64,
    pub sensor_timeout_ms: u64,
    pub local_retention_days: i64,
    pub record_readings: bool,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: 10,
            maintenance_interval_secs: 60,
            buffer_f: 0.5,
            lag_order: LagOrder::BufferThenLag,
            recent_window_minutes: 5,
            store_timeout_ms: 5_000,
            sensor_timeout_ms: 2_000,
            local_retention_days: 14,
            record_readings: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregationConfig {
    pub low_clamp_f: f32,
    pub high_clamp_f: f32,
    pub fault_sentinels_f: Vec<f32>,
    pub validation_deviation: f32,
    pub validation_lookback_minutes: i64,
    pub validation_limit: usize,
    pub validation_min_samples: usize,
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            low_clamp_f: 32.0,
            high_clamp_f: 100.0,
            // DS18B20 power-on value (85°C) and its read-failure value (-127°C).
            fault_sentinels_f: vec![185.0, -196.6],
            validation_deviation: 3.0,
            validation_lookback_minutes: 5,
            validation_limit: 50,
            validation_min_samples: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LagConfig {
    pub transitions: usize,
    pub horizon_minutes: i64,
    pub min_samples: usize,
    pub policy: LagPolicy,
}

impl Default for LagConfig {
    fn default() -> Self {
        Self {
            transitions: 10,
            horizon_minutes: 30,
            min_samples: 3,
            policy: LagPolicy::Overwrite,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FallbackSensor {
    pub address: String,
    pub location: String,
    pub zone: ZoneId,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ZoneRelayConfig {
    pub zone: ZoneId,
    pub heat_pin: u8,
    pub fallback_action: ActionId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HardwareConfig {
    pub relays: Vec<ZoneRelayConfig>,
    pub fallback_sensors: Vec<FallbackSensor>,
    pub w1_root: String,
    pub halt_on_relay_fault: bool,
}

impl Default for HardwareConfig {
    fn default() -> Self {
        Self {
            relays: vec![ZoneRelayConfig {
                zone: 1,
                heat_pin: 25,
                fallback_action: 1,
            }],
            fallback_sensors: Vec::new(),
            w1_root: "/sys/bus/w1/devices".to_string(),
            halt_on_relay_fault: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub remote_url: Option<String>,
    pub remote_token: Option<String>,
    pub local_path: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            remote_url: None,
            remote_token: None,
            local_path: "./.heating/local.db".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub user: i64,
    pub unit: i64,
    pub timezone: String,
    pub control: ControlConfig,
    pub aggregation: AggregationConfig,
    pub lag: LagConfig,
    pub hardware: HardwareConfig,
    pub store: StoreConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            user: 1,
            unit: 1,
            timezone: "America/Los_Angeles".to_string(),
            control: ControlConfig::default(),
            aggregation: AggregationConfig::default(),
            lag: LagConfig::default(),
            hardware: HardwareConfig::default(),
            store: StoreConfig::default(),
        }
    }
}

impl RuntimeConfig {
    pub fn sanitize(&mut self) {
        self.control.sanitize();
        self.aggregation.sanitize();
        self.lag.sanitize();
    }

    pub fn relay_for_zone(&self, zone: ZoneId) -> Option<&ZoneRelayConfig> {
        self.hardware.relays.iter().find(|relay| relay.zone == zone)
    }
}

impl ControlConfig {
    pub fn sanitize(&mut self) {
        self.tick_interval_secs = self.tick_interval_secs.clamp(1, 600);
        self.maintenance_interval_secs = self
            .maintenance_interval_secs
            .max(self.tick_interval_secs);
        self.buffer_f = self.buffer_f.clamp(0.0, 5.0);
        self.recent_window_minutes = self.recent_window_minutes.clamp(1, 60);
        self.store_timeout_ms = self.store_timeout_ms.clamp(100, 60_000);
        self.sensor_timeout_ms = self.sensor_timeout_ms.clamp(100, 30_000);
        self.local_retention_days = self.local_retention_days.max(1);
    }
}

impl AggregationConfig {
    pub fn sanitize(&mut self) {
        if self.low_clamp_f > self.high_clamp_f {
            std::mem::swap(&mut self.low_clamp_f, &mut self.high_clamp_f);
        }
        self.validation_deviation = self.validation_deviation.max(0.5);
        self.validation_min_samples = self.validation_min_samples.max(2);
        self.validation_limit = self.validation_limit.max(self.validation_min_samples);
    }
}

impl LagConfig {
    pub fn sanitize(&mut self) {
        self.transitions = self.transitions.max(1);
        self.horizon_minutes = self.horizon_minutes.clamp(1, 240);
        self.min_samples = self.min_samples.max(1);
        if let LagPolicy::Accumulate { gain } = &mut self.policy {
            *gain = gain.clamp(0.01, 1.0);
        }
    }
}
