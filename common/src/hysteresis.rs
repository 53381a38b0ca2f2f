use serde::{Deserialize, Serialize};

use crate::types::{LagEstimate, RelayState, ZoneId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LagOrder {
    // `off = target + buffer - above`, `on = target - buffer - below`.
    #[default]
    BufferThenLag,
    // Band of `±buffer` around `target - (above + below) / 2`.
    LagThenBuffer,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Thresholds {
    pub off: f32,
    pub on: f32,
}

#[derive(Debug, Clone)]
pub struct HysteresisController {
    zone: ZoneId,
    state: RelayState,
    buffer_f: f32,
    order: LagOrder,
}

impl HysteresisController {
    pub fn from_relay(zone: ZoneId, observed: RelayState, buffer_f: f32, order: LagOrder) -> Self {
        Self {
            zone,
            state: observed,
            buffer_f: buffer_f.max(0.0),
            order,
        }
    }

    pub fn zone(&self) -> ZoneId {
        self.zone
    }

    pub fn state(&self) -> RelayState {
        self.state
    }

    pub fn force(&mut self, state: RelayState) {
        self.state = state;
    }

    pub fn thresholds(&self, target_f: f32, lag: LagEstimate) -> Thresholds {
        match self.order {
            LagOrder::BufferThenLag => Thresholds {
                off: target_f + self.buffer_f - lag.overshoot_above,
                on: target_f - self.buffer_f - lag.overshoot_below,
            },
            LagOrder::LagThenBuffer => {
                let center = target_f - (lag.overshoot_above + lag.overshoot_below) / 2.0;
                Thresholds {
                    off: center + self.buffer_f,
                    on: center - self.buffer_f,
                }
            }
        }
    }

    pub fn decide(&mut self, target_f: f32, measured_f: f32, lag: LagEstimate) -> Option<RelayState> {
        if !target_f.is_finite() || !measured_f.is_finite() {
            return None;
        }

        let thresholds = self.thresholds(target_f, lag);
        let next = match self.state {
            RelayState::HeatOn if measured_f >= thresholds.off => RelayState::HeatOff,
            RelayState::HeatOff if measured_f < thresholds.on => RelayState::HeatOn,
            _ => return None,
        };

        self.state = next;
        Some(next)
    }
}
