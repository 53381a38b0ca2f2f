use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    config::LagConfig,
    types::{ActionLogEntry, LagEstimate, RelayState},
};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LagPolicy {
    Overwrite,
    Accumulate { gain: f32 },
}

impl LagPolicy {
    fn apply(self, current: f32, sample_mean: f32) -> f32 {
        match self {
            Self::Overwrite => sample_mean,
            Self::Accumulate { gain } => current + gain * (sample_mean - current),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct LagSamples {
    pub overshoot: Vec<f32>,
    pub undershoot: Vec<f32>,
}

pub fn is_settled(transition: &ActionLogEntry, now: DateTime<Utc>, config: &LagConfig) -> bool {
    transition.record_time + Duration::minutes(config.horizon_minutes) <= now
}

pub fn collect_samples(
    actions: &[ActionLogEntry],
    series: &[(DateTime<Utc>, f32)],
    config: &LagConfig,
) -> LagSamples {
    let mut recent: Vec<&ActionLogEntry> = actions.iter().collect();
    recent.sort_by(|a, b| b.record_time.cmp(&a.record_time));
    recent.truncate(config.transitions);

    let horizon = Duration::minutes(config.horizon_minutes);
    let mut samples = LagSamples::default();

    for action in recent {
        let end = action.record_time + horizon;
        let window = series
            .iter()
            .filter(|(at, value)| *at >= action.record_time && *at <= end && value.is_finite())
            .map(|(_, value)| *value);

        match action.state {
            RelayState::HeatOn => {
                if let Some(min) = window.reduce(f32::min) {
                    samples.undershoot.push(min - action.target);
                }
            }
            RelayState::HeatOff => {
                if let Some(max) = window.reduce(f32::max) {
                    samples.overshoot.push(max - action.target);
                }
            }
        }
    }

    samples
}

pub fn recompute(
    current: LagEstimate,
    actions: &[ActionLogEntry],
    series: &[(DateTime<Utc>, f32)],
    config: &LagConfig,
) -> LagEstimate {
    let samples = collect_samples(actions, series, config);

    let update = |current: f32, values: &[f32]| {
        if values.len() < config.min_samples {
            return current;
        }
        let mean = values.iter().sum::<f32>() / values.len() as f32;
        config.policy.apply(current, mean)
    };

    LagEstimate {
        overshoot_above: update(current.overshoot_above, &samples.overshoot),
        overshoot_below: update(current.overshoot_below, &samples.undershoot),
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    const TARGET: f32 = 68.0;

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 5, 0, 0, 0).unwrap()
    }

    // Alternating on/off every hour; rooms overshoot by `over` after off and dip by `under` after on.
    fn history(cycles: usize, over: f32, under: f32) -> (Vec<ActionLogEntry>, Vec<(DateTime<Utc>, f32)>) {
        let mut actions = Vec::new();
        let mut series = Vec::new();
        for i in 0..cycles {
            let at = start() + Duration::hours(i as i64);
            let state = if i % 2 == 0 { RelayState::HeatOn } else { RelayState::HeatOff };
            actions.push(ActionLogEntry {
                action: 1,
                state,
                target: TARGET,
                record_time: at,
            });
            let peak = match state {
                RelayState::HeatOff => TARGET + over,
                RelayState::HeatOn => TARGET + under,
            };
            series.push((at, TARGET));
            series.push((at + Duration::minutes(10), peak));
            series.push((at + Duration::minutes(25), TARGET));
        }
        (actions, series)
    }

    #[test]
    fn overwrite_recovers_fixed_overshoot() {
        let (actions, series) = history(10, 1.5, -0.75);
        let estimate = recompute(LagEstimate::default(), &actions, &series, &LagConfig::default());

        assert!((estimate.overshoot_above - 1.5).abs() < 1e-4);
        assert!((estimate.overshoot_below + 0.75).abs() < 1e-4);
    }

    #[test]
    fn accumulate_converges_over_repeated_recomputes() {
        let (actions, series) = history(10, 1.2, -0.5);
        let config = LagConfig {
            policy: LagPolicy::Accumulate { gain: 0.5 },
            ..LagConfig::default()
        };

        let mut estimate = LagEstimate::default();
        let first = recompute(estimate, &actions, &series, &config);
        assert!((first.overshoot_above - 0.6).abs() < 1e-4);

        for _ in 0..20 {
            estimate = recompute(estimate, &actions, &series, &config);
        }
        assert!((estimate.overshoot_above - 1.2).abs() < 1e-3);
        assert!((estimate.overshoot_below + 0.5).abs() < 1e-3);
    }

    #[test]
    fn sparse_history_leaves_estimate_unchanged() {
        let (actions, series) = history(4, 2.0, -1.0);
        let current = LagEstimate {
            overshoot_above: 0.3,
            overshoot_below: -0.2,
        };

        // Two samples per direction, below the minimum of three.
        assert_eq!(recompute(current, &actions, &series, &LagConfig::default()), current);
    }

    #[test]
    fn transition_settles_after_the_horizon() {
        let config = LagConfig::default();
        let entry = ActionLogEntry {
            action: 1,
            state: RelayState::HeatOff,
            target: TARGET,
            record_time: start(),
        };

        assert!(!is_settled(&entry, start() + Duration::minutes(29), &config));
        assert!(is_settled(&entry, start() + Duration::minutes(30), &config));
    }

    #[test]
    fn only_most_recent_transitions_count() {
        let (mut actions, mut series) = history(12, 1.0, -0.5);
        // An ancient, wild transition outside the N most recent.
        let ancient = start() - Duration::days(3);
        actions.push(ActionLogEntry {
            action: 1,
            state: RelayState::HeatOff,
            target: TARGET,
            record_time: ancient,
        });
        series.push((ancient + Duration::minutes(5), TARGET + 9.0));

        let estimate = recompute(LagEstimate::default(), &actions, &series, &LagConfig::default());
        assert!((estimate.overshoot_above - 1.0).abs() < 1e-4);
    }
}
