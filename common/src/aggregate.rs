use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};

use crate::{
    config::AggregationConfig,
    types::{SensorId, TemperatureReading},
};

const SENTINEL_TOLERANCE_F: f32 = 0.05;

pub fn is_fault_sentinel(raw_f: f32, config: &AggregationConfig) -> bool {
    config
        .fault_sentinels_f
        .iter()
        .any(|sentinel| (raw_f - sentinel).abs() < SENTINEL_TOLERANCE_F)
}

pub fn clean_reading(raw_f: f32, bias_f: f32, config: &AggregationConfig) -> Option<f32> {
    if !raw_f.is_finite() || is_fault_sentinel(raw_f, config) {
        return None;
    }
    Some((raw_f - bias_f).clamp(config.low_clamp_f, config.high_clamp_f))
}

pub fn room_averages(
    readings: &[TemperatureReading],
    biases: &HashMap<SensorId, f32>,
    config: &AggregationConfig,
) -> BTreeMap<String, f32> {
    let mut sums: BTreeMap<&str, (f32, u32)> = BTreeMap::new();

    for reading in readings {
        let bias = biases.get(&reading.sensor).copied().unwrap_or(0.0);
        let Some(value) = clean_reading(reading.value, bias, config) else {
            continue;
        };
        let slot = sums.entry(reading.location.as_str()).or_insert((0.0, 0));
        slot.0 += value;
        slot.1 += 1;
    }

    sums.into_iter()
        .map(|(room, (sum, count))| (room.to_string(), sum / count as f32))
        .collect()
}

pub fn median<I>(values: I) -> Option<f32>
where
    I: IntoIterator<Item = f32>,
{
    let mut values: Vec<f32> = values.into_iter().filter(|value| value.is_finite()).collect();
    if values.is_empty() {
        return None;
    }
    values.sort_by(f32::total_cmp);

    let mid = values.len() / 2;
    if values.len() % 2 == 0 {
        Some((values[mid - 1] + values[mid]) / 2.0)
    } else {
        Some(values[mid])
    }
}

pub fn zone_value(rooms: &BTreeMap<String, f32>) -> Option<f32> {
    median(rooms.values().copied())
}

pub fn zone_series(
    readings: &[TemperatureReading],
    biases: &HashMap<SensorId, f32>,
    config: &AggregationConfig,
) -> Vec<(DateTime<Utc>, f32)> {
    let mut by_time: BTreeMap<DateTime<Utc>, Vec<TemperatureReading>> = BTreeMap::new();
    for reading in readings {
        by_time
            .entry(reading.record_time)
            .or_default()
            .push(reading.clone());
    }

    by_time
        .into_iter()
        .filter_map(|(at, batch)| zone_value(&room_averages(&batch, biases, config)).map(|value| (at, value)))
        .collect()
}

pub fn is_plausible(value: f32, history: &[f32], config: &AggregationConfig) -> bool {
    let start = history.len().saturating_sub(config.validation_limit);
    let mut unique: Vec<f32> = history[start..]
        .iter()
        .copied()
        .filter(|value| value.is_finite())
        .collect();
    unique.sort_by(f32::total_cmp);
    unique.dedup();

    if unique.len() < config.validation_min_samples {
        return true;
    }

    let n = unique.len() as f32;
    let mean = unique.iter().sum::<f32>() / n;
    let variance = unique.iter().map(|v| (v - mean).powi(2)).sum::<f32>() / n;
    let std = variance.sqrt();
    if std <= f32::EPSILON {
        return true;
    }

    (value - mean).abs() / std < config.validation_deviation
}
