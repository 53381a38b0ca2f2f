use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, warn};

use heating_common::{aggregate, AggregationConfig, Sensor, TemperatureReading, ZoneId};

use crate::{
    sensors::SensorReader,
    store::{StateStore, StoreError},
};

#[derive(Debug, Default, Clone, PartialEq)]
pub struct RecordOutcome {
    pub written: Vec<TemperatureReading>,
    pub rejected: Vec<TemperatureReading>,
}

pub struct Recorder<'a> {
    pub store: &'a StateStore,
    pub reader: &'a SensorReader,
    pub config: &'a AggregationConfig,
    pub validate: bool,
}

impl Recorder<'_> {
    pub async fn record(&self, sensors: &[Sensor], now: DateTime<Utc>) -> Result<RecordOutcome, StoreError> {
        let readings = self.reader.read_all(sensors, now).await;
        if readings.is_empty() {
            debug!("no local sensor answered, nothing recorded");
            return Ok(RecordOutcome::default());
        }

        let mut outcome = RecordOutcome::default();
        if self.validate {
            // Zone history covers indoor sensors only; outdoor readings are stored unchecked.
            let zone_of: BTreeMap<i64, ZoneId> = sensors
                .iter()
                .filter(|sensor| sensor.indoors)
                .map(|sensor| (sensor.id, sensor.zone))
                .collect();
            let mut history: BTreeMap<ZoneId, Vec<f32>> = BTreeMap::new();

            for reading in readings {
                let Some(&zone) = zone_of.get(&reading.sensor) else {
                    outcome.written.push(reading);
                    continue;
                };
                if !history.contains_key(&zone) {
                    let values = self.zone_history(zone, now).await;
                    history.insert(zone, values);
                }
                let values = history.get(&zone).map(Vec::as_slice).unwrap_or_default();

                if aggregate::is_plausible(reading.value, values, self.config) {
                    outcome.written.push(reading);
                } else {
                    warn!(
                        "rejecting outlier {:.2}°F from sensor {} ({})",
                        reading.value, reading.sensor, reading.location
                    );
                    outcome.rejected.push(reading);
                }
            }
        } else {
            outcome.written = readings;
        }

        if !outcome.written.is_empty() {
            self.store.record_readings(&outcome.written).await?;
        }
        Ok(outcome)
    }

    async fn zone_history(&self, zone: ZoneId, now: DateTime<Utc>) -> Vec<f32> {
        let since = now - Duration::minutes(self.config.validation_lookback_minutes);
        match self.store.zone_readings(zone, since).await {
            Ok(readings) => readings.into_iter().map(|reading| reading.value).collect(),
            Err(err) => {
                warn!("no history for validating zone {zone}, accepting readings: {err}");
                Vec::new()
            }
        }
    }
}
