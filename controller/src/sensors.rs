use std::{
    collections::{BTreeMap, HashMap},
    io::ErrorKind,
    path::PathBuf,
    sync::Arc,
    time::Duration,
};

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use heating_common::{
    aggregate, AggregationConfig, AllSensorsUnavailable, Sensor, SensorError, TemperatureReading,
    ZoneId,
};

pub trait SensorBus: Send + Sync {
    fn read_f(&self, address: &str) -> Result<f32, SensorError>;
}

#[derive(Debug, Clone)]
pub struct W1Bus {
    root: PathBuf,
}

impl W1Bus {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl SensorBus for W1Bus {
    fn read_f(&self, address: &str) -> Result<f32, SensorError> {
        let path = self.root.join(address).join("w1_slave");
        let raw = std::fs::read_to_string(&path).map_err(|err| match err.kind() {
            ErrorKind::NotFound => SensorError::Offline {
                address: address.to_string(),
            },
            _ => SensorError::Io {
                address: address.to_string(),
                source: err,
            },
        })?;
        parse_w1_slave(address, &raw)
    }
}

fn parse_w1_slave(address: &str, raw: &str) -> Result<f32, SensorError> {
    let parse_err = |detail: &str| SensorError::Parse {
        address: address.to_string(),
        detail: detail.to_string(),
    };

    let mut lines = raw.lines();
    let crc = lines.next().ok_or_else(|| parse_err("empty device file"))?;
    if !crc.trim_end().ends_with("YES") {
        return Err(parse_err("crc check failed"));
    }
    let data = lines.next().ok_or_else(|| parse_err("missing temperature line"))?;
    let (_, milli) = data
        .split_once("t=")
        .ok_or_else(|| parse_err("missing t= field"))?;
    let milli: i32 = milli
        .trim()
        .parse()
        .map_err(|_| parse_err("t= field is not an integer"))?;

    let celsius = milli as f32 / 1000.0;
    Ok(celsius * 9.0 / 5.0 + 32.0)
}

#[cfg(test)]
#[derive(Debug, Default)]
pub struct SimulatedBus {
    values: std::sync::Mutex<HashMap<String, f32>>,
}

#[cfg(test)]
impl SimulatedBus {
    pub fn with(values: &[(&str, f32)]) -> Self {
        Self {
            values: std::sync::Mutex::new(
                values
                    .iter()
                    .map(|(address, value)| (address.to_string(), *value))
                    .collect(),
            ),
        }
    }

    pub fn set(&self, address: &str, value: f32) {
        self.values
            .lock()
            .unwrap()
            .insert(address.to_string(), value);
    }
}

#[cfg(test)]
impl SensorBus for SimulatedBus {
    fn read_f(&self, address: &str) -> Result<f32, SensorError> {
        self.values
            .lock()
            .unwrap()
            .get(address)
            .copied()
            .ok_or_else(|| SensorError::Offline {
                address: address.to_string(),
            })
    }
}

#[derive(Clone)]
pub struct SensorReader {
    bus: Arc<dyn SensorBus>,
    timeout: Duration,
}

impl SensorReader {
    pub fn new(bus: Arc<dyn SensorBus>, timeout: Duration) -> Self {
        Self { bus, timeout }
    }

    pub async fn read(&self, address: &str) -> Result<f32, SensorError> {
        let bus = self.bus.clone();
        let owned = address.to_string();
        let task = tokio::task::spawn_blocking(move || bus.read_f(&owned));

        match tokio::time::timeout(self.timeout, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_err)) => Err(SensorError::Io {
                address: address.to_string(),
                source: std::io::Error::new(ErrorKind::Other, join_err.to_string()),
            }),
            Err(_) => Err(SensorError::Timeout {
                address: address.to_string(),
            }),
        }
    }

    pub async fn read_all(&self, sensors: &[Sensor], at: DateTime<Utc>) -> Vec<TemperatureReading> {
        let mut readings = Vec::with_capacity(sensors.len());
        for sensor in sensors {
            match self.read(&sensor.address).await {
                Ok(value) => readings.push(TemperatureReading {
                    sensor: sensor.id,
                    location: sensor.location.clone(),
                    value,
                    record_time: at,
                }),
                Err(err @ SensorError::Offline { .. }) => debug!("skipping sensor {}: {err}", sensor.id),
                Err(err) => warn!("sensor {} ({}) read failed: {err}", sensor.id, sensor.location),
            }
        }
        readings
    }

    pub async fn zone_rooms(
        &self,
        zone: ZoneId,
        sensors: &[Sensor],
        config: &AggregationConfig,
        at: DateTime<Utc>,
    ) -> Result<BTreeMap<String, f32>, AllSensorsUnavailable> {
        let zone_sensors: Vec<Sensor> = sensors
            .iter()
            .filter(|sensor| sensor.zone == zone && sensor.indoors)
            .cloned()
            .collect();
        let biases: HashMap<i64, f32> = zone_sensors
            .iter()
            .map(|sensor| (sensor.id, sensor.bias))
            .collect();

        let readings = self.read_all(&zone_sensors, at).await;
        let rooms = aggregate::room_averages(&readings, &biases, config);
        if rooms.is_empty() {
            return Err(AllSensorsUnavailable { zone });
        }
        Ok(rooms)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn sensor(id: i64, address: &str, location: &str, zone: ZoneId) -> Sensor {
        Sensor {
            id,
            address: address.to_string(),
            location: location.to_string(),
            zone,
            unit: 1,
            user: 1,
            indoors: true,
            bias: 0.0,
        }
    }

    #[test]
    fn parses_w1_slave_payload() {
        let raw = "72 01 4b 46 7f ff 0e 10 57 : crc=57 YES\n72 01 4b 46 7f ff 0e 10 57 t=20000\n";
        assert_eq!(parse_w1_slave("28-1", raw).unwrap(), 68.0);
    }

    #[test]
    fn rejects_bad_crc() {
        let raw = "72 01 4b 46 7f ff 0e 10 57 : crc=57 NO\n72 01 4b 46 7f ff 0e 10 57 t=20000\n";
        assert!(matches!(parse_w1_slave("28-1", raw), Err(SensorError::Parse { .. })));
    }

    #[test]
    fn missing_device_directory_is_offline() {
        let dir = tempfile::tempdir().unwrap();
        let bus = W1Bus::new(dir.path());
        assert!(matches!(bus.read_f("28-absent"), Err(SensorError::Offline { .. })));

        let device = dir.path().join("28-present");
        std::fs::create_dir(&device).unwrap();
        std::fs::write(device.join("w1_slave"), "aa : crc=aa YES\naa t=-5000\n").unwrap();
        assert_eq!(bus.read_f("28-present").unwrap(), 23.0);
    }

    #[tokio::test]
    async fn offline_sensors_are_skipped() {
        let bus = Arc::new(SimulatedBus::with(&[("a", 67.0), ("c", 71.0)]));
        let reader = SensorReader::new(bus, Duration::from_secs(1));
        let sensors = vec![
            sensor(1, "a", "Den", 1),
            sensor(2, "b", "Den", 1),
            sensor(3, "c", "Kitchen", 1),
            sensor(4, "d", "Garage", 2),
        ];

        let rooms = reader
            .zone_rooms(1, &sensors, &AggregationConfig::default(), Utc::now())
            .await
            .unwrap();

        assert_eq!(
            rooms,
            BTreeMap::from([("Den".to_string(), 67.0), ("Kitchen".to_string(), 71.0)])
        );
    }

    #[tokio::test]
    async fn outdoor_sensors_are_left_out_of_zone_rooms() {
        let bus = Arc::new(SimulatedBus::with(&[("a", 70.0), ("o", 20.0)]));
        let reader = SensorReader::new(bus, Duration::from_secs(1));
        let outside = Sensor {
            indoors: false,
            ..sensor(2, "o", "Outside", 1)
        };

        let rooms = reader
            .zone_rooms(1, &[sensor(1, "a", "Den", 1), outside.clone()], &AggregationConfig::default(), Utc::now())
            .await
            .unwrap();
        assert_eq!(rooms, BTreeMap::from([("Den".to_string(), 70.0)]));

        let err = reader
            .zone_rooms(1, &[outside], &AggregationConfig::default(), Utc::now())
            .await
            .unwrap_err();
        assert_eq!(err, AllSensorsUnavailable { zone: 1 });
    }

    #[tokio::test]
    async fn zone_without_any_reading_is_an_emergency() {
        let bus = Arc::new(SimulatedBus::default());
        let reader = SensorReader::new(bus, Duration::from_secs(1));

        let err = reader
            .zone_rooms(2, &[sensor(1, "a", "Den", 2)], &AggregationConfig::default(), Utc::now())
            .await
            .unwrap_err();

        assert_eq!(err, AllSensorsUnavailable { zone: 2 });
    }
}
