use std::path::Path;

use chrono::{DateTime, SecondsFormat, Utc};
use libsql::Builder;

use heating_common::{
    schedule::{DayOfWeek, ScheduleEntry, WeeklySchedule},
    ActionId, ActionLogEntry, HeatAction, LagEstimate, PendingMessage, RelayState, ScheduleError,
    Sensor, TemperatureReading, Zone, ZoneId,
};

use super::StoreError;

const SCHEMA: &str = include_str!("schema.sql");

const SENSOR_COLS: &str = "id, address, location, zone, unit, user, indoors, bias";
const ACTION_COLS: &str = "id, name, zone, unit, overshoot_above, overshoot_below";

pub(crate) fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|at| at.with_timezone(&Utc))
        .map_err(|err| StoreError::Query(format!("bad timestamp `{raw}`: {err}")))
}

fn row_to_sensor(row: &libsql::Row) -> Result<Sensor, StoreError> {
    Ok(Sensor {
        id: row.get(0)?,
        address: row.get(1)?,
        location: row.get(2)?,
        zone: row.get(3)?,
        unit: row.get(4)?,
        user: row.get(5)?,
        indoors: row.get::<i64>(6)? != 0,
        bias: row.get::<f64>(7)? as f32,
    })
}

fn row_to_action(row: &libsql::Row) -> Result<HeatAction, StoreError> {
    Ok(HeatAction {
        id: row.get(0)?,
        name: row.get(1)?,
        zone: row.get(2)?,
        unit: row.get(3)?,
        lag: LagEstimate {
            overshoot_above: row.get::<f64>(4)? as f32,
            overshoot_below: row.get::<f64>(5)? as f32,
        },
    })
}

fn row_to_log_entry(row: &libsql::Row) -> Result<ActionLogEntry, StoreError> {
    Ok(ActionLogEntry {
        action: row.get(0)?,
        state: RelayState::from_value(row.get(1)?),
        target: row.get::<f64>(2)? as f32,
        record_time: parse_timestamp(&row.get::<String>(3)?)?,
    })
}

fn row_to_reading(row: &libsql::Row) -> Result<TemperatureReading, StoreError> {
    Ok(TemperatureReading {
        sensor: row.get(0)?,
        location: row.get(1)?,
        value: row.get::<f64>(2)? as f32,
        record_time: parse_timestamp(&row.get::<String>(3)?)?,
    })
}

#[derive(Clone)]
pub struct Backend {
    name: &'static str,
    conn: Option<libsql::Connection>,
}

impl std::fmt::Debug for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backend")
            .field("name", &self.name)
            .field("online", &self.conn.is_some())
            .finish()
    }
}

impl Backend {
    pub fn offline(name: &'static str) -> Self {
        Self { name, conn: None }
    }

    pub async fn open_local(name: &'static str, path: &str) -> Result<Self, StoreError> {
        if path != ":memory:" {
            if let Some(parent) = Path::new(path).parent().filter(|dir| !dir.as_os_str().is_empty()) {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|err| StoreError::Query(format!("create {}: {err}", parent.display())))?;
            }
        }
        let db = Builder::new_local(path).build().await?;
        let backend = Self {
            name,
            conn: Some(db.connect()?),
        };
        backend.migrate().await?;
        Ok(backend)
    }

    pub async fn open_remote(name: &'static str, url: &str, token: &str) -> Result<Self, StoreError> {
        let db = Builder::new_remote(url.to_string(), token.to_string())
            .build()
            .await?;
        let backend = Self {
            name,
            conn: Some(db.connect()?),
        };
        backend.migrate().await?;
        Ok(backend)
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn is_online(&self) -> bool {
        self.conn.is_some()
    }

    fn conn(&self) -> Result<&libsql::Connection, StoreError> {
        self.conn
            .as_ref()
            .ok_or(StoreError::Unavailable { backend: self.name })
    }

    async fn migrate(&self) -> Result<(), StoreError> {
        self.conn()?
            .execute_batch(SCHEMA)
            .await
            .map_err(|err| StoreError::Query(format!("migration on {}: {err}", self.name)))?;
        Ok(())
    }

    pub async fn zones(&self, user: i64) -> Result<Vec<Zone>, StoreError> {
        let mut rows = self
            .conn()?
            .query("SELECT id, name, user FROM zone WHERE user = ?1 ORDER BY id", [user])
            .await?;
        let mut zones = Vec::new();
        while let Some(row) = rows.next().await? {
            zones.push(Zone {
                id: row.get(0)?,
                name: row.get(1)?,
                user: row.get(2)?,
            });
        }
        Ok(zones)
    }

    pub async fn upsert_zone(&self, zone: &Zone) -> Result<(), StoreError> {
        self.conn()?
            .execute(
                "INSERT INTO zone (id, name, user) VALUES (?1, ?2, ?3)
                 ON CONFLICT(id) DO UPDATE SET name = excluded.name, user = excluded.user",
                libsql::params![zone.id, zone.name.as_str(), zone.user],
            )
            .await?;
        Ok(())
    }

    pub async fn unit_sensors(&self, unit: i64) -> Result<Vec<Sensor>, StoreError> {
        self.sensors_where("unit = ?1", unit).await
    }

    pub async fn zone_sensors(&self, zone: ZoneId) -> Result<Vec<Sensor>, StoreError> {
        self.sensors_where("zone = ?1", zone).await
    }

    pub async fn user_sensors(&self, user: i64) -> Result<Vec<Sensor>, StoreError> {
        self.sensors_where("user = ?1", user).await
    }

    async fn sensors_where(&self, filter: &str, value: i64) -> Result<Vec<Sensor>, StoreError> {
        let mut rows = self
            .conn()?
            .query(
                &format!("SELECT {SENSOR_COLS} FROM sensor WHERE {filter} ORDER BY id"),
                [value],
            )
            .await?;
        let mut sensors = Vec::new();
        while let Some(row) = rows.next().await? {
            sensors.push(row_to_sensor(&row)?);
        }
        Ok(sensors)
    }

    pub async fn upsert_sensor(&self, sensor: &Sensor) -> Result<(), StoreError> {
        self.conn()?
            .execute(
                &format!(
                    "INSERT INTO sensor ({SENSOR_COLS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                     ON CONFLICT(id) DO UPDATE SET address = excluded.address,
                        location = excluded.location, zone = excluded.zone, unit = excluded.unit,
                        user = excluded.user, indoors = excluded.indoors, bias = excluded.bias"
                ),
                libsql::params![
                    sensor.id,
                    sensor.address.as_str(),
                    sensor.location.as_str(),
                    sensor.zone,
                    sensor.unit,
                    sensor.user,
                    i64::from(sensor.indoors),
                    f64::from(sensor.bias)
                ],
            )
            .await?;
        Ok(())
    }

    pub async fn unit_actions(&self, unit: i64) -> Result<Vec<HeatAction>, StoreError> {
        let mut rows = self
            .conn()?
            .query(
                &format!("SELECT {ACTION_COLS} FROM action WHERE unit = ?1 ORDER BY id"),
                [unit],
            )
            .await?;
        let mut actions = Vec::new();
        while let Some(row) = rows.next().await? {
            actions.push(row_to_action(&row)?);
        }
        Ok(actions)
    }

    pub async fn upsert_action(&self, action: &HeatAction) -> Result<(), StoreError> {
        self.conn()?
            .execute(
                &format!(
                    "INSERT INTO action ({ACTION_COLS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                     ON CONFLICT(id) DO UPDATE SET name = excluded.name, zone = excluded.zone,
                        unit = excluded.unit, overshoot_above = excluded.overshoot_above,
                        overshoot_below = excluded.overshoot_below"
                ),
                libsql::params![
                    action.id,
                    action.name.as_str(),
                    action.zone,
                    action.unit,
                    f64::from(action.lag.overshoot_above),
                    f64::from(action.lag.overshoot_below)
                ],
            )
            .await?;
        Ok(())
    }

    pub async fn update_lag(&self, action: ActionId, lag: LagEstimate) -> Result<(), StoreError> {
        let changed = self
            .conn()?
            .execute(
                "UPDATE action SET overshoot_above = ?1, overshoot_below = ?2 WHERE id = ?3",
                libsql::params![
                    f64::from(lag.overshoot_above),
                    f64::from(lag.overshoot_below),
                    action
                ],
            )
            .await?;
        if changed == 0 {
            return Err(StoreError::Query(format!("action {action} not found on {}", self.name)));
        }
        Ok(())
    }

    pub async fn insert_readings(&self, readings: &[TemperatureReading]) -> Result<(), StoreError> {
        let conn = self.conn()?;
        for reading in readings {
            conn.execute(
                "INSERT OR REPLACE INTO temperature (sensor, location, value, record_time)
                 VALUES (?1, ?2, ?3, ?4)",
                libsql::params![
                    reading.sensor,
                    reading.location.as_str(),
                    f64::from(reading.value),
                    timestamp(reading.record_time)
                ],
            )
            .await?;
        }
        Ok(())
    }

    pub async fn zone_readings(
        &self,
        zone: ZoneId,
        since: DateTime<Utc>,
    ) -> Result<Vec<TemperatureReading>, StoreError> {
        let mut rows = self
            .conn()?
            .query(
                "SELECT t.sensor, t.location, t.value, t.record_time
                 FROM temperature t JOIN sensor s ON s.id = t.sensor
                 WHERE s.zone = ?1 AND s.indoors = 1 AND t.record_time >= ?2
                 ORDER BY t.record_time",
                libsql::params![zone, timestamp(since)],
            )
            .await?;
        let mut readings = Vec::new();
        while let Some(row) = rows.next().await? {
            readings.push(row_to_reading(&row)?);
        }
        Ok(readings)
    }

    pub async fn insert_action_log(&self, entry: &ActionLogEntry) -> Result<(), StoreError> {
        self.conn()?
            .execute(
                "INSERT INTO action_log (action, value, target, record_time) VALUES (?1, ?2, ?3, ?4)",
                libsql::params![
                    entry.action,
                    entry.state.value(),
                    f64::from(entry.target),
                    timestamp(entry.record_time)
                ],
            )
            .await?;
        Ok(())
    }

    pub async fn action_log_since(
        &self,
        action: ActionId,
        since: DateTime<Utc>,
    ) -> Result<Vec<ActionLogEntry>, StoreError> {
        let mut rows = self
            .conn()?
            .query(
                "SELECT action, value, target, record_time FROM action_log
                 WHERE action = ?1 AND record_time >= ?2
                 ORDER BY record_time DESC, id DESC",
                libsql::params![action, timestamp(since)],
            )
            .await?;
        let mut entries = Vec::new();
        while let Some(row) = rows.next().await? {
            entries.push(row_to_log_entry(&row)?);
        }
        Ok(entries)
    }

    pub async fn schedules(&self, user: i64) -> Result<Vec<WeeklySchedule>, StoreError> {
        let conn = self.conn()?;
        let mut rows = conn
            .query(
                "SELECT id, user, zone, name, active FROM thermostat_schedule
                 WHERE user = ?1 ORDER BY id",
                [user],
            )
            .await?;
        let mut schedules = Vec::new();
        while let Some(row) = rows.next().await? {
            schedules.push(WeeklySchedule {
                id: row.get(0)?,
                user: row.get(1)?,
                zone: row.get(2)?,
                name: row.get(3)?,
                active: row.get::<i64>(4)? != 0,
                entries: Vec::new(),
            });
        }

        for schedule in &mut schedules {
            let mut rows = conn
                .query(
                    "SELECT room, weekday, minutes, target FROM schedule_entry
                     WHERE schedule = ?1 ORDER BY room, minutes",
                    [schedule.id],
                )
                .await?;
            while let Some(row) = rows.next().await? {
                let weekday = row.get::<String>(1)?;
                let day = DayOfWeek::parse(&weekday)
                    .ok_or_else(|| StoreError::Query(format!("bad weekday `{weekday}`")))?;
                let minutes = row.get::<i64>(2)?;
                schedule.entries.push(ScheduleEntry {
                    room: row.get(0)?,
                    day,
                    start_minutes: u16::try_from(minutes)
                        .map_err(|_| StoreError::Query(format!("bad start minute {minutes}")))?,
                    target_temp_f: row.get::<f64>(3)? as f32,
                });
            }
        }

        Ok(schedules)
    }

    pub async fn put_schedule(&self, schedule: &WeeklySchedule) -> Result<(), StoreError> {
        let tx = self.conn()?.transaction().await?;
        let result = write_schedule(&tx, schedule).await;
        finish(tx, result).await
    }

    pub async fn activate_schedule(
        &self,
        user: i64,
        zone: ZoneId,
        schedule: i64,
    ) -> Result<(), StoreError> {
        let tx = self.conn()?.transaction().await?;
        let result = write_activation(&tx, user, zone, schedule).await;
        finish(tx, result).await
    }

    pub async fn insert_message(
        &self,
        user: i64,
        zone: ZoneId,
        kind: &str,
        json: &str,
        record_time: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.conn()?
            .execute(
                "INSERT INTO message (user, zone, json, type, received, record_time)
                 VALUES (?1, ?2, ?3, ?4, 0, ?5)",
                libsql::params![user, zone, json, kind, timestamp(record_time)],
            )
            .await?;
        Ok(())
    }

    pub async fn pending_messages(
        &self,
        zone: ZoneId,
        kind: &str,
    ) -> Result<Vec<PendingMessage>, StoreError> {
        let mut rows = self
            .conn()?
            .query(
                "SELECT id, user, zone, json, record_time FROM message
                 WHERE zone = ?1 AND type = ?2 AND received = 0
                 ORDER BY record_time, id",
                libsql::params![zone, kind],
            )
            .await?;
        let mut messages = Vec::new();
        while let Some(row) = rows.next().await? {
            messages.push(PendingMessage {
                id: row.get(0)?,
                user: row.get(1)?,
                zone: row.get(2)?,
                json: row.get(3)?,
                record_time: parse_timestamp(&row.get::<String>(4)?)?,
            });
        }
        Ok(messages)
    }

    // Message ids differ between backends, so consumption is recorded by creation time.
    pub async fn mark_consumed(
        &self,
        zone: ZoneId,
        kind: &str,
        through: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        Ok(self
            .conn()?
            .execute(
                "UPDATE message SET received = 1
                 WHERE zone = ?1 AND type = ?2 AND received = 0 AND record_time <= ?3",
                libsql::params![zone, kind, timestamp(through)],
            )
            .await?)
    }

    pub async fn prune(&self, before: DateTime<Utc>) -> Result<u64, StoreError> {
        let conn = self.conn()?;
        let cutoff = timestamp(before);
        let mut removed = 0;
        removed += conn
            .execute("DELETE FROM temperature WHERE record_time < ?1", [cutoff.as_str()])
            .await?;
        removed += conn
            .execute("DELETE FROM action_log WHERE record_time < ?1", [cutoff.as_str()])
            .await?;
        removed += conn
            .execute(
                "DELETE FROM message WHERE received = 1 AND record_time < ?1",
                [cutoff.as_str()],
            )
            .await?;
        Ok(removed)
    }
}

async fn finish(tx: libsql::Transaction, result: Result<(), StoreError>) -> Result<(), StoreError> {
    match result {
        Ok(()) => {
            tx.commit().await?;
            Ok(())
        }
        Err(err) => {
            tx.rollback().await?;
            Err(err)
        }
    }
}

async fn write_schedule(conn: &libsql::Connection, schedule: &WeeklySchedule) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO thermostat_schedule (id, user, zone, name, active) VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(id) DO UPDATE SET user = excluded.user, zone = excluded.zone,
            name = excluded.name, active = excluded.active",
        libsql::params![
            schedule.id,
            schedule.user,
            schedule.zone,
            schedule.name.as_str(),
            i64::from(schedule.active)
        ],
    )
    .await?;
    conn.execute("DELETE FROM schedule_entry WHERE schedule = ?1", [schedule.id])
        .await?;
    for entry in &schedule.entries {
        conn.execute(
            "INSERT INTO schedule_entry (schedule, room, weekday, minutes, target)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            libsql::params![
                schedule.id,
                entry.room.as_str(),
                entry.day.as_str(),
                i64::from(entry.start_minutes),
                f64::from(entry.target_temp_f)
            ],
        )
        .await?;
    }
    Ok(())
}

async fn write_activation(
    conn: &libsql::Connection,
    user: i64,
    zone: ZoneId,
    schedule: i64,
) -> Result<(), StoreError> {
    let found = conn
        .execute(
            "UPDATE thermostat_schedule SET active = 1 WHERE id = ?1 AND user = ?2 AND zone = ?3",
            libsql::params![schedule, user, zone],
        )
        .await?;
    if found == 0 {
        return Err(ScheduleError::NotFound { user, zone }.into());
    }
    conn.execute(
        "UPDATE thermostat_schedule SET active = 0 WHERE user = ?1 AND zone = ?2 AND id != ?3",
        libsql::params![user, zone, schedule],
    )
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn week(target: f32) -> WeeklySchedule {
        WeeklySchedule {
            id: 1,
            user: 1,
            zone: 1,
            name: "Winter".to_string(),
            active: true,
            entries: DayOfWeek::ALL
                .into_iter()
                .map(|day| ScheduleEntry {
                    room: "Den".to_string(),
                    day,
                    start_minutes: 6 * 60,
                    target_temp_f: target,
                })
                .collect(),
        }
    }

    #[tokio::test]
    async fn failed_schedule_rewrite_keeps_the_previous_week() {
        let backend = Backend::open_local("local", ":memory:").await.unwrap();
        backend.put_schedule(&week(68.0)).await.unwrap();
        backend
            .conn()
            .unwrap()
            .execute_batch(
                "CREATE TRIGGER reject_sunday BEFORE INSERT ON schedule_entry
                 WHEN NEW.weekday = 'SUN'
                 BEGIN SELECT RAISE(ABORT, 'sunday rejected'); END;",
            )
            .await
            .unwrap();

        assert!(backend.put_schedule(&week(72.0)).await.is_err());

        let stored = backend.schedules(1).await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].entries.len(), 7);
        assert!(stored[0].entries.iter().all(|entry| entry.target_temp_f == 68.0));
    }

    #[tokio::test]
    async fn activating_a_missing_schedule_changes_nothing() {
        let backend = Backend::open_local("local", ":memory:").await.unwrap();
        backend.put_schedule(&week(68.0)).await.unwrap();

        assert!(backend.activate_schedule(1, 1, 42).await.is_err());

        assert!(backend.schedules(1).await.unwrap()[0].active);
    }
}
