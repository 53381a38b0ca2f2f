mod backend;

use std::{
    collections::BTreeMap,
    future::Future,
    time::Duration,
};

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{debug, info, warn};

use heating_common::{
    ActionId, ActionLogEntry, HeatAction, LagEstimate, OverridePayload, PendingMessage,
    ScheduleError, Sensor, StoreConfig, TemperatureReading, WeeklySchedule, ZoneId,
    OVERRIDE_MESSAGE_TYPE,
};

pub use backend::Backend;

pub const REMOTE: &str = "remote";
pub const LOCAL: &str = "local";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{backend} store is unavailable")]
    Unavailable { backend: &'static str },
    #[error("{backend} store call timed out after {after:?}")]
    Timeout {
        backend: &'static str,
        after: Duration,
    },
    #[error("query failed: {0}")]
    Query(String),
    #[error("libSQL error: {0}")]
    LibSql(#[from] libsql::Error),
    #[error(transparent)]
    Schedule(#[from] ScheduleError),
    #[error("{what} failed on both stores: remote: {remote}; local: {local}")]
    BothFailed {
        what: &'static str,
        remote: Box<StoreError>,
        local: Box<StoreError>,
    },
}

impl StoreError {
    fn both(what: &'static str, remote: StoreError, local: StoreError) -> Self {
        Self::BothFailed {
            what,
            remote: Box::new(remote),
            local: Box::new(local),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteOutcome {
    pub remote: bool,
    pub local: bool,
}

#[derive(Debug, Clone)]
pub struct StateStore {
    remote: Backend,
    local: Backend,
    timeout: Duration,
}

impl StateStore {
    pub fn new(remote: Backend, local: Backend, timeout: Duration) -> Self {
        Self {
            remote,
            local,
            timeout,
        }
    }

    pub async fn open(config: &StoreConfig, timeout: Duration) -> Self {
        let remote = match (&config.remote_url, &config.remote_token) {
            (Some(url), token) => {
                let token = token.as_deref().unwrap_or_default();
                match tokio::time::timeout(timeout, Backend::open_remote(REMOTE, url, token)).await {
                    Ok(Ok(backend)) => {
                        info!("remote store connected at {url}");
                        backend
                    }
                    Ok(Err(err)) => {
                        warn!("remote store unavailable, continuing on local store: {err}");
                        Backend::offline(REMOTE)
                    }
                    Err(_) => {
                        warn!("remote store connect timed out after {timeout:?}, continuing on local store");
                        Backend::offline(REMOTE)
                    }
                }
            }
            (None, _) => {
                info!("no remote store configured");
                Backend::offline(REMOTE)
            }
        };

        let local = match Backend::open_local(LOCAL, &config.local_path).await {
            Ok(backend) => backend,
            Err(err) => {
                warn!("local store at {} unavailable: {err}", config.local_path);
                Backend::offline(LOCAL)
            }
        };

        Self::new(remote, local, timeout)
    }

    pub fn remote(&self) -> &Backend {
        &self.remote
    }

    #[cfg(test)]
    pub fn local(&self) -> &Backend {
        &self.local
    }

    async fn call<T, F, Fut>(&self, backend: &Backend, op: &F) -> Result<T, StoreError>
    where
        F: Fn(Backend) -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        if !backend.is_online() {
            return Err(StoreError::Unavailable {
                backend: backend.name(),
            });
        }
        match tokio::time::timeout(self.timeout, op(backend.clone())).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout {
                backend: backend.name(),
                after: self.timeout,
            }),
        }
    }

    pub async fn fallback_read<T, F, Fut>(&self, what: &'static str, op: F) -> Result<T, StoreError>
    where
        F: Fn(Backend) -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let remote_err = match self.call(&self.remote, &op).await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };
        if !matches!(remote_err, StoreError::Unavailable { .. }) {
            warn!("{what}: remote read failed, using local store: {remote_err}");
        }

        self.call(&self.local, &op)
            .await
            .map_err(|local_err| StoreError::both(what, remote_err, local_err))
    }

    pub async fn duplicate_write<F, Fut>(&self, what: &'static str, op: F) -> Result<WriteOutcome, StoreError>
    where
        F: Fn(Backend) -> Fut,
        Fut: Future<Output = Result<(), StoreError>>,
    {
        let (remote, local) = tokio::join!(self.call(&self.remote, &op), self.call(&self.local, &op));

        match (remote, local) {
            (Ok(()), Ok(())) => Ok(WriteOutcome {
                remote: true,
                local: true,
            }),
            (Ok(()), Err(err)) => {
                warn!("{what}: local write failed: {err}");
                Ok(WriteOutcome {
                    remote: true,
                    local: false,
                })
            }
            (Err(err), Ok(())) => {
                if !matches!(err, StoreError::Unavailable { .. }) {
                    warn!("{what}: remote write failed, kept locally: {err}");
                }
                Ok(WriteOutcome {
                    remote: false,
                    local: true,
                })
            }
            (Err(remote_err), Err(local_err)) => Err(StoreError::both(what, remote_err, local_err)),
        }
    }

    pub async fn local_only<T, F, Fut>(&self, op: F) -> Result<T, StoreError>
    where
        F: Fn(Backend) -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        self.call(&self.local, &op).await
    }

    pub async fn unit_sensors(&self, unit: i64) -> Result<Vec<Sensor>, StoreError> {
        self.fallback_read("sensors", |b| async move { b.unit_sensors(unit).await })
            .await
    }

    pub async fn zone_sensors(&self, zone: ZoneId) -> Result<Vec<Sensor>, StoreError> {
        self.fallback_read("zone sensors", |b| async move { b.zone_sensors(zone).await })
            .await
    }

    pub async fn unit_actions(&self, unit: i64) -> Result<Vec<HeatAction>, StoreError> {
        self.fallback_read("actions", |b| async move { b.unit_actions(unit).await })
            .await
    }

    pub async fn schedules(&self, user: i64) -> Result<Vec<WeeklySchedule>, StoreError> {
        self.fallback_read("schedules", |b| async move { b.schedules(user).await })
            .await
    }

    pub async fn zone_readings(
        &self,
        zone: ZoneId,
        since: DateTime<Utc>,
    ) -> Result<Vec<TemperatureReading>, StoreError> {
        self.fallback_read("readings", |b| async move { b.zone_readings(zone, since).await })
            .await
    }

    pub async fn record_readings(&self, readings: &[TemperatureReading]) -> Result<WriteOutcome, StoreError> {
        self.duplicate_write("readings", |b| async move { b.insert_readings(readings).await })
            .await
    }

    pub async fn log_action(&self, entry: &ActionLogEntry) -> Result<WriteOutcome, StoreError> {
        self.duplicate_write("action log", |b| async move { b.insert_action_log(entry).await })
            .await
    }

    pub async fn action_log_since(
        &self,
        action: ActionId,
        since: DateTime<Utc>,
    ) -> Result<Vec<ActionLogEntry>, StoreError> {
        self.fallback_read("action log", |b| async move {
            b.action_log_since(action, since).await
        })
        .await
    }

    pub async fn action_status(
        &self,
        action: ActionId,
        now: DateTime<Utc>,
    ) -> Result<Option<ActionLogEntry>, StoreError> {
        let since = now - chrono::Duration::hours(12);
        Ok(self
            .action_log_since(action, since)
            .await?
            .into_iter()
            .next())
    }

    pub async fn update_lag(&self, action: ActionId, lag: LagEstimate) -> Result<WriteOutcome, StoreError> {
        self.duplicate_write("lag estimate", |b| async move { b.update_lag(action, lag).await })
            .await
    }

    // Pending overrides from both backends, oldest first. A message written only locally during
    // a remote outage is still seen once the remote is back; copies held by both appear once.
    pub async fn pending_overrides(&self, zone: ZoneId) -> Result<Vec<PendingMessage>, StoreError> {
        let op = |b: Backend| async move { b.pending_messages(zone, OVERRIDE_MESSAGE_TYPE).await };
        let (remote, local) = tokio::join!(self.call(&self.remote, &op), self.call(&self.local, &op));

        let mut messages = match (remote, local) {
            (Ok(mut remote), Ok(local)) => {
                remote.extend(local);
                remote
            }
            (Ok(remote), Err(err)) => {
                warn!("override messages: local read failed: {err}");
                remote
            }
            (Err(err), Ok(local)) => {
                if !matches!(err, StoreError::Unavailable { .. }) {
                    warn!("override messages: remote read failed, using local store: {err}");
                }
                local
            }
            (Err(remote_err), Err(local_err)) => {
                return Err(StoreError::both("override messages", remote_err, local_err));
            }
        };

        messages.sort_by(|a, b| (a.record_time, &a.json).cmp(&(b.record_time, &b.json)));
        messages.dedup_by(|a, b| a.record_time == b.record_time && a.json == b.json);
        Ok(messages)
    }

    pub async fn mark_overrides_consumed(
        &self,
        zone: ZoneId,
        through: DateTime<Utc>,
    ) -> Result<WriteOutcome, StoreError> {
        self.duplicate_write("consume overrides", |b| async move {
            b.mark_consumed(zone, OVERRIDE_MESSAGE_TYPE, through)
                .await
                .map(|_| ())
        })
        .await
    }

    pub async fn post_override(
        &self,
        user: i64,
        zone: ZoneId,
        targets: &BTreeMap<String, f32>,
        expiration: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<WriteOutcome, StoreError> {
        let payload = OverridePayload::new(zone, targets, expiration);
        let json = serde_json::to_string(&payload)
            .map_err(|err| StoreError::Query(format!("encode override: {err}")))?;
        let json = json.as_str();

        self.duplicate_write("post override", |b| async move {
            b.insert_message(user, zone, OVERRIDE_MESSAGE_TYPE, json, now)
                .await
        })
        .await
    }

    pub async fn post_zone_override(
        &self,
        user: i64,
        zone: ZoneId,
        target_f: f32,
        expiration: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<WriteOutcome, StoreError> {
        let targets: BTreeMap<String, f32> = self
            .zone_sensors(zone)
            .await?
            .into_iter()
            .map(|sensor| (sensor.location, target_f))
            .collect();
        if targets.is_empty() {
            return Err(StoreError::Query(format!("zone {zone} has no sensors to target")));
        }
        self.post_override(user, zone, &targets, expiration, now)
            .await
    }

    pub async fn create_schedule(&self, schedule: &WeeklySchedule) -> Result<WriteOutcome, StoreError> {
        let mut schedule = schedule.clone();
        schedule.normalize()?;

        let existing = self.schedules(schedule.user).await?;
        if existing
            .iter()
            .any(|other| other.zone == schedule.zone && other.name == schedule.name)
        {
            return Err(ScheduleError::Duplicate {
                user: schedule.user,
                zone: schedule.zone,
                name: schedule.name,
            }
            .into());
        }

        let schedule = &schedule;
        self.duplicate_write("create schedule", |b| async move { b.put_schedule(schedule).await })
            .await
    }

    pub async fn update_schedule(&self, schedule: &WeeklySchedule) -> Result<WriteOutcome, StoreError> {
        let mut schedule = schedule.clone();
        schedule.normalize()?;

        let existing = self.schedules(schedule.user).await?;
        if !existing.iter().any(|other| other.id == schedule.id) {
            return Err(ScheduleError::NotFound {
                user: schedule.user,
                zone: schedule.zone,
            }
            .into());
        }

        let schedule = &schedule;
        self.duplicate_write("update schedule", |b| async move { b.put_schedule(schedule).await })
            .await
    }

    pub async fn activate_schedule(
        &self,
        user: i64,
        zone: ZoneId,
        schedule: i64,
    ) -> Result<WriteOutcome, StoreError> {
        self.duplicate_write("activate schedule", |b| async move {
            b.activate_schedule(user, zone, schedule).await
        })
        .await
    }

    pub async fn mirror_configuration(&self, user: i64, unit: i64) -> Result<(), StoreError> {
        let remote = self.remote.clone();
        let zones = self.call(&remote, &|b: Backend| async move { b.zones(user).await }).await?;
        let sensors = self
            .call(&remote, &|b: Backend| async move { b.user_sensors(user).await })
            .await?;
        let actions = self
            .call(&remote, &|b: Backend| async move { b.unit_actions(unit).await })
            .await?;
        let schedules = self
            .call(&remote, &|b: Backend| async move { b.schedules(user).await })
            .await?;

        let (zones, sensors, actions, schedules) = (&zones, &sensors, &actions, &schedules);
        self.local_only(|b| async move {
            for zone in zones {
                b.upsert_zone(zone).await?;
            }
            for sensor in sensors {
                b.upsert_sensor(sensor).await?;
            }
            for action in actions {
                b.upsert_action(action).await?;
            }
            for schedule in schedules {
                b.put_schedule(schedule).await?;
            }
            Ok::<(), StoreError>(())
        })
        .await?;

        debug!(
            "mirrored {} zones, {} sensors, {} actions, {} schedules to local store",
            zones.len(),
            sensors.len(),
            actions.len(),
            schedules.len()
        );
        Ok(())
    }

    pub async fn prune_local(&self, now: DateTime<Utc>, retention: chrono::Duration) -> Result<u64, StoreError> {
        let before = now - retention;
        self.local_only(|b| async move { b.prune(before).await })
            .await
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration as ChronoDuration, TimeZone};
    use heating_common::{DayOfWeek, RelayState, ScheduleEntry, Zone};
    use pretty_assertions::assert_eq;

    use super::*;

    const TIMEOUT: Duration = Duration::from_secs(5);

    async fn memory(name: &'static str) -> Backend {
        Backend::open_local(name, ":memory:").await.unwrap()
    }

    fn at(hour: u32, minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 5, hour, minute, 0).unwrap()
    }

    fn sensor(id: i64, location: &str) -> Sensor {
        Sensor {
            id,
            address: format!("28-00000{id}"),
            location: location.to_string(),
            zone: 1,
            unit: 1,
            user: 1,
            indoors: true,
            bias: 0.0,
        }
    }

    fn reading(sensor: i64, location: &str, value: f32, record_time: DateTime<Utc>) -> TemperatureReading {
        TemperatureReading {
            sensor,
            location: location.to_string(),
            value,
            record_time,
        }
    }

    fn weekly(id: i64, name: &str) -> WeeklySchedule {
        WeeklySchedule {
            id,
            user: 1,
            zone: 1,
            name: name.to_string(),
            active: false,
            entries: DayOfWeek::ALL
                .into_iter()
                .map(|day| ScheduleEntry {
                    room: "Den".to_string(),
                    day,
                    start_minutes: 6 * 60,
                    target_temp_f: 68.0,
                })
                .collect(),
        }
    }

    #[tokio::test]
    async fn reads_fall_back_to_local_when_remote_is_down() {
        let local = memory(LOCAL).await;
        local.upsert_sensor(&sensor(1, "Den")).await.unwrap();
        let store = StateStore::new(Backend::offline(REMOTE), local, TIMEOUT);

        let sensors = store.unit_sensors(1).await.unwrap();

        assert_eq!(sensors, vec![sensor(1, "Den")]);
    }

    #[tokio::test]
    async fn remote_is_preferred_when_it_answers() {
        let remote = memory(REMOTE).await;
        remote.upsert_sensor(&sensor(1, "Remote Den")).await.unwrap();
        let local = memory(LOCAL).await;
        local.upsert_sensor(&sensor(1, "Local Den")).await.unwrap();
        let store = StateStore::new(remote, local, TIMEOUT);

        let sensors = store.unit_sensors(1).await.unwrap();

        assert_eq!(sensors[0].location, "Remote Den");
    }

    #[tokio::test]
    async fn slow_remote_times_out_and_local_answers() {
        let store = StateStore::new(memory(REMOTE).await, memory(LOCAL).await, Duration::from_millis(50));

        let answered = store
            .fallback_read("slow read", |b| async move {
                if b.name() == REMOTE {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                }
                Ok::<_, StoreError>(b.name())
            })
            .await
            .unwrap();

        assert_eq!(answered, LOCAL);
    }

    #[tokio::test]
    async fn read_fails_only_when_both_fail() {
        let store = StateStore::new(Backend::offline(REMOTE), Backend::offline(LOCAL), TIMEOUT);
        let err = store.unit_sensors(1).await.unwrap_err();
        assert!(matches!(err, StoreError::BothFailed { what: "sensors", .. }));
    }

    #[tokio::test]
    async fn duplicate_write_survives_remote_outage_and_is_readable_later() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("local.db");
        let path = path.to_str().unwrap();

        let writer = StateStore::new(
            Backend::offline(REMOTE),
            Backend::open_local(LOCAL, path).await.unwrap(),
            TIMEOUT,
        );
        writer
            .local()
            .upsert_sensor(&sensor(1, "Den"))
            .await
            .unwrap();
        let outcome = writer
            .record_readings(&[reading(1, "Den", 67.5, at(8, 0))])
            .await
            .unwrap();
        assert_eq!(
            outcome,
            WriteOutcome {
                remote: false,
                local: true
            }
        );
        drop(writer);

        let reader = StateStore::new(
            Backend::offline(REMOTE),
            Backend::open_local(LOCAL, path).await.unwrap(),
            TIMEOUT,
        );
        let readings = reader.zone_readings(1, at(7, 59)).await.unwrap();
        assert_eq!(readings, vec![reading(1, "Den", 67.5, at(8, 0))]);
    }

    #[tokio::test]
    async fn write_with_both_online_reads_back_after_remote_outage() {
        let remote = memory(REMOTE).await;
        let local = memory(LOCAL).await;
        for backend in [&remote, &local] {
            backend.upsert_sensor(&sensor(1, "Den")).await.unwrap();
        }
        let store = StateStore::new(remote, local.clone(), TIMEOUT);

        let outcome = store
            .record_readings(&[reading(1, "Den", 67.5, at(8, 0))])
            .await
            .unwrap();
        assert_eq!(
            outcome,
            WriteOutcome {
                remote: true,
                local: true
            }
        );

        let degraded = StateStore::new(Backend::offline(REMOTE), local, TIMEOUT);
        let readings = degraded.zone_readings(1, at(7, 59)).await.unwrap();
        assert_eq!(readings, vec![reading(1, "Den", 67.5, at(8, 0))]);
    }

    #[tokio::test]
    async fn override_posted_during_remote_outage_is_seen_after_recovery() {
        let remote = memory(REMOTE).await;
        let local = memory(LOCAL).await;
        let targets = BTreeMap::from([("Den".to_string(), 72.0)]);
        StateStore::new(Backend::offline(REMOTE), local.clone(), TIMEOUT)
            .post_override(1, 1, &targets, at(12, 0), at(8, 0))
            .await
            .unwrap();

        let recovered = StateStore::new(remote, local, TIMEOUT);
        recovered
            .post_override(1, 1, &targets, at(12, 0), at(9, 0))
            .await
            .unwrap();

        let created: Vec<DateTime<Utc>> = recovered
            .pending_overrides(1)
            .await
            .unwrap()
            .iter()
            .map(|message| message.record_time)
            .collect();
        assert_eq!(created, vec![at(8, 0), at(9, 0)]);
    }

    #[tokio::test]
    async fn write_fails_when_neither_backend_accepts() {
        let store = StateStore::new(Backend::offline(REMOTE), Backend::offline(LOCAL), TIMEOUT);
        let entry = ActionLogEntry {
            action: 1,
            state: RelayState::HeatOn,
            target: 68.0,
            record_time: at(8, 0),
        };
        assert!(matches!(
            store.log_action(&entry).await,
            Err(StoreError::BothFailed { .. })
        ));
    }

    #[tokio::test]
    async fn overrides_are_consumed_on_both_backends() {
        let store = StateStore::new(memory(REMOTE).await, memory(LOCAL).await, TIMEOUT);
        let targets = BTreeMap::from([("Den".to_string(), 72.0)]);
        store
            .post_override(1, 1, &targets, at(12, 0), at(8, 0))
            .await
            .unwrap();
        store
            .post_override(1, 1, &targets, at(12, 0), at(9, 0))
            .await
            .unwrap();

        let pending = store.pending_overrides(1).await.unwrap();
        assert_eq!(pending.len(), 2);

        store.mark_overrides_consumed(1, at(8, 0)).await.unwrap();

        for backend in [store.remote(), store.local()] {
            let left = backend
                .pending_messages(1, OVERRIDE_MESSAGE_TYPE)
                .await
                .unwrap();
            assert_eq!(left.len(), 1);
            assert_eq!(left[0].record_time, at(9, 0));
        }
    }

    #[tokio::test]
    async fn schedule_lifecycle() {
        let store = StateStore::new(memory(REMOTE).await, memory(LOCAL).await, TIMEOUT);

        store.create_schedule(&weekly(10, "Winter")).await.unwrap();
        store.create_schedule(&weekly(11, "Away")).await.unwrap();
        let duplicate = store.create_schedule(&weekly(12, "Winter")).await.unwrap_err();
        assert!(matches!(
            duplicate,
            StoreError::Schedule(ScheduleError::Duplicate { .. })
        ));

        let missing = store.update_schedule(&weekly(99, "Ghost")).await.unwrap_err();
        assert!(matches!(
            missing,
            StoreError::Schedule(ScheduleError::NotFound { .. })
        ));

        store.activate_schedule(1, 1, 10).await.unwrap();
        store.activate_schedule(1, 1, 11).await.unwrap();

        let schedules = store.schedules(1).await.unwrap();
        let active: Vec<i64> = schedules.iter().filter(|s| s.active).map(|s| s.id).collect();
        assert_eq!(active, vec![11]);
        assert_eq!(schedules[0].entries.len(), 7);
    }

    #[tokio::test]
    async fn mirror_copies_configuration_and_prune_trims_history() {
        let remote = memory(REMOTE).await;
        remote
            .upsert_zone(&Zone {
                id: 1,
                name: "Main".to_string(),
                user: 1,
            })
            .await
            .unwrap();
        remote.upsert_sensor(&sensor(1, "Den")).await.unwrap();
        remote
            .upsert_action(&HeatAction {
                id: 7,
                name: "Furnace".to_string(),
                zone: 1,
                unit: 1,
                lag: LagEstimate {
                    overshoot_above: 1.0,
                    overshoot_below: -0.5,
                },
            })
            .await
            .unwrap();
        let store = StateStore::new(remote, memory(LOCAL).await, TIMEOUT);

        store.mirror_configuration(1, 1).await.unwrap();

        assert_eq!(store.local().unit_sensors(1).await.unwrap().len(), 1);
        assert_eq!(store.local().unit_actions(1).await.unwrap()[0].lag.overshoot_above, 1.0);

        store
            .record_readings(&[
                reading(1, "Den", 66.0, at(8, 0) - ChronoDuration::days(30)),
                reading(1, "Den", 67.0, at(8, 0)),
            ])
            .await
            .unwrap();
        let removed = store
            .prune_local(at(9, 0), ChronoDuration::days(14))
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert_eq!(
            store.remote().zone_readings(1, at(0, 0) - ChronoDuration::days(60)).await.unwrap().len(),
            2
        );
    }

    #[tokio::test]
    async fn action_status_is_latest_within_twelve_hours() {
        let store = StateStore::new(Backend::offline(REMOTE), memory(LOCAL).await, TIMEOUT);
        for (hour, state) in [(1, RelayState::HeatOn), (6, RelayState::HeatOff)] {
            store
                .log_action(&ActionLogEntry {
                    action: 3,
                    state,
                    target: 68.0,
                    record_time: at(hour, 0),
                })
                .await
                .unwrap();
        }

        let status = store.action_status(3, at(10, 0)).await.unwrap();
        assert_eq!(status.map(|entry| entry.state), Some(RelayState::HeatOff));
        assert_eq!(store.action_status(3, at(23, 0)).await.unwrap(), None);
    }
}
