use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Duration, FixedOffset, Offset, Utc};
use chrono_tz::Tz;
use tracing::{debug, error, info, warn};

use heating_common::{
    aggregate, lag, schedule, ActionId, HeatAction, HysteresisController, OverrideQueue,
    RelayState, RuntimeConfig, Sensor, SensorId, WeeklySchedule, ZoneId,
};

use crate::{
    action_log::ActionLogger,
    recorder::Recorder,
    relay::{self, RelayBank},
    sensors::SensorReader,
    store::StateStore,
};

const LAG_HISTORY_DAYS: i64 = 7;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ZoneOutcome {
    Transitioned(RelayState),
    Held(RelayState),
    NoTarget,
    Emergency,
    RelayFault,
    Halted,
}

struct ZoneControl {
    action: HeatAction,
    hysteresis: HysteresisController,
    overrides: OverrideQueue,
    schedule: Option<WeeklySchedule>,
    halted: bool,
    // Newest settled transition already folded into the lag estimate.
    lag_through: Option<DateTime<Utc>>,
}

pub struct ControlLoop {
    config: RuntimeConfig,
    store: StateStore,
    reader: SensorReader,
    logger: ActionLogger,
    relays: RelayBank,
    timezone: Tz,
    validate: bool,
    sensors: Vec<Sensor>,
    zones: BTreeMap<ZoneId, ZoneControl>,
    last_maintenance: Option<DateTime<Utc>>,
}

pub struct ControlParts {
    pub config: RuntimeConfig,
    pub store: StateStore,
    pub reader: SensorReader,
    pub logger: ActionLogger,
    pub relays: RelayBank,
    pub timezone: Tz,
    pub validate: bool,
}

pub fn local_time(tz: Tz, now: DateTime<Utc>) -> DateTime<FixedOffset> {
    let local = now.with_timezone(&tz);
    local.with_timezone(&local.offset().fix())
}

fn sensor_biases(sensors: &[Sensor]) -> HashMap<SensorId, f32> {
    sensors.iter().map(|sensor| (sensor.id, sensor.bias)).collect()
}

impl ControlLoop {
    pub fn start(parts: ControlParts) -> Self {
        let ControlParts {
            config,
            store,
            reader,
            logger,
            mut relays,
            timezone,
            validate,
        } = parts;

        let mut zones = BTreeMap::new();
        for zone in relays.zones() {
            let Some(output) = relays.get_mut(zone) else {
                continue;
            };
            let (state, halted) = match relay::self_test(zone, output) {
                Ok(state) => (state, false),
                Err(err) => {
                    warn!(zone, "{err}");
                    if config.hardware.halt_on_relay_fault {
                        error!(zone, "automatic control suppressed until restart");
                    }
                    (RelayState::HeatOff, config.hardware.halt_on_relay_fault)
                }
            };

            let fallback_action = config
                .relay_for_zone(zone)
                .map(|relay| relay.fallback_action)
                .unwrap_or(zone);

            zones.insert(
                zone,
                ZoneControl {
                    action: HeatAction {
                        id: fallback_action,
                        name: "heat".to_string(),
                        zone,
                        unit: config.unit,
                        lag: Default::default(),
                    },
                    hysteresis: HysteresisController::from_relay(
                        zone,
                        state,
                        config.control.buffer_f,
                        config.control.lag_order,
                    ),
                    overrides: OverrideQueue::new(zone),
                    schedule: None,
                    halted,
                    lag_through: None,
                },
            );
        }

        Self {
            sensors: Self::fallback_sensors(&config),
            config,
            store,
            reader,
            logger,
            relays,
            timezone,
            validate,
            zones,
            last_maintenance: None,
        }
    }

    fn fallback_sensors(config: &RuntimeConfig) -> Vec<Sensor> {
        config
            .hardware
            .fallback_sensors
            .iter()
            .enumerate()
            .map(|(index, fallback)| Sensor {
                id: -(index as i64 + 1),
                address: fallback.address.clone(),
                location: fallback.location.clone(),
                zone: fallback.zone,
                unit: config.unit,
                user: config.user,
                indoors: true,
                bias: 0.0,
            })
            .collect()
    }

    pub fn zone_state(&self, zone: ZoneId) -> Option<RelayState> {
        self.zones.get(&zone).map(|control| control.hysteresis.state())
    }

    pub async fn tick(&mut self, now: DateTime<Utc>) -> BTreeMap<ZoneId, ZoneOutcome> {
        let maintenance_due = self.last_maintenance.map_or(true, |last| {
            now - last >= Duration::seconds(self.config.control.maintenance_interval_secs as i64)
        });
        if maintenance_due {
            self.maintain(now).await;
        }

        if self.config.control.record_readings {
            let recorder = Recorder {
                store: &self.store,
                reader: &self.reader,
                config: &self.config.aggregation,
                validate: self.validate,
            };
            if let Err(err) = recorder.record(&self.sensors, now).await {
                warn!("temperature recording failed: {err}");
            }
        }

        let zones: Vec<ZoneId> = self.zones.keys().copied().collect();
        let mut outcomes = BTreeMap::new();
        for zone in zones {
            let outcome = self.control_zone(zone, now).await;
            debug!(zone, "tick outcome: {outcome:?}");
            outcomes.insert(zone, outcome);
        }
        outcomes
    }

    async fn control_zone(&mut self, zone: ZoneId, now: DateTime<Utc>) -> ZoneOutcome {
        let local_now = local_time(self.timezone, now);
        let Self {
            config,
            store,
            reader,
            logger,
            relays,
            sensors,
            zones,
            ..
        } = self;
        let Some(control) = zones.get_mut(&zone) else {
            return ZoneOutcome::NoTarget;
        };

        if control.halted {
            if control.hysteresis.state().is_on() {
                if let Some(relay) = relays.get_mut(zone) {
                    if let Err(err) = relay.set(false) {
                        error!(zone, "halted zone relay could not be switched off: {err}");
                    }
                }
                control.hysteresis.force(RelayState::HeatOff);
            }
            return ZoneOutcome::Halted;
        }

        // Targets: an active override beats the schedule.
        let pending = match store.pending_overrides(zone).await {
            Ok(pending) => pending,
            Err(err) => {
                warn!(zone, "override messages unavailable: {err}");
                Vec::new()
            }
        };
        let polled = control.overrides.poll(&pending, now, *local_now.offset());
        for rejected in &polled.rejected {
            warn!(zone, "{rejected}");
        }
        if let Some(through) = polled.consumed_through {
            if let Err(err) = store.mark_overrides_consumed(zone, through).await {
                warn!(zone, "could not mark override messages consumed: {err}");
            }
        }
        if polled.applied {
            if let Some(active) = control.overrides.active() {
                info!(zone, "override applied until {}", active.expiration);
            }
        }
        if polled.expired {
            info!(zone, "override expired, schedule resumes");
        }

        let targets = match polled.targets {
            Some(targets) => Some(targets),
            None => match &control.schedule {
                Some(schedule) => match schedule.current_targets(local_now) {
                    Ok(targets) => Some(targets),
                    Err(err) => {
                        warn!(zone, "schedule `{}` unusable: {err}", schedule.name);
                        None
                    }
                },
                None => None,
            },
        };
        let Some(target) = targets.and_then(|targets| aggregate::median(targets.into_values())) else {
            warn!(zone, "no target temperature, holding relay {}", control.hysteresis.state().as_str());
            return ZoneOutcome::NoTarget;
        };

        // Measurement: recent store average, else the probes directly.
        let biases = sensor_biases(sensors);
        let since = now - Duration::minutes(config.control.recent_window_minutes);
        let from_store = match store.zone_readings(zone, since).await {
            Ok(readings) => aggregate::zone_value(&aggregate::room_averages(&readings, &biases, &config.aggregation)),
            Err(err) => {
                warn!(zone, "recent average unavailable, reading sensors directly: {err}");
                None
            }
        };
        let measured = match from_store {
            Some(value) => value,
            None => match reader.zone_rooms(zone, sensors, &config.aggregation, now).await {
                Ok(rooms) => match aggregate::zone_value(&rooms) {
                    Some(value) => value,
                    None => {
                        error!(zone, "EMERGENCY: no usable temperature for zone {zone}");
                        return ZoneOutcome::Emergency;
                    }
                },
                Err(emergency) => {
                    error!(zone, "{emergency}; holding relay {}", control.hysteresis.state().as_str());
                    return ZoneOutcome::Emergency;
                }
            },
        };

        let lag = control.action.lag;
        let Some(next) = control.hysteresis.decide(target, measured, lag) else {
            debug!(zone, "measured {measured:.2}°F target {target:.2}°F, no change");
            return ZoneOutcome::Held(control.hysteresis.state());
        };

        let Some(relay) = relays.get_mut(zone) else {
            control.hysteresis.force(RelayState::HeatOff);
            return ZoneOutcome::RelayFault;
        };
        if let Err(err) = relay.set(next.is_on()) {
            warn!(zone, "relay fault while switching {}: {err}", next.as_str());
            if let Err(off_err) = relay.set(false) {
                error!(zone, "relay could not be forced off: {off_err}");
            }
            control.hysteresis.force(RelayState::HeatOff);
            if config.hardware.halt_on_relay_fault {
                error!(zone, "automatic control suppressed until restart");
                control.halted = true;
            }
            return ZoneOutcome::RelayFault;
        }

        info!(zone, "measured {measured:.2}°F target {target:.2}°F -> {}", next.as_str());
        logger.log(control.action.id, next, target, now).await;
        ZoneOutcome::Transitioned(next)
    }

    pub async fn maintain(&mut self, now: DateTime<Utc>) {
        self.last_maintenance = Some(now);

        if self.store.remote().is_online() {
            if let Err(err) = self
                .store
                .mirror_configuration(self.config.user, self.config.unit)
                .await
            {
                warn!("configuration mirror failed: {err}");
            }
        }

        self.refresh_sensors().await;
        self.refresh_actions().await;
        self.refresh_schedules().await;

        let zones: Vec<ZoneId> = self.zones.keys().copied().collect();
        for zone in zones {
            self.refresh_lag(zone, now).await;
        }

        let retention = Duration::days(self.config.control.local_retention_days);
        match self.store.prune_local(now, retention).await {
            Ok(0) => {}
            Ok(removed) => debug!("pruned {removed} local rows"),
            Err(err) => warn!("local prune failed: {err}"),
        }
    }

    async fn refresh_sensors(&mut self) {
        match self.store.unit_sensors(self.config.unit).await {
            Ok(sensors) if !sensors.is_empty() => self.sensors = sensors,
            Ok(_) => {
                if self.sensors.is_empty() {
                    self.sensors = Self::fallback_sensors(&self.config);
                }
            }
            Err(err) => {
                warn!("sensor list unavailable, keeping {} known sensors: {err}", self.sensors.len());
                if self.sensors.is_empty() {
                    self.sensors = Self::fallback_sensors(&self.config);
                }
            }
        }
    }

    async fn refresh_actions(&mut self) {
        let actions = match self.store.unit_actions(self.config.unit).await {
            Ok(actions) => actions,
            Err(err) => {
                warn!("action list unavailable, keeping current actions: {err}");
                return;
            }
        };
        for (zone, control) in &mut self.zones {
            if let Some(action) = actions.iter().find(|action| action.zone == *zone) {
                if action.id != control.action.id {
                    control.lag_through = None;
                }
                control.action = action.clone();
            }
        }
    }

    async fn refresh_schedules(&mut self) {
        let schedules = match self.store.schedules(self.config.user).await {
            Ok(schedules) => schedules,
            Err(err) => {
                warn!("schedules unavailable, keeping current ones: {err}");
                return;
            }
        };

        for (zone, control) in &mut self.zones {
            match schedule::resolve_active(self.config.user, *zone, &schedules) {
                Ok(resolution) => {
                    if let Some(ambiguity) = &resolution.ambiguity {
                        warn!(zone = *zone, "{ambiguity}; using schedule {}", resolution.schedule.id);
                    }
                    let mut chosen = resolution.schedule.clone();
                    match chosen.normalize() {
                        Ok(()) => control.schedule = Some(chosen),
                        Err(err) => {
                            warn!(zone = *zone, "schedule `{}` rejected: {err}", chosen.name);
                            control.schedule = None;
                        }
                    }
                }
                Err(err) => {
                    warn!(zone = *zone, "{err}");
                    control.schedule = None;
                }
            }
        }
    }

    async fn refresh_lag(&mut self, zone: ZoneId, now: DateTime<Utc>) {
        let Some(control) = self.zones.get(&zone) else {
            return;
        };
        let action: ActionId = control.action.id;
        let current = control.action.lag;
        let processed = control.lag_through;

        let since = now - Duration::days(LAG_HISTORY_DAYS);
        let mut history = match self.store.action_log_since(action, since).await {
            Ok(history) => history,
            Err(err) => {
                debug!(zone, "no action history for lag: {err}");
                return;
            }
        };
        history.retain(|entry| lag::is_settled(entry, now, &self.config.lag));
        history.truncate(self.config.lag.transitions);
        let Some(newest) = history.first().map(|entry| entry.record_time) else {
            return;
        };
        if processed.is_some_and(|through| newest <= through) {
            return;
        }
        let Some(oldest) = history.last().map(|entry| entry.record_time) else {
            return;
        };

        let readings = match self.store.zone_readings(zone, oldest).await {
            Ok(readings) => readings,
            Err(err) => {
                debug!(zone, "no temperature history for lag: {err}");
                return;
            }
        };
        let series = aggregate::zone_series(&readings, &sensor_biases(&self.sensors), &self.config.aggregation);

        let updated = lag::recompute(current, &history, &series, &self.config.lag);
        if let Some(control) = self.zones.get_mut(&zone) {
            control.lag_through = Some(newest);
        }
        if updated == current {
            return;
        }
        info!(
            zone,
            "lag estimate now above {:.2}°F below {:.2}°F",
            updated.overshoot_above,
            updated.overshoot_below
        );
        if let Some(control) = self.zones.get_mut(&zone) {
            control.action.lag = updated;
        }
        if let Err(err) = self.store.update_lag(action, updated).await {
            warn!(zone, "lag estimate not persisted: {err}");
        }
    }

    pub fn shutdown(&mut self) {
        self.relays.all_off();
        for control in self.zones.values_mut() {
            control.hysteresis.force(RelayState::HeatOff);
        }
    }
}
