use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use anyhow::Context;
use chrono::Utc;
use chrono_tz::Tz;
use clap::Parser;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use heating_common::{schedule, RuntimeConfig, WeeklySchedule};

use crate::{
    action_log::ActionLogger,
    cli::{Cli, Command},
    control::{local_time, ControlLoop, ControlParts},
    relay::{Relay, RelayBank, SimulatedRelay},
    sensors::{SensorReader, W1Bus},
    store::StateStore,
};

pub async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(cli.log_filter()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config_path = config_path(&cli, |key| std::env::var(key).ok());
    let mut runtime = load_runtime_config(&config_path).await.unwrap_or_else(|err| {
        warn!("failed to load runtime config from {}: {err:#}", config_path.display());
        RuntimeConfig::default()
    });
    apply_env_overrides(&mut runtime, |key| std::env::var(key).ok());
    if let Some(secs) = cli.sleep {
        runtime.control.tick_interval_secs = secs;
    }
    runtime.sanitize();

    let timezone: Tz = match runtime.timezone.parse() {
        Ok(tz) => tz,
        Err(err) => {
            warn!("unknown timezone `{}` ({err}), using UTC", runtime.timezone);
            chrono_tz::UTC
        }
    };

    if let Some(command) = cli.command.clone() {
        let store = StateStore::open(
            &runtime.store,
            Duration::from_millis(runtime.control.store_timeout_ms),
        )
        .await;
        return run_command(command, &runtime, timezone, &store).await;
    }

    if cli.boot_sleep > 0 {
        info!("waiting {}s before start", cli.boot_sleep);
        tokio::time::sleep(Duration::from_secs(cli.boot_sleep)).await;
    }

    let store = StateStore::open(
        &runtime.store,
        Duration::from_millis(runtime.control.store_timeout_ms),
    )
    .await;
    let reader = SensorReader::new(
        Arc::new(W1Bus::new(&runtime.hardware.w1_root)),
        Duration::from_millis(runtime.control.sensor_timeout_ms),
    );
    let logger = ActionLogger::new(store.clone(), !cli.disable_log);
    let relays = build_relays(&runtime, cli.dry_run)?;

    let tick = Duration::from_secs(runtime.control.tick_interval_secs);
    info!(
        "controller starting: unit {} user {} tick {:?} dry-run {} action log {}",
        runtime.unit,
        runtime.user,
        tick,
        cli.dry_run,
        if logger.is_enabled() { "on" } else { "off" }
    );

    let mut control = ControlLoop::start(ControlParts {
        config: runtime,
        store,
        reader,
        logger,
        relays,
        timezone,
        validate: cli.validate,
    });

    let result = run_control_loop(&mut control, tick).await;
    control.shutdown();
    info!("controller stopped");
    result
}

async fn run_control_loop(control: &mut ControlLoop, tick: Duration) -> anyhow::Result<()> {
    let mut interval = tokio::time::interval(tick);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            reason = &mut shutdown => {
                info!("{}, switching relays off", reason?);
                return Ok(());
            }
            _ = interval.tick() => {
                control.tick(Utc::now()).await;
            }
        }
    }
}

async fn shutdown_signal() -> anyhow::Result<&'static str> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut terminate =
            signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result.context("failed to wait for ctrl-c")?;
                Ok("interrupted")
            }
            _ = terminate.recv() => Ok("terminated"),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .context("failed to wait for ctrl-c")?;
        Ok("interrupted")
    }
}

async fn run_command(
    command: Command,
    runtime: &RuntimeConfig,
    timezone: Tz,
    store: &StateStore,
) -> anyhow::Result<()> {
    let now = Utc::now();
    match command {
        Command::Override {
            zone,
            target,
            minutes,
        } => {
            let expiration = now + chrono::Duration::minutes(minutes.max(1));
            let outcome = store
                .post_zone_override(runtime.user, zone, target, expiration, now)
                .await
                .context("failed to queue override")?;
            println!(
                "zone {zone}: {target:.1}°F until {} (remote {}, local {})",
                local_time(timezone, expiration),
                outcome.remote,
                outcome.local
            );
        }
        Command::Status { action } => {
            match store
                .action_status(action, now)
                .await
                .context("failed to read action log")?
            {
                Some(entry) => println!(
                    "action {action}: {} since {} (target {:.1}°F)",
                    entry.state.as_str(),
                    local_time(timezone, entry.record_time),
                    entry.target
                ),
                None => println!("action {action}: no state logged in the last 12 hours"),
            }
        }
        Command::Schedule {
            file,
            replace,
            activate,
        } => {
            let raw = tokio::fs::read(&file)
                .await
                .with_context(|| format!("failed to read {}", file.display()))?;
            let schedule: WeeklySchedule = serde_json::from_slice(&raw)
                .with_context(|| format!("invalid schedule {}", file.display()))?;
            if replace {
                store.update_schedule(&schedule).await?;
            } else {
                store.create_schedule(&schedule).await?;
            }
            if activate {
                store
                    .activate_schedule(schedule.user, schedule.zone, schedule.id)
                    .await?;
            }
            println!(
                "schedule {} `{}` stored for zone {}{}",
                schedule.id,
                schedule.name,
                schedule.zone,
                if activate { " and activated" } else { "" }
            );
        }
        Command::Next { zone } => {
            let schedules = store.schedules(runtime.user).await?;
            let resolution = schedule::resolve_active(runtime.user, zone, &schedules)?;
            if let Some(ambiguity) = &resolution.ambiguity {
                warn!("{ambiguity}; showing schedule {}", resolution.schedule.id);
            }
            let mut active = resolution.schedule.clone();
            active.normalize()?;
            for (room, next) in active.next_targets(local_time(timezone, now))? {
                println!("{room}: {:.1}°F at {}", next.target_temp_f, next.at);
            }
        }
    }
    Ok(())
}

fn config_path(cli: &Cli, env: impl Fn(&str) -> Option<String>) -> PathBuf {
    cli.config.clone().unwrap_or_else(|| {
        env("HEATING_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("./.heating"))
            .join("runtime.json")
    })
}

async fn load_runtime_config(path: &Path) -> anyhow::Result<RuntimeConfig> {
    match tokio::fs::read(path).await {
        Ok(raw) => serde_json::from_slice::<RuntimeConfig>(&raw)
            .with_context(|| format!("invalid runtime config {}", path.display())),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(RuntimeConfig::default()),
        Err(err) => Err(err.into()),
    }
}

fn apply_env_overrides(runtime: &mut RuntimeConfig, env: impl Fn(&str) -> Option<String>) {
    if let Some(url) = env("HEATING_REMOTE_URL").filter(|url| !url.is_empty()) {
        runtime.store.remote_url = Some(url);
    }
    if let Some(token) = env("HEATING_REMOTE_TOKEN") {
        runtime.store.remote_token = Some(token);
    }
    if let Some(path) = env("HEATING_LOCAL_DB").filter(|path| !path.is_empty()) {
        runtime.store.local_path = path;
    }
}

fn build_relays(runtime: &RuntimeConfig, dry_run: bool) -> anyhow::Result<RelayBank> {
    let mut bank = RelayBank::new();
    for wiring in &runtime.hardware.relays {
        let relay: Box<dyn Relay> = if dry_run {
            Box::new(SimulatedRelay::new(false))
        } else {
            hardware_relay(wiring.heat_pin)?
        };
        info!("zone {} relay: {}", wiring.zone, relay.describe());
        bank.insert(wiring.zone, relay);
    }
    Ok(bank)
}

#[cfg(all(feature = "rpi", target_os = "linux"))]
fn hardware_relay(pin: u8) -> anyhow::Result<Box<dyn Relay>> {
    let relay = crate::relay::GpioRelay::open(pin)
        .with_context(|| format!("failed to claim relay pin {pin}"))?;
    Ok(Box::new(relay))
}

#[cfg(not(all(feature = "rpi", target_os = "linux")))]
fn hardware_relay(pin: u8) -> anyhow::Result<Box<dyn Relay>> {
    anyhow::bail!("relay pin {pin} needs a build with the `rpi` feature; use --dry-run to simulate")
}
