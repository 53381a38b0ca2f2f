use std::path::PathBuf;

use clap::{ArgAction, Parser, Subcommand};

use heating_common::{ActionId, ZoneId};

#[derive(Parser, Debug, Clone)]
#[command(name = "heating-controller", version, about = "Adaptive heating relay controller")]
pub struct Cli {
    /// 0 = warnings only, 1 = info, 2 = debug, 3+ = trace. `RUST_LOG` overrides this.
    #[arg(short, long, value_name = "LEVEL", default_value_t = 0)]
    pub verbosity: u8,

    /// Do not write relay transitions to the action log.
    #[arg(long, action = ArgAction::SetTrue)]
    pub disable_log: bool,

    /// Simulate relays instead of driving GPIO.
    #[arg(long, action = ArgAction::SetTrue)]
    pub dry_run: bool,

    /// Seconds between control ticks.
    #[arg(long, value_name = "SECS")]
    pub sleep: Option<u64>,

    /// Seconds to wait before starting, e.g. for the network to come up.
    #[arg(long, value_name = "SECS", default_value_t = 0)]
    pub boot_sleep: u64,

    /// Reject statistically implausible readings before recording them.
    #[arg(long, action = ArgAction::SetTrue)]
    pub validate: bool,

    /// Runtime configuration file (JSON).
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// One-shot administration; without a command the control daemon runs.
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Queue the same temperature override for every room of a zone.
    Override {
        #[arg(long)]
        zone: ZoneId,
        #[arg(long, value_name = "FAHRENHEIT")]
        target: f32,
        #[arg(long, value_name = "MINUTES", default_value_t = 60)]
        minutes: i64,
    },
    /// Show the latest logged relay state of an action.
    Status {
        #[arg(long)]
        action: ActionId,
    },
    /// Store a weekly schedule read from a JSON file.
    Schedule {
        #[arg(value_name = "FILE")]
        file: PathBuf,
        /// Replace the schedule with the same id instead of creating a new one.
        #[arg(long, action = ArgAction::SetTrue)]
        replace: bool,
        /// Make it the only active schedule of its zone.
        #[arg(long, action = ArgAction::SetTrue)]
        activate: bool,
    },
    /// Print each room's next scheduled change.
    Next {
        #[arg(long)]
        zone: ZoneId,
    },
}

impl Cli {
    pub fn log_filter(&self) -> &'static str {
        match self.verbosity {
            0 => "warn",
            1 => "info",
            2 => "debug",
            _ => "trace",
        }
    }
}
