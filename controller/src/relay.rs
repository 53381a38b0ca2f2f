use std::collections::BTreeMap;

use thiserror::Error;
use tracing::{error, info, warn};

use heating_common::{RelayState, ZoneId};

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("gpio pin {pin}: {detail}")]
    Gpio { pin: u8, detail: String },
    #[error("relay fault on zone {zone}: {detail}")]
    Fault { zone: ZoneId, detail: String },
}

// A single heat relay. `is_on` reads the physical output back, not a cached command.
pub trait Relay: Send {
    fn set(&mut self, on: bool) -> Result<(), RelayError>;
    fn is_on(&self) -> Result<bool, RelayError>;
    fn describe(&self) -> String;
}

#[derive(Debug, Default)]
pub struct SimulatedRelay {
    on: bool,
    stuck: Option<bool>,
    fail_writes: bool,
}

impl SimulatedRelay {
    pub fn new(on: bool) -> Self {
        Self {
            on,
            ..Self::default()
        }
    }

    #[cfg(test)]
    pub fn stuck(level: bool) -> Self {
        Self {
            on: level,
            stuck: Some(level),
            fail_writes: false,
        }
    }

    #[cfg(test)]
    pub fn failing() -> Self {
        Self {
            fail_writes: true,
            ..Self::default()
        }
    }
}

impl Relay for SimulatedRelay {
    fn set(&mut self, on: bool) -> Result<(), RelayError> {
        if self.fail_writes {
            return Err(RelayError::Gpio {
                pin: 0,
                detail: "simulated write failure".to_string(),
            });
        }
        self.on = self.stuck.unwrap_or(on);
        Ok(())
    }

    fn is_on(&self) -> Result<bool, RelayError> {
        Ok(self.on)
    }

    fn describe(&self) -> String {
        "simulated relay".to_string()
    }
}

#[cfg(all(feature = "rpi", target_os = "linux"))]
pub use gpio::GpioRelay;

#[cfg(all(feature = "rpi", target_os = "linux"))]
mod gpio {
    use rppal::gpio::{Gpio, OutputPin};

    use super::{Relay, RelayError};

    pub struct GpioRelay {
        pin: u8,
        output: OutputPin,
    }

    impl GpioRelay {
        pub fn open(pin: u8) -> Result<Self, RelayError> {
            let gpio_err = |err: rppal::gpio::Error| RelayError::Gpio {
                pin,
                detail: err.to_string(),
            };
            let raw = Gpio::new().map_err(gpio_err)?.get(pin).map_err(gpio_err)?;
            let was_high = raw.read() == rppal::gpio::Level::High;
            let mut output = if was_high {
                raw.into_output_high()
            } else {
                raw.into_output_low()
            };
            output.set_reset_on_drop(false);
            Ok(Self { pin, output })
        }
    }

    impl Relay for GpioRelay {
        fn set(&mut self, on: bool) -> Result<(), RelayError> {
            if on {
                self.output.set_high();
            } else {
                self.output.set_low();
            }
            Ok(())
        }

        fn is_on(&self) -> Result<bool, RelayError> {
            Ok(self.output.is_set_high())
        }

        fn describe(&self) -> String {
            format!("gpio pin {}", self.pin)
        }
    }
}

pub fn self_test(zone: ZoneId, relay: &mut dyn Relay) -> Result<RelayState, RelayError> {
    match cycle(zone, relay) {
        Ok(initial) => {
            info!(zone, "relay self-test passed on {}, initial state {}", relay.describe(), initial.as_str());
            Ok(initial)
        }
        Err(err) => {
            if let Err(off_err) = relay.set(false) {
                error!(zone, "could not force relay off after failed self-test: {off_err}");
            }
            Err(err)
        }
    }
}

fn cycle(zone: ZoneId, relay: &mut dyn Relay) -> Result<RelayState, RelayError> {
    let fault = |detail: &str| RelayError::Fault {
        zone,
        detail: detail.to_string(),
    };

    let initial = relay.is_on()?;

    relay.set(true)?;
    if !relay.is_on()? {
        return Err(fault("did not read back on after switching on"));
    }
    relay.set(false)?;
    if relay.is_on()? {
        return Err(fault("did not read back off after switching off"));
    }

    relay.set(initial)?;
    Ok(RelayState::from_level(initial))
}

pub struct RelayBank {
    relays: BTreeMap<ZoneId, Box<dyn Relay>>,
}

impl RelayBank {
    pub fn new() -> Self {
        Self {
            relays: BTreeMap::new(),
        }
    }

    pub fn insert(&mut self, zone: ZoneId, relay: Box<dyn Relay>) {
        self.relays.insert(zone, relay);
    }

    pub fn get_mut(&mut self, zone: ZoneId) -> Option<&mut (dyn Relay + 'static)> {
        self.relays.get_mut(&zone).map(|relay| relay.as_mut())
    }

    pub fn zones(&self) -> Vec<ZoneId> {
        self.relays.keys().copied().collect()
    }

    pub fn all_off(&mut self) {
        for (zone, relay) in &mut self.relays {
            match relay.set(false) {
                Ok(()) => info!(zone = *zone, "relay off"),
                Err(err) => warn!(zone = *zone, "failed to switch relay off: {err}"),
            }
        }
    }
}

impl Default for RelayBank {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for RelayBank {
    fn drop(&mut self) {
        self.all_off();
    }
}
