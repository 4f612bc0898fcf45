use super::{Actuator, RelayError};
use rppal::gpio::{Gpio, OutputPin};
use tracing::{debug, info};

/// Relay wired to a single BCM output pin
pub struct GpioRelay {
    pin: OutputPin,
    active_high: bool,
}

impl GpioRelay {
    /// Claims `pin` as an output, already driven to the de-energized level.
    pub fn open(pin: u8, active_high: bool) -> Result<Self, RelayError> {
        info!(
            "Claiming GPIO pin {} for relay (active {})",
            pin,
            if active_high { "high" } else { "low" }
        );
        let gpio = Gpio::new()?;
        let pin = gpio.get(pin)?;
        let pin = if active_high {
            pin.into_output_low()
        } else {
            pin.into_output_high()
        };
        Ok(Self { pin, active_high })
    }
}

impl Actuator for GpioRelay {
    fn set_state(&mut self, on: bool) -> Result<(), RelayError> {
        debug!("GPIO {} -> {}", self.pin.pin(), if on { "on" } else { "off" });
        if on == self.active_high {
            self.pin.set_high();
        } else {
            self.pin.set_low();
        }
        Ok(())
    }

    fn current_state(&self) -> bool {
        self.pin.is_set_high() == self.active_high
    }
}
