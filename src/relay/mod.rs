//! # Relay Driver
//!
//! The actuator behind the agent is a single relay channel. The rest of the
//! crate only sees the [`Actuator`] trait; which driver backs it is decided
//! once at startup from [`RelaySettings`].
//!
//! ```text
//! relay/
//! ├── mod.rs   - Actuator trait, errors, simulated relay
//! └── gpio.rs  - Raspberry Pi output pin via rppal
//! ```
//!
//! Drivers are expected to be synchronous, fast and idempotent: driving the
//! relay into the state it is already in is harmless.

pub mod gpio;

use crate::config::{RelayDriver, RelaySettings};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("GPIO error: {0}")]
    Gpio(#[from] rppal::gpio::Error),

    #[error("Relay fault: {0}")]
    Fault(String),
}

/// Physical on/off switch
pub trait Actuator: Send {
    /// Drives the relay; `true` energizes it.
    fn set_state(&mut self, on: bool) -> Result<(), RelayError>;

    /// Reads back what the relay is currently driven to.
    fn current_state(&self) -> bool;
}

/// Builds the driver selected in the configuration.
pub fn open(settings: &RelaySettings) -> Result<Box<dyn Actuator>, RelayError> {
    match settings.driver {
        RelayDriver::Gpio => {
            let relay = gpio::GpioRelay::open(settings.pin, settings.active_high)?;
            Ok(Box::new(relay))
        }
        RelayDriver::Simulated => {
            info!("Using simulated relay instead of GPIO pin {}", settings.pin);
            Ok(Box::new(SimulatedRelay::new()))
        }
    }
}

/// In-memory relay for running off-device and for tests.
///
/// Clones share the same state, so a test can keep one as a probe while the
/// synchronizer owns the other.
#[derive(Debug, Clone, Default)]
pub struct SimulatedRelay {
    on: Arc<AtomicBool>,
    writes: Arc<AtomicUsize>,
    fail: Arc<AtomicBool>,
}

impl SimulatedRelay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts out energized, e.g. to check that startup forces the relay off.
    pub fn energized() -> Self {
        let relay = Self::default();
        relay.on.store(true, Ordering::SeqCst);
        relay
    }

    /// Number of `set_state` calls that reached the relay
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Makes every following `set_state` fail until reset.
    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }
}

impl Actuator for SimulatedRelay {
    fn set_state(&mut self, on: bool) -> Result<(), RelayError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(RelayError::Fault("simulated relay failure".to_string()));
        }
        debug!("Simulated relay -> {}", if on { "on" } else { "off" });
        self.on.store(on, Ordering::SeqCst);
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn current_state(&self) -> bool {
        self.on.load(Ordering::SeqCst)
    }
}
