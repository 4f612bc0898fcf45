//! State Synchronizer
//!
//! The only writer of the relay state. Every physical transition is followed
//! by a retained QoS 2 publish of the same state on `rpi/fireplace/state`, so
//! the relay and the last state seen on the network never drift apart for
//! longer than one round trip.

use crate::mqtt::{PendingPublish, Transport, TransportError, TOPIC_STATE};
use crate::relay::{Actuator, RelayError};
use rumqttc::QoS;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, error, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ActuatorState {
    On,
    #[default]
    Off,
}

impl ActuatorState {
    pub fn payload(self) -> &'static str {
        match self {
            ActuatorState::On => "ON",
            ActuatorState::Off => "OFF",
        }
    }

    pub fn is_on(self) -> bool {
        self == ActuatorState::On
    }
}

impl fmt::Display for ActuatorState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.payload())
    }
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Relay error: {0}")]
    Relay(#[from] RelayError),

    #[error("Failed to publish state: {0}")]
    Transport(#[from] TransportError),
}

struct Relay {
    driver: Box<dyn Actuator>,
    state: ActuatorState,
}

pub struct StateSynchronizer {
    // Held across the publish so relay writes and state publishes keep the same order
    relay: Mutex<Relay>,
    transport: Arc<dyn Transport>,
}

impl StateSynchronizer {
    pub fn new(driver: Box<dyn Actuator>, transport: Arc<dyn Transport>) -> Self {
        Self {
            relay: Mutex::new(Relay {
                driver,
                state: ActuatorState::Off,
            }),
            transport,
        }
    }

    pub async fn state(&self) -> ActuatorState {
        self.relay.lock().await.state
    }

    /// Drives the relay off without publishing.
    ///
    /// Used at startup, before any connection exists; the next connect
    /// publishes the resulting state.
    pub fn force_off(&mut self) -> Result<(), RelayError> {
        let relay = self.relay.get_mut();
        relay.driver.set_state(false)?;
        relay.state = ActuatorState::Off;
        info!("Relay forced OFF");
        Ok(())
    }

    pub async fn turn_on(&self) -> Result<PendingPublish, SyncError> {
        self.apply(ActuatorState::On).await
    }

    pub async fn turn_off(&self) -> Result<PendingPublish, SyncError> {
        self.apply(ActuatorState::Off).await
    }

    /// Republishes the current state without touching the relay.
    pub async fn publish_current(&self) -> Result<PendingPublish, SyncError> {
        let relay = self.relay.lock().await;
        debug!("Republishing state {}", relay.state);
        self.publish(relay.state).await
    }

    // Redundant transitions are not suppressed: the relay is idempotent and the
    // republish heals a missed retained message.
    async fn apply(&self, target: ActuatorState) -> Result<PendingPublish, SyncError> {
        let mut relay = self.relay.lock().await;
        info!("Turning fireplace {}", target);
        if let Err(e) = relay.driver.set_state(target.is_on()) {
            error!("Relay did not switch {}: {}", target, e);
            return Err(e.into());
        }
        relay.state = target;

        info!("Publishing '{}' state", target);
        self.publish(target).await
    }

    async fn publish(&self, state: ActuatorState) -> Result<PendingPublish, SyncError> {
        let pending = self
            .transport
            .publish(TOPIC_STATE, state.payload(), QoS::ExactlyOnce, true)
            .await?;
        Ok(pending)
    }
}
