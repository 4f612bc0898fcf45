//! # MQTT Transport
//!
//! The single broker connection the agent lives on. The session talks to it
//! through the [`Transport`] trait and receives connection lifecycle and
//! inbound messages as [`TransportEvent`]s on a channel, so every handler runs
//! on the session's own task, one event at a time.
//!
//! ```text
//! mqtt/
//! ├── mod.rs           - topics, Transport trait, events and errors
//! ├── pending.rs       - PendingPublish handle for acknowledged publishes
//! ├── ack_tracker.rs   - maps publish requests to packet ids and acks
//! └── mqtt_handler.rs  - rumqttc client and its background event loop
//! ```
//!
//! ## Sending and receiving are separate
//!
//! The event loop keeps polling the connection after the session has stopped
//! listening for events. That is what lets the shutdown path flush its final
//! publishes: the receive side is closed, the send side stays up until the
//! explicit disconnect.

pub mod ack_tracker;
pub mod mqtt_handler;
pub mod pending;

use async_trait::async_trait;
use rumqttc::QoS;
use std::time::Duration;
use thiserror::Error;

pub use pending::{PendingPublish, PublishError};

/// Inbound ON/OFF commands
pub const TOPIC_POWER: &str = "rpi/fireplace/power";
/// Retained relay state
pub const TOPIC_STATE: &str = "rpi/fireplace/state";
/// Retained presence (ONLINE/OFFLINE)
pub const TOPIC_STATUS: &str = "rpi/fireplace/status";

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("MQTT client error: {0}")]
    Client(#[from] rumqttc::ClientError),

    #[error("Event loop did not stop within {0:?}")]
    ShutdownTimeout(Duration),

    #[error("Event loop task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// What the connection reports back to the session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A (re)connection completed with an accepted CONNACK.
    Connected,
    /// An established connection dropped; the transport is reconnecting.
    Disconnected(String),
    /// The very first connection attempt failed; the transport gave up.
    ConnectFailed(String),
    /// Inbound PUBLISH on a subscribed topic.
    Message { topic: String, payload: Vec<u8> },
}

/// Outbound side of the broker connection
#[async_trait]
pub trait Transport: Send + Sync {
    /// Queues a publish and returns a handle resolving on the broker's final
    /// acknowledgement for `qos`.
    async fn publish(
        &self,
        topic: &str,
        payload: &str,
        qos: QoS,
        retain: bool,
    ) -> Result<PendingPublish, TransportError>;

    async fn subscribe(&self, topic: &str, qos: QoS) -> Result<(), TransportError>;

    async fn unsubscribe(&self, topic: &str) -> Result<(), TransportError>;

    /// Sends DISCONNECT and waits up to `timeout` for the event loop to stop.
    async fn disconnect(&self, timeout: Duration) -> Result<(), TransportError>;
}
