//! Session Controller with statum state machine
//!
//! Owns the connect / subscribe / announce / shutdown protocol around the
//! broker connection. Handlers run one at a time on the session's task, fed
//! by the transport's event channel.
//!
//! # State Machine
//!
//! ```text
//! Initializing ──► Running ──► Draining ──► Closed
//!   (relay forced    (commands     (flush OFF state
//!    OFF, wait for    dispatched)   and OFFLINE, then
//!    first connect)                 disconnect)
//! ```
//!
//! # Shutdown
//!
//! Draining closes the inbound side first, so no command is accepted after
//! shutdown began, while the transport keeps sending. The OFF state publish
//! must be acknowledged (or time out) before OFFLINE is published, and both
//! are bounded by `flush_timeout`: a broker that never answers delays exit,
//! it never blocks it.

use crate::config::SessionSettings;
use crate::dispatcher::CommandDispatcher;
use crate::mqtt::{Transport, TransportEvent, TOPIC_POWER, TOPIC_STATUS};
use crate::relay::{Actuator, RelayError};
use crate::synchronizer::{StateSynchronizer, SyncError};
use chrono::{DateTime, Local};
use rumqttc::QoS;
use statum::{machine, state};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Unable to connect to broker: {0}")]
    Connect(String),

    #[error("No connection to broker within {0:?}")]
    ConnectTimeout(Duration),

    #[error("Relay error: {0}")]
    Relay(#[from] RelayError),
}

/// Liveness flag published retained on `rpi/fireplace/status`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceStatus {
    Online,
    Offline,
}

impl PresenceStatus {
    pub fn payload(self) -> &'static str {
        match self {
            PresenceStatus::Online => "ONLINE",
            PresenceStatus::Offline => "OFFLINE",
        }
    }
}

impl fmt::Display for PresenceStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.payload())
    }
}

#[derive(Clone, Debug)]
pub struct SessionStats {
    pub started_at: DateTime<Local>,
    pub last_connected: Option<DateTime<Local>>,
    pub connects: u32,
    pub disconnects: u32,
    pub commands: u32,
}

impl Default for SessionStats {
    fn default() -> Self {
        Self {
            started_at: Local::now(),
            last_connected: None,
            connects: 0,
            disconnects: 0,
            commands: 0,
        }
    }
}

#[state]
#[derive(Debug, Clone)]
pub enum SessionState {
    Initializing, // Relay forced off, waiting for the first connection
    Running,      // Dispatching commands until shutdown is requested
    Draining,     // Inbound closed, flushing final publishes
    Closed,       // Disconnected
}

#[machine]
pub struct Session<S: SessionState> {
    transport: Arc<dyn Transport>,
    events: mpsc::UnboundedReceiver<TransportEvent>,
    synchronizer: Arc<StateSynchronizer>,
    dispatcher: CommandDispatcher,
    settings: SessionSettings,
    presence: PresenceStatus,
    stats: SessionStats,
}

impl<S: SessionState> Session<S> {
    pub fn presence(&self) -> PresenceStatus {
        self.presence
    }

    pub fn stats(&self) -> &SessionStats {
        &self.stats
    }

    /// Runs after every completed (re)connect.
    ///
    /// Announces ONLINE, subscribes to the command topic and republishes the
    /// current relay state. Never touches the relay, so repeated reconnects
    /// leave the device exactly as it was.
    async fn on_connect(&mut self) {
        self.stats.connects += 1;
        self.stats.last_connected = Some(Local::now());
        info!("Connected to broker (connection #{})", self.stats.connects);

        let online = PresenceStatus::Online;
        match self
            .transport
            .publish(TOPIC_STATUS, online.payload(), QoS::ExactlyOnce, true)
            .await
        {
            Ok(_) => {
                self.presence = online;
                info!("Announced {} on '{}'", online, TOPIC_STATUS);
            }
            Err(e) => error!("Failed to announce {}: {}", online, e),
        }

        info!("Subscribing to '{}'", TOPIC_POWER);
        if let Err(e) = self.transport.subscribe(TOPIC_POWER, QoS::AtLeastOnce).await {
            error!("Failed to subscribe to '{}': {}", TOPIC_POWER, e);
        }

        if let Err(e) = self.synchronizer.publish_current().await {
            error!("Failed to republish relay state: {}", e);
        }
    }

    fn on_disconnect(&mut self, reason: &str) {
        self.stats.disconnects += 1;
        warn!("Disconnected from broker: {} (waiting for reconnect)", reason);
    }
}

impl Session<Initializing> {
    /// Builds the session and drives the relay to its safe default.
    ///
    /// The relay is forced OFF before anything reaches the network, whatever
    /// state the pin was left in.
    pub fn create(
        relay: Box<dyn Actuator>,
        transport: Arc<dyn Transport>,
        events: mpsc::UnboundedReceiver<TransportEvent>,
        settings: SessionSettings,
    ) -> Result<Self, SessionError> {
        info!("Initializing session");

        let mut synchronizer = StateSynchronizer::new(relay, transport.clone());
        synchronizer.force_off()?;
        let synchronizer = Arc::new(synchronizer);
        let dispatcher = CommandDispatcher::new(synchronizer.clone());

        Ok(Self::new(
            transport,
            events,
            synchronizer,
            dispatcher,
            settings,
            PresenceStatus::Offline,
            SessionStats::default(),
        ))
    }

    /// Waits for the first connection and runs the connect handler.
    ///
    /// Fails if the transport gives up on the initial attempt or nothing
    /// arrives within `connect_timeout`; both are fatal at startup.
    pub async fn start(mut self) -> Result<Session<Running>, SessionError> {
        let timeout = self.settings.connect_timeout;
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            let event = match tokio::time::timeout_at(deadline, self.events.recv()).await {
                Ok(event) => event,
                Err(_) => {
                    error!("Broker did not accept the connection within {:?}", timeout);
                    return Err(SessionError::ConnectTimeout(timeout));
                }
            };

            match event {
                Some(TransportEvent::Connected) => {
                    self.on_connect().await;
                    info!("Session running");
                    return Ok(self.transition());
                }
                Some(TransportEvent::ConnectFailed(reason)) => {
                    return Err(SessionError::Connect(reason));
                }
                Some(other) => debug!("Ignoring {:?} before first connect", other),
                None => {
                    return Err(SessionError::Connect(
                        "transport stopped before connecting".to_string(),
                    ));
                }
            }
        }
    }
}

impl Session<Running> {
    /// Dispatches transport events until `shutdown` is cancelled.
    pub async fn run_until_shutdown(mut self, shutdown: CancellationToken) -> Session<Draining> {
        info!("Waiting for commands on '{}'", TOPIC_POWER);

        loop {
            let event = tokio::select! {
                // Cancellation first: nothing is dispatched once shutdown was requested
                biased;

                _ = shutdown.cancelled() => {
                    info!("Shutdown requested");
                    break;
                }

                event = self.events.recv() => event,
            };

            let Some(event) = event else {
                error!("Transport stopped unexpectedly");
                break;
            };

            // A publish waiting on a lost connection must not hold up shutdown
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => {
                    info!("Shutdown requested while handling an event");
                    break;
                }

                _ = self.handle_event(event) => {}
            }
        }

        self.transition()
    }

    async fn handle_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Connected => self.on_connect().await,
            TransportEvent::Disconnected(reason) => self.on_disconnect(&reason),
            TransportEvent::ConnectFailed(reason) => {
                warn!("Connection attempt failed: {}", reason)
            }
            TransportEvent::Message { topic, payload } => {
                self.stats.commands += 1;
                self.dispatcher.on_command_message(&topic, &payload).await;
            }
        }
    }
}

impl Session<Draining> {
    /// Runs the shutdown sequence exactly once.
    ///
    /// 1. stop accepting commands
    /// 2. turn the relay OFF and
    /// 3. wait for the OFF state to be acknowledged
    /// 4. publish OFFLINE and wait for it
    /// 5. disconnect
    ///
    /// Flush timeouts are logged and skipped. A relay that refuses to switch
    /// off does not stop the sequence either, but is reported afterwards.
    pub async fn shutdown(mut self) -> Result<Session<Closed>, SessionError> {
        info!("Shutting down");
        let flush_timeout = self.settings.flush_timeout;

        self.events.close();
        if let Err(e) = self.transport.unsubscribe(TOPIC_POWER).await {
            warn!("Failed to unsubscribe from '{}': {}", TOPIC_POWER, e);
        }

        // Queuing is bounded as well: the request channel may be full while
        // the connection is down
        let mut relay_error = None;
        match tokio::time::timeout(flush_timeout, self.synchronizer.turn_off()).await {
            Ok(Ok(pending)) => match pending.wait(flush_timeout).await {
                Ok(()) => info!("OFF state flushed to broker"),
                Err(e) => warn!("{}; continuing shutdown", e),
            },
            Ok(Err(SyncError::Relay(e))) => {
                error!("Relay did not switch off during shutdown: {}", e);
                relay_error = Some(e);
            }
            Ok(Err(e)) => warn!("{}; continuing shutdown", e),
            Err(_) => warn!(
                "OFF state not queued within {:?}; continuing shutdown",
                flush_timeout
            ),
        }

        let offline = PresenceStatus::Offline;
        self.presence = offline;
        let announce = self
            .transport
            .publish(TOPIC_STATUS, offline.payload(), QoS::ExactlyOnce, true);
        match tokio::time::timeout(flush_timeout, announce).await {
            Ok(Ok(pending)) => match pending.wait(flush_timeout).await {
                Ok(()) => info!("Announced {} on '{}'", offline, TOPIC_STATUS),
                Err(e) => warn!("{}; continuing shutdown", e),
            },
            Ok(Err(e)) => warn!("Failed to announce {}: {}", offline, e),
            Err(_) => warn!(
                "{} not queued within {:?}; continuing shutdown",
                offline, flush_timeout
            ),
        }

        if let Err(e) = self.transport.disconnect(flush_timeout).await {
            warn!("Disconnect did not complete cleanly: {}", e);
        }

        match relay_error {
            Some(e) => Err(e.into()),
            None => Ok(self.transition()),
        }
    }
}

impl Session<Closed> {}

/// Runs a full session: force OFF, connect, dispatch until `shutdown` is
/// cancelled, then flush and disconnect.
pub async fn run(
    relay: Box<dyn Actuator>,
    transport: Arc<dyn Transport>,
    events: mpsc::UnboundedReceiver<TransportEvent>,
    settings: SessionSettings,
    shutdown: CancellationToken,
) -> Result<(), SessionError> {
    let session = Session::create(relay, transport, events, settings)?;
    let running = session.start().await?;
    let draining = running.run_until_shutdown(shutdown).await;
    let closed = draining.shutdown().await?;

    let stats = closed.stats();
    info!(
        "Session ended after {}s: {} connects, {} disconnects, {} commands",
        (Local::now() - stats.started_at).num_seconds(),
        stats.connects,
        stats.disconnects,
        stats.commands
    );
    Ok(())
}
