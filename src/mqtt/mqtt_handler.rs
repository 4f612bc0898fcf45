use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, EventLoop, LastWill, MqttOptions, Outgoing, Packet, QoS};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::ack_tracker::AckTracker;
use super::{PendingPublish, Transport, TransportError, TransportEvent, TOPIC_STATUS};
use crate::config::MqttSettings;
use crate::session::PresenceStatus;

/// Capacity of rumqttc's request channel; publishers wait for room
const REQUEST_CAPACITY: usize = 16;

#[derive(Clone, Default, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    #[default]
    Connecting,
    Connected,
    Reconnecting,
}

/// rumqttc-backed [`Transport`]
///
/// Owns the client half; the event loop half runs in its own task, forwards
/// [`TransportEvent`]s to the session and feeds packet ids and
/// acknowledgements into the shared [`AckTracker`].
///
/// The event channel is unbounded: the event loop never waits on the
/// session, so a session waiting for room in the request channel cannot
/// stall the loop that drains it.
pub struct MqttTransport {
    client: AsyncClient,
    tracker: Arc<Mutex<AckTracker>>,
    /// Serializes publish requests so they reach the client in registration order
    send_order: tokio::sync::Mutex<()>,
    driver: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl MqttTransport {
    /// Starts connecting in the background.
    ///
    /// Nothing is known about the broker yet when this returns; the first
    /// [`TransportEvent`] on the returned receiver is either `Connected` or
    /// `ConnectFailed`.
    pub fn connect(
        settings: &MqttSettings,
        reconnect_delay: Duration,
    ) -> (Self, mpsc::UnboundedReceiver<TransportEvent>) {
        info!(
            "Connecting to MQTT broker {}:{} as '{}'",
            settings.host, settings.port, settings.client_id
        );

        let mut mqtt_options =
            MqttOptions::new(settings.client_id.clone(), settings.host.clone(), settings.port);
        mqtt_options
            .set_credentials(settings.username.clone(), settings.password.clone())
            .set_keep_alive(settings.keep_alive)
            .set_clean_session(true)
            .set_last_will(LastWill::new(
                TOPIC_STATUS,
                PresenceStatus::Offline.payload(),
                QoS::ExactlyOnce,
                true,
            ));

        let (client, eventloop) = AsyncClient::new(mqtt_options, REQUEST_CAPACITY);
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let tracker = Arc::new(Mutex::new(AckTracker::new()));

        let driver = tokio::spawn(drive_event_loop(
            eventloop,
            event_tx,
            tracker.clone(),
            reconnect_delay,
        ));

        let transport = Self {
            client,
            tracker,
            send_order: tokio::sync::Mutex::new(()),
            driver: tokio::sync::Mutex::new(Some(driver)),
        };
        (transport, event_rx)
    }

    fn tracker(&self) -> MutexGuard<'_, AckTracker> {
        lock_tracker(&self.tracker)
    }
}

#[async_trait]
impl Transport for MqttTransport {
    async fn publish(
        &self,
        topic: &str,
        payload: &str,
        qos: QoS,
        retain: bool,
    ) -> Result<PendingPublish, TransportError> {
        // Registrations and requests must enter their queues in the same order
        let _order = self.send_order.lock().await;
        let pending = self.tracker().register(topic, qos);
        let registration = Registration::new(&self.tracker);

        if let Err(e) = self
            .client
            .publish(topic, qos, retain, payload.as_bytes().to_vec())
            .await
        {
            error!("Failed to queue publish to '{}': {}", topic, e);
            return Err(e.into());
        }
        registration.confirm();

        debug!("Queued publish '{}' -> '{}' (retain: {})", payload, topic, retain);
        Ok(pending)
    }

    async fn subscribe(&self, topic: &str, qos: QoS) -> Result<(), TransportError> {
        self.client.subscribe(topic, qos).await?;
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), TransportError> {
        self.client.unsubscribe(topic).await?;
        Ok(())
    }

    async fn disconnect(&self, timeout: Duration) -> Result<(), TransportError> {
        match tokio::time::timeout(timeout, self.client.disconnect()).await {
            Ok(Ok(())) => {}
            // The event loop is already gone, nothing left to tell the broker
            Ok(Err(e)) => debug!("Disconnect request not delivered: {}", e),
            Err(_) => warn!("Disconnect request not queued within {:?}", timeout),
        }

        let Some(mut driver) = self.driver.lock().await.take() else {
            return Ok(());
        };

        match tokio::time::timeout(timeout, &mut driver).await {
            Ok(joined) => {
                joined?;
                info!("MQTT connection closed");
                Ok(())
            }
            Err(_) => {
                driver.abort();
                lock_tracker(&self.tracker).abandon();
                Err(TransportError::ShutdownTimeout(timeout))
            }
        }
    }
}

/// Undoes a tracker registration unless the client accepted the request.
///
/// Covers both a refused request and a publish future dropped while it was
/// waiting for room in the request channel.
struct Registration<'a> {
    tracker: &'a Mutex<AckTracker>,
    accepted: bool,
}

impl<'a> Registration<'a> {
    fn new(tracker: &'a Mutex<AckTracker>) -> Self {
        Self {
            tracker,
            accepted: false,
        }
    }

    fn confirm(mut self) {
        self.accepted = true;
    }
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        if !self.accepted {
            lock_tracker(self.tracker).cancel_last();
        }
    }
}

fn lock_tracker(tracker: &Mutex<AckTracker>) -> MutexGuard<'_, AckTracker> {
    // The tracker holds no invariant a panicking holder could break halfway
    tracker.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn forward(events: &mpsc::UnboundedSender<TransportEvent>, event: TransportEvent) {
    if let Err(e) = events.send(event) {
        debug!("Session no longer listening, dropped {:?}", e.0);
    }
}

/// Polls the rumqttc event loop until DISCONNECT went out or the first
/// connection attempt failed.
///
/// Keeps running after the session closed its receiver, so publishes issued
/// during shutdown still reach the broker.
async fn drive_event_loop(
    mut eventloop: EventLoop,
    events: mpsc::UnboundedSender<TransportEvent>,
    tracker: Arc<Mutex<AckTracker>>,
    reconnect_delay: Duration,
) {
    let mut state = ConnectionState::Connecting;
    let mut ever_connected = false;

    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                info!("Connected to broker (session present: {})", ack.session_present);
                if ever_connected {
                    lock_tracker(&tracker).on_reconnected();
                }
                state = ConnectionState::Connected;
                ever_connected = true;
                forward(&events, TransportEvent::Connected);
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                debug!("Received {} bytes on '{}'", publish.payload.len(), publish.topic);
                forward(
                    &events,
                    TransportEvent::Message {
                        topic: publish.topic.clone(),
                        payload: publish.payload.to_vec(),
                    },
                );
            }
            Ok(Event::Incoming(Packet::PubAck(ack))) => {
                lock_tracker(&tracker).on_acknowledged(ack.pkid)
            }
            Ok(Event::Incoming(Packet::PubRec(rec))) => {
                lock_tracker(&tracker).on_received(rec.pkid)
            }
            Ok(Event::Incoming(Packet::PubComp(comp))) => {
                lock_tracker(&tracker).on_acknowledged(comp.pkid)
            }
            Ok(Event::Incoming(Packet::SubAck(ack))) => {
                debug!("Subscription {} acknowledged: {:?}", ack.pkid, ack.return_codes)
            }
            Ok(Event::Outgoing(Outgoing::Publish(pkid))) => {
                lock_tracker(&tracker).on_outgoing_publish(pkid)
            }
            Ok(Event::Outgoing(Outgoing::AwaitAck(pkid))) => {
                lock_tracker(&tracker).on_await_ack(pkid)
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                info!("Disconnect sent, stopping event loop");
                break;
            }
            Ok(event) => debug!("MQTT event: {:?}", event),
            Err(e) => {
                if !ever_connected {
                    error!("Initial connection to broker failed: {}", e);
                    forward(&events, TransportEvent::ConnectFailed(e.to_string()));
                    break;
                }
                if state == ConnectionState::Connected {
                    warn!("Connection to broker lost: {}", e);
                    forward(&events, TransportEvent::Disconnected(e.to_string()));
                } else {
                    debug!("Reconnect attempt failed: {}", e);
                }
                state = ConnectionState::Reconnecting;
                tokio::time::sleep(reconnect_delay).await;
            }
        }
    }

    lock_tracker(&tracker).abandon();
}
