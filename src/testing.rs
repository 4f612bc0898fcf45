//! Test doubles shared by the unit tests
//!
//! - [`RecordingTransport`] stands in for the broker connection.
//! - [`FakeBroker`] is a loopback MQTT 3.1.1 broker for driving the real
//!   [`MqttTransport`](crate::mqtt::mqtt_handler::MqttTransport).

use crate::config::MqttSettings;
use crate::mqtt::{PendingPublish, Transport, TransportError};
use async_trait::async_trait;
use bytes::BytesMut;
use rumqttc::mqttbytes::v4::read;
use rumqttc::{
    ConnAck, ConnectReturnCode, Packet, PingResp, PubAck, PubComp, PubRec, Publish, QoS, SubAck,
    SubscribeReasonCode, UnsubAck,
};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, PartialEq)]
pub struct Published {
    pub topic: String,
    pub payload: String,
    pub qos: QoS,
    pub retain: bool,
    /// Logical time the publish was issued
    pub seq: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    Publish(Published),
    Subscribe(String, QoS),
    Unsubscribe(String),
    Disconnect,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Ack {
    pub topic: String,
    pub payload: String,
    /// Logical time the broker acknowledged
    pub seq: u64,
}

#[derive(Debug, Clone, Copy)]
enum AckMode {
    Immediate,
    Delayed(Duration),
    Never,
}

#[derive(Debug, Default)]
struct Ledger {
    clock: AtomicU64,
    calls: Mutex<Vec<Call>>,
    acks: Mutex<Vec<Ack>>,
}

impl Ledger {
    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn record_ack(&self, topic: String, payload: String) {
        let seq = self.tick();
        self.acks.lock().unwrap().push(Ack {
            topic,
            payload,
            seq,
        });
    }
}

/// Transport that records every call and acknowledges on a configurable schedule.
#[derive(Debug)]
pub struct RecordingTransport {
    ledger: Arc<Ledger>,
    mode: AckMode,
    held: Mutex<Vec<oneshot::Sender<()>>>,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::with_mode(AckMode::Immediate)
    }

    /// Acknowledges each publish `delay` after it was issued.
    pub fn with_ack_delay(delay: Duration) -> Self {
        Self::with_mode(AckMode::Delayed(delay))
    }

    /// Never acknowledges anything.
    pub fn unacknowledged() -> Self {
        Self::with_mode(AckMode::Never)
    }

    fn with_mode(mode: AckMode) -> Self {
        Self {
            ledger: Arc::new(Ledger::default()),
            mode,
            held: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<Call> {
        self.ledger.calls.lock().unwrap().clone()
    }

    pub fn publishes(&self) -> Vec<Published> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::Publish(p) => Some(p),
                _ => None,
            })
            .collect()
    }

    /// Payloads published to `topic`, in order
    pub fn payloads(&self, topic: &str) -> Vec<String> {
        self.publishes()
            .into_iter()
            .filter(|p| p.topic == topic)
            .map(|p| p.payload)
            .collect()
    }

    pub fn subscribes(&self) -> usize {
        self.calls()
            .iter()
            .filter(|call| matches!(call, Call::Subscribe(..)))
            .count()
    }

    pub fn acks(&self) -> Vec<Ack> {
        self.ledger.acks.lock().unwrap().clone()
    }

    fn record(&self, call: Call) {
        self.ledger.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn publish(
        &self,
        topic: &str,
        payload: &str,
        qos: QoS,
        retain: bool,
    ) -> Result<PendingPublish, TransportError> {
        let seq = self.ledger.tick();
        self.record(Call::Publish(Published {
            topic: topic.to_string(),
            payload: payload.to_string(),
            qos,
            retain,
            seq,
        }));

        let (tx, pending) = PendingPublish::channel(topic);
        let (topic, payload) = (topic.to_string(), payload.to_string());
        match self.mode {
            AckMode::Immediate => {
                self.ledger.record_ack(topic, payload);
                let _ = tx.send(());
            }
            AckMode::Delayed(delay) => {
                let ledger = self.ledger.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    ledger.record_ack(topic, payload);
                    let _ = tx.send(());
                });
            }
            AckMode::Never => self.held.lock().unwrap().push(tx),
        }
        Ok(pending)
    }

    async fn subscribe(&self, topic: &str, qos: QoS) -> Result<(), TransportError> {
        self.record(Call::Subscribe(topic.to_string(), qos));
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), TransportError> {
        self.record(Call::Unsubscribe(topic.to_string()));
        Ok(())
    }

    async fn disconnect(&self, _timeout: Duration) -> Result<(), TransportError> {
        self.record(Call::Disconnect);
        Ok(())
    }
}

/// How the broker treats one incoming connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Greeting {
    /// CONNACK and serve normally
    Accept,
    /// CONNACK, then close the socket
    AcceptThenHangUp,
    /// Close the socket without answering CONNECT
    HangUp,
    /// Read CONNECT and never answer
    Silent,
}

#[derive(Debug, Clone)]
pub struct BrokerScript {
    /// Per connection, in accept order; later connections are accepted
    pub greetings: Vec<Greeting>,
    /// Answer client publishes with PUBACK / PUBREC
    pub acknowledge: bool,
    /// Written in a single write right after the first SUBACK
    pub after_subscribe: Vec<Publish>,
}

impl Default for BrokerScript {
    fn default() -> Self {
        Self {
            greetings: Vec::new(),
            acknowledge: true,
            after_subscribe: Vec::new(),
        }
    }
}

/// Loopback broker that records every packet the client sends.
pub struct FakeBroker {
    addr: SocketAddr,
    received: Arc<Mutex<Vec<Packet>>>,
    task: JoinHandle<()>,
}

impl FakeBroker {
    pub async fn start(script: BrokerScript) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let received = Arc::new(Mutex::new(Vec::new()));
        let task = tokio::spawn(accept_connections(listener, script, received.clone()));
        Self {
            addr,
            received,
            task,
        }
    }

    pub fn settings(&self) -> MqttSettings {
        settings_for(self.addr.port())
    }

    pub fn received(&self) -> Vec<Packet> {
        self.received.lock().unwrap().clone()
    }

    /// Payloads the client published to `topic`, in arrival order
    pub fn payloads(&self, topic: &str) -> Vec<String> {
        self.received()
            .into_iter()
            .filter_map(|packet| match packet {
                Packet::Publish(p) if p.topic == topic => {
                    Some(String::from_utf8_lossy(&p.payload).into_owned())
                }
                _ => None,
            })
            .collect()
    }

    pub fn disconnects(&self) -> usize {
        self.received()
            .iter()
            .filter(|packet| matches!(packet, Packet::Disconnect))
            .count()
    }

    /// Polls until `done` holds for the received packets or `limit` passes.
    pub async fn wait_for(&self, limit: Duration, done: impl Fn(&FakeBroker) -> bool) -> bool {
        let deadline = tokio::time::Instant::now() + limit;
        while tokio::time::Instant::now() < deadline {
            if done(self) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        done(self)
    }
}

impl Drop for FakeBroker {
    fn drop(&mut self) {
        self.task.abort();
    }
}

pub fn settings_for(port: u16) -> MqttSettings {
    MqttSettings {
        host: "127.0.0.1".to_string(),
        port,
        username: "fireplace".to_string(),
        password: "secret".to_string(),
        client_id: "fireplacectl-test".to_string(),
        keep_alive: Duration::from_secs(60),
    }
}

/// A port nothing listens on
pub async fn closed_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

async fn accept_connections(
    listener: TcpListener,
    script: BrokerScript,
    received: Arc<Mutex<Vec<Packet>>>,
) {
    let mut connection = 0;
    while let Ok((stream, _)) = listener.accept().await {
        let greeting = script
            .greetings
            .get(connection)
            .copied()
            .unwrap_or(Greeting::Accept);
        connection += 1;
        tokio::spawn(serve(stream, greeting, script.clone(), received.clone()));
    }
}

async fn serve(
    mut stream: TcpStream,
    greeting: Greeting,
    mut script: BrokerScript,
    received: Arc<Mutex<Vec<Packet>>>,
) {
    let mut buffer = BytesMut::with_capacity(4096);
    loop {
        let packet = match read(&mut buffer, 64 * 1024) {
            Ok(packet) => packet,
            Err(rumqttc::mqttbytes::Error::InsufficientBytes(_)) => {
                match stream.read_buf(&mut buffer).await {
                    Ok(0) | Err(_) => return,
                    Ok(_) => continue,
                }
            }
            Err(_) => return,
        };
        received.lock().unwrap().push(packet.clone());

        let mut out = BytesMut::new();
        match packet {
            Packet::Connect(_) => match greeting {
                Greeting::HangUp => return,
                Greeting::Silent => std::future::pending::<()>().await,
                Greeting::Accept | Greeting::AcceptThenHangUp => {
                    ConnAck::new(ConnectReturnCode::Success, false)
                        .write(&mut out)
                        .unwrap();
                    if greeting == Greeting::AcceptThenHangUp {
                        let _ = stream.write_all(&out).await;
                        return;
                    }
                }
            },
            Packet::Subscribe(subscribe) => {
                let codes = subscribe
                    .filters
                    .iter()
                    .map(|filter| SubscribeReasonCode::Success(filter.qos))
                    .collect();
                SubAck::new(subscribe.pkid, codes).write(&mut out).unwrap();
                for publish in std::mem::take(&mut script.after_subscribe) {
                    publish.write(&mut out).unwrap();
                }
            }
            Packet::Unsubscribe(unsubscribe) => {
                UnsubAck::new(unsubscribe.pkid).write(&mut out).unwrap();
            }
            Packet::Publish(publish) if script.acknowledge => match publish.qos {
                QoS::AtLeastOnce => {
                    PubAck::new(publish.pkid).write(&mut out).unwrap();
                }
                QoS::ExactlyOnce => {
                    PubRec::new(publish.pkid).write(&mut out).unwrap();
                }
                QoS::AtMostOnce => {}
            },
            Packet::PubRel(rel) => {
                PubComp::new(rel.pkid).write(&mut out).unwrap();
            }
            Packet::PingReq => {
                PingResp.write(&mut out).unwrap();
            }
            Packet::Disconnect => return,
            _ => {}
        }

        if !out.is_empty() && stream.write_all(&out).await.is_err() {
            return;
        }
    }
}
