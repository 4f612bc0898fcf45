//! Command Dispatcher
//!
//! Decodes payloads arriving on `rpi/fireplace/power` and routes them to the
//! [`StateSynchronizer`]. The command topic is a shared namespace, so anything
//! that is not exactly `ON` or `OFF` is logged and dropped instead of being
//! treated as an error.

use crate::mqtt::TOPIC_POWER;
use crate::synchronizer::StateSynchronizer;
use std::sync::Arc;
use tracing::{error, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    TurnOn,
    TurnOff,
    Unknown(Vec<u8>),
}

impl Command {
    pub fn decode(payload: &[u8]) -> Self {
        match std::str::from_utf8(payload) {
            Ok("ON") => Command::TurnOn,
            Ok("OFF") => Command::TurnOff,
            _ => Command::Unknown(payload.to_vec()),
        }
    }
}

pub struct CommandDispatcher {
    synchronizer: Arc<StateSynchronizer>,
}

impl CommandDispatcher {
    pub fn new(synchronizer: Arc<StateSynchronizer>) -> Self {
        Self { synchronizer }
    }

    pub async fn on_command_message(&self, topic: &str, payload: &[u8]) {
        info!("{} {}", topic, String::from_utf8_lossy(payload));

        if topic != TOPIC_POWER {
            warn!("Ignoring message on unexpected topic '{}'", topic);
            return;
        }

        let result = match Command::decode(payload) {
            Command::TurnOn => {
                info!("Received 'ON' command");
                self.synchronizer.turn_on().await
            }
            Command::TurnOff => {
                info!("Received 'OFF' command");
                self.synchronizer.turn_off().await
            }
            Command::Unknown(raw) => {
                warn!("Ignoring unknown payload '{}'", String::from_utf8_lossy(&raw));
                return;
            }
        };

        // The state publish is queued; nobody waits for its acknowledgement here
        if let Err(e) = result {
            error!("Command not applied: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mqtt::TOPIC_STATE;
    use crate::relay::{Actuator, SimulatedRelay};
    use crate::synchronizer::ActuatorState;
    use crate::testing::RecordingTransport;

    fn setup(
        relay: &SimulatedRelay,
    ) -> (
        CommandDispatcher,
        Arc<StateSynchronizer>,
        Arc<RecordingTransport>,
    ) {
        let transport = Arc::new(RecordingTransport::new());
        let sync = Arc::new(StateSynchronizer::new(
            Box::new(relay.clone()),
            transport.clone(),
        ));
        (CommandDispatcher::new(sync.clone()), sync, transport)
    }

    #[test]
    fn decodes_exact_commands_only() {
        assert_eq!(Command::decode(b"ON"), Command::TurnOn);
        assert_eq!(Command::decode(b"OFF"), Command::TurnOff);
        assert_eq!(Command::decode(b"on"), Command::Unknown(b"on".to_vec()));
        assert_eq!(Command::decode(b" ON"), Command::Unknown(b" ON".to_vec()));
        assert_eq!(Command::decode(b""), Command::Unknown(Vec::new()));
        assert_eq!(
            Command::decode(&[0xff, 0xfe]),
            Command::Unknown(vec![0xff, 0xfe])
        );
    }

    #[tokio::test]
    async fn last_valid_command_wins() {
        let sequences = vec![
            (vec!["ON"], ActuatorState::On),
            (vec!["ON", "OFF", "ON", "TOGGLE"], ActuatorState::On),
            (vec!["OFF", "ON", "", "OFF", "bogus"], ActuatorState::Off),
            (vec!["TOGGLE", "on"], ActuatorState::Off),
        ];

        for (commands, expected) in sequences {
            let relay = SimulatedRelay::new();
            let (dispatcher, sync, _transport) = setup(&relay);
            for payload in &commands {
                dispatcher.on_command_message(TOPIC_POWER, payload.as_bytes()).await;
            }
            assert_eq!(sync.state().await, expected, "after {:?}", commands);
            assert_eq!(relay.current_state(), expected.is_on());
        }
    }

    #[tokio::test]
    async fn unknown_payload_is_a_no_op() {
        let relay = SimulatedRelay::new();
        let (dispatcher, sync, transport) = setup(&relay);
        dispatcher.on_command_message(TOPIC_POWER, b"ON").await;
        let before = transport.calls().len();

        dispatcher.on_command_message(TOPIC_POWER, b"TOGGLE").await;
        dispatcher.on_command_message(TOPIC_POWER, &[0xc3, 0x28]).await;

        assert_eq!(sync.state().await, ActuatorState::On);
        assert_eq!(relay.writes(), 1);
        assert_eq!(transport.calls().len(), before);
    }

    #[tokio::test]
    async fn other_topics_are_ignored() {
        let relay = SimulatedRelay::new();
        let (dispatcher, _sync, transport) = setup(&relay);

        dispatcher.on_command_message("rpi/fireplace/state", b"ON").await;

        assert!(!relay.current_state());
        assert!(transport.publishes().is_empty());
    }

    #[tokio::test]
    async fn relay_failure_is_absorbed() {
        let relay = SimulatedRelay::new();
        let (dispatcher, sync, transport) = setup(&relay);
        relay.set_failing(true);

        dispatcher.on_command_message(TOPIC_POWER, b"ON").await;
        assert_eq!(sync.state().await, ActuatorState::Off);
        assert!(transport.payloads(TOPIC_STATE).is_empty());

        relay.set_failing(false);
        dispatcher.on_command_message(TOPIC_POWER, b"ON").await;
        assert_eq!(transport.payloads(TOPIC_STATE), vec!["ON"]);
    }
}
