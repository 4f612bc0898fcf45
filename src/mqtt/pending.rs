use std::time::Duration;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::debug;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PublishError {
    #[error("Publish to '{topic}' not acknowledged within {after:?}")]
    Timeout { topic: String, after: Duration },

    #[error("Publish to '{topic}' dropped before it was acknowledged")]
    Dropped { topic: String },
}

/// Handle for a publish that is in flight towards the broker.
///
/// Dropping the handle does not cancel the publish; it only gives up on
/// learning when it was acknowledged.
#[derive(Debug)]
pub struct PendingPublish {
    topic: String,
    ack: oneshot::Receiver<()>,
}

impl PendingPublish {
    /// Creates the handle together with the sender that resolves it.
    pub fn channel(topic: &str) -> (oneshot::Sender<()>, Self) {
        let (tx, rx) = oneshot::channel();
        (
            tx,
            Self {
                topic: topic.to_string(),
                ack: rx,
            },
        )
    }

    /// A handle that is already resolved
    pub fn acknowledged(topic: &str) -> Self {
        let (tx, pending) = Self::channel(topic);
        let _ = tx.send(());
        pending
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Waits for the acknowledgement, giving up after `timeout`.
    pub async fn wait(self, timeout: Duration) -> Result<(), PublishError> {
        match tokio::time::timeout(timeout, self.ack).await {
            Ok(Ok(())) => {
                debug!("Publish to '{}' acknowledged", self.topic);
                Ok(())
            }
            Ok(Err(_)) => Err(PublishError::Dropped { topic: self.topic }),
            Err(_) => Err(PublishError::Timeout {
                topic: self.topic,
                after: timeout,
            }),
        }
    }
}
