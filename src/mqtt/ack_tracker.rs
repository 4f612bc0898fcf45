//! Publish acknowledgement bookkeeping
//!
//! rumqttc's client only queues requests; packet ids are assigned later by the
//! event loop, which reports them as `Outgoing::Publish(pkid)` in the order
//! the requests were queued. The tracker mirrors that order:
//!
//! ```text
//! register() ──► queued (FIFO) ──Outgoing::Publish(pkid)──► in_flight[pkid]
//!                      │                                        │
//!                      └──Outgoing::AwaitAck(pkid)──► held ─────┤
//!                                                               │
//!                                      PubAck / PubComp ────────┴──► resolved
//! ```
//!
//! QoS 0 publishes have no acknowledgement and resolve as soon as they are
//! sent.
//!
//! Packet ids wrap at the client's inflight limit, so one id can carry more
//! than one publish at a time:
//!
//! - rumqttc holds a new publish back when its id is still waiting for
//!   PUBACK/PUBREC and reports `AwaitAck(pkid)`. The held publish is written
//!   later, on the old one's acknowledgement, as `Outgoing::Publish(pkid)`.
//! - an id whose QoS 2 publish was already PUBREC'd is reused right away,
//!   while the old publish still waits for PUBCOMP.
//!
//! Each id therefore keeps a FIFO of publishes and an acknowledgement always
//! resolves the oldest one. After a reconnect rumqttc resends every publish
//! that was not PUBREC'd under its old id; those resends bind nothing new.
//! Should the broker acknowledge out of order within one id, a handle can
//! resolve late. The bound passed to [`PendingPublish::wait`] covers that.

use super::pending::PendingPublish;
use rumqttc::QoS;
use std::collections::{HashMap, HashSet, VecDeque};
use tokio::sync::oneshot;
use tracing::{debug, warn};

#[derive(Debug)]
struct Tracked {
    topic: String,
    qos: QoS,
    /// PUBREC seen, only PUBCOMP is outstanding
    released: bool,
    ack: oneshot::Sender<()>,
}

#[derive(Debug, Default)]
pub struct AckTracker {
    queued: VecDeque<Tracked>,
    in_flight: HashMap<u16, VecDeque<Tracked>>,
    /// Ids whose next `Outgoing::Publish` is a held-back publish already bound
    held: HashSet<u16>,
    /// Ids whose next `Outgoing::Publish` is a resend after reconnecting
    resends: HashSet<u16>,
}

impl AckTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a publish request about to be handed to the client.
    pub fn register(&mut self, topic: &str, qos: QoS) -> PendingPublish {
        let (ack, pending) = PendingPublish::channel(topic);
        self.queued.push_back(Tracked {
            topic: topic.to_string(),
            qos,
            released: false,
            ack,
        });
        pending
    }

    /// Forgets the most recent registration when the client refused the request.
    pub fn cancel_last(&mut self) {
        if let Some(tracked) = self.queued.pop_back() {
            debug!("Cancelled tracking for publish to '{}'", tracked.topic);
        }
    }

    /// The event loop wrote a PUBLISH with `pkid`.
    pub fn on_outgoing_publish(&mut self, pkid: u16) {
        if pkid != 0 && self.resends.remove(&pkid) {
            debug!("Resent publish {} after reconnect", pkid);
            return;
        }
        if pkid != 0 && self.held.remove(&pkid) {
            debug!("Held back publish {} written", pkid);
            return;
        }
        self.bind(pkid);
    }

    /// The event loop held a publish back because `pkid` is still in flight.
    pub fn on_await_ack(&mut self, pkid: u16) {
        debug!("Publish held back until {} is acknowledged", pkid);
        if self.bind(pkid) {
            self.held.insert(pkid);
        }
    }

    /// PUBREC for `pkid`: the oldest publish on that id now only waits for PUBCOMP.
    pub fn on_received(&mut self, pkid: u16) {
        let released = self
            .in_flight
            .get_mut(&pkid)
            .and_then(|publishes| publishes.iter_mut().find(|tracked| !tracked.released));
        match released {
            Some(tracked) => tracked.released = true,
            None => debug!("PUBREC for untracked publish {}", pkid),
        }
    }

    /// The broker completed the handshake for `pkid` (PUBACK or PUBCOMP).
    pub fn on_acknowledged(&mut self, pkid: u16) {
        let Some(publishes) = self.in_flight.get_mut(&pkid) else {
            debug!("Acknowledgement for untracked publish {}", pkid);
            return;
        };
        let tracked = publishes.pop_front();
        if publishes.is_empty() {
            self.in_flight.remove(&pkid);
        }
        if let Some(tracked) = tracked {
            debug!("Broker acknowledged publish {} to '{}'", pkid, tracked.topic);
            // The waiter may have given up already
            let _ = tracked.ack.send(());
        }
    }

    /// A new connection is up; unreleased publishes will be resent under
    /// their old ids.
    pub fn on_reconnected(&mut self) {
        self.held.clear();
        self.resends = self
            .in_flight
            .iter()
            .filter(|(_, publishes)| publishes.iter().any(|tracked| !tracked.released))
            .map(|(pkid, _)| *pkid)
            .collect();
        if !self.resends.is_empty() {
            debug!("Expecting {} resent publishes", self.resends.len());
        }
    }

    /// Requests not yet acknowledged, queued or in flight
    pub fn outstanding(&self) -> usize {
        self.queued.len() + self.in_flight.values().map(VecDeque::len).sum::<usize>()
    }

    /// Drops every outstanding request; their handles resolve as dropped.
    pub fn abandon(&mut self) {
        let outstanding = self.outstanding();
        if outstanding > 0 {
            warn!("Abandoning {} unacknowledged publishes", outstanding);
        }
        self.queued.clear();
        self.in_flight.clear();
        self.held.clear();
        self.resends.clear();
    }

    // Binds the oldest queued request to `pkid`. Returns whether it now waits
    // for an acknowledgement.
    fn bind(&mut self, pkid: u16) -> bool {
        let Some(tracked) = self.queued.pop_front() else {
            warn!("Outgoing publish {} has no matching request", pkid);
            return false;
        };

        if tracked.qos == QoS::AtMostOnce || pkid == 0 {
            debug!("Publish to '{}' sent without acknowledgement", tracked.topic);
            let _ = tracked.ack.send(());
            false
        } else {
            debug!("Publish to '{}' in flight as {}", tracked.topic, pkid);
            self.in_flight.entry(pkid).or_default().push_back(tracked);
            true
        }
    }
}
