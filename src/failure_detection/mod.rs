//! Keep-alive based failure detection.
//!
//! A node pings every peer it shares a paxos instance with every half
//! [`node_detection_timeout`](crate::replica::Configuration). Hearing *any* message from a peer counts
//! as hearing from it, so pings only matter when a peer has nothing else to say.
//!
//! The detector answers two questions, both used by instances to decide whether to run for
//! coordinator:
//! 1. [Is a node up?](FailureDetector::is_node_up) Yes if it was heard from within the timeout.
//! 2. [Has it been down for long?](FailureDetector::is_long_dead) Yes if it was not heard from within
//!    three timeouts.
//!
//! Nodes that were never heard from are judged from the time the detector was created, so that a
//! freshly started replica does not think everyone is down.

pub mod messages;

use std::collections::{BTreeSet, HashMap};
use std::time::{Duration, Instant};

use crate::types::data_types::NodeID;

use messages::FailureDetect;

/// Factor of the detection timeout after which a silent node counts as long dead.
pub(crate) const LONG_DEAD_FACTOR: u32 = 3;

pub(crate) struct FailureDetector {
    me: NodeID,
    timeout: Duration,
    started: Instant,
    last_heard: HashMap<NodeID, Instant>,
    targets: BTreeSet<NodeID>,
    last_pinged: Option<Instant>,
}

impl FailureDetector {
    pub(crate) fn new(me: NodeID, timeout: Duration, now: Instant) -> FailureDetector {
        FailureDetector {
            me,
            timeout,
            started: now,
            last_heard: HashMap::new(),
            targets: BTreeSet::new(),
            last_pinged: None,
        }
    }

    pub(crate) fn heard_from(&mut self, node: NodeID, now: Instant) {
        let last_heard = self.last_heard.entry(node).or_insert(now);
        if now > *last_heard {
            *last_heard = now;
        }
    }

    fn silence(&self, node: &NodeID, now: Instant) -> Duration {
        let since = self.last_heard.get(node).copied().unwrap_or(self.started);
        now.saturating_duration_since(since)
    }

    pub(crate) fn is_node_up(&self, node: NodeID, now: Instant) -> bool {
        node == self.me || self.silence(&node, now) < self.timeout
    }

    pub(crate) fn is_long_dead(&self, node: NodeID, now: Instant) -> bool {
        node != self.me && self.silence(&node, now) >= self.timeout * LONG_DEAD_FACTOR
    }

    /// Start pinging `nodes`.
    pub(crate) fn add_targets<'a>(&mut self, nodes: impl IntoIterator<Item = &'a NodeID>) {
        let me = self.me;
        self.targets
            .extend(nodes.into_iter().copied().filter(|node| *node != me));
    }

    /// Get every node being pinged.
    pub(crate) fn targets(&self) -> Vec<NodeID> {
        self.targets.iter().copied().collect()
    }

    /// Get the pings to send, if half a timeout has passed since the last round.
    pub(crate) fn pings_due(&mut self, now: Instant) -> Vec<(NodeID, FailureDetect)> {
        let due = self
            .last_pinged
            .map_or(true, |last_pinged| now.saturating_duration_since(last_pinged) >= self.timeout / 2);
        if !due {
            return Vec::new();
        }
        self.last_pinged = Some(now);
        self.targets
            .iter()
            .map(|target| (*target, FailureDetect::new(self.me, *target)))
            .collect()
    }
}
