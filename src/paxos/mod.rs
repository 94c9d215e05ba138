//! The Paxos protocol: the state machine of a single paxos instance and the messages it exchanges.
//!
//! ## Components
//!
//! Every replica of a paxos instance runs an [instance](instance), which in turn consists of:
//! 1. An [acceptor](acceptor), which every member runs at all times.
//! 2. A [coordinator](coordinator), which exists only while the member is running for, or acting
//!    as, the coordinator of a ballot.
//!
//! Instances never do network I/O themselves. Handling a message or a timer tick yields a list of
//! [`MessagingTask`]s, which the caller [batches](batching) and sends.
//!
//! ## Safety
//!
//! For every slot at most one request is ever decided. Acceptors log every promise and every accepted
//! pvalue before replying, so this holds across crashes too.

pub mod messages;

pub(crate) mod acceptor;

pub(crate) mod coordinator;

pub(crate) mod gc;

pub(crate) mod batching;

pub(crate) mod instance;

use crate::types::{
    ballot::Ballot,
    data_types::{NodeID, Slot, Version},
    replica_group::ReplicaGroup,
};

use messages::PaxosMessage;

/// A message and the nodes it is to be sent to.
#[derive(Clone, Debug)]
pub(crate) struct MessagingTask {
    pub(crate) recipients: Vec<NodeID>,
    pub(crate) message: PaxosMessage,
}

impl MessagingTask {
    pub(crate) fn new(recipients: Vec<NodeID>, message: PaxosMessage) -> MessagingTask {
        MessagingTask { recipients, message }
    }
}

/// A snapshot of the state of a paxos instance at one replica.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InstanceStatus {
    pub version: Version,
    pub group: ReplicaGroup,
    /// The highest ballot the local acceptor has seen.
    pub ballot: Ballot,
    /// The next slot to execute.
    pub next_slot: Slot,
    pub gc_slot: Option<Slot>,
    /// Whether this replica is the active coordinator of `ballot`.
    pub coordinator_active: bool,
    pub stopped: bool,
}
