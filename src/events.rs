/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Definitions of the events a replica publishes, for event handling and logging.
//!
//! An event for a given action indicates that the action has been completed. Events are sent by the
//! threads that perform the actions to the event bus thread, which calls the registered
//! [handlers](crate::replica::ReplicaSpecBuilder) one event at a time.

use std::sync::mpsc::Sender;
use std::time::{Duration, SystemTime};

use crate::types::{
    ballot::Ballot,
    data_types::{NodeID, PaxosID, Slot, Version},
    pvalue::PValue,
    replica_group::ReplicaGroup,
    request::Request,
};

pub enum Event {
    // Events that change the set of paxos instances.
    CreateInstance(CreateInstanceEvent),
    StopInstance(StopInstanceEvent),
    RecoverInstance(RecoverInstanceEvent),
    // Agreement events.
    Propose(ProposeEvent),
    Accept(AcceptEvent),
    Decide(DecideEvent),
    Execute(ExecuteEvent),
    // Events that change persistent state.
    Checkpoint(CheckpointEvent),
    GarbageCollect(GarbageCollectEvent),
    // Coordinator election events.
    RunForCoordinator(RunForCoordinatorEvent),
    BecomeActive(BecomeActiveEvent),
    Preempted(PreemptedEvent),
    // Catch-up events.
    StartSync(StartSyncEvent),
    ReceiveSyncRequest(ReceiveSyncRequestEvent),
    RestoreCheckpoint(RestoreCheckpointEvent),
    // Group discovery and failure events.
    FindReplicaGroup(FindReplicaGroupEvent),
    RequestFailed(RequestFailedEvent),
}

impl Event {
    pub(crate) fn publish(event_publisher: &Option<Sender<Event>>, event: Event) {
        if let Some(event_publisher) = event_publisher {
            // The event bus only goes away during shutdown.
            let _ = event_publisher.send(event);
        }
    }
}

/// A paxos instance was created by this replica, or replaced an older version of itself.
pub struct CreateInstanceEvent {
    pub timestamp: SystemTime,
    pub paxos_id: PaxosID,
    pub version: Version,
    pub group: ReplicaGroup,
}

/// A paxos instance executed a stop request and became a tombstone.
pub struct StopInstanceEvent {
    pub timestamp: SystemTime,
    pub paxos_id: PaxosID,
    pub version: Version,
    pub slot: Slot,
}

/// A paxos instance was restarted from the persistent log.
pub struct RecoverInstanceEvent {
    pub timestamp: SystemTime,
    pub paxos_id: PaxosID,
    pub version: Version,
    pub ballot: Ballot,
    pub next_slot: Slot,
}

/// The coordinator sent out an accept for `pvalue`.
pub struct ProposeEvent {
    pub timestamp: SystemTime,
    pub paxos_id: PaxosID,
    pub pvalue: PValue,
}

/// The acceptor accepted `pvalue`, sent by `origin`.
pub struct AcceptEvent {
    pub timestamp: SystemTime,
    pub paxos_id: PaxosID,
    pub origin: NodeID,
    pub pvalue: PValue,
}

/// The coordinator heard from a majority of acceptors for `pvalue`.
pub struct DecideEvent {
    pub timestamp: SystemTime,
    pub paxos_id: PaxosID,
    pub pvalue: PValue,
}

/// The app executed `request`, decided at `slot` on its own or batched with others. Every request of
/// a batch gets its own event.
pub struct ExecuteEvent {
    pub timestamp: SystemTime,
    pub paxos_id: PaxosID,
    pub slot: Slot,
    pub request: Request,
}

pub struct CheckpointEvent {
    pub timestamp: SystemTime,
    pub paxos_id: PaxosID,
    pub slot: Slot,
}

/// The acceptor discarded everything it accepted at or below `gc_slot`.
pub struct GarbageCollectEvent {
    pub timestamp: SystemTime,
    pub paxos_id: PaxosID,
    pub gc_slot: Slot,
}

pub struct RunForCoordinatorEvent {
    pub timestamp: SystemTime,
    pub paxos_id: PaxosID,
    pub ballot: Ballot,
}

/// A majority promised `ballot`. `proposals` is the number of accepts sent out as a result.
pub struct BecomeActiveEvent {
    pub timestamp: SystemTime,
    pub paxos_id: PaxosID,
    pub ballot: Ballot,
    pub proposals: usize,
}

/// The coordinator of `ballot` resigned because someone holds `preempting_ballot`.
pub struct PreemptedEvent {
    pub timestamp: SystemTime,
    pub paxos_id: PaxosID,
    pub ballot: Ballot,
    pub preempting_ballot: Ballot,
}

pub struct StartSyncEvent {
    pub timestamp: SystemTime,
    pub paxos_id: PaxosID,
    pub peer: NodeID,
    pub missing_slots: Vec<Slot>,
    pub missing_too_much: bool,
}

pub struct ReceiveSyncRequestEvent {
    pub timestamp: SystemTime,
    pub paxos_id: PaxosID,
    pub peer: NodeID,
    pub missing_slots: usize,
}

/// A checkpoint received from a peer was installed.
pub struct RestoreCheckpointEvent {
    pub timestamp: SystemTime,
    pub paxos_id: PaxosID,
    pub slot: Slot,
}

/// This replica asked `peers` for the replica group of a paxos instance it does not know about.
pub struct FindReplicaGroupEvent {
    pub timestamp: SystemTime,
    pub paxos_id: PaxosID,
    pub peers: Vec<NodeID>,
    pub attempt: u32,
}

/// A request proposed at this replica will not be executed through it.
pub struct RequestFailedEvent {
    pub timestamp: SystemTime,
    pub paxos_id: PaxosID,
    pub request: Request,
    pub reason: RequestFailure,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RequestFailure {
    /// The instance's replica group could not be found.
    ReplicaGroupUnknown,
    /// The request was not executed after being forwarded the maximum number of times.
    RetriesExhausted {
        retries: u32,
        request_timeout: Duration,
    },
    /// The instance stopped before the request was executed.
    InstanceStopped,
}
