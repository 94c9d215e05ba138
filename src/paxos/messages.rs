/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Definitions for structured messages that are sent between replicas as part of the Paxos protocol.
//!
//! ## Envelope
//!
//! Every [`PaxosMessage`] wraps a single [`PaxosPacket`] in an [`Envelope`] that names the paxos
//! instance the packet is meant for: its [`PaxosID`] and [`Version`]. The envelope also carries a
//! `schema_version`, which lets replicas drop messages produced by an incompatible build instead of
//! misinterpreting them.
//!
//! ## Packets
//!
//! Packets fall into four groups:
//! 1. Leader election: [`Prepare`] and [`PrepareReply`].
//! 2. Agreement: [`RequestPacket`], [`Accept`], [`AcceptReply`], [`BatchedAcceptReply`], [`Decision`],
//!    and [`BatchedCommit`].
//! 3. Catch-up: [`SyncDecisions`] and [`StatePacket`].
//! 4. Group discovery: [`FindReplicaGroup`].

use std::collections::{BTreeMap, BTreeSet};

use borsh::{BorshDeserialize, BorshSerialize};

use crate::types::{
    ballot::Ballot,
    data_types::{Data, NodeID, PaxosID, RequestID, Slot, Version},
    pvalue::PValue,
    replica_group::ReplicaGroup,
    request::Request,
};

/// Schema version stamped on every outgoing [`PaxosMessage`].
pub const MESSAGE_SCHEMA_VERSION: u8 = 1;

/// Fields shared by every packet: which paxos instance it belongs to.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct Envelope {
    pub schema_version: u8,
    pub paxos_id: PaxosID,
    pub version: Version,
}

#[derive(Clone, Debug, BorshSerialize, BorshDeserialize)]
pub struct PaxosMessage {
    pub envelope: Envelope,
    pub packet: PaxosPacket,
}

impl PaxosMessage {
    pub fn new(paxos_id: PaxosID, version: Version, packet: impl Into<PaxosPacket>) -> PaxosMessage {
        PaxosMessage {
            envelope: Envelope {
                schema_version: MESSAGE_SCHEMA_VERSION,
                paxos_id,
                version,
            },
            packet: packet.into(),
        }
    }

    pub fn paxos_id(&self) -> &PaxosID {
        &self.envelope.paxos_id
    }

    pub fn version(&self) -> Version {
        self.envelope.version
    }

    /// Short, human readable description for log messages.
    pub fn summary(&self) -> String {
        format!(
            "{}:{}:{}",
            self.envelope.paxos_id,
            self.envelope.version,
            self.packet.name()
        )
    }
}

#[derive(Clone, Debug, BorshSerialize, BorshDeserialize)]
pub enum PaxosPacket {
    Request(RequestPacket),
    Prepare(Prepare),
    PrepareReply(PrepareReply),
    Accept(Accept),
    AcceptReply(AcceptReply),
    BatchedAcceptReply(BatchedAcceptReply),
    Decision(Decision),
    BatchedCommit(BatchedCommit),
    SyncDecisions(SyncDecisions),
    FindReplicaGroup(FindReplicaGroup),
    Checkpoint(StatePacket),
}

impl PaxosPacket {
    pub fn name(&self) -> &'static str {
        match self {
            PaxosPacket::Request(_) => "REQUEST",
            PaxosPacket::Prepare(_) => "PREPARE",
            PaxosPacket::PrepareReply(_) => "PREPARE_REPLY",
            PaxosPacket::Accept(_) => "ACCEPT",
            PaxosPacket::AcceptReply(_) => "ACCEPT_REPLY",
            PaxosPacket::BatchedAcceptReply(_) => "BATCHED_ACCEPT_REPLY",
            PaxosPacket::Decision(_) => "DECISION",
            PaxosPacket::BatchedCommit(_) => "BATCHED_COMMIT",
            PaxosPacket::SyncDecisions(_) => "SYNC_DECISIONS",
            PaxosPacket::FindReplicaGroup(_) => "FIND_REPLICA_GROUP",
            PaxosPacket::Checkpoint(_) => "CHECKPOINT_STATE",
        }
    }

    /// Get a node that is, according to the packet, a member of the packet's replica group.
    ///
    /// A replica that receives a packet for a paxos instance it does not know about asks this node
    /// for the instance's replica group.
    pub fn member_hint(&self) -> Option<NodeID> {
        match self {
            PaxosPacket::Request(RequestPacket { entry, .. }) => Some(*entry),
            PaxosPacket::Prepare(Prepare { ballot, .. }) => Some(ballot.coordinator),
            PaxosPacket::PrepareReply(PrepareReply { acceptor, .. }) => Some(*acceptor),
            PaxosPacket::Accept(Accept { sender, .. }) => Some(*sender),
            PaxosPacket::AcceptReply(AcceptReply { acceptor, .. }) => Some(*acceptor),
            PaxosPacket::BatchedAcceptReply(BatchedAcceptReply { acceptor, .. }) => Some(*acceptor),
            PaxosPacket::Decision(Decision { pvalue, .. }) => Some(pvalue.ballot.coordinator),
            PaxosPacket::BatchedCommit(BatchedCommit { ballot, .. }) => Some(ballot.coordinator),
            PaxosPacket::SyncDecisions(SyncDecisions { node_id, .. }) => Some(*node_id),
            PaxosPacket::FindReplicaGroup(FindReplicaGroup { node_id, .. }) => Some(*node_id),
            PaxosPacket::Checkpoint(StatePacket { ballot, .. }) => Some(ballot.coordinator),
        }
    }
}

/// A client request travelling from the replica it entered at (`entry`) to the coordinator.
#[derive(Clone, Debug, BorshSerialize, BorshDeserialize)]
pub struct RequestPacket {
    pub entry: NodeID,
    pub request: Request,
}

/// Phase 1a: a would-be coordinator asks acceptors to promise not to accept lower ballots.
#[derive(Clone, Debug, BorshSerialize, BorshDeserialize)]
pub struct Prepare {
    pub ballot: Ballot,
    /// Acceptors only report accepted values at or above this slot.
    pub first_undecided_slot: Slot,
    pub recovery: bool,
}

/// Phase 1b: an acceptor's promise, or, if `ballot` is higher than the prepared ballot, its refusal.
#[derive(Clone, Debug, BorshSerialize, BorshDeserialize)]
pub struct PrepareReply {
    pub acceptor: NodeID,
    pub ballot: Ballot,
    /// Empty if the acceptor is refusing.
    pub accepted: BTreeMap<Slot, PValue>,
    /// The first slot the acceptor might still hold an accepted value for.
    pub first_slot: Slot,
}

/// Phase 2a: the coordinator asks acceptors to accept `pvalue`.
#[derive(Clone, Debug, BorshSerialize, BorshDeserialize)]
pub struct Accept {
    pub sender: NodeID,
    pub pvalue: PValue,
    pub median_checkpointed_slot: Option<Slot>,
}

/// Phase 2b: an acceptor's vote, or, if `ballot` is higher than the accept's, its refusal.
#[derive(Clone, Debug, BorshSerialize, BorshDeserialize)]
pub struct AcceptReply {
    pub acceptor: NodeID,
    pub ballot: Ballot,
    pub slot: Slot,
    pub max_checkpointed_slot: Option<Slot>,
    pub request_id: RequestID,
}

/// Several [`AcceptReply`]s from the same acceptor for the same ballot.
#[derive(Clone, Debug, BorshSerialize, BorshDeserialize)]
pub struct BatchedAcceptReply {
    pub acceptor: NodeID,
    pub ballot: Ballot,
    pub max_checkpointed_slot: Option<Slot>,
    /// The accepted slots, each with the ID of the request accepted in it.
    pub slots: BTreeMap<Slot, RequestID>,
}

impl BatchedAcceptReply {
    /// Expand this batch into the individual replies it stands for.
    pub fn expand(&self) -> Vec<AcceptReply> {
        self.slots
            .iter()
            .map(|(slot, request_id)| AcceptReply {
                acceptor: self.acceptor,
                ballot: self.ballot,
                slot: *slot,
                max_checkpointed_slot: self.max_checkpointed_slot,
                request_id: *request_id,
            })
            .collect()
    }
}

/// A committed pvalue.
#[derive(Clone, Debug, BorshSerialize, BorshDeserialize)]
pub struct Decision {
    pub pvalue: PValue,
    pub median_checkpointed_slot: Option<Slot>,
    /// Set on decisions re-sent in response to a [`SyncDecisions`] request.
    pub recovery: bool,
}

/// Commit notices for several slots decided in the same ballot. Carries no requests: receivers
/// reconstruct decisions from the values they accepted in that ballot.
#[derive(Clone, Debug, BorshSerialize, BorshDeserialize)]
pub struct BatchedCommit {
    pub ballot: Ballot,
    pub median_checkpointed_slot: Option<Slot>,
    pub slots: BTreeSet<Slot>,
    pub group: ReplicaGroup,
}

/// A lagging replica's request for the decisions it is missing.
#[derive(Clone, Debug, BorshSerialize, BorshDeserialize)]
pub struct SyncDecisions {
    pub node_id: NodeID,
    pub max_decision_slot: Option<Slot>,
    pub missing_slots: Vec<Slot>,
    /// Set when the requester is so far behind that a checkpoint transfer is preferable.
    pub missing_too_much: bool,
}

/// A question (`group` is `None`) or an answer (`group` is `Some`) about an instance's members.
///
/// `node_id` is always the node that asked.
#[derive(Clone, Debug, BorshSerialize, BorshDeserialize)]
pub struct FindReplicaGroup {
    pub node_id: NodeID,
    pub group: Option<ReplicaGroup>,
}

/// A checkpoint in transit.
#[derive(Clone, Debug, BorshSerialize, BorshDeserialize)]
pub struct StatePacket {
    pub ballot: Ballot,
    pub slot: Slot,
    pub state: Data,
    pub is_large_checkpoint: bool,
    /// Whether the checkpoint was taken right after executing a stop. Installing it stops the
    /// instance.
    pub stopped: bool,
}

macro_rules! impl_into_paxos_packet {
    ($($packet:ident => $variant:ident),* $(,)?) => {
        $(
            impl From<$packet> for PaxosPacket {
                fn from(value: $packet) -> Self {
                    PaxosPacket::$variant(value)
                }
            }
        )*
    };
}

impl_into_paxos_packet!(
    RequestPacket => Request,
    Prepare => Prepare,
    PrepareReply => PrepareReply,
    Accept => Accept,
    AcceptReply => AcceptReply,
    BatchedAcceptReply => BatchedAcceptReply,
    Decision => Decision,
    BatchedCommit => BatchedCommit,
    SyncDecisions => SyncDecisions,
    FindReplicaGroup => FindReplicaGroup,
    StatePacket => Checkpoint,
);
