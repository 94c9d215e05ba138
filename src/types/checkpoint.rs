/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Application snapshots taken after executing a slot.

use borsh::{BorshDeserialize, BorshSerialize};

use super::{
    ballot::Ballot,
    data_types::{Data, PaxosID, Slot, Version},
    replica_group::ReplicaGroup,
};

/// Checkpoints whose state is larger than this many bytes are flagged as
/// [large](Checkpoint::is_large).
pub const LARGE_CHECKPOINT_BYTES: usize = 1 << 20;

/// An application-opaque snapshot of a paxos instance's state, taken right after `slot` was executed.
///
/// Checkpoints are used for two things:
/// 1. Garbage collection: decisions and accepted values at or below a checkpointed slot are never
///    needed again by the replica that took the checkpoint.
/// 2. State transfer: a replica that is missing too many decisions can be brought up to date by
///    restoring a peer's checkpoint.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct Checkpoint {
    pub paxos_id: PaxosID,
    pub version: Version,
    pub group: ReplicaGroup,
    pub slot: Slot,
    pub ballot: Ballot,
    pub state: Data,
    pub gc_slot: Option<Slot>,
}

impl Checkpoint {
    /// Whether this checkpoint's state is large enough to be worth avoiding unnecessary transfers of.
    pub fn is_large(&self) -> bool {
        self.state.len() > LARGE_CHECKPOINT_BYTES
    }
}
