/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

use borsh::{BorshDeserialize, BorshSerialize};

use super::{
    data_types::{PaxosID, Version},
    pvalue::PValue,
    replica_group::ReplicaGroup,
};

/// What remains of a paxos instance after it executed a stop request.
///
/// Tombstones let a replica refuse to resurrect a stopped instance from late packets, and let the layer
/// above learn how the instance ended.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct Tombstone {
    pub paxos_id: PaxosID,
    pub version: Version,
    pub group: ReplicaGroup,
    /// The executed stop, if it is known. It is unknown if the instance was stopped by installing a
    /// checkpoint taken right after the stop.
    pub stop: Option<PValue>,
}
