/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The set of nodes that replicate a paxos instance.

use std::collections::BTreeSet;

use borsh::{BorshDeserialize, BorshSerialize};

use super::data_types::{NodeID, PaxosID};

/// The members of one version of a paxos instance.
///
/// Members are kept sorted, so that every member agrees on the [index](Self::index_of) of every other
/// member, and therefore on the [round robin coordinator](Self::round_robin_coordinator) of every
/// ballot number.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct ReplicaGroup(BTreeSet<NodeID>);

impl ReplicaGroup {
    pub fn new(members: impl IntoIterator<Item = NodeID>) -> ReplicaGroup {
        ReplicaGroup(members.into_iter().collect())
    }

    pub fn contains(&self, node: &NodeID) -> bool {
        self.0.contains(node)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate through the members in ascending order.
    pub fn members(&self) -> impl Iterator<Item = &NodeID> {
        self.0.iter()
    }

    /// Get the members other than `me`.
    pub fn others(&self, me: NodeID) -> Vec<NodeID> {
        self.0.iter().copied().filter(|node| *node != me).collect()
    }

    /// Get the position of `node` in the sorted member list.
    pub fn index_of(&self, node: &NodeID) -> Option<usize> {
        self.0.iter().position(|member| member == node)
    }

    /// Get the number of members that forms a majority of this group.
    pub fn majority(&self) -> usize {
        self.0.len() / 2 + 1
    }

    /// Get the member expected to coordinate ballots numbered `ballot_number` in the paxos instance
    /// called `paxos_id`.
    ///
    /// Coordinators rotate through the sorted member list as ballot numbers grow, starting from an
    /// offset derived from `paxos_id` so that different instances start with different coordinators.
    pub fn round_robin_coordinator(&self, paxos_id: &PaxosID, ballot_number: u32) -> Option<NodeID> {
        if self.0.is_empty() {
            return None;
        }
        let offset = stable_hash(paxos_id.as_str());
        let index = (offset.wrapping_add(ballot_number as u64) % self.0.len() as u64) as usize;
        self.0.iter().nth(index).copied()
    }
}

/// A string hash that is identical on every node, on every platform, and across builds.
fn stable_hash(string: &str) -> u64 {
    string
        .bytes()
        .fold(0u64, |hash, byte| hash.wrapping_mul(31).wrapping_add(byte as u64))
}
