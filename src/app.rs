/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The [`App`] trait, the replicated state machine whose requests paxos instances agree on.

use crate::types::{
    data_types::{Data, PaxosID, Slot, Version},
    replica_group::ReplicaGroup,
    request::Request,
};

/// Methods that a type needs to implement to serve as the replicated state machine of a replica.
///
/// One app serves every paxos instance of a replica. Calls for different instances may be made from
/// different worker threads, but never concurrently: the replica serializes them.
///
/// Besides implementing the functions specified in the trait, implementors of App are additionally
/// expected to be *deterministic*: executing the same requests in the same order must lead every replica
/// to the same state.
///
/// The app is treated as durable. After a crash, a replica resumes execution right after the last slot
/// it logged as executed, so the request of the slot that was being executed when the crash happened
/// may be delivered again.
pub trait App: Send + 'static {
    /// Called once the request decided at `slot` of the instance `paxos_id` can be executed. Requests
    /// batched into a single slot are passed one at a time, in order. Stop requests are passed too.
    ///
    /// # Return value
    /// Whether the request was executed. If `false`, the replica retries the same slot later and
    /// executes nothing after it in the meantime.
    fn execute(&mut self, paxos_id: &PaxosID, slot: Slot, request: &Request) -> bool;

    /// Take a snapshot of the state of the instance `paxos_id`, covering every request executed so
    /// far.
    fn checkpoint(&mut self, paxos_id: &PaxosID) -> Data;

    /// Replace the state of the instance `paxos_id` with a snapshot taken by
    /// [`checkpoint`](Self::checkpoint), possibly on another replica. `None` resets the state to that of
    /// a freshly created instance.
    ///
    /// # Return value
    /// Whether the state was restored.
    fn restore(&mut self, paxos_id: &PaxosID, state: Option<&Data>) -> bool;

    /// Called when this replica has to propose to an instance it does not know. An app that can
    /// name the instance's current version and replica group lets the replica create the instance
    /// without asking its peers.
    fn resolve_replica_group(&mut self, _paxos_id: &PaxosID) -> Option<(Version, ReplicaGroup)> {
        None
    }
}
