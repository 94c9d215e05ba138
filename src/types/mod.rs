//! Types that are used across multiple components of the engine.
//!
//! Types specific to a single component, e.g., the packets of the Paxos protocol, can be found in the
//! submodules of that component, e.g., [`crate::paxos::messages`].

pub mod data_types;

pub mod ballot;

pub mod request;

pub mod pvalue;

pub mod replica_group;

pub mod checkpoint;

pub mod tombstone;
