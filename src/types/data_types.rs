/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Types that exist only to identify things or count things, and do not have any major "active"
//! behavior.

use std::{
    fmt::{self, Debug, Display, Formatter},
    hash::Hash,
    ops::{Add, AddAssign, Sub},
};

use borsh::{BorshDeserialize, BorshSerialize};

/// Number that uniquely identifies a node (a process running a [`Replica`](crate::replica::Replica)).
#[derive(
    Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, BorshDeserialize, BorshSerialize,
)]
pub struct NodeID(u32);

impl NodeID {
    /// Create a new `NodeID` with an `int` value.
    pub const fn new(int: u32) -> Self {
        Self(int)
    }

    /// Get the `u32` value of this `NodeID`.
    pub const fn int(&self) -> u32 {
        self.0
    }
}

impl Display for NodeID {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

impl Debug for NodeID {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

/// Name of a paxos instance.
///
/// A paxos instance is one replicated state machine agreeing on one totally ordered decision log.
/// A single replica typically hosts many of them, each replicated on its own
/// [replica group](super::replica_group::ReplicaGroup).
///
/// # Allowed characters
///
/// Paxos IDs appear verbatim in the [persistent log](crate::logger), whose records are tab
/// separated lines. Therefore a valid `PaxosID` is non-empty and contains neither `'\t'` nor
/// `'\n'`. Use [`is_valid`](Self::is_valid) to check.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, BorshDeserialize, BorshSerialize)]
pub struct PaxosID(String);

impl PaxosID {
    /// Create a new `PaxosID` from anything that can become a `String`.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the inner `str` of this `PaxosID`.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Check whether this `PaxosID` can be written into the persistent log.
    pub fn is_valid(&self) -> bool {
        !self.0.is_empty() && !self.0.contains(|c| c == '\t' || c == '\n' || c == '\r')
    }
}

impl Display for PaxosID {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Debug for PaxosID {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Debug::fmt(&self.0, f)
    }
}

impl From<&str> for PaxosID {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Membership epoch of a paxos instance.
///
/// The version of a paxos instance increases every time its replica group is reconfigured. Messages
/// carrying a version different from the version of the local instance are not processed by it.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, BorshDeserialize, BorshSerialize,
)]
pub struct Version(u32);

impl Version {
    /// Create a new `Version` with an `int` value.
    pub const fn new(int: u32) -> Self {
        Self(int)
    }

    /// Get the `u32` value of this `Version`.
    pub const fn int(&self) -> u32 {
        self.0
    }
}

impl Display for Version {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

/// Position of a request in the decision log of a paxos instance.
///
/// Slots start at 0 and increase by 1 for every decision. Executed slots never have gaps.
#[derive(
    Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, BorshDeserialize, BorshSerialize,
)]
pub struct Slot(u64);

impl Slot {
    /// Create a new `Slot` with an `int` value.
    pub const fn new(int: u64) -> Self {
        Self(int)
    }

    /// Get the first slot of every decision log, which is 0.
    pub const fn init() -> Self {
        Self(0)
    }

    /// Get the `u64` value of this `Slot`.
    pub const fn int(&self) -> u64 {
        self.0
    }

    /// Get the slot directly before this one, or `None` if this is the first slot.
    pub fn prev(&self) -> Option<Slot> {
        self.0.checked_sub(1).map(Slot)
    }

    /// Get the slot directly after this one.
    pub fn next(&self) -> Slot {
        Slot(self.0 + 1)
    }
}

impl Display for Slot {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

impl Debug for Slot {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

impl Add<u64> for Slot {
    type Output = Slot;

    fn add(self, rhs: u64) -> Self::Output {
        Slot(self.0.add(rhs))
    }
}

impl AddAssign<u64> for Slot {
    fn add_assign(&mut self, rhs: u64) {
        self.0.add_assign(rhs)
    }
}

impl Sub<Slot> for Slot {
    type Output = u64;

    /// Saturating distance between two slots.
    fn sub(self, rhs: Slot) -> Self::Output {
        self.0.saturating_sub(rhs.0)
    }
}

/// Number that uniquely identifies a [request](super::request::Request) issued by one client.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, BorshDeserialize, BorshSerialize,
)]
pub struct RequestID(u64);

impl RequestID {
    /// Create a new `RequestID` with an `int` value.
    pub const fn new(int: u64) -> Self {
        Self(int)
    }

    /// Get the `u64` value of this `RequestID`.
    pub const fn int(&self) -> u64 {
        self.0
    }
}

impl Display for RequestID {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

/// Number that identifies the client that issued a [request](super::request::Request).
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, BorshDeserialize, BorshSerialize,
)]
pub struct ClientID(u64);

impl ClientID {
    /// Create a new `ClientID` with an `int` value.
    pub const fn new(int: u64) -> Self {
        Self(int)
    }

    /// Get the `u64` value of this `ClientID`.
    pub const fn int(&self) -> u64 {
        self.0
    }
}

/// Opaque, application-defined bytes.
///
/// Used both for the payload of a [request](super::request::Request) and for the state captured in a
/// [checkpoint](super::checkpoint::Checkpoint).
#[derive(Clone, PartialEq, Eq, Hash, Default, BorshDeserialize, BorshSerialize)]
pub struct Data(Vec<u8>);

impl Data {
    /// Create a new `Data` wrapping `bytes`.
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    /// Get a reference to the inner bytes.
    pub fn bytes(&self) -> &[u8] {
        &self.0
    }

    /// Take the inner bytes.
    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Debug for Data {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "Data({} bytes)", self.0.len())
    }
}

impl From<Vec<u8>> for Data {
    fn from(value: Vec<u8>) -> Self {
        Self(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paxos_id_validity() {
        assert!(PaxosID::new("name-service/alice").is_valid());
        assert!(!PaxosID::new("").is_valid());
        assert!(!PaxosID::new("two\twords").is_valid());
        assert!(!PaxosID::new("two\nlines").is_valid());
    }

    #[test]
    fn slot_arithmetic() {
        assert_eq!(Slot::init().prev(), None);
        assert_eq!(Slot::new(5).prev(), Some(Slot::new(4)));
        assert_eq!(Slot::new(5) + 3, Slot::new(8));
        assert_eq!(Slot::new(8) - Slot::new(5), 3);
        assert_eq!(Slot::new(5) - Slot::new(8), 0);
    }
}
