/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Ballots, the "leadership epochs" of a paxos instance.

use std::fmt::{self, Debug, Display, Formatter};

use borsh::{BorshDeserialize, BorshSerialize};

use super::data_types::NodeID;

/// A `(number, coordinator)` pair that totally orders competing attempts at coordinating a paxos
/// instance.
///
/// Ballots are compared by `number` first, with ties broken by `coordinator`. The field order of this
/// struct makes the derived [`Ord`] implementation do exactly this.
#[derive(
    Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, BorshSerialize, BorshDeserialize,
)]
pub struct Ballot {
    pub number: u32,
    pub coordinator: NodeID,
}

impl Ballot {
    pub const fn new(number: u32, coordinator: NodeID) -> Self {
        Self {
            number,
            coordinator,
        }
    }

    /// Get the ballot that `me` runs with to take over from the coordinator of this ballot.
    pub fn successor(&self, me: NodeID) -> Ballot {
        Ballot::new(self.number.saturating_add(1), me)
    }
}

impl Display for Ballot {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.number, self.coordinator)
    }
}

impl Debug for Ballot {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(self, f)
    }
}
