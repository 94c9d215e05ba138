/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Proposals bound to a slot under a ballot.

use std::fmt::{self, Debug, Formatter};

use borsh::{BorshDeserialize, BorshSerialize};

use super::{ballot::Ballot, data_types::Slot, request::Request};

/// A `(slot, ballot, request)` triple.
///
/// A `PValue` is what coordinators propose and acceptors accept. It becomes a decision once a majority
/// of the replica group has accepted it, or once a replica is told by someone that it has been decided.
#[derive(Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct PValue {
    pub slot: Slot,
    pub ballot: Ballot,
    pub request: Request,
}

impl PValue {
    pub fn new(slot: Slot, ballot: Ballot, request: Request) -> PValue {
        PValue {
            slot,
            ballot,
            request,
        }
    }

    /// Create a pvalue that fills `slot` with a [no-op](Request::no_op).
    pub fn no_op(slot: Slot, ballot: Ballot) -> PValue {
        PValue::new(slot, ballot, Request::no_op())
    }

    pub fn is_stop(&self) -> bool {
        self.request.is_stop()
    }

    /// Get a copy of this pvalue re-bound to `ballot`.
    pub(crate) fn with_ballot(&self, ballot: Ballot) -> PValue {
        PValue::new(self.slot, ballot, self.request.clone())
    }
}

impl Debug for PValue {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "<{}, {}, {:?}>", self.slot, self.ballot, self.request)
    }
}
