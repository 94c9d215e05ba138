/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The keep-alive message of the failure detector.

use borsh::{BorshDeserialize, BorshSerialize};

use crate::types::data_types::NodeID;

/// A keep-alive sent by `sender` to `responder`.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct FailureDetect {
    pub sender: NodeID,
    pub responder: NodeID,
    /// Reserved. Always `true`.
    pub status: bool,
}

impl FailureDetect {
    pub fn new(sender: NodeID, responder: NodeID) -> FailureDetect {
        FailureDetect {
            sender,
            responder,
            status: true,
        }
    }
}
