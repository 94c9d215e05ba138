/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Exhaustive enumeration of every message a replica sends.

use borsh::{BorshDeserialize, BorshSerialize};

use crate::{failure_detection::messages::FailureDetect, paxos::messages::PaxosMessage};

/// All message variants used between replicas.
#[derive(Clone, Debug, BorshSerialize, BorshDeserialize)]
pub enum Message {
    /// See: [`PaxosMessage`].
    Paxos(PaxosMessage),

    /// See: [`FailureDetect`].
    FailureDetect(FailureDetect),
}

impl From<PaxosMessage> for Message {
    fn from(value: PaxosMessage) -> Self {
        Message::Paxos(value)
    }
}

impl From<FailureDetect> for Message {
    fn from(value: FailureDetect) -> Self {
        Message::FailureDetect(value)
    }
}
