/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The records of the persistent log and their line encoding.
//!
//! Every record occupies exactly one line:
//!
//! ```text
//! <paxos ID> \t <record type> \t <base64(borsh((version, payload)))>
//! ```
//!
//! The payload is Base64-encoded so that it can never contain a tab or a newline, and the paxos ID is
//! [checked](crate::types::data_types::PaxosID::is_valid) to contain neither.

use std::fmt::{self, Display, Formatter};
use std::io;

use base64::{engine::general_purpose::STANDARD_NO_PAD, Engine as _};
use borsh::{BorshDeserialize, BorshSerialize};

use crate::types::{
    ballot::Ballot,
    data_types::{PaxosID, Slot, Version},
    pvalue::PValue,
    replica_group::ReplicaGroup,
};

pub(crate) const PAXOS_START: &str = "PAXOSSTART";
pub(crate) const PAXOS_STOP: &str = "PAXOSSTOP";
pub(crate) const BALLOT: &str = "BALLOT";
pub(crate) const SLOT_NUMBER: &str = "SLOTNUMBER";
pub(crate) const DECISION: &str = "DECISION";
pub(crate) const PVALUE: &str = "PVALUE";
pub(crate) const GARBAGE_SLOT: &str = "GARBAGESLOT";

/// A record of the membership file, which tracks the paxos instances that exist.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub(crate) enum MembershipRecord {
    Start {
        group: ReplicaGroup,
    },
    /// Written once a stop request has been executed. `stop` is the executed stop, if known.
    Stop {
        group: ReplicaGroup,
        stop: Option<PValue>,
    },
}

/// A record of a numbered log file.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum LogRecord {
    /// The acceptor promised, or accepted in, a ballot.
    Ballot(Ballot),
    /// The last executed slot.
    SlotNumber(Slot),
    Decision(PValue),
    /// The acceptor accepted a pvalue.
    PValue(PValue),
    /// The acceptor's garbage collection slot advanced.
    GarbageSlot(Slot),
}

impl LogRecord {
    pub(crate) fn name(&self) -> &'static str {
        match self {
            LogRecord::Ballot(_) => BALLOT,
            LogRecord::SlotNumber(_) => SLOT_NUMBER,
            LogRecord::Decision(_) => DECISION,
            LogRecord::PValue(_) => PVALUE,
            LogRecord::GarbageSlot(_) => GARBAGE_SLOT,
        }
    }

    /// Get the slot this record is about, if any. Garbage slot records do not count: they never need to
    /// be replayed once a later checkpoint exists.
    pub(crate) fn slot(&self) -> Option<Slot> {
        match self {
            LogRecord::SlotNumber(slot) => Some(*slot),
            LogRecord::Decision(pvalue) | LogRecord::PValue(pvalue) => Some(pvalue.slot),
            LogRecord::Ballot(_) | LogRecord::GarbageSlot(_) => None,
        }
    }

    /// Same bytes as `(version, record)` serialized as a tuple.
    fn payload(&self, version: Version) -> io::Result<Vec<u8>> {
        let mut bytes = version.try_to_vec()?;
        match self {
            LogRecord::Ballot(ballot) => ballot.serialize(&mut bytes)?,
            LogRecord::SlotNumber(slot) | LogRecord::GarbageSlot(slot) => slot.serialize(&mut bytes)?,
            LogRecord::Decision(pvalue) | LogRecord::PValue(pvalue) => pvalue.serialize(&mut bytes)?,
        }
        Ok(bytes)
    }
}

/// Reasons a line of the persistent log could not be decoded.
#[derive(Debug)]
pub(crate) enum LineDecodeError {
    MissingField,
    UnknownRecordType(String),
    Base64(base64::DecodeError),
    Borsh(io::Error),
}

impl Display for LineDecodeError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            LineDecodeError::MissingField => write!(f, "line has fewer than three fields"),
            LineDecodeError::UnknownRecordType(name) => write!(f, "unknown record type {}", name),
            LineDecodeError::Base64(err) => write!(f, "payload is not base64: {}", err),
            LineDecodeError::Borsh(err) => write!(f, "payload does not decode: {}", err),
        }
    }
}

impl From<base64::DecodeError> for LineDecodeError {
    fn from(value: base64::DecodeError) -> Self {
        LineDecodeError::Base64(value)
    }
}

impl From<io::Error> for LineDecodeError {
    fn from(value: io::Error) -> Self {
        LineDecodeError::Borsh(value)
    }
}

pub(crate) fn encode_log_line(paxos_id: &PaxosID, version: Version, record: &LogRecord) -> io::Result<String> {
    Ok(format!(
        "{}\t{}\t{}\n",
        paxos_id,
        record.name(),
        STANDARD_NO_PAD.encode(record.payload(version)?)
    ))
}

pub(crate) fn encode_membership_line(
    paxos_id: &PaxosID,
    version: Version,
    record: &MembershipRecord,
) -> io::Result<String> {
    let name = match record {
        MembershipRecord::Start { .. } => PAXOS_START,
        MembershipRecord::Stop { .. } => PAXOS_STOP,
    };
    let mut payload = version.try_to_vec()?;
    record.serialize(&mut payload)?;
    Ok(format!("{}\t{}\t{}\n", paxos_id, name, STANDARD_NO_PAD.encode(payload)))
}

fn split_line(line: &str) -> Result<(PaxosID, &str, Vec<u8>), LineDecodeError> {
    let mut fields = line.trim_end_matches(['\n', '\r']).splitn(3, '\t');
    let (Some(paxos_id), Some(name), Some(payload)) = (fields.next(), fields.next(), fields.next())
    else {
        return Err(LineDecodeError::MissingField);
    };
    if paxos_id.is_empty() {
        return Err(LineDecodeError::MissingField);
    }
    Ok((PaxosID::new(paxos_id), name, STANDARD_NO_PAD.decode(payload)?))
}

pub(crate) fn decode_log_line(line: &str) -> Result<(PaxosID, Version, LogRecord), LineDecodeError> {
    let (paxos_id, name, payload) = split_line(line)?;
    let (version, record) = match name {
        BALLOT => {
            let (version, ballot) = <(Version, Ballot)>::try_from_slice(&payload)?;
            (version, LogRecord::Ballot(ballot))
        }
        SLOT_NUMBER => {
            let (version, slot) = <(Version, Slot)>::try_from_slice(&payload)?;
            (version, LogRecord::SlotNumber(slot))
        }
        GARBAGE_SLOT => {
            let (version, slot) = <(Version, Slot)>::try_from_slice(&payload)?;
            (version, LogRecord::GarbageSlot(slot))
        }
        DECISION => {
            let (version, pvalue) = <(Version, PValue)>::try_from_slice(&payload)?;
            (version, LogRecord::Decision(pvalue))
        }
        PVALUE => {
            let (version, pvalue) = <(Version, PValue)>::try_from_slice(&payload)?;
            (version, LogRecord::PValue(pvalue))
        }
        other => return Err(LineDecodeError::UnknownRecordType(other.to_string())),
    };
    Ok((paxos_id, version, record))
}

pub(crate) fn decode_membership_line(
    line: &str,
) -> Result<(PaxosID, Version, MembershipRecord), LineDecodeError> {
    let (paxos_id, name, payload) = split_line(line)?;
    if name != PAXOS_START && name != PAXOS_STOP {
        return Err(LineDecodeError::UnknownRecordType(name.to_string()));
    }
    let (version, record) = <(Version, MembershipRecord)>::try_from_slice(&payload)?;
    Ok((paxos_id, version, record))
}
