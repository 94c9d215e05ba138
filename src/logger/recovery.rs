/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Reconstruction of every paxos instance's state from the files of the persistent log.
//!
//! Recovery reads, but never writes: the state it reconstructs is a function of the files alone, so
//! recovering twice from the same directory gives the same result. The [logger](super::PaxosLogger)
//! does its housekeeping (compacting the membership file, deleting superseded checkpoints) only after
//! recovery has finished.
//!
//! ## Order of replay
//!
//! 1. The membership file decides which instances exist, and at which version. A later
//!    `PAXOSSTART` with a higher version replaces an earlier one. A `PAXOSSTOP` turns an instance at
//!    the same or a lower version into a [`Tombstone`].
//! 2. The latest checkpoint of every live instance is loaded.
//! 3. The numbered log files are replayed in increasing order. Records of unknown instances or of
//!    other versions are skipped, and so are lines that do not decode.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use borsh::BorshDeserialize;

use crate::types::{
    ballot::Ballot,
    checkpoint::Checkpoint,
    data_types::{PaxosID, Slot, Version},
    pvalue::PValue,
    replica_group::ReplicaGroup,
    tombstone::Tombstone,
};

use super::files::{self, CheckpointFileName};
use super::records::{self, LogRecord, MembershipRecord};
use super::PaxosLoggerError;

/// The state of one paxos instance as reconstructed from the log.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecoveredInstance {
    pub paxos_id: PaxosID,
    pub version: Version,
    pub group: ReplicaGroup,
    /// The highest ballot logged, `None` if the acceptor never logged one.
    pub ballot: Option<Ballot>,
    /// The last slot executed as logged. The checkpoint can be ahead of it if it was installed from
    /// another replica.
    pub last_executed: Option<Slot>,
    pub gc_slot: Option<Slot>,
    /// Accepted pvalues above the garbage collection slot, the highest ballot per slot.
    pub accepted: BTreeMap<Slot, PValue>,
    /// Decisions above both the last executed slot and the checkpoint, to be executed again.
    pub decisions: BTreeMap<Slot, PValue>,
    pub checkpoint: Option<Checkpoint>,
}

/// Everything recovered from a log directory.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Recovery {
    pub instances: BTreeMap<PaxosID, RecoveredInstance>,
    pub tombstones: BTreeMap<PaxosID, Tombstone>,
}

/// What a closed log file holds for one instance. Decides when the file can be deleted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct FileSummary {
    pub(crate) version: Version,
    pub(crate) max_slot: Option<Slot>,
    pub(crate) has_ballot: bool,
}

impl FileSummary {
    pub(crate) fn new(version: Version) -> FileSummary {
        FileSummary {
            version,
            max_slot: None,
            has_ballot: false,
        }
    }

    pub(crate) fn update(&mut self, record: &LogRecord) {
        if let LogRecord::Ballot(_) = record {
            self.has_ballot = true;
        }
        if let Some(slot) = record.slot() {
            self.max_slot = self.max_slot.max(Some(slot));
        }
    }
}

/// Bookkeeping the logger needs to continue where the recovered log left off.
#[derive(Default)]
pub(crate) struct RecoveredIndex {
    pub(crate) file_summaries: BTreeMap<u64, HashMap<PaxosID, FileSummary>>,
    pub(crate) last_ballot_file: HashMap<PaxosID, u64>,
    /// Every logged decision above the instance's checkpoint, executed or not.
    pub(crate) decisions: HashMap<PaxosID, BTreeMap<Slot, PValue>>,
    pub(crate) checkpoint_files: HashMap<PaxosID, (PathBuf, CheckpointFileName)>,
    /// Checkpoint files superseded by a later one of the same instance, or belonging to no instance.
    pub(crate) redundant_checkpoint_files: Vec<PathBuf>,
    pub(crate) log_files: Vec<u64>,
}

#[derive(Default)]
struct Replayed {
    ballot: Option<Ballot>,
    last_executed: Option<Slot>,
    gc_slot: Option<Slot>,
    accepted: BTreeMap<Slot, PValue>,
    decisions: BTreeMap<Slot, PValue>,
}

impl Replayed {
    fn apply(&mut self, record: LogRecord) {
        match record {
            LogRecord::Ballot(ballot) => self.ballot = self.ballot.max(Some(ballot)),
            LogRecord::SlotNumber(slot) => self.last_executed = self.last_executed.max(Some(slot)),
            LogRecord::GarbageSlot(slot) => self.gc_slot = self.gc_slot.max(Some(slot)),
            LogRecord::Decision(pvalue) => {
                self.decisions.insert(pvalue.slot, pvalue);
            }
            LogRecord::PValue(pvalue) => {
                let replace = match self.accepted.get(&pvalue.slot) {
                    Some(existing) => pvalue.ballot >= existing.ballot,
                    None => true,
                };
                if replace {
                    self.accepted.insert(pvalue.slot, pvalue);
                }
            }
        }
    }
}

/// Read the membership file: get the live instances (with their version and group) and the
/// tombstones.
pub(crate) fn read_membership(
    log_dir: &Path,
) -> Result<(BTreeMap<PaxosID, (Version, ReplicaGroup)>, BTreeMap<PaxosID, Tombstone>), PaxosLoggerError> {
    let mut live: BTreeMap<PaxosID, (Version, ReplicaGroup)> = BTreeMap::new();
    let mut tombstones: BTreeMap<PaxosID, Tombstone> = BTreeMap::new();

    for (number, line) in files::read_lines(&files::membership_file_path(log_dir))?
        .into_iter()
        .enumerate()
    {
        let decoded = line
            .map_err(|err| err.to_string())
            .and_then(|line| records::decode_membership_line(&line).map_err(|err| err.to_string()));
        let (paxos_id, version, record) = match decoded {
            Ok(decoded) => decoded,
            Err(err) => {
                log::warn!("Skipping line {} of {}: {}", number + 1, files::MEMBERSHIP_FILE, err);
                continue;
            }
        };

        match record {
            MembershipRecord::Start { group } => {
                let stopped = tombstones
                    .get(&paxos_id)
                    .map_or(false, |tombstone| tombstone.version >= version);
                let superseded = live
                    .get(&paxos_id)
                    .map_or(false, |(live_version, _)| *live_version > version);
                if !stopped && !superseded {
                    live.insert(paxos_id, (version, group));
                }
            }
            MembershipRecord::Stop { group, stop } => {
                if live
                    .get(&paxos_id)
                    .map_or(false, |(live_version, _)| *live_version <= version)
                {
                    live.remove(&paxos_id);
                }
                let newer = tombstones
                    .get(&paxos_id)
                    .map_or(true, |tombstone| tombstone.version <= version);
                if newer {
                    tombstones.insert(
                        paxos_id.clone(),
                        Tombstone {
                            paxos_id,
                            version,
                            group,
                            stop,
                        },
                    );
                }
            }
        }
    }

    Ok((live, tombstones))
}

/// Read the checkpoint file at `path`.
pub(crate) fn read_checkpoint(path: &Path) -> Result<Checkpoint, PaxosLoggerError> {
    let bytes = std::fs::read(path)?;
    Checkpoint::try_from_slice(&bytes).map_err(|_| PaxosLoggerError::CorruptCheckpoint(path.to_path_buf()))
}

/// Reconstruct every live instance from the files under `log_dir`.
pub(crate) fn recover(log_dir: &Path) -> Result<(Recovery, RecoveredIndex), PaxosLoggerError> {
    let (live, tombstones) = read_membership(log_dir)?;
    let mut index = RecoveredIndex::default();

    // 1. Latest checkpoint per live instance.
    let mut checkpoints: HashMap<PaxosID, Checkpoint> = HashMap::new();
    let mut candidates = files::list_checkpoint_files(log_dir)?;
    candidates.sort_by(|(_, a), (_, b)| (&a.paxos_id, a.version, a.slot).cmp(&(&b.paxos_id, b.version, b.slot)));
    // Newest first, so that the first readable checkpoint of an instance wins.
    for (path, name) in candidates.into_iter().rev() {
        let current_version = live.get(&name.paxos_id).map(|(version, _)| *version);
        if current_version != Some(name.version) || index.checkpoint_files.contains_key(&name.paxos_id) {
            index.redundant_checkpoint_files.push(path);
            continue;
        }
        match read_checkpoint(&path) {
            Ok(checkpoint) => {
                checkpoints.insert(name.paxos_id.clone(), checkpoint);
                index.checkpoint_files.insert(name.paxos_id.clone(), (path, name));
            }
            Err(err) => {
                log::warn!("Skipping checkpoint {}: {}", path.display(), err);
                index.redundant_checkpoint_files.push(path);
            }
        }
    }

    // 2. Replay log files.
    let mut replayed: HashMap<PaxosID, Replayed> = HashMap::new();
    index.log_files = files::list_log_files(log_dir)?;
    for number in &index.log_files {
        let path = files::log_file_path(log_dir, *number);
        let mut summaries: HashMap<PaxosID, FileSummary> = HashMap::new();

        for (line_number, line) in files::read_lines(&path)?.into_iter().enumerate() {
            let decoded = line
                .map_err(|err| err.to_string())
                .and_then(|line| records::decode_log_line(&line).map_err(|err| err.to_string()));
            let (paxos_id, version, record) = match decoded {
                Ok(decoded) => decoded,
                Err(err) => {
                    log::warn!("Skipping line {} of {}: {}", line_number + 1, path.display(), err);
                    continue;
                }
            };
            match live.get(&paxos_id) {
                Some((live_version, _)) if *live_version == version => {}
                _ => continue,
            }

            summaries
                .entry(paxos_id.clone())
                .or_insert_with(|| FileSummary::new(version))
                .update(&record);
            if let LogRecord::Ballot(_) = record {
                index.last_ballot_file.insert(paxos_id.clone(), *number);
            }
            replayed.entry(paxos_id).or_default().apply(record);
        }

        index.file_summaries.insert(*number, summaries);
    }

    // 3. Combine the checkpoint with the replayed records.
    let mut instances = BTreeMap::new();
    for (paxos_id, (version, group)) in live {
        let replayed = replayed.remove(&paxos_id).unwrap_or_default();
        let checkpoint = checkpoints.remove(&paxos_id);

        let checkpoint_slot = checkpoint.as_ref().map(|checkpoint| checkpoint.slot);
        let ballot = replayed
            .ballot
            .max(checkpoint.as_ref().map(|checkpoint| checkpoint.ballot));
        let last_executed = replayed.last_executed;
        let gc_slot = replayed
            .gc_slot
            .max(checkpoint.as_ref().and_then(|checkpoint| checkpoint.gc_slot));

        let accepted = match gc_slot {
            Some(gc_slot) => replayed.accepted.into_iter().filter(|(slot, _)| *slot > gc_slot).collect(),
            None => replayed.accepted,
        };
        let logged_decisions: BTreeMap<Slot, PValue> = match checkpoint_slot {
            Some(checkpoint_slot) => replayed
                .decisions
                .into_iter()
                .filter(|(slot, _)| *slot > checkpoint_slot)
                .collect(),
            None => replayed.decisions,
        };
        let decisions = match last_executed.max(checkpoint_slot) {
            Some(executed) => logged_decisions
                .iter()
                .filter(|(slot, _)| **slot > executed)
                .map(|(slot, pvalue)| (*slot, pvalue.clone()))
                .collect(),
            None => logged_decisions.clone(),
        };
        index.decisions.insert(paxos_id.clone(), logged_decisions);

        instances.insert(
            paxos_id.clone(),
            RecoveredInstance {
                paxos_id,
                version,
                group,
                ballot,
                last_executed,
                gc_slot,
                accepted,
                decisions,
                checkpoint,
            },
        );
    }

    Ok((
        Recovery {
            instances,
            tombstones,
        },
        index,
    ))
}
