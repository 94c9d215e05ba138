/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Persistent log of every paxos instance hosted by a replica.
//!
//! The log makes the acceptor's promises and votes survive crashes: an instance never replies to a
//! [`Prepare`](crate::paxos::messages::Prepare) or an [`Accept`](crate::paxos::messages::Accept) before
//! the state change the reply reveals has been written here. It also records decisions and executed
//! slots so that a restarted replica resumes execution where it stopped, and stores one checkpoint per
//! instance to bound how much has to be replayed.
//!
//! The file layout is described in [`files`], the line format in [`records`], and replay in
//! [`recovery`].
//!
//! ## Garbage collection of log files
//!
//! Records of many instances interleave in the same numbered log files. A closed log file is deleted
//! once none of its records can matter to recovery any more. That is, once for every instance with
//! records in it, either:
//! 1. The instance has been stopped or replaced by a newer version, or
//! 2. Every slot-bearing record in it is at or below the instance's checkpoint slot, and any ballot
//!    record in it has been superseded by a ballot record in a later file.

pub(crate) mod files;

pub(crate) mod records;

pub mod recovery;

use std::collections::{BTreeMap, HashMap};
use std::fmt::{self, Display, Formatter};
use std::io;
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};

use borsh::BorshSerialize;

use crate::types::{
    checkpoint::Checkpoint,
    data_types::{PaxosID, Slot, Version},
    pvalue::PValue,
    replica_group::ReplicaGroup,
};

use files::{AppendFile, CheckpointFileName};
use records::{LogRecord, MembershipRecord};
use recovery::{FileSummary, Recovery, RecoveredIndex};

#[derive(Debug)]
pub enum PaxosLoggerError {
    Io(io::Error),
    /// Paxos IDs written to the log must not contain tabs or line breaks.
    InvalidPaxosID(PaxosID),
    CorruptCheckpoint(PathBuf),
}

impl Display for PaxosLoggerError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            PaxosLoggerError::Io(err) => write!(f, "log I/O failed: {}", err),
            PaxosLoggerError::InvalidPaxosID(paxos_id) => write!(f, "invalid paxos ID {:?}", paxos_id),
            PaxosLoggerError::CorruptCheckpoint(path) => write!(f, "corrupt checkpoint {}", path.display()),
        }
    }
}

impl std::error::Error for PaxosLoggerError {}

impl From<io::Error> for PaxosLoggerError {
    fn from(value: io::Error) -> Self {
        PaxosLoggerError::Io(value)
    }
}

#[derive(Clone, Debug)]
pub(crate) struct LoggerConfiguration {
    pub(crate) log_dir: PathBuf,
    pub(crate) max_log_messages: u64,
    pub(crate) sync_log_writes: bool,
}

/// What the logger knows about one instance.
struct InstanceIndex {
    version: Version,
    group: ReplicaGroup,
    stopped: bool,
    checkpoint_file: Option<(PathBuf, CheckpointFileName)>,
    /// Logged decisions above the checkpoint slot.
    decisions: BTreeMap<Slot, PValue>,
}

impl InstanceIndex {
    fn checkpoint_slot(&self) -> Option<Slot> {
        self.checkpoint_file.as_ref().map(|(_, name)| name.slot)
    }
}

struct LoggerState {
    membership: AppendFile,
    current: AppendFile,
    current_number: u64,
    records_in_current: u64,
    file_summaries: BTreeMap<u64, HashMap<PaxosID, FileSummary>>,
    last_ballot_file: HashMap<PaxosID, u64>,
    instances: HashMap<PaxosID, InstanceIndex>,
}

/// The persistent log. Shared by every instance of a replica.
pub(crate) struct PaxosLogger {
    config: LoggerConfiguration,
    state: Mutex<LoggerState>,
}

impl PaxosLogger {
    /// Open the log under `config.log_dir`, creating the directory if needed, and recover every instance
    /// from it. New records go to a fresh log file.
    pub(crate) fn open(config: LoggerConfiguration) -> Result<(PaxosLogger, Recovery), PaxosLoggerError> {
        std::fs::create_dir_all(&config.log_dir)?;
        std::fs::create_dir_all(files::checkpoint_dir(&config.log_dir))?;

        let (recovery, index) = recovery::recover(&config.log_dir)?;
        let RecoveredIndex {
            mut file_summaries,
            last_ballot_file,
            mut decisions,
            mut checkpoint_files,
            redundant_checkpoint_files,
            log_files,
        } = index;

        for path in redundant_checkpoint_files {
            files::remove_file(&path)?;
        }
        compact_membership_file(&config, &recovery)?;

        let current_number = log_files.last().map_or(0, |last| last + 1);
        let current = AppendFile::open(
            &files::log_file_path(&config.log_dir, current_number),
            config.sync_log_writes,
        )?;
        file_summaries.insert(current_number, HashMap::new());
        let membership = AppendFile::open(
            &files::membership_file_path(&config.log_dir),
            config.sync_log_writes,
        )?;

        let instances = recovery
            .instances
            .values()
            .map(|instance| {
                (
                    instance.paxos_id.clone(),
                    InstanceIndex {
                        version: instance.version,
                        group: instance.group.clone(),
                        stopped: false,
                        checkpoint_file: checkpoint_files.remove(&instance.paxos_id),
                        decisions: decisions.remove(&instance.paxos_id).unwrap_or_default(),
                    },
                )
            })
            .collect();

        log::info!(
            "Recovered {} paxos instances and {} tombstones from {}",
            recovery.instances.len(),
            recovery.tombstones.len(),
            config.log_dir.display()
        );

        let logger = PaxosLogger {
            config,
            state: Mutex::new(LoggerState {
                membership,
                current,
                current_number,
                records_in_current: 0,
                file_summaries,
                last_ballot_file,
                instances,
            }),
        };
        logger.garbage_collect_log_files(&mut logger.lock())?;
        Ok((logger, recovery))
    }

    fn lock(&self) -> MutexGuard<'_, LoggerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Record that an instance was created at `version` with `group`. Replaces any older version.
    pub(crate) fn log_start(
        &self,
        paxos_id: &PaxosID,
        version: Version,
        group: &ReplicaGroup,
    ) -> Result<(), PaxosLoggerError> {
        check_paxos_id(paxos_id)?;
        let line = records::encode_membership_line(
            paxos_id,
            version,
            &MembershipRecord::Start { group: group.clone() },
        )?;

        let mut state = self.lock();
        state.membership.append(&line)?;
        state.instances.insert(
            paxos_id.clone(),
            InstanceIndex {
                version,
                group: group.clone(),
                stopped: false,
                checkpoint_file: None,
                decisions: BTreeMap::new(),
            },
        );
        Ok(())
    }

    /// Record that an instance executed `stop`. The instance's records stop mattering to recovery.
    pub(crate) fn log_stop(
        &self,
        paxos_id: &PaxosID,
        version: Version,
        stop: Option<PValue>,
    ) -> Result<(), PaxosLoggerError> {
        check_paxos_id(paxos_id)?;
        let mut state = self.lock();
        let group = match state.instances.get(paxos_id) {
            Some(instance) if instance.version == version => instance.group.clone(),
            _ => ReplicaGroup::new([]),
        };
        let line = records::encode_membership_line(paxos_id, version, &MembershipRecord::Stop { group, stop })?;
        state.membership.append(&line)?;
        if let Some(instance) = state.instances.get_mut(paxos_id) {
            if instance.version == version {
                instance.stopped = true;
            }
        }
        Ok(())
    }

    /// Append `records` of one instance with a single write.
    pub(crate) fn log_batch(
        &self,
        paxos_id: &PaxosID,
        version: Version,
        records: &[LogRecord],
    ) -> Result<(), PaxosLoggerError> {
        if records.is_empty() {
            return Ok(());
        }
        check_paxos_id(paxos_id)?;
        let mut lines = String::new();
        for record in records {
            lines.push_str(&records::encode_log_line(paxos_id, version, record)?);
        }

        let mut state = self.lock();
        state.current.append(&lines)?;

        let current_number = state.current_number;
        let indexed = state
            .instances
            .get(paxos_id)
            .map_or(false, |instance| instance.version == version);
        if indexed {
            let summary = state
                .file_summaries
                .entry(current_number)
                .or_default()
                .entry(paxos_id.clone())
                .or_insert_with(|| FileSummary::new(version));
            for record in records {
                summary.update(record);
            }
            if records.iter().any(|record| matches!(record, LogRecord::Ballot(_))) {
                state.last_ballot_file.insert(paxos_id.clone(), current_number);
            }
            if let Some(instance) = state.instances.get_mut(paxos_id) {
                let checkpoint_slot = instance.checkpoint_slot();
                for record in records {
                    if let LogRecord::Decision(pvalue) = record {
                        if checkpoint_slot.map_or(true, |slot| pvalue.slot > slot) {
                            instance.decisions.insert(pvalue.slot, pvalue.clone());
                        }
                    }
                }
            }
        }

        state.records_in_current += records.len() as u64;
        if state.records_in_current >= self.config.max_log_messages {
            self.rotate(&mut state)?;
        }
        Ok(())
    }

    pub(crate) fn log(&self, paxos_id: &PaxosID, version: Version, record: LogRecord) -> Result<(), PaxosLoggerError> {
        self.log_batch(paxos_id, version, &[record])
    }

    fn rotate(&self, state: &mut LoggerState) -> Result<(), PaxosLoggerError> {
        let next = state.current_number + 1;
        state.current = AppendFile::open(
            &files::log_file_path(&self.config.log_dir, next),
            self.config.sync_log_writes,
        )?;
        state.current_number = next;
        state.records_in_current = 0;
        state.file_summaries.insert(next, HashMap::new());
        log::debug!("Rotated to log file {}", next);
        self.garbage_collect_log_files(state)
    }

    /// Store `checkpoint`, replacing the instance's previous checkpoint.
    pub(crate) fn put_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), PaxosLoggerError> {
        check_paxos_id(&checkpoint.paxos_id)?;
        let name = CheckpointFileName {
            paxos_id: checkpoint.paxos_id.clone(),
            version: checkpoint.version,
            slot: checkpoint.slot,
        };
        let path = files::checkpoint_dir(&self.config.log_dir).join(name.to_file_name());
        files::write_atomically(&path, &checkpoint.try_to_vec()?, self.config.sync_log_writes)?;

        let mut state = self.lock();
        let Some(instance) = state.instances.get_mut(&checkpoint.paxos_id) else {
            return Ok(());
        };
        if instance.version != checkpoint.version {
            return Ok(());
        }
        if let Some((previous, _)) = instance.checkpoint_file.replace((path.clone(), name)) {
            if previous != path {
                files::remove_file(&previous)?;
            }
        }
        instance.decisions = instance.decisions.split_off(&checkpoint.slot.next());
        self.garbage_collect_log_files(&mut state)
    }

    /// Get the latest checkpoint of an instance, if one has been stored.
    pub(crate) fn get_checkpoint(
        &self,
        paxos_id: &PaxosID,
        version: Version,
    ) -> Result<Option<Checkpoint>, PaxosLoggerError> {
        let path = {
            let state = self.lock();
            match state.instances.get(paxos_id) {
                Some(instance) if instance.version == version => {
                    instance.checkpoint_file.as_ref().map(|(path, _)| path.clone())
                }
                _ => None,
            }
        };
        match path {
            Some(path) => Ok(Some(recovery::read_checkpoint(&path)?)),
            None => Ok(None),
        }
    }

    /// Get the logged decisions of an instance in `from..=to` that are above its checkpoint.
    pub(crate) fn get_logged_decisions(
        &self,
        paxos_id: &PaxosID,
        version: Version,
        from: Slot,
        to: Slot,
    ) -> Vec<PValue> {
        if from > to {
            return Vec::new();
        }
        let state = self.lock();
        match state.instances.get(paxos_id) {
            Some(instance) if instance.version == version => instance
                .decisions
                .range(from..=to)
                .map(|(_, pvalue)| pvalue.clone())
                .collect(),
            _ => Vec::new(),
        }
    }

    fn garbage_collect_log_files(&self, state: &mut LoggerState) -> Result<(), PaxosLoggerError> {
        let removable: Vec<u64> = state
            .file_summaries
            .iter()
            .filter(|(number, _)| **number < state.current_number)
            .filter(|(number, summaries)| {
                summaries.iter().all(|(paxos_id, summary)| {
                    let Some(instance) = state.instances.get(paxos_id) else {
                        return true;
                    };
                    if instance.stopped || instance.version != summary.version {
                        return true;
                    }
                    let slots_covered = match summary.max_slot {
                        None => true,
                        Some(max_slot) => instance.checkpoint_slot().map_or(false, |slot| max_slot <= slot),
                    };
                    let ballot_superseded = !summary.has_ballot
                        || state
                            .last_ballot_file
                            .get(paxos_id)
                            .map_or(false, |last| *last > **number);
                    slots_covered && ballot_superseded
                })
            })
            .map(|(number, _)| *number)
            .collect();

        for number in removable {
            files::remove_file(&files::log_file_path(&self.config.log_dir, number))?;
            state.file_summaries.remove(&number);
            log::debug!("Deleted log file {}", number);
        }
        Ok(())
    }
}

fn check_paxos_id(paxos_id: &PaxosID) -> Result<(), PaxosLoggerError> {
    if paxos_id.is_valid() {
        Ok(())
    } else {
        Err(PaxosLoggerError::InvalidPaxosID(paxos_id.clone()))
    }
}

/// Rewrite the membership file with one start record per live instance and one stop record per
/// tombstone.
fn compact_membership_file(config: &LoggerConfiguration, recovery: &Recovery) -> Result<(), PaxosLoggerError> {
    let mut contents = String::new();
    for tombstone in recovery.tombstones.values() {
        contents.push_str(&records::encode_membership_line(
            &tombstone.paxos_id,
            tombstone.version,
            &MembershipRecord::Stop {
                group: tombstone.group.clone(),
                stop: tombstone.stop.clone(),
            },
        )?);
    }
    for instance in recovery.instances.values() {
        contents.push_str(&records::encode_membership_line(
            &instance.paxos_id,
            instance.version,
            &MembershipRecord::Start {
                group: instance.group.clone(),
            },
        )?);
    }
    files::write_atomically(
        &files::membership_file_path(&config.log_dir),
        contents.as_bytes(),
        config.sync_log_writes,
    )?;
    Ok(())
}

#[cfg(test)]
pub(crate) fn test_configuration(log_dir: &std::path::Path) -> LoggerConfiguration {
    LoggerConfiguration {
        log_dir: log_dir.to_path_buf(),
        max_log_messages: 10_000,
        sync_log_writes: false,
    }
}

#[cfg(test)]
mod tests {
    use tempdir::TempDir;

    use super::*;
    use crate::types::{
        ballot::Ballot,
        data_types::{ClientID, Data, NodeID, RequestID},
        request::Request,
    };

    fn alice() -> PaxosID {
        PaxosID::new("alice")
    }

    fn group() -> ReplicaGroup {
        ReplicaGroup::new([1, 2, 3].map(NodeID::new))
    }

    fn ballot(number: u32, coordinator: u32) -> Ballot {
        Ballot::new(number, NodeID::new(coordinator))
    }

    fn pvalue(slot: u64, ballot: Ballot) -> PValue {
        PValue::new(
            Slot::new(slot),
            ballot,
            Request::new(RequestID::new(slot), ClientID::new(9), vec![slot as u8]),
        )
    }

    fn checkpoint(slot: u64) -> Checkpoint {
        Checkpoint {
            paxos_id: alice(),
            version: Version::new(0),
            group: group(),
            slot: Slot::new(slot),
            ballot: ballot(0, 1),
            state: Data::new(format!("state at {}", slot).into_bytes()),
            gc_slot: None,
        }
    }

    #[test]
    fn restart_recovers_ballot_executed_slot_and_pending_decisions() {
        let dir = TempDir::new("paxos_log").unwrap();
        {
            let (logger, recovery) = PaxosLogger::open(test_configuration(dir.path())).unwrap();
            assert!(recovery.instances.is_empty());

            logger.log_start(&alice(), Version::new(0), &group()).unwrap();
            logger.log(&alice(), Version::new(0), LogRecord::Ballot(ballot(3, 1))).unwrap();
            for slot in 40..=43 {
                logger
                    .log_batch(
                        &alice(),
                        Version::new(0),
                        &[
                            LogRecord::PValue(pvalue(slot, ballot(3, 1))),
                            LogRecord::Decision(pvalue(slot, ballot(3, 1))),
                        ],
                    )
                    .unwrap();
            }
            for slot in 40..=42 {
                logger.log(&alice(), Version::new(0), LogRecord::SlotNumber(Slot::new(slot))).unwrap();
            }
        }

        let (_logger, recovery) = PaxosLogger::open(test_configuration(dir.path())).unwrap();
        let recovered = &recovery.instances[&alice()];
        assert_eq!(recovered.ballot, Some(ballot(3, 1)));
        assert_eq!(recovered.last_executed, Some(Slot::new(42)));
        assert_eq!(
            recovered.decisions.keys().copied().collect::<Vec<_>>(),
            vec![Slot::new(43)]
        );
        assert_eq!(recovered.accepted.len(), 4);
    }

    #[test]
    fn recovery_is_idempotent() {
        let dir = TempDir::new("paxos_log").unwrap();
        {
            let (logger, _) = PaxosLogger::open(test_configuration(dir.path())).unwrap();
            logger.log_start(&alice(), Version::new(0), &group()).unwrap();
            logger.log(&alice(), Version::new(0), LogRecord::Ballot(ballot(1, 2))).unwrap();
            logger.log(&alice(), Version::new(0), LogRecord::PValue(pvalue(0, ballot(0, 1)))).unwrap();
            logger.log(&alice(), Version::new(0), LogRecord::PValue(pvalue(0, ballot(1, 2)))).unwrap();
            logger.log(&alice(), Version::new(0), LogRecord::PValue(pvalue(1, ballot(1, 2)))).unwrap();
            logger.log(&alice(), Version::new(0), LogRecord::GarbageSlot(Slot::new(0))).unwrap();
        }

        let first = PaxosLogger::open(test_configuration(dir.path())).unwrap().1;
        let second = PaxosLogger::open(test_configuration(dir.path())).unwrap().1;
        assert_eq!(first, second);
        let first = &first.instances[&alice()];
        assert_eq!(first.ballot, Some(ballot(1, 2)));
        assert_eq!(first.gc_slot, Some(Slot::new(0)));
        // Slot 0 is at the garbage collection slot.
        assert_eq!(first.accepted.keys().copied().collect::<Vec<_>>(), vec![Slot::new(1)]);
    }

    #[test]
    fn corrupt_lines_are_skipped() {
        let dir = TempDir::new("paxos_log").unwrap();
        {
            let (logger, _) = PaxosLogger::open(test_configuration(dir.path())).unwrap();
            logger.log_start(&alice(), Version::new(0), &group()).unwrap();
            logger.log(&alice(), Version::new(0), LogRecord::Ballot(ballot(2, 3))).unwrap();
        }
        let mut file = std::fs::OpenOptions::new()
            .append(true)
            .open(files::log_file_path(dir.path(), 0))
            .unwrap();
        std::io::Write::write_all(&mut file, b"alice\tBALLOT\tnot base64!\nalice\tSLOTNUMB").unwrap();
        drop(file);

        let (_logger, recovery) = PaxosLogger::open(test_configuration(dir.path())).unwrap();
        assert_eq!(recovery.instances[&alice()].ballot, Some(ballot(2, 3)));
    }

    #[test]
    fn stopped_instances_become_tombstones() {
        let dir = TempDir::new("paxos_log").unwrap();
        let stop = PValue::new(
            Slot::new(7),
            ballot(1, 1),
            Request::stop(RequestID::new(1), ClientID::new(1), Vec::<u8>::new()),
        );
        {
            let (logger, _) = PaxosLogger::open(test_configuration(dir.path())).unwrap();
            logger.log_start(&alice(), Version::new(0), &group()).unwrap();
            logger.log_stop(&alice(), Version::new(0), Some(stop.clone())).unwrap();
        }

        let (_logger, recovery) = PaxosLogger::open(test_configuration(dir.path())).unwrap();
        assert!(recovery.instances.is_empty());
        let tombstone = &recovery.tombstones[&alice()];
        assert_eq!(tombstone.stop, Some(stop));
        assert_eq!(tombstone.group, group());

        // Compaction kept the tombstone.
        let (_logger, recovery) = PaxosLogger::open(test_configuration(dir.path())).unwrap();
        assert!(recovery.tombstones.contains_key(&alice()));
    }

    #[test]
    fn checkpoints_replace_each_other_and_serve_sync() {
        let dir = TempDir::new("paxos_log").unwrap();
        let (logger, _) = PaxosLogger::open(test_configuration(dir.path())).unwrap();
        logger.log_start(&alice(), Version::new(0), &group()).unwrap();
        for slot in 0..6 {
            logger.log(&alice(), Version::new(0), LogRecord::Decision(pvalue(slot, ballot(0, 1)))).unwrap();
        }
        logger.put_checkpoint(&checkpoint(2)).unwrap();
        logger.put_checkpoint(&checkpoint(4)).unwrap();

        assert_eq!(logger.get_checkpoint(&alice(), Version::new(0)).unwrap(), Some(checkpoint(4)));
        assert_eq!(files::list_checkpoint_files(dir.path()).unwrap().len(), 1);

        let served: Vec<u64> = logger
            .get_logged_decisions(&alice(), Version::new(0), Slot::new(0), Slot::new(10))
            .iter()
            .map(|pvalue| pvalue.slot.int())
            .collect();
        assert_eq!(served, vec![5]);

        drop(logger);
        let (_logger, recovery) = PaxosLogger::open(test_configuration(dir.path())).unwrap();
        let recovered = &recovery.instances[&alice()];
        assert_eq!(recovered.checkpoint, Some(checkpoint(4)));
        // Installed, not executed here.
        assert_eq!(recovered.last_executed, None);
        assert_eq!(recovered.decisions.keys().copied().collect::<Vec<_>>(), vec![Slot::new(5)]);
    }

    #[test]
    fn superseded_log_files_are_deleted() {
        let dir = TempDir::new("paxos_log").unwrap();
        let config = LoggerConfiguration {
            max_log_messages: 2,
            ..test_configuration(dir.path())
        };
        let (logger, _) = PaxosLogger::open(config).unwrap();
        logger.log_start(&alice(), Version::new(0), &group()).unwrap();

        // File 0: a ballot and a decision. File 1: a later ballot and decision.
        logger.log(&alice(), Version::new(0), LogRecord::Ballot(ballot(0, 1))).unwrap();
        logger.log(&alice(), Version::new(0), LogRecord::Decision(pvalue(0, ballot(0, 1)))).unwrap();
        logger.log(&alice(), Version::new(0), LogRecord::Ballot(ballot(1, 2))).unwrap();
        logger.log(&alice(), Version::new(0), LogRecord::Decision(pvalue(1, ballot(1, 2)))).unwrap();
        assert_eq!(files::list_log_files(dir.path()).unwrap(), vec![0, 1, 2]);

        // Checkpointing slot 0 covers file 0 only: file 1 holds the latest ballot.
        logger.put_checkpoint(&checkpoint(0)).unwrap();
        assert_eq!(files::list_log_files(dir.path()).unwrap(), vec![1, 2]);

        logger.put_checkpoint(&checkpoint(1)).unwrap();
        assert_eq!(files::list_log_files(dir.path()).unwrap(), vec![1, 2]);
    }
}
