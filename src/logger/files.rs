/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! On-disk layout of the persistent log.
//!
//! ```text
//! <log_dir>/
//!     paxosIDs                        membership records
//!     paxoslog_0, paxoslog_1, ...     log records, rotated every `max_log_messages` records
//!     paxosState/
//!         <b64url(paxos ID)>_<version>_<slot>    one checkpoint per instance
//! ```
//!
//! Files that must never be observed half-written (the compacted membership file and checkpoints) are
//! written to a temporary file first and then renamed into place.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};

use crate::types::data_types::{PaxosID, Slot, Version};

pub(crate) const MEMBERSHIP_FILE: &str = "paxosIDs";
pub(crate) const LOG_FILE_PREFIX: &str = "paxoslog_";
pub(crate) const CHECKPOINT_DIR: &str = "paxosState";
const TEMP_SUFFIX: &str = ".tmp";

/// An append-only text file.
pub(crate) struct AppendFile {
    file: File,
    sync: bool,
}

impl AppendFile {
    pub(crate) fn open(path: &Path, sync: bool) -> io::Result<AppendFile> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(AppendFile { file, sync })
    }

    /// Append `lines` with a single write, then flush them to the operating system, and to the disk if
    /// `sync` is set.
    pub(crate) fn append(&mut self, lines: &str) -> io::Result<()> {
        self.file.write_all(lines.as_bytes())?;
        self.file.flush()?;
        if self.sync {
            self.file.sync_data()?;
        }
        Ok(())
    }
}

pub(crate) fn membership_file_path(log_dir: &Path) -> PathBuf {
    log_dir.join(MEMBERSHIP_FILE)
}

pub(crate) fn log_file_path(log_dir: &Path, number: u64) -> PathBuf {
    log_dir.join(format!("{}{}", LOG_FILE_PREFIX, number))
}

pub(crate) fn checkpoint_dir(log_dir: &Path) -> PathBuf {
    log_dir.join(CHECKPOINT_DIR)
}

/// List the numbers of every log file in `log_dir`, in increasing order.
pub(crate) fn list_log_files(log_dir: &Path) -> io::Result<Vec<u64>> {
    let mut numbers = Vec::new();
    for entry in fs::read_dir(log_dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        if let Some(number) = name
            .strip_prefix(LOG_FILE_PREFIX)
            .and_then(|number| number.parse::<u64>().ok())
        {
            numbers.push(number);
        }
    }
    numbers.sort_unstable();
    Ok(numbers)
}

/// Read every line of the file at `path`. A missing file has no lines. Lines that are not valid UTF-8
/// are returned as errors so that the caller can skip them.
pub(crate) fn read_lines(path: &Path) -> io::Result<Vec<io::Result<String>>> {
    match File::open(path) {
        Ok(file) => Ok(BufReader::new(file).lines().collect()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(err) => Err(err),
    }
}

/// Atomically replace the contents of the file at `path` with `bytes`.
pub(crate) fn write_atomically(path: &Path, bytes: &[u8], sync: bool) -> io::Result<()> {
    let mut temp_path = path.as_os_str().to_owned();
    temp_path.push(TEMP_SUFFIX);
    let temp_path = PathBuf::from(temp_path);

    let mut file = File::create(&temp_path)?;
    file.write_all(bytes)?;
    file.flush()?;
    if sync {
        file.sync_all()?;
    }
    drop(file);
    fs::rename(&temp_path, path)
}

/// Name of a checkpoint file.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct CheckpointFileName {
    pub(crate) paxos_id: PaxosID,
    pub(crate) version: Version,
    pub(crate) slot: Slot,
}

impl CheckpointFileName {
    pub(crate) fn to_file_name(&self) -> String {
        format!(
            "{}_{}_{}",
            URL_SAFE_NO_PAD.encode(self.paxos_id.as_str()),
            self.version,
            self.slot
        )
    }

    /// Parse a checkpoint file name. Returns `None` for anything else, including leftover temporary
    /// files.
    pub(crate) fn parse(file_name: &str) -> Option<CheckpointFileName> {
        let mut fields = file_name.rsplitn(3, '_');
        let slot = fields.next()?.parse::<u64>().ok()?;
        let version = fields.next()?.parse::<u32>().ok()?;
        let paxos_id = URL_SAFE_NO_PAD.decode(fields.next()?).ok()?;
        let paxos_id = String::from_utf8(paxos_id).ok()?;
        Some(CheckpointFileName {
            paxos_id: PaxosID::new(paxos_id),
            version: Version::new(version),
            slot: Slot::new(slot),
        })
    }
}

/// List every checkpoint file under the checkpoint directory, with its parsed name.
pub(crate) fn list_checkpoint_files(log_dir: &Path) -> io::Result<Vec<(PathBuf, CheckpointFileName)>> {
    let mut checkpoints = Vec::new();
    for entry in fs::read_dir(checkpoint_dir(log_dir))? {
        let entry = entry?;
        let name = entry.file_name();
        if let Some(parsed) = name.to_str().and_then(CheckpointFileName::parse) {
            checkpoints.push((entry.path(), parsed));
        }
    }
    Ok(checkpoints)
}

/// Remove the file at `path`, treating an already missing file as removed.
pub(crate) fn remove_file(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(err) if err.kind() != io::ErrorKind::NotFound => Err(err),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checkpoint_file_names_survive_awkward_ids() {
        for id in ["alice", "name_service/alice_2", "a\u{e9}_b"] {
            let name = CheckpointFileName {
                paxos_id: PaxosID::new(id),
                version: Version::new(3),
                slot: Slot::new(400),
            };
            assert_eq!(CheckpointFileName::parse(&name.to_file_name()), Some(name));
        }
        assert_eq!(CheckpointFileName::parse("YWxpY2U_3_400.tmp"), None);
        assert_eq!(CheckpointFileName::parse("paxosIDs"), None);
    }
}
