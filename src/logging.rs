/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Functions that log out events.
//!
//! The logs defined in this module are printed if the user enabled them via replica's
//! [config](crate::replica::Configuration).
//!
//! The engine logs using the [log](https://docs.rs/log/latest/log/) crate. To get these messages
//! printed onto a terminal or to a file, set up a
//! [logging implementation](https://docs.rs/log/latest/log/#available-logging-implementations).
//!
//! ## Log message format
//!
//! Log messages are CSVs (Comma Separated Values) with at least three values. The first three values
//! are always:
//! 1. The name of the [event](crate::events) in PascalCase (defined in this module as constants).
//! 2. The time the event was emitted (as number of seconds since the Unix Epoch).
//! 3. The paxos ID of the instance the event happened in.
//!
//! The rest of the values differ depending on the kind of event. For example, the following snippet
//! is how an [Accept](crate::events::AcceptEvent) is printed:
//!
//! ```text
//! Accept, 1701329264, alice, 3, 12, 1:3, YWxpY2U
//! ```
//!
//! In the snippet:
//! - The fourth value is the node that sent the accept.
//! - The fifth value is the slot of the accepted pvalue.
//! - The sixth value is its ballot.
//! - The seventh value is the first seven characters of the Base64 encoding of the request's payload.

use std::time::SystemTime;

use base64::{engine::general_purpose::STANDARD_NO_PAD, Engine as _};

use crate::events::*;
use crate::types::data_types::Slot;

// Names of each event in PascalCase for printing:
pub const CREATE_INSTANCE: &str = "CreateInstance";
pub const STOP_INSTANCE: &str = "StopInstance";
pub const RECOVER_INSTANCE: &str = "RecoverInstance";

pub const PROPOSE: &str = "Propose";
pub const ACCEPT: &str = "Accept";
pub const DECIDE: &str = "Decide";
pub const EXECUTE: &str = "Execute";

pub const CHECKPOINT: &str = "Checkpoint";
pub const GARBAGE_COLLECT: &str = "GarbageCollect";

pub const RUN_FOR_COORDINATOR: &str = "RunForCoordinator";
pub const BECOME_ACTIVE: &str = "BecomeActive";
pub const PREEMPTED: &str = "Preempted";

pub const START_SYNC: &str = "StartSync";
pub const RECEIVE_SYNC_REQUEST: &str = "ReceiveSyncRequest";
pub const RESTORE_CHECKPOINT: &str = "RestoreCheckpoint";

pub const FIND_REPLICA_GROUP: &str = "FindReplicaGroup";
pub const REQUEST_FAILED: &str = "RequestFailed";

/// Implemented by event types. Used to get a closure that logs the event.
pub(crate) trait Logger {
    /// Returns a pointer to the default logging handler for a given event type.
    fn get_logger() -> Box<dyn Fn(&Self) + Send>;
}

impl Logger for CreateInstanceEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |create_instance_event: &CreateInstanceEvent| {
            log::info!(
                "{}, {}, {}, {}, {:?}",
                CREATE_INSTANCE,
                secs_since_unix_epoch(create_instance_event.timestamp),
                create_instance_event.paxos_id,
                create_instance_event.version,
                create_instance_event.group
            )
        };
        Box::new(logger)
    }
}

impl Logger for StopInstanceEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |stop_instance_event: &StopInstanceEvent| {
            log::info!(
                "{}, {}, {}, {}, {}",
                STOP_INSTANCE,
                secs_since_unix_epoch(stop_instance_event.timestamp),
                stop_instance_event.paxos_id,
                stop_instance_event.version,
                stop_instance_event.slot
            )
        };
        Box::new(logger)
    }
}

impl Logger for RecoverInstanceEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |recover_instance_event: &RecoverInstanceEvent| {
            log::info!(
                "{}, {}, {}, {}, {}, {}",
                RECOVER_INSTANCE,
                secs_since_unix_epoch(recover_instance_event.timestamp),
                recover_instance_event.paxos_id,
                recover_instance_event.version,
                recover_instance_event.ballot,
                recover_instance_event.next_slot
            )
        };
        Box::new(logger)
    }
}

impl Logger for ProposeEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |propose_event: &ProposeEvent| {
            log::info!(
                "{}, {}, {}, {}, {}, {}",
                PROPOSE,
                secs_since_unix_epoch(propose_event.timestamp),
                propose_event.paxos_id,
                propose_event.pvalue.slot,
                propose_event.pvalue.ballot,
                first_seven_base64_chars(propose_event.pvalue.request.payload.bytes())
            )
        };
        Box::new(logger)
    }
}

impl Logger for AcceptEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |accept_event: &AcceptEvent| {
            log::info!(
                "{}, {}, {}, {}, {}, {}, {}",
                ACCEPT,
                secs_since_unix_epoch(accept_event.timestamp),
                accept_event.paxos_id,
                accept_event.origin,
                accept_event.pvalue.slot,
                accept_event.pvalue.ballot,
                first_seven_base64_chars(accept_event.pvalue.request.payload.bytes())
            )
        };
        Box::new(logger)
    }
}

impl Logger for DecideEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |decide_event: &DecideEvent| {
            log::info!(
                "{}, {}, {}, {}, {}",
                DECIDE,
                secs_since_unix_epoch(decide_event.timestamp),
                decide_event.paxos_id,
                decide_event.pvalue.slot,
                decide_event.pvalue.ballot
            )
        };
        Box::new(logger)
    }
}

impl Logger for ExecuteEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |execute_event: &ExecuteEvent| {
            log::info!(
                "{}, {}, {}, {}, {:?}",
                EXECUTE,
                secs_since_unix_epoch(execute_event.timestamp),
                execute_event.paxos_id,
                execute_event.slot,
                execute_event.request
            )
        };
        Box::new(logger)
    }
}

impl Logger for CheckpointEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |checkpoint_event: &CheckpointEvent| {
            log::info!(
                "{}, {}, {}, {}",
                CHECKPOINT,
                secs_since_unix_epoch(checkpoint_event.timestamp),
                checkpoint_event.paxos_id,
                checkpoint_event.slot
            )
        };
        Box::new(logger)
    }
}

impl Logger for GarbageCollectEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |garbage_collect_event: &GarbageCollectEvent| {
            log::info!(
                "{}, {}, {}, {}",
                GARBAGE_COLLECT,
                secs_since_unix_epoch(garbage_collect_event.timestamp),
                garbage_collect_event.paxos_id,
                garbage_collect_event.gc_slot
            )
        };
        Box::new(logger)
    }
}

impl Logger for RunForCoordinatorEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |run_for_coordinator_event: &RunForCoordinatorEvent| {
            log::info!(
                "{}, {}, {}, {}",
                RUN_FOR_COORDINATOR,
                secs_since_unix_epoch(run_for_coordinator_event.timestamp),
                run_for_coordinator_event.paxos_id,
                run_for_coordinator_event.ballot
            )
        };
        Box::new(logger)
    }
}

impl Logger for BecomeActiveEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |become_active_event: &BecomeActiveEvent| {
            log::info!(
                "{}, {}, {}, {}, {}",
                BECOME_ACTIVE,
                secs_since_unix_epoch(become_active_event.timestamp),
                become_active_event.paxos_id,
                become_active_event.ballot,
                become_active_event.proposals
            )
        };
        Box::new(logger)
    }
}

impl Logger for PreemptedEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |preempted_event: &PreemptedEvent| {
            log::info!(
                "{}, {}, {}, {}, {}",
                PREEMPTED,
                secs_since_unix_epoch(preempted_event.timestamp),
                preempted_event.paxos_id,
                preempted_event.ballot,
                preempted_event.preempting_ballot
            )
        };
        Box::new(logger)
    }
}

impl Logger for StartSyncEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |start_sync_event: &StartSyncEvent| {
            log::info!(
                "{}, {}, {}, {}, {}, {}, {}",
                START_SYNC,
                secs_since_unix_epoch(start_sync_event.timestamp),
                start_sync_event.paxos_id,
                start_sync_event.peer,
                first_slot(&start_sync_event.missing_slots),
                start_sync_event.missing_slots.len(),
                start_sync_event.missing_too_much
            )
        };
        Box::new(logger)
    }
}

impl Logger for ReceiveSyncRequestEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |receive_sync_request_event: &ReceiveSyncRequestEvent| {
            log::info!(
                "{}, {}, {}, {}, {}",
                RECEIVE_SYNC_REQUEST,
                secs_since_unix_epoch(receive_sync_request_event.timestamp),
                receive_sync_request_event.paxos_id,
                receive_sync_request_event.peer,
                receive_sync_request_event.missing_slots
            )
        };
        Box::new(logger)
    }
}

impl Logger for RestoreCheckpointEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |restore_checkpoint_event: &RestoreCheckpointEvent| {
            log::info!(
                "{}, {}, {}, {}",
                RESTORE_CHECKPOINT,
                secs_since_unix_epoch(restore_checkpoint_event.timestamp),
                restore_checkpoint_event.paxos_id,
                restore_checkpoint_event.slot
            )
        };
        Box::new(logger)
    }
}

impl Logger for FindReplicaGroupEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |find_replica_group_event: &FindReplicaGroupEvent| {
            log::info!(
                "{}, {}, {}, {}, {:?}",
                FIND_REPLICA_GROUP,
                secs_since_unix_epoch(find_replica_group_event.timestamp),
                find_replica_group_event.paxos_id,
                find_replica_group_event.attempt,
                find_replica_group_event.peers
            )
        };
        Box::new(logger)
    }
}

impl Logger for RequestFailedEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |request_failed_event: &RequestFailedEvent| {
            log::info!(
                "{}, {}, {}, {:?}, {:?}",
                REQUEST_FAILED,
                secs_since_unix_epoch(request_failed_event.timestamp),
                request_failed_event.paxos_id,
                request_failed_event.request,
                request_failed_event.reason
            )
        };
        Box::new(logger)
    }
}

pub(crate) fn first_seven_base64_chars(bytes: &[u8]) -> String {
    let encoded = STANDARD_NO_PAD.encode(bytes);
    if encoded.len() > 7 {
        encoded[0..7].to_string()
    } else {
        encoded
    }
}

fn first_slot(slots: &[Slot]) -> String {
    match slots.first() {
        Some(slot) => slot.to_string(),
        None => String::from("-"),
    }
}

pub(crate) fn secs_since_unix_epoch(timestamp: SystemTime) -> u64 {
    timestamp
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|duration| duration.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_payload_prefixes() {
        assert_eq!(first_seven_base64_chars(b"alice"), "YWxpY2U");
        assert_eq!(first_seven_base64_chars(b"ab"), "YWI");
        assert_eq!(first_seven_base64_chars(&[]), "");
    }

    #[test]
    fn timestamps_before_the_epoch_print_as_zero() {
        let before = SystemTime::UNIX_EPOCH - std::time::Duration::from_secs(5);
        assert_eq!(secs_since_unix_epoch(before), 0);
        let after = SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(5);
        assert_eq!(secs_since_unix_epoch(after), 5);
    }
}
