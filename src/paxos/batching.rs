/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Merging of outgoing messages produced while handling one drained batch of packets.
//!
//! Two kinds of message are merged, per recipient, paxos instance, and ballot:
//! 1. [`AcceptReply`]s from one acceptor become a [`BatchedAcceptReply`].
//! 2. Single-slot [`BatchedCommit`]s become one [`BatchedCommit`] over the union of their slots.
//!
//! Everything else is passed through untouched. Merged messages take the position of the first message
//! they absorb, so the relative order of unrelated messages to the same recipient is preserved.

use std::collections::HashMap;

use crate::types::{
    ballot::Ballot,
    data_types::{NodeID, PaxosID, Version},
};

use super::messages::{AcceptReply, BatchedAcceptReply, BatchedCommit, PaxosMessage, PaxosPacket};
use super::MessagingTask;

#[derive(Clone, PartialEq, Eq, Hash)]
struct BatchKey {
    recipient: NodeID,
    paxos_id: PaxosID,
    version: Version,
    ballot: Ballot,
    acceptor: Option<NodeID>,
}

enum Pending {
    Task(MessagingTask),
    AcceptReplies(BatchKey, Vec<AcceptReply>),
    Commits(BatchKey, BatchedCommit),
}

/// Merge mergeable messages in `tasks`.
pub(crate) fn batch(tasks: Vec<MessagingTask>) -> Vec<MessagingTask> {
    let mut pending: Vec<Pending> = Vec::new();
    let mut positions: HashMap<BatchKey, usize> = HashMap::new();

    for task in tasks {
        let MessagingTask { recipients, message } = task;
        let PaxosMessage { envelope, packet } = message;
        match packet {
            PaxosPacket::AcceptReply(reply) => {
                for recipient in recipients {
                    let key = BatchKey {
                        recipient,
                        paxos_id: envelope.paxos_id.clone(),
                        version: envelope.version,
                        ballot: reply.ballot,
                        acceptor: Some(reply.acceptor),
                    };
                    match positions.get(&key) {
                        Some(position) => {
                            if let Pending::AcceptReplies(_, replies) = &mut pending[*position] {
                                replies.push(reply.clone());
                            }
                        }
                        None => {
                            positions.insert(key.clone(), pending.len());
                            pending.push(Pending::AcceptReplies(key, vec![reply.clone()]));
                        }
                    }
                }
            }
            PaxosPacket::BatchedCommit(commit) => {
                for recipient in recipients {
                    let key = BatchKey {
                        recipient,
                        paxos_id: envelope.paxos_id.clone(),
                        version: envelope.version,
                        ballot: commit.ballot,
                        acceptor: None,
                    };
                    match positions.get(&key) {
                        Some(position) => {
                            if let Pending::Commits(_, merged) = &mut pending[*position] {
                                merged.slots.extend(commit.slots.iter().copied());
                                merged.median_checkpointed_slot = merged
                                    .median_checkpointed_slot
                                    .max(commit.median_checkpointed_slot);
                            }
                        }
                        None => {
                            positions.insert(key.clone(), pending.len());
                            pending.push(Pending::Commits(key, commit.clone()));
                        }
                    }
                }
            }
            packet => pending.push(Pending::Task(MessagingTask {
                recipients,
                message: PaxosMessage { envelope, packet },
            })),
        }
    }

    pending.into_iter().map(Pending::into_task).collect()
}

impl Pending {
    fn into_task(self) -> MessagingTask {
        match self {
            Pending::Task(task) => task,
            Pending::AcceptReplies(key, mut replies) => {
                let packet: PaxosPacket = if replies.len() == 1 {
                    replies.remove(0).into()
                } else {
                    BatchedAcceptReply {
                        acceptor: replies[0].acceptor,
                        ballot: key.ballot,
                        max_checkpointed_slot: replies
                            .iter()
                            .map(|reply| reply.max_checkpointed_slot)
                            .max()
                            .flatten(),
                        slots: replies.iter().map(|reply| (reply.slot, reply.request_id)).collect(),
                    }
                    .into()
                };
                MessagingTask {
                    recipients: vec![key.recipient],
                    message: PaxosMessage::new(key.paxos_id, key.version, packet),
                }
            }
            Pending::Commits(key, commit) => MessagingTask {
                recipients: vec![key.recipient],
                message: PaxosMessage::new(key.paxos_id, key.version, commit),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use super::*;
    use crate::paxos::acceptor::Acceptor;
    use crate::paxos::coordinator::{AcceptReplyOutcome, Coordinator};
    use crate::paxos::messages::{Accept, Prepare};
    use crate::types::{
        data_types::{ClientID, RequestID, Slot},
        pvalue::PValue,
        replica_group::ReplicaGroup,
        request::Request,
    };

    fn node(id: u32) -> NodeID {
        NodeID::new(id)
    }

    fn ballot() -> Ballot {
        Ballot::new(1, node(1))
    }

    fn reply_task(paxos_id: &str, acceptor: u32, slot: u64, checkpointed: Option<u64>) -> MessagingTask {
        MessagingTask {
            recipients: vec![node(1)],
            message: PaxosMessage::new(
                PaxosID::new(paxos_id),
                Version::new(0),
                AcceptReply {
                    acceptor: node(acceptor),
                    ballot: ballot(),
                    slot: Slot::new(slot),
                    max_checkpointed_slot: checkpointed.map(Slot::new),
                    request_id: RequestID::new(slot),
                },
            ),
        }
    }

    fn commit_task(recipients: Vec<u32>, slot: u64) -> MessagingTask {
        MessagingTask {
            recipients: recipients.into_iter().map(node).collect(),
            message: PaxosMessage::new(
                PaxosID::new("alice"),
                Version::new(0),
                BatchedCommit {
                    ballot: ballot(),
                    median_checkpointed_slot: None,
                    slots: [Slot::new(slot)].into_iter().collect(),
                    group: ReplicaGroup::new((1..=3).map(node)),
                },
            ),
        }
    }

    #[test]
    fn accept_replies_for_same_ballot_merge() {
        let tasks = vec![
            reply_task("alice", 2, 5, None),
            reply_task("alice", 2, 6, Some(0)),
            reply_task("bob", 2, 5, None),
            reply_task("alice", 2, 7, None),
        ];
        let batched = batch(tasks);
        assert_eq!(batched.len(), 2);

        match &batched[0].message.packet {
            PaxosPacket::BatchedAcceptReply(reply) => {
                assert_eq!(
                    reply.slots.keys().copied().collect::<Vec<_>>(),
                    vec![Slot::new(5), Slot::new(6), Slot::new(7)]
                );
                // Each slot keeps the ID of the request its reply was for.
                assert!(reply.slots.iter().all(|(slot, id)| id.int() == slot.int()));
                assert_eq!(reply.max_checkpointed_slot, Some(Slot::new(0)));
            }
            other => panic!("expected a batched accept reply, got {:?}", other),
        }
        // A lone reply stays a plain reply.
        assert!(matches!(
            batched[1].message.packet,
            PaxosPacket::AcceptReply(_)
        ));
        assert_eq!(batched[1].message.paxos_id(), &PaxosID::new("bob"));
    }

    #[test]
    fn commits_merge_per_recipient() {
        let tasks = vec![commit_task(vec![2, 3], 0), commit_task(vec![3], 1)];
        let batched = batch(tasks);
        assert_eq!(batched.len(), 2);

        let slots_for = |recipient: u32| -> Vec<u64> {
            batched
                .iter()
                .filter(|task| task.recipients == vec![node(recipient)])
                .flat_map(|task| match &task.message.packet {
                    PaxosPacket::BatchedCommit(commit) => commit.slots.iter().map(|s| s.int()).collect(),
                    _ => Vec::new(),
                })
                .collect()
        };
        assert_eq!(slots_for(2), vec![0]);
        assert_eq!(slots_for(3), vec![0, 1]);
    }

    #[test]
    fn other_messages_pass_through_in_order() {
        let prepare = MessagingTask {
            recipients: vec![node(2), node(3)],
            message: PaxosMessage::new(
                PaxosID::new("alice"),
                Version::new(0),
                Prepare {
                    ballot: ballot(),
                    first_undecided_slot: Slot::new(0),
                    recovery: false,
                },
            ),
        };
        let batched = batch(vec![prepare, reply_task("alice", 2, 0, None)]);
        assert_eq!(batched.len(), 2);
        assert!(matches!(batched[0].message.packet, PaxosPacket::Prepare(_)));
        assert_eq!(batched[0].recipients, vec![node(2), node(3)]);
    }

    fn group() -> ReplicaGroup {
        ReplicaGroup::new((1..=5).map(node))
    }

    fn request(id: u64) -> Request {
        Request::new(RequestID::new(id), ClientID::new(3), vec![id as u8])
    }

    /// Turn whatever arrives at a coordinator back into the replies it stands for.
    fn received_replies(tasks: Vec<MessagingTask>) -> Vec<AcceptReply> {
        tasks
            .into_iter()
            .flat_map(|task| match task.message.packet {
                PaxosPacket::AcceptReply(reply) => vec![reply],
                PaxosPacket::BatchedAcceptReply(batched) => batched.expand(),
                other => panic!("unexpected {:?}", other),
            })
            .collect()
    }

    /// Apply a commit notice the way an instance does, returning the slots that became executable.
    fn apply_commit(acceptor: &mut Acceptor, commit: &BatchedCommit) -> Vec<Slot> {
        for slot in commit.slots.iter().copied() {
            match acceptor.reconstruct_decision(slot, commit.ballot) {
                Some(pvalue) => {
                    acceptor.put_decision(pvalue);
                }
                None => acceptor.put_meta_decision(slot, commit.ballot),
            }
        }
        let mut executed = Vec::new();
        while let Some(pvalue) = acceptor.next_executable().cloned() {
            acceptor.executed(pvalue.slot, false);
            executed.push(pvalue.slot);
        }
        executed
    }

    #[test]
    fn batched_accept_replies_decide_like_individual_ones() {
        let now = Instant::now();
        let mut individually = Coordinator::new(ballot(), Slot::new(0), &group(), true, now);
        let mut batched = Coordinator::new(ballot(), Slot::new(0), &group(), true, now);
        for id in 0..3 {
            individually.propose(request(id), &group(), now);
            batched.propose(request(id), &group(), now);
        }

        let mut tasks = Vec::new();
        for acceptor in [1, 2, 3] {
            for slot in 0..3 {
                tasks.push(reply_task("alice", acceptor, slot, Some(slot.saturating_sub(1))));
            }
        }

        let outcomes = |coordinator: &mut Coordinator, replies: Vec<AcceptReply>| -> Vec<AcceptReplyOutcome> {
            replies
                .iter()
                .map(|reply| coordinator.handle_accept_reply(reply, &group()))
                .filter(|outcome| matches!(outcome, AcceptReplyOutcome::Decided { .. }))
                .collect()
        };
        let one_by_one = outcomes(&mut individually, received_replies(tasks.clone()));
        let merged = batch(tasks);
        assert_eq!(merged.len(), 3);
        let all_at_once = outcomes(&mut batched, received_replies(merged));

        assert_eq!(one_by_one.len(), 3);
        assert_eq!(one_by_one, all_at_once);
        assert_eq!(individually.median_checkpointed_slot(), batched.median_checkpointed_slot());
        assert!(!individually.has_proposals() && !batched.has_proposals());
    }

    #[test]
    fn merged_commits_leave_acceptors_in_the_same_state() {
        let accepted_at = |acceptor: &mut Acceptor| {
            // Slot 2 never reaches this acceptor.
            for slot in [0, 1, 3] {
                acceptor.accept_and_update_ballot(&Accept {
                    sender: node(1),
                    pvalue: PValue::new(Slot::new(slot), ballot(), request(slot)),
                    median_checkpointed_slot: None,
                });
            }
        };
        let mut individually = Acceptor::new(ballot());
        let mut merged = Acceptor::new(ballot());
        accepted_at(&mut individually);
        accepted_at(&mut merged);

        let tasks: Vec<MessagingTask> = (0..4).map(|slot| commit_task(vec![2], slot)).collect();
        let mut executed_individually = Vec::new();
        for task in tasks.clone() {
            if let PaxosPacket::BatchedCommit(commit) = task.message.packet {
                executed_individually.extend(apply_commit(&mut individually, &commit));
            }
        }

        let batched = batch(tasks);
        assert_eq!(batched.len(), 1);
        let executed_merged = match &batched[0].message.packet {
            PaxosPacket::BatchedCommit(commit) => apply_commit(&mut merged, commit),
            other => panic!("expected a batched commit, got {:?}", other),
        };

        assert_eq!(executed_individually, vec![Slot::new(0), Slot::new(1)]);
        assert_eq!(executed_individually, executed_merged);
        assert_eq!(individually.slot(), merged.slot());
        assert_eq!(individually.missing_committed_slots(10), vec![Slot::new(2)]);
        assert_eq!(individually.missing_committed_slots(10), merged.missing_committed_slots(10));
        assert_eq!(individually.max_committed_slot(), merged.max_committed_slot());
    }
}
