/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Buffering of work for paxos instances whose replica group is not known yet.
//!
//! Work for an unknown instance waits here while the replica asks peers for the instance's group with
//! [`FindReplicaGroup`](crate::paxos::messages::FindReplicaGroup). The request is repeated every
//! `find_group_retry_interval`. After `max_find_group_attempts` the buffered work is given up on.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::types::data_types::{NodeID, PaxosID, Version};

use super::workers::WorkItem;

struct PendingGroup {
    /// The lowest version acceptable in an answer.
    version: Version,
    peers: Vec<NodeID>,
    buffered: Vec<WorkItem>,
    attempts: u32,
    last_asked: Instant,
}

pub(crate) enum RetryOutcome {
    Retry {
        paxos_id: PaxosID,
        version: Version,
        peers: Vec<NodeID>,
        attempt: u32,
    },
    GiveUp {
        paxos_id: PaxosID,
        buffered: Vec<WorkItem>,
    },
}

pub(crate) struct PendingGroups(HashMap<PaxosID, PendingGroup>);

impl PendingGroups {
    pub(crate) fn new() -> PendingGroups {
        PendingGroups(HashMap::new())
    }

    /// Buffer `item` for `paxos_id`.
    ///
    /// # Return value
    /// Whether this is the first item buffered for `paxos_id`, in which case the caller asks `peers`
    /// for its group. Later callers only add to the set of peers asked on retries.
    pub(crate) fn buffer(
        &mut self,
        paxos_id: PaxosID,
        version: Version,
        peers: Vec<NodeID>,
        item: WorkItem,
        now: Instant,
    ) -> bool {
        match self.0.get_mut(&paxos_id) {
            Some(pending) => {
                pending.version = pending.version.min(version);
                for peer in peers {
                    if !pending.peers.contains(&peer) {
                        pending.peers.push(peer);
                    }
                }
                pending.buffered.push(item);
                false
            }
            None => {
                self.0.insert(
                    paxos_id,
                    PendingGroup {
                        version,
                        peers,
                        buffered: vec![item],
                        attempts: 1,
                        last_asked: now,
                    },
                );
                true
            }
        }
    }

    /// Whether work for `paxos_id` is waiting for an answer of at least `version`.
    pub(crate) fn is_waiting_for(&self, paxos_id: &PaxosID, version: Version) -> bool {
        self.0
            .get(paxos_id)
            .map_or(false, |pending| version >= pending.version)
    }

    /// Take the work buffered for `paxos_id`, in the order it was buffered.
    pub(crate) fn remove(&mut self, paxos_id: &PaxosID) -> Vec<WorkItem> {
        self.0
            .remove(paxos_id)
            .map_or_else(Vec::new, |pending| pending.buffered)
    }

    pub(crate) fn retries_due(&mut self, interval: Duration, max_attempts: u32, now: Instant) -> Vec<RetryOutcome> {
        let due: Vec<PaxosID> = self
            .0
            .iter()
            .filter(|(_, pending)| now.saturating_duration_since(pending.last_asked) >= interval)
            .map(|(paxos_id, _)| paxos_id.clone())
            .collect();

        let mut outcomes = Vec::new();
        for paxos_id in due {
            let Some(pending) = self.0.get_mut(&paxos_id) else {
                continue;
            };
            if pending.attempts >= max_attempts {
                let buffered = self.remove(&paxos_id);
                outcomes.push(RetryOutcome::GiveUp { paxos_id, buffered });
                continue;
            }
            pending.attempts += 1;
            pending.last_asked = now;
            outcomes.push(RetryOutcome::Retry {
                version: pending.version,
                peers: pending.peers.clone(),
                attempt: pending.attempts,
                paxos_id,
            });
        }
        outcomes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::data_types::{ClientID, RequestID};
    use crate::types::request::Request;

    fn propose(id: u64) -> WorkItem {
        WorkItem::Propose {
            paxos_id: PaxosID::new("alice"),
            request: Request::new(RequestID::new(id), ClientID::new(1), Vec::<u8>::new()),
        }
    }

    #[test]
    fn gives_up_after_the_last_attempt() {
        let start = Instant::now();
        let interval = Duration::from_secs(1);
        let alice = PaxosID::new("alice");
        let mut pending = PendingGroups::new();

        assert!(pending.buffer(alice.clone(), Version::new(0), vec![NodeID::new(2)], propose(1), start));
        assert!(!pending.buffer(alice.clone(), Version::new(0), vec![NodeID::new(3)], propose(2), start));
        assert!(pending.retries_due(interval, 3, start).is_empty());

        match &pending.retries_due(interval, 3, start + interval)[..] {
            [RetryOutcome::Retry { peers, attempt, .. }] => {
                assert_eq!(peers, &vec![NodeID::new(2), NodeID::new(3)]);
                assert_eq!(*attempt, 2);
            }
            _ => panic!("expected a retry"),
        }
        assert_eq!(pending.retries_due(interval, 3, start + interval * 2).len(), 1);

        match &pending.retries_due(interval, 3, start + interval * 3)[..] {
            [RetryOutcome::GiveUp { buffered, .. }] => assert_eq!(buffered.len(), 2),
            _ => panic!("expected to give up"),
        }
        assert!(!pending.is_waiting_for(&alice, Version::new(0)));
    }

    #[test]
    fn answers_must_be_recent_enough() {
        let alice = PaxosID::new("alice");
        let mut pending = PendingGroups::new();
        pending.buffer(alice.clone(), Version::new(2), vec![], propose(1), Instant::now());

        assert!(!pending.is_waiting_for(&alice, Version::new(1)));
        assert!(pending.is_waiting_for(&alice, Version::new(2)));
        assert_eq!(pending.remove(&alice).len(), 1);
        assert!(pending.remove(&alice).is_empty());
    }
}
