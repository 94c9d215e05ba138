/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The acceptor half of a paxos instance.
//!
//! An [`Acceptor`] holds the state every member of a replica group keeps regardless of whether it is
//! coordinating:
//! 1. The highest ballot it has seen.
//! 2. The pvalues it has accepted that may not yet be garbage collected.
//! 3. The decisions it has learnt but not yet executed.
//! 4. The next slot to execute.
//!
//! The acceptor does no I/O. Its caller, the [instance](super::instance), is responsible for logging
//! whatever the acceptor reports as changed before replying to anyone.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use crate::types::{ballot::Ballot, data_types::Slot, pvalue::PValue};

use super::messages::{Accept, Prepare, PrepareReply};
use crate::types::data_types::NodeID;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum AcceptorState {
    Active,
    Stopped,
}

/// What the acceptor knows has been committed at a slot.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum Committed {
    /// The full decision.
    Decided(PValue),

    /// Only that *something* was committed in `Ballot`, learnt from a
    /// [`BatchedCommit`](super::messages::BatchedCommit) for a slot the acceptor did not accept a
    /// value for in that ballot.
    Meta(Ballot),
}

/// The effect of an [`Accept`] on the acceptor.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct AcceptOutcome {
    /// The acceptor's ballot after processing the accept. Higher than the accept's ballot iff the accept
    /// was refused.
    pub(crate) ballot: Ballot,
    pub(crate) accepted: bool,
    pub(crate) ballot_changed: bool,
    /// The new garbage collection slot, if the accept's median checkpointed slot advanced it.
    pub(crate) gc_advanced: Option<Slot>,
}

pub(crate) struct Acceptor {
    slot: Slot,
    ballot: Ballot,
    gc_slot: Option<Slot>,
    accepted: BTreeMap<Slot, PValue>,
    committed: BTreeMap<Slot, Committed>,
    state: AcceptorState,
    last_sync: Option<Instant>,
}

impl Acceptor {
    /// Create the acceptor of a freshly created paxos instance.
    pub(crate) fn new(initial_ballot: Ballot) -> Acceptor {
        Acceptor {
            slot: Slot::init(),
            ballot: initial_ballot,
            gc_slot: None,
            accepted: BTreeMap::new(),
            committed: BTreeMap::new(),
            state: AcceptorState::Active,
            last_sync: None,
        }
    }

    /// Create an acceptor from state reconstructed from the persistent log.
    pub(crate) fn recovered(
        ballot: Ballot,
        slot: Slot,
        gc_slot: Option<Slot>,
        accepted: BTreeMap<Slot, PValue>,
    ) -> Acceptor {
        let ballot = accepted
            .values()
            .map(|pvalue| pvalue.ballot)
            .fold(ballot, |max, ballot| max.max(ballot));
        let accepted = accepted
            .into_iter()
            .filter(|(slot, _)| gc_slot.map_or(true, |gc_slot| *slot > gc_slot))
            .collect();

        Acceptor {
            slot,
            ballot,
            gc_slot,
            accepted,
            committed: BTreeMap::new(),
            state: AcceptorState::Active,
            last_sync: None,
        }
    }

    /// Get the next slot to execute.
    pub(crate) fn slot(&self) -> Slot {
        self.slot
    }

    pub(crate) fn ballot(&self) -> Ballot {
        self.ballot
    }

    pub(crate) fn gc_slot(&self) -> Option<Slot> {
        self.gc_slot
    }

    pub(crate) fn is_stopped(&self) -> bool {
        self.state == AcceptorState::Stopped
    }

    pub(crate) fn accepted(&self) -> &BTreeMap<Slot, PValue> {
        &self.accepted
    }

    /// Phase 1b. Adopts the prepared ballot if it is strictly higher than the current one.
    ///
    /// Returns the reply and whether the ballot changed, or `None` if the acceptor is stopped.
    pub(crate) fn handle_prepare(
        &mut self,
        prepare: &Prepare,
        me: NodeID,
    ) -> Option<(PrepareReply, bool)> {
        if self.is_stopped() {
            return None;
        }

        let ballot_changed = prepare.ballot > self.ballot;
        if ballot_changed {
            self.ballot = prepare.ballot;
        }

        // Accepted values are only sent when not refusing.
        let accepted = if self.ballot > prepare.ballot {
            BTreeMap::new()
        } else {
            self.accepted
                .range(prepare.first_undecided_slot..)
                .map(|(slot, pvalue)| (*slot, pvalue.clone()))
                .collect()
        };

        let first_slot = match self.gc_slot {
            Some(gc_slot) => prepare.first_undecided_slot.max(gc_slot.next()),
            None => prepare.first_undecided_slot,
        };

        Some((
            PrepareReply {
                acceptor: me,
                ballot: self.ballot,
                accepted,
                first_slot,
            },
            ballot_changed,
        ))
    }

    /// Phase 2b. Accepts the accept's pvalue if its ballot is at least the current ballot, then garbage
    /// collects using the accept's median checkpointed slot.
    ///
    /// Returns `None` if the acceptor is stopped.
    pub(crate) fn accept_and_update_ballot(&mut self, accept: &Accept) -> Option<AcceptOutcome> {
        if self.is_stopped() {
            return None;
        }

        let pvalue = &accept.pvalue;
        let mut accepted = false;
        let mut ballot_changed = false;
        if pvalue.ballot >= self.ballot {
            ballot_changed = pvalue.ballot > self.ballot;
            self.ballot = pvalue.ballot;
            if self.gc_slot.map_or(true, |gc_slot| pvalue.slot > gc_slot) {
                self.accepted.insert(pvalue.slot, pvalue.clone());
            }
            accepted = true;

            // A commit notice may have overtaken this accept.
            if let Some(Committed::Meta(ballot)) = self.committed.get(&pvalue.slot) {
                if *ballot == pvalue.ballot {
                    self.committed
                        .insert(pvalue.slot, Committed::Decided(pvalue.clone()));
                }
            }
        }

        let gc_advanced = self.garbage_collect(accept.median_checkpointed_slot);

        Some(AcceptOutcome {
            ballot: self.ballot,
            accepted,
            ballot_changed,
            gc_advanced,
        })
    }

    /// Discard accepted pvalues at or below `median_checkpointed_slot`, but never any that has not been
    /// executed yet, since those may still be needed to reconstruct batched commits.
    ///
    /// Returns the new garbage collection slot if it advanced.
    pub(crate) fn garbage_collect(&mut self, median_checkpointed_slot: Option<Slot>) -> Option<Slot> {
        let median = median_checkpointed_slot?;
        let last_executed = self.slot.prev()?;
        let gc_slot = median.min(last_executed);

        if self.gc_slot.map_or(true, |current| gc_slot > current) {
            self.gc_slot = Some(gc_slot);
            self.accepted = self.accepted.split_off(&gc_slot.next());
            self.committed = self.committed.split_off(&self.slot);
            return Some(gc_slot);
        }
        None
    }

    /// Store a decision until it becomes executable. Returns `false` if the decision's slot has already
    /// been executed, or if the acceptor is stopped.
    pub(crate) fn put_decision(&mut self, decision: PValue) -> bool {
        if self.is_stopped() || decision.slot < self.slot {
            return false;
        }
        self.committed
            .insert(decision.slot, Committed::Decided(decision));
        true
    }

    /// Record that something was committed at `slot` in `ballot` without knowing what.
    pub(crate) fn put_meta_decision(&mut self, slot: Slot, ballot: Ballot) {
        if self.is_stopped() || slot < self.slot {
            return;
        }
        if let Some(Committed::Decided(_)) = self.committed.get(&slot) {
            return;
        }
        self.committed.insert(slot, Committed::Meta(ballot));
    }

    /// Rebuild the decision for `slot` from the value accepted at `slot`, if that value was accepted in
    /// the committing `ballot`.
    pub(crate) fn reconstruct_decision(&self, slot: Slot, ballot: Ballot) -> Option<PValue> {
        self.accepted
            .get(&slot)
            .filter(|pvalue| pvalue.ballot == ballot)
            .cloned()
    }

    /// Get the decision for the next slot to execute, if it has been learnt.
    pub(crate) fn next_executable(&self) -> Option<&PValue> {
        if self.is_stopped() {
            return None;
        }
        match self.committed.get(&self.slot) {
            Some(Committed::Decided(pvalue)) => Some(pvalue),
            _ => None,
        }
    }

    /// Mark `slot` as executed. Executing a stop stops the acceptor.
    pub(crate) fn executed(&mut self, slot: Slot, stop: bool) {
        if slot != self.slot {
            return;
        }
        self.committed.remove(&slot);
        self.slot = slot.next();
        if stop {
            self.state = AcceptorState::Stopped;
            self.committed.clear();
        }
    }

    /// Stop without executing a stop, after installing a checkpoint taken right after one.
    pub(crate) fn stop(&mut self) {
        self.state = AcceptorState::Stopped;
        self.committed.clear();
    }

    /// Skip ahead to `slot` after a checkpoint covering everything before it has been restored.
    pub(crate) fn jump_slot(&mut self, slot: Slot) {
        if slot <= self.slot {
            return;
        }
        self.slot = slot;
        self.committed = self.committed.split_off(&slot);
    }

    /// Get the highest slot known to be committed, or the last executed slot if no decision is
    /// pending.
    pub(crate) fn max_committed_slot(&self) -> Option<Slot> {
        match self.committed.keys().next_back() {
            Some(slot) => Some(*slot),
            None => self.slot.prev(),
        }
    }

    /// Get up to `size_limit` slots, from the next slot to execute up to the max committed slot, that
    /// have no usable decision.
    pub(crate) fn missing_committed_slots(&self, size_limit: u64) -> Vec<Slot> {
        let max_committed = match self.max_committed_slot() {
            Some(slot) if slot >= self.slot => slot,
            _ => return Vec::new(),
        };

        let mut missing = Vec::new();
        let mut slot = self.slot;
        while slot <= max_committed && (missing.len() as u64) < size_limit {
            match self.committed.get(&slot) {
                Some(Committed::Decided(_)) => {}
                Some(Committed::Meta(ballot)) => {
                    if self.reconstruct_decision(slot, *ballot).is_none() {
                        missing.push(slot)
                    }
                }
                None => missing.push(slot),
            }
            slot = slot.next();
        }
        missing
    }

    /// Whether at least `min_resync_delay` has passed since the last sync request.
    pub(crate) fn can_sync(&self, min_resync_delay: Duration, now: Instant) -> bool {
        self.last_sync
            .map_or(true, |last_sync| now.duration_since(last_sync) >= min_resync_delay)
    }

    pub(crate) fn just_synced(&mut self, now: Instant) {
        self.last_sync = Some(now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{
        data_types::{ClientID, RequestID},
        request::Request,
    };

    fn ballot(number: u32, coordinator: u32) -> Ballot {
        Ballot::new(number, NodeID::new(coordinator))
    }

    fn pvalue(slot: u64, ballot: Ballot, id: u64) -> PValue {
        PValue::new(
            Slot::new(slot),
            ballot,
            Request::new(RequestID::new(id), ClientID::new(0), Vec::<u8>::new()),
        )
    }

    fn accept(pvalue: PValue, median: Option<u64>) -> Accept {
        Accept {
            sender: pvalue.ballot.coordinator,
            pvalue,
            median_checkpointed_slot: median.map(Slot::new),
        }
    }

    fn prepare(ballot: Ballot, first_undecided_slot: u64) -> Prepare {
        Prepare {
            ballot,
            first_undecided_slot: Slot::new(first_undecided_slot),
            recovery: false,
        }
    }

    #[test]
    fn prepare_adopts_only_strictly_higher_ballots() {
        let mut acceptor = Acceptor::new(ballot(0, 2));
        acceptor.accept_and_update_ballot(&accept(pvalue(5, ballot(0, 2), 1), None));

        let (reply, changed) = acceptor.handle_prepare(&prepare(ballot(1, 3), 0), NodeID::new(1)).unwrap();
        assert!(changed);
        assert_eq!(reply.ballot, ballot(1, 3));
        assert_eq!(reply.accepted.len(), 1);
        assert_eq!(reply.accepted[&Slot::new(5)].ballot, ballot(0, 2));

        // A lower prepare is refused with the current ballot and no accepted values.
        let (reply, changed) = acceptor.handle_prepare(&prepare(ballot(1, 0), 0), NodeID::new(1)).unwrap();
        assert!(!changed);
        assert_eq!(reply.ballot, ballot(1, 3));
        assert!(reply.accepted.is_empty());
    }

    #[test]
    fn prepare_prunes_values_below_first_undecided_slot() {
        let mut acceptor = Acceptor::new(ballot(0, 2));
        for slot in 0..4 {
            acceptor.accept_and_update_ballot(&accept(pvalue(slot, ballot(0, 2), slot), None));
        }
        let (reply, _) = acceptor.handle_prepare(&prepare(ballot(1, 1), 2), NodeID::new(1)).unwrap();
        assert_eq!(
            reply.accepted.keys().copied().collect::<Vec<_>>(),
            vec![Slot::new(2), Slot::new(3)]
        );
        assert_eq!(reply.first_slot, Slot::new(2));
    }

    #[test]
    fn accept_never_goes_below_current_ballot() {
        let mut acceptor = Acceptor::new(ballot(0, 2));
        acceptor.handle_prepare(&prepare(ballot(3, 1), 0), NodeID::new(4));

        let outcome = acceptor
            .accept_and_update_ballot(&accept(pvalue(0, ballot(2, 2), 1), None))
            .unwrap();
        assert!(!outcome.accepted);
        assert_eq!(outcome.ballot, ballot(3, 1));
        assert!(acceptor.accepted().is_empty());

        let outcome = acceptor
            .accept_and_update_ballot(&accept(pvalue(0, ballot(4, 0), 1), None))
            .unwrap();
        assert!(outcome.accepted);
        assert!(outcome.ballot_changed);
        assert_eq!(acceptor.ballot(), ballot(4, 0));
    }

    #[test]
    fn decisions_execute_strictly_in_order() {
        let mut acceptor = Acceptor::new(ballot(0, 1));
        assert!(acceptor.put_decision(pvalue(1, ballot(0, 1), 11)));
        assert!(acceptor.next_executable().is_none());

        assert!(acceptor.put_decision(pvalue(0, ballot(0, 1), 10)));
        let next = acceptor.next_executable().cloned().unwrap();
        assert_eq!(next.slot, Slot::new(0));
        acceptor.executed(next.slot, false);

        let next = acceptor.next_executable().cloned().unwrap();
        assert_eq!(next.slot, Slot::new(1));
        acceptor.executed(next.slot, false);
        assert_eq!(acceptor.slot(), Slot::new(2));

        // Duplicates of executed decisions are discarded.
        assert!(!acceptor.put_decision(pvalue(0, ballot(0, 1), 10)));
    }

    #[test]
    fn meta_decisions_are_missing_until_reconstructible() {
        let mut acceptor = Acceptor::new(ballot(0, 1));
        acceptor.put_meta_decision(Slot::new(0), ballot(0, 1));
        acceptor.put_meta_decision(Slot::new(2), ballot(0, 1));
        assert_eq!(
            acceptor.missing_committed_slots(10),
            vec![Slot::new(0), Slot::new(1), Slot::new(2)]
        );

        // The accept arrives late: slot 0 becomes a full decision.
        acceptor.accept_and_update_ballot(&accept(pvalue(0, ballot(0, 1), 5), None));
        assert_eq!(acceptor.next_executable().map(|p| p.slot), Some(Slot::new(0)));
        assert_eq!(
            acceptor.missing_committed_slots(1),
            vec![Slot::new(1)]
        );
    }

    #[test]
    fn garbage_collection_keeps_unexecuted_values() {
        let mut acceptor = Acceptor::new(ballot(0, 1));
        for slot in 0..6 {
            acceptor.accept_and_update_ballot(&accept(pvalue(slot, ballot(0, 1), slot), None));
        }
        for slot in 0..3 {
            acceptor.put_decision(pvalue(slot, ballot(0, 1), slot));
            acceptor.executed(Slot::new(slot), false);
        }

        // The median is ahead of what this acceptor executed.
        let gc = acceptor.garbage_collect(Some(Slot::new(5)));
        assert_eq!(gc, Some(Slot::new(2)));
        assert_eq!(
            acceptor.accepted().keys().copied().collect::<Vec<_>>(),
            vec![Slot::new(3), Slot::new(4), Slot::new(5)]
        );
        assert_eq!(acceptor.garbage_collect(Some(Slot::new(1))), None);
    }

    #[test]
    fn stop_decision_stops_the_acceptor() {
        let mut acceptor = Acceptor::new(ballot(0, 1));
        let stop = PValue::new(
            Slot::new(0),
            ballot(0, 1),
            Request::stop(RequestID::new(1), ClientID::new(0), Vec::<u8>::new()),
        );
        acceptor.put_decision(stop);
        acceptor.put_decision(pvalue(1, ballot(0, 1), 2));
        acceptor.executed(Slot::new(0), true);

        assert!(acceptor.is_stopped());
        assert!(acceptor.next_executable().is_none());
        assert!(acceptor
            .handle_prepare(&prepare(ballot(9, 9), 0), NodeID::new(1))
            .is_none());
    }
}
