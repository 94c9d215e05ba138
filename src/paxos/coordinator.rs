/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The coordinator (proposer) half of a paxos instance.
//!
//! A replica holds a [`Coordinator`] only while it believes it owns, or is trying to own, the current
//! ballot. The coordinator goes through two phases:
//!
//! ## Preparing
//!
//! The coordinator has sent [`Prepare`](super::messages::Prepare) for its ballot and is collecting
//! [`PrepareReply`]s. Requests proposed while preparing become *pre-active* proposals: they get a slot
//! but are not sent out. Every reply contributes the values its sender accepted; for every slot the
//! value accepted in the highest ballot is kept as a *carryover*.
//!
//! ## Active
//!
//! Once a majority has replied, carryovers are combined with the pre-active proposals (carryovers
//! win, gaps are filled with no-ops, displaced pre-actives get fresh slots), and every resulting
//! proposal is sent out in an [`Accept`](super::messages::Accept) under the coordinator's ballot. From
//! then on, new requests are assigned the next free slot and sent out immediately. A slot is decided
//! when a majority of the group has acknowledged its accept.
//!
//! ## Preemption
//!
//! A reply carrying a higher ballot means that someone else has taken over. The coordinator abandons
//! the affected proposal, and once no proposal is left (or immediately, if it was still preparing), it
//! resigns.

use std::collections::{BTreeMap, BTreeSet};
use std::time::{Duration, Instant};

use crate::types::{
    ballot::Ballot,
    data_types::{ClientID, NodeID, RequestID, Slot},
    pvalue::PValue,
    replica_group::ReplicaGroup,
    request::Request,
};

use super::gc::median_checkpointed_slot;
use super::messages::{AcceptReply, PrepareReply};

/// Factor by which retransmission timeouts grow with every retransmission.
pub(crate) const RETRANSMISSION_BACKOFF: f64 = 1.5;

/// Retransmissions past this many stop growing the timeout any further.
pub(crate) const MAX_BACKOFF_EXPONENT: u32 = 20;

/// Tracks which members have replied to one round of messages.
pub(crate) struct WaitFor {
    heard: BTreeSet<NodeID>,
    majority: usize,
    last_sent: Instant,
    retransmissions: u32,
}

impl WaitFor {
    pub(crate) fn new(group: &ReplicaGroup, now: Instant) -> WaitFor {
        WaitFor {
            heard: BTreeSet::new(),
            majority: group.majority(),
            last_sent: now,
            retransmissions: 0,
        }
    }

    pub(crate) fn update_heard_from(&mut self, node: NodeID) {
        self.heard.insert(node);
    }

    pub(crate) fn heard_from_majority(&self) -> bool {
        self.heard.len() >= self.majority
    }

    pub(crate) fn heard(&self) -> Vec<NodeID> {
        self.heard.iter().copied().collect()
    }

    pub(crate) fn not_heard_from(&self, group: &ReplicaGroup) -> Vec<NodeID> {
        group
            .members()
            .filter(|member| !self.heard.contains(member))
            .copied()
            .collect()
    }

    /// Whether the round should be retransmitted, given that the first retransmission is due
    /// `timeout` after the round was first sent.
    pub(crate) fn retransmission_due(&self, timeout: Duration, now: Instant) -> bool {
        let exponent = self.retransmissions.min(MAX_BACKOFF_EXPONENT) as i32;
        let timeout = Duration::try_from_secs_f64(timeout.as_secs_f64() * RETRANSMISSION_BACKOFF.powi(exponent))
            .unwrap_or(Duration::MAX);
        now.saturating_duration_since(self.last_sent) >= timeout
    }

    pub(crate) fn retransmitted(&mut self, now: Instant) {
        self.last_sent = now;
        self.retransmissions += 1;
    }
}

struct ProposalState {
    pvalue: PValue,
    waitfor: WaitFor,
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum PrepareReplyOutcome {
    /// The reply is stale, from a non-member, or arrived after the coordinator became active.
    Ignored,
    /// Someone holds a higher ballot.
    Preempted(Ballot),
    Waiting,
    /// A majority has promised. Contains every proposal to send out, in slot order.
    Active(Vec<PValue>),
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum AcceptReplyOutcome {
    Ignored,
    /// The proposal at the reply's slot lost to `ballot`. `resign` is set if no proposal is left.
    Preempted { ballot: Ballot, resign: bool },
    Waiting,
    /// A majority acknowledged `pvalue`. `acknowledged` lists who did, so they only need to be told
    /// about the commit.
    Decided {
        pvalue: PValue,
        acknowledged: Vec<NodeID>,
    },
}

/// A retransmission the coordinator wants to make.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Retransmission {
    Prepare {
        recipients: Vec<NodeID>,
        first_undecided_slot: Slot,
    },
    Accept {
        recipients: Vec<NodeID>,
        pvalue: PValue,
    },
}

pub(crate) struct Coordinator {
    ballot: Ballot,
    active: bool,
    next_proposal_slot: Slot,
    first_undecided_slot: Slot,
    proposals: BTreeMap<Slot, ProposalState>,
    carryover: BTreeMap<Slot, PValue>,
    carryover_first_slots: BTreeMap<NodeID, Slot>,
    waitfor_prepare: WaitFor,
    node_checkpointed_slots: BTreeMap<NodeID, Option<Slot>>,
    stop_proposed: bool,
    /// Requests waiting for the number of undecided proposals to drop, to be proposed as one batch.
    queued: Vec<Request>,
}

impl Coordinator {
    /// Create a coordinator for `ballot`. `next_slot` is the first slot the local acceptor has not
    /// executed.
    ///
    /// Only the initial coordinator of a freshly created instance starts out `active`: every acceptor
    /// of a new instance starts out having promised the initial ballot.
    pub(crate) fn new(
        ballot: Ballot,
        next_slot: Slot,
        group: &ReplicaGroup,
        active: bool,
        now: Instant,
    ) -> Coordinator {
        Coordinator {
            ballot,
            active,
            next_proposal_slot: next_slot,
            first_undecided_slot: next_slot,
            proposals: BTreeMap::new(),
            carryover: BTreeMap::new(),
            carryover_first_slots: BTreeMap::new(),
            waitfor_prepare: WaitFor::new(group, now),
            node_checkpointed_slots: group.members().map(|member| (*member, None)).collect(),
            stop_proposed: false,
            queued: Vec::new(),
        }
    }

    pub(crate) fn ballot(&self) -> Ballot {
        self.ballot
    }

    pub(crate) fn is_active(&self) -> bool {
        self.active
    }

    pub(crate) fn first_undecided_slot(&self) -> Slot {
        self.first_undecided_slot
    }

    pub(crate) fn has_proposals(&self) -> bool {
        !self.proposals.is_empty()
    }

    /// Whether a request with the same client and ID is queued or waiting for a majority, on its own
    /// or batched with others.
    pub(crate) fn is_proposed(&self, client: ClientID, id: RequestID) -> bool {
        let same = |request: &Request| !request.is_no_op() && request.client == client && request.id == id;
        self.proposals
            .values()
            .flat_map(|proposal| proposal.pvalue.request.requests())
            .chain(self.queued.iter())
            .any(same)
    }

    /// Get the requests of every proposal that is not yet decided, in slot order, followed by the
    /// queued requests. No-ops are left out.
    pub(crate) fn undecided_requests(&self) -> Vec<Request> {
        self.proposals
            .values()
            .map(|proposal| proposal.pvalue.request.clone())
            .filter(|request| !request.is_no_op())
            .chain(self.queued.iter().cloned())
            .collect()
    }

    pub(crate) fn queued(&self) -> usize {
        self.queued.len()
    }

    /// Propose `request` right away if fewer than `max_inflight` proposals await a decision. Otherwise
    /// queue it, to be proposed later in a batch of up to `max_batch` requests.
    ///
    /// Only an active coordinator queues. A stop is never queued or batched: it first pushes out
    /// everything queued before it, regardless of `max_inflight`.
    pub(crate) fn propose_or_queue(
        &mut self,
        request: Request,
        group: &ReplicaGroup,
        max_inflight: usize,
        max_batch: usize,
        now: Instant,
    ) -> Vec<PValue> {
        if !self.active || self.stop_proposed {
            return self.propose(request, group, now).into_iter().collect();
        }
        if request.is_stop() {
            let mut pvalues = self.propose_queued(group, usize::MAX, max_batch, now);
            pvalues.extend(self.propose(request, group, now));
            return pvalues;
        }
        self.queued.push(request);
        self.propose_queued(group, max_inflight, max_batch, now)
    }

    /// Propose queued requests, up to `max_batch` of them per slot, while fewer than `max_inflight`
    /// proposals await a decision.
    pub(crate) fn propose_queued(
        &mut self,
        group: &ReplicaGroup,
        max_inflight: usize,
        max_batch: usize,
        now: Instant,
    ) -> Vec<PValue> {
        let mut pvalues = Vec::new();
        if !self.active {
            return pvalues;
        }
        while !self.queued.is_empty() && self.proposals.len() < max_inflight.max(1) {
            let take = self.queued.len().min(max_batch.max(1));
            let requests: Vec<Request> = self.queued.drain(..take).collect();
            let Some(batch) = Request::batch(requests) else {
                break;
            };
            pvalues.extend(self.propose(batch, group, now));
        }
        pvalues
    }

    /// Assign `request` the next free slot.
    ///
    /// Returns the pvalue to send out in an accept if the coordinator is active. Returns `None` if it is
    /// still preparing (the proposal is kept as a pre-active proposal) or if a stop has already been
    /// proposed (the request is dropped: nothing may follow a stop).
    pub(crate) fn propose(&mut self, request: Request, group: &ReplicaGroup, now: Instant) -> Option<PValue> {
        if self.stop_proposed {
            log::debug!("Coordinator {} dropping {:?} proposed after a stop", self.ballot, request);
            return None;
        }

        let slot = self.next_proposal_slot;
        self.next_proposal_slot = slot.next();
        if request.is_stop() {
            self.stop_proposed = true;
        }

        let pvalue = PValue::new(slot, self.ballot, request);
        self.proposals.insert(
            slot,
            ProposalState {
                pvalue: pvalue.clone(),
                waitfor: WaitFor::new(group, now),
            },
        );

        if self.active {
            Some(pvalue)
        } else {
            None
        }
    }

    /// Phase 1b, at the coordinator.
    pub(crate) fn handle_prepare_reply(
        &mut self,
        reply: &PrepareReply,
        group: &ReplicaGroup,
        now: Instant,
    ) -> PrepareReplyOutcome {
        if reply.ballot > self.ballot {
            return PrepareReplyOutcome::Preempted(reply.ballot);
        }
        if reply.ballot < self.ballot || self.active || !group.contains(&reply.acceptor) {
            return PrepareReplyOutcome::Ignored;
        }

        let first_slot = self
            .carryover_first_slots
            .entry(reply.acceptor)
            .or_insert(reply.first_slot);
        *first_slot = (*first_slot).max(reply.first_slot);

        for (slot, pvalue) in &reply.accepted {
            match self.carryover.get(slot) {
                Some(existing) if existing.ballot >= pvalue.ballot => {}
                Some(existing) => {
                    log::info!(
                        "Coordinator {} dropping overwritten carryover {:?}",
                        self.ballot,
                        existing
                    );
                    self.carryover.insert(*slot, pvalue.clone());
                }
                None => {
                    self.carryover.insert(*slot, pvalue.clone());
                }
            }
        }

        self.waitfor_prepare.update_heard_from(reply.acceptor);
        if !self.waitfor_prepare.heard_from_majority() {
            return PrepareReplyOutcome::Waiting;
        }

        self.combine_pvalues_onto_proposals(group, now);
        self.active = true;

        let ballot = self.ballot;
        let accepts = self
            .proposals
            .values_mut()
            .map(|proposal| {
                proposal.pvalue = proposal.pvalue.with_ballot(ballot);
                proposal.waitfor = WaitFor::new(group, now);
                proposal.pvalue.clone()
            })
            .collect();
        PrepareReplyOutcome::Active(accepts)
    }

    /// Combine carryovers with pre-active proposals: carryovers dominate, pre-actives keep their slot
    /// otherwise, and remaining gaps are filled with no-ops. Pre-actives that lost their slot are
    /// proposed again at fresh slots.
    fn combine_pvalues_onto_proposals(&mut self, group: &ReplicaGroup, now: Instant) {
        let max_min_carryover_slot = self
            .carryover_first_slots
            .values()
            .max()
            .copied()
            .unwrap_or(self.first_undecided_slot);
        let max_carryover_slot = self
            .carryover
            .keys()
            .next_back()
            .copied()
            .filter(|slot| *slot >= max_min_carryover_slot);

        let mut pre_actives = std::mem::take(&mut self.proposals);
        let carryover = std::mem::take(&mut self.carryover);

        if let Some(max_carryover_slot) = max_carryover_slot {
            let mut slot = max_min_carryover_slot;
            while slot <= max_carryover_slot {
                let pvalue = match carryover.get(&slot) {
                    Some(carried) => carried.clone(),
                    None => match pre_actives.remove(&slot) {
                        Some(pre_active) => pre_active.pvalue,
                        None => PValue::no_op(slot, self.ballot),
                    },
                };
                self.proposals.insert(
                    slot,
                    ProposalState {
                        pvalue,
                        waitfor: WaitFor::new(group, now),
                    },
                );
                slot = slot.next();
            }
            self.next_proposal_slot = max_carryover_slot.next();
        } else {
            self.next_proposal_slot = max_min_carryover_slot;
        }

        // Stop requests among the carryovers are dealt with below.
        self.stop_proposed = false;
        for (_, preempted) in pre_actives {
            let slot = self.next_proposal_slot;
            self.next_proposal_slot = slot.next();
            let pvalue = PValue::new(slot, self.ballot, preempted.pvalue.request);
            self.proposals.insert(
                slot,
                ProposalState {
                    pvalue,
                    waitfor: WaitFor::new(group, now),
                },
            );
        }

        self.process_stop(group, now);
    }

    /// Make sure that no regular request follows a stop. A request after a stop of a higher ballot
    /// becomes that stop; a stop followed by a request of a higher ballot becomes a no-op.
    fn process_stop(&mut self, group: &ReplicaGroup, now: Instant) {
        let stops: Vec<PValue> = self
            .proposals
            .values()
            .filter(|proposal| proposal.pvalue.is_stop())
            .map(|proposal| proposal.pvalue.clone())
            .collect();
        if stops.is_empty() {
            return;
        }

        for stop in &stops {
            let later: Vec<Slot> = self
                .proposals
                .range(stop.slot.next()..)
                .filter(|(_, proposal)| {
                    !proposal.pvalue.is_stop() && !proposal.pvalue.request.is_no_op()
                })
                .map(|(slot, _)| *slot)
                .collect();

            for slot in later {
                let Some(proposal) = self.proposals.get_mut(&slot) else {
                    continue;
                };
                if stop.ballot >= proposal.pvalue.ballot {
                    log::debug!("Coordinator {} converting slot {} to a stop", self.ballot, slot);
                    proposal.pvalue = PValue::new(slot, self.ballot, stop.request.clone());
                } else {
                    log::debug!(
                        "Coordinator {} converting stop at slot {} to a no-op",
                        self.ballot,
                        stop.slot
                    );
                    if let Some(stopped) = self.proposals.get_mut(&stop.slot) {
                        stopped.pvalue = PValue::no_op(stop.slot, self.ballot);
                    }
                    break;
                }
            }
        }

        let last_is_stop = self
            .proposals
            .values()
            .next_back()
            .map_or(false, |proposal| proposal.pvalue.is_stop());
        if last_is_stop {
            self.stop_proposed = true;
        } else {
            let stop = stops[0].request.clone();
            self.propose(stop, group, now);
        }
    }

    /// Phase 2b, at the coordinator.
    pub(crate) fn handle_accept_reply(&mut self, reply: &AcceptReply, group: &ReplicaGroup) -> AcceptReplyOutcome {
        if !group.contains(&reply.acceptor) {
            return AcceptReplyOutcome::Ignored;
        }
        self.record_checkpointed_slot(reply.acceptor, reply.max_checkpointed_slot);

        if reply.ballot > self.ballot {
            self.proposals.remove(&reply.slot);
            return AcceptReplyOutcome::Preempted {
                ballot: reply.ballot,
                resign: self.proposals.is_empty(),
            };
        }
        if reply.ballot < self.ballot || !self.active {
            return AcceptReplyOutcome::Ignored;
        }

        let Some(proposal) = self.proposals.get_mut(&reply.slot) else {
            // Already decided.
            return AcceptReplyOutcome::Ignored;
        };
        proposal.waitfor.update_heard_from(reply.acceptor);
        if !proposal.waitfor.heard_from_majority() {
            return AcceptReplyOutcome::Waiting;
        }

        match self.proposals.remove(&reply.slot) {
            Some(decided) => AcceptReplyOutcome::Decided {
                acknowledged: decided.waitfor.heard(),
                pvalue: decided.pvalue,
            },
            None => AcceptReplyOutcome::Ignored,
        }
    }

    fn record_checkpointed_slot(&mut self, node: NodeID, checkpointed: Option<Slot>) {
        if let Some(current) = self.node_checkpointed_slots.get_mut(&node) {
            if checkpointed > *current {
                *current = checkpointed;
            }
        }
    }

    /// Get the highest slot that a majority of the group is known to have checkpointed.
    pub(crate) fn median_checkpointed_slot(&self) -> Option<Slot> {
        let reports: Vec<Option<Slot>> = self.node_checkpointed_slots.values().copied().collect();
        median_checkpointed_slot(&reports)
    }

    /// Collect the retransmissions that are due: the prepare, if still preparing, or the accepts that
    /// have not been acknowledged by a majority.
    pub(crate) fn retransmissions(
        &mut self,
        group: &ReplicaGroup,
        prepare_timeout: Duration,
        accept_timeout: Duration,
        now: Instant,
    ) -> Vec<Retransmission> {
        if !self.active {
            if !self.waitfor_prepare.retransmission_due(prepare_timeout, now) {
                return Vec::new();
            }
            self.waitfor_prepare.retransmitted(now);
            return vec![Retransmission::Prepare {
                recipients: self.waitfor_prepare.not_heard_from(group),
                first_undecided_slot: self.first_undecided_slot,
            }];
        }

        self.proposals
            .values_mut()
            .filter(|proposal| proposal.waitfor.retransmission_due(accept_timeout, now))
            .map(|proposal| {
                proposal.waitfor.retransmitted(now);
                Retransmission::Accept {
                    recipients: proposal.waitfor.not_heard_from(group),
                    pvalue: proposal.pvalue.clone(),
                }
            })
            .collect()
    }
}
