/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The state machine of one paxos instance at one replica.
//!
//! A [`PaxosInstance`] ties together the instance's [acceptor](super::acceptor), its
//! [coordinator](super::coordinator) (if this replica is running for or acting as one), the
//! persistent [logger](crate::logger), and the [app](crate::app).
//!
//! ## Inputs
//!
//! An instance is driven by three kinds of input:
//! 1. [Packets](PaxosInstance::handle_packet) from other members of its replica group.
//! 2. [Requests](PaxosInstance::propose) proposed at this replica.
//! 3. [Timer ticks](PaxosInstance::tick), which drive coordinator election, retransmissions, sync and
//!    the retrying of outstanding requests.
//!
//! Each returns the messages to send. Messages addressed to this replica itself are handled before
//! returning, and never leave the instance.
//!
//! ## Durability
//!
//! Every promise, accepted pvalue and decision is logged before the acceptor replies or the decision is
//! executed. If logging fails, the instance does not reply: peers retransmit, and safety never depends
//! on a record that did not reach the log.

use std::collections::{BTreeMap, BTreeSet};
use std::mem;
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant, SystemTime};

use rand::seq::SliceRandom;

use crate::app::App;
use crate::events::*;
use crate::failure_detection::FailureDetector;
use crate::logger::{records::LogRecord, recovery::RecoveredInstance, PaxosLogger};
use crate::types::{
    ballot::Ballot,
    checkpoint::Checkpoint,
    data_types::{ClientID, NodeID, PaxosID, RequestID, Slot, Version},
    pvalue::PValue,
    replica_group::ReplicaGroup,
    request::Request,
    tombstone::Tombstone,
};

use super::acceptor::Acceptor;
use super::coordinator::{AcceptReplyOutcome, Coordinator, PrepareReplyOutcome, Retransmission};
use super::gc;
use super::messages::*;
use super::{InstanceStatus, MessagingTask};

/// The parameters every instance of a replica shares.
#[derive(Clone, Debug)]
pub(crate) struct InstanceConfiguration {
    pub(crate) me: NodeID,
    pub(crate) checkpoint_interval: u64,
    pub(crate) sync_threshold: u64,
    pub(crate) max_sync_decisions_gap: u64,
    pub(crate) min_resync_delay: Duration,
    pub(crate) prepare_timeout: Duration,
    pub(crate) accept_timeout: Duration,
    pub(crate) request_timeout: Duration,
    pub(crate) max_request_retries: u32,
    pub(crate) max_inflight_proposals: usize,
    pub(crate) max_batch_requests: usize,
}

/// Reminders of a stop back off up to `request_timeout` times two to this power.
const MAX_STOP_REMINDER_EXPONENT: u32 = 6;

/// Everything an instance needs from the replica it runs in.
pub(crate) struct InstanceContext<A: App> {
    pub(crate) config: InstanceConfiguration,
    pub(crate) app: Arc<Mutex<A>>,
    pub(crate) logger: Arc<PaxosLogger>,
    pub(crate) event_publisher: Option<Sender<Event>>,
}

impl<A: App> Clone for InstanceContext<A> {
    fn clone(&self) -> Self {
        InstanceContext {
            config: self.config.clone(),
            app: self.app.clone(),
            logger: self.logger.clone(),
            event_publisher: self.event_publisher.clone(),
        }
    }
}

/// How eagerly to ask a peer for missing decisions.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum SyncMode {
    /// Only if the gap reaches the threshold, or the instance has barely started.
    Default,
    /// Whenever anything at all is missing.
    NonzeroGap,
    Force,
}

/// Whether an instance whose next slot to execute is `next_slot`, and which knows of commits up to
/// `max_committed`, should sync with a peer.
pub(crate) fn should_sync(next_slot: Slot, max_committed: Option<Slot>, threshold: u64, mode: SyncMode) -> bool {
    let expected = next_slot.int() as i64;
    let max_committed = max_committed.map_or(-1, |slot| slot.int() as i64);
    let gap = max_committed - expected;

    gap >= threshold as i64
        || ((expected == 0 || expected == 1) && (gap > 0 || threshold <= 1))
        || (mode == SyncMode::NonzeroGap && gap > 0)
        || mode == SyncMode::Force
}

/// A request proposed at this replica that has not been executed yet.
struct Outstanding {
    request: Request,
    last_forwarded: Instant,
    retries: u32,
}

pub(crate) struct PaxosInstance<A: App> {
    paxos_id: PaxosID,
    version: Version,
    group: ReplicaGroup,
    context: InstanceContext<A>,
    acceptor: Acceptor,
    coordinator: Option<Coordinator>,
    outstanding: BTreeMap<(ClientID, RequestID), Outstanding>,
    stop: Option<PValue>,
    /// When the other members were last reminded of the stop, and how often they have been.
    stop_reminded: Option<(Instant, u32)>,
}

impl<A: App> PaxosInstance<A> {
    /// Create a fresh instance. Every acceptor starts out having promised the initial ballot,
    /// `(0, rr(0))`, so its coordinator starts out active.
    pub(crate) fn new(
        paxos_id: PaxosID,
        version: Version,
        group: ReplicaGroup,
        context: InstanceContext<A>,
        now: Instant,
    ) -> PaxosInstance<A> {
        let me = context.config.me;
        let initial_ballot = initial_ballot(&paxos_id, &group, me);
        let coordinator = if initial_ballot.coordinator == me {
            Some(Coordinator::new(initial_ballot, Slot::init(), &group, true, now))
        } else {
            None
        };

        let instance = PaxosInstance {
            paxos_id,
            version,
            group,
            context,
            acceptor: Acceptor::new(initial_ballot),
            coordinator,
            outstanding: BTreeMap::new(),
            stop: None,
            stop_reminded: None,
        };

        if !instance.lock_app().restore(&instance.paxos_id, None) {
            log::warn!("App could not reset the state of {}", instance.paxos_id);
        }
        instance.publish(Event::CreateInstance(CreateInstanceEvent {
            timestamp: SystemTime::now(),
            paxos_id: instance.paxos_id.clone(),
            version: instance.version,
            group: instance.group.clone(),
        }));
        instance
    }

    /// Restart an instance from its logged state, without sending anything.
    ///
    /// The instance holds no coordinator state, even if its ballot names this replica: it has to run
    /// for coordinator again, since it may have forgotten proposals it made before the restart.
    pub(crate) fn recovered(recovered: RecoveredInstance, context: InstanceContext<A>) -> PaxosInstance<A> {
        let RecoveredInstance {
            paxos_id,
            version,
            group,
            ballot,
            last_executed,
            gc_slot,
            accepted,
            decisions,
            checkpoint,
        } = recovered;

        let me = context.config.me;
        let ballot = ballot.unwrap_or_else(|| initial_ballot(&paxos_id, &group, me));
        let next_slot = last_executed.map_or(Slot::init(), |slot| slot.next());
        let mut instance = PaxosInstance {
            acceptor: Acceptor::recovered(ballot, next_slot, gc_slot, accepted),
            paxos_id,
            version,
            group,
            context,
            coordinator: None,
            outstanding: BTreeMap::new(),
            stop: None,
            stop_reminded: None,
        };

        // 1. Install the checkpoint if it is ahead of what was executed here.
        if let Some(checkpoint) = checkpoint {
            if checkpoint.slot >= instance.acceptor.slot() {
                if instance.lock_app().restore(&instance.paxos_id, Some(&checkpoint.state)) {
                    instance.acceptor.jump_slot(checkpoint.slot.next());
                } else {
                    log::warn!(
                        "App could not restore the checkpoint of {} at slot {}",
                        instance.paxos_id,
                        checkpoint.slot
                    );
                }
            }
        }

        // 2. Execute the decisions that were logged but not executed.
        for (_, decision) in decisions {
            instance.acceptor.put_decision(decision);
        }
        instance.extract_execute_and_checkpoint();

        instance.publish(Event::RecoverInstance(RecoverInstanceEvent {
            timestamp: SystemTime::now(),
            paxos_id: instance.paxos_id.clone(),
            version: instance.version,
            ballot: instance.acceptor.ballot(),
            next_slot: instance.acceptor.slot(),
        }));
        instance
    }

    pub(crate) fn paxos_id(&self) -> &PaxosID {
        &self.paxos_id
    }

    pub(crate) fn version(&self) -> Version {
        self.version
    }

    pub(crate) fn group(&self) -> &ReplicaGroup {
        &self.group
    }

    pub(crate) fn is_stopped(&self) -> bool {
        self.acceptor.is_stopped()
    }

    pub(crate) fn status(&self) -> InstanceStatus {
        InstanceStatus {
            version: self.version,
            group: self.group.clone(),
            ballot: self.acceptor.ballot(),
            next_slot: self.acceptor.slot(),
            gc_slot: self.acceptor.gc_slot(),
            coordinator_active: self
                .coordinator
                .as_ref()
                .map_or(false, |coordinator| coordinator.is_active()),
            stopped: self.is_stopped(),
        }
    }

    /// Get what remains of this instance, if it is stopped.
    pub(crate) fn tombstone(&self) -> Option<Tombstone> {
        if !self.is_stopped() {
            return None;
        }
        Some(Tombstone {
            paxos_id: self.paxos_id.clone(),
            version: self.version,
            group: self.group.clone(),
            stop: self.stop.clone(),
        })
    }

    /// Propose `request`, which entered the system at this replica. The request is remembered until it
    /// is executed, and forwarded again if that takes too long.
    pub(crate) fn propose(&mut self, request: Request, now: Instant) -> Vec<MessagingTask> {
        let mut out = Vec::new();
        if self.is_stopped() {
            self.fail_request(request, RequestFailure::InstanceStopped);
            return out;
        }

        let me = self.me();
        self.outstanding.insert(
            (request.client, request.id),
            Outstanding {
                request: request.clone(),
                last_forwarded: now,
                retries: 0,
            },
        );
        self.handle_request(me, me, request, now, &mut out);
        self.deliver_locally(out, now)
    }

    pub(crate) fn handle_packet(&mut self, origin: NodeID, packet: PaxosPacket, now: Instant) -> Vec<MessagingTask> {
        let mut out = Vec::new();
        self.handle(origin, packet, now, &mut out);
        self.deliver_locally(out, now)
    }

    /// Run the periodic duties of the instance.
    pub(crate) fn tick(&mut self, failure_detector: &FailureDetector, now: Instant) -> Vec<MessagingTask> {
        let mut out = Vec::new();
        if self.is_stopped() {
            self.remind_of_stop(now, &mut out);
            return out;
        }
        self.check_run_for_coordinator(failure_detector, now, &mut out);
        self.retransmit(now, &mut out);
        self.propose_queued(now, &mut out);
        self.sync_if_lagging(SyncMode::NonzeroGap, now, &mut out);
        self.retry_outstanding(now, &mut out);
        // The app may have refused to execute earlier.
        self.extract_execute_and_checkpoint();
        self.deliver_locally(out, now)
    }

    fn me(&self) -> NodeID {
        self.context.config.me
    }

    fn lock_app(&self) -> MutexGuard<'_, A> {
        match self.context.app.lock() {
            Ok(app) => app,
            Err(poisoned) => {
                log::error!("App lock poisoned while handling {}", self.paxos_id);
                poisoned.into_inner()
            }
        }
    }

    fn publish(&self, event: Event) {
        Event::publish(&self.context.event_publisher, event)
    }

    fn send(&self, out: &mut Vec<MessagingTask>, recipients: Vec<NodeID>, packet: impl Into<PaxosPacket>) {
        if recipients.is_empty() {
            return;
        }
        out.push(MessagingTask::new(
            recipients,
            PaxosMessage::new(self.paxos_id.clone(), self.version, packet),
        ));
    }

    fn members(&self) -> Vec<NodeID> {
        self.group.members().copied().collect()
    }

    /// Handle every message in `pending` that is addressed to this replica, and everything that
    /// produces for this replica in turn. Returns the messages for other replicas.
    fn deliver_locally(&mut self, mut pending: Vec<MessagingTask>, now: Instant) -> Vec<MessagingTask> {
        let me = self.me();
        let mut remote = Vec::new();
        while !pending.is_empty() {
            let mut local = Vec::new();
            for mut task in pending.drain(..) {
                if let Some(position) = task.recipients.iter().position(|recipient| *recipient == me) {
                    task.recipients.remove(position);
                    local.push(task.message.packet.clone());
                }
                if !task.recipients.is_empty() {
                    remote.push(task);
                }
            }
            for packet in local {
                self.handle(me, packet, now, &mut pending);
            }
        }
        remote
    }

    fn handle(&mut self, origin: NodeID, packet: PaxosPacket, now: Instant, out: &mut Vec<MessagingTask>) {
        log::debug!("{} handling {} from {}", self.paxos_id, packet.name(), origin);

        let from_coordinator = matches!(
            packet,
            PaxosPacket::Accept(_) | PaxosPacket::Decision(_) | PaxosPacket::BatchedCommit(_)
        );
        if from_coordinator && !self.group.contains(&origin) {
            log::debug!("{} dropping {} from non-member {}", self.paxos_id, packet.name(), origin);
            return;
        }

        if self.is_stopped() {
            // Stopped instances still help laggards find out about the stop.
            match packet {
                PaxosPacket::SyncDecisions(sync) => self.handle_sync_decisions(sync, out),
                PaxosPacket::Prepare(_) | PaxosPacket::Accept(_) | PaxosPacket::Request(_) => {
                    self.send_stop(origin, out)
                }
                _ => {}
            }
            return;
        }

        match packet {
            PaxosPacket::Request(RequestPacket { entry, request }) => {
                self.handle_request(origin, entry, request, now, out)
            }
            PaxosPacket::Prepare(prepare) => self.handle_prepare(prepare, out),
            PaxosPacket::PrepareReply(reply) => self.handle_prepare_reply(reply, now, out),
            PaxosPacket::Accept(accept) => self.handle_accept(origin, accept, out),
            PaxosPacket::AcceptReply(reply) => self.handle_accept_reply(reply, now, out),
            PaxosPacket::BatchedAcceptReply(batched) => {
                for reply in batched.expand() {
                    self.handle_accept_reply(reply, now, out);
                }
            }
            PaxosPacket::Decision(decision) => self.handle_decision(decision, now, out),
            PaxosPacket::BatchedCommit(commit) => self.handle_batched_commit(commit, now, out),
            PaxosPacket::SyncDecisions(sync) => self.handle_sync_decisions(sync, out),
            PaxosPacket::Checkpoint(state) => self.handle_checkpoint(state),
            // Answered by the replica, which knows every instance's group.
            PaxosPacket::FindReplicaGroup(_) => {}
        }
    }

    /// Propose `request` if this replica coordinates, or else forward it to the coordinator of the
    /// current ballot. A request is forwarded at most twice: once by its entry replica, and once more
    /// by a replica that has learnt of a newer coordinator.
    fn handle_request(
        &mut self,
        origin: NodeID,
        entry: NodeID,
        request: Request,
        now: Instant,
        out: &mut Vec<MessagingTask>,
    ) {
        let me = self.me();
        let (max_inflight, max_batch) = (
            self.context.config.max_inflight_proposals,
            self.context.config.max_batch_requests,
        );
        if let Some(coordinator) = self.coordinator.as_mut() {
            if coordinator.is_proposed(request.client, request.id) {
                log::debug!("{} already proposed {:?}", self.paxos_id, request);
                return;
            }
            for pvalue in coordinator.propose_or_queue(request, &self.group, max_inflight, max_batch, now) {
                self.send_accept(pvalue, out);
            }
            return;
        }

        let coordinator = self.acceptor.ballot().coordinator;
        if coordinator == me {
            // Named by the current ballot, but without coordinator state since a restart.
            self.run_for_coordinator(now, out);
            if let Some(coordinator) = self.coordinator.as_mut() {
                coordinator.propose(request, &self.group, now);
            }
            return;
        }

        if origin != me && origin != entry {
            log::debug!("{} dropping {:?} forwarded by {}", self.paxos_id, request, origin);
            return;
        }
        self.send(out, vec![coordinator], RequestPacket { entry, request });
    }

    fn send_accept(&self, pvalue: PValue, out: &mut Vec<MessagingTask>) {
        let median_checkpointed_slot = self
            .coordinator
            .as_ref()
            .and_then(|coordinator| coordinator.median_checkpointed_slot());
        self.publish(Event::Propose(ProposeEvent {
            timestamp: SystemTime::now(),
            paxos_id: self.paxos_id.clone(),
            pvalue: pvalue.clone(),
        }));
        self.send(
            out,
            self.members(),
            Accept {
                sender: self.me(),
                pvalue,
                median_checkpointed_slot,
            },
        );
    }

    fn handle_prepare(&mut self, prepare: Prepare, out: &mut Vec<MessagingTask>) {
        let me = self.me();
        let Some((reply, ballot_changed)) = self.acceptor.handle_prepare(&prepare, me) else {
            return;
        };
        if ballot_changed {
            if let Err(err) = self
                .context
                .logger
                .log(&self.paxos_id, self.version, LogRecord::Ballot(reply.ballot))
            {
                log::error!("{} could not log ballot {}, not replying: {}", self.paxos_id, reply.ballot, err);
                return;
            }
            self.resign_if_preempted(reply.ballot, out);
        }
        self.send(out, vec![prepare.ballot.coordinator], reply);
    }

    fn handle_prepare_reply(&mut self, reply: PrepareReply, now: Instant, out: &mut Vec<MessagingTask>) {
        let Some(coordinator) = self.coordinator.as_mut() else {
            return;
        };
        let ballot = coordinator.ballot();
        match coordinator.handle_prepare_reply(&reply, &self.group, now) {
            PrepareReplyOutcome::Ignored | PrepareReplyOutcome::Waiting => {}
            PrepareReplyOutcome::Preempted(preempting_ballot) => self.resign(preempting_ballot, out),
            PrepareReplyOutcome::Active(pvalues) => {
                log::info!("{} coordinator {} active with {} proposals", self.paxos_id, ballot, pvalues.len());
                self.publish(Event::BecomeActive(BecomeActiveEvent {
                    timestamp: SystemTime::now(),
                    paxos_id: self.paxos_id.clone(),
                    ballot,
                    proposals: pvalues.len(),
                }));
                for pvalue in pvalues {
                    self.send_accept(pvalue, out);
                }
                self.propose_queued(now, out);
            }
        }
    }

    /// Propose the requests the coordinator queued while too many proposals were undecided.
    fn propose_queued(&mut self, now: Instant, out: &mut Vec<MessagingTask>) {
        let config = &self.context.config;
        let (max_inflight, max_batch) = (config.max_inflight_proposals, config.max_batch_requests);
        let Some(coordinator) = self.coordinator.as_mut() else {
            return;
        };
        let pvalues = coordinator.propose_queued(&self.group, max_inflight, max_batch, now);
        if !pvalues.is_empty() {
            log::debug!("{} proposing {} queued batches", self.paxos_id, pvalues.len());
        }
        for pvalue in pvalues {
            self.send_accept(pvalue, out);
        }
    }

    fn resign_if_preempted(&mut self, ballot: Ballot, out: &mut Vec<MessagingTask>) {
        let preempted = self
            .coordinator
            .as_ref()
            .map_or(false, |coordinator| coordinator.ballot() < ballot);
        if preempted {
            self.resign(ballot, out);
        }
    }

    /// Give up coordinating, handing the requests that were not decided to the coordinator of
    /// `preempting_ballot`.
    fn resign(&mut self, preempting_ballot: Ballot, out: &mut Vec<MessagingTask>) {
        let Some(coordinator) = self.coordinator.take() else {
            return;
        };
        log::info!(
            "{} coordinator {} preempted by {}",
            self.paxos_id,
            coordinator.ballot(),
            preempting_ballot
        );
        self.publish(Event::Preempted(PreemptedEvent {
            timestamp: SystemTime::now(),
            paxos_id: self.paxos_id.clone(),
            ballot: coordinator.ballot(),
            preempting_ballot,
        }));

        let me = self.me();
        if preempting_ballot.coordinator == me {
            return;
        }
        for request in coordinator.undecided_requests() {
            self.send(out, vec![preempting_ballot.coordinator], RequestPacket { entry: me, request });
        }
    }

    fn handle_accept(&mut self, origin: NodeID, accept: Accept, out: &mut Vec<MessagingTask>) {
        let Some(outcome) = self.acceptor.accept_and_update_ballot(&accept) else {
            return;
        };

        let mut records = Vec::new();
        if outcome.ballot_changed {
            records.push(LogRecord::Ballot(outcome.ballot));
        }
        if outcome.accepted {
            records.push(LogRecord::PValue(accept.pvalue.clone()));
        }
        if let Some(gc_slot) = outcome.gc_advanced {
            records.push(LogRecord::GarbageSlot(gc_slot));
        }
        if let Err(err) = self.context.logger.log_batch(&self.paxos_id, self.version, &records) {
            log::error!("{} could not log accept of {:?}, not replying: {}", self.paxos_id, accept.pvalue, err);
            return;
        }

        if let Some(gc_slot) = outcome.gc_advanced {
            self.publish_garbage_collect(gc_slot);
        }
        if outcome.ballot_changed {
            self.resign_if_preempted(outcome.ballot, out);
        }
        if outcome.accepted {
            self.publish(Event::Accept(AcceptEvent {
                timestamp: SystemTime::now(),
                paxos_id: self.paxos_id.clone(),
                origin,
                pvalue: accept.pvalue.clone(),
            }));
        }

        let reply = AcceptReply {
            acceptor: self.me(),
            ballot: outcome.ballot,
            slot: accept.pvalue.slot,
            max_checkpointed_slot: gc::last_checkpoint_slot(
                self.acceptor.slot().prev(),
                self.context.config.checkpoint_interval,
            ),
            request_id: accept.pvalue.request.id,
        };
        self.send(out, vec![accept.sender], reply);

        // The accept may complete a commit notice that overtook it.
        self.extract_execute_and_checkpoint();
    }

    fn handle_accept_reply(&mut self, reply: AcceptReply, now: Instant, out: &mut Vec<MessagingTask>) {
        let Some(coordinator) = self.coordinator.as_mut() else {
            return;
        };
        let outcome = coordinator.handle_accept_reply(&reply, &self.group);
        let median_checkpointed_slot = coordinator.median_checkpointed_slot();
        match outcome {
            AcceptReplyOutcome::Ignored | AcceptReplyOutcome::Waiting => {}
            AcceptReplyOutcome::Preempted { ballot, resign } => {
                if resign {
                    self.resign(ballot, out);
                }
            }
            AcceptReplyOutcome::Decided { pvalue, acknowledged } => {
                self.announce_decision(pvalue, acknowledged, median_checkpointed_slot, out);
                self.propose_queued(now, out);
            }
        }
    }

    /// Tell the group about a decision: the members that accepted it only need to know that it was
    /// committed, the rest need the whole pvalue. This replica always gets the whole pvalue.
    fn announce_decision(
        &mut self,
        pvalue: PValue,
        acknowledged: Vec<NodeID>,
        median_checkpointed_slot: Option<Slot>,
        out: &mut Vec<MessagingTask>,
    ) {
        self.publish(Event::Decide(DecideEvent {
            timestamp: SystemTime::now(),
            paxos_id: self.paxos_id.clone(),
            pvalue: pvalue.clone(),
        }));

        let me = self.me();
        let informed: Vec<NodeID> = acknowledged
            .iter()
            .copied()
            .filter(|member| *member != me)
            .collect();
        let uninformed: Vec<NodeID> = self
            .group
            .members()
            .copied()
            .filter(|member| *member == me || !acknowledged.contains(member))
            .collect();

        self.send(
            out,
            informed,
            BatchedCommit {
                ballot: pvalue.ballot,
                median_checkpointed_slot,
                slots: BTreeSet::from([pvalue.slot]),
                group: self.group.clone(),
            },
        );
        self.send(
            out,
            uninformed,
            Decision {
                pvalue,
                median_checkpointed_slot,
                recovery: false,
            },
        );
    }

    fn garbage_collect(&mut self, median_checkpointed_slot: Option<Slot>) {
        let Some(gc_slot) = self.acceptor.garbage_collect(median_checkpointed_slot) else {
            return;
        };
        if let Err(err) = self
            .context
            .logger
            .log(&self.paxos_id, self.version, LogRecord::GarbageSlot(gc_slot))
        {
            log::error!("{} could not log garbage slot {}: {}", self.paxos_id, gc_slot, err);
        }
        self.publish_garbage_collect(gc_slot);
    }

    fn publish_garbage_collect(&self, gc_slot: Slot) {
        self.publish(Event::GarbageCollect(GarbageCollectEvent {
            timestamp: SystemTime::now(),
            paxos_id: self.paxos_id.clone(),
            gc_slot,
        }));
    }

    fn handle_decision(&mut self, decision: Decision, now: Instant, out: &mut Vec<MessagingTask>) {
        self.garbage_collect(decision.median_checkpointed_slot);

        let pvalue = decision.pvalue;
        if pvalue.slot < self.acceptor.slot() {
            return;
        }
        if let Err(err) = self
            .context
            .logger
            .log(&self.paxos_id, self.version, LogRecord::Decision(pvalue.clone()))
        {
            log::error!("{} could not log decision {:?}: {}", self.paxos_id, pvalue, err);
            return;
        }
        self.acceptor.put_decision(pvalue);
        self.extract_execute_and_checkpoint();

        if !decision.recovery {
            self.sync_if_lagging(SyncMode::Default, now, out);
        }
    }

    fn handle_batched_commit(&mut self, commit: BatchedCommit, now: Instant, out: &mut Vec<MessagingTask>) {
        self.garbage_collect(commit.median_checkpointed_slot);

        let next_slot = self.acceptor.slot();
        let mut decided = Vec::new();
        for slot in commit.slots.into_iter().filter(|slot| *slot >= next_slot) {
            match self.acceptor.reconstruct_decision(slot, commit.ballot) {
                Some(pvalue) => decided.push(pvalue),
                None => self.acceptor.put_meta_decision(slot, commit.ballot),
            }
        }

        if !decided.is_empty() {
            let records: Vec<LogRecord> = decided.iter().cloned().map(LogRecord::Decision).collect();
            if let Err(err) = self.context.logger.log_batch(&self.paxos_id, self.version, &records) {
                log::error!("{} could not log {} decisions: {}", self.paxos_id, records.len(), err);
                return;
            }
            for pvalue in decided {
                self.acceptor.put_decision(pvalue);
            }
        }
        self.extract_execute_and_checkpoint();
        self.sync_if_lagging(SyncMode::Default, now, out);
    }

    /// Execute every decision that is next in line, checkpointing where due.
    fn extract_execute_and_checkpoint(&mut self) {
        while let Some(pvalue) = self.acceptor.next_executable().cloned() {
            if !pvalue.request.is_no_op() && !self.execute(&pvalue) {
                break;
            }

            if let Err(err) = self
                .context
                .logger
                .log(&self.paxos_id, self.version, LogRecord::SlotNumber(pvalue.slot))
            {
                log::error!("{} could not log execution of slot {}: {}", self.paxos_id, pvalue.slot, err);
            }
            for request in pvalue.request.requests() {
                self.outstanding.remove(&(request.client, request.id));
            }
            if !pvalue.request.is_no_op() {
                for request in pvalue.request.requests() {
                    self.publish(Event::Execute(ExecuteEvent {
                        timestamp: SystemTime::now(),
                        paxos_id: self.paxos_id.clone(),
                        slot: pvalue.slot,
                        request: Request {
                            batched: Vec::new(),
                            ..request.clone()
                        },
                    }));
                }
            }

            let is_stop = pvalue.is_stop();
            if gc::should_checkpoint(pvalue.slot, is_stop, self.context.config.checkpoint_interval) {
                self.checkpoint(pvalue.slot, is_stop);
            }
            self.acceptor.executed(pvalue.slot, is_stop);
            if is_stop {
                let slot = pvalue.slot;
                self.stopped(slot, Some(pvalue));
                break;
            }
        }
    }

    fn execute(&self, pvalue: &PValue) -> bool {
        let mut app = self.lock_app();
        for request in pvalue.request.requests() {
            if !app.execute(&self.paxos_id, pvalue.slot, request) {
                log::warn!("{} app refused {:?} at slot {}, retrying later", self.paxos_id, request, pvalue.slot);
                return false;
            }
        }
        true
    }

    fn checkpoint(&mut self, slot: Slot, stopped: bool) {
        let state = self.lock_app().checkpoint(&self.paxos_id);
        let checkpoint = Checkpoint {
            paxos_id: self.paxos_id.clone(),
            version: self.version,
            group: self.group.clone(),
            slot,
            ballot: self.acceptor.ballot(),
            state,
            gc_slot: self.acceptor.gc_slot(),
        };
        if checkpoint.is_large() {
            log::debug!("{} large checkpoint of {} bytes at slot {}", self.paxos_id, checkpoint.state.len(), slot);
        }
        match self.context.logger.put_checkpoint(&checkpoint) {
            Ok(()) => self.publish(Event::Checkpoint(CheckpointEvent {
                timestamp: SystemTime::now(),
                paxos_id: self.paxos_id.clone(),
                slot,
            })),
            Err(err) => log::error!("{} could not store checkpoint at slot {}: {}", self.paxos_id, slot, err),
        }
        if stopped {
            log::debug!("{} final checkpoint at slot {}", self.paxos_id, slot);
        }
    }

    /// Turn into a tombstone after the stop at `slot`, failing every outstanding request.
    fn stopped(&mut self, slot: Slot, stop: Option<PValue>) {
        log::info!("{} stopped at slot {}", self.paxos_id, slot);
        if let Err(err) = self.context.logger.log_stop(&self.paxos_id, self.version, stop.clone()) {
            log::error!("{} could not log stop: {}", self.paxos_id, err);
        }
        self.coordinator = None;
        for (_, outstanding) in mem::take(&mut self.outstanding) {
            self.fail_request(outstanding.request, RequestFailure::InstanceStopped);
        }
        self.stop = stop;
        self.publish(Event::StopInstance(StopInstanceEvent {
            timestamp: SystemTime::now(),
            paxos_id: self.paxos_id.clone(),
            version: self.version,
            slot,
        }));
    }

    fn fail_request(&self, request: Request, reason: RequestFailure) {
        log::warn!("{} failing {:?}: {:?}", self.paxos_id, request, reason);
        self.publish(Event::RequestFailed(RequestFailedEvent {
            timestamp: SystemTime::now(),
            paxos_id: self.paxos_id.clone(),
            request,
            reason,
        }));
    }

    fn sync_if_lagging(&mut self, mode: SyncMode, now: Instant, out: &mut Vec<MessagingTask>) {
        let config = &self.context.config;
        if !should_sync(
            self.acceptor.slot(),
            self.acceptor.max_committed_slot(),
            config.sync_threshold,
            mode,
        ) {
            return;
        }
        if !self.acceptor.can_sync(config.min_resync_delay, now) {
            return;
        }
        self.request_missing_decisions(now, out);
    }

    /// Ask a random other member for the decisions this replica is missing.
    fn request_missing_decisions(&mut self, now: Instant, out: &mut Vec<MessagingTask>) {
        let max_gap = self.context.config.max_sync_decisions_gap;
        let mut missing_slots = self.acceptor.missing_committed_slots(max_gap);
        if missing_slots.is_empty() {
            missing_slots.push(self.acceptor.slot());
        }
        let max_decision_slot = self.acceptor.max_committed_slot();
        let missing_too_much = should_sync(self.acceptor.slot(), max_decision_slot, max_gap, SyncMode::Default);

        let me = self.me();
        let others = self.group.others(me);
        let Some(peer) = others.choose(&mut rand::thread_rng()).copied() else {
            return;
        };
        self.acceptor.just_synced(now);

        log::debug!(
            "{} asking {} for {} missing slots from {}",
            self.paxos_id,
            peer,
            missing_slots.len(),
            missing_slots[0]
        );
        self.publish(Event::StartSync(StartSyncEvent {
            timestamp: SystemTime::now(),
            paxos_id: self.paxos_id.clone(),
            peer,
            missing_slots: missing_slots.clone(),
            missing_too_much,
        }));
        self.send(
            out,
            vec![peer],
            SyncDecisions {
                node_id: me,
                max_decision_slot,
                missing_slots,
                missing_too_much,
            },
        );
    }

    fn handle_sync_decisions(&mut self, sync: SyncDecisions, out: &mut Vec<MessagingTask>) {
        let peer = sync.node_id;
        self.publish(Event::ReceiveSyncRequest(ReceiveSyncRequestEvent {
            timestamp: SystemTime::now(),
            paxos_id: self.paxos_id.clone(),
            peer,
            missing_slots: sync.missing_slots.len(),
        }));

        let Some(min_missing) = sync.missing_slots.iter().min().copied() else {
            return;
        };
        let Some(max_committed) = self.acceptor.max_committed_slot() else {
            return;
        };
        if min_missing > max_committed {
            return;
        }

        let logger = self.context.logger.clone();
        let checkpoint = match logger.get_checkpoint(&self.paxos_id, self.version) {
            Ok(checkpoint) => checkpoint,
            Err(err) => {
                log::warn!("{} could not read its checkpoint for {}: {}", self.paxos_id, peer, err);
                None
            }
        };

        match checkpoint {
            Some(checkpoint) if sync.missing_too_much || min_missing <= checkpoint.slot => {
                let stopped = self.stop.as_ref().map_or(false, |stop| stop.slot == checkpoint.slot);
                let decisions =
                    logger.get_logged_decisions(&self.paxos_id, self.version, checkpoint.slot.next(), max_committed);
                self.send(
                    out,
                    vec![peer],
                    StatePacket {
                        ballot: checkpoint.ballot,
                        slot: checkpoint.slot,
                        is_large_checkpoint: checkpoint.is_large(),
                        state: checkpoint.state,
                        stopped,
                    },
                );
                for pvalue in decisions {
                    self.send_recovery_decision(peer, pvalue, out);
                }
            }
            _ => {
                for slot in sync.missing_slots {
                    for pvalue in logger.get_logged_decisions(&self.paxos_id, self.version, slot, slot) {
                        self.send_recovery_decision(peer, pvalue, out);
                    }
                }
            }
        }
    }

    fn send_recovery_decision(&self, peer: NodeID, pvalue: PValue, out: &mut Vec<MessagingTask>) {
        self.send(
            out,
            vec![peer],
            Decision {
                pvalue,
                median_checkpointed_slot: None,
                recovery: true,
            },
        );
    }

    /// Answer a member that still runs this instance, and so cannot have learnt of the stop, with the
    /// decided stop.
    fn send_stop(&self, peer: NodeID, out: &mut Vec<MessagingTask>) {
        if peer == self.me() || !self.group.contains(&peer) {
            return;
        }
        if let Some(stop) = self.stop.clone() {
            log::debug!("{} telling {} about the stop at slot {}", self.paxos_id, peer, stop.slot);
            self.send_recovery_decision(peer, stop, out);
        }
    }

    /// Send the decided stop to the other members again, in case one of them missed it. Reminders
    /// start at the first tick after the stop and back off exponentially.
    fn remind_of_stop(&mut self, now: Instant, out: &mut Vec<MessagingTask>) {
        let Some(stop) = self.stop.clone() else {
            return;
        };
        let reminders = match self.stop_reminded {
            Some((last, reminders)) => {
                let interval = self
                    .context
                    .config
                    .request_timeout
                    .saturating_mul(1u32 << reminders.min(MAX_STOP_REMINDER_EXPONENT));
                if now.saturating_duration_since(last) < interval {
                    return;
                }
                reminders + 1
            }
            None => 0,
        };
        self.stop_reminded = Some((now, reminders));

        log::debug!("{} reminding the group of the stop at slot {}", self.paxos_id, stop.slot);
        self.send(
            out,
            self.group.others(self.me()),
            Decision {
                pvalue: stop,
                median_checkpointed_slot: None,
                recovery: true,
            },
        );
    }

    /// Install a checkpoint sent by a peer in response to a sync request.
    fn handle_checkpoint(&mut self, state: StatePacket) {
        if state.slot < self.acceptor.slot() {
            log::debug!("{} ignoring stale checkpoint at slot {}", self.paxos_id, state.slot);
            return;
        }
        if !self.lock_app().restore(&self.paxos_id, Some(&state.state)) {
            log::warn!("App could not restore the checkpoint of {} at slot {}", self.paxos_id, state.slot);
            return;
        }
        self.acceptor.jump_slot(state.slot.next());

        let checkpoint = Checkpoint {
            paxos_id: self.paxos_id.clone(),
            version: self.version,
            group: self.group.clone(),
            slot: state.slot,
            ballot: state.ballot,
            state: state.state,
            gc_slot: self.acceptor.gc_slot(),
        };
        if let Err(err) = self.context.logger.put_checkpoint(&checkpoint) {
            log::error!("{} could not store restored checkpoint at slot {}: {}", self.paxos_id, state.slot, err);
        }
        log::info!("{} restored checkpoint at slot {}", self.paxos_id, state.slot);
        self.publish(Event::RestoreCheckpoint(RestoreCheckpointEvent {
            timestamp: SystemTime::now(),
            paxos_id: self.paxos_id.clone(),
            slot: state.slot,
        }));

        if state.stopped {
            self.acceptor.stop();
            self.stopped(state.slot, None);
            return;
        }
        self.extract_execute_and_checkpoint();
    }

    /// Run for coordinator if the coordinator of the current ballot is down and either this replica is
    /// next in the round robin order or the coordinator has been down for long. Also run if the current
    /// ballot is this replica's own but it holds no coordinator state.
    fn check_run_for_coordinator(&mut self, failure_detector: &FailureDetector, now: Instant, out: &mut Vec<MessagingTask>) {
        if self.coordinator.is_some() {
            return;
        }
        let me = self.me();
        let ballot = self.acceptor.ballot();
        let run = if ballot.coordinator == me {
            true
        } else if failure_detector.is_node_up(ballot.coordinator, now) {
            false
        } else {
            self.group
                .round_robin_coordinator(&self.paxos_id, ballot.number.saturating_add(1))
                == Some(me)
                || failure_detector.is_long_dead(ballot.coordinator, now)
        };
        if run {
            self.run_for_coordinator(now, out);
        }
    }

    fn run_for_coordinator(&mut self, now: Instant, out: &mut Vec<MessagingTask>) {
        let me = self.me();
        let ballot = self.acceptor.ballot().successor(me);
        let first_undecided_slot = self.acceptor.slot();
        self.coordinator = Some(Coordinator::new(ballot, first_undecided_slot, &self.group, false, now));

        log::info!("{} running for coordinator with ballot {}", self.paxos_id, ballot);
        self.publish(Event::RunForCoordinator(RunForCoordinatorEvent {
            timestamp: SystemTime::now(),
            paxos_id: self.paxos_id.clone(),
            ballot,
        }));
        self.send(
            out,
            self.members(),
            Prepare {
                ballot,
                first_undecided_slot,
                recovery: false,
            },
        );
    }

    fn retransmit(&mut self, now: Instant, out: &mut Vec<MessagingTask>) {
        let config = &self.context.config;
        let (prepare_timeout, accept_timeout) = (config.prepare_timeout, config.accept_timeout);
        let Some(coordinator) = self.coordinator.as_mut() else {
            return;
        };
        let ballot = coordinator.ballot();
        let median_checkpointed_slot = coordinator.median_checkpointed_slot();
        let retransmissions = coordinator.retransmissions(&self.group, prepare_timeout, accept_timeout, now);

        let me = self.me();
        for retransmission in retransmissions {
            match retransmission {
                Retransmission::Prepare {
                    recipients,
                    first_undecided_slot,
                } => self.send(
                    out,
                    recipients,
                    Prepare {
                        ballot,
                        first_undecided_slot,
                        recovery: false,
                    },
                ),
                Retransmission::Accept { recipients, pvalue } => self.send(
                    out,
                    recipients,
                    Accept {
                        sender: me,
                        pvalue,
                        median_checkpointed_slot,
                    },
                ),
            }
        }
    }

    /// Forward again every outstanding request that has waited for longer than the request timeout,
    /// failing those that have been forwarded too often.
    fn retry_outstanding(&mut self, now: Instant, out: &mut Vec<MessagingTask>) {
        let request_timeout = self.context.config.request_timeout;
        let max_retries = self.context.config.max_request_retries;
        let due: Vec<(ClientID, RequestID)> = self
            .outstanding
            .iter()
            .filter(|(_, outstanding)| now.saturating_duration_since(outstanding.last_forwarded) >= request_timeout)
            .map(|(key, _)| *key)
            .collect();

        let me = self.me();
        for key in due {
            let Some(mut outstanding) = self.outstanding.remove(&key) else {
                continue;
            };
            if outstanding.retries >= max_retries {
                self.fail_request(
                    outstanding.request,
                    RequestFailure::RetriesExhausted {
                        retries: outstanding.retries,
                        request_timeout,
                    },
                );
                continue;
            }
            outstanding.retries += 1;
            outstanding.last_forwarded = now;
            let request = outstanding.request.clone();
            self.outstanding.insert(key, outstanding);
            self.handle_request(me, me, request, now, out);
        }
    }
}

fn initial_ballot(paxos_id: &PaxosID, group: &ReplicaGroup, me: NodeID) -> Ballot {
    Ballot::new(0, group.round_robin_coordinator(paxos_id, 0).unwrap_or(me))
}
