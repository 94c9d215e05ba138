//! The set of paxos instances hosted by a replica.
//!
//! [`PaxosManager`] owns every [instance](crate::paxos::instance::PaxosInstance) of a replica, keyed by
//! paxos ID, along with the replica's failure detector. It routes every incoming packet, proposal, and
//! timer tick to the instance it concerns.
//!
//! ## Threads
//!
//! Instances are independent of each other, so the manager only serializes work per instance: each one
//! sits behind its own lock, and the [workers](workers) always hand work for the same paxos ID to the
//! same worker thread, so packets of one instance are handled in the order they were received.
//!
//! ## Unknown instances
//!
//! A packet or proposal for a paxos ID the replica does not know is [buffered](find_group) while the
//! replica asks its peers for the instance's replica group.

pub(crate) mod find_group;

pub(crate) mod workers;

use std::collections::HashMap;
use std::fmt::{self, Display, Formatter};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::{Duration, Instant, SystemTime};

use crate::app::App;
use crate::events::*;
use crate::failure_detection::FailureDetector;
use crate::logger::{recovery::Recovery, PaxosLoggerError};
use crate::paxos::instance::{InstanceContext, PaxosInstance};
use crate::paxos::messages::{Decision, FindReplicaGroup, PaxosMessage, PaxosPacket, RequestPacket};
use crate::paxos::{InstanceStatus, MessagingTask};
use crate::types::{
    data_types::{NodeID, PaxosID, Version},
    replica_group::ReplicaGroup,
    request::Request,
    tombstone::Tombstone,
};

use find_group::{PendingGroups, RetryOutcome};
use workers::{Dispatcher, WorkItem};

/// Parameters of the manager that are not parameters of single instances.
#[derive(Clone, Debug)]
pub(crate) struct ManagerConfiguration {
    pub(crate) node_detection_timeout: Duration,
    pub(crate) find_group_retry_interval: Duration,
    pub(crate) max_find_group_attempts: u32,
}

/// Reasons why [`Replica::create_instance`](crate::replica::Replica::create_instance) can fail.
#[derive(Debug)]
pub enum CreateInstanceError {
    /// The paxos ID cannot be written to the persistent log.
    InvalidPaxosID(PaxosID),
    EmptyGroup,
    /// This replica is not a member of the group it was asked to host an instance of.
    NotMember,
    /// The replica already hosts a newer version of the instance.
    StaleVersion { current: Version },
    Logger(PaxosLoggerError),
}

impl Display for CreateInstanceError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            CreateInstanceError::InvalidPaxosID(paxos_id) => write!(f, "invalid paxos ID {:?}", paxos_id),
            CreateInstanceError::EmptyGroup => write!(f, "replica group is empty"),
            CreateInstanceError::NotMember => write!(f, "this replica is not a member of the group"),
            CreateInstanceError::StaleVersion { current } => {
                write!(f, "a newer version ({}) of the instance exists", current)
            }
            CreateInstanceError::Logger(err) => write!(f, "could not log the new instance: {}", err),
        }
    }
}

impl std::error::Error for CreateInstanceError {}

impl From<PaxosLoggerError> for CreateInstanceError {
    fn from(value: PaxosLoggerError) -> Self {
        CreateInstanceError::Logger(value)
    }
}

type InstancePtr<A> = Arc<Mutex<PaxosInstance<A>>>;

pub(crate) struct PaxosManager<A: App> {
    config: ManagerConfiguration,
    context: InstanceContext<A>,
    instances: RwLock<HashMap<PaxosID, InstancePtr<A>>>,
    tombstones: RwLock<HashMap<PaxosID, Tombstone>>,
    pending: Mutex<PendingGroups>,
    failure_detector: Mutex<FailureDetector>,
    dispatcher: Dispatcher,
}

impl<A: App> PaxosManager<A> {
    /// Create a manager hosting every instance in `recovery`, restarted from its logged state.
    pub(crate) fn new(
        config: ManagerConfiguration,
        context: InstanceContext<A>,
        recovery: Recovery,
        dispatcher: Dispatcher,
        now: Instant,
    ) -> PaxosManager<A> {
        let me = context.config.me;
        let mut failure_detector = FailureDetector::new(me, config.node_detection_timeout, now);

        let mut instances = HashMap::new();
        for (paxos_id, recovered) in recovery.instances {
            failure_detector.add_targets(recovered.group.members());
            let instance = PaxosInstance::recovered(recovered, context.clone());
            instances.insert(paxos_id, Arc::new(Mutex::new(instance)));
        }
        log::info!(
            "Replica {} recovered {} instances and {} tombstones",
            me,
            instances.len(),
            recovery.tombstones.len()
        );

        PaxosManager {
            config,
            context,
            instances: RwLock::new(instances),
            tombstones: RwLock::new(recovery.tombstones.into_iter().collect()),
            pending: Mutex::new(PendingGroups::new()),
            failure_detector: Mutex::new(failure_detector),
            dispatcher,
        }
    }

    fn me(&self) -> NodeID {
        self.context.config.me
    }

    fn publish(&self, event: Event) {
        Event::publish(&self.context.event_publisher, event)
    }

    fn instance(&self, paxos_id: &PaxosID) -> Option<InstancePtr<A>> {
        self.instances
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(paxos_id)
            .cloned()
    }

    pub(crate) fn instance_ids(&self) -> Vec<PaxosID> {
        self.instances
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .keys()
            .cloned()
            .collect()
    }

    fn failure_detector(&self) -> MutexGuard<'_, FailureDetector> {
        self.failure_detector
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn pending(&self) -> MutexGuard<'_, PendingGroups> {
        self.pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Create an instance, or replace an older version of it.
    ///
    /// # Return value
    /// `Ok(false)` if the same version of the instance already exists.
    pub(crate) fn create_instance(
        &self,
        paxos_id: PaxosID,
        version: Version,
        group: ReplicaGroup,
        now: Instant,
    ) -> Result<bool, CreateInstanceError> {
        if !paxos_id.is_valid() {
            return Err(CreateInstanceError::InvalidPaxosID(paxos_id));
        }
        if group.is_empty() {
            return Err(CreateInstanceError::EmptyGroup);
        }
        if !group.contains(&self.me()) {
            return Err(CreateInstanceError::NotMember);
        }

        let created = {
            let mut instances = self.instances.write().unwrap_or_else(|poisoned| poisoned.into_inner());
            let existing_version = match instances.get(&paxos_id) {
                Some(existing) => Some(lock_instance(existing).version()),
                None => self
                    .tombstones
                    .read()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .get(&paxos_id)
                    .map(|tombstone| tombstone.version),
            };
            match existing_version {
                Some(current) if current > version => return Err(CreateInstanceError::StaleVersion { current }),
                Some(current) if current == version => false,
                _ => {
                    self.context.logger.log_start(&paxos_id, version, &group)?;
                    self.failure_detector().add_targets(group.members());
                    let instance = PaxosInstance::new(paxos_id.clone(), version, group, self.context.clone(), now);
                    instances.insert(paxos_id.clone(), Arc::new(Mutex::new(instance)));
                    true
                }
            }
        };

        if created {
            self.tombstones
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .remove(&paxos_id);
            log::info!("Replica {} created {} at version {}", self.me(), paxos_id, version);
        }
        self.flush_pending(&paxos_id);
        Ok(created)
    }

    /// Hand the work buffered for `paxos_id` back to the workers, now that the instance exists.
    fn flush_pending(&self, paxos_id: &PaxosID) {
        let buffered = self.pending().remove(paxos_id);
        for item in buffered {
            self.dispatcher.dispatch(item);
        }
    }

    pub(crate) fn heard_from(&self, node: NodeID, now: Instant) {
        self.failure_detector().heard_from(node, now)
    }

    pub(crate) fn pings_due(&self, now: Instant) -> Vec<(NodeID, crate::failure_detection::messages::FailureDetect)> {
        self.failure_detector().pings_due(now)
    }

    pub(crate) fn status(&self, paxos_id: &PaxosID) -> Option<InstanceStatus> {
        self.instance(paxos_id)
            .map(|instance| lock_instance(&instance).status())
    }

    pub(crate) fn tombstone(&self, paxos_id: &PaxosID) -> Option<Tombstone> {
        match self.instance(paxos_id) {
            Some(instance) => lock_instance(&instance).tombstone(),
            None => self
                .tombstones
                .read()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .get(paxos_id)
                .cloned(),
        }
    }

    /// Do `item`, returning the messages to send.
    pub(crate) fn handle(&self, item: WorkItem, now: Instant) -> Vec<MessagingTask> {
        match item {
            WorkItem::Packet { origin, message } => self.handle_message(origin, message, now),
            WorkItem::Propose { paxos_id, request } => self.handle_propose(paxos_id, request, now),
            WorkItem::Tick { paxos_id } => match self.instance(&paxos_id) {
                Some(instance) => {
                    let mut instance = lock_instance(&instance);
                    let failure_detector = self.failure_detector();
                    instance.tick(&failure_detector, now)
                }
                None => Vec::new(),
            },
        }
    }

    fn handle_message(&self, origin: NodeID, message: PaxosMessage, now: Instant) -> Vec<MessagingTask> {
        let paxos_id = message.envelope.paxos_id.clone();
        let version = message.envelope.version;

        if let PaxosPacket::FindReplicaGroup(find) = message.packet {
            return self.handle_find_replica_group(paxos_id, version, find, now);
        }

        if let Some(instance) = self.instance(&paxos_id) {
            let mut instance = lock_instance(&instance);
            if instance.version() == version {
                return instance.handle_packet(origin, message.packet, now);
            }
            if instance.version() > version {
                log::debug!(
                    "Dropping {} for {} version {} from {}: version {} is current",
                    message.packet.name(),
                    paxos_id,
                    version,
                    origin,
                    instance.version()
                );
                return Vec::new();
            }
        } else if let Some(tombstone) = self.tombstone(&paxos_id).filter(|tombstone| tombstone.version >= version) {
            return self.answer_from_tombstone(origin, version, tombstone, &message.packet);
        }

        let hint = message.packet.member_hint().unwrap_or(origin);
        let item = WorkItem::Packet { origin, message };
        self.buffer_and_find(paxos_id, version, vec![hint], item, now)
    }

    /// Tell a member that still runs a stopped instance how it ended. Only packets that a running
    /// instance sends on its own are answered, so two stopped replicas never answer each other.
    fn answer_from_tombstone(
        &self,
        origin: NodeID,
        version: Version,
        tombstone: Tombstone,
        packet: &PaxosPacket,
    ) -> Vec<MessagingTask> {
        let running = matches!(
            packet,
            PaxosPacket::Prepare(_) | PaxosPacket::Accept(_) | PaxosPacket::Request(_) | PaxosPacket::SyncDecisions(_)
        );
        match tombstone.stop {
            Some(stop) if running && version == tombstone.version && tombstone.group.contains(&origin) => {
                log::debug!("Telling {} that {} stopped at slot {}", origin, tombstone.paxos_id, stop.slot);
                let decision = Decision {
                    pvalue: stop,
                    median_checkpointed_slot: None,
                    recovery: true,
                };
                vec![MessagingTask::new(
                    vec![origin],
                    PaxosMessage::new(tombstone.paxos_id, version, decision),
                )]
            }
            _ => {
                log::debug!("Dropping {} for stopped {} from {}", packet.name(), tombstone.paxos_id, origin);
                Vec::new()
            }
        }
    }

    fn handle_propose(&self, paxos_id: PaxosID, request: Request, now: Instant) -> Vec<MessagingTask> {
        if let Some(instance) = self.instance(&paxos_id) {
            return lock_instance(&instance).propose(request, now);
        }
        if self.tombstone(&paxos_id).is_some() {
            self.fail_request(paxos_id, request, RequestFailure::InstanceStopped);
            return Vec::new();
        }

        let resolved = self
            .context
            .app
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .resolve_replica_group(&paxos_id);
        if let Some((version, group)) = resolved {
            if group.contains(&self.me()) {
                match self.create_instance(paxos_id.clone(), version, group, now) {
                    Ok(_) => {
                        if let Some(instance) = self.instance(&paxos_id) {
                            return lock_instance(&instance).propose(request, now);
                        }
                    }
                    Err(err) => log::warn!("Could not create resolved instance {}: {}", paxos_id, err),
                }
            }
        }

        let peers = self.failure_detector().targets();
        let item = WorkItem::Propose {
            paxos_id: paxos_id.clone(),
            request,
        };
        self.buffer_and_find(paxos_id, Version::new(0), peers, item, now)
    }

    /// Queue `item` until the replica group of `paxos_id` is known, asking `peers` for it if this is
    /// the first item queued.
    fn buffer_and_find(
        &self,
        paxos_id: PaxosID,
        version: Version,
        peers: Vec<NodeID>,
        item: WorkItem,
        now: Instant,
    ) -> Vec<MessagingTask> {
        let first = self.pending().buffer(paxos_id.clone(), version, peers.clone(), item, now);
        if !first {
            return Vec::new();
        }
        log::info!("Replica {} looking for the group of {} at {:?}", self.me(), paxos_id, peers);
        self.publish(Event::FindReplicaGroup(FindReplicaGroupEvent {
            timestamp: SystemTime::now(),
            paxos_id: paxos_id.clone(),
            peers: peers.clone(),
            attempt: 1,
        }));
        self.find_group_task(paxos_id, version, peers).into_iter().collect()
    }

    fn find_group_task(&self, paxos_id: PaxosID, version: Version, peers: Vec<NodeID>) -> Option<MessagingTask> {
        if peers.is_empty() {
            return None;
        }
        let find = FindReplicaGroup {
            node_id: self.me(),
            group: None,
        };
        Some(MessagingTask::new(peers, PaxosMessage::new(paxos_id, version, find)))
    }

    /// Answer a request for the group of an instance, or create the instance from an answer.
    fn handle_find_replica_group(
        &self,
        paxos_id: PaxosID,
        version: Version,
        find: FindReplicaGroup,
        now: Instant,
    ) -> Vec<MessagingTask> {
        match find.group {
            None => {
                // A stopped instance still has a group, so that members that missed the stop can find it.
                let known = match self.instance(&paxos_id) {
                    Some(instance) => {
                        let instance = lock_instance(&instance);
                        Some((instance.version(), instance.group().clone()))
                    }
                    None => self.tombstone(&paxos_id).map(|tombstone| (tombstone.version, tombstone.group)),
                };
                let Some((known_version, group)) = known else {
                    return Vec::new();
                };
                if known_version < version {
                    return Vec::new();
                }
                let reply = FindReplicaGroup {
                    node_id: self.me(),
                    group: Some(group),
                };
                vec![MessagingTask::new(
                    vec![find.node_id],
                    PaxosMessage::new(paxos_id, known_version, reply),
                )]
            }
            Some(group) => {
                if !self.pending().is_waiting_for(&paxos_id, version) {
                    return Vec::new();
                }
                if group.contains(&self.me()) {
                    if let Err(err) = self.create_instance(paxos_id.clone(), version, group, now) {
                        log::warn!("Could not create {} found at {}: {}", paxos_id, find.node_id, err);
                        self.flush_pending(&paxos_id);
                    }
                    return Vec::new();
                }
                self.forward_to_member(paxos_id, version, find.node_id)
            }
        }
    }

    /// Hand the requests buffered for an instance this replica is not a member of to `member`, which
    /// is. Buffered packets are dropped.
    fn forward_to_member(&self, paxos_id: PaxosID, version: Version, member: NodeID) -> Vec<MessagingTask> {
        let me = self.me();
        let mut tasks = Vec::new();
        for item in self.pending().remove(&paxos_id) {
            if let WorkItem::Propose { request, .. } = item {
                tasks.push(MessagingTask::new(
                    vec![member],
                    PaxosMessage::new(paxos_id.clone(), version, RequestPacket { entry: me, request }),
                ));
            }
        }
        tasks
    }

    /// Ask again for the replica groups still unknown, giving up on those asked for too often.
    pub(crate) fn retry_find_groups(&self, now: Instant) -> Vec<MessagingTask> {
        let outcomes = self.pending().retries_due(
            self.config.find_group_retry_interval,
            self.config.max_find_group_attempts,
            now,
        );

        let mut tasks = Vec::new();
        for outcome in outcomes {
            match outcome {
                RetryOutcome::Retry {
                    paxos_id,
                    version,
                    peers,
                    attempt,
                } => {
                    if self.instance(&paxos_id).is_some() {
                        // Created after the work was buffered.
                        self.flush_pending(&paxos_id);
                        continue;
                    }
                    self.publish(Event::FindReplicaGroup(FindReplicaGroupEvent {
                        timestamp: SystemTime::now(),
                        paxos_id: paxos_id.clone(),
                        peers: peers.clone(),
                        attempt,
                    }));
                    tasks.extend(self.find_group_task(paxos_id, version, peers));
                }
                RetryOutcome::GiveUp { paxos_id, buffered } => {
                    log::warn!("Replica {} could not find the group of {}", self.me(), paxos_id);
                    for item in buffered {
                        match item {
                            WorkItem::Propose { paxos_id, request } => {
                                self.fail_request(paxos_id, request, RequestFailure::ReplicaGroupUnknown)
                            }
                            WorkItem::Packet { origin, message } => log::debug!(
                                "Dropping {} for {} from {}",
                                message.packet.name(),
                                paxos_id,
                                origin
                            ),
                            WorkItem::Tick { .. } => {}
                        }
                    }
                }
            }
        }
        tasks
    }

    fn fail_request(&self, paxos_id: PaxosID, request: Request, reason: RequestFailure) {
        log::warn!("Failing {:?} for {}: {:?}", request, paxos_id, reason);
        self.publish(Event::RequestFailed(RequestFailedEvent {
            timestamp: SystemTime::now(),
            paxos_id,
            request,
            reason,
        }));
    }
}

fn lock_instance<A: App>(instance: &InstancePtr<A>) -> MutexGuard<'_, PaxosInstance<A>> {
    instance.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
