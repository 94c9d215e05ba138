use std::{
    path::PathBuf,
    sync::{Arc, Mutex},
    thread,
    time::{Duration, Instant},
};

use multipaxos_rs::{
    events::{
        BecomeActiveEvent, CheckpointEvent, ExecuteEvent, FindReplicaGroupEvent, GarbageCollectEvent,
        RestoreCheckpointEvent, StartSyncEvent, StopInstanceEvent,
    },
    paxos::InstanceStatus,
    replica::{Configuration, CreateInstanceError, ProposeError, Replica, ReplicaSpec},
    types::{
        data_types::{ClientID, NodeID, PaxosID, RequestID, Version},
        replica_group::ReplicaGroup,
        request::Request,
        tombstone::Tombstone,
    },
};
use tempdir::TempDir;

use crate::common::{app::LogApp, network::NetworkStub};

use super::logging::{first_seven_base64_chars, log_with_context, secs_since_unix_epoch};

/// Parameters the nodes of a test share.
#[derive(Clone, Copy)]
pub(crate) struct TestParameters {
    pub(crate) checkpoint_interval: u64,
    pub(crate) sync_threshold: u64,
    pub(crate) max_sync_decisions_gap: u64,
}

impl Default for TestParameters {
    fn default() -> Self {
        TestParameters {
            checkpoint_interval: 400,
            sync_threshold: 1600,
            max_sync_decisions_gap: 400,
        }
    }
}

/// Counts of the events seen at a node.
#[derive(Default)]
pub(crate) struct EventCounts {
    pub(crate) garbage_collections: usize,
    pub(crate) syncs: usize,
    pub(crate) checkpoint_restores: usize,
    pub(crate) group_lookups: usize,
}

/// Things the Nodes will have in common:
/// - Configuration.
///
/// Things that they will differ in:
/// - App instance.
/// - Network instance.
/// - Log directory.
///
/// The app, network and log directory outlive the replica, so a node can be
/// [crashed](Node::crash) and [restarted](Node::restart) with its durable state intact.
pub(crate) struct Node {
    me: NodeID,
    app: LogApp,
    network: NetworkStub,
    log_dir: TempDir,
    parameters: TestParameters,
    events: Arc<Mutex<EventCounts>>,
    replica: Option<Replica<LogApp>>,
}

impl Node {
    pub(crate) fn new(network: NetworkStub, parameters: TestParameters) -> Node {
        let me = network.me();
        let log_dir = TempDir::new(&format!("paxos_node_{}", me)).unwrap();
        let mut node = Node {
            me,
            app: LogApp::new(),
            network,
            log_dir,
            parameters,
            events: Arc::new(Mutex::new(EventCounts::default())),
            replica: None,
        };
        node.restart();
        node
    }

    /// Start the replica of this node from its log directory.
    pub(crate) fn restart(&mut self) {
        assert!(self.replica.is_none(), "node {} is already running", self.me);

        let configuration = Configuration::builder()
            .me(self.me)
            .log_dir(PathBuf::from(self.log_dir.path()))
            .log_events(false)
            .checkpoint_interval(self.parameters.checkpoint_interval)
            .sync_threshold(self.parameters.sync_threshold)
            .max_sync_decisions_gap(self.parameters.max_sync_decisions_gap)
            .min_resync_delay(Duration::from_millis(200))
            .prepare_timeout(Duration::from_millis(300))
            .accept_timeout(Duration::from_millis(300))
            .node_detection_timeout(Duration::from_secs(1))
            .tick_interval(Duration::from_millis(50))
            .worker_threads(2)
            .max_log_messages(50)
            .find_group_retry_interval(Duration::from_millis(300))
            .max_find_group_attempts(20)
            .request_timeout(Duration::from_secs(2))
            .max_request_retries(10)
            .sync_log_writes(false)
            .build();

        let replica = ReplicaSpec::builder()
            .app(self.app.clone())
            .network(self.network.clone())
            .configuration(configuration)
            .on_execute(execute_handler(self.me))
            .on_become_active(become_active_handler(self.me))
            .on_stop_instance(stop_instance_handler(self.me))
            .on_checkpoint(checkpoint_handler(self.me))
            .on_garbage_collect(garbage_collect_handler(self.me, self.events.clone()))
            .on_start_sync(start_sync_handler(self.me, self.events.clone()))
            .on_restore_checkpoint(restore_checkpoint_handler(self.me, self.events.clone()))
            .on_find_replica_group(find_replica_group_handler(self.me, self.events.clone()))
            .build()
            .start()
            .unwrap();

        self.replica = Some(replica);
    }

    /// Shut the replica of this node down, keeping its log directory and app.
    pub(crate) fn crash(&mut self) {
        self.replica = None;
    }

    fn replica(&self) -> &Replica<LogApp> {
        self.replica.as_ref().expect("node is not running")
    }

    pub(crate) fn me(&self) -> NodeID {
        self.me
    }

    pub(crate) fn network(&self) -> NetworkStub {
        self.network.clone()
    }

    pub(crate) fn create_instance(
        &self,
        paxos_id: &str,
        version: u32,
        group: &ReplicaGroup,
    ) -> Result<bool, CreateInstanceError> {
        self.replica()
            .create_instance(PaxosID::new(paxos_id), Version::new(version), group.clone())
    }

    pub(crate) fn propose(&self, paxos_id: &str, request_id: u64) -> Result<(), ProposeError> {
        self.replica()
            .propose(PaxosID::new(paxos_id), request(request_id))
    }

    pub(crate) fn propose_stop(&self, paxos_id: &str, request_id: u64) -> Result<(), ProposeError> {
        let stop = Request::stop(RequestID::new(request_id), ClientID::new(self.me.int() as u64), Vec::<u8>::new());
        self.replica().propose(PaxosID::new(paxos_id), stop)
    }

    pub(crate) fn executed(&self, paxos_id: &str) -> Vec<u64> {
        self.app.executed(&PaxosID::new(paxos_id))
    }

    pub(crate) fn status(&self, paxos_id: &str) -> Option<InstanceStatus> {
        self.replica().instance_status(&PaxosID::new(paxos_id))
    }

    pub(crate) fn tombstone(&self, paxos_id: &str) -> Option<Tombstone> {
        self.replica().tombstone(&PaxosID::new(paxos_id))
    }

    pub(crate) fn events(&self) -> std::sync::MutexGuard<'_, EventCounts> {
        self.events.lock().unwrap()
    }
}

pub(crate) fn request(request_id: u64) -> Request {
    Request::new(
        RequestID::new(request_id),
        ClientID::new(0),
        request_id.to_le_bytes().to_vec(),
    )
}

pub(crate) fn group(members: &[u32]) -> ReplicaGroup {
    ReplicaGroup::new(members.iter().map(|member| NodeID::new(*member)))
}

/// Poll `condition` every 100 milliseconds until it holds, panicking with `what` after `timeout`.
pub(crate) fn wait_until(what: &str, timeout: Duration, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + timeout;
    while !condition() {
        if Instant::now() > deadline {
            panic!("timed out waiting until {}", what);
        }
        thread::sleep(Duration::from_millis(100));
    }
}

fn execute_handler(me: NodeID) -> impl Fn(&ExecuteEvent) + Send + 'static {
    move |execute_event| {
        log_with_context(
            Some(me),
            &format!(
                "Executed, paxos ID: {}, slot: {}, request: {}, payload: {}",
                execute_event.paxos_id,
                execute_event.slot,
                execute_event.request.id,
                first_seven_base64_chars(execute_event.request.payload.bytes())
            ),
        );
    }
}

fn become_active_handler(me: NodeID) -> impl Fn(&BecomeActiveEvent) + Send + 'static {
    move |become_active_event| {
        log_with_context(
            Some(me),
            &format!(
                "Became coordinator, paxos ID: {}, ballot: {}, proposals carried over: {}",
                become_active_event.paxos_id, become_active_event.ballot, become_active_event.proposals
            ),
        );
    }
}

fn stop_instance_handler(me: NodeID) -> impl Fn(&StopInstanceEvent) + Send + 'static {
    move |stop_instance_event| {
        log_with_context(
            Some(me),
            &format!(
                "Stopped, paxos ID: {}, version: {}, slot: {}, at: {}",
                stop_instance_event.paxos_id,
                stop_instance_event.version,
                stop_instance_event.slot,
                secs_since_unix_epoch(stop_instance_event.timestamp)
            ),
        );
    }
}

fn checkpoint_handler(me: NodeID) -> impl Fn(&CheckpointEvent) + Send + 'static {
    move |checkpoint_event| {
        log_with_context(
            Some(me),
            &format!(
                "Checkpointed, paxos ID: {}, slot: {}",
                checkpoint_event.paxos_id, checkpoint_event.slot
            ),
        );
    }
}

fn garbage_collect_handler(
    me: NodeID,
    events: Arc<Mutex<EventCounts>>,
) -> impl Fn(&GarbageCollectEvent) + Send + 'static {
    move |garbage_collect_event| {
        events.lock().unwrap().garbage_collections += 1;
        log_with_context(
            Some(me),
            &format!(
                "Garbage collected, paxos ID: {}, up to slot: {}",
                garbage_collect_event.paxos_id, garbage_collect_event.gc_slot
            ),
        );
    }
}

fn start_sync_handler(
    me: NodeID,
    events: Arc<Mutex<EventCounts>>,
) -> impl Fn(&StartSyncEvent) + Send + 'static {
    move |start_sync_event| {
        events.lock().unwrap().syncs += 1;
        log_with_context(
            Some(me),
            &format!(
                "Started sync, paxos ID: {}, peer: {}, missing slots: {}, missing too much: {}",
                start_sync_event.paxos_id,
                start_sync_event.peer,
                start_sync_event.missing_slots.len(),
                start_sync_event.missing_too_much
            ),
        );
    }
}

fn restore_checkpoint_handler(
    me: NodeID,
    events: Arc<Mutex<EventCounts>>,
) -> impl Fn(&RestoreCheckpointEvent) + Send + 'static {
    move |restore_checkpoint_event| {
        events.lock().unwrap().checkpoint_restores += 1;
        log_with_context(
            Some(me),
            &format!(
                "Restored checkpoint, paxos ID: {}, slot: {}",
                restore_checkpoint_event.paxos_id, restore_checkpoint_event.slot
            ),
        );
    }
}

fn find_replica_group_handler(
    me: NodeID,
    events: Arc<Mutex<EventCounts>>,
) -> impl Fn(&FindReplicaGroupEvent) + Send + 'static {
    move |find_replica_group_event| {
        events.lock().unwrap().group_lookups += 1;
        log_with_context(
            Some(me),
            &format!(
                "Looking for replica group, paxos ID: {}, peers: {:?}, attempt: {}",
                find_replica_group_event.paxos_id,
                find_replica_group_event.peers,
                find_replica_group_event.attempt
            ),
        );
    }
}
