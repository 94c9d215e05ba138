/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Methods to build and run a replica.
//!
//! A replica is one node of the system. It hosts any number of paxos instances, each replicated on
//! its own group of nodes, and persists all of them in one log directory.
//!
//! The key components of this module are:
//! - The builder-pattern interface to construct a [specification of the replica](ReplicaSpec) with:
//!   1. `ReplicaSpec::builder` to construct a `ReplicaSpecBuilder`,
//!   2. The setters of the `ReplicaSpecBuilder`, and
//!   3. The `ReplicaSpecBuilder::build` method to construct a [ReplicaSpec],
//! - The function to [start](ReplicaSpec::start) a [Replica] given its specification,
//! - [The type](Replica) which keeps the replica alive, and through which instances are created and
//!   requests proposed.
//!
//! ## Starting a replica
//!
//! Here is an example that demonstrates how to build and start running a replica using the builder
//! pattern:
//!
//! ```ignore
//! let replica =
//!     ReplicaSpec::builder()
//!     .app(app)
//!     .network(network)
//!     .configuration(configuration)
//!     .on_execute(execute_handler)
//!     .build()
//!     .start()?;
//!
//! replica.create_instance(PaxosID::new("alice"), Version::new(0), group)?;
//! replica.propose(PaxosID::new("alice"), request)?;
//! ```
//!
//! ### Required setters
//!
//! The required setters are for providing the trait implementations required to run a replica:
//! - `.app(...)`
//! - `.network(...)`
//! - `.configuration(...)`
//!
//! ### Optional setters
//!
//! The optional setters are for registering user-defined event handlers for events from
//! [crate::events]:
//! - `.on_create_instance(...)`
//! - `.on_stop_instance(...)`
//! - `.on_recover_instance(...)`
//! - `.on_propose(...)`
//! - `.on_accept(...)`
//! - `.on_decide(...)`
//! - `.on_execute(...)`
//! - `.on_checkpoint(...)`
//! - `.on_garbage_collect(...)`
//! - `.on_run_for_coordinator(...)`
//! - `.on_become_active(...)`
//! - `.on_preempted(...)`
//! - `.on_start_sync(...)`
//! - `.on_receive_sync_request(...)`
//! - `.on_restore_checkpoint(...)`
//! - `.on_find_replica_group(...)`
//! - `.on_request_failed(...)`
//!
//! The replica's [configuration](Configuration) can also be defined using the builder pattern, for
//! example:
//!
//! ```ignore
//! let configuration =
//!     Configuration::builder()
//!     .me(NodeID::new(1))
//!     .log_dir(PathBuf::from("/var/lib/paxos"))
//!     .log_events(true)
//!     .checkpoint_interval(100)
//!     .build()
//! ```

use std::fmt::{self, Display, Formatter};
use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use typed_builder::TypedBuilder;

use crate::app::App;
use crate::event_bus::*;
use crate::events::*;
use crate::logger::{LoggerConfiguration, PaxosLogger, PaxosLoggerError};
use crate::manager::workers::{self, Dispatcher, WorkItem};
use crate::manager::{ManagerConfiguration, PaxosManager};
use crate::networking::{messages::Message, network::Network, receiving::start_polling};
use crate::paxos::instance::{InstanceConfiguration, InstanceContext};
use crate::paxos::InstanceStatus;
use crate::types::{
    data_types::{NodeID, PaxosID, Version},
    replica_group::ReplicaGroup,
    request::Request,
    tombstone::Tombstone,
};

pub use crate::manager::CreateInstanceError;

/// Stores the user-defined parameters required to start the replica.
///
/// ## Timeouts
///
/// Retransmissions of Prepares and Accepts start after `prepare_timeout` and `accept_timeout`
/// respectively, and every further retransmission waits 1.5 times longer than the one before. A peer is considered
/// down after `node_detection_timeout` without any message from it. Backoff stops growing after 20
/// retransmissions.
///
/// ## Batching
///
/// While `max_inflight_proposals` proposals are undecided, the coordinator queues further requests. Queued
/// requests are proposed in batches of up to `max_batch_requests` as soon as a slot is decided, or at the
/// next tick. Every request of a batch is executed on its own, in order, in the batch's slot.
///
/// ## Log Events
///
/// The replica logs using the [log](https://docs.rs/log/latest/log/) crate. To get these messages
/// printed onto a terminal or to a file, set up a [logging
/// implementation](https://docs.rs/log/latest/log/#available-logging-implementations).
#[derive(Clone, Debug, TypedBuilder)]
#[builder(builder_method(doc =
    "
    Create a builder for building a [Configuration]. On the builder call the following methods to construct a valid [Configuration].

    Required:
    - `.me(...)`
    - `.log_dir(...)`
    - `.log_events(...)`

    Every other setter is optional.
"
))]
pub struct Configuration {
    #[builder(setter(doc = "Set the ID of this node. Required."))]
    pub me: NodeID,
    #[builder(setter(into, doc = "Set the directory the persistent log is kept in. Required."))]
    pub log_dir: PathBuf,
    #[builder(setter(doc = "Enable logging of every event? Required."))]
    pub log_events: bool,
    #[builder(default = 400, setter(doc = "Set the number of executed slots between checkpoints. Defaults to 400."))]
    pub checkpoint_interval: u64,
    #[builder(default = 1600, setter(doc = "Set the gap between the next slot to execute and the highest known decision \
    above which a decision triggers a sync. Defaults to 1600."))]
    pub sync_threshold: u64,
    #[builder(default = 400, setter(doc = "Set the maximum number of missing slots asked for in one sync request. \
    A larger gap makes the peer send its checkpoint instead. Defaults to 400."))]
    pub max_sync_decisions_gap: u64,
    #[builder(default = Duration::from_secs(1), setter(doc = "Set the minimum time between two sync requests of one instance. Defaults to 1s."))]
    pub min_resync_delay: Duration,
    #[builder(default = Duration::from_secs(1), setter(doc = "Set the time after which a Prepare is first retransmitted. Defaults to 1s."))]
    pub prepare_timeout: Duration,
    #[builder(default = Duration::from_secs(1), setter(doc = "Set the time after which an Accept is first retransmitted. Defaults to 1s."))]
    pub accept_timeout: Duration,
    #[builder(default = Duration::from_secs(6), setter(doc = "Set the silence after which a peer is considered down. Defaults to 6s."))]
    pub node_detection_timeout: Duration,
    #[builder(default = Duration::from_millis(100), setter(doc = "Set the period of the timer thread. Defaults to 100ms."))]
    pub tick_interval: Duration,
    #[builder(default = 4, setter(doc = "Set the number of threads that handle packets. Defaults to 4."))]
    pub worker_threads: usize,
    #[builder(default = 64, setter(doc = "Set the maximum number of packets a worker handles before sending what they produced. Defaults to 64."))]
    pub max_batch_size: usize,
    #[builder(default = 10000, setter(doc = "Set the number of records per log file. Defaults to 10000."))]
    pub max_log_messages: u64,
    #[builder(default = Duration::from_secs(1), setter(doc = "Set the period at which peers are asked again for an unknown replica group. Defaults to 1s."))]
    pub find_group_retry_interval: Duration,
    #[builder(default = 5, setter(doc = "Set the number of times peers are asked for an unknown replica group before the \
    work waiting for it is given up on. Defaults to 5."))]
    pub max_find_group_attempts: u32,
    #[builder(default = Duration::from_secs(3), setter(doc = "Set the time after which a request proposed at this replica and not yet \
    executed is forwarded again. Defaults to 3s."))]
    pub request_timeout: Duration,
    #[builder(default = 3, setter(doc = "Set the number of times a request is forwarded again before it is failed. Defaults to 3."))]
    pub max_request_retries: u32,
    #[builder(default = 32, setter(doc = "Set the number of undecided proposals above which a coordinator queues new requests, \
    to propose them together once a slot is decided or at the next tick. Defaults to 32."))]
    pub max_inflight_proposals: usize,
    #[builder(default = 64, setter(doc = "Set the maximum number of queued requests proposed together in one slot. Defaults to 64."))]
    pub max_batch_requests: usize,
    #[builder(default = true, setter(doc = "Sync log files to disk after every write? Defaults to true."))]
    pub sync_log_writes: bool,
}

impl Into<(InstanceConfiguration, ManagerConfiguration, LoggerConfiguration)> for Configuration {
    fn into(self) -> (InstanceConfiguration, ManagerConfiguration, LoggerConfiguration) {
        let instance_config = InstanceConfiguration {
            me: self.me,
            checkpoint_interval: self.checkpoint_interval,
            sync_threshold: self.sync_threshold,
            max_sync_decisions_gap: self.max_sync_decisions_gap,
            min_resync_delay: self.min_resync_delay,
            prepare_timeout: self.prepare_timeout,
            accept_timeout: self.accept_timeout,
            request_timeout: self.request_timeout,
            max_request_retries: self.max_request_retries,
            max_inflight_proposals: self.max_inflight_proposals,
            max_batch_requests: self.max_batch_requests,
        };
        let manager_config = ManagerConfiguration {
            node_detection_timeout: self.node_detection_timeout,
            find_group_retry_interval: self.find_group_retry_interval,
            max_find_group_attempts: self.max_find_group_attempts,
        };
        let logger_config = LoggerConfiguration {
            log_dir: self.log_dir,
            max_log_messages: self.max_log_messages,
            sync_log_writes: self.sync_log_writes,
        };
        (instance_config, manager_config, logger_config)
    }
}

/// Reasons why a replica could not [start](ReplicaSpec::start).
#[derive(Debug)]
pub enum StartReplicaError {
    LogDirectory(io::Error),
    Recovery(PaxosLoggerError),
}

impl Display for StartReplicaError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            StartReplicaError::LogDirectory(err) => write!(f, "log directory unusable: {}", err),
            StartReplicaError::Recovery(err) => write!(f, "recovery failed: {}", err),
        }
    }
}

impl std::error::Error for StartReplicaError {}

impl From<PaxosLoggerError> for StartReplicaError {
    fn from(value: PaxosLoggerError) -> Self {
        StartReplicaError::Recovery(value)
    }
}

/// Reasons why [`Replica::propose`] can refuse a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProposeError {
    /// The instance has executed a stop request.
    InstanceStopped,
    ShuttingDown,
}

impl Display for ProposeError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            ProposeError::InstanceStopped => write!(f, "instance is stopped"),
            ProposeError::ShuttingDown => write!(f, "replica is shutting down"),
        }
    }
}

impl std::error::Error for ProposeError {}

/// Stores all necessary parameters and trait implementations required to run the [Replica].
#[derive(TypedBuilder)]
#[builder(builder_method(doc =
    "
    Create a builder for building a [ReplicaSpec]. On the builder call the following methods to construct a valid [ReplicaSpec].

    Required:
    - `.app(...)`
    - `.network(...)`
    - `.configuration(...)`

    Optional:
    - `.on_create_instance(...)`
    - `.on_stop_instance(...)`
    - `.on_recover_instance(...)`
    - `.on_propose(...)`
    - `.on_accept(...)`
    - `.on_decide(...)`
    - `.on_execute(...)`
    - `.on_checkpoint(...)`
    - `.on_garbage_collect(...)`
    - `.on_run_for_coordinator(...)`
    - `.on_become_active(...)`
    - `.on_preempted(...)`
    - `.on_start_sync(...)`
    - `.on_receive_sync_request(...)`
    - `.on_restore_checkpoint(...)`
    - `.on_find_replica_group(...)`
    - `.on_request_failed(...)`
"
))]
pub struct ReplicaSpec<A: App, N: Network + 'static> {
    // Required parameters
    #[builder(setter(doc = "Set the application whose state the replica replicates. The argument must implement the [App](crate::app::App) trait. Required."))]
    app: A,
    #[builder(setter(doc = "Set the implementation of peer-to-peer networking. The argument must implement the [Network](crate::networking::network::Network) trait. Required."))]
    network: N,
    #[builder(setter(doc = "Set the [configuration](Configuration), which contains the necessary parameters to run a replica. Required."))]
    configuration: Configuration,
    // Optional parameters
    #[builder(default, setter(transform = |handler: impl Fn(&CreateInstanceEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<CreateInstanceEvent>),
    doc = "Register a handler closure to be invoked after the replica creates a paxos instance. Optional."))]
    on_create_instance: Option<HandlerPtr<CreateInstanceEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&StopInstanceEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<StopInstanceEvent>),
    doc = "Register a handler closure to be invoked after a paxos instance executes a stop. Optional."))]
    on_stop_instance: Option<HandlerPtr<StopInstanceEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&RecoverInstanceEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<RecoverInstanceEvent>),
    doc = "Register a handler closure to be invoked after a paxos instance is restarted from the log. Optional."))]
    on_recover_instance: Option<HandlerPtr<RecoverInstanceEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&ProposeEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<ProposeEvent>),
    doc = "Register a handler closure to be invoked after the replica, as coordinator, sends an accept. Optional."))]
    on_propose: Option<HandlerPtr<ProposeEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&AcceptEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<AcceptEvent>),
    doc = "Register a handler closure to be invoked after the replica's acceptor accepts a pvalue. Optional."))]
    on_accept: Option<HandlerPtr<AcceptEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&DecideEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<DecideEvent>),
    doc = "Register a handler closure to be invoked after the replica, as coordinator, learns that a majority accepted a pvalue. Optional."))]
    on_decide: Option<HandlerPtr<DecideEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&ExecuteEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<ExecuteEvent>),
    doc = "Register a handler closure to be invoked after a decided request is executed by the app. Optional."))]
    on_execute: Option<HandlerPtr<ExecuteEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&CheckpointEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<CheckpointEvent>),
    doc = "Register a handler closure to be invoked after a checkpoint is stored. Optional."))]
    on_checkpoint: Option<HandlerPtr<CheckpointEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&GarbageCollectEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<GarbageCollectEvent>),
    doc = "Register a handler closure to be invoked after accepted pvalues are garbage collected. Optional."))]
    on_garbage_collect: Option<HandlerPtr<GarbageCollectEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&RunForCoordinatorEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<RunForCoordinatorEvent>),
    doc = "Register a handler closure to be invoked after the replica starts running for coordinator. Optional."))]
    on_run_for_coordinator: Option<HandlerPtr<RunForCoordinatorEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&BecomeActiveEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<BecomeActiveEvent>),
    doc = "Register a handler closure to be invoked after the replica becomes the active coordinator of an instance. Optional."))]
    on_become_active: Option<HandlerPtr<BecomeActiveEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&PreemptedEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<PreemptedEvent>),
    doc = "Register a handler closure to be invoked after the replica stops coordinating because of a higher ballot. Optional."))]
    on_preempted: Option<HandlerPtr<PreemptedEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&StartSyncEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<StartSyncEvent>),
    doc = "Register a handler closure to be invoked after the replica asks a peer for missing decisions. Optional."))]
    on_start_sync: Option<HandlerPtr<StartSyncEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&ReceiveSyncRequestEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<ReceiveSyncRequestEvent>),
    doc = "Register a handler closure to be invoked after the replica receives a sync request from a peer. Optional."))]
    on_receive_sync_request: Option<HandlerPtr<ReceiveSyncRequestEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&RestoreCheckpointEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<RestoreCheckpointEvent>),
    doc = "Register a handler closure to be invoked after the replica installs a checkpoint sent by a peer. Optional."))]
    on_restore_checkpoint: Option<HandlerPtr<RestoreCheckpointEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&FindReplicaGroupEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<FindReplicaGroupEvent>),
    doc = "Register a handler closure to be invoked after the replica asks its peers for the group of an unknown instance. Optional."))]
    on_find_replica_group: Option<HandlerPtr<FindReplicaGroupEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&RequestFailedEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<RequestFailedEvent>),
    doc = "Register a handler closure to be invoked after a request proposed at the replica is given up on. Optional."))]
    on_request_failed: Option<HandlerPtr<RequestFailedEvent>>,
}

impl<A: App, N: Network + 'static> ReplicaSpec<A, N> {
    /// Recovers every paxos instance from the log directory, then starts all threads and channels
    /// associated with running a replica, and returns the handles to them in a [Replica] struct.
    pub fn start(self) -> Result<Replica<A>, StartReplicaError> {
        let log_events = self.configuration.log_events;
        let worker_threads = self.configuration.worker_threads;
        let max_batch_size = self.configuration.max_batch_size;
        let tick_interval = self.configuration.tick_interval;
        let (instance_config, manager_config, logger_config) = self.configuration.into();

        fs::create_dir_all(&logger_config.log_dir).map_err(StartReplicaError::LogDirectory)?;
        let (logger, recovery) = PaxosLogger::open(logger_config)?;

        let event_handlers = EventHandlers::new(
            log_events,
            UserHandlers {
                on_create_instance: self.on_create_instance,
                on_stop_instance: self.on_stop_instance,
                on_recover_instance: self.on_recover_instance,
                on_propose: self.on_propose,
                on_accept: self.on_accept,
                on_decide: self.on_decide,
                on_execute: self.on_execute,
                on_checkpoint: self.on_checkpoint,
                on_garbage_collect: self.on_garbage_collect,
                on_run_for_coordinator: self.on_run_for_coordinator,
                on_become_active: self.on_become_active,
                on_preempted: self.on_preempted,
                on_start_sync: self.on_start_sync,
                on_receive_sync_request: self.on_receive_sync_request,
                on_restore_checkpoint: self.on_restore_checkpoint,
                on_find_replica_group: self.on_find_replica_group,
                on_request_failed: self.on_request_failed,
            },
        );

        let (event_publisher, event_subscriber) = if !event_handlers.is_empty() {
            Some(mpsc::channel()).unzip()
        } else {
            (None, None)
        };

        let (event_bus, event_bus_shutdown) = match event_subscriber {
            Some(event_subscriber) => {
                let (event_bus_shutdown, event_bus_shutdown_receiver) = mpsc::channel();
                let event_bus = start_event_bus(event_handlers, event_subscriber, event_bus_shutdown_receiver);
                (Some(event_bus), Some(event_bus_shutdown))
            }
            None => (None, None),
        };

        let context = InstanceContext {
            config: instance_config,
            app: Arc::new(Mutex::new(self.app)),
            logger: Arc::new(logger),
            event_publisher,
        };
        let (dispatcher, queues) = Dispatcher::new(worker_threads);
        let manager = Arc::new(PaxosManager::new(
            manager_config,
            context,
            recovery,
            dispatcher.clone(),
            Instant::now(),
        ));

        let mut workers = Vec::new();
        let mut workers_shutdown = Vec::new();
        for queue in queues {
            let (worker_shutdown, worker_shutdown_receiver) = mpsc::channel();
            workers.push(workers::start_worker(
                manager.clone(),
                self.network.clone(),
                queue,
                max_batch_size,
                worker_shutdown_receiver,
            ));
            workers_shutdown.push(worker_shutdown);
        }

        let (poller_shutdown, poller_shutdown_receiver) = mpsc::channel();
        let poller_manager = manager.clone();
        let poller = start_polling(self.network.clone(), poller_shutdown_receiver, move |origin, message| {
            poller_manager.heard_from(origin, Instant::now());
            match message {
                Message::Paxos(message) => {
                    poller_manager.dispatcher().dispatch(WorkItem::Packet { origin, message });
                }
                Message::FailureDetect(ping) => log::debug!("Keep-alive from {} to {}", ping.sender, ping.responder),
            }
        });

        let (ticker_shutdown, ticker_shutdown_receiver) = mpsc::channel();
        let ticker = workers::start_ticker(manager.clone(), self.network, tick_interval, ticker_shutdown_receiver);

        Ok(Replica {
            manager,
            dispatcher,
            ticker: Some(ticker),
            ticker_shutdown,
            poller: Some(poller),
            poller_shutdown,
            workers,
            workers_shutdown,
            event_bus,
            event_bus_shutdown,
        })
    }
}

/// A handle to the background threads of a replica. When this value is dropped, all background
/// threads are gracefully shut down.
pub struct Replica<A: App> {
    manager: Arc<PaxosManager<A>>,
    dispatcher: Dispatcher,
    ticker: Option<JoinHandle<()>>,
    ticker_shutdown: Sender<()>,
    poller: Option<JoinHandle<()>>,
    poller_shutdown: Sender<()>,
    workers: Vec<JoinHandle<()>>,
    workers_shutdown: Vec<Sender<()>>,
    event_bus: Option<JoinHandle<()>>,
    event_bus_shutdown: Option<Sender<()>>,
}

impl<A: App> Replica<A> {
    /// Create the paxos instance `paxos_id` replicated on `group`, or replace an older version of it.
    /// Every member of `group` has to create the instance, or learn about it from a member that did.
    ///
    /// # Return value
    /// `Ok(false)` if this version of the instance already exists.
    pub fn create_instance(
        &self,
        paxos_id: PaxosID,
        version: Version,
        group: ReplicaGroup,
    ) -> Result<bool, CreateInstanceError> {
        self.manager.create_instance(paxos_id, version, group, Instant::now())
    }

    /// Propose `request` to the paxos instance `paxos_id`.
    ///
    /// Returning `Ok` means the request was handed to the instance, not that it was executed. Whether
    /// it is executed can be observed through the app, or through `on_execute` and `on_request_failed`
    /// handlers.
    pub fn propose(&self, paxos_id: PaxosID, request: Request) -> Result<(), ProposeError> {
        if self.manager.tombstone(&paxos_id).is_some() {
            return Err(ProposeError::InstanceStopped);
        }
        if self.dispatcher.dispatch(WorkItem::Propose { paxos_id, request }) {
            Ok(())
        } else {
            Err(ProposeError::ShuttingDown)
        }
    }

    /// Get the state of the paxos instance `paxos_id` at this replica, if the replica hosts it.
    pub fn instance_status(&self, paxos_id: &PaxosID) -> Option<InstanceStatus> {
        self.manager.status(paxos_id)
    }

    /// Get what remains of the paxos instance `paxos_id`, if it has stopped.
    pub fn tombstone(&self, paxos_id: &PaxosID) -> Option<Tombstone> {
        self.manager.tombstone(paxos_id)
    }

    /// Whether executing `request` stops the instance it is decided in.
    pub fn is_stop_command(request: &Request) -> bool {
        request.is_stop()
    }
}

fn shutdown_thread(name: &str, shutdown: &Sender<()>, thread: Option<JoinHandle<()>>) {
    let _ = shutdown.send(());
    if let Some(thread) = thread {
        if thread.join().is_err() {
            log::error!("The {} thread panicked", name);
        }
    }
}

impl<A: App> Drop for Replica<A> {
    fn drop(&mut self) {
        // The ticker and the poller feed the workers, and everything feeds the event bus, so threads
        // are shut down in that order.
        shutdown_thread("ticker", &self.ticker_shutdown, self.ticker.take());
        shutdown_thread("poller", &self.poller_shutdown, self.poller.take());

        for (shutdown, worker) in self.workers_shutdown.iter().zip(self.workers.drain(..)) {
            shutdown_thread("worker", shutdown, Some(worker));
        }

        if let Some(event_bus_shutdown) = &self.event_bus_shutdown {
            shutdown_thread("event bus", event_bus_shutdown, self.event_bus.take());
        }
    }
}
