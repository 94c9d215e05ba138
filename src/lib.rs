//! A multi-decree Paxos replication engine.
//!
//! A [replica](replica) hosts many independent paxos instances. Each instance replicates a totally
//! ordered log of [requests](types::request::Request) on its own
//! [replica group](types::replica_group::ReplicaGroup), and executes the log on the replica's
//! [app](app::App). Instances are persisted in a [log directory](logger), checkpoint their app state
//! periodically to bound that log, and catch lagging members up through a sync protocol.
//!
//! Library users provide three things:
//! 1. An [`App`](app::App): the replicated state machine.
//! 2. A [`Network`](networking::network::Network): the transport between replicas.
//! 3. A [`Configuration`](replica::Configuration).

pub mod types;

pub mod paxos;

pub mod logger;

pub mod failure_detection;

pub mod networking;

pub mod app;

pub mod events;

pub mod replica;

pub(crate) mod manager;

pub(crate) mod logging;

pub(crate) mod event_bus;
