//! Pluggable peer-to-peer (P2P) networking.
//!
//! Users supply an implementation of [`Network`](network::Network). The replica drives it from two
//! sides: a poller thread [receives](receiving) every message and hands it to the replica, and workers
//! [send](sending) the messages that paxos instances produce.

pub mod network;

pub mod messages;

pub(crate) mod receiving;

pub(crate) mod sending;
