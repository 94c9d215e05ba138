/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The [`Network`] trait.

use crate::types::data_types::NodeID;

use super::messages::Message;

/// Methods that a type needs to implement to serve as the transport between replicas.
///
/// Delivery may be lossy and unordered: paxos instances retransmit what they need. A replica clones its
/// network once for every thread that sends or receives, so clones must share the same underlying
/// transport.
pub trait Network: Clone + Send {
    /// Send a message to the specified peer without blocking.
    fn send(&mut self, peer: NodeID, message: Message);

    /// Receive a message from any peer. Returns immediately with a None if no message is available now.
    fn recv(&mut self) -> Option<(NodeID, Message)>;
}
