/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Functions for receiving messages from the P2P network.

use std::{
    sync::mpsc::{Receiver, TryRecvError},
    thread::{self, JoinHandle},
};

use crate::{paxos::messages::MESSAGE_SCHEMA_VERSION, types::data_types::NodeID};

use super::{messages::Message, network::Network};

/// Spawn the poller thread, which polls the [`Network`] for messages and passes every well-formed one
/// to `handler`, along with its origin.
///
/// Paxos messages of a different schema version are dropped here, since their contents cannot be
/// trusted to mean what this replica thinks they mean.
pub(crate) fn start_polling<N, H>(mut network: N, shutdown_signal: Receiver<()>, mut handler: H) -> JoinHandle<()>
where
    N: Network + 'static,
    H: FnMut(NodeID, Message) + Send + 'static,
{
    thread::spawn(move || loop {
        match shutdown_signal.try_recv() {
            Ok(()) | Err(TryRecvError::Disconnected) => return,
            Err(TryRecvError::Empty) => (),
        }

        match network.recv() {
            Some((origin, Message::Paxos(msg))) if msg.envelope.schema_version != MESSAGE_SCHEMA_VERSION => {
                log::warn!(
                    "Dropping {} for {} from {}: schema version {} is not {}",
                    msg.packet.name(),
                    msg.envelope.paxos_id,
                    origin,
                    msg.envelope.schema_version,
                    MESSAGE_SCHEMA_VERSION
                );
            }
            Some((origin, msg)) => handler(origin, msg),
            None => thread::yield_now(),
        }
    })
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc::{self, Sender};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use super::*;
    use crate::failure_detection::messages::FailureDetect;
    use crate::paxos::messages::{PaxosMessage, SyncDecisions};
    use crate::types::data_types::{PaxosID, Slot, Version};

    /// A network whose inbox is filled by the test.
    #[derive(Clone)]
    struct Inbox(Arc<Mutex<Vec<(NodeID, Message)>>>);

    impl Network for Inbox {
        fn send(&mut self, _peer: NodeID, _message: Message) {}

        fn recv(&mut self) -> Option<(NodeID, Message)> {
            self.0.lock().unwrap().pop()
        }
    }

    fn sync_request(schema_version: u8) -> Message {
        let mut msg = PaxosMessage::new(
            PaxosID::new("alice"),
            Version::new(0),
            SyncDecisions {
                node_id: NodeID::new(2),
                max_decision_slot: None,
                missing_slots: vec![Slot::new(0)],
                missing_too_much: false,
            },
        );
        msg.envelope.schema_version = schema_version;
        Message::Paxos(msg)
    }

    #[test]
    fn messages_of_another_schema_are_dropped() {
        let inbox = Inbox(Arc::new(Mutex::new(vec![
            (NodeID::new(2), sync_request(MESSAGE_SCHEMA_VERSION)),
            (NodeID::new(2), sync_request(MESSAGE_SCHEMA_VERSION + 1)),
            (NodeID::new(3), FailureDetect::new(NodeID::new(3), NodeID::new(1)).into()),
        ])));

        let (delivered, deliveries): (Sender<NodeID>, _) = mpsc::channel();
        let (shutdown, shutdown_receiver) = mpsc::channel();
        let poller = start_polling(inbox, shutdown_receiver, move |origin, _| {
            let _ = delivered.send(origin);
        });

        let mut origins = Vec::new();
        while let Ok(origin) = deliveries.recv_timeout(Duration::from_millis(500)) {
            origins.push(origin);
        }
        shutdown.send(()).unwrap();
        poller.join().unwrap();

        assert_eq!(origins, vec![NodeID::new(3), NodeID::new(2)]);
    }
}
