use std::{
    collections::{HashMap, HashSet},
    sync::{
        mpsc::{self, Receiver, Sender, TryRecvError},
        Arc, Mutex,
    },
};

use multipaxos_rs::{
    networking::{messages::Message, network::Network},
    types::data_types::NodeID,
};

/// A mock network stub which passes messages from and to threads using channels.
///
/// Nodes in the shared `isolated` set neither send nor receive anything, which lets tests cut a node
/// off and reconnect it later.
#[derive(Clone)]
pub(crate) struct NetworkStub {
    me: NodeID,
    all_peers: HashMap<NodeID, Sender<(NodeID, Message)>>,
    inbox: Arc<Mutex<Receiver<(NodeID, Message)>>>,
    isolated: Arc<Mutex<HashSet<NodeID>>>,
}

impl NetworkStub {
    pub(crate) fn me(&self) -> NodeID {
        self.me
    }

    pub(crate) fn isolate(&self, node: NodeID) {
        self.isolated.lock().unwrap().insert(node);
    }

    pub(crate) fn reconnect(&self, node: NodeID) {
        self.isolated.lock().unwrap().remove(&node);
    }

    fn is_isolated(&self, node: &NodeID) -> bool {
        self.isolated.lock().unwrap().contains(node)
    }
}

impl Network for NetworkStub {
    fn send(&mut self, peer: NodeID, message: Message) {
        if self.is_isolated(&self.me) || self.is_isolated(&peer) {
            return;
        }
        if let Some(peer) = self.all_peers.get(&peer) {
            let _ = peer.send((self.me, message));
        }
    }

    fn recv(&mut self) -> Option<(NodeID, Message)> {
        loop {
            let (origin, message) = match self.inbox.lock().unwrap().try_recv() {
                Ok(o_m) => o_m,
                Err(TryRecvError::Empty) => return None,
                Err(TryRecvError::Disconnected) => panic!(),
            };
            if !self.is_isolated(&self.me) {
                return Some((origin, message));
            }
        }
    }
}

pub(crate) fn mock_network(peers: impl Iterator<Item = NodeID>) -> Vec<NetworkStub> {
    let mut all_peers = HashMap::new();
    let isolated = Arc::new(Mutex::new(HashSet::new()));
    let peer_and_inboxes: Vec<(NodeID, Receiver<(NodeID, Message)>)> = peers
        .map(|peer| {
            let (sender, receiver) = mpsc::channel();
            all_peers.insert(peer, sender);

            (peer, receiver)
        })
        .collect();

    peer_and_inboxes
        .into_iter()
        .map(|(me, inbox)| NetworkStub {
            me,
            all_peers: all_peers.clone(),
            inbox: Arc::new(Mutex::new(inbox)),
            isolated: isolated.clone(),
        })
        .collect()
}
