//! [`LogApp`], a simple implementation of [`App`] used in all of the integration tests.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use borsh::{BorshDeserialize, BorshSerialize};
use multipaxos_rs::{
    app::App,
    types::{
        data_types::{Data, PaxosID, Slot},
        request::Request,
    },
};

/// The requests executed by one instance, as `(slot, request ID)` pairs in execution order.
pub(crate) type ExecutedLog = Vec<(u64, u64)>;

/// An app whose state is the list of requests it executed, per instance.
///
/// The state lives behind an `Arc` that the test keeps a clone of, so it outlives the replica. This
/// makes the app durable across a simulated crash and restart. Executing a `(slot, request)` pair that
/// is already in the log is a no-op, since a restarted replica may deliver its last slot again.
#[derive(Clone)]
pub(crate) struct LogApp {
    state: Arc<Mutex<HashMap<PaxosID, ExecutedLog>>>,
}

impl LogApp {
    pub(crate) fn new() -> LogApp {
        LogApp {
            state: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Get the IDs of the requests executed by `paxos_id`, in execution order.
    pub(crate) fn executed(&self, paxos_id: &PaxosID) -> Vec<u64> {
        self.state
            .lock()
            .unwrap()
            .get(paxos_id)
            .map(|log| log.iter().map(|(_, id)| *id).collect())
            .unwrap_or_default()
    }
}

impl App for LogApp {
    fn execute(&mut self, paxos_id: &PaxosID, slot: Slot, request: &Request) -> bool {
        let mut state = self.state.lock().unwrap();
        let log = state.entry(paxos_id.clone()).or_default();
        let entry = (slot.int(), request.id.int());
        if !log.contains(&entry) {
            log.push(entry);
        }
        true
    }

    fn checkpoint(&mut self, paxos_id: &PaxosID) -> Data {
        let state = self.state.lock().unwrap();
        let log = state.get(paxos_id).cloned().unwrap_or_default();
        Data::new(log.try_to_vec().unwrap())
    }

    fn restore(&mut self, paxos_id: &PaxosID, state: Option<&Data>) -> bool {
        let log = match state {
            Some(state) => match ExecutedLog::try_from_slice(state.bytes()) {
                Ok(log) => log,
                Err(_) => return false,
            },
            None => ExecutedLog::new(),
        };
        self.state.lock().unwrap().insert(paxos_id.clone(), log);
        true
    }
}
