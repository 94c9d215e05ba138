/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The threads that drive a [`PaxosManager`]: a pool of workers, and a ticker.
//!
//! ## Workers
//!
//! Every [`WorkItem`] goes to the worker chosen by hashing its paxos ID, so the work of one instance
//! is done in order by one thread while different instances proceed in parallel. A worker drains up to
//! `max_batch_size` items at a time, then [batches](crate::paxos::batching) everything they produced
//! before sending it.
//!
//! ## Ticker
//!
//! Every `tick_interval` the ticker hands every instance a [`WorkItem::Tick`], sends the failure
//! detector's pings, and asks again for replica groups that are still unknown.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::app::App;
use crate::networking::{network::Network, sending::SenderHandle};
use crate::paxos::{batching, messages::PaxosMessage, MessagingTask};
use crate::types::{
    data_types::{NodeID, PaxosID},
    request::Request,
};

use super::PaxosManager;

/// How long an idle worker waits for work before checking for shutdown again.
const IDLE_WAIT: Duration = Duration::from_millis(10);

pub(crate) enum WorkItem {
    Packet { origin: NodeID, message: PaxosMessage },
    Propose { paxos_id: PaxosID, request: Request },
    Tick { paxos_id: PaxosID },
}

impl WorkItem {
    fn paxos_id(&self) -> &PaxosID {
        match self {
            WorkItem::Packet { message, .. } => message.paxos_id(),
            WorkItem::Propose { paxos_id, .. } => paxos_id,
            WorkItem::Tick { paxos_id } => paxos_id,
        }
    }
}

/// Hands work items to the worker responsible for their paxos ID.
#[derive(Clone)]
pub(crate) struct Dispatcher {
    workers: Vec<Sender<WorkItem>>,
}

impl Dispatcher {
    /// Create a dispatcher for `worker_threads` workers, along with the receiving end of every worker's
    /// queue.
    pub(crate) fn new(worker_threads: usize) -> (Dispatcher, Vec<Receiver<WorkItem>>) {
        let (workers, queues) = (0..worker_threads.max(1)).map(|_| mpsc::channel()).unzip();
        (Dispatcher { workers }, queues)
    }

    /// # Return value
    /// `false` if the responsible worker has shut down.
    pub(crate) fn dispatch(&self, item: WorkItem) -> bool {
        let mut hasher = DefaultHasher::new();
        item.paxos_id().hash(&mut hasher);
        let worker = (hasher.finish() % self.workers.len() as u64) as usize;
        self.workers[worker].send(item).is_ok()
    }
}

fn send_all<N: Network>(sender: &mut SenderHandle<N>, tasks: Vec<MessagingTask>) {
    for task in tasks {
        log::debug!("Sending {} to {:?}", task.message.summary(), task.recipients);
        sender.multicast(&task.recipients, task.message);
    }
}

pub(crate) fn start_worker<A: App, N: Network + 'static>(
    manager: Arc<PaxosManager<A>>,
    network: N,
    queue: Receiver<WorkItem>,
    max_batch_size: usize,
    shutdown_signal: Receiver<()>,
) -> JoinHandle<()> {
    thread::spawn(move || {
        let mut sender = SenderHandle::new(network);
        loop {
            match shutdown_signal.try_recv() {
                Ok(()) | Err(TryRecvError::Disconnected) => return,
                Err(TryRecvError::Empty) => (),
            }

            let first = match queue.recv_timeout(IDLE_WAIT) {
                Ok(item) => item,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => return,
            };

            let now = Instant::now();
            let mut tasks = manager.handle(first, now);
            for _ in 1..max_batch_size.max(1) {
                match queue.try_recv() {
                    Ok(item) => tasks.extend(manager.handle(item, now)),
                    Err(_) => break,
                }
            }
            send_all(&mut sender, batching::batch(tasks));
        }
    })
}

pub(crate) fn start_ticker<A: App, N: Network + 'static>(
    manager: Arc<PaxosManager<A>>,
    network: N,
    tick_interval: Duration,
    shutdown_signal: Receiver<()>,
) -> JoinHandle<()> {
    thread::spawn(move || {
        let mut sender = SenderHandle::new(network);
        loop {
            match shutdown_signal.recv_timeout(tick_interval) {
                Ok(()) | Err(RecvTimeoutError::Disconnected) => return,
                Err(RecvTimeoutError::Timeout) => (),
            }

            let now = Instant::now();
            for paxos_id in manager.instance_ids() {
                manager.dispatcher().dispatch(WorkItem::Tick { paxos_id });
            }
            send_all(&mut sender, manager.retry_find_groups(now));
            for (peer, ping) in manager.pings_due(now) {
                sender.send(peer, ping);
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_instance_same_worker() {
        let (dispatcher, queues) = Dispatcher::new(4);
        let tick = |name: &str| WorkItem::Tick {
            paxos_id: PaxosID::new(name),
        };

        for _ in 0..3 {
            assert!(dispatcher.dispatch(tick("alice")));
        }
        assert!(dispatcher.dispatch(tick("bob")));

        let alice_queue = queues
            .iter()
            .position(|queue| matches!(queue.try_recv(), Ok(WorkItem::Tick { paxos_id }) if paxos_id.as_str() == "alice"))
            .unwrap();
        assert_eq!(queues[alice_queue].try_iter().filter(|item| item.paxos_id().as_str() == "alice").count(), 2);
    }

    #[test]
    fn dispatch_fails_once_workers_are_gone() {
        let (dispatcher, queues) = Dispatcher::new(1);
        drop(queues);
        assert!(!dispatcher.dispatch(WorkItem::Tick {
            paxos_id: PaxosID::new("alice"),
        }));
    }
}
