/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The thread that calls event handlers.

use std::sync::mpsc::{Receiver, TryRecvError};
use std::thread::{self, JoinHandle};

use crate::events::*;
use crate::logging::Logger;

pub(crate) type HandlerPtr<T> = Box<dyn Fn(&T) + Send>;

pub(crate) struct EventHandlers {
    pub(crate) create_instance_handlers: Vec<HandlerPtr<CreateInstanceEvent>>,
    pub(crate) stop_instance_handlers: Vec<HandlerPtr<StopInstanceEvent>>,
    pub(crate) recover_instance_handlers: Vec<HandlerPtr<RecoverInstanceEvent>>,
    pub(crate) propose_handlers: Vec<HandlerPtr<ProposeEvent>>,
    pub(crate) accept_handlers: Vec<HandlerPtr<AcceptEvent>>,
    pub(crate) decide_handlers: Vec<HandlerPtr<DecideEvent>>,
    pub(crate) execute_handlers: Vec<HandlerPtr<ExecuteEvent>>,
    pub(crate) checkpoint_handlers: Vec<HandlerPtr<CheckpointEvent>>,
    pub(crate) garbage_collect_handlers: Vec<HandlerPtr<GarbageCollectEvent>>,
    pub(crate) run_for_coordinator_handlers: Vec<HandlerPtr<RunForCoordinatorEvent>>,
    pub(crate) become_active_handlers: Vec<HandlerPtr<BecomeActiveEvent>>,
    pub(crate) preempted_handlers: Vec<HandlerPtr<PreemptedEvent>>,
    pub(crate) start_sync_handlers: Vec<HandlerPtr<StartSyncEvent>>,
    pub(crate) receive_sync_request_handlers: Vec<HandlerPtr<ReceiveSyncRequestEvent>>,
    pub(crate) restore_checkpoint_handlers: Vec<HandlerPtr<RestoreCheckpointEvent>>,
    pub(crate) find_replica_group_handlers: Vec<HandlerPtr<FindReplicaGroupEvent>>,
    pub(crate) request_failed_handlers: Vec<HandlerPtr<RequestFailedEvent>>,
}

/// The user-supplied handler, if any, for every kind of event.
#[derive(Default)]
pub(crate) struct UserHandlers {
    pub(crate) on_create_instance: Option<HandlerPtr<CreateInstanceEvent>>,
    pub(crate) on_stop_instance: Option<HandlerPtr<StopInstanceEvent>>,
    pub(crate) on_recover_instance: Option<HandlerPtr<RecoverInstanceEvent>>,
    pub(crate) on_propose: Option<HandlerPtr<ProposeEvent>>,
    pub(crate) on_accept: Option<HandlerPtr<AcceptEvent>>,
    pub(crate) on_decide: Option<HandlerPtr<DecideEvent>>,
    pub(crate) on_execute: Option<HandlerPtr<ExecuteEvent>>,
    pub(crate) on_checkpoint: Option<HandlerPtr<CheckpointEvent>>,
    pub(crate) on_garbage_collect: Option<HandlerPtr<GarbageCollectEvent>>,
    pub(crate) on_run_for_coordinator: Option<HandlerPtr<RunForCoordinatorEvent>>,
    pub(crate) on_become_active: Option<HandlerPtr<BecomeActiveEvent>>,
    pub(crate) on_preempted: Option<HandlerPtr<PreemptedEvent>>,
    pub(crate) on_start_sync: Option<HandlerPtr<StartSyncEvent>>,
    pub(crate) on_receive_sync_request: Option<HandlerPtr<ReceiveSyncRequestEvent>>,
    pub(crate) on_restore_checkpoint: Option<HandlerPtr<RestoreCheckpointEvent>>,
    pub(crate) on_find_replica_group: Option<HandlerPtr<FindReplicaGroupEvent>>,
    pub(crate) on_request_failed: Option<HandlerPtr<RequestFailedEvent>>,
}

/// Collect the default logging handler of an event type (if `log_events`) and the user's handler.
fn handlers<T: Logger>(log_events: bool, user_handler: Option<HandlerPtr<T>>) -> Vec<HandlerPtr<T>> {
    let mut handlers = Vec::new();
    if log_events {
        handlers.push(T::get_logger());
    }
    if let Some(user_handler) = user_handler {
        handlers.push(user_handler);
    }
    handlers
}

impl EventHandlers {
    pub(crate) fn new(log_events: bool, user_handlers: UserHandlers) -> EventHandlers {
        EventHandlers {
            create_instance_handlers: handlers(log_events, user_handlers.on_create_instance),
            stop_instance_handlers: handlers(log_events, user_handlers.on_stop_instance),
            recover_instance_handlers: handlers(log_events, user_handlers.on_recover_instance),
            propose_handlers: handlers(log_events, user_handlers.on_propose),
            accept_handlers: handlers(log_events, user_handlers.on_accept),
            decide_handlers: handlers(log_events, user_handlers.on_decide),
            execute_handlers: handlers(log_events, user_handlers.on_execute),
            checkpoint_handlers: handlers(log_events, user_handlers.on_checkpoint),
            garbage_collect_handlers: handlers(log_events, user_handlers.on_garbage_collect),
            run_for_coordinator_handlers: handlers(log_events, user_handlers.on_run_for_coordinator),
            become_active_handlers: handlers(log_events, user_handlers.on_become_active),
            preempted_handlers: handlers(log_events, user_handlers.on_preempted),
            start_sync_handlers: handlers(log_events, user_handlers.on_start_sync),
            receive_sync_request_handlers: handlers(log_events, user_handlers.on_receive_sync_request),
            restore_checkpoint_handlers: handlers(log_events, user_handlers.on_restore_checkpoint),
            find_replica_group_handlers: handlers(log_events, user_handlers.on_find_replica_group),
            request_failed_handlers: handlers(log_events, user_handlers.on_request_failed),
        }
    }

    /// Whether there is no handler at all, in which case no event bus is needed.
    pub(crate) fn is_empty(&self) -> bool {
        self.create_instance_handlers.is_empty()
            && self.stop_instance_handlers.is_empty()
            && self.recover_instance_handlers.is_empty()
            && self.propose_handlers.is_empty()
            && self.accept_handlers.is_empty()
            && self.decide_handlers.is_empty()
            && self.execute_handlers.is_empty()
            && self.checkpoint_handlers.is_empty()
            && self.garbage_collect_handlers.is_empty()
            && self.run_for_coordinator_handlers.is_empty()
            && self.become_active_handlers.is_empty()
            && self.preempted_handlers.is_empty()
            && self.start_sync_handlers.is_empty()
            && self.receive_sync_request_handlers.is_empty()
            && self.restore_checkpoint_handlers.is_empty()
            && self.find_replica_group_handlers.is_empty()
            && self.request_failed_handlers.is_empty()
    }

    pub(crate) fn fire_handlers(&self, event: Event) {
        match event {
            Event::CreateInstance(create_instance_event) =>
                self.create_instance_handlers.iter().for_each(|handler| handler(&create_instance_event)),

            Event::StopInstance(stop_instance_event) =>
                self.stop_instance_handlers.iter().for_each(|handler| handler(&stop_instance_event)),

            Event::RecoverInstance(recover_instance_event) =>
                self.recover_instance_handlers.iter().for_each(|handler| handler(&recover_instance_event)),

            Event::Propose(propose_event) =>
                self.propose_handlers.iter().for_each(|handler| handler(&propose_event)),

            Event::Accept(accept_event) =>
                self.accept_handlers.iter().for_each(|handler| handler(&accept_event)),

            Event::Decide(decide_event) =>
                self.decide_handlers.iter().for_each(|handler| handler(&decide_event)),

            Event::Execute(execute_event) =>
                self.execute_handlers.iter().for_each(|handler| handler(&execute_event)),

            Event::Checkpoint(checkpoint_event) =>
                self.checkpoint_handlers.iter().for_each(|handler| handler(&checkpoint_event)),

            Event::GarbageCollect(garbage_collect_event) =>
                self.garbage_collect_handlers.iter().for_each(|handler| handler(&garbage_collect_event)),

            Event::RunForCoordinator(run_for_coordinator_event) =>
                self.run_for_coordinator_handlers.iter().for_each(|handler| handler(&run_for_coordinator_event)),

            Event::BecomeActive(become_active_event) =>
                self.become_active_handlers.iter().for_each(|handler| handler(&become_active_event)),

            Event::Preempted(preempted_event) =>
                self.preempted_handlers.iter().for_each(|handler| handler(&preempted_event)),

            Event::StartSync(start_sync_event) =>
                self.start_sync_handlers.iter().for_each(|handler| handler(&start_sync_event)),

            Event::ReceiveSyncRequest(receive_sync_request_event) =>
                self.receive_sync_request_handlers.iter().for_each(|handler| handler(&receive_sync_request_event)),

            Event::RestoreCheckpoint(restore_checkpoint_event) =>
                self.restore_checkpoint_handlers.iter().for_each(|handler| handler(&restore_checkpoint_event)),

            Event::FindReplicaGroup(find_replica_group_event) =>
                self.find_replica_group_handlers.iter().for_each(|handler| handler(&find_replica_group_event)),

            Event::RequestFailed(request_failed_event) =>
                self.request_failed_handlers.iter().for_each(|handler| handler(&request_failed_event)),
        }
    }
}

pub(crate) fn start_event_bus(
    event_handlers: EventHandlers,
    event_subscriber: Receiver<Event>,
    shutdown_signal: Receiver<()>,
) -> JoinHandle<()> {
    thread::spawn(move || loop {
        match shutdown_signal.try_recv() {
            Ok(()) | Err(TryRecvError::Disconnected) => return,
            Err(TryRecvError::Empty) => (),
        }

        match event_subscriber.try_recv() {
            Ok(event) => event_handlers.fire_handlers(event),
            Err(TryRecvError::Empty) => thread::yield_now(),
            // Every publisher has shut down.
            Err(TryRecvError::Disconnected) => return,
        }
    })
}

#[cfg(test)]
mod tests {
    use std::sync::{mpsc, Arc, Mutex};
    use std::time::SystemTime;

    use super::*;
    use crate::types::data_types::{PaxosID, Slot};

    #[test]
    fn user_handlers_fire_alongside_loggers() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_by_handler = seen.clone();
        let user_handlers = UserHandlers {
            on_checkpoint: Some(Box::new(move |event: &CheckpointEvent| {
                seen_by_handler.lock().unwrap().push(event.slot)
            })),
            ..UserHandlers::default()
        };

        let event_handlers = EventHandlers::new(true, user_handlers);
        assert_eq!(event_handlers.checkpoint_handlers.len(), 2);
        assert_eq!(event_handlers.execute_handlers.len(), 1);

        event_handlers.fire_handlers(Event::Checkpoint(CheckpointEvent {
            timestamp: SystemTime::now(),
            paxos_id: PaxosID::new("alice"),
            slot: Slot::new(400),
        }));
        assert_eq!(*seen.lock().unwrap(), vec![Slot::new(400)]);
    }

    #[test]
    fn no_handlers_means_no_bus() {
        assert!(EventHandlers::new(false, UserHandlers::default()).is_empty());
        assert!(!EventHandlers::new(true, UserHandlers::default()).is_empty());
    }

    #[test]
    fn bus_exits_once_publishers_are_gone() {
        let (publisher, subscriber) = mpsc::channel();
        let (_shutdown, shutdown_receiver) = mpsc::channel();
        let bus = start_event_bus(EventHandlers::new(false, UserHandlers::default()), subscriber, shutdown_receiver);
        drop(publisher);
        bus.join().unwrap();
    }
}
