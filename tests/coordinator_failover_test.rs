use std::time::Duration;

use log::LevelFilter;
use multipaxos_rs::types::data_types::NodeID;

mod common;

use crate::common::{
    logging::setup_logger,
    network::mock_network,
    node::{group, wait_until, Node, TestParameters},
};

#[test]
fn coordinator_failover_test() {
    setup_logger(LevelFilter::Trace);

    // 1. Initialize test components.

    // 1.1. Create a mock network connecting 3 replicas.
    let network_stubs = mock_network((1..=3).map(NodeID::new));

    // 1.2. Start the 3 replicas and create the instance "bob" on all of them.
    let mut nodes: Vec<Node> = network_stubs
        .into_iter()
        .map(|network| Node::new(network, TestParameters::default()))
        .collect();
    let bob = group(&[1, 2, 3]);
    for node in &nodes {
        node.create_instance("bob", 0, &bob).unwrap();
    }

    // 2. Get a first request executed, so that a coordinator is active.
    nodes[0].propose("bob", 0).unwrap();
    wait_until("every replica executed the first request", Duration::from_secs(30), || {
        nodes.iter().all(|node| node.executed("bob") == vec![0])
    });
    let coordinator = nodes
        .iter()
        .position(|node| node.status("bob").unwrap().coordinator_active)
        .expect("no active coordinator");
    let old_ballot = nodes[coordinator].status("bob").unwrap().ballot;

    // 3. Crash the coordinator.
    log::debug!("Crashing the coordinator, node {}.", nodes[coordinator].me());
    nodes[coordinator].crash();
    let survivors: Vec<usize> = (0..3).filter(|index| *index != coordinator).collect();

    // 4. Propose at a surviving replica. The request waits for a new coordinator.
    nodes[survivors[0]].propose("bob", 1).unwrap();

    // 5. Poll until both survivors executed the request.
    log::debug!("Polling until the surviving replicas executed the second request.");
    wait_until("the survivors executed the second request", Duration::from_secs(60), || {
        survivors.iter().all(|index| nodes[*index].executed("bob") == vec![0, 1])
    });

    // 6. One of the survivors took over with a higher ballot.
    let new_coordinator = survivors
        .iter()
        .find(|index| nodes[**index].status("bob").unwrap().coordinator_active)
        .expect("no survivor became coordinator");
    assert!(nodes[*new_coordinator].status("bob").unwrap().ballot > old_ballot);
}
