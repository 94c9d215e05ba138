use std::time::Duration;

use log::LevelFilter;
use multipaxos_rs::{replica::ProposeError, types::data_types::NodeID};

mod common;

use crate::common::{
    logging::setup_logger,
    network::mock_network,
    node::{group, wait_until, Node, TestParameters},
};

#[test]
fn stop_instance_test() {
    setup_logger(LevelFilter::Trace);

    // 1. Start 3 replicas and create version 0 of the instance "grace" on all of them.
    let mut nodes: Vec<Node> = mock_network((1..=3).map(NodeID::new))
        .into_iter()
        .map(|network| Node::new(network, TestParameters::default()))
        .collect();
    let grace = group(&[1, 2, 3]);
    for node in &nodes {
        node.create_instance("grace", 0, &grace).unwrap();
    }

    // 2. Execute a request, then a stop.
    nodes[0].propose("grace", 0).unwrap();
    wait_until("every replica executed the first request", Duration::from_secs(30), || {
        nodes.iter().all(|node| node.executed("grace") == vec![0])
    });
    nodes[1].propose_stop("grace", 1).unwrap();

    // 3. Every replica executes the stop and keeps a tombstone of the instance.
    wait_until("every replica stopped grace", Duration::from_secs(30), || {
        nodes.iter().all(|node| node.tombstone("grace").is_some())
    });
    for node in &nodes {
        assert_eq!(node.executed("grace"), vec![0, 1]);
        let tombstone = node.tombstone("grace").unwrap();
        assert_eq!(tombstone.version.int(), 0);
        assert_eq!(tombstone.group, grace);
        assert_eq!(tombstone.stop.unwrap().slot.int(), 1);
    }

    // 4. A stopped instance takes no more requests, and an older version cannot be recreated.
    assert_eq!(nodes[2].propose("grace", 2), Err(ProposeError::InstanceStopped));
    assert!(nodes[0].create_instance("grace", 0, &grace).unwrap() == false);

    // 5. The stop survives a restart.
    nodes[0].crash();
    nodes[0].restart();
    assert!(nodes[0].tombstone("grace").is_some());
    assert_eq!(nodes[0].propose("grace", 3), Err(ProposeError::InstanceStopped));

    // 6. The next version of the instance replaces the stopped one, starting from a fresh app state.
    for node in &nodes {
        assert_eq!(node.create_instance("grace", 1, &grace).unwrap(), true);
    }
    nodes[0].propose("grace", 4).unwrap();
    wait_until("every replica executed a request of version 1", Duration::from_secs(30), || {
        nodes.iter().all(|node| node.executed("grace") == vec![4])
    });
}
