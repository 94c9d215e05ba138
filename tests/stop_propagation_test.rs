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
fn stop_propagation_test() {
    setup_logger(LevelFilter::Trace);

    // 1. Start 3 replicas, create the instance "ivan" on all of them, and get a first request executed.
    let mut nodes: Vec<Node> = mock_network((1..=3).map(NodeID::new))
        .into_iter()
        .map(|network| Node::new(network, TestParameters::default()))
        .collect();
    let ivan = group(&[1, 2, 3]);
    for node in &nodes {
        node.create_instance("ivan", 0, &ivan).unwrap();
    }
    nodes[0].propose("ivan", 0).unwrap();
    wait_until("every replica executed the first request", Duration::from_secs(30), || {
        nodes.iter().all(|node| node.executed("ivan") == vec![0])
    });

    // 2. Cut off a replica that is not the coordinator, and stop the instance without it.
    let lagging = nodes
        .iter()
        .position(|node| !node.status("ivan").unwrap().coordinator_active)
        .unwrap();
    let others: Vec<usize> = (0..3).filter(|index| *index != lagging).collect();
    let network = nodes[lagging].network();
    network.isolate(nodes[lagging].me());
    nodes[others[0]].propose_stop("ivan", 1).unwrap();
    wait_until("the connected replicas stopped ivan", Duration::from_secs(30), || {
        others.iter().all(|index| nodes[*index].tombstone("ivan").is_some())
    });

    // 3. Restart the connected replicas, so that all that is left of ivan there is a tombstone.
    for index in &others {
        nodes[*index].crash();
        nodes[*index].restart();
        assert!(nodes[*index].status("ivan").is_none());
        assert!(nodes[*index].tombstone("ivan").is_some());
    }

    // 4. The lagging replica still runs ivan. Once reconnected, whatever it sends for ivan is
    // answered with the stop.
    network.reconnect(nodes[lagging].me());
    assert!(!nodes[lagging].status("ivan").unwrap().stopped);
    nodes[lagging].propose("ivan", 2).unwrap();
    wait_until("the lagging replica stopped ivan", Duration::from_secs(60), || {
        nodes[lagging].tombstone("ivan").is_some()
    });
    assert_eq!(nodes[lagging].executed("ivan"), vec![0, 1]);
    assert_eq!(nodes[lagging].tombstone("ivan").unwrap().stop.unwrap().slot.int(), 1);
}
