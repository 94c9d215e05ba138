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
fn restart_recovery_test() {
    setup_logger(LevelFilter::Trace);

    // 1. Initialize test components.

    // 1.1. Start 3 replicas with a checkpoint every 4 slots, so recovery starts from a checkpoint and
    // replays the decisions logged after it.
    let parameters = TestParameters {
        checkpoint_interval: 4,
        ..TestParameters::default()
    };
    let mut nodes: Vec<Node> = mock_network((1..=3).map(NodeID::new))
        .into_iter()
        .map(|network| Node::new(network, parameters))
        .collect();

    // 1.2. Create the instance "carol" on all of them.
    let carol = group(&[1, 2, 3]);
    for node in &nodes {
        node.create_instance("carol", 0, &carol).unwrap();
    }

    // 2. Get 10 requests executed.
    for request_id in 0..10 {
        nodes[0].propose("carol", request_id).unwrap();
    }
    wait_until("every replica executed 10 requests", Duration::from_secs(60), || {
        nodes.iter().all(|node| node.executed("carol").len() == 10)
    });
    let before = nodes[0].executed("carol");
    let next_slot = nodes[0].status("carol").unwrap().next_slot;

    // 3. Crash every replica, then restart them from their log directories.
    log::debug!("Crashing and restarting every replica.");
    for node in nodes.iter_mut() {
        node.crash();
    }
    for node in nodes.iter_mut() {
        node.restart();
    }

    // 4. The instance is recovered where it left off, and nothing is executed twice.
    for node in &nodes {
        let status = node.status("carol").expect("instance not recovered");
        assert_eq!(status.version.int(), 0);
        assert_eq!(status.next_slot, next_slot);
        assert_eq!(node.executed("carol"), before);
    }

    // 5. The recovered instance keeps deciding.
    nodes[1].propose("carol", 10).unwrap();
    wait_until("every replica executed the 11th request", Duration::from_secs(60), || {
        nodes.iter().all(|node| node.executed("carol").len() == 11)
    });
    let after = nodes[0].executed("carol");
    assert_eq!(&after[..10], &before[..]);
    for node in &nodes[1..] {
        assert_eq!(node.executed("carol"), after);
    }
}
