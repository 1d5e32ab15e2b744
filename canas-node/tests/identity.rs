// Node identification between nodes on one virtual bus.

use canas_node::{codec, MemoryStore, Node, NodeConfig, NodeError, Registry, RegistryOptions, VirtualBus};
use std::sync::Arc;
use std::time::{Duration, Instant};

fn start(bus: &VirtualBus, config: NodeConfig) -> Node {
    let registry = Registry::open_memory(
        MemoryStore::new(),
        RegistryOptions {
            capacity: 32,
            row_size: 32,
            ..Default::default()
        },
    )
    .unwrap();
    Node::start(config, Arc::new(registry), bus.attach()).unwrap()
}

fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    condition()
}

#[test]
fn test_peer_discovered_with_name() {
    let bus = VirtualBus::new();
    let display = start(&bus, NodeConfig::new().with_node_id(2).with_node_name("efis"));
    let _adc = start(
        &bus,
        NodeConfig::new()
            .with_node_id(7)
            .with_node_type(3)
            .with_node_name("air data computer"),
    );

    assert!(wait_until(Duration::from_secs(2), || display
        .peers()
        .iter()
        .any(|p| p.node_id == 7 && p.name == "air data computer")));
    let peer = display.peers().into_iter().find(|p| p.node_id == 7).unwrap();
    assert_eq!(peer.node_type, 3);
    assert!(display.check_identity().is_ok());
}

#[test]
fn test_broadcast_query_is_answered() {
    let bus = VirtualBus::new();
    let ahrs = start(&bus, NodeConfig::new().with_node_id(4).with_node_type(9));
    let querier = start(&bus, NodeConfig::new().with_node_id(30));

    let tap = bus.tap();
    querier.query_identity(0).unwrap();

    let deadline = Instant::now() + Duration::from_secs(2);
    let mut answered = false;
    while Instant::now() < deadline && !answered {
        if let Ok(frame) = tap.recv_timeout(Duration::from_millis(100)) {
            let message = codec::decode(&frame).unwrap();
            answered = message.id == 129 && message.node_id == 4 && message.message_code == 9;
        }
    }
    assert!(answered);
    assert!(wait_until(Duration::from_secs(2), || querier
        .peers()
        .iter()
        .any(|p| p.node_id == 4 && p.node_type == 9)));
    assert!(ahrs.check_identity().is_ok());
}

#[test]
fn test_duplicate_node_id_is_reported() {
    let bus = VirtualBus::new();
    let first = start(&bus, NodeConfig::new().with_node_id(5).with_node_type(1));
    let second = start(&bus, NodeConfig::new().with_node_id(5).with_node_type(2));

    assert!(wait_until(Duration::from_secs(2), || first.check_identity().is_err()));
    assert!(matches!(
        first.check_identity(),
        Err(NodeError::DuplicateNode(5))
    ));
    assert!(first.stats().duplicate_nodes >= 1);

    // Detection only: both nodes keep running
    assert!(first.peers().iter().all(|p| p.node_id != 5));
    second.shutdown().unwrap();
    first.shutdown().unwrap();
}
