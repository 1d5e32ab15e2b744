// Publisher tests across two nodes sharing a virtual bus.

use canas_node::{
    HandlerResult, MemoryStore, Node, NodeConfig, ParameterUpdate, ParameterValue, Registry,
    RegistryOptions, VirtualBus,
};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};

const QNH: u16 = 1034;

fn registry() -> Arc<Registry> {
    Arc::new(
        Registry::open_memory(
            MemoryStore::new(),
            RegistryOptions {
                capacity: 32,
                row_size: 32,
                ..Default::default()
            },
        )
        .unwrap(),
    )
}

fn start(bus: &VirtualBus, config: NodeConfig) -> Node {
    Node::start(config, registry(), bus.attach()).unwrap()
}

#[test]
fn test_periodic_qnh_is_seen_every_second() {
    let _ = env_logger::builder().is_test(true).try_init();
    let bus = VirtualBus::new();

    let display = start(&bus, NodeConfig::new().with_node_id(2));
    let seen: Arc<Mutex<Vec<(Duration, ParameterValue)>>> = Arc::new(Mutex::new(Vec::new()));

    let t0 = Instant::now();
    let sink = seen.clone();
    display.register(
        QNH,
        "altimeter",
        Arc::new(move |update: &ParameterUpdate| -> HandlerResult {
            sink.lock().push((t0.elapsed(), update.value));
            Ok(())
        }),
    );

    let adc = start(
        &bus,
        NodeConfig::new()
            .with_node_id(1)
            .with_periodic(QNH, Duration::from_millis(1000)),
    );
    adc.publish_local(QNH, ParameterValue::UShort(1013)).unwrap();

    std::thread::sleep(Duration::from_millis(3400));
    adc.shutdown().unwrap();
    display.shutdown().unwrap();

    let seen = seen.lock();
    assert_eq!(seen.len(), 3, "observations: {:?}", *seen);
    let tolerance = Duration::from_millis(150);
    for (i, (at, value)) in seen.iter().enumerate() {
        let expected = Duration::from_millis(1000 * (i as u64 + 1));
        let diff = if *at > expected { *at - expected } else { expected - *at };
        assert!(diff <= tolerance, "update {} at {:?}", i, at);
        assert_eq!(*value, ParameterValue::UShort(1013));
    }
}

#[test]
fn test_on_change_reaches_other_node_quickly() {
    let bus = VirtualBus::new();
    let display = start(&bus, NodeConfig::new().with_node_id(2));
    let adc = start(&bus, NodeConfig::new().with_node_id(1));

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    display.register(
        QNH,
        "altimeter",
        Arc::new(move |update: &ParameterUpdate| -> HandlerResult {
            sink.lock().push((update.node_id, update.message_code, update.value));
            Ok(())
        }),
    );

    adc.publish_local(QNH, ParameterValue::UShort(1013)).unwrap();
    std::thread::sleep(Duration::from_millis(50));
    adc.publish_local(QNH, ParameterValue::UShort(1014)).unwrap();

    let deadline = Instant::now() + Duration::from_secs(1);
    while seen.lock().len() < 2 && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(5));
    }

    let seen = seen.lock();
    assert_eq!(
        *seen,
        vec![
            (1, 0, ParameterValue::UShort(1013)),
            (1, 1, ParameterValue::UShort(1014)),
        ]
    );
    let latest = display.get_latest(QNH).unwrap();
    assert_eq!(latest.node_id, 1);
    assert!(!latest.stale);
}

#[test]
fn test_shutdown_is_prompt() {
    let bus = VirtualBus::new();
    let node = start(
        &bus,
        NodeConfig::new()
            .with_node_id(3)
            .with_periodic(QNH, Duration::from_secs(60)),
    );

    let started = Instant::now();
    node.shutdown().unwrap();
    assert!(started.elapsed() < Duration::from_millis(500));
}
