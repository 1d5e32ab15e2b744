//! The node runtime context
//!
//! [`Node::start`] wires a driver, the registry and the configuration into a
//! running node with one dispatch worker and one publisher worker. All
//! caller-facing operations go through the returned [`Node`].

use crate::codec::{self, ParameterValue};
use crate::config::NodeConfig;
use crate::dispatcher::Dispatcher;
use crate::identity::{IdentityService, NodeIdentity, PeerInfo};
use crate::params::{
    standard_catalogue, Handler, ParameterSnapshot, ParameterTable, PublishPolicy,
    SubscriptionHandle,
};
use crate::publisher::Publisher;
use crate::registry::Registry;
use crate::settings::Settings;
use crate::stats::{NodeStats, StatsSnapshot};
use crate::sync::{Event, Worker};
use crate::transport::{BusStatus, CanDriver, Transport};
use crate::types::{CanFrame, NodeError, Result};
use std::sync::Arc;

/// A running CANaerospace node
pub struct Node {
    config: NodeConfig,
    settings: Arc<Settings>,
    transport: Arc<Transport>,
    params: Arc<ParameterTable>,
    identity: Arc<IdentityService>,
    stats: Arc<NodeStats>,
    tx_wake: Arc<Event>,
    workers: Vec<Worker>,
}

impl Node {
    /// Start a node
    ///
    /// The registry must already be open: registry settings override
    /// `config` and no frame is sent or received before they are applied.
    pub fn start(
        config: NodeConfig,
        registry: Arc<Registry>,
        driver: Arc<dyn CanDriver>,
    ) -> Result<Self> {
        let settings = Arc::new(Settings::new(registry)?);
        let config = config.apply_settings(&settings)?;
        config.validate()?;

        log::info!(
            "Starting node {} '{}' (type {}, hw {:#04x}, sw {:#04x})",
            config.node_id,
            config.node_name,
            config.node_type,
            config.hardware_revision,
            config.software_revision
        );

        let stats = Arc::new(NodeStats::new());
        let rx_wake = Arc::new(Event::auto());
        let tx_wake = Arc::new(Event::auto());

        let transport = Arc::new(Transport::new(
            driver,
            config.rx_queue_length(),
            config.tx_queue_length(),
            rx_wake.clone(),
            tx_wake.clone(),
            stats.clone(),
        ));

        let params = Arc::new(ParameterTable::new(
            config.node_id,
            config.local_length,
            rx_wake.clone(),
            tx_wake.clone(),
            stats.clone(),
        ));
        // Configured definitions replace catalogue entries with the same id
        let mut definitions = standard_catalogue();
        definitions.retain(|d| config.parameters.iter().all(|p| p.id != d.id));
        definitions.extend(config.parameters.iter().cloned());
        for definition in &definitions {
            params.define(definition)?;
        }
        for publish in &config.publish {
            params.own(publish.id, publish.policy())?;
        }

        let identity = Arc::new(IdentityService::new(config.identity(), stats.clone()));

        transport.start()?;

        let mut node = Self {
            config,
            settings,
            transport,
            params,
            identity,
            stats,
            tx_wake,
            workers: Vec::with_capacity(2),
        };

        if let Err(e) = node.spawn_workers(rx_wake) {
            node.transport.stop();
            return Err(e);
        }
        Ok(node)
    }

    fn spawn_workers(&mut self, rx_wake: Arc<Event>) -> Result<()> {
        let dispatcher = Dispatcher::new(
            self.transport.clone(),
            self.params.clone(),
            self.identity.clone(),
            self.stats.clone(),
        );
        let idle = self.config.idle_wait();
        let wake = rx_wake.clone();
        self.workers.push(Worker::spawn("canas-rx", rx_wake, move |stop| {
            dispatcher.run(wake, stop, idle)
        })?);

        let publisher = Publisher::new(
            self.transport.clone(),
            self.params.clone(),
            self.identity.clone(),
            self.stats.clone(),
            self.config.identity_interval(),
            idle,
        );
        publisher.announce();
        let wake = self.tx_wake.clone();
        self.workers.push(Worker::spawn("canas-tx", self.tx_wake.clone(), move |stop| {
            publisher.run(wake, stop)
        })?);
        Ok(())
    }

    /// Effective configuration (after registry overlay)
    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    /// Our node id
    pub fn node_id(&self) -> u8 {
        self.config.node_id
    }

    /// Our identity
    pub fn identity(&self) -> &NodeIdentity {
        self.identity.identity()
    }

    /// The parameter table
    pub fn params(&self) -> &Arc<ParameterTable> {
        &self.params
    }

    /// Settings stored in the registry
    pub fn settings(&self) -> &Arc<Settings> {
        &self.settings
    }

    /// The registry
    pub fn registry(&self) -> &Arc<Registry> {
        self.settings.registry()
    }

    /// Subscribe to a parameter
    pub fn register(&self, parameter_id: u16, owner: &str, handler: Handler) -> SubscriptionHandle {
        self.params.register(parameter_id, owner, handler)
    }

    /// Cancel a subscription
    pub fn unregister(&self, handle: SubscriptionHandle) -> bool {
        self.params.unregister(handle)
    }

    /// Publish a value from this node
    pub fn publish_local(&self, parameter_id: u16, value: ParameterValue) -> Result<()> {
        self.params.publish_local(parameter_id, value)
    }

    /// Take ownership of a parameter for transmission
    pub fn own(&self, parameter_id: u16, policy: PublishPolicy) -> Result<()> {
        self.params.own(parameter_id, policy)?;
        self.tx_wake.set();
        Ok(())
    }

    /// Latest value of a parameter
    pub fn get_latest(&self, parameter_id: u16) -> Option<ParameterSnapshot> {
        self.params.get_latest(parameter_id)
    }

    /// Queue a raw frame for transmission
    pub fn send(&self, frame: CanFrame) -> Result<()> {
        self.transport.send(frame, self.config.send_timeout())
    }

    /// Ask `target` (0 for every node) to identify itself
    pub fn query_identity(&self, target: u8) -> Result<()> {
        let frame = codec::encode(&IdentityService::query(target))?;
        self.send(frame)
    }

    /// Nodes seen on the bus
    pub fn peers(&self) -> Vec<PeerInfo> {
        self.identity.peers()
    }

    /// `Err(DuplicateNode)` once another node has claimed our node id
    pub fn check_identity(&self) -> Result<()> {
        self.identity.check()
    }

    /// Controller state
    pub fn bus_status(&self) -> BusStatus {
        self.transport.status()
    }

    /// Current counters
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Stop both workers and the driver, then sync the registry
    ///
    /// Every worker is given the configured shutdown timeout. A worker that
    /// misses it is detached and reported through `ShutdownTimeout`; the
    /// rest of the shutdown still runs.
    pub fn shutdown(mut self) -> Result<()> {
        self.stop_all()
    }

    fn stop_all(&mut self) -> Result<()> {
        if self.workers.is_empty() {
            return Ok(());
        }
        log::info!("Stopping node {}", self.config.node_id);

        let timeout = self.config.shutdown_timeout();
        let mut first_error: Option<NodeError> = None;
        for mut worker in self.workers.drain(..) {
            if let Err(e) = worker.stop(timeout) {
                first_error = first_error.or(Some(e));
            }
        }

        self.transport.stop();
        if let Err(e) = self.settings.registry().sync() {
            log::error!("Registry sync on shutdown failed: {}", e);
            first_error = first_error.or(Some(e.into()));
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        if let Err(e) = self.stop_all() {
            log::error!("Node shutdown failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{MemoryStore, RegistryOptions};
    use crate::settings::SettingValue;
    use crate::transport::VirtualBus;

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

    #[test]
    fn test_start_announces_identity() {
        let bus = VirtualBus::new();
        let tap = bus.tap();
        let node = Node::start(
            NodeConfig::new().with_node_id(12).with_node_name("ahrs"),
            registry(),
            bus.attach(),
        )
        .unwrap();

        let frame = tap.recv_timeout(std::time::Duration::from_secs(2)).unwrap();
        let message = codec::decode(&frame).unwrap();
        assert_eq!(message.id, 129);
        assert_eq!(message.node_id, 12);
        node.shutdown().unwrap();
    }

    #[test]
    fn test_registry_settings_override_config() {
        let registry = registry();
        let settings = Settings::new(registry.clone()).unwrap();
        settings.set("node-id", SettingValue::U8(77)).unwrap();

        let bus = VirtualBus::new();
        let node = Node::start(NodeConfig::new().with_node_id(5), registry, bus.attach()).unwrap();
        assert_eq!(node.node_id(), 77);
        assert_eq!(node.params().node_id(), 77);
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let bus = VirtualBus::new();
        let result = Node::start(NodeConfig::new().with_node_id(0), registry(), bus.attach());
        assert!(matches!(result, Err(NodeError::Config(_))));
    }

    #[test]
    fn test_own_rejects_zero_interval() {
        let bus = VirtualBus::new();
        let node = Node::start(NodeConfig::new(), registry(), bus.attach()).unwrap();
        assert!(matches!(
            node.own(1034, PublishPolicy::periodic(std::time::Duration::ZERO)),
            Err(NodeError::Config(_))
        ));
        assert!(node
            .own(1034, PublishPolicy::periodic(std::time::Duration::from_millis(250)))
            .is_ok());
        node.shutdown().unwrap();
    }

    #[test]
    fn test_catalogue_is_defined() {
        let bus = VirtualBus::new();
        let node = Node::start(NodeConfig::new(), registry(), bus.attach()).unwrap();
        assert_eq!(
            node.params().datatype(1034),
            Some(crate::codec::DataType::UShort)
        );
    }
}
