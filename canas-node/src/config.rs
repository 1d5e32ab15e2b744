//! Node configuration
//!
//! Values come from three places, later ones winning: built-in defaults, the
//! host's configuration file (this struct is `serde`-deserializable), and
//! settings persisted in the node's registry.

use crate::codec::DataType;
use crate::identity::NodeIdentity;
use crate::params::{ParameterDefinition, PublishPolicy};
use crate::settings::Settings;
use crate::types::{NodeError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Queue length used when a configured length is zero
pub const DEFAULT_QUEUE_LENGTH: usize = 1024;

/// Largest accepted queue length; queues are allocated up front
pub const MAX_QUEUE_LENGTH: usize = 65535;

fn default_node_id() -> u8 {
    1
}

fn default_hardware_revision() -> u8 {
    0x11
}

fn default_software_revision() -> u8 {
    0x10
}

fn default_node_name() -> String {
    "canas".to_string()
}

fn default_queue_length() -> usize {
    DEFAULT_QUEUE_LENGTH
}

fn default_local_length() -> usize {
    64
}

fn default_send_timeout_ms() -> u64 {
    100
}

fn default_idle_wait_ms() -> u64 {
    100
}

fn default_identity_interval_ms() -> u64 {
    10_000
}

fn default_shutdown_timeout_ms() -> u64 {
    1_000
}

/// How one parameter is published by this node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishConfig {
    /// Parameter identifier
    pub id: u16,
    /// Periodic retransmission interval
    #[serde(default)]
    pub interval_ms: Option<u64>,
    /// Transmit every published value immediately
    #[serde(default)]
    pub on_change: bool,
}

impl PublishConfig {
    /// Publish policy described by this entry
    pub fn policy(&self) -> PublishPolicy {
        PublishPolicy {
            interval: self.interval_ms.map(Duration::from_millis),
            on_change: self.on_change || self.interval_ms.is_none(),
        }
    }
}

/// Runtime configuration of a node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeConfig {
    /// CANaerospace node id (1..=255, 0 is the broadcast address)
    #[serde(default = "default_node_id")]
    pub node_id: u8,

    #[serde(default)]
    pub node_type: u8,

    #[serde(default = "default_hardware_revision")]
    pub hardware_revision: u8,

    #[serde(default = "default_software_revision")]
    pub software_revision: u8,

    #[serde(default = "default_node_name")]
    pub node_name: String,

    /// TX queue length in frames (0 selects the default)
    #[serde(default = "default_queue_length")]
    pub tx_length: usize,

    /// RX queue length in frames (0 selects the default)
    #[serde(default = "default_queue_length")]
    pub rx_length: usize,

    /// Queue length for local publications awaiting delivery
    #[serde(default = "default_local_length")]
    pub local_length: usize,

    /// Longest `send` waits for TX queue space
    #[serde(default = "default_send_timeout_ms")]
    pub send_timeout_ms: u64,

    /// Longest a worker sleeps before re-checking its stop flag
    #[serde(default = "default_idle_wait_ms")]
    pub idle_wait_ms: u64,

    /// Identity re-announcement period (0 announces at startup only)
    #[serde(default = "default_identity_interval_ms")]
    pub identity_interval_ms: u64,

    /// How long shutdown waits for each worker
    #[serde(default = "default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,

    /// Parameter definitions beyond the built-in catalogue
    #[serde(default)]
    pub parameters: Vec<ParameterDefinition>,

    /// Parameters this node transmits
    #[serde(default)]
    pub publish: Vec<PublishConfig>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: default_node_id(),
            node_type: 0,
            hardware_revision: default_hardware_revision(),
            software_revision: default_software_revision(),
            node_name: default_node_name(),
            tx_length: default_queue_length(),
            rx_length: default_queue_length(),
            local_length: default_local_length(),
            send_timeout_ms: default_send_timeout_ms(),
            idle_wait_ms: default_idle_wait_ms(),
            identity_interval_ms: default_identity_interval_ms(),
            shutdown_timeout_ms: default_shutdown_timeout_ms(),
            parameters: Vec::new(),
            publish: Vec::new(),
        }
    }
}

impl NodeConfig {
    /// Create a configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the node id
    pub fn with_node_id(mut self, node_id: u8) -> Self {
        self.node_id = node_id;
        self
    }

    /// Set the node name
    pub fn with_node_name(mut self, name: &str) -> Self {
        self.node_name = name.to_string();
        self
    }

    /// Set the node type
    pub fn with_node_type(mut self, node_type: u8) -> Self {
        self.node_type = node_type;
        self
    }

    /// Set the TX queue length
    pub fn with_tx_length(mut self, length: usize) -> Self {
        self.tx_length = length;
        self
    }

    /// Set the RX queue length
    pub fn with_rx_length(mut self, length: usize) -> Self {
        self.rx_length = length;
        self
    }

    /// Set the identity re-announcement period (zero disables it)
    pub fn with_identity_interval(mut self, interval: Duration) -> Self {
        self.identity_interval_ms = interval.as_millis() as u64;
        self
    }

    /// Add a parameter definition
    pub fn with_parameter(mut self, definition: ParameterDefinition) -> Self {
        self.parameters.push(definition);
        self
    }

    /// Publish `id` every `interval`
    pub fn with_periodic(mut self, id: u16, interval: Duration) -> Self {
        self.publish.push(PublishConfig {
            id,
            interval_ms: Some(interval.as_millis() as u64),
            on_change: false,
        });
        self
    }

    /// Overlay settings persisted in the registry
    ///
    /// Reads `node-id`, `node-type`, `node-name`, `tx-length` and
    /// `rx-length` from the root key. Missing settings leave the current
    /// value in place; out-of-range ones are configuration errors.
    pub fn apply_settings(mut self, settings: &Settings) -> Result<Self> {
        if let Some(id) = settings.get_uint("node-id")? {
            self.node_id = narrow("node-id", id)?;
            log::info!("Node id {} from registry", self.node_id);
        }
        if let Some(node_type) = settings.get_uint("node-type")? {
            self.node_type = narrow("node-type", node_type)?;
        }
        if let Some(name) = settings.get_str("node-name")? {
            self.node_name = name;
        }
        if let Some(length) = settings.get_uint("tx-length")? {
            self.tx_length = length as usize;
        }
        if let Some(length) = settings.get_uint("rx-length")? {
            self.rx_length = length as usize;
        }
        Ok(self)
    }

    /// Check the configuration for values the node cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.node_id == 0 {
            return Err(NodeError::Config(
                "node id 0 is the broadcast address".to_string(),
            ));
        }
        for (name, length) in [
            ("tx-length", self.tx_length),
            ("rx-length", self.rx_length),
            ("local-length", self.local_length),
        ] {
            if length > MAX_QUEUE_LENGTH {
                return Err(NodeError::Config(format!(
                    "{} {} exceeds the maximum of {}",
                    name, length, MAX_QUEUE_LENGTH
                )));
            }
        }
        for publish in &self.publish {
            if publish.interval_ms == Some(0) {
                return Err(NodeError::Config(format!(
                    "parameter {} has a zero publish interval",
                    publish.id
                )));
            }
        }
        for definition in &self.parameters {
            if definition.datatype == DataType::NoData {
                return Err(NodeError::Config(format!(
                    "parameter '{}' cannot be NODATA",
                    definition.name
                )));
            }
        }
        Ok(())
    }

    /// Effective TX queue length
    pub fn tx_queue_length(&self) -> usize {
        if self.tx_length == 0 {
            DEFAULT_QUEUE_LENGTH
        } else {
            self.tx_length
        }
    }

    /// Effective RX queue length
    pub fn rx_queue_length(&self) -> usize {
        if self.rx_length == 0 {
            DEFAULT_QUEUE_LENGTH
        } else {
            self.rx_length
        }
    }

    /// Identity of the node
    pub fn identity(&self) -> NodeIdentity {
        NodeIdentity {
            node_id: self.node_id,
            node_type: self.node_type,
            hardware_revision: self.hardware_revision,
            software_revision: self.software_revision,
            name: self.node_name.clone(),
        }
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    pub fn idle_wait(&self) -> Duration {
        Duration::from_millis(self.idle_wait_ms.max(1))
    }

    pub fn identity_interval(&self) -> Option<Duration> {
        (self.identity_interval_ms > 0).then(|| Duration::from_millis(self.identity_interval_ms))
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

fn narrow(key: &str, value: u32) -> Result<u8> {
    u8::try_from(value)
        .map_err(|_| NodeError::Config(format!("registry value {} = {} is out of range", key, value)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{MemoryStore, Registry, RegistryOptions};
    use crate::settings::SettingValue;
    use std::sync::Arc;

    fn settings() -> Settings {
        let registry = Registry::open_memory(
            MemoryStore::new(),
            RegistryOptions {
                capacity: 16,
                row_size: 32,
                ..Default::default()
            },
        )
        .unwrap();
        Settings::new(Arc::new(registry)).unwrap()
    }

    #[test]
    fn test_defaults() {
        let config = NodeConfig::default();
        assert_eq!(config.node_id, 1);
        assert_eq!(config.tx_queue_length(), DEFAULT_QUEUE_LENGTH);
        assert_eq!(config.identity_interval(), Some(Duration::from_secs(10)));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_length_selects_default() {
        let config = NodeConfig::new().with_rx_length(0).with_tx_length(16);
        assert_eq!(config.rx_queue_length(), DEFAULT_QUEUE_LENGTH);
        assert_eq!(config.tx_queue_length(), 16);
    }

    #[test]
    fn test_registry_overlay() {
        let s = settings();
        s.set("node-id", SettingValue::U16(42)).unwrap();
        s.set("node-name", SettingValue::Str("efis".into())).unwrap();
        s.set("rx-length", SettingValue::U16(256)).unwrap();

        let config = NodeConfig::new().with_node_id(3).apply_settings(&s).unwrap();
        assert_eq!(config.node_id, 42);
        assert_eq!(config.node_name, "efis");
        assert_eq!(config.rx_length, 256);
        assert_eq!(config.tx_length, DEFAULT_QUEUE_LENGTH);
    }

    #[test]
    fn test_registry_overlay_out_of_range() {
        let s = settings();
        s.set("node-id", SettingValue::U16(300)).unwrap();
        assert!(matches!(
            NodeConfig::new().apply_settings(&s),
            Err(NodeError::Config(_))
        ));
    }

    #[test]
    fn test_validate() {
        assert!(NodeConfig::new().with_node_id(0).validate().is_err());

        let mut config = NodeConfig::new();
        config.publish.push(PublishConfig {
            id: 1034,
            interval_ms: Some(0),
            on_change: false,
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_queue_length_limit() {
        let s = settings();
        s.set("tx-length", SettingValue::U32(4_000_000_000)).unwrap();
        let config = NodeConfig::new().apply_settings(&s).unwrap();
        assert!(matches!(config.validate(), Err(NodeError::Config(_))));

        assert!(NodeConfig::new()
            .with_rx_length(MAX_QUEUE_LENGTH)
            .validate()
            .is_ok());
        assert!(NodeConfig::new()
            .with_rx_length(MAX_QUEUE_LENGTH + 1)
            .validate()
            .is_err());

        let mut config = NodeConfig::new();
        config.local_length = MAX_QUEUE_LENGTH + 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_publish_policy() {
        let periodic = PublishConfig {
            id: 1034,
            interval_ms: Some(1000),
            on_change: false,
        };
        assert_eq!(periodic.policy(), PublishPolicy::periodic(Duration::from_secs(1)));

        let bare = PublishConfig {
            id: 1034,
            interval_ms: None,
            on_change: false,
        };
        assert_eq!(bare.policy(), PublishPolicy::on_change());
    }
}
