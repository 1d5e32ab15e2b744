//! Host configuration loading and parsing

use anyhow::{bail, Context, Result};
use canas_node::params::{find_by_name, standard_catalogue};
use canas_node::{NodeConfig, ParameterDefinition, PublishConfig, RegistryOptions};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Main application configuration (loaded from a TOML file)
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct AppConfig {
    #[serde(default)]
    pub node: NodeConfig,
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub bus: BusConfig,
    /// Parameter definitions beyond the built-in catalogue
    #[serde(default, rename = "parameter")]
    pub parameters: Vec<ParameterDefinition>,
    /// Values this node publishes
    #[serde(default)]
    pub publish: Vec<PublishValueConfig>,
    /// Parameters printed while running
    #[serde(default)]
    pub watch: Vec<WatchConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RegistryConfig {
    /// Registry file; an in-memory registry is used when absent
    pub path: Option<PathBuf>,
    #[serde(default = "default_capacity")]
    pub capacity: u16,
    #[serde(default = "default_row_size")]
    pub row_size: u16,
    /// Flush around every row write so rows survive power loss intact
    #[serde(default = "default_sync_on_write")]
    pub sync_on_write: bool,
}

fn default_capacity() -> u16 {
    RegistryOptions::default().capacity
}

fn default_row_size() -> u16 {
    RegistryOptions::default().row_size
}

fn default_sync_on_write() -> bool {
    true
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            path: None,
            capacity: default_capacity(),
            row_size: default_row_size(),
            sync_on_write: default_sync_on_write(),
        }
    }
}

impl RegistryConfig {
    pub fn options(&self, factory_reset: bool) -> RegistryOptions {
        RegistryOptions {
            factory_reset,
            capacity: self.capacity,
            row_size: self.row_size,
            sync_on_write: self.sync_on_write,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DriverKind {
    #[default]
    Virtual,
    Slcan,
}

impl DriverKind {
    /// Parse the driver name stored under the `can-driver` setting
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "virtual" => Some(Self::Virtual),
            "slcan" => Some(Self::Slcan),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct BusConfig {
    #[serde(default)]
    pub driver: DriverKind,
    /// Serial device for the slcan driver
    pub device: Option<PathBuf>,
}

/// A parameter referenced by id or by catalogue name
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum ParameterRef {
    Id(u16),
    Name(String),
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PublishValueConfig {
    pub parameter: ParameterRef,
    /// Value published at startup
    pub value: f64,
    /// Periodic interval; on-change only when absent
    pub interval_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WatchConfig {
    pub parameter: ParameterRef,
}

impl AppConfig {
    /// Catalogue plus the configured definitions (configured ones win)
    pub fn definitions(&self) -> Vec<ParameterDefinition> {
        let mut definitions = standard_catalogue();
        definitions.retain(|d| self.parameters.iter().all(|p| p.id != d.id));
        definitions.extend(self.parameters.iter().cloned());
        definitions
    }

    /// Resolve a reference to a definition
    pub fn resolve(&self, parameter: &ParameterRef) -> Result<ParameterDefinition> {
        let definitions = self.definitions();
        let found = match parameter {
            ParameterRef::Id(id) => definitions.iter().find(|d| d.id == *id),
            ParameterRef::Name(name) => find_by_name(&definitions, name),
        };
        match found {
            Some(definition) => Ok(definition.clone()),
            None => bail!("Unknown parameter {:?}", parameter),
        }
    }

    /// Node configuration with the configured definitions and publications
    pub fn node_config(&self) -> Result<NodeConfig> {
        let mut node = self.node.clone();
        node.parameters.extend(self.parameters.iter().cloned());
        for publish in &self.publish {
            let definition = self.resolve(&publish.parameter)?;
            node.publish.push(PublishConfig {
                id: definition.id,
                interval_ms: publish.interval_ms,
                on_change: publish.interval_ms.is_none(),
            });
        }
        Ok(node)
    }
}

/// Load configuration from a TOML file
pub fn load_config(path: &Path) -> Result<AppConfig> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {:?}", path))?;

    let config: AppConfig = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {:?}", path))?;

    for publish in &config.publish {
        config
            .resolve(&publish.parameter)
            .with_context(|| format!("Invalid [[publish]] entry in {:?}", path))?;
    }
    for watch in &config.watch {
        config
            .resolve(&watch.parameter)
            .with_context(|| format!("Invalid [[watch]] entry in {:?}", path))?;
    }

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use canas_node::DataType;
    use std::io::Write;

    const SAMPLE: &str = r#"
        [node]
        node_id = 10
        node_name = "adc"

        [registry]
        path = "adc.reg"
        capacity = 64

        [bus]
        driver = "slcan"
        device = "/dev/ttyACM0"

        [[parameter]]
        id = 1200
        name = "fuel_flow"
        datatype = "float"
        stale_after_ms = 2000

        [[publish]]
        parameter = "qnh"
        value = 1013
        interval_ms = 1000

        [[publish]]
        parameter = 1200
        value = 12.5

        [[watch]]
        parameter = "indicated_airspeed"
    "#;

    #[test]
    fn test_config_deserialization() {
        let config: AppConfig = toml::from_str(SAMPLE).unwrap();
        assert_eq!(config.node.node_id, 10);
        assert_eq!(config.node.node_name, "adc");
        assert_eq!(config.node.tx_length, canas_node::config::DEFAULT_QUEUE_LENGTH);
        assert_eq!(config.registry.capacity, 64);
        assert_eq!(config.registry.row_size, 32);
        assert!(config.registry.options(false).sync_on_write);
        assert_eq!(config.bus.driver, DriverKind::Slcan);
        assert_eq!(config.parameters[0].datatype, DataType::Float);
        assert_eq!(config.publish[0].parameter, ParameterRef::Name("qnh".into()));
        assert_eq!(config.publish[1].parameter, ParameterRef::Id(1200));
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config: AppConfig = toml::from_str("").unwrap();
        assert_eq!(config.node, NodeConfig::default());
        assert!(config.registry.path.is_none());
        assert_eq!(config.bus.driver, DriverKind::Virtual);
    }

    #[test]
    fn test_node_config_collects_publications() {
        let config: AppConfig = toml::from_str(SAMPLE).unwrap();
        let node = config.node_config().unwrap();
        assert_eq!(node.publish.len(), 2);
        assert_eq!(node.publish[0].id, 1034);
        assert_eq!(node.publish[0].interval_ms, Some(1000));
        assert!(!node.publish[0].on_change);
        assert_eq!(node.publish[1].id, 1200);
        assert!(node.publish[1].on_change);
        assert!(node.parameters.iter().any(|p| p.id == 1200));
        assert!(node.validate().is_ok());
    }

    #[test]
    fn test_unknown_parameter_is_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[[watch]]\nparameter = \"no_such_thing\"").unwrap();
        let err = load_config(file.path()).unwrap_err();
        assert!(format!("{:#}", err).contains("no_such_thing"));
    }

    #[test]
    fn test_driver_names() {
        assert_eq!(DriverKind::from_name("SLCAN"), Some(DriverKind::Slcan));
        assert_eq!(DriverKind::from_name("virtual"), Some(DriverKind::Virtual));
        assert_eq!(DriverKind::from_name("socketcan"), None);
    }
}
