//! CANaerospace Node Runtime
//!
//! A library for running a CANaerospace node: typed parameters published and
//! subscribed to over a CAN bus, node identification, and a persistent
//! registry for node configuration.
//!
//! # Architecture
//!
//! - A driver pushes received frames into a bounded RX queue without blocking
//! - One dispatch worker decodes frames and calls subscribers in registration order
//! - One publisher worker transmits locally owned parameters (periodic or on change)
//! - The registry stores fixed-size rows atomically; settings are a named tree on top
//!
//! Workers stop cooperatively: a stop request wakes them and they exit between
//! units of work.
//!
//! # Example Usage
//!
//! ```no_run
//! use canas_node::{
//!     HandlerResult, MemoryStore, Node, NodeConfig, ParameterUpdate, ParameterValue,
//!     Registry, RegistryOptions, VirtualBus,
//! };
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! let registry = Arc::new(
//!     Registry::open_memory(MemoryStore::new(), RegistryOptions::default()).unwrap(),
//! );
//! let bus = VirtualBus::new();
//!
//! let config = NodeConfig::new()
//!     .with_node_id(10)
//!     .with_periodic(1034, Duration::from_millis(1000));
//! let node = Node::start(config, registry, bus.attach()).unwrap();
//!
//! node.register(1034, "altimeter", Arc::new(|update: &ParameterUpdate| -> HandlerResult {
//!     println!("qnh = {}", update.value);
//!     Ok(())
//! }));
//! node.publish_local(1034, ParameterValue::UShort(1013)).unwrap();
//!
//! node.shutdown().unwrap();
//! ```

// Public modules
pub mod codec;
pub mod config;
pub mod identity;
pub mod params;
pub mod queue;
pub mod registry;
pub mod settings;
pub mod stats;
pub mod sync;
pub mod transport;
pub mod types;

// Re-export main types for convenience
pub use codec::{CanasMessage, DataType, DecodeError, ParameterValue};
pub use config::{NodeConfig, PublishConfig};
pub use identity::{NodeIdentity, PeerInfo};
pub use node::Node;
pub use params::{
    Handler, HandlerResult, ParameterDefinition, ParameterSnapshot, ParameterUpdate,
    PublishPolicy, SubscriptionHandle,
};
pub use registry::{MemoryStore, Registry, RegistryError, RegistryOptions};
pub use settings::{SettingValue, Settings, SettingsError};
pub use stats::StatsSnapshot;
pub use transport::{BusStatus, CanDriver, SlcanDriver, VirtualBus};
pub use types::{BusError, CanFrame, NodeError, Result, Timestamp};

// Internal modules
mod dispatcher;
mod node;
mod publisher;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
