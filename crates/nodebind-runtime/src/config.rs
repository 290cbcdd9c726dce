use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use nodebind_frame::FrameConfig;
use nodebind_transport::NodeAddress;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Default deadline for a two-way transaction.
pub const DEFAULT_TRANSACTION_TIMEOUT: Duration = Duration::from_secs(10);
/// Default bound on establishing an outbound connection.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// Default bound on joining connection threads at shutdown.
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// One node's network address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeConfig {
    pub id: u32,
    /// `tcp://host:port`
    pub uri: String,
}

/// A well-known service: which node exposes it, under which local id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub name: String,
    pub node: u32,
    pub id: u32,
    pub interface: String,
}

/// Static node and service table shared by every node of a deployment.
///
/// ```json
/// {
///   "nodes": [{"id": 1, "uri": "tcp://127.0.0.1:7001"}],
///   "services": [{"name": "greeter", "node": 1, "id": 1, "interface": "demo.Greeter"}]
/// }
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Configuration {
    #[serde(default)]
    pub nodes: Vec<NodeConfig>,
    #[serde(default)]
    pub services: Vec<ServiceConfig>,
}

impl Configuration {
    /// Read, parse and validate a JSON configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&text)
    }

    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json_pretty(&self) -> Result<String, ConfigError> {
        serde_json::to_string_pretty(self).map_err(ConfigError::from)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut node_ids = HashSet::new();
        for node in &self.nodes {
            if node.id == 0 {
                return Err(ConfigError::Invalid("node id 0 is reserved".to_string()));
            }
            if !node_ids.insert(node.id) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate node id {}",
                    node.id
                )));
            }
            NodeAddress::parse(&node.uri).map_err(|err| {
                ConfigError::Invalid(format!("node {}: {err}", node.id))
            })?;
        }

        let mut names = HashSet::new();
        let mut slots = HashSet::new();
        for service in &self.services {
            if !names.insert(service.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate service name {:?}",
                    service.name
                )));
            }
            if !node_ids.contains(&service.node) {
                return Err(ConfigError::Invalid(format!(
                    "service {:?} is on unknown node {}",
                    service.name, service.node
                )));
            }
            if service.id == 0 {
                return Err(ConfigError::Invalid(format!(
                    "service {:?} uses reserved local id 0",
                    service.name
                )));
            }
            if !slots.insert((service.node, service.id)) {
                return Err(ConfigError::Invalid(format!(
                    "service {:?} reuses id {} on node {}",
                    service.name, service.id, service.node
                )));
            }
            if service.interface.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "service {:?} has no interface",
                    service.name
                )));
            }
        }
        Ok(())
    }

    pub fn node(&self, id: u32) -> Option<&NodeConfig> {
        self.nodes.iter().find(|node| node.id == id)
    }

    pub fn service(&self, name: &str) -> Option<&ServiceConfig> {
        self.services.iter().find(|service| service.name == name)
    }

    /// Local ids claimed by configured services on `node`.
    pub fn reserved_ids(&self, node: u32) -> Vec<u32> {
        self.services
            .iter()
            .filter(|service| service.node == node)
            .map(|service| service.id)
            .collect()
    }
}

/// Runtime tunables.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Deadline for two-way calls without an explicit timeout. Default: 10s.
    pub transaction_timeout: Duration,
    /// Outbound connect bound. Default: 10s.
    pub connect_timeout: Duration,
    /// Bound on joining threads at shutdown. Default: 10s.
    pub shutdown_timeout: Duration,
    /// Threads serving inbound transactions. Default: 4.
    pub dispatch_workers: usize,
    /// Inbound transactions queued before readers block. Default: 1024.
    pub dispatch_queue: usize,
    /// Close a node's client when its last proxy goes away. Default: false.
    pub close_idle_connections: bool,
    /// Codec limits and socket timeouts for every connection.
    pub frame: FrameConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            transaction_timeout: DEFAULT_TRANSACTION_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            dispatch_workers: 4,
            dispatch_queue: 1024,
            close_idle_connections: false,
            frame: FrameConfig::default(),
        }
    }
}

impl RuntimeConfig {
    pub fn with_transaction_timeout(mut self, timeout: Duration) -> Self {
        self.transaction_timeout = timeout;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub fn with_dispatch_workers(mut self, workers: usize) -> Self {
        self.dispatch_workers = workers;
        self
    }

    pub fn with_close_idle_connections(mut self, close: bool) -> Self {
        self.close_idle_connections = close;
        self
    }

    pub fn with_frame_config(mut self, frame: FrameConfig) -> Self {
        self.frame = frame;
        self
    }
}
