use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Validation(String),
    #[error("Missing required component: {0}")]
    Missing(&'static str),
}

#[derive(Debug, Clone)]
pub struct Config {
    pub gate: GateConfig,
    pub network: NetworkConfig,
    pub node: NodeConfig,
}

#[derive(Debug, Clone)]
pub struct GateConfig {
    pub id: String,
    pub name: String,
    /// Address the RPC server binds to
    pub rpc_address: String,
    /// Upper bound for every outbound RPC issued by the gate
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Capacity of the request and event queues feeding the dispatch loop
    pub channel_capacity: usize,
    pub id: String,
    pub name: String,
    pub rpc_address: String,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// Host advertised to peers when an RPC server binds an unspecified address
    pub advertise_host: Option<String>,
    /// Client listener address
    pub bind_address: String,
    pub max_conn_num: usize,
    pub max_msg_length: usize,
}

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(3);
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: "gate".to_string(),
            rpc_address: "0.0.0.0:0".to_string(),
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            id: uuid::Uuid::new_v4().to_string(),
            name: "node".to_string(),
            rpc_address: "0.0.0.0:0".to_string(),
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            advertise_host: None,
            bind_address: "0.0.0.0:3553".to_string(),
            max_conn_num: 5000,
            max_msg_length: 1024 * 1024,
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn load() -> Result<Self, ConfigError> {
        let gate_defaults = GateConfig::default();
        let node_defaults = NodeConfig::default();
        let network_defaults = NetworkConfig::default();

        let gate = GateConfig {
            id: env_or("GATE_ID", gate_defaults.id),
            name: env_or("GATE_NAME", gate_defaults.name),
            rpc_address: env_or("GATE_RPC_ADDR", gate_defaults.rpc_address),
            timeout: env_parse("GATE_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(gate_defaults.timeout),
        };

        let node = NodeConfig {
            channel_capacity: env_parse("NODE_CHANNEL_CAPACITY")
                .unwrap_or(node_defaults.channel_capacity),
            id: env_or("NODE_ID", node_defaults.id),
            name: env_or("NODE_NAME", node_defaults.name),
            rpc_address: env_or("NODE_RPC_ADDR", node_defaults.rpc_address),
            timeout: env_parse("NODE_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(node_defaults.timeout),
        };

        let network = NetworkConfig {
            advertise_host: std::env::var("ADVERTISE_HOST")
                .ok()
                .filter(|h| !h.trim().is_empty()),
            bind_address: env_or("GATE_ADDR", network_defaults.bind_address),
            max_conn_num: env_parse("MAX_CONN_NUM").unwrap_or(network_defaults.max_conn_num),
            max_msg_length: env_parse("MAX_MSG_LENGTH")
                .unwrap_or(network_defaults.max_msg_length),
        };

        let config = Config {
            gate,
            network,
            node,
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.gate.id.is_empty() {
            return Err(ConfigError::Validation(
                "GATE_ID cannot be empty".to_string(),
            ));
        }
        if self.node.id.is_empty() {
            return Err(ConfigError::Validation(
                "NODE_ID cannot be empty".to_string(),
            ));
        }
        if self.gate.id == self.node.id {
            return Err(ConfigError::Validation(
                "GATE_ID and NODE_ID must differ".to_string(),
            ));
        }
        if self.gate.timeout.is_zero() || self.node.timeout.is_zero() {
            return Err(ConfigError::Validation(
                "RPC timeout must be greater than zero".to_string(),
            ));
        }
        if self.node.channel_capacity == 0 {
            return Err(ConfigError::Validation(
                "NODE_CHANNEL_CAPACITY must be greater than zero".to_string(),
            ));
        }
        if self.network.max_conn_num == 0 || self.network.max_msg_length == 0 {
            return Err(ConfigError::Validation(
                "MAX_CONN_NUM and MAX_MSG_LENGTH must be greater than zero".to_string(),
            ));
        }

        Ok(())
    }
}

fn env_or(key: &str, default: String) -> String {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or(default)
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.trim().parse().ok())
}
