//! The balancer's JSON configuration document.
//!
//! ```json
//! {
//!   "clients": { "iface": 0, "port": 80, "waitq_limit": 1000, "session_limit": 1000 },
//!   "nodes":   { "iface": 1, "list": [["10.0.0.1", 6001], ["10.0.0.2", 6001]] }
//! }
//! ```
//!
//! Parse failures are fatal at startup; there is no sensible way to balance
//! toward backends we cannot name.

use serde::Deserialize;
use weir_core::endpoint::{Endpoint, Ipv4Address};

/// The whole configuration document.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub clients: ClientsConfig,
    pub nodes: NodesConfig,
}

/// The public, client-facing side.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClientsConfig {
    /// Network interface id for the public side.
    pub iface: u32,
    /// The listening port.
    pub port: u16,
    /// Clients held in the wait queue before new ones are turned away.
    #[serde(default = "default_waitq_limit")]
    pub waitq_limit: usize,
    /// Concurrent sessions before pairing stops.
    #[serde(default = "default_session_limit")]
    pub session_limit: usize,
}

/// The backend side.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NodesConfig {
    /// Network interface id for the backend side.
    pub iface: u32,
    /// Backends as `[address, port]` pairs, in rotation order.
    pub list: Vec<(String, u16)>,
    /// Warm connections to keep per backend.
    #[serde(default = "default_pool_target")]
    pub pool_target: usize,
}

fn default_waitq_limit() -> usize {
    1000
}

fn default_session_limit() -> usize {
    1000
}

fn default_pool_target() -> usize {
    4
}

/// The configuration could not be used.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Malformed configuration: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("clients.port must be nonzero")]
    BadPort,
    #[error("nodes.list must name at least one backend")]
    NoNodes,
    #[error("Bad backend address {0:?}")]
    BadAddress(String),
    #[error("Backend {0}:{1} has a zero port")]
    BadNodePort(String, u16),
}

impl Config {
    /// Parses and validates a configuration document.
    pub fn from_json(document: &str) -> Result<Self, ConfigError> {
        let config: Config = serde_json::from_str(document)?;
        if config.clients.port == 0 {
            return Err(ConfigError::BadPort);
        }
        if config.nodes.list.is_empty() {
            return Err(ConfigError::NoNodes);
        }
        // Surface bad addresses now rather than at the first probe.
        config.node_sockets()?;
        Ok(config)
    }

    /// The backend sockets, in configured order.
    pub fn node_sockets(&self) -> Result<Vec<Endpoint>, ConfigError> {
        self.nodes
            .list
            .iter()
            .map(|(address, port)| {
                if *port == 0 {
                    return Err(ConfigError::BadNodePort(address.clone(), *port));
                }
                let address: Ipv4Address = address
                    .parse()
                    .map_err(|_| ConfigError::BadAddress(address.clone()))?;
                Ok(Endpoint::new(address, *port))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const GOOD: &str = r#"{
        "clients": { "iface": 0, "port": 80, "waitq_limit": 64, "session_limit": 128 },
        "nodes":   { "iface": 1, "list": [["10.0.0.1", 6001], ["10.0.0.2", 6002]] }
    }"#;

    #[test]
    fn parses_a_full_document() {
        let config = Config::from_json(GOOD).unwrap();
        assert_eq!(config.clients.port, 80);
        assert_eq!(config.clients.waitq_limit, 64);
        assert_eq!(config.clients.session_limit, 128);
        assert_eq!(config.nodes.pool_target, 4);
        let sockets = config.node_sockets().unwrap();
        assert_eq!(sockets.len(), 2);
        assert_eq!(
            sockets[0],
            Endpoint::new(Ipv4Address::new([10, 0, 0, 1]), 6001)
        );
    }

    #[test]
    fn limits_default_when_absent() {
        let config = Config::from_json(
            r#"{
                "clients": { "iface": 0, "port": 8080 },
                "nodes":   { "iface": 1, "list": [["192.168.1.1", 80]] }
            }"#,
        )
        .unwrap();
        assert_eq!(config.clients.waitq_limit, 1000);
        assert_eq!(config.clients.session_limit, 1000);
    }

    #[test]
    fn rejects_garbage() {
        assert!(matches!(
            Config::from_json("not json"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn rejects_missing_nodes() {
        let result = Config::from_json(
            r#"{ "clients": { "iface": 0, "port": 80 }, "nodes": { "iface": 1, "list": [] } }"#,
        );
        assert!(matches!(result, Err(ConfigError::NoNodes)));
    }

    #[test]
    fn rejects_unparseable_address() {
        let result = Config::from_json(
            r#"{ "clients": { "iface": 0, "port": 80 },
                 "nodes": { "iface": 1, "list": [["backend-1.local", 80]] } }"#,
        );
        assert!(matches!(result, Err(ConfigError::BadAddress(_))));
    }

    #[test]
    fn rejects_zero_client_port() {
        let result = Config::from_json(
            r#"{ "clients": { "iface": 0, "port": 0 },
                 "nodes": { "iface": 1, "list": [["10.0.0.1", 80]] } }"#,
        );
        assert!(matches!(result, Err(ConfigError::BadPort)));
    }
}
