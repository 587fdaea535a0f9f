//! Discovery node configuration.
//!
//! One struct carries everything a node needs to join a cluster: where the ensemble
//! is, how long a session may be silent before it is declared dead, which subtree of
//! the coordination store belongs to the cluster, and who this node is.
//!
//! The session timeout is load-bearing twice: it is the retry window of every
//! coordination call, and it is how long peers wait before this node's liveness
//! marker disappears after a crash or partition.

use std::collections::BTreeMap;
use std::time::Duration;

use uuid::Uuid;

use crate::constants::{
    DEFAULT_CONNECT_STRING, DEFAULT_ROOT_PATH, DEFAULT_SESSION_TIMEOUT_MS, MIN_SESSION_TIMEOUT_MS,
};
use crate::types::{NodeId, ProductVersion};

/// Configuration for one discovery node.
#[derive(Debug, Clone, PartialEq)]
pub struct DiscoveryConfig {
    /// Comma-separated `host:port` list of ensemble members.
    pub connect_string: String,

    /// Session timeout (default: 5s).
    pub session_timeout: Duration,

    /// Root of the cluster's subtree in the coordination store (default: /zkdiscovery).
    pub root_path: String,

    /// Identifier of this node (default: random).
    pub node_id: NodeId,

    /// Stable identifier that survives restarts; defaults to the node id.
    pub consistent_id: Option<String>,

    /// Whether this node joins as a client (no data ownership).
    pub client_mode: bool,

    /// How long `start` waits for the node to see itself in the topology
    /// (default: twice the session timeout).
    pub join_timeout: Duration,

    /// Create the cluster's root structure if it is missing instead of failing.
    pub bootstrap_if_absent: bool,

    /// Attributes published with this node's join data.
    pub attributes: BTreeMap<String, serde_json::Value>,

    /// Version published with this node's join data.
    pub version: ProductVersion,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        let session_timeout = Duration::from_millis(DEFAULT_SESSION_TIMEOUT_MS);
        Self {
            connect_string: DEFAULT_CONNECT_STRING.to_string(),
            session_timeout,
            root_path: DEFAULT_ROOT_PATH.to_string(),
            node_id: Uuid::new_v4(),
            consistent_id: None,
            client_mode: false,
            join_timeout: session_timeout * 2,
            bootstrap_if_absent: false,
            attributes: BTreeMap::new(),
            version: ProductVersion::current(),
        }
    }
}

impl DiscoveryConfig {
    /// Configuration for the given ensemble with every other field defaulted.
    pub fn new(connect_string: impl Into<String>) -> Self {
        Self {
            connect_string: connect_string.into(),
            ..Self::default()
        }
    }

    /// Set the session timeout; the join timeout follows at twice the value.
    pub fn with_session_timeout(mut self, timeout: Duration) -> Self {
        self.session_timeout = timeout;
        self.join_timeout = timeout * 2;
        self
    }

    pub fn with_root_path(mut self, root_path: impl Into<String>) -> Self {
        self.root_path = root_path.into();
        self
    }

    pub fn with_node_id(mut self, node_id: NodeId) -> Self {
        self.node_id = node_id;
        self
    }

    pub fn with_consistent_id(mut self, consistent_id: impl Into<String>) -> Self {
        self.consistent_id = Some(consistent_id.into());
        self
    }

    pub fn with_client_mode(mut self, client_mode: bool) -> Self {
        self.client_mode = client_mode;
        self
    }

    pub fn with_join_timeout(mut self, timeout: Duration) -> Self {
        self.join_timeout = timeout;
        self
    }

    pub fn with_bootstrap_if_absent(mut self, bootstrap: bool) -> Self {
        self.bootstrap_if_absent = bootstrap;
        self
    }

    /// Add one published attribute.
    pub fn with_attribute(
        mut self,
        key: impl Into<String>,
        value: impl Into<serde_json::Value>,
    ) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    pub fn with_version(mut self, version: ProductVersion) -> Self {
        self.version = version;
        self
    }

    /// Consistent id, falling back to the node id.
    pub fn effective_consistent_id(&self) -> String {
        self.consistent_id
            .clone()
            .unwrap_or_else(|| self.node_id.to_string())
    }

    /// Validate the configuration and return any errors found.
    ///
    /// This should be called at startup to catch configuration issues early.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        let members: Vec<&str> = self
            .connect_string
            .split(',')
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .collect();
        if members.is_empty() {
            errors.push("connect_string must list at least one ensemble member".to_string());
        }
        for member in members {
            if !is_host_port(member) {
                errors.push(format!(
                    "connect_string member '{}' must have the form host:port",
                    member
                ));
            }
        }

        if self.session_timeout < Duration::from_millis(MIN_SESSION_TIMEOUT_MS) {
            errors.push(format!(
                "session_timeout ({:?}) must be at least {}ms",
                self.session_timeout, MIN_SESSION_TIMEOUT_MS
            ));
        }

        if !self.root_path.starts_with('/') {
            errors.push(format!(
                "root_path ('{}') must be an absolute path",
                self.root_path
            ));
        } else if self.root_path.len() > 1 && self.root_path.ends_with('/') {
            errors.push(format!(
                "root_path ('{}') must not end with '/'",
                self.root_path
            ));
        } else if self.root_path == "/" {
            errors.push("root_path must not be the ensemble root".to_string());
        } else if self.root_path.contains("//") {
            errors.push(format!(
                "root_path ('{}') must not contain empty segments",
                self.root_path
            ));
        }

        if self.join_timeout < self.session_timeout {
            errors.push(format!(
                "join_timeout ({:?}) must be at least session_timeout ({:?})",
                self.join_timeout, self.session_timeout
            ));
        }

        if let Some(consistent_id) = &self.consistent_id {
            if consistent_id.trim().is_empty() {
                errors.push("consistent_id must not be blank when set".to_string());
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Like [`validate`](Self::validate), but panics listing every problem.
    ///
    /// For binaries that cannot start without a usable configuration.
    pub fn validate_or_panic(&self) {
        if let Err(errors) = self.validate() {
            panic!(
                "Invalid discovery configuration ({} problem(s)): {}",
                errors.len(),
                errors.join("; ")
            );
        }
    }

    /// Create configuration from environment variables.
    ///
    /// Environment variables:
    /// - `ZK_CONNECT_STRING`: Ensemble members (default: 127.0.0.1:2181)
    /// - `ZK_SESSION_TIMEOUT_MS`: Session timeout (default: 5000)
    /// - `ZK_ROOT_PATH`: Cluster root path (default: /zkdiscovery)
    /// - `NODE_ID`: Node UUID (default: random)
    /// - `CONSISTENT_ID`: Stable node identifier (default: node id)
    /// - `CLIENT_MODE`: "true" or "false" (default: false)
    /// - `JOIN_TIMEOUT_MS`: Join timeout (default: 2 x session timeout)
    /// - `BOOTSTRAP_CLUSTER`: "true" or "false" (default: false)
    pub fn from_env() -> Result<Self, Box<dyn std::error::Error>> {
        let defaults = Self::default();

        let connect_string =
            std::env::var("ZK_CONNECT_STRING").unwrap_or(defaults.connect_string);

        let session_timeout_ms: u64 = std::env::var("ZK_SESSION_TIMEOUT_MS")
            .unwrap_or_else(|_| DEFAULT_SESSION_TIMEOUT_MS.to_string())
            .parse()
            .map_err(|e| format!("Invalid ZK_SESSION_TIMEOUT_MS: {}", e))?;
        let session_timeout = Duration::from_millis(session_timeout_ms);

        let root_path = std::env::var("ZK_ROOT_PATH").unwrap_or(defaults.root_path);

        let node_id = match std::env::var("NODE_ID") {
            Ok(raw) => Uuid::parse_str(raw.trim())
                .map_err(|e| format!("Invalid NODE_ID: {}", e))?,
            Err(_) => defaults.node_id,
        };

        let consistent_id = std::env::var("CONSISTENT_ID").ok();

        let client_mode = parse_bool_env("CLIENT_MODE", false)?;

        let join_timeout = match std::env::var("JOIN_TIMEOUT_MS") {
            Ok(raw) => Duration::from_millis(
                raw.parse()
                    .map_err(|e| format!("Invalid JOIN_TIMEOUT_MS: {}", e))?,
            ),
            Err(_) => session_timeout * 2,
        };

        let bootstrap_if_absent = parse_bool_env("BOOTSTRAP_CLUSTER", false)?;

        Ok(Self {
            connect_string,
            session_timeout,
            root_path,
            node_id,
            consistent_id,
            client_mode,
            join_timeout,
            bootstrap_if_absent,
            attributes: defaults.attributes,
            version: defaults.version,
        })
    }
}

fn parse_bool_env(name: &str, default: bool) -> Result<bool, String> {
    match std::env::var(name) {
        Ok(raw) => match raw.trim().to_lowercase().as_str() {
            "true" | "1" | "yes" => Ok(true),
            "false" | "0" | "no" => Ok(false),
            other => Err(format!("Invalid {}: '{}' is not a boolean", name, other)),
        },
        Err(_) => Ok(default),
    }
}

fn is_host_port(member: &str) -> bool {
    match member.rsplit_once(':') {
        Some((host, port)) => !host.is_empty() && port.parse::<u16>().is_ok_and(|p| p > 0),
        None => false,
    }
}
