//! Client configuration
//!
//! Every struct deserializes from YAML/JSON with missing fields falling back
//! to their defaults, and offers `with_*` builders for programmatic use.

use crate::command::NullEncoding;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Per-connection settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// TCP connect timeout (milliseconds)
    pub connect_timeout_ms: u64,

    /// Initial capacity of the read buffer (bytes)
    pub read_buffer_size: usize,

    /// Framing used for null arguments
    pub null_encoding: NullEncoding,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 5000,
            read_buffer_size: 16 * 1024,
            null_encoding: NullEncoding::EmptyBulk,
        }
    }
}

impl ConnectionConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Set the connect timeout
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Set the initial read buffer capacity
    pub fn with_read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size;
        self
    }

    /// Set how null arguments are framed
    pub fn with_null_encoding(mut self, null_encoding: NullEncoding) -> Self {
        self.null_encoding = null_encoding;
        self
    }
}

/// Exponential backoff for TRYAGAIN / CLUSTERDOWN retries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffPolicy {
    /// Delay before the first retry (milliseconds)
    pub base_ms: u64,

    /// Upper bound on any single delay (milliseconds)
    pub max_ms: u64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_ms: 10,
            max_ms: 1280,
        }
    }
}

impl BackoffPolicy {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base_ms: base.as_millis() as u64,
            max_ms: max.as_millis() as u64,
        }
    }

    /// Delay before retry number `attempt` (0-based): `min(base * 2^attempt, max)`
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
        Duration::from_millis(self.base_ms.saturating_mul(factor).min(self.max_ms))
    }
}

/// Which shard member serves read-only commands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplicaPolicy {
    /// Always the master
    #[default]
    Never,
    /// A random replica, falling back to the master when the shard has none
    Always,
    /// Uniformly across master and replicas
    Share,
}

impl FromStr for ReplicaPolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "never" => Ok(ReplicaPolicy::Never),
            "always" => Ok(ReplicaPolicy::Always),
            "share" => Ok(ReplicaPolicy::Share),
            other => Err(Error::Config(format!("unknown replica policy: {}", other))),
        }
    }
}

impl fmt::Display for ReplicaPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ReplicaPolicy::Never => "never",
            ReplicaPolicy::Always => "always",
            ReplicaPolicy::Share => "share",
        };
        f.write_str(name)
    }
}

/// Server role resolved through sentinels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// A sentinel process itself
    Sentinel,
    /// The current master of a monitored group
    #[default]
    Master,
    /// One of the master's replicas
    #[serde(alias = "slave")]
    Replica,
}

impl FromStr for Role {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "sentinel" => Ok(Role::Sentinel),
            "master" => Ok(Role::Master),
            "replica" | "slave" => Ok(Role::Replica),
            other => Err(Error::Config(format!("unknown role: {}", other))),
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Role::Sentinel => "sentinel",
            Role::Master => "master",
            Role::Replica => "replica",
        };
        f.write_str(name)
    }
}

/// Cluster router settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Seed node addresses (`host:port`)
    pub seeds: Vec<String>,

    /// Replica selection for read-only commands
    pub replica_policy: ReplicaPolicy,

    /// Retry budget shared by redirects and transient errors
    pub max_redirects: u32,

    /// Backoff for TRYAGAIN / CLUSTERDOWN
    pub backoff: BackoffPolicy,

    /// Settings for every pooled connection
    pub connection: ConnectionConfig,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            seeds: Vec::new(),
            replica_policy: ReplicaPolicy::Never,
            max_redirects: 16,
            backoff: BackoffPolicy::default(),
            connection: ConnectionConfig::default(),
        }
    }
}

impl ClusterConfig {
    /// Create a config for the given seed addresses
    pub fn new<I, S>(seeds: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            seeds: seeds.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    /// Set the replica policy
    pub fn with_replica_policy(mut self, policy: ReplicaPolicy) -> Self {
        self.replica_policy = policy;
        self
    }

    /// Set the retry budget
    pub fn with_max_redirects(mut self, max_redirects: u32) -> Self {
        self.max_redirects = max_redirects;
        self
    }

    /// Set the backoff policy
    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    /// Set the per-connection settings
    pub fn with_connection(mut self, connection: ConnectionConfig) -> Self {
        self.connection = connection;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.seeds.is_empty() {
            return Err(Error::Config("at least one seed is required".to_string()));
        }
        for seed in &self.seeds {
            split_address(seed)?;
        }
        if self.backoff.base_ms > self.backoff.max_ms {
            return Err(Error::Config(format!(
                "backoff base {}ms exceeds max {}ms",
                self.backoff.base_ms, self.backoff.max_ms
            )));
        }
        Ok(())
    }
}

/// Sentinel resolver settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SentinelConfig {
    /// Sentinel addresses (`host:port`), tried in order
    pub endpoints: Vec<String>,

    /// Name of the monitored master group
    pub master_name: String,

    /// Role requested by default
    pub role: Role,

    /// Settings for probe and returned connections
    pub connection: ConnectionConfig,
}

impl Default for SentinelConfig {
    fn default() -> Self {
        Self {
            endpoints: Vec::new(),
            master_name: "mymaster".to_string(),
            role: Role::Master,
            connection: ConnectionConfig::default(),
        }
    }
}

impl SentinelConfig {
    /// Create a config for the given sentinel addresses and master group
    pub fn new<I, S>(endpoints: I, master_name: impl Into<String>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            endpoints: endpoints.into_iter().map(Into::into).collect(),
            master_name: master_name.into(),
            ..Self::default()
        }
    }

    /// Set the default role
    pub fn with_role(mut self, role: Role) -> Self {
        self.role = role;
        self
    }

    /// Set the per-connection settings
    pub fn with_connection(mut self, connection: ConnectionConfig) -> Self {
        self.connection = connection;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.endpoints.is_empty() {
            return Err(Error::Config(
                "at least one sentinel endpoint is required".to_string(),
            ));
        }
        if self.master_name.is_empty() {
            return Err(Error::Config("master name must not be empty".to_string()));
        }
        for endpoint in &self.endpoints {
            split_address(endpoint)?;
        }
        Ok(())
    }
}

/// Split `host:port`; the host may itself contain colons (IPv6)
pub fn split_address(addr: &str) -> Result<(&str, u16)> {
    let (host, port) = addr
        .rsplit_once(':')
        .ok_or_else(|| Error::InvalidAddress(addr.to_string()))?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        return Err(Error::InvalidAddress(addr.to_string()));
    }
    let port = port
        .parse::<u16>()
        .map_err(|_| Error::InvalidAddress(addr.to_string()))?;
    Ok((host, port))
}

/// Format `host:port`, bracketing IPv6 hosts
pub fn join_address(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ClusterConfig::default();
        assert_eq!(config.max_redirects, 16);
        assert_eq!(config.replica_policy, ReplicaPolicy::Never);
        assert_eq!(config.connection.connect_timeout(), Duration::from_secs(5));
        assert_eq!(config.connection.null_encoding, NullEncoding::EmptyBulk);

        let sentinel = SentinelConfig::default();
        assert_eq!(sentinel.role, Role::Master);
    }

    #[test]
    fn test_backoff_doubles_until_cap() {
        let backoff = BackoffPolicy::default();
        assert_eq!(backoff.delay(0), Duration::from_millis(10));
        assert_eq!(backoff.delay(1), Duration::from_millis(20));
        assert_eq!(backoff.delay(7), Duration::from_millis(1280));
        assert_eq!(backoff.delay(8), Duration::from_millis(1280));
        assert_eq!(backoff.delay(200), Duration::from_millis(1280));
    }

    #[test]
    fn test_builders() {
        let config = ClusterConfig::new(["127.0.0.1:7000", "127.0.0.1:7001"])
            .with_replica_policy(ReplicaPolicy::Share)
            .with_max_redirects(3)
            .with_backoff(BackoffPolicy::new(
                Duration::from_millis(1),
                Duration::from_millis(4),
            ))
            .with_connection(
                ConnectionConfig::default().with_connect_timeout(Duration::from_millis(250)),
            );
        assert_eq!(config.seeds.len(), 2);
        assert_eq!(config.max_redirects, 3);
        assert_eq!(config.backoff.delay(5), Duration::from_millis(4));
        assert_eq!(config.connection.connect_timeout_ms, 250);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate() {
        assert!(ClusterConfig::default().validate().is_err());
        assert!(ClusterConfig::new(["nohost"]).validate().is_err());
        assert!(ClusterConfig::new(["host:99999"]).validate().is_err());

        assert!(SentinelConfig::new(Vec::<String>::new(), "m").validate().is_err());
        assert!(SentinelConfig::new(["s:26379"], "").validate().is_err());
        assert!(SentinelConfig::new(["s:26379"], "m").validate().is_ok());
    }

    #[test]
    fn test_split_address() {
        assert_eq!(split_address("127.0.0.1:6379").unwrap(), ("127.0.0.1", 6379));
        assert_eq!(split_address("[::1]:7000").unwrap(), ("::1", 7000));
        assert!(matches!(split_address(":6379"), Err(Error::InvalidAddress(_))));
        assert!(matches!(split_address("host:"), Err(Error::InvalidAddress(_))));
        assert_eq!(join_address("::1", 7000), "[::1]:7000");
        assert_eq!(join_address("10.0.0.1", 7000), "10.0.0.1:7000");
    }

    #[test]
    fn test_parse_enums() {
        assert_eq!("SHARE".parse::<ReplicaPolicy>().unwrap(), ReplicaPolicy::Share);
        assert_eq!("slave".parse::<Role>().unwrap(), Role::Replica);
        assert!("leader".parse::<Role>().is_err());
        assert_eq!(Role::Replica.to_string(), "replica");
    }

    #[test]
    fn test_deserialize_partial() {
        let json = r#"{"seeds": ["a:1"], "replica_policy": "always", "backoff": {"max_ms": 50}}"#;
        let config: ClusterConfig = from_yaml(json);
        assert_eq!(config.replica_policy, ReplicaPolicy::Always);
        assert_eq!(config.backoff.base_ms, 10);
        assert_eq!(config.backoff.max_ms, 50);
        assert_eq!(config.max_redirects, 16);

        let sentinel: SentinelConfig =
            from_yaml(r#"{"endpoints": ["s:1"], "role": "slave"}"#);
        assert_eq!(sentinel.role, Role::Replica);
        assert_eq!(sentinel.master_name, "mymaster");
    }

    fn from_yaml<T: serde::de::DeserializeOwned>(text: &str) -> T {
        serde_yaml::from_str(text).unwrap()
    }
}
