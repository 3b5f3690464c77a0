//! Single-node client

use crate::command::Command;
use crate::config::ConnectionConfig;
use crate::connection::Connection;
use crate::error::Result;
use crate::reply::Reply;

/// Client for a standalone server: exactly one connection to one address
///
/// # Example
/// ```no_run
/// use ferrule_client::{Command, ConnectionConfig, DirectClient};
///
/// # async fn example() -> ferrule_client::Result<()> {
/// let client = DirectClient::connect("127.0.0.1:6379", ConnectionConfig::default()).await?;
/// client.send(&Command::new("SET").key("foo").arg("bar")).await?;
/// let value = client.send(&Command::new("GET").key("foo")).await?;
/// assert_eq!(value.as_str(), Some("bar"));
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct DirectClient {
    connection: Connection,
}

impl DirectClient {
    /// Connect to `addr` (`host:port`)
    pub async fn connect(addr: &str, config: ConnectionConfig) -> Result<Self> {
        let connection = Connection::connect(addr, &config).await?;
        Ok(Self { connection })
    }

    /// The underlying connection, for handlers and pause/resume
    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    pub async fn send(&self, command: &Command) -> Result<Reply> {
        self.connection.send(command).await
    }

    pub fn close(&self) {
        self.connection.close();
    }
}
