//! # Ferrule client
//!
//! Async client engine for servers speaking the RESP2 wire protocol.
//!
//! ## Features
//!
//! - **Pipelining**: one socket per connection, replies matched to commands in FIFO order
//! - **Cluster routing**: CRC16 hash slots, MOVED / ASK redirects, TRYAGAIN backoff, replica reads
//! - **Sentinel**: master / replica resolution with endpoint affinity and failover notification
//! - **Pub/Sub**: unsolicited replies delivered to a per-connection handler
//! - **Async/Await**: built on Tokio
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use ferrule_client::{Command, ConnectionConfig, DirectClient};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = DirectClient::connect("127.0.0.1:6379", ConnectionConfig::default()).await?;
//!
//!     client.send(&Command::new("SET").key("user:1").arg("John Doe")).await?;
//!     let value = client.send(&Command::new("GET").key("user:1")).await?;
//!     println!("Value: {}", value);
//!
//!     Ok(())
//! }
//! ```

pub mod cluster;
pub mod command;
pub mod config;
pub mod connection;
pub mod direct;
pub mod error;
pub mod parser;
pub mod reply;
pub mod sentinel;
pub mod slot;

pub use cluster::{ClusterClient, Redirect, SlotTable};
pub use command::{Arg, Command, NullEncoding};
pub use config::{
    BackoffPolicy, ClusterConfig, ConnectionConfig, ReplicaPolicy, Role, SentinelConfig,
};
pub use connection::Connection;
pub use direct::DirectClient;
pub use error::{Error, Result};
pub use parser::ReplyParser;
pub use reply::Reply;
pub use sentinel::SentinelClient;
pub use slot::hash_slot;
