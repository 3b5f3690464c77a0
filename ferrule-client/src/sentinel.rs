//! Sentinel-based master / replica resolution
//!
//! Sentinel endpoints are tried in order; the one that answers is moved to
//! the front so later resolutions ask it first. A long-lived notification
//! connection subscribes to `+switch-master` and reports failovers.

use crate::command::Command;
use crate::config::{Role, SentinelConfig, join_address};
use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::reply::Reply;
use parking_lot::{Mutex, RwLock};
use rand::seq::IndexedRandom;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Channel carrying master switch announcements
pub const SWITCH_MASTER_CHANNEL: &str = "+switch-master";

type FailoverObserver = Arc<dyn Fn() + Send + Sync>;

struct Inner {
    config: SentinelConfig,
    endpoints: RwLock<Vec<String>>,
    notifier: Mutex<Option<Connection>>,
    notifier_lock: tokio::sync::Mutex<()>,
    on_failover: Mutex<Option<FailoverObserver>>,
}

/// Resolver for a sentinel-managed deployment
///
/// # Example
/// ```no_run
/// use ferrule_client::{Command, Role, SentinelClient, SentinelConfig};
///
/// # async fn example() -> ferrule_client::Result<()> {
/// let sentinel = SentinelClient::new(SentinelConfig::new(
///     ["10.0.0.1:26379", "10.0.0.2:26379"],
///     "mymaster",
/// ));
/// sentinel.on_failover(|| println!("master switched"));
/// let master = sentinel.open("mymaster", Role::Master).await?;
/// master.send(&Command::new("SET").key("k").arg("v")).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct SentinelClient {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for SentinelClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SentinelClient")
            .field("endpoints", &self.endpoints())
            .field("master_name", &self.inner.config.master_name)
            .finish()
    }
}

impl SentinelClient {
    pub fn new(config: SentinelConfig) -> Self {
        let endpoints = config.endpoints.clone();
        Self {
            inner: Arc::new(Inner {
                config,
                endpoints: RwLock::new(endpoints),
                notifier: Mutex::new(None),
                notifier_lock: tokio::sync::Mutex::new(()),
                on_failover: Mutex::new(None),
            }),
        }
    }

    /// Open a connection to `role` of `master_name`
    ///
    /// Ensures the failover notification connection first, then resolves the
    /// role and connects to the resolved address.
    pub async fn open(&self, master_name: &str, role: Role) -> Result<Connection> {
        self.ensure_notifier().await?;
        let addr = self.resolve(master_name, role).await?;
        Connection::connect(&addr, &self.inner.config.connection).await
    }

    /// [`open`](Self::open) with the configured master name and role
    pub async fn connect(&self) -> Result<Connection> {
        let config = &self.inner.config;
        self.open(&config.master_name, config.role).await
    }

    /// Resolve the address currently serving `role`
    ///
    /// Per-endpoint failures are logged and the next endpoint is tried; only
    /// when every endpoint failed is [`Error::NoEndpointsAvailable`] returned.
    pub async fn resolve(&self, master_name: &str, role: Role) -> Result<String> {
        let endpoints = self.endpoints();
        for endpoint in &endpoints {
            match self.probe(endpoint, master_name, role).await {
                Ok(addr) => {
                    self.promote(endpoint);
                    info!(
                        "Sentinel {} resolved {} of {} to {}",
                        endpoint, role, master_name, addr
                    );
                    return Ok(addr);
                }
                Err(e) => warn!(
                    "Sentinel {} could not resolve {} of {}: {}",
                    endpoint, role, master_name, e
                ),
            }
        }
        Err(Error::NoEndpointsAvailable)
    }

    /// Observe master switches; replaces any earlier observer
    pub fn on_failover(&self, handler: impl Fn() + Send + Sync + 'static) {
        *self.inner.on_failover.lock() = Some(Arc::new(handler));
    }

    /// Endpoints in the order they will be tried
    pub fn endpoints(&self) -> Vec<String> {
        self.inner.endpoints.read().clone()
    }

    /// Close the notification connection
    pub fn close(&self) {
        let notifier = self.inner.notifier.lock().take();
        if let Some(conn) = notifier {
            conn.close();
        }
    }

    async fn ensure_notifier(&self) -> Result<()> {
        let _guard = self.inner.notifier_lock.lock().await;
        let alive = {
            let notifier = self.inner.notifier.lock();
            notifier.as_ref().is_some_and(|conn| !conn.is_closed())
        };
        if alive {
            return Ok(());
        }

        let addr = self.resolve(&self.inner.config.master_name, Role::Sentinel).await?;
        let conn = Connection::connect(&addr, &self.inner.config.connection).await?;

        let weak = Arc::downgrade(&self.inner);
        conn.on_message(move |reply| {
            if !is_message(&reply) {
                return;
            }
            let Some(inner) = weak.upgrade() else {
                return;
            };
            if let Some(payload) = reply.as_multi().and_then(|items| items.get(2)) {
                info!("Master switch announced: {}", payload.as_str().unwrap_or("?"));
            }
            let observer = inner.on_failover.lock().clone();
            if let Some(observer) = observer {
                observer();
            }
        });

        let weak = Arc::downgrade(&self.inner);
        conn.on_end(move || {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let mut notifier = inner.notifier.lock();
            if notifier.as_ref().is_some_and(Connection::is_closed) {
                debug!("Notification connection ended");
                *notifier = None;
            }
        });

        if let Err(e) = conn
            .send(&Command::new("SUBSCRIBE").arg(SWITCH_MASTER_CHANNEL))
            .await
        {
            conn.close();
            return Err(e);
        }
        *self.inner.notifier.lock() = Some(conn);
        Ok(())
    }

    async fn probe(&self, endpoint: &str, master_name: &str, role: Role) -> Result<String> {
        let conn = Connection::connect(endpoint, &self.inner.config.connection).await?;
        let result = query(&conn, endpoint, master_name, role).await;
        conn.close();
        result
    }

    fn promote(&self, endpoint: &str) {
        let mut endpoints = self.inner.endpoints.write();
        if let Some(index) = endpoints.iter().position(|e| e == endpoint).filter(|&i| i > 0) {
            let promoted = endpoints.remove(index);
            endpoints.insert(0, promoted);
        }
    }
}

async fn query(conn: &Connection, endpoint: &str, master_name: &str, role: Role) -> Result<String> {
    match role {
        Role::Sentinel => {
            conn.send(&Command::new("PING")).await?;
            Ok(endpoint.to_string())
        }
        Role::Master => {
            let reply = conn
                .send(&Command::new("SENTINEL get-master-addr-by-name").arg(master_name))
                .await?;
            master_address(&reply, master_name)
        }
        Role::Replica => {
            let reply = conn
                .send(&Command::new("SENTINEL slaves").arg(master_name))
                .await?;
            let replicas = reply
                .as_multi()
                .filter(|replicas| !replicas.is_empty())
                .ok_or_else(|| {
                    Error::UnexpectedReply(format!("no replicas known for {}", master_name))
                })?;
            let chosen = replicas
                .choose(&mut rand::rng())
                .ok_or_else(|| Error::UnexpectedReply("empty replica list".to_string()))?;
            replica_address(chosen)
        }
    }
}

/// `[host, port]` from `SENTINEL get-master-addr-by-name`
fn master_address(reply: &Reply, master_name: &str) -> Result<String> {
    let fields = reply
        .as_multi()
        .ok_or_else(|| Error::UnexpectedReply(format!("unknown master {}", master_name)))?;
    match fields {
        [host, port, ..] => address_of(host, port),
        _ => Err(Error::UnexpectedReply(format!(
            "master address has {} fields",
            fields.len()
        ))),
    }
}

/// `ip` and `port` from one flat field/value list of `SENTINEL slaves`
fn replica_address(entry: &Reply) -> Result<String> {
    let fields = entry
        .as_multi()
        .ok_or_else(|| Error::UnexpectedReply(format!("replica entry was {}", entry.kind())))?;

    let mut host = None;
    let mut port = None;
    for pair in fields.chunks_exact(2) {
        match pair[0].as_str() {
            Some("ip") => host = Some(&pair[1]),
            Some("port") => port = Some(&pair[1]),
            _ => {}
        }
    }
    match (host, port) {
        (Some(host), Some(port)) => address_of(host, port),
        _ => Err(Error::UnexpectedReply(
            "replica entry without ip/port".to_string(),
        )),
    }
}

fn address_of(host: &Reply, port: &Reply) -> Result<String> {
    let host = host
        .as_str()
        .filter(|host| !host.is_empty())
        .ok_or_else(|| Error::UnexpectedReply(format!("host was {}", host.kind())))?;
    let port = port
        .to_integer()
        .and_then(|port| u16::try_from(port).ok())
        .ok_or_else(|| Error::UnexpectedReply(format!("port was {}", port.kind())))?;
    Ok(join_address(host, port))
}

/// Pub/sub delivery: `["message", channel, payload]`
fn is_message(reply: &Reply) -> bool {
    reply
        .as_multi()
        .and_then(|items| items.first())
        .and_then(Reply::as_str)
        .is_some_and(|kind| kind.eq_ignore_ascii_case("message"))
}
