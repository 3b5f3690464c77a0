//! Cluster router
//!
//! Keeps one connection per node and a slot table refreshed from
//! `CLUSTER SLOTS`. Commands go to the shard owning their key's slot;
//! redirects and transient errors are retried within one budget.

use super::redirect::{Redirect, resolve_target};
use super::slot_table::SlotTable;
use crate::command::Command;
use crate::config::{ClusterConfig, ReplicaPolicy, split_address};
use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::reply::Reply;
use bytes::Bytes;
use futures::future::{BoxFuture, FutureExt, join_all, try_join_all};
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use rand::seq::IndexedRandom;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};

type ExceptionObserver = Arc<dyn Fn(&Error) + Send + Sync>;
type EndObserver = Arc<dyn Fn() + Send + Sync>;

struct Inner {
    config: ClusterConfig,
    pool: RwLock<HashMap<String, Connection>>,
    table: RwLock<Arc<SlotTable>>,
    refresh_lock: tokio::sync::Mutex<()>,
    on_exception: Mutex<Option<ExceptionObserver>>,
    on_end: Mutex<Option<EndObserver>>,
    closed: AtomicBool,
}

/// Client for a sharded cluster
///
/// Cheap to clone; clones share the node pool and slot table.
///
/// # Example
/// ```no_run
/// use ferrule_client::{ClusterClient, ClusterConfig, Command, ReplicaPolicy};
///
/// # async fn example() -> ferrule_client::Result<()> {
/// let config = ClusterConfig::new(["127.0.0.1:7000", "127.0.0.1:7001"])
///     .with_replica_policy(ReplicaPolicy::Share);
/// let cluster = ClusterClient::open(config).await?;
/// cluster.send(&Command::new("SET").key("user:{42}:name").arg("ada")).await?;
/// let name = cluster.send(&Command::new("GET").key("user:{42}:name")).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct ClusterClient {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for ClusterClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterClient")
            .field("nodes", &self.nodes())
            .field("shards", &self.slot_table().shards().len())
            .finish()
    }
}

impl ClusterClient {
    /// Connect to every seed, then load the slot table
    ///
    /// Fails with the first seed connection error.
    pub async fn open(config: ClusterConfig) -> Result<Self> {
        config.validate()?;
        let seeds = config.seeds.clone();
        let inner = Arc::new(Inner {
            config,
            pool: RwLock::new(HashMap::new()),
            table: RwLock::new(Arc::new(SlotTable::empty())),
            refresh_lock: tokio::sync::Mutex::new(()),
            on_exception: Mutex::new(None),
            on_end: Mutex::new(None),
            closed: AtomicBool::new(false),
        });
        let client = Self { inner };

        let connected = async {
            try_join_all(seeds.iter().map(|seed| connect_node(&client.inner, seed))).await?;
            refresh(Arc::clone(&client.inner)).await
        }
        .await;
        if let Err(e) = connected {
            client.close();
            return Err(e);
        }

        info!("Cluster client ready with {} nodes", client.nodes().len());
        Ok(client)
    }

    /// Route a command and return its reply
    ///
    /// `MOVED` refreshes the slot table and retries on the named node, `ASK`
    /// retries once on the named node after `ASKING`, `TRYAGAIN` and
    /// `CLUSTERDOWN` retry the same node after a backoff. All of them draw on
    /// the `max_redirects` budget; once it is spent the last error is returned.
    pub async fn send(&self, command: &Command) -> Result<Reply> {
        let frame = command.encode_with(self.inner.config.connection.null_encoding);
        let mut conn = self.route(command).await?;
        let mut budget = self.inner.config.max_redirects;
        let mut attempt = 0u32;
        let mut asking = false;

        loop {
            let result = if asking {
                send_asking(&conn, frame.clone()).await
            } else {
                conn.send_frame(frame.clone()).await
            };
            asking = false;

            let err = match result {
                Ok(reply) => return Ok(reply),
                Err(err) => err,
            };
            let Some(redirect) = err.reply_text().and_then(Redirect::parse) else {
                return Err(err);
            };
            if budget == 0 {
                debug!("Retry budget exhausted for {}: {}", command.name(), err);
                return Err(err);
            }
            budget -= 1;

            match redirect {
                Redirect::Moved { slot, address } => {
                    let address = resolve_target(&address, conn.address());
                    debug!("{} slot {} moved to {}", command.name(), slot, address);
                    if let Err(e) = self.refresh_slots().await {
                        warn!("Slot refresh after MOVED failed: {}", e);
                    }
                    conn = connect_node(&self.inner, &address).await?;
                }
                Redirect::Ask { slot, address } => {
                    let address = resolve_target(&address, conn.address());
                    debug!("{} slot {} asked at {}", command.name(), slot, address);
                    conn = connect_node(&self.inner, &address).await?;
                    asking = true;
                }
                Redirect::TryAgain | Redirect::ClusterDown => {
                    let delay = self.inner.config.backoff.delay(attempt);
                    debug!(
                        "{} on {}, retrying in {:?}",
                        err,
                        conn.address(),
                        delay
                    );
                    tokio::time::sleep(delay).await;
                }
            }
            attempt += 1;
        }
    }

    /// Reload the slot table from a random node
    ///
    /// Nodes that fail to answer are skipped; with none left this returns
    /// [`Error::NoConnectionAvailable`]. Nodes not present in the new table
    /// are disconnected.
    pub async fn refresh_slots(&self) -> Result<()> {
        refresh(Arc::clone(&self.inner)).await
    }

    /// Observe failures of pooled connections; replaces any earlier observer
    pub fn on_exception(&self, handler: impl Fn(&Error) + Send + Sync + 'static) {
        *self.inner.on_exception.lock() = Some(Arc::new(handler));
    }

    /// Observe the pool becoming empty; replaces any earlier observer
    pub fn on_end(&self, handler: impl Fn() + Send + Sync + 'static) {
        *self.inner.on_end.lock() = Some(Arc::new(handler));
    }

    /// Current slot table
    pub fn slot_table(&self) -> Arc<SlotTable> {
        Arc::clone(&self.inner.table.read())
    }

    /// Addresses of pooled connections, sorted
    pub fn nodes(&self) -> Vec<String> {
        let mut nodes: Vec<String> = self.inner.pool.read().keys().cloned().collect();
        nodes.sort();
        nodes
    }

    /// Close every pooled connection
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        let connections: Vec<Connection> = self.inner.pool.read().values().cloned().collect();
        for conn in connections {
            conn.close();
        }
    }

    async fn route(&self, command: &Command) -> Result<Connection> {
        let target = command.slot().and_then(|slot| {
            let table = self.slot_table();
            let shard = table.shard(slot)?;
            let node = select_node(
                shard,
                self.inner.config.replica_policy,
                command.is_read_only(),
                &mut rand::rng(),
            );
            Some(node.to_string())
        });

        match target {
            Some(addr) => connect_node(&self.inner, &addr).await,
            None => random_connection(&self.inner, &HashSet::new())
                .map(|(_, conn)| conn)
                .ok_or(Error::NoConnectionAvailable),
        }
    }
}

/// Pick the shard member for a command
///
/// Writes always go to the master; reads follow the replica policy.
fn select_node<'a>(
    shard: &'a [String],
    policy: ReplicaPolicy,
    read_only: bool,
    rng: &mut impl Rng,
) -> &'a str {
    let index = match policy {
        _ if !read_only || shard.len() < 2 => 0,
        ReplicaPolicy::Never => 0,
        ReplicaPolicy::Always => rng.random_range(1..shard.len()),
        ReplicaPolicy::Share => rng.random_range(0..shard.len()),
    };
    &shard[index]
}

/// Send `ASKING` and the frame back to back on one connection
async fn send_asking(conn: &Connection, frame: Bytes) -> Result<Reply> {
    static ASKING: std::sync::LazyLock<Bytes> =
        std::sync::LazyLock::new(|| Command::new("ASKING").encode());

    let asking = conn.submit(ASKING.clone())?;
    let reply = conn.submit(frame)?;
    if let Ok(Err(e)) = asking.await {
        debug!("ASKING on {} failed: {}", conn.address(), e);
    }
    reply.await.unwrap_or(Err(Error::ConnectionClosed))
}

fn random_connection(
    inner: &Inner,
    excluded: &HashSet<String>,
) -> Option<(String, Connection)> {
    let pool = inner.pool.read();
    let candidates: Vec<(&String, &Connection)> = pool
        .iter()
        .filter(|(addr, conn)| !excluded.contains(*addr) && !conn.is_closed())
        .collect();
    candidates
        .choose(&mut rand::rng())
        .map(|(addr, conn)| ((*addr).clone(), (*conn).clone()))
}

/// Pooled connection to `addr`, connecting if needed
async fn connect_node(inner: &Arc<Inner>, addr: &str) -> Result<Connection> {
    let existing = {
        let pool = inner.pool.read();
        pool.get(addr).filter(|conn| !conn.is_closed()).cloned()
    };
    if let Some(conn) = existing {
        return Ok(conn);
    }

    let conn = Connection::connect(addr, &inner.config.connection).await?;
    watch(inner, &conn);
    if inner.config.replica_policy != ReplicaPolicy::Never {
        if let Err(e) = conn.send(&Command::new("READONLY")).await {
            warn!("READONLY on {} failed: {}", addr, e);
        }
    }

    let winner = {
        let mut pool = inner.pool.write();
        if conn.is_closed() {
            return Err(Error::ConnectionClosed);
        }
        match pool.get(addr) {
            Some(current) if !current.is_closed() => Some(current.clone()),
            _ => {
                pool.insert(addr.to_string(), conn.clone());
                None
            }
        }
    };
    match winner {
        // A concurrent caller connected first
        Some(current) => {
            conn.close();
            Ok(current)
        }
        None => {
            debug!("Pooled connection to {}", addr);
            Ok(conn)
        }
    }
}

/// Install pool maintenance handlers on a new connection
fn watch(inner: &Arc<Inner>, conn: &Connection) {
    let address = conn.address().to_string();

    let weak = Arc::downgrade(inner);
    let addr = address.clone();
    conn.on_exception(move |err| {
        let Some(inner) = weak.upgrade() else {
            return;
        };
        warn!("Pooled connection to {} failed: {}", addr, err);
        forget(&inner, &addr);

        let observer = inner.on_exception.lock().clone();
        if let Some(observer) = observer {
            observer(err);
        }
        if !inner.closed.load(Ordering::Acquire) {
            tokio::spawn(async move {
                if let Err(e) = refresh(inner).await {
                    warn!("Slot refresh after connection failure failed: {}", e);
                }
            });
        }
    });

    let weak: Weak<Inner> = Arc::downgrade(inner);
    conn.on_end(move || {
        let Some(inner) = weak.upgrade() else {
            return;
        };
        if forget(&inner, &address) {
            let observer = inner.on_end.lock().clone();
            if let Some(observer) = observer {
                observer();
            }
        }
    });
}

/// Drop a terminated connection from the pool; returns true when the pool
/// is now empty
fn forget(inner: &Inner, addr: &str) -> bool {
    let mut pool = inner.pool.write();
    if pool.get(addr).is_some_and(Connection::is_closed) {
        pool.remove(addr);
    }
    pool.is_empty()
}

fn refresh(inner: Arc<Inner>) -> BoxFuture<'static, Result<()>> {
    async move {
        let _guard = inner.refresh_lock.lock().await;
        let mut excluded = HashSet::new();

        let table = loop {
            let Some((addr, conn)) = random_connection(&inner, &excluded) else {
                return Err(Error::NoConnectionAvailable);
            };
            let origin_host = split_address(&addr).map_or(addr.as_str(), |(host, _)| host);
            let loaded = conn
                .send(&Command::new("CLUSTER SLOTS"))
                .await
                .and_then(|reply| SlotTable::from_cluster_slots(&reply, origin_host));
            match loaded {
                Ok(table) => break table,
                Err(e) => {
                    warn!("CLUSTER SLOTS from {} failed: {}", addr, e);
                    excluded.insert(addr);
                }
            }
        };

        let observed: HashSet<String> = table.addresses().into_iter().map(String::from).collect();
        let missing: Vec<&String> = {
            let pool = inner.pool.read();
            observed
                .iter()
                .filter(|addr| pool.get(*addr).is_none_or(Connection::is_closed))
                .collect()
        };
        let connected = join_all(missing.iter().map(|addr| connect_node(&inner, addr))).await;
        for (addr, result) in missing.iter().zip(connected) {
            if let Err(e) = result {
                warn!("Failed to connect to cluster node {}: {}", addr, e);
            }
        }

        info!(
            "Slot table refreshed: {} shards, {} slots assigned",
            table.shards().len(),
            table.assigned_slots()
        );
        *inner.table.write() = Arc::new(table);

        // A cluster that reports no slots yet keeps its known nodes
        if observed.is_empty() {
            return Ok(());
        }
        let evicted: Vec<Connection> = {
            let mut pool = inner.pool.write();
            let stale: Vec<String> = pool
                .keys()
                .filter(|addr| !observed.contains(*addr))
                .cloned()
                .collect();
            stale.iter().filter_map(|addr| pool.remove(addr)).collect()
        };
        for conn in evicted {
            info!("Evicting {} (no longer in the slot table)", conn.address());
            conn.close();
        }

        Ok(())
    }
    .boxed()
}
