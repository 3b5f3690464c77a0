mod common;

use common::{FakeNode, dead_address, eventually, resp};
use ferrule_client::{Command, Error, Role, SentinelClient, SentinelConfig};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

const MASTER_NAME: &str = "mymaster";

/// Sentinel monitoring `MASTER_NAME`; `master: None` means it does not know
/// the group
async fn sentinel(master: Option<String>, replicas: Vec<String>) -> FakeNode {
    FakeNode::start(move |args| match args[0].as_str() {
        "PING" => resp::status("PONG"),
        "SUBSCRIBE" => resp::array(vec![
            resp::bulk("subscribe"),
            resp::bulk(&args[1]),
            resp::int(1),
        ]),
        "SENTINEL" => {
            let known = args.get(2).is_some_and(|name| name == MASTER_NAME);
            match args[1].to_ascii_lowercase().as_str() {
                "get-master-addr-by-name" => match (&master, known) {
                    (Some(addr), true) => {
                        let (host, port) = addr.rsplit_once(':').unwrap();
                        resp::array(vec![resp::bulk(host), resp::bulk(port)])
                    }
                    _ => resp::null_array(),
                },
                "slaves" if known => {
                    resp::array(replicas.iter().map(|addr| replica_entry(addr)).collect())
                }
                _ => resp::error("ERR No such master with that name"),
            }
        }
        other => resp::error(&format!("ERR unknown command '{}'", other)),
    })
    .await
}

fn replica_entry(addr: &str) -> Vec<u8> {
    let (host, port) = addr.rsplit_once(':').unwrap();
    resp::array(vec![
        resp::bulk("name"),
        resp::bulk(addr),
        resp::bulk("ip"),
        resp::bulk(host),
        resp::bulk("port"),
        resp::bulk(port),
        resp::bulk("flags"),
        resp::bulk("slave"),
    ])
}

async fn data_node() -> FakeNode {
    FakeNode::start(|args| match args[0].as_str() {
        "PING" => resp::status("PONG"),
        "SET" => resp::ok(),
        _ => resp::error("ERR unsupported"),
    })
    .await
}

fn switch_master_message() -> Vec<u8> {
    resp::array(vec![
        resp::bulk("message"),
        resp::bulk("+switch-master"),
        resp::bulk("mymaster 127.0.0.1 6379 127.0.0.1 6380"),
    ])
}

#[tokio::test]
async fn test_first_failing_endpoints_are_skipped_and_answerer_promoted() {
    let master = data_node().await;
    let unaware = sentinel(None, Vec::new()).await;
    let good = sentinel(Some(master.addr()), Vec::new()).await;
    let dead1 = dead_address().await;
    let dead2 = dead_address().await;

    let client = SentinelClient::new(SentinelConfig::new(
        [dead1.clone(), unaware.addr(), dead2.clone(), good.addr()],
        MASTER_NAME,
    ));

    let addr = client.resolve(MASTER_NAME, Role::Master).await.unwrap();
    assert_eq!(addr, master.addr());
    assert_eq!(
        client.endpoints(),
        vec![good.addr(), dead1, unaware.addr(), dead2]
    );

    // The promoted endpoint answers first from now on
    client.resolve(MASTER_NAME, Role::Master).await.unwrap();
    assert_eq!(unaware.count("SENTINEL"), 1);
    assert_eq!(good.count("SENTINEL"), 2);
}

#[tokio::test]
async fn test_open_master_returns_working_connection() {
    let master = data_node().await;
    let sentinel = sentinel(Some(master.addr()), Vec::new()).await;
    let client = SentinelClient::new(SentinelConfig::new([sentinel.addr()], MASTER_NAME));

    let conn = client.open(MASTER_NAME, Role::Master).await.unwrap();
    assert_eq!(conn.address(), master.addr());

    let reply = conn
        .send(&Command::new("SET").key("foo").arg("bar"))
        .await
        .unwrap();
    assert_eq!(reply.as_status(), Some("OK"));
    assert_eq!(master.count("SET"), 1);
    assert_eq!(sentinel.count("SUBSCRIBE"), 1);
}

#[tokio::test]
async fn test_connect_uses_configured_role() {
    let master = data_node().await;
    let replica = data_node().await;
    let sentinel = sentinel(Some(master.addr()), vec![replica.addr()]).await;
    let client = SentinelClient::new(
        SentinelConfig::new([sentinel.addr()], MASTER_NAME).with_role(Role::Replica),
    );

    let conn = client.connect().await.unwrap();
    assert_eq!(conn.address(), replica.addr());
}

#[tokio::test]
async fn test_replica_is_chosen_among_reported_replicas() {
    let master = data_node().await;
    let r1 = data_node().await;
    let r2 = data_node().await;
    let sentinel = sentinel(Some(master.addr()), vec![r1.addr(), r2.addr()]).await;
    let client = SentinelClient::new(SentinelConfig::new([sentinel.addr()], MASTER_NAME));

    let mut seen = std::collections::HashSet::new();
    for _ in 0..40 {
        let addr = client.resolve(MASTER_NAME, Role::Replica).await.unwrap();
        assert!(addr == r1.addr() || addr == r2.addr(), "unexpected {}", addr);
        seen.insert(addr);
    }
    assert_eq!(seen.len(), 2);

    let conn = client.open(MASTER_NAME, Role::Replica).await.unwrap();
    assert!(conn.address() == r1.addr() || conn.address() == r2.addr());
}

#[tokio::test]
async fn test_no_replicas_fails_resolution() {
    let master = data_node().await;
    let sentinel = sentinel(Some(master.addr()), Vec::new()).await;
    let client = SentinelClient::new(SentinelConfig::new([sentinel.addr()], MASTER_NAME));

    let err = client.resolve(MASTER_NAME, Role::Replica).await.unwrap_err();
    assert!(matches!(err, Error::NoEndpointsAvailable));
}

#[tokio::test]
async fn test_sentinel_role_resolves_to_endpoint() {
    let sentinel = sentinel(None, Vec::new()).await;
    let dead = dead_address().await;
    let client = SentinelClient::new(SentinelConfig::new(
        [dead.clone(), sentinel.addr()],
        MASTER_NAME,
    ));

    let addr = client.resolve(MASTER_NAME, Role::Sentinel).await.unwrap();
    assert_eq!(addr, sentinel.addr());
    assert_eq!(client.endpoints(), vec![sentinel.addr(), dead]);
}

#[tokio::test]
async fn test_all_endpoints_failing() {
    let client = SentinelClient::new(SentinelConfig::new(
        [dead_address().await, dead_address().await],
        MASTER_NAME,
    ));
    let err = client.open(MASTER_NAME, Role::Master).await.unwrap_err();
    assert!(matches!(err, Error::NoEndpointsAvailable));
}

#[tokio::test]
async fn test_switch_master_fires_failover_observer() {
    let master = data_node().await;
    let sentinel = sentinel(Some(master.addr()), Vec::new()).await;
    let client = SentinelClient::new(SentinelConfig::new([sentinel.addr()], MASTER_NAME));

    let failovers = Arc::new(AtomicUsize::new(0));
    {
        let failovers = Arc::clone(&failovers);
        client.on_failover(move || {
            failovers.fetch_add(1, Ordering::SeqCst);
        });
    }
    client.open(MASTER_NAME, Role::Master).await.unwrap();

    sentinel.push(switch_master_message());
    eventually(|| failovers.load(Ordering::SeqCst) == 1).await;

    // Other pub/sub traffic is ignored
    sentinel.push(resp::array(vec![resp::bulk("pong"), resp::bulk("")]));
    sentinel.push(switch_master_message());
    eventually(|| failovers.load(Ordering::SeqCst) == 2).await;
}

#[tokio::test]
async fn test_notification_connection_is_shared() {
    let master = data_node().await;
    let sentinel = sentinel(Some(master.addr()), Vec::new()).await;
    let client = SentinelClient::new(SentinelConfig::new([sentinel.addr()], MASTER_NAME));

    let (first, second) = tokio::join!(
        client.open(MASTER_NAME, Role::Master),
        client.open(MASTER_NAME, Role::Master)
    );
    first.unwrap();
    second.unwrap();
    client.open(MASTER_NAME, Role::Master).await.unwrap();

    assert_eq!(sentinel.count("SUBSCRIBE"), 1);
}

#[tokio::test]
async fn test_ended_notification_connection_is_recreated() {
    let master = data_node().await;
    let first = sentinel(Some(master.addr()), Vec::new()).await;
    let second = sentinel(Some(master.addr()), Vec::new()).await;
    let client = SentinelClient::new(SentinelConfig::new(
        [first.addr(), second.addr()],
        MASTER_NAME,
    ));

    client.open(MASTER_NAME, Role::Master).await.unwrap();
    assert_eq!(first.count("SUBSCRIBE"), 1);

    first.shutdown();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while second.count("SUBSCRIBE") == 0 {
        assert!(tokio::time::Instant::now() < deadline, "never resubscribed");
        tokio::time::sleep(Duration::from_millis(10)).await;
        client.open(MASTER_NAME, Role::Master).await.unwrap();
    }
    assert_eq!(client.endpoints()[0], second.addr());
}

#[tokio::test]
async fn test_close_drops_notification_connection() {
    let master = data_node().await;
    let sentinel = sentinel(Some(master.addr()), Vec::new()).await;
    let client = SentinelClient::new(SentinelConfig::new([sentinel.addr()], MASTER_NAME));

    client.open(MASTER_NAME, Role::Master).await.unwrap();
    client.close();
    client.open(MASTER_NAME, Role::Master).await.unwrap();

    assert_eq!(sentinel.count("SUBSCRIBE"), 2);
}
