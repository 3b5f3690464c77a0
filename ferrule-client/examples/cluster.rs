//! Cluster Example
//!
//! This example demonstrates slot routing and replica reads on a cluster.
//!
//! Usage:
//!   cargo run --example cluster -- [seed ...]

use ferrule_client::{ClusterClient, ClusterConfig, Command, ReplicaPolicy, hash_slot};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt::init();

    let mut seeds: Vec<String> = std::env::args().skip(1).collect();
    if seeds.is_empty() {
        seeds = vec![
            "127.0.0.1:7000".to_string(),
            "127.0.0.1:7001".to_string(),
            "127.0.0.1:7002".to_string(),
        ];
    }

    let config = ClusterConfig::new(seeds).with_replica_policy(ReplicaPolicy::Share);
    let cluster = ClusterClient::open(config).await?;

    println!("🚀 Ferrule - Cluster Example\n");

    // 1. Topology
    let table = cluster.slot_table();
    println!("1. Cluster nodes");
    for (i, shard) in table.shards().iter().enumerate() {
        println!("   shard {}: {}", i, shard.join(", "));
    }
    println!("   {} of 16384 slots assigned\n", table.assigned_slots());

    // 2. Keys land on the shard owning their slot
    println!("2. Writing keys across shards");
    for key in ["user:1", "user:2", "{user}:profile", "{user}:settings"] {
        cluster
            .send(&Command::new("SET").key(key).arg("value"))
            .await?;
        println!("   {} -> slot {}", key, hash_slot(key.as_bytes()));
    }
    println!();

    // 3. Reads may be served by replicas
    println!("3. Reading back (replica policy: share)");
    let reply = cluster.send(&Command::new("GET").key("user:1")).await?;
    println!("   user:1 = {}\n", reply);

    cluster.close();
    println!("✅ Example completed successfully!");

    Ok(())
}
