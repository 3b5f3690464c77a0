//! Single Node Example
//!
//! This example demonstrates pipelined commands over one connection.
//!
//! Usage:
//!   cargo run --example direct -- [host:port]

use ferrule_client::{Command, ConnectionConfig, DirectClient};
use futures::future::try_join_all;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt::init();

    let addr = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "127.0.0.1:6379".to_string());
    let client = DirectClient::connect(&addr, ConnectionConfig::default()).await?;

    println!("🚀 Ferrule - Single Node Example ({})\n", addr);

    // 1. SET then GET
    println!("1. Setting key 'greeting' = 'Hello, Ferrule!'");
    let reply = client
        .send(&Command::new("SET").key("greeting").arg("Hello, Ferrule!"))
        .await?;
    println!("   {}", reply);

    println!("2. Getting key 'greeting'");
    let reply = client.send(&Command::new("GET").key("greeting")).await?;
    println!("   {}\n", reply);

    // 2. Pipelining: every command is written before any reply arrives
    println!("3. Pipelining 100 INCR commands");
    let commands: Vec<Command> = (0..100).map(|_| Command::new("INCR").key("counter")).collect();
    let replies = try_join_all(commands.iter().map(|cmd| client.send(cmd))).await?;
    if let Some(last) = replies.last() {
        println!("   Last reply: {}\n", last);
    }

    // 3. Missing keys are null, not empty
    println!("4. Getting a missing key");
    let reply = client.send(&Command::new("GET").key("does-not-exist")).await?;
    println!("   {} (null: {})\n", reply, reply.is_null());

    // 4. Server errors keep their text
    println!("5. Sending an unknown command");
    if let Err(e) = client.send(&Command::new("NOSUCHCOMMAND")).await {
        println!("   {}\n", e);
    }

    client.close();
    println!("✅ Example completed successfully!");

    Ok(())
}
