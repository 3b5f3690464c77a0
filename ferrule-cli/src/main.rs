use anyhow::{Context, Result, anyhow};
use clap::{ArgAction, Parser, ValueEnum};
use colored::Colorize;
use ferrule_client::config::join_address;
use ferrule_client::{
    ClusterClient, ClusterConfig, Command, Connection, ConnectionConfig, DirectClient, Reply,
    ReplicaPolicy, Role, SentinelClient, SentinelConfig,
};
use rustyline::DefaultEditor;
use rustyline::error::ReadlineError;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{error, info, warn};

/// Commands whose first argument is not a key; kept sorted for binary search
const KEYLESS_COMMANDS: &[&str] = &[
    "ASKING",
    "AUTH",
    "BGREWRITEAOF",
    "BGSAVE",
    "CLIENT",
    "CLUSTER",
    "COMMAND",
    "CONFIG",
    "DBSIZE",
    "DEBUG",
    "DISCARD",
    "ECHO",
    "EVAL",
    "EVALSHA",
    "EXEC",
    "FLUSHALL",
    "FLUSHDB",
    "HELLO",
    "INFO",
    "KEYS",
    "LASTSAVE",
    "LATENCY",
    "MEMORY",
    "MONITOR",
    "MULTI",
    "PING",
    "PSUBSCRIBE",
    "PUBLISH",
    "PUNSUBSCRIBE",
    "QUIT",
    "RANDOMKEY",
    "READONLY",
    "READWRITE",
    "ROLE",
    "SAVE",
    "SCAN",
    "SCRIPT",
    "SELECT",
    "SENTINEL",
    "SHUTDOWN",
    "SLOWLOG",
    "SUBSCRIBE",
    "TIME",
    "UNSUBSCRIBE",
    "UNWATCH",
    "WAIT",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
enum Mode {
    #[default]
    Direct,
    Cluster,
    Sentinel,
}

#[derive(Parser, Debug)]
#[command(name = "ferrule-cli")]
#[command(about = "Ferrule CLI - redis-cli style front end for nodes, clusters and sentinels", long_about = None)]
#[command(disable_help_flag = true)]
struct Args {
    /// Print help
    #[arg(long, action = ArgAction::Help)]
    help: Option<bool>,

    /// Topology to connect to
    #[arg(long, value_enum)]
    mode: Option<Mode>,

    /// Server host (direct mode)
    #[arg(short = 'h', long)]
    host: Option<String>,

    /// Server port (direct mode)
    #[arg(short = 'p', long)]
    port: Option<u16>,

    /// Comma separated seed nodes (cluster mode)
    #[arg(long, value_delimiter = ',')]
    seeds: Vec<String>,

    /// Comma separated sentinel endpoints (sentinel mode)
    #[arg(long, value_delimiter = ',')]
    sentinels: Vec<String>,

    /// Monitored master group (sentinel mode)
    #[arg(long)]
    master_name: Option<String>,

    /// Role to connect to: master, replica or sentinel (sentinel mode)
    #[arg(long)]
    role: Option<Role>,

    /// Where read-only commands go: never, always or share (cluster mode)
    #[arg(long)]
    replicas: Option<ReplicaPolicy>,

    /// YAML configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Command to execute (if not in interactive mode)
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    command: Vec<String>,
}

/// Settings read from `--config`, then overridden by flags
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
struct CliConfig {
    mode: Mode,
    host: String,
    port: u16,
    connection: ConnectionConfig,
    cluster: ClusterConfig,
    sentinel: SentinelConfig,
    log_level: String,
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            mode: Mode::Direct,
            host: "127.0.0.1".to_string(),
            port: 6379,
            connection: ConnectionConfig::default(),
            cluster: ClusterConfig::default(),
            sentinel: SentinelConfig::default(),
            log_level: "info,ferrule_client=warn".to_string(),
        }
    }
}

impl CliConfig {
    fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))
    }

    fn apply(mut self, args: &Args) -> Self {
        if let Some(host) = &args.host {
            self.host = host.clone();
        }
        if let Some(port) = args.port {
            self.port = port;
        }
        if !args.seeds.is_empty() {
            self.cluster.seeds = args.seeds.clone();
            self.mode = Mode::Cluster;
        }
        if let Some(policy) = args.replicas {
            self.cluster.replica_policy = policy;
        }
        if !args.sentinels.is_empty() {
            self.sentinel.endpoints = args.sentinels.clone();
            self.mode = Mode::Sentinel;
        }
        if let Some(name) = &args.master_name {
            self.sentinel.master_name = name.clone();
        }
        if let Some(role) = args.role {
            self.sentinel.role = role;
        }
        if let Some(mode) = args.mode {
            self.mode = mode;
        }
        self
    }
}

enum Target {
    Direct(DirectClient),
    Cluster(ClusterClient),
    Sentinel {
        resolver: SentinelClient,
        connection: Connection,
    },
}

impl Target {
    async fn open(config: &CliConfig) -> Result<Self> {
        match config.mode {
            Mode::Direct => {
                let addr = join_address(&config.host, config.port);
                let client = DirectClient::connect(&addr, config.connection.clone())
                    .await
                    .with_context(|| format!("Failed to connect to {}", addr))?;
                Ok(Target::Direct(client))
            }
            Mode::Cluster => {
                let cluster = ClusterClient::open(config.cluster.clone())
                    .await
                    .context("Failed to open cluster")?;
                cluster.on_end(|| warn!("All cluster connections ended"));
                Ok(Target::Cluster(cluster))
            }
            Mode::Sentinel => {
                config
                    .sentinel
                    .validate()
                    .context("Invalid sentinel configuration")?;
                let resolver = SentinelClient::new(config.sentinel.clone());
                resolver.on_failover(|| warn!("Master switched; restart to follow the new master"));
                let connection = resolver.connect().await.with_context(|| {
                    format!(
                        "Failed to resolve {} of {}",
                        config.sentinel.role, config.sentinel.master_name
                    )
                })?;
                Ok(Target::Sentinel {
                    resolver,
                    connection,
                })
            }
        }
    }

    async fn send(&self, command: &Command) -> ferrule_client::Result<Reply> {
        match self {
            Target::Direct(client) => client.send(command).await,
            Target::Cluster(cluster) => cluster.send(command).await,
            Target::Sentinel { connection, .. } => connection.send(command).await,
        }
    }

    fn describe(&self) -> String {
        match self {
            Target::Direct(client) => client.connection().address().to_string(),
            Target::Cluster(cluster) => format!("cluster[{}]", cluster.nodes().len()),
            Target::Sentinel { connection, .. } => connection.address().to_string(),
        }
    }

    fn close(&self) {
        match self {
            Target::Direct(client) => client.close(),
            Target::Cluster(cluster) => cluster.close(),
            Target::Sentinel {
                resolver,
                connection,
            } => {
                connection.close();
                resolver.close();
            }
        }
    }
}

fn is_keyless(name: &str) -> bool {
    KEYLESS_COMMANDS
        .binary_search(&name.to_ascii_uppercase().as_str())
        .is_ok()
}

/// Build a command from tokens; the first argument is the routing key
/// unless the command takes none
fn build_command(tokens: &[String]) -> Result<Command> {
    let (name, rest) = tokens.split_first().ok_or_else(|| anyhow!("Empty command"))?;
    let keyed = !is_keyless(name);
    let mut command = Command::new(name);
    for (i, token) in rest.iter().enumerate() {
        command = if i == 0 && keyed {
            command.key(token)
        } else {
            command.arg(token.as_str())
        };
    }
    Ok(command)
}

/// Split a command line on whitespace; single and double quotes group,
/// and double quotes understand `\n`, `\r`, `\t` and `\<char>`
fn tokenize(line: &str) -> Result<Vec<String>> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_token = false;
    let mut chars = line.chars();

    while let Some(c) = chars.next() {
        match c {
            '"' | '\'' => {
                in_token = true;
                loop {
                    match chars.next() {
                        Some(q) if q == c => break,
                        Some('\\') if c == '"' => match chars.next() {
                            Some('n') => current.push('\n'),
                            Some('r') => current.push('\r'),
                            Some('t') => current.push('\t'),
                            Some(other) => current.push(other),
                            None => return Err(anyhow!("Unterminated quote")),
                        },
                        Some(other) => current.push(other),
                        None => return Err(anyhow!("Unterminated quote")),
                    }
                }
            }
            c if c.is_whitespace() => {
                if in_token {
                    tokens.push(std::mem::take(&mut current));
                    in_token = false;
                }
            }
            c => {
                current.push(c);
                in_token = true;
            }
        }
    }
    if in_token {
        tokens.push(current);
    }
    Ok(tokens)
}

fn format_reply(reply: &Reply) -> String {
    match reply {
        Reply::Status(s) => s.green().to_string(),
        Reply::Error(s) => format!("(error) {}", s).red().to_string(),
        Reply::Integer(n) => format!("(integer) {}", n),
        Reply::Bulk(None) | Reply::MultiBulk(None) => "(nil)".dimmed().to_string(),
        Reply::Bulk(Some(data)) => format!("{:?}", String::from_utf8_lossy(data)),
        Reply::MultiBulk(Some(items)) if items.is_empty() => {
            "(empty array)".dimmed().to_string()
        }
        Reply::MultiBulk(Some(items)) => {
            let width = items.len().to_string().len();
            items
                .iter()
                .enumerate()
                .map(|(i, item)| {
                    let prefix = format!("{:>width$}) ", i + 1, width = width);
                    let indent = " ".repeat(prefix.len());
                    format_reply(item)
                        .lines()
                        .enumerate()
                        .map(|(j, line)| {
                            let lead = if j == 0 { prefix.as_str() } else { indent.as_str() };
                            format!("{}{}", lead, line)
                        })
                        .collect::<Vec<_>>()
                        .join("\n")
                })
                .collect::<Vec<_>>()
                .join("\n")
        }
    }
}

async fn execute(target: &Target, tokens: &[String]) -> Result<String> {
    let command = build_command(tokens)?;
    let start = Instant::now();

    let output = match target.send(&command).await {
        Ok(reply) => format_reply(&reply),
        Err(e) => match e.reply_text().map(str::to_string) {
            Some(text) => format!("(error) {}", text).red().to_string(),
            None => return Err(anyhow::Error::new(e).context("Command failed")),
        },
    };

    let elapsed = start.elapsed();
    Ok(format!(
        "{}\n{}",
        output,
        format!("({:.2?})", elapsed).dimmed()
    ))
}

fn help_text() -> String {
    format!(
        r#"{}

{}
  Any server command is sent as typed, e.g.
  SET key value              Set key to hold string value
  GET key                    Get the value of key
  CLUSTER SLOTS              Show the slot map (cluster mode)

{}
  Arguments separated by whitespace; "double" or 'single' quotes group words.
  The first argument is the routing key unless the command takes none.

{}
  HELP                       Show this help message
  QUIT                       Exit the CLI
"#,
        "Ferrule CLI - Usage".bold().cyan(),
        "Commands:".bold(),
        "Quoting:".bold(),
        "Local Commands:".bold(),
    )
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = match &args.config {
        Some(path) => CliConfig::load(path)?,
        None => CliConfig::default(),
    }
    .apply(&args);

    // RUST_LOG wins over the configured level
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level));
    tracing_subscriber::fmt()
        .with_writer(std::io::stdout)
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_thread_names(false)
        .with_file(false)
        .with_line_number(false)
        .init();

    let target = Target::open(&config).await?;

    if !args.command.is_empty() {
        // Command mode: execute single command and exit
        let result = execute(&target, &args.command).await;
        target.close();
        match result {
            Ok(output) => {
                info!("{}", output);
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "{}", format!("Error: {:#}", e).red());
                std::process::exit(1);
            }
        }
    } else {
        let result = run_interactive(&target).await;
        target.close();
        result
    }
}

async fn run_interactive(target: &Target) -> Result<()> {
    info!(
        "{}",
        format!("Ferrule CLI v{}", env!("CARGO_PKG_VERSION"))
            .bold()
            .cyan()
    );
    info!("Connected to {}", target.describe());
    info!("Type {} for available commands\n", "HELP".bold());

    let mut rl = DefaultEditor::new()?;

    loop {
        let prompt = format!("{}> ", format!("ferrule {}", target.describe()).green());
        match rl.readline(&prompt) {
            Ok(line) => {
                if line.trim().is_empty() {
                    continue;
                }
                rl.add_history_entry(&line)?;

                let tokens = match tokenize(&line) {
                    Ok(tokens) if !tokens.is_empty() => tokens,
                    Ok(_) => continue,
                    Err(e) => {
                        error!("{}", format!("Error: {}", e).red());
                        continue;
                    }
                };

                match tokens[0].to_ascii_uppercase().as_str() {
                    "QUIT" | "EXIT" => {
                        info!("Goodbye!");
                        break;
                    }
                    "HELP" => info!("{}", help_text()),
                    _ => match execute(target, &tokens).await {
                        Ok(output) => info!("{}", output),
                        Err(e) => {
                            error!(error = %e, "{}", format!("Error: {:#}", e).red());
                        }
                    },
                }
            }
            Err(ReadlineError::Interrupted) => {
                info!("^C");
                continue;
            }
            Err(ReadlineError::Eof) => {
                info!("Goodbye!");
                break;
            }
            Err(err) => {
                error!(error = ?err, "Readline error: {:?}", err);
                break;
            }
        }
    }

    Ok(())
}
