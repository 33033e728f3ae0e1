//! Runs a primary and its secondaries in one process behind a small shell.
//!
//! Persistence is in-memory but deliberately unreliable (`--failure-rate`),
//! so the retry loop and the operation deadline are visible in the logs.
//! Membership is driven by hand with `JOIN` and `LEAVE`.
//!
//! ```bash
//! RUST_LOG=kv_replication=debug cargo run --bin kv-node -- --secondaries 2 --failure-rate 0.3
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, ValueHint};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::select;
use tracing::warn;

use kv_replication::persistence::{FlakyPersistence, MemoryPersistence};
use kv_replication::protocol::{ConsoleCommand, HELP};
use kv_replication::replicator::LocalCluster;
use kv_replication::runtime::{PrimaryHandle, SecondaryHandle, spawn_primary, spawn_secondary};
use kv_replication::{ClientReply, CoordinatorConfig, NodeId};

const PRIMARY_ID: NodeId = 1;

#[derive(Parser, Debug)]
#[command(author, version, about = "Run a replicated key-value cluster in one process")]
struct Args {
    /// Number of secondaries to start with (node ids 2, 3, ...)
    #[arg(long, default_value_t = 2)]
    secondaries: u64,

    /// JSON file with `operation_timeout_ms` and `retry_tick_ms`
    #[arg(long, value_hint = ValueHint::FilePath)]
    config: Option<PathBuf>,

    /// Overrides the operation timeout from the config file
    #[arg(long)]
    operation_timeout_ms: Option<u64>,

    /// Overrides the persistence retry tick from the config file
    #[arg(long)]
    retry_tick_ms: Option<u64>,

    /// Fraction of persistence writes that fail, between 0.0 and 1.0
    #[arg(long, default_value_t = 0.2)]
    failure_rate: f64,
}

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

fn load_config(args: &Args) -> Result<CoordinatorConfig> {
    let mut config = match &args.config {
        Some(path) => CoordinatorConfig::load(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => CoordinatorConfig::default(),
    };
    if let Some(ms) = args.operation_timeout_ms {
        config.operation_timeout = Duration::from_millis(ms);
    }
    if let Some(ms) = args.retry_tick_ms {
        config.retry_tick = Duration::from_millis(ms);
    }
    config.validate()?;
    Ok(config)
}

/// Every node gets its own durable map; restarts of its gateway reuse it.
fn flaky_backend(failure_rate: f64) -> impl FnMut() -> FlakyPersistence<MemoryPersistence> + Send {
    let durable = MemoryPersistence::new();
    move || FlakyPersistence::new(durable.clone(), failure_rate)
}

struct Cluster {
    config: CoordinatorConfig,
    failure_rate: f64,
    connector: LocalCluster,
    primary: PrimaryHandle,
    secondaries: BTreeMap<NodeId, SecondaryHandle>,
    members: BTreeSet<NodeId>,
}

impl Cluster {
    fn start(config: CoordinatorConfig, failure_rate: f64, secondaries: u64) -> Result<Self> {
        let connector = LocalCluster::new();
        let primary = spawn_primary(
            PRIMARY_ID,
            config,
            flaky_backend(failure_rate),
            Arc::new(connector.clone()),
        )?;
        let mut cluster = Self {
            config,
            failure_rate,
            connector,
            primary,
            secondaries: BTreeMap::new(),
            members: BTreeSet::new(),
        };
        for replica in (PRIMARY_ID + 1)..=(PRIMARY_ID + secondaries) {
            cluster.start_secondary(replica)?;
        }
        cluster
            .primary
            .replica_set_changed(cluster.members.iter().copied())?;
        Ok(cluster)
    }

    /// Always starts a fresh secondary: sequence numbers are per replicator,
    /// so a node that left cannot resume where it stopped.
    fn start_secondary(&mut self, replica: NodeId) -> Result<()> {
        if let Some(old) = self.secondaries.remove(&replica) {
            let _ = old.shutdown();
        }
        let handle = spawn_secondary(replica, self.config, flaky_backend(self.failure_rate))?;
        self.connector.register(replica, handle.link());
        self.secondaries.insert(replica, handle);
        self.members.insert(replica);
        Ok(())
    }

    fn join(&mut self, replica: NodeId) -> Result<()> {
        if replica == PRIMARY_ID {
            bail!("node {PRIMARY_ID} is the primary");
        }
        if self.members.contains(&replica) {
            bail!("node {replica} is already a secondary");
        }
        self.start_secondary(replica)?;
        self.primary.replica_set_changed(self.members.iter().copied())?;
        Ok(())
    }

    fn leave(&mut self, replica: NodeId) -> Result<()> {
        if !self.members.remove(&replica) {
            bail!("node {replica} is not a secondary");
        }
        self.connector.unregister(replica);
        self.primary.replica_set_changed(self.members.iter().copied())?;
        Ok(())
    }

    /// Runs one console command. Returns `false` when the shell should exit.
    async fn execute(&mut self, command: ConsoleCommand) -> Result<bool> {
        match command {
            ConsoleCommand::Insert { key, value } => {
                print_reply(self.primary.insert(key, value).await?)
            }
            ConsoleCommand::Remove { key } => print_reply(self.primary.remove(key).await?),
            ConsoleCommand::Get { key } => match self.primary.get(key.clone()).await? {
                Some(value) => println!("{key} = {value}"),
                None => println!("{key} is not set"),
            },
            ConsoleCommand::Join { replica } => {
                self.join(replica)?;
                println!("node {replica} joined");
            }
            ConsoleCommand::Leave { replica } => {
                self.leave(replica)?;
                println!("node {replica} left");
            }
            ConsoleCommand::Status => self.print_status().await?,
            ConsoleCommand::Help => println!("{HELP}"),
            ConsoleCommand::Exit => return Ok(false),
        }
        Ok(true)
    }

    async fn print_status(&self) -> Result<()> {
        let status = self.primary.status().await?;
        println!(
            "primary {}: replicas={:?} pending_persist={} pending_replication={} timers={} store={:?}",
            status.node_id,
            status.replicas,
            status.pending_persist,
            status.pending_replication,
            status.live_timers,
            status.store
        );
        for secondary in self.secondaries.values() {
            let status = secondary.status().await?;
            let marker = if self.members.contains(&status.node_id) {
                ""
            } else {
                " (left)"
            };
            println!(
                "secondary {}{marker}: next_seq={} store={:?}",
                status.node_id, status.next_expected_seq, status.store
            );
        }
        Ok(())
    }

    fn shutdown(&self) {
        let _ = self.primary.shutdown();
        for secondary in self.secondaries.values() {
            let _ = secondary.shutdown();
        }
    }
}

fn print_reply(reply: ClientReply) {
    match reply {
        ClientReply::Ack { id } => println!("ok (op {id})"),
        ClientReply::Failed { id } => println!("failed (op {id}): not durable and replicated in time"),
        ClientReply::GetResult { key, value, .. } => println!("{key} = {value:?}"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let args = Args::parse();
    let config = load_config(&args)?;
    let mut cluster = Cluster::start(config, args.failure_rate, args.secondaries)?;
    println!(
        "Primary {PRIMARY_ID} ready with secondaries {:?}.\n{HELP}",
        cluster.members
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                if line.trim().is_empty() {
                    continue;
                }
                let keep_going = match ConsoleCommand::parse(&line) {
                    Ok(command) => match cluster.execute(command).await {
                        Ok(keep_going) => keep_going,
                        Err(err) => {
                            println!("error: {err}");
                            true
                        }
                    },
                    Err(err) => {
                        println!("error: {err}");
                        true
                    }
                };
                if !keep_going {
                    break;
                }
            }
            ctrl_c = tokio::signal::ctrl_c() => {
                if let Err(err) = ctrl_c {
                    warn!(error = ?err, "failed to install ctrl-c handler");
                }
                break;
            }
        }
    }

    cluster.shutdown();
    Ok(())
}
