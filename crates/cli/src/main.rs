use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use ktm_core::{ClusterSnapshot, Record, Resource};
use ktm_kubehub::{Recorder, RecorderConfig};
use ktm_persist::HistoryStore;
use ktm_query::{cutoff, Reconciler, TimeMachine};
use tokio::signal;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "ktmctl", version, about = "Kubernetes time machine: record and query pod/node history")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// History database file (default: $KTM_DB_PATH, else ~/.ktm/history.db)
    #[arg(long = "db", global = true)]
    db: Option<PathBuf>,

    /// Cluster id used for snapshots
    #[arg(long = "cluster", env = "KTM_CLUSTER", global = true, default_value = "default")]
    cluster: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output {
    Human,
    Json,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Kind {
    Pod,
    Node,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Watch pods and nodes in the current context and record their history
    Record {
        /// Seconds between cluster snapshots
        #[arg(long = "snapshot-secs", env = "KTM_SNAPSHOT_SECS", default_value_t = 300)]
        snapshot_secs: u64,
    },
    /// Latest record per pod within a window
    Pods {
        /// Window, e.g. "30m" or "2h45m"
        #[arg(long = "since")]
        since: String,
    },
    /// Latest record per node within a window
    Nodes {
        #[arg(long = "since")]
        since: String,
    },
    /// One entity's records within a window, oldest first
    History {
        name: String,
        #[arg(long = "since")]
        since: String,
        #[arg(long = "kind", value_enum, default_value_t = Kind::Pod)]
        kind: Kind,
    },
    /// Reconstruct the cluster from the newest snapshot plus later events
    Reconcile {
        #[arg(long = "since", default_value = "1h")]
        since: String,
        /// Replay node events too
        #[arg(long = "nodes", action = ArgAction::SetTrue)]
        nodes: bool,
    },
    /// Cluster ids that have snapshots
    Clusters,
}

fn init_tracing() {
    let env = std::env::var("KTM_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("KTM_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid KTM_METRICS_ADDR; expected host:port");
        }
    }
}

fn open_store(db: Option<&PathBuf>) -> Result<Arc<HistoryStore>> {
    let store = match db {
        Some(path) => HistoryStore::open(path),
        None => HistoryStore::open_default(),
    }
    .context("opening history store")?;
    info!(path = %store.path().display(), "history store open");
    Ok(Arc::new(store))
}

/// Parse the query window, then open the store; a bad window never touches disk.
fn open_for_window(db: Option<&PathBuf>, window: &str) -> Result<(Arc<HistoryStore>, DateTime<Utc>)> {
    let cut = cutoff(window)?;
    Ok((open_store(db)?, cut))
}

fn fmt_time(t: Option<DateTime<Utc>>) -> String {
    t.map(|t| t.to_rfc3339_opts(SecondsFormat::Secs, true)).unwrap_or_else(|| "-".to_string())
}

fn print_records<R: Resource>(records: &[Record<R>], output: Output) -> Result<()> {
    match output {
        Output::Json => println!("{}", serde_json::to_string_pretty(records)?),
        Output::Human => {
            println!("{:<40} {:<20} {:<8} TIME", "NAME", "NAMESPACE", "EVENT");
            for r in records {
                let meta = r.resource.meta();
                println!(
                    "{:<40} {:<20} {:<8} {}",
                    r.name().unwrap_or("-"),
                    meta.namespace.as_deref().unwrap_or("-"),
                    r.kind().map(|k| k.as_str()).unwrap_or("-"),
                    fmt_time(r.resolve_timestamp()),
                );
            }
        }
    }
    Ok(())
}

fn print_snapshot(snap: &ClusterSnapshot, output: Output) -> Result<()> {
    match output {
        Output::Json => println!("{}", serde_json::to_string_pretty(snap)?),
        Output::Human => {
            println!("cluster {} as of {}", snap.cluster_id, fmt_time(Some(snap.taken_at)));
            println!();
            println!("{:<40} {:<20} {:<20} PHASE", "POD", "NAMESPACE", "NODE");
            for p in &snap.pods {
                println!(
                    "{:<40} {:<20} {:<20} {}",
                    p.metadata.name.as_deref().unwrap_or("-"),
                    p.metadata.namespace.as_deref().unwrap_or("-"),
                    p.spec.as_ref().and_then(|s| s.node_name.as_deref()).unwrap_or("-"),
                    p.status.as_ref().and_then(|s| s.phase.as_deref()).unwrap_or("-"),
                );
            }
            println!();
            println!("{:<40} CREATED", "NODE");
            for n in &snap.nodes {
                println!("{:<40} {}", n.metadata.name.as_deref().unwrap_or("-"), fmt_time(n.created_at()));
            }
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    let db = cli.db.as_ref();

    match cli.command {
        Commands::Record { snapshot_secs } => {
            let store = open_store(db)?;
            let client = ktm_kubehub::connect().await?;
            let cfg = RecorderConfig {
                cluster_id: cli.cluster.clone(),
                snapshot_every: Duration::from_secs(snapshot_secs.max(1)),
            };
            let recorder = Recorder::new(store, cfg);
            recorder
                .run(client, async {
                    if let Err(e) = signal::ctrl_c().await {
                        tracing::warn!(error = %e, "ctrl-c handler failed");
                    }
                })
                .await?;
        }
        Commands::Pods { since } => {
            let (store, cut) = open_for_window(db, &since)?;
            print_records(&TimeMachine::new(store).pods_since(cut)?, cli.output)?;
        }
        Commands::Nodes { since } => {
            let (store, cut) = open_for_window(db, &since)?;
            print_records(&TimeMachine::new(store).nodes_since(cut)?, cli.output)?;
        }
        Commands::History { name, since, kind } => {
            let (store, cut) = open_for_window(db, &since)?;
            let tm = TimeMachine::new(store);
            match kind {
                Kind::Pod => print_records(&tm.pod_history(&name, cut)?, cli.output)?,
                Kind::Node => print_records(&tm.node_history(&name, cut)?, cli.output)?,
            }
        }
        Commands::Reconcile { since, nodes } => {
            let (store, cut) = open_for_window(db, &since)?;
            let tm = TimeMachine::new(store).with_reconciler(Reconciler::new().replay_nodes(nodes));
            print_snapshot(&tm.reconcile(&cli.cluster, cut)?, cli.output)?;
        }
        Commands::Clusters => {
            let ids = open_store(db)?.clusters()?;
            match cli.output {
                Output::Json => println!("{}", serde_json::to_string_pretty(&ids)?),
                Output::Human => ids.iter().for_each(|id| println!("{id}")),
            }
        }
    }

    Ok(())
}
