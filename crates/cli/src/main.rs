use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use metrics::counter;
use serde::Deserialize;
use serde_json::Value as Json;
use spindle_deploy::{Account, Accounts, DeployRequest, Deployer};
use spindle_kubehub::{DiscoveryCache, KubeCluster, Propagation};
use spindle_persist::SqliteAuditStore;
use spindle_status::StatusRegistry;
use tokio::signal;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "spindlectl", version, about = "Spindle deploy pipeline CLI")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Account to act as
    #[arg(long, global = true, env = "SPINDLE_ACCOUNT", default_value = "default")]
    account: String,

    /// Accounts file (YAML); without it the ambient kube config is used
    #[arg(long, global = true, env = "SPINDLE_ACCOUNTS")]
    accounts: Option<String>,

    /// Namespace (deploy: override for every namespaced manifest)
    #[arg(long = "ns", global = true)]
    namespace: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output {
    Human,
    Json,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Cascade {
    Foreground,
    Background,
    Orphan,
}

impl From<Cascade> for Propagation {
    fn from(c: Cascade) -> Self {
        match c {
            Cascade::Foreground => Propagation::Foreground,
            Cascade::Background => Propagation::Background,
            Cascade::Orphan => Propagation::Orphan,
        }
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Deploy a request file, or a multi-document YAML of manifests
    Deploy {
        file: String,
        /// Moniker application when the file holds bare manifests
        #[arg(long)]
        app: Option<String>,
    },
    /// Delete versions beyond the cluster's max-version-history
    Prune { kind: String, name: String },
    /// Rollout status of a live resource
    Status {
        kind: String,
        name: String,
        /// Poll until stable, failed, or this many seconds pass
        #[arg(long)]
        wait: Option<u64>,
    },
    Delete {
        kind: String,
        name: String,
        #[arg(long, value_enum, default_value_t = Cascade::Foreground)]
        cascade: Cascade,
    },
    Scale { kind: String, name: String, replicas: i64 },
    /// Rolling restart through the pod template
    Restart { kind: String, name: String },
    /// Attach the workload to its load balancers
    Enable { kind: String, name: String },
    /// Detach the workload from its load balancers
    Disable { kind: String, name: String },
    /// Recent audit records
    Audit {
        #[arg(long, default_value_t = 20)]
        limit: usize,
        /// Include every account, not just --account
        #[arg(long = "all", action = ArgAction::SetTrue)]
        all: bool,
    },
}

impl Commands {
    fn name(&self) -> &'static str {
        match self {
            Commands::Deploy { .. } => "deploy",
            Commands::Prune { .. } => "prune",
            Commands::Status { .. } => "status",
            Commands::Delete { .. } => "delete",
            Commands::Scale { .. } => "scale",
            Commands::Restart { .. } => "restart",
            Commands::Enable { .. } => "enable",
            Commands::Disable { .. } => "disable",
            Commands::Audit { .. } => "audit",
        }
    }
}

fn init_tracing() {
    let env = std::env::var("SPINDLE_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("SPINDLE_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid SPINDLE_METRICS_ADDR; expected host:port");
        }
    }
}

fn load_account(cli: &Cli) -> Result<Account> {
    match cli.accounts.as_deref() {
        Some(path) => Ok(Accounts::load(path)?.get(&cli.account)?.clone()),
        None => Ok(Account::new(&cli.account)),
    }
}

async fn deployer(cli: &Cli) -> Result<Deployer> {
    let account = load_account(cli)?;
    let cache = Arc::new(DiscoveryCache::new());
    let cluster = KubeCluster::connect(&account.connection, cache)
        .await
        .with_context(|| format!("connecting account {}", account.name))?;
    let audit = SqliteAuditStore::open_default()?;
    let status = StatusRegistry::from_env()?;
    Ok(Deployer::new(account, Arc::new(cluster), Arc::new(audit)).with_status_registry(status))
}

/// A request object (`{"manifests": [...]}`) or bare manifests, one per YAML
/// document.
fn parse_request(raw: &str, app: Option<&str>) -> Result<DeployRequest> {
    let mut docs = Vec::new();
    for doc in serde_yaml::Deserializer::from_str(raw) {
        let v = Json::deserialize(doc).context("parsing deploy file")?;
        if !v.is_null() {
            docs.push(v);
        }
    }
    let mut req = match docs.as_slice() {
        [single] if single.get("manifests").is_some() => {
            serde_json::from_value::<DeployRequest>(single.clone()).context("parsing deploy request")?
        }
        _ => DeployRequest { manifests: docs, ..Default::default() },
    };
    if let Some(app) = app {
        req.moniker.app = app.to_string();
    }
    Ok(req)
}

fn print<T: serde::Serialize>(output: Output, value: &T, human: impl FnOnce()) -> Result<()> {
    match output {
        Output::Human => human(),
        Output::Json => println!("{}", serde_json::to_string_pretty(value)?),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    counter!("cli_commands_total", 1u64, "command" => cli.command.name());
    let ns = cli.namespace.as_deref();

    match &cli.command {
        Commands::Deploy { file, app } => {
            let raw = std::fs::read_to_string(file).with_context(|| format!("reading {}", file))?;
            let mut req = parse_request(&raw, app.as_deref())?;
            if ns.is_some() {
                req.namespace_override = cli.namespace.clone();
            }
            info!(file = %file, manifests = req.manifests.len(), "deploy invoked");
            let res = deployer(&cli).await?.deploy(&req).await?;
            print(cli.output, &res, || {
                println!("task {}", res.task_id);
                for (namespace, names) in &res.manifest_names_by_namespace {
                    let namespace = if namespace.is_empty() { "-" } else { namespace.as_str() };
                    for n in names {
                        println!("{:<16} {}", namespace, n);
                    }
                }
            })?;
        }
        Commands::Prune { kind, name } => {
            let deleted = deployer(&cli).await?.prune(kind, name, ns).await?;
            print(cli.output, &deleted, || {
                if deleted.is_empty() {
                    println!("nothing to prune");
                }
                for d in &deleted {
                    println!("deleted {}", d);
                }
            })?;
        }
        Commands::Status { kind, name, wait } => {
            let d = deployer(&cli).await?;
            let deadline = Instant::now() + Duration::from_secs(wait.unwrap_or(0));
            let status = loop {
                let s = d.status(kind, name, ns).await?;
                if wait.is_none() || s.is_stable() || s.failed.state || Instant::now() >= deadline {
                    break s;
                }
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_secs(2)) => {}
                    _ = signal::ctrl_c() => {
                        info!("Ctrl-C received; stopping status poll");
                        break s;
                    }
                }
            };
            print(cli.output, &status, || {
                let facets = [
                    ("stable", &status.stable),
                    ("available", &status.available),
                    ("paused", &status.paused),
                    ("failed", &status.failed),
                ];
                for (label, f) in facets {
                    println!("{:<10} {:<5} {}", label, f.state, f.message);
                }
            })?;
            if status.failed.state {
                anyhow::bail!("{} {} failed: {}", kind, name, status.failed.message);
            }
        }
        Commands::Delete { kind, name, cascade } => {
            deployer(&cli).await?.delete(kind, name, ns, (*cascade).into()).await?;
            println!("deleted {} {}", kind, name);
        }
        Commands::Scale { kind, name, replicas } => {
            let live = deployer(&cli).await?.scale(kind, name, ns, *replicas).await?;
            print(cli.output, &live, || println!("scaled {} to {}", live.describe(), replicas))?;
        }
        Commands::Restart { kind, name } => {
            let live = deployer(&cli).await?.rolling_restart(kind, name, ns).await?;
            print(cli.output, &live, || println!("restarted {}", live.describe()))?;
        }
        Commands::Enable { kind, name } => {
            let n = deployer(&cli).await?.enable(kind, name, ns).await?;
            println!("enabled {} {} on {} load balancer(s)", kind, name, n);
        }
        Commands::Disable { kind, name } => {
            let n = deployer(&cli).await?.disable(kind, name, ns).await?;
            println!("disabled {} {} on {} load balancer(s)", kind, name, n);
        }
        Commands::Audit { limit, all } => {
            let store = SqliteAuditStore::open_default()?;
            let account = if *all { None } else { Some(cli.account.as_str()) };
            let records = store.recent(account, *limit)?;
            print(cli.output, &records, || {
                println!("{:<25} {:<15} {:<10} {:<40} NAMESPACE", "TIME", "TASK", "OP", "RESOURCE");
                for r in &records {
                    let task: String = r.task_id.chars().take(13).collect();
                    let ns_col = if r.namespace.is_empty() { "-" } else { r.namespace.as_str() };
                    println!(
                        "{:<25} {:<15} {:<10} {:<40} {}",
                        r.timestamp,
                        task,
                        r.task_type,
                        format!("{} {}", r.kind, r.name),
                        ns_col
                    );
                }
            })?;
        }
    }

    Ok(())
}
