use std::str::FromStr;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use jobsync_core::{drift, DiffSummary, FieldChange, JobSnapshot, ResourceId};
use jobsync_kubehub::{get_kube_client, KubeJobApi, DEFAULT_FIELD_MANAGER};
use jobsync_persist::{SqliteStateStore, StateRecord, StateStore};
use jobsync_reconciler::{ApplyOutcome, ManagedRecord, Reconciler, ReconcilerConfig};
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "jobsyncctl", version, about = "Declarative batch Job reconciler")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Kubeconfig context (default: current context)
    #[arg(long = "context", global = true)]
    context: Option<String>,

    /// State database path
    #[arg(long = "db", env = "JOBSYNC_DB_PATH", global = true)]
    db: Option<String>,

    /// Field manager recorded on writes
    #[arg(long = "field-manager", env = "JOBSYNC_FIELD_MANAGER", global = true, default_value = DEFAULT_FIELD_MANAGER)]
    field_manager: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create or update the Job described by a document
    Apply {
        /// Document path (YAML or JSON; native shape or batch/v1 Job)
        #[arg(short = 'f', long = "file")]
        file: String,
        /// State address to track this Job under (default: its identifier)
        #[arg(long = "address")]
        address: Option<String>,
        /// Show the drift without writing
        #[arg(long = "dry-run", action = ArgAction::SetTrue)]
        dry_run: bool,
    },
    /// Show the live state of a Job, e.g. "default/tf-acc-test-x"
    Get { id: String },
    /// Delete a Job and wait until it is gone
    Delete {
        /// Identifier; optional when --address names a tracked Job
        id: Option<String>,
        #[arg(long = "address")]
        address: Option<String>,
    },
    /// Exit 0 when the Job exists (and matches --uid), 1 otherwise
    Exists {
        id: String,
        #[arg(long = "uid")]
        uid: Option<String>,
    },
    /// Identifier codec
    Id {
        #[command(subcommand)]
        command: IdCommands,
    },
    /// Tracked state: list addresses, or the history of one
    State { address: Option<String> },
}

#[derive(Subcommand, Debug)]
enum IdCommands {
    Encode { namespace: String, name: String },
    Decode { id: String },
}

fn init_tracing() {
    let env = std::env::var("JOBSYNC_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("JOBSYNC_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid JOBSYNC_METRICS_ADDR; expected host:port");
        }
    }
}

fn open_store(db: Option<&str>) -> Result<SqliteStateStore> {
    match db {
        Some(path) => SqliteStateStore::open(path),
        None => SqliteStateStore::open_default(),
    }
}

async fn reconciler(cli: &Cli) -> Result<Reconciler<KubeJobApi>> {
    let client = get_kube_client(cli.context.as_deref()).await?;
    let api = KubeJobApi::new(client).with_field_manager(&cli.field_manager);
    Ok(Reconciler::new(api, ReconcilerConfig::from_env()))
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    match &cli.command {
        Commands::Apply { file, address, dry_run } => {
            let text = std::fs::read_to_string(file).with_context(|| format!("reading {}", file))?;
            let doc = jobsync_mapper::parse_document(&text)?;
            let id = doc.resource_id()?;
            let address = address.clone().unwrap_or_else(|| id.encode());
            info!(file = %file, id = %id, address = %address, dry_run, "apply invoked");
            let rec = reconciler(&cli).await?;

            if *dry_run {
                let live = rec.read(&id).await?;
                let changes = live.as_ref().map(|l| drift(&doc, &l.document)).unwrap_or_default();
                print_plan(cli.output, &id, &changes, live.is_none())?;
                return Ok(());
            }

            let store = open_store(cli.db.as_deref())?;
            let mut record = match store.latest(&address)? {
                Some(prev) if prev.id == id => ManagedRecord::existing(prev.id, prev.uid),
                Some(prev) => {
                    warn!(address = %address, tracked = %prev.id, wanted = %id, "address now names a different job; tracking the new one");
                    ManagedRecord::new()
                }
                None => ManagedRecord::new(),
            };
            let outcome = rec.apply(&mut record, &doc).await?;
            let snap = outcome.snapshot();
            store.put(&StateRecord::new(
                address.clone(),
                snap.id.clone(),
                snap.uid.clone(),
                snap.resource_version.clone(),
                serde_yaml::to_string(&doc)?,
            ))?;
            print_outcome(cli.output, &address, &outcome)?;
        }
        Commands::Get { id } => {
            let id = ResourceId::decode(id)?;
            let rec = reconciler(&cli).await?;
            match rec.read(&id).await? {
                Some(snap) => print_snapshot(cli.output, &snap)?,
                None => {
                    eprintln!("{}: not found", id);
                    std::process::exit(1);
                }
            }
        }
        Commands::Delete { id, address } => {
            let store = open_store(cli.db.as_deref())?;
            let tracked = match address {
                Some(a) => store.latest(a)?,
                None => None,
            };
            let mut record = match (id, tracked) {
                (Some(raw), tracked) => {
                    let id = ResourceId::decode(raw)?;
                    let uid = tracked.filter(|t| t.id == id).and_then(|t| t.uid);
                    ManagedRecord::existing(id, uid)
                }
                (None, Some(t)) => ManagedRecord::existing(t.id, t.uid),
                (None, None) => anyhow::bail!("nothing to delete: pass an identifier or a tracked --address"),
            };
            let target = record.id.clone();
            let rec = reconciler(&cli).await?;
            rec.destroy(&mut record).await?;
            if let Some(a) = address {
                let n = store.forget(a)?;
                info!(address = %a, rows = n, "state forgotten");
            }
            match cli.output {
                Output::Human => {
                    if let Some(id) = target {
                        println!("deleted {}", id);
                    }
                }
                Output::Json => println!("{}", serde_json::json!({ "deleted": target })),
            }
        }
        Commands::Exists { id, uid } => {
            let id = ResourceId::decode(id)?;
            let rec = reconciler(&cli).await?;
            let found = rec.exists(&id, uid.as_deref()).await?;
            match cli.output {
                Output::Human => println!("{}", found),
                Output::Json => println!("{}", serde_json::json!({ "id": id, "exists": found })),
            }
            if !found {
                std::process::exit(1);
            }
        }
        Commands::Id { command } => match command {
            IdCommands::Encode { namespace, name } => {
                let id = ResourceId::new(namespace.as_str(), name.as_str())?;
                println!("{}", id);
            }
            IdCommands::Decode { id } => {
                let id = ResourceId::decode(id)?;
                match cli.output {
                    Output::Human => println!("namespace: {}\nname: {}", id.namespace(), id.name()),
                    Output::Json => println!("{}", serde_json::json!({ "namespace": id.namespace(), "name": id.name() })),
                }
            }
        },
        Commands::State { address } => {
            let store = open_store(cli.db.as_deref())?;
            match address {
                None => {
                    for a in store.addresses()? {
                        println!("{}", a);
                    }
                }
                Some(a) => {
                    let rows = store.history(a, None)?;
                    match cli.output {
                        Output::Human => {
                            println!("{:<32} {:<12} {:<38} APPLIED", "ID", "RV", "UID");
                            for r in rows {
                                println!(
                                    "{:<32} {:<12} {:<38} {}",
                                    r.id.to_string(),
                                    r.resource_version.as_deref().unwrap_or("-"),
                                    r.uid.as_deref().unwrap_or("-"),
                                    r.applied_at()
                                );
                            }
                        }
                        Output::Json => println!("{}", serde_json::to_string_pretty(&rows)?),
                    }
                }
            }
        }
    }

    Ok(())
}

fn print_plan(output: Output, id: &ResourceId, changes: &[FieldChange], absent: bool) -> Result<()> {
    let summary = DiffSummary::from_changes(changes);
    match output {
        Output::Human => {
            if absent {
                println!("{}: will be created", id);
            } else if summary.is_empty() {
                println!("{}: up to date", id);
            } else {
                println!("{}: {} to add, {} to change", id, summary.adds, summary.updates);
                for c in changes {
                    println!("  ~ {}: {} -> {}", c.path, c.live, c.desired);
                }
            }
        }
        Output::Json => {
            println!("{}", serde_json::to_string_pretty(&serde_json::json!({ "id": id, "create": absent, "summary": summary, "changes": changes }))?)
        }
    }
    Ok(())
}

fn print_outcome(output: Output, address: &str, outcome: &ApplyOutcome) -> Result<()> {
    match output {
        Output::Human => {
            let snap = outcome.snapshot();
            match outcome {
                ApplyOutcome::Created(_) => println!("{} created (uid {})", snap.id, snap.uid.as_deref().unwrap_or("-")),
                ApplyOutcome::Updated { changes, .. } => {
                    println!("{} updated ({} field(s))", snap.id, changes.len());
                    for c in changes {
                        println!("  ~ {}", c.path);
                    }
                }
                ApplyOutcome::Unchanged(_) => println!("{} unchanged", snap.id),
            }
            println!("tracked as {}", address);
        }
        Output::Json => println!("{}", serde_json::to_string_pretty(outcome)?),
    }
    Ok(())
}

fn print_snapshot(output: Output, snap: &JobSnapshot) -> Result<()> {
    match output {
        Output::Human => {
            println!("ID        {}", snap.id);
            println!("UID       {}", snap.uid.as_deref().unwrap_or("-"));
            println!("RV        {}", snap.resource_version.as_deref().unwrap_or("-"));
            println!("AGE       {}", render_age(snap.creation_timestamp.as_deref()));
            println!("STATUS    active={} succeeded={} failed={}{}", snap.status.active, snap.status.succeeded, snap.status.failed, if snap.deleting { " (deleting)" } else { "" });
            print!("{}", serde_yaml::to_string(&snap.document)?);
        }
        Output::Json => println!("{}", serde_json::to_string_pretty(snap)?),
    }
    Ok(())
}

fn render_age(created: Option<&str>) -> String {
    let Some(ts) = created.and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok()) else {
        return "-".to_string();
    };
    let mut secs = (chrono::Utc::now().timestamp() - ts.timestamp()).max(0) as u64;
    let days = secs / 86_400; secs %= 86_400;
    let hours = secs / 3600; secs %= 3600;
    let mins = secs / 60; secs %= 60;
    if days > 0 { format!("{}d{}h", days, hours) }
    else if hours > 0 { format!("{}h{}m", hours, mins) }
    else if mins > 0 { format!("{}m", mins) }
    else { format!("{}s", secs) }
}
