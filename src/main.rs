//! substore: command-line interface for the subscription store.
//!
//! # Usage
//!
//! ```bash
//! substore --database-url sqlite://./data/subscriptions.db setup
//! substore plan
//! substore list --status ERROR --output json
//! substore capabilities
//! ```
//!
//! Environment variables can also be used:
//! - `SUBSTORE_DATABASE_URL`: Database to connect to
//! - `SUBSTORE_TABLE`: Name of the subscriptions table
//! - `RUST_LOG`: Log level (trace, debug, info, warn, error)

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;

use substore::config::Config;
use substore::observability::tracing::init_tracing;
use substore::storage::{open_store, Backend, DynBackend};
use substore::{
    SqlSubscriptionStore, Subscription, SubscriptionCriteria, SubscriptionId, SubscriptionStatus,
    SubscriptionStore, SystemClock,
};

/// Command-line interface for the subscription store.
#[derive(Parser, Debug)]
#[command(name = "substore")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    #[command(flatten)]
    config: Config,

    /// Output format (text, json)
    #[arg(short, long, default_value = "text")]
    output: OutputFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutputFormat {
    Text,
    Json,
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            _ => Err(format!("unknown output format: {}", s)),
        }
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create or reconcile the subscriptions table
    Setup,
    /// Print the statements `setup` would apply
    Plan,
    /// List subscriptions without locking them
    List {
        /// Only these ids (repeatable)
        #[arg(long = "id")]
        ids: Vec<String>,
        /// Only these statuses, e.g. ACTIVE (repeatable)
        #[arg(long = "status")]
        statuses: Vec<SubscriptionStatus>,
    },
    /// Show the backend dialect and its locking guarantee
    Capabilities,
}

type Store = SqlSubscriptionStore<DynBackend, SystemClock>;

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.config.log_level, cli.config.log_json);

    let mut store = open_store(&cli.config, SystemClock).context("failed to open store")?;

    match cli.command {
        Commands::Setup => setup(&mut store, cli.output),
        Commands::Plan => plan(&mut store, cli.output),
        Commands::List { ids, statuses } => list(&mut store, ids, statuses, cli.output),
        Commands::Capabilities => capabilities(&store, cli.output),
    }
}

fn setup(store: &mut Store, output: OutputFormat) -> Result<()> {
    let applied = store.ensure_schema()?;
    match output {
        OutputFormat::Text if applied == 0 => {
            println!("Table {} is up to date", store.table());
        }
        OutputFormat::Text => println!("Applied {applied} statements to {}", store.table()),
        OutputFormat::Json => print_json(&serde_json::json!({
            "table": store.table().as_str(),
            "applied": applied,
        }))?,
    }
    Ok(())
}

fn plan(store: &mut Store, output: OutputFormat) -> Result<()> {
    let statements = store.required_statements()?;
    match output {
        OutputFormat::Text if statements.is_empty() => {
            println!("Table {} is up to date", store.table());
        }
        OutputFormat::Text => {
            for statement in &statements {
                println!("{statement};");
            }
        }
        OutputFormat::Json => print_json(&statements)?,
    }
    Ok(())
}

fn list(
    store: &mut Store,
    ids: Vec<String>,
    statuses: Vec<SubscriptionStatus>,
    output: OutputFormat,
) -> Result<()> {
    let mut criteria = SubscriptionCriteria::all().with_statuses(statuses);
    if !ids.is_empty() {
        let ids = ids
            .into_iter()
            .map(SubscriptionId::new)
            .collect::<Result<Vec<_>, _>>()
            .context("invalid --id")?;
        criteria = criteria.with_ids(ids)?;
    }

    let subscriptions = store.find_by_criteria(&criteria)?;
    match output {
        OutputFormat::Text => print_table(&subscriptions),
        OutputFormat::Json => print_json(&subscriptions)?,
    }
    Ok(())
}

fn capabilities(store: &Store, output: OutputFormat) -> Result<()> {
    let dialect = store.backend().dialect();
    let locking = store.locking_mode();
    match output {
        OutputFormat::Text => {
            println!("Dialect:  {dialect}");
            println!("Locking:  {locking}");
        }
        OutputFormat::Json => print_json(&serde_json::json!({
            "dialect": dialect.name(),
            "locking_mode": locking.to_string(),
        }))?,
    }
    Ok(())
}

fn print_table(subscriptions: &[Subscription]) {
    if subscriptions.is_empty() {
        println!("No subscriptions found");
        return;
    }
    println!(
        "{:<40} {:<10} {:>12}  {:<20}  ERROR",
        "ID", "STATUS", "POSITION", "LAST SAVED"
    );
    for subscription in subscriptions {
        let saved = subscription
            .last_saved_at
            .map(substore::storage::codec::format_timestamp)
            .unwrap_or_default();
        let error = subscription
            .error
            .as_ref()
            .map(|e| e.message.as_str())
            .unwrap_or("-");
        println!(
            "{:<40} {:<10} {:>12}  {:<20}  {}",
            subscription.id,
            subscription.status,
            subscription.position.value(),
            saved,
            error
        );
    }
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
