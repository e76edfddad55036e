use anyhow::{Context, Result, anyhow};
use chrono::Utc;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;
use vehicle_persist::config::{EngineConfig, OrphanPolicy};
use vehicle_persist::orphan::impound_fee;
use vehicle_persist::{DurableStore, EntityId, JournalStore, PersistError};

#[derive(Parser)]
#[command(name = "vehicle-admin")]
#[command(about = "Offline tooling for a vehicle persistence journal")]
struct Cli {
    /// Journal directory (holds vehicles.snapshot and vehicles.wal)
    #[arg(long, default_value = "data")]
    data_dir: PathBuf,

    /// Engine config file; only the orphan settings are used
    #[arg(long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print every stored record
    List {
        #[arg(long)]
        owner: Option<String>,
    },
    /// Print id, owner and model of every stored record
    Summaries,
    /// Print one record as JSON
    Show { plate: String },
    /// Delete one record
    Remove { plate: String },
    /// Delete every record
    Clear {
        #[arg(long)]
        yes: bool,
    },
    /// Fold the journal into a fresh snapshot
    Compact,
    /// List records saved longer ago than the orphan threshold, with the fee
    /// impounding them now would charge
    Stale,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("warn".parse()?))
        .init();

    let orphan = match &cli.config {
        Some(path) => {
            EngineConfig::from_json_file(path)
                .with_context(|| format!("Failed to load config '{}'", path.display()))?
                .orphan
        }
        None => OrphanPolicy::default(),
    };

    let store = JournalStore::open(&cli.data_dir)
        .with_context(|| format!("Failed to open journal '{}'", cli.data_dir.display()))?;

    match cli.command {
        Command::List { owner } => list(&store, owner.as_deref()).await,
        Command::Summaries => summaries(&store).await,
        Command::Show { plate } => show(&store, &plate).await,
        Command::Remove { plate } => remove(&store, &plate).await,
        Command::Clear { yes } => clear(&store, yes).await,
        Command::Compact => {
            store.compact().await.context("Compaction failed")?;
            println!("Compacted {} records", store.len().await?);
            Ok(())
        }
        Command::Stale => stale(&store, &orphan).await,
    }
}

async fn sorted_records(store: &JournalStore) -> Result<Vec<vehicle_persist::EntityRecord>> {
    let mut records = store.load_all().await.context("Failed to read journal")?;
    records.sort_by(|a, b| a.id.cmp(&b.id));
    Ok(records)
}

async fn list(store: &JournalStore, owner: Option<&str>) -> Result<()> {
    let records = sorted_records(store).await?;
    let mut shown = 0;
    for record in records
        .iter()
        .filter(|r| owner.is_none_or(|owner| r.owner_id.as_str() == owner))
    {
        println!(
            "{:<8}  {:<20}  {:<12}  ({:.1}, {:.1}, {:.1})  fuel={:.0}  saved={}",
            record.id,
            record.owner_id,
            record.kind,
            record.position.x,
            record.position.y,
            record.position.z,
            record.condition.fuel,
            record.saved_at.to_rfc3339()
        );
        shown += 1;
    }
    println!("{} record(s)", shown);
    Ok(())
}

async fn summaries(store: &JournalStore) -> Result<()> {
    let summaries = sorted_records(store)
        .await?
        .iter()
        .map(|r| r.summary())
        .collect::<Vec<_>>();
    println!("{}", serde_json::to_string_pretty(&summaries)?);
    Ok(())
}

async fn show(store: &JournalStore, plate: &str) -> Result<()> {
    let id = EntityId::parse(plate).map_err(|e| anyhow!("{}", e))?;
    let record = store.get(&id).await.map_err(|err| missing_or(err, &id))?;
    println!("{}", serde_json::to_string_pretty(&record)?);
    Ok(())
}

async fn remove(store: &JournalStore, plate: &str) -> Result<()> {
    let id = EntityId::parse(plate).map_err(|e| anyhow!("{}", e))?;
    let record = store.take(&id).await.map_err(|err| missing_or(err, &id))?;
    println!("Removed {} (owner {})", record.id, record.owner_id);
    Ok(())
}

fn missing_or(err: PersistError, id: &EntityId) -> anyhow::Error {
    match err {
        PersistError::NotFound(_) => anyhow!("No record for plate '{}'", id),
        other => anyhow::Error::new(other).context(format!("Failed to access '{}'", id)),
    }
}

async fn clear(store: &JournalStore, yes: bool) -> Result<()> {
    if !yes {
        return Err(anyhow!("Refusing to clear without --yes"));
    }
    let records = store.load_all().await?;
    for record in &records {
        store.delete(&record.id).await?;
    }
    store.compact().await?;
    println!("Cleared {} record(s)", records.len());
    Ok(())
}

async fn stale(store: &JournalStore, policy: &OrphanPolicy) -> Result<()> {
    let now = Utc::now();
    let threshold = policy.threshold();
    let mut total_fees = 0u64;
    let mut count = 0;
    for record in sorted_records(store).await? {
        if now - record.saved_at <= threshold {
            continue;
        }
        let fee = impound_fee(record.saved_at, now, policy.fee_per_day, policy.max_fee);
        println!(
            "{:<8}  {:<20}  {:>4} days  fee={}",
            record.id,
            record.owner_id,
            (now - record.saved_at).num_days(),
            fee
        );
        total_fees += fee;
        count += 1;
    }
    println!(
        "{} record(s) older than {} days, {} in fees",
        count, policy.threshold_days, total_fees
    );
    Ok(())
}
