use std::path::PathBuf;

use anyhow::bail;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use forge_store::config::StoreConfig;
use forge_store::store::ledger::{Ledger, VersionState};
use forge_store::store::schema::{self, TABLES, TARGET_VERSION};
use forge_store::store::{Outcome, SqliteStore, Store, connect_read_only, migrate};

#[derive(Parser)]
#[command(name = "forge-store")]
#[command(about = "Inspect and upgrade a forge database", long_about = None)]
struct Cli {
    /// Directory holding the database file
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// TOML file with store settings
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the stored and the supported schema version
    Status,

    /// Create the database, or upgrade it to the supported version
    Migrate,

    /// Copy the database file alongside it
    Backup,

    /// Validate the table declarations and compare them with the database
    CheckSchema,
}

fn load_config(cli: &Cli) -> anyhow::Result<StoreConfig> {
    let config = match &cli.config {
        Some(path) => StoreConfig::load(path)?,
        None => StoreConfig::default(),
    };
    Ok(match &cli.data_dir {
        Some(dir) => config.with_data_dir(dir),
        None => config,
    })
}

fn run_status(config: &StoreConfig) -> anyhow::Result<()> {
    let db_path = config.db_path();
    if !db_path.exists() {
        println!("No database at {}", db_path.display());
        println!("Supported version: {TARGET_VERSION}");
        return Ok(());
    }

    let conn = connect_read_only(&db_path)?;
    let ledger = Ledger::new(&conn);
    let stored = ledger.version()?;

    println!("Database: {}", db_path.display());
    println!("Stored version: {stored}");
    println!("Supported version: {}", ledger.target());

    match ledger.state()? {
        VersionState::Empty => println!("State: empty"),
        VersionState::Current => println!("State: current"),
        VersionState::Ahead(_) => println!("State: written by a newer release"),
        VersionState::Behind(v) if v < migrate::BASELINE_VERSION => {
            println!("State: too old to upgrade");
        }
        VersionState::Behind(v) => {
            println!("State: behind");
            for step in migrate::pending(v) {
                println!("  pending {:>2}: {}", step.version, step.summary);
            }
        }
    }
    Ok(())
}

fn run_migrate(config: &StoreConfig) -> anyhow::Result<()> {
    let store = SqliteStore::open(config)?;
    match store.upgrade()? {
        Outcome::Created => println!(
            "Created database at version {TARGET_VERSION}: {}",
            store.path().display()
        ),
        Outcome::UpToDate => println!("Database is up to date (version {TARGET_VERSION})"),
        Outcome::Upgraded { from, to, backup } => {
            println!("Upgraded database from version {from} to {to}");
            println!("Backup written to {}", backup.display());
        }
    }
    store.close()?;
    Ok(())
}

fn run_backup(config: &StoreConfig) -> anyhow::Result<()> {
    let db_path = config.db_path();
    if !db_path.exists() {
        bail!("No database at {}", db_path.display());
    }

    let store = SqliteStore::open(config)?;
    let path = store.backup()?;
    println!("Backup written to {}", path.display());
    Ok(())
}

fn run_check_schema(config: &StoreConfig) -> anyhow::Result<()> {
    schema::validate()?;
    println!(
        "Table declarations are valid ({} tables, version {TARGET_VERSION})",
        TABLES.len()
    );

    let db_path = config.db_path();
    if !db_path.exists() {
        return Ok(());
    }

    let conn = connect_read_only(&db_path)?;
    let stored = Ledger::new(&conn).version()?;
    if stored != TARGET_VERSION {
        println!("Database is at version {stored}; run `forge-store migrate` to compare");
        return Ok(());
    }

    let drift = migrate::drift(&conn)?;
    if drift.is_empty() {
        println!("Database matches the declared tables");
        return Ok(());
    }
    for line in &drift {
        println!("  {line}");
    }
    bail!("Database differs from the declared tables in {} places", drift.len());
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(EnvFilter::from_default_env().add_directive("forge_store=info".parse()?))
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli)?;

    match cli.command {
        Commands::Status => run_status(&config)?,
        Commands::Migrate => run_migrate(&config)?,
        Commands::Backup => run_backup(&config)?,
        Commands::CheckSchema => run_check_schema(&config)?,
    }

    Ok(())
}
