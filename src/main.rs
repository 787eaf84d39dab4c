mod settings;

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand};
use ledger_store::{Context, LedgerError, Store, StoreConfig};
use ledger_telemetry::{init_telemetry, TelemetryConfig};
use tracing::{info, warn};

use crate::settings::{load_settings_from_path, settings_path, LedgerSettings};

/// Session-scoped access to an account ledger.
#[derive(Parser, Debug)]
#[command(name = "ledger", about = "Atomic account ledger on SQLite")]
struct Cli {
    /// Settings file (defaults to `~/.ledger/settings.json`).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Database file (overrides settings and `LEDGER_DATABASE_PATH`).
    #[arg(long, global = true)]
    database: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create the schema if needed and print the database location.
    Init,
    /// Create an account with an opening balance.
    CreateAccount { address: String, balance: u64 },
    /// Move funds between two accounts.
    Transfer { from: String, to: String, amount: u64 },
    /// Print an account's balance.
    Balance { address: String },
    /// Run the alice/bob scenario against a throwaway in-memory store.
    Demo,
}

#[tokio::main]
async fn main() -> ExitCode {
    match run(Cli::parse()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            match err.downcast_ref::<LedgerError>() {
                Some(ledger) => eprintln!("error [{}]: {err:#}", ledger.root_cause().error_kind()),
                None => eprintln!("error: {err:#}"),
            }
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let settings_file = cli.config.clone().unwrap_or_else(settings_path);
    let mut settings = load_settings_from_path(&settings_file)
        .with_context(|| format!("loading settings from {}", settings_file.display()))?;
    if let Some(path) = cli.database {
        settings.database.path = Some(path);
    }

    let telemetry = init_telemetry(TelemetryConfig {
        log_level: settings.logging.tracing_level()?,
        module_levels: Vec::new(),
        json: settings.logging.json,
    });

    let ctx = Context::background();
    let interrupt = ctx.token().clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted, cancelling in-flight operation");
            interrupt.cancel();
        }
    });

    let store_config = match cli.command {
        Command::Demo => StoreConfig::default(),
        _ => database_config(&settings),
    };
    let metrics = telemetry.metrics();
    let command = cli.command;

    tokio::task::spawn_blocking(move || {
        let store = Store::open_with_metrics(&store_config, metrics)?;
        execute(&store, &ctx, command)
    })
    .await
    .context("ledger task panicked")?
}

fn database_config(settings: &LedgerSettings) -> StoreConfig {
    let mut config = settings.database.clone();
    if config.path.is_none() {
        let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
        config.path = Some(PathBuf::from(home).join(".ledger").join("ledger.db"));
    }
    config
}

fn execute(store: &Store, ctx: &Context, command: Command) -> Result<()> {
    match command {
        Command::Init => {
            let location = store
                .config()
                .path
                .as_ref()
                .map_or_else(|| ":memory:".to_string(), |p| p.display().to_string());
            println!("{location}");
        }
        Command::CreateAccount { address, balance } => {
            let mut session = store.session(ctx);
            in_session(&mut session, |s| s.create_account(ctx, &address, balance))?;
            session.commit()?;
            info!(%address, balance, "account created");
            println!("created {address} with {balance}");
        }
        Command::Transfer { from, to, amount } => {
            let mut session = store.session(ctx);
            in_session(&mut session, |s| s.move_funds(ctx, &from, &to, amount))?;
            session.commit()?;
            info!(%from, %to, amount, "transfer committed");
            println!("moved {amount} from {from} to {to}");
        }
        Command::Balance { address } => {
            let mut session = store.session(ctx);
            let balance = in_session(&mut session, |s| s.balance(ctx, &address))?;
            session.rollback()?;
            println!("{balance}");
        }
        Command::Demo => demo(store, ctx)?,
    }
    Ok(())
}

/// Run `op`, rolling the session back if it fails.
fn in_session<T>(
    session: &mut ledger_store::Session,
    op: impl FnOnce(&mut ledger_store::Session) -> Result<T, LedgerError>,
) -> Result<T, LedgerError> {
    op(session).inspect_err(|_| {
        if let Err(e) = session.rollback() {
            warn!(error = %e, "rollback after failure failed");
        }
    })
}

fn demo(store: &Store, ctx: &Context) -> Result<()> {
    let mut session = store.session(ctx);
    session.create_account(ctx, "alice", 100)?;
    session.create_account(ctx, "bob", 50)?;
    session.move_funds(ctx, "alice", "bob", 30)?;
    session.commit()?;
    println!("alice -> bob 30: committed");

    let mut session = store.session(ctx);
    match session.move_funds(ctx, "alice", "bob", 500) {
        Err(err @ LedgerError::InsufficientFunds { .. }) => {
            println!("alice -> bob 500: {err}");
            session.rollback()?;
        }
        Ok(()) => anyhow::bail!("overdraft was accepted"),
        Err(err) => return Err(err.into()),
    }

    let mut session = store.session(ctx);
    for address in ["alice", "bob"] {
        println!("{address}: {}", session.balance(ctx, address)?);
    }
    session.rollback()?;

    let snapshot = serde_json::to_string_pretty(&store.metrics().snapshot())?;
    println!("{snapshot}");
    Ok(())
}
