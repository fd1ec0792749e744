//! fsmkit - finite-state-machine engine
//!
//! Runs one-shot commands against the configured definitions and store.

mod commands;
mod config;

use clap::{Parser, Subcommand};
use colored::Colorize;
use config::{Config, StoreBackend};
use fsmkit_core::{MemoryStore, Registry, StateMachineEngine, StateStore};
use fsmkit_notify::{spawn_dispatcher, QueuedNotifier};
use fsmkit_storage::{DefinitionLoader, SqliteStore};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "fsmkit")]
#[command(about = "Drive state machine entities stored in a local database")]
#[command(version)]
struct Cli {
    /// YAML configuration file
    #[arg(short, long, env = "FSMKIT_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// List registered machines
    Machines,

    /// Print a machine definition
    Show {
        /// Machine id
        machine: String,
    },

    /// Create the state record for an entity
    Init {
        machine: String,
        entity: String,

        /// Initial context JSON (or @file.json to read from file)
        #[arg(short, long)]
        ctx: Option<String>,

        /// Replace an existing record
        #[arg(short, long)]
        force: bool,
    },

    /// Send an event to an entity
    Send {
        machine: String,
        entity: String,
        event: String,

        /// Event context JSON (or @file.json to read from file)
        #[arg(short, long)]
        ctx: Option<String>,
    },

    /// Move an entity to a state, bypassing guards and actions
    Force {
        machine: String,
        entity: String,
        state: String,
    },

    /// Print an entity's state record
    Get { machine: String, entity: String },

    /// List events leaving an entity's current state
    Events { machine: String, entity: String },

    /// Check whether an event would currently be accepted
    CanSend {
        machine: String,
        entity: String,
        event: String,
    },

    /// List entities with a state record
    List { machine: String },

    /// Delete an entity's state record
    Remove { machine: String, entity: String },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Logs go to stderr so command output stays parseable.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let config = Config::load(cli.config.as_deref()).map_err(|e| {
        tracing::error!("Failed to load config: {}", e);
        e
    })?;
    if let Some(path) = &cli.config {
        tracing::debug!("Loaded config from {}", path.display());
    }

    let registry = Arc::new(Registry::new());
    DefinitionLoader::new(&config.definitions.dir, commands::builtin_handlers())
        .load_into(&registry)?;

    let store: Arc<dyn StateStore> = match config.store.backend {
        StoreBackend::Sqlite => Arc::new(SqliteStore::open(config.store.sqlite_config())?),
        StoreBackend::Memory => {
            tracing::warn!("Using in-memory store; records are discarded on exit");
            Arc::new(MemoryStore::new())
        }
    };

    let (notifier, rx) = QueuedNotifier::new(config.notify.queue_capacity);
    let dispatcher = spawn_dispatcher(rx, |change| async move {
        tracing::info!(
            machine = %change.machine_id,
            entity = %change.entity_id,
            event = change.event.as_deref().unwrap_or("<forced>"),
            "state changed '{}' -> '{}'",
            change.from_state,
            change.to_state
        );
        Ok(())
    });

    let engine = StateMachineEngine::new(registry, store)
        .with_notifier(Arc::new(notifier))
        .with_options(config.engine.clone());

    let result = commands::execute(&engine, cli.command);

    // Closing the last sender lets the dispatcher drain and stop.
    drop(engine);
    if let Err(e) = dispatcher.await {
        tracing::warn!("Notification dispatcher failed: {}", e);
    }

    match result {
        Ok(output) => {
            println!("{}", output);
            Ok(())
        }
        Err(e) => {
            eprintln!("{}: {}", "Error".red(), e);
            std::process::exit(1);
        }
    }
}
