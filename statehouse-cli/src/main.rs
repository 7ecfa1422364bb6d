use std::fs;
use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use colored::Colorize;

use statehouse_state::{
    Backend, BackendConfig, BackendError, DEFAULT_STATE_NAME, LockInfo, Locker, StateManager,
    create_backend,
};

#[derive(Parser)]
#[command(name = "statehouse")]
#[command(about = "Manage named infrastructure states and their locks", long_about = None)]
struct Cli {
    /// Path to a JSON backend configuration (defaults to a local backend)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Prepare the backend storage
    Init,
    /// Named state management commands
    State {
        #[command(subcommand)]
        command: StateCommands,
    },
    /// Acquire the lock on a state and print its ID
    Lock {
        /// State to lock
        #[arg(long, default_value = DEFAULT_STATE_NAME)]
        state: String,

        /// Operation recorded in the lock
        #[arg(long, default_value = "manual")]
        operation: String,
    },
    /// Release a lock acquired with `lock`
    Unlock {
        /// Lock ID printed by `lock`
        lock_id: String,

        /// State the lock belongs to
        #[arg(long, default_value = DEFAULT_STATE_NAME)]
        state: String,
    },
    /// Release a lock left behind by another process
    ForceUnlock {
        /// Lock ID reported in the lock error
        lock_id: String,

        /// State the lock belongs to
        #[arg(long, default_value = DEFAULT_STATE_NAME)]
        state: String,
    },
}

#[derive(Subcommand)]
enum StateCommands {
    /// List all named states
    List,
    /// Create a new named state
    New {
        /// Name of the state
        name: String,
    },
    /// Delete a named state
    Delete {
        /// Name of the state
        name: String,
    },
    /// Print the stored state document
    Show {
        /// Name of the state
        #[arg(default_value = DEFAULT_STATE_NAME)]
        name: String,
    },
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let cli = Cli::parse();

    let result = run(cli).await;

    if let Err(e) = result {
        eprintln!("{} {}", "Error:".red().bold(), e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), String> {
    let config = load_config(cli.config.as_deref())?;
    log::debug!("Using {} backend", config.backend_type);
    let backend = create_backend(&config)
        .await
        .map_err(|e| format!("Failed to create backend: {}", e))?;

    match cli.command {
        Commands::Init => run_init(backend.as_ref()).await,
        Commands::State { command } => run_state_command(backend.as_ref(), command).await,
        Commands::Lock { state, operation } => {
            run_lock(backend.as_ref(), &state, &operation).await
        }
        Commands::Unlock { lock_id, state } => {
            run_unlock(backend.as_ref(), &state, &lock_id, false).await
        }
        Commands::ForceUnlock { lock_id, state } => {
            run_unlock(backend.as_ref(), &state, &lock_id, true).await
        }
    }
}

fn load_config(path: Option<&Path>) -> Result<BackendConfig, String> {
    let Some(path) = path else {
        return Ok(BackendConfig::new("local"));
    };

    let content = fs::read_to_string(path)
        .map_err(|e| format!("Failed to read {}: {}", path.display(), e))?;
    BackendConfig::from_json(&content).map_err(|e| format!("{}: {}", path.display(), e))
}

async fn run_init(backend: &dyn Backend) -> Result<(), String> {
    backend.init().await.map_err(|e| e.to_string())?;
    println!("{}", "Backend initialized.".green().bold());
    Ok(())
}

async fn run_state_command(backend: &dyn Backend, command: StateCommands) -> Result<(), String> {
    match command {
        StateCommands::List => {
            let states = backend.states().await.map_err(|e| e.to_string())?;
            for name in states {
                println!("  {}", name);
            }
            Ok(())
        }
        StateCommands::New { name } => {
            let existing = backend.states().await.map_err(|e| e.to_string())?;
            if existing.contains(&name) {
                return Err(format!("State {} already exists", name));
            }
            backend.state(&name).await.map_err(|e| e.to_string())?;
            println!("{}", format!("Created state {}.", name).green());
            Ok(())
        }
        StateCommands::Delete { name } => {
            backend
                .delete_state(&name)
                .await
                .map_err(|e| e.to_string())?;
            println!("{}", format!("Deleted state {}.", name).green());
            Ok(())
        }
        StateCommands::Show { name } => {
            let manager = open_state(backend, &name).await?;
            match manager.state() {
                Some(state) => {
                    let json = serde_json::to_string_pretty(state).map_err(|e| e.to_string())?;
                    println!("{}", json);
                }
                None => println!("{}", "State is empty.".yellow()),
            }
            Ok(())
        }
    }
}

/// Open an existing state; `Backend::state` would create a mistyped name
async fn open_state(backend: &dyn Backend, name: &str) -> Result<Box<dyn StateManager>, String> {
    match backend.states().await {
        Ok(states) if !states.iter().any(|s| s == name) => {
            return Err(format!("State {} does not exist", name));
        }
        Ok(_) => {}
        Err(BackendError::NamedStatesNotSupported) if name != DEFAULT_STATE_NAME => {
            return Err(format!(
                "State {} does not exist (backend has a single state)",
                name
            ));
        }
        Err(BackendError::NamedStatesNotSupported) => {}
        Err(e) => return Err(e.to_string()),
    }

    let mut manager = backend.state(name).await.map_err(|e| e.to_string())?;
    manager
        .refresh_state()
        .await
        .map_err(|e| format!("Failed to read state {}: {}", name, e))?;
    Ok(manager)
}

fn require_locker<'a>(manager: &'a dyn StateManager) -> Result<&'a dyn Locker, String> {
    manager
        .as_locker()
        .ok_or_else(|| "This backend does not support state locking".to_string())
}

async fn run_lock(backend: &dyn Backend, state: &str, operation: &str) -> Result<(), String> {
    let manager = open_state(backend, state).await?;
    let locker = require_locker(manager.as_ref())?;

    let lock_id = locker
        .lock(&LockInfo::new(operation))
        .await
        .map_err(|e| e.to_string())?;

    if lock_id.is_empty() {
        println!("{}", "Locking is disabled for this backend.".yellow());
    } else {
        println!("{}", "Lock acquired.".green().bold());
        println!("{}", lock_id);
    }
    Ok(())
}

async fn run_unlock(
    backend: &dyn Backend,
    state: &str,
    lock_id: &str,
    force: bool,
) -> Result<(), String> {
    let manager = open_state(backend, state).await?;
    let locker = require_locker(manager.as_ref())?;

    let result = if force {
        locker.force_unlock(lock_id).await
    } else {
        locker.unlock(lock_id).await
    };
    result.map_err(|e| e.to_string())?;

    println!("{}", format!("Released lock {}.", lock_id).green());
    Ok(())
}
