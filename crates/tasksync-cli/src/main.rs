//! tasksync CLI
//!
//! Command-line interface for the tasksync offline-first sync engine.

use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use tasksync_core::{Config, StorageError, Store};

mod commands;
mod output;

use output::{Output, OutputFormat};

#[derive(Parser)]
#[command(name = "tasksync")]
#[command(about = "tasksync - offline-first task sync")]
#[command(version)]
#[command(propagate_version = true)]
struct Cli {
    /// Output as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Quiet mode - minimal output
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Log sync activity to stderr
    #[arg(short, long, global = true)]
    verbose: bool,

    /// User whose ledger to operate on (defaults to user_id from config)
    #[arg(long, global = true)]
    user: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Push pending operations and pull remote changes
    Sync,
    /// Show sync status
    Status,
    /// Inspect or repair pending operations
    Pending {
        #[command(subcommand)]
        command: Option<PendingCommands>,
    },
    /// Manage stored API tokens
    Auth {
        #[command(subcommand)]
        command: AuthCommands,
    },
    /// Show or set configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand)]
enum PendingCommands {
    /// List pending operations
    #[command(alias = "ls")]
    List,
    /// Requeue a failed operation
    Retry {
        /// Operation ID
        id: i64,
    },
    /// Drop an operation without sending it
    #[command(alias = "rm")]
    Discard {
        /// Operation ID
        id: i64,
    },
}

#[derive(Subcommand)]
enum AuthCommands {
    /// Store an access/refresh token pair
    Set {
        #[arg(long)]
        access_token: String,
        #[arg(long)]
        refresh_token: String,
    },
    /// Remove stored tokens
    Clear,
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Show current configuration
    Show,
    /// Set a configuration value
    Set {
        /// Configuration key (api_url, user_id, retry.max_attempts, ...)
        key: String,
        /// Configuration value
        value: String,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    let output = Output::new(OutputFormat::from_flags(cli.json, cli.quiet));

    match run(cli, &output).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            output.error(&error, recovery_hint(&error));
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli, output: &Output) -> Result<()> {
    // Commands that don't need the store
    let command = match cli.command {
        Commands::Config { command } => return handle_config_command(command, output),
        Commands::Auth { command } => {
            let config = Config::load().context("Failed to load configuration")?;
            return match command {
                AuthCommands::Set {
                    access_token,
                    refresh_token,
                } => commands::auth::set(&config, access_token, refresh_token, output),
                AuthCommands::Clear => commands::auth::clear(&config, output),
            };
        }
        other => other,
    };

    let config = Config::load().context("Failed to load configuration")?;
    let user_id = resolve_user(cli.user, &config)?;
    let store = Store::open(&config, user_id)?;

    match command {
        Commands::Sync => commands::sync::sync(&store, &config, output).await,
        Commands::Status => commands::status::show(&store, &config, output).await,
        Commands::Pending { command } => match command {
            Some(PendingCommands::List) | None => commands::pending::list(&store, output).await,
            Some(PendingCommands::Retry { id }) => {
                commands::pending::retry(&store, id, output).await
            }
            Some(PendingCommands::Discard { id }) => {
                commands::pending::discard(&store, id, output).await
            }
        },
        Commands::Config { .. } | Commands::Auth { .. } => unreachable!(), // Handled above
    }
}

fn handle_config_command(command: Option<ConfigCommands>, output: &Output) -> Result<()> {
    match command {
        Some(ConfigCommands::Show) | None => commands::config::show(output),
        Some(ConfigCommands::Set { key, value }) => commands::config::set(key, value, output),
    }
}

fn resolve_user(flag: Option<String>, config: &Config) -> Result<String> {
    flag.or_else(|| config.user_id.clone()).context(
        "No user configured. Pass --user or set one with:\n  \
         tasksync config set user_id <id>",
    )
}

/// Suggestion for the first storage error in the chain, if it has one
fn recovery_hint(error: &anyhow::Error) -> Option<&'static str> {
    error
        .chain()
        .find_map(|cause| cause.downcast_ref::<StorageError>())
        .and_then(StorageError::recovery_suggestion)
}

/// Log to stderr; `RUST_LOG` wins over `--verbose`
fn init_logging(verbose: bool) {
    let default = if verbose {
        "tasksync_core=debug,tasksync=debug"
    } else {
        "warn"
    };
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_pending_retry() {
        let cli = Cli::try_parse_from(["tasksync", "--json", "pending", "retry", "42"]).unwrap();
        assert!(cli.json);
        assert!(matches!(
            cli.command,
            Commands::Pending {
                command: Some(PendingCommands::Retry { id: 42 })
            }
        ));
    }

    #[test]
    fn test_cli_parses_auth_set() {
        let cli = Cli::try_parse_from([
            "tasksync",
            "auth",
            "set",
            "--access-token",
            "a",
            "--refresh-token",
            "r",
        ])
        .unwrap();
        match cli.command {
            Commands::Auth {
                command:
                    AuthCommands::Set {
                        access_token,
                        refresh_token,
                    },
            } => {
                assert_eq!(access_token, "a");
                assert_eq!(refresh_token, "r");
            }
            _ => panic!("expected auth set"),
        }
    }

    #[test]
    fn test_resolve_user_prefers_flag() {
        let config = Config {
            user_id: Some("from-config".to_string()),
            ..Config::default()
        };
        assert_eq!(
            resolve_user(Some("flag".to_string()), &config).unwrap(),
            "flag"
        );
        assert_eq!(resolve_user(None, &config).unwrap(), "from-config");
        assert!(resolve_user(None, &Config::default()).is_err());
    }

    #[test]
    fn test_recovery_hint_found_through_context() {
        let error = anyhow::Error::new(StorageError::OperationNotFound(7))
            .context("Failed to discard operation");
        assert!(recovery_hint(&error).unwrap().contains("pending list"));

        let error = anyhow::anyhow!("network is down");
        assert!(recovery_hint(&error).is_none());
    }

    #[test]
    fn test_verify_cli() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }
}
