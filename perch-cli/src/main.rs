//! Perch CLI

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use perch_client::{Client, ClientConfig, TokenOptions};
use perch_director::{DirectorConfig, DirectorServer, DirectorState, SignalHandler};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "perch")]
#[command(about = "Perch federated data access", long_about = None)]
#[command(version)]
struct Cli {
    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "warn", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Work with federation objects
    Object {
        #[command(subcommand)]
        command: ObjectCommands,
    },

    /// Run federation services
    Director {
        #[command(subcommand)]
        command: DirectorCommands,
    },
}

#[derive(Args, Clone)]
struct TransferArgs {
    /// Bearer token to present
    #[arg(long)]
    token: Option<String>,

    /// File holding the bearer token
    #[arg(long)]
    token_location: Option<PathBuf>,

    /// Transfer directory trees
    #[arg(long, short)]
    recursive: bool,

    /// Require the cache path rather than the origin
    #[arg(long)]
    cache: bool,

    /// Caches to try first; end with '+' to fall back to the
    /// director's list
    #[arg(long, value_delimiter = ',')]
    preferred_caches: Vec<String>,

    /// Bypass caches and read the origin directly
    #[arg(long)]
    directread: bool,

    /// Discovery URL for schemeless object paths
    #[arg(long)]
    federation: Option<String>,
}

#[derive(Subcommand)]
enum ObjectCommands {
    /// Download an object
    Get {
        /// Federation URL of the object
        remote: String,
        /// Local destination path
        local: PathBuf,
        #[command(flatten)]
        transfer: TransferArgs,
    },

    /// Upload an object
    Put {
        /// Local source path
        local: PathBuf,
        /// Federation URL of the destination
        remote: String,
        #[command(flatten)]
        transfer: TransferArgs,
    },

    /// Copy to or from the federation
    Copy {
        /// Source (local path or federation URL)
        source: String,
        /// Destination (local path or federation URL)
        destination: String,
        #[command(flatten)]
        transfer: TransferArgs,
    },

    /// List a collection
    Ls {
        /// Federation URL of the collection
        remote: String,
        #[command(flatten)]
        transfer: TransferArgs,
    },

    /// Show object metadata
    Stat {
        /// Federation URL of the object
        remote: String,
        #[command(flatten)]
        transfer: TransferArgs,
    },

    /// Delete an object
    Rm {
        /// Federation URL of the object
        remote: String,
        #[command(flatten)]
        transfer: TransferArgs,
    },
}

#[derive(Subcommand)]
enum DirectorCommands {
    /// Serve the federation director
    Serve {
        /// Path to configuration file
        #[arg(short, long, default_value = "director.yaml")]
        config: PathBuf,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    if let Err(e) = init_tracing(&cli.log_level) {
        eprintln!("cannot initialize logging: {e}");
        return ExitCode::from(1);
    }

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("cannot start runtime: {e}");
            return ExitCode::from(1);
        }
    };

    match runtime.block_on(run(cli.command)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("perch: {e}");
            let code = e
                .downcast_ref::<perch_core::Error>()
                .map(perch_core::Error::exit_code)
                .unwrap_or(1);
            ExitCode::from(code as u8)
        }
    }
}

async fn run(command: Commands) -> Result<()> {
    match command {
        Commands::Object { command } => run_object(command).await,
        Commands::Director { command } => run_director(command).await,
    }
}

fn client_for(transfer: &TransferArgs) -> Client {
    Client::new(ClientConfig {
        discovery_url: transfer.federation.clone(),
        preferred_caches: transfer.preferred_caches.clone(),
        token: TokenOptions {
            value: transfer.token.clone(),
            location: transfer.token_location.clone(),
        },
        ..Default::default()
    })
}

/// Append URL options implied by flags that have no dedicated CLI
/// surface on the director side.
fn apply_url_flags(remote: &str, transfer: &TransferArgs) -> String {
    let mut flags = Vec::new();
    if transfer.directread {
        flags.push("directread");
    }
    if transfer.cache {
        flags.push("prefercached");
    }
    if transfer.recursive {
        flags.push("recursive");
    }
    if flags.is_empty() {
        return remote.to_string();
    }
    let separator = if remote.contains('?') { '&' } else { '?' };
    format!("{remote}{separator}{}", flags.join("&"))
}

async fn run_object(command: ObjectCommands) -> Result<()> {
    match command {
        ObjectCommands::Get {
            remote,
            local,
            transfer,
        } => {
            let client = client_for(&transfer);
            let remote = apply_url_flags(&remote, &transfer);
            if transfer.recursive {
                let results = client.get_recursive(&remote, &local).await?;
                for result in &results {
                    println!("{}\t{} bytes", result.remote_path, result.bytes_transferred);
                }
            } else {
                let result = client.get(&remote, &local).await?;
                if let Some(error) = result.error {
                    return Err(error.into());
                }
                println!("{} bytes", result.bytes_transferred);
            }
            Ok(())
        }

        ObjectCommands::Put {
            local,
            remote,
            transfer,
        } => {
            let client = client_for(&transfer);
            let remote = apply_url_flags(&remote, &transfer);
            if transfer.recursive {
                let results = client.put_recursive(&local, &remote).await?;
                for result in &results {
                    println!("{}\t{} bytes", result.remote_path, result.bytes_transferred);
                }
            } else {
                let result = client.put(&local, &remote).await?;
                if let Some(error) = result.error {
                    return Err(error.into());
                }
                println!("{} bytes", result.bytes_transferred);
            }
            Ok(())
        }

        ObjectCommands::Copy {
            source,
            destination,
            transfer,
        } => {
            let client = client_for(&transfer);
            let result = client.copy(&source, &destination).await?;
            if let Some(error) = result.error {
                return Err(error.into());
            }
            println!("{} bytes", result.bytes_transferred);
            Ok(())
        }

        ObjectCommands::Ls { remote, transfer } => {
            let client = client_for(&transfer);
            let entries = client.list(&remote).await?;
            for entry in entries {
                println!("{entry}");
            }
            Ok(())
        }

        ObjectCommands::Stat { remote, transfer } => {
            let client = client_for(&transfer);
            let stat = client.stat(&remote).await?;
            println!("size: {} bytes", stat.size);
            if let Some(mtime) = stat.mtime {
                println!("modified: {mtime}");
            }
            println!("server: {}", stat.server);
            Ok(())
        }

        ObjectCommands::Rm { remote, transfer } => {
            let client = client_for(&transfer);
            client.remove(&remote).await?;
            Ok(())
        }
    }
}

async fn run_director(command: DirectorCommands) -> Result<()> {
    match command {
        DirectorCommands::Serve { config } => {
            tracing::info!("starting perch director");
            tracing::info!("config file: {}", config.display());

            let config = DirectorConfig::load(&config)?;
            let state = DirectorState::new(config);
            state.init();

            let shutdown = state.shutdown.clone();
            tokio::spawn(async move {
                let handler = SignalHandler::new(shutdown);
                handler.run().await;
            });

            let server = DirectorServer::new(std::sync::Arc::clone(&state));
            server.run().await?;

            state.drain().await;
            tracing::info!("director stopped");
            Ok(())
        }
    }
}

fn init_tracing(level: &str) -> Result<()> {
    let filter = match level.to_lowercase().as_str() {
        "trace" => tracing::Level::TRACE,
        "debug" => tracing::Level::DEBUG,
        "info" => tracing::Level::INFO,
        "warn" => tracing::Level::WARN,
        "error" => tracing::Level::ERROR,
        _ => tracing::Level::WARN,
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_level(true),
        )
        .with(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(filter.into()),
        )
        .init();

    Ok(())
}
