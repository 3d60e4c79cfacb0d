//! rexec CLI
//!
//! Talks to Unreal Engine editors with the Python remote execution plugin
//! enabled:
//! - `nodes` lists the editors answering on the discovery group
//! - `exec` runs Python in one of them
//! - `config` manages the endpoint configuration file

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use rexec::commands::{self, ExecOptions};
use rexec::output::print_error;
use rexec_core::config::{self, RemoteExecutionConfig};
use rexec_protocol::ExecMode;

#[derive(Parser)]
#[command(name = "rexec")]
#[command(author, version, about = "Run Python in Unreal Engine editors over remote execution")]
#[command(propagate_version = true)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose output (repeat for more)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Log filter (overrides -v/-q; RUST_LOG overrides this)
    #[arg(long, global = true, env = "REXEC_LOG_LEVEL")]
    log_level: Option<String>,

    /// Multicast group endpoint (overrides config)
    #[arg(long, global = true)]
    multicast_group: Option<SocketAddrV4>,

    /// Adapter address for the discovery socket (overrides config)
    #[arg(long, global = true)]
    multicast_bind: Option<Ipv4Addr>,

    /// Multicast TTL (overrides config)
    #[arg(long, global = true)]
    multicast_ttl: Option<u32>,

    /// Command endpoint nodes dial back to (overrides config)
    #[arg(long, global = true)]
    command_endpoint: Option<SocketAddr>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List engine nodes answering on the discovery group
    Nodes {
        /// Seconds to listen for answers
        #[arg(short, long, default_value_t = 2)]
        wait: u64,
        /// Show detailed information
        #[arg(short, long)]
        long: bool,
        /// Print the nodes as JSON
        #[arg(long)]
        json: bool,
    },

    /// Execute Python on an engine node
    Exec {
        /// Python code to run, or '-' to read it from stdin
        code: Option<String>,
        /// Script file to send
        #[arg(short, long, conflicts_with = "code")]
        file: Option<PathBuf>,
        /// Execution mode: file, statement or eval
        #[arg(short, long)]
        mode: Option<ExecMode>,
        /// Node id or project name (defaults to the first node found)
        #[arg(short, long)]
        node: Option<String>,
        /// Seconds to wait for discovery and for the node to connect
        /// (defaults to connect_timeout from the config)
        #[arg(short, long)]
        timeout: Option<u64>,
        /// Allow the editor to show dialogs while the command runs
        #[arg(long)]
        attended: bool,
    },

    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Show the effective configuration
    Show,
    /// Create a default configuration file
    Init {
        /// Overwrite an existing file
        #[arg(short, long)]
        force: bool,
    },
    /// Show config file path
    Path,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    // Setup logging based on verbosity
    let log_level = match (cli.log_level.as_deref(), cli.quiet, cli.verbose) {
        (Some(level), _, _) => level,
        (None, true, _) => "error",
        (None, false, 0) => "warn",
        (None, false, 1) => "info",
        (None, false, 2) => "debug",
        (None, false, _) => "trace",
    };

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| log_level.into()),
        ))
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();

    match &cli.command {
        Commands::Config {
            action: ConfigAction::Init { force },
        } => {
            commands::config_init(cli.config.as_deref(), *force)?;
            return Ok(ExitCode::SUCCESS);
        }
        Commands::Config {
            action: ConfigAction::Path,
        } => {
            commands::config_path(cli.config.as_deref())?;
            return Ok(ExitCode::SUCCESS);
        }
        _ => {}
    }

    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            print_error(&format!("{:#}", e));
            return Ok(ExitCode::FAILURE);
        }
    };

    match cli.command {
        Commands::Nodes { wait, long, json } => {
            commands::nodes_command(config, Duration::from_secs(wait), long, json).await?;
        }

        Commands::Exec {
            code,
            file,
            mode,
            node,
            timeout,
            attended,
        } => {
            let options = ExecOptions {
                code,
                file,
                mode,
                node,
                timeout: timeout.map(Duration::from_secs),
                unattended: !attended,
            };
            match commands::exec_command(config, options).await {
                Ok(true) => {}
                Ok(false) => return Ok(ExitCode::FAILURE),
                Err(e) => {
                    print_error(&format!("{:#}", e));
                    return Ok(ExitCode::FAILURE);
                }
            }
        }

        Commands::Config { action } => match action {
            ConfigAction::Show => commands::config_show(cli.config.as_deref(), &config)?,
            ConfigAction::Init { .. } | ConfigAction::Path => {}
        },
    }

    Ok(ExitCode::SUCCESS)
}

/// Load the config file (if any) and apply command-line overrides
fn load_config(cli: &Cli) -> Result<RemoteExecutionConfig> {
    let mut config = config::load_or_default(cli.config.as_deref())
        .context("Failed to load configuration")?;

    if let Some(group) = cli.multicast_group {
        config.multicast_group_endpoint = group;
    }
    if let Some(bind) = cli.multicast_bind {
        config.multicast_bind_address = bind;
    }
    if let Some(ttl) = cli.multicast_ttl {
        config.multicast_ttl = ttl;
    }
    if let Some(endpoint) = cli.command_endpoint {
        config.command_endpoint = endpoint;
    }

    config.validate().context("Invalid configuration")?;
    Ok(config)
}
