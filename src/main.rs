use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use gatefleet::config::Config;
use gatefleet::models::{NewNode, NewTariff, Protocol, Role};

mod commands;

#[derive(Parser)]
#[command(
    name = "gatefleet",
    version,
    about = "Gateway fleet orchestrator: credential placement, bans and reconciliation",
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// TOML configuration file; GATEFLEET_* environment variables otherwise
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log format (text, json)
    #[arg(long, global = true)]
    log_format: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the REST API and run the reconciliation loop
    Serve {
        /// Do not start the reconciliation loop
        #[arg(long, default_value = "false")]
        without_reconcile: bool,
    },

    /// Run reconciliation without the API
    Reconcile {
        /// Run a single cycle and print its report
        #[arg(long, default_value = "false")]
        once: bool,
    },

    /// Manage gateway nodes
    Node {
        #[command(subcommand)]
        command: NodeCommands,
    },

    /// Manage tariffs
    Tariff {
        #[command(subcommand)]
        command: TariffCommands,
    },

    /// Manage user accounts
    User {
        #[command(subcommand)]
        command: UserCommands,
    },

    /// Print fleet statistics
    Stats,
}

#[derive(Subcommand)]
enum NodeCommands {
    /// Register a node
    Add {
        #[arg(long)]
        name: String,

        /// Base URL of the node's control endpoint
        #[arg(long)]
        endpoint: String,

        #[arg(long)]
        username: String,

        #[arg(long)]
        password: String,

        /// Host clients connect to
        #[arg(long)]
        public_host: String,

        #[arg(long, default_value = "443")]
        public_port: u16,

        /// vless, vmess or trojan
        #[arg(long, default_value = "vless")]
        protocol: Protocol,

        #[arg(long, default_value = "100")]
        capacity: u32,

        #[arg(long)]
        location: Option<String>,
    },

    /// List nodes with their load
    List {
        #[arg(long, default_value = "false")]
        json: bool,
    },

    /// Revoke every credential on a node and deactivate it
    Retire {
        id: i64,

        /// Administrator performing the retirement
        #[arg(long)]
        actor: i64,
    },
}

#[derive(Subcommand)]
enum TariffCommands {
    Add {
        #[arg(long)]
        name: String,

        #[arg(long)]
        days: u32,

        #[arg(long)]
        traffic_gb: u64,

        #[arg(long, default_value = "0")]
        price: f64,
    },

    List {
        /// Include retired tariffs
        #[arg(long, default_value = "false")]
        all: bool,
    },
}

#[derive(Subcommand)]
enum UserCommands {
    /// Create a user, or update the role of an existing one
    Add {
        id: i64,

        #[arg(long)]
        username: Option<String>,

        #[arg(long, default_value = "user")]
        role: Role,
    },

    /// Change a user's role
    Role { id: i64, role: Role },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => Config::from_env().context("Failed to load config from environment")?,
    };
    config.validate().context("Invalid configuration")?;

    let log_format = cli
        .log_format
        .clone()
        .unwrap_or_else(|| config.logging.format.clone());
    setup_tracing(&log_format, &config.logging.level, cli.verbose)?;

    match cli.command {
        Commands::Serve { without_reconcile } => {
            tracing::info!(db = %config.database.path.display(), "Starting gatefleet server");
            commands::serve(config, without_reconcile).await?;
        }

        Commands::Reconcile { once } => {
            tracing::info!(once, "Starting reconciliation");
            commands::reconcile(config, once).await?;
        }

        Commands::Node { command } => match command {
            NodeCommands::Add {
                name,
                endpoint,
                username,
                password,
                public_host,
                public_port,
                protocol,
                capacity,
                location,
            } => {
                let node = NewNode {
                    name,
                    endpoint,
                    username,
                    password,
                    location,
                    public_host,
                    public_port,
                    protocol,
                    max_capacity: capacity,
                };
                commands::node_add(config, node).await?;
            }
            NodeCommands::List { json } => commands::node_list(config, json).await?,
            NodeCommands::Retire { id, actor } => commands::node_retire(config, id, actor).await?,
        },

        Commands::Tariff { command } => match command {
            TariffCommands::Add {
                name,
                days,
                traffic_gb,
                price,
            } => {
                let tariff = NewTariff {
                    name,
                    duration_days: days,
                    traffic_gb,
                    price,
                };
                commands::tariff_add(config, tariff).await?;
            }
            TariffCommands::List { all } => commands::tariff_list(config, all).await?,
        },

        Commands::User { command } => match command {
            UserCommands::Add { id, username, role } => {
                commands::user_add(config, id, username, role).await?;
            }
            UserCommands::Role { id, role } => commands::user_role(config, id, role).await?,
        },

        Commands::Stats => commands::stats(config).await?,
    }

    Ok(())
}

fn setup_tracing(format: &str, level: &str, verbose: bool) -> Result<()> {
    let default_filter = if verbose {
        "gatefleet=debug,info".to_string()
    } else {
        format!("gatefleet={level},warn")
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_env("GATEFLEET_LOG")
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter));

    match format {
        "json" => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().json())
                .try_init()
                .context("Failed to install tracing subscriber")?;
        }
        _ => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().pretty())
                .try_init()
                .context("Failed to install tracing subscriber")?;
        }
    }

    Ok(())
}
