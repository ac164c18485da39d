//! SlotLock CLI tool.

use clap::{Parser, Subcommand};
use slotlock_core::{ProcessMode, ResourceId};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod commands;

#[derive(Parser)]
#[command(name = "slotlock")]
#[command(about = "Single-slot resource groups for CI builds", long_about = None)]
struct Cli {
    /// System configuration file
    #[arg(long, short, env = "SLOTLOCK_CONFIG", default_value = "slotlock.kdl")]
    config: PathBuf,

    /// Database URL, overrides the configuration file
    #[arg(long, env = "DATABASE_URL")]
    database_url: Option<String>,

    /// Emit logs as JSON
    #[arg(long)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run database migrations
    Migrate,
    /// Process assignment jobs until Ctrl-C
    Worker {
        /// Jobs processed in parallel
        #[arg(long)]
        concurrency: Option<usize>,
        /// Worker identity recorded on claimed jobs
        #[arg(long)]
        worker_id: Option<String>,
    },
    /// Enqueue an assignment for a resource group
    Enqueue {
        /// Resource group ID
        resource_group_id: ResourceId,
    },
    /// Run an assignment for a resource group now
    Assign {
        /// Resource group ID
        resource_group_id: ResourceId,
    },
    /// Show a resource group's holder and backlog
    Status {
        /// Resource group ID
        resource_group_id: ResourceId,
    },
    /// Process every due job once, then exit
    Drain,
    /// Validate a system configuration file
    Validate {
        /// Path to the configuration file
        #[arg(default_value = "slotlock.kdl")]
        path: PathBuf,
    },
    /// Run builds through an in-memory resource group
    Simulate {
        /// Process mode of the group
        #[arg(long, default_value = "oldest_first")]
        process_mode: ProcessMode,
        /// Number of builds competing for the resource
        #[arg(long, default_value = "3")]
        builds: usize,
        /// Resource group key, may reference CI variables
        #[arg(long, default_value = "deploy-$CI_ENVIRONMENT_NAME")]
        key: String,
        /// Value of CI_ENVIRONMENT_NAME
        #[arg(long, default_value = "production")]
        environment: String,
    },
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json_logs);

    if let Commands::Validate { path } = &cli.command {
        return commands::validate(path);
    }

    let config = commands::load_config(&cli.config, cli.database_url)?;

    match cli.command {
        Commands::Migrate => commands::migrate(&config).await?,
        Commands::Worker {
            concurrency,
            worker_id,
        } => {
            commands::jobs::worker(config, concurrency, worker_id).await?;
        }
        Commands::Enqueue { resource_group_id } => {
            commands::jobs::enqueue(&config, resource_group_id).await?;
        }
        Commands::Drain => commands::jobs::drain(&config).await?,
        Commands::Assign { resource_group_id } => {
            commands::groups::assign(&config, resource_group_id).await?;
        }
        Commands::Status { resource_group_id } => {
            commands::groups::status(&config, resource_group_id).await?;
        }
        Commands::Simulate {
            process_mode,
            builds,
            key,
            environment,
        } => {
            commands::simulate::run(&config, process_mode, builds, &key, &environment).await?;
        }
        Commands::Validate { .. } => {}
    }

    Ok(())
}
