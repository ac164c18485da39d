//! CLI command implementations.

pub mod groups;
pub mod jobs;
pub mod simulate;

use anyhow::{Context, Result};
use slotlock_config::{SystemConfig, load_system_config};
use slotlock_db::{PgPool, create_pool, run_migrations};
use std::path::Path;
use tracing::{debug, info};

/// Load the configuration file, falling back to defaults when it is absent.
/// `database_url` overrides the file.
pub fn load_config(path: &Path, database_url: Option<String>) -> Result<SystemConfig> {
    let mut config = if path.exists() {
        load_system_config(path)
            .with_context(|| format!("Failed to load config file: {}", path.display()))?
    } else {
        debug!(path = %path.display(), "No config file, using defaults");
        SystemConfig::default()
    };
    if database_url.is_some() {
        config.database.url = database_url;
    }
    Ok(config)
}

pub async fn connect(config: &SystemConfig) -> Result<PgPool> {
    let url = config
        .database
        .url
        .as_deref()
        .context("No database URL; set DATABASE_URL or `database url=...` in the config")?;
    let pool = create_pool(url, config.database.max_connections)
        .await
        .context("Failed to connect to database")?;
    Ok(pool)
}

pub async fn migrate(config: &SystemConfig) -> Result<()> {
    let pool = connect(config).await?;
    run_migrations(&pool).await.context("Migration failed")?;
    info!("Migrations applied");
    Ok(())
}

pub fn validate(path: &Path) -> Result<()> {
    match load_system_config(path) {
        Ok(config) => {
            println!("Configuration is valid");
            println!("  worker: {} (concurrency {})", config.worker.id, config.worker.concurrency);
            println!(
                "  deduplication: including scheduled {}, reschedule delay {}ms",
                config.deduplication.including_scheduled, config.deduplication.reschedule_delay_ms
            );
            println!(
                "  retry: {} attempts, {}ms base delay",
                config.retry.max_attempts, config.retry.base_delay_ms
            );
            Ok(())
        }
        Err(e) => {
            println!("Configuration error: {}", e);
            std::process::exit(1);
        }
    }
}
