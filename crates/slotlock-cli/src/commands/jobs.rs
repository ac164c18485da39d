//! Job queue commands.

use anyhow::Result;
use slotlock_config::SystemConfig;
use slotlock_core::ResourceId;
use slotlock_db::{PgProjectRepo, PgResourceGroupRepo, PgPool};
use slotlock_scheduler::{
    AssignResourceFromResourceGroupWorker, AssignResourceFromResourceGroupWorkerV2,
    DeduplicationOptions, PgJobQueue, WorkerRegistry, WorkerRunner,
    enqueue_resource_group_assignment,
};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};

use super::connect;

fn runner(pool: PgPool, config: &SystemConfig) -> WorkerRunner {
    let projects = Arc::new(PgProjectRepo::new(pool.clone()));
    let groups = Arc::new(PgResourceGroupRepo::new(pool.clone()));

    let v1 = AssignResourceFromResourceGroupWorker::new(projects.clone(), groups.clone());
    let v2 = AssignResourceFromResourceGroupWorkerV2::new(projects, groups)
        .with_deduplication(DeduplicationOptions::from_config(&config.deduplication));
    let registry = WorkerRegistry::new()
        .register(Arc::new(v1))
        .register(Arc::new(v2));

    WorkerRunner::new(
        Arc::new(PgJobQueue::new(pool)),
        registry,
        config.worker.clone(),
    )
    .with_retry(config.retry.clone())
}

pub async fn worker(
    mut config: SystemConfig,
    concurrency: Option<usize>,
    worker_id: Option<String>,
) -> Result<()> {
    if let Some(concurrency) = concurrency {
        config.worker.concurrency = concurrency;
    }
    if let Some(worker_id) = worker_id {
        config.worker.id = worker_id;
    }

    let pool = connect(&config).await?;
    let runner = runner(pool, &config);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl-C");
            return;
        }
        info!("Shutting down");
        let _ = shutdown_tx.send(true);
    });

    runner.run(shutdown_rx).await;
    Ok(())
}

pub async fn enqueue(config: &SystemConfig, resource_group_id: ResourceId) -> Result<()> {
    let pool = connect(config).await?;
    let queue = PgJobQueue::new(pool);
    let outcome = enqueue_resource_group_assignment(
        &queue,
        resource_group_id,
        DeduplicationOptions::from_config(&config.deduplication),
    )
    .await?;
    println!("{}", outcome);
    Ok(())
}

pub async fn drain(config: &SystemConfig) -> Result<()> {
    let pool = connect(config).await?;
    let processed = runner(pool, config).run_until_idle().await?;
    println!("Processed {} job(s)", processed);
    Ok(())
}
