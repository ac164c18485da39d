//! Runs builds through a resource group held in memory.

use anyhow::{Context, Result};
use slotlock_config::{SystemConfig, VariableContextBuilder, expand_resource_group_key};
use slotlock_core::{BuildStatus, ProcessMode, ResourceId};
use slotlock_db::{BuildRepo, MemoryStore, NewBuild, ProjectRepo, ResourceGroupRepo};
use slotlock_scheduler::{
    AssignResourceFromResourceGroupWorkerV2, DeduplicationOptions, MemoryJobQueue, ResourceEvent,
    ResourceGroupLifecycle, WorkerRegistry, WorkerRunner,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

fn print_events(rx: &mut mpsc::Receiver<ResourceEvent>) {
    while let Ok(event) = rx.try_recv() {
        match event {
            ResourceEvent::Assigned {
                build_id, status, ..
            } => println!("  assigned -> {} ({})", build_id, status),
            ResourceEvent::Released { build_id, .. } => println!("  released <- {}", build_id),
        }
    }
}

pub async fn run(
    config: &SystemConfig,
    process_mode: ProcessMode,
    builds: usize,
    key: &str,
    environment: &str,
) -> Result<()> {
    let ctx = VariableContextBuilder::new()
        .with_environment(environment)
        .build();
    let key = expand_resource_group_key(key, &ctx).context("Invalid resource group key")?;

    let store = Arc::new(MemoryStore::new());
    let queue = Arc::new(MemoryJobQueue::new());
    let (tx, mut rx) = mpsc::channel(64);

    // Follow-ups run immediately so the simulation drains in one pass
    let deduplication = DeduplicationOptions::from_config(&config.deduplication)
        .with_reschedule_delay(Duration::ZERO);
    let worker = AssignResourceFromResourceGroupWorkerV2::new(store.clone(), store.clone())
        .with_deduplication(deduplication)
        .with_events(tx.clone());
    let runner = WorkerRunner::new(
        queue.clone(),
        WorkerRegistry::new().register(Arc::new(worker)),
        config.worker.clone(),
    )
    .with_retry(config.retry.clone());
    let lifecycle = ResourceGroupLifecycle::new(store.clone(), store.clone(), queue.clone())
        .with_deduplication(deduplication)
        .with_events(tx);

    let project = store.create_project("simulation").await?;
    let group = store
        .find_or_create_by_key(project.id, &key, process_mode)
        .await?;
    println!("Resource group {} ({})", group.key, group.process_mode);

    let pipeline_id = ResourceId::new();
    for i in 1..=builds {
        let build = store
            .create_build(
                NewBuild::new(project.id, pipeline_id, format!("deploy-{}", i))
                    .resource_group(group.id),
            )
            .await?;
        let outcome = lifecycle.request_resource(build.id).await?;
        println!("{} requests resource: {}", build.name, outcome);
    }

    loop {
        let processed = runner.run_until_idle().await?;
        print_events(&mut rx);

        let Some(holder) = store.resource(group.id).await?.build_id else {
            if processed == 0 {
                break;
            }
            continue;
        };

        let build = store.get_build(holder).await?;
        println!("{} runs", build.name);
        store
            .transition_build(holder, build.status, BuildStatus::Running)
            .await?;
        store
            .transition_build(holder, BuildStatus::Running, BuildStatus::Success)
            .await?;
        lifecycle.build_finished(holder).await?;
    }

    let stranded = store
        .builds_with_status(group.id, BuildStatus::WaitingForResource)
        .await?;
    println!(
        "Done: {} build(s), {} assignment job(s) completed, {} still waiting",
        builds,
        queue.completed_len().await,
        stranded.len()
    );
    Ok(())
}
