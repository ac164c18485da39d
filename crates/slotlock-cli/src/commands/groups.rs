//! Resource group commands.

use anyhow::{Context, Result};
use slotlock_config::SystemConfig;
use slotlock_core::{BuildStatus, ResourceId};
use slotlock_db::{BuildRepo, PgBuildRepo, PgProjectRepo, PgResourceGroupRepo, ProjectRepo, ResourceGroupRepo};
use slotlock_scheduler::{AssignResourceFromResourceGroupService, sort_backlog};
use std::sync::Arc;

use super::connect;

/// Run the assignment service once, bound to the group's project.
pub async fn assign(config: &SystemConfig, resource_group_id: ResourceId) -> Result<()> {
    let pool = connect(config).await?;
    let groups = Arc::new(PgResourceGroupRepo::new(pool.clone()));
    let projects = PgProjectRepo::new(pool);

    let group = groups
        .get_resource_group(resource_group_id)
        .await
        .context("Resource group not found")?;
    let project = projects.get_project(group.project_id).await?;

    let service = AssignResourceFromResourceGroupService::new(project, None, groups);
    let outcome = service.execute(&group).await?;
    println!("{}: {}", group.key, outcome);
    Ok(())
}

pub async fn status(config: &SystemConfig, resource_group_id: ResourceId) -> Result<()> {
    let pool = connect(config).await?;
    let groups = PgResourceGroupRepo::new(pool.clone());
    let builds = PgBuildRepo::new(pool);

    let group = groups
        .get_resource_group(resource_group_id)
        .await
        .context("Resource group not found")?;
    let resource = groups.resource(group.id).await?;

    println!("Resource group: {} ({})", group.key, group.id);
    println!("Process mode:   {}", group.process_mode);
    match resource.build_id {
        Some(holder) => {
            let build = builds.get_build(holder).await?;
            println!("Holder:         {} {} [{}]", build.id, build.name, build.status);
        }
        None => println!("Holder:         none"),
    }

    let mut waiting = groups
        .builds_with_status(group.id, BuildStatus::WaitingForResource)
        .await?;
    sort_backlog(group.process_mode, &mut waiting);

    if waiting.is_empty() {
        println!("Waiting:        none");
    } else {
        println!("Waiting ({}):", waiting.len());
        for (position, build) in waiting.iter().enumerate() {
            println!(
                "  {:>3}. {} {} (created {})",
                position + 1,
                build.id,
                build.name,
                build.created_at.format("%Y-%m-%d %H:%M:%S")
            );
        }
    }
    Ok(())
}
