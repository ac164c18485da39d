//! Assigning a resource group's slot to its next waiting build.

use slotlock_core::{
    Build, BuildStatus, Error, ProcessMode, Project, ResourceGroup, ResourceId, Result, UserId,
};
use slotlock_db::ResourceGroupRepo;
use std::cmp::Reverse;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// What an assignment attempt did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssignOutcome {
    /// The build now holds the resource and moved to `status`.
    Assigned {
        build_id: ResourceId,
        status: BuildStatus,
    },
    /// The resource is held by an active build.
    Busy { holder: ResourceId },
    /// The resource is free and no build is waiting for it.
    NothingWaiting,
}

impl AssignOutcome {
    pub fn assigned_build(&self) -> Option<ResourceId> {
        match self {
            AssignOutcome::Assigned { build_id, .. } => Some(*build_id),
            _ => None,
        }
    }
}

impl std::fmt::Display for AssignOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AssignOutcome::Assigned { build_id, status } => {
                write!(f, "assigned to build {} ({})", build_id, status)
            }
            AssignOutcome::Busy { holder } => write!(f, "resource busy, held by build {}", holder),
            AssignOutcome::NothingWaiting => write!(f, "nothing waiting"),
        }
    }
}

/// Holder changes, published after they are committed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceEvent {
    Assigned {
        resource_group_id: ResourceId,
        build_id: ResourceId,
        status: BuildStatus,
    },
    Released {
        resource_group_id: ResourceId,
        build_id: ResourceId,
    },
}

/// Order a backlog the way `mode` consumes it, next holder first.
pub fn sort_backlog(mode: ProcessMode, builds: &mut [Build]) {
    match mode {
        ProcessMode::Unordered => builds.sort_by_key(|b| b.id),
        ProcessMode::OldestFirst => builds.sort_by_key(|b| (b.created_at, b.id)),
        ProcessMode::NewestFirst => builds.sort_by_key(|b| Reverse((b.created_at, b.id))),
    }
}

/// Pick the next holder among waiting builds.
///
/// `unordered` takes the lowest build id so repeated runs pick the same build.
pub fn select_candidate(mode: ProcessMode, waiting: &[Build]) -> Option<&Build> {
    match mode {
        ProcessMode::Unordered => waiting.iter().min_by_key(|b| b.id),
        ProcessMode::OldestFirst => waiting.iter().min_by_key(|b| (b.created_at, b.id)),
        ProcessMode::NewestFirst => waiting.iter().max_by_key(|b| (b.created_at, b.id)),
    }
}

/// Hands a resource group's slot to its next waiting build.
///
/// Bound to a project; executing it for another project's group is an
/// ownership error. Safe to run any number of times: every call re-reads the
/// group under its lock.
pub struct AssignResourceFromResourceGroupService {
    project: Project,
    current_user: Option<UserId>,
    groups: Arc<dyn ResourceGroupRepo>,
    events: Option<mpsc::Sender<ResourceEvent>>,
}

impl AssignResourceFromResourceGroupService {
    pub fn new(
        project: Project,
        current_user: Option<UserId>,
        groups: Arc<dyn ResourceGroupRepo>,
    ) -> Self {
        Self {
            project,
            current_user,
            groups,
            events: None,
        }
    }

    /// Publish committed assignments on `events`.
    pub fn with_events(mut self, events: mpsc::Sender<ResourceEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub async fn execute(&self, resource_group: &ResourceGroup) -> Result<AssignOutcome> {
        if !resource_group.belongs_to(self.project.id) {
            return Err(Error::Forbidden(format!(
                "resource group {} does not belong to project {}",
                resource_group.id, self.project.id
            )));
        }

        let mut lock = self.groups.lock(resource_group.id).await?;
        let group_id = lock.resource_group().id;
        let process_mode = lock.resource_group().process_mode;

        if let Some(holder_id) = lock.resource().build_id {
            match lock.build(holder_id).await? {
                Some(holder) if holder.status.is_active() => {
                    debug!(resource_group_id = %group_id, holder = %holder_id, "Resource busy");
                    return Ok(AssignOutcome::Busy { holder: holder_id });
                }
                holder => {
                    // Holder finished without releasing, or is gone
                    warn!(
                        resource_group_id = %group_id,
                        holder = %holder_id,
                        holder_status = ?holder.map(|b| b.status),
                        "Reclaiming resource from inactive holder"
                    );
                    lock.release_resource().await?;
                }
            }
        }

        let waiting = lock.waiting_builds().await?;
        let Some(candidate) = select_candidate(process_mode, &waiting).cloned() else {
            lock.commit().await?;
            debug!(resource_group_id = %group_id, "No build waiting for resource");
            return Ok(AssignOutcome::NothingWaiting);
        };

        let status = candidate.runnable_status();
        lock.assign_resource_to(&candidate, status).await?;
        lock.commit().await?;

        info!(
            resource_group_id = %group_id,
            build_id = %candidate.id,
            %status,
            %process_mode,
            user = ?self.current_user,
            backlog = waiting.len() - 1,
            "Assigned resource"
        );

        if let Some(tx) = &self.events {
            let event = ResourceEvent::Assigned {
                resource_group_id: group_id,
                build_id: candidate.id,
                status,
            };
            // Best effort; a full or closed channel drops the event
            if let Err(e) = tx.try_send(event) {
                debug!(resource_group_id = %group_id, error = %e, "Dropped resource event");
            }
        }

        Ok(AssignOutcome::Assigned {
            build_id: candidate.id,
            status,
        })
    }
}
