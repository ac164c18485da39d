//! Workers that run the assignment service for one resource group.

use async_trait::async_trait;
use serde_json::{Value, json};
use slotlock_core::{Error, ResourceId, Result};
use slotlock_db::{ProjectRepo, ResourceGroupRepo};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

use crate::assign::{AssignOutcome, AssignResourceFromResourceGroupService, ResourceEvent};
use crate::dedup::DeduplicationOptions;
use crate::worker::Worker;

/// Job arguments for a resource group id.
pub fn assignment_args(resource_group_id: ResourceId) -> Value {
    json!([resource_group_id])
}

fn parse_args(args: &Value) -> Result<ResourceId> {
    let (resource_group_id,): (ResourceId,) = serde_json::from_value(args.clone())
        .map_err(|e| Error::InvalidInput(format!("invalid job arguments {}: {}", args, e)))?;
    Ok(resource_group_id)
}

/// Assigns a group's resource to its next waiting build. No deduplication.
pub struct AssignResourceFromResourceGroupWorker {
    projects: Arc<dyn ProjectRepo>,
    groups: Arc<dyn ResourceGroupRepo>,
    events: Option<mpsc::Sender<ResourceEvent>>,
}

impl AssignResourceFromResourceGroupWorker {
    pub const NAME: &'static str = "assign_resource_from_resource_group";

    pub fn new(projects: Arc<dyn ProjectRepo>, groups: Arc<dyn ResourceGroupRepo>) -> Self {
        Self {
            projects,
            groups,
            events: None,
        }
    }

    pub fn with_events(mut self, events: mpsc::Sender<ResourceEvent>) -> Self {
        self.events = Some(events);
        self
    }

    /// Run one assignment for the group. A group or project that no longer
    /// exists is not an error; the job simply has nothing to do.
    pub async fn perform_for(&self, resource_group_id: ResourceId) -> Result<Option<AssignOutcome>> {
        let Some(group) = self.groups.find_resource_group(resource_group_id).await? else {
            debug!(resource_group_id = %resource_group_id, "Resource group not found, skipping");
            return Ok(None);
        };

        let project = match self.projects.get_project(group.project_id).await {
            Ok(project) => project,
            Err(slotlock_db::DbError::NotFound(_)) => {
                debug!(resource_group_id = %resource_group_id, "Project not found, skipping");
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        let mut service =
            AssignResourceFromResourceGroupService::new(project, None, self.groups.clone());
        if let Some(events) = &self.events {
            service = service.with_events(events.clone());
        }

        match service.execute(&group).await {
            Ok(outcome) => Ok(Some(outcome)),
            Err(Error::NotFound(message)) => {
                debug!(resource_group_id = %resource_group_id, %message, "Resource group removed during assignment");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl Worker for AssignResourceFromResourceGroupWorker {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    async fn perform(&self, args: &Value) -> Result<()> {
        self.perform_for(parse_args(args)?).await.map(|_| ())
    }
}

/// Same work as [`AssignResourceFromResourceGroupWorker`], deduplicated
/// until executing and rescheduled once when a duplicate is dropped.
pub struct AssignResourceFromResourceGroupWorkerV2 {
    inner: AssignResourceFromResourceGroupWorker,
    deduplication: DeduplicationOptions,
}

impl AssignResourceFromResourceGroupWorkerV2 {
    pub const NAME: &'static str = "assign_resource_from_resource_group_v2";

    pub fn new(projects: Arc<dyn ProjectRepo>, groups: Arc<dyn ResourceGroupRepo>) -> Self {
        Self {
            inner: AssignResourceFromResourceGroupWorker::new(projects, groups),
            deduplication: DeduplicationOptions::until_executing(),
        }
    }

    /// Override `including_scheduled` and the reschedule delay.
    pub fn with_deduplication(mut self, deduplication: DeduplicationOptions) -> Self {
        self.deduplication = deduplication;
        self
    }

    pub fn with_events(mut self, events: mpsc::Sender<ResourceEvent>) -> Self {
        self.inner = self.inner.with_events(events);
        self
    }

    pub async fn perform_for(&self, resource_group_id: ResourceId) -> Result<Option<AssignOutcome>> {
        self.inner.perform_for(resource_group_id).await
    }
}

#[async_trait]
impl Worker for AssignResourceFromResourceGroupWorkerV2 {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn deduplication(&self) -> DeduplicationOptions {
        self.deduplication
    }

    async fn perform(&self, args: &Value) -> Result<()> {
        self.inner.perform(args).await
    }
}
