//! The slice of a CI build the admission controller cares about.
//!
//! Builds are owned by the CI pipeline; SlotLock only reads them and flips
//! their status in and out of `waiting_for_resource`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ResourceId;

/// Build status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildStatus {
    Created,
    WaitingForResource,
    Preparing,
    Pending,
    Running,
    Success,
    Failed,
    Canceled,
    Skipped,
    Manual,
    Scheduled,
}

impl BuildStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BuildStatus::Created => "created",
            BuildStatus::WaitingForResource => "waiting_for_resource",
            BuildStatus::Preparing => "preparing",
            BuildStatus::Pending => "pending",
            BuildStatus::Running => "running",
            BuildStatus::Success => "success",
            BuildStatus::Failed => "failed",
            BuildStatus::Canceled => "canceled",
            BuildStatus::Skipped => "skipped",
            BuildStatus::Manual => "manual",
            BuildStatus::Scheduled => "scheduled",
        }
    }

    /// Statuses past `waiting_for_resource` that still occupy the slot.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            BuildStatus::Preparing | BuildStatus::Pending | BuildStatus::Running
        )
    }

    pub fn is_complete(&self) -> bool {
        matches!(
            self,
            BuildStatus::Success | BuildStatus::Failed | BuildStatus::Canceled | BuildStatus::Skipped
        )
    }

    /// Whether a build in this status may start asking for its resource.
    pub fn can_request_resource(&self) -> bool {
        matches!(
            self,
            BuildStatus::Created | BuildStatus::Scheduled | BuildStatus::Manual
        )
    }
}

impl std::fmt::Display for BuildStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for BuildStatus {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let status = match s {
            "created" => BuildStatus::Created,
            "waiting_for_resource" => BuildStatus::WaitingForResource,
            "preparing" => BuildStatus::Preparing,
            "pending" => BuildStatus::Pending,
            "running" => BuildStatus::Running,
            "success" => BuildStatus::Success,
            "failed" => BuildStatus::Failed,
            "canceled" => BuildStatus::Canceled,
            "skipped" => BuildStatus::Skipped,
            "manual" => BuildStatus::Manual,
            "scheduled" => BuildStatus::Scheduled,
            other => {
                return Err(crate::Error::InvalidInput(format!(
                    "unknown build status: {}",
                    other
                )));
            }
        };
        Ok(status)
    }
}

/// A CI build that may declare a resource group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Build {
    pub id: ResourceId,
    pub project_id: ResourceId,
    pub pipeline_id: ResourceId,
    /// Job name from the pipeline definition.
    pub name: String,
    pub resource_group_id: Option<ResourceId>,
    pub status: BuildStatus,
    /// Builds with prerequisites go through `preparing` before `pending`.
    pub has_prerequisites: bool,
    pub created_at: DateTime<Utc>,
}

impl Build {
    pub fn with_resource_group(&self) -> bool {
        self.resource_group_id.is_some()
    }

    /// Status a build moves to once it obtains its resource.
    pub fn runnable_status(&self) -> BuildStatus {
        if self.has_prerequisites {
            BuildStatus::Preparing
        } else {
            BuildStatus::Pending
        }
    }
}
