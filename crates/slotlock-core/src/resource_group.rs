//! Resource groups: named single-slot mutexes shared by the builds of a project.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{Error, ResourceId, Result};

/// Longest key a resource group may carry.
pub const MAX_KEY_LENGTH: usize = 255;

/// How the next holder is picked from the waiting backlog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessMode {
    /// Any waiting build; ties broken by lowest build id.
    #[default]
    Unordered,
    /// Earliest created waiting build first.
    OldestFirst,
    /// Latest created waiting build first.
    NewestFirst,
}

impl ProcessMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessMode::Unordered => "unordered",
            ProcessMode::OldestFirst => "oldest_first",
            ProcessMode::NewestFirst => "newest_first",
        }
    }
}

impl std::fmt::Display for ProcessMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ProcessMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "unordered" => Ok(ProcessMode::Unordered),
            "oldest_first" => Ok(ProcessMode::OldestFirst),
            "newest_first" => Ok(ProcessMode::NewestFirst),
            other => Err(Error::InvalidInput(format!(
                "unknown process mode: {}",
                other
            ))),
        }
    }
}

/// A named mutex owned by a project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceGroup {
    pub id: ResourceId,
    pub project_id: ResourceId,
    /// Unique within the project.
    pub key: String,
    pub process_mode: ProcessMode,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ResourceGroup {
    /// Normalize a key declared by a job definition.
    pub fn validate_key(key: &str) -> Result<String> {
        let key = key.trim();
        if key.is_empty() {
            return Err(Error::InvalidInput(
                "resource group key must not be empty".to_string(),
            ));
        }
        if key.chars().count() > MAX_KEY_LENGTH {
            return Err(Error::InvalidInput(format!(
                "resource group key is longer than {} characters",
                MAX_KEY_LENGTH
            )));
        }
        Ok(key.to_string())
    }

    pub fn belongs_to(&self, project_id: ResourceId) -> bool {
        self.project_id == project_id
    }
}

/// The slot of a resource group. `build_id` is the current holder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resource {
    pub id: ResourceId,
    pub resource_group_id: ResourceId,
    pub build_id: Option<ResourceId>,
    pub partition_id: i64,
    /// Bumped on every holder change; writes check it.
    pub lock_version: i32,
}

impl Resource {
    pub fn is_free(&self) -> bool {
        self.build_id.is_none()
    }
}
