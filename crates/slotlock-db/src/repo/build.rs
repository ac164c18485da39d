//! Build repository.
//!
//! Builds belong to the CI pipeline. Status changes go through a
//! compare-and-set so a transition never overwrites one it did not observe.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use slotlock_core::{Build, BuildStatus, ResourceId};
use sqlx::PgPool;

use crate::{DbError, DbResult};

/// Database row for builds.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct BuildRow {
    pub id: uuid::Uuid,
    pub project_id: uuid::Uuid,
    pub pipeline_id: uuid::Uuid,
    pub name: String,
    pub resource_group_id: Option<uuid::Uuid>,
    pub status: String,
    pub has_prerequisites: bool,
    pub created_at: DateTime<Utc>,
}

impl TryFrom<BuildRow> for Build {
    type Error = DbError;

    fn try_from(row: BuildRow) -> Result<Self, Self::Error> {
        let status = row
            .status
            .parse::<BuildStatus>()
            .map_err(|e| DbError::InvalidData(format!("build {}: {}", row.id, e)))?;

        Ok(Build {
            id: row.id.into(),
            project_id: row.project_id.into(),
            pipeline_id: row.pipeline_id.into(),
            name: row.name,
            resource_group_id: row.resource_group_id.map(ResourceId::from),
            status,
            has_prerequisites: row.has_prerequisites,
            created_at: row.created_at,
        })
    }
}

/// Attributes for inserting a build.
#[derive(Debug, Clone)]
pub struct NewBuild {
    pub project_id: ResourceId,
    pub pipeline_id: ResourceId,
    pub name: String,
    pub resource_group_id: Option<ResourceId>,
    pub status: BuildStatus,
    pub has_prerequisites: bool,
    /// Defaults to the insertion time.
    pub created_at: Option<DateTime<Utc>>,
}

impl NewBuild {
    pub fn new(project_id: ResourceId, pipeline_id: ResourceId, name: impl Into<String>) -> Self {
        Self {
            project_id,
            pipeline_id,
            name: name.into(),
            resource_group_id: None,
            status: BuildStatus::Created,
            has_prerequisites: false,
            created_at: None,
        }
    }

    pub fn resource_group(mut self, resource_group_id: ResourceId) -> Self {
        self.resource_group_id = Some(resource_group_id);
        self
    }

    pub fn status(mut self, status: BuildStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_prerequisites(mut self) -> Self {
        self.has_prerequisites = true;
        self
    }

    pub fn created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = Some(created_at);
        self
    }
}

#[async_trait]
pub trait BuildRepo: Send + Sync {
    async fn create_build(&self, build: NewBuild) -> DbResult<Build>;
    async fn get_build(&self, id: ResourceId) -> DbResult<Build>;
    /// Move a build from `from` to `to`. Fails with `StaleObject` when the
    /// build is no longer in `from`.
    async fn transition_build(
        &self,
        id: ResourceId,
        from: BuildStatus,
        to: BuildStatus,
    ) -> DbResult<Build>;
}

/// PostgreSQL implementation of BuildRepo.
pub struct PgBuildRepo {
    pool: PgPool,
}

impl PgBuildRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

pub(crate) const BUILD_COLUMNS: &str =
    "id, project_id, pipeline_id, name, resource_group_id, status, has_prerequisites, created_at";

#[async_trait]
impl BuildRepo for PgBuildRepo {
    async fn create_build(&self, build: NewBuild) -> DbResult<Build> {
        let row = sqlx::query_as::<_, BuildRow>(&format!(
            r#"
            INSERT INTO builds (id, project_id, pipeline_id, name, resource_group_id, status, has_prerequisites, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, COALESCE($8, NOW()), NOW())
            RETURNING {}
            "#,
            BUILD_COLUMNS
        ))
        .bind(uuid::Uuid::now_v7())
        .bind(build.project_id.as_uuid())
        .bind(build.pipeline_id.as_uuid())
        .bind(&build.name)
        .bind(build.resource_group_id.map(uuid::Uuid::from))
        .bind(build.status.as_str())
        .bind(build.has_prerequisites)
        .bind(build.created_at)
        .fetch_one(&self.pool)
        .await?;
        row.try_into()
    }

    async fn get_build(&self, id: ResourceId) -> DbResult<Build> {
        let row = sqlx::query_as::<_, BuildRow>(&format!(
            "SELECT {} FROM builds WHERE id = $1",
            BUILD_COLUMNS
        ))
        .bind(id.as_uuid())
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| DbError::NotFound(format!("build {}", id)))?;
        row.try_into()
    }

    async fn transition_build(
        &self,
        id: ResourceId,
        from: BuildStatus,
        to: BuildStatus,
    ) -> DbResult<Build> {
        let row = sqlx::query_as::<_, BuildRow>(&format!(
            r#"
            UPDATE builds SET status = $3, updated_at = NOW()
            WHERE id = $1 AND status = $2
            RETURNING {}
            "#,
            BUILD_COLUMNS
        ))
        .bind(id.as_uuid())
        .bind(from.as_str())
        .bind(to.as_str())
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => row.try_into(),
            None => {
                // Tell a missing build apart from one that moved on
                self.get_build(id).await?;
                Err(DbError::StaleObject(format!(
                    "build {} is no longer {}",
                    id, from
                )))
            }
        }
    }
}
