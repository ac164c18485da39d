//! Resource group repository.
//!
//! All writes to a group's resource happen through a [`ResourceGroupLock`],
//! a unit of work that holds the group's exclusive lock from the first read
//! until commit. Dropping a lock without committing discards its writes.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use slotlock_core::{Build, BuildStatus, ProcessMode, Resource, ResourceGroup, ResourceId};
use sqlx::{PgPool, Postgres, Transaction};
use std::time::Duration;
use tracing::debug;

use super::build::{BUILD_COLUMNS, BuildRow};
use crate::{DbError, DbResult};

/// How long to wait for a group lock held by someone else.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(5);

/// Partition new resources are written to.
pub(crate) const DEFAULT_PARTITION_ID: i64 = 100;

/// Database row for resource groups.
#[derive(Debug, Clone, sqlx::FromRow)]
struct ResourceGroupRow {
    id: uuid::Uuid,
    project_id: uuid::Uuid,
    key: String,
    process_mode: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<ResourceGroupRow> for ResourceGroup {
    type Error = DbError;

    fn try_from(row: ResourceGroupRow) -> Result<Self, Self::Error> {
        let process_mode = row
            .process_mode
            .parse::<ProcessMode>()
            .map_err(|e| DbError::InvalidData(format!("resource group {}: {}", row.id, e)))?;

        Ok(ResourceGroup {
            id: row.id.into(),
            project_id: row.project_id.into(),
            key: row.key,
            process_mode,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

/// Database row for resources.
#[derive(Debug, Clone, sqlx::FromRow)]
struct ResourceRow {
    id: uuid::Uuid,
    resource_group_id: uuid::Uuid,
    build_id: Option<uuid::Uuid>,
    partition_id: i64,
    lock_version: i32,
}

impl From<ResourceRow> for Resource {
    fn from(row: ResourceRow) -> Self {
        Resource {
            id: row.id.into(),
            resource_group_id: row.resource_group_id.into(),
            build_id: row.build_id.map(ResourceId::from),
            partition_id: row.partition_id,
            lock_version: row.lock_version,
        }
    }
}

const GROUP_COLUMNS: &str = "id, project_id, key, process_mode, created_at, updated_at";
const RESOURCE_COLUMNS: &str = "id, resource_group_id, build_id, partition_id, lock_version";

#[async_trait]
pub trait ResourceGroupRepo: Send + Sync {
    async fn find_resource_group(&self, id: ResourceId) -> DbResult<Option<ResourceGroup>>;

    async fn get_resource_group(&self, id: ResourceId) -> DbResult<ResourceGroup> {
        self.find_resource_group(id)
            .await?
            .ok_or_else(|| DbError::NotFound(format!("resource group {}", id)))
    }

    async fn find_by_key(
        &self,
        project_id: ResourceId,
        key: &str,
    ) -> DbResult<Option<ResourceGroup>>;

    /// Return the project's group for `key`, creating it together with its
    /// free resource when it does not exist yet. An existing group keeps its
    /// process mode.
    async fn find_or_create_by_key(
        &self,
        project_id: ResourceId,
        key: &str,
        process_mode: ProcessMode,
    ) -> DbResult<ResourceGroup>;

    async fn update_process_mode(
        &self,
        id: ResourceId,
        process_mode: ProcessMode,
    ) -> DbResult<ResourceGroup>;

    async fn delete_resource_group(&self, id: ResourceId) -> DbResult<()>;

    /// Unlocked read of the group's resource. Not for assignment decisions.
    async fn resource(&self, resource_group_id: ResourceId) -> DbResult<Resource>;

    /// Unlocked read of the group's builds in `status`.
    async fn builds_with_status(
        &self,
        resource_group_id: ResourceId,
        status: BuildStatus,
    ) -> DbResult<Vec<Build>>;

    /// Take the group's exclusive lock. Blocks while another lock is held,
    /// up to the repository's lock timeout.
    async fn lock(&self, id: ResourceId) -> DbResult<Box<dyn ResourceGroupLock>>;
}

/// Exclusive unit of work over one resource group.
#[async_trait]
pub trait ResourceGroupLock: Send {
    fn resource_group(&self) -> &ResourceGroup;

    /// The resource as seen inside the lock, including this lock's writes.
    fn resource(&self) -> &Resource;

    async fn build(&mut self, id: ResourceId) -> DbResult<Option<Build>>;

    /// Builds of this group in `waiting_for_resource`, in no particular order.
    async fn waiting_builds(&mut self) -> DbResult<Vec<Build>>;

    /// Make `build` the holder and move it from `waiting_for_resource` to
    /// `status`. Fails with `StaleObject` if the resource is held or changed,
    /// or the build left `waiting_for_resource`.
    async fn assign_resource_to(&mut self, build: &Build, status: BuildStatus) -> DbResult<()>;

    /// Clear the holder, returning the previous one.
    async fn release_resource(&mut self) -> DbResult<Option<ResourceId>>;

    async fn commit(self: Box<Self>) -> DbResult<()>;
}

/// PostgreSQL implementation of ResourceGroupRepo.
pub struct PgResourceGroupRepo {
    pool: PgPool,
    lock_timeout: Duration,
}

impl PgResourceGroupRepo {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
        }
    }

    pub fn with_lock_timeout(mut self, lock_timeout: Duration) -> Self {
        self.lock_timeout = lock_timeout;
        self
    }
}

fn map_lock_error(err: sqlx::Error, what: &str) -> DbError {
    if let sqlx::Error::Database(db) = &err {
        // lock_not_available
        if db.code().as_deref() == Some("55P03") {
            return DbError::LockTimeout(what.to_string());
        }
    }
    DbError::Database(err)
}

#[async_trait]
impl ResourceGroupRepo for PgResourceGroupRepo {
    async fn find_resource_group(&self, id: ResourceId) -> DbResult<Option<ResourceGroup>> {
        let row = sqlx::query_as::<_, ResourceGroupRow>(&format!(
            "SELECT {} FROM resource_groups WHERE id = $1",
            GROUP_COLUMNS
        ))
        .bind(id.as_uuid())
        .fetch_optional(&self.pool)
        .await?;
        row.map(ResourceGroup::try_from).transpose()
    }

    async fn find_by_key(
        &self,
        project_id: ResourceId,
        key: &str,
    ) -> DbResult<Option<ResourceGroup>> {
        let row = sqlx::query_as::<_, ResourceGroupRow>(&format!(
            "SELECT {} FROM resource_groups WHERE project_id = $1 AND key = $2",
            GROUP_COLUMNS
        ))
        .bind(project_id.as_uuid())
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;
        row.map(ResourceGroup::try_from).transpose()
    }

    async fn find_or_create_by_key(
        &self,
        project_id: ResourceId,
        key: &str,
        process_mode: ProcessMode,
    ) -> DbResult<ResourceGroup> {
        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query_as::<_, ResourceGroupRow>(&format!(
            r#"
            INSERT INTO resource_groups (id, project_id, key, process_mode, created_at, updated_at)
            VALUES ($1, $2, $3, $4, NOW(), NOW())
            ON CONFLICT (project_id, key) DO NOTHING
            RETURNING {}
            "#,
            GROUP_COLUMNS
        ))
        .bind(uuid::Uuid::now_v7())
        .bind(project_id.as_uuid())
        .bind(key)
        .bind(process_mode.as_str())
        .fetch_optional(&mut *tx)
        .await?;

        let group = match inserted {
            Some(row) => {
                let group = ResourceGroup::try_from(row)?;
                sqlx::query(
                    r#"
                    INSERT INTO resources (id, resource_group_id, build_id, partition_id, lock_version, created_at, updated_at)
                    VALUES ($1, $2, NULL, $3, 0, NOW(), NOW())
                    "#,
                )
                .bind(uuid::Uuid::now_v7())
                .bind(group.id.as_uuid())
                .bind(DEFAULT_PARTITION_ID)
                .execute(&mut *tx)
                .await?;
                debug!(resource_group_id = %group.id, key = %group.key, "Created resource group");
                group
            }
            None => sqlx::query_as::<_, ResourceGroupRow>(&format!(
                "SELECT {} FROM resource_groups WHERE project_id = $1 AND key = $2",
                GROUP_COLUMNS
            ))
            .bind(project_id.as_uuid())
            .bind(key)
            .fetch_one(&mut *tx)
            .await?
            .try_into()?,
        };

        tx.commit().await?;
        Ok(group)
    }

    async fn update_process_mode(
        &self,
        id: ResourceId,
        process_mode: ProcessMode,
    ) -> DbResult<ResourceGroup> {
        let row = sqlx::query_as::<_, ResourceGroupRow>(&format!(
            r#"
            UPDATE resource_groups SET process_mode = $2, updated_at = NOW()
            WHERE id = $1
            RETURNING {}
            "#,
            GROUP_COLUMNS
        ))
        .bind(id.as_uuid())
        .bind(process_mode.as_str())
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| DbError::NotFound(format!("resource group {}", id)))?;
        row.try_into()
    }

    async fn delete_resource_group(&self, id: ResourceId) -> DbResult<()> {
        sqlx::query("DELETE FROM resource_groups WHERE id = $1")
            .bind(id.as_uuid())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn resource(&self, resource_group_id: ResourceId) -> DbResult<Resource> {
        let row = sqlx::query_as::<_, ResourceRow>(&format!(
            "SELECT {} FROM resources WHERE resource_group_id = $1",
            RESOURCE_COLUMNS
        ))
        .bind(resource_group_id.as_uuid())
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| {
            DbError::NotFound(format!("resource of resource group {}", resource_group_id))
        })?;
        Ok(row.into())
    }

    async fn builds_with_status(
        &self,
        resource_group_id: ResourceId,
        status: BuildStatus,
    ) -> DbResult<Vec<Build>> {
        let rows = sqlx::query_as::<_, BuildRow>(&format!(
            "SELECT {} FROM builds WHERE resource_group_id = $1 AND status = $2 ORDER BY id",
            BUILD_COLUMNS
        ))
        .bind(resource_group_id.as_uuid())
        .bind(status.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(Build::try_from).collect()
    }

    async fn lock(&self, id: ResourceId) -> DbResult<Box<dyn ResourceGroupLock>> {
        let mut tx = self.pool.begin().await?;

        // SET does not take bind parameters
        sqlx::query(&format!(
            "SET LOCAL lock_timeout = '{}ms'",
            self.lock_timeout.as_millis()
        ))
        .execute(&mut *tx)
        .await?;

        let what = format!("resource group {}", id);
        let group: ResourceGroup = sqlx::query_as::<_, ResourceGroupRow>(&format!(
            "SELECT {} FROM resource_groups WHERE id = $1 FOR UPDATE",
            GROUP_COLUMNS
        ))
        .bind(id.as_uuid())
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| map_lock_error(e, &what))?
        .ok_or_else(|| DbError::NotFound(what.clone()))?
        .try_into()?;

        let resource: Resource = sqlx::query_as::<_, ResourceRow>(&format!(
            "SELECT {} FROM resources WHERE resource_group_id = $1 FOR UPDATE",
            RESOURCE_COLUMNS
        ))
        .bind(id.as_uuid())
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| map_lock_error(e, &what))?
        .ok_or_else(|| DbError::NotFound(format!("resource of {}", what)))?
        .into();

        Ok(Box::new(PgResourceGroupLock {
            tx,
            group,
            resource,
        }))
    }
}

/// A resource group locked with `SELECT ... FOR UPDATE` inside a transaction.
pub struct PgResourceGroupLock {
    tx: Transaction<'static, Postgres>,
    group: ResourceGroup,
    resource: Resource,
}

#[async_trait]
impl ResourceGroupLock for PgResourceGroupLock {
    fn resource_group(&self) -> &ResourceGroup {
        &self.group
    }

    fn resource(&self) -> &Resource {
        &self.resource
    }

    async fn build(&mut self, id: ResourceId) -> DbResult<Option<Build>> {
        let row = sqlx::query_as::<_, BuildRow>(&format!(
            "SELECT {} FROM builds WHERE id = $1",
            BUILD_COLUMNS
        ))
        .bind(id.as_uuid())
        .fetch_optional(&mut *self.tx)
        .await?;
        row.map(Build::try_from).transpose()
    }

    async fn waiting_builds(&mut self) -> DbResult<Vec<Build>> {
        let rows = sqlx::query_as::<_, BuildRow>(&format!(
            "SELECT {} FROM builds WHERE resource_group_id = $1 AND status = $2",
            BUILD_COLUMNS
        ))
        .bind(self.group.id.as_uuid())
        .bind(BuildStatus::WaitingForResource.as_str())
        .fetch_all(&mut *self.tx)
        .await?;
        rows.into_iter().map(Build::try_from).collect()
    }

    async fn assign_resource_to(&mut self, build: &Build, status: BuildStatus) -> DbResult<()> {
        let lock_version = sqlx::query_scalar::<_, i32>(
            r#"
            UPDATE resources
            SET build_id = $2, lock_version = lock_version + 1, updated_at = NOW()
            WHERE id = $1 AND lock_version = $3 AND build_id IS NULL
            RETURNING lock_version
            "#,
        )
        .bind(self.resource.id.as_uuid())
        .bind(build.id.as_uuid())
        .bind(self.resource.lock_version)
        .fetch_optional(&mut *self.tx)
        .await?
        .ok_or_else(|| DbError::StaleObject(format!("resource {}", self.resource.id)))?;

        let moved = sqlx::query(
            r#"
            UPDATE builds SET status = $3, updated_at = NOW()
            WHERE id = $1 AND resource_group_id = $2 AND status = 'waiting_for_resource'
            "#,
        )
        .bind(build.id.as_uuid())
        .bind(self.group.id.as_uuid())
        .bind(status.as_str())
        .execute(&mut *self.tx)
        .await?
        .rows_affected();

        if moved == 0 {
            return Err(DbError::StaleObject(format!(
                "build {} is no longer waiting for resource",
                build.id
            )));
        }

        self.resource.build_id = Some(build.id);
        self.resource.lock_version = lock_version;
        Ok(())
    }

    async fn release_resource(&mut self) -> DbResult<Option<ResourceId>> {
        let previous = self.resource.build_id;
        if previous.is_none() {
            return Ok(None);
        }

        let lock_version = sqlx::query_scalar::<_, i32>(
            r#"
            UPDATE resources
            SET build_id = NULL, lock_version = lock_version + 1, updated_at = NOW()
            WHERE id = $1 AND lock_version = $2
            RETURNING lock_version
            "#,
        )
        .bind(self.resource.id.as_uuid())
        .bind(self.resource.lock_version)
        .fetch_optional(&mut *self.tx)
        .await?
        .ok_or_else(|| DbError::StaleObject(format!("resource {}", self.resource.id)))?;

        self.resource.build_id = None;
        self.resource.lock_version = lock_version;
        Ok(previous)
    }

    async fn commit(self: Box<Self>) -> DbResult<()> {
        self.tx.commit().await?;
        Ok(())
    }
}
