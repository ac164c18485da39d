//! Project repository.

use async_trait::async_trait;
use slotlock_core::{Project, ResourceId};
use sqlx::PgPool;

use crate::{DbError, DbResult};

#[derive(Debug, Clone, sqlx::FromRow)]
struct ProjectRow {
    id: uuid::Uuid,
    name: String,
}

impl From<ProjectRow> for Project {
    fn from(row: ProjectRow) -> Self {
        Project {
            id: row.id.into(),
            name: row.name,
        }
    }
}

#[async_trait]
pub trait ProjectRepo: Send + Sync {
    async fn create_project(&self, name: &str) -> DbResult<Project>;
    async fn get_project(&self, id: ResourceId) -> DbResult<Project>;
}

/// PostgreSQL implementation of ProjectRepo.
pub struct PgProjectRepo {
    pool: PgPool,
}

impl PgProjectRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ProjectRepo for PgProjectRepo {
    async fn create_project(&self, name: &str) -> DbResult<Project> {
        let row = sqlx::query_as::<_, ProjectRow>(
            "INSERT INTO projects (id, name, created_at) VALUES ($1, $2, NOW()) RETURNING id, name",
        )
        .bind(uuid::Uuid::now_v7())
        .bind(name)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.into())
    }

    async fn get_project(&self, id: ResourceId) -> DbResult<Project> {
        let row = sqlx::query_as::<_, ProjectRow>("SELECT id, name FROM projects WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| DbError::NotFound(format!("project {}", id)))?;
        Ok(row.into())
    }
}
