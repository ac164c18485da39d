//! In-memory implementation of the repositories.
//!
//! Backs the single-process mode and the test suites. Group locks are
//! per-group async mutexes; writes made under a lock are staged and applied
//! atomically on commit, with the same version checks as the PostgreSQL
//! implementation.

use async_trait::async_trait;
use chrono::Utc;
use slotlock_core::{Build, BuildStatus, ProcessMode, Project, Resource, ResourceGroup, ResourceId};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};

use super::build::{BuildRepo, NewBuild};
use super::project::ProjectRepo;
use super::resource_group::{
    DEFAULT_LOCK_TIMEOUT, DEFAULT_PARTITION_ID, ResourceGroupLock, ResourceGroupRepo,
};
use crate::{DbError, DbResult};

#[derive(Default)]
struct Tables {
    projects: HashMap<ResourceId, Project>,
    groups: HashMap<ResourceId, ResourceGroup>,
    /// Keyed by resource group id.
    resources: HashMap<ResourceId, Resource>,
    builds: HashMap<ResourceId, Build>,
}

struct Inner {
    tables: Mutex<Tables>,
    group_locks: Mutex<HashMap<ResourceId, Arc<Mutex<()>>>>,
    lock_timeout: Duration,
}

/// Shared in-memory store. Clones share state.
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_lock_timeout(DEFAULT_LOCK_TIMEOUT)
    }

    pub fn with_lock_timeout(lock_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                tables: Mutex::new(Tables::default()),
                group_locks: Mutex::new(HashMap::new()),
                lock_timeout,
            }),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProjectRepo for MemoryStore {
    async fn create_project(&self, name: &str) -> DbResult<Project> {
        let project = Project::new(name);
        let mut tables = self.inner.tables.lock().await;
        tables.projects.insert(project.id, project.clone());
        Ok(project)
    }

    async fn get_project(&self, id: ResourceId) -> DbResult<Project> {
        let tables = self.inner.tables.lock().await;
        tables
            .projects
            .get(&id)
            .cloned()
            .ok_or_else(|| DbError::NotFound(format!("project {}", id)))
    }
}

#[async_trait]
impl BuildRepo for MemoryStore {
    async fn create_build(&self, build: NewBuild) -> DbResult<Build> {
        let mut tables = self.inner.tables.lock().await;
        if !tables.projects.contains_key(&build.project_id) {
            return Err(DbError::NotFound(format!("project {}", build.project_id)));
        }
        let build = Build {
            id: ResourceId::new(),
            project_id: build.project_id,
            pipeline_id: build.pipeline_id,
            name: build.name,
            resource_group_id: build.resource_group_id,
            status: build.status,
            has_prerequisites: build.has_prerequisites,
            created_at: build.created_at.unwrap_or_else(Utc::now),
        };
        tables.builds.insert(build.id, build.clone());
        Ok(build)
    }

    async fn get_build(&self, id: ResourceId) -> DbResult<Build> {
        let tables = self.inner.tables.lock().await;
        tables
            .builds
            .get(&id)
            .cloned()
            .ok_or_else(|| DbError::NotFound(format!("build {}", id)))
    }

    async fn transition_build(
        &self,
        id: ResourceId,
        from: BuildStatus,
        to: BuildStatus,
    ) -> DbResult<Build> {
        let mut tables = self.inner.tables.lock().await;
        let build = tables
            .builds
            .get_mut(&id)
            .ok_or_else(|| DbError::NotFound(format!("build {}", id)))?;
        if build.status != from {
            return Err(DbError::StaleObject(format!(
                "build {} is no longer {}",
                id, from
            )));
        }
        build.status = to;
        Ok(build.clone())
    }
}

#[async_trait]
impl ResourceGroupRepo for MemoryStore {
    async fn find_resource_group(&self, id: ResourceId) -> DbResult<Option<ResourceGroup>> {
        let tables = self.inner.tables.lock().await;
        Ok(tables.groups.get(&id).cloned())
    }

    async fn find_by_key(
        &self,
        project_id: ResourceId,
        key: &str,
    ) -> DbResult<Option<ResourceGroup>> {
        let tables = self.inner.tables.lock().await;
        Ok(tables
            .groups
            .values()
            .find(|g| g.project_id == project_id && g.key == key)
            .cloned())
    }

    async fn find_or_create_by_key(
        &self,
        project_id: ResourceId,
        key: &str,
        process_mode: ProcessMode,
    ) -> DbResult<ResourceGroup> {
        let mut tables = self.inner.tables.lock().await;
        if let Some(existing) = tables
            .groups
            .values()
            .find(|g| g.project_id == project_id && g.key == key)
        {
            return Ok(existing.clone());
        }
        if !tables.projects.contains_key(&project_id) {
            return Err(DbError::NotFound(format!("project {}", project_id)));
        }

        let now = Utc::now();
        let group = ResourceGroup {
            id: ResourceId::new(),
            project_id,
            key: key.to_string(),
            process_mode,
            created_at: now,
            updated_at: now,
        };
        let resource = Resource {
            id: ResourceId::new(),
            resource_group_id: group.id,
            build_id: None,
            partition_id: DEFAULT_PARTITION_ID,
            lock_version: 0,
        };
        tables.groups.insert(group.id, group.clone());
        tables.resources.insert(group.id, resource);
        Ok(group)
    }

    async fn update_process_mode(
        &self,
        id: ResourceId,
        process_mode: ProcessMode,
    ) -> DbResult<ResourceGroup> {
        let mut tables = self.inner.tables.lock().await;
        let group = tables
            .groups
            .get_mut(&id)
            .ok_or_else(|| DbError::NotFound(format!("resource group {}", id)))?;
        group.process_mode = process_mode;
        group.updated_at = Utc::now();
        Ok(group.clone())
    }

    async fn delete_resource_group(&self, id: ResourceId) -> DbResult<()> {
        let mut tables = self.inner.tables.lock().await;
        tables.groups.remove(&id);
        tables.resources.remove(&id);
        for build in tables.builds.values_mut() {
            if build.resource_group_id == Some(id) {
                build.resource_group_id = None;
            }
        }
        drop(tables);

        // A holder keeps its own handle; later lock attempts see NotFound
        self.inner.group_locks.lock().await.remove(&id);
        Ok(())
    }

    async fn resource(&self, resource_group_id: ResourceId) -> DbResult<Resource> {
        let tables = self.inner.tables.lock().await;
        tables.resources.get(&resource_group_id).cloned().ok_or_else(|| {
            DbError::NotFound(format!("resource of resource group {}", resource_group_id))
        })
    }

    async fn builds_with_status(
        &self,
        resource_group_id: ResourceId,
        status: BuildStatus,
    ) -> DbResult<Vec<Build>> {
        let tables = self.inner.tables.lock().await;
        let mut builds: Vec<Build> = tables
            .builds
            .values()
            .filter(|b| b.resource_group_id == Some(resource_group_id) && b.status == status)
            .cloned()
            .collect();
        builds.sort_by_key(|b| b.id);
        Ok(builds)
    }

    async fn lock(&self, id: ResourceId) -> DbResult<Box<dyn ResourceGroupLock>> {
        let what = format!("resource group {}", id);
        if self.find_resource_group(id).await?.is_none() {
            return Err(DbError::NotFound(what));
        }

        let mutex = {
            let mut locks = self.inner.group_locks.lock().await;
            locks.entry(id).or_default().clone()
        };
        let guard = tokio::time::timeout(self.inner.lock_timeout, mutex.lock_owned())
            .await
            .map_err(|_| DbError::LockTimeout(what.clone()))?;

        // The group may have been deleted while we waited
        let tables = self.inner.tables.lock().await;
        let group = tables
            .groups
            .get(&id)
            .cloned()
            .ok_or_else(|| DbError::NotFound(what.clone()))?;
        let resource = tables
            .resources
            .get(&id)
            .cloned()
            .ok_or_else(|| DbError::NotFound(format!("resource of {}", what)))?;
        drop(tables);

        Ok(Box::new(MemoryResourceGroupLock {
            inner: self.inner.clone(),
            _guard: guard,
            base_version: resource.lock_version,
            group,
            resource,
            transitions: Vec::new(),
        }))
    }
}

/// Staged build status change, checked against `from` on commit.
struct Transition {
    build_id: ResourceId,
    from: BuildStatus,
    to: BuildStatus,
}

struct MemoryResourceGroupLock {
    inner: Arc<Inner>,
    _guard: OwnedMutexGuard<()>,
    /// Resource version observed when the lock was taken.
    base_version: i32,
    group: ResourceGroup,
    resource: Resource,
    transitions: Vec<Transition>,
}

impl MemoryResourceGroupLock {
    fn staged_status(&self, build_id: ResourceId) -> Option<BuildStatus> {
        self.transitions
            .iter()
            .rev()
            .find(|t| t.build_id == build_id)
            .map(|t| t.to)
    }
}

#[async_trait]
impl ResourceGroupLock for MemoryResourceGroupLock {
    fn resource_group(&self) -> &ResourceGroup {
        &self.group
    }

    fn resource(&self) -> &Resource {
        &self.resource
    }

    async fn build(&mut self, id: ResourceId) -> DbResult<Option<Build>> {
        let tables = self.inner.tables.lock().await;
        let mut build = tables.builds.get(&id).cloned();
        drop(tables);
        if let Some(build) = build.as_mut() {
            if let Some(status) = self.staged_status(id) {
                build.status = status;
            }
        }
        Ok(build)
    }

    async fn waiting_builds(&mut self) -> DbResult<Vec<Build>> {
        let tables = self.inner.tables.lock().await;
        let candidates: Vec<Build> = tables
            .builds
            .values()
            .filter(|b| {
                b.resource_group_id == Some(self.group.id)
                    && b.status == BuildStatus::WaitingForResource
            })
            .cloned()
            .collect();
        drop(tables);
        Ok(candidates
            .into_iter()
            .filter(|b| self.staged_status(b.id).is_none())
            .collect())
    }

    async fn assign_resource_to(&mut self, build: &Build, status: BuildStatus) -> DbResult<()> {
        if !self.resource.is_free() {
            return Err(DbError::StaleObject(format!("resource {}", self.resource.id)));
        }
        let current = self.build(build.id).await?;
        let still_waiting = current.is_some_and(|b| {
            b.status == BuildStatus::WaitingForResource && b.resource_group_id == Some(self.group.id)
        });
        if !still_waiting {
            return Err(DbError::StaleObject(format!(
                "build {} is no longer waiting for resource",
                build.id
            )));
        }

        self.resource.build_id = Some(build.id);
        self.resource.lock_version += 1;
        self.transitions.push(Transition {
            build_id: build.id,
            from: BuildStatus::WaitingForResource,
            to: status,
        });
        Ok(())
    }

    async fn release_resource(&mut self) -> DbResult<Option<ResourceId>> {
        let previous = self.resource.build_id.take();
        if previous.is_some() {
            self.resource.lock_version += 1;
        }
        Ok(previous)
    }

    async fn commit(self: Box<Self>) -> DbResult<()> {
        let mut tables = self.inner.tables.lock().await;

        let stored = tables
            .resources
            .get(&self.group.id)
            .ok_or_else(|| DbError::NotFound(format!("resource group {}", self.group.id)))?;
        if stored.lock_version != self.base_version {
            return Err(DbError::StaleObject(format!("resource {}", stored.id)));
        }
        for transition in &self.transitions {
            let status = tables.builds.get(&transition.build_id).map(|b| b.status);
            if status != Some(transition.from) {
                return Err(DbError::StaleObject(format!(
                    "build {} is no longer {}",
                    transition.build_id, transition.from
                )));
            }
        }

        for transition in &self.transitions {
            if let Some(build) = tables.builds.get_mut(&transition.build_id) {
                build.status = transition.to;
            }
        }
        tables.resources.insert(self.group.id, self.resource.clone());
        Ok(())
    }
}
