//! Shared fixtures for the scheduler tests.

use chrono::{DateTime, Duration, Utc};
use slotlock_config::{RetryConfig, WorkerConfig};
use slotlock_core::{Build, BuildStatus, ProcessMode, Project, ResourceGroup, ResourceId};
use slotlock_db::{BuildRepo, MemoryStore, NewBuild, ProjectRepo, ResourceGroupRepo};
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use crate::assign::AssignResourceFromResourceGroupService;
use crate::dedup::DeduplicationOptions;
use crate::lifecycle::ResourceGroupLifecycle;
use crate::queue::MemoryJobQueue;
use crate::resource_group_worker::AssignResourceFromResourceGroupWorkerV2;
use crate::worker::{WorkerRegistry, WorkerRunner};

/// A project with one resource group in a memory store.
pub struct Fixture {
    pub store: MemoryStore,
    pub project: Project,
    pub group: ResourceGroup,
    base: DateTime<Utc>,
    tick: AtomicI64,
}

impl Fixture {
    pub async fn new(mode: ProcessMode) -> Self {
        let store = MemoryStore::new();
        let project = store.create_project("deploy-app").await.unwrap();
        let group = store
            .find_or_create_by_key(project.id, "production", mode)
            .await
            .unwrap();
        Self {
            store,
            project,
            group,
            base: Utc::now(),
            tick: AtomicI64::new(0),
        }
    }

    pub fn store_arc(&self) -> Arc<dyn ResourceGroupRepo> {
        Arc::new(self.store.clone())
    }

    pub fn projects_arc(&self) -> Arc<dyn ProjectRepo> {
        Arc::new(self.store.clone())
    }

    pub fn service(&self) -> AssignResourceFromResourceGroupService {
        AssignResourceFromResourceGroupService::new(self.project.clone(), None, self.store_arc())
    }

    pub fn deduplication() -> DeduplicationOptions {
        DeduplicationOptions::until_executing().with_reschedule_delay(std::time::Duration::ZERO)
    }

    pub fn lifecycle(&self, queue: &MemoryJobQueue) -> ResourceGroupLifecycle {
        ResourceGroupLifecycle::new(
            self.store_arc(),
            Arc::new(self.store.clone()),
            Arc::new(queue.clone()),
        )
        .with_deduplication(Self::deduplication())
    }

    pub fn runner(&self, queue: &MemoryJobQueue) -> WorkerRunner {
        let worker =
            AssignResourceFromResourceGroupWorkerV2::new(self.projects_arc(), self.store_arc())
                .with_deduplication(Self::deduplication());
        let retry = RetryConfig {
            max_attempts: 3,
            base_delay_ms: 0,
            max_delay_ms: 0,
        };
        WorkerRunner::new(
            Arc::new(queue.clone()),
            WorkerRegistry::new().register(Arc::new(worker)),
            WorkerConfig::default(),
        )
        .with_retry(retry)
    }

    /// Creation times increase with every build made through the fixture.
    fn next_created_at(&self) -> DateTime<Utc> {
        let tick = self.tick.fetch_add(1, Ordering::SeqCst);
        self.base + Duration::milliseconds(tick)
    }

    async fn create(&self, build: NewBuild) -> Build {
        self.store.create_build(build).await.unwrap()
    }

    fn new_build(&self, name: &str) -> NewBuild {
        NewBuild::new(self.project.id, ResourceId::new(), name).resource_group(self.group.id)
    }

    pub async fn created_build(&self, name: &str) -> Build {
        self.create(self.new_build(name).created_at(self.next_created_at()))
            .await
    }

    pub async fn ungrouped_build(&self, name: &str) -> Build {
        self.create(NewBuild::new(self.project.id, ResourceId::new(), name))
            .await
    }

    pub async fn waiting_build(&self, name: &str) -> Build {
        self.waiting_build_at(name, self.next_created_at()).await
    }

    pub async fn waiting_build_at(&self, name: &str, created_at: DateTime<Utc>) -> Build {
        self.create(
            self.new_build(name)
                .status(BuildStatus::WaitingForResource)
                .created_at(created_at),
        )
        .await
    }

    pub async fn waiting_build_with_prerequisites(&self, name: &str) -> Build {
        self.create(
            self.new_build(name)
                .status(BuildStatus::WaitingForResource)
                .with_prerequisites()
                .created_at(self.next_created_at()),
        )
        .await
    }

    pub async fn status_of(&self, id: ResourceId) -> BuildStatus {
        self.store.get_build(id).await.unwrap().status
    }

    pub async fn set_status(&self, id: ResourceId, from: BuildStatus, to: BuildStatus) {
        self.store.transition_build(id, from, to).await.unwrap();
    }

    /// Mark a build successful without releasing its resource.
    pub async fn finish(&self, id: ResourceId) {
        let status = self.status_of(id).await;
        self.set_status(id, status, BuildStatus::Success).await;
    }

    pub async fn holder(&self) -> Option<ResourceId> {
        self.store.resource(self.group.id).await.unwrap().build_id
    }

    pub async fn resource_version(&self) -> i32 {
        self.store.resource(self.group.id).await.unwrap().lock_version
    }

    pub async fn count_with_status(&self, status: BuildStatus) -> usize {
        self.store
            .builds_with_status(self.group.id, status)
            .await
            .unwrap()
            .len()
    }

    pub async fn delete_group(&self) {
        self.store.delete_resource_group(self.group.id).await.unwrap();
    }
}
