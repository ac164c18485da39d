//! Build lifecycle hooks that feed the resource group assignment queue.

use slotlock_core::{BuildStatus, Error, ResourceId, Result};
use slotlock_db::{BuildRepo, DbError, DbResult, ResourceGroupRepo};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::assign::ResourceEvent;
use crate::dedup::DeduplicationOptions;
use crate::queue::{EnqueueOutcome, JobQueue, NewJob};
use crate::resource_group_worker::{AssignResourceFromResourceGroupWorkerV2, assignment_args};

/// Enqueue an assignment attempt for the group on the deduplicated worker.
pub async fn enqueue_resource_group_assignment(
    queue: &dyn JobQueue,
    resource_group_id: ResourceId,
    deduplication: DeduplicationOptions,
) -> DbResult<EnqueueOutcome> {
    let job = NewJob::new(
        AssignResourceFromResourceGroupWorkerV2::NAME,
        assignment_args(resource_group_id),
    )
    .deduplication(deduplication);
    let outcome = queue.enqueue(job).await?;
    debug!(resource_group_id = %resource_group_id, %outcome, "Enqueued resource assignment");
    Ok(outcome)
}

/// Moves builds into and out of their resource group's slot.
pub struct ResourceGroupLifecycle {
    groups: Arc<dyn ResourceGroupRepo>,
    builds: Arc<dyn BuildRepo>,
    queue: Arc<dyn JobQueue>,
    deduplication: DeduplicationOptions,
    events: Option<mpsc::Sender<ResourceEvent>>,
}

impl ResourceGroupLifecycle {
    pub fn new(
        groups: Arc<dyn ResourceGroupRepo>,
        builds: Arc<dyn BuildRepo>,
        queue: Arc<dyn JobQueue>,
    ) -> Self {
        Self {
            groups,
            builds,
            queue,
            deduplication: DeduplicationOptions::until_executing(),
            events: None,
        }
    }

    /// Must match the options the V2 worker runs with.
    pub fn with_deduplication(mut self, deduplication: DeduplicationOptions) -> Self {
        self.deduplication = deduplication;
        self
    }

    pub fn with_events(mut self, events: mpsc::Sender<ResourceEvent>) -> Self {
        self.events = Some(events);
        self
    }

    /// Put a ready build in its group's queue and schedule an assignment.
    pub async fn request_resource(&self, build_id: ResourceId) -> Result<EnqueueOutcome> {
        let build = self.builds.get_build(build_id).await?;
        let Some(resource_group_id) = build.resource_group_id else {
            return Err(Error::InvalidInput(format!(
                "build {} has no resource group",
                build_id
            )));
        };

        match build.status {
            BuildStatus::WaitingForResource => {}
            status if status.can_request_resource() => {
                self.builds
                    .transition_build(build_id, status, BuildStatus::WaitingForResource)
                    .await?;
                info!(build_id = %build_id, resource_group_id = %resource_group_id, "Build waiting for resource");
            }
            status => {
                return Err(Error::InvalidInput(format!(
                    "build {} cannot request a resource while {}",
                    build_id, status
                )));
            }
        }

        Ok(
            enqueue_resource_group_assignment(
                self.queue.as_ref(),
                resource_group_id,
                self.deduplication,
            )
            .await?,
        )
    }

    /// Release the slot held by a completed build and wake the group.
    ///
    /// Enqueues an assignment even when the build did not hold the slot so
    /// a waiting build is never stranded. Returns `None` when the build has
    /// no group or the group is gone.
    pub async fn build_finished(&self, build_id: ResourceId) -> Result<Option<EnqueueOutcome>> {
        let build = self.builds.get_build(build_id).await?;
        if !build.status.is_complete() {
            return Err(Error::InvalidInput(format!(
                "build {} is not finished ({})",
                build_id, build.status
            )));
        }
        let Some(resource_group_id) = build.resource_group_id else {
            return Ok(None);
        };

        let mut lock = match self.groups.lock(resource_group_id).await {
            Ok(lock) => lock,
            Err(DbError::NotFound(_)) => {
                debug!(resource_group_id = %resource_group_id, "Resource group not found, nothing to release");
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        if lock.resource().build_id == Some(build_id) {
            lock.release_resource().await?;
            lock.commit().await?;
            info!(build_id = %build_id, resource_group_id = %resource_group_id, "Released resource");

            if let Some(tx) = &self.events {
                let event = ResourceEvent::Released {
                    resource_group_id,
                    build_id,
                };
                if let Err(e) = tx.try_send(event) {
                    debug!(resource_group_id = %resource_group_id, error = %e, "Dropped resource event");
                }
            }
        } else {
            drop(lock);
        }

        let outcome = enqueue_resource_group_assignment(
            self.queue.as_ref(),
            resource_group_id,
            self.deduplication,
        )
        .await?;
        Ok(Some(outcome))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::MemoryJobQueue;
    use crate::test_support::Fixture;
    use slotlock_core::ProcessMode;

    struct Harness {
        fx: Fixture,
        queue: MemoryJobQueue,
        lifecycle: ResourceGroupLifecycle,
        runner: crate::WorkerRunner,
    }

    async fn harness(mode: ProcessMode) -> Harness {
        let fx = Fixture::new(mode).await;
        let queue = MemoryJobQueue::new();
        let lifecycle = fx.lifecycle(&queue);
        let runner = fx.runner(&queue);
        Harness {
            fx,
            queue,
            lifecycle,
            runner,
        }
    }

    /// Run the holder to completion and report it finished.
    async fn finish_holder(h: &Harness) -> ResourceId {
        let holder = h.fx.holder().await.expect("resource should be held");
        h.fx
            .set_status(holder, BuildStatus::Pending, BuildStatus::Running)
            .await;
        h.fx
            .set_status(holder, BuildStatus::Running, BuildStatus::Success)
            .await;
        h.lifecycle.build_finished(holder).await.unwrap();
        holder
    }

    #[tokio::test]
    async fn test_request_resource_then_assign() {
        let h = harness(ProcessMode::Unordered).await;
        let build = h.fx.created_build("deploy").await;

        let outcome = h.lifecycle.request_resource(build.id).await.unwrap();
        assert!(!outcome.is_deduplicated());
        assert_eq!(
            h.fx.status_of(build.id).await,
            BuildStatus::WaitingForResource
        );

        h.runner.run_until_idle().await.unwrap();
        assert_eq!(h.fx.status_of(build.id).await, BuildStatus::Pending);
        assert_eq!(h.fx.holder().await, Some(build.id));
    }

    #[tokio::test]
    async fn test_request_resource_rejects_running_build() {
        let h = harness(ProcessMode::Unordered).await;
        let build = h.fx.created_build("deploy").await;
        h.fx
            .set_status(build.id, BuildStatus::Created, BuildStatus::Running)
            .await;

        let result = h.lifecycle.request_resource(build.id).await;
        assert!(matches!(result, Err(Error::InvalidInput(_))));
        assert_eq!(h.queue.pending_len().await, 0);
    }

    #[tokio::test]
    async fn test_request_resource_requires_group() {
        let h = harness(ProcessMode::Unordered).await;
        let build = h.fx.ungrouped_build("lint").await;

        let result = h.lifecycle.request_resource(build.id).await;
        assert!(matches!(result, Err(Error::InvalidInput(_))));
    }

    #[tokio::test]
    async fn test_duplicate_requests_reschedule_once() {
        let h = harness(ProcessMode::OldestFirst).await;
        let b1 = h.fx.created_build("b1").await;
        let b2 = h.fx.created_build("b2").await;

        h.lifecycle.request_resource(b1.id).await.unwrap();
        let second = h.lifecycle.request_resource(b2.id).await.unwrap();
        assert!(second.is_deduplicated());
        assert_eq!(h.queue.pending_len().await, 1);

        // One run plus exactly one follow-up
        assert_eq!(h.runner.run_until_idle().await.unwrap(), 2);
        assert_eq!(h.queue.completed_len().await, 2);
        assert_eq!(h.fx.holder().await, Some(b1.id));
        assert_eq!(h.fx.status_of(b2.id).await, BuildStatus::WaitingForResource);
    }

    #[tokio::test]
    async fn test_busy_then_release_assigns_next() {
        let h = harness(ProcessMode::OldestFirst).await;
        let b1 = h.fx.created_build("b1").await;
        let b2 = h.fx.created_build("b2").await;

        h.lifecycle.request_resource(b1.id).await.unwrap();
        h.runner.run_until_idle().await.unwrap();
        h.lifecycle.request_resource(b2.id).await.unwrap();
        h.runner.run_until_idle().await.unwrap();

        assert_eq!(h.fx.holder().await, Some(b1.id));
        assert_eq!(h.fx.status_of(b2.id).await, BuildStatus::WaitingForResource);

        assert_eq!(finish_holder(&h).await, b1.id);
        assert_eq!(h.fx.holder().await, None);

        h.runner.run_until_idle().await.unwrap();
        assert_eq!(h.fx.holder().await, Some(b2.id));
        assert_eq!(h.fx.status_of(b2.id).await, BuildStatus::Pending);
    }

    #[tokio::test]
    async fn test_finished_non_holder_still_wakes_group() {
        let h = harness(ProcessMode::Unordered).await;
        let build = h.fx.created_build("b1").await;
        h.fx
            .set_status(build.id, BuildStatus::Created, BuildStatus::Canceled)
            .await;

        let outcome = h.lifecycle.build_finished(build.id).await.unwrap();
        assert!(outcome.is_some());
        assert_eq!(h.queue.pending_len().await, 1);
    }

    #[tokio::test]
    async fn test_build_finished_requires_complete_status() {
        let h = harness(ProcessMode::Unordered).await;
        let build = h.fx.created_build("b1").await;

        let result = h.lifecycle.build_finished(build.id).await;
        assert!(matches!(result, Err(Error::InvalidInput(_))));
    }

    #[tokio::test]
    async fn test_build_finished_after_group_deleted() {
        let h = harness(ProcessMode::Unordered).await;
        let build = h.fx.created_build("b1").await;
        h.fx
            .set_status(build.id, BuildStatus::Created, BuildStatus::Failed)
            .await;
        h.fx.delete_group().await;

        assert_eq!(h.lifecycle.build_finished(build.id).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_release_publishes_event() {
        let fx = Fixture::new(ProcessMode::Unordered).await;
        let queue = MemoryJobQueue::new();
        let (tx, mut rx) = mpsc::channel(8);
        let lifecycle = fx.lifecycle(&queue).with_events(tx);
        let build = fx.waiting_build("b1").await;
        fx.service().execute(&fx.group).await.unwrap();
        fx.set_status(build.id, BuildStatus::Pending, BuildStatus::Success)
            .await;

        lifecycle.build_finished(build.id).await.unwrap();
        assert_eq!(
            rx.recv().await,
            Some(ResourceEvent::Released {
                resource_group_id: fx.group.id,
                build_id: build.id,
            })
        );
    }

    #[tokio::test]
    async fn test_release_with_full_event_channel_still_enqueues() {
        let fx = Fixture::new(ProcessMode::Unordered).await;
        let queue = MemoryJobQueue::new();
        let (tx, _rx) = mpsc::channel(1);
        tx.try_send(ResourceEvent::Released {
            resource_group_id: fx.group.id,
            build_id: fx.group.id,
        })
        .unwrap();
        let lifecycle = fx.lifecycle(&queue).with_events(tx);
        let build = fx.waiting_build("b1").await;
        fx.service().execute(&fx.group).await.unwrap();
        fx.set_status(build.id, BuildStatus::Pending, BuildStatus::Success)
            .await;

        let outcome = tokio::time::timeout(
            std::time::Duration::from_secs(5),
            lifecycle.build_finished(build.id),
        )
        .await
        .unwrap()
        .unwrap();

        assert!(outcome.is_some());
        assert_eq!(fx.holder().await, None);
        assert_eq!(queue.pending_len().await, 1);
    }

    #[tokio::test]
    async fn test_drains_backlog_one_at_a_time() {
        let h = harness(ProcessMode::OldestFirst).await;
        let mut builds = Vec::new();
        for i in 0..5 {
            let build = h.fx.created_build(&format!("b{}", i)).await;
            h.lifecycle.request_resource(build.id).await.unwrap();
            builds.push(build.id);
        }

        let mut served = Vec::new();
        for _ in 0..builds.len() {
            h.runner.run_until_idle().await.unwrap();
            let active = h.fx.count_with_status(BuildStatus::Pending).await;
            assert_eq!(active, 1, "exactly one build may hold the resource");
            served.push(finish_holder(&h).await);
        }
        h.runner.run_until_idle().await.unwrap();

        assert_eq!(served, builds);
        assert_eq!(h.fx.holder().await, None);
        assert_eq!(h.fx.count_with_status(BuildStatus::WaitingForResource).await, 0);
    }
}
