//! Resource group admission control for SlotLock.
//!
//! Assigns a resource group's single slot to the next waiting build and
//! drives those assignments from a deduplicating job queue.
//! The PostgreSQL queue claims jobs with SKIP LOCKED so any number of
//! worker processes can share it.

pub mod assign;
pub mod dedup;
pub mod lifecycle;
pub mod queue;
pub mod resource_group_worker;
pub mod worker;

pub use assign::{
    AssignOutcome, AssignResourceFromResourceGroupService, ResourceEvent, select_candidate,
    sort_backlog,
};
pub use dedup::{DeduplicationOptions, DeduplicationStrategy, IfDeduplicated};
pub use lifecycle::{ResourceGroupLifecycle, enqueue_resource_group_assignment};
pub use resource_group_worker::assignment_args;
pub use queue::{ClaimedJob, EnqueueOutcome, JobQueue, MemoryJobQueue, NewJob, PgJobQueue};
pub use resource_group_worker::{
    AssignResourceFromResourceGroupWorker, AssignResourceFromResourceGroupWorkerV2,
};
pub use worker::{Worker, WorkerRegistry, WorkerRunner};

#[cfg(test)]
mod test_support;
