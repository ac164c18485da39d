//! Repository traits and implementations.

pub mod build;
pub mod memory;
pub mod project;
pub mod resource_group;

pub use build::{BuildRepo, BuildRow, NewBuild, PgBuildRepo};
pub use memory::MemoryStore;
pub use project::{PgProjectRepo, ProjectRepo};
pub use resource_group::{
    DEFAULT_LOCK_TIMEOUT, PgResourceGroupLock, PgResourceGroupRepo, ResourceGroupLock,
    ResourceGroupRepo,
};
