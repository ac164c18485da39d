//! Core domain types for SlotLock.
//!
//! This crate contains:
//! - Resource identifiers
//! - Projects and users
//! - Resource groups, their single-slot resource and process modes
//! - The minimal build view the admission controller reads and writes

pub mod build;
pub mod error;
pub mod id;
pub mod project;
pub mod resource_group;

pub use build::{Build, BuildStatus};
pub use error::{Error, Result};
pub use id::ResourceId;
pub use project::{Project, UserId};
pub use resource_group::{ProcessMode, Resource, ResourceGroup};
