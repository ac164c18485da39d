//! Projects own resource groups.

use serde::{Deserialize, Serialize};

use crate::ResourceId;

/// User on whose behalf a service runs. Workers run without one.
pub type UserId = ResourceId;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Project {
    pub id: ResourceId,
    pub name: String,
}

impl Project {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: ResourceId::new(),
            name: name.into(),
        }
    }
}
