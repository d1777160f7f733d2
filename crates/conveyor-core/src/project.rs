//! Project registry entries.

use serde::{Deserialize, Serialize};

/// A configured project: the owner of the builds triggered for it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    /// Unique project name.
    pub name: String,
    /// Names of the jobs every build of this project runs.
    pub jobs: Vec<String>,
}

impl Project {
    pub fn new(name: impl Into<String>, jobs: Vec<String>) -> Self {
        Self {
            name: name.into(),
            jobs,
        }
    }
}
