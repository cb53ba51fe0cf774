use serde::{Deserialize, Serialize};

/// A task the user focuses on. Only the fields the timer needs are carried here.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,
    pub project_id: Option<String>,
    pub title: String,
    /// Focus minutes confirmed by the remote store.
    pub accumulated_minutes: u32,
}

impl Task {
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            project_id: None,
            title: title.into(),
            accumulated_minutes: 0,
        }
    }

    pub fn with_project(mut self, project_id: impl Into<String>) -> Self {
        self.project_id = Some(project_id.into());
        self
    }
}
