use crate::models::{StatusFilter, Task, TimeWindow};
use thiserror::Error;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum TaskStoreError {
    #[error("Notion authorization expired or was revoked. Please log in again.")]
    Unauthorized,
    #[error("Notion database does not match the task template: {0}")]
    ValidationError(String),
    #[error("No Notion database selected.")]
    NotConfigured,
    #[error("{0}")]
    Other(String),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Recovery {
    Relogin,
    ReselectDatabase,
    Retry,
}

impl TaskStoreError {
    pub fn recovery(&self) -> Recovery {
        match self {
            TaskStoreError::Unauthorized => Recovery::Relogin,
            TaskStoreError::ValidationError(_) | TaskStoreError::NotConfigured => {
                Recovery::ReselectDatabase
            }
            TaskStoreError::Other(_) => Recovery::Retry,
        }
    }
}

/// Remote task backend consumed by the sync engine. Calls may block.
pub trait TaskStore: Send + Sync {
    /// Returns the new remote id.
    fn create(&self, task: &Task) -> Result<String, TaskStoreError>;
    fn update(&self, task: &Task) -> Result<(), TaskStoreError>;
    fn list(&self, window: &TimeWindow, filter: StatusFilter) -> Result<Vec<Task>, TaskStoreError>;
    fn tags(&self) -> Result<Vec<String>, TaskStoreError>;
    /// Replaces the tag options; returns the options the backend kept.
    fn set_tags(&self, tags: &[String]) -> Result<Vec<String>, TaskStoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errors_map_to_distinct_recoveries() {
        assert_eq!(TaskStoreError::Unauthorized.recovery(), Recovery::Relogin);
        assert_eq!(
            TaskStoreError::ValidationError("status missing".to_string()).recovery(),
            Recovery::ReselectDatabase
        );
        assert_eq!(TaskStoreError::Other("boom".to_string()).recovery(), Recovery::Retry);
    }

    #[test]
    fn other_error_surfaces_message_verbatim() {
        assert_eq!(TaskStoreError::Other("HTTP 502".to_string()).to_string(), "HTTP 502");
    }
}
