//! Projection checkpoint data model

use serde::{Deserialize, Serialize};

/// Status of a registered projection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectionStatus {
    Running,
    Paused,
    Rebuilding,
    Error,
}

impl ProjectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProjectionStatus::Running => "running",
            ProjectionStatus::Paused => "paused",
            ProjectionStatus::Rebuilding => "rebuilding",
            ProjectionStatus::Error => "error",
        }
    }
}

impl std::fmt::Display for ProjectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl From<&str> for ProjectionStatus {
    fn from(s: &str) -> Self {
        match s {
            "paused" => ProjectionStatus::Paused,
            "rebuilding" => ProjectionStatus::Rebuilding,
            "error" => ProjectionStatus::Error,
            _ => ProjectionStatus::Running,
        }
    }
}

/// A projection's position in the log, uniquely keyed by name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectionCheckpoint {
    pub projection_name: String,
    pub last_sequence: i64,
    pub status: ProjectionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl ProjectionCheckpoint {
    pub fn new(projection_name: impl Into<String>) -> Self {
        Self {
            projection_name: projection_name.into(),
            last_sequence: 0,
            status: ProjectionStatus::Running,
            error_message: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_roundtrips_through_string() {
        for status in [
            ProjectionStatus::Running,
            ProjectionStatus::Paused,
            ProjectionStatus::Rebuilding,
            ProjectionStatus::Error,
        ] {
            assert_eq!(ProjectionStatus::from(status.as_str()), status);
        }
    }

    #[test]
    fn new_checkpoint_starts_at_zero_and_running() {
        let cp = ProjectionCheckpoint::new("balances");
        assert_eq!(cp.last_sequence, 0);
        assert_eq!(cp.status, ProjectionStatus::Running);
    }
}
