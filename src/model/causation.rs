//! Causation metadata
//!
//! Links an event back to the command that produced it. `command_id` is
//! the replay-prevention nonce (spec I6); `correlation_id` threads
//! related events together for the query surface; `workflow_id` names
//! the saga/workflow instance, if any.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Causation {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command_id: Option<Uuid>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<Uuid>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub workflow_id: Option<Uuid>,
}

impl Causation {
    pub fn new() -> Self {
        Self {
            command_id: None,
            correlation_id: None,
            workflow_id: None,
        }
    }

    pub fn with_command_id(mut self, command_id: Uuid) -> Self {
        self.command_id = Some(command_id);
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: Uuid) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }

    pub fn with_workflow_id(mut self, workflow_id: Uuid) -> Self {
        self.workflow_id = Some(workflow_id);
        self
    }

    /// Canonical form for hashing: empty string when no causation was
    /// supplied, otherwise `cmd|corr|wf` with blanks for absent fields.
    pub fn canonical(&self) -> String {
        if self.command_id.is_none() && self.correlation_id.is_none() && self.workflow_id.is_none()
        {
            return String::new();
        }
        format!(
            "{}|{}|{}",
            self.command_id.map(|u| u.to_string()).unwrap_or_default(),
            self.correlation_id.map(|u| u.to_string()).unwrap_or_default(),
            self.workflow_id.map(|u| u.to_string()).unwrap_or_default(),
        )
    }
}

impl Default for Causation {
    fn default() -> Self {
        Self::new()
    }
}
