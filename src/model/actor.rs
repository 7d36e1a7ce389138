//! Actor attribution
//!
//! Every event is attributed to exactly one actor. `Actor` is never null;
//! the `Anonymous` variant exists for callers that must record *why* no
//! identity was available rather than omitting attribution entirely.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The entity responsible for an event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Actor {
    /// A human or organizational identity.
    Entity { id: Uuid },
    /// An internal system process.
    System { id: String },
    /// A workflow or saga instance.
    Workflow { id: Uuid },
    /// No identity was available; `reason` records why.
    Anonymous { reason: String },
}

impl Actor {
    /// Canonical form used as hash input: `{kind}:{id}`, with `reason`
    /// appended as a suffix for `Anonymous`.
    pub fn canonical(&self) -> String {
        match self {
            Actor::Entity { id } => format!("entity:{id}"),
            Actor::System { id } => format!("system:{id}"),
            Actor::Workflow { id } => format!("workflow:{id}"),
            Actor::Anonymous { reason } => format!("anonymous:{reason}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_form_matches_spec_grammar() {
        let id = Uuid::nil();
        assert_eq!(Actor::Entity { id }.canonical(), format!("entity:{id}"));
        assert_eq!(
            Actor::System { id: "scheduler".into() }.canonical(),
            "system:scheduler"
        );
        assert_eq!(
            Actor::Anonymous { reason: "unauthenticated webhook".into() }.canonical(),
            "anonymous:unauthenticated webhook"
        );
    }

    #[test]
    fn serde_roundtrip() {
        let actor = Actor::Workflow { id: Uuid::new_v4() };
        let json = serde_json::to_string(&actor).unwrap();
        let back: Actor = serde_json::from_str(&json).unwrap();
        assert_eq!(actor, back);
    }
}
