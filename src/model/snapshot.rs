//! Snapshot data model

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// A cached, hash-protected copy of an aggregate's folded state at a
/// specific version. `(aggregate_type, aggregate_id, version)` is
/// unique.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub aggregate_type: String,
    pub aggregate_id: Uuid,
    pub version: i64,
    pub sequence: i64,
    pub state: Value,
    pub created_at: DateTime<Utc>,
    pub hash: String,
}

impl Snapshot {
    pub fn hash_state(state: &Value) -> String {
        let bytes = serde_json::to_vec(state).unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(&bytes);
        hex::encode(hasher.finalize())
    }

    /// Recompute `hash(state)` and compare against the stored hash.
    pub fn verify(&self) -> bool {
        Self::hash_state(&self.state) == self.hash
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn verify_detects_tampered_state() {
        let state = json!({"balance": 100});
        let mut snap = Snapshot {
            aggregate_type: "Wallet".into(),
            aggregate_id: Uuid::new_v4(),
            version: 10,
            sequence: 10,
            state: state.clone(),
            created_at: Utc::now(),
            hash: Snapshot::hash_state(&state),
        };
        assert!(snap.verify());

        snap.state = json!({"balance": 999});
        assert!(!snap.verify());
    }
}
