use thiserror::Error;

/// Errors raised while canonicalizing a payload for hashing.
#[derive(Debug, Error)]
pub enum CanonicalizeError {
    #[error("null is not representable inside a hashed array")]
    NullInArray,

    #[error("failed to serialize canonical value: {0}")]
    Serialize(#[from] serde_json::Error),
}
