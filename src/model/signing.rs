//! Event signing
//!
//! Signing is optional non-repudiation layered on top of the hash
//! chain: the chain already proves an event hasn't been altered since
//! commit, a signature additionally proves *who* committed it. Kept
//! behind a trait with `None` and `Ed25519` variants (spec §9's
//! redesign of the teacher's mock signature service) so real
//! deployments can bind a key registry without the core depending on
//! any particular key-management scheme.

use std::collections::HashMap;

use ed25519_dalek::{Signature, Signer as DalekSigner, SigningKey, Verifier, VerifyingKey};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SigningError {
    #[error("unknown signer id: {0}")]
    UnknownSigner(String),

    #[error("signature verification failed")]
    InvalidSignature,

    #[error("malformed signature encoding: {0}")]
    Malformed(String),
}

/// Something that can sign a hash and identify itself.
pub trait Signer: Send + Sync {
    /// Sign the hex-encoded content hash of an event, returning the
    /// signature encoded as lower-case hex, and the signer id to store
    /// alongside it.
    fn sign(&self, hash_hex: &str) -> Result<(String, String), SigningError>;
}

/// No signing. `append`'s `signature`/`signer_id` fields stay `None`.
pub struct NoneSigner;

impl Signer for NoneSigner {
    fn sign(&self, _hash_hex: &str) -> Result<(String, String), SigningError> {
        Err(SigningError::UnknownSigner("none-signer never signs".into()))
    }
}

/// Signs with a single Ed25519 keypair, identified by `signer_id`.
pub struct Ed25519Signer {
    signer_id: String,
    signing_key: SigningKey,
}

impl Ed25519Signer {
    pub fn new(signer_id: impl Into<String>, signing_key: SigningKey) -> Self {
        Self {
            signer_id: signer_id.into(),
            signing_key,
        }
    }
}

impl Signer for Ed25519Signer {
    fn sign(&self, hash_hex: &str) -> Result<(String, String), SigningError> {
        let signature: Signature = self.signing_key.sign(hash_hex.as_bytes());
        Ok((hex::encode(signature.to_bytes()), self.signer_id.clone()))
    }
}

/// A read-only-after-initialization registry of verifying keys, keyed
/// by signer id. Deployments populate this once at startup; the core
/// never mutates it afterward.
#[derive(Default)]
pub struct KeyRegistry {
    keys: HashMap<String, VerifyingKey>,
}

impl KeyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_key(mut self, signer_id: impl Into<String>, key: VerifyingKey) -> Self {
        self.keys.insert(signer_id.into(), key);
        self
    }

    /// Verify a hex-encoded signature over a hex-encoded hash, against
    /// the registered key for `signer_id`.
    pub fn verify(
        &self,
        signer_id: &str,
        hash_hex: &str,
        signature_hex: &str,
    ) -> Result<(), SigningError> {
        let key = self
            .keys
            .get(signer_id)
            .ok_or_else(|| SigningError::UnknownSigner(signer_id.to_string()))?;

        let sig_bytes = hex::decode(signature_hex)
            .map_err(|e| SigningError::Malformed(e.to_string()))?;
        let sig_array: [u8; 64] = sig_bytes
            .try_into()
            .map_err(|_| SigningError::Malformed("signature must be 64 bytes".into()))?;
        let signature = Signature::from_bytes(&sig_array);

        key.verify(hash_hex.as_bytes(), &signature)
            .map_err(|_| SigningError::InvalidSignature)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::SigningKey;
    use rand::rngs::OsRng;

    #[test]
    fn ed25519_sign_and_verify_round_trip() {
        let signing_key = SigningKey::generate(&mut OsRng);
        let verifying_key = signing_key.verifying_key();

        let signer = Ed25519Signer::new("key-1", signing_key);
        let registry = KeyRegistry::new().with_key("key-1", verifying_key);

        let hash_hex = "deadbeef";
        let (sig_hex, signer_id) = signer.sign(hash_hex).unwrap();
        assert_eq!(signer_id, "key-1");
        registry.verify(&signer_id, hash_hex, &sig_hex).unwrap();
    }

    #[test]
    fn verify_rejects_tampered_hash() {
        let signing_key = SigningKey::generate(&mut OsRng);
        let verifying_key = signing_key.verifying_key();
        let signer = Ed25519Signer::new("key-1", signing_key);
        let registry = KeyRegistry::new().with_key("key-1", verifying_key);

        let (sig_hex, signer_id) = signer.sign("deadbeef").unwrap();
        let result = registry.verify(&signer_id, "other-hash", &sig_hex);
        assert!(result.is_err());
    }

    #[test]
    fn unknown_signer_is_rejected() {
        let registry = KeyRegistry::new();
        let result = registry.verify("missing", "hash", "00");
        assert!(matches!(result, Err(SigningError::UnknownSigner(_))));
    }

    #[test]
    fn none_signer_never_signs() {
        let signer = NoneSigner;
        assert!(signer.sign("whatever").is_err());
    }
}
