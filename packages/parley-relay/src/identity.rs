//! Identity provider seam.
//!
//! The relay never issues credentials. It asks an [`IdentityProvider`] to
//! turn a bearer token into a [`Principal`] and trusts the answer.
//!
//! The bundled [`TokenDirectory`] reads a JSON file of principals whose
//! tokens are stored as SHA-256 hex digests:
//!
//! ```json
//! {
//!   "principals": [
//!     { "id": "alice", "token_sha256": "2bd8...", "privileged": false,
//!       "notify_address": "fcm:abc123" }
//!   ]
//! }
//! ```

use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{RelayError, Result};

/// An authenticated identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    pub id: String,
    /// Elevated-access principal (staff inbox listener).
    #[serde(default)]
    pub privileged: bool,
    /// Opaque offline notification address owned by the dispatcher.
    #[serde(default)]
    pub notify_address: Option<String>,
}

impl Principal {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            privileged: false,
            notify_address: None,
        }
    }

    pub fn privileged(mut self) -> Self {
        self.privileged = true;
        self
    }

    pub fn with_notify_address(mut self, address: &str) -> Self {
        self.notify_address = Some(address.to_string());
        self
    }
}

/// Resolves credentials and principal ids.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Validate a bearer credential.
    async fn verify(&self, credential: &str) -> Result<Principal>;

    /// Look up a principal by id. `Ok(None)` means unknown.
    async fn resolve(&self, principal_id: &str) -> Result<Option<Principal>>;
}

#[derive(Debug, Deserialize)]
struct DirectoryFile {
    principals: Vec<DirectoryEntry>,
}

#[derive(Debug, Deserialize)]
struct DirectoryEntry {
    #[serde(flatten)]
    principal: Principal,
    token_sha256: String,
}

/// In-memory token directory keyed by token digest.
#[derive(Debug, Default)]
pub struct TokenDirectory {
    /// SHA-256 hex of token → principal id
    tokens: HashMap<String, String>,
    /// Principal id → principal
    principals: HashMap<String, Principal>,
}

/// Hex-encoded SHA-256 of a token.
pub fn token_digest(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

impl TokenDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load the directory from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            RelayError::Internal(format!(
                "Failed to read identity file {}: {}",
                path.display(),
                e
            ))
        })?;
        let directory = Self::from_json(&contents)?;

        tracing::info!(
            path = %path.display(),
            principals = directory.principals.len(),
            "Identity directory loaded"
        );
        Ok(directory)
    }

    /// Parse the directory from its JSON representation.
    pub fn from_json(json: &str) -> Result<Self> {
        let file: DirectoryFile = serde_json::from_str(json)
            .map_err(|e| RelayError::Internal(format!("Invalid identity file: {}", e)))?;

        let mut directory = Self::new();
        for entry in file.principals {
            directory.insert_digest(entry.principal, &entry.token_sha256.to_ascii_lowercase());
        }
        Ok(directory)
    }

    /// Register a principal with a plaintext token.
    pub fn insert(&mut self, principal: Principal, token: &str) {
        self.insert_digest(principal, &token_digest(token));
    }

    fn insert_digest(&mut self, principal: Principal, digest: &str) {
        self.tokens.insert(digest.to_string(), principal.id.clone());
        self.principals.insert(principal.id.clone(), principal);
    }

    pub fn len(&self) -> usize {
        self.principals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.principals.is_empty()
    }
}

#[async_trait]
impl IdentityProvider for TokenDirectory {
    async fn verify(&self, credential: &str) -> Result<Principal> {
        if credential.is_empty() {
            return Err(RelayError::AuthError("Missing token".to_string()));
        }

        self.tokens
            .get(&token_digest(credential))
            .and_then(|id| self.principals.get(id))
            .cloned()
            .ok_or_else(|| RelayError::AuthError("Invalid token".to_string()))
    }

    async fn resolve(&self, principal_id: &str) -> Result<Option<Principal>> {
        Ok(self.principals.get(principal_id).cloned())
    }
}
