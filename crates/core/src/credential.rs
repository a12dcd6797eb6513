//! API credentials and their fingerprints.
//!
//! Users who paste the same API key share one rate limit bucket and one
//! snapshot cache entry, so everything downstream of registration keys on
//! [`CredentialKey`] rather than on the user.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Opaque marketplace API key.
///
/// `Debug` and `Display` never print the key itself.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Credential(String);

impl Credential {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Raw key for the `Authorization` header.
    pub fn expose(&self) -> &str {
        &self.0
    }

    /// Stable fingerprint used for rate limiting and caching.
    pub fn key(&self) -> CredentialKey {
        let digest = Sha256::digest(self.0.as_bytes());
        CredentialKey(hex::encode(&digest[..8]))
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Credential").field(&self.key().0).finish()
    }
}

impl fmt::Display for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "credential:{}", self.key())
    }
}

/// Fingerprint of a [`Credential`]: hex of the first 8 bytes of its SHA-256.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CredentialKey(String);

impl CredentialKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CredentialKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A credential together with the moment the user last replaced it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialRecord {
    pub credential: Credential,
    pub updated_at: DateTime<Utc>,
}

impl CredentialRecord {
    pub fn new(credential: Credential) -> Self {
        Self {
            credential,
            updated_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_key_same_fingerprint() {
        let a = Credential::new("eyJhbGciOiJFUzI1NiJ9.secret");
        let b = Credential::new("eyJhbGciOiJFUzI1NiJ9.secret");
        let c = Credential::new("another");
        assert_eq!(a.key(), b.key());
        assert_ne!(a.key(), c.key());
        assert_eq!(a.key().as_str().len(), 16);
    }

    #[test]
    fn test_debug_does_not_leak_key() {
        let cred = Credential::new("super-secret-token");
        let printed = format!("{:?} {}", cred, cred);
        assert!(!printed.contains("super-secret-token"));
        assert!(printed.contains(cred.key().as_str()));
    }

    #[test]
    fn test_blank_credential_is_empty() {
        assert!(Credential::new("   ").is_empty());
        assert!(!Credential::new("k").is_empty());
    }
}
