//! Content fingerprints for cache keys.
//!
//! A fingerprint is the SHA256 of a constraint's canonical JSON image.
//! Two constraints that restrict the same rows the same way hash equal
//! no matter which statement produced them, so cache keys never depend
//! on expression object identity.

use std::fmt;

use serde::Serialize;
use sha2::{Digest, Sha256};

/// A 64-character lowercase hex SHA256 digest.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Fingerprint a serializable value via its JSON image.
    pub fn of<T: Serialize>(value: &T) -> Result<Self, serde_json::Error> {
        let json = serde_json::to_string(value)?;
        let mut hasher = Sha256::new();
        hasher.update(json.as_bytes());
        Ok(Self(format!("{:x}", hasher.finalize())))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
