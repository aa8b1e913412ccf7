//! Cache entry coordinates.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// The `(key, version, scope)` triple that identifies a cache entry or an
/// in-flight upload.
///
/// `scope` is an opaque isolation namespace resolved by the caller (for
/// example a branch ref). The empty string is a valid scope.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheTriple {
    pub key: String,
    pub version: String,
    pub scope: String,
}

impl CacheTriple {
    /// Build a triple, rejecting empty keys and empty versions.
    pub fn new(
        key: impl Into<String>,
        version: impl Into<String>,
        scope: impl Into<String>,
    ) -> Result<Self> {
        let key = key.into();
        let version = version.into();
        validate_key(&key)?;
        if version.is_empty() {
            return Err(Error::InvalidVersion("version must not be empty".to_string()));
        }
        Ok(Self {
            key,
            version,
            scope: scope.into(),
        })
    }
}

/// Check a lookup or storage key. Restore keys go through this as well.
/// Keys have no length limit.
pub fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(Error::InvalidKey("key must not be empty".to_string()));
    }
    Ok(())
}

impl fmt::Debug for CacheTriple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CacheTriple({}@{} in {:?})", self.key, self.version, self.scope)
    }
}
