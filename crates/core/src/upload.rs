//! Upload identifiers.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

const ID_MIN: u128 = 1_000_000_000;
const ID_SPAN: u128 = 9_000_000_000;

/// Identifier of an in-flight upload.
///
/// The cache protocol exposes numeric cache ids, so uploads are keyed by a
/// random ten digit integer. The decimal form doubles as the staging folder
/// name.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UploadId(i64);

impl UploadId {
    /// Generate a new random upload ID.
    pub fn new() -> Self {
        let n = Uuid::new_v4().as_u128() % ID_SPAN + ID_MIN;
        // n < 10^10, always fits in i64
        Self(n as i64)
    }

    /// Wrap an id read back from the metadata store.
    pub fn from_raw(id: i64) -> Self {
        Self(id)
    }

    /// Parse from a string.
    pub fn parse(s: &str) -> crate::Result<Self> {
        let id: i64 = s
            .parse()
            .map_err(|e| crate::Error::InvalidUploadId(format!("{s:?}: {e}")))?;
        if id <= 0 {
            return Err(crate::Error::InvalidUploadId(format!(
                "{id} is not a positive integer"
            )));
        }
        Ok(Self(id))
    }

    pub fn as_i64(&self) -> i64 {
        self.0
    }

    /// Staging folder name used for this upload's parts.
    pub fn folder_name(&self) -> String {
        self.0.to_string()
    }
}

impl Default for UploadId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for UploadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UploadId({})", self.0)
    }
}

impl fmt::Display for UploadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
