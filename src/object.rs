use std::fmt;

use serde::{Deserialize, Serialize};

/// Opaque identity of a world object: numeric id, display key, and the type
/// identifier used for event-type resolution.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjRef {
    pub id: u64,
    pub key: String,
    pub type_id: String,
}

impl ObjRef {
    pub fn new(id: u64, key: impl Into<String>, type_id: impl Into<String>) -> Self {
        Self { id, key: key.into(), type_id: type_id.into() }
    }
}

impl fmt::Display for ObjRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.key)
    }
}
