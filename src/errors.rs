use thiserror::Error;

use crate::object::ObjRef;

/// Store-level failures surfaced to the caller. Dispatch-level problems never
/// reach here; dispatch returns a bool and logs instead.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("event {name} #{index} of {obj} is locked")]
    LockedEvent { obj: ObjRef, name: String, index: usize },
    #[error("event {name} #{index} of {obj} does not exist")]
    MissingFragment { obj: ObjRef, name: String, index: usize },
}
