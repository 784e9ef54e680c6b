use serde::{Deserialize, Serialize};

use crate::{ObjectKey, ObjectKind};

/// Errors raised by stores, views and client facades.
///
/// The variant prefix in the rendered message names the error category so
/// callers further up can log and map them without matching on text.
#[derive(Debug, Clone, thiserror::Error, Serialize, Deserialize, PartialEq, Eq)]
pub enum StoreError {
    #[error("validation: {0}")]
    Validation(String),
    #[error("not_found: {kind:?} {key}")]
    NotFound { kind: ObjectKind, key: ObjectKey },
    #[error("already_exists: {kind:?} {key}")]
    AlreadyExists { kind: ObjectKind, key: ObjectKey },
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("type_mismatch: store holds {expected:?}, got {actual:?}")]
    TypeMismatch { expected: ObjectKind, actual: ObjectKind },
    #[error("bad_patch: {0}")]
    BadPatch(String),
    #[error("unprocessable: {0}")]
    Unprocessable(String),
    #[error("watch_closed: {0}")]
    WatchClosed(String),
    #[error("internal: {0}")]
    Internal(String),
}

impl StoreError {
    pub fn not_found(kind: ObjectKind, key: &ObjectKey) -> Self {
        Self::NotFound { kind, key: key.clone() }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

pub type StoreResult<T> = Result<T, StoreError>;
