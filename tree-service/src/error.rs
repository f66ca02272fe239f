use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::registry::TenantId;

/// Typed failures reported to the caller of a tree operation.
///
/// Every variant is serializable so the server can hand it to `treecli`
/// exactly as the registry or a node produced it.
#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TreeError {
    #[error("no tree with id {tenant_id}")]
    NoSuchTree { tenant_id: TenantId },

    #[error("invalid token")]
    InvalidToken,

    #[error("key {key} already exists with value {value:?}")]
    KeyAlreadyExists { key: i64, value: String },

    #[error("no such key {key}")]
    NoSuchKey { key: i64 },

    #[error("traverse failed: {reason}")]
    TraverseFailed { reason: String },

    /// Raised by `treecli` before anything is sent.
    #[error("missing credentials: pass both --id and --token")]
    MissingCredentials,

    #[error("tree service is not available")]
    Unavailable,

    #[error("protocol error: {message}")]
    Protocol { message: String },
}

impl TreeError {
    pub(crate) fn traverse_failed(reason: impl Into<String>) -> Self {
        TreeError::TraverseFailed {
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, TreeError>;
