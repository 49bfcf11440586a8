//! Error taxonomy for the storage and resolution layers.

use thiserror::Error;
use uuid::Uuid;

/// Failures raised by a document-store backend. These propagate unchanged;
/// retry policy is the caller's business.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store io error")]
    Io(#[from] std::io::Error),

    #[error("store serialization error")]
    Serde(#[from] serde_json::Error),

    #[error("no auxiliary store named '{0}'")]
    UnknownStore(String),

    #[error("blob {blob_uuid} missing from auxiliary store '{store}'")]
    MissingBlob { blob_uuid: Uuid, store: String },

    #[error("store backend error: {0}")]
    Backend(String),
}

/// Failures raised while resolving an output reference against a store.
#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("no output found for {uuid}")]
    Missing { uuid: Uuid },

    #[error("selector '{selector}' does not apply to the output of {uuid}")]
    BadPath { uuid: Uuid, selector: String },

    #[error("malformed reference encoding: {0}")]
    Malformed(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}
