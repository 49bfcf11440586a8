//! Error taxonomy for the workflow layer.

use thiserror::Error;
use uuid::Uuid;

use skein_core::{ResolveError, StoreError};

use crate::registry::FunctionToken;

#[derive(Debug, Error)]
pub enum FlowError {
    /// Input resolution failed before the job's function was called.
    #[error("failed to resolve inputs: {0}")]
    Resolve(#[from] ResolveError),

    #[error(transparent)]
    Store(#[from] StoreError),

    /// The job's function raised. Never recovered on behalf of user code;
    /// dependents are skipped and the run continues with independent work.
    #[error("job '{name}' ({uuid}, index {index}) failed")]
    Execution {
        name: String,
        uuid: Uuid,
        index: u32,
        #[source]
        source: anyhow::Error,
    },

    #[error("function '{token}' is not registered")]
    UnknownFunction { token: FunctionToken },

    #[error("duplicate uuid {uuid} in flow '{name}'")]
    Duplicate { uuid: Uuid, name: String },

    /// A replace/detour/addition payload that cannot be scheduled.
    /// Fatal to the run.
    #[error("invalid graft: {0}")]
    Graft(String),

    #[error("dependency cycle in flow '{0}'")]
    Cycle(String),
}
