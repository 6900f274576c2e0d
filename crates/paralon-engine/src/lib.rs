pub mod compositor;
pub mod dryrun;
pub mod orchestrator;
pub mod remote;
pub mod store;

use paralon_contracts::errors::{ConstraintError, ErrorBody, ErrorCode};
use thiserror::Error;

pub use compositor::{CompositeSpec, CompositorError, StyleCompositor};
pub use dryrun::DryrunRemote;
pub use orchestrator::{OperationOutcome, Orchestrator, Stage};
pub use remote::{RemoteClient, RemoteConfig, RemoteError, RemoteImages, RetryPolicy};
pub use store::{ImageStore, StorageError};

/// Everything a request can fail with, as seen by the HTTP layer.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Constraint(#[from] ConstraintError),
    #[error(transparent)]
    Remote(#[from] RemoteError),
    #[error(transparent)]
    Storage(StorageError),
    #[error(transparent)]
    Compositor(CompositorError),
    #[error("asset '{0}' not found")]
    NotFound(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<StorageError> for EngineError {
    fn from(value: StorageError) -> Self {
        match value {
            StorageError::NotFound(id) => EngineError::NotFound(id),
            other => EngineError::Storage(other),
        }
    }
}

impl From<CompositorError> for EngineError {
    fn from(value: CompositorError) -> Self {
        match value {
            CompositorError::Storage(err) => EngineError::from(err),
            other => EngineError::Compositor(other),
        }
    }
}

impl EngineError {
    pub fn code(&self) -> ErrorCode {
        match self {
            EngineError::Constraint(_) => ErrorCode::Validation,
            EngineError::NotFound(_) => ErrorCode::NotFound,
            EngineError::Remote(RemoteError::Timeout { .. }) => ErrorCode::RemoteTimeout,
            EngineError::Remote(RemoteError::Rejected { .. }) => ErrorCode::RemoteRejected,
            EngineError::Remote(_) => ErrorCode::RemoteUnavailable,
            EngineError::Storage(_) => ErrorCode::Storage,
            EngineError::Compositor(_) => ErrorCode::Compositor,
            EngineError::Internal(_) => ErrorCode::Internal,
        }
    }

    pub fn messages(&self) -> Vec<String> {
        match self {
            EngineError::Constraint(err) => err.messages(),
            other => vec![other.to_string()],
        }
    }

    pub fn body(&self) -> ErrorBody {
        ErrorBody::new(self.code(), self.messages())
    }
}
