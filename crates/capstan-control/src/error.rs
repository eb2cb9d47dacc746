use log::error;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use crate::id::ResourceId;

pub type ClusterResult<T> = Result<T, ClusterError>;

#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("internal error: {0}")]
    InternalError(String),
    #[error("input/output error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("error in RPC transport: {0}")]
    TonicTransportError(#[from] tonic::transport::Error),
    #[error("error in RPC call: {0}")]
    RpcError(#[from] tonic::Status),
    #[error("fencing token mismatch: expected {expected}, found {found}")]
    FencingTokenMismatch { expected: String, found: String },
    #[error("unknown task executor: {0}")]
    UnknownTaskExecutor(ResourceId),
    #[error("slot request failure: {0}")]
    SlotRequestFailure(String),
}

impl<T> From<mpsc::error::SendError<T>> for ClusterError {
    fn from(_: mpsc::error::SendError<T>) -> Self {
        ClusterError::InternalError("failed to send message to the actor".to_string())
    }
}

impl From<oneshot::error::RecvError> for ClusterError {
    fn from(_: oneshot::error::RecvError) -> Self {
        ClusterError::InternalError("failed to receive a reply from the actor".to_string())
    }
}

impl From<ClusterError> for tonic::Status {
    fn from(error: ClusterError) -> Self {
        match error {
            ClusterError::InvalidArgument(x) => tonic::Status::invalid_argument(x),
            e @ ClusterError::FencingTokenMismatch { .. } => {
                tonic::Status::failed_precondition(e.to_string())
            }
            e @ ClusterError::UnknownTaskExecutor(_) => tonic::Status::not_found(e.to_string()),
            e @ ClusterError::SlotRequestFailure(_) => {
                tonic::Status::failed_precondition(e.to_string())
            }
            ClusterError::RpcError(status) => status,
            e => tonic::Status::internal(e.to_string()),
        }
    }
}

/// A sink for errors that the resource manager cannot recover from.
/// Implementations must not block; a production handler typically
/// terminates the process so that an external supervisor restarts it.
pub trait FatalErrorHandler: Send + Sync + 'static {
    fn on_fatal_error(&self, error: &ClusterError);
}

/// A fatal error handler that only records the error.
/// Useful for tests and for deployments where an outer layer
/// watches the resource manager health by other means.
pub struct LoggingFatalErrorHandler;

impl FatalErrorHandler for LoggingFatalErrorHandler {
    fn on_fatal_error(&self, error: &ClusterError) {
        error!("fatal error in resource manager: {error}");
    }
}
