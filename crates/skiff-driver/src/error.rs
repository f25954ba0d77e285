use std::sync::PoisonError;

use skiff_common::error::CommonError;
use thiserror::Error;
use tokio::sync::mpsc::error::SendError;
use tokio::task::JoinError;

pub type DriverResult<T> = Result<T, DriverError>;

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("the driver is not running")]
    NotRunning,
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("error in Tonic transport: {0}")]
    TonicTransportError(#[from] tonic::transport::Error),
    #[error("error in Tonic status: {0}")]
    TonicStatusError(#[from] tonic::Status),
    #[error("internal error: {0}")]
    InternalError(String),
}

impl From<JoinError> for DriverError {
    fn from(error: JoinError) -> Self {
        DriverError::InternalError(error.to_string())
    }
}

impl<T> From<PoisonError<T>> for DriverError {
    fn from(error: PoisonError<T>) -> Self {
        DriverError::InternalError(error.to_string())
    }
}

impl<T> From<SendError<T>> for DriverError {
    fn from(_: SendError<T>) -> Self {
        DriverError::InternalError("failed to send message to a stopped actor".to_string())
    }
}

impl From<CommonError> for DriverError {
    fn from(error: CommonError) -> Self {
        match error {
            CommonError::InvalidArgument(x) => DriverError::InvalidArgument(x),
            CommonError::IoError(x) => DriverError::IoError(x),
            CommonError::InternalError(x) => DriverError::InternalError(x),
        }
    }
}

impl From<DriverError> for tonic::Status {
    fn from(e: DriverError) -> tonic::Status {
        match e {
            DriverError::TonicStatusError(e) => e,
            DriverError::InvalidArgument(x) => tonic::Status::invalid_argument(x),
            e @ DriverError::NotRunning => tonic::Status::failed_precondition(e.to_string()),
            x => tonic::Status::internal(x.to_string()),
        }
    }
}
