//! Engine-level error type.

use std::time::Duration;

use thiserror::Error;

use crate::config::ConfigError;
use crate::extent::ExtentError;
use crate::io::{DeviceError, IoFailure, SchedError};
use crate::owner::OwnerId;
use crate::store::{CompressionError, ObjectId};

#[derive(Error, Debug)]
pub enum SwapError {
    #[error(transparent)]
    NoSpace(#[from] ExtentError),

    #[error("Owner {owner} not eligible: {reason}")]
    NotEligible { owner: OwnerId, reason: &'static str },

    #[error("Object id {0} out of range")]
    InvalidObject(ObjectId),

    #[error("Owner id {0} out of range")]
    InvalidOwner(OwnerId),

    #[error("Object {0} holds no data")]
    ObjectMissing(ObjectId),

    #[error("Backing I/O failed: {0}")]
    Io(#[from] IoFailure),

    #[error("Compression failed: {0}")]
    Compression(#[from] CompressionError),

    #[error("Backing device setup failed: {0}")]
    Device(#[from] DeviceError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Engine is shutting down")]
    ShuttingDown,

    #[error("Gave up waiting after {0:?}")]
    Timeout(Duration),
}

impl From<SchedError> for SwapError {
    fn from(err: SchedError) -> Self {
        match err {
            SchedError::ShuttingDown => SwapError::ShuttingDown,
        }
    }
}

pub type Result<T> = std::result::Result<T, SwapError>;
