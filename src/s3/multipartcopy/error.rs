use std::num::TryFromIntError;
use std::time::Duration;

use thiserror::Error;
use tokio::task::JoinError;

use super::plan::{PartSizeError, SourceSizeError};
use crate::types::BoxError;

/// Invalid copier settings, detected before any call is made to the store.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error(transparent)]
    PartSize(#[from] PartSizeError),
    #[error("concurrency must be at least 1")]
    ZeroConcurrency,
}

/// The single terminal error of a copy operation.
#[derive(Debug, Error)]
pub enum CopierError {
    #[error("invalid copier configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("failed to get content length: {0}")]
    SizeResolution(#[source] BoxError),
    #[error(transparent)]
    SourceSize(#[from] SourceSizeError),
    #[error("copy would need {part_count} parts, S3 allows at most {max}; use a larger part size")]
    TooManyParts { part_count: i64, max: i64 },
    #[error(transparent)]
    TryFromIntError(#[from] TryFromIntError),
    #[error("copy object failed: {0}")]
    Copy(#[source] BoxError),
    #[error("failed to create multipart upload: {0}")]
    CreateMultipart(#[source] BoxError),
    #[error("part {part_number} failed after {attempts} attempts: {source}")]
    PartCopy {
        part_number: i32,
        attempts: u32,
        #[source]
        source: BoxError,
    },
    #[error("copy timed out after {0:?}")]
    Timeout(Duration),
    #[error("copy was cancelled")]
    Cancelled,
    #[error("copy was interrupted by {signal}")]
    Interrupted { signal: &'static str },
    #[error("parts {0:?} were never collected")]
    MissingParts(Vec<i32>),
    #[error("failed to complete multipart upload: {0}")]
    Finalize(#[source] BoxError),
    #[error(transparent)]
    Task(#[from] JoinError),
}
