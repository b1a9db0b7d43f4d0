//! Server-side copies of objects held in [S3](https://docs.aws.amazon.com/s3/),
//! built on the [aws_sdk_s3](https://docs.rs/aws-sdk-s3/latest/aws_sdk_s3/) crate.

/// Re-export of [aws_sdk_s3::client::Client](https://docs.rs/aws-sdk-s3/latest/aws_sdk_s3/client/struct.Client.html).
///
pub use aws_sdk_s3::Client;

mod multipartcopy;
mod s3_object;
mod store;

pub use multipartcopy::{
    ByteRange, ByteRangeError, ConfigError, CopierError, CopyPlan, CopyRequest, CopySummary,
    MultipartCopier, PartPlan, PartSize, PartSizeError, SourceSize, SourceSizeError,
    DEFAULT_CONCURRENCY, DEFAULT_MAX_RETRIES, DEFAULT_PART_SIZE, DEFAULT_RETRY_BASE_DELAY,
    DEFAULT_TIMEOUT,
};
#[cfg(feature = "test-utils")]
pub use multipartcopy::arbitrary;
pub use s3_object::{ObjectRef, ObjectUrlError, S3Object, SizedS3Object};
pub use store::{ObjectStore, PartResult, RequestOptions, S3Store, StoreError, WorkItem};
