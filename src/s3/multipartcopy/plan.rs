//! Sizing rules and range planning for server-side copies.

use std::fmt;

use bytesize::{GIB, MIB, TIB};
use derive_more::{AsRef, Display, Into};
use either::Either;
use thiserror::Error;

use super::CopierError;

/// The minimum allowed source size for an S3 object, set to 0 bytes.
///
/// Empty objects are valid in S3, and are always copied with a single
/// `CopyObject` call.
pub(crate) const MIN_SOURCE_SIZE: i64 = 0;

/// The maximum allowed source size for an S3 object, set to 5 TiB.
pub(crate) const MAX_SOURCE_SIZE: i64 = 5 * TIB as i64;

/// The minimum allowed part size for S3 multipart uploads, set to 5 MiB.
///
/// Only the last part of a multipart upload may be smaller than this.
pub(crate) const MIN_PART_SIZE: i64 = 5 * MIB as i64;

/// The maximum allowed part size for S3 multipart uploads, set to 5 GiB.
pub(crate) const MAX_PART_SIZE: i64 = 5 * GIB as i64;

/// The maximum number of parts S3 accepts in one multipart upload.
pub(crate) const MAX_PART_COUNT: i64 = 10_000;

/// The default part size, 500 MiB.
///
/// At this size objects of up to ~4.88 TiB fit in [MAX_PART_COUNT] parts.
pub const DEFAULT_PART_SIZE: i64 = 500 * MIB as i64;

/// Errors that can occur when creating a `SourceSize`.
#[derive(Debug, Error)]
pub enum SourceSizeError {
    #[error("S3 Object must be at least {MIN_SOURCE_SIZE} bytes. Object size was {0}")]
    TooSmall(i64),
    #[error("S3 Object must be at most {MAX_SOURCE_SIZE} bytes, Object size was {0}")]
    TooLarge(i64),
}

/// Represents a valid source size for an S3 object, between 0 bytes and 5 TiB.
#[derive(Debug, Display, Into, AsRef, Clone, Copy, Eq, PartialEq)]
#[into(owned, ref, ref_mut)]
pub struct SourceSize(i64);

impl TryFrom<i64> for SourceSize {
    type Error = SourceSizeError;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        if value < MIN_SOURCE_SIZE {
            Err(SourceSizeError::TooSmall(value))
        } else if value > MAX_SOURCE_SIZE {
            Err(SourceSizeError::TooLarge(value))
        } else {
            Ok(SourceSize(value))
        }
    }
}

/// Represents a valid part size for S3 multipart copies, between 5 MiB and 5 GiB.
#[derive(Debug, Display, Into, AsRef, Clone, Copy, Eq, PartialEq)]
#[into(owned, ref, ref_mut)]
pub struct PartSize(i64);

impl Default for PartSize {
    fn default() -> Self {
        Self(DEFAULT_PART_SIZE)
    }
}

#[derive(Debug, Error)]
pub enum PartSizeError {
    #[error("part_size must be at least {MIN_PART_SIZE} bytes. part_size was {0}")]
    TooSmall(i64),
    #[error("part_size must be at most {MAX_PART_SIZE} bytes, part_size was {0}")]
    TooLarge(i64),
}

impl TryFrom<i64> for PartSize {
    type Error = PartSizeError;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        if value < MIN_PART_SIZE {
            Err(PartSizeError::TooSmall(value))
        } else if value > MAX_PART_SIZE {
            Err(PartSizeError::TooLarge(value))
        } else {
            Ok(PartSize(value))
        }
    }
}

/// Errors that can occur when creating a `ByteRange`.
#[derive(Debug, Error)]
pub enum ByteRangeError {
    #[error("The start byte must be less than or equal to the end byte \n start: {0}, end: {1}")]
    InvalidRange(i64, i64),
    #[error("The start byte must be non-negative: \n start {0}")]
    NegativeStart(i64),
}

/// An inclusive range of bytes, `[start, end]`, within the source object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange(i64, i64);

impl TryFrom<(i64, i64)> for ByteRange {
    type Error = ByteRangeError;

    fn try_from(value: (i64, i64)) -> Result<Self, Self::Error> {
        let (start, end) = value;

        if start < 0 {
            Err(ByteRangeError::NegativeStart(start))
        } else if start > end {
            Err(ByteRangeError::InvalidRange(start, end))
        } else {
            Ok(ByteRange(start, end))
        }
    }
}

impl ByteRange {
    /// The first byte of the range.
    pub fn start(&self) -> i64 {
        self.0
    }

    /// The last byte of the range (inclusive).
    pub fn end(&self) -> i64 {
        self.1
    }

    /// Number of bytes covered by the range.
    pub fn len(&self) -> i64 {
        self.1 - self.0 + 1
    }

    /// A range always covers at least one byte.
    pub fn is_empty(&self) -> bool {
        false
    }

    /// Renders the range as the value of a `x-amz-copy-source-range` header.
    ///
    /// ```
    /// use cobalt_s3_copy::s3::ByteRange;
    ///
    /// let range = ByteRange::try_from((500, 999)).unwrap();
    /// assert_eq!(range.as_string(), "bytes=500-999");
    /// ```
    pub fn as_string(&self) -> String {
        let ByteRange(start, end) = self;
        format!("bytes={}-{}", start, end)
    }
}

impl fmt::Display for ByteRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "bytes={}-{}", self.0, self.1)
    }
}

/// How a copy of a given size is carried out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyPlan {
    /// The object is smaller than one part and is copied with one `CopyObject` call.
    SingleShot,
    /// The object is split into ranges, each copied with `UploadPartCopy`.
    Multipart(PartPlan),
}

/// The split of a source object into contiguous parts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartPlan {
    content_length: i64,
    part_size: i64,
    part_count: i32,
}

impl CopyPlan {
    /// Decide between a single-shot and a multipart copy.
    ///
    /// Objects strictly smaller than `part_size` (including empty objects) are
    /// copied in a single call. Anything else becomes `ceil(source / part_size)`
    /// parts, which must not exceed the S3 limit of 10,000 parts.
    pub fn new(source: SourceSize, part_size: PartSize) -> Result<Self, CopierError> {
        let content_length = source.0;
        let part_size = part_size.0;

        if content_length < part_size {
            return Ok(CopyPlan::SingleShot);
        }

        let part_count = part_count(content_length, part_size);
        if part_count > MAX_PART_COUNT {
            return Err(CopierError::TooManyParts {
                part_count,
                max: MAX_PART_COUNT,
            });
        }

        Ok(CopyPlan::Multipart(PartPlan {
            content_length,
            part_size,
            part_count: i32::try_from(part_count)?,
        }))
    }

    /// The number of parts in the plan, zero for a single-shot copy.
    pub fn part_count(&self) -> i32 {
        match self {
            CopyPlan::SingleShot => 0,
            CopyPlan::Multipart(plan) => plan.part_count,
        }
    }

    /// The `(part_number, range)` pairs of the plan, in ascending part order.
    pub fn ranges(&self) -> impl Iterator<Item = (i32, ByteRange)> {
        match self {
            CopyPlan::SingleShot => Either::Left(std::iter::empty()),
            CopyPlan::Multipart(plan) => Either::Right(plan.ranges()),
        }
    }
}

impl PartPlan {
    /// Size of the source object in bytes.
    pub fn content_length(&self) -> i64 {
        self.content_length
    }

    /// Size of every part but the last.
    pub fn part_size(&self) -> i64 {
        self.part_size
    }

    /// Total number of parts.
    pub fn part_count(&self) -> i32 {
        self.part_count
    }

    /// The `(part_number, range)` pairs, with part numbers `1..=part_count`.
    /// The last range is clamped to the end of the object.
    pub fn ranges(self) -> impl Iterator<Item = (i32, ByteRange)> {
        (1..=self.part_count).map(move |part_number| {
            let start = i64::from(part_number - 1) * self.part_size;
            let end = std::cmp::min(start + self.part_size - 1, self.content_length - 1);
            (part_number, ByteRange(start, end))
        })
    }
}

fn part_count(content_length: i64, part_size: i64) -> i64 {
    (content_length + part_size - 1) / part_size
}

#[cfg(any(test, feature = "test-utils"))]
pub mod arbitrary {
    use derive_more::{AsRef, From, Into};
    use proptest::prelude::*;

    use super::{
        PartSize, SourceSize, MAX_PART_SIZE, MAX_SOURCE_SIZE, MIN_PART_SIZE, MIN_SOURCE_SIZE,
    };

    impl Arbitrary for PartSize {
        type Parameters = ();
        type Strategy = BoxedStrategy<Self>;

        fn arbitrary_with(_args: Self::Parameters) -> Self::Strategy {
            (MIN_PART_SIZE..=MAX_PART_SIZE).prop_map(PartSize).boxed()
        }
    }

    impl Arbitrary for SourceSize {
        type Parameters = ();
        type Strategy = BoxedStrategy<Self>;

        fn arbitrary_with(_args: Self::Parameters) -> Self::Strategy {
            (MIN_SOURCE_SIZE..=MAX_SOURCE_SIZE).prop_map(SourceSize).boxed()
        }
    }

    /// A source size of at least one byte.
    #[derive(Debug, Clone, PartialEq, Eq, AsRef, Into, From)]
    pub struct NonZeroSourceSize(SourceSize);

    impl Arbitrary for NonZeroSourceSize {
        type Parameters = ();
        type Strategy = BoxedStrategy<Self>;

        fn arbitrary_with(_args: Self::Parameters) -> Self::Strategy {
            (1..=MAX_SOURCE_SIZE)
                .prop_map(SourceSize)
                .prop_map(NonZeroSourceSize)
                .boxed()
        }
    }
}
