//! # Cobalt S3 copy
//!
//! This library copies S3 objects of any size without moving their bytes
//! through the caller. Objects smaller than one part are copied with a single
//! `CopyObject` call; larger objects are split into byte ranges which are
//! copied concurrently into a multipart upload with `UploadPartCopy`, retried
//! part by part, and committed in part order.
//!
//! It is built on the [aws-sdk-rust](https://github.com/awslabs/aws-sdk-rust)
//! packages and shares its conventions with the `cobalt-aws` wrapper library.
//!
//! * [MultipartCopier](s3::MultipartCopier) runs a copy.
//! * [config] loads an SDK config and copier settings from the environment.
//!
//! ### About harrison.ai
//!
//! This crate is maintained by the Data Engineering team at [harrison.ai](https://harrison.ai).
//!
//! At [harrison.ai](https://harrison.ai) our mission is to create AI-as-a-medical-device solutions through
//! ventures and ultimately improve the standard of healthcare for 1 million lives every day.
//!

// Public modules

pub mod config;
pub mod s3;
pub mod types;
