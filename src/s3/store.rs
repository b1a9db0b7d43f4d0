//! The object-store calls a server-side copy is built from.

use std::sync::Arc;

use async_trait::async_trait;
use aws_sdk_s3::config::Region;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart, RequestPayer};
use aws_sdk_s3::Client;
use thiserror::Error;
use tracing::instrument;

use super::multipartcopy::ByteRange;
use super::S3Object;
use crate::types::BoxError;

/// Request options applied verbatim to every store call of a copy.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestOptions {
    /// Acknowledge that the requester pays for requests against
    /// requester-pays buckets.
    pub requester_pays: bool,
    /// Fail calls if the bucket is not owned by this account id.
    pub expected_bucket_owner: Option<String>,
}

impl RequestOptions {
    fn request_payer(&self) -> Option<RequestPayer> {
        self.requester_pays.then_some(RequestPayer::Requester)
    }
}

/// One range of the source to be copied into a multipart upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkItem {
    /// 1-based part number.
    pub part_number: i32,
    /// Where the multipart upload is being assembled.
    pub destination: S3Object,
    /// The `bucket/key` copy source locator.
    pub copy_source: String,
    /// Bytes of the source this part covers.
    pub byte_range: ByteRange,
    /// Multipart upload id.
    pub upload_id: String,
}

/// A copied part, as needed by `CompleteMultipartUpload`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartResult {
    pub part_number: i32,
    pub e_tag: String,
}

/// Fields the store left out of an otherwise successful response.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Missing content length")]
    MissingContentLength,
    #[error("Missing multipart upload id")]
    MissingUploadId,
    #[error("Missing copy part result")]
    MissingCopyPartResult,
    #[error("Missing ETag for part {0}")]
    MissingETag(i32),
}

/// The control-plane calls of an object store that supports server-side copies.
///
/// [S3Store] implements this over the AWS SDK. Errors are returned type-erased,
/// the copier only logs them and folds them into its own [CopierError](super::CopierError).
#[async_trait]
pub trait ObjectStore: Send + Sync + 'static {
    /// Size of an object in bytes.
    async fn head_object(&self, object: &S3Object, options: &RequestOptions)
        -> Result<i64, BoxError>;

    /// Copy a whole object in one call.
    async fn copy_object(
        &self,
        destination: &S3Object,
        copy_source: &str,
        options: &RequestOptions,
    ) -> Result<(), BoxError>;

    /// Start a multipart upload, returning its id.
    async fn create_multipart_transfer(
        &self,
        destination: &S3Object,
        options: &RequestOptions,
    ) -> Result<String, BoxError>;

    /// Copy one range of the source into the multipart upload.
    async fn copy_range(
        &self,
        item: &WorkItem,
        options: &RequestOptions,
    ) -> Result<PartResult, BoxError>;

    /// Commit a multipart upload from parts ordered by part number.
    async fn complete_multipart_transfer(
        &self,
        destination: &S3Object,
        upload_id: &str,
        parts: &[PartResult],
        options: &RequestOptions,
    ) -> Result<(), BoxError>;

    /// Discard a multipart upload and any parts copied into it.
    async fn abort_multipart_transfer(
        &self,
        destination: &S3Object,
        upload_id: &str,
        options: &RequestOptions,
    ) -> Result<(), BoxError>;

    async fn delete_object(&self, object: &S3Object, options: &RequestOptions)
        -> Result<(), BoxError>;

    /// How many times a failed part copy may be retried, if the store has an opinion.
    fn max_retries(&self) -> Option<u32> {
        None
    }

    /// The same store, talking to another region.
    fn for_region(&self, region: &str) -> Self
    where
        Self: Sized;
}

/// An [ObjectStore] backed by an [aws_sdk_s3::Client].
#[derive(Debug, Clone)]
pub struct S3Store {
    client: Arc<Client>,
}

impl S3Store {
    pub fn new(client: Client) -> Self {
        Self::from(Arc::new(client))
    }

    pub fn client(&self) -> &Client {
        &self.client
    }
}

impl From<Arc<Client>> for S3Store {
    fn from(client: Arc<Client>) -> Self {
        S3Store { client }
    }
}

#[async_trait]
impl ObjectStore for S3Store {
    #[instrument(skip(self))]
    async fn head_object(
        &self,
        object: &S3Object,
        options: &RequestOptions,
    ) -> Result<i64, BoxError> {
        let head_object = self
            .client
            .head_object()
            .bucket(&object.bucket)
            .key(&object.key)
            .set_request_payer(options.request_payer())
            .set_expected_bucket_owner(options.expected_bucket_owner.clone())
            .send()
            .await?;

        Ok(head_object
            .content_length()
            .ok_or(StoreError::MissingContentLength)?)
    }

    #[instrument(skip(self))]
    async fn copy_object(
        &self,
        destination: &S3Object,
        copy_source: &str,
        options: &RequestOptions,
    ) -> Result<(), BoxError> {
        self.client
            .copy_object()
            .copy_source(copy_source)
            .bucket(&destination.bucket)
            .key(&destination.key)
            .set_request_payer(options.request_payer())
            .set_expected_bucket_owner(options.expected_bucket_owner.clone())
            .send()
            .await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn create_multipart_transfer(
        &self,
        destination: &S3Object,
        options: &RequestOptions,
    ) -> Result<String, BoxError> {
        let output = self
            .client
            .create_multipart_upload()
            .bucket(&destination.bucket)
            .key(&destination.key)
            .set_request_payer(options.request_payer())
            .set_expected_bucket_owner(options.expected_bucket_owner.clone())
            .send()
            .await?;

        let upload_id = output.upload_id().ok_or(StoreError::MissingUploadId)?;
        Ok(upload_id.to_owned())
    }

    #[instrument(skip(self), fields(part_number = item.part_number))]
    async fn copy_range(
        &self,
        item: &WorkItem,
        options: &RequestOptions,
    ) -> Result<PartResult, BoxError> {
        let response = self
            .client
            .upload_part_copy()
            .bucket(&item.destination.bucket)
            .key(&item.destination.key)
            .part_number(item.part_number)
            .upload_id(&item.upload_id)
            .copy_source(&item.copy_source)
            .copy_source_range(item.byte_range.as_string())
            .set_request_payer(options.request_payer())
            .set_expected_bucket_owner(options.expected_bucket_owner.clone())
            .send()
            .await?;

        let e_tag = response
            .copy_part_result()
            .ok_or(StoreError::MissingCopyPartResult)?
            .e_tag()
            .ok_or(StoreError::MissingETag(item.part_number))?;

        Ok(PartResult {
            part_number: item.part_number,
            e_tag: e_tag.to_owned(),
        })
    }

    #[instrument(skip(self, parts), fields(parts = parts.len()))]
    async fn complete_multipart_transfer(
        &self,
        destination: &S3Object,
        upload_id: &str,
        parts: &[PartResult],
        options: &RequestOptions,
    ) -> Result<(), BoxError> {
        let parts = parts
            .iter()
            .map(|part| {
                CompletedPart::builder()
                    .e_tag(&part.e_tag)
                    .part_number(part.part_number)
                    .build()
            })
            .collect();
        let completed_multipart_upload = CompletedMultipartUpload::builder()
            .set_parts(Some(parts))
            .build();

        self.client
            .complete_multipart_upload()
            .bucket(&destination.bucket)
            .key(&destination.key)
            .upload_id(upload_id)
            .multipart_upload(completed_multipart_upload)
            .set_request_payer(options.request_payer())
            .set_expected_bucket_owner(options.expected_bucket_owner.clone())
            .send()
            .await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn abort_multipart_transfer(
        &self,
        destination: &S3Object,
        upload_id: &str,
        options: &RequestOptions,
    ) -> Result<(), BoxError> {
        self.client
            .abort_multipart_upload()
            .bucket(&destination.bucket)
            .key(&destination.key)
            .upload_id(upload_id)
            .set_request_payer(options.request_payer())
            .set_expected_bucket_owner(options.expected_bucket_owner.clone())
            .send()
            .await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn delete_object(
        &self,
        object: &S3Object,
        options: &RequestOptions,
    ) -> Result<(), BoxError> {
        self.client
            .delete_object()
            .bucket(&object.bucket)
            .key(&object.key)
            .set_request_payer(options.request_payer())
            .set_expected_bucket_owner(options.expected_bucket_owner.clone())
            .send()
            .await?;
        Ok(())
    }

    /// The SDK counts the first attempt in `max_attempts`.
    fn max_retries(&self) -> Option<u32> {
        self.client
            .config()
            .retry_config()
            .map(|retry| retry.max_attempts().saturating_sub(1))
    }

    fn for_region(&self, region: &str) -> Self {
        let config = self
            .client
            .config()
            .to_builder()
            .region(Region::new(region.to_owned()))
            .build();
        S3Store::new(Client::from_conf(config))
    }
}
