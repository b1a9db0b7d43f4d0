//! Server-side copies of S3 objects of any size.
//!
//! A single `CopyObject` call can only copy objects up to 5 GiB. Larger objects
//! have to be copied range by range into a multipart upload with
//! `UploadPartCopy`, which is what [MultipartCopier] does. No object bytes pass
//! through the caller, all data movement happens inside S3.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};
use typed_builder::TypedBuilder;

use super::store::{ObjectStore, RequestOptions};
use super::{ObjectRef, S3Object};

mod error;
mod plan;
mod pool;
#[cfg(test)]
mod test_store;

pub use error::{ConfigError, CopierError};
#[cfg(feature = "test-utils")]
pub use plan::arbitrary;
pub use plan::{
    ByteRange, ByteRangeError, CopyPlan, PartPlan, PartSize, PartSizeError, SourceSize,
    SourceSizeError, DEFAULT_PART_SIZE,
};
use pool::{Deadline, RetryPolicy, Transfer};

/// Number of parts copied at once unless configured otherwise.
pub const DEFAULT_CONCURRENCY: usize = 64;

/// How long a copy may run before it is abandoned, 18 hours.
///
/// The largest object S3 can hold takes around 12.5 hours to copy at 1 Gbps.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(18 * 60 * 60);

/// Retries per part when neither the copier nor the store sets a budget.
pub const DEFAULT_MAX_RETRIES: u32 = 2;

/// Backoff ceiling before the first retry of a part.
pub const DEFAULT_RETRY_BASE_DELAY: Duration = Duration::from_millis(100);

/// What to copy, and where to.
///
/// ```
/// use cobalt_s3_copy::s3::{CopyRequest, S3Object};
///
/// let request = CopyRequest::builder()
///     .source(S3Object::new("source-bucket", "source-key").with_size(1024))
///     .destination(S3Object::new("destination-bucket", "destination-key"))
///     .delete_source(true)
///     .build();
/// ```
#[derive(Debug, Clone, TypedBuilder)]
pub struct CopyRequest<Src, Dst> {
    source: Src,
    destination: Dst,
    /// Delete the source once the copy has succeeded, turning the copy into a move.
    #[builder(default)]
    delete_source: bool,
    /// Region of the source bucket, when it differs from the client's region.
    /// Used to look up the source size and to delete the source.
    #[builder(default, setter(into, strip_option))]
    source_region: Option<String>,
}

impl<Src: ObjectRef, Dst: ObjectRef> CopyRequest<Src, Dst> {
    pub fn source(&self) -> &Src {
        &self.source
    }

    pub fn destination(&self) -> &Dst {
        &self.destination
    }
}

/// The result of a successful copy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopySummary {
    /// Size of the copied object in bytes.
    pub content_length: i64,
    /// Number of parts copied, zero when the object was copied in one call.
    pub part_count: i32,
    /// The committed multipart upload, if one was used.
    pub upload_id: Option<String>,
}

/// Copies S3 objects server-side, splitting large objects into ranges which
/// are copied concurrently.
///
/// Objects smaller than `part_size` are copied with a single `CopyObject`
/// call. Anything larger is copied into a multipart upload, `concurrency`
/// parts at a time. Each part is retried up to `max_retries` times (falling
/// back to the store's retry budget), with an exponential backoff with full
/// jitter between attempts.
///
/// The copy gives up when `timeout` elapses, when `cancellation_token` is
/// cancelled, or, with `cancel_on_signal`, on SIGINT/SIGTERM. In all of these
/// cases an error is returned and deciding whether to exit the process is left
/// to the caller. The timeout covers the whole copy, from the size lookup to
/// completing the upload; aborting the upload and deleting the source are not
/// bounded by it.
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
/// use cobalt_s3_copy::config::load_from_env;
/// use cobalt_s3_copy::s3::{Client, CopyRequest, MultipartCopier, S3Object, S3Store};
///
/// # tokio_test::block_on(async {
/// let shared_config = load_from_env().await.unwrap();
/// let store = Arc::new(S3Store::new(Client::new(&shared_config)));
///
/// let copier = MultipartCopier::builder()
///     .store(store)
///     .part_size(64 * 1024 * 1024)
///     .concurrency(16)
///     .build();
///
/// let request = CopyRequest::builder()
///     .source(S3Object::new("source-bucket", "source-key"))
///     .destination(S3Object::new("destination-bucket", "destination-key"))
///     .build();
/// copier.copy(&request).await.unwrap();
/// # })
/// ```
///
/// # Note
///
/// On failure the multipart upload is left uncommitted unless
/// `abort_on_failure` is set. Uncommitted uploads keep their copied parts,
/// and are billed, until aborted or removed by a bucket lifecycle rule.
#[derive(Debug, TypedBuilder)]
pub struct MultipartCopier<S> {
    store: Arc<S>,
    /// Size of each part in bytes, between 5 MiB and 5 GiB.
    #[builder(default = DEFAULT_PART_SIZE)]
    part_size: i64,
    #[builder(default = DEFAULT_CONCURRENCY)]
    concurrency: usize,
    #[builder(default = DEFAULT_TIMEOUT)]
    timeout: Duration,
    #[builder(default, setter(strip_option))]
    max_retries: Option<u32>,
    #[builder(default = DEFAULT_RETRY_BASE_DELAY)]
    retry_base_delay: Duration,
    #[builder(default)]
    abort_on_failure: bool,
    /// Listen for SIGINT/SIGTERM while parts are being copied.
    ///
    /// Tokio installs its signal handlers for the lifetime of the process, so
    /// once a copy has listened for a signal the process no longer exits on
    /// it by default. Applications that own their shutdown should leave this
    /// off and cancel `cancellation_token` from their own signal handling.
    #[builder(default)]
    cancel_on_signal: bool,
    #[builder(default)]
    cancellation_token: CancellationToken,
    #[builder(default)]
    request_options: RequestOptions,
}

impl<S: ObjectStore> MultipartCopier<S> {
    /// Copy `request.source` to `request.destination`.
    ///
    /// Settings are validated before any call is made to the store. If the
    /// copy succeeds and `delete_source` was requested the source is deleted;
    /// a failed delete is logged but does not fail the copy.
    #[instrument(skip_all, fields(source = %request.source.copy_source(), destination = %request.destination.copy_source()))]
    pub async fn copy<Src: ObjectRef, Dst: ObjectRef>(
        &self,
        request: &CopyRequest<Src, Dst>,
    ) -> Result<CopySummary, CopierError> {
        let part_size = PartSize::try_from(self.part_size).map_err(ConfigError::from)?;
        if self.concurrency == 0 {
            return Err(ConfigError::ZeroConcurrency.into());
        }

        let deadline = self.deadline();
        let source_store = self.source_store(request);
        let content_length = deadline
            .run(self.content_length(&*source_store, &request.source))
            .await?;
        let plan = CopyPlan::new(content_length, part_size)?;
        info!(
            content_length = *content_length.as_ref(),
            part_size = *part_size.as_ref(),
            part_count = plan.part_count(),
            "Starting copy"
        );

        let summary = match plan {
            CopyPlan::SingleShot => {
                deadline.run(self.single_shot(request)).await?;
                CopySummary {
                    content_length: content_length.into(),
                    part_count: 0,
                    upload_id: None,
                }
            }
            CopyPlan::Multipart(parts) => {
                let upload_id = self.multipart(request, parts, &deadline).await?;
                CopySummary {
                    content_length: content_length.into(),
                    part_count: parts.part_count(),
                    upload_id: Some(upload_id),
                }
            }
        };

        if request.delete_source {
            self.delete_source(&*source_store, &request.source.location())
                .await;
        }
        Ok(summary)
    }

    /// The store used for calls against the source object.
    fn source_store<Src, Dst>(&self, request: &CopyRequest<Src, Dst>) -> Arc<S> {
        match request.source_region.as_deref() {
            Some(region) if !region.is_empty() => Arc::new(self.store.for_region(region)),
            _ => Arc::clone(&self.store),
        }
    }

    async fn content_length(
        &self,
        store: &S,
        source: &impl ObjectRef,
    ) -> Result<SourceSize, CopierError> {
        let size = match source.known_size() {
            Some(size) if size > 0 => size,
            _ => store
                .head_object(&source.location(), &self.request_options)
                .await
                .map_err(|error| {
                    warn!(%error, "Failed to get source object info");
                    CopierError::SizeResolution(error)
                })?,
        };
        Ok(SourceSize::try_from(size)?)
    }

    async fn single_shot<Src: ObjectRef, Dst: ObjectRef>(
        &self,
        request: &CopyRequest<Src, Dst>,
    ) -> Result<(), CopierError> {
        info!("Source size is smaller than part size, using atomic copy");
        self.store
            .copy_object(
                &request.destination.location(),
                &request.source.copy_source(),
                &self.request_options,
            )
            .await
            .map_err(|error| {
                warn!(%error, "Copy object failed");
                CopierError::Copy(error)
            })
    }

    /// Copy every part and commit the upload, returning the upload id.
    async fn multipart<Src: ObjectRef, Dst: ObjectRef>(
        &self,
        request: &CopyRequest<Src, Dst>,
        plan: PartPlan,
        deadline: &Deadline,
    ) -> Result<String, CopierError> {
        let destination = request.destination.location();
        let upload_id = deadline
            .run(async {
                self.store
                    .create_multipart_transfer(&destination, &self.request_options)
                    .await
                    .map_err(CopierError::CreateMultipart)
            })
            .await?;
        info!(%upload_id, "Started multipart upload");

        let transfer = Transfer::new(
            plan,
            self.concurrency,
            upload_id.clone(),
            destination.clone(),
            request.source.copy_source(),
        );
        let copied = transfer
            .execute(
                Arc::clone(&self.store),
                self.retry_policy(),
                Arc::new(self.request_options.clone()),
                deadline,
            )
            .await;

        let finalized = match copied {
            Ok(parts) => {
                deadline
                    .run(async {
                        self.store
                            .complete_multipart_transfer(
                                &destination,
                                &upload_id,
                                &parts,
                                &self.request_options,
                            )
                            .await
                            .map_err(|error| {
                                warn!(%error, %upload_id, "Failed to complete multipart upload");
                                CopierError::Finalize(error)
                            })
                    })
                    .await
            }
            Err(error) => Err(error),
        };

        match finalized {
            Ok(()) => {
                info!(%upload_id, "MultipartCopy completed");
                Ok(upload_id)
            }
            Err(error) => {
                self.abandon(&destination, &upload_id).await;
                Err(error)
            }
        }
    }

    async fn abandon(&self, destination: &S3Object, upload_id: &str) {
        if !self.abort_on_failure {
            info!(upload_id, "Leaving multipart upload uncommitted");
            return;
        }
        match self
            .store
            .abort_multipart_transfer(destination, upload_id, &self.request_options)
            .await
        {
            Ok(()) => info!(upload_id, "Aborted multipart upload"),
            Err(error) => warn!(%error, upload_id, "Failed to abort multipart upload"),
        }
    }

    async fn delete_source(&self, store: &S, source: &S3Object) {
        match store.delete_object(source, &self.request_options).await {
            Ok(()) => info!(bucket = %source.bucket, key = %source.key, "Deleted source"),
            Err(error) => warn!(
                %error,
                bucket = %source.bucket,
                key = %source.key,
                "Failed to delete source"
            ),
        }
    }

    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self
                .max_retries
                .or_else(|| self.store.max_retries())
                .unwrap_or(DEFAULT_MAX_RETRIES),
            base_delay: self.retry_base_delay,
        }
    }

    fn deadline(&self) -> Deadline {
        Deadline::starting_now(
            self.timeout,
            self.cancellation_token.clone(),
            self.cancel_on_signal,
        )
    }
}
