//! Configuration loaded from the environment: the shared
//! [aws_types::SdkConfig](https://docs.rs/aws-types/latest/aws_types/sdk_config/struct.SdkConfig.html),
//! the copier settings, and the tracing subscriber.

use anyhow::{Context, Result};
use aws_types::SdkConfig;
use clap::Parser;
use http::Uri;
use std::ffi::OsString;
use std::iter::empty;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::filter::EnvFilter;

use crate::s3::{
    CopyRequest, MultipartCopier, ObjectRef, ObjectStore, RequestOptions, DEFAULT_CONCURRENCY,
    DEFAULT_PART_SIZE, DEFAULT_RETRY_BASE_DELAY, DEFAULT_TIMEOUT,
};

/// Create a shared `SdkConfig` with LocalStack support.
///
/// # Example
///
/// ```
/// use cobalt_s3_copy::config::load_from_env;
/// use cobalt_s3_copy::s3::Client;
///
/// # tokio_test::block_on(async {
/// let shared_config = load_from_env().await.unwrap();
/// let client = Client::new(&shared_config);
/// # })
/// ```
///
/// ## LocalStack
///
/// If you want to communicate with a [LocalStack](https://localstack.cloud/) instance,
/// set the environment variable `LOCALSTACK_HOSTNAME`:
///
/// ```shell
/// $ export LOCALSTACK_HOSTNAME=localhost
/// ```
///
/// You can also optionally set the `EDGE_PORT` variable if you need something other
/// than the default of `4566`.
///
/// ## Errors
///
/// An error will be returned if `LOCALSTACK_HOSTNAME` is set and a valid URI cannot be constructed.
///
pub async fn load_from_env() -> Result<SdkConfig> {
    let mut shared_config = aws_config::from_env();
    if let Some(uri) = localstack_endpoint()? {
        shared_config = shared_config.endpoint_url(uri.to_string());
    }
    Ok(shared_config.load().await)
}

/// The LocalStack endpoint variables.
///
/// Ref: https://docs.localstack.cloud/references/configuration/
#[derive(Debug, Parser)]
struct LocalStackEnv {
    #[arg(long, env)]
    localstack_hostname: Option<String>,
    #[arg(long, env, default_value = "4566")]
    edge_port: String,
}

fn localstack_endpoint() -> Result<Option<Uri>> {
    let env = LocalStackEnv::try_parse_from(empty::<OsString>())
        .context("An error occurred while parsing the LocalStack environment variables.")?;
    match env.localstack_hostname {
        Some(host) => {
            let uri = format!("http://{}:{}", host, env.edge_port);
            let uri =
                Uri::from_str(&uri).context(format!("Failed to parse LocalStack URI: {}", uri))?;
            Ok(Some(uri))
        }
        None => Ok(None),
    }
}

/// Copier settings read from `COPY_*` environment variables.
///
/// Unset variables fall back to the [MultipartCopier] defaults.
///
/// | Variable | Default |
/// |---|---|
/// | `COPY_PART_SIZE` | 500 MiB, in bytes |
/// | `COPY_CONCURRENCY` | 64 |
/// | `COPY_TIMEOUT_SECS` | 18 hours |
/// | `COPY_MAX_RETRIES` | the client's retry budget |
/// | `COPY_RETRY_BASE_DELAY_MS` | 100 |
/// | `COPY_ABORT_ON_FAILURE` | false |
/// | `COPY_DELETE_SOURCE` | false |
/// | `COPY_SOURCE_REGION` | the client's region |
/// | `COPY_REQUESTER_PAYS` | false |
/// | `COPY_EXPECTED_BUCKET_OWNER` | unset |
#[derive(Debug, Clone, PartialEq, Eq, Parser)]
pub struct CopierEnv {
    #[arg(long, env, default_value_t = DEFAULT_PART_SIZE)]
    pub copy_part_size: i64,
    #[arg(long, env, default_value_t = DEFAULT_CONCURRENCY)]
    pub copy_concurrency: usize,
    #[arg(long, env, default_value_t = DEFAULT_TIMEOUT.as_secs())]
    pub copy_timeout_secs: u64,
    #[arg(long, env)]
    pub copy_max_retries: Option<u32>,
    #[arg(long, env, default_value_t = DEFAULT_RETRY_BASE_DELAY.as_millis() as u64)]
    pub copy_retry_base_delay_ms: u64,
    #[arg(long, env)]
    pub copy_abort_on_failure: bool,
    #[arg(long, env)]
    pub copy_delete_source: bool,
    #[arg(long, env)]
    pub copy_source_region: Option<String>,
    #[arg(long, env)]
    pub copy_requester_pays: bool,
    #[arg(long, env)]
    pub copy_expected_bucket_owner: Option<String>,
}

impl CopierEnv {
    /// Read the settings from the environment only, ignoring command line arguments.
    pub fn from_env() -> Result<Self> {
        CopierEnv::try_parse_from(empty::<OsString>())
            .context("An error occurred while parsing the copier environment variables.")
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.copy_timeout_secs)
    }

    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.copy_retry_base_delay_ms)
    }

    pub fn request_options(&self) -> RequestOptions {
        RequestOptions {
            requester_pays: self.copy_requester_pays,
            expected_bucket_owner: self.copy_expected_bucket_owner.clone(),
        }
    }

    /// A copier using these settings, stopped early by `cancellation`. Part
    /// size and concurrency are validated when a copy starts.
    pub fn copier<S: ObjectStore>(
        &self,
        store: Arc<S>,
        cancellation: CancellationToken,
    ) -> MultipartCopier<S> {
        let builder = MultipartCopier::builder()
            .store(store)
            .cancellation_token(cancellation)
            .part_size(self.copy_part_size)
            .concurrency(self.copy_concurrency)
            .timeout(self.timeout())
            .retry_base_delay(self.retry_base_delay())
            .abort_on_failure(self.copy_abort_on_failure)
            .request_options(self.request_options());
        match self.copy_max_retries {
            Some(max_retries) => builder.max_retries(max_retries).build(),
            None => builder.build(),
        }
    }

    /// A request to copy `source` to `destination` using these settings.
    pub fn request<Src: ObjectRef, Dst: ObjectRef>(
        &self,
        source: Src,
        destination: Dst,
    ) -> CopyRequest<Src, Dst> {
        let builder = CopyRequest::builder()
            .source(source)
            .destination(destination)
            .delete_source(self.copy_delete_source);
        match &self.copy_source_region {
            Some(region) => builder.source_region(region.clone()).build(),
            None => builder.build(),
        }
    }
}

/// Install a JSON [tracing_subscriber] filtered by `RUST_LOG`, defaulting to `info`.
///
/// ## Errors
///
/// An error will be returned if a global subscriber has already been installed.
pub fn init_tracing() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .try_init()
        .map_err(anyhow::Error::msg)
}
