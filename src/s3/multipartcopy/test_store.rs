//! A scripted, recording [ObjectStore] for exercising the copier without S3.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::Notify;

use super::ByteRange;
use crate::s3::store::{ObjectStore, PartResult, RequestOptions, WorkItem};
use crate::s3::S3Object;
use crate::types::BoxError;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct FakeError(pub String);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Head {
        object: S3Object,
        region: Option<String>,
    },
    Copy {
        destination: S3Object,
        copy_source: String,
    },
    Create(S3Object),
    CopyRange {
        part_number: i32,
        range: ByteRange,
        copy_source: String,
        upload_id: String,
    },
    Complete {
        upload_id: String,
        parts: Vec<PartResult>,
    },
    Abort(String),
    Delete {
        object: S3Object,
        region: Option<String>,
    },
}

/// State shared by a store and the stores it hands out for other regions.
#[derive(Debug, Default)]
struct Recorder {
    calls: Mutex<Vec<Call>>,
    options: Mutex<Vec<RequestOptions>>,
    attempts: Mutex<HashMap<i32, u32>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    range_started: Notify,
}

#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    size: Option<i64>,
    region: Option<String>,
    retry_hint: Option<u32>,
    /// Part number to the number of attempts that fail before one succeeds.
    failing_parts: HashMap<i32, u32>,
    hanging_parts: HashSet<i32>,
    part_delays: HashMap<i32, Duration>,
    fail_head: bool,
    fail_copy: bool,
    hang_copy: bool,
    fail_complete: bool,
    hang_complete: bool,
    fail_delete: bool,
    recorder: Arc<Recorder>,
}

impl MemoryStore {
    pub fn with_size(size: i64) -> Self {
        MemoryStore {
            size: Some(size),
            ..Default::default()
        }
    }

    pub fn retry_hint(mut self, retries: u32) -> Self {
        self.retry_hint = Some(retries);
        self
    }

    /// Fail the first `failures` attempts of `part_number`.
    pub fn failing_part(mut self, part_number: i32, failures: u32) -> Self {
        self.failing_parts.insert(part_number, failures);
        self
    }

    pub fn hanging_part(mut self, part_number: i32) -> Self {
        self.hanging_parts.insert(part_number);
        self
    }

    pub fn part_delay(mut self, part_number: i32, delay: Duration) -> Self {
        self.part_delays.insert(part_number, delay);
        self
    }

    pub fn failing_head(mut self) -> Self {
        self.fail_head = true;
        self
    }

    pub fn failing_copy(mut self) -> Self {
        self.fail_copy = true;
        self
    }

    pub fn hanging_copy(mut self) -> Self {
        self.hang_copy = true;
        self
    }

    pub fn hanging_complete(mut self) -> Self {
        self.hang_complete = true;
        self
    }

    pub fn failing_complete(mut self) -> Self {
        self.fail_complete = true;
        self
    }

    pub fn failing_delete(mut self) -> Self {
        self.fail_delete = true;
        self
    }

    pub fn calls(&self) -> Vec<Call> {
        self.recorder.calls.lock().unwrap().clone()
    }

    pub fn options_seen(&self) -> Vec<RequestOptions> {
        self.recorder.options.lock().unwrap().clone()
    }

    pub fn max_in_flight(&self) -> usize {
        self.recorder.max_in_flight.load(Ordering::SeqCst)
    }

    /// Notified every time a range copy starts.
    pub async fn range_started(&self) {
        self.recorder.range_started.notified().await
    }

    pub fn range_calls(&self) -> Vec<i32> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::CopyRange { part_number, .. } => Some(part_number),
                _ => None,
            })
            .collect()
    }

    pub fn completions(&self) -> Vec<Vec<PartResult>> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::Complete { parts, .. } => Some(parts),
                _ => None,
            })
            .collect()
    }

    pub fn deletes(&self) -> Vec<Call> {
        self.calls()
            .into_iter()
            .filter(|call| matches!(call, Call::Delete { .. }))
            .collect()
    }

    fn record(&self, call: Call, options: &RequestOptions) {
        self.recorder.calls.lock().unwrap().push(call);
        self.recorder.options.lock().unwrap().push(options.clone());
    }

    fn next_attempt(&self, part_number: i32) -> u32 {
        let mut attempts = self.recorder.attempts.lock().unwrap();
        let attempt = attempts.entry(part_number).or_default();
        *attempt += 1;
        *attempt
    }
}

pub fn e_tag(part_number: i32) -> String {
    format!("\"etag-{part_number}\"")
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn head_object(
        &self,
        object: &S3Object,
        options: &RequestOptions,
    ) -> Result<i64, BoxError> {
        self.record(
            Call::Head {
                object: object.clone(),
                region: self.region.clone(),
            },
            options,
        );
        match self.size {
            Some(size) if !self.fail_head => Ok(size),
            _ => Err(FakeError("NoSuchKey".into()).into()),
        }
    }

    async fn copy_object(
        &self,
        destination: &S3Object,
        copy_source: &str,
        options: &RequestOptions,
    ) -> Result<(), BoxError> {
        self.record(
            Call::Copy {
                destination: destination.clone(),
                copy_source: copy_source.to_owned(),
            },
            options,
        );
        if self.hang_copy {
            futures::future::pending::<()>().await;
        }
        if self.fail_copy {
            return Err(FakeError("AccessDenied".into()).into());
        }
        Ok(())
    }

    async fn create_multipart_transfer(
        &self,
        destination: &S3Object,
        options: &RequestOptions,
    ) -> Result<String, BoxError> {
        self.record(Call::Create(destination.clone()), options);
        Ok("upload-1".into())
    }

    async fn copy_range(
        &self,
        item: &WorkItem,
        options: &RequestOptions,
    ) -> Result<PartResult, BoxError> {
        self.record(
            Call::CopyRange {
                part_number: item.part_number,
                range: item.byte_range,
                copy_source: item.copy_source.clone(),
                upload_id: item.upload_id.clone(),
            },
            options,
        );
        let attempt = self.next_attempt(item.part_number);

        let in_flight = self.recorder.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.recorder
            .max_in_flight
            .fetch_max(in_flight, Ordering::SeqCst);
        self.recorder.range_started.notify_one();

        if self.hanging_parts.contains(&item.part_number) {
            futures::future::pending::<()>().await;
        }
        if let Some(delay) = self.part_delays.get(&item.part_number) {
            tokio::time::sleep(*delay).await;
        }
        self.recorder.in_flight.fetch_sub(1, Ordering::SeqCst);

        match self.failing_parts.get(&item.part_number) {
            Some(failures) if attempt <= *failures => Err(FakeError(format!(
                "part {} attempt {attempt} failed",
                item.part_number
            ))
            .into()),
            _ => Ok(PartResult {
                part_number: item.part_number,
                e_tag: e_tag(item.part_number),
            }),
        }
    }

    async fn complete_multipart_transfer(
        &self,
        _destination: &S3Object,
        upload_id: &str,
        parts: &[PartResult],
        options: &RequestOptions,
    ) -> Result<(), BoxError> {
        self.record(
            Call::Complete {
                upload_id: upload_id.to_owned(),
                parts: parts.to_vec(),
            },
            options,
        );
        if self.hang_complete {
            futures::future::pending::<()>().await;
        }
        if self.fail_complete {
            return Err(FakeError("InvalidPart".into()).into());
        }
        Ok(())
    }

    async fn abort_multipart_transfer(
        &self,
        _destination: &S3Object,
        upload_id: &str,
        options: &RequestOptions,
    ) -> Result<(), BoxError> {
        self.record(Call::Abort(upload_id.to_owned()), options);
        Ok(())
    }

    async fn delete_object(
        &self,
        object: &S3Object,
        options: &RequestOptions,
    ) -> Result<(), BoxError> {
        self.record(
            Call::Delete {
                object: object.clone(),
                region: self.region.clone(),
            },
            options,
        );
        if self.fail_delete {
            return Err(FakeError("AccessDenied".into()).into());
        }
        Ok(())
    }

    fn max_retries(&self) -> Option<u32> {
        self.retry_hint
    }

    fn for_region(&self, region: &str) -> Self {
        MemoryStore {
            region: Some(region.to_owned()),
            ..self.clone()
        }
    }
}
