//! Runs the parts of a multipart copy on a fixed pool of workers.
//!
//! A producer task feeds [WorkItem]s into a bounded queue, `concurrency`
//! workers copy them (retrying failed attempts), and a collector task slots
//! each [PartResult] into place by part number. The collector only returns
//! once every worker has dropped its sender, so its result is the signal
//! that every part which was ever going to be copied has been recorded.

use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures::future::{self, FutureExt};
use rand::Rng;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::plan::PartPlan;
use super::CopierError;
use crate::s3::store::{ObjectStore, PartResult, RequestOptions, WorkItem};
use crate::s3::S3Object;

/// Upper bound on the pause between two attempts of the same part.
pub(crate) const MAX_RETRY_DELAY: Duration = Duration::from_secs(20);

/// Roughly 30 years.
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

/// How failed part copies are retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Backoff ceiling before the first retry, doubled for each further retry.
    /// Zero disables backoff.
    pub base_delay: Duration,
}

impl RetryPolicy {
    fn attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Exponential backoff with full jitter before the `retry`th retry.
    fn delay(&self, retry: u32) -> Duration {
        if self.base_delay.is_zero() {
            return Duration::ZERO;
        }
        let exponent = retry.saturating_sub(1).min(16);
        let ceiling = self
            .base_delay
            .saturating_mul(1 << exponent)
            .min(MAX_RETRY_DELAY);
        rand::thread_rng().gen_range(Duration::ZERO..=ceiling)
    }
}

/// The events, other than finishing, that end a copy.
#[derive(Debug, Clone)]
pub(crate) struct Deadline {
    pub timeout: Duration,
    /// When `timeout` runs out, measured from the start of the copy.
    pub expires_at: Instant,
    pub cancellation: CancellationToken,
    pub cancel_on_signal: bool,
}

impl Deadline {
    pub fn starting_now(
        timeout: Duration,
        cancellation: CancellationToken,
        cancel_on_signal: bool,
    ) -> Self {
        let now = Instant::now();
        // Timeouts too large to represent never fire.
        let expires_at = now
            .checked_add(timeout)
            .unwrap_or_else(|| now + FAR_FUTURE);
        Deadline {
            timeout,
            expires_at,
            cancellation,
            cancel_on_signal,
        }
    }

    /// Run `call`, failing with [CopierError::Timeout] if the deadline passes first.
    pub async fn run<T>(
        &self,
        call: impl Future<Output = Result<T, CopierError>>,
    ) -> Result<T, CopierError> {
        tokio::time::timeout_at(self.expires_at, call)
            .await
            .unwrap_or(Err(CopierError::Timeout(self.timeout)))
    }
}

/// The state of one in-flight multipart copy.
#[derive(Debug)]
pub(crate) struct Transfer {
    pub plan: PartPlan,
    /// Number of workers, never more than there are parts.
    pub concurrency: usize,
    pub upload_id: String,
    pub destination: S3Object,
    pub copy_source: String,
    /// The most recent part failure. Last writer wins.
    pub failure: Arc<Mutex<Option<CopierError>>>,
}

impl Transfer {
    pub fn new(
        plan: PartPlan,
        concurrency: usize,
        upload_id: String,
        destination: S3Object,
        copy_source: String,
    ) -> Self {
        let part_count = usize::try_from(plan.part_count()).unwrap_or(1);
        Transfer {
            plan,
            concurrency: concurrency.clamp(1, part_count.max(1)),
            upload_id,
            destination,
            copy_source,
            failure: Arc::new(Mutex::new(None)),
        }
    }

    fn work_items(&self) -> impl Iterator<Item = WorkItem> + Send + 'static {
        let destination = self.destination.clone();
        let copy_source = self.copy_source.clone();
        let upload_id = self.upload_id.clone();
        self.plan
            .ranges()
            .map(move |(part_number, byte_range)| WorkItem {
                part_number,
                destination: destination.clone(),
                copy_source: copy_source.clone(),
                byte_range,
                upload_id: upload_id.clone(),
            })
    }

    /// Copy every part, returning them ordered by part number.
    ///
    /// Returns the first of: the cancellation token firing, all parts
    /// resolved (an error if any part exhausted its retries), SIGINT/SIGTERM
    /// when enabled, or the deadline passing. On anything but success the
    /// per-transfer token is cancelled and the remaining tasks are detached,
    /// so calls already in flight may finish but nothing new is started.
    #[instrument(skip_all, fields(upload_id = %self.upload_id, part_count = self.plan.part_count()))]
    pub async fn execute<S: ObjectStore>(
        self,
        store: Arc<S>,
        policy: RetryPolicy,
        options: Arc<RequestOptions>,
        deadline: &Deadline,
    ) -> Result<Vec<PartResult>, CopierError> {
        let token = deadline.cancellation.child_token();
        let (work_tx, work_rx) = mpsc::channel(self.concurrency);
        let (result_tx, result_rx) = mpsc::channel(self.concurrency);
        let work_rx = Arc::new(AsyncMutex::new(work_rx));

        let mut tasks = JoinSet::new();
        tasks.spawn(dispatch(self.work_items(), work_tx, token.clone()));
        for id in 0..self.concurrency {
            let worker = Worker {
                id,
                store: Arc::clone(&store),
                work: Arc::clone(&work_rx),
                results: result_tx.clone(),
                failure: Arc::clone(&self.failure),
                policy,
                options: Arc::clone(&options),
                token: token.clone(),
            };
            tasks.spawn(worker.run());
        }
        drop(result_tx);
        let collector = tokio::spawn(collect(result_rx, self.plan.part_count()));
        info!(workers = self.concurrency, "Copying parts");

        let completion = async {
            while let Some(joined) = tasks.join_next().await {
                joined?;
            }
            Ok::<_, CopierError>(collector.await?)
        };
        let interrupt = if deadline.cancel_on_signal {
            interrupt_signal().boxed()
        } else {
            future::pending().boxed()
        };

        let outcome = tokio::select! {
            biased;
            _ = token.cancelled() => Err(CopierError::Cancelled),
            parts = completion => parts,
            signal = interrupt => Err(CopierError::Interrupted { signal }),
            _ = tokio::time::sleep_until(deadline.expires_at) => Err(CopierError::Timeout(deadline.timeout)),
        };

        let parts = match outcome {
            // Cancelled workers also drain the collector, leaving gaps.
            Ok(_) if token.is_cancelled() => return Err(CopierError::Cancelled),
            Ok(parts) => parts,
            Err(error) => {
                warn!(%error, "Stopping outstanding part copies");
                token.cancel();
                tasks.detach_all();
                return Err(error);
            }
        };

        let failure = self
            .failure
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(error) = failure {
            return Err(error);
        }

        let missing: Vec<i32> = parts
            .iter()
            .zip(1..)
            .filter_map(|(part, part_number)| part.is_none().then_some(part_number))
            .collect();
        if !missing.is_empty() {
            return Err(CopierError::MissingParts(missing));
        }

        info!("All parts completed");
        Ok(parts.into_iter().flatten().collect())
    }
}

/// Queue one work item per part. The queue is bounded, so this runs at most
/// `concurrency` items ahead of the workers.
async fn dispatch(
    items: impl Iterator<Item = WorkItem>,
    work: mpsc::Sender<WorkItem>,
    token: CancellationToken,
) {
    for item in items {
        let part_number = item.part_number;
        tokio::select! {
            biased;
            _ = token.cancelled() => {
                debug!(part_number, "Dispatch cancelled");
                return;
            }
            sent = work.send(item) => {
                if sent.is_err() {
                    return;
                }
            }
        }
        debug!(part_number, "Queued part");
    }
}

/// Slot each part into `parts[part_number - 1]` until every sender is gone.
async fn collect(mut results: mpsc::Receiver<PartResult>, part_count: i32) -> Vec<Option<PartResult>> {
    let mut parts = vec![None; usize::try_from(part_count).unwrap_or_default()];
    while let Some(part) = results.recv().await {
        let slot = usize::try_from(part.part_number - 1)
            .ok()
            .and_then(|index| parts.get_mut(index));
        match slot {
            Some(slot) => *slot = Some(part),
            None => warn!(part_number = part.part_number, "Ignoring result for unknown part"),
        }
    }
    parts
}

struct Worker<S> {
    id: usize,
    store: Arc<S>,
    work: Arc<AsyncMutex<mpsc::Receiver<WorkItem>>>,
    results: mpsc::Sender<PartResult>,
    failure: Arc<Mutex<Option<CopierError>>>,
    policy: RetryPolicy,
    options: Arc<RequestOptions>,
    token: CancellationToken,
}

impl<S: ObjectStore> Worker<S> {
    async fn run(self) {
        while let Some(item) = self.next_item().await {
            match self.copy_with_retry(&item).await {
                Ok(Some(part)) => {
                    if self.results.send(part).await.is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(error) => self.record(error),
            }
        }
        debug!(worker = self.id, "Worker finished");
    }

    async fn next_item(&self) -> Option<WorkItem> {
        let mut work = self.work.lock().await;
        tokio::select! {
            biased;
            _ = self.token.cancelled() => None,
            item = work.recv() => item,
        }
    }

    /// `Ok(None)` means the transfer was cancelled before the part was copied.
    async fn copy_with_retry(&self, item: &WorkItem) -> Result<Option<PartResult>, CopierError> {
        let attempts = self.policy.attempts();
        let mut attempt = 1;
        loop {
            if self.token.is_cancelled() {
                return Ok(None);
            }
            match self.store.copy_range(item, &self.options).await {
                Ok(part) => {
                    debug!(part_number = item.part_number, attempt, "Copied part");
                    return Ok(Some(part));
                }
                Err(error) => {
                    warn!(
                        part_number = item.part_number,
                        range = %item.byte_range,
                        upload_id = %item.upload_id,
                        copy_source = %item.copy_source,
                        attempt,
                        %error,
                        "Part copy failed"
                    );
                    if attempt >= attempts {
                        return Err(CopierError::PartCopy {
                            part_number: item.part_number,
                            attempts,
                            source: error,
                        });
                    }
                }
            }

            let delay = self.policy.delay(attempt);
            attempt += 1;
            if !delay.is_zero() {
                tokio::select! {
                    biased;
                    _ = self.token.cancelled() => return Ok(None),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }

    fn record(&self, error: CopierError) {
        let mut failure = self.failure.lock().unwrap_or_else(PoisonError::into_inner);
        *failure = Some(error);
    }
}

/// Resolves with the name of the first termination signal received.
async fn interrupt_signal() -> &'static str {
    match wait_for_signal().await {
        Ok(signal) => signal,
        Err(error) => {
            warn!(%error, "Unable to listen for termination signals");
            future::pending().await
        }
    }
}

#[cfg(unix)]
async fn wait_for_signal() -> std::io::Result<&'static str> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        interrupted = tokio::signal::ctrl_c() => interrupted.map(|()| "SIGINT"),
        _ = terminate.recv() => Ok("SIGTERM"),
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() -> std::io::Result<&'static str> {
    tokio::signal::ctrl_c().await.map(|()| "ctrl-c")
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prop_assert;
    use test_strategy::proptest;

    #[test]
    fn test_zero_base_delay_disables_backoff() {
        let policy = RetryPolicy {
            max_retries: 5,
            base_delay: Duration::ZERO,
        };
        assert_eq!(policy.attempts(), 6);
        assert!((1..=5).all(|retry| policy.delay(retry).is_zero()));
    }

    #[test]
    fn test_attempts_saturate() {
        let policy = RetryPolicy {
            max_retries: u32::MAX,
            base_delay: Duration::ZERO,
        };
        assert_eq!(policy.attempts(), u32::MAX);
    }

    #[proptest]
    fn test_backoff_is_bounded(#[strategy(1_u32..64)] retry: u32, #[strategy(1_u64..5_000)] base_ms: u64) {
        let policy = RetryPolicy {
            max_retries: 3,
            base_delay: Duration::from_millis(base_ms),
        };
        let exponent = (retry - 1).min(16);
        let ceiling = (policy.base_delay * (1 << exponent)).min(MAX_RETRY_DELAY);
        let delay = policy.delay(retry);
        prop_assert!(delay <= ceiling, "{delay:?} > {ceiling:?}");
    }

    #[tokio::test]
    async fn test_collector_orders_parts() {
        let (tx, rx) = mpsc::channel(4);
        let collector = tokio::spawn(collect(rx, 3));
        for part_number in [3, 1, 2] {
            tx.send(PartResult {
                part_number,
                e_tag: format!("etag-{part_number}"),
            })
            .await
            .unwrap();
        }
        drop(tx);

        let parts = collector.await.unwrap();
        let order: Vec<_> = parts.iter().map(|p| p.as_ref().map(|p| p.part_number)).collect();
        assert_eq!(order, vec![Some(1), Some(2), Some(3)]);
    }

    #[tokio::test]
    async fn test_collector_leaves_gaps_empty() {
        let (tx, rx) = mpsc::channel(4);
        let collector = tokio::spawn(collect(rx, 3));
        tx.send(PartResult {
            part_number: 2,
            e_tag: "etag-2".into(),
        })
        .await
        .unwrap();
        tx.send(PartResult {
            part_number: 7,
            e_tag: "etag-7".into(),
        })
        .await
        .unwrap();
        drop(tx);

        let parts = collector.await.unwrap();
        assert_eq!(parts.len(), 3);
        assert!(parts[0].is_none());
        assert_eq!(parts[1].as_ref().map(|p| p.part_number), Some(2));
        assert!(parts[2].is_none());
    }

    #[tokio::test]
    async fn test_dispatch_stops_when_cancelled() {
        let (tx, mut rx) = mpsc::channel(1);
        let token = CancellationToken::new();
        let items = (1..=10).map(|part_number| WorkItem {
            part_number,
            destination: S3Object::new("dst", "key"),
            copy_source: "src/key".into(),
            byte_range: (0, 0).try_into().unwrap(),
            upload_id: "upload".into(),
        });
        let producer = tokio::spawn(dispatch(items, tx, token.clone()));

        // The bounded queue holds the producer on the second item.
        let first = rx.recv().await.unwrap();
        assert_eq!(first.part_number, 1);
        token.cancel();
        producer.await.unwrap();

        let mut remaining = 0;
        while rx.recv().await.is_some() {
            remaining += 1;
        }
        assert!(remaining <= 1, "{remaining} items were queued after cancellation");
    }
}
