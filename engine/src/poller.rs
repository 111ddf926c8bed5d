//! Polls the accrual authority for every pending order until the order
//! reaches a final status.
//!
//! Each enqueued order becomes one task cycling through the worker pool. A
//! cycle waits on the global limiter, performs one HTTP request, and either
//! emits a status change on the task's result channel, reschedules itself
//! with capped exponential backoff, or terminates. A 429 from the authority
//! retunes the limiter and the pool to the advertised budget.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::LazyLock;
use std::sync::Mutex;
use std::sync::PoisonError;
use std::time::Duration;

use regex_lite::Regex;
use reqwest::StatusCode;
use reqwest::header::HeaderMap;
use reqwest::header::RETRY_AFTER;
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::warn;

use tally_protocol::AccrualResult;
use tally_protocol::AccrualUpdate;
use tally_protocol::OrderStatus;
use tally_protocol::PollError;
use tally_protocol::money;

use crate::limiter::RateLimiter;
use crate::pool::WorkerPool;

const DEFAULT_RETRY_AFTER_SECS: u64 = 60;
const DEFAULT_RATE_LIMIT_REQUESTS: u32 = 1;
const DEFAULT_RATE_LIMIT_PERIOD_SECS: u64 = 60;
const RESULT_CHANNEL_CAPACITY: usize = 4;

static RATE_LIMIT_BODY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^No more than (\d+) requests per (second|minute|hour) allowed$")
        .unwrap_or_else(|err| panic!("rate limit pattern: {err}"))
});

#[derive(Clone, Debug)]
pub struct PollerConfig {
    /// Accrual authority base URL, scheme and host only.
    pub base_url: String,
    /// Per-request HTTP timeout.
    pub request_timeout: Duration,
    /// How long one task may wait on the limiter before rescheduling.
    pub limiter_wait_timeout: Duration,
    /// Counted failures tolerated before a task gives up.
    pub max_attempts: u32,
    /// Cap for the exponential retry delay.
    pub max_retry_wait: Duration,
    /// Worker cap; `None` defaults to the number of logical CPUs.
    pub workers: Option<usize>,
}

impl PollerConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            request_timeout: Duration::from_secs(60),
            limiter_wait_timeout: Duration::from_secs(60),
            max_attempts: 10,
            max_retry_wait: Duration::from_secs(300),
            workers: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum EnqueueError {
    #[error("order {0} is already enqueued")]
    AlreadyEnqueued(String),
    #[error("polling engine is closed")]
    Closed,
}

/// The polling engine. Cheap to clone; all clones share one pool, limiter
/// and task set.
#[derive(Clone)]
pub struct AccrualPoller {
    inner: Arc<PollerInner>,
}

struct PollerInner {
    pool: WorkerPool,
    limiter: RateLimiter,
    /// Serializes 429 handling; held until the scheduled restore instant so
    /// concurrent rate-limit responses have no additional effect.
    tuning: Arc<tokio::sync::Mutex<()>>,
    http: reqwest::Client,
    base_url: String,
    limiter_wait_timeout: Duration,
    max_attempts: u32,
    max_retry_wait: Duration,
    tasks: Mutex<HashSet<String>>,
    shutdown: CancellationToken,
}

struct PollTask {
    number: String,
    known_status: OrderStatus,
    attempts: u32,
    results: mpsc::Sender<AccrualResult>,
}

/// What one poll cycle observed.
enum PollOutcome {
    /// 200 with a parseable payload.
    Observed {
        status: OrderStatus,
        accrual: Option<i64>,
    },
    /// 204: the authority does not know the order yet.
    Unknown,
    /// 429: the limiter has already been retuned.
    RateLimited,
    /// The limiter wait timed out; not a failure of the order.
    LimiterElapsed,
    /// Network error, unexpected status code, or undecodable payload.
    Failed,
}

#[derive(Deserialize)]
struct AccrualResponse {
    status: String,
    #[serde(default)]
    accrual: Option<f64>,
}

impl AccrualPoller {
    pub fn new(config: PollerConfig) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;
        Ok(Self {
            inner: Arc::new(PollerInner {
                pool: WorkerPool::new(config.workers),
                limiter: RateLimiter::unlimited(),
                tuning: Arc::new(tokio::sync::Mutex::new(())),
                http,
                base_url: config.base_url.trim_end_matches('/').to_string(),
                limiter_wait_timeout: config.limiter_wait_timeout,
                max_attempts: config.max_attempts,
                max_retry_wait: config.max_retry_wait,
                tasks: Mutex::new(HashSet::new()),
                shutdown: CancellationToken::new(),
            }),
        })
    }

    /// Register a polling task for `number`. The receiver yields one value
    /// per status change and closes when polling terminates; a final
    /// `Err(_)` value means the authority could not be reached within the
    /// attempt budget.
    pub async fn enqueue(
        &self,
        number: &str,
        current_status: OrderStatus,
    ) -> Result<mpsc::Receiver<AccrualResult>, EnqueueError> {
        if self.inner.shutdown.is_cancelled() {
            return Err(EnqueueError::Closed);
        }
        if !self.inner.tasks().insert(number.to_string()) {
            return Err(EnqueueError::AlreadyEnqueued(number.to_string()));
        }

        let (results, receiver) = mpsc::channel(RESULT_CHANNEL_CAPACITY);
        let task = PollTask {
            number: number.to_string(),
            known_status: current_status,
            attempts: 0,
            results,
        };
        // Submission may wait for a worker slot; the task set entry above
        // already guards against duplicate enqueues in the meantime.
        if self.inner.clone().submit(task).await.is_err() {
            self.inner.tasks().remove(number);
            return Err(EnqueueError::Closed);
        }
        Ok(receiver)
    }

    /// Shut the engine down: cancel pending retries, drain running tasks,
    /// and close every open result channel without a terminal value.
    pub async fn close(&self) {
        self.inner.shutdown.cancel();
        self.inner.pool.close().await;
        self.inner.tasks().clear();
    }
}

impl PollerInner {
    fn tasks(&self) -> std::sync::MutexGuard<'_, HashSet<String>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn submit(self: Arc<Self>, task: PollTask) -> Result<(), crate::pool::PoolClosed> {
        let inner = Arc::clone(&self);
        self.pool.submit(inner.process(task)).await
    }

    async fn process(self: Arc<Self>, mut task: PollTask) {
        if self.shutdown.is_cancelled() {
            // Dropping the task closes its channel with no terminal value.
            self.tasks().remove(&task.number);
            return;
        }

        match self.poll_once(&task.number).await {
            PollOutcome::Observed { status, accrual } => {
                self.apply_observation(task, status, accrual).await;
            }
            PollOutcome::Unknown => {
                // The authority has not registered the order yet; transient,
                // but it consumes an attempt.
                task.attempts += 1;
                self.fail_or_retry(task).await;
            }
            PollOutcome::Failed => {
                task.attempts += 1;
                self.fail_or_retry(task).await;
            }
            // Neither a refused request nor limiter back-pressure counts
            // against the order.
            PollOutcome::RateLimited | PollOutcome::LimiterElapsed => self.retry_later(task),
        }
    }

    async fn apply_observation(
        self: &Arc<Self>,
        mut task: PollTask,
        status: OrderStatus,
        accrual: Option<i64>,
    ) {
        if status == OrderStatus::Processed {
            let update = AccrualUpdate {
                status,
                accrual: Some(accrual.unwrap_or(0)),
            };
            self.finish(task, Ok(update)).await;
            return;
        }
        if status.is_final() {
            self.finish(task, Ok(AccrualUpdate { status, accrual: None })).await;
            return;
        }
        if status != task.known_status {
            task.known_status = status;
            self.emit(&task, Ok(AccrualUpdate { status, accrual: None })).await;
        }
        self.retry_later(task);
    }

    async fn fail_or_retry(self: &Arc<Self>, task: PollTask) {
        if task.attempts > self.max_attempts {
            warn!(number = %task.number, attempts = task.attempts, "giving up on order");
            self.finish(task, Err(PollError::AttemptsExhausted)).await;
        } else {
            self.retry_later(task);
        }
    }

    /// Emit the terminal value, close the channel, and forget the task.
    async fn finish(&self, task: PollTask, result: AccrualResult) {
        self.emit(&task, result).await;
        self.tasks().remove(&task.number);
    }

    async fn emit(&self, task: &PollTask, result: AccrualResult) {
        tokio::select! {
            sent = task.results.send(result) => {
                if sent.is_err() {
                    debug!(number = %task.number, "result receiver dropped");
                }
            }
            _ = self.shutdown.cancelled() => {}
        }
    }

    fn retry_later(self: &Arc<Self>, task: PollTask) {
        let delay = retry_delay(task.attempts, self.max_retry_wait);
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {
                    let number = task.number.clone();
                    if inner.clone().submit(task).await.is_err() {
                        inner.tasks().remove(&number);
                    }
                }
                // Engine shutdown: dropping the task closes its channel.
                _ = inner.shutdown.cancelled() => {}
            }
        });
    }

    async fn poll_once(self: &Arc<Self>, number: &str) -> PollOutcome {
        let waited =
            tokio::time::timeout(self.limiter_wait_timeout, self.limiter.acquire()).await;
        if waited.is_err() {
            debug!(number, "limiter wait elapsed, rescheduling");
            return PollOutcome::LimiterElapsed;
        }

        let url = format!("{}/api/orders/{number}", self.base_url);
        let response = match self.http.get(&url).send().await {
            Ok(response) => response,
            Err(err) => {
                warn!(number, "accrual request failed: {err}");
                return PollOutcome::Failed;
            }
        };

        match response.status() {
            StatusCode::TOO_MANY_REQUESTS => {
                self.tune_rate_limiting(response).await;
                PollOutcome::RateLimited
            }
            StatusCode::NO_CONTENT => PollOutcome::Unknown,
            StatusCode::OK => match response.json::<AccrualResponse>().await {
                Ok(payload) => match wire_status(&payload.status) {
                    Some(status) => PollOutcome::Observed {
                        status,
                        accrual: payload.accrual.map(money::to_cents),
                    },
                    None => {
                        warn!(number, status = %payload.status, "unknown accrual status");
                        PollOutcome::Failed
                    }
                },
                Err(err) => {
                    warn!(number, "undecodable accrual payload: {err}");
                    PollOutcome::Failed
                }
            },
            code => {
                warn!(number, %code, "unexpected accrual status code");
                PollOutcome::Failed
            }
        }
    }

    /// Clamp the limiter, schedule its restoration to the advertised rate,
    /// and shrink the pool to the advertised request budget.
    async fn tune_rate_limiting(self: &Arc<Self>, response: reqwest::Response) {
        let Ok(guard) = Arc::clone(&self.tuning).try_lock_owned() else {
            // A tune is already in flight; this 429 carries no new signal.
            return;
        };

        let headers = response.headers().clone();
        let body = response.text().await.unwrap_or_default();
        let (retry_after, requests, period_secs) =
            parse_rate_limited_response(&headers, body.trim());
        warn!(
            retry_after,
            requests, period_secs, "accrual authority applied rate limiting"
        );

        self.limiter.set_limit(0.0);
        let restore_at = Instant::now() + Duration::from_secs(retry_after);
        self.limiter
            .set_limit_at(restore_at, requests as f64 / period_secs as f64);
        self.pool.tune(requests as usize);

        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep_until(restore_at) => {}
                _ = shutdown.cancelled() => {}
            }
            drop(guard);
        });
    }
}

/// Capped exponential backoff: `min(cap, 1s * 2^attempt)`.
fn retry_delay(attempt: u32, cap: Duration) -> Duration {
    let seconds = 2_f64.powi(attempt.min(32) as i32);
    Duration::from_secs_f64(seconds).min(cap)
}

fn wire_status(status: &str) -> Option<OrderStatus> {
    match status {
        // The authority's REGISTERED is our NEW.
        "REGISTERED" => Some(OrderStatus::New),
        "PROCESSING" => Some(OrderStatus::Processing),
        "INVALID" => Some(OrderStatus::Invalid),
        "PROCESSED" => Some(OrderStatus::Processed),
        _ => None,
    }
}

/// Extract `(retry_after_seconds, requests, period_seconds)` from a 429.
/// Malformed headers or bodies fall back to one request per minute after a
/// sixty-second pause.
fn parse_rate_limited_response(headers: &HeaderMap, body: &str) -> (u64, u32, u64) {
    let retry_after = headers
        .get(RETRY_AFTER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<u64>().ok())
        .unwrap_or_else(|| {
            warn!("unparseable Retry-After header, using default");
            DEFAULT_RETRY_AFTER_SECS
        });

    let Some(captures) = RATE_LIMIT_BODY.captures(body) else {
        warn!(body, "unparseable rate limit body, using defaults");
        return (
            retry_after,
            DEFAULT_RATE_LIMIT_REQUESTS,
            DEFAULT_RATE_LIMIT_PERIOD_SECS,
        );
    };
    let requests = captures[1]
        .parse::<u32>()
        .unwrap_or(DEFAULT_RATE_LIMIT_REQUESTS);
    let period_secs = match &captures[2] {
        "second" => 1,
        "minute" => 60,
        _ => 60 * 60,
    };
    (retry_after, requests, period_secs)
}
