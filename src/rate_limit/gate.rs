//! Rate-Limited Gate
//!
//! Admission control in front of a rate-limited upstream call. Requests are
//! queued FIFO and admitted one at a time by a single drain worker that owns
//! the queue. A request is admitted only when every quota has a token; while
//! any quota is empty the worker backs off, refills and checks again. Nothing
//! is rejected for lack of quota, it just waits.
//!
//! ```text
//!  execute() ──► mpsc queue ──► drain worker ──► operation()
//!                                   │  ▲
//!                          take one │  │ refill
//!                                   ▼  │
//!                        quotas (per-minute, per-hour) ◄── refill ticker
//! ```

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::backoff::Backoff;
use super::clock::{Clock, TokioClock};
use super::config::GateConfig;
use super::error::{ConfigError, GateError};
use super::quota::{self, Quota, QuotaStatus};
use super::request::{await_reply, await_reply_until, Outcome, PendingRequest};
use crate::metrics;

/// Point-in-time view of the gate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateStatus {
    /// Tokens per quota, keyed by quota name
    pub quotas: BTreeMap<String, QuotaStatus>,

    /// Requests waiting to be admitted (not counting the one in flight)
    pub queue_length: usize,

    /// Whether the worker is currently handling a request
    pub is_draining: bool,
}

/// State shared by the handle, the drain worker and the refill ticker
#[derive(Debug)]
struct SharedState {
    quotas: Mutex<Vec<Quota>>,
    queue_length: AtomicUsize,
    draining: AtomicBool,
}

impl SharedState {
    fn new(quotas: Vec<Quota>) -> Self {
        Self {
            quotas: Mutex::new(quotas),
            queue_length: AtomicUsize::new(0),
            draining: AtomicBool::new(false),
        }
    }

    fn quotas(&self) -> MutexGuard<'_, Vec<Quota>> {
        self.quotas.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Refill, then take one token from every quota if all have one
    ///
    /// On failure returns how long until every empty quota has refilled.
    fn try_admit(&self, now: Instant) -> Result<(), Duration> {
        let mut quotas = self.quotas();
        quota::refill_all(&mut quotas, now);
        let admitted = quota::try_take_all(&mut quotas);
        publish_quota_gauges(&quotas);
        if admitted {
            Ok(())
        } else {
            Err(quota::time_until_admissible(&quotas, now))
        }
    }

    fn refill(&self, now: Instant) -> u32 {
        let mut quotas = self.quotas();
        let added = quota::refill_all(&mut quotas, now);
        if added > 0 {
            publish_quota_gauges(&quotas);
        }
        added
    }

    fn enqueued(&self) -> usize {
        metrics::GATE_QUEUE_DEPTH.inc();
        self.queue_length.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn dequeued(&self) {
        metrics::GATE_QUEUE_DEPTH.dec();
        self.queue_length.fetch_sub(1, Ordering::SeqCst);
    }

    fn status(&self) -> GateStatus {
        let quotas = self
            .quotas()
            .iter()
            .map(|q| (q.name().to_string(), q.status()))
            .collect();

        GateStatus {
            quotas,
            queue_length: self.queue_length.load(Ordering::SeqCst),
            is_draining: self.draining.load(Ordering::SeqCst),
        }
    }
}

fn publish_quota_gauges(quotas: &[Quota]) {
    for quota in quotas {
        metrics::GATE_QUOTA_AVAILABLE
            .with_label_values(&[quota.name()])
            .set(quota.available() as i64);
    }
}

#[derive(Debug)]
struct GateInner {
    sender: mpsc::UnboundedSender<PendingRequest>,
    shared: Arc<SharedState>,
    clock: Arc<dyn Clock>,
    next_id: AtomicU64,
    ticker: Option<JoinHandle<()>>,
}

impl Drop for GateInner {
    fn drop(&mut self) {
        // The worker finishes whatever is still queued once the sender is gone
        if let Some(ticker) = self.ticker.take() {
            ticker.abort();
        }
    }
}

/// Handle to a running gate
///
/// Cloning is cheap; all clones feed the same queue. When the last clone is
/// dropped the queue closes and the worker exits after draining it.
#[derive(Debug, Clone)]
pub struct RateLimitedGate {
    inner: Arc<GateInner>,
}

impl RateLimitedGate {
    /// Start a gate driven by tokio's clock
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] if the configuration is invalid.
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime.
    pub fn new(config: GateConfig) -> Result<Self, ConfigError> {
        Self::with_clock(config, Arc::new(TokioClock))
    }

    /// Start a gate with an injected clock
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] if the configuration is invalid.
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime.
    pub fn with_clock(config: GateConfig, clock: Arc<dyn Clock>) -> Result<Self, ConfigError> {
        config.validate()?;

        let now = clock.now();
        let quotas: Vec<Quota> = config
            .quotas
            .iter()
            .map(|q| Quota::from_config(q, now))
            .collect();
        publish_quota_gauges(&quotas);

        let shared = Arc::new(SharedState::new(quotas));
        let (sender, receiver) = mpsc::unbounded_channel();

        let worker = DrainWorker {
            receiver,
            shared: Arc::clone(&shared),
            clock: Arc::clone(&clock),
            backoff: Backoff::from(&config.backoff),
        };
        tokio::spawn(worker.run());

        let ticker = config
            .refill_tick()
            .map(|tick| spawn_refill_ticker(Arc::clone(&shared), Arc::clone(&clock), tick));

        let summary: Vec<String> = config
            .quotas
            .iter()
            .map(|q| format!("{}={}/{}ms", q.name, q.capacity, q.window_ms))
            .collect();
        info!(quotas = ?summary, refill_tick_ms = ?config.refill_tick_ms, "Rate-limited gate started");

        Ok(Self {
            inner: Arc::new(GateInner {
                sender,
                shared,
                clock,
                next_id: AtomicU64::new(1),
                ticker,
            }),
        })
    }

    /// Queue `operation` and wait for its result
    ///
    /// The request joins the queue when this is called, not when the returned
    /// future is first polled. One token is taken from every quota right
    /// before `operation` is invoked. The result is the operation's own:
    /// `Ok(value)` or `Err(GateError::Upstream(err))`.
    ///
    /// Dropping the returned future before admission cancels the request
    /// without consuming tokens.
    pub fn execute<F, Fut, T, E>(
        &self,
        label: impl Into<String>,
        operation: F,
    ) -> impl Future<Output = Result<T, GateError<E>>> + Send + 'static
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: Send + 'static,
    {
        self.submit(label.into(), None, operation)
    }

    /// Like [`execute`](Self::execute), but give up if not admitted within `max_wait`
    ///
    /// An expired request fails with [`GateError::DeadlineExceeded`] and
    /// consumes no tokens.
    pub fn execute_with_deadline<F, Fut, T, E>(
        &self,
        label: impl Into<String>,
        max_wait: Duration,
        operation: F,
    ) -> impl Future<Output = Result<T, GateError<E>>> + Send + 'static
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: Send + 'static,
    {
        self.submit(label.into(), Some(max_wait), operation)
    }

    fn submit<F, Fut, T, E>(
        &self,
        label: String,
        max_wait: Option<Duration>,
        operation: F,
    ) -> impl Future<Output = Result<T, GateError<E>>> + Send + 'static
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: Send + 'static,
    {
        let inner = &self.inner;
        let id = inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (request, receiver) =
            PendingRequest::new(id, label.clone(), inner.clock.now(), max_wait, operation);
        let deadline = request.deadline().zip(max_wait);
        let admission = request.admission().clone();

        let queue_length = inner.shared.enqueued();
        let receiver = match inner.sender.send(request) {
            Ok(()) => {
                debug!(request_id = id, label = %label, queue_length, "Request queued");
                Some(receiver)
            }
            Err(_) => {
                inner.shared.dequeued();
                warn!(request_id = id, label = %label, "Drain worker is gone; request dropped");
                None
            }
        };

        async move {
            match (receiver, deadline) {
                (Some(receiver), Some((deadline, max_wait))) => {
                    await_reply_until(receiver, label, admission, deadline, max_wait).await
                }
                (Some(receiver), None) => await_reply(receiver, label).await,
                (None, _) => Err(GateError::Dropped { label }),
            }
        }
    }

    /// Snapshot of quotas, queue length and worker activity
    pub fn status(&self) -> GateStatus {
        self.inner.shared.status()
    }

    /// Run the refill routine now; returns the number of tokens added
    pub fn refill(&self) -> u32 {
        self.inner.shared.refill(self.inner.clock.now())
    }
}

/// Single consumer of the request queue
struct DrainWorker {
    receiver: mpsc::UnboundedReceiver<PendingRequest>,
    shared: Arc<SharedState>,
    clock: Arc<dyn Clock>,
    backoff: Backoff,
}

impl DrainWorker {
    async fn run(mut self) {
        debug!("Drain worker started");

        while let Some(request) = self.receiver.recv().await {
            self.shared.draining.store(true, Ordering::SeqCst);
            self.shared.dequeued();

            self.process(request).await;

            if self.shared.queue_length.load(Ordering::SeqCst) == 0 {
                self.shared.draining.store(false, Ordering::SeqCst);
            }
        }

        self.shared.draining.store(false, Ordering::SeqCst);
        debug!("Drain worker stopped");
    }

    async fn process(&self, request: PendingRequest) {
        let id = request.id();
        let mut attempt: u32 = 0;

        loop {
            if request.admission().is_cancelled() {
                debug!(request_id = id, label = %request.label(), "Caller gave up at its deadline; skipping request");
                metrics::GATE_REQUESTS_TOTAL.with_label_values(&["expired"]).inc();
                return;
            }
            if request.is_abandoned() {
                debug!(request_id = id, label = %request.label(), "Caller stopped waiting; skipping request");
                metrics::GATE_REQUESTS_TOTAL.with_label_values(&["abandoned"]).inc();
                return;
            }

            let now = self.clock.now();
            if request.is_expired(now) {
                warn!(request_id = id, label = %request.label(), "Request not admitted before its deadline");
                metrics::GATE_REQUESTS_TOTAL.with_label_values(&["expired"]).inc();
                request.expire(now);
                return;
            }

            if !request.admission().claim() {
                // Cancelled between the check above and now
                continue;
            }
            let until_refill = match self.shared.try_admit(now) {
                Ok(()) => {
                    request.admission().admit();
                    break;
                }
                Err(until_refill) => {
                    request.admission().release();
                    until_refill
                }
            };

            // Never sleep past the refill or the deadline
            let mut delay = self.backoff.delay(attempt);
            if !until_refill.is_zero() {
                delay = delay.min(until_refill);
            }
            if let Some(remaining) = request.remaining(now) {
                delay = delay.min(remaining);
            }
            attempt = attempt.saturating_add(1);

            debug!(
                request_id = id,
                label = %request.label(),
                attempt,
                delay_ms = delay.as_millis() as u64,
                "Quota exhausted; backing off"
            );
            metrics::GATE_BACKOFF_WAITS_TOTAL.inc();
            self.clock.sleep(delay).await;
        }

        let waited = self
            .clock
            .now()
            .saturating_duration_since(request.enqueued_at());
        metrics::GATE_ADMISSION_WAIT_SECONDS.observe(waited.as_secs_f64());
        debug!(
            request_id = id,
            label = %request.label(),
            waited_ms = waited.as_millis() as u64,
            "Request admitted"
        );

        let label = request.label().to_string();
        match request.run().await {
            Outcome::Succeeded => {
                metrics::GATE_REQUESTS_TOTAL.with_label_values(&["succeeded"]).inc();
            }
            Outcome::Failed => {
                debug!(request_id = id, label = %label, "Gated operation failed; continuing with queue");
                metrics::GATE_REQUESTS_TOTAL.with_label_values(&["failed"]).inc();
            }
            Outcome::Panicked => {
                metrics::GATE_REQUESTS_TOTAL.with_label_values(&["panicked"]).inc();
            }
        }
    }
}

fn spawn_refill_ticker(
    shared: Arc<SharedState>,
    clock: Arc<dyn Clock>,
    tick: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(tick);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // First tick completes immediately
        interval.tick().await;

        loop {
            interval.tick().await;
            let added = shared.refill(clock.now());
            if added > 0 {
                debug!(added, "Background refill");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rate_limit::clock::ManualClock;
    use crate::rate_limit::config::QuotaConfig;
    use std::sync::atomic::AtomicU32;
    use tokio::sync::oneshot;

    fn per_minute(capacity: u32) -> GateConfig {
        GateConfig::with_quotas(vec![QuotaConfig::per_minute(capacity)])
    }

    type Log = Arc<Mutex<Vec<(u32, Instant)>>>;

    fn recording_op(log: &Log, n: u32) -> impl FnOnce() -> futures::future::BoxFuture<'static, Result<u32, String>> {
        let log = Arc::clone(log);
        move || {
            Box::pin(async move {
                log.lock().unwrap().push((n, Instant::now()));
                Ok(n)
            })
        }
    }

    #[tokio::test]
    async fn test_invalid_config_fails_at_construction() {
        let result = RateLimitedGate::new(GateConfig::with_quotas(vec![]));
        assert!(matches!(result, Err(ConfigError::NoQuotas)));

        let result = RateLimitedGate::new(per_minute(0));
        assert!(matches!(result, Err(ConfigError::ZeroCapacity(_))));
    }

    #[tokio::test]
    async fn test_execute_returns_operation_result() {
        let gate = RateLimitedGate::new(per_minute(5)).unwrap();

        let value = gate
            .execute("health-tip", || async { Ok::<_, String>("drink water") })
            .await
            .unwrap();

        assert_eq!(value, "drink water");
        assert_eq!(gate.status().quotas["per-minute"].available, 4);
    }

    #[tokio::test]
    async fn test_token_taken_at_invocation_not_enqueue() {
        let gate = RateLimitedGate::new(per_minute(1)).unwrap();

        // Nothing has been polled yet, so the worker has not run
        let first = gate.execute("a", || async { Ok::<_, String>(1) });
        let second = gate.execute("b", || async { Ok::<_, String>(2) });

        let status = gate.status();
        assert_eq!(status.queue_length, 2);
        assert_eq!(status.quotas["per-minute"].available, 1);

        assert_eq!(first.await.unwrap(), 1);
        assert_eq!(gate.status().quotas["per-minute"].available, 0);
        drop(second);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fifo_regardless_of_duration() {
        let gate = RateLimitedGate::new(per_minute(100)).unwrap();
        let order = Arc::new(Mutex::new(Vec::new()));

        let calls: Vec<_> = [300u64, 10, 200, 0, 50]
            .into_iter()
            .enumerate()
            .map(|(i, ms)| {
                let order = Arc::clone(&order);
                gate.execute(format!("call-{i}"), move || async move {
                    order.lock().unwrap().push(i);
                    tokio::time::sleep(Duration::from_millis(ms)).await;
                    Ok::<_, String>(i)
                })
            })
            .collect();

        let results: Vec<_> = futures::future::join_all(calls)
            .await
            .into_iter()
            .map(Result::unwrap)
            .collect();

        assert_eq!(results, vec![0, 1, 2, 3, 4]);
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_third_call_waits_for_refill() {
        let gate = RateLimitedGate::new(per_minute(2)).unwrap();
        let log: Log = Arc::new(Mutex::new(Vec::new()));
        let start = Instant::now();

        let calls = vec![
            gate.execute("1", recording_op(&log, 1)),
            gate.execute("2", recording_op(&log, 2)),
            gate.execute("3", recording_op(&log, 3)),
        ];
        let results: Vec<u32> = futures::future::join_all(calls)
            .await
            .into_iter()
            .map(Result::unwrap)
            .collect();

        assert_eq!(results, vec![1, 2, 3]);
        let log = log.lock().unwrap();
        assert!(log[0].1 - start < Duration::from_secs(1));
        assert!(log[1].1 - start < Duration::from_secs(1));
        let third = log[2].1 - start;
        assert!(third >= Duration::from_secs(60), "third ran at {third:?}");
        assert!(third < Duration::from_secs(120), "third ran at {third:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_does_not_poison_queue() {
        let gate = RateLimitedGate::new(per_minute(10)).unwrap();

        let failing = gate.execute("bad", || async { Err::<u32, _>("upstream 503".to_string()) });
        let next = gate.execute("good", || async { Ok::<_, String>(7) });

        let err = failing.await.unwrap_err();
        assert_eq!(err.into_upstream(), Some("upstream 503".to_string()));
        assert_eq!(next.await.unwrap(), 7);
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_operation_does_not_stop_worker() {
        let gate = RateLimitedGate::new(per_minute(10)).unwrap();

        let panicking = gate.execute("panics", || async {
            if true {
                panic!("bad prompt");
            }
            Ok::<u32, String>(0)
        });
        let next = gate.execute("after", || async { Ok::<_, String>(1) });

        assert!(matches!(panicking.await, Err(GateError::Dropped { .. })));
        assert_eq!(next.await.unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_expires_without_consuming_tokens() {
        let config = GateConfig::with_quotas(vec![QuotaConfig::per_hour(1)]);
        let gate = RateLimitedGate::new(config).unwrap();

        gate.execute("first", || async { Ok::<_, String>(()) })
            .await
            .unwrap();

        let ran = Arc::new(AtomicBool::new(false));
        let ran_clone = Arc::clone(&ran);
        let result = gate
            .execute_with_deadline("impatient", Duration::from_secs(5), move || async move {
                ran_clone.store(true, Ordering::SeqCst);
                Ok::<_, String>(())
            })
            .await;

        match result {
            Err(GateError::DeadlineExceeded { label, waited_ms }) => {
                assert_eq!(label, "impatient");
                assert!((5000..5100).contains(&waited_ms), "waited {waited_ms}ms");
            }
            other => panic!("expected deadline error, got {other:?}"),
        }
        assert!(!ran.load(Ordering::SeqCst));
        assert_eq!(gate.status().quotas["per-hour"].available, 0);

        // The queue keeps going and the next request gets the refilled token
        let start = Instant::now();
        gate.execute("patient", || async { Ok::<_, String>(()) })
            .await
            .unwrap();
        assert!(Instant::now() - start >= Duration::from_secs(3590));
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_applies_while_queued_behind_blocked_request() {
        let gate = RateLimitedGate::new(GateConfig::with_quotas(vec![QuotaConfig::per_hour(1)])).unwrap();
        gate.execute("first", || async { Ok::<_, String>(()) })
            .await
            .unwrap();

        // Blocks the worker until the hourly window rolls over
        let patient = tokio::spawn(gate.execute("patient", || async { Ok::<_, String>("patient") }));

        let ran = Arc::new(AtomicBool::new(false));
        let ran_clone = Arc::clone(&ran);
        let start = Instant::now();
        let result = gate
            .execute_with_deadline("impatient", Duration::from_secs(5), move || async move {
                ran_clone.store(true, Ordering::SeqCst);
                Ok::<_, String>("impatient")
            })
            .await;
        let caller_waited = Instant::now() - start;

        match result {
            Err(GateError::DeadlineExceeded { label, waited_ms }) => {
                assert_eq!(label, "impatient");
                assert_eq!(waited_ms, 5000);
            }
            other => panic!("expected deadline error, got {other:?}"),
        }
        assert!(caller_waited < Duration::from_secs(6), "caller waited {caller_waited:?}");

        assert_eq!(patient.await.unwrap().unwrap(), "patient");
        // Give the worker a turn to skip the withdrawn request
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert!(!ran.load(Ordering::SeqCst));
        assert_eq!(gate.status().quotas["per-hour"].available, 0);
        assert_eq!(gate.status().queue_length, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_does_not_cut_off_admitted_operation() {
        let gate = RateLimitedGate::new(per_minute(5)).unwrap();

        let result = gate
            .execute_with_deadline("slow", Duration::from_secs(1), || async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok::<_, String>(99)
            })
            .await;

        assert_eq!(result.unwrap(), 99);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_wakes_at_refill_boundary() {
        let config = per_minute(1).backoff(Duration::from_secs(50), Duration::from_secs(50), 0);
        let gate = RateLimitedGate::new(config.without_refill_tick()).unwrap();
        let log: Log = Arc::new(Mutex::new(Vec::new()));
        let start = Instant::now();

        let calls = vec![
            gate.execute("1", recording_op(&log, 1)),
            gate.execute("2", recording_op(&log, 2)),
        ];
        futures::future::join_all(calls).await;

        // A 50s backoff would overshoot to 100s without the refill clamp
        let second = log.lock().unwrap()[1].1 - start;
        assert!(second >= Duration::from_secs(60), "second ran at {second:?}");
        assert!(second < Duration::from_secs(61), "second ran at {second:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_caller_is_skipped() {
        let config = GateConfig::with_quotas(vec![QuotaConfig::per_minute(1)]);
        let gate = RateLimitedGate::new(config).unwrap();
        let calls = Arc::new(AtomicU32::new(0));

        let make_op = |calls: &Arc<AtomicU32>| {
            let calls = Arc::clone(calls);
            move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, String>(())
            }
        };

        let first = gate.execute("first", make_op(&calls));
        let abandoned = gate.execute("abandoned", make_op(&calls));
        let last = gate.execute("last", make_op(&calls));
        drop(abandoned);

        first.await.unwrap();
        last.await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_status_reports_draining_and_queue() {
        let gate = RateLimitedGate::new(per_minute(10)).unwrap();
        let (release_tx, release_rx) = oneshot::channel::<()>();
        let (started_tx, started_rx) = oneshot::channel::<()>();

        let blocking = tokio::spawn(gate.execute("blocking", move || async move {
            let _ = started_tx.send(());
            let _ = release_rx.await;
            Ok::<_, String>(())
        }));
        let queued = gate.execute("queued", || async { Ok::<_, String>(()) });

        started_rx.await.unwrap();
        let status = gate.status();
        assert!(status.is_draining);
        assert_eq!(status.queue_length, 1);
        assert_eq!(status.quotas["per-minute"].available, 9);

        release_tx.send(()).unwrap();
        blocking.await.unwrap().unwrap();
        queued.await.unwrap();

        // Give the worker a turn to notice the empty queue
        for _ in 0..10 {
            if !gate.status().is_draining {
                break;
            }
            tokio::task::yield_now().await;
        }
        let status = gate.status();
        assert!(!status.is_draining);
        assert_eq!(status.queue_length, 0);
    }

    #[tokio::test]
    async fn test_manual_clock_replays_windows_instantly() {
        let clock = Arc::new(ManualClock::new());
        let config = per_minute(2).without_refill_tick();
        let gate = RateLimitedGate::with_clock(config, clock.clone()).unwrap();

        let calls: Vec<_> = (0..6u32)
            .map(|i| gate.execute(format!("sim-{i}"), move || async move { Ok::<_, String>(i) }))
            .collect();
        let results: Vec<u32> = futures::future::join_all(calls)
            .await
            .into_iter()
            .map(Result::unwrap)
            .collect();

        assert_eq!(results, (0..6).collect::<Vec<_>>());
        // Two more windows were needed after the initial burst
        assert!(clock.elapsed() >= Duration::from_secs(120));
    }

    #[tokio::test(start_paused = true)]
    async fn test_refill_is_idempotent_within_window() {
        let gate = RateLimitedGate::new(per_minute(3).without_refill_tick()).unwrap();
        for i in 0..3 {
            gate.execute("drain", move || async move { Ok::<_, String>(i) })
                .await
                .unwrap();
        }
        assert_eq!(gate.refill(), 0);

        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(gate.refill(), 0);

        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(gate.refill(), 3);
        assert_eq!(gate.refill(), 0);
        assert_eq!(gate.status().quotas["per-minute"].available, 3);
    }

    #[tokio::test]
    async fn test_queued_requests_finish_after_gate_dropped() {
        let gate = RateLimitedGate::new(per_minute(5)).unwrap();
        let first = gate.execute("a", || async { Ok::<_, String>(1) });
        let second = gate.execute("b", || async { Ok::<_, String>(2) });
        drop(gate);

        assert_eq!(first.await.unwrap(), 1);
        assert_eq!(second.await.unwrap(), 2);
    }
}
