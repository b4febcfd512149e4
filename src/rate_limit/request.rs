//! Queued Requests
//!
//! A [`PendingRequest`] carries a type-erased operation through the queue.
//! The caller keeps the receiving half of a oneshot channel; the worker
//! resolves it exactly once, or drops it if the caller already went away.

use futures::future::BoxFuture;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::warn;

use super::error::GateError;

/// Receiving half handed back to the caller
pub(crate) type ReplyReceiver<T, E> = oneshot::Receiver<Result<T, GateError<E>>>;

/// How a request left the worker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The operation returned `Ok`
    Succeeded,
    /// The operation returned `Err`
    Failed,
    /// The operation panicked
    Panicked,
}

const WAITING: u8 = 0;
const CLAIMED: u8 = 1;
const ADMITTED: u8 = 2;
const CANCELLED: u8 = 3;

/// Admission state shared by the caller and the drain worker
///
/// The worker claims the request while it checks the quotas, so a caller
/// giving up at its deadline either wins cleanly (no tokens taken) or sees
/// that the request was admitted and waits for the result.
#[derive(Debug, Clone, Default)]
pub(crate) struct Admission(Arc<AtomicU8>);

impl Admission {
    fn transition(&self, from: u8, to: u8) -> Result<u8, u8> {
        self.0.compare_exchange(from, to, Ordering::AcqRel, Ordering::Acquire)
    }

    /// Worker side: hold the request while checking quotas
    pub(crate) fn claim(&self) -> bool {
        self.transition(WAITING, CLAIMED).is_ok()
    }

    /// Worker side: no tokens this time, hand the request back
    pub(crate) fn release(&self) {
        let _ = self.transition(CLAIMED, WAITING);
    }

    /// Worker side: tokens taken, the operation will run
    pub(crate) fn admit(&self) {
        let _ = self.transition(CLAIMED, ADMITTED);
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire) == CANCELLED
    }

    /// Caller side: give up unless already admitted
    ///
    /// Returns true if the request was withdrawn before admission.
    pub(crate) async fn cancel(&self) -> bool {
        loop {
            match self.transition(WAITING, CANCELLED) {
                Ok(_) => return true,
                Err(CANCELLED) => return true,
                // The worker holds the quota lock only briefly
                Err(CLAIMED) => tokio::task::yield_now().await,
                Err(_) => return false,
            }
        }
    }
}

trait Job: Send {
    fn is_abandoned(&self) -> bool;

    fn run(self: Box<Self>) -> BoxFuture<'static, bool>;

    fn expire(self: Box<Self>, label: String, waited: Duration);
}

struct Task<F, T, E> {
    operation: F,
    reply: oneshot::Sender<Result<T, GateError<E>>>,
}

impl<F, Fut, T, E> Job for Task<F, T, E>
where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = Result<T, E>> + Send + 'static,
    T: Send + 'static,
    E: Send + 'static,
{
    fn is_abandoned(&self) -> bool {
        self.reply.is_closed()
    }

    fn run(self: Box<Self>) -> BoxFuture<'static, bool> {
        let Task { operation, reply } = *self;
        Box::pin(async move {
            let result = operation().await;
            let succeeded = result.is_ok();
            // The caller may have stopped waiting while the operation ran
            let _ = reply.send(result.map_err(GateError::Upstream));
            succeeded
        })
    }

    fn expire(self: Box<Self>, label: String, waited: Duration) {
        let _ = self.reply.send(Err(GateError::DeadlineExceeded {
            label,
            waited_ms: waited.as_millis() as u64,
        }));
    }
}

/// One queued call to the protected operation
pub struct PendingRequest {
    id: u64,
    label: String,
    enqueued_at: Instant,
    deadline: Option<Instant>,
    admission: Admission,
    job: Box<dyn Job>,
}

impl PendingRequest {
    /// Wrap an operation, returning the request and the caller's receiver
    pub(crate) fn new<F, Fut, T, E>(
        id: u64,
        label: String,
        enqueued_at: Instant,
        max_wait: Option<Duration>,
        operation: F,
    ) -> (Self, ReplyReceiver<T, E>)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: Send + 'static,
    {
        let (reply, receiver) = oneshot::channel();
        let request = Self {
            id,
            label,
            enqueued_at,
            deadline: max_wait.map(|wait| enqueued_at + wait),
            admission: Admission::default(),
            job: Box::new(Task { operation, reply }),
        };
        (request, receiver)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn enqueued_at(&self) -> Instant {
        self.enqueued_at
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub(crate) fn admission(&self) -> &Admission {
        &self.admission
    }

    /// Whether the caller has stopped waiting for the result
    pub fn is_abandoned(&self) -> bool {
        self.admission.is_cancelled() || self.job.is_abandoned()
    }

    /// Whether the deadline, if any, has passed at `now`
    pub fn is_expired(&self, now: Instant) -> bool {
        self.deadline.is_some_and(|deadline| now >= deadline)
    }

    /// Time left before the deadline, if any
    pub fn remaining(&self, now: Instant) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(now))
    }

    /// Reject the request because it was not admitted in time
    pub(crate) fn expire(self, now: Instant) {
        let waited = now.saturating_duration_since(self.enqueued_at);
        self.job.expire(self.label, waited);
    }

    /// Invoke the operation and deliver its result
    ///
    /// The operation runs in its own task so a panic only loses this request.
    pub(crate) async fn run(self) -> Outcome {
        let PendingRequest { id, label, job, .. } = self;
        match tokio::spawn(job.run()).await {
            Ok(true) => Outcome::Succeeded,
            Ok(false) => Outcome::Failed,
            Err(err) => {
                warn!(request_id = id, label = %label, "Gated operation aborted: {}", err);
                Outcome::Panicked
            }
        }
    }
}

impl fmt::Debug for PendingRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingRequest")
            .field("id", &self.id)
            .field("label", &self.label)
            .field("enqueued_at", &self.enqueued_at)
            .field("deadline", &self.deadline)
            .finish_non_exhaustive()
    }
}

/// Await the worker's reply for a request
pub(crate) async fn await_reply<T, E>(
    receiver: ReplyReceiver<T, E>,
    label: String,
) -> Result<T, GateError<E>> {
    match receiver.await {
        Ok(result) => result,
        Err(_) => Err(GateError::Dropped { label }),
    }
}

/// Await the reply, giving up if not admitted by `deadline`
///
/// The timer runs on tokio time. The worker also checks the deadline on the
/// gate's clock, which is what applies under a virtual clock.
pub(crate) async fn await_reply_until<T, E>(
    mut receiver: ReplyReceiver<T, E>,
    label: String,
    admission: Admission,
    deadline: Instant,
    max_wait: Duration,
) -> Result<T, GateError<E>> {
    match tokio::time::timeout_at(deadline, &mut receiver).await {
        Ok(Ok(result)) => result,
        Ok(Err(_)) => Err(GateError::Dropped { label }),
        Err(_) => {
            if admission.cancel().await {
                drop(receiver);
                Err(GateError::DeadlineExceeded {
                    label,
                    waited_ms: max_wait.as_millis() as u64,
                })
            } else {
                // Admitted in time; the result is on its way
                await_reply(receiver, label).await
            }
        }
    }
}
