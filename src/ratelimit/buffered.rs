//! Permit pool with a bounded FIFO wait queue.
//!
//! [`BufferedAsyncLimiter`] hands out at most `max_permits` permits. Once they
//! are gone, up to `max_queue_depth` further requests wait in arrival order
//! for a [`release`](BufferedAsyncLimiter::release); anything beyond that is
//! rejected straight away with [`FloodgateError::BufferFull`].
//!
//! Waiting never blocks a thread. A queued request is an unresolved
//! [`Acquire`] future, completed through a `tokio::sync::oneshot` channel by
//! whichever thread calls `release`.

use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use futures::future::FusedFuture;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use super::clock::{maintenance_interval, Clock, SystemClock};
use crate::error::{FloodgateError, Result};

/// A request waiting for a permit.
struct PendingAcquire {
    id: u64,
    completion: oneshot::Sender<Result<()>>,
    enqueued_at: Instant,
}

struct PoolState {
    available: usize,
    queue: VecDeque<PendingAcquire>,
    next_id: u64,
}

struct Inner {
    max_permits: usize,
    max_queue: usize,
    /// `None` when queued requests may wait forever
    timeout: Option<Duration>,
    clock: Arc<dyn Clock>,
    state: Mutex<PoolState>,
}

impl Inner {
    fn is_expired(&self, waiter: &PendingAcquire, now: Instant) -> bool {
        self.timeout
            .is_some_and(|timeout| now.saturating_duration_since(waiter.enqueued_at) >= timeout)
    }

    /// Fail every queued request that has outlived the timeout.
    ///
    /// The queue is in arrival order, so expired requests are all at the front.
    fn expire_waiters(&self, state: &mut PoolState, now: Instant) -> usize {
        let Some(timeout) = self.timeout else {
            return 0;
        };

        let mut expired = 0;
        while state
            .queue
            .front()
            .is_some_and(|waiter| self.is_expired(waiter, now))
        {
            if let Some(waiter) = state.queue.pop_front() {
                let _ = waiter
                    .completion
                    .send(Err(FloodgateError::AcquireTimeout { timeout }));
                expired += 1;
            }
        }

        if expired > 0 {
            debug!(expired = expired, timeout = ?timeout, "Expired queued permit requests");
        }
        expired
    }

    /// Give one permit back: to the oldest live waiter if there is one,
    /// otherwise to the free pool.
    fn release_in(&self, state: &mut PoolState, now: Instant) {
        self.expire_waiters(state, now);

        while let Some(waiter) = state.queue.pop_front() {
            if waiter.completion.send(Ok(())).is_ok() {
                trace!(
                    waiter = waiter.id,
                    waited = ?now.saturating_duration_since(waiter.enqueued_at),
                    "Handed permit to queued request"
                );
                return;
            }
            // The receiving side is gone; try the next one.
        }

        if state.available < self.max_permits {
            state.available += 1;
        } else {
            warn!(
                max_permits = self.max_permits,
                "Release without a matching acquire ignored"
            );
        }
    }

    /// Take a still-queued request out of the queue.
    fn remove_waiter(state: &mut PoolState, id: u64) -> bool {
        match state.queue.iter().position(|waiter| waiter.id == id) {
            Some(index) => {
                state.queue.remove(index);
                true
            }
            None => false,
        }
    }
}

/// Asynchronous admission over a fixed number of permits.
///
/// Cloning is cheap and every clone shares the same pool.
#[derive(Clone)]
pub struct BufferedAsyncLimiter {
    inner: Arc<Inner>,
}

impl BufferedAsyncLimiter {
    /// Create a limiter with `max_permits` permits and room for
    /// `max_queue_depth` waiters.
    ///
    /// A queued request not serviced within `timeout_millis` fails with
    /// [`FloodgateError::AcquireTimeout`]. Zero disables the timeout.
    pub fn new(max_permits: usize, max_queue_depth: usize, timeout_millis: u64) -> Self {
        Self::with_clock(
            max_permits,
            max_queue_depth,
            timeout_millis,
            Arc::new(SystemClock),
        )
    }

    /// Create a limiter that reads time from `clock`.
    pub fn with_clock(
        max_permits: usize,
        max_queue_depth: usize,
        timeout_millis: u64,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let timeout = (timeout_millis > 0).then(|| Duration::from_millis(timeout_millis));
        Self {
            inner: Arc::new(Inner {
                max_permits,
                max_queue: max_queue_depth,
                timeout,
                clock,
                state: Mutex::new(PoolState {
                    available: max_permits,
                    queue: VecDeque::with_capacity(max_queue_depth),
                    next_id: 0,
                }),
            }),
        }
    }

    /// Ask for a permit.
    ///
    /// The returned future is already complete when a permit was free or
    /// when the request was rejected, and pending while the request is
    /// queued. A permit obtained this way must be given back with
    /// [`release`](Self::release).
    pub fn acquire(&self) -> Acquire {
        let inner = &self.inner;
        let mut state = inner.state.lock();
        let now = inner.clock.now();
        inner.expire_waiters(&mut state, now);

        if state.available > 0 {
            state.available -= 1;
            trace!(available = state.available, "Permit granted immediately");
            return Acquire::ready(Ok(()), Arc::clone(inner));
        }

        if state.queue.len() < inner.max_queue {
            let id = state.next_id;
            state.next_id += 1;
            let (completion, receiver) = oneshot::channel();
            state.queue.push_back(PendingAcquire {
                id,
                completion,
                enqueued_at: now,
            });
            debug!(
                waiter = id,
                queued = state.queue.len(),
                "No free permit, request queued"
            );
            return Acquire::waiting(id, receiver, Arc::clone(inner));
        }

        warn!(
            max_permits = inner.max_permits,
            max_queue = inner.max_queue,
            "Permit buffer full, rejecting request"
        );
        Acquire::ready(
            Err(FloodgateError::BufferFull {
                max_permits: inner.max_permits,
                max_queue: inner.max_queue,
            }),
            Arc::clone(inner),
        )
    }

    /// Give a permit back.
    ///
    /// The permit goes straight to the longest-waiting queued request, so a
    /// newer `acquire` can never overtake it.
    pub fn release(&self) {
        let mut state = self.inner.state.lock();
        let now = self.inner.clock.now();
        self.inner.release_in(&mut state, now);
    }

    /// Fail queued requests that have waited longer than the timeout.
    ///
    /// Returns how many were failed.
    pub fn sweep_expired(&self) -> usize {
        let mut state = self.inner.state.lock();
        let now = self.inner.clock.now();
        self.inner.expire_waiters(&mut state, now)
    }

    /// Run [`sweep_expired`](Self::sweep_expired) every `every` on the current
    /// tokio runtime. Periods shorter than a millisecond are raised to one.
    ///
    /// The task ends on its own once the limiter and all its pending requests
    /// are gone.
    pub fn spawn_sweeper(&self, every: Duration) -> JoinHandle<()> {
        let inner: Weak<Inner> = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            let mut ticker = maintenance_interval(every);
            loop {
                ticker.tick().await;
                let Some(inner) = inner.upgrade() else {
                    break;
                };
                let mut state = inner.state.lock();
                let now = inner.clock.now();
                inner.expire_waiters(&mut state, now);
            }
        })
    }

    /// Permits currently free.
    pub fn available_permits(&self) -> usize {
        self.inner.state.lock().available
    }

    /// Requests currently waiting.
    pub fn queued(&self) -> usize {
        self.inner.state.lock().queue.len()
    }

    pub fn max_permits(&self) -> usize {
        self.inner.max_permits
    }

    pub fn max_queue_depth(&self) -> usize {
        self.inner.max_queue
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.inner.timeout
    }
}

impl fmt::Debug for BufferedAsyncLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("BufferedAsyncLimiter")
            .field("max_permits", &self.inner.max_permits)
            .field("max_queue", &self.inner.max_queue)
            .field("timeout", &self.inner.timeout)
            .field("available", &state.available)
            .field("queued", &state.queue.len())
            .finish()
    }
}

enum AcquireState {
    /// Resolved at creation; the outcome has not been observed yet.
    Ready(Result<()>),
    /// Sitting in the wait queue.
    Waiting {
        id: u64,
        receiver: oneshot::Receiver<Result<()>>,
    },
    Done,
}

/// The future returned by [`BufferedAsyncLimiter::acquire`].
///
/// Resolves to `Ok(())` once a permit has been granted. Dropping it before
/// the outcome is observed cancels the request; a permit granted in the
/// meantime is released again.
#[must_use = "a permit request does nothing unless awaited"]
pub struct Acquire {
    state: AcquireState,
    inner: Arc<Inner>,
}

impl Acquire {
    fn ready(outcome: Result<()>, inner: Arc<Inner>) -> Self {
        Self {
            state: AcquireState::Ready(outcome),
            inner,
        }
    }

    fn waiting(id: u64, receiver: oneshot::Receiver<Result<()>>, inner: Arc<Inner>) -> Self {
        Self {
            state: AcquireState::Waiting { id, receiver },
            inner,
        }
    }

    /// Whether this request went into the wait queue rather than being
    /// decided on the spot.
    pub fn is_queued(&self) -> bool {
        matches!(self.state, AcquireState::Waiting { .. })
    }

    /// Withdraw a queued request.
    ///
    /// Returns `true` if the request was still queued; it then resolves to
    /// [`FloodgateError::AcquireCancelled`] and no permit is granted. Returns
    /// `false`, changing nothing, if the request had already been decided.
    pub fn cancel(&mut self) -> bool {
        let AcquireState::Waiting { id, .. } = self.state else {
            return false;
        };

        let removed = Inner::remove_waiter(&mut self.inner.state.lock(), id);
        if removed {
            debug!(waiter = id, "Queued permit request cancelled");
            self.state = AcquireState::Ready(Err(FloodgateError::AcquireCancelled));
        }
        removed
    }
}

impl Future for Acquire {
    type Output = Result<()>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match std::mem::replace(&mut this.state, AcquireState::Done) {
            AcquireState::Ready(outcome) => Poll::Ready(outcome),
            AcquireState::Waiting { id, mut receiver } => match Pin::new(&mut receiver).poll(cx) {
                Poll::Pending => {
                    this.state = AcquireState::Waiting { id, receiver };
                    Poll::Pending
                }
                Poll::Ready(Ok(outcome)) => Poll::Ready(outcome),
                // The sender was dropped without an answer.
                Poll::Ready(Err(_)) => Poll::Ready(Err(FloodgateError::AcquireCancelled)),
            },
            AcquireState::Done => Poll::Pending,
        }
    }
}

impl FusedFuture for Acquire {
    fn is_terminated(&self) -> bool {
        matches!(self.state, AcquireState::Done)
    }
}

impl Drop for Acquire {
    fn drop(&mut self) {
        let granted = match std::mem::replace(&mut self.state, AcquireState::Done) {
            AcquireState::Ready(outcome) => outcome.is_ok(),
            AcquireState::Waiting { id, mut receiver } => {
                let mut state = self.inner.state.lock();
                if Inner::remove_waiter(&mut state, id) {
                    trace!(waiter = id, "Queued permit request dropped");
                    return;
                }
                // No longer queued, so it was answered while the lock was held.
                receiver.close();
                let granted = matches!(receiver.try_recv(), Ok(Ok(())));
                if granted {
                    let now = self.inner.clock.now();
                    self.inner.release_in(&mut state, now);
                }
                return;
            }
            AcquireState::Done => false,
        };

        if granted {
            let mut state = self.inner.state.lock();
            let now = self.inner.clock.now();
            self.inner.release_in(&mut state, now);
        }
    }
}

impl fmt::Debug for Acquire {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match &self.state {
            AcquireState::Ready(Ok(())) => "granted",
            AcquireState::Ready(Err(_)) => "rejected",
            AcquireState::Waiting { .. } => "queued",
            AcquireState::Done => "done",
        };
        f.debug_struct("Acquire").field("state", &state).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::clock::ManualClock;
    use futures::FutureExt;
    use tokio_test::task;
    use tokio_test::{assert_pending, assert_ready, assert_ready_err, assert_ready_ok};

    fn manual(
        permits: usize,
        queue: usize,
        timeout_millis: u64,
    ) -> (BufferedAsyncLimiter, ManualClock) {
        let clock = ManualClock::new();
        let limiter = BufferedAsyncLimiter::with_clock(
            permits,
            queue,
            timeout_millis,
            Arc::new(clock.clone()),
        );
        (limiter, clock)
    }

    #[test]
    fn test_permits_granted_immediately() {
        let limiter = BufferedAsyncLimiter::new(10, 10, 0);

        for _ in 0..10 {
            let acquire = limiter.acquire();
            assert!(!acquire.is_queued());
            assert!(acquire.now_or_never().expect("should be ready").is_ok());
        }
        assert_eq!(limiter.available_permits(), 0);

        let mut eleventh = task::spawn(limiter.acquire());
        assert_pending!(eleventh.poll());
        assert_eq!(limiter.queued(), 1);

        limiter.release();
        assert!(eleventh.is_woken());
        assert_ready_ok!(eleventh.poll());
        assert_eq!(limiter.queued(), 0);
        assert_eq!(limiter.available_permits(), 0);
    }

    #[test]
    fn test_buffer_full_rejects_immediately() {
        let limiter = BufferedAsyncLimiter::new(1, 1, 0);

        let mut first = task::spawn(limiter.acquire());
        let mut second = task::spawn(limiter.acquire());
        let mut third = task::spawn(limiter.acquire());

        assert_ready_ok!(first.poll());
        assert_pending!(second.poll());
        let err = assert_ready_err!(third.poll());
        assert!(matches!(
            err,
            FloodgateError::BufferFull {
                max_permits: 1,
                max_queue: 1
            }
        ));

        // The rejection does not disturb the queued request.
        limiter.release();
        assert_ready_ok!(second.poll());
    }

    #[test]
    fn test_release_serves_waiters_in_arrival_order() {
        let limiter = BufferedAsyncLimiter::new(1, 3, 0);
        let mut holder = task::spawn(limiter.acquire());
        assert_ready_ok!(holder.poll());

        let mut waiters: Vec<_> = (0..3).map(|_| task::spawn(limiter.acquire())).collect();
        for waiter in waiters.iter_mut() {
            assert_pending!(waiter.poll());
        }

        for served in 0..3 {
            limiter.release();
            for (i, waiter) in waiters.iter_mut().enumerate() {
                if i < served {
                    continue;
                }
                if i == served {
                    assert_ready_ok!(waiter.poll());
                } else {
                    assert_pending!(waiter.poll());
                }
            }
        }
    }

    #[test]
    fn test_release_is_not_stolen_by_new_acquire() {
        let limiter = BufferedAsyncLimiter::new(1, 1, 0);
        let mut holder = task::spawn(limiter.acquire());
        assert_ready_ok!(holder.poll());
        let mut waiter = task::spawn(limiter.acquire());
        assert_pending!(waiter.poll());

        limiter.release();
        // The permit went to the waiter, so a newcomer has to queue.
        let mut newcomer = task::spawn(limiter.acquire());
        assert!(newcomer.is_queued());
        assert_pending!(newcomer.poll());
        assert_ready_ok!(waiter.poll());
    }

    #[test]
    fn test_release_without_waiters_restores_pool() {
        let limiter = BufferedAsyncLimiter::new(2, 0, 0);
        assert!(limiter.acquire().now_or_never().unwrap().is_ok());
        assert_eq!(limiter.available_permits(), 1);

        limiter.release();
        assert_eq!(limiter.available_permits(), 2);

        // Extra releases never push the pool above its size.
        limiter.release();
        assert_eq!(limiter.available_permits(), 2);
    }

    #[test]
    fn test_zero_queue_depth_rejects_when_exhausted() {
        let limiter = BufferedAsyncLimiter::new(1, 0, 0);
        assert!(limiter.acquire().now_or_never().unwrap().is_ok());
        let outcome = limiter.acquire().now_or_never().unwrap();
        assert!(matches!(outcome, Err(FloodgateError::BufferFull { .. })));
    }

    #[test]
    fn test_queued_request_times_out_lazily() {
        let (limiter, clock) = manual(1, 1, 100);
        assert_eq!(limiter.timeout(), Some(Duration::from_millis(100)));

        let mut holder = task::spawn(limiter.acquire());
        assert_ready_ok!(holder.poll());
        let mut stale = task::spawn(limiter.acquire());
        assert_pending!(stale.poll());

        clock.advance(Duration::from_millis(150));

        // The next acquire expires the stale request and takes its queue slot.
        let mut fresh = task::spawn(limiter.acquire());
        assert!(fresh.is_queued());
        let err = assert_ready_err!(stale.poll());
        assert!(matches!(err, FloodgateError::AcquireTimeout { .. }));
        assert_pending!(fresh.poll());

        limiter.release();
        assert_ready_ok!(fresh.poll());
    }

    #[test]
    fn test_release_skips_expired_waiters() {
        let (limiter, clock) = manual(1, 2, 100);
        assert!(limiter.acquire().now_or_never().unwrap().is_ok());

        let mut old = task::spawn(limiter.acquire());
        clock.advance(Duration::from_millis(60));
        let mut young = task::spawn(limiter.acquire());
        clock.advance(Duration::from_millis(60));

        limiter.release();
        assert!(matches!(
            assert_ready!(old.poll()),
            Err(FloodgateError::AcquireTimeout { .. })
        ));
        assert_ready_ok!(young.poll());
    }

    #[test]
    fn test_sweep_expired() {
        let (limiter, clock) = manual(1, 2, 50);
        assert!(limiter.acquire().now_or_never().unwrap().is_ok());
        let mut a = task::spawn(limiter.acquire());
        let mut b = task::spawn(limiter.acquire());

        assert_eq!(limiter.sweep_expired(), 0);
        clock.advance(Duration::from_millis(50));
        assert_eq!(limiter.sweep_expired(), 2);
        assert_eq!(limiter.queued(), 0);

        assert_ready_err!(a.poll());
        assert_ready_err!(b.poll());
        assert_eq!(limiter.available_permits(), 0);
    }

    #[test]
    fn test_zero_timeout_waits_forever() {
        let (limiter, clock) = manual(1, 1, 0);
        assert_eq!(limiter.timeout(), None);
        assert!(limiter.acquire().now_or_never().unwrap().is_ok());
        let mut waiter = task::spawn(limiter.acquire());

        clock.advance(Duration::from_secs(86_400));
        assert_eq!(limiter.sweep_expired(), 0);
        assert_pending!(waiter.poll());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_expires_idle_waiters() {
        let limiter = BufferedAsyncLimiter::new(1, 1, 0);
        // Sweeper with no timeout set should leave waiters alone.
        let handle = limiter.spawn_sweeper(Duration::from_millis(10));
        assert!(limiter.acquire().await.is_ok());
        let mut waiter = task::spawn(limiter.acquire());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_pending!(waiter.poll());
        handle.abort();

        let (limiter, clock) = manual(1, 1, 100);
        let handle = limiter.spawn_sweeper(Duration::from_millis(10));
        assert!(limiter.acquire().await.is_ok());
        let waiter = limiter.acquire();
        clock.advance(Duration::from_millis(100));
        let outcome = waiter.await;
        assert!(matches!(outcome, Err(FloodgateError::AcquireTimeout { .. })));
        handle.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_with_zero_period_keeps_running() {
        let (limiter, clock) = manual(1, 1, 100);
        let handle = limiter.spawn_sweeper(Duration::ZERO);
        assert!(limiter.acquire().await.is_ok());

        let mut waiter = task::spawn(limiter.acquire());
        assert_pending!(waiter.poll());
        clock.advance(Duration::from_millis(100));
        tokio::time::sleep(Duration::from_millis(5)).await;

        assert_eq!(limiter.queued(), 0);
        assert!(matches!(
            assert_ready!(waiter.poll()),
            Err(FloodgateError::AcquireTimeout { .. })
        ));
        assert!(!handle.is_finished());
        handle.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_stops_once_limiter_and_requests_are_gone() {
        let limiter = BufferedAsyncLimiter::new(1, 1, 0);
        let sweeper = limiter.spawn_sweeper(Duration::from_millis(10));
        assert!(limiter.acquire().await.is_ok());
        let waiter = limiter.acquire();
        assert!(waiter.is_queued());

        // The queued request still holds the pool.
        drop(limiter);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!sweeper.is_finished());

        drop(waiter);
        tokio::time::timeout(Duration::from_secs(1), sweeper)
            .await
            .expect("sweeper should stop")
            .unwrap();
    }

    #[test]
    fn test_cancel_removes_queued_request() {
        let limiter = BufferedAsyncLimiter::new(1, 1, 0);
        assert!(limiter.acquire().now_or_never().unwrap().is_ok());

        let mut waiter = limiter.acquire();
        assert!(waiter.cancel());
        assert!(!waiter.cancel());
        assert_eq!(limiter.queued(), 0);
        assert!(matches!(
            waiter.now_or_never(),
            Some(Err(FloodgateError::AcquireCancelled))
        ));

        // The released permit returns to the pool instead of the cancelled request.
        limiter.release();
        assert_eq!(limiter.available_permits(), 1);
    }

    #[test]
    fn test_cancel_after_grant_is_noop() {
        let limiter = BufferedAsyncLimiter::new(1, 1, 0);
        assert!(limiter.acquire().now_or_never().unwrap().is_ok());
        let mut waiter = limiter.acquire();
        limiter.release();

        assert!(!waiter.cancel());
        assert!(waiter.now_or_never().unwrap().is_ok());
        assert_eq!(limiter.available_permits(), 0);
    }

    #[test]
    fn test_dropping_queued_request_frees_its_slot() {
        let limiter = BufferedAsyncLimiter::new(1, 1, 0);
        assert!(limiter.acquire().now_or_never().unwrap().is_ok());
        drop(limiter.acquire());
        assert_eq!(limiter.queued(), 0);

        let mut next = task::spawn(limiter.acquire());
        assert_pending!(next.poll());
        limiter.release();
        assert_ready_ok!(next.poll());
    }

    #[test]
    fn test_dropping_unobserved_grant_returns_permit() {
        let limiter = BufferedAsyncLimiter::new(1, 1, 0);
        assert!(limiter.acquire().now_or_never().unwrap().is_ok());
        let waiter = limiter.acquire();
        limiter.release();
        assert_eq!(limiter.available_permits(), 0);

        drop(waiter);
        assert_eq!(limiter.available_permits(), 1);

        drop(limiter.acquire());
        assert_eq!(limiter.available_permits(), 1);
    }

    #[test]
    fn test_fused_future() {
        let limiter = BufferedAsyncLimiter::new(1, 0, 0);
        let mut acquire = task::spawn(limiter.acquire());
        assert!(!acquire.is_terminated());
        assert_ready_ok!(acquire.poll());
        assert!(acquire.is_terminated());
    }

    #[tokio::test]
    async fn test_queued_request_completed_from_another_thread() {
        let limiter = BufferedAsyncLimiter::new(1, 1, 0);
        limiter.acquire().await.unwrap();

        let waiter = limiter.acquire();
        let releaser = limiter.clone();
        let handle = std::thread::spawn(move || releaser.release());

        waiter.await.unwrap();
        handle.join().unwrap();
    }
}
