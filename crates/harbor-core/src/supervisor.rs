//! Per-request execution isolation.
//!
//! Every inbound request runs inside an [`ExecutionContext`]: a cancellation
//! scope plus a tracker for the work units the request spawns. When the
//! handler returns, the scope is cancelled and anything still running is
//! interrupted at its next await point. A handler that panics, or whose
//! future is dropped mid-flight, gets the same interruption.
//!
//! Work that must outlive a request goes to the [`SharedPool`], which is
//! created once with the [`Supervisor`] and is never a child of a request
//! scope. It is shut down only when the process exits.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::Instrument;
use uuid::Uuid;

use crate::error::HarborError;

/// How long teardown waits for cancelled units to unwind.
pub const DEFAULT_TEARDOWN_GRACE: Duration = Duration::from_secs(1);

/// Handle to a spawned unit of work.
///
/// Resolves to the unit's output, or to [`HarborError::Cancelled`] if the
/// owning scope was torn down first.
pub struct WorkHandle<T> {
    inner: JoinHandle<Option<T>>,
}

impl<T> WorkHandle<T> {
    pub fn is_finished(&self) -> bool {
        self.inner.is_finished()
    }
}

impl<T> Future for WorkHandle<T> {
    type Output = Result<T, HarborError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.inner).poll(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Ok(Some(output))) => Poll::Ready(Ok(output)),
            Poll::Ready(Ok(None)) => Poll::Ready(Err(HarborError::Cancelled(
                "work unit interrupted by scope teardown".into(),
            ))),
            Poll::Ready(Err(e)) if e.is_panic() => Poll::Ready(Err(HarborError::Cancelled(
                format!("work unit panicked: {e}"),
            ))),
            Poll::Ready(Err(e)) => Poll::Ready(Err(HarborError::Cancelled(e.to_string()))),
        }
    }
}

fn spawn_scoped<F>(tracker: &TaskTracker, token: &CancellationToken, fut: F) -> WorkHandle<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    let token = token.clone();
    let inner = tracker.spawn(
        async move {
            tokio::select! {
                biased;
                _ = token.cancelled() => None,
                out = fut => Some(out),
            }
        }
        .in_current_span(),
    );
    WorkHandle { inner }
}

/// Long-lived pool for work that must survive the request that submitted it.
#[derive(Clone)]
pub struct SharedPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    token: CancellationToken,
    closing: CancellationToken,
    tracker: TaskTracker,
}

impl SharedPool {
    fn new() -> Self {
        Self {
            inner: Arc::new(PoolInner {
                token: CancellationToken::new(),
                closing: CancellationToken::new(),
                tracker: TaskTracker::new(),
            }),
        }
    }

    pub fn spawn<F>(&self, fut: F) -> WorkHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        spawn_scoped(&self.inner.tracker, &self.inner.token, fut)
    }

    /// Number of units currently running in the pool.
    pub fn len(&self) -> usize {
        self.inner.tracker.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.tracker.is_empty()
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.token.is_cancelled()
    }

    /// Resolves once shutdown has begun. Periodic units should return then
    /// instead of waiting out the grace period.
    pub async fn closing(&self) {
        self.inner.closing.cancelled().await
    }

    /// Let running units finish for up to `grace`, then cancel the rest.
    ///
    /// Returns `true` when every unit finished on its own.
    pub async fn shutdown(&self, grace: Duration) -> bool {
        self.inner.closing.cancel();
        self.inner.tracker.close();
        let clean = tokio::time::timeout(grace, self.inner.tracker.wait())
            .await
            .is_ok();
        self.inner.token.cancel();
        if !clean {
            tracing::warn!(
                remaining = self.inner.tracker.len(),
                "Shared pool units cancelled at shutdown"
            );
            self.inner.tracker.wait().await;
        }
        tracing::info!("Shared pool shut down");
        clean
    }
}

/// Isolated work group for one inbound request.
#[derive(Clone)]
pub struct ExecutionContext {
    inner: Arc<ContextInner>,
}

struct ContextInner {
    request_id: Uuid,
    token: CancellationToken,
    tracker: TaskTracker,
    handler_active: AtomicBool,
    shared: SharedPool,
}

impl ExecutionContext {
    fn new(shared: SharedPool) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                request_id: Uuid::new_v4(),
                token: CancellationToken::new(),
                tracker: TaskTracker::new(),
                handler_active: AtomicBool::new(true),
                shared,
            }),
        }
    }

    pub fn request_id(&self) -> Uuid {
        self.inner.request_id
    }

    /// Spawn a unit bound to this request. It is interrupted at teardown.
    pub fn spawn<F>(&self, fut: F) -> WorkHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        spawn_scoped(&self.inner.tracker, &self.inner.token, fut)
    }

    /// The process-wide pool; work submitted there outlives this request.
    pub fn shared_pool(&self) -> &SharedPool {
        &self.inner.shared
    }

    /// Units associated with this request, counting the handler itself.
    pub fn active_units(&self) -> usize {
        let handler = usize::from(self.inner.handler_active.load(Ordering::Acquire));
        handler + self.inner.tracker.len()
    }

    /// Units spawned by the handler that are still running.
    pub fn spawned_units(&self) -> usize {
        self.inner.tracker.len()
    }

    pub fn is_torn_down(&self) -> bool {
        self.inner.token.is_cancelled()
    }

    /// Resolves once the request scope has been torn down.
    pub async fn cancelled(&self) {
        self.inner.token.cancelled().await
    }

    /// Close the scope and interrupt whatever is still running in it.
    fn close(&self) {
        self.inner.handler_active.store(false, Ordering::Release);
        self.inner.tracker.close();
        self.inner.token.cancel();
    }

    async fn teardown(&self, grace: Duration) -> TeardownReport {
        let units_at_return = self.active_units();
        let leftover = self.inner.tracker.len();
        self.close();

        if leftover > 0 {
            tracing::warn!(
                request_id = %self.inner.request_id,
                leftover,
                "Interrupting work left running by request handler"
            );
        }

        let drained = tokio::time::timeout(grace, self.inner.tracker.wait())
            .await
            .is_ok();
        if !drained {
            tracing::error!(
                request_id = %self.inner.request_id,
                remaining = self.inner.tracker.len(),
                "Work units did not unwind within teardown grace"
            );
        }

        TeardownReport {
            request_id: self.inner.request_id,
            units_at_return,
            interrupted: leftover,
            drained,
        }
    }
}

/// What teardown found when the handler returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TeardownReport {
    pub request_id: Uuid,
    /// Units associated with the request when the handler returned,
    /// including the handler.
    pub units_at_return: usize,
    /// Orphaned units that had to be interrupted.
    pub interrupted: usize,
    /// Whether the interrupted units unwound within the grace period.
    pub drained: bool,
}

impl TeardownReport {
    pub fn is_clean(&self) -> bool {
        self.interrupted == 0
    }
}

/// Creates one [`ExecutionContext`] per request and owns the shared pool.
pub struct Supervisor {
    shared: SharedPool,
    in_flight: AtomicUsize,
    grace: Duration,
}

impl Supervisor {
    pub fn new() -> Self {
        Self::with_grace(DEFAULT_TEARDOWN_GRACE)
    }

    pub fn with_grace(grace: Duration) -> Self {
        Self {
            shared: SharedPool::new(),
            in_flight: AtomicUsize::new(0),
            grace,
        }
    }

    pub fn shared_pool(&self) -> &SharedPool {
        &self.shared
    }

    /// Requests currently executing.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Relaxed)
    }

    /// Run `handler` inside a fresh isolated context and tear it down after.
    pub async fn run<F, Fut>(&self, handler: F) -> (Fut::Output, TeardownReport)
    where
        F: FnOnce(ExecutionContext) -> Fut,
        Fut: Future,
    {
        let ctx = ExecutionContext::new(self.shared.clone());
        let span = tracing::info_span!("request", request_id = %ctx.request_id());

        self.in_flight.fetch_add(1, Ordering::Relaxed);
        let guard = RunGuard {
            ctx: ctx.clone(),
            in_flight: &self.in_flight,
        };
        let output = handler(ctx.clone()).instrument(span.clone()).await;
        let report = ctx.teardown(self.grace).instrument(span).await;
        drop(guard);

        (output, report)
    }

    /// Shut down the shared pool. Call once, at process exit.
    pub async fn shutdown(&self) -> bool {
        self.shared.shutdown(self.grace).await
    }
}

/// Closes the request scope if `run` never reaches teardown, either because
/// the handler panicked or because the `run` future was dropped.
struct RunGuard<'a> {
    ctx: ExecutionContext,
    in_flight: &'a AtomicUsize,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        if !self.ctx.is_torn_down() {
            tracing::warn!(
                request_id = %self.ctx.request_id(),
                leftover = self.ctx.spawned_units(),
                "Request abandoned before teardown; interrupting its work"
            );
            self.ctx.close();
        }
        self.in_flight.fetch_sub(1, Ordering::Relaxed);
    }
}

impl Default for Supervisor {
    fn default() -> Self {
        Self::new()
    }
}
