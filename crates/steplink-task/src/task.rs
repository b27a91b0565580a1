use std::fmt;
use std::future::{Future, IntoFuture};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::sync::{oneshot, watch};

use crate::context::{AbortContext, ContextInner};
use crate::error::{AbortCause, AbortError};
use crate::lock;

pub(crate) type BoxFuture = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

/// Lifecycle of a [`Task`]. Only the first transition out of `Pending` counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettleState {
    Pending,
    Resolved,
    Rejected,
    Aborted,
}

impl SettleState {
    pub fn is_settled(self) -> bool {
        self != SettleState::Pending
    }
}

pub(crate) struct TaskInner<T, E> {
    id: u64,
    slot: Mutex<Option<oneshot::Sender<Result<T, E>>>>,
    state: watch::Sender<SettleState>,
    /// Present for cooperative tasks only.
    ctx: Option<AbortContext>,
    parent: Option<Weak<ContextInner>>,
}

impl<T, E> TaskInner<T, E>
where
    T: Send + 'static,
    E: AbortCause,
{
    fn new(ctx: Option<AbortContext>, parent: Option<&AbortContext>) -> (Arc<Self>, oneshot::Receiver<Result<T, E>>) {
        let (tx, rx) = oneshot::channel();
        let (state, _) = watch::channel(SettleState::Pending);
        let inner = Arc::new(Self {
            id: NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed),
            slot: Mutex::new(Some(tx)),
            state,
            ctx,
            parent: parent.map(AbortContext::downgrade),
        });
        (inner, rx)
    }

    fn state(&self) -> SettleState {
        *self.state.borrow()
    }

    /// First call wins; later outcomes are discarded.
    pub(crate) fn settle(&self, outcome: Result<T, E>) -> bool {
        let Some(tx) = lock(&self.slot).take() else {
            return false;
        };
        let state = match &outcome {
            Ok(_) => SettleState::Resolved,
            Err(err) if err.is_abort() => SettleState::Aborted,
            Err(_) => SettleState::Rejected,
        };
        // The wrapper may already be dropped; the state still transitions.
        let _ = tx.send(outcome);
        self.state.send_replace(state);
        if let Some(parent) = self.parent.as_ref().and_then(Weak::upgrade) {
            parent.deregister(self.id);
        }
        true
    }

    async fn settled(&self) {
        let mut rx = self.state.subscribe();
        let _ = rx.wait_for(|state| state.is_settled()).await;
    }

    /// Runs the synchronous part of an abort right away and returns the
    /// part that waits for graceful completion.
    fn begin_abort(self: &Arc<Self>, force: bool, reason: AbortError) -> BoxFuture {
        if self.state().is_settled() {
            return Box::pin(async {});
        }
        let Some(ctx) = &self.ctx else {
            // Nothing to cooperate with: only the wrapper can be rejected.
            self.settle(Err(E::from(reason)));
            return Box::pin(async {});
        };

        let children = ctx.trigger(reason.clone());
        let child_waits: Vec<BoxFuture> = children
            .into_iter()
            .map(|child| child.control.abort_boxed(force, AbortError::aborted()))
            .collect();

        if force {
            self.settle(Err(E::from(reason)));
            return Box::pin(async {});
        }

        let this = Arc::clone(self);
        Box::pin(async move {
            for wait in child_waits {
                wait.await;
            }
            this.settled().await;
        })
    }
}

/// Type-erased control surface a parent context keeps for each child.
pub(crate) trait Control: Send + Sync + 'static {
    fn id(&self) -> u64;
    fn settle_state(&self) -> SettleState;
    fn abort_boxed(self: Arc<Self>, force: bool, reason: AbortError) -> BoxFuture;
    fn settled_boxed(self: Arc<Self>) -> BoxFuture;
}

impl<T, E> Control for TaskInner<T, E>
where
    T: Send + 'static,
    E: AbortCause,
{
    fn id(&self) -> u64 {
        self.id
    }

    fn settle_state(&self) -> SettleState {
        self.state()
    }

    fn abort_boxed(self: Arc<Self>, force: bool, reason: AbortError) -> BoxFuture {
        self.begin_abort(force, reason)
    }

    fn settled_boxed(self: Arc<Self>) -> BoxFuture {
        Box::pin(async move { self.settled().await })
    }
}

/// Cloneable, output-less handle to a [`Task`].
#[derive(Clone)]
pub struct TaskHandle {
    pub(crate) control: Arc<dyn Control>,
}

impl TaskHandle {
    pub fn id(&self) -> u64 {
        self.control.id()
    }

    pub fn state(&self) -> SettleState {
        self.control.settle_state()
    }

    pub async fn abort(&self, force: bool) {
        self.abort_with(force, AbortError::aborted()).await;
    }

    pub async fn abort_with(&self, force: bool, reason: AbortError) {
        Arc::clone(&self.control).abort_boxed(force, reason).await;
    }

    /// Resolves once the task has settled, whatever the outcome.
    pub async fn settled(&self) {
        Arc::clone(&self.control).settled_boxed().await;
    }
}

impl fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskHandle")
            .field("id", &self.id())
            .field("state", &self.state())
            .finish()
    }
}

/// An abortable unit of asynchronous work.
///
/// The body runs on the tokio runtime as soon as the task is created;
/// awaiting the task yields its outcome. A task is either *detached*
/// (aborting only rejects the wrapper, the body keeps running to completion
/// with its result discarded) or *cooperative* (the body receives an
/// [`AbortContext`] and is expected to observe it).
pub struct Task<T, E = AbortError> {
    inner: Arc<TaskInner<T, E>>,
    rx: oneshot::Receiver<Result<T, E>>,
}

impl<T, E> Task<T, E>
where
    T: Send + 'static,
    E: AbortCause,
{
    /// Wrap a future that knows nothing about cancellation.
    pub fn detached<F>(fut: F) -> Self
    where
        F: Future<Output = Result<T, E>> + Send + 'static,
    {
        Self::spawn_detached(None, fut)
    }

    /// Run `body` with a fresh [`AbortContext`].
    pub fn cooperative<F, Fut>(body: F) -> Self
    where
        F: FnOnce(AbortContext) -> Fut,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        Self::spawn_cooperative(None, body)
    }

    /// A task that is already settled with `outcome`.
    pub fn ready(outcome: Result<T, E>) -> Self {
        let (inner, rx) = TaskInner::new(None, None);
        inner.settle(outcome);
        Self { inner, rx }
    }

    pub(crate) fn spawn_detached<F>(parent: Option<&AbortContext>, fut: F) -> Self
    where
        F: Future<Output = Result<T, E>> + Send + 'static,
    {
        let (inner, rx) = TaskInner::new(None, parent);
        let task = Self { inner, rx };
        if !task.register_with(parent) {
            return task;
        }
        let guard = SettleOnDrop(Arc::clone(&task.inner));
        tokio::spawn(async move {
            let outcome = fut.await;
            guard.0.settle(outcome);
        });
        task
    }

    pub(crate) fn spawn_cooperative<F, Fut>(parent: Option<&AbortContext>, body: F) -> Self
    where
        F: FnOnce(AbortContext) -> Fut,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        let ctx = AbortContext::new();
        let (inner, rx) = TaskInner::new(Some(ctx.clone()), parent);
        let task = Self { inner, rx };
        if !task.register_with(parent) {
            return task;
        }
        let fut = body(ctx);
        let guard = SettleOnDrop(Arc::clone(&task.inner));
        tokio::spawn(async move {
            let outcome = fut.await;
            guard.0.settle(outcome);
        });
        task
    }

    /// Register with the parent context. When the parent is already aborted
    /// the task settles as aborted instead and its body must not run.
    fn register_with(&self, parent: Option<&AbortContext>) -> bool {
        let Some(parent) = parent else {
            return true;
        };
        if parent.register(self.handle()) {
            true
        } else {
            self.inner.settle(Err(E::from(AbortError::aborted())));
            false
        }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn state(&self) -> SettleState {
        self.inner.state()
    }

    pub fn is_settled(&self) -> bool {
        self.state().is_settled()
    }

    pub fn handle(&self) -> TaskHandle {
        TaskHandle {
            control: Arc::clone(&self.inner) as Arc<dyn Control>,
        }
    }

    /// Abort with the default reason. See [`Task::abort_with`].
    pub async fn abort(&self, force: bool) {
        self.abort_with(force, AbortError::aborted()).await;
    }

    /// Abort the task. No-op once settled.
    ///
    /// Both modes mark the context aborted, run its abort hooks and abort
    /// every registered child with the same `force`. A forced abort then
    /// settles the wrapper with `reason` immediately. A graceful abort waits
    /// until every child has finished aborting and the body itself settled.
    pub async fn abort_with(&self, force: bool, reason: AbortError) {
        self.inner.begin_abort(force, reason).await;
    }

    /// Arm a one-shot deadline that aborts with [`AbortError::Timeout`].
    ///
    /// The timer is disarmed as soon as the task settles.
    pub fn timeout(self, after: Duration, force: bool) -> Self {
        if self.is_settled() {
            return self;
        }
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            tokio::select! {
                _ = inner.settled() => {}
                _ = tokio::time::sleep(after) => {
                    inner.begin_abort(force, AbortError::Timeout).await;
                }
            }
        });
        self
    }
}

impl<T, E> fmt::Debug for Task<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.inner.id)
            .field("state", &*self.inner.state.borrow())
            .finish()
    }
}

impl<T, E> IntoFuture for Task<T, E>
where
    T: Send + 'static,
    E: AbortCause,
{
    type Output = Result<T, E>;
    type IntoFuture = TaskFuture<T, E>;

    fn into_future(self) -> Self::IntoFuture {
        TaskFuture { rx: self.rx }
    }
}

/// Future returned by awaiting a [`Task`].
pub struct TaskFuture<T, E> {
    rx: oneshot::Receiver<Result<T, E>>,
}

impl<T, E> Future for TaskFuture<T, E>
where
    E: AbortCause,
{
    type Output = Result<T, E>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(outcome)) => Poll::Ready(outcome),
            Poll::Ready(Err(_)) => Poll::Ready(Err(E::from(AbortError::with_reason(
                "task dropped before settling",
            )))),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Settles the task as aborted if the body is dropped before finishing
/// (panic or runtime shutdown).
struct SettleOnDrop<T, E>(Arc<TaskInner<T, E>>)
where
    T: Send + 'static,
    E: AbortCause;

impl<T, E> Drop for SettleOnDrop<T, E>
where
    T: Send + 'static,
    E: AbortCause,
{
    fn drop(&mut self) {
        if self.0.settle(Err(E::from(AbortError::with_reason("task body dropped")))) {
            tracing::debug!(task = self.0.id, "task body dropped before settling");
        }
    }
}
