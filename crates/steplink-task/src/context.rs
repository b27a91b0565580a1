use std::collections::HashMap;
use std::fmt;
use std::future::{poll_fn, Future};
use std::pin::Pin;
use std::sync::{Arc, Mutex, Weak};

use futures_core::Stream;
use tokio_util::sync::CancellationToken;

use crate::error::{AbortCause, AbortError};
use crate::lock;
use crate::task::{Task, TaskHandle};

type Hook = Box<dyn FnOnce() + Send>;

pub(crate) struct ContextInner {
    token: CancellationToken,
    reason: Mutex<Option<AbortError>>,
    hooks: Mutex<Vec<Hook>>,
    children: Mutex<HashMap<u64, TaskHandle>>,
}

impl ContextInner {
    pub(crate) fn deregister(&self, id: u64) {
        lock(&self.children).remove(&id);
    }
}

/// Cooperative cancellation signal handed to the body of a cooperative
/// [`Task`].
///
/// Besides observing the signal, a context spawns child tasks that are
/// aborted together with their parent.
#[derive(Clone)]
pub struct AbortContext {
    inner: Arc<ContextInner>,
}

impl AbortContext {
    pub(crate) fn new() -> Self {
        Self {
            inner: Arc::new(ContextInner {
                token: CancellationToken::new(),
                reason: Mutex::new(None),
                hooks: Mutex::new(Vec::new()),
                children: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub(crate) fn downgrade(&self) -> Weak<ContextInner> {
        Arc::downgrade(&self.inner)
    }

    pub fn is_aborted(&self) -> bool {
        self.inner.token.is_cancelled()
    }

    /// The abort reason, once aborted.
    pub fn reason(&self) -> Option<AbortError> {
        lock(&self.inner.reason).clone()
    }

    /// Resolves with the abort reason once the context is aborted.
    pub async fn cancelled(&self) -> AbortError {
        self.inner.token.cancelled().await;
        self.reason().unwrap_or_else(AbortError::aborted)
    }

    /// Register a hook run once on abort. A hook registered after the abort
    /// runs immediately.
    pub fn on_abort(&self, hook: impl FnOnce() + Send + 'static) -> &Self {
        {
            let mut hooks = lock(&self.inner.hooks);
            if !self.is_aborted() {
                hooks.push(Box::new(hook));
                return self;
            }
        }
        hook();
        self
    }

    /// Race `fut` against this context.
    pub async fn race<F: Future>(&self, fut: F) -> Result<F::Output, AbortError> {
        tokio::select! {
            biased;
            reason = self.cancelled() => Err(reason),
            output = fut => Ok(output),
        }
    }

    /// Spawn a detached child task. If this context is already aborted the
    /// child is created settled as aborted and `fut` never runs.
    pub fn detached<T, E, F>(&self, fut: F) -> Task<T, E>
    where
        T: Send + 'static,
        E: AbortCause,
        F: Future<Output = Result<T, E>> + Send + 'static,
    {
        Task::spawn_detached(Some(self), fut)
    }

    /// Spawn a cooperative child task with its own context.
    pub fn cooperative<T, E, F, Fut>(&self, body: F) -> Task<T, E>
    where
        T: Send + 'static,
        E: AbortCause,
        F: FnOnce(AbortContext) -> Fut,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        Task::spawn_cooperative(Some(self), body)
    }

    /// Wrap a stream so that every `next()` also races this context.
    pub fn iter<S: Stream + Unpin>(&self, stream: S) -> AbortableStream<S> {
        AbortableStream {
            stream,
            ctx: self.clone(),
        }
    }

    /// Number of live children.
    pub fn children(&self) -> usize {
        lock(&self.inner.children).len()
    }

    /// Track a child. Refused once aborted.
    pub(crate) fn register(&self, child: TaskHandle) -> bool {
        let mut children = lock(&self.inner.children);
        if self.is_aborted() {
            return false;
        }
        children.insert(child.id(), child);
        true
    }

    /// Mark aborted, run the hooks and hand back the children to abort.
    pub(crate) fn trigger(&self, reason: AbortError) -> Vec<TaskHandle> {
        {
            let mut stored = lock(&self.inner.reason);
            if stored.is_none() {
                *stored = Some(reason);
            }
        }
        self.inner.token.cancel();

        let hooks = std::mem::take(&mut *lock(&self.inner.hooks));
        for hook in hooks {
            hook();
        }
        lock(&self.inner.children).drain().map(|(_, child)| child).collect()
    }
}

impl fmt::Debug for AbortContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AbortContext")
            .field("aborted", &self.is_aborted())
            .field("children", &self.children())
            .finish()
    }
}

/// A stream whose items are raced against an [`AbortContext`].
#[derive(Debug)]
pub struct AbortableStream<S> {
    stream: S,
    ctx: AbortContext,
}

impl<S: Stream + Unpin> AbortableStream<S> {
    /// Next item, `Ok(None)` at end of stream, or the abort reason.
    pub async fn next(&mut self) -> Result<Option<S::Item>, AbortError> {
        let Self { stream, ctx } = self;
        ctx.race(poll_fn(|cx| Pin::new(&mut *stream).poll_next(cx)))
            .await
    }

    pub fn into_inner(self) -> S {
        self.stream
    }
}
