use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, Weak};

use tokio::task::JoinSet;

use crate::lock;
use crate::task::BoxFuture;

type Handler = Arc<dyn Fn() -> BoxFuture + Send + Sync>;

struct Entry {
    id: u64,
    once: bool,
    handler: Handler,
}

#[derive(Default)]
struct Registry {
    next_id: u64,
    entries: Vec<Entry>,
}

/// Async lifecycle hook registry.
///
/// Handlers run concurrently on [`Event::dispatch`], which resolves once
/// every handler has finished.
#[derive(Clone, Default)]
pub struct Event {
    name: &'static str,
    registry: Arc<Mutex<Registry>>,
}

impl Event {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            registry: Arc::default(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Add a handler that runs on every dispatch.
    pub fn register<F, Fut>(&self, handler: F) -> HookHandle
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.insert(false, handler)
    }

    /// Add a handler that removes itself when first dispatched.
    pub fn register_once<F, Fut>(&self, handler: F) -> HookHandle
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.insert(true, handler)
    }

    fn insert<F, Fut>(&self, once: bool, handler: F) -> HookHandle
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handler: Handler = Arc::new(move || Box::pin(handler()) as BoxFuture);
        let mut registry = lock(&self.registry);
        registry.next_id += 1;
        let id = registry.next_id;
        registry.entries.push(Entry { id, once, handler });
        HookHandle {
            id,
            registry: Arc::downgrade(&self.registry),
        }
    }

    pub fn len(&self) -> usize {
        lock(&self.registry).entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run every registered handler and wait for all of them.
    ///
    /// A panicking handler is logged and does not affect the others.
    pub async fn dispatch(&self) {
        let handlers: Vec<Handler> = {
            let mut registry = lock(&self.registry);
            let handlers = registry
                .entries
                .iter()
                .map(|entry| Arc::clone(&entry.handler))
                .collect();
            registry.entries.retain(|entry| !entry.once);
            handlers
        };
        if handlers.is_empty() {
            return;
        }
        tracing::trace!(event = self.name, handlers = handlers.len(), "dispatch");

        let mut set = JoinSet::new();
        for handler in handlers {
            set.spawn(handler());
        }
        while let Some(joined) = set.join_next().await {
            if let Err(err) = joined {
                tracing::warn!(event = self.name, error = %err, "event handler failed");
            }
        }
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("name", &self.name)
            .field("handlers", &self.len())
            .finish()
    }
}

/// Removes its handler from the event when [`HookHandle::unregister`] is
/// called. Dropping the handle keeps the handler registered.
#[derive(Debug)]
pub struct HookHandle {
    id: u64,
    registry: Weak<Mutex<Registry>>,
}

impl HookHandle {
    /// Returns `false` if the handler was already gone.
    pub fn unregister(self) -> bool {
        let Some(registry) = self.registry.upgrade() else {
            return false;
        };
        let mut registry = lock(&registry);
        let before = registry.entries.len();
        registry.entries.retain(|entry| entry.id != self.id);
        registry.entries.len() != before
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;

    fn counter_hook(count: &Arc<AtomicUsize>, add: usize) -> impl Fn() -> BoxFuture + Send + Sync + 'static {
        let count = Arc::clone(count);
        move || {
            let count = Arc::clone(&count);
            Box::pin(async move {
                count.fetch_add(add, Ordering::SeqCst);
            })
        }
    }

    #[tokio::test]
    async fn test_dispatch_runs_every_handler() {
        let event = Event::new("connected");
        let count = Arc::new(AtomicUsize::new(0));
        event.register(counter_hook(&count, 1));
        event.register(counter_hook(&count, 10));

        event.dispatch().await;
        event.dispatch().await;
        assert_eq!(count.load(Ordering::SeqCst), 22);
    }

    #[tokio::test]
    async fn test_once_handler_removes_itself() {
        let event = Event::new("enable");
        let count = Arc::new(AtomicUsize::new(0));
        event.register_once(counter_hook(&count, 1));
        assert_eq!(event.len(), 1);

        event.dispatch().await;
        event.dispatch().await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(event.is_empty());
    }

    #[tokio::test]
    async fn test_unregister() {
        let event = Event::new("disable");
        let count = Arc::new(AtomicUsize::new(0));
        let handle = event.register(counter_hook(&count, 1));
        assert!(handle.unregister());
        event.dispatch().await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_dispatch_waits_for_slow_handlers() {
        let event = Event::new("before_disconnect");
        let count = Arc::new(AtomicUsize::new(0));
        let slow = Arc::clone(&count);
        event.register(move || {
            let slow = Arc::clone(&slow);
            async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                slow.fetch_add(1, Ordering::SeqCst);
            }
        });
        event.dispatch().await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_panicking_handler_is_isolated() {
        let event = Event::new("faulty");
        let count = Arc::new(AtomicUsize::new(0));
        event.register(|| async {
            panic!("handler failure");
        });
        event.register(counter_hook(&count, 1));
        event.dispatch().await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
