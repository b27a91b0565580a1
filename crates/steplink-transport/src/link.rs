use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use bytes::Bytes;
use steplink_task::{AbortContext, AbortError, Event, Task, TaskHandle};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf};
use tokio::sync::broadcast;
use tokio_util::codec::{BytesCodec, FramedRead};
use tracing::{debug, info, trace, warn};

use crate::error::{Result, TransportError};
use crate::subscription::Subscription;

/// Chunks buffered per subscriber before a slow subscriber starts lagging.
pub const DEFAULT_CHUNK_CAPACITY: usize = 1024;

type BoxWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Lifecycle notifications of a [`Link`].
///
/// `before_*` handlers run while the previous state is still intact, so a
/// `before_disconnect` handler can still talk to the device.
#[derive(Debug, Clone)]
pub struct LinkEvents {
    pub before_connect: Event,
    pub connected: Event,
    pub before_disconnect: Event,
    pub disconnected: Event,
}

impl Default for LinkEvents {
    fn default() -> Self {
        Self {
            before_connect: Event::new("before_connect"),
            connected: Event::new("connected"),
            before_disconnect: Event::new("before_disconnect"),
            disconnected: Event::new("disconnected"),
        }
    }
}

struct LinkInner {
    writer: tokio::sync::Mutex<Option<BoxWriter>>,
    reader: Mutex<Option<TaskHandle>>,
    connected: AtomicBool,
    label: Mutex<String>,
    chunks: broadcast::Sender<Bytes>,
    events: LinkEvents,
}

/// Shared handle to the byte stream of one device.
///
/// Inbound bytes are fanned out to every [`Link::chunks`] subscriber in
/// arrival order. Subscriptions outlive individual connections, so a
/// consumer started once keeps receiving across reconnects.
#[derive(Clone)]
pub struct Link {
    inner: Arc<LinkInner>,
}

impl Default for Link {
    fn default() -> Self {
        Self::new()
    }
}

impl Link {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHUNK_CAPACITY)
    }

    pub fn with_capacity(chunk_capacity: usize) -> Self {
        let (chunks, _) = broadcast::channel(chunk_capacity.max(1));
        Self {
            inner: Arc::new(LinkInner {
                writer: tokio::sync::Mutex::new(None),
                reader: Mutex::new(None),
                connected: AtomicBool::new(false),
                label: Mutex::new(String::new()),
                chunks,
                events: LinkEvents::default(),
            }),
        }
    }

    pub fn events(&self) -> &LinkEvents {
        &self.inner.events
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::Acquire)
    }

    /// Description of the current (or last) stream.
    pub fn label(&self) -> String {
        self.inner
            .label
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Attach `stream`, replacing any previous one.
    pub async fn connect<S>(&self, stream: S, label: impl Into<String>)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        self.disconnect().await;
        let label = label.into();
        self.inner.events.before_connect.dispatch().await;

        let (reader, writer) = tokio::io::split(stream);
        *self.inner.writer.lock().await = Some(Box::new(writer));
        let chunks = self.inner.chunks.clone();
        let link = label.clone();
        let task: Task<()> = Task::cooperative(move |ctx| read_loop(ctx, reader, chunks, link));
        *self
            .inner
            .reader
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(task.handle());
        *self
            .inner
            .label
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = label.clone();
        self.inner.connected.store(true, Ordering::Release);

        info!(link = %label, "link connected");
        self.inner.events.connected.dispatch().await;
    }

    /// Detach the current stream. No-op when not connected.
    pub async fn disconnect(&self) {
        if !self.is_connected() {
            return;
        }
        // Still writable here: handlers may shut the device down cleanly.
        self.inner.events.before_disconnect.dispatch().await;
        if !self.inner.connected.swap(false, Ordering::AcqRel) {
            return;
        }

        let reader = self
            .inner
            .reader
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(reader) = reader {
            reader.abort(false).await;
        }
        if let Some(mut writer) = self.inner.writer.lock().await.take() {
            if let Err(err) = writer.shutdown().await {
                debug!(error = %err, "link shutdown failed");
            }
        }

        info!(link = %self.label(), "link disconnected");
        self.inner.events.disconnected.dispatch().await;
    }

    /// Write all of `data` and flush.
    pub async fn write(&self, data: &[u8]) -> Result<()> {
        let mut guard = self.inner.writer.lock().await;
        let writer = guard.as_mut().ok_or(TransportError::NotConnected)?;
        writer.write_all(data).await?;
        writer.flush().await?;
        trace!(bytes = data.len(), "link write");
        Ok(())
    }

    /// Subscribe to inbound byte chunks from now on.
    pub fn chunks(&self) -> Subscription<Bytes> {
        Subscription::new("link", self.inner.chunks.subscribe())
    }
}

impl std::fmt::Debug for Link {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Link")
            .field("label", &self.label())
            .field("connected", &self.is_connected())
            .finish()
    }
}

async fn read_loop<S>(
    ctx: AbortContext,
    reader: ReadHalf<S>,
    chunks: broadcast::Sender<Bytes>,
    link: String,
) -> std::result::Result<(), AbortError>
where
    S: AsyncRead + Send + 'static,
{
    let mut incoming = ctx.iter(FramedRead::new(reader, BytesCodec::new()));
    loop {
        match incoming.next().await {
            Ok(Some(Ok(chunk))) => {
                trace!(link = %link, bytes = chunk.len(), "link read");
                // No subscribers is not an error.
                let _ = chunks.send(chunk.freeze());
            }
            Ok(Some(Err(err))) => {
                warn!(link = %link, error = %err, "link read failed");
                return Ok(());
            }
            Ok(None) => {
                info!(link = %link, "link closed by peer");
                return Ok(());
            }
            Err(reason) => {
                debug!(link = %link, %reason, "link reader stopped");
                return Ok(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::future::poll_fn;
    use std::pin::Pin;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use futures_core::Stream;
    use tokio::io::AsyncReadExt;

    use super::*;

    async fn next_chunk(sub: &mut Subscription<Bytes>) -> Option<Bytes> {
        tokio::time::timeout(
            Duration::from_secs(1),
            poll_fn(|cx| Pin::new(&mut *sub).poll_next(cx)),
        )
        .await
        .expect("chunk within deadline")
    }

    #[tokio::test]
    async fn test_chunks_and_write() {
        let (near, mut far) = tokio::io::duplex(256);
        let link = Link::new();
        let mut sub = link.chunks();
        link.connect(near, "duplex").await;
        assert!(link.is_connected());

        far.write_all(b"\x03\x11\x22\x00").await.unwrap();
        let chunk = next_chunk(&mut sub).await.unwrap();
        assert_eq!(chunk.as_ref(), b"\x03\x11\x22\x00");

        link.write(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        far.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
    }

    #[tokio::test]
    async fn test_write_requires_connection() {
        let link = Link::new();
        assert!(matches!(
            link.write(b"x").await,
            Err(TransportError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_lifecycle_order() {
        let link = Link::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for (event, name) in [
            (&link.events().before_connect, "before_connect"),
            (&link.events().connected, "connected"),
            (&link.events().before_disconnect, "before_disconnect"),
            (&link.events().disconnected, "disconnected"),
        ] {
            let order = Arc::clone(&order);
            let probe = link.clone();
            event.register(move || {
                let order = Arc::clone(&order);
                let connected = probe.is_connected();
                async move {
                    order.lock().unwrap().push((name, connected));
                }
            });
        }

        let (near, _far) = tokio::io::duplex(64);
        link.connect(near, "duplex").await;
        link.disconnect().await;
        link.disconnect().await;

        assert_eq!(
            *order.lock().unwrap(),
            vec![
                ("before_connect", false),
                ("connected", true),
                ("before_disconnect", true),
                ("disconnected", false),
            ]
        );
        assert!(matches!(
            link.write(b"x").await,
            Err(TransportError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_before_disconnect_can_still_write() {
        let link = Link::new();
        let (near, mut far) = tokio::io::duplex(64);
        let writer = link.clone();
        link.events().before_disconnect.register(move || {
            let writer = writer.clone();
            async move {
                writer.write(b"bye").await.unwrap();
            }
        });
        link.connect(near, "duplex").await;
        link.disconnect().await;

        let mut buf = Vec::new();
        far.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"bye");
    }

    #[tokio::test]
    async fn test_subscription_survives_reconnect() {
        let link = Link::new();
        let mut sub = link.chunks();
        let (first, mut first_far) = tokio::io::duplex(64);
        link.connect(first, "first").await;
        first_far.write_all(b"a").await.unwrap();
        assert_eq!(next_chunk(&mut sub).await.unwrap().as_ref(), b"a");

        let (second, mut second_far) = tokio::io::duplex(64);
        link.connect(second, "second").await;
        assert_eq!(link.label(), "second");
        second_far.write_all(b"b").await.unwrap();
        assert_eq!(next_chunk(&mut sub).await.unwrap().as_ref(), b"b");
    }

    #[tokio::test]
    async fn test_reconnect_fires_disconnect_of_previous() {
        let link = Link::new();
        let disconnects = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&disconnects);
        link.events().disconnected.register(move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });
        let (a, _a_far) = tokio::io::duplex(64);
        let (b, _b_far) = tokio::io::duplex(64);
        link.connect(a, "a").await;
        link.connect(b, "b").await;
        assert_eq!(disconnects.load(Ordering::SeqCst), 1);
    }
}
