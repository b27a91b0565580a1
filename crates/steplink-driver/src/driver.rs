use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use bytes::Bytes;
use steplink_frame::{fields, frames, Hex, Method, Packet, Property};
use steplink_task::{AbortContext, AbortError, Event, HookHandle, Task, TaskHandle};
use steplink_transport::{Link, Subscription};
use tokio::sync::{broadcast, oneshot};
use tracing::{debug, info, warn};

use crate::error::{DriverError, Result};
use crate::lock;
use crate::pool::{SequencePool, FIRST_SEQUENCE, LAST_SEQUENCE};
use crate::sync::SyncMessage;

/// Configuration for a [`Driver`].
#[derive(Debug, Clone)]
pub struct DriverConfig {
    /// Deadline for the SYS_ENA exchange of enable/disable.
    pub enable_timeout: Duration,
    /// Deadline for simple queries such as firmware info.
    pub request_timeout: Duration,
    /// Packets buffered per broadcast subscriber before it lags.
    pub broadcast_capacity: usize,
    /// Correlation sequences available to requests. 0 is always excluded.
    pub first_sequence: u16,
    pub last_sequence: u16,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            enable_timeout: Duration::from_millis(1000),
            request_timeout: Duration::from_millis(1000),
            broadcast_capacity: 256,
            first_sequence: FIRST_SEQUENCE,
            last_sequence: LAST_SEQUENCE,
        }
    }
}

/// Lifecycle notifications of a [`Driver`].
#[derive(Debug, Clone)]
pub struct DriverEvents {
    pub before_enable: Event,
    pub enabled: Event,
    pub before_disable: Event,
    pub disabled: Event,
}

impl Default for DriverEvents {
    fn default() -> Self {
        Self {
            before_enable: Event::new("before_enable"),
            enabled: Event::new("enabled"),
            before_disable: Event::new("before_disable"),
            disabled: Event::new("disabled"),
        }
    }
}

/// A pending request. Equality is identity, so the pool can tell a stale
/// owner from the current one.
#[derive(Debug)]
struct Waiter {
    id: u64,
    tx: Mutex<Option<oneshot::Sender<Result<Packet>>>>,
}

impl PartialEq for Waiter {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Waiter {
    fn new(id: u64) -> (Arc<Self>, oneshot::Receiver<Result<Packet>>) {
        let (tx, rx) = oneshot::channel();
        let waiter = Arc::new(Self {
            id,
            tx: Mutex::new(Some(tx)),
        });
        (waiter, rx)
    }

    /// First completion wins.
    fn complete(&self, outcome: Result<Packet>) {
        if let Some(tx) = lock(&self.tx).take() {
            let _ = tx.send(outcome);
        }
    }
}

/// Releases the sequence on every exit path of a request.
struct SequenceLease<'a> {
    pool: &'a Mutex<SequencePool<u16, Arc<Waiter>>>,
    sequence: u16,
    waiter: &'a Arc<Waiter>,
}

impl Drop for SequenceLease<'_> {
    fn drop(&mut self) {
        if !lock(self.pool).release(self.sequence, self.waiter) {
            debug!(sequence = self.sequence, "sequence already released");
        }
    }
}

struct DriverInner {
    link: Link,
    config: DriverConfig,
    pool: Mutex<SequencePool<u16, Arc<Waiter>>>,
    next_waiter: AtomicU64,
    packets: broadcast::Sender<Packet>,
    sync: broadcast::Sender<SyncMessage>,
    enabled: AtomicBool,
    events: DriverEvents,
    receiver: Mutex<Option<TaskHandle>>,
}

/// Protocol driver for one controller.
///
/// Demultiplexes inbound packets into broadcasts (sequence 0) and responses
/// to pending requests, and multiplexes outbound requests over up to 255
/// concurrent correlation sequences.
#[derive(Clone)]
pub struct Driver {
    inner: Arc<DriverInner>,
}

impl Driver {
    /// Create a driver over `link` and start its receive loop.
    ///
    /// Must be called within a tokio runtime.
    pub fn new(link: Link, config: DriverConfig) -> Self {
        let first = config.first_sequence.max(FIRST_SEQUENCE);
        let (packets, _) = broadcast::channel(config.broadcast_capacity.max(1));
        let (sync, _) = broadcast::channel(config.broadcast_capacity.max(1));
        let inner = Arc::new(DriverInner {
            pool: Mutex::new(SequencePool::new(first..=config.last_sequence)),
            link,
            config,
            next_waiter: AtomicU64::new(1),
            packets,
            sync,
            enabled: AtomicBool::new(false),
            events: DriverEvents::default(),
            receiver: Mutex::new(None),
        });

        let chunks = inner.link.chunks();
        let weak = Arc::downgrade(&inner);
        let task: Task<()> = Task::cooperative(move |ctx| receive_loop(ctx, weak, chunks));
        *lock(&inner.receiver) = Some(task.handle());
        Self { inner }
    }

    pub fn link(&self) -> &Link {
        &self.inner.link
    }

    pub fn config(&self) -> &DriverConfig {
        &self.inner.config
    }

    pub fn events(&self) -> &DriverEvents {
        &self.inner.events
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::Acquire)
    }

    pub fn downgrade(&self) -> WeakDriver {
        WeakDriver {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Free correlation sequences.
    pub fn available_sequences(&self) -> usize {
        lock(&self.inner.pool).available()
    }

    /// Requests waiting for a response.
    pub fn pending_requests(&self) -> usize {
        lock(&self.inner.pool).pending()
    }

    /// Broadcast packets from now on, in arrival order.
    pub fn subscribe(&self) -> Subscription<Packet> {
        Subscription::new("packets", self.inner.packets.subscribe())
    }

    /// Parsed `SYN:NA` status messages from now on.
    pub fn subscribe_sync(&self) -> Subscription<SyncMessage> {
        Subscription::new("sync", self.inner.sync.subscribe())
    }

    /// Write an uncorrelated packet (sequence 0).
    pub async fn send(&self, packet: &Packet) -> Result<()> {
        let frame = packet.to_frame()?;
        debug!(%packet, "tx");
        self.inner.link.write(&frame).await?;
        Ok(())
    }

    /// Send `packet` under a fresh correlation sequence and wait for the
    /// matching response.
    ///
    /// ACK resolves with the response packet, REJ fails with
    /// [`DriverError::Rejected`]. The sequence is returned to the pool on
    /// every outcome, including timeout and abort.
    pub fn request(&self, packet: Packet, timeout: Option<Duration>) -> Task<Packet, DriverError> {
        let inner = Arc::clone(&self.inner);
        let task = Task::cooperative(move |ctx| async move { inner.exchange(ctx, packet).await });
        match timeout {
            Some(after) => task.timeout(after, false),
            None => task,
        }
    }

    /// Wait for a broadcast packet matching `method`, `property` and
    /// `predicate(payload)`. Only packets arriving after this call count.
    pub fn wait<P>(&self, method: Method, property: Property, predicate: P) -> Task<Packet, DriverError>
    where
        P: Fn(&[u8]) -> bool + Send + 'static,
    {
        let packets = self.subscribe();
        Task::cooperative(move |ctx| async move {
            let mut packets = ctx.iter(packets);
            loop {
                match packets.next().await? {
                    Some(packet)
                        if packet.method() == method
                            && packet.property() == property
                            && predicate(packet.payload()) =>
                    {
                        return Ok(packet)
                    }
                    Some(_) => continue,
                    None => return Err(DriverError::Disconnected),
                }
            }
        })
    }

    pub async fn enable(&self) -> Result<()> {
        self.set_enabled(true).await
    }

    pub async fn disable(&self) -> Result<()> {
        self.set_enabled(false).await
    }

    async fn set_enabled(&self, enable: bool) -> Result<()> {
        let events = &self.inner.events;
        let (before, after) = if enable {
            (&events.before_enable, &events.enabled)
        } else {
            (&events.before_disable, &events.disabled)
        };
        before.dispatch().await;

        let request = Packet::encode(Method::Set, Property::SysEna, &[&fields::bool(enable)]);
        let ack = self
            .request(request, Some(self.inner.config.enable_timeout))
            .await?;
        let expected = u8::from(enable);
        if ack.payload().first() != Some(&expected) {
            return Err(DriverError::UnexpectedResponse {
                expected: format!("SYS_ENA {expected:02X}"),
                got: Hex::from(ack.payload()).to_string(),
            });
        }

        self.inner.enabled.store(enable, Ordering::Release);
        info!(enabled = enable, "driver state changed");
        after.dispatch().await;
        Ok(())
    }

    /// Query the firmware identity string.
    pub async fn firmware_info(&self) -> Result<String> {
        let request = Packet::encode(Method::Get, Property::FwInfo, &[]);
        let ack = self
            .request(request, Some(self.inner.config.request_timeout))
            .await?;
        Ok(ack.text().trim_end_matches('\0').to_string())
    }

    /// Follow the link lifecycle: enable once connected, disable before the
    /// link goes away. Failures are logged.
    pub fn attach(&self) -> [HookHandle; 2] {
        let events = self.inner.link.events();
        let weak = self.downgrade();
        let on_connect = events.connected.register(move || {
            let driver = weak.upgrade();
            async move {
                if let Some(driver) = driver {
                    if let Err(err) = driver.enable().await {
                        warn!(error = %err, "auto-enable failed");
                    }
                }
            }
        });
        let weak = self.downgrade();
        let on_disconnect = events.before_disconnect.register(move || {
            let driver = weak.upgrade();
            async move {
                if let Some(driver) = driver {
                    if let Err(err) = driver.disable().await {
                        warn!(error = %err, "auto-disable failed");
                    }
                }
            }
        });
        [on_connect, on_disconnect]
    }

    /// Stop the receive loop. Pending requests run into their timeouts.
    pub async fn shutdown(&self) {
        let receiver = lock(&self.inner.receiver).take();
        if let Some(receiver) = receiver {
            receiver.abort(false).await;
        }
    }
}

impl fmt::Debug for Driver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Driver")
            .field("link", &self.inner.link)
            .field("enabled", &self.is_enabled())
            .field("pending", &self.pending_requests())
            .finish()
    }
}

/// Non-owning [`Driver`] reference for hooks.
#[derive(Debug, Clone)]
pub struct WeakDriver {
    inner: Weak<DriverInner>,
}

impl WeakDriver {
    pub fn upgrade(&self) -> Option<Driver> {
        self.inner.upgrade().map(|inner| Driver { inner })
    }
}

impl fmt::Debug for DriverInner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DriverInner").finish_non_exhaustive()
    }
}

impl DriverInner {
    async fn exchange(&self, ctx: AbortContext, packet: Packet) -> Result<Packet> {
        let (waiter, rx) = Waiter::new(self.next_waiter.fetch_add(1, Ordering::Relaxed));
        let sequence = lock(&self.pool).assign(Arc::clone(&waiter))?;
        let _lease = SequenceLease {
            pool: &self.pool,
            sequence,
            waiter: &waiter,
        };

        let packet = packet.with_sequence(sequence);
        let frame = packet.to_frame()?;
        debug!(%packet, "tx");
        self.link.write(&frame).await?;

        match ctx.race(rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(DriverError::Disconnected),
            Err(reason) => Err(reason.into()),
        }
    }

    fn dispatch(&self, packet: Packet) {
        debug!(%packet, "rx");
        if packet.is_broadcast() {
            match packet.method() {
                Method::Log => info!(target: "device", "{}", packet.text().trim_end()),
                Method::Syn if packet.property() == Property::Na => {
                    match SyncMessage::parse(&packet.text()) {
                        // No subscribers is not an error.
                        Ok(message) => {
                            let _ = self.sync.send(message);
                        }
                        Err(err) => warn!(error = %err, "dropping sync message"),
                    }
                }
                _ => {}
            }
            let _ = self.packets.send(packet);
            return;
        }

        let sequence = packet.sequence();
        let waiter = match lock(&self.pool).resolve(sequence) {
            Ok(waiter) => Arc::clone(waiter),
            Err(err) => {
                warn!(%packet, "{err}");
                return;
            }
        };
        let outcome = match packet.method() {
            Method::Ack => Ok(packet),
            Method::Rej => Err(DriverError::Rejected(packet.text().into_owned())),
            other => {
                warn!(method = other.name(), sequence, "unexpected response method");
                Ok(packet)
            }
        };
        waiter.complete(outcome);
    }
}

async fn receive_loop(
    ctx: AbortContext,
    inner: Weak<DriverInner>,
    chunks: Subscription<Bytes>,
) -> std::result::Result<(), AbortError> {
    let mut incoming = ctx.iter(frames(chunks));
    while let Some(frame) = incoming.next().await? {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        match Packet::from_frame(&frame) {
            Ok(packet) => inner.dispatch(packet),
            Err(err) => warn!(error = %err, "dropping frame"),
        }
    }
    debug!("receive loop finished");
    Ok(())
}
