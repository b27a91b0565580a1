//! Software stand-in for the controller firmware.
//!
//! Speaks the same packet protocol over any byte stream: system and motor
//! enable, motor configuration, firmware identity and queued moves whose
//! ACK is held back until the move has finished "executing".

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use steplink_frame::{fields, Dechunker, FieldReader, Method, Packet, Property};
use steplink_transport::TransportError;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, Notify};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::lock;

pub const DEFAULT_IDENTITY: &str = concat!("steplink-emulator v", env!("CARGO_PKG_VERSION"));

const BAD_PAYLOAD: &str = "Invalid payload";
const NO_SUCH_MOTOR: &str = "No such motor";
const MOTOR_DISABLED: &str = "Motor Disabled";
const MOTOR_QUEUE_FULL: &str = "Motor Queue Full";

#[derive(Debug, Clone)]
pub struct EmulatorConfig {
    /// Text returned for GET FW_INFO.
    pub identity: String,
    /// Number of motors, addressed 0..motors.
    pub motors: u8,
    /// Pending moves accepted per motor before REJ "Motor Queue Full".
    pub queue_capacity: usize,
}

impl Default for EmulatorConfig {
    fn default() -> Self {
        Self {
            identity: DEFAULT_IDENTITY.to_string(),
            motors: 3,
            queue_capacity: 255,
        }
    }
}

/// Driver chip settings as carried by MOT_CFG.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DriverSettings {
    pub micro_steps: u8,
    pub stall_sensitivity: u8,
    pub rms_current: u16,
}

impl Default for DriverSettings {
    fn default() -> Self {
        Self {
            micro_steps: 32,
            stall_sensitivity: 40,
            rms_current: 1000,
        }
    }
}

#[derive(Debug)]
struct Move {
    id: u64,
    sequence: u16,
    steps: i32,
    interval: u32,
}

impl Move {
    fn duration(&self) -> Duration {
        Duration::from_micros(u64::from(self.steps.unsigned_abs()) * u64::from(self.interval))
    }
}

#[derive(Debug, Default)]
struct AxisState {
    enabled: bool,
    settings: DriverSettings,
    queue: VecDeque<Move>,
    /// Bumped on disable; a move started under an older generation is void.
    generation: u64,
    next_move: u64,
}

#[derive(Debug, Default)]
struct Axis {
    state: Mutex<AxisState>,
    wake: Notify,
}

struct Device {
    config: EmulatorConfig,
    system_enabled: Mutex<bool>,
    axes: Vec<Axis>,
    out: mpsc::UnboundedSender<Packet>,
}

/// Emulated controller. Each call to [`Emulator::serve`] is an independent
/// power cycle.
#[derive(Debug, Clone, Default)]
pub struct Emulator {
    config: EmulatorConfig,
}

impl Emulator {
    pub fn new(config: EmulatorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &EmulatorConfig {
        &self.config
    }

    /// Serve one host until it closes the stream.
    ///
    /// Like the firmware, losing the host disables the system and rejects
    /// every queued move.
    pub async fn serve<S>(&self, stream: S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (mut reader, mut writer) = tokio::io::split(stream);
        let (out, mut outgoing) = mpsc::unbounded_channel::<Packet>();
        let device = Arc::new(Device {
            axes: (0..self.config.motors).map(|_| Axis::default()).collect(),
            config: self.config.clone(),
            system_enabled: Mutex::new(false),
            out,
        });

        let writer_task = tokio::spawn(async move {
            while let Some(packet) = outgoing.recv().await {
                let frame = match packet.to_frame() {
                    Ok(frame) => frame,
                    Err(err) => {
                        warn!(error = %err, "emulator cannot frame reply");
                        continue;
                    }
                };
                if let Err(err) = writer.write_all(&frame).await {
                    debug!(error = %err, "emulator writer stopped");
                    break;
                }
            }
        });
        let workers: Vec<_> = (0..device.axes.len())
            .map(|index| tokio::spawn(run_axis(Arc::clone(&device), index)))
            .collect();

        info!(motors = self.config.motors, "emulator serving host");
        device.emit(0, Method::Log, Property::Na, b"Host connected");

        let mut dechunker = Dechunker::new();
        let mut buf = vec![0u8; 1024];
        let outcome = loop {
            let n = match reader.read(&mut buf).await {
                Ok(0) => break Ok(()),
                Ok(n) => n,
                Err(err) => break Err(TransportError::from(err).into()),
            };
            dechunker.push(&buf[..n]);
            while let Some(frame) = dechunker.next_frame() {
                match Packet::from_frame(&frame) {
                    Ok(packet) => device.handle(&packet),
                    Err(err) => warn!(error = %err, "emulator dropping frame"),
                }
            }
        };

        info!("host disconnected");
        device.set_system(false);
        for worker in &workers {
            worker.abort();
        }
        drop(workers);
        drop(device);
        let _ = writer_task.await;
        outcome
    }
}

impl Device {
    fn emit(&self, sequence: u16, method: Method, property: Property, payload: &[u8]) {
        let packet = Packet::build(sequence, method, property, &[payload]);
        debug!(%packet, "emulator tx");
        // The writer only goes away once the host is gone.
        let _ = self.out.send(packet);
    }

    fn handle(&self, packet: &Packet) {
        debug!(%packet, "emulator rx");
        let seq = packet.sequence();
        let property = packet.property();
        let payload = packet.payload();
        let outcome = match (packet.method(), property) {
            (Method::Get, Property::FwInfo) => {
                self.emit(seq, Method::Ack, property, self.config.identity.as_bytes());
                Ok(())
            }
            (Method::Get, Property::SysEna) => {
                self.emit(seq, Method::Ack, property, &fields::bool(self.system()));
                Ok(())
            }
            (Method::Set, Property::SysEna) => exact::<1>(payload).map(|[enable]| {
                self.set_system(enable != 0);
                self.emit(seq, Method::Ack, property, &fields::bool(self.system()));
            }),
            (Method::Get, Property::MotEna) => exact::<1>(payload).and_then(|[id]| {
                let axis = self.axis(id)?;
                let enabled = lock(&axis.state).enabled;
                self.emit(seq, Method::Ack, property, &[id, u8::from(enabled)]);
                Ok(())
            }),
            (Method::Set, Property::MotEna) => exact::<2>(payload).and_then(|[id, enable]| {
                let axis = self.axis(id)?;
                if enable != 0 {
                    lock(&axis.state).enabled = true;
                } else {
                    self.disable_axis(axis);
                }
                let enabled = lock(&axis.state).enabled;
                self.emit(seq, Method::Ack, property, &[id, u8::from(enabled)]);
                Ok(())
            }),
            (Method::Get, Property::MotCfg) => exact::<1>(payload).and_then(|[id]| {
                let axis = self.axis(id)?;
                let settings = lock(&axis.state).settings;
                self.emit_config(seq, id, settings);
                Ok(())
            }),
            (Method::Set, Property::MotCfg) => exact::<5>(payload).and_then(|raw| {
                let id = raw[0];
                let axis = self.axis(id)?;
                let mut reader = FieldReader::new(&raw[1..]);
                let settings = DriverSettings {
                    micro_steps: reader.u8().map_err(|_| BAD_PAYLOAD)?,
                    stall_sensitivity: reader.u8().map_err(|_| BAD_PAYLOAD)?,
                    rms_current: reader.u16().map_err(|_| BAD_PAYLOAD)?,
                };
                lock(&axis.state).settings = settings;
                self.emit_config(seq, id, settings);
                Ok(())
            }),
            (Method::Set, Property::MotMov) => exact::<9>(payload).and_then(|raw| {
                let id = raw[0];
                let axis = self.axis(id)?;
                let mut reader = FieldReader::new(&raw[1..]);
                let steps = reader.i32().map_err(|_| BAD_PAYLOAD)?;
                let interval = reader.u32().map_err(|_| BAD_PAYLOAD)?;
                self.queue_move(axis, seq, steps, interval)
            }),
            (method, property) => {
                let text = format!(
                    "Unsupported command: {}::{}",
                    method.name(),
                    property.name()
                );
                self.emit(seq, Method::Rej, Property::Na, text.as_bytes());
                Ok(())
            }
        };
        if let Err(reason) = outcome {
            self.emit(seq, Method::Rej, property, reason.as_bytes());
        }
    }

    fn emit_config(&self, seq: u16, id: u8, settings: DriverSettings) {
        self.emit(
            seq,
            Method::Ack,
            Property::MotCfg,
            &[
                id,
                settings.micro_steps,
                settings.stall_sensitivity,
                settings.rms_current.to_le_bytes()[0],
                settings.rms_current.to_le_bytes()[1],
            ],
        );
    }

    fn axis(&self, id: u8) -> std::result::Result<&Axis, &'static str> {
        self.axes.get(usize::from(id)).ok_or(NO_SUCH_MOTOR)
    }

    fn system(&self) -> bool {
        *lock(&self.system_enabled)
    }

    fn set_system(&self, enable: bool) {
        if !enable {
            for axis in &self.axes {
                self.disable_axis(axis);
            }
        }
        *lock(&self.system_enabled) = enable;
    }

    fn disable_axis(&self, axis: &Axis) {
        let rejected: Vec<Move> = {
            let mut state = lock(&axis.state);
            state.enabled = false;
            state.generation += 1;
            state.queue.drain(..).collect()
        };
        for pending in &rejected {
            self.emit(
                pending.sequence,
                Method::Rej,
                Property::MotMov,
                MOTOR_DISABLED.as_bytes(),
            );
        }
        axis.wake.notify_one();
    }

    fn queue_move(
        &self,
        axis: &Axis,
        sequence: u16,
        steps: i32,
        interval: u32,
    ) -> std::result::Result<(), &'static str> {
        let mut state = lock(&axis.state);
        if !state.enabled {
            return Err(MOTOR_DISABLED);
        }
        if state.queue.len() >= self.config.queue_capacity {
            return Err(MOTOR_QUEUE_FULL);
        }
        state.next_move += 1;
        let id = state.next_move;
        state.queue.push_back(Move {
            id,
            sequence,
            steps,
            interval,
        });
        drop(state);
        axis.wake.notify_one();
        Ok(())
    }
}

/// Payload of exactly `N` bytes, as the firmware's fixed-size commands expect.
fn exact<const N: usize>(payload: &[u8]) -> std::result::Result<[u8; N], &'static str> {
    payload.try_into().map_err(|_| BAD_PAYLOAD)
}

/// Execute the queue of one axis, acknowledging each move once its
/// `|steps| × interval` µs have elapsed.
async fn run_axis(device: Arc<Device>, index: usize) {
    let axis = &device.axes[index];
    'next: loop {
        let head = {
            let state = lock(&axis.state);
            state
                .queue
                .front()
                .map(|head| (head.id, head.sequence, head.duration(), state.generation))
        };
        let Some((id, sequence, duration, generation)) = head else {
            axis.wake.notified().await;
            continue;
        };

        let deadline = Instant::now() + duration;
        loop {
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => break,
                _ = axis.wake.notified() => {
                    if lock(&axis.state).generation != generation {
                        continue 'next;
                    }
                }
            }
        }

        let done = {
            let mut state = lock(&axis.state);
            let current = state.generation == generation
                && state.queue.front().map(|head| head.id) == Some(id);
            if current {
                state.queue.pop_front();
            }
            current
        };
        if done {
            device.emit(sequence, Method::Ack, Property::MotMov, &[]);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use steplink_transport::Link;

    use super::*;
    use crate::driver::{Driver, DriverConfig};
    use crate::error::DriverError;

    async fn setup(config: EmulatorConfig) -> Driver {
        let (near, far) = tokio::io::duplex(4096);
        tokio::spawn(async move { Emulator::new(config).serve(far).await });
        let link = Link::new();
        let driver = Driver::new(link.clone(), DriverConfig::default());
        link.connect(near, "emulator").await;
        driver
    }

    fn mov(id: u8, steps: i32, interval: u32) -> Packet {
        Packet::encode(
            Method::Set,
            Property::MotMov,
            &[&fields::u8(id), &fields::i32(steps), &fields::u32(interval)],
        )
    }

    fn set_motor(id: u8, enable: bool) -> Packet {
        Packet::encode(Method::Set, Property::MotEna, &[&[id, u8::from(enable)]])
    }

    fn rejection(result: std::result::Result<Packet, DriverError>) -> String {
        match result {
            Err(DriverError::Rejected(text)) => text,
            other => panic!("expected rejection, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_identity_and_system_enable() {
        let driver = setup(EmulatorConfig::default()).await;
        assert_eq!(driver.firmware_info().await.unwrap(), DEFAULT_IDENTITY);

        driver.enable().await.unwrap();
        let state = driver
            .request(Packet::encode(Method::Get, Property::SysEna, &[]), None)
            .await
            .unwrap();
        assert_eq!(state.payload(), &[1]);

        driver.disable().await.unwrap();
        assert!(!driver.is_enabled());
    }

    #[tokio::test]
    async fn test_motor_config_round_trip() {
        let driver = setup(EmulatorConfig::default()).await;
        let initial = driver
            .request(Packet::encode(Method::Get, Property::MotCfg, &[&[1]]), None)
            .await
            .unwrap();
        assert_eq!(initial.payload(), &[1, 32, 40, 0xE8, 0x03]);

        let updated = driver
            .request(
                Packet::encode(
                    Method::Set,
                    Property::MotCfg,
                    &[&[1, 16, 50], &fields::u16(800)],
                ),
                None,
            )
            .await
            .unwrap();
        assert_eq!(updated.payload(), &[1, 16, 50, 0x20, 0x03]);
    }

    #[tokio::test]
    async fn test_rejections() {
        let driver = setup(EmulatorConfig::default()).await;
        let unknown = driver.request(set_motor(7, true), None).await;
        assert_eq!(rejection(unknown), NO_SUCH_MOTOR);

        let short = driver
            .request(Packet::encode(Method::Set, Property::MotEna, &[&[0]]), None)
            .await;
        assert_eq!(rejection(short), BAD_PAYLOAD);

        let disabled = driver.request(mov(0, 10, 100), None).await;
        assert_eq!(rejection(disabled), MOTOR_DISABLED);

        let unsupported = driver
            .request(Packet::encode(Method::Get, Property::MotHome, &[]), None)
            .await;
        assert_eq!(rejection(unsupported), "Unsupported command: GET::MOT_HOME");
    }

    #[tokio::test(start_paused = true)]
    async fn test_move_ack_deferred_until_complete() {
        let driver = setup(EmulatorConfig::default()).await;
        driver.request(set_motor(0, true), None).await.unwrap();

        let started = Instant::now();
        let first = driver.request(mov(0, 100, 1000), None);
        let second = driver.request(mov(0, -50, 1000), None);
        first.await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(100));
        second.await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(150));
    }

    #[tokio::test(start_paused = true)]
    async fn test_disable_rejects_pending_moves() {
        let driver = setup(EmulatorConfig::default()).await;
        driver.request(set_motor(2, true), None).await.unwrap();
        let running = driver.request(mov(2, 1000, 1000), None);
        let queued = driver.request(mov(2, 1000, 1000), None);
        tokio::time::sleep(Duration::from_millis(10)).await;

        let ack = driver.request(set_motor(2, false), None).await.unwrap();
        assert_eq!(ack.payload(), &[2, 0]);
        assert_eq!(rejection(running.await), MOTOR_DISABLED);
        assert_eq!(rejection(queued.await), MOTOR_DISABLED);
    }

    #[tokio::test(start_paused = true)]
    async fn test_queue_capacity() {
        let config = EmulatorConfig {
            queue_capacity: 1,
            ..EmulatorConfig::default()
        };
        let driver = setup(config).await;
        driver.request(set_motor(0, true), None).await.unwrap();
        let accepted = driver.request(mov(0, 10, 1000), None);
        tokio::time::sleep(Duration::from_millis(1)).await;
        let overflow = driver.request(mov(0, 10, 1000), None).await;
        assert_eq!(rejection(overflow), MOTOR_QUEUE_FULL);
        accepted.await.unwrap();
    }

    #[tokio::test]
    async fn test_system_disable_disables_motors() {
        let driver = setup(EmulatorConfig::default()).await;
        driver.enable().await.unwrap();
        driver.request(set_motor(1, true), None).await.unwrap();
        driver.disable().await.unwrap();
        let state = driver
            .request(Packet::encode(Method::Get, Property::MotEna, &[&[1]]), None)
            .await
            .unwrap();
        assert_eq!(state.payload(), &[1, 0]);
    }
}
