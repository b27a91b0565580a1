use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use steplink_driver::{Driver, DriverError};
use steplink_frame::{fields, Method, Packet, Property};
use steplink_task::HookHandle;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::{MotorConfig, MotorConfigReport};
use crate::error::{MotionError, Result};
use crate::lock;
use crate::planner::{discretize, trapezoidal, Motion, MotionSegment};

/// Timeout used by the driver lifecycle hooks.
pub const HOOK_TIMEOUT: Duration = Duration::from_secs(1);

/// Units/s used in constant-speed mode until changed.
pub const DEFAULT_SPEED: f64 = 1.0;

#[derive(Debug)]
struct MotorState {
    config: MotorConfig,
    enabled: bool,
    /// Absolute step position, optimistically advanced on dispatch.
    position: i64,
    /// Step position confirmed by the device.
    transient: i64,
    /// Units.
    target: f64,
    speed: f64,
    speed_transient: f64,
    queue: VecDeque<Motion>,
    /// Dispatched-but-unacknowledged durations in ms.
    in_flight: HashMap<u64, f64>,
    next_token: u64,
    next_ack_at: Instant,
    /// Bumped on disable; completions from an older generation leave the
    /// reset state alone.
    generation: u64,
}

impl MotorState {
    fn motion_delay(&self) -> f64 {
        self.in_flight.values().sum()
    }

    fn target_steps(&self) -> i64 {
        (self.target * self.config.steps_per_unit()).round() as i64
    }

    fn set_target_steps(&mut self, steps: i64) {
        self.target = steps as f64 / self.config.steps_per_unit();
    }

    fn is_idle(&self) -> bool {
        self.queue.is_empty() && self.in_flight.is_empty()
    }

    fn reset(&mut self) {
        self.queue.clear();
        self.position = 0;
        self.transient = 0;
        self.target = 0.0;
        self.speed_transient = 0.0;
    }

    /// Admit the next move that fits into the in-flight budget.
    fn admit(&mut self) -> Admission {
        let Some(&head) = self.queue.front() else {
            return Admission::Empty;
        };
        let budget = self.config.max_delay;
        let delay = self.motion_delay();
        let duration = head.duration_ms();
        if delay + duration <= budget {
            self.queue.pop_front();
            return Admission::Dispatch(head, duration);
        }
        if duration <= budget {
            return Admission::Full;
        }

        // The head can never fit as a whole.
        let step = head.step_ms();
        if step > budget {
            self.queue.pop_front();
            let target = self.target_steps() - i64::from(head.steps);
            self.set_target_steps(target);
            return Admission::Dropped(head);
        }
        let fit = ((budget - delay) / step).floor() as i32;
        if fit < 1 {
            return Admission::Full;
        }
        let prefix = Motion {
            steps: head.steps.signum() * fit,
            interval: head.interval,
        };
        if let Some(rest) = self.queue.front_mut() {
            rest.steps -= prefix.steps;
        }
        Admission::Dispatch(prefix, prefix.duration_ms())
    }
}

enum Admission {
    Empty,
    Full,
    Dispatch(Motion, f64),
    Dropped(Motion),
}

struct MotorInner {
    id: u8,
    driver: Driver,
    state: Mutex<MotorState>,
    changed: Notify,
}

/// One stepper axis.
///
/// Moves toward [`Motor::target`] are planned into a queue of [`Motion`]s
/// and sent to the device no further ahead than `config.max_delay` ms of
/// motion, which bounds how late a new target takes effect.
#[derive(Clone)]
pub struct Motor {
    inner: Arc<MotorInner>,
}

impl Motor {
    pub fn new(driver: Driver, id: u8, config: MotorConfig) -> Self {
        Self {
            inner: Arc::new(MotorInner {
                id,
                driver,
                state: Mutex::new(MotorState {
                    config,
                    enabled: false,
                    position: 0,
                    transient: 0,
                    target: 0.0,
                    speed: DEFAULT_SPEED,
                    speed_transient: 0.0,
                    queue: VecDeque::new(),
                    in_flight: HashMap::new(),
                    next_token: 0,
                    next_ack_at: Instant::now(),
                    generation: 0,
                }),
                changed: Notify::new(),
            }),
        }
    }

    pub fn id(&self) -> u8 {
        self.inner.id
    }

    pub fn config(&self) -> MotorConfig {
        lock(&self.inner.state).config.clone()
    }

    /// Replace the configuration; an enabled motor sends the device part
    /// right away.
    pub async fn set_config(&self, config: MotorConfig, timeout: Duration) -> Result<()> {
        config.validate()?;
        let enabled = {
            let mut state = lock(&self.inner.state);
            state.config = config;
            state.enabled
        };
        if enabled {
            self.apply_config(timeout).await?;
        }
        Ok(())
    }

    async fn apply_config(&self, timeout: Duration) -> Result<MotorConfigReport> {
        let payload = lock(&self.inner.state).config.pack(self.inner.id);
        let ack = self
            .inner
            .driver
            .request(
                Packet::encode(Method::Set, Property::MotCfg, &[&payload]),
                Some(timeout),
            )
            .await?;
        Ok(MotorConfigReport::unpack(ack.payload())?)
    }

    /// Query the settings the device currently uses.
    pub async fn read_config(&self, timeout: Duration) -> Result<MotorConfigReport> {
        let ack = self
            .inner
            .driver
            .request(
                Packet::encode(Method::Get, Property::MotCfg, &[&fields::u8(self.inner.id)]),
                Some(timeout),
            )
            .await?;
        Ok(MotorConfigReport::unpack(ack.payload())?)
    }

    pub fn is_enabled(&self) -> bool {
        lock(&self.inner.state).enabled
    }

    /// Configure and enable the axis, then plan toward the current target.
    pub async fn enable(&self, timeout: Duration) -> Result<()> {
        if !lock(&self.inner.state).config.active {
            return Err(MotionError::Inactive(self.inner.id));
        }
        let report = self.apply_config(timeout).await?;
        debug!(motor = self.inner.id, ?report, "config applied");
        self.set_enabled(true, timeout).await?;
        lock(&self.inner.state).enabled = true;
        info!(motor = self.inner.id, "motor enabled");
        self.plan();
        Ok(())
    }

    /// Disable the axis and forget its position.
    pub async fn disable(&self, timeout: Duration) -> Result<()> {
        self.set_enabled(false, timeout).await?;
        {
            let mut state = lock(&self.inner.state);
            state.enabled = false;
            state.generation += 1;
            state.reset();
        }
        info!(motor = self.inner.id, "motor disabled");
        self.inner.changed.notify_waiters();
        Ok(())
    }

    async fn set_enabled(&self, enable: bool, timeout: Duration) -> Result<()> {
        let request = Packet::encode(
            Method::Set,
            Property::MotEna,
            &[&fields::u8(self.inner.id), &fields::bool(enable)],
        );
        let ack = self.inner.driver.request(request, Some(timeout)).await?;
        if ack.payload().get(1) != Some(&u8::from(enable)) {
            return Err(DriverError::UnexpectedResponse {
                expected: format!("MOT_ENA {} {:02X}", self.inner.id, u8::from(enable)),
                got: steplink_frame::hex_view(ack.payload()),
            }
            .into());
        }
        Ok(())
    }

    /// Move toward `units`. Ignored while the motor is disabled.
    pub fn set_target(&self, units: f64) {
        {
            let mut state = lock(&self.inner.state);
            if !state.enabled {
                debug!(motor = self.inner.id, units, "target ignored while disabled");
                return;
            }
            state.target = units;
        }
        self.plan();
    }

    pub fn target(&self) -> f64 {
        lock(&self.inner.state).target
    }

    /// Constant-mode speed in units/s.
    pub fn set_speed(&self, units_per_sec: f64) -> Result<()> {
        {
            let mut state = lock(&self.inner.state);
            if state.config.trapezoidal {
                return Err(MotionError::TrapezoidalSpeed);
            }
            state.speed = units_per_sec;
        }
        self.plan();
        Ok(())
    }

    /// Units/s: the configured speed, or the speed of the last dispatched
    /// move in trapezoidal mode.
    pub fn speed(&self) -> f64 {
        let state = lock(&self.inner.state);
        if state.config.trapezoidal {
            state.speed_transient
        } else {
            state.speed
        }
    }

    /// Declare the current position as zero without moving, e.g. after
    /// homing.
    pub fn reset_position(&self) {
        {
            let mut state = lock(&self.inner.state);
            state.position = 0;
            state.transient = 0;
            state.target = 0.0;
        }
        self.plan();
    }

    /// Units, including moves not yet acknowledged.
    pub fn position(&self) -> f64 {
        let state = lock(&self.inner.state);
        state.position as f64 / state.config.steps_per_unit()
    }

    pub fn position_steps(&self) -> i64 {
        lock(&self.inner.state).position
    }

    /// Units, acknowledged moves only.
    pub fn transient_position(&self) -> f64 {
        let state = lock(&self.inner.state);
        state.transient as f64 / state.config.steps_per_unit()
    }

    /// Milliseconds of motion sent but not yet acknowledged.
    pub fn motion_delay(&self) -> f64 {
        lock(&self.inner.state).motion_delay()
    }

    pub fn in_flight_count(&self) -> usize {
        lock(&self.inner.state).in_flight.len()
    }

    /// Planned moves not yet dispatched.
    pub fn queued(&self) -> usize {
        lock(&self.inner.state).queue.len()
    }

    pub fn is_idle(&self) -> bool {
        lock(&self.inner.state).is_idle()
    }

    /// Resolves once nothing is queued or in flight.
    pub async fn idle(&self) {
        loop {
            let notified = self.inner.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_idle() {
                return;
            }
            notified.await;
        }
    }

    /// Replan from the current position to the target and start draining.
    pub fn plan(&self) {
        {
            let mut state = lock(&self.inner.state);
            state.queue.clear();
            let dx = state.target_steps() - state.position;
            let spu = state.config.steps_per_unit();
            debug!(
                motor = self.inner.id,
                from = state.position,
                to = state.position + dx,
                "planning"
            );
            if dx != 0 {
                let config = &state.config;
                let motions: Vec<Motion> = if config.trapezoidal {
                    let dt = config.min_segment / 1000.0;
                    trapezoidal(
                        dx,
                        state.speed_transient * spu,
                        0.0,
                        config.max_vel * spu,
                        config.max_acc * spu,
                    )
                    .iter()
                    .flat_map(|segment| discretize(segment, dt))
                    .collect()
                } else {
                    let v0 = dx.signum() as f64 * state.speed * spu;
                    let dt = (config.max_delay / 2.0).max(config.min_segment) / 1000.0;
                    discretize(&MotionSegment::constant(dx, v0), dt)
                };
                state.queue.extend(motions);
            }
        }
        self.inner.changed.notify_waiters();
        self.drain();
    }

    /// Run the dispatch loop in the background.
    fn drain(&self) {
        let motor = self.clone();
        tokio::spawn(async move { motor.dispatch_loop().await });
    }

    async fn dispatch_loop(&self) {
        tokio::task::yield_now().await;
        loop {
            let admission = lock(&self.inner.state).admit();
            match admission {
                Admission::Empty | Admission::Full => break,
                Admission::Dropped(motion) => {
                    warn!(
                        motor = self.inner.id,
                        steps = motion.steps,
                        interval = motion.interval,
                        "move exceeds the in-flight budget, dropped"
                    );
                    self.inner.changed.notify_waiters();
                }
                Admission::Dispatch(motion, duration) => self.dispatch(motion, duration),
            }
            tokio::task::yield_now().await;
        }
    }

    fn dispatch(&self, motion: Motion, duration: f64) {
        let delta = i64::from(motion.steps);
        let (token, generation, packet, timeout) = {
            let mut state = lock(&self.inner.state);
            let token = state.next_token;
            state.next_token += 1;
            state.in_flight.insert(token, duration);
            state.position += delta;
            state.speed_transient = delta.signum() as f64 * 1e6
                / f64::from(motion.interval.max(1))
                / state.config.steps_per_unit();

            let slack = state
                .next_ack_at
                .saturating_duration_since(Instant::now())
                .as_secs_f64()
                * 1000.0;
            let timeout_ms = state.motion_delay() + slack + duration + state.config.ack_grace;
            let steps = if state.config.invert {
                motion.steps.saturating_neg()
            } else {
                motion.steps
            };
            let packet = Packet::encode(
                Method::Set,
                Property::MotMov,
                &[
                    &fields::u8(self.inner.id),
                    &fields::i32(steps),
                    &fields::u32(motion.interval),
                ],
            );
            (
                token,
                state.generation,
                packet,
                Duration::from_secs_f64(timeout_ms / 1000.0),
            )
        };

        let request = self.inner.driver.request(packet, Some(timeout));
        let motor = self.clone();
        tokio::spawn(async move {
            let outcome = request.await;
            {
                let mut state = lock(&motor.inner.state);
                if state.generation == generation {
                    match &outcome {
                        Ok(_) => {
                            state.next_ack_at = Instant::now()
                                + Duration::from_secs_f64(state.motion_delay() / 1000.0);
                            state.transient += delta;
                        }
                        Err(err) => {
                            state.position -= delta;
                            let target = state.target_steps() - delta;
                            state.set_target_steps(target);
                            warn!(motor = motor.inner.id, steps = delta, error = %err, "move failed");
                        }
                    }
                }
                state.in_flight.remove(&token);
            }
            motor.inner.changed.notify_waiters();
            motor.drain();
        });
    }

    /// Follow the driver: enable after it enables, disable before it
    /// disables. Inactive motors are skipped.
    pub fn attach(&self) -> [HookHandle; 2] {
        let events = self.inner.driver.events();
        let weak = Arc::downgrade(&self.inner);
        let on_enable = events.enabled.register(move || {
            let motor = weak.upgrade().map(|inner| Motor { inner });
            async move {
                let Some(motor) = motor else { return };
                match motor.enable(HOOK_TIMEOUT).await {
                    Ok(()) | Err(MotionError::Inactive(_)) => {}
                    Err(err) => warn!(motor = motor.id(), error = %err, "enable failed"),
                }
            }
        });
        let weak = Arc::downgrade(&self.inner);
        let on_disable = events.before_disable.register(move || {
            let motor = weak.upgrade().map(|inner| Motor { inner });
            async move {
                let Some(motor) = motor else { return };
                if !motor.is_enabled() {
                    return;
                }
                if let Err(err) = motor.disable(HOOK_TIMEOUT).await {
                    warn!(motor = motor.id(), error = %err, "disable failed");
                }
            }
        });
        [on_enable, on_disable]
    }
}

impl fmt::Debug for Motor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = lock(&self.inner.state);
        f.debug_struct("Motor")
            .field("id", &self.inner.id)
            .field("enabled", &state.enabled)
            .field("position", &state.position)
            .field("queued", &state.queue.len())
            .field("in_flight", &state.in_flight.len())
            .finish()
    }
}
