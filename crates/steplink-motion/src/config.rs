use std::path::Path;

use serde::{Deserialize, Serialize};
use steplink_frame::{FieldReader, Result as FrameResult};

use crate::error::{MotionError, Result};

/// Full steps per revolution of the motors in use.
pub const FULL_STEPS_PER_REV: f64 = 200.0;

/// Per-axis configuration.
///
/// The first three fields are sent to the device as MOT_CFG; the rest only
/// drive host-side planning. Missing fields take their defaults when
/// deserializing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MotorConfig {
    /// 1, 2, 4, ... 128.
    pub micro_steps: u8,
    /// 0 disables stall detection.
    pub stall_sensitivity: u8,
    /// mA.
    pub rms_current: u16,

    /// Whether the axis is in use at all.
    pub active: bool,
    /// Reverse the direction of every move sent to the device.
    pub invert: bool,
    /// Revolutions per unit of distance.
    pub scale: f64,
    pub unit: String,

    /// Plan with acceleration limits instead of a constant speed.
    pub trapezoidal: bool,
    /// Units/s.
    pub min_vel: f64,
    /// Units/s.
    pub max_vel: f64,
    /// Units/s².
    pub max_acc: f64,

    /// In-flight budget in ms: how far ahead of the device moves are sent.
    pub max_delay: f64,
    /// Shortest planned segment in ms.
    pub min_segment: f64,
    /// Extra ms a move ACK may take beyond its expected completion.
    pub ack_grace: f64,
}

impl Default for MotorConfig {
    fn default() -> Self {
        Self {
            micro_steps: 16,
            stall_sensitivity: 50,
            rms_current: 1000,
            active: false,
            invert: false,
            scale: 1.0,
            unit: "unit".to_string(),
            trapezoidal: false,
            min_vel: 0.1,
            max_vel: 10.0,
            max_acc: 10.0,
            max_delay: 100.0,
            min_segment: 16.0,
            ack_grace: 10_000.0,
        }
    }
}

impl MotorConfig {
    pub fn steps_per_unit(&self) -> f64 {
        FULL_STEPS_PER_REV * f64::from(self.micro_steps) * self.scale
    }

    /// SET MOT_CFG payload for motor `id`.
    pub fn pack(&self, id: u8) -> [u8; 5] {
        let [rms_lo, rms_hi] = self.rms_current.to_le_bytes();
        [id, self.micro_steps, self.stall_sensitivity, rms_lo, rms_hi]
    }

    pub fn validate(&self) -> Result<()> {
        if self.micro_steps == 0 || !self.micro_steps.is_power_of_two() {
            return Err(MotionError::Config(format!(
                "micro_steps must be a power of two, got {}",
                self.micro_steps
            )));
        }
        if !(self.scale.is_finite() && self.scale > 0.0) {
            return Err(MotionError::Config(format!(
                "scale must be positive, got {}",
                self.scale
            )));
        }
        if !(self.max_delay > 0.0) {
            return Err(MotionError::Config(format!(
                "max_delay must be positive, got {}",
                self.max_delay
            )));
        }
        if self.min_segment < 0.0 || self.ack_grace < 0.0 {
            return Err(MotionError::Config(
                "min_segment and ack_grace must not be negative".to_string(),
            ));
        }
        Ok(())
    }

    pub fn from_json(text: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(text).map_err(|err| MotionError::Config(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|err| MotionError::Config(format!("{}: {err}", path.display())))?;
        Self::from_json(&text)
    }
}

/// Device-side settings as reported in an ACK MOT_CFG.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MotorConfigReport {
    pub id: u8,
    pub micro_steps: u8,
    pub stall_sensitivity: u8,
    pub rms_current: u16,
}

impl MotorConfigReport {
    pub fn unpack(payload: &[u8]) -> FrameResult<Self> {
        let mut reader = FieldReader::new(payload);
        Ok(Self {
            id: reader.u8()?,
            micro_steps: reader.u8()?,
            stall_sensitivity: reader.u8()?,
            rms_current: reader.u16()?,
        })
    }
}
