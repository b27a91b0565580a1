//! Kinematic planning in step space.
//!
//! [`trapezoidal`] splits a move into accelerate / cruise / decelerate
//! segments; [`discretize`] turns a segment into the quantized
//! `{steps, interval}` commands the device executes.

/// One device move: `steps` at a fixed `interval` µs per step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Motion {
    pub steps: i32,
    pub interval: u32,
}

impl Motion {
    /// Time the device needs for this move, in milliseconds. A zero-step
    /// move still occupies one interval.
    pub fn duration_ms(&self) -> f64 {
        f64::from(self.steps.unsigned_abs().max(1)) * f64::from(self.interval) / 1000.0
    }

    /// Duration of a single step, in milliseconds.
    pub fn step_ms(&self) -> f64 {
        f64::from(self.interval) / 1000.0
    }
}

/// A stretch of constant acceleration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MotionSegment {
    /// Displacement in steps.
    pub dx: i64,
    /// Boundary velocities in steps/s.
    pub v0: f64,
    pub v1: f64,
    /// Total time in seconds, when the average velocity is non-zero.
    pub duration: Option<f64>,
}

impl MotionSegment {
    pub fn constant(dx: i64, v: f64) -> Self {
        Self::new(dx, v, v)
    }

    pub fn new(dx: i64, v0: f64, v1: f64) -> Self {
        let avg = (v0.abs() + v1.abs()) / 2.0;
        let duration = (avg > 0.0).then(|| dx.unsigned_abs() as f64 / avg);
        Self {
            dx,
            v0,
            v1,
            duration,
        }
    }
}

/// Plan a move of `dx` steps from `v0` to `v1` under `v_max` and `acc`.
///
/// Boundary velocities pointing against the direction of travel count as
/// zero. Segment displacements are whole steps and always sum to `dx`.
pub fn trapezoidal(dx: i64, v0: f64, v1: f64, v_max: f64, acc: f64) -> Vec<MotionSegment> {
    if dx == 0 {
        return Vec::new();
    }
    let direction = dx.signum() as f64;
    let distance = dx.unsigned_abs() as f64;
    // Non-positive (or NaN) limits mean "unconstrained".
    if !(acc > 0.0) || !(v_max > 0.0) {
        return vec![MotionSegment::new(dx, v0, v1)];
    }
    let (vm, a) = (v_max, acc);

    let u0 = (direction * v0).max(0.0);
    let u1 = (direction * v1).max(0.0);

    let mut segments = Vec::with_capacity(3);
    let mut push = |d: f64, from: f64, to: f64| {
        let d = d.round() as i64;
        if d != 0 {
            segments.push(MotionSegment::new(d, from, to));
        }
    };

    let d_acc = ((vm * vm - u0 * u0) / (2.0 * a)).max(0.0);
    let d_dec = ((vm * vm - u1 * u1) / (2.0 * a)).max(0.0);

    if d_acc + d_dec <= distance {
        let cruise = distance - d_acc - d_dec;
        push(direction * d_acc, direction * u0, direction * vm);
        push(direction * cruise, direction * vm, direction * vm);
        push(direction * d_dec, direction * vm, direction * u1);
    } else {
        // Triangular: the cruise phase vanishes.
        let vp = (a * distance + (u0 * u0 + u1 * u1) / 2.0).max(0.0).sqrt();
        let d1 = ((vp * vp - u0 * u0) / (2.0 * a)).max(0.0);
        let d3 = (distance - d1).max(0.0);
        push(direction * d1, direction * u0, direction * vp);
        push(direction * d3, direction * vp, direction * u1);
    }

    let planned: i64 = segments.iter().map(|segment| segment.dx).sum();
    let remainder = dx - planned;
    if remainder != 0 {
        match segments.last_mut() {
            Some(last) => *last = MotionSegment::new(last.dx + remainder, last.v0, last.v1),
            None => segments.push(MotionSegment::new(dx, v0, v1)),
        }
    }
    segments
}

/// Sample `segment` every `dt` seconds and quantize each sample interval.
///
/// The first and last checkpoints are the exact segment endpoints, so the
/// step counts always sum to `segment.dx`. Velocities are taken by
/// magnitude and the result moves in the direction of `dx`. A segment with
/// zero average velocity yields nothing.
pub fn discretize(segment: &MotionSegment, dt: f64) -> Vec<Motion> {
    let sign = segment.dx.signum();
    let distance = segment.dx.unsigned_abs() as f64;
    let u0 = segment.v0.abs();
    let u1 = segment.v1.abs();
    let total = distance / ((u0 + u1) / 2.0);
    if !(total > 0.0) || !total.is_finite() {
        return Vec::new();
    }
    let dt = if dt > 0.0 && dt.is_finite() { dt } else { total };

    let position = |t: f64| -> i64 {
        if t <= 0.0 {
            0
        } else if t >= total {
            segment.dx.abs()
        } else if u0 == u1 {
            (u0 * t).round() as i64
        } else {
            (u0 * t + (u1 - u0) * t * t / (2.0 * total)).round() as i64
        }
    };
    let velocity = |t: f64| -> f64 {
        if t >= total {
            u1
        } else {
            u0 + (u1 - u0) * t.max(0.0) / total
        }
    };

    let mut motions = Vec::new();
    let mut prev_x = 0i64;
    let mut prev_v = velocity(0.0);
    let mut index = 1u64;
    loop {
        let t = (index as f64 * dt).min(total);
        let x = position(t);
        let v = velocity(t);
        let steps = x - prev_x;
        if steps != 0 {
            let interval = (2e6 / (prev_v + v)).round().clamp(0.0, f64::from(u32::MAX)) as u32;
            push_steps(&mut motions, sign * steps, interval);
        }
        prev_x = x;
        prev_v = v;
        if t >= total {
            break;
        }
        index += 1;
    }
    motions
}

/// Append `steps`, splitting counts beyond the i32 wire range.
fn push_steps(motions: &mut Vec<Motion>, mut steps: i64, interval: u32) {
    while steps != 0 {
        let chunk = steps.clamp(i64::from(i32::MIN), i64::from(i32::MAX));
        motions.push(Motion {
            steps: chunk as i32,
            interval,
        });
        steps -= chunk;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn total(segments: &[MotionSegment]) -> i64 {
        segments.iter().map(|segment| segment.dx).sum()
    }

    fn steps(motions: &[Motion]) -> i64 {
        motions.iter().map(|motion| i64::from(motion.steps)).sum()
    }

    #[test]
    fn test_full_trapezoid() {
        let segments = trapezoidal(1000, 0.0, 0.0, 100.0, 50.0);
        assert_eq!(segments.len(), 3);
        assert_eq!(total(&segments), 1000);
        assert_eq!(
            segments.iter().map(|s| s.dx).collect::<Vec<_>>(),
            vec![100, 800, 100]
        );
        assert_eq!(segments[1].v0, 100.0);
        assert_eq!(segments[2].v1, 0.0);
    }

    #[test]
    fn test_triangular_profile() {
        let segments = trapezoidal(100, 0.0, 0.0, 100.0, 50.0);
        assert_eq!(segments.len(), 2);
        assert_eq!(total(&segments), 100);
        let peak = segments[0].v1;
        assert!(peak < 100.0 && (peak - 5000f64.sqrt()).abs() < 1e-9);
    }

    #[test]
    fn test_negative_direction() {
        let segments = trapezoidal(-1000, 0.0, 0.0, 100.0, 50.0);
        assert_eq!(
            segments.iter().map(|s| s.dx).collect::<Vec<_>>(),
            vec![-100, -800, -100]
        );
        assert_eq!(segments[1].v0, -100.0);
    }

    #[test]
    fn test_degenerate_limits_give_single_segment() {
        for (v_max, acc) in [(100.0, 0.0), (0.0, 50.0), (100.0, -1.0), (-5.0, 0.0)] {
            let segments = trapezoidal(-321, 10.0, 20.0, v_max, acc);
            assert_eq!(segments.len(), 1, "v_max={v_max} acc={acc}");
            assert_eq!(segments[0].dx, -321);
            assert_eq!((segments[0].v0, segments[0].v1), (10.0, 20.0));
        }
        assert!(trapezoidal(0, 10.0, 10.0, 100.0, 50.0).is_empty());
    }

    #[test]
    fn test_opposite_boundary_speed_treated_as_zero() {
        let segments = trapezoidal(1000, -80.0, 0.0, 100.0, 50.0);
        assert_eq!(segments[0].v0, 0.0);
        assert_eq!(total(&segments), 1000);
    }

    #[test]
    fn test_displacement_is_exact_across_parameters() {
        for dx in [-10_007, -999, -3, -1, 1, 2, 7, 101, 4_321, 1_000_003] {
            for (v0, v1) in [(0.0, 0.0), (13.7, 0.0), (0.0, 42.1), (-30.0, 99.9)] {
                for (v_max, acc) in [(3.0, 2.0), (100.0, 50.0), (1e4, 0.3), (7.5, 1e5)] {
                    let segments = trapezoidal(dx, v0, v1, v_max, acc);
                    assert_eq!(total(&segments), dx, "dx={dx} v0={v0} v1={v1} vm={v_max} a={acc}");
                }
            }
        }
    }

    #[test]
    fn test_discretize_constant_segment() {
        let motions = discretize(&MotionSegment::constant(1000, 1000.0), 0.1);
        assert_eq!(motions.len(), 10);
        assert!(motions.iter().all(|m| *m == Motion { steps: 100, interval: 1000 }));
    }

    #[test]
    fn test_discretize_sum_matches_segment() {
        for segment in trapezoidal(12_345, 0.0, 0.0, 3200.0, 6400.0)
            .iter()
            .chain(trapezoidal(-777, 0.0, 0.0, 500.0, 100.0).iter())
        {
            let motions = discretize(segment, 0.016);
            assert_eq!(steps(&motions), segment.dx);
            assert!(motions.iter().all(|m| m.steps != 0));
            assert!(motions.iter().all(|m| m.steps.signum() as i64 == segment.dx.signum()));
        }
    }

    #[test]
    fn test_discretize_accelerating_intervals_shrink() {
        let motions = discretize(&MotionSegment::new(1000, 0.0, 1000.0), 0.2);
        assert_eq!(steps(&motions), 1000);
        assert!(motions.windows(2).all(|pair| pair[1].interval < pair[0].interval));
    }

    #[test]
    fn test_discretize_uses_magnitudes() {
        let forward = discretize(&MotionSegment::constant(-500, 250.0), 0.5);
        let backward = discretize(&MotionSegment::constant(-500, -250.0), 0.5);
        assert_eq!(forward, backward);
        assert_eq!(steps(&forward), -500);
        assert!(forward.iter().all(|m| m.interval == 4000));
    }

    #[test]
    fn test_discretize_zero_velocity_yields_nothing() {
        assert!(discretize(&MotionSegment::constant(100, 0.0), 0.1).is_empty());
        assert!(discretize(&MotionSegment::constant(0, 100.0), 0.1).is_empty());
    }

    #[test]
    fn test_discretize_without_step_uses_whole_segment() {
        let motions = discretize(&MotionSegment::constant(40, 200.0), 0.0);
        assert_eq!(motions, vec![Motion { steps: 40, interval: 5000 }]);
    }

    #[test]
    fn test_motion_duration() {
        let motion = Motion { steps: -20, interval: 5000 };
        assert_eq!(motion.duration_ms(), 100.0);
        assert_eq!(motion.step_ms(), 5.0);
        assert_eq!(Motion { steps: 0, interval: 2000 }.duration_ms(), 2.0);
    }
}
