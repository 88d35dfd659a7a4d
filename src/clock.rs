//! Software clock recovery for a free-running device clock.
//!
//! A second-order delay-locked loop filters the timestamps of successive
//! frame blocks. Loop gains follow from the bandwidth and the block period:
//! `w = 2*pi*B*n/fs`, `b = sqrt(2)*w`, `c = w*w`. Phase errors are clamped
//! before they reach the loop so a single late packet cannot yank the rate.
//! A run of clamped errors means the stream stepped in time rather than in
//! rate; the loop then re-anchors its phase on the next timestamp.

use std::f64::consts::{PI, SQRT_2};

use crate::cycle_timer::{TICKS_PER_CYCLE, TICKS_PER_SECOND, TICKS_WRAP};

/// Loop bandwidth used when nothing overrides it.
pub const DEFAULT_DLL_BANDWIDTH_HZ: f64 = 0.1;
/// Largest phase error fed to the loop, one bus cycle.
pub const DEFAULT_MAX_PHASE_ERROR_TICKS: f64 = TICKS_PER_CYCLE as f64;
/// Consecutive clamped phase errors after which the loop re-anchors.
pub const RELOCK_AFTER: u32 = 4;

/// Last block seen by the loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Observation {
    /// Frames observed since the loop was seeded, including this block.
    pub frame_count: u64,
    /// Bus time of the block, in ticks.
    pub timestamp: u64,
}

/// Delay-locked loop tracking ticks per frame.
#[derive(Debug, Clone)]
pub struct ClockRecovery {
    nominal_rate_hz: f64,
    bandwidth_hz: f64,
    max_error_ticks: f64,
    ticks_per_frame: f64,
    filtered_time: Option<f64>,
    last: Option<Observation>,
    clamped_run: u32,
}

impl ClockRecovery {
    /// Loop for a stream with the given nominal rate and bandwidth.
    pub fn new(nominal_rate_hz: u32, bandwidth_hz: f64) -> Self {
        let nominal_rate_hz = f64::from(nominal_rate_hz.max(1));
        Self {
            nominal_rate_hz,
            bandwidth_hz: sanitize_bandwidth(bandwidth_hz),
            max_error_ticks: DEFAULT_MAX_PHASE_ERROR_TICKS,
            ticks_per_frame: TICKS_PER_SECOND as f64 / nominal_rate_hz,
            filtered_time: None,
            last: None,
            clamped_run: 0,
        }
    }

    /// Loop bandwidth in Hz.
    pub fn bandwidth_hz(&self) -> f64 {
        self.bandwidth_hz
    }

    /// Retune the loop. Non-positive or non-finite values fall back to the default.
    pub fn set_bandwidth_hz(&mut self, bandwidth_hz: f64) {
        self.bandwidth_hz = sanitize_bandwidth(bandwidth_hz);
    }

    /// Nominal frame rate.
    pub fn nominal_rate_hz(&self) -> f64 {
        self.nominal_rate_hz
    }

    /// Nominal period in ticks per frame.
    pub fn nominal_ticks_per_frame(&self) -> f64 {
        TICKS_PER_SECOND as f64 / self.nominal_rate_hz
    }

    /// Current period estimate in ticks per frame.
    pub fn ticks_per_frame(&self) -> f64 {
        self.ticks_per_frame
    }

    /// Current rate estimate in frames per second.
    pub fn frame_rate_hz(&self) -> f64 {
        TICKS_PER_SECOND as f64 / self.ticks_per_frame
    }

    /// Last observation consumed.
    pub fn last_observation(&self) -> Option<Observation> {
        self.last
    }

    /// Forget observations and return to the nominal rate.
    pub fn reset(&mut self) {
        let nominal = self.nominal_ticks_per_frame();
        self.reset_to(nominal);
    }

    /// Forget observations and seed the estimate with `ticks_per_frame`.
    pub fn reset_to(&mut self, ticks_per_frame: f64) {
        if ticks_per_frame.is_finite() && ticks_per_frame > 0.0 {
            self.ticks_per_frame = ticks_per_frame;
        }
        self.resync();
    }

    /// Drop the phase reference but keep the rate estimate. The next
    /// observation re-anchors the loop.
    pub fn resync(&mut self) {
        self.filtered_time = None;
        self.last = None;
        self.clamped_run = 0;
    }

    /// Seed the estimate with a frame rate in Hz.
    pub fn set_frame_rate(&mut self, rate_hz: f64) {
        if rate_hz.is_finite() && rate_hz > 0.0 {
            self.reset_to(TICKS_PER_SECOND as f64 / rate_hz);
        }
    }

    /// Loop coefficients `(b, c)` for a block of `frames`.
    pub fn coefficients(&self, frames: u32) -> (f64, f64) {
        let omega = 2.0 * PI * self.bandwidth_hz * f64::from(frames) / self.nominal_rate_hz;
        (SQRT_2 * omega, omega * omega)
    }

    /// Largest change one update of `frames` can make to the estimate.
    pub fn max_rate_step(&self, frames: u32) -> f64 {
        if frames == 0 {
            return 0.0;
        }
        let (_, c) = self.coefficients(frames);
        c * self.max_error_ticks / f64::from(frames)
    }

    /// Feed a block of `frames` whose last frame was stamped at `timestamp`.
    /// Returns the updated ticks-per-frame estimate.
    pub fn update(&mut self, frames: u32, timestamp: u64) -> f64 {
        if frames == 0 {
            return self.ticks_per_frame;
        }
        let frame_count = self.last.map_or(0, |o| o.frame_count) + u64::from(frames);
        self.last = Some(Observation {
            frame_count,
            timestamp,
        });

        let Some(filtered) = self.filtered_time else {
            self.filtered_time = Some(timestamp as f64);
            return self.ticks_per_frame;
        };

        let n = f64::from(frames);
        let predicted = filtered + n * self.ticks_per_frame;
        let raw_error = fold_ticks(timestamp as f64 - predicted);
        if raw_error.abs() > self.max_error_ticks {
            self.clamped_run += 1;
            if self.clamped_run >= RELOCK_AFTER {
                self.filtered_time = Some(timestamp as f64);
                self.clamped_run = 0;
                return self.ticks_per_frame;
            }
        } else {
            self.clamped_run = 0;
        }
        let error = raw_error.clamp(-self.max_error_ticks, self.max_error_ticks);
        let (b, c) = self.coefficients(frames);

        self.filtered_time = Some(wrap_ticks_f64(predicted + b * error));
        self.ticks_per_frame = (self.ticks_per_frame + c * error / n).max(f64::EPSILON);
        self.ticks_per_frame
    }
}

fn sanitize_bandwidth(bandwidth_hz: f64) -> f64 {
    if bandwidth_hz.is_finite() && bandwidth_hz > 0.0 {
        bandwidth_hz
    } else {
        DEFAULT_DLL_BANDWIDTH_HZ
    }
}

fn wrap_ticks_f64(ticks: f64) -> f64 {
    ticks.rem_euclid(TICKS_WRAP as f64)
}

fn fold_ticks(delta: f64) -> f64 {
    let wrap = TICKS_WRAP as f64;
    let folded = delta.rem_euclid(wrap);
    if folded > wrap / 2.0 {
        folded - wrap
    } else {
        folded
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cycle_timer::add_ticks;

    const RATE: u32 = 48_000;
    const BLOCK: u32 = 512;
    const BANDWIDTH: f64 = 2.0;

    fn feed(dll: &mut ClockRecovery, start: u64, true_tpf: f64, blocks: u64) -> u64 {
        let mut ts = start;
        for k in 0..blocks {
            let offset = ((k + 1) as f64 * f64::from(BLOCK) * true_tpf).round() as i64;
            ts = add_ticks(start, offset);
            dll.update(BLOCK, ts);
        }
        ts
    }

    #[test]
    fn converges_on_a_drifting_device_clock() {
        let nominal = TICKS_PER_SECOND as f64 / f64::from(RATE);
        let true_tpf = nominal * (1.0 + 150e-6);
        let mut dll = ClockRecovery::new(RATE, BANDWIDTH);
        feed(&mut dll, 1_000, true_tpf, 600);
        let relative = (dll.ticks_per_frame() - true_tpf).abs() / true_tpf;
        assert!(relative < 1e-6, "estimate {} vs {true_tpf}", dll.ticks_per_frame());
    }

    #[test]
    fn tracks_across_the_cycle_timer_wrap() {
        let nominal = TICKS_PER_SECOND as f64 / f64::from(RATE);
        let true_tpf = nominal * (1.0 - 80e-6);
        let mut dll = ClockRecovery::new(RATE, BANDWIDTH);
        let start = TICKS_WRAP - 100 * u64::from(BLOCK) * nominal as u64;
        feed(&mut dll, start, true_tpf, 600);
        let relative = (dll.ticks_per_frame() - true_tpf).abs() / true_tpf;
        assert!(relative < 1e-6);
    }

    #[test]
    fn outlier_moves_estimate_by_at_most_one_step() {
        let nominal = TICKS_PER_SECOND as f64 / f64::from(RATE);
        let mut dll = ClockRecovery::new(RATE, BANDWIDTH);
        let last = feed(&mut dll, 0, nominal, 400);
        let before = dll.ticks_per_frame();

        let late = add_ticks(last, (f64::from(BLOCK) * nominal) as i64 + 250_000);
        let after = dll.update(BLOCK, late);
        let moved = (after - before).abs();
        assert!(moved > 0.0);
        assert!(moved <= dll.max_rate_step(BLOCK) * (1.0 + 1e-9));
    }

    #[test]
    fn relocks_after_a_step_in_bus_time() {
        let tpf = TICKS_PER_SECOND as f64 / f64::from(RATE);
        let mut dll = ClockRecovery::new(RATE, BANDWIDTH);
        let last = feed(&mut dll, 0, tpf, 400);
        assert!((dll.frame_rate_hz() - f64::from(RATE)).abs() < 1e-6);

        // Half a second without observations, then the same clock again.
        let resumed = add_ticks(last, (TICKS_PER_SECOND / 2) as i64);
        feed(&mut dll, resumed, tpf, 600);
        let rate = dll.frame_rate_hz();
        assert!((rate - f64::from(RATE)).abs() < 1e-3, "estimate {rate}");
    }

    #[test]
    fn resync_keeps_the_estimate() {
        let nominal = TICKS_PER_SECOND as f64 / f64::from(RATE);
        let true_tpf = nominal * (1.0 + 100e-6);
        let mut dll = ClockRecovery::new(RATE, BANDWIDTH);
        feed(&mut dll, 0, true_tpf, 600);
        let locked = dll.ticks_per_frame();
        dll.resync();
        assert!(dll.last_observation().is_none());
        assert_eq!(dll.ticks_per_frame(), locked);
        assert_eq!(dll.update(BLOCK, 90_000_000), locked);
    }

    #[test]
    fn seeding_overrides_the_estimate() {
        let mut dll = ClockRecovery::new(44_100, DEFAULT_DLL_BANDWIDTH_HZ);
        dll.set_frame_rate(48_000.0);
        assert!((dll.frame_rate_hz() - 48_000.0).abs() < 1e-9);
        assert!(dll.last_observation().is_none());
        dll.reset();
        assert!((dll.frame_rate_hz() - 44_100.0).abs() < 1e-9);
    }

    #[test]
    fn rejects_nonsense_bandwidth() {
        let mut dll = ClockRecovery::new(RATE, -1.0);
        assert_eq!(dll.bandwidth_hz(), DEFAULT_DLL_BANDWIDTH_HZ);
        dll.set_bandwidth_hz(f64::NAN);
        assert_eq!(dll.bandwidth_hz(), DEFAULT_DLL_BANDWIDTH_HZ);
    }
}
