//! Lock-free parameter smoothing
//!
//! Continuous parameters cross from the control/UI context to the audio
//! thread through `SmoothedParam`: the target is an atomic (single writer,
//! single reader), the ramp is advanced deterministically on the audio
//! thread. No locks, no allocation after construction.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use vm_core::Sample;

/// Smoothing algorithm type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SmoothingType {
    /// Exponential decay (RC filter style)
    #[default]
    Exponential,
    /// Linear ramp (constant rate)
    Linear,
    /// No smoothing (instant change)
    None,
}

/// Lock-free smoothed parameter for audio processing
#[derive(Debug)]
pub struct SmoothedParam {
    /// Target value (set from the control thread)
    target: AtomicU64,
    /// Current smoothed value (audio thread only)
    current: Sample,
    /// Exponential smoothing coefficient
    coeff: Sample,
    smoothing_type: SmoothingType,
    /// Smoothing time in samples
    smoothing_samples: Sample,
    linear_step: Sample,
    linear_remaining: i32,
    /// Target changed since last ramp recalculation
    dirty: AtomicBool,
    min_value: Sample,
    max_value: Sample,
}

impl SmoothedParam {
    pub fn new(
        initial_value: Sample,
        smoothing_time_ms: Sample,
        sample_rate: Sample,
        smoothing_type: SmoothingType,
    ) -> Self {
        let smoothing_samples = (smoothing_time_ms / 1000.0) * sample_rate;
        Self {
            target: AtomicU64::new(initial_value.to_bits()),
            current: initial_value,
            coeff: Self::calculate_coeff(smoothing_samples),
            smoothing_type,
            smoothing_samples,
            linear_step: 0.0,
            linear_remaining: 0,
            dirty: AtomicBool::new(false),
            min_value: Sample::NEG_INFINITY,
            max_value: Sample::INFINITY,
        }
    }

    /// Create with a clamped value range
    pub fn with_range(
        initial_value: Sample,
        smoothing_time_ms: Sample,
        sample_rate: Sample,
        smoothing_type: SmoothingType,
        min: Sample,
        max: Sample,
    ) -> Self {
        let mut param = Self::new(initial_value, smoothing_time_ms, sample_rate, smoothing_type);
        param.min_value = min;
        param.max_value = max;
        param
    }

    fn calculate_coeff(samples: Sample) -> Sample {
        if samples <= 0.0 {
            1.0
        } else {
            // reach ~63% of the step in smoothing_samples
            1.0 - (-1.0 / samples).exp()
        }
    }

    /// Reconfigure for a new sample rate, preserving the smoothing time
    pub fn set_sample_rate(&mut self, old_rate: Sample, new_rate: Sample) {
        if old_rate > 0.0 {
            self.smoothing_samples *= new_rate / old_rate;
            self.coeff = Self::calculate_coeff(self.smoothing_samples);
        }
    }

    /// Set target value (thread-safe, call from the control thread)
    #[inline]
    pub fn set_target(&self, value: Sample) {
        let clamped = value.clamp(self.min_value, self.max_value);
        self.target.store(clamped.to_bits(), Ordering::Relaxed);
        self.dirty.store(true, Ordering::Relaxed);
    }

    #[inline]
    pub fn target(&self) -> Sample {
        Sample::from_bits(self.target.load(Ordering::Relaxed))
    }

    #[inline]
    pub fn current(&self) -> Sample {
        self.current
    }

    /// Jump current and target to a value (initialization / reset)
    pub fn set_immediate(&mut self, value: Sample) {
        let clamped = value.clamp(self.min_value, self.max_value);
        self.current = clamped;
        self.target.store(clamped.to_bits(), Ordering::Relaxed);
        self.linear_remaining = 0;
        self.dirty.store(false, Ordering::Relaxed);
    }

    #[inline]
    pub fn is_smoothing(&self) -> bool {
        match self.smoothing_type {
            SmoothingType::None => false,
            SmoothingType::Linear => self.linear_remaining > 0,
            SmoothingType::Exponential => (self.current - self.target()).abs() > 1e-10,
        }
    }

    /// Advance one sample
    #[inline]
    pub fn next(&mut self) -> Sample {
        let target = self.target();

        match self.smoothing_type {
            SmoothingType::None => {
                self.current = target;
            }
            SmoothingType::Exponential => {
                self.current += self.coeff * (target - self.current);
            }
            SmoothingType::Linear => {
                if self.dirty.swap(false, Ordering::Relaxed) {
                    let diff = target - self.current;
                    self.linear_remaining = self.smoothing_samples as i32;
                    if self.linear_remaining > 0 {
                        self.linear_step = diff / self.linear_remaining as Sample;
                    } else {
                        self.current = target;
                        self.linear_step = 0.0;
                    }
                }

                if self.linear_remaining > 0 {
                    self.current += self.linear_step;
                    self.linear_remaining -= 1;
                } else {
                    self.current = target;
                }
            }
        }

        self.current
    }

    /// Advance a whole block at once and return the end-of-block value.
    ///
    /// Exponential mode uses the closed form so a block advance is exact and
    /// O(1); linear mode steps through the remaining ramp.
    pub fn advance(&mut self, samples: usize) -> Sample {
        if samples == 0 {
            return self.current;
        }
        match self.smoothing_type {
            SmoothingType::None => {
                self.current = self.target();
            }
            SmoothingType::Exponential => {
                let target = self.target();
                let keep = (1.0 - self.coeff).powi(samples as i32);
                self.current = target + (self.current - target) * keep;
            }
            SmoothingType::Linear => {
                for _ in 0..samples {
                    self.next();
                }
            }
        }
        self.current
    }

    /// Reset to the target value instantly
    pub fn reset(&mut self) {
        self.current = self.target();
        self.linear_remaining = 0;
        self.dirty.store(false, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_smoothing() {
        let mut param = SmoothedParam::new(0.0, 10.0, 48000.0, SmoothingType::Exponential);
        param.set_target(1.0);

        for _ in 0..10000 {
            param.next();
        }
        assert!((param.current() - 1.0).abs() < 0.01);
    }

    #[test]
    fn test_linear_smoothing_reaches_target() {
        let mut param = SmoothedParam::new(0.0, 10.0, 1000.0, SmoothingType::Linear);
        // 10 ms at 1 kHz = 10 samples
        param.set_target(1.0);

        for _ in 0..10 {
            param.next();
        }
        assert!((param.current() - 1.0).abs() < 0.01);
    }

    #[test]
    fn test_block_advance_matches_per_sample() {
        let mut a = SmoothedParam::new(0.0, 20.0, 48000.0, SmoothingType::Exponential);
        let mut b = SmoothedParam::new(0.0, 20.0, 48000.0, SmoothingType::Exponential);
        a.set_target(0.7);
        b.set_target(0.7);

        for _ in 0..512 {
            a.next();
        }
        b.advance(512);

        assert!((a.current() - b.current()).abs() < 1e-9);
    }

    #[test]
    fn test_value_clamping() {
        let param =
            SmoothedParam::with_range(0.5, 10.0, 48000.0, SmoothingType::Exponential, 0.0, 1.0);

        param.set_target(2.0);
        assert!((param.target() - 1.0).abs() < 1e-12);

        param.set_target(-1.0);
        assert!(param.target().abs() < 1e-12);
    }

    #[test]
    fn test_monotonic_approach() {
        // The ramp must move toward the target and never overshoot
        let mut param = SmoothedParam::new(0.0, 30.0, 48000.0, SmoothingType::Exponential);
        param.set_target(1.0);

        let mut prev = 0.0;
        for _ in 0..4000 {
            let v = param.next();
            assert!(v >= prev && v <= 1.0);
            prev = v;
        }
    }
}
