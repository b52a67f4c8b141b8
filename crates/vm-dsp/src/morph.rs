//! Spectral morphing filter
//!
//! Interpolates between two Z-plane shapes from the bank, remaps the result
//! to the host sample rate, and runs a 6-section band-pass cascade per
//! channel. The nonlinear stage (drive, tanh saturation, makeup) is exposed
//! separately so a wrapper can oversample only that half.
//!
//! Coefficients are recomputed at block rate from smoothed parameters; the
//! per-sample loop only runs the cascade.

use std::f64::consts::PI;
use vm_core::{db_to_linear, Sample};

use crate::biquad::{BiquadCoeffs, Cascade6, CASCADE_SECTIONS};
use crate::pole::{interp_pole, remap_to_rate, wrap_angle, MAX_POLE_RADIUS, MIN_POLE_RADIUS};
use crate::shapes::ShapeBank;
use crate::smoothing::{SmoothedParam, SmoothingType};
use crate::{MonoProcessor, Processor};

/// Parameter snapshot supplied wholesale by the control thread each block
#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize)]
pub struct MorphParams {
    /// Index into the bank's morph-pair table
    pub shape_pair: usize,
    /// Position between shape A (0) and shape B (1)
    pub morph_position: Sample,
    /// Resonance strength; scales interpolated pole radii
    pub intensity: Sample,
    /// Input drive in dB ahead of the saturation stage
    pub drive_db: Sample,
    /// Soft-saturation amount (0 = clean)
    pub saturation: Sample,
    /// LFO rate in Hz, advanced at block granularity
    pub lfo_rate_hz: Sample,
    /// LFO depth applied to the morph position
    pub lfo_depth: Sample,
    /// Compensate resonance buildup with 1/(1 + 0.5*intensity)
    pub auto_makeup: bool,
    /// When false, pole angles track `pitch_ratio` so the filter follows the
    /// shifted pitch; when true the formant positions stay put
    pub formant_lock: bool,
    /// Current pitch-shift ratio reported by the shifter stage
    pub pitch_ratio: Sample,
}

impl Default for MorphParams {
    fn default() -> Self {
        Self {
            shape_pair: 0,
            morph_position: 0.5,
            intensity: 0.0,
            drive_db: 0.0,
            saturation: 0.0,
            lfo_rate_hz: 1.0,
            lfo_depth: 0.0,
            auto_makeup: false,
            formant_lock: true,
            pitch_ratio: 1.0,
        }
    }
}

/// Intensity maps to radius scale 0.80..1.00
const RADIUS_SCALE_BASE: Sample = 0.80;
const RADIUS_SCALE_SPAN: Sample = 0.20;

const BYPASS_INTENSITY_EPS: Sample = 1.0e-3;
const BYPASS_DRIVE_DB_EPS: Sample = 1.0e-4;
const BYPASS_SATURATION_EPS: Sample = 1.0e-6;
const BYPASS_LFO_DEPTH_EPS: Sample = 1.0e-6;

/// Morphing 12-pole filter with separate linear and nonlinear stages
#[derive(Debug)]
pub struct SpectralMorphFilter {
    sample_rate: Sample,
    bank: ShapeBank,

    shape_pair: usize,
    morph: SmoothedParam,
    intensity: SmoothedParam,
    drive_db: SmoothedParam,
    saturation: SmoothedParam,
    lfo_rate_hz: Sample,
    lfo_depth: Sample,
    auto_makeup: bool,
    formant_lock: bool,
    pitch_ratio: Sample,

    lfo_phase: Sample,

    left: Cascade6,
    right: Cascade6,
    coeffs: [BiquadCoeffs; CASCADE_SECTIONS],

    /// Bit-exact key of the last coefficient computation; identical inputs
    /// skip the recompute and therefore yield identical coefficients
    last_key: Option<(usize, u64, u64, u64, u64, bool)>,
}

impl SpectralMorphFilter {
    pub fn new(sample_rate: Sample) -> Self {
        let mut filter = Self {
            sample_rate,
            bank: ShapeBank::default(),
            shape_pair: 0,
            morph: SmoothedParam::with_range(0.5, 20.0, sample_rate, SmoothingType::Exponential, 0.0, 1.0),
            intensity: SmoothedParam::with_range(0.0, 20.0, sample_rate, SmoothingType::Exponential, 0.0, 1.0),
            drive_db: SmoothedParam::with_range(0.0, 20.0, sample_rate, SmoothingType::Exponential, -24.0, 24.0),
            saturation: SmoothedParam::with_range(0.0, 20.0, sample_rate, SmoothingType::Exponential, 0.0, 1.0),
            lfo_rate_hz: 1.0,
            lfo_depth: 0.0,
            auto_makeup: false,
            formant_lock: true,
            pitch_ratio: 1.0,
            lfo_phase: 0.0,
            left: Cascade6::new(),
            right: Cascade6::new(),
            coeffs: [BiquadCoeffs::bypass(); CASCADE_SECTIONS],
            last_key: None,
        };
        filter.refresh_coefficients();
        filter
    }

    /// Non-real-time: change the sample rate and rebuild coefficients
    pub fn prepare(&mut self, sample_rate: Sample) {
        let old = self.sample_rate;
        self.sample_rate = sample_rate.max(8000.0);
        for param in [
            &mut self.morph,
            &mut self.intensity,
            &mut self.drive_db,
            &mut self.saturation,
        ] {
            param.set_sample_rate(old, self.sample_rate);
        }
        self.reset();
        self.last_key = None;
        self.refresh_coefficients();
    }

    /// Install a new parameter snapshot. Continuous fields re-target the
    /// smoothers; discrete fields apply immediately (call at block
    /// boundaries only).
    pub fn set_params(&mut self, params: &MorphParams) {
        self.shape_pair = params.shape_pair;
        self.morph.set_target(params.morph_position.clamp(0.0, 1.0));
        self.intensity.set_target(params.intensity.clamp(0.0, 1.0));
        self.drive_db.set_target(params.drive_db.clamp(-24.0, 24.0));
        self.saturation.set_target(params.saturation.clamp(0.0, 1.0));
        self.lfo_rate_hz = params.lfo_rate_hz.clamp(0.02, 8.0);
        self.lfo_depth = params.lfo_depth.clamp(0.0, 1.0);
        self.auto_makeup = params.auto_makeup;
        self.formant_lock = params.formant_lock;
        self.pitch_ratio = if params.pitch_ratio.is_finite() {
            params.pitch_ratio.clamp(0.5, 2.0)
        } else {
            1.0
        };
    }

    /// Snap all smoothers to their targets (prepare/preset loads and tests)
    pub fn snap_params(&mut self) {
        for param in [
            &mut self.morph,
            &mut self.intensity,
            &mut self.drive_db,
            &mut self.saturation,
        ] {
            let t = param.target();
            param.set_immediate(t);
        }
    }

    /// Non-real-time: swap in a fully built shape bank (block boundary only)
    pub fn set_shape_bank(&mut self, bank: ShapeBank) {
        self.bank = bank;
        self.last_key = None;
        self.refresh_coefficients();
    }

    pub fn shape_bank(&self) -> &ShapeBank {
        &self.bank
    }

    /// True when the whole stage is neutral. Callers skip both process
    /// calls entirely in that case, which is what makes bypass exactly
    /// lossless.
    pub fn is_effectively_bypassed(&self) -> bool {
        self.intensity.target() <= BYPASS_INTENSITY_EPS
            && self.intensity.current() <= BYPASS_INTENSITY_EPS
            && self.drive_db.target().abs() <= BYPASS_DRIVE_DB_EPS
            && self.drive_db.current().abs() <= BYPASS_DRIVE_DB_EPS
            && self.saturation.target() <= BYPASS_SATURATION_EPS
            && self.lfo_depth <= BYPASS_LFO_DEPTH_EPS
    }

    /// Current cascade coefficients, in section order
    pub fn section_coeffs(&self) -> [BiquadCoeffs; CASCADE_SECTIONS] {
        self.coeffs
    }

    /// Linear half: advance smoothers/LFO, rebuild coefficients if the
    /// smoothed inputs moved, run the cascade on both channels.
    pub fn process_linear(&mut self, left: &mut [Sample], right: &mut [Sample]) {
        if self.is_effectively_bypassed() {
            return;
        }

        let n = left.len().min(right.len());
        self.update_block(n);

        self.left.process_block(&mut left[..n]);
        self.right.process_block(&mut right[..n]);
    }

    /// Nonlinear half: drive, tanh saturation, optional auto-makeup.
    /// Stateless per sample, so it may run at an oversampled rate.
    pub fn process_nonlinear(&mut self, left: &mut [Sample], right: &mut [Sample]) {
        if self.is_effectively_bypassed() {
            return;
        }

        let drive = db_to_linear(self.drive_db.current());
        let saturation = self.saturation.current();
        let makeup = if self.auto_makeup {
            1.0 / (1.0 + 0.5 * self.intensity.current())
        } else {
            1.0
        };

        for buffer in [left, right] {
            for sample in buffer.iter_mut() {
                *sample = Self::shape_sample(*sample, drive, saturation, makeup);
            }
        }
    }

    #[inline(always)]
    fn shape_sample(input: Sample, drive: Sample, saturation: Sample, makeup: Sample) -> Sample {
        let mut x = input * drive;
        // Soft limit only when the drive actually pushes the level up,
        // rescaled so a hot-but-clean signal keeps its average level
        if drive > 1.0 {
            x = (x * 0.5).tanh() * 2.0;
        }
        if saturation > BYPASS_SATURATION_EPS {
            let pre = 1.0 + saturation * 3.0;
            x = (x * pre).tanh() / pre;
        }
        x * makeup
    }

    fn update_block(&mut self, block_len: usize) {
        // LFO advances at control-block granularity
        self.lfo_phase += 2.0 * PI * self.lfo_rate_hz * block_len as Sample / self.sample_rate;
        if self.lfo_phase > 2.0 * PI {
            self.lfo_phase %= 2.0 * PI;
        }
        let lfo_value = if self.lfo_depth > BYPASS_LFO_DEPTH_EPS {
            self.lfo_phase.sin() * self.lfo_depth
        } else {
            0.0
        };

        let morph_now = (self.morph.advance(block_len) + lfo_value).clamp(0.0, 1.0);
        let intensity_now = self.intensity.advance(block_len);
        self.drive_db.advance(block_len);
        self.saturation.advance(block_len);

        self.update_coefficients(morph_now, intensity_now);
    }

    /// Recompute coefficients from the current smoothed values
    pub fn refresh_coefficients(&mut self) {
        let morph = self.morph.current();
        let intensity = self.intensity.current();
        self.update_coefficients(morph, intensity);
    }

    fn update_coefficients(&mut self, morph_pos: Sample, intensity: Sample) {
        let key = (
            self.shape_pair,
            morph_pos.to_bits(),
            intensity.to_bits(),
            self.sample_rate.to_bits(),
            self.pitch_ratio.to_bits(),
            self.formant_lock,
        );
        if self.last_key == Some(key) {
            return;
        }
        self.last_key = Some(key);

        let (poles_a, poles_b) = {
            let (a, b) = self.bank.pair_shapes(self.shape_pair);
            (a.poles, b.poles)
        };

        let radius_scale = RADIUS_SCALE_BASE + RADIUS_SCALE_SPAN * intensity;

        for i in 0..CASCADE_SECTIONS {
            let mut pole = interp_pole(poles_a[i], poles_b[i], morph_pos);

            pole.radius = (pole.radius * radius_scale).clamp(MIN_POLE_RADIUS, MAX_POLE_RADIUS);

            if !self.formant_lock {
                pole.angle = wrap_angle(pole.angle * self.pitch_ratio);
            }

            let remapped = remap_to_rate(pole, self.sample_rate);
            self.coeffs[i] = BiquadCoeffs::from_pole(remapped);
        }

        self.left.set_coeffs(&self.coeffs);
        self.right.set_coeffs(&self.coeffs);
    }
}

impl Processor for SpectralMorphFilter {
    fn reset(&mut self) {
        self.left.reset();
        self.right.reset();
        self.lfo_phase = 0.0;
        self.morph.reset();
        self.intensity.reset();
        self.drive_db.reset();
        self.saturation.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn active_params() -> MorphParams {
        MorphParams {
            intensity: 0.6,
            drive_db: 3.0,
            saturation: 0.2,
            ..MorphParams::default()
        }
    }

    #[test]
    fn test_default_is_bypassed() {
        let filter = SpectralMorphFilter::new(48000.0);
        assert!(filter.is_effectively_bypassed());
    }

    #[test]
    fn test_bypass_is_lossless() {
        let mut filter = SpectralMorphFilter::new(48000.0);
        let mut left: Vec<Sample> = (0..256).map(|i| (i as f64 * 0.1).sin()).collect();
        let mut right = left.clone();
        let reference = left.clone();

        filter.process_linear(&mut left, &mut right);
        filter.process_nonlinear(&mut left, &mut right);

        for (a, b) in left.iter().zip(reference.iter()) {
            assert_eq!(a, b);
        }
    }

    #[test]
    fn test_active_filter_changes_signal() {
        let mut filter = SpectralMorphFilter::new(48000.0);
        filter.set_params(&active_params());
        filter.snap_params();
        assert!(!filter.is_effectively_bypassed());

        let mut left: Vec<Sample> = (0..512)
            .map(|i| (2.0 * PI * 1000.0 * i as f64 / 48000.0).sin())
            .collect();
        let mut right = left.clone();
        let reference = left.clone();

        filter.process_linear(&mut left, &mut right);

        let diff: Sample = left
            .iter()
            .zip(reference.iter())
            .map(|(a, b)| (a - b).abs())
            .sum();
        assert!(diff > 1e-3, "filter had no effect");
        assert!(left.iter().all(|x| x.is_finite()));
    }

    #[test]
    fn test_pole_stability_grid() {
        for rate in [44100.0, 48000.0, 96000.0] {
            let mut filter = SpectralMorphFilter::new(rate);
            for pair in 0..filter.shape_bank().num_pairs() {
                for m in 0..=10 {
                    for k in 0..=10 {
                        let params = MorphParams {
                            shape_pair: pair,
                            morph_position: m as f64 / 10.0,
                            intensity: k as f64 / 10.0,
                            ..MorphParams::default()
                        };
                        filter.set_params(&params);
                        filter.snap_params();
                        filter.refresh_coefficients();

                        for c in filter.section_coeffs() {
                            assert!(
                                c.is_stable(),
                                "unstable at rate={rate} pair={pair} m={m} k={k}: {c:?}"
                            );
                        }
                    }
                }
            }
        }
    }

    #[test]
    fn test_coefficients_idempotent() {
        let mut filter = SpectralMorphFilter::new(44100.0);
        let params = MorphParams {
            shape_pair: 1,
            morph_position: 0.37,
            intensity: 0.81,
            ..MorphParams::default()
        };
        filter.set_params(&params);
        filter.snap_params();

        filter.refresh_coefficients();
        let first = filter.section_coeffs();
        filter.refresh_coefficients();
        let second = filter.section_coeffs();

        for (a, b) in first.iter().zip(second.iter()) {
            assert_eq!(a, b);
        }
    }

    #[test]
    fn test_resonance_rate_invariant() {
        // The dominant spectral peak must land on (almost) the same Hz at
        // every host rate: that is exactly what the bilinear remap buys.
        let peak_hz = |rate: f64| -> f64 {
            let mut filter = SpectralMorphFilter::new(rate);
            filter.set_params(&MorphParams {
                shape_pair: 0,
                morph_position: 0.3,
                intensity: 0.8,
                ..MorphParams::default()
            });
            filter.snap_params();
            filter.refresh_coefficients();

            let mut best_f = 0.0;
            let mut best_mag = 0.0;
            let mut f = 60.0;
            while f < 8000.0 {
                let omega = 2.0 * PI * f / rate;
                let mag: f64 = filter
                    .section_coeffs()
                    .iter()
                    .map(|c| c.magnitude_at(omega))
                    .product();
                if mag > best_mag {
                    best_mag = mag;
                    best_f = f;
                }
                f += 2.0;
            }
            best_f
        };

        let f48 = peak_hz(48000.0);
        for rate in [44100.0, 96000.0] {
            let f = peak_hz(rate);
            assert!(
                (f - f48).abs() <= 25.0,
                "resonant peak moved: {f48} Hz at 48k vs {f} Hz at {rate}"
            );
        }
    }

    #[test]
    fn test_nonlinear_stays_bounded() {
        let mut filter = SpectralMorphFilter::new(48000.0);
        filter.set_params(&MorphParams {
            intensity: 0.5,
            drive_db: 12.0,
            saturation: 1.0,
            auto_makeup: true,
            ..MorphParams::default()
        });
        filter.snap_params();

        let mut left: Vec<Sample> = (0..1024)
            .map(|i| 1.5 * (2.0 * PI * 220.0 * i as f64 / 48000.0).sin())
            .collect();
        let mut right = left.clone();

        filter.process_nonlinear(&mut left, &mut right);

        for x in left.iter().chain(right.iter()) {
            assert!(x.is_finite());
            assert!(x.abs() <= 2.0, "saturation stage let {x} through");
        }
    }

    #[test]
    fn test_auto_makeup_tames_level() {
        let shaped = |makeup: bool| -> Sample {
            let mut filter = SpectralMorphFilter::new(48000.0);
            filter.set_params(&MorphParams {
                intensity: 1.0,
                drive_db: 0.5,
                auto_makeup: makeup,
                ..MorphParams::default()
            });
            filter.snap_params();

            let mut l = vec![0.5; 64];
            let mut r = vec![0.5; 64];
            filter.process_nonlinear(&mut l, &mut r);
            l[32].abs()
        };

        assert!(shaped(true) < shaped(false));
    }
}
