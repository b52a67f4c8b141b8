//! Normalized-autocorrelation pitch estimation
//!
//! Frame-based NSDF (McLeod-style) F0 tracking over a sliding 1024-sample
//! window with a 256-sample hop. The analysis input is band-pass
//! pre-filtered around the running F0 estimate to keep breath noise and
//! rumble out of the correlation. Octave errors are avoided by taking the
//! first correlation peak within 90% of the tallest one rather than the
//! tallest outright; F0 is smoothed with a ~30 ms exponential and decays
//! toward silence on unvoiced frames instead of snapping to zero.
//!
//! `analyze` also produces the per-sample correction ratio curve: the
//! smoothed F0 is quantized to the configured scale, chased at the retune
//! speed in MIDI space, and the resulting target/actual ratio is smoothed
//! per sample. Analysis can never fail; degenerate input reports unvoiced.

use vm_core::{sanitize, Sample};
use vm_dsp::biquad::{BiquadCoeffs, BiquadTDF2};
use vm_dsp::{MonoProcessor, Processor};

use crate::scale::{Bias, ScaleQuantizer};
use crate::{freq_to_midi, midi_to_freq, PitchBlock};

/// Analysis frame length in samples
pub const FRAME_SIZE: usize = 1024;

/// Analysis hop in samples
pub const HOP_SIZE: usize = 256;

/// NSDF peak strength required to call a frame voiced
pub const CONFIDENCE_THRESHOLD: Sample = 0.6;

/// HF/full energy ratio above which a block is flagged sibilant
const SIBILANT_RATIO: Sample = 0.35;

/// Monophonic F0 tracker and correction-curve generator
#[derive(Debug)]
pub struct PitchEstimator {
    sample_rate: Sample,

    // configuration
    min_freq: Sample,
    max_freq: Sample,
    min_tau: usize,
    max_tau: usize,
    retune_speed01: Sample,
    quantizer: ScaleQuantizer,

    // sliding frame
    frame: Vec<Sample>,
    write: usize,
    filled: usize,
    hop_count: usize,

    // scratch (pre-sized, never grown on the audio thread)
    x_scratch: Vec<Sample>,
    energy_prefix: Vec<Sample>,
    nsdf: Vec<Sample>,

    // analysis pre-filter
    prefilter: BiquadTDF2,

    // tracking state
    f0_smooth: Sample,
    confidence: Sample,
    last_midi: Sample,
    have_midi: bool,

    // ratio curve
    ratio_buf: Vec<Sample>,
    prev_ratio: Sample,

    // sibilance detector (one-pole HP split)
    hp_state: Sample,
    hp_prev: Sample,
    sibilant: bool,
}

impl PitchEstimator {
    pub fn new(sample_rate: Sample, max_block: usize) -> Self {
        let mut estimator = Self {
            sample_rate: sample_rate.max(8000.0),
            min_freq: 70.0,
            max_freq: 800.0,
            min_tau: 2,
            max_tau: FRAME_SIZE - 2,
            retune_speed01: 0.6,
            quantizer: ScaleQuantizer::default(),
            frame: vec![0.0; FRAME_SIZE],
            write: 0,
            filled: 0,
            hop_count: 0,
            x_scratch: vec![0.0; FRAME_SIZE],
            energy_prefix: vec![0.0; FRAME_SIZE + 1],
            nsdf: vec![0.0; FRAME_SIZE],
            prefilter: BiquadTDF2::new(),
            f0_smooth: 0.0,
            confidence: 0.0,
            last_midi: 0.0,
            have_midi: false,
            ratio_buf: vec![1.0; max_block.max(64)],
            prev_ratio: 1.0,
            hp_state: 0.0,
            hp_prev: 0.0,
            sibilant: false,
        };
        estimator.set_range(70.0, 800.0);
        estimator
    }

    /// Non-real-time: resize for a new maximum block length
    pub fn prepare(&mut self, sample_rate: Sample, max_block: usize) {
        self.sample_rate = sample_rate.max(8000.0);
        self.ratio_buf = vec![1.0; max_block.max(64)];
        let (min_freq, max_freq) = (self.min_freq, self.max_freq);
        self.set_range(min_freq, max_freq);
        self.reset();
    }

    /// Set the key root and 12-bit scale mask for correction targets
    pub fn set_key_scale(&mut self, root_key: u8, mask: u16) {
        self.quantizer.set_key_scale(root_key, mask);
    }

    /// Retune speed (0 = slow glide, 1 = instant) and tie-break bias
    pub fn set_retune(&mut self, speed01: Sample, bias: Bias) {
        self.retune_speed01 = speed01.clamp(0.0, 1.0);
        self.quantizer.set_bias(bias);
    }

    /// Detection range in Hz; the lag window is derived from it and clamped
    /// to what the analysis frame can resolve
    pub fn set_range(&mut self, min_freq: Sample, max_freq: Sample) {
        self.min_freq = min_freq.clamp(20.0, 2000.0);
        self.max_freq = max_freq.clamp(self.min_freq + 1.0, 4000.0);

        let min_tau = (self.sample_rate / self.max_freq).floor() as usize;
        let max_tau = (self.sample_rate / self.min_freq).ceil() as usize;
        self.min_tau = min_tau.clamp(2, FRAME_SIZE / 2);
        self.max_tau = max_tau.clamp(self.min_tau + 2, FRAME_SIZE - 2);
    }

    pub fn f0_hz(&self) -> Sample {
        self.f0_smooth
    }

    pub fn confidence(&self) -> Sample {
        self.confidence
    }

    /// Run once per audio block on the mono analysis signal.
    pub fn analyze(&mut self, input: &[Sample]) -> PitchBlock<'_> {
        let n = input.len().min(self.ratio_buf.len());

        // Track the running F0 with the analysis pre-filter; fall back to a
        // wide mid-band when the pitch is still unknown
        let (center, q) = if self.f0_smooth > 0.0 {
            (self.f0_smooth, 2.5)
        } else {
            (200.0, 0.8)
        };
        self.prefilter
            .set_coeffs(BiquadCoeffs::bandpass(center, q, self.sample_rate));

        for &raw in &input[..n] {
            let x = sanitize(raw);
            let filtered = self.prefilter.process_sample(x);
            self.frame[self.write] = filtered;
            self.write = (self.write + 1) % FRAME_SIZE;
            if self.filled < FRAME_SIZE {
                self.filled += 1;
            }
        }

        self.hop_count += n;
        if self.hop_count >= HOP_SIZE {
            self.hop_count %= HOP_SIZE;
            if self.filled == FRAME_SIZE {
                self.analyze_frame();
            }
        }

        self.update_ratio_curve(n);
        self.measure_sibilance(&input[..n]);

        PitchBlock {
            ratio: &self.ratio_buf[..n],
            f0_hz: self.f0_smooth,
            confidence: self.confidence,
            voiced: self.f0_smooth > 0.0,
            sibilant: self.sibilant,
        }
    }

    /// Unwrap the ring into chronological order
    fn unwrap_frame(&mut self) {
        let tail = FRAME_SIZE - self.write;
        self.x_scratch[..tail].copy_from_slice(&self.frame[self.write..]);
        self.x_scratch[tail..].copy_from_slice(&self.frame[..self.write]);
    }

    fn analyze_frame(&mut self) {
        self.unwrap_frame();

        // Prefix energy makes both window energies O(1) per lag
        self.energy_prefix[0] = 0.0;
        for i in 0..FRAME_SIZE {
            self.energy_prefix[i + 1] = self.energy_prefix[i] + self.x_scratch[i] * self.x_scratch[i];
        }

        // Lags below min_tau are still computed: the zero-crossing scan
        // that delimits the initial correlation lobe has to start near 0
        for tau in 2..=self.max_tau {
            let len = FRAME_SIZE - tau;
            let mut ac = 0.0;
            for i in 0..len {
                ac += self.x_scratch[i] * self.x_scratch[i + tau];
            }
            let e0 = self.energy_prefix[len];
            let et = self.energy_prefix[tau + len] - self.energy_prefix[tau];
            self.nsdf[tau] = 2.0 * ac / (e0 + et + 1e-12);
        }

        // Skip the initial lobe: past the first positive region and the
        // following negative region
        let mut zc = 2;
        while zc <= self.max_tau && self.nsdf[zc] > 0.0 {
            zc += 1;
        }
        while zc <= self.max_tau && self.nsdf[zc] < 0.0 {
            zc += 1;
        }

        let start = zc.max(self.min_tau + 1);
        let mut global_max: Sample = -1.0;
        for tau in start..self.max_tau {
            let v = self.nsdf[tau];
            if v > 0.0 && v > self.nsdf[tau - 1] && v >= self.nsdf[tau + 1] && v > global_max {
                global_max = v;
            }
        }

        if global_max < CONFIDENCE_THRESHOLD {
            // Unvoiced: decay toward silence, never snap
            self.f0_smooth *= 0.98;
            if self.f0_smooth < 1.0 {
                self.f0_smooth = 0.0;
                self.have_midi = false;
            }
            self.confidence *= 0.85;
            return;
        }

        // Octave-error correction: a periodic signal peaks at every multiple
        // of its period, so the FIRST local maximum within 90% of the global
        // one is the fundamental lag; taking the tallest outright risks
        // landing on a later multiple (an octave down)
        let pick_threshold = 0.90 * global_max;
        let mut best = 0usize;
        let mut best_value: Sample = 0.0;
        for tau in start..self.max_tau {
            let v = self.nsdf[tau];
            if v >= pick_threshold && v > self.nsdf[tau - 1] && v >= self.nsdf[tau + 1] {
                best = tau;
                best_value = v;
                break;
            }
        }
        if best == 0 {
            self.confidence *= 0.85;
            return;
        }

        let tau_refined = self.parabolic_interpolation(best);
        let f0 = self.sample_rate / tau_refined;

        if f0 < self.min_freq * 0.5 || f0 > self.max_freq * 2.0 {
            self.confidence *= 0.85;
            return;
        }

        // ~30 ms exponential smoothing at the hop rate
        if self.f0_smooth <= 0.0 {
            self.f0_smooth = f0;
        } else {
            let a = 1.0 - (-(HOP_SIZE as Sample) / self.sample_rate / 0.03).exp();
            self.f0_smooth += a * (f0 - self.f0_smooth);
        }
        self.confidence = best_value.clamp(0.0, 1.0);

        if !self.have_midi {
            self.last_midi = freq_to_midi(self.f0_smooth);
            self.have_midi = true;
        }
    }

    fn parabolic_interpolation(&self, tau: usize) -> Sample {
        if tau <= self.min_tau || tau >= self.max_tau {
            return tau as Sample;
        }
        let s0 = self.nsdf[tau - 1];
        let s1 = self.nsdf[tau];
        let s2 = self.nsdf[tau + 1];
        let denom = 2.0 * (2.0 * s1 - s0 - s2);
        if denom.abs() < 1e-12 {
            return tau as Sample;
        }
        let adjustment = (s2 - s0) / denom;
        if adjustment.is_finite() && adjustment.abs() < 1.0 {
            tau as Sample + adjustment
        } else {
            tau as Sample
        }
    }

    /// Retune-speed mapping: 0 -> 350 ms glide, 1 -> 5 ms (effectively hard)
    fn retune_tau_seconds(speed01: Sample) -> Sample {
        const T_MIN: Sample = 0.005;
        const T_MAX: Sample = 0.35;
        T_MAX * (T_MIN / T_MAX).powf(speed01.clamp(0.0, 1.0))
    }

    fn update_ratio_curve(&mut self, n: usize) {
        let ratio_target = if self.f0_smooth > 0.0 {
            let raw_midi = freq_to_midi(self.f0_smooth);
            let target_midi = self.quantizer.snap(raw_midi);

            let tau = Self::retune_tau_seconds(self.retune_speed01);
            let dt = n as Sample / self.sample_rate;
            if tau < 0.0007 {
                self.last_midi = target_midi;
            } else {
                let a = 1.0 - (-dt / tau).exp();
                self.last_midi += a * (target_midi - self.last_midi);
            }

            let f_target = midi_to_freq(self.last_midi);
            f_target / self.f0_smooth
        } else {
            1.0
        };
        let ratio_target = if ratio_target.is_finite() {
            ratio_target.clamp(0.25, 4.0)
        } else {
            1.0
        };

        // ~20 ms per-sample glide keeps the curve zipper-free
        let a = 1.0 - (-1.0 / (0.02 * self.sample_rate)).exp();
        let mut r = self.prev_ratio;
        for slot in self.ratio_buf[..n].iter_mut() {
            r += a * (ratio_target - r);
            *slot = r.clamp(0.25, 4.0);
        }
        self.prev_ratio = r;
    }

    fn measure_sibilance(&mut self, input: &[Sample]) {
        // One-pole high-pass split at ~7 kHz (scaled with the sample rate)
        let f_split = 7000.0 * (self.sample_rate / 48000.0);
        let c = (-2.0 * std::f64::consts::PI * f_split / self.sample_rate).exp();

        let mut full = 1e-12;
        let mut high = 1e-12;
        let mut y = self.hp_state;
        for &raw in input {
            let x = sanitize(raw);
            y = c * y + c * (x - self.hp_prev);
            self.hp_prev = x;
            full += x * x;
            high += y * y;
        }
        self.hp_state = y;

        let n = input.len().max(1) as Sample;
        let hf_ratio = (high / n).sqrt() / (full / n).sqrt().max(1e-6);
        self.sibilant = hf_ratio > SIBILANT_RATIO;
    }
}

impl Processor for PitchEstimator {
    fn reset(&mut self) {
        self.frame.fill(0.0);
        self.write = 0;
        self.filled = 0;
        self.hop_count = 0;
        self.prefilter.reset();
        self.f0_smooth = 0.0;
        self.confidence = 0.0;
        self.last_midi = 0.0;
        self.have_midi = false;
        self.ratio_buf.fill(1.0);
        self.prev_ratio = 1.0;
        self.hp_state = 0.0;
        self.hp_prev = 0.0;
        self.sibilant = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scale::CHROMATIC_MASK;

    fn run_sine(estimator: &mut PitchEstimator, freq: Sample, blocks: usize, block: usize) -> (Sample, Sample) {
        let mut phase = 0.0;
        let step = 2.0 * std::f64::consts::PI * freq / 48000.0;
        let mut f0 = 0.0;
        let mut last_ratio = 1.0;
        for _ in 0..blocks {
            let input: Vec<Sample> = (0..block)
                .map(|_| {
                    phase += step;
                    (phase as Sample).sin()
                })
                .collect();
            let result = estimator.analyze(&input);
            f0 = result.f0_hz;
            last_ratio = *result.ratio.last().unwrap();
        }
        (f0, last_ratio)
    }

    #[test]
    fn test_detects_sine_frequency() {
        let mut estimator = PitchEstimator::new(48000.0, 256);
        let (f0, _) = run_sine(&mut estimator, 220.0, 40, 256);
        assert!(
            (f0 - 220.0).abs() < 4.0,
            "expected ~220 Hz, got {f0}"
        );
        assert!(estimator.confidence() > 0.8);
    }

    #[test]
    fn test_chromatic_instant_ratio_converges_to_unity() {
        let mut estimator = PitchEstimator::new(48000.0, 256);
        estimator.set_key_scale(0, CHROMATIC_MASK);
        estimator.set_retune(1.0, Bias::Neutral);

        // ~0.25 s of a pure tone: well past the startup transient
        let (_, ratio) = run_sine(&mut estimator, 220.0, 48, 256);
        assert!(
            (ratio - 1.0).abs() < 0.01,
            "ratio did not settle at unity: {ratio}"
        );
    }

    #[test]
    fn test_silence_is_unvoiced() {
        let mut estimator = PitchEstimator::new(48000.0, 256);
        let silence = vec![0.0; 256];
        let mut voiced = true;
        for _ in 0..20 {
            let result = estimator.analyze(&silence);
            voiced = result.voiced;
        }
        assert!(!voiced);
    }

    #[test]
    fn test_noise_is_unvoiced_with_unity_ratio() {
        let mut estimator = PitchEstimator::new(48000.0, 256);

        // Deterministic white-ish noise
        let mut state = 0x12345678u32;
        let mut next = || {
            state ^= state << 13;
            state ^= state >> 17;
            state ^= state << 5;
            (state as f64 / u32::MAX as f64) * 2.0 - 1.0
        };

        let mut all_ratios_near_unity = true;
        let mut voiced_any = false;
        for _ in 0..60 {
            let input: Vec<Sample> = (0..256).map(|_| next()).collect();
            let result = estimator.analyze(&input);
            voiced_any |= result.voiced;
            for &r in result.ratio {
                if (r - 1.0).abs() > 0.05 {
                    all_ratios_near_unity = false;
                }
            }
        }
        assert!(!voiced_any, "broadband noise must not read as voiced");
        assert!(all_ratios_near_unity);
    }

    #[test]
    fn test_nan_input_does_not_poison_state() {
        let mut estimator = PitchEstimator::new(48000.0, 256);
        let poisoned = vec![f64::NAN; 256];
        let result = estimator.analyze(&poisoned);
        assert!(result.f0_hz.is_finite());
        for &r in result.ratio {
            assert!(r.is_finite());
        }
    }

    #[test]
    fn test_f0_decays_after_voicing_stops() {
        let mut estimator = PitchEstimator::new(48000.0, 256);
        let (f0_voiced, _) = run_sine(&mut estimator, 220.0, 40, 256);
        assert!(f0_voiced > 0.0);

        let silence = vec![0.0; 256];
        let mut f0 = f0_voiced;
        for _ in 0..400 {
            f0 = estimator.analyze(&silence).f0_hz;
        }
        assert_eq!(f0, 0.0, "f0 must decay to silence, got {f0}");
    }

    #[test]
    fn test_sibilant_flag_on_hf_content() {
        let mut estimator = PitchEstimator::new(48000.0, 256);
        // Alternating-sign signal = all energy at Nyquist
        let hiss: Vec<Sample> = (0..256).map(|i| if i % 2 == 0 { 0.5 } else { -0.5 }).collect();
        let mut sibilant = false;
        for _ in 0..10 {
            sibilant = estimator.analyze(&hiss).sibilant;
        }
        assert!(sibilant);

        estimator.reset();
        let low: Vec<Sample> = (0..256)
            .map(|i| (2.0 * std::f64::consts::PI * 150.0 * i as f64 / 48000.0).sin())
            .collect();
        let mut sibilant = true;
        for _ in 0..10 {
            sibilant = estimator.analyze(&low).sibilant;
        }
        assert!(!sibilant);
    }
}
