//! Top-level voice-processing engine
//!
//! `VoiceProcessor` wires the whole chain behind a plain block interface:
//! mono downmix -> pitch estimation -> scale-quantized ratio curve ->
//! sibilant-guard weighting -> per-channel time-domain shifting -> spectral
//! morph filter (nonlinear half optionally oversampled) -> level match ->
//! dry/wet mix. No host-framework coupling; a plugin shell calls `prepare`,
//! `process` and the parameter setters through a thin adapter.
//!
//! Everything in `process` is allocation-free; `prepare`, `set_mode` and
//! preset/bank loading are the non-real-time surfaces.

use serde::{Deserialize, Serialize};
use vm_core::{rms, sanitize_buffer, Sample};
use vm_dsp::morph::{MorphParams, SpectralMorphFilter};
use vm_dsp::oversample::Oversampler;
use vm_dsp::shapes::ShapeBank;
use vm_dsp::Processor;

use crate::estimator::PitchEstimator;
use crate::guard::{AutoGain, SibilantGuard};
use crate::scale::{Bias, CHROMATIC_MASK, MAJOR_MASK, MINOR_MASK};
use crate::shifter::{PitchShifter, ShiftMode};
use crate::{PitchError, PitchResult};

/// Vocal input range presets for the detector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum VocalRange {
    Soprano,
    Alto,
    #[default]
    Tenor,
    Baritone,
    Bass,
}

impl VocalRange {
    /// Detection range in Hz for this voice type
    pub fn range_hz(self) -> (Sample, Sample) {
        match self {
            VocalRange::Soprano => (165.0, 1100.0),
            VocalRange::Alto => (130.0, 880.0),
            VocalRange::Tenor => (98.0, 660.0),
            VocalRange::Baritone => (82.0, 520.0),
            VocalRange::Bass => (65.0, 392.0),
        }
    }
}

/// Quality/latency trade-off for the whole engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum EngineMode {
    /// Grain shifter, no oversampling, zero added latency
    #[default]
    Track,
    /// Variable-rate shifter with the nonlinear stage oversampled 2x
    Print,
}

/// Pitch-correction parameter snapshot
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PitchParams {
    /// Key root, 0 = C .. 11 = B
    pub root_key: u8,
    /// 12-bit scale mask; all bits set disables quantization
    pub scale_mask: u16,
    /// 0 = slow glide, 1 = instant retune
    pub retune_speed01: Sample,
    /// Tie-break direction for notes exactly between scale degrees
    pub bias: Bias,
    /// Detection range in Hz
    pub range_low_hz: Sample,
    pub range_high_hz: Sample,
    /// Hard cap on the applied correction interval
    pub limit_semitones: Sample,
    /// Correction strength 0..1
    pub amount: Sample,
    /// Dry/wet mix 0..1
    pub mix: Sample,
}

impl Default for PitchParams {
    fn default() -> Self {
        let (low, high) = VocalRange::Tenor.range_hz();
        Self {
            root_key: 0,
            scale_mask: MAJOR_MASK,
            retune_speed01: 1.0,
            bias: Bias::Neutral,
            range_low_hz: low,
            range_high_hz: high,
            limit_semitones: 12.0,
            amount: 1.0,
            mix: 1.0,
        }
    }
}

impl PitchParams {
    /// Validate a deserialized parameter set; the engine's setters clamp,
    /// so this only exists for host glue that wants to reject bad presets
    pub fn validate(&self) -> PitchResult<()> {
        if !(self.range_low_hz > 0.0 && self.range_high_hz > self.range_low_hz) {
            return Err(PitchError::InvalidFrequencyRange {
                min: self.range_low_hz,
                max: self.range_high_hz,
            });
        }
        Ok(())
    }
}

/// A complete engine snapshot; `color` is the macro that drives the morph
/// stage the way the original hardware-style presets did
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Preset {
    pub name: String,
    pub mode: EngineMode,
    pub pitch: PitchParams,
    /// Morph-stage macro 0..1: intensity, drive and saturation together
    pub color: Sample,
}

/// Expand the one-knob color macro into full morph parameters
pub fn color_to_morph_params(color: Sample) -> MorphParams {
    let color = color.clamp(0.0, 1.0);
    MorphParams {
        shape_pair: 0,
        morph_position: 0.5,
        intensity: color,
        drive_db: 3.0 * color,
        saturation: (0.25 * color).min(0.35),
        lfo_depth: 0.0,
        auto_makeup: true,
        ..MorphParams::default()
    }
}

/// Factory presets mirroring the live/studio/creative split of the original
pub fn factory_presets() -> Vec<Preset> {
    let tenor = VocalRange::Tenor.range_hz();
    let base = PitchParams {
        range_low_hz: tenor.0,
        range_high_hz: tenor.1,
        ..PitchParams::default()
    };

    vec![
        Preset {
            name: "live_natural".to_string(),
            mode: EngineMode::Track,
            pitch: PitchParams {
                retune_speed01: 0.65,
                amount: 0.70,
                mix: 0.75,
                ..base
            },
            color: 0.18,
        },
        Preset {
            name: "live_tight".to_string(),
            mode: EngineMode::Track,
            pitch: PitchParams {
                retune_speed01: 0.85,
                amount: 0.90,
                mix: 0.90,
                ..base
            },
            color: 0.20,
        },
        Preset {
            name: "live_hard".to_string(),
            mode: EngineMode::Track,
            pitch: PitchParams {
                retune_speed01: 1.0,
                amount: 1.0,
                mix: 1.0,
                scale_mask: CHROMATIC_MASK,
                ..base
            },
            color: 0.25,
        },
        Preset {
            name: "studio_gentle".to_string(),
            mode: EngineMode::Track,
            pitch: PitchParams {
                retune_speed01: 0.40,
                amount: 0.55,
                mix: 0.60,
                ..base
            },
            color: 0.12,
        },
        Preset {
            name: "studio_double".to_string(),
            mode: EngineMode::Print,
            pitch: PitchParams {
                retune_speed01: 0.80,
                amount: 0.85,
                mix: 0.65,
                ..base
            },
            color: 0.22,
        },
        Preset {
            name: "creative_robot".to_string(),
            mode: EngineMode::Track,
            pitch: PitchParams {
                retune_speed01: 1.0,
                amount: 1.0,
                mix: 1.0,
                scale_mask: MINOR_MASK,
                bias: Bias::Down,
                ..base
            },
            color: 0.30,
        },
    ]
}

/// Parse presets from JSON, rejecting entries the engine cannot represent
pub fn presets_from_json(json: &str) -> PitchResult<Vec<Preset>> {
    let presets: Vec<Preset> = serde_json::from_str(json)?;
    for preset in &presets {
        preset.pitch.validate().map_err(|e| PitchError::InvalidPreset {
            name: preset.name.clone(),
            reason: e.to_string(),
        })?;
    }
    Ok(presets)
}

/// The complete real-time voice processor
#[derive(Debug)]
pub struct VoiceProcessor {
    sample_rate: Sample,
    max_block: usize,
    mode: EngineMode,
    auto_gain_enabled: bool,
    sibilant: bool,

    params: PitchParams,
    ratio_limit_low: Sample,
    ratio_limit_high: Sample,

    estimator: PitchEstimator,
    shifter_left: PitchShifter,
    shifter_right: PitchShifter,
    guard: SibilantGuard,
    auto_gain: AutoGain,
    morph: SpectralMorphFilter,
    oversampler: Oversampler,

    mono_buf: Vec<Sample>,
    ratio_buf: Vec<Sample>,
    wet_left: Vec<Sample>,
    wet_right: Vec<Sample>,
}

impl VoiceProcessor {
    pub fn new(sample_rate: Sample, max_block: usize) -> Self {
        let sample_rate = sample_rate.max(8000.0);
        let max_block = max_block.max(64);

        let mut engine = Self {
            sample_rate,
            max_block,
            mode: EngineMode::Track,
            auto_gain_enabled: true,
            sibilant: false,
            params: PitchParams::default(),
            ratio_limit_low: 0.5,
            ratio_limit_high: 2.0,
            estimator: PitchEstimator::new(sample_rate, max_block),
            shifter_left: PitchShifter::new(sample_rate, ShiftMode::Grain),
            shifter_right: PitchShifter::new(sample_rate, ShiftMode::Grain),
            guard: SibilantGuard::new(),
            auto_gain: AutoGain::new(sample_rate),
            morph: SpectralMorphFilter::new(sample_rate),
            oversampler: Oversampler::new(),
            mono_buf: vec![0.0; max_block],
            ratio_buf: vec![1.0; max_block],
            wet_left: vec![0.0; max_block],
            wet_right: vec![0.0; max_block],
        };
        engine.oversampler.prepare(sample_rate, max_block, 1);
        engine.apply_pitch_params();
        engine
    }

    /// Non-real-time: size every internal buffer for the given rate and
    /// maximum block length. Must run before the first `process`.
    pub fn prepare(&mut self, sample_rate: Sample, max_block: usize) {
        self.sample_rate = sample_rate.max(8000.0);
        self.max_block = max_block.max(64);

        log::debug!(
            "prepare: rate {} Hz, max block {}",
            self.sample_rate,
            self.max_block
        );

        self.estimator.prepare(self.sample_rate, self.max_block);
        let shift_mode = self.shift_mode();
        self.shifter_left.prepare(self.sample_rate, shift_mode);
        self.shifter_right.prepare(self.sample_rate, shift_mode);
        self.auto_gain.prepare(self.sample_rate);
        self.morph.prepare(self.sample_rate);
        self.oversampler
            .prepare(self.sample_rate, self.max_block, self.oversample_factor());

        self.mono_buf = vec![0.0; self.max_block];
        self.ratio_buf = vec![1.0; self.max_block];
        self.wet_left = vec![0.0; self.max_block];
        self.wet_right = vec![0.0; self.max_block];

        self.apply_pitch_params();
        self.reset();
    }

    fn shift_mode(&self) -> ShiftMode {
        match self.mode {
            EngineMode::Track => ShiftMode::Grain,
            EngineMode::Print => ShiftMode::HighQuality,
        }
    }

    fn oversample_factor(&self) -> usize {
        match self.mode {
            EngineMode::Track => 1,
            EngineMode::Print => 2,
        }
    }

    /// Non-real-time: switch between Track and Print. Changes the shifter
    /// algorithm and the oversampling factor, so the reported latency
    /// changes; hosts must re-query it.
    pub fn set_mode(&mut self, mode: EngineMode) {
        if mode == self.mode {
            return;
        }
        self.mode = mode;
        let shift_mode = self.shift_mode();
        self.shifter_left.prepare(self.sample_rate, shift_mode);
        self.shifter_right.prepare(self.sample_rate, shift_mode);
        self.oversampler
            .prepare(self.sample_rate, self.max_block, self.oversample_factor());
    }

    pub fn mode(&self) -> EngineMode {
        self.mode
    }

    /// Enable/disable the +/-0.5 dB output level match
    pub fn set_auto_gain(&mut self, enabled: bool) {
        self.auto_gain_enabled = enabled;
    }

    /// Install a pitch-correction snapshot; every field is clamped
    pub fn set_pitch_params(&mut self, params: &PitchParams) {
        self.params = *params;
        self.params.retune_speed01 = params.retune_speed01.clamp(0.0, 1.0);
        self.params.amount = params.amount.clamp(0.0, 1.0);
        self.params.mix = params.mix.clamp(0.0, 1.0);
        self.params.limit_semitones = params.limit_semitones.clamp(0.0, 24.0);
        self.params.root_key %= 12;
        self.apply_pitch_params();
    }

    pub fn pitch_params(&self) -> &PitchParams {
        &self.params
    }

    fn apply_pitch_params(&mut self) {
        self.estimator
            .set_key_scale(self.params.root_key, self.params.scale_mask);
        self.estimator
            .set_retune(self.params.retune_speed01, self.params.bias);
        self.estimator
            .set_range(self.params.range_low_hz, self.params.range_high_hz);

        let limit = self.params.limit_semitones;
        self.ratio_limit_high = 2.0_f64.powf(limit / 12.0).min(4.0);
        self.ratio_limit_low = (1.0 / self.ratio_limit_high).max(0.25);
    }

    /// Set the detection range from a voice-type preset
    pub fn set_vocal_range(&mut self, range: VocalRange) {
        let (low, high) = range.range_hz();
        self.params.range_low_hz = low;
        self.params.range_high_hz = high;
        self.estimator.set_range(low, high);
    }

    /// Install a morph-stage snapshot (continuous fields are smoothed)
    pub fn set_morph_params(&mut self, params: &MorphParams) {
        self.morph.set_params(params);
    }

    /// Non-real-time: swap in a fully built shape bank
    pub fn set_shape_bank(&mut self, bank: ShapeBank) {
        self.morph.set_shape_bank(bank);
    }

    /// Apply a factory or user preset (non-real-time: may change mode)
    pub fn apply_preset(&mut self, preset: &Preset) {
        self.set_mode(preset.mode);
        self.set_pitch_params(&preset.pitch);
        self.morph.set_params(&color_to_morph_params(preset.color));
    }

    /// Algorithmic latency the host must compensate. Zero in Track mode;
    /// in oversampled modes this changes with the factor, so poll it per
    /// block.
    pub fn latency_samples(&self) -> usize {
        self.oversampler.latency_samples() + self.shifter_left.latency()
    }

    /// Last analyzed fundamental (0 while unvoiced), for metering
    pub fn current_f0_hz(&self) -> Sample {
        self.estimator.f0_hz()
    }

    /// Whether the last block was flagged as sibilant, for metering
    pub fn is_sibilant(&self) -> bool {
        self.sibilant
    }

    /// Process one stereo block in place. `left` and `right` must be the
    /// same length and no longer than the prepared maximum; an oversized
    /// block triggers a (non-real-time) re-prepare instead of reading out
    /// of bounds.
    pub fn process(&mut self, left: &mut [Sample], right: &mut [Sample]) {
        let n = left.len().min(right.len());
        if n == 0 {
            return;
        }
        if n > self.max_block {
            debug_assert!(false, "block of {n} exceeds prepared capacity {}", self.max_block);
            let rate = self.sample_rate;
            self.prepare(rate, n);
        }

        sanitize_buffer(&mut left[..n]);
        sanitize_buffer(&mut right[..n]);

        // Mono downmix feeds the detector
        for i in 0..n {
            self.mono_buf[i] = 0.5 * (left[i] + right[i]);
        }

        let (f0, confidence, sibilant) = {
            let block = self.estimator.analyze(&self.mono_buf[..n]);
            self.ratio_buf[..n].copy_from_slice(block.ratio);
            (block.f0_hz, block.confidence, block.sibilant)
        };

        // Correction strength: user amount, derated on sibilants
        self.sibilant = sibilant;
        let guard_weight = self.guard.weight(&self.mono_buf[..n]);
        let applied = (self.params.amount * guard_weight).clamp(0.0, 1.0);

        for slot in self.ratio_buf[..n].iter_mut() {
            let blended = 1.0 + (*slot - 1.0) * applied;
            *slot = blended.clamp(self.ratio_limit_low, self.ratio_limit_high);
        }

        // Time-domain shift into the wet path, per channel
        self.shifter_left.process_block(
            &left[..n],
            &mut self.wet_left[..n],
            &self.ratio_buf[..n],
            f0,
            confidence,
        );
        self.shifter_right.process_block(
            &right[..n],
            &mut self.wet_right[..n],
            &self.ratio_buf[..n],
            f0,
            confidence,
        );

        // Spectral color on the wet path only; skipping a bypassed filter
        // entirely is what makes the neutral setting exactly lossless
        if !self.morph.is_effectively_bypassed() {
            self.morph
                .process_linear(&mut self.wet_left[..n], &mut self.wet_right[..n]);

            let morph = &mut self.morph;
            self.oversampler.process(
                |l, r| morph.process_nonlinear(l, r),
                &mut self.wet_left[..n],
                &mut self.wet_right[..n],
            );
        }

        // Honest level match against the dry input
        if self.auto_gain_enabled {
            let rms_dry = rms(&self.mono_buf[..n]);
            let mut wet_sq = 0.0;
            for i in 0..n {
                let m = 0.5 * (self.wet_left[i] + self.wet_right[i]);
                wet_sq += m * m;
            }
            let rms_wet = (wet_sq / n as Sample).sqrt();
            let gain = self.auto_gain.compute(rms_wet, rms_dry, n);
            for i in 0..n {
                self.wet_left[i] *= gain;
                self.wet_right[i] *= gain;
            }
        }

        // Dry/wet mix back into the caller's buffers
        let mix = self.params.mix;
        for i in 0..n {
            left[i] = mix * self.wet_left[i] + (1.0 - mix) * left[i];
            right[i] = mix * self.wet_right[i] + (1.0 - mix) * right[i];
        }

        sanitize_buffer(&mut left[..n]);
        sanitize_buffer(&mut right[..n]);
    }

    /// Mono variant of [`process`](Self::process): same chain, single
    /// channel (the right-channel state stays untouched).
    pub fn process_mono(&mut self, buffer: &mut [Sample]) {
        let n = buffer.len();
        if n == 0 {
            return;
        }
        if n > self.max_block {
            debug_assert!(false, "block of {n} exceeds prepared capacity {}", self.max_block);
            let rate = self.sample_rate;
            self.prepare(rate, n);
        }

        sanitize_buffer(&mut buffer[..n]);
        self.mono_buf[..n].copy_from_slice(&buffer[..n]);

        let (f0, confidence, sibilant) = {
            let block = self.estimator.analyze(&self.mono_buf[..n]);
            self.ratio_buf[..n].copy_from_slice(block.ratio);
            (block.f0_hz, block.confidence, block.sibilant)
        };
        self.sibilant = sibilant;

        let guard_weight = self.guard.weight(&self.mono_buf[..n]);
        let applied = (self.params.amount * guard_weight).clamp(0.0, 1.0);
        for slot in self.ratio_buf[..n].iter_mut() {
            let blended = 1.0 + (*slot - 1.0) * applied;
            *slot = blended.clamp(self.ratio_limit_low, self.ratio_limit_high);
        }

        self.shifter_left.process_block(
            &buffer[..n],
            &mut self.wet_left[..n],
            &self.ratio_buf[..n],
            f0,
            confidence,
        );
        // The morph cascade is stereo; mirror the mono wet path through it
        self.wet_right[..n].copy_from_slice(&self.wet_left[..n]);

        if !self.morph.is_effectively_bypassed() {
            self.morph
                .process_linear(&mut self.wet_left[..n], &mut self.wet_right[..n]);
            let morph = &mut self.morph;
            self.oversampler.process(
                |l, r| morph.process_nonlinear(l, r),
                &mut self.wet_left[..n],
                &mut self.wet_right[..n],
            );
        }

        if self.auto_gain_enabled {
            let rms_dry = rms(&self.mono_buf[..n]);
            let rms_wet = rms(&self.wet_left[..n]);
            let gain = self.auto_gain.compute(rms_wet, rms_dry, n);
            for x in self.wet_left[..n].iter_mut() {
                *x *= gain;
            }
        }

        let mix = self.params.mix;
        for i in 0..n {
            buffer[i] = mix * self.wet_left[i] + (1.0 - mix) * buffer[i];
        }
        sanitize_buffer(&mut buffer[..n]);
    }
}

impl Processor for VoiceProcessor {
    fn reset(&mut self) {
        self.estimator.reset();
        self.shifter_left.reset();
        self.shifter_right.reset();
        self.guard.reset();
        self.auto_gain.reset();
        self.morph.reset();
        self.oversampler.reset();
        self.sibilant = false;
        self.mono_buf.fill(0.0);
        self.ratio_buf.fill(1.0);
        self.wet_left.fill(0.0);
        self.wet_right.fill(0.0);
    }

    fn latency(&self) -> usize {
        self.latency_samples()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_factory_presets_are_valid() {
        let presets = factory_presets();
        assert!(presets.len() >= 6);
        for preset in &presets {
            preset.pitch.validate().expect("factory preset must validate");
            assert!((0.0..=1.0).contains(&preset.color));
        }
    }

    #[test]
    fn test_preset_json_roundtrip() {
        let presets = factory_presets();
        let json = serde_json::to_string(&presets).unwrap();
        let back = presets_from_json(&json).unwrap();
        assert_eq!(back.len(), presets.len());
        assert_eq!(back[0].name, presets[0].name);
    }

    #[test]
    fn test_preset_json_rejects_bad_range() {
        let json = r#"[{
            "name": "broken",
            "mode": "Track",
            "pitch": {
                "root_key": 0, "scale_mask": 4095, "retune_speed01": 1.0,
                "bias": "Neutral", "range_low_hz": 500.0, "range_high_hz": 100.0,
                "limit_semitones": 12.0, "amount": 1.0, "mix": 1.0
            },
            "color": 0.2
        }]"#;
        assert!(matches!(
            presets_from_json(json),
            Err(PitchError::InvalidPreset { .. })
        ));
    }

    #[test]
    fn test_latency_by_mode() {
        let mut engine = VoiceProcessor::new(48000.0, 512);
        assert_eq!(engine.latency_samples(), 0);

        engine.set_mode(EngineMode::Print);
        // 2x half-band group delay plus the HQ shifter's read-head guard
        assert!(engine.latency_samples() > 0);

        engine.set_mode(EngineMode::Track);
        assert_eq!(engine.latency_samples(), 0);
    }

    #[test]
    fn test_setters_clamp() {
        let mut engine = VoiceProcessor::new(48000.0, 512);
        engine.set_pitch_params(&PitchParams {
            retune_speed01: 7.0,
            amount: -3.0,
            mix: 42.0,
            root_key: 23,
            ..PitchParams::default()
        });
        let p = engine.pitch_params();
        assert_eq!(p.retune_speed01, 1.0);
        assert_eq!(p.amount, 0.0);
        assert_eq!(p.mix, 1.0);
        assert!(p.root_key < 12);
    }

    #[test]
    fn test_zero_length_block_is_noop() {
        let mut engine = VoiceProcessor::new(48000.0, 512);
        let mut left: [Sample; 0] = [];
        let mut right: [Sample; 0] = [];
        engine.process(&mut left, &mut right);
    }

    #[test]
    fn test_mono_neutral_passthrough() {
        let mut engine = VoiceProcessor::new(48000.0, 256);
        engine.set_pitch_params(&PitchParams {
            scale_mask: CHROMATIC_MASK,
            amount: 0.0,
            ..PitchParams::default()
        });
        engine.set_auto_gain(false);

        // Unvoiced noise input: the mono path must hand it back untouched
        let mut state = 0xabad1deau32;
        for _ in 0..10 {
            let dry: Vec<Sample> = (0..256)
                .map(|_| {
                    state ^= state << 13;
                    state ^= state >> 17;
                    state ^= state << 5;
                    ((state as f64 / u32::MAX as f64) * 2.0 - 1.0) * 0.25
                })
                .collect();
            let mut buffer = dry.clone();
            engine.process_mono(&mut buffer);
            for (a, b) in buffer.iter().zip(dry.iter()) {
                assert!((a - b).abs() < 1e-9);
            }
        }
    }
}
