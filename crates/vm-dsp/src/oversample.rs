//! Half-band oversampling wrapper
//!
//! Runs a nonlinear stage at 2x or 4x the host rate to keep the harmonics it
//! generates below Nyquist, then filters back down. Each doubling goes
//! through a symmetric half-band FIR (windowed sinc: every second tap is
//! zero, center tap 0.5), so the group delay is exact and reportable.
//! Factor 1 is a strict pass-through with zero added latency.
//!
//! Mixing factors within a running stream is not glitch-safe; change the
//! factor only through a `prepare` re-entry.

use vm_core::Sample;

use crate::Processor;

/// Half-band FIR length (odd, center at HALF_BAND_DELAY)
const HALF_BAND_TAPS: usize = 33;

/// Group delay of one half-band stage, in samples at that stage's high rate
const HALF_BAND_DELAY: usize = (HALF_BAND_TAPS - 1) / 2;

/// Maximum supported oversampling factor
pub const MAX_FACTOR: usize = 4;

fn half_band_taps() -> [Sample; HALF_BAND_TAPS] {
    let mut taps = [0.0; HALF_BAND_TAPS];
    let center = HALF_BAND_DELAY as isize;
    for (n, tap) in taps.iter_mut().enumerate() {
        let k = n as isize - center;
        let x = k as Sample;
        // Ideal half-band impulse response, Blackman-windowed
        let sinc = if k == 0 {
            0.5
        } else {
            (std::f64::consts::FRAC_PI_2 * x).sin() / (std::f64::consts::PI * x)
        };
        let w = 0.42
            - 0.5 * (std::f64::consts::PI * (n as Sample) / (HALF_BAND_TAPS - 1) as Sample * 2.0).cos()
            + 0.08 * (2.0 * std::f64::consts::PI * (n as Sample) / (HALF_BAND_TAPS - 1) as Sample * 2.0).cos();
        *tap = sinc * w;
    }
    // Exact half-band structure: zero the even offsets, pin the center
    for (n, tap) in taps.iter_mut().enumerate() {
        let k = n as isize - center;
        if k != 0 && k % 2 == 0 {
            *tap = 0.0;
        }
    }
    taps[HALF_BAND_DELAY] = 0.5;
    // Normalize DC gain to exactly 1
    let sum: Sample = taps.iter().sum();
    for tap in taps.iter_mut() {
        *tap /= sum;
    }
    taps
}

/// One 2x up/down stage with independent delay lines for each direction
#[derive(Debug, Clone)]
struct HalfBandStage {
    taps: [Sample; HALF_BAND_TAPS],
    up_state: [Sample; HALF_BAND_TAPS],
    up_pos: usize,
    down_state: [Sample; HALF_BAND_TAPS],
    down_pos: usize,
}

impl HalfBandStage {
    fn new() -> Self {
        Self {
            taps: half_band_taps(),
            up_state: [0.0; HALF_BAND_TAPS],
            up_pos: 0,
            down_state: [0.0; HALF_BAND_TAPS],
            down_pos: 0,
        }
    }

    fn reset(&mut self) {
        self.up_state = [0.0; HALF_BAND_TAPS];
        self.down_state = [0.0; HALF_BAND_TAPS];
        self.up_pos = 0;
        self.down_pos = 0;
    }

    #[inline]
    fn convolve(state: &[Sample; HALF_BAND_TAPS], pos: usize, taps: &[Sample; HALF_BAND_TAPS]) -> Sample {
        // state[pos] is the newest sample; taps applied newest-first
        let mut acc = 0.0;
        let mut idx = pos;
        for &tap in taps.iter() {
            acc += tap * state[idx];
            idx = if idx == 0 { HALF_BAND_TAPS - 1 } else { idx - 1 };
        }
        acc
    }

    #[inline]
    fn push_up(&mut self, x: Sample) -> Sample {
        self.up_pos = (self.up_pos + 1) % HALF_BAND_TAPS;
        self.up_state[self.up_pos] = x;
        Self::convolve(&self.up_state, self.up_pos, &self.taps)
    }

    #[inline]
    fn push_down(&mut self, x: Sample) -> Sample {
        self.down_pos = (self.down_pos + 1) % HALF_BAND_TAPS;
        self.down_state[self.down_pos] = x;
        Self::convolve(&self.down_state, self.down_pos, &self.taps)
    }

    /// Zero-stuff and filter: `input[..n]` -> `output[..2n]`
    fn upsample(&mut self, input: &[Sample], output: &mut [Sample]) {
        debug_assert!(output.len() >= input.len() * 2);
        for (i, &x) in input.iter().enumerate() {
            // x2 gain compensates the energy lost to zero insertion
            output[i * 2] = 2.0 * self.push_up(x);
            output[i * 2 + 1] = 2.0 * self.push_up(0.0);
        }
    }

    /// Filter and decimate: `input[..2n]` -> `output[..n]`
    fn downsample(&mut self, input: &[Sample], output: &mut [Sample]) {
        debug_assert!(input.len() >= output.len() * 2);
        for (i, out) in output.iter_mut().enumerate() {
            let y = self.push_down(input[i * 2]);
            self.push_down(input[i * 2 + 1]);
            *out = y;
        }
    }
}

/// Stereo oversampling wrapper for a nonlinear in-place block callback
#[derive(Debug)]
pub struct Oversampler {
    factor: usize,
    max_block: usize,
    stages_l: Vec<HalfBandStage>,
    stages_r: Vec<HalfBandStage>,
    // Ping-pong work buffers sized for the highest rate
    work_a_l: Vec<Sample>,
    work_a_r: Vec<Sample>,
    work_b_l: Vec<Sample>,
    work_b_r: Vec<Sample>,
}

impl Oversampler {
    pub fn new() -> Self {
        let mut os = Self {
            factor: 1,
            max_block: 0,
            stages_l: Vec::new(),
            stages_r: Vec::new(),
            work_a_l: Vec::new(),
            work_a_r: Vec::new(),
            work_b_l: Vec::new(),
            work_b_r: Vec::new(),
        };
        os.prepare(48000.0, 512, 1);
        os
    }

    /// Non-real-time: size buffers and build the stage chain.
    /// Factors other than 1, 2 or 4 clamp to the nearest supported value.
    pub fn prepare(&mut self, _sample_rate: Sample, max_block: usize, factor: usize) {
        self.factor = match factor {
            0 | 1 => 1,
            2 | 3 => 2,
            _ => 4,
        };
        self.max_block = max_block.max(1);

        let num_stages = self.factor.trailing_zeros() as usize;
        self.stages_l = (0..num_stages).map(|_| HalfBandStage::new()).collect();
        self.stages_r = (0..num_stages).map(|_| HalfBandStage::new()).collect();

        let cap = self.max_block * MAX_FACTOR;
        self.work_a_l = vec![0.0; cap];
        self.work_a_r = vec![0.0; cap];
        self.work_b_l = vec![0.0; cap];
        self.work_b_r = vec![0.0; cap];
    }

    pub fn factor(&self) -> usize {
        self.factor
    }

    /// Algorithmic latency added at the base rate. Zero at factor 1; each
    /// half-band stage contributes its group delay through the up and down
    /// paths (16 base samples for the first stage, 8 for the second).
    pub fn latency_samples(&self) -> usize {
        let mut latency = 0;
        for stage in 0..self.factor.trailing_zeros() {
            latency += HALF_BAND_DELAY >> stage;
        }
        latency
    }

    /// Run `callback` on both channels at `factor` times the input rate,
    /// resampling in and out around it. At factor 1 the callback runs
    /// directly on the borrowed buffers.
    pub fn process<F>(&mut self, mut callback: F, left: &mut [Sample], right: &mut [Sample])
    where
        F: FnMut(&mut [Sample], &mut [Sample]),
    {
        let n = left.len().min(right.len());
        if self.factor == 1 {
            callback(&mut left[..n], &mut right[..n]);
            return;
        }

        debug_assert!(n <= self.max_block, "block exceeds prepared capacity");
        let n = n.min(self.max_block);

        // Up through the stage chain: a -> b -> a ...
        self.work_a_l[..n].copy_from_slice(&left[..n]);
        self.work_a_r[..n].copy_from_slice(&right[..n]);

        let mut len = n;
        let mut in_a = true;
        for (stage_l, stage_r) in self.stages_l.iter_mut().zip(self.stages_r.iter_mut()) {
            if in_a {
                stage_l.upsample(&self.work_a_l[..len], &mut self.work_b_l[..len * 2]);
                stage_r.upsample(&self.work_a_r[..len], &mut self.work_b_r[..len * 2]);
            } else {
                stage_l.upsample(&self.work_b_l[..len], &mut self.work_a_l[..len * 2]);
                stage_r.upsample(&self.work_b_r[..len], &mut self.work_a_r[..len * 2]);
            }
            len *= 2;
            in_a = !in_a;
        }

        {
            let (hi_l, hi_r) = if in_a {
                (&mut self.work_a_l[..len], &mut self.work_a_r[..len])
            } else {
                (&mut self.work_b_l[..len], &mut self.work_b_r[..len])
            };
            callback(hi_l, hi_r);
        }

        // Back down, reversing the chain
        for (stage_l, stage_r) in self
            .stages_l
            .iter_mut()
            .zip(self.stages_r.iter_mut())
            .rev()
        {
            let half = len / 2;
            if in_a {
                stage_l.downsample(&self.work_a_l[..len], &mut self.work_b_l[..half]);
                stage_r.downsample(&self.work_a_r[..len], &mut self.work_b_r[..half]);
            } else {
                stage_l.downsample(&self.work_b_l[..len], &mut self.work_a_l[..half]);
                stage_r.downsample(&self.work_b_r[..len], &mut self.work_a_r[..half]);
            }
            len = half;
            in_a = !in_a;
        }

        debug_assert_eq!(len, n);
        if in_a {
            left[..n].copy_from_slice(&self.work_a_l[..n]);
            right[..n].copy_from_slice(&self.work_a_r[..n]);
        } else {
            left[..n].copy_from_slice(&self.work_b_l[..n]);
            right[..n].copy_from_slice(&self.work_b_r[..n]);
        }
    }
}

impl Default for Oversampler {
    fn default() -> Self {
        Self::new()
    }
}

impl Processor for Oversampler {
    fn reset(&mut self) {
        for stage in self.stages_l.iter_mut().chain(self.stages_r.iter_mut()) {
            stage.reset();
        }
    }

    fn latency(&self) -> usize {
        self.latency_samples()
    }
}
