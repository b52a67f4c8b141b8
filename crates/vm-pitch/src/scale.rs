//! Scale quantization
//!
//! Snaps a fractional MIDI pitch to the nearest note allowed by a 12-bit
//! scale mask, relative to a key root. Pure: no state beyond key, mask and
//! tie-break bias.

use serde::{Deserialize, Serialize};
use vm_core::Sample;

/// All twelve pitch classes set: quantization is a no-op
pub const CHROMATIC_MASK: u16 = 0x0FFF;

/// Major scale (bits 0,2,4,5,7,9,11)
pub const MAJOR_MASK: u16 = 0x0AB5;

/// Natural minor scale (bits 0,2,3,5,7,8,10)
pub const MINOR_MASK: u16 = 0x05AD;

/// Tie-break direction when a pitch sits exactly between two scale notes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Bias {
    Down,
    #[default]
    Neutral,
    Up,
}

impl Bias {
    #[inline]
    fn as_sign(self) -> Sample {
        match self {
            Bias::Down => -1.0,
            Bias::Neutral => 0.0,
            Bias::Up => 1.0,
        }
    }
}

/// Maps detected pitch to the nearest note of a keyed scale
#[derive(Debug, Clone, Copy)]
pub struct ScaleQuantizer {
    root_key: i32,
    mask: u16,
    bias: Bias,
}

impl Default for ScaleQuantizer {
    fn default() -> Self {
        Self {
            root_key: 0,
            mask: CHROMATIC_MASK,
            bias: Bias::Neutral,
        }
    }
}

impl ScaleQuantizer {
    pub fn new(root_key: u8, mask: u16, bias: Bias) -> Self {
        let mut q = Self::default();
        q.set_key_scale(root_key, mask);
        q.set_bias(bias);
        q
    }

    /// Set key root (0 = C .. 11 = B, wrapped) and the 12-bit scale mask.
    /// An empty mask falls back to chromatic rather than producing no
    /// candidates.
    pub fn set_key_scale(&mut self, root_key: u8, mask: u16) {
        self.root_key = (root_key % 12) as i32;
        let mask = mask & CHROMATIC_MASK;
        self.mask = if mask == 0 { CHROMATIC_MASK } else { mask };
    }

    pub fn set_bias(&mut self, bias: Bias) {
        self.bias = bias;
    }

    pub fn root_key(&self) -> u8 {
        self.root_key as u8
    }

    pub fn mask(&self) -> u16 {
        self.mask
    }

    #[inline]
    fn in_scale(&self, pitch_class: i32) -> bool {
        let rel = (pitch_class - self.root_key).rem_euclid(12);
        (self.mask >> rel) & 1 == 1
    }

    /// Snap a fractional MIDI pitch to the nearest allowed note.
    /// With the full chromatic mask the input passes through untouched.
    pub fn snap(&self, midi: Sample) -> Sample {
        if self.mask == CHROMATIC_MASK {
            return midi;
        }
        if !midi.is_finite() {
            return midi;
        }

        let base = midi.floor() as i32;
        let mut best = base;
        let mut best_dist = Sample::MAX;

        // A window of +/-6 semitones always contains a set mask bit
        for k in -6..=6 {
            let candidate = base + k;
            if !self.in_scale(candidate.rem_euclid(12)) {
                continue;
            }
            let mut dist = (midi - candidate as Sample).abs();
            // Nudge exact ties toward the bias direction
            if (dist - best_dist).abs() < 1e-6 {
                let toward = if candidate as Sample >= midi { 1.0 } else { -1.0 };
                dist -= 1e-4 * self.bias.as_sign() * toward;
            }
            if dist < best_dist {
                best_dist = dist;
                best = candidate;
            }
        }

        best as Sample
    }
}
