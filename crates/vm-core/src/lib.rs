//! vm-core: Shared types and utilities for VoxMorph
//!
//! This crate provides the foundational types used across the VoxMorph DSP
//! crates: the sample type, standard rate/buffer enums, and the numeric
//! hygiene helpers (dB conversion, non-finite sanitization, denormal flush)
//! every real-time stage relies on.

mod sample;

pub use sample::*;

/// Standard sample rate options
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[repr(u32)]
pub enum SampleRate {
    Hz44100 = 44100,
    Hz48000 = 48000,
    Hz88200 = 88200,
    Hz96000 = 96000,
    Hz176400 = 176400,
    Hz192000 = 192000,
}

impl SampleRate {
    #[inline]
    pub fn as_f64(self) -> f64 {
        self as u32 as f64
    }

    #[inline]
    pub fn as_u32(self) -> u32 {
        self as u32
    }
}

impl Default for SampleRate {
    fn default() -> Self {
        Self::Hz48000
    }
}

/// Buffer size options
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[repr(u32)]
pub enum BufferSize {
    Samples32 = 32,
    Samples64 = 64,
    Samples128 = 128,
    Samples256 = 256,
    Samples512 = 512,
    Samples1024 = 1024,
    Samples2048 = 2048,
}

impl BufferSize {
    #[inline]
    pub fn as_usize(self) -> usize {
        self as u32 as usize
    }
}

impl Default for BufferSize {
    fn default() -> Self {
        Self::Samples512
    }
}

/// Reference sample rate for Z-plane shape data (poles are tabulated at 48 kHz)
pub const REFERENCE_SAMPLE_RATE: f64 = 48000.0;
