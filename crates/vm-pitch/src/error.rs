//! Error types for the pitch engine
//!
//! Nothing on the audio thread is fallible; these cover the non-real-time
//! configuration and preset-loading surfaces only.

use thiserror::Error;

/// Pitch engine errors
#[derive(Debug, Error)]
pub enum PitchError {
    /// Preset JSON could not be parsed
    #[error("preset parse error: {0}")]
    Parse(#[from] serde_json::Error),

    /// Preset carried values the engine cannot represent
    #[error("invalid preset '{name}': {reason}")]
    InvalidPreset { name: String, reason: String },

    /// Detection range is empty or inverted
    #[error("invalid frequency range: {min} - {max} Hz")]
    InvalidFrequencyRange { min: f64, max: f64 },
}

/// Result type for pitch operations
pub type PitchResult<T> = Result<T, PitchError>;
