//! Z-plane pole math
//!
//! Filter shapes are stored as conjugate pole pairs `(radius, angle)` at a
//! 48 kHz reference rate. Remapping to the host rate goes through the
//! bilinear transform (z@48k -> s -> z@fs) so the perceived resonant
//! frequency stays put across sample rates; a naive linear angle scale
//! detunes the formants.

use serde::{Deserialize, Serialize};
use std::f64::consts::PI;
use vm_core::{Sample, REFERENCE_SAMPLE_RATE};

/// Lower stability bound for a pole radius
pub const MIN_POLE_RADIUS: Sample = 0.10;

/// Upper stability bound for a pole radius
pub const MAX_POLE_RADIUS: Sample = 0.9995;

/// A conjugate pole pair in polar form, defined at the 48 kHz reference rate
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Pole {
    /// Pole radius, must stay below 1.0 for stability
    pub radius: Sample,
    /// Pole angle in radians, wrapped to (-pi, pi]
    pub angle: Sample,
}

impl Pole {
    /// Create a pole with the radius clamped into the stability band and the
    /// angle wrapped
    pub fn new(radius: Sample, angle: Sample) -> Self {
        Self {
            radius: radius.clamp(MIN_POLE_RADIUS, MAX_POLE_RADIUS),
            angle: wrap_angle(angle),
        }
    }

    /// Clamp the radius into the stability band, leaving the angle untouched
    #[inline]
    pub fn clamped(self) -> Self {
        Self {
            radius: self.radius.clamp(MIN_POLE_RADIUS, MAX_POLE_RADIUS),
            angle: self.angle,
        }
    }
}

/// Wrap an angle to (-pi, pi]
#[inline]
pub fn wrap_angle(mut a: Sample) -> Sample {
    while a > PI {
        a -= 2.0 * PI;
    }
    while a <= -PI {
        a += 2.0 * PI;
    }
    a
}

/// Interpolate between two angles along the shortest angular path
#[inline]
pub fn interp_angle_shortest(a: Sample, b: Sample, t: Sample) -> Sample {
    wrap_angle(a + t * wrap_angle(b - a))
}

/// Interpolate two poles: linear radius, shortest-path angle
#[inline]
pub fn interp_pole(a: Pole, b: Pole, t: Sample) -> Pole {
    Pole {
        radius: a.radius + t * (b.radius - a.radius),
        angle: interp_angle_shortest(a.angle, b.angle, t),
    }
}

/// Remap a pole from the 48 kHz reference rate to the host sample rate via
/// the bilinear transform.
///
/// `z@48k -> s = 2*fsRef*(z-1)/(z+1) -> z' = (2*fsHost+s)/(2*fsHost-s)`
///
/// Identity when the host rate equals the reference. The returned radius is
/// clamped back into the stability band (the mapping can push a pole slightly
/// toward the unit circle at lower host rates).
pub fn remap_to_rate(pole: Pole, host_rate: Sample) -> Pole {
    if host_rate == REFERENCE_SAMPLE_RATE {
        return pole.clamped();
    }

    // z at the reference rate
    let zr = pole.radius * pole.angle.cos();
    let zi = pole.radius * pole.angle.sin();

    // s = 2*fsRef*(z - 1)/(z + 1)
    let (nr, ni) = (zr - 1.0, zi);
    let (dr, di) = (zr + 1.0, zi);
    let den = dr * dr + di * di;
    let sr = 2.0 * REFERENCE_SAMPLE_RATE * (nr * dr + ni * di) / den;
    let si = 2.0 * REFERENCE_SAMPLE_RATE * (ni * dr - nr * di) / den;

    // z' = (2*fsHost + s)/(2*fsHost - s)
    let k = 2.0 * host_rate;
    let (nr2, ni2) = (k + sr, si);
    let (dr2, di2) = (k - sr, -si);
    let den2 = dr2 * dr2 + di2 * di2;
    let zr2 = (nr2 * dr2 + ni2 * di2) / den2;
    let zi2 = (ni2 * dr2 - nr2 * di2) / den2;

    Pole {
        radius: (zr2 * zr2 + zi2 * zi2)
            .sqrt()
            .clamp(MIN_POLE_RADIUS, MAX_POLE_RADIUS),
        angle: wrap_angle(zi2.atan2(zr2)),
    }
}

/// Continuous-time resonant frequency (Hz) a pole angle corresponds to at a
/// given sample rate, through the bilinear frequency mapping
pub fn pole_frequency_hz(angle: Sample, sample_rate: Sample) -> Sample {
    // omega_analog = 2*fs*tan(theta/2), f = omega/(2*pi)
    sample_rate * (angle.abs() * 0.5).tan() / PI
}
