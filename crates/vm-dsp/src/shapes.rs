//! Z-plane filter shape bank
//!
//! A shape is six conjugate pole pairs tabulated at the 48 kHz reference
//! rate plus a little metadata. The bank is read-only on the audio thread:
//! it is built once at startup (static defaults below) or deserialized from
//! JSON on a non-real-time thread and installed by value at a block
//! boundary.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use vm_core::Sample;

use crate::pole::Pole;

/// Pole pairs per shape (12-pole filter)
pub const POLES_PER_SHAPE: usize = 6;

/// A named filter shape: six pole pairs at the reference rate
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterShape {
    pub name: String,
    pub poles: [Pole; POLES_PER_SHAPE],
    /// Nominal center of the formant cluster, informational
    pub reference_freq: Sample,
    /// Relative resonance weighting, informational
    pub resonance_scale: Sample,
}

/// A named A/B pair of shape indices available for morphing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MorphPair {
    pub name: String,
    pub a: usize,
    pub b: usize,
}

/// Errors from the JSON shape-bank loader (never reachable from the audio
/// thread)
#[derive(Debug, Error)]
pub enum ShapeBankError {
    #[error("shape bank JSON parse error: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("shape '{name}' has {count} pole pairs, expected {POLES_PER_SHAPE}")]
    WrongPoleCount { name: String, count: usize },

    #[error("shape '{name}' pole {index} radius {radius} outside (0, 1)")]
    InvalidRadius {
        name: String,
        index: usize,
        radius: Sample,
    },

    #[error("morph pair '{name}' references shape {index} but bank has {len} shapes")]
    PairOutOfRange {
        name: String,
        index: usize,
        len: usize,
    },

    #[error("shape bank is empty")]
    Empty,
}

/// On-disk shape record: poles as flat `[radius, angle]` pairs
#[derive(Debug, Deserialize)]
struct ShapeRecord {
    name: String,
    poles: Vec<[Sample; 2]>,
    #[serde(default = "default_reference_freq")]
    reference_freq: Sample,
    #[serde(default = "default_resonance_scale")]
    resonance_scale: Sample,
}

fn default_reference_freq() -> Sample {
    1000.0
}

fn default_resonance_scale() -> Sample {
    1.0
}

#[derive(Debug, Deserialize)]
struct PairRecord {
    name: String,
    a: usize,
    b: usize,
}

#[derive(Debug, Deserialize)]
struct BankRecord {
    shapes: Vec<ShapeRecord>,
    #[serde(default)]
    pairs: Vec<PairRecord>,
}

/// Read-only store of filter shapes and morph pairs
#[derive(Debug, Clone)]
pub struct ShapeBank {
    shapes: Vec<FilterShape>,
    pairs: Vec<MorphPair>,
}

impl Default for ShapeBank {
    fn default() -> Self {
        default_bank()
    }
}

impl ShapeBank {
    /// Parse a bank from its JSON form: shapes as arrays of
    /// `[radius, angle]` pairs, plus named A/B pairs.
    pub fn from_json(json: &str) -> Result<Self, ShapeBankError> {
        let record: BankRecord = serde_json::from_str(json)?;

        if record.shapes.is_empty() {
            return Err(ShapeBankError::Empty);
        }

        let mut shapes = Vec::with_capacity(record.shapes.len());
        for shape in &record.shapes {
            if shape.poles.len() != POLES_PER_SHAPE {
                return Err(ShapeBankError::WrongPoleCount {
                    name: shape.name.clone(),
                    count: shape.poles.len(),
                });
            }
            let mut poles = [Pole::new(0.5, 0.0); POLES_PER_SHAPE];
            for (i, &[radius, angle]) in shape.poles.iter().enumerate() {
                if !(radius > 0.0 && radius < 1.0) {
                    return Err(ShapeBankError::InvalidRadius {
                        name: shape.name.clone(),
                        index: i,
                        radius,
                    });
                }
                poles[i] = Pole::new(radius, angle);
            }
            shapes.push(FilterShape {
                name: shape.name.clone(),
                poles,
                reference_freq: shape.reference_freq,
                resonance_scale: shape.resonance_scale,
            });
        }

        let mut pairs = Vec::with_capacity(record.pairs.len());
        for pair in &record.pairs {
            for &index in &[pair.a, pair.b] {
                if index >= shapes.len() {
                    return Err(ShapeBankError::PairOutOfRange {
                        name: pair.name.clone(),
                        index,
                        len: shapes.len(),
                    });
                }
            }
            pairs.push(MorphPair {
                name: pair.name.clone(),
                a: pair.a,
                b: pair.b,
            });
        }
        if pairs.is_empty() {
            // A bank without explicit pairs still morphs: adjacent shapes
            for i in 0..shapes.len() {
                pairs.push(MorphPair {
                    name: format!("{}_to_{}", shapes[i].name, shapes[(i + 1) % shapes.len()].name),
                    a: i,
                    b: (i + 1) % shapes.len(),
                });
            }
        }

        log::debug!(
            "loaded shape bank: {} shapes, {} pairs",
            shapes.len(),
            pairs.len()
        );

        Ok(Self { shapes, pairs })
    }

    pub fn num_shapes(&self) -> usize {
        self.shapes.len()
    }

    pub fn num_pairs(&self) -> usize {
        self.pairs.len()
    }

    /// Shape by index; out-of-range indices clamp to the last shape
    pub fn shape(&self, index: usize) -> &FilterShape {
        let index = index.min(self.shapes.len() - 1);
        &self.shapes[index]
    }

    /// Morph pair by index; out-of-range indices clamp to the last pair
    pub fn pair(&self, index: usize) -> &MorphPair {
        let index = index.min(self.pairs.len() - 1);
        &self.pairs[index]
    }

    /// The two shapes a pair selects
    pub fn pair_shapes(&self, index: usize) -> (&FilterShape, &FilterShape) {
        let pair = self.pair(index);
        (self.shape(pair.a), self.shape(pair.b))
    }
}

fn shape(
    name: &str,
    poles: [(Sample, Sample); POLES_PER_SHAPE],
    reference_freq: Sample,
    resonance_scale: Sample,
) -> FilterShape {
    let mut out = [Pole::new(0.5, 0.0); POLES_PER_SHAPE];
    for (dst, &(r, th)) in out.iter_mut().zip(poles.iter()) {
        *dst = Pole::new(r, th);
    }
    FilterShape {
        name: name.to_string(),
        poles: out,
        reference_freq,
        resonance_scale,
    }
}

/// Built-in bank: vocal formant clusters plus a few sweep/lead shapes.
/// Pole tables are defined at 48 kHz; angles in radians.
fn default_bank() -> ShapeBank {
    let shapes = vec![
        shape(
            "vowel_ae",
            [
                (0.985, 0.628), // ~4.8 kHz formant
                (0.978, 1.047),
                (0.982, 0.419),
                (0.975, 0.838),
                (0.988, 0.209),
                (0.972, 1.257),
            ],
            2500.0,
            1.2,
        ),
        shape(
            "vowel_eh",
            [
                (0.982, 0.524),
                (0.976, 0.942),
                (0.984, 0.314),
                (0.978, 0.733),
                (0.986, 0.157),
                (0.974, 1.152),
            ],
            2000.0,
            1.1,
        ),
        shape(
            "vowel_ih",
            [
                (0.988, 0.419),
                (0.982, 0.628),
                (0.985, 0.209),
                (0.979, 0.838),
                (0.990, 0.105),
                (0.976, 1.047),
            ],
            1500.0,
            1.0,
        ),
        shape(
            "vowel_oo",
            [
                (0.990, 0.157),
                (0.984, 0.262),
                (0.987, 0.092),
                (0.980, 0.524),
                (0.991, 0.052),
                (0.975, 0.785),
            ],
            800.0,
            1.0,
        ),
        shape(
            "lead_bright",
            [
                (0.976, 0.733),
                (0.970, 1.152),
                (0.980, 0.524),
                (0.968, 1.396),
                (0.983, 0.314),
                (0.965, 1.571),
            ],
            3200.0,
            1.25,
        ),
        shape(
            "lead_warm",
            [
                (0.981, 0.262),
                (0.977, 0.419),
                (0.984, 0.157),
                (0.973, 0.628),
                (0.986, 0.105),
                (0.969, 0.942),
            ],
            1200.0,
            1.05,
        ),
        shape(
            "formant_sweep",
            [
                (0.980, 0.314),
                (0.975, 0.628),
                (0.983, 0.942),
                (0.978, 1.257),
                (0.986, 0.157),
                (0.971, 1.571),
            ],
            3000.0,
            1.3,
        ),
        shape(
            "resonant_peak",
            [
                (0.992, 0.393),
                (0.988, 0.405),
                (0.984, 0.380),
                (0.975, 0.785),
                (0.970, 0.196),
                (0.965, 1.178),
            ],
            3000.0,
            1.4,
        ),
    ];

    let pairs = vec![
        MorphPair {
            name: "vowel_ae_to_oo".to_string(),
            a: 0,
            b: 3,
        },
        MorphPair {
            name: "vowel_eh_to_ih".to_string(),
            a: 1,
            b: 2,
        },
        MorphPair {
            name: "lead_bright_to_warm".to_string(),
            a: 4,
            b: 5,
        },
        MorphPair {
            name: "vowel_ih_to_sweep".to_string(),
            a: 2,
            b: 6,
        },
        MorphPair {
            name: "sweep_to_peak".to_string(),
            a: 6,
            b: 7,
        },
    ];

    ShapeBank { shapes, pairs }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pole::{MAX_POLE_RADIUS, MIN_POLE_RADIUS};

    #[test]
    fn test_default_bank_is_sane() {
        let bank = ShapeBank::default();
        assert!(bank.num_shapes() >= 8);
        assert!(bank.num_pairs() >= 5);

        for i in 0..bank.num_shapes() {
            for pole in &bank.shape(i).poles {
                assert!(pole.radius >= MIN_POLE_RADIUS && pole.radius <= MAX_POLE_RADIUS);
            }
        }
    }

    #[test]
    fn test_index_clamping() {
        let bank = ShapeBank::default();
        // Out-of-range access clamps instead of panicking
        let last = bank.shape(bank.num_shapes() - 1).name.clone();
        assert_eq!(bank.shape(usize::MAX).name, last);
        let _ = bank.pair_shapes(usize::MAX);
    }

    #[test]
    fn test_json_roundtrip() {
        let json = r#"{
            "shapes": [
                {
                    "name": "formant_a",
                    "poles": [[0.98, 0.6], [0.97, 1.0], [0.98, 0.4],
                              [0.97, 0.8], [0.99, 0.2], [0.97, 1.2]],
                    "reference_freq": 2500.0,
                    "resonance_scale": 1.2
                },
                {
                    "name": "formant_o",
                    "poles": [[0.99, 0.15], [0.98, 0.26], [0.99, 0.09],
                              [0.98, 0.52], [0.99, 0.05], [0.97, 0.78]]
                }
            ],
            "pairs": [{ "name": "a_to_o", "a": 0, "b": 1 }]
        }"#;

        let bank = ShapeBank::from_json(json).expect("valid bank");
        assert_eq!(bank.num_shapes(), 2);
        assert_eq!(bank.num_pairs(), 1);
        assert_eq!(bank.pair(0).name, "a_to_o");
        assert!((bank.shape(0).poles[0].radius - 0.98).abs() < 1e-12);
    }

    #[test]
    fn test_json_rejects_wrong_pole_count() {
        let json = r#"{ "shapes": [ { "name": "bad", "poles": [[0.9, 0.1]] } ] }"#;
        match ShapeBank::from_json(json) {
            Err(ShapeBankError::WrongPoleCount { count, .. }) => assert_eq!(count, 1),
            other => panic!("expected WrongPoleCount, got {other:?}"),
        }
    }

    #[test]
    fn test_json_rejects_unstable_radius() {
        let json = r#"{ "shapes": [ { "name": "bad",
            "poles": [[1.2, 0.1], [0.9, 0.1], [0.9, 0.1],
                      [0.9, 0.1], [0.9, 0.1], [0.9, 0.1]] } ] }"#;
        assert!(matches!(
            ShapeBank::from_json(json),
            Err(ShapeBankError::InvalidRadius { .. })
        ));
    }

    #[test]
    fn test_json_rejects_bad_pair() {
        let json = r#"{
            "shapes": [ { "name": "only",
                "poles": [[0.9, 0.1], [0.9, 0.2], [0.9, 0.3],
                          [0.9, 0.4], [0.9, 0.5], [0.9, 0.6]] } ],
            "pairs": [ { "name": "oops", "a": 0, "b": 7 } ]
        }"#;
        assert!(matches!(
            ShapeBank::from_json(json),
            Err(ShapeBankError::PairOutOfRange { .. })
        ));
    }
}
