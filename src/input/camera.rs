//! Camera-delta quantization
//!
//! Lossy deltas use smallest-three encoding: the largest component is dropped
//! (its sign forced positive) and the remaining three are stored as 20-bit
//! fixed point values in `[-1/sqrt(2), 1/sqrt(2)]`.
//!
//! ```text
//!  63..62  61..60   59..40  39..20  19..0
//! [unused][largest][  c  ][  b  ][  a  ]
//! ```

use serde::{Deserialize, Serialize};

use crate::util::quat::Quat;

const COMPONENT_BITS: u32 = 20;
const COMPONENT_MASK: u64 = (1 << COMPONENT_BITS) - 1;
const LARGEST_SHIFT: u32 = 60;
const RANGE: f32 = std::f32::consts::FRAC_1_SQRT_2;

/// Per-frame camera rotation delta
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub enum CameraDelta {
    /// No camera input this frame
    #[default]
    None,
    /// Smallest-three quantized rotation
    Lossy(u64),
    /// Full precision rotation
    Raw(Quat),
}

impl CameraDelta {
    /// Quantize `q` into a lossy delta
    pub fn lossy(q: Quat) -> Self {
        CameraDelta::Lossy(quantize(q))
    }

    /// Decoded rotation, `None` when the frame carries no camera input
    pub fn rotation(&self) -> Option<Quat> {
        match *self {
            CameraDelta::None => None,
            CameraDelta::Lossy(bits) => Some(dequantize(bits)),
            CameraDelta::Raw(q) => Some(q),
        }
    }

    #[inline]
    pub fn is_none(&self) -> bool {
        matches!(self, CameraDelta::None)
    }
}

fn encode_component(v: f32) -> u64 {
    let t = ((v.clamp(-RANGE, RANGE) + RANGE) / (2.0 * RANGE)).clamp(0.0, 1.0);
    (f64::from(t) * COMPONENT_MASK as f64).round() as u64
}

fn decode_component(bits: u64) -> f32 {
    let t = (bits & COMPONENT_MASK) as f32 / COMPONENT_MASK as f32;
    t * 2.0 * RANGE - RANGE
}

/// Pack a rotation into 62 bits
pub fn quantize(q: Quat) -> u64 {
    let mut c = q.normalize().to_array();

    let largest = (0..4)
        .max_by(|&a, &b| c[a].abs().total_cmp(&c[b].abs()))
        .unwrap_or(3);
    if c[largest] < 0.0 {
        for v in c.iter_mut() {
            *v = -*v;
        }
    }

    let mut bits = (largest as u64) << LARGEST_SHIFT;
    let mut slot = 0;
    for (i, v) in c.iter().enumerate() {
        if i == largest {
            continue;
        }
        bits |= encode_component(*v) << (slot * COMPONENT_BITS);
        slot += 1;
    }
    bits
}

/// Inverse of [`quantize`]
pub fn dequantize(bits: u64) -> Quat {
    let largest = ((bits >> LARGEST_SHIFT) & 0x3) as usize;
    let mut c = [0.0f32; 4];
    let mut slot = 0;
    let mut sum = 0.0;
    for (i, v) in c.iter_mut().enumerate() {
        if i == largest {
            continue;
        }
        *v = decode_component(bits >> (slot * COMPONENT_BITS));
        sum += *v * *v;
        slot += 1;
    }
    c[largest] = (1.0 - sum).max(0.0).sqrt();
    Quat::from_array(c).normalize()
}
