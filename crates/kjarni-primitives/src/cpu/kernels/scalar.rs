//! Portable lane kernels for the post-ops engine.
//!
//! Every kernel is generic over which operands are present. The flags are
//! constants, so each instantiation compiles to a loop with no presence
//! checks left in it.

use super::LaneParams;

/// Clamp at zero. NaN is passed through unchanged.
#[inline(always)]
pub fn relu(v: f32) -> f32 {
    if v < 0.0 {
        0.0
    } else {
        v
    }
}

/// Applies the interleaved chain to the active channels of one row:
/// `x * scale[c]`, `+ bias[c]`, `+ residual[c]`, ReLU.
///
/// Absent operands are passed as empty slices and never read.
#[inline(always)]
pub fn interleaved_lanes<const SCALE: bool, const BIAS: bool, const RESIDUAL: bool, const RELU: bool>(
    out: &mut [f32],
    scale: &[f32],
    bias: &[f32],
    residual: &[f32],
) {
    for c in 0..out.len() {
        let mut v = out[c];
        if SCALE {
            v *= scale[c];
        }
        if BIAS {
            v += bias[c];
        }
        if RESIDUAL {
            v += residual[c];
        }
        if RELU {
            v = relu(v);
        }
        out[c] = v;
    }
}

/// Applies the blocked chain to one `spatial × 8` chunk.
///
/// With `AFFINE` the lanes get `scale * (x - mean) + offset` and `BIAS` is
/// ignored. `out.len()` must be a multiple of 8.
#[inline(always)]
pub fn blocked_chunk<const AFFINE: bool, const BIAS: bool, const RESIDUAL: bool, const RELU: bool>(
    out: &mut [f32],
    lanes: &LaneParams,
    residual: &[f32],
) {
    for (g, group) in out.chunks_exact_mut(8).enumerate() {
        for n in 0..8 {
            let mut v = group[n];
            if AFFINE {
                v = lanes.scale[n] * (v - lanes.mean[n]) + lanes.offset[n];
            } else if BIAS {
                v += lanes.bias[n];
            }
            if RESIDUAL {
                v += residual[g * 8 + n];
            }
            if RELU {
                v = relu(v);
            }
            group[n] = v;
        }
    }
}

/// Lowers every value above `bound` to `bound`.
#[inline(always)]
pub fn clip(out: &mut [f32], bound: f32) {
    for v in out.iter_mut() {
        if *v > bound {
            *v = bound;
        }
    }
}
