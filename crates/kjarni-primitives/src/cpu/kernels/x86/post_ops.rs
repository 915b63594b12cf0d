//! AVX2 lane kernel for the blocked post-ops path.

use std::arch::x86_64::*;

use crate::cpu::kernels::LaneParams;

/// One 8-channel block over its whole spatial extent, one vector per
/// spatial point.
///
/// Uses separate multiply and add (no FMA) so results match the scalar
/// kernel bit for bit.
///
/// # Safety
///
/// Requires AVX2. `out.len()` must be a multiple of 8 and, with
/// `RESIDUAL`, `residual` must be at least as long as `out`.
#[target_feature(enable = "avx2")]
pub unsafe fn blocked_chunk_avx2<const AFFINE: bool, const BIAS: bool, const RESIDUAL: bool, const RELU: bool>(
    out: &mut [f32],
    lanes: &LaneParams,
    residual: &[f32],
) {
    debug_assert_eq!(out.len() % 8, 0);
    debug_assert!(!RESIDUAL || residual.len() >= out.len());
    unsafe {
        let scale = _mm256_loadu_ps(lanes.scale.as_ptr());
        let mean = _mm256_loadu_ps(lanes.mean.as_ptr());
        let offset = _mm256_loadu_ps(lanes.offset.as_ptr());
        let bias = _mm256_loadu_ps(lanes.bias.as_ptr());
        let zero = _mm256_setzero_ps();

        let out_ptr = out.as_mut_ptr();
        let res_ptr = residual.as_ptr();
        for g in 0..out.len() / 8 {
            let p = out_ptr.add(g * 8);
            let mut v = _mm256_loadu_ps(p);
            if AFFINE {
                v = _mm256_add_ps(_mm256_mul_ps(scale, _mm256_sub_ps(v, mean)), offset);
            } else if BIAS {
                v = _mm256_add_ps(v, bias);
            }
            if RESIDUAL {
                v = _mm256_add_ps(v, _mm256_loadu_ps(res_ptr.add(g * 8)));
            }
            if RELU {
                // max_ps returns its second operand when either is NaN
                v = _mm256_max_ps(zero, v);
            }
            _mm256_storeu_ps(p, v);
        }
    }
}
