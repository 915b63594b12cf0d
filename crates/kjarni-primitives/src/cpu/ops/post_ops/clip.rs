use rayon::prelude::*;

use crate::cpu::kernels::scalar::clip;
use crate::tensor::POST_OPS_BLOCK;

/// Lowers every value of `out` above `bound` to `bound`.
///
/// Whole 8-element groups are processed in parallel, the tail serially.
pub fn clip_upper_bound(out: &mut [f32], bound: f32) {
    let split = out.len() - out.len() % POST_OPS_BLOCK;
    let (body, tail) = out.split_at_mut(split);
    body.par_chunks_mut(POST_OPS_BLOCK)
        .for_each(|group| clip(group, bound));
    clip(tail, bound);
}
