//! Post-ops over 8-channel blocked outputs.

use std::time::Instant;

use rayon::prelude::*;

use super::PostOpsArgs;
use crate::cpu::kernels::{self, scalar, LaneParams};
use crate::tensor::POST_OPS_BLOCK;

/// Per-channel operands of a call, indexed by `8 * block + lane`.
struct ChannelOperands<'a> {
    scale: Option<&'a [f32]>,
    mean: Option<&'a [f32]>,
    offset: Option<&'a [f32]>,
    bias: Option<&'a [f32]>,
}

impl ChannelOperands<'_> {
    fn lanes(&self, block: usize) -> LaneParams {
        let base = block * POST_OPS_BLOCK;
        let mut lanes = LaneParams::default();
        load(&mut lanes.scale, self.scale, base);
        load(&mut lanes.mean, self.mean, base);
        load(&mut lanes.offset, self.offset, base);
        load(&mut lanes.bias, self.bias, base);
        lanes
    }
}

fn load(dst: &mut [f32; 8], src: Option<&[f32]>, base: usize) {
    if let Some(src) = src {
        dst.copy_from_slice(&src[base..base + POST_OPS_BLOCK]);
    }
}

type ChunksFn = fn(&mut [f32], Option<&[f32]>, &ChannelOperands<'_>, usize, usize, bool);

/// Runs one kernel over every `(image, channel block)` chunk in parallel.
fn chunks<const AFFINE: bool, const BIAS: bool, const RESIDUAL: bool, const RELU: bool>(
    out: &mut [f32],
    residual: Option<&[f32]>,
    ops: &ChannelOperands<'_>,
    chunk_len: usize,
    filter_block: usize,
    simd: bool,
) {
    let run = |k: usize, chunk: &mut [f32], res: &[f32]| {
        let lanes = ops.lanes(k % filter_block);
        #[cfg(target_arch = "x86_64")]
        if simd {
            // SAFETY: `simd` is only set after AVX2 was detected
            unsafe {
                kernels::x86::post_ops::blocked_chunk_avx2::<AFFINE, BIAS, RESIDUAL, RELU>(
                    chunk, &lanes, res,
                );
            }
            return;
        }
        #[cfg(not(target_arch = "x86_64"))]
        let _ = simd;
        scalar::blocked_chunk::<AFFINE, BIAS, RESIDUAL, RELU>(chunk, &lanes, res);
    };

    match residual {
        Some(residual) => out
            .par_chunks_mut(chunk_len)
            .zip(residual.par_chunks(chunk_len))
            .enumerate()
            .for_each(|(k, (chunk, res))| run(k, chunk, res)),
        None => out
            .par_chunks_mut(chunk_len)
            .enumerate()
            .for_each(|(k, chunk)| run(k, chunk, &[])),
    }
}

fn select(affine: bool, bias: bool, residual: bool, relu: bool) -> ChunksFn {
    match (affine, bias, residual, relu) {
        (false, false, false, false) => chunks::<false, false, false, false>,
        (false, false, false, true) => chunks::<false, false, false, true>,
        (false, false, true, false) => chunks::<false, false, true, false>,
        (false, false, true, true) => chunks::<false, false, true, true>,
        (false, true, false, false) => chunks::<false, true, false, false>,
        (false, true, false, true) => chunks::<false, true, false, true>,
        (false, true, true, false) => chunks::<false, true, true, false>,
        (false, true, true, true) => chunks::<false, true, true, true>,
        (true, false, false, false) => chunks::<true, false, false, false>,
        (true, false, false, true) => chunks::<true, false, false, true>,
        (true, false, true, false) => chunks::<true, false, true, false>,
        (true, false, true, true) => chunks::<true, false, true, true>,
        (true, true, false, false) => chunks::<true, true, false, false>,
        (true, true, false, true) => chunks::<true, true, false, true>,
        (true, true, true, false) => chunks::<true, true, true, false>,
        (true, true, true, true) => chunks::<true, true, true, true>,
    }
}

pub(super) fn apply(out: &mut [f32], args: &PostOpsArgs<'_>) {
    apply_with(out, args, kernels::has_avx2());
}

/// Like [`apply`], choosing the lane kernel explicitly. `simd` must only
/// be true when AVX2 is available.
pub(super) fn apply_with(out: &mut [f32], args: &PostOpsArgs<'_>, simd: bool) {
    let start = Instant::now();

    let filter_block = args.no_of_filter / POST_OPS_BLOCK;
    let chunk_len = POST_OPS_BLOCK * args.spatial();
    let nchunks = args.batch * filter_block;
    if nchunks == 0 || chunk_len == 0 {
        return;
    }
    let len = nchunks * chunk_len;

    // the affine form replaces the bias add
    let affine = args.scale.is_some();
    let ops = ChannelOperands {
        scale: args.scale,
        mean: args.mean.filter(|_| affine),
        offset: args.offset.filter(|_| affine),
        bias: args.bias.filter(|_| !affine),
    };
    let kernel = select(affine, ops.bias.is_some(), args.residual.is_some(), args.relu);
    kernel(
        &mut out[..len],
        args.residual.map(|r| &r[..len]),
        &ops,
        chunk_len,
        filter_block,
        simd,
    );

    log::debug!(
        "post_ops blocked: images={} height={} width={} filters={} relu={} batch_norm={} elementwise={} time={:.3}ms",
        args.batch,
        args.height,
        args.width,
        args.no_of_filter,
        args.relu,
        affine,
        args.residual.is_some(),
        start.elapsed().as_secs_f64() * 1e3
    );
}
