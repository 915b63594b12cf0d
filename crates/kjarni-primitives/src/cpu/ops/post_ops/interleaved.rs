//! Post-ops over channels-last outputs.

use rayon::prelude::*;

use super::PostOpsArgs;
use crate::cpu::kernels::scalar::{clip, interleaved_lanes};

/// Operands of one row: slices of the per-channel vectors, empty when
/// absent.
struct RowOperands<'a> {
    scale: &'a [f32],
    bias: &'a [f32],
}

type RowsFn = fn(&mut [f32], &[f32], &RowOperands<'_>, &Layout, Option<f32>);

/// Row geometry shared by every shard.
struct Layout {
    total: usize,
    start: usize,
    end: usize,
}

fn rows<const SCALE: bool, const BIAS: bool, const RESIDUAL: bool, const RELU: bool>(
    out: &mut [f32],
    residual: &[f32],
    ops: &RowOperands<'_>,
    layout: &Layout,
    clip_bound: Option<f32>,
) {
    for (r, row) in out.chunks_exact_mut(layout.total).enumerate() {
        let lanes = &mut row[layout.start..layout.end];
        let res: &[f32] = if RESIDUAL {
            let base = r * layout.total;
            &residual[base + layout.start..base + layout.end]
        } else {
            &[]
        };
        interleaved_lanes::<SCALE, BIAS, RESIDUAL, RELU>(lanes, ops.scale, ops.bias, res);
        if let Some(bound) = clip_bound {
            clip(lanes, bound);
        }
    }
}

fn select(scale: bool, bias: bool, residual: bool, relu: bool) -> RowsFn {
    match (scale, bias, residual, relu) {
        (false, false, false, false) => rows::<false, false, false, false>,
        (false, false, false, true) => rows::<false, false, false, true>,
        (false, false, true, false) => rows::<false, false, true, false>,
        (false, false, true, true) => rows::<false, false, true, true>,
        (false, true, false, false) => rows::<false, true, false, false>,
        (false, true, false, true) => rows::<false, true, false, true>,
        (false, true, true, false) => rows::<false, true, true, false>,
        (false, true, true, true) => rows::<false, true, true, true>,
        (true, false, false, false) => rows::<true, false, false, false>,
        (true, false, false, true) => rows::<true, false, false, true>,
        (true, false, true, false) => rows::<true, false, true, false>,
        (true, false, true, true) => rows::<true, false, true, true>,
        (true, true, false, false) => rows::<true, true, false, false>,
        (true, true, false, true) => rows::<true, true, false, true>,
        (true, true, true, false) => rows::<true, true, true, false>,
        (true, true, true, true) => rows::<true, true, true, true>,
    }
}

pub(super) fn apply(out: &mut [f32], args: &PostOpsArgs<'_>, clip_bound: Option<f32>) {
    let total = args.total_filters;
    let nrows = args.batch * args.spatial();
    if total == 0 || nrows == 0 || args.no_of_filter == 0 {
        return;
    }
    let layout = Layout {
        total,
        start: args.bias_offset,
        end: args.bias_offset + args.no_of_filter,
    };
    let nf = args.no_of_filter;
    let ops = RowOperands {
        scale: args.scale.map_or(&[][..], |s| &s[..nf]),
        bias: args.bias.map_or(&[][..], |b| &b[..nf]),
    };
    let kernel = select(
        args.scale.is_some(),
        args.bias.is_some(),
        args.residual.is_some(),
        args.relu,
    );

    let shards = args
        .threads
        .unwrap_or_else(rayon::current_num_threads)
        .clamp(1, nrows);
    let shard_len = nrows.div_ceil(shards) * total;
    let out = &mut out[..nrows * total];

    match args.residual {
        Some(residual) => out
            .par_chunks_mut(shard_len)
            .zip(residual[..nrows * total].par_chunks(shard_len))
            .for_each(|(shard, res)| kernel(shard, res, &ops, &layout, clip_bound)),
        None => out
            .par_chunks_mut(shard_len)
            .for_each(|shard| kernel(shard, &[], &ops, &layout, clip_bound)),
    }
}
