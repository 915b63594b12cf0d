use std::sync::Arc;

use approx::assert_abs_diff_eq;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::*;
use crate::cpu::kernels;

fn random_vec(len: usize, seed: u64) -> Vec<f32> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..len).map(|_| rng.gen_range(-4.0..4.0)).collect()
}

fn plain_engine() -> PostOpsEngine {
    PostOpsEngine::new(&EngineConfig::default())
}

fn clipping_engine() -> PostOpsEngine {
    PostOpsEngine::new(&EngineConfig {
        relu_upper_bound: true,
        int8_support: true,
        ..EngineConfig::default()
    })
}

fn assert_bits_eq(actual: &[f32], expected: &[f32], label: &str) {
    assert_eq!(actual.len(), expected.len(), "{label}");
    for (i, (a, e)) in actual.iter().zip(expected).enumerate() {
        assert_eq!(a.to_bits(), e.to_bits(), "{label}: [{i}] {a} vs {e}");
    }
}

/// Straightforward interleaved reference, same operation order.
fn reference_interleaved(out: &mut [f32], args: &PostOpsArgs<'_>) {
    let rows = args.batch * args.spatial();
    for r in 0..rows {
        for c in 0..args.no_of_filter {
            let i = r * args.total_filters + args.bias_offset + c;
            let mut v = out[i];
            if let Some(s) = args.scale {
                v *= s[c];
            }
            if let Some(b) = args.bias {
                v += b[c];
            }
            if let Some(res) = args.residual {
                v += res[i];
            }
            if args.relu && v < 0.0 {
                v = 0.0;
            }
            out[i] = v;
        }
    }
}

fn reference_blocked(out: &mut [f32], args: &PostOpsArgs<'_>) {
    let fb = args.no_of_filter / 8;
    let spatial = args.spatial();
    for b in 0..args.batch {
        for r in 0..fb {
            for s in 0..spatial {
                for n in 0..8 {
                    let i = ((b * fb + r) * spatial + s) * 8 + n;
                    let c = r * 8 + n;
                    let mut v = out[i];
                    if let Some(scale) = args.scale {
                        let mean = args.mean.map_or(0.0, |m| m[c]);
                        let offset = args.offset.map_or(0.0, |o| o[c]);
                        v = scale[c] * (v - mean) + offset;
                    } else if let Some(bias) = args.bias {
                        v += bias[c];
                    }
                    if let Some(res) = args.residual {
                        v += res[i];
                    }
                    if args.relu && v < 0.0 {
                        v = 0.0;
                    }
                    out[i] = v;
                }
            }
        }
    }
}

#[test]
fn interleaved_bias_then_relu() {
    let engine = plain_engine();
    let bias = [1.0; 4];
    let args = PostOpsArgs::new(OutputLayout::Interleaved, 1, 1, 4)
        .with_bias(&bias)
        .with_relu(true);

    let mut out = vec![1.0, 2.0, 3.0, 4.0];
    engine.apply(&mut out, &args);
    assert_eq!(out, vec![2.0, 3.0, 4.0, 5.0]);

    let mut out = vec![-5.0, 2.0, -1.0, 3.0];
    engine.apply(&mut out, &args);
    assert_eq!(out, vec![0.0, 3.0, 0.0, 4.0]);
}

#[test]
fn blocked_affine_of_zero_is_offset() {
    let scale = [2.0; 8];
    let mean = [0.0; 8];
    let offset = [1.0; 8];
    let args = PostOpsArgs::new(OutputLayout::Blocked8, 1, 1, 8).with_affine(&scale, &mean, &offset);

    let mut out = vec![0.0; 8];
    plain_engine().apply(&mut out, &args);
    assert_eq!(out, vec![1.0; 8]);
}

#[test]
fn neutral_operands_leave_output_unchanged() {
    // nonzero inputs; negative zero is covered separately
    let (h, w, filters, batch) = (3, 5, 16, 2);
    let len = batch * h * w * filters;
    let input = random_vec(len, 7);
    let ones = vec![1.0; filters];
    let zeros = vec![0.0; filters];
    let engine = plain_engine();

    let interleaved = [
        PostOpsArgs::new(OutputLayout::Interleaved, h, w, filters).with_batch(batch),
        PostOpsArgs::new(OutputLayout::Interleaved, h, w, filters)
            .with_batch(batch)
            .with_scale(&ones)
            .with_bias(&zeros),
    ];
    let blocked = [
        PostOpsArgs::new(OutputLayout::Blocked8, h, w, filters).with_batch(batch),
        PostOpsArgs::new(OutputLayout::Blocked8, h, w, filters)
            .with_batch(batch)
            .with_affine(&ones, &zeros, &zeros),
        PostOpsArgs::new(OutputLayout::Blocked8, h, w, filters)
            .with_batch(batch)
            .with_bias(&zeros),
    ];
    for (i, args) in interleaved.iter().chain(&blocked).enumerate() {
        let mut out = input.clone();
        engine.apply(&mut out, args);
        assert_bits_eq(&out, &input, &format!("case {i}"));
    }
}

#[test]
fn adding_zero_clears_negative_zero_sign() {
    let zeros = [0.0; 8];
    let ones = [1.0; 8];
    let engine = plain_engine();
    let cases = [
        (PostOpsArgs::new(OutputLayout::Interleaved, 1, 1, 8), 0x8000_0000u32),
        (PostOpsArgs::new(OutputLayout::Blocked8, 1, 1, 8), 0x8000_0000),
        (
            PostOpsArgs::new(OutputLayout::Interleaved, 1, 1, 8).with_bias(&zeros),
            0,
        ),
        (PostOpsArgs::new(OutputLayout::Blocked8, 1, 1, 8).with_bias(&zeros), 0),
        (
            PostOpsArgs::new(OutputLayout::Blocked8, 1, 1, 8).with_affine(&ones, &zeros, &zeros),
            0,
        ),
        (
            PostOpsArgs::new(OutputLayout::Interleaved, 1, 1, 8).with_residual(&zeros),
            0,
        ),
    ];
    for (i, (args, bits)) in cases.iter().enumerate() {
        let mut out = vec![-0.0f32; 8];
        engine.apply(&mut out, args);
        assert!(out.iter().all(|v| v.to_bits() == *bits), "case {i}: {out:?}");
    }
}

#[test]
fn every_interleaved_combination_matches_reference() {
    let (h, w, total, batch) = (4, 3, 24, 2);
    let (offset, filters) = (8, 12);
    let len = batch * h * w * total;
    let input = random_vec(len, 11);
    let residual = random_vec(len, 12);
    let scale = random_vec(filters, 13);
    let bias = random_vec(filters, 14);
    let engine = plain_engine();

    for combo in 0..16u32 {
        let mut args = PostOpsArgs::new(OutputLayout::Interleaved, h, w, filters)
            .with_batch(batch)
            .with_channel_window(offset, filters, total)
            .with_relu(combo & 8 != 0);
        if combo & 1 != 0 {
            args = args.with_scale(&scale);
        }
        if combo & 2 != 0 {
            args = args.with_bias(&bias);
        }
        if combo & 4 != 0 {
            args = args.with_residual(&residual);
        }

        let mut expected = input.clone();
        reference_interleaved(&mut expected, &args);
        let mut out = input.clone();
        engine.apply(&mut out, &args);

        for (a, e) in out.iter().zip(&expected) {
            assert_abs_diff_eq!(*a, *e, epsilon = 1e-6);
        }
        // channels outside the window are untouched
        for r in 0..batch * h * w {
            for c in (0..offset).chain(offset + filters..total) {
                let i = r * total + c;
                assert_eq!(out[i].to_bits(), input[i].to_bits(), "combo {combo}");
            }
        }
    }
}

#[test]
fn every_blocked_combination_matches_reference() {
    let (h, w, filters, batch) = (3, 7, 24, 3);
    let len = batch * h * w * filters;
    let input = random_vec(len, 21);
    let residual = random_vec(len, 22);
    let scale = random_vec(filters, 23);
    let mean = random_vec(filters, 24);
    let offset = random_vec(filters, 25);
    let bias = random_vec(filters, 26);
    let engine = plain_engine();

    for combo in 0..16u32 {
        let mut args = PostOpsArgs::new(OutputLayout::Blocked8, h, w, filters)
            .with_batch(batch)
            .with_relu(combo & 8 != 0);
        if combo & 1 != 0 {
            args = args.with_affine(&scale, &mean, &offset);
        }
        if combo & 2 != 0 {
            args = args.with_bias(&bias);
        }
        if combo & 4 != 0 {
            args = args.with_residual(&residual);
        }

        let mut expected = input.clone();
        reference_blocked(&mut expected, &args);
        let mut out = input.clone();
        engine.apply(&mut out, &args);
        for (a, e) in out.iter().zip(&expected) {
            assert_abs_diff_eq!(*a, *e, epsilon = 1e-6);
        }
    }
}

#[test]
fn blocked_scale_without_mean_or_offset() {
    let scale = [3.0; 8];
    let bias = [100.0; 8];
    let args = PostOpsArgs::new(OutputLayout::Blocked8, 1, 2, 8)
        .with_scale(&scale)
        .with_bias(&bias);

    let mut out: Vec<f32> = (0..16).map(|v| v as f32).collect();
    plain_engine().apply(&mut out, &args);
    let expected: Vec<f32> = (0..16).map(|v| 3.0 * v as f32).collect();
    assert_eq!(out, expected);
}

#[test]
fn simd_and_scalar_blocked_kernels_agree() {
    if !kernels::has_avx2() {
        return;
    }
    let (h, w, filters, batch) = (5, 5, 32, 2);
    let len = batch * h * w * filters;
    let mut input = random_vec(len, 31);
    input[3] = f32::NAN;
    input[40] = -0.0;
    let residual = random_vec(len, 32);
    let scale = random_vec(filters, 33);
    let mean = random_vec(filters, 34);
    let offset = random_vec(filters, 35);
    let bias = random_vec(filters, 36);

    for combo in 0..16u32 {
        let mut args = PostOpsArgs::new(OutputLayout::Blocked8, h, w, filters)
            .with_batch(batch)
            .with_relu(combo & 8 != 0);
        if combo & 1 != 0 {
            args = args.with_affine(&scale, &mean, &offset);
        }
        if combo & 2 != 0 {
            args = args.with_bias(&bias);
        }
        if combo & 4 != 0 {
            args = args.with_residual(&residual);
        }
        let mut scalar = input.clone();
        blocked::apply_with(&mut scalar, &args, false);
        let mut simd = input.clone();
        blocked::apply_with(&mut simd, &args, true);
        assert_bits_eq(&simd, &scalar, &format!("combo {combo}"));
    }
}

#[test]
fn relu_propagates_nan() {
    let engine = plain_engine();
    for layout in [OutputLayout::Interleaved, OutputLayout::Blocked8] {
        let args = PostOpsArgs::new(layout, 1, 1, 8).with_relu(true);
        let mut out = vec![f32::NAN, -1.0, 2.0, -0.5, 0.0, 3.0, -7.0, 1.0];
        engine.apply(&mut out, &args);
        assert!(out[0].is_nan());
        assert_eq!(&out[1..], &[0.0, 2.0, 0.0, 0.0, 3.0, 0.0, 1.0]);
    }
}

#[test]
fn clip_needs_both_flags() {
    assert_eq!(clipping_engine().clip_bound(), Some(6.0));
    assert_eq!(plain_engine().clip_bound(), None);
    let upper_only = PostOpsEngine::new(&EngineConfig {
        relu_upper_bound: true,
        ..EngineConfig::default()
    });
    assert_eq!(upper_only.clip_bound(), None);
    let int8_only = PostOpsEngine::new(&EngineConfig {
        int8_support: true,
        ..EngineConfig::default()
    });
    assert_eq!(int8_only.clip_bound(), None);

    let args = PostOpsArgs::new(OutputLayout::Interleaved, 1, 1, 4).with_relu(true);
    let mut out = vec![10.0, -3.0, 6.0, 5.5];
    clipping_engine().apply(&mut out, &args);
    assert_eq!(out, vec![6.0, 0.0, 6.0, 5.5]);

    let mut out = vec![10.0, -3.0, 6.0, 5.5];
    upper_only.apply(&mut out, &args);
    assert_eq!(out, vec![10.0, 0.0, 6.0, 5.5]);
}

#[test]
fn blocked_path_is_never_clipped() {
    let args = PostOpsArgs::new(OutputLayout::Blocked8, 1, 1, 8).with_relu(true);
    let mut out = vec![10.0, 7.0, 6.5, -1.0, 6.0, 100.0, 0.5, 8.0];
    clipping_engine().apply(&mut out, &args);
    assert_eq!(out, vec![10.0, 7.0, 6.5, 0.0, 6.0, 100.0, 0.5, 8.0]);
}

#[test]
fn standalone_clip_covers_tail() {
    let mut out: Vec<f32> = (0..19).map(|v| v as f32).collect();
    clip_upper_bound(&mut out, 6.0);
    let expected: Vec<f32> = (0..19).map(|v| (v as f32).min(6.0)).collect();
    assert_eq!(out, expected);

    let mut short = vec![9.0, 1.0, f32::NAN];
    plain_engine().clip(&mut short, 2.0);
    assert_eq!(&short[..2], &[2.0, 1.0]);
    assert!(short[2].is_nan());

    let mut empty: Vec<f32> = Vec::new();
    clip_upper_bound(&mut empty, 1.0);
    assert!(empty.is_empty());
}

#[test]
fn sharding_and_pools_do_not_change_results() {
    let (h, w, filters, batch) = (5, 2, 8, 1);
    let len = batch * h * w * filters;
    let input = random_vec(len, 41);
    let bias = random_vec(filters, 42);
    let base = PostOpsArgs::new(OutputLayout::Interleaved, h, w, filters)
        .with_bias(&bias)
        .with_relu(true);

    let mut expected = input.clone();
    reference_interleaved(&mut expected, &base);

    let pool = Arc::new(rayon::ThreadPoolBuilder::new().num_threads(2).build().unwrap());
    let pooled = plain_engine().with_thread_pool(pool);
    for threads in [1, 3, 10, 64] {
        let args = base.with_threads(threads);
        let mut out = input.clone();
        plain_engine().apply(&mut out, &args);
        assert_bits_eq(&out, &expected, &format!("{threads} shards"));

        let mut out = input.clone();
        pooled.apply(&mut out, &args);
        assert_bits_eq(&out, &expected, &format!("{threads} shards, pooled"));
    }
}

#[test]
fn empty_extents_are_a_no_op() {
    let mut out = vec![1.0, -1.0];
    let args = PostOpsArgs::new(OutputLayout::Interleaved, 0, 4, 2).with_relu(true);
    plain_engine().apply(&mut out, &args);
    assert_eq!(out, vec![1.0, -1.0]);

    let args = PostOpsArgs::new(OutputLayout::Blocked8, 1, 1, 0).with_relu(true);
    plain_engine().apply(&mut out, &args);
    assert_eq!(out, vec![1.0, -1.0]);
}
