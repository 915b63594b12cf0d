//! Plan → scratchpad → stride repack → post-ops, against a direct
//! reference convolution.

use std::io::Write;

use approx::assert_abs_diff_eq;
use half::bf16;
use kjarni_primitives::primitive::{BookingKey, KeyPrefix};
use kjarni_primitives::*;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

const BLOCK: usize = 16;

fn engine(threads: usize) -> CpuEngine {
    let config = EngineConfig {
        num_threads: Some(threads),
        l2_cache_per_core: Some(256 * 1024),
        ..EngineConfig::default()
    };
    CpuEngine::with_isa(config, IsaFeatures::avx512_core_bf16())
}

fn any(dims: &[usize], dt: DType) -> TensorDesc {
    TensorDesc::new(dims, dt, FormatTag::Any).unwrap()
}

fn strided_conv(ic: usize, oc: usize, hw: usize, stride: usize) -> ConvolutionDesc {
    let ohw = hw / stride;
    ConvolutionDesc::new(
        PropKind::ForwardInference,
        ConvAlgorithm::Auto,
        ConvTensors {
            src: Some(any(&[1, ic, hw, hw], DType::BF16)),
            weights: Some(any(&[oc, ic, 1, 1], DType::BF16)),
            bias: Some(any(&[oc], DType::F32)),
            dst: Some(any(&[1, oc, ohw, ohw], DType::F32)),
        },
        ConvGeometry::strided(&[stride, stride]),
    )
    .unwrap()
}

/// Index of `(c, h, w)` in a single-image nChw16c tensor.
fn blocked_index(c: usize, h: usize, w: usize, height: usize, width: usize) -> usize {
    (((c / BLOCK) * height + h) * width + w) * BLOCK + c % BLOCK
}

#[test]
fn strided_conv_through_repack_and_post_ops() {
    let (ic, oc, hw, stride) = (32, 24, 8, 2);
    let ohw = hw / stride;
    let plan = ConvPlan::create(&strided_conv(ic, oc, hw, stride), &PrimitiveAttr::new(), &engine(2))
        .unwrap();
    assert_eq!(plan.impl_name(), "jit_bf16_1x1:avx512_core_bf16");
    assert!(plan.rtus().reduce_src);

    let mut rng = StdRng::seed_from_u64(5);
    let src: Vec<bf16> = (0..ic * hw * hw)
        .map(|_| bf16::from_f32(rng.gen_range(-1.0..1.0)))
        .collect();
    let weights: Vec<f32> = (0..oc * ic).map(|_| rng.gen_range(-0.5..0.5)).collect();
    let bias: Vec<f32> = (0..oc).map(|_| rng.gen_range(-1.0..1.0)).collect();

    // repack into the booked stride space
    let mut scratch = ScratchpadBuffer::new(plan.scratchpad());
    let driver = plan.rtus_driver().unwrap();
    let space = scratch.get_mut::<bf16>(ScratchpadKey::ConvRtusSpace).unwrap();
    let per_image = (ic / BLOCK) * driver.ws_block_len();
    assert!(space.len() >= per_image);
    let packed = &mut space[..per_image];
    driver.gather(&src, packed);

    // 1x1 convolution over the unit-stride repack, channels-last f32 out
    let mut out = vec![0.0f32; ohw * ohw * oc];
    for h in 0..ohw {
        for w in 0..ohw {
            for o in 0..oc {
                let mut acc = 0.0f32;
                for c in 0..ic {
                    let x = packed[blocked_index(c, h, w, ohw, ohw)].to_f32();
                    acc += x * weights[o * ic + c];
                }
                out[(h * ohw + w) * oc + o] = acc;
            }
        }
    }

    let post_ops = PostOpsEngine::new(&EngineConfig::default());
    let args = PostOpsArgs::new(OutputLayout::Interleaved, ohw, ohw, oc)
        .with_bias(&bias)
        .with_relu(true);
    post_ops.apply(&mut out, &args);

    // direct strided convolution over the unpacked source
    for h in 0..ohw {
        for w in 0..ohw {
            for o in 0..oc {
                let mut acc = 0.0f32;
                for c in 0..ic {
                    let x = src[blocked_index(c, h * stride, w * stride, hw, hw)].to_f32();
                    acc += x * weights[o * ic + c];
                }
                let expected = (acc + bias[o]).max(0.0);
                assert_abs_diff_eq!(out[(h * ohw + w) * oc + o], expected, epsilon = 1e-5);
            }
        }
    }

    // ragged oc books a zero-padded bias the kernel can read whole blocks from
    let padded = scratch.get_mut::<f32>(ScratchpadKey::ConvPaddedBias).unwrap();
    assert_eq!(padded.len(), 32);
    padded[..oc].copy_from_slice(&bias);
    assert!(padded[oc..].iter().all(|&v| v == 0.0));
}

#[test]
fn fused_plan_exposes_prefixed_buffer() {
    let desc = ConvolutionDesc::new(
        PropKind::ForwardInference,
        ConvAlgorithm::Auto,
        ConvTensors {
            src: Some(any(&[1, 64, 56, 56], DType::BF16)),
            weights: Some(any(&[64, 64, 1, 1], DType::BF16)),
            bias: None,
            dst: Some(any(&[1, 64, 56, 56], DType::BF16)),
        },
        ConvGeometry::unit(2),
    )
    .unwrap();
    let attr = PrimitiveAttr::new().with_post_op(PostOp::Depthwise(DepthwisePostOp::k3(2, DType::F32)));
    let config = EngineConfig {
        num_threads: Some(1),
        l2_cache_per_core: Some(64 * 1024),
        ..EngineConfig::default()
    };
    let plan = ConvPlan::create(&desc, &attr, &CpuEngine::with_isa(config, IsaFeatures::avx512_core_bf16()))
        .unwrap();
    assert!(plan.is_fused(), "{:?}", plan.fusion_decline());

    let dst = plan.dst_desc();
    assert_eq!(dst.known_dims().unwrap(), vec![1, 64, 28, 28]);
    assert_eq!(dst.dtype(), DType::F32);

    let key = BookingKey {
        prefix: KeyPrefix::Fusion,
        key: ScratchpadKey::FusionInoutBuffer,
    };
    let mut scratch = ScratchpadBuffer::new(plan.scratchpad());
    let buffer = scratch.get_mut::<bf16>(key).unwrap();
    let dw = &plan.depthwise().unwrap().config;
    assert_eq!(buffer.len(), dw.kh * dw.iw * dw.dw_conv_buffer_oc);
    assert!(scratch.get_mut::<bf16>(ScratchpadKey::FusionInoutBuffer).is_none());
}

#[test]
fn scratchpad_limit_from_config_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(
        file,
        r#"{{ "num_threads": 4, "l2_cache_per_core": 262144, "max_scratchpad_bytes": 1024 }}"#
    )
    .unwrap();
    let config = EngineConfig::from_file(file.path()).unwrap();
    let engine = CpuEngine::with_isa(config, IsaFeatures::avx512_core_bf16());

    let err = ConvPlan::create(&strided_conv(64, 64, 16, 2), &PrimitiveAttr::new(), &engine).unwrap_err();
    assert_eq!(err.kind(), Status::OutOfMemory);
}
