//! Plans a strided 1x1 convolution followed by a 3x3 depthwise and prints
//! what the planner decided.
//!
//! ```text
//! RUST_LOG=debug cargo run -p kjarni-primitives --example plan_conv
//! ```

use anyhow::Result;
use kjarni_primitives::*;

fn main() -> Result<()> {
    env_logger::init();

    let config = EngineConfig::from_env()?;
    configure_threading(&config);
    let engine = CpuEngine::new(config.clone());
    println!(
        "engine: {:?}, {} threads, L2 {} KiB",
        engine.isa(),
        engine.max_threads(),
        engine.l2_cache_per_core() / 1024
    );

    let desc = ConvolutionDesc::new(
        PropKind::ForwardInference,
        ConvAlgorithm::Auto,
        ConvTensors {
            src: Some(TensorDesc::new(&[8, 128, 112, 112], DType::BF16, FormatTag::Any)?),
            weights: Some(TensorDesc::new(&[256, 128, 1, 1], DType::BF16, FormatTag::Any)?),
            bias: Some(TensorDesc::new(&[256], DType::F32, FormatTag::Any)?),
            dst: Some(TensorDesc::new(&[8, 256, 56, 56], DType::BF16, FormatTag::Any)?),
        },
        ConvGeometry::strided(&[2, 2]),
    )?;
    let attr = PrimitiveAttr::new()
        .with_post_op(PostOp::relu())
        .with_post_op(PostOp::Depthwise(DepthwisePostOp::k3(1, DType::BF16)));

    let plan = match ConvPlan::create(&desc, &attr, &engine) {
        Ok(plan) => plan,
        Err(e) => {
            println!("no plan ({}): {}", e.kind(), e);
            return Ok(());
        }
    };

    println!("impl:     {}", plan.impl_name());
    println!("blocking: {}", plan.blocking());
    println!("rtus:     {}", plan.rtus().reduce_src);
    match plan.fusion_decline() {
        Some(reason) => println!("fusion:   declined, {}", reason),
        None => println!("fusion:   {}", plan.is_fused()),
    }
    println!("dst:      {}", plan.dst_desc());
    println!("scratchpad: {} bytes", plan.scratchpad().size());
    for (key, range) in plan.scratchpad().iter() {
        println!("  {:?}/{:?}: {:?}", key.prefix, key.key, range);
    }

    // finish a small channels-last output the way the kernel epilogue would
    let post_ops = PostOpsEngine::new(&config);
    let bias = vec![0.5f32; 16];
    let mut out: Vec<f32> = (0..4 * 16).map(|v| v as f32 - 32.0).collect();
    post_ops.apply(
        &mut out,
        &PostOpsArgs::new(OutputLayout::Interleaved, 2, 2, 16)
            .with_bias(&bias)
            .with_relu(true),
    );
    println!("post-ops sample: {:?}", &out[..8]);
    Ok(())
}
