//! CPU primitives for kjarni: planning of bf16 1x1 convolutions and the
//! fused post-ops engine that finishes their outputs.
//!
//! Planning turns a [`ConvolutionDesc`] and its [`PrimitiveAttr`] into an
//! immutable [`ConvPlan`]: kernel blocking, the reduce-to-unit-stride
//! decision, an optional fused depthwise sub-plan and a finalized
//! scratchpad layout. The [`PostOpsEngine`] applies bias, batch-norm
//! affine, residual, ReLU and clip to an f32 output in a single pass.

pub mod config;
pub mod cpu;
pub mod error;
pub mod primitive;
pub mod tensor;

pub use config::{configure_threading, CpuEngine, EngineConfig, IsaFeatures};
pub use cpu::ops::post_ops::{clip_upper_bound, OutputLayout, PostOpsArgs, PostOpsEngine};
pub use error::{PrimitiveError, PrimitiveResult, Status};
pub use primitive::{
    Arg, ArgUsage, BatchNormDesc, BatchNormFlags, ConvAlgorithm, ConvGeometry, ConvPlan, ConvTensors,
    ConvolutionDesc, DepthwisePostOp, FusionDecline, PostOp, PrimitiveAttr, PropKind, ScratchpadBuffer,
    ScratchpadKey,
};
pub use tensor::{DType, Dim, FormatTag, TensorDesc};
