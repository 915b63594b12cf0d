//! Primitive planning: descriptors, attributes and the bf16 1x1
//! convolution planner.

pub mod attr;
pub mod batch_norm;
pub mod blocking;
pub mod depthwise;
pub mod desc;
pub mod fusion;
pub mod plan;
pub mod rtus;
pub mod scratchpad;

pub use attr::{DepthwisePostOp, EltwiseAlg, PostOp, PostOpKind, PrimitiveAttr, ScratchpadMode};
pub use batch_norm::{BatchNormDesc, BatchNormFlags};
pub use blocking::{BlockingConfig, ConvDataTypes, Isa};
pub use depthwise::{DepthwisePlan, DwConfig};
pub use desc::{
    Arg, ArgUsage, ConvAlgorithm, ConvGeometry, ConvShape, ConvTensors, ConvolutionDesc, PropKind,
};
pub use fusion::FusionDecline;
pub use plan::ConvPlan;
pub use rtus::{RtusConfig, RtusDriver};
pub use scratchpad::{
    BookingKey, KeyPrefix, ScratchpadBuffer, ScratchpadKey, ScratchpadLayout, ScratchpadRegistry,
};
