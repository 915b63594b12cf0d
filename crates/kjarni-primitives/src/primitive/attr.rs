//! Primitive attributes: the ordered post-op chain and scratchpad mode.

use serde::{Deserialize, Serialize};

use crate::error::{ensure_args, ensure_impl, PrimitiveResult};
use crate::tensor::DType;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EltwiseAlg {
    Relu,
    BoundedRelu,
    Clip,
    Linear,
    Tanh,
    Logistic,
    Elu,
    Gelu,
    Swish,
}

/// Depthwise convolution appended after the primary convolution.
///
/// Square kernel, stride and padding; the channel count is the primary
/// convolution's output channel count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepthwisePostOp {
    pub kernel: usize,
    pub stride: usize,
    pub padding: usize,
    pub weights_dt: DType,
    pub bias_dt: Option<DType>,
    pub dst_dt: DType,
}

impl DepthwisePostOp {
    /// The common 3x3 / pad 1 shape with the given stride.
    pub fn k3(stride: usize, dst_dt: DType) -> Self {
        Self {
            kernel: 3,
            stride,
            padding: 1,
            weights_dt: DType::BF16,
            bias_dt: Some(DType::F32),
            dst_dt,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PostOp {
    Eltwise {
        alg: EltwiseAlg,
        alpha: f32,
        beta: f32,
        scale: f32,
    },
    /// Accumulate into the existing destination contents.
    Sum { scale: f32 },
    Depthwise(DepthwisePostOp),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PostOpKind {
    Eltwise,
    Sum,
    Depthwise,
}

impl PostOp {
    pub fn relu() -> Self {
        PostOp::Eltwise {
            alg: EltwiseAlg::Relu,
            alpha: 0.0,
            beta: 0.0,
            scale: 1.0,
        }
    }

    pub fn kind(&self) -> PostOpKind {
        match self {
            PostOp::Eltwise { .. } => PostOpKind::Eltwise,
            PostOp::Sum { .. } => PostOpKind::Sum,
            PostOp::Depthwise(_) => PostOpKind::Depthwise,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScratchpadMode {
    /// The library owns the scratchpad.
    #[default]
    Library,
    /// The caller passes a scratchpad of the plan's size at execution.
    User,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PrimitiveAttr {
    pub post_ops: Vec<PostOp>,
    pub scratchpad_mode: ScratchpadMode,
}

impl PrimitiveAttr {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_post_op(mut self, op: PostOp) -> Self {
        self.post_ops.push(op);
        self
    }

    pub fn with_scratchpad_mode(mut self, mode: ScratchpadMode) -> Self {
        self.scratchpad_mode = mode;
        self
    }

    /// Index of the first post-op of `kind`.
    pub fn find(&self, kind: PostOpKind) -> Option<usize> {
        self.post_ops.iter().position(|op| op.kind() == kind)
    }

    pub fn has_default_values(&self) -> bool {
        self.post_ops.is_empty() && self.scratchpad_mode == ScratchpadMode::Library
    }

    /// Checks the chain shape: at most one depthwise entry, at most one sum,
    /// and a well-formed depthwise geometry.
    pub fn validate(&self) -> PrimitiveResult<()> {
        let count = |kind| self.post_ops.iter().filter(|op| op.kind() == kind).count();
        ensure_impl!(
            count(PostOpKind::Depthwise) <= 1,
            "at most one depthwise post-op is supported"
        );
        ensure_impl!(count(PostOpKind::Sum) <= 1, "at most one sum post-op is supported");
        for op in &self.post_ops {
            if let PostOp::Depthwise(dw) = op {
                ensure_args!(
                    dw.kernel > 0 && dw.stride > 0,
                    "depthwise post-op needs a non-zero kernel and stride"
                );
            }
        }
        Ok(())
    }

    /// The depthwise entry, if any.
    pub fn depthwise(&self) -> Option<&DepthwisePostOp> {
        self.post_ops.iter().find_map(|op| match op {
            PostOp::Depthwise(dw) => Some(dw),
            _ => None,
        })
    }

    /// Post-ops before the depthwise entry (all of them if there is none).
    pub fn before_depthwise(&self) -> &[PostOp] {
        let end = self.find(PostOpKind::Depthwise).unwrap_or(self.post_ops.len());
        &self.post_ops[..end]
    }

    /// Post-ops after the depthwise entry (empty if there is none).
    pub fn after_depthwise(&self) -> &[PostOp] {
        match self.find(PostOpKind::Depthwise) {
            Some(i) => &self.post_ops[i + 1..],
            None => &[],
        }
    }
}
