//! Operation descriptors for the convolution primitive.

use serde::{Deserialize, Serialize};

use crate::error::{ensure_args, ensure_impl, PrimitiveError, PrimitiveResult};
use crate::tensor::TensorDesc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PropKind {
    ForwardTraining,
    ForwardInference,
    /// Data and weights gradients in one pass (batch normalization only).
    Backward,
    BackwardData,
    BackwardWeights,
}

impl PropKind {
    pub fn is_forward(&self) -> bool {
        matches!(self, PropKind::ForwardTraining | PropKind::ForwardInference)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConvAlgorithm {
    /// Let the implementation pick; resolves to `Direct`.
    #[default]
    Auto,
    Direct,
    Winograd,
}

/// Tensor slots of a convolution. Backward passes put their differential
/// tensors in the matching slot (`src` holds diff_src for backward-data,
/// `weights`/`bias` hold the weight gradients for backward-weights, `dst`
/// holds diff_dst for both).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConvTensors {
    pub src: Option<TensorDesc>,
    pub weights: Option<TensorDesc>,
    pub bias: Option<TensorDesc>,
    pub dst: Option<TensorDesc>,
}

/// Spatial strides and paddings, one entry per spatial axis.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConvGeometry {
    pub strides: Vec<usize>,
    pub padding_l: Vec<usize>,
    pub padding_r: Vec<usize>,
}

impl ConvGeometry {
    /// Unit stride, no padding.
    pub fn unit(spatial_dims: usize) -> Self {
        Self::strided(&vec![1; spatial_dims])
    }

    pub fn strided(strides: &[usize]) -> Self {
        Self {
            strides: strides.to_vec(),
            padding_l: vec![0; strides.len()],
            padding_r: vec![0; strides.len()],
        }
    }
}

/// Extents derived from a validated descriptor. Spatial arrays are
/// `[d, h, w]`, with missing axes set to 1 (and stride 1, padding 0).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConvShape {
    pub ndims: usize,
    pub with_groups: bool,
    pub ngroups: usize,
    pub mb: usize,
    /// Channels per group.
    pub ic: usize,
    pub oc: usize,
    pub input: [usize; 3],
    pub output: [usize; 3],
    pub kernel: [usize; 3],
    pub stride: [usize; 3],
    pub pad_l: [usize; 3],
    pub pad_r: [usize; 3],
}

impl ConvShape {
    /// Input spatial volume.
    pub fn is(&self) -> usize {
        self.input.iter().product()
    }

    /// Output spatial volume.
    pub fn os(&self) -> usize {
        self.output.iter().product()
    }

    pub fn is_1x1(&self) -> bool {
        self.kernel == [1, 1, 1]
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ForwardConv {
    pub prop: PropKind,
    pub alg: ConvAlgorithm,
    pub src: TensorDesc,
    pub weights: TensorDesc,
    pub bias: Option<TensorDesc>,
    pub dst: TensorDesc,
    pub geometry: ConvGeometry,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BackwardDataConv {
    pub alg: ConvAlgorithm,
    pub diff_src: TensorDesc,
    pub weights: TensorDesc,
    pub diff_dst: TensorDesc,
    pub geometry: ConvGeometry,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BackwardWeightsConv {
    pub alg: ConvAlgorithm,
    pub src: TensorDesc,
    pub diff_weights: TensorDesc,
    pub diff_bias: Option<TensorDesc>,
    pub diff_dst: TensorDesc,
    pub geometry: ConvGeometry,
}

/// A validated convolution, one variant per propagation direction.
#[derive(Debug, Clone, PartialEq)]
pub enum ConvolutionDesc {
    Forward(ForwardConv),
    BackwardData(BackwardDataConv),
    BackwardWeights(BackwardWeightsConv),
}

fn required(slot: Option<TensorDesc>, name: &str, prop: PropKind) -> PrimitiveResult<TensorDesc> {
    slot.ok_or_else(|| PrimitiveError::invalid(format!("{prop:?} convolution needs a {name} descriptor")))
}

impl ConvolutionDesc {
    pub fn new(
        prop: PropKind,
        alg: ConvAlgorithm,
        tensors: ConvTensors,
        geometry: ConvGeometry,
    ) -> PrimitiveResult<Self> {
        let ConvTensors {
            src,
            weights,
            bias,
            dst,
        } = tensors;

        let desc = match prop {
            PropKind::ForwardTraining | PropKind::ForwardInference => {
                ConvolutionDesc::Forward(ForwardConv {
                    prop,
                    alg,
                    src: required(src, "src", prop)?,
                    weights: required(weights, "weights", prop)?,
                    bias,
                    dst: required(dst, "dst", prop)?,
                    geometry,
                })
            }
            PropKind::BackwardData => {
                ensure_args!(bias.is_none(), "backward-data convolution takes no bias");
                ConvolutionDesc::BackwardData(BackwardDataConv {
                    alg,
                    diff_src: required(src, "diff_src", prop)?,
                    weights: required(weights, "weights", prop)?,
                    diff_dst: required(dst, "diff_dst", prop)?,
                    geometry,
                })
            }
            PropKind::BackwardWeights => ConvolutionDesc::BackwardWeights(BackwardWeightsConv {
                alg,
                src: required(src, "src", prop)?,
                diff_weights: required(weights, "diff_weights", prop)?,
                diff_bias: bias,
                diff_dst: required(dst, "diff_dst", prop)?,
                geometry,
            }),
            PropKind::Backward => {
                return Err(PrimitiveError::invalid(
                    "convolution has no combined backward pass",
                ))
            }
        };

        let runtime = desc.tensors().iter().any(|t| t.has_runtime_dims_or_strides());
        ensure_impl!(!runtime, "runtime dims or strides are not supported");

        desc.shape()?;
        Ok(desc)
    }

    pub fn prop(&self) -> PropKind {
        match self {
            ConvolutionDesc::Forward(f) => f.prop,
            ConvolutionDesc::BackwardData(_) => PropKind::BackwardData,
            ConvolutionDesc::BackwardWeights(_) => PropKind::BackwardWeights,
        }
    }

    pub fn alg(&self) -> ConvAlgorithm {
        match self {
            ConvolutionDesc::Forward(f) => f.alg,
            ConvolutionDesc::BackwardData(b) => b.alg,
            ConvolutionDesc::BackwardWeights(b) => b.alg,
        }
    }

    pub fn geometry(&self) -> &ConvGeometry {
        match self {
            ConvolutionDesc::Forward(f) => &f.geometry,
            ConvolutionDesc::BackwardData(b) => &b.geometry,
            ConvolutionDesc::BackwardWeights(b) => &b.geometry,
        }
    }

    /// The input-side data tensor (src, or diff_src for backward-data).
    pub fn data_src(&self) -> &TensorDesc {
        match self {
            ConvolutionDesc::Forward(f) => &f.src,
            ConvolutionDesc::BackwardData(b) => &b.diff_src,
            ConvolutionDesc::BackwardWeights(b) => &b.src,
        }
    }

    /// The weights tensor (diff_weights for backward-weights).
    pub fn data_weights(&self) -> &TensorDesc {
        match self {
            ConvolutionDesc::Forward(f) => &f.weights,
            ConvolutionDesc::BackwardData(b) => &b.weights,
            ConvolutionDesc::BackwardWeights(b) => &b.diff_weights,
        }
    }

    pub fn data_bias(&self) -> Option<&TensorDesc> {
        match self {
            ConvolutionDesc::Forward(f) => f.bias.as_ref(),
            ConvolutionDesc::BackwardData(_) => None,
            ConvolutionDesc::BackwardWeights(b) => b.diff_bias.as_ref(),
        }
    }

    /// The output-side data tensor (dst, or diff_dst for backward passes).
    pub fn data_dst(&self) -> &TensorDesc {
        match self {
            ConvolutionDesc::Forward(f) => &f.dst,
            ConvolutionDesc::BackwardData(b) => &b.diff_dst,
            ConvolutionDesc::BackwardWeights(b) => &b.diff_dst,
        }
    }

    fn tensors(&self) -> Vec<&TensorDesc> {
        let mut all = vec![self.data_src(), self.data_weights(), self.data_dst()];
        all.extend(self.data_bias());
        all
    }

    /// Checks extents for consistency and derives the convolution shape.
    pub fn shape(&self) -> PrimitiveResult<ConvShape> {
        let runtime = || PrimitiveError::unimplemented("runtime dims are not supported");
        let src = self.data_src().known_dims().ok_or_else(runtime)?;
        let wei = self.data_weights().known_dims().ok_or_else(runtime)?;
        let dst = self.data_dst().known_dims().ok_or_else(runtime)?;
        let geometry = self.geometry();

        let ndims = src.len();
        ensure_args!(
            (2..=5).contains(&ndims),
            "convolution data rank must be 2..=5, got {}",
            ndims
        );
        ensure_args!(dst.len() == ndims, "src and dst ranks differ");
        let with_groups = wei.len() == ndims + 1;
        ensure_args!(
            with_groups || wei.len() == ndims,
            "weights rank {} does not match data rank {}",
            wei.len(),
            ndims
        );
        let g_off = usize::from(with_groups);
        let ngroups = if with_groups { wei[0] } else { 1 };
        ensure_args!(ngroups > 0, "group count must be positive");
        ensure_args!(src[0] == dst[0], "src and dst batch sizes differ");

        let (oc, ic) = (wei[g_off], wei[g_off + 1]);
        ensure_args!(
            dst[1] == ngroups * oc && src[1] == ngroups * ic,
            "channel counts {}→{} do not match weights {}x{}x{}",
            src[1],
            dst[1],
            ngroups,
            oc,
            ic
        );

        if let Some(bias) = self.data_bias() {
            let bias = bias.known_dims().ok_or_else(runtime)?;
            ensure_args!(
                bias == [dst[1]],
                "bias must be 1D with {} elements",
                dst[1]
            );
        }

        let spatial = ndims - 2;
        ensure_args!(
            geometry.strides.len() == spatial
                && geometry.padding_l.len() == spatial
                && geometry.padding_r.len() == spatial,
            "geometry must have {} spatial entries",
            spatial
        );
        ensure_args!(
            geometry.strides.iter().all(|&s| s > 0),
            "strides must be positive"
        );

        let mut shape = ConvShape {
            ndims,
            with_groups,
            ngroups,
            mb: src[0],
            ic,
            oc,
            input: [1; 3],
            output: [1; 3],
            kernel: [1; 3],
            stride: [1; 3],
            pad_l: [0; 3],
            pad_r: [0; 3],
        };
        // right-align spatial axes into [d, h, w]
        let base = 3 - spatial;
        for i in 0..spatial {
            let (input, k) = (src[2 + i], wei[g_off + 2 + i]);
            let (pl, pr, s) = (geometry.padding_l[i], geometry.padding_r[i], geometry.strides[i]);
            let padded = input + pl + pr;
            ensure_args!(k > 0 && padded >= k, "kernel does not fit the padded input");
            let expected = (padded - k) / s + 1;
            ensure_args!(
                dst[2 + i] == expected,
                "output extent {} on spatial axis {} should be {}",
                dst[2 + i],
                i,
                expected
            );
            shape.input[base + i] = input;
            shape.output[base + i] = dst[2 + i];
            shape.kernel[base + i] = k;
            shape.stride[base + i] = s;
            shape.pad_l[base + i] = pl;
            shape.pad_r[base + i] = pr;
        }
        Ok(shape)
    }
}

/// Execution argument slots of a plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Arg {
    Src,
    Weights,
    Bias,
    Dst,
    DiffSrc,
    DiffWeights,
    DiffBias,
    DiffDst,
    /// Weights of a fused depthwise post-op.
    DwWeights,
    /// Bias of a fused depthwise post-op.
    DwBias,
    Scratchpad,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArgUsage {
    Input,
    Output,
    Unused,
}
