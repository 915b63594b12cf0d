//! Execution plan of the bf16 1x1 convolution.

use super::attr::{PostOp, PostOpKind, PrimitiveAttr, ScratchpadMode};
use super::blocking::{BlockingConfig, ConvDataTypes};
use super::depthwise::DepthwisePlan;
use super::desc::{
    Arg, ArgUsage, BackwardDataConv, BackwardWeightsConv, ConvAlgorithm, ConvolutionDesc,
    ForwardConv, PropKind,
};
use super::fusion::{book_fusion_scratchpad, decide_fusion, FusionDecline};
use super::rtus::{RtusConfig, RtusDriver};
use super::scratchpad::{ScratchpadLayout, ScratchpadRegistry};
use crate::config::CpuEngine;
use crate::error::{ensure_impl, PrimitiveError, PrimitiveResult};
use crate::tensor::{DType, FormatTag, TensorDesc};

/// A validated, immutable plan for one convolution.
///
/// Holds the blocking the kernels run with, the stride-reduction decision,
/// an optional fused depthwise sub-plan and the finalized scratchpad.
#[derive(Debug, Clone)]
pub struct ConvPlan {
    desc: ConvolutionDesc,
    attr: PrimitiveAttr,
    jcp: BlockingConfig,
    rtus: RtusConfig,
    depthwise: Option<Box<DepthwisePlan>>,
    fusion_decline: Option<FusionDecline>,
    kernel_post_ops: Vec<PostOp>,
    unfused_post_ops: Vec<PostOp>,
    registry: ScratchpadRegistry,
    scratchpad: ScratchpadLayout,
}

impl ConvPlan {
    pub fn create(
        desc: &ConvolutionDesc,
        attr: &PrimitiveAttr,
        engine: &CpuEngine,
    ) -> PrimitiveResult<Self> {
        attr.validate()?;
        ensure_impl!(engine.isa().avx512_core, "avx512_core is required");
        ensure_impl!(
            desc.alg() != ConvAlgorithm::Winograd,
            "winograd is not implemented for 1x1 convolutions"
        );

        let prop = desc.prop();
        let dtypes = check_data_types(desc)?;
        if !prop.is_forward() {
            ensure_impl!(
                attr.has_default_values(),
                "backward convolutions take no attributes"
            );
        }
        let zero_dim = [desc.data_src(), desc.data_weights(), desc.data_dst()]
            .iter()
            .any(|t| t.has_zero_dim());
        ensure_impl!(!zero_dim, "zero-sized tensors are not supported");

        let desc = with_default_formats(desc)?;
        let shape = desc.shape()?;

        let (mut rtus, reduced_shape) = RtusConfig::prepare(&shape, desc.data_src(), desc.data_dst())?;

        let with_dw = prop.is_forward() && attr.find(PostOpKind::Depthwise).is_some();
        let mut jcp = BlockingConfig::init(
            prop,
            &reduced_shape,
            dtypes,
            attr.before_depthwise(),
            with_dw,
            engine,
            rtus.reduce_src,
        )?;

        let mut depthwise = None;
        let mut fusion_decline = None;
        if with_dw {
            match decide_fusion(&jcp, desc.data_dst(), attr, engine) {
                Ok(fusion) => {
                    jcp = fusion.jcp;
                    depthwise = Some(Box::new(fusion.depthwise));
                }
                Err(reason) => {
                    log::debug!("jit_bf16_1x1: depthwise fusion declined: {}", reason);
                    jcp.with_dw_conv = false;
                    fusion_decline = Some(reason);
                }
            }
        }

        let kernel_post_ops = attr.before_depthwise().to_vec();
        let unfused_post_ops = match (&depthwise, attr.find(PostOpKind::Depthwise)) {
            (None, Some(i)) => attr.post_ops[i..].to_vec(),
            _ => Vec::new(),
        };

        let mut registry = ScratchpadRegistry::new();
        {
            let mut registrar = registry.registrar();
            if let Some(dw) = &depthwise {
                book_fusion_scratchpad(dw, &mut registrar, engine.max_threads())?;
            }
            jcp.init_scratchpad(&mut registrar)?;
            rtus.book_space(&jcp, &mut registrar, engine.max_threads())?;
        }
        let config = engine.config();
        let scratchpad =
            registry.finalize(config.scratchpad_alignment, config.max_scratchpad_bytes)?;

        let plan = Self {
            desc,
            attr: attr.clone(),
            jcp,
            rtus,
            depthwise,
            fusion_decline,
            kernel_post_ops,
            unfused_post_ops,
            registry,
            scratchpad,
        };
        log::debug!(
            "{}: {} {} rtus={} fused={} scratchpad={}B",
            plan.impl_name(),
            prop.short_name(),
            plan.jcp,
            plan.rtus.reduce_src,
            plan.is_fused(),
            plan.scratchpad.size()
        );
        Ok(plan)
    }

    pub fn impl_name(&self) -> String {
        format!("jit_bf16_1x1:{}", self.jcp.isa)
    }

    /// The descriptor with every `Any` layout resolved.
    pub fn desc(&self) -> &ConvolutionDesc {
        &self.desc
    }

    pub fn attr(&self) -> &PrimitiveAttr {
        &self.attr
    }

    pub fn blocking(&self) -> &BlockingConfig {
        &self.jcp
    }

    pub fn rtus(&self) -> &RtusConfig {
        &self.rtus
    }

    /// Driver for the source repack, when the plan reduces strides.
    pub fn rtus_driver(&self) -> Option<RtusDriver> {
        self.rtus
            .reduce_src
            .then(|| RtusDriver::new(&self.rtus, self.jcp.output, self.jcp.ic_block))
    }

    pub fn depthwise(&self) -> Option<&DepthwisePlan> {
        self.depthwise.as_deref()
    }

    pub fn is_fused(&self) -> bool {
        self.depthwise.is_some()
    }

    /// Why a requested depthwise fusion was declined.
    pub fn fusion_decline(&self) -> Option<&FusionDecline> {
        self.fusion_decline.as_ref()
    }

    /// Post-ops the 1x1 kernel applies itself.
    pub fn kernel_post_ops(&self) -> &[PostOp] {
        &self.kernel_post_ops
    }

    /// Post-ops the caller must run after this plan, starting with the
    /// depthwise entry when fusion was declined.
    pub fn unfused_post_ops(&self) -> &[PostOp] {
        &self.unfused_post_ops
    }

    pub fn scratchpad(&self) -> &ScratchpadLayout {
        &self.scratchpad
    }

    pub fn scratchpad_registry(&self) -> &ScratchpadRegistry {
        &self.registry
    }

    /// Final output descriptor: the depthwise output when fused.
    pub fn dst_desc(&self) -> &TensorDesc {
        match &self.depthwise {
            Some(dw) => &dw.dst,
            None => self.desc.data_dst(),
        }
    }

    pub fn arg_desc(&self, arg: Arg) -> Option<&TensorDesc> {
        match (&self.desc, arg) {
            (_, Arg::DwWeights) => self.depthwise.as_ref().map(|dw| &dw.weights),
            (_, Arg::DwBias) => self.depthwise.as_ref().and_then(|dw| dw.bias.as_ref()),
            (ConvolutionDesc::Forward(f), Arg::Src) => Some(&f.src),
            (ConvolutionDesc::Forward(f), Arg::Weights) => Some(&f.weights),
            (ConvolutionDesc::Forward(f), Arg::Bias) => f.bias.as_ref(),
            (ConvolutionDesc::Forward(_), Arg::Dst) => Some(self.dst_desc()),
            (ConvolutionDesc::BackwardData(b), Arg::DiffSrc) => Some(&b.diff_src),
            (ConvolutionDesc::BackwardData(b), Arg::Weights) => Some(&b.weights),
            (ConvolutionDesc::BackwardData(b), Arg::DiffDst) => Some(&b.diff_dst),
            (ConvolutionDesc::BackwardWeights(b), Arg::Src) => Some(&b.src),
            (ConvolutionDesc::BackwardWeights(b), Arg::DiffWeights) => Some(&b.diff_weights),
            (ConvolutionDesc::BackwardWeights(b), Arg::DiffBias) => b.diff_bias.as_ref(),
            (ConvolutionDesc::BackwardWeights(b), Arg::DiffDst) => Some(&b.diff_dst),
            _ => None,
        }
    }

    pub fn arg_usage(&self, arg: Arg) -> ArgUsage {
        if arg == Arg::Scratchpad {
            return if self.attr.scratchpad_mode == ScratchpadMode::User && self.scratchpad.size() > 0 {
                ArgUsage::Output
            } else {
                ArgUsage::Unused
            };
        }
        if self.arg_desc(arg).is_none() {
            return ArgUsage::Unused;
        }
        match arg {
            Arg::Dst | Arg::DiffSrc | Arg::DiffWeights | Arg::DiffBias => ArgUsage::Output,
            _ => ArgUsage::Input,
        }
    }
}

fn check_data_types(desc: &ConvolutionDesc) -> PrimitiveResult<ConvDataTypes> {
    use DType::{BF16, F32};

    let dtypes = ConvDataTypes {
        src: desc.data_src().dtype(),
        weights: desc.data_weights().dtype(),
        bias: desc.data_bias().map(TensorDesc::dtype),
        dst: desc.data_dst().dtype(),
    };
    let bias_ok = dtypes.bias.map_or(true, |dt| matches!(dt, F32 | BF16));
    let ok = match desc {
        ConvolutionDesc::Forward(_) => {
            dtypes.src == BF16 && dtypes.weights == BF16 && matches!(dtypes.dst, BF16 | F32) && bias_ok
        }
        ConvolutionDesc::BackwardData(_) => {
            matches!(dtypes.src, BF16 | F32) && dtypes.weights == BF16 && dtypes.dst == BF16
        }
        ConvolutionDesc::BackwardWeights(_) => {
            dtypes.src == BF16 && matches!(dtypes.weights, BF16 | F32) && dtypes.dst == BF16 && bias_ok
        }
    };
    ensure_impl!(
        ok,
        "unsupported data types src={} weights={} bias={:?} dst={}",
        dtypes.src,
        dtypes.weights,
        dtypes.bias,
        dtypes.dst
    );
    Ok(dtypes)
}

/// Resolves `Any` to the kernel's layout and rejects any other layout.
fn resolve(tensor: &TensorDesc, tag: FormatTag) -> PrimitiveResult<TensorDesc> {
    if tensor.format().is_any() {
        return tensor.with_format(tag);
    }
    ensure_impl!(
        tensor.format() == tag && tensor.explicit_strides().is_none(),
        "layout {} is not supported, expected {}",
        tensor.format(),
        tag
    );
    Ok(tensor.clone())
}

fn resolve_bias(bias: &Option<TensorDesc>) -> PrimitiveResult<Option<TensorDesc>> {
    bias.as_ref().map(|b| resolve(b, FormatTag::X)).transpose()
}

fn with_default_formats(desc: &ConvolutionDesc) -> PrimitiveResult<ConvolutionDesc> {
    let ndims = desc.data_src().ndims();
    let grouped = desc.data_weights().ndims() == ndims + 1;
    let unsupported = || PrimitiveError::unimplemented(format!("no layout for rank {ndims}"));
    let dat_tag = FormatTag::blocked_data(ndims).ok_or_else(unsupported)?;

    Ok(match desc {
        ConvolutionDesc::Forward(f) => {
            let wei_tag = FormatTag::fwd_weights(ndims, grouped).ok_or_else(unsupported)?;
            ConvolutionDesc::Forward(ForwardConv {
                src: resolve(&f.src, dat_tag)?,
                weights: resolve(&f.weights, wei_tag)?,
                bias: resolve_bias(&f.bias)?,
                dst: resolve(&f.dst, dat_tag)?,
                alg: ConvAlgorithm::Direct,
                ..f.clone()
            })
        }
        ConvolutionDesc::BackwardData(b) => {
            let wei_tag = FormatTag::bwd_data_weights(ndims, grouped).ok_or_else(unsupported)?;
            ConvolutionDesc::BackwardData(BackwardDataConv {
                diff_src: resolve(&b.diff_src, dat_tag)?,
                weights: resolve(&b.weights, wei_tag)?,
                diff_dst: resolve(&b.diff_dst, dat_tag)?,
                alg: ConvAlgorithm::Direct,
                ..b.clone()
            })
        }
        ConvolutionDesc::BackwardWeights(b) => {
            let wei_tag = FormatTag::bwd_weights_weights(ndims, grouped).ok_or_else(unsupported)?;
            ConvolutionDesc::BackwardWeights(BackwardWeightsConv {
                src: resolve(&b.src, dat_tag)?,
                diff_weights: resolve(&b.diff_weights, wei_tag)?,
                diff_bias: resolve_bias(&b.diff_bias)?,
                diff_dst: resolve(&b.diff_dst, dat_tag)?,
                alg: ConvAlgorithm::Direct,
                ..b.clone()
            })
        }
    })
}

impl PropKind {
    /// Short name used in plan logs.
    pub fn short_name(&self) -> &'static str {
        match self {
            PropKind::ForwardTraining => "fwd_t",
            PropKind::ForwardInference => "fwd_i",
            PropKind::Backward => "bwd",
            PropKind::BackwardData => "bwd_d",
            PropKind::BackwardWeights => "bwd_w",
        }
    }
}
