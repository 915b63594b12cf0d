//! Fusion of a depthwise post-op into the primary 1x1 convolution.
//!
//! A fused pass writes a few rows of the 1x1 output into a per-thread
//! buffer and runs the depthwise kernel over them while they are still in
//! cache. Fusion only changes performance, so every failure here declines
//! it and the plan proceeds unfused.

use std::fmt;

use super::attr::{PostOpKind, PrimitiveAttr};
use super::blocking::BlockingConfig;
use super::depthwise::DepthwisePlan;
use super::scratchpad::{KeyPrefix, Registrar, ScratchpadKey};
use crate::config::CpuEngine;
use crate::error::{PrimitiveError, PrimitiveResult};
use crate::tensor::{DType, TensorDesc};

/// Why a requested depthwise fusion was not performed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FusionDecline {
    /// A matrix-accelerated implementation is preferred on this machine.
    AmxAvailable,
    /// A sum post-op precedes the depthwise entry.
    SumPostOp,
    /// The intermediate tensor fits in the threads' combined L2.
    FitsInCache { dst_bytes: usize, budget: usize },
    /// The 1x1 kernel splits its load dimension across thread groups.
    LoadGroups(usize),
    /// Only bf16 1x1 outputs feed the fused depthwise kernel.
    PrimaryDstType(DType),
    /// The depthwise sub-plan itself could not be built.
    Depthwise(PrimitiveError),
    SourceMismatch,
    ChannelPadding { oc: usize, oc_block: usize },
    WidthBlocked { ow_block: usize, ow: usize },
}

impl fmt::Display for FusionDecline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FusionDecline::AmxAvailable => write!(f, "amx_bf16 is available"),
            FusionDecline::SumPostOp => write!(f, "sum post-op before depthwise"),
            FusionDecline::FitsInCache { dst_bytes, budget } => {
                write!(f, "dst of {dst_bytes} bytes fits in {budget} bytes of cache")
            }
            FusionDecline::LoadGroups(n) => write!(f, "load_grp_count {n} >= 2"),
            FusionDecline::PrimaryDstType(dt) => write!(f, "1x1 dst type {dt} is not bf16"),
            FusionDecline::Depthwise(e) => write!(f, "depthwise plan failed: {e}"),
            FusionDecline::SourceMismatch => write!(f, "depthwise src differs from 1x1 dst"),
            FusionDecline::ChannelPadding { oc, oc_block } => {
                write!(f, "oc {oc} is not a multiple of {oc_block}")
            }
            FusionDecline::WidthBlocked { ow_block, ow } => {
                write!(f, "depthwise ow_block {ow_block} splits ow {ow}")
            }
        }
    }
}

/// Outcome of an accepted fusion: the reconciled 1x1 blocking and the
/// depthwise sub-plan tuned to it.
#[derive(Debug)]
pub struct Fusion {
    pub jcp: BlockingConfig,
    pub depthwise: DepthwisePlan,
}

/// Checks eligibility, builds the depthwise sub-plan and reconciles both
/// blockings. `jcp` is left untouched; the caller adopts `Fusion::jcp`.
pub fn decide_fusion(
    jcp: &BlockingConfig,
    primary_dst: &TensorDesc,
    attr: &PrimitiveAttr,
    engine: &CpuEngine,
) -> Result<Fusion, FusionDecline> {
    let Some(dw_op) = attr.depthwise() else {
        return Err(FusionDecline::Depthwise(PrimitiveError::invalid(
            "no depthwise post-op",
        )));
    };

    if engine.isa().amx_bf16 {
        return Err(FusionDecline::AmxAvailable);
    }
    if attr
        .before_depthwise()
        .iter()
        .any(|op| op.kind() == PostOpKind::Sum)
    {
        return Err(FusionDecline::SumPostOp);
    }
    // a budget past usize::MAX holds any destination
    let budget = engine
        .l2_cache_per_core()
        .saturating_mul(engine.max_threads())
        .saturating_mul(2);
    let dst_bytes = primary_dst.size_bytes();
    if budget >= dst_bytes {
        return Err(FusionDecline::FitsInCache { dst_bytes, budget });
    }
    if jcp.load_grp_count >= 2 {
        return Err(FusionDecline::LoadGroups(jcp.load_grp_count));
    }
    if jcp.dtypes.dst != DType::BF16 {
        return Err(FusionDecline::PrimaryDstType(jcp.dtypes.dst));
    }

    let mut depthwise = DepthwisePlan::create(primary_dst, dw_op, attr.after_depthwise(), engine)
        .map_err(FusionDecline::Depthwise)?;

    if depthwise.src != *primary_dst {
        return Err(FusionDecline::SourceMismatch);
    }
    if jcp.oc_without_padding % jcp.oc_block != 0 {
        return Err(FusionDecline::ChannelPadding {
            oc: jcp.oc_without_padding,
            oc_block: jcp.oc_block,
        });
    }
    let dw = &mut depthwise.config;
    if dw.ow_block != 0 && dw.ow_block != dw.ow {
        return Err(FusionDecline::WidthBlocked {
            ow_block: dw.ow_block,
            ow: dw.ow,
        });
    }

    let mut jcp = jcp.clone();
    dw.is_fused_conv = true;
    // depthwise channel work must tile the 1x1 load blocking exactly
    jcp.reconcile_load_blocking();
    jcp.nb_load_blocking_max = jcp.nb_load_blocking;
    while dw.nb_ch_blocking > 1 && jcp.nb_load_blocking % dw.nb_ch_blocking != 0 {
        dw.nb_ch_blocking -= 1;
    }
    dw.dw_conv_buffer_oc = jcp.nb_load_blocking * jcp.oc_block;

    Ok(Fusion { jcp, depthwise })
}

/// Books the fused intermediate buffer and the depthwise kernel's buffers
/// under the fusion prefix.
pub fn book_fusion_scratchpad(
    depthwise: &DepthwisePlan,
    registrar: &mut Registrar<'_>,
    nthr: usize,
) -> PrimitiveResult<()> {
    let dw = &depthwise.config;
    let mut fused = registrar.prefixed(KeyPrefix::Fusion);
    fused.book(
        ScratchpadKey::FusionInoutBuffer,
        nthr * dw.kh * dw.iw * dw.dw_conv_buffer_oc,
        depthwise.src.dtype().size_of(),
    )?;
    depthwise.init_scratchpad(&mut fused)
}
