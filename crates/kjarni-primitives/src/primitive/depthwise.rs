//! Depthwise convolution sub-plan, built when a depthwise post-op is
//! considered for fusion into the primary 1x1 convolution.

use super::attr::{DepthwisePostOp, PostOp, PostOpKind};
use super::blocking::{MAX_LOAD_LOOP_BLK, NUM_VREGS};
use super::scratchpad::{Registrar, ScratchpadKey};
use crate::config::CpuEngine;
use crate::error::{ensure_impl, PrimitiveResult};
use crate::tensor::{DType, FormatTag, TensorDesc, SIMD_W};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DwConfig {
    pub ndims: usize,
    pub mb: usize,
    /// Channels (one group per channel).
    pub channels: usize,
    pub ih: usize,
    pub iw: usize,
    pub oh: usize,
    pub ow: usize,
    pub kh: usize,
    pub kw: usize,
    pub stride_h: usize,
    pub stride_w: usize,
    pub t_pad: usize,
    pub l_pad: usize,
    pub ch_block: usize,
    pub nb_ch: usize,
    pub nb_ch_blocking: usize,
    pub ur_w: usize,
    /// Output width per work item; 0 when rows are not split.
    pub ow_block: usize,
    pub with_bias: bool,
    pub with_eltwise: bool,
    pub src_dt: DType,
    pub wei_dt: DType,
    pub bia_dt: Option<DType>,
    pub dst_dt: DType,
    pub is_fused_conv: bool,
    /// Channels of the intermediate buffer a fused pass writes per thread.
    pub dw_conv_buffer_oc: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DepthwisePlan {
    pub config: DwConfig,
    pub src: TensorDesc,
    pub weights: TensorDesc,
    pub bias: Option<TensorDesc>,
    pub dst: TensorDesc,
    pub post_ops: Vec<PostOp>,
}

impl DepthwisePlan {
    /// Plans the depthwise convolution `op` over `src`, applying
    /// `post_ops` to its output.
    pub fn create(
        src: &TensorDesc,
        op: &DepthwisePostOp,
        post_ops: &[PostOp],
        engine: &CpuEngine,
    ) -> PrimitiveResult<Self> {
        let ndims = src.ndims();
        ensure_impl!(
            matches!(ndims, 3 | 4),
            "depthwise convolution needs 1D or 2D spatial data, got rank {}",
            ndims
        );
        ensure_impl!(src.dtype() == DType::BF16, "depthwise source must be bf16");
        ensure_impl!(
            matches!(op.dst_dt, DType::BF16 | DType::F32),
            "depthwise destination must be bf16 or f32, got {}",
            op.dst_dt
        );
        ensure_impl!(op.weights_dt == DType::BF16, "depthwise weights must be bf16");
        ensure_impl!(
            op.bias_dt.map_or(true, |dt| matches!(dt, DType::F32 | DType::BF16)),
            "depthwise bias must be f32 or bf16"
        );
        ensure_impl!(
            src.format().channel_block() == Some(SIMD_W),
            "depthwise source must be 16-channel blocked, got {}",
            src.format()
        );
        let eltwise = post_ops.iter().filter(|p| p.kind() == PostOpKind::Eltwise).count();
        ensure_impl!(
            eltwise == post_ops.len() && eltwise <= 1,
            "depthwise supports a single eltwise post-op"
        );

        let dims = src.known_dims().unwrap_or_default();
        let (mb, channels) = (dims[0], dims[1]);
        let (ih, iw) = if ndims == 4 { (dims[2], dims[3]) } else { (1, dims[2]) };
        let (kh, stride_h, t_pad) = if ndims == 4 {
            (op.kernel, op.stride, op.padding)
        } else {
            (1, 1, 0)
        };
        let (kw, stride_w, l_pad) = (op.kernel, op.stride, op.padding);

        ensure_impl!(
            ih + 2 * t_pad >= kh && iw + 2 * l_pad >= kw,
            "depthwise kernel does not fit the padded input"
        );
        let oh = (ih + 2 * t_pad - kh) / stride_h + 1;
        let ow = (iw + 2 * l_pad - kw) / stride_w + 1;

        let ch_block = SIMD_W;
        let nb_ch = channels.div_ceil(ch_block);
        let nb_ch_blocking = nb_ch.min(MAX_LOAD_LOOP_BLK);
        let ur_w = ((NUM_VREGS - 4) / (nb_ch_blocking + 1)).clamp(1, ow);

        // split rows whose input window does not fit the core's L2
        let row_bytes = kh * iw * ch_block * nb_ch_blocking * src.dtype().size_of();
        let l2 = engine.l2_cache_per_core();
        let ow_block = if row_bytes <= l2 {
            0
        } else {
            ((ow.saturating_mul(l2) / row_bytes) / ur_w * ur_w).max(ur_w).min(ow)
        };

        let config = DwConfig {
            ndims,
            mb,
            channels,
            ih,
            iw,
            oh,
            ow,
            kh,
            kw,
            stride_h,
            stride_w,
            t_pad,
            l_pad,
            ch_block,
            nb_ch,
            nb_ch_blocking,
            ur_w,
            ow_block,
            with_bias: op.bias_dt.is_some(),
            with_eltwise: eltwise > 0,
            src_dt: src.dtype(),
            wei_dt: op.weights_dt,
            bia_dt: op.bias_dt,
            dst_dt: op.dst_dt,
            is_fused_conv: false,
            dw_conv_buffer_oc: 0,
        };

        let (wei_dims, wei_tag, dst_dims) = if ndims == 4 {
            (
                vec![channels, 1, 1, kh, kw],
                FormatTag::Goihw16g,
                vec![mb, channels, oh, ow],
            )
        } else {
            (vec![channels, 1, 1, kw], FormatTag::Goiw16g, vec![mb, channels, ow])
        };
        let weights = TensorDesc::new(&wei_dims, op.weights_dt, wei_tag)?;
        let bias = op
            .bias_dt
            .map(|dt| TensorDesc::new(&[channels], dt, FormatTag::X))
            .transpose()?;
        let dst = TensorDesc::new(&dst_dims, op.dst_dt, src.format())?;

        Ok(Self {
            config,
            src: src.clone(),
            weights,
            bias,
            dst,
            post_ops: post_ops.to_vec(),
        })
    }

    /// Books the depthwise kernel's own buffers.
    pub fn init_scratchpad(&self, registrar: &mut Registrar<'_>) -> PrimitiveResult<()> {
        let c = &self.config;
        if c.with_bias && c.channels % c.ch_block != 0 {
            let padded = c.nb_ch * c.ch_block;
            let size = c.bia_dt.map_or(0, |dt| dt.size_of());
            registrar.book(ScratchpadKey::ConvPaddedBias, padded, size)?;
        }
        Ok(())
    }
}
