//! Reduce-to-unit-stride: run a strided 1x1 convolution as a unit-stride
//! one over a repacked copy of the source.
//!
//! With zero padding and `dst * stride == src` on every spatial axis, a
//! strided 1x1 convolution only ever reads the source points at multiples
//! of the stride. Gathering exactly those points into a dense buffer gives
//! a source whose spatial extent equals the destination's, which the
//! unit-stride kernels can consume directly.

use rayon::prelude::*;

use super::blocking::BlockingConfig;
use super::desc::{ConvShape, PropKind};
use super::scratchpad::{Registrar, ScratchpadKey};
use crate::error::PrimitiveResult;
use crate::tensor::{FormatTag, TensorDesc};

#[derive(Debug, Clone, PartialEq)]
pub struct RtusConfig {
    pub reduce_src: bool,
    /// Elements of repack space each thread needs.
    pub space_per_thread: usize,
    /// The strided source (diff_src for backward-data) as given.
    pub original_src: TensorDesc,
    /// The source the kernel reads: the unit-stride repack when
    /// `reduce_src`, else `original_src`.
    pub reduced_src: TensorDesc,
    /// Spatial extents and strides of the original source, `[d, h, w]`.
    pub input: [usize; 3],
    pub stride: [usize; 3],
}

impl RtusConfig {
    /// Decides whether the source needs a repack and, if so, returns the
    /// unit-stride shape the kernel should see. The matching source
    /// descriptor is kept as `reduced_src`.
    ///
    /// `src` and `dst` must already carry concrete layouts.
    pub fn prepare(
        shape: &ConvShape,
        src: &TensorDesc,
        dst: &TensorDesc,
    ) -> PrimitiveResult<(Self, ConvShape)> {
        let mut config = Self {
            reduce_src: false,
            space_per_thread: 0,
            original_src: src.clone(),
            reduced_src: src.clone(),
            input: shape.input,
            stride: shape.stride,
        };

        let applicable = matches!(shape.ndims, 3 | 4)
            && shape.stride != [1, 1, 1]
            && shape.pad_l == [0, 0, 0]
            && shape.pad_r == [0, 0, 0]
            && (0..3).all(|d| shape.output[d] * shape.stride[d] == shape.input[d])
            && matches!(
                src.format(),
                FormatTag::NCw8c
                    | FormatTag::NCw16c
                    | FormatTag::Nwc
                    | FormatTag::NChw8c
                    | FormatTag::NChw16c
                    | FormatTag::Nhwc
            );
        if !applicable {
            return Ok((config, shape.clone()));
        }

        config.reduce_src = true;
        let mut reduced = shape.clone();
        reduced.input = shape.output;
        reduced.stride = [1, 1, 1];

        let mut dims = src.known_dims().unwrap_or_default();
        let dst_dims = dst.known_dims().unwrap_or_default();
        for d in 2..dims.len() {
            dims[d] = dst_dims[d];
        }
        config.reduced_src = src.reshaped(&dims)?;
        Ok((config, reduced))
    }

    /// Books `max_threads * space_per_thread` elements of the source type.
    ///
    /// The per-thread space holds `factor` channel blocks of one image,
    /// where the factor is the number of source channel blocks a thread
    /// touches at once in the given direction.
    pub fn book_space(
        &mut self,
        jcp: &BlockingConfig,
        registrar: &mut Registrar<'_>,
        max_threads: usize,
    ) -> PrimitiveResult<()> {
        if !self.reduce_src {
            return Ok(());
        }
        let factor = match jcp.prop {
            PropKind::BackwardData => jcp.nb_load_blocking_max,
            PropKind::BackwardWeights => jcp.nb_bcast_blocking,
            _ => jcp.nb_reduce,
        };
        self.space_per_thread = factor * jcp.is * jcp.ic_block;
        registrar.book(
            ScratchpadKey::ConvRtusSpace,
            max_threads * self.space_per_thread,
            self.original_src.dtype().size_of(),
        )
    }
}

/// Moves data between a strided channel-blocked source and its unit-stride
/// repack. Both sides use `N × C/block × spatial × block` order.
#[derive(Debug, Clone)]
pub struct RtusDriver {
    ih: usize,
    iw: usize,
    oh: usize,
    ow: usize,
    stride_h: usize,
    stride_w: usize,
    block: usize,
}

impl RtusDriver {
    pub fn new(rtus: &RtusConfig, output: [usize; 3], block: usize) -> Self {
        Self {
            ih: rtus.input[1],
            iw: rtus.input[2],
            oh: output[1],
            ow: output[2],
            stride_h: rtus.stride[1],
            stride_w: rtus.stride[2],
            block,
        }
    }

    /// Elements of one channel block of one image in the source.
    pub fn src_block_len(&self) -> usize {
        self.ih * self.iw * self.block
    }

    /// Elements of one channel block of one image in the repack.
    pub fn ws_block_len(&self) -> usize {
        self.oh * self.ow * self.block
    }

    /// Copies the strided points of one channel block into `ws`.
    pub fn gather_block<T: Copy>(&self, src: &[T], ws: &mut [T]) {
        let b = self.block;
        for oh in 0..self.oh {
            let src_row = oh * self.stride_h * self.iw;
            for ow in 0..self.ow {
                let s = (src_row + ow * self.stride_w) * b;
                let d = (oh * self.ow + ow) * b;
                ws[d..d + b].copy_from_slice(&src[s..s + b]);
            }
        }
    }

    /// Writes one repacked channel block back to its strided positions,
    /// zeroing the positions the convolution never touched.
    pub fn scatter_block<T: Copy + Default>(&self, ws: &[T], diff_src: &mut [T]) {
        diff_src.fill(T::default());
        let b = self.block;
        for oh in 0..self.oh {
            let dst_row = oh * self.stride_h * self.iw;
            for ow in 0..self.ow {
                let d = (dst_row + ow * self.stride_w) * b;
                let s = (oh * self.ow + ow) * b;
                diff_src[d..d + b].copy_from_slice(&ws[s..s + b]);
            }
        }
    }

    /// Repacks a whole tensor, one task per (image, channel block).
    pub fn gather<T: Copy + Send + Sync>(&self, src: &[T], ws: &mut [T]) {
        let (src_len, ws_len) = (self.src_block_len(), self.ws_block_len());
        ws.par_chunks_mut(ws_len)
            .zip(src.par_chunks(src_len))
            .for_each(|(ws_blk, src_blk)| self.gather_block(src_blk, ws_blk));
    }

    /// Inverse of [`gather`](Self::gather) for backward-data.
    pub fn scatter<T: Copy + Default + Send + Sync>(&self, ws: &[T], diff_src: &mut [T]) {
        let (src_len, ws_len) = (self.src_block_len(), self.ws_block_len());
        diff_src
            .par_chunks_mut(src_len)
            .zip(ws.par_chunks(ws_len))
            .for_each(|(src_blk, ws_blk)| self.scatter_block(ws_blk, src_blk));
    }
}
