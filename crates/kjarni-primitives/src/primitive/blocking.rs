//! Blocking configuration of the bf16 1x1 convolution kernels.
//!
//! A 1x1 convolution is a batched matrix multiply over three dimensions:
//! the *reduce* dimension summed over, the *load* dimension whose blocks
//! are held in registers across the inner loop, and the *broadcast*
//! dimension streamed through it. Which convolution axis plays which role
//! depends on the propagation direction:
//!
//! | direction        | reduce | load | broadcast |
//! |------------------|--------|------|-----------|
//! | forward          | ic     | oc   | spatial   |
//! | backward-data    | oc     | ic   | spatial   |
//! | backward-weights | spatial| oc   | ic        |

use std::fmt;

use super::attr::{PostOp, PostOpKind};
use super::desc::{ConvShape, PropKind};
use super::scratchpad::{Registrar, ScratchpadKey};
use crate::config::CpuEngine;
use crate::error::{ensure_impl, PrimitiveResult};
use crate::tensor::{DType, SIMD_W};

/// Vector registers available to the kernels.
pub const NUM_VREGS: usize = 32;
/// Upper bound on load blocks kept in registers at once.
pub const MAX_LOAD_LOOP_BLK: usize = 4;
/// Registers the kernel keeps for itself (bcast value, eltwise scratch).
const RESERVED_VREGS: usize = 2;
/// Extra registers taken by bf16 emulation on plain avx512_core.
const BF16_EMULATION_VREGS: usize = 4;
/// Largest spatial chunk reduced at once by backward-weights.
const MAX_BWD_W_REDUCE_BLOCK: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Isa {
    /// bf16 dot products emulated with f32 arithmetic.
    Avx512Core,
    Avx512CoreBf16,
}

impl fmt::Display for Isa {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Isa::Avx512Core => "avx512_core",
            Isa::Avx512CoreBf16 => "avx512_core_bf16",
        })
    }
}

/// Element types of the four convolution slots, by role.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConvDataTypes {
    pub src: DType,
    pub weights: DType,
    pub bias: Option<DType>,
    pub dst: DType,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockingConfig {
    pub prop: PropKind,
    pub isa: Isa,
    pub ndims: usize,
    pub ngroups: usize,
    pub mb: usize,
    /// Channels per group, padded to `simd_w`.
    pub ic: usize,
    pub oc: usize,
    pub ic_without_padding: usize,
    pub oc_without_padding: usize,
    /// `[d, h, w]` of the (possibly stride-reduced) source and destination.
    pub input: [usize; 3],
    pub output: [usize; 3],
    pub is: usize,
    pub os: usize,
    pub dtypes: ConvDataTypes,
    pub with_bias: bool,
    pub with_sum: bool,
    pub with_eltwise: bool,
    pub with_dw_conv: bool,
    /// The source is read from the unit-stride repack buffer.
    pub reduce_src: bool,

    pub simd_w: usize,
    pub ic_block: usize,
    pub oc_block: usize,

    pub reduce_dim: usize,
    pub reduce_block: usize,
    pub nb_reduce: usize,
    pub nb_reduce_blocking: usize,
    pub nb_reduce_blocking_max: usize,

    pub load_dim: usize,
    pub load_block: usize,
    pub nb_load: usize,
    pub nb_load_blocking: usize,
    pub nb_load_blocking_max: usize,

    pub bcast_dim: usize,
    pub bcast_block: usize,
    pub nb_bcast: usize,
    pub nb_bcast_blocking: usize,
    pub nb_bcast_blocking_max: usize,

    /// Broadcast rows per inner-loop iteration.
    pub ur: usize,
    pub load_grp_count: usize,

    pub nthr: usize,
    pub nthr_mb: usize,
    pub nthr_g: usize,
    pub nthr_oc_b: usize,
    pub nthr_ic_b: usize,
}

fn div_up(a: usize, b: usize) -> usize {
    a.div_ceil(b)
}

fn round_up(a: usize, b: usize) -> usize {
    div_up(a, b) * b
}

/// Smallest divisor of `value` in `[lo, hi]`, or `lo` when there is none.
fn best_divider(value: usize, lo: usize, hi: usize) -> usize {
    (lo..=hi.min(value)).find(|d| value % d == 0).unwrap_or(lo)
}

impl BlockingConfig {
    /// Derives the blocking for a validated, stride-reduced shape.
    ///
    /// `post_ops` is the part of the chain the primary kernel applies
    /// itself (everything before a depthwise entry).
    pub fn init(
        prop: PropKind,
        shape: &ConvShape,
        dtypes: ConvDataTypes,
        post_ops: &[PostOp],
        with_dw_conv: bool,
        engine: &CpuEngine,
        reduce_src: bool,
    ) -> PrimitiveResult<Self> {
        ensure_impl!(shape.is_1x1(), "only 1x1 kernels are supported");
        ensure_impl!(
            shape.stride == [1, 1, 1],
            "source must have unit stride after reduction"
        );
        ensure_impl!(
            shape.pad_l == [0, 0, 0] && shape.pad_r == [0, 0, 0],
            "padding is not supported"
        );

        let (with_sum, with_eltwise) = check_post_ops(post_ops)?;

        let isa = if engine.isa().avx512_core_bf16 {
            Isa::Avx512CoreBf16
        } else {
            Isa::Avx512Core
        };

        let simd_w = SIMD_W;
        let ic = round_up(shape.ic, simd_w);
        let oc = round_up(shape.oc, simd_w);
        let is = shape.is();
        let os = shape.os();

        let mut jcp = Self {
            prop,
            isa,
            ndims: shape.ndims,
            ngroups: shape.ngroups,
            mb: shape.mb,
            ic,
            oc,
            ic_without_padding: shape.ic,
            oc_without_padding: shape.oc,
            input: shape.input,
            output: shape.output,
            is,
            os,
            dtypes,
            with_bias: dtypes.bias.is_some(),
            with_sum,
            with_eltwise,
            with_dw_conv,
            reduce_src,
            simd_w,
            ic_block: simd_w,
            oc_block: simd_w,
            reduce_dim: 0,
            reduce_block: 0,
            nb_reduce: 0,
            nb_reduce_blocking: 0,
            nb_reduce_blocking_max: 0,
            load_dim: 0,
            load_block: 0,
            nb_load: 0,
            nb_load_blocking: 0,
            nb_load_blocking_max: 0,
            bcast_dim: 0,
            bcast_block: 0,
            nb_bcast: 0,
            nb_bcast_blocking: 0,
            nb_bcast_blocking_max: 0,
            ur: 1,
            load_grp_count: 1,
            nthr: engine.max_threads(),
            nthr_mb: 1,
            nthr_g: 1,
            nthr_oc_b: 1,
            nthr_ic_b: 1,
        };

        match prop {
            PropKind::BackwardWeights => jcp.init_bwd_weights(engine),
            _ => jcp.init_fwd_or_bwd_data(engine),
        }
        jcp.reconcile_load_blocking();
        Ok(jcp)
    }

    fn reserved_vregs(&self) -> usize {
        match self.isa {
            Isa::Avx512CoreBf16 => RESERVED_VREGS,
            Isa::Avx512Core => RESERVED_VREGS + BF16_EMULATION_VREGS,
        }
    }

    fn init_fwd_or_bwd_data(&mut self, engine: &CpuEngine) {
        let nthreads = engine.max_threads();
        let is_fwd = self.prop.is_forward();
        (self.reduce_dim, self.load_dim) = if is_fwd {
            (self.ic, self.oc)
        } else {
            (self.oc, self.ic)
        };
        self.bcast_dim = if is_fwd { self.os } else { self.is };

        self.reduce_block = self.simd_w;
        self.load_block = self.simd_w;
        self.nb_reduce = div_up(self.reduce_dim, self.reduce_block);
        self.nb_reduce_blocking = self.nb_reduce;
        self.nb_reduce_blocking_max = self.nb_reduce;
        self.nb_load = div_up(self.load_dim, self.load_block);

        let load_loop_blk = self.nb_load.min(MAX_LOAD_LOOP_BLK);
        self.ur = self.pick_ur(load_loop_blk);
        self.bcast_block = self.ur;
        self.nb_bcast = div_up(self.bcast_dim, self.bcast_block);

        // Not enough broadcast work for every thread: split the load
        // dimension across thread groups instead.
        let bcast_work = self.mb * self.ngroups * self.nb_bcast;
        self.load_grp_count = if bcast_work >= nthreads {
            1
        } else {
            let lo = div_up(nthreads, bcast_work);
            best_divider(nthreads, lo, 2 * lo).min(self.nb_load).max(1)
        };

        self.nb_load_blocking = if self.load_grp_count > 1 { 1 } else { load_loop_blk };
        self.nb_load_blocking_max = load_loop_blk.max(self.nb_load_blocking);

        // keep one broadcast tile of the full reduction in half the L2
        let tile_bytes = self.ur * self.reduce_dim * self.dtypes.src.size_of();
        let fit = (engine.l2_cache_per_core() / 2) / tile_bytes.max(1);
        self.nb_bcast_blocking = fit.clamp(1, self.nb_bcast);
        self.nb_bcast_blocking_max = self.nb_bcast_blocking;
        self.nthr = nthreads;
    }

    /// Broadcast unroll under the register budget: `ur` accumulators per
    /// load block plus one register per load block.
    fn pick_ur(&self, load_loop_blk: usize) -> usize {
        const MIN_REGS: usize = 6;
        const SIZE_THRESHOLD: usize = 14;

        let budget = NUM_VREGS - self.reserved_vregs() - load_loop_blk;
        let max_regs = (budget / load_loop_blk).max(1);
        let min_regs = MIN_REGS.min(max_regs);
        let spatial = self.output[0] * self.output[1];
        let os = self.bcast_dim;

        for ur in (min_regs..=max_regs).rev() {
            let fits = if spatial >= SIZE_THRESHOLD {
                spatial % ur == 0
            } else {
                os % ur == 0
            };
            if fits {
                return ur.min(os.max(1));
            }
        }

        // no exact divisor: take the unroll with the largest tail
        let mut ur = max_regs.min(os.max(1));
        let mut os_tail = os % max_regs;
        for i in (min_regs..=max_regs).rev() {
            let tail = os % i;
            if tail > os_tail || tail == 0 {
                ur = i.min(os.max(1));
                os_tail = tail;
                if tail == 0 {
                    break;
                }
            }
        }
        ur
    }

    fn init_bwd_weights(&mut self, engine: &CpuEngine) {
        let nthreads = engine.max_threads();

        self.reduce_dim = self.os;
        self.load_dim = self.oc;
        self.bcast_dim = self.ic;

        // vnni pairs spatial points, so the reduction is blocked in evens
        self.reduce_block = if self.reduce_dim <= MAX_BWD_W_REDUCE_BLOCK {
            round_up(self.reduce_dim, 2)
        } else {
            (2..=MAX_BWD_W_REDUCE_BLOCK)
                .rev()
                .step_by(2)
                .find(|b| self.reduce_dim % b == 0)
                .unwrap_or(MAX_BWD_W_REDUCE_BLOCK)
        };
        self.nb_reduce = div_up(self.reduce_dim, self.reduce_block);
        self.nb_reduce_blocking = self.nb_reduce;
        self.nb_reduce_blocking_max = self.nb_reduce;

        self.load_block = self.oc_block;
        self.bcast_block = self.ic_block;
        self.nb_load = div_up(self.load_dim, self.load_block);
        self.nb_bcast = div_up(self.bcast_dim, self.bcast_block);

        let load_loop_blk = self.nb_load.min(MAX_LOAD_LOOP_BLK);
        self.nb_load_blocking = load_loop_blk;
        self.nb_load_blocking_max = load_loop_blk;
        self.nb_bcast_blocking = self.nb_bcast.min(MAX_LOAD_LOOP_BLK);
        self.nb_bcast_blocking_max = self.nb_bcast_blocking;

        let budget = NUM_VREGS - self.reserved_vregs() - load_loop_blk;
        self.ur = (budget / load_loop_blk).clamp(1, self.bcast_block);
        self.load_grp_count = 1;

        self.balance(nthreads);
    }

    /// Splits threads over (mb, groups, oc blocks, ic blocks), minimizing
    /// the bytes each thread touches.
    fn balance(&mut self, nthreads: usize) {
        const SRC_COEF: usize = 4;
        const DST_COEF: usize = 2;
        const WEI_COEF: usize = 4;

        let nthr_g = self.ngroups.min(nthreads).max(1);
        let nthr = (nthreads / nthr_g).max(1);

        let mem_cost = |nthr_mb: usize, nthr_oc_b: usize, nthr_ic_b: usize| {
            let per_mb = div_up(self.mb, nthr_mb) * div_up(self.ngroups, nthr_g);
            SRC_COEF * per_mb * div_up(self.nb_bcast, nthr_ic_b) * self.ic_block * self.reduce_block
                + DST_COEF * per_mb * div_up(self.nb_load, nthr_oc_b) * self.oc_block * self.reduce_block
                + WEI_COEF
                    * div_up(self.ngroups, nthr_g)
                    * div_up(self.nb_load, nthr_oc_b)
                    * div_up(self.nb_bcast, nthr_ic_b)
                    * self.ic_block
                    * self.oc_block
        };

        let (mut best_mb, mut best_oc_b, mut best_ic_b) = (1, 1, 1);
        let mut best_cost = mem_cost(1, 1, 1);
        for nthr_mb in 1..=nthr.min(self.mb.max(1)) {
            let nthr_par = nthr / nthr_mb;
            for nthr_oc_b in 1..=nthr_par.min(self.nb_load) {
                let nthr_ic_b = (nthr_par / nthr_oc_b).min(self.nb_bcast).max(1);
                let cost = mem_cost(nthr_mb, nthr_oc_b, nthr_ic_b);
                if cost <= best_cost {
                    best_cost = cost;
                    (best_mb, best_oc_b, best_ic_b) = (nthr_mb, nthr_oc_b, nthr_ic_b);
                }
            }
        }

        self.nthr_mb = best_mb;
        self.nthr_g = nthr_g;
        self.nthr_oc_b = best_oc_b;
        self.nthr_ic_b = best_ic_b;
        self.nthr = best_mb * nthr_g * best_oc_b * best_ic_b;
    }

    /// Decreases `nb_load_blocking` until it divides `nb_load`.
    ///
    /// Terminates within `nb_load_blocking` steps since 1 divides everything.
    pub fn reconcile_load_blocking(&mut self) {
        while self.nb_load_blocking > 1 && self.nb_load % self.nb_load_blocking != 0 {
            self.nb_load_blocking -= 1;
        }
        self.nb_load_blocking = self.nb_load_blocking.max(1);
    }

    /// Books the kernel's private buffers.
    pub fn init_scratchpad(&self, registrar: &mut Registrar<'_>) -> PrimitiveResult<()> {
        let f32_size = DType::F32.size_of();
        let bf16_size = DType::BF16.size_of();

        if self.prop != PropKind::BackwardData && self.with_bias && self.oc != self.oc_without_padding {
            let bias_dt = self.dtypes.bias.unwrap_or(DType::F32);
            registrar.book(
                ScratchpadKey::ConvPaddedBias,
                self.ngroups * self.oc,
                bias_dt.size_of(),
            )?;
        }

        match self.prop {
            PropKind::BackwardWeights => {
                let wei_size = self.ngroups * self.oc * self.ic;
                let wei_buffers = if self.dtypes.weights == DType::BF16 {
                    self.nthr_mb
                } else {
                    self.nthr_mb - 1
                };
                registrar.book(ScratchpadKey::ConvWeiReduction, wei_buffers * wei_size, f32_size)?;

                if self.with_bias {
                    let bia_buffers = if self.dtypes.bias == Some(DType::BF16) {
                        self.nthr_mb
                    } else {
                        self.nthr_mb - 1
                    };
                    registrar.book(
                        ScratchpadKey::ConvBiasReduction,
                        bia_buffers * self.ngroups * self.oc,
                        f32_size,
                    )?;
                }

                let tr_reduce = round_up(self.reduce_dim, 2);
                registrar.book(
                    ScratchpadKey::ConvTrSrc,
                    self.nthr_mb * self.ngroups * self.ic * tr_reduce,
                    bf16_size,
                )?;
                registrar.book(
                    ScratchpadKey::ConvTrDiffDst,
                    self.nthr_mb * self.ngroups * self.oc * tr_reduce,
                    bf16_size,
                )?;
            }
            _ => {
                // bf16 outputs are accumulated in f32 and down-converted once
                if self.dtypes_out() == DType::BF16 {
                    let per_thread = self.nb_load_blocking_max * self.load_block * self.bcast_block;
                    registrar.book(
                        ScratchpadKey::ConvStoreWorkspace,
                        self.nthr * per_thread,
                        f32_size,
                    )?;
                }
            }
        }
        Ok(())
    }

    /// Element type the kernel writes: dst forward, diff_src backward-data,
    /// diff_weights backward-weights.
    pub fn dtypes_out(&self) -> DType {
        match self.prop {
            PropKind::BackwardData => self.dtypes.src,
            PropKind::BackwardWeights => self.dtypes.weights,
            _ => self.dtypes.dst,
        }
    }

    /// Bytes of the primary destination tensor.
    pub fn dst_bytes(&self) -> usize {
        self.mb * self.ngroups * self.oc * self.os * self.dtypes.dst.size_of()
    }
}

/// The primary kernel supports `[]`, `[eltwise]`, `[sum]` and
/// `[sum, eltwise]`. Returns `(with_sum, with_eltwise)`.
fn check_post_ops(post_ops: &[PostOp]) -> PrimitiveResult<(bool, bool)> {
    let kinds: Vec<PostOpKind> = post_ops.iter().map(PostOp::kind).collect();
    let ok = matches!(
        kinds.as_slice(),
        [] | [PostOpKind::Eltwise] | [PostOpKind::Sum] | [PostOpKind::Sum, PostOpKind::Eltwise]
    );
    ensure_impl!(ok, "unsupported post-op chain {:?}", kinds);
    Ok((
        kinds.contains(&PostOpKind::Sum),
        kinds.contains(&PostOpKind::Eltwise),
    ))
}

impl fmt::Display for BlockingConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "mb={} g={} ic={} oc={} os={} ur={} nb_reduce={} nb_load={}/{}/{} nb_bcast={}/{} load_grp={} nthr={}",
            self.mb,
            self.ngroups,
            self.ic,
            self.oc,
            self.os,
            self.ur,
            self.nb_reduce,
            self.nb_load,
            self.nb_load_blocking,
            self.nb_load_blocking_max,
            self.nb_bcast,
            self.nb_bcast_blocking,
            self.load_grp_count,
            self.nthr
        )
    }
}
