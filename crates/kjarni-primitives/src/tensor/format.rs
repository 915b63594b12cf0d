//! Memory format tags.
//!
//! A tag fixes the physical order of a tensor's logical axes and which axes
//! are split into fixed-width inner blocks. Lowercase letters in a tag name
//! are plain axes, uppercase letters are blocked axes, and the trailing
//! `<n><axis>` groups describe the inner block, e.g. `nChw16c` stores
//! `N × ⌈C/16⌉ × H × W × 16`.

use serde::{Deserialize, Serialize};

/// Channel width of the blocked data layouts used by the 1x1 kernels.
pub const SIMD_W: usize = 16;
/// Channel width of the blocked layout consumed by the post-ops engine.
pub const POST_OPS_BLOCK: usize = 8;

#[allow(non_camel_case_types)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FormatTag {
    /// Let the primitive choose.
    Any,
    /// 1D, used by bias and statistics vectors
    X,

    // plain, channels second
    Nc,
    Ncw,
    Nchw,
    Ncdhw,

    // channels last (interleaved)
    Nwc,
    Nhwc,
    Ndhwc,

    // 8-wide channel blocks
    NCw8c,
    NChw8c,
    NCdhw8c,

    // 16-wide channel blocks
    NC16c,
    NCw16c,
    NChw16c,
    NCdhw16c,

    // forward weights, bf16 vnni packing
    OI8i16o2i,
    OIw8i16o2i,
    OIhw8i16o2i,
    OIdhw8i16o2i,
    GOI8i16o2i,
    GOIw8i16o2i,
    GOIhw8i16o2i,
    GOIdhw8i16o2i,

    // backward-data weights
    IO8o16i2o,
    IOw8o16i2o,
    IOhw8o16i2o,
    IOdhw8o16i2o,
    GIO8o16i2o,
    GIOw8o16i2o,
    GIOhw8o16i2o,
    GIOdhw8o16i2o,

    // backward-weights diff weights
    OI16i16o,
    OIw16i16o,
    OIhw16i16o,
    OIdhw16i16o,
    GOI16i16o,
    GOIw16i16o,
    GOIhw16i16o,
    GOIdhw16i16o,

    // depthwise weights
    Goiw16g,
    Goihw16g,
}

use FormatTag::*;

impl FormatTag {
    /// Number of logical dimensions the tag describes, `None` for `Any`.
    pub fn ndims(&self) -> Option<usize> {
        let n = match self {
            Any => return None,
            X => 1,
            Nc | NC16c => 2,
            Ncw | Nwc | NCw8c | NCw16c => 3,
            Nchw | Nhwc | NChw8c | NChw16c => 4,
            Ncdhw | Ndhwc | NCdhw8c | NCdhw16c => 5,
            OI8i16o2i | IO8o16i2o | OI16i16o => 2,
            OIw8i16o2i | IOw8o16i2o | OIw16i16o | GOI8i16o2i | GIO8o16i2o | GOI16i16o => 3,
            OIhw8i16o2i | IOhw8o16i2o | OIhw16i16o | GOIw8i16o2i | GIOw8o16i2o | GOIw16i16o => 4,
            Goiw16g => 4,
            OIdhw8i16o2i | IOdhw8o16i2o | OIdhw16i16o | GOIhw8i16o2i | GIOhw8o16i2o
            | GOIhw16i16o => 5,
            Goihw16g => 5,
            GOIdhw8i16o2i | GIOdhw8o16i2o | GOIdhw16i16o => 6,
        };
        Some(n)
    }

    /// Axes split into inner blocks, as `(axis, block)` pairs.
    pub fn blocks(&self) -> Vec<(usize, usize)> {
        match self {
            Any | X | Nc | Ncw | Nchw | Ncdhw | Nwc | Nhwc | Ndhwc => vec![],
            NCw8c | NChw8c | NCdhw8c => vec![(1, POST_OPS_BLOCK)],
            NC16c | NCw16c | NChw16c | NCdhw16c => vec![(1, SIMD_W)],
            Goiw16g | Goihw16g => vec![(0, SIMD_W)],
            _ => {
                // o and i are both padded to 16 in every weights packing
                let g = usize::from(self.is_grouped_weights());
                vec![(g, SIMD_W), (g + 1, SIMD_W)]
            }
        }
    }

    /// Physical order of the outer (non-inner-block) axes, outermost first.
    pub fn outer_order(&self) -> Vec<usize> {
        let n = self.ndims().unwrap_or(0);
        match self {
            Nwc | Nhwc | Ndhwc => {
                let mut order = vec![0];
                order.extend(2..n);
                order.push(1);
                order
            }
            IO8o16i2o | IOw8o16i2o | IOhw8o16i2o | IOdhw8o16i2o => {
                let mut order = vec![1, 0];
                order.extend(2..n);
                order
            }
            GIO8o16i2o | GIOw8o16i2o | GIOhw8o16i2o | GIOdhw8o16i2o => {
                let mut order = vec![0, 2, 1];
                order.extend(3..n);
                order
            }
            _ => (0..n).collect(),
        }
    }

    pub fn is_any(&self) -> bool {
        matches!(self, Any)
    }

    /// Plain (unblocked) tag, the only kind that may carry explicit strides.
    pub fn is_plain(&self) -> bool {
        matches!(self, X | Nc | Ncw | Nchw | Ncdhw | Nwc | Nhwc | Ndhwc)
    }

    /// Plain row-major tag for `ndims` dimensions.
    pub fn plain(ndims: usize) -> Option<Self> {
        pick(ndims.checked_sub(1)?, &[X, Nc, Ncw, Nchw, Ncdhw])
    }

    pub fn is_grouped_weights(&self) -> bool {
        matches!(
            self,
            GOI8i16o2i
                | GOIw8i16o2i
                | GOIhw8i16o2i
                | GOIdhw8i16o2i
                | GIO8o16i2o
                | GIOw8o16i2o
                | GIOhw8o16i2o
                | GIOdhw8o16i2o
                | GOI16i16o
                | GOIw16i16o
                | GOIhw16i16o
                | GOIdhw16i16o
                | Goiw16g
                | Goihw16g
        )
    }

    /// Channels-last data layout (the post-ops "interleaved" layout).
    pub fn is_channels_last(&self) -> bool {
        matches!(self, Nwc | Nhwc | Ndhwc)
    }

    /// Width of the channel block for blocked data layouts.
    pub fn channel_block(&self) -> Option<usize> {
        match self {
            NCw8c | NChw8c | NCdhw8c => Some(POST_OPS_BLOCK),
            NC16c | NCw16c | NChw16c | NCdhw16c => Some(SIMD_W),
            _ => None,
        }
    }

    /// Default data tag for the 16-wide kernels: rank 2 → `nC16c`,
    /// 3 → `nCw16c`, 4 → `nChw16c`, 5 → `nCdhw16c`.
    pub fn blocked_data(ndims: usize) -> Option<Self> {
        pick(ndims.checked_sub(2)?, &[NC16c, NCw16c, NChw16c, NCdhw16c])
    }

    /// Forward weights tag (`[g]OI*8i16o2i`) for data rank `ndims`.
    pub fn fwd_weights(ndims: usize, with_groups: bool) -> Option<Self> {
        pick(
            weights_index(ndims, with_groups)?,
            &[
                OI8i16o2i,
                GOI8i16o2i,
                OIw8i16o2i,
                GOIw8i16o2i,
                OIhw8i16o2i,
                GOIhw8i16o2i,
                OIdhw8i16o2i,
                GOIdhw8i16o2i,
            ],
        )
    }

    /// Backward-data weights tag (`[g]IO*8o16i2o`).
    pub fn bwd_data_weights(ndims: usize, with_groups: bool) -> Option<Self> {
        pick(
            weights_index(ndims, with_groups)?,
            &[
                IO8o16i2o,
                GIO8o16i2o,
                IOw8o16i2o,
                GIOw8o16i2o,
                IOhw8o16i2o,
                GIOhw8o16i2o,
                IOdhw8o16i2o,
                GIOdhw8o16i2o,
            ],
        )
    }

    /// Backward-weights diff weights tag (`[g]OI*16i16o`).
    pub fn bwd_weights_weights(ndims: usize, with_groups: bool) -> Option<Self> {
        pick(
            weights_index(ndims, with_groups)?,
            &[
                OI16i16o,
                GOI16i16o,
                OIw16i16o,
                GOIw16i16o,
                OIhw16i16o,
                GOIhw16i16o,
                OIdhw16i16o,
                GOIdhw16i16o,
            ],
        )
    }

    /// Depthwise weights tag for data rank `ndims` (3 or 4).
    pub fn depthwise_weights(ndims: usize) -> Option<Self> {
        pick(ndims.checked_sub(3)?, &[Goiw16g, Goihw16g])
    }

    pub fn name(&self) -> &'static str {
        match self {
            Any => "any",
            X => "x",
            Nc => "nc",
            Ncw => "ncw",
            Nchw => "nchw",
            Ncdhw => "ncdhw",
            Nwc => "nwc",
            Nhwc => "nhwc",
            Ndhwc => "ndhwc",
            NCw8c => "nCw8c",
            NChw8c => "nChw8c",
            NCdhw8c => "nCdhw8c",
            NC16c => "nC16c",
            NCw16c => "nCw16c",
            NChw16c => "nChw16c",
            NCdhw16c => "nCdhw16c",
            OI8i16o2i => "OI8i16o2i",
            OIw8i16o2i => "OIw8i16o2i",
            OIhw8i16o2i => "OIhw8i16o2i",
            OIdhw8i16o2i => "OIdhw8i16o2i",
            GOI8i16o2i => "gOI8i16o2i",
            GOIw8i16o2i => "gOIw8i16o2i",
            GOIhw8i16o2i => "gOIhw8i16o2i",
            GOIdhw8i16o2i => "gOIdhw8i16o2i",
            IO8o16i2o => "IO8o16i2o",
            IOw8o16i2o => "IOw8o16i2o",
            IOhw8o16i2o => "IOhw8o16i2o",
            IOdhw8o16i2o => "IOdhw8o16i2o",
            GIO8o16i2o => "gIO8o16i2o",
            GIOw8o16i2o => "gIOw8o16i2o",
            GIOhw8o16i2o => "gIOhw8o16i2o",
            GIOdhw8o16i2o => "gIOdhw8o16i2o",
            OI16i16o => "OI16i16o",
            OIw16i16o => "OIw16i16o",
            OIhw16i16o => "OIhw16i16o",
            OIdhw16i16o => "OIdhw16i16o",
            GOI16i16o => "gOI16i16o",
            GOIw16i16o => "gOIw16i16o",
            GOIhw16i16o => "gOIhw16i16o",
            GOIdhw16i16o => "gOIdhw16i16o",
            Goiw16g => "Goiw16g",
            Goihw16g => "Goihw16g",
        }
    }
}

impl std::fmt::Display for FormatTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

fn pick(index: usize, tags: &[FormatTag]) -> Option<FormatTag> {
    tags.get(index).copied()
}

/// `2 * (ndims - 2) + with_groups`, the index into the weights tag tables.
fn weights_index(ndims: usize, with_groups: bool) -> Option<usize> {
    Some(2 * ndims.checked_sub(2)? + usize::from(with_groups))
}
