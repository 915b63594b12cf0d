//! Batch normalization descriptor.
//!
//! Only the descriptor is built here. The normalization itself reaches the
//! post-ops engine as the `scale`/`mean`/`offset` operands of the blocked
//! path.

use std::ops::BitOr;

use serde::{Deserialize, Serialize};

use super::desc::PropKind;
use crate::error::{ensure_args, ensure_impl, PrimitiveError, PrimitiveResult};
use crate::tensor::{DType, FormatTag, TensorDesc};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BatchNormFlags(u32);

impl BatchNormFlags {
    pub const NONE: Self = Self(0);
    /// Use the caller's mean and variance instead of computing them.
    pub const USE_GLOBAL_STATS: Self = Self(0x1);
    pub const USE_SCALESHIFT: Self = Self(0x2);
    pub const FUSE_NORM_RELU: Self = Self(0x4);

    const ALL: u32 = 0x1 | 0x2 | 0x4;

    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    pub const fn bits(&self) -> u32 {
        self.0
    }

    pub const fn contains(&self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for BatchNormFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BatchNormDesc {
    pub prop: PropKind,
    pub data: TensorDesc,
    /// Present for `Backward` and `BackwardData`.
    pub diff_data: Option<TensorDesc>,
    /// `{2, C}` f32: row 0 is scale, row 1 is shift.
    pub scaleshift: TensorDesc,
    /// Present only for `Backward` with `USE_SCALESHIFT`.
    pub diff_scaleshift: Option<TensorDesc>,
    /// `{C}` f32, shared by mean and variance.
    pub stats: TensorDesc,
    pub epsilon: f32,
    pub flags: BatchNormFlags,
}

impl BatchNormDesc {
    pub fn forward(
        prop: PropKind,
        data: &TensorDesc,
        epsilon: f32,
        flags: BatchNormFlags,
    ) -> PrimitiveResult<Self> {
        ensure_args!(
            prop.is_forward(),
            "{:?} is not a forward propagation kind",
            prop
        );
        Self::init(prop, data, None, epsilon, flags)
    }

    pub fn backward(
        prop: PropKind,
        diff_data: &TensorDesc,
        data: &TensorDesc,
        epsilon: f32,
        flags: BatchNormFlags,
    ) -> PrimitiveResult<Self> {
        ensure_args!(
            matches!(prop, PropKind::Backward | PropKind::BackwardData),
            "{:?} is not a backward propagation kind",
            prop
        );
        Self::init(prop, data, Some(diff_data), epsilon, flags)
    }

    fn init(
        prop: PropKind,
        data: &TensorDesc,
        diff_data: Option<&TensorDesc>,
        epsilon: f32,
        flags: BatchNormFlags,
    ) -> PrimitiveResult<Self> {
        let is_backward = matches!(prop, PropKind::Backward | PropKind::BackwardData);
        ensure_args!(
            !is_backward || diff_data.is_some(),
            "backward batch normalization needs a diff_data descriptor"
        );

        let runtime = data.has_runtime_dims_or_strides()
            || diff_data.is_some_and(|d| d.has_runtime_dims_or_strides());
        ensure_impl!(!runtime, "runtime dims or strides are not supported");

        ensure_args!(
            flags.bits() & !BatchNormFlags::ALL == 0,
            "unknown batch normalization flags {:#x}",
            flags.bits()
        );

        ensure_args!(
            (2..=5).contains(&data.ndims()),
            "batch normalization data rank must be 2..=5, got {}",
            data.ndims()
        );
        if prop == PropKind::BackwardData {
            if let Some(diff) = diff_data {
                ensure_args!(
                    (2..=5).contains(&diff.ndims()) && diff.dims() == data.dims(),
                    "diff_data dims must match data dims"
                );
            }
        }

        let channels = data
            .dim(1)
            .ok_or_else(|| PrimitiveError::invalid("data has no channel axis"))?;
        let scaleshift = TensorDesc::new(&[2, channels], DType::F32, FormatTag::Nc)?;
        let stats = TensorDesc::new(&[channels], DType::F32, FormatTag::X)?;
        let diff_scaleshift = (prop == PropKind::Backward
            && flags.contains(BatchNormFlags::USE_SCALESHIFT))
        .then(|| scaleshift.clone());

        Ok(Self {
            prop,
            data: data.clone(),
            diff_data: diff_data.filter(|_| is_backward).cloned(),
            scaleshift,
            diff_scaleshift,
            stats,
            epsilon,
            flags,
        })
    }

    pub fn use_global_stats(&self) -> bool {
        self.flags.contains(BatchNormFlags::USE_GLOBAL_STATS)
    }

    pub fn use_scaleshift(&self) -> bool {
        self.flags.contains(BatchNormFlags::USE_SCALESHIFT)
    }

    pub fn fuse_norm_relu(&self) -> bool {
        self.flags.contains(BatchNormFlags::FUSE_NORM_RELU)
    }
}
