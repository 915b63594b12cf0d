use serde::{Deserialize, Serialize};

use super::{DType, FormatTag};
use crate::error::{ensure_args, PrimitiveError, PrimitiveResult};

/// Highest rank any descriptor may carry (grouped 3D weights).
pub const MAX_NDIMS: usize = 6;

/// One extent or stride of a descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Dim {
    Known(usize),
    /// Only known when the primitive executes.
    Runtime,
}

impl Dim {
    pub fn known(&self) -> Option<usize> {
        match self {
            Dim::Known(v) => Some(*v),
            Dim::Runtime => None,
        }
    }
}

impl From<usize> for Dim {
    fn from(v: usize) -> Self {
        Dim::Known(v)
    }
}

/// Immutable shape / type / layout description of a tensor.
///
/// Two descriptors compare equal when every field matches, which is the
/// notion of equality used when a primitive checks that two tensors share
/// a layout.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TensorDesc {
    dims: Vec<Dim>,
    dtype: DType,
    format: FormatTag,
    strides: Option<Vec<Dim>>,
}

impl TensorDesc {
    pub fn new(dims: &[usize], dtype: DType, format: FormatTag) -> PrimitiveResult<Self> {
        Self::with_dims(dims.iter().copied().map(Dim::Known).collect(), dtype, format)
    }

    /// Builds a descriptor whose extents may be [`Dim::Runtime`].
    pub fn with_dims(dims: Vec<Dim>, dtype: DType, format: FormatTag) -> PrimitiveResult<Self> {
        ensure_args!(
            (1..=MAX_NDIMS).contains(&dims.len()),
            "tensor rank {} is outside 1..={}",
            dims.len(),
            MAX_NDIMS
        );
        if let Some(n) = format.ndims() {
            ensure_args!(
                n == dims.len(),
                "format {} describes {} dims, got {}",
                format,
                n,
                dims.len()
            );
        }
        Ok(Self {
            dims,
            dtype,
            format,
            strides: None,
        })
    }

    /// Plain descriptor with explicit (possibly runtime) strides, in elements.
    pub fn strided(dims: Vec<Dim>, dtype: DType, strides: Vec<Dim>) -> PrimitiveResult<Self> {
        ensure_args!(
            strides.len() == dims.len(),
            "{} strides given for {} dims",
            strides.len(),
            dims.len()
        );
        let format = FormatTag::plain(dims.len())
            .ok_or_else(|| PrimitiveError::invalid("no plain tag for this rank"))?;
        let mut desc = Self::with_dims(dims, dtype, format)?;
        desc.strides = Some(strides);
        Ok(desc)
    }

    pub fn ndims(&self) -> usize {
        self.dims.len()
    }

    pub fn dims(&self) -> &[Dim] {
        &self.dims
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn format(&self) -> FormatTag {
        self.format
    }

    pub fn explicit_strides(&self) -> Option<&[Dim]> {
        self.strides.as_deref()
    }

    pub fn has_runtime_dims_or_strides(&self) -> bool {
        let runtime = |d: &Dim| matches!(d, Dim::Runtime);
        self.dims.iter().any(runtime)
            || self.strides.as_ref().is_some_and(|s| s.iter().any(runtime))
    }

    /// All extents, or `None` if any is only known at runtime.
    pub fn known_dims(&self) -> Option<Vec<usize>> {
        self.dims.iter().map(Dim::known).collect()
    }

    /// Extent of axis `i`, `None` when out of range or runtime.
    pub fn dim(&self, i: usize) -> Option<usize> {
        self.dims.get(i).and_then(Dim::known)
    }

    pub fn has_zero_dim(&self) -> bool {
        self.dims.iter().any(|d| *d == Dim::Known(0))
    }

    /// Extents with blocked axes rounded up to their block width.
    pub fn padded_dims(&self) -> Option<Vec<usize>> {
        let mut dims = self.known_dims()?;
        for (axis, block) in self.format.blocks() {
            dims[axis] = dims[axis].div_ceil(block) * block;
        }
        Some(dims)
    }

    /// Logical element count (0 when runtime).
    pub fn nelems(&self) -> usize {
        self.known_dims().map_or(0, |d| d.iter().product())
    }

    /// Bytes needed to store the tensor in its layout. Zero for `Any` and
    /// for runtime shapes.
    pub fn size_bytes(&self) -> usize {
        if self.format.is_any() || self.has_runtime_dims_or_strides() {
            return 0;
        }
        let (Some(dims), Some(strides)) = (self.padded_dims(), self.strides()) else {
            return 0;
        };
        if dims.contains(&0) {
            return 0;
        }
        let inner: usize = self.format.blocks().iter().map(|(_, b)| b).product();
        let last = dims
            .iter()
            .zip(&self.format.blocks_per_axis(dims.len()))
            .zip(&strides)
            .map(|((d, b), s)| (d / b - 1) * s)
            .sum::<usize>();
        (last + inner) * self.dtype.size_of()
    }

    /// Element strides of the outer (per-block) index of every axis.
    ///
    /// For `nChw16c` the stride of axis 1 is the distance between two
    /// consecutive channel blocks, not between two channels.
    pub fn strides(&self) -> Option<Vec<usize>> {
        if let Some(explicit) = &self.strides {
            return explicit.iter().map(Dim::known).collect();
        }
        if self.format.is_any() {
            return None;
        }
        let dims = self.padded_dims()?;
        let per_axis = self.format.blocks_per_axis(dims.len());
        let mut strides = vec![0; dims.len()];
        let mut acc: usize = per_axis.iter().product();
        for &axis in self.format.outer_order().iter().rev() {
            strides[axis] = acc;
            acc *= dims[axis] / per_axis[axis];
        }
        Some(strides)
    }

    /// Same extents and type, different layout. Explicit strides are dropped.
    pub fn with_format(&self, format: FormatTag) -> PrimitiveResult<Self> {
        Self::with_dims(self.dims.clone(), self.dtype, format)
    }

    /// Same type and layout over new extents.
    pub fn reshaped(&self, dims: &[usize]) -> PrimitiveResult<Self> {
        Self::new(dims, self.dtype, self.format)
    }
}

impl FormatTag {
    /// Block width of every axis (1 for unblocked axes).
    pub(crate) fn blocks_per_axis(&self, ndims: usize) -> Vec<usize> {
        let mut per_axis = vec![1; ndims];
        for (axis, block) in self.blocks() {
            if let Some(slot) = per_axis.get_mut(axis) {
                *slot *= block;
            }
        }
        per_axis
    }
}

impl std::fmt::Display for TensorDesc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let dims: Vec<String> = self
            .dims
            .iter()
            .map(|d| match d {
                Dim::Known(v) => v.to_string(),
                Dim::Runtime => "?".to_string(),
            })
            .collect();
        write!(f, "{}:{}:{}", self.dtype, self.format, dims.join("x"))
    }
}
