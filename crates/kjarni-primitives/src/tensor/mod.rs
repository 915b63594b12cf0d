//! Tensor descriptors: element types, layout tags and shapes.

mod desc;
mod dtype;
mod format;

pub use desc::{Dim, TensorDesc, MAX_NDIMS};
pub use dtype::DType;
pub use format::{FormatTag, POST_OPS_BLOCK, SIMD_W};

#[cfg(test)]
mod tests;
