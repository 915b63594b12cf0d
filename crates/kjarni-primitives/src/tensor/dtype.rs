use half::{bf16, f16};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DType {
    /// Standard 32-bit float
    F32,
    /// 16-bit brain float (more range, less precision than F16)
    BF16,
    /// 16-bit float (IEEE 754 half-precision)
    F16,
    /// 32-bit signed integer, accumulators of int8 paths
    S32,
    S8,
    U8,
    /// Unspecified; used for absent optional tensors
    Undef,
}

impl DType {
    /// Size of one element in bytes. `Undef` has size 0.
    pub fn size_of(&self) -> usize {
        match self {
            DType::F32 => std::mem::size_of::<f32>(),
            DType::BF16 => std::mem::size_of::<bf16>(),
            DType::F16 => std::mem::size_of::<f16>(),
            DType::S32 => std::mem::size_of::<i32>(),
            DType::S8 => 1,
            DType::U8 => 1,
            DType::Undef => 0,
        }
    }

    pub fn is_float(&self) -> bool {
        matches!(self, DType::F32 | DType::BF16 | DType::F16)
    }

    /// Calculates the buffer size in bytes for a tensor of the given extents.
    pub fn buffer_size_for_shape(&self, shape: &[usize]) -> usize {
        shape.iter().product::<usize>() * self.size_of()
    }
}

impl std::fmt::Display for DType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            DType::F32 => "f32",
            DType::BF16 => "bf16",
            DType::F16 => "f16",
            DType::S32 => "s32",
            DType::S8 => "s8",
            DType::U8 => "u8",
            DType::Undef => "undef",
        };
        f.write_str(name)
    }
}
