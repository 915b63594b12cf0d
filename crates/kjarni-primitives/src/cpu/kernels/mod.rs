pub mod scalar;

#[cfg(target_arch = "x86_64")]
pub(crate) mod x86;

/// Per-lane operands of one 8-channel block.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LaneParams {
    pub scale: [f32; 8],
    pub mean: [f32; 8],
    pub offset: [f32; 8],
    pub bias: [f32; 8],
}

impl Default for LaneParams {
    fn default() -> Self {
        Self {
            scale: [1.0; 8],
            mean: [0.0; 8],
            offset: [0.0; 8],
            bias: [0.0; 8],
        }
    }
}

/// Whether the AVX2 lane kernels can run on this machine.
pub fn has_avx2() -> bool {
    #[cfg(target_arch = "x86_64")]
    {
        is_x86_feature_detected!("avx2")
    }
    #[cfg(not(target_arch = "x86_64"))]
    {
        false
    }
}
