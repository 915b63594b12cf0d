//! Post-ops execution engine.
//!
//! Applies the elementwise tail of a convolution to an already computed
//! f32 output in one pass:
//!
//! ```text
//! interleaved:  x * scale[c] → + bias[c] → + residual → relu → clip
//! blocked (8c): scale * (x - mean) + offset  (or + bias) → + residual → relu
//! ```
//!
//! Each call resolves the set of present operands to one monomorphized
//! kernel up front. Output writes are partitioned across threads (row
//! shards for the interleaved layout, `(image, channel block)` chunks for
//! the blocked one), so no two threads touch the same element.
//!
//! Shapes are the caller's contract: channel counts must already be padded
//! to the lane width and every operand must cover the range it is indexed
//! over. Violations panic on slice bounds.
//!
//! Neutral operands are exact for every value except negative zero: any
//! stage that adds (a zero bias, offset or residual) turns `-0.0` into
//! `+0.0`. Only an operand-free call preserves it bit for bit.

mod blocked;
mod clip;
mod interleaved;

use std::sync::Arc;

use rayon::ThreadPool;

use crate::config::EngineConfig;

pub use clip::clip_upper_bound;

/// Memory layout of the output tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OutputLayout {
    /// Channels fastest: `batch × h × w × total_filters`.
    Interleaved,
    /// `batch × (no_of_filter / 8) × h × w × 8`.
    Blocked8,
}

/// Operands of one post-ops call. `None` means the operation is skipped.
#[derive(Debug, Clone, Copy)]
pub struct PostOpsArgs<'a> {
    /// Elementwise residual, laid out exactly like the output.
    pub residual: Option<&'a [f32]>,
    pub batch: usize,
    pub height: usize,
    pub width: usize,
    /// Channels the operation applies to.
    pub no_of_filter: usize,
    /// Row length of the interleaved layout.
    pub total_filters: usize,
    /// First active channel within an interleaved row.
    pub bias_offset: usize,
    pub bias: Option<&'a [f32]>,
    pub relu: bool,
    pub scale: Option<&'a [f32]>,
    /// Blocked layout only; absent means 0.
    pub offset: Option<&'a [f32]>,
    /// Blocked layout only; absent means 0.
    pub mean: Option<&'a [f32]>,
    /// Work shards for the interleaved layout; `None` uses the pool size.
    pub threads: Option<usize>,
    pub layout: OutputLayout,
}

impl<'a> PostOpsArgs<'a> {
    /// No operands, one image of `height × width × filters`.
    pub fn new(layout: OutputLayout, height: usize, width: usize, filters: usize) -> Self {
        Self {
            residual: None,
            batch: 1,
            height,
            width,
            no_of_filter: filters,
            total_filters: filters,
            bias_offset: 0,
            bias: None,
            relu: false,
            scale: None,
            offset: None,
            mean: None,
            threads: None,
            layout,
        }
    }

    pub fn with_batch(mut self, batch: usize) -> Self {
        self.batch = batch;
        self
    }

    pub fn with_bias(mut self, bias: &'a [f32]) -> Self {
        self.bias = Some(bias);
        self
    }

    pub fn with_relu(mut self, relu: bool) -> Self {
        self.relu = relu;
        self
    }

    pub fn with_scale(mut self, scale: &'a [f32]) -> Self {
        self.scale = Some(scale);
        self
    }

    /// Batch-norm affine operands for the blocked layout.
    pub fn with_affine(mut self, scale: &'a [f32], mean: &'a [f32], offset: &'a [f32]) -> Self {
        self.scale = Some(scale);
        self.mean = Some(mean);
        self.offset = Some(offset);
        self
    }

    pub fn with_residual(mut self, residual: &'a [f32]) -> Self {
        self.residual = Some(residual);
        self
    }

    /// Restricts an interleaved call to `filters` channels starting at
    /// `offset` of rows `total_filters` wide.
    pub fn with_channel_window(mut self, offset: usize, filters: usize, total_filters: usize) -> Self {
        self.bias_offset = offset;
        self.no_of_filter = filters;
        self.total_filters = total_filters;
        self
    }

    pub fn with_threads(mut self, threads: usize) -> Self {
        self.threads = Some(threads);
        self
    }

    /// Spatial positions per image.
    pub fn spatial(&self) -> usize {
        self.height * self.width
    }
}

/// Applies post-ops to convolution outputs.
///
/// The clip gate is resolved from the configuration once, at construction.
#[derive(Debug, Clone, Default)]
pub struct PostOpsEngine {
    clip: Option<f32>,
    pool: Option<Arc<ThreadPool>>,
}

impl PostOpsEngine {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            clip: config.clip_enabled().then_some(config.clip_upper_bound),
            pool: None,
        }
    }

    /// Runs every call on `pool` instead of the global rayon pool.
    pub fn with_thread_pool(mut self, pool: Arc<ThreadPool>) -> Self {
        self.pool = Some(pool);
        self
    }

    /// The bound the interleaved path clips to, when the gate is on.
    pub fn clip_bound(&self) -> Option<f32> {
        self.clip
    }

    /// Applies the requested operations to `out` in place.
    pub fn apply(&self, out: &mut [f32], args: &PostOpsArgs<'_>) {
        match args.layout {
            OutputLayout::Interleaved => {
                let clip = self.clip;
                self.install(|| interleaved::apply(out, args, clip));
            }
            OutputLayout::Blocked8 => self.install(|| blocked::apply(out, args)),
        }
    }

    /// Standalone clip over the whole buffer, on this engine's pool.
    pub fn clip(&self, out: &mut [f32], bound: f32) {
        self.install(|| clip_upper_bound(out, bound));
    }

    fn install<R: Send>(&self, op: impl FnOnce() -> R + Send) -> R {
        match &self.pool {
            Some(pool) => pool.install(op),
            None => op(),
        }
    }
}

#[cfg(test)]
mod tests;
