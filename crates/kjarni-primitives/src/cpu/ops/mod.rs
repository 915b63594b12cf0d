pub mod post_ops;

pub use post_ops::{clip_upper_bound, OutputLayout, PostOpsArgs, PostOpsEngine};
