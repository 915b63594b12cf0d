//! CPU execution: lane kernels and the operations built on them.

pub mod kernels;
pub mod ops;
