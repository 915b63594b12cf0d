pub mod post_ops;
