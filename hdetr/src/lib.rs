//! The building blocks of hybrid-matching DETR training.

mod common;
pub mod batch;
pub mod box_ops;
pub mod distributed;
pub mod evaluator;
pub mod loss;
pub mod metric;
pub mod model;
pub mod postprocess;
pub mod precision;
pub mod profiling;
