//! Dataset loading and batching.

mod coco;
mod dataset;
mod loader;
mod transform;

pub use coco::*;
pub use dataset::*;
pub use loader::*;
pub use transform::*;
