mod checkpoint;
mod fs;
mod lr_scheduler;

pub use checkpoint::*;
pub use fs::*;
pub use lr_scheduler::*;
