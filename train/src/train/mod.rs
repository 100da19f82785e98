//! The training loop and its per-device workers.

mod epoch;
mod worker;

pub use epoch::*;
pub use worker::*;
