//! Caption Train - Training and evaluation toolchain for caption models
//!
//! - loader: feature/caption batches per split
//! - train: schedules, losses, optimizer, checkpoints and the epoch loop
//! - eval: validation passes and aligned language metrics

pub mod cli;
pub mod eval;
pub mod evaluate;
pub mod loader;
pub mod train;
