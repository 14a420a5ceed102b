//! Train Module - Caption model training pipeline
//!
//! This module provides the training infrastructure:
//! - TrainArgs: CLI arguments for training, stored in every snapshot
//! - schedule: per-epoch learning rate, scheduled sampling and objective
//! - criterion / reward: supervised and self-critical losses
//! - optimizer: parameter updates with checkpointable state
//! - checkpoint: snapshot saving/loading and resume checks
//! - training_loop: Main training loop

pub mod args;
pub mod checkpoint;
pub mod criterion;
pub mod optimizer;
pub mod reward;
pub mod schedule;
pub mod training_loop;

pub use args::TrainArgs;
pub use checkpoint::{Checkpointer, TrainingSnapshot};
pub use schedule::EpochSchedule;
pub use training_loop::{run, Trainer};
