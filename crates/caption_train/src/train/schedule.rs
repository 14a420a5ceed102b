//! Schedules - Per-epoch learning rate, scheduled sampling and objective selection
//!
//! Everything here is a pure function of the run options and the epoch (or
//! step) index. The trainer computes an `EpochSchedule` once per epoch and
//! passes it down to every batch step.

use serde::{Deserialize, Serialize};

use super::args::TrainArgs;

/// Values in force for one epoch
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EpochSchedule {
    pub epoch: usize,
    /// Explicit learning rate, `None` when an adaptive or warmup policy owns the rate
    pub learning_rate: Option<f64>,
    pub ss_prob: f64,
    pub self_critical: bool,
}

impl EpochSchedule {
    pub fn for_epoch(args: &TrainArgs, epoch: usize) -> Self {
        let learning_rate = if args.noamopt || args.reduce_on_plateau {
            None
        } else {
            Some(step_decay_lr(
                args.learning_rate,
                args.learning_rate_decay_start,
                args.learning_rate_decay_every,
                args.learning_rate_decay_rate,
                epoch,
            ))
        };
        let ss_prob = scheduled_sampling_prob(
            args.scheduled_sampling_start,
            args.scheduled_sampling_increase_every,
            args.scheduled_sampling_increase_prob,
            args.scheduled_sampling_max_prob,
            epoch,
        );
        let self_critical =
            args.self_critical_after >= 0 && epoch as i64 >= args.self_critical_after;
        Self {
            epoch,
            learning_rate,
            ss_prob,
            self_critical,
        }
    }
}

/// Number of whole `every`-epoch periods elapsed since `start`, `None` before `start`
/// or when `start` is negative.
fn periods_since(start: i64, every: usize, epoch: usize) -> Option<i32> {
    if start < 0 || (epoch as i64) < start || every == 0 {
        return None;
    }
    Some(((epoch as i64 - start) / every as i64) as i32)
}

/// `base * rate ^ floor((epoch - start) / every)` once decay has started, `base` before.
pub fn step_decay_lr(base: f64, start: i64, every: usize, rate: f64, epoch: usize) -> f64 {
    match periods_since(start, every, epoch) {
        Some(frac) => base * rate.powi(frac),
        None => base,
    }
}

/// `min(increase * floor((epoch - start) / every), max)` once started, 0 before.
pub fn scheduled_sampling_prob(
    start: i64,
    every: usize,
    increase: f64,
    max_prob: f64,
    epoch: usize,
) -> f64 {
    match periods_since(start, every, epoch) {
        Some(frac) => (increase * frac as f64).min(max_prob),
        None => 0.0,
    }
}

/// Reduce-on-plateau in "min" mode with a relative improvement threshold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReduceLrOnPlateau {
    pub factor: f64,
    pub patience: usize,
    pub threshold: f64,
    pub min_lr: f64,
    lr: f64,
    best: Option<f64>,
    num_bad_epochs: usize,
}

impl ReduceLrOnPlateau {
    pub fn new(lr: f64) -> Self {
        Self {
            factor: 0.5,
            patience: 3,
            threshold: 1e-4,
            min_lr: 0.0,
            lr,
            best: None,
            num_bad_epochs: 0,
        }
    }

    pub fn lr(&self) -> f64 {
        self.lr
    }

    /// Feed one epoch's metric (lower is better). Returns true when the rate was cut.
    pub fn step(&mut self, metric: f64) -> bool {
        let improved = match self.best {
            None => true,
            Some(best) => metric < best * (1.0 - self.threshold),
        };
        if improved {
            self.best = Some(metric);
            self.num_bad_epochs = 0;
        } else {
            self.num_bad_epochs += 1;
        }

        if self.num_bad_epochs > self.patience {
            self.num_bad_epochs = 0;
            let new_lr = (self.lr * self.factor).max(self.min_lr);
            if self.lr - new_lr > 1e-8 {
                self.lr = new_lr;
                return true;
            }
        }
        false
    }
}

/// Warmup-then-inverse-sqrt schedule evaluated per optimizer step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NoamSchedule {
    pub model_size: usize,
    pub factor: f64,
    pub warmup: usize,
}

impl NoamSchedule {
    pub fn rate(&self, step: usize) -> f64 {
        let step = step.max(1) as f64;
        let warmup = self.warmup.max(1) as f64;
        self.factor
            * (self.model_size as f64).powf(-0.5)
            * step.powf(-0.5).min(step * warmup.powf(-1.5))
    }
}

/// Which component decides the learning rate
#[derive(Debug, Clone, PartialEq)]
pub enum LrPolicy {
    StepDecay,
    Plateau(ReduceLrOnPlateau),
    Noam(NoamSchedule),
}

impl LrPolicy {
    pub fn from_args(args: &TrainArgs) -> Self {
        if args.noamopt {
            LrPolicy::Noam(NoamSchedule {
                model_size: args.rnn_size,
                factor: args.noamopt_factor,
                warmup: args.noamopt_warmup,
            })
        } else if args.reduce_on_plateau {
            LrPolicy::Plateau(ReduceLrOnPlateau::new(args.learning_rate))
        } else {
            LrPolicy::StepDecay
        }
    }
}

/// Best validation score seen so far (higher is better)
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct BestScore(Option<f64>);

impl BestScore {
    pub fn new(score: Option<f64>) -> Self {
        Self(score)
    }

    pub fn get(&self) -> Option<f64> {
        self.0
    }

    /// Record `current` if it strictly beats the best so far. Returns whether it did.
    pub fn update(&mut self, current: f64) -> bool {
        match self.0 {
            Some(best) if current <= best => false,
            _ => {
                self.0 = Some(current);
                true
            }
        }
    }
}
