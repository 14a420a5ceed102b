//! Criteria - Masked caption losses
//!
//! All losses are averaged over the positions selected by the mask, not over
//! the full `(N, T)` grid, so padding never dilutes the gradient.

use candle_core::{DType, Result, Tensor, D};

/// Narrow `(N, L)` targets and masks to the `T` steps the model produced
fn align_targets(input_steps: usize, target: &Tensor, mask: &Tensor) -> Result<(Tensor, Tensor)> {
    let target = target
        .narrow(1, 0, input_steps)?
        .to_dtype(DType::U32)?
        .contiguous()?;
    let mask = mask
        .narrow(1, 0, input_steps)?
        .to_dtype(DType::F32)?
        .contiguous()?;
    Ok((target, mask))
}

fn masked_mean(per_position: &Tensor, mask: &Tensor) -> Result<Tensor> {
    let total = (per_position * mask)?.sum_all()?;
    total / mask.sum_all()?
}

/// Negative log-likelihood of the ground-truth tokens
#[derive(Debug, Clone, Copy, Default)]
pub struct LanguageModelCriterion;

impl LanguageModelCriterion {
    /// `input`: `(N, T, V)` log-probabilities, `target`/`mask`: `(N, L >= T)`
    pub fn forward(&self, input: &Tensor, target: &Tensor, mask: &Tensor) -> Result<Tensor> {
        let (_, steps, _) = input.dims3()?;
        let (target, mask) = align_targets(steps, target, mask)?;
        let picked = input.gather(&target.unsqueeze(2)?, 2)?.squeeze(2)?;
        masked_mean(&picked.neg()?, &mask)
    }
}

/// KL divergence against a smoothed one-hot target distribution
#[derive(Debug, Clone, Copy)]
pub struct LabelSmoothing {
    pub smoothing: f64,
}

fn xlogx(x: f64) -> f64 {
    if x > 0.0 {
        x * x.ln()
    } else {
        0.0
    }
}

impl LabelSmoothing {
    pub fn new(smoothing: f64) -> Self {
        Self { smoothing }
    }

    pub fn forward(&self, input: &Tensor, target: &Tensor, mask: &Tensor) -> Result<Tensor> {
        let (_, steps, vocab) = input.dims3()?;
        let (target, mask) = align_targets(steps, target, mask)?;
        let confidence = 1.0 - self.smoothing;
        let other = if vocab > 1 {
            self.smoothing / (vocab - 1) as f64
        } else {
            0.0
        };

        // KL(p || q) = sum p log p - sum p log q, the first term is constant per position
        let entropy = xlogx(confidence) + (vocab - 1) as f64 * xlogx(other);
        let picked = input.gather(&target.unsqueeze(2)?, 2)?.squeeze(2)?;
        let row_sum = input.sum(D::Minus1)?;
        let cross = (picked.affine(confidence - other, 0.0)? + row_sum.affine(other, 0.0)?)?;
        let per_position = cross.affine(-1.0, entropy)?;
        masked_mean(&per_position, &mask)
    }
}

/// Policy-gradient loss weighting sampled-token log-probabilities by their reward
#[derive(Debug, Clone, Copy, Default)]
pub struct RewardCriterion;

impl RewardCriterion {
    /// `input`: `(N, T)` sampled log-probabilities, `seq`: `(N, T)` sampled tokens,
    /// `reward`: `(N, T)`. The first position and every position whose previous
    /// token is non-zero count, so the end token of each caption is rewarded too.
    pub fn forward(&self, input: &Tensor, seq: &Tensor, reward: &Tensor) -> Result<Tensor> {
        let (n, steps) = seq.dims2()?;
        let alive = seq
            .ne(&seq.zeros_like()?)?
            .to_dtype(DType::F32)?;
        let first = Tensor::ones((n, 1), DType::F32, seq.device())?;
        let mask = if steps > 1 {
            Tensor::cat(&[&first, &alive.narrow(1, 0, steps - 1)?], 1)?
        } else {
            first
        };
        let reward = reward.to_dtype(DType::F32)?;
        let weighted = (input * &reward)?;
        masked_mean(&weighted.neg()?, &mask)
    }
}

/// Supervised objective selected from `label_smoothing`
#[derive(Debug, Clone, Copy)]
pub enum Criterion {
    LanguageModel(LanguageModelCriterion),
    LabelSmoothing(LabelSmoothing),
}

impl Criterion {
    pub fn from_smoothing(label_smoothing: f64) -> Self {
        if label_smoothing > 0.0 {
            Criterion::LabelSmoothing(LabelSmoothing::new(label_smoothing))
        } else {
            Criterion::LanguageModel(LanguageModelCriterion)
        }
    }

    pub fn forward(&self, input: &Tensor, target: &Tensor, mask: &Tensor) -> Result<Tensor> {
        match self {
            Criterion::LanguageModel(c) => c.forward(input, target, mask),
            Criterion::LabelSmoothing(c) => c.forward(input, target, mask),
        }
    }
}
