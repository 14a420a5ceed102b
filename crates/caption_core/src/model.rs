//! Model Module - Caption model architecture
//!
//! This module contains the caption model surface used by the trainer:
//! - CaptionModel: supervised forward pass and caption sampling
//! - ShowTell: image embedding fed as the first step of a recurrent decoder
//! - ModelConfig: Model configuration

pub mod config;
pub mod core;
pub mod show_tell;

pub use config::{ModelConfig, RnnType};
pub use show_tell::ShowTell;

use candle_core::{Result, Tensor};
use candle_nn::VarBuilder;

/// Visual inputs of one batch.
///
/// Region features, masks and boxes are optional; models that only read the
/// pooled `fc_feats` ignore them.
#[derive(Clone, Debug)]
pub struct CaptionInputs {
    pub fc_feats: Tensor,
    pub att_feats: Option<Tensor>,
    pub att_masks: Option<Tensor>,
    pub boxes: Option<Tensor>,
}

impl CaptionInputs {
    pub fn new(fc_feats: Tensor) -> Self {
        Self {
            fc_feats,
            att_feats: None,
            att_masks: None,
            boxes: None,
        }
    }

    /// Keep every `step`-th row (rows are repeated once per caption of an image).
    pub fn stride(&self, step: usize) -> Result<Self> {
        if step <= 1 {
            return Ok(self.clone());
        }
        let rows = self.fc_feats.dim(0)?;
        let ids: Vec<u32> = (0..rows).step_by(step).map(|r| r as u32).collect();
        let ids = Tensor::from_vec(ids.clone(), ids.len(), self.fc_feats.device())?;
        let pick = |t: &Option<Tensor>| -> Result<Option<Tensor>> {
            t.as_ref().map(|t| t.index_select(&ids, 0)).transpose()
        };
        Ok(Self {
            fc_feats: self.fc_feats.index_select(&ids, 0)?,
            att_feats: pick(&self.att_feats)?,
            att_masks: pick(&self.att_masks)?,
            boxes: pick(&self.boxes)?,
        })
    }
}

/// Decoding options for `CaptionModel::sample`
#[derive(Clone, Copy, Debug)]
pub struct SampleOptions {
    /// Arg-max decoding when true, multinomial sampling otherwise
    pub sample_max: bool,
    pub temperature: f64,
    /// Enables dropout
    pub train: bool,
}

impl SampleOptions {
    pub fn greedy() -> Self {
        Self {
            sample_max: true,
            temperature: 1.0,
            train: false,
        }
    }

    pub fn stochastic(train: bool) -> Self {
        Self {
            sample_max: false,
            temperature: 1.0,
            train,
        }
    }
}

impl Default for SampleOptions {
    fn default() -> Self {
        Self::greedy()
    }
}

pub trait CaptionModel {
    fn config(&self) -> &ModelConfig;

    /// Supervised pass over the ground-truth tokens.
    ///
    /// `labels` is `(N, L)` u32 with the start token at column 0. Returns
    /// log-probabilities `(N, T, vocab + 1)` with `T <= L - 1`; row `t`
    /// predicts `labels[:, t + 1]`. With `ss_prob > 0` in training mode each
    /// row feeds back its own sample instead of the ground truth with that
    /// probability.
    fn forward(
        &self,
        inputs: &CaptionInputs,
        labels: &Tensor,
        ss_prob: f64,
        train: bool,
    ) -> Result<Tensor>;

    /// Free-running decode. Returns `(seq, seq_logprobs)`, both `(N, T)`,
    /// `T <= seq_length`. Positions after a row's first 0 token are 0.
    fn sample(&self, inputs: &CaptionInputs, opts: &SampleOptions) -> Result<(Tensor, Tensor)>;
}

/// Whether a model family consumes region features
pub fn if_use_att(caption_model: &str) -> bool {
    !matches!(caption_model, "fc" | "show_tell" | "newfc")
}

/// Build the model named by `config.caption_model`
pub fn setup(config: ModelConfig, vb: VarBuilder) -> anyhow::Result<Box<dyn CaptionModel>> {
    config.validate()?;
    match config.caption_model.as_str() {
        "show_tell" => {
            tracing::info!(
                "Model: show_tell ({} x {} {}, vocab {})",
                config.num_layers,
                config.rnn_size,
                config.rnn_type,
                config.vocab_size
            );
            Ok(Box::new(ShowTell::load(config, vb)?))
        }
        other => anyhow::bail!("Caption model not supported: {}", other),
    }
}
