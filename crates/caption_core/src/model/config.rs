//! ModelConfig - Caption model configuration

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Recurrent cell used by the language core
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RnnType {
    Lstm,
    Gru,
}

impl FromStr for RnnType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "lstm" => Ok(RnnType::Lstm),
            "gru" => Ok(RnnType::Gru),
            other => anyhow::bail!("Unsupported rnn_type '{}' (expected lstm or gru)", other),
        }
    }
}

impl fmt::Display for RnnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RnnType::Lstm => write!(f, "lstm"),
            RnnType::Gru => write!(f, "gru"),
        }
    }
}

/// Model configuration for caption models.
///
/// `vocab_size` counts real words only; token 0 is reserved for
/// start/end/padding, so output layers are `vocab_size + 1` wide.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    pub caption_model: String,
    pub vocab_size: usize,
    pub seq_length: usize,
    pub input_encoding_size: usize,
    pub rnn_type: RnnType,
    pub rnn_size: usize,
    pub num_layers: usize,
    pub drop_prob_lm: f32,
    pub fc_feat_size: usize,
    pub att_feat_size: usize,
}

impl ModelConfig {
    /// Width of the output distribution (words + the end token)
    pub fn output_size(&self) -> usize {
        self.vocab_size + 1
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(self.vocab_size > 0, "vocab_size must be positive");
        anyhow::ensure!(self.seq_length > 0, "seq_length must be positive");
        anyhow::ensure!(self.rnn_size > 0, "rnn_size must be positive");
        anyhow::ensure!(self.num_layers > 0, "num_layers must be positive");
        anyhow::ensure!(
            (0.0..1.0).contains(&self.drop_prob_lm),
            "drop_prob_lm must be in [0, 1), got {}",
            self.drop_prob_lm
        );
        Ok(())
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            caption_model: "show_tell".to_string(),
            vocab_size: 9487,
            seq_length: 16,
            input_encoding_size: 512,
            rnn_type: RnnType::Lstm,
            rnn_size: 512,
            num_layers: 1,
            drop_prob_lm: 0.5,
            fc_feat_size: 2048,
            att_feat_size: 2048,
        }
    }
}
