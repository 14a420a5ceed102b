//! Training Arguments - CLI configuration for training
//!
//! `TrainArgs` doubles as the run-options record stored in every training
//! snapshot, so it is serde-serializable as well as a clap argument group.

use caption_core::{ModelConfig, RnnType};
use clap::{ArgAction, Args, ValueEnum};
use serde::{Deserialize, Serialize};

/// Options that define the model architecture; a resumed snapshot must agree on all of them
pub const STRUCTURAL_FIELDS: [&str; 4] = ["caption_model", "rnn_type", "rnn_size", "num_layers"];

#[derive(ValueEnum, Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OptimKind {
    Adam,
    Sgd,
    Sgdm,
    Rmsprop,
    Adagrad,
}

#[derive(ValueEnum, Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum GradClipMode {
    /// Rescale all gradients so their global L2 norm is at most `grad_clip`
    Norm,
    /// Clamp every gradient element into `[-grad_clip, grad_clip]`
    Value,
}

/// Training configuration from command line arguments
#[derive(Args, Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct TrainArgs {
    /// Run identifier, used in snapshot file names
    #[arg(long, default_value = "")]
    pub id: String,

    #[arg(long, default_value = "show_tell")]
    pub caption_model: String,

    /// Dataset description: vocabulary, images, splits and encoded captions
    #[arg(long, default_value = "data/cocotalk.json")]
    pub input_json: String,

    #[arg(long, default_value = "data/cocotalk_fc")]
    pub input_fc_dir: String,

    /// Region features, read only for model families where
    /// `caption_core::if_use_att` holds (not `show_tell`)
    #[arg(long, default_value = "data/cocotalk_att")]
    pub input_att_dir: String,

    #[arg(long, default_value = "data/cocotalk_box")]
    pub input_box_dir: String,

    /// COCO-style reference captions used by language evaluation
    #[arg(long, default_value = "data/captions_val2014.json")]
    pub input_ann: String,

    /// Directory holding a previous run's snapshot, weights and optimizer state
    #[arg(long)]
    pub start_from: Option<String>,

    /// Document-frequency corpus handed to the CIDEr-D reward scorer
    #[arg(long, default_value = "coco-train-idxs")]
    pub cached_tokens: String,

    #[arg(long, default_value = "lstm")]
    pub rnn_type: RnnType,

    #[arg(long, default_value_t = 512)]
    pub rnn_size: usize,

    #[arg(long, default_value_t = 1)]
    pub num_layers: usize,

    #[arg(long, default_value_t = 512)]
    pub input_encoding_size: usize,

    #[arg(long, default_value_t = 2048)]
    pub fc_feat_size: usize,

    /// Width of a region feature row; region models only
    #[arg(long, default_value_t = 2048)]
    pub att_feat_size: usize,

    /// Also load `input_box_dir` boxes; region models only
    #[arg(long, action)]
    pub use_box: bool,

    #[arg(long, default_value_t = 0.5)]
    pub drop_prob_lm: f32,

    #[arg(long, default_value_t = 30)]
    pub max_epochs: usize,

    #[arg(long, default_value_t = 16)]
    pub batch_size: usize,

    /// Captions sampled per image in every batch
    #[arg(long, default_value_t = 5)]
    pub seq_per_img: usize,

    #[arg(long, default_value_t = 0.1)]
    pub grad_clip: f64,

    #[arg(long, value_enum, default_value_t = GradClipMode::Norm)]
    pub grad_clip_mode: GradClipMode,

    /// Epoch at which self-critical training starts (-1 disables it)
    #[arg(long, default_value_t = -1, allow_negative_numbers = true)]
    pub self_critical_after: i64,

    #[arg(long, default_value_t = 0.0)]
    pub label_smoothing: f64,

    #[arg(long, action)]
    pub noamopt: bool,

    #[arg(long, default_value_t = 2000)]
    pub noamopt_warmup: usize,

    #[arg(long, default_value_t = 1.0)]
    pub noamopt_factor: f64,

    #[arg(long, action)]
    pub reduce_on_plateau: bool,

    #[arg(long, value_enum, default_value_t = OptimKind::Adam)]
    pub optim: OptimKind,

    #[arg(long, default_value_t = 4e-4)]
    pub learning_rate: f64,

    /// Epoch at which learning rate decay starts (-1 disables it)
    #[arg(long, default_value_t = -1, allow_negative_numbers = true)]
    pub learning_rate_decay_start: i64,

    #[arg(long, default_value_t = 3)]
    pub learning_rate_decay_every: usize,

    #[arg(long, default_value_t = 0.8)]
    pub learning_rate_decay_rate: f64,

    #[arg(long, default_value_t = 0.9)]
    pub optim_alpha: f64,

    #[arg(long, default_value_t = 0.999)]
    pub optim_beta: f64,

    #[arg(long, default_value_t = 1e-8)]
    pub optim_epsilon: f64,

    #[arg(long, default_value_t = 0.0)]
    pub weight_decay: f64,

    /// Epoch at which scheduled sampling starts (-1 disables it)
    #[arg(long, default_value_t = -1, allow_negative_numbers = true)]
    pub scheduled_sampling_start: i64,

    #[arg(long, default_value_t = 5)]
    pub scheduled_sampling_increase_every: usize,

    #[arg(long, default_value_t = 0.05)]
    pub scheduled_sampling_increase_prob: f64,

    #[arg(long, default_value_t = 0.25)]
    pub scheduled_sampling_max_prob: f64,

    /// Validation images per evaluation (-1 = whole split)
    #[arg(long, default_value_t = 3200, allow_negative_numbers = true)]
    pub val_images_use: i64,

    #[arg(long, default_value = "save")]
    pub checkpoint_path: String,

    #[arg(long, action)]
    pub language_eval: bool,

    /// Where language evaluation writes `<id>_<split>.json`
    #[arg(long, default_value = "eval_results")]
    #[serde(default = "default_eval_results_dir")]
    pub eval_results_dir: String,

    /// Restore the best validation score when resuming
    #[arg(long, default_value_t = true, action = ArgAction::Set)]
    pub load_best_score: bool,

    /// Keep `restval` images out of the training split
    #[arg(long, action)]
    pub train_only: bool,

    #[arg(long, default_value_t = 1.0)]
    pub cider_reward_weight: f64,

    #[arg(long, default_value_t = 0.0)]
    pub bleu_reward_weight: f64,

    /// External metric bridge executable
    #[arg(long, default_value = "caption-scorer")]
    pub scorer_cmd: String,

    /// Extra arguments passed to the metric bridge before `--metric`
    #[arg(long)]
    pub scorer_arg: Vec<String>,

    #[arg(long, default_value_t = 123)]
    pub seed: u64,

    #[arg(long, action)]
    pub cpu: bool,
}

fn default_eval_results_dir() -> String {
    "eval_results".to_string()
}

impl TrainArgs {
    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(self.batch_size > 0, "batch_size must be positive");
        anyhow::ensure!(self.seq_per_img > 0, "seq_per_img must be positive");
        anyhow::ensure!(self.rnn_size > 0, "rnn_size must be positive");
        anyhow::ensure!(self.num_layers > 0, "num_layers must be positive");
        anyhow::ensure!(
            self.learning_rate_decay_every > 0,
            "learning_rate_decay_every must be positive"
        );
        anyhow::ensure!(
            self.scheduled_sampling_increase_every > 0,
            "scheduled_sampling_increase_every must be positive"
        );
        anyhow::ensure!(
            (0.0..1.0).contains(&self.label_smoothing),
            "label_smoothing must be in [0, 1), got {}",
            self.label_smoothing
        );
        anyhow::ensure!(
            !(self.noamopt && self.reduce_on_plateau),
            "noamopt and reduce_on_plateau cannot be combined"
        );
        Ok(())
    }

    /// Model configuration for this run; vocabulary and length come from the data
    pub fn model_config(&self, vocab_size: usize, seq_length: usize) -> ModelConfig {
        ModelConfig {
            caption_model: self.caption_model.clone(),
            vocab_size,
            seq_length,
            input_encoding_size: self.input_encoding_size,
            rnn_type: self.rnn_type,
            rnn_size: self.rnn_size,
            num_layers: self.num_layers,
            drop_prob_lm: self.drop_prob_lm,
            fc_feat_size: self.fc_feat_size,
            att_feat_size: self.att_feat_size,
        }
    }

    pub fn self_critical_enabled(&self) -> bool {
        self.self_critical_after >= 0
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct Wrapper {
        #[command(flatten)]
        args: TrainArgs,
    }

    pub(crate) fn parse(extra: &[&str]) -> TrainArgs {
        let argv = std::iter::once("caption_train").chain(extra.iter().copied());
        Wrapper::parse_from(argv).args
    }

    #[test]
    fn test_defaults() {
        let args = parse(&[]);
        assert_eq!(args.caption_model, "show_tell");
        assert_eq!(args.self_critical_after, -1);
        assert!(args.load_best_score);
        assert_eq!(args.optim, OptimKind::Adam);
        assert_eq!(args.grad_clip_mode, GradClipMode::Norm);
        assert!(args.validate().is_ok());
    }

    #[test]
    fn test_negative_and_explicit_values() {
        let args = parse(&[
            "--self-critical-after",
            "-1",
            "--learning-rate-decay-start",
            "0",
            "--load-best-score",
            "false",
            "--rnn-type",
            "gru",
        ]);
        assert_eq!(args.learning_rate_decay_start, 0);
        assert!(!args.load_best_score);
        assert_eq!(args.rnn_type, RnnType::Gru);
        assert!(!args.self_critical_enabled());
    }

    #[test]
    fn test_validate_rejects_conflicting_lr_modes() {
        let args = parse(&["--noamopt", "--reduce-on-plateau"]);
        assert!(args.validate().is_err());
    }
}
