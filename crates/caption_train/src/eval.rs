//! Evaluation Module - Validation passes and caption metrics
//!
//! - split: loss and greedy captions over one split
//! - coco: aligned corpus/per-image metric evaluation
//! - scorer: external metric bridge
//! - language: reference loading and result files

pub mod coco;
pub mod language;
pub mod scorer;
pub mod split;

pub use coco::{
    metrics_for_split, spice_sorted_alignment, AlignmentPolicy, CaptionEvaluator,
    CaptionTokenizer, EvalReport, ImageCaptions, MethodScore, Metric, PtbTokenizer, Scorer,
    ScorerFactory,
};
pub use language::{language_eval, load_references, LanguageEvaluator, Prediction};
pub use scorer::{CommandScorer, CommandScorerFactory, CommandTokenizer};
pub use split::{decode_sequence, eval_split, EvalOptions, EvalOutcome};
