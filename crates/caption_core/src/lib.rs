//! Caption Engine
//!
//! Sequence-generation model used by the captioning toolchain.
//! Consumes pooled (and optionally regional) visual features and produces
//! per-token log-probabilities or sampled captions.

pub mod model;

pub use model::{
    if_use_att, setup, CaptionInputs, CaptionModel, ModelConfig, RnnType, SampleOptions,
    ShowTell,
};
