//! Caption Evaluator - Corpus and per-image language metrics
//!
//! Scorers return per-image values in their own canonical order. The
//! evaluator never zips them against its id list directly: an
//! `AlignmentPolicy` first produces the id order each method reports in,
//! and scores are paired with ids explicitly before being recorded.

use anyhow::{Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use tracing::info;

pub use crate::loader::ImageId;

/// Captions attached to one image, references or candidates
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ImageCaptions {
    pub image_id: ImageId,
    pub captions: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Metric {
    Bleu,
    Meteor,
    Rouge,
    Cider,
    Spice,
}

impl Metric {
    pub const ALL: [Metric; 5] = [
        Metric::Bleu,
        Metric::Meteor,
        Metric::Rouge,
        Metric::Cider,
        Metric::Spice,
    ];

    /// Method names reported by this metric's scorer
    pub fn methods(&self) -> &'static [&'static str] {
        match self {
            Metric::Bleu => &["Bleu_1", "Bleu_2", "Bleu_3", "Bleu_4"],
            Metric::Meteor => &["METEOR"],
            Metric::Rouge => &["ROUGE_L"],
            Metric::Cider => &["CIDEr"],
            Metric::Spice => &["SPICE"],
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Metric::Bleu => "bleu",
            Metric::Meteor => "meteor",
            Metric::Rouge => "rouge",
            Metric::Cider => "cider",
            Metric::Spice => "spice",
        }
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// The train split only gets the fast n-gram metrics
pub fn metrics_for_split(split: &str) -> Vec<Metric> {
    if split == "train" {
        vec![Metric::Bleu, Metric::Cider]
    } else {
        Metric::ALL.to_vec()
    }
}

/// One method's result: corpus score plus per-image values in the scorer's order
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct MethodScore {
    pub method: String,
    pub corpus: f64,
    pub per_image: Vec<serde_json::Value>,
}

pub trait Scorer {
    fn metric(&self) -> Metric;

    /// Score `res` against `gts`; both lists share the same image order.
    fn compute_score(
        &mut self,
        gts: &[ImageCaptions],
        res: &[ImageCaptions],
    ) -> Result<Vec<MethodScore>>;
}

pub trait ScorerFactory {
    fn build(&self, metric: Metric) -> Result<Box<dyn Scorer>>;

    /// Tokenizer applied to references and candidates before scoring.
    /// Defaults to the in-process PTB rendition.
    fn tokenizer(&self) -> Result<Box<dyn CaptionTokenizer>> {
        Ok(Box::new(PtbTokenizer::new()?))
    }
}

/// Maps a method name and the evaluated id list to the id order its scores come in
pub type AlignmentPolicy = fn(&str, &[ImageId]) -> Vec<ImageId>;

/// SPICE reports per-image scores by ascending image id, every other method by input order.
pub fn spice_sorted_alignment(method: &str, image_ids: &[ImageId]) -> Vec<ImageId> {
    let mut ids = image_ids.to_vec();
    if method == "SPICE" {
        ids.sort_unstable();
    }
    ids
}

/// Pairs scores with ids in input order for every method
pub fn input_order_alignment(_method: &str, image_ids: &[ImageId]) -> Vec<ImageId> {
    image_ids.to_vec()
}

pub trait CaptionTokenizer {
    fn tokenize(&self, captions: &[ImageCaptions]) -> Result<Vec<ImageCaptions>>;
}

const PTB_PUNCTUATION: [&str; 17] = [
    "''", "'", "``", "`", "(", ")", "{", "}", ".", "?", "!", ",", ":", "-", "--", "...", ";",
];

/// Penn-Treebank style tokenization: lowercase, keep hyphenated and
/// non-ASCII words whole, split clitics (`dog's` -> `dog 's`, `don't` ->
/// `do n't`) and drop punctuation tokens.
pub struct PtbTokenizer {
    token: Regex,
}

impl PtbTokenizer {
    pub fn new() -> Result<Self> {
        Ok(Self {
            token: Regex::new(r"[\p{L}\p{N}]+(?:-[\p{L}\p{N}]+)*|'\p{L}+|[^\s\p{L}\p{N}]+")?,
        })
    }

    pub fn tokenize_caption(&self, caption: &str) -> String {
        let lower = caption.to_lowercase();
        let mut tokens: Vec<String> = Vec::new();
        for tok in self.token.find_iter(&lower).map(|m| m.as_str()) {
            if tok == "'t" {
                if let Some(prev) = tokens.last_mut() {
                    if prev.len() > 1 && prev.ends_with('n') {
                        prev.pop();
                        tokens.push("n't".to_string());
                        continue;
                    }
                }
            }
            if !PTB_PUNCTUATION.contains(&tok) {
                tokens.push(tok.to_string());
            }
        }
        tokens.join(" ")
    }
}

impl CaptionTokenizer for PtbTokenizer {
    fn tokenize(&self, captions: &[ImageCaptions]) -> Result<Vec<ImageCaptions>> {
        Ok(captions
            .iter()
            .map(|entry| ImageCaptions {
                image_id: entry.image_id,
                captions: entry
                    .captions
                    .iter()
                    .map(|c| self.tokenize_caption(c))
                    .collect(),
            })
            .collect())
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct EvalReport {
    pub overall: BTreeMap<String, f64>,
    pub per_image: BTreeMap<ImageId, BTreeMap<String, serde_json::Value>>,
}

pub struct CaptionEvaluator<'a> {
    pub references: &'a BTreeMap<ImageId, Vec<String>>,
    pub results: &'a BTreeMap<ImageId, Vec<String>>,
    /// Only these ids are evaluated, in this order
    pub image_ids: Vec<ImageId>,
    pub tokenizer: &'a dyn CaptionTokenizer,
    pub factory: &'a dyn ScorerFactory,
    pub alignment: AlignmentPolicy,
}

impl<'a> CaptionEvaluator<'a> {
    fn collect(
        &self,
        source: &BTreeMap<ImageId, Vec<String>>,
        what: &str,
    ) -> Result<Vec<ImageCaptions>> {
        self.image_ids
            .iter()
            .map(|id| {
                let captions = source
                    .get(id)
                    .with_context(|| format!("No {} for image {}", what, id))?;
                Ok(ImageCaptions {
                    image_id: *id,
                    captions: captions.clone(),
                })
            })
            .collect()
    }

    pub fn evaluate(&self, split: &str) -> Result<EvalReport> {
        info!("tokenization...");
        let gts = self.tokenizer.tokenize(&self.collect(self.references, "references")?)?;
        let res = self.tokenizer.tokenize(&self.collect(self.results, "results")?)?;

        let mut report = EvalReport::default();
        for metric in metrics_for_split(split) {
            info!("computing {} score...", metric);
            let mut scorer = self.factory.build(metric)?;
            for score in scorer.compute_score(&gts, &res)? {
                info!("{}: {:.3}", score.method, score.corpus);
                let ids = (self.alignment)(&score.method, &self.image_ids);
                anyhow::ensure!(
                    ids.len() == score.per_image.len(),
                    "{} returned {} per-image scores for {} images",
                    score.method,
                    score.per_image.len(),
                    ids.len()
                );
                for (id, value) in ids.into_iter().zip(score.per_image) {
                    report
                        .per_image
                        .entry(id)
                        .or_default()
                        .insert(score.method.clone(), value);
                }
                report.overall.insert(score.method, score.corpus);
            }
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metric_selection() {
        assert_eq!(metrics_for_split("train"), vec![Metric::Bleu, Metric::Cider]);
        assert_eq!(metrics_for_split("val"), Metric::ALL.to_vec());
        assert_eq!(metrics_for_split("test"), Metric::ALL.to_vec());
    }

    #[test]
    fn test_alignment_only_reorders_spice() {
        let ids = [3, 1, 4, 2];
        assert_eq!(spice_sorted_alignment("SPICE", &ids), vec![1, 2, 3, 4]);
        for method in ["Bleu_4", "METEOR", "ROUGE_L", "CIDEr"] {
            assert_eq!(spice_sorted_alignment(method, &ids), ids.to_vec());
        }
        assert_eq!(input_order_alignment("SPICE", &ids), ids.to_vec());
    }

    #[test]
    fn test_ptb_tokenizer() -> Result<()> {
        let tok = PtbTokenizer::new()?;
        assert_eq!(
            tok.tokenize_caption("A dog's ball, on the Grass."),
            "a dog 's ball on the grass"
        );
        assert_eq!(tok.tokenize_caption("  (two) cats... "), "two cats");
        assert_eq!(tok.tokenize_caption("A well-known café."), "a well-known café");
        assert_eq!(tok.tokenize_caption("Dogs don't fly - ever"), "dogs do n't fly ever");
        Ok(())
    }
}
