//! Language Evaluation - Scores generated captions against COCO references

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use tracing::info;

use super::coco::{spice_sorted_alignment, CaptionEvaluator, ImageId, ScorerFactory};

/// One generated caption
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Prediction {
    pub image_id: ImageId,
    pub caption: String,
}

#[derive(Deserialize)]
struct Annotation {
    image_id: ImageId,
    caption: String,
}

#[derive(Deserialize)]
struct AnnotationFile {
    annotations: Vec<Annotation>,
}

/// Reference captions from a COCO-style `{"annotations": [{"image_id", "caption"}]}` file
pub fn load_references<P: AsRef<Path>>(path: P) -> Result<BTreeMap<ImageId, Vec<String>>> {
    let path = path.as_ref();
    let file = File::open(path)
        .with_context(|| format!("Failed to open annotations {}", path.display()))?;
    let parsed: AnnotationFile = serde_json::from_reader(BufReader::new(file))
        .with_context(|| format!("Failed to parse annotations {}", path.display()))?;
    let mut refs: BTreeMap<ImageId, Vec<String>> = BTreeMap::new();
    for ann in parsed.annotations {
        refs.entry(ann.image_id).or_default().push(ann.caption);
    }
    info!("Loaded references for {} images", refs.len());
    Ok(refs)
}

/// Evaluate `predictions` on `split` and write `<results_dir>/<model_id>_<split>.json`.
///
/// Predictions for images without references are dropped; only the ids of
/// the remaining predictions are evaluated.
pub fn language_eval(
    references: &BTreeMap<ImageId, Vec<String>>,
    predictions: &[Prediction],
    split: &str,
    model_id: &str,
    factory: &dyn ScorerFactory,
    results_dir: &Path,
) -> Result<BTreeMap<String, f64>> {
    let mut results: BTreeMap<ImageId, Vec<String>> = BTreeMap::new();
    let mut image_ids = Vec::new();
    for p in predictions.iter().filter(|p| references.contains_key(&p.image_id)) {
        let captions = results.entry(p.image_id).or_default();
        if captions.is_empty() {
            image_ids.push(p.image_id);
        }
        captions.push(p.caption.clone());
    }
    info!(
        "using {}/{} predictions",
        image_ids.len(),
        predictions.len()
    );
    anyhow::ensure!(
        !image_ids.is_empty(),
        "No prediction matches an image with references"
    );

    let tokenizer = factory.tokenizer()?;
    let evaluator = CaptionEvaluator {
        references,
        results: &results,
        image_ids,
        tokenizer: tokenizer.as_ref(),
        factory,
        alignment: spice_sorted_alignment,
    };
    let mut report = evaluator.evaluate(split)?;

    for p in predictions {
        if let Some(entry) = report.per_image.get_mut(&p.image_id) {
            entry.insert("caption".to_string(), serde_json::json!(p.caption));
        }
    }

    std::fs::create_dir_all(results_dir).with_context(|| {
        format!("Failed to create results directory {}", results_dir.display())
    })?;
    let out_path = results_dir.join(format!("{}_{}.json", model_id, split));
    let file = File::create(&out_path)
        .with_context(|| format!("Failed to write {}", out_path.display()))?;
    serde_json::to_writer(
        file,
        &serde_json::json!({ "overall": report.overall, "imgToEval": report.per_image }),
    )?;

    Ok(report.overall)
}

/// Reference set and scorers bound once per run
pub struct LanguageEvaluator {
    references: BTreeMap<ImageId, Vec<String>>,
    factory: Rc<dyn ScorerFactory>,
    model_id: String,
    results_dir: PathBuf,
}

impl LanguageEvaluator {
    pub fn new(
        references: BTreeMap<ImageId, Vec<String>>,
        factory: Rc<dyn ScorerFactory>,
        model_id: &str,
        results_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            references,
            factory,
            model_id: model_id.to_string(),
            results_dir: results_dir.into(),
        }
    }

    pub fn evaluate(&self, predictions: &[Prediction], split: &str) -> Result<BTreeMap<String, f64>> {
        language_eval(
            &self.references,
            predictions,
            split,
            &self.model_id,
            self.factory.as_ref(),
            &self.results_dir,
        )
    }
}
