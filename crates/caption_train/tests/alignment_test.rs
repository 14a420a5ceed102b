mod common;

use anyhow::Result;
use std::collections::BTreeMap;

use caption_train::eval::coco::input_order_alignment;
use caption_train::eval::{spice_sorted_alignment, CaptionEvaluator, Metric, PtbTokenizer};
use common::RecordingFactory;

fn annotations(ids: &[u64], text: &str) -> BTreeMap<u64, Vec<String>> {
    ids.iter()
        .map(|id| (*id, vec![format!("{} {}", text, id)]))
        .collect()
}

#[test]
fn spice_scores_follow_sorted_ids() -> Result<()> {
    let ids = vec![3, 1, 4, 2];
    let references = annotations(&ids, "A reference caption for image");
    let results = annotations(&ids, "a candidate for image");
    let tokenizer = PtbTokenizer::new()?;
    let factory = RecordingFactory::with_scores(&[0.9, 0.8, 0.7, 0.6]);

    let evaluator = CaptionEvaluator {
        references: &references,
        results: &results,
        image_ids: ids.clone(),
        tokenizer: &tokenizer,
        factory: &factory,
        alignment: spice_sorted_alignment,
    };
    let report = evaluator.evaluate("test")?;

    let spice: BTreeMap<u64, f64> = report
        .per_image
        .iter()
        .map(|(id, scores)| (*id, scores["SPICE"].as_f64().unwrap_or(f64::NAN)))
        .collect();
    assert_eq!(spice, BTreeMap::from([(1, 0.9), (2, 0.8), (3, 0.7), (4, 0.6)]));

    // every other method keeps the input order: ids[i] gets scores[i]
    for method in ["Bleu_4", "METEOR", "ROUGE_L", "CIDEr"] {
        for (id, expected) in ids.iter().zip([0.9, 0.8, 0.7, 0.6]) {
            assert_eq!(report.per_image[id][method], serde_json::json!(expected));
        }
    }
    assert!((report.overall["SPICE"] - 0.75).abs() < 1e-12);
    Ok(())
}

#[test]
fn input_order_alignment_misplaces_spice() -> Result<()> {
    let ids = vec![3, 1, 4, 2];
    let references = annotations(&ids, "ref");
    let results = annotations(&ids, "res");
    let tokenizer = PtbTokenizer::new()?;
    let factory = RecordingFactory::with_scores(&[0.9, 0.8, 0.7, 0.6]);

    let evaluator = CaptionEvaluator {
        references: &references,
        results: &results,
        image_ids: ids,
        tokenizer: &tokenizer,
        factory: &factory,
        alignment: input_order_alignment,
    };
    let report = evaluator.evaluate("val")?;
    assert_eq!(report.per_image[&3]["SPICE"], serde_json::json!(0.9));
    assert_eq!(report.per_image[&1]["SPICE"], serde_json::json!(0.8));
    Ok(())
}

#[test]
fn train_split_runs_only_fast_metrics() -> Result<()> {
    let ids = vec![5, 2];
    let references = annotations(&ids, "ref");
    let results = annotations(&ids, "res");
    let tokenizer = PtbTokenizer::new()?;
    let factory = RecordingFactory::with_scores(&[0.1, 0.2]);

    let evaluator = CaptionEvaluator {
        references: &references,
        results: &results,
        image_ids: ids,
        tokenizer: &tokenizer,
        factory: &factory,
        alignment: spice_sorted_alignment,
    };
    let report = evaluator.evaluate("train")?;
    assert_eq!(factory.scored(), vec![Metric::Bleu, Metric::Cider]);
    for slow in ["SPICE", "METEOR", "ROUGE_L"] {
        assert!(!report.overall.contains_key(slow));
    }

    evaluator.evaluate("val")?;
    let scored = factory.scored();
    assert_eq!(&scored[2..], &Metric::ALL);
    Ok(())
}

#[test]
fn evaluation_is_restricted_to_configured_ids() -> Result<()> {
    let references = annotations(&[1, 2, 3], "ref");
    let results = annotations(&[1, 2, 3], "res");
    let tokenizer = PtbTokenizer::new()?;
    let factory = RecordingFactory::with_scores(&[0.5]);

    let evaluator = CaptionEvaluator {
        references: &references,
        results: &results,
        image_ids: vec![2],
        tokenizer: &tokenizer,
        factory: &factory,
        alignment: spice_sorted_alignment,
    };
    let report = evaluator.evaluate("val")?;
    assert_eq!(report.per_image.keys().copied().collect::<Vec<_>>(), vec![2]);

    let missing = CaptionEvaluator {
        image_ids: vec![9],
        ..evaluator
    };
    assert!(missing.evaluate("val").is_err());
    Ok(())
}
