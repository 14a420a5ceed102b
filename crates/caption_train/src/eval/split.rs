//! Split Evaluation - Validation loss and greedy captions over one split

use anyhow::Result;
use candle_core::{Device, Tensor};
use std::collections::BTreeMap;
use tracing::{debug, info};

use caption_core::{CaptionModel, SampleOptions};

use super::language::{LanguageEvaluator, Prediction};
use crate::loader::BatchSource;
use crate::train::criterion::Criterion;

#[derive(Debug, Clone)]
pub struct EvalOptions {
    pub split: String,
    /// Images to evaluate, -1 for the whole split
    pub num_images: i64,
}

#[derive(Debug, Clone)]
pub struct EvalOutcome {
    pub loss: f64,
    pub predictions: Vec<Prediction>,
    pub lang_stats: Option<BTreeMap<String, f64>>,
}

/// Words of each row up to its first 0 token
pub fn decode_sequence(vocab: &BTreeMap<String, String>, seq: &Tensor) -> Result<Vec<String>> {
    let rows = seq.to_vec2::<u32>()?;
    rows.iter()
        .map(|row| {
            let mut words = Vec::new();
            for &ix in row.iter().take_while(|&&ix| ix > 0) {
                let word = vocab
                    .get(&ix.to_string())
                    .ok_or_else(|| anyhow::anyhow!("Token {} is not in the vocabulary", ix))?;
                words.push(word.as_str());
            }
            Ok(words.join(" "))
        })
        .collect()
}

/// Run the model over a split: mean supervised loss plus one greedy caption per image.
pub fn eval_split(
    model: &dyn CaptionModel,
    criterion: &Criterion,
    loader: &mut dyn BatchSource,
    opts: &EvalOptions,
    language: Option<&LanguageEvaluator>,
    device: &Device,
) -> Result<EvalOutcome> {
    let split = opts.split.as_str();
    let vocab = loader.get_vocab();
    let spi = loader.seq_per_img();
    loader.reset_iterator(split);

    let mut n = 0i64;
    let mut loss_sum = 0.0;
    let mut loss_evals = 0usize;
    let mut predictions = Vec::new();

    loop {
        let batch = loader.get_batch(split, device)?;
        n += loader.batch_size() as i64;

        let inputs = batch.inputs();
        let width = batch.labels.dim(1)?;
        let output = model.forward(&inputs, &batch.labels, 0.0, false)?;
        let loss = criterion.forward(
            &output,
            &batch.labels.narrow(1, 1, width - 1)?,
            &batch.masks.narrow(1, 1, width - 1)?,
        )?;
        loss_sum += loss.to_scalar::<f32>()? as f64;
        loss_evals += 1;

        let (seq, _) = model.sample(&inputs.stride(spi)?, &SampleOptions::greedy())?;
        let sents = decode_sequence(&vocab, &seq)?;
        for (info, caption) in batch.infos.iter().zip(sents) {
            debug!("image {}: {}", info.id, caption);
            predictions.push(Prediction {
                image_id: info.id,
                caption,
            });
        }

        let mut ix1 = batch.bounds.it_max as i64;
        if opts.num_images >= 0 {
            ix1 = ix1.min(opts.num_images);
        }
        // a wrapped batch may repeat images from the start of the split
        for _ in 0..(n - ix1).max(0) {
            predictions.pop();
        }

        info!(
            "evaluating {} performance... {}/{} ({:.4})",
            split,
            batch.bounds.it_pos_now.saturating_sub(1),
            ix1,
            loss_sum / loss_evals as f64
        );

        if batch.bounds.wrapped || (opts.num_images >= 0 && n >= opts.num_images) {
            break;
        }
    }

    let lang_stats = match language {
        Some(evaluator) => Some(evaluator.evaluate(&predictions, split)?),
        None => None,
    };

    Ok(EvalOutcome {
        loss: loss_sum / loss_evals.max(1) as f64,
        predictions,
        lang_stats,
    })
}
