//! Self-Critical Reward - Sampled captions scored against a greedy baseline

use anyhow::{Context, Result};
use candle_core::Tensor;
use tracing::debug;

use caption_core::{CaptionInputs, CaptionModel, SampleOptions};

use crate::eval::coco::{ImageCaptions, MethodScore, Metric, Scorer, ScorerFactory};

/// Token ids up to and including the first 0, space separated
pub fn array_to_str(tokens: &[u32]) -> String {
    let mut out = Vec::new();
    for &t in tokens {
        out.push(t.to_string());
        if t == 0 {
            break;
        }
    }
    out.join(" ")
}

/// Reference caption as the label row it came from: zero-padded to
/// `seq_length`, so it carries the end token unless it fills the row.
pub fn reference_to_str(caption: &[u32], seq_length: usize) -> String {
    let mut row = caption.to_vec();
    if row.len() < seq_length {
        row.push(0);
    }
    array_to_str(&row)
}

pub struct Reward {
    /// `(N, T)` advantage, the same value at every position of a row
    pub advantage: Tensor,
    /// Mean advantage over the batch
    pub mean: f64,
}

pub struct SelfCritic {
    cider: Option<Box<dyn Scorer>>,
    bleu: Option<Box<dyn Scorer>>,
    cider_weight: f64,
    bleu_weight: f64,
    seq_length: usize,
}

fn per_image(scores: &[MethodScore], method: &str) -> Result<Vec<f64>> {
    let score = scores
        .iter()
        .find(|s| s.method == method)
        .with_context(|| format!("Scorer did not report {}", method))?;
    score
        .per_image
        .iter()
        .map(|v| {
            v.as_f64()
                .with_context(|| format!("{} per-image score is not a number: {}", method, v))
        })
        .collect()
}

impl SelfCritic {
    pub fn new(
        factory: &dyn ScorerFactory,
        cider_weight: f64,
        bleu_weight: f64,
        seq_length: usize,
    ) -> Result<Self> {
        anyhow::ensure!(
            cider_weight > 0.0 || bleu_weight > 0.0,
            "Self-critical training needs a positive CIDEr or BLEU reward weight"
        );
        let cider = (cider_weight > 0.0)
            .then(|| factory.build(Metric::Cider))
            .transpose()?;
        let bleu = (bleu_weight > 0.0)
            .then(|| factory.build(Metric::Bleu))
            .transpose()?;
        Ok(Self {
            cider,
            bleu,
            cider_weight,
            bleu_weight,
            seq_length,
        })
    }

    /// Weighted sequence score of every candidate row
    fn score(&mut self, gts: &[ImageCaptions], res: &[ImageCaptions]) -> Result<Vec<f64>> {
        let mut total = vec![0.0; res.len()];
        if let Some(ref mut cider) = self.cider {
            let scores = per_image(&cider.compute_score(gts, res)?, "CIDEr")?;
            anyhow::ensure!(scores.len() == res.len(), "CIDEr returned {} scores", scores.len());
            for (t, s) in total.iter_mut().zip(scores) {
                *t += self.cider_weight * s;
            }
        }
        if let Some(ref mut bleu) = self.bleu {
            let scores = per_image(&bleu.compute_score(gts, res)?, "Bleu_4")?;
            anyhow::ensure!(scores.len() == res.len(), "Bleu_4 returned {} scores", scores.len());
            for (t, s) in total.iter_mut().zip(scores) {
                *t += self.bleu_weight * s;
            }
        }
        Ok(total)
    }

    /// Advantage of each sampled caption over the greedy caption of the same row.
    ///
    /// `gts[i]` are the references of image `i`; row `r` belongs to image
    /// `r / seq_per_img`.
    pub fn reward(
        &mut self,
        model: &dyn CaptionModel,
        inputs: &CaptionInputs,
        gts: &[Vec<Vec<u32>>],
        gen_result: &Tensor,
        seq_per_img: usize,
    ) -> Result<Reward> {
        let (greedy, _) = model.sample(inputs, &SampleOptions::greedy())?;
        let sampled = gen_result.to_vec2::<u32>()?;
        let greedy = greedy.to_vec2::<u32>()?;
        let rows = sampled.len();
        anyhow::ensure!(
            greedy.len() == rows && gts.len() * seq_per_img == rows,
            "Reward batch mismatch: {} sampled, {} greedy, {} images x {}",
            rows,
            greedy.len(),
            gts.len(),
            seq_per_img
        );

        let mut res = Vec::with_capacity(2 * rows);
        for (i, seq) in sampled.iter().chain(greedy.iter()).enumerate() {
            res.push(ImageCaptions {
                image_id: i as u64,
                captions: vec![array_to_str(seq)],
            });
        }
        let refs = res
            .iter()
            .map(|r| {
                let image = (r.image_id as usize % rows) / seq_per_img;
                ImageCaptions {
                    image_id: r.image_id,
                    captions: gts[image]
                        .iter()
                        .map(|c| reference_to_str(c, self.seq_length))
                        .collect(),
                }
            })
            .collect::<Vec<_>>();

        let scores = self.score(&refs, &res)?;
        let (sample_scores, baseline) = scores.split_at(rows);
        let advantage: Vec<f64> = sample_scores
            .iter()
            .zip(baseline)
            .map(|(s, b)| s - b)
            .collect();
        let mean = advantage.iter().sum::<f64>() / rows.max(1) as f64;
        debug!(
            "reward: sampled {:.4}, greedy {:.4}",
            sample_scores.iter().sum::<f64>() / rows.max(1) as f64,
            baseline.iter().sum::<f64>() / rows.max(1) as f64
        );

        let steps = gen_result.dim(1)?;
        let broadcast: Vec<f32> = advantage
            .iter()
            .flat_map(|a| std::iter::repeat(*a as f32).take(steps))
            .collect();
        let advantage = Tensor::from_vec(broadcast, (rows, steps), gen_result.device())?;
        Ok(Reward { advantage, mean })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use caption_core::{setup, ModelConfig};
    use candle_core::{DType, Device};
    use candle_nn::{VarBuilder, VarMap};
    use std::cell::RefCell;
    use std::rc::Rc;

    /// CIDEr stand-in: 1.0 when the candidate equals a reference, 0 otherwise
    struct ExactMatch {
        calls: Rc<RefCell<Vec<Metric>>>,
        metric: Metric,
    }

    impl Scorer for ExactMatch {
        fn metric(&self) -> Metric {
            self.metric
        }

        fn compute_score(
            &mut self,
            gts: &[ImageCaptions],
            res: &[ImageCaptions],
        ) -> Result<Vec<MethodScore>> {
            self.calls.borrow_mut().push(self.metric);
            let per_image: Vec<serde_json::Value> = gts
                .iter()
                .zip(res)
                .map(|(g, r)| {
                    let hit = g.captions.contains(&r.captions[0]);
                    serde_json::json!(if hit { 1.0 } else { 0.0 })
                })
                .collect();
            Ok(self
                .metric
                .methods()
                .iter()
                .map(|m| MethodScore {
                    method: m.to_string(),
                    corpus: 0.0,
                    per_image: per_image.clone(),
                })
                .collect())
        }
    }

    struct ExactFactory(Rc<RefCell<Vec<Metric>>>);

    impl ScorerFactory for ExactFactory {
        fn build(&self, metric: Metric) -> Result<Box<dyn Scorer>> {
            Ok(Box::new(ExactMatch {
                calls: self.0.clone(),
                metric,
            }))
        }
    }

    fn tiny_model() -> Result<(Box<dyn CaptionModel>, CaptionInputs)> {
        let config = ModelConfig {
            vocab_size: 5,
            seq_length: 4,
            input_encoding_size: 8,
            rnn_size: 8,
            fc_feat_size: 3,
            ..ModelConfig::default()
        };
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let model = setup(config, vb)?;
        let inputs = CaptionInputs::new(Tensor::ones((4, 3), DType::F32, &Device::Cpu)?);
        Ok((model, inputs))
    }

    #[test]
    fn test_array_to_str_keeps_end_token() {
        assert_eq!(array_to_str(&[4, 5, 0, 3]), "4 5 0");
        assert_eq!(array_to_str(&[4, 5]), "4 5");
        assert_eq!(array_to_str(&[0, 0]), "0");
    }

    #[test]
    fn test_reference_matches_padded_candidate() {
        assert_eq!(reference_to_str(&[1, 2], 4), array_to_str(&[1, 2, 0, 0]));
        assert_eq!(reference_to_str(&[1, 2], 4), "1 2 0");
        assert_eq!(reference_to_str(&[1, 2, 3, 4], 4), "1 2 3 4");
    }

    #[test]
    fn test_advantage_broadcast_per_row() -> Result<()> {
        let (model, inputs) = tiny_model()?;
        let (greedy, _) = model.sample(&inputs, &SampleOptions::greedy())?;
        let greedy_rows = greedy.to_vec2::<u32>()?;

        // rows 0 and 2 reproduce their image's reference word for word
        let sampled = vec![
            vec![1u32, 2, 0, 0],
            vec![3, 0, 0, 0],
            vec![4, 4, 4, 4],
            vec![3, 0, 0, 0],
        ];
        let gen = Tensor::from_vec(sampled.concat(), (4, 4), &Device::Cpu)?;
        let gts = vec![vec![vec![1u32, 2]], vec![vec![4u32, 4, 4, 4]]];
        let references = ["1 2 0", "4 4 4 4"];

        let calls = Rc::new(RefCell::new(Vec::new()));
        let mut critic = SelfCritic::new(&ExactFactory(calls.clone()), 1.0, 0.0, 4)?;
        let reward = critic.reward(model.as_ref(), &inputs, &gts, &gen, 2)?;

        assert_eq!(reward.advantage.dims(), &[4, 4]);
        let adv = reward.advantage.to_vec2::<f32>()?;
        for row in &adv {
            assert!(row.iter().all(|v| *v == row[0]));
        }
        let greedy_hit = |r: usize| {
            if array_to_str(&greedy_rows[r]) == references[r / 2] {
                1.0
            } else {
                0.0
            }
        };
        assert_eq!(adv[0][0], 1.0 - greedy_hit(0));
        assert_eq!(adv[1][0], 0.0 - greedy_hit(1));
        assert_eq!(adv[2][0], 1.0 - greedy_hit(2));
        assert_eq!(adv[3][0], 0.0 - greedy_hit(3));
        assert_eq!(*calls.borrow(), vec![Metric::Cider]);
        Ok(())
    }

    #[test]
    fn test_critic_requires_a_weight() {
        let calls = Rc::new(RefCell::new(Vec::new()));
        assert!(SelfCritic::new(&ExactFactory(calls), 0.0, 0.0, 4).is_err());
    }
}
