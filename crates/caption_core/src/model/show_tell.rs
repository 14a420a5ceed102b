//! ShowTell - Image embedding as the first decoder input

use candle_core::{DType, Device, Result, Tensor, D};
use candle_nn::{embedding, linear, ops, Dropout, Embedding, Linear, Module, VarBuilder};
use rand::distributions::{Distribution, WeightedIndex};
use rand::Rng;

use super::core::{CoreState, RnnCore};
use super::{CaptionInputs, CaptionModel, ModelConfig, SampleOptions};

pub struct ShowTell {
    img_embed: Linear,
    embed: Embedding,
    core: RnnCore,
    logit: Linear,
    dropout: Dropout,
    config: ModelConfig,
}

impl ShowTell {
    pub fn load(config: ModelConfig, vb: VarBuilder) -> Result<Self> {
        let img_embed = linear(
            config.fc_feat_size,
            config.input_encoding_size,
            vb.pp("img_embed"),
        )?;
        let embed = embedding(
            config.output_size(),
            config.input_encoding_size,
            vb.pp("embed"),
        )?;
        let core = RnnCore::load(
            config.rnn_type,
            config.input_encoding_size,
            config.rnn_size,
            config.num_layers,
            vb.pp("core"),
        )?;
        let logit = linear(config.rnn_size, config.output_size(), vb.pp("logit"))?;
        Ok(Self {
            img_embed,
            embed,
            core,
            logit,
            dropout: Dropout::new(config.drop_prob_lm),
            config,
        })
    }

    fn embed_word(&self, tokens: &[u32], device: &Device) -> Result<Tensor> {
        let it = Tensor::from_slice(tokens, tokens.len(), device)?;
        self.embed.forward(&it)
    }

    /// One decoder step: returns log-probabilities `(N, vocab + 1)` and the new state
    fn step(&self, xt: &Tensor, state: &CoreState, train: bool) -> Result<(Tensor, CoreState)> {
        let (output, state) = self.core.step(xt, state, &self.dropout, train)?;
        let output = self.dropout.forward(&output, train)?;
        let logprobs = ops::log_softmax(&self.logit.forward(&output)?, D::Minus1)?;
        Ok((logprobs, state))
    }
}

/// Draw one token per row from `exp(logprobs / temperature)`.
fn sample_rows(logprobs: &Tensor, temperature: f64) -> Result<Vec<u32>> {
    let probs = logprobs
        .detach()
        .affine(1.0 / temperature, 0.0)?
        .exp()?
        .to_dtype(DType::F32)?
        .to_vec2::<f32>()?;
    let mut rng = rand::thread_rng();
    probs
        .iter()
        .map(|row| {
            let dist = WeightedIndex::new(row)
                .map_err(|e| candle_core::Error::Msg(format!("sampling failed: {e}")))?;
            Ok(dist.sample(&mut rng) as u32)
        })
        .collect()
}

impl CaptionModel for ShowTell {
    fn config(&self) -> &ModelConfig {
        &self.config
    }

    fn forward(
        &self,
        inputs: &CaptionInputs,
        labels: &Tensor,
        ss_prob: f64,
        train: bool,
    ) -> Result<Tensor> {
        let device = labels.device();
        let (n, len) = labels.dims2()?;
        if len < 2 {
            candle_core::bail!("labels need at least two columns, got {}", len);
        }
        let seq = labels.to_dtype(DType::U32)?.to_vec2::<u32>()?;
        let mut state = self.core.zero_state(n)?;
        let mut outputs: Vec<Tensor> = Vec::with_capacity(len - 1);
        let mut prev: Option<Tensor> = None;
        let mut rng = rand::thread_rng();

        for i in 0..len {
            let xt = if i == 0 {
                self.img_embed.forward(&inputs.fc_feats)?
            } else {
                if i >= 2 && seq.iter().all(|row| row[i - 1] == 0) {
                    break;
                }
                let mut it: Vec<u32> = seq.iter().map(|row| row[i - 1]).collect();
                if train && i >= 2 && ss_prob > 0.0 {
                    if let Some(ref logprobs) = prev {
                        let picks: Vec<bool> = (0..n).map(|_| rng.gen::<f64>() < ss_prob).collect();
                        if picks.iter().any(|p| *p) {
                            let sampled = sample_rows(logprobs, 1.0)?;
                            for (row, pick) in picks.iter().enumerate() {
                                if *pick {
                                    it[row] = sampled[row];
                                }
                            }
                        }
                    }
                }
                self.embed_word(&it, device)?
            };

            let (logprobs, next) = self.step(&xt, &state, train)?;
            state = next;
            if i > 0 {
                outputs.push(logprobs.clone());
            }
            prev = Some(logprobs);
        }

        Tensor::stack(&outputs, 1)
    }

    fn sample(&self, inputs: &CaptionInputs, opts: &SampleOptions) -> Result<(Tensor, Tensor)> {
        let device = inputs.fc_feats.device();
        let n = inputs.fc_feats.dim(0)?;
        let mut state = self.core.zero_state(n)?;
        let mut unfinished = vec![true; n];
        let mut seq: Vec<Tensor> = Vec::with_capacity(self.config.seq_length);
        let mut seq_logprobs: Vec<Tensor> = Vec::with_capacity(self.config.seq_length);
        let mut logprobs: Option<Tensor> = None;

        for t in 0..self.config.seq_length + 2 {
            let xt = match (t, &logprobs) {
                (0, _) => self.img_embed.forward(&inputs.fc_feats)?,
                (1, _) | (_, None) => self.embed_word(&vec![0u32; n], device)?,
                (_, Some(lp)) => {
                    let it: Vec<u32> = if opts.sample_max {
                        lp.argmax(D::Minus1)?.to_vec1::<u32>()?
                    } else {
                        sample_rows(lp, opts.temperature)?
                    };
                    let it_tensor = Tensor::from_slice(&it, n, device)?;
                    let picked = lp.gather(&it_tensor.unsqueeze(1)?, 1)?.squeeze(1)?;
                    let xt = self.embed.forward(&it_tensor)?;

                    let masked: Vec<u32> = it
                        .iter()
                        .zip(unfinished.iter_mut())
                        .map(|(tok, alive)| {
                            *alive = *alive && *tok > 0;
                            if *alive {
                                *tok
                            } else {
                                0
                            }
                        })
                        .collect();
                    seq.push(Tensor::from_vec(masked, n, device)?);
                    seq_logprobs.push(picked);

                    if !unfinished.iter().any(|alive| *alive) {
                        break;
                    }
                    xt
                }
            };

            let (lp, next) = self.step(&xt, &state, opts.train)?;
            state = next;
            logprobs = Some(lp);
        }

        Ok((Tensor::stack(&seq, 1)?, Tensor::stack(&seq_logprobs, 1)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::RnnType;
    use candle_nn::VarMap;

    fn tiny_config(rnn_type: RnnType) -> ModelConfig {
        ModelConfig {
            caption_model: "show_tell".to_string(),
            vocab_size: 6,
            seq_length: 4,
            input_encoding_size: 8,
            rnn_type,
            rnn_size: 8,
            num_layers: 2,
            drop_prob_lm: 0.0,
            fc_feat_size: 5,
            att_feat_size: 5,
        }
    }

    #[test]
    fn test_forward_shape() -> anyhow::Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let model = ShowTell::load(tiny_config(RnnType::Lstm), vb)?;

        let fc = Tensor::randn(0f32, 1f32, (3, 5), &device)?;
        let labels = Tensor::new(
            &[
                [0u32, 1, 2, 3, 0, 0],
                [0, 4, 5, 0, 0, 0],
                [0, 6, 1, 2, 3, 0],
            ],
            &device,
        )?;
        let out = model.forward(&CaptionInputs::new(fc), &labels, 0.0, false)?;
        assert_eq!(out.dims(), &[3, 5, 7]);

        // log-probabilities sum to one
        let total = out.exp()?.sum(D::Minus1)?.flatten_all()?.to_vec1::<f32>()?;
        assert!(total.iter().all(|s| (s - 1.0).abs() < 1e-4));
        Ok(())
    }

    #[test]
    fn test_forward_stops_after_all_rows_end() -> anyhow::Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let model = ShowTell::load(tiny_config(RnnType::Gru), vb)?;

        let fc = Tensor::randn(0f32, 1f32, (2, 5), &device)?;
        let labels = Tensor::new(&[[0u32, 1, 0, 0, 0, 0], [0, 2, 0, 0, 0, 0]], &device)?;
        let out = model.forward(&CaptionInputs::new(fc), &labels, 0.25, true)?;
        // steps 1 and 2 are produced, step 3 sees an all-zero previous token
        assert_eq!(out.dims(), &[2, 2, 7]);
        Ok(())
    }

    #[test]
    fn test_sample_zeroes_after_end() -> anyhow::Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let model = ShowTell::load(tiny_config(RnnType::Lstm), vb)?;

        let fc = Tensor::randn(0f32, 1f32, (4, 5), &device)?;
        let inputs = CaptionInputs::new(fc);
        let (seq, logprobs) = model.sample(&inputs, &SampleOptions::stochastic(false))?;
        let (n, t) = seq.dims2()?;
        assert_eq!(n, 4);
        assert!(t >= 1 && t <= 4);
        assert_eq!(logprobs.dims(), seq.dims());

        for row in seq.to_vec2::<u32>()? {
            if let Some(end) = row.iter().position(|tok| *tok == 0) {
                assert!(row[end..].iter().all(|tok| *tok == 0));
            }
        }

        let (greedy, _) = model.sample(&inputs, &SampleOptions::greedy())?;
        let (again, _) = model.sample(&inputs, &SampleOptions::greedy())?;
        assert_eq!(greedy.to_vec2::<u32>()?, again.to_vec2::<u32>()?);
        Ok(())
    }
}
