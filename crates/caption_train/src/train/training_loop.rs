//! Training Loop - Epochs of supervised or self-critical training with
//! validation and checkpointing after each one

use anyhow::{Context, Result};
use candle_core::{DType, Device};
use candle_nn::{VarBuilder, VarMap};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::Path;
use std::rc::Rc;
use tracing::{info, warn};

use caption_core::{setup, CaptionModel, SampleOptions};

use super::args::TrainArgs;
use super::checkpoint::{
    check_compatible, load_optimizer_state, load_snapshot, Checkpointer, TrainingSnapshot,
    MODEL_FILE,
};
use super::criterion::{Criterion, RewardCriterion};
use super::optimizer::{CaptionOptimizer, OptimizerParams};
use super::reward::SelfCritic;
use super::schedule::{BestScore, EpochSchedule, LrPolicy};
use crate::eval::language::{load_references, LanguageEvaluator};
use crate::eval::scorer::CommandScorerFactory;
use crate::eval::split::{eval_split, EvalOptions};
use crate::eval::ScorerFactory;
use crate::loader::{Batch, BatchSource, CaptionLoader, LoaderOptions};

/// Result of one optimizer step
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepStats {
    pub loss: f32,
    /// Mean advantage, self-critical steps only
    pub avg_reward: Option<f64>,
}

/// Result of one finished epoch
#[derive(Debug, Clone, PartialEq)]
pub struct EpochReport {
    pub epoch: usize,
    pub val_loss: f64,
    pub current_score: f64,
    pub best: bool,
}

pub struct Trainer {
    args: TrainArgs,
    device: Device,
    loader: Box<dyn BatchSource>,
    varmap: VarMap,
    model: Box<dyn CaptionModel>,
    optimizer: CaptionOptimizer,
    lr_policy: LrPolicy,
    criterion: Criterion,
    rl_criterion: RewardCriterion,
    critic: Option<SelfCritic>,
    language: Option<LanguageEvaluator>,
    checkpointer: Checkpointer,
    iteration: usize,
    epoch: usize,
    best: BestScore,
}

impl Trainer {
    /// `reward_factory` scores self-critical samples; `eval_factory` scores
    /// validation captions and must not carry training-corpus document frequencies.
    pub fn new(
        args: TrainArgs,
        loader: Box<dyn BatchSource>,
        reward_factory: &dyn ScorerFactory,
        eval_factory: Rc<dyn ScorerFactory>,
        device: Device,
    ) -> Result<Self> {
        args.validate()?;
        let config = args.model_config(loader.vocab_size(), loader.seq_length());

        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let model = setup(config, vb)?;
        let optimizer = CaptionOptimizer::new(&varmap, OptimizerParams::from_args(&args))?;

        let critic = if args.self_critical_enabled() {
            Some(SelfCritic::new(
                reward_factory,
                args.cider_reward_weight,
                args.bleu_reward_weight,
                loader.seq_length(),
            )?)
        } else {
            None
        };
        let language = if args.language_eval {
            let references = load_references(&args.input_ann)?;
            Some(LanguageEvaluator::new(
                references,
                eval_factory,
                &args.id,
                &args.eval_results_dir,
            ))
        } else {
            None
        };

        Ok(Self {
            lr_policy: LrPolicy::from_args(&args),
            criterion: Criterion::from_smoothing(args.label_smoothing),
            rl_criterion: RewardCriterion,
            checkpointer: Checkpointer::new(&args.checkpoint_path, &args.id),
            args,
            device,
            loader,
            varmap,
            model,
            optimizer,
            critic,
            language,
            iteration: 0,
            epoch: 0,
            best: BestScore::default(),
        })
    }

    pub fn iteration(&self) -> usize {
        self.iteration
    }

    pub fn epoch(&self) -> usize {
        self.epoch
    }

    pub fn best_score(&self) -> Option<f64> {
        self.best.get()
    }

    /// Restore progress from `start_from`. Aborts on an architecture mismatch.
    pub fn resume(&mut self) -> Result<()> {
        let Some(start_from) = self.args.start_from.clone() else {
            return Ok(());
        };
        let snapshot = load_snapshot(&start_from, &self.args.id)?;
        check_compatible(&snapshot.opt, &self.args)?;

        self.iteration = snapshot.iter;
        self.epoch = snapshot.epoch;
        self.loader.set_iterators(snapshot.iterators);
        self.loader.set_split_ix(snapshot.split_ix);
        if self.args.load_best_score {
            self.best = BestScore::new(snapshot.best_val_score);
        }
        if let (LrPolicy::Plateau(plateau), Some(saved)) =
            (&mut self.lr_policy, snapshot.lr_plateau)
        {
            *plateau = saved;
        }

        let model_path = Path::new(&start_from).join(MODEL_FILE);
        if model_path.exists() {
            self.varmap
                .load(&model_path)
                .with_context(|| format!("Failed to load weights {}", model_path.display()))?;
            info!("📂 Weights restored from {}", model_path.display());
        } else {
            warn!("⚠️ No weights at {}, starting from fresh parameters", model_path.display());
        }
        load_optimizer_state(&mut self.optimizer, &start_from);

        info!(
            "Resumed at epoch {} iteration {} (best score {:?})",
            self.epoch,
            self.iteration,
            self.best.get()
        );
        Ok(())
    }

    /// One optimizer step on `batch` under the epoch's `schedule`
    pub fn train_step(&mut self, batch: &Batch, schedule: &EpochSchedule) -> Result<StepStats> {
        if let LrPolicy::Noam(noam) = &self.lr_policy {
            self.optimizer.set_lr(noam.rate(self.iteration + 1));
        }

        let inputs = batch.inputs();
        let (loss, avg_reward) = if !schedule.self_critical {
            let width = batch.labels.dim(1)?;
            let output = self
                .model
                .forward(&inputs, &batch.labels, schedule.ss_prob, true)?;
            let loss = self.criterion.forward(
                &output,
                &batch.labels.narrow(1, 1, width - 1)?,
                &batch.masks.narrow(1, 1, width - 1)?,
            )?;
            (loss, None)
        } else {
            let critic = self
                .critic
                .as_mut()
                .context("Self-critical epoch without a reward scorer")?;
            let (gen_result, sample_logprobs) = self
                .model
                .sample(&inputs, &SampleOptions::stochastic(true))?;
            let reward = critic.reward(
                self.model.as_ref(),
                &inputs,
                &batch.gts,
                &gen_result,
                self.loader.seq_per_img(),
            )?;
            let loss = self
                .rl_criterion
                .forward(&sample_logprobs, &gen_result, &reward.advantage)?;
            (loss, Some(reward.mean))
        };

        let grads = loss.backward()?;
        self.optimizer.step(&grads)?;
        self.device.synchronize()?;
        let loss = loss.to_scalar::<f32>()?;
        anyhow::ensure!(
            loss.is_finite(),
            "Loss diverged at iteration {}: {}",
            self.iteration,
            loss
        );
        self.iteration += 1;
        Ok(StepStats { loss, avg_reward })
    }

    fn snapshot(&self) -> TrainingSnapshot {
        let lr_plateau = match &self.lr_policy {
            LrPolicy::Plateau(plateau) => Some(plateau.clone()),
            _ => None,
        };
        TrainingSnapshot {
            iter: self.iteration,
            epoch: self.epoch,
            iterators: self.loader.iterators(),
            split_ix: self.loader.split_ix(),
            best_val_score: self.best.get(),
            opt: self.args.clone(),
            vocab: self.loader.get_vocab(),
            lr_plateau,
            date: chrono::Local::now().to_rfc3339(),
        }
    }

    fn run_epoch(&mut self) -> Result<EpochReport> {
        let schedule = EpochSchedule::for_epoch(&self.args, self.epoch);
        match (&self.lr_policy, schedule.learning_rate) {
            (LrPolicy::Plateau(plateau), _) => self.optimizer.set_lr(plateau.lr()),
            (_, Some(lr)) => self.optimizer.set_lr(lr),
            _ => {}
        }
        info!(
            "Epoch {}: lr {:.3e}, ss_prob {:.2}, self-critical {}",
            schedule.epoch,
            self.optimizer.lr(),
            schedule.ss_prob,
            schedule.self_critical
        );

        let iters = self.loader.split_len("train") / self.loader.batch_size();
        anyhow::ensure!(
            iters > 0,
            "Train split has {} images, fewer than batch_size {}",
            self.loader.split_len("train"),
            self.loader.batch_size()
        );

        let pb = ProgressBar::new(iters as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template(
                    "{prefix} {spinner:.green} [{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} ({msg})",
                )?,
        );
        pb.set_prefix(format!("Epoch: {} - Training", schedule.epoch));
        for _ in 0..iters {
            let batch = self.loader.get_batch("train", &self.device)?;
            self.device.synchronize()?;
            let stats = self.train_step(&batch, &schedule)?;
            match stats.avg_reward {
                Some(reward) => pb.set_message(format!("avg. reward: {:.3}", reward)),
                None => pb.set_message(format!("loss: {:.3}", stats.loss)),
            }
            pb.inc(1);
        }
        pb.finish_and_clear();

        let eval_opts = EvalOptions {
            split: "val".to_string(),
            num_images: self.args.val_images_use,
        };
        let outcome = eval_split(
            self.model.as_ref(),
            &self.criterion,
            self.loader.as_mut(),
            &eval_opts,
            self.language.as_ref(),
            &self.device,
        )?;
        let cider = outcome
            .lang_stats
            .as_ref()
            .and_then(|stats| stats.get("CIDEr").copied());
        info!("Validation loss: {:.4}", outcome.loss);
        if let Some(stats) = &outcome.lang_stats {
            info!("Language stats: {:?}", stats);
        }

        if let LrPolicy::Plateau(plateau) = &mut self.lr_policy {
            let metric = cider.map_or(outcome.loss, |c| -c);
            if plateau.step(metric) {
                info!("📉 Plateau reached, learning rate now {:.3e}", plateau.lr());
            }
        }

        let current_score = if self.args.language_eval {
            cider.context("Language evaluation did not report CIDEr")?
        } else {
            -outcome.loss
        };
        let best = self.best.update(current_score);

        let report = EpochReport {
            epoch: self.epoch,
            val_loss: outcome.loss,
            current_score,
            best,
        };
        self.epoch += 1;
        let snapshot = self.snapshot();
        self.checkpointer
            .save_epoch(&self.varmap, &self.optimizer, &snapshot, best)?;
        Ok(report)
    }

    /// Train from the current epoch up to `max_epochs`
    pub fn fit(&mut self) -> Result<Vec<EpochReport>> {
        let mut reports = Vec::new();
        while self.epoch < self.args.max_epochs {
            let report = self.run_epoch()?;
            if report.best {
                info!(
                    "✅ Epoch {} improved the best score to {:.4}",
                    report.epoch, report.current_score
                );
            }
            reports.push(report);
        }
        info!(
            "Training finished after {} iterations, best score {:?}",
            self.iteration,
            self.best.get()
        );
        Ok(reports)
    }
}

/// Metric bridges for a run: CIDEr rewards use the `cached_tokens`
/// document frequencies, language evaluation uses the references' own.
pub fn bridge_factories(args: &TrainArgs) -> (CommandScorerFactory, CommandScorerFactory) {
    let reward = CommandScorerFactory {
        program: args.scorer_cmd.clone(),
        args: args.scorer_arg.clone(),
        cached_tokens: Some(args.cached_tokens.clone()),
    };
    let language = CommandScorerFactory {
        program: args.scorer_cmd.clone(),
        args: args.scorer_arg.clone(),
        cached_tokens: None,
    };
    (reward, language)
}

pub fn select_device(cpu: bool) -> Device {
    if cpu {
        Device::Cpu
    } else {
        Device::cuda_if_available(0).unwrap_or(Device::Cpu)
    }
}

/// Main training function
pub fn run(args: TrainArgs) -> Result<()> {
    info!("--- Caption Training ---");
    info!(
        "Config: model={}, rnn={} x {} {}, batch={} x {}",
        args.caption_model,
        args.num_layers,
        args.rnn_size,
        args.rnn_type,
        args.batch_size,
        args.seq_per_img
    );

    let device = select_device(args.cpu);
    info!("Device initialized: {:?}", device);

    let loader = CaptionLoader::new(&LoaderOptions::from_args(&args))?;
    let (reward_factory, eval_factory) = bridge_factories(&args);

    let mut trainer = Trainer::new(
        args,
        Box::new(loader),
        &reward_factory,
        Rc::new(eval_factory),
        device,
    )?;
    trainer.resume()?;
    trainer.fit()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::train::args::tests::parse;

    #[test]
    fn test_document_frequencies_only_for_rewards() {
        let args = parse(&["--cached-tokens", "coco-train-idxs", "--scorer-cmd", "bridge"]);
        let (reward, language) = bridge_factories(&args);
        assert_eq!(reward.cached_tokens.as_deref(), Some("coco-train-idxs"));
        assert_eq!(language.cached_tokens, None);
        assert_eq!(language.program, "bridge");
    }
}
