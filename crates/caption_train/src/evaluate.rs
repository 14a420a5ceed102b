//! Evaluate - Score a trained checkpoint on one split

use anyhow::{Context, Result};
use candle_core::DType;
use candle_nn::{VarBuilder, VarMap};
use clap::Args;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use tracing::{info, warn};

use crate::eval::language::{load_references, LanguageEvaluator};
use crate::eval::split::{eval_split, EvalOptions, EvalOutcome};
use crate::loader::{BatchSource, CaptionLoader, LoaderOptions};
use crate::train::checkpoint::{infos_file, load_snapshot_file, BEST_MODEL_FILE};
use crate::train::criterion::Criterion;
use crate::train::training_loop::{bridge_factories, select_device};

#[derive(Args, Debug, Clone)]
pub struct EvalArgs {
    /// Checkpoint directory of the run
    #[arg(short, long, default_value = "save")]
    pub model: String,

    /// Run identifier used in the snapshot file name
    #[arg(long, default_value = "")]
    pub id: String,

    /// Explicit snapshot path (default: `<model>/infos_<id>-best.pkl`)
    #[arg(long)]
    pub infos_path: Option<String>,

    /// Explicit weights path (default: `<model>/model-best.pth`)
    #[arg(long)]
    pub weights: Option<String>,

    #[arg(long, default_value = "test")]
    pub split: String,

    /// Images to evaluate (-1 = whole split)
    #[arg(long, default_value_t = -1, allow_negative_numbers = true)]
    pub num_images: i64,

    #[arg(long, default_value_t = 10)]
    pub batch_size: usize,

    #[arg(long, action)]
    pub language_eval: bool,

    /// Override the dataset description stored in the snapshot
    #[arg(long)]
    pub input_json: Option<String>,

    #[arg(long)]
    pub input_fc_dir: Option<String>,

    #[arg(long)]
    pub input_ann: Option<String>,

    #[arg(long)]
    pub scorer_cmd: Option<String>,

    #[arg(long, action)]
    pub cpu: bool,
}

pub fn run(args: EvalArgs) -> Result<EvalOutcome> {
    info!("--- Caption Evaluation ---");
    let model_dir = Path::new(&args.model);
    let infos_path = args
        .infos_path
        .as_ref()
        .map(PathBuf::from)
        .unwrap_or_else(|| model_dir.join(infos_file(&args.id, true)));
    let weights_path = args
        .weights
        .as_ref()
        .map(PathBuf::from)
        .unwrap_or_else(|| model_dir.join(BEST_MODEL_FILE));

    let snapshot = load_snapshot_file(&infos_path)?;
    let mut opt = snapshot.opt.clone();
    opt.batch_size = args.batch_size;
    if let Some(ref path) = args.input_json {
        opt.input_json = path.clone();
    }
    if let Some(ref dir) = args.input_fc_dir {
        opt.input_fc_dir = dir.clone();
    }
    if let Some(ref ann) = args.input_ann {
        opt.input_ann = ann.clone();
    }
    if let Some(ref cmd) = args.scorer_cmd {
        opt.scorer_cmd = cmd.clone();
    }
    info!("Snapshot: {} (epoch {}, iteration {})", infos_path.display(), snapshot.epoch, snapshot.iter);

    let device = select_device(args.cpu);
    let mut loader = CaptionLoader::new(&LoaderOptions::from_args(&opt))?;
    if loader.get_vocab() != snapshot.vocab {
        warn!("⚠️ Dataset vocabulary differs from the one the model was trained with");
    }
    anyhow::ensure!(
        loader.vocab_size() == snapshot.vocab.len(),
        "Vocabulary size mismatch: dataset {}, snapshot {}",
        loader.vocab_size(),
        snapshot.vocab.len()
    );

    let mut varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
    let model = caption_core::setup(opt.model_config(loader.vocab_size(), loader.seq_length()), vb)?;
    varmap
        .load(&weights_path)
        .with_context(|| format!("Failed to load weights {}", weights_path.display()))?;
    info!("Model loaded from {}", weights_path.display());

    let language = if args.language_eval {
        let (_, factory) = bridge_factories(&opt);
        Some(LanguageEvaluator::new(
            load_references(&opt.input_ann)?,
            Rc::new(factory),
            &opt.id,
            &opt.eval_results_dir,
        ))
    } else {
        None
    };

    let outcome = eval_split(
        model.as_ref(),
        &Criterion::from_smoothing(opt.label_smoothing),
        &mut loader,
        &EvalOptions {
            split: args.split.clone(),
            num_images: args.num_images,
        },
        language.as_ref(),
        &device,
    )?;

    info!("loss: {:.4}", outcome.loss);
    if let Some(ref stats) = outcome.lang_stats {
        for (method, score) in stats {
            info!("{}: {:.4}", method, score);
        }
    }
    Ok(outcome)
}
