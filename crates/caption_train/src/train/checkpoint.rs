//! Checkpoint Management - Training state persistence
//!
//! Layout under `checkpoint_path`:
//! - `model.pth` / `model-best.pth`: parameters (safetensors)
//! - `optimizer.pth`: optimizer state (safetensors)
//! - `infos_<id>.pkl` / `infos_<id>-best.pkl`: training snapshot (JSON)

use anyhow::{Context, Result};
use candle_nn::VarMap;
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use super::args::{TrainArgs, STRUCTURAL_FIELDS};
use super::optimizer::CaptionOptimizer;
use super::schedule::ReduceLrOnPlateau;

pub const MODEL_FILE: &str = "model.pth";
pub const BEST_MODEL_FILE: &str = "model-best.pth";
pub const OPTIMIZER_FILE: &str = "optimizer.pth";

pub fn infos_file(id: &str, best: bool) -> String {
    if best {
        format!("infos_{}-best.pkl", id)
    } else {
        format!("infos_{}.pkl", id)
    }
}

/// Training progress needed to resume a run
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct TrainingSnapshot {
    pub iter: usize,
    /// Next epoch to run
    pub epoch: usize,
    pub iterators: BTreeMap<String, usize>,
    pub split_ix: BTreeMap<String, Vec<usize>>,
    pub best_val_score: Option<f64>,
    pub opt: TrainArgs,
    pub vocab: BTreeMap<String, String>,
    #[serde(default)]
    pub lr_plateau: Option<ReduceLrOnPlateau>,
    pub date: String,
}

/// Run `write` while holding an exclusive lock on `<path>.lock`
fn with_lock<F>(path: &Path, write: F) -> Result<()>
where
    F: FnOnce() -> Result<()>,
{
    let lock_path = format!("{}.lock", path.display());
    let lock_file = File::create(&lock_path)
        .with_context(|| format!("Failed to create lock file {}", lock_path))?;
    lock_file.lock_exclusive()?;
    let result = write();
    lock_file.unlock()?;
    result
}

fn save_securely(varmap: &VarMap, path: &Path) -> Result<()> {
    with_lock(path, || {
        varmap
            .save(path)
            .with_context(|| format!("Failed to save parameters to {}", path.display()))
    })
}

fn write_snapshot(snapshot: &TrainingSnapshot, path: &Path) -> Result<()> {
    with_lock(path, || {
        let file = File::create(path)
            .with_context(|| format!("Failed to create {}", path.display()))?;
        serde_json::to_writer_pretty(file, snapshot)
            .with_context(|| format!("Failed to write {}", path.display()))
    })
}

pub struct Checkpointer {
    dir: PathBuf,
    id: String,
}

impl Checkpointer {
    pub fn new<P: Into<PathBuf>>(dir: P, id: &str) -> Self {
        Self {
            dir: dir.into(),
            id: id.to_string(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Latest model, optimizer and snapshot every epoch; `-best` copies when `best`.
    pub fn save_epoch(
        &self,
        varmap: &VarMap,
        optimizer: &CaptionOptimizer,
        snapshot: &TrainingSnapshot,
        best: bool,
    ) -> Result<()> {
        std::fs::create_dir_all(&self.dir).with_context(|| {
            format!("Failed to create checkpoint directory {}", self.dir.display())
        })?;

        let model_path = self.dir.join(MODEL_FILE);
        save_securely(varmap, &model_path)?;
        info!("model saved to {}", model_path.display());

        let optimizer_path = self.dir.join(OPTIMIZER_FILE);
        with_lock(&optimizer_path, || optimizer.save(&optimizer_path))?;

        write_snapshot(snapshot, &self.dir.join(infos_file(&self.id, false)))?;

        if best {
            let best_path = self.dir.join(BEST_MODEL_FILE);
            save_securely(varmap, &best_path)?;
            write_snapshot(snapshot, &self.dir.join(infos_file(&self.id, true)))?;
            info!("🏆 best model saved to {}", best_path.display());
        }
        Ok(())
    }
}

pub fn load_snapshot<P: AsRef<Path>>(start_from: P, id: &str) -> Result<TrainingSnapshot> {
    let path = start_from.as_ref().join(infos_file(id, false));
    load_snapshot_file(&path)
}

pub fn load_snapshot_file(path: &Path) -> Result<TrainingSnapshot> {
    let file = File::open(path)
        .with_context(|| format!("Training snapshot not found: {}", path.display()))?;
    serde_json::from_reader(BufReader::new(file))
        .with_context(|| format!("Failed to parse training snapshot {}", path.display()))
}

/// Fails on the first architecture option that differs between the saved and current run
pub fn check_compatible(saved: &TrainArgs, current: &TrainArgs) -> Result<()> {
    let saved = serde_json::to_value(saved)?;
    let current = serde_json::to_value(current)?;
    for field in STRUCTURAL_FIELDS {
        let (old, new) = (&saved[field], &current[field]);
        anyhow::ensure!(
            old == new,
            "Command line argument and saved model disagree on '{}' (saved {}, current {})",
            field,
            old,
            new
        );
    }
    Ok(())
}

/// Restore optimizer state from `<start_from>/optimizer.pth`. A missing or
/// unreadable file keeps the fresh state.
pub fn load_optimizer_state<P: AsRef<Path>>(optimizer: &mut CaptionOptimizer, start_from: P) -> bool {
    let path = start_from.as_ref().join(OPTIMIZER_FILE);
    if !path.exists() {
        info!("No optimizer state at {}, starting fresh", path.display());
        return false;
    }
    match optimizer.load(&path) {
        Ok(()) => {
            info!("Optimizer state restored from {}", path.display());
            true
        }
        Err(e) => {
            warn!("⚠️ Ignoring optimizer state {}: {}", path.display(), e);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::train::args::tests::parse;
    use crate::train::optimizer::OptimizerParams;
    use candle_core::{DType, Device};
    use candle_nn::{Init, VarBuilder};

    fn snapshot(args: &TrainArgs, best: Option<f64>) -> TrainingSnapshot {
        TrainingSnapshot {
            iter: 12,
            epoch: 3,
            iterators: BTreeMap::from([("train".to_string(), 4), ("val".to_string(), 0)]),
            split_ix: BTreeMap::from([("train".to_string(), vec![2, 0, 1])]),
            best_val_score: best,
            opt: args.clone(),
            vocab: BTreeMap::from([("1".to_string(), "a".to_string())]),
            lr_plateau: None,
            date: chrono::Local::now().to_rfc3339(),
        }
    }

    fn varmap() -> Result<VarMap> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        vb.get_with_hints((2, 2), "w", Init::Const(0.5))?;
        Ok(varmap)
    }

    #[test]
    fn test_save_epoch_writes_best_only_when_asked() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let ckpt_dir = dir.path().join("nested").join("save");
        let args = parse(&["--id", "run"]);
        let vm = varmap()?;
        let optimizer = CaptionOptimizer::new(&vm, OptimizerParams::from_args(&args))?;
        let ckpt = Checkpointer::new(&ckpt_dir, "run");

        ckpt.save_epoch(&vm, &optimizer, &snapshot(&args, None), false)?;
        assert!(ckpt_dir.join(MODEL_FILE).exists());
        assert!(ckpt_dir.join(OPTIMIZER_FILE).exists());
        assert!(ckpt_dir.join("infos_run.pkl").exists());
        assert!(!ckpt_dir.join(BEST_MODEL_FILE).exists());
        assert!(!ckpt_dir.join("infos_run-best.pkl").exists());

        ckpt.save_epoch(&vm, &optimizer, &snapshot(&args, Some(0.7)), true)?;
        assert!(ckpt_dir.join(BEST_MODEL_FILE).exists());
        assert!(ckpt_dir.join("infos_run-best.pkl").exists());

        let restored = load_snapshot(&ckpt_dir, "run")?;
        assert_eq!(restored, snapshot_with_date(&args, Some(0.7), &restored.date));
        Ok(())
    }

    fn snapshot_with_date(args: &TrainArgs, best: Option<f64>, date: &str) -> TrainingSnapshot {
        TrainingSnapshot {
            date: date.to_string(),
            ..snapshot(args, best)
        }
    }

    #[test]
    fn test_best_score_survives_reload_exactly() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let args = parse(&["--id", "exact"]);
        let score = -1.5925548076629639_f64;
        let path = dir.path().join(infos_file("exact", false));
        write_snapshot(&snapshot(&args, Some(score)), &path)?;
        let restored = load_snapshot_file(&path)?;
        assert_eq!(
            restored.best_val_score.map(f64::to_bits),
            Some(score.to_bits())
        );
        Ok(())
    }

    #[test]
    fn test_missing_snapshot_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_snapshot(dir.path(), "absent").unwrap_err();
        assert!(err.to_string().contains("infos_absent.pkl"));
    }

    #[test]
    fn test_unwritable_checkpoint_dir_is_fatal() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let blocker = dir.path().join("file");
        std::fs::write(&blocker, b"not a directory")?;
        let args = parse(&[]);
        let vm = varmap()?;
        let optimizer = CaptionOptimizer::new(&vm, OptimizerParams::from_args(&args))?;
        let ckpt = Checkpointer::new(blocker.join("save"), "");
        assert!(ckpt
            .save_epoch(&vm, &optimizer, &snapshot(&args, None), false)
            .is_err());
        Ok(())
    }

    #[test]
    fn test_check_compatible_names_first_mismatch() {
        let saved = parse(&["--caption-model", "fc", "--rnn-size", "256"]);
        let current = parse(&["--rnn-size", "128"]);
        let err = check_compatible(&saved, &current).unwrap_err().to_string();
        assert!(err.contains("'caption_model'"), "{}", err);

        let same = parse(&["--learning-rate", "0.1"]);
        assert!(check_compatible(&parse(&[]), &same).is_ok());
        let gru = parse(&["--rnn-type", "gru"]);
        assert!(check_compatible(&parse(&[]), &gru).is_err());
    }

    #[test]
    fn test_optimizer_state_is_optional() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let args = parse(&[]);
        let vm = varmap()?;
        let mut optimizer = CaptionOptimizer::new(&vm, OptimizerParams::from_args(&args))?;
        assert!(!load_optimizer_state(&mut optimizer, dir.path()));

        std::fs::write(dir.path().join(OPTIMIZER_FILE), b"garbage")?;
        assert!(!load_optimizer_state(&mut optimizer, dir.path()));
        Ok(())
    }
}
