//! Optimizer - First-order optimizers whose state can be checkpointed
//!
//! Wraps every variable of a `VarMap` together with its per-kind buffers
//! (moments, momentum, running squares) so the whole state can be written to
//! and restored from a safetensors file.

use anyhow::{Context, Result};
use candle_core::backprop::GradStore;
use candle_core::{DType, Device, Tensor, Var};
use candle_nn::VarMap;
use std::collections::HashMap;
use std::path::Path;

use super::args::{GradClipMode, OptimKind, TrainArgs};

const STEP_KEY: &str = "__step";
const LR_KEY: &str = "__lr";
const KIND_KEY: &str = "__kind";

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum GradClip {
    Norm(f64),
    Value(f64),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OptimizerParams {
    pub kind: OptimKind,
    pub lr: f64,
    /// Adam beta1, RMSProp smoothing, SGD momentum
    pub alpha: f64,
    /// Adam beta2
    pub beta: f64,
    pub epsilon: f64,
    pub weight_decay: f64,
    pub clip: Option<GradClip>,
}

impl OptimizerParams {
    pub fn from_args(args: &TrainArgs) -> Self {
        let clip = (args.grad_clip > 0.0).then(|| match args.grad_clip_mode {
            GradClipMode::Norm => GradClip::Norm(args.grad_clip),
            GradClipMode::Value => GradClip::Value(args.grad_clip),
        });
        if args.noamopt {
            // warmup schedules drive Adam with the transformer betas; the schedule sets lr
            return Self {
                kind: OptimKind::Adam,
                lr: 0.0,
                alpha: 0.9,
                beta: 0.98,
                epsilon: 1e-9,
                weight_decay: 0.0,
                clip,
            };
        }
        Self {
            kind: args.optim,
            lr: args.learning_rate,
            alpha: args.optim_alpha,
            beta: args.optim_beta,
            epsilon: args.optim_epsilon,
            weight_decay: args.weight_decay,
            clip,
        }
    }
}

fn kind_index(kind: OptimKind) -> f64 {
    match kind {
        OptimKind::Adam => 0.0,
        OptimKind::Sgd => 1.0,
        OptimKind::Sgdm => 2.0,
        OptimKind::Rmsprop => 3.0,
        OptimKind::Adagrad => 4.0,
    }
}

fn buffer_names(kind: OptimKind) -> &'static [&'static str] {
    match kind {
        OptimKind::Adam => &["exp_avg", "exp_avg_sq"],
        OptimKind::Sgd => &[],
        OptimKind::Sgdm => &["momentum_buffer"],
        OptimKind::Rmsprop => &["square_avg"],
        OptimKind::Adagrad => &["sum"],
    }
}

struct ParamSlot {
    name: String,
    var: Var,
    buffers: Vec<Tensor>,
}

pub struct CaptionOptimizer {
    params: OptimizerParams,
    slots: Vec<ParamSlot>,
    step: usize,
}

impl CaptionOptimizer {
    pub fn new(varmap: &VarMap, params: OptimizerParams) -> Result<Self> {
        let data = varmap
            .data()
            .lock()
            .map_err(|_| anyhow::anyhow!("Failed to lock VarMap"))?;
        let mut named: Vec<(String, Var)> =
            data.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        drop(data);
        named.sort_by(|a, b| a.0.cmp(&b.0));
        anyhow::ensure!(!named.is_empty(), "optimizer requires at least one parameter");

        let slots = named
            .into_iter()
            .map(|(name, var)| {
                let buffers = buffer_names(params.kind)
                    .iter()
                    .map(|_| var.as_tensor().zeros_like())
                    .collect::<candle_core::Result<Vec<_>>>()?;
                Ok(ParamSlot { name, var, buffers })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            params,
            slots,
            step: 0,
        })
    }

    pub fn lr(&self) -> f64 {
        self.params.lr
    }

    pub fn set_lr(&mut self, lr: f64) {
        self.params.lr = lr;
    }

    pub fn steps_taken(&self) -> usize {
        self.step
    }

    /// Gradients of every tracked variable, clipped according to the configured policy
    fn clipped_grads(&self, grads: &GradStore) -> Result<Vec<Option<Tensor>>> {
        let raw: Vec<Option<Tensor>> = self
            .slots
            .iter()
            .map(|slot| grads.get(slot.var.as_tensor()).cloned())
            .collect();

        match self.params.clip {
            None => Ok(raw),
            Some(GradClip::Value(limit)) => raw
                .into_iter()
                .map(|g| g.map(|g| g.clamp(-limit, limit)).transpose())
                .collect::<candle_core::Result<Vec<_>>>()
                .map_err(Into::into),
            Some(GradClip::Norm(max_norm)) => {
                let mut total_sq = 0f64;
                for g in raw.iter().flatten() {
                    total_sq += g.sqr()?.sum_all()?.to_dtype(DType::F64)?.to_scalar::<f64>()?;
                }
                let total = total_sq.sqrt();
                if total <= max_norm {
                    return Ok(raw);
                }
                let scale = max_norm / (total + 1e-6);
                raw.into_iter()
                    .map(|g| g.map(|g| g.affine(scale, 0.0)).transpose())
                    .collect::<candle_core::Result<Vec<_>>>()
                    .map_err(Into::into)
            }
        }
    }

    /// Apply one update from `grads`. Variables without a gradient are left untouched.
    pub fn step(&mut self, grads: &GradStore) -> Result<()> {
        let grads = self.clipped_grads(grads)?;
        self.step += 1;
        let p = self.params;
        let t = self.step as i32;

        for (slot, grad) in self.slots.iter_mut().zip(grads) {
            let Some(mut grad) = grad else { continue };
            let theta = slot.var.as_tensor().detach();
            if p.weight_decay != 0.0 {
                grad = (grad + theta.affine(p.weight_decay, 0.0)?)?;
            }

            let update = match p.kind {
                OptimKind::Sgd => grad.affine(p.lr, 0.0)?,
                OptimKind::Sgdm => {
                    let buf = (slot.buffers[0].affine(p.alpha, 0.0)? + &grad)?;
                    let update = buf.affine(p.lr, 0.0)?;
                    slot.buffers[0] = buf;
                    update
                }
                OptimKind::Rmsprop => {
                    let sq = (slot.buffers[0].affine(p.alpha, 0.0)?
                        + grad.sqr()?.affine(1.0 - p.alpha, 0.0)?)?;
                    let denom = sq.sqrt()?.affine(1.0, p.epsilon)?;
                    let update = (grad / denom)?.affine(p.lr, 0.0)?;
                    slot.buffers[0] = sq;
                    update
                }
                OptimKind::Adagrad => {
                    let sum = (&slot.buffers[0] + grad.sqr()?)?;
                    let denom = sum.sqrt()?.affine(1.0, p.epsilon)?;
                    let update = (grad / denom)?.affine(p.lr, 0.0)?;
                    slot.buffers[0] = sum;
                    update
                }
                OptimKind::Adam => {
                    let m = (slot.buffers[0].affine(p.alpha, 0.0)?
                        + grad.affine(1.0 - p.alpha, 0.0)?)?;
                    let v = (slot.buffers[1].affine(p.beta, 0.0)?
                        + grad.sqr()?.affine(1.0 - p.beta, 0.0)?)?;
                    let m_hat = m.affine(1.0 / (1.0 - p.alpha.powi(t)), 0.0)?;
                    let v_hat = v.affine(1.0 / (1.0 - p.beta.powi(t)), 0.0)?;
                    let denom = v_hat.sqrt()?.affine(1.0, p.epsilon)?;
                    let update = (m_hat / denom)?.affine(p.lr, 0.0)?;
                    slot.buffers[0] = m;
                    slot.buffers[1] = v;
                    update
                }
            };
            slot.var.set(&(theta - update)?)?;
        }
        Ok(())
    }

    fn state_tensors(&self) -> Result<HashMap<String, Tensor>> {
        let mut tensors = HashMap::new();
        let cpu = Device::Cpu;
        tensors.insert(STEP_KEY.to_string(), Tensor::new(&[self.step as f64], &cpu)?);
        tensors.insert(LR_KEY.to_string(), Tensor::new(&[self.params.lr], &cpu)?);
        tensors.insert(
            KIND_KEY.to_string(),
            Tensor::new(&[kind_index(self.params.kind)], &cpu)?,
        );
        for slot in &self.slots {
            for (name, buf) in buffer_names(self.params.kind).iter().zip(&slot.buffers) {
                tensors.insert(format!("{}.{}", slot.name, name), buf.clone());
            }
        }
        Ok(tensors)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        candle_core::safetensors::save(&self.state_tensors()?, path)
            .with_context(|| format!("Failed to write optimizer state to {}", path.display()))
    }

    /// Restore state written by `save`. Fails (leaving `self` unchanged) on any mismatch.
    pub fn load<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        let path = path.as_ref();
        let mut tensors = candle_core::safetensors::load(path, &Device::Cpu)
            .with_context(|| format!("Failed to read optimizer state from {}", path.display()))?;

        let scalar = |tensors: &HashMap<String, Tensor>, key: &str| -> Result<f64> {
            let t = tensors
                .get(key)
                .with_context(|| format!("optimizer state missing '{}'", key))?;
            Ok(t.to_dtype(DType::F64)?.flatten_all()?.to_vec1::<f64>()?[0])
        };
        let kind = scalar(&tensors, KIND_KEY)?;
        anyhow::ensure!(
            kind == kind_index(self.params.kind),
            "optimizer state was written by a different optimizer ({:?} expected)",
            self.params.kind
        );
        let step = scalar(&tensors, STEP_KEY)? as usize;
        let lr = scalar(&tensors, LR_KEY)?;

        let mut restored = Vec::with_capacity(self.slots.len());
        for slot in &self.slots {
            let target = slot.var.as_tensor();
            let mut buffers = Vec::with_capacity(slot.buffers.len());
            for name in buffer_names(self.params.kind) {
                let key = format!("{}.{}", slot.name, name);
                let t = tensors
                    .remove(&key)
                    .with_context(|| format!("optimizer state missing '{}'", key))?;
                anyhow::ensure!(
                    t.dims() == target.dims(),
                    "optimizer state shape mismatch for '{}': {:?} vs {:?}",
                    key,
                    t.dims(),
                    target.dims()
                );
                buffers.push(t.to_dtype(target.dtype())?.to_device(target.device())?);
            }
            restored.push(buffers);
        }

        for (slot, buffers) in self.slots.iter_mut().zip(restored) {
            slot.buffers = buffers;
        }
        self.step = step;
        self.params.lr = lr;
        Ok(())
    }
}
