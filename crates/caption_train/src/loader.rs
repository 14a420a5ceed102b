//! Caption Loader - Batches of visual features and encoded captions per split
//!
//! Dataset layout:
//! - `input_json`: `{"ix_to_word": {...}, "seq_length": 16, "images": [{"id", "split", "file_path", "labels"}]}`
//! - `<feature_dir>/<id>.f32`: raw little-endian f32, `rows x width`

use anyhow::{Context, Result};
use byteorder::{ByteOrder, LittleEndian};
use candle_core::{Device, Tensor};
use memmap2::Mmap;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs::File;
use std::path::{Path, PathBuf};

use caption_core::CaptionInputs;

use crate::train::TrainArgs;

pub type ImageId = u64;

pub const SPLITS: [&str; 3] = ["train", "val", "test"];

#[derive(Deserialize, Debug, Clone)]
pub struct ImageEntry {
    pub id: ImageId,
    pub split: String,
    #[serde(default)]
    pub file_path: String,
    /// Encoded reference captions (word indices, 1-based)
    #[serde(default)]
    pub labels: Vec<Vec<u32>>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct DatasetInfo {
    pub ix_to_word: BTreeMap<String, String>,
    #[serde(default)]
    pub seq_length: Option<usize>,
    pub images: Vec<ImageEntry>,
}

impl DatasetInfo {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file =
            File::open(path).with_context(|| format!("Failed to open dataset {}", path.display()))?;
        serde_json::from_reader(std::io::BufReader::new(file))
            .with_context(|| format!("Failed to parse dataset {}", path.display()))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ImageRef {
    pub ix: usize,
    pub id: ImageId,
    pub file_path: String,
}

/// Position of a split iterator after a batch was drawn
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bounds {
    pub it_pos_now: usize,
    pub it_max: usize,
    pub wrapped: bool,
}

#[derive(Debug)]
pub struct Batch {
    /// `(N * seq_per_img, fc_feat_size)`
    pub fc_feats: Tensor,
    /// `(N * seq_per_img, K, att_feat_size)`
    pub att_feats: Option<Tensor>,
    /// `(N * seq_per_img, K)`, present only when region counts differ
    pub att_masks: Option<Tensor>,
    /// `(N * seq_per_img, K, 4)`
    pub boxes: Option<Tensor>,
    /// `(N * seq_per_img, seq_length + 2)` u32, zero in the first column and after each caption
    pub labels: Tensor,
    /// `(N * seq_per_img, seq_length + 2)` f32
    pub masks: Tensor,
    /// All reference captions of every image, truncated to `seq_length`
    pub gts: Vec<Vec<Vec<u32>>>,
    pub infos: Vec<ImageRef>,
    pub bounds: Bounds,
}

impl Batch {
    pub fn inputs(&self) -> CaptionInputs {
        CaptionInputs {
            fc_feats: self.fc_feats.clone(),
            att_feats: self.att_feats.clone(),
            att_masks: self.att_masks.clone(),
            boxes: self.boxes.clone(),
        }
    }
}

/// Batch supplier consumed by the trainer and the evaluation pass
pub trait BatchSource {
    fn get_batch(&mut self, split: &str, device: &Device) -> Result<Batch>;
    fn reset_iterator(&mut self, split: &str);
    fn vocab_size(&self) -> usize;
    fn seq_length(&self) -> usize;
    fn seq_per_img(&self) -> usize;
    fn batch_size(&self) -> usize;
    fn split_len(&self, split: &str) -> usize;
    fn iterators(&self) -> BTreeMap<String, usize>;
    fn set_iterators(&mut self, iterators: BTreeMap<String, usize>);
    fn split_ix(&self) -> BTreeMap<String, Vec<usize>>;
    fn set_split_ix(&mut self, split_ix: BTreeMap<String, Vec<usize>>);
    fn get_vocab(&self) -> BTreeMap<String, String>;
}

/// Directory of per-image feature files with a fixed row width
pub struct FeatureDir {
    dir: PathBuf,
    width: usize,
}

impl FeatureDir {
    pub fn new<P: Into<PathBuf>>(dir: P, width: usize) -> Self {
        Self {
            dir: dir.into(),
            width,
        }
    }

    /// Returns the flat values and the number of rows
    pub fn read(&self, id: ImageId) -> Result<(Vec<f32>, usize)> {
        let path = self.dir.join(format!("{}.f32", id));
        let file = File::open(&path)
            .with_context(|| format!("Failed to open features {}", path.display()))?;
        let len = file.metadata()?.len() as usize;
        let row_bytes = 4 * self.width;
        anyhow::ensure!(
            len > 0 && len % row_bytes == 0,
            "Feature file {} has {} bytes, not a multiple of {} x f32",
            path.display(),
            len,
            self.width
        );
        let mmap = unsafe { Mmap::map(&file)? };
        let mut values = vec![0f32; len / 4];
        LittleEndian::read_f32_into(&mmap[..len], &mut values);
        Ok((values, len / row_bytes))
    }
}

#[derive(Debug, Clone)]
pub struct LoaderOptions {
    pub input_json: String,
    pub input_fc_dir: String,
    pub input_att_dir: Option<String>,
    pub input_box_dir: Option<String>,
    pub fc_feat_size: usize,
    pub att_feat_size: usize,
    pub batch_size: usize,
    pub seq_per_img: usize,
    pub train_only: bool,
    pub seed: u64,
}

impl LoaderOptions {
    /// Region features and boxes are only read for models that attend over them
    pub fn from_args(args: &TrainArgs) -> Self {
        let use_att = caption_core::if_use_att(&args.caption_model);
        Self {
            input_json: args.input_json.clone(),
            input_fc_dir: args.input_fc_dir.clone(),
            input_att_dir: use_att.then(|| args.input_att_dir.clone()),
            input_box_dir: (use_att && args.use_box).then(|| args.input_box_dir.clone()),
            fc_feat_size: args.fc_feat_size,
            att_feat_size: args.att_feat_size,
            batch_size: args.batch_size,
            seq_per_img: args.seq_per_img,
            train_only: args.train_only,
            seed: args.seed,
        }
    }
}

pub struct CaptionLoader {
    info: DatasetInfo,
    seq_length: usize,
    batch_size: usize,
    seq_per_img: usize,
    fc: FeatureDir,
    att: Option<FeatureDir>,
    boxes: Option<FeatureDir>,
    split_ix: BTreeMap<String, Vec<usize>>,
    iterators: BTreeMap<String, usize>,
    rng: StdRng,
}

/// Split an image belongs to; `restval` joins train unless `train_only`
fn assign_split(split: &str, train_only: bool) -> Option<&'static str> {
    match split {
        "train" => Some("train"),
        "val" => Some("val"),
        "test" => Some("test"),
        "restval" if !train_only => Some("train"),
        _ => None,
    }
}

impl CaptionLoader {
    pub fn new(opts: &LoaderOptions) -> Result<Self> {
        let info = DatasetInfo::load(&opts.input_json)?;
        Self::from_info(info, opts)
    }

    pub fn from_info(info: DatasetInfo, opts: &LoaderOptions) -> Result<Self> {
        anyhow::ensure!(opts.batch_size > 0, "batch_size must be positive");
        anyhow::ensure!(opts.seq_per_img > 0, "seq_per_img must be positive");
        anyhow::ensure!(!info.ix_to_word.is_empty(), "Dataset vocabulary is empty");

        let seq_length = info.seq_length.unwrap_or_else(|| {
            info.images
                .iter()
                .flat_map(|img| img.labels.iter().map(Vec::len))
                .max()
                .unwrap_or(0)
        });
        anyhow::ensure!(seq_length > 0, "Dataset has no encoded captions");

        let mut split_ix: BTreeMap<String, Vec<usize>> =
            SPLITS.iter().map(|s| (s.to_string(), Vec::new())).collect();
        for (ix, img) in info.images.iter().enumerate() {
            if let Some(split) = assign_split(&img.split, opts.train_only) {
                split_ix.entry(split.to_string()).or_default().push(ix);
            }
        }
        let iterators = split_ix.keys().map(|k| (k.clone(), 0)).collect();

        tracing::info!(
            "CaptionLoader: vocab {}, seq_length {}, images train/val/test = {}/{}/{}",
            info.ix_to_word.len(),
            seq_length,
            split_ix["train"].len(),
            split_ix["val"].len(),
            split_ix["test"].len()
        );

        Ok(Self {
            seq_length,
            batch_size: opts.batch_size,
            seq_per_img: opts.seq_per_img,
            fc: FeatureDir::new(&opts.input_fc_dir, opts.fc_feat_size),
            att: opts
                .input_att_dir
                .as_ref()
                .map(|d| FeatureDir::new(d, opts.att_feat_size)),
            boxes: opts.input_box_dir.as_ref().map(|d| FeatureDir::new(d, 4)),
            split_ix,
            iterators,
            rng: StdRng::seed_from_u64(opts.seed),
            info,
        })
    }

    /// Pick `seq_per_img` captions: with replacement when there are too few,
    /// otherwise a random contiguous block.
    fn pick_captions(&mut self, ix: usize) -> Result<Vec<Vec<u32>>> {
        let labels = &self.info.images[ix].labels;
        let n = labels.len();
        anyhow::ensure!(
            n > 0,
            "Image {} has no captions",
            self.info.images[ix].id
        );
        let spi = self.seq_per_img;
        if n < spi {
            Ok((0..spi)
                .map(|_| labels[self.rng.gen_range(0..n)].clone())
                .collect())
        } else {
            let start = self.rng.gen_range(0..=n - spi);
            Ok(labels[start..start + spi].to_vec())
        }
    }

    fn truncate(&self, caption: &[u32]) -> Vec<u32> {
        caption.iter().take(self.seq_length).copied().collect()
    }

    /// Stack variable-row features into `(count, max_rows, width)` plus a row mask
    fn pad_regions(
        regions: &[(Vec<f32>, usize)],
        width: usize,
        repeat: usize,
        device: &Device,
    ) -> Result<(Tensor, Option<Tensor>)> {
        let max_rows = regions.iter().map(|(_, r)| *r).max().unwrap_or(0);
        let uniform = regions.iter().all(|(_, r)| *r == max_rows);
        let count = regions.len() * repeat;
        let mut values = vec![0f32; count * max_rows * width];
        let mut mask = vec![0f32; count * max_rows];
        for (i, (feat, rows)) in regions.iter().enumerate() {
            for k in 0..repeat {
                let row = i * repeat + k;
                let base = row * max_rows * width;
                values[base..base + rows * width].copy_from_slice(feat);
                mask[row * max_rows..row * max_rows + rows].fill(1.0);
            }
        }
        let feats = Tensor::from_vec(values, (count, max_rows, width), device)?;
        let mask = if uniform {
            None
        } else {
            Some(Tensor::from_vec(mask, (count, max_rows), device)?)
        };
        Ok((feats, mask))
    }
}

impl BatchSource for CaptionLoader {
    fn get_batch(&mut self, split: &str, device: &Device) -> Result<Batch> {
        let max = self
            .split_ix
            .get(split)
            .with_context(|| format!("Unknown split '{}'", split))?
            .len();
        anyhow::ensure!(max > 0, "Split '{}' has no images", split);

        let spi = self.seq_per_img;
        let width = self.seq_length + 2;
        let mut wrapped = false;
        let mut fc = Vec::with_capacity(self.batch_size * spi * self.fc.width);
        let mut att_regions = Vec::new();
        let mut box_regions = Vec::new();
        let mut labels = vec![0u32; self.batch_size * spi * width];
        let mut masks = vec![0f32; self.batch_size * spi * width];
        let mut gts = Vec::with_capacity(self.batch_size);
        let mut infos = Vec::with_capacity(self.batch_size);

        for i in 0..self.batch_size {
            let ri = self.iterators.get(split).copied().unwrap_or(0);
            let ix = *self
                .split_ix
                .get(split)
                .and_then(|ixs| ixs.get(ri))
                .with_context(|| {
                    format!("Iterator {} is past the end of split '{}' ({} images)", ri, split, max)
                })?;
            let mut ri_next = ri + 1;
            if ri_next >= max {
                ri_next = 0;
                wrapped = true;
                if split == "train" {
                    if let Some(ixs) = self.split_ix.get_mut(split) {
                        ixs.shuffle(&mut self.rng);
                    }
                }
            }
            self.iterators.insert(split.to_string(), ri_next);

            let id = self.info.images[ix].id;
            let (fc_feat, _) = self.fc.read(id)?;
            for _ in 0..spi {
                fc.extend_from_slice(&fc_feat[..self.fc.width]);
            }
            if let Some(ref att) = self.att {
                att_regions.push(att.read(id)?);
            }
            if let Some(ref boxes) = self.boxes {
                box_regions.push(boxes.read(id)?);
            }

            for (k, caption) in self.pick_captions(ix)?.iter().enumerate() {
                let row = (i * spi + k) * width;
                let tokens = self.truncate(caption);
                labels[row + 1..row + 1 + tokens.len()].copy_from_slice(&tokens);
                let nonzeros = tokens.iter().filter(|t| **t > 0).count() + 2;
                masks[row..row + nonzeros.min(width)].fill(1.0);
            }

            let image = &self.info.images[ix];
            gts.push(image.labels.iter().map(|c| self.truncate(c)).collect());
            infos.push(ImageRef {
                ix,
                id: image.id,
                file_path: image.file_path.clone(),
            });
        }

        let rows = self.batch_size * spi;
        let (att_feats, att_masks) = match self.att {
            Some(ref att) => {
                let (feats, mask) = Self::pad_regions(&att_regions, att.width, spi, device)?;
                (Some(feats), mask)
            }
            None => (None, None),
        };
        let boxes = match self.boxes {
            Some(_) => Some(Self::pad_regions(&box_regions, 4, spi, device)?.0),
            None => None,
        };

        Ok(Batch {
            fc_feats: Tensor::from_vec(fc, (rows, self.fc.width), device)?,
            att_feats,
            att_masks,
            boxes,
            labels: Tensor::from_vec(labels, (rows, width), device)?,
            masks: Tensor::from_vec(masks, (rows, width), device)?,
            gts,
            infos,
            bounds: Bounds {
                it_pos_now: self.iterators[split],
                it_max: max,
                wrapped,
            },
        })
    }

    fn reset_iterator(&mut self, split: &str) {
        self.iterators.insert(split.to_string(), 0);
    }

    fn vocab_size(&self) -> usize {
        self.info.ix_to_word.len()
    }

    fn seq_length(&self) -> usize {
        self.seq_length
    }

    fn seq_per_img(&self) -> usize {
        self.seq_per_img
    }

    fn batch_size(&self) -> usize {
        self.batch_size
    }

    fn split_len(&self, split: &str) -> usize {
        self.split_ix.get(split).map_or(0, Vec::len)
    }

    fn iterators(&self) -> BTreeMap<String, usize> {
        self.iterators.clone()
    }

    fn set_iterators(&mut self, iterators: BTreeMap<String, usize>) {
        self.iterators = iterators;
    }

    fn split_ix(&self) -> BTreeMap<String, Vec<usize>> {
        self.split_ix.clone()
    }

    fn set_split_ix(&mut self, split_ix: BTreeMap<String, Vec<usize>>) {
        self.split_ix = split_ix;
    }

    fn get_vocab(&self) -> BTreeMap<String, String> {
        self.info.ix_to_word.clone()
    }
}
