use std::{f64::consts::PI, fmt::Display, path::PathBuf};

use anyhow::{bail, Context, Result};
use log::{info, warn};
use rand::{rngs::StdRng, seq::SliceRandom, Rng, SeedableRng};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::{
    checkpoint::Checkpoint,
    dataset::SceneDataset,
    labels::NUM_CLASSES,
    metrics::{ConfusionAccumulator, IouTable},
    model::{
        weighted_cross_entropy, BlockBatch, LinearSoftmaxModel, OptimizerKind, SegmentationModel,
        TrainableModel,
    },
    schema::{Channel, ChannelSchema},
    tiling::Block,
    weights::{LabelHistogram, LabelWeights},
};

pub const MIN_LEARNING_RATE: f32 = 1e-5;
pub const BEST_MODEL_FILE: &str = "best_model.bin";
pub const LATEST_MODEL_FILE: &str = "model.bin";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    pub batch_size: usize,
    pub epochs: usize,
    pub learning_rate: f32,
    pub optimizer: OptimizerKind,
    /// Weight decay of the Adam optimizer
    pub decay_rate: f32,
    /// The learning rate decays every `step_size` epochs
    pub step_size: usize,
    pub lr_decay: f32,
    /// Points drawn per epoch, as a multiple of all points of the training scenes
    pub sample_rate: f64,
    /// `model.bin` is written after every epoch that is a multiple of this
    pub checkpoint_every: usize,
    /// Lower bound for class probabilities when the plain label weights are infinite
    pub min_class_probability: f32,
    pub seed: u64,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            batch_size: 16,
            epochs: 32,
            learning_rate: 0.001,
            optimizer: OptimizerKind::Adam,
            decay_rate: 1e-4,
            step_size: 10,
            lr_decay: 0.7,
            sample_rate: 1.0,
            checkpoint_every: 5,
            min_class_probability: 1e-4,
            seed: 0,
        }
    }
}

impl TrainingConfig {
    pub fn learning_rate_for_epoch(&self, epoch: usize) -> f32 {
        let decay_steps = epoch / self.step_size.max(1);
        (self.learning_rate * self.lr_decay.powi(decay_steps as i32)).max(MIN_LEARNING_RATE)
    }
}

/// Loss and metrics of one pass over random blocks of the evaluation scenes
#[derive(Debug, Clone)]
pub struct EvaluationSummary {
    pub mean_loss: f32,
    pub metrics: ConfusionAccumulator,
    pub label_histogram: LabelHistogram,
}

#[derive(Debug, Clone)]
pub struct EpochSummary {
    pub epoch: usize,
    pub learning_rate: f32,
    pub mean_loss: f32,
    pub accuracy: f64,
    pub evaluation: Option<EvaluationSummary>,
}

impl Display for EpochSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Epoch {:>3}: lr {:.6}, training loss {:.4}, training accuracy {:.4}",
            self.epoch + 1,
            self.learning_rate,
            self.mean_loss,
            self.accuracy
        )?;
        if let Some(evaluation) = &self.evaluation {
            write!(
                f,
                ", eval loss {:.4}, eval accuracy {:.4}, eval mIoU {:.4}",
                evaluation.mean_loss,
                evaluation.metrics.overall_accuracy(),
                evaluation.metrics.mean_iou()
            )?;
        }
        Ok(())
    }
}

/// Rotates the local x and y channels of every point of `block` by `angle` radians around the z axis
pub fn rotate_about_z(block: &mut Block, schema: &ChannelSchema, angle: f64) -> Result<()> {
    let (x_channel, y_channel) = match (
        schema.index_of(Channel::LocalX),
        schema.index_of(Channel::LocalY),
    ) {
        (Some(x), Some(y)) => (x, y),
        _ => bail!("Channel schema {} has no local coordinates to rotate", schema),
    };
    let (sin, cos) = angle.sin_cos();
    let (sin, cos) = (sin as f32, cos as f32);
    for point in 0..block.len() {
        let values = block.point_mut(point);
        let (x, y) = (values[x_channel], values[y_channel]);
        values[x_channel] = x * cos - y * sin;
        values[y_channel] = x * sin + y * cos;
    }
    Ok(())
}

/// Draws one random block per scene index. Each block gets its own RNG seeded from `rng`, so the result only
/// depends on `rng` and not on the thread scheduling
fn draw_blocks<R: Rng + ?Sized>(
    dataset: &SceneDataset,
    scene_indices: &[usize],
    rotate: bool,
    rng: &mut R,
) -> Result<Vec<Block>> {
    let seeds = scene_indices.iter().map(|_| rng.gen()).collect::<Vec<u64>>();
    scene_indices
        .par_iter()
        .zip(seeds.par_iter())
        .map(|(scene_index, seed)| {
            let mut rng = StdRng::seed_from_u64(*seed);
            let mut block = dataset.training_block(*scene_index, &mut rng)?;
            if rotate {
                rotate_about_z(&mut block, dataset.schema(), rng.gen_range(0.0..2.0 * PI))?;
            }
            Ok(block)
        })
        .collect()
}

fn block_labels(blocks: &[Block]) -> Vec<u8> {
    blocks
        .iter()
        .flat_map(|block| block.labels.iter().copied())
        .collect()
}

/// Supervised training on random blocks of the training scenes, with an optional evaluation on random blocks of
/// held-out scenes after every epoch
pub struct Trainer<'a> {
    config: &'a TrainingConfig,
    train: &'a SceneDataset,
    eval: Option<&'a SceneDataset>,
    checkpoint_dir: PathBuf,
    loss_weights: LabelWeights,
}

impl<'a> Trainer<'a> {
    pub fn new(
        config: &'a TrainingConfig,
        train: &'a SceneDataset,
        eval: Option<&'a SceneDataset>,
        checkpoint_dir: PathBuf,
    ) -> Result<Self> {
        if config.batch_size == 0 {
            bail!("batch_size must be at least 1");
        }
        if let Some(eval) = eval {
            if eval.schema() != train.schema() {
                bail!(
                    "Training scenes have channels {}, but evaluation scenes have {}",
                    train.schema(),
                    eval.schema()
                );
            }
        }
        let loss_weights = if train.label_weights().has_degenerate() {
            warn!(
                "Some classes do not occur in the training scenes, flooring their probability at {} for the loss weights",
                config.min_class_probability
            );
            LabelWeights::from_histogram_floored(
                train.label_histogram(),
                config.min_class_probability,
            )
        } else {
            train.label_weights().clone()
        };
        Ok(Self {
            config,
            train,
            eval,
            checkpoint_dir,
            loss_weights,
        })
    }

    pub fn loss_weights(&self) -> &LabelWeights {
        &self.loss_weights
    }

    /// Model, first epoch and best mIoU to start with. Resumes from the best checkpoint if there is a usable one
    pub fn initial_state(&self) -> (LinearSoftmaxModel, usize, Option<f64>) {
        let path = self.checkpoint_dir.join(BEST_MODEL_FILE);
        match Checkpoint::try_resume(&path, self.train.schema()) {
            Some(checkpoint) => (checkpoint.model, checkpoint.epoch, checkpoint.class_avg_iou),
            None => {
                let mut rng = StdRng::seed_from_u64(self.config.seed);
                let model = LinearSoftmaxModel::new(
                    self.train.schema().len(),
                    NUM_CLASSES,
                    self.config.optimizer,
                    self.config.decay_rate,
                    &mut rng,
                );
                (model, 0, None)
            }
        }
    }

    fn save_checkpoint(
        &self,
        file_name: &str,
        epoch: usize,
        class_avg_iou: Option<f64>,
        model: &LinearSoftmaxModel,
    ) -> Result<()> {
        Checkpoint {
            epoch,
            class_avg_iou,
            schema: self.train.schema().clone(),
            model: model.clone(),
        }
        .save(self.checkpoint_dir.join(file_name))
    }

    /// Trains from `start_epoch` up to the configured number of epochs and returns one summary per epoch.
    /// Checkpoints store the number of completed epochs
    pub fn run(
        &self,
        model: &mut LinearSoftmaxModel,
        start_epoch: usize,
        mut best_iou: Option<f64>,
    ) -> Result<Vec<EpochSummary>> {
        let mut summaries = vec![];
        for epoch in start_epoch..self.config.epochs {
            info!("**** Epoch {} ({}/{}) ****", epoch + 1, epoch + 1, self.config.epochs);
            let mut rng = StdRng::seed_from_u64(self.config.seed.wrapping_add(epoch as u64 + 1));
            let (mean_loss, accuracy) = self
                .train_epoch(model, epoch, &mut rng)
                .with_context(|| format!("Training failed in epoch {}", epoch + 1))?;
            info!("Training mean loss: {:.6}", mean_loss);
            info!("Training accuracy: {:.6}", accuracy);

            if epoch % self.config.checkpoint_every.max(1) == 0 {
                self.save_checkpoint(LATEST_MODEL_FILE, epoch + 1, best_iou, model)?;
            }

            let evaluation = match self.eval {
                Some(eval) => {
                    let summary = self.evaluate(&*model, eval, &mut rng)?;
                    let mean_iou = summary.metrics.mean_iou();
                    info!("---- Epoch {:03} evaluation ----", epoch + 1);
                    info!("eval mean loss: {:.6}", summary.mean_loss);
                    let label_distribution = summary.label_histogram.probabilities();
                    info!(
                        "\n{}",
                        IouTable::new(&summary.metrics).with_weights(&label_distribution)
                    );
                    if best_iou.map(|best| mean_iou >= best).unwrap_or(true) {
                        best_iou = Some(mean_iou);
                        self.save_checkpoint(BEST_MODEL_FILE, epoch + 1, best_iou, model)?;
                    }
                    info!("Best mIoU: {:.6}", best_iou.unwrap_or(0.0));
                    Some(summary)
                }
                None => None,
            };

            let summary = EpochSummary {
                epoch,
                learning_rate: self.config.learning_rate_for_epoch(epoch),
                mean_loss,
                accuracy,
                evaluation,
            };
            info!("{}", summary);
            summaries.push(summary);
        }

        if self.eval.is_none() {
            self.save_checkpoint(BEST_MODEL_FILE, self.config.epochs, None, model)?;
        }
        Ok(summaries)
    }

    /// One pass over the epoch's sample schedule. Returns mean loss and point accuracy. The last partial batch
    /// is dropped
    pub fn train_epoch<M: TrainableModel, R: Rng + ?Sized>(
        &self,
        model: &mut M,
        epoch: usize,
        rng: &mut R,
    ) -> Result<(f32, f64)> {
        let learning_rate = self.config.learning_rate_for_epoch(epoch);
        info!("Learning rate: {:.6}", learning_rate);

        let mut schedule = self.train.sample_schedule(self.config.sample_rate);
        schedule.shuffle(rng);
        let num_batches = schedule.len() / self.config.batch_size;
        if num_batches == 0 {
            bail!(
                "Sample schedule of {} blocks is shorter than one batch of {} blocks",
                schedule.len(),
                self.config.batch_size
            );
        }

        let mut loss_sum = 0.0_f64;
        let mut correct = 0_usize;
        let mut seen = 0_usize;
        for scene_indices in schedule.chunks_exact(self.config.batch_size) {
            let blocks = draw_blocks(self.train, scene_indices, true, rng)?;
            let batch = BlockBatch::from_blocks(&blocks, self.config.batch_size)?;
            let labels = block_labels(&blocks);

            let predictions = model.predict(&batch)?;
            for (block_index, block) in blocks.iter().enumerate() {
                correct += predictions
                    .argmax(block_index)
                    .iter()
                    .zip(block.labels.iter())
                    .filter(|(p, l)| p == l)
                    .count();
                seen += block.len();
            }
            let loss = model.train_step(
                &batch,
                &labels,
                self.loss_weights.as_slice(),
                learning_rate,
            )?;
            loss_sum += loss as f64;
        }

        Ok((
            (loss_sum / num_batches as f64) as f32,
            correct as f64 / seen.max(1) as f64,
        ))
    }

    /// Loss and confusion counts of `model` on random blocks of `dataset`, drawn by the dataset's sample schedule
    pub fn evaluate<M: SegmentationModel, R: Rng + ?Sized>(
        &self,
        model: &M,
        dataset: &SceneDataset,
        rng: &mut R,
    ) -> Result<EvaluationSummary> {
        let schedule = dataset.sample_schedule(self.config.sample_rate);
        if schedule.is_empty() {
            bail!("Evaluation scenes are too small for a single block");
        }
        let mut metrics = ConfusionAccumulator::new(NUM_CLASSES);
        let mut label_histogram = LabelHistogram::new(NUM_CLASSES);
        let mut loss_sum = 0.0_f64;
        let mut num_batches = 0_usize;
        for scene_indices in schedule.chunks(self.config.batch_size) {
            let blocks = draw_blocks(dataset, scene_indices, false, rng)?;
            let batch = BlockBatch::from_blocks(&blocks, self.config.batch_size)?;
            let labels = block_labels(&blocks);
            let predictions = model.predict(&batch)?;
            loss_sum +=
                weighted_cross_entropy(&predictions, &labels, self.loss_weights.as_slice())? as f64;
            num_batches += 1;
            for (block_index, block) in blocks.iter().enumerate() {
                metrics.accumulate(&predictions.argmax(block_index), &block.labels)?;
            }
            label_histogram.add_labels(&labels)?;
        }
        Ok(EvaluationSummary {
            mean_loss: (loss_sum / num_batches as f64) as f32,
            metrics,
            label_histogram,
        })
    }
}
